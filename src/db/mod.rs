pub mod models;
pub mod ranges;
pub mod users;
