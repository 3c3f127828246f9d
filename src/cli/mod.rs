pub mod backend;
pub mod templates;
