pub mod controller;
pub mod handlers;
pub mod playbook;
pub mod routes;
pub mod state_machine;
pub mod store;

pub use controller::{RangeController, RangeError};
