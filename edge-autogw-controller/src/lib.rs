pub mod client;
pub mod dispatcher;
mod error;
pub mod label;
pub mod manager;
pub mod metrics;
pub mod resources;
mod runtime;

pub use error::{Error, Result};
pub use runtime::start_autogw_controller;
