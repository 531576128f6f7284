pub mod config;
pub mod domain;
pub mod error;
pub mod host;
pub mod lookup;

pub use error::{Error, Result};
