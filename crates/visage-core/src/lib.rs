pub mod config;
pub mod error;
pub mod types;

pub use config::VisageConfig;
pub use error::{Result, VisageError};
pub use types::*;
