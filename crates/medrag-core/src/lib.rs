//! Shared types, configuration and error taxonomy for the medrag workspace.

pub mod config;
pub mod error;
pub mod types;

pub use config::MedragConfig;
pub use error::{CollaboratorError, MedragError, Result};
pub use types::*;
