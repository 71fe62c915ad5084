//! Face Analytics Cascade Library

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod service;
pub mod utils;

pub use config::Config;
pub use error::{BackendError, CascadeError};
pub use service::FaceCascade;
