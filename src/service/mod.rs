//! Service layer module

pub mod cascade;
pub mod types;

pub use cascade::FaceCascade;
pub use types::*;
