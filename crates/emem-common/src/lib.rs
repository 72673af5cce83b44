#![doc = "Common types shared across the EmemLink workspace."]

pub mod config;
pub mod error;
pub mod metrics;

pub use config::*;
pub use error::*;
pub use metrics::*;
