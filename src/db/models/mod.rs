//! Persisted models split into domain-specific modules.

pub mod deployment;
pub mod notification;
pub mod rollback;
pub mod service;

pub use deployment::*;
pub use notification::*;
pub use rollback::*;
pub use service::*;
