//! Configuration for provisioning sessions.
//!
//! Everything a session needs (credentials, prompt literals, timeouts,
//! runtime invocation) lives here and is passed explicitly into the
//! [`Provisioner`](crate::session::Provisioner).

pub mod credentials;
pub mod loader;
pub mod types;

pub use credentials::SecureString;
pub use loader::ConfigError;
pub use types::{Config, Defaults, FeatureConfig, RuntimeConfig, SessionConfig};
