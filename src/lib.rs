//! runforge: session orchestration for containerized system builds.
//!
//! A user submits a declarative system definition (container image,
//! build/run commands, typed parameter schema) together with a concrete
//! configuration; runforge reconciles the two into a resolved system,
//! drives it through a build/run lifecycle on a pluggable compute backend
//! and makes the declared result artifacts inspectable.

pub mod compute;
pub mod config;
pub mod error;
pub mod formats;
pub mod params;
pub mod server;
pub mod session;
pub mod source;
pub mod system;

// Re-exports for convenience
pub use compute::{BackendConnector, BackendKind, ComputeBackend, ComputeError};
pub use error::{SessionError, SessionResult};
pub use formats::{ParameterGroup, State};
pub use session::{ExecuteMode, ExecuteOutcome, Session, SessionStore};
pub use system::{Command, System};
