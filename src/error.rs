//! Error taxonomy shared by all controller components.

/// Errors reported by the ftrace control plane and decoder.
///
/// Every public operation either fully succeeds or fails with one of these;
/// no operation partially succeeds. Messages carry the offending instance,
/// event or probe name so the caller can act on them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed name, expression or probe argument string.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Unknown instance, system, event or probe name.
    #[error("not found: {0}")]
    NotFound(String),
    /// Name collision on instance create or probe register.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// The tracefs mount is not accessible to this process.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Tracefs provider failure.
    #[error("tracefs I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The control interface took the request but the kernel refused it,
    /// e.g. a probe target symbol that does not resolve.
    #[error("rejected by kernel: {0}")]
    RejectedByKernel(String),
    /// Filter expression references an unknown field or has bad syntax.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    /// Child process creation failed.
    #[error("failed to spawn process: {0}")]
    Spawn(String),
    /// Malformed kernel event format descriptor.
    #[error("malformed event format: {0}")]
    Format(String),
}

pub type Result<T> = std::result::Result<T, Error>;
