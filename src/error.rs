//! Error handling for unitd.
use thiserror::Error;

use crate::path::ServicePath;

/// Defines all possible errors that can occur in the service manager.
#[derive(Debug, Error)]
pub enum ServiceManagerError {
    /// I/O error reading catalogs or servicing sockets.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing YAML catalog contents.
    #[error("Invalid YAML format: {0}")]
    CatalogParseError(#[from] serde_yaml::Error),

    /// Error forking a service method.
    #[error("Failed to fork method for '{path}': {source}")]
    SpawnError {
        /// The unit whose method could not be forked.
        path: ServicePath,
        /// The underlying error that occurred.
        #[source]
        source: SpawnError,
    },

    /// Error raised by the dependency graph.
    #[error("Graph error: {0}")]
    GraphError(#[from] GraphError),

    /// Error raised by the control channel.
    #[error("Control channel error: {0}")]
    ControlError(#[from] ControlError),

    /// Error raised by a raw system call.
    #[error("System call failed: {0}")]
    ErrNo(#[from] nix::errno::Errno),

    /// A note arrived for a path no component recognizes.
    #[error("No vertex or unit for path '{0}'")]
    UnknownPath(ServicePath),

    /// A catalog entry referenced a path that does not parse.
    #[error("Invalid service path '{0}' in catalog")]
    InvalidCatalogPath(String),
}

/// Error type for method forking.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The OS refused to fork.
    #[error("fork failed: {0}")]
    ForkFailed(nix::errno::Errno),

    /// The handshake pipe could not be created.
    #[error("handshake pipe failed: {0}")]
    PipeFailed(nix::errno::Errno),

    /// The parent could not release the child after enrollment.
    #[error("failed to release child {pid}: {errno}")]
    ReleaseFailed {
        /// PID of the held child.
        pid: u32,
        /// The underlying errno.
        errno: nix::errno::Errno,
    },

    /// The unit has no command for the requested method.
    #[error("no command defined for method '{0}'")]
    NoCommand(String),
}

/// Error type for dependency graph operations.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Inserting the edge would create a dependency cycle.
    #[error("cyclical dependency: '{owner}' -> '{target}'")]
    CyclicalDependency {
        /// The vertex that owns the rejected edge.
        owner: ServicePath,
        /// The prospective edge target.
        target: ServicePath,
    },

    /// A path was referenced that the graph does not contain.
    #[error("unknown vertex '{0}'")]
    UnknownVertex(ServicePath),

    /// The repository has no record for the path.
    #[error("no repository record for '{0}'")]
    NotInRepository(ServicePath),
}

/// Errors raised by the control channel helpers.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Control socket I/O error.
    #[error("control socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Error serializing or deserializing control messages.
    #[error("failed to serialise control message: {0}")]
    Serde(#[from] serde_json::Error),

    /// A wire note carried an unknown kind or sub-type.
    #[error("malformed note envelope: {0}")]
    BadEnvelope(String),

    /// Supervisor reported an error.
    #[error("supervisor reported error: {0}")]
    Server(String),

    /// Control socket not available or supervisor not running.
    #[error("control socket not available")]
    NotAvailable,
}
