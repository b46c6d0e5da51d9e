//! Error types for the server core and worker pool.

use std::io;
use thiserror::Error;

/// Fatal errors from the server lifecycle calls.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server already started")]
    AlreadyStarted,

    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors from submitting work to the pool.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// Every worker is busy and the queue is full.
    #[error("worker pool saturated ({workers} workers, {queued} queued)")]
    Saturated { workers: usize, queued: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_names_address() {
        let err = ServerError::Bind {
            addr: "0.0.0.0:8080".to_string(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        let message = err.to_string();
        assert!(message.contains("0.0.0.0:8080"));
        assert!(message.contains("in use"));
    }
}
