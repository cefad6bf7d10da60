//! Error types for the memcache client.

/// Result type for all client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client.
///
/// Cache misses and `NOT_STORED` rejections are normal outcomes and are
/// reported through return values (`Option` / `bool`), never as errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Invalid or missing servers/weights, or the pool is not initialized.
    #[error("configuration error: {0}")]
    Config(String),
    /// The host is inside its dead-host backoff window; no connect was
    /// attempted.
    #[error("host {0} is marked dead")]
    DeadHost(String),
    /// The connect did not complete within the configured deadline.
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),
    /// Read/write/close failure on a live socket.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Unexpected response line from the server.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Serialization, deserialization, or decompression failure.
    #[error("codec error: {0}")]
    Codec(String),
}

impl ClientError {
    /// Returns true if this error indicates a host in backoff.
    pub fn is_dead_host(&self) -> bool {
        matches!(self, ClientError::DeadHost(_))
    }

    /// Returns true if this error destroyed the connection it occurred on.
    pub fn is_io(&self) -> bool {
        matches!(self, ClientError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(
            format!("{}", ClientError::DeadHost("10.0.0.1:11211".into())),
            "host 10.0.0.1:11211 is marked dead"
        );
        assert_eq!(
            format!("{}", ClientError::Config("no servers".into())),
            "configuration error: no servers"
        );
    }

    #[test]
    fn io_conversion() {
        let err: ClientError =
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "closed").into();
        assert!(err.is_io());
        assert!(!err.is_dead_host());
    }
}
