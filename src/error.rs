use thiserror::Error;

/// Failures of the file-backed IPC substrate.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("io error on {doc}: {source}")]
    Io {
        doc: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed payload in {doc}")]
    Malformed { doc: String },
    #[error("gave up on {doc} after {attempts} attempts")]
    Exhausted { doc: String, attempts: u32 },
}

/// Failures talking to a foreign-chain or host-ledger node.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Connection resets, timeouts, DNS failures. Recovered locally by retry.
    #[error("transport: {0}")]
    Transport(String),
    /// The node answered but the payload does not match the expected shape.
    /// Deterministic, so retrying the same node does not help.
    #[error("schema mismatch: {0}")]
    Schema(String),
}

impl From<reqwest::Error> for RpcError {
    fn from(err: reqwest::Error) -> Self {
        RpcError::Transport(err.to_string())
    }
}

impl RpcError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcError::Transport(_))
    }
}
