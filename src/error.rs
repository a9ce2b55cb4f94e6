use thiserror::Error;

/// Kinds of error a connection handler can hit while servicing one request.
///
/// These never carry a handler across a connection close themselves --
/// callers decide, per variant, whether the error becomes a wire-level
/// reply (protocol/resource/authorization errors) or a silent handler
/// termination (transport errors).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("malformed command: {0}")]
    Malformed(String),

    #[error("unknown file id: {0}")]
    UnknownFile(String),

    #[error("invalid token")]
    InvalidToken,

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl ProtocolError {
    /// The exact wire text this error becomes, for errors that are
    /// reported back to the peer rather than silently swallowed.
    pub fn as_wire_line(&self) -> Option<String> {
        match self {
            ProtocolError::UnknownCommand(_) => Some("UNKNOWN_COMMAND".to_string()),
            ProtocolError::Malformed(msg) => Some(format!("ERROR: {msg}")),
            ProtocolError::UnknownFile(id) => Some(format!("ERROR: unknown file id {id}")),
            ProtocolError::InvalidToken => Some("INVALID_TOKEN".to_string()),
            ProtocolError::Transport(_) => None,
        }
    }
}
