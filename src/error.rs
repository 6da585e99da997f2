use thiserror::Error;

use crate::pairing::PairingError;
use crate::protocol::ServerMessage;
use crate::translator::TranslatorError;

/// Everything a single inbound frame can fail with. Each variant maps to
/// exactly one `error` reply to the sender; none of them change session
/// state or close the transport.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid message: {0}")]
    Protocol(String),
    #[error("Invalid authentication token")]
    Auth,
    #[error("{0}")]
    RoleViolation(&'static str),
    #[error(transparent)]
    Pairing(#[from] PairingError),
    #[error("Failed to process command")]
    Collaborator(#[source] TranslatorError),
    #[error("Internal server error")]
    Internal,
}

impl RelayError {
    pub fn reply(&self) -> ServerMessage {
        ServerMessage::Error {
            message: self.to_string(),
        }
    }
}
