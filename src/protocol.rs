use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which side of a pairing a device is on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Executes remote commands and originates the media stream.
    Controller,
    /// Issues prompts/commands and consumes the relayed stream.
    Viewer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Controller => write!(f, "controller"),
            Role::Viewer => write!(f, "viewer"),
        }
    }
}

/// Messages sent from a device to the relay.
///
/// The `offer`/`answer`/`ice-candidate`/`command-result` kinds are relayed to
/// the partner verbatim; their payloads are captured with `flatten` so every
/// field the sender included survives the round trip unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Fresh registration; the relay mints an identity and a token.
    Register { mode: Role },
    /// Reconnect with a previously issued token.
    #[serde(rename_all = "camelCase")]
    Authenticate { token: String, device_id: String },
    /// Controller requests a one-time pairing code.
    GeneratePairCode,
    /// Viewer redeems a pairing code.
    EnterPairCode { code: String },
    /// Free-text instruction; translated to a command before relay.
    Prompt { prompt: String },
    /// Pre-structured command, relayed without translation.
    Command { command: serde_json::Value },
    /// WebRTC session description from the controller.
    Offer {
        #[serde(flatten)]
        payload: serde_json::Value,
    },
    /// WebRTC session description from the viewer.
    Answer {
        #[serde(flatten)]
        payload: serde_json::Value,
    },
    /// ICE candidate from either side.
    IceCandidate {
        #[serde(flatten)]
        payload: serde_json::Value,
    },
    /// Outcome of an executed command, relayed back to the viewer. Captured
    /// whole so an explicit `"error": null` survives the relay.
    CommandResult {
        #[serde(flatten)]
        payload: serde_json::Value,
    },
}

/// Messages sent from the relay to a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Registration confirmation; the client persists both fields.
    #[serde(rename_all = "camelCase")]
    Registered {
        device_id: String,
        token: String,
        mode: Role,
    },
    /// Authentication outcome.
    Authenticated { success: bool },
    /// A pairing code and its remaining lifetime in seconds.
    #[serde(rename_all = "camelCase")]
    PairCodeGenerated { code: String, expires_in: u64 },
    /// Pairing established; `with` names the partner's role.
    #[serde(rename_all = "camelCase")]
    Paired { with: Role, device_id: String },
    /// Tells the controller to begin streaming. Only the controller
    /// originates a media offer.
    StartStream,
    /// The partner's transport closed; the pairing is gone.
    PeerDisconnected,
    /// One error reply per failed request.
    Error { message: String },
    /// Relayed command (translated prompt or verbatim forward).
    Command { command: serde_json::Value },
    Offer {
        #[serde(flatten)]
        payload: serde_json::Value,
    },
    Answer {
        #[serde(flatten)]
        payload: serde_json::Value,
    },
    IceCandidate {
        #[serde(flatten)]
        payload: serde_json::Value,
    },
    CommandResult {
        #[serde(flatten)]
        payload: serde_json::Value,
    },
}

/// Every message kind a client may send. Frames with a `type` outside this
/// list are logged and ignored rather than answered with an error, so newer
/// clients can speak to older relays.
pub const CLIENT_KINDS: &[&str] = &[
    "register",
    "authenticate",
    "generate-pair-code",
    "enter-pair-code",
    "prompt",
    "command",
    "offer",
    "answer",
    "ice-candidate",
    "command-result",
];

pub fn is_client_kind(kind: &str) -> bool {
    CLIENT_KINDS.contains(&kind)
}

/// Mint a fresh opaque device identity.
pub fn generate_device_id() -> String {
    format!("device-{}", Uuid::new_v4())
}
