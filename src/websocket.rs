//! WebSocket session router: registration, authentication, pairing, and
//! verbatim relay of command/signaling payloads between paired sessions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::RelayError;
use crate::pairing::{PairingDirectory, PairingError};
use crate::protocol::{self, ClientMessage, Role, ServerMessage};
use crate::registry::{ConnectionRegistry, Outbound, Session};
use crate::token::TokenService;
use crate::translator::TranslatorClient;

/// Shared state for all relay connections.
#[derive(Clone)]
pub struct RelayState {
    /// Every open transport, registered or not. The liveness monitor probes
    /// this map; the registry below only holds identified devices.
    connections: Arc<DashMap<u64, Arc<Session>>>,
    registry: Arc<ConnectionRegistry>,
    pairing: Arc<PairingDirectory>,
    tokens: TokenService,
    translator: TranslatorClient,
    next_conn_id: Arc<AtomicU64>,
    heartbeat_interval: Duration,
    sweep_interval: Duration,
}

impl RelayState {
    pub fn new(config: &Config) -> Self {
        let state = Self {
            connections: Arc::new(DashMap::new()),
            registry: Arc::new(ConnectionRegistry::new()),
            pairing: Arc::new(PairingDirectory::new(Duration::from_secs(
                config.pair_code_ttl_seconds,
            ))),
            tokens: TokenService::new(config.secret.as_bytes(), config.token_ttl_seconds),
            translator: TranslatorClient::new(config.translator_url.clone()),
            next_conn_id: Arc::new(AtomicU64::new(1)),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_seconds),
            sweep_interval: Duration::from_secs(config.pair_sweep_interval_seconds),
        };

        let monitor = state.clone();
        tokio::spawn(async move {
            monitor.monitor_heartbeats().await;
        });

        let sweeper = state.clone();
        tokio::spawn(async move {
            sweeper.sweep_pair_codes().await;
        });

        state
    }

    /// Probe every open transport on a fixed period. A transport that also
    /// missed the previous probe is forcibly closed.
    async fn monitor_heartbeats(self) {
        let mut interval = tokio::time::interval(self.heartbeat_interval);
        loop {
            interval.tick().await;

            // Collect first; cleanup must not run under a map guard.
            let mut stale = Vec::new();
            for entry in self.connections.iter() {
                let session = entry.value();
                if session.probe() {
                    session.ping();
                } else {
                    stale.push((*entry.key(), session.clone()));
                }
            }

            for (conn_id, session) in stale {
                warn!(conn_id, "closing connection after two missed probes");
                session.shutdown();
                disconnect(&self, conn_id).await;
            }
        }
    }

    /// Expire pairing codes nobody redeemed, independent of consumption.
    async fn sweep_pair_codes(self) {
        let mut interval = tokio::time::interval(self.sweep_interval);
        loop {
            interval.tick().await;
            let removed = self.pairing.sweep(Instant::now());
            if removed > 0 {
                debug!(removed, "swept expired pairing codes");
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: &'static str,
    connections: usize,
    registered: usize,
}

async fn health_check(State(state): State<RelayState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        connections: state.connections.len(),
        registered: state.registry.len(),
    })
}

/// Build the relay's HTTP surface: a health endpoint and the WS upgrade.
pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let conn_id = state.next_conn_id.fetch_add(1, Ordering::Relaxed);
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let session = Session::new(conn_id, tx);
    state.connections.insert(conn_id, session.clone());
    debug!(conn_id, "websocket connected");

    // Forward queued frames to the transport until it closes.
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let message = match frame {
                Outbound::Message(msg) => match serde_json::to_string(&msg) {
                    Ok(json) => Message::Text(json),
                    Err(err) => {
                        error!(conn_id, error = %err, "failed to encode outbound message");
                        continue;
                    }
                },
                Outbound::Ping => Message::Ping(Vec::new()),
                Outbound::Shutdown => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
        debug!(conn_id, "outbound forwarder ended");
    });

    while let Some(frame) = receiver.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                warn!(conn_id, error = %err, "websocket transport error");
                break;
            }
        };

        match message {
            Message::Text(text) => dispatch_frame(&state, &session, &text).await,
            Message::Pong(_) => session.mark_alive(),
            Message::Close(_) => break,
            // Pings are answered by the transport layer.
            _ => {}
        }
    }

    disconnect(&state, conn_id).await;
}

/// Parse one inbound frame and run it through the state machine.
///
/// Unknown `type` values are logged and ignored. A malformed envelope or a
/// missing field for a known kind gets exactly one error reply; the
/// transport stays open either way.
async fn dispatch_frame(state: &RelayState, session: &Arc<Session>, text: &str) {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            warn!(conn_id = session.conn_id, error = %err, "unparseable frame");
            session.send(RelayError::Protocol("frame is not valid JSON".into()).reply());
            return;
        }
    };

    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        session.send(RelayError::Protocol("missing type field".into()).reply());
        return;
    };
    if !protocol::is_client_kind(kind) {
        debug!(conn_id = session.conn_id, kind, "ignoring unknown message type");
        return;
    }

    let kind = kind.to_string();
    let message = match serde_json::from_value::<ClientMessage>(value) {
        Ok(message) => message,
        Err(err) => {
            session.send(RelayError::Protocol(format!("malformed {kind} message: {err}")).reply());
            return;
        }
    };

    if let Err(err) = handle_client_message(state, session, message).await {
        debug!(conn_id = session.conn_id, kind = %kind, error = %err, "request failed");
        session.send(err.reply());
    }
}

async fn handle_client_message(
    state: &RelayState,
    session: &Arc<Session>,
    message: ClientMessage,
) -> Result<(), RelayError> {
    match message {
        ClientMessage::Register { mode } => {
            {
                let s = session.state.read().await;
                if s.role.is_some() {
                    return Err(RelayError::RoleViolation("Already registered"));
                }
            }

            let device_id = state.registry.register(session.clone());
            let token = match state.tokens.issue(&device_id) {
                Ok(token) => token,
                Err(err) => {
                    error!(error = %err, "failed to issue credential");
                    state.registry.remove(&device_id);
                    return Err(RelayError::Internal);
                }
            };

            {
                let mut s = session.state.write().await;
                s.device_id = Some(device_id.clone());
                s.role = Some(mode);
            }

            info!(conn_id = session.conn_id, device_id = %device_id, mode = %mode, "registered device");
            session.send(ServerMessage::Registered {
                device_id,
                token,
                mode,
            });
        }

        ClientMessage::Authenticate { token, device_id } => {
            if !state.tokens.verify(&token, &device_id) {
                return Err(RelayError::Auth);
            }

            // Reconnect path: restore role and partner from whatever record
            // this identity had before.
            if let Some(existing) = state.registry.lookup(&device_id) {
                if !Arc::ptr_eq(&existing, session) {
                    let (role, paired_with) = {
                        let e = existing.state.read().await;
                        (e.role, e.paired_with.clone())
                    };
                    let mut s = session.state.write().await;
                    s.role = s.role.or(role);
                    s.paired_with = paired_with;
                }
            }
            session.state.write().await.device_id = Some(device_id.clone());
            state.registry.restore(&device_id, session.clone());

            info!(conn_id = session.conn_id, device_id = %device_id, "device authenticated");
            session.send(ServerMessage::Authenticated { success: true });
        }

        ClientMessage::GeneratePairCode => {
            let (device_id, previous) = {
                let s = session.state.read().await;
                let device_id = match (s.role, &s.device_id) {
                    (Some(Role::Controller), Some(id)) => id.clone(),
                    _ => {
                        return Err(RelayError::RoleViolation(
                            "Only controllers can generate pair codes",
                        ))
                    }
                };
                if s.paired_with.is_some() {
                    return Err(RelayError::RoleViolation("Already paired with a device"));
                }
                (device_id, s.pair_code.clone())
            };

            // A new code supersedes any unconsumed one.
            if let Some(code) = previous {
                state.pairing.remove(&code);
            }

            let code = state.pairing.create(&device_id, Instant::now())?;
            session.state.write().await.pair_code = Some(code.clone());

            info!(device_id = %device_id, code = %code, "generated pair code");
            session.send(ServerMessage::PairCodeGenerated {
                code,
                expires_in: state.pairing.ttl_seconds(),
            });
        }

        ClientMessage::EnterPairCode { code } => {
            let viewer_id = {
                let s = session.state.read().await;
                let viewer_id = match (s.role, &s.device_id) {
                    (Some(Role::Viewer), Some(id)) => id.clone(),
                    _ => {
                        return Err(RelayError::RoleViolation(
                            "Only viewers can enter pair codes",
                        ))
                    }
                };
                if s.paired_with.is_some() {
                    return Err(RelayError::RoleViolation("Already paired with a device"));
                }
                viewer_id
            };

            let controller_id = state
                .pairing
                .consume(&code, Instant::now())
                .ok_or(PairingError::InvalidCode)?;
            let controller = state
                .registry
                .lookup(&controller_id)
                .filter(|c| c.is_open())
                .ok_or(PairingError::ControllerUnavailable)?;

            session.state.write().await.paired_with = Some(controller_id.clone());
            {
                let mut c = controller.state.write().await;
                c.paired_with = Some(viewer_id.clone());
                c.pair_code = None;
            }

            session.send(ServerMessage::Paired {
                with: Role::Controller,
                device_id: controller_id.clone(),
            });
            controller.send(ServerMessage::Paired {
                with: Role::Viewer,
                device_id: viewer_id.clone(),
            });
            // Only the controller originates a media offer.
            controller.send(ServerMessage::StartStream);

            info!(viewer = %viewer_id, controller = %controller_id, "paired devices");
        }

        ClientMessage::Prompt { prompt } => {
            let partner_id = {
                let s = session.state.read().await;
                match (s.role, &s.paired_with) {
                    (Some(Role::Viewer), Some(partner)) => partner.clone(),
                    _ => {
                        return Err(RelayError::RoleViolation("Not connected to a controller"))
                    }
                }
            };

            // Awaited inside this session's own task, so other sessions keep
            // being dispatched while the collaborator call is in flight.
            let command = state
                .translator
                .translate(&prompt)
                .await
                .map_err(RelayError::Collaborator)?;

            match state.registry.lookup(&partner_id) {
                Some(partner) if partner.is_open() => {
                    partner.send(ServerMessage::Command { command });
                    debug!(conn_id = session.conn_id, partner = %partner_id, "forwarded translated command");
                }
                _ => {
                    // Partner left while the translation was in flight.
                    debug!(partner = %partner_id, "dropping translated command for absent partner");
                }
            }
        }

        ClientMessage::Command { command } => {
            relay_to_partner(state, session, ServerMessage::Command { command }).await?;
        }

        ClientMessage::Offer { payload } => {
            relay_to_partner(state, session, ServerMessage::Offer { payload }).await?;
        }

        ClientMessage::Answer { payload } => {
            relay_to_partner(state, session, ServerMessage::Answer { payload }).await?;
        }

        ClientMessage::IceCandidate { payload } => {
            relay_to_partner(state, session, ServerMessage::IceCandidate { payload }).await?;
        }

        ClientMessage::CommandResult { payload } => {
            relay_to_partner(state, session, ServerMessage::CommandResult { payload }).await?;
        }
    }

    Ok(())
}

/// Forward a message to the sender's partner verbatim. Without a live
/// partner the message is dropped and the sender told, never queued.
async fn relay_to_partner(
    state: &RelayState,
    session: &Arc<Session>,
    message: ServerMessage,
) -> Result<(), RelayError> {
    let partner_id = session
        .state
        .read()
        .await
        .paired_with
        .clone()
        .ok_or(PairingError::NotPaired)?;
    let partner = state
        .registry
        .lookup(&partner_id)
        .filter(|p| p.is_open())
        .ok_or(PairingError::NotPaired)?;
    partner.send(message);
    Ok(())
}

/// Tear down one session: notify and unlink the partner, free any owned
/// pairing code, drop the registry entry. Keyed on removal from the
/// connection table, so it runs at most once per session no matter whether
/// the trigger was a probe timeout, a transport error, or a peer close.
async fn disconnect(state: &RelayState, conn_id: u64) {
    let Some((_, session)) = state.connections.remove(&conn_id) else {
        return;
    };

    let (device_id, partner_id, pair_code) = {
        let s = session.state.read().await;
        (s.device_id.clone(), s.paired_with.clone(), s.pair_code.clone())
    };

    if let Some(code) = pair_code {
        state.pairing.remove(&code);
    }

    let Some(device_id) = device_id else {
        debug!(conn_id, "unregistered connection closed");
        return;
    };

    if let Some(partner_id) = partner_id {
        if let Some(partner) = state.registry.lookup(&partner_id) {
            partner.state.write().await.paired_with = None;
            partner.send(ServerMessage::PeerDisconnected);
        }
    }

    // A reconnect may already have replaced this registration.
    state.registry.remove_if_same(&device_id, &session);
    info!(conn_id, device_id = %device_id, "client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn test_state() -> RelayState {
        RelayState::new(&Config::default())
    }

    fn connect(state: &RelayState) -> (Arc<Session>, UnboundedReceiver<Outbound>) {
        let conn_id = state.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new(conn_id, tx);
        state.connections.insert(conn_id, session.clone());
        (session, rx)
    }

    fn next_message(rx: &mut UnboundedReceiver<Outbound>) -> ServerMessage {
        match rx.try_recv().expect("expected a queued frame") {
            Outbound::Message(message) => message,
            other => panic!("unexpected outbound frame: {other:?}"),
        }
    }

    async fn register(
        state: &RelayState,
        session: &Arc<Session>,
        rx: &mut UnboundedReceiver<Outbound>,
        mode: Role,
    ) -> (String, String) {
        handle_client_message(state, session, ClientMessage::Register { mode })
            .await
            .unwrap();
        match next_message(rx) {
            ServerMessage::Registered {
                device_id, token, ..
            } => (device_id, token),
            other => panic!("expected registered, got {other:?}"),
        }
    }

    async fn pair(
        state: &RelayState,
        controller: &Arc<Session>,
        controller_rx: &mut UnboundedReceiver<Outbound>,
        viewer: &Arc<Session>,
        viewer_rx: &mut UnboundedReceiver<Outbound>,
    ) {
        handle_client_message(state, controller, ClientMessage::GeneratePairCode)
            .await
            .unwrap();
        let code = match next_message(controller_rx) {
            ServerMessage::PairCodeGenerated { code, expires_in } => {
                assert_eq!(expires_in, 300);
                code
            }
            other => panic!("expected pair-code-generated, got {other:?}"),
        };

        handle_client_message(state, viewer, ClientMessage::EnterPairCode { code })
            .await
            .unwrap();

        assert!(matches!(
            next_message(viewer_rx),
            ServerMessage::Paired {
                with: Role::Controller,
                ..
            }
        ));
        assert!(matches!(
            next_message(controller_rx),
            ServerMessage::Paired {
                with: Role::Viewer,
                ..
            }
        ));
        assert!(matches!(
            next_message(controller_rx),
            ServerMessage::StartStream
        ));
    }

    #[tokio::test]
    async fn register_assigns_identity_and_role() {
        let state = test_state();
        let (session, mut rx) = connect(&state);

        let (device_id, token) = register(&state, &session, &mut rx, Role::Controller).await;
        assert!(device_id.starts_with("device-"));
        assert!(state.tokens.verify(&token, &device_id));

        let s = session.state.read().await;
        assert_eq!(s.role, Some(Role::Controller));
        assert_eq!(s.device_id.as_deref(), Some(device_id.as_str()));
    }

    #[tokio::test]
    async fn second_register_is_a_role_violation() {
        let state = test_state();
        let (session, mut rx) = connect(&state);
        register(&state, &session, &mut rx, Role::Viewer).await;

        let err = handle_client_message(
            &state,
            &session,
            ClientMessage::Register {
                mode: Role::Controller,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RelayError::RoleViolation(_)));

        // Role unchanged.
        assert_eq!(session.state.read().await.role, Some(Role::Viewer));
    }

    #[tokio::test]
    async fn generate_pair_code_requires_a_controller() {
        let state = test_state();
        let (viewer, mut rx) = connect(&state);
        register(&state, &viewer, &mut rx, Role::Viewer).await;

        let err = handle_client_message(&state, &viewer, ClientMessage::GeneratePairCode)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Only controllers can generate pair codes");
    }

    #[tokio::test]
    async fn enter_pair_code_requires_a_viewer() {
        let state = test_state();
        let (controller, mut rx) = connect(&state);
        register(&state, &controller, &mut rx, Role::Controller).await;

        let err = handle_client_message(
            &state,
            &controller,
            ClientMessage::EnterPairCode {
                code: "123456".into(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Only viewers can enter pair codes");
    }

    #[tokio::test]
    async fn pairing_links_both_sides_and_signals_stream() {
        let state = test_state();
        let (controller, mut controller_rx) = connect(&state);
        let (viewer, mut viewer_rx) = connect(&state);
        let (controller_id, _) =
            register(&state, &controller, &mut controller_rx, Role::Controller).await;
        let (viewer_id, _) = register(&state, &viewer, &mut viewer_rx, Role::Viewer).await;

        pair(&state, &controller, &mut controller_rx, &viewer, &mut viewer_rx).await;

        assert_eq!(
            controller.state.read().await.paired_with.as_deref(),
            Some(viewer_id.as_str())
        );
        assert_eq!(
            viewer.state.read().await.paired_with.as_deref(),
            Some(controller_id.as_str())
        );
        // The consumed code is no longer owned by the controller.
        assert!(controller.state.read().await.pair_code.is_none());
    }

    #[tokio::test]
    async fn pair_code_is_single_use() {
        let state = test_state();
        let (controller, mut controller_rx) = connect(&state);
        let (viewer, mut viewer_rx) = connect(&state);
        register(&state, &controller, &mut controller_rx, Role::Controller).await;
        register(&state, &viewer, &mut viewer_rx, Role::Viewer).await;

        handle_client_message(&state, &controller, ClientMessage::GeneratePairCode)
            .await
            .unwrap();
        let ServerMessage::PairCodeGenerated { code, .. } = next_message(&mut controller_rx)
        else {
            panic!("expected pair-code-generated");
        };

        handle_client_message(
            &state,
            &viewer,
            ClientMessage::EnterPairCode { code: code.clone() },
        )
        .await
        .unwrap();

        // A second viewer redeeming the same code gets a pairing error.
        let (second, mut second_rx) = connect(&state);
        register(&state, &second, &mut second_rx, Role::Viewer).await;
        let err = handle_client_message(&state, &second, ClientMessage::EnterPairCode { code })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid or expired pairing code");
    }

    #[tokio::test]
    async fn a_new_code_supersedes_the_previous_one() {
        let state = test_state();
        let (controller, mut controller_rx) = connect(&state);
        let (viewer, mut viewer_rx) = connect(&state);
        register(&state, &controller, &mut controller_rx, Role::Controller).await;
        register(&state, &viewer, &mut viewer_rx, Role::Viewer).await;

        handle_client_message(&state, &controller, ClientMessage::GeneratePairCode)
            .await
            .unwrap();
        let ServerMessage::PairCodeGenerated { code: first, .. } =
            next_message(&mut controller_rx)
        else {
            panic!("expected pair-code-generated");
        };

        handle_client_message(&state, &controller, ClientMessage::GeneratePairCode)
            .await
            .unwrap();
        let ServerMessage::PairCodeGenerated { code: second, .. } =
            next_message(&mut controller_rx)
        else {
            panic!("expected pair-code-generated");
        };

        assert_eq!(state.pairing.len(), 1);
        let err = handle_client_message(
            &state,
            &viewer,
            ClientMessage::EnterPairCode { code: first },
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Invalid or expired pairing code");

        handle_client_message(&state, &viewer, ClientMessage::EnterPairCode { code: second })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn relay_without_a_partner_is_a_pairing_error() {
        let state = test_state();
        let (viewer, mut rx) = connect(&state);
        register(&state, &viewer, &mut rx, Role::Viewer).await;

        let err = handle_client_message(
            &state,
            &viewer,
            ClientMessage::Command {
                command: serde_json::json!({"action": "click"}),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Not paired with a device");
    }

    #[tokio::test]
    async fn signaling_payloads_relay_verbatim() {
        let state = test_state();
        let (controller, mut controller_rx) = connect(&state);
        let (viewer, mut viewer_rx) = connect(&state);
        register(&state, &controller, &mut controller_rx, Role::Controller).await;
        register(&state, &viewer, &mut viewer_rx, Role::Viewer).await;
        pair(&state, &controller, &mut controller_rx, &viewer, &mut viewer_rx).await;

        let offer = serde_json::json!({
            "type": "offer",
            "sdp": "v=0\r\n",
            "handshakeId": "h-1",
        });
        dispatch_frame(&state, &controller, &offer.to_string()).await;

        let relayed = serde_json::to_value(next_message(&mut viewer_rx)).unwrap();
        assert_eq!(relayed, offer);
    }

    #[tokio::test]
    async fn disconnect_notifies_the_survivor_exactly_once() {
        let state = test_state();
        let (controller, mut controller_rx) = connect(&state);
        let (viewer, mut viewer_rx) = connect(&state);
        register(&state, &controller, &mut controller_rx, Role::Controller).await;
        let (viewer_id, _) = register(&state, &viewer, &mut viewer_rx, Role::Viewer).await;
        pair(&state, &controller, &mut controller_rx, &viewer, &mut viewer_rx).await;

        disconnect(&state, viewer.conn_id).await;
        disconnect(&state, viewer.conn_id).await;

        assert!(matches!(
            next_message(&mut controller_rx),
            ServerMessage::PeerDisconnected
        ));
        assert!(controller_rx.try_recv().is_err());
        assert!(controller.state.read().await.paired_with.is_none());
        assert!(state.registry.lookup(&viewer_id).is_none());

        // Relay before re-pairing now fails.
        let err = handle_client_message(
            &state,
            &controller,
            ClientMessage::Offer {
                payload: serde_json::json!({"sdp": "v=0"}),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Not paired with a device");
    }

    #[tokio::test]
    async fn controller_disconnect_frees_its_unconsumed_code() {
        let state = test_state();
        let (controller, mut controller_rx) = connect(&state);
        register(&state, &controller, &mut controller_rx, Role::Controller).await;

        handle_client_message(&state, &controller, ClientMessage::GeneratePairCode)
            .await
            .unwrap();
        let ServerMessage::PairCodeGenerated { code, .. } = next_message(&mut controller_rx)
        else {
            panic!("expected pair-code-generated");
        };
        assert_eq!(state.pairing.len(), 1);

        disconnect(&state, controller.conn_id).await;
        assert!(state.pairing.is_empty());

        let (viewer, mut viewer_rx) = connect(&state);
        register(&state, &viewer, &mut viewer_rx, Role::Viewer).await;
        let err = handle_client_message(&state, &viewer, ClientMessage::EnterPairCode { code })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid or expired pairing code");
    }

    #[tokio::test]
    async fn silent_transport_is_dropped_after_two_missed_probes() {
        let state = RelayState::new(&Config {
            heartbeat_interval_seconds: 1,
            ..Config::default()
        });
        let (controller, mut controller_rx) = connect(&state);
        let (viewer, mut viewer_rx) = connect(&state);
        register(&state, &controller, &mut controller_rx, Role::Controller).await;
        let (viewer_id, _) = register(&state, &viewer, &mut viewer_rx, Role::Viewer).await;
        pair(&state, &controller, &mut controller_rx, &viewer, &mut viewer_rx).await;

        // The controller keeps answering probes; the viewer stays silent.
        let keep_alive = controller.clone();
        let pinger = tokio::spawn(async move {
            loop {
                keep_alive.mark_alive();
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });

        tokio::time::sleep(Duration::from_millis(2500)).await;
        pinger.abort();

        // The monitor closed the silent transport and ran full cleanup.
        assert!(!state.connections.contains_key(&viewer.conn_id));
        assert!(state.registry.lookup(&viewer_id).is_none());
        assert!(controller.state.read().await.paired_with.is_none());

        let mut saw_shutdown = false;
        while let Ok(frame) = viewer_rx.try_recv() {
            if matches!(frame, Outbound::Shutdown) {
                saw_shutdown = true;
            }
        }
        assert!(saw_shutdown, "silent transport never told to close");

        let mut notices = 0;
        while let Ok(frame) = controller_rx.try_recv() {
            if matches!(frame, Outbound::Message(ServerMessage::PeerDisconnected)) {
                notices += 1;
            }
        }
        assert_eq!(notices, 1);
    }

    #[tokio::test]
    async fn authenticate_restores_role_on_reconnect() {
        let state = test_state();
        let (original, mut original_rx) = connect(&state);
        let (device_id, token) =
            register(&state, &original, &mut original_rx, Role::Controller).await;

        let (reconnect, mut reconnect_rx) = connect(&state);
        handle_client_message(
            &state,
            &reconnect,
            ClientMessage::Authenticate {
                token,
                device_id: device_id.clone(),
            },
        )
        .await
        .unwrap();

        assert!(matches!(
            next_message(&mut reconnect_rx),
            ServerMessage::Authenticated { success: true }
        ));
        assert_eq!(reconnect.state.read().await.role, Some(Role::Controller));

        // Last registration wins.
        let current = state.registry.lookup(&device_id).unwrap();
        assert!(Arc::ptr_eq(&current, &reconnect));
    }

    #[tokio::test]
    async fn bad_token_leaves_state_untouched() {
        let state = test_state();
        let (session, _rx) = connect(&state);

        let err = handle_client_message(
            &state,
            &session,
            ClientMessage::Authenticate {
                token: "garbage".into(),
                device_id: "device-x".into(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RelayError::Auth));
        assert!(session.state.read().await.device_id.is_none());
        assert!(state.registry.lookup("device-x").is_none());
    }

    #[tokio::test]
    async fn unknown_kinds_are_ignored_without_reply() {
        let state = test_state();
        let (session, mut rx) = connect(&state);

        dispatch_frame(&state, &session, r#"{"type":"telemetry","data":1}"#).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_known_kind_gets_exactly_one_error() {
        let state = test_state();
        let (session, mut rx) = connect(&state);

        dispatch_frame(&state, &session, r#"{"type":"register"}"#).await;
        assert!(matches!(next_message(&mut rx), ServerMessage::Error { .. }));
        assert!(rx.try_recv().is_err());

        // The session is still usable afterwards.
        dispatch_frame(&state, &session, r#"{"type":"register","mode":"viewer"}"#).await;
        assert!(matches!(
            next_message(&mut rx),
            ServerMessage::Registered { .. }
        ));
    }

    #[tokio::test]
    async fn invalid_json_gets_exactly_one_error() {
        let state = test_state();
        let (session, mut rx) = connect(&state);

        dispatch_frame(&state, &session, "{nope").await;
        assert!(matches!(next_message(&mut rx), ServerMessage::Error { .. }));
        assert!(rx.try_recv().is_err());
    }
}
