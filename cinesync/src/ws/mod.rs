//! WebSocket sync hub
//!
//! Terminates the message channel: admits connections through the auth
//! window, dispatches inbound frames into `StateCore`, and fans master
//! snapshots back out. All outbound traffic rides a per-connection
//! unbounded channel drained by a writer task, so fan-out never blocks on
//! a slow socket.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use cinesync_core::config::SyncConfig;
use cinesync_core::metrics::Counters;
use cinesync_core::models::{sanitize_name, ClientId, Session};
use cinesync_core::service::state::SyncNotifier;
use cinesync_core::service::{AuthStore, ClientInfo, StateCore, VideoCatalog};
use cinesync_proto::{close, ClientFrame, Role, ServerFrame, SyncSnapshot, ViewerEntry};

use crate::http::AppState;

/// Messages handed to a connection's writer task.
enum Outbound {
    Frame(String),
    Close(u16, &'static str),
}

struct Connection {
    tx: UnboundedSender<Outbound>,
    role: Role,
    close: Arc<Notify>,
}

pub struct SyncHub {
    state: Arc<StateCore>,
    auth: Arc<AuthStore>,
    catalog: Arc<VideoCatalog>,
    counters: Arc<Counters>,
    config: SyncConfig,
    connections: DashMap<ClientId, Connection>,
    heartbeat: parking_lot::Mutex<Option<AbortHandle>>,
}

impl std::fmt::Debug for SyncHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHub")
            .field("connections", &self.connections.len())
            .finish()
    }
}

/// Upgrade handler for `GET /ws`.
pub async fn ws_handler(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let hub = app.hub.clone();
    ws.on_upgrade(move |socket| async move { hub.handle_socket(socket, addr).await })
}

impl SyncHub {
    #[must_use]
    pub fn new(
        state: Arc<StateCore>,
        auth: Arc<AuthStore>,
        catalog: Arc<VideoCatalog>,
        counters: Arc<Counters>,
        config: SyncConfig,
    ) -> Self {
        Self {
            state,
            auth,
            catalog,
            counters,
            config,
            connections: DashMap::new(),
            heartbeat: parking_lot::Mutex::new(None),
        }
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Drive one connection from upgrade to teardown.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, addr: SocketAddr) {
        Counters::incr(&self.counters.connections_opened);
        debug!(peer = %addr, "channel opened");

        let (sink, mut receiver) = socket.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let close = Arc::new(Notify::new());
        let writer = tokio::spawn(write_loop(
            sink,
            rx,
            Arc::clone(&self.counters),
            close.clone(),
        ));

        let session = match self.auth_phase(&mut receiver, &tx, addr).await {
            Some(session) => session,
            None => {
                drop(tx);
                let _ = writer.await;
                Counters::incr(&self.counters.connections_closed);
                return;
            }
        };

        let client_id = ClientId::new();
        self.connections.insert(
            client_id.clone(),
            Connection {
                tx: tx.clone(),
                role: session.role,
                close: close.clone(),
            },
        );
        self.state
            .register(ClientInfo::from_session(client_id.clone(), &session, addr));
        info!(client = %client_id, role = %session.role, peer = %addr, "client joined");

        // Post-auth pushes, in order: snapshot, then the operator extras,
        // then tell the other operators about the new arrival.
        self.send_to(&tx, &ServerFrame::SyncState(self.state.snapshot()));
        if session.role.is_operator() {
            self.push_video_list(&tx).await;
            let table = self.state.viewer_table();
            self.send_to(
                &tx,
                &ServerFrame::ViewerList {
                    count: table.len(),
                    viewers: table,
                },
            );
        }
        self.push_viewer_table(Some(&client_id));

        loop {
            tokio::select! {
                () = close.notified() => break,
                frame = receiver.next() => match frame {
                    None => break,
                    Some(Ok(Message::Text(text))) => {
                        Counters::incr(&self.counters.frames_in);
                        self.handle_frame(&client_id, session.role, &text, &tx).await;
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {
                        // Control frames count as liveness.
                        self.state.touch(&client_id);
                    }
                    Some(Err(e)) => {
                        debug!(client = %client_id, error = %e, "channel error");
                        break;
                    }
                }
            }
        }

        self.cleanup(&client_id);
        drop(tx);
        let _ = writer.await;
        Counters::incr(&self.counters.connections_closed);
        info!(client = %client_id, peer = %addr, "client left");
    }

    /// Wait for a valid `auth` frame inside the auth window. Returns the
    /// session on success; on every other outcome the connection is torn
    /// down and `None` returned.
    async fn auth_phase(
        &self,
        receiver: &mut SplitStream<WebSocket>,
        tx: &UnboundedSender<Outbound>,
        addr: SocketAddr,
    ) -> Option<Session> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.auth_timeout_ms);
        loop {
            let frame = match tokio::time::timeout_at(deadline, receiver.next()).await {
                Err(_) => {
                    debug!(peer = %addr, "authentication timed out");
                    self.send_to(tx, &ServerFrame::error("Authentication timed out"));
                    let _ = tx.send(Outbound::Close(
                        close::POLICY_VIOLATION,
                        "Authentication timed out",
                    ));
                    return None;
                }
                Ok(None) | Ok(Some(Ok(Message::Close(_)))) => return None,
                Ok(Some(Err(e))) => {
                    debug!(peer = %addr, error = %e, "channel error before auth");
                    return None;
                }
                Ok(Some(Ok(frame))) => frame,
            };
            let Message::Text(text) = frame else {
                continue;
            };
            Counters::incr(&self.counters.frames_in);
            match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Auth {
                    token,
                    password,
                    name,
                }) => match self.authenticate(token, password, name) {
                    Ok(session) => {
                        self.send_to(
                            tx,
                            &ServerFrame::AuthSuccess {
                                role: session.role,
                                name: session.name.clone(),
                                token: session.token.clone(),
                            },
                        );
                        return Some(session);
                    }
                    Err(message) => {
                        warn!(peer = %addr, "authentication failed");
                        Counters::incr(&self.counters.auth_failures);
                        self.send_to(tx, &ServerFrame::AuthFail { message });
                        let _ = tx.send(Outbound::Close(
                            close::POLICY_VIOLATION,
                            "Authentication failed",
                        ));
                        return None;
                    }
                },
                Ok(_) => self.send_to(tx, &ServerFrame::error("Not authenticated")),
                Err(_) => self.send_to(tx, &ServerFrame::error("Invalid message")),
            }
        }
    }

    /// Token wins over password; an invalid token never falls through to
    /// the password path.
    fn authenticate(
        &self,
        token: Option<String>,
        password: Option<String>,
        name: Option<String>,
    ) -> Result<Session, String> {
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            return self
                .auth
                .validate_session(&token)
                .ok_or_else(|| "Invalid or expired session".to_string());
        }
        if let Some(password) = password {
            let role = self
                .auth
                .validate_password(&password)
                .ok_or_else(|| "Invalid password".to_string())?;
            let name = sanitize_name(name.as_deref().unwrap_or_default());
            let token = self.auth.create_session(role, name);
            return self
                .auth
                .validate_session(&token)
                .ok_or_else(|| "Session creation failed".to_string());
        }
        Err("Missing credentials".to_string())
    }

    /// Dispatch one authenticated inbound frame.
    async fn handle_frame(
        &self,
        id: &ClientId,
        role: Role,
        text: &str,
        tx: &UnboundedSender<Outbound>,
    ) {
        let frame = match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(client = %id, error = %e, "unparseable frame");
                self.send_to(tx, &ServerFrame::error("Invalid message"));
                return;
            }
        };
        self.state.touch(id);

        let operator_only = matches!(
            frame,
            ClientFrame::Play
                | ClientFrame::Pause
                | ClientFrame::Seek { .. }
                | ClientFrame::ChangeVideo { .. }
                | ClientFrame::SyncAll
                | ClientFrame::RequestVideoList
                | ClientFrame::RequestViewerList
        );
        if operator_only && !role.is_operator() {
            self.send_to(tx, &ServerFrame::error("Permission denied"));
            return;
        }

        let result = match frame {
            ClientFrame::Auth { .. } => {
                self.send_to(tx, &ServerFrame::error("Already authenticated"));
                Ok(())
            }
            ClientFrame::Play => self.state.play(),
            ClientFrame::Pause => self.state.pause(),
            ClientFrame::Seek { time } => self.state.seek(time),
            ClientFrame::ChangeVideo { video } => self.state.change_video(&video),
            ClientFrame::SyncAll => {
                self.state.sync_all();
                Ok(())
            }
            ClientFrame::RequestVideoList => {
                self.push_video_list(tx).await;
                Ok(())
            }
            ClientFrame::RequestViewerList => {
                let table = self.state.viewer_table();
                self.send_to(
                    tx,
                    &ServerFrame::ViewerList {
                        count: table.len(),
                        viewers: table,
                    },
                );
                Ok(())
            }
            ClientFrame::RequestSync => {
                self.send_to(tx, &ServerFrame::SyncState(self.state.snapshot()));
                Ok(())
            }
            ClientFrame::ClientTimeUpdate {
                client_time,
                playback_rate,
                is_playing,
                name,
            } => self
                .state
                .client_time_update(id, client_time, playback_rate, is_playing, name),
        };
        if let Err(e) = result {
            self.send_to(tx, &ServerFrame::error(e.to_string()));
        }
    }

    async fn push_video_list(&self, tx: &UnboundedSender<Outbound>) {
        match self.catalog.list().await {
            Ok(entries) => {
                let videos = entries
                    .into_iter()
                    .map(|e| e.stream_id.as_str().to_string())
                    .collect();
                self.send_to(tx, &ServerFrame::VideoList { videos });
            }
            Err(e) => {
                warn!(error = %e, "failed to list streams");
                self.send_to(tx, &ServerFrame::error("Failed to list videos"));
            }
        }
    }

    /// Send the current viewer table to every operator, optionally
    /// skipping one connection (a freshly joined operator that already got
    /// its copy).
    fn push_viewer_table(&self, skip: Option<&ClientId>) {
        let table = self.state.viewer_table();
        let frame = ServerFrame::ViewerList {
            count: table.len(),
            viewers: table,
        };
        let Ok(text) = serde_json::to_string(&frame) else {
            return;
        };
        for entry in self.connections.iter() {
            if Some(entry.key()) == skip || !entry.value().role.is_operator() {
                continue;
            }
            let _ = entry.value().tx.send(Outbound::Frame(text.clone()));
        }
    }

    fn send_to(&self, tx: &UnboundedSender<Outbound>, frame: &ServerFrame) {
        match serde_json::to_string(frame) {
            // A failed enqueue means the writer died; the reader loop is
            // woken separately and runs the cleanup.
            Ok(text) => {
                let _ = tx.send(Outbound::Frame(text));
            }
            Err(e) => error!(error = %e, "failed to serialize frame"),
        }
    }

    /// Force-close a connection. Teardown happens in its reader loop.
    pub fn kick(&self, id: &ClientId, code: u16, reason: &'static str) {
        if let Some(conn) = self.connections.get(id) {
            let _ = conn.tx.send(Outbound::Close(code, reason));
            conn.close.notify_one();
        }
    }

    fn cleanup(&self, id: &ClientId) {
        if self.connections.remove(id).is_some() {
            self.state.unregister(id);
        }
    }

    /// Periodic liveness enforcement over every registered client.
    pub fn spawn_heartbeat(self: Arc<Self>) {
        let period = Duration::from_millis(self.config.heartbeat_interval_ms);
        let hub = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for id in hub.state.tick_heartbeats() {
                    warn!(client = %id, "heartbeat expired, disconnecting");
                    hub.kick(&id, close::NORMAL, "Connection timed out");
                }
            }
        })
        .abort_handle();
        if let Some(previous) = self.heartbeat.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Say goodbye to every client and stop the liveness loop.
    pub fn shutdown(&self) {
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }
        for entry in self.connections.iter() {
            let _ = entry
                .value()
                .tx
                .send(Outbound::Close(close::GOING_AWAY, "Server shutting down"));
            entry.value().close.notify_one();
        }
    }
}

impl SyncNotifier for SyncHub {
    fn broadcast(&self, snapshot: SyncSnapshot) {
        Counters::incr(&self.counters.broadcasts);
        let Ok(text) = serde_json::to_string(&ServerFrame::SyncState(snapshot)) else {
            return;
        };
        let mut dead = Vec::new();
        for entry in self.connections.iter() {
            if entry.value().tx.send(Outbound::Frame(text.clone())).is_err() {
                dead.push(entry.key().clone());
            }
        }
        // Dead writers only need their reader woken; cleanup runs there,
        // outside any map iteration.
        for id in dead {
            if let Some(conn) = self.connections.get(&id) {
                conn.close.notify_one();
            }
        }
    }

    fn sync_client(&self, client: &ClientId, snapshot: SyncSnapshot) {
        if let Some(conn) = self.connections.get(client) {
            let frame = ServerFrame::SyncState(snapshot);
            match serde_json::to_string(&frame) {
                Ok(text) => {
                    if conn.tx.send(Outbound::Frame(text)).is_err() {
                        conn.close.notify_one();
                    }
                }
                Err(e) => error!(error = %e, "failed to serialize snapshot"),
            }
        }
    }

    fn viewer_table(&self, viewers: Vec<ViewerEntry>) {
        let frame = ServerFrame::ViewerList {
            count: viewers.len(),
            viewers,
        };
        let Ok(text) = serde_json::to_string(&frame) else {
            return;
        };
        for entry in self.connections.iter() {
            if entry.value().role.is_operator() {
                let _ = entry.value().tx.send(Outbound::Frame(text.clone()));
            }
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: UnboundedReceiver<Outbound>,
    counters: Arc<Counters>,
    close: Arc<Notify>,
) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Frame(text) => {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
                Counters::incr(&counters.frames_out);
            }
            Outbound::Close(code, reason) => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
    // Wake the reader so a dead writer cannot strand the connection.
    close.notify_one();
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinesync_core::config::{AuthConfig, VideoConfig};
    use cinesync_core::service::FfmpegEncoder;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_hub() -> (Arc<SyncHub>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let auth_config = AuthConfig {
            operator_password: "op-secret".to_string(),
            viewer_password: "view-secret".to_string(),
            session_ttl_ms: 60_000,
            sweep_interval_ms: 3_600_000,
        };
        let video_config = VideoConfig {
            root: dir.path().to_string_lossy().into_owned(),
            ..VideoConfig::default()
        };
        let counters = Arc::new(Counters::default());
        let state = StateCore::new(SyncConfig::default());
        let auth = Arc::new(AuthStore::new(&auth_config));
        let catalog = VideoCatalog::new(
            &video_config,
            Arc::new(FfmpegEncoder::new(&video_config)),
            counters.clone(),
        );
        let hub = Arc::new(SyncHub::new(
            state.clone(),
            auth,
            catalog,
            counters,
            SyncConfig::default(),
        ));
        state.set_notifier(hub.clone());
        (hub, dir)
    }

    fn join(
        hub: &Arc<SyncHub>,
        role: Role,
        name: &str,
    ) -> (ClientId, UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ClientId::new();
        hub.connections.insert(
            id.clone(),
            Connection {
                tx,
                role,
                close: Arc::new(Notify::new()),
            },
        );
        hub.state.register(ClientInfo {
            id: id.clone(),
            role,
            name: name.to_string(),
            session_token: "t".to_string(),
            peer_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9999),
        });
        (id, rx)
    }

    fn next_frame(rx: &mut UnboundedReceiver<Outbound>) -> serde_json::Value {
        match rx.try_recv().expect("frame expected") {
            Outbound::Frame(text) => serde_json::from_str(&text).expect("valid json"),
            Outbound::Close(code, reason) => panic!("unexpected close {code}: {reason}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn password_then_token_auth_round_trip() {
        let (hub, _dir) = test_hub();

        let session = hub
            .authenticate(None, Some("op-secret".to_string()), Some("Ana".to_string()))
            .expect("password auth");
        assert_eq!(session.role, Role::Operator);
        assert_eq!(session.name, "Ana");

        // Reconnect with the minted token only.
        let replay = hub
            .authenticate(Some(session.token.clone()), None, None)
            .expect("token auth");
        assert_eq!(replay.role, Role::Operator);
        assert_eq!(replay.name, "Ana");
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_token_does_not_fall_through_to_password() {
        let (hub, _dir) = test_hub();
        let result = hub.authenticate(
            Some("bogus".to_string()),
            Some("op-secret".to_string()),
            None,
        );
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_token_is_rejected() {
        let (hub, _dir) = test_hub();
        let session = hub
            .authenticate(None, Some("view-secret".to_string()), None)
            .expect("password auth");
        tokio::time::advance(Duration::from_millis(60_001)).await;
        assert!(hub.authenticate(Some(session.token), None, None).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn viewer_cannot_drive_playback() {
        let (hub, _dir) = test_hub();
        let (id, mut rx) = join(&hub, Role::Viewer, "Bo");
        let tx = hub.connections.get(&id).expect("connection").tx.clone();

        hub.handle_frame(&id, Role::Viewer, r#"{"type":"play"}"#, &tx)
            .await;
        let frame = next_frame(&mut rx);
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["message"], "Permission denied");
        assert!(!hub.state.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn operator_play_is_applied_and_broadcast() {
        let (hub, _dir) = test_hub();
        let (op, mut op_rx) = join(&hub, Role::Operator, "Ana");
        let tx = hub.connections.get(&op).expect("connection").tx.clone();

        hub.handle_frame(&op, Role::Operator, r#"{"type":"play"}"#, &tx)
            .await;
        assert!(hub.state.is_playing());

        // The transition broadcast lands on the operator's channel.
        let frame = next_frame(&mut op_rx);
        assert_eq!(frame["type"], "syncState");
        assert_eq!(frame["isPlaying"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_video_reference_is_rejected() {
        let (hub, _dir) = test_hub();
        let (op, mut rx) = join(&hub, Role::Operator, "Ana");
        let tx = hub.connections.get(&op).expect("connection").tx.clone();

        hub.handle_frame(
            &op,
            Role::Operator,
            r#"{"type":"changeVideo","video":"hls:../etc"}"#,
            &tx,
        )
        .await;
        let frame = next_frame(&mut rx);
        assert_eq!(frame["type"], "error");
        assert!(hub.state.current_video().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_type_gets_error_without_disconnect() {
        let (hub, _dir) = test_hub();
        let (id, mut rx) = join(&hub, Role::Viewer, "Bo");
        let tx = hub.connections.get(&id).expect("connection").tx.clone();

        hub.handle_frame(&id, Role::Viewer, r#"{"type":"selfDestruct"}"#, &tx)
            .await;
        let frame = next_frame(&mut rx);
        assert_eq!(frame["type"], "error");
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn request_sync_returns_snapshot() {
        let (hub, _dir) = test_hub();
        let (id, mut rx) = join(&hub, Role::Viewer, "Bo");
        let tx = hub.connections.get(&id).expect("connection").tx.clone();

        hub.handle_frame(&id, Role::Viewer, r#"{"type":"requestSync"}"#, &tx)
            .await;
        let frame = next_frame(&mut rx);
        assert_eq!(frame["type"], "syncState");
        assert_eq!(frame["isPlaying"], false);
        assert_eq!(frame["playbackRate"], 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn time_update_resets_heartbeat_and_updates_table() {
        let (hub, _dir) = test_hub();
        let (id, rx) = join(&hub, Role::Viewer, "Bo");
        let tx = hub.connections.get(&id).expect("connection").tx.clone();

        // Two missed checks, then a report arrives.
        assert!(hub.state.tick_heartbeats().is_empty());
        assert!(hub.state.tick_heartbeats().is_empty());
        hub.handle_frame(
            &id,
            Role::Viewer,
            r#"{"type":"clientTimeUpdate","clientTime":0.0,"playbackRate":1.0,"isPlaying":false}"#,
            &tx,
        )
        .await;
        assert!(hub.state.tick_heartbeats().is_empty());
        drop(rx);
    }

    #[tokio::test(start_paused = true)]
    async fn kick_sends_close_frame() {
        let (hub, _dir) = test_hub();
        let (id, mut rx) = join(&hub, Role::Viewer, "Bo");

        hub.kick(&id, close::NORMAL, "Connection timed out");
        match rx.try_recv().expect("close expected") {
            Outbound::Close(code, reason) => {
                assert_eq!(code, close::NORMAL);
                assert_eq!(reason, "Connection timed out");
            }
            Outbound::Frame(text) => panic!("unexpected frame: {text}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_says_goodbye_to_everyone() {
        let (hub, _dir) = test_hub();
        let (_a, mut rx_a) = join(&hub, Role::Viewer, "Bo");
        let (_b, mut rx_b) = join(&hub, Role::Operator, "Ana");

        hub.shutdown();
        for rx in [&mut rx_a, &mut rx_b] {
            loop {
                match rx.try_recv().expect("close expected") {
                    Outbound::Close(code, _) => {
                        assert_eq!(code, close::GOING_AWAY);
                        break;
                    }
                    Outbound::Frame(_) => continue,
                }
            }
        }
    }
}
