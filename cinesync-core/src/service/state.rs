//! Authoritative master playback state and drift control
//!
//! One mutex guards the master timeline and the client table so every
//! reader sees a consistent anchor triple (`anchor_time`, `anchor_wall`,
//! `rate`). Time math uses the effective-time projection
//!
//! ```text
//! effective_time() = max(0, anchor_time + playing * (now - anchor_wall) * rate)
//! ```
//!
//! and every transition that changes `is_playing` or `rate` re-anchors
//! first, so the projection is continuous across transitions.
//!
//! Outbound traffic goes through the [`SyncNotifier`] seam bound by the
//! composition root; this module never sees the socket type.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::models::{sanitize_name, ClientId, Role, Session, StreamId};
use crate::{Error, Result};

pub use cinesync_proto::{SyncSnapshot, ViewerEntry};

/// Outbound surface bound by the composition root.
///
/// Implementations must not block: they enqueue and return.
pub trait SyncNotifier: Send + Sync {
    /// Fan a snapshot out to every connected client.
    fn broadcast(&self, snapshot: SyncSnapshot);
    /// Send a snapshot to a single client.
    fn sync_client(&self, client: &ClientId, snapshot: SyncSnapshot);
    /// The viewer table changed; deliver it to operators.
    fn viewer_table(&self, viewers: Vec<ViewerEntry>);
}

/// Registration metadata for a freshly authenticated connection.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: ClientId,
    pub role: Role,
    pub name: String,
    pub session_token: String,
    pub peer_addr: SocketAddr,
}

impl ClientInfo {
    #[must_use]
    pub fn from_session(id: ClientId, session: &Session, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            role: session.role,
            name: session.name.clone(),
            session_token: session.token.clone(),
            peer_addr,
        }
    }
}

struct Client {
    role: Role,
    name: String,
    #[allow(dead_code)]
    session_token: String,
    peer_addr: SocketAddr,
    last_reported_time: Option<f64>,
    last_drift: Option<f64>,
    reported_playing: bool,
    reported_rate: f64,
    sync_interval: Duration,
    sync_timer: Option<AbortHandle>,
    missed_heartbeats: u32,
}

impl Client {
    fn new(info: ClientInfo, sync_interval: Duration) -> Self {
        Self {
            role: info.role,
            name: info.name,
            session_token: info.session_token,
            peer_addr: info.peer_addr,
            last_reported_time: None,
            last_drift: None,
            reported_playing: false,
            reported_rate: 1.0,
            sync_interval,
            sync_timer: None,
            missed_heartbeats: 0,
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.sync_timer.take() {
            timer.abort();
        }
    }
}

struct MasterState {
    current_video: Option<StreamId>,
    anchor_time: f64,
    anchor_wall: Instant,
    is_playing: bool,
    rate: f64,
}

impl MasterState {
    fn new(now: Instant) -> Self {
        Self {
            current_video: None,
            anchor_time: 0.0,
            anchor_wall: now,
            is_playing: false,
            rate: 1.0,
        }
    }

    fn effective_time(&self, now: Instant) -> f64 {
        let elapsed = if self.is_playing {
            now.duration_since(self.anchor_wall).as_secs_f64() * self.rate
        } else {
            0.0
        };
        (self.anchor_time + elapsed).max(0.0)
    }

    /// Fold elapsed playback into the anchor so a following mutation of
    /// `is_playing` or `rate` keeps the projection continuous.
    fn reanchor(&mut self, now: Instant) {
        self.anchor_time = self.effective_time(now);
        self.anchor_wall = now;
    }

    fn snapshot(&self, now: Instant) -> SyncSnapshot {
        SyncSnapshot {
            current_video: self.current_video.as_ref().map(|v| v.as_str().to_string()),
            target_time: self.effective_time(now),
            is_playing: self.is_playing,
            playback_rate: self.rate,
        }
    }
}

struct Inner {
    master: MasterState,
    clients: HashMap<ClientId, Client>,
    rate_loop: Option<AbortHandle>,
    broadcast_loop: Option<AbortHandle>,
}

pub struct StateCore {
    /// Self-handle for the timer and loop tasks this component spawns.
    me: Weak<StateCore>,
    inner: Mutex<Inner>,
    notifier: OnceCell<Arc<dyn SyncNotifier>>,
    config: SyncConfig,
}

impl std::fmt::Debug for StateCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCore").finish()
    }
}

impl StateCore {
    #[must_use]
    pub fn new(config: SyncConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            inner: Mutex::new(Inner {
                master: MasterState::new(Instant::now()),
                clients: HashMap::new(),
                rate_loop: None,
                broadcast_loop: None,
            }),
            notifier: OnceCell::new(),
            config,
        })
    }

    /// Bind the outbound surface. Call exactly once from the composition
    /// root, before any client is registered.
    pub fn set_notifier(&self, notifier: Arc<dyn SyncNotifier>) {
        if self.notifier.set(notifier).is_err() {
            warn!("sync notifier was already bound; ignoring rebind");
        }
    }

    fn notify<F: FnOnce(&Arc<dyn SyncNotifier>)>(&self, f: F) {
        if let Some(notifier) = self.notifier.get() {
            f(notifier);
        }
    }

    // Master-state transitions -------------------------------------------

    /// Start playback. No-op when already playing.
    pub fn play(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.master.is_playing {
                return Ok(());
            }
            let now = Instant::now();
            inner.master.reanchor(now);
            inner.master.is_playing = true;
        }
        info!("playback started");
        self.start_loops();
        self.broadcast_now();
        Ok(())
    }

    /// Pause playback and release the rate controller. No-op when paused.
    pub fn pause(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if !inner.master.is_playing {
                return Ok(());
            }
            let now = Instant::now();
            inner.master.reanchor(now);
            inner.master.is_playing = false;
            inner.master.rate = 1.0;
            if let Some(handle) = inner.rate_loop.take() {
                handle.abort();
            }
        }
        info!("playback paused");
        self.broadcast_now();
        Ok(())
    }

    /// Jump to an absolute position.
    pub fn seek(&self, time: f64) -> Result<()> {
        if !time.is_finite() || time < 0.0 {
            return Err(Error::InvalidInput(format!("invalid seek time: {time}")));
        }
        {
            let mut inner = self.inner.lock();
            inner.master.anchor_time = time;
            inner.master.anchor_wall = Instant::now();
        }
        info!(time, "seek");
        self.broadcast_now();
        Ok(())
    }

    /// Switch the room to another stream; playback restarts paused at 0.
    pub fn change_video(&self, video: &str) -> Result<()> {
        let stream = StreamId::parse(video)?;
        {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            inner.master.current_video = Some(stream.clone());
            inner.master.anchor_time = 0.0;
            inner.master.anchor_wall = now;
            inner.master.is_playing = false;
            inner.master.rate = 1.0;
            if let Some(handle) = inner.rate_loop.take() {
                handle.abort();
            }
        }
        info!(video = %stream, "video changed");
        self.broadcast_now();
        Ok(())
    }

    /// Force an immediate broadcast of the current state.
    pub fn sync_all(&self) {
        self.broadcast_now();
    }

    // Client bookkeeping -------------------------------------------------

    /// Register a freshly authenticated connection. While playing, the
    /// client's periodic sync timer starts immediately.
    pub fn register(&self, info: ClientInfo) {
        let id = info.id.clone();
        let interval = Duration::from_millis(self.config.default_interval_ms);
        let mut inner = self.inner.lock();
        let mut client = Client::new(info, interval);
        if inner.master.is_playing {
            client.sync_timer = Some(self.spawn_sync_timer(id.clone(), interval));
        }
        inner.clients.insert(id.clone(), client);
        let total = inner.clients.len();
        drop(inner);
        debug!(client = %id, total, "client registered");
    }

    /// Drop a client and cancel its pending sync timer.
    pub fn unregister(&self, id: &ClientId) {
        let table = {
            let mut inner = self.inner.lock();
            let Some(mut client) = inner.clients.remove(id) else {
                return;
            };
            client.cancel_timer();
            debug!(client = %id, total = inner.clients.len(), "client unregistered");
            Self::viewer_table_locked(&inner)
        };
        self.notify(|n| n.viewer_table(table));
    }

    /// Reset a client's missed-heartbeat counter.
    pub fn touch(&self, id: &ClientId) {
        if let Some(client) = self.inner.lock().clients.get_mut(id) {
            client.missed_heartbeats = 0;
        }
    }

    /// Advance every client's missed-heartbeat counter and return the
    /// clients that have exceeded the configured allowance.
    pub fn tick_heartbeats(&self) -> Vec<ClientId> {
        let mut inner = self.inner.lock();
        let limit = self.config.max_missed_heartbeats;
        inner
            .clients
            .iter_mut()
            .filter_map(|(id, client)| {
                client.missed_heartbeats += 1;
                (client.missed_heartbeats > limit).then(|| id.clone())
            })
            .collect()
    }

    /// Ingest a client's self-report: update its record, derive drift, and
    /// adapt its sync cadence. Operators are notified of the new table.
    pub fn client_time_update(
        &self,
        id: &ClientId,
        reported_time: f64,
        reported_rate: f64,
        reported_playing: bool,
        name: Option<String>,
    ) -> Result<()> {
        if !reported_time.is_finite() || reported_time < 0.0 {
            return Err(Error::InvalidInput(format!(
                "invalid reported time: {reported_time}"
            )));
        }
        if !reported_rate.is_finite() || reported_rate <= 0.0 {
            return Err(Error::InvalidInput(format!(
                "invalid reported rate: {reported_rate}"
            )));
        }

        let table = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let effective = inner.master.effective_time(now);
            let is_playing = inner.master.is_playing;
            let Some(client) = inner.clients.get_mut(id) else {
                return Err(Error::NotFound(format!("unknown client: {id}")));
            };

            let drift = reported_time - effective;
            client.last_reported_time = Some(reported_time);
            client.last_drift = Some(drift);
            client.reported_playing = reported_playing;
            client.reported_rate = reported_rate;
            if let Some(name) = name {
                client.name = sanitize_name(&name);
            }

            if is_playing {
                if let Some(new_interval) = adapt_interval(&self.config, client.sync_interval, drift)
                {
                    debug!(
                        client = %id,
                        drift,
                        from = ?client.sync_interval,
                        to = ?new_interval,
                        "sync interval adapted"
                    );
                    client.sync_interval = new_interval;
                    client.cancel_timer();
                    client.sync_timer = Some(self.spawn_sync_timer(id.clone(), new_interval));
                }
            }

            Self::viewer_table_locked(&inner)
        };
        self.notify(|n| n.viewer_table(table));
        Ok(())
    }

    // Read surface -------------------------------------------------------

    #[must_use]
    pub fn snapshot(&self) -> SyncSnapshot {
        self.inner.lock().master.snapshot(Instant::now())
    }

    #[must_use]
    pub fn effective_time(&self) -> f64 {
        self.inner.lock().master.effective_time(Instant::now())
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.inner.lock().master.is_playing
    }

    #[must_use]
    pub fn rate(&self) -> f64 {
        self.inner.lock().master.rate
    }

    #[must_use]
    pub fn current_video(&self) -> Option<StreamId> {
        self.inner.lock().master.current_video.clone()
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    #[must_use]
    pub fn viewer_table(&self) -> Vec<ViewerEntry> {
        Self::viewer_table_locked(&self.inner.lock())
    }

    fn viewer_table_locked(inner: &Inner) -> Vec<ViewerEntry> {
        let mut table: Vec<ViewerEntry> = inner
            .clients
            .values()
            .map(|client| ViewerEntry {
                role: client.role,
                name: client.name.clone(),
                ip: client.peer_addr.ip().to_string(),
                current_time: client.last_reported_time,
                drift: client.last_drift,
                is_playing: client.reported_playing,
                playback_rate: client.reported_rate,
            })
            .collect();
        table.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.ip.cmp(&b.ip)));
        table
    }

    /// Stop every background task owned by this component.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.rate_loop.take() {
            handle.abort();
        }
        if let Some(handle) = inner.broadcast_loop.take() {
            handle.abort();
        }
        for client in inner.clients.values_mut() {
            client.cancel_timer();
        }
    }

    // Broadcast & scheduling ---------------------------------------------

    /// Snapshot under the lock, reschedule every client's next sync
    /// relative to now (while playing), then hand the snapshot to the hub.
    fn broadcast_now(&self) {
        let snapshot = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let snapshot = inner.master.snapshot(now);
            if inner.master.is_playing {
                let ids: Vec<ClientId> = inner.clients.keys().cloned().collect();
                for id in ids {
                    let interval = inner.clients[&id].sync_interval;
                    let timer = self.spawn_sync_timer(id.clone(), interval);
                    if let Some(client) = inner.clients.get_mut(&id) {
                        client.cancel_timer();
                        client.sync_timer = Some(timer);
                    }
                }
            }
            snapshot
        };
        self.notify(|n| n.broadcast(snapshot));
    }

    fn spawn_sync_timer(&self, id: ClientId, delay: Duration) -> AbortHandle {
        let me = self.me.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(state) = me.upgrade() {
                state.sync_tick(&id);
            }
        })
        .abort_handle()
    }

    /// One per-client timer expiry: push a snapshot and rearm.
    fn sync_tick(&self, id: &ClientId) {
        let snapshot = {
            let mut inner = self.inner.lock();
            if !inner.master.is_playing {
                if let Some(client) = inner.clients.get_mut(id) {
                    client.sync_timer = None;
                }
                return;
            }
            let now = Instant::now();
            let snapshot = inner.master.snapshot(now);
            let Some(client) = inner.clients.get_mut(id) else {
                return;
            };
            let interval = client.sync_interval;
            client.sync_timer = Some(self.spawn_sync_timer(id.clone(), interval));
            snapshot
        };
        self.notify(|n| n.sync_client(id, snapshot));
    }

    fn start_loops(&self) {
        let mut inner = self.inner.lock();
        if inner.rate_loop.is_none() {
            let me = self.me.clone();
            let period = Duration::from_millis(self.config.rate_interval_ms);
            inner.rate_loop = Some(
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        let Some(state) = me.upgrade() else { break };
                        state.rate_tick();
                    }
                })
                .abort_handle(),
            );
        }
        if inner.broadcast_loop.is_none() {
            let me = self.me.clone();
            let period = Duration::from_millis(self.config.broadcast_interval_ms);
            inner.broadcast_loop = Some(
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        let Some(state) = me.upgrade() else { break };
                        if state.is_playing() {
                            state.broadcast_now();
                        }
                    }
                })
                .abort_handle(),
            );
        }
    }

    /// One rate-controller tick: nudge the master rate toward the quorum.
    fn rate_tick(&self) {
        let changed = {
            let mut inner = self.inner.lock();
            if !inner.master.is_playing {
                return;
            }
            let drifts: Vec<f64> = inner
                .clients
                .values()
                .filter_map(|c| c.last_drift)
                .collect();
            let old_rate = inner.master.rate;
            let new_rate = if drifts.is_empty() {
                self.config.max_rate
            } else {
                let total = drifts.len() as f64;
                let behind = drifts
                    .iter()
                    .filter(|d| **d < self.config.behind_threshold_secs)
                    .count();
                let ahead = drifts
                    .iter()
                    .filter(|d| **d > self.config.drift_low_secs)
                    .count();
                let behind_ratio = behind as f64 / total;

                if behind_ratio > 0.25 && old_rate > self.config.min_rate {
                    (old_rate - self.config.rate_step).max(self.config.min_rate)
                } else if (behind_ratio < 0.10 || ahead > behind)
                    && old_rate < self.config.max_rate
                {
                    (old_rate + self.config.rate_step).min(self.config.max_rate)
                } else {
                    old_rate
                }
            };

            if (new_rate - old_rate).abs() > f64::EPSILON {
                let now = Instant::now();
                inner.master.reanchor(now);
                inner.master.rate = new_rate;
                debug!(old_rate, new_rate, "rate adjusted");
                true
            } else {
                false
            }
        };
        if changed {
            self.broadcast_now();
        }
    }
}

/// Apply the per-client cadence rule; `None` means no change.
fn adapt_interval(config: &SyncConfig, interval: Duration, drift: f64) -> Option<Duration> {
    let min = Duration::from_millis(config.min_interval_ms);
    let max = Duration::from_millis(config.max_interval_ms);
    let step = Duration::from_millis(config.interval_step_ms);
    let magnitude = drift.abs();
    if magnitude > config.drift_high_secs && interval > min {
        Some(interval.saturating_sub(step).max(min))
    } else if magnitude < config.drift_low_secs && interval < max {
        Some((interval + step).min(max))
    } else {
        None
    }
}
