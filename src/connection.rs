//! Connection supervisor for the Discord gateway.
//!
//! Owns one logical session: login, heartbeat diagnosis, exponential-backoff
//! forced reconnect, and the readiness barrier that gates the event worker's
//! outbound work. The reconnect loop is single-flight; requests that arrive
//! while one is running collapse into the pending-reason flag.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use serenity::all::{Client, EventHandler, GatewayError, GatewayIntents, Http, ShardManager};
use tokio::sync::Notify;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::events::backoff_ms;

/// Round-trip ping above this for three consecutive heartbeat ticks forces
/// a reconnect.
const PING_LIMIT: Duration = Duration::from_secs(15);

const MAX_RECONNECT_ATTEMPT: u32 = 10;

/// Reconnect waits follow the retry backoff law.
pub fn reconnect_delay_ms(attempt: u32) -> u64 {
    backoff_ms(attempt)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Starting,
    Ready,
    Reconnecting,
    Stopping,
}

impl ConnState {
    fn as_str(&self) -> &'static str {
        match self {
            ConnState::Starting => "starting",
            ConnState::Ready => "ready",
            ConnState::Reconnecting => "reconnecting",
            ConnState::Stopping => "stopping",
        }
    }
}

pub struct ConnectionSupervisor {
    token: String,
    heartbeat_interval: Duration,
    reconnect_grace: Duration,
    state: StdMutex<ConnState>,
    ready_tx: watch::Sender<bool>,
    http: StdRwLock<Option<Arc<Http>>>,
    shard_manager: StdMutex<Option<Arc<ShardManager>>>,
    client_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    reconnect_notify: Notify,
    pending_reason: StdMutex<Option<String>>,
    attempt: AtomicU32,
    slow_pings: AtomicU32,
    reconnect_in_flight: AtomicBool,
    /// Set while a client is being torn down on purpose, so its task's exit
    /// does not schedule another reconnect.
    expected_stop: AtomicBool,
    cancel: CancellationToken,
}

impl ConnectionSupervisor {
    pub fn new(
        token: &str,
        heartbeat_interval: Duration,
        reconnect_grace: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (ready_tx, _) = watch::channel(false);
        Arc::new(Self {
            token: token.to_string(),
            heartbeat_interval,
            reconnect_grace,
            state: StdMutex::new(ConnState::Starting),
            ready_tx,
            http: StdRwLock::new(None),
            shard_manager: StdMutex::new(None),
            client_task: tokio::sync::Mutex::new(None),
            reconnect_notify: Notify::new(),
            pending_reason: StdMutex::new(None),
            attempt: AtomicU32::new(0),
            slow_pings: AtomicU32::new(0),
            reconnect_in_flight: AtomicBool::new(false),
            expected_stop: AtomicBool::new(false),
            cancel,
        })
    }

    fn intents() -> GatewayIntents {
        GatewayIntents::DIRECT_MESSAGES | GatewayIntents::MESSAGE_CONTENT
    }

    /// Spawn the supervision loop and the heartbeat timer. Returns once the
    /// tasks are running; readiness is observed via [`wait_until_ready`].
    pub fn spawn<H: EventHandler + 'static>(self: &Arc<Self>, handler: Arc<H>) {
        let sup = Arc::clone(self);
        tokio::spawn(async move { sup.supervise(handler).await });

        let sup = Arc::clone(self);
        tokio::spawn(async move { sup.heartbeat_loop().await });
    }

    async fn supervise<H: EventHandler + 'static>(self: Arc<Self>, handler: Arc<H>) {
        if let Err(e) = self.launch(Arc::clone(&handler)).await {
            error!("Initial Discord login failed: {}", e);
            self.request_reconnect("initial login failed");
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.enter_stopping();
                    self.teardown_client().await;
                    break;
                }
                _ = self.reconnect_notify.notified() => {
                    if self.is_stopping() {
                        break;
                    }
                    let reason = self
                        .pending_reason
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .take();
                    // A wake with no reason while healthy is a leftover
                    // permit from a request that a reconnect already served.
                    let Some(reason) = reason else {
                        if self.is_ready() {
                            continue;
                        }
                        self.reconnect_loop(&handler, "gateway not ready").await;
                        continue;
                    };
                    self.reconnect_loop(&handler, &reason).await;
                }
            }
        }
    }

    /// Build a client, stash its HTTP and shard handles, and run the
    /// gateway in a background task.
    async fn launch<H: EventHandler + 'static>(
        self: &Arc<Self>,
        handler: Arc<H>,
    ) -> anyhow::Result<()> {
        let client = Client::builder(&self.token, Self::intents())
            .event_handler_arc(handler)
            .await?;

        {
            let mut http = self.http.write().unwrap_or_else(|e| e.into_inner());
            *http = Some(client.http.clone());
        }
        {
            let mut sm = self.shard_manager.lock().unwrap_or_else(|e| e.into_inner());
            *sm = Some(client.shard_manager.clone());
        }

        let sup = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut client = client;
            if let Err(e) = client.start().await {
                warn!("Discord gateway stopped: {}", e);
                if matches!(
                    e,
                    serenity::Error::Gateway(GatewayError::InvalidAuthentication)
                ) {
                    error!("Discord token invalidated; supervisor stopping");
                    sup.enter_stopping();
                    return;
                }
            }
            if !sup.is_stopping() && !sup.expected_stop.load(Ordering::SeqCst) {
                sup.request_reconnect("gateway task ended");
            }
        });

        let mut task = self.client_task.lock().await;
        *task = Some(handle);
        Ok(())
    }

    /// Single-flight reconnect: backoff, destroy, re-login, wait for ready
    /// within the grace window; loop until ready or stopping.
    async fn reconnect_loop<H: EventHandler + 'static>(
        self: &Arc<Self>,
        handler: &Arc<H>,
        reason: &str,
    ) {
        if self.reconnect_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }
        self.transition(ConnState::Reconnecting);
        self.ready_tx.send_replace(false);
        warn!(reason, "Forcing Discord reconnect");

        loop {
            if self.is_stopping() || self.cancel.is_cancelled() {
                break;
            }

            // Requests that arrived while this loop was running collapse
            // into the iteration instead of scheduling another reconnect.
            if let Some(collapsed) = self
                .pending_reason
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
            {
                info!(reason = %collapsed, "Collapsed reconnect request into in-flight loop");
            }

            let attempt = self
                .attempt
                .load(Ordering::SeqCst)
                .saturating_add(1)
                .min(MAX_RECONNECT_ATTEMPT);
            self.attempt.store(attempt, Ordering::SeqCst);
            let delay = reconnect_delay_ms(attempt);
            info!(attempt, delay_ms = delay, "Reconnect attempt scheduled");
            tokio::time::sleep(Duration::from_millis(delay)).await;

            self.teardown_client().await;
            if let Err(e) = self.launch(Arc::clone(handler)).await {
                warn!(attempt, "Re-login failed: {}", e);
                continue;
            }

            if self.wait_until_ready(self.reconnect_grace).await {
                info!("Reconnect succeeded");
                break;
            }
            warn!(
                grace_secs = self.reconnect_grace.as_secs(),
                "Gateway not ready within grace window"
            );
        }

        self.reconnect_in_flight.store(false, Ordering::SeqCst);
    }

    async fn teardown_client(&self) {
        self.expected_stop.store(true, Ordering::SeqCst);

        let sm = {
            let guard = self.shard_manager.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        if let Some(sm) = sm {
            sm.shutdown_all().await;
        }

        let handle = {
            let mut task = self.client_task.lock().await;
            task.take()
        };
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!("Gateway task did not stop in time");
            }
        }

        self.expected_stop.store(false, Ordering::SeqCst);
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if self.is_stopping() {
                break;
            }
            // A reconnect already owns the connection.
            if self.reconnect_in_flight.load(Ordering::SeqCst) {
                continue;
            }

            if !self.is_ready() {
                self.request_reconnect("heartbeat: gateway not ready");
                continue;
            }

            match self.gateway_latency().await {
                Some(latency) if latency > PING_LIMIT => {
                    let slow = self.slow_pings.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(latency_ms = latency.as_millis() as u64, slow, "Gateway ping degraded");
                    if slow >= 3 {
                        self.slow_pings.store(0, Ordering::SeqCst);
                        self.request_reconnect("heartbeat: ping above limit for 3 ticks");
                    }
                }
                _ => self.slow_pings.store(0, Ordering::SeqCst),
            }
        }
    }

    async fn gateway_latency(&self) -> Option<Duration> {
        let sm = {
            let guard = self.shard_manager.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        }?;
        let runners = sm.runners.lock().await;
        runners.values().filter_map(|info| info.latency).max()
    }

    /// Called by the gateway event handler when the session reports ready.
    pub fn notify_ready(&self) {
        self.attempt.store(0, Ordering::SeqCst);
        self.slow_pings.store(0, Ordering::SeqCst);
        self.transition(ConnState::Ready);
        self.ready_tx.send_replace(true);
    }

    /// Called by the gateway event handler on shard disconnect.
    pub fn notify_disconnected(&self) {
        self.ready_tx.send_replace(false);
        self.request_reconnect("shard disconnected");
    }

    pub fn request_reconnect(&self, reason: &str) {
        if self.is_stopping() {
            return;
        }
        {
            let mut pending = self.pending_reason.lock().unwrap_or_else(|e| e.into_inner());
            // Keep the first reason; later ones collapse into it.
            pending.get_or_insert_with(|| reason.to_string());
        }
        self.reconnect_notify.notify_one();
    }

    /// Readiness barrier. Returns immediately when ready; otherwise waits
    /// for the next ready transition, or `false` on timeout/stop.
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        if self.is_ready() {
            return true;
        }
        if self.is_stopping() {
            return false;
        }

        let mut rx = self.ready_tx.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            loop {
                if rx.changed().await.is_err() {
                    return false;
                }
                if *rx.borrow() {
                    return true;
                }
                if self.is_stopping() {
                    return false;
                }
            }
        })
        .await;
        waited.unwrap_or(false)
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    pub fn is_stopping(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state == ConnState::Stopping
    }

    fn enter_stopping(&self) {
        self.transition(ConnState::Stopping);
        // Wake waiters so they observe `false`.
        self.ready_tx.send_replace(false);
    }

    fn transition(&self, next: ConnState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == ConnState::Stopping {
            return;
        }
        if *state != next {
            info!(from = state.as_str(), to = next.as_str(), "Connection state");
            *state = next;
        }
    }

    /// REST handle for sends, fetches, and reactions. Fails while the first
    /// login is still in flight.
    pub fn http(&self) -> anyhow::Result<Arc<Http>> {
        let guard = self.http.read().unwrap_or_else(|e| e.into_inner());
        guard
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Discord HTTP client not ready"))
    }
}
