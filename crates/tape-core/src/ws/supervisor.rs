//! Per-venue connection supervision.
//!
//! [`StreamSupervisor`] owns one [`WsTransport`] and keeps it alive: it drives
//! authentication and subscription replay, watches for idle connections, and
//! restarts the transport when the venue adapter or the watchdog asks for it.
//!
//! The venue-specific behaviour is supplied as a [`StreamProtocol`] — a
//! capability object with the four hooks every streaming venue needs
//! (authenticate, subscribe, reset channel registry, decode a frame). The
//! protocol talks back to its supervisor through a [`StreamHandle`]: writing
//! frames, marking the venue welcome as received, requesting a restart.
//!
//! State machine per connection:
//!
//! ```text
//! DISCONNECTED → CONNECTING → CONNECTED → INIT_RECEIVED → AUTHENTICATED
//!      ↑                                                        │
//!      └──────────────── restart flagged ←──────────────────────┘
//! ```
//!
//! Every watch tick (3 s) while up: replay any unacknowledged subscriptions
//! (idempotent) and emit a ping. If nothing arrives for two ticks the
//! connection is considered dead and restarted. Three rapid restarts in a row
//! insert a one-tick delay before the next attempt.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::error::TapeError;
use crate::time_util;
use crate::types::ErrorHandler;
use crate::ws::transport::{ControlFrame, TransportCallbacks, WsTransport};

/// Supervisor tick period. The idle threshold is twice this.
pub const WATCH_PERIOD: Duration = Duration::from_secs(3);

/// Consecutive restarts allowed before pacing kicks in.
const MAX_RESTART_ATTEMPTS_NO_DELAY: u32 = 3;

/// Venue-specific protocol capability driven by a [`StreamSupervisor`].
pub trait StreamProtocol: Send + Sync + 'static {
    /// Whether the venue has no welcome message: `INIT_RECEIVED` holds as
    /// soon as the socket connects (Coinbase).
    fn init_is_immediate(&self) -> bool {
        false
    }

    /// Send authentication frames. Default: venue needs none.
    fn authenticate(&self, stream: &StreamHandle) -> Result<(), TapeError> {
        let _ = stream;
        Ok(())
    }

    /// Request every subscription that was asked for but is not yet in the
    /// active set. Must be idempotent: the supervisor calls this on every
    /// watch tick.
    fn subscribe_events(&self, stream: &StreamHandle) -> Result<(), TapeError>;

    /// Forget venue-acknowledged channel state. Pending requests survive so
    /// they are re-sent after the restart.
    fn reset_active_channels(&self);

    /// Decode one inbound text frame and dispatch it.
    ///
    /// A returned [`TapeError::Protocol`] is fatal for this supervisor; any
    /// other error is reported and the frame dropped.
    fn read_handler(&self, stream: &StreamHandle, raw: &str) -> Result<(), TapeError>;
}

/// The protocol's view of its supervisor.
#[derive(Clone)]
pub struct StreamHandle {
    core: Arc<SupervisorCore>,
}

impl StreamHandle {
    /// Queue a text frame on the venue connection.
    pub fn write(&self, frame: impl Into<String>) {
        self.core.transport.write(frame);
    }

    /// Record that the venue's welcome message arrived.
    pub fn mark_init_received(&self) {
        self.core.init_received.store(true, Ordering::SeqCst);
    }

    /// Whether the welcome has been seen on the current connection.
    pub fn is_init_received(&self) -> bool {
        self.core.init_received.load(Ordering::SeqCst)
    }

    /// Ask the supervisor to restart the transport.
    ///
    /// Wakes the watch task when the connection is established; before
    /// `INIT_RECEIVED` the flag is merely latched for later processing.
    pub fn request_restart(&self) {
        self.core.raise_restart_flag(self.is_init_received());
    }

    /// Whether a restart has been requested and not yet processed.
    pub fn restart_pending(&self) -> bool {
        self.core.restart_required.load(Ordering::SeqCst)
    }
}

/// Shared state between the supervisor handle, its watch task, and the
/// transport callbacks.
struct SupervisorCore {
    label: String,
    transport: WsTransport,
    protocol: Arc<dyn StreamProtocol>,
    error_handler: ErrorHandler,

    running: AtomicBool,
    fatal: AtomicBool,
    init_received: AtomicBool,
    authenticated: AtomicBool,
    restart_required: AtomicBool,
    restart_attempt: AtomicU32,
    last_inbound_ms: AtomicU64,
    wake: Notify,
}

impl SupervisorCore {
    fn handle(self: &Arc<Self>) -> StreamHandle {
        StreamHandle { core: self.clone() }
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn raise_restart_flag(&self, notify: bool) {
        if !self.restart_required.swap(true, Ordering::SeqCst) && notify {
            self.wake.notify_one();
        }
    }

    fn touch_last_inbound(&self) {
        self.last_inbound_ms.store(time_util::monotonic_ms(), Ordering::SeqCst);
    }

    fn is_idle_timed_out(&self) -> bool {
        let last = self.last_inbound_ms.load(Ordering::SeqCst);
        time_util::monotonic_ms().saturating_sub(last) > 2 * WATCH_PERIOD.as_millis() as u64
    }

    /// Report an error to the user handler. A dead socket raises the restart
    /// flag; a fatal protocol error halts the supervisor for good.
    fn report_error(&self, err: TapeError) {
        let fatal = err.is_fatal();
        (self.error_handler)(&err);

        if fatal {
            error!("[{}] fatal protocol error, supervisor halting: {err}", self.label);
            self.fatal.store(true, Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
            self.wake.notify_one();
            return;
        }

        if !self.transport.is_open() {
            self.restart_required.store(true, Ordering::SeqCst);
        }
    }

    fn transport_callbacks(self: &Arc<Self>) -> TransportCallbacks {
        // The callbacks hold weak references: the transport worker must not
        // keep the supervisor alive after shutdown.
        let on_message = {
            let core = Arc::downgrade(self);
            Arc::new(move |raw: &str| {
                let Some(core) = core.upgrade() else { return };
                core.touch_last_inbound();
                let handle = core.handle();
                if let Err(e) = core.protocol.read_handler(&handle, raw) {
                    core.report_error(e);
                }
            }) as Arc<dyn Fn(&str) + Send + Sync>
        };

        let on_error = {
            let core = Arc::downgrade(self);
            Arc::new(move |err: TapeError| {
                if let Some(core) = core.upgrade() {
                    core.report_error(err);
                }
            }) as Arc<dyn Fn(TapeError) + Send + Sync>
        };

        let on_control = {
            let core = Arc::downgrade(self);
            Arc::new(move |_frame: ControlFrame| {
                if let Some(core) = core.upgrade() {
                    core.touch_last_inbound();
                }
            }) as Arc<dyn Fn(ControlFrame) + Send + Sync>
        };

        TransportCallbacks { on_message, on_error, on_control }
    }

    /// (Re)start the transport worker with fresh callbacks.
    fn run_transport(self: &Arc<Self>) {
        self.touch_last_inbound();
        self.init_received.store(self.protocol.init_is_immediate(), Ordering::SeqCst);
        if let Err(e) = self.transport.run(self.transport_callbacks()) {
            self.report_error(e);
        }
    }

    /// Full restart sequence: stop the transport, clear connection state,
    /// drop venue-acknowledged channels, reconnect.
    async fn do_restart(self: &Arc<Self>) {
        info!("[{}] restarting connection", self.label);
        self.transport.stop().await;

        self.authenticated.store(false, Ordering::SeqCst);
        self.protocol.reset_active_channels();

        self.run_transport();
    }

    /// Wait for one watch period or an early wake-up.
    async fn wait_tick(&self) {
        let _ = tokio::time::timeout(WATCH_PERIOD, self.wake.notified()).await;
    }
}

/// The watch task: processes restart requests with pacing, drives
/// authentication and subscription replay, enforces the idle timeout.
async fn watch_loop(core: Arc<SupervisorCore>) {
    while core.running() {
        if core.restart_required.swap(false, Ordering::SeqCst) {
            let attempt = core.restart_attempt.fetch_add(1, Ordering::SeqCst);
            if attempt >= MAX_RESTART_ATTEMPTS_NO_DELAY {
                core.wait_tick().await;
                if !core.running() {
                    break;
                }
            }
            core.do_restart().await;
        }

        if core.transport.is_open() && core.init_received.load(Ordering::SeqCst) {
            let handle = core.handle();
            if core.authenticated.load(Ordering::SeqCst) {
                // Steady state: re-request anything unacknowledged, keep the
                // connection warm.
                if let Err(e) = core.protocol.subscribe_events(&handle) {
                    core.report_error(e);
                }
                core.transport.ping();
            } else {
                if let Err(e) = core.protocol.authenticate(&handle) {
                    core.report_error(e);
                    core.wait_tick().await;
                    continue;
                }
                core.authenticated.store(true, Ordering::SeqCst);

                if let Err(e) = core.protocol.subscribe_events(&handle) {
                    core.report_error(e);
                }

                core.restart_attempt.store(0, Ordering::SeqCst);
                core.wait_tick().await;
                continue;
            }
        }

        if core.is_idle_timed_out() {
            warn!("[{}] idle timeout, flagging restart", core.label);
            core.restart_required.store(true, Ordering::SeqCst);
            continue;
        }

        core.wait_tick().await;
    }

    // A fatal halt leaves no caller to stop the transport; do it here so the
    // worker does not keep reconnecting to a venue we gave up on.
    if core.fatal.load(Ordering::SeqCst) {
        core.transport.stop().await;
    }
}

/// Supervises one streaming venue connection.
pub struct StreamSupervisor {
    core: Arc<SupervisorCore>,
    watch_task: Option<tokio::task::JoinHandle<()>>,
}

impl StreamSupervisor {
    /// Create a supervisor without starting any task. Used directly by tests;
    /// production code calls [`StreamSupervisor::start`].
    pub fn new(
        label: impl Into<String>,
        url: impl Into<String>,
        protocol: Arc<dyn StreamProtocol>,
        error_handler: ErrorHandler,
    ) -> Self {
        let label = label.into();
        let init_immediate = protocol.init_is_immediate();
        let core = Arc::new(SupervisorCore {
            transport: WsTransport::new(label.clone(), url),
            label,
            protocol,
            error_handler,
            running: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
            init_received: AtomicBool::new(init_immediate),
            authenticated: AtomicBool::new(false),
            restart_required: AtomicBool::new(false),
            restart_attempt: AtomicU32::new(0),
            last_inbound_ms: AtomicU64::new(time_util::monotonic_ms()),
            wake: Notify::new(),
        });
        Self { core, watch_task: None }
    }

    /// Create the supervisor, connect the transport, and spawn the watch task.
    pub fn start(
        label: impl Into<String>,
        url: impl Into<String>,
        protocol: Arc<dyn StreamProtocol>,
        error_handler: ErrorHandler,
    ) -> Self {
        let mut sup = Self::new(label, url, protocol, error_handler);
        sup.core.running.store(true, Ordering::SeqCst);
        sup.core.run_transport();

        let core = sup.core.clone();
        sup.watch_task = Some(tokio::spawn(async move {
            watch_loop(core).await;
        }));
        sup
    }

    /// The handle venue protocols use to talk back to this supervisor.
    pub fn handle(&self) -> StreamHandle {
        self.core.handle()
    }

    /// Whether the connection is up and the venue welcome has been seen.
    pub fn is_working(&self) -> bool {
        self.core.init_received.load(Ordering::SeqCst) && self.core.running()
    }

    /// Stop the watch task and the transport. All joins are unconditional.
    pub async fn stop(&mut self) {
        self.core.running.store(false, Ordering::SeqCst);
        self.core.wake.notify_one();
        if let Some(task) = self.watch_task.take() {
            let _ = task.await;
        }
        self.core.transport.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct NullProtocol {
        immediate: bool,
        resets: AtomicUsize,
    }

    impl StreamProtocol for NullProtocol {
        fn init_is_immediate(&self) -> bool {
            self.immediate
        }

        fn subscribe_events(&self, _stream: &StreamHandle) -> Result<(), TapeError> {
            Ok(())
        }

        fn reset_active_channels(&self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }

        fn read_handler(&self, _stream: &StreamHandle, _raw: &str) -> Result<(), TapeError> {
            Ok(())
        }
    }

    fn null_supervisor(immediate: bool) -> StreamSupervisor {
        StreamSupervisor::new(
            "test",
            "wss://example.invalid/ws",
            Arc::new(NullProtocol { immediate, ..Default::default() }),
            Arc::new(|_e| {}),
        )
    }

    #[test]
    fn restart_is_latched_before_init() {
        let sup = null_supervisor(false);
        let handle = sup.handle();
        assert!(!handle.is_init_received());
        assert!(!handle.restart_pending());

        handle.request_restart();
        assert!(handle.restart_pending());
    }

    #[test]
    fn init_marker_round_trips() {
        let sup = null_supervisor(false);
        let handle = sup.handle();
        handle.mark_init_received();
        assert!(handle.is_init_received());
    }

    #[test]
    fn immediate_init_starts_marked() {
        let sup = null_supervisor(true);
        assert!(sup.handle().is_init_received());
    }

    #[test]
    fn idle_timeout_uses_double_watch_period() {
        let sup = null_supervisor(false);
        assert!(!sup.core.is_idle_timed_out());

        let now = time_util::monotonic_ms();
        let stale = now.saturating_sub(2 * WATCH_PERIOD.as_millis() as u64 + 1_000);
        sup.core.last_inbound_ms.store(stale, Ordering::SeqCst);
        assert!(sup.core.is_idle_timed_out());
    }

    #[test]
    fn fatal_error_halts_supervisor() {
        let sup = null_supervisor(false);
        sup.core.running.store(true, Ordering::SeqCst);
        sup.core.report_error(TapeError::Protocol("unexpected api version".into()));
        assert!(!sup.core.running());
        assert!(sup.core.fatal.load(Ordering::SeqCst));
    }

    #[test]
    fn nonfatal_error_flags_restart_when_socket_closed() {
        let sup = null_supervisor(false);
        sup.core.running.store(true, Ordering::SeqCst);
        sup.core.report_error(TapeError::Transport("reset by peer".into()));
        assert!(sup.core.running());
        assert!(sup.core.restart_required.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stop_joins_unstarted_supervisor() {
        let mut sup = null_supervisor(false);
        sup.stop().await;
    }

    #[tokio::test]
    async fn restart_clears_session_state_and_channel_registry() {
        let protocol = Arc::new(NullProtocol::default());
        let mut sup = StreamSupervisor::new(
            "test",
            "wss://example.invalid/ws",
            protocol.clone(),
            Arc::new(|_e| {}),
        );
        sup.core.init_received.store(true, Ordering::SeqCst);
        sup.core.authenticated.store(true, Ordering::SeqCst);

        sup.core.do_restart().await;

        assert!(!sup.core.init_received.load(Ordering::SeqCst));
        assert!(!sup.core.authenticated.load(Ordering::SeqCst));
        assert_eq!(protocol.resets.load(Ordering::SeqCst), 1);
        // The restart started a fresh transport worker.
        assert!(sup.core.transport.run(sup.core.transport_callbacks()).is_err());
        sup.stop().await;
    }
}
