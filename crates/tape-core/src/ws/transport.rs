//! Single TLS WebSocket session owned by a background tokio task.
//!
//! Between [`WsTransport::run`] and [`WsTransport::stop`] the worker task
//! repeatedly (re-)establishes the connection and pumps I/O. The transport
//! holds no reconnection *policy* — failed attempts are retried after a short
//! fixed delay and every failure is reported through the error callback; the
//! connection supervisor decides when to restart or back off.
//!
//! Contract:
//! - exactly one `on_message` invocation per complete text frame, in order;
//! - `on_control` fires for each ping or pong control frame observed;
//! - `write` is safe from any context and buffers while disconnected, the
//!   buffer is flushed on the next successful connect;
//! - after `stop` returns, no callback fires.

use std::sync::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Notify, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::TapeError;

/// Callback invoked for each received text message.
pub type OnMessageCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Callback invoked for each transport-level error.
pub type OnErrorCallback = Arc<dyn Fn(TapeError) + Send + Sync>;

/// Callback invoked for each ping/pong control frame observed.
pub type OnControlCallback = Arc<dyn Fn(ControlFrame) + Send + Sync>;

/// Control frame kinds surfaced to the liveness watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame {
    Ping,
    Pong,
}

/// Callbacks wired into one transport worker.
#[derive(Clone)]
pub struct TransportCallbacks {
    pub on_message: OnMessageCallback,
    pub on_error: OnErrorCallback,
    pub on_control: OnControlCallback,
}

/// Delay before retrying a failed connect attempt. Deliberately short and
/// constant — restart pacing is the supervisor's job.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Cap on a single TLS + WebSocket handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// State shared between the handle and the worker task.
struct TransportShared {
    open: AtomicBool,
    /// Frames written while building the next outbound batch; drained by the
    /// worker when connected, kept across reconnects otherwise.
    outbox: Mutex<Vec<String>>,
    ping_requested: AtomicBool,
    wake: Notify,
}

/// A TLS WebSocket session with buffered writes and a restartable worker.
pub struct WsTransport {
    url: String,
    label: String,
    shared: Arc<TransportShared>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl WsTransport {
    /// Create a transport for `url`. Nothing connects until [`run`].
    ///
    /// `label` tags log lines (venue name).
    ///
    /// [`run`]: WsTransport::run
    pub fn new(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            label: label.into(),
            shared: Arc::new(TransportShared {
                open: AtomicBool::new(false),
                outbox: Mutex::new(Vec::new()),
                ping_requested: AtomicBool::new(false),
                wake: Notify::new(),
            }),
            worker: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
        }
    }

    /// Start the worker task. Fails if the worker is already running.
    pub fn run(&self, callbacks: TransportCallbacks) -> Result<(), TapeError> {
        let mut worker = self.worker.lock().expect("transport worker lock");
        if worker.is_some() {
            return Err(TapeError::Transport(format!(
                "[{}] transport worker is running already",
                self.label
            )));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = self.shared.clone();
        let url = self.url.clone();
        let label = self.label.clone();

        *worker = Some(tokio::spawn(async move {
            worker_loop(label, url, shared, callbacks, shutdown_rx).await;
        }));
        *self.shutdown_tx.lock().expect("transport shutdown lock") = Some(shutdown_tx);
        Ok(())
    }

    /// Queue a text frame. Sent immediately when the socket is up, buffered
    /// and flushed on the next connect otherwise.
    pub fn write(&self, frame: impl Into<String>) {
        self.shared
            .outbox
            .lock()
            .expect("transport outbox lock")
            .push(frame.into());
        self.shared.wake.notify_one();
    }

    /// Send a protocol-level ping if connected; no-op otherwise.
    pub fn ping(&self) {
        if self.is_open() {
            self.shared.ping_requested.store(true, Ordering::SeqCst);
            self.shared.wake.notify_one();
        }
    }

    /// Last observed socket state.
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Signal shutdown and wait for the worker to terminate. A normal close
    /// frame is sent if the socket is still open. Idempotent.
    pub async fn stop(&self) {
        let shutdown_tx = self.shutdown_tx.lock().expect("transport shutdown lock").take();
        if let Some(tx) = shutdown_tx {
            let _ = tx.send(true);
        }

        let worker = self.worker.lock().expect("transport worker lock").take();
        if let Some(task) = worker {
            let _ = task.await;
        }
        self.shared.open.store(false, Ordering::SeqCst);
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Worker loop — connects, flushes pending writes, pumps I/O, reconnects.
async fn worker_loop(
    label: String,
    url: String,
    shared: Arc<TransportShared>,
    callbacks: TransportCallbacks,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            info!("[{label}] transport shutdown requested");
            return;
        }

        debug!("[{label}] connecting to {url}");
        let ws_stream = match connect_ws(&url).await {
            Ok(s) => {
                info!("[{label}] connected");
                s
            }
            Err(e) => {
                (callbacks.on_error)(e);
                tokio::select! {
                    _ = tokio::time::sleep(CONNECT_RETRY_DELAY) => {},
                    _ = shutdown_rx.changed() => return,
                }
                continue;
            }
        };

        let (mut ws_write, mut ws_read) = ws_stream.split();

        // A ping requested while disconnected is stale — drop it.
        shared.ping_requested.store(false, Ordering::SeqCst);
        shared.open.store(true, Ordering::SeqCst);

        // Flush frames buffered while disconnected.
        let mut session_err =
            flush_outbox(&shared, &mut ws_write).await.err();

        // Main pump. Runs until shutdown, a read/write error, or peer close.
        while session_err.is_none() {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    let _ = ws_write.send(Message::Close(None)).await;
                    let _ = ws_write.close().await;
                    shared.open.store(false, Ordering::SeqCst);
                    info!("[{label}] transport closed on shutdown");
                    return;
                }

                msg = ws_read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            (callbacks.on_message)(&text);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = ws_write.send(Message::Pong(data)).await;
                            (callbacks.on_control)(ControlFrame::Ping);
                        }
                        Some(Ok(Message::Pong(_))) => {
                            (callbacks.on_control)(ControlFrame::Pong);
                        }
                        Some(Ok(Message::Close(frame))) => {
                            session_err = Some(TapeError::Transport(format!(
                                "[{label}] peer sent close frame: {frame:?}"
                            )));
                        }
                        Some(Err(e)) => {
                            session_err = Some(TapeError::Transport(format!(
                                "[{label}] read error: {e}"
                            )));
                        }
                        None => {
                            session_err = Some(TapeError::Transport(format!(
                                "[{label}] stream ended"
                            )));
                        }
                        _ => {} // Binary, raw frames — not part of any venue grammar here.
                    }
                }

                _ = shared.wake.notified() => {
                    session_err = flush_outbox(&shared, &mut ws_write).await.err();
                    if session_err.is_none()
                        && shared.ping_requested.swap(false, Ordering::SeqCst)
                    {
                        if let Err(e) = ws_write.send(Message::Ping(Vec::new().into())).await {
                            session_err = Some(TapeError::Transport(format!(
                                "[{label}] ping send error: {e}"
                            )));
                        }
                    }
                }
            }
        }

        // Mark closed *before* reporting so the supervisor's error path sees
        // a dead socket and raises the restart flag.
        shared.open.store(false, Ordering::SeqCst);
        if let Some(e) = session_err {
            warn!("[{label}] disconnected: {e}");
            (callbacks.on_error)(e);
        }
    }
}

/// Drain the pending-write buffer into the socket.
async fn flush_outbox<S>(shared: &TransportShared, ws_write: &mut S) -> Result<(), TapeError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    // Lock held only across the move; sends happen outside it.
    let pending: Vec<String> =
        std::mem::take(&mut *shared.outbox.lock().expect("transport outbox lock"));

    for frame in pending {
        ws_write
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| TapeError::Transport(format!("write error: {e}")))?;
    }
    Ok(())
}

/// Establish a TLS WebSocket connection with a bounded handshake.
async fn connect_ws(url: &str) -> Result<WsStream, TapeError> {
    let connect = tokio_tungstenite::connect_async(url);
    match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(TapeError::Transport(format!("connect to {url} failed: {e}"))),
        Err(_) => Err(TapeError::Transport(format!("connect to {url} timed out"))),
    }
}
