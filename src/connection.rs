// --- Duplex live connection -------------------------------------------------
//
// One `Connection` exists per endpoint ("viewer", "control"). Browsers come and
// go; every successful websocket upgrade replaces the transport underneath and
// the newest client wins. The previous client is told why it was dropped before
// its socket is closed.
//
// Each transport gets its own writer and reader task plus fresh queues. Only
// `upgrade` swaps transports; the loops only ever clear their own `active` flag.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::message::Message;

/// Deadline for a single frame write.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);
/// A client that sends nothing (pongs included) for this long is gone.
pub const PONG_WAIT: Duration = Duration::from_secs(60);
/// Must be shorter than `PONG_WAIT` so healthy clients always answer in time.
pub const PING_PERIOD: Duration = Duration::from_secs(54);

const QUEUE_DEPTH: usize = 64;

pub const TAKEOVER_NOTICE: &str =
    "Another device has taken over the connection. Login again to take it back.";

pub struct Connection {
    name: &'static str,
    current: Mutex<Option<Transport>>,
    upgrade_lock: Mutex<()>,
    generation: watch::Sender<u64>,
}

struct Transport {
    id: Uuid,
    active: Arc<AtomicBool>,
    outbound: mpsc::Sender<Message>,
    inbound: Arc<Mutex<mpsc::Receiver<Message>>>,
    takeover: Option<oneshot::Sender<Message>>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl Connection {
    pub fn new(name: &'static str) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            name,
            current: Mutex::new(None),
            upgrade_lock: Mutex::new(()),
            generation,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Install a new transport, displacing the current one.
    ///
    /// In production `sink`/`stream` are the two halves of an axum `WebSocket`.
    pub async fn upgrade<Si, St, E>(&self, sink: Si, stream: St)
    where
        Si: Sink<WsMessage> + Unpin + Send + 'static,
        Si::Error: Display + Send,
        St: Stream<Item = std::result::Result<WsMessage, E>> + Unpin + Send + 'static,
        E: Display + Send + 'static,
    {
        let _upgrading = self.upgrade_lock.lock().await;

        let previous = self.current.lock().await.take();
        if let Some(old) = previous {
            self.retire(old).await;
        }

        let id = Uuid::new_v4();
        let active = Arc::new(AtomicBool::new(true));
        let (out_tx, out_rx) = mpsc::channel(QUEUE_DEPTH);
        let (in_tx, in_rx) = mpsc::channel(QUEUE_DEPTH);
        let (takeover_tx, takeover_rx) = oneshot::channel();

        let writer = tokio::spawn(write_loop(self.name, sink, out_rx, takeover_rx, active.clone()));
        let reader = tokio::spawn(read_loop(self.name, stream, in_tx, active.clone()));

        *self.current.lock().await = Some(Transport {
            id,
            active,
            outbound: out_tx,
            inbound: Arc::new(Mutex::new(in_rx)),
            takeover: Some(takeover_tx),
            writer,
            reader,
        });
        self.generation.send_modify(|g| *g += 1);

        info!("{} connection established ({id})", self.name);
    }

    async fn retire(&self, mut old: Transport) {
        if old.active.load(Ordering::SeqCst) {
            info!("{} connection {} taken over by a new client", self.name, old.id);
            if let Some(tx) = old.takeover.take() {
                let _ = tx.send(Message::disconnect(TAKEOVER_NOTICE));
            }
        }
        // Dropping the sender (when inactive) or the notice both end the writer.
        drop(old.takeover.take());
        drop(old.outbound);

        if tokio::time::timeout(WRITE_WAIT, &mut old.writer).await.is_err() {
            warn!("{} writer did not finish within {WRITE_WAIT:?}; aborting", self.name);
            old.writer.abort();
        }
        old.reader.abort();
        old.active.store(false, Ordering::SeqCst);
    }

    pub async fn is_active(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| t.active.load(Ordering::SeqCst))
    }

    /// Queue a message for the connected client.
    pub async fn send(&self, msg: Message) -> Result<()> {
        let outbound = {
            let current = self.current.lock().await;
            current
                .as_ref()
                .filter(|t| t.active.load(Ordering::SeqCst))
                .map(|t| t.outbound.clone())
        };
        let outbound =
            outbound.ok_or_else(|| Error::ConnectionBroken(format!("{} client is not connected", self.name)))?;
        outbound
            .send(msg)
            .await
            .map_err(|_| Error::ConnectionBroken(format!("{} connection closed", self.name)))
    }

    /// Observers wait on this to learn about new transports.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Next message from whichever client is connected, waiting across
    /// upgrades. Returns `None` only when the connection itself is gone.
    pub async fn next_inbound(&self, generation: &mut watch::Receiver<u64>) -> Option<Message> {
        loop {
            generation.borrow_and_update();
            let inbound = self.current.lock().await.as_ref().map(|t| t.inbound.clone());

            if let Some(inbound) = inbound {
                let mut rx = inbound.lock().await;
                tokio::select! {
                    msg = rx.recv() => {
                        if let Some(msg) = msg {
                            return Some(msg);
                        }
                    }
                    changed = generation.changed() => {
                        if changed.is_err() {
                            return None;
                        }
                        continue;
                    }
                }
            }

            // Transport finished (or none yet): wait for the next upgrade.
            if generation.changed().await.is_err() {
                return None;
            }
        }
    }
}

async fn write_frame<Si>(sink: &mut Si, frame: WsMessage) -> std::result::Result<(), String>
where
    Si: Sink<WsMessage> + Unpin,
    Si::Error: Display,
{
    match tokio::time::timeout(WRITE_WAIT, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("write timed out after {WRITE_WAIT:?}")),
    }
}

fn close_frame() -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: "".into(),
    }))
}

async fn write_loop<Si>(
    name: &'static str,
    mut sink: Si,
    mut outbound: mpsc::Receiver<Message>,
    mut takeover: oneshot::Receiver<Message>,
    active: Arc<AtomicBool>,
) where
    Si: Sink<WsMessage> + Unpin + Send,
    Si::Error: Display,
{
    let start = tokio::time::Instant::now() + PING_PERIOD;
    let mut ping = tokio::time::interval_at(start, PING_PERIOD);

    loop {
        tokio::select! {
            biased;

            notice = &mut takeover => {
                if let Ok(notice) = notice {
                    match serde_json::to_string(&notice) {
                        Ok(text) => {
                            if let Err(e) = write_frame(&mut sink, WsMessage::Text(text)).await {
                                debug!("{name}: failed to deliver takeover notice: {e}");
                            }
                        }
                        Err(e) => warn!("{name}: can't encode takeover notice: {e}"),
                    }
                }
                let _ = write_frame(&mut sink, close_frame()).await;
                break;
            }

            msg = outbound.recv() => {
                let Some(msg) = msg else {
                    let _ = write_frame(&mut sink, close_frame()).await;
                    break;
                };
                let text = match serde_json::to_string(&msg) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("{name}: dropping unencodable message: {e}");
                        continue;
                    }
                };
                if let Err(e) = write_frame(&mut sink, WsMessage::Text(text)).await {
                    warn!("{name}: write failed: {e}");
                    break;
                }
            }

            _ = ping.tick() => {
                if let Err(e) = write_frame(&mut sink, WsMessage::Ping(Vec::new())).await {
                    warn!("{name}: ping failed: {e}");
                    break;
                }
            }
        }
    }

    active.store(false, Ordering::SeqCst);
    let _ = tokio::time::timeout(WRITE_WAIT, sink.close()).await;
    debug!("{name}: writer finished");
}

async fn read_loop<St, E>(
    name: &'static str,
    mut stream: St,
    inbound: mpsc::Sender<Message>,
    active: Arc<AtomicBool>,
) where
    St: Stream<Item = std::result::Result<WsMessage, E>> + Unpin + Send,
    E: Display,
{
    loop {
        let frame = match tokio::time::timeout(PONG_WAIT, stream.next()).await {
            Err(_) => {
                warn!("{name}: nothing received for {PONG_WAIT:?}; dropping client");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!("{name}: read error: {e}");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let text = match frame {
            WsMessage::Text(t) => t,
            WsMessage::Binary(b) => match String::from_utf8(b) {
                Ok(t) => t,
                Err(_) => {
                    warn!("{name}: skipping non-UTF-8 binary frame");
                    continue;
                }
            },
            WsMessage::Close(_) => break,
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
        };

        match serde_json::from_str::<Message>(&text) {
            Ok(msg) => {
                if inbound.send(msg).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!("{name}: skipping malformed frame: {e}"),
        }
    }

    active.store(false, Ordering::SeqCst);
    debug!("{name}: reader finished");
}
