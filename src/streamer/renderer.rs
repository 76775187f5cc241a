// --- Renderer streamer (kiosk browser) ---------------------------------------
//
// Images, html pages and (when omxplayer is not in use) videos are shown by the
// page connected on the viewer socket. Every operation is a request envelope
// pushed to that page; the page answers with an envelope whose `event` echoes
// the method. The viewer inbound pump forwards those answers to us on `acks`.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{is_quit, lookup, OpenOptions};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::item::Item;
use crate::message::Message;

/// How long the page may take to acknowledge an operation.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Argument keys `open` fills in itself; cues cannot override them.
const OPEN_ARGS: &[&str] = &["file", "type", "audio", "position", "session"];

const KIOSK_FLAGS: &[&str] = &[
    "--window-size=1920,1080",
    "--window-position=0,0",
    "--kiosk",
    "--incognito",
    "--disable-infobars",
    "--noerrdialogs",
    "--no-first-run",
];

pub struct RendererStreamer {
    viewer: Arc<Connection>,
    acks: mpsc::Receiver<Message>,
    session: Option<Uuid>,
    ack_timeout: Duration,
    browser: Option<Child>,
}

impl RendererStreamer {
    pub fn new(viewer: Arc<Connection>, acks: mpsc::Receiver<Message>) -> Self {
        Self {
            viewer,
            acks,
            session: None,
            ack_timeout: ACK_TIMEOUT,
            browser: None,
        }
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// The page reported that `session` finished on its own.
    pub fn finish(&mut self, session: Option<Uuid>) -> Option<Uuid> {
        match (self.session, session) {
            (Some(_), None) => self.session.take(),
            (Some(current), Some(id)) if current == id => self.session.take(),
            _ => None,
        }
    }

    /// Start the kiosk browser pointed at the viewer page.
    pub fn launch_browser(&mut self, program: &str, url: &str) -> Result<()> {
        if let Some(child) = self.browser.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                debug!("kiosk browser already running");
                return Ok(());
            }
        }

        let child = Command::new(program)
            .args(KIOSK_FLAGS)
            .arg(url)
            .env("DISPLAY", ":0.0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ProcessSpawnFailed(format!("{program}: {e}")))?;

        info!("kiosk browser started: {program} {url}");
        self.browser = Some(child);
        Ok(())
    }

    /// Wait for a page to connect on the viewer socket.
    pub async fn wait_for_viewer(&self, timeout: Duration) -> bool {
        let mut generation = self.viewer.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.viewer.is_active().await {
                return true;
            }
            match tokio::time::timeout_at(deadline, generation.changed()).await {
                Ok(Ok(())) => continue,
                _ => return self.viewer.is_active().await,
            }
        }
    }

    /// Push one operation and wait for its acknowledgement.
    async fn request(&mut self, msg: Message) -> Result<Message> {
        // Anything already queued answers an earlier, abandoned request.
        while let Ok(stale) = self.acks.try_recv() {
            debug!("dropping stale viewer answer '{}'", stale.event);
        }

        let method = msg.method.clone();
        self.viewer.send(msg).await?;

        let deadline = tokio::time::Instant::now() + self.ack_timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.acks.recv()).await {
                Err(_) => {
                    return Err(Error::Renderer(format!(
                        "viewer did not answer '{method}' within {:?}",
                        self.ack_timeout
                    )))
                }
                Ok(None) => return Err(Error::ConnectionBroken("viewer answer channel closed".into())),
                Ok(Some(ack)) if ack.event == method => {
                    return if ack.success {
                        Ok(ack)
                    } else {
                        Err(Error::Renderer(ack.text()))
                    };
                }
                Ok(Some(other)) => debug!("ignoring viewer message '{}' while waiting for '{method}'", other.event),
            }
        }
    }

    fn operation(&self, method: &str) -> Message {
        let mut msg = Message::request("viewer", method);
        if let Some(id) = self.session_id() {
            msg = msg.with_arg("session", id.to_string());
        }
        msg
    }

    async fn session_request(&mut self, msg: Message) -> Result<()> {
        if self.session.is_none() {
            return Ok(());
        }
        self.request(msg).await.map(|_| ())
    }

    pub async fn open(&mut self, item: &Item, opts: OpenOptions) -> Result<Uuid> {
        let id = Uuid::new_v4();

        let mut msg = Message::request("viewer", "open")
            .with_arg("file", item.file_name())
            .with_arg("type", item.kind.as_str())
            .with_arg("audio", item.audio_name().unwrap_or_default())
            .with_arg("position", opts.position.as_secs().to_string())
            .with_arg("session", id.to_string());
        for (key, value) in &item.cues {
            if OPEN_ARGS.contains(&key.as_str()) {
                warn!("'{}': cue '{key}' clashes with an open argument; skipped", item.name());
                continue;
            }
            msg = msg.with_arg(key, value.clone());
        }
        msg.message = serde_json::to_value(item.summary()).unwrap_or_default();

        self.request(msg).await?;
        self.session = Some(id);
        info!("viewer showing '{}'", item.name());
        Ok(id)
    }

    /// Black screen with no audio; used before a decoder process takes over.
    pub async fn blank(&mut self) -> Result<()> {
        self.session = None;
        if !self.viewer.is_active().await {
            return Ok(());
        }
        self.request(Message::request("viewer", "blank")).await.map(|_| ())
    }

    pub async fn close(&mut self) -> Result<()> {
        if self.session.is_none() {
            return Ok(());
        }
        let msg = self.operation("close");
        self.session = None;
        if !self.viewer.is_active().await {
            return Ok(());
        }
        self.request(msg).await.map(|_| ())
    }

    pub async fn play(&mut self) -> Result<()> {
        let msg = self.operation("play");
        self.session_request(msg).await
    }

    pub async fn pause(&mut self) -> Result<()> {
        let msg = self.operation("pause");
        self.session_request(msg).await
    }

    pub async fn playback_rate(&mut self, speed: i32) -> Result<()> {
        let msg = self.operation("playbackRate").with_arg("value", speed.to_string());
        self.session_request(msg).await
    }

    pub async fn seek(&mut self, direction: i32) -> Result<()> {
        let msg = self.operation("seek").with_arg("direction", direction.to_string());
        self.session_request(msg).await
    }

    pub async fn chapter(&mut self, offset: i32) -> Result<()> {
        let msg = self.operation("chapter").with_arg("index", offset.to_string());
        self.session_request(msg).await
    }

    pub async fn volume(&mut self, level: i32) -> Result<()> {
        let msg = self.operation("volume").with_arg("level", level.to_string());
        self.session_request(msg).await
    }

    pub async fn audio_stream(&mut self, index: i32) -> Result<()> {
        let msg = self.operation("audioStream").with_arg("index", index.to_string());
        self.session_request(msg).await
    }

    pub async fn subtitle_stream(&mut self, index: i32) -> Result<()> {
        let msg = self.operation("subtitleStream").with_arg("index", index.to_string());
        self.session_request(msg).await
    }

    pub async fn command(&mut self, name: &str) -> Result<()> {
        lookup(name)?;
        if is_quit(name) {
            return self.close().await;
        }
        let msg = self.operation("command").with_arg("command", name);
        self.session_request(msg).await
    }
}

impl Drop for RendererStreamer {
    fn drop(&mut self) {
        if let Some(mut child) = self.browser.take() {
            if let Err(e) = child.start_kill() {
                warn!("failed to stop kiosk browser: {e}");
            }
        }
    }
}
