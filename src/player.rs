// --- Player (playback orchestrator) -----------------------------------------
//
// The player is a single task that owns the playlist, both streamers and the
// active playback session. Everything else (HTTP API, websocket pumps, remote,
// directory watcher) talks to it through `PlayerHandle`, so requests are
// handled strictly one after another:
//   - a start that preempts a running item finishes the quit handshake with
//     the old decoder before the new one is spawned
//   - a natural end is only acted on if it belongs to the session that is
//     still current; ends of sessions we already replaced are dropped
//   - rebuilds never interleave with starts
//
// State is published on a watch channel for status polling.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{self, StreamerKind};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::item::{ItemSummary, ItemType};
use crate::message::Message;
use crate::playlist::Playlist;
use crate::streamer::{is_quit, lookup, OpenOptions, PipeStreamer, RendererStreamer, SessionEnded, Streamer};

/// How long first run waits for the kiosk browser to connect.
const VIEWER_WAIT: Duration = Duration::from_secs(15);

const REQUEST_QUEUE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    Idle,
    Starting,
    Playing,
    Quitting,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayerStatus {
    pub state: PlayerState,
    pub current: Option<String>,
    pub session: Option<Uuid>,
    pub live_processes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Index(usize),
    Name(String),
}

/// Operations forwarded to whichever streamer is playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Play,
    Pause,
    PlaybackRate(i32),
    Seek(i32),
    Chapter(i32),
    Volume(i32),
    AudioStream(i32),
    SubtitleStream(i32),
}

pub struct PlayerOptions {
    pub streamer: StreamerKind,
    /// Empty disables the kiosk browser.
    pub kiosk_browser: String,
    pub viewer_url: String,
    /// `None` disables persistence of the last played item.
    pub db_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Pipe,
    Renderer,
}

#[derive(Debug)]
struct Session {
    id: Uuid,
    item: String,
    backend: Backend,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Request {
    Start { target: Target, position: Duration, reply: Reply<ItemSummary> },
    Next { reply: Reply<ItemSummary> },
    Previous { reply: Reply<ItemSummary> },
    SendCommand { name: String, reply: Reply<()> },
    Capability { op: Capability, reply: Reply<()> },
    GetCurrent { reply: Reply<Option<(usize, ItemSummary)>> },
    SetCurrent { index: usize, reply: Reply<ItemSummary> },
    GetItems { reply: Reply<Vec<ItemSummary>> },
    Rebuild { reply: Option<Reply<usize>> },
    FirstRun { reply: Reply<Option<ItemSummary>> },
    RendererEnded { session: Option<Uuid> },
    Shutdown { reply: oneshot::Sender<()> },
}

pub struct Player {
    playlist: Playlist,
    pipe: PipeStreamer,
    renderer: RendererStreamer,
    session: Option<Session>,
    state: PlayerState,
    control: Arc<Connection>,
    options: PlayerOptions,
    status: watch::Sender<PlayerStatus>,
}

#[derive(Clone)]
pub struct PlayerHandle {
    tx: mpsc::Sender<Request>,
    status: watch::Receiver<PlayerStatus>,
}

impl Player {
    pub fn new(
        playlist: Playlist,
        pipe: PipeStreamer,
        renderer: RendererStreamer,
        control: Arc<Connection>,
        options: PlayerOptions,
    ) -> Self {
        let (status, _) = watch::channel(PlayerStatus {
            state: PlayerState::Idle,
            current: None,
            session: None,
            live_processes: 0,
        });
        Self {
            playlist,
            pipe,
            renderer,
            session: None,
            state: PlayerState::Idle,
            control,
            options,
            status,
        }
    }

    /// Run the player on its own task. `events` is the receiving side of the
    /// channel the pipe streamer reports natural ends on.
    pub fn spawn(self, events: mpsc::Receiver<SessionEnded>) -> PlayerHandle {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
        let status = self.status.subscribe();
        tokio::spawn(self.run(rx, events));
        PlayerHandle { tx, status }
    }

    async fn run(mut self, mut requests: mpsc::Receiver<Request>, mut events: mpsc::Receiver<SessionEnded>) {
        loop {
            tokio::select! {
                req = requests.recv() => match req {
                    Some(Request::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(req) => self.handle(req).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(ev) = events.recv() => self.on_session_ended(ev).await,
            }
        }
        info!("player stopped");
    }

    async fn handle(&mut self, req: Request) {
        match req {
            Request::Start { target, position, reply } => {
                let res = self.start(target, position).await;
                let _ = reply.send(res);
            }
            Request::Next { reply } => {
                let res = match self.playlist.next() {
                    Ok(i) => self.start_item(i, Duration::ZERO).await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(res);
            }
            Request::Previous { reply } => {
                let res = match self.playlist.previous() {
                    Ok(i) => self.start_item(i, Duration::ZERO).await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(res);
            }
            Request::SendCommand { name, reply } => {
                let res = self.send_command(&name).await;
                let _ = reply.send(res);
            }
            Request::Capability { op, reply } => {
                let res = self.capability(op).await;
                let _ = reply.send(res);
            }
            Request::GetCurrent { reply } => {
                let current = self
                    .playlist
                    .current_index()
                    .and_then(|i| self.playlist.get(i).map(|item| (i, item.summary())));
                let _ = reply.send(Ok(current));
            }
            Request::SetCurrent { index, reply } => {
                let res = self.set_current(index).await;
                let _ = reply.send(res);
            }
            Request::GetItems { reply } => {
                let res = self.rebuild().map(|_| self.playlist.summaries());
                let _ = reply.send(res);
            }
            Request::Rebuild { reply } => {
                let res = self.rebuild();
                if let Some(reply) = reply {
                    let _ = reply.send(res);
                }
            }
            Request::FirstRun { reply } => {
                let res = self.first_run().await;
                let _ = reply.send(res);
            }
            Request::RendererEnded { session } => self.on_renderer_ended(session).await,
            Request::Shutdown { .. } => {}
        }
    }

    fn publish(&self) {
        self.status.send_replace(PlayerStatus {
            state: self.state,
            current: self.playlist.current().map(|i| i.name()),
            session: self.session.as_ref().map(|s| s.id),
            live_processes: self.pipe.live_processes(),
        });
    }

    fn set_state(&mut self, state: PlayerState) {
        if self.state != state {
            debug!("player {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        self.publish();
    }

    fn streamer(&mut self, backend: Backend) -> Streamer<'_> {
        match backend {
            Backend::Pipe => Streamer::Pipe(&mut self.pipe),
            Backend::Renderer => Streamer::Renderer(&mut self.renderer),
        }
    }

    fn backend_for(&self, kind: ItemType) -> Backend {
        match (kind, self.options.streamer) {
            (ItemType::Video, StreamerKind::Omxplayer) => Backend::Pipe,
            _ => Backend::Renderer,
        }
    }

    async fn start(&mut self, target: Target, position: Duration) -> Result<ItemSummary> {
        let index = match target {
            Target::Index(i) => {
                if i >= self.playlist.len() {
                    return Err(Error::ItemNotFound(format!("index {i}")));
                }
                i
            }
            Target::Name(name) => {
                if name.trim().is_empty() {
                    return Err(Error::EmptyItem);
                }
                self.playlist.index_of(&name).ok_or(Error::ItemNotFound(name))?
            }
        };
        self.start_item(index, position).await
    }

    /// End the active session, if any, and wait until it is gone.
    async fn stop_session(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        self.set_state(PlayerState::Quitting);
        let res = self.streamer(session.backend).close().await;

        match (res, session.backend) {
            (Ok(()), _) => {
                self.set_state(PlayerState::Idle);
                Ok(())
            }
            (Err(e), Backend::Renderer) => {
                // The page is replaced or gone; nothing is left running.
                warn!("closing '{}' on the viewer failed: {e}", session.item);
                self.set_state(PlayerState::Idle);
                Ok(())
            }
            (Err(e), Backend::Pipe) => {
                warn!("stopping '{}' failed: {e}", session.item);
                self.set_state(PlayerState::Error);
                Err(e)
            }
        }
    }

    async fn start_item(&mut self, index: usize, position: Duration) -> Result<ItemSummary> {
        let item = self
            .playlist
            .get(index)
            .cloned()
            .ok_or_else(|| Error::ItemNotFound(format!("index {index}")))?;
        let name = item.name();
        if name.is_empty() {
            return Err(Error::EmptyItem);
        }

        self.stop_session().await?;
        self.set_state(PlayerState::Starting);

        let backend = self.backend_for(item.kind);
        if backend == Backend::Pipe {
            // Black page behind the decoder, and no leftover audio.
            if let Err(e) = self.renderer.blank().await {
                debug!("could not blank the viewer: {e}");
            }
        }

        let opts = OpenOptions { position };
        match self.streamer(backend).open(&item, opts).await {
            Ok(id) => {
                self.session = Some(Session { id, item: name.clone(), backend });
                self.playlist.set_current(index)?;
                self.set_state(PlayerState::Playing);
                info!("started '{name}' ({backend:?}, session {id})");

                if let Some(path) = &self.options.db_path {
                    config::persist_last_item(path.clone(), name.clone());
                }
                let msg = Message::push("player", "videoStarted", name);
                if let Err(e) = self.control.send(msg).await {
                    debug!("videoStarted not delivered: {e}");
                }
                Ok(item.summary())
            }
            Err(e) => {
                warn!("failed to start '{name}': {e}");
                self.set_state(PlayerState::Error);
                Err(e)
            }
        }
    }

    /// Try `first`, then each following item, for at most one lap.
    async fn start_from(&mut self, first: usize) -> Result<ItemSummary> {
        let len = self.playlist.len();
        let mut last_err = Error::NoCurrentItem;
        for step in 0..len {
            let index = (first + step) % len;
            match self.start_item(index, Duration::ZERO).await {
                Ok(summary) => return Ok(summary),
                Err(e) => last_err = e,
            }
        }
        self.set_state(PlayerState::Error);
        Err(last_err)
    }

    async fn advance(&mut self) {
        if self.playlist.is_empty() {
            info!("playlist is empty; nothing to advance to");
            return;
        }
        // The current item may have vanished in a rebuild; restart from the top.
        let next = self.playlist.next().unwrap_or(0);
        if let Err(e) = self.start_from(next).await {
            warn!("no playable item left in the playlist: {e}");
        }
    }

    async fn on_session_ended(&mut self, ev: SessionEnded) {
        let current = self.session.as_ref().map(|s| s.id);
        if ev.session.is_none() || ev.session != current {
            debug!("ignoring end of stale session {:?}", ev.session);
            return;
        }
        self.session = None;
        if let Err(e) = &ev.outcome {
            warn!("playback ended with an error: {e}");
        }
        self.set_state(PlayerState::Idle);
        self.advance().await;
    }

    async fn on_renderer_ended(&mut self, reported: Option<Uuid>) {
        let is_renderer = self
            .session
            .as_ref()
            .is_some_and(|s| s.backend == Backend::Renderer);
        if !is_renderer {
            debug!("viewer reported an end, but it is not playing anything");
            return;
        }
        let Some(id) = self.renderer.finish(reported) else {
            debug!("ignoring viewer end for stale session {reported:?}");
            return;
        };
        self.on_session_ended(SessionEnded { session: Some(id), outcome: Ok(()) }).await;
    }

    async fn send_command(&mut self, name: &str) -> Result<()> {
        lookup(name)?;
        if is_quit(name) {
            return self.stop_session().await;
        }

        let Some(backend) = self.session.as_ref().map(|s| s.backend) else {
            // Nothing playing: play/pause brings the current item back.
            if name == "pauseResume" {
                if let Some(i) = self.playlist.current_index() {
                    self.start_item(i, Duration::ZERO).await?;
                }
            }
            return Ok(());
        };
        self.streamer(backend).command(name).await
    }

    async fn capability(&mut self, op: Capability) -> Result<()> {
        let Some(backend) = self.session.as_ref().map(|s| s.backend) else {
            // Nothing playing: play brings the current item back.
            if op == Capability::Play {
                if let Some(i) = self.playlist.current_index() {
                    self.start_item(i, Duration::ZERO).await?;
                }
            }
            return Ok(());
        };
        let mut s = self.streamer(backend);
        if !s.is_open() {
            debug!("{op:?} ignored; the session is already over");
            return Ok(());
        }
        match op {
            Capability::Play => s.play().await,
            Capability::Pause => s.pause().await,
            Capability::PlaybackRate(v) => s.playback_rate(v).await,
            Capability::Seek(d) => s.seek(d).await,
            Capability::Chapter(i) => s.chapter(i).await,
            Capability::Volume(l) => s.volume(l).await,
            Capability::AudioStream(i) => s.audio_stream(i).await,
            Capability::SubtitleStream(i) => s.subtitle_stream(i).await,
        }
    }

    async fn set_current(&mut self, index: usize) -> Result<ItemSummary> {
        self.playlist.set_current(index)?;
        self.publish();
        let summary = self
            .playlist
            .current()
            .map(|i| i.summary())
            .ok_or(Error::NoCurrentItem)?;
        let msg = Message::push("playlist", "setCurrent", index);
        if let Err(e) = self.control.send(msg).await {
            debug!("setCurrent not delivered: {e}");
        }
        Ok(summary)
    }

    fn rebuild(&mut self) -> Result<usize> {
        let res = self.playlist.rebuild();
        self.publish();
        match res {
            Ok(()) => Ok(self.playlist.len()),
            Err(e) => {
                warn!("playlist rebuild failed: {e}");
                Err(e)
            }
        }
    }

    async fn first_run(&mut self) -> Result<Option<ItemSummary>> {
        if !self.options.kiosk_browser.is_empty() {
            let program = self.options.kiosk_browser.clone();
            let url = self.options.viewer_url.clone();
            match self.renderer.launch_browser(&program, &url) {
                Ok(()) => {
                    if !self.renderer.wait_for_viewer(VIEWER_WAIT).await {
                        warn!("viewer did not connect within {VIEWER_WAIT:?}");
                    }
                }
                Err(e) => warn!("can't start the kiosk browser: {e}"),
            }
        }

        self.rebuild()?;
        if self.playlist.is_empty() {
            info!("no items in {}", self.playlist.dir().display());
            return Ok(None);
        }

        let last = match &self.options.db_path {
            Some(path) => config::load_last_item(path.clone()).await,
            None => None,
        };
        let first = last.and_then(|name| self.playlist.index_of(&name)).unwrap_or(0);
        self.start_from(first).await.map(Some)
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.stop_session().await {
            warn!("error stopping playback on shutdown: {e}");
        }
    }
}

impl PlayerHandle {
    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(make(tx)).await.map_err(|_| Error::PlayerUnavailable)?;
        rx.await.map_err(|_| Error::PlayerUnavailable)?
    }

    pub async fn start(&self, target: Target, position: Duration) -> Result<ItemSummary> {
        self.call(|reply| Request::Start { target, position, reply }).await
    }

    pub async fn next(&self) -> Result<ItemSummary> {
        self.call(|reply| Request::Next { reply }).await
    }

    pub async fn previous(&self) -> Result<ItemSummary> {
        self.call(|reply| Request::Previous { reply }).await
    }

    pub async fn send_command(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.call(|reply| Request::SendCommand { name, reply }).await
    }

    pub async fn capability(&self, op: Capability) -> Result<()> {
        self.call(|reply| Request::Capability { op, reply }).await
    }

    pub async fn current(&self) -> Result<Option<(usize, ItemSummary)>> {
        self.call(|reply| Request::GetCurrent { reply }).await
    }

    pub async fn set_current(&self, index: usize) -> Result<ItemSummary> {
        self.call(|reply| Request::SetCurrent { index, reply }).await
    }

    /// Rescan, then list.
    pub async fn items(&self) -> Result<Vec<ItemSummary>> {
        self.call(|reply| Request::GetItems { reply }).await
    }

    pub async fn rebuild(&self) -> Result<usize> {
        self.call(|reply| Request::Rebuild { reply: Some(reply) }).await
    }

    /// Queue a rescan without waiting for it.
    pub async fn request_rebuild(&self) {
        if self.tx.send(Request::Rebuild { reply: None }).await.is_err() {
            debug!("player gone; rebuild request dropped");
        }
    }

    pub async fn first_run(&self) -> Result<Option<ItemSummary>> {
        self.call(|reply| Request::FirstRun { reply }).await
    }

    /// The viewer page says its item finished.
    pub async fn renderer_ended(&self, session: Option<Uuid>) {
        if self.tx.send(Request::RendererEnded { session }).await.is_err() {
            debug!("player gone; viewer end dropped");
        }
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Request::Shutdown { reply: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn status(&self) -> PlayerStatus {
        self.status.borrow().clone()
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<PlayerStatus> {
        self.status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::{attach, Peer};
    use std::path::Path;

    const WAIT_FOR_Q: &str = "head -c1 >/dev/null; exit 3";

    struct Fixture {
        _tmp: tempfile::TempDir,
        handle: PlayerHandle,
        control: Peer,
        viewer: Arc<Connection>,
        acks: mpsc::Sender<Message>,
    }

    async fn fixture(files: &[&str], script: &str, program: &str) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        for f in files {
            std::fs::write(tmp.path().join(f), b"x").unwrap();
        }

        let control_conn = Arc::new(Connection::new("control"));
        let control = attach(&control_conn).await;
        let viewer = Arc::new(Connection::new("viewer"));

        let (events_tx, events_rx) = mpsc::channel(8);
        let pipe = PipeStreamer::new(program, "hdmi", events_tx)
            .with_base_args(vec!["-c".into(), script.into(), "omx".into()]);
        let (acks, acks_rx) = mpsc::channel(8);
        let renderer = RendererStreamer::new(viewer.clone(), acks_rx).with_ack_timeout(Duration::from_secs(2));

        let mut playlist = Playlist::new(tmp.path());
        playlist.rebuild().unwrap();

        let options = PlayerOptions {
            streamer: StreamerKind::Omxplayer,
            kiosk_browser: String::new(),
            viewer_url: String::new(),
            db_path: None,
        };
        let handle = Player::new(playlist, pipe, renderer, control_conn, options).spawn(events_rx);
        Fixture { _tmp: tmp, handle, control, viewer, acks }
    }

    async fn wait_until(handle: &PlayerHandle, what: impl Fn(&PlayerStatus) -> bool) -> PlayerStatus {
        let mut rx = handle.subscribe();
        let res = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let status = rx.borrow_and_update().clone();
                if what(&status) {
                    return status;
                }
                if rx.changed().await.is_err() {
                    panic!("player went away");
                }
            }
        })
        .await;
        res.unwrap_or_else(|_| panic!("timed out; last status {:?}", handle.status()))
    }

    /// Acknowledge every viewer request the way the inbound pump would.
    fn fake_page(mut page: Peer, acks: mpsc::Sender<Message>, refuse: &'static str) {
        tokio::spawn(async move {
            while let Some(req) = page.next_message().await {
                let ack = if req.method == refuse {
                    Message::fail_event(&req.method)
                } else {
                    Message::ok(&req.method, "")
                };
                if acks.send(ack).await.is_err() {
                    break;
                }
            }
        });
    }

    fn a_waits_b_ends() -> String {
        // Item a ends right away; the others behave like a long video.
        format!("case \"$*\" in *a.mp4*) exit 0 ;; *) {WAIT_FOR_Q} ;; esac")
    }

    #[tokio::test]
    async fn preempting_start_leaves_one_process() {
        let mut f = fixture(&["a.mp4", "b.mp4", "c.mp4"], WAIT_FOR_Q, "sh").await;

        f.handle.start(Target::Name("a".into()), Duration::ZERO).await.unwrap();
        let started = f.handle.start(Target::Name("b.mp4".into()), Duration::ZERO).await.unwrap();
        assert_eq!(started.visual, "b.mp4");

        let status = f.handle.status();
        assert_eq!(status.state, PlayerState::Playing);
        assert_eq!(status.current.as_deref(), Some("b"));
        assert_eq!(status.live_processes, 1);

        let first = f.control.next_message().await.unwrap();
        assert_eq!((first.component.as_str(), first.event.as_str()), ("player", "videoStarted"));
        assert_eq!(first.text(), "a");
        assert_eq!(f.control.next_message().await.unwrap().text(), "b");

        f.handle.shutdown().await;
    }

    #[tokio::test]
    async fn natural_end_advances() {
        let f = fixture(&["a.mp4", "b.mp4", "c.mp4"], &a_waits_b_ends(), "sh").await;

        f.handle.start(Target::Index(0), Duration::ZERO).await.unwrap();
        let status = wait_until(&f.handle, |s| s.current.as_deref() == Some("b")).await;
        assert_eq!(status.state, PlayerState::Playing);
        let status = wait_until(&f.handle, |s| s.live_processes == 1).await;
        assert_eq!(status.current.as_deref(), Some("b"));

        f.handle.shutdown().await;
    }

    #[tokio::test]
    async fn quit_then_pause_resume_restarts_current() {
        let f = fixture(&["a.mp4", "b.mp4"], WAIT_FOR_Q, "sh").await;

        f.handle.start(Target::Name("b".into()), Duration::ZERO).await.unwrap();
        f.handle.send_command("quit").await.unwrap();
        let status = f.handle.status();
        assert_eq!(status.state, PlayerState::Idle);
        assert_eq!(status.session, None);
        assert_eq!(status.current.as_deref(), Some("b"));
        assert_eq!(status.live_processes, 0);

        // Anything else is ignored while stopped.
        f.handle.send_command("seekForward30").await.unwrap();
        assert_eq!(f.handle.status().state, PlayerState::Idle);

        f.handle.send_command("pauseResume").await.unwrap();
        let status = f.handle.status();
        assert_eq!(status.state, PlayerState::Playing);
        assert_eq!(status.current.as_deref(), Some("b"));
        assert_eq!(status.live_processes, 1);

        f.handle.shutdown().await;
        assert_eq!(f.handle.status().live_processes, 0);
    }

    #[tokio::test]
    async fn navigation_wraps_and_needs_current() {
        let f = fixture(&["a.mp4", "b.mp4", "c.mp4"], WAIT_FOR_Q, "sh").await;

        assert_eq!(f.handle.next().await.unwrap_err(), Error::NoCurrentItem);
        f.handle.start(Target::Index(2), Duration::ZERO).await.unwrap();
        assert_eq!(f.handle.next().await.unwrap().visual, "a.mp4");
        assert_eq!(f.handle.previous().await.unwrap().visual, "c.mp4");
        assert_eq!(f.handle.status().live_processes, 1);

        f.handle.shutdown().await;
    }

    #[tokio::test]
    async fn bad_targets_and_commands() {
        let f = fixture(&["a.mp4"], WAIT_FOR_Q, "sh").await;

        assert_eq!(f.handle.start(Target::Name(" ".into()), Duration::ZERO).await, Err(Error::EmptyItem));
        assert!(matches!(
            f.handle.start(Target::Name("zzz".into()), Duration::ZERO).await,
            Err(Error::ItemNotFound(_))
        ));
        assert!(matches!(
            f.handle.start(Target::Index(5), Duration::ZERO).await,
            Err(Error::ItemNotFound(_))
        ));
        assert_eq!(
            f.handle.send_command("moonwalk").await,
            Err(Error::UnknownCommand("moonwalk".into()))
        );
        f.handle.shutdown().await;
    }

    #[tokio::test]
    async fn failed_start_keeps_current() {
        let f = fixture(&["a.mp4", "b.mp4"], WAIT_FOR_Q, "/nonexistent/omxplayer").await;

        let err = f.handle.start(Target::Name("a".into()), Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, Error::ProcessSpawnFailed(_)));
        let status = f.handle.status();
        assert_eq!(status.state, PlayerState::Error);
        assert_eq!(status.current, None);
        assert_eq!(status.live_processes, 0);
    }

    #[tokio::test]
    async fn first_run_starts_first_item() {
        let f = fixture(&["b.mp4", "a.mp4"], WAIT_FOR_Q, "sh").await;
        let started = f.handle.first_run().await.unwrap().unwrap();
        assert_eq!(started.visual, "a.mp4");
        f.handle.shutdown().await;
    }

    #[tokio::test]
    async fn first_run_with_empty_folder() {
        let f = fixture(&["notes.txt"], WAIT_FOR_Q, "sh").await;
        assert_eq!(f.handle.first_run().await.unwrap(), None);
        assert_eq!(f.handle.status().state, PlayerState::Idle);
    }

    #[tokio::test]
    async fn images_go_to_the_viewer_and_advance_on_ended() {
        let f = fixture(&["a.jpg", "b.png"], WAIT_FOR_Q, "sh").await;
        let page = attach(&f.viewer).await;
        fake_page(page, f.acks.clone(), "");

        f.handle.start(Target::Name("a".into()), Duration::ZERO).await.unwrap();
        let status = f.handle.status();
        assert_eq!(status.state, PlayerState::Playing);
        assert_eq!(status.live_processes, 0);

        f.handle.renderer_ended(Some(Uuid::new_v4())).await;
        f.handle.renderer_ended(None).await;
        let status = wait_until(&f.handle, |s| s.current.as_deref() == Some("b")).await;
        assert_eq!(status.state, PlayerState::Playing);

        f.handle.shutdown().await;
    }

    #[tokio::test]
    async fn viewer_refusal_is_an_error() {
        let f = fixture(&["a.jpg"], WAIT_FOR_Q, "sh").await;
        let page = attach(&f.viewer).await;
        fake_page(page, f.acks.clone(), "open");

        let err = f.handle.start(Target::Index(0), Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, Error::Renderer(_)));
        assert_eq!(f.handle.status().state, PlayerState::Error);
    }

    #[tokio::test]
    async fn set_current_notifies_control() {
        let mut f = fixture(&["a.mp4", "b.mp4"], WAIT_FOR_Q, "sh").await;

        let item = f.handle.set_current(1).await.unwrap();
        assert_eq!(item.visual, "b.mp4");
        let pushed = f.control.next_message().await.unwrap();
        assert_eq!(pushed.event, "setCurrent");
        assert_eq!(pushed.message, serde_json::json!(1));
        assert_eq!(f.handle.current().await.unwrap().map(|(i, _)| i), Some(1));
        assert!(matches!(f.handle.set_current(9).await, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn failed_quit_aborts_the_preempting_start() {
        // Exits 1 instead of omxplayer's 3 once it reads the quit key.
        let f = fixture(&["a.mp4", "b.mp4"], "head -c1 >/dev/null; exit 1", "sh").await;

        f.handle.start(Target::Name("a".into()), Duration::ZERO).await.unwrap();
        let err = f.handle.start(Target::Name("b".into()), Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, Error::ProcessExitError(_)), "{err:?}");

        let status = f.handle.status();
        assert_eq!(status.state, PlayerState::Error);
        assert_eq!(status.current.as_deref(), Some("a"));
        assert_eq!(status.session, None);
        assert_eq!(status.live_processes, 0);
    }

    #[tokio::test]
    async fn play_restarts_the_stopped_current_item() {
        let f = fixture(&["a.mp4", "b.mp4"], WAIT_FOR_Q, "sh").await;

        // Nothing current yet: play does nothing.
        f.handle.capability(Capability::Play).await.unwrap();
        assert_eq!(f.handle.status().state, PlayerState::Idle);

        f.handle.start(Target::Name("b".into()), Duration::ZERO).await.unwrap();
        f.handle.send_command("quit").await.unwrap();
        assert_eq!(f.handle.status().live_processes, 0);

        f.handle.capability(Capability::Pause).await.unwrap();
        assert_eq!(f.handle.status().state, PlayerState::Idle);

        f.handle.capability(Capability::Play).await.unwrap();
        let status = f.handle.status();
        assert_eq!(status.state, PlayerState::Playing);
        assert_eq!(status.current.as_deref(), Some("b"));
        assert_eq!(status.live_processes, 1);

        f.handle.shutdown().await;
    }

    #[tokio::test]
    async fn items_fail_when_the_folder_is_gone() {
        let f = fixture(&["a.mp4"], WAIT_FOR_Q, "sh").await;
        std::fs::remove_dir_all(f._tmp.path()).unwrap();

        let err = f.handle.items().await.unwrap_err();
        assert!(matches!(err, Error::DirectoryUnavailable { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn items_reflect_the_folder() {
        let f = fixture(&["a.mp4"], WAIT_FOR_Q, "sh").await;
        let dir = f._tmp.path().to_path_buf();
        std::fs::write(Path::new(&dir).join("b.jpg"), b"x").unwrap();

        let items = f.handle.items().await.unwrap();
        let names: Vec<_> = items.iter().map(|i| i.visual.as_str()).collect();
        assert_eq!(names, vec!["a.mp4", "b.jpg"]);
    }
}
