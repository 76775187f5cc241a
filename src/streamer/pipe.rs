// --- Pipe streamer (omxplayer) ----------------------------------------------
//
// omxplayer is controlled by single keystrokes on stdin. We keep the write end
// of the pipe and hand the child itself to a supervisor task that waits for it
// to exit:
//   - if we asked it to quit, the exit status goes back to `close()` over a
//     oneshot created for that session
//   - otherwise the video simply finished and the player is told, so it can
//     advance to the next item
//
// omxplayer exits with status 3 after `q`; that is a normal stop.

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{format_position, is_quit, lookup, OpenOptions, SessionEnded};
use crate::error::{Error, Result};
use crate::item::Item;

const QUIT_EXIT_CODE: i32 = 3;

/// Largest speed, volume, chapter or stream value accepted; every unit is one
/// keystroke.
pub const MAX_STEPS: i32 = 16;

pub struct PipeStreamer {
    program: String,
    /// Inserted before the omxplayer flags; lets tests drive a shell instead.
    base_args: Vec<String>,
    audio_output: String,
    events: mpsc::Sender<SessionEnded>,
    session: Option<PipeSession>,
    live: Arc<AtomicUsize>,
}

struct PipeSession {
    id: Uuid,
    stdin: ChildStdin,
    quitting: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    done: oneshot::Receiver<Result<()>>,
    paused: bool,
    rate: i32,
    volume: i32,
    audio_stream: i32,
    subtitle_stream: i32,
}

impl PipeStreamer {
    pub fn new(program: impl Into<String>, audio_output: impl Into<String>, events: mpsc::Sender<SessionEnded>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            audio_output: audio_output.into(),
            events,
            session: None,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_base_args(mut self, args: Vec<String>) -> Self {
        self.base_args = args;
        self
    }

    /// Decoder processes spawned by this streamer that have not exited yet.
    pub fn live_processes(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.running.load(Ordering::SeqCst))
    }

    fn args_for(&self, item: &Item, opts: OpenOptions) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.extend([
            "-b".to_string(),
            "-l".to_string(),
            format_position(opts.position),
            "-o".to_string(),
            self.audio_output.clone(),
            item.visual.display().to_string(),
        ]);
        if item.is_loop() {
            args.push("--loop".into());
        }
        args
    }

    pub async fn open(&mut self, item: &Item, opts: OpenOptions) -> Result<Uuid> {
        // Never two decoders on the same screen.
        self.close().await?;

        let args = self.args_for(item, opts);
        debug!("spawning {} {:?}", self.program, args);

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ProcessSpawnFailed(format!("{}: {e}", self.program)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::ProcessSpawnFailed("decoder stdin unavailable".into()))?;

        let id = Uuid::new_v4();
        let quitting = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));
        let (done_tx, done_rx) = oneshot::channel();
        self.live.fetch_add(1, Ordering::SeqCst);

        let live = self.live.clone();
        let events = self.events.clone();
        let sup_quitting = quitting.clone();
        let sup_running = running.clone();
        let name = item.name();
        tokio::spawn(async move {
            let outcome = match child.wait().await {
                Ok(status) => classify(status),
                Err(e) => Err(Error::ProcessExitError(e.to_string())),
            };
            live.fetch_sub(1, Ordering::SeqCst);
            sup_running.store(false, Ordering::SeqCst);

            if sup_quitting.load(Ordering::SeqCst) {
                let _ = done_tx.send(outcome);
            } else {
                match &outcome {
                    Ok(()) => info!("'{name}' finished"),
                    Err(e) => warn!("'{name}' ended unexpectedly: {e}"),
                }
                let _ = events.send(SessionEnded { session: Some(id), outcome }).await;
            }
        });

        info!("playing '{}' with {}", item.name(), self.program);
        self.session = Some(PipeSession {
            id,
            stdin,
            quitting,
            running,
            done: done_rx,
            paused: false,
            rate: 1,
            volume: 0,
            audio_stream: 0,
            subtitle_stream: 0,
        });
        Ok(id)
    }

    /// Ask the decoder to quit and wait until it has exited.
    pub async fn close(&mut self) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        if !session.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        debug!("quitting decoder session {}", session.id);
        session.quitting.store(true, Ordering::SeqCst);
        if let Err(e) = session.stdin.write_all(b"q").await {
            // Already on its way out; the supervisor still reports the status.
            debug!("writing quit to decoder failed: {e}");
        }
        let _ = session.stdin.flush().await;

        match session.done.await {
            Ok(outcome) => outcome,
            // The process ended on its own just before the quit landed.
            Err(_) => Ok(()),
        }
    }

    async fn pipe(&mut self, keys: &str) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        if !session.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        session
            .stdin
            .write_all(keys.as_bytes())
            .await
            .map_err(|e| Error::ConnectionBroken(format!("decoder stdin: {e}")))?;
        session
            .stdin
            .flush()
            .await
            .map_err(|e| Error::ConnectionBroken(format!("decoder stdin: {e}")))
    }

    fn paused(&self) -> Option<bool> {
        self.session.as_ref().map(|s| s.paused)
    }

    fn set_paused(&mut self, paused: bool) {
        if let Some(s) = self.session.as_mut() {
            s.paused = paused;
        }
    }

    pub async fn play(&mut self) -> Result<()> {
        if self.paused() == Some(true) {
            self.pipe("p").await?;
            self.set_paused(false);
        }
        Ok(())
    }

    pub async fn pause(&mut self) -> Result<()> {
        if self.paused() == Some(false) {
            self.pipe("p").await?;
            self.set_paused(true);
        }
        Ok(())
    }

    /// Step the speed towards `speed`, one keystroke per step.
    pub async fn playback_rate(&mut self, speed: i32) -> Result<()> {
        bounded("playback rate", speed)?;
        self.step_towards(speed, |s| &mut s.rate, "speedIncrease", "speedDecrease")
            .await
    }

    /// -2/-1/1/2: back 600s, back 30s, forward 30s, forward 600s.
    pub async fn seek(&mut self, direction: i32) -> Result<()> {
        let name = match direction {
            -2 => "seekBack600",
            -1 => "seekBack30",
            1 => "seekForward30",
            2 => "seekForward600",
            _ => return Err(Error::InvalidArgument(format!("seek direction {direction}"))),
        };
        self.pipe(lookup(name)?).await
    }

    /// Relative chapter jump.
    pub async fn chapter(&mut self, offset: i32) -> Result<()> {
        bounded("chapter offset", offset)?;
        let keys = if offset < 0 { "i" } else { "o" };
        for _ in 0..offset.unsigned_abs() {
            self.pipe(keys).await?;
        }
        Ok(())
    }

    pub async fn volume(&mut self, level: i32) -> Result<()> {
        bounded("volume", level)?;
        self.step_towards(level, |s| &mut s.volume, "volumeIncrease", "volumeDecrease")
            .await
    }

    pub async fn audio_stream(&mut self, index: i32) -> Result<()> {
        bounded("audio stream", index)?;
        self.step_keys(index, |s| &mut s.audio_stream, "k", "j").await
    }

    pub async fn subtitle_stream(&mut self, index: i32) -> Result<()> {
        bounded("subtitle stream", index)?;
        self.step_keys(index, |s| &mut s.subtitle_stream, "m", "n").await
    }

    pub async fn command(&mut self, name: &str) -> Result<()> {
        let keys = lookup(name)?;
        if is_quit(name) {
            return self.close().await;
        }
        if let Some(s) = self.session.as_mut() {
            match name {
                "pauseResume" => s.paused = !s.paused,
                "speedIncrease" => s.rate += 1,
                "speedDecrease" => s.rate -= 1,
                "volumeIncrease" => s.volume += 1,
                "volumeDecrease" => s.volume -= 1,
                _ => {}
            }
        }
        self.pipe(keys).await
    }

    async fn step_towards(
        &mut self,
        target: i32,
        field: fn(&mut PipeSession) -> &mut i32,
        up: &str,
        down: &str,
    ) -> Result<()> {
        self.step_keys(target, field, lookup(up)?, lookup(down)?).await
    }

    async fn step_keys(
        &mut self,
        target: i32,
        field: fn(&mut PipeSession) -> &mut i32,
        up: &str,
        down: &str,
    ) -> Result<()> {
        loop {
            let Some(session) = self.session.as_mut() else {
                return Ok(());
            };
            let value = field(session);
            let keys = match target.cmp(value) {
                std::cmp::Ordering::Greater => {
                    *value += 1;
                    up
                }
                std::cmp::Ordering::Less => {
                    *value -= 1;
                    down
                }
                std::cmp::Ordering::Equal => return Ok(()),
            };
            self.pipe(keys).await?;
        }
    }
}

fn bounded(what: &str, value: i32) -> Result<()> {
    if (-MAX_STEPS..=MAX_STEPS).contains(&value) {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!("{what} {value} outside -{MAX_STEPS}..={MAX_STEPS}")))
    }
}

fn classify(status: ExitStatus) -> Result<()> {
    match status.code() {
        Some(0) | Some(QUIT_EXIT_CODE) => Ok(()),
        _ => Err(Error::ProcessExitError(status.to_string())),
    }
}
