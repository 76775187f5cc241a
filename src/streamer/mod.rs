//! Streamers put an item on screen.
//!
//! Two backends exist: [`PipeStreamer`] drives an external decoder process
//! (omxplayer) through its stdin, and [`RendererStreamer`] asks the kiosk
//! browser page on the viewer connection to do the work. Both expose the same
//! capability set; the player picks one per item through [`Streamer`].

use std::time::Duration;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::item::Item;

pub mod pipe;
pub mod renderer;

pub use pipe::PipeStreamer;
pub use renderer::RendererStreamer;

/// Named operator commands and the bytes omxplayer expects for them.
pub static COMMANDS: &[(&str, &str)] = &[
    ("speedIncrease", "1"),
    ("speedDecrease", "2"),
    ("rewind", "<"),
    ("fastForward", ">"),
    ("chapterPrevious", "i"),
    ("chapterNext", "o"),
    ("exit", "q"),
    ("quit", "q"),
    ("pauseResume", "p"),
    ("volumeDecrease", "-"),
    ("volumeIncrease", "+"),
    ("seekBack30", "\x1b[D"),
    ("seekForward30", "\x1b[C"),
    ("seekBack600", "\x1b[B"),
    ("seekForward600", "\x1b[A"),
];

/// Resolve a command name to its key sequence.
pub fn lookup(name: &str) -> Result<&'static str> {
    COMMANDS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, keys)| *keys)
        .ok_or_else(|| Error::UnknownCommand(name.to_string()))
}

/// Commands that end the session instead of being forwarded.
pub fn is_quit(name: &str) -> bool {
    matches!(name, "quit" | "exit")
}

/// A session ended without being asked to.
#[derive(Debug)]
pub struct SessionEnded {
    /// `None` when the renderer reported the end without naming a session.
    pub session: Option<Uuid>,
    pub outcome: Result<()>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenOptions {
    pub position: Duration,
}

pub enum Streamer<'a> {
    Pipe(&'a mut PipeStreamer),
    Renderer(&'a mut RendererStreamer),
}

macro_rules! dispatch {
    ($self:ident, $s:ident => $call:expr) => {
        match $self {
            Streamer::Pipe($s) => $call,
            Streamer::Renderer($s) => $call,
        }
    };
}

impl Streamer<'_> {
    pub async fn open(&mut self, item: &Item, opts: OpenOptions) -> Result<Uuid> {
        dispatch!(self, s => s.open(item, opts).await)
    }

    pub async fn close(&mut self) -> Result<()> {
        dispatch!(self, s => s.close().await)
    }

    pub async fn play(&mut self) -> Result<()> {
        dispatch!(self, s => s.play().await)
    }

    pub async fn pause(&mut self) -> Result<()> {
        dispatch!(self, s => s.pause().await)
    }

    pub async fn playback_rate(&mut self, speed: i32) -> Result<()> {
        dispatch!(self, s => s.playback_rate(speed).await)
    }

    pub async fn seek(&mut self, direction: i32) -> Result<()> {
        dispatch!(self, s => s.seek(direction).await)
    }

    pub async fn chapter(&mut self, offset: i32) -> Result<()> {
        dispatch!(self, s => s.chapter(offset).await)
    }

    pub async fn volume(&mut self, level: i32) -> Result<()> {
        dispatch!(self, s => s.volume(level).await)
    }

    pub async fn audio_stream(&mut self, index: i32) -> Result<()> {
        dispatch!(self, s => s.audio_stream(index).await)
    }

    pub async fn subtitle_stream(&mut self, index: i32) -> Result<()> {
        dispatch!(self, s => s.subtitle_stream(index).await)
    }

    pub async fn command(&mut self, name: &str) -> Result<()> {
        dispatch!(self, s => s.command(name).await)
    }

    pub fn is_open(&self) -> bool {
        dispatch!(self, s => s.is_open())
    }
}

/// `HH:MM:SS`, hours unbounded.
pub fn format_position(position: Duration) -> String {
    let secs = position.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Accepts plain seconds (`"90"`), unit strings (`"90s"`, `"1m30s"`,
/// `"1h2m3.5s"`, `"250ms"`) and clock form (`"01:02:03"`, `"2:03"`).
pub fn parse_position(text: &str) -> Result<Duration> {
    let text = text.trim();
    let invalid = || Error::InvalidArgument(format!("can't parse position '{text}'"));
    if text.is_empty() {
        return Err(invalid());
    }

    if let Ok(secs) = text.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).map_err(|_| invalid());
    }

    if text.contains(':') {
        let mut total = 0u64;
        let parts: Vec<&str> = text.split(':').collect();
        if parts.len() > 3 {
            return Err(invalid());
        }
        for part in parts {
            let n: u64 = part.parse().map_err(|_| invalid())?;
            total = total * 60 + n;
        }
        return Ok(Duration::from_secs(total));
    }

    let mut total = 0f64;
    let mut rest = text;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if num_len == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..num_len].parse().map_err(|_| invalid())?;
        rest = &rest[num_len..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 0.001,
            _ => return Err(invalid()),
        };
        total += value * scale;
        rest = &rest[unit_len..];
    }
    Duration::try_from_secs_f64(total).map_err(|_| invalid())
}
