// --- Remote control input ---------------------------------------------------
//
// IR remotes and keyboards show up as Linux evdev devices. We read raw
// `input_event` records straight from /dev/input/eventN, keep key-down events
// only, and turn them into player actions:
//   - LEFT / RIGHT always step through the playlist
//   - in `command` mode other keys map to player commands (pause, seek, ...)
//   - in `forward` mode other keys are handed to the viewer page as `keyDown`
//
// Devices come and go (USB receivers get unplugged); every failure is retried
// after a short backoff.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::message::Message;
use crate::player::PlayerHandle;

pub const RETRY_BACKOFF: Duration = Duration::from_secs(3);

const SYS_INPUT: &str = "/sys/class/input";
const DEV_INPUT: &str = "/dev/input";

#[cfg(target_os = "linux")]
pub const EVENT_SIZE: usize = std::mem::size_of::<libc::input_event>();
#[cfg(not(target_os = "linux"))]
pub const EVENT_SIZE: usize = 24;

pub const EV_KEY: u16 = 1;
const VALUE_DOWN: i32 = 1;

const KEY_LEFT: u16 = 105;
const KEY_RIGHT: u16 = 106;

/// Keys we react to: (code, name, command in `command` mode).
static KEYS: &[(u16, &str, &str)] = &[
    (1, "KEY_ESC", ""),
    (28, "KEY_ENTER", ""),
    (57, "KEY_SPACE", "pauseResume"),
    (102, "KEY_HOME", ""),
    (103, "KEY_UP", ""),
    (KEY_LEFT, "KEY_LEFT", ""),
    (KEY_RIGHT, "KEY_RIGHT", ""),
    (108, "KEY_DOWN", ""),
    (114, "KEY_VOLUMEDOWN", "volumeDecrease"),
    (115, "KEY_VOLUMEUP", "volumeIncrease"),
    (128, "KEY_STOP", "quit"),
    (158, "KEY_BACK", ""),
    (164, "KEY_PLAYPAUSE", "pauseResume"),
    (168, "KEY_REWIND", "seekBack30"),
    (208, "KEY_FASTFORWARD", "seekForward30"),
    (358, "KEY_INFO", ""),
    (438, "KEY_CONTEXT_MENU", ""),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteMode {
    /// Keys drive the player directly.
    Command,
    /// Keys are passed to the viewer page.
    Forward,
}

impl RemoteMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Forward => "forward",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "command" => Some(Self::Command),
            "forward" => Some(Self::Forward),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Previous,
    Next,
    Command(&'static str),
    Forward(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

impl InputEvent {
    /// Decode one native `input_event`; the timestamp is ignored.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < EVENT_SIZE {
            return None;
        }
        let at = EVENT_SIZE - 8;
        Some(Self {
            kind: u16::from_ne_bytes([buf[at], buf[at + 1]]),
            code: u16::from_ne_bytes([buf[at + 2], buf[at + 3]]),
            value: i32::from_ne_bytes([buf[at + 4], buf[at + 5], buf[at + 6], buf[at + 7]]),
        })
    }
}

pub fn key_name(code: u16) -> Option<&'static str> {
    KEYS.iter().find(|(c, _, _)| *c == code).map(|(_, name, _)| *name)
}

/// What a single event means, if anything.
pub fn key_action(ev: InputEvent, mode: RemoteMode) -> Option<KeyAction> {
    if ev.kind != EV_KEY || ev.value != VALUE_DOWN {
        return None;
    }
    match ev.code {
        KEY_LEFT => return Some(KeyAction::Previous),
        KEY_RIGHT => return Some(KeyAction::Next),
        _ => {}
    }
    let &(_, name, command) = KEYS.iter().find(|(c, _, _)| *c == ev.code)?;
    match mode {
        RemoteMode::Command if command.is_empty() => None,
        RemoteMode::Command => Some(KeyAction::Command(command)),
        RemoteMode::Forward => Some(KeyAction::Forward(name)),
    }
}

/// Decode events until the device goes away or nobody listens anymore.
pub async fn read_events<R>(mut reader: R, mode: RemoteMode, actions: &mpsc::Sender<KeyAction>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; EVENT_SIZE];
    loop {
        match reader.read_exact(&mut buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
        let Some(ev) = InputEvent::parse(&buf) else {
            continue;
        };
        if let Some(action) = key_action(ev, mode) {
            debug!("remote key {:?} -> {:?}", key_name(ev.code), action);
            if actions.send(action).await.is_err() {
                return Ok(());
            }
        }
    }
}

/// Resolve a configured device to event nodes: `/dev/...` paths are used as
/// is, anything else is matched against the kernel's device names.
pub fn find_devices(name: &str) -> Vec<PathBuf> {
    find_devices_in(Path::new(SYS_INPUT), Path::new(DEV_INPUT), name)
}

fn find_devices_in(sys_root: &Path, dev_root: &Path, name: &str) -> Vec<PathBuf> {
    if name.starts_with("/dev/") {
        return vec![PathBuf::from(name)];
    }
    let wanted = name.trim().to_lowercase();
    let Ok(entries) = std::fs::read_dir(sys_root) else {
        return Vec::new();
    };

    let mut found: Vec<PathBuf> = entries
        .flatten()
        .filter_map(|ent| {
            let node = ent.file_name().to_string_lossy().into_owned();
            if !node.starts_with("event") {
                return None;
            }
            let dev_name = std::fs::read_to_string(ent.path().join("device").join("name")).ok()?;
            dev_name
                .trim()
                .to_lowercase()
                .contains(&wanted)
                .then(|| dev_root.join(&node))
        })
        .collect();
    found.sort();
    found
}

async fn read_device(path: PathBuf, mode: RemoteMode, actions: mpsc::Sender<KeyAction>) -> io::Result<()> {
    let file = tokio::fs::File::open(&path).await?;
    info!("listening to remote {}", path.display());
    read_events(file, mode, &actions).await
}

/// Keep reading every device that matches `name`, rediscovering after failures.
async fn listen(name: String, mode: RemoteMode, actions: mpsc::Sender<KeyAction>) {
    loop {
        let paths = find_devices(&name);
        if paths.is_empty() {
            debug!("remote '{name}' not found; retrying in {RETRY_BACKOFF:?}");
        }

        let mut readers = JoinSet::new();
        for path in paths {
            let actions = actions.clone();
            readers.spawn(async move {
                let res = read_device(path.clone(), mode, actions).await;
                (path, res)
            });
        }
        while let Some(joined) = readers.join_next().await {
            match joined {
                Ok((path, Ok(()))) => info!("remote {} closed", path.display()),
                Ok((path, Err(e))) => warn!("remote {}: {e}", path.display()),
                Err(e) => warn!("remote reader task failed: {e}"),
            }
        }

        if actions.is_closed() {
            return;
        }
        tokio::time::sleep(RETRY_BACKOFF).await;
    }
}

async fn apply_actions(mut actions: mpsc::Receiver<KeyAction>, player: PlayerHandle, viewer: Arc<Connection>) {
    while let Some(action) = actions.recv().await {
        let res = match action {
            KeyAction::Previous => player.previous().await.map(|_| ()),
            KeyAction::Next => player.next().await.map(|_| ()),
            KeyAction::Command(cmd) => player.send_command(cmd).await,
            KeyAction::Forward(key) => {
                let msg = Message::push("remote", "keyDown", serde_json::Value::Null).with_arg("keyString", key);
                viewer.send(msg).await
            }
        };
        if let Err(e) = res {
            warn!("remote action {action:?} failed: {e}");
        }
    }
}

/// Start listening on every configured device.
pub fn spawn(devices: Vec<String>, mode: RemoteMode, player: PlayerHandle, viewer: Arc<Connection>) {
    if devices.is_empty() {
        info!("no remote devices configured");
        return;
    }
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(apply_actions(rx, player, viewer));
    for name in devices {
        tokio::spawn(listen(name, mode, tx.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_PLAYPAUSE: u16 = 164;
    const KEY_HOME: u16 = 102;

    fn raw(kind: u16, code: u16, value: i32) -> Vec<u8> {
        let mut buf = vec![0u8; EVENT_SIZE];
        let at = EVENT_SIZE - 8;
        buf[at..at + 2].copy_from_slice(&kind.to_ne_bytes());
        buf[at + 2..at + 4].copy_from_slice(&code.to_ne_bytes());
        buf[at + 4..at + 8].copy_from_slice(&value.to_ne_bytes());
        buf
    }

    async fn actions_for(events: &[(u16, u16, i32)], mode: RemoteMode) -> Vec<KeyAction> {
        let bytes: Vec<u8> = events.iter().flat_map(|(t, c, v)| raw(*t, *c, *v)).collect();
        let (tx, mut rx) = mpsc::channel(16);
        read_events(bytes.as_slice(), mode, &tx).await.unwrap();
        drop(tx);
        let mut out = Vec::new();
        while let Some(a) = rx.recv().await {
            out.push(a);
        }
        out
    }

    #[tokio::test]
    async fn only_key_down_counts() {
        // Press, auto-repeat, release, plus a sync event in between.
        let got = actions_for(
            &[(EV_KEY, KEY_LEFT, 1), (0, 0, 0), (EV_KEY, KEY_LEFT, 2), (EV_KEY, KEY_LEFT, 0)],
            RemoteMode::Command,
        )
        .await;
        assert_eq!(got, vec![KeyAction::Previous]);
    }

    #[tokio::test]
    async fn command_mode_uses_the_symbol_table() {
        let got = actions_for(
            &[(EV_KEY, KEY_PLAYPAUSE, 1), (EV_KEY, KEY_HOME, 1), (EV_KEY, 30, 1), (EV_KEY, KEY_RIGHT, 1)],
            RemoteMode::Command,
        )
        .await;
        assert_eq!(got, vec![KeyAction::Command("pauseResume"), KeyAction::Next]);
    }

    #[tokio::test]
    async fn forward_mode_passes_key_names() {
        let got = actions_for(
            &[(EV_KEY, KEY_HOME, 1), (EV_KEY, KEY_LEFT, 1), (EV_KEY, 30, 1)],
            RemoteMode::Forward,
        )
        .await;
        assert_eq!(got, vec![KeyAction::Forward("KEY_HOME"), KeyAction::Previous]);
    }

    #[tokio::test]
    async fn truncated_tail_is_end_of_device() {
        let mut bytes = raw(EV_KEY, KEY_RIGHT, 1);
        bytes.extend_from_slice(&[0u8; 5]);
        let (tx, mut rx) = mpsc::channel(4);
        read_events(bytes.as_slice(), RemoteMode::Command, &tx).await.unwrap();
        assert_eq!(rx.recv().await, Some(KeyAction::Next));
    }

    #[tokio::test]
    async fn held_left_key_steps_back_once() {
        use crate::config::StreamerKind;
        use crate::player::{Player, PlayerOptions, Target};
        use crate::playlist::Playlist;
        use crate::streamer::{PipeStreamer, RendererStreamer};

        let tmp = tempfile::tempdir().unwrap();
        for f in ["a.mp4", "b.mp4", "c.mp4"] {
            std::fs::write(tmp.path().join(f), b"x").unwrap();
        }
        let control = Arc::new(Connection::new("control"));
        let viewer = Arc::new(Connection::new("viewer"));
        let (events_tx, events_rx) = mpsc::channel(8);
        let pipe = PipeStreamer::new("sh", "hdmi", events_tx).with_base_args(vec![
            "-c".into(),
            "head -c1 >/dev/null; exit 3".into(),
            "omx".into(),
        ]);
        let (_acks, acks_rx) = mpsc::channel(8);
        let renderer = RendererStreamer::new(viewer.clone(), acks_rx);
        let options = PlayerOptions {
            streamer: StreamerKind::Omxplayer,
            kiosk_browser: String::new(),
            viewer_url: String::new(),
            db_path: None,
        };
        let mut playlist = Playlist::new(tmp.path());
        playlist.rebuild().unwrap();
        let player = Player::new(playlist, pipe, renderer, control, options).spawn(events_rx);
        player.start(Target::Name("c".into()), Duration::ZERO).await.unwrap();

        // Press, two auto-repeats, release.
        let bytes: Vec<u8> = [(EV_KEY, KEY_LEFT, 1), (EV_KEY, KEY_LEFT, 2), (EV_KEY, KEY_LEFT, 2), (EV_KEY, KEY_LEFT, 0)]
            .iter()
            .flat_map(|(t, c, v)| raw(*t, *c, *v))
            .collect();
        let (tx, rx) = mpsc::channel(16);
        read_events(bytes.as_slice(), RemoteMode::Command, &tx).await.unwrap();
        drop(tx);
        apply_actions(rx, player.clone(), viewer).await;

        let status = player.status();
        assert_eq!(status.current.as_deref(), Some("b"));
        assert_eq!(status.live_processes, 1);
        player.shutdown().await;
    }

    #[test]
    fn finds_devices_by_name_or_path() {
        let sys = tempfile::tempdir().unwrap();
        for (node, name) in [("event0", "Power Button"), ("event3", "flirc.tv flirc Keyboard"), ("mouse0", "keyboard")] {
            let d = sys.path().join(node).join("device");
            std::fs::create_dir_all(&d).unwrap();
            std::fs::write(d.join("name"), format!("{name}\n")).unwrap();
        }
        let dev = Path::new("/dev/input");

        assert_eq!(find_devices_in(sys.path(), dev, "keyboard"), vec![dev.join("event3")]);
        assert!(find_devices_in(sys.path(), dev, "gamepad").is_empty());
        assert_eq!(
            find_devices_in(sys.path(), dev, "/dev/input/event7"),
            vec![PathBuf::from("/dev/input/event7")]
        );
    }

    #[test]
    fn mode_names() {
        assert_eq!(RemoteMode::parse("Forward"), Some(RemoteMode::Forward));
        assert_eq!(RemoteMode::parse("x"), None);
        assert_eq!(serde_json::to_value(RemoteMode::Command).unwrap(), "command");
    }
}
