// --- API dispatch -----------------------------------------------------------
//
// `POST /api` and both websockets carry the same envelope. A request names a
// component ("player" or "playlist") and a method; the answer is a response
// envelope with `success`, an `event` tag and a payload.
//
// The inbound pumps drain each websocket for the lifetime of the process:
//   - request-shaped messages are dispatched on their own task and answered
//     on the same socket
//   - `ended` from the viewer page means the shown item finished
//   - everything else from the viewer is an acknowledgement for the renderer

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::Connection;
use crate::error::Error;
use crate::item::{stem, ItemSummary};
use crate::message::Message;
use crate::player::{Capability, PlayerHandle, Target};
use crate::streamer::parse_position;

/// Handle one request envelope.
pub async fn dispatch(player: &PlayerHandle, req: Message) -> Message {
    debug!("api request {}.{} {:?}", req.component, req.method, req.arguments);
    let res = match req.component.as_str() {
        "player" => player_api(player, &req).await,
        "playlist" => playlist_api(player, &req).await,
        other => Message::fail(format!("Unknown component: {other}")),
    };
    if !res.success {
        warn!("api {}.{} failed: {} {}", req.component, req.method, res.event, res.text());
    }
    res
}

fn started(item: &ItemSummary) -> Message {
    Message::ok("videoStarted", stem(Path::new(&item.visual)))
}

/// Integer argument, or the failure envelope to answer with.
fn int_arg(req: &Message, key: &str) -> Result<i32, Message> {
    let raw = req.arg(key).ok_or_else(|| Message::fail_event("noArgumentSupplied"))?;
    raw.trim().parse().map_err(|_| Message::fail_event("argumentInvalid"))
}

async fn player_api(player: &PlayerHandle, req: &Message) -> Message {
    let method = req.method.as_str();
    match method {
        "start" => {
            let target = match (req.arg("path"), req.arg("index")) {
                (Some(path), _) => Target::Name(path.to_string()),
                (None, Some(index)) => match index.trim().parse() {
                    Ok(i) => Target::Index(i),
                    Err(_) => return Message::fail_event("argumentInvalid"),
                },
                (None, None) => return Message::fail("No movie name provided."),
            };
            let position = match req.arg("position").map(parse_position).transpose() {
                Ok(p) => p.unwrap_or_default(),
                Err(e) => return Message::fail(format!("Error converting video position: {e}")),
            };
            match player.start(target, position).await {
                Ok(item) => started(&item),
                Err(Error::ItemNotFound(name)) => {
                    Message::fail(format!("Trying to play a video that's not in the playlist: {name}"))
                }
                Err(e) => Message::fail(format!("Error trying to start video: {e}")),
            }
        }
        "next" => match player.next().await {
            Ok(item) => started(&item),
            Err(e) => Message::fail(format!("Error going to next video: {e}")),
        },
        "previous" => match player.previous().await {
            Ok(item) => started(&item),
            Err(e) => Message::fail(format!("Error going to previous video: {e}")),
        },
        "sendCommand" => {
            let Some(cmd) = req.arg("command") else {
                return Message::fail("No command sent.");
            };
            match player.send_command(cmd).await {
                Ok(()) => Message::ok("", "Command sent and executed"),
                Err(e) => Message::fail(format!("Error trying to execute command: {e}")),
            }
        }
        "status" => match serde_json::to_value(player.status()) {
            Ok(v) => Message::ok("status", v),
            Err(e) => Message::fail(format!("can't encode status: {e}")),
        },
        "play" | "pause" | "seek" | "playbackRate" | "chapter" | "volume" | "audioStream" | "subtitleStream" => {
            let op = match capability(req) {
                Ok(op) => op,
                Err(reply) => return reply,
            };
            match player.capability(op).await {
                Ok(()) => Message::ok(method, "Command sent and executed"),
                Err(Error::InvalidArgument(_)) => Message::fail_event("argumentInvalid"),
                Err(e) => Message::fail(format!("Error trying to execute {method}: {e}")),
            }
        }
        _ => Message::fail("Method not supported"),
    }
}

fn capability(req: &Message) -> Result<Capability, Message> {
    Ok(match req.method.as_str() {
        "play" => Capability::Play,
        "pause" => Capability::Pause,
        "seek" => Capability::Seek(int_arg(req, "direction")?),
        "playbackRate" => Capability::PlaybackRate(int_arg(req, "value")?),
        "chapter" => Capability::Chapter(int_arg(req, "index")?),
        "volume" => Capability::Volume(int_arg(req, "level")?),
        "audioStream" => Capability::AudioStream(int_arg(req, "index")?),
        "subtitleStream" => Capability::SubtitleStream(int_arg(req, "index")?),
        _ => return Err(Message::fail("Method not supported")),
    })
}

async fn playlist_api(player: &PlayerHandle, req: &Message) -> Message {
    match req.method.as_str() {
        "getCurrent" => match player.current().await {
            Ok(Some((_, item))) => Message::ok("current", stem(Path::new(&item.visual))),
            Ok(None) => Message::ok("noCurrent", serde_json::Value::Null),
            Err(e) => Message::fail(e.to_string()),
        },
        "setCurrent" => {
            if req.arguments.is_empty() {
                return Message::fail_event("noArgumentSupplied");
            }
            let Some(index) = req.arg("index").and_then(|i| i.trim().parse::<usize>().ok()) else {
                return Message::fail_event("argumentInvalid");
            };
            match player.set_current(index).await {
                Ok(_) => Message::ok("setCurrent", index),
                Err(Error::InvalidArgument(_)) => Message::fail_event("argumentInvalid"),
                Err(e) => Message::fail(e.to_string()),
            }
        }
        "getItems" => match player.items().await {
            Ok(items) => match serde_json::to_value(items) {
                Ok(v) => Message::ok("items", v),
                Err(e) => Message::fail(format!("can't encode items: {e}")),
            },
            Err(e) => Message::fail(format!("Error getting playlist items: {e}")),
        },
        _ => Message::fail("Method not supported"),
    }
}

/// Drain `conn` for the rest of the process lifetime.
///
/// `acks` is set for the viewer connection only.
pub async fn pump(conn: Arc<Connection>, player: PlayerHandle, acks: Option<mpsc::Sender<Message>>) {
    let mut generation = conn.subscribe();
    while let Some(msg) = conn.next_inbound(&mut generation).await {
        if msg.is_request() {
            let conn = conn.clone();
            let player = player.clone();
            tokio::spawn(async move {
                let reply = dispatch(&player, msg).await;
                if let Err(e) = conn.send(reply).await {
                    debug!("{}: reply not delivered: {e}", conn.name());
                }
            });
            continue;
        }

        if msg.event == "ended" {
            let session = msg.arg("session").and_then(|s| Uuid::parse_str(s).ok());
            player.renderer_ended(session).await;
            continue;
        }

        match &acks {
            // Nobody waiting means the answer is stale; never block the pump on it.
            Some(tx) => {
                if let Err(e) = tx.try_send(msg) {
                    debug!("{}: dropping unexpected answer: {e}", conn.name());
                }
            }
            None => debug!("{}: ignoring message with event '{}'", conn.name(), msg.event),
        }
    }
    debug!("{} pump finished", conn.name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamerKind;
    use crate::connection::testing::attach;
    use crate::player::{Player, PlayerOptions, PlayerState};
    use crate::playlist::Playlist;
    use crate::streamer::{PipeStreamer, RendererStreamer};
    use std::time::Duration;

    struct Setup {
        _tmp: tempfile::TempDir,
        player: PlayerHandle,
        control: Arc<Connection>,
        viewer: Arc<Connection>,
        acks: mpsc::Sender<Message>,
    }

    async fn setup(files: &[&str]) -> Setup {
        let tmp = tempfile::tempdir().unwrap();
        for f in files {
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
        let (acks, acks_rx) = mpsc::channel(8);
        let renderer = RendererStreamer::new(viewer.clone(), acks_rx).with_ack_timeout(Duration::from_secs(2));
        let options = PlayerOptions {
            streamer: StreamerKind::Omxplayer,
            kiosk_browser: String::new(),
            viewer_url: String::new(),
            db_path: None,
        };
        let player = Player::new(Playlist::new(tmp.path()), pipe, renderer, control.clone(), options).spawn(events_rx);
        Setup { _tmp: tmp, player, control, viewer, acks }
    }

    fn req(component: &str, method: &str, args: &[(&str, &str)]) -> Message {
        args.iter()
            .fold(Message::request(component, method), |m, (k, v)| m.with_arg(k, *v))
    }

    #[tokio::test]
    async fn start_and_query_current() {
        let s = setup(&["a.mp4", "b.mp4"]).await;
        let items = dispatch(&s.player, req("playlist", "getItems", &[])).await;
        assert!(items.success);
        assert_eq!(items.event, "items");
        assert_eq!(items.message[1]["visual"], "b.mp4");

        let none = dispatch(&s.player, req("playlist", "getCurrent", &[])).await;
        assert_eq!((none.success, none.event.as_str()), (true, "noCurrent"));

        let started = dispatch(&s.player, req("player", "start", &[("path", "b.mp4"), ("position", "1m30s")])).await;
        assert!(started.success, "{started:?}");
        assert_eq!(started.event, "videoStarted");
        assert_eq!(started.text(), "b");

        let cur = dispatch(&s.player, req("playlist", "getCurrent", &[])).await;
        assert_eq!((cur.event.as_str(), cur.text().as_str()), ("current", "b"));

        let next = dispatch(&s.player, req("player", "next", &[])).await;
        assert_eq!(next.text(), "a");

        let status = dispatch(&s.player, req("player", "status", &[])).await;
        assert_eq!(status.message["state"], "playing");
        assert_eq!(status.message["live_processes"], 1);

        s.player.shutdown().await;
    }

    #[tokio::test]
    async fn start_argument_errors() {
        let s = setup(&["a.mp4"]).await;
        s.player.rebuild().await.unwrap();

        let m = dispatch(&s.player, req("player", "start", &[])).await;
        assert_eq!((m.success, m.text().as_str()), (false, "No movie name provided."));

        let m = dispatch(&s.player, req("player", "start", &[("path", "a"), ("position", "soon")])).await;
        assert!(!m.success);
        assert!(m.text().starts_with("Error converting video position"));

        let m = dispatch(&s.player, req("player", "start", &[("path", "zzz")])).await;
        assert!(!m.success);
        assert!(m.text().contains("zzz"));

        let m = dispatch(&s.player, req("player", "start", &[("index", "x")])).await;
        assert_eq!(m.event, "argumentInvalid");
    }

    #[tokio::test]
    async fn commands() {
        let s = setup(&["a.mp4"]).await;
        s.player.rebuild().await.unwrap();

        let m = dispatch(&s.player, req("player", "sendCommand", &[])).await;
        assert_eq!(m.text(), "No command sent.");

        let m = dispatch(&s.player, req("player", "sendCommand", &[("command", "twirl")])).await;
        assert!(!m.success);
        assert!(m.text().contains("twirl"));

        dispatch(&s.player, req("player", "start", &[("index", "0")])).await;
        let m = dispatch(&s.player, req("player", "sendCommand", &[("command", "quit")])).await;
        assert_eq!((m.success, m.text().as_str()), (true, "Command sent and executed"));
        assert_eq!(s.player.status().state, PlayerState::Idle);

        let m = dispatch(&s.player, req("player", "seek", &[])).await;
        assert_eq!(m.event, "noArgumentSupplied");
        let m = dispatch(&s.player, req("player", "volume", &[("level", "loud")])).await;
        assert_eq!(m.event, "argumentInvalid");
        let m = dispatch(&s.player, req("player", "seek", &[("direction", "1")])).await;
        assert!(m.success);
    }

    #[tokio::test]
    async fn set_current_validation() {
        let s = setup(&["a.mp4", "b.mp4"]).await;
        s.player.rebuild().await.unwrap();

        let m = dispatch(&s.player, req("playlist", "setCurrent", &[])).await;
        assert_eq!((m.success, m.event.as_str()), (false, "noArgumentSupplied"));
        for bad in ["-1", "two", "2"] {
            let m = dispatch(&s.player, req("playlist", "setCurrent", &[("index", bad)])).await;
            assert_eq!(m.event, "argumentInvalid", "index {bad}");
        }
        let m = dispatch(&s.player, req("playlist", "setCurrent", &[("index", "1")])).await;
        assert!(m.success);
        assert_eq!(m.message, serde_json::json!(1));
    }

    #[tokio::test]
    async fn unknown_component_and_method() {
        let s = setup(&[]).await;
        assert!(!dispatch(&s.player, req("toaster", "start", &[])).await.success);
        let m = dispatch(&s.player, req("player", "dance", &[])).await;
        assert_eq!(m.text(), "Method not supported");
    }

    #[tokio::test]
    async fn missing_folder_fails_get_items() {
        let s = setup(&["a.mp4"]).await;
        std::fs::remove_dir_all(s._tmp.path()).unwrap();

        let m = dispatch(&s.player, req("playlist", "getItems", &[])).await;
        assert!(!m.success);
        assert!(m.text().starts_with("Error getting playlist items"), "{m:?}");
    }

    #[tokio::test]
    async fn out_of_range_steps_are_invalid() {
        let s = setup(&["a.mp4"]).await;
        s.player.rebuild().await.unwrap();
        dispatch(&s.player, req("player", "start", &[("index", "0")])).await;

        let m = dispatch(&s.player, req("player", "chapter", &[("index", "-2147483648")])).await;
        assert_eq!((m.success, m.event.as_str()), (false, "argumentInvalid"));
        let m = dispatch(&s.player, req("player", "volume", &[("level", "2000000000")])).await;
        assert_eq!(m.event, "argumentInvalid");
        assert_eq!(s.player.status().state, PlayerState::Playing);

        s.player.shutdown().await;
    }

    #[tokio::test]
    async fn pump_answers_on_the_same_socket() {
        let s = setup(&["a.mp4"]).await;
        tokio::spawn(pump(s.control.clone(), s.player.clone(), None));
        let mut peer = attach(&s.control).await;

        peer.reply(&req("playlist", "getItems", &[]));
        let answer = peer.next_message().await.unwrap();
        assert_eq!(answer.event, "items");
        assert_eq!(answer.message[0]["visual"], "a.mp4");
    }

    #[tokio::test]
    async fn viewer_pump_routes_acks_and_ended() {
        let s = setup(&["a.jpg", "b.jpg"]).await;
        s.player.rebuild().await.unwrap();
        tokio::spawn(pump(s.viewer.clone(), s.player.clone(), Some(s.acks.clone())));
        let mut page = attach(&s.viewer).await;

        // The page acknowledges through the socket, like the real one.
        let page_task = tokio::spawn(async move {
            let mut opened = Vec::new();
            while let Some(msg) = page.next_message().await {
                if msg.method == "open" {
                    opened.push(msg.arg("file").unwrap_or_default().to_string());
                    page.reply(&Message::ok("open", ""));
                    if opened.len() == 1 {
                        let ended = Message {
                            event: "ended".into(),
                            ..Default::default()
                        }
                        .with_arg("session", msg.arg("session").unwrap_or_default());
                        page.reply(&ended);
                    } else {
                        break;
                    }
                }
            }
            opened
        });

        let m = dispatch(&s.player, req("player", "start", &[("path", "a")])).await;
        assert!(m.success, "{m:?}");

        let opened = tokio::time::timeout(Duration::from_secs(5), page_task).await.unwrap().unwrap();
        assert_eq!(opened, vec!["a.jpg", "b.jpg"]);
    }
}
