use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use tokio::sync::mpsc;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{error, info, warn};

mod api;
mod config;
mod connection;
mod error;
mod item;
mod message;
mod player;
mod playlist;
mod remote;
mod streamer;

use connection::Connection;
use message::Message;
use player::{Player, PlayerHandle, PlayerOptions};
use playlist::Playlist;
use streamer::{PipeStreamer, RendererStreamer};

/// Viewer answers waiting for the renderer streamer.
const ACK_QUEUE: usize = 16;
const SESSION_EVENTS: usize = 8;

#[derive(Clone)]
struct AppState {
    player: PlayerHandle,
    viewer: Arc<Connection>,
    control: Arc<Connection>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let db = config::db_path();
    let cfg = config::load_config_or_default(db.clone()).await;
    config::ensure_media_dir(&cfg)?;
    info!(
        "pi-player '{}': media {}, streamer {}, audio {}",
        cfg.location,
        cfg.directory.display(),
        cfg.streamer.as_str(),
        cfg.audio_output
    );

    let viewer = Arc::new(Connection::new("viewer"));
    let control = Arc::new(Connection::new("control"));

    let (acks_tx, acks_rx) = mpsc::channel(ACK_QUEUE);
    let (events_tx, events_rx) = mpsc::channel(SESSION_EVENTS);
    let pipe = PipeStreamer::new(cfg.omxplayer.clone(), cfg.audio_output.clone(), events_tx);
    let renderer = RendererStreamer::new(viewer.clone(), acks_rx);

    let options = PlayerOptions {
        streamer: cfg.streamer,
        kiosk_browser: cfg.kiosk_browser.clone(),
        viewer_url: cfg.viewer_url.clone(),
        db_path: Some(db),
    };
    let player = Player::new(Playlist::new(&cfg.directory), pipe, renderer, control.clone(), options).spawn(events_rx);

    tokio::spawn(api::pump(control.clone(), player.clone(), None));
    tokio::spawn(api::pump(viewer.clone(), player.clone(), Some(acks_tx)));

    if let Err(e) = playlist::spawn_watch(cfg.directory.clone(), control.clone(), player.clone()) {
        warn!("not watching {}: {e:#}", cfg.directory.display());
    }
    remote::spawn(cfg.remote_devices.clone(), cfg.remote_mode, player.clone(), viewer.clone());

    {
        let player = player.clone();
        tokio::spawn(async move {
            match player.first_run().await {
                Ok(Some(item)) => info!("first run: playing {}", item.visual),
                Ok(None) => info!("first run: nothing to play yet"),
                Err(e) => error!("first run failed: {e}"),
            }
        });
    }

    let state = AppState {
        player: player.clone(),
        viewer,
        control,
    };
    let app = build_router(state, ServeDir::new(&cfg.directory));

    // Bind loopback only; the kiosk browser runs on the same box.
    let addr: SocketAddr = std::env::var("PIPLAYER_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()?;

    info!("pi-player engine starting on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    player.shutdown().await;
    Ok(())
}

fn build_router(state: AppState, content: ServeDir) -> Router {
    Router::new()
        .route("/api", post(api_handler))
        .route("/ws/viewer", get(ws_viewer))
        .route("/ws/control", get(ws_control))
        .route("/health", get(|| async { "OK" }))
        .nest_service("/content", content)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn api_handler(State(state): State<AppState>, body: Result<Json<Message>, JsonRejection>) -> Json<Message> {
    let req = match body {
        Ok(Json(req)) => req,
        Err(e) => return Json(Message::fail(format!("Error decoding JSON request: {e}"))),
    };
    Json(api::dispatch(&state.player, req).await)
}

async fn ws_viewer(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| attach(state.viewer, socket))
}

async fn ws_control(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| attach(state.control, socket))
}

async fn attach(conn: Arc<Connection>, socket: WebSocket) {
    info!("{} client connected", conn.name());
    let (sink, stream) = socket.split();
    conn.upgrade(sink, stream).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}
