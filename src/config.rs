// --- Configuration & persistence (SQLite) -----------------------------------
//
// Settings live in a single-row table so the box keeps its setup across
// reboots and SD card images can be pre-seeded with the sqlite3 CLI. The last
// item that started playing is kept in a second single-row table; on boot the
// player resumes from it.
//
// DB location:
// - Can be overridden with PIPLAYER_DB_PATH
// - Defaults to $HOME/.config/pi-player/piplayer.db
//
// Environment overrides are applied on top of the stored row at startup and are
// not written back.
//
// Note: rusqlite is synchronous. We call it via spawn_blocking to avoid blocking tokio.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::remote::RemoteMode;

/// Which backend plays video items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamerKind {
    Omxplayer,
    Browser,
}

impl StreamerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Omxplayer => "omxplayer",
            Self::Browser => "browser",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "omxplayer" => Some(Self::Omxplayer),
            "browser" | "chrome" | "chromium" => Some(Self::Browser),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Free-form label shown on the control page.
    pub location: String,
    /// Media folder the playlist is built from.
    pub directory: PathBuf,
    /// omxplayer `-o` value: hdmi, local, both.
    pub audio_output: String,
    pub streamer: StreamerKind,
    /// `/dev/input/eventN` paths or device names as listed in sysfs.
    pub remote_devices: Vec<String>,
    pub remote_mode: RemoteMode,
    /// Empty disables launching a browser.
    pub kiosk_browser: String,
    pub viewer_url: String,
    /// Decoder binary; from PIPLAYER_OMXPLAYER only.
    #[serde(skip)]
    pub omxplayer: String,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            location: "PiPlayer".into(),
            directory: default_media_dir(),
            audio_output: "hdmi".into(),
            streamer: StreamerKind::Omxplayer,
            remote_devices: vec!["keyboard".into()],
            remote_mode: RemoteMode::Command,
            kiosk_browser: String::new(),
            viewer_url: "http://localhost:8080/viewer".into(),
            omxplayer: "omxplayer".into(),
        }
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/root"))
}

fn default_media_dir() -> PathBuf {
    home_dir().join("Documents").join("pi-player")
}

pub fn db_path() -> String {
    std::env::var("PIPLAYER_DB_PATH").unwrap_or_else(|_| {
        home_dir()
            .join(".config")
            .join("pi-player")
            .join("piplayer.db")
            .display()
            .to_string()
    })
}

fn open_db(path: &str) -> anyhow::Result<Connection> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(Connection::open(path)?)
}

pub fn db_init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;

        CREATE TABLE IF NOT EXISTS player_config (
            id             INTEGER PRIMARY KEY CHECK (id = 1),
            location       TEXT NOT NULL,
            directory      TEXT NOT NULL,
            audio_output   TEXT NOT NULL,
            streamer       TEXT NOT NULL,
            remote_devices TEXT NOT NULL,
            remote_mode    TEXT NOT NULL,
            kiosk_browser  TEXT NOT NULL,
            viewer_url     TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS playback_state (
            id         INTEGER PRIMARY KEY CHECK (id = 1),
            last_item  TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}

pub fn db_load_config(conn: &Connection) -> anyhow::Result<Option<PlayerConfig>> {
    db_init(conn)?;

    let row_opt = conn.query_row(
        "SELECT location, directory, audio_output, streamer, remote_devices, remote_mode, kiosk_browser, viewer_url
         FROM player_config WHERE id = 1",
        [],
        |row| {
            let defaults = PlayerConfig::default();
            let streamer: String = row.get(3)?;
            let devices: String = row.get(4)?;
            let mode: String = row.get(5)?;
            Ok(PlayerConfig {
                location: row.get(0)?,
                directory: PathBuf::from(row.get::<_, String>(1)?),
                audio_output: row.get(2)?,
                streamer: StreamerKind::parse(&streamer).unwrap_or(defaults.streamer),
                remote_devices: split_list(&devices),
                remote_mode: RemoteMode::parse(&mode).unwrap_or(defaults.remote_mode),
                kiosk_browser: row.get(6)?,
                viewer_url: row.get(7)?,
                omxplayer: defaults.omxplayer,
            })
        },
    );

    match row_opt {
        Ok(cfg) => Ok(Some(cfg)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn db_save_config(conn: &mut Connection, cfg: &PlayerConfig) -> anyhow::Result<()> {
    db_init(conn)?;
    conn.execute(
        "INSERT INTO player_config (id, location, directory, audio_output, streamer, remote_devices, remote_mode, kiosk_browser, viewer_url)
         VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
           location=excluded.location,
           directory=excluded.directory,
           audio_output=excluded.audio_output,
           streamer=excluded.streamer,
           remote_devices=excluded.remote_devices,
           remote_mode=excluded.remote_mode,
           kiosk_browser=excluded.kiosk_browser,
           viewer_url=excluded.viewer_url",
        params![
            cfg.location,
            cfg.directory.display().to_string(),
            cfg.audio_output,
            cfg.streamer.as_str(),
            cfg.remote_devices.join(","),
            cfg.remote_mode.as_str(),
            cfg.kiosk_browser,
            cfg.viewer_url,
        ],
    )?;
    Ok(())
}

pub fn db_load_last_item(conn: &Connection) -> anyhow::Result<Option<String>> {
    db_init(conn)?;
    match conn.query_row("SELECT last_item FROM playback_state WHERE id = 1", [], |row| {
        row.get::<_, String>(0)
    }) {
        Ok(name) => Ok(Some(name)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn db_save_last_item(conn: &mut Connection, name: &str) -> anyhow::Result<()> {
    db_init(conn)?;
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    conn.execute(
        "INSERT INTO playback_state (id, last_item, updated_at)
         VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET
           last_item=excluded.last_item,
           updated_at=excluded.updated_at",
        params![name, now],
    )?;
    Ok(())
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Apply PIPLAYER_* overrides. `var` is `std::env::var` outside of tests.
pub fn apply_env_overrides(cfg: &mut PlayerConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(dir) = var("PIPLAYER_MEDIA_DIR") {
        cfg.directory = PathBuf::from(dir);
    }
    if let Some(out) = var("PIPLAYER_AUDIO_OUTPUT") {
        cfg.audio_output = out;
    }
    if let Some(s) = var("PIPLAYER_STREAMER") {
        match StreamerKind::parse(&s) {
            Some(kind) => cfg.streamer = kind,
            None => warn!("ignoring unknown PIPLAYER_STREAMER '{s}'"),
        }
    }
    if let Some(devices) = var("PIPLAYER_REMOTE") {
        cfg.remote_devices = split_list(&devices);
    }
    if let Some(mode) = var("PIPLAYER_REMOTE_MODE") {
        match RemoteMode::parse(&mode) {
            Some(m) => cfg.remote_mode = m,
            None => warn!("ignoring unknown PIPLAYER_REMOTE_MODE '{mode}'"),
        }
    }
    if let Some(program) = var("PIPLAYER_OMXPLAYER") {
        cfg.omxplayer = program;
    }
}

/// Stored config (or defaults), with env overrides applied.
///
/// First boot writes the defaults so the row exists for operators to edit.
pub async fn load_config_or_default(path: String) -> PlayerConfig {
    let res = tokio::task::spawn_blocking(move || -> anyhow::Result<PlayerConfig> {
        let mut conn = open_db(&path)?;
        match db_load_config(&conn)? {
            Some(cfg) => Ok(cfg),
            None => {
                let cfg = PlayerConfig::default();
                db_save_config(&mut conn, &cfg)?;
                info!("wrote default player config to {path}");
                Ok(cfg)
            }
        }
    })
    .await;

    let mut cfg = match res {
        Ok(Ok(cfg)) => cfg,
        Ok(Err(e)) => {
            warn!("failed to load config from SQLite: {e}. Using defaults.");
            PlayerConfig::default()
        }
        Err(e) => {
            warn!("config load task failed: {e}. Using defaults.");
            PlayerConfig::default()
        }
    };
    apply_env_overrides(&mut cfg, |k| std::env::var(k).ok());
    cfg
}

pub async fn load_last_item(path: String) -> Option<String> {
    let res = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<String>> {
        let conn = open_db(&path)?;
        db_load_last_item(&conn)
    })
    .await;

    match res {
        Ok(Ok(name)) => name,
        Ok(Err(e)) => {
            warn!("failed to load last played item: {e}");
            None
        }
        Err(e) => {
            warn!("last item load task failed: {e}");
            None
        }
    }
}

/// Best effort; playback never waits on the database.
pub fn persist_last_item(path: String, name: String) {
    tokio::task::spawn_blocking(move || {
        let res = open_db(&path).and_then(|mut conn| db_save_last_item(&mut conn, &name));
        if let Err(e) = res {
            warn!("failed to persist last played item: {e}");
        }
    });
}

/// The media folder is created on first boot so the watcher has something to watch.
pub fn ensure_media_dir(cfg: &PlayerConfig) -> anyhow::Result<()> {
    if !cfg.directory.exists() {
        std::fs::create_dir_all(&cfg.directory)?;
        info!("created media folder {}", cfg.directory.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_db_has_no_config() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(db_load_config(&conn).unwrap(), None);
        assert_eq!(db_load_last_item(&conn).unwrap(), None);
    }

    #[test]
    fn config_round_trips_through_sqlite() {
        let mut conn = Connection::open_in_memory().unwrap();
        let mut cfg = PlayerConfig {
            location: "Lobby".into(),
            directory: "/srv/media".into(),
            streamer: StreamerKind::Browser,
            remote_devices: vec!["/dev/input/event3".into(), "flirc".into()],
            remote_mode: RemoteMode::Forward,
            kiosk_browser: "chromium-browser".into(),
            ..Default::default()
        };
        db_save_config(&mut conn, &cfg).unwrap();
        assert_eq!(db_load_config(&conn).unwrap(), Some(cfg.clone()));

        cfg.audio_output = "local".into();
        db_save_config(&mut conn, &cfg).unwrap();
        let stored = db_load_config(&conn).unwrap().unwrap();
        assert_eq!(stored.audio_output, "local");
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM player_config", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn last_item_is_upserted() {
        let mut conn = Connection::open_in_memory().unwrap();
        db_save_last_item(&mut conn, "intro").unwrap();
        db_save_last_item(&mut conn, "main").unwrap();
        assert_eq!(db_load_last_item(&conn).unwrap().as_deref(), Some("main"));
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("PIPLAYER_MEDIA_DIR", "/mnt/share"),
            ("PIPLAYER_STREAMER", "browser"),
            ("PIPLAYER_REMOTE", "event0, keyboard ,"),
            ("PIPLAYER_REMOTE_MODE", "bogus"),
            ("PIPLAYER_OMXPLAYER", "/usr/local/bin/omx"),
        ]
        .into_iter()
        .collect();

        let mut cfg = PlayerConfig::default();
        apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.directory, PathBuf::from("/mnt/share"));
        assert_eq!(cfg.streamer, StreamerKind::Browser);
        assert_eq!(cfg.remote_devices, vec!["event0", "keyboard"]);
        assert_eq!(cfg.remote_mode, RemoteMode::Command);
        assert_eq!(cfg.omxplayer, "/usr/local/bin/omx");
        assert_eq!(cfg.audio_output, "hdmi");
    }

    #[tokio::test]
    async fn first_boot_writes_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("piplayer.db").display().to_string();

        let cfg = load_config_or_default(path.clone()).await;
        assert_eq!(cfg.location, "PiPlayer");
        let conn = Connection::open(&path).unwrap();
        assert!(db_load_config(&conn).unwrap().is_some());
    }
}
