// --- Playlist ---------------------------------------------------------------
//
// The playlist is derived entirely from one folder on disk. A rebuild walks the
// folder in three passes:
//   1) visual files (video / image / html page) become items
//   2) `.mp3` files with the same base name become the item's audio track, and
//      `.mp0` sidecars mark the item as "clear audio" instead
//   3) an optional `presentation.json` merges extra cues into matching items
//
// `current` is an index into `items`. Only the player task mutates a playlist,
// so rebuilds and starts never interleave.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::item::{stem, Item, ItemSummary, ItemType};
use crate::message::Message;
use crate::player::PlayerHandle;

pub const PRESENTATION_FILE: &str = "presentation.json";

const AUDIO_EXT: &str = "mp3";
/// Sidecar that means "this item plays without audio".
const MUTE_EXT: &str = "mp0";

/// Events closer together than this are reported as one change.
pub const WATCH_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
pub struct Playlist {
    dir: PathBuf,
    items: Vec<Item>,
    current: Option<usize>,
}

/// `presentation.json` layout. Older files use capitalized keys.
#[derive(Debug, Default, Deserialize)]
struct Presentation {
    #[serde(default, alias = "Items")]
    items: Vec<PresentationEntry>,
}

#[derive(Debug, Deserialize)]
struct PresentationEntry {
    #[serde(default, alias = "Visual")]
    visual: String,
    #[serde(default, alias = "Cues")]
    cues: BTreeMap<String, String>,
}

impl Playlist {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            items: Vec::new(),
            current: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[cfg(test)]
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Item> {
        self.items.get(index)
    }

    pub fn current(&self) -> Option<&Item> {
        self.current.and_then(|i| self.items.get(i))
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn set_current(&mut self, index: usize) -> Result<()> {
        if index >= self.items.len() {
            return Err(Error::InvalidArgument(format!(
                "index {index} out of range (playlist has {} items)",
                self.items.len()
            )));
        }
        self.current = Some(index);
        Ok(())
    }

    pub fn summaries(&self) -> Vec<ItemSummary> {
        self.items.iter().map(Item::summary).collect()
    }

    /// Position of an item by identity. The full file name is accepted too,
    /// because that is what the control page sends.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.items
            .iter()
            .position(|item| item.name() == name || item.file_name() == name)
    }

    /// Index after `current`, wrapping to the first item.
    pub fn next(&self) -> Result<usize> {
        let i = self.current.ok_or(Error::NoCurrentItem)?;
        Ok((i + 1) % self.items.len())
    }

    /// Index before `current`, wrapping to the last item.
    pub fn previous(&self) -> Result<usize> {
        let i = self.current.ok_or(Error::NoCurrentItem)?;
        Ok(if i == 0 { self.items.len() - 1 } else { i - 1 })
    }

    /// Rescan the playlist's own directory.
    pub fn rebuild(&mut self) -> Result<()> {
        let dir = self.dir.clone();
        self.rebuild_from_folder(&dir)
    }

    /// Replace the items with the contents of `dir`.
    ///
    /// Items are cleared before the directory is read, so on failure the
    /// playlist is empty. The current item survives a rebuild only if an item
    /// with the same identity is still there.
    pub fn rebuild_from_folder(&mut self, dir: &Path) -> Result<()> {
        let previous = self.current().map(Item::name);

        self.items.clear();
        self.current = None;
        self.dir = dir.to_path_buf();

        let unavailable = |reason: String| Error::DirectoryUnavailable {
            dir: dir.display().to_string(),
            reason,
        };

        if !dir.is_dir() {
            return Err(unavailable("directory does not exist".into()));
        }

        let rd = std::fs::read_dir(dir).map_err(|e| unavailable(e.to_string()))?;
        let mut files = Vec::new();
        for ent in rd {
            let ent = ent.map_err(|e| unavailable(e.to_string()))?;
            let p = ent.path();
            if p.is_file() {
                files.push(p);
            }
        }
        files.sort();

        for path in &files {
            if let Some(kind) = lowercase_ext(path).and_then(|e| ItemType::from_extension(&e)) {
                self.items.push(Item::new(path.clone(), kind));
            }
        }

        for path in &files {
            let Some(ext) = lowercase_ext(path) else {
                continue;
            };
            if ext != AUDIO_EXT && ext != MUTE_EXT {
                continue;
            }
            let base = stem(path);
            if let Some(item) = self.items.iter_mut().find(|i| i.name() == base) {
                if ext == AUDIO_EXT {
                    item.audio = Some(path.clone());
                } else {
                    item.cues.insert("clear".into(), "audio".into());
                }
            }
        }

        let presentation = dir.join(PRESENTATION_FILE);
        if presentation.is_file() {
            self.apply_presentation(&presentation);
        }

        self.current = previous.and_then(|name| self.index_of(&name));

        debug!("playlist rebuilt from {}: {} items", dir.display(), self.items.len());
        Ok(())
    }

    /// Merge cues from the presentation descriptor. A pattern that is not a
    /// valid regex is compared against file names literally and only the first
    /// match gets the cues.
    fn apply_presentation(&mut self, path: &Path) {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) => {
                warn!("can't read presentation file '{}': {e}", path.display());
                return;
            }
        };
        let presentation: Presentation = match serde_json::from_str(&data) {
            Ok(p) => p,
            Err(e) => {
                warn!("ignoring malformed presentation file '{}': {e}", path.display());
                return;
            }
        };

        for entry in presentation.items {
            match Regex::new(&entry.visual) {
                Ok(re) => {
                    for item in self.items.iter_mut().filter(|i| re.is_match(&i.file_name())) {
                        item.cues.extend(entry.cues.clone());
                    }
                }
                Err(_) => {
                    debug!("presentation pattern '{}' is not a regex, matching by name", entry.visual);
                    if let Some(item) = self.items.iter_mut().find(|i| i.file_name() == entry.visual) {
                        item.cues.extend(entry.cues.clone());
                    }
                }
            }
        }
    }
}

fn lowercase_ext(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

// --- Directory watcher ------------------------------------------------------

/// Watch `dir` for content changes for the rest of the process lifetime.
///
/// Each batch of changes produces one `playlist.newItems` push on the control
/// connection and a rebuild request to the player.
pub fn spawn_watch(dir: PathBuf, control: Arc<Connection>, player: PlayerHandle) -> anyhow::Result<()> {
    let (tx, rx) = mpsc::unbounded_channel::<notify::Result<notify::Event>>();
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    info!("watching {} for playlist changes", dir.display());

    tokio::spawn(async move {
        // The watcher stops delivering events once dropped; keep it owned here.
        let _watcher: RecommendedWatcher = watcher;
        watch_loop(rx, control, Some(player), WATCH_DEBOUNCE).await;
    });
    Ok(())
}

/// Only events that change what a rescan would find.
fn is_content_change(kind: &EventKind) -> bool {
    use notify::event::ModifyKind;
    match kind {
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Any => true,
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        EventKind::Modify(_) => true,
        EventKind::Access(_) | EventKind::Other => false,
    }
}

pub(crate) async fn watch_loop(
    mut events: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    control: Arc<Connection>,
    player: Option<PlayerHandle>,
    debounce: Duration,
) {
    let relevant = |res: notify::Result<notify::Event>| match res {
        Ok(ev) => {
            debug!("file change event: {:?} {:?}", ev.kind, ev.paths);
            is_content_change(&ev.kind)
        }
        Err(e) => {
            warn!("directory watch error: {e}");
            false
        }
    };

    loop {
        let Some(first) = events.recv().await else {
            info!("directory watch channel closed; stopping watcher");
            return;
        };
        let mut changed = relevant(first);

        // Collapse editor/copy bursts into a single notification.
        let deadline = tokio::time::Instant::now() + debounce;
        let mut closed = false;
        loop {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Some(res)) => changed |= relevant(res),
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_) => break,
            }
        }

        if changed {
            if let Some(player) = &player {
                player.request_rebuild().await;
            }
            let msg = Message::push("playlist", "newItems", "detected file change. Get new items.");
            if let Err(e) = control.send(msg).await {
                debug!("no control client to notify about new items: {e}");
            }
        }

        if closed {
            info!("directory watch channel closed; stopping watcher");
            return;
        }
    }
}
