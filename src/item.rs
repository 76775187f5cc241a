use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// What kind of renderer an item needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Video,
    Image,
    Browser,
}

impl ItemType {
    /// Classify a (lowercase) file extension. Unsupported extensions yield `None`.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "mp4" | "webm" => Some(Self::Video),
            "jpg" | "jpeg" | "png" => Some(Self::Image),
            "html" => Some(Self::Browser),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Image => "image",
            Self::Browser => "browser",
        }
    }
}

/// One playlist entry: a visual file, optionally paired with an audio file,
/// plus free-form cues attached during the scan.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub visual: PathBuf,
    pub audio: Option<PathBuf>,
    pub kind: ItemType,
    pub cues: BTreeMap<String, String>,
}

/// Wire form used by `playlist.getItems`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemSummary {
    pub visual: String,
    pub audio: String,
    #[serde(rename = "type")]
    pub kind: ItemType,
    pub cues: BTreeMap<String, String>,
}

impl Item {
    pub fn new(visual: impl Into<PathBuf>, kind: ItemType) -> Self {
        Self {
            visual: visual.into(),
            audio: None,
            kind,
            cues: BTreeMap::new(),
        }
    }

    /// Identity of the item: the visual file name without its extension.
    pub fn name(&self) -> String {
        stem(&self.visual)
    }

    /// Visual file name including the extension.
    pub fn file_name(&self) -> String {
        self.visual
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn audio_name(&self) -> Option<String> {
        self.audio
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
    }

    /// Files named like `intro_LOOP.mp4` repeat until replaced.
    pub fn is_loop(&self) -> bool {
        self.name().ends_with("LOOP")
    }

    pub fn cue(&self, key: &str) -> Option<&str> {
        self.cues.get(key).map(String::as_str)
    }

    pub fn summary(&self) -> ItemSummary {
        ItemSummary {
            visual: self.file_name(),
            audio: self.audio_name().unwrap_or_default(),
            kind: self.kind,
            cues: self.cues.clone(),
        }
    }
}

/// File name without extension. Paths on Linux are bytes; lossy is fine for
/// matching names the operator typed.
pub(crate) fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_strips_extension() {
        let mut item = Item::new("/media/testVideo.mp4", ItemType::Video);
        item.audio = Some("/media/testAudio.mp3".into());

        assert_eq!(item.name(), "testVideo");
        assert_eq!(item.file_name(), "testVideo.mp4");

        let s = item.summary();
        assert_eq!(s.visual, "testVideo.mp4");
        assert_eq!(s.audio, "testAudio.mp3");
        assert_eq!(s.kind, ItemType::Video);
    }

    #[test]
    fn loop_marker() {
        assert!(Item::new("welcomeLOOP.mp4", ItemType::Video).is_loop());
        assert!(!Item::new("LOOPwelcome.mp4", ItemType::Video).is_loop());
    }

    #[test]
    fn summary_type_key() {
        let v = serde_json::to_value(Item::new("a.html", ItemType::Browser).summary()).unwrap();
        assert_eq!(v["type"], "browser");
        assert_eq!(v["audio"], "");
    }
}
