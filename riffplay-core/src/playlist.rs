//! JSON playlist
//!
//! ```json
//! { "title": "Demo reel",
//!   "videos": [ { "id": "intro", "display_name": "Intro", "video_file": "intro.avi", "duration_sec": 42 } ] }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Entries past this are dropped with a warning.
pub const MAX_PLAYLIST_ENTRIES: usize = 16;

/// Playlist files larger than this are rejected.
pub const MAX_PLAYLIST_BYTES: u64 = 64 * 1024;

pub const DEFAULT_TITLE: &str = "Video Player";

#[derive(Debug, Error)]
pub enum PlaylistError {
    #[error("Failed to read playlist: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse playlist: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid playlist: {0}")]
    Invalid(String),
    #[error("No playlist entry matches {0:?}")]
    NoSuchEntry(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaylistEntry {
    pub id: String,
    pub display_name: String,
    pub video_file: String,
    pub duration_sec: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Playlist {
    pub title: String,
    pub entries: Vec<PlaylistEntry>,
    /// Directory that relative `video_file` paths resolve against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

// On-disk shape; every field optional so a sloppy file still loads.
#[derive(Deserialize)]
struct RawPlaylist {
    title: Option<String>,
    videos: Option<Vec<RawEntry>>,
}

#[derive(Deserialize)]
struct RawEntry {
    id: Option<String>,
    display_name: Option<String>,
    video_file: Option<String>,
    duration_sec: Option<u32>,
}

impl Playlist {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PlaylistError> {
        let path = path.as_ref();
        let size = std::fs::metadata(path)?.len();
        if size == 0 || size > MAX_PLAYLIST_BYTES {
            return Err(PlaylistError::Invalid(format!(
                "file size {} outside 1..={} bytes",
                size, MAX_PLAYLIST_BYTES
            )));
        }

        let content = std::fs::read_to_string(path)?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let playlist = Self::parse(&content, base_dir)?;

        tracing::info!(
            "Loaded playlist '{}' with {} videos",
            playlist.title,
            playlist.entries.len()
        );
        Ok(playlist)
    }

    pub fn parse(json: &str, base_dir: PathBuf) -> Result<Self, PlaylistError> {
        let raw: RawPlaylist = serde_json::from_str(json)?;
        let mut videos = raw
            .videos
            .ok_or_else(|| PlaylistError::Invalid("no videos array".into()))?;

        if videos.len() > MAX_PLAYLIST_ENTRIES {
            tracing::warn!(
                "Playlist has {} videos, limiting to {}",
                videos.len(),
                MAX_PLAYLIST_ENTRIES
            );
            videos.truncate(MAX_PLAYLIST_ENTRIES);
        }

        let entries = videos
            .into_iter()
            .enumerate()
            .map(|(i, v)| {
                let id = v.id.unwrap_or_default();
                let entry = PlaylistEntry {
                    display_name: v.display_name.unwrap_or_else(|| id.clone()),
                    id,
                    video_file: v.video_file.unwrap_or_default(),
                    duration_sec: v.duration_sec.unwrap_or(0),
                };
                tracing::debug!("Video {}: {} ({}s)", i, entry.display_name, entry.duration_sec);
                entry
            })
            .collect();

        Ok(Self {
            title: raw.title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            entries,
            base_dir,
        })
    }

    /// Find by id, falling back to a zero-based index.
    pub fn find(&self, key: &str) -> Result<&PlaylistEntry, PlaylistError> {
        self.entries
            .iter()
            .find(|e| e.id == key)
            .or_else(|| key.parse::<usize>().ok().and_then(|i| self.entries.get(i)))
            .ok_or_else(|| PlaylistError::NoSuchEntry(key.to_string()))
    }

    /// Path of an entry's container file.
    pub fn resolve(&self, entry: &PlaylistEntry) -> Result<PathBuf, PlaylistError> {
        if entry.video_file.is_empty() {
            return Err(PlaylistError::Invalid(format!(
                "entry {:?} has no video_file",
                entry.id
            )));
        }
        Ok(self.base_dir.join(&entry.video_file))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
