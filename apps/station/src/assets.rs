//! Cached asset index.
//!
//! The only file I/O THINK is allowed is against this cache. Directories
//! are scanned at startup and then re-scanned by a background task, never
//! on the playout path. Title/artist extraction follows the
//! `Artist - Title.ext` library convention; deeper tag parsing belongs to
//! the asset pipeline outside this process.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::AssetConfig;
use crate::intent::TrackMetadata;

/// Audio extensions the index admits.
const AUDIO_EXTENSIONS: [&str; 5] = ["mp3", "wav", "flac", "ogg", "m4a"];

/// Interval between background re-scans.
const RESCAN_INTERVAL: Duration = Duration::from_secs(300);

/// One playable file.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetEntry {
    pub path: PathBuf,
    pub metadata: TrackMetadata,
}

/// DJ production assets, grouped by filename prefix convention under
/// `DJ_PATH`: `startup*`, `shutdown*`, `id*`, `intro*`, `outro*`.
#[derive(Debug, Clone, Default)]
pub struct DjAssets {
    pub startup: Option<AssetEntry>,
    pub shutdown: Option<AssetEntry>,
    pub station_ids: Vec<AssetEntry>,
    pub intros: Vec<AssetEntry>,
    pub outros: Vec<AssetEntry>,
}

/// Thread-safe cached view of everything playable.
pub struct AssetIndex {
    config: AssetConfig,
    music: RwLock<Vec<AssetEntry>>,
    dj: RwLock<DjAssets>,
}

impl AssetIndex {
    /// Builds the index with one synchronous startup scan.
    pub fn scan(config: AssetConfig) -> Arc<Self> {
        let index = Arc::new(Self {
            config,
            music: RwLock::new(Vec::new()),
            dj: RwLock::new(DjAssets::default()),
        });
        index.rescan();
        index
    }

    /// Re-reads the configured directories into the cache.
    pub fn rescan(&self) {
        let mut music = scan_dir(&self.config.regular_music_path);
        if let Some(holiday) = &self.config.holiday_music_path {
            music.extend(scan_dir(holiday));
        }
        music.sort_by(|a, b| a.path.cmp(&b.path));

        let dj = self
            .config
            .dj_path
            .as_deref()
            .map(scan_dj_dir)
            .unwrap_or_default();

        log::info!(
            "[Assets] Index refreshed: {} songs, {} station IDs, startup={}, shutdown={}",
            music.len(),
            dj.station_ids.len(),
            dj.startup.is_some(),
            dj.shutdown.is_some(),
        );

        *self.music.write() = music;
        *self.dj.write() = dj;
    }

    /// Spawns the periodic background re-scan.
    pub fn spawn_rescan_task(self: &Arc<Self>, shutdown: CancellationToken) {
        let index = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(RESCAN_INTERVAL) => index.rescan(),
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }

    /// True when `path` is a currently indexed asset. THINK validates every
    /// selected path through this before building an intent.
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.music.read().iter().any(|e| e.path == path)
            || {
                let dj = self.dj.read();
                dj.startup.iter().any(|e| e.path == path)
                    || dj.shutdown.iter().any(|e| e.path == path)
                    || dj.station_ids.iter().any(|e| e.path == path)
                    || dj.intros.iter().any(|e| e.path == path)
                    || dj.outros.iter().any(|e| e.path == path)
            }
    }

    #[must_use]
    pub fn music(&self) -> Vec<AssetEntry> {
        self.music.read().clone()
    }

    #[must_use]
    pub fn dj(&self) -> DjAssets {
        self.dj.read().clone()
    }
}

fn scan_dir(dir: &Path) -> Vec<AssetEntry> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        log::warn!("[Assets] Cannot read {}", dir.display());
        return Vec::new();
    };

    let mut assets = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            assets.extend(scan_dir(&path));
            continue;
        }
        if is_audio(&path) {
            let metadata = metadata_from_filename(&path);
            assets.push(AssetEntry { path, metadata });
        }
    }
    assets
}

fn scan_dj_dir(dir: &Path) -> DjAssets {
    let mut dj = DjAssets::default();
    for entry in scan_dir(dir) {
        let stem = entry
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if stem.starts_with("startup") {
            dj.startup.get_or_insert(entry);
        } else if stem.starts_with("shutdown") {
            dj.shutdown.get_or_insert(entry);
        } else if stem.starts_with("id") {
            dj.station_ids.push(entry);
        } else if stem.starts_with("intro") {
            dj.intros.push(entry);
        } else if stem.starts_with("outro") {
            dj.outros.push(entry);
        }
    }
    dj
}

fn is_audio(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| AUDIO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Derives title/artist from the `Artist - Title.ext` convention; a name
/// without the separator becomes title-only.
fn metadata_from_filename(path: &Path) -> TrackMetadata {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    match stem.split_once(" - ") {
        Some((artist, title)) => TrackMetadata {
            title: Some(title.trim().to_string()),
            artist: Some(artist.trim().to_string()),
            album: None,
            duration_sec: None,
        },
        None => TrackMetadata {
            title: Some(stem),
            artist: None,
            album: None,
            duration_sec: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        File::create(&path).unwrap();
        path
    }

    fn test_index(dir: &tempfile::TempDir) -> Arc<AssetIndex> {
        AssetIndex::scan(AssetConfig {
            regular_music_path: dir.path().join("music"),
            holiday_music_path: None,
            dj_path: Some(dir.path().join("dj")),
        })
    }

    #[test]
    fn scans_music_and_dj_conventions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("music")).unwrap();
        std::fs::create_dir_all(dir.path().join("dj")).unwrap();

        let song = touch(&dir.path().join("music"), "The Analogues - Midnight Drive.mp3");
        touch(&dir.path().join("music"), "cover.jpg"); // not audio
        touch(&dir.path().join("dj"), "startup_morning.wav");
        touch(&dir.path().join("dj"), "shutdown_night.wav");
        touch(&dir.path().join("dj"), "id_retro_01.wav");
        touch(&dir.path().join("dj"), "intro_slow.wav");

        let index = test_index(&dir);
        let music = index.music();
        assert_eq!(music.len(), 1);
        assert_eq!(music[0].metadata.artist.as_deref(), Some("The Analogues"));
        assert_eq!(music[0].metadata.title.as_deref(), Some("Midnight Drive"));

        let dj = index.dj();
        assert!(dj.startup.is_some());
        assert!(dj.shutdown.is_some());
        assert_eq!(dj.station_ids.len(), 1);
        assert_eq!(dj.intros.len(), 1);
        assert!(dj.outros.is_empty());

        assert!(index.contains(&song));
        assert!(!index.contains(Path::new("/nowhere/ghost.mp3")));
    }

    #[test]
    fn rescan_picks_up_new_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("music")).unwrap();
        let index = test_index(&dir);
        assert!(index.music().is_empty());

        let added = touch(&dir.path().join("music"), "New - Arrival.mp3");
        index.rescan();
        assert!(index.contains(&added));
    }

    #[test]
    fn filename_without_separator_is_title_only() {
        let metadata = metadata_from_filename(Path::new("/music/jingle.mp3"));
        assert_eq!(metadata.title.as_deref(), Some("jingle"));
        assert!(metadata.artist.is_none());
    }

    #[test]
    fn nested_directories_are_scanned() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("music/80s/synthwave");
        std::fs::create_dir_all(&nested).unwrap();
        let song = touch(&nested, "Neon - Nights.mp3");

        let index = test_index(&dir);
        assert!(index.contains(&song));
    }
}
