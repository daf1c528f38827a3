//! The rotation interface THINK consumes.
//!
//! Rotation and weighting heuristics are a collaborator, not part of the
//! scheduling core; the core only depends on this trait. The default
//! implementation is a least-recently-played walk over the asset index,
//! which is enough to keep a station on air and makes the rotation history
//! a meaningful thing to persist.

use std::collections::VecDeque;
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::assets::AssetEntry;

/// What THINK asks of the rotation engine.
pub trait DjPlanner: Send + Sync {
    /// The next song to play, if any asset resolves.
    fn next_song(&self) -> Option<AssetEntry>;

    /// Optional outro for the song currently playing.
    fn outro(&self) -> Option<AssetEntry>;

    /// Zero or more station IDs to run before the next song. `legal_due`
    /// requests a legal-ID placement.
    fn station_ids(&self, legal_due: bool) -> Vec<AssetEntry>;

    /// Optional intro for the next song.
    fn intro(&self) -> Option<AssetEntry>;

    /// Records that a song actually started playing.
    fn mark_played(&self, path: &std::path::Path);

    /// Rotation history snapshot, most recent last, for persistence.
    fn history(&self) -> Vec<PathBuf>;
}

/// Least-recently-played rotation over the cached asset index.
pub struct RotationPlanner {
    index: std::sync::Arc<crate::assets::AssetIndex>,
    history: Mutex<VecDeque<PathBuf>>,
    history_cap: usize,
}

impl RotationPlanner {
    pub fn new(index: std::sync::Arc<crate::assets::AssetIndex>) -> Self {
        Self {
            index,
            history: Mutex::new(VecDeque::new()),
            history_cap: 500,
        }
    }

    /// Seeds the rotation history, typically from persisted state.
    pub fn restore_history(&self, history: Vec<PathBuf>) {
        let mut guard = self.history.lock();
        guard.clear();
        guard.extend(history.into_iter().take(self.history_cap));
    }

    /// Position of `path` in the history (older = smaller), or `None` if
    /// never played. Never-played songs sort first.
    fn recency(&self, path: &std::path::Path) -> Option<usize> {
        self.history.lock().iter().position(|p| p == path)
    }
}

impl DjPlanner for RotationPlanner {
    fn next_song(&self) -> Option<AssetEntry> {
        let music = self.index.music();
        music
            .into_iter()
            .min_by_key(|entry| match self.recency(&entry.path) {
                // Never played sorts first; otherwise the oldest history
                // position (least recently played) wins.
                None => (0usize, 0usize),
                Some(position) => (1, position),
            })
    }

    fn outro(&self) -> Option<AssetEntry> {
        self.index.dj().outros.first().cloned()
    }

    fn station_ids(&self, legal_due: bool) -> Vec<AssetEntry> {
        if !legal_due {
            return Vec::new();
        }
        self.index.dj().station_ids.first().cloned().into_iter().collect()
    }

    fn intro(&self) -> Option<AssetEntry> {
        self.index.dj().intros.first().cloned()
    }

    fn mark_played(&self, path: &std::path::Path) {
        let mut history = self.history.lock();
        history.retain(|p| p != path);
        history.push_back(path.to_path_buf());
        while history.len() > self.history_cap {
            history.pop_front();
        }
    }

    fn history(&self) -> Vec<PathBuf> {
        self.history.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::AssetIndex;
    use crate::config::AssetConfig;
    use std::fs::File;

    fn index_with_songs(names: &[&str]) -> std::sync::Arc<AssetIndex> {
        let dir = tempfile::tempdir().unwrap();
        let music = dir.path().join("music");
        std::fs::create_dir_all(&music).unwrap();
        for name in names {
            File::create(music.join(name)).unwrap();
        }
        let index = AssetIndex::scan(AssetConfig {
            regular_music_path: music,
            holiday_music_path: None,
            dj_path: None,
        });
        // The tempdir is deleted here; the index already holds its snapshot.
        index
    }

    #[test]
    fn never_played_songs_come_first() {
        let index = index_with_songs(&["a.mp3", "b.mp3", "c.mp3"]);
        let planner = RotationPlanner::new(index);

        let first = planner.next_song().unwrap();
        planner.mark_played(&first.path);

        let second = planner.next_song().unwrap();
        assert_ne!(first.path, second.path);
    }

    #[test]
    fn rotation_cycles_least_recently_played() {
        let index = index_with_songs(&["a.mp3", "b.mp3"]);
        let planner = RotationPlanner::new(index);

        let mut played = Vec::new();
        for _ in 0..4 {
            let song = planner.next_song().unwrap();
            planner.mark_played(&song.path);
            played.push(song.path);
        }
        // With two songs the rotation alternates.
        assert_eq!(played[0], played[2]);
        assert_eq!(played[1], played[3]);
        assert_ne!(played[0], played[1]);
    }

    #[test]
    fn restored_history_influences_rotation() {
        let index = index_with_songs(&["a.mp3", "b.mp3"]);
        let planner = RotationPlanner::new(index);

        let all: Vec<_> = planner.index.music();
        // Mark the first song as most recently played via restore.
        planner.restore_history(vec![all[0].path.clone()]);

        let next = planner.next_song().unwrap();
        assert_eq!(next.path, all[1].path);
    }

    #[test]
    fn empty_index_yields_no_song() {
        let index = index_with_songs(&[]);
        let planner = RotationPlanner::new(index);
        assert!(planner.next_song().is_none());
    }
}
