//! Atomic persistence of rotation history and DJ state.
//!
//! Written once, at shutdown: serialize to a temp file in the same
//! directory, fsync, then rename over the target. A crash mid-write leaves
//! the previous state intact; there is never a half-written file at the
//! target path.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{StationError, StationResult};

/// Everything the station wants back after a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Rotation history, oldest first.
    pub rotation_history: Vec<PathBuf>,
    /// Songs played over the process lifetime, for the log line on boot.
    pub songs_played: u64,
}

/// Writes the state atomically: temp file, fsync, rename.
pub fn save(path: &Path, state: &PersistedState) -> StationResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StationError::Persist(format!("{} has no parent", path.display())))?;
    std::fs::create_dir_all(parent)
        .map_err(|e| StationError::Persist(format!("creating {}: {e}", parent.display())))?;

    let temp_path = path.with_extension("tmp");
    let json = serde_json::to_vec_pretty(state)
        .map_err(|e| StationError::Persist(format!("serializing: {e}")))?;

    let mut file = std::fs::File::create(&temp_path)
        .map_err(|e| StationError::Persist(format!("creating {}: {e}", temp_path.display())))?;
    file.write_all(&json)
        .and_then(|()| file.sync_all())
        .map_err(|e| StationError::Persist(format!("writing {}: {e}", temp_path.display())))?;
    drop(file);

    std::fs::rename(&temp_path, path)
        .map_err(|e| StationError::Persist(format!("renaming over {}: {e}", path.display())))?;

    log::info!("[Persist] State written to {}", path.display());
    Ok(())
}

/// Loads previously persisted state; `None` when there is none or it does
/// not parse (a corrupt file is logged and ignored, never fatal).
pub fn load(path: &Path) -> Option<PersistedState> {
    let raw = std::fs::read(path).ok()?;
    match serde_json::from_slice(&raw) {
        Ok(state) => Some(state),
        Err(e) => {
            log::warn!("[Persist] Ignoring unreadable state {}: {e}", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> PersistedState {
        PersistedState {
            rotation_history: vec![PathBuf::from("/music/a.mp3"), PathBuf::from("/music/b.mp3")],
            songs_played: 42,
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let state = sample_state();

        save(&path, &state).unwrap();
        assert_eq!(load(&path), Some(state));
    }

    #[test]
    fn save_replaces_existing_state_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        save(&path, &PersistedState::default()).unwrap();
        let newer = sample_state();
        save(&path, &newer).unwrap();

        assert_eq!(load(&path), Some(newer));
        // No temp file left behind.
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn missing_state_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("absent.json")).is_none());
    }

    #[test]
    fn corrupt_state_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(load(&path).is_none());
    }

    #[test]
    fn save_creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/state.json");
        save(&path, &sample_state()).unwrap();
        assert!(load(&path).is_some());
    }
}
