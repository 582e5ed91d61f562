use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Value of `last_index` when nothing has been completed yet.
pub const NOTHING_DONE: i64 = -1;

#[derive(Serialize, Deserialize)]
struct CheckpointFile {
    last_index: i64,
}

/// Durable cursor over the last master-list index that is fully resolved.
///
/// Every index `<= last_completed()` is written or abandoned and is never
/// submitted again. The cursor only moves forward.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    last_completed: i64,
    persisted: i64,
}

impl CheckpointStore {
    /// Missing, unreadable or malformed files all mean a fresh run.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let last_completed = match fs::read_to_string(&path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No checkpoint file found. Starting fresh.");
                NOTHING_DONE
            }
            Err(e) => {
                warn!("Failed to read checkpoint {:?}: {}. Starting fresh.", path, e);
                NOTHING_DONE
            }
            Ok(content) => match serde_json::from_str::<CheckpointFile>(&content) {
                Ok(state) if state.last_index >= 0 => {
                    info!("Resuming from game #{}", state.last_index + 1);
                    state.last_index
                }
                Ok(state) if state.last_index == NOTHING_DONE => NOTHING_DONE,
                Ok(state) => {
                    warn!(
                        "Checkpoint has invalid index {}. Starting from the beginning.",
                        state.last_index
                    );
                    NOTHING_DONE
                }
                Err(e) => {
                    warn!("Checkpoint file corrupted ({}). Starting from the beginning.", e);
                    NOTHING_DONE
                }
            },
        };

        CheckpointStore {
            path,
            last_completed,
            persisted: last_completed,
        }
    }

    pub fn last_completed(&self) -> i64 {
        self.last_completed
    }

    /// First master-list index still to do.
    pub fn next_index(&self) -> usize {
        usize::try_from(self.last_completed + 1).unwrap_or(0)
    }

    pub fn is_resuming(&self) -> bool {
        self.last_completed > NOTHING_DONE
    }

    /// Moves the cursor to `index`. Returns false (and changes nothing) if
    /// that would not move it forward.
    pub fn advance(&mut self, index: i64) -> bool {
        if index <= self.last_completed {
            return false;
        }
        self.last_completed = index;
        true
    }

    pub fn is_dirty(&self) -> bool {
        self.persisted != self.last_completed
    }

    /// Atomically replaces the checkpoint file. Once this returns the new
    /// value survives the process being killed.
    pub fn flush(&mut self) -> Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }

        let checkpoint_err = |source| PipelineError::Checkpoint { path: self.path.clone(), source };
        let json = serde_json::to_string(&CheckpointFile { last_index: self.last_completed })
            .map_err(|e| checkpoint_err(e.into()))?;

        let tmp = self.path.with_extension("json.tmp");
        let mut file = File::create(&tmp).map_err(checkpoint_err)?;
        file.write_all(json.as_bytes()).map_err(checkpoint_err)?;
        file.sync_all().map_err(checkpoint_err)?;
        drop(file);
        fs::rename(&tmp, &self.path).map_err(checkpoint_err)?;
        sync_parent(&self.path);

        self.persisted = self.last_completed;
        Ok(())
    }
}

/// Makes the rename itself durable. Directories cannot be opened for sync
/// on every platform, so failure is ignored.
fn sync_parent(path: &Path) {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
}
