use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use beacon_duty_watch_shared::eth_spec::Slot;

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("failed to read cursor file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("cursor file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to encode cursor state: {0}")]
    Encode(serde_json::Error),

    #[error("failed to persist cursor file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("cursor would regress from {current} to {requested}")]
    Regression { current: Slot, requested: Slot },
}

#[derive(Debug, Serialize, Deserialize)]
struct CursorFile {
    cursor: Slot,
}

/// The persisted progress frontier: the last fully processed slot. Written
/// after every successful batch and reloaded at startup, so forward motion
/// resumes where the previous run stopped. Never regresses.
pub struct CursorStore {
    path: PathBuf,
    current: Slot,
}

impl CursorStore {
    /// Opens the store, preferring the persisted slot over `initial` so a
    /// restart cannot replay already-notified slots.
    pub fn open(path: PathBuf, initial: Slot) -> Result<Self, CursorError> {
        let current = match fs::read(&path) {
            Ok(raw) => {
                let persisted: CursorFile = serde_json::from_slice(&raw)
                    .map_err(|source| CursorError::Parse {
                        path: path.clone(),
                        source,
                    })?;
                if persisted.cursor < initial {
                    tracing::info!(
                        persisted = persisted.cursor,
                        initial,
                        "Configured initial cursor is ahead of the persisted one, fast-forwarding"
                    );
                    initial
                } else {
                    persisted.cursor
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => initial,
            Err(source) => return Err(CursorError::Read { path, source }),
        };
        tracing::info!(cursor = current, path = ?path, "Opened cursor store");
        Ok(Self { path, current })
    }

    pub fn current(&self) -> Slot {
        self.current
    }

    /// Persists the new frontier; must not move backwards.
    pub fn advance(&mut self, to: Slot) -> Result<(), CursorError> {
        if to < self.current {
            return Err(CursorError::Regression {
                current: self.current,
                requested: to,
            });
        }
        self.persist(to)?;
        self.current = to;
        Ok(())
    }

    fn persist(&self, to: Slot) -> Result<(), CursorError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| CursorError::Write {
                    path: self.path.clone(),
                    source,
                })?;
            }
        }
        let json =
            serde_json::to_string_pretty(&CursorFile { cursor: to }).map_err(CursorError::Encode)?;
        fs::write(&self.path, json).map_err(|source| CursorError::Write {
            path: self.path.clone(),
            source,
        })
    }
}
