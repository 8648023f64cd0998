//! Persistent Blacklist
//!
//! Append-only set of identifiers that must never be forwarded again.
//! Loaded once at startup from a text file (one identifier per line) and
//! grown by appending; existing file content is never rewritten.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Errors that can occur while reading or appending the blacklist file
#[derive(Error, Debug)]
pub enum BlacklistError {
    #[error("Failed to read blacklist {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Blacklist entry {0:?} spans more than one line")]
    InvalidEntry(String),

    #[error("Failed to append to blacklist {path}: {source}")]
    Append {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// In-memory blacklist backed by an append-only file
#[derive(Debug)]
pub struct Blacklist {
    path: PathBuf,
    entries: HashSet<String>,
}

impl Blacklist {
    /// Load every line of `path` into memory
    ///
    /// A missing file is not an error: the blacklist starts empty and the file
    /// is created by the first [`Blacklist::add`].
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, BlacklistError> {
        let path = path.into();
        let mut entries = HashSet::new();

        match File::open(&path) {
            Ok(file) => {
                for line in BufReader::new(file).lines() {
                    let line = line.map_err(|source| BlacklistError::Read {
                        path: path.display().to_string(),
                        source,
                    })?;
                    let id = line.trim();
                    if !id.is_empty() {
                        entries.insert(id.to_string());
                    }
                }
                info!("Blacklist loaded: {} entries from {}", entries.len(), path.display());
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(
                    "Blacklist file {} not found, starting with an empty blacklist",
                    path.display()
                );
            }
            Err(source) => {
                return Err(BlacklistError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        }

        Ok(Self { path, entries })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains(id)
    }

    /// Insert `id` and append it to the backing file
    ///
    /// Returns `Ok(false)` without touching the file when `id` is already
    /// present. On a write failure the entry stays in memory so the current
    /// session still suppresses it. An id containing a line break is refused
    /// since it could not be read back as a single entry.
    pub fn add(&mut self, id: &str) -> Result<bool, BlacklistError> {
        if id.contains(['\n', '\r']) {
            return Err(BlacklistError::InvalidEntry(id.to_string()));
        }
        if !self.entries.insert(id.to_string()) {
            return Ok(false);
        }
        self.append_line(id)?;
        Ok(true)
    }

    fn append_line(&self, id: &str) -> Result<(), BlacklistError> {
        let to_err = |source| BlacklistError::Append {
            path: self.path.display().to_string(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(to_err)?;
        writeln!(file, "{}", id).map_err(to_err)?;
        file.flush().map_err(to_err)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
