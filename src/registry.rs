// src/registry.rs
//! Persistent nickname/password store backed by a single JSON array on disk.
//! Every mutation rewrites the whole file. The registry is only touched from
//! the authentication path and from recipient lookups, so there are no
//! concurrent writers to worry about.

use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserRecord {
    pub username: String,
    pub password: String,
    /// Epoch seconds. Kept as f64 because existing databases carry
    /// fractional values.
    pub last_visit: f64,
}

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("could not read user database: {0}")]
    Io(#[from] io::Error),
    #[error("user database is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("user {0} is not in the database")]
    UnknownUser(String),
}

/// Epoch seconds with a fractional part, the shape existing databases use
/// for `last_visit`.
pub fn visit_stamp() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

pub struct UserRegistry {
    path: PathBuf,
}

impl UserRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Reads the whole registry. A missing file is an error, not an empty
    /// registry; operators seed the file with `[]`.
    pub fn load(&self) -> Result<Vec<UserRecord>, RegistryError> {
        let raw = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn find(&self, username: &str) -> Result<Option<UserRecord>, RegistryError> {
        Ok(self.load()?.into_iter().find(|r| r.username == username))
    }

    pub fn append(&self, record: UserRecord) -> Result<(), RegistryError> {
        let mut records = self.load()?;
        records.push(record);
        self.store(&records)
    }

    pub fn update_last_visit(&self, username: &str, now: f64) -> Result<(), RegistryError> {
        let mut records = self.load()?;
        let record = records
            .iter_mut()
            .find(|r| r.username == username)
            .ok_or_else(|| RegistryError::UnknownUser(username.to_string()))?;
        record.last_visit = now;
        self.store(&records)
    }

    fn store(&self, records: &[UserRecord]) -> Result<(), RegistryError> {
        fs::write(&self.path, serde_json::to_string(records)?)?;
        Ok(())
    }
}
