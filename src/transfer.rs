//! Config file transfer between the daemon and its clients.
//!
//! Payloads are `[file name, contents]`, with the contents carried as
//! Latin-1 text so any byte sequence survives the round trip.
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::error::JobError;

/// Reads a file, mapping every byte to the Latin-1 character of that value.
pub fn read_latin1(path: &Path) -> Result<String, JobError> {
    let bytes = fs::read(path)?;
    Ok(bytes.into_iter().map(char::from).collect())
}

/// Writes Latin-1 text back as raw bytes.
pub fn write_latin1(path: &Path, contents: &str) -> Result<(), JobError> {
    let bytes = contents
        .chars()
        .map(|c| {
            u8::try_from(u32::from(c)).map_err(|_| {
                JobError::InvalidRequest(format!(
                    "character {c:?} is not representable in Latin-1"
                ))
            })
        })
        .collect::<Result<Vec<u8>, JobError>>()?;
    fs::write(path, bytes)?;
    Ok(())
}

/// A single configured target file that clients may fetch and replace.
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    path: Option<PathBuf>,
}

impl ConfigFile {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    fn file_name(path: &Path) -> String {
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Returns `[file name, contents]`, or nothing when no file is configured.
    pub fn receive(&self) -> Result<Vec<String>, JobError> {
        match &self.path {
            Some(path) => Ok(vec![Self::file_name(path), read_latin1(path)?]),
            None => Ok(Vec::new()),
        }
    }

    /// Writes a payload after checking it names the configured file.
    pub fn send(&self, data: &[String]) -> Result<(), JobError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let expected = Self::file_name(path);
        match data {
            [name, contents] if *name == expected => write_latin1(path, contents),
            [name, _] => Err(JobError::InvalidRequest(format!(
                "config file name '{name}' does not match '{expected}'"
            ))),
            _ => Err(JobError::InvalidRequest(format!(
                "expected [name, contents], got {} elements",
                data.len()
            ))),
        }
    }
}
