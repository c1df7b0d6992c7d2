//! Best-effort replication of attendance events to a remote document store.
//!
//! Every event is written under two keys, by date and by student. Nothing
//! here ever fails the caller: errors are traced, appended to the error
//! log and dropped.

use crate::error_log::ErrorLog;
use crate::sheet::{AttendanceRecord, DATE_FORMAT, TIMESTAMP_FORMAT, TIME_FORMAT};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Characters the Realtime Database refuses in a key.
const FORBIDDEN_KEY_CHARS: [char; 6] = ['.', '$', '#', '[', ']', '/'];

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid remote key: {0:?}")]
    InvalidKey(String),
    #[error("remote rejected write: {0}")]
    Remote(String),
}

/// Document written under both keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorPayload {
    pub time: String,
    pub status: String,
    pub last_updated: String,
}

impl MirrorPayload {
    pub fn for_record(record: &AttendanceRecord) -> Self {
        Self {
            time: record.time.format(TIME_FORMAT).to_string(),
            status: record.status.as_str().to_string(),
            last_updated: chrono::Local::now().format(TIMESTAMP_FORMAT).to_string(),
        }
    }
}

/// Writes one document at one path of the remote store.
pub trait MirrorBackend {
    fn put(&self, path: &str, payload: &MirrorPayload) -> Result<(), MirrorError>;
}

/// The two document paths for a record: by date, then by student.
pub fn mirror_paths(record: &AttendanceRecord) -> Result<[String; 2], MirrorError> {
    let id = record.student_id.as_str();
    if id.contains(FORBIDDEN_KEY_CHARS.as_slice()) {
        return Err(MirrorError::InvalidKey(id.to_string()));
    }
    let date = record.date.format(DATE_FORMAT);
    Ok([
        format!("attendance/{date}/{id}"),
        format!("attendance/students/{id}/{date}"),
    ])
}

pub struct SyncMirror {
    backend: Option<Box<dyn MirrorBackend>>,
    error_log: ErrorLog,
}

impl SyncMirror {
    pub fn new(backend: Box<dyn MirrorBackend>, error_log: ErrorLog) -> Self {
        Self {
            backend: Some(backend),
            error_log,
        }
    }

    /// Mirror that replicates nothing, for stations without a remote store.
    pub fn disabled(error_log: ErrorLog) -> Self {
        Self {
            backend: None,
            error_log,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Replicate `record`. Returns whether both writes landed.
    pub fn replicate(&self, record: &AttendanceRecord) -> bool {
        let Some(backend) = &self.backend else {
            tracing::trace!(id = %record.student_id, "mirror disabled, skipping");
            return false;
        };

        match write_both(backend.as_ref(), record) {
            Ok(()) => {
                tracing::info!(id = %record.student_id, date = %record.date, "mirrored to remote store");
                true
            }
            Err(e) => {
                tracing::warn!(id = %record.student_id, error = %e, "remote mirror failed");
                self.error_log
                    .append("Error updating cloud storage", record.student_id.as_str(), &e);
                false
            }
        }
    }
}

fn write_both(backend: &dyn MirrorBackend, record: &AttendanceRecord) -> Result<(), MirrorError> {
    let payload = MirrorPayload::for_record(record);
    for path in mirror_paths(record)? {
        backend.put(&path, &payload)?;
    }
    Ok(())
}

/// Firebase Realtime Database over its REST API.
pub struct FirebaseBackend {
    client: reqwest::blocking::Client,
    base_url: String,
    auth: Option<String>,
}

impl FirebaseBackend {
    pub fn new(base_url: &str, auth: Option<String>, timeout: Duration) -> Result<Self, MirrorError> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}.json", self.base_url)
    }
}

impl MirrorBackend for FirebaseBackend {
    fn put(&self, path: &str, payload: &MirrorPayload) -> Result<(), MirrorError> {
        let mut request = self.client.put(self.url(path)).json(payload);
        if let Some(token) = &self.auth {
            request = request.query(&[("auth", token)]);
        }
        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(MirrorError::Remote(format!("{status}: {body}")));
        }
        Ok(())
    }
}
