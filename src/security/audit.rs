//! Append-only, rotating JSON-lines audit log.
//!
//! This is a durable compliance record, independent of `tracing` output:
//! every pairing, authentication, and rate-limit decision is appended here
//! as one JSON object per line. Rotation shifts `audit.log.k` to
//! `audit.log.(k+1)` from the oldest file down, drops whatever would spill
//! past `max_files`, then renames the active file to `.1` before a fresh
//! active file is started.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent<'a> {
    pub event_type: &'a str,
    pub device_id: Option<&'a str>,
    pub ip_address: Option<&'a str>,
    pub success: bool,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
}

struct State {
    file: File,
    current_size: u64,
}

pub struct AuditLogger {
    path: PathBuf,
    max_file_size_bytes: u64,
    max_files: u32,
    state: Mutex<State>,
}

impl AuditLogger {
    pub fn open(path: impl Into<PathBuf>, max_file_size_mb: u64, max_files: u32) -> std::io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_size = file.metadata()?.len();

        Ok(Self {
            path,
            max_file_size_bytes: max_file_size_mb * 1024 * 1024,
            max_files,
            state: Mutex::new(State { file, current_size }),
        })
    }

    /// Append one event. Write failures are logged via `tracing` rather
    /// than propagated — a broken audit log must never take down the
    /// relay or bridge.
    pub fn log(&self, event: &AuditEvent<'_>) {
        let mut record = serde_json::to_value(event).expect("AuditEvent always serializes");
        if let Some(obj) = record.as_object_mut() {
            obj.insert(
                "timestamp".to_string(),
                json!(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
            );
        }
        let mut line = serde_json::to_vec(&record).expect("audit record always serializes");
        line.push(b'\n');

        let mut state = self.state.lock().expect("audit logger lock poisoned");

        if state.current_size + line.len() as u64 > self.max_file_size_bytes {
            if let Err(err) = self.rotate(&mut state) {
                tracing::error!(error = %err, "audit log rotation failed");
            }
        }

        if let Err(err) = state.file.write_all(&line) {
            tracing::error!(error = %err, "audit log write failed");
            return;
        }
        state.current_size += line.len() as u64;
    }

    fn rotate(&self, state: &mut State) -> std::io::Result<()> {
        if self.max_files <= 1 {
            // Nothing to shift into; truncate by reopening fresh.
            state.file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?;
            state.current_size = 0;
            return Ok(());
        }

        for k in (1..self.max_files).rev() {
            let src = rotated_path(&self.path, k);
            let dst = rotated_path(&self.path, k + 1);
            if src.exists() {
                if dst.exists() {
                    std::fs::remove_file(&dst)?;
                }
                std::fs::rename(&src, &dst)?;
            }
        }

        let dst = rotated_path(&self.path, 1);
        std::fs::rename(&self.path, &dst)?;

        state.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        state.current_size = 0;
        Ok(())
    }
}

fn rotated_path(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}
