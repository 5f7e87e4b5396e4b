use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::session::{AuditRecord, Session};

/// Persists one session under `<state_dir>/sessions/<id>/`: a JSON snapshot
/// rewritten on every save and an append-only JSONL audit log.
pub struct SessionStore {
    session_dir: PathBuf,
    flushed_seq: AtomicU64,
}

impl SessionStore {
    pub fn new(state_dir: impl AsRef<Path>, session_id: &str) -> Self {
        Self {
            session_dir: state_dir.as_ref().join("sessions").join(session_id),
            flushed_seq: AtomicU64::new(0),
        }
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    fn snapshot_file(&self) -> PathBuf {
        self.session_dir.join("session.json")
    }

    pub fn audit_file(&self) -> PathBuf {
        self.session_dir.join("audit.jsonl")
    }

    /// Load the snapshot. Returns `None` if it is missing or corrupted.
    pub fn load(&self) -> Option<Session> {
        let path = self.snapshot_file();
        if !path.exists() {
            return None;
        }

        let session = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Session>(&content) {
                Ok(session) => session,
                Err(e) => {
                    warn!("corrupted session file {}: {e}", path.display());
                    return None;
                }
            },
            Err(e) => {
                warn!("failed to read session file {}: {e}", path.display());
                return None;
            }
        };

        let last_seq = session.log.last().map_or(0, |r| r.seq);
        self.flushed_seq.store(last_seq, Ordering::SeqCst);
        Some(session)
    }

    /// Append log records not yet written, then rewrite the snapshot.
    pub fn save(&self, session: &Session) -> Result<()> {
        std::fs::create_dir_all(&self.session_dir)
            .map_err(|e| Error::State(format!("failed to create session dir: {e}")))?;

        let flushed = self.flushed_seq.load(Ordering::SeqCst);
        let fresh: Vec<&AuditRecord> = session.log.iter().filter(|r| r.seq > flushed).collect();
        if let Some(last) = fresh.last() {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.audit_file())
                .map_err(|e| Error::State(format!("failed to open audit log: {e}")))?;
            for record in &fresh {
                let line = serde_json::to_string(record)
                    .map_err(|e| Error::State(format!("failed to serialize audit record: {e}")))?;
                writeln!(file, "{line}")
                    .map_err(|e| Error::State(format!("failed to append audit log: {e}")))?;
            }
            self.flushed_seq.store(last.seq, Ordering::SeqCst);
            debug!(records = fresh.len(), "appended audit records");
        }

        let content = serde_json::to_string_pretty(session)
            .map_err(|e| Error::State(format!("failed to serialize session: {e}")))?;
        let tmp = self.session_dir.join("session.json.tmp");
        std::fs::write(&tmp, content)
            .map_err(|e| Error::State(format!("failed to write session file: {e}")))?;
        std::fs::rename(&tmp, self.snapshot_file())
            .map_err(|e| Error::State(format!("failed to replace session file: {e}")))?;

        Ok(())
    }

    /// Every record in the audit log, in order.
    pub fn read_audit(&self) -> Result<Vec<AuditRecord>> {
        let path = self.audit_file();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::State(format!("failed to read audit log: {e}")))?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                serde_json::from_str(l)
                    .map_err(|e| Error::State(format!("malformed audit record: {e}")))
            })
            .collect()
    }
}
