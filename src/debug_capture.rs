//! Optional per-request debug capture.
//!
//! When capture is enabled a request accumulates its raw and transformed
//! bodies (and streaming chunk snapshots) in memory, flushed to `debug_logs`
//! when the request completes. A per-request ephemeral mode lets token
//! estimation capture the transformed body even when global capture is off;
//! ephemeral captures are discarded at flush.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;

/// Chunk snapshots stop growing past this many bytes per side.
const SNAPSHOT_CAP: usize = 256 * 1024;

#[derive(Debug, Default, Clone)]
struct CaptureEntry {
    raw_request: Option<String>,
    transformed_request: Option<String>,
    raw_response: Option<String>,
    transformed_response: Option<String>,
    raw_chunks: String,
    transformed_chunks: String,
    ephemeral: bool,
    created_at: i64,
}

pub struct DebugManager {
    entries: Mutex<HashMap<String, CaptureEntry>>,
    persist: bool,
}

impl DebugManager {
    pub fn new(persist: bool) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            persist,
        }
    }

    pub fn start_log(&self, request_id: &str, raw_request: &str, ephemeral: bool) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            request_id.to_string(),
            CaptureEntry {
                raw_request: Some(raw_request.to_string()),
                ephemeral,
                created_at: chrono::Utc::now().timestamp(),
                ..Default::default()
            },
        );
    }

    pub fn is_capturing(&self, request_id: &str) -> bool {
        self.entries.lock().unwrap().contains_key(request_id)
    }

    fn with_entry(&self, request_id: &str, f: impl FnOnce(&mut CaptureEntry)) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(request_id) {
            f(entry);
        }
    }

    pub fn add_transformed_request(&self, request_id: &str, body: &str) {
        self.with_entry(request_id, |e| e.transformed_request = Some(body.to_string()));
    }

    pub fn add_raw_response(&self, request_id: &str, body: &str) {
        self.with_entry(request_id, |e| e.raw_response = Some(body.to_string()));
    }

    pub fn add_transformed_response(&self, request_id: &str, body: &str) {
        self.with_entry(request_id, |e| e.transformed_response = Some(body.to_string()));
    }

    pub fn add_raw_response_chunk(&self, request_id: &str, chunk: &str) {
        self.with_entry(request_id, |e| {
            if e.raw_chunks.len() < SNAPSHOT_CAP {
                e.raw_chunks.push_str(chunk);
            }
        });
    }

    pub fn add_transformed_response_chunk(&self, request_id: &str, chunk: &str) {
        self.with_entry(request_id, |e| {
            if e.transformed_chunks.len() < SNAPSHOT_CAP {
                e.transformed_chunks.push_str(chunk);
            }
        });
    }

    /// Accumulated transformed body, for token estimation fallback.
    pub fn transformed_snapshot(&self, request_id: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap();
        entries.get(request_id).map(|e| {
            if e.transformed_chunks.is_empty() {
                e.transformed_response.clone().unwrap_or_default()
            } else {
                e.transformed_chunks.clone()
            }
        })
    }

    /// Persist (unless ephemeral) and drop the in-memory entry.
    pub fn flush(&self, request_id: &str) {
        let entry = self.entries.lock().unwrap().remove(request_id);
        let Some(entry) = entry else { return };
        if entry.ephemeral || !self.persist {
            return;
        }
        crate::db::save_debug_log(&crate::db::DebugLog {
            request_id: request_id.to_string(),
            raw_request: entry.raw_request,
            transformed_request: entry.transformed_request,
            raw_response: entry.raw_response,
            transformed_response: entry.transformed_response,
            raw_response_snapshot: if entry.raw_chunks.is_empty() { None } else { Some(entry.raw_chunks) },
            transformed_response_snapshot: if entry.transformed_chunks.is_empty() {
                None
            } else {
                Some(entry.transformed_chunks)
            },
            created_at: entry.created_at,
        });
    }

    pub fn delete(&self, request_id: &str) -> bool {
        let dropped = self.entries.lock().unwrap().remove(request_id).is_some();
        let persisted = if self.persist {
            crate::db::delete_debug_log(request_id)
        } else {
            false
        };
        dropped || persisted
    }
}

static GLOBAL: Lazy<DebugManager> = Lazy::new(|| DebugManager::new(true));

pub fn global() -> &'static DebugManager {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_accumulates_chunks() {
        let m = DebugManager::new(false);
        m.start_log("r1", "{\"model\":\"a\"}", false);
        m.add_transformed_response_chunk("r1", "data: {}\n\n");
        m.add_transformed_response_chunk("r1", "data: [DONE]\n\n");
        let snapshot = m.transformed_snapshot("r1").unwrap();
        assert!(snapshot.contains("[DONE]"));
    }

    #[test]
    fn flush_removes_entry() {
        let m = DebugManager::new(false);
        m.start_log("r2", "{}", false);
        assert!(m.is_capturing("r2"));
        m.flush("r2");
        assert!(!m.is_capturing("r2"));
    }

    #[test]
    fn untracked_request_is_ignored() {
        let m = DebugManager::new(false);
        m.add_raw_response_chunk("ghost", "data: x\n\n");
        assert!(m.transformed_snapshot("ghost").is_none());
    }
}
