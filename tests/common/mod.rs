// SPDX-License-Identifier: MIT OR Apache-2.0
//! An in-memory fake of `cozy_protocol::RemoteClient` for deterministic
//! end-to-end tests of `cozy_sync::Core` against a real sync root on disk.
//!
//! Mirrors the shape of the stub clients already used inside
//! `cozy-daemon`'s and `cozy-sync::local_side`'s own unit tests, but keeps
//! enough state (a path index, a change feed, file content) to act as a
//! full remote for a `Core` driven end to end.

use async_trait::async_trait;
use chrono::Utc;
use cozy_path::DocType;
use cozy_protocol::{
    ChangesPage, DiskUsageInfo, ProtocolError, RemoteChange, RemoteChangeKind, RemoteClient,
    RemoteEntry,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

struct FakeState {
    entries: HashMap<String, RemoteEntry>,
    content: HashMap<String, Vec<u8>>,
    trashed: HashMap<String, RemoteEntry>,
    feed: Vec<RemoteChange>,
    next_id: u64,
    seq: u64,
}

impl FakeState {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            content: HashMap::new(),
            trashed: HashMap::new(),
            feed: Vec::new(),
            next_id: 1,
            seq: 0,
        }
    }

    fn fresh_id(&mut self) -> String {
        let id = format!("r{}", self.next_id);
        self.next_id += 1;
        id
    }

    fn push(&mut self, remote_id: &str, kind: RemoteChangeKind, entry: Option<RemoteEntry>) {
        self.seq += 1;
        self.feed.push(RemoteChange {
            seq: self.seq,
            remote_id: remote_id.to_string(),
            kind,
            entry,
        });
    }
}

/// A fully in-process stand-in for the remote API, good enough to drive a
/// `Core` through real watcher/merger/executor cycles in tests.
pub struct FakeRemote {
    state: Mutex<FakeState>,
}

impl FakeRemote {
    /// An empty remote.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::new()),
        }
    }

    /// Seed the remote with a pre-existing entry and a corresponding feed
    /// row, as if it had been created before the test's `Core` started
    /// polling. Used to simulate changes that happened while offline.
    pub fn seed(&self, path: &str, doc_type: DocType, content: Option<&[u8]>) -> String {
        let mut state = self.state.lock().unwrap();
        let id = state.fresh_id();
        let md5sum = content.map(|c| {
            let digest = md5::compute(c);
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, digest.0)
        });
        let entry = RemoteEntry {
            id: id.clone(),
            path: path.to_string(),
            rev: 1,
            doc_type,
            md5sum,
            size: content.map(|c| c.len() as u64),
            updated_at: Utc::now(),
        };
        if let Some(bytes) = content {
            state.content.insert(id.clone(), bytes.to_vec());
        }
        state.entries.insert(path.to_string(), entry.clone());
        state.push(&id, RemoteChangeKind::Add, Some(entry));
        id
    }
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteClient for FakeRemote {
    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, ProtocolError> {
        let state = self.state.lock().unwrap();
        let prefix = if path.is_empty() { String::new() } else { format!("{path}/") };
        Ok(state
            .entries
            .values()
            .filter(|e| {
                e.path
                    .strip_prefix(&prefix)
                    .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
            })
            .cloned()
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<RemoteEntry, ProtocolError> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .get(path)
            .cloned()
            .ok_or_else(|| ProtocolError::NotFound(path.to_string()))
    }

    async fn create_file(
        &self,
        path: &str,
        local_path: &Path,
        content_md5: &str,
    ) -> Result<RemoteEntry, ProtocolError> {
        let bytes = tokio::fs::read(local_path)
            .await
            .map_err(|e| ProtocolError::Api { status: 500, message: e.to_string() })?;
        let mut state = self.state.lock().unwrap();
        let id = state.fresh_id();
        let entry = RemoteEntry {
            id: id.clone(),
            path: path.to_string(),
            rev: 1,
            doc_type: DocType::File,
            md5sum: Some(content_md5.to_string()),
            size: Some(bytes.len() as u64),
            updated_at: Utc::now(),
        };
        state.content.insert(id.clone(), bytes);
        state.entries.insert(path.to_string(), entry.clone());
        state.push(&id, RemoteChangeKind::Add, Some(entry.clone()));
        Ok(entry)
    }

    async fn create_dir(&self, path: &str) -> Result<RemoteEntry, ProtocolError> {
        let mut state = self.state.lock().unwrap();
        let id = state.fresh_id();
        let entry = RemoteEntry {
            id: id.clone(),
            path: path.to_string(),
            rev: 1,
            doc_type: DocType::Folder,
            md5sum: None,
            size: None,
            updated_at: Utc::now(),
        };
        state.entries.insert(path.to_string(), entry.clone());
        state.push(&id, RemoteChangeKind::Add, Some(entry.clone()));
        Ok(entry)
    }

    async fn rename(&self, id: &str, new_path: &str) -> Result<RemoteEntry, ProtocolError> {
        let mut state = self.state.lock().unwrap();
        let old_path = state
            .entries
            .iter()
            .find(|(_, e)| e.id == id)
            .map(|(p, _)| p.clone())
            .ok_or_else(|| ProtocolError::NotFound(id.to_string()))?;
        let mut entry = state.entries.remove(&old_path).unwrap();
        entry.path = new_path.to_string();
        entry.rev += 1;
        state.entries.insert(new_path.to_string(), entry.clone());
        state.push(id, RemoteChangeKind::Move { old_path }, Some(entry.clone()));
        Ok(entry)
    }

    async fn trash(&self, id: &str) -> Result<(), ProtocolError> {
        let mut state = self.state.lock().unwrap();
        let path = state
            .entries
            .iter()
            .find(|(_, e)| e.id == id)
            .map(|(p, _)| p.clone())
            .ok_or_else(|| ProtocolError::NotFound(id.to_string()))?;
        let entry = state.entries.remove(&path).unwrap();
        state.trashed.insert(path, entry.clone());
        state.push(id, RemoteChangeKind::Trash, Some(entry));
        Ok(())
    }

    async fn restore(&self, id: &str) -> Result<RemoteEntry, ProtocolError> {
        let mut state = self.state.lock().unwrap();
        let path = state
            .trashed
            .iter()
            .find(|(_, e)| e.id == id)
            .map(|(p, _)| p.clone())
            .ok_or_else(|| ProtocolError::NotFound(id.to_string()))?;
        let entry = state.trashed.remove(&path).unwrap();
        state.entries.insert(path, entry.clone());
        state.push(id, RemoteChangeKind::Restore, Some(entry.clone()));
        Ok(entry)
    }

    async fn changes(&self, since: u64, _timeout: Duration) -> Result<ChangesPage, ProtocolError> {
        let pending: Vec<RemoteChange> = {
            let state = self.state.lock().unwrap();
            state.feed.iter().filter(|c| c.seq > since).cloned().collect()
        };
        if pending.is_empty() {
            tokio::time::sleep(Duration::from_millis(30)).await;
            return Ok(ChangesPage { changes: Vec::new(), last_seq: since });
        }
        let last_seq = pending.last().map(|c| c.seq).unwrap_or(since);
        Ok(ChangesPage { changes: pending, last_seq })
    }

    async fn download(&self, path: &str, dest: &Path) -> Result<(), ProtocolError> {
        let bytes = {
            let state = self.state.lock().unwrap();
            let entry = state
                .entries
                .get(path)
                .ok_or_else(|| ProtocolError::NotFound(path.to_string()))?;
            state
                .content
                .get(&entry.id)
                .cloned()
                .ok_or_else(|| ProtocolError::NotFound(path.to_string()))?
        };
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProtocolError::Api { status: 500, message: e.to_string() })?;
        }
        tokio::fs::write(dest, bytes)
            .await
            .map_err(|e| ProtocolError::Api { status: 500, message: e.to_string() })
    }

    async fn disk_usage(&self) -> Result<DiskUsageInfo, ProtocolError> {
        let state = self.state.lock().unwrap();
        let used: u64 = state.content.values().map(|c| c.len() as u64).sum();
        Ok(DiskUsageInfo { used, quota: None })
    }
}

/// Poll `check` every 50ms until it returns `true` or `timeout` elapses.
/// Returns whether it converged, so tests can assert with a useful message
/// instead of hanging forever on a stuck sync.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
