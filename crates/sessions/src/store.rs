//! Hub-owned session store.
//!
//! Each persisted agent occupies one directory under the store root:
//!
//! ```text
//! <store_root>/<hub_agent_id>/session.json
//! <store_root>/<hub_agent_id>/state.json
//! <store_root>/<hub_agent_id>/files/...      (agent workspace)
//! <sandbox_root>/<hub_agent_id>/             (bash cwd, removed on delete)
//! ```
//!
//! Both JSON files are written with the atomic rename pattern (write to
//! `*.tmp.<nonce>`, fsync, rename over) at mode 0600. Saves for the
//! same agent never interleave; distinct agents may save concurrently.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use hub_domain::agent_id::{is_valid_agent_id, validate_agent_id};
use hub_domain::error::{Error, Result};
use hub_domain::session::{AgentStoreState, AgentSummary, SerializedSession};

const SESSION_FILE: &str = "session.json";
const STATE_FILE: &str = "state.json";

pub struct SessionStore {
    store_root: PathBuf,
    sandbox_root: Option<PathBuf>,
    /// Per-agent write locks so same-agent saves serialize.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(store_root: impl Into<PathBuf>, sandbox_root: Option<PathBuf>) -> Self {
        Self {
            store_root: store_root.into(),
            sandbox_root,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Create the store root directory.
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.store_root)?;
        Ok(())
    }

    pub fn store_root(&self) -> &Path {
        &self.store_root
    }

    /// The agent's workspace files directory.
    pub fn files_root(&self, agent_id: &str) -> Result<PathBuf> {
        validate_agent_id(agent_id)?;
        Ok(self.store_root.join(agent_id).join("files"))
    }

    fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.store_root.join(agent_id)
    }

    fn lock_for(&self, agent_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Persist a session and its store state atomically.
    pub async fn save(
        &self,
        agent_id: &str,
        session: &SerializedSession,
        state: &AgentStoreState,
    ) -> Result<()> {
        validate_agent_id(agent_id)?;
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;

        let dir = self.agent_dir(agent_id);
        let session_json = serde_json::to_vec_pretty(session)?;
        let state_json = serde_json::to_vec_pretty(state)?;

        tokio::task::spawn_blocking(move || -> Result<()> {
            fs::create_dir_all(&dir)?;
            write_atomic(&dir.join(SESSION_FILE), &session_json)?;
            write_atomic(&dir.join(STATE_FILE), &state_json)?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Storage(format!("save task failed: {e}")))??;

        tracing::debug!(agent_id = %agent_id, "session saved");
        Ok(())
    }

    /// Load a session and its state. Returns `None` when either file is
    /// missing or fails to parse.
    pub async fn load(
        &self,
        agent_id: &str,
    ) -> Result<Option<(SerializedSession, AgentStoreState)>> {
        validate_agent_id(agent_id)?;
        let dir = self.agent_dir(agent_id);

        let session_raw = match fs::read_to_string(dir.join(SESSION_FILE)) {
            Ok(raw) => raw,
            Err(_) => return Ok(None),
        };
        let state_raw = match fs::read_to_string(dir.join(STATE_FILE)) {
            Ok(raw) => raw,
            Err(_) => return Ok(None),
        };

        let session_value: serde_json::Value = match serde_json::from_str(&session_raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(agent_id = %agent_id, error = %e, "corrupt session.json");
                return Ok(None);
            }
        };
        let session = match SerializedSession::from_json(&session_value) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(agent_id = %agent_id, error = %e, "unreadable session");
                return Ok(None);
            }
        };
        let state: AgentStoreState = match serde_json::from_str(&state_raw) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(agent_id = %agent_id, error = %e, "corrupt state.json");
                return Ok(None);
            }
        };

        Ok(Some((session, state)))
    }

    /// Remove the agent's store directory and its bash sandbox.
    /// Missing directories are tolerated.
    pub async fn delete(&self, agent_id: &str) -> Result<()> {
        validate_agent_id(agent_id)?;
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;

        let dir = self.agent_dir(agent_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        if let Some(sandbox_root) = &self.sandbox_root {
            let sandbox = sandbox_root.join(agent_id);
            if sandbox.exists() {
                fs::remove_dir_all(&sandbox)?;
            }
        }
        self.locks.lock().remove(agent_id);
        tracing::info!(agent_id = %agent_id, "agent deleted");
        Ok(())
    }

    /// Synchronous existence check.
    pub fn exists(&self, agent_id: &str) -> Result<bool> {
        validate_agent_id(agent_id)?;
        let dir = self.agent_dir(agent_id);
        Ok(dir.join(SESSION_FILE).is_file() && dir.join(STATE_FILE).is_file())
    }

    /// Summaries of every readable agent. Entries with unsafe names or
    /// unreadable files are skipped rather than failing the whole list.
    pub fn list(&self) -> Vec<AgentSummary> {
        let entries = match fs::read_dir(&self.store_root) {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };

        let mut out = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(id) = name.to_str() else { continue };
            if !is_valid_agent_id(id) {
                tracing::debug!(entry = %id, "skipping unsafe store entry");
                continue;
            }
            let state_raw = match fs::read_to_string(entry.path().join(STATE_FILE)) {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            let state: AgentStoreState = match serde_json::from_str(&state_raw) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(agent_id = %id, error = %e, "skipping unreadable state");
                    continue;
                }
            };
            out.push(AgentSummary {
                agent_id: id.to_string(),
                state: state.state,
                total_tokens: state.total_tokens,
                total_cost: state.total_cost,
                saved_at: state.saved_at,
            });
        }
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }
}

/// Write `bytes` to `path` via `path.tmp.<nonce>` + fsync + rename, at
/// mode 0600.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;

    let nonce = uuid::Uuid::new_v4().simple().to_string();
    let tmp = path.with_extension(format!("json.tmp.{nonce}"));

    let mut file = fs::File::create(&tmp)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_domain::session::{AgentRunState, SessionConfig, SessionMetadata};
    use hub_domain::tool::ChatMessage;

    fn sample_session(agent_id: &str) -> SerializedSession {
        SerializedSession {
            version: hub_domain::session::SESSION_VERSION,
            agent_id: agent_id.into(),
            config: SessionConfig {
                model: "claude-sonnet-4-20250514".into(),
                provider: "anthropic".into(),
                tools: vec!["state".into()],
                max_tokens: None,
                hub: None,
                network: None,
                token_budget: None,
                cost_budget_usd: None,
            },
            conversation: vec![ChatMessage::user("hi")],
            storage: None,
            files: None,
            dependencies: None,
            hooks: None,
            metadata: SessionMetadata::default(),
        }
    }

    fn make_store(dir: &Path) -> SessionStore {
        let store = SessionStore::new(dir.join("agents"), Some(dir.join("sandbox")));
        store.init().unwrap();
        store
    }

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = make_store(tmp.path());

        let session = sample_session("a1");
        let state = AgentStoreState::paused();
        store.save("a1", &session, &state).await.unwrap();

        let (loaded_session, loaded_state) = store.load("a1").await.unwrap().unwrap();
        assert_eq!(loaded_session, session);
        assert_eq!(loaded_state, state);
    }

    #[tokio::test]
    async fn overwrite_replaces_prior_content() {
        let tmp = tempfile::tempdir().unwrap();
        let store = make_store(tmp.path());

        let mut session = sample_session("a1");
        let state = AgentStoreState::paused();
        store.save("a1", &session, &state).await.unwrap();

        session.conversation.push(ChatMessage::user("second"));
        let mut state2 = state.clone();
        state2.total_tokens = 42;
        store.save("a1", &session, &state2).await.unwrap();

        let (loaded, loaded_state) = store.load("a1").await.unwrap().unwrap();
        assert_eq!(loaded.conversation.len(), 2);
        assert_eq!(loaded_state.total_tokens, 42);
    }

    #[tokio::test]
    async fn no_tmp_files_remain_after_save() {
        let tmp = tempfile::tempdir().unwrap();
        let store = make_store(tmp.path());
        store
            .save("a1", &sample_session("a1"), &AgentStoreState::paused())
            .await
            .unwrap();

        let dir = tmp.path().join("agents").join("a1");
        let names: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| !n.contains(".tmp.")), "{names:?}");
        assert!(names.contains(&"session.json".to_string()));
        assert!(names.contains(&"state.json".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn saved_files_are_mode_0600() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let store = make_store(tmp.path());
        store
            .save("a1", &sample_session("a1"), &AgentStoreState::paused())
            .await
            .unwrap();

        for file in [SESSION_FILE, STATE_FILE] {
            let meta = fs::metadata(tmp.path().join("agents/a1").join(file)).unwrap();
            assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn hostile_ids_rejected_everywhere() {
        let tmp = tempfile::tempdir().unwrap();
        let store = make_store(tmp.path());
        let session = sample_session("x");
        let state = AgentStoreState::paused();

        for bad in ["", "..", "a/b", "a\\b", "a b", "a\0b"] {
            assert!(store.save(bad, &session, &state).await.is_err(), "{bad:?}");
            assert!(store.load(bad).await.is_err());
            assert!(store.delete(bad).await.is_err());
            assert!(store.exists(bad).is_err());
        }
    }

    #[tokio::test]
    async fn delete_removes_store_and_sandbox_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let store = make_store(tmp.path());
        store
            .save("a1", &sample_session("a1"), &AgentStoreState::paused())
            .await
            .unwrap();
        let sandbox = tmp.path().join("sandbox").join("a1");
        fs::create_dir_all(&sandbox).unwrap();

        store.delete("a1").await.unwrap();
        assert!(!tmp.path().join("agents/a1").exists());
        assert!(!sandbox.exists());

        // Deleting again is fine.
        store.delete("a1").await.unwrap();
    }

    #[tokio::test]
    async fn load_missing_or_corrupt_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = make_store(tmp.path());
        assert!(store.load("ghost").await.unwrap().is_none());

        // Corrupt session.json.
        let dir = tmp.path().join("agents").join("bad");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(SESSION_FILE), "{not json").unwrap();
        fs::write(dir.join(STATE_FILE), "{}").unwrap();
        assert!(store.load("bad").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_skips_bad_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let store = make_store(tmp.path());
        store
            .save("good", &sample_session("good"), &AgentStoreState::paused())
            .await
            .unwrap();

        // An entry with an unsafe name and one with unreadable state.
        fs::create_dir_all(tmp.path().join("agents").join("un safe")).unwrap();
        let broken = tmp.path().join("agents").join("broken");
        fs::create_dir_all(&broken).unwrap();
        fs::write(broken.join(STATE_FILE), "???").unwrap();

        let list = store.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].agent_id, "good");
        assert_eq!(list[0].state, AgentRunState::Paused);
    }

    #[tokio::test]
    async fn exists_reflects_both_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = make_store(tmp.path());
        assert!(!store.exists("a1").unwrap());
        store
            .save("a1", &sample_session("a1"), &AgentStoreState::paused())
            .await
            .unwrap();
        assert!(store.exists("a1").unwrap());
        fs::remove_file(tmp.path().join("agents/a1").join(STATE_FILE)).unwrap();
        assert!(!store.exists("a1").unwrap());
    }
}
