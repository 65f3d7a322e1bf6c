//! Agent lifecycle manager — owns the runner handles and implements
//! persist/restore/list/action/send_message.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use hub_domain::agent_id::validate_agent_id;
use hub_domain::error::{Error, Result};
use hub_domain::session::{
    AgentRunState, AgentStoreState, AgentSummary, SerializedSession,
};
use hub_protocol::AgentAction;
use hub_sessions::pack::{pack_files, unpack_files};

use crate::runner::{spawn_runner, RunnerCommand, RunnerDeps, RunnerHandle};

pub struct AgentManager {
    deps: RunnerDeps,
    runners: Mutex<HashMap<String, RunnerHandle>>,
}

impl AgentManager {
    pub fn new(deps: RunnerDeps) -> Self {
        Self {
            deps,
            runners: Mutex::new(HashMap::new()),
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    /// Persist a browser-supplied session and start (or restart) its
    /// hub runner. Serialized files are unpacked into the agent's
    /// workspace before the runner sees them.
    pub async fn persist(
        &self,
        mut session: SerializedSession,
        state: Option<AgentStoreState>,
    ) -> Result<()> {
        let agent_id = session.agent_id.clone();
        validate_agent_id(&agent_id)?;

        if let Some(files) = session.files.take() {
            let files_root = self.deps.store.files_root(&agent_id)?;
            let written = unpack_files(&files, &files_root)?;
            tracing::debug!(agent_id = %agent_id, files = written, "workspace unpacked");
        }

        // Skill dependencies: when the hub has no skill of the declared
        // name, the inline fallback is installed.
        if let Some(dependencies) = &session.dependencies {
            for dep in &dependencies.skills {
                if matches!(self.deps.skills.get(&dep.name), Ok(Some(_))) {
                    continue;
                }
                let Some(fallback) = &dep.fallback else { continue };
                let skill = hub_skills::parse_skill(fallback).unwrap_or_else(|| {
                    hub_skills::Skill {
                        name: dep.name.clone(),
                        description: String::new(),
                        capabilities: Vec::new(),
                        body: fallback.clone(),
                    }
                });
                if let Err(e) = self.deps.skills.create(&skill) {
                    tracing::warn!(skill = %dep.name, error = %e, "fallback skill install failed");
                }
            }
        }

        let state = state.unwrap_or_else(AgentStoreState::paused);
        self.deps.store.save(&agent_id, &session, &state).await?;

        // Replace any live runner with one owning the new session.
        self.stop_runner(&agent_id).await;
        self.spawn(session, state.state).await;
        Ok(())
    }

    /// Load a persisted session for a browser, packing the workspace
    /// back into the serialized file list.
    pub async fn restore(
        &self,
        agent_id: &str,
    ) -> Result<Option<(SerializedSession, AgentStoreState)>> {
        let Some((mut session, state)) = self.deps.store.load(agent_id).await? else {
            return Ok(None);
        };
        let files_root = self.deps.store.files_root(agent_id)?;
        let files = pack_files(&files_root)?;
        if !files.is_empty() {
            session.files = Some(files);
        }
        Ok(Some((session, state)))
    }

    pub fn list(&self) -> Vec<AgentSummary> {
        self.deps.store.list()
    }

    pub async fn action(&self, agent_id: &str, action: AgentAction) -> Result<()> {
        validate_agent_id(agent_id)?;
        match action {
            AgentAction::Pause => {
                let handle = self.ensure_runner(agent_id).await?;
                handle
                    .send(RunnerCommand::Pause)
                    .await
                    .map_err(|_| Error::Other("runner unavailable".into()))?;
            }
            AgentAction::Resume => {
                let handle = self.ensure_runner(agent_id).await?;
                handle
                    .send(RunnerCommand::Resume)
                    .await
                    .map_err(|_| Error::Other("runner unavailable".into()))?;
            }
            AgentAction::Stop => {
                let runners = self.runners.lock().await;
                if let Some(handle) = runners.get(agent_id) {
                    handle.signals.request_stop();
                }
            }
            AgentAction::Delete => {
                self.stop_runner(agent_id).await;
                self.deps.scheduler.remove_agent(agent_id);
                self.deps.stores.remove(agent_id);
                self.deps.store.delete(agent_id).await?;
            }
        }
        Ok(())
    }

    /// Post a message into the agent's runner, starting it from its
    /// snapshot when it is not live. Used for `send_message` and for
    /// scheduler fires.
    pub async fn post_message(&self, agent_id: &str, text: String) -> Result<()> {
        let mailbox = self.ensure_runner(agent_id).await?;
        mailbox
            .send(RunnerCommand::UserMessage(text))
            .await
            .map_err(|_| Error::Other("runner mailbox closed".into()))
    }

    // ── Intervene hooks ───────────────────────────────────────────

    /// Pause the runner's provider calls while a human drives the page.
    pub async fn intervene_start(&self, agent_id: &str) {
        if let Some(handle) = self.runners.lock().await.get(agent_id) {
            handle.signals.begin_intervene();
        }
    }

    /// Inject the end-of-intervention notification and resume.
    pub async fn intervene_end(&self, agent_id: &str, notification: String) {
        let runners = self.runners.lock().await;
        if let Some(handle) = runners.get(agent_id) {
            let _ = handle
                .mailbox
                .try_send(RunnerCommand::SystemNote(notification));
            handle.signals.end_intervene();
        }
    }

    // ── Internals ─────────────────────────────────────────────────

    async fn spawn(&self, session: SerializedSession, state: AgentRunState) {
        let agent_id = session.agent_id.clone();
        let (tx, rx) = mpsc::channel(64);
        let handle = spawn_runner(session, state, self.deps.clone(), tx, rx);
        self.runners.lock().await.insert(agent_id, handle);
    }

    /// Returns the runner's mailbox, loading the agent from disk when
    /// no runner is live.
    async fn ensure_runner(&self, agent_id: &str) -> Result<mpsc::Sender<RunnerCommand>> {
        validate_agent_id(agent_id)?;
        {
            let runners = self.runners.lock().await;
            if let Some(handle) = runners.get(agent_id) {
                if !handle.task.is_finished() {
                    return Ok(handle.mailbox.clone());
                }
            }
        }
        let Some((session, state)) = self.deps.store.load(agent_id).await? else {
            return Err(Error::Storage(format!("no such agent: {agent_id}")));
        };
        self.spawn(session, state.state).await;
        let runners = self.runners.lock().await;
        runners
            .get(agent_id)
            .map(|h| h.mailbox.clone())
            .ok_or_else(|| Error::Other("runner spawn raced".into()))
    }

    async fn stop_runner(&self, agent_id: &str) {
        let handle = self.runners.lock().await.remove(agent_id);
        if let Some(handle) = handle {
            handle.signals.request_stop();
            let _ = handle.mailbox.send(RunnerCommand::Shutdown).await;
            let _ = handle.task.await;
        }
    }

    /// Graceful hub shutdown: stop every runner, letting each persist.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.runners.lock().await.keys().cloned().collect();
        for agent_id in ids {
            self.stop_runner(&agent_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalStore;
    use crate::clients::ClientRegistry;
    use crate::router::BrowserToolRouter;
    use crate::scheduler::Scheduler;
    use hub_domain::config::HubConfig;
    use hub_domain::session::{SessionConfig, SessionMetadata};
    use hub_providers::client::ApiClient;
    use hub_sessions::SessionStore;
    use std::time::Duration;

    fn make_deps(tmp: &std::path::Path) -> RunnerDeps {
        let store = Arc::new(SessionStore::new(
            tmp.join("agents"),
            Some(tmp.join("sandbox")),
        ));
        store.init().unwrap();
        let clients = Arc::new(ClientRegistry::new());
        RunnerDeps {
            config: Arc::new(HubConfig::default()),
            store,
            api: Arc::new(ApiClient::new().unwrap()),
            scheduler: Arc::new(Scheduler::new()),
            router: Arc::new(BrowserToolRouter::new(
                clients.clone(),
                Duration::from_secs(1),
            )),
            skills: Arc::new(hub_skills::SkillManager::new(tmp.join("skills"))),
            approvals: Arc::new(ApprovalStore::default()),
            clients,
            stores: Arc::new(crate::runner::StateRegistry::new()),
            emit: Arc::new(|_, _| {}),
        }
    }

    fn sample_session(agent_id: &str) -> SerializedSession {
        SerializedSession {
            version: 2,
            agent_id: agent_id.into(),
            config: SessionConfig {
                model: "m".into(),
                provider: "anthropic".into(),
                tools: vec![],
                max_tokens: None,
                hub: None,
                network: None,
                token_budget: None,
                cost_budget_usd: None,
            },
            conversation: vec![],
            storage: None,
            files: None,
            dependencies: None,
            hooks: None,
            metadata: SessionMetadata::default(),
        }
    }

    #[tokio::test]
    async fn persist_then_restore_roundtrips_files() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = AgentManager::new(make_deps(tmp.path()));

        let mut session = sample_session("a1");
        session.files = Some(vec![hub_domain::session::FileEntry {
            path: "notes.md".into(),
            content: "remember".into(),
            encoding: hub_domain::session::FileEncoding::Utf8,
        }]);
        manager.persist(session, None).await.unwrap();

        let (restored, state) = manager.restore("a1").await.unwrap().unwrap();
        assert_eq!(state.state, AgentRunState::Paused);
        let files = restored.files.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "notes.md");
        assert_eq!(files[0].content, "remember");

        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn delete_removes_agent_and_schedules() {
        let tmp = tempfile::tempdir().unwrap();
        let deps = make_deps(tmp.path());
        let scheduler = deps.scheduler.clone();
        let store = deps.store.clone();
        let manager = AgentManager::new(deps);

        manager.persist(sample_session("a1"), None).await.unwrap();
        scheduler
            .add(crate::scheduler::Schedule {
                id: "s1".into(),
                hub_agent_id: "a1".into(),
                kind: crate::scheduler::ScheduleKind::Cron,
                enabled: true,
                run_count: 0,
                max_runs: None,
                last_run_at: None,
                cron_expression: Some("* * * * *".into()),
                event_name: None,
                event_condition: None,
                action: crate::scheduler::ScheduleAction::Message {
                    message: "hi".into(),
                },
            })
            .unwrap();

        manager
            .action("a1", AgentAction::Delete)
            .await
            .unwrap();
        assert!(!store.exists("a1").unwrap());
        assert!(scheduler.list("a1").is_empty());
    }

    #[tokio::test]
    async fn restore_missing_agent_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = AgentManager::new(make_deps(tmp.path()));
        assert!(manager.restore("ghost").await.unwrap().is_none());
        assert!(manager.restore("..").await.is_err());
    }

    #[tokio::test]
    async fn post_message_to_unknown_agent_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = AgentManager::new(make_deps(tmp.path()));
        assert!(manager.post_message("ghost", "hi".into()).await.is_err());
    }
}
