//! Shared application state and post-construction wiring.
//!
//! Everything is instantiated once at hub boot and passed as explicit
//! collaborators — there is no global module state. Cyclic references
//! (runner ↔ executor ↔ scheduler) are resolved by a wiring step that
//! hands each side only the narrow closure it needs.

use std::path::PathBuf;
use std::sync::Arc;

use hub_domain::config::HubConfig;
use hub_domain::error::Result;
use hub_protocol::{AgentEvent, ServerMessage};
use hub_providers::client::ApiClient;
use hub_sessions::SessionStore;
use hub_skills::SkillManager;
use hub_tools::executor::ToolExecutor;

use crate::agents::AgentManager;
use crate::approval::ApprovalStore;
use crate::browse::BrowseManager;
use crate::clients::ClientRegistry;
use crate::fetch::SafeFetcher;
use crate::intervene::{compose_notification, InterveneManager, SWEEP_INTERVAL};
use crate::rate_limit::RateLimiter;
use crate::router::{BrowserToolRouter, DEFAULT_TIMEOUT};
use crate::runner::{build_executor_deps, RunnerDeps, StateRegistry};
use crate::scheduler::Scheduler;
use crate::screencast::ScreencastManager;
use crate::stream_server::StreamTokenStore;

/// Shared state passed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HubConfig>,
    pub store: Arc<SessionStore>,
    pub clients: Arc<ClientRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub router: Arc<BrowserToolRouter>,
    pub scheduler: Arc<Scheduler>,
    pub agents: Arc<AgentManager>,
    pub skills: Arc<SkillManager>,
    pub approvals: Arc<ApprovalStore>,
    pub api: Arc<ApiClient>,
    pub fetcher: Arc<SafeFetcher>,
    pub intervene: Arc<InterveneManager>,
    pub browse: Arc<BrowseManager>,
    pub screencast: Arc<ScreencastManager>,
    pub stream_tokens: Arc<StreamTokenStore>,
    pub push: Arc<crate::push::PushManager>,
    pub runner_deps: RunnerDeps,
}

impl AppState {
    pub fn build(config: HubConfig) -> Result<Self> {
        let config = Arc::new(config);

        let store = Arc::new(SessionStore::new(
            config.agent_store_path.clone(),
            config.sandbox_path.clone(),
        ));
        store.init()?;

        let clients = Arc::new(ClientRegistry::new());
        let rate_limiter = Arc::new(RateLimiter::default());
        let router = Arc::new(BrowserToolRouter::new(clients.clone(), DEFAULT_TIMEOUT));
        let scheduler = Arc::new(Scheduler::new());

        let skills_root = config
            .agent_store_path
            .parent()
            .map(|p| p.join("skills"))
            .unwrap_or_else(|| PathBuf::from("./data/skills"));
        let skills = Arc::new(SkillManager::new(skills_root));

        let approvals = Arc::new(ApprovalStore::default());
        let api = Arc::new(ApiClient::new()?);
        let fetcher = Arc::new(SafeFetcher::new(&config.fetch_proxy.blocked_patterns)?);
        let intervene = Arc::new(InterveneManager::default());
        let browse = Arc::new(BrowseManager::new(config.tools.browse.clone()));
        let screencast = Arc::new(ScreencastManager::new(
            browse.clone(),
            config.tools.browse.viewport,
        ));
        let stream_tokens = Arc::new(StreamTokenStore::new());
        let push = Arc::new(crate::push::PushManager::new(
            config.push.clone(),
            config.auth_token.clone().unwrap_or_default(),
        ));
        let stores = Arc::new(StateRegistry::new());

        // Runner events fan out to every subscribed client.
        let emit_clients = clients.clone();
        let emit = Arc::new(move |agent_id: &str, event: AgentEvent| {
            emit_clients.fanout(
                agent_id,
                &ServerMessage::AgentEventMsg {
                    agent_id: agent_id.to_string(),
                    event,
                },
            );
        });

        let runner_deps = RunnerDeps {
            config: config.clone(),
            store: store.clone(),
            api: api.clone(),
            scheduler: scheduler.clone(),
            router: router.clone(),
            skills: skills.clone(),
            approvals: approvals.clone(),
            clients: clients.clone(),
            stores,
            emit,
        };
        let agents = Arc::new(AgentManager::new(runner_deps.clone()));

        // ── Scheduler wiring ──────────────────────────────────────
        // Message fires wake the agent's runner; tool fires run
        // against the executor fire-and-forget.
        {
            let agents_for_messages = agents.clone();
            let message_sink: crate::scheduler::MessageSink =
                Arc::new(move |agent_id: String, text: String| {
                    let agents = agents_for_messages.clone();
                    tokio::spawn(async move {
                        if let Err(e) = agents.post_message(&agent_id, text).await {
                            tracing::warn!(agent_id = %agent_id, error = %e, "scheduled message undeliverable");
                        }
                    });
                });

            let deps_for_tools = runner_deps.clone();
            let tool_runner: crate::scheduler::ToolRunner = Arc::new(
                move |agent_id: String, tool: String, input: serde_json::Value| {
                    let deps = deps_for_tools.clone();
                    Box::pin(async move {
                        let (tools, hooks) = match deps.store.load(&agent_id).await {
                            Ok(Some((session, _))) => (
                                session.config.tools,
                                session.hooks.unwrap_or_default(),
                            ),
                            _ => (Vec::new(), Vec::new()),
                        };
                        let exec_deps =
                            build_executor_deps(&agent_id, tools, hooks, None, &deps);
                        let outcome = ToolExecutor::execute(&tool, input, &exec_deps).await;
                        if outcome.is_error {
                            tracing::warn!(
                                agent_id = %agent_id,
                                tool = %tool,
                                error = %outcome.content,
                                "scheduled tool fire failed"
                            );
                        }
                    })
                },
            );

            scheduler.wire(message_sink, tool_runner);
        }

        Ok(Self {
            config,
            store,
            clients,
            rate_limiter,
            router,
            scheduler,
            agents,
            skills,
            approvals,
            api,
            fetcher,
            intervene,
            browse,
            screencast,
            stream_tokens,
            push,
            runner_deps,
        })
    }

    /// Start the background loops: the minute-aligned cron tick and
    /// the intervene inactivity sweep.
    pub fn spawn_background_tasks(
        &self,
        shutdown: tokio_util::sync::CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(
            self.scheduler.clone().run_tick_loop(shutdown.clone()),
        ));

        let state = self.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                    _ = shutdown.cancelled() => return,
                }
                for session in state.intervene.sweep_expired() {
                    let snapshot = match state.browse.get(&session.agent_id).await {
                        Some(page) => Some(page.snapshot().await),
                        None => None,
                    };
                    let note = compose_notification(&session, snapshot.as_deref());
                    state.agents.intervene_end(&session.agent_id, note).await;
                    state.clients.fanout(
                        &session.agent_id,
                        &ServerMessage::InterveneEnded {
                            agent_id: session.agent_id.clone(),
                            reason: "inactivity timeout".into(),
                        },
                    );
                }
            }
        }));

        tasks
    }
}
