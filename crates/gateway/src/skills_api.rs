//! Skill tool surface — wires the skill manager, the approval
//! round-trip, and the executor's `SkillApi` trait together.

use std::sync::Arc;

use serde_json::{json, Value};

use hub_domain::tool::ToolOutcome;
use hub_protocol::ServerMessage;
use hub_skills::{Skill, SkillManager};

use crate::approval::ApprovalStore;
use crate::clients::ClientRegistry;

pub struct SkillService {
    manager: Arc<SkillManager>,
    approvals: Arc<ApprovalStore>,
    clients: Arc<ClientRegistry>,
    /// Tool names the requesting agent is configured with, used for
    /// load-time capability gating. Set per executor build.
    agent_tools: Vec<String>,
}

impl SkillService {
    pub fn new(
        manager: Arc<SkillManager>,
        approvals: Arc<ApprovalStore>,
        clients: Arc<ClientRegistry>,
        agent_tools: Vec<String>,
    ) -> Self {
        Self {
            manager,
            approvals,
            clients,
            agent_tools,
        }
    }

    async fn create_with_approval(&self, agent_id: Option<&str>, input: &Value) -> ToolOutcome {
        let Some(name) = input.get("name").and_then(|v| v.as_str()) else {
            return ToolOutcome::error("create_skill requires a name");
        };
        let Some(body) = input.get("body").and_then(|v| v.as_str()) else {
            return ToolOutcome::error("create_skill requires a body");
        };
        let skill = Skill {
            name: name.to_string(),
            description: input
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            capabilities: input
                .get("capabilities")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(str::to_owned))
                        .collect()
                })
                .unwrap_or_default(),
            body: body.to_string(),
        };

        // A human must approve new skills. No routable client means no
        // approval surface, so creation fails.
        let Some((_, sink)) = self.clients.route_client_for(agent_id) else {
            return ToolOutcome::error(
                "creating a skill requires a connected client to approve it",
            );
        };
        let approval_id = uuid::Uuid::new_v4().to_string();
        let request = ServerMessage::SkillApprovalRequest {
            id: approval_id.clone(),
            agent_id: agent_id.unwrap_or_default().to_string(),
            skill_name: skill.name.clone(),
            content: Some(skill.body.clone()),
        };
        if sink.send(request).await.is_err() {
            return ToolOutcome::error("failed to reach the approving client");
        }

        if !self.approvals.wait(approval_id).await {
            return ToolOutcome::error(format!(
                "skill {name} was not approved (denied or timed out)"
            ));
        }

        match self.manager.create(&skill) {
            Ok(()) => ToolOutcome::json(&json!({ "name": name, "created": true })),
            Err(e) => ToolOutcome::error(e.to_string()),
        }
    }
}

#[async_trait::async_trait]
impl hub_tools::executor::SkillApi for SkillService {
    async fn handle(&self, agent_id: Option<&str>, tool_name: &str, input: Value) -> ToolOutcome {
        match tool_name {
            "list_skills" => ToolOutcome::json(&json!({ "skills": self.manager.list() })),
            "get_skill" => {
                let Some(name) = input.get("name").and_then(|v| v.as_str()) else {
                    return ToolOutcome::error("get_skill requires a name");
                };
                match self.manager.get(name) {
                    Ok(Some(skill)) => ToolOutcome::json(&serde_json::to_value(&skill).unwrap_or_default()),
                    Ok(None) => ToolOutcome::error(format!("skill not found: {name}")),
                    Err(e) => ToolOutcome::error(e.to_string()),
                }
            }
            "load_skill" => {
                let Some(name) = input.get("name").and_then(|v| v.as_str()) else {
                    return ToolOutcome::error("load_skill requires a name");
                };
                match self.manager.load(name, &self.agent_tools) {
                    Ok(skill) => ToolOutcome::ok(skill.body),
                    Err(e) => ToolOutcome::error(e.to_string()),
                }
            }
            "create_skill" => self.create_with_approval(agent_id, &input).await,
            "remove_skill" => {
                let Some(name) = input.get("name").and_then(|v| v.as_str()) else {
                    return ToolOutcome::error("remove_skill requires a name");
                };
                match self.manager.remove(name) {
                    Ok(removed) => ToolOutcome::json(&json!({ "name": name, "removed": removed })),
                    Err(e) => ToolOutcome::error(e.to_string()),
                }
            }
            other => ToolOutcome::error(format!("unknown skill tool: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_tools::executor::SkillApi;
    use std::time::Duration;

    fn service(tmp: &std::path::Path) -> SkillService {
        SkillService::new(
            Arc::new(SkillManager::new(tmp)),
            Arc::new(ApprovalStore::new(Duration::from_millis(50))),
            Arc::new(ClientRegistry::new()),
            vec!["state".into(), "files".into()],
        )
    }

    #[tokio::test]
    async fn list_and_load_flow() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path());
        svc.manager
            .create(&Skill {
                name: "greet".into(),
                description: "greets".into(),
                capabilities: vec!["state".into()],
                body: "Say hello".into(),
            })
            .unwrap();

        let out = svc.handle(None, "list_skills", json!({})).await;
        assert!(out.content.contains("greet"));

        let out = svc.handle(None, "load_skill", json!({"name": "greet"})).await;
        assert!(!out.is_error);
        assert_eq!(out.content, "Say hello");

        let out = svc.handle(None, "get_skill", json!({"name": "ghost"})).await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn load_respects_capability_gate() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path());
        svc.manager
            .create(&Skill {
                name: "netty".into(),
                description: String::new(),
                capabilities: vec!["dom".into()],
                body: "x".into(),
            })
            .unwrap();
        let out = svc.handle(None, "load_skill", json!({"name": "netty"})).await;
        assert!(out.is_error);
        assert!(out.content.contains("dom"));
    }

    #[tokio::test]
    async fn create_without_client_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path());
        let out = svc
            .handle(
                Some("a1"),
                "create_skill",
                json!({"name": "new-skill", "body": "do things"}),
            )
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("connected client"));
    }
}
