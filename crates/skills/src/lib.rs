//! Declarative skills with capability gating.
//!
//! A skill is a markdown file with `---` frontmatter:
//!
//! ```markdown
//! ---
//! name: daily-report
//! description: Summarize state changes into a report file
//! capabilities: state, files
//! ---
//! Instructions the model follows when the skill is loaded...
//! ```
//!
//! `capabilities` names the tools the skill needs. Loading a skill into
//! an agent is refused when the agent's configured tool set does not
//! cover them.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use hub_domain::error::{Error, Result};
use hub_tools::files::{frontmatter_body, parse_frontmatter};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub body: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkillMeta {
    pub name: String,
    pub description: String,
    pub capabilities: Vec<String>,
}

/// Validates a skill name: `^[a-z0-9]+(-[a-z0-9]+)*$`.
pub fn is_valid_skill_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 64 {
        return false;
    }
    let mut expect_alnum = true;
    for ch in name.chars() {
        if expect_alnum {
            if !ch.is_ascii_lowercase() && !ch.is_ascii_digit() {
                return false;
            }
            expect_alnum = false;
        } else if ch == '-' {
            expect_alnum = true;
        } else if !ch.is_ascii_lowercase() && !ch.is_ascii_digit() {
            return false;
        }
    }
    !expect_alnum
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SkillManager {
    root: PathBuf,
}

impl SkillManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn skill_path(&self, name: &str) -> Result<PathBuf> {
        if !is_valid_skill_name(name) {
            return Err(Error::ToolExec(format!("invalid skill name: {name:?}")));
        }
        Ok(self.root.join(format!("{name}.md")))
    }

    pub fn list(&self) -> Vec<SkillMeta> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            if let Some(skill) = parse_skill(&content) {
                out.push(SkillMeta {
                    name: skill.name,
                    description: skill.description,
                    capabilities: skill.capabilities,
                });
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn get(&self, name: &str) -> Result<Option<Skill>> {
        let path = self.skill_path(name)?;
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => return Ok(None),
        };
        Ok(parse_skill(&content))
    }

    /// Load a skill for an agent with the given tool set. Gating: every
    /// capability the skill declares must be among the agent's tools
    /// (an empty agent tool set allows everything).
    pub fn load(&self, name: &str, agent_tools: &[String]) -> Result<Skill> {
        let skill = self
            .get(name)?
            .ok_or_else(|| Error::ToolExec(format!("skill not found: {name}")))?;
        if !agent_tools.is_empty() {
            for cap in &skill.capabilities {
                if !agent_tools.iter().any(|t| t == cap) {
                    return Err(Error::ToolExec(format!(
                        "skill {name} requires the {cap} tool, which this agent does not have"
                    )));
                }
            }
        }
        Ok(skill)
    }

    pub fn create(&self, skill: &Skill) -> Result<()> {
        let path = self.skill_path(&skill.name)?;
        fs::create_dir_all(&self.root)?;
        fs::write(&path, render_skill(skill))?;
        tracing::info!(skill = %skill.name, "skill created");
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<bool> {
        let path = self.skill_path(name)?;
        if path.exists() {
            fs::remove_file(&path)?;
            tracing::info!(skill = %name, "skill removed");
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn parse_skill(content: &str) -> Option<Skill> {
    let fm = parse_frontmatter(content)?;
    let name = fm.get("name")?.as_str()?.to_string();
    if !is_valid_skill_name(&name) {
        return None;
    }
    let description = fm
        .get("description")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let capabilities = fm
        .get("capabilities")
        .and_then(|v| v.as_str())
        .map(|s| {
            s.split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect()
        })
        .unwrap_or_default();
    Some(Skill {
        name,
        description,
        capabilities,
        body: frontmatter_body(content).to_string(),
    })
}

pub fn render_skill(skill: &Skill) -> String {
    let mut out = String::from("---\n");
    out.push_str(&format!("name: {}\n", skill.name));
    out.push_str(&format!("description: {}\n", skill.description));
    if !skill.capabilities.is_empty() {
        out.push_str(&format!("capabilities: {}\n", skill.capabilities.join(", ")));
    }
    out.push_str("---\n");
    out.push_str(&skill.body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Skill {
        Skill {
            name: "daily-report".into(),
            description: "Summarize state into a report".into(),
            capabilities: vec!["state".into(), "files".into()],
            body: "Collect state keys and write report.md".into(),
        }
    }

    #[test]
    fn name_validation() {
        assert!(is_valid_skill_name("daily-report"));
        assert!(is_valid_skill_name("a2"));
        assert!(!is_valid_skill_name(""));
        assert!(!is_valid_skill_name("Upper"));
        assert!(!is_valid_skill_name("-lead"));
        assert!(!is_valid_skill_name("trail-"));
        assert!(!is_valid_skill_name("has space"));
        assert!(!is_valid_skill_name("dot.dot"));
    }

    #[test]
    fn render_parse_roundtrip() {
        let skill = sample();
        let parsed = parse_skill(&render_skill(&skill)).unwrap();
        assert_eq!(parsed, skill);
    }

    #[test]
    fn create_list_get_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = SkillManager::new(tmp.path());
        assert!(mgr.list().is_empty());

        mgr.create(&sample()).unwrap();
        let list = mgr.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "daily-report");

        let skill = mgr.get("daily-report").unwrap().unwrap();
        assert_eq!(skill.capabilities, vec!["state", "files"]);

        assert!(mgr.remove("daily-report").unwrap());
        assert!(!mgr.remove("daily-report").unwrap());
        assert!(mgr.get("daily-report").unwrap().is_none());
    }

    #[test]
    fn load_gates_on_capabilities() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = SkillManager::new(tmp.path());
        mgr.create(&sample()).unwrap();

        // Full tool set: allowed.
        let tools = vec!["state".to_string(), "files".to_string(), "bash".to_string()];
        assert!(mgr.load("daily-report", &tools).is_ok());

        // Missing `files`: refused.
        let narrow = vec!["state".to_string()];
        let err = mgr.load("daily-report", &narrow).unwrap_err();
        assert!(err.to_string().contains("files"));

        // Empty tool set means unrestricted.
        assert!(mgr.load("daily-report", &[]).is_ok());
    }

    #[test]
    fn hostile_names_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = SkillManager::new(tmp.path());
        assert!(mgr.get("../etc/passwd").is_err());
        assert!(mgr.remove("..").is_err());
    }
}
