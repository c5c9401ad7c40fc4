//! Skill repository seam.
//!
//! The executor never knows how a skill is stored or run. It resolves skill
//! ids and invokes them through a [`SkillRepository`].

use std::collections::HashMap;

use async_trait::async_trait;
use capgraph_types::{CapgraphError, PreferredDepth, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Data kind flowing in or out of a skill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoType {
    Text,
    Markdown,
    Json,
    Pmids,
    Files,
    Pdf,
    Code,
    Any,
}

impl IoType {
    /// Whether a skill producing `output` can feed a skill consuming `input`.
    pub fn is_compatible(output: IoType, input: IoType) -> bool {
        use IoType::*;
        if output == input || output == Any || input == Any {
            return true;
        }
        matches!(
            (output, input),
            (Text, Markdown)
                | (Markdown, Text)
                | (Pmids, Text)
                | (Pmids, Json)
                | (Pdf, Files)
                | (Code, Text)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillInfo {
    pub id: String,
    #[serde(default)]
    pub input_type: Option<IoType>,
    #[serde(default)]
    pub output_type: Option<IoType>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl SkillInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            input_type: None,
            output_type: None,
            capabilities: Vec::new(),
        }
    }

    pub fn with_io(mut self, input: IoType, output: IoType) -> Self {
        self.input_type = Some(input);
        self.output_type = Some(output);
        self
    }
}

/// Everything a repository needs to run one attempt of a skill.
#[derive(Debug, Clone, Serialize)]
pub struct SkillInvocation {
    pub node_id: String,
    pub skill_id: String,
    /// Set when the attempt runs an alternative implementation.
    pub implementation_id: Option<String>,
    /// Zero-based attempt number for this skill on this node visit.
    pub attempt: usize,
    pub variables: HashMap<String, Value>,
    pub user_intent: String,
    pub preferred_depth: PreferredDepth,
}

#[async_trait]
pub trait SkillRepository: Send + Sync {
    async fn get_skill(&self, id: &str) -> Option<SkillInfo>;
    async fn invoke(&self, request: &SkillInvocation) -> Result<Value>;
}

// ---------------------------------------------------------------------------
// SimulatedSkillRepository
// ---------------------------------------------------------------------------

/// Resolves every skill id and answers each invocation with
/// `"result_of_<skillId>"`. Registered skills only add IO metadata.
#[derive(Debug, Default)]
pub struct SimulatedSkillRepository {
    skills: HashMap<String, SkillInfo>,
}

impl SimulatedSkillRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_skill(mut self, info: SkillInfo) -> Self {
        self.skills.insert(info.id.clone(), info);
        self
    }
}

#[async_trait]
impl SkillRepository for SimulatedSkillRepository {
    async fn get_skill(&self, id: &str) -> Option<SkillInfo> {
        Some(
            self.skills
                .get(id)
                .cloned()
                .unwrap_or_else(|| SkillInfo::new(id)),
        )
    }

    async fn invoke(&self, request: &SkillInvocation) -> Result<Value> {
        tracing::debug!(node = %request.node_id, skill = %request.skill_id, "Simulating skill");
        Ok(Value::String(format!("result_of_{}", request.skill_id)))
    }
}

// ---------------------------------------------------------------------------
// StaticSkillRepository
// ---------------------------------------------------------------------------

/// A fixed catalog: unknown skills fail with [`CapgraphError::SkillNotFound`],
/// known skills return their registered value.
#[derive(Debug, Default)]
pub struct StaticSkillRepository {
    skills: HashMap<String, (SkillInfo, Value)>,
}

impl StaticSkillRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_skill(mut self, info: SkillInfo, response: Value) -> Self {
        self.skills.insert(info.id.clone(), (info, response));
        self
    }
}

#[async_trait]
impl SkillRepository for StaticSkillRepository {
    async fn get_skill(&self, id: &str) -> Option<SkillInfo> {
        self.skills.get(id).map(|(info, _)| info.clone())
    }

    async fn invoke(&self, request: &SkillInvocation) -> Result<Value> {
        self.skills
            .get(&request.skill_id)
            .map(|(_, response)| response.clone())
            .ok_or_else(|| CapgraphError::SkillNotFound {
                node: request.node_id.clone(),
                skill: request.skill_id.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(skill: &str) -> SkillInvocation {
        SkillInvocation {
            node_id: "n".into(),
            skill_id: skill.into(),
            implementation_id: None,
            attempt: 0,
            variables: HashMap::new(),
            user_intent: String::new(),
            preferred_depth: PreferredDepth::default(),
        }
    }

    #[test]
    fn io_compatibility_matrix() {
        use IoType::*;
        assert!(IoType::is_compatible(Text, Text));
        assert!(IoType::is_compatible(Json, Any));
        assert!(IoType::is_compatible(Any, Pdf));
        assert!(IoType::is_compatible(Text, Markdown));
        assert!(IoType::is_compatible(Pmids, Json));
        assert!(IoType::is_compatible(Pdf, Files));
        assert!(!IoType::is_compatible(Json, Text));
        assert!(!IoType::is_compatible(Files, Pdf));
        assert!(!IoType::is_compatible(Markdown, Code));
    }

    #[tokio::test]
    async fn simulated_repository_resolves_everything() {
        let repo = SimulatedSkillRepository::new()
            .with_skill(SkillInfo::new("summarize").with_io(IoType::Text, IoType::Markdown));
        assert!(repo.get_skill("anything").await.is_some());
        assert_eq!(
            repo.get_skill("summarize").await.and_then(|s| s.output_type),
            Some(IoType::Markdown)
        );
        let value = repo.invoke(&invocation("summarize")).await.unwrap();
        assert_eq!(value, Value::String("result_of_summarize".into()));
    }

    #[tokio::test]
    async fn static_repository_rejects_unknown_skills() {
        let repo = StaticSkillRepository::new()
            .with_skill(SkillInfo::new("known"), serde_json::json!({"ok": true}));
        assert!(repo.get_skill("unknown").await.is_none());
        let err = repo.invoke(&invocation("unknown")).await.unwrap_err();
        assert!(matches!(err, CapgraphError::SkillNotFound { .. }));
        let ok = repo.invoke(&invocation("known")).await.unwrap();
        assert_eq!(ok["ok"], true);
    }
}
