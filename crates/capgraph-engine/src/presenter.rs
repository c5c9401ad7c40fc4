//! Presenter trait and built-in implementations for progress reporting and
//! interaction points.

use std::sync::Mutex;

use async_trait::async_trait;
use capgraph_types::{CapgraphError, Result, StepStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graph::NodeType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Confirm,
    Select,
    Input,
}

impl InteractionKind {
    pub fn for_node(node_type: NodeType) -> Option<Self> {
        match node_type {
            NodeType::Confirm => Some(InteractionKind::Confirm),
            NodeType::Select => Some(InteractionKind::Select),
            NodeType::Input => Some(InteractionKind::Input),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRequest {
    pub node_id: String,
    pub kind: InteractionKind,
    pub prompt: String,
    /// Choices for `Select`. Empty for the other kinds.
    pub options: Vec<String>,
    /// Suggested answer for `Input`.
    pub default: Option<String>,
}

#[async_trait]
pub trait Presenter: Send + Sync {
    fn on_node_start(&self, _node_id: &str, _node_type: NodeType) {}
    fn on_node_complete(&self, _node_id: &str, _status: StepStatus) {}
    async fn on_interaction(&self, request: &InteractionRequest) -> Result<Value>;
}

fn default_answer(request: &InteractionRequest) -> Value {
    match request.kind {
        InteractionKind::Confirm => Value::Bool(true),
        InteractionKind::Select => request
            .options
            .first()
            .cloned()
            .map(Value::String)
            .unwrap_or(Value::Null),
        InteractionKind::Input => Value::String(request.default.clone().unwrap_or_default()),
    }
}

// ---------------------------------------------------------------------------
// AutoApprovePresenter
// ---------------------------------------------------------------------------

/// Confirms everything, picks the first option, accepts the default input.
pub struct AutoApprovePresenter;

#[async_trait]
impl Presenter for AutoApprovePresenter {
    async fn on_interaction(&self, request: &InteractionRequest) -> Result<Value> {
        Ok(default_answer(request))
    }
}

// ---------------------------------------------------------------------------
// ConsolePresenter
// ---------------------------------------------------------------------------

pub struct ConsolePresenter;

impl ConsolePresenter {
    fn read_line() -> Result<String> {
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        Ok(input.trim().to_string())
    }
}

#[async_trait]
impl Presenter for ConsolePresenter {
    fn on_node_start(&self, node_id: &str, node_type: NodeType) {
        println!("-> {node_id} ({node_type})");
    }

    fn on_node_complete(&self, node_id: &str, status: StepStatus) {
        println!("   {node_id}: {status:?}");
    }

    async fn on_interaction(&self, request: &InteractionRequest) -> Result<Value> {
        let node = request.node_id.clone();
        let request = request.clone();
        // Blocking stdin read stays off the async workers.
        tokio::task::spawn_blocking(move || -> Result<Value> {
            println!("\n{}", request.prompt);
            match request.kind {
                InteractionKind::Confirm => {
                    println!("  [y/n]");
                    let answer = Self::read_line()?;
                    Ok(Value::Bool(matches!(
                        answer.to_ascii_lowercase().as_str(),
                        "y" | "yes" | "true" | ""
                    )))
                }
                InteractionKind::Select => {
                    for (i, choice) in request.options.iter().enumerate() {
                        println!("  [{}] {}", i + 1, choice);
                    }
                    let answer = Self::read_line()?;
                    if let Ok(idx) = answer.parse::<usize>() {
                        if idx > 0 && idx <= request.options.len() {
                            return Ok(Value::String(request.options[idx - 1].clone()));
                        }
                    }
                    Ok(Value::String(answer))
                }
                InteractionKind::Input => {
                    if let Some(default) = &request.default {
                        println!("  (default: {default})");
                    }
                    let answer = Self::read_line()?;
                    if answer.is_empty() {
                        Ok(Value::String(request.default.clone().unwrap_or_default()))
                    } else {
                        Ok(Value::String(answer))
                    }
                }
            }
        })
        .await
        .map_err(|e| CapgraphError::Interaction {
            node,
            message: e.to_string(),
        })?
    }
}

// ---------------------------------------------------------------------------
// RecordingPresenter
// ---------------------------------------------------------------------------

/// Plays back scripted answers and records everything it sees.
///
/// When the script runs out it falls back to the auto-approve answer.
#[derive(Default)]
pub struct RecordingPresenter {
    answers: Mutex<Vec<Value>>,
    requests: Mutex<Vec<InteractionRequest>>,
    progress: Mutex<Vec<(String, StepStatus)>>,
}

impl RecordingPresenter {
    pub fn new(answers: Vec<Value>) -> Self {
        let mut reversed = answers;
        reversed.reverse();
        Self {
            answers: Mutex::new(reversed),
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<InteractionRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Completed nodes in notification order.
    pub fn completed(&self) -> Vec<(String, StepStatus)> {
        self.progress
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Presenter for RecordingPresenter {
    fn on_node_complete(&self, node_id: &str, status: StepStatus) {
        if let Ok(mut progress) = self.progress.lock() {
            progress.push((node_id.to_string(), status));
        }
    }

    async fn on_interaction(&self, request: &InteractionRequest) -> Result<Value> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let scripted = self.answers.lock().ok().and_then(|mut a| a.pop());
        Ok(scripted.unwrap_or_else(|| default_answer(request)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
