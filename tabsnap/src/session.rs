//! Agent-facing state: the instruction text and tool catalog an agent session
//! is configured with, and the entry point for its tool calls.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::actions::{ActionCatalog, ToolOutput};
use crate::detector::{SnapshotSink, SnapshotUpdate};

/// Section holding the snapshot when a session follows a detector directly.
pub const HTML_SECTION: &str = "html";

const NO_DESCRIPTION: &str = "No description";

/// A tool as advertised to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Default)]
struct SessionState {
    /// Named instruction sections, in insertion order.
    sections: Vec<(String, String)>,
    tools: ActionCatalog,
}

/// Cheaply cloneable handle; clones share state.
#[derive(Clone, Default)]
pub struct AgentSession {
    state: Arc<Mutex<SessionState>>,
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("AgentSession")
            .field("sections", &state.sections.len())
            .field("tools", &state.tools.len())
            .finish()
    }
}

impl AgentSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply section changes (`None` removes a section) and, when given, a
    /// tool catalog that is merged into or replaces the current one.
    pub fn update<'a>(
        &self,
        sections: impl IntoIterator<Item = (&'a str, Option<String>)>,
        tools: Option<ActionCatalog>,
        merge: bool,
    ) {
        let mut state = self.lock();
        for (name, text) in sections {
            apply_section(&mut state.sections, name, text);
        }
        if let Some(tools) = tools {
            if merge {
                state.tools.merge(tools);
            } else {
                state.tools = tools;
            }
        }
        debug!(
            sections = state.sections.len(),
            tools = state.tools.len(),
            "session updated"
        );
    }

    pub fn set_section(&self, name: &str, text: Option<String>) {
        apply_section(&mut self.lock().sections, name, text);
    }

    pub fn section(&self, name: &str) -> Option<String> {
        self.lock()
            .sections
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    }

    /// All sections rendered as `name: text`, one per line.
    pub fn instructions(&self) -> String {
        self.lock()
            .sections
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn set_tools(&self, tools: ActionCatalog) {
        self.lock().tools = tools;
    }

    pub fn merge_tools(&self, tools: ActionCatalog) {
        self.lock().tools.merge(tools);
    }

    pub fn clear_tools(&self) {
        self.lock().tools = ActionCatalog::new();
    }

    pub fn tools(&self) -> ActionCatalog {
        self.lock().tools.clone()
    }

    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.lock()
            .tools
            .iter()
            .map(|(name, action)| ToolDefinition {
                kind: "function".to_string(),
                name: name.to_string(),
                description: if action.spec.description.is_empty() {
                    NO_DESCRIPTION.to_string()
                } else {
                    action.spec.description.clone()
                },
                parameters: action.spec.parameters.clone(),
            })
            .collect()
    }

    /// The session configuration an agent transport would send upstream.
    pub fn session_config(&self) -> Value {
        json!({
            "instructions": self.instructions(),
            "tools": self.tool_definitions(),
            "tool_choice": "auto",
        })
    }

    /// Route a tool call to the current catalog.
    pub async fn invoke(&self, name: &str, args: Value) -> ToolOutput {
        let tools = self.tools();
        let output = tools.invoke(name, args).await;
        info!(
            tool = name,
            success = output.is_success(),
            respond = output.respond,
            "tool call finished"
        );
        output
    }
}

fn apply_section(sections: &mut Vec<(String, String)>, name: &str, text: Option<String>) {
    match text {
        None => sections.retain(|(k, _)| k != name),
        Some(text) => match sections.iter_mut().find(|(k, _)| k == name) {
            Some(slot) => slot.1 = text,
            None => sections.push((name.to_string(), text)),
        },
    }
}

impl SnapshotSink for AgentSession {
    fn publish(&self, update: &SnapshotUpdate) {
        self.update(
            [(HTML_SECTION, Some(update.html.clone()))],
            Some(update.catalog.clone()),
            false,
        );
    }
}
