//! JSON envelopes exchanged between execution contexts and the relay.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::actions::{ActionSpec, ToolOutput};
use crate::errors::SnapError;

/// Context → relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContextMessage {
    /// Latest snapshot and the actions valid against it.
    #[serde(rename = "snapshot", alias = "snap")]
    Snapshot {
        #[serde(rename = "contextId", alias = "cid")]
        context_id: String,
        #[serde(default)]
        html: String,
        #[serde(default, deserialize_with = "deserialize_fns")]
        fns: BTreeMap<String, ActionSpec>,
    },

    #[serde(rename = "visibility", alias = "visibilitychange")]
    Visibility {
        #[serde(rename = "contextId", alias = "cid")]
        context_id: String,
        hidden: bool,
    },

    /// Outcome of a `cmd`. Any extra fields are the action's result.
    #[serde(rename = "cmdres")]
    CommandResult {
        #[serde(
            rename = "contextId",
            alias = "cid",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        context_id: Option<String>,
        #[serde(rename = "invocationId", alias = "iid")]
        invocation_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        err: Option<String>,
        #[serde(flatten)]
        fields: Map<String, Value>,
    },
}

/// Relay → context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RelayMessage {
    #[serde(rename = "cmd")]
    Command {
        #[serde(rename = "fn")]
        name: String,
        #[serde(default)]
        args: Value,
        #[serde(rename = "invocationId", alias = "iid")]
        invocation_id: String,
    },
}

impl ContextMessage {
    /// Parse a text frame. Frames that name no context are rejected, except
    /// command results, which are matched by invocation id.
    pub fn parse(text: &str) -> Result<Self, SnapError> {
        let message: Self = serde_json::from_str(text)?;
        match message.context_id() {
            Some("") => Err(SnapError::Serialization(
                "message has an empty context id".to_string(),
            )),
            _ => Ok(message),
        }
    }

    pub fn to_text(&self) -> Result<String, SnapError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn context_id(&self) -> Option<&str> {
        match self {
            Self::Snapshot { context_id, .. } | Self::Visibility { context_id, .. } => {
                Some(context_id)
            }
            Self::CommandResult { context_id, .. } => context_id.as_deref(),
        }
    }

    /// Encode an action outcome as a `cmdres`. The respond decision travels
    /// as a `respond` field so the relay can hand it on.
    pub fn command_result(
        context_id: Option<String>,
        invocation_id: String,
        output: &ToolOutput,
    ) -> Self {
        let mut fields = match &output.output {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        let success = fields.remove("success") == Some(Value::Bool(true));
        let err = if success {
            fields.insert("respond".to_string(), Value::Bool(output.respond));
            None
        } else {
            let message = fields
                .remove("error")
                .and_then(|e| e.as_str().map(str::to_string))
                .unwrap_or_else(|| "action failed".to_string());
            fields.clear();
            Some(message)
        };
        Self::CommandResult {
            context_id,
            invocation_id,
            err,
            fields,
        }
    }
}

impl RelayMessage {
    pub fn parse(text: &str) -> Result<Self, SnapError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> Result<String, SnapError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Accept any JSON object of action descriptors, skipping entries that are
/// not objects (a disabled action may be sent as `false`).
fn deserialize_fns<'de, D>(deserializer: D) -> Result<BTreeMap<String, ActionSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default();
    let mut fns = BTreeMap::new();
    for (name, value) in raw {
        if !value.is_object() {
            debug!(action = %name, "skipping disabled action descriptor");
            continue;
        }
        match serde_json::from_value::<ActionSpec>(value) {
            Ok(spec) => {
                fns.insert(name, spec);
            }
            Err(e) => debug!(action = %name, error = %e, "skipping invalid action descriptor"),
        }
    }
    Ok(fns)
}
