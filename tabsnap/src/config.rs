use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::actions::ActionOptions;
use crate::detector::DetectorOptions;
use crate::errors::SnapError;
use crate::snapshot::SnapshotOptions;

/// Everything a context needs to observe a page and serve an agent, as read
/// from a camelCase JSON document.
///
/// ```json
/// {
///   "snapshot": { "collapseWhitespace": true, "attributeAllowList": ["/^aria-/", "title"] },
///   "actions": { "silent": true },
///   "relayUrl": "ws://127.0.0.1:8845"
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AssistConfig {
    pub snapshot: SnapshotOptions,
    pub actions: ActionOptions,
    /// WebSocket URL of a relay; `None` runs the context on its own.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_url: Option<String>,
}

impl AssistConfig {
    pub fn agent() -> Self {
        Self {
            snapshot: SnapshotOptions::agent(),
            ..Self::default()
        }
    }

    pub fn from_json(text: &str) -> Result<Self, SnapError> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| SnapError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SnapError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SnapError::Config(format!("cannot read {}: {e}", path.display())))?;
        debug!(path = %path.display(), "loaded config file");
        Self::from_json(&text)
    }

    /// Check the allow-list patterns and the relay URL.
    pub fn validate(&self) -> Result<(), SnapError> {
        if let Some(list) = &self.snapshot.attribute_allow_list {
            list.compile()?;
        }
        if let Some(relay_url) = &self.relay_url {
            let url = Url::parse(relay_url)
                .map_err(|e| SnapError::Config(format!("invalid relay url {relay_url}: {e}")))?;
            if !matches!(url.scheme(), "ws" | "wss") {
                return Err(SnapError::Config(format!(
                    "relay url must use ws:// or wss://, got {relay_url}"
                )));
            }
        }
        Ok(())
    }

    pub fn detector_options(&self) -> DetectorOptions {
        DetectorOptions {
            snapshot: self.snapshot.clone(),
            actions: self.actions.clone(),
        }
    }
}
