//! Relay core: turns context frames into registry updates and keeps the
//! shared agent session pointed at the active context.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tabsnap::protocol::{ContextMessage, RelayMessage};
use tabsnap::{Action, ActionCatalog, ActionSpec, AgentSession, SnapError, ToolOutput};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::errors::RelayError;
use crate::registry::{ConnectionHandle, ContextRegistry};

pub const MAIN_SECTION: &str = "main";
pub const PAGE_SECTION: &str = "page";
pub const TRUNCATION_MARKER: &str = "\n<!--(truncated)-->";

pub const DEFAULT_INVOCATION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SNAPSHOT_LIMIT: usize = 40_000;

const MAIN_INSTRUCTIONS: &str = "You are a voice assistant that can see and operate the user's browser tabs. \
Speak naturally. When you need to act on the page, call the available tools. \
Use the data-snap-id values in the page snapshot to target elements precisely. \
If you need to navigate, prefer the navigation tools.";

#[derive(Debug, Clone, PartialEq)]
pub struct RelayOptions {
    /// How long a forwarded command waits for its `cmdres`.
    pub invocation_timeout: Duration,
    /// Snapshot characters embedded in the page instructions.
    pub snapshot_limit: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            invocation_timeout: DEFAULT_INVOCATION_TIMEOUT,
            snapshot_limit: DEFAULT_SNAPSHOT_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Health {
    pub ok: bool,
    pub clients: Vec<String>,
    #[serde(rename = "activeCid")]
    pub active_cid: Option<String>,
}

pub struct Relay {
    registry: Mutex<ContextRegistry>,
    session: AgentSession,
    options: RelayOptions,
}

impl Relay {
    pub fn new(options: RelayOptions) -> Self {
        let session = AgentSession::new();
        session.set_section(MAIN_SECTION, Some(MAIN_INSTRUCTIONS.to_string()));
        Self {
            registry: Mutex::new(ContextRegistry::new()),
            session,
            options,
        }
    }

    fn registry(&self) -> MutexGuard<'_, ContextRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session(&self) -> &AgentSession {
        &self.session
    }

    pub fn options(&self) -> &RelayOptions {
        &self.options
    }

    /// Handle one text frame received over `connection`. Invalid frames are
    /// dropped with a warning.
    #[instrument(level = "debug", skip(self, connection, text), fields(connection = connection.id))]
    pub async fn handle_text(&self, connection: &ConnectionHandle, text: &str) {
        let message = match ContextMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "dropping invalid context frame");
                return;
            }
        };

        match message {
            ContextMessage::CommandResult {
                invocation_id,
                err,
                fields,
                ..
            } => {
                let reply = match err {
                    Some(err) => Err(err),
                    None => Ok(fields),
                };
                connection.pending.resolve(&invocation_id, reply).await;
            }
            other => self.record(connection, other),
        }
    }

    /// Apply a snapshot or visibility report and, when the active context's
    /// view changed, push it before the registry is released.
    fn record(&self, connection: &ConnectionHandle, message: ContextMessage) {
        let mut registry = self.registry();
        let changed = match message {
            ContextMessage::Snapshot {
                context_id,
                html,
                fns,
            } => {
                let became_active = registry.touch(&context_id, connection);
                debug!(%context_id, bytes = html.len(), actions = fns.len(), "snapshot received");
                registry.record_snapshot(&context_id, html, fns) || became_active
            }
            ContextMessage::Visibility { context_id, hidden } => {
                let became_active = registry.touch(&context_id, connection);
                debug!(%context_id, hidden, "visibility changed");
                registry.set_visibility(&context_id, hidden) || became_active
            }
            ContextMessage::CommandResult { .. } => false,
        };
        if changed {
            self.push_from(&registry);
        }
    }

    /// Forget every context that used `connection`.
    pub fn handle_disconnect(&self, connection: &ConnectionHandle) {
        let mut registry = self.registry();
        if registry.remove_connection(connection.id) {
            self.push_from(&registry);
        }
    }

    /// Point the session at the active context: its page instructions and a
    /// proxy for each of its actions. With no active context both are
    /// cleared.
    pub fn push_active(&self) {
        let registry = self.registry();
        self.push_from(&registry);
    }

    /// The session is updated while the caller still holds the registry, so
    /// pushes land in the order the registry changed. Lock order is always
    /// registry, then session.
    fn push_from(&self, registry: &ContextRegistry) {
        match registry.active_entry() {
            None => {
                self.session
                    .update([(PAGE_SECTION, None)], Some(ActionCatalog::new()), false);
                info!("no active context, page instructions cleared");
            }
            Some((context_id, entry)) => {
                let page = page_instructions(context_id, &entry.html, self.options.snapshot_limit);
                let catalog = self.proxy_catalog(context_id, &entry.connection, &entry.actions);
                debug!(%context_id, tools = catalog.len(), "pushing active context to session");
                self.session
                    .update([(PAGE_SECTION, Some(page))], Some(catalog), false);
            }
        }
    }

    /// One action per descriptor, each forwarding to `connection` and
    /// waiting for the matching result.
    pub fn proxy_catalog(
        &self,
        context_id: &str,
        connection: &ConnectionHandle,
        actions: &BTreeMap<String, ActionSpec>,
    ) -> ActionCatalog {
        let mut catalog = ActionCatalog::new();
        for (name, spec) in actions {
            let connection = connection.clone();
            let context_id = context_id.to_string();
            let action_name = name.clone();
            let timeout = self.options.invocation_timeout;
            catalog.insert(
                name.clone(),
                Action::new(spec.clone(), move |args| {
                    forward(
                        connection.clone(),
                        context_id.clone(),
                        action_name.clone(),
                        args,
                        timeout,
                    )
                }),
            );
        }
        catalog
    }

    /// Run a tool call against the active context's proxies.
    pub async fn invoke(&self, name: &str, args: Value) -> ToolOutput {
        self.session.invoke(name, args).await
    }

    pub fn health(&self) -> Health {
        let registry = self.registry();
        Health {
            ok: true,
            clients: registry.context_ids(),
            active_cid: registry.active().map(str::to_string),
        }
    }

    pub fn active_context(&self) -> Option<String> {
        self.registry().active().map(str::to_string)
    }

    pub fn active_snapshot(&self) -> Option<String> {
        self.registry()
            .active_entry()
            .map(|(_, entry)| entry.html.clone())
    }
}

async fn forward(
    connection: ConnectionHandle,
    context_id: String,
    name: String,
    args: Value,
    timeout: Duration,
) -> Result<Value, SnapError> {
    let invocation_id = Uuid::new_v4().to_string();
    let reply = connection.pending.register(&invocation_id).await;

    let command = RelayMessage::Command {
        name: name.clone(),
        args,
        invocation_id: invocation_id.clone(),
    }
    .to_text()?;
    if connection.sender.send(Message::Text(command)).is_err() {
        connection.pending.remove(&invocation_id).await;
        return Err(RelayError::ContextDisconnected(context_id).into());
    }
    debug!(%context_id, action = %name, %invocation_id, "command forwarded");

    match tokio::time::timeout(timeout, reply).await {
        Ok(Ok(Ok(fields))) => Ok(Value::Object(fields)),
        Ok(Ok(Err(message))) => Err(RelayError::Remote(message).into()),
        Ok(Err(_)) => Err(RelayError::ContextDisconnected(context_id).into()),
        Err(_) => {
            connection.pending.remove(&invocation_id).await;
            warn!(%context_id, action = %name, %invocation_id, "command timed out");
            Err(RelayError::Timeout(invocation_id).into())
        }
    }
}

/// Snapshot cut to `limit` characters, marked when something was cut.
pub fn truncate_snapshot(html: &str, limit: usize) -> String {
    match html.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}{TRUNCATION_MARKER}", &html[..cut]),
        None => html.to_string(),
    }
}

pub fn page_instructions(context_id: &str, html: &str, limit: usize) -> String {
    let snapshot = truncate_snapshot(html, limit);
    format!(
        "You are controlling the ACTIVE BROWSER TAB (cid={context_id}).
Below is a compact HTML snapshot (data-snap-id values included) of the *current* page:

{snapshot}

Guidance:
- When the user asks to click/tap something, call the 'click' tool with the element's snap_id.
- For typing, call 'fillText' with {{ snap_id, text }} (never partial char-by-char).
- For selects, use the specific \"select_*\" tool with {{ value }}.
- For browser history, use 'navback' or 'navforward'.
- If you can't find an element, ask a clarifying question."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_adds_marker() {
        assert_eq!(truncate_snapshot("abc", 3), "abc");
        assert_eq!(truncate_snapshot("abcdef", 3), "abc\n<!--(truncated)-->");
        assert_eq!(truncate_snapshot("ééé", 2), "éé\n<!--(truncated)-->");
    }

    #[test]
    fn page_text_names_the_context() {
        let text = page_instructions("tab-9", "<p>hi</p>", 100);
        assert!(text.contains("cid=tab-9"));
        assert!(text.contains("<p>hi</p>"));
        assert!(text.contains("{ snap_id, text }"));
    }

    #[test]
    fn new_relay_has_baseline_instructions() {
        let relay = Relay::new(RelayOptions::default());
        assert!(relay.session().section(MAIN_SECTION).is_some());
        assert!(relay.session().section(PAGE_SECTION).is_none());
        assert_eq!(
            relay.health(),
            Health {
                ok: true,
                clients: vec![],
                active_cid: None
            }
        );
    }
}
