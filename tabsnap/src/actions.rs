//! Action catalog and dispatch: the operations an agent may call against
//! the most recent snapshot.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, instrument, warn};
use unicode_segmentation::UnicodeSegmentation;

use crate::dom::{Document, Event, NodeRef, WeakNodeRef};
use crate::errors::SnapError;
use crate::identity::IdentityMap;
use crate::scheduler::Scheduler;

/// Name of the id parameter taken by per-element actions.
pub const ID_PARAMETER: &str = "snap_id";

pub const NAV_BACK: &str = "navback";
pub const NAV_FORWARD: &str = "navforward";
pub const CLICK: &str = "click";
pub const FILL_TEXT: &str = "fillText";
pub const SELECT_PREFIX: &str = "select_";

pub type ActionFuture = BoxFuture<'static, Result<Value, SnapError>>;
pub type ActionHandler = Arc<dyn Fn(Value) -> ActionFuture + Send + Sync>;

fn default_parameters() -> Value {
    json!({ "type": "object", "properties": {} })
}

fn default_true() -> bool {
    true
}

/// Serializable description of an action, as sent to agents and relays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// JSON schema of the single argument object.
    #[serde(default = "default_parameters")]
    pub parameters: Value,
    /// Whether completing the action should prompt a further agent turn.
    #[serde(default = "default_true")]
    pub respond: bool,
}

impl Default for ActionSpec {
    fn default() -> Self {
        Self {
            description: String::new(),
            parameters: default_parameters(),
            respond: true,
        }
    }
}

#[derive(Clone)]
pub struct Action {
    pub spec: ActionSpec,
    pub handler: ActionHandler,
}

impl Action {
    pub fn new<F, Fut>(spec: ActionSpec, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, SnapError>> + Send + 'static,
    {
        Self {
            spec,
            handler: Arc::new(move |args| handler(args).boxed()),
        }
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action").field("spec", &self.spec).finish()
    }
}

/// Result of invoking an action, ready to hand back to the agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolOutput {
    pub output: Value,
    /// Whether the agent should take another turn.
    pub respond: bool,
}

impl ToolOutput {
    pub fn failure(err: &SnapError) -> Self {
        Self {
            output: json!({ "success": false, "error": err.to_string() }),
            respond: true,
        }
    }

    pub fn is_success(&self) -> bool {
        self.output.get("success") == Some(&Value::Bool(true))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActionCatalog {
    actions: BTreeMap<String, Action>,
}

impl ActionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, action: Action) {
        self.actions.insert(name.into(), action);
    }

    pub fn get(&self, name: &str) -> Option<&Action> {
        self.actions.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Action> {
        self.actions.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Action)> {
        self.actions.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn specs(&self) -> BTreeMap<String, ActionSpec> {
        self.actions
            .iter()
            .map(|(name, action)| (name.clone(), action.spec.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Add or replace every action of `other`.
    pub fn merge(&mut self, other: ActionCatalog) {
        self.actions.extend(other.actions);
    }

    /// Run action `name`. Failures, including unknown names, come back as
    /// `{"success": false, "error": ...}` outputs.
    #[instrument(level = "debug", skip(self, args))]
    pub async fn invoke(&self, name: &str, args: Value) -> ToolOutput {
        let Some(action) = self.actions.get(name).cloned() else {
            let err = SnapError::UnknownAction(name.to_string());
            warn!(action = name, "invoked unknown action");
            return ToolOutput::failure(&err);
        };

        match (action.handler)(args).await {
            Ok(value) => {
                let mut fields = match value {
                    Value::Object(map) => map,
                    Value::Null => Map::new(),
                    other => {
                        let mut map = Map::new();
                        map.insert("result".to_string(), other);
                        map
                    }
                };
                let respond = match fields.remove("respond") {
                    Some(Value::Bool(respond)) => respond,
                    _ => action.spec.respond,
                };
                let mut output = Map::new();
                output.insert("success".to_string(), Value::Bool(true));
                output.extend(fields);
                debug!(action = name, respond, "action completed");
                ToolOutput {
                    output: Value::Object(output),
                    respond,
                }
            }
            Err(err) => {
                warn!(action = name, error = %err, "action failed");
                ToolOutput::failure(&err)
            }
        }
    }
}

/// Options for the built-in actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActionOptions {
    /// Leave out `navback` and `navforward`.
    pub disable_navigation: bool,
    /// Do not ask the agent to respond after an action completes.
    pub silent: bool,
    /// Wait after a history navigation.
    pub settle_delay_ms: u64,
    /// Pause before each typed character.
    pub keystroke_delay_ms: u64,
}

impl Default for ActionOptions {
    fn default() -> Self {
        Self {
            disable_navigation: false,
            silent: false,
            settle_delay_ms: 1000,
            keystroke_delay_ms: 50,
        }
    }
}

/// Build the catalog valid for the snapshot that produced `identities`.
///
/// Handlers resolve ids through the map captured here, and every `select_*`
/// action accepts exactly the option values present at build time.
pub fn build_catalog(
    document: &Document,
    identities: &IdentityMap,
    options: &ActionOptions,
    scheduler: &Scheduler,
) -> ActionCatalog {
    let identities = Arc::new(identities.clone());
    let respond = !options.silent;
    let mut catalog = ActionCatalog::new();

    if !options.disable_navigation {
        let settle = Duration::from_millis(options.settle_delay_ms);
        for (name, description, forward) in [
            (NAV_BACK, "Go back one page in the browser history", false),
            (NAV_FORWARD, "Go forward one page in the browser history", true),
        ] {
            let document = document.clone();
            let scheduler = scheduler.clone();
            catalog.insert(
                name,
                Action::new(
                    ActionSpec {
                        description: description.to_string(),
                        parameters: default_parameters(),
                        respond,
                    },
                    move |_args| navigate(document.clone(), scheduler.clone(), forward, settle),
                ),
            );
        }
    }

    let click_ids = identities.clone();
    catalog.insert(
        CLICK,
        Action::new(
            ActionSpec {
                description: "Click an element".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        ID_PARAMETER: {
                            "type": "string",
                            "description": "The data-snap-id value of the target element",
                        },
                    },
                    "required": [ID_PARAMETER],
                }),
                respond,
            },
            move |args| click(click_ids.clone(), args),
        ),
    );

    let fill_ids = identities.clone();
    let fill_scheduler = scheduler.clone();
    let keystroke_delay = Duration::from_millis(options.keystroke_delay_ms);
    catalog.insert(
        FILL_TEXT,
        Action::new(
            ActionSpec {
                description: "Replace the text of an input or textarea by typing it".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        ID_PARAMETER: {
                            "type": "string",
                            "description": "The data-snap-id value of the target element (select elements prohibited)",
                        },
                        "text": {
                            "type": "string",
                            "description": "The full text input",
                        },
                    },
                    "required": [ID_PARAMETER, "text"],
                }),
                respond,
            },
            move |args| fill(fill_ids.clone(), fill_scheduler.clone(), keystroke_delay, args),
        ),
    );

    for (id, select) in identities.iter().filter(|(_, node)| node.has_tag("select")) {
        let values = select.option_values();
        let target = select.downgrade();
        let allowed = Arc::new(values.clone());
        catalog.insert(
            format!("{SELECT_PREFIX}{id}"),
            Action::new(
                ActionSpec {
                    description: format!("Choose an option of the select element {id}"),
                    parameters: json!({
                        "type": "object",
                        "properties": {
                            "value": { "type": "string", "enum": values },
                        },
                        "required": ["value"],
                    }),
                    respond,
                },
                move |args| choose(target.clone(), allowed.clone(), args),
            ),
        );
    }

    debug!(actions = catalog.len(), "built action catalog");
    catalog
}

async fn navigate(
    document: Document,
    scheduler: Scheduler,
    forward: bool,
    settle: Duration,
) -> Result<Value, SnapError> {
    let moved = if forward {
        document.go_forward()
    } else {
        document.go_back()
    };
    debug!(forward, moved, "history navigation");
    scheduler.sleep(settle).await?;
    Ok(json!({}))
}

async fn click(identities: Arc<IdentityMap>, args: Value) -> Result<Value, SnapError> {
    resolve(&identities, &args)?.click();
    Ok(json!({}))
}

async fn fill(
    identities: Arc<IdentityMap>,
    scheduler: Scheduler,
    keystroke_delay: Duration,
    args: Value,
) -> Result<Value, SnapError> {
    let target = resolve(&identities, &args)?;
    let text = string_arg(&args, "text")?;
    fill_text(&target, &text, &scheduler, keystroke_delay).await?;
    Ok(json!({}))
}

async fn choose(
    target: WeakNodeRef,
    allowed: Arc<Vec<String>>,
    args: Value,
) -> Result<Value, SnapError> {
    let value = string_arg(&args, "value")?;
    if !allowed.contains(&value) {
        return Err(SnapError::InvalidArgument(format!(
            "{value:?} is not one of {allowed:?}"
        )));
    }
    let select = target
        .upgrade()
        .ok_or_else(|| SnapError::ElementNotFound("select element is gone".to_string()))?;
    select.set_value(&value)?;
    select.dispatch_event(&Event::new("input"));
    select.dispatch_event(&Event::new("change"));
    Ok(json!({}))
}

fn string_arg(args: &Value, name: &str) -> Result<String, SnapError> {
    args.get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SnapError::InvalidArgument(format!("missing string argument '{name}'")))
}

fn resolve(identities: &IdentityMap, args: &Value) -> Result<NodeRef, SnapError> {
    let id = string_arg(args, ID_PARAMETER)?;
    identities
        .get(&id)
        .ok_or_else(|| SnapError::ElementNotFound(format!("no element with id {id}")))
}

/// Type `text` into `element` the way a user would: clear it, then for each
/// character wait, send `keydown`, and unless that was cancelled append the
/// character and send `input` and `keyup`. Date inputs are set in one go.
pub async fn fill_text(
    element: &NodeRef,
    text: &str,
    scheduler: &Scheduler,
    keystroke_delay: Duration,
) -> Result<(), SnapError> {
    if element.input_type().as_deref() == Some("date") {
        element.set_value(text)?;
        element.dispatch_event(&Event::new("change"));
        return Ok(());
    }

    element.set_value("")?;
    element.dispatch_event(&Event::new("change"));

    for unit in typing_units(text) {
        scheduler.sleep(keystroke_delay).await?;
        if !element.dispatch_event(&Event::keyboard("keydown", &unit)) {
            continue;
        }
        let mut value = element.value().unwrap_or_default();
        value.push_str(&unit);
        element.set_value(&value)?;
        element.dispatch_event(&Event::new("input"));
        element.dispatch_event(&Event::keyboard("keyup", &unit));
    }
    Ok(())
}

/// Split `text` into the units typed as one key: its extended grapheme
/// clusters.
pub fn typing_units(text: &str) -> Vec<String> {
    text.graphemes(true).map(str::to_string).collect()
}
