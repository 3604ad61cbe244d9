//! Snapshot engine: a filtered, attribute-pruned serialization of a live
//! tree, with stable ids on the elements an agent can act on.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::dom::{ComputedStyle, NodeRef, NodeType};
use crate::errors::SnapError;
use crate::filter_clone::{filter_clone, FrameInlining};
use crate::identity::{mint_id, IdentityMap};

/// Attribute carrying an element's id in the serialized snapshot.
pub const SNAP_ID_ATTRIBUTE: &str = "data-snap-id";

/// Elements that always receive an id when interactive tracking is on.
pub const INTERACTIVE_TAGS: &[&str] = &["a", "input", "textarea", "select", "button"];

/// Elements carrying this class are kept even when they are not rendered.
pub const AGENT_ONLY_CLASS: &str = "ai-only";

/// Elements carrying this class are never part of a snapshot.
pub const AGENT_INVISIBLE_CLASS: &str = "ai-invisible";

/// Source attributes longer than this are dropped.
pub const MAX_SRC_LEN: usize = 512;

/// Attributes kept in the snapshot: exact names plus regular expressions.
///
/// The list prunes the attributes an element carries in the live tree. Two
/// attributes the engine writes afterwards are exempt: `value` on form
/// controls, which carries the live value, and [`SNAP_ID_ATTRIBUTE`] on
/// tracked elements.
///
/// Deserializes either from `{"names": [...], "patterns": [...]}` or from a
/// flat list in which `/.../` entries are patterns.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "AllowListRepr")]
pub struct AttributeAllowList {
    pub names: Vec<String>,
    pub patterns: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AllowListRepr {
    Flat(Vec<String>),
    Split {
        #[serde(default)]
        names: Vec<String>,
        #[serde(default)]
        patterns: Vec<String>,
    },
}

impl From<AllowListRepr> for AttributeAllowList {
    fn from(repr: AllowListRepr) -> Self {
        match repr {
            AllowListRepr::Split { names, patterns } => Self { names, patterns },
            AllowListRepr::Flat(entries) => {
                let mut list = Self::default();
                for entry in entries {
                    match entry
                        .strip_prefix('/')
                        .and_then(|rest| rest.strip_suffix('/'))
                    {
                        Some(pattern) if !pattern.is_empty() => {
                            list.patterns.push(pattern.to_string())
                        }
                        _ => list.names.push(entry),
                    }
                }
                list
            }
        }
    }
}

impl AttributeAllowList {
    /// The list an agent sees by default: accessibility attributes plus the
    /// handful of attributes that describe what an element is or does.
    pub fn agent_default() -> Self {
        Self {
            names: [
                "alt",
                "class",
                "title",
                "href",
                "src",
                "type",
                "name",
                "placeholder",
                "value",
                "id",
                "role",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            patterns: vec!["^aria-".to_string()],
        }
    }

    pub fn compile(&self) -> Result<CompiledAllowList, SnapError> {
        let patterns = self
            .patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    SnapError::Config(format!("invalid attribute pattern {p:?}: {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CompiledAllowList {
            names: self.names.iter().map(|n| n.to_ascii_lowercase()).collect(),
            patterns,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CompiledAllowList {
    names: HashSet<String>,
    patterns: Vec<Regex>,
}

impl CompiledAllowList {
    pub fn permits(&self, attribute: &str) -> bool {
        self.names.contains(attribute) || self.patterns.iter().any(|p| p.is_match(attribute))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SnapshotOptions {
    /// Trim text nodes and collapse inner whitespace runs to one space.
    pub collapse_whitespace: bool,
    /// Give every element an id, not only interactive ones.
    pub id_track_all: bool,
    /// Give interactive elements an id.
    pub track_interactive: bool,
    /// `None` keeps every attribute.
    pub attribute_allow_list: Option<AttributeAllowList>,
    pub remove_invisible: bool,
    /// Apply the `ai-only` / `ai-invisible` marker classes.
    pub honor_marker_classes: bool,
    pub inline_same_origin_frames: bool,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            collapse_whitespace: false,
            id_track_all: false,
            track_interactive: true,
            attribute_allow_list: None,
            remove_invisible: false,
            honor_marker_classes: true,
            inline_same_origin_frames: false,
        }
    }
}

impl SnapshotOptions {
    /// Settings used when snapshots are handed to an agent.
    pub fn agent() -> Self {
        Self {
            collapse_whitespace: true,
            attribute_allow_list: Some(AttributeAllowList::agent_default()),
            remove_invisible: true,
            inline_same_origin_frames: true,
            ..Self::default()
        }
    }
}

/// Serialized view of a tree plus the ids that make it actionable.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub html: String,
    pub identities: IdentityMap,
}

#[derive(Debug, Clone)]
pub struct SnapshotEngine {
    options: SnapshotOptions,
    allow_list: Option<CompiledAllowList>,
}

impl SnapshotEngine {
    pub fn new(options: SnapshotOptions) -> Result<Self, SnapError> {
        let allow_list = options
            .attribute_allow_list
            .as_ref()
            .map(AttributeAllowList::compile)
            .transpose()?;
        Ok(Self {
            options,
            allow_list,
        })
    }

    pub fn options(&self) -> &SnapshotOptions {
        &self.options
    }

    /// Snapshot `root`. Ids already bound in `previous` are reused; the
    /// returned map is a copy of `previous` with this pass's bindings.
    #[instrument(level = "debug", skip_all, fields(root = ?root))]
    pub fn snapshot(&self, root: &NodeRef, previous: &IdentityMap) -> Snapshot {
        let mut identities = previous.clone();
        identities.prune();

        let frames = if self.options.inline_same_origin_frames {
            FrameInlining::SameOrigin
        } else {
            FrameInlining::Disabled
        };
        let mut styles = VisibilityCache::default();
        let mut decide = |candidate: NodeRef, original: &NodeRef| {
            Ok::<_, SnapError>(self.decide(candidate, original, &mut identities, &mut styles))
        };
        let html = filter_clone(root, &mut decide, frames)
            .map(|copy| copy.outer_html())
            .unwrap_or_default();

        debug!(
            bytes = html.len(),
            ids = identities.len(),
            "snapshot taken"
        );
        Snapshot { html, identities }
    }

    fn decide(
        &self,
        candidate: NodeRef,
        original: &NodeRef,
        identities: &mut IdentityMap,
        styles: &mut VisibilityCache,
    ) -> Option<NodeRef> {
        match candidate.node_type() {
            NodeType::Comment => return Some(candidate),
            NodeType::Text => {
                if self.options.collapse_whitespace {
                    let text = candidate.data().unwrap_or_default();
                    candidate.set_text(&collapse_whitespace(&text));
                }
                return Some(candidate);
            }
            NodeType::Element => {}
        }

        if self.options.remove_invisible && !self.visible_with(original, styles) {
            debug!(node = ?original, "dropping invisible element");
            return None;
        }

        if let Some(allow_list) = &self.allow_list {
            for name in candidate.attribute_names() {
                if !allow_list.permits(&name) {
                    candidate.remove_attribute(&name);
                }
            }
        }

        if holds_live_value(original) {
            if let Some(value) = original.value() {
                candidate.set_attribute("value", &value);
            }
        }

        if let Some(src) = candidate.attribute("src") {
            if src.starts_with("data:") || src.len() > MAX_SRC_LEN {
                candidate.remove_attribute("src");
            }
        }

        if self.tracks(original) {
            let id = match identities.get_key(original) {
                Some(id) => id.to_string(),
                None => {
                    let mut id = mint_id();
                    while identities.contains_key(&id) {
                        id = mint_id();
                    }
                    id
                }
            };
            candidate.set_attribute(SNAP_ID_ATTRIBUTE, &id);
            identities.set(id, original);
        }

        Some(candidate)
    }

    fn tracks(&self, node: &NodeRef) -> bool {
        self.options.id_track_all || (self.options.track_interactive && is_interactive(node))
    }

    /// Visibility rules: marker classes first, then excluded tags, then
    /// computed style, then the layout box.
    pub fn is_visible(&self, node: &NodeRef) -> bool {
        self.visible_with(node, &mut VisibilityCache::default())
    }

    fn visible_with(&self, node: &NodeRef, styles: &mut VisibilityCache) -> bool {
        if !node.is_element() {
            return true;
        }
        if self.options.honor_marker_classes {
            if node.has_class(AGENT_INVISIBLE_CLASS) {
                return false;
            }
            if node.has_class(AGENT_ONLY_CLASS) {
                return true;
            }
        }
        if node.has_tag("script") || node.has_tag("style") {
            return false;
        }
        if node.has_tag("iframe") && is_cross_origin_frame(node) {
            return false;
        }
        let style = ComputedStyle {
            display: node.computed_display(),
            visibility: styles.visibility(node),
        };
        if !style.is_displayed() || !style.is_visible() {
            return false;
        }
        // never laid out counts as rendered
        !node.bounding_client_rect().is_some_and(|rect| rect.is_empty())
    }
}

/// Inherited `visibility` resolved once per element for a whole pass, so
/// deep pages cost one ancestor walk in total.
#[derive(Debug, Default)]
struct VisibilityCache {
    resolved: HashMap<NodeRef, String>,
}

impl VisibilityCache {
    fn visibility(&mut self, node: &NodeRef) -> String {
        let mut pending = Vec::new();
        let mut current = Some(node.clone());
        let mut visibility = "visible".to_string();
        while let Some(element) = current.filter(NodeRef::is_element) {
            if let Some(known) = self.resolved.get(&element) {
                visibility = known.clone();
                break;
            }
            if let Some(declared) = element.declared_visibility() {
                visibility = declared;
                pending.push(element);
                break;
            }
            current = element.parent();
            pending.push(element);
        }
        for element in pending {
            self.resolved.insert(element, visibility.clone());
        }
        visibility
    }
}

pub fn is_interactive(node: &NodeRef) -> bool {
    node.tag_name()
        .is_some_and(|tag| INTERACTIVE_TAGS.contains(&tag.as_str()))
}

/// Controls whose value the user edits, so the markup alone goes stale.
fn holds_live_value(node: &NodeRef) -> bool {
    node.has_tag("input") || node.has_tag("textarea") || node.has_tag("select")
}

fn is_cross_origin_frame(frame: &NodeRef) -> bool {
    let Some(doc) = frame.owner_document() else {
        return false;
    };
    match frame.src() {
        Some(src) if !src.is_empty() && !src.starts_with("about:") => {
            !frame.is_same_origin_frame(&doc.origin())
        }
        _ => false,
    }
}

pub(crate) fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{Document, Rect};

    fn page(body: &str) -> Document {
        Document::parse("https://example.com/", &format!("<body>{body}</body>")).unwrap()
    }

    fn engine(options: SnapshotOptions) -> SnapshotEngine {
        SnapshotEngine::new(options).unwrap()
    }

    #[test]
    fn collapses_whitespace_and_prunes_attributes() {
        let doc = page(r#"<p style="color:red" aria-label="greeting" data-x="1">  Hello
            there   </p>"#);
        let snap = engine(SnapshotOptions::agent()).snapshot(&doc.body().unwrap(), &IdentityMap::new());
        assert_eq!(snap.html, r#"<body><p aria-label="greeting">Hello there</p></body>"#);
    }

    #[test]
    fn interactive_elements_get_ids() {
        let doc = page(r#"<button>Go</button><span>static</span>"#);
        let snap = engine(SnapshotOptions::agent()).snapshot(&doc.body().unwrap(), &IdentityMap::new());
        let button = doc.query_all("button").remove(0);
        let id = snap.identities.get_key(&button).unwrap().to_string();
        assert_eq!(id.len(), 12);
        assert!(snap.html.contains(&format!(r#"<button data-snap-id="{id}">Go</button>"#)));
        assert_eq!(snap.identities.len(), 1);
    }

    #[test]
    fn id_track_all_tags_every_element() {
        let doc = page("<div><span>x</span></div>");
        let options = SnapshotOptions {
            id_track_all: true,
            ..SnapshotOptions::default()
        };
        let snap = engine(options).snapshot(&doc.body().unwrap(), &IdentityMap::new());
        // body, div, span
        assert_eq!(snap.identities.len(), 3);
    }

    #[test]
    fn reuses_ids_across_passes() {
        let doc = page(r#"<a href="/one">one</a><input name="q">"#);
        let engine = engine(SnapshotOptions::agent());
        let body = doc.body().unwrap();
        let first = engine.snapshot(&body, &IdentityMap::new());
        let again = engine.snapshot(&body, &first.identities);
        assert_eq!(first.html, again.html);

        let link = doc.query_all("a").remove(0);
        let sibling = doc.create_element("button");
        body.insert_before(&sibling, Some(&link)).unwrap();
        let third = engine.snapshot(&body, &again.identities);
        assert_eq!(
            third.identities.get_key(&link),
            first.identities.get_key(&link)
        );
        assert!(third.identities.get_key(&sibling).is_some());
        assert_ne!(
            third.identities.get_key(&sibling),
            third.identities.get_key(&link)
        );
    }

    #[test]
    fn previous_map_is_left_untouched() {
        let doc = page("<button>b</button>");
        let previous = IdentityMap::new();
        let snap = engine(SnapshotOptions::agent()).snapshot(&doc.body().unwrap(), &previous);
        assert!(previous.is_empty());
        assert_eq!(snap.identities.len(), 1);
    }

    #[test]
    fn visibility_rules() {
        let doc = page(
            r#"<div id="zero">zero</div>
               <div id="hidden" style="display:none">hidden</div>
               <div class="ai-only" style="display:none">only</div>
               <div class="ai-invisible">secret</div>
               <script>var x = 1;</script>
               <div id="shown">shown</div>"#,
        );
        doc.element_by_id("zero")
            .unwrap()
            .set_layout(Rect::new(0.0, 0.0, 0.0, 0.0));
        doc.element_by_id("shown")
            .unwrap()
            .set_layout(Rect::new(0.0, 0.0, 10.0, 10.0));
        let mut options = SnapshotOptions::agent();
        options.attribute_allow_list = Some(AttributeAllowList::default());
        let snap = engine(options).snapshot(&doc.body().unwrap(), &IdentityMap::new());
        assert_eq!(snap.html, "<body><div>only</div><div>shown</div></body>");
    }

    #[test]
    fn inherited_visibility_hides_descendants() {
        let doc = page(
            r#"<section style="visibility:hidden"><div><p>gone</p></div></section>
               <div style="visibility:collapse"><span style="visibility:inherit">also gone</span></div>
               <div><span>kept</span></div>"#,
        );
        let mut options = SnapshotOptions::agent();
        options.attribute_allow_list = Some(AttributeAllowList::default());
        let snap = engine(options).snapshot(&doc.body().unwrap(), &IdentityMap::new());
        assert_eq!(snap.html, "<body><div><span>kept</span></div></body>");
    }

    #[test]
    fn deep_trees_snapshot_with_visibility_checks() {
        let doc = page("");
        let body = doc.body().unwrap();
        let mut tip = body.clone();
        for _ in 0..20_000 {
            let next = doc.create_element("div");
            tip.attach_child(&next, None);
            tip = next;
        }
        tip.attach_child(&doc.create_text_node("leaf"), None);

        let snap = engine(SnapshotOptions::agent()).snapshot(&body, &IdentityMap::new());
        assert!(snap.html.starts_with("<body><div><div>"));
        assert!(snap.html.contains("<div>leaf</div>"));
        assert!(snap.html.ends_with("</div></div></body>"));
        assert_eq!(snap.html.matches("<div>").count(), 20_000);
    }

    #[test]
    fn live_values_are_materialized() {
        let doc = page(r#"<input name="q" value="old"><textarea></textarea>"#);
        let input = doc.query_all("input").remove(0);
        input.set_value("typed by user").unwrap();
        doc.query_all("textarea")
            .remove(0)
            .set_value("notes")
            .unwrap();
        let options = SnapshotOptions {
            track_interactive: false,
            ..SnapshotOptions::agent()
        };
        let snap = engine(options).snapshot(&doc.body().unwrap(), &IdentityMap::new());
        assert_eq!(
            snap.html,
            r#"<body><input name="q" value="typed by user"><textarea value="notes"></textarea></body>"#
        );
    }

    #[test]
    fn engine_attributes_bypass_the_allow_list() {
        let doc = page(r#"<input name="q" value="old" title="search"><button value="b">Go</button>"#);
        doc.query_all("input").remove(0).set_value("new").unwrap();
        let options = SnapshotOptions {
            attribute_allow_list: Some(AttributeAllowList {
                names: vec!["name".to_string()],
                patterns: vec![],
            }),
            ..SnapshotOptions::agent()
        };
        let snap = engine(options).snapshot(&doc.body().unwrap(), &IdentityMap::new());
        let input = doc.query_all("input").remove(0);
        let button = doc.query_all("button").remove(0);
        let input_id = snap.identities.get_key(&input).unwrap();
        let button_id = snap.identities.get_key(&button).unwrap();
        assert_eq!(
            snap.html,
            format!(
                r#"<body><input name="q" value="new" data-snap-id="{input_id}"><button data-snap-id="{button_id}">Go</button></body>"#
            )
        );
    }

    #[test]
    fn strips_data_and_oversized_sources() {
        let long = format!("https://example.com/{}", "a".repeat(600));
        let doc = page(&format!(
            r#"<img src="data:image/png;base64,AAAA" alt="inline"><img src="{long}" alt="long"><img src="/ok.png" alt="ok">"#
        ));
        let snap = engine(SnapshotOptions::agent()).snapshot(&doc.body().unwrap(), &IdentityMap::new());
        assert_eq!(
            snap.html,
            r#"<body><img alt="inline"><img alt="long"><img src="/ok.png" alt="ok"></body>"#
        );
    }

    #[test]
    fn rejected_root_serializes_to_empty() {
        let doc = page("<div>x</div>");
        let body = doc.body().unwrap();
        body.set_attribute("class", "ai-invisible");
        let snap = engine(SnapshotOptions::agent()).snapshot(&body, &IdentityMap::new());
        assert_eq!(snap.html, "");
    }

    #[test]
    fn flat_allow_list_splits_patterns() {
        let list: AttributeAllowList =
            serde_json::from_str(r#"["/^aria-/", "title", "/^data-/"]"#).unwrap();
        assert_eq!(list.names, vec!["title"]);
        assert_eq!(list.patterns, vec!["^aria-", "^data-"]);
        let compiled = list.compile().unwrap();
        assert!(compiled.permits("aria-hidden"));
        assert!(compiled.permits("data-snap-id"));
        assert!(!compiled.permits("style"));
    }

    #[test]
    fn bad_pattern_is_a_config_error() {
        let options = SnapshotOptions {
            attribute_allow_list: Some(AttributeAllowList {
                names: vec![],
                patterns: vec!["(".to_string()],
            }),
            ..SnapshotOptions::default()
        };
        assert!(matches!(
            SnapshotEngine::new(options),
            Err(SnapError::Config(_))
        ));
    }

    #[test]
    fn options_use_camel_case() {
        let options: SnapshotOptions = serde_json::from_str(
            r#"{"collapseWhitespace": true, "idTrackAll": true, "removeInvisible": true}"#,
        )
        .unwrap();
        assert!(options.collapse_whitespace && options.id_track_all && options.remove_invisible);
        assert!(options.track_interactive);
        assert!(!options.inline_same_origin_frames);
    }
}
