//! Live page snapshots for conversational agents
//!
//! `tabsnap` turns a live, mutating document tree into a compact HTML
//! snapshot in which every interactive element carries a stable id, keeps
//! that snapshot current as the tree changes, and exposes the actions
//! (click, type, select, navigate) an agent can run against it. Contexts can
//! also publish to a relay that lets several tabs share one agent session.

pub mod actions;
pub mod config;
pub mod detector;
pub mod dom;
pub mod errors;
pub mod filter_clone;
pub mod identity;
pub mod protocol;
pub mod relay_client;
pub mod scheduler;
pub mod session;
pub mod snapshot;

pub use actions::{
    build_catalog, Action, ActionCatalog, ActionHandler, ActionOptions, ActionSpec, ToolOutput,
};
pub use config::AssistConfig;
pub use detector::{ChangeDetector, DetectorOptions, SnapshotSink, SnapshotUpdate};
pub use dom::{Document, NodeRef};
pub use errors::SnapError;
pub use filter_clone::{filter_clone, FrameInlining, NodeFilter};
pub use identity::{mint_id, IdentityMap};
pub use protocol::{ContextMessage, RelayMessage};
pub use relay_client::RelayClient;
pub use scheduler::Scheduler;
pub use session::{AgentSession, ToolDefinition};
pub use snapshot::{AttributeAllowList, Snapshot, SnapshotEngine, SnapshotOptions};
