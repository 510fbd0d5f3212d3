// Workflow Automation Engine
//
// Runs user-authored automation graphs (trigger -> condition/action/wait) in
// response to business events, polled shop orders and cron schedules.

pub mod actions;
pub mod conditions;
pub mod engine;
pub mod executor;
pub mod graph;
pub mod ssrf;
pub mod store;
pub mod triggers;
pub mod webhook;

pub use actions::{ActionRegistry, ActionRequest};
pub use conditions::Condition;
pub use engine::{AutomationEngine, EngineError};
pub use triggers::TriggerSink;
