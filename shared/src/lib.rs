use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ===== Triggers =====

/// Business events (and the schedule/manual sources) an automation can start from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TriggerType {
    #[serde(rename = "order.created")]
    OrderCreated,
    #[serde(rename = "order.paid")]
    OrderPaid,
    #[serde(rename = "order.shipped")]
    OrderShipped,
    #[serde(rename = "order.delivered")]
    OrderDelivered,
    #[serde(rename = "invoice.created")]
    InvoiceCreated,
    #[serde(rename = "invoice.paid")]
    InvoicePaid,
    #[serde(rename = "invoice.overdue")]
    InvoiceOverdue,
    #[serde(rename = "quote.sent")]
    QuoteSent,
    #[serde(rename = "quote.signed")]
    QuoteSigned,
    #[serde(rename = "project.created")]
    ProjectCreated,
    #[serde(rename = "project.status_changed")]
    ProjectStatusChanged,
    #[serde(rename = "time.schedule")]
    TimeSchedule,
    #[serde(rename = "manual")]
    Manual,
}

impl TriggerType {
    pub const ALL: [TriggerType; 13] = [
        TriggerType::OrderCreated,
        TriggerType::OrderPaid,
        TriggerType::OrderShipped,
        TriggerType::OrderDelivered,
        TriggerType::InvoiceCreated,
        TriggerType::InvoicePaid,
        TriggerType::InvoiceOverdue,
        TriggerType::QuoteSent,
        TriggerType::QuoteSigned,
        TriggerType::ProjectCreated,
        TriggerType::ProjectStatusChanged,
        TriggerType::TimeSchedule,
        TriggerType::Manual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::OrderCreated => "order.created",
            TriggerType::OrderPaid => "order.paid",
            TriggerType::OrderShipped => "order.shipped",
            TriggerType::OrderDelivered => "order.delivered",
            TriggerType::InvoiceCreated => "invoice.created",
            TriggerType::InvoicePaid => "invoice.paid",
            TriggerType::InvoiceOverdue => "invoice.overdue",
            TriggerType::QuoteSent => "quote.sent",
            TriggerType::QuoteSigned => "quote.signed",
            TriggerType::ProjectCreated => "project.created",
            TriggerType::ProjectStatusChanged => "project.status_changed",
            TriggerType::TimeSchedule => "time.schedule",
            TriggerType::Manual => "manual",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownTriggerType(pub String);

impl fmt::Display for UnknownTriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown trigger type '{}'", self.0)
    }
}

impl std::error::Error for UnknownTriggerType {}

impl FromStr for TriggerType {
    type Err = UnknownTriggerType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TriggerType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownTriggerType(s.to_string()))
    }
}

/// Filters evaluated by the dispatcher before a run is created.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Cron expression, 5 or 6 fields, only meaningful for `time.schedule`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
}

/// Where a dispatch applies. Empty scope means "every tenant, every site".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchScope {
    #[serde(default)]
    pub tenant_id: Option<Uuid>,
    #[serde(default)]
    pub site_id: Option<String>,
    #[serde(default)]
    pub automation_id: Option<Uuid>,
}

impl DispatchScope {
    pub fn tenant(tenant_id: Uuid) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            ..Default::default()
        }
    }

    pub fn automation(tenant_id: Uuid, automation_id: Uuid) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            site_id: None,
            automation_id: Some(automation_id),
        }
    }
}

/// Bookkeeping result for one matched automation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub automation_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ===== Automation graph =====

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Trigger,
    Action,
    Condition,
    Wait,
    // Written by a newer editor; executed as a skip.
    #[serde(other)]
    Unknown,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Trigger => "trigger",
            NodeKind::Action => "action",
            NodeKind::Condition => "condition",
            NodeKind::Wait => "wait",
            NodeKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EdgeLabel {
    #[default]
    Default,
    True,
    False,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub target_node_id: String,
    #[serde(default)]
    pub label: EdgeLabel,
}

impl Connection {
    pub fn new(target: impl Into<String>, label: EdgeLabel) -> Self {
        Self {
            target_node_id: target.into(),
            label,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutomationNode {
    pub id: String,
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Kind-specific settings (`actionType`, `field`/`operator`/`value`, `duration`/`unit`, ...)
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl AutomationNode {
    pub fn new(id: impl Into<String>, kind: NodeKind, config: Value) -> Self {
        Self {
            id: id.into(),
            kind,
            name: None,
            config,
            connections: Vec::new(),
        }
    }

    pub fn connect(mut self, target: impl Into<String>, label: EdgeLabel) -> Self {
        self.connections.push(Connection::new(target, label));
        self
    }

    pub fn action_type(&self) -> Option<&str> {
        match self.kind {
            NodeKind::Action => self.config.get("actionType").and_then(Value::as_str),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutomationStats {
    pub total_runs: i64,
    pub successful_runs: i64,
    pub failed_runs: i64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Automation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub active: bool,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_config: TriggerConfig,
    #[serde(default)]
    pub nodes: Vec<AutomationNode>,
    #[serde(default)]
    pub stats: AutomationStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Automation {
    pub fn trigger_nodes(&self) -> impl Iterator<Item = &AutomationNode> {
        self.nodes.iter().filter(|n| n.kind == NodeKind::Trigger)
    }

    pub fn node(&self, id: &str) -> Option<&AutomationNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

// ===== Runs =====

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "automation_run_status", rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Waiting => "waiting",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeLogStatus {
    Completed,
    Failed,
    Waiting,
    Skipped,
}

/// One executed node. Entries are appended, never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLogEntry {
    pub node_id: String,
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub status: NodeLogStatus,
    pub input: Value,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: i64,
}

/// Run-scoped key/value store: the trigger payload plus one `node_<id>` entry per executed node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct RunContext(Map<String, Value>);

impl RunContext {
    pub const TRIGGER_KEY: &'static str = "_trigger";

    /// Seeds a context from a trigger payload. Non-object payloads land under `payload`.
    pub fn seeded(payload: &Value, trigger_type: TriggerType, fired_at: DateTime<Utc>) -> Self {
        let mut map = match payload {
            Value::Object(fields) => fields.clone(),
            Value::Null => Map::new(),
            other => {
                let mut m = Map::new();
                m.insert("payload".to_string(), other.clone());
                m
            }
        };
        map.insert(
            Self::TRIGGER_KEY.to_string(),
            serde_json::json!({
                "type": trigger_type.as_str(),
                "timestamp": fired_at.to_rfc3339(),
            }),
        );
        Self(map)
    }

    pub fn node_key(node_id: &str) -> String {
        format!("node_{}", node_id)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Dotted-path lookup, e.g. `order.total` or `items.0.sku`.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.0.get(first)?;

        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }

        Some(current)
    }

    pub fn insert_node_output(&mut self, node_id: &str, output: Value) {
        self.0.insert(Self::node_key(node_id), output);
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRun {
    pub id: Uuid,
    pub automation_id: Uuid,
    pub automation_name: String,
    pub tenant_id: Uuid,
    pub trigger_type: TriggerType,
    pub trigger_data: Value,
    pub status: RunStatus,
    pub current_node_id: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub context: RunContext,
    #[serde(default)]
    pub execution_log: Vec<ExecutionLogEntry>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AutomationRun {
    /// A fresh `pending` run for `automation`, with its context seeded from `payload`.
    pub fn pending(automation: &Automation, trigger_type: TriggerType, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            automation_id: automation.id,
            automation_name: automation.name.clone(),
            tenant_id: automation.tenant_id,
            trigger_type,
            context: RunContext::seeded(&payload, trigger_type, now),
            trigger_data: payload,
            status: RunStatus::Pending,
            current_node_id: None,
            scheduled_at: None,
            execution_log: Vec::new(),
            error: None,
            started_at: None,
            completed_at: None,
            created_at: now,
        }
    }
}
