// Workflow Graph - Arena view over an automation's nodes

use chrono::{DateTime, Duration, Utc};
use kontor_shared::{Automation, AutomationNode, EdgeLabel, NodeKind, TriggerType};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use super::{ActionRequest, Condition};
use crate::jobs::scheduler::normalize_cron_expression;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("automation has no trigger node")]
    MissingTrigger,
    #[error("node '{from}' connects to unknown node '{target}'")]
    DanglingTarget { from: String, target: String },
    #[error("node '{0}' not found in automation")]
    UnknownNode(String),
    #[error("node '{node_id}' has invalid configuration: {reason}")]
    InvalidConfig { node_id: String, reason: String },
}

pub type NodeIndex = usize;

/// Nodes stored by position, with a string-id lookup table.
#[derive(Debug)]
pub struct WorkflowGraph<'a> {
    nodes: Vec<&'a AutomationNode>,
    index: HashMap<&'a str, NodeIndex>,
}

impl<'a> WorkflowGraph<'a> {
    pub fn build(automation: &'a Automation) -> Self {
        let nodes: Vec<&AutomationNode> = automation.nodes.iter().collect();
        let mut index = HashMap::with_capacity(nodes.len());
        for (position, node) in nodes.iter().enumerate() {
            // first definition wins; duplicates are rejected at activation
            index.entry(node.id.as_str()).or_insert(position);
        }

        Self { nodes, index }
    }

    pub fn node(&self, idx: NodeIndex) -> &'a AutomationNode {
        self.nodes[idx]
    }

    pub fn resolve(&self, id: &str) -> Option<NodeIndex> {
        self.index.get(id).copied()
    }

    /// The first trigger node in definition order.
    pub fn trigger(&self) -> Result<NodeIndex, GraphError> {
        self.nodes
            .iter()
            .position(|n| n.kind == NodeKind::Trigger)
            .ok_or(GraphError::MissingTrigger)
    }

    /// Children to follow from `idx`. `default` edges are always taken; `true`/`false`
    /// edges only when `branch` matches.
    pub fn successors(&self, idx: NodeIndex, branch: Option<bool>) -> Result<Vec<NodeIndex>, GraphError> {
        let node = self.nodes[idx];
        let mut next = Vec::with_capacity(node.connections.len());

        for connection in &node.connections {
            let taken = match connection.label {
                EdgeLabel::Default => true,
                EdgeLabel::True => branch == Some(true),
                EdgeLabel::False => branch == Some(false),
            };
            if !taken {
                continue;
            }

            let target = self
                .resolve(&connection.target_node_id)
                .ok_or_else(|| GraphError::DanglingTarget {
                    from: node.id.clone(),
                    target: connection.target_node_id.clone(),
                })?;
            next.push(target);
        }

        Ok(next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitUnit {
    Minutes,
    Hours,
    Days,
}

impl WaitUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitUnit::Minutes => "minutes",
            WaitUnit::Hours => "hours",
            WaitUnit::Days => "days",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitSpec {
    pub duration: i64,
    pub unit: WaitUnit,
}

impl WaitSpec {
    pub fn from_config(config: &Value) -> Result<Self, String> {
        let duration = match config.get("duration") {
            Some(Value::Number(n)) => match n.as_i64() {
                Some(whole) => Some(whole),
                None => n.as_f64().map(whole_units).transpose()?,
            },
            Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
        .ok_or_else(|| "wait node needs a numeric 'duration'".to_string())?;

        if duration < 0 {
            return Err("wait 'duration' must not be negative".to_string());
        }

        let unit = match config.get("unit").and_then(Value::as_str).unwrap_or("minutes") {
            "minute" | "minutes" => WaitUnit::Minutes,
            "hour" | "hours" => WaitUnit::Hours,
            "day" | "days" => WaitUnit::Days,
            other => return Err(format!("unsupported wait unit '{}'", other)),
        };

        let spec = Self { duration, unit };
        spec.resume_at(Utc::now())?;
        Ok(spec)
    }

    fn delta(&self) -> Option<Duration> {
        match self.unit {
            WaitUnit::Minutes => Duration::try_minutes(self.duration),
            WaitUnit::Hours => Duration::try_hours(self.duration),
            WaitUnit::Days => Duration::try_days(self.duration),
        }
    }

    pub fn resume_at(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
        self.delta()
            .and_then(|delta| now.checked_add_signed(delta))
            .ok_or_else(|| format!("wait of {} {} is out of range", self.duration, self.unit.as_str()))
    }
}

/// Fractional durations round up to the next whole unit.
fn whole_units(value: f64) -> Result<i64, String> {
    let rounded = value.ceil();
    if rounded.is_finite() && rounded.abs() < i64::MAX as f64 {
        Ok(rounded as i64)
    } else {
        Err(format!("wait 'duration' {} is out of range", value))
    }
}

/// A node's kind-specific configuration, parsed when the node is reached.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeStep {
    Trigger,
    Action(ActionRequest),
    Condition(Condition),
    Wait(WaitSpec),
    Unknown,
}

impl NodeStep {
    pub fn parse(node: &AutomationNode) -> Result<Self, GraphError> {
        let invalid = |reason: String| GraphError::InvalidConfig {
            node_id: node.id.clone(),
            reason,
        };

        match node.kind {
            NodeKind::Trigger => Ok(NodeStep::Trigger),
            NodeKind::Action => Ok(NodeStep::Action(ActionRequest::from_config(&node.config))),
            NodeKind::Condition => serde_json::from_value::<Condition>(node.config.clone())
                .map(NodeStep::Condition)
                .map_err(|e| invalid(e.to_string())),
            NodeKind::Wait => WaitSpec::from_config(&node.config)
                .map(NodeStep::Wait)
                .map_err(invalid),
            NodeKind::Unknown => Ok(NodeStep::Unknown),
        }
    }
}

/// Everything that makes an automation unfit to be switched on.
pub fn validate_for_activation(automation: &Automation) -> Vec<String> {
    let mut issues = Vec::new();
    let graph = WorkflowGraph::build(automation);

    if automation.trigger_nodes().next().is_none() {
        issues.push(GraphError::MissingTrigger.to_string());
    }

    let mut seen = HashSet::new();
    for node in &automation.nodes {
        if !seen.insert(node.id.as_str()) {
            issues.push(format!("duplicate node id '{}'", node.id));
        }

        for connection in &node.connections {
            if graph.resolve(&connection.target_node_id).is_none() {
                issues.push(
                    GraphError::DanglingTarget {
                        from: node.id.clone(),
                        target: connection.target_node_id.clone(),
                    }
                    .to_string(),
                );
            }
        }

        match NodeStep::parse(node) {
            Ok(NodeStep::Action(request)) => {
                if let Err(reason) = request.validate() {
                    issues.push(
                        GraphError::InvalidConfig {
                            node_id: node.id.clone(),
                            reason,
                        }
                        .to_string(),
                    );
                }
            }
            Ok(_) => {}
            Err(e) => issues.push(e.to_string()),
        }
    }

    if automation.trigger_type == TriggerType::TimeSchedule {
        match automation.trigger_config.cron.as_deref() {
            Some(expr) => {
                if let Err(e) = normalize_cron_expression(expr) {
                    issues.push(e.to_string());
                }
            }
            None => issues.push("time.schedule automations need a cron expression".to_string()),
        }
    }

    issues
}
