//! Immutable render frames for streaming and visualization.
//!
//! A [`RenderState`] is built once per step for external consumers. It is
//! never part of the authoritative simulation state and is never persisted
//! inside a checkpoint.
//!
//! Plugins without a dedicated render adapter return arbitrary JSON from
//! their render hook; [`RenderState::normalize`] folds that JSON into the
//! fixed frame shape, accepting the layouts plugins commonly emit.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::metrics::MetricRow;

/// Agent keys consumed by normalization and not copied into attributes.
const RESERVED_AGENT_KEYS: [&str; 7] = [
    "id",
    "position",
    "alive",
    "velocity",
    "fitness",
    "genome_summary",
    "genome",
];

/// Snapshot of one agent for rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    /// Stable agent identifier.
    pub id: String,
    /// Position as `[x, y]`.
    pub position: [f64; 2],
    /// Velocity as `[dx, dy]` when the plugin reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<[f64; 2]>,
    /// Free-form genome summary.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub genome_summary: BTreeMap<String, Value>,
    /// Fitness score when the plugin reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fitness: Option<f64>,
    /// Whether the agent is alive.
    pub alive: bool,
    /// Simulation-specific scalar fields kept for inspection.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

/// Snapshot of the environment for rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentState {
    /// World extent as `[width, height]`.
    pub bounds: [f64; 2],
    /// Obstacles in plugin-defined shape.
    #[serde(default)]
    pub obstacles: Vec<Value>,
    /// Resources (for example food cells) in plugin-defined shape.
    #[serde(default)]
    pub resources: Vec<Value>,
    /// Arbitrary plugin metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Default for EnvironmentState {
    fn default() -> Self {
        Self {
            bounds: [1.0, 1.0],
            obstacles: Vec::new(),
            resources: Vec::new(),
            metadata: Map::new(),
        }
    }
}

/// Top-level immutable render frame emitted once per step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderState {
    /// Generation counter at the time of the frame.
    pub generation_index: u64,
    /// Step counter at the time of the frame.
    pub step_index: u64,
    /// Agents visible in this frame.
    pub agents: Vec<AgentState>,
    /// Environment snapshot.
    pub environment: EnvironmentState,
    /// Metrics observed for this step.
    pub metrics: MetricRow,
    /// Wall-clock seconds since the Unix epoch.
    pub timestamp: f64,
}

impl RenderState {
    /// Normalize a plugin's raw render JSON into a frame.
    ///
    /// Agents come from `environment.metadata.agents_full` when present,
    /// otherwise from `agents`. Bounds come from `environment.bounds`, then
    /// `room_width`/`room_height`, then `world_size`, falling back to
    /// `[1, 1]`. Food rows become resources.
    pub fn normalize(
        raw: &Value,
        generation_index: u64,
        step_index: u64,
        metrics: MetricRow,
        timestamp: f64,
    ) -> Self {
        let empty = Map::new();
        let state = raw.as_object().unwrap_or(&empty);
        let env_payload = state
            .get("environment")
            .and_then(Value::as_object)
            .unwrap_or(&empty);
        let metadata = env_payload
            .get("metadata")
            .and_then(Value::as_object)
            .unwrap_or(&empty);

        let mut agents = metadata
            .get("agents_full")
            .map(normalize_agents)
            .unwrap_or_default();
        if agents.is_empty() {
            agents = state.get("agents").map(normalize_agents).unwrap_or_default();
        }

        let mut environment = EnvironmentState {
            bounds: extract_bounds(state, env_payload),
            metadata: metadata.clone(),
            ..EnvironmentState::default()
        };
        if let Some(obstacles) = env_payload.get("obstacles").and_then(Value::as_array) {
            environment.obstacles.clone_from(obstacles);
        }
        environment.resources = normalize_food(state.get("food"));
        if environment.resources.is_empty() {
            environment.resources = normalize_food(metadata.get("food"));
        }
        if let Some(name) = state.get("simulation").and_then(Value::as_str) {
            environment
                .metadata
                .insert("simulation".to_owned(), Value::from(name));
        }

        Self {
            generation_index,
            step_index,
            agents,
            environment,
            metrics,
            timestamp,
        }
    }
}

fn extract_bounds(state: &Map<String, Value>, env_payload: &Map<String, Value>) -> [f64; 2] {
    if let Some(pair) = env_payload.get("bounds").and_then(as_pair) {
        return pair;
    }
    let width = state.get("room_width").and_then(Value::as_f64);
    let height = state.get("room_height").and_then(Value::as_f64);
    if let (Some(width), Some(height)) = (width, height) {
        return [width, height];
    }
    if let Some(size) = state.get("world_size").and_then(Value::as_f64) {
        return [size, size];
    }
    [1.0, 1.0]
}

fn as_pair(value: &Value) -> Option<[f64; 2]> {
    let items = value.as_array()?;
    let x = items.first()?.as_f64()?;
    let y = items.get(1)?.as_f64()?;
    Some([x, y])
}

fn index_as_f64(index: usize) -> f64 {
    f64::from(u32::try_from(index).unwrap_or(u32::MAX))
}

fn normalize_agents(raw: &Value) -> Vec<AgentState> {
    let Some(rows) = raw.as_array() else {
        return Vec::new();
    };
    rows.iter()
        .enumerate()
        .filter_map(|(index, row)| row.as_object().map(|agent| normalize_agent(index, agent)))
        .collect()
}

fn normalize_agent(index: usize, agent: &Map<String, Value>) -> AgentState {
    let fallback = [index_as_f64(index), 0.0];
    let position = agent.get("position").map_or_else(
        || match (
            agent.get("x").and_then(Value::as_f64),
            agent.get("y").and_then(Value::as_f64),
        ) {
            (Some(x), Some(y)) => [x, y],
            _ => fallback,
        },
        |value| as_pair(value).unwrap_or(fallback),
    );

    let id = match agent.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(other) if !other.is_null() => other.to_string(),
        _ => format!("agent_{index}"),
    };

    let genome_summary = agent
        .get("genome_summary")
        .or_else(|| agent.get("genome"))
        .and_then(Value::as_object)
        .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();

    let attributes = agent
        .iter()
        .filter(|(key, value)| {
            !RESERVED_AGENT_KEYS.contains(&key.as_str())
                && matches!(value, Value::String(_) | Value::Bool(_) | Value::Number(_))
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    AgentState {
        id,
        position,
        velocity: agent.get("velocity").and_then(as_pair),
        genome_summary,
        fitness: agent.get("fitness").and_then(Value::as_f64),
        alive: agent.get("alive").and_then(Value::as_bool).unwrap_or(true),
        attributes,
    }
}

fn normalize_food(raw: Option<&Value>) -> Vec<Value> {
    let Some(rows) = raw.and_then(Value::as_array) else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            let item = row.as_object()?;
            let x = item.get("x")?.as_f64()?;
            let y = item.get("y")?.as_f64()?;
            let mut food = Map::new();
            food.insert("x".to_owned(), Value::from(x));
            food.insert("y".to_owned(), Value::from(y));
            if let Some(count) = item.get("count").and_then(Value::as_f64) {
                food.insert("count".to_owned(), Value::from(count));
            }
            Some(Value::Object(food))
        })
        .collect()
}
