//! Grid-wandering agents.
//!
//! Agents start at random cells of a `world_size x world_size` grid and
//! move by `-1`, `0`, or `+1` on each axis per step, clamped to the grid.
//! Movement draws from the `"movement"` RNG stream.

use rand::Rng;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use evolab_core::{
    PluginContext, PluginError, PluginRegistration, PluginState, RenderContext, RestoreRequest,
    RngHandle, Simulation, StepUnit,
};
use evolab_types::{AgentState, EnvironmentState, MetricRow, RenderState};

/// Registered plugin name.
pub const NAME: &str = "wander";

const MOVES: [f64; 3] = [-1.0, 0.0, 1.0];

/// Parameters accepted by the plugin.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WanderParams {
    /// Grid edge length.
    #[serde(default = "default_world_size")]
    pub world_size: u32,
    /// Number of agents.
    #[serde(default = "default_num_agents")]
    pub num_agents: u32,
}

const fn default_world_size() -> u32 {
    10
}

const fn default_num_agents() -> u32 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Walker {
    id: u32,
    x: f64,
    y: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct GridState {
    world_size: u32,
    step_count: u64,
}

/// Wandering-agents simulation.
#[derive(Debug)]
pub struct Wander {
    rng: RngHandle,
    world_size: u32,
    num_agents: u32,
    step_count: u64,
    agents: Vec<Walker>,
}

impl Wander {
    /// Build the plugin from validated parameters.
    pub fn new(params: &WanderParams, rng: RngHandle) -> Result<Self, PluginError> {
        if params.world_size == 0 {
            return Err(PluginError::Invalid {
                reason: "world_size must be positive".to_owned(),
            });
        }
        Ok(Self {
            rng,
            world_size: params.world_size,
            num_agents: params.num_agents,
            step_count: 0,
            agents: Vec::new(),
        })
    }

    fn max_coord(&self) -> f64 {
        f64::from(self.world_size.saturating_sub(1))
    }
}

impl Simulation for Wander {
    fn reset(&mut self) -> Result<(), PluginError> {
        self.step_count = 0;
        let size = self.world_size;
        let count = self.num_agents;
        self.agents = self.rng.with(|rng| {
            let stream = rng.stream("movement");
            (0..count)
                .map(|id| Walker {
                    id,
                    x: f64::from(stream.random_range(0..size)),
                    y: f64::from(stream.random_range(0..size)),
                })
                .collect()
        });
        Ok(())
    }

    fn step(&mut self) -> Result<(), PluginError> {
        let max = self.max_coord();
        let mut rng = self.rng.lock();
        let stream = rng.stream("movement");
        for agent in &mut self.agents {
            let dx = MOVES.choose(stream).copied().unwrap_or(0.0);
            let dy = MOVES.choose(stream).copied().unwrap_or(0.0);
            agent.x = (agent.x + dx).clamp(0.0, max);
            agent.y = (agent.y + dy).clamp(0.0, max);
        }
        drop(rng);
        self.step_count = self.step_count.saturating_add(1);
        Ok(())
    }

    fn metrics(&self) -> MetricRow {
        let mean_x = if self.agents.is_empty() {
            0.0
        } else {
            let total: f64 = self.agents.iter().map(|a| a.x).sum();
            total / f64::from(u32::try_from(self.agents.len()).unwrap_or(u32::MAX))
        };
        #[allow(clippy::cast_precision_loss)]
        let steps = self.step_count as f64;
        MetricRow::from([
            ("mean_agent_x_position".to_owned(), mean_x),
            ("step_count".to_owned(), steps),
        ])
    }

    fn render_state(&self) -> Value {
        json!({
            "agents": self.agents,
            "world_size": self.world_size,
            "step": self.step_count,
        })
    }

    fn close(&mut self) -> Result<(), PluginError> {
        self.agents.clear();
        Ok(())
    }

    fn export_state(&self) -> Option<Result<PluginState, PluginError>> {
        Some(PluginState::encode(
            &self.agents,
            &GridState {
                world_size: self.world_size,
                step_count: self.step_count,
            },
        ))
    }

    fn import_state(&mut self, request: &RestoreRequest) -> Result<(), PluginError> {
        let agents: Vec<Walker> = request.state.decode_population()?;
        let grid: GridState = request.state.decode_environment()?;
        self.agents = agents;
        self.world_size = grid.world_size;
        self.step_count = request.step_index;
        debug!(
            plugin = NAME,
            step_index = request.step_index,
            agents = self.agents.len(),
            "walkers restored"
        );
        Ok(())
    }

    fn supports_import(&self) -> bool {
        true
    }
}

/// Raw render payload as emitted by [`Wander::render_state`].
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    agents: Vec<Walker>,
    world_size: u32,
}

/// Map the raw payload into a render frame.
pub fn build_render_state(ctx: &RenderContext<'_>) -> RenderState {
    let Ok(raw) = RawFrame::deserialize(ctx.raw) else {
        return RenderState::normalize(
            ctx.raw,
            ctx.generation_index,
            ctx.step_index,
            ctx.metrics.clone(),
            ctx.timestamp,
        );
    };
    let size = f64::from(raw.world_size);
    let mut environment = EnvironmentState {
        bounds: [size, size],
        ..EnvironmentState::default()
    };
    environment
        .metadata
        .insert("simulation".to_owned(), Value::from(NAME));

    RenderState {
        generation_index: ctx.generation_index,
        step_index: ctx.step_index,
        agents: raw
            .agents
            .iter()
            .map(|a| AgentState {
                id: a.id.to_string(),
                position: [a.x, a.y],
                velocity: None,
                genome_summary: std::collections::BTreeMap::new(),
                fitness: None,
                alive: true,
                attributes: std::collections::BTreeMap::new(),
            })
            .collect(),
        environment,
        metrics: ctx.metrics.clone(),
        timestamp: ctx.timestamp,
    }
}

fn build(ctx: PluginContext) -> Result<Box<dyn Simulation>, PluginError> {
    let params: WanderParams = ctx.params()?;
    Ok(Box::new(Wander::new(&params, ctx.rng)?))
}

/// Registry entry for this plugin.
pub fn registration() -> PluginRegistration {
    PluginRegistration {
        name: NAME,
        unit: StepUnit::Step,
        factory: build,
        render_adapter: Some(build_render_state),
    }
}
