//! Two-action dummy environment with random agents and identity evolution.
//!
//! Each generation every agent picks action `0` or `1` uniformly at random;
//! action `1` earns reward `1.0`, anything else `0.0`. Fitness is the
//! reward. The evolution step keeps the population unchanged, so genomes
//! are fixed after reset and `mutation_stats` stays at zero.
//!
//! Genomes draw from the `"genomes"` stream, actions from `"actions"`.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use evolab_core::{
    EvolutionConfig, PluginContext, PluginError, PluginRegistration, PluginState, RestoreRequest,
    RngHandle, Simulation, StepUnit,
};
use evolab_types::MetricRow;

/// Registered plugin name.
pub const NAME: &str = "dummy_evolution";

/// Parameters accepted by the plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DummyParams {
    /// Population size; defaults to `evolution.population_size`.
    #[serde(default)]
    pub num_agents: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Individual {
    id: String,
    genome: f64,
    fitness: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DummyWorld {
    generation: u64,
}

/// Dummy generation-based simulation.
#[derive(Debug)]
pub struct DummyEvolution {
    rng: RngHandle,
    num_agents: u32,
    generation: u64,
    population: Vec<Individual>,
}

impl DummyEvolution {
    /// Build the plugin.
    pub fn new(params: &DummyParams, evolution: &EvolutionConfig, rng: RngHandle) -> Self {
        Self {
            rng,
            num_agents: params.num_agents.unwrap_or(evolution.population_size),
            generation: 0,
            population: Vec::new(),
        }
    }

    fn fitnesses(&self) -> impl Iterator<Item = f64> + '_ {
        self.population.iter().map(|i| i.fitness)
    }

    /// Mean pairwise genome distance.
    fn diversity(&self) -> f64 {
        let mut total = 0.0;
        let mut pairs = 0_u32;
        for (i, a) in self.population.iter().enumerate() {
            for b in self.population.iter().skip(i.saturating_add(1)) {
                total += (a.genome - b.genome).abs();
                pairs = pairs.saturating_add(1);
            }
        }
        if pairs == 0 {
            0.0
        } else {
            total / f64::from(pairs)
        }
    }
}

impl Simulation for DummyEvolution {
    fn reset(&mut self) -> Result<(), PluginError> {
        self.generation = 0;
        let count = self.num_agents;
        self.population = self.rng.with(|rng| {
            let stream = rng.stream("genomes");
            (0..count)
                .map(|index| Individual {
                    id: format!("agent_{index}"),
                    genome: stream.random(),
                    fitness: 0.0,
                })
                .collect()
        });
        Ok(())
    }

    fn step(&mut self) -> Result<(), PluginError> {
        let mut rng = self.rng.lock();
        let actions = rng.stream("actions");
        for individual in &mut self.population {
            let action: u8 = actions.random_range(0..=1);
            individual.fitness = if action == 1 { 1.0 } else { 0.0 };
        }
        drop(rng);
        self.generation = self.generation.saturating_add(1);
        Ok(())
    }

    fn metrics(&self) -> MetricRow {
        let count = u32::try_from(self.population.len()).unwrap_or(u32::MAX);
        let (mean, max) = if count == 0 {
            (0.0, 0.0)
        } else {
            let total: f64 = self.fitnesses().sum();
            let max = self.fitnesses().fold(f64::MIN, f64::max);
            (total / f64::from(count), max)
        };
        #[allow(clippy::cast_precision_loss)]
        let generation = self.generation as f64;
        MetricRow::from([
            ("mean_fitness".to_owned(), mean),
            ("max_fitness".to_owned(), max),
            ("diversity".to_owned(), self.diversity()),
            ("mutation_stats".to_owned(), 0.0),
            ("generation".to_owned(), generation),
        ])
    }

    fn render_state(&self) -> Value {
        let agents: Vec<Value> = self
            .population
            .iter()
            .enumerate()
            .map(|(index, individual)| {
                json!({
                    "id": individual.id,
                    "x": index,
                    "y": individual.fitness,
                    "fitness": individual.fitness,
                    "genome_summary": {"value": individual.genome},
                })
            })
            .collect();
        json!({
            "agents": agents,
            "environment": {"bounds": [self.num_agents.max(1), 1]},
            "simulation": NAME,
        })
    }

    fn close(&mut self) -> Result<(), PluginError> {
        self.population.clear();
        Ok(())
    }

    fn export_state(&self) -> Option<Result<PluginState, PluginError>> {
        Some(PluginState::encode(
            &self.population,
            &DummyWorld {
                generation: self.generation,
            },
        ))
    }

    fn import_state(&mut self, request: &RestoreRequest) -> Result<(), PluginError> {
        let population: Vec<Individual> = request.state.decode_population()?;
        let world: DummyWorld = request.state.decode_environment()?;
        self.population = population;
        self.generation = world.generation;
        debug!(
            plugin = NAME,
            generation = self.generation,
            population = self.population.len(),
            "population restored"
        );
        Ok(())
    }

    fn supports_import(&self) -> bool {
        true
    }
}

fn build(ctx: PluginContext) -> Result<Box<dyn Simulation>, PluginError> {
    let params: DummyParams = ctx.params()?;
    Ok(Box::new(DummyEvolution::new(&params, &ctx.evolution, ctx.rng)))
}

/// Registry entry for this plugin.
pub fn registration() -> PluginRegistration {
    PluginRegistration {
        name: NAME,
        unit: StepUnit::Generation,
        factory: build,
        render_adapter: None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn evolution(population_size: u32) -> EvolutionConfig {
        EvolutionConfig {
            population_size,
            mutation_rate: 0.0,
            crossover_rate: 0.0,
            elite_fraction: 0.0,
            random_seed: 123,
        }
    }

    fn run(seed: u64, generations: usize) -> Vec<f64> {
        let mut sim = DummyEvolution::new(&DummyParams::default(), &evolution(2), RngHandle::new(seed));
        sim.reset().unwrap();
        (0..generations)
            .map(|_| {
                sim.step().unwrap();
                sim.metrics()["mean_fitness"]
            })
            .collect()
    }

    #[test]
    fn fitness_is_binary_reward() {
        for value in run(123, 20) {
            assert!([0.0, 0.5, 1.0].contains(&value));
        }
    }

    #[test]
    fn same_seed_same_fitness_sequence() {
        assert_eq!(run(123, 5), run(123, 5));
    }

    #[test]
    fn population_size_follows_evolution_section() {
        let mut sim = DummyEvolution::new(&DummyParams::default(), &evolution(4), RngHandle::new(0));
        sim.reset().unwrap();
        assert_eq!(sim.population.len(), 4);

        let params = DummyParams { num_agents: Some(2) };
        let mut sim = DummyEvolution::new(&params, &evolution(4), RngHandle::new(0));
        sim.reset().unwrap();
        assert_eq!(sim.population.len(), 2);
    }

    #[test]
    fn identity_evolution_keeps_genomes() {
        let mut sim = DummyEvolution::new(&DummyParams::default(), &evolution(3), RngHandle::new(8));
        sim.reset().unwrap();
        let genomes: Vec<f64> = sim.population.iter().map(|i| i.genome).collect();
        let diversity = sim.diversity();
        for _ in 0..5 {
            sim.step().unwrap();
        }
        let after: Vec<f64> = sim.population.iter().map(|i| i.genome).collect();
        assert_eq!(genomes, after);
        assert_eq!(sim.diversity(), diversity);
    }
}
