//! Live session control against a real plugin.

#![allow(
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::panic,
    clippy::cast_possible_truncation
)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use evolab_core::{RuntimeConfig, Simulator, SimulatorOptions};
use evolab_live::{ControlState, LiveSession, SessionSettings};
use evolab_plugins::builtin_registry;
use evolab_types::{ExperimentId, SessionEvent, SessionMode};

fn wander_config() -> RuntimeConfig {
    RuntimeConfig::parse(
        "
simulation: wander
params:
  world_size: 12
  num_agents: 4
evolution:
  population_size: 4
  mutation_rate: 0.1
  crossover_rate: 0.5
  elite_fraction: 0.1
  random_seed: 5
logging:
  log_interval: 1
  checkpoint_interval: 0
  experiment_name: session-test
",
    )
    .unwrap()
}

fn session(total_units: u64) -> (LiveSession, Arc<Mutex<Vec<SessionEvent>>>) {
    let registry = builtin_registry().unwrap();
    let simulator = Simulator::new(wander_config(), &registry, SimulatorOptions::default()).unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let session = LiveSession::new(
        ExperimentId::generate("plugin"),
        simulator,
        SessionSettings::new(SessionMode::Plugin, total_units).with_base_delay(Duration::from_millis(2)),
        None,
        Arc::new(move |event: &SessionEvent| sink.lock().unwrap().push(event.clone())),
    );
    (session, events)
}

fn generations(events: &Mutex<Vec<SessionEvent>>) -> Vec<u64> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Generation { generation, .. } => Some(*generation),
            _ => None,
        })
        .collect()
}

#[test]
fn single_step_while_paused_advances_exactly_one_unit() {
    let (session, events) = session(10_000);
    session.start().unwrap();
    thread::sleep(Duration::from_millis(30));
    session.pause();
    thread::sleep(Duration::from_millis(100));

    let before = session.units_completed();
    assert_eq!(generations(&events).len() as u64, before);

    assert!(session.step_once(Duration::from_secs(2)));
    assert_eq!(session.units_completed(), before + 1);
    assert_eq!(session.state(), ControlState::Paused);

    thread::sleep(Duration::from_millis(50));
    let seen = generations(&events);
    assert_eq!(seen.len() as u64, before + 1);
    assert_eq!(*seen.last().unwrap(), before + 1);

    let stepped = events.lock().unwrap().iter().rev().find_map(|event| match event {
        SessionEvent::Generation { render_state, .. } => Some(render_state.is_some()),
        _ => None,
    });
    assert_eq!(stepped, Some(true));

    session.stop();
    assert!(session.join(Duration::from_secs(2)));
    let after_stop = session.units_completed();
    assert!(!session.step_once(Duration::from_millis(100)));
    assert_eq!(session.units_completed(), after_stop);

    let last = events.lock().unwrap().last().cloned().unwrap();
    assert_eq!(
        last,
        SessionEvent::Complete {
            stopped: true,
            total_generations: 10_000
        }
    );
}

#[test]
fn completed_run_emits_every_unit_in_order() {
    let (session, events) = session(15);
    session.start().unwrap();
    assert!(session.join(Duration::from_secs(5)));

    assert_eq!(generations(&events), (1..=15).collect::<Vec<_>>());
    let events = events.lock().unwrap();
    assert!(matches!(events[0], SessionEvent::Started { total_generations: 15 }));
    match &events[15] {
        SessionEvent::Generation {
            metrics, render_state, ..
        } => {
            assert!((metrics["step_count"] - 15.0).abs() < f64::EPSILON);
            assert!(render_state.is_some());
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(
        events.last(),
        Some(&SessionEvent::Complete {
            stopped: false,
            total_generations: 15
        })
    );
}

#[test]
fn second_start_is_rejected() {
    let (session, _events) = session(3);
    session.start().unwrap();
    assert!(session.start().is_err());
    assert!(session.join(Duration::from_secs(5)));
}

#[test]
fn panicking_callback_does_not_kill_worker() {
    let registry = builtin_registry().unwrap();
    let simulator = Simulator::new(wander_config(), &registry, SimulatorOptions::default()).unwrap();
    let session = LiveSession::new(
        ExperimentId::generate("plugin"),
        simulator,
        SessionSettings::new(SessionMode::Plugin, 5).with_base_delay(Duration::from_millis(1)),
        None,
        Arc::new(|event: &SessionEvent| {
            if matches!(event, SessionEvent::Generation { .. }) {
                panic!("consumer failure");
            }
        }),
    );
    session.start().unwrap();
    assert!(session.join(Duration::from_secs(5)));
    assert_eq!(session.units_completed(), 5);
}
