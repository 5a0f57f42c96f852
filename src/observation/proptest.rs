//! Property-Based Tests for the Observation Registry
//!
//! Drives random sequences of create / remove / destroy operations against
//! an isolated registry and checks after every step:
//!
//! 1. **Consistency**: an observation is in the registry iff it is registered
//! 2. **Liveness**: a registered auto-removing observation has live anchors
//! 3. **Index agreement**: observer and object indexes list the same set
//! 4. **Idempotence**: removing twice detaches the primitive once

#![cfg(test)]

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use proptest::prelude::*;

use super::testing::{manual, ManualKind, Probe};
use super::{Observation, Registry};
use crate::domain::lifeline::Lifecycle;

const POOL: usize = 4;

#[derive(Debug, Clone)]
enum Op {
    /// observer slot, object slot (None = absent)
    Create(Option<usize>, Option<usize>),
    Remove(usize),
    Destroy(usize),
}

// =============================================================================
// Property Strategies
// =============================================================================

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (prop::option::of(0..POOL), prop::option::of(0..POOL)).prop_map(|(o, t)| Op::Create(o, t)),
        2 => (0usize..32).prop_map(Op::Remove),
        1 => (0..POOL).prop_map(Op::Destroy),
    ]
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(op_strategy(), 1..40)
}

// =============================================================================
// Model
// =============================================================================

struct World {
    registry: Arc<Registry>,
    participants: Vec<Option<Arc<Probe>>>,
    observations: Vec<Arc<Observation<ManualKind>>>,
}

impl World {
    fn new() -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            participants: (0..POOL).map(|_| Some(Arc::new(Probe::default()))).collect(),
            observations: Vec::new(),
        }
    }

    fn apply(&mut self, op: &Op) {
        match op {
            Op::Create(observer, object) => {
                let mut builder = manual().registry(self.registry.clone()).callback(|_| {});
                if let Some(p) = observer.and_then(|i| self.participants[i].clone()) {
                    builder = builder.observer(&p);
                }
                if let Some(p) = object.and_then(|i| self.participants[i].clone()) {
                    builder = builder.object(&p);
                }
                // both absent (or both destroyed) is rejected
                if let Ok(observation) = builder.build() {
                    self.observations.push(observation);
                }
            }
            Op::Remove(i) => {
                if let Some(observation) = self.observations.get(*i) {
                    observation.remove();
                }
            }
            Op::Destroy(i) => {
                self.participants[*i] = None;
            }
        }
    }

    fn check(&self) -> Result<(), TestCaseError> {
        for observation in &self.observations {
            prop_assert_eq!(observation.is_registered(), self.registry.contains(observation.id()));
            if observation.is_registered() {
                prop_assert!(observation.observer().map_or(true, |a| a.is_alive()));
                prop_assert!(observation.object().map_or(true, |a| a.is_alive()));
                prop_assert!(observation.kind().attached.load(Ordering::SeqCst));
            } else {
                prop_assert!(observation.kind().detach_count.load(Ordering::SeqCst) <= 1);
            }
        }

        let live: HashSet<_> = self
            .observations
            .iter()
            .filter(|o| o.is_registered())
            .map(|o| o.id())
            .collect();
        prop_assert_eq!(self.registry.len(), live.len());

        let mut indexed = HashSet::new();
        for participant in self.participants.iter().flatten() {
            let id = participant.object_id();
            indexed.extend(self.registry.all_for_observer(id).iter().map(|e| e.id()));
            indexed.extend(self.registry.all_for_object(id).iter().map(|e| e.id()));
        }
        prop_assert_eq!(indexed, live);
        Ok(())
    }
}

// =============================================================================
// Registry Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: registry membership, flags and anchors agree after every step.
    #[test]
    fn prop_registry_consistent(ops in ops_strategy()) {
        let mut world = World::new();
        for op in &ops {
            world.apply(op);
            world.check()?;
        }
    }

    /// Property: destroying every participant empties the registry.
    #[test]
    fn prop_destroying_everyone_empties_registry(ops in ops_strategy()) {
        let mut world = World::new();
        for op in &ops {
            world.apply(op);
        }
        for i in 0..POOL {
            world.apply(&Op::Destroy(i));
        }
        prop_assert!(world.registry.is_empty());
        prop_assert!(world.observations.iter().all(|o| !o.is_registered()));
    }

    /// Property: repeated removal detaches the primitive exactly once.
    #[test]
    fn prop_remove_is_idempotent(times in 1usize..5) {
        let world = World::new();
        let object = world.participants[0].clone().unwrap();
        let observation = manual()
            .object(&object)
            .registry(world.registry.clone())
            .callback(|_| {})
            .build()?;
        for _ in 0..times {
            observation.remove();
        }
        prop_assert_eq!(observation.kind().detach_count.load(Ordering::SeqCst), 1);
        prop_assert!(world.registry.is_empty());
    }
}
