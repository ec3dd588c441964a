use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::task::Actor;

/// Causal ordering of two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrder {
    Before,
    After,
    Equal,
    Concurrent,
}

/// Per-actor monotonic clock. Keys are writer classes, values are the last
/// sequence observed from that writer. Missing actors count as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<Actor, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, actor: Actor) -> u64 {
        self.0.get(&actor).copied().unwrap_or(0)
    }

    pub fn set(&mut self, actor: Actor, seq: u64) {
        self.0.insert(actor, seq);
    }

    /// Bump this client's component by one and return the new value.
    pub fn increment(&mut self, actor: Actor) -> u64 {
        let next = self.get(actor) + 1;
        self.0.insert(actor, next);
        next
    }

    /// Componentwise maximum. Applied on every accepted remote event so the
    /// local clock never regresses.
    pub fn merge(&mut self, other: &VectorClock) {
        for (actor, seq) in &other.0 {
            let entry = self.0.entry(*actor).or_insert(0);
            if *seq > *entry {
                *entry = *seq;
            }
        }
    }

    /// Compare two clocks over the union of their actors.
    pub fn compare(&self, other: &VectorClock) -> ClockOrder {
        let mut less = false;
        let mut greater = false;

        let actors: std::collections::BTreeSet<Actor> =
            self.0.keys().chain(other.0.keys()).copied().collect();

        for actor in actors {
            let a = self.get(actor);
            let b = other.get(actor);
            if a < b {
                less = true;
            }
            if a > b {
                greater = true;
            }
        }

        match (less, greater) {
            (false, false) => ClockOrder::Equal,
            (true, false) => ClockOrder::Before,
            (false, true) => ClockOrder::After,
            (true, true) => ClockOrder::Concurrent,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Actor, &u64)> {
        self.0.iter()
    }
}

impl FromIterator<(Actor, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (Actor, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_componentwise_max() {
        let mut a: VectorClock = [(Actor::User, 3), (Actor::Server, 1)].into_iter().collect();
        let b: VectorClock = [(Actor::User, 2), (Actor::Server, 4)].into_iter().collect();
        a.merge(&b);
        assert_eq!(a.get(Actor::User), 3);
        assert_eq!(a.get(Actor::Server), 4);
    }

    #[test]
    fn compare_detects_concurrency() {
        let a: VectorClock = [(Actor::User, 3)].into_iter().collect();
        let b: VectorClock = [(Actor::User, 2), (Actor::Server, 4)].into_iter().collect();
        assert_eq!(a.compare(&b), ClockOrder::Concurrent);

        let c: VectorClock = [(Actor::User, 3), (Actor::Server, 4)].into_iter().collect();
        assert_eq!(a.compare(&c), ClockOrder::Before);
        assert_eq!(c.compare(&a), ClockOrder::After);
        assert_eq!(c.compare(&c.clone()), ClockOrder::Equal);
    }
}
