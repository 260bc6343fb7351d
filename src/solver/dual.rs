//! Dual-state store: per (peer, shared-parameter) consensus variables.
//!
//! For every remote parameter referenced locally, the store keeps this
//! agent's running `local_dual` and the most recent `remote_dual` received
//! from the owning peer. `remote_dual` is written only by the coordinator
//! from received messages; `local_dual` only by the ARock update step.

use std::collections::BTreeMap;

use nalgebra::DVector;

use crate::solver::params::ParamKey;
use crate::state::DroneId;

/// The two consensus variables kept per (peer, parameter).
#[derive(Debug, Clone)]
pub struct DualPair {
    pub local: DVector<f64>,
    pub remote: DVector<f64>,
}

/// Flat mapping keyed by (peer, parameter identity).
#[derive(Debug, Default)]
pub struct DualStateStore {
    entries: BTreeMap<(DroneId, ParamKey), DualPair>,
}

impl DualStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent create: both duals start from `initial` (the current primal
    /// or a buffered remote value). Returns true when the entry was created.
    pub fn ensure(&mut self, peer: DroneId, key: ParamKey, initial: &[f64]) -> bool {
        if self.entries.contains_key(&(peer, key)) {
            return false;
        }
        let v = DVector::from_column_slice(initial);
        self.entries.insert(
            (peer, key),
            DualPair {
                local: v.clone(),
                remote: v,
            },
        );
        true
    }

    pub fn contains(&self, peer: DroneId, key: ParamKey) -> bool {
        self.entries.contains_key(&(peer, key))
    }

    /// Overwrite the received side from a peer broadcast. Returns false when
    /// no dual exists for this pair (the value should then be retained by the
    /// caller for a later scan).
    pub fn set_remote(&mut self, peer: DroneId, key: ParamKey, value: &[f64]) -> bool {
        match self.entries.get_mut(&(peer, key)) {
            Some(pair) => {
                pair.remote = DVector::from_column_slice(value);
                true
            }
            None => false,
        }
    }

    pub fn get_local(&self, peer: DroneId, key: ParamKey) -> Option<&DVector<f64>> {
        self.entries.get(&(peer, key)).map(|p| &p.local)
    }

    pub fn get_remote(&self, peer: DroneId, key: ParamKey) -> Option<&DVector<f64>> {
        self.entries.get(&(peer, key)).map(|p| &p.remote)
    }

    /// Iterate over every (peer, parameter, duals) entry in key order.
    pub fn pairs(&self) -> impl Iterator<Item = (DroneId, ParamKey, &DualPair)> {
        self.entries.iter().map(|(&(peer, key), pair)| (peer, key, pair))
    }

    /// Mutable iteration for the ARock update step.
    pub fn pairs_mut(&mut self) -> impl Iterator<Item = (DroneId, ParamKey, &mut DualPair)> {
        self.entries
            .iter_mut()
            .map(|(&(peer, key), pair)| (peer, key, pair))
    }

    /// Drop entries whose parameter is no longer referenced; duals live only
    /// while the parameter is remote and active.
    pub fn retain(&mut self, mut alive: impl FnMut(DroneId, ParamKey) -> bool) {
        self.entries.retain(|&(peer, key), _| alive(peer, key));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_is_idempotent_and_initializes_both_sides() {
        let mut store = DualStateStore::new();
        let key = ParamKey::FramePose(3);
        assert!(store.ensure(2, key, &[1.0, 2.0]));
        assert!(!store.ensure(2, key, &[9.0, 9.0]));
        assert_eq!(store.get_local(2, key).unwrap().as_slice(), &[1.0, 2.0]);
        assert_eq!(store.get_remote(2, key).unwrap().as_slice(), &[1.0, 2.0]);
    }

    #[test]
    fn set_remote_requires_existing_entry() {
        let mut store = DualStateStore::new();
        let key = ParamKey::FramePose(3);
        assert!(!store.set_remote(2, key, &[5.0]));
        store.ensure(2, key, &[0.0]);
        assert!(store.set_remote(2, key, &[5.0]));
        assert_eq!(store.get_remote(2, key).unwrap()[0], 5.0);
        // The local side is untouched by reception.
        assert_eq!(store.get_local(2, key).unwrap()[0], 0.0);
    }

    #[test]
    fn retain_drops_dead_entries() {
        let mut store = DualStateStore::new();
        store.ensure(2, ParamKey::FramePose(1), &[0.0]);
        store.ensure(3, ParamKey::FramePose(2), &[0.0]);
        store.retain(|peer, _| peer == 2);
        assert_eq!(store.len(), 1);
        assert!(store.contains(2, ParamKey::FramePose(1)));
    }
}
