//! Sync & transport coordination: round negotiation, broadcast of local
//! state, and reception of peer state into the dual store.
//!
//! One agent is the *main* agent — the lowest id among the currently
//! participating drones, re-evaluated whenever the participant set changes —
//! and is the only one that emits START. Everyone else idles, emitting READY
//! periodically, until a START (or a NON_DIST from the main) arrives.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use crossbeam_channel::Receiver;
use tracing::{debug, warn};

use crate::solver::dual::DualStateStore;
use crate::solver::params::{ParamKey, ParameterRegistry};
use crate::state::DroneId;
use crate::sync::message::{encode_message, SolverStateMsg, SyncSignal};
use crate::sync::transport::{Incoming, Transport};

/// Upper bound on values retained for not-yet-registered parameters.
const MAX_RETAINED: usize = 1024;

/// Interval between READY emissions while idle.
const READY_POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Outcome of round negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStart {
    /// Round negotiated; solve with this token.
    Go(u64),
    /// No quorum within the wait budget; solve locally and still publish.
    Timeout,
}

pub struct SyncCoordinator {
    self_id: DroneId,
    transport: Box<dyn Transport>,
    inbox: Receiver<Incoming>,

    /// Drones currently taking part in consensus, self included.
    participants: BTreeSet<DroneId>,

    /// Monotonically non-decreasing consensus round token.
    token: u64,
    /// Peers (and self) that signalled readiness for the next round.
    ready_peers: BTreeSet<DroneId>,
    ready_to_start: bool,
    /// Sender of the START (or fast-forward) that opened the current round.
    round_leader: Option<DroneId>,

    /// Last (token, iteration) per sender, for duplicate suppression.
    seen: HashMap<DroneId, (u64, u64)>,
    /// Values for parameters not yet registered locally, kept until the next
    /// registry scan.
    retained: HashMap<(DroneId, ParamKey), Vec<f64>>,
    /// Parsed data payloads awaiting application to the dual store.
    pending_data: VecDeque<SolverStateMsg>,

    stale_dropped: u64,
}

impl SyncCoordinator {
    pub fn new(self_id: DroneId, transport: Box<dyn Transport>, inbox: Receiver<Incoming>) -> Self {
        let mut participants = BTreeSet::new();
        participants.insert(self_id);
        Self {
            self_id,
            transport,
            inbox,
            participants,
            token: 0,
            ready_peers: BTreeSet::new(),
            ready_to_start: false,
            round_leader: None,
            seen: HashMap::new(),
            retained: HashMap::new(),
            pending_data: VecDeque::new(),
            stale_dropped: 0,
        }
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    /// Count of messages dropped for carrying a stale token.
    pub fn stale_dropped(&self) -> u64 {
        self.stale_dropped
    }

    pub fn round_leader(&self) -> Option<DroneId> {
        self.round_leader
    }

    /// Refresh the participant set; always contains self.
    pub fn set_participants(&mut self, mut participants: BTreeSet<DroneId>) {
        participants.insert(self.self_id);
        self.participants = participants;
    }

    /// Id of the current main agent: lowest participating id.
    pub fn main_id(&self) -> DroneId {
        *self.participants.iter().next().expect("self always present")
    }

    pub fn is_main(&self) -> bool {
        self.main_id() == self.self_id
    }

    /// Drain the inbox, updating negotiation state and queueing data
    /// payloads. Signals and data with stale tokens are dropped and counted.
    pub fn drain_inbox(&mut self) {
        while let Ok(incoming) = self.inbox.try_recv() {
            match incoming {
                Incoming::Signal {
                    from,
                    signal,
                    token,
                } => self.on_signal(from, signal, token),
                Incoming::Data(msg) => self.on_data(msg),
            }
        }
    }

    fn on_signal(&mut self, from: DroneId, signal: SyncSignal, token: u64) {
        if token < self.token {
            self.stale_dropped += 1;
            return;
        }
        match signal {
            SyncSignal::Ready => {
                self.ready_peers.insert(from);
                // A peer already at a later round fast-forwards us.
                self.token = self.token.max(token);
            }
            SyncSignal::Start => {
                self.token = token;
                self.ready_to_start = true;
                self.round_leader = Some(from);
                debug!(self_id = self.self_id, from, token, "start signal received");
            }
            SyncSignal::NonDist => {
                // Opting out still counts as ready; an opt-out from the main
                // agent releases everyone else.
                self.ready_peers.insert(from);
                if from == self.main_id() && from != self.self_id {
                    self.token = token;
                    self.ready_to_start = true;
                    self.round_leader = Some(from);
                }
            }
        }
    }

    fn on_data(&mut self, msg: SolverStateMsg) {
        if msg.solver_token < self.token {
            self.stale_dropped += 1;
            return;
        }
        if let Some(&(tok, iter)) = self.seen.get(&msg.drone_id) {
            if tok == msg.solver_token && iter == msg.iteration_count {
                // Duplicate broadcast, silently ignored.
                return;
            }
        }
        self.seen
            .insert(msg.drone_id, (msg.solver_token, msg.iteration_count));
        // Greater tokens fast-forward the receiver.
        if msg.solver_token > self.token {
            self.token = msg.solver_token;
            self.round_leader = Some(msg.drone_id);
        }
        self.pending_data.push_back(msg);
    }

    /// True once this agent may enter the solving state.
    pub fn ready_for_start(&self) -> bool {
        if self.participants.len() <= 1 {
            return true;
        }
        if self.ready_to_start {
            return true;
        }
        self.is_main() && self.ready_peers.is_superset(&self.participants)
    }

    /// Negotiate the next round: emit READY until every participant is ready
    /// (main) or a START arrives (everyone else). `max_polls` bounds the
    /// wait; on timeout the round degrades to a local solve.
    pub fn negotiate_round(&mut self, max_polls: usize) -> RoundStart {
        self.ready_peers.clear();
        self.ready_peers.insert(self.self_id);

        let mut polls = 0;
        loop {
            self.drain_inbox();
            if self.ready_for_start() {
                break;
            }
            if polls >= max_polls {
                warn!(
                    self_id = self.self_id,
                    token = self.token,
                    "participant timeout during round negotiation"
                );
                return RoundStart::Timeout;
            }
            if let Err(e) = self.transport.send_signal(SyncSignal::Ready, self.token) {
                warn!(self_id = self.self_id, error = %e, "ready signal send failed");
            }
            std::thread::sleep(READY_POLL_INTERVAL);
            polls += 1;
        }

        if self.is_main() {
            self.token += 1;
            if let Err(e) = self.transport.send_signal(SyncSignal::Start, self.token) {
                warn!(self_id = self.self_id, error = %e, "start signal send failed");
            }
        }
        self.ready_to_start = false;
        RoundStart::Go(self.token)
    }

    /// Announce that this agent solves locally this round (no cross-agent
    /// coupling).
    pub fn announce_non_dist(&mut self) {
        if let Err(e) = self.transport.send_signal(SyncSignal::NonDist, self.token) {
            warn!(self_id = self.self_id, error = %e, "non-dist signal send failed");
        }
    }

    /// Apply every pending data payload to the dual store: most-recent wins
    /// per (sender, parameter); values for unknown parameters are retained
    /// for the next scan. Returns true when anything new arrived.
    pub fn receive_all(
        &mut self,
        registry: &ParameterRegistry,
        duals: &mut DualStateStore,
    ) -> bool {
        self.drain_inbox();
        let mut updated = false;
        while let Some(msg) = self.pending_data.pop_front() {
            if msg.solver_token < self.token {
                self.stale_dropped += 1;
                continue;
            }
            let sender = msg.drone_id;
            let frames = msg
                .frame_ids
                .iter()
                .zip(msg.frame_poses.iter())
                .map(|(id, pose)| (ParamKey::FramePose(*id), pose.as_slice()));
            let extrinsics = msg
                .cam_ids
                .iter()
                .zip(msg.extrinsics.iter())
                .map(|(id, pose)| (ParamKey::Extrinsic(*id), pose.as_slice()));
            let coords = msg
                .remote_drone_ids
                .iter()
                .zip(msg.relative_coordinates.iter())
                .map(|(id, v)| (ParamKey::RelativeCoord(*id), v.as_slice()));
            for (key, value) in frames.chain(extrinsics).chain(coords) {
                updated |= self.apply_value(sender, key, value, registry, duals);
            }
        }
        updated
    }

    fn apply_value(
        &mut self,
        sender: DroneId,
        key: ParamKey,
        value: &[f64],
        registry: &ParameterRegistry,
        duals: &mut DualStateStore,
    ) -> bool {
        match registry.info(key) {
            Some(info) => {
                if info.owner != Some(sender) || sender == self.self_id {
                    // Not the authoritative owner (or our own parameter
                    // echoed back): nothing to consume.
                    return false;
                }
                if duals.set_remote(sender, key, value) {
                    true
                } else {
                    // Known remote parameter without a dual yet; keep the
                    // value so the next scan initializes the dual from it.
                    self.retain(sender, key, value)
                }
            }
            None => self.retain(sender, key, value),
        }
    }

    fn retain(&mut self, sender: DroneId, key: ParamKey, value: &[f64]) -> bool {
        if self.retained.len() >= MAX_RETAINED && !self.retained.contains_key(&(sender, key)) {
            warn!(
                self_id = self.self_id,
                "retained-value buffer full, dropping {key:?} from {sender}"
            );
            return false;
        }
        self.retained.insert((sender, key), value.to_vec());
        true
    }

    /// Take the retained value for (peer, parameter), if any; consumed by the
    /// dual-state scan.
    pub fn take_buffered(&mut self, peer: DroneId, key: ParamKey) -> Option<Vec<f64>> {
        self.retained.remove(&(peer, key))
    }

    /// Encode and broadcast this round's solver state; send failures are
    /// logged and the round continues.
    pub fn broadcast_state(&mut self, msg: &SolverStateMsg) {
        match encode_message(msg) {
            Ok(bytes) => {
                if let Err(e) = self.transport.send_data(&bytes) {
                    warn!(self_id = self.self_id, error = %e, "state broadcast failed");
                }
            }
            Err(e) => warn!(self_id = self.self_id, error = %e, "state encode failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::params::{ParamInfo, ParamKind};
    use crate::sync::transport::MemoryBus;

    fn registry_with_remote_pose(self_id: DroneId, frame: u64, owner: DroneId) -> ParameterRegistry {
        let mut reg = ParameterRegistry::new(self_id);
        reg.register(
            ParamInfo {
                key: ParamKey::FramePose(frame),
                kind: ParamKind::Se3Pose,
                owner: Some(owner),
            },
            &[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0],
        );
        reg
    }

    fn coordinator(bus: &MemoryBus, id: DroneId) -> SyncCoordinator {
        let (endpoint, rx) = bus.join(id);
        SyncCoordinator::new(id, Box::new(endpoint), rx)
    }

    fn data_msg(from: DroneId, token: u64, iter: u64, frame: u64, x: f64) -> SolverStateMsg {
        let mut msg = SolverStateMsg::new(from, token, iter, 0.0);
        msg.frame_ids.push(frame);
        msg.frame_poses.push([x, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
        msg
    }

    #[test]
    fn stale_message_is_dropped_and_counted() {
        let bus = MemoryBus::new();
        let mut coord = coordinator(&bus, 1);
        coord.token = 7;

        let reg = registry_with_remote_pose(1, 10, 2);
        let mut duals = DualStateStore::new();
        duals.ensure(2, ParamKey::FramePose(10), &[0.0; 7]);

        coord.on_data(data_msg(2, 5, 0, 10, 9.0));
        let updated = coord.receive_all(&reg, &mut duals);

        assert!(!updated);
        assert_eq!(coord.stale_dropped(), 1);
        assert_eq!(coord.token(), 7);
        assert_eq!(duals.get_remote(2, ParamKey::FramePose(10)).unwrap()[0], 0.0);
    }

    #[test]
    fn token_never_decreases_and_fast_forwards() {
        let bus = MemoryBus::new();
        let mut coord = coordinator(&bus, 2);
        coord.on_signal(1, SyncSignal::Start, 4);
        assert_eq!(coord.token(), 4);
        assert_eq!(coord.round_leader(), Some(1));

        // Data from a later round fast-forwards too.
        coord.on_data(data_msg(3, 9, 0, 10, 1.0));
        assert_eq!(coord.token(), 9);
        assert_eq!(coord.round_leader(), Some(3));

        // Stale signal has no effect.
        coord.on_signal(1, SyncSignal::Start, 3);
        assert_eq!(coord.token(), 9);
        assert_eq!(coord.stale_dropped(), 1);
    }

    #[test]
    fn duplicate_broadcast_is_ignored() {
        let bus = MemoryBus::new();
        let mut coord = coordinator(&bus, 1);
        let reg = registry_with_remote_pose(1, 10, 2);
        let mut duals = DualStateStore::new();
        duals.ensure(2, ParamKey::FramePose(10), &[0.0; 7]);

        coord.on_data(data_msg(2, 0, 3, 10, 1.0));
        coord.on_data(data_msg(2, 0, 3, 10, 2.0));
        assert_eq!(coord.pending_data.len(), 1);
        coord.receive_all(&reg, &mut duals);
        assert_eq!(duals.get_remote(2, ParamKey::FramePose(10)).unwrap()[0], 1.0);
    }

    #[test]
    fn most_recent_wins_within_a_token() {
        let bus = MemoryBus::new();
        let mut coord = coordinator(&bus, 1);
        let reg = registry_with_remote_pose(1, 10, 2);
        let mut duals = DualStateStore::new();
        duals.ensure(2, ParamKey::FramePose(10), &[0.0; 7]);

        coord.on_data(data_msg(2, 3, 0, 10, 1.0));
        coord.on_data(data_msg(2, 3, 1, 10, 2.0));
        coord.receive_all(&reg, &mut duals);
        assert_eq!(duals.get_remote(2, ParamKey::FramePose(10)).unwrap()[0], 2.0);
    }

    #[test]
    fn unknown_parameter_is_retained_until_scanned() {
        let bus = MemoryBus::new();
        let mut coord = coordinator(&bus, 1);
        let reg = ParameterRegistry::new(1);
        let mut duals = DualStateStore::new();

        coord.on_data(data_msg(2, 0, 0, 77, 5.0));
        let updated = coord.receive_all(&reg, &mut duals);
        assert!(updated);
        assert!(duals.is_empty());

        let buffered = coord.take_buffered(2, ParamKey::FramePose(77)).unwrap();
        assert_eq!(buffered[0], 5.0);
        assert!(coord.take_buffered(2, ParamKey::FramePose(77)).is_none());
    }

    #[test]
    fn main_is_lowest_participating_id() {
        let bus = MemoryBus::new();
        let mut coord = coordinator(&bus, 2);
        coord.set_participants([2, 3].into_iter().collect());
        assert!(coord.is_main());
        coord.set_participants([1, 2, 3].into_iter().collect());
        assert!(!coord.is_main());
        assert_eq!(coord.main_id(), 1);
    }

    #[test]
    fn single_participant_is_ready_immediately() {
        let bus = MemoryBus::new();
        let coord = coordinator(&bus, 5);
        assert!(coord.ready_for_start());
    }

    #[test]
    fn negotiation_times_out_without_quorum() {
        let bus = MemoryBus::new();
        let mut coord = coordinator(&bus, 1);
        coord.set_participants([1, 2].into_iter().collect());
        assert_eq!(coord.negotiate_round(3), RoundStart::Timeout);
    }

    #[test]
    fn non_dist_from_main_releases_the_round() {
        let bus = MemoryBus::new();
        let mut coord = coordinator(&bus, 2);
        coord.set_participants([1, 2].into_iter().collect());
        assert!(!coord.ready_for_start());
        coord.on_signal(1, SyncSignal::NonDist, 3);
        assert!(coord.ready_for_start());
        assert_eq!(coord.token(), 3);
    }

    #[test]
    fn main_election_three_agents() {
        // Scenario: ids {1,2,3}; only id 1 (the lowest) emits START; 2 and 3
        // leave idle only once a START with a newer token arrives. All three
        // negotiate concurrently, emitting READY while they wait.
        let bus = MemoryBus::new();
        let participants: BTreeSet<DroneId> = [1, 2, 3].into_iter().collect();

        let handles: Vec<_> = [1u32, 2, 3]
            .into_iter()
            .map(|id| {
                let mut coord = coordinator(&bus, id);
                coord.set_participants(participants.clone());
                std::thread::spawn(move || {
                    assert_eq!(coord.is_main(), id == 1);
                    let start = coord.negotiate_round(100_000);
                    (id, start, coord.token(), coord.round_leader())
                })
            })
            .collect();

        for handle in handles {
            let (id, start, token, leader) = handle.join().unwrap();
            assert_eq!(start, RoundStart::Go(1), "agent {id}");
            assert_eq!(token, 1, "agent {id}");
            if id != 1 {
                // Non-main agents were released by id 1's START.
                assert_eq!(leader, Some(1), "agent {id}");
            }
        }
    }
}
