//! # Local Cluster
//!
//! Several complete nodes in one thread: one host and its guests, each with
//! its own [`Session`] on a shared [`MemoryNetwork`], all reading one
//! [`ManualClock`].
//!
//! Every round polls each node once (handshake or lockstep frame) and then
//! advances the clock by a fixed step, so a run is reproducible from its
//! seed.

use tracing::{debug, info};

use crate::config::{NetConfig, TopologyMode};
use crate::error::NetResult;
use crate::handshake::{Handshake, HandshakePoll};
use crate::integration::{Clock, DeterministicSim, ManualClock, ScriptedProgress, Simulation};
use crate::protocol::NO_SUCCESSOR;
use crate::session::{PlayerSet, Session};
use crate::sync::{FrameReport, SyncEngine};
use crate::transport::{MemoryNetwork, MemoryStats, TransportStats};
use crate::EXIT_REPEAT;

use super::NetworkConditions;

/// Configuration for a local cluster.
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// Nodes, host included.
    pub nodes: u8,
    /// Loss model of the shared network.
    pub conditions: NetworkConditions,
    /// Seed for the loss model and the game parameters.
    pub seed: u64,
    /// Simulation ticks per second.
    pub tick_rate: u32,
    /// Requested topology.
    pub topology: TopologyMode,
    /// Simulation ticks per network tick.
    pub ticdup: u8,
    /// Clock advance per round.
    pub step_ms: u64,
    /// Stall timeout handed to every node.
    pub stall_timeout_ms: u64,
    /// Rounds between net events pushed by each node; 0 for none.
    pub event_interval: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: 2,
            conditions: NetworkConditions::PERFECT,
            seed: 42,
            tick_rate: 35,
            topology: TopologyMode::Auto,
            ticdup: 1,
            step_ms: 10,
            stall_timeout_ms: 500,
            event_interval: 0,
        }
    }
}

enum Stage {
    Handshaking {
        session: Session,
        handshake: Handshake,
    },
    Running(Box<SyncEngine>),
    Left,
}

/// One node of the cluster.
pub struct ClusterNode {
    stage: Stage,
    sim: DeterministicSim,
    ui: ScriptedProgress,
    last_report: FrameReport,
    desynced: PlayerSet,
}

impl ClusterNode {
    fn new(mut session: Session, seed: u32, now_ms: u64) -> Self {
        let handshake = Handshake::new(&mut session, now_ms);
        Self {
            stage: Stage::Handshaking { session, handshake },
            sim: DeterministicSim::new(seed),
            ui: ScriptedProgress::default(),
            last_report: FrameReport::default(),
            desynced: PlayerSet::EMPTY,
        }
    }

    /// True once the handshake finished.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self.stage, Stage::Running(_))
    }

    /// The lockstep engine, once running.
    #[must_use]
    pub fn engine(&self) -> Option<&SyncEngine> {
        match &self.stage {
            Stage::Running(engine) => Some(engine.as_ref()),
            _ => None,
        }
    }

    /// Mutable engine access, once running.
    pub fn engine_mut(&mut self) -> Option<&mut SyncEngine> {
        match &mut self.stage {
            Stage::Running(engine) => Some(engine.as_mut()),
            _ => None,
        }
    }

    /// The node's game.
    #[must_use]
    pub const fn sim(&self) -> &DeterministicSim {
        &self.sim
    }

    /// Mutable access to the node's game.
    pub fn sim_mut(&mut self) -> &mut DeterministicSim {
        &mut self.sim
    }

    /// Scripted answers given to the handshake.
    pub fn ui_mut(&mut self) -> &mut ScriptedProgress {
        &mut self.ui
    }

    /// Report of the most recent frame.
    #[must_use]
    pub const fn last_report(&self) -> &FrameReport {
        &self.last_report
    }

    /// Every participant this node ever saw diverge.
    #[must_use]
    pub const fn desynced(&self) -> PlayerSet {
        self.desynced
    }

    fn session(&self) -> Option<&Session> {
        match &self.stage {
            Stage::Handshaking { session, .. } => Some(session),
            Stage::Running(engine) => Some(engine.session()),
            Stage::Left => None,
        }
    }

    fn step(&mut self, now_ms: u64) -> NetResult<()> {
        let started = match &mut self.stage {
            Stage::Handshaking { session, handshake } => {
                match handshake.poll(session, &mut self.ui, now_ms)? {
                    HandshakePoll::Started(info) => Some(info),
                    HandshakePoll::Cancelled => {
                        session.announce_exit(NO_SUCCESSOR, EXIT_REPEAT)?;
                        self.stage = Stage::Left;
                        return Ok(());
                    }
                    HandshakePoll::Pending => None,
                }
            }
            Stage::Running(engine) => {
                self.last_report = engine.frame(&mut self.sim, now_ms)?;
                self.desynced = self.desynced.union(self.last_report.desynced);
                None
            }
            Stage::Left => None,
        };

        if let Some(info) = started {
            let stage = std::mem::replace(&mut self.stage, Stage::Left);
            if let Stage::Handshaking { session, .. } = stage {
                let engine = SyncEngine::new(session, info, now_ms);
                self.stage = Stage::Running(Box::new(engine));
            }
        }
        Ok(())
    }

    fn leave(&mut self) -> NetResult<()> {
        if let Stage::Running(engine) = &mut self.stage {
            engine.leave()?;
        }
        self.stage = Stage::Left;
        Ok(())
    }
}

/// End-of-run summary.
#[derive(Clone, Debug, Default)]
pub struct ClusterReport {
    /// Rounds stepped.
    pub rounds: u64,
    /// Simulated time elapsed.
    pub elapsed_ms: u64,
    /// Simulation ticks run per node.
    pub gametics: Vec<u64>,
    /// Own stream sequence per node.
    pub sequences: Vec<u32>,
    /// Latest game checksum per node.
    pub checksums: Vec<u16>,
    /// Participants each node saw diverge.
    pub desynced: Vec<PlayerSet>,
    /// Channel counters per node.
    pub transport: Vec<TransportStats>,
    /// Delivery counters of the shared network.
    pub network: MemoryStats,
}

impl ClusterReport {
    /// True when no node reported a divergence.
    #[must_use]
    pub fn in_sync(&self) -> bool {
        self.desynced.iter().all(PlayerSet::is_empty)
    }
}

/// Host and guests on one in-process network.
pub struct LocalCluster {
    config: ClusterConfig,
    network: MemoryNetwork,
    clock: ManualClock,
    nodes: Vec<ClusterNode>,
    rounds: u64,
}

impl LocalCluster {
    /// Opens a host session and `nodes - 1` guest sessions.
    pub fn new(config: ClusterConfig) -> NetResult<Self> {
        let network = MemoryNetwork::new(config.conditions, config.seed);
        let clock = ManualClock::new(0);
        let base = NetConfig {
            ticdup: config.ticdup,
            topology: config.topology,
            tick_rate: config.tick_rate,
            stall_timeout_ms: config.stall_timeout_ms,
            ..NetConfig::default()
        };

        let host = Session::memory(
            NetConfig {
                host_players: config.nodes,
                setup_info: "node-0".to_string(),
                ..base.clone()
            },
            &network,
        )?;
        let host_addr = host.local_addr();
        let now = clock.now_millis();
        let mut nodes = vec![ClusterNode::new(host, 0, now)];
        for index in 1..config.nodes {
            let guest = Session::memory(
                NetConfig {
                    join: Some(host_addr.to_string()),
                    user_info: format!("node-{index}"),
                    setup_info: format!("node-{index}"),
                    ..base.clone()
                },
                &network,
            )?;
            nodes.push(ClusterNode::new(guest, u32::from(index), now));
        }
        info!(nodes = config.nodes, conditions = ?config.conditions, "cluster created");
        Ok(Self {
            config,
            network,
            clock,
            nodes,
            rounds: 0,
        })
    }

    /// The shared network.
    #[must_use]
    pub const fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    /// The shared clock.
    #[must_use]
    pub const fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Node `index`; the host is node 0.
    #[must_use]
    pub fn node(&self, index: usize) -> Option<&ClusterNode> {
        self.nodes.get(index)
    }

    /// Mutable node access.
    pub fn node_mut(&mut self, index: usize) -> Option<&mut ClusterNode> {
        self.nodes.get_mut(index)
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True for a cluster without nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Polls every node once, then advances the clock.
    pub fn step(&mut self) -> NetResult<()> {
        let now = self.clock.now_millis();
        let interval = self.config.event_interval;
        for (index, node) in self.nodes.iter_mut().enumerate() {
            if interval > 0 && self.rounds % interval == 0 {
                if let Some(engine) = node.engine_mut() {
                    let stamp = [index as u8, (self.rounds & 0xFF) as u8];
                    engine.events().push(&stamp)?;
                }
            }
            node.step(now)?;
        }
        self.clock.advance(self.config.step_ms);
        self.rounds += 1;
        Ok(())
    }

    /// Steps until every node finished the handshake; false if `max_rounds`
    /// ran out first.
    pub fn run_handshake(&mut self, max_rounds: u64) -> NetResult<bool> {
        for _ in 0..max_rounds {
            if self.nodes.iter().all(ClusterNode::is_running) {
                debug!(rounds = self.rounds, "cluster handshake complete");
                return Ok(true);
            }
            self.step()?;
        }
        Ok(self.nodes.iter().all(ClusterNode::is_running))
    }

    /// Steps until every running node ran `ticks` simulation ticks, or
    /// `max_rounds` ran out.
    pub fn run_ticks(&mut self, ticks: u64, max_rounds: u64) -> NetResult<ClusterReport> {
        for _ in 0..max_rounds {
            let done = self
                .nodes
                .iter()
                .filter_map(ClusterNode::engine)
                .all(|engine| engine.gametic() >= ticks);
            if done && self.nodes.iter().any(ClusterNode::is_running) {
                break;
            }
            self.step()?;
        }
        Ok(self.report())
    }

    /// Makes node `index` leave the game.
    pub fn leave(&mut self, index: usize) -> NetResult<()> {
        if let Some(node) = self.nodes.get_mut(index) {
            node.leave()?;
        }
        Ok(())
    }

    /// Snapshot of every node.
    #[must_use]
    pub fn report(&self) -> ClusterReport {
        let mut report = ClusterReport {
            rounds: self.rounds,
            elapsed_ms: self.clock.now_millis(),
            network: self.network.stats(),
            ..ClusterReport::default()
        };
        for node in &self.nodes {
            let engine = node.engine();
            report.gametics.push(engine.map_or(0, SyncEngine::gametic));
            report.sequences.push(engine.map_or(0, |e| {
                e.peer(e.local_slot()).map_or(0, |p| p.current_sequence())
            }));
            report.checksums.push(node.sim.consistency_checksum());
            report.desynced.push(node.desynced);
            report
                .transport
                .push(node.session().map(|s| *s.channel.stats()).unwrap_or_default());
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_nodes_run_in_lockstep() {
        let mut cluster = LocalCluster::new(ClusterConfig::default()).unwrap();
        assert!(cluster.run_handshake(200).unwrap());
        let report = cluster.run_ticks(20, 2000).unwrap();
        assert!(report.gametics.iter().all(|&t| t >= 20));
        assert!(report.in_sync());
    }

    #[test]
    fn test_events_reach_every_node() {
        let config = ClusterConfig {
            nodes: 3,
            event_interval: 5,
            ..ClusterConfig::default()
        };
        let mut cluster = LocalCluster::new(config).unwrap();
        assert!(cluster.run_handshake(300).unwrap());
        let report = cluster.run_ticks(40, 4000).unwrap();
        assert!(report.in_sync());
        let seen: Vec<usize> = (0..3)
            .map(|i| cluster.node(i).unwrap().sim().events_seen())
            .collect();
        assert!(seen.iter().all(|&n| n > 0), "events seen: {seen:?}");
    }

    #[test]
    fn test_leaving_guest_is_reported() {
        let config = ClusterConfig {
            nodes: 3,
            ..ClusterConfig::default()
        };
        let mut cluster = LocalCluster::new(config).unwrap();
        assert!(cluster.run_handshake(300).unwrap());
        cluster.run_ticks(10, 2000).unwrap();
        cluster.leave(2).unwrap();
        for _ in 0..20 {
            cluster.step().unwrap();
        }
        let host = cluster.node(0).unwrap().engine().unwrap();
        assert!(!host.players().contains(2));
        assert_eq!(host.players().len(), 2);
    }
}
