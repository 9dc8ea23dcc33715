//! # Desync Detection Tests
//!
//! One node's game state is perturbed mid-game; the checksum exchange must
//! single it out without accusing anyone else.
//!
//! Run with: cargo test --test desync_detection

use tandem_net::simulation::ClusterConfig;
use tandem_net::{LocalCluster, NetworkConditions, PlayerSet, TopologyMode};

fn running_cluster(nodes: u8, topology: TopologyMode) -> LocalCluster {
    let config = ClusterConfig {
        nodes,
        topology,
        ..ClusterConfig::default()
    };
    let mut cluster = LocalCluster::new(config).unwrap();
    assert!(cluster.run_handshake(1_000).unwrap());
    let report = cluster.run_ticks(20, 10_000).unwrap();
    assert!(report.in_sync(), "diverged before any corruption");
    cluster
}

#[test]
fn clean_run_reports_nothing() {
    let mut cluster = running_cluster(3, TopologyMode::PeerToPeer);
    let report = cluster.run_ticks(120, 20_000).unwrap();
    assert!(report.in_sync());
}

#[test]
fn corrupted_peer_is_flagged_by_everyone() {
    let mut cluster = running_cluster(3, TopologyMode::PeerToPeer);
    cluster.node_mut(2).unwrap().sim_mut().corrupt();
    cluster.run_ticks(120, 20_000).unwrap();

    for index in 0..2 {
        let seen = cluster.node(index).unwrap().desynced();
        assert_eq!(seen, PlayerSet::single(2), "node {index} saw {seen:?}");
        let engine = cluster.node(index).unwrap().engine().unwrap();
        assert!(engine.peer(2).unwrap().first_desync().is_some());
        assert!(!engine.peer(1 - index as u8).unwrap().is_desynced());
    }
    let culprit = cluster.node(2).unwrap().desynced();
    assert!(culprit.contains(0) && culprit.contains(1));
}

#[test]
fn star_hub_flags_corrupted_spoke() {
    let mut cluster = running_cluster(3, TopologyMode::Star);
    cluster.node_mut(2).unwrap().sim_mut().corrupt();
    cluster.run_ticks(120, 20_000).unwrap();

    assert_eq!(cluster.node(0).unwrap().desynced(), PlayerSet::single(2));
    assert_eq!(cluster.node(2).unwrap().desynced(), PlayerSet::single(0));
    assert!(cluster.node(1).unwrap().desynced().is_empty());
}

#[test]
fn divergence_is_reported_once() {
    let mut cluster = running_cluster(2, TopologyMode::PeerToPeer);
    cluster.node_mut(1).unwrap().sim_mut().corrupt();

    let mut reports = 0;
    for _ in 0..3_000 {
        cluster.step().unwrap();
        if cluster.node(0).unwrap().last_report().desynced.contains(1) {
            reports += 1;
        }
    }
    assert_eq!(reports, 1);
    assert!(cluster.node(0).unwrap().engine().unwrap().is_desynced());
}

#[test]
fn divergence_found_despite_lost_checksums() {
    let config = ClusterConfig {
        nodes: 3,
        conditions: NetworkConditions::lossy(25),
        seed: 21,
        topology: TopologyMode::PeerToPeer,
        ..ClusterConfig::default()
    };
    let mut cluster = LocalCluster::new(config).unwrap();
    assert!(cluster.run_handshake(20_000).unwrap());
    let report = cluster.run_ticks(40, 60_000).unwrap();
    assert!(report.in_sync(), "lossy run diverged on its own");

    cluster.node_mut(2).unwrap().sim_mut().corrupt();
    let report = cluster.run_ticks(200, 100_000).unwrap();
    assert!(report.gametics.iter().all(|&t| t >= 200), "{:?}", report.gametics);
    assert!(cluster.network().stats().dropped > 0);
    for index in 0..2 {
        let seen = cluster.node(index).unwrap().desynced();
        assert_eq!(seen, PlayerSet::single(2), "node {index} saw {seen:?}");
    }
}
