//! # Handshake Convergence Tests
//!
//! Four nodes must agree on players, topology, parameters and every setup
//! string, on a clean network and on one that drops almost a third of all
//! datagrams.
//!
//! Run with: cargo test --test gossip_convergence -- --nocapture

use tandem_net::simulation::ClusterConfig;
use tandem_net::{LocalCluster, NetworkConditions, PlayerSet, Topology};

fn converge(conditions: NetworkConditions, seed: u64) -> LocalCluster {
    let config = ClusterConfig {
        nodes: 4,
        conditions,
        seed,
        ..ClusterConfig::default()
    };
    let mut cluster = LocalCluster::new(config).unwrap();
    assert!(
        cluster.run_handshake(20_000).unwrap(),
        "handshake did not converge at {}% loss",
        conditions.packet_loss_percent
    );
    cluster
}

fn assert_agreement(cluster: &LocalCluster) {
    let host = cluster.node(0).unwrap().engine().unwrap().start_info().clone();
    assert_eq!(host.players, PlayerSet::first_n(4));
    assert_eq!(host.topology, Topology::PeerToPeer);
    assert_eq!(host.setups.len(), 4);

    let mut locals = Vec::new();
    for index in 0..cluster.len() {
        let start = cluster.node(index).unwrap().engine().unwrap().start_info();
        assert_eq!(start.players, host.players);
        assert_eq!(start.topology, host.topology);
        assert_eq!(start.params, host.params);
        assert_eq!(start.setups, host.setups);
        assert_eq!(start.arbitrator, 0);
        locals.push(start.local);
    }
    locals.sort_unstable();
    assert_eq!(locals, vec![0, 1, 2, 3]);
}

#[test]
fn four_nodes_converge_on_clean_network() {
    let cluster = converge(NetworkConditions::PERFECT, 7);
    assert_agreement(&cluster);
    for (slot, setup) in &cluster.node(0).unwrap().engine().unwrap().start_info().setups {
        assert!(setup.starts_with("node-"), "slot {slot} setup {setup:?}");
    }
}

#[test]
fn four_nodes_converge_under_loss() {
    for seed in [1, 2, 3] {
        let cluster = converge(NetworkConditions::lossy(30), seed);
        assert_agreement(&cluster);
        assert!(cluster.network().stats().dropped > 0);
    }
}

#[test]
fn lockstep_holds_under_loss() {
    let mut cluster = converge(NetworkConditions::lossy(30), 11);
    let report = cluster.run_ticks(60, 60_000).unwrap();
    assert!(report.gametics.iter().all(|&t| t >= 60), "{:?}", report.gametics);
    assert!(report.in_sync());
}
