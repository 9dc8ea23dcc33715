//! # Lockstep Session Tests
//!
//! A host and a guest driven by hand through the public API: handshake
//! polls, then engine frames, all against one manual clock.
//!
//! Run with: cargo test --test lockstep_session -- --nocapture

use tandem_net::simulation::ClusterConfig;
use tandem_net::{
    Clock, DeterministicSim, Handshake, HandshakePoll, LocalCluster, ManualClock, MemoryNetwork,
    NetConfig, ScriptedProgress, Session, Simulation, StartInfo, SyncEngine,
};

const STEP_MS: u64 = 5;

fn handshake_pair(net: &MemoryNetwork, clock: &ManualClock) -> (SyncEngine, SyncEngine) {
    let mut host = Session::memory(
        NetConfig {
            host_players: 2,
            tick_rate: 100,
            ..NetConfig::default()
        },
        net,
    )
    .unwrap();
    let mut guest = Session::memory(
        NetConfig {
            join: Some(host.local_addr().to_string()),
            tick_rate: 100,
            ..NetConfig::default()
        },
        net,
    )
    .unwrap();

    let mut host_hs = Handshake::new(&mut host, clock.now_millis());
    let mut guest_hs = Handshake::new(&mut guest, clock.now_millis());
    let mut ui = ScriptedProgress::default();
    let mut host_start: Option<StartInfo> = None;
    let mut guest_start: Option<StartInfo> = None;

    for _ in 0..500 {
        let now = clock.now_millis();
        if guest_start.is_none() {
            if let HandshakePoll::Started(info) = guest_hs.poll(&mut guest, &mut ui, now).unwrap() {
                guest_start = Some(info);
            }
        }
        if host_start.is_none() {
            if let HandshakePoll::Started(info) = host_hs.poll(&mut host, &mut ui, now).unwrap() {
                host_start = Some(info);
            }
        }
        if host_start.is_some() && guest_start.is_some() {
            break;
        }
        clock.advance(STEP_MS);
    }

    let host_start = host_start.expect("host never started");
    let guest_start = guest_start.expect("guest never started");
    assert_eq!(host_start.players, guest_start.players);
    assert_eq!(host_start.params, guest_start.params);
    assert_eq!(guest_start.local, 1);

    let now = clock.now_millis();
    (
        SyncEngine::new(host, host_start, now),
        SyncEngine::new(guest, guest_start, now),
    )
}

#[test]
fn host_and_guest_reach_ten_ticks() {
    let net = MemoryNetwork::perfect();
    let clock = ManualClock::new(1_000);
    let (mut host, mut guest) = handshake_pair(&net, &clock);
    let mut host_sim = DeterministicSim::new(1);
    let mut guest_sim = DeterministicSim::new(2);

    for _ in 0..2_000 {
        let now = clock.now_millis();
        host.frame(&mut host_sim, now).unwrap();
        guest.frame(&mut guest_sim, now).unwrap();
        if host.gametic() >= 10 && guest.gametic() >= 10 {
            break;
        }
        clock.advance(STEP_MS);
    }

    assert!(host.gametic() >= 10, "host ran {} ticks", host.gametic());
    assert!(guest.gametic() >= 10, "guest ran {} ticks", guest.gametic());
    assert!(host.peer(1).unwrap().current_sequence() >= 10);
    assert!(guest.peer(0).unwrap().current_sequence() >= 10);
    assert!(!host.is_desynced());
    assert!(!guest.is_desynced());

    // Step both to the same tick count and compare game state directly.
    let target = host.gametic().max(guest.gametic()) + 5;
    for _ in 0..2_000 {
        let now = clock.now_millis();
        if host.gametic() < target {
            host.frame(&mut host_sim, now).unwrap();
        }
        if guest.gametic() < target {
            guest.frame(&mut guest_sim, now).unwrap();
        }
        if host.gametic() >= target && guest.gametic() >= target {
            break;
        }
        clock.advance(STEP_MS);
    }
    if host.gametic() == guest.gametic() {
        assert_eq!(host_sim.consistency_checksum(), guest_sim.consistency_checksum());
    }
}

#[test]
fn simulation_waits_for_silent_peer() {
    let net = MemoryNetwork::perfect();
    let clock = ManualClock::new(0);
    let (mut host, _guest) = handshake_pair(&net, &clock);
    let mut sim = DeterministicSim::new(1);

    for _ in 0..200 {
        host.frame(&mut sim, clock.now_millis()).unwrap();
        clock.advance(STEP_MS);
    }
    // The guest never ran a frame, so nothing from it was ever accepted.
    assert_eq!(host.gametic(), 0);
    assert_eq!(host.lowest_sequence(), 0);
    assert!(host.frame_stats().gated_frames > 0);
}

#[test]
fn game_survives_host_leaving() {
    let config = ClusterConfig {
        nodes: 3,
        ..ClusterConfig::default()
    };
    let mut cluster = LocalCluster::new(config).unwrap();
    assert!(cluster.run_handshake(500).unwrap());
    cluster.run_ticks(10, 5_000).unwrap();

    cluster.leave(0).unwrap();
    let before = cluster.node(1).unwrap().engine().unwrap().gametic();
    for _ in 0..400 {
        cluster.step().unwrap();
    }

    for index in 1..3 {
        let engine = cluster.node(index).unwrap().engine().unwrap();
        assert!(!engine.players().contains(0));
        assert_eq!(engine.arbitrator(), 1);
    }
    let after = cluster.node(1).unwrap().engine().unwrap().gametic();
    assert!(after > before, "game stalled at {before}");
}
