//! # Cluster Simulation
//!
//! Runs a whole game in one process over the in-memory network and reports
//! whether every node stayed in lockstep.
//!
//! ## Usage
//!
//! ```bash
//! cluster_sim --nodes 6 --loss 20 --ticks 2000
//! ```

use std::process::ExitCode;
use std::time::Instant;

use tandem_net::simulation::ClusterReport;
use tandem_net::{ClusterConfig, LocalCluster, NetResult, NetworkConditions, TopologyMode};
use tracing_subscriber::EnvFilter;

fn print_report(report: &ClusterReport, wall_ms: u128) {
    println!();
    println!("=== CLUSTER SIMULATION RESULTS ===");
    println!("Rounds:            {}", report.rounds);
    println!("Simulated time:    {} ms", report.elapsed_ms);
    println!("Wall time:         {wall_ms} ms");
    println!("Delivered:         {}", report.network.delivered);
    println!("Dropped:           {}", report.network.dropped);
    println!("Duplicated:        {}", report.network.duplicated);
    println!("Reordered:         {}", report.network.reordered);
    for (index, gametic) in report.gametics.iter().enumerate() {
        println!(
            "Node {index:>2}: tick {gametic:>6}  seq {:>6}  checksum {:#06x}  sent {:>6}",
            report.sequences[index], report.checksums[index], report.transport[index].packets_sent,
        );
    }
    println!("In sync:           {}", report.in_sync());
}

fn run() -> NetResult<bool> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ClusterConfig {
        nodes: 4,
        ..ClusterConfig::default()
    };
    let mut ticks = 1000u64;
    let mut loss = 0u8;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1).map(String::as_str).unwrap_or_default();
        match args[i].as_str() {
            "--nodes" | "-n" => config.nodes = value.parse().unwrap_or(4),
            "--loss" | "-l" => loss = value.parse().unwrap_or(0),
            "--ticks" => ticks = value.parse().unwrap_or(1000),
            "--seed" | "-s" => config.seed = value.parse().unwrap_or(42),
            "--ticdup" => config.ticdup = value.parse().unwrap_or(1),
            "--star" => {
                config.topology = TopologyMode::Star;
                i += 1;
                continue;
            }
            "--help" | "-h" => {
                println!("Usage: cluster_sim [--nodes N] [--loss PCT] [--ticks N] [--seed N] [--ticdup N] [--star]");
                return Ok(true);
            }
            _ => {}
        }
        i += 2;
    }
    config.conditions = NetworkConditions::lossy(loss.min(90));
    config.event_interval = 7;

    println!("┌─ CONFIGURATION ─────────────────────────────────────────────────┐");
    println!("│ Nodes:              {}", config.nodes);
    println!("│ Packet Loss:        {}%", config.conditions.packet_loss_percent);
    println!("│ Topology:           {:?}", config.topology);
    println!("│ Target Ticks:       {ticks}");
    println!("└──────────────────────────────────────────────────────────────────┘");

    let started = Instant::now();
    let mut cluster = LocalCluster::new(config)?;
    if !cluster.run_handshake(20_000)? {
        println!("Handshake did not complete.");
        return Ok(false);
    }
    let report = cluster.run_ticks(ticks, ticks * 200)?;
    print_report(&report, started.elapsed().as_millis());
    Ok(report.in_sync() && report.gametics.iter().all(|&t| t >= ticks))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
