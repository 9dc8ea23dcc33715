//! # Tandem Node
//!
//! Hosts or joins a lockstep game over UDP and runs the stand-in simulation.
//!
//! ## Usage
//!
//! ```bash
//! tandem_node --host 2 --port 5029
//! tandem_node --join 192.168.1.10:5029 --duration 30
//! tandem_node --config tandem.toml
//! ```

use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use tandem_net::{
    Clock, DeterministicSim, Handshake, HandshakeOutcome, LogProgress, NetConfig, NetError, NetResult,
    Session, SyncEngine, SystemClock, TopologyMode,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

struct Options {
    config: NetConfig,
    duration_secs: Option<u64>,
}

fn usage() {
    println!("Usage: tandem_node [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -c, --config <FILE>        Load settings from a TOML file");
    println!("      --host <PLAYERS>       Host a game for PLAYERS participants (default: 1)");
    println!("  -j, --join <ADDR>          Join the host at ADDR[:PORT]");
    println!("  -p, --port <PORT>          UDP port to host on (default: 5029)");
    println!("  -t, --tick-rate <RATE>     Simulation ticks per second (default: 35)");
    println!("      --ticdup <N>           Simulation ticks per network tick (default: 1)");
    println!("      --topology <MODE>      auto, peer-to-peer or star (default: auto)");
    println!("      --password <TEXT>      Lobby password");
    println!("  -d, --duration <SECS>      Leave after N seconds");
    println!("  -h, --help                 Show this help");
}

fn parse_args() -> NetResult<Option<Options>> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = NetConfig::default();
    let mut duration_secs = None;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1).cloned().unwrap_or_default();
        match args[i].as_str() {
            "--config" | "-c" => {
                config = NetConfig::load(&value)?;
                i += 1;
            }
            "--host" => {
                config.host_players = value.parse().unwrap_or(1);
                config.join = None;
                i += 1;
            }
            "--join" | "-j" => {
                config.join = Some(value);
                i += 1;
            }
            "--port" | "-p" => {
                config.port = value.parse().unwrap_or(config.port);
                i += 1;
            }
            "--tick-rate" | "-t" => {
                config.tick_rate = value.parse().unwrap_or(config.tick_rate);
                i += 1;
            }
            "--ticdup" => {
                config.ticdup = value.parse().unwrap_or(config.ticdup);
                i += 1;
            }
            "--topology" => {
                config.topology = match value.as_str() {
                    "star" => TopologyMode::Star,
                    "peer-to-peer" | "p2p" => TopologyMode::PeerToPeer,
                    _ => TopologyMode::Auto,
                };
                i += 1;
            }
            "--password" => {
                config.password = value;
                i += 1;
            }
            "--duration" | "-d" => {
                duration_secs = value.parse().ok();
                i += 1;
            }
            "--help" | "-h" => {
                usage();
                return Ok(None);
            }
            other => warn!(argument = other, "unknown argument ignored"),
        }
        i += 1;
    }
    Ok(Some(Options {
        config,
        duration_secs,
    }))
}

fn run(options: Options) -> NetResult<()> {
    let clock = SystemClock::new();
    let mut session = Session::udp(options.config)?;

    println!("┌─ SESSION ───────────────────────────────────────────────────────┐");
    println!("│ Local Address:      {}", session.local_addr());
    println!("│ Role:               {:?}", session.role());
    println!("│ Tick Rate:          {} Hz", session.config.tick_rate);
    println!("└──────────────────────────────────────────────────────────────────┘");
    println!();

    let handshake = Handshake::new(&mut session, clock.now_millis());
    let start = match handshake.run(&mut session, &mut LogProgress::new(), &clock)? {
        HandshakeOutcome::Started(start) => start,
        HandshakeOutcome::Cancelled => {
            println!("Handshake cancelled.");
            return Ok(());
        }
    };

    let mut sim = DeterministicSim::new(u32::from(start.local));
    let mut engine = SyncEngine::new(session, start, clock.now_millis());
    let deadline = options
        .duration_secs
        .map(|secs| clock.now_millis() + secs * 1000);
    let mut last_status = 0u64;

    loop {
        let now = clock.now_millis();
        if deadline.is_some_and(|d| now >= d) {
            break;
        }

        let report = match engine.frame(&mut sim, now) {
            Ok(report) => report,
            Err(NetError::Protocol(error)) => {
                warn!(%error, "dropped undecodable datagram");
                continue;
            }
            Err(error) => return Err(error),
        };
        if !report.desynced.is_empty() {
            warn!(players = ?report.desynced.iter().collect::<Vec<_>>(), "consistency failure");
        }
        if engine.players().len() <= 1 && engine.start_info().players.len() > 1 {
            println!("Everyone else left.");
            break;
        }

        if engine.gametic() >= last_status + u64::from(engine.session().config.tick_rate) * 5 {
            last_status = engine.gametic();
            let stats = engine.frame_stats();
            println!("┌─ STATUS (Tick {}) ─────────────────────────────────────────", engine.gametic());
            println!("│ Players:            {}", engine.players().len());
            println!("│ Lowest Sequence:    {}", engine.lowest_sequence());
            println!("│ Input Delay:        {} tics", engine.input_delay());
            println!("│ Gated Frames:       {}", stats.gated_frames);
            println!("│ State Checksum:     {:#06x}", tandem_net::Simulation::consistency_checksum(&sim));
            println!("└──────────────────────────────────────────────────────────────────");
        }

        let wait = engine.until_next_tick(clock.now_millis());
        thread::sleep(wait.clamp(Duration::from_millis(1), Duration::from_millis(10)));
    }

    engine.leave()?;
    let stats = *engine.frame_stats();
    let traffic = *engine.session().channel.stats();
    println!();
    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║                    SESSION CLOSED                                ║");
    println!("╠══════════════════════════════════════════════════════════════════╣");
    println!("║ Ticks Run:          {:>10}                                   ║", engine.gametic());
    println!("║ Frames:             {:>10}                                   ║", stats.frames);
    println!("║ Max Burst:          {:>10}                                   ║", stats.max_burst);
    println!("║ Packets Sent:       {:>10}                                   ║", traffic.packets_sent);
    println!("║ Packets Received:   {:>10}                                   ║", traffic.packets_received);
    println!("║ Desynced:           {:>10}                                   ║", engine.is_desynced());
    println!("╚══════════════════════════════════════════════════════════════════╝");
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║         TANDEM NODE                                              ║");
    println!("║         DETERMINISTIC LOCKSTEP                                   ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!();

    let options = match parse_args() {
        Ok(Some(options)) => options,
        Ok(None) => return ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    match run(options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
