//! Rover companion - runs the world modeller on the host, talks to the
//! robot over the TCP sensor link.
//!
//! Usage:
//!   rover-companion --config rover.yaml      # real robot from config
//!   rover-companion --robot 10.0.0.7:4040    # address override
//!   rover-companion --simulate               # no hardware needed

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn, Level};

use rover_core::msg::RobotCommands;
use rover_core::world::{WorldModel, WorldModeller};

use rover_companion::config::Config;
use rover_companion::dump::{DumpWriter, WorldModelWriter};
use rover_companion::error::CompanionError;
use rover_companion::link::{now_ms, spawn_link, spawn_sim, LinkEvent};

#[derive(Parser, Debug)]
#[command(name = "rover-companion")]
#[command(about = "World modelling companion for the rover robot", long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Robot address override, host:port
    #[arg(long)]
    robot: Option<String>,

    /// Run against a simulated robot instead of hardware
    #[arg(long)]
    simulate: bool,

    /// Journal every link line to this file
    #[arg(long)]
    dump: Option<PathBuf>,

    /// Persist world-model snapshots to this file
    #[arg(long)]
    world_file: Option<PathBuf>,

    /// Tick frequency in Hz
    #[arg(long, default_value = "10")]
    freq: u32,

    /// Emit one JSON summary line per snapshot on stdout
    #[arg(long)]
    json: bool,

    /// Suppress debug output
    #[arg(short, long)]
    quiet: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env if present (silently ignore if missing).
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let log_level = if args.quiet {
        Level::WARN
    } else if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(log_level).init();

    match run(args).await {
        Ok(()) => {
            info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "exiting");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(args: Args) -> Result<(), CompanionError> {
    info!("🤖 rover companion starting...");
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(robot) = &args.robot {
        let (host, port) = robot
            .rsplit_once(':')
            .ok_or_else(|| CompanionError::Config(format!("bad robot address {robot:?}")))?;
        config.robot.host = host.to_string();
        config.robot.port = port
            .parse()
            .map_err(|_| CompanionError::Config(format!("bad robot port {port:?}")))?;
    }
    let freq = args.freq.clamp(1, 100);
    let period_ms = 1000 / freq as u64;

    let params = config.world_params();
    let mut modeller = WorldModeller::new(params);
    info!(
        width = modeller.radar().topology().width(),
        height = modeller.radar().topology().height(),
        sectors = config.modeller.num_sectors,
        "world modeller ready"
    );

    let (event_tx, mut event_rx) = mpsc::channel::<LinkEvent>(256);
    let (cmd_tx, cmd_rx) = mpsc::channel::<String>(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let link_task = if args.simulate {
        info!("running against the simulated robot");
        spawn_sim(event_tx, cmd_rx, shutdown_rx, period_ms)
    } else {
        spawn_link(config.robot.clone(), event_tx, cmd_rx, shutdown_rx)
    };

    // Snapshot fan-out: every subscriber gets its own bounded buffer;
    // laggards drop old snapshots, never block the tick loop.
    let (snapshot_tx, _) = broadcast::channel::<Arc<WorldModel>>(64);
    if args.json {
        spawn_json_emitter(snapshot_tx.subscribe());
    }

    let mut dump = match &args.dump {
        Some(path) => Some(
            DumpWriter::create(path)
                .map_err(|e| CompanionError::Config(format!("dump file: {e}")))?,
        ),
        None => None,
    };
    let mut world_file = match &args.world_file {
        Some(path) => Some(
            WorldModelWriter::create(
                path,
                modeller.status().spec(),
                config.modeller.num_sectors,
                modeller.radar().topology(),
            )
            .map_err(|e| CompanionError::Config(format!("world file: {e}")))?,
        ),
        None => None,
    };

    let mut watchdog = Watchdog::new(config.watchdog.window);
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(period_ms));
    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                let _ = cmd_tx.send("ha".to_string()).await;
                break Ok(());
            }
            event = event_rx.recv() => {
                match event {
                    None => break Ok(()),
                    Some(LinkEvent::Connected) => info!("robot link up"),
                    Some(LinkEvent::Message { line, message }) => {
                        if let Some(dump) = dump.as_mut() {
                            if let Err(e) = dump.rx(now_ms(), &line) {
                                warn!(error = %e, "journal write failed");
                            }
                        }
                        modeller.on_message(message);
                    }
                    Some(LinkEvent::Unparsed { line }) => {
                        if let Some(dump) = dump.as_mut() {
                            if let Err(e) = dump.rx(now_ms(), &line) {
                                warn!(error = %e, "journal write failed");
                            }
                        }
                    }
                    Some(LinkEvent::Clock { clock }) => modeller.set_clock(clock),
                    Some(LinkEvent::Sent { line }) => {
                        if let Some(dump) = dump.as_mut() {
                            if let Err(e) = dump.tx(now_ms(), &line) {
                                warn!(error = %e, "journal write failed");
                            }
                        }
                    }
                    Some(LinkEvent::Disconnected { reason }) => {
                        warn!(reason = reason.as_str(), "robot link down");
                    }
                    Some(LinkEvent::Fatal { reason }) => {
                        break Err(CompanionError::Link(reason));
                    }
                }
            }
            _ = ticker.tick() => {
                let now = now_ms();
                let model = modeller.tick(now);

                let safe = supply_safe(&model, config.watchdog.min_supply_voltage);
                if !watchdog.check(safe, now) {
                    let _ = cmd_tx.send("ha".to_string()).await;
                    break Err(CompanionError::Unsafe(format!(
                        "safety predicate failed for over {} ms",
                        config.watchdog.window
                    )));
                }

                let commands = if modeller.gate().try_schedule(now) {
                    modeller.gate().start();
                    let commands = reflex_commands(&model);
                    modeller.gate().finish(now_ms());
                    commands
                } else {
                    RobotCommands::default()
                };

                if let Some(world_file) = world_file.as_mut() {
                    if let Err(e) = world_file.append(
                        &model.status,
                        &model.radar,
                        &model.markers,
                        &commands,
                    ) {
                        warn!(error = %e, "world file write failed");
                    }
                }

                let _ = snapshot_tx.send(Arc::new(model));
                for line in commands.encode_lines() {
                    if cmd_tx.send(line).await.is_err() {
                        break;
                    }
                }
            }
        }
    };

    let _ = shutdown_tx.send(true);
    if let Some(dump) = dump.as_mut() {
        let _ = dump.flush();
    }
    if let Some(world_file) = world_file.as_mut() {
        let _ = world_file.flush();
    }
    link_task.abort();
    result
}

/// Built-in inference: a pure reflex that halts when forward motion is
/// blocked. The full controller registers its own policy downstream.
fn reflex_commands(model: &WorldModel) -> RobotCommands {
    if !model.status.can_move_forward() {
        RobotCommands::halt()
    } else {
        RobotCommands::default()
    }
}

/// Safety predicate for the watchdog: the supply, once sampled, stays
/// above the configured minimum.
fn supply_safe(model: &WorldModel, min_voltage: f64) -> bool {
    match model.status.supply_voltage() {
        Some(v) => v >= min_voltage,
        None => true,
    }
}

/// Raises the unsafe signal when the predicate fails continuously for
/// longer than the window.
struct Watchdog {
    window: i64,
    failing_since: Option<i64>,
}

impl Watchdog {
    fn new(window: i64) -> Self {
        Self {
            window,
            failing_since: None,
        }
    }

    /// Returns false once the predicate has failed for over the window.
    fn check(&mut self, ok: bool, now: i64) -> bool {
        if ok {
            self.failing_since = None;
            return true;
        }
        let since = *self.failing_since.get_or_insert(now);
        now - since <= self.window
    }
}

// ─── Snapshot JSON emitter ───────────────────────────────────────────

#[derive(Serialize)]
struct SnapshotSummary {
    time: i64,
    x: f64,
    y: f64,
    yaw_deg: f64,
    can_forward: bool,
    hindered_sectors: usize,
    markers: usize,
    obstacles: usize,
}

fn summarize(model: &WorldModel) -> SnapshotSummary {
    SnapshotSummary {
        time: now_ms(),
        x: model.status.location().x,
        y: model.status.location().y,
        yaw_deg: model.status.direction().to_deg(),
        can_forward: model.status.can_move_forward(),
        hindered_sectors: model
            .polar
            .sectors()
            .iter()
            .filter(|s| s.is_hindered())
            .count(),
        markers: model.markers.len(),
        obstacles: model.obstacle_map.len(),
    }
}

fn spawn_json_emitter(mut rx: broadcast::Receiver<Arc<WorldModel>>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(model) => match serde_json::to_string(&summarize(&model)) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, "snapshot serialization failed"),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "snapshot emitter lagging");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watchdog_window() {
        let mut w = Watchdog::new(1000);
        assert!(w.check(true, 0));
        assert!(w.check(false, 100));
        assert!(w.check(false, 1100));
        // Past the window: unsafe.
        assert!(!w.check(false, 1101));
        // Recovery resets the window.
        assert!(w.check(true, 1200));
        assert!(w.check(false, 1300));
        assert!(w.check(false, 2300));
    }
}
