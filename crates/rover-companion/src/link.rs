//! Sensor link: line-delimited TCP text protocol to the robot, plus a
//! hardware-free simulated link for development.
//!
//! The link task owns the socket. Decoded messages and link state
//! changes flow to the control loop through a bounded channel; command
//! lines flow the other way. A read timeout or I/O error closes the
//! session and schedules a reconnect with exponential back-off.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::{Rng, SeedableRng};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, warn};

use rover_core::clock::ClockSync;
use rover_core::geometry::{Angle, Point};
use rover_core::msg::{
    CameraMessage, ClockReply, ContactsMessage, MotionMessage, ProxyMessage, SensorMessage,
    SupplyMessage, DISTANCE_PER_PULSE, DISTANCE_SCALE,
};

use crate::config::RobotConfig;

/// Host clock in milliseconds since the epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("connect timeout after {0} ms")]
    ConnectTimeout(u64),
    #[error("read timeout after {0} ms")]
    ReadTimeout(u64),
    #[error("connection closed by peer")]
    Closed,
    #[error("cannot resolve {0}")]
    Resolve(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What the link reports to the control loop.
#[derive(Debug)]
pub enum LinkEvent {
    Connected,
    /// A decoded message together with its raw line.
    Message {
        line: String,
        message: SensorMessage,
    },
    /// A line the decoder refused.
    Unparsed { line: String },
    /// A completed clock exchange.
    Clock { clock: ClockSync },
    /// A command line written to the robot.
    Sent { line: String },
    Disconnected { reason: String },
    /// Retries exhausted; the link gives up.
    Fatal { reason: String },
}

/// Spawn the TCP link task.
pub fn spawn_link(
    cfg: RobotConfig,
    events: mpsc::Sender<LinkEvent>,
    commands: mpsc::Receiver<String>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run_link(cfg, events, commands, shutdown))
}

async fn run_link(
    cfg: RobotConfig,
    events: mpsc::Sender<LinkEvent>,
    mut commands: mpsc::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = cfg.backoff_min;
    let mut attempts: u32 = 0;
    loop {
        if *shutdown.borrow() {
            return;
        }
        match connect(&cfg).await {
            Ok(stream) => {
                info!(host = cfg.host.as_str(), port = cfg.port, "link connected");
                attempts = 0;
                backoff = cfg.backoff_min;
                let _ = events.send(LinkEvent::Connected).await;
                match session(&cfg, stream, &events, &mut commands, &mut shutdown).await {
                    Ok(()) => return,
                    Err(e) => {
                        warn!(error = %e, "link session ended");
                        let _ = events
                            .send(LinkEvent::Disconnected {
                                reason: e.to_string(),
                            })
                            .await;
                    }
                }
            }
            Err(e) => {
                attempts += 1;
                warn!(error = %e, attempts, "connect failed");
                let _ = events
                    .send(LinkEvent::Disconnected {
                        reason: e.to_string(),
                    })
                    .await;
                if cfg.max_retries > 0 && attempts >= cfg.max_retries {
                    let _ = events
                        .send(LinkEvent::Fatal {
                            reason: format!("giving up after {attempts} attempts: {e}"),
                        })
                        .await;
                    return;
                }
            }
        }
        debug!(backoff, "reconnecting after back-off");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(backoff)) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
        backoff = (backoff * 2).min(cfg.backoff_max);
    }
}

async fn connect(cfg: &RobotConfig) -> Result<TcpStream, LinkError> {
    let target = format!("{}:{}", cfg.host, cfg.port);
    let addr: SocketAddr = tokio::net::lookup_host(&target)
        .await?
        .next()
        .ok_or_else(|| LinkError::Resolve(target.clone()))?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_keepalive(true)?;
    match timeout(Duration::from_millis(cfg.connect_timeout), socket.connect(addr)).await {
        Ok(stream) => Ok(stream?),
        Err(_) => Err(LinkError::ConnectTimeout(cfg.connect_timeout)),
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> Result<(), LinkError> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await?;
    Ok(())
}

async fn session(
    cfg: &RobotConfig,
    stream: TcpStream,
    events: &mpsc::Sender<LinkEvent>,
    commands: &mut mpsc::Receiver<String>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), LinkError> {
    let (read_half, mut write_half) = stream.into_split();

    // First clock exchange right away, then periodically.
    write_line(&mut write_half, &ClockReply::request(now_ms())).await?;
    let sync_period = Duration::from_millis(cfg.clock_sync_interval.max(1_000));
    let mut sync_timer = interval_at(Instant::now() + sync_period, sync_period);

    // Reads live in their own task: read_line is not cancellation-safe
    // inside a select loop.
    let (err_tx, mut err_rx) = oneshot::channel::<LinkError>();
    let reader_events = events.clone();
    let read_timeout = cfg.read_timeout;
    let reader_task = tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        loop {
            let read = timeout(
                Duration::from_millis(read_timeout),
                reader.read_line(&mut line),
            )
            .await;
            match read {
                Err(_) => {
                    let _ = err_tx.send(LinkError::ReadTimeout(read_timeout));
                    return;
                }
                Ok(Err(e)) => {
                    let _ = err_tx.send(e.into());
                    return;
                }
                Ok(Ok(0)) => {
                    let _ = err_tx.send(LinkError::Closed);
                    return;
                }
                Ok(Ok(_)) => {
                    handle_line(&line, &reader_events).await;
                    line.clear();
                }
            }
        }
    });

    let result = loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break Ok(());
                }
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(cmd) => {
                        if let Err(e) = write_line(&mut write_half, &cmd).await {
                            break Err(e);
                        }
                        let _ = events.send(LinkEvent::Sent { line: cmd }).await;
                    }
                    None => break Ok(()),
                }
            }
            _ = sync_timer.tick() => {
                if let Err(e) = write_line(&mut write_half, &ClockReply::request(now_ms())).await {
                    break Err(e);
                }
            }
            err = &mut err_rx => {
                break Err(err.unwrap_or(LinkError::Closed));
            }
        }
    };
    reader_task.abort();
    result
}

async fn handle_line(line: &str, events: &mpsc::Sender<LinkEvent>) {
    let text = line.trim_end_matches(['\r', '\n']);
    if text.is_empty() {
        return;
    }
    if text.starts_with("ck ") {
        match ClockReply::decode(text) {
            Ok(reply) => {
                let clock =
                    ClockSync::estimate(reply.originate, reply.receive, reply.transmit, now_ms());
                let _ = events.send(LinkEvent::Clock { clock }).await;
            }
            Err(e) => {
                warn!(error = %e, line = text, "bad clock reply");
                let _ = events
                    .send(LinkEvent::Unparsed {
                        line: text.to_string(),
                    })
                    .await;
            }
        }
        return;
    }
    match SensorMessage::decode(text) {
        Ok(message) => {
            let _ = events
                .send(LinkEvent::Message {
                    line: text.to_string(),
                    message,
                })
                .await;
        }
        Err(e) => {
            // Per-message failure: log, report the raw line, move on.
            warn!(error = %e, line = text, "malformed message dropped");
            let _ = events
                .send(LinkEvent::Unparsed {
                    line: text.to_string(),
                })
                .await;
        }
    }
}

// ─── Simulated link ──────────────────────────────────────────────────

/// Half edge length of the simulated square room in metres.
const SIM_ROOM: f64 = 2.0;

/// Spawn a simulated robot: drives on command, sweeps its head, ranges
/// against the room walls and spots one marker on the north wall.
pub fn spawn_sim(
    events: mpsc::Sender<LinkEvent>,
    commands: mpsc::Receiver<String>,
    shutdown: watch::Receiver<bool>,
    period_ms: u64,
) -> JoinHandle<()> {
    tokio::spawn(run_sim(events, commands, shutdown, period_ms))
}

struct SimRobot {
    remote_time: i64,
    x: f64,
    y: f64,
    yaw_deg: i32,
    speed_pps: f64,
    head_deg: i32,
    head_step: i32,
}

impl SimRobot {
    fn new() -> Self {
        Self {
            remote_time: 0,
            x: 0.0,
            y: 0.0,
            yaw_deg: 0,
            speed_pps: 0.0,
            head_deg: -90,
            head_step: 15,
        }
    }

    fn advance(&mut self, period_ms: u64) {
        self.remote_time += period_ms as i64;
        let metres = self.speed_pps * DISTANCE_PER_PULSE * period_ms as f64 / 1000.0;
        let dir = Angle::from_deg(self.yaw_deg as f64);
        self.x = (self.x + dir.sin() * metres).clamp(-SIM_ROOM + 0.1, SIM_ROOM - 0.1);
        self.y = (self.y + dir.cos() * metres).clamp(-SIM_ROOM + 0.1, SIM_ROOM - 0.1);
        self.head_deg += self.head_step;
        if self.head_deg.abs() >= 90 {
            self.head_step = -self.head_step;
        }
    }

    /// Distance from the robot to the room wall along a bearing.
    fn wall_distance(&self, bearing: &Angle) -> f64 {
        let (dx, dy) = (bearing.sin(), bearing.cos());
        let tx = if dx > 1e-9 {
            (SIM_ROOM - self.x) / dx
        } else if dx < -1e-9 {
            (-SIM_ROOM - self.x) / dx
        } else {
            f64::INFINITY
        };
        let ty = if dy > 1e-9 {
            (SIM_ROOM - self.y) / dy
        } else if dy < -1e-9 {
            (-SIM_ROOM - self.y) / dy
        } else {
            f64::INFINITY
        };
        tx.min(ty)
    }

    fn apply_command(&mut self, line: &str) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            ["ha"] => self.speed_pps = 0.0,
            ["mv", dir, speed] => {
                if let (Ok(dir), Ok(speed)) = (dir.parse(), speed.parse()) {
                    self.yaw_deg = dir;
                    self.speed_pps = speed;
                }
            }
            ["sc", dir] => {
                if let Ok(dir) = dir.parse() {
                    self.head_deg = dir;
                    self.head_step = 0;
                }
            }
            _ => debug!(line, "sim ignores command"),
        }
    }
}

async fn run_sim(
    events: mpsc::Sender<LinkEvent>,
    mut commands: mpsc::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
    period_ms: u64,
) {
    info!("simulated link started");
    let mut robot = SimRobot::new();
    let mut rng = rand::rngs::StdRng::seed_from_u64(rand::random());
    let _ = events.send(LinkEvent::Connected).await;
    // The simulated robot clock starts at zero "now".
    let now = now_ms();
    let clock = ClockSync::estimate(now, 0, 0, now);
    let _ = events.send(LinkEvent::Clock { clock }).await;

    let mut ticker = tokio::time::interval(Duration::from_millis(period_ms.max(10)));
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(cmd) => {
                        robot.apply_command(&cmd);
                        let _ = events.send(LinkEvent::Sent { line: cmd }).await;
                    }
                    None => return,
                }
            }
            _ = ticker.tick() => {
                robot.advance(period_ms);
                for message in sim_messages(&robot, &mut rng) {
                    let line = message.encode();
                    if events.send(LinkEvent::Message { line, message }).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn sim_messages(robot: &SimRobot, rng: &mut impl Rng) -> Vec<SensorMessage> {
    let x_pulses = robot.x / DISTANCE_PER_PULSE;
    let y_pulses = robot.y / DISTANCE_PER_PULSE;
    let mut out = vec![SensorMessage::Motion(MotionMessage {
        remote_time: robot.remote_time,
        x_pulses,
        y_pulses,
        yaw_deg: robot.yaw_deg,
        left_pps: robot.speed_pps,
        right_pps: robot.speed_pps,
        imu_failure: 0,
        halt: robot.speed_pps == 0.0,
        left_target_pps: robot.speed_pps,
        right_target_pps: robot.speed_pps,
        left_power: (robot.speed_pps / 2.0) as i32,
        right_power: (robot.speed_pps / 2.0) as i32,
    })];

    let head = Angle::from_deg((robot.yaw_deg + robot.head_deg) as f64);
    let distance = robot.wall_distance(&head) * rng.gen_range(0.98..1.02);
    let echo_delay_us = if distance < 3.0 {
        (distance / DISTANCE_SCALE) as i64
    } else {
        0
    };
    out.push(SensorMessage::Proxy(ProxyMessage {
        remote_time: robot.remote_time,
        sensor_dir_deg: robot.head_deg,
        echo_delay_us,
        x_pulses,
        y_pulses,
        yaw_deg: robot.yaw_deg,
    }));

    out.push(SensorMessage::Contacts(ContactsMessage {
        remote_time: robot.remote_time,
        front_clear: true,
        rear_clear: true,
        can_forward: true,
        can_backward: true,
    }));

    out.push(SensorMessage::Supply(SupplyMessage {
        remote_time: robot.remote_time,
        voltage_raw: rng.gen_range(780..820),
    }));

    // One marker on the north wall, visible when the camera faces it.
    let marker = Point::new(0.0, SIM_ROOM);
    let to_marker = marker - Point::new(robot.x, robot.y);
    let bearing = Angle::from_vector(&to_marker);
    let offset = bearing.sub(&Angle::from_deg(robot.yaw_deg as f64));
    if offset.to_rad().abs() < 20f64.to_radians() && to_marker.norm() < 3.0 {
        let mean_x = 320.0 + offset.to_rad() / 0.0011;
        out.push(SensorMessage::Camera(CameraMessage {
            remote_time: robot.remote_time,
            qr_code: "A".to_string(),
            width: 640.0,
            height: 480.0,
            points: [
                [mean_x - 20.0, 220.0],
                [mean_x + 20.0, 220.0],
                [mean_x + 20.0, 260.0],
                [mean_x - 20.0, 260.0],
            ],
        }));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_robot_ranges_against_walls() {
        let robot = SimRobot::new();
        // From the centre the north wall is SIM_ROOM away.
        let d = robot.wall_distance(&Angle::from_deg(0.0));
        assert!((d - SIM_ROOM).abs() < 1e-9);
        // Diagonal reach is longer.
        let diag = robot.wall_distance(&Angle::from_deg(45.0));
        assert!(diag > d);
    }

    #[test]
    fn test_sim_commands() {
        let mut robot = SimRobot::new();
        robot.apply_command("mv 90 20");
        assert_eq!(robot.yaw_deg, 90);
        assert!((robot.speed_pps - 20.0).abs() < 1e-12);
        robot.apply_command("ha");
        assert_eq!(robot.speed_pps, 0.0);
        robot.apply_command("sc -45");
        assert_eq!(robot.head_deg, -45);
    }

    #[test]
    fn test_sim_messages_decode_canonically() {
        let mut robot = SimRobot::new();
        robot.advance(100);
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for message in sim_messages(&robot, &mut rng) {
            let line = message.encode();
            assert_eq!(SensorMessage::decode(&line).unwrap(), message);
        }
    }
}
