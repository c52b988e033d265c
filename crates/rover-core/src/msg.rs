//! Sensor link messages.
//!
//! The robot talks a line-delimited text protocol: every line is one
//! message, tagged by a two-letter prefix. Five kinds flow robot → host
//! (`mt` motion, `px` proxy/range, `ct` contacts, `sv` supply, `qr`
//! camera); the host writes single-line commands (`mv`, `sc`, `ha`) and
//! the clock request `ck`. Decoders validate the field count and numeric
//! syntax and reject anything else as [`MalformedMessage`].

use std::f64::consts::PI;

use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geometry::{Angle, Point};

/// Drive wheel diameter in metres.
pub const WHEEL_DIAMETER: f64 = 0.067;
/// Odometer pulses per wheel revolution.
pub const PULSES_PER_REVOLUTION: f64 = 40.0;
/// Metres travelled per odometer pulse.
pub const DISTANCE_PER_PULSE: f64 = PI * WHEEL_DIAMETER / PULSES_PER_REVOLUTION;
/// Metres per microsecond of ultrasonic echo delay.
pub const DISTANCE_SCALE: f64 = 1.0 / 5882.0;
/// Camera code reported for an unrecognised marker.
pub const UNKNOWN_QR_CODE: &str = "?";

/// Odometer pulse counts to a world location in metres.
pub fn pulses_to_location(x_pulses: f64, y_pulses: f64) -> Point {
    Point2::new(x_pulses * DISTANCE_PER_PULSE, y_pulses * DISTANCE_PER_PULSE)
}

/// Echo delay in microseconds to metres. Zero delay means no echo.
pub fn delay_to_distance(delay_us: i64) -> f64 {
    delay_us as f64 * DISTANCE_SCALE
}

// ─── Errors ──────────────────────────────────────────────────────────

/// A line the decoder refuses: wrong tag, field count or numeric syntax.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MalformedMessage {
    #[error("empty line")]
    Empty,
    #[error("unknown message tag in line {0:?}")]
    UnknownTag(String),
    #[error("{tag} message needs {expected} fields, got {got}")]
    FieldCount {
        tag: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("bad {field} field {value:?} in {tag} message")]
    BadField {
        tag: &'static str,
        field: &'static str,
        value: String,
    },
}

/// Cursor over the whitespace-separated fields of one line.
struct Fields<'a> {
    tag: &'static str,
    fields: Vec<&'a str>,
    next: usize,
}

impl<'a> Fields<'a> {
    fn new(tag: &'static str, rest: &'a str, expected: usize) -> Result<Self, MalformedMessage> {
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() != expected {
            return Err(MalformedMessage::FieldCount {
                tag,
                expected,
                got: fields.len(),
            });
        }
        Ok(Self {
            tag,
            fields,
            next: 0,
        })
    }

    fn raw(&mut self) -> &'a str {
        let v = self.fields[self.next];
        self.next += 1;
        v
    }

    fn i64(&mut self, field: &'static str) -> Result<i64, MalformedMessage> {
        let v = self.raw();
        v.parse().map_err(|_| MalformedMessage::BadField {
            tag: self.tag,
            field,
            value: v.to_string(),
        })
    }

    fn i32(&mut self, field: &'static str) -> Result<i32, MalformedMessage> {
        let v = self.raw();
        v.parse().map_err(|_| MalformedMessage::BadField {
            tag: self.tag,
            field,
            value: v.to_string(),
        })
    }

    fn f64(&mut self, field: &'static str) -> Result<f64, MalformedMessage> {
        let v = self.raw();
        v.parse().map_err(|_| MalformedMessage::BadField {
            tag: self.tag,
            field,
            value: v.to_string(),
        })
    }

    fn flag(&mut self, field: &'static str) -> Result<bool, MalformedMessage> {
        match self.raw() {
            "0" => Ok(false),
            "1" => Ok(true),
            v => Err(MalformedMessage::BadField {
                tag: self.tag,
                field,
                value: v.to_string(),
            }),
        }
    }
}

fn flag_char(v: bool) -> char {
    if v {
        '1'
    } else {
        '0'
    }
}

// ─── Message kinds ───────────────────────────────────────────────────

/// `mt` — odometry and motor state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MotionMessage {
    pub remote_time: i64,
    pub x_pulses: f64,
    pub y_pulses: f64,
    pub yaw_deg: i32,
    pub left_pps: f64,
    pub right_pps: f64,
    pub imu_failure: i32,
    pub halt: bool,
    pub left_target_pps: f64,
    pub right_target_pps: f64,
    pub left_power: i32,
    pub right_power: i32,
}

impl MotionMessage {
    pub fn location(&self) -> Point {
        pulses_to_location(self.x_pulses, self.y_pulses)
    }

    pub fn direction(&self) -> Angle {
        Angle::from_deg(self.yaw_deg as f64)
    }

    fn decode(rest: &str) -> Result<Self, MalformedMessage> {
        let mut f = Fields::new("mt", rest, 12)?;
        Ok(Self {
            remote_time: f.i64("remoteTime")?,
            x_pulses: f.f64("xPulses")?,
            y_pulses: f.f64("yPulses")?,
            yaw_deg: f.i32("yaw")?,
            left_pps: f.f64("leftPps")?,
            right_pps: f.f64("rightPps")?,
            imu_failure: f.i32("imuFailure")?,
            halt: f.flag("halt")?,
            left_target_pps: f.f64("leftTargetPps")?,
            right_target_pps: f.f64("rightTargetPps")?,
            left_power: f.i32("leftPower")?,
            right_power: f.i32("rightPower")?,
        })
    }

    fn encode(&self) -> String {
        format!(
            "mt {} {} {} {} {} {} {} {} {} {} {} {}",
            self.remote_time,
            self.x_pulses,
            self.y_pulses,
            self.yaw_deg,
            self.left_pps,
            self.right_pps,
            self.imu_failure,
            flag_char(self.halt),
            self.left_target_pps,
            self.right_target_pps,
            self.left_power,
            self.right_power,
        )
    }
}

/// `px` — one ranging shot with the robot pose at ping time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProxyMessage {
    pub remote_time: i64,
    pub sensor_dir_deg: i32,
    pub echo_delay_us: i64,
    pub x_pulses: f64,
    pub y_pulses: f64,
    pub yaw_deg: i32,
}

impl ProxyMessage {
    pub fn location(&self) -> Point {
        pulses_to_location(self.x_pulses, self.y_pulses)
    }

    pub fn robot_direction(&self) -> Angle {
        Angle::from_deg(self.yaw_deg as f64)
    }

    /// Absolute head bearing: robot yaw ⊕ sensor direction.
    pub fn head_direction(&self) -> Angle {
        self.robot_direction()
            .add(&Angle::from_deg(self.sensor_dir_deg as f64))
    }

    /// Echo distance in metres, 0 when no echo came back.
    pub fn echo_distance(&self) -> f64 {
        delay_to_distance(self.echo_delay_us)
    }

    fn decode(rest: &str) -> Result<Self, MalformedMessage> {
        let mut f = Fields::new("px", rest, 6)?;
        Ok(Self {
            remote_time: f.i64("remoteTime")?,
            sensor_dir_deg: f.i32("sensorDir")?,
            echo_delay_us: f.i64("echoDelay")?,
            x_pulses: f.f64("xPulses")?,
            y_pulses: f.f64("yPulses")?,
            yaw_deg: f.i32("yaw")?,
        })
    }

    fn encode(&self) -> String {
        format!(
            "px {} {} {} {} {} {}",
            self.remote_time,
            self.sensor_dir_deg,
            self.echo_delay_us,
            self.x_pulses,
            self.y_pulses,
            self.yaw_deg,
        )
    }
}

/// `ct` — bumper contacts and motion blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactsMessage {
    pub remote_time: i64,
    pub front_clear: bool,
    pub rear_clear: bool,
    pub can_forward: bool,
    pub can_backward: bool,
}

impl ContactsMessage {
    fn decode(rest: &str) -> Result<Self, MalformedMessage> {
        let mut f = Fields::new("ct", rest, 5)?;
        Ok(Self {
            remote_time: f.i64("remoteTime")?,
            front_clear: f.flag("front")?,
            rear_clear: f.flag("rear")?,
            can_forward: f.flag("canForward")?,
            can_backward: f.flag("canBackward")?,
        })
    }

    fn encode(&self) -> String {
        format!(
            "ct {} {} {} {} {}",
            self.remote_time,
            flag_char(self.front_clear),
            flag_char(self.rear_clear),
            flag_char(self.can_forward),
            flag_char(self.can_backward),
        )
    }
}

/// `sv` — supply voltage sample (raw ADC count).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplyMessage {
    pub remote_time: i64,
    pub voltage_raw: i32,
}

impl SupplyMessage {
    /// Voltage in volts for a given volts-per-count scale.
    pub fn voltage(&self, scale: f64) -> f64 {
        self.voltage_raw as f64 * scale
    }

    fn decode(rest: &str) -> Result<Self, MalformedMessage> {
        let mut f = Fields::new("sv", rest, 2)?;
        Ok(Self {
            remote_time: f.i64("remoteTime")?,
            voltage_raw: f.i32("voltage")?,
        })
    }

    fn encode(&self) -> String {
        format!("sv {} {}", self.remote_time, self.voltage_raw)
    }
}

/// `qr` — one camera frame with a detected marker quad.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraMessage {
    pub remote_time: i64,
    pub qr_code: String,
    pub width: f64,
    pub height: f64,
    /// Marker quad corners in image pixels.
    pub points: [[f64; 2]; 4],
}

impl CameraMessage {
    /// Whether the detector recognised the code.
    pub fn recognised(&self) -> bool {
        self.qr_code != UNKNOWN_QR_CODE
    }

    /// Mean x-coordinate of the quad in image pixels.
    pub fn mean_x(&self) -> f64 {
        self.points.iter().map(|p| p[0]).sum::<f64>() / 4.0
    }

    /// Marker offset from the camera axis: quad centre against the image
    /// centre, scaled by the calibrated radians-per-pixel ratio.
    pub fn offset_angle(&self, angular_ratio: f64) -> Angle {
        Angle::from_rad((self.mean_x() - self.width / 2.0) * angular_ratio)
    }

    fn decode(rest: &str) -> Result<Self, MalformedMessage> {
        let mut f = Fields::new("qr", rest, 12)?;
        let remote_time = f.i64("remoteTime")?;
        let qr_code = f.raw().to_string();
        let width = f.f64("width")?;
        let height = f.f64("height")?;
        let mut points = [[0.0; 2]; 4];
        for p in points.iter_mut() {
            p[0] = f.f64("x")?;
            p[1] = f.f64("y")?;
        }
        Ok(Self {
            remote_time,
            qr_code,
            width,
            height,
            points,
        })
    }

    fn encode(&self) -> String {
        let mut line = format!(
            "qr {} {} {} {}",
            self.remote_time, self.qr_code, self.width, self.height
        );
        for p in &self.points {
            line.push_str(&format!(" {} {}", p[0], p[1]));
        }
        line
    }
}

/// Any decoded robot → host message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SensorMessage {
    Motion(MotionMessage),
    Proxy(ProxyMessage),
    Contacts(ContactsMessage),
    Supply(SupplyMessage),
    Camera(CameraMessage),
}

impl SensorMessage {
    /// Decode one protocol line.
    pub fn decode(line: &str) -> Result<Self, MalformedMessage> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (tag, rest) = match line.split_once(' ') {
            Some((tag, rest)) => (tag, rest),
            None if line.is_empty() => return Err(MalformedMessage::Empty),
            None => (line, ""),
        };
        match tag {
            "mt" => MotionMessage::decode(rest).map(SensorMessage::Motion),
            "px" => ProxyMessage::decode(rest).map(SensorMessage::Proxy),
            "ct" => ContactsMessage::decode(rest).map(SensorMessage::Contacts),
            "sv" => SupplyMessage::decode(rest).map(SensorMessage::Supply),
            "qr" => CameraMessage::decode(rest).map(SensorMessage::Camera),
            _ => Err(MalformedMessage::UnknownTag(line.to_string())),
        }
    }

    /// Canonical single-line form. Decoding a canonical line and
    /// re-encoding it is byte-identical.
    pub fn encode(&self) -> String {
        match self {
            SensorMessage::Motion(m) => m.encode(),
            SensorMessage::Proxy(m) => m.encode(),
            SensorMessage::Contacts(m) => m.encode(),
            SensorMessage::Supply(m) => m.encode(),
            SensorMessage::Camera(m) => m.encode(),
        }
    }

    /// Robot-clock timestamp of the message.
    pub fn remote_time(&self) -> i64 {
        match self {
            SensorMessage::Motion(m) => m.remote_time,
            SensorMessage::Proxy(m) => m.remote_time,
            SensorMessage::Contacts(m) => m.remote_time,
            SensorMessage::Supply(m) => m.remote_time,
            SensorMessage::Camera(m) => m.remote_time,
        }
    }
}

// ─── Clock exchange ──────────────────────────────────────────────────

/// `ck` — robot reply to a host clock request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockReply {
    pub originate: i64,
    pub receive: i64,
    pub transmit: i64,
}

impl ClockReply {
    /// Host-side request line for the given originate timestamp.
    pub fn request(originate: i64) -> String {
        format!("ck {originate}")
    }

    pub fn decode(line: &str) -> Result<Self, MalformedMessage> {
        let line = line.trim_end_matches(['\r', '\n']);
        let rest = line
            .strip_prefix("ck ")
            .ok_or_else(|| MalformedMessage::UnknownTag(line.to_string()))?;
        let mut f = Fields::new("ck", rest, 3)?;
        Ok(Self {
            originate: f.i64("originate")?,
            receive: f.i64("receive")?,
            transmit: f.i64("transmit")?,
        })
    }
}

// ─── Commands ────────────────────────────────────────────────────────

/// Host → robot commands emitted with each inference.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RobotCommands {
    /// Target bearing in degrees and speed in pulses per second.
    pub move_to: Option<MoveCommand>,
    /// Sonar head azimuth in degrees.
    pub scan: Option<i32>,
    /// Emergency stop.
    pub halt: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MoveCommand {
    pub direction_deg: i32,
    pub speed: f64,
}

impl RobotCommands {
    pub fn halt() -> Self {
        Self {
            halt: true,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.move_to.is_none() && self.scan.is_none() && !self.halt
    }

    /// Command lines in emission order; halt always goes first.
    pub fn encode_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if self.halt {
            lines.push("ha".to_string());
        }
        if let Some(mv) = &self.move_to {
            lines.push(format!("mv {} {}", mv.direction_deg, mv.speed));
        }
        if let Some(dir) = self.scan {
            lines.push(format!("sc {dir}"));
        }
        lines
    }
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_per_pulse() {
        // ≈ 5.26 mm per pulse for the 67 mm wheel at 40 ppr.
        assert!((DISTANCE_PER_PULSE - 0.00526).abs() < 1e-5);
    }

    #[test]
    fn test_decode_motion() {
        let line = "mt 1500 100 -50 90 12.5 12.5 0 0 13 13 80 80";
        let msg = SensorMessage::decode(line).unwrap();
        let m = match msg {
            SensorMessage::Motion(ref m) => m,
            _ => panic!("expected motion message"),
        };
        assert_eq!(m.remote_time, 1500);
        assert_eq!(m.yaw_deg, 90);
        assert!(!m.halt);
        let loc = m.location();
        assert!((loc.x - 100.0 * DISTANCE_PER_PULSE).abs() < 1e-12);
        assert!((loc.y + 50.0 * DISTANCE_PER_PULSE).abs() < 1e-12);
    }

    #[test]
    fn test_decode_proxy() {
        let line = "px 2000 30 5882 0 0 60";
        let msg = SensorMessage::decode(line).unwrap();
        let p = match msg {
            SensorMessage::Proxy(ref p) => p,
            _ => panic!("expected proxy message"),
        };
        // 5882 µs delay is one metre.
        assert!((p.echo_distance() - 1.0).abs() < 1e-9);
        assert!((p.head_direction().to_deg() - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_decode_contacts_and_supply() {
        let ct = SensorMessage::decode("ct 3000 1 1 1 0").unwrap();
        match ct {
            SensorMessage::Contacts(c) => {
                assert!(c.front_clear && c.rear_clear && c.can_forward);
                assert!(!c.can_backward);
            }
            _ => panic!("expected contacts message"),
        }

        let sv = SensorMessage::decode("sv 3100 820").unwrap();
        match sv {
            SensorMessage::Supply(s) => {
                assert_eq!(s.voltage_raw, 820);
                assert!((s.voltage(0.0146) - 11.972).abs() < 1e-3);
            }
            _ => panic!("expected supply message"),
        }
    }

    #[test]
    fn test_decode_camera() {
        let line = "qr 4000 A 640 480 300 220 340 220 340 260 300 260";
        let msg = SensorMessage::decode(line).unwrap();
        let c = match msg {
            SensorMessage::Camera(ref c) => c,
            _ => panic!("expected camera message"),
        };
        assert!(c.recognised());
        assert!((c.mean_x() - 320.0).abs() < 1e-12);
        // Quad dead centre: zero offset.
        assert!(c.offset_angle(0.001).to_rad().abs() < 1e-12);
    }

    #[test]
    fn test_canonical_roundtrip() {
        let lines = [
            "mt 1500 100 -50 90 12.5 12.5 0 0 13 13 80 80",
            "px 2000 30 5882 0 0 60",
            "ct 3000 1 1 1 0",
            "sv 3100 820",
            "qr 4000 A 640 480 300 220 340 220 340 260 300 260",
        ];
        for line in lines {
            let msg = SensorMessage::decode(line).unwrap();
            assert_eq!(msg.encode(), line);
        }
    }

    #[test]
    fn test_malformed_lines() {
        assert_eq!(SensorMessage::decode(""), Err(MalformedMessage::Empty));
        assert!(matches!(
            SensorMessage::decode("zz 1 2 3"),
            Err(MalformedMessage::UnknownTag(_))
        ));
        assert!(matches!(
            SensorMessage::decode("px 2000 30 5882 0 0"),
            Err(MalformedMessage::FieldCount { tag: "px", expected: 6, got: 5 })
        ));
        assert!(matches!(
            SensorMessage::decode("sv 3100 abc"),
            Err(MalformedMessage::BadField { tag: "sv", .. })
        ));
    }

    #[test]
    fn test_crlf_tolerated() {
        let msg = SensorMessage::decode("sv 3100 820\r\n").unwrap();
        assert_eq!(msg.remote_time(), 3100);
    }

    #[test]
    fn test_clock_reply() {
        let r = ClockReply::decode("ck 100 500 600").unwrap();
        assert_eq!(r.originate, 100);
        assert_eq!(r.receive, 500);
        assert_eq!(r.transmit, 600);
        assert_eq!(ClockReply::request(100), "ck 100");
    }

    #[test]
    fn test_command_lines() {
        let cmd = RobotCommands {
            move_to: Some(MoveCommand {
                direction_deg: 45,
                speed: 20.0,
            }),
            scan: Some(-30),
            halt: false,
        };
        assert_eq!(cmd.encode_lines(), vec!["mv 45 20", "sc -30"]);
        assert_eq!(RobotCommands::halt().encode_lines(), vec!["ha"]);
        assert!(RobotCommands::default().is_empty());
    }
}
