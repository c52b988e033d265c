//! Aggregate snapshot of the latest decoded messages per channel, plus
//! the robot specification and the clock mapping.

use serde::{Deserialize, Serialize};

use crate::clock::ClockSync;
use crate::geometry::{Angle, Point, DEG0};
use crate::msg::{CameraMessage, ContactsMessage, MotionMessage, ProxyMessage, SupplyMessage};

/// Physical characteristics and calibration of the robot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RobotSpec {
    /// Maximum usable sonar range in metres.
    pub max_radar_distance: f64,
    /// Half-angle of the ultrasonic beam.
    pub receptive_angle: Angle,
    /// Radius of the bumper contact region.
    pub contact_radius: f64,
    /// Half of the camera's horizontal field of view.
    pub camera_half_view: Angle,
    /// Physical marker edge size in metres.
    pub marker_size: f64,
    /// Camera calibration: radians per image pixel.
    pub camera_angular_ratio: f64,
    /// Echo distance below which forward motion is blocked.
    pub safe_distance: f64,
    /// Supply calibration: volts per raw ADC count.
    pub supply_scale: f64,
}

impl Default for RobotSpec {
    fn default() -> Self {
        Self {
            max_radar_distance: 3.0,
            receptive_angle: Angle::from_deg(15.0),
            contact_radius: 0.3,
            camera_half_view: Angle::from_deg(20.0),
            marker_size: 0.2,
            camera_angular_ratio: 0.0011,
            safe_distance: 0.2,
            supply_scale: 0.0146,
        }
    }
}

/// The freshest sample per message channel. Updates go through the
/// `with_*` builders and return a new status.
#[derive(Clone, Debug, Default)]
pub struct RobotStatus {
    spec: RobotSpec,
    clock: ClockSync,
    /// Robot-clock timestamp the session timing is reported against.
    reset_time: i64,
    motion: Option<MotionMessage>,
    proxy: Option<ProxyMessage>,
    contacts: Option<ContactsMessage>,
    supply: Option<SupplyMessage>,
    camera: Option<CameraMessage>,
}

impl RobotStatus {
    pub fn new(spec: RobotSpec) -> Self {
        Self {
            spec,
            clock: ClockSync::default(),
            reset_time: 0,
            motion: None,
            proxy: None,
            contacts: None,
            supply: None,
            camera: None,
        }
    }

    pub fn spec(&self) -> &RobotSpec {
        &self.spec
    }

    pub fn clock(&self) -> &ClockSync {
        &self.clock
    }

    pub fn reset_time(&self) -> i64 {
        self.reset_time
    }

    pub fn motion(&self) -> Option<&MotionMessage> {
        self.motion.as_ref()
    }

    pub fn proxy(&self) -> Option<&ProxyMessage> {
        self.proxy.as_ref()
    }

    pub fn contacts(&self) -> Option<&ContactsMessage> {
        self.contacts.as_ref()
    }

    pub fn supply(&self) -> Option<&SupplyMessage> {
        self.supply.as_ref()
    }

    pub fn camera(&self) -> Option<&CameraMessage> {
        self.camera.as_ref()
    }

    pub fn with_motion(mut self, m: MotionMessage) -> Self {
        self.motion = Some(m);
        self
    }

    pub fn with_proxy(mut self, m: ProxyMessage) -> Self {
        self.proxy = Some(m);
        self
    }

    pub fn with_contacts(mut self, m: ContactsMessage) -> Self {
        self.contacts = Some(m);
        self
    }

    pub fn with_supply(mut self, m: SupplyMessage) -> Self {
        self.supply = Some(m);
        self
    }

    pub fn with_camera(mut self, m: CameraMessage) -> Self {
        self.camera = Some(m);
        self
    }

    /// Install a fresh clock estimate. The session reset time follows the
    /// exchange's remote receive timestamp.
    pub fn with_clock(mut self, clock: ClockSync) -> Self {
        self.reset_time = clock.receive_timestamp();
        self.clock = clock;
        self
    }

    /// Map a robot-clock timestamp to the host clock.
    pub fn to_local(&self, remote: i64) -> i64 {
        self.clock.from_remote(remote)
    }

    /// Robot location from the freshest odometer sample.
    pub fn location(&self) -> Point {
        match self.freshest_pose() {
            Pose::Motion(m) => m.location(),
            Pose::Proxy(p) => p.location(),
            Pose::None => Point::new(0.0, 0.0),
        }
    }

    /// Robot heading from the freshest odometer sample.
    pub fn direction(&self) -> Angle {
        match self.freshest_pose() {
            Pose::Motion(m) => m.direction(),
            Pose::Proxy(p) => p.robot_direction(),
            Pose::None => DEG0,
        }
    }

    /// Absolute sonar head bearing: yaw ⊕ sensor direction.
    pub fn head_direction(&self) -> Angle {
        match &self.proxy {
            Some(p) => p.head_direction(),
            None => self.direction(),
        }
    }

    /// Echo distance of the freshest ranging sample, 0 without an echo.
    pub fn echo_distance(&self) -> f64 {
        self.proxy.as_ref().map_or(0.0, |p| p.echo_distance())
    }

    /// World location of the last echo, if one came back.
    pub fn ping_location(&self) -> Option<Point> {
        let p = self.proxy.as_ref()?;
        let d = p.echo_distance();
        if d <= 0.0 {
            return None;
        }
        Some(p.location() + p.head_direction().vector() * d)
    }

    /// Whether forward motion is admissible: front bumper clear, the
    /// robot reports forward freedom, and no echo inside the safe
    /// distance.
    pub fn can_move_forward(&self) -> bool {
        let contacts_ok = self
            .contacts
            .as_ref()
            .map_or(true, |c| c.front_clear && c.can_forward);
        let d = self.echo_distance();
        contacts_ok && (d <= 0.0 || d > self.spec.safe_distance)
    }

    /// Whether backward motion is admissible.
    pub fn can_move_backward(&self) -> bool {
        self.contacts
            .as_ref()
            .map_or(true, |c| c.rear_clear && c.can_backward)
    }

    /// Supply voltage in volts, if a sample arrived.
    pub fn supply_voltage(&self) -> Option<f64> {
        self.supply
            .as_ref()
            .map(|s| s.voltage(self.spec.supply_scale))
    }

    fn freshest_pose(&self) -> Pose<'_> {
        match (&self.motion, &self.proxy) {
            (Some(m), Some(p)) if p.remote_time > m.remote_time => Pose::Proxy(p),
            (Some(m), _) => Pose::Motion(m),
            (None, Some(p)) => Pose::Proxy(p),
            (None, None) => Pose::None,
        }
    }
}

enum Pose<'a> {
    Motion(&'a MotionMessage),
    Proxy(&'a ProxyMessage),
    None,
}

// ─── Tests ───────────────────────────────────────────────────────────
