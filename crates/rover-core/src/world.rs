//! World modeller: orchestrates the radar, polar and marker modellers
//! over the robot status and snapshots the result once per tick.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geometry::Point;
use crate::grid::GridTopology;
use crate::marker::{CorrelatedCameraEvent, MarkerLocator, MarkerMap, MarkerParams};
use crate::msg::SensorMessage;
use crate::polar::{PolarMap, PolarModeller};
use crate::radar::{RadarMap, RadarModeller, RadarParams, SensorSignal};
use crate::status::{RobotSpec, RobotStatus};

/// Everything the world modeller needs to know up front.
#[derive(Clone, Debug)]
pub struct WorldParams {
    pub spec: RobotSpec,
    /// Radar grid cell counts and cell size in metres.
    pub radar_width: usize,
    pub radar_height: usize,
    pub radar_grid: f64,
    pub radar: RadarParams,
    pub num_sectors: usize,
    /// Minimum resolvable polar distance.
    pub min_radar_distance: f64,
    pub marker: MarkerParams,
    /// Minimum interval between inference runs in milliseconds.
    pub min_inference_interval: i64,
}

impl Default for WorldParams {
    fn default() -> Self {
        Self {
            spec: RobotSpec::default(),
            radar_width: 51,
            radar_height: 51,
            radar_grid: 0.2,
            radar: RadarParams::default(),
            num_sectors: 24,
            min_radar_distance: 0.3,
            marker: MarkerParams::default(),
            min_inference_interval: 100,
        }
    }
}

/// Per-cell state of the radar grid, a compact view for downstream
/// consumers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellState {
    Unknown,
    Empty,
    Echogenic,
    Contact,
    Labeled,
}

/// Immutable snapshot produced once per tick.
#[derive(Clone, Debug)]
pub struct WorldModel {
    pub spec: RobotSpec,
    pub status: RobotStatus,
    pub radar: RadarMap,
    pub markers: MarkerMap,
    pub polar: PolarMap,
    /// Tagged per-cell view of the radar grid.
    pub grid_map: Vec<CellState>,
    /// Locations of every hindered cell.
    pub obstacle_map: Vec<Point>,
}

// ─── Inference gate ──────────────────────────────────────────────────

/// State of the downstream inference pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InferenceState {
    #[default]
    Idle,
    Scheduled,
    Running,
}

/// Gate for inference runs: idle → scheduled → running → idle, with a
/// minimum inter-inference interval. Ticks arriving while a run is in
/// flight are dropped silently.
#[derive(Clone, Copy, Debug)]
pub struct InferenceGate {
    state: InferenceState,
    min_interval: i64,
    last: i64,
}

impl InferenceGate {
    pub fn new(min_interval: i64) -> Self {
        Self {
            state: InferenceState::Idle,
            min_interval,
            last: i64::MIN / 2,
        }
    }

    pub fn state(&self) -> InferenceState {
        self.state
    }

    /// Request an inference run at time `now`. Returns false while one
    /// is scheduled or running, or inside the minimum interval.
    pub fn try_schedule(&mut self, now: i64) -> bool {
        if self.state != InferenceState::Idle || now - self.last < self.min_interval {
            return false;
        }
        self.state = InferenceState::Scheduled;
        true
    }

    /// The scheduled run starts executing.
    pub fn start(&mut self) {
        debug_assert_eq!(self.state, InferenceState::Scheduled);
        self.state = InferenceState::Running;
    }

    /// The run finished at time `now`.
    pub fn finish(&mut self, now: i64) {
        self.state = InferenceState::Idle;
        self.last = now;
    }
}

// ─── Modeller ────────────────────────────────────────────────────────

/// Owns the maps and the per-channel status; one instance per control
/// loop, mutated only from the tick thread.
pub struct WorldModeller {
    params: WorldParams,
    status: RobotStatus,
    radar: RadarMap,
    radar_modeller: RadarModeller,
    polar_modeller: PolarModeller,
    locator: MarkerLocator,
    gate: InferenceGate,
}

impl WorldModeller {
    pub fn new(params: WorldParams) -> Self {
        let topology = GridTopology::new(
            Point::new(0.0, 0.0),
            params.radar_width,
            params.radar_height,
            params.radar_grid,
        );
        Self {
            status: RobotStatus::new(params.spec.clone()),
            radar: RadarMap::new(topology),
            radar_modeller: RadarModeller::new(params.radar.clone()),
            polar_modeller: PolarModeller::new(
                params.num_sectors,
                params.radar.max_radar_distance,
                params.min_radar_distance,
            ),
            locator: MarkerLocator::new(params.marker.clone()),
            gate: InferenceGate::new(params.min_inference_interval),
            params,
        }
    }

    pub fn params(&self) -> &WorldParams {
        &self.params
    }

    pub fn status(&self) -> &RobotStatus {
        &self.status
    }

    pub fn radar(&self) -> &RadarMap {
        &self.radar
    }

    pub fn markers(&self) -> &MarkerMap {
        self.locator.markers()
    }

    pub fn gate(&mut self) -> &mut InferenceGate {
        &mut self.gate
    }

    /// Fold one decoded message into the status.
    pub fn on_message(&mut self, message: SensorMessage) {
        let status = std::mem::take(&mut self.status);
        self.status = match message {
            SensorMessage::Motion(m) => status.with_motion(m),
            SensorMessage::Proxy(m) => status.with_proxy(m),
            SensorMessage::Contacts(m) => status.with_contacts(m),
            SensorMessage::Supply(m) => status.with_supply(m),
            SensorMessage::Camera(m) => status.with_camera(m),
        };
    }

    /// Install a fresh clock estimate.
    pub fn set_clock(&mut self, clock: crate::clock::ClockSync) {
        let status = std::mem::take(&mut self.status);
        self.status = status.with_clock(clock);
    }

    /// One tick at host-clock time `now`: correlate the camera, feed the
    /// ranging signals and contacts to the radar, clean if due, derive
    /// the polar view and snapshot everything.
    pub fn tick(&mut self, now: i64) -> WorldModel {
        self.correlate_camera();
        self.feed_radar();
        self.radar = self.radar_modeller.clean(&self.radar, now);

        let polar =
            self.polar_modeller
                .derive(&self.radar, self.status.location(), self.status.direction());
        let grid_map = self.radar.cells().iter().map(cell_state).collect();
        let obstacle_map = self.radar.hindered_locations();

        WorldModel {
            spec: self.params.spec.clone(),
            status: self.status.clone(),
            radar: self.radar.clone(),
            markers: self.locator.markers().clone(),
            polar,
            grid_map,
            obstacle_map,
        }
    }

    /// Pair the camera frame with its time-adjacent ranging sample and
    /// feed the locator; the locator's own gate and sticky-frame policy
    /// reject everything else.
    fn correlate_camera(&mut self) {
        let (Some(camera), Some(proxy)) = (self.status.camera(), self.status.proxy()) else {
            return;
        };
        let event = CorrelatedCameraEvent {
            camera: camera.clone(),
            proxy: proxy.clone(),
        };
        if !event.admissible(self.params.marker.correlation_interval) {
            return;
        }
        let t = self.status.to_local(event.camera.remote_time);
        let had = self.locator.markers().len();
        self.locator.on_event(&event, &self.params.spec, t);
        if self.locator.markers().len() != had {
            debug!(markers = self.locator.markers().len(), "marker map changed");
        }
        // Recognised sightings also label the radar cell under the
        // marker.
        if event.camera.recognised() {
            if let Some(marker) = self.locator.markers().get(&event.camera.qr_code) {
                let location = marker.location;
                self.radar = self.radar_modeller.apply_label(&self.radar, &location, true, t);
            }
        }
    }

    /// Front and rear ranging signals plus bumper stamping from the
    /// freshest samples. Re-application of an already-seen sample is a
    /// no-op by construction (the decay step is zero).
    fn feed_radar(&mut self) {
        if let Some(proxy) = self.status.proxy() {
            let t = self.status.to_local(proxy.remote_time);
            let location = proxy.location();
            let head = proxy.head_direction();
            let distance = proxy.echo_distance();
            let front = SensorSignal {
                location,
                direction: head,
                distance,
                timestamp: t,
                echo: distance > 0.0,
            };
            // The sonar says nothing positive about the rear half-plane;
            // the mirror ray only contributes anechoic sweep evidence.
            let rear = SensorSignal {
                location,
                direction: head.opposite(),
                distance: if distance > 0.0 {
                    distance
                } else {
                    self.params.radar.max_radar_distance
                },
                timestamp: t,
                echo: false,
            };
            self.radar = self.radar_modeller.apply_signal(&self.radar, &front);
            self.radar = self.radar_modeller.apply_signal(&self.radar, &rear);
        }

        if let Some(contacts) = self.status.contacts() {
            if !contacts.front_clear || !contacts.rear_clear {
                let t = self.status.to_local(contacts.remote_time);
                self.radar = self.radar_modeller.apply_contact(
                    &self.radar,
                    &self.status.location(),
                    &self.status.direction(),
                    !contacts.front_clear,
                    !contacts.rear_clear,
                    t,
                );
            }
        }
    }
}

fn cell_state(cell: &crate::radar::MapCell) -> CellState {
    if cell.is_labeled() && cell.is_hindered() {
        CellState::Labeled
    } else if cell.has_contact() {
        CellState::Contact
    } else if cell.is_echogenic() {
        CellState::Echogenic
    } else if cell.is_anechoic() {
        CellState::Empty
    } else {
        CellState::Unknown
    }
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::SensorMessage;

    fn modeller() -> WorldModeller {
        WorldModeller::new(WorldParams::default())
    }

    fn feed(m: &mut WorldModeller, line: &str) {
        m.on_message(SensorMessage::decode(line).unwrap());
    }

    #[test]
    fn test_tick_builds_radar_from_proxy() {
        let mut m = modeller();
        // Echo one metre north of the origin.
        feed(&mut m, "px 1000 0 5882 0 0 0");
        let model = m.tick(1000);

        let ping = model
            .radar
            .topology()
            .index_of(&Point::new(0.0, 1.0))
            .unwrap();
        assert!(model.radar.cell(ping).is_echogenic());
        assert!(model.obstacle_map.len() >= 1);
        assert_eq!(model.grid_map[ping], CellState::Echogenic);
    }

    #[test]
    fn test_tick_is_idempotent_per_sample() {
        let mut m = modeller();
        feed(&mut m, "px 1000 0 5882 0 0 0");
        let first = m.tick(1000);
        let second = m.tick(1001);
        assert_eq!(first.radar.cells(), second.radar.cells());
    }

    #[test]
    fn test_camera_correlation_feeds_locator() {
        let mut m = modeller();
        feed(&mut m, "px 1000 0 5882 0 0 0");
        feed(&mut m, "qr 1100 A 640 480 300 220 340 220 340 260 300 260");
        let model = m.tick(1200);
        assert!(model.markers.contains_key("A"));
    }

    #[test]
    fn test_uncorrelated_camera_ignored() {
        let mut m = modeller();
        feed(&mut m, "px 1000 0 5882 0 0 0");
        // Camera frame far outside the correlation window.
        feed(&mut m, "qr 9000 A 640 480 300 220 340 220 340 260 300 260");
        let model = m.tick(9100);
        assert!(model.markers.is_empty());
    }

    #[test]
    fn test_contacts_stamped() {
        let mut m = modeller();
        feed(&mut m, "mt 1000 0 0 0 0 0 0 1 0 0 0 0");
        feed(&mut m, "ct 1000 0 1 0 1");
        let model = m.tick(1000);
        let origin = model
            .radar
            .topology()
            .index_of(&Point::new(0.0, 0.0))
            .unwrap();
        assert!(model.radar.cell(origin).has_contact());
        assert_eq!(model.grid_map[origin], CellState::Contact);
    }

    #[test]
    fn test_inference_gate_cycle() {
        let mut gate = InferenceGate::new(100);
        assert!(gate.try_schedule(0));
        // Already scheduled: further ticks are dropped.
        assert!(!gate.try_schedule(0));
        gate.start();
        assert_eq!(gate.state(), InferenceState::Running);
        assert!(!gate.try_schedule(50));
        gate.finish(50);
        // Inside the minimum interval.
        assert!(!gate.try_schedule(100));
        assert!(gate.try_schedule(151));
    }
}
