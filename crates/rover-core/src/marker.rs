//! Labelled-marker map: recognised visual markers located in the world
//! frame by correlating camera frames with time-adjacent range readings.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geometry::{Angle, Point, Region};
use crate::msg::{CameraMessage, ProxyMessage};
use crate::status::RobotSpec;

/// Minimum bearing change between consecutive camera frames; below this
/// (and with the same code) the frame is treated as no-change.
const MIN_BEARING_CHANGE_SIN: f64 = 0.017_452_406_437_283_512; // sin 1°

/// One recognised marker. Removed from the map once its weight decays
/// to or below zero.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LabelMarker {
    pub label: String,
    pub location: Point,
    pub weight: f64,
    pub marker_time: i64,
    pub clean_time: i64,
}

/// Marker registry keyed by label.
pub type MarkerMap = HashMap<String, LabelMarker>;

/// A camera frame paired with the range reading taken in the same
/// robot-clock window.
#[derive(Clone, Debug, PartialEq)]
pub struct CorrelatedCameraEvent {
    pub camera: CameraMessage,
    pub proxy: ProxyMessage,
}

impl CorrelatedCameraEvent {
    /// The correlation gate: the camera frame must follow the range
    /// reading within the interval.
    pub fn admissible(&self, correlation_interval: i64) -> bool {
        let dt = self.camera.remote_time - self.proxy.remote_time;
        (0..=correlation_interval).contains(&dt)
    }
}

/// Marker locator parameters. Times in milliseconds, distances in
/// metres.
#[derive(Clone, Debug)]
pub struct MarkerParams {
    /// Maximum camera-to-proxy time gap for correlation.
    pub correlation_interval: i64,
    /// EMA time constant for location smoothing.
    pub location_decay: f64,
    /// Cleaning weight decay constant.
    pub clean_decay: f64,
    /// Physical marker edge size.
    pub marker_size: f64,
    /// Unknown events required before a cleaning pass.
    pub min_number_events: u32,
}

impl Default for MarkerParams {
    fn default() -> Self {
        Self {
            correlation_interval: 500,
            location_decay: 60_000.0,
            clean_decay: 30_000.0,
            marker_size: 0.2,
            min_number_events: 3,
        }
    }
}

/// Maintains the labelled-marker map from correlated camera events.
///
/// Besides the registry it carries one small mutable status: the count of
/// consecutive unknown-code events and the previous camera frame, used by
/// the sticky-frame edge policy.
#[derive(Clone, Debug)]
pub struct MarkerLocator {
    params: MarkerParams,
    markers: MarkerMap,
    unknown_events: u32,
    prev_camera: Option<CameraMessage>,
}

impl MarkerLocator {
    pub fn new(params: MarkerParams) -> Self {
        Self {
            params,
            markers: MarkerMap::new(),
            unknown_events: 0,
            prev_camera: None,
        }
    }

    pub fn params(&self) -> &MarkerParams {
        &self.params
    }

    pub fn markers(&self) -> &MarkerMap {
        &self.markers
    }

    pub fn unknown_event_count(&self) -> u32 {
        self.unknown_events
    }

    /// Feed one correlated camera event at host-clock time `t`.
    pub fn on_event(&mut self, event: &CorrelatedCameraEvent, spec: &RobotSpec, t: i64) {
        if !event.admissible(self.params.correlation_interval) {
            return;
        }
        if self.is_sticky_frame(&event.camera, spec) {
            return;
        }
        self.prev_camera = Some(event.camera.clone());

        let camera_location = event.proxy.location();
        let yaw = event.proxy.robot_direction();
        let offset = event.camera.offset_angle(spec.camera_angular_ratio);
        let azimuth = yaw.add(&offset);
        let distance = event.proxy.echo_distance();
        let base = if distance > 0.0 {
            distance
        } else {
            spec.max_radar_distance
        };
        let reach = base + self.params.marker_size / 2.0;
        let beta = spec.receptive_angle;
        let beta_narrow = spec.camera_half_view.narrower(beta);

        if distance <= 0.0 {
            // No echo: nothing in the receptive cone, decay whatever the
            // map claims is there.
            let region = cone(&camera_location, &azimuth, reach, &beta);
            self.clean_area(&region, t);
            self.unknown_events = 0;
        } else if event.camera.recognised() && within(&offset, &beta_narrow) {
            let location = camera_location
                + azimuth.vector() * (distance + self.params.marker_size / 2.0);
            self.observe(&event.camera.qr_code, location, t);
            let region = cone(&camera_location, &azimuth, reach, &beta_narrow);
            self.clean_area(&region, t);
        } else {
            self.unknown_events += 1;
            if self.unknown_events >= self.params.min_number_events {
                // Pull the cleaning cone in by a few degrees to suppress
                // boundary flicker.
                let reduced =
                    Angle::from_rad((beta_narrow.to_rad() - 3f64.to_radians()).max(0.0));
                let region = cone(&camera_location, &azimuth, reach, &reduced);
                self.clean_area(&region, t);
                self.unknown_events = 0;
            }
        }
    }

    /// Insert or smooth one recognised marker sighting.
    ///
    /// An existing marker's location moves by the exponential moving
    /// average `γ·old + (1−γ)·new` with `γ = e^(−dt/location_decay)`;
    /// its weight snaps back to 1.
    pub fn observe(&mut self, label: &str, location: Point, t: i64) {
        match self.markers.get_mut(label) {
            Some(marker) => {
                let dt = (t - marker.marker_time) as f64;
                let gamma = (-dt / self.params.location_decay).exp();
                marker.location = Point::new(
                    gamma * marker.location.x + (1.0 - gamma) * location.x,
                    gamma * marker.location.y + (1.0 - gamma) * location.y,
                );
                marker.weight = 1.0;
                marker.marker_time = t;
                marker.clean_time = t;
            }
            None => {
                debug!(label, x = location.x, y = location.y, "new marker");
                self.markers.insert(
                    label.to_string(),
                    LabelMarker {
                        label: label.to_string(),
                        location,
                        weight: 1.0,
                        marker_time: t,
                        clean_time: t,
                    },
                );
            }
        }
    }

    /// Decay every marker inside the region; drop those whose weight
    /// reaches zero, stamp `clean_time` on the survivors.
    pub fn clean_area(&mut self, region: &Region, t: i64) {
        let clean_decay = self.params.clean_decay;
        self.markers.retain(|label, marker| {
            if !region.contains(&marker.location) {
                return true;
            }
            let alpha = ((t - marker.clean_time) as f64 / clean_decay).clamp(0.0, 1.0);
            let weight = -(1.0 + marker.weight) * alpha + marker.weight;
            if weight <= 0.0 {
                debug!(label = label.as_str(), "marker decayed away");
                false
            } else {
                marker.weight = weight;
                marker.clean_time = t;
                true
            }
        });
    }

    /// Sticky-frame policy: an event identical to the previous one, or
    /// with a bearing change below one degree and the same code, carries
    /// no new information.
    fn is_sticky_frame(&self, camera: &CameraMessage, spec: &RobotSpec) -> bool {
        let Some(prev) = &self.prev_camera else {
            return false;
        };
        if prev == camera {
            return true;
        }
        if prev.qr_code != camera.qr_code {
            return false;
        }
        let delta = camera
            .offset_angle(spec.camera_angular_ratio)
            .sub(&prev.offset_angle(spec.camera_angular_ratio));
        delta.sin().abs() < MIN_BEARING_CHANGE_SIN
    }
}

fn cone(apex: &Point, direction: &Angle, reach: f64, half_angle: &Angle) -> Region {
    Region::wedge(apex, direction, half_angle).and(Region::circle(apex, reach))
}

fn within(offset: &Angle, half_view: &Angle) -> bool {
    offset.to_rad().abs() <= half_view.to_rad().abs()
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn locator() -> MarkerLocator {
        MarkerLocator::new(MarkerParams::default())
    }

    fn camera(t: i64, code: &str, mean_x: f64) -> CameraMessage {
        let x = mean_x;
        CameraMessage {
            remote_time: t,
            qr_code: code.to_string(),
            width: 640.0,
            height: 480.0,
            points: [
                [x - 20.0, 220.0],
                [x + 20.0, 220.0],
                [x + 20.0, 260.0],
                [x - 20.0, 260.0],
            ],
        }
    }

    fn proxy(t: i64, echo_delay_us: i64) -> ProxyMessage {
        ProxyMessage {
            remote_time: t,
            sensor_dir_deg: 0,
            echo_delay_us,
            x_pulses: 0.0,
            y_pulses: 0.0,
            yaw_deg: 0,
        }
    }

    #[test]
    fn test_correlation_gate() {
        let ev = CorrelatedCameraEvent {
            camera: camera(1200, "A", 320.0),
            proxy: proxy(1000, 5882),
        };
        assert!(ev.admissible(500));
        assert!(!ev.admissible(100));

        // Camera before proxy is never admissible.
        let ev = CorrelatedCameraEvent {
            camera: camera(900, "A", 320.0),
            proxy: proxy(1000, 5882),
        };
        assert!(!ev.admissible(500));
    }

    #[test]
    fn test_recognised_marker_inserted() {
        let mut loc = locator();
        let spec = RobotSpec::default();
        let ev = CorrelatedCameraEvent {
            camera: camera(1100, "A", 320.0),
            proxy: proxy(1000, 5882), // one metre
        };
        loc.on_event(&ev, &spec, 5000);

        let marker = loc.markers().get("A").expect("marker inserted");
        // Dead ahead at 1 m plus half the marker size.
        assert!((marker.location.x).abs() < 1e-9);
        assert!((marker.location.y - 1.1).abs() < 1e-9);
        assert_eq!(marker.weight, 1.0);
        assert_eq!(marker.marker_time, 5000);
    }

    #[test]
    fn test_location_smoothing_halfway() {
        let mut loc = locator();
        loc.observe("A", Point::new(1.0, 0.0), 0);
        // dt = location_decay · ln 2 makes γ exactly one half.
        let t = (loc.params().location_decay * 2f64.ln()).round() as i64;
        loc.observe("A", Point::new(1.10, 0.0), t);

        let marker = &loc.markers()["A"];
        assert!((marker.location.x - 1.05).abs() < 1e-4);
        assert!(marker.location.y.abs() < 1e-9);
        assert_eq!(marker.weight, 1.0);
        assert_eq!(marker.marker_time, t);
    }

    #[test]
    fn test_clean_area_untouched_outside() {
        let mut loc = locator();
        loc.observe("A", Point::new(1.0, 0.0), 0);
        let before = loc.markers().clone();
        // Region far away from the marker.
        let region = Region::circle(&Point::new(-5.0, -5.0), 1.0);
        loc.clean_area(&region, 100_000);
        assert_eq!(loc.markers(), &before);
    }

    #[test]
    fn test_clean_area_drops_stale_marker() {
        let mut loc = locator();
        loc.observe("A", Point::new(1.0, 0.0), 0);
        let t = loc.params().clean_decay as i64 + 1;
        let region = Region::circle(&Point::new(1.0, 0.0), 0.5);
        loc.clean_area(&region, t);
        assert!(loc.markers().is_empty());
    }

    #[test]
    fn test_no_echo_event_cleans_cone() {
        let mut loc = locator();
        let spec = RobotSpec::default();
        loc.observe("A", Point::new(0.0, 1.0), 0);

        // Stale marker dead ahead, then a no-echo frame looking at it.
        let t = loc.params().clean_decay as i64 + 1;
        let ev = CorrelatedCameraEvent {
            camera: camera(t + 100, "?", 320.0),
            proxy: proxy(t, 0),
        };
        loc.on_event(&ev, &spec, t);
        assert!(loc.markers().is_empty());
        assert_eq!(loc.unknown_event_count(), 0);
    }

    #[test]
    fn test_unknown_events_counted_to_threshold() {
        let mut loc = locator();
        let spec = RobotSpec::default();
        // Unrecognised code with an echo; vary the bearing so the
        // sticky-frame policy does not eat the events.
        for i in 0..loc.params().min_number_events {
            let ev = CorrelatedCameraEvent {
                camera: camera(1100 + i as i64, "?", 200.0 + 40.0 * i as f64),
                proxy: proxy(1000 + i as i64, 5882),
            };
            loc.on_event(&ev, &spec, 5000 + i as i64);
        }
        // Counter wrapped back to zero after the cleaning pass.
        assert_eq!(loc.unknown_event_count(), 0);
    }

    #[test]
    fn test_sticky_frame_skipped() {
        let mut loc = locator();
        let spec = RobotSpec::default();
        let ev = CorrelatedCameraEvent {
            camera: camera(1100, "A", 320.0),
            proxy: proxy(1000, 5882),
        };
        loc.on_event(&ev, &spec, 5000);
        let first = loc.markers()["A"].clone();

        // Identical frame later: ignored entirely.
        loc.on_event(&ev, &spec, 9000);
        assert_eq!(loc.markers()["A"], first);
    }
}
