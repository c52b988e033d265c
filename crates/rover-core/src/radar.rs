//! Radar map: a Cartesian occupancy grid with decaying echo, contact and
//! label evidence per cell.
//!
//! Every update is functional: modellers take a map and return a new one.
//! Cells are held behind an `Arc` so snapshots handed to observers stay
//! cheap; a mutation clones the cell array once.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::geometry::{square_arc_interval, Angle, Point, Region};
use crate::grid::{segment, GridTopology};

/// One ranging shot in world coordinates. With `echo = false` the
/// distance is the maximum ray length instead of a target range.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SensorSignal {
    pub location: Point,
    pub direction: Angle,
    pub distance: f64,
    pub timestamp: i64,
    pub echo: bool,
}

// ─── Map cells ───────────────────────────────────────────────────────

/// One radar cell. Times are host-clock milliseconds, 0 meaning the
/// channel has never been touched; weights are decaying evidence counters
/// in `[-1, 1]` whose sign is the polarity and magnitude the confidence.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MapCell {
    pub location: Point,
    pub echo_time: i64,
    pub echo_weight: f64,
    pub contact_time: i64,
    pub label_time: i64,
    pub label_weight: f64,
}

fn decayed(w: f64, target: f64, alpha: f64) -> f64 {
    (target - w) * alpha + w
}

impl MapCell {
    /// A never-touched cell at the given location.
    pub fn unknown(location: Point) -> Self {
        Self {
            location,
            echo_time: 0,
            echo_weight: 0.0,
            contact_time: 0,
            label_time: 0,
            label_weight: 0.0,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.echo_time == 0 && self.contact_time == 0
    }

    pub fn is_known(&self) -> bool {
        !self.is_unknown()
    }

    pub fn is_anechoic(&self) -> bool {
        self.echo_time > 0 && self.echo_weight <= 0.0
    }

    pub fn is_echogenic(&self) -> bool {
        self.echo_time > 0 && self.echo_weight > 0.0
    }

    pub fn has_contact(&self) -> bool {
        self.contact_time > 0
    }

    /// Echogenic or in contact.
    pub fn is_hindered(&self) -> bool {
        self.is_echogenic() || self.has_contact()
    }

    /// Known and not hindered.
    pub fn is_empty(&self) -> bool {
        self.is_known() && !self.is_hindered()
    }

    pub fn is_labeled(&self) -> bool {
        self.label_time > 0 && self.label_weight > 0.0
    }

    /// Latest evidence time across the echo and contact channels.
    pub fn evidence_time(&self) -> i64 {
        self.echo_time.max(self.contact_time)
    }

    /// Fold one echo observation into the cell. An unknown channel is
    /// seeded with the polarity; otherwise the weight slides towards it
    /// by `min((t − t_prev)/decay, 1)`.
    pub fn with_echo(mut self, positive: bool, t: i64, decay: i64) -> Self {
        let target = if positive { 1.0 } else { -1.0 };
        if self.echo_time == 0 {
            self.echo_weight = target;
        } else {
            let alpha = ((t - self.echo_time) as f64 / decay as f64).clamp(0.0, 1.0);
            self.echo_weight = decayed(self.echo_weight, target, alpha);
        }
        self.echo_time = t;
        self
    }

    /// Fold one label observation into the cell, same rule as the echo
    /// channel.
    pub fn with_label(mut self, positive: bool, t: i64, decay: i64) -> Self {
        let target = if positive { 1.0 } else { -1.0 };
        if self.label_time == 0 {
            self.label_weight = target;
        } else {
            let alpha = ((t - self.label_time) as f64 / decay as f64).clamp(0.0, 1.0);
            self.label_weight = decayed(self.label_weight, target, alpha);
        }
        self.label_time = t;
        self
    }

    /// Stamp a bumper contact.
    pub fn with_contact(mut self, t: i64) -> Self {
        self.contact_time = t;
        self
    }

    /// Reset channels whose evidence has outlived its persistence. A cell
    /// with both echo and contact reset reverts to unknown.
    pub fn cleaned(mut self, t: i64, echo_persistence: i64, contact_persistence: i64) -> Self {
        if self.echo_time != 0 && self.echo_time < t - echo_persistence {
            self.echo_time = 0;
            self.echo_weight = 0.0;
        }
        if self.contact_time != 0 && self.contact_time < t - contact_persistence {
            self.contact_time = 0;
        }
        if self.label_time != 0 && self.label_time < t - echo_persistence {
            self.label_time = 0;
            self.label_weight = 0.0;
        }
        self
    }

    /// Square-arc receptive-wedge update: classify the cell by where the
    /// ray length falls against the wedge's `(near, far)` crossing of
    /// this cell.
    pub fn arc_updated(
        self,
        cell_size: f64,
        signal: &SensorSignal,
        half_angle: &Angle,
        decay: i64,
        max_distance: f64,
    ) -> Self {
        let Some((near, far)) = square_arc_interval(
            &self.location,
            cell_size,
            &signal.location,
            &signal.direction,
            half_angle,
        ) else {
            return self;
        };
        let near_d = (near - signal.location).norm();
        let far_d = (far - signal.location).norm();
        let ray = if signal.echo {
            signal.distance
        } else {
            max_distance
        };
        if near_d > ray {
            return self;
        }
        if signal.echo && signal.distance <= far_d {
            self.with_echo(true, signal.timestamp, decay)
        } else {
            self.with_echo(false, signal.timestamp, decay)
        }
    }
}

// ─── Radar map ───────────────────────────────────────────────────────

/// The occupancy grid: topology, one [`MapCell`] per grid cell, and the
/// timestamp of the last cleaning pass.
#[derive(Clone, Debug)]
pub struct RadarMap {
    topology: GridTopology,
    cells: Arc<Vec<MapCell>>,
    clean_timestamp: i64,
}

impl RadarMap {
    /// An all-unknown map over the topology.
    pub fn new(topology: GridTopology) -> Self {
        let cells = (0..topology.n())
            .map(|i| MapCell::unknown(topology.location_of(i)))
            .collect();
        Self {
            topology,
            cells: Arc::new(cells),
            clean_timestamp: 0,
        }
    }

    /// Rebuild a map from persisted cells. The cell count must match the
    /// topology.
    pub fn from_cells(topology: GridTopology, cells: Vec<MapCell>, clean_timestamp: i64) -> Self {
        assert_eq!(cells.len(), topology.n(), "cell count must match topology");
        Self {
            topology,
            cells: Arc::new(cells),
            clean_timestamp,
        }
    }

    pub fn topology(&self) -> &GridTopology {
        &self.topology
    }

    pub fn cells(&self) -> &[MapCell] {
        &self.cells
    }

    pub fn cell(&self, index: usize) -> &MapCell {
        &self.cells[index]
    }

    pub fn clean_timestamp(&self) -> i64 {
        self.clean_timestamp
    }

    /// Apply `f` to the cells at `indices` and return the new map.
    /// Out-of-range indices are ignored.
    pub fn map<I, F>(&self, indices: I, mut f: F) -> Self
    where
        I: IntoIterator<Item = usize>,
        F: FnMut(MapCell) -> MapCell,
    {
        let mut cells = self.cells.as_ref().clone();
        for i in indices {
            if let Some(c) = cells.get_mut(i) {
                *c = f(*c);
            }
        }
        Self {
            topology: self.topology,
            cells: Arc::new(cells),
            clean_timestamp: self.clean_timestamp,
        }
    }

    /// Apply `f` to every cell.
    pub fn map_all<F>(&self, f: F) -> Self
    where
        F: FnMut(MapCell) -> MapCell,
    {
        self.map(0..self.topology.n(), f)
    }

    /// Indices of the cells whose centre satisfies the area predicate.
    pub fn filter_by_area<'a>(&'a self, region: &'a Region) -> impl Iterator<Item = usize> + 'a {
        self.cells
            .iter()
            .enumerate()
            .filter(move |(_, c)| region.contains(&c.location))
            .map(|(i, _)| i)
    }

    /// Locations of every hindered cell.
    pub fn hindered_locations(&self) -> Vec<Point> {
        self.cells
            .iter()
            .filter(|c| c.is_hindered())
            .map(|c| c.location)
            .collect()
    }

    fn with_clean_timestamp(mut self, t: i64) -> Self {
        self.clean_timestamp = t;
        self
    }
}

// ─── Modeller ────────────────────────────────────────────────────────

/// Which beam kernel folds ranging signals into the map.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeamModel {
    /// Rasterised ray sweep: anechoic along the open segment, echogenic
    /// at the ping cell. The default.
    #[default]
    Ray,
    /// Square-arc receptive wedge, for heads with significant beam
    /// divergence.
    Arc,
}

/// Radar modelling parameters. Times in milliseconds, distances in
/// metres.
#[derive(Clone, Debug)]
pub struct RadarParams {
    /// Evidence weight decay constant.
    pub decay: i64,
    /// Minimum interval between cleaning passes.
    pub clean_interval: i64,
    /// Echo evidence lifetime.
    pub echo_persistence: i64,
    /// Contact evidence lifetime.
    pub contact_persistence: i64,
    /// Maximum ray length for no-echo sweeps.
    pub max_radar_distance: f64,
    /// Half-angle of the ultrasonic beam.
    pub receptive_angle: Angle,
    /// Radius of the bumper contact half-disk.
    pub contact_radius: f64,
    pub beam: BeamModel,
}

impl Default for RadarParams {
    fn default() -> Self {
        Self {
            decay: 300_000,
            clean_interval: 30_000,
            echo_persistence: 300_000,
            contact_persistence: 300_000,
            max_radar_distance: 3.0,
            receptive_angle: Angle::from_deg(15.0),
            contact_radius: 0.3,
            beam: BeamModel::Ray,
        }
    }
}

/// Applies ranging, contact and cleaning events to a [`RadarMap`].
#[derive(Clone, Debug)]
pub struct RadarModeller {
    params: RadarParams,
}

impl RadarModeller {
    pub fn new(params: RadarParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &RadarParams {
        &self.params
    }

    /// Fold one ranging signal into the map with the configured beam
    /// kernel.
    pub fn apply_signal(&self, map: &RadarMap, signal: &SensorSignal) -> RadarMap {
        match self.params.beam {
            BeamModel::Ray => self.apply_ray(map, signal),
            BeamModel::Arc => self.apply_arc(map, signal),
        }
    }

    fn apply_ray(&self, map: &RadarMap, signal: &SensorSignal) -> RadarMap {
        let ray = if signal.echo {
            signal.distance
        } else {
            self.params.max_radar_distance
        };
        if ray <= 0.0 {
            return map.clone();
        }
        let end = signal.location + signal.direction.vector() * ray;
        let traversed = segment(map.topology(), &signal.location, &end);
        let ping = if signal.echo {
            map.topology().index_of(&end)
        } else {
            None
        };
        let decay = self.params.decay;
        let swept = map.map(
            traversed.into_iter().filter(|i| Some(*i) != ping),
            |c| c.with_echo(false, signal.timestamp, decay),
        );
        match ping {
            Some(i) => swept.map([i], |c| c.with_echo(true, signal.timestamp, decay)),
            None => swept,
        }
    }

    fn apply_arc(&self, map: &RadarMap, signal: &SensorSignal) -> RadarMap {
        let ray = if signal.echo {
            signal.distance
        } else {
            self.params.max_radar_distance
        };
        if ray <= 0.0 {
            return map.clone();
        }
        // Candidate cells: centre within the beam reach plus one cell of
        // slack; the wedge test inside arc_updated does the exact work.
        let cell_size = map.topology().cell_size();
        let bound = Region::circle(&signal.location, ray + cell_size);
        let indices: Vec<usize> = map.filter_by_area(&bound).collect();
        let half_angle = self.params.receptive_angle;
        let decay = self.params.decay;
        let max = self.params.max_radar_distance;
        map.map(indices, |c| {
            c.arc_updated(cell_size, signal, &half_angle, decay, max)
        })
    }

    /// Stamp contact evidence over the half-disk in front of and/or
    /// behind the robot.
    pub fn apply_contact(
        &self,
        map: &RadarMap,
        location: &Point,
        heading: &Angle,
        front: bool,
        rear: bool,
        t: i64,
    ) -> RadarMap {
        let mut out = map.clone();
        let radius = self.params.contact_radius;
        if front {
            let region = Region::circle(location, radius)
                .and(Region::half_plane(location, &heading.vector()));
            let indices: Vec<usize> = out.filter_by_area(&region).collect();
            out = out.map(indices, |c| c.with_contact(t));
        }
        if rear {
            let region = Region::circle(location, radius)
                .and(Region::half_plane(location, &(-heading.vector())));
            let indices: Vec<usize> = out.filter_by_area(&region).collect();
            out = out.map(indices, |c| c.with_contact(t));
        }
        out
    }

    /// Mark label evidence on the cell containing `location`.
    pub fn apply_label(
        &self,
        map: &RadarMap,
        location: &Point,
        positive: bool,
        t: i64,
    ) -> RadarMap {
        match map.topology().index_of(location) {
            Some(i) => map.map([i], |c| c.with_label(positive, t, self.params.decay)),
            None => map.clone(),
        }
    }

    /// Cleaning pass, at most once per `clean_interval`: earlier calls
    /// return the map unchanged.
    pub fn clean(&self, map: &RadarMap, t: i64) -> RadarMap {
        if t < map.clean_timestamp() + self.params.clean_interval {
            return map.clone();
        }
        let echo_p = self.params.echo_persistence;
        let contact_p = self.params.contact_persistence;
        map.map_all(|c| c.cleaned(t, echo_p, contact_p))
            .with_clean_timestamp(t)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::DEG0;

    fn topo() -> GridTopology {
        GridTopology::new(Point::new(0.0, 0.0), 11, 11, 0.2)
    }

    fn modeller() -> RadarModeller {
        RadarModeller::new(RadarParams::default())
    }

    fn signal(distance: f64, t: i64, echo: bool) -> SensorSignal {
        SensorSignal {
            location: Point::new(0.0, 0.0),
            direction: DEG0,
            distance,
            timestamp: t,
            echo,
        }
    }

    #[test]
    fn test_first_echo_marks_sweep_and_ping() {
        let map = RadarMap::new(topo());
        let map = modeller().apply_signal(&map, &signal(0.6, 1000, true));

        let col = 5;
        for row in 5..8 {
            let c = map.cell(row * 11 + col);
            assert!(c.is_anechoic(), "row {row} should be anechoic");
            assert_eq!(c.echo_weight, -1.0);
            assert_eq!(c.echo_time, 1000);
        }
        let ping = map.cell(8 * 11 + col);
        assert!(ping.is_echogenic());
        assert_eq!(ping.echo_weight, 1.0);

        let touched = 4;
        let known = map.cells().iter().filter(|c| c.is_known()).count();
        assert_eq!(known, touched);
    }

    #[test]
    fn test_full_decay_flips_ping_cell() {
        let tau = RadarParams::default().decay;
        let map = RadarMap::new(topo());
        let map = modeller().apply_signal(&map, &signal(0.6, 1000, true));
        let map = modeller().apply_signal(&map, &signal(1.0, 1000 + tau, false));

        let ping = map.cell(8 * 11 + 5);
        assert_eq!(ping.echo_weight, -1.0);
        assert!(ping.is_anechoic());
    }

    #[test]
    fn test_weights_stay_bounded() {
        let m = modeller();
        let mut cell = MapCell::unknown(Point::new(0.0, 0.0));
        let mut t = 1000;
        for i in 0..200 {
            let positive = i % 3 != 0;
            t += (i * 37) % 500_000;
            cell = cell.with_echo(positive, t, m.params().decay);
            assert!((-1.0..=1.0).contains(&cell.echo_weight));
            cell = cell.with_label(!positive, t, m.params().decay);
            assert!((-1.0..=1.0).contains(&cell.label_weight));
        }
    }

    #[test]
    fn test_clean_is_gated_by_interval() {
        let m = modeller();
        let map = RadarMap::new(topo());
        let map = m.apply_signal(&map, &signal(0.6, 1000, true));
        let map = m.clean(&map, 10_000);
        assert_eq!(map.clean_timestamp(), 10_000);

        // Within the interval: unchanged, same timestamp.
        let again = m.clean(&map, 10_000 + m.params().clean_interval - 1);
        assert_eq!(again.clean_timestamp(), 10_000);
        assert_eq!(again.cells(), map.cells());
    }

    #[test]
    fn test_clean_resets_stale_channels() {
        let m = modeller();
        let map = RadarMap::new(topo());
        let map = m.apply_signal(&map, &signal(0.6, 1000, true));
        let t = 1000 + m.params().echo_persistence + m.params().clean_interval + 1;
        let cleaned = m.clean(&map, t);
        assert!(cleaned.cells().iter().all(|c| c.is_unknown()));
    }

    #[test]
    fn test_contact_half_disk() {
        let m = modeller();
        let map = RadarMap::new(topo());
        // Robot at (1.0, 0) facing east; front bumper fired.
        let map = m.apply_contact(
            &map,
            &Point::new(1.0, 0.0),
            &Angle::from_deg(90.0),
            true,
            false,
            2000,
        );
        let hit: Vec<Point> = map
            .cells()
            .iter()
            .filter(|c| c.has_contact())
            .map(|c| c.location)
            .collect();
        // Within 0.3 m and x ≥ 1.0 there are three cell centres on this
        // topology: (1.0, -0.2), (1.0, 0), (1.0, 0.2).
        assert_eq!(hit.len(), 3);
        for p in &hit {
            assert!((p.x - 1.0).abs() < 1e-9);
            assert!(p.y.abs() < 0.3);
        }
    }

    #[test]
    fn test_arc_kernel_head_on() {
        let mut params = RadarParams::default();
        params.beam = BeamModel::Arc;
        let m = RadarModeller::new(params);
        let map = RadarMap::new(topo());
        let map = m.apply_signal(&map, &signal(0.6, 1000, true));

        // The ping cell sits inside the wedge at the ray length.
        let ping = map.cell(8 * 11 + 5);
        assert!(ping.is_echogenic());
        // A cell halfway along the beam is anechoic.
        let mid = map.cell(6 * 11 + 5);
        assert!(mid.is_anechoic());
        // A cell past the ping stays unknown.
        let beyond = map.cell(10 * 11 + 5);
        assert!(beyond.is_unknown());
    }

    #[test]
    fn test_label_channel() {
        let m = modeller();
        let map = RadarMap::new(topo());
        let map = m.apply_label(&map, &Point::new(0.4, 0.4), true, 500);
        let i = map.topology().index_of(&Point::new(0.4, 0.4)).unwrap();
        assert!(map.cell(i).is_labeled());
        assert_eq!(map.cell(i).label_weight, 1.0);
    }

    #[test]
    fn test_filter_by_area() {
        let map = RadarMap::new(topo());
        let region = Region::circle(&Point::new(0.0, 0.0), 0.25);
        let indices: Vec<usize> = map.filter_by_area(&region).collect();
        // Centre cell plus the four orthogonal neighbours.
        assert_eq!(indices.len(), 5);
    }
}
