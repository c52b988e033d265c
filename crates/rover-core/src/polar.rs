//! Polar map: a short-lived egocentric sector view derived from the
//! radar map for local obstacle avoidance.

use std::f64::consts::TAU;

use serde::{Deserialize, Serialize};

use crate::geometry::{square_arc_interval, Angle, Point};
use crate::radar::RadarMap;

/// One egocentric sector: unknown, known-empty at its nearest empty
/// point, or hindered at its nearest obstacle point.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum CircularSector {
    Unknown,
    Empty { timestamp: i64, location: Point },
    Hindered { timestamp: i64, location: Point },
}

impl CircularSector {
    pub fn is_unknown(&self) -> bool {
        matches!(self, CircularSector::Unknown)
    }

    pub fn is_known(&self) -> bool {
        !self.is_unknown()
    }

    pub fn is_hindered(&self) -> bool {
        matches!(self, CircularSector::Hindered { .. })
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, CircularSector::Empty { .. })
    }

    /// Evidence timestamp, 0 for unknown sectors.
    pub fn timestamp(&self) -> i64 {
        match self {
            CircularSector::Unknown => 0,
            CircularSector::Empty { timestamp, .. } => *timestamp,
            CircularSector::Hindered { timestamp, .. } => *timestamp,
        }
    }

    pub fn location(&self) -> Option<Point> {
        match self {
            CircularSector::Unknown => None,
            CircularSector::Empty { location, .. } => Some(*location),
            CircularSector::Hindered { location, .. } => Some(*location),
        }
    }

    /// Distance of the classified point from `p`, if any.
    pub fn distance_from(&self, p: &Point) -> Option<f64> {
        self.location().map(|l| (l - p).norm())
    }
}

/// Egocentric sector view. Sector `i` covers the angle interval
/// `[i·2π/K − π/K, i·2π/K + π/K)` relative to the map direction.
#[derive(Clone, Debug)]
pub struct PolarMap {
    sectors: Vec<CircularSector>,
    centre: Point,
    direction: Angle,
}

impl PolarMap {
    /// An all-unknown map with `num_sectors` sectors.
    pub fn unknown(num_sectors: usize, centre: Point, direction: Angle) -> Self {
        assert!(num_sectors > 0, "polar map needs at least one sector");
        Self {
            sectors: vec![CircularSector::Unknown; num_sectors],
            centre,
            direction,
        }
    }

    pub fn sectors(&self) -> &[CircularSector] {
        &self.sectors
    }

    pub fn sector(&self, index: usize) -> &CircularSector {
        &self.sectors[index]
    }

    pub fn num_sectors(&self) -> usize {
        self.sectors.len()
    }

    pub fn centre(&self) -> Point {
        self.centre
    }

    pub fn direction(&self) -> Angle {
        self.direction
    }

    /// Angular width of one sector in radians.
    pub fn sector_angle(&self) -> f64 {
        TAU / self.sectors.len() as f64
    }

    /// Absolute bearing of the middle of sector `index`.
    pub fn sector_direction(&self, index: usize) -> Angle {
        self.direction
            .add(&Angle::from_rad(index as f64 * self.sector_angle()))
    }

    /// Sector covering the absolute bearing.
    pub fn sector_index(&self, bearing: &Angle) -> usize {
        let k = self.sectors.len() as i64;
        let rel = bearing.sub(&self.direction).to_rad();
        let i = (rel / self.sector_angle()).round() as i64;
        (i.rem_euclid(k)) as usize
    }
}

// ─── Derivation ──────────────────────────────────────────────────────

/// Widening factor applied to the sector half-width to compensate for
/// cell-corner aliasing.
const SECTOR_WIDENING: f64 = 1.25;

#[derive(Clone, Copy, Debug)]
struct Candidate {
    distance: f64,
    timestamp: i64,
    location: Point,
}

#[derive(Clone, Copy, Debug, Default)]
struct SectorScan {
    hindered: Option<Candidate>,
    empty: Option<Candidate>,
    unknown: Option<Candidate>,
}

fn keep_nearest(slot: &mut Option<Candidate>, c: Candidate) {
    match slot {
        Some(prev) if prev.distance <= c.distance => {}
        _ => *slot = Some(c),
    }
}

/// Derives the egocentric sector view from a radar map.
#[derive(Clone, Debug)]
pub struct PolarModeller {
    pub num_sectors: usize,
    /// Radius of the derived view.
    pub max_distance: f64,
    /// Cells nearer than `max(min_distance, cell_size)` cannot be
    /// resolved and are rejected.
    pub min_distance: f64,
}

impl PolarModeller {
    pub fn new(num_sectors: usize, max_distance: f64, min_distance: f64) -> Self {
        Self {
            num_sectors,
            max_distance,
            min_distance,
        }
    }

    /// Build the polar view of `radar` centred on `centre` with sector 0
    /// along `direction`.
    pub fn derive(&self, radar: &RadarMap, centre: Point, direction: Angle) -> PolarMap {
        let mut polar = PolarMap::unknown(self.num_sectors, centre, direction);
        let cell_size = radar.topology().cell_size();
        let threshold = self.min_distance.max(cell_size);
        let widened = Angle::from_rad(polar.sector_angle() / 2.0 * SECTOR_WIDENING);
        let mut scans = vec![SectorScan::default(); self.num_sectors];

        for cell in radar.cells() {
            let offset = cell.location - centre;
            let centre_distance = offset.norm();
            if centre_distance < f64::EPSILON || centre_distance > self.max_distance {
                continue;
            }
            let bearing = Angle::from_vector(&offset);
            let index = polar.sector_index(&bearing);
            let Some((near, _far)) = square_arc_interval(
                &cell.location,
                cell_size,
                &centre,
                &polar.sector_direction(index),
                &widened,
            ) else {
                continue;
            };
            let distance = (near - centre).norm();
            if distance < threshold {
                continue;
            }
            let candidate = Candidate {
                distance,
                timestamp: cell.evidence_time(),
                location: near,
            };
            let scan = &mut scans[index];
            if cell.is_hindered() {
                keep_nearest(&mut scan.hindered, candidate);
            } else if cell.is_empty() {
                keep_nearest(&mut scan.empty, candidate);
            } else {
                keep_nearest(&mut scan.unknown, candidate);
            }
        }

        for (sector, scan) in polar.sectors.iter_mut().zip(&scans) {
            *sector = resolve(scan);
        }
        polar
    }
}

/// Priority rule: hindered dominates; an empty classification only
/// stands when no unknown cell is nearer than the nearest empty one.
fn resolve(scan: &SectorScan) -> CircularSector {
    if let Some(h) = scan.hindered {
        return CircularSector::Hindered {
            timestamp: h.timestamp,
            location: h.location,
        };
    }
    match (scan.empty, scan.unknown) {
        (Some(e), Some(u)) if u.distance < e.distance => CircularSector::Unknown,
        (Some(e), _) => CircularSector::Empty {
            timestamp: e.timestamp,
            location: e.location,
        },
        _ => CircularSector::Unknown,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{DEG0, DEG90};
    use crate::grid::GridTopology;
    use crate::radar::{RadarMap, RadarModeller, RadarParams, SensorSignal};

    fn radar_with_echo(distance: f64) -> RadarMap {
        let topology = GridTopology::new(Point::new(0.0, 0.0), 21, 21, 0.2);
        let map = RadarMap::new(topology);
        let modeller = RadarModeller::new(RadarParams::default());
        modeller.apply_signal(
            &map,
            &SensorSignal {
                location: Point::new(0.0, 0.0),
                direction: DEG0,
                distance,
                timestamp: 1000,
                echo: true,
            },
        )
    }

    #[test]
    fn test_sector_index_wraps() {
        let polar = PolarMap::unknown(12, Point::new(0.0, 0.0), DEG0);
        assert_eq!(polar.sector_index(&DEG0), 0);
        assert_eq!(polar.sector_index(&DEG90), 3);
        assert_eq!(polar.sector_index(&Angle::from_deg(-30.0)), 11);
        assert_eq!(polar.sector_index(&Angle::from_deg(-14.0)), 0);
    }

    #[test]
    fn test_sector_direction_relative_to_map() {
        let polar = PolarMap::unknown(12, Point::new(0.0, 0.0), DEG90);
        assert!((polar.sector_direction(0).to_deg() - 90.0).abs() < 1e-9);
        assert!((polar.sector_direction(3).to_deg() - 180.0).abs() < 1e-9);
    }

    #[test]
    fn test_derive_reports_obstacle_ahead() {
        let radar = radar_with_echo(1.0);
        let modeller = PolarModeller::new(24, 3.0, 0.1);
        let polar = modeller.derive(&radar, Point::new(0.0, 0.0), DEG0);

        let ahead = polar.sector(0);
        assert!(ahead.is_hindered());
        let d = ahead.distance_from(&polar.centre()).unwrap();
        assert!((0.7..=1.1).contains(&d), "distance {d}");
    }

    #[test]
    fn test_unknown_sector_without_evidence() {
        let radar = radar_with_echo(1.0);
        let modeller = PolarModeller::new(24, 3.0, 0.1);
        let polar = modeller.derive(&radar, Point::new(0.0, 0.0), DEG0);
        // Nothing was ever sensed behind the robot.
        let rear = polar.sector(12);
        assert!(rear.is_unknown());
        assert_eq!(rear.timestamp(), 0);
    }
}
