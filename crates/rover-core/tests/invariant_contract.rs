//! Randomized invariant checks over the geometry kernel, the grid walk,
//! the radar evidence weights and the marker cleaning rule.

use nalgebra::Point2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rover_core::geometry::{Angle, Line, Point, Region, Vector, DEG0, UNIT_TOLERANCE};
use rover_core::grid::{segment, GridTopology};
use rover_core::marker::{MarkerLocator, MarkerParams};
use rover_core::radar::MapCell;

fn rng() -> StdRng {
    StdRng::seed_from_u64(0x5eed_cafe)
}

#[test]
fn angles_stay_on_the_unit_circle() {
    let mut rng = rng();
    for _ in 0..1000 {
        let a = Angle::from_rad(rng.gen_range(-10.0..10.0));
        assert!((a.x * a.x + a.y * a.y - 1.0).abs() < UNIT_TOLERANCE);

        let b = Angle::from_rad(rng.gen_range(-10.0..10.0));
        let sum = a.add(&b);
        assert!((sum.x * sum.x + sum.y * sum.y - 1.0).abs() < 1e-9);

        let zero = a.add(&a.neg());
        assert!((zero.x - DEG0.x).abs() < 1e-9);
        assert!((zero.y - DEG0.y).abs() < 1e-9);
    }
}

#[test]
fn radar_weights_never_leave_the_unit_interval() {
    let mut rng = rng();
    for _ in 0..200 {
        let mut cell = MapCell::unknown(Point2::new(0.0, 0.0));
        let decay: i64 = rng.gen_range(1..500_000);
        let mut t: i64 = rng.gen_range(0..10_000);
        for _ in 0..100 {
            t += rng.gen_range(0..2 * decay);
            cell = cell.with_echo(rng.gen_bool(0.5), t, decay);
            cell = cell.with_label(rng.gen_bool(0.5), t, decay);
            assert!((-1.0..=1.0).contains(&cell.echo_weight), "{cell:?}");
            assert!((-1.0..=1.0).contains(&cell.label_weight), "{cell:?}");
        }
    }
}

#[test]
fn grid_indices_roundtrip_through_cell_centres() {
    let mut rng = rng();
    for _ in 0..100 {
        let topology = GridTopology::new(
            Point2::new(rng.gen_range(-10.0..10.0), rng.gen_range(-10.0..10.0)),
            rng.gen_range(1..40),
            rng.gen_range(1..40),
            rng.gen_range(0.05..1.0),
        );
        for i in 0..topology.n() {
            assert_eq!(topology.index_of(&topology.location_of(i)), Some(i));
        }
    }
}

#[test]
fn line_intersections_lie_on_both_lines() {
    let mut rng = rng();
    let mut checked = 0;
    while checked < 500 {
        let l1 = Line::new(
            Point::new(rng.gen_range(-5.0..5.0), rng.gen_range(-5.0..5.0)),
            Vector::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)),
        );
        let l2 = Line::new(
            Point::new(rng.gen_range(-5.0..5.0), rng.gen_range(-5.0..5.0)),
            Vector::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)),
        );
        if l1.dir.norm() < 0.1 || l2.dir.norm() < 0.1 {
            continue;
        }
        let Some(p) = l1.intersect(&l2) else {
            continue;
        };
        // Nearly-parallel pairs amplify round-off; keep the generic ones.
        let d1 = l1.dir.normalize();
        let d2 = l2.dir.normalize();
        if (d1.x * d2.y - d1.y * d2.x).abs() < 0.1 {
            continue;
        }
        assert!(l1.signed_distance(&p).abs() < 1e-9);
        assert!(l2.signed_distance(&p).abs() < 1e-9);
        checked += 1;
    }
}

/// Brute-force reference for the grid walk: every cell whose closed
/// region meets the open segment, ordered by entry parameter.
fn segment_reference(topology: &GridTopology, p0: &Point, p1: &Point) -> Vec<usize> {
    let mut hits: Vec<(f64, usize)> = Vec::new();
    let d = p1 - p0;
    for i in 0..topology.n() {
        let c = topology.location_of(i);
        let h = topology.cell_size() / 2.0;
        let (mut t0, mut t1) = (0.0f64, 1.0f64);
        let mut ok = true;
        for (start, delta, lo, hi) in [
            (p0.x, d.x, c.x - h, c.x + h),
            (p0.y, d.y, c.y - h, c.y + h),
        ] {
            if delta.abs() < f64::EPSILON {
                if start < lo || start > hi {
                    ok = false;
                    break;
                }
            } else {
                let (a, b) = ((lo - start) / delta, (hi - start) / delta);
                let (a, b) = if a <= b { (a, b) } else { (b, a) };
                t0 = t0.max(a);
                t1 = t1.min(b);
                if t0 > t1 {
                    ok = false;
                    break;
                }
            }
        }
        // The open segment excludes the endpoints themselves.
        if ok && t1 > 0.0 && t0 < 1.0 {
            hits.push((t0, i));
        }
    }
    hits.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
    hits.into_iter().map(|(_, i)| i).collect()
}

#[test]
fn segment_walk_matches_the_closed_region_reference() {
    let mut rng = rng();
    let topology = GridTopology::new(Point2::new(0.0, 0.0), 15, 15, 0.25);
    let half_w = 15.0 * 0.25 / 2.0;
    for _ in 0..300 {
        let p0 = Point::new(
            rng.gen_range(-half_w..half_w),
            rng.gen_range(-half_w..half_w),
        );
        let p1 = Point::new(
            rng.gen_range(-half_w..half_w),
            rng.gen_range(-half_w..half_w),
        );
        if (p1 - p0).norm() < 1e-6 {
            continue;
        }
        let walked = segment(&topology, &p0, &p1);
        let reference = segment_reference(&topology, &p0, &p1);
        assert_eq!(walked, reference, "p0 {p0:?} p1 {p1:?}");
    }
}

#[test]
fn cleaning_outside_the_region_changes_nothing() {
    let mut rng = rng();
    for _ in 0..100 {
        let mut locator = MarkerLocator::new(MarkerParams::default());
        for i in 0..5 {
            locator.observe(
                &format!("m{i}"),
                Point::new(rng.gen_range(-2.0..2.0), rng.gen_range(-2.0..2.0)),
                rng.gen_range(0..1000),
            );
        }
        let before = locator.markers().clone();
        // A region that cannot contain any of them.
        let region = Region::circle(&Point::new(100.0, 100.0), 1.0);
        locator.clean_area(&region, 10_000_000);
        assert_eq!(locator.markers(), &before);
    }
}

#[test]
fn cleaning_past_the_decay_drops_the_marker() {
    let params = MarkerParams::default();
    let clean_decay = params.clean_decay as i64;
    let mut locator = MarkerLocator::new(params);
    locator.observe("stale", Point::new(1.0, 1.0), 0);

    let region = Region::circle(&Point::new(1.0, 1.0), 0.5);
    locator.clean_area(&region, clean_decay);
    // α = 1 drives the weight to −1, which removes the marker.
    assert!(locator.markers().is_empty());
}
