//! Geometry kernel shared by the radar, polar and marker modellers.
//!
//! Angles are unit 2-vectors `(sin, cos)`; bearing arithmetic is complex
//! multiplication. Area predicates are quadratic inequalities over
//! `(1, x, y, x², y²)` composed into small expression trees.

use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};
use tracing::error;

/// World-frame point in metres.
pub type Point = Point2<f64>;
/// World-frame displacement in metres.
pub type Vector = Vector2<f64>;

/// Tolerance for the unit-norm invariant on [`Angle`].
pub const UNIT_TOLERANCE: f64 = 1e-9;

// ─── Angle ───────────────────────────────────────────────────────────

/// A direction as the unit vector `(sin θ, cos θ)`.
///
/// `θ = 0` points along +y (north) and grows clockwise, so `θ = 90°`
/// points along +x (east). The unit vector of the bearing is exactly
/// `(x, y)` in world coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Angle {
    /// `sin θ` — the east component of the bearing.
    pub x: f64,
    /// `cos θ` — the north component of the bearing.
    pub y: f64,
}

/// 0° — north, exact.
pub const DEG0: Angle = Angle { x: 0.0, y: 1.0 };
/// 90° — east, exact.
pub const DEG90: Angle = Angle { x: 1.0, y: 0.0 };
/// 180° — south, exact.
pub const DEG180: Angle = Angle { x: 0.0, y: -1.0 };
/// 270° — west, exact.
pub const DEG270: Angle = Angle { x: -1.0, y: 0.0 };

impl Angle {
    /// Angle from radians.
    pub fn from_rad(rad: f64) -> Self {
        Self {
            x: rad.sin(),
            y: rad.cos(),
        }
    }

    /// Angle from degrees.
    pub fn from_deg(deg: f64) -> Self {
        Self::from_rad(deg.to_radians())
    }

    /// Angle from raw components.
    ///
    /// Non-unit components are an invariant violation: panics in debug,
    /// logs and renormalizes in release.
    pub fn from_components(x: f64, y: f64) -> Self {
        let n2 = x * x + y * y;
        debug_assert!(
            (n2 - 1.0).abs() <= 1e-6,
            "non-unit angle components ({x}, {y})"
        );
        if (n2 - 1.0).abs() > 1e-6 {
            error!(x, y, "non-unit angle components, renormalizing");
            return Self::from_vector(&Vector::new(x, y));
        }
        Self { x, y }
    }

    /// Bearing of a world displacement. A null vector maps to [`DEG0`].
    pub fn from_vector(v: &Vector) -> Self {
        let n = v.norm();
        if n < f64::EPSILON {
            return DEG0;
        }
        Self {
            x: v.x / n,
            y: v.y / n,
        }
    }

    /// `sin θ`.
    pub fn sin(&self) -> f64 {
        self.x
    }

    /// `cos θ`.
    pub fn cos(&self) -> f64 {
        self.y
    }

    /// Radians in `(-π, π]`.
    pub fn to_rad(&self) -> f64 {
        self.x.atan2(self.y)
    }

    /// Degrees in `(-180, 180]`.
    pub fn to_deg(&self) -> f64 {
        self.to_rad().to_degrees()
    }

    /// Unit vector of the bearing in world coordinates.
    pub fn vector(&self) -> Vector {
        Vector::new(self.x, self.y)
    }

    /// Sum of two angles (complex product of the unit vectors).
    pub fn add(&self, other: &Angle) -> Angle {
        Angle {
            x: self.x * other.y + self.y * other.x,
            y: self.y * other.y - self.x * other.x,
        }
    }

    /// Difference `self − other`.
    pub fn sub(&self, other: &Angle) -> Angle {
        self.add(&other.neg())
    }

    /// The negated angle `−θ`.
    pub fn neg(&self) -> Angle {
        Angle {
            x: -self.x,
            y: self.y,
        }
    }

    /// The opposite bearing `θ + 180°`.
    pub fn opposite(&self) -> Angle {
        Angle {
            x: -self.x,
            y: -self.y,
        }
    }

    /// Compare two angular widths by `|sin|` (distance from the
    /// front/back axis). Valid for widths below a right angle.
    pub fn width_cmp(&self, other: &Angle) -> std::cmp::Ordering {
        self.x
            .abs()
            .partial_cmp(&other.x.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    }

    /// The narrower of two angular widths.
    pub fn narrower(self, other: Angle) -> Angle {
        if self.width_cmp(&other) == std::cmp::Ordering::Greater {
            other
        } else {
            self
        }
    }
}

// ─── Quadratic area predicates ───────────────────────────────────────

/// A quadratic inequality `k + ax·x + ay·y + axx·x² + ayy·y² ≥ 0`,
/// stored as the coefficient 5-vector over `(1, x, y, x², y²)`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct QPoly {
    pub k: f64,
    pub ax: f64,
    pub ay: f64,
    pub axx: f64,
    pub ayy: f64,
}

impl QPoly {
    /// Disk of radius `r` around `c`: `r² − |p − c|² ≥ 0`.
    pub fn circle(c: &Point, r: f64) -> Self {
        Self {
            k: r * r - c.x * c.x - c.y * c.y,
            ax: 2.0 * c.x,
            ay: 2.0 * c.y,
            axx: -1.0,
            ayy: -1.0,
        }
    }

    /// Half-plane `(p − point)·normal ≥ 0`.
    pub fn half_plane(point: &Point, normal: &Vector) -> Self {
        Self {
            k: -(normal.x * point.x + normal.y * point.y),
            ax: normal.x,
            ay: normal.y,
            axx: 0.0,
            ayy: 0.0,
        }
    }

    /// Points to the right of the oriented line through `p` with
    /// direction `d`: `d.y·(x − p.x) − d.x·(y − p.y) ≥ 0`.
    pub fn right_half_plane(p: &Point, d: &Vector) -> Self {
        Self::half_plane(p, &Vector::new(d.y, -d.x))
    }

    /// Evaluate the quadratic form at `p`.
    pub fn eval(&self, p: &Point) -> f64 {
        self.k + self.ax * p.x + self.ay * p.y + self.axx * p.x * p.x + self.ayy * p.y * p.y
    }

    /// Inequality test `eval(p) ≥ 0`.
    pub fn contains(&self, p: &Point) -> bool {
        self.eval(p) >= 0.0
    }
}

/// Area predicate: a [`QPoly`] leaf or a pointwise conjunction or
/// disjunction of sub-regions.
#[derive(Clone, Debug)]
pub enum Region {
    Leaf(QPoly),
    All(Vec<Region>),
    Any(Vec<Region>),
}

impl Region {
    /// Disk of radius `r` around `c`.
    pub fn circle(c: &Point, r: f64) -> Self {
        Region::Leaf(QPoly::circle(c, r))
    }

    /// Points to the right of the oriented line through `p` along `d`.
    pub fn right_half_plane(p: &Point, d: &Vector) -> Self {
        Region::Leaf(QPoly::right_half_plane(p, d))
    }

    /// Half-plane with an explicit inward normal.
    pub fn half_plane(p: &Point, normal: &Vector) -> Self {
        Region::Leaf(QPoly::half_plane(p, normal))
    }

    /// Wedge of half-width `w` about direction `d` from apex `c`:
    /// the intersection of the two boundary half-planes.
    pub fn wedge(c: &Point, d: &Angle, w: &Angle) -> Self {
        let lower = d.sub(w);
        let upper = d.add(w).opposite();
        Region::All(vec![
            Region::right_half_plane(c, &lower.vector()),
            Region::right_half_plane(c, &upper.vector()),
        ])
    }

    /// Oriented rectangle with centreline `ab` and the given half-width.
    pub fn rectangle(a: &Point, b: &Point, half_width: f64) -> Self {
        let u = Angle::from_vector(&(b - a)).vector();
        let n = Vector::new(u.y, -u.x);
        Region::All(vec![
            Region::half_plane(a, &u),
            Region::half_plane(b, &-u),
            Region::half_plane(&(a - n * half_width), &n),
            Region::half_plane(&(a + n * half_width), &-n),
        ])
    }

    /// Pointwise conjunction.
    pub fn and(self, other: Region) -> Self {
        Region::All(vec![self, other])
    }

    /// Pointwise disjunction.
    pub fn or(self, other: Region) -> Self {
        Region::Any(vec![self, other])
    }

    /// Membership test.
    pub fn contains(&self, p: &Point) -> bool {
        match self {
            Region::Leaf(q) => q.contains(p),
            Region::All(rs) => rs.iter().all(|r| r.contains(p)),
            Region::Any(rs) => rs.iter().any(|r| r.contains(p)),
        }
    }
}

// ─── Lines ───────────────────────────────────────────────────────────

/// An oriented line through a point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Line {
    pub point: Point,
    pub dir: Vector,
}

impl Line {
    pub fn new(point: Point, dir: Vector) -> Self {
        Self { point, dir }
    }

    /// Signed distance of `p` from the line (positive to the right of
    /// the direction of travel).
    pub fn signed_distance(&self, p: &Point) -> f64 {
        let d = self.dir.normalize();
        let v = p - self.point;
        d.y * v.x - d.x * v.y
    }

    /// Intersection point of two lines, `None` when parallel.
    pub fn intersect(&self, other: &Line) -> Option<Point> {
        let det = cross(&self.dir, &other.dir);
        if det.abs() < f64::EPSILON {
            return None;
        }
        let t = cross(&(other.point - self.point), &other.dir) / det;
        Some(self.point + self.dir * t)
    }
}

fn cross(a: &Vector, b: &Vector) -> f64 {
    a.x * b.y - a.y * b.x
}

// ─── Square vs. arc intersection ─────────────────────────────────────

/// The `(near, far)` points at which the receptive wedge from `apex`
/// along `direction` with the given half-angle enters and leaves the
/// square cell, or `None` when the wedge misses the cell.
///
/// The wedge must be convex: half-angles at or above a right angle are
/// clamped just below it.
pub fn square_arc_interval(
    cell_centre: &Point,
    cell_size: f64,
    apex: &Point,
    direction: &Angle,
    half_angle: &Angle,
) -> Option<(Point, Point)> {
    let half_angle = clamp_convex(half_angle);
    let h = cell_size / 2.0;
    let mut poly: Vec<Point> = vec![
        Point::new(cell_centre.x - h, cell_centre.y - h),
        Point::new(cell_centre.x + h, cell_centre.y - h),
        Point::new(cell_centre.x + h, cell_centre.y + h),
        Point::new(cell_centre.x - h, cell_centre.y + h),
    ];

    // Inward normals of the two wedge boundaries, as in Region::wedge.
    let lower = direction.sub(&half_angle).vector();
    let upper = direction.add(&half_angle).opposite().vector();
    for d in [lower, upper] {
        let n = Vector::new(d.y, -d.x);
        poly = clip_half_plane(&poly, apex, &n);
        if poly.is_empty() {
            return None;
        }
    }

    let far = poly
        .iter()
        .copied()
        .max_by(|a, b| {
            let da = (a - apex).norm_squared();
            let db = (b - apex).norm_squared();
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or(*apex);

    let near = if point_in_convex(&poly, apex) {
        *apex
    } else {
        nearest_on_boundary(&poly, apex)
    };

    Some((near, far))
}

fn clamp_convex(half_angle: &Angle) -> Angle {
    if half_angle.cos() > 1e-3 {
        *half_angle
    } else {
        Angle::from_deg(89.9)
    }
}

/// Sutherland–Hodgman clip against the half-plane `(p − apex)·n ≥ 0`.
fn clip_half_plane(poly: &[Point], apex: &Point, n: &Vector) -> Vec<Point> {
    let mut out = Vec::with_capacity(poly.len() + 2);
    for (i, a) in poly.iter().enumerate() {
        let b = &poly[(i + 1) % poly.len()];
        let fa = (a - apex).dot(n);
        let fb = (b - apex).dot(n);
        if fa >= 0.0 {
            out.push(*a);
        }
        if (fa > 0.0 && fb < 0.0) || (fa < 0.0 && fb > 0.0) {
            let t = fa / (fa - fb);
            out.push(a + (b - a) * t);
        }
    }
    out
}

fn point_in_convex(poly: &[Point], p: &Point) -> bool {
    if poly.len() < 3 {
        return false;
    }
    let mut sign = 0.0f64;
    for (i, a) in poly.iter().enumerate() {
        let b = &poly[(i + 1) % poly.len()];
        let c = cross(&(b - a), &(p - a));
        if c.abs() < f64::EPSILON {
            continue;
        }
        if sign == 0.0 {
            sign = c.signum();
        } else if c.signum() != sign {
            return false;
        }
    }
    true
}

fn nearest_on_boundary(poly: &[Point], p: &Point) -> Point {
    let mut best = poly[0];
    let mut best_d = f64::INFINITY;
    for (i, a) in poly.iter().enumerate() {
        let b = &poly[(i + 1) % poly.len()];
        let q = nearest_on_segment(a, b, p);
        let d = (q - p).norm_squared();
        if d < best_d {
            best_d = d;
            best = q;
        }
    }
    best
}

fn nearest_on_segment(a: &Point, b: &Point, p: &Point) -> Point {
    let ab = b - a;
    let len2 = ab.norm_squared();
    if len2 < f64::EPSILON {
        return *a;
    }
    let t = ((p - a).dot(&ab) / len2).clamp(0.0, 1.0);
    a + ab * t
}

// ─── Tests ───────────────────────────────────────────────────────────
