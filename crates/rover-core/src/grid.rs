//! Finite rectangular grid centred on a world point.
//!
//! Cells are indexed row-major, `index = row·width + col`, row 0 on the
//! south edge. The topology is a pure bijection between world coordinates
//! and cell indices; the radar map stores its cells against it.

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::geometry::{Point, Vector};

/// Rectangular cell grid: centre point, cell counts and cell edge size.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridTopology {
    centre: Point,
    width: usize,
    height: usize,
    cell_size: f64,
}

impl GridTopology {
    /// New topology. `cell_size` must be positive and the cell counts
    /// non-zero.
    pub fn new(centre: Point, width: usize, height: usize, cell_size: f64) -> Self {
        assert!(cell_size > 0.0, "cell_size must be positive");
        assert!(width > 0 && height > 0, "grid must have at least one cell");
        Self {
            centre,
            width,
            height,
            cell_size,
        }
    }

    pub fn centre(&self) -> Point {
        self.centre
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    /// Total number of cells.
    pub fn n(&self) -> usize {
        self.width * self.height
    }

    /// South-west corner of the grid rectangle.
    pub fn origin(&self) -> Point {
        self.centre
            - Vector::new(
                self.width as f64 * self.cell_size / 2.0,
                self.height as f64 * self.cell_size / 2.0,
            )
    }

    /// Whether the point falls inside the grid rectangle.
    pub fn contains(&self, p: &Point) -> bool {
        self.col_row_of(p).is_some()
    }

    /// Column and row of the cell containing `p`, if inside.
    pub fn col_row_of(&self, p: &Point) -> Option<(usize, usize)> {
        let o = self.origin();
        let cx = (p.x - o.x) / self.cell_size;
        let cy = (p.y - o.y) / self.cell_size;
        if cx < 0.0 || cy < 0.0 {
            return None;
        }
        let col = cx.floor() as usize;
        let row = cy.floor() as usize;
        if col < self.width && row < self.height {
            Some((col, row))
        } else {
            None
        }
    }

    /// Index of the cell containing `p`, if inside.
    pub fn index_of(&self, p: &Point) -> Option<usize> {
        self.col_row_of(p).map(|(col, row)| row * self.width + col)
    }

    /// Centre of cell `index`.
    ///
    /// An out-of-range index is an invariant violation: panics in debug,
    /// logs and clamps in release.
    pub fn location_of(&self, index: usize) -> Point {
        debug_assert!(index < self.n(), "cell index {index} out of range");
        let index = if index < self.n() {
            index
        } else {
            error!(index, n = self.n(), "cell index out of range, clamping");
            self.n() - 1
        };
        let col = index % self.width;
        let row = index / self.width;
        let o = self.origin();
        Point::new(
            o.x + (col as f64 + 0.5) * self.cell_size,
            o.y + (row as f64 + 0.5) * self.cell_size,
        )
    }
}

// ─── Segment rasterisation ───────────────────────────────────────────

/// Ordered indices of the cells traversed by the open segment `p0 → p1`.
///
/// Grid DDA in cell space. When the segment passes exactly through a cell
/// corner the two side cells are reported as well, since their closed
/// regions meet the segment. Out-of-grid stretches are skipped.
pub fn segment(topology: &GridTopology, p0: &Point, p1: &Point) -> Vec<usize> {
    let o = topology.origin();
    let inv = 1.0 / topology.cell_size();
    // Cell-space coordinates: cell (col, row) spans [col, col+1) × [row, row+1).
    let ax = (p0.x - o.x) * inv;
    let ay = (p0.y - o.y) * inv;
    let bx = (p1.x - o.x) * inv;
    let by = (p1.y - o.y) * inv;
    let dx = bx - ax;
    let dy = by - ay;

    let mut out = Vec::new();
    let push = |col: i64, row: i64, out: &mut Vec<usize>| {
        if col >= 0 && row >= 0 && (col as usize) < topology.width() && (row as usize) < topology.height() {
            out.push(row as usize * topology.width() + col as usize);
        }
    };

    let mut col = ax.floor() as i64;
    let mut row = ay.floor() as i64;
    let end_col = bx.floor() as i64;
    let end_row = by.floor() as i64;

    if dx.abs() < f64::EPSILON && dy.abs() < f64::EPSILON {
        push(col, row, &mut out);
        return out;
    }

    let step_x: i64 = if dx > 0.0 { 1 } else { -1 };
    let step_y: i64 = if dy > 0.0 { 1 } else { -1 };
    // Parametric distance along the segment to the next column/row
    // boundary, and per-cell increments.
    let t_delta_x = if dx != 0.0 { 1.0 / dx.abs() } else { f64::INFINITY };
    let t_delta_y = if dy != 0.0 { 1.0 / dy.abs() } else { f64::INFINITY };
    let mut t_max_x = if dx != 0.0 {
        let next = if dx > 0.0 { col as f64 + 1.0 } else { col as f64 };
        (next - ax) / dx
    } else {
        f64::INFINITY
    };
    let mut t_max_y = if dy != 0.0 {
        let next = if dy > 0.0 { row as f64 + 1.0 } else { row as f64 };
        (next - ay) / dy
    } else {
        f64::INFINITY
    };

    push(col, row, &mut out);
    // Bounded walk: the segment crosses at most width+height boundaries.
    let max_steps = topology.width() + topology.height() + 2;
    for _ in 0..max_steps {
        if col == end_col && row == end_row {
            break;
        }
        if t_max_x < t_max_y {
            if t_max_x > 1.0 {
                break;
            }
            col += step_x;
            t_max_x += t_delta_x;
            push(col, row, &mut out);
        } else if t_max_y < t_max_x {
            if t_max_y > 1.0 {
                break;
            }
            row += step_y;
            t_max_y += t_delta_y;
            push(col, row, &mut out);
        } else {
            // Exact corner crossing: the two side cells are touched too.
            if t_max_x > 1.0 {
                break;
            }
            push(col + step_x, row, &mut out);
            push(col, row + step_y, &mut out);
            col += step_x;
            row += step_y;
            t_max_x += t_delta_x;
            t_max_y += t_delta_y;
            push(col, row, &mut out);
        }
    }
    out
}

// ─── Tests ───────────────────────────────────────────────────────────
