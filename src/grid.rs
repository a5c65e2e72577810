//! Occupancy grid built from the boundary polygon. Rasterization is even-odd;
//! everything outside the polygon is Obstacle, then obstacles are inflated by
//! the robot radius plus safety padding.

use crate::config::InflationMetric;
use crate::errors::PlanError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cell {
    Free,
    Obstacle,
    Unknown,
    Inflated,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OccupancyGrid {
    pub origin_x: f64,
    pub origin_y: f64,
    pub resolution: f64,
    pub width: usize,
    pub height: usize,
    cells: Vec<Cell>,
    inflation_radius: f64,
    metric: InflationMetric,
}

impl OccupancyGrid {
    /// Rasterize a closed boundary polygon given in local-frame meters.
    /// `inflation_radius` must already include the robot radius.
    pub fn from_boundary(
        polygon: &[(f64, f64)],
        resolution: f64,
        margin: f64,
        inflation_radius: f64,
        metric: InflationMetric,
    ) -> Result<OccupancyGrid, PlanError> {
        if polygon.len() < 3 {
            return Err(PlanError::EmptyPolygon);
        }

        let min_x = polygon.iter().map(|p| p.0).fold(f64::INFINITY, f64::min) - margin;
        let max_x = polygon.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max) + margin;
        let min_y = polygon.iter().map(|p| p.1).fold(f64::INFINITY, f64::min) - margin;
        let max_y = polygon.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max) + margin;

        let width = ((max_x - min_x) / resolution).ceil() as usize + 1;
        let height = ((max_y - min_y) / resolution).ceil() as usize + 1;

        let mut grid = OccupancyGrid {
            origin_x: min_x,
            origin_y: min_y,
            resolution,
            width,
            height,
            cells: vec![Cell::Obstacle; width * height],
            inflation_radius,
            metric,
        };

        for iy in 0..height {
            for ix in 0..width {
                let (cx, cy) = grid.cell_center(ix, iy);
                if point_in_polygon_even_odd(cx, cy, polygon) {
                    grid.cells[iy * width + ix] = Cell::Free;
                }
            }
        }

        grid.inflate_all();
        Ok(grid)
    }

    /// All-free grid. Used for point-goto missions before a boundary is
    /// loaded, and by tests.
    pub fn open(
        width: usize,
        height: usize,
        resolution: f64,
        inflation_radius: f64,
        metric: InflationMetric,
    ) -> OccupancyGrid {
        OccupancyGrid {
            origin_x: 0.0,
            origin_y: 0.0,
            resolution,
            width,
            height,
            cells: vec![Cell::Free; width * height],
            inflation_radius,
            metric,
        }
    }

    pub fn set_cell(&mut self, ix: usize, iy: usize, cell: Cell) {
        self.cells[iy * self.width + ix] = cell;
    }

    /// Re-derive the Inflated layer over the whole grid.
    pub fn reinflate(&mut self) {
        self.inflate_all();
    }

    // ── Indexing ─────────────────────────────────────────────────────────

    #[inline]
    pub fn cell(&self, ix: usize, iy: usize) -> Cell {
        self.cells[iy * self.width + ix]
    }

    #[inline]
    pub fn in_bounds(&self, ix: i64, iy: i64) -> bool {
        ix >= 0 && iy >= 0 && (ix as usize) < self.width && (iy as usize) < self.height
    }

    pub fn world_to_cell(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let ix = ((x - self.origin_x) / self.resolution).floor() as i64;
        let iy = ((y - self.origin_y) / self.resolution).floor() as i64;
        if self.in_bounds(ix, iy) {
            Some((ix as usize, iy as usize))
        } else {
            None
        }
    }

    pub fn cell_center(&self, ix: usize, iy: usize) -> (f64, f64) {
        (
            self.origin_x + (ix as f64 + 0.5) * self.resolution,
            self.origin_y + (iy as f64 + 0.5) * self.resolution,
        )
    }

    /// Free and Inflated cells are traversable; Inflated only at a cost
    /// penalty.
    pub fn is_traversable(&self, ix: usize, iy: usize) -> bool {
        matches!(self.cell(ix, iy), Cell::Free | Cell::Inflated)
    }

    // ── Mutation (planner-owned) ─────────────────────────────────────────

    /// Learn an obstacle observed at a world position. Marks the disc of
    /// `radius` meters as Obstacle and re-inflates the affected
    /// neighborhood.
    pub fn upsert_obstacle(&mut self, x: f64, y: f64, radius: f64) {
        let Some((cx, cy)) = self.world_to_cell(x, y) else {
            return;
        };
        let r_cells = (radius / self.resolution).ceil() as i64;
        // The containing cell is always marked, whatever its center offset.
        self.cells[cy * self.width + cx] = Cell::Obstacle;
        for dy in -r_cells..=r_cells {
            for dx in -r_cells..=r_cells {
                let (ix, iy) = (cx as i64 + dx, cy as i64 + dy);
                if !self.in_bounds(ix, iy) {
                    continue;
                }
                let (wx, wy) = self.cell_center(ix as usize, iy as usize);
                if ((wx - x).powi(2) + (wy - y).powi(2)).sqrt() <= radius {
                    self.cells[iy as usize * self.width + ix as usize] = Cell::Obstacle;
                }
            }
        }
        self.reinflate_region(
            cx as i64 - r_cells * 3,
            cy as i64 - r_cells * 3,
            cx as i64 + r_cells * 3,
            cy as i64 + r_cells * 3,
        );
    }

    fn inflate_all(&mut self) {
        self.reinflate_region(0, 0, self.width as i64 - 1, self.height as i64 - 1);
    }

    /// Re-derive Inflated cells inside a bounding box from the Obstacle set.
    fn reinflate_region(&mut self, x0: i64, y0: i64, x1: i64, y1: i64) {
        let r_cells = (self.inflation_radius / self.resolution).ceil() as i64;
        if r_cells == 0 {
            return;
        }
        let x0 = x0.max(0);
        let y0 = y0.max(0);
        let x1 = x1.min(self.width as i64 - 1);
        let y1 = y1.min(self.height as i64 - 1);

        // Reset previous inflation in the window.
        for iy in y0..=y1 {
            for ix in x0..=x1 {
                let idx = iy as usize * self.width + ix as usize;
                if self.cells[idx] == Cell::Inflated {
                    self.cells[idx] = Cell::Free;
                }
            }
        }

        let mut marks = Vec::new();
        for iy in y0..=y1 {
            for ix in x0..=x1 {
                if self.cell(ix as usize, iy as usize) != Cell::Free {
                    continue;
                }
                'scan: for dy in -r_cells..=r_cells {
                    for dx in -r_cells..=r_cells {
                        let (ox, oy) = (ix + dx, iy + dy);
                        if !self.in_bounds(ox, oy)
                            || self.cell(ox as usize, oy as usize) != Cell::Obstacle
                        {
                            continue;
                        }
                        let within = match self.metric {
                            InflationMetric::Chebyshev => {
                                dx.abs().max(dy.abs()) <= r_cells
                            }
                            InflationMetric::Euclidean => {
                                let d = ((dx * dx + dy * dy) as f64).sqrt() * self.resolution;
                                d <= self.inflation_radius
                            }
                        };
                        if within {
                            marks.push((ix as usize, iy as usize));
                            break 'scan;
                        }
                    }
                }
            }
        }
        for (ix, iy) in marks {
            self.cells[iy * self.width + ix] = Cell::Inflated;
        }
    }

    // ── Queries ──────────────────────────────────────────────────────────

    /// Closest Free cell to a start cell, breadth-first. Used for the
    /// target-in-obstacle error suggestion.
    pub fn nearest_free(&self, start: (usize, usize)) -> Option<(usize, usize)> {
        if self.cell(start.0, start.1) == Cell::Free {
            return Some(start);
        }
        let mut visited = vec![false; self.width * self.height];
        let mut queue = VecDeque::new();
        visited[start.1 * self.width + start.0] = true;
        queue.push_back(start);
        while let Some((ix, iy)) = queue.pop_front() {
            for (dx, dy) in NEIGHBORS_8 {
                let (nx, ny) = (ix as i64 + dx, iy as i64 + dy);
                if !self.in_bounds(nx, ny) {
                    continue;
                }
                let (nx, ny) = (nx as usize, ny as usize);
                if visited[ny * self.width + nx] {
                    continue;
                }
                visited[ny * self.width + nx] = true;
                if self.cell(nx, ny) == Cell::Free {
                    return Some((nx, ny));
                }
                queue.push_back((nx, ny));
            }
        }
        None
    }

    /// World positions of all Obstacle cell centers. Feeds the local
    /// planner's spatial index.
    pub fn obstacle_points(&self) -> Vec<(f64, f64)> {
        let mut out = Vec::new();
        for iy in 0..self.height {
            for ix in 0..self.width {
                if self.cell(ix, iy) == Cell::Obstacle {
                    out.push(self.cell_center(ix, iy));
                }
            }
        }
        out
    }

    pub fn count(&self, kind: Cell) -> usize {
        self.cells.iter().filter(|&&c| c == kind).count()
    }
}

pub const NEIGHBORS_8: [(i64, i64); 8] = [
    (1, 0),
    (-1, 0),
    (0, 1),
    (0, -1),
    (1, 1),
    (1, -1),
    (-1, 1),
    (-1, -1),
];

/// Even-odd rule: a point is interior when a ray crosses the boundary an odd
/// number of times.
pub fn point_in_polygon_even_odd(x: f64, y: f64, polygon: &[(f64, f64)]) -> bool {
    let mut inside = false;
    let n = polygon.len();
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = polygon[i];
        let (xj, yj) = polygon[j];
        if (yi > y) != (yj > y) {
            let x_cross = (xj - xi) * (y - yi) / (yj - yi) + xi;
            if x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(side: f64) -> Vec<(f64, f64)> {
        vec![(0.0, 0.0), (side, 0.0), (side, side), (0.0, side)]
    }

    #[test]
    fn test_empty_polygon_rejected() {
        let err = OccupancyGrid::from_boundary(&[], 0.5, 1.0, 0.0, InflationMetric::Euclidean)
            .unwrap_err();
        assert!(matches!(err, PlanError::EmptyPolygon));
    }

    #[test]
    fn test_point_in_polygon() {
        let poly = square(10.0);
        assert!(point_in_polygon_even_odd(5.0, 5.0, &poly));
        assert!(!point_in_polygon_even_odd(-1.0, 5.0, &poly));
        assert!(!point_in_polygon_even_odd(5.0, 11.0, &poly));
    }

    #[test]
    fn test_interior_is_free_exterior_is_obstacle() {
        let grid =
            OccupancyGrid::from_boundary(&square(10.0), 0.5, 1.0, 0.0, InflationMetric::Euclidean)
                .unwrap();
        let (ix, iy) = grid.world_to_cell(5.0, 5.0).unwrap();
        assert_eq!(grid.cell(ix, iy), Cell::Free);
        let (ox, oy) = grid.world_to_cell(-0.8, 5.0).unwrap();
        assert_eq!(grid.cell(ox, oy), Cell::Obstacle);
    }

    #[test]
    fn test_inflation_rings_obstacles() {
        let grid =
            OccupancyGrid::from_boundary(&square(10.0), 0.5, 1.0, 0.6, InflationMetric::Euclidean)
                .unwrap();
        // A cell just inside the boundary sits within the inflation ring.
        let (ix, iy) = grid.world_to_cell(0.3, 5.0).unwrap();
        assert_eq!(grid.cell(ix, iy), Cell::Inflated);
        // Deep interior stays free.
        let (cx, cy) = grid.world_to_cell(5.0, 5.0).unwrap();
        assert_eq!(grid.cell(cx, cy), Cell::Free);
    }

    #[test]
    fn test_chebyshev_inflation_is_square() {
        let grid = OccupancyGrid::from_boundary(
            &square(10.0),
            0.5,
            1.0,
            0.5,
            InflationMetric::Chebyshev,
        )
        .unwrap();
        assert!(grid.count(Cell::Inflated) > 0);
    }

    #[test]
    fn test_upsert_obstacle_marks_and_inflates() {
        let mut grid =
            OccupancyGrid::from_boundary(&square(10.0), 0.5, 1.0, 0.5, InflationMetric::Euclidean)
                .unwrap();
        let (ix, iy) = grid.world_to_cell(5.0, 5.0).unwrap();
        assert_eq!(grid.cell(ix, iy), Cell::Free);
        grid.upsert_obstacle(5.0, 5.0, 0.3);
        assert_eq!(grid.cell(ix, iy), Cell::Obstacle);
        // Neighborhood got an inflation ring.
        let (nx, ny) = grid.world_to_cell(5.0, 5.8).unwrap();
        assert_eq!(grid.cell(nx, ny), Cell::Inflated);
    }

    #[test]
    fn test_nearest_free_suggestion() {
        let mut grid =
            OccupancyGrid::from_boundary(&square(10.0), 0.5, 1.0, 0.0, InflationMetric::Euclidean)
                .unwrap();
        grid.upsert_obstacle(5.0, 5.0, 1.0);
        let blocked = grid.world_to_cell(5.0, 5.0).unwrap();
        let free = grid.nearest_free(blocked).unwrap();
        assert_eq!(grid.cell(free.0, free.1), Cell::Free);
        assert_ne!(blocked, free);
    }
}
