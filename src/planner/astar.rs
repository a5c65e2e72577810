//! A* over the 8-connected occupancy grid with line-of-sight smoothing.
//! Obstacle cells are impassable, Inflated cells cost a configurable penalty
//! so routes stop hugging obstacles, ties break toward the lower heuristic.

use crate::errors::PlanError;
use crate::grid::{Cell, OccupancyGrid, NEIGHBORS_8};
use crate::planner::{densify, Path};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

const SQRT2: f64 = std::f64::consts::SQRT_2;

#[derive(Clone, Copy, Debug)]
struct Node {
    cell: (usize, usize),
    f: f64,
    h: f64,
    /// Insertion sequence; later pushes win ties (LIFO stable).
    seq: u64,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Node {}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; the "greatest" node must be the one we
        // want to expand next: lowest f, then lowest h, then newest.
        other
            .f
            .partial_cmp(&self.f)
            .unwrap_or(Ordering::Equal)
            .then(other.h.partial_cmp(&self.h).unwrap_or(Ordering::Equal))
            .then(self.seq.cmp(&other.seq))
    }
}
impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Plan a cell path from a start to a goal world position.
pub fn plan(
    grid: &OccupancyGrid,
    start: (f64, f64),
    goal: (f64, f64),
    inflated_penalty: f64,
) -> Result<Vec<(usize, usize)>, PlanError> {
    let start_cell = grid
        .world_to_cell(start.0, start.1)
        .ok_or(PlanError::OutOfBounds {
            x: start.0,
            y: start.1,
        })?;
    let goal_cell = grid
        .world_to_cell(goal.0, goal.1)
        .ok_or(PlanError::OutOfBounds {
            x: goal.0,
            y: goal.1,
        })?;

    if !grid.is_traversable(goal_cell.0, goal_cell.1) {
        let suggestion = grid.nearest_free(goal_cell);
        let (sx, sy) = suggestion
            .map(|c| grid.cell_center(c.0, c.1))
            .unwrap_or((goal.0, goal.1));
        return Err(PlanError::TargetInObstacle {
            x: goal.0,
            y: goal.1,
            suggest_x: sx,
            suggest_y: sy,
        });
    }

    let width = grid.width;
    let idx = |c: (usize, usize)| c.1 * width + c.0;
    let heuristic = |c: (usize, usize)| {
        let dx = c.0 as f64 - goal_cell.0 as f64;
        let dy = c.1 as f64 - goal_cell.1 as f64;
        (dx * dx + dy * dy).sqrt()
    };

    let mut g_score = vec![f64::INFINITY; width * grid.height];
    let mut came_from = vec![usize::MAX; width * grid.height];
    let mut closed = vec![false; width * grid.height];
    let mut open = BinaryHeap::new();
    let mut seq = 0u64;

    g_score[idx(start_cell)] = 0.0;
    open.push(Node {
        cell: start_cell,
        f: heuristic(start_cell),
        h: heuristic(start_cell),
        seq,
    });

    while let Some(node) = open.pop() {
        let current = node.cell;
        if closed[idx(current)] {
            continue;
        }
        closed[idx(current)] = true;

        if current == goal_cell {
            let mut cells = vec![current];
            let mut at = idx(current);
            while came_from[at] != usize::MAX {
                at = came_from[at];
                cells.push((at % width, at / width));
            }
            cells.reverse();
            return Ok(cells);
        }

        for (dx, dy) in NEIGHBORS_8 {
            let (nx, ny) = (current.0 as i64 + dx, current.1 as i64 + dy);
            if !grid.in_bounds(nx, ny) {
                continue;
            }
            let next = (nx as usize, ny as usize);
            if !grid.is_traversable(next.0, next.1) || closed[idx(next)] {
                continue;
            }
            // A diagonal move must not cut a blocked corner.
            if dx != 0 && dy != 0 {
                let a = (current.0 as i64 + dx, current.1 as i64);
                let b = (current.0 as i64, current.1 as i64 + dy);
                if !grid.is_traversable(a.0 as usize, a.1 as usize)
                    || !grid.is_traversable(b.0 as usize, b.1 as usize)
                {
                    continue;
                }
            }

            let step = if dx != 0 && dy != 0 { SQRT2 } else { 1.0 };
            let multiplier = if grid.cell(next.0, next.1) == Cell::Inflated {
                inflated_penalty
            } else {
                1.0
            };
            let tentative = g_score[idx(current)] + step * multiplier;
            if tentative < g_score[idx(next)] {
                g_score[idx(next)] = tentative;
                came_from[idx(next)] = idx(current);
                let h = heuristic(next);
                seq += 1;
                open.push(Node {
                    cell: next,
                    f: tentative + h,
                    h,
                    seq,
                });
            }
        }
    }

    Err(PlanError::PathNotFound {
        from_x: start.0,
        from_y: start.1,
        to_x: goal.0,
        to_y: goal.1,
    })
}

/// Iterative line-of-sight pruning: drop intermediate cells whose connecting
/// segment is collision-free, repeated to a fixpoint so the result is
/// idempotent.
pub fn smooth(grid: &OccupancyGrid, cells: &[(usize, usize)]) -> Vec<(usize, usize)> {
    let mut current = cells.to_vec();
    loop {
        let next = prune_once(grid, &current);
        if next.len() == current.len() {
            return next;
        }
        current = next;
    }
}

fn prune_once(grid: &OccupancyGrid, cells: &[(usize, usize)]) -> Vec<(usize, usize)> {
    if cells.len() <= 2 {
        return cells.to_vec();
    }
    let mut out = Vec::with_capacity(cells.len());
    out.push(cells[0]);
    let mut anchor = 0;
    let mut probe = 1;
    while probe < cells.len() {
        if probe + 1 == cells.len() {
            out.push(cells[probe]);
            break;
        }
        if line_of_sight(grid, cells[anchor], cells[probe + 1]) {
            // cells[probe] is redundant.
            probe += 1;
        } else {
            out.push(cells[probe]);
            anchor = probe;
            probe += 1;
        }
    }
    out
}

/// Supercover walk between two cells; true when every crossed cell is
/// traversable.
pub fn line_of_sight(grid: &OccupancyGrid, from: (usize, usize), to: (usize, usize)) -> bool {
    let (mut x0, mut y0) = (from.0 as i64, from.1 as i64);
    let (x1, y1) = (to.0 as i64, to.1 as i64);
    let dx = (x1 - x0).abs();
    let dy = (y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx - dy;

    loop {
        if !grid.is_traversable(x0 as usize, y0 as usize) {
            return false;
        }
        if x0 == x1 && y0 == y1 {
            return true;
        }
        let e2 = 2 * err;
        let step_x = e2 > -dy;
        let step_y = e2 < dx;
        // A diagonal step must not slip between two blocked corners.
        if step_x && step_y {
            if !grid.is_traversable((x0 + sx) as usize, y0 as usize)
                || !grid.is_traversable(x0 as usize, (y0 + sy) as usize)
            {
                return false;
            }
        }
        if step_x {
            err -= dy;
            x0 += sx;
        }
        if step_y {
            err += dx;
            y0 += sy;
        }
    }
}

/// Convert a smoothed cell path into a dense waypoint [`Path`].
pub fn to_path(
    grid: &OccupancyGrid,
    cells: &[(usize, usize)],
    max_step: f64,
    tolerance: f64,
) -> Path {
    let points: Vec<(f64, f64)> = cells.iter().map(|c| grid.cell_center(c.0, c.1)).collect();
    Path::new(densify(&points, max_step, tolerance))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InflationMetric;

    /// 10x10 grid at 0.5 m, wall at column 4 rows 3..=7, one-cell inflation.
    fn wall_grid() -> OccupancyGrid {
        let mut grid = OccupancyGrid::open(10, 10, 0.5, 0.5, InflationMetric::Euclidean);
        for iy in 3..=7 {
            grid.set_cell(4, iy, Cell::Obstacle);
        }
        grid.reinflate();
        grid
    }

    fn center(grid: &OccupancyGrid, ix: usize, iy: usize) -> (f64, f64) {
        grid.cell_center(ix, iy)
    }

    #[test]
    fn test_route_around_wall() {
        let grid = wall_grid();
        let cells = plan(&grid, center(&grid, 1, 5), center(&grid, 8, 5), 3.0).unwrap();
        assert!(cells.len() >= 9 && cells.len() <= 12, "len {}", cells.len());
        assert_eq!(cells[0], (1, 5));
        assert_eq!(*cells.last().unwrap(), (8, 5));
        for &(ix, iy) in &cells {
            assert_ne!(grid.cell(ix, iy), Cell::Obstacle);
        }
    }

    #[test]
    fn test_unreachable_goal() {
        let mut grid = OccupancyGrid::open(10, 10, 0.5, 0.0, InflationMetric::Euclidean);
        // Seal the goal area behind a full wall.
        for iy in 0..10 {
            grid.set_cell(6, iy, Cell::Obstacle);
        }
        let err = plan(&grid, center(&grid, 1, 5), center(&grid, 8, 5), 3.0).unwrap_err();
        assert!(matches!(err, PlanError::PathNotFound { .. }));
    }

    #[test]
    fn test_goal_in_obstacle_suggests_free_cell() {
        let grid = wall_grid();
        let err = plan(&grid, center(&grid, 1, 5), center(&grid, 4, 5), 3.0).unwrap_err();
        match err {
            PlanError::TargetInObstacle {
                suggest_x,
                suggest_y,
                ..
            } => {
                let cell = grid.world_to_cell(suggest_x, suggest_y).unwrap();
                assert_eq!(grid.cell(cell.0, cell.1), Cell::Free);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_smoothing_is_idempotent() {
        let grid = wall_grid();
        let cells = plan(&grid, center(&grid, 1, 5), center(&grid, 8, 5), 3.0).unwrap();
        let once = smooth(&grid, &cells);
        let twice = smooth(&grid, &once);
        assert_eq!(once, twice);
        assert!(once.len() <= cells.len());
    }

    #[test]
    fn test_smoothing_keeps_endpoints() {
        let grid = wall_grid();
        let cells = plan(&grid, center(&grid, 1, 1), center(&grid, 8, 8), 3.0).unwrap();
        let smoothed = smooth(&grid, &cells);
        assert_eq!(smoothed.first(), cells.first());
        assert_eq!(smoothed.last(), cells.last());
    }

    #[test]
    fn test_straight_line_collapses_to_endpoints() {
        let grid = OccupancyGrid::open(10, 10, 0.5, 0.0, InflationMetric::Euclidean);
        let cells = plan(&grid, center(&grid, 0, 0), center(&grid, 9, 0), 3.0).unwrap();
        let smoothed = smooth(&grid, &cells);
        assert_eq!(smoothed.len(), 2);
    }

    #[test]
    fn test_to_path_respects_step() {
        let grid = wall_grid();
        let cells = plan(&grid, center(&grid, 1, 5), center(&grid, 8, 5), 3.0).unwrap();
        let smoothed = smooth(&grid, &cells);
        let path = to_path(&grid, &smoothed, 0.5, 0.15);
        for pair in path.waypoints().windows(2) {
            let d = ((pair[1].x - pair[0].x).powi(2) + (pair[1].y - pair[0].y).powi(2)).sqrt();
            assert!(d <= 0.5 + 1e-9);
        }
    }
}
