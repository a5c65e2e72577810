//! Optional persisted state: the occupancy grid and coverage cursor survive
//! restarts as a gzip-compressed JSON snapshot. Never required for
//! correctness; a missing or corrupt file just means a fresh start.

use crate::errors::PersistError;
use crate::grid::OccupancyGrid;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

#[derive(Serialize, Deserialize)]
pub struct PersistedState {
    pub grid: OccupancyGrid,
    pub coverage_cursor: usize,
    /// Wall-clock of the save, for logs only.
    pub saved_at: String,
}

pub fn save(path: &Path, grid: &OccupancyGrid, coverage_cursor: usize) -> Result<(), PersistError> {
    let state = PersistedState {
        grid: grid.clone(),
        coverage_cursor,
        saved_at: chrono::Utc::now().to_rfc3339(),
    };
    let file = File::create(path)?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    serde_json::to_writer(&mut encoder, &state)?;
    encoder.finish()?;
    Ok(())
}

pub fn load(path: &Path) -> Result<PersistedState, PersistError> {
    let file = File::open(path)?;
    let decoder = GzDecoder::new(BufReader::new(file));
    Ok(serde_json::from_reader(decoder)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InflationMetric;
    use crate::grid::Cell;

    #[test]
    fn test_round_trip() {
        let mut grid = OccupancyGrid::open(12, 8, 0.25, 0.3, InflationMetric::Euclidean);
        grid.set_cell(5, 4, Cell::Obstacle);
        grid.reinflate();

        let dir = std::env::temp_dir().join("mower_persist_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state.json.gz");

        save(&path, &grid, 42).unwrap();
        let restored = load(&path).unwrap();

        assert_eq!(restored.coverage_cursor, 42);
        assert_eq!(restored.grid.width, 12);
        assert_eq!(restored.grid.height, 8);
        assert_eq!(restored.grid.cell(5, 4), Cell::Obstacle);
        assert_eq!(
            restored.grid.count(Cell::Inflated),
            grid.count(Cell::Inflated)
        );

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let path = std::env::temp_dir().join("mower_persist_missing.json.gz");
        assert!(load(&path).is_err());
    }
}
