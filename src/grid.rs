/*!
 * Grids of locations partitioned into spatial cells.
 *
 * A grid is a list of active locations, each with a stable point index (gpi), a coordinate, and
 * the id of the cell it belongs to. Cells are the unit of output file granularity.
 */

pub use ease::{ease36_cell_grid, ease36_grid_from_file, EASE36_COLS, EASE36_MARGIN_ROWS, EASE36_ROWS};

mod ease;

use crate::{
    error::{ReshuffleError, ReshuffleResult},
    geo::{BoundingBox, Coord, PointIndex},
};
use log::debug;
use once_cell::sync::OnceCell;
use rusqlite::{Connection, OpenFlags, ToSql};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::path::Path;

/// Two coordinates closer than this, in meters, are the same location.
const SAME_LOCATION_M: f64 = 1.0e-6;

/**
 * Calculate the cell number for a location.
 *
 * Cells are numbered column major starting in the lower left corner at -180, -90.
 *
 * #Arguments
 * * lon - the longitude in degrees.
 * * lat - the latitude in degrees.
 * * cellsize - the edge length of a square cell in degrees.
 *
 * #Returns
 * The cell number. Locations on the 180 degree meridian wrap around to the -180 cells.
 */
pub fn lonlat2cell(lon: f64, lat: f64, cellsize: f64) -> i32 {
    let cells_per_column = (180.0 / cellsize) as i64;
    let max_cells = (360.0 / cellsize) as i64 * cells_per_column;

    let y = ((lat + 90.0 + 1.0e-9) / cellsize).floor().clamp(0.0, 180.0) as i64;
    let x = ((lon + 180.0 + 1.0e-9) / cellsize).floor().clamp(0.0, 360.0) as i64;

    let mut cell = x * cells_per_column + y;
    if cell > max_cells - 1 {
        cell -= max_cells;
    }

    cell as i32
}

/// A set of active grid points, each assigned to exactly one cell.
#[derive(Debug, Clone)]
pub struct CellGrid {
    gpis: Vec<i64>,
    lons: Vec<f64>,
    lats: Vec<f64>,
    cells: Vec<i32>,
    shape: Option<(usize, usize)>,
    cellsize: Option<f64>,
    index: OnceCell<PointIndex>,
}

impl CellGrid {
    /// Create a grid, assigning cells with [lonlat2cell].
    pub fn new(gpis: Vec<i64>, lons: Vec<f64>, lats: Vec<f64>, cellsize: f64) -> ReshuffleResult<Self> {
        if !(cellsize > 0.0 && cellsize <= 180.0) {
            return Err(ReshuffleError::Config(format!(
                "invalid cell size: {}",
                cellsize
            )));
        }

        let cells = lons
            .iter()
            .zip(&lats)
            .map(|(&lon, &lat)| lonlat2cell(lon, lat, cellsize))
            .collect();

        let mut grid = Self::with_cells(gpis, lons, lats, cells)?;
        grid.cellsize = Some(cellsize);
        Ok(grid)
    }

    /// Create a grid with an explicit cell assignment.
    pub fn with_cells(
        gpis: Vec<i64>,
        lons: Vec<f64>,
        lats: Vec<f64>,
        cells: Vec<i32>,
    ) -> ReshuffleResult<Self> {
        let n = gpis.len();
        if lons.len() != n || lats.len() != n || cells.len() != n {
            return Err(ReshuffleError::Config(format!(
                "grid arrays differ in length: {} gpis, {} lons, {} lats, {} cells",
                n,
                lons.len(),
                lats.len(),
                cells.len()
            )));
        }

        let mut seen = HashSet::default();
        for &gpi in &gpis {
            if !seen.insert(gpi) {
                return Err(ReshuffleError::Config(format!("duplicate gpi {} in grid", gpi)));
            }
        }

        Ok(CellGrid {
            gpis,
            lons,
            lats,
            cells,
            shape: None,
            cellsize: None,
            index: OnceCell::new(),
        })
    }

    /// Attach the (rows, columns) shape of a regular 2D grid. Row 0 is the southernmost row.
    pub fn with_shape(mut self, rows: usize, cols: usize) -> ReshuffleResult<Self> {
        if rows * cols != self.len() {
            return Err(ReshuffleError::Config(format!(
                "grid shape {}x{} does not match {} points",
                rows,
                cols,
                self.len()
            )));
        }

        self.shape = Some((rows, cols));
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.gpis.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gpis.is_empty()
    }

    pub fn gpis(&self) -> &[i64] {
        &self.gpis
    }

    pub fn lons(&self) -> &[f64] {
        &self.lons
    }

    pub fn lats(&self) -> &[f64] {
        &self.lats
    }

    pub fn cells(&self) -> &[i32] {
        &self.cells
    }

    /// The (rows, columns) shape, if this is a complete regular grid.
    pub fn shape(&self) -> Option<(usize, usize)> {
        self.shape
    }

    pub fn cellsize(&self) -> Option<f64> {
        self.cellsize
    }

    pub fn coord(&self, i: usize) -> Coord {
        Coord {
            lat: self.lats[i],
            lon: self.lons[i],
        }
    }

    /// Sorted, de-duplicated list of the cells used by active points.
    pub fn unique_cells(&self) -> Vec<i32> {
        let mut cells = self.cells.clone();
        cells.sort_unstable();
        cells.dedup();
        cells
    }

    /// Spatial index over the active points, built on first use.
    pub(crate) fn point_index(&self) -> &PointIndex {
        self.index.get_or_init(|| {
            debug!(target: "grid", "building point index for {} points", self.len());
            let coords: Vec<Coord> = (0..self.len()).map(|i| self.coord(i)).collect();
            PointIndex::build(&coords)
        })
    }

    /**
     * Find the nearest grid point.
     *
     * #Arguments
     * * lon, lat - the location to search around.
     * * max_dist - optional search radius in meters, nothing farther away is returned.
     *
     * #Returns
     * The gpi and the distance in meters to it.
     */
    pub fn find_nearest_gpi(&self, lon: f64, lat: f64, max_dist: Option<f64>) -> Option<(i64, f64)> {
        let center = Coord { lat, lon };
        let index = self.point_index();

        let hit = match max_dist {
            Some(radius) => index.within(center, radius).first().copied(),
            None => index.nearest(center),
        };

        hit.map(|(i, dist)| (self.gpis[i], dist))
    }

    /// Up to `max_n` active point positions within `radius_m` meters, nearest first.
    pub fn neighbours(&self, lon: f64, lat: f64, radius_m: f64, max_n: usize) -> Vec<(usize, f64)> {
        let mut hits = self.point_index().within(Coord { lat, lon }, radius_m);
        hits.truncate(max_n);
        hits
    }

    fn select(&self, positions: &[usize]) -> CellGrid {
        CellGrid {
            gpis: positions.iter().map(|&i| self.gpis[i]).collect(),
            lons: positions.iter().map(|&i| self.lons[i]).collect(),
            lats: positions.iter().map(|&i| self.lats[i]).collect(),
            cells: positions.iter().map(|&i| self.cells[i]).collect(),
            shape: None,
            cellsize: self.cellsize,
            index: OnceCell::new(),
        }
    }

    /// A reduced grid with only the listed gpis, in the order they appear in this grid.
    pub fn subgrid_from_gpis(&self, gpis: &[i64]) -> ReshuffleResult<CellGrid> {
        let positions = self.gpi_positions();

        let mut keep = Vec::with_capacity(gpis.len());
        for gpi in gpis {
            match positions.get(gpi) {
                Some(&i) => keep.push(i),
                None => {
                    return Err(ReshuffleError::Config(format!(
                        "gpi {} is not part of the grid",
                        gpi
                    )))
                }
            }
        }
        keep.sort_unstable();
        keep.dedup();

        Ok(self.select(&keep))
    }

    /// A reduced grid with the points inside the bounding box, boundaries included.
    ///
    /// If the full grid is regular, a rectangular selection keeps a 2D shape.
    pub fn bbox_subgrid(&self, bbox: &BoundingBox) -> CellGrid {
        let keep: Vec<usize> = (0..self.len())
            .filter(|&i| bbox.contains(self.coord(i)))
            .collect();

        let mut sub = self.select(&keep);

        if self.shape.is_some() {
            let mut rows: Vec<u64> = sub.lats.iter().map(|v| v.to_bits()).collect();
            rows.sort_unstable();
            rows.dedup();
            let mut cols: Vec<u64> = sub.lons.iter().map(|v| v.to_bits()).collect();
            cols.sort_unstable();
            cols.dedup();

            if rows.len() * cols.len() == sub.len() {
                sub.shape = Some((rows.len(), cols.len()));
            }
        }

        sub
    }

    fn gpi_positions(&self) -> HashMap<i64, usize> {
        self.gpis
            .iter()
            .enumerate()
            .map(|(i, &gpi)| (gpi, i))
            .collect()
    }

    /**
     * Check if every location of this grid is also a location of `other`.
     *
     * #Arguments
     * * other - the potentially larger grid.
     * * compare_index - require that matching locations also carry the same gpi.
     *
     * #Returns
     * For each active point of this grid, the position of the same location in `other`, or
     * `None` if this grid is not a subset.
     */
    pub fn is_subset_of(&self, other: &CellGrid, compare_index: bool) -> Option<Vec<usize>> {
        let mut positions = Vec::with_capacity(self.len());

        if compare_index {
            let other_positions = other.gpi_positions();
            for (i, gpi) in self.gpis.iter().enumerate() {
                let j = *other_positions.get(gpi)?;
                if crate::geo::great_circle_distance(self.coord(i), other.coord(j)) > SAME_LOCATION_M {
                    return None;
                }
                positions.push(j);
            }
        } else {
            let index = other.point_index();
            for i in 0..self.len() {
                let (j, dist) = index.nearest(self.coord(i))?;
                if dist > SAME_LOCATION_M {
                    return None;
                }
                positions.push(j);
            }
        }

        Some(positions)
    }

    /// Same gpis, coordinates, and cells in the same order.
    pub fn same_points(&self, other: &CellGrid) -> bool {
        self.gpis == other.gpis
            && self.lons == other.lons
            && self.lats == other.lats
            && self.cells == other.cells
    }

    /// Write the grid to a SQLite file, replacing any grid already stored there.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> ReshuffleResult<()> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        conn.execute("BEGIN", [])?;
        conn.execute_batch(include_str!("grid/create_grid.sql"))?;

        {
            let mut attr_stmt =
                conn.prepare("INSERT INTO grid_attributes (name, value) VALUES (?, ?)")?;
            if let Some(cellsize) = self.cellsize {
                attr_stmt.execute(["cellsize", cellsize.to_string().as_str()])?;
            }
            if let Some((rows, cols)) = self.shape {
                attr_stmt.execute(["shape", format!("{},{}", rows, cols).as_str()])?;
            }

            let mut point_stmt = conn.prepare(
                "INSERT INTO grid_points (position, gpi, lon, lat, cell) VALUES (?, ?, ?, ?, ?)",
            )?;
            for i in 0..self.len() {
                point_stmt.execute([
                    &(i as i64) as &dyn ToSql,
                    &self.gpis[i],
                    &self.lons[i],
                    &self.lats[i],
                    &self.cells[i],
                ])?;
            }
        }

        conn.execute("COMMIT", [])?;
        Ok(())
    }

    /// Load a grid written by [CellGrid::save].
    pub fn load<P: AsRef<Path>>(path: P) -> ReshuffleResult<CellGrid> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

        let mut gpis = vec![];
        let mut lons = vec![];
        let mut lats = vec![];
        let mut cells = vec![];

        let mut stmt =
            conn.prepare("SELECT gpi, lon, lat, cell FROM grid_points ORDER BY position")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            gpis.push(row.get(0)?);
            lons.push(row.get(1)?);
            lats.push(row.get(2)?);
            cells.push(row.get(3)?);
        }

        let mut grid = CellGrid::with_cells(gpis, lons, lats, cells)?;

        let mut stmt = conn.prepare("SELECT name, value FROM grid_attributes")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            let value: String = row.get(1)?;
            match name.as_str() {
                "cellsize" => grid.cellsize = value.parse().ok(),
                "shape" => {
                    let mut dims = value.split(',').filter_map(|v| v.parse::<usize>().ok());
                    if let (Some(r), Some(c)) = (dims.next(), dims.next()) {
                        grid = grid.with_shape(r, c)?;
                    }
                }
                _ => {}
            }
        }

        Ok(grid)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn small_grid() -> CellGrid {
        // 3 x 4 regular grid, 1 degree apart, row 0 in the south.
        let mut lons = vec![];
        let mut lats = vec![];
        for row in 0..3 {
            for col in 0..4 {
                lons.push(10.0 + col as f64);
                lats.push(40.0 + row as f64);
            }
        }
        let gpis = (0..12).collect();
        CellGrid::new(gpis, lons, lats, 2.0)
            .unwrap()
            .with_shape(3, 4)
            .unwrap()
    }

    #[test]
    fn test_lonlat2cell() {
        assert_eq!(lonlat2cell(-179.9, -89.9, 5.0), 0);
        assert_eq!(lonlat2cell(-179.9, -84.9, 5.0), 1);
        assert_eq!(lonlat2cell(-174.9, -89.9, 5.0), 36);
        assert_eq!(lonlat2cell(14.4, 48.2, 5.0), 1395);
        // The 180 meridian wraps around to the first column.
        assert_eq!(lonlat2cell(180.0, -89.9, 5.0), 0);
        assert_eq!(lonlat2cell(179.9, 89.9, 5.0), 2591);
    }

    #[test]
    fn test_rejects_inconsistent_arrays() {
        assert!(CellGrid::with_cells(vec![1, 2], vec![0.0], vec![0.0, 1.0], vec![0, 0]).is_err());
        assert!(CellGrid::with_cells(vec![1, 1], vec![0.0; 2], vec![0.0; 2], vec![0, 0]).is_err());
        assert!(small_grid().with_shape(5, 5).is_err());
    }

    #[test]
    fn test_find_nearest_gpi() {
        let grid = small_grid();

        let (gpi, dist) = grid.find_nearest_gpi(11.0, 41.0, None).unwrap();
        assert_eq!(gpi, 5);
        assert_eq!(dist, 0.0);

        let (gpi, dist) = grid.find_nearest_gpi(12.9, 42.2, None).unwrap();
        assert_eq!(gpi, 11);
        assert!(dist > 0.0);

        assert!(grid.find_nearest_gpi(50.0, 0.0, Some(10_000.0)).is_none());
    }

    #[test]
    fn test_subgrids() {
        let grid = small_grid();

        let sub = grid.subgrid_from_gpis(&[7, 2, 5]).unwrap();
        assert_eq!(sub.gpis(), &[2, 5, 7]);
        assert_eq!(sub.lons(), &[12.0, 11.0, 13.0]);
        assert!(grid.subgrid_from_gpis(&[99]).is_err());

        let bbox = BoundingBox {
            ll: Coord { lat: 41.0, lon: 11.0 },
            ur: Coord { lat: 42.0, lon: 12.0 },
        };
        let sub = grid.bbox_subgrid(&bbox);
        assert_eq!(sub.gpis(), &[5, 6, 9, 10]);
        assert_eq!(sub.shape(), Some((2, 2)));
    }

    #[test]
    fn test_is_subset_of() {
        let grid = small_grid();
        let sub = grid.subgrid_from_gpis(&[1, 6, 11]).unwrap();

        assert_eq!(sub.is_subset_of(&grid, true), Some(vec![1, 6, 11]));
        assert_eq!(sub.is_subset_of(&grid, false), Some(vec![1, 6, 11]));
        assert!(grid.is_subset_of(&sub, false).is_none());

        // Same locations but different point numbers.
        let renumbered = CellGrid::new(
            vec![100, 101, 102],
            sub.lons().to_vec(),
            sub.lats().to_vec(),
            2.0,
        )
        .unwrap();
        assert!(renumbered.is_subset_of(&grid, true).is_none());
        assert!(renumbered.is_subset_of(&grid, false).is_some());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.sqlite");

        let grid = small_grid();
        grid.save(&path).unwrap();
        // Saving twice replaces the first grid.
        grid.save(&path).unwrap();

        let loaded = CellGrid::load(&path).unwrap();
        assert!(loaded.same_points(&grid));
        assert_eq!(loaded.shape(), Some((3, 4)));
        assert_eq!(loaded.cellsize(), Some(2.0));
    }
}
