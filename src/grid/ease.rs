/*!
 * The global EASE-Grid 2.0 at 36 km resolution, the native grid of SMAP L3 soil moisture.
 *
 * This is a cylindrical equal-area projection of the WGS84 ellipsoid with a standard parallel at
 * 30 degrees. Source files store rows from north to south, the grid built here numbers points
 * starting in the bottom left corner.
 */

use super::CellGrid;
use crate::{
    error::{ReshuffleError, ReshuffleResult},
    geo::BoundingBox,
};
use std::path::Path;

/// Number of rows in the global grid.
pub const EASE36_ROWS: usize = 406;
/// Number of columns in the global grid.
pub const EASE36_COLS: usize = 964;
/// Rows removed at the northern and southern edge of the global grid.
pub const EASE36_MARGIN_ROWS: usize = 1;

/// Edge length of the cells used to partition the grid, in degrees.
const EASE36_CELLSIZE: f64 = 5.0;

const MAP_SCALE_M: f64 = 36_032.220_840_584;

// WGS84
const SEMI_MAJOR_AXIS_M: f64 = 6_378_137.0;
const ECCENTRICITY: f64 = 0.081_819_190_842_6;
const STANDARD_PARALLEL_DEG: f64 = 30.0;

fn k0() -> f64 {
    let e2 = ECCENTRICITY * ECCENTRICITY;
    let phi1 = STANDARD_PARALLEL_DEG.to_radians();
    phi1.cos() / (1.0 - e2 * phi1.sin().powi(2)).sqrt()
}

fn authalic_q(phi: f64) -> f64 {
    let e = ECCENTRICITY;
    let e2 = e * e;
    let s = phi.sin();

    (1.0 - e2) * (s / (1.0 - e2 * s * s) - 1.0 / (2.0 * e) * ((1.0 - e * s) / (1.0 + e * s)).ln())
}

#[cfg(test)]
fn y_from_lat(lat: f64) -> f64 {
    SEMI_MAJOR_AXIS_M * authalic_q(lat.to_radians()) / (2.0 * k0())
}

fn lat_from_y(y: f64) -> f64 {
    let e2 = ECCENTRICITY * ECCENTRICITY;
    let e4 = e2 * e2;
    let e6 = e4 * e2;
    let qp = authalic_q(std::f64::consts::FRAC_PI_2);

    let beta = (2.0 * y * k0() / (SEMI_MAJOR_AXIS_M * qp)).clamp(-1.0, 1.0).asin();

    let phi = beta
        + (e2 / 3.0 + 31.0 * e4 / 180.0 + 517.0 * e6 / 5040.0) * (2.0 * beta).sin()
        + (23.0 * e4 / 360.0 + 251.0 * e6 / 3780.0) * (4.0 * beta).sin()
        + (761.0 * e6 / 45360.0) * (6.0 * beta).sin();

    phi.to_degrees()
}

fn lon_from_x(x: f64) -> f64 {
    (x / (SEMI_MAJOR_AXIS_M * k0())).to_degrees()
}

/// Longitudes of the column centers, west to east.
pub fn ease36_lon_axis() -> Vec<f64> {
    let half = EASE36_COLS as f64 / 2.0;
    (0..EASE36_COLS)
        .map(|i| lon_from_x((i as f64 - half + 0.5) * MAP_SCALE_M))
        .collect()
}

/// Latitudes of the row centers, north to south as stored in source files.
pub fn ease36_lat_axis() -> Vec<f64> {
    let half = EASE36_ROWS as f64 / 2.0;
    (0..EASE36_ROWS)
        .map(|j| lat_from_y((half - j as f64 - 0.5) * MAP_SCALE_M))
        .collect()
}

/**
 * Build the 36 km EASE2 cell grid.
 *
 * The first and last latitude rows are dropped. Points are numbered row by row starting in the
 * southwest corner, so gpi = row * 964 + column.
 *
 * #Arguments
 * * bbox - optionally only keep the points inside this area.
 */
pub fn ease36_cell_grid(bbox: Option<&BoundingBox>) -> ReshuffleResult<CellGrid> {
    let lons = ease36_lon_axis();
    let lats = ease36_lat_axis();

    let rows = EASE36_ROWS - 2 * EASE36_MARGIN_ROWS;

    let mut arr_lon = Vec::with_capacity(rows * EASE36_COLS);
    let mut arr_lat = Vec::with_capacity(rows * EASE36_COLS);

    // South to north, skipping the margin.
    for &lat in lats[EASE36_MARGIN_ROWS..(EASE36_ROWS - EASE36_MARGIN_ROWS)].iter().rev() {
        for &lon in &lons {
            arr_lon.push(lon);
            arr_lat.push(lat);
        }
    }

    let gpis = (0..arr_lon.len() as i64).collect();
    let grid = CellGrid::new(gpis, arr_lon, arr_lat, EASE36_CELLSIZE)?.with_shape(rows, EASE36_COLS)?;

    Ok(match bbox {
        Some(bbox) => grid.bbox_subgrid(bbox),
        None => grid,
    })
}

/**
 * Load a saved reduction of the 36 km EASE2 grid, e.g. the land points.
 *
 * #Arguments
 * * path - a grid file written by [CellGrid::save].
 * * bbox - optionally only keep the points inside this area.
 *
 * #Errors
 * `Config` if a point of the saved grid is not the point with the same gpi in the global grid.
 */
pub fn ease36_grid_from_file<P: AsRef<Path>>(
    path: P,
    bbox: Option<&BoundingBox>,
) -> ReshuffleResult<CellGrid> {
    let path = path.as_ref();
    let grid = CellGrid::load(path)?;

    if grid.is_subset_of(&ease36_cell_grid(None)?, true).is_none() {
        return Err(ReshuffleError::Config(format!(
            "{} is not a subset of the 36 km EASE2 grid",
            path.display()
        )));
    }

    Ok(match bbox {
        Some(bbox) => grid.bbox_subgrid(bbox),
        None => grid,
    })
}
