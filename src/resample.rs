/*!
 * Spatial resampling from the locations of an image onto the locations of a target grid.
 */

use crate::{
    config::ResampleConfig,
    geo::{Coord, PointIndex},
    grid::CellGrid,
    image::{AttrValue, Image},
};
use chrono::Local;
use log::debug;
use std::{collections::BTreeMap, fmt, sync::Arc};

/// How a variable is resampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResampleMethod {
    /// Take the value of the nearest neighbour.
    Nearest,
    /// Weighted average of all neighbours, weighted by the configured [WeightFunction].
    Custom,
}

/// Weight of a neighbour given its distance and the search radius, both in meters.
#[derive(Clone)]
pub enum WeightFunction {
    /// `0.54 + 0.46 cos(pi * d / r)`
    Hamming,
    /// `1 / d`, a neighbour on top of the target point takes all the weight.
    InverseDistance,
    Custom(Arc<dyn Fn(f64, f64) -> f64 + Send + Sync>),
}

impl WeightFunction {
    pub fn weight(&self, distance: f64, radius: f64) -> f64 {
        match self {
            WeightFunction::Hamming => {
                0.54 + 0.46 * (std::f64::consts::PI * distance / radius).cos()
            }
            WeightFunction::InverseDistance => {
                if distance > 0.0 {
                    1.0 / distance
                } else {
                    f64::INFINITY
                }
            }
            WeightFunction::Custom(func) => func(distance, radius),
        }
    }
}

impl fmt::Debug for WeightFunction {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        match self {
            WeightFunction::Hamming => write!(f, "Hamming"),
            WeightFunction::InverseDistance => write!(f, "InverseDistance"),
            WeightFunction::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/**
 * For every target location, the source locations within the search radius, nearest first.
 *
 * The table holds only positions and distances, so it can be shared with worker threads.
 */
#[derive(Debug, Clone)]
pub struct NeighbourTable {
    neighbours: Vec<Vec<(usize, f64)>>,
    n_source: usize,
}

impl NeighbourTable {
    /// Build the table from a fixed source grid to a target grid.
    pub fn from_grids(source: &CellGrid, target: &CellGrid, radius_m: f64, max_n: usize) -> Self {
        let neighbours = (0..target.len())
            .map(|i| {
                let c = target.coord(i);
                source.neighbours(c.lon, c.lat, radius_m, max_n)
            })
            .collect();

        NeighbourTable {
            neighbours,
            n_source: source.len(),
        }
    }

    /// Build the table from a set of source coordinates to a target grid.
    pub fn from_points(
        lons: &[f64],
        lats: &[f64],
        target: &CellGrid,
        radius_m: f64,
        max_n: usize,
    ) -> Self {
        let coords: Vec<Coord> = lons
            .iter()
            .zip(lats)
            .map(|(&lon, &lat)| Coord { lat, lon })
            .collect();
        let index = PointIndex::build(&coords);

        let neighbours = (0..target.len())
            .map(|i| {
                let mut hits = index.within(target.coord(i), radius_m);
                hits.truncate(max_n);
                hits
            })
            .collect();

        NeighbourTable {
            neighbours,
            n_source: coords.len(),
        }
    }

    /// Number of target locations.
    pub fn len(&self) -> usize {
        self.neighbours.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbours.is_empty()
    }

    /// Number of source locations the table was built for.
    pub fn n_source(&self) -> usize {
        self.n_source
    }

    /**
     * Resample one variable.
     *
     * Source values that are not finite are not valid neighbours. Targets with fewer valid
     * neighbours than `min_neighbours` get the fill value, or NaN without one.
     */
    pub fn resample_values(
        &self,
        values: &[f64],
        method: ResampleMethod,
        weight_function: &WeightFunction,
        radius_m: f64,
        min_neighbours: usize,
        fill_value: Option<f64>,
    ) -> Vec<f64> {
        debug_assert_eq!(values.len(), self.n_source);
        let fill = fill_value.unwrap_or(f64::NAN);

        self.neighbours
            .iter()
            .map(|hits| {
                let valid = hits.iter().filter(|(i, _)| values[*i].is_finite());

                if valid.clone().count() < min_neighbours.max(1) {
                    return fill;
                }

                match method {
                    ResampleMethod::Nearest => valid.map(|(i, _)| values[*i]).next().unwrap_or(fill),
                    ResampleMethod::Custom => {
                        let mut sum = 0.0;
                        let mut weights = 0.0;
                        for &(i, dist) in valid {
                            let w = weight_function.weight(dist, radius_m);
                            if w.is_infinite() {
                                // A neighbour right on the target point.
                                return values[i];
                            }
                            sum += w * values[i];
                            weights += w;
                        }

                        if weights > 0.0 {
                            sum / weights
                        } else {
                            fill
                        }
                    }
                }
            })
            .collect()
    }
}

/// Resample every variable of an image onto the target grid, giving a new image.
pub fn resample_image(
    image: &Image,
    table: &NeighbourTable,
    target: &CellGrid,
    config: &ResampleConfig,
) -> Image {
    debug!(target: "resample", "resampling image at {}", image.timestamp);

    let data: BTreeMap<String, Vec<f64>> = image
        .data
        .iter()
        .map(|(name, values)| {
            let resampled = table.resample_values(
                values,
                config.method(name),
                &config.weight_function,
                config.search_radius_m,
                config.min_neighbours,
                config.fill_value(name),
            );
            (name.clone(), resampled)
        })
        .collect();

    let mut metadata = image.metadata.clone();
    let stamp = AttrValue::Text(Local::now().naive_local().to_string());
    for name in data.keys() {
        metadata
            .entry(name.clone())
            .or_default()
            .insert("resampling_date".into(), stamp.clone());
    }

    Image {
        lon: target.lons().to_vec(),
        lat: target.lats().to_vec(),
        data,
        metadata,
        timestamp: image.timestamp,
        time_key: image.time_key.clone(),
    }
}
