/*!
 * Reading SMAP L3 passive soil moisture (SPL3SMP) files.
 *
 * The layout of the files on disk is handled here, the actual reading of the HDF5 datasets is
 * done by a [FieldSource].
 */

#[cfg(feature = "netcdf")]
pub use netcdf_source::NetcdfFieldSource;

#[cfg(feature = "netcdf")]
mod netcdf_source;

use crate::{
    error::{ReshuffleError, ReshuffleResult},
    grid::{ease36_cell_grid, CellGrid, EASE36_COLS, EASE36_MARGIN_ROWS, EASE36_ROWS},
    image::{daily_timestamps, mask_valid_range, AttrValue, Attributes, Image, ImageReader},
    overpass::{Overpass, VariableNaming, OVERPASS_VARIABLE},
};
use chrono::{Duration, NaiveDateTime};
use log::{debug, warn};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

/// A 2D dataset read from a file.
#[derive(Debug, Clone)]
pub struct Field {
    /// Values in row major order, the first row is the northernmost.
    pub values: Vec<f64>,
    /// (rows, columns)
    pub shape: (usize, usize),
    pub attributes: Attributes,
}

/// Opens files holding groups of 2D datasets.
pub trait FieldSource: Sync {
    type File: FieldFile;

    fn open(&self, path: &Path) -> ReshuffleResult<Self::File>;
}

/// An open file.
pub trait FieldFile {
    /// Names of the top level groups.
    fn groups(&self) -> Vec<String>;

    /// Read a dataset, a `FieldLookup` error if it doesn't exist.
    fn field(&self, group: &str, name: &str) -> ReshuffleResult<Field>;
}

/// Size of the stored raster and the rows to drop along the northern and southern edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterLayout {
    pub rows: usize,
    pub cols: usize,
    pub margin_rows: usize,
}

impl RasterLayout {
    /// The 36 km EASE2 grid of SPL3SMP.
    pub fn ease36() -> Self {
        RasterLayout {
            rows: EASE36_ROWS,
            cols: EASE36_COLS,
            margin_rows: EASE36_MARGIN_ROWS,
        }
    }

    /// Number of points after removing the margin.
    fn n_points(&self) -> usize {
        (self.rows - 2 * self.margin_rows) * self.cols
    }

    /// Reorder a north to south raster so it starts in the south west corner and drop the margin.
    fn to_grid_order(&self, values: &[f64]) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.n_points());
        for row in (self.margin_rows..(self.rows - self.margin_rows)).rev() {
            let start = row * self.cols;
            out.extend_from_slice(&values[start..(start + self.cols)]);
        }
        out
    }
}

/// What to read from the files.
#[derive(Debug, Clone)]
pub struct SmapConfig {
    /// Datasets to read, named as in the morning overpass group.
    pub parameters: Vec<String>,
    /// `None` reads the only overpass in the file.
    pub overpass: Option<Overpass>,
    /// Append `_am` or `_pm` to the output variable names.
    pub var_overpass_str: bool,
    /// Composite Release ID the files must have.
    pub crid: Option<u32>,
    /// Per observation time dataset, read even if it isn't listed in `parameters`.
    pub time_key: Option<String>,
    /// strftime templates of the sub directories holding the files of one day.
    pub subpath_template: Vec<String>,
    pub layout: RasterLayout,
}

impl Default for SmapConfig {
    fn default() -> Self {
        SmapConfig {
            parameters: vec!["soil_moisture".into()],
            overpass: Some(Overpass::Am),
            var_overpass_str: true,
            crid: None,
            time_key: Some("tb_time_seconds".into()),
            subpath_template: vec!["%Y.%m.%d".into()],
            layout: RasterLayout::ease36(),
        }
    }
}

/// A directory tree of SPL3SMP files.
pub struct SmapL3Dataset<S: FieldSource> {
    root: PathBuf,
    source: S,
    config: SmapConfig,
    naming: VariableNaming,
    grid: CellGrid,
}

impl<S: FieldSource> SmapL3Dataset<S> {
    /**
     * Set up a reader.
     *
     * #Arguments
     * * root - the root of the directory tree.
     * * source - reads the files.
     * * config - what to read.
     * * grid - the points to read, the full 36 km EASE2 grid if `None`. Point numbers refer to
     *   the raster after removing the margin, counted from the south west corner.
     */
    pub fn new<P: AsRef<Path>>(
        root: P,
        source: S,
        mut config: SmapConfig,
        grid: Option<CellGrid>,
    ) -> ReshuffleResult<Self> {
        if let Some(key) = &config.time_key {
            if !config.parameters.contains(key) {
                config.parameters.push(key.clone());
            }
        }

        let naming = VariableNaming::new(
            &config.parameters,
            config.overpass,
            config.var_overpass_str,
            config.time_key.as_deref(),
        )?;

        let grid = match grid {
            Some(grid) => grid,
            None => ease36_cell_grid(None)?,
        };

        let n_points = config.layout.n_points() as i64;
        if let Some(gpi) = grid.gpis().iter().find(|&&gpi| gpi < 0 || gpi >= n_points) {
            return Err(ReshuffleError::Config(format!(
                "gpi {} is outside of the {} points of the raster",
                gpi, n_points
            )));
        }

        Ok(SmapL3Dataset {
            root: root.as_ref().to_path_buf(),
            source,
            config,
            naming,
            grid,
        })
    }

    /// The overpass to read for a request.
    fn overpass_for(&self, timestamp: NaiveDateTime) -> Option<Overpass> {
        match self.config.overpass {
            Some(Overpass::Both) => Some(Overpass::for_request(timestamp)),
            op => op,
        }
    }

    /// Find the file for a day. If there are several, the one sorting last (highest CRID) wins.
    pub fn search_file(&self, timestamp: NaiveDateTime) -> ReshuffleResult<PathBuf> {
        let mut dir = self.root.clone();
        for templ in &self.config.subpath_template {
            dir.push(timestamp.format(templ).to_string());
        }

        let mut prefix = format!("SMAP_L3_SM_P_{}_", timestamp.format("%Y%m%d"));
        if let Some(crid) = self.config.crid {
            prefix.push_str(&format!("R{}", crid));
        }

        let mut found: Vec<PathBuf> = walkdir::WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|res| res.ok())
            .filter(|entry| entry.path().is_file())
            .filter(|entry| {
                let fname = entry.file_name().to_string_lossy();
                fname.starts_with(&prefix) && fname.ends_with(".h5")
            })
            .map(|entry| entry.into_path())
            .collect();

        found.sort();

        if found.len() > 1 {
            warn!(
                target: "smap",
                "file search is ambiguous for {}: {} files, using {}",
                timestamp,
                found.len(),
                found[found.len() - 1].display()
            );
        }

        found.pop().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no file found for {} in {}", timestamp, dir.display()),
            )
            .into()
        })
    }

    /// Pick the group to read and the overpass it holds.
    fn select_group(
        &self,
        file: &S::File,
        op: Option<Overpass>,
        path: &Path,
    ) -> ReshuffleResult<(String, Option<Overpass>)> {
        let groups = file.groups();

        if let Some(op) = op {
            let group = op.group_name();
            if !groups.contains(&group) {
                return Err(ReshuffleError::field_lookup(group, path.display().to_string()));
            }
            return Ok((group, Some(op)));
        }

        let mut candidates: Vec<(&String, &str)> = groups
            .iter()
            .filter_map(|g| Overpass::parse_group_name(g).map(|suffix| (g, suffix)))
            .collect();

        match candidates.len() {
            0 => Err(ReshuffleError::field_lookup(
                Overpass::Both.group_name(),
                path.display().to_string(),
            )),
            1 => {
                let (group, suffix) = candidates.remove(0);
                let op = Overpass::from_name(suffix).filter(|op| *op != Overpass::Both);
                Ok((group.clone(), op))
            }
            _ => Err(ReshuffleError::AmbiguousOverpass(
                candidates.iter().map(|(_, s)| s.to_string()).collect(),
            )),
        }
    }
}

impl<S: FieldSource> ImageReader for SmapL3Dataset<S> {
    fn read(&self, timestamp: NaiveDateTime) -> ReshuffleResult<Image> {
        let path = self.search_file(timestamp)?;
        debug!(target: "smap", "reading {}", path.display());

        let file = self.source.open(&path)?;
        let (group, op) = self.select_group(&file, self.overpass_for(timestamp), &path)?;

        let layout = self.config.layout;
        let mut data = BTreeMap::new();
        let mut metadata = BTreeMap::new();

        for parameter in self.naming.parameters() {
            let dataset = VariableNaming::dataset_name(parameter, op);
            let field = file.field(&group, &dataset)?;

            if field.shape != (layout.rows, layout.cols) || field.values.len() != layout.rows * layout.cols {
                return Err(ReshuffleError::field_lookup(
                    format!("{}/{} with shape {}x{}", group, dataset, layout.rows, layout.cols),
                    path.display().to_string(),
                ));
            }

            let raster = layout.to_grid_order(&field.values);
            let mut values: Vec<f64> = self.grid.gpis().iter().map(|&gpi| raster[gpi as usize]).collect();
            mask_valid_range(&mut values, &field.attributes);

            // The table was checked when it was built, every parameter has a name.
            let name = self
                .naming
                .output_name(parameter, op)
                .unwrap_or(parameter)
                .to_string();

            data.insert(name.clone(), values);
            metadata.insert(name, field.attributes);
        }

        if self.config.overpass == Some(Overpass::Both) {
            let flag = op.map(|op| op.flag()).unwrap_or(f64::NAN);
            data.insert(OVERPASS_VARIABLE.to_string(), vec![flag; self.grid.len()]);

            let mut attrs = Attributes::new();
            attrs.insert("_FillValue".into(), AttrValue::Number(-9999.0));
            attrs.insert("valid_min".into(), AttrValue::Number(1.0));
            attrs.insert("valid_max".into(), AttrValue::Number(2.0));
            metadata.insert(OVERPASS_VARIABLE.to_string(), attrs);
        }

        Image::new(
            self.grid.lons().to_vec(),
            self.grid.lats().to_vec(),
            data,
            metadata,
            timestamp,
            self.config.time_key.clone(),
        )
    }

    fn grid(&self) -> Option<&CellGrid> {
        Some(&self.grid)
    }

    fn time_key(&self) -> Option<&str> {
        self.config.time_key.as_deref()
    }

    /// One request per day, two when reading both overpasses (00:00 for AM, 12:00 for PM).
    fn timestamps_for_daterange(&self, start: NaiveDateTime, end: NaiveDateTime) -> Vec<NaiveDateTime> {
        let days = daily_timestamps(start, end);

        if self.config.overpass == Some(Overpass::Both) {
            days.into_iter()
                .flat_map(|d| {
                    let midnight = d.date().and_hms(0, 0, 0);
                    [midnight, midnight + Duration::hours(12)]
                })
                .collect()
        } else {
            days
        }
    }
}
