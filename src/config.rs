/*!
 * Configuration of a reshuffle run.
 */

use crate::{
    error::{ReshuffleError, ReshuffleResult},
    image::Attributes,
    resample::{ResampleMethod, WeightFunction},
    time_units::TimeUnits,
};
use std::{collections::BTreeMap, str::FromStr, time::Duration};

/// How many images are held in memory before they are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageBuffer {
    /// Up to this many timestamps per block.
    Days(usize),
    /// The whole date range in one block.
    All,
}

impl ImageBuffer {
    /// Interpret a buffer size where -1 means everything.
    pub fn from_size(size: i64) -> ReshuffleResult<Self> {
        match size {
            -1 => Ok(ImageBuffer::All),
            n if n > 0 => Ok(ImageBuffer::Days(n as usize)),
            n => Err(ReshuffleError::Config(format!("invalid image buffer size: {}", n))),
        }
    }

    /// Number of timestamps in a block when there are `total` to read.
    pub fn block_len(&self, total: usize) -> usize {
        match self {
            ImageBuffer::Days(n) => *n,
            ImageBuffer::All => total.max(1),
        }
    }
}

impl FromStr for ImageBuffer {
    type Err = ReshuffleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let size: i64 = s
            .trim()
            .parse()
            .map_err(|_| ReshuffleError::Config(format!("invalid image buffer size: {}", s)))?;
        ImageBuffer::from_size(size)
    }
}

/// How the grid of the images is compared to the output grid to see if they match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridMatch {
    /// Grids match if they hold the same points with the same gpis in the same order. Anything
    /// else is subset or resampled.
    ExactIndex,
    /// Grids with the same number of points are taken to match without further checks.
    SizeOnly,
}

/// Parameters of the spatial resampling.
#[derive(Debug, Clone)]
pub struct ResampleConfig {
    /// Method per variable, variables not listed use `default_method`.
    pub methods: BTreeMap<String, ResampleMethod>,
    pub default_method: ResampleMethod,
    pub weight_function: WeightFunction,
    /// Fewest valid neighbours needed to compute a value.
    pub min_neighbours: usize,
    /// Search radius for neighbours, in meters.
    pub search_radius_m: f64,
    /// Most neighbours considered.
    pub max_neighbours: usize,
    /// Fill value per variable, variables not listed use `default_fill`.
    pub fill_values: BTreeMap<String, f64>,
    /// Fill value for locations that can't be resampled. `None` leaves them NaN.
    pub default_fill: Option<f64>,
}

impl Default for ResampleConfig {
    fn default() -> Self {
        ResampleConfig {
            methods: BTreeMap::new(),
            default_method: ResampleMethod::Nearest,
            weight_function: WeightFunction::Hamming,
            min_neighbours: 1,
            search_radius_m: 18_000.0,
            max_neighbours: 8,
            fill_values: BTreeMap::new(),
            default_fill: None,
        }
    }
}

impl ResampleConfig {
    pub fn method(&self, variable: &str) -> ResampleMethod {
        self.methods
            .get(variable)
            .copied()
            .unwrap_or(self.default_method)
    }

    pub fn fill_value(&self, variable: &str) -> Option<f64> {
        self.fill_values
            .get(variable)
            .copied()
            .or(self.default_fill)
    }

    fn validate(&self) -> ReshuffleResult<()> {
        if !(self.search_radius_m > 0.0) {
            return Err(ReshuffleError::Config(format!(
                "search radius must be positive, got {}",
                self.search_radius_m
            )));
        }

        if self.max_neighbours == 0 || self.min_neighbours > self.max_neighbours {
            return Err(ReshuffleError::Config(format!(
                "need 0 < min neighbours <= max neighbours, got {} and {}",
                self.min_neighbours, self.max_neighbours
            )));
        }

        Ok(())
    }
}

/// Everything that controls a reshuffle run.
#[derive(Debug, Clone)]
pub struct ReshuffleConfig {
    pub image_buffer: ImageBuffer,
    /// Worker threads for reading and writing. 1 does everything on the calling thread.
    pub n_proc: usize,
    /// Skip dates that can't be read and cells that can't be written instead of stopping.
    pub ignore_errors: bool,
    pub resample: ResampleConfig,
    pub grid_match: GridMatch,
    /// In ragged output, drop observations whose time equals `missing_time_sentinel`.
    pub exclude_missing_time_stamps: bool,
    pub missing_time_sentinel: f64,
    /// printf style template for cell file names, e.g. `%04d.sqlite`.
    pub filename_template: String,
    pub grid_name: String,
    pub log_dir_name: String,
    /// Attributes written to every cell file.
    pub global_attributes: Attributes,
    /// Attributes per output variable. When empty, the metadata of the first image is used.
    pub ts_attributes: BTreeMap<String, Attributes>,
    /// Output names for variables, variables not listed keep their name.
    pub variable_rename: BTreeMap<String, String>,
    pub time_units: TimeUnits,
    /// zlib compression of the data chunks in cell files.
    pub compression: bool,
    /// How often to try opening a locked cell file.
    pub write_retries: u32,
    pub write_retry_delay: Duration,
}

impl Default for ReshuffleConfig {
    fn default() -> Self {
        ReshuffleConfig {
            image_buffer: ImageBuffer::Days(100),
            n_proc: 1,
            ignore_errors: false,
            resample: ResampleConfig::default(),
            grid_match: GridMatch::ExactIndex,
            exclude_missing_time_stamps: true,
            missing_time_sentinel: -9999.0,
            filename_template: "%04d.sqlite".into(),
            grid_name: "grid.sqlite".into(),
            log_dir_name: "000_log".into(),
            global_attributes: Attributes::new(),
            ts_attributes: BTreeMap::new(),
            variable_rename: BTreeMap::new(),
            time_units: TimeUnits::default(),
            compression: true,
            write_retries: 10,
            write_retry_delay: Duration::from_secs(3),
        }
    }
}

impl ReshuffleConfig {
    /// Check the configuration for values that can't work.
    pub fn validate(&self) -> ReshuffleResult<()> {
        if self.n_proc == 0 {
            return Err(ReshuffleError::Config("n_proc must be at least 1".into()));
        }

        if let ImageBuffer::Days(0) = self.image_buffer {
            return Err(ReshuffleError::Config("image buffer must hold at least 1 image".into()));
        }

        if self.write_retries == 0 {
            return Err(ReshuffleError::Config("write_retries must be at least 1".into()));
        }

        render_cell_filename(&self.filename_template, 0)?;

        if self.grid_name.is_empty() || self.log_dir_name.is_empty() {
            return Err(ReshuffleError::Config("grid and log names must not be empty".into()));
        }

        let mut targets: Vec<&String> = self.variable_rename.values().collect();
        targets.sort();
        if targets.windows(2).any(|w| w[0] == w[1]) {
            return Err(ReshuffleError::Config(
                "two variables are renamed to the same name".into(),
            ));
        }

        self.resample.validate()
    }

    /// Output name of a variable.
    pub fn output_name<'a>(&'a self, variable: &'a str) -> &'a str {
        self.variable_rename
            .get(variable)
            .map(String::as_str)
            .unwrap_or(variable)
    }

    /// File name of the archive for a cell.
    pub fn cell_filename(&self, cell: i32) -> ReshuffleResult<String> {
        render_cell_filename(&self.filename_template, cell)
    }
}

/**
 * Render a printf style file name template holding exactly one integer conversion.
 *
 * Supports `%d`, `%Nd` and `%0Nd`, plus `%%` for a literal percent sign.
 */
fn render_cell_filename(template: &str, cell: i32) -> ReshuffleResult<String> {
    let bad = || ReshuffleError::Config(format!("invalid file name template: {}", template));

    let mut out = String::with_capacity(template.len() + 8);
    let mut chars = template.chars().peekable();
    let mut conversions = 0;

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }

        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }

        let zero_pad = chars.peek() == Some(&'0');
        if zero_pad {
            chars.next();
        }

        let mut width = String::new();
        while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
            width.push(*d);
            chars.next();
        }
        let width: usize = if width.is_empty() { 0 } else { width.parse().map_err(|_| bad())? };

        match chars.next() {
            Some('d') | Some('i') => {}
            _ => return Err(bad()),
        }

        if zero_pad {
            out.push_str(&format!("{:0width$}", cell, width = width));
        } else {
            out.push_str(&format!("{:width$}", cell, width = width));
        }
        conversions += 1;
    }

    if conversions != 1 {
        return Err(bad());
    }

    Ok(out)
}
