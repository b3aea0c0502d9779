use chrono::{NaiveDate, NaiveDateTime};
use clap::Parser;
use log::LevelFilter;
use simple_logger::SimpleLogger;
use smapts::{
    ease36_cell_grid, ease36_grid_from_file, BoundingBox, Coord, ImageBuffer, NetcdfFieldSource,
    Overpass, ReshuffleConfig, ReshuffleError, ReshuffleResult, Reshuffler, SmapConfig,
    SmapL3Dataset, TimeUnits,
};
use std::{
    error::Error,
    fmt::{self, Display},
    path::PathBuf,
};

/// Time axis of the written archives.
const TIME_UNITS: &str = "seconds since 2000-01-01 12:00:00";

/*-------------------------------------------------------------------------------------------------
 *                               Parse Command Line Arguments
 *-----------------------------------------------------------------------------------------------*/
///
/// Convert SMAP L3 images into time series.
///
/// This program reads the daily SMAP L3 soil moisture files of a date range and appends them to
/// one time series archive per 5 degree cell of the 36 km EASE2 grid.
///
#[derive(Debug, Parser)]
#[clap(name = "smap_reshuffle")]
#[clap(author, version, about)]
struct SmapReshuffleOptionsInit {
    /// Root of the directory tree with the downloaded files.
    #[clap(env = "SMAP_DATA")]
    dataset_root: PathBuf,

    /// Directory to write the time series archives into.
    #[clap(env = "SMAP_TS")]
    timeseries_root: PathBuf,

    /// The first date to convert in the format YYYY-MM-DD or YYYY-MM-DDTHH:MM
    #[clap(parse(try_from_str=parse_datetime))]
    start: NaiveDateTime,

    /// The last date to convert in the format YYYY-MM-DD or YYYY-MM-DDTHH:MM
    #[clap(parse(try_from_str=parse_datetime))]
    end: NaiveDateTime,

    /// Parameters to convert as named in the downloaded files, e.g. soil_moisture.
    #[clap(required = true)]
    parameters: Vec<String>,

    /// Per observation time variable. Use "none" to write one timestamp per image.
    #[clap(long, default_value = "tb_time_seconds")]
    time_key: String,

    /// The overpass to read, AM, PM or BOTH.
    #[clap(long, default_value = "AM", parse(try_from_str=parse_overpass))]
    overpass: Overpass,

    /// Append _am or _pm to the names of the converted variables.
    #[clap(long)]
    var_overpass_str: bool,

    /// Composite Release ID. Only files with this ID are converted.
    #[clap(long)]
    crid: Option<u32>,

    /// Only convert points in this box, given as bottom_lat,left_lon,top_lat,right_lon
    #[clap(long, parse(try_from_str=parse_bbox))]
    bbox: Option<BoundingBox>,

    /// A saved reduction of the EASE2 grid to convert, e.g. the land points.
    ///
    /// If this is not specified, then the program will check for it in the "SMAP_GRID"
    /// environment variable, and fall back to the global grid.
    #[clap(short, long)]
    #[clap(env = "SMAP_GRID")]
    grid: Option<PathBuf>,

    /// How many days to read before writing, -1 to read everything at once.
    #[clap(long, default_value = "100", allow_hyphen_values = true)]
    imgbuffer: ImageBuffer,

    /// Number of threads used to read files and write cells.
    ///
    /// Defaults to the number of CPUs.
    #[clap(short, long)]
    n_proc: Option<usize>,

    /// Skip days that can't be read and cells that can't be written instead of stopping.
    #[clap(long)]
    ignore_errors: bool,

    /// Keep observations without a valid timestamp.
    #[clap(long)]
    keep_missing_time_stamps: bool,

    /// Store the archive data without zlib compression.
    #[clap(long)]
    no_zlib: bool,

    /// Verbose output
    #[clap(short, long)]
    verbose: bool,
}

/// Parse a bounding box argument.
fn parse_bbox(bbox_str: &str) -> ReshuffleResult<BoundingBox> {
    let corners = bbox_str
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| ReshuffleError::Config(format!("invalid bounding box: {}", err)))?;

    if corners.len() != 4 {
        return Err(ReshuffleError::Config(
            "invalid number of coords in bounding box".into(),
        ));
    }

    let (min_lat, min_lon, max_lat, max_lon) = (corners[0], corners[1], corners[2], corners[3]);

    if min_lat >= max_lat || min_lon >= max_lon {
        return Err(ReshuffleError::Config(format!(
            concat!(
                "Minimum Lat/Lon must be less than Maximum Lat/Lon:",
                " min_lat={} max_lat={} min_lon={} max_lon={}"
            ),
            min_lat, max_lat, min_lon, max_lon
        )));
    }

    if min_lat < -90.0 || max_lat > 90.0 || min_lon < -180.0 || max_lon > 180.0 {
        return Err(ReshuffleError::Config(format!(
            concat!(
                "Lat/Lon are out of range (-90.0 to 90.0 and -180.0 to 180.0):",
                " min_lat={} max_lat={} min_lon={} max_lon={}"
            ),
            min_lat, max_lat, min_lon, max_lon
        )));
    }

    let ll = Coord {
        lat: min_lat,
        lon: min_lon,
    };
    let ur = Coord {
        lat: max_lat,
        lon: max_lon,
    };

    Ok(BoundingBox { ll, ur })
}

/// Parse a command line date with an optional time of day.
fn parse_datetime(dt_str: &str) -> ReshuffleResult<NaiveDateTime> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(dt_str, "%Y-%m-%dT%H:%M") {
        return Ok(dt);
    }

    NaiveDate::parse_from_str(dt_str, "%Y-%m-%d")
        .map(|d| d.and_hms(0, 0, 0))
        .map_err(|_| ReshuffleError::Config(format!("invalid date: {}", dt_str)))
}

fn parse_overpass(op_str: &str) -> ReshuffleResult<Overpass> {
    Overpass::from_name(op_str)
        .ok_or_else(|| ReshuffleError::Config(format!("unknown overpass: {}", op_str)))
}

#[derive(Debug)]
struct SmapReshuffleOptionsChecked {
    /// Root of the downloaded files.
    dataset_root: PathBuf,

    /// Output directory.
    timeseries_root: PathBuf,

    /// The start time.
    start: NaiveDateTime,

    /// The end time.
    end: NaiveDateTime,

    /// What to read.
    smap: SmapConfig,

    /// Saved grid to convert, the whole globe if `None`.
    grid_file: Option<PathBuf>,

    /// Points to convert, the whole grid if `None`.
    bbox: Option<BoundingBox>,

    /// How to write it.
    reshuffle: ReshuffleConfig,

    /// Verbose output
    verbose: bool,
}

impl Display for SmapReshuffleOptionsChecked {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        writeln!(f, "\n")?; // yes, two blank lines.
        writeln!(f, "     Dataset: {}", self.dataset_root.display())?;
        writeln!(f, " Time Series: {}", self.timeseries_root.display())?;
        writeln!(f, "       Start: {}", self.start)?;
        writeln!(f, "         End: {}", self.end)?;
        writeln!(f, "  Parameters: {}", self.smap.parameters.join(", "))?;
        match &self.smap.time_key {
            Some(key) => writeln!(f, "    Time Key: {}", key)?,
            None => writeln!(f, "    Time Key: none")?,
        }
        if let Some(op) = self.smap.overpass {
            writeln!(f, "    Overpass: {}", op.name())?;
        }
        match self.smap.crid {
            Some(crid) => writeln!(f, "        CRID: {}", crid)?,
            None => writeln!(f, "        CRID: not specified")?,
        }
        match &self.grid_file {
            Some(path) => writeln!(f, "        Grid: {}", path.display())?,
            None => writeln!(f, "        Grid: global 36 km EASE2")?,
        }
        match &self.bbox {
            Some(bbox) => writeln!(
                f,
                "Bounding Box: ({:.6}, {:.6}) <---> ({:.6}, {:.6})",
                bbox.ll.lat, bbox.ll.lon, bbox.ur.lat, bbox.ur.lon
            )?,
            None => writeln!(f, "Bounding Box: none")?,
        }
        writeln!(f, "Image Buffer: {:?}", self.reshuffle.image_buffer)?;
        writeln!(f, "     Threads: {}", self.reshuffle.n_proc)?;
        writeln!(f, "  Time Units: {}", self.reshuffle.time_units)?;
        writeln!(f, "\n")?; // yes, two blank lines.

        Ok(())
    }
}

/// Get the command line arguments and check them.
///
/// If there is missing data, try to fill it in with environment variables.
fn parse_args() -> ReshuffleResult<SmapReshuffleOptionsChecked> {
    let SmapReshuffleOptionsInit {
        dataset_root,
        timeseries_root,
        start,
        end,
        parameters,
        time_key,
        overpass,
        var_overpass_str,
        crid,
        bbox,
        grid,
        imgbuffer,
        n_proc,
        ignore_errors,
        keep_missing_time_stamps,
        no_zlib,
        verbose,
    } = SmapReshuffleOptionsInit::parse();

    if end < start {
        return Err(ReshuffleError::Config(format!(
            "end {} is before start {}",
            end, start
        )));
    }

    let time_key = match time_key.as_str() {
        "none" | "" => None,
        _ => Some(time_key),
    };

    let smap = SmapConfig {
        parameters,
        overpass: Some(overpass),
        var_overpass_str,
        crid,
        time_key,
        ..SmapConfig::default()
    };

    let reshuffle = ReshuffleConfig {
        image_buffer: imgbuffer,
        n_proc: n_proc.unwrap_or_else(num_cpus::get).max(1),
        ignore_errors,
        exclude_missing_time_stamps: !keep_missing_time_stamps,
        time_units: TIME_UNITS.parse::<TimeUnits>()?,
        compression: !no_zlib,
        ..ReshuffleConfig::default()
    };

    let checked = SmapReshuffleOptionsChecked {
        dataset_root,
        timeseries_root,
        start,
        end,
        smap,
        grid_file: grid,
        bbox,
        reshuffle,
        verbose,
    };

    if verbose {
        println!("{}", checked);
    }

    Ok(checked)
}

/*-------------------------------------------------------------------------------------------------
 *                                             MAIN
 *-----------------------------------------------------------------------------------------------*/
fn main() -> Result<(), Box<dyn Error>> {
    let opts = parse_args()?;

    let level = if opts.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    SimpleLogger::new()
        .with_level(LevelFilter::Warn)
        .with_module_level("smapts", level)
        .with_module_level("smap_reshuffle", level)
        .init()?;

    log::info!(
        "Converting images in {} from {} to {} into {}",
        opts.dataset_root.display(),
        opts.start,
        opts.end,
        opts.timeseries_root.display()
    );

    let grid = match &opts.grid_file {
        Some(path) => ease36_grid_from_file(path, opts.bbox.as_ref())?,
        None => ease36_cell_grid(opts.bbox.as_ref())?,
    };
    log::info!(
        "Output grid has {} points in {} cells",
        grid.len(),
        grid.unique_cells().len()
    );

    let reader = SmapL3Dataset::new(
        &opts.dataset_root,
        NetcdfFieldSource,
        opts.smap,
        Some(grid.clone()),
    )?;

    let mut reshuffler = Reshuffler::new(
        reader,
        Some(grid),
        &opts.timeseries_root,
        opts.start,
        opts.end,
        opts.reshuffle,
    )?;

    let summary = reshuffler.calc()?;

    log::info!(
        "Wrote {} images in {} blocks, {} cell writes, layout {}",
        summary.images,
        summary.blocks,
        summary.cells_written,
        summary
            .layout
            .map(|layout| layout.format_name())
            .unwrap_or("none")
    );

    for (date, msg) in &summary.failed_dates {
        log::warn!("Skipped {}: {}", date, msg);
    }

    for (cell, msg) in &summary.failed_cells {
        log::warn!("Could not write cell {}: {}", cell, msg);
    }

    log::info!("Run log in {}", summary.log_file.display());

    Ok(())
}
