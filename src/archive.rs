/*!
 * Per cell time series archives.
 *
 * Every cell of the output grid gets one SQLite file. Appends add a chunk holding the new time
 * steps (orthogonal layout) or observations (ragged layout) of all locations of the cell, data
 * is stored as little endian `f64` blobs that are optionally zlib compressed.
 */

use crate::{
    bulk::Layout,
    error::{ReshuffleError, ReshuffleResult},
    image::{AttrValue, Attributes},
    time_units::TimeUnits,
};
use chrono::NaiveDateTime;
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use log::{debug, error};
use rusqlite::{
    params, Connection, ErrorCode, OpenFlags, OptionalExtension, Transaction, TransactionBehavior,
};
use rustc_hash::FxHashMap as HashMap;
use std::{
    collections::BTreeMap,
    io::{Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

/// Attribute naming the layout of an archive.
pub const FORMAT_ATTRIBUTE: &str = "timeSeries_format";
/// Attribute holding the units of the stored times.
pub const TIME_UNITS_ATTRIBUTE: &str = "time_units";

/// One cell worth of a block, plain data that can be handed to a writer thread.
#[derive(Debug, Clone, PartialEq)]
pub struct CellChunk {
    pub cell: i32,
    pub gpis: Vec<i64>,
    pub lons: Vec<f64>,
    pub lats: Vec<f64>,
    /// Per variable, location major: `gpis.len()` rows of `n_times` values.
    pub data: BTreeMap<String, Vec<f64>>,
    pub n_times: usize,
}

impl CellChunk {
    pub fn n_locations(&self) -> usize {
        self.gpis.len()
    }

    /// The values of one location of a variable.
    pub fn row(&self, variable: &str, loc: usize) -> Option<&[f64]> {
        let start = loc * self.n_times;
        self.data
            .get(variable)
            .and_then(|values| values.get(start..(start + self.n_times)))
    }

    fn check_shape(&self) -> ReshuffleResult<()> {
        let n = self.n_locations();
        if self.lons.len() != n || self.lats.len() != n {
            return Err(ReshuffleError::Config(format!(
                "cell {} has {} gpis but {} lons and {} lats",
                self.cell,
                n,
                self.lons.len(),
                self.lats.len()
            )));
        }

        for (name, values) in &self.data {
            if values.len() != n * self.n_times {
                return Err(ReshuffleError::Config(format!(
                    "variable {} of cell {} has {} values, expected {} x {}",
                    name,
                    self.cell,
                    values.len(),
                    n,
                    self.n_times
                )));
            }
        }

        Ok(())
    }
}

/// Settings of the cell writers, copied out of the run configuration.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub compression: bool,
    pub time_units: TimeUnits,
    /// Drop ragged observations whose time equals `missing_time_sentinel`.
    pub exclude_missing_time_stamps: bool,
    pub missing_time_sentinel: f64,
    /// Fill value of the time variable in resampled ragged data. Observations with this time
    /// are dropped.
    pub time_fill_value: Option<f64>,
    pub retries: u32,
    pub retry_delay: Duration,
}

/**
 * Append time steps shared by all locations of a cell.
 *
 * The first append fixes the locations of the archive, later appends must have the same
 * locations in the same order.
 *
 * #Errors
 * `LocationMismatch` if the locations differ from the ones in the archive, `WriteContention` if
 * the file stayed locked through all retries.
 */
pub fn write_orthogonal(
    path: &Path,
    chunk: &CellChunk,
    timestamps: &[NaiveDateTime],
    global_attributes: &Attributes,
    ts_attributes: &BTreeMap<String, Attributes>,
    options: &WriteOptions,
) -> ReshuffleResult<()> {
    if chunk.n_times != timestamps.len() {
        return Err(ReshuffleError::Config(format!(
            "cell {} has {} time steps for {} timestamps",
            chunk.cell,
            chunk.n_times,
            timestamps.len()
        )));
    }
    chunk.check_shape()?;

    debug!(target: "archive", "appending {} time steps to cell {}", timestamps.len(), chunk.cell);

    let times: Vec<f64> = timestamps
        .iter()
        .map(|&ts| options.time_units.encode(ts))
        .collect();

    with_retries(chunk.cell, path, options, |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        check_layout(&tx, chunk.cell, Layout::Orthogonal)?;

        let stored = stored_gpis(&tx)?;
        if stored.is_empty() {
            insert_locations(&tx, chunk, 0, &chunk.gpis)?;
        } else if stored != chunk.gpis {
            return Err(ReshuffleError::LocationMismatch { cell: chunk.cell });
        }

        write_attributes(&tx, chunk, Layout::Orthogonal, global_attributes, ts_attributes, None, options)?;

        let id = next_chunk_id(&tx)?;
        tx.execute(
            "INSERT INTO chunks (chunk, n_values, zlib, times, loc_idx) VALUES (?1, ?2, ?3, ?4, NULL)",
            params![id, times.len() as i64, options.compression, encode_f64s(&times, options.compression)?],
        )?;

        let mut stmt =
            tx.prepare("INSERT INTO chunk_data (chunk, variable, data) VALUES (?1, ?2, ?3)")?;
        for (name, values) in &chunk.data {
            stmt.execute(params![id, name, encode_f64s(values, options.compression)?])?;
        }
        drop(stmt);

        tx.commit()?;
        Ok(())
    })
}

/**
 * Append observations that each carry their own time.
 *
 * The chunk is flattened into one record per location and time step, location by location.
 * Records with a time that isn't finite are dropped, as are records with the fill value of the
 * time variable after resampling and, if configured, records at the missing time sentinel.
 *
 * #Returns
 * The number of observations written.
 */
pub fn write_ragged(
    path: &Path,
    chunk: &CellChunk,
    time_key: &str,
    resampled: bool,
    global_attributes: &Attributes,
    ts_attributes: &BTreeMap<String, Attributes>,
    options: &WriteOptions,
) -> ReshuffleResult<usize> {
    chunk.check_shape()?;

    let gpi_time = chunk
        .data
        .get(time_key)
        .ok_or_else(|| ReshuffleError::field_lookup(time_key, format!("cell {}", chunk.cell)))?;

    let keep = |t: f64| -> bool {
        if !t.is_finite() {
            return false;
        }
        if resampled && options.time_fill_value == Some(t) {
            return false;
        }
        !(options.exclude_missing_time_stamps && t == options.missing_time_sentinel)
    };

    let records: Vec<usize> = (0..gpi_time.len()).filter(|&i| keep(gpi_time[i])).collect();
    let times: Vec<f64> = records.iter().map(|&i| gpi_time[i]).collect();

    let n_times = chunk.n_times.max(1);
    let data: BTreeMap<&String, Vec<f64>> = chunk
        .data
        .iter()
        .filter(|(name, _)| name.as_str() != time_key)
        .map(|(name, values)| (name, records.iter().map(|&i| values[i]).collect()))
        .collect();

    debug!(
        target: "archive",
        "appending {} of {} observations to cell {}",
        records.len(),
        gpi_time.len(),
        chunk.cell
    );

    with_retries(chunk.cell, path, options, |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        check_layout(&tx, chunk.cell, Layout::Ragged)?;

        let stored = stored_gpis(&tx)?;
        let mut positions: HashMap<i64, i64> = stored
            .iter()
            .enumerate()
            .map(|(idx, &gpi)| (gpi, idx as i64))
            .collect();

        let new_gpis: Vec<i64> = chunk
            .gpis
            .iter()
            .copied()
            .filter(|gpi| !positions.contains_key(gpi))
            .collect();
        insert_locations(&tx, chunk, stored.len(), &new_gpis)?;
        for (k, &gpi) in new_gpis.iter().enumerate() {
            positions.insert(gpi, (stored.len() + k) as i64);
        }

        write_attributes(
            &tx,
            chunk,
            Layout::Ragged,
            global_attributes,
            ts_attributes,
            Some(time_key),
            options,
        )?;

        if !records.is_empty() {
            let loc_idx: Vec<i64> = records
                .iter()
                .map(|&i| positions[&chunk.gpis[i / n_times]])
                .collect();

            let id = next_chunk_id(&tx)?;
            tx.execute(
                "INSERT INTO chunks (chunk, n_values, zlib, times, loc_idx) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id,
                    records.len() as i64,
                    options.compression,
                    encode_f64s(&times, options.compression)?,
                    encode_i64s(&loc_idx, options.compression)?
                ],
            )?;

            let mut stmt =
                tx.prepare("INSERT INTO chunk_data (chunk, variable, data) VALUES (?1, ?2, ?3)")?;
            for (name, values) in &data {
                stmt.execute(params![id, name, encode_f64s(values, options.compression)?])?;
            }
        }

        tx.commit()?;
        Ok(records.len())
    })
}

/// Open the archive and run `write`, trying again while the file is locked by another writer.
fn with_retries<T, F>(cell: i32, path: &Path, options: &WriteOptions, mut write: F) -> ReshuffleResult<T>
where
    F: FnMut(&mut Connection) -> ReshuffleResult<T>,
{
    let attempts = options.retries.max(1);

    for attempt in 1..=attempts {
        let res = open_archive_to_write(path).and_then(|mut conn| write(&mut conn));

        match res {
            Err(ReshuffleError::Database(err)) if is_contention(&err) => {
                error!(
                    target: "archive",
                    "could not write to file for cell {} (attempt {} of {}): {}",
                    cell,
                    attempt,
                    attempts,
                    err
                );
                if attempt < attempts {
                    std::thread::sleep(options.retry_delay);
                }
            }
            res => return res,
        }
    }

    Err(ReshuffleError::WriteContention { cell, attempts })
}

fn is_contention(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(err, _) => matches!(
            err.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen
        ),
        _ => false,
    }
}

fn open_archive_to_write(path: &Path) -> ReshuffleResult<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;

    // Waiting is done by the retries.
    conn.busy_timeout(Duration::from_millis(100))?;
    conn.execute_batch(include_str!("archive/create_archive.sql"))?;

    Ok(conn)
}

fn check_layout(tx: &Transaction, cell: i32, layout: Layout) -> ReshuffleResult<()> {
    let stored: Option<String> = tx
        .query_row(
            "SELECT text FROM global_attributes WHERE name = ?1",
            [FORMAT_ATTRIBUTE],
            |row| row.get(0),
        )
        .optional()?
        .flatten();

    match stored {
        Some(name) if name != layout.format_name() => Err(ReshuffleError::Config(format!(
            "archive of cell {} holds {} time series, can't append {}",
            cell,
            name,
            layout.format_name()
        ))),
        _ => Ok(()),
    }
}

fn stored_gpis(tx: &Transaction) -> ReshuffleResult<Vec<i64>> {
    let mut stmt = tx.prepare("SELECT gpi FROM locations ORDER BY idx")?;
    let gpis = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(gpis)
}

/// Store the locations of `gpis`, numbering them from `first_idx`.
fn insert_locations(
    tx: &Transaction,
    chunk: &CellChunk,
    first_idx: usize,
    gpis: &[i64],
) -> ReshuffleResult<()> {
    if gpis.is_empty() {
        return Ok(());
    }

    let coords: HashMap<i64, (f64, f64)> = chunk
        .gpis
        .iter()
        .zip(chunk.lons.iter().zip(&chunk.lats))
        .map(|(&gpi, (&lon, &lat))| (gpi, (lon, lat)))
        .collect();

    let mut stmt = tx.prepare("INSERT INTO locations (idx, gpi, lon, lat) VALUES (?1, ?2, ?3, ?4)")?;
    for (k, gpi) in gpis.iter().enumerate() {
        let (lon, lat) = coords[gpi];
        stmt.execute(params![(first_idx + k) as i64, gpi, lon, lat])?;
    }

    Ok(())
}

fn write_attributes(
    tx: &Transaction,
    chunk: &CellChunk,
    layout: Layout,
    global_attributes: &Attributes,
    ts_attributes: &BTreeMap<String, Attributes>,
    time_key: Option<&str>,
    options: &WriteOptions,
) -> ReshuffleResult<()> {
    let min_max = |values: &[f64]| {
        values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
    };
    let (lat_min, lat_max) = min_max(&chunk.lats);
    let (lon_min, lon_max) = min_max(&chunk.lons);

    let mut global = global_attributes.clone();
    global.insert(FORMAT_ATTRIBUTE.into(), layout.format_name().into());
    global.insert(TIME_UNITS_ATTRIBUTE.into(), options.time_units.to_string().into());
    global.insert("geospatial_lat_min".into(), lat_min.into());
    global.insert("geospatial_lat_max".into(), lat_max.into());
    global.insert("geospatial_lon_min".into(), lon_min.into());
    global.insert("geospatial_lon_max".into(), lon_max.into());

    let mut stmt = tx.prepare(
        "INSERT OR REPLACE INTO global_attributes (name, number, text) VALUES (?1, ?2, ?3)",
    )?;
    for (name, value) in &global {
        let (number, text) = split_attr(value);
        stmt.execute(params![name, number, text])?;
    }

    let mut stmt = tx.prepare(
        "INSERT OR REPLACE INTO variable_attributes (variable, name, number, text) \
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (variable, attrs) in ts_attributes {
        if Some(variable.as_str()) == time_key || !chunk.data.contains_key(variable) {
            continue;
        }
        for (name, value) in attrs {
            let (number, text) = split_attr(value);
            stmt.execute(params![variable, name, number, text])?;
        }
    }

    Ok(())
}

fn split_attr(value: &AttrValue) -> (Option<f64>, Option<&str>) {
    match value {
        AttrValue::Number(v) => (Some(*v), None),
        AttrValue::Text(v) => (None, Some(v.as_str())),
    }
}

fn join_attr(number: Option<f64>, text: Option<String>) -> Option<AttrValue> {
    match (number, text) {
        (Some(v), _) => Some(AttrValue::Number(v)),
        (None, Some(v)) => Some(AttrValue::Text(v)),
        (None, None) => None,
    }
}

fn next_chunk_id(tx: &Transaction) -> ReshuffleResult<i64> {
    let id: i64 = tx.query_row("SELECT COALESCE(MAX(chunk) + 1, 0) FROM chunks", [], |row| {
        row.get(0)
    })?;
    Ok(id)
}

fn encode_bytes(raw: Vec<u8>, compress: bool) -> ReshuffleResult<Vec<u8>> {
    if !compress {
        return Ok(raw);
    }

    let mut encoder = ZlibEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::default());
    encoder.write_all(&raw)?;
    Ok(encoder.finish()?)
}

fn decode_bytes(blob: Vec<u8>, compressed: bool) -> ReshuffleResult<Vec<u8>> {
    if !compressed {
        return Ok(blob);
    }

    let mut raw = Vec::with_capacity(blob.len() * 2);
    ZlibDecoder::new(blob.as_slice()).read_to_end(&mut raw)?;
    Ok(raw)
}

fn encode_f64s(values: &[f64], compress: bool) -> ReshuffleResult<Vec<u8>> {
    encode_bytes(values.iter().flat_map(|v| v.to_le_bytes()).collect(), compress)
}

fn encode_i64s(values: &[i64], compress: bool) -> ReshuffleResult<Vec<u8>> {
    encode_bytes(values.iter().flat_map(|v| v.to_le_bytes()).collect(), compress)
}

fn decode_words(blob: Vec<u8>, compressed: bool) -> ReshuffleResult<Vec<[u8; 8]>> {
    let raw = decode_bytes(blob, compressed)?;
    if raw.len() % 8 != 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("data blob of {} bytes is not a list of 8 byte values", raw.len()),
        )
        .into());
    }

    Ok(raw
        .chunks_exact(8)
        .map(|w| [w[0], w[1], w[2], w[3], w[4], w[5], w[6], w[7]])
        .collect())
}

fn decode_f64s(blob: Vec<u8>, compressed: bool) -> ReshuffleResult<Vec<f64>> {
    Ok(decode_words(blob, compressed)?
        .into_iter()
        .map(f64::from_le_bytes)
        .collect())
}

fn decode_i64s(blob: Vec<u8>, compressed: bool) -> ReshuffleResult<Vec<i64>> {
    Ok(decode_words(blob, compressed)?
        .into_iter()
        .map(i64::from_le_bytes)
        .collect())
}

/// A location stored in an archive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub gpi: i64,
    pub lon: f64,
    pub lat: f64,
}

/// The time series of one location.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    pub location: Location,
    /// Times in the units of the archive.
    pub times: Vec<f64>,
    pub data: BTreeMap<String, Vec<f64>>,
}

impl TimeSeries {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn timestamps(&self, units: &TimeUnits) -> Vec<NaiveDateTime> {
        self.times.iter().map(|&t| units.decode(t)).collect()
    }
}

/// Read access to the archive of one cell.
pub struct CellArchive {
    conn: Connection,
    path: PathBuf,
}

impl CellArchive {
    pub fn open<P: AsRef<Path>>(path: P) -> ReshuffleResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no archive at {}", path.display()),
            )
            .into());
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;

        Ok(CellArchive {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn global_attributes(&self) -> ReshuffleResult<Attributes> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, number, text FROM global_attributes")?;

        let mut attrs = Attributes::new();
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<f64>>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;
        for row in rows {
            let (name, number, text) = row?;
            if let Some(value) = join_attr(number, text) {
                attrs.insert(name, value);
            }
        }

        Ok(attrs)
    }

    pub fn variable_attributes(&self, variable: &str) -> ReshuffleResult<Attributes> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, number, text FROM variable_attributes WHERE variable = ?1")?;

        let mut attrs = Attributes::new();
        let rows = stmt.query_map([variable], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<f64>>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;
        for row in rows {
            let (name, number, text) = row?;
            if let Some(value) = join_attr(number, text) {
                attrs.insert(name, value);
            }
        }

        Ok(attrs)
    }

    /// The layout, `None` for an archive that was never written to.
    pub fn layout(&self) -> ReshuffleResult<Option<Layout>> {
        Ok(self
            .global_attributes()?
            .get(FORMAT_ATTRIBUTE)
            .and_then(|v| match v {
                AttrValue::Text(name) => Layout::from_format_name(name),
                AttrValue::Number(_) => None,
            }))
    }

    pub fn time_units(&self) -> ReshuffleResult<Option<TimeUnits>> {
        match self.global_attributes()?.get(TIME_UNITS_ATTRIBUTE) {
            Some(AttrValue::Text(units)) => Ok(Some(units.parse()?)),
            _ => Ok(None),
        }
    }

    /// The locations in storage order.
    pub fn locations(&self) -> ReshuffleResult<Vec<Location>> {
        let mut stmt = self
            .conn
            .prepare("SELECT gpi, lon, lat FROM locations ORDER BY idx")?;
        let locations = stmt
            .query_map([], |row| {
                Ok(Location {
                    gpi: row.get(0)?,
                    lon: row.get(1)?,
                    lat: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(locations)
    }

    pub fn n_locations(&self) -> ReshuffleResult<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM locations", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// All data of one location, in the order it was appended.
    pub fn read_ts(&self, gpi: i64) -> ReshuffleResult<TimeSeries> {
        let (idx, location) = self
            .conn
            .query_row(
                "SELECT idx, lon, lat FROM locations WHERE gpi = ?1",
                [gpi],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        Location {
                            gpi,
                            lon: row.get(1)?,
                            lat: row.get(2)?,
                        },
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| {
                ReshuffleError::field_lookup(format!("gpi {}", gpi), self.path.display().to_string())
            })?;

        let layout = self.layout()?.unwrap_or(Layout::Orthogonal);

        let mut chunk_stmt = self
            .conn
            .prepare("SELECT chunk, n_values, zlib, times, loc_idx FROM chunks ORDER BY chunk")?;
        let mut data_stmt = self
            .conn
            .prepare("SELECT variable, data FROM chunk_data WHERE chunk = ?1")?;

        let chunks = chunk_stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)? as usize,
                    row.get::<_, bool>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, Option<Vec<u8>>>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut times = Vec::new();
        let mut data: BTreeMap<String, Vec<f64>> = BTreeMap::new();

        for (id, n_values, zlib, times_blob, loc_blob) in chunks {
            let chunk_times = decode_f64s(times_blob, zlib)?;

            // Positions of this location within the chunk's blobs, and of its values.
            let picks: Vec<(usize, usize)> = match (layout, loc_blob) {
                (Layout::Ragged, Some(blob)) => decode_i64s(blob, zlib)?
                    .into_iter()
                    .enumerate()
                    .filter(|(_, loc)| *loc == idx)
                    .map(|(i, _)| (i, i))
                    .collect(),
                _ => (0..n_values)
                    .map(|t| (t, idx as usize * n_values + t))
                    .collect(),
            };

            let n_before = times.len();
            times.extend(picks.iter().map(|&(t, _)| chunk_times[t]));

            let rows = data_stmt
                .query_map([id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;

            for (name, blob) in rows {
                let values = decode_f64s(blob, zlib)?;
                let series = data
                    .entry(name)
                    .or_insert_with(|| vec![f64::NAN; n_before]);
                series.extend(picks.iter().map(|&(_, i)| values.get(i).copied().unwrap_or(f64::NAN)));
            }

            // Variables not in this chunk.
            for series in data.values_mut() {
                series.resize(times.len(), f64::NAN);
            }
        }

        Ok(TimeSeries {
            location,
            times,
            data,
        })
    }
}
