/*!
 * Turning a run of images into per cell time series archives.
 */

use crate::{
    archive::{write_orthogonal, write_ragged, CellChunk, WriteOptions},
    bulk::{ImageBlock, ImageBulkReader, Layout},
    config::ReshuffleConfig,
    error::{ReshuffleError, ReshuffleResult},
    grid::CellGrid,
    image::{AttrValue, Attributes, ImageReader},
};
use chrono::{Local, NaiveDateTime};
use crossbeam_channel::bounded;
use log::{debug, error, info, warn};
use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::Write,
    ops::Range,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Instant,
};

const CHANNEL_SIZE: usize = 64;

/// Where a run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    GridPersisted,
    ReadBlock,
    PartitionByCell,
    WriteCells,
    Done,
}

/// What happened during a run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub blocks: usize,
    pub images: usize,
    pub cells_written: usize,
    /// Dates that could not be read, with the reason.
    pub failed_dates: Vec<(NaiveDateTime, String)>,
    /// Cell archives that could not be written, with the reason.
    pub failed_cells: Vec<(i32, String)>,
    pub layout: Option<Layout>,
    pub log_file: PathBuf,
}

/**
 * Locations of a grid in cell order.
 *
 * If the grid is not sorted by cell, a stable sort order keeps the grid order of the locations
 * within each cell.
 */
#[derive(Debug, Clone)]
pub struct CellOrder {
    order: Option<Vec<usize>>,
    runs: Vec<(i32, Range<usize>)>,
}

impl CellOrder {
    pub fn new(grid: &CellGrid) -> Self {
        let cells = grid.cells();

        let order = if cells.windows(2).all(|w| w[0] <= w[1]) {
            None
        } else {
            let mut order: Vec<usize> = (0..cells.len()).collect();
            order.sort_by_key(|&i| cells[i]);
            Some(order)
        };

        let position = |k: usize| order.as_ref().map(|o| o[k]).unwrap_or(k);

        let mut runs: Vec<(i32, Range<usize>)> = vec![];
        for k in 0..cells.len() {
            let cell = cells[position(k)];
            match runs.last_mut() {
                Some((last, range)) if *last == cell => range.end = k + 1,
                _ => runs.push((cell, k..(k + 1))),
            }
        }

        CellOrder { order, runs }
    }

    /// Grid positions of the locations in a cell.
    fn positions(&self, range: &Range<usize>) -> Vec<usize> {
        match &self.order {
            Some(order) => order[range.clone()].to_vec(),
            None => range.clone().collect(),
        }
    }

    pub fn cells(&self) -> impl Iterator<Item = i32> + '_ {
        self.runs.iter().map(|(cell, _)| *cell)
    }

    pub fn n_cells(&self) -> usize {
        self.runs.len()
    }
}

/**
 * Split a block into one chunk per cell.
 *
 * Variables get their output names, the values of each cell are transposed to location major
 * order.
 */
pub fn partition_block(
    block: &ImageBlock,
    grid: &CellGrid,
    order: &CellOrder,
    config: &ReshuffleConfig,
) -> ReshuffleResult<Vec<CellChunk>> {
    if block.n_locations != grid.len() {
        return Err(ReshuffleError::Config(format!(
            "block has {} locations, the grid {}",
            block.n_locations,
            grid.len()
        )));
    }

    let mut outputs: BTreeMap<&str, &str> = BTreeMap::new();
    for name in block.data.keys() {
        let output = config.output_name(name);
        if let Some(other) = outputs.insert(output, name) {
            return Err(ReshuffleError::Config(format!(
                "variables {} and {} are both written to {}",
                other, name, output
            )));
        }
    }

    let n_loc = block.n_locations;
    let n_times = block.n_times();

    let chunks = order
        .runs
        .iter()
        .map(|(cell, range)| {
            let positions = order.positions(range);

            let data = block
                .data
                .iter()
                .map(|(name, values)| {
                    let mut cell_values = Vec::with_capacity(positions.len() * n_times);
                    for &p in &positions {
                        cell_values.extend((0..n_times).map(|t| values[t * n_loc + p]));
                    }
                    (config.output_name(name).to_string(), cell_values)
                })
                .collect();

            CellChunk {
                cell: *cell,
                gpis: positions.iter().map(|&p| grid.gpis()[p]).collect(),
                lons: positions.iter().map(|&p| grid.lons()[p]).collect(),
                lats: positions.iter().map(|&p| grid.lats()[p]).collect(),
                data,
                n_times,
            }
        })
        .collect();

    Ok(chunks)
}

/// The `time_coverage_end` attribute for a block.
fn time_coverage_end(block: &ImageBlock) -> AttrValue {
    match block.last_timestamp() {
        Some(ts) => AttrValue::Text(ts.format("%Y-%m-%d %H:%M:%S").to_string()),
        None => {
            warn!(target: "reshuffle", "could not infer time coverage from an empty block");
            AttrValue::Text("unknown".into())
        }
    }
}

/// Everything a writer needs besides the chunk, shared by all writer threads of a block.
struct WriteContext {
    layout: Layout,
    timestamps: Vec<NaiveDateTime>,
    time_key: Option<String>,
    resampled: bool,
    global_attributes: Attributes,
    ts_attributes: BTreeMap<String, Attributes>,
    options: WriteOptions,
}

impl WriteContext {
    fn write(&self, path: &Path, chunk: &CellChunk) -> ReshuffleResult<()> {
        match (self.layout, &self.time_key) {
            (Layout::Ragged, Some(time_key)) => {
                let n = write_ragged(
                    path,
                    chunk,
                    time_key,
                    self.resampled,
                    &self.global_attributes,
                    &self.ts_attributes,
                    &self.options,
                )?;
                debug!(
                    target: "reshuffle",
                    "ragged time series chunk for cell {} written, {} observations",
                    chunk.cell,
                    n
                );
                Ok(())
            }
            (Layout::Ragged, None) => Err(ReshuffleError::Config(
                "ragged layout without a time variable".into(),
            )),
            (Layout::Orthogonal, _) => write_orthogonal(
                path,
                chunk,
                &self.timestamps,
                &self.global_attributes,
                &self.ts_attributes,
                &self.options,
            ),
        }
    }
}

/// Plain text log of a run in the log directory of the output.
struct RunLog {
    file: File,
    path: PathBuf,
}

impl RunLog {
    fn create(dir: &Path) -> ReshuffleResult<Self> {
        std::fs::create_dir_all(dir)?;

        let path = dir.join(format!("img2ts_{}.log", Local::now().format("%Y%m%d%H%M")));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(RunLog { file, path })
    }

    fn line(&mut self, level: &str, msg: &str) -> ReshuffleResult<()> {
        writeln!(
            self.file,
            "{} {:<5} {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            level,
            msg
        )?;
        Ok(())
    }
}

/// Drives a run: reads the images of a date range and appends them to the cell archives.
pub struct Reshuffler<R: ImageReader> {
    reader: R,
    target_grid: Option<CellGrid>,
    output: PathBuf,
    start: NaiveDateTime,
    end: NaiveDateTime,
    config: ReshuffleConfig,
    state: RunState,
}

impl<R: ImageReader> Reshuffler<R> {
    /**
     * Set up a run.
     *
     * #Arguments
     * * reader - delivers the images.
     * * target_grid - the output grid, `None` to write on the grid of the reader.
     * * output - the directory for the grid file, the cell archives, and the log directory.
     * * start, end - the date range, both included.
     * * config - everything else.
     */
    pub fn new<P: AsRef<Path>>(
        reader: R,
        target_grid: Option<CellGrid>,
        output: P,
        start: NaiveDateTime,
        end: NaiveDateTime,
        config: ReshuffleConfig,
    ) -> ReshuffleResult<Self> {
        config.validate()?;

        if end < start {
            return Err(ReshuffleError::Config(format!(
                "end {} is before start {}",
                end, start
            )));
        }

        Ok(Reshuffler {
            reader,
            target_grid,
            output: output.as_ref().to_path_buf(),
            start,
            end,
            config,
            state: RunState::Idle,
        })
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn config(&self) -> &ReshuffleConfig {
        &self.config
    }

    /**
     * Run the whole date range.
     *
     * The grid is saved first, then every block of images is partitioned by cell and appended
     * to the cell archives.
     *
     * #Errors
     * The first error that can't be skipped. With `ignore_errors` dates that can't be read and
     * cells that can't be written are only logged and listed in the summary.
     */
    pub fn calc(&mut self) -> ReshuffleResult<RunSummary> {
        let run_start = Instant::now();
        let config = &self.config;
        let state = &mut self.state;

        std::fs::create_dir_all(&self.output)?;
        let mut run_log = RunLog::create(&self.output.join(&config.log_dir_name))?;
        run_log.line("INFO", &format!("reshuffling {} to {}", self.start, self.end))?;

        let mut bulk = ImageBulkReader::new(
            &self.reader,
            self.target_grid.as_ref(),
            self.start,
            self.end,
            config,
        )?;
        let grid = bulk.output_grid();

        grid.save(self.output.join(&config.grid_name))?;
        set_state(state, RunState::GridPersisted);
        info!(target: "reshuffle", "grid with {} points saved", grid.len());

        let order = CellOrder::new(grid);
        debug!(target: "reshuffle", "{} cells", order.n_cells());

        let mut summary = RunSummary {
            log_file: run_log.path.clone(),
            ..RunSummary::default()
        };
        let mut ts_attributes: Option<BTreeMap<String, Attributes>> = None;

        loop {
            set_state(state, RunState::ReadBlock);
            let block_start = Instant::now();

            let next = bulk.next();
            for (ts, msg) in bulk.take_failed() {
                run_log.line("ERROR", &format!("could not read {}: {}", ts, msg))?;
                summary.failed_dates.push((ts, msg));
            }

            let block = match next {
                Some(Ok(block)) => block,
                Some(Err(err)) => {
                    run_log.line("ERROR", &err.to_string())?;
                    return Err(err);
                }
                None => break,
            };

            info!(target: "reshuffle", "finished reading bulk with {} images", block.n_times());
            summary.blocks += 1;
            summary.images += block.n_times();
            summary.layout = Some(block.layout);

            set_state(state, RunState::PartitionByCell);
            let attributes = ts_attributes.get_or_insert_with(|| {
                if config.ts_attributes.is_empty() {
                    block
                        .metadata
                        .iter()
                        .map(|(name, attrs)| (config.output_name(name).to_string(), attrs.clone()))
                        .collect()
                } else {
                    config.ts_attributes.clone()
                }
            });

            let chunks = partition_block(&block, grid, &order, config)?;

            let mut global_attributes = config.global_attributes.clone();
            global_attributes.insert("time_coverage_end".into(), time_coverage_end(&block));

            let time_key = block
                .time_key
                .as_deref()
                .map(|key| config.output_name(key).to_string());

            let context = Arc::new(WriteContext {
                layout: block.layout,
                timestamps: block.timestamps.clone(),
                resampled: block.resampled,
                global_attributes,
                ts_attributes: attributes.clone(),
                options: WriteOptions {
                    compression: config.compression,
                    time_units: config.time_units,
                    exclude_missing_time_stamps: config.exclude_missing_time_stamps,
                    missing_time_sentinel: config.missing_time_sentinel,
                    time_fill_value: block
                        .time_key
                        .as_deref()
                        .and_then(|key| config.resample.fill_value(key)),
                    retries: config.write_retries,
                    retry_delay: config.write_retry_delay,
                },
                time_key,
            });
            drop(block);

            let mut jobs = Vec::with_capacity(chunks.len());
            for chunk in chunks {
                jobs.push((self.output.join(config.cell_filename(chunk.cell)?), chunk));
            }

            set_state(state, RunState::WriteCells);
            let n_jobs = jobs.len();
            let results = write_cells(jobs, context, config.n_proc)?;

            let mut first_error = None;
            for (cell, res) in results {
                match res {
                    Ok(()) => summary.cells_written += 1,
                    Err(err) => {
                        error!(target: "reshuffle", "writing cell {} failed: {}", cell, err);
                        run_log.line("ERROR", &format!("could not write cell {}: {}", cell, err))?;
                        summary.failed_cells.push((cell, err.to_string()));
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                    }
                }
            }

            if let Some(err) = first_error {
                if !config.ignore_errors {
                    return Err(err);
                }
            }

            let elapsed = block_start.elapsed().as_secs_f64();
            info!(
                target: "reshuffle",
                "block {} written to {} cells in {:.2}s",
                summary.blocks,
                n_jobs,
                elapsed
            );
            run_log.line(
                "INFO",
                &format!(
                    "block {}: {} images, {} cells, {:.2}s",
                    summary.blocks, summary.images, n_jobs, elapsed
                ),
            )?;
        }

        set_state(state, RunState::Done);

        let elapsed = run_start.elapsed().as_secs_f64();
        let msg = format!(
            "done: {} blocks, {} images, {} cell writes, {} failed dates, {} failed cells, {:.2}s",
            summary.blocks,
            summary.images,
            summary.cells_written,
            summary.failed_dates.len(),
            summary.failed_cells.len(),
            elapsed
        );
        info!(target: "reshuffle", "{}", msg);
        run_log.line("INFO", &msg)?;

        Ok(summary)
    }
}

fn set_state(state: &mut RunState, next: RunState) {
    debug!(target: "reshuffle", "{:?} -> {:?}", state, next);
    *state = next;
}

/// Write all chunks of a block, on worker threads if `n_proc` > 1. Results are sorted by cell.
fn write_cells(
    jobs: Vec<(PathBuf, CellChunk)>,
    context: Arc<WriteContext>,
    n_proc: usize,
) -> ReshuffleResult<Vec<(i32, ReshuffleResult<()>)>> {
    if n_proc <= 1 || jobs.len() <= 1 {
        return Ok(jobs
            .iter()
            .map(|(path, chunk)| (chunk.cell, context.write(path, chunk)))
            .collect());
    }

    let n_workers = n_proc.min(jobs.len());
    let (to_writers, from_main) = bounded::<(PathBuf, CellChunk)>(CHANNEL_SIZE);
    let (to_main, from_writers) = bounded(jobs.len());

    let mut handles = Vec::with_capacity(n_workers);
    for i in 0..n_workers {
        let from_main = from_main.clone();
        let to_main = to_main.clone();
        let context = Arc::clone(&context);

        let jh = thread::Builder::new()
            .name(format!("smapts-write-{}", i))
            .spawn(move || {
                for (path, chunk) in from_main {
                    let res = context.write(&path, &chunk);
                    if to_main.send((chunk.cell, res)).is_err() {
                        break;
                    }
                }
            })?;
        handles.push(jh);
    }
    drop(from_main);
    drop(to_main);

    for job in jobs {
        to_writers
            .send(job)
            .map_err(|_| ReshuffleError::Worker("all cell writers hung up".into()))?;
    }
    drop(to_writers);

    for jh in handles {
        jh.join()
            .map_err(|_| ReshuffleError::Worker("cell writing thread panicked".into()))?;
    }

    let mut results: Vec<(i32, ReshuffleResult<()>)> = from_writers.iter().collect();
    results.sort_by_key(|(cell, _)| *cell);
    Ok(results)
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::NaiveDate;

    fn grid() -> CellGrid {
        // Cells interleaved in grid order.
        CellGrid::with_cells(
            vec![0, 1, 2, 3, 4],
            vec![0.0, 10.0, 1.0, 11.0, 2.0],
            vec![0.0; 5],
            vec![3, 1, 3, 1, 2],
        )
        .unwrap()
    }

    fn block(n_times: usize) -> ImageBlock {
        let ts0 = NaiveDate::from_ymd(2020, 1, 1).and_hms(0, 0, 0);
        let mut data = BTreeMap::new();
        // Value is 100 * t + location.
        data.insert(
            "sm".to_string(),
            (0..n_times)
                .flat_map(|t| (0..5).map(move |loc| (100 * t + loc) as f64))
                .collect(),
        );

        ImageBlock {
            timestamps: (0..n_times)
                .map(|t| ts0 + chrono::Duration::days(t as i64))
                .collect(),
            data,
            metadata: BTreeMap::new(),
            n_locations: 5,
            layout: Layout::Orthogonal,
            time_key: None,
            resampled: false,
        }
    }

    #[test]
    fn test_cell_order_is_stable() {
        let order = CellOrder::new(&grid());
        assert_eq!(order.cells().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(order.positions(&order.runs[0].1), vec![1, 3]);
        assert_eq!(order.positions(&order.runs[1].1), vec![4]);
        assert_eq!(order.positions(&order.runs[2].1), vec![0, 2]);

        let sorted = CellGrid::with_cells(vec![0, 1, 2], vec![0.0; 3], vec![0.0; 3], vec![1, 1, 2])
            .unwrap();
        let order = CellOrder::new(&sorted);
        assert!(order.order.is_none());
        assert_eq!(order.n_cells(), 2);
    }

    #[test]
    fn test_partition_transposes_per_cell() {
        let grid = grid();
        let order = CellOrder::new(&grid);
        let mut config = ReshuffleConfig::default();
        config.variable_rename.insert("sm".into(), "soil_moisture".into());

        let chunks = partition_block(&block(2), &grid, &order, &config).unwrap();
        assert_eq!(chunks.len(), 3);

        let cell1 = &chunks[0];
        assert_eq!(cell1.cell, 1);
        assert_eq!(cell1.gpis, vec![1, 3]);
        assert_eq!(cell1.lons, vec![10.0, 11.0]);
        assert_eq!(cell1.n_times, 2);
        // Location major: gpi 1 at both times, then gpi 3.
        assert_eq!(cell1.data["soil_moisture"], vec![1.0, 101.0, 3.0, 103.0]);
        assert_eq!(cell1.row("soil_moisture", 1), Some(&[3.0, 103.0][..]));

        let total: usize = chunks.iter().map(|c| c.n_locations()).sum();
        assert_eq!(total, grid.len());
    }

    #[test]
    fn test_partition_checks_size() {
        let grid = CellGrid::with_cells(vec![0, 1], vec![0.0; 2], vec![0.0; 2], vec![1, 1]).unwrap();
        let order = CellOrder::new(&grid);
        assert!(partition_block(&block(1), &grid, &order, &ReshuffleConfig::default()).is_err());
    }

    #[test]
    fn test_partition_rejects_rename_onto_other_variable() {
        let grid = grid();
        let order = CellOrder::new(&grid);

        let mut block = block(1);
        let values = block.data["sm"].clone();
        block.data.insert("sm_raw".to_string(), values);

        let mut config = ReshuffleConfig::default();
        config.variable_rename.insert("sm_raw".into(), "sm".into());
        assert!(config.validate().is_ok());

        match partition_block(&block, &grid, &order, &config) {
            Err(ReshuffleError::Config(msg)) => assert!(msg.contains("sm_raw")),
            other => panic!("expected a config error, got {:?}", other.map(|c| c.len())),
        }

        // Swapping two names is fine.
        config.variable_rename.insert("sm".into(), "sm_raw".into());
        let chunks = partition_block(&block, &grid, &order, &config).unwrap();
        assert_eq!(chunks[0].data.len(), 2);
    }

    #[test]
    fn test_time_coverage_end() {
        assert_eq!(
            time_coverage_end(&block(3)),
            AttrValue::Text("2020-01-03 00:00:00".into())
        );
        assert_eq!(time_coverage_end(&block(0)), AttrValue::Text("unknown".into()));
    }
}
