/*!
 * Reading runs of images into time major blocks on the output grid.
 */

use crate::{
    config::{GridMatch, ReshuffleConfig},
    error::{ReshuffleError, ReshuffleResult},
    grid::CellGrid,
    image::{AttrValue, Attributes, Image, ImageReader},
    resample::{resample_image, NeighbourTable},
};
use chrono::{Local, NaiveDateTime};
use crossbeam_channel::bounded;
use log::{debug, info, warn};
use std::{collections::BTreeMap, sync::Arc, thread};

/// How the timestamps of a run are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// One timestamp per image shared by all locations.
    Orthogonal,
    /// Every observation carries its own timestamp in the time key variable.
    Ragged,
}

impl Layout {
    /// The layout an image asks for.
    pub fn of(image: &Image) -> Self {
        if image.has_time_key() {
            Layout::Ragged
        } else {
            Layout::Orthogonal
        }
    }

    /// Name stored in the `timeSeries_format` attribute of cell archives.
    pub fn format_name(&self) -> &'static str {
        match self {
            Layout::Orthogonal => "OrthoMultiTs",
            Layout::Ragged => "IndexedRaggedTs",
        }
    }

    pub fn from_format_name(name: &str) -> Option<Self> {
        match name {
            "OrthoMultiTs" => Some(Layout::Orthogonal),
            "IndexedRaggedTs" => Some(Layout::Ragged),
            _ => None,
        }
    }
}

/// What has to happen to an image to bring it onto the output grid.
#[derive(Debug, Clone)]
pub enum GridAlignment {
    /// The image is already on the output grid.
    PassThrough,
    /// The output grid is a subset of the image grid, take these positions of the image.
    Subset(Vec<usize>),
    /// Resample with a table for the fixed image grid, or build one per image from its
    /// coordinates when the reader has no fixed grid.
    Resample(Option<Arc<NeighbourTable>>),
}

impl GridAlignment {
    /**
     * Compare the grid of the reader with the output grid.
     *
     * #Arguments
     * * input - the grid the reader delivers images on, if it has a fixed one.
     * * target - the output grid, `None` to write on the input grid.
     * * grid_match - how strict the comparison is.
     * * config - the resampling parameters, used to build the neighbour table.
     */
    pub fn decide(
        input: Option<&CellGrid>,
        target: Option<&CellGrid>,
        grid_match: GridMatch,
        config: &ReshuffleConfig,
    ) -> ReshuffleResult<Self> {
        let (input, target) = match (input, target) {
            (None, None) => return Err(ReshuffleError::MissingTargetGrid),
            (Some(_), None) => return Ok(GridAlignment::PassThrough),
            (None, Some(_)) => return Ok(GridAlignment::Resample(None)),
            (Some(input), Some(target)) => (input, target),
        };

        if grid_match == GridMatch::SizeOnly && input.len() == target.len() {
            return Ok(GridAlignment::PassThrough);
        }

        if input.same_points(target) {
            return Ok(GridAlignment::PassThrough);
        }

        if let Some(positions) = target.is_subset_of(input, true) {
            let identity =
                positions.len() == input.len() && positions.iter().enumerate().all(|(i, &p)| i == p);

            if identity {
                return Ok(GridAlignment::PassThrough);
            }
            return Ok(GridAlignment::Subset(positions));
        }

        let resample = &config.resample;
        let table = NeighbourTable::from_grids(
            input,
            target,
            resample.search_radius_m,
            resample.max_neighbours,
        );
        info!(
            target: "bulk",
            "image grid with {} points is resampled onto {} points",
            input.len(),
            target.len()
        );

        Ok(GridAlignment::Resample(Some(Arc::new(table))))
    }

    pub fn is_resample(&self) -> bool {
        matches!(self, GridAlignment::Resample(_))
    }

    /// Bring an image onto the output grid.
    pub fn apply(
        &self,
        image: Image,
        target: &CellGrid,
        config: &ReshuffleConfig,
    ) -> ReshuffleResult<Image> {
        let n = image.n_locations();

        match self {
            GridAlignment::PassThrough => {
                if n != target.len() {
                    return Err(location_count_error(&image, target.len()));
                }
                Ok(image)
            }
            GridAlignment::Subset(positions) => {
                if positions.iter().any(|&p| p >= n) {
                    return Err(location_count_error(&image, target.len()));
                }
                Ok(subset_image(image, positions))
            }
            GridAlignment::Resample(Some(table)) => {
                if table.n_source() != n {
                    return Err(location_count_error(&image, table.n_source()));
                }
                Ok(resample_image(&image, table, target, &config.resample))
            }
            GridAlignment::Resample(None) => {
                let table = NeighbourTable::from_points(
                    &image.lon,
                    &image.lat,
                    target,
                    config.resample.search_radius_m,
                    config.resample.max_neighbours,
                );
                Ok(resample_image(&image, &table, target, &config.resample))
            }
        }
    }
}

fn location_count_error(image: &Image, expected: usize) -> ReshuffleError {
    ReshuffleError::MalformedImage {
        date: image.timestamp,
        reason: format!("{} locations, expected {}", image.n_locations(), expected),
    }
}

/// Take the values at `positions`, no interpolation.
fn subset_image(image: Image, positions: &[usize]) -> Image {
    fn pick(values: &[f64], positions: &[usize]) -> Vec<f64> {
        positions.iter().map(|&p| values[p]).collect()
    }

    let data = image
        .data
        .iter()
        .map(|(name, values)| (name.clone(), pick(values, positions)))
        .collect();

    let mut metadata = image.metadata;
    let stamp = AttrValue::Text(Local::now().naive_local().to_string());
    for name in image.data.keys() {
        metadata
            .entry(name.clone())
            .or_default()
            .insert("subsetting_date".into(), stamp.clone());
    }

    Image {
        lon: pick(&image.lon, positions),
        lat: pick(&image.lat, positions),
        data,
        metadata,
        timestamp: image.timestamp,
        time_key: image.time_key,
    }
}

/// A time major stack of images on the output grid, sorted by timestamp.
#[derive(Debug, Clone)]
pub struct ImageBlock {
    pub timestamps: Vec<NaiveDateTime>,
    /// Per variable `timestamps.len()` rows of `n_locations` values.
    pub data: BTreeMap<String, Vec<f64>>,
    /// Attributes per variable, taken from the first image that has the variable.
    pub metadata: BTreeMap<String, Attributes>,
    pub n_locations: usize,
    pub layout: Layout,
    /// The variable holding observation times in the ragged layout.
    pub time_key: Option<String>,
    /// Were the images resampled onto the output grid?
    pub resampled: bool,
}

impl ImageBlock {
    /**
     * Stack images into a block.
     *
     * The images are sorted by timestamp first. A variable missing from some of the images is
     * NaN at those times.
     */
    pub fn from_images(
        mut images: Vec<Image>,
        n_locations: usize,
        layout: Layout,
        resampled: bool,
    ) -> Self {
        images.sort_by_key(|img| img.timestamp);

        let n_times = images.len();
        let mut data: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut metadata: BTreeMap<String, Attributes> = BTreeMap::new();

        for img in &images {
            for (name, attrs) in &img.metadata {
                metadata.entry(name.clone()).or_insert_with(|| attrs.clone());
            }
            for name in img.data.keys() {
                data.entry(name.clone())
                    .or_insert_with(|| Vec::with_capacity(n_times * n_locations));
            }
        }

        for img in &images {
            for (name, stack) in data.iter_mut() {
                match img.data.get(name) {
                    Some(values) => stack.extend_from_slice(values),
                    None => {
                        debug!(target: "bulk", "{} missing at {}", name, img.timestamp);
                        stack.extend(std::iter::repeat(f64::NAN).take(n_locations));
                    }
                }
            }
        }

        let time_key = match layout {
            Layout::Ragged => images.iter().find_map(|img| img.time_key.clone()),
            Layout::Orthogonal => None,
        };

        ImageBlock {
            timestamps: images.iter().map(|img| img.timestamp).collect(),
            data,
            metadata,
            n_locations,
            layout,
            time_key,
            resampled,
        }
    }

    pub fn n_times(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn last_timestamp(&self) -> Option<NaiveDateTime> {
        self.timestamps.last().copied()
    }

    /// The value of a variable at time step `t` and location `loc`.
    pub fn value(&self, variable: &str, t: usize, loc: usize) -> Option<f64> {
        if t >= self.n_times() || loc >= self.n_locations {
            return None;
        }
        self.data
            .get(variable)
            .map(|values| values[t * self.n_locations + loc])
    }
}

/**
 * Reads the images of a date range a buffer at a time.
 *
 * Dates that fail to read are skipped when errors are ignored, blocks where every date failed
 * are not yielded.
 */
pub struct ImageBulkReader<'a, R: ImageReader> {
    reader: &'a R,
    target: &'a CellGrid,
    config: &'a ReshuffleConfig,
    alignment: GridAlignment,
    timestamps: Vec<NaiveDateTime>,
    next: usize,
    layout: Option<Layout>,
    failed: Vec<(NaiveDateTime, String)>,
    done: bool,
}

impl<'a, R: ImageReader> ImageBulkReader<'a, R> {
    /**
     * Set up reading a date range.
     *
     * #Arguments
     * * reader - delivers the images.
     * * target - the output grid, `None` writes on the grid of the reader.
     * * start, end - the date range, both included.
     * * config - buffer size, parallelism, error policy, and resampling parameters.
     *
     * #Errors
     * `MissingTargetGrid` if neither the reader nor the caller has a grid.
     */
    pub fn new(
        reader: &'a R,
        target: Option<&'a CellGrid>,
        start: NaiveDateTime,
        end: NaiveDateTime,
        config: &'a ReshuffleConfig,
    ) -> ReshuffleResult<Self> {
        let alignment = GridAlignment::decide(reader.grid(), target, config.grid_match, config)?;
        let target = target
            .or_else(|| reader.grid())
            .ok_or(ReshuffleError::MissingTargetGrid)?;

        let timestamps = reader.timestamps_for_daterange(start, end);
        debug!(
            target: "bulk",
            "{} timestamps requested from {} to {}, {:?}",
            timestamps.len(),
            start,
            end,
            alignment_name(&alignment)
        );

        Ok(ImageBulkReader {
            reader,
            target,
            config,
            alignment,
            timestamps,
            next: 0,
            layout: None,
            failed: vec![],
            done: false,
        })
    }

    /// The grid the blocks are on.
    pub fn output_grid(&self) -> &'a CellGrid {
        self.target
    }

    /// The layout of the run, known after the first image was read.
    pub fn layout(&self) -> Option<Layout> {
        self.layout
    }

    pub fn alignment(&self) -> &GridAlignment {
        &self.alignment
    }

    /// Dates skipped since the last call, with the reason.
    pub fn take_failed(&mut self) -> Vec<(NaiveDateTime, String)> {
        std::mem::take(&mut self.failed)
    }

    fn read_one(&self, timestamp: NaiveDateTime) -> ReshuffleResult<Image> {
        debug!(target: "bulk", "reading image for {}", timestamp);
        let image = self.reader.read(timestamp)?;
        self.alignment.apply(image, self.target, self.config)
    }

    fn read_dates(
        &self,
        dates: &[NaiveDateTime],
    ) -> ReshuffleResult<Vec<(NaiveDateTime, ReshuffleResult<Image>)>> {
        let mut results = if self.config.n_proc > 1 && dates.len() > 1 {
            self.read_parallel(dates)?
        } else {
            dates.iter().map(|&ts| (ts, self.read_one(ts))).collect()
        };

        // Workers finish in any order.
        results.sort_by_key(|(ts, _)| *ts);
        Ok(results)
    }

    fn read_parallel(
        &self,
        dates: &[NaiveDateTime],
    ) -> ReshuffleResult<Vec<(NaiveDateTime, ReshuffleResult<Image>)>> {
        let n_workers = self.config.n_proc.min(dates.len());

        let (to_workers, from_main) = bounded(dates.len());
        let (to_main, from_workers) = bounded(dates.len());

        for &ts in dates {
            to_workers
                .send(ts)
                .map_err(|_| ReshuffleError::Worker("date queue closed".into()))?;
        }
        drop(to_workers);

        thread::scope(|scope| -> ReshuffleResult<Vec<_>> {
            let mut handles = Vec::with_capacity(n_workers);
            for i in 0..n_workers {
                let from_main = from_main.clone();
                let to_main = to_main.clone();

                let jh = thread::Builder::new()
                    .name(format!("smapts-read-{}", i))
                    .spawn_scoped(scope, move || {
                        for ts in from_main {
                            let res = self.read_one(ts);
                            if to_main.send((ts, res)).is_err() {
                                break;
                            }
                        }
                    })?;
                handles.push(jh);
            }
            drop(to_main);

            for jh in handles {
                jh.join()
                    .map_err(|_| ReshuffleError::Worker("image reading thread panicked".into()))?;
            }

            Ok(from_workers.iter().collect())
        })
    }

    /// Read buffers until one holds at least one image or the dates run out.
    fn next_block(&mut self) -> ReshuffleResult<Option<ImageBlock>> {
        let block_len = self.config.image_buffer.block_len(self.timestamps.len());

        while self.next < self.timestamps.len() {
            let end = (self.next + block_len).min(self.timestamps.len());
            let dates = self.timestamps[self.next..end].to_vec();
            self.next = end;

            let mut images = Vec::with_capacity(dates.len());
            for (ts, res) in self.read_dates(&dates)? {
                match res {
                    Ok(image) => {
                        let layout = Layout::of(&image);
                        match self.layout {
                            None => {
                                info!(target: "bulk", "run layout is {}", layout.format_name());
                                self.layout = Some(layout);
                            }
                            Some(run_layout) if run_layout != layout => {
                                return Err(ReshuffleError::LayoutInconsistency { date: ts });
                            }
                            Some(_) => {}
                        }
                        images.push(image);
                    }
                    Err(err) if self.config.ignore_errors && err.is_skippable() => {
                        warn!(target: "bulk", "skipping {}: {}", ts, err);
                        self.failed.push((ts, err.to_string()));
                    }
                    Err(err) => return Err(err),
                }
            }

            if images.is_empty() {
                warn!(
                    target: "bulk",
                    "no images could be read from {} to {}",
                    dates[0],
                    dates[dates.len() - 1]
                );
                continue;
            }

            info!(
                target: "bulk",
                "read {} of {} images up to {}",
                images.len(),
                dates.len(),
                dates[dates.len() - 1]
            );

            // The layout is set once any image was read.
            let layout = self.layout.unwrap_or(Layout::Orthogonal);
            return Ok(Some(ImageBlock::from_images(
                images,
                self.target.len(),
                layout,
                self.alignment.is_resample(),
            )));
        }

        Ok(None)
    }
}

impl<'a, R: ImageReader> Iterator for ImageBulkReader<'a, R> {
    type Item = ReshuffleResult<ImageBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.next_block() {
            Ok(Some(block)) => Some(Ok(block)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

fn alignment_name(alignment: &GridAlignment) -> &'static str {
    match alignment {
        GridAlignment::PassThrough => "pass through",
        GridAlignment::Subset(_) => "subset",
        GridAlignment::Resample(_) => "resample",
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ImageBuffer;
    use chrono::{Datelike, Duration, NaiveDate};
    use std::collections::HashMap;

    fn day(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd(2020, 4, d).and_hms(0, 0, 0)
    }

    fn grid() -> CellGrid {
        CellGrid::new(
            vec![10, 11, 12, 13],
            vec![0.0, 10.0, 0.0, 10.0],
            vec![0.0, 0.0, 10.0, 10.0],
            5.0,
        )
        .unwrap()
    }

    /// Images where `sm` at location i on day d is `10 * d + i`.
    struct DailyReader {
        grid: CellGrid,
        time_key_from: Option<u32>,
        fail: Vec<u32>,
        delay: HashMap<u32, u64>,
    }

    impl DailyReader {
        fn new() -> Self {
            DailyReader {
                grid: grid(),
                time_key_from: None,
                fail: vec![],
                delay: HashMap::new(),
            }
        }
    }

    impl ImageReader for DailyReader {
        fn read(&self, timestamp: NaiveDateTime) -> ReshuffleResult<Image> {
            let d = timestamp.day();
            if let Some(ms) = self.delay.get(&d) {
                std::thread::sleep(std::time::Duration::from_millis(*ms));
            }
            if self.fail.contains(&d) {
                return Err(std::io::Error::from(std::io::ErrorKind::NotFound).into());
            }

            let n = self.grid.len();
            let mut data = BTreeMap::new();
            data.insert(
                "sm".to_string(),
                (0..n).map(|i| (10 * d) as f64 + i as f64).collect(),
            );

            let time_key = match self.time_key_from {
                Some(from) if d >= from => {
                    data.insert("time".to_string(), vec![d as f64; n]);
                    Some("time".to_string())
                }
                _ => None,
            };

            Image::new(
                self.grid.lons().to_vec(),
                self.grid.lats().to_vec(),
                data,
                BTreeMap::new(),
                timestamp,
                time_key,
            )
        }

        fn grid(&self) -> Option<&CellGrid> {
            Some(&self.grid)
        }
    }

    #[test]
    fn test_alignment_decisions() {
        let config = ReshuffleConfig::default();
        let input = grid();

        let same = GridAlignment::decide(Some(&input), Some(&input.clone()), GridMatch::ExactIndex, &config);
        assert!(matches!(same, Ok(GridAlignment::PassThrough)));

        let only_input = GridAlignment::decide(Some(&input), None, GridMatch::ExactIndex, &config);
        assert!(matches!(only_input, Ok(GridAlignment::PassThrough)));

        let sub = input.subgrid_from_gpis(&[13, 11]).unwrap();
        match GridAlignment::decide(Some(&input), Some(&sub), GridMatch::ExactIndex, &config) {
            Ok(GridAlignment::Subset(positions)) => assert_eq!(positions, vec![1, 3]),
            other => panic!("expected a subset, got {:?}", other),
        }

        // Same size, other points.
        let moved = CellGrid::new(
            vec![0, 1, 2, 3],
            vec![0.1, 10.1, 0.1, 10.1],
            vec![0.0, 0.0, 10.0, 10.0],
            5.0,
        )
        .unwrap();
        let exact = GridAlignment::decide(Some(&input), Some(&moved), GridMatch::ExactIndex, &config);
        assert!(matches!(exact, Ok(GridAlignment::Resample(Some(_)))));
        let size_only = GridAlignment::decide(Some(&input), Some(&moved), GridMatch::SizeOnly, &config);
        assert!(matches!(size_only, Ok(GridAlignment::PassThrough)));

        let no_input = GridAlignment::decide(None, Some(&input), GridMatch::ExactIndex, &config);
        assert!(matches!(no_input, Ok(GridAlignment::Resample(None))));

        let nothing = GridAlignment::decide(None, None, GridMatch::ExactIndex, &config);
        assert!(matches!(nothing, Err(ReshuffleError::MissingTargetGrid)));
    }

    #[test]
    fn test_subset_is_exact() {
        let config = ReshuffleConfig::default();
        let reader = DailyReader::new();
        let sub = reader.grid.subgrid_from_gpis(&[11, 13]).unwrap();

        let alignment = GridAlignment::decide(reader.grid(), Some(&sub), config.grid_match, &config).unwrap();
        let img = alignment.apply(reader.read(day(2)).unwrap(), &sub, &config).unwrap();

        assert_eq!(img.data["sm"], vec![21.0, 23.0]);
        assert_eq!(img.lon, vec![10.0, 10.0]);
        assert!(img.metadata["sm"].contains_key("subsetting_date"));
    }

    #[test]
    fn test_blocks_follow_buffer_size() {
        let mut config = ReshuffleConfig::default();
        config.image_buffer = ImageBuffer::Days(2);
        let reader = DailyReader::new();

        let blocks: Vec<ImageBlock> = ImageBulkReader::new(&reader, None, day(1), day(5), &config)
            .unwrap()
            .collect::<ReshuffleResult<_>>()
            .unwrap();

        let sizes: Vec<usize> = blocks.iter().map(|b| b.n_times()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(blocks[0].layout, Layout::Orthogonal);
        assert!(!blocks[0].resampled);

        // Time major, row 1 is day 2.
        assert_eq!(blocks[0].value("sm", 1, 3), Some(23.0));
        assert_eq!(blocks[2].last_timestamp(), Some(day(5)));
    }

    #[test]
    fn test_whole_range_in_one_block() {
        let mut config = ReshuffleConfig::default();
        config.image_buffer = ImageBuffer::All;
        let reader = DailyReader::new();

        let blocks: Vec<ImageBlock> = ImageBulkReader::new(&reader, None, day(1), day(4), &config)
            .unwrap()
            .collect::<ReshuffleResult<_>>()
            .unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].n_times(), 4);
    }

    #[test]
    fn test_failed_dates() {
        let mut config = ReshuffleConfig::default();
        config.image_buffer = ImageBuffer::Days(2);
        let mut reader = DailyReader::new();
        reader.fail = vec![3, 4];

        // Strict mode stops at the first failure.
        let res: ReshuffleResult<Vec<ImageBlock>> =
            ImageBulkReader::new(&reader, None, day(1), day(5), &config)
                .unwrap()
                .collect();
        assert!(matches!(res, Err(ReshuffleError::Io(_))));

        config.ignore_errors = true;
        let mut bulk = ImageBulkReader::new(&reader, None, day(1), day(5), &config).unwrap();
        let blocks: Vec<ImageBlock> = bulk.by_ref().collect::<ReshuffleResult<_>>().unwrap();

        // The block of days 3 and 4 is empty and not yielded.
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].timestamps, vec![day(5)]);

        let failed: Vec<NaiveDateTime> = bulk.take_failed().into_iter().map(|(ts, _)| ts).collect();
        assert_eq!(failed, vec![day(3), day(4)]);
    }

    #[test]
    fn test_layout_switch_is_an_error() {
        let mut config = ReshuffleConfig::default();
        config.image_buffer = ImageBuffer::Days(1);
        config.ignore_errors = true;
        let mut reader = DailyReader::new();
        reader.time_key_from = Some(3);

        let mut bulk = ImageBulkReader::new(&reader, None, day(1), day(4), &config).unwrap();
        assert!(bulk.next().unwrap().is_ok());
        assert!(bulk.next().unwrap().is_ok());
        assert_eq!(bulk.layout(), Some(Layout::Orthogonal));

        match bulk.next() {
            Some(Err(ReshuffleError::LayoutInconsistency { date })) => assert_eq!(date, day(3)),
            other => panic!("expected a layout error, got {:?}", other.map(|r| r.is_ok())),
        }
        assert!(bulk.next().is_none());
    }

    #[test]
    fn test_parallel_reads_are_sorted() {
        let mut config = ReshuffleConfig::default();
        config.image_buffer = ImageBuffer::Days(6);
        config.n_proc = 3;
        let mut reader = DailyReader::new();
        // Early days finish last.
        reader.delay.insert(1, 60);
        reader.delay.insert(2, 40);
        reader.delay.insert(3, 20);

        let blocks: Vec<ImageBlock> = ImageBulkReader::new(&reader, None, day(1), day(6), &config)
            .unwrap()
            .collect::<ReshuffleResult<_>>()
            .unwrap();

        let expected: Vec<NaiveDateTime> = (0..6).map(|d| day(1) + Duration::days(d)).collect();
        assert_eq!(blocks[0].timestamps, expected);
        for t in 0..6 {
            assert_eq!(blocks[0].value("sm", t, 0), Some(10.0 * (t + 1) as f64));
        }
    }
}
