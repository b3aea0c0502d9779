use chrono::{NaiveDate, NaiveDateTime};
use smapts::{
    AttrValue, Attributes, CellArchive, CellGrid, Field, FieldFile, FieldSource, ImageReader,
    Layout, Overpass, RasterLayout, ReshuffleConfig, ReshuffleError, ReshuffleResult, Reshuffler,
    SmapConfig, SmapL3Dataset,
};
use std::{collections::HashMap, path::Path};

/// Group -> dataset -> field.
type Groups = HashMap<String, HashMap<String, Field>>;

/// Files held in memory, keyed by file name. The files on disk are empty markers for the search.
#[derive(Default)]
struct MemSource {
    files: HashMap<String, Groups>,
}

struct MemFile(Groups);

impl FieldSource for MemSource {
    type File = MemFile;

    fn open(&self, path: &Path) -> ReshuffleResult<MemFile> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        self.files
            .get(&name)
            .cloned()
            .map(MemFile)
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound).into())
    }
}

impl FieldFile for MemFile {
    fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.0.keys().cloned().collect();
        groups.sort();
        groups
    }

    fn field(&self, group: &str, name: &str) -> ReshuffleResult<Field> {
        self.0
            .get(group)
            .and_then(|g| g.get(name))
            .cloned()
            .ok_or_else(|| ReshuffleError::FieldLookup {
                field: name.to_string(),
                context: group.to_string(),
            })
    }
}

// 4 x 3 stored raster, one margin row along each edge.
const LAYOUT: RasterLayout = RasterLayout {
    rows: 4,
    cols: 3,
    margin_rows: 1,
};

fn grid() -> CellGrid {
    CellGrid::new(
        (0..6).collect(),
        vec![0.0, 1.0, 2.0, 0.0, 1.0, 2.0],
        vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0],
        5.0,
    )
    .unwrap()
    .with_shape(2, 3)
    .unwrap()
}

fn field(offset: f64, with_range: bool) -> Field {
    let mut attributes = Attributes::new();
    if with_range {
        attributes.insert("_FillValue".into(), AttrValue::from(-9999.0));
        attributes.insert("valid_min".into(), AttrValue::from(0.0));
        attributes.insert("valid_max".into(), AttrValue::from(50.0));
    }

    Field {
        values: (0..12).map(|v| v as f64 + offset).collect(),
        shape: (LAYOUT.rows, LAYOUT.cols),
        attributes,
    }
}

fn file_name(day: u32) -> String {
    format!("SMAP_L3_SM_P_202004{:02}_R18290_001.h5", day)
}

/// Morning overpass with soil moisture `offset + raster index` and times `1000 * day + index`.
fn source(days: &[u32]) -> MemSource {
    let mut source = MemSource::default();

    for &day in days {
        let mut am = HashMap::new();
        am.insert("soil_moisture".to_string(), field(10.0 * day as f64, true));
        am.insert("tb_time_seconds".to_string(), field(1000.0 * day as f64, false));

        let mut groups = Groups::new();
        groups.insert("Soil_Moisture_Retrieval_Data_AM".to_string(), am);
        source.files.insert(file_name(day), groups);
    }

    source
}

fn touch(root: &Path, day: u32) {
    let dir = root.join(format!("2020.04.{:02}", day));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(file_name(day)), b"").unwrap();
}

fn day(d: u32) -> NaiveDateTime {
    NaiveDate::from_ymd(2020, 4, d).and_hms(0, 0, 0)
}

fn smap_config(time_key: Option<&str>) -> SmapConfig {
    SmapConfig {
        parameters: vec!["soil_moisture".into()],
        overpass: Some(Overpass::Am),
        var_overpass_str: false,
        crid: None,
        time_key: time_key.map(String::from),
        subpath_template: vec!["%Y.%m.%d".into()],
        layout: LAYOUT,
    }
}

#[test]
fn test_files_to_ragged_archive() {
    let data = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    touch(data.path(), 1);
    touch(data.path(), 2);

    let reader = SmapL3Dataset::new(
        data.path(),
        source(&[1, 2]),
        smap_config(Some("tb_time_seconds")),
        Some(grid()),
    )
    .unwrap();
    assert_eq!(reader.time_key(), Some("tb_time_seconds"));

    let config = ReshuffleConfig::default();
    let mut run = Reshuffler::new(reader, None, out.path(), day(1), day(2), config.clone()).unwrap();
    let summary = run.calc().unwrap();
    assert_eq!(summary.layout, Some(Layout::Ragged));
    assert_eq!(summary.images, 2);

    let cells = grid().unique_cells();
    assert_eq!(cells.len(), 1);
    let archive = CellArchive::open(out.path().join(config.cell_filename(cells[0]).unwrap())).unwrap();
    assert_eq!(archive.n_locations().unwrap(), 6);

    // gpi 0 is the first value of the southernmost kept row, raster index 6.
    let ts = archive.read_ts(0).unwrap();
    assert_eq!(ts.times, vec![1006.0, 2006.0]);
    assert_eq!(ts.data["soil_moisture"], vec![16.0, 26.0]);
    assert!(!ts.data.contains_key("tb_time_seconds"));

    let ts = archive.read_ts(5).unwrap();
    assert_eq!(ts.times, vec![1005.0, 2005.0]);
    assert_eq!(ts.data["soil_moisture"], vec![15.0, 25.0]);

    let attrs = archive.variable_attributes("soil_moisture").unwrap();
    assert_eq!(attrs["valid_max"], AttrValue::from(50.0));
}

#[test]
fn test_missing_file_is_skipped() {
    let data = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    touch(data.path(), 1);
    touch(data.path(), 3);

    let reader = SmapL3Dataset::new(data.path(), source(&[1, 3]), smap_config(None), Some(grid()))
        .unwrap();

    let config = ReshuffleConfig {
        ignore_errors: true,
        ..ReshuffleConfig::default()
    };
    let mut run = Reshuffler::new(reader, None, out.path(), day(1), day(3), config.clone()).unwrap();
    let summary = run.calc().unwrap();

    assert_eq!(summary.layout, Some(Layout::Orthogonal));
    assert_eq!(summary.images, 2);
    assert_eq!(summary.failed_dates.len(), 1);
    assert_eq!(summary.failed_dates[0].0, day(2));

    let cell = grid().unique_cells()[0];
    let archive = CellArchive::open(out.path().join(config.cell_filename(cell).unwrap())).unwrap();
    let units = archive.time_units().unwrap().unwrap();
    let ts = archive.read_ts(3).unwrap();
    assert_eq!(ts.timestamps(&units), vec![day(1), day(3)]);
    // gpi 3 is the first value of the northern kept row, raster index 3.
    assert_eq!(ts.data["soil_moisture"], vec![13.0, 33.0]);
}
