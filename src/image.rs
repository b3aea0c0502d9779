/*!
 * Images, one timestamp worth of data on a set of locations, and the trait for reading them.
 */

use crate::{
    error::{ReshuffleError, ReshuffleResult},
    grid::CellGrid,
};
use chrono::{Duration, NaiveDateTime};
use std::collections::BTreeMap;

/// Attribute name of the fill value.
pub const FILL_VALUE: &str = "_FillValue";
/// Attribute name of the smallest valid value.
pub const VALID_MIN: &str = "valid_min";
/// Attribute name of the largest valid value.
pub const VALID_MAX: &str = "valid_max";

/// The value of a metadata attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Number(f64),
    Text(String),
}

impl AttrValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttrValue::Number(v) => Some(*v),
            AttrValue::Text(_) => None,
        }
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Number(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Text(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Text(v)
    }
}

impl std::fmt::Display for AttrValue {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        match self {
            AttrValue::Number(v) => write!(f, "{}", v),
            AttrValue::Text(v) => write!(f, "{}", v),
        }
    }
}

/// Attributes of a variable or a file, sorted by name.
pub type Attributes = BTreeMap<String, AttrValue>;

/// One timestamp worth of data.
///
/// All data arrays have one value per location. If `time_key` is set, that variable holds the
/// observation time of each location and `timestamp` is only the nominal time of the image.
#[derive(Debug, Clone)]
pub struct Image {
    pub lon: Vec<f64>,
    pub lat: Vec<f64>,
    pub data: BTreeMap<String, Vec<f64>>,
    pub metadata: BTreeMap<String, Attributes>,
    pub timestamp: NaiveDateTime,
    pub time_key: Option<String>,
}

impl Image {
    /// Create an image, checking that every array has one value per location.
    pub fn new(
        lon: Vec<f64>,
        lat: Vec<f64>,
        data: BTreeMap<String, Vec<f64>>,
        metadata: BTreeMap<String, Attributes>,
        timestamp: NaiveDateTime,
        time_key: Option<String>,
    ) -> ReshuffleResult<Self> {
        let n = lon.len();
        if lat.len() != n {
            return Err(ReshuffleError::MalformedImage {
                date: timestamp,
                reason: format!("{} longitudes and {} latitudes", n, lat.len()),
            });
        }

        for (name, values) in &data {
            if values.len() != n {
                return Err(ReshuffleError::MalformedImage {
                    date: timestamp,
                    reason: format!("{} has {} values for {} locations", name, values.len(), n),
                });
            }
        }

        if let Some(key) = &time_key {
            if !data.contains_key(key) {
                return Err(ReshuffleError::field_lookup(key, format!("image at {}", timestamp)));
            }
        }

        Ok(Image {
            lon,
            lat,
            data,
            metadata,
            timestamp,
            time_key,
        })
    }

    pub fn n_locations(&self) -> usize {
        self.lon.len()
    }

    /// Does every location carry its own observation time?
    pub fn has_time_key(&self) -> bool {
        self.time_key.is_some()
    }
}

/**
 * Replace values outside the declared valid range with the fill value.
 *
 * Nothing happens unless the attributes declare all of `_FillValue`, `valid_min` and
 * `valid_max`.
 */
pub fn mask_valid_range(values: &mut [f64], attributes: &Attributes) {
    let get = |name: &str| attributes.get(name).and_then(AttrValue::as_number);

    if let (Some(fill), Some(min), Some(max)) = (get(FILL_VALUE), get(VALID_MIN), get(VALID_MAX)) {
        for v in values.iter_mut() {
            if *v < min || *v > max {
                *v = fill;
            }
        }
    }
}

/// A source of images, one per requested timestamp.
pub trait ImageReader: Sync {
    /**
     * Read the image for a timestamp.
     *
     * #Errors
     * `Io` if the source can't be found or opened, `FieldLookup` if a requested variable or an
     * internal field does not exist, `AmbiguousOverpass` if the overpass to read can't be
     * determined.
     */
    fn read(&self, timestamp: NaiveDateTime) -> ReshuffleResult<Image>;

    /// The grid all images are delivered on, if it is fixed.
    fn grid(&self) -> Option<&CellGrid> {
        None
    }

    /// The variable holding the per observation time, if images have one.
    fn time_key(&self) -> Option<&str> {
        None
    }

    /// The timestamps to request for a date range, one per day by default.
    fn timestamps_for_daterange(&self, start: NaiveDateTime, end: NaiveDateTime) -> Vec<NaiveDateTime> {
        daily_timestamps(start, end)
    }
}

/// Every day from `start` to `end`, both included, at the time of day of `start`.
pub fn daily_timestamps(start: NaiveDateTime, end: NaiveDateTime) -> Vec<NaiveDateTime> {
    let days = (end - start).num_days();
    (0..=days).map(|d| start + Duration::days(d)).collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_mask_valid_range() {
        let mut attrs = Attributes::new();
        attrs.insert(FILL_VALUE.into(), (-9999.0).into());
        attrs.insert(VALID_MIN.into(), 0.02.into());
        attrs.insert(VALID_MAX.into(), 0.5.into());

        let mut values = vec![0.01, 0.2, 0.6, 0.5, f64::NAN];
        mask_valid_range(&mut values, &attrs);
        assert_eq!(&values[..4], &[-9999.0, 0.2, -9999.0, 0.5]);
        assert!(values[4].is_nan());

        // Without a fill value nothing changes.
        attrs.remove(FILL_VALUE);
        let mut values = vec![0.01, 0.6];
        mask_valid_range(&mut values, &attrs);
        assert_eq!(values, vec![0.01, 0.6]);
    }

    #[test]
    fn test_image_checks_lengths() {
        let ts = NaiveDate::from_ymd(2020, 1, 1).and_hms(0, 0, 0);

        let mut data = BTreeMap::new();
        data.insert("sm".to_string(), vec![1.0, 2.0]);

        let img = Image::new(vec![0.0, 1.0], vec![0.0, 1.0], data.clone(), BTreeMap::new(), ts, None);
        assert_eq!(img.unwrap().n_locations(), 2);

        let bad = Image::new(vec![0.0], vec![0.0], data.clone(), BTreeMap::new(), ts, None);
        assert!(matches!(bad, Err(ReshuffleError::MalformedImage { date, .. }) if date == ts));

        let missing_key = Image::new(
            vec![0.0, 1.0],
            vec![0.0, 1.0],
            data,
            BTreeMap::new(),
            ts,
            Some("time".into()),
        );
        assert!(matches!(missing_key, Err(ReshuffleError::FieldLookup { .. })));
    }

    #[test]
    fn test_daily_timestamps() {
        let start = NaiveDate::from_ymd(2020, 2, 27).and_hms(0, 0, 0);
        let end = NaiveDate::from_ymd(2020, 3, 1).and_hms(0, 0, 0);

        let days = daily_timestamps(start, end);
        assert_eq!(days.len(), 4);
        assert_eq!(days[2], NaiveDate::from_ymd(2020, 2, 29).and_hms(0, 0, 0));

        assert!(daily_timestamps(end, start).is_empty());
    }
}
