/*!
 * Geographic types and calculations.
 *
 * The grids used here are small enough, and the distances short enough, that a spherical Earth
 * is plenty accurate for neighbour searches.
 */

pub use point_index::PointIndex;

mod point_index;

/// Mean radius of the Earth in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_009.0;

const DEG2RAD: f64 = std::f64::consts::PI / 180.0;

/// A geographic coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coord {
    pub lat: f64,
    pub lon: f64,
}

/// A latitude-longitude aligned rectangle described by its lower left and upper right corners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub ll: Coord,
    pub ur: Coord,
}

impl BoundingBox {
    /// A box that contains nothing, useful as the starting point when growing a box.
    pub fn empty() -> Self {
        BoundingBox {
            ll: Coord {
                lat: f64::INFINITY,
                lon: f64::INFINITY,
            },
            ur: Coord {
                lat: -f64::INFINITY,
                lon: -f64::INFINITY,
            },
        }
    }

    /// Grow the box so it includes `coord`.
    pub fn expand_to(&mut self, coord: Coord) {
        self.ll.lat = self.ll.lat.min(coord.lat);
        self.ll.lon = self.ll.lon.min(coord.lon);
        self.ur.lat = self.ur.lat.max(coord.lat);
        self.ur.lon = self.ur.lon.max(coord.lon);
    }

    /// Grow the box so it includes `other`.
    pub fn union(&mut self, other: &BoundingBox) {
        self.expand_to(other.ll);
        self.expand_to(other.ur);
    }

    /// Smallest box containing all the given coordinates.
    pub fn from_coords<I: IntoIterator<Item = Coord>>(coords: I) -> Self {
        let mut bbox = Self::empty();
        for coord in coords {
            bbox.expand_to(coord);
        }
        bbox
    }

    /// Is the coordinate inside or on the boundary of the box?
    pub fn contains(&self, coord: Coord) -> bool {
        coord.lat >= self.ll.lat
            && coord.lat <= self.ur.lat
            && coord.lon >= self.ll.lon
            && coord.lon <= self.ur.lon
    }

    /// Do the boxes share any area, boundaries included.
    pub fn overlap(&self, other: &BoundingBox) -> bool {
        self.ll.lat <= other.ur.lat
            && self.ur.lat >= other.ll.lat
            && self.ll.lon <= other.ur.lon
            && self.ur.lon >= other.ll.lon
    }

    /// A box around `center` that contains every point within `radius_m` meters of it.
    ///
    /// Near the poles the longitude extent covers the whole globe.
    pub fn around(center: Coord, radius_m: f64) -> Self {
        let dlat = radius_m / EARTH_RADIUS_M / DEG2RAD;

        let cos_lat = f64::cos((center.lat.abs() + dlat).min(90.0) * DEG2RAD);
        let dlon = if cos_lat > 1.0e-6 {
            (dlat / cos_lat).min(180.0)
        } else {
            180.0
        };

        BoundingBox {
            ll: Coord {
                lat: center.lat - dlat,
                lon: center.lon - dlon,
            },
            ur: Coord {
                lat: center.lat + dlat,
                lon: center.lon + dlon,
            },
        }
    }
}

/**
 * The simple great circle distance calculation.
 *
 * #Arguments
 * * left - the first point.
 * * right - the second point.
 *
 * #Returns
 * The distance between the points in meters.
 */
pub fn great_circle_distance(left: Coord, right: Coord) -> f64 {
    let lat1_r = left.lat * DEG2RAD;
    let lon1_r = left.lon * DEG2RAD;
    let lat2_r = right.lat * DEG2RAD;
    let lon2_r = right.lon * DEG2RAD;

    let dlat2 = (lat2_r - lat1_r) / 2.0;
    let dlon2 = (lon2_r - lon1_r) / 2.0;

    let sin2_dlat = f64::powi(f64::sin(dlat2), 2);
    let sin2_dlon = f64::powi(f64::sin(dlon2), 2);

    let arc = 2.0
        * f64::asin(
            f64::sqrt(sin2_dlat + sin2_dlon * f64::cos(lat1_r) * f64::cos(lat2_r)).min(1.0),
        );

    arc * EARTH_RADIUS_M
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_great_circle_distance() {
        let a = Coord { lat: 0.0, lon: 0.0 };
        assert_eq!(great_circle_distance(a, a), 0.0);

        // One degree along the equator.
        let b = Coord { lat: 0.0, lon: 1.0 };
        let d = great_circle_distance(a, b);
        assert!((d - 111_195.0).abs() < 10.0, "{}", d);

        // Symmetric
        assert_eq!(d, great_circle_distance(b, a));
    }

    #[test]
    fn test_bounding_box_around_contains_radius() {
        let center = Coord {
            lat: 45.0,
            lon: -120.0,
        };
        let bbox = BoundingBox::around(center, 50_000.0);

        // Points 49km north and east must be inside the search box.
        let north = Coord {
            lat: 45.0 + 49_000.0 / EARTH_RADIUS_M / DEG2RAD,
            lon: -120.0,
        };
        let east = Coord {
            lat: 45.0,
            lon: -120.0 + 0.6,
        };
        assert!(bbox.contains(north));
        assert!(great_circle_distance(center, east) < 50_000.0);
        assert!(bbox.contains(east));

        let polar = BoundingBox::around(Coord { lat: 89.9, lon: 0.0 }, 50_000.0);
        assert_eq!(polar.ur.lon - polar.ll.lon, 360.0);
    }

    #[test]
    fn test_bounding_box_overlap() {
        let mut a = BoundingBox::empty();
        a.expand_to(Coord { lat: 0.0, lon: 0.0 });
        a.expand_to(Coord { lat: 1.0, lon: 1.0 });

        let b = BoundingBox::from_coords([Coord { lat: 1.0, lon: 1.0 }, Coord { lat: 2.0, lon: 2.0 }]);
        let c = BoundingBox::from_coords([Coord { lat: 1.5, lon: 1.5 }, Coord { lat: 2.0, lon: 2.0 }]);

        assert!(a.overlap(&b));
        assert!(!a.overlap(&c));
    }
}
