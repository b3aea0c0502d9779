use super::*;

const RTREE_CHILDREN_PER_NODE: usize = 8;
const HILBERT_ITERATIONS: u32 = 16;

/// Start radius for an unbounded nearest neighbour search.
const NEAREST_START_RADIUS_M: f64 = 25_000.0;

#[derive(Debug, Clone)]
enum RTreeNode {
    Node {
        bbox: BoundingBox,
        children: Vec<RTreeNode>,
    },
    Leaf {
        coord: Coord,
        hilbert_num: u64,
        index: usize,
    },
}

impl RTreeNode {
    fn bounding_box(&self) -> BoundingBox {
        match self {
            Self::Node { bbox, .. } => *bbox,
            Self::Leaf { coord, .. } => BoundingBox {
                ll: *coord,
                ur: *coord,
            },
        }
    }

    fn hilbert_num(&self) -> u64 {
        match self {
            Self::Leaf { hilbert_num, .. } => *hilbert_num,
            Self::Node { children, .. } => children
                .iter()
                .map(|node| node.hilbert_num())
                .max()
                .unwrap_or(0),
        }
    }

    fn new_node(children: Vec<Self>) -> Self {
        let mut bbox = BoundingBox::empty();
        for child in &children {
            bbox.union(&child.bounding_box());
        }

        Self::Node { bbox, children }
    }

    /// Call `hit` with the index and coordinate of every point inside `region`.
    fn foreach<F>(&self, region: &BoundingBox, hit: &mut F)
    where
        F: FnMut(usize, Coord),
    {
        match self {
            Self::Leaf { coord, index, .. } => {
                if region.contains(*coord) {
                    hit(*index, *coord);
                }
            }
            Self::Node { bbox, children } => {
                if !bbox.overlap(region) {
                    return;
                }

                for child in children {
                    child.foreach(region, hit);
                }
            }
        }
    }
}

/// A static R-tree over points, packed in Hilbert curve order.
///
/// Indexes returned by queries refer to positions in the slice the index was built from.
#[derive(Debug, Clone)]
pub struct PointIndex {
    root: Option<RTreeNode>,
    len: usize,
}

impl PointIndex {
    /// Build an index for the provided coordinates.
    pub fn build(coords: &[Coord]) -> Self {
        if coords.is_empty() {
            return PointIndex { root: None, len: 0 };
        }

        let mut domain = BoundingBox::from_coords(coords.iter().copied());
        // A degenerate domain (one row or column of points) still needs some extent.
        if domain.ur.lon <= domain.ll.lon {
            domain.ur.lon = domain.ll.lon + 1.0;
        }
        if domain.ur.lat <= domain.ll.lat {
            domain.ur.lat = domain.ll.lat + 1.0;
        }

        let hc = HilbertCurve::new(HILBERT_ITERATIONS, domain);

        // Build the leaf nodes - level 0
        let mut leaves: Vec<RTreeNode> = coords
            .iter()
            .enumerate()
            .map(|(index, &coord)| RTreeNode::Leaf {
                coord,
                hilbert_num: hc.translate_to_curve_distance(coord),
                index,
            })
            .collect();

        // Sorting by Hilbert number is how we get locality for the parent nodes.
        leaves.sort_by_key(RTreeNode::hilbert_num);

        let mut level_nodes = leaves;
        while level_nodes.len() > 1 {
            let child_nodes = level_nodes;
            level_nodes = Vec::with_capacity(child_nodes.len() / RTREE_CHILDREN_PER_NODE + 1);

            let mut children = Vec::with_capacity(RTREE_CHILDREN_PER_NODE);
            for child_node in child_nodes.into_iter() {
                children.push(child_node);

                if children.len() == RTREE_CHILDREN_PER_NODE {
                    level_nodes.push(RTreeNode::new_node(children));
                    children = Vec::with_capacity(RTREE_CHILDREN_PER_NODE);
                }
            }

            if !children.is_empty() {
                level_nodes.push(RTreeNode::new_node(children));
            }
        }

        debug_assert_eq!(level_nodes.len(), 1);
        let root = level_nodes.pop();

        PointIndex {
            root,
            len: coords.len(),
        }
    }

    /// Number of points in the index.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// All points within `radius_m` meters of `center`, as `(index, distance)` sorted nearest
    /// first. Ties are broken by index so results are deterministic.
    pub fn within(&self, center: Coord, radius_m: f64) -> Vec<(usize, f64)> {
        let mut hits = Vec::new();

        if let Some(root) = &self.root {
            let mut regions = vec![BoundingBox::around(center, radius_m)];

            // Search boxes that cross the anti-meridian are split in two.
            let bbox = regions[0];
            if bbox.ll.lon < -180.0 {
                regions.push(BoundingBox {
                    ll: Coord {
                        lat: bbox.ll.lat,
                        lon: bbox.ll.lon + 360.0,
                    },
                    ur: Coord {
                        lat: bbox.ur.lat,
                        lon: 180.0,
                    },
                });
            }
            if bbox.ur.lon > 180.0 {
                regions.push(BoundingBox {
                    ll: Coord {
                        lat: bbox.ll.lat,
                        lon: -180.0,
                    },
                    ur: Coord {
                        lat: bbox.ur.lat,
                        lon: bbox.ur.lon - 360.0,
                    },
                });
            }

            for region in &regions {
                root.foreach(region, &mut |index, coord| {
                    let dist = great_circle_distance(center, coord);
                    if dist <= radius_m {
                        hits.push((index, dist));
                    }
                });
            }
        }

        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        hits.dedup_by_key(|hit| hit.0);
        hits
    }

    /// The nearest point to `center`, searching outward until something is found.
    pub fn nearest(&self, center: Coord) -> Option<(usize, f64)> {
        if self.is_empty() {
            return None;
        }

        let mut radius = NEAREST_START_RADIUS_M;
        loop {
            if let Some(&hit) = self.within(center, radius).first() {
                return Some(hit);
            }

            // Half the circumference covers the whole sphere.
            if radius > std::f64::consts::PI * EARTH_RADIUS_M {
                return None;
            }
            radius *= 4.0;
        }
    }
}

#[derive(Debug)]
struct HilbertCurve {
    // The number of iterations to use for this curve, 1 to 31.
    iterations: u32,

    // This is the domain that the curve will cover.
    domain: BoundingBox,

    // These are needed for fast transformations from the "domain" space into the "Hilbert" space.
    max_dim: u32,
    width: f64,
    height: f64,
}

impl HilbertCurve {
    fn new(iterations: u32, domain: BoundingBox) -> Self {
        debug_assert!((1..=31).contains(&iterations));

        let max_dim = (1u32 << iterations) - 1u32;
        let width = domain.ur.lon - domain.ll.lon;
        let height = domain.ur.lat - domain.ll.lat;

        debug_assert!(width > 0.0 && height > 0.0);

        Self {
            iterations,
            domain,
            max_dim,
            width,
            height,
        }
    }

    fn coords_to_integer(&self, HilbertCoord { x, y }: HilbertCoord) -> u64 {
        debug_assert!(x <= self.max_dim);
        debug_assert!(y <= self.max_dim);

        let n = 1u64 << self.iterations;
        let (mut x, mut y) = (u64::from(x), u64::from(y));

        let mut d = 0u64;
        let mut s = n / 2;
        while s > 0 {
            let rx = u64::from((x & s) > 0);
            let ry = u64::from((y & s) > 0);
            d += s * s * ((3 * rx) ^ ry);

            // Rotate the quadrant so the sub-curve has the right orientation.
            if ry == 0 {
                if rx == 1 {
                    x = n - 1 - x;
                    y = n - 1 - y;
                }
                std::mem::swap(&mut x, &mut y);
            }

            s /= 2;
        }

        d
    }

    fn translate_to_hilbert_coords(&self, coord: Coord) -> HilbertCoord {
        let hilbert_edge_len = (self.max_dim + 1) as f64;

        let x = ((coord.lon - self.domain.ll.lon) / self.width * hilbert_edge_len).max(0.0) as u32;
        let y = ((coord.lat - self.domain.ll.lat) / self.height * hilbert_edge_len).max(0.0) as u32;

        HilbertCoord {
            x: x.min(self.max_dim),
            y: y.min(self.max_dim),
        }
    }

    fn translate_to_curve_distance(&self, coord: Coord) -> u64 {
        let hilbert_coords = self.translate_to_hilbert_coords(coord);
        self.coords_to_integer(hilbert_coords)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HilbertCoord {
    x: u32,
    y: u32,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_integer_coordinate_conversions() {
        let domain = BoundingBox {
            ll: Coord { lat: 0.0, lon: 0.0 },
            ur: Coord { lat: 1.0, lon: 1.0 },
        };

        let test_coords_i1 = [
            HilbertCoord { x: 0, y: 0 },
            HilbertCoord { x: 0, y: 1 },
            HilbertCoord { x: 1, y: 1 },
            HilbertCoord { x: 1, y: 0 },
        ];

        let test_coords_i2 = [
            HilbertCoord { x: 0, y: 0 },
            HilbertCoord { x: 1, y: 0 },
            HilbertCoord { x: 1, y: 1 },
            HilbertCoord { x: 0, y: 1 },
            HilbertCoord { x: 0, y: 2 },
            HilbertCoord { x: 0, y: 3 },
            HilbertCoord { x: 1, y: 3 },
            HilbertCoord { x: 1, y: 2 },
            HilbertCoord { x: 2, y: 2 },
            HilbertCoord { x: 2, y: 3 },
            HilbertCoord { x: 3, y: 3 },
            HilbertCoord { x: 3, y: 2 },
            HilbertCoord { x: 3, y: 1 },
            HilbertCoord { x: 2, y: 1 },
            HilbertCoord { x: 2, y: 0 },
            HilbertCoord { x: 3, y: 0 },
        ];

        let hc = HilbertCurve::new(1, domain);
        for (h, &coords) in test_coords_i1.iter().enumerate() {
            assert_eq!(hc.coords_to_integer(coords), h as u64);
        }

        let hc = HilbertCurve::new(2, domain);
        for (h, &coords) in test_coords_i2.iter().enumerate() {
            assert_eq!(hc.coords_to_integer(coords), h as u64);
        }
    }

    #[test]
    #[rustfmt::skip]
    fn test_domain_mapping() {
        let domain = BoundingBox{ll: Coord{lon: 0.0, lat: 0.0}, ur: Coord{lon: 10.0, lat: 10.0}};

        let n1_pairs = [
            (Coord{lon:  2.5, lat: 2.5},  0u64),
            (Coord{lon:  2.5, lat: 7.5},  1),
            (Coord{lon:  7.5, lat: 7.5},  2),
            (Coord{lon:  7.5, lat: 2.5},  3),

            // Corners.
            (Coord{lon:  0.0, lat:  0.0},  0),
            (Coord{lon:  0.0, lat: 10.0},  1),
            (Coord{lon: 10.0, lat: 10.0},  2),
            (Coord{lon: 10.0, lat:  0.0},  3),
        ];

        let hc = HilbertCurve::new(1, domain);
        for (coord, hilbert_dist) in n1_pairs {
            assert_eq!(hc.translate_to_curve_distance(coord), hilbert_dist);
        }
    }

    fn regular_points() -> Vec<Coord> {
        let mut coords = Vec::new();
        for i in 0..20 {
            for j in 0..20 {
                coords.push(Coord {
                    lat: -10.0 + i as f64,
                    lon: 100.0 + j as f64,
                });
            }
        }
        coords
    }

    #[test]
    fn test_within_matches_brute_force() {
        let coords = regular_points();
        let index = PointIndex::build(&coords);
        assert_eq!(index.len(), 400);

        let center = Coord {
            lat: 0.3,
            lon: 109.6,
        };
        let radius = 250_000.0;

        let found: Vec<usize> = index.within(center, radius).iter().map(|h| h.0).collect();

        let mut expected: Vec<(usize, f64)> = coords
            .iter()
            .enumerate()
            .map(|(i, &c)| (i, great_circle_distance(center, c)))
            .filter(|(_, d)| *d <= radius)
            .collect();
        expected.sort_by(|a, b| a.1.total_cmp(&b.1));
        let expected: Vec<usize> = expected.iter().map(|h| h.0).collect();

        assert!(!found.is_empty());
        assert_eq!(found, expected);
    }

    #[test]
    fn test_nearest() {
        let coords = regular_points();
        let index = PointIndex::build(&coords);

        // Exactly on a point.
        let (idx, dist) = index.nearest(coords[57]).unwrap();
        assert_eq!(idx, 57);
        assert_eq!(dist, 0.0);

        // Far away from every point still finds something.
        let (idx, _) = index.nearest(Coord { lat: 60.0, lon: -60.0 }).unwrap();
        assert!(idx < coords.len());

        assert!(PointIndex::build(&[]).nearest(coords[0]).is_none());
    }

    #[test]
    fn test_within_across_antimeridian() {
        let coords = [
            Coord { lat: 0.0, lon: 179.9 },
            Coord { lat: 0.0, lon: -179.9 },
            Coord { lat: 0.0, lon: 0.0 },
        ];
        let index = PointIndex::build(&coords);

        let hits = index.within(Coord { lat: 0.0, lon: 179.95 }, 30_000.0);
        let found: Vec<usize> = hits.iter().map(|h| h.0).collect();
        assert_eq!(found.len(), 2);
        assert!(found.contains(&0));
        assert!(found.contains(&1));
    }
}
