//! Planar coordinates and half-open rectangles.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// A coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Point { x, y }
    }
}

impl Display for Point {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Which of the four children of a quadtree node a point falls into.
///
/// The discriminant is the child's position inside an internal node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quadrant {
    NorthWest = 0,
    NorthEast = 1,
    SouthWest = 2,
    SouthEast = 3,
}

impl Quadrant {
    pub const ALL: [Quadrant; 4] = [
        Quadrant::NorthWest,
        Quadrant::NorthEast,
        Quadrant::SouthWest,
        Quadrant::SouthEast,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// An axis-aligned rectangle covering `[min_x, max_x) × [min_y, max_y)`.
///
/// Both axes are half-open, so two boxes that share an edge never both
/// contain a point on it. The same convention is used for the indexed root
/// region, for quadrant regions and for region queries.
///
/// # Examples
///
/// ```rust
/// use tristore::{BoundingBox, Point};
///
/// let area = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
/// assert!(area.contains(&Point::new(0.0, 9.99)));
/// assert!(!area.contains(&Point::new(10.0, 5.0)));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        BoundingBox {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// A box has positive area when both ranges are non-empty and finite.
    pub fn is_valid(&self) -> bool {
        self.min_x.is_finite()
            && self.min_y.is_finite()
            && self.max_x.is_finite()
            && self.max_y.is_finite()
            && self.min_x < self.max_x
            && self.min_y < self.max_y
    }

    pub fn contains(&self, point: &Point) -> bool {
        self.min_x <= point.x
            && point.x < self.max_x
            && self.min_y <= point.y
            && point.y < self.max_y
    }

    /// Whether the two half-open boxes share at least one point.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x < other.max_x
            && other.min_x < self.max_x
            && self.min_y < other.max_y
            && other.min_y < self.max_y
    }

    /// Whether `other` lies entirely inside this box.
    pub fn covers(&self, other: &BoundingBox) -> bool {
        self.min_x <= other.min_x
            && self.min_y <= other.min_y
            && other.max_x <= self.max_x
            && other.max_y <= self.max_y
    }

    pub fn center(&self) -> Point {
        Point::new(
            self.min_x + (self.max_x - self.min_x) / 2.0,
            self.min_y + (self.max_y - self.min_y) / 2.0,
        )
    }

    /// The quadrant of this box that owns `point`, splitting at the center.
    pub fn quadrant_of(&self, point: &Point) -> Quadrant {
        let center = self.center();
        let east = point.x >= center.x;
        let north = point.y >= center.y;
        match (north, east) {
            (true, false) => Quadrant::NorthWest,
            (true, true) => Quadrant::NorthEast,
            (false, false) => Quadrant::SouthWest,
            (false, true) => Quadrant::SouthEast,
        }
    }

    /// The sub-box owned by `quadrant`.
    pub fn quadrant(&self, quadrant: Quadrant) -> BoundingBox {
        let c = self.center();
        match quadrant {
            Quadrant::NorthWest => BoundingBox::new(self.min_x, c.y, c.x, self.max_y),
            Quadrant::NorthEast => BoundingBox::new(c.x, c.y, self.max_x, self.max_y),
            Quadrant::SouthWest => BoundingBox::new(self.min_x, self.min_y, c.x, c.y),
            Quadrant::SouthEast => BoundingBox::new(c.x, self.min_y, self.max_x, c.y),
        }
    }

    /// All four sub-boxes in [`Quadrant::ALL`] order.
    pub fn split(&self) -> [BoundingBox; 4] {
        Quadrant::ALL.map(|q| self.quadrant(q))
    }
}

impl Display for BoundingBox {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {}) x [{}, {})",
            self.min_x, self.max_x, self.min_y, self.max_y
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_half_open_containment() {
        let bbox = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        assert!(bbox.contains(&Point::new(0.0, 0.0)));
        assert!(bbox.contains(&Point::new(9.999, 9.999)));
        assert!(!bbox.contains(&Point::new(10.0, 0.0)));
        assert!(!bbox.contains(&Point::new(0.0, 10.0)));
        assert!(!bbox.contains(&Point::new(f64::NAN, 1.0)));
    }

    #[test]
    fn test_split_partitions_region() {
        let bbox = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let children = bbox.split();

        // every sample point is owned by exactly one child, the one quadrant_of picks
        for i in 0..20 {
            for j in 0..20 {
                let p = Point::new(i as f64 * 0.5, j as f64 * 0.5);
                let owners: Vec<usize> = (0..4).filter(|&c| children[c].contains(&p)).collect();
                assert_eq!(owners.len(), 1, "point {} owned by {:?}", p, owners);
                assert_eq!(owners[0], bbox.quadrant_of(&p).index());
            }
        }

        for child in &children {
            assert!(bbox.covers(child));
        }
        assert!(!children[0].intersects(&children[1]));
        assert!(!children[0].intersects(&children[3]));
    }

    #[test]
    fn test_boundary_point_goes_to_upper_quadrant() {
        let bbox = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        assert_eq!(bbox.quadrant_of(&Point::new(5.0, 5.0)), Quadrant::NorthEast);
        assert_eq!(bbox.quadrant_of(&Point::new(4.9, 5.0)), Quadrant::NorthWest);
        assert_eq!(bbox.quadrant_of(&Point::new(5.0, 4.9)), Quadrant::SouthEast);
    }

    #[test]
    fn test_intersects_half_open() {
        let a = BoundingBox::new(0.0, 0.0, 5.0, 5.0);
        let touching = BoundingBox::new(5.0, 0.0, 10.0, 5.0);
        let overlapping = BoundingBox::new(4.0, 4.0, 6.0, 6.0);
        assert!(!a.intersects(&touching));
        assert!(a.intersects(&overlapping));
        assert!(overlapping.intersects(&a));
    }

    #[test]
    fn test_validity() {
        assert!(BoundingBox::new(-180.0, -90.0, 180.0, 90.0).is_valid());
        assert!(!BoundingBox::new(1.0, 0.0, 1.0, 5.0).is_valid());
        assert!(!BoundingBox::new(0.0, 0.0, f64::INFINITY, 5.0).is_valid());
    }
}
