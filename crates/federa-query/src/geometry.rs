//! GeoJSON-shaped geometry and bounds value types shared by all adapters.
//!
//! Coordinates are `[longitude, latitude]` (WGS84) throughout.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single `[x, y]` (optionally `[x, y, z]`) position
pub type Position = Vec<f64>;

/// Geometry in GeoJSON layout (`{"type": "...", "coordinates": ...}`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Point(Position),
    MultiPoint(Vec<Position>),
    LineString(Vec<Position>),
    MultiLineString(Vec<Vec<Position>>),
    Polygon(Vec<Vec<Position>>),
    MultiPolygon(Vec<Vec<Vec<Position>>>),
}

/// Geometry type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeometryType {
    Point,
    MultiPoint,
    LineString,
    MultiLineString,
    Polygon,
    MultiPolygon,
}

impl fmt::Display for GeometryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeometryType::Point => write!(f, "Point"),
            GeometryType::MultiPoint => write!(f, "MultiPoint"),
            GeometryType::LineString => write!(f, "LineString"),
            GeometryType::MultiLineString => write!(f, "MultiLineString"),
            GeometryType::Polygon => write!(f, "Polygon"),
            GeometryType::MultiPolygon => write!(f, "MultiPolygon"),
        }
    }
}

impl Geometry {
    pub fn point(x: f64, y: f64) -> Self {
        Geometry::Point(vec![x, y])
    }

    pub fn geometry_type(&self) -> GeometryType {
        match self {
            Geometry::Point(_) => GeometryType::Point,
            Geometry::MultiPoint(_) => GeometryType::MultiPoint,
            Geometry::LineString(_) => GeometryType::LineString,
            Geometry::MultiLineString(_) => GeometryType::MultiLineString,
            Geometry::Polygon(_) => GeometryType::Polygon,
            Geometry::MultiPolygon(_) => GeometryType::MultiPolygon,
        }
    }

    pub fn is_multi(&self) -> bool {
        matches!(
            self,
            Geometry::MultiPoint(_) | Geometry::MultiLineString(_) | Geometry::MultiPolygon(_)
        )
    }

    /// Decompose into simple geometries, preserving constituent order.
    /// Simple geometries are returned as a single-element vector.
    pub fn split(&self) -> Vec<Geometry> {
        match self {
            Geometry::MultiPoint(points) => points.iter().cloned().map(Geometry::Point).collect(),
            Geometry::MultiLineString(lines) => {
                lines.iter().cloned().map(Geometry::LineString).collect()
            }
            Geometry::MultiPolygon(polygons) => {
                polygons.iter().cloned().map(Geometry::Polygon).collect()
            }
            simple => vec![simple.clone()],
        }
    }

    fn positions(&self) -> Vec<&Position> {
        match self {
            Geometry::Point(p) => vec![p],
            Geometry::MultiPoint(ps) | Geometry::LineString(ps) => ps.iter().collect(),
            Geometry::MultiLineString(ls) | Geometry::Polygon(ls) => ls.iter().flatten().collect(),
            Geometry::MultiPolygon(polys) => polys.iter().flatten().flatten().collect(),
        }
    }

    /// Bounding box of all positions, `None` for an empty geometry
    pub fn bounds(&self) -> Option<Bounds> {
        let mut iter = self.positions().into_iter().filter(|p| p.len() >= 2);
        let first = iter.next()?;
        let mut bounds = Bounds::new(first[0], first[1], first[0], first[1]);
        for p in iter {
            bounds.min_x = bounds.min_x.min(p[0]);
            bounds.min_y = bounds.min_y.min(p[1]);
            bounds.max_x = bounds.max_x.max(p[0]);
            bounds.max_y = bounds.max_y.max(p[1]);
        }
        Some(bounds)
    }
}

/// Axis-aligned bounding box in longitude/latitude
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Square box centred on a point
    pub fn around(x: f64, y: f64, half_size: f64) -> Self {
        Self::new(x - half_size, y - half_size, x + half_size, y + half_size)
    }

    /// Parse `minx,miny,maxx,maxy`
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<f64> = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .ok()?;
        match parts.as_slice() {
            [min_x, min_y, max_x, max_y] => Some(Self::new(*min_x, *min_y, *max_x, *max_y)),
            _ => None,
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    /// `minx,miny,maxx,maxy` as used by most query string APIs
    pub fn to_bbox_string(&self) -> String {
        format!("{},{},{},{}", self.min_x, self.min_y, self.max_x, self.max_y)
    }

    pub fn to_polygon(&self) -> Geometry {
        Geometry::Polygon(vec![vec![
            vec![self.min_x, self.min_y],
            vec![self.max_x, self.min_y],
            vec![self.max_x, self.max_y],
            vec![self.min_x, self.max_y],
            vec![self.min_x, self.min_y],
        ]])
    }
}

impl fmt::Display for Bounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_bbox_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geojson_layout() {
        let geom = Geometry::point(1.5, 52.0);
        let json = serde_json::to_value(&geom).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "Point", "coordinates": [1.5, 52.0]})
        );

        let parsed: Geometry = serde_json::from_value(serde_json::json!({
            "type": "LineString",
            "coordinates": [[0.0, 0.0], [1.0, 1.0]]
        }))
        .unwrap();
        assert_eq!(parsed.geometry_type(), GeometryType::LineString);
    }

    #[test]
    fn test_split_preserves_order() {
        let multi = Geometry::MultiPoint(vec![vec![1.0, 1.0], vec![2.0, 2.0], vec![3.0, 3.0]]);
        let parts = multi.split();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], Geometry::point(1.0, 1.0));
        assert_eq!(parts[2], Geometry::point(3.0, 3.0));

        let simple = Geometry::point(0.0, 0.0);
        assert_eq!(simple.split(), vec![simple.clone()]);
        assert!(!simple.is_multi());
        assert!(multi.is_multi());
    }

    #[test]
    fn test_bounds_from_geometry() {
        let line = Geometry::LineString(vec![vec![-1.0, 2.0], vec![3.0, -4.0], vec![0.5, 0.5]]);
        let bounds = line.bounds().unwrap();
        assert_eq!(bounds, Bounds::new(-1.0, -4.0, 3.0, 2.0));
        assert!(bounds.contains(0.0, 0.0));
        assert!(!bounds.contains(4.0, 0.0));
    }

    #[test]
    fn test_bounds_parse() {
        let bounds = Bounds::parse("0, 1, 2.5, 3").unwrap();
        assert_eq!(bounds.to_bbox_string(), "0,1,2.5,3");
        assert!(Bounds::parse("0,1,2").is_none());
        assert!(Bounds::parse("a,b,c,d").is_none());
    }
}
