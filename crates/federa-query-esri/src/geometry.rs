//! Conversion between GeoJSON-shaped geometries and ArcGIS JSON geometries
//!
//! ArcGIS polygons are a flat list of rings: clockwise rings are exteriors,
//! counter-clockwise rings are holes of the exterior before them. GeoJSON
//! winding is the opposite, so rings are reversed in both directions.

use federa_query::{Bounds, Geometry, Position};
use serde_json::{json, Value};

pub const ESRI_POINT: &str = "esriGeometryPoint";
pub const ESRI_MULTIPOINT: &str = "esriGeometryMultipoint";
pub const ESRI_POLYLINE: &str = "esriGeometryPolyline";
pub const ESRI_POLYGON: &str = "esriGeometryPolygon";
pub const ESRI_ENVELOPE: &str = "esriGeometryEnvelope";

pub const WGS84: u32 = 4326;

fn spatial_reference() -> Value {
    json!({ "wkid": WGS84 })
}

pub fn envelope(bounds: &Bounds) -> Value {
    json!({
        "xmin": bounds.min_x,
        "ymin": bounds.min_y,
        "xmax": bounds.max_x,
        "ymax": bounds.max_y,
        "spatialReference": spatial_reference(),
    })
}

/// Shoelace test in ArcGIS orientation (y up)
pub fn is_clockwise(ring: &[Position]) -> bool {
    let sum: f64 = ring
        .windows(2)
        .filter(|w| w[0].len() >= 2 && w[1].len() >= 2)
        .map(|w| (w[1][0] - w[0][0]) * (w[1][1] + w[0][1]))
        .sum();
    sum > 0.0
}

fn oriented(ring: &[Position], clockwise: bool) -> Vec<Position> {
    let mut ring = ring.to_vec();
    if is_clockwise(&ring) != clockwise {
        ring.reverse();
    }
    ring
}

/// Exterior clockwise, holes counter-clockwise
fn esri_rings(polygon: &[Vec<Position>]) -> Vec<Vec<Position>> {
    polygon
        .iter()
        .enumerate()
        .map(|(i, ring)| oriented(ring, i == 0))
        .collect()
}

/// ArcGIS geometry type and JSON for a geometry
pub fn to_esri(geometry: &Geometry) -> (&'static str, Value) {
    let sr = spatial_reference();
    match geometry {
        Geometry::Point(p) => (
            ESRI_POINT,
            json!({
                "x": p.first().copied().unwrap_or_default(),
                "y": p.get(1).copied().unwrap_or_default(),
                "spatialReference": sr,
            }),
        ),
        Geometry::MultiPoint(points) => (
            ESRI_MULTIPOINT,
            json!({ "points": points, "spatialReference": sr }),
        ),
        Geometry::LineString(line) => (
            ESRI_POLYLINE,
            json!({ "paths": [line], "spatialReference": sr }),
        ),
        Geometry::MultiLineString(lines) => (
            ESRI_POLYLINE,
            json!({ "paths": lines, "spatialReference": sr }),
        ),
        Geometry::Polygon(rings) => (
            ESRI_POLYGON,
            json!({ "rings": esri_rings(rings), "spatialReference": sr }),
        ),
        Geometry::MultiPolygon(polygons) => {
            let rings: Vec<Vec<Position>> = polygons.iter().flat_map(|p| esri_rings(p)).collect();
            (
                ESRI_POLYGON,
                json!({ "rings": rings, "spatialReference": sr }),
            )
        }
    }
}

fn member<T: serde::de::DeserializeOwned>(value: &Value, name: &str) -> Option<T> {
    value
        .get(name)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

/// Group a flat ring list into polygons; each clockwise ring starts a new one
fn group_rings(rings: Vec<Vec<Position>>) -> Vec<Vec<Vec<Position>>> {
    let mut polygons: Vec<Vec<Vec<Position>>> = Vec::new();
    for ring in rings {
        let exterior = is_clockwise(&ring);
        let mut ring = ring;
        ring.reverse();
        match polygons.last_mut() {
            Some(polygon) if !exterior => polygon.push(ring),
            _ => polygons.push(vec![ring]),
        }
    }
    polygons
}

/// GeoJSON-shaped geometry from ArcGIS JSON; `None` for empty or unknown shapes
pub fn from_esri(value: &Value) -> Option<Geometry> {
    if let (Some(x), Some(y)) = (
        value.get("x").and_then(Value::as_f64),
        value.get("y").and_then(Value::as_f64),
    ) {
        return Some(Geometry::point(x, y));
    }

    if let Some(points) = member::<Vec<Position>>(value, "points") {
        return match points.len() {
            0 => None,
            1 => points.into_iter().next().map(Geometry::Point),
            _ => Some(Geometry::MultiPoint(points)),
        };
    }

    if let Some(mut paths) = member::<Vec<Vec<Position>>>(value, "paths") {
        return match paths.len() {
            0 => None,
            1 => paths.pop().map(Geometry::LineString),
            _ => Some(Geometry::MultiLineString(paths)),
        };
    }

    if let Some(rings) = member::<Vec<Vec<Position>>>(value, "rings") {
        let mut polygons = group_rings(rings);
        return match polygons.len() {
            0 => None,
            1 => polygons.pop().map(Geometry::Polygon),
            _ => Some(Geometry::MultiPolygon(polygons)),
        };
    }

    let corner = |name: &str| value.get(name).and_then(Value::as_f64);
    if let (Some(min_x), Some(min_y), Some(max_x), Some(max_y)) =
        (corner("xmin"), corner("ymin"), corner("xmax"), corner("ymax"))
    {
        return Some(Bounds::new(min_x, min_y, max_x, max_y).to_polygon());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x: f64, y: f64, size: f64, clockwise: bool) -> Vec<Position> {
        let mut ring = vec![
            vec![x, y],
            vec![x, y + size],
            vec![x + size, y + size],
            vec![x + size, y],
            vec![x, y],
        ];
        if !clockwise {
            ring.reverse();
        }
        ring
    }

    #[test]
    fn test_clockwise() {
        assert!(is_clockwise(&square(0.0, 0.0, 1.0, true)));
        assert!(!is_clockwise(&square(0.0, 0.0, 1.0, false)));
    }

    #[test]
    fn test_clockwise_rings_start_polygons() {
        let value = json!({
            "rings": [
                square(0.0, 0.0, 10.0, true),
                square(2.0, 2.0, 2.0, false),
                square(20.0, 20.0, 5.0, true)
            ]
        });

        match from_esri(&value) {
            Some(Geometry::MultiPolygon(polygons)) => {
                assert_eq!(polygons.len(), 2);
                assert_eq!(polygons[0].len(), 2);
                assert_eq!(polygons[1].len(), 1);
                // GeoJSON exterior winding
                assert!(!is_clockwise(&polygons[0][0]));
            }
            other => panic!("expected multipolygon, got {:?}", other),
        }
    }

    #[test]
    fn test_polygon_to_esri_orients_rings() {
        let polygon = Geometry::Polygon(vec![
            square(0.0, 0.0, 10.0, false),
            square(2.0, 2.0, 2.0, true),
        ]);
        let (kind, value) = to_esri(&polygon);
        assert_eq!(kind, ESRI_POLYGON);

        let rings: Vec<Vec<Position>> = serde_json::from_value(value["rings"].clone()).unwrap();
        assert!(is_clockwise(&rings[0]));
        assert!(!is_clockwise(&rings[1]));

        assert_eq!(from_esri(&value), Some(polygon));
    }

    #[test]
    fn test_simple_shapes() {
        let (kind, value) = to_esri(&Geometry::point(1.5, 2.5));
        assert_eq!(kind, ESRI_POINT);
        assert_eq!(from_esri(&value), Some(Geometry::point(1.5, 2.5)));

        let line = Geometry::LineString(vec![vec![0.0, 0.0], vec![1.0, 1.0]]);
        let (kind, value) = to_esri(&line);
        assert_eq!(kind, ESRI_POLYLINE);
        assert_eq!(from_esri(&value), Some(line));

        let envelope = envelope(&Bounds::new(0.0, 0.0, 2.0, 1.0));
        assert_eq!(from_esri(&envelope).and_then(|g| g.bounds()), Some(Bounds::new(0.0, 0.0, 2.0, 1.0)));

        assert_eq!(from_esri(&json!({"paths": []})), None);
        assert_eq!(from_esri(&json!({})), None);
    }
}
