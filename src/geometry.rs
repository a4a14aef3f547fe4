use std::fmt::Write as _;

use serde_json::{Map, Value, json};

use crate::error::SyncError;

/// All stored geometry is in EPSG:4326.
pub const TARGET_SRID: u32 = 4326;

pub type Ring = Vec<[f64; 2]>;

#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point { x: f64, y: f64 },
    /// Exterior ring first, then holes.
    Polygon(Vec<Ring>),
    MultiPolygon(Vec<Vec<Ring>>),
}

impl Geometry {
    pub fn kind(&self) -> &'static str {
        match self {
            Geometry::Point { .. } => "Point",
            Geometry::Polygon(_) => "Polygon",
            Geometry::MultiPolygon(_) => "MultiPolygon",
        }
    }

    pub fn is_areal(&self) -> bool {
        !matches!(self, Geometry::Point { .. })
    }

    /// Polygons are promoted to a single-member multipolygon; points are returned as-is.
    pub fn into_multi(self) -> Geometry {
        match self {
            Geometry::Polygon(rings) => Geometry::MultiPolygon(vec![rings]),
            other => other,
        }
    }

    pub fn to_wkt(&self) -> String {
        let mut out = String::new();
        match self {
            Geometry::Point { x, y } => {
                let _ = write!(out, "POINT({x} {y})");
            }
            Geometry::Polygon(rings) => {
                out.push_str("POLYGON");
                write_polygon(&mut out, rings);
            }
            Geometry::MultiPolygon(polygons) => {
                out.push_str("MULTIPOLYGON(");
                for (index, rings) in polygons.iter().enumerate() {
                    if index > 0 {
                        out.push(',');
                    }
                    write_polygon(&mut out, rings);
                }
                out.push(')');
            }
        }
        out
    }

    pub fn to_ewkt(&self) -> String {
        format!("SRID={TARGET_SRID};{}", self.to_wkt())
    }

    /// Area-weighted centroid; degenerate shapes fall back to the mean of exterior vertices.
    pub fn centroid(&self) -> Option<(f64, f64)> {
        let polygons: Vec<&Vec<Ring>> = match self {
            Geometry::Point { x, y } => return Some((*x, *y)),
            Geometry::Polygon(rings) => vec![rings],
            Geometry::MultiPolygon(polygons) => polygons.iter().collect(),
        };
        let mut weight = 0.0;
        let mut cx = 0.0;
        let mut cy = 0.0;
        for rings in &polygons {
            for (index, ring) in rings.iter().enumerate() {
                let (area, x, y) = ring_moments(ring);
                let area = if index == 0 { area.abs() } else { -area.abs() };
                weight += area;
                cx += area * x;
                cy += area * y;
            }
        }
        if weight.abs() > f64::EPSILON {
            return Some((cx / weight, cy / weight));
        }
        let exterior: Vec<&[f64; 2]> = polygons
            .iter()
            .filter_map(|rings| rings.first())
            .flatten()
            .collect();
        if exterior.is_empty() {
            return None;
        }
        let count = exterior.len() as f64;
        let (sx, sy) = exterior
            .iter()
            .fold((0.0, 0.0), |(sx, sy), [x, y]| (sx + x, sy + y));
        Some((sx / count, sy / count))
    }

    pub fn to_geojson(&self) -> Value {
        match self {
            Geometry::Point { x, y } => json!({"type": "Point", "coordinates": [x, y]}),
            Geometry::Polygon(rings) => json!({"type": "Polygon", "coordinates": rings}),
            Geometry::MultiPolygon(polygons) => {
                json!({"type": "MultiPolygon", "coordinates": polygons})
            }
        }
    }

    pub fn from_geojson(value: &Value) -> Result<Self, SyncError> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| geojson_error("geometry without type"))?;
        let coordinates = value
            .get("coordinates")
            .ok_or_else(|| geojson_error("geometry without coordinates"))?;
        match kind {
            "Point" => {
                let [x, y] = parse_position(coordinates)?;
                Ok(Geometry::Point { x, y })
            }
            "Polygon" => Ok(Geometry::Polygon(parse_rings(coordinates)?)),
            "MultiPolygon" => {
                let polygons = coordinates
                    .as_array()
                    .ok_or_else(|| geojson_error("multipolygon coordinates must be an array"))?
                    .iter()
                    .map(parse_rings)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Geometry::MultiPolygon(polygons))
            }
            other => Err(geojson_error(&format!("unsupported geometry type {other}"))),
        }
    }
}

fn write_polygon(out: &mut String, rings: &[Ring]) {
    out.push('(');
    for (index, ring) in rings.iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        out.push('(');
        for (pos, [x, y]) in ring.iter().enumerate() {
            if pos > 0 {
                out.push(',');
            }
            let _ = write!(out, "{x} {y}");
        }
        out.push(')');
    }
    out.push(')');
}

/// Signed shoelace area and the ring's centroid.
fn ring_moments(ring: &[[f64; 2]]) -> (f64, f64, f64) {
    let mut twice_area = 0.0;
    let mut cx = 0.0;
    let mut cy = 0.0;
    for pair in ring.windows(2) {
        let [x0, y0] = pair[0];
        let [x1, y1] = pair[1];
        let cross = x0 * y1 - x1 * y0;
        twice_area += cross;
        cx += (x0 + x1) * cross;
        cy += (y0 + y1) * cross;
    }
    if twice_area.abs() <= f64::EPSILON {
        return (0.0, 0.0, 0.0);
    }
    let area = twice_area / 2.0;
    (area, cx / (3.0 * twice_area), cy / (3.0 * twice_area))
}

fn geojson_error(message: &str) -> SyncError {
    SyncError::Parse {
        source_name: "geojson".to_string(),
        message: message.to_string(),
    }
}

fn parse_position(value: &Value) -> Result<[f64; 2], SyncError> {
    let items = value
        .as_array()
        .ok_or_else(|| geojson_error("position must be an array"))?;
    match (
        items.first().and_then(Value::as_f64),
        items.get(1).and_then(Value::as_f64),
    ) {
        (Some(x), Some(y)) => Ok([x, y]),
        _ => Err(geojson_error("position needs two numbers")),
    }
}

fn parse_rings(value: &Value) -> Result<Vec<Ring>, SyncError> {
    value
        .as_array()
        .ok_or_else(|| geojson_error("polygon coordinates must be an array"))?
        .iter()
        .map(|ring| {
            ring.as_array()
                .ok_or_else(|| geojson_error("ring must be an array"))?
                .iter()
                .map(parse_position)
                .collect()
        })
        .collect()
}

/// One record: scalar attributes plus a geometry in EPSG:4326.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub attributes: Map<String, Value>,
    pub geometry: Geometry,
}

impl Feature {
    pub fn attribute_str(&self, key: &str) -> Option<String> {
        match self.attributes.get(key)? {
            Value::String(value) => Some(value.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn to_geojson(&self) -> Value {
        json!({
            "type": "Feature",
            "properties": Value::Object(self.attributes.clone()),
            "geometry": self.geometry.to_geojson(),
        })
    }

    pub fn from_geojson(value: &Value) -> Result<Self, SyncError> {
        let geometry = value
            .get("geometry")
            .ok_or_else(|| geojson_error("feature without geometry"))?;
        let attributes = match value.get("properties") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => return Err(geojson_error("feature properties must be an object")),
        };
        Ok(Self {
            attributes,
            geometry: Geometry::from_geojson(geometry)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x0: f64, y0: f64, size: f64) -> Ring {
        vec![
            [x0, y0],
            [x0, y0 + size],
            [x0 + size, y0 + size],
            [x0 + size, y0],
            [x0, y0],
        ]
    }

    #[test]
    fn point_wkt_uses_shortest_float_form() {
        let point = Geometry::Point { x: 1.0, y: 1.5 };
        assert_eq!(point.to_wkt(), "POINT(1 1.5)");
        assert_eq!(point.to_ewkt(), "SRID=4326;POINT(1 1.5)");
    }

    #[test]
    fn polygon_promotes_to_multipolygon_wkt() {
        let multi = Geometry::Polygon(vec![square(0.0, 0.0, 1.0)]).into_multi();
        assert_eq!(
            multi.to_wkt(),
            "MULTIPOLYGON(((0 0,0 1,1 1,1 0,0 0)))"
        );
    }

    #[test]
    fn centroid_of_square_with_hole() {
        let outer = square(0.0, 0.0, 4.0);
        let hole = square(0.0, 0.0, 2.0);
        let (x, y) = Geometry::Polygon(vec![outer, hole]).centroid().unwrap();
        let expected = (16.0 * 2.0 - 4.0 * 1.0) / 12.0;
        assert!((x - expected).abs() < 1e-9);
        assert!((y - expected).abs() < 1e-9);
    }

    #[test]
    fn degenerate_polygon_centroid_uses_vertex_mean() {
        let line = vec![[0.0, 0.0], [2.0, 2.0], [0.0, 0.0]];
        let (x, y) = Geometry::Polygon(vec![line]).centroid().unwrap();
        assert!((x - 2.0 / 3.0).abs() < 1e-9);
        assert!((y - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn geojson_feature_reads_back() {
        let feature = Feature {
            attributes: json!({"SEC_NAME": "A"}).as_object().unwrap().clone(),
            geometry: Geometry::MultiPolygon(vec![vec![square(1.0, 1.0, 1.0)]]),
        };
        let parsed = Feature::from_geojson(&feature.to_geojson()).unwrap();
        assert_eq!(parsed, feature);
        assert_eq!(parsed.attribute_str("SEC_NAME").as_deref(), Some("A"));
    }
}
