use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde_json::{Map, Number, Value};
use shapefile::dbase::FieldValue;
use shapefile::{Point, PointM, PointZ, PolygonRing, Shape};
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::geometry::{Feature, Geometry, Ring};

/// Features read from one shapefile, plus what had to be assumed or skipped.
#[derive(Debug, Clone, Default)]
pub struct VectorLayer {
    pub features: Vec<Feature>,
    pub skipped: usize,
    pub crs_assumed: bool,
}

/// Reads a `.shp` (with its `.shx`/`.dbf` siblings) into features.
pub fn read_shapefile(path: &Path) -> Result<VectorLayer, SyncError> {
    let source_name = path.display().to_string();
    let crs_assumed = check_crs(path);
    let mut reader = shapefile::Reader::from_path(path).map_err(|err| SyncError::Parse {
        source_name: source_name.clone(),
        message: err.to_string(),
    })?;

    let mut layer = VectorLayer {
        crs_assumed,
        ..VectorLayer::default()
    };
    for (index, item) in reader.iter_shapes_and_records().enumerate() {
        let (shape, record) = item.map_err(|err| SyncError::Parse {
            source_name: source_name.clone(),
            message: format!("record {index}: {err}"),
        })?;
        let Some(geometry) = shape_to_geometry(shape) else {
            warn!(path = %source_name, record = index, "unsupported or empty shape, skipping");
            layer.skipped += 1;
            continue;
        };
        let fields: HashMap<String, FieldValue> = record.into();
        let attributes = fields
            .into_iter()
            .map(|(name, value)| (name, field_to_json(value)))
            .collect::<Map<String, Value>>();
        layer.features.push(Feature {
            attributes,
            geometry,
        });
    }
    debug!(path = %source_name, features = layer.features.len(), skipped = layer.skipped, "shapefile read");
    Ok(layer)
}

/// Returns `true` when EPSG:4326 had to be assumed.
fn check_crs(shp: &Path) -> bool {
    let prj = shp.with_extension("prj");
    match fs::read_to_string(&prj) {
        Ok(wkt) => {
            let upper = wkt.to_ascii_uppercase();
            if !(upper.contains("WGS_1984") || upper.contains("WGS 84") || upper.contains("4326")) {
                warn!(path = %prj.display(), "source CRS is not EPSG:4326; coordinates are stored unchanged");
            }
            false
        }
        Err(_) => {
            warn!(path = %shp.display(), "no .prj alongside shapefile, assuming EPSG:4326");
            true
        }
    }
}

trait Planar {
    fn xy(&self) -> [f64; 2];
}

impl Planar for Point {
    fn xy(&self) -> [f64; 2] {
        [self.x, self.y]
    }
}

impl Planar for PointM {
    fn xy(&self) -> [f64; 2] {
        [self.x, self.y]
    }
}

impl Planar for PointZ {
    fn xy(&self) -> [f64; 2] {
        [self.x, self.y]
    }
}

pub fn shape_to_geometry(shape: Shape) -> Option<Geometry> {
    match shape {
        Shape::Point(point) => Some(point_geometry(&point)),
        Shape::PointM(point) => Some(point_geometry(&point)),
        Shape::PointZ(point) => Some(point_geometry(&point)),
        Shape::Polygon(polygon) => group_rings(polygon.rings()),
        Shape::PolygonM(polygon) => group_rings(polygon.rings()),
        Shape::PolygonZ(polygon) => group_rings(polygon.rings()),
        _ => None,
    }
}

fn point_geometry<P: Planar>(point: &P) -> Geometry {
    let [x, y] = point.xy();
    Geometry::Point { x, y }
}

/// Outer rings open a new polygon; inner rings are holes of the latest one.
fn group_rings<P: Planar>(rings: &[PolygonRing<P>]) -> Option<Geometry> {
    let mut polygons: Vec<Vec<Ring>> = Vec::new();
    for ring in rings {
        match ring {
            PolygonRing::Outer(points) => {
                polygons.push(vec![points.iter().map(Planar::xy).collect()]);
            }
            PolygonRing::Inner(points) => {
                let hole: Ring = points.iter().map(Planar::xy).collect();
                match polygons.last_mut() {
                    Some(polygon) => polygon.push(hole),
                    None => polygons.push(vec![hole]),
                }
            }
        }
    }
    match polygons.len() {
        0 => None,
        1 => polygons.pop().map(Geometry::Polygon),
        _ => Some(Geometry::MultiPolygon(polygons)),
    }
}

fn field_to_json(value: FieldValue) -> Value {
    match value {
        FieldValue::Character(Some(text)) => Value::String(text.trim_end().to_string()),
        FieldValue::Character(None) => Value::Null,
        FieldValue::Memo(text) => Value::String(text),
        FieldValue::Numeric(number) => number.map_or(Value::Null, number_value),
        FieldValue::Float(number) => number.map_or(Value::Null, |n| number_value(f64::from(n))),
        FieldValue::Double(number) => number_value(number),
        FieldValue::Currency(number) => number_value(number),
        FieldValue::Integer(number) => Value::from(number),
        FieldValue::Logical(flag) => flag.map_or(Value::Null, Value::Bool),
        other => Value::String(format!("{other:?}")),
    }
}

fn number_value(number: f64) -> Value {
    Number::from_f64(number).map_or(Value::Null, Value::Number)
}

#[cfg(test)]
mod tests {
    use shapefile::Polygon;

    use super::*;

    #[test]
    fn polygon_rings_group_into_multipolygon() {
        let polygon = Polygon::with_rings(vec![
            PolygonRing::Outer(vec![
                Point::new(0.0, 0.0),
                Point::new(0.0, 4.0),
                Point::new(4.0, 4.0),
                Point::new(4.0, 0.0),
                Point::new(0.0, 0.0),
            ]),
            PolygonRing::Inner(vec![
                Point::new(1.0, 1.0),
                Point::new(2.0, 1.0),
                Point::new(2.0, 2.0),
                Point::new(1.0, 2.0),
                Point::new(1.0, 1.0),
            ]),
            PolygonRing::Outer(vec![
                Point::new(10.0, 10.0),
                Point::new(10.0, 11.0),
                Point::new(11.0, 11.0),
                Point::new(11.0, 10.0),
                Point::new(10.0, 10.0),
            ]),
        ]);
        let geometry = shape_to_geometry(Shape::Polygon(polygon)).unwrap();
        match geometry {
            Geometry::MultiPolygon(polygons) => {
                assert_eq!(polygons.len(), 2);
                assert_eq!(polygons[0].len(), 2);
                assert_eq!(polygons[1].len(), 1);
            }
            other => panic!("expected multipolygon, got {}", other.kind()),
        }
    }

    #[test]
    fn point_shape_keeps_coordinates() {
        let geometry = shape_to_geometry(Shape::Point(Point::new(36.8, -1.3))).unwrap();
        assert_eq!(geometry, Geometry::Point { x: 36.8, y: -1.3 });
    }

    #[test]
    fn null_shape_is_skipped() {
        assert!(shape_to_geometry(Shape::NullShape).is_none());
    }

    #[test]
    fn character_fields_are_trimmed() {
        let value = field_to_json(FieldValue::Character(Some("Juba   ".to_string())));
        assert_eq!(value, Value::String("Juba".to_string()));
        assert_eq!(field_to_json(FieldValue::Numeric(None)), Value::Null);
    }
}
