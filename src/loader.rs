use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, TransactionBehavior, params_from_iter};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::SyncError;
use crate::geometry::{Feature, Geometry};

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static identifier regex"));

pub const MIN_BATCH: usize = 100;
pub const MAX_BATCH: usize = 1000;
/// SQLite's default cap on bound parameters per statement.
const MAX_VARIABLES: usize = 32766;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Text,
    Float,
    Integer,
    /// Stored as EWKT; polygons are promoted.
    MultiPolygon,
    /// Stored as EWKT; areal geometry is reduced to its centroid.
    Point,
}

impl ColumnKind {
    fn sql_type(self) -> &'static str {
        match self {
            ColumnKind::Text | ColumnKind::MultiPolygon | ColumnKind::Point => "TEXT",
            ColumnKind::Float => "REAL",
            ColumnKind::Integer => "INTEGER",
        }
    }

    fn is_geometry(self) -> bool {
        matches!(self, ColumnKind::MultiPolygon | ColumnKind::Point)
    }

    fn fallback(self) -> SqlValue {
        match self {
            ColumnKind::Text => SqlValue::Text(String::new()),
            ColumnKind::Float => SqlValue::Real(0.0),
            ColumnKind::Integer => SqlValue::Integer(0),
            ColumnKind::MultiPolygon | ColumnKind::Point => SqlValue::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub column: String,
    /// Source attribute name; ignored for geometry columns.
    #[serde(default)]
    pub source: String,
    pub kind: ColumnKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ColumnSpec {
    pub fn new(column: &str, source: &str, kind: ColumnKind) -> Self {
        Self {
            column: column.to_string(),
            source: source.to_string(),
            kind,
            default: None,
        }
    }

    pub fn geometry(column: &str, kind: ColumnKind) -> Self {
        Self::new(column, "", kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<ColumnSpec>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    500
}

impl TableSchema {
    pub fn new(table: &str, columns: Vec<ColumnSpec>) -> Self {
        Self {
            table: table.to_string(),
            columns,
            batch_size: default_batch_size(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        let invalid = |message: String| SyncError::InvalidJob {
            job: self.table.clone(),
            message,
        };
        if !IDENTIFIER.is_match(&self.table) {
            return Err(invalid(format!("invalid table name {:?}", self.table)));
        }
        if self.columns.is_empty() {
            return Err(invalid("table has no columns".to_string()));
        }
        for column in &self.columns {
            if !IDENTIFIER.is_match(&column.column) {
                return Err(invalid(format!("invalid column name {:?}", column.column)));
            }
            if !column.kind.is_geometry() && column.source.is_empty() {
                return Err(invalid(format!("column {} has no source field", column.column)));
            }
        }
        Ok(())
    }

    /// Rows per insert, also bounded so one statement stays under [`MAX_VARIABLES`].
    fn effective_batch(&self) -> usize {
        let per_statement = (MAX_VARIABLES / self.columns.len().max(1)).max(1);
        self.batch_size.clamp(MIN_BATCH, MAX_BATCH).min(per_statement)
    }

    fn create_sql(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(|c| format!("\"{}\" {}", c.column, c.kind.sql_type()))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (id INTEGER PRIMARY KEY, {columns})",
            self.table
        )
    }

    fn insert_sql(&self, rows: usize) -> String {
        let names = self
            .columns
            .iter()
            .map(|c| format!("\"{}\"", c.column))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = format!("({})", vec!["?"; self.columns.len()].join(", "));
        let values = vec![placeholders; rows].join(", ");
        format!("INSERT INTO \"{}\" ({names}) VALUES {values}", self.table)
    }
}

/// How source attributes become column values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingMode {
    /// Any coercion failure aborts the whole load.
    #[default]
    Direct,
    /// Missing or unparsable values fall back to the column default.
    Derived,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub attributes: Map<String, Value>,
    pub geometry: Option<Geometry>,
}

impl From<Feature> for SourceRecord {
    fn from(feature: Feature) -> Self {
        Self {
            attributes: feature.attributes,
            geometry: Some(feature.geometry),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub deleted: usize,
    pub inserted: usize,
    pub batches: usize,
}

/// Full-replace loader over a SQLite database.
pub struct StoreLoader {
    conn: Connection,
}

impl StoreLoader {
    pub fn open(path: &Path) -> Result<Self, SyncError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(|err| SyncError::Store(err.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
            .map_err(|err| SyncError::Store(err.to_string()))?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, SyncError> {
        let conn = Connection::open_in_memory().map_err(|err| SyncError::Store(err.to_string()))?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn ensure_table(&self, schema: &TableSchema) -> Result<(), SyncError> {
        schema.validate()?;
        self.conn
            .execute_batch(&schema.create_sql())
            .map_err(|err| SyncError::Store(err.to_string()))
    }

    pub fn replace(
        &mut self,
        schema: &TableSchema,
        mode: MappingMode,
        records: &[SourceRecord],
    ) -> Result<LoadSummary, SyncError> {
        self.replace_with(schema, mode, records, || {})
    }

    /// Delete-all then batched insert inside one immediate transaction.
    ///
    /// `between` runs after the delete and before the first insert; readers on other
    /// connections keep seeing the previous rows until commit.
    pub fn replace_with<F>(
        &mut self,
        schema: &TableSchema,
        mode: MappingMode,
        records: &[SourceRecord],
        between: F,
    ) -> Result<LoadSummary, SyncError>
    where
        F: FnOnce(),
    {
        self.ensure_table(schema)?;
        let rows = records
            .iter()
            .enumerate()
            .map(|(index, record)| map_record(schema, mode, index, record))
            .collect::<Result<Vec<_>, _>>()?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| SyncError::Store(err.to_string()))?;
        let deleted = tx
            .execute(&format!("DELETE FROM \"{}\"", schema.table), [])
            .map_err(|err| SyncError::Store(err.to_string()))?;
        between();

        let batch = schema.effective_batch();
        let mut batches = 0;
        for chunk in rows.chunks(batch) {
            let sql = schema.insert_sql(chunk.len());
            let mut stmt = tx
                .prepare_cached(&sql)
                .map_err(|err| SyncError::Store(err.to_string()))?;
            stmt.execute(params_from_iter(chunk.iter().flatten()))
                .map_err(|err| SyncError::Store(err.to_string()))?;
            batches += 1;
            debug!(table = %schema.table, batch = batches, rows = chunk.len(), "batch inserted");
        }
        tx.commit().map_err(|err| SyncError::Store(err.to_string()))?;

        let summary = LoadSummary {
            deleted,
            inserted: rows.len(),
            batches,
        };
        info!(table = %schema.table, deleted, inserted = rows.len(), batches, "table replaced");
        Ok(summary)
    }

    pub fn count_rows(&self, table: &str) -> Result<u64, SyncError> {
        if !IDENTIFIER.is_match(table) {
            return Err(SyncError::Store(format!("invalid table name {table:?}")));
        }
        self.conn
            .query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|count| count.max(0) as u64)
            .map_err(|err| SyncError::Store(err.to_string()))
    }
}

fn map_record(
    schema: &TableSchema,
    mode: MappingMode,
    row: usize,
    record: &SourceRecord,
) -> Result<Vec<SqlValue>, SyncError> {
    schema
        .columns
        .iter()
        .map(|column| {
            let converted = if column.kind.is_geometry() {
                convert_geometry(column.kind, record.geometry.as_ref())
            } else {
                convert_scalar(column.kind, lookup(&record.attributes, &column.source))
            };
            match (converted, mode) {
                (Ok(value), _) => Ok(value),
                (Err(message), MappingMode::Direct) => Err(SyncError::Validation {
                    row,
                    column: column.column.clone(),
                    message,
                }),
                (Err(_), MappingMode::Derived) => Ok(column_default(column)),
            }
        })
        .collect()
}

/// Exact name first, then a case-insensitive match.
fn lookup<'a>(attributes: &'a Map<String, Value>, source: &str) -> Option<&'a Value> {
    attributes.get(source).or_else(|| {
        attributes
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(source))
            .map(|(_, value)| value)
    })
}

fn column_default(column: &ColumnSpec) -> SqlValue {
    match &column.default {
        Some(default) => convert_scalar(column.kind, Some(default))
            .unwrap_or_else(|_| column.kind.fallback()),
        None => column.kind.fallback(),
    }
}

fn convert_scalar(kind: ColumnKind, value: Option<&Value>) -> Result<SqlValue, String> {
    let value = match value {
        None => return Err("missing source field".to_string()),
        Some(Value::Null) => return Err("null value".to_string()),
        Some(value) => value,
    };
    match kind {
        ColumnKind::Text => Ok(SqlValue::Text(match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })),
        ColumnKind::Float => as_float(value)
            .map(SqlValue::Real)
            .ok_or_else(|| format!("cannot convert {value} to float")),
        ColumnKind::Integer => as_integer(value)
            .map(SqlValue::Integer)
            .ok_or_else(|| format!("cannot convert {value} to integer")),
        ColumnKind::MultiPolygon | ColumnKind::Point => {
            Err("geometry columns take the record geometry".to_string())
        }
    }
}

fn as_float(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|number| number.is_finite())
}

/// Whole floats (`3.0`, `"3.0"`) are accepted as integers.
fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| whole(number.as_f64()?)),
        Value::String(text) => {
            let text = text.trim();
            text.parse::<i64>()
                .ok()
                .or_else(|| whole(text.parse::<f64>().ok()?))
        }
        _ => None,
    }
}

fn whole(number: f64) -> Option<i64> {
    (number.is_finite() && number.fract() == 0.0).then_some(number as i64)
}

fn convert_geometry(kind: ColumnKind, geometry: Option<&Geometry>) -> Result<SqlValue, String> {
    let geometry = geometry.ok_or_else(|| "record has no geometry".to_string())?;
    match kind {
        ColumnKind::MultiPolygon => {
            if !geometry.is_areal() {
                return Err(format!("expected polygon geometry, found {}", geometry.kind()));
            }
            Ok(SqlValue::Text(geometry.clone().into_multi().to_ewkt()))
        }
        ColumnKind::Point => {
            let (x, y) = geometry
                .centroid()
                .ok_or_else(|| "geometry has no centroid".to_string())?;
            Ok(SqlValue::Text(Geometry::Point { x, y }.to_ewkt()))
        }
        _ => Err("not a geometry column".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn sector_schema() -> TableSchema {
        TableSchema::new(
            "sector",
            vec![
                ColumnSpec::new("sec_code", "SEC_CODE", ColumnKind::Integer),
                ColumnSpec::new("sec_name", "SEC_NAME", ColumnKind::Text),
                ColumnSpec::new("area", "AREA", ColumnKind::Float),
                ColumnSpec::geometry("geom", ColumnKind::Point),
            ],
        )
    }

    fn record(attributes: Value, geometry: Geometry) -> SourceRecord {
        SourceRecord {
            attributes: attributes.as_object().cloned().unwrap(),
            geometry: Some(geometry),
        }
    }

    #[test]
    fn derived_mode_uses_defaults() {
        let mut loader = StoreLoader::open_in_memory().unwrap();
        let rows = vec![record(
            json!({"sec_code": "n/a", "SEC_NAME": "A"}),
            Geometry::Point { x: 1.0, y: 2.0 },
        )];
        loader
            .replace(&sector_schema(), MappingMode::Derived, &rows)
            .unwrap();
        let (code, area, geom): (i64, f64, String) = loader
            .connection()
            .query_row("SELECT sec_code, area, geom FROM sector", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(area, 0.0);
        assert_eq!(geom, "SRID=4326;POINT(1 2)");
    }

    #[test]
    fn direct_mode_rejects_bad_row_and_keeps_old_rows() {
        let mut loader = StoreLoader::open_in_memory().unwrap();
        let schema = sector_schema();
        let good = vec![record(
            json!({"SEC_CODE": 1, "SEC_NAME": "A", "AREA": 2.5}),
            Geometry::Point { x: 0.0, y: 0.0 },
        )];
        loader.replace(&schema, MappingMode::Direct, &good).unwrap();

        let bad = vec![record(
            json!({"SEC_CODE": "x", "SEC_NAME": "B", "AREA": 1}),
            Geometry::Point { x: 0.0, y: 0.0 },
        )];
        let err = loader
            .replace(&schema, MappingMode::Direct, &bad)
            .unwrap_err();
        assert_matches!(err, SyncError::Validation { row: 0, ref column, .. } if column == "sec_code");
        assert_eq!(loader.count_rows("sector").unwrap(), 1);
    }

    #[test]
    fn polygon_is_promoted_for_multipolygon_columns() {
        let square = vec![[0.0, 0.0], [0.0, 1.0], [1.0, 1.0], [0.0, 0.0]];
        let value = convert_geometry(ColumnKind::MultiPolygon, Some(&Geometry::Polygon(vec![square])))
            .unwrap();
        assert_matches!(value, SqlValue::Text(ref text) if text.starts_with("SRID=4326;MULTIPOLYGON"));
        assert!(convert_geometry(ColumnKind::MultiPolygon, Some(&Geometry::Point { x: 0.0, y: 0.0 })).is_err());
    }

    #[test]
    fn batches_are_clamped() {
        let mut loader = StoreLoader::open_in_memory().unwrap();
        let schema = sector_schema().with_batch_size(10);
        let rows: Vec<_> = (0..250)
            .map(|i| {
                record(
                    json!({"SEC_CODE": i, "SEC_NAME": format!("S{i}"), "AREA": 1.0}),
                    Geometry::Point { x: 0.0, y: 0.0 },
                )
            })
            .collect();
        let summary = loader.replace(&schema, MappingMode::Direct, &rows).unwrap();
        assert_eq!(summary.inserted, 250);
        assert_eq!(summary.batches, 3);
    }

    #[test]
    fn wide_schema_batches_stay_under_variable_limit() {
        let mut loader = StoreLoader::open_in_memory().unwrap();
        let columns = (0..40)
            .map(|i| ColumnSpec::new(&format!("c{i}"), &format!("C{i}"), ColumnKind::Text))
            .collect();
        let schema = TableSchema::new("wide", columns).with_batch_size(MAX_BATCH);
        assert_eq!(schema.effective_batch(), 819);

        let rows: Vec<_> = (0..1000)
            .map(|_| SourceRecord {
                attributes: Map::new(),
                geometry: None,
            })
            .collect();
        let summary = loader.replace(&schema, MappingMode::Derived, &rows).unwrap();
        assert_eq!(summary.inserted, 1000);
        assert_eq!(summary.batches, 2);
    }

    #[test]
    fn invalid_table_name_is_rejected() {
        let schema = TableSchema::new("bad name;", vec![ColumnSpec::new("a", "A", ColumnKind::Text)]);
        assert_matches!(schema.validate(), Err(SyncError::InvalidJob { .. }));
    }
}
