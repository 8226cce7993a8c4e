use std::sync::Mutex;

use camino::Utf8Path;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::catalog_index::{open_database, open_memory_database};
use crate::error::IngestError;

type Ring = Vec<[f64; 2]>;

#[derive(Debug, Clone, PartialEq)]
pub struct AoiPolygon {
    rings: Vec<Ring>,
}

impl AoiPolygon {
    pub fn exterior(&self) -> &[[f64; 2]] {
        &self.rings[0]
    }

    pub fn to_wkt(&self) -> String {
        format!("POLYGON {}", rings_wkt(&self.rings))
    }
}

fn rings_wkt(rings: &[Ring]) -> String {
    let body = rings
        .iter()
        .map(|ring| {
            let points = ring
                .iter()
                .map(|[x, y]| format!("{x} {y}"))
                .collect::<Vec<_>>()
                .join(", ");
            format!("({points})")
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("({body})")
}

pub fn combined_wkt(polygons: &[AoiPolygon]) -> Result<String, IngestError> {
    match polygons {
        [] => Err(IngestError::InvalidAoi("no polygons".to_string())),
        [single] => Ok(single.to_wkt()),
        many => {
            let parts = many
                .iter()
                .map(|polygon| rings_wkt(&polygon.rings))
                .collect::<Vec<_>>()
                .join(", ");
            Ok(format!("MULTIPOLYGON ({parts})"))
        }
    }
}

pub fn parse_geojson(document: &Value) -> Result<Vec<AoiPolygon>, IngestError> {
    let kind = document.get("type").and_then(Value::as_str).unwrap_or("");
    let polygons = match kind {
        "FeatureCollection" => {
            let features = document
                .get("features")
                .and_then(Value::as_array)
                .ok_or_else(|| IngestError::InvalidAoi("missing features array".to_string()))?;
            let mut polygons = Vec::new();
            for (index, feature) in features.iter().enumerate() {
                let geometry = feature.get("geometry").ok_or_else(|| {
                    IngestError::InvalidAoi(format!("feature {index} has no geometry"))
                })?;
                polygons.extend(parse_geometry(geometry)?);
            }
            polygons
        }
        "Feature" => {
            let geometry = document
                .get("geometry")
                .ok_or_else(|| IngestError::InvalidAoi("feature has no geometry".to_string()))?;
            parse_geometry(geometry)?
        }
        _ => parse_geometry(document)?,
    };
    if polygons.is_empty() {
        return Err(IngestError::InvalidAoi("no polygons found".to_string()));
    }
    Ok(polygons)
}

fn parse_geometry(geometry: &Value) -> Result<Vec<AoiPolygon>, IngestError> {
    let kind = geometry.get("type").and_then(Value::as_str).unwrap_or("");
    let coordinates = geometry
        .get("coordinates")
        .and_then(Value::as_array)
        .ok_or_else(|| IngestError::InvalidAoi(format!("{kind} geometry has no coordinates")))?;
    match kind {
        "Polygon" => Ok(vec![parse_polygon(coordinates)?]),
        "MultiPolygon" => coordinates
            .iter()
            .map(|polygon| {
                polygon
                    .as_array()
                    .ok_or_else(|| IngestError::InvalidAoi("malformed MultiPolygon".to_string()))
                    .and_then(|rings| parse_polygon(rings))
            })
            .collect(),
        other => Err(IngestError::InvalidAoi(format!(
            "unsupported geometry type {other:?}"
        ))),
    }
}

fn parse_polygon(rings: &[Value]) -> Result<AoiPolygon, IngestError> {
    if rings.is_empty() {
        return Err(IngestError::InvalidAoi("polygon has no rings".to_string()));
    }
    let rings = rings.iter().map(parse_ring).collect::<Result<Vec<_>, _>>()?;
    Ok(AoiPolygon { rings })
}

fn parse_ring(ring: &Value) -> Result<Ring, IngestError> {
    let positions = ring
        .as_array()
        .ok_or_else(|| IngestError::InvalidAoi("ring is not an array".to_string()))?;
    let mut points = positions
        .iter()
        .map(|position| {
            let pair = position.as_array().filter(|pair| pair.len() >= 2);
            match pair.map(|pair| (pair[0].as_f64(), pair[1].as_f64())) {
                Some((Some(x), Some(y))) if x.is_finite() && y.is_finite() => Ok([x, y]),
                _ => Err(IngestError::InvalidAoi(format!(
                    "invalid position {position}"
                ))),
            }
        })
        .collect::<Result<Ring, _>>()?;
    if points.first() != points.last() {
        if let Some(first) = points.first().copied() {
            points.push(first);
        }
    }
    if points.len() < 4 {
        return Err(IngestError::InvalidAoi(format!(
            "ring needs at least 3 distinct positions, got {}",
            points.len().saturating_sub(1)
        )));
    }
    Ok(points)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AoiExtent {
    pub id: i64,
    pub aoi_name: String,
    pub aoi_wkt: String,
    pub created_at: DateTime<Utc>,
}

pub struct AoiRegistry {
    conn: Mutex<Connection>,
}

impl AoiRegistry {
    pub fn open(path: &Utf8Path) -> Result<Self, IngestError> {
        Ok(Self {
            conn: Mutex::new(open_database(path)?),
        })
    }

    pub fn open_in_memory() -> Result<Self, IngestError> {
        Ok(Self {
            conn: Mutex::new(open_memory_database()?),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, IngestError> {
        self.conn
            .lock()
            .map_err(|_| IngestError::Database("connection lock poisoned".to_string()))
    }

    pub fn insert(&self, name: &str, wkt: &str) -> Result<i64, IngestError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(IngestError::InvalidAoi("AOI name is empty".to_string()));
        }
        let conn = self.conn()?;
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        conn.execute(
            "INSERT INTO aoi_extents (aoi_name, aoi_wkt, created_at) VALUES (?1, ?2, ?3)",
            params![name, wkt, created_at],
        )?;
        let id = conn.last_insert_rowid();
        info!(id, name, "registered AOI");
        Ok(id)
    }

    pub fn get(&self, id: i64) -> Result<AoiExtent, IngestError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, aoi_name, aoi_wkt, created_at FROM aoi_extents WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?
            .ok_or(IngestError::AoiNotFound(id))?;
        to_extent(row)
    }

    pub fn list(&self) -> Result<Vec<AoiExtent>, IngestError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, aoi_name, aoi_wkt, created_at FROM aoi_extents ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<rusqlite::Result<Vec<(i64, String, String, String)>>>()?;
        rows.into_iter().map(to_extent).collect()
    }
}

fn to_extent(
    (id, aoi_name, aoi_wkt, created_at): (i64, String, String, String),
) -> Result<AoiExtent, IngestError> {
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|err| IngestError::Database(format!("aoi {id} created_at: {err}")))?
        .with_timezone(&Utc);
    Ok(AoiExtent {
        id,
        aoi_name,
        aoi_wkt,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn open_ring_is_closed() {
        let doc = json!({
            "type": "Polygon",
            "coordinates": [[[10.0, 50.0], [11.0, 50.0], [11.0, 51.5]]]
        });
        let polygons = parse_geojson(&doc).unwrap();
        assert_eq!(
            polygons[0].to_wkt(),
            "POLYGON ((10 50, 11 50, 11 51.5, 10 50))"
        );
    }

    #[test]
    fn degenerate_ring_is_rejected() {
        let doc = json!({"type": "Polygon", "coordinates": [[[0, 0], [1, 1]]]});
        assert_matches!(parse_geojson(&doc), Err(IngestError::InvalidAoi(_)));
    }

    #[test]
    fn registry_round_trips_extent() {
        let registry = AoiRegistry::open_in_memory().unwrap();
        let id = registry.insert("alps", "POLYGON ((0 0, 1 0, 1 1, 0 0))").unwrap();
        let extent = registry.get(id).unwrap();
        assert_eq!(extent.aoi_name, "alps");
        assert_matches!(registry.get(id + 1), Err(IngestError::AoiNotFound(_)));
    }
}
