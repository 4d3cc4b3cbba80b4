//! Raw feature -> normalized permit mapping.
//!
//! Pure: problems with individual fields come back as [`TransformWarning`]s
//! next to the permit and never stop the record from being produced.

use chrono::{DateTime, Utc};
use permitiq_core::{AttributeValue, NormalizedPermit, PolygonGeometry, Position, RawFeature};
use thiserror::Error;

pub const OBJECT_ID: &str = "OBJECTID";
pub const PERMIT_NUMBER: &str = "ERP_PERMIT_NBR";
pub const PERMITTEE_NAME: &str = "PERMITTEE_NAME";
pub const PERMIT_TYPE: &str = "ERP_PERMIT_TYPE_DESC";
pub const PERMIT_STATUS: &str = "ERP_STATUS_DESC";
pub const ACTIVITY: &str = "ERP_ACTIVITY_DESC";
pub const PROJECT_NAME: &str = "PROJECT_NAME";
pub const PROJECT_ACRES: &str = "PROJECT_ACRES_MS";
pub const APPLICATION_RECEIVED: &str = "APPLICATION_RECEIVED_DT";
pub const PERMIT_ISSUED: &str = "PERMIT_ISSUE_DT";
pub const EXPIRATION: &str = "EXPIRATION_DT";
pub const LAST_UPDATE: &str = "LAST_UPDATE_DT";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransformWarning {
    #[error("could not parse timestamp {raw} in {field}")]
    UnparsableTimestamp { field: &'static str, raw: String },
    #[error("could not parse number {raw} in {field}")]
    UnparsableNumber { field: &'static str, raw: String },
}

/// A permit plus the field-level problems met while building it.
#[derive(Debug, Clone, PartialEq)]
pub struct Transformed {
    pub permit: NormalizedPermit,
    pub warnings: Vec<TransformWarning>,
}

/// Boundary and centroid derived from a polygon.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedGeometry {
    pub boundary_wkt: String,
    pub centroid: Option<Position>,
}

pub fn transform(feature: &RawFeature) -> Transformed {
    let mut warnings = Vec::new();
    let mut permit = NormalizedPermit::from_payload(feature.attributes.clone());

    permit.revision_id = feature.attribute(OBJECT_ID).and_then(AttributeValue::as_i64);
    permit.permit_number = text(feature, PERMIT_NUMBER);
    permit.applicant_name = text(feature, PERMITTEE_NAME);
    // The layer has no separate company field.
    permit.company_name = permit.applicant_name.clone();
    permit.permit_type = text(feature, PERMIT_TYPE);
    permit.permit_status = text(feature, PERMIT_STATUS);
    permit.activity_description = text(feature, ACTIVITY);
    permit.project_name = text(feature, PROJECT_NAME);
    permit.acreage = number(feature, PROJECT_ACRES, &mut warnings);

    permit.application_date = timestamp(feature, APPLICATION_RECEIVED, &mut warnings);
    permit.issue_date = timestamp(feature, PERMIT_ISSUED, &mut warnings);
    permit.expiration_date = timestamp(feature, EXPIRATION, &mut warnings);
    permit.last_modified_date = timestamp(feature, LAST_UPDATE, &mut warnings);

    if let Some(derived) = feature.geometry.as_ref().and_then(derive_geometry) {
        permit.boundary_polygon = Some(derived.boundary_wkt);
        if let Some(centroid) = derived.centroid {
            permit.latitude = Some(centroid.lat);
            permit.longitude = Some(centroid.lon);
            permit.centroid_point = Some(point_wkt(centroid));
        }
    }

    Transformed { permit, warnings }
}

fn text(feature: &RawFeature, field: &str) -> Option<String> {
    feature.attribute(field).and_then(AttributeValue::to_text)
}

fn number(
    feature: &RawFeature,
    field: &'static str,
    warnings: &mut Vec<TransformWarning>,
) -> Option<f64> {
    let value = feature.attribute(field)?;
    let parsed = value.as_f64();
    if parsed.is_none() {
        warnings.push(TransformWarning::UnparsableNumber {
            field,
            raw: value.to_string(),
        });
    }
    parsed
}

fn timestamp(
    feature: &RawFeature,
    field: &'static str,
    warnings: &mut Vec<TransformWarning>,
) -> Option<DateTime<Utc>> {
    let value = feature.attribute(field)?;
    let parsed = parse_epoch_millis(value);
    if parsed.is_none() {
        warnings.push(TransformWarning::UnparsableTimestamp {
            field,
            raw: value.to_string(),
        });
    }
    parsed
}

/// Milliseconds since the Unix epoch to a UTC instant. Floats are truncated;
/// strings must hold an integer.
pub fn parse_epoch_millis(value: &AttributeValue) -> Option<DateTime<Utc>> {
    let millis = match value {
        AttributeValue::Integer(ms) => *ms,
        AttributeValue::Float(ms) if ms.is_finite() && ms.abs() < i64::MAX as f64 => {
            ms.trunc() as i64
        }
        AttributeValue::Text(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    DateTime::from_timestamp_millis(millis)
}

/// Boundary of every non-empty ring plus the mean of the first ring's
/// vertices. `None` when the polygon has no vertices at all.
pub fn derive_geometry(geometry: &PolygonGeometry) -> Option<DerivedGeometry> {
    if geometry.rings.iter().all(Vec::is_empty) {
        return None;
    }
    Some(DerivedGeometry {
        boundary_wkt: polygon_wkt(&geometry.rings),
        centroid: geometry.rings.first().and_then(|ring| ring_centroid(ring)),
    })
}

/// Arithmetic mean of the ring's vertices; not an area-weighted centroid.
pub fn ring_centroid(ring: &[Position]) -> Option<Position> {
    if ring.is_empty() {
        return None;
    }
    let n = ring.len() as f64;
    let (lon_sum, lat_sum) = ring
        .iter()
        .fold((0.0, 0.0), |(lon, lat), p| (lon + p.lon, lat + p.lat));
    Some(Position::new(lon_sum / n, lat_sum / n))
}

pub fn polygon_wkt(rings: &[Vec<Position>]) -> String {
    let rings = rings
        .iter()
        .filter(|ring| !ring.is_empty())
        .map(|ring| {
            let coords = ring
                .iter()
                .map(|p| format!("{} {}", p.lon, p.lat))
                .collect::<Vec<_>>()
                .join(", ");
            format!("({coords})")
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("POLYGON({rings})")
}

pub fn point_wkt(point: Position) -> String {
    format!("POINT({} {})", point.lon, point.lat)
}
