//! Core domain model for the PermitIQ ETL pipeline.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "permitiq-core";

/// Value written to `data_source` on every permit row.
pub const DATA_SOURCE: &str = "SWFWMD_API";

/// One scalar attribute as delivered by the source layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl AttributeValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Text form of the value; `None` for nulls and empty strings.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Text(s) if s.trim().is_empty() => None,
            Self::Text(s) => Some(s.clone()),
            Self::Bool(b) => Some(b.to_string()),
            Self::Integer(i) => Some(i.to_string()),
            Self::Float(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 => {
                Some(format!("{}", *f as i64))
            }
            Self::Float(f) => Some(f.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Float(f) if f.is_finite() => Some(*f),
            Self::Text(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Float(f) if f.is_finite() && f.fract() == 0.0 => Some(*f as i64),
            Self::Text(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    /// Short type label used by field discovery.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Integer(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "str",
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => write!(f, "{s:?}"),
        }
    }
}

/// Raw attribute mapping of a feature, keyed by source field name.
pub type AttributeBag = BTreeMap<String, AttributeValue>;

/// A `[longitude, latitude]` vertex. Extra ordinates (Z, M) are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "[f64; 2]")]
pub struct Position {
    pub lon: f64,
    pub lat: f64,
}

impl Position {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }
}

impl TryFrom<Vec<f64>> for Position {
    type Error = String;

    fn try_from(value: Vec<f64>) -> Result<Self, Self::Error> {
        match value.as_slice() {
            [lon, lat, ..] => Ok(Self::new(*lon, *lat)),
            other => Err(format!(
                "position needs at least 2 ordinates, got {}",
                other.len()
            )),
        }
    }
}

impl From<Position> for [f64; 2] {
    fn from(value: Position) -> Self {
        [value.lon, value.lat]
    }
}

/// Polygon geometry in source order: rings of vertices, winding untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolygonGeometry {
    #[serde(default)]
    pub rings: Vec<Vec<Position>>,
}

/// One record of a fetched page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFeature {
    #[serde(default)]
    pub attributes: AttributeBag,
    #[serde(default)]
    pub geometry: Option<PolygonGeometry>,
}

impl RawFeature {
    /// Attribute lookup that treats explicit nulls as absent.
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name).filter(|v| !v.is_null())
    }
}

/// Normalized permit row. `None` fields are left out of the serialized row so
/// an upsert never overwrites a stored value with null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPermit {
    #[serde(rename = "objectid", default, skip_serializing_if = "Option::is_none")]
    pub revision_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permit_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applicant_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permit_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permit_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(rename = "geometry", default, skip_serializing_if = "Option::is_none")]
    pub boundary_polygon: Option<String>,
    #[serde(rename = "location", default, skip_serializing_if = "Option::is_none")]
    pub centroid_point: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acreage: Option<f64>,
    #[serde(rename = "raw_data")]
    pub raw_payload: AttributeBag,
    pub data_source: String,
}

impl NormalizedPermit {
    /// An empty permit carrying only the audit payload.
    pub fn from_payload(raw_payload: AttributeBag) -> Self {
        Self {
            revision_id: None,
            permit_number: None,
            applicant_name: None,
            company_name: None,
            permit_type: None,
            permit_status: None,
            activity_description: None,
            application_date: None,
            issue_date: None,
            expiration_date: None,
            last_modified_date: None,
            latitude: None,
            longitude: None,
            boundary_polygon: None,
            centroid_point: None,
            project_name: None,
            acreage: None,
            raw_payload,
            data_source: DATA_SOURCE.to_string(),
        }
    }
}
