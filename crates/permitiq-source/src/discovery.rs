//! Field discovery over a sample page: which attributes the layer actually
//! returns, their value types, and what the geometry looks like.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use permitiq_core::{AttributeValue, Position, RawFeature};
use serde::Serialize;

use crate::transform::ring_centroid;

const MAX_SAMPLE_VALUES: usize = 3;
const MAX_SAMPLE_POLYGONS: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDiscoveryReport {
    pub discovery_date: DateTime<Utc>,
    pub summary: DiscoverySummary,
    pub fields: BTreeMap<String, FieldProfile>,
    pub geometry: GeometryProfile,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoverySummary {
    pub total_fields: usize,
    pub records_analyzed: usize,
    pub records_with_geometry: usize,
    pub records_without_geometry: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldProfile {
    pub data_types: BTreeMap<String, usize>,
    /// Most frequent type; ties go to the type seen first.
    pub primary_type: String,
    pub sample_values: Vec<AttributeValue>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct GeometryProfile {
    pub has_geometry: usize,
    pub missing_geometry: usize,
    pub geometry_type: Option<String>,
    pub sample_polygons: Vec<SamplePolygon>,
    pub sample_centroids: Vec<Position>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplePolygon {
    pub num_rings: usize,
    pub num_points: usize,
    pub first_point: Option<Position>,
}

#[derive(Default)]
struct FieldTally {
    type_order: Vec<&'static str>,
    counts: BTreeMap<&'static str, usize>,
    samples: Vec<AttributeValue>,
}

pub fn discover_fields(features: &[RawFeature], discovery_date: DateTime<Utc>) -> FieldDiscoveryReport {
    let mut tallies: BTreeMap<String, FieldTally> = BTreeMap::new();
    for feature in features {
        for (name, value) in &feature.attributes {
            let tally = tallies.entry(name.clone()).or_default();
            let type_name = value.type_name();
            let count = tally.counts.entry(type_name).or_insert(0);
            if *count == 0 {
                tally.type_order.push(type_name);
            }
            *count += 1;
            if !value.is_null() && tally.samples.len() < MAX_SAMPLE_VALUES {
                tally.samples.push(value.clone());
            }
        }
    }

    let fields: BTreeMap<String, FieldProfile> = tallies
        .into_iter()
        .map(|(name, tally)| {
            let mut primary = "unknown";
            let mut best = 0usize;
            for type_name in &tally.type_order {
                let count = tally.counts[type_name];
                if count > best {
                    best = count;
                    primary = *type_name;
                }
            }
            let profile = FieldProfile {
                data_types: tally
                    .counts
                    .iter()
                    .map(|(k, v)| (k.to_string(), *v))
                    .collect(),
                primary_type: primary.to_string(),
                sample_values: tally.samples,
            };
            (name, profile)
        })
        .collect();

    let geometry = profile_geometry(features);

    FieldDiscoveryReport {
        discovery_date,
        summary: DiscoverySummary {
            total_fields: fields.len(),
            records_analyzed: features.len(),
            records_with_geometry: geometry.has_geometry,
            records_without_geometry: geometry.missing_geometry,
        },
        fields,
        geometry,
    }
}

fn profile_geometry(features: &[RawFeature]) -> GeometryProfile {
    let mut profile = GeometryProfile::default();
    for feature in features {
        let rings = match &feature.geometry {
            Some(geometry) if !geometry.rings.is_empty() => &geometry.rings,
            _ => {
                profile.missing_geometry += 1;
                continue;
            }
        };

        profile.has_geometry += 1;
        profile.geometry_type = Some("polygon".to_string());

        if profile.sample_polygons.len() >= MAX_SAMPLE_POLYGONS {
            continue;
        }
        let first_ring = &rings[0];
        if let Some(centroid) = ring_centroid(first_ring) {
            profile.sample_polygons.push(SamplePolygon {
                num_rings: rings.len(),
                num_points: first_ring.len(),
                first_point: first_ring.first().copied(),
            });
            profile.sample_centroids.push(centroid);
        }
    }
    profile
}

/// Console summary of a report.
pub fn render_summary(report: &FieldDiscoveryReport) -> String {
    let rule = "=".repeat(80);
    let mut lines = vec![
        rule.clone(),
        "API FIELD DISCOVERY REPORT".to_string(),
        rule.clone(),
        String::new(),
        format!("Total Fields: {}", report.summary.total_fields),
        format!("Records Analyzed: {}", report.summary.records_analyzed),
        format!("Records with Geometry: {}", report.summary.records_with_geometry),
        String::new(),
        "Field Names:".to_string(),
    ];
    for (name, profile) in &report.fields {
        let sample = profile
            .sample_values
            .first()
            .map(|v| format!(" (e.g., {v})"))
            .unwrap_or_default();
        lines.push(format!("  - {name} [{}]{sample}", profile.primary_type));
    }
    lines.push(String::new());
    lines.push(format!(
        "Geometry Type: {}",
        report.geometry.geometry_type.as_deref().unwrap_or("none")
    ));
    lines.push("Sample Centroids:".to_string());
    for centroid in report.geometry.sample_centroids.iter().take(3) {
        lines.push(format!("  - Lat: {:.6}, Lon: {:.6}", centroid.lat, centroid.lon));
    }
    lines.push(rule);
    lines.join("\n")
}
