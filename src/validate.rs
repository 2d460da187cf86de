//! Structural validation of submissions: the GeoJSON document and the
//! requested output file name.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::artifact::MAX_OUTPUT_FILENAME_BYTES;
const PDF_EXTENSION: &str = ".pdf";

/// One problem found in a submission, located by a JSON path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

/// A rejected submission. Carries every issue found, not just the first.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid submission: {}", describe(.issues))]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationError {
    pub fn single(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            issues: vec![ValidationIssue {
                path: path.into(),
                message: message.into(),
            }],
        }
    }
}

fn describe(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|issue| format!("{}: {}", issue.path, issue.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// A submission that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub geojson: Value,
    /// Normalized file name, `None` when the caller did not ask for one.
    pub output_filename: Option<String>,
}

/// Validates a submission body of the form
/// `{ "geojson": <GeoJSON>, "outputFilename"?: string }`.
pub fn parse_submission(body: Value) -> Result<Submission, ValidationError> {
    let mut issues = Issues::default();

    let Value::Object(mut fields) = body else {
        return Err(ValidationError::single("$", "expected a JSON object"));
    };

    let output_filename = match fields.remove("outputFilename") {
        None | Some(Value::Null) => None,
        Some(Value::String(name)) => normalize_filename(&name, &mut issues),
        Some(_) => {
            issues.push("$.outputFilename", "expected a string");
            None
        }
    };

    let geojson = match fields.remove("geojson") {
        None | Some(Value::Null) => {
            issues.push("$.geojson", "missing GeoJSON document");
            Value::Null
        }
        Some(doc) => {
            check_document(&doc, "$.geojson", &mut issues);
            doc
        }
    };

    issues.into_result(Submission {
        geojson,
        output_filename,
    })
}

#[derive(Default)]
struct Issues(Vec<ValidationIssue>);

impl Issues {
    fn push(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.0.push(ValidationIssue {
            path: path.into(),
            message: message.into(),
        });
    }

    fn into_result<T>(self, value: T) -> Result<T, ValidationError> {
        if self.0.is_empty() {
            Ok(value)
        } else {
            Err(ValidationError { issues: self.0 })
        }
    }
}

fn normalize_filename(name: &str, issues: &mut Issues) -> Option<String> {
    const PATH: &str = "$.outputFilename";

    let name = name.trim();
    if name.is_empty() {
        issues.push(PATH, "must not be empty");
        return None;
    }
    if name == "." || name == ".." {
        issues.push(PATH, "must name a file");
        return None;
    }
    if name.contains(['/', '\\']) {
        issues.push(PATH, "must not contain path separators");
        return None;
    }
    if name.chars().any(char::is_control) {
        issues.push(PATH, "must not contain control characters");
        return None;
    }

    let normalized = if name.to_ascii_lowercase().ends_with(PDF_EXTENSION) {
        name.to_string()
    } else {
        format!("{name}{PDF_EXTENSION}")
    };
    if normalized.len() > MAX_OUTPUT_FILENAME_BYTES {
        issues.push(
            PATH,
            format!("must be at most {MAX_OUTPUT_FILENAME_BYTES} bytes including extension"),
        );
        return None;
    }
    Some(normalized)
}

fn type_of<'a>(value: &'a Value, path: &str, issues: &mut Issues) -> Option<&'a str> {
    let Some(object) = value.as_object() else {
        issues.push(path, "expected a GeoJSON object");
        return None;
    };
    match object.get("type") {
        Some(Value::String(kind)) => Some(kind.as_str()),
        Some(_) => {
            issues.push(format!("{path}.type"), "expected a string");
            None
        }
        None => {
            issues.push(format!("{path}.type"), "missing");
            None
        }
    }
}

fn check_document(doc: &Value, path: &str, issues: &mut Issues) {
    let Some(kind) = type_of(doc, path, issues) else {
        return;
    };
    match kind {
        "FeatureCollection" => match doc.get("features") {
            Some(Value::Array(features)) if features.is_empty() => {
                issues.push(format!("{path}.features"), "contains no features");
            }
            Some(Value::Array(features)) => {
                for (i, feature) in features.iter().enumerate() {
                    check_feature(feature, &format!("{path}.features[{i}]"), issues);
                }
            }
            _ => issues.push(format!("{path}.features"), "expected an array"),
        },
        "Feature" => check_feature(doc, path, issues),
        _ => check_geometry(doc, path, issues),
    }
}

fn check_feature(feature: &Value, path: &str, issues: &mut Issues) {
    let Some(kind) = type_of(feature, path, issues) else {
        return;
    };
    if kind != "Feature" {
        issues.push(format!("{path}.type"), format!("expected Feature, found {kind}"));
        return;
    }
    match feature.get("geometry") {
        // Unlocated features are legal GeoJSON.
        Some(Value::Null) => {}
        Some(geometry) => check_geometry(geometry, &format!("{path}.geometry"), issues),
        None => issues.push(format!("{path}.geometry"), "missing"),
    }
    match feature.get("properties") {
        None | Some(Value::Null) | Some(Value::Object(_)) => {}
        Some(_) => issues.push(format!("{path}.properties"), "expected an object or null"),
    }
}

fn check_geometry(geometry: &Value, path: &str, issues: &mut Issues) {
    let Some(kind) = type_of(geometry, path, issues) else {
        return;
    };

    if kind == "GeometryCollection" {
        match geometry.get("geometries") {
            Some(Value::Array(members)) => {
                for (i, member) in members.iter().enumerate() {
                    check_geometry(member, &format!("{path}.geometries[{i}]"), issues);
                }
            }
            _ => issues.push(format!("{path}.geometries"), "expected an array"),
        }
        return;
    }

    let coords_path = format!("{path}.coordinates");
    let Some(coords) = geometry.get("coordinates") else {
        issues.push(coords_path, "missing");
        return;
    };

    match kind {
        "Point" => check_position(coords, &coords_path, issues),
        "MultiPoint" => each(coords, &coords_path, issues, check_position),
        "LineString" => check_line(coords, &coords_path, issues),
        "MultiLineString" => each(coords, &coords_path, issues, check_line),
        "Polygon" => check_polygon(coords, &coords_path, issues),
        "MultiPolygon" => each(coords, &coords_path, issues, check_polygon),
        other => issues.push(
            format!("{path}.type"),
            format!("unknown GeoJSON type {other:?}"),
        ),
    }
}

fn each(
    value: &Value,
    path: &str,
    issues: &mut Issues,
    check: fn(&Value, &str, &mut Issues),
) {
    match value.as_array() {
        Some(items) => {
            for (i, item) in items.iter().enumerate() {
                check(item, &format!("{path}[{i}]"), issues);
            }
        }
        None => issues.push(path, "expected an array"),
    }
}

fn check_position(value: &Value, path: &str, issues: &mut Issues) {
    let Some(ordinates) = value.as_array() else {
        issues.push(path, "expected a position array");
        return;
    };
    if !(2..=3).contains(&ordinates.len()) {
        issues.push(path, "a position needs 2 or 3 numbers");
        return;
    }
    if !ordinates.iter().all(Value::is_number) {
        issues.push(path, "position ordinates must be numbers");
    }
}

fn check_line(value: &Value, path: &str, issues: &mut Issues) {
    match value.as_array() {
        Some(points) if points.len() < 2 => {
            issues.push(path, "a line needs at least 2 positions");
        }
        Some(_) => each(value, path, issues, check_position),
        None => issues.push(path, "expected an array of positions"),
    }
}

fn check_ring(value: &Value, path: &str, issues: &mut Issues) {
    let Some(points) = value.as_array() else {
        issues.push(path, "expected an array of positions");
        return;
    };
    if points.len() < 4 {
        issues.push(path, "a linear ring needs at least 4 positions");
        return;
    }
    let before = issues.0.len();
    each(value, path, issues, check_position);
    if issues.0.len() == before && !same_position(&points[0], &points[points.len() - 1]) {
        issues.push(path, "linear ring is not closed");
    }
}

/// Numeric comparison, so `0` and `0.0` name the same ordinate.
fn same_position(a: &Value, b: &Value) -> bool {
    match (a.as_array(), b.as_array()) {
        (Some(a), Some(b)) => {
            a.len() == b.len()
                && a.iter().zip(b).all(|(x, y)| match (x.as_f64(), y.as_f64()) {
                    (Some(x), Some(y)) => x == y,
                    _ => false,
                })
        }
        _ => false,
    }
}

fn check_polygon(value: &Value, path: &str, issues: &mut Issues) {
    match value.as_array() {
        Some(rings) if rings.is_empty() => issues.push(path, "a polygon needs an outer ring"),
        Some(_) => each(value, path, issues, check_ring),
        None => issues.push(path, "expected an array of rings"),
    }
}
