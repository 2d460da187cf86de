//! GeoJSON to PDF conversion via GDAL's `ogr2ogr`.
//!
//! The rest of the pipeline only sees the [`Converter`] trait. Failures
//! are classified here, at the boundary, into [`ConversionError`] so no
//! raw tool output travels further than a message string.

use parking_lot::Mutex;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::job::FailureKind;

/// GDAL driver name for vector PDF output.
pub const PDF_DRIVER: &str = "PDF";

/// Everything the converter needs for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    /// Output driver name, e.g. `PDF`.
    pub driver: String,
    /// Dataset creation options as `KEY=VALUE`.
    pub options: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("{required} is unavailable in this deployment (available: {})", summarize(.available))]
    CapabilityUnavailable {
        required: String,
        available: Vec<String>,
    },

    #[error("input rejected: {0}")]
    InvalidInput(String),

    #[error("converter I/O failure: {0}")]
    Io(#[from] io::Error),

    /// The attempt's cancellation token fired before the tool finished.
    #[error("conversion cancelled")]
    Cancelled,

    #[error("converter failed: {0}")]
    Internal(String),
}

impl ConversionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ConversionError::CapabilityUnavailable { .. } => FailureKind::CapabilityUnavailable,
            ConversionError::InvalidInput(_) => FailureKind::ConversionFailed,
            ConversionError::Io(_) => FailureKind::TransientIo,
            // Only the attempt deadline cancels a conversion.
            ConversionError::Cancelled => FailureKind::Timeout,
            ConversionError::Internal(_) => FailureKind::InternalError,
        }
    }
}

fn summarize(available: &[String]) -> String {
    const SHOWN: usize = 20;
    if available.is_empty() {
        return "none".to_string();
    }
    let mut listed = available.iter().take(SHOWN).cloned().collect::<Vec<_>>().join(", ");
    if available.len() > SHOWN {
        listed.push_str(&format!(", ... {} more", available.len() - SHOWN));
    }
    listed
}

/// Blocking conversion of one input file into one output file.
///
/// Implementations must return promptly once `cancel` fires. They are not
/// required to clean up after themselves; the caller owns the directory.
#[cfg_attr(test, mockall::automock)]
pub trait Converter: Send + Sync {
    fn convert(
        &self,
        request: &ConversionRequest,
        cancel: &CancellationToken,
    ) -> Result<(), ConversionError>;
}

/// One driver line from `ogr2ogr --formats`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfo {
    pub name: String,
    pub writable: bool,
}

/// Runs `ogr2ogr` as a child process.
pub struct Ogr2OgrConverter {
    program: PathBuf,
    poll_interval: Duration,
    drivers: Mutex<Option<Vec<DriverInfo>>>,
}

impl Ogr2OgrConverter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            poll_interval: Duration::from_millis(50),
            drivers: Mutex::new(None),
        }
    }

    /// Lists the drivers the installed GDAL offers. Cached after the first
    /// successful probe.
    pub fn probe(&self) -> Result<Vec<DriverInfo>, ConversionError> {
        if let Some(drivers) = self.drivers.lock().as_ref() {
            return Ok(drivers.clone());
        }

        let output = Command::new(&self.program)
            .arg("--formats")
            .stdin(Stdio::null())
            .output()
            .map_err(|e| self.spawn_error(e))?;
        if !output.status.success() {
            return Err(ConversionError::Internal(format!(
                "{} --formats exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let drivers = parse_formats(&String::from_utf8_lossy(&output.stdout));
        info!(count = drivers.len(), "probed GDAL vector drivers");
        *self.drivers.lock() = Some(drivers.clone());
        Ok(drivers)
    }

    /// Fails with `CapabilityUnavailable` unless `driver` can write output.
    pub fn require_driver(&self, driver: &str) -> Result<(), ConversionError> {
        let drivers = self.probe()?;
        let found = drivers
            .iter()
            .any(|d| d.writable && d.name.eq_ignore_ascii_case(driver));
        if found {
            Ok(())
        } else {
            Err(ConversionError::CapabilityUnavailable {
                required: format!("GDAL {driver} driver with write support"),
                available: drivers.into_iter().map(|d| d.name).collect(),
            })
        }
    }

    fn spawn_error(&self, e: io::Error) -> ConversionError {
        if e.kind() == io::ErrorKind::NotFound {
            ConversionError::CapabilityUnavailable {
                required: format!("{} executable", self.program.display()),
                available: Vec::new(),
            }
        } else {
            ConversionError::Io(e)
        }
    }

    fn wait(&self, child: &mut Child, cancel: &CancellationToken) -> Result<ExitStatus, ConversionError> {
        loop {
            if cancel.is_cancelled() {
                // Hard kill; the workspace owner reclaims whatever was written.
                let _ = child.kill();
                let _ = child.wait();
                return Err(ConversionError::Cancelled);
            }
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}

impl Converter for Ogr2OgrConverter {
    fn convert(
        &self,
        request: &ConversionRequest,
        cancel: &CancellationToken,
    ) -> Result<(), ConversionError> {
        self.require_driver(&request.driver)?;

        let mut command = Command::new(&self.program);
        command
            .arg("-f")
            .arg(&request.driver)
            .arg(&request.output_path)
            .arg(&request.input_path);
        for option in &request.options {
            command.arg("-dsco").arg(option);
        }
        debug!(?command, "running ogr2ogr");

        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        // Drain stderr on its own thread so a chatty child cannot block on
        // a full pipe while we poll for exit.
        let stderr_reader = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut text = String::new();
                let _ = pipe.read_to_string(&mut text);
                text
            })
        });

        let status = self.wait(&mut child, cancel);
        let stderr = stderr_reader
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();
        let status = status?;

        if !status.success() {
            return Err(classify_failure(status, &stderr));
        }
        if !request.output_path.exists() {
            return Err(ConversionError::Internal(
                "ogr2ogr reported success but wrote no output".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parses `ogr2ogr --formats` output into driver entries.
///
/// Lines look like `  PDF -raster,vector- (rw+vs): Geospatial PDF`.
pub fn parse_formats(output: &str) -> Vec<DriverInfo> {
    output
        .lines()
        .filter_map(|line| {
            let (name, rest) = line.trim().split_once(" -")?;
            let mode = rest.split_once('(')?.1.split_once(')')?.0;
            Some(DriverInfo {
                name: name.trim().to_string(),
                writable: mode.contains('w'),
            })
        })
        .collect()
}

const INPUT_REJECTIONS: &[&str] = &[
    "unable to open datasource",
    "not recognized as a supported file format",
    "not recognized as being in a supported file format",
    "failed to read geojson",
    "json parsing error",
    "invalid geometry",
];

/// Maps a failed `ogr2ogr` exit to a failure kind using its stderr.
pub fn classify_failure(status: ExitStatus, stderr: &str) -> ConversionError {
    let lowered = stderr.to_ascii_lowercase();
    let message = format!("ogr2ogr exited with {status}: {}", stderr.trim());
    if INPUT_REJECTIONS.iter().any(|needle| lowered.contains(needle)) {
        ConversionError::InvalidInput(message)
    } else {
        ConversionError::Internal(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const FORMATS: &str = "Supported Formats:\n  \
        PCIDSK -raster,vector- (rw+v): PCIDSK Database File\n  \
        PDF -raster,vector- (rw+vs): Geospatial PDF\n  \
        ESRI Shapefile -vector- (rw+v): ESRI Shapefile\n  \
        GeoJSON -vector- (rw+v): GeoJSON\n  \
        SVG -vector- (ro): Scalable Vector Graphics\n";

    #[test]
    fn test_parse_formats() {
        let drivers = parse_formats(FORMATS);
        let names: Vec<_> = drivers.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["PCIDSK", "PDF", "ESRI Shapefile", "GeoJSON", "SVG"]);
        assert!(drivers[1].writable);
        assert!(!drivers[4].writable);
    }

    #[test]
    fn test_parse_formats_skips_header_and_blank_lines() {
        assert!(parse_formats("Supported Formats:\n\n").is_empty());
    }

    #[cfg(unix)]
    fn exit(code: i32) -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        ExitStatus::from_raw(code << 8)
    }

    #[cfg(unix)]
    #[test]
    fn test_classify_unreadable_input() {
        let err = classify_failure(
            exit(1),
            "ERROR 4: Unable to open datasource `/tmp/x/input.geojson' with the following drivers.",
        );
        assert_eq!(err.kind(), FailureKind::ConversionFailed);
    }

    #[cfg(unix)]
    #[test]
    fn test_classify_other_failures_as_internal() {
        let err = classify_failure(exit(1), "ERROR 1: PDF driver: out of memory");
        assert_eq!(err.kind(), FailureKind::InternalError);
        assert!(err.to_string().contains("out of memory"));
    }

    #[test]
    fn test_missing_binary_is_capability_unavailable() {
        let converter = Ogr2OgrConverter::new("/nonexistent/bin/ogr2ogr");
        let err = converter.require_driver(PDF_DRIVER).unwrap_err();
        assert_eq!(err.kind(), FailureKind::CapabilityUnavailable);
        assert!(err.to_string().contains("/nonexistent/bin/ogr2ogr executable"));
    }

    #[test]
    fn test_capability_message_lists_available_drivers() {
        let err = ConversionError::CapabilityUnavailable {
            required: "GDAL PDF driver with write support".to_string(),
            available: vec!["GeoJSON".to_string(), "GPKG".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "GDAL PDF driver with write support is unavailable in this deployment (available: GeoJSON, GPKG)"
        );
    }

    #[test]
    fn test_summarize_truncates_long_lists() {
        let available: Vec<String> = (0..25).map(|i| format!("D{i}")).collect();
        assert!(summarize(&available).ends_with("... 5 more"));
    }

    #[test]
    fn test_cancelled_maps_to_timeout() {
        assert_eq!(ConversionError::Cancelled.kind(), FailureKind::Timeout);
    }
}
