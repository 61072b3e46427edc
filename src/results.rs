use crate::benchmark::BenchmarkSpec;
use crate::cli::ReportFormat;
use crate::error::ParseError;
use crate::parsers::{self, CaptureKind, RawCapture};
use crate::records::MetricRecord;
use crate::report::Report;
use crate::versions::SystemInfo;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timestamp suffix of every persisted file.
const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Complete results of one benchmark run
#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkResults {
    pub run_id: String,
    pub spec: BenchmarkSpec,
    /// Image the run booted, resolved or pinned
    pub image_id: String,
    pub format: ReportFormat,
    pub report: Report,
    /// `report` rendered in `format`
    pub rendered: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub duration: Duration,
    /// Kernel and package versions, unless collection was turned off
    pub system_info: Option<SystemInfo>,
}

/// Results manager for persisting raw captures and final reports
///
/// Files land in `<log_dir>/<shape>/<release>/<kind>/`, so runs against
/// different instance types and releases never mix.
pub struct ResultsManager {
    directory: PathBuf,
    kind: String,
    saved: Vec<PathBuf>,
}

impl ResultsManager {
    /// Create a new results manager, creating its directory
    pub fn new(log_dir: &Path, spec: &BenchmarkSpec) -> io::Result<Self> {
        let directory = log_dir
            .join(&spec.shape)
            .join(&spec.release)
            .join(spec.kind.as_str());
        fs::create_dir_all(&directory)?;
        debug!("Results directory: {:?}", directory);

        Ok(Self {
            directory,
            kind: spec.kind.as_str().to_string(),
            saved: Vec::new(),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Files written so far, in write order.
    pub fn saved_files(&self) -> &[PathBuf] {
        &self.saved
    }

    /// Persist one raw capture as `<kind>-<tag>-i<iteration>-<timestamp>.log`
    pub fn save_capture(&mut self, capture: &RawCapture) -> io::Result<PathBuf> {
        let name = format!(
            "{}-{}-i{}-{}.log",
            capture.kind.file_prefix(),
            capture.tag,
            capture.iteration,
            timestamp()
        );
        self.write(&name, &capture.content)
    }

    /// Persist the rendered report as `results-<kind>-<timestamp>.<ext>`
    pub fn save_report(&mut self, rendered: &str, format: ReportFormat) -> io::Result<PathBuf> {
        let name = format!(
            "results-{}-{}.{}",
            self.kind,
            timestamp(),
            format.extension()
        );
        self.write(&name, rendered)
    }

    /// Persist the recorded versions as `info-<kind>-<timestamp>.json`
    pub fn save_system_info(&mut self, info: &SystemInfo) -> io::Result<PathBuf> {
        let content = serde_json::to_string_pretty(info)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let name = format!("info-{}-{}.json", self.kind, timestamp());
        self.write(&name, &content)
    }

    fn write(&mut self, name: &str, content: &str) -> io::Result<PathBuf> {
        let path = self.directory.join(name);
        let mut content = content.to_string();
        if !content.ends_with('\n') {
            content.push('\n');
        }
        fs::write(&path, content)?;
        debug!("Wrote {:?}", path);
        self.saved.push(path.clone());
        Ok(path)
    }
}

fn timestamp() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// A persisted capture found by [`discover`], already parsed.
#[derive(Debug)]
pub struct DiscoveredCapture {
    pub path: PathBuf,
    pub kind: CaptureKind,
    pub iteration: Option<usize>,
    pub record: Result<MetricRecord, ParseError>,
}

impl DiscoveredCapture {
    /// `<directory>,<file>,<value...>` relative to `root`; `None` for captures
    /// that failed to parse.
    pub fn csv_line(&self, root: &Path) -> Option<String> {
        let record = self.record.as_ref().ok()?;
        let relative = self.path.strip_prefix(root).unwrap_or(&self.path);
        let directory = relative
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let file = relative
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut line = format!("{},{}", directory, file);
        for (value, spec) in record.values().into_iter().zip(record.kind().fields()) {
            line.push_str(&format!(",{:.*}", spec.decimals, value));
        }
        Some(line)
    }
}

/// Iteration number embedded in a capture file name (`...-i3-...`).
fn capture_iteration(name: &str) -> Option<usize> {
    name.split('-')
        .skip(2)
        .find_map(|part| part.strip_prefix('i')?.parse().ok())
}

/// Walk `root` and re-parse every persisted capture below it
///
/// Files whose names do not identify a capture kind (reports, version
/// records, notes) are skipped, and so are captures that are not valid
/// UTF-8. A capture that no longer parses is returned with its error rather
/// than aborting the walk. Results are sorted by path.
pub fn discover(root: &Path) -> io::Result<Vec<DiscoveredCapture>> {
    let mut files = Vec::new();
    collect_files(root, &mut files)?;
    files.sort();

    let mut found = Vec::new();
    for path in files {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        let Some(kind) = CaptureKind::from_file_name(&name) else {
            debug!("Skipping {:?}", path);
            continue;
        };

        let content = match String::from_utf8(fs::read(&path)?) {
            Ok(content) => content,
            Err(_) => {
                warn!("Skipping {}: not valid UTF-8", path.display());
                continue;
            }
        };
        let record = parsers::parse_content(kind, &content);
        if let Err(err) = &record {
            warn!("Could not parse {}: {}", path.display(), err);
        }
        found.push(DiscoveredCapture {
            iteration: capture_iteration(&name),
            path,
            kind,
            record,
        });
    }

    info!("Discovered {} captures under {}", found.len(), root.display());
    Ok(found)
}

fn collect_files(directory: &Path, files: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, files)?;
        } else if path.is_file() {
            files.push(path);
        }
    }
    Ok(())
}
