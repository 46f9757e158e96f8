use crate::config::same_path;
use crate::session::{Classification, SessionOrchestrator};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Separates the classification label from the original file name.
pub const ARTIFACT_SEPARATOR: &str = "-";

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Corpus I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Input and output directories can't be the same: {0:?}")]
    SameDirectories(PathBuf),
    #[error("Failed to write triage report {path:?}: {reason}")]
    Report { path: PathBuf, reason: String },
}

impl RunnerError {
    fn io(path: &Path, source: io::Error) -> Self {
        RunnerError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One line of the optional JSON report.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ReportEntry {
    pub input: PathBuf,
    pub md5: String,
    pub classification: String,
    pub artifact: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub normal: usize,
    pub timeout: usize,
    pub crash: usize,
    pub unknown: usize,
    pub protocol_error: usize,
    /// Inputs per crash hash.
    pub buckets: BTreeMap<String, usize>,
    pub interrupted: bool,
}

impl RunSummary {
    fn record(&mut self, classification: &Classification) {
        self.processed += 1;
        match classification {
            Classification::Normal => self.normal += 1,
            Classification::Timeout => self.timeout += 1,
            Classification::Unknown => self.unknown += 1,
            Classification::ProtocolError => self.protocol_error += 1,
            Classification::Crash(hash) => {
                self.crash += 1;
                *self.buckets.entry(hash.clone()).or_default() += 1;
            }
        }
    }
}

/// Replays every file of a corpus, one session at a time.
pub struct CorpusRunner {
    orchestrator: SessionOrchestrator,
    report_path: Option<PathBuf>,
}

impl CorpusRunner {
    pub fn new(orchestrator: SessionOrchestrator) -> Self {
        Self {
            orchestrator,
            report_path: None,
        }
    }

    pub fn with_report(mut self, path: Option<PathBuf>) -> Self {
        self.report_path = path;
        self
    }

    /// Copies each input to `cur_input_path`, replays it, and files a copy in
    /// `output_dir` as `<classification>-<file name>`.
    ///
    /// Per-input failures never stop the pass; only an unreadable corpus, a
    /// clash between input and output directories, or an operator interrupt
    /// end it early.
    pub fn run(
        &mut self,
        input_dir: &Path,
        cur_input_path: &Path,
        output_dir: &Path,
    ) -> Result<RunSummary, RunnerError> {
        if same_path(input_dir, output_dir) {
            return Err(RunnerError::SameDirectories(input_dir.to_path_buf()));
        }
        let inputs = collect_inputs(input_dir)?;
        info!(
            "[eventloop] {} inputs found under {:?}",
            inputs.len(),
            input_dir
        );
        if let Some(parent) = cur_input_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| RunnerError::io(parent, e))?;
        }

        let mut summary = RunSummary::default();
        let mut report = Vec::with_capacity(inputs.len());
        let mut filed = BTreeSet::new();
        for input in &inputs {
            if self.orchestrator.is_cancelled() {
                summary.interrupted = true;
                break;
            }
            info!("[eventloop] reproducing crash {input:?}");
            let Some(classification) = self.replay(input, cur_input_path) else {
                summary.interrupted = true;
                break;
            };
            match &classification {
                Classification::Normal => info!("[eventloop] {input:?} did not crash"),
                Classification::Timeout => info!("[eventloop] {input:?} timed out"),
                other => info!("[eventloop] {input:?} crash hash: {other}"),
            }

            let artifact = match file_result(input, output_dir, &classification, &mut filed) {
                Ok(path) => Some(path),
                Err(e) => {
                    error!("[eventloop] {e}");
                    None
                }
            };
            summary.record(&classification);
            report.push(ReportEntry {
                input: input.clone(),
                md5: input_digest(input),
                classification: classification.label().to_string(),
                artifact,
            });
        }

        if summary.interrupted {
            warn!("[eventloop] stopped by operator");
        }
        self.orchestrator.shutdown();
        if let Some(path) = &self.report_path {
            write_report(path, &report)?;
        }
        log_summary(&summary);
        Ok(summary)
    }

    /// `None` only when the operator interrupted the session.
    fn replay(&mut self, input: &Path, cur_input_path: &Path) -> Option<Classification> {
        if let Err(e) = fs::copy(input, cur_input_path) {
            error!("[eventloop] failed to stage {input:?} at {cur_input_path:?}: {e}");
            return Some(Classification::Unknown);
        }
        match self.orchestrator.run_session(input) {
            Ok(outcome) => {
                debug!(
                    "[eventloop] session finished as {:?} in {:?}",
                    outcome.status, outcome.elapsed
                );
                Some(outcome.classification)
            }
            Err(interrupted) => {
                warn!("[eventloop] {interrupted} while replaying {input:?}");
                None
            }
        }
    }
}

/// Every regular file below `dir`, children sorted by name, symlinks skipped.
pub fn collect_inputs(dir: &Path) -> Result<Vec<PathBuf>, RunnerError> {
    let mut inputs = Vec::new();
    walk(dir, &mut inputs)?;
    Ok(inputs)
}

fn walk(dir: &Path, inputs: &mut Vec<PathBuf>) -> Result<(), RunnerError> {
    let mut entries = fs::read_dir(dir)
        .map_err(|e| RunnerError::io(dir, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RunnerError::io(dir, e))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| RunnerError::io(&path, e))?;
        if file_type.is_dir() {
            walk(&path, inputs)?;
        } else if file_type.is_file() {
            inputs.push(path);
        } else {
            debug!("[eventloop] skipping non-regular entry {path:?}");
        }
    }
    Ok(())
}

/// Copies `input` to `<output_dir>/<label>-<file name>`.
///
/// `filed` holds the artifacts written earlier in the same pass. Inputs from
/// different directories that share a name and label get
/// `<label>-<n>-<file name>` instead of overwriting each other.
pub fn file_result(
    input: &Path,
    output_dir: &Path,
    classification: &Classification,
    filed: &mut BTreeSet<PathBuf>,
) -> Result<PathBuf, RunnerError> {
    fs::create_dir_all(output_dir).map_err(|e| RunnerError::io(output_dir, e))?;
    let file_name = input.file_name().ok_or_else(|| {
        RunnerError::io(
            input,
            io::Error::new(io::ErrorKind::InvalidInput, "input has no file name"),
        )
    })?;
    let file_name = file_name.to_string_lossy();
    let label = classification.label();
    let mut destination = output_dir.join(artifact_name(label, None, &file_name));
    let mut duplicate = 0;
    while filed.contains(&destination) {
        duplicate += 1;
        destination = output_dir.join(artifact_name(label, Some(duplicate), &file_name));
    }
    if duplicate > 0 {
        warn!("[eventloop] {input:?} shares its artifact name, filed as {destination:?}");
    }
    fs::copy(input, &destination).map_err(|e| RunnerError::io(&destination, e))?;
    filed.insert(destination.clone());
    Ok(destination)
}

fn artifact_name(label: &str, duplicate: Option<usize>, file_name: &str) -> String {
    let mut name = label.to_string();
    name.push_str(ARTIFACT_SEPARATOR);
    if let Some(n) = duplicate {
        name.push_str(&n.to_string());
        name.push_str(ARTIFACT_SEPARATOR);
    }
    name.push_str(file_name);
    name
}

fn input_digest(input: &Path) -> String {
    match fs::read(input) {
        Ok(bytes) => format!("{:x}", md5::compute(bytes)),
        Err(e) => {
            warn!("[eventloop] could not digest {input:?}: {e}");
            String::new()
        }
    }
}

/// Writes the report next to its destination and renames it into place.
fn write_report(path: &Path, entries: &[ReportEntry]) -> Result<(), RunnerError> {
    let fail = |reason: String| RunnerError::Report {
        path: path.to_path_buf(),
        reason,
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|e| fail(e.to_string()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| fail(e.to_string()))?;
    serde_json::to_writer_pretty(&mut tmp, entries).map_err(|e| fail(e.to_string()))?;
    tmp.write_all(b"\n").map_err(|e| fail(e.to_string()))?;
    tmp.persist(path).map_err(|e| fail(e.to_string()))?;
    info!("[eventloop] report written to {path:?}");
    Ok(())
}

fn log_summary(summary: &RunSummary) {
    info!(
        "[eventloop] processed {} inputs: {} normal, {} timeout, {} crash in {} buckets, {} unknown, {} protocol errors",
        summary.processed,
        summary.normal,
        summary.timeout,
        summary.crash,
        summary.buckets.len(),
        summary.unknown,
        summary.protocol_error
    );
    for (hash, count) in &summary.buckets {
        info!("[eventloop]   {hash}: {count}");
    }
}
