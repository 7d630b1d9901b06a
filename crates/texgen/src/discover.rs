//! Input discovery.
//!
//! Turns the paths given on the command line into an ordered list of
//! [`RenderJob`]s. Files must be named `*.t.tex`; directories are searched
//! recursively for such files. Every path is checked before anything is
//! rendered, so a typo in the last argument fails the run up front.

use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::CliError;

/// Suffix that marks a template.
pub const TEMPLATE_SUFFIX: &str = ".t.tex";

/// Suffix of the generated document.
pub const GENERATED_SUFFIX: &str = ".g.tex";

/// One template and the file it renders to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderJob {
    pub input: PathBuf,
    pub output: PathBuf,
}

impl RenderJob {
    pub fn new(input: impl Into<PathBuf>) -> Self {
        let input = input.into();
        let output = output_path(&input);
        Self { input, output }
    }
}

/// Expands `paths` into render jobs, in argument order.
///
/// Files inside a directory are visited depth-first, sorted by file name.
pub fn discover<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<RenderJob>, CliError> {
    let mut jobs = Vec::new();
    for path in paths {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CliError::NotFound(path.to_path_buf()));
        }
        if path.is_dir() {
            let found = templates_in(path)?;
            debug!(dir = %path.display(), count = found.len(), "expanded directory");
            jobs.extend(found);
        } else if is_template(path) {
            jobs.push(RenderJob::new(path));
        } else {
            return Err(CliError::InvalidName(path.to_path_buf()));
        }
    }
    Ok(jobs)
}

fn templates_in(dir: &Path) -> Result<Vec<RenderJob>, CliError> {
    let mut jobs = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|err| CliError::Io {
            path: err.path().unwrap_or(dir).to_path_buf(),
            source: err.into(),
        })?;
        if entry.file_type().is_file() && is_template(entry.path()) {
            jobs.push(RenderJob::new(entry.path()));
        }
    }
    Ok(jobs)
}

/// Whether the file name ends with [`TEMPLATE_SUFFIX`].
pub fn is_template(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(TEMPLATE_SUFFIX))
}

/// `report.t.tex` -> `report.g.tex`, in the same directory.
///
/// Only the trailing suffix is replaced; paths without it are returned
/// unchanged.
pub fn output_path(input: &Path) -> PathBuf {
    match input
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_suffix(TEMPLATE_SUFFIX))
    {
        Some(stem) => input.with_file_name(format!("{}{}", stem, GENERATED_SUFFIX)),
        None => input.to_path_buf(),
    }
}
