//! Error types for template rendering.
//!
//! [`RenderError`] is the only error the renderer hands back to callers. It
//! hides the underlying MiniJinja and Rhai error types behind a message that
//! already contains the full error chain, so callers can print it as one line.

use std::error::Error as _;
use std::path::{Path, PathBuf};

/// Error type for rendering a single template file.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// The template engine or an inline code block failed.
    #[error("Error rendering \"{}\": {message}", path.display())]
    Template {
        /// The input template that failed.
        path: PathBuf,
        /// Flattened error message, including all error sources.
        message: String,
    },

    /// Reading the template or writing the output failed.
    #[error("I/O error on \"{}\": {source}", path.display())]
    Io {
        /// The path being read or written.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl RenderError {
    /// Wraps a MiniJinja error for the given input file.
    pub fn template(path: impl Into<PathBuf>, err: &minijinja::Error) -> Self {
        RenderError::Template {
            path: path.into(),
            message: describe(err),
        }
    }

    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        RenderError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// The file this error refers to.
    pub fn path(&self) -> &Path {
        match self {
            RenderError::Template { path, .. } | RenderError::Io { path, .. } => path,
        }
    }
}

/// Joins an error and its sources into one line.
///
/// MiniJinja keeps inline-code failures as the error source, so the top-level
/// message alone would hide the Rhai diagnostic.
fn describe(err: &minijinja::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}
