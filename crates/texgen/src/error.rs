//! Command-line errors.

use std::path::PathBuf;

use texgen_render::RenderError;

/// Everything that ends a `texgen` run.
///
/// Each variant maps to the `KIND` label printed in front of the message;
/// every kind exits with status 1.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Input file \"{}\" does not end with \".t.tex\".", .0.display())]
    InvalidName(PathBuf),

    #[error("Could not read \"{}\": {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Render(#[from] RenderError),
}

impl CliError {
    /// The label printed before the message.
    pub fn kind(&self) -> &'static str {
        match self {
            CliError::NotFound(_) => "NotFoundError",
            CliError::InvalidName(_) => "InvalidNameError",
            CliError::Io { .. } => "IoError",
            CliError::Render(_) => "RenderError",
        }
    }

    pub fn exit_code(&self) -> u8 {
        1
    }
}
