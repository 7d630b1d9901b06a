//! Argument parsing and the render loop.

use std::io::Write;
use std::path::PathBuf;

use clap::{ArgAction, Parser};
use console::style;
use texgen_render::{BuiltinsConfig, FilterRegistry, RenderOptions, Renderer};
use tracing::info;

use crate::discover::{discover, RenderJob};
use crate::error::CliError;

/// Render *.t.tex templates into generated LaTeX files.
///
/// Each INPUT is a template file ending with ".t.tex" or a directory that is
/// searched recursively for such files. "report.t.tex" renders to
/// "report.g.tex" in the same directory.
#[derive(Debug, Parser)]
#[command(name = "texgen", version, about, long_about)]
pub struct Cli {
    /// Input files or directories to render
    #[arg(required = true, value_name = "INPUT")]
    pub inputs: Vec<PathBuf>,

    /// Do not print a line per rendered file
    #[arg(short, long)]
    pub quiet: bool,

    /// Insert `print` output of inline code into the rendered document
    #[arg(long)]
    pub stdout: bool,

    /// Do not inject host helper functions (abs, sorted, zip, ...)
    #[arg(long = "no-builtins", action = ArgAction::SetFalse)]
    pub builtins: bool,

    /// Do not inject this helper function (repeatable)
    #[arg(long = "exclude-builtin", value_name = "NAME")]
    pub exclude_builtin: Vec<String>,

    /// Increase log output (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Render settings selected by the flags.
    pub fn render_options(&self) -> RenderOptions {
        let mut builtins = if self.builtins {
            BuiltinsConfig::default()
        } else {
            BuiltinsConfig::disabled()
        };
        builtins.exclude.extend(self.exclude_builtin.iter().cloned());
        RenderOptions {
            capture_stdout: self.stdout,
            builtins,
        }
    }
}

/// Renders every input in order and reports each file on `out`.
///
/// All inputs are validated first. One filter registry is shared by the
/// whole run, so filters registered by inline code in one file stay
/// available to the files after it. The first failure stops the run.
pub fn run<W: Write>(cli: &Cli, out: &mut W) -> Result<Vec<RenderJob>, CliError> {
    let jobs = discover(&cli.inputs)?;
    info!(count = jobs.len(), "discovered templates");

    let renderer = Renderer::new(FilterRegistry::with_defaults(), cli.render_options());
    for job in &jobs {
        renderer.render_file(&job.input, &job.output)?;
        if !cli.quiet {
            writeln!(
                out,
                "{} {} {} {}",
                style("RENDER").bold().green(),
                job.input.display(),
                style("➔").blue(),
                job.output.display()
            )
            .map_err(|source| CliError::Io {
                path: PathBuf::from("<stdout>"),
                source,
            })?;
        }
    }
    Ok(jobs)
}
