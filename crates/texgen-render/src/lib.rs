//! # texgen-render - LaTeX fragments from templates
//!
//! `texgen-render` renders `.t.tex` templates into LaTeX documents. Templates
//! use MiniJinja with PHP-style delimiters, so they do not collide with TeX
//! braces:
//!
//! | Syntax | Meaning |
//! |--------|---------|
//! | `<? ... ?>` | statement (`for`, `if`, `set`, `include`, ...) |
//! | `<?= ... ?>` | expression output |
//! | `<?# ... ?>` | comment |
//! | `<? rhai ?> ... <? endrhai ?>` | inline Rhai code |
//!
//! ## Core Concepts
//!
//! - [`Renderer`]: renders one file at a time and prepends [`GENERATED_HEADER`]
//! - [`FilterRegistry`]: the shared filter table (`fmt`, `bold`, `red`, ...),
//!   extended at render time by inline code
//! - [`BuiltinsConfig`]: which host helpers (`abs`, `sorted`, `zip`, ...)
//!   become template globals
//! - [`RenderError`]: what went wrong, already formatted as one line
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//! use texgen_render::{FilterRegistry, RenderOptions, Renderer};
//!
//! let renderer = Renderer::new(FilterRegistry::with_defaults(), RenderOptions::default());
//! renderer
//!     .render_file(Path::new("table.t.tex"), Path::new("table.g.tex"))
//!     .unwrap();
//! ```
//!
//! ## Inline code
//!
//! Variables created in a block are visible to the template afterwards, and
//! script functions can be registered as filters:
//!
//! ```text
//! <? rhai ?>
//! let rows = [1.0, 2.5, 4.0];
//! fn pct(x) { `${x * 100.0}\%` }
//! filter(Fn("pct"));
//! <? endrhai ?>
//! <? for r in rows ?>
//! <?= r | fmt(1) ?> & <?= r / 10 | pct ?> \\
//! <? endfor ?>
//! ```

pub mod builtins;
mod convert;
pub mod error;
pub mod filters;
pub mod inline;
pub mod renderer;

pub use builtins::BuiltinsConfig;
pub use error::RenderError;
pub use filters::FilterRegistry;
pub use renderer::{RenderOptions, Renderer, GENERATED_HEADER};
