//! The filter table.
//!
//! Filters live in a [`FilterRegistry`], a cheaply cloneable handle to one
//! shared map. Templates never see the map directly: [`FilterRegistry::install`]
//! registers a small proxy per name on the MiniJinja environment, and the proxy
//! resolves the real filter at call time. That indirection is what lets inline
//! code register filters while a template is already rendering.
//!
//! ## Built-in filters
//!
//! | Filter | Output |
//! |--------|--------|
//! | `fmt(prec=3, nan="--")` | fixed-decimal number, `nan` for missing values |
//! | `bold`, `italic`, `underline`, `emph`, `cancel` | `\textbf{x}` and friends |
//! | `color(name)` and `red`, `blue`, ... | `{\textcolor{name}{x}}` |
//! | `vcenter`, `hcenter` | column centering |
//! | `fontsize(size)` and `tiny` ... `Huge` | `\size{x}` |
//!
//! ```rust
//! use texgen_render::FilterRegistry;
//! use minijinja::Environment;
//!
//! let registry = FilterRegistry::with_defaults();
//! let mut env = Environment::new();
//! registry.install(&mut env, []);
//! let out = env.render_str("{{ 3.14159 | fmt(prec=2) }}", ()).unwrap();
//! assert_eq!(out, "3.14");
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};

use minijinja::value::{Kwargs, Rest};
use minijinja::{Environment, Error, ErrorKind, State, Value};

/// Digits after the decimal point when `fmt` gets no precision.
pub const DEFAULT_PRECISION: usize = 3;

/// What `fmt` prints for missing or non-numeric values.
pub const MISSING_PLACEHOLDER: &str = "--";

/// Colors with a pre-bound filter of the same name.
pub const NAMED_COLORS: &[&str] = &[
    "black",
    "blue",
    "brown",
    "cyan",
    "darkgray",
    "gray",
    "green",
    "lightgray",
    "lime",
    "magenta",
    "olive",
    "orange",
    "pink",
    "purple",
    "red",
    "teal",
    "violet",
    "white",
    "yellow",
];

/// LaTeX font size switches, smallest first.
pub const FONT_SIZES: &[&str] = &[
    "tiny",
    "scriptsize",
    "footnotesize",
    "small",
    "normalsize",
    "large",
    "Large",
    "LARGE",
    "huge",
    "Huge",
];

/// Shared, mutable table of named filters.
///
/// Cloning the registry clones the handle, not the table: every clone sees
/// filters inserted through any other clone.
#[derive(Clone, Default)]
pub struct FilterRegistry {
    filters: Arc<RwLock<BTreeMap<String, Value>>>,
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl FilterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in LaTeX filters.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        register_builtin_filters(&registry);
        registry
    }

    /// Registers `filter` under `name`, replacing any previous entry.
    ///
    /// `filter` must be callable, typically built with [`Value::from_function`].
    pub fn insert(&self, name: impl Into<String>, filter: Value) {
        self.filters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), filter);
    }

    /// Returns the filter registered under `name`.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.filters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.filters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// All registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.filters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.filters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls the filter `name` with `value` as its first argument.
    pub fn apply(
        &self,
        state: &State,
        name: &str,
        value: Value,
        args: &[Value],
    ) -> Result<Value, Error> {
        // Clone out of the lock: the filter may itself register filters.
        let filter = self.get(name).ok_or_else(|| {
            Error::new(
                ErrorKind::UnknownFilter,
                format!("filter `{}` is not registered", name),
            )
        })?;
        let mut call_args = Vec::with_capacity(args.len() + 1);
        call_args.push(value);
        call_args.extend_from_slice(args);
        filter.call(state, &call_args)
    }

    /// Registers a dispatching proxy on `env` for every registry name and
    /// every name in `late`.
    ///
    /// Names in `late` may not exist yet; their proxies fail with
    /// `UnknownFilter` until something inserts them.
    pub fn install<I>(&self, env: &mut Environment<'static>, late: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut names: BTreeSet<String> = self.names().into_iter().collect();
        names.extend(late);

        for name in names {
            let registry = self.clone();
            let key = name.clone();
            env.add_filter(
                name,
                move |state: &State, value: Value, args: Rest<Value>| -> Result<Value, Error> {
                    registry.apply(state, &key, value, &args)
                },
            );
        }
    }
}

/// Fills `registry` with the built-in filter table.
pub fn register_builtin_filters(registry: &FilterRegistry) {
    registry.insert("fmt", Value::from_function(fmt));

    // Text decoration
    registry.insert("bold", Value::from_function(|v: Value| wrap("textbf", &v)));
    registry.insert("italic", Value::from_function(|v: Value| wrap("textit", &v)));
    registry.insert(
        "underline",
        Value::from_function(|v: Value| wrap("underline", &v)),
    );
    registry.insert("emph", Value::from_function(|v: Value| wrap("emph", &v)));
    registry.insert("cancel", Value::from_function(|v: Value| wrap("cancel", &v)));

    // Colors
    registry.insert(
        "color",
        Value::from_function(|v: Value, name: String| textcolor(&v, &name)),
    );
    for &name in NAMED_COLORS {
        registry.insert(
            name,
            Value::from_function(move |v: Value| textcolor(&v, name)),
        );
    }

    // Alignment
    registry.insert("vcenter", Value::from_function(vcenter));
    registry.insert("hcenter", Value::from_function(hcenter));

    // Font sizes
    registry.insert("fontsize", Value::from_function(fontsize));
    for &size in FONT_SIZES {
        registry.insert(size, Value::from_function(move |v: Value| wrap(size, &v)));
    }
}

/// `{{ x | fmt }}`, `{{ x | fmt(2) }}`, `{{ x | fmt(prec=1, nan="n/a") }}`
pub fn fmt(
    value: Value,
    prec: Option<usize>,
    nan: Option<String>,
    kwargs: Kwargs,
) -> Result<String, Error> {
    let prec = kwargs
        .get::<Option<usize>>("prec")?
        .or(prec)
        .unwrap_or(DEFAULT_PRECISION);
    let nan = kwargs
        .get::<Option<String>>("nan")?
        .or(nan)
        .unwrap_or_else(|| MISSING_PLACEHOLDER.to_string());
    kwargs.assert_all_used()?;

    Ok(match as_number(&value) {
        Some(x) if !x.is_nan() => format!("{:.*}", prec, x),
        _ => nan,
    })
}

fn as_number(value: &Value) -> Option<f64> {
    if value.kind() != minijinja::value::ValueKind::Number {
        return None;
    }
    f64::try_from(value.clone()).ok()
}

fn wrap(command: &str, value: &Value) -> String {
    format!("\\{}{{{}}}", command, value)
}

fn textcolor(value: &Value, color: &str) -> String {
    format!("{{\\textcolor{{{}}}{{{}}}}}", color, value)
}

fn vcenter(value: Value) -> String {
    format!("\\multicolumn{{1}}{{c}}{{{}}}", value)
}

fn hcenter(value: Value) -> String {
    format!("\\begin{{tabular}}{{@{{}}c@{{}}}}{{{}}}\\end{{tabular}}", value)
}

/// `{{ x | fontsize("small") }}`
fn fontsize(value: Value, size: String) -> Result<String, Error> {
    if !FONT_SIZES.contains(&size.as_str()) {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            format!(
                "unknown font size `{}` (expected one of: {})",
                size,
                FONT_SIZES.join(", ")
            ),
        ));
    }
    Ok(wrap(&size, &value))
}
