//! Host helper functions exposed as template globals.
//!
//! Templates get a small, fixed set of numeric and sequence helpers that
//! MiniJinja does not ship (`abs`, `divmod`, `sorted`, `zip`, ...). They follow
//! the usual scripting-language semantics: integer arithmetic stays integral,
//! floor division rounds toward negative infinity, `round` rounds half to even.
//!
//! The set is an explicit allow-list ([`BUILTINS`]). A [`BuiltinsConfig`] can
//! disable injection entirely or exclude individual names; names MiniJinja
//! already defines as globals are never overridden.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use minijinja::value::{Kwargs, Rest};
use minijinja::{Environment, Error, ErrorKind, Value};
use tracing::debug;

/// Every helper the renderer knows how to inject.
pub const BUILTINS: &[&str] = &[
    "abs", "all", "any", "bin", "bool", "chr", "divmod", "enumerate", "float", "help", "hex",
    "int", "len", "list", "max", "min", "oct", "ord", "pow", "reversed", "round", "sorted",
    "str", "sum", "zip",
];

/// Names excluded unless the caller asks otherwise.
pub const DEFAULT_EXCLUDED: &[&str] = &["copyright", "credits", "help", "license"];

/// Which host helpers a render environment receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinsConfig {
    /// Inject helpers at all.
    pub enabled: bool,
    /// Names never injected.
    pub exclude: BTreeSet<String>,
}

impl Default for BuiltinsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exclude: DEFAULT_EXCLUDED.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl BuiltinsConfig {
    /// A configuration that injects nothing.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Adds `name` to the exclusion list.
    pub fn exclude(mut self, name: impl Into<String>) -> Self {
        self.exclude.insert(name.into());
        self
    }

    /// Removes `name` from the exclusion list.
    pub fn include(mut self, name: &str) -> Self {
        self.exclude.remove(name);
        self
    }

    /// The allow-listed names this configuration would inject, ignoring
    /// engine-defined globals.
    pub fn selected(&self) -> Vec<&'static str> {
        if !self.enabled {
            return Vec::new();
        }
        BUILTINS
            .iter()
            .copied()
            .filter(|name| !self.exclude.contains(*name))
            .collect()
    }
}

/// Adds the configured helpers to `env` and returns the injected names.
pub fn install(env: &mut Environment<'static>, config: &BuiltinsConfig) -> Vec<String> {
    let pristine = Environment::new();
    let names: Vec<String> = config
        .selected()
        .into_iter()
        .filter(|name| !engine_defines(&pristine, name))
        .map(str::to_string)
        .collect();

    for name in &names {
        add(env, name, &names);
    }
    debug!(count = names.len(), "installed host builtins");
    names
}

/// Whether a fresh MiniJinja environment already resolves `name`.
fn engine_defines(env: &Environment<'_>, name: &str) -> bool {
    env.compile_expression(name)
        .and_then(|expr| expr.eval(()))
        .map(|value| !value.is_undefined())
        .unwrap_or(false)
}

fn add(env: &mut Environment<'static>, name: &str, installed: &[String]) {
    match name {
        "abs" => env.add_function("abs", abs),
        "all" => env.add_function("all", all),
        "any" => env.add_function("any", any),
        "bin" => env.add_function("bin", |n: i64| radix(n, "0b", 2)),
        "bool" => env.add_function("bool", |v: Value| v.is_true()),
        "chr" => env.add_function("chr", chr),
        "divmod" => env.add_function("divmod", divmod),
        "enumerate" => env.add_function("enumerate", enumerate),
        "float" => env.add_function("float", float),
        "help" => {
            let mut listed = installed.to_vec();
            listed.sort();
            env.add_function("help", move || listed.clone());
        }
        "hex" => env.add_function("hex", |n: i64| radix(n, "0x", 16)),
        "int" => env.add_function("int", int),
        "len" => env.add_function("len", len),
        "list" => env.add_function("list", |v: Value| items(&v).map(Value::from)),
        "max" => env.add_function("max", |args: Rest<Value>| extreme(&args, "max", Ordering::Greater)),
        "min" => env.add_function("min", |args: Rest<Value>| extreme(&args, "min", Ordering::Less)),
        "oct" => env.add_function("oct", |n: i64| radix(n, "0o", 8)),
        "ord" => env.add_function("ord", ord),
        "pow" => env.add_function("pow", pow),
        "reversed" => env.add_function("reversed", |v: Value| {
            items(&v).map(|mut list| {
                list.reverse();
                Value::from(list)
            })
        }),
        "round" => env.add_function("round", round),
        "sorted" => env.add_function("sorted", sorted),
        "str" => env.add_function("str", |v: Value| v.to_string()),
        "sum" => env.add_function("sum", sum),
        "zip" => env.add_function("zip", zip),
        _ => {}
    }
}

// =============================================================================
// Numbers
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    /// Reads a number, treating booleans as 0 and 1.
    fn from_value(value: &Value) -> Result<Num, Error> {
        let num = match serde_json::to_value(value) {
            Ok(serde_json::Value::Number(n)) => {
                n.as_i64().map(Num::Int).or_else(|| n.as_f64().map(Num::Float))
            }
            Ok(serde_json::Value::Bool(b)) => Some(Num::Int(i64::from(b))),
            _ => None,
        };
        num.ok_or_else(|| invalid(format!("expected a number, got {}", value.kind())))
    }

    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    fn add(self, other: Num) -> Num {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) => a
                .checked_add(b)
                .map(Num::Int)
                .unwrap_or(Num::Float(a as f64 + b as f64)),
            (a, b) => Num::Float(a.as_f64() + b.as_f64()),
        }
    }
}

impl From<Num> for Value {
    fn from(num: Num) -> Value {
        match num {
            Num::Int(i) => Value::from(i),
            Num::Float(f) => Value::from(f),
        }
    }
}

fn abs(value: Value) -> Result<Value, Error> {
    Ok(match Num::from_value(&value)? {
        Num::Int(i) => i
            .checked_abs()
            .map(Num::Int)
            .unwrap_or(Num::Float((i as f64).abs())),
        Num::Float(f) => Num::Float(f.abs()),
    }
    .into())
}

/// Floor division and remainder; the remainder takes the divisor's sign.
fn divmod(a: Value, b: Value) -> Result<Value, Error> {
    let (q, r) = match (Num::from_value(&a)?, Num::from_value(&b)?) {
        (_, Num::Int(0)) => return Err(invalid("integer division or modulo by zero")),
        (Num::Int(a), Num::Int(b)) => {
            let (q, r) = (a.wrapping_div(b), a.wrapping_rem(b));
            if r != 0 && (r < 0) != (b < 0) {
                (Num::Int(q - 1), Num::Int(r + b))
            } else {
                (Num::Int(q), Num::Int(r))
            }
        }
        (a, b) => {
            let (a, b) = (a.as_f64(), b.as_f64());
            if b == 0.0 {
                return Err(invalid("float divmod by zero"));
            }
            let q = (a / b).floor();
            (Num::Float(q), Num::Float(a - q * b))
        }
    };
    Ok(Value::from(vec![Value::from(q), Value::from(r)]))
}

fn pow(base: Value, exp: Value) -> Result<Value, Error> {
    Ok(match (Num::from_value(&base)?, Num::from_value(&exp)?) {
        (Num::Int(b), Num::Int(e)) if e >= 0 => u32::try_from(e)
            .ok()
            .and_then(|e| b.checked_pow(e))
            .map(Num::Int)
            .unwrap_or(Num::Float((b as f64).powf(e as f64))),
        (b, e) => Num::Float(b.as_f64().powf(e.as_f64())),
    }
    .into())
}

/// `round(x)` gives an integer, `round(x, n)` keeps the input's type.
fn round(value: Value, ndigits: Option<i32>) -> Result<Value, Error> {
    let num = Num::from_value(&value)?;
    Ok(match (num, ndigits) {
        (Num::Int(_), _) => num,
        (Num::Float(f), None) => Num::Int(f.round_ties_even() as i64),
        (Num::Float(f), Some(n)) => {
            let scale = 10f64.powi(n);
            Num::Float((f * scale).round_ties_even() / scale)
        }
    }
    .into())
}

fn sum(iterable: Value, start: Option<Value>) -> Result<Value, Error> {
    let mut total = match start {
        Some(start) => Num::from_value(&start)?,
        None => Num::Int(0),
    };
    for item in iterable.try_iter()? {
        total = total.add(Num::from_value(&item)?);
    }
    Ok(total.into())
}

fn float(value: Value) -> Result<f64, Error> {
    if let Some(s) = value.as_str() {
        return s
            .trim()
            .parse::<f64>()
            .map_err(|_| invalid(format!("could not convert string to float: {:?}", s)));
    }
    Ok(Num::from_value(&value)?.as_f64())
}

/// `int(x)` truncates numbers and parses strings, `int(s, base)` parses in
/// the given base.
fn int(value: Value, base: Option<u32>) -> Result<i64, Error> {
    if let Some(s) = value.as_str() {
        let digits = s.trim();
        let base = base.unwrap_or(10);
        let stripped = match base {
            16 => digits.trim_start_matches("0x").trim_start_matches("0X"),
            8 => digits.trim_start_matches("0o").trim_start_matches("0O"),
            2 => digits.trim_start_matches("0b").trim_start_matches("0B"),
            _ => digits,
        };
        return i64::from_str_radix(stripped, base).map_err(|_| {
            invalid(format!("invalid literal for int() with base {}: {:?}", base, s))
        });
    }
    if base.is_some() {
        return Err(invalid("int() can't convert non-string with explicit base"));
    }
    match Num::from_value(&value)? {
        Num::Int(i) => Ok(i),
        Num::Float(f) if f.is_finite() => Ok(f.trunc() as i64),
        Num::Float(f) => Err(invalid(format!("cannot convert float {} to integer", f))),
    }
}

fn radix(n: i64, prefix: &str, base: u32) -> String {
    let sign = if n < 0 { "-" } else { "" };
    let magnitude = n.unsigned_abs();
    let digits = match base {
        2 => format!("{:b}", magnitude),
        8 => format!("{:o}", magnitude),
        _ => format!("{:x}", magnitude),
    };
    format!("{}{}{}", sign, prefix, digits)
}

// =============================================================================
// Characters
// =============================================================================

fn chr(code: u32) -> Result<String, Error> {
    char::from_u32(code)
        .map(String::from)
        .ok_or_else(|| invalid(format!("chr() arg not a valid code point: {}", code)))
}

fn ord(value: String) -> Result<u32, Error> {
    let mut chars = value.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(u32::from(c)),
        _ => Err(invalid(format!(
            "ord() expected a character, but string of length {} found",
            value.chars().count()
        ))),
    }
}

// =============================================================================
// Sequences
// =============================================================================

fn items(value: &Value) -> Result<Vec<Value>, Error> {
    Ok(value.try_iter()?.collect())
}

fn len(value: Value) -> Result<usize, Error> {
    value
        .len()
        .ok_or_else(|| invalid(format!("object of type {} has no len()", value.kind())))
}

fn all(iterable: Value) -> Result<bool, Error> {
    Ok(iterable.try_iter()?.all(|item| item.is_true()))
}

fn any(iterable: Value) -> Result<bool, Error> {
    Ok(iterable.try_iter()?.any(|item| item.is_true()))
}

/// `enumerate(xs)` and `enumerate(xs, start)` as a list of `[index, item]`.
fn enumerate(iterable: Value, start: Option<i64>) -> Result<Value, Error> {
    let start = start.unwrap_or(0);
    Ok(Value::from(
        iterable
            .try_iter()?
            .zip(start..)
            .map(|(item, index)| Value::from(vec![Value::from(index), item]))
            .collect::<Vec<_>>(),
    ))
}

/// `max(a, b, ...)` or `max(iterable)`; `min` likewise.
fn extreme(args: &[Value], name: &str, keep: Ordering) -> Result<Value, Error> {
    let candidates = match args {
        [single] => items(single)?,
        many => many.to_vec(),
    };
    candidates
        .into_iter()
        .reduce(|best, item| if item.cmp(&best) == keep { item } else { best })
        .ok_or_else(|| invalid(format!("{}() arg is an empty sequence", name)))
}

/// `sorted(xs)` or `sorted(xs, reverse=true)`.
fn sorted(iterable: Value, kwargs: Kwargs) -> Result<Value, Error> {
    let reverse = kwargs.get::<Option<bool>>("reverse")?.unwrap_or(false);
    kwargs.assert_all_used()?;
    let mut list = items(&iterable)?;
    list.sort();
    if reverse {
        list.reverse();
    }
    Ok(Value::from(list))
}

fn zip(iterables: Rest<Value>) -> Result<Value, Error> {
    let columns = iterables
        .iter()
        .map(items)
        .collect::<Result<Vec<_>, _>>()?;
    let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
    Ok(Value::from(
        (0..rows)
            .map(|row| Value::from(columns.iter().map(|c| c[row].clone()).collect::<Vec<_>>()))
            .collect::<Vec<_>>(),
    ))
}

fn invalid(message: impl Into<std::borrow::Cow<'static, str>>) -> Error {
    Error::new(ErrorKind::InvalidOperation, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render_with(config: &BuiltinsConfig, template: &str) -> Result<String, Error> {
        let mut env = Environment::new();
        install(&mut env, config);
        env.render_str(template, ())
    }

    fn render(template: &str) -> String {
        render_with(&BuiltinsConfig::default(), template).unwrap()
    }

    #[test]
    fn test_default_config_excludes_help() {
        let config = BuiltinsConfig::default();
        assert!(config.enabled);
        assert!(!config.selected().contains(&"help"));
        assert_eq!(config.selected().len(), BUILTINS.len() - 1);
    }

    #[test]
    fn test_disabled_injects_nothing() {
        let out = render_with(&BuiltinsConfig::disabled(), "{{ abs is defined }}").unwrap();
        assert_eq!(out, "False");
    }

    #[test]
    fn test_exclusion_list() {
        let config = BuiltinsConfig::default().exclude("abs");
        let out = render_with(&config, "{{ abs is defined }}/{{ min is defined }}").unwrap();
        assert_eq!(out, "False/True");
    }

    #[test]
    fn test_engine_globals_are_not_overridden() {
        let mut env = Environment::new();
        let names = install(&mut env, &BuiltinsConfig::default());
        assert!(!names.iter().any(|n| n == "range" || n == "dict"));
        assert_eq!(env.render_str("{{ range(3) | list }}", ()).unwrap(), "[0, 1, 2]");
    }

    #[test]
    fn test_help_lists_installed_names() {
        let config = BuiltinsConfig::default().include("help");
        let out = render_with(&config, "{{ help() | join(',') }}").unwrap();
        assert!(out.starts_with("abs,all,any"));
        assert!(out.contains("help"));
        assert!(out.ends_with("zip"));
    }

    #[test]
    fn test_numeric_helpers() {
        assert_eq!(render("{{ abs(-3) }}"), "3");
        assert_eq!(render("{{ abs(-2.5) }}"), "2.5");
        assert_eq!(render("{{ divmod(-7, 2) }}"), "[-4, 1]");
        assert_eq!(render("{{ divmod(7, -2) }}"), "[-4, -1]");
        assert_eq!(render("{{ pow(2, 10) }}"), "1024");
        assert_eq!(render("{{ round(2.5) }}"), "2");
        assert_eq!(render("{{ round(3.14159, 2) }}"), "3.14");
        assert_eq!(render("{{ sum([1, 2, 3]) }}"), "6");
        assert_eq!(render("{{ sum([1, 2.5], 10) }}"), "13.5");
    }

    #[test]
    fn test_divmod_by_zero_fails() {
        let err = render_with(&BuiltinsConfig::default(), "{{ divmod(1, 0) }}").unwrap_err();
        assert!(err.to_string().contains("by zero"));
    }

    #[test]
    fn test_conversions() {
        assert_eq!(render("{{ int('ff', 16) }}"), "255");
        assert_eq!(render("{{ int(' 42 ') }}"), "42");
        assert_eq!(render("{{ int(-3.9) }}"), "-3");
        assert_eq!(render("{{ float('2.5') + 1 }}"), "3.5");
        assert_eq!(render("{{ bool(0) }}/{{ bool('x') }}"), "False/True");
        assert_eq!(render("{{ str(12) ~ 'a' }}"), "12a");
        assert_eq!(render("{{ hex(255) }} {{ oct(8) }} {{ bin(-5) }}"), "0xff 0o10 -0b101");
        assert_eq!(render("{{ chr(65) }}{{ ord('B') }}"), "A66");
    }

    #[test]
    fn test_sequence_helpers() {
        assert_eq!(render("{{ len('abc') }}"), "3");
        assert_eq!(render("{{ sorted([3, 1, 2]) }}"), "[1, 2, 3]");
        assert_eq!(render("{{ sorted([3, 1, 2], reverse=true) }}"), "[3, 2, 1]");
        assert_eq!(render("{{ reversed([1, 2, 3]) }}"), "[3, 2, 1]");
        assert_eq!(render("{{ max(1, 5, 3) }}/{{ max([4, 2]) }}/{{ min(1, 5) }}"), "5/4/1");
        assert_eq!(render("{{ zip([1, 2, 3], [4, 5]) }}"), "[[1, 4], [2, 5]]");
        assert_eq!(render("{{ all([1, true]) }}/{{ any([0, false]) }}"), "True/False");
        assert_eq!(
            render("{% for i, x in enumerate([7, 8], 1) %}{{ i }}={{ x }};{% endfor %}"),
            "1=7;2=8;"
        );
    }
}
