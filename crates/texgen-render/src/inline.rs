//! Inline Rhai code blocks.
//!
//! A template may embed script code between `<? rhai ?>` and `<? endrhai ?>`:
//!
//! ```text
//! <? rhai ?>
//! let total = rows.reduce(|sum, r| sum + r.value, 0);
//! fn pct(x) { `${x * 100.0}\%` }
//! filter(Fn("pct"));
//! <? endrhai ?>
//! Total: <?= total ?>, share: <?= 0.25 | pct ?>
//! ```
//!
//! MiniJinja has no custom tags, so blocks are handled in two halves:
//!
//! 1. [`rewrite_blocks`] runs in the loader and turns every block into plain
//!    template statements: a `set` block that captures the (rendered) body, a
//!    call to the `__rhai__` global, an expression emitting the captured
//!    output, and one top-level `set` per identifier of the body. Top-level
//!    `set` is how MiniJinja exports variables, so script variables become
//!    visible to the rest of the template. The rewrite never changes the line
//!    count, so template errors keep their line numbers.
//! 2. [`InlineRuntime`] backs `__rhai__`. It compiles the body (padded so Rhai
//!    reports template line numbers), seeds a scope from the variables visible
//!    at that point of the template, runs it, registers filters requested via
//!    `filter(...)` and hands back the output and the exported variables.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use minijinja::value::Rest;
use minijinja::{Environment, Error, ErrorKind, State, Value};
use once_cell::sync::Lazy;
use regex::Regex;
use rhai::module_resolvers::FileModuleResolver;
use rhai::{Dynamic, Engine, FnPtr, Scope, AST};
use tracing::debug;

use crate::convert::{to_dynamic, to_json, to_value};
use crate::filters::FilterRegistry;

/// Tag opening an inline code block.
pub const OPEN_TAG: &str = "rhai";

/// Tag closing an inline code block.
pub const CLOSE_TAG: &str = "endrhai";

/// Template global that executes a block.
pub const RUN_FUNCTION: &str = "__rhai__";

/// Script constant holding the template path during execution.
pub const FILE_CONSTANT: &str = "__file__";

const BLOCK_VAR_PREFIX: &str = "__rhai_";

static TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<\?(-?)\s*(endrhai|rhai)\s*(-?)\?>").expect("valid tag regex"));

static IDENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("valid identifier regex"));

/// Words that are never exported: template literals and operators, template
/// specials, Rhai keywords and the registration function.
const RESERVED: &[&str] = &[
    "true", "false", "none", "True", "False", "None", "and", "or", "not", "in", "is", "if",
    "else", "loop", "self", "super", "caller", "varargs", "kwargs", "let", "const", "fn",
    "return", "while", "for", "do", "until", "break", "continue", "switch", "throw", "try",
    "catch", "import", "export", "as", "private", "global", "this", "Fn", "call", "curry",
    "print", "debug", "type_of", "eval", "is_def_var", "is_def_fn", "is_shared", "filter",
];

// =============================================================================
// Source rewriting
// =============================================================================

struct OpenTag {
    start: usize,
    end: usize,
    trim_left: bool,
    trim_right: bool,
}

/// Rewrites every inline code block of `source` into template statements.
///
/// Returns the source unchanged when it has no blocks. Unbalanced or nested
/// tags are reported as syntax errors naming `name` and the line.
pub fn rewrite_blocks<'a>(name: &str, source: &'a str) -> Result<Cow<'a, str>, Error> {
    let mut out = String::new();
    let mut cursor = 0;
    let mut open: Option<OpenTag> = None;
    let mut index = 0;

    for caps in TAG_RE.captures_iter(source) {
        let Some(whole) = caps.get(0) else { continue };
        let trim_left = !caps[1].is_empty();
        let trim_right = !caps[3].is_empty();
        let closing = &caps[2] == CLOSE_TAG;

        match (open.take(), closing) {
            (None, false) => {
                out.push_str(&source[cursor..whole.start()]);
                open = Some(OpenTag {
                    start: whole.start(),
                    end: whole.end(),
                    trim_left,
                    trim_right,
                });
            }
            (Some(tag), true) => {
                let body = &source[tag.end..whole.start()];
                let line = first_code_line(source, tag.end, tag.trim_right);
                emit_block(&mut out, index, &tag, body, line, trim_left, trim_right);
                index += 1;
            }
            (None, true) => {
                return Err(tag_error(
                    name,
                    source,
                    whole.start(),
                    format!("unexpected `{}` without a matching `{}`", CLOSE_TAG, OPEN_TAG),
                ));
            }
            (Some(tag), false) => {
                return Err(tag_error(
                    name,
                    source,
                    whole.start(),
                    format!(
                        "nested `{}` block (the block opened on line {} is still open)",
                        OPEN_TAG,
                        line_at(source, tag.start)
                    ),
                ));
            }
        }
        cursor = whole.end();
    }

    if let Some(tag) = open {
        return Err(tag_error(
            name,
            source,
            tag.start,
            format!("`{}` block is never closed with `{}`", OPEN_TAG, CLOSE_TAG),
        ));
    }
    if index == 0 {
        return Ok(Cow::Borrowed(source));
    }

    out.push_str(&source[cursor..]);
    debug!(template = name, blocks = index, "rewrote inline code blocks");
    Ok(Cow::Owned(out))
}

fn emit_block(
    out: &mut String,
    index: usize,
    open: &OpenTag,
    body: &str,
    line: usize,
    close_trim_left: bool,
    close_trim_right: bool,
) {
    let var = format!("{}{}", BLOCK_VAR_PREFIX, index);
    let dash = |on: bool| if on { "-" } else { "" };

    out.push_str(&format!(
        "<?{} set {} {}?>",
        dash(open.trim_left),
        var,
        dash(open.trim_right)
    ));
    out.push_str(body);
    out.push_str(&format!("<?{} endset ?>", dash(close_trim_left)));
    out.push_str(&format!(
        "<? set {var} = {run}({var}, {line}) ?><?= {var}.output ?>",
        var = var,
        run = RUN_FUNCTION,
        line = line
    ));
    for ident in identifiers(body) {
        out.push_str(&format!(
            "<? set {id} = {var}.vars.{id} if \"{id}\" in {var}.vars else {id} ?>",
            id = ident,
            var = var
        ));
    }
    out.push_str(&format!("<? set {} = none {}?>", var, dash(close_trim_right)));
}

/// Line of the first body character that survives block trimming.
fn first_code_line(source: &str, body_start: usize, trim_right: bool) -> usize {
    let rest = &source[body_start..];
    let skipped = if trim_right {
        rest.len() - rest.trim_start().len()
    } else if rest.starts_with("\r\n") {
        2
    } else if rest.starts_with('\n') {
        1
    } else {
        0
    };
    line_at(source, body_start + skipped)
}

fn line_at(source: &str, offset: usize) -> usize {
    source[..offset].matches('\n').count() + 1
}

fn tag_error(name: &str, source: &str, offset: usize, detail: String) -> Error {
    Error::new(
        ErrorKind::SyntaxError,
        format!("{} (in {}:{})", detail, name, line_at(source, offset)),
    )
}

/// Identifiers a block may export, in sorted order.
///
/// Property and method names (`x.len`) are skipped.
pub(crate) fn identifiers(code: &str) -> BTreeSet<String> {
    let bytes = code.as_bytes();
    IDENT_RE
        .find_iter(code)
        .filter(|m| m.start() == 0 || !matches!(bytes[m.start() - 1], b'.' | b'0'..=b'9'))
        .map(|m| m.as_str())
        .filter(|ident| !ident.starts_with("__") && !RESERVED.contains(ident))
        .map(str::to_string)
        .collect()
}

// =============================================================================
// Execution
// =============================================================================

/// Per-render state behind the `__rhai__` template function.
///
/// Holds the script-side variables of earlier blocks (including values the
/// template cannot represent, such as closures) and the functions they
/// defined, so later blocks of the same render can use both.
pub struct InlineRuntime {
    filters: FilterRegistry,
    root: PathBuf,
    capture_stdout: bool,
    locals: Mutex<BTreeMap<String, Dynamic>>,
    library: Mutex<AST>,
}

impl InlineRuntime {
    /// Creates a runtime for templates living in `root`.
    ///
    /// `root` is also where `import` statements look for `.rhai` modules.
    pub fn new(filters: FilterRegistry, root: impl Into<PathBuf>, capture_stdout: bool) -> Self {
        Self {
            filters,
            root: root.into(),
            capture_stdout,
            locals: Mutex::new(BTreeMap::new()),
            library: Mutex::new(AST::empty()),
        }
    }

    /// Registers the `__rhai__` global on `env`.
    pub fn install(runtime: Arc<Self>, env: &mut Environment<'static>) {
        env.add_function(
            RUN_FUNCTION,
            move |state: &State, code: String, line: usize| -> Result<Value, Error> {
                runtime.execute(state, &code, line)
            },
        );
    }

    /// Runs one block whose first line sits on template line `line`.
    pub fn execute(&self, state: &State, code: &str, line: usize) -> Result<Value, Error> {
        let template = state.name().to_string();
        let file = self.root.join(&template);
        debug!(template = %template, line, "executing inline code block");

        let output = Arc::new(Mutex::new(String::new()));
        let pending: Arc<Mutex<Vec<(String, FnPtr)>>> = Arc::new(Mutex::new(Vec::new()));
        let engine = self.engine(&output, &pending);

        let padded = format!("{}{}", "\n".repeat(line.saturating_sub(1)), code);
        let block = engine
            .compile(&padded)
            .map_err(|err| script_error(&template, err))?;
        let ast = lock(&self.library).merge(&block);

        let (mut scope, seeded) = self.seed_scope(state, &file);
        engine
            .run_ast_with_scope(&mut scope, &ast)
            .map_err(|err| script_error(&template, err))?;

        *lock(&self.library) = ast.clone_functions_only();
        let vars = self.export(&scope, &seeded, code);

        let requested = std::mem::take(&mut *lock(&pending));
        if !requested.is_empty() {
            let engine = Arc::new(engine);
            let ast = Arc::new(ast);
            for (name, func) in requested {
                debug!(filter = %name, template = %template, "registering script filter");
                let filter = ScriptFilter {
                    engine: Arc::clone(&engine),
                    ast: Arc::clone(&ast),
                    func,
                };
                self.filters.insert(
                    name,
                    Value::from_function(move |value: Value, args: Rest<Value>| {
                        filter.call(value, &args)
                    }),
                );
            }
        }

        let text = if self.capture_stdout {
            std::mem::take(&mut *lock(&output))
        } else {
            String::new()
        };
        Ok(minijinja::context! {
            output => text,
            vars => Value::from_serialize(&vars),
        })
    }

    fn engine(
        &self,
        output: &Arc<Mutex<String>>,
        pending: &Arc<Mutex<Vec<(String, FnPtr)>>>,
    ) -> Engine {
        let mut engine = Engine::new();
        engine.set_module_resolver(FileModuleResolver::new_with_path(&self.root));

        if self.capture_stdout {
            let sink = Arc::clone(output);
            engine.on_print(move |text| {
                let mut buffer = lock(&sink);
                buffer.push_str(text);
                buffer.push('\n');
            });
        }

        let sink = Arc::clone(pending);
        engine.register_fn("filter", move |func: FnPtr| -> FnPtr {
            lock(&sink).push((func.fn_name().to_string(), func.clone()));
            func
        });
        let sink = Arc::clone(pending);
        engine.register_fn("filter", move |name: &str, func: FnPtr| -> FnPtr {
            lock(&sink).push((name.to_string(), func.clone()));
            func
        });

        engine
    }

    /// Script locals first, then the template's visible variables, so values
    /// the template reassigned since the last block win.
    ///
    /// Also returns the data form of every template value pushed, so
    /// [`export`](Self::export) can tell which ones the block changed.
    fn seed_scope(&self, state: &State, file: &Path) -> (Scope<'static>, Seeded) {
        let mut scope = Scope::new();
        let mut seeded = Seeded::new();
        for (name, value) in lock(&self.locals).iter() {
            scope.push_dynamic(name.clone(), value.clone());
        }
        for name in state.known_variables() {
            if name.starts_with("__") {
                continue;
            }
            if let Some(value) = state.lookup(&name).as_ref().and_then(to_dynamic) {
                seeded.insert(name.to_string(), to_json(&value));
                scope.push_dynamic(name.to_string(), value);
            }
        }
        scope.push_constant(FILE_CONSTANT, file.display().to_string());
        (scope, seeded)
    }

    /// Stores every identifier of `code` that exists in `scope` as a script
    /// local and returns the ones with a data form for the template.
    ///
    /// Template values the block left untouched are skipped: the template
    /// keeps its own value, which may not survive a round trip (namespaces,
    /// objects).
    fn export(
        &self,
        scope: &Scope,
        seeded: &Seeded,
        code: &str,
    ) -> BTreeMap<String, serde_json::Value> {
        let referenced = identifiers(code);
        let mut latest = BTreeMap::new();
        for (name, _, value) in scope.iter() {
            latest.insert(name.to_string(), value);
        }

        let mut locals = lock(&self.locals);
        let mut exported = BTreeMap::new();
        for (name, value) in latest {
            if !referenced.contains(&name) {
                continue;
            }
            let json = to_json(&value);
            if seeded.get(&name).is_some_and(|before| *before == json) {
                continue;
            }
            if let Some(json) = json {
                exported.insert(name.clone(), json);
            }
            locals.insert(name, value);
        }
        debug!(names = ?exported.keys().collect::<Vec<_>>(), "exported inline variables");
        exported
    }
}

/// Template values pushed into a block scope, in their data form.
type Seeded = BTreeMap<String, Option<serde_json::Value>>;

/// A script function registered as a template filter.
struct ScriptFilter {
    engine: Arc<Engine>,
    ast: Arc<AST>,
    func: FnPtr,
}

impl ScriptFilter {
    fn call(&self, value: Value, args: &[Value]) -> Result<Value, Error> {
        let call_args: Vec<Dynamic> = std::iter::once(&value)
            .chain(args)
            .map(|arg| to_dynamic(arg).unwrap_or(Dynamic::UNIT))
            .collect();
        let result: Dynamic = self
            .func
            .call(&self.engine, &self.ast, call_args)
            .map_err(|err| {
                Error::new(
                    ErrorKind::InvalidOperation,
                    format!("script filter `{}` failed", self.func.fn_name()),
                )
                .with_source(err)
            })?;
        Ok(to_value(result))
    }
}

fn script_error<E>(template: &str, err: E) -> Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    Error::new(
        ErrorKind::InvalidOperation,
        format!("inline code in {} failed", template),
    )
    .with_source(err)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
