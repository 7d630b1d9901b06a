//! Template rendering.
//!
//! A [`Renderer`] turns one `.t.tex` file into its generated document. Every
//! render builds a fresh MiniJinja environment:
//!
//! - custom delimiters: `<? ... ?>` for statements, `<?= ... ?>` for
//!   expressions, `<?# ... ?>` for comments, with `trim_blocks` on and
//!   auto-escaping off
//! - a loader rooted at the template's directory that refuses `..` segments
//!   and rewrites inline code blocks
//! - proxies for every filter in the shared [`FilterRegistry`], plus proxies
//!   for filter names the template uses that nothing defines yet
//! - the configured host builtins and the inline code runtime
//!
//! While rendering, the process working directory is the template's
//! directory, so relative paths inside inline code resolve next to the
//! template. The previous directory is restored when the render ends, even
//! on failure.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use minijinja::syntax::SyntaxConfig;
use minijinja::{AutoEscape, Environment, Error, ErrorKind};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::builtins::{self, BuiltinsConfig};
use crate::error::RenderError;
use crate::filters::FilterRegistry;
use crate::inline::{rewrite_blocks, InlineRuntime};

/// First line of every generated document.
pub const GENERATED_HEADER: &str = "% This is an automatically generated file. Do not edit.";

static FILTER_USE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\|\s*([A-Za-z_][A-Za-z0-9_]*)").expect("valid filter regex"));

static INLINE_BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<\?-?\s*rhai\s*-?\?>.*?<\?-?\s*endrhai\s*-?\?>").expect("valid block regex")
});

/// Per-render settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderOptions {
    /// Substitute `print` output of inline code at the block position
    /// instead of writing it to stdout.
    pub capture_stdout: bool,
    /// Host helpers injected as template globals.
    pub builtins: BuiltinsConfig,
}

/// Renders template files against a shared filter table.
///
/// Filters registered by inline code go into the renderer's registry, so a
/// renderer reused across files lets later files use filters defined by
/// earlier ones.
#[derive(Debug, Clone)]
pub struct Renderer {
    filters: FilterRegistry,
    options: RenderOptions,
}

impl Renderer {
    pub fn new(filters: FilterRegistry, options: RenderOptions) -> Self {
        Self { filters, options }
    }

    pub fn filters(&self) -> &FilterRegistry {
        &self.filters
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    /// Renders `input` and returns the full document, header included.
    pub fn render_to_string(&self, input: &Path) -> Result<String, RenderError> {
        let absolute = fs::canonicalize(input).map_err(|e| RenderError::io(input, e))?;
        let (root, name) = split_template_path(&absolute).map_err(|e| RenderError::io(input, e))?;

        let _cwd = WorkingDir::enter(&root).map_err(|e| RenderError::io(&root, e))?;
        let source = fs::read_to_string(&absolute).map_err(|e| RenderError::io(input, e))?;

        let body = self
            .render_source(&root, &name, &source)
            .map_err(|e| RenderError::template(input, &e))?;
        Ok(format!("{}\n{}", GENERATED_HEADER, body))
    }

    /// Renders `input` and writes the document to `output`, replacing any
    /// existing file.
    ///
    /// A relative `output` is resolved against the working directory at the
    /// time of the call, not the template's directory.
    pub fn render_file(&self, input: &Path, output: &Path) -> Result<(), RenderError> {
        let output = std::path::absolute(output).map_err(|e| RenderError::io(output, e))?;
        let document = self.render_to_string(input)?;
        fs::write(&output, document).map_err(|e| RenderError::io(&output, e))?;
        info!(input = %input.display(), output = %output.display(), "rendered template");
        Ok(())
    }

    fn render_source(&self, root: &Path, name: &str, source: &str) -> Result<String, Error> {
        let mut env = self.environment(root, source)?;
        let rewritten = rewrite_blocks(name, source)?.into_owned();
        env.add_template_owned(name.to_string(), rewritten)?;
        env.get_template(name)?.render(())
    }

    /// Builds the environment for one render of a template in `root`.
    ///
    /// `entry_source` is scanned for filter names that only inline code will
    /// define.
    fn environment(&self, root: &Path, entry_source: &str) -> Result<Environment<'static>, Error> {
        let mut env = Environment::new();
        env.set_syntax(syntax()?);
        env.set_trim_blocks(true);
        env.set_auto_escape_callback(|_| AutoEscape::None);

        let loader_root = root.to_path_buf();
        env.set_loader(move |name| load_template(&loader_root, name));

        let late = late_filter_names(entry_source);
        debug!(
            registered = self.filters.len(),
            late = ?late,
            "installing filters"
        );
        self.filters.install(&mut env, late);

        if self.options.builtins.enabled {
            builtins::install(&mut env, &self.options.builtins);
        }

        let runtime = InlineRuntime::new(
            self.filters.clone(),
            root.to_path_buf(),
            self.options.capture_stdout,
        );
        InlineRuntime::install(Arc::new(runtime), &mut env);
        Ok(env)
    }
}

/// The template delimiters.
pub(crate) fn syntax() -> Result<SyntaxConfig, Error> {
    SyntaxConfig::builder()
        .block_delimiters("<?", "?>")
        .variable_delimiters("<?=", "?>")
        .comment_delimiters("<?#", "?>")
        .build()
}

fn split_template_path(path: &Path) -> io::Result<(PathBuf, String)> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "template path has no UTF-8 file name"))?;
    let root = path.parent().unwrap_or_else(|| Path::new("/"));
    Ok((root.to_path_buf(), name.to_string()))
}

/// Loads `name` relative to `root` for `include`, `import` and `extends`.
fn load_template(root: &Path, name: &str) -> Result<Option<String>, Error> {
    let Some(path) = safe_join(root, name) else {
        return Err(Error::new(
            ErrorKind::TemplateNotFound,
            format!("template name {:?} escapes the template directory", name),
        ));
    };
    match fs::read_to_string(&path) {
        Ok(source) => {
            debug!(template = name, path = %path.display(), "loaded template");
            rewrite_blocks(name, &source).map(|s| Some(s.into_owned()))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("could not read template {}", path.display()),
        )
        .with_source(err)),
    }
}

fn safe_join(root: &Path, name: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(segment) => path.push(segment),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(path)
}

/// Filter names used in `source` that a plain MiniJinja environment does
/// not provide.
///
/// Inline code blocks are skipped, their `|` are closure parameter lists.
/// A script filter named like an engine filter (`upper`) therefore only
/// replaces it in later renders, whose registry already holds it.
fn late_filter_names(source: &str) -> BTreeSet<String> {
    let pristine = Environment::new();
    let template_text = INLINE_BLOCK_RE.replace_all(source, "");
    FILTER_USE_RE
        .captures_iter(&template_text)
        .map(|caps| caps[1].to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter(|name| !engine_filter(&pristine, name))
        .collect()
}

fn engine_filter(env: &Environment<'_>, name: &str) -> bool {
    let probe = format!("none | {}", name);
    let result = env.compile_expression(&probe).and_then(|expr| expr.eval(()));
    !matches!(result, Err(err) if err.kind() == ErrorKind::UnknownFilter)
}

/// Switches the process working directory and restores it on drop.
struct WorkingDir {
    previous: PathBuf,
}

impl WorkingDir {
    fn enter(dir: &Path) -> io::Result<Self> {
        let previous = std::env::current_dir()?;
        std::env::set_current_dir(dir)?;
        Ok(Self { previous })
    }
}

impl Drop for WorkingDir {
    fn drop(&mut self) {
        if let Err(err) = std::env::set_current_dir(&self.previous) {
            warn!(dir = %self.previous.display(), error = %err, "could not restore working directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn renderer() -> Renderer {
        Renderer::new(FilterRegistry::with_defaults(), RenderOptions::default())
    }

    fn body(document: &str) -> &str {
        document
            .strip_prefix(GENERATED_HEADER)
            .and_then(|rest| rest.strip_prefix('\n'))
            .expect("document starts with the header")
    }

    // =========================================================================
    // Documents
    // =========================================================================

    #[test]
    #[serial]
    fn test_header_then_body() {
        let dir = TempDir::new().unwrap();
        let input = write(&dir, "a.t.tex", "Value: <?= 2 * 21 ?>\n");
        let document = renderer().render_to_string(&input).unwrap();
        assert_eq!(document, format!("{}\nValue: 42", GENERATED_HEADER));
    }

    #[test]
    #[serial]
    fn test_render_file_overwrites_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let input = write(&dir, "a.t.tex", "<?= 1.23456 | fmt(2) | bold ?>");
        let output = write(&dir, "a.g.tex", "stale");

        renderer().render_file(&input, &output).unwrap();
        let first = fs::read_to_string(&output).unwrap();
        renderer().render_file(&input, &output).unwrap();
        let second = fs::read_to_string(&output).unwrap();

        assert_eq!(body(&first), "\\textbf{1.23}");
        assert_eq!(first, second);
    }

    #[test]
    #[serial]
    fn test_statements_comments_and_trim_blocks() {
        let dir = TempDir::new().unwrap();
        let source = "<? for x in [1, 2] ?>\n<?= x ?> \\\\\n<? endfor ?>\n<?# note ?>done";
        let input = write(&dir, "t.t.tex", source);
        let document = renderer().render_to_string(&input).unwrap();
        assert_eq!(body(&document), "1 \\\\\n2 \\\\\ndone");
    }

    #[test]
    #[serial]
    fn test_no_auto_escaping() {
        let dir = TempDir::new().unwrap();
        let input = write(&dir, "t.t.tex", "<?= '<b>&' ?>");
        let document = renderer().render_to_string(&input).unwrap();
        assert_eq!(body(&document), "<b>&");
    }

    // =========================================================================
    // Inline code
    // =========================================================================

    #[test]
    #[serial]
    fn test_inline_variable_propagates() {
        let dir = TempDir::new().unwrap();
        let input = write(&dir, "t.t.tex", "<? rhai ?>\nlet x = 5;\n<? endrhai ?>\n<?= x ?>");
        let document = renderer().render_to_string(&input).unwrap();
        assert_eq!(body(&document), "5");
    }

    #[test]
    #[serial]
    fn test_capture_stdout_option() {
        let dir = TempDir::new().unwrap();
        let input = write(&dir, "t.t.tex", "<? rhai ?>\nprint(\"hi\");\n<? endrhai ?>\nend");

        let quiet = renderer().render_to_string(&input).unwrap();
        assert_eq!(body(&quiet), "end");

        let options = RenderOptions {
            capture_stdout: true,
            ..RenderOptions::default()
        };
        let captured = Renderer::new(FilterRegistry::with_defaults(), options)
            .render_to_string(&input)
            .unwrap();
        assert_eq!(body(&captured), "hi\nend");
    }

    #[test]
    #[serial]
    fn test_filter_defined_later_in_same_file() {
        let dir = TempDir::new().unwrap();
        let source = "<? rhai ?>\nfn shout(s) { s.to_upper() }\nfilter(Fn(\"shout\"));\n<? endrhai ?>\n\
                      <?= 'hey' | shout ?>";
        let input = write(&dir, "t.t.tex", source);
        let document = renderer().render_to_string(&input).unwrap();
        assert_eq!(body(&document), "HEY");
    }

    #[test]
    #[serial]
    fn test_filters_leak_across_files_of_one_registry() {
        let dir = TempDir::new().unwrap();
        let first = write(
            &dir,
            "a.t.tex",
            "<? rhai ?>\nfilter(\"shout\", |s| s.to_upper());\n<? endrhai ?>\n",
        );
        let second = write(&dir, "b.t.tex", "<?= 'x' | shout ?>");

        let shared = renderer();
        shared.render_to_string(&first).unwrap();
        assert!(shared.filters().contains("shout"));
        assert_eq!(body(&shared.render_to_string(&second).unwrap()), "X");

        let err = renderer().render_to_string(&second).unwrap_err();
        assert!(err.to_string().contains("shout"));
    }

    #[test]
    #[serial]
    fn test_script_filter_shadows_engine_filter_in_later_files() {
        let dir = TempDir::new().unwrap();
        let first = write(
            &dir,
            "a.t.tex",
            "<? rhai ?>\nfilter(\"upper\", |s| \"X\");\n<? endrhai ?>\n<?= 'a' | upper ?>",
        );
        let second = write(&dir, "b.t.tex", "<?= 'a' | upper ?>");

        let shared = renderer();
        assert_eq!(body(&shared.render_to_string(&first).unwrap()), "A");
        assert_eq!(body(&shared.render_to_string(&second).unwrap()), "X");
    }

    #[test]
    #[serial]
    fn test_file_constant_and_working_directory() {
        let dir = TempDir::new().unwrap();
        let source = "<? rhai ?>\nlet f = __file__;\n<? endrhai ?>\n\
                      <?= f is endingwith(\"t.t.tex\") ?> <?= __file__ is defined ?>";
        let input = write(&dir, "t.t.tex", source);
        let before = std::env::current_dir().unwrap();
        let document = renderer().render_to_string(&input).unwrap();
        assert_eq!(body(&document), "True False");
        assert_eq!(std::env::current_dir().unwrap(), before);
    }

    #[test]
    #[serial]
    fn test_rhai_module_import_from_template_dir() {
        let dir = TempDir::new().unwrap();
        write(&dir, "helpers.rhai", "fn triple(x) { x * 3 }");
        let source = "<? rhai ?>\nimport \"helpers\" as h;\nlet t = h::triple(4);\n<? endrhai ?>\n<?= t ?>";
        let input = write(&dir, "t.t.tex", source);
        let document = renderer().render_to_string(&input).unwrap();
        assert_eq!(body(&document), "12");
    }

    // =========================================================================
    // Loader
    // =========================================================================

    #[test]
    #[serial]
    fn test_include_resolves_next_to_template() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("parts")).unwrap();
        fs::write(dir.path().join("parts/row.tex"), "<?= n | fmt(1) ?>").unwrap();
        let input = write(&dir, "t.t.tex", "<? set n = 2 ?><? include \"parts/row.tex\" ?>");
        let document = renderer().render_to_string(&input).unwrap();
        assert_eq!(body(&document), "2.0");
    }

    #[test]
    #[serial]
    fn test_include_cannot_leave_template_directory() {
        let dir = TempDir::new().unwrap();
        write(&dir, "secret.tex", "SECRET");
        fs::create_dir(dir.path().join("sub")).unwrap();
        let input = dir.path().join("sub/t.t.tex");
        fs::write(&input, "<? include \"../secret.tex\" ?>").unwrap();

        let err = renderer().render_to_string(&input).unwrap_err();
        assert!(matches!(err, RenderError::Template { .. }));
        assert!(!err.to_string().contains("SECRET"));
    }

    #[test]
    fn test_load_template_rejects_escaping_names() {
        let dir = TempDir::new().unwrap();
        write(&dir, "part.tex", "ok");

        assert_eq!(load_template(dir.path(), "part.tex").unwrap(), Some("ok".to_string()));
        assert_eq!(load_template(dir.path(), "missing.tex").unwrap(), None);
        let err = load_template(dir.path(), "sub/../../part.tex").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TemplateNotFound);
        assert!(err.to_string().contains("escapes"));
    }

    #[test]
    fn test_safe_join() {
        let root = Path::new("/tpl");
        assert_eq!(safe_join(root, "a/./b.tex"), Some(PathBuf::from("/tpl/a/b.tex")));
        assert_eq!(safe_join(root, "../b.tex"), None);
        assert_eq!(safe_join(root, "/etc/passwd"), None);
    }

    #[test]
    fn test_late_filter_names_skip_engine_filters() {
        let names = late_filter_names("<?= x | upper | shout ?> <?= y|fmt ?>");
        assert!(names.contains("shout"));
        assert!(names.contains("fmt"));
        assert!(!names.contains("upper"));
    }

    #[test]
    fn test_late_filter_names_skip_inline_code() {
        let source = "<? rhai ?>\nfilter(\"tag\", |s| s);\n<? endrhai ?>\n<?= x | tag ?>";
        let names = late_filter_names(source);
        assert!(names.contains("tag"));
        assert!(!names.contains("s"));
    }

    // =========================================================================
    // Failures
    // =========================================================================

    #[test]
    #[serial]
    fn test_missing_input_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = renderer()
            .render_to_string(&dir.path().join("none.t.tex"))
            .unwrap_err();
        assert!(matches!(err, RenderError::Io { .. }));
    }

    #[test]
    #[serial]
    fn test_undefined_filter_names_file() {
        let dir = TempDir::new().unwrap();
        let input = write(&dir, "bad.t.tex", "<?= 1 | nosuch ?>");
        let err = renderer().render_to_string(&input).unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("Error rendering"));
        assert!(msg.contains("bad.t.tex"));
    }

    #[test]
    #[serial]
    fn test_block_error_reports_line_and_restores_directory() {
        let dir = TempDir::new().unwrap();
        let source = "first\n<? rhai ?>\nlet a = 1;\nthrow \"boom\";\n<? endrhai ?>\n";
        let input = write(&dir, "t.t.tex", source);
        let before = std::env::current_dir().unwrap();

        let err = renderer().render_to_string(&input).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("boom"), "unexpected message: {}", msg);
        assert!(msg.contains("line 4"), "unexpected message: {}", msg);
        assert_eq!(std::env::current_dir().unwrap(), before);
    }

    #[test]
    #[serial]
    fn test_builtins_follow_options() {
        let dir = TempDir::new().unwrap();
        let input = write(&dir, "t.t.tex", "<?= abs is defined ?>");

        let on = renderer().render_to_string(&input).unwrap();
        assert_eq!(body(&on), "True");

        let options = RenderOptions {
            builtins: BuiltinsConfig::disabled(),
            ..RenderOptions::default()
        };
        let off = Renderer::new(FilterRegistry::new(), options)
            .render_to_string(&input)
            .unwrap();
        assert_eq!(body(&off), "False");
    }
}
