//! Template execution: nested frames, per-evaluator compiled caches, and
//! the result cache.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use globset::Glob;
use tracing::{debug, warn};

use alder_base::Time;
use alder_script::{CompiledScript, Evaluator, OutputSink, ScriptOrigin};

use crate::code::{AdpCode, AdpFlags, BlockKind};
use crate::config::AdpConfig;
use crate::page::{read_file, AdpCache, FileStat, Page, PageCache};
use crate::tags::TagRegistry;
use crate::{parser, AdpError, AdpResult};

/// Control flow raised by page scripts or the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdpException {
    #[default]
    Ok,
    /// Return from the current frame.
    Return,
    /// Stop rendering the current page.
    Break,
    /// Abandon the whole evaluation.
    Abort,
    /// The evaluator reported a timeout.
    Timeout,
}

/// Server-wide template state shared by all evaluator engines.
pub struct AdpShared {
    pub tags: TagRegistry,
    pub config: AdpConfig,
    pub(crate) pages: PageCache,
}

impl AdpShared {
    pub fn new(config: AdpConfig) -> Arc<Self> {
        Arc::new(AdpShared {
            tags: TagRegistry::new(),
            config: config.normalized(),
            pages: PageCache::new(),
        })
    }

    /// Drop a shared page, forcing the next use to re-parse.
    pub fn flush_page(&self, path: &Path) {
        self.pages.flush(path);
    }
}

type Objs = Vec<Option<Box<dyn CompiledScript>>>;

fn empty_objs(n: usize) -> Objs {
    let mut v = Vec::with_capacity(n);
    v.resize_with(n, || None);
    v
}

/// Per-engine view of a shared page plus compiled script handles.
struct InterpPage {
    page: Arc<Page>,
    objs: Objs,
    cache_objs: Objs,
    cache_gen: u64,
    last_used: u64,
}

struct Frame {
    file: Option<PathBuf>,
    cwd: Option<PathBuf>,
    #[allow(dead_code)]
    args: Vec<String>,
    output: OutputSink,
    err_logged: bool,
}

enum ObjsKind {
    Page,
    Cache,
}

/// One worker's template engine, wrapping its private evaluator.
pub struct AdpEngine {
    shared: Arc<AdpShared>,
    evaluator: Box<dyn Evaluator>,
    pages: HashMap<PathBuf, InterpPage>,
    pages_size: usize,
    use_counter: u64,
    frames: Vec<Frame>,
    exception: AdpException,
    error_level: u32,
    /// Execution flags; starts from the configured defaults.
    pub flags: AdpFlags,
}

impl AdpEngine {
    pub fn new(shared: Arc<AdpShared>, evaluator: Box<dyn Evaluator>) -> Self {
        let flags = shared.config.flags;
        AdpEngine {
            shared,
            evaluator,
            pages: HashMap::new(),
            pages_size: 0,
            use_counter: 0,
            frames: Vec::new(),
            exception: AdpException::Ok,
            error_level: 0,
            flags,
        }
    }

    pub fn evaluator_mut(&mut self) -> &mut dyn Evaluator {
        self.evaluator.as_mut()
    }

    /// Raise an ADP control-flow exception from a binding.
    pub fn raise(&mut self, exception: AdpException) {
        self.exception = exception;
    }

    /// Evaluate `arg0` as a template string, or as a file when the
    /// `adpfile` flag is set.
    pub fn eval(&mut self, arg0: &str, args: &[String], expires: Option<Time>) -> AdpResult<String> {
        if self.flags.adpfile {
            self.run_file(Path::new(arg0), args, expires)
        } else {
            self.eval_string(arg0, args)
        }
    }

    /// Evaluate an inline template string.
    pub fn eval_string(&mut self, template: &str, args: &[String]) -> AdpResult<String> {
        let code = parser::parse(&self.shared.tags, template, self.flags, "<inline>");
        let sink = self.new_sink();
        let result = self.exec(&code, None, None, args.to_vec(), &sink);
        self.finish(result, &sink)
    }

    /// Evaluate a file with optional result caching and return its
    /// rendered output.
    pub fn run_file(
        &mut self,
        file: &Path,
        args: &[String],
        expires: Option<Time>,
    ) -> AdpResult<String> {
        let sink = self.new_sink();
        let result = self.source_into(file, args, expires, &sink);
        self.finish(result, &sink)
    }

    /// Evaluate a file into the current frame's output buffer.
    pub fn include(
        &mut self,
        file: &Path,
        args: &[String],
        expires: Option<Time>,
    ) -> AdpResult<()> {
        let sink = match self.frames.last() {
            Some(frame) => frame.output.clone(),
            None => self.new_sink(),
        };
        self.source_into(file, args, expires, &sink)
    }

    fn new_sink(&self) -> OutputSink {
        Arc::new(parking_lot::Mutex::new(String::with_capacity(
            self.shared.config.bufsize.min(64 * 1024),
        )))
    }

    /// Close out a top-level evaluation: map exceptions, reset per-eval
    /// state, and render the configured error page on failure.
    fn finish(&mut self, result: AdpResult<()>, sink: &OutputSink) -> AdpResult<String> {
        let exception = std::mem::take(&mut self.exception);
        match result {
            Ok(()) => match exception {
                AdpException::Abort => Err(AdpError::Aborted),
                AdpException::Timeout => Err(AdpError::Timeout),
                _ => Ok(sink.lock().clone()),
            },
            Err(err) => {
                if self.error_level == 0 {
                    if let Some(errorpage) = self.shared.config.errorpage.clone() {
                        self.error_level += 1;
                        let rendered =
                            self.run_file(&errorpage, &[err.to_string()], None);
                        self.error_level -= 1;
                        match rendered {
                            Ok(out) => return Ok(out),
                            Err(page_err) => {
                                warn!(error = %page_err, "error page itself failed")
                            }
                        }
                    }
                }
                Err(err)
            }
        }
    }

    /// Compose and normalize the absolute path of a template.
    fn resolve(&self, file: &Path) -> PathBuf {
        let mut path = if file.is_absolute() {
            file.to_path_buf()
        } else {
            let base = self
                .frames
                .last()
                .and_then(|f| f.cwd.clone())
                .unwrap_or_else(|| self.shared.config.pageroot.clone());
            base.join(file)
        };
        if path.extension().is_none() {
            if let Some(ext) = &self.shared.config.defaultextension {
                path.set_extension(ext.trim_start_matches('.'));
            }
        }
        normalize_path(&path)
    }

    /// Debug hook: when enabled and the basename matches the configured
    /// pattern, run the debug initializer before the page.
    fn maybe_debug(&mut self, path: &Path) -> AdpResult<()> {
        if !self.shared.config.enabledebug {
            return Ok(());
        }
        let Some(pattern) = &self.shared.config.debug_pattern else {
            return Ok(());
        };
        let matches = Glob::new(pattern)
            .map(|g| {
                path.file_name()
                    .map(|name| g.compile_matcher().is_match(name))
                    .unwrap_or(false)
            })
            .unwrap_or(false);
        if !matches {
            return Ok(());
        }
        let script = format!("{} {}", self.shared.config.debuginit, path.display());
        if let Err(err) = self.evaluator.eval(&script, None) {
            warn!(error = %err, "debug init failed; aborting page");
            self.exception = AdpException::Abort;
            return Err(AdpError::Script(err));
        }
        Ok(())
    }

    /// Resolve, load and execute a file into `sink`, honoring the
    /// result cache when enabled.
    fn source_into(
        &mut self,
        file: &Path,
        args: &[String],
        expires: Option<Time>,
        sink: &OutputSink,
    ) -> AdpResult<()> {
        let path = self.resolve(file);
        self.maybe_debug(&path)?;

        let md = std::fs::metadata(&path).map_err(|e| AdpError::File {
            op: "stat",
            path: path.display().to_string(),
            detail: e.to_string(),
        })?;
        if !md.is_file() {
            return Err(AdpError::NotAFile(path.display().to_string()));
        }
        let stat = FileStat::of(&md);
        let key = self.flags.parse_key();

        let valid = self
            .pages
            .get(&path)
            .map(|ip| ip.page.stat == stat && ip.page.parse_key == key)
            .unwrap_or(false);
        if !valid {
            if let Some(stale) = self.pages.remove(&path) {
                self.pages_size -= stale.page.code.size();
            }
            let shared = Arc::clone(&self.shared);
            let flags = self.flags;
            let parse_path = path.clone();
            let page = self.shared.pages.get(&path, stat, key, || {
                let (text, fresh_stat) = read_file(&parse_path)?;
                let code = parser::parse(
                    &shared.tags,
                    &text,
                    flags,
                    &parse_path.display().to_string(),
                );
                Ok(Page::new(parse_path.clone(), fresh_stat, key, code))
            })?;
            self.pages_size += page.code.size();
            let nscripts = page.code.nscripts();
            self.pages.insert(
                path.clone(),
                InterpPage {
                    page,
                    objs: empty_objs(nscripts),
                    cache_objs: Vec::new(),
                    cache_gen: 0,
                    last_used: 0,
                },
            );
            self.evict_pages(&path);
        }

        self.use_counter += 1;
        let counter = self.use_counter;
        let page = {
            let entry = self.pages.get_mut(&path).unwrap_or_else(|| unreachable!());
            entry.last_used = counter;
            Arc::clone(&entry.page)
        };

        let use_cache = self.flags.cache && expires.is_some();
        if !use_cache {
            let result =
                self.exec_with_objs(&path, ObjsKind::Page, &page.code, Some(&page.path), args, sink);
            page.dynamic.lock().evals += 1;
            return result;
        }

        // Result-cache path: wait out a rebuild in progress, expire a
        // stale entry, rebuild at most once at a time.
        let mut selected;
        let mut gen;
        {
            let mut dynamic = page.dynamic.lock();
            while dynamic.cache.is_none() && dynamic.locked {
                page.cache_cond.wait(&mut dynamic);
            }
            if let Some(cache) = dynamic.cache.clone() {
                if !dynamic.locked && cache.expires < Time::now() {
                    dynamic.locked = true;
                    dynamic.cache = None;
                }
            }
            if dynamic.cache.is_none() {
                // We are the rebuilder.
                dynamic.locked = true;
            }
            selected = dynamic.cache.clone();
            gen = dynamic.cache_gen;
        }

        if selected.is_none() {
            // Render into a scratch buffer, then re-parse the rendered
            // output as the cached code.
            let scratch = self.new_sink();
            let run = self.exec_with_objs(
                &path,
                ObjsKind::Page,
                &page.code,
                Some(&page.path),
                args,
                &scratch,
            );
            let mut rebuilt = None;
            if run.is_ok() && self.flags.cache {
                let rendered = scratch.lock().clone();
                let mut cache_flags = self.flags;
                cache_flags.tclfile = false;
                let code = parser::parse(
                    &self.shared.tags,
                    &rendered,
                    cache_flags,
                    &path.display().to_string(),
                );
                let mut expires_abs = Time::now();
                let rel = expires.unwrap_or_default();
                expires_abs.incr(rel.sec, i64::from(rel.usec));
                rebuilt = Some(Arc::new(AdpCache {
                    expires: expires_abs,
                    code,
                }));
            }
            {
                let mut dynamic = page.dynamic.lock();
                if let Some(cache) = rebuilt {
                    dynamic.cache_gen += 1;
                    dynamic.cache = Some(cache);
                }
                dynamic.locked = false;
                selected = dynamic.cache.clone();
                gen = dynamic.cache_gen;
                page.cache_cond.notify_all();
            }
            run?;
        }

        let result = match selected {
            None => self.exec_with_objs(
                &path,
                ObjsKind::Page,
                &page.code,
                Some(&page.path),
                args,
                sink,
            ),
            Some(cache) => {
                {
                    let entry = self.pages.get_mut(&path).unwrap_or_else(|| unreachable!());
                    if entry.cache_gen != gen || entry.cache_objs.len() != cache.code.nscripts() {
                        entry.cache_objs = empty_objs(cache.code.nscripts());
                        entry.cache_gen = gen;
                    }
                }
                self.exec_with_objs(&path, ObjsKind::Cache, &cache.code, Some(&page.path), args, sink)
            }
        };
        page.dynamic.lock().evals += 1;
        result
    }

    /// Run `code`, caching compiled handles in the page's object array.
    fn exec_with_objs(
        &mut self,
        path: &Path,
        kind: ObjsKind,
        code: &AdpCode,
        file: Option<&Path>,
        args: &[String],
        sink: &OutputSink,
    ) -> AdpResult<()> {
        let mut objs = match self.pages.get_mut(path) {
            Some(entry) => Some(match kind {
                ObjsKind::Page => std::mem::take(&mut entry.objs),
                ObjsKind::Cache => std::mem::take(&mut entry.cache_objs),
            }),
            None => None,
        };
        let result = self.exec(code, objs.as_mut(), file, args.to_vec(), sink);
        if let (Some(objs), Some(entry)) = (objs, self.pages.get_mut(path)) {
            match kind {
                ObjsKind::Page => entry.objs = objs,
                ObjsKind::Cache => entry.cache_objs = objs,
            }
        }
        result
    }

    /// Execute a block stream in a fresh frame.
    fn exec(
        &mut self,
        code: &AdpCode,
        mut objs: Option<&mut Objs>,
        file: Option<&Path>,
        args: Vec<String>,
        sink: &OutputSink,
    ) -> AdpResult<()> {
        self.frames.push(Frame {
            file: file.map(Path::to_path_buf),
            cwd: file.and_then(|f| f.parent().map(Path::to_path_buf)),
            args,
            output: sink.clone(),
            err_logged: false,
        });
        self.evaluator.set_output_sink(Some(sink.clone()));

        let origin_file = file
            .map(|f| f.display().to_string())
            .unwrap_or_else(|| "<inline>".to_string());
        let mut result = Ok(());
        let mut nscript = 0usize;

        for (block, text) in code.blocks() {
            if self.exception != AdpException::Ok {
                break;
            }
            if self.flags.trace {
                let limit = self.shared.config.tracesize;
                let shown: String = text.chars().take(limit).collect();
                debug!(kind = ?block.kind, line = block.line, payload = %shown, "adp block");
            }
            match block.kind {
                BlockKind::Text => {
                    sink.lock().push_str(text);
                }
                BlockKind::Script | BlockKind::AppendScript => {
                    let origin = ScriptOrigin::new(origin_file.clone(), block.line);
                    let outcome = match objs.as_deref_mut() {
                        Some(objs) => {
                            if objs[nscript].is_none() {
                                match self.evaluator.compile(text, Some(&origin)) {
                                    Ok(compiled) => objs[nscript] = Some(compiled),
                                    Err(err) => {
                                        nscript += 1;
                                        self.handle_script_error(err, &mut result, sink);
                                        if result.is_err() {
                                            break;
                                        }
                                        continue;
                                    }
                                }
                            }
                            let compiled = objs[nscript]
                                .as_ref()
                                .unwrap_or_else(|| unreachable!())
                                .as_ref();
                            self.evaluator.eval_compiled(compiled)
                        }
                        None => self.evaluator.eval(text, Some(&origin)),
                    };
                    nscript += 1;
                    match outcome {
                        Ok(value) => {
                            if block.kind == BlockKind::AppendScript {
                                sink.lock().push_str(&value);
                            }
                        }
                        Err(err) => {
                            self.handle_script_error(err, &mut result, sink);
                            if result.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        // A return exception ends at its frame; the caller continues.
        if self.exception == AdpException::Return {
            self.exception = AdpException::Ok;
        }

        self.frames.pop();
        let previous = self.frames.last().map(|f| f.output.clone());
        self.evaluator.set_output_sink(previous);
        result
    }

    fn handle_script_error(
        &mut self,
        err: alder_script::ScriptError,
        result: &mut AdpResult<()>,
        sink: &OutputSink,
    ) {
        if err.is_timeout() {
            self.exception = AdpException::Timeout;
            return;
        }
        if self.exception != AdpException::Ok {
            return;
        }
        let trace = if self.flags.detailerror {
            self.frame_trace()
        } else {
            String::new()
        };
        if let Some(frame) = self.frames.last_mut() {
            if !frame.err_logged {
                frame.err_logged = true;
                warn!(error = %err, frames = %trace, "adp script error");
            }
        }
        if self.flags.displayerror {
            let mut out = sink.lock();
            out.push_str("<!-- adp error: ");
            out.push_str(&err.info);
            out.push_str(" -->");
        }
        if self.flags.strict {
            *result = Err(AdpError::Script(err));
        }
    }

    /// Render the frame stack for detailed error messages.
    fn frame_trace(&self) -> String {
        let mut out = String::new();
        for frame in self.frames.iter().rev() {
            if !out.is_empty() {
                out.push_str(" <- ");
            }
            match &frame.file {
                Some(file) => out.push_str(&file.display().to_string()),
                None => out.push_str("<inline>"),
            }
        }
        out
    }

    /// Keep the per-engine page cache inside its byte budget.
    fn evict_pages(&mut self, keep: &Path) {
        while self.pages_size > self.shared.config.cachesize && self.pages.len() > 1 {
            let victim = self
                .pages
                .iter()
                .filter(|(path, _)| path.as_path() != keep)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(path, _)| path.clone());
            let Some(victim) = victim else {
                break;
            };
            if let Some(entry) = self.pages.remove(&victim) {
                self.pages_size -= entry.page.code.size();
                debug!(path = %victim.display(), "evicted page from evaluator cache");
            }
        }
    }
}

/// Lexically normalize a path, resolving `.` and `..` components.
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
