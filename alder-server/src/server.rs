//! Server assembly: wire the configuration into the runtime subsystems
//! and manage their lifecycle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use alder_adp::{AdpConfig, AdpEngine, AdpShared};
use alder_base::Time;
use alder_fastpath::{FastPath, FastPathConfig};
use alder_jobs::{JobPool, JobsConfig};
use alder_limits::{Limits, LimitsRegistry, LimitsValues};
use alder_sched::{SchedConfig, Scheduler};
use alder_script::{
    CompiledScript, Evaluator, EvaluatorFactory, InterruptHandle, OutputSink, ScriptError,
    ScriptOrigin, ScriptResult,
};

use crate::config::{self, ConfigError, ConfigResult, ServerConfig};
use crate::urlmap::url_to_file;

/// A fully wired server instance.
pub struct Server {
    name: String,
    config: ServerConfig,
    factory: Arc<dyn EvaluatorFactory>,
    page_root: PathBuf,
    pub limits: Arc<LimitsRegistry>,
    pub scheduler: Scheduler,
    pub jobs: JobPool,
    pub adp: Arc<AdpShared>,
    pub fastpath: Arc<FastPath>,
}

impl Server {
    pub fn new(
        name: &str,
        config: ServerConfig,
        factory: Arc<dyn EvaluatorFactory>,
    ) -> ConfigResult<Self> {
        config::validate(&config)?;

        alder_base::sync::set_lock_trace(config.global.mutexlocktrace);
        if config.global.reverseproxymode.enabled {
            let installed =
                alder_net::set_trusted_proxies(&config.global.reverseproxymode.trustedservers);
            info!(installed, "trusted proxy table configured");
        }

        let caching = config.caching_enabled();
        if !caching {
            info!("caching mode none: page, result and file caches disabled");
        }
        let page_root = compute_page_root(&config);

        let limits = Arc::new(LimitsRegistry::new());
        for (limits_name, section) in &config.limits {
            let mut values = LimitsValues::default();
            if let Some(v) = section.maxrun {
                values.max_run = v;
            }
            if let Some(v) = section.maxwait {
                values.max_wait = v;
            }
            if let Some(v) = section.maxupload {
                values.max_upload = v;
            }
            if let Some(v) = section.timeout {
                values.timeout = v;
            }
            limits.set(limits_name, values);
            for registration in &section.register {
                limits
                    .register(
                        name,
                        limits_name,
                        &registration.method,
                        &registration.url,
                        registration.noinherit,
                    )
                    .map_err(|e| ConfigError::Invalid {
                        key: "limits.register",
                        detail: e.to_string(),
                    })?;
            }
        }

        let scheduler = Scheduler::new(SchedConfig {
            jobs_per_thread: config.sched.jobsperthread,
            max_elapsed: Time::from_secs(config.sched.maxelapsed as i64),
        });

        let jobs = JobPool::new(
            Arc::clone(&factory),
            JobsConfig {
                jobs_per_thread: config.jobs.jobsperthread,
                timeout: Time::from_secs(config.jobs.timeout as i64),
                log_min_duration: Time::from_millis(config.jobs.logminduration as i64),
            },
        );

        let adp = AdpShared::new(adp_config(&config, &page_root, caching));

        let fastpath_config = fastpath_config(&config, caching);
        let root = page_root.clone();
        let fastpath = Arc::new(FastPath::new(
            fastpath_config,
            Box::new(move |url| url_to_file(&root, url)),
        ));

        Ok(Server {
            name: name.to_string(),
            config,
            factory,
            page_root,
            limits,
            scheduler,
            jobs,
            adp,
            fastpath,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn page_root(&self) -> &Path {
        &self.page_root
    }

    /// Allocate a template engine bound to a fresh evaluator.
    pub fn adp_engine(&self) -> AdpEngine {
        AdpEngine::new(Arc::clone(&self.adp), self.factory.create())
    }

    /// Resolve the limits governing a request.
    pub fn request_limits(&self, method: &str, url: &str) -> Arc<Limits> {
        self.limits.find(&self.name, method, url)
    }

    /// Start background subsystems and run the configured start page.
    pub fn start(&self) {
        self.scheduler.start();
        if let Some(startpage) = self.config.adp.startpage.clone() {
            let mut engine = self.adp_engine();
            match engine.run_file(&startpage, &[], None) {
                Ok(_) => info!(page = %startpage.display(), "start page evaluated"),
                Err(e) => warn!(page = %startpage.display(), error = %e, "start page failed"),
            }
        }
        info!(server = %self.name, "server started");
    }

    /// Flag all subsystems for shutdown.
    pub fn start_shutdown(&self) {
        self.jobs.start_shutdown();
        self.scheduler.start_shutdown();
    }

    /// Wait for subsystems to wind down within the configured timeout.
    pub fn wait_shutdown(&self) {
        let deadline = Time::from_secs(self.config.global.shutdowntimeout as i64);
        self.jobs.wait_shutdown(deadline);
        self.scheduler.wait_shutdown(deadline);
        info!(server = %self.name, "server shut down");
    }
}

fn compute_page_root(config: &ServerConfig) -> PathBuf {
    let base = match &config.fastpath.serverdir {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => config.global.home.join(dir),
        None => config.global.home.clone(),
    };
    if config.fastpath.pagedir.is_absolute() {
        config.fastpath.pagedir.clone()
    } else {
        base.join(&config.fastpath.pagedir)
    }
}

fn adp_config(config: &ServerConfig, page_root: &Path, caching: bool) -> AdpConfig {
    let section = &config.adp;
    let mut adp = AdpConfig {
        errorpage: section.errorpage.clone(),
        startpage: section.startpage.clone(),
        debuginit: section.debuginit.clone(),
        tracesize: section.tracesize,
        cachesize: section.cachesize,
        bufsize: section.bufsize,
        defaultextension: section.defaultextension.clone(),
        pageroot: page_root.to_path_buf(),
        enabledebug: section.enabledebug,
        debug_pattern: section.debugpattern.clone(),
        ..Default::default()
    };
    adp.flags.cache = section.cache && caching;
    adp.flags.safe = section.safeeval;
    adp.flags.single = section.singlescript;
    adp.flags.trace = section.trace;
    adp.flags.detailerror = section.detailerror;
    adp.flags.strict = section.stricterror;
    adp.flags.displayerror = section.displayerror;
    adp.flags.trimspace = section.trimspace;
    adp.flags.autoabort = section.autoabort;
    adp.flags.expire = section.enableexpire;
    adp
}

fn fastpath_config(config: &ServerConfig, caching: bool) -> FastPathConfig {
    let section = &config.fastpath;
    FastPathConfig {
        mmap: section.mmap,
        gzip_static: section.gzip_static,
        gzip_refresh: section.gzip_refresh,
        gzip_refresh_cmd: section.gzip_cmd.clone(),
        cache: section.cache && caching,
        cachemaxsize: section.cachemaxsize,
        cachemaxentry: section.cachemaxentry,
        directoryfile: section.directoryfile.clone(),
        directoryadp: section.directoryadp.clone(),
        directoryproc: section.directoryproc.clone(),
    }
}

/// Write the process id to the configured PID file.
pub fn write_pid_file(path: &Path) -> std::io::Result<()> {
    std::fs::write(path, format!("{}\n", std::process::id()))
}

pub fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "could not remove pid file");
    }
}

/// Evaluator used when no interpreter module is loaded; every script
/// fails with a clear message, which keeps the file-serving paths fully
/// functional.
pub struct NullEvaluatorFactory;

impl EvaluatorFactory for NullEvaluatorFactory {
    fn create(&self) -> Box<dyn Evaluator> {
        Box::new(NullEvaluator {
            interrupt: InterruptHandle::new(),
        })
    }
}

struct NullEvaluator {
    interrupt: InterruptHandle,
}

impl Evaluator for NullEvaluator {
    fn eval(&mut self, _script: &str, _origin: Option<&ScriptOrigin>) -> ScriptResult<String> {
        Err(ScriptError::error("no interpreter module is loaded"))
    }

    fn compile(
        &mut self,
        _script: &str,
        _origin: Option<&ScriptOrigin>,
    ) -> ScriptResult<Box<dyn CompiledScript>> {
        Err(ScriptError::error("no interpreter module is loaded"))
    }

    fn eval_compiled(&mut self, _script: &dyn CompiledScript) -> ScriptResult<String> {
        Err(ScriptError::error("no interpreter module is loaded"))
    }

    fn set_var(&mut self, _name: &str, _value: &str) {}

    fn get_var(&mut self, _name: &str) -> Option<String> {
        None
    }

    fn set_output_sink(&mut self, _sink: Option<OutputSink>) {}

    fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alder_script::testing::ScriptedEvaluatorFactory;

    fn test_config(home: &Path) -> ServerConfig {
        let mut config = ServerConfig::default();
        config.global.home = home.to_path_buf();
        config
    }

    #[test]
    fn wires_limits_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.limits.insert(
            "api".to_string(),
            crate::config::LimitsSection {
                maxrun: Some(3),
                register: vec![crate::config::LimitsRegistration {
                    method: "GET".to_string(),
                    url: "/api".to_string(),
                    noinherit: false,
                }],
                ..Default::default()
            },
        );
        let server = Server::new(
            "main",
            config,
            ScriptedEvaluatorFactory::new().build(),
        )
        .unwrap();
        let limits = server.request_limits("GET", "/api/users");
        assert_eq!(limits.name, "api");
        assert_eq!(limits.values().max_run, 3);
        assert_eq!(server.request_limits("GET", "/other").name, "default");
    }

    #[test]
    fn page_root_follows_home_serverdir_pagedir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.fastpath.serverdir = Some(PathBuf::from("srv1"));
        let server = Server::new(
            "main",
            config,
            ScriptedEvaluatorFactory::new().build(),
        )
        .unwrap();
        assert_eq!(server.page_root(), dir.path().join("srv1").join("pages"));
    }

    #[test]
    fn caching_mode_none_disables_the_file_cache() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("pages")).unwrap();
        std::fs::write(dir.path().join("pages/f.txt"), "x").unwrap();
        let mut config = test_config(dir.path());
        config.global.cachingmode = "none".to_string();
        let server = Server::new(
            "main",
            config,
            ScriptedEvaluatorFactory::new().build(),
        )
        .unwrap();
        assert_eq!(server.fastpath.cache_stats().entries, 0);
    }

    #[test]
    fn lifecycle_starts_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::new(
            "main",
            test_config(dir.path()),
            ScriptedEvaluatorFactory::new().build(),
        )
        .unwrap();
        server.start();
        server.start_shutdown();
        server.wait_shutdown();
    }

    #[test]
    fn adp_engine_inherits_configured_flags() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.adp.stricterror = true;
        config.adp.trimspace = true;
        let server = Server::new(
            "main",
            config,
            ScriptedEvaluatorFactory::new().build(),
        )
        .unwrap();
        let engine = server.adp_engine();
        assert!(engine.flags.strict);
        assert!(engine.flags.trimspace);
    }
}
