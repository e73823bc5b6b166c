//! Server configuration schema and loading.
//!
//! Configuration loads from a TOML file, then `ALDER_*` environment
//! overrides apply, then the result is validated and clamped. Every
//! field has a default so an empty file is a runnable configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config {path}: {detail}")]
    Io { path: PathBuf, detail: String },

    #[error("could not parse config: {0}")]
    Parse(String),

    #[error("invalid value for {key}: {detail}")]
    Invalid { key: &'static str, detail: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub global: GlobalSection,
    #[serde(default)]
    pub adp: AdpSection,
    #[serde(default)]
    pub fastpath: FastpathSection,
    #[serde(default)]
    pub sched: SchedSection,
    #[serde(default)]
    pub jobs: JobsSection,
    /// Named limits plus their URL registrations.
    #[serde(default)]
    pub limits: BTreeMap<String, LimitsSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSection {
    #[serde(default = "default_home")]
    pub home: PathBuf,
    #[serde(default)]
    pub logdir: Option<PathBuf>,
    #[serde(default)]
    pub bindir: Option<PathBuf>,
    #[serde(default)]
    pub tmpdir: Option<PathBuf>,
    #[serde(default)]
    pub mutexlocktrace: bool,
    #[serde(default)]
    pub formfallbackcharset: Option<String>,
    #[serde(default)]
    pub reverseproxymode: ReverseProxySection,
    /// `full` keeps all caches; `none` disables them.
    #[serde(default = "default_cachingmode")]
    pub cachingmode: String,
    /// 0..=3; how aggressively log files are sanitized.
    #[serde(default = "default_sanitizelogfiles")]
    pub sanitizelogfiles: u8,
    #[serde(default = "default_true")]
    pub rejectalreadyclosedconn: bool,
    /// Seconds granted to subsystems at shutdown.
    #[serde(default = "default_shutdowntimeout")]
    pub shutdowntimeout: u64,
    #[serde(default)]
    pub pidfile: Option<PathBuf>,
}

fn default_home() -> PathBuf {
    PathBuf::from(".")
}

fn default_cachingmode() -> String {
    "full".to_string()
}

fn default_sanitizelogfiles() -> u8 {
    2
}

fn default_true() -> bool {
    true
}

fn default_shutdowntimeout() -> u64 {
    20
}

impl Default for GlobalSection {
    fn default() -> Self {
        GlobalSection {
            home: default_home(),
            logdir: None,
            bindir: None,
            tmpdir: None,
            mutexlocktrace: false,
            formfallbackcharset: None,
            reverseproxymode: ReverseProxySection::default(),
            cachingmode: default_cachingmode(),
            sanitizelogfiles: default_sanitizelogfiles(),
            rejectalreadyclosedconn: true,
            shutdowntimeout: default_shutdowntimeout(),
            pidfile: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReverseProxySection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub skipnonpublic: bool,
    #[serde(default)]
    pub trustedservers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdpSection {
    #[serde(default)]
    pub errorpage: Option<PathBuf>,
    #[serde(default)]
    pub startpage: Option<PathBuf>,
    #[serde(default = "default_debuginit")]
    pub debuginit: String,
    #[serde(default = "default_tracesize")]
    pub tracesize: usize,
    #[serde(default = "default_adp_cachesize")]
    pub cachesize: usize,
    #[serde(default = "default_adp_bufsize")]
    pub bufsize: usize,
    #[serde(default)]
    pub defaultextension: Option<String>,
    #[serde(default)]
    pub cache: bool,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub enableexpire: bool,
    #[serde(default)]
    pub enabledebug: bool,
    #[serde(default)]
    pub debugpattern: Option<String>,
    #[serde(default)]
    pub safeeval: bool,
    #[serde(default)]
    pub singlescript: bool,
    #[serde(default)]
    pub trace: bool,
    #[serde(default = "default_true")]
    pub detailerror: bool,
    #[serde(default)]
    pub stricterror: bool,
    #[serde(default)]
    pub displayerror: bool,
    #[serde(default)]
    pub trimspace: bool,
    #[serde(default = "default_true")]
    pub autoabort: bool,
}

fn default_debuginit() -> String {
    "adp_debuginit".to_string()
}

fn default_tracesize() -> usize {
    40
}

fn default_adp_cachesize() -> usize {
    5 * 1024 * 1024
}

fn default_adp_bufsize() -> usize {
    1024 * 1024
}

impl Default for AdpSection {
    fn default() -> Self {
        AdpSection {
            errorpage: None,
            startpage: None,
            debuginit: default_debuginit(),
            tracesize: default_tracesize(),
            cachesize: default_adp_cachesize(),
            bufsize: default_adp_bufsize(),
            defaultextension: None,
            cache: false,
            stream: false,
            enableexpire: false,
            enabledebug: false,
            debugpattern: None,
            safeeval: false,
            singlescript: false,
            trace: false,
            detailerror: true,
            stricterror: false,
            displayerror: false,
            trimspace: false,
            autoabort: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastpathSection {
    #[serde(default)]
    pub mmap: bool,
    #[serde(default)]
    pub gzip_static: bool,
    #[serde(default)]
    pub gzip_refresh: bool,
    #[serde(default)]
    pub gzip_cmd: Vec<String>,
    #[serde(default = "default_true")]
    pub cache: bool,
    #[serde(default = "default_fp_cachemaxsize")]
    pub cachemaxsize: usize,
    #[serde(default = "default_fp_cachemaxentry")]
    pub cachemaxentry: usize,
    #[serde(default = "default_directoryfile")]
    pub directoryfile: Vec<String>,
    #[serde(default)]
    pub serverdir: Option<PathBuf>,
    #[serde(default = "default_pagedir")]
    pub pagedir: PathBuf,
    #[serde(default = "default_directoryproc")]
    pub directoryproc: Option<String>,
    #[serde(default)]
    pub directoryadp: Option<PathBuf>,
}

fn default_fp_cachemaxsize() -> usize {
    10 * 1024 * 1024
}

fn default_fp_cachemaxentry() -> usize {
    8192
}

fn default_directoryfile() -> Vec<String> {
    ["index.adp", "index.tcl", "index.html", "index.htm"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_pagedir() -> PathBuf {
    PathBuf::from("pages")
}

fn default_directoryproc() -> Option<String> {
    Some("_dirlist".to_string())
}

impl Default for FastpathSection {
    fn default() -> Self {
        FastpathSection {
            mmap: false,
            gzip_static: false,
            gzip_refresh: false,
            gzip_cmd: Vec::new(),
            cache: true,
            cachemaxsize: default_fp_cachemaxsize(),
            cachemaxentry: default_fp_cachemaxentry(),
            directoryfile: default_directoryfile(),
            serverdir: None,
            pagedir: default_pagedir(),
            directoryproc: default_directoryproc(),
            directoryadp: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedSection {
    /// Detached workers exit after this many events; zero keeps them.
    #[serde(default)]
    pub jobsperthread: u32,
    /// Seconds before an inline event run is logged as excessive.
    #[serde(default = "default_maxelapsed")]
    pub maxelapsed: u64,
}

fn default_maxelapsed() -> u64 {
    2
}

impl Default for SchedSection {
    fn default() -> Self {
        SchedSection {
            jobsperthread: 0,
            maxelapsed: default_maxelapsed(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsSection {
    #[serde(default)]
    pub jobsperthread: u32,
    /// Idle worker timeout in seconds; zero waits forever.
    #[serde(default)]
    pub timeout: u64,
    /// Jobs running at least this many milliseconds are logged.
    #[serde(default = "default_logminduration")]
    pub logminduration: u64,
}

fn default_logminduration() -> u64 {
    1000
}

impl Default for JobsSection {
    fn default() -> Self {
        JobsSection {
            jobsperthread: 0,
            timeout: 0,
            logminduration: default_logminduration(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LimitsSection {
    #[serde(default)]
    pub maxrun: Option<u64>,
    #[serde(default)]
    pub maxwait: Option<u64>,
    #[serde(default)]
    pub maxupload: Option<u64>,
    #[serde(default)]
    pub timeout: Option<u64>,
    /// `(method, url-pattern)` registrations for this record.
    #[serde(default)]
    pub register: Vec<LimitsRegistration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsRegistration {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub noinherit: bool,
}

/// Load a configuration file, apply environment overrides, validate.
pub fn load_config(path: Option<&std::path::Path>) -> ConfigResult<ServerConfig> {
    let mut config = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?
        }
        None => ServerConfig::default(),
    };
    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

/// Apply `ALDER_*` environment overrides for the common knobs.
fn apply_env_overrides(config: &mut ServerConfig) {
    if let Ok(home) = std::env::var("ALDER_HOME") {
        config.global.home = PathBuf::from(home);
    }
    if let Ok(mode) = std::env::var("ALDER_CACHINGMODE") {
        config.global.cachingmode = mode;
    }
    if let Ok(tmpdir) = std::env::var("ALDER_TMPDIR") {
        config.global.tmpdir = Some(PathBuf::from(tmpdir));
    }
    if let Ok(value) = std::env::var("ALDER_MUTEXLOCKTRACE") {
        config.global.mutexlocktrace = matches!(value.as_str(), "1" | "true" | "on");
    }
}

pub fn validate(config: &ServerConfig) -> ConfigResult<()> {
    match config.global.cachingmode.as_str() {
        "full" | "none" | "no" => {}
        other => {
            return Err(ConfigError::Invalid {
                key: "global.cachingmode",
                detail: format!("expected full or none, got {other:?}"),
            })
        }
    }
    if config.global.sanitizelogfiles > 3 {
        return Err(ConfigError::Invalid {
            key: "global.sanitizelogfiles",
            detail: format!("expected 0..=3, got {}", config.global.sanitizelogfiles),
        });
    }
    for (name, section) in &config.limits {
        for registration in &section.register {
            if registration.url.is_empty() {
                return Err(ConfigError::Invalid {
                    key: "limits.register.url",
                    detail: format!("empty url pattern for limits {name:?}"),
                });
            }
        }
    }
    Ok(())
}

impl ServerConfig {
    /// Whether the caching subsystems should be active at all.
    pub fn caching_enabled(&self) -> bool {
        self.global.cachingmode == "full"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_valid() {
        let config: ServerConfig = toml::from_str("").unwrap();
        validate(&config).unwrap();
        assert_eq!(config.global.sanitizelogfiles, 2);
        assert!(config.global.rejectalreadyclosedconn);
        assert_eq!(config.global.shutdowntimeout, 20);
        assert_eq!(config.fastpath.pagedir, PathBuf::from("pages"));
        assert_eq!(config.adp.tracesize, 40);
        assert!(config.adp.detailerror);
        assert!(config.adp.autoabort);
    }

    #[test]
    fn sections_parse_from_toml() {
        let config: ServerConfig = toml::from_str(
            r#"
            [global]
            home = "/srv/alder"
            cachingmode = "none"

            [global.reverseproxymode]
            enabled = true
            trustedservers = ["10.0.0.0/8", "192.168.1.1/32"]

            [adp]
            cache = true
            stricterror = true

            [fastpath]
            gzip_static = true
            directoryfile = ["welcome.html"]

            [limits.api]
            maxrun = 5
            register = [{ method = "GET", url = "/api" }]
            "#,
        )
        .unwrap();
        validate(&config).unwrap();
        assert!(!config.caching_enabled());
        assert_eq!(config.global.reverseproxymode.trustedservers.len(), 2);
        assert!(config.adp.stricterror);
        assert_eq!(config.fastpath.directoryfile, vec!["welcome.html"]);
        let api = &config.limits["api"];
        assert_eq!(api.maxrun, Some(5));
        assert_eq!(api.register[0].method, "GET");
    }

    #[test]
    fn bad_cachingmode_is_rejected() {
        let config: ServerConfig = toml::from_str("[global]\ncachingmode = \"half\"\n").unwrap();
        assert!(matches!(
            validate(&config),
            Err(ConfigError::Invalid { key: "global.cachingmode", .. })
        ));
    }
}
