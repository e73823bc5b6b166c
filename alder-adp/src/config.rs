//! ADP engine configuration.

use std::path::PathBuf;

use crate::code::AdpFlags;

/// Tuning and behavior knobs for the template engine.
#[derive(Debug, Clone)]
pub struct AdpConfig {
    /// Template evaluated when a top-level page errors.
    pub errorpage: Option<PathBuf>,
    /// Template evaluated at server startup.
    pub startpage: Option<PathBuf>,
    /// Debug initializer proc name.
    pub debuginit: String,
    /// Max bytes logged per traced block.
    pub tracesize: usize,
    /// Byte bound of the per-evaluator page cache.
    pub cachesize: usize,
    /// Initial output buffer size.
    pub bufsize: usize,
    /// Extension appended to extensionless template paths.
    pub defaultextension: Option<String>,
    /// Root for relative template paths outside any frame.
    pub pageroot: PathBuf,
    /// Default execution flags for new evaluations.
    pub flags: AdpFlags,
    /// Allow the debug hook.
    pub enabledebug: bool,
    /// Basename glob selecting files that trigger the debug hook.
    pub debug_pattern: Option<String>,
}

pub const MIN_CACHE_SIZE: usize = 1000 * 1024;
pub const MIN_BUF_SIZE: usize = 100 * 1024;

impl Default for AdpConfig {
    fn default() -> Self {
        let mut flags = AdpFlags::default();
        flags.detailerror = true;
        flags.autoabort = true;
        AdpConfig {
            errorpage: None,
            startpage: None,
            debuginit: "adp_debuginit".to_string(),
            tracesize: 40,
            cachesize: 5 * 1024 * 1024,
            bufsize: 1024 * 1024,
            defaultextension: None,
            pageroot: PathBuf::from("."),
            flags,
            enabledebug: false,
            debug_pattern: None,
        }
    }
}

impl AdpConfig {
    /// Clamp sizes to their documented minimums.
    pub fn normalized(mut self) -> Self {
        self.cachesize = self.cachesize.max(MIN_CACHE_SIZE);
        self.bufsize = self.bufsize.max(MIN_BUF_SIZE);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_clamps_minimums() {
        let config = AdpConfig {
            cachesize: 10,
            bufsize: 10,
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.cachesize, MIN_CACHE_SIZE);
        assert_eq!(config.bufsize, MIN_BUF_SIZE);
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = AdpConfig::default();
        assert_eq!(config.tracesize, 40);
        assert_eq!(config.debuginit, "adp_debuginit");
        assert!(config.flags.detailerror);
        assert!(config.flags.autoabort);
        assert!(!config.flags.strict);
    }
}
