//! ADP template engine.
//!
//! Templates interleave literal HTML with embedded scripts. They parse
//! into block streams ([`code::AdpCode`]), are cached server-wide by
//! filesystem identity, compiled per evaluator, optionally result-cached
//! with expiration, and executed with nested call frames.

pub mod code;
pub mod config;
pub mod eval;
pub mod page;
pub mod parser;
pub mod tags;

pub use code::{AdpCode, AdpFlags, Block, BlockKind};
pub use config::AdpConfig;
pub use eval::{AdpEngine, AdpException, AdpShared};
pub use tags::{TagKind, TagRegistry};

use thiserror::Error;

pub type AdpResult<T> = Result<T, AdpError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdpError {
    #[error("could not {op} \"{path}\": {detail}")]
    File {
        op: &'static str,
        path: String,
        detail: String,
    },

    #[error("not an ordinary file: {0}")]
    NotAFile(String),

    #[error("inconsistent file: {0}")]
    InconsistentFile(String),

    #[error(transparent)]
    Script(#[from] alder_script::ScriptError),

    #[error("adp evaluation aborted")]
    Aborted,

    #[error("adp evaluation timed out")]
    Timeout,
}
