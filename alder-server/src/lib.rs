//! Server wiring for the alder runtime.
//!
//! Pulls the subsystem crates together: configuration schema and
//! loading, URL-to-file mapping, the socket scripting interfaces, and
//! the [`Server`] assembly used by the `alderd` binary.

pub mod config;
pub mod server;
pub mod sock;
pub mod urlmap;

pub use config::{load_config, ConfigError, ConfigResult, ServerConfig};
pub use server::{remove_pid_file, write_pid_file, NullEvaluatorFactory, Server};
pub use urlmap::url_to_file;
