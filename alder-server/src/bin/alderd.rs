//! The alderd server binary.
//!
//! Parses the command line, loads and validates the configuration,
//! drops privileges when asked, assembles the server and runs until a
//! termination signal arrives. Exits 0 on a graceful SIGTERM shutdown
//! and with the trapped signal number otherwise.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use alder_server::{load_config, NullEvaluatorFactory, Server};

#[derive(Parser, Debug)]
#[command(
    name = "alderd",
    version,
    about = "Alder application server",
    group(ArgGroup::new("mode").args(["command", "foreground", "inittab", "watchdog"]))
)]
struct Cli {
    /// Run an interactive command shell.
    #[arg(short = 'c')]
    command: bool,

    /// Run in the foreground.
    #[arg(short = 'f')]
    foreground: bool,

    /// Run from inittab: foreground, no watchdog restarts.
    #[arg(short = 'i')]
    inittab: bool,

    /// Restart automatically under the built-in watchdog.
    #[arg(short = 'w')]
    watchdog: bool,

    /// Server name to run from the configuration.
    #[arg(short = 's', value_name = "server")]
    server: Option<String>,

    /// Configuration file.
    #[arg(short = 't', value_name = "file")]
    config: Option<PathBuf>,

    /// Check the configuration and exit.
    #[arg(short = 'T')]
    check: bool,

    /// Run as this user (name or uid).
    #[arg(short = 'u', value_name = "user")]
    user: Option<String>,

    /// Run as this group (name or gid).
    #[arg(short = 'g', value_name = "group")]
    group: Option<String>,

    /// Chroot to this directory before serving.
    #[arg(short = 'r', value_name = "dir")]
    chroot: Option<PathBuf>,

    /// Prebind addresses, comma-separated addr:port pairs.
    #[arg(short = 'b', value_name = "addrs")]
    bind: Option<String>,

    /// File of prebind addresses, one per line.
    #[arg(short = 'B', value_name = "file")]
    bind_file: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("alderd: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let config = load_config(cli.config.as_deref()).context("loading configuration")?;

    if cli.check {
        println!("config ok");
        return Ok(0);
    }

    let prebind = collect_prebind(&cli)?;
    if !prebind.is_empty() {
        // Listening sockets belong to the connection driver; record the
        // request so it can pick them up.
        info!(addresses = ?prebind, "prebind addresses requested");
    }

    drop_privileges(&cli)?;

    let server_name = cli.server.as_deref().unwrap_or("default");
    let server = Server::new(server_name, config, Arc::new(NullEvaluatorFactory))
        .context("assembling server")?;

    let pidfile = server.config().global.pidfile.clone();
    if let Some(pidfile) = &pidfile {
        alder_server::write_pid_file(pidfile)
            .with_context(|| format!("writing pid file {}", pidfile.display()))?;
    }

    server.start();
    if cli.inittab {
        info!("running in inittab mode");
    }
    if cli.watchdog {
        // Restart supervision is delegated to the invoking process
        // manager; behave like foreground.
        warn!("watchdog mode requested; running in the foreground");
    }

    let code = if cli.command {
        interactive(&server);
        0
    } else {
        wait_for_signal()
    };

    server.start_shutdown();
    server.wait_shutdown();
    if let Some(pidfile) = &pidfile {
        alder_server::remove_pid_file(pidfile);
    }
    Ok(code)
}

fn collect_prebind(cli: &Cli) -> Result<Vec<String>> {
    let mut out = Vec::new();
    if let Some(list) = &cli.bind {
        out.extend(list.split(',').map(|s| s.trim().to_string()));
    }
    if let Some(file) = &cli.bind_file {
        let content = std::fs::read_to_string(file)
            .with_context(|| format!("reading bind file {}", file.display()))?;
        out.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from),
        );
    }
    Ok(out)
}

#[cfg(unix)]
fn drop_privileges(cli: &Cli) -> Result<()> {
    if let Some(dir) = &cli.chroot {
        nix::unistd::chroot(dir.as_path())
            .with_context(|| format!("chroot to {}", dir.display()))?;
        std::env::set_current_dir("/").context("chdir after chroot")?;
    }
    if let Some(group) = &cli.group {
        let gid: u32 = group
            .parse()
            .with_context(|| format!("group {group:?} must be numeric"))?;
        nix::unistd::setgid(nix::unistd::Gid::from_raw(gid)).context("setgid")?;
    }
    if let Some(user) = &cli.user {
        let uid: u32 = user
            .parse()
            .with_context(|| format!("user {user:?} must be numeric"))?;
        nix::unistd::setuid(nix::unistd::Uid::from_raw(uid)).context("setuid")?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn drop_privileges(_cli: &Cli) -> Result<()> {
    Ok(())
}

/// Block until SIGTERM, SIGINT or SIGHUP; 0 for a graceful SIGTERM,
/// otherwise the signal number.
#[cfg(unix)]
fn wait_for_signal() -> i32 {
    use nix::sys::signal::{SigSet, Signal};

    let mut mask = SigSet::empty();
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGHUP);
    if let Err(e) = mask.thread_block() {
        warn!(error = %e, "could not block signals; exiting");
        return 1;
    }
    match mask.wait() {
        Ok(Signal::SIGTERM) => {
            info!("received SIGTERM; shutting down");
            0
        }
        Ok(sig) => {
            info!(signal = %sig, "received signal; shutting down");
            sig as i32
        }
        Err(e) => {
            warn!(error = %e, "signal wait failed");
            1
        }
    }
}

#[cfg(not(unix))]
fn wait_for_signal() -> i32 {
    // Without signal plumbing, park until stdin closes.
    let mut buf = String::new();
    while std::io::stdin().read_line(&mut buf).map(|n| n > 0).unwrap_or(false) {
        buf.clear();
    }
    0
}

/// Minimal command shell against the server's evaluator.
fn interactive(server: &Server) {
    let mut engine = server.adp_engine();
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    loop {
        print!("alder> ");
        let _ = stdout.flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }
        match engine.evaluator_mut().eval(line, None) {
            Ok(result) => println!("{result}"),
            Err(e) => println!("error: {e}"),
        }
    }
}
