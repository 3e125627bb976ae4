mod bootstrap;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use yktouch_core::{Config, EventBus, ShutdownRegistry};
use yktouch_detect::proxy::TriggerRule;
use yktouch_detect::{gpg, hmac, proxy, u2f};

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Content marker of a key file whose private part lives on the token.
const SHADOWED_KEY_MARKER: &str = "shadowed-private-key";

#[derive(Debug, Default)]
struct Flags {
    verbose: bool,
    libnotify: bool,
    stdout: bool,
    dbus: bool,
    no_socket: bool,
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let flags = parse_flags();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(if flags.verbose { "debug" } else { "info" })
        });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Must run before the first socket is hijacked.
    bootstrap::secure_bootstrap();

    debug!("starting yktouch daemon");

    let config_path = flags
        .config
        .clone()
        .unwrap_or_else(default_config_path);
    let config = load_config(&config_path)?;
    let timing = config.timing;

    let bus = EventBus::new();
    let shutdown = ShutdownRegistry::new();

    // Sinks first so no early transition is missed.
    if flags.verbose {
        tokio::spawn(yktouch_notify::debug::run(Arc::clone(&bus)));
    }
    if !flags.no_socket {
        tokio::spawn(yktouch_notify::unix_socket::run(
            Arc::clone(&bus),
            Arc::clone(&shutdown),
        ));
    }
    if flags.libnotify {
        tokio::spawn(yktouch_notify::desktop::run(Arc::clone(&bus)));
    }
    if flags.stdout {
        tokio::spawn(yktouch_notify::stdout::run(Arc::clone(&bus)));
    }
    if flags.dbus {
        tokio::spawn(yktouch_notify::dbus::run(Arc::clone(&bus)));
    }

    if config.detect.u2f {
        tokio::spawn(u2f::watch(Arc::clone(&bus), timing));
    }
    if config.detect.hmac {
        tokio::spawn(hmac::watch(Arc::clone(&bus), timing));
    }

    // GPG, SSH and the gpg-agent proxy all funnel into one checker,
    // since they ultimately ask the same token for a touch.
    if config.detect.gpg || config.detect.ssh || config.detect.gpg_agent_proxy {
        match discover_agent_socket().await {
            Ok(agent_socket) => {
                let (check_tx, check_rx) = mpsc::channel(1);
                tokio::spawn(gpg::check_on_request(
                    check_rx,
                    Arc::clone(&bus),
                    agent_socket.clone(),
                    timing,
                ));

                if config.detect.gpg {
                    match discover_key_files().await {
                        Ok(files) if !files.is_empty() => {
                            debug!(files = files.len(), "watching shadowed GPG key files");
                            tokio::spawn(gpg::watch_files(files, check_tx.clone(), timing));
                        }
                        Ok(_) => info!(
                            "no files matching '{SHADOWED_KEY_MARKER}' found, GPG watcher disabled"
                        ),
                        Err(e) => warn!("cannot discover GPG key files: {e:#}"),
                    }
                }

                if config.detect.ssh {
                    match ssh_socket_path() {
                        Some(path) => {
                            tokio::spawn(proxy::watch(
                                "detector/ssh",
                                path,
                                TriggerRule::AnyTraffic,
                                check_tx.clone(),
                                Arc::clone(&shutdown),
                            ));
                        }
                        None => warn!(
                            "cannot watch SSH, neither $SSH_AUTH_SOCK nor $XDG_RUNTIME_DIR are defined"
                        ),
                    }
                }

                if config.detect.gpg_agent_proxy {
                    tokio::spawn(proxy::watch(
                        "detector/gpg-agent",
                        agent_socket,
                        TriggerRule::Substring(b"PKDECRYPT"),
                        check_tx,
                        Arc::clone(&shutdown),
                    ));
                }
            }
            Err(e) => info!("GPG agent unavailable, disabling GPG and SSH watchers: {e:#}"),
        }
    }

    shutdown_signal().await;
    info!("received shutdown signal, restoring hijacked resources");
    shutdown.drain().await;
    debug!("stopping yktouch daemon");
    Ok(())
}

/// Wait for ctrl-c (SIGINT) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("failed to register SIGTERM handler: {e}, falling back to SIGINT only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

/// Locate the gpg-agent Assuan socket: ask gpgconf, fall back to the
/// well-known runtime path.
async fn discover_agent_socket() -> Result<PathBuf> {
    match tokio::process::Command::new("gpgconf")
        .args(["--list-dirs", "agent-socket"])
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            let path = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
            if path.exists() {
                return Ok(path);
            }
            debug!(
                "gpgconf reported '{}' but it does not exist, trying the fallback",
                path.display()
            );
        }
        Ok(output) => debug!(
            "gpgconf --list-dirs agent-socket failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ),
        Err(e) => debug!("cannot run gpgconf: {e}"),
    }

    let runtime_dir =
        std::env::var("XDG_RUNTIME_DIR").context("$XDG_RUNTIME_DIR is not defined")?;
    let fallback = PathBuf::from(runtime_dir).join("gnupg").join("S.gpg-agent");
    if !fallback.exists() {
        bail!("agent socket '{}' does not exist", fallback.display());
    }
    Ok(fallback)
}

/// Find the key files whose private part is shadowed onto the token:
/// everything under `private-keys-v1.d` containing the marker string.
async fn discover_key_files() -> Result<Vec<PathBuf>> {
    let output = tokio::process::Command::new("gpgconf")
        .args(["--list-dirs", "homedir"])
        .output()
        .await
        .context("run gpgconf")?;
    if !output.status.success() {
        bail!(
            "gpgconf --list-dirs homedir failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let homedir = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
    let keys_dir = homedir.join("private-keys-v1.d");
    if !keys_dir.is_dir() {
        bail!(
            "'{}' does not exist (no private keys)",
            keys_dir.display()
        );
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(&keys_dir)
        .with_context(|| format!("list {}", keys_dir.display()))?
    {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        // Key files are tiny; scanning their content beats trusting names.
        match std::fs::read_to_string(&path) {
            Ok(content) if content.contains(SHADOWED_KEY_MARKER) => files.push(path),
            Ok(_) => {}
            Err(e) => debug!(path = %path.display(), "cannot read key file, skipping: {e}"),
        }
    }
    Ok(files)
}

/// The SSH agent socket: environment first, gpg-agent's SSH socket second.
fn ssh_socket_path() -> Option<PathBuf> {
    if let Ok(sock) = std::env::var("SSH_AUTH_SOCK")
        && !sock.is_empty()
    {
        return Some(PathBuf::from(sock));
    }
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR").ok()?;
    Some(PathBuf::from(runtime_dir).join("gnupg").join("S.gpg-agent.ssh"))
}

fn default_config_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("yktouch").join("config.toml")
}

fn load_config(path: &PathBuf) -> Result<Config> {
    if !path.exists() {
        debug!("config file not found at {}, using defaults", path.display());
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read {}", path.display()))?;
    let config: Config =
        toml::from_str(&content).with_context(|| format!("parse {}", path.display()))?;
    info!("loaded config from {}", path.display());
    Ok(config)
}

/// `1`, `true` and `yes` enable a `YKTOUCH_*` environment toggle.
fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|value| matches!(value.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Hand-rolled flag parsing; may exit for `--help` and `--version`.
fn parse_flags() -> Flags {
    let mut flags = Flags {
        verbose: env_flag("YKTOUCH_VERBOSE"),
        libnotify: env_flag("YKTOUCH_LIBNOTIFY"),
        stdout: env_flag("YKTOUCH_STDOUT"),
        dbus: env_flag("YKTOUCH_DBUS"),
        no_socket: env_flag("YKTOUCH_NOSOCKET"),
        config: None,
    };

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--version" => {
                println!("yktouch daemon version: {APP_VERSION}");
                std::process::exit(0);
            }
            "-v" | "--verbose" => flags.verbose = true,
            "--libnotify" => flags.libnotify = true,
            "--stdout" => flags.stdout = true,
            "--dbus" => flags.dbus = true,
            "--no-socket" => flags.no_socket = true,
            "--config" | "-c" => {
                if let Some(path) = args.get(i + 1) {
                    flags.config = Some(PathBuf::from(path));
                    i += 1;
                } else {
                    eprintln!("error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--help" | "-h" => {
                eprintln!("Usage: yktouchd [options]");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  -v, --verbose        enable debug logging (env: YKTOUCH_VERBOSE)");
                eprintln!("      --libnotify      desktop notifications via notify-send (env: YKTOUCH_LIBNOTIFY)");
                eprintln!("      --stdout         print transitions to stdout (env: YKTOUCH_STDOUT)");
                eprintln!("      --dbus           expose state on the session D-Bus (env: YKTOUCH_DBUS)");
                eprintln!("      --no-socket      disable the unix socket notifier (env: YKTOUCH_NOSOCKET)");
                eprintln!("  -c, --config <path>  config file (default: $XDG_CONFIG_HOME/yktouch/config.toml)");
                eprintln!("      --version        print version and exit");
                eprintln!("  -h, --help           show this help message");
                std::process::exit(0);
            }
            other => {
                if let Some(path) = other.strip_prefix("--config=") {
                    flags.config = Some(PathBuf::from(path));
                } else {
                    eprintln!("error: unknown flag '{other}' (see --help)");
                    std::process::exit(1);
                }
            }
        }
        i += 1;
    }
    flags
}
