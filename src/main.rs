// ── Waystation CLI ─────────────────────────────────────────────────────────
// Daemon management entry point: start | stop | status | restart | ensure |
// logs, plus the hidden `serve` subcommand that actually runs the gateway.
//
// Exit codes: 0 success, 2 config parse failure, 3 port in use,
// 4 dependency missing, 5 timeout.

use clap::{Parser, Subcommand};
use fs2::FileExt;
use log::{error, info};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use waystation::atoms::constants::{DEFAULT_HOST, DEFAULT_PORT};

const EXIT_CONFIG: u8 = 2;
const EXIT_PORT_IN_USE: u8 = 3;
const EXIT_DEPENDENCY: u8 = 4;
const EXIT_TIMEOUT: u8 = 5;

#[derive(Parser)]
#[command(name = "waystation", version, about = "Offline-first AI orchestration gateway")]
struct Cli {
    /// State directory (default: ~/.waystation, env: WAYSTATION_STATE_DIR)
    #[arg(long, global = true, env = "WAYSTATION_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the gateway daemon in the background
    Start {
        /// Seconds to wait for the gateway to report healthy
        #[arg(long, default_value_t = 20)]
        timeout: u64,
        /// Run in the foreground instead of daemonizing
        #[arg(long)]
        foreground: bool,
        /// Spawn stdio MCP servers eagerly at boot
        #[arg(long)]
        pre_warm: bool,
    },
    /// Stop a running gateway daemon
    Stop,
    /// Report whether the gateway is running and its health
    Status,
    /// Stop then start
    Restart,
    /// Start the gateway only if it is not already running
    Ensure,
    /// Show the daemon log
    Logs {
        #[arg(long, default_value_t = 100)]
        lines: usize,
        #[arg(long, short = 'f')]
        follow: bool,
    },
    /// (internal) Run the gateway in this process
    #[command(hide = true)]
    Serve {
        #[arg(long)]
        pre_warm: bool,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let state_dir = cli
        .state_dir
        .clone()
        .unwrap_or_else(waystation::default_state_dir);
    if let Err(e) = std::fs::create_dir_all(&state_dir) {
        error!("Cannot create state dir {:?}: {}", state_dir, e);
        return ExitCode::from(EXIT_CONFIG);
    }

    match cli.command {
        Command::Serve { pre_warm } => serve(&state_dir, pre_warm),
        Command::Start {
            timeout,
            foreground,
            pre_warm,
        } => {
            if foreground {
                serve(&state_dir, pre_warm)
            } else {
                start(&state_dir, timeout, pre_warm)
            }
        }
        Command::Stop => stop(&state_dir),
        Command::Status => status(&state_dir),
        Command::Restart => {
            let _ = stop(&state_dir);
            start(&state_dir, 20, false)
        }
        Command::Ensure => {
            if running_pid(&state_dir).is_some() {
                println!("waystation is already running");
                ExitCode::SUCCESS
            } else {
                start(&state_dir, 20, false)
            }
        }
        Command::Logs { lines, follow } => logs(&state_dir, lines, follow),
    }
}

// ── Serve (the actual gateway process) ─────────────────────────────────────

fn serve(state_dir: &Path, pre_warm: bool) -> ExitCode {
    // Exclusive pidfile lock: a second instance means the port is taken
    let pid_path = state_dir.join("waystation.pid");
    let pid_file = match std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&pid_path)
    {
        Ok(f) => f,
        Err(e) => {
            error!("Cannot open pidfile {:?}: {}", pid_path, e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if pid_file.try_lock_exclusive().is_err() {
        error!("Another waystation instance holds {:?}", pid_path);
        return ExitCode::from(EXIT_PORT_IN_USE);
    }
    let mut pid_file = pid_file;
    let _ = pid_file.set_len(0);
    let _ = pid_file.seek(SeekFrom::Start(0));
    let _ = writeln!(pid_file, "{}", std::process::id());
    let _ = pid_file.flush();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Tokio runtime failed to start: {}", e);
            return ExitCode::from(EXIT_DEPENDENCY);
        }
    };

    let result = runtime.block_on(async {
        let options = waystation::BootOptions {
            config_dir: state_dir.join("config"),
            db_path: state_dir.join("gateway.db"),
            pre_warm_mcp: pre_warm,
        };
        let state = waystation::boot(options).await?;

        let host = state.config.get_or("WAYSTATION_HOST", DEFAULT_HOST);
        let port = state
            .config
            .get_u64("WAYSTATION_PORT")
            .map(|p| p as u16)
            .unwrap_or(DEFAULT_PORT);
        let addr = format!("{host}:{port}");

        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                error!("Port {} is already in use", port);
                return Ok::<u8, waystation::GatewayError>(EXIT_PORT_IN_USE);
            }
            Err(e) => {
                error!("Cannot bind {}: {}", addr, e);
                return Ok(EXIT_DEPENDENCY);
            }
        };
        std::fs::write(state_dir.join("gateway.addr"), &addr).ok();

        // Phase 8: open ingress
        info!("[boot] phase 8 — ingress open on http://{addr}");
        let app = waystation::build_router(state.clone());
        axum::serve(listener, app)
            .with_graceful_shutdown(wait_for_signal())
            .await
            .map_err(|e| waystation::GatewayError::Internal(e.to_string()))?;
        // Ingress is drained; close the rest in reverse boot order
        waystation::shutdown(&state).await;
        Ok(0)
    });

    let _ = std::fs::remove_file(&pid_path);
    let _ = std::fs::remove_file(state_dir.join("gateway.addr"));
    match result {
        Ok(0) => ExitCode::SUCCESS,
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("Gateway failed: {}", e);
            ExitCode::from(EXIT_DEPENDENCY)
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// ── Daemon management ──────────────────────────────────────────────────────

fn start(state_dir: &Path, timeout_secs: u64, pre_warm: bool) -> ExitCode {
    if running_pid(state_dir).is_some() {
        println!("waystation is already running");
        return ExitCode::SUCCESS;
    }

    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            error!("Cannot locate the waystation binary: {}", e);
            return ExitCode::from(EXIT_DEPENDENCY);
        }
    };
    let log_path = state_dir.join("gateway.log");
    let log_file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(f) => f,
        Err(e) => {
            error!("Cannot open log file {:?}: {}", log_path, e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let mut cmd = std::process::Command::new(exe);
    cmd.arg("--state-dir")
        .arg(state_dir)
        .arg("serve")
        .stdin(std::process::Stdio::null())
        .stdout(log_file.try_clone().expect("log handle"))
        .stderr(log_file);
    if pre_warm {
        cmd.arg("--pre-warm");
    }
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to spawn the gateway: {}", e);
            return ExitCode::from(EXIT_DEPENDENCY);
        }
    };

    // Wait for /health, watching for early child exit
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(timeout_secs);
    while std::time::Instant::now() < deadline {
        if let Ok(Some(status)) = child.try_wait() {
            let code = status.code().unwrap_or(EXIT_DEPENDENCY as i32) as u8;
            error!("Gateway exited during startup (code {})", code);
            return ExitCode::from(code);
        }
        if probe_health(state_dir) {
            println!("waystation is up (pid {})", child.id());
            return ExitCode::SUCCESS;
        }
        std::thread::sleep(std::time::Duration::from_millis(250));
    }
    error!("Gateway did not become healthy within {}s", timeout_secs);
    ExitCode::from(EXIT_TIMEOUT)
}

fn stop(state_dir: &Path) -> ExitCode {
    let Some(pid) = running_pid(state_dir) else {
        println!("waystation is not running");
        return ExitCode::SUCCESS;
    };
    #[cfg(unix)]
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while std::time::Instant::now() < deadline {
        if running_pid(state_dir).is_none() {
            println!("waystation stopped");
            return ExitCode::SUCCESS;
        }
        std::thread::sleep(std::time::Duration::from_millis(200));
    }
    #[cfg(unix)]
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
    println!("waystation killed");
    ExitCode::SUCCESS
}

fn status(state_dir: &Path) -> ExitCode {
    match running_pid(state_dir) {
        Some(pid) => {
            let health = fetch_health(state_dir).unwrap_or_else(|| "unreachable".to_string());
            println!("waystation running (pid {pid}) — {health}");
        }
        None => println!("waystation stopped"),
    }
    ExitCode::SUCCESS
}

fn logs(state_dir: &Path, lines: usize, follow: bool) -> ExitCode {
    let path = state_dir.join("gateway.log");
    let Ok(content) = std::fs::read_to_string(&path) else {
        println!("no log file at {:?}", path);
        return ExitCode::SUCCESS;
    };
    let tail: Vec<&str> = content.lines().rev().take(lines).collect();
    for line in tail.iter().rev() {
        println!("{line}");
    }
    if follow {
        let mut offset = content.len() as u64;
        loop {
            std::thread::sleep(std::time::Duration::from_millis(500));
            let Ok(mut file) = std::fs::File::open(&path) else { continue };
            let len = file.metadata().map(|m| m.len()).unwrap_or(0);
            if len > offset {
                let _ = file.seek(SeekFrom::Start(offset));
                let mut fresh = String::new();
                let _ = file.read_to_string(&mut fresh);
                print!("{fresh}");
                let _ = std::io::stdout().flush();
                offset = len;
            }
        }
    }
    ExitCode::SUCCESS
}

// ── Helpers ────────────────────────────────────────────────────────────────

/// Pid from the pidfile, verified alive (signal 0).
fn running_pid(state_dir: &Path) -> Option<u32> {
    let raw = std::fs::read_to_string(state_dir.join("waystation.pid")).ok()?;
    let pid: u32 = raw.trim().parse().ok()?;
    #[cfg(unix)]
    {
        let alive = unsafe { libc::kill(pid as i32, 0) } == 0;
        alive.then_some(pid)
    }
    #[cfg(not(unix))]
    {
        Some(pid)
    }
}

fn gateway_addr(state_dir: &Path) -> String {
    std::fs::read_to_string(state_dir.join("gateway.addr"))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| format!("{DEFAULT_HOST}:{DEFAULT_PORT}"))
}

fn probe_health(state_dir: &Path) -> bool {
    fetch_health(state_dir).is_some()
}

/// Blocking /health fetch without dragging a runtime into the CLI paths:
/// a plain HTTP/1.0 request over a std TcpStream.
fn fetch_health(state_dir: &Path) -> Option<String> {
    let addr = gateway_addr(state_dir);
    let mut stream = std::net::TcpStream::connect(&addr).ok()?;
    stream
        .set_read_timeout(Some(std::time::Duration::from_secs(2)))
        .ok()?;
    let request = format!("GET /health HTTP/1.0\r\nHost: {addr}\r\n\r\n");
    stream.write_all(request.as_bytes()).ok()?;
    let mut response = String::new();
    stream.read_to_string(&mut response).ok()?;
    if !response.starts_with("HTTP/1.0 200") && !response.starts_with("HTTP/1.1 200") {
        return None;
    }
    let body = response.split("\r\n\r\n").nth(1)?;
    let parsed: serde_json::Value = serde_json::from_str(body.trim()).ok()?;
    Some(format!(
        "status={} tempo={}",
        parsed["status"].as_str().unwrap_or("?"),
        parsed["tempo"].as_str().unwrap_or("?")
    ))
}
