//! qemu-launch: run a QEMU system emulator attached to this terminal.
//!
//! Lines typed on stdin go to the emulator's stdin, its stdout/stderr and the
//! guest serial console are printed with prefixes, and Ctrl-C stops the
//! emulator gracefully. The process exits with the emulator's exit code.

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

use qemu_launcher::paths::LauncherPaths;
use qemu_launcher::{EXIT_CODE_UNKNOWN, LaunchProfile, Launcher, logging};

/// How often the supervisor checks whether QEMU exited on its own.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Launch QEMU and bridge its I/O to this terminal
#[derive(Parser, Debug)]
#[command(name = "qemu-launch", version, about = "Launch QEMU and bridge its I/O to this terminal")]
struct Args {
    /// Emulator binary name (e.g. qemu-system-x86_64)
    system: String,

    /// Firmware image passed with -bios
    #[arg(long)]
    bios: Option<String>,

    /// Explicit emulator executable, bypassing QEMU_ROOT/PATH lookup
    #[arg(long)]
    qemu: Option<String>,

    /// TOML launch profile applied before the other flags
    #[arg(long)]
    profile: Option<PathBuf>,

    /// Console socket path (Unix) or pipe name (Windows) instead of a fresh one
    #[arg(long, value_name = "ADDRESS")]
    console: Option<String>,

    /// Seconds to wait for the emulator to attach to the console
    #[arg(long, value_name = "SECS")]
    handshake_timeout: Option<u64>,

    /// Extra arguments passed to the emulator after the firmware
    #[arg(last = true)]
    extra: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let code = run(&args)?;
    std::process::exit(code);
}

/// Everything that must be torn down before the process exits, including
/// the log guard that flushes the file layer.
fn run(args: &Args) -> Result<i32> {
    let paths = LauncherPaths::resolve();
    let _log_guard = logging::init(&paths);

    let launcher = configure(args)?;
    launcher.on_stdout(|text| print_prefixed("qemu", text));
    launcher.on_stderr(|text| eprint_prefixed("qemu!", text));
    launcher.on_serial(|text| {
        print!("{text}");
        let _ = std::io::stdout().flush();
    });
    launcher.on_exit(|code| eprintln!("[qemu-launch] QEMU exited with code {code}"));

    launcher
        .start()
        .with_context(|| format!("failed to start {}", args.system))?;
    info!(pid = ?launcher.pid(), "QEMU started");

    let launcher = Arc::new(launcher);

    // Create the Tokio runtime for stdin forwarding and signal handling
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create Tokio runtime")?;

    let code = runtime.block_on(supervise(Arc::clone(&launcher)))?;

    // The stdin reader may still be parked on a blocking read.
    runtime.shutdown_timeout(Duration::from_millis(100));
    drop(launcher);

    info!(code, "QEMU exited");
    Ok(code)
}

fn configure(args: &Args) -> Result<Launcher> {
    let mut launcher = Launcher::new(&args.system);

    if let Some(path) = &args.profile {
        let profile = LaunchProfile::load(path)?;
        launcher.apply_profile(&profile);
        debug!(profile = %path.display(), "applied launch profile");
    }
    if let Some(qemu) = &args.qemu {
        launcher.set_qemu_path(qemu);
    }
    if let Some(bios) = &args.bios {
        launcher.set_bios(bios);
    }
    if let Some(address) = &args.console {
        launcher.set_console_address(address.as_str());
    }
    if let Some(secs) = args.handshake_timeout {
        if secs == 0 {
            bail!("--handshake-timeout must be at least 1 second");
        }
        launcher.set_handshake_timeout(Duration::from_secs(secs));
    }
    for arg in &args.extra {
        launcher.add_argument(arg.as_str());
    }

    if launcher.qemu_path().is_empty() {
        bail!(
            "{} not found in QEMU_ROOT, PATH or the standard install locations; pass --qemu",
            args.system
        );
    }
    Ok(launcher)
}

/// Forward stdin and wait for the emulator to exit or for Ctrl-C.
async fn supervise(launcher: Arc<Launcher>) -> Result<i32> {
    let forward = {
        let launcher = Arc::clone(&launcher);
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !launcher.write_stdin(format!("{line}\n")) {
                    break;
                }
            }
            debug!("stdin forwarding finished");
        })
    };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(EXIT_POLL_INTERVAL);

    let code = loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result.context("failed to listen for Ctrl-C")?;
                info!("Ctrl-C received, stopping QEMU");
                let stopping = Arc::clone(&launcher);
                tokio::task::spawn_blocking(move || stopping.stop())
                    .await
                    .context("stop task panicked")?;
                break launcher.exit_code().unwrap_or(EXIT_CODE_UNKNOWN);
            }
            _ = ticker.tick() => {
                if let Some(code) = launcher.poll_exit() {
                    break code;
                }
            }
        }
    };

    forward.abort();
    Ok(code)
}

fn print_prefixed(prefix: &str, text: &str) {
    let mut out = std::io::stdout().lock();
    for line in text.lines() {
        let _ = writeln!(out, "[{prefix}] {line}");
    }
}

fn eprint_prefixed(prefix: &str, text: &str) {
    let mut err = std::io::stderr().lock();
    for line in text.lines() {
        let _ = writeln!(err, "[{prefix}] {line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_arguments_follow_double_dash() {
        let args = Args::try_parse_from([
            "qemu-launch",
            "qemu-system-riscv64",
            "--bios",
            "opensbi.bin",
            "--",
            "-machine",
            "virt",
            "--bios",
        ])
        .unwrap();
        assert_eq!(args.system, "qemu-system-riscv64");
        assert_eq!(args.bios.as_deref(), Some("opensbi.bin"));
        assert_eq!(args.extra, ["-machine", "virt", "--bios"]);
    }

    #[test]
    fn system_is_required() {
        assert!(Args::try_parse_from(["qemu-launch"]).is_err());
    }

    #[test]
    fn zero_handshake_timeout_is_rejected() {
        let args = Args::try_parse_from([
            "qemu-launch",
            "qemu-system-x86_64",
            "--qemu",
            "/bin/true",
            "--handshake-timeout",
            "0",
        ])
        .unwrap();
        assert!(configure(&args).is_err());
    }
}
