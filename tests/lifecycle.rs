//! Lifecycle tests against a fake emulator.
//!
//! The "emulator" is a shell script; the test itself plays QEMU's part of
//! the console rendezvous by connecting to the launcher's socket while
//! `start()` is waiting.
//!
//! All scripts are written once, before this binary spawns anything, so no
//! forked child can still hold a script open for writing (`ETXTBSY`).

#![cfg(unix)]

use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use qemu_launcher::{ExecutableResolver, LaunchError, Launcher, ProcessState};

const SYSTEM: &str = "qemu-system-x86_64";
const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Fake emulators
// ---------------------------------------------------------------------------

/// Echo argv, say hello on stderr, then echo stdin back.
const ECHO: &str = "#!/bin/sh\nprintf '%s\\n' \"$*\"\necho booting >&2\nexec cat\n";

/// Die before touching the console.
const EXIT_EARLY: &str = "#!/bin/sh\nexit 3\n";

/// Record the pid next to the console socket, then never connect.
const NEVER_CONNECT: &str =
    "#!/bin/sh\nfor last; do :; done\necho $$ > \"${last#unix:}.pid\"\nexec sleep 30\n";

/// Exit with 7 after the first line of input.
const EXIT_ON_INPUT: &str = "#!/bin/sh\nread line\nexit 7\n";

/// Ignore SIGTERM; only a forced kill ends it.
const STUBBORN: &str = "#!/bin/sh\ntrap '' TERM\nwhile read line; do :; done\n";

struct Scripts {
    _dir: tempfile::TempDir,
    echo: PathBuf,
    exit_early: PathBuf,
    never_connect: PathBuf,
    exit_on_input: PathBuf,
    stubborn: PathBuf,
}

fn scripts() -> &'static Scripts {
    static SCRIPTS: OnceLock<Scripts> = OnceLock::new();
    SCRIPTS.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap();
        let write = |name: &str, body: &str| {
            let path = dir.path().join(name);
            std::fs::write(&path, body).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        };
        Scripts {
            echo: write("echo", ECHO),
            exit_early: write("exit-early", EXIT_EARLY),
            never_connect: write("never-connect", NEVER_CONNECT),
            exit_on_input: write("exit-on-input", EXIT_ON_INPUT),
            stubborn: write("stubborn", STUBBORN),
            _dir: dir,
        }
    })
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

struct Fixture {
    dir: tempfile::TempDir,
    bios: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let bios = dir.path().join("bios.bin");
        std::fs::write(&bios, [0u8; 16]).unwrap();
        Self { dir, bios }
    }

    fn socket(&self) -> PathBuf {
        self.dir.path().join("console.sock")
    }

    fn launcher(&self, emulator: &Path) -> Launcher {
        let resolver = ExecutableResolver::new().with_override(emulator);
        let mut launcher = Launcher::with_resolver(SYSTEM, &resolver);
        launcher.set_bios(&self.bios.to_string_lossy());
        launcher.set_console_address(self.socket().to_string_lossy());
        launcher.set_handshake_timeout(WAIT);
        launcher
    }

    /// Start `launcher`, connecting to its console the way QEMU would.
    fn start(&self, launcher: &Launcher) -> UnixStream {
        let socket = self.socket();
        let emulator_side = thread::spawn(move || {
            let deadline = Instant::now() + WAIT;
            while Instant::now() < deadline {
                if let Ok(stream) = UnixStream::connect(&socket) {
                    return Some(stream);
                }
                thread::sleep(Duration::from_millis(5));
            }
            None
        });
        launcher.start().expect("start should succeed");
        emulator_side
            .join()
            .unwrap()
            .expect("console never connected")
    }
}

/// Collects handler output and wakes waiters.
#[derive(Clone, Default)]
struct Transcript {
    text: Arc<Mutex<String>>,
}

impl Transcript {
    fn sink(&self) -> impl FnMut(&str) + Send + 'static {
        let text = Arc::clone(&self.text);
        move |chunk: &str| text.lock().unwrap().push_str(chunk)
    }

    fn wait_for(&self, needle: &str) -> String {
        let deadline = Instant::now() + WAIT;
        loop {
            let seen = self.text.lock().unwrap().clone();
            if seen.contains(needle) || Instant::now() >= deadline {
                return seen;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

fn process_gone(pid: u32) -> bool {
    // SAFETY: signal 0 performs only the existence check.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == -1 && std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH)
}

// ---------------------------------------------------------------------------
// Start preconditions
// ---------------------------------------------------------------------------

#[test]
fn missing_bios_fails_without_spawning() {
    let fx = Fixture::new();
    let mut launcher = fx.launcher(&scripts().echo);
    launcher.set_bios(&fx.dir.path().join("missing.bin").to_string_lossy());

    let err = launcher.start().unwrap_err();
    assert!(matches!(err, LaunchError::NotFound { what: "BIOS file", .. }), "{err}");
    assert_eq!(launcher.state(), ProcessState::NotStarted);
    assert_eq!(launcher.pid(), None);
    assert!(!fx.socket().exists());
}

#[test]
fn empty_paths_are_configuration_errors() {
    let fx = Fixture::new();
    let mut launcher = fx.launcher(&scripts().echo);
    launcher.set_bios("");
    assert!(matches!(launcher.start(), Err(LaunchError::Configuration(_))));

    launcher.set_qemu_path("");
    assert!(matches!(launcher.start(), Err(LaunchError::Configuration(_))));
    assert_eq!(launcher.state(), ProcessState::NotStarted);
}

#[test]
fn missing_executable_is_not_found() {
    let fx = Fixture::new();
    let launcher = fx.launcher(&fx.dir.path().join("qemu-system-gone"));
    assert!(matches!(
        launcher.start(),
        Err(LaunchError::NotFound { what: "QEMU executable", .. })
    ));
}

// ---------------------------------------------------------------------------
// Running emulator
// ---------------------------------------------------------------------------

#[test]
fn start_bridges_all_channels_and_stop_reaps_once() {
    let fx = Fixture::new();
    let mut launcher = fx.launcher(&scripts().echo);
    launcher.add_argument("-m");
    launcher.add_argument("64");
    launcher.add_argument("-m");
    launcher.add_argument("64");

    let stdout = Transcript::default();
    let stderr = Transcript::default();
    let serial = Transcript::default();
    let (exit_tx, exit_rx) = mpsc::channel();
    launcher.on_stdout(stdout.sink());
    launcher.on_stderr(stderr.sink());
    launcher.on_serial(serial.sink());
    launcher.on_exit(move |code| {
        let _ = exit_tx.send(code);
    });

    let mut console = fx.start(&launcher);
    assert_eq!(launcher.state(), ProcessState::Running);
    let pid = launcher.pid().unwrap();
    assert!(!fx.socket().exists(), "socket file outlived the handshake");

    let argv = format!(
        "-bios {} -m 64 -m 64 -serial unix:{}",
        fx.bios.display(),
        fx.socket().display()
    );
    assert!(stdout.wait_for(&argv).contains(&argv));
    assert!(stderr.wait_for("booting").contains("booting"));

    assert!(launcher.write_stdin("info status\n"));
    assert!(stdout.wait_for("info status").contains("info status"));

    console.write_all("login: ✓\n".as_bytes()).unwrap();
    assert!(serial.wait_for("login: ✓").contains("login: ✓"));

    assert!(launcher.write_console("root\n"));
    let mut buf = [0u8; 5];
    console.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"root\n");

    assert!(launcher.stop());
    assert_eq!(launcher.state(), ProcessState::Exited);
    assert_eq!(launcher.pid(), None);
    assert_eq!(launcher.exit_code(), Some(128 + libc::SIGTERM));
    assert_eq!(exit_rx.recv_timeout(WAIT), Ok(128 + libc::SIGTERM));
    assert!(process_gone(pid));

    // Every endpoint is closed.
    assert!(!launcher.write_stdin("late\n"));
    assert!(!launcher.write_console("late\n"));
    let mut rest = Vec::new();
    assert_eq!(console.read_to_end(&mut rest).unwrap_or(0), 0);

    // Nothing left to stop, and on-exit does not fire again.
    assert!(!launcher.stop());
    assert!(!launcher.terminate());
    assert!(exit_rx.try_recv().is_err());
}

#[test]
fn second_start_while_running_is_rejected() {
    let fx = Fixture::new();
    let launcher = fx.launcher(&scripts().echo);
    let _console = fx.start(&launcher);
    let pid = launcher.pid().unwrap();

    match launcher.start() {
        Err(LaunchError::AlreadyRunning { pid: running }) => assert_eq!(running, pid),
        other => panic!("expected AlreadyRunning, got {other:?}"),
    }
    assert_eq!(launcher.pid(), Some(pid));
    assert!(launcher.terminate());
}

#[test]
fn launcher_can_restart_after_exit() {
    let fx = Fixture::new();
    let launcher = fx.launcher(&scripts().echo);

    let _first = fx.start(&launcher);
    let first_pid = launcher.pid().unwrap();
    assert!(launcher.stop());

    let _second = fx.start(&launcher);
    assert_eq!(launcher.state(), ProcessState::Running);
    assert_ne!(launcher.pid(), Some(first_pid));
    assert_eq!(launcher.exit_code(), None);
    assert!(launcher.stop());
}

#[test]
fn terminate_kills_an_emulator_that_ignores_stop_requests() {
    let fx = Fixture::new();
    let launcher = fx.launcher(&scripts().stubborn);
    let _console = fx.start(&launcher);
    let pid = launcher.pid().unwrap();

    assert!(launcher.terminate());
    assert_eq!(launcher.exit_code(), Some(128 + libc::SIGKILL));
    assert!(process_gone(pid));
}

#[test]
fn poll_exit_notices_an_emulator_that_exits_on_its_own() {
    let fx = Fixture::new();
    let launcher = fx.launcher(&scripts().exit_on_input);
    let exits = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&exits);
    launcher.on_exit(move |code| sink.lock().unwrap().push(code));

    let _console = fx.start(&launcher);
    assert_eq!(launcher.poll_exit(), None);
    assert!(launcher.write_stdin("quit\n"));

    let deadline = Instant::now() + WAIT;
    let code = loop {
        if let Some(code) = launcher.poll_exit() {
            break Some(code);
        }
        if Instant::now() >= deadline {
            break None;
        }
        thread::sleep(Duration::from_millis(10));
    };
    assert_eq!(code, Some(7));
    assert_eq!(launcher.state(), ProcessState::Exited);
    assert_eq!(*exits.lock().unwrap(), [7]);
    assert!(!launcher.stop());
}

#[test]
fn dropping_a_running_launcher_leaves_no_orphan() {
    let fx = Fixture::new();
    let launcher = fx.launcher(&scripts().echo);
    let _console = fx.start(&launcher);
    let pid = launcher.pid().unwrap();
    assert!(!process_gone(pid));

    drop(launcher);
    assert!(process_gone(pid));
}

// ---------------------------------------------------------------------------
// Handshake failures
// ---------------------------------------------------------------------------

#[test]
fn emulator_dying_during_handshake_rolls_back() {
    let fx = Fixture::new();
    let launcher = fx.launcher(&scripts().exit_early);

    let err = launcher.start().unwrap_err();
    assert!(matches!(err, LaunchError::Handshake(_)), "{err}");
    assert!(err.to_string().contains("code 3"), "{err}");
    assert_eq!(launcher.state(), ProcessState::NotStarted);
    assert!(!fx.socket().exists());
}

#[test]
fn console_address_naming_a_regular_file_leaves_it_alone() {
    let fx = Fixture::new();
    let notes = fx.dir.path().join("notes.txt");
    std::fs::write(&notes, "user data").unwrap();
    let mut launcher = fx.launcher(&scripts().exit_early);
    launcher.set_console_address(notes.to_string_lossy());

    let err = launcher.start().unwrap_err();
    assert!(matches!(err, LaunchError::Handshake(_)), "{err}");
    assert!(err.to_string().contains("not a socket"), "{err}");
    assert_eq!(launcher.state(), ProcessState::NotStarted);
    assert_eq!(std::fs::read_to_string(&notes).unwrap(), "user data");
}

#[test]
fn handshake_timeout_kills_and_reaps_the_child() {
    let fx = Fixture::new();
    let mut launcher = fx.launcher(&scripts().never_connect);
    launcher.set_handshake_timeout(Duration::from_millis(300));

    let err = launcher.start().unwrap_err();
    assert!(matches!(err, LaunchError::Handshake(_)), "{err}");
    assert_eq!(launcher.state(), ProcessState::NotStarted);
    assert!(!launcher.write_stdin("anyone?\n"));
    assert!(!fx.socket().exists());

    let pid_file = PathBuf::from(format!("{}.pid", fx.socket().display()));
    let pid: u32 = std::fs::read_to_string(pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(process_gone(pid));
}
