//! External process execution: docker, docker-compose and friends.

use regex::Regex;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{AiscalatorError, ProcessErrorDetails};

pub type LineSink = Box<dyn FnMut(&str) + Send>;
pub type BackgroundHandle = JoinHandle<io::Result<i32>>;

const JUPYTER_TOKEN_PATTERN: &str = r".*http://.*:8888/.token=([a-zA-Z0-9]+)";
const FAILURE_TAIL_LINES: usize = 20;

pub trait ProcessRunner {
    /// Runs to completion, feeding merged stdout/stderr lines to `on_line`.
    fn run(&self, argv: &[String], cwd: Option<&Path>, on_line: &mut dyn FnMut(&str)) -> io::Result<i32>;

    /// Runs to completion attached to the terminal.
    fn run_passthrough(&self, argv: &[String], cwd: Option<&Path>) -> io::Result<i32>;

    /// Starts the process and pumps its output on a background thread.
    fn spawn(&self, argv: &[String], on_line: LineSink) -> io::Result<BackgroundHandle>;
}

pub struct RealProcessRunner;

fn command_for(argv: &[String], cwd: Option<&Path>) -> io::Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    Ok(cmd)
}

fn forward_lines<R: Read + Send + 'static>(reader: R, tx: mpsc::Sender<String>) -> JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(reader).lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    })
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(if status.success() { 0 } else { 1 })
}

fn pump(mut child: Child, on_line: &mut dyn FnMut(&str)) -> io::Result<i32> {
    let (tx, rx) = mpsc::channel();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(forward_lines(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(forward_lines(stderr, tx.clone()));
    }
    drop(tx);
    for line in rx {
        on_line(&line);
    }
    for reader in readers {
        let _ = reader.join();
    }
    Ok(exit_code(child.wait()?))
}

fn spawn_piped(argv: &[String], cwd: Option<&Path>) -> io::Result<Child> {
    command_for(argv, cwd)?
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
}

impl ProcessRunner for RealProcessRunner {
    fn run(&self, argv: &[String], cwd: Option<&Path>, on_line: &mut dyn FnMut(&str)) -> io::Result<i32> {
        pump(spawn_piped(argv, cwd)?, on_line)
    }

    fn run_passthrough(&self, argv: &[String], cwd: Option<&Path>) -> io::Result<i32> {
        let status = command_for(argv, cwd)?.status()?;
        Ok(exit_code(status))
    }

    fn spawn(&self, argv: &[String], mut on_line: LineSink) -> io::Result<BackgroundHandle> {
        let child = spawn_piped(argv, None)?;
        Ok(thread::spawn(move || pump(child, &mut *on_line)))
    }
}

/// Remembers the first capture group of the last output line matching a
/// pattern, such as a Jupyter token or a built image id. Clones share the
/// captured value.
#[derive(Debug, Clone)]
pub struct LogRegexAnalyzer {
    pattern: Option<Regex>,
    artifact: Arc<Mutex<Option<String>>>,
}

impl LogRegexAnalyzer {
    pub fn new(pattern: &str) -> Result<Self, AiscalatorError> {
        let pattern = Regex::new(pattern)
            .map_err(|err| AiscalatorError::Config(format!("invalid log pattern {pattern}: {err}")))?;
        Ok(Self {
            pattern: Some(pattern),
            artifact: Arc::default(),
        })
    }

    /// Logs lines without capturing anything.
    pub fn passthrough() -> Self {
        Self {
            pattern: None,
            artifact: Arc::default(),
        }
    }

    pub fn grep_line(&self, line: &str) {
        debug!("{line}");
        let Some(pattern) = &self.pattern else {
            return;
        };
        if let Some(found) = pattern.captures(line).and_then(|caps| caps.get(1)) {
            let mut artifact = self.artifact.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            *artifact = Some(found.as_str().to_string());
        }
    }

    pub fn artifact(&self) -> Option<String> {
        self.artifact
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn sink(&self) -> LineSink {
        let analyzer = self.clone();
        Box::new(move |line: &str| analyzer.grep_line(line))
    }
}

pub fn render_command(argv: &[String]) -> String {
    fn shell_quote(part: &str) -> String {
        if part.is_empty() {
            return "\"\"".to_string();
        }
        if part.chars().any(|c| c.is_whitespace()) {
            return format!("\"{}\"", part.replace('"', "\\\""));
        }
        part.to_string()
    }
    argv.iter().map(|arg| shell_quote(arg)).collect::<Vec<_>>().join(" ")
}

fn spawn_error_details(err: &io::Error, argv: &[String], command: &str) -> ProcessErrorDetails {
    if err.kind() == io::ErrorKind::NotFound {
        let program = argv.first().map(String::as_str).unwrap_or("command");
        return ProcessErrorDetails {
            error_code: format!("{}_not_found", program.replace('-', "_")),
            hint: Some(format!("Install {program} and ensure it is on your PATH.")),
            command: Some(command.to_string()),
        };
    }
    ProcessErrorDetails {
        error_code: "process_command_failed".to_string(),
        hint: None,
        command: Some(command.to_string()),
    }
}

pub fn classify_failure(output: &str) -> (String, Option<String>) {
    let lower = output.to_lowercase();

    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("error during connect")
    {
        return (
            "docker_daemon_unreachable".to_string(),
            Some("Docker daemon is unreachable. Start Docker (or dockerd) and retry.".to_string()),
        );
    }

    if lower.contains("port is already allocated") || lower.contains("address already in use") {
        return (
            "docker_port_conflict".to_string(),
            Some(
                "A published port is already in use. Stop the other container or change aiscalator.jupyter.ports."
                    .to_string(),
            ),
        );
    }

    if lower.contains("is already in use by container") {
        return (
            "docker_container_name_conflict".to_string(),
            Some("A container with the same name is still running. Stop it with `docker stop` and retry.".to_string()),
        );
    }

    if lower.contains("unable to find image") || lower.contains("no such image") {
        return (
            "docker_image_missing".to_string(),
            Some("The docker image is not available locally. Run `aiscalator jupyter setup`.".to_string()),
        );
    }

    if lower.contains("denied") || lower.contains("unauthorized") {
        return (
            "docker_registry_auth".to_string(),
            Some("Authenticate with `docker login` for private images.".to_string()),
        );
    }

    ("process_command_failed".to_string(), None)
}

fn failure(argv: &[String], status_code: i32, tail: &[String]) -> AiscalatorError {
    let command = render_command(argv);
    let output = tail.join("\n");
    let (error_code, hint) = classify_failure(&output);
    let mut message = format!("command failed with status {status_code} while running `{command}`");
    if !output.trim().is_empty() {
        message = format!("{message}: {}", output.trim());
    }
    if let Some(ref hint_message) = hint {
        message = format!("{message}\nHint: {hint_message}");
    }
    AiscalatorError::ProcessDetailed {
        message,
        details: ProcessErrorDetails {
            error_code,
            hint,
            command: Some(command),
        },
    }
}

fn spawn_failure(err: io::Error, argv: &[String]) -> AiscalatorError {
    let command = render_command(argv);
    AiscalatorError::ProcessDetailed {
        message: format!("failed to run command `{command}`: {err}"),
        details: spawn_error_details(&err, argv, &command),
    }
}

/// Runs `argv` in the foreground, feeding output to `analyzer`. A non-zero
/// exit becomes a [`AiscalatorError::ProcessDetailed`].
pub fn execute<R: ProcessRunner + ?Sized>(
    runner: &R,
    argv: &[String],
    cwd: Option<&Path>,
    analyzer: &LogRegexAnalyzer,
) -> Result<(), AiscalatorError> {
    info!("Running...: {}", render_command(argv));
    let mut tail: Vec<String> = Vec::new();
    let mut on_line = |line: &str| {
        analyzer.grep_line(line);
        if tail.len() == FAILURE_TAIL_LINES {
            tail.remove(0);
        }
        tail.push(line.to_string());
    };
    let status_code = runner
        .run(argv, cwd, &mut on_line)
        .map_err(|err| spawn_failure(err, argv))?;
    if status_code != 0 {
        return Err(failure(argv, status_code, &tail));
    }
    Ok(())
}

pub fn execute_passthrough<R: ProcessRunner + ?Sized>(
    runner: &R,
    argv: &[String],
    cwd: Option<&Path>,
) -> Result<(), AiscalatorError> {
    info!("Running...: {}", render_command(argv));
    let status_code = runner
        .run_passthrough(argv, cwd)
        .map_err(|err| spawn_failure(err, argv))?;
    if status_code != 0 {
        return Err(failure(argv, status_code, &[]));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval: Duration::from_secs(2),
        }
    }
}

/// Where a started Jupyter Lab can be reached.
pub struct LabSession {
    pub url: Option<String>,
    pub handle: BackgroundHandle,
}

/// Starts Jupyter Lab in the background and polls its output for the access
/// token. The returned url points at `folder/notebook` on the host `port`.
pub fn wait_for_jupyter_lab<R: ProcessRunner + ?Sized>(
    runner: &R,
    argv: &[String],
    notebook: &str,
    port: u16,
    folder: &str,
    open_browser: bool,
    policy: WaitPolicy,
) -> Result<LabSession, AiscalatorError> {
    let analyzer = LogRegexAnalyzer::new(JUPYTER_TOKEN_PATTERN)?;
    info!("Running...: {}", render_command(argv));
    let handle = runner
        .spawn(argv, analyzer.sink())
        .map_err(|err| spawn_failure(err, argv))?;
    for attempt in 1..=policy.attempts {
        thread::sleep(policy.interval);
        if analyzer.artifact().is_some() {
            break;
        }
        warn!("docker run does not seem to be up yet... retrying ({attempt}/{})", policy.attempts);
    }
    let url = analyzer.artifact().map(|token| {
        format!("http://localhost:{port}/lab/tree/{folder}/{notebook}?token={token}")
    });
    if let Some(url) = &url {
        info!("{url} is up and running.");
        if open_browser {
            open_in_browser(url);
        }
    }
    Ok(LabSession { url, handle })
}

fn open_in_browser(url: &str) {
    let opener = which::which("xdg-open").or_else(|_| which::which("open"));
    match opener {
        Ok(opener) => {
            let spawned = Command::new(opener)
                .arg(url)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn();
            if let Err(err) = spawned {
                warn!("unable to open a browser: {err}");
            }
        }
        Err(_) => warn!("no browser opener found; open {url} manually"),
    }
}
