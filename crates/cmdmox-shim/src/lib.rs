// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The CmdMox launcher ("shim").
//!
//! Every mocked command resolves to this single-shot program via a PATH
//! entry. It recovers the command identity from argv[0], reports the
//! invocation to the controller over IPC, and applies whatever behavior
//! comes back: canned stdio, or a passthrough directive to run the real
//! binary and report its outcome. The launcher knows nothing about
//! matching, ordering, or verification.

use std::collections::BTreeMap;
use std::io::{IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use wait_timeout::ChildExt;

use cmdmox_ipc::{invoke_server, report_passthrough_result, Endpoint, RetryConfig};
use cmdmox_proto::{
    Invocation, PassthroughRequest, PassthroughResult, Response, CMDMOX_IPC_SOCKET_ENV,
    CMDMOX_IPC_TIMEOUT_ENV, CMDMOX_REAL_COMMAND_ENV_PREFIX,
};

/// Passthrough execution exceeded its timeout.
pub const EXIT_PASSTHROUGH_TIMEOUT: i32 = 124;
/// Passthrough target exists but cannot be executed.
pub const EXIT_NOT_EXECUTABLE: i32 = 126;
/// Passthrough target was not found on the lookup path.
pub const EXIT_NOT_FOUND: i32 = 127;

const DEFAULT_TIMEOUT_SECONDS: f64 = 5.0;

/// Run the launcher; the return value is the process exit code.
pub fn run() -> i32 {
    let args: Vec<String> = std::env::args().collect();
    let command = match command_identity(args.first().map(String::as_str)) {
        Some(command) => command,
        None => {
            eprintln!("cmdmox shim: cannot determine command name from argv[0]");
            return 1;
        }
    };
    let forwarded = normalize_args(args.into_iter().skip(1).collect());

    let (endpoint, timeout) = match transport_config() {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{message}");
            return 1;
        }
    };

    let invocation = Invocation::new(
        command,
        forwarded,
        read_stdin(),
        std::env::vars().collect(),
        uuid::Uuid::new_v4().simple().to_string(),
    );

    let retry = RetryConfig::default();
    let response = match invoke_server(&endpoint, &invocation, timeout, &retry) {
        Ok(response) => response,
        Err(err) => {
            eprintln!("cmdmox shim: IPC error: {err}");
            return 1;
        }
    };

    let response = if let Some(directive) = response.passthrough.clone() {
        let result = execute_passthrough(&invocation, &directive);
        match report_passthrough_result(&endpoint, &result, timeout, &retry) {
            Ok(final_response) => final_response,
            Err(err) => {
                eprintln!("cmdmox shim: IPC error: {err}");
                return 1;
            }
        }
    } else {
        response
    };

    write_response(&response)
}

/// Recover the command name from argv[0]: basename, with the launcher
/// extension stripped on Windows.
pub fn command_identity(argv0: Option<&str>) -> Option<String> {
    let raw = argv0?;
    let name = Path::new(raw).file_name()?.to_string_lossy().into_owned();
    if name.is_empty() {
        return None;
    }
    if cfg!(windows) {
        for extension in [".cmd", ".bat", ".exe"] {
            if let Some(stripped) = name
                .to_ascii_lowercase()
                .strip_suffix(extension)
                .map(|_| &name[..name.len() - extension.len()])
            {
                return Some(stripped.to_string());
            }
        }
    }
    Some(name)
}

/// Undo one batch-escape layer on Windows: runs of `^^` collapse to `^`.
pub fn normalize_args(args: Vec<String>) -> Vec<String> {
    if !cfg!(windows) {
        return args;
    }
    args.into_iter().map(|arg| arg.replace("^^", "^")).collect()
}

fn transport_config() -> Result<(Endpoint, Duration), String> {
    let socket = std::env::var(CMDMOX_IPC_SOCKET_ENV)
        .map_err(|_| format!("cmdmox shim: {CMDMOX_IPC_SOCKET_ENV} is not set"))?;

    let raw_timeout = std::env::var(CMDMOX_IPC_TIMEOUT_ENV)
        .unwrap_or_else(|_| DEFAULT_TIMEOUT_SECONDS.to_string());
    let seconds: f64 = raw_timeout
        .parse()
        .map_err(|_| format!("cmdmox shim: invalid timeout: {raw_timeout:?}"))?;
    if !(seconds > 0.0 && seconds.is_finite()) {
        return Err(format!("cmdmox shim: invalid timeout: {raw_timeout:?}"));
    }

    Ok((
        Endpoint::new(PathBuf::from(socket)),
        Duration::from_secs_f64(seconds),
    ))
}

// Only read stdin when it is not an interactive console, to avoid hanging a
// terminal session that happens to trip a shim.
fn read_stdin() -> String {
    let stdin = std::io::stdin();
    if stdin.is_terminal() {
        return String::new();
    }
    let mut buffer = Vec::new();
    if stdin.lock().read_to_end(&mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

fn write_response(response: &Response) -> i32 {
    // Later commands in the same process inherit the overrides cumulatively.
    for (key, value) in &response.env {
        std::env::set_var(key, value);
    }
    let mut stdout = std::io::stdout();
    let _ = stdout.write_all(response.stdout.as_bytes());
    let _ = stdout.flush();
    let mut stderr = std::io::stderr();
    let _ = stderr.write_all(response.stderr.as_bytes());
    let _ = stderr.flush();
    response.exit_code
}

// ----------------------------------------------------------------------
// Passthrough execution
// ----------------------------------------------------------------------

/// Run the real command described by *directive* and capture its outcome.
pub fn execute_passthrough(
    invocation: &Invocation,
    directive: &PassthroughRequest,
) -> PassthroughResult {
    let (stdout, stderr, exit_code) = match resolve_target(invocation, directive) {
        Ok(target) => run_real_command(invocation, directive, &target),
        Err((message, code)) => (String::new(), message, code),
    };
    PassthroughResult {
        invocation_id: directive.invocation_id.clone(),
        stdout,
        stderr,
        exit_code,
    }
}

fn resolve_target(
    invocation: &Invocation,
    directive: &PassthroughRequest,
) -> Result<PathBuf, (String, i32)> {
    let override_var = format!("{CMDMOX_REAL_COMMAND_ENV_PREFIX}{}", invocation.command);
    if let Ok(override_path) = std::env::var(&override_var) {
        return validate_override(&invocation.command, &override_path);
    }

    let search_path = passthrough_search_path(
        invocation.env.get("PATH").map(String::as_str),
        &directive.lookup_path,
    );
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    which::which_in(&invocation.command, Some(&search_path), cwd).map_err(|_| {
        (
            format!("{}: not found", invocation.command),
            EXIT_NOT_FOUND,
        )
    })
}

fn validate_override(command: &str, override_path: &str) -> Result<PathBuf, (String, i32)> {
    let path = PathBuf::from(override_path);
    if !path.exists() {
        return Err((format!("{command}: not found"), EXIT_NOT_FOUND));
    }
    if !path.is_file() {
        return Err((
            format!("{command}: invalid executable path"),
            EXIT_NOT_EXECUTABLE,
        ));
    }
    if !is_executable(&path) {
        return Err((format!("{command}: not executable"), EXIT_NOT_EXECUTABLE));
    }
    Ok(path)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|metadata| metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(windows)]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Combine the captured PATH with the directive's lookup path, dropping the
/// shim directory (derived from the socket variable) and duplicates.
pub fn passthrough_search_path(env_path: Option<&str>, lookup_path: &str) -> String {
    let shim_dir = std::env::var(CMDMOX_IPC_SOCKET_ENV)
        .ok()
        .and_then(|socket| Path::new(&socket).parent().map(Path::to_path_buf));
    let sep = if cfg!(windows) { ';' } else { ':' };

    let mut entries: Vec<String> = Vec::new();
    let mut push_unique = |entry: &str| {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            return;
        }
        if let Some(shim_dir) = &shim_dir {
            if Path::new(trimmed) == shim_dir.as_path() {
                return;
            }
        }
        if !entries.iter().any(|existing| existing == trimmed) {
            entries.push(trimmed.to_string());
        }
    };

    for entry in env_path.unwrap_or_default().split(sep) {
        push_unique(entry);
    }
    for entry in lookup_path.split(sep) {
        push_unique(entry);
    }
    entries.join(&sep.to_string())
}

fn run_real_command(
    invocation: &Invocation,
    directive: &PassthroughRequest,
    target: &Path,
) -> (String, String, i32) {
    let search_path =
        passthrough_search_path(invocation.env.get("PATH").map(String::as_str), &directive.lookup_path);

    let mut env: BTreeMap<String, String> = invocation.env.clone();
    env.insert("PATH".to_string(), search_path);
    // Expectation-declared env wins on conflict.
    env.extend(directive.extra_env.clone());

    let timeout = Duration::from_secs_f64(directive.timeout.max(0.0));
    let mut child = match std::process::Command::new(target)
        .args(&invocation.args)
        .env_clear()
        .envs(&env)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            return (
                String::new(),
                format!("{}: {err}", invocation.command),
                EXIT_NOT_EXECUTABLE,
            );
        }
    };

    if let Some(mut stdin_pipe) = child.stdin.take() {
        // The child may exit without draining stdin; a broken pipe is fine.
        let _ = stdin_pipe.write_all(invocation.stdin.as_bytes());
    }

    let stdout_reader = spawn_pipe_reader(child.stdout.take());
    let stderr_reader = spawn_pipe_reader(child.stderr.take());

    let status = match child.wait_timeout(timeout) {
        Ok(Some(status)) => status,
        Ok(None) => {
            let _ = child.kill();
            let _ = child.wait();
            let stdout = join_pipe_reader(stdout_reader);
            let stderr_tail = join_pipe_reader(stderr_reader);
            let seconds = directive.timeout;
            let mut stderr =
                format!("{}: timed out after {seconds} seconds", invocation.command);
            if !stderr_tail.is_empty() {
                stderr.push('\n');
                stderr.push_str(&stderr_tail);
            }
            return (stdout, stderr, EXIT_PASSTHROUGH_TIMEOUT);
        }
        Err(err) => {
            let _ = child.kill();
            return (
                String::new(),
                format!("{}: {err}", invocation.command),
                1,
            );
        }
    };

    let stdout = join_pipe_reader(stdout_reader);
    let stderr = join_pipe_reader(stderr_reader);
    (stdout, stderr, status.code().unwrap_or(1))
}

fn spawn_pipe_reader<R>(pipe: Option<R>) -> Option<std::thread::JoinHandle<String>>
where
    R: Read + Send + 'static,
{
    pipe.map(|mut reader| {
        std::thread::spawn(move || {
            let mut buffer = Vec::new();
            let _ = reader.read_to_end(&mut buffer);
            String::from_utf8_lossy(&buffer).into_owned()
        })
    })
}

fn join_pipe_reader(handle: Option<std::thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}
