use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{ToolFailure, ToolFailureKind};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const DIAGNOSTIC_LIMIT: usize = 4000;

#[derive(Debug, Clone)]
pub struct Invocation {
    pub tool: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

impl Invocation {
    pub fn new(tool: &str, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            tool: tool.to_string(),
            program: program.into(),
            args,
            env: BTreeMap::new(),
            cwd: None,
            timeout: Duration::from_secs(600),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_env(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn with_cwd(mut self, cwd: &Path) -> Self {
        self.cwd = Some(cwd.to_path_buf());
        self
    }

    fn failure(&self, kind: ToolFailureKind, diagnostics: String) -> ToolFailure {
        ToolFailure::new(&self.tool, &self.args, kind, diagnostics)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs the invocation to completion, killing it once the timeout elapses.
/// Output is spooled to anonymous files so large diagnostics cannot block
/// the child on a full pipe.
pub fn run(invocation: &Invocation) -> Result<ProcessOutput, ToolFailure> {
    let spool = |name: &str| {
        tempfile::tempfile().map_err(|err| {
            invocation.failure(ToolFailureKind::Spawn, format!("{name} spool: {err}"))
        })
    };
    let mut stdout_file = spool("stdout")?;
    let mut stderr_file = spool("stderr")?;
    let stdout_handle = stdout_file
        .try_clone()
        .map_err(|err| invocation.failure(ToolFailureKind::Spawn, err.to_string()))?;
    let stderr_handle = stderr_file
        .try_clone()
        .map_err(|err| invocation.failure(ToolFailureKind::Spawn, err.to_string()))?;

    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .envs(&invocation.env)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_handle))
        .stderr(Stdio::from(stderr_handle));
    if let Some(dir) = &invocation.cwd {
        cmd.current_dir(dir);
    }

    debug!(
        tool = %invocation.tool,
        program = %invocation.program.display(),
        args = ?invocation.args,
        "spawning"
    );
    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|err| {
        invocation.failure(
            ToolFailureKind::Spawn,
            format!("{}: {err}", invocation.program.display()),
        )
    })?;

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if start.elapsed() >= invocation.timeout => {
                let _ = child.kill();
                let _ = child.wait();
                let stderr = read_spool(&mut stderr_file);
                return Err(invocation.failure(
                    ToolFailureKind::Timeout {
                        seconds: invocation.timeout.as_secs(),
                    },
                    truncate(&stderr),
                ));
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(err) => {
                let _ = child.kill();
                return Err(invocation.failure(ToolFailureKind::Spawn, err.to_string()));
            }
        }
    };

    let output = ProcessOutput {
        stdout: read_spool(&mut stdout_file),
        stderr: read_spool(&mut stderr_file),
    };
    debug!(
        tool = %invocation.tool,
        elapsed_ms = start.elapsed().as_millis() as u64,
        code = ?status.code(),
        "finished"
    );
    if status.success() {
        return Ok(output);
    }
    let diagnostics = if output.stderr.trim().is_empty() {
        output.stdout.trim().to_string()
    } else {
        output.stderr.trim().to_string()
    };
    Err(invocation.failure(
        ToolFailureKind::ExitStatus(status.code()),
        truncate(&diagnostics),
    ))
}

fn read_spool(file: &mut File) -> String {
    let mut buffer = Vec::new();
    if file.seek(SeekFrom::Start(0)).is_ok() {
        let _ = file.read_to_end(&mut buffer);
    }
    String::from_utf8_lossy(&buffer).to_string()
}

fn truncate(text: &str) -> String {
    if text.len() <= DIAGNOSTIC_LIMIT {
        return text.to_string();
    }
    let mut cut = text.len() - DIAGNOSTIC_LIMIT;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    format!("...{}", &text[cut..])
}

/// Resolves a program to an executable path: absolute and relative paths are
/// taken as given, bare names are searched in `PATH`.
pub fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 || program.is_absolute() {
        return program.is_file().then(|| program.to_path_buf());
    }
    find_in_path(&program.to_string_lossy())
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.is_file() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.is_file() {
            return Some(plain);
        }
    }
    None
}
