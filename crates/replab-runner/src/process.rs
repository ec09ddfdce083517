//! External program invocation with a hard deadline and the stage token
//! protocol.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

pub const STAGE_OK_TOKEN: &str = "REPLAB_STAGE_OK";
pub const STAGE_FAILED_TOKEN: &str = "REPLAB_STAGE_FAILED";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// `None` when the process was killed at the deadline or ended by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr_tail: String,
    pub timed_out: bool,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageSignal {
    Ok,
    Failed(String),
    Missing,
}

/// The failure token wins over a success token printed earlier.
pub fn parse_stage_signal(stdout: &str) -> StageSignal {
    let mut ok = false;
    for line in stdout.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix(STAGE_FAILED_TOKEN) {
            let detail = rest.trim_start_matches(':').trim();
            return StageSignal::Failed(if detail.is_empty() {
                "stage reported failure without detail".to_string()
            } else {
                detail.to_string()
            });
        }
        if line == STAGE_OK_TOKEN {
            ok = true;
        }
    }
    if ok {
        StageSignal::Ok
    } else {
        StageSignal::Missing
    }
}

pub fn build_command(command: &[String], run_dir: &Path) -> Result<Command> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("empty command line"))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.arg("--run-dir").arg(run_dir);
    cmd.env("REPLAB_RUN_DIR", run_dir);
    Ok(cmd)
}

/// Run `cmd` to completion or kill it at `timeout`. Output readers are
/// detached on timeout so a grandchild holding the pipe cannot block us.
pub fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<ProcessOutput> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let start = Instant::now();
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {:?}", cmd.get_program()))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_reader = thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut s) = stdout {
            let _ = s.read_to_string(&mut buf);
        }
        buf
    });
    let err_reader = thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut s) = stderr {
            let _ = s.read_to_string(&mut buf);
        }
        buf
    });

    let deadline = start + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break Some(status);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            break None;
        }
        thread::sleep(POLL_INTERVAL);
    };

    let Some(status) = status else {
        return Ok(ProcessOutput {
            exit_code: None,
            stdout: String::new(),
            stderr_tail: String::new(),
            timed_out: true,
            elapsed: start.elapsed(),
        });
    };
    let stdout = out_reader.join().unwrap_or_default();
    let stderr = err_reader.join().unwrap_or_default();
    let stderr_tail = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .to_string();
    Ok(ProcessOutput {
        exit_code: status.code(),
        stdout,
        stderr_tail,
        timed_out: false,
        elapsed: start.elapsed(),
    })
}

/// Map a finished process onto the stage contract.
pub fn interpret_stage_output(output: &ProcessOutput, timeout: Duration) -> Result<(), String> {
    if output.timed_out {
        return Err(format!("timed out after {}s", timeout.as_secs()));
    }
    match parse_stage_signal(&output.stdout) {
        StageSignal::Failed(detail) => Err(detail),
        StageSignal::Missing => Err(format!(
            "no {} token (exit {}){}",
            STAGE_OK_TOKEN,
            output
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            if output.stderr_tail.is_empty() {
                String::new()
            } else {
                format!(": {}", output.stderr_tail)
            }
        )),
        StageSignal::Ok if output.exit_code != Some(0) => Err(format!(
            "success token printed but exit status was {:?}",
            output.exit_code
        )),
        StageSignal::Ok => Ok(()),
    }
}
