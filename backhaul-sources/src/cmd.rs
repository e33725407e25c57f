//! Logged subprocess execution.
//!
//! Every external tool invocation appends its output to per-unit log
//! files under `<root>/Logs/<unit-subtree>/<YYYYMMDD>.out` / `.err`, with
//! start/end stamps, so a failing run can be diagnosed days later. On
//! failure, the tail of the `.err` file is surfaced through tracing.

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use chrono::Local;
use wait_timeout::ChildExt;

use crate::error::{io_err, SourceError};

const LOG_EXCERPT_MAX_BYTES: u64 = 4096;
const LOG_EXCERPT_MAX_LINES: usize = 10;
const LOG_DATE_FMT: &str = "%Y%m%d";

/// Exit disposition of a logged command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmdStatus {
    Success,
    Failed { code: i32 },
    TimedOut { after: Duration },
}

impl CmdStatus {
    pub fn success(&self) -> bool {
        matches!(self, CmdStatus::Success)
    }

    /// Exit code, if the process ran to completion.
    pub fn code(&self) -> Option<i32> {
        match self {
            CmdStatus::Success => Some(0),
            CmdStatus::Failed { code } => Some(*code),
            CmdStatus::TimedOut { .. } => None,
        }
    }
}

/// Result of a logged command: disposition plus a failure excerpt from the
/// `.err` log when the command did not succeed.
#[derive(Debug)]
pub struct CmdOutcome {
    pub status: CmdStatus,
    pub excerpt: Option<String>,
}

/// Append-mode log pair for one unit and day.
pub struct LogFiles {
    pub out: File,
    pub err: File,
    err_path: PathBuf,
}

impl LogFiles {
    pub fn open(log_dir: &Path) -> Result<LogFiles, SourceError> {
        std::fs::create_dir_all(log_dir).map_err(|e| io_err(log_dir, e))?;
        let day = Local::now().format(LOG_DATE_FMT).to_string();
        let out_path = log_dir.join(format!("{day}.out"));
        let err_path = log_dir.join(format!("{day}.err"));
        let open = |path: &Path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| io_err(path, e))
        };
        Ok(LogFiles {
            out: open(&out_path)?,
            err: open(&err_path)?,
            err_path,
        })
    }

    fn stamp(&mut self, line: &str) {
        let ts = Local::now().format("%Y-%m-%d %H:%M:%S");
        for fh in [&mut self.out, &mut self.err] {
            let _ = writeln!(fh, "# {line} at {ts}");
        }
    }

    fn note(&mut self, line: &str) {
        for fh in [&mut self.out, &mut self.err] {
            let _ = writeln!(fh, "# {line}");
        }
    }
}

/// Render a command for log headers and error messages.
pub fn render_command(cmd: &Command) -> String {
    let mut rendered = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        let _ = write!(rendered, " {}", arg.to_string_lossy());
    }
    rendered
}

/// Run `cmd` with stdout/stderr appended to the day's log files, bounded
/// by `timeout`. A timed-out child is killed and reported as
/// [`CmdStatus::TimedOut`]; it never hangs the worker.
pub fn run_logged(
    mut cmd: Command,
    log_dir: &Path,
    timeout: Option<Duration>,
) -> Result<CmdOutcome, SourceError> {
    let rendered = render_command(&cmd);
    let mut logs = LogFiles::open(log_dir)?;
    logs.stamp("Starting task");
    logs.note(&rendered);

    let program = cmd.get_program().to_string_lossy().into_owned();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(
            logs.out.try_clone().map_err(|e| io_err(log_dir, e))?,
        ))
        .stderr(Stdio::from(
            logs.err.try_clone().map_err(|e| io_err(log_dir, e))?,
        ));

    let mut child = cmd.spawn().map_err(|e| SourceError::Tool {
        tool: program.clone(),
        detail: format!("failed to spawn: {e}"),
    })?;

    let status = match timeout {
        Some(limit) => match child.wait_timeout(limit).map_err(|e| io_err(log_dir, e))? {
            Some(status) => exit_to_status(status),
            None => {
                let _ = child.kill();
                let _ = child.wait();
                CmdStatus::TimedOut { after: limit }
            }
        },
        None => exit_to_status(child.wait().map_err(|e| io_err(log_dir, e))?),
    };

    match &status {
        CmdStatus::Success => logs.note("Task exited with status 0"),
        CmdStatus::Failed { code } => logs.note(&format!("Task exited with status {code}")),
        CmdStatus::TimedOut { after } => {
            logs.note(&format!("Task killed after {}s timeout", after.as_secs()))
        }
    }
    logs.stamp("Ending task");

    let excerpt = if status.success() {
        None
    } else {
        let excerpt = err_excerpt(&logs.err_path).unwrap_or_default();
        tracing::error!(command = %rendered, status = ?status, "task failed\n{excerpt}");
        Some(excerpt)
    };

    Ok(CmdOutcome { status, excerpt })
}

fn exit_to_status(status: std::process::ExitStatus) -> CmdStatus {
    if status.success() {
        CmdStatus::Success
    } else {
        CmdStatus::Failed {
            code: status.code().unwrap_or(-1),
        }
    }
}

/// Tail of the `.err` log, bounded in bytes and lines, for failure
/// reporting.
fn err_excerpt(err_path: &Path) -> Option<String> {
    let mut file = File::open(err_path).ok()?;
    let len = file.metadata().ok()?.len();
    let start = len.saturating_sub(LOG_EXCERPT_MAX_BYTES);
    file.seek(SeekFrom::Start(start)).ok()?;
    let mut tail = String::new();
    file.take(LOG_EXCERPT_MAX_BYTES)
        .read_to_string(&mut tail)
        .ok()?;
    Some(tail_excerpt(&tail, start > 0))
}

/// Reduce raw log tail to at most [`LOG_EXCERPT_MAX_LINES`] lines, with a
/// `[...]` marker when content was dropped.
fn tail_excerpt(tail: &str, truncated_at_front: bool) -> String {
    let trimmed = tail.trim();
    let lines: Vec<&str> = trimmed.lines().collect();
    if lines.len() > LOG_EXCERPT_MAX_LINES || truncated_at_front {
        let mut kept: Vec<&str> = vec!["[...]"];
        let skip = lines.len().saturating_sub(LOG_EXCERPT_MAX_LINES);
        kept.extend(&lines[skip..]);
        kept.join("\n")
    } else {
        trimmed.to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn successful_command_logs_and_reports() {
        let dir = TempDir::new().unwrap();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo to-stdout; echo to-stderr >&2"]);
        let outcome = run_logged(cmd, dir.path(), None).unwrap();
        assert!(outcome.status.success());
        assert!(outcome.excerpt.is_none());

        let day = Local::now().format(LOG_DATE_FMT).to_string();
        let out = std::fs::read_to_string(dir.path().join(format!("{day}.out"))).unwrap();
        let err = std::fs::read_to_string(dir.path().join(format!("{day}.err"))).unwrap();
        assert!(out.contains("to-stdout"));
        assert!(err.contains("to-stderr"));
        assert!(out.contains("# Starting task"));
        assert!(out.contains("Task exited with status 0"));
    }

    #[test]
    fn failed_command_yields_excerpt() {
        let dir = TempDir::new().unwrap();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo boom >&2; exit 3"]);
        let outcome = run_logged(cmd, dir.path(), None).unwrap();
        assert_eq!(outcome.status, CmdStatus::Failed { code: 3 });
        assert!(outcome.excerpt.unwrap().contains("boom"));
    }

    #[test]
    fn timeout_kills_child() {
        let dir = TempDir::new().unwrap();
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let outcome = run_logged(cmd, dir.path(), Some(Duration::from_millis(100))).unwrap();
        assert!(matches!(outcome.status, CmdStatus::TimedOut { .. }));
    }

    #[test]
    fn excerpt_limits_lines() {
        let many: String = (0..30).map(|i| format!("line {i}\n")).collect();
        let excerpt = tail_excerpt(&many, false);
        let lines: Vec<&str> = excerpt.lines().collect();
        assert_eq!(lines[0], "[...]");
        assert_eq!(lines.len(), LOG_EXCERPT_MAX_LINES + 1);
        assert_eq!(*lines.last().unwrap(), "line 29");
    }

    #[test]
    fn excerpt_marks_front_truncation() {
        let excerpt = tail_excerpt("only line", true);
        assert!(excerpt.starts_with("[...]"));
        assert!(excerpt.ends_with("only line"));
    }

    #[test]
    fn short_excerpt_passes_through() {
        assert_eq!(tail_excerpt("  a\nb  ", false), "a\nb");
    }

    #[test]
    fn render_includes_args() {
        let mut cmd = Command::new("rsync");
        cmd.args(["-a", "src/", "dst/"]);
        assert_eq!(render_command(&cmd), "rsync -a src/ dst/");
    }
}
