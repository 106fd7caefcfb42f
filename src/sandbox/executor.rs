use anyhow::{Context, Result};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Most bytes of stderr/stdout kept from a child run.
const MAX_CAPTURED_OUTPUT: usize = 16 * 1024;

/// Pipe read size.
const READ_CHUNK: usize = 8 * 1024;

/// A fully built command line: program plus argument vector.
///
/// Built by pure functions and only handed to the OS as a vector, never
/// through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub current_dir: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Working directory for the child.
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// `--flag value` pair, appended as two separate entries.
    pub fn opt(self, flag: &str, value: impl Into<OsString>) -> Self {
        self.arg(flag).arg(value)
    }

    /// Whether `token` appears as a whole argument.
    pub fn contains(&self, token: impl AsRef<OsStr>) -> bool {
        let token = token.as_ref();
        self.args.iter().any(|a| a == token)
    }

    /// Argument following the first occurrence of `flag`.
    pub fn value_after(&self, flag: impl AsRef<OsStr>) -> Option<&OsStr> {
        let flag = flag.as_ref();
        let pos = self.args.iter().position(|a| a == flag)?;
        self.args.get(pos + 1).map(OsString::as_os_str)
    }

    /// Whether `sequence` appears as consecutive arguments.
    pub fn contains_sequence(&self, sequence: &[&str]) -> bool {
        if sequence.is_empty() {
            return true;
        }
        self.args
            .windows(sequence.len())
            .any(|w| w.iter().zip(sequence).all(|(a, b)| a == OsStr::new(b)))
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Path::new(&self.program).display())?;
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " {:?}", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Outcome of a finished (not timed out) child process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    /// Last non-empty stderr line, which is where the fetch helper writes
    /// its verdict.
    pub fn last_stderr_line(&self) -> Option<&str> {
        self.stderr.lines().rev().find(|l| !l.trim().is_empty())
    }
}

/// Run `invocation` and wait at most `timeout` for it.
///
/// stdout and stderr are drained while the child runs and only their last
/// [`MAX_CAPTURED_OUTPUT`] bytes are held, however much the child writes.
/// On timeout the child is killed (it is dropped with `kill_on_drop`) and
/// an error is returned.
pub async fn run_with_timeout(invocation: &Invocation, timeout: Duration) -> Result<ProcessOutput> {
    let mut command = tokio::process::Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &invocation.current_dir {
        command.current_dir(dir);
    }

    let mut child = command.spawn().with_context(|| {
        format!(
            "Failed to start {}",
            Path::new(&invocation.program).display()
        )
    })?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let run = async {
        let (stdout, stderr, status) =
            tokio::join!(read_tail(stdout), read_tail(stderr), child.wait());
        anyhow::Ok((status?, stdout?, stderr?))
    };
    let (status, stdout, stderr) = tokio::time::timeout(timeout, run)
        .await
        .map_err(|_| anyhow::anyhow!("Process timed out after {}s", timeout.as_secs()))?
        .with_context(|| format!("Failed to run {}", Path::new(&invocation.program).display()))?;

    Ok(ProcessOutput {
        success: status.success(),
        exit_code: status.code(),
        stdout: stdout.into_string(),
        stderr: stderr.into_string(),
    })
}

/// Last [`MAX_CAPTURED_OUTPUT`] bytes of a stream, plus how much was dropped.
#[derive(Debug, Default)]
struct OutputTail {
    buf: Vec<u8>,
    dropped: usize,
}

impl OutputTail {
    fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        // Compact once the buffer holds two windows' worth
        if self.buf.len() > 2 * MAX_CAPTURED_OUTPUT {
            self.compact();
        }
    }

    fn compact(&mut self) {
        if self.buf.len() > MAX_CAPTURED_OUTPUT {
            let excess = self.buf.len() - MAX_CAPTURED_OUTPUT;
            self.buf.drain(..excess);
            self.dropped += excess;
        }
    }

    fn into_string(mut self) -> String {
        self.compact();
        if self.dropped == 0 {
            return String::from_utf8_lossy(&self.buf).into_owned();
        }

        // Keep the tail: the helper's verdict is the last line. Skip a
        // multi-byte character cut in half by the window.
        let skip = self
            .buf
            .iter()
            .take(3)
            .take_while(|b| (**b & 0xC0) == 0x80)
            .count();
        format!(
            "[{} bytes truncated]\n{}",
            self.dropped + skip,
            String::from_utf8_lossy(&self.buf[skip..])
        )
    }
}

async fn read_tail<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<OutputTail> {
    let mut tail = OutputTail::default();
    let Some(mut reader) = reader else {
        return Ok(tail);
    };
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(tail);
        }
        tail.push(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_queries() {
        let inv = Invocation::new("bwrap")
            .arg("--die-with-parent")
            .opt("--tmpfs", "/tmp")
            .args(["--ro-bind", "/usr", "/usr"]);

        assert!(inv.contains("--die-with-parent"));
        assert!(!inv.contains("--die"));
        assert_eq!(inv.value_after("--tmpfs"), Some(OsStr::new("/tmp")));
        assert_eq!(inv.value_after("--missing"), None);
        assert!(inv.contains_sequence(&["--ro-bind", "/usr", "/usr"]));
        assert!(!inv.contains_sequence(&["--ro-bind", "/usr", "/bin"]));
    }

    #[test]
    fn test_invocation_display_quotes_spaces() {
        let inv = Invocation::new("docker").arg("run").arg("a b");
        assert_eq!(inv.to_string(), "docker run \"a b\"");
    }

    #[test]
    fn test_output_tail_keeps_tail() {
        let mut tail = OutputTail::default();
        for _ in 0..100 {
            tail.push(&[b'x'; READ_CHUNK]);
            assert!(tail.buf.len() <= 2 * MAX_CAPTURED_OUTPUT);
        }
        tail.push(b"\nSUCCESS: done");
        let text = tail.into_string();
        let expected_dropped = 100 * READ_CHUNK + 14 - MAX_CAPTURED_OUTPUT;
        assert!(text.starts_with(&format!("[{} bytes truncated]\n", expected_dropped)));
        assert!(text.ends_with("SUCCESS: done"));
    }

    #[test]
    fn test_output_tail_short_output_untouched() {
        let mut tail = OutputTail::default();
        tail.push(b"hello\n");
        assert_eq!(tail.into_string(), "hello\n");
    }

    #[test]
    fn test_output_tail_skips_split_character() {
        let mut tail = OutputTail::default();
        tail.push(&[b'x'; MAX_CAPTURED_OUTPUT]);
        // 'é' is two bytes; the window starts on its second byte
        tail.push("é".as_bytes());
        tail.push(&[b'y'; MAX_CAPTURED_OUTPUT - 1]);
        let text = tail.into_string();
        assert!(!text.contains('\u{FFFD}'));
        assert!(text.starts_with(&format!("[{} bytes truncated]\n", MAX_CAPTURED_OUTPUT + 2)));
    }

    #[test]
    fn test_last_stderr_line() {
        let out = ProcessOutput {
            success: false,
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "noise\nERROR: too large\n\n".to_string(),
        };
        assert_eq!(out.last_stderr_line(), Some("ERROR: too large"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_with_timeout_success() {
        let inv = Invocation::new("sh").args(["-c", "echo out; echo err >&2"]);
        let out = run_with_timeout(&inv, Duration::from_secs(10)).await.unwrap();
        assert!(out.success);
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.last_stderr_line(), Some("err"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_bounds_large_output() {
        let script = "head -c 1048576 /dev/zero | tr '\\0' x; echo; echo 'SUCCESS: done' >&2";
        let inv = Invocation::new("sh").args(["-c", script]);
        let out = run_with_timeout(&inv, Duration::from_secs(30)).await.unwrap();
        assert!(out.success);
        assert!(out.stdout.starts_with('['));
        assert!(out.stdout.len() <= MAX_CAPTURED_OUTPUT + 64);
        assert!(out.stdout.trim_end().ends_with('x'));
        assert_eq!(out.last_stderr_line(), Some("SUCCESS: done"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_in_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let inv = Invocation::new("sh").args(["-c", "touch marker"]).in_dir(tmp.path());
        let out = run_with_timeout(&inv, Duration::from_secs(10)).await.unwrap();
        assert!(out.success);
        assert!(tmp.path().join("marker").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_with_timeout_nonzero_exit() {
        let inv = Invocation::new("sh").args(["-c", "exit 3"]);
        let out = run_with_timeout(&inv, Duration::from_secs(10)).await.unwrap();
        assert!(!out.success);
        assert_eq!(out.exit_code, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_with_timeout_expires() {
        let inv = Invocation::new("sleep").arg("5");
        let err = run_with_timeout(&inv, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_run_with_timeout_missing_program() {
        let inv = Invocation::new("/nonexistent/defuse-test-binary");
        assert!(run_with_timeout(&inv, Duration::from_secs(1)).await.is_err());
    }
}
