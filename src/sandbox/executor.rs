use serde::Serialize;
use tracing::debug;

use super::command::SharedBuffer;
use super::error::{Result, SandboxError};
use super::policy::Sandbox;

/// Default cap on captured output per stream.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Output of a command run through [`run_captured`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr under a `STDERR:` header, the way tool
    /// results are presented to an agent.
    pub fn combined(&self) -> String {
        let mut result = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !result.is_empty() {
                result.push_str("\n\nSTDERR:\n");
            }
            result.push_str(&self.stderr);
        }
        result
    }
}

/// Run `name args...` inside the sandbox and capture both output streams.
///
/// Each stream is truncated to `max_output_bytes`. A non-zero exit is
/// reported in `exit_code`; timeouts, cancellation and spawn failures are
/// still returned as errors.
pub async fn run_captured(
    sandbox: &Sandbox,
    name: &str,
    args: &[String],
    max_output_bytes: usize,
) -> Result<CapturedOutput> {
    let mut cmd = sandbox.execute(name, args)?;
    let stdout = SharedBuffer::with_limit(max_output_bytes);
    let stderr = SharedBuffer::with_limit(max_output_bytes);
    cmd.set_stdout(stdout.clone());
    cmd.set_stderr(stderr.clone());

    let exit_code = match cmd.run().await {
        Ok(()) => 0,
        Err(SandboxError::ExitStatus { code }) => code,
        Err(e) => return Err(e),
    };

    debug!(
        command = name,
        exit_code,
        stdout_bytes = stdout.total_len(),
        stderr_bytes = stderr.total_len(),
        "captured command output"
    );

    Ok(CapturedOutput {
        stdout: truncate_output(&stdout.contents(), stdout.total_len(), max_output_bytes),
        stderr: truncate_output(&stderr.contents(), stderr.total_len(), max_output_bytes),
        exit_code,
    })
}

/// Render at most `max_bytes` of `data`, noting `total` when output was cut.
fn truncate_output(data: &[u8], total: usize, max_bytes: usize) -> String {
    let kept = &data[..data.len().min(max_bytes)];
    if total <= max_bytes {
        return String::from_utf8_lossy(kept).into_owned();
    }
    // Drop a multi-byte char split by the cut.
    let kept = match std::str::from_utf8(kept) {
        Err(e) if e.error_len().is_none() => &kept[..e.valid_up_to()],
        _ => kept,
    };
    format!(
        "{}\n\n[Output truncated, {} bytes total]",
        String::from_utf8_lossy(kept),
        total
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::policy::{Config, IsolationMode};
    use std::time::Duration;

    #[test]
    fn test_truncate_output_short_is_unchanged() {
        assert_eq!(truncate_output(b"hello", 5, 10), "hello");
    }

    #[test]
    fn test_truncate_output_marks_truncation() {
        let out = truncate_output(b"abcd", 10, 4);
        assert!(out.starts_with("abcd\n\n[Output truncated, 10 bytes total]"));
    }

    #[test]
    fn test_truncate_output_respects_char_boundary() {
        // 'é' is two bytes; cutting at 2 would split it.
        let out = truncate_output(&"aé-tail".as_bytes()[..2], 8, 2);
        assert!(out.starts_with("a\n\n[Output truncated"));
    }

    #[test]
    fn test_combined_output() {
        let out = CapturedOutput {
            stdout: "out".into(),
            stderr: "err".into(),
            exit_code: 1,
        };
        assert_eq!(out.combined(), "out\n\nSTDERR:\nerr");
        assert!(!out.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captured_reports_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(Config {
            work_dir: Some(tmp.path().to_path_buf()),
            isolation_mode: IsolationMode::None,
            ..Config::default()
        })
        .unwrap();

        let out = run_captured(
            &sandbox,
            "sh",
            &["-c".into(), "echo visible; echo oops >&2; exit 3".into()],
            DEFAULT_MAX_OUTPUT_BYTES,
        )
        .await
        .unwrap();

        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "visible");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captured_truncates() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(Config {
            work_dir: Some(tmp.path().to_path_buf()),
            ..Config::default()
        })
        .unwrap();

        let out = run_captured(
            &sandbox,
            "sh",
            &["-c".into(), "printf '%0500d' 0".into()],
            100,
        )
        .await
        .unwrap();

        assert!(out.success());
        assert!(out.stdout.starts_with(&format!("{}\n\n", "0".repeat(100))));
        assert!(out.stdout.contains("[Output truncated, 500 bytes total]"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captured_timeout_is_error() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(Config {
            work_dir: Some(tmp.path().to_path_buf()),
            timeout: Duration::from_millis(300),
            ..Config::default()
        })
        .unwrap();

        let err = run_captured(&sandbox, "sleep", &["5".into()], 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));
    }
}
