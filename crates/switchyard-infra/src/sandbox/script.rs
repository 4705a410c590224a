//! Out-of-process interpreter strategy.
//!
//! The input items are embedded as a JSON literal ahead of the user's code
//! in a temporary script file; the interpreter runs it as a child process
//! whose stdout is captured up to a byte limit and parsed as JSON. The
//! child is killed when its future is dropped (timeout or cancellation) and
//! the script file is removed when the `NamedTempFile` goes out of scope.

use std::io::Write;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use switchyard_core::deadline::{DeadlineError, run_with_deadline};
use switchyard_types::error::StepError;
use switchyard_types::item::Item;

use super::output::{CodeOutput, items_json, parse_output};

/// Bytes of stderr kept for error messages.
const STDERR_LIMIT: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct ScriptSandbox {
    interpreter: String,
    max_output_bytes: usize,
}

impl ScriptSandbox {
    pub fn new(interpreter: impl Into<String>, max_output_bytes: usize) -> Self {
        Self {
            interpreter: interpreter.into(),
            max_output_bytes,
        }
    }

    pub fn interpreter(&self) -> &str {
        &self.interpreter
    }

    /// Run `source` against `items` and return the parsed JSON result.
    ///
    /// Stderr of a successful run is returned as log lines.
    pub async fn run(
        &self,
        source: &str,
        items: &[Item],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CodeOutput, StepError> {
        let script = self.write_script(source, items)?;

        let outcome = run_with_deadline(timeout, cancel, |_abort| self.spawn_and_collect(script.path()))
            .await;

        // Dropping `script` here removes the file on every path.
        drop(script);

        match outcome {
            Ok(result) => result,
            Err(DeadlineError::TimedOut(limit)) => Err(StepError::timeout(format!(
                "script exceeded its {}ms timeout",
                limit.as_millis()
            ))
            .with_retryable(false)),
            Err(DeadlineError::Cancelled) => Err(StepError::cancelled()),
        }
    }

    fn write_script(&self, source: &str, items: &[Item]) -> Result<tempfile::NamedTempFile, StepError> {
        let input = items_json(items)?;
        // A JSON string literal is also a valid Python string literal.
        let literal = serde_json::to_string(&input)
            .map_err(|e| StepError::execution(format!("failed to encode input: {e}")))?;

        let mut file = tempfile::Builder::new()
            .prefix("switchyard-")
            .suffix(".py")
            .tempfile()
            .map_err(|e| StepError::execution(format!("failed to create script file: {e}")))?;
        write!(file, "import json\nitems = json.loads({literal})\n\n{source}\n")
            .and_then(|()| file.flush())
            .map_err(|e| StepError::execution(format!("failed to write script file: {e}")))?;
        Ok(file)
    }

    async fn spawn_and_collect(&self, path: &std::path::Path) -> Result<CodeOutput, StepError> {
        let mut child = Command::new(&self.interpreter)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StepError::dependency(format!("interpreter '{}' not found", self.interpreter))
                        .with_retryable(false)
                } else {
                    StepError::execution(format!("failed to start '{}': {e}", self.interpreter))
                }
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StepError::execution("child stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| StepError::execution("child stderr was not captured"))?;

        let (out, err) = tokio::join!(
            read_bounded(stdout, self.max_output_bytes),
            read_bounded(stderr, STDERR_LIMIT)
        );
        let (out, overflowed) =
            out.map_err(|e| StepError::execution(format!("failed to read script output: {e}")))?;
        if overflowed {
            return Err(StepError::sandbox_violation(format!(
                "script output exceeded {} bytes",
                self.max_output_bytes
            )));
        }
        let (err, _) = err.unwrap_or_default();

        let status = child
            .wait()
            .await
            .map_err(|e| StepError::execution(format!("failed to wait for script: {e}")))?;
        if !status.success() {
            let stderr = String::from_utf8_lossy(&err);
            return Err(StepError::execution(format!(
                "script exited with {status}: {}",
                stderr.trim()
            )));
        }

        let text = String::from_utf8_lossy(&out);
        let value = parse_output(&text)?;
        let logs = String::from_utf8_lossy(&err)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect();
        Ok(CodeOutput { value, logs })
    }
}

/// Read at most `limit` bytes; the flag reports whether more was available.
async fn read_bounded<R>(reader: R, limit: usize) -> std::io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    reader.take(cap).read_to_end(&mut buf).await?;
    let overflowed = buf.len() > limit;
    buf.truncate(limit);
    Ok((buf, overflowed))
}
