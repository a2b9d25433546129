use std::process::Stdio;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use crate::error::{AppError, Result};

/// Lines of stderr kept for the error message of a failed call.
const STDERR_TAIL: usize = 20;

/// Runs one external program per call: arguments in, a single JSON document
/// out on stdout. Stderr is a diagnostic side channel forwarded to tracing.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    name: &'static str,
    argv: Vec<String>,
    timeout: Duration,
    debug: bool,
}

impl ScriptRunner {
    pub fn new(name: &'static str, argv: Vec<String>, timeout: Duration, debug: bool) -> Self {
        Self {
            name,
            argv,
            timeout,
            debug,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn run<T: DeserializeOwned>(&self, args: &[String]) -> Result<T> {
        let name = self.name;
        let (program, base_args) = self
            .argv
            .split_first()
            .ok_or_else(|| AppError::Config(format!("no command configured for {name}")))?;

        let mut cmd = Command::new(program);
        cmd.args(base_args).args(args);
        if self.debug {
            cmd.arg("--debug");
        }
        cmd.env("PYTHON_DEBUG", if self.debug { "1" } else { "0" })
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(provider = name, "spawning {program}");
        let mut child = cmd
            .spawn()
            .map_err(|e| {
                AppError::provider_unavailable(name, format!("failed to start {program}: {e}"))
            })?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::provider(name, "stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::provider(name, "stderr not captured"))?;

        let debug = self.debug;
        let read_stdout = async move {
            let mut payload = Vec::new();
            stdout.read_to_end(&mut payload).await?;
            Ok::<_, std::io::Error>(payload)
        };
        let drain_stderr = async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut tail: Vec<String> = Vec::new();
            while let Some(line) = lines.next_line().await? {
                if debug {
                    tracing::debug!(provider = name, "{line}");
                } else {
                    tracing::warn!(provider = name, "{line}");
                }
                if tail.len() == STDERR_TAIL {
                    tail.remove(0);
                }
                tail.push(line);
            }
            Ok::<_, std::io::Error>(tail)
        };

        let outcome = tokio::time::timeout(self.timeout, async {
            futures::try_join!(read_stdout, drain_stderr, child.wait())
        })
        .await;

        let (payload, stderr_tail, status) = match outcome {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => return Err(AppError::provider(name, format!("I/O error: {e}"))),
            Err(_) => {
                // The child is killed when dropped.
                return Err(AppError::provider_unavailable(
                    name,
                    format!("timed out after {:?}", self.timeout),
                ));
            }
        };

        if !status.success() {
            return Err(AppError::provider(
                name,
                format!("exited with {status}: {}", stderr_tail.join("\n")),
            ));
        }

        serde_json::from_slice(&payload)
            .map_err(|e| AppError::provider(name, format!("malformed payload: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    fn shell(script: &str, timeout: Duration) -> ScriptRunner {
        ScriptRunner::new(
            "test",
            vec!["sh".into(), "-c".into(), script.into()],
            timeout,
            false,
        )
    }

    #[tokio::test]
    async fn parses_stdout_payload_and_ignores_stderr() {
        let runner = shell(
            "echo 'loading model' >&2; echo '[1.5, 2.5]'",
            Duration::from_secs(5),
        );
        let values: Vec<f32> = runner.run(&[]).await.unwrap();
        assert_eq!(values, vec![1.5, 2.5]);
    }

    #[tokio::test]
    async fn extra_args_reach_the_program() {
        // With `sh -c`, trailing arguments become $0, $1, ...
        let runner = shell("printf '\"%s\"' \"$1\"", Duration::from_secs(5));
        let echoed: String = runner
            .run(&["--query".to_string(), "hello world".to_string()])
            .await
            .unwrap();
        assert_eq!(echoed, "hello world");
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_provider_failure() {
        let runner = shell("echo 'boom' >&2; exit 3", Duration::from_secs(5));
        let err = runner.run::<Vec<f32>>(&[]).await.unwrap_err();
        match err {
            AppError::Provider { provider, message } => {
                assert_eq!(provider, "test");
                assert!(message.contains("boom"), "{message}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_json_is_a_provider_failure() {
        let runner = shell("echo 'not json'", Duration::from_secs(5));
        let err = runner.run::<Vec<f32>>(&[]).await.unwrap_err();
        assert!(matches!(err, AppError::Provider { .. }));
        assert!(!err.is_provider_unavailable());
    }

    #[tokio::test]
    async fn slow_program_times_out() {
        let runner = shell("sleep 5; echo '[]'", Duration::from_millis(200));
        let err = runner.run::<Vec<f32>>(&[]).await.unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
        assert!(err.is_provider_unavailable());
    }

    #[tokio::test]
    async fn missing_program_fails_to_start() {
        let runner = ScriptRunner::new(
            "missing",
            vec!["/nonexistent/provider-binary".into()],
            Duration::from_secs(1),
            false,
        );
        let err = assert_err!(runner.run::<Vec<f32>>(&[]).await);
        assert!(err.is_provider_unavailable(), "{err}");
    }
}
