use eyre::{bail, Context, Result};
use std::ffi::OsStr;
use std::process::Output;
use tokio::process::Command;
use tracing::info;

/// Runs the specified command and returns error on non-zero exit code.
pub async fn run_cmd<I, S>(cmd: &str, args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    output_cmd(cmd, args).await.map(|_| ())
}

/// Runs the specified command and returns its captured stdout/stderr.
/// Stderr text is preserved so callers can normalize well-known error phrases.
pub async fn output_cmd<I, S>(cmd: &str, args: I) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(cmd);
    command.args(args);
    info!("Running command: `{:?}`", command);
    let output = command
        .output()
        .await
        .with_context(|| format!("Failed to run command `{:?}`", command))?;
    match output.status.code() {
        Some(0) => Ok(output),
        Some(code) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("Command `{:?}` failed with exit code {code}: {stderr}", command)
        }
        None => bail!("Command `{:?}` failed with no exit code", command),
    }
}

/// Like [`run_cmd`], but missing the binary is not an error - returns `Ok(false)`.
pub async fn run_cmd_best_effort<I, S>(cmd: &str, args: I) -> Result<bool>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    match run_cmd(cmd, args).await {
        Ok(()) => Ok(true),
        Err(_) => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_cmd_ok() {
        run_cmd("true", std::iter::empty::<&str>()).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_cmd_failure_code() {
        let err = run_cmd("false", std::iter::empty::<&str>())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exit code"));
    }
}
