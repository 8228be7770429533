//! Thin wrapper over the platform network tools.

use crate::NetifError;
use tokio::process::Command;

/// Run a command, collapsing stdout+stderr into the error on failure.
pub(crate) async fn run(program: &str, args: &[&str]) -> Result<String, NetifError> {
    let output = Command::new(program).args(args).output().await?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        return Ok(stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(NetifError::CommandFailed {
        command: format!("{program} {}", args.join(" ")),
        output: format!("{}{}", stdout, stderr).trim().to_string(),
    })
}

/// Run a command where a specific failure message means "already in the
/// desired state" and should be swallowed.
pub(crate) async fn run_idempotent(
    program: &str,
    args: &[&str],
    ok_markers: &[&str],
) -> Result<(), NetifError> {
    match run(program, args).await {
        Ok(_) => Ok(()),
        Err(NetifError::CommandFailed { output, .. })
            if ok_markers.iter().any(|m| output.contains(m)) =>
        {
            Ok(())
        }
        Err(e) => Err(e),
    }
}
