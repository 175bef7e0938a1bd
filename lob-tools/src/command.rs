//! Run external commands, capturing their output.

use std::process::{Command, Output, Stdio};

use anyhow::{bail, format_err, Error};

/// Check an [Output] for success, translating a non-zero exit status
/// into an error carrying the command's stderr.
pub fn command_output(output: Output, command: &Command) -> Result<Vec<u8>, Error> {
    if output.status.success() {
        return Ok(output.stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim_end();

    match output.status.code() {
        Some(code) => {
            if stderr.is_empty() {
                bail!("command {:?} failed - status code {}", command, code);
            }
            bail!(
                "command {:?} failed - status code {} - {}",
                command,
                code,
                stderr
            );
        }
        None => bail!("command {:?} terminated by signal", command),
    }
}

/// Run `command` to completion and return its stdout as a string.
pub fn run_command(mut command: Command) -> Result<String, Error> {
    log::debug!("# {:?}", command);

    let output = command
        .stdin(Stdio::null())
        .output()
        .map_err(|err| format_err!("failed to execute {:?} - {}", command, err))?;

    let stdout = command_output(output, &command)?;

    String::from_utf8(stdout).map_err(|err| format_err!("command {:?} wrote invalid utf-8 - {}", command, err))
}
