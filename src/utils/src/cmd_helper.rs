use std::os::unix::process::ExitStatusExt; // for status.signal()
use std::process::{Command, ExitStatus};

pub fn get_command_str(cmd: &Command) -> String {
    let prog = cmd.get_program().to_string_lossy();
    let args = cmd.get_args().map(|x| x.to_string_lossy());
    std::iter::once(prog).chain(args).collect::<Vec<_>>().join(" ")
}

/// Describe a failed exit status the same way for every caller.
pub fn describe_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exited with code: {}", code),
        None => format!(
            "terminated by signal: {}",
            status.signal().unwrap_or_default()
        ),
    }
}

/// Everything a finished command left behind.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[inline]
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Run `cmd` to completion without judging its exit status.
pub fn run_command(mut cmd: Command) -> anyhow::Result<CommandOutput> {
    let cmd_str = get_command_str(&cmd);
    log::debug!("+ {}", cmd_str);

    let result = cmd.output()?;
    Ok(CommandOutput {
        status: result.status,
        stdout: String::from_utf8_lossy(&result.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
    })
}

pub fn get_command_output(cmd: Command) -> anyhow::Result<String> {
    let cmd_str = get_command_str(&cmd);
    let result = run_command(cmd)?;

    if !result.success() {
        return Err(anyhow::anyhow!(
            "{}, cmd: {}, stderr: {}",
            describe_status(result.status),
            cmd_str,
            result.stderr.trim()
        ));
    }

    Ok(result.stdout)
}

/// Run a shell pipeline through `bash -c`.
pub fn run_shell(line: &str) -> anyhow::Result<String> {
    let mut cmd = Command::new("bash");
    cmd.arg("-c").arg(line);
    get_command_output(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_str_joins_program_and_args() {
        let mut cmd = Command::new("ethtool");
        cmd.arg("-U").arg("eth0").arg("delete").arg("3");
        assert_eq!(get_command_str(&cmd), "ethtool -U eth0 delete 3");
    }

    #[test]
    fn failed_command_reports_exit_code() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo oops >&2; exit 3");
        let err = get_command_output(cmd).unwrap_err().to_string();
        assert!(err.contains("exited with code: 3"), "{}", err);
        assert!(err.contains("oops"), "{}", err);
    }

    #[test]
    fn shell_pipeline_output() {
        let out = run_shell("printf 'a\\nb\\n' | wc -l").unwrap();
        assert_eq!(out.trim(), "2");
    }
}
