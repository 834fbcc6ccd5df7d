use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::info;

use crate::types::errors::GinError;

/// Buffered, delimiter-aware reader over one child pipe. Supports newline
/// and NUL delimited output; a trailing chunk without its delimiter is
/// still returned before EOF.
pub struct PipeReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> PipeReader<R> {
    fn new(pipe: R) -> Self {
        PipeReader {
            inner: BufReader::new(pipe),
        }
    }

    /// Reads up to and including `delim`, returning the chunk without the
    /// delimiter. Returns None at EOF.
    pub async fn read_until(&mut self, delim: u8) -> std::io::Result<Option<Vec<u8>>> {
        let mut buf = Vec::new();
        let n = self.inner.read_until(delim, &mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if buf.last() == Some(&delim) {
            buf.pop();
        }
        Ok(Some(buf))
    }

    /// Reads one newline-terminated line, trimming `\r\n` endings.
    pub async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        match self.read_until(b'\n').await? {
            Some(mut bytes) => {
                if bytes.last() == Some(&b'\r') {
                    bytes.pop();
                }
                Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
            }
            None => Ok(None),
        }
    }

    /// Drains the remainder of the pipe.
    pub async fn read_to_end(&mut self) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.inner.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

/// A child process invocation. The working directory and environment are
/// settable before start; the full command line is logged on spawn.
pub struct SysCommand {
    bin: PathBuf,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    envs: Vec<(String, String)>,
}

impl SysCommand {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        SysCommand {
            bin: bin.into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn envs(mut self, envs: &[(String, String)]) -> Self {
        self.envs.extend(envs.iter().cloned());
        self
    }

    /// The command line as logged, for diagnostics.
    pub fn display(&self) -> String {
        let mut line = self.bin.to_string_lossy().into_owned();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Spawns the child with both pipes captured. Stdout and stderr must be
    /// drained in parallel by the caller, otherwise the child can stall on
    /// a full pipe.
    pub fn start(self) -> Result<RunningCommand, GinError> {
        let display_line = self.display();
        info!("Running: {}", display_line);

        let mut cmd = Command::new(&self.bin);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            GinError::remote("start", format!("failed to run '{}': {}", display_line, e))
        })?;

        let stdout = child.stdout.take().expect("stdout was requested piped");
        let stderr = child.stderr.take().expect("stderr was requested piped");

        Ok(RunningCommand {
            display: display_line,
            child,
            stdout: PipeReader::new(stdout),
            stderr: PipeReader::new(stderr),
        })
    }

    /// Runs to completion and returns stdout, erroring on a non-zero exit
    /// with the captured stderr. For bounded outputs only; streamed verbs
    /// use `start`.
    pub async fn output(self, origin: &'static str) -> Result<Vec<u8>, GinError> {
        let (stdout, stderr, code) = self.output_err(origin).await?;
        match code {
            Some(0) => Ok(stdout),
            code => Err(GinError::child(
                origin,
                code,
                String::from_utf8_lossy(&stderr).into_owned(),
            )),
        }
    }

    /// Runs to completion and returns (stdout, stderr, exit code) without
    /// judging the exit status.
    pub async fn output_err(
        self,
        origin: &'static str,
    ) -> Result<(Vec<u8>, Vec<u8>, Option<i32>), GinError> {
        let display_line = self.display();
        info!("Running: {}", display_line);

        let mut cmd = Command::new(&self.bin);
        cmd.args(&self.args).stdin(Stdio::null());
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }

        let out = cmd.output().await.map_err(|e| {
            GinError::remote(origin, format!("failed to run '{}': {}", display_line, e))
        })?;
        Ok((out.stdout, out.stderr, out.status.code()))
    }
}

/// A started child process with both pipes exposed.
pub struct RunningCommand {
    display: String,
    child: Child,
    pub stdout: PipeReader<ChildStdout>,
    pub stderr: PipeReader<ChildStderr>,
}

impl RunningCommand {
    /// Waits for the child to exit. A non-zero exit drains whatever is left
    /// on stderr into the error.
    pub async fn wait(&mut self, origin: &'static str) -> Result<(), GinError> {
        let status = self.child.wait().await?;
        if status.success() {
            return Ok(());
        }

        let remainder = self.stderr.read_to_end().await.unwrap_or_default();
        let stderr = String::from_utf8_lossy(&remainder).into_owned();
        tracing::error!("Failed: {} ({})", self.display, status);
        Err(GinError::child(origin, status.code(), stderr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lines_are_streamed_and_trimmed() {
        let mut cmd = SysCommand::new("sh")
            .arg("-c")
            .arg("printf 'one\\ntwo\\r\\nthree'")
            .start()
            .unwrap();

        assert_eq!(cmd.stdout.read_line().await.unwrap().unwrap(), "one");
        assert_eq!(cmd.stdout.read_line().await.unwrap().unwrap(), "two");
        assert_eq!(cmd.stdout.read_line().await.unwrap().unwrap(), "three");
        assert!(cmd.stdout.read_line().await.unwrap().is_none());
        cmd.wait("test").await.unwrap();
    }

    #[tokio::test]
    async fn nul_delimited_chunks() {
        let mut cmd = SysCommand::new("sh")
            .arg("-c")
            .arg("printf 'a.txt\\0b.txt\\0'")
            .start()
            .unwrap();

        assert_eq!(
            cmd.stdout.read_until(0).await.unwrap().unwrap(),
            b"a.txt".to_vec()
        );
        assert_eq!(
            cmd.stdout.read_until(0).await.unwrap().unwrap(),
            b"b.txt".to_vec()
        );
        assert!(cmd.stdout.read_until(0).await.unwrap().is_none());
        cmd.wait("test").await.unwrap();
    }

    #[tokio::test]
    async fn nonzero_exit_carries_stderr() {
        let mut cmd = SysCommand::new("sh")
            .arg("-c")
            .arg("echo broken >&2; exit 3")
            .start()
            .unwrap();

        let err = cmd.wait("test").await.unwrap_err();
        match err {
            GinError::Child {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, Some(3));
                assert!(stderr.contains("broken"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn output_collects_stdout() {
        let out = SysCommand::new("sh")
            .arg("-c")
            .arg("echo collected")
            .output("test")
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&out).trim(), "collected");
    }

    #[tokio::test]
    async fn missing_binary_is_a_remote_error() {
        let err = SysCommand::new("definitely-not-a-binary-7f3a")
            .output("test")
            .await
            .unwrap_err();
        assert!(matches!(err, GinError::Remote { .. }));
    }
}
