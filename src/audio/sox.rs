//! Spawning the external audio tool
//!
//! Both the bitrate probe and the effect mixer talk to `sox` through the
//! [`SoxRunner`] seam, so the pipelines can be exercised without the binary.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

/// Boxed readable byte stream: a process channel or an audio source
pub type AudioReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed writable end of a process channel
pub type ProcessWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A running audio tool invocation with its standard channels
pub struct SoxProcess {
    pub stdin: Option<ProcessWriter>,
    pub stdout: AudioReader,
    pub stderr: AudioReader,
    child: Option<Child>,
    exited: Option<ExitStatus>,
}

impl SoxProcess {
    /// Build a process from already connected channels (no OS child)
    pub fn from_parts(
        stdin: Option<ProcessWriter>,
        stdout: AudioReader,
        stderr: AudioReader,
    ) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
            child: None,
            exited: None,
        }
    }

    /// Mark a process without an OS child as already exited with `status`
    pub fn exited_with(mut self, status: ExitStatus) -> Self {
        self.exited = Some(status);
        self
    }

    /// Detach the child from its channels, for reaping once they are consumed
    pub fn split(self) -> (Option<ProcessWriter>, AudioReader, AudioReader, ExitWatcher) {
        let exit = ExitWatcher {
            child: self.child,
            exited: self.exited,
        };
        (self.stdin, self.stdout, self.stderr, exit)
    }
}

/// Waits for (or kills) the OS process behind a [`SoxProcess`]
pub struct ExitWatcher {
    child: Option<Child>,
    exited: Option<ExitStatus>,
}

impl ExitWatcher {
    /// Wait for the process to exit. `None` when there is no OS child and
    /// no known exit status.
    pub async fn wait(&mut self) -> Option<io::Result<ExitStatus>> {
        match self.child.as_mut() {
            Some(child) => Some(child.wait().await),
            None => self.exited.map(Ok),
        }
    }

    /// Ask the OS to kill the process without waiting for it
    pub fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.start_kill() {
                tracing::debug!("sox already gone: {}", e);
            }
        }
    }
}

/// Something that can launch the audio tool with a set of arguments
pub trait SoxRunner: Send + Sync {
    fn spawn(&self, args: &[OsString]) -> io::Result<SoxProcess>;
}

/// Runs the real `sox` binary
#[derive(Debug, Clone)]
pub struct SystemSox {
    program: PathBuf,
}

impl SystemSox {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

impl Default for SystemSox {
    fn default() -> Self {
        Self::new("sox")
    }
}

impl SoxRunner for SystemSox {
    fn spawn(&self, args: &[OsString]) -> io::Result<SoxProcess> {
        tracing::debug!("spawning {} {:?}", self.program.display(), args);

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .map(|stdin| Box::new(stdin) as ProcessWriter);
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "sox stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "sox stderr unavailable"))?;

        Ok(SoxProcess {
            stdin,
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            child: Some(child),
            exited: None,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted stand-ins for `sox`

    use super::*;
    use parking_lot::Mutex;
    use std::io::Cursor;
    use std::sync::Arc;

    /// What a scripted invocation produces
    #[derive(Clone)]
    pub enum Script {
        /// Fixed stdout/stderr text, stdin discarded
        Output { stdout: String, stderr: String },
        /// Echo stdin to stdout (a pass-through "mixer")
        Echo,
        /// Nothing on stdout, `stderr` text, stdin discarded, then exit
        /// with `code`
        Failed { stderr: String, code: i32 },
        /// Spawning fails
        SpawnError,
    }

    /// Records every invocation and replays scripts in order
    /// (the last script repeats once the list is exhausted)
    #[derive(Clone, Default)]
    pub struct ScriptedSox {
        scripts: Arc<Mutex<Vec<Script>>>,
        pub calls: Arc<Mutex<Vec<Vec<String>>>>,
    }

    impl ScriptedSox {
        pub fn new(scripts: Vec<Script>) -> Self {
            Self {
                scripts: Arc::new(Mutex::new(scripts)),
                calls: Arc::default(),
            }
        }

        pub fn output(stdout: &str, stderr: &str) -> Self {
            Self::new(vec![Script::Output {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            }])
        }

        pub fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().clone()
        }
    }

    impl SoxRunner for ScriptedSox {
        fn spawn(&self, args: &[OsString]) -> io::Result<SoxProcess> {
            self.calls.lock().push(
                args.iter()
                    .map(|a| a.to_string_lossy().into_owned())
                    .collect(),
            );

            let script = {
                let mut scripts = self.scripts.lock();
                if scripts.len() > 1 {
                    scripts.remove(0)
                } else {
                    scripts.first().cloned().unwrap_or(Script::SpawnError)
                }
            };

            match script {
                Script::Output { stdout, stderr } => Ok(SoxProcess::from_parts(
                    Some(Box::new(tokio::io::sink())),
                    Box::new(Cursor::new(stdout.into_bytes())),
                    Box::new(Cursor::new(stderr.into_bytes())),
                )),
                Script::Echo => {
                    let (writer, reader) = tokio::io::duplex(64 * 1024);
                    Ok(SoxProcess::from_parts(
                        Some(Box::new(writer)),
                        Box::new(reader),
                        Box::new(tokio::io::empty()),
                    ))
                }
                Script::Failed { stderr, code } => Ok(SoxProcess::from_parts(
                    Some(Box::new(tokio::io::sink())),
                    Box::new(tokio::io::empty()),
                    Box::new(Cursor::new(stderr.into_bytes())),
                )
                .exited_with(exit_status(code))),
                Script::SpawnError => Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "sox: command not found",
                )),
            }
        }
    }

    /// Exit status carrying `code`
    #[cfg(unix)]
    pub fn exit_status(code: i32) -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        ExitStatus::from_raw(code << 8)
    }

    #[cfg(windows)]
    pub fn exit_status(code: i32) -> ExitStatus {
        use std::os::windows::process::ExitStatusExt;
        ExitStatus::from_raw(code as u32)
    }
}
