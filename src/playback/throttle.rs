//! Rate-limited forwarding of an upstream reader into the broadcaster
//!
//! A throttle runs as its own task and owns its upstream. Control messages
//! take priority over reading, so a pause or detach never races a pending
//! read: once the task answers a detach, it has stopped pulling and the
//! reader is handed back whole.

use bytes::Bytes;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::audio::AudioReader;
use crate::broadcast::Broadcaster;
use crate::constants::{MAX_THROTTLE_CHUNK, MIN_THROTTLE_CHUNK, THROTTLE_CHUNKS_PER_SECOND};

static NEXT_THROTTLE_ID: AtomicU64 = AtomicU64::new(1);

/// Why a throttle task stopped, with the bytes it forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleExit {
    /// Upstream reached end of stream
    Drained { bytes: u64 },
    /// Ended on request
    Ended { bytes: u64 },
    /// Upstream handed back to the caller
    Detached { bytes: u64 },
}

impl ThrottleExit {
    pub fn bytes(&self) -> u64 {
        match *self {
            ThrottleExit::Drained { bytes }
            | ThrottleExit::Ended { bytes }
            | ThrottleExit::Detached { bytes } => bytes,
        }
    }
}

enum Command {
    Pause,
    Resume,
    Detach(oneshot::Sender<AudioReader>),
    End,
}

/// Control side of a running throttle
#[derive(Debug)]
pub struct ThrottleHandle {
    id: u64,
    bytes_per_sec: f64,
    commands: mpsc::UnboundedSender<Command>,
}

impl ThrottleHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bytes_per_sec(&self) -> f64 {
        self.bytes_per_sec
    }

    /// Stop pulling from upstream; buffered data stays upstream
    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    /// Continue after [`pause`](Self::pause)
    pub fn resume(&self) {
        self.send(Command::Resume);
    }

    /// Stop the throttle and take its upstream back.
    ///
    /// Resolves only once the task has stopped reading. `None` if the task had
    /// already exited (drained or ended) and the upstream is gone.
    pub async fn detach(&self) -> Option<AudioReader> {
        let (reply, upstream) = oneshot::channel();
        self.send(Command::Detach(reply));
        upstream.await.ok()
    }

    /// Stop the throttle; the broadcaster is left untouched
    pub fn end(&self) {
        self.send(Command::End);
    }

    /// Whether the task is still running
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("throttle {} already stopped", self.id);
        }
    }
}

/// Completion side of a running throttle
pub struct ThrottleTask {
    id: u64,
    join: JoinHandle<io::Result<ThrottleExit>>,
}

impl ThrottleTask {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the throttle to stop
    pub async fn finished(self) -> io::Result<ThrottleExit> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}

/// Start forwarding `upstream` into `sink` at `bytes_per_sec`
pub fn spawn(upstream: AudioReader, sink: Broadcaster, bytes_per_sec: f64) -> (ThrottleHandle, ThrottleTask) {
    let id = NEXT_THROTTLE_ID.fetch_add(1, Ordering::Relaxed);
    let (commands, command_rx) = mpsc::unbounded_channel();

    tracing::debug!("throttle {} starting at {:.1} bytes/s", id, bytes_per_sec);
    let join = tokio::spawn(run(id, upstream, sink, bytes_per_sec, command_rx));

    (
        ThrottleHandle {
            id,
            bytes_per_sec,
            commands,
        },
        ThrottleTask { id, join },
    )
}

/// Chunk length covering about a tenth of a second at `bytes_per_sec`
pub fn chunk_len(bytes_per_sec: f64) -> usize {
    if !bytes_per_sec.is_finite() || bytes_per_sec <= 0.0 {
        return MAX_THROTTLE_CHUNK;
    }
    let len = (bytes_per_sec / THROTTLE_CHUNKS_PER_SECOND) as usize;
    len.clamp(MIN_THROTTLE_CHUNK, MAX_THROTTLE_CHUNK)
}

/// Tracks how far ahead of real time the forwarded bytes are
struct Pacing {
    bytes_per_sec: f64,
    started: Instant,
    bytes: u64,
}

impl Pacing {
    fn new(bytes_per_sec: f64) -> Self {
        Self {
            bytes_per_sec,
            started: Instant::now(),
            bytes: 0,
        }
    }

    /// Earliest instant the next chunk may be sent; `None` when unlimited
    fn due(&self) -> Option<Instant> {
        if !self.bytes_per_sec.is_finite() || self.bytes_per_sec <= 0.0 {
            return None;
        }
        Some(self.started + Duration::from_secs_f64(self.bytes as f64 / self.bytes_per_sec))
    }

    fn advance(&mut self, n: usize) {
        self.bytes += n as u64;
    }

    fn restart(&mut self) {
        self.started = Instant::now();
        self.bytes = 0;
    }
}

enum Step {
    Command(Command),
    Read(io::Result<usize>),
}

async fn pull(upstream: &mut AudioReader, buf: &mut [u8], due: Option<Instant>) -> io::Result<usize> {
    if let Some(due) = due {
        tokio::time::sleep_until(due).await;
    }
    upstream.read(buf).await
}

async fn run(
    id: u64,
    mut upstream: AudioReader,
    sink: Broadcaster,
    bytes_per_sec: f64,
    mut commands: mpsc::UnboundedReceiver<Command>,
) -> io::Result<ThrottleExit> {
    let mut buf = vec![0u8; chunk_len(bytes_per_sec)];
    let mut pacing = Pacing::new(bytes_per_sec);
    let mut forwarded: u64 = 0;
    let mut paused = false;

    loop {
        let step = if paused {
            Step::Command(commands.recv().await.unwrap_or(Command::End))
        } else {
            let due = pacing.due();
            tokio::select! {
                biased;
                command = commands.recv() => Step::Command(command.unwrap_or(Command::End)),
                read = pull(&mut upstream, &mut buf, due) => Step::Read(read),
            }
        };

        match step {
            Step::Command(Command::Pause) => {
                tracing::debug!("throttle {} paused after {} bytes", id, forwarded);
                paused = true;
            }
            Step::Command(Command::Resume) => {
                if paused {
                    paused = false;
                    pacing.restart();
                }
            }
            Step::Command(Command::Detach(reply)) => {
                tracing::debug!("throttle {} detached after {} bytes", id, forwarded);
                if reply.send(upstream).is_err() {
                    tracing::debug!("throttle {} detach requester went away", id);
                }
                return Ok(ThrottleExit::Detached { bytes: forwarded });
            }
            Step::Command(Command::End) => {
                tracing::debug!("throttle {} ended after {} bytes", id, forwarded);
                return Ok(ThrottleExit::Ended { bytes: forwarded });
            }
            Step::Read(Ok(0)) => {
                tracing::debug!("throttle {} drained after {} bytes", id, forwarded);
                return Ok(ThrottleExit::Drained { bytes: forwarded });
            }
            Step::Read(Ok(n)) => {
                sink.write(Bytes::copy_from_slice(&buf[..n]));
                forwarded += n as u64;
                pacing.advance(n);
            }
            Step::Read(Err(e)) => {
                tracing::error!("throttle {} upstream failed: {}", id, e);
                return Err(e);
            }
        }
    }
}
