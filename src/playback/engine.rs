//! Broadcast session: playback start/stop and effect splicing
//!
//! The [`Engine`] owns the single broadcast session. Every operation that
//! rewires the pipeline (start, stop, splice, post-effect resume) runs under
//! the session lock, so at most one throttle is ever live.
//!
//! ```text
//! plain:   source ──► throttle ──► broadcaster
//!
//! splice:  source ─(segment)─► sox -m ──► throttle ──► broadcaster
//!                                 ▲
//!                              effect
//!
//! after the effect: the rest of the source ──► throttle ──► broadcaster
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::audio::mixer::{self, FeedResult};
use crate::audio::sox::ExitWatcher;
use crate::audio::{AudioReader, BitrateProber, EffectLibrary, EffectMixer, MixSettings, SoxRunner};
use crate::broadcast::ListenerRegistry;
use crate::config::AppConfig;
use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::error::EngineError;
use crate::playback::throttle::{self, ThrottleExit, ThrottleHandle, ThrottleTask};

/// Coarse playback state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Idle,
    Streaming,
    /// Streaming with an effect mixed in
    Splicing,
}

/// Why a playback run finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    SourceExhausted,
    Stopped,
}

/// Result of a playback run started by [`Engine::start`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlaybackOutcome {
    /// Bytes forwarded to the broadcaster over the whole run
    pub bytes_streamed: u64,
    pub reason: CompletionReason,
}

/// A run that is on air, see [`Engine::begin`]
pub struct Playback {
    done: oneshot::Receiver<io::Result<PlaybackOutcome>>,
}

impl Playback {
    /// Wait for the run to end
    pub async fn finished(self) -> Result<PlaybackOutcome, EngineError> {
        match self.done.await {
            Ok(result) => result.map_err(EngineError::Pipeline),
            Err(_) => Err(EngineError::Pipeline(io::Error::new(
                io::ErrorKind::Other,
                "playback run dropped",
            ))),
        }
    }
}

/// Pipeline milestones, in the order they happen
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Started {
        source: PathBuf,
        bitrate: u64,
        bytes_per_sec: f64,
    },
    Paused,
    Detached,
    MixerSpawned {
        effect: PathBuf,
    },
    MixerFailed {
        reason: String,
    },
    EffectFinished {
        effect: PathBuf,
    },
    Resumed,
    Stopped,
    Finished {
        bytes_streamed: u64,
    },
}

/// Point-in-time view of the session
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: PlaybackState,
    pub source: PathBuf,
    /// Last probed bitrate (bits per second), 0 before the first start
    pub bitrate: u64,
    pub bytes_per_sec: f64,
    pub started_at: Option<DateTime<Utc>>,
}

/// One start-to-finish playback run, shared by the tasks watching its
/// throttles so a stale watcher can only ever complete its own run
struct Run {
    bytes: AtomicU64,
    completion: Mutex<Option<oneshot::Sender<io::Result<PlaybackOutcome>>>>,
}

impl Run {
    fn new(completion: oneshot::Sender<io::Result<PlaybackOutcome>>) -> Self {
        Self {
            bytes: AtomicU64::new(0),
            completion: Mutex::new(Some(completion)),
        }
    }

    fn add(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn finish(&self, result: io::Result<CompletionReason>) -> Option<u64> {
        let sender = self.completion.lock().take()?;
        let bytes_streamed = self.bytes.load(Ordering::Relaxed);
        let outcome = result.map(|reason| PlaybackOutcome {
            bytes_streamed,
            reason,
        });
        if sender.send(outcome).is_err() {
            tracing::debug!("nobody waiting for the playback outcome");
        }
        Some(bytes_streamed)
    }
}

/// Broadcast state guarded by the session lock
struct Session {
    source: PathBuf,
    bitrate: u64,
    bytes_per_sec: f64,
    throttle: Option<ThrottleHandle>,
    splicing: bool,
    run: Option<Arc<Run>>,
    started_at: Option<DateTime<Utc>>,
}

impl Session {
    fn live_id(&self) -> Option<u64> {
        self.throttle.as_ref().map(ThrottleHandle::id)
    }

    fn status(&self) -> EngineStatus {
        let state = match (&self.throttle, self.splicing) {
            (None, _) => PlaybackState::Idle,
            (Some(_), false) => PlaybackState::Streaming,
            (Some(_), true) => PlaybackState::Splicing,
        };
        EngineStatus {
            state,
            source: self.source.clone(),
            bitrate: self.bitrate,
            bytes_per_sec: self.bytes_per_sec,
            started_at: self.started_at,
        }
    }
}

struct EngineInner {
    registry: ListenerRegistry,
    prober: BitrateProber,
    mixer: EffectMixer,
    effects: EffectLibrary,
    bitrate_divisor: u64,
    session: tokio::sync::Mutex<Session>,
    status: Mutex<EngineStatus>,
    events: broadcast::Sender<EngineEvent>,
}

/// Handle to the broadcast engine; cheap to clone
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Build an engine from configuration, using `sox` for analysis and mixing
    pub fn new(config: &AppConfig, sox: Arc<dyn SoxRunner>) -> Self {
        let registry = ListenerRegistry::new(config.broadcast.listener_queue_chunks);
        let prober = BitrateProber::new(sox.clone(), config.audio.fallback_bitrate)
            .with_timeout(config.audio.probe_timeout());
        let mixer = EffectMixer::new(sox, MixSettings::from(&config.audio));
        let effects = EffectLibrary::new(&config.paths.effects_dir);

        let session = Session {
            source: config.paths.default_source.clone(),
            bitrate: 0,
            bytes_per_sec: 0.0,
            throttle: None,
            splicing: false,
            run: None,
            started_at: None,
        };
        let status = session.status();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(EngineInner {
                registry,
                prober,
                mixer,
                effects,
                bitrate_divisor: config.audio.bitrate_divisor.max(1),
                session: tokio::sync::Mutex::new(session),
                status: Mutex::new(status),
                events,
            }),
        }
    }

    /// Listener registry fed by this engine
    pub fn registry(&self) -> &ListenerRegistry {
        &self.inner.registry
    }

    pub fn effects(&self) -> &EffectLibrary {
        &self.inner.effects
    }

    /// Follow pipeline milestones
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Current session snapshot, without waiting for in-flight operations
    pub fn status(&self) -> EngineStatus {
        self.inner.status.lock().clone()
    }

    /// Stream the current source until it is exhausted or stopped.
    ///
    /// Resolves when the whole run ends, including any effects spliced in
    /// along the way.
    pub async fn start(&self) -> Result<PlaybackOutcome, EngineError> {
        self.begin().await?.finished().await
    }

    /// Probe, open and attach the current source.
    ///
    /// Returns as soon as the audio is live; the returned [`Playback`]
    /// resolves when the run ends. Failures to get the source on air
    /// (`AlreadyStreaming`, `SourceUnavailable`) are reported here.
    pub async fn begin(&self) -> Result<Playback, EngineError> {
        let mut session = self.inner.session.lock().await;
        if session.throttle.is_some() {
            return Err(EngineError::AlreadyStreaming);
        }

        let source = session.source.clone();
        tracing::info!("starting with {}", source.display());

        let bitrate = self.inner.prober.probe_bitrate(&source).await;
        let bytes_per_sec = bitrate as f64 / self.inner.bitrate_divisor as f64;

        let file = tokio::fs::File::open(&source).await.map_err(|e| {
            tracing::error!("cannot open {}: {}", source.display(), e);
            EngineError::SourceUnavailable {
                path: source.clone(),
                source: e,
            }
        })?;

        let (completion, done) = oneshot::channel();
        let run = Arc::new(Run::new(completion));

        session.bitrate = bitrate;
        session.bytes_per_sec = bytes_per_sec;
        session.started_at = Some(Utc::now());
        self.attach_plain(&mut session, Box::new(file), run);

        self.emit(EngineEvent::Started {
            source,
            bitrate,
            bytes_per_sec,
        });
        Ok(Playback { done })
    }

    /// End the live throttle, if any. Listeners stay connected.
    ///
    /// Returns whether there was anything to stop.
    pub async fn stop(&self) -> bool {
        let mut session = self.inner.session.lock().await;
        match session.throttle.take() {
            Some(live) => {
                tracing::info!("stopping playback");
                live.end();
                session.splicing = false;
                self.publish(&session);
                self.emit(EngineEvent::Stopped);
                true
            }
            None => {
                tracing::debug!("stop requested while idle");
                false
            }
        }
    }

    /// Mix the effect named `name` into the live stream.
    ///
    /// Returns the resolved effect path once the mixed audio is live; the
    /// return to plain playback after the effect happens in the background.
    pub async fn append_effect(&self, name: &str) -> Result<PathBuf, EngineError> {
        let effect = self.inner.effects.resolve(name).await?;
        let effect_size = match tokio::fs::metadata(&effect).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                tracing::warn!("cannot read size of {}: {}", effect.display(), e);
                0
            }
        };
        let effect_duration = self.inner.prober.probe_duration(&effect).await;

        let mut session = self.inner.session.lock().await;
        let Some(live) = session.throttle.take() else {
            return Err(EngineError::NotStreaming);
        };
        let Some(run) = session.run.clone() else {
            session.throttle = Some(live);
            return Err(EngineError::NotStreaming);
        };
        if session.splicing {
            session.throttle = Some(live);
            return Err(EngineError::EffectInProgress);
        }

        live.pause();
        self.emit(EngineEvent::Paused);

        // Nothing may read the source until the old throttle has let go of it.
        let Some(source) = live.detach().await else {
            tracing::info!("source finished before the effect could be spliced");
            self.publish(&session);
            return Err(EngineError::NotStreaming);
        };
        self.emit(EngineEvent::Detached);

        let segment = mixer::segment_len(effect_duration, effect_size, session.bytes_per_sec);
        tracing::info!(
            "splicing {} over {} source bytes",
            effect.display(),
            segment
        );

        match self.inner.mixer.spawn(&effect, source, segment) {
            Ok(job) => {
                self.emit(EngineEvent::MixerSpawned {
                    effect: effect.clone(),
                });

                let (handle, task) = throttle::spawn(
                    job.output,
                    self.inner.registry.broadcaster(),
                    session.bytes_per_sec,
                );
                session.throttle = Some(handle);
                session.splicing = true;
                self.publish(&session);

                tokio::spawn(self.clone().watch_splice(
                    task,
                    job.feed,
                    job.exit,
                    effect.clone(),
                    run,
                ));
                Ok(effect)
            }
            Err((source, e)) => {
                tracing::error!("mixer failed to start: {}, resuming plain playback", e);
                self.emit(EngineEvent::MixerFailed {
                    reason: e.to_string(),
                });
                self.attach_plain(&mut session, source, run);
                self.emit(EngineEvent::Resumed);
                Err(EngineError::Mixer(e.to_string()))
            }
        }
    }

    /// Put `source` behind a fresh throttle at the session rate
    fn attach_plain(&self, session: &mut Session, source: AudioReader, run: Arc<Run>) {
        let (handle, task) = throttle::spawn(
            source,
            self.inner.registry.broadcaster(),
            session.bytes_per_sec,
        );
        session.throttle = Some(handle);
        session.splicing = false;
        session.run = Some(run.clone());
        self.publish(session);

        tokio::spawn(self.clone().watch_plain(task, run));
    }

    async fn watch_plain(self, task: ThrottleTask, run: Arc<Run>) {
        let id = task.id();
        let result = task.finished().await;

        let reason = match result {
            // The splice that detached this throttle owns the run now.
            Ok(ThrottleExit::Detached { bytes }) => {
                run.add(bytes);
                return;
            }
            Ok(ThrottleExit::Drained { bytes }) => {
                run.add(bytes);
                Ok(CompletionReason::SourceExhausted)
            }
            Ok(ThrottleExit::Ended { bytes }) => {
                run.add(bytes);
                Ok(CompletionReason::Stopped)
            }
            Err(e) => Err(e),
        };

        let mut session = self.inner.session.lock().await;
        self.finish_run(&mut session, id, &run, reason);
    }

    async fn watch_splice(
        self,
        task: ThrottleTask,
        feed: JoinHandle<FeedResult>,
        mut exit: ExitWatcher,
        effect: PathBuf,
        run: Arc<Run>,
    ) {
        let id = task.id();
        let result = task.finished().await;

        let drained = match &result {
            Ok(done) => {
                run.add(done.bytes());
                matches!(done, ThrottleExit::Drained { .. })
            }
            Err(e) => {
                tracing::warn!("mixed stream failed: {}", e);
                false
            }
        };

        // The feed may be blocked on a mixer nobody reads anymore.
        if !drained {
            exit.kill();
        }
        let feed = feed.await;
        let mixer_exit = report_mixer_exit(&mut exit).await;

        let mut session = self.inner.session.lock().await;
        if session.live_id() != Some(id) {
            // stop() got here first
            self.finish_run(&mut session, id, &run, Ok(CompletionReason::Stopped));
            return;
        }

        match (result, feed) {
            (Ok(ThrottleExit::Ended { .. }), _) => {
                self.finish_run(&mut session, id, &run, Ok(CompletionReason::Stopped));
            }
            (_, Ok(FeedResult { source, fed })) => {
                if let Err(e) = fed {
                    tracing::warn!("effect {} cut short: {}", effect.display(), e);
                }
                match (drained, mixer_exit) {
                    (true, Ok(())) => self.emit(EngineEvent::EffectFinished { effect }),
                    (true, Err(reason)) => self.emit(EngineEvent::MixerFailed { reason }),
                    (false, _) => self.emit(EngineEvent::MixerFailed {
                        reason: "mixed stream failed".to_string(),
                    }),
                }
                tracing::info!("resuming plain playback");
                self.attach_plain(&mut session, source, run);
                self.emit(EngineEvent::Resumed);
            }
            (_, Err(e)) => {
                tracing::error!("mixer feed task failed: {}", e);
                self.finish_run(
                    &mut session,
                    id,
                    &run,
                    Err(io::Error::new(io::ErrorKind::Other, e)),
                );
            }
        }
    }

    /// Clear the session if throttle `id` is still live and complete `run`
    fn finish_run(
        &self,
        session: &mut Session,
        id: u64,
        run: &Arc<Run>,
        reason: io::Result<CompletionReason>,
    ) {
        if session.live_id() == Some(id) {
            session.throttle = None;
            session.splicing = false;
        }
        if session.run.as_ref().is_some_and(|current| Arc::ptr_eq(current, run)) {
            session.run = None;
        }
        self.publish(session);

        match &reason {
            Ok(reason) => tracing::info!("playback finished: {:?}", reason),
            Err(e) => tracing::error!("playback failed: {}", e),
        }
        if let Some(bytes_streamed) = run.finish(reason) {
            self.emit(EngineEvent::Finished { bytes_streamed });
        }
    }

    fn publish(&self, session: &Session) {
        *self.inner.status.lock() = session.status();
    }

    fn emit(&self, event: EngineEvent) {
        tracing::debug!("engine event: {:?}", event);
        let _ = self.inner.events.send(event);
    }
}

/// Reap the mixer; `Err` carries the reason when it exited abnormally
async fn report_mixer_exit(exit: &mut ExitWatcher) -> Result<(), String> {
    match exit.wait().await {
        Some(Ok(status)) if !status.success() => {
            tracing::warn!("mixer exited with {}", status);
            Err(format!("mixer exited with {}", status))
        }
        Some(Err(e)) => {
            tracing::warn!("could not reap mixer: {}", e);
            Ok(())
        }
        _ => Ok(()),
    }
}
