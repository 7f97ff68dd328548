//! Blending an effect clip into the live source with `sox -m`
//!
//! The mixer reads one segment of the live source on stdin, mixes it with the
//! effect file and writes the result on stdout. Feeding stdin runs as its own
//! task which always hands the source reader back, so plain playback can
//! continue from where the segment ended.

use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

use crate::audio::sox::{AudioReader, ExitWatcher, ProcessWriter, SoxRunner};
use crate::config::AudioConfig;

/// Volumes and container type used for mixing
#[derive(Debug, Clone)]
pub struct MixSettings {
    pub media_type: String,
    pub song_volume: f32,
    pub fx_volume: f32,
}

impl From<&AudioConfig> for MixSettings {
    fn from(config: &AudioConfig) -> Self {
        Self {
            media_type: config.media_type.clone(),
            song_volume: config.song_volume,
            fx_volume: config.fx_volume,
        }
    }
}

impl Default for MixSettings {
    fn default() -> Self {
        Self::from(&AudioConfig::default())
    }
}

/// Outcome of feeding a source segment into the mixer
pub struct FeedResult {
    /// The live source, positioned after the fed segment
    pub source: AudioReader,
    /// Bytes written to the mixer, or the error that stopped the feed
    pub fed: io::Result<u64>,
}

/// A running mix: its output, the stdin feed task and the process itself
pub struct MixJob {
    pub output: AudioReader,
    pub feed: JoinHandle<FeedResult>,
    pub exit: ExitWatcher,
}

/// Spawns mixer processes
#[derive(Clone)]
pub struct EffectMixer {
    sox: Arc<dyn SoxRunner>,
    settings: MixSettings,
}

impl EffectMixer {
    pub fn new(sox: Arc<dyn SoxRunner>, settings: MixSettings) -> Self {
        Self { sox, settings }
    }

    /// Arguments mixing stdin (the live source) with `effect` onto stdout
    pub fn args(&self, effect: &Path) -> Vec<OsString> {
        let media = self.settings.media_type.as_str();
        vec![
            "-t".into(),
            media.into(),
            "-v".into(),
            self.settings.song_volume.to_string().into(),
            "-m".into(),
            "-".into(),
            "-t".into(),
            media.into(),
            "-v".into(),
            self.settings.fx_volume.to_string().into(),
            effect.as_os_str().to_os_string(),
            "-t".into(),
            media.into(),
            "-".into(),
        ]
    }

    /// Start mixing `segment_len` bytes of `source` with `effect`.
    ///
    /// On spawn failure the untouched source is returned with the error.
    pub fn spawn(
        &self,
        effect: &Path,
        source: AudioReader,
        segment_len: u64,
    ) -> Result<MixJob, (AudioReader, io::Error)> {
        let process = match self.sox.spawn(&self.args(effect)) {
            Ok(process) => process,
            Err(e) => return Err((source, e)),
        };
        let (stdin, stdout, stderr, exit) = process.split();

        let Some(stdin) = stdin else {
            return Err((
                source,
                io::Error::new(io::ErrorKind::BrokenPipe, "mixer stdin unavailable"),
            ));
        };

        tokio::spawn(log_stderr(stderr));
        let feed = tokio::spawn(feed_segment(source, stdin, segment_len));

        Ok(MixJob {
            output: stdout,
            feed,
            exit,
        })
    }
}

/// Copy one segment of the source into the mixer, then close its stdin
async fn feed_segment(source: AudioReader, mut stdin: ProcessWriter, segment_len: u64) -> FeedResult {
    let mut segment = source.take(segment_len);
    let fed = async {
        let copied = tokio::io::copy(&mut segment, &mut stdin).await?;
        stdin.shutdown().await?;
        Ok::<_, io::Error>(copied)
    }
    .await;

    match &fed {
        Ok(n) => tracing::debug!("fed {} source bytes to the mixer", n),
        Err(e) => tracing::warn!("mixer feed stopped: {}", e),
    }

    FeedResult {
        source: segment.into_inner(),
        fed,
    }
}

async fn log_stderr(mut stderr: AudioReader) {
    let mut text = String::new();
    if stderr.read_to_string(&mut text).await.is_ok() && !text.trim().is_empty() {
        tracing::warn!("mixer: {}", text.trim());
    }
}

/// Number of source bytes to mix with an effect.
///
/// Uses the effect's playing time when known; otherwise assumes the effect is
/// encoded at the live rate, so its file size is the segment length.
pub fn segment_len(effect_duration: Option<Duration>, effect_size: u64, byte_rate: f64) -> u64 {
    match effect_duration {
        Some(duration) if byte_rate > 0.0 => (duration.as_secs_f64() * byte_rate).ceil() as u64,
        _ => effect_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sox::testing::{Script, ScriptedSox};
    use std::io::Cursor;

    fn mixer(sox: ScriptedSox) -> EffectMixer {
        EffectMixer::new(Arc::new(sox), MixSettings::default())
    }

    #[test]
    fn test_mix_args() {
        let args: Vec<String> = mixer(ScriptedSox::default())
            .args(Path::new("fx.mp3"))
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(
            args,
            vec![
                "-t", "mp3", "-v", "0.99", "-m", "-", "-t", "mp3", "-v", "0.1", "fx.mp3", "-t",
                "mp3", "-"
            ]
        );
    }

    #[test]
    fn test_segment_len() {
        assert_eq!(segment_len(Some(Duration::from_secs(2)), 999, 16_000.0), 32_000);
        assert_eq!(segment_len(Some(Duration::from_millis(1500)), 999, 1_000.0), 1_500);
        assert_eq!(segment_len(None, 4_096, 16_000.0), 4_096);
        assert_eq!(segment_len(Some(Duration::from_secs(1)), 10, 0.0), 10);
    }

    #[tokio::test]
    async fn test_feed_returns_source_after_segment() {
        let sox = ScriptedSox::new(vec![Script::Echo]);
        let source: AudioReader = Box::new(Cursor::new(b"0123456789".to_vec()));

        let job = match mixer(sox.clone()).spawn(Path::new("fx.mp3"), source, 4) {
            Ok(job) => job,
            Err((_, e)) => panic!("spawn failed: {}", e),
        };

        let mut output = job.output;
        let mut mixed = Vec::new();
        output.read_to_end(&mut mixed).await.unwrap();
        assert_eq!(mixed, b"0123");

        let result = job.feed.await.unwrap();
        assert_eq!(result.fed.unwrap(), 4);

        let mut rest = Vec::new();
        let mut source = result.source;
        source.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"456789");

        assert_eq!(sox.calls().len(), 1);
        assert!(sox.calls()[0].contains(&"fx.mp3".to_string()));
    }

    #[tokio::test]
    async fn test_spawn_failure_returns_source() {
        let sox = ScriptedSox::new(vec![Script::SpawnError]);
        let source: AudioReader = Box::new(Cursor::new(b"abc".to_vec()));

        let Err((mut source, e)) = mixer(sox).spawn(Path::new("fx.mp3"), source, 3) else {
            panic!("spawn should fail");
        };
        assert_eq!(e.kind(), io::ErrorKind::NotFound);

        let mut data = Vec::new();
        source.read_to_end(&mut data).await.unwrap();
        assert_eq!(data, b"abc");
    }
}
