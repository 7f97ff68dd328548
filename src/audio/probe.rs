//! Bitrate and duration analysis via `sox --i`

use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

use crate::audio::sox::{AudioReader, SoxRunner};
use crate::error::ProbeError;

/// Upper bound for one read of the tool's output
const PROBE_READ_BUFFER: usize = 1024;

/// Determines playback parameters of audio files with the external tool
#[derive(Clone)]
pub struct BitrateProber {
    sox: Arc<dyn SoxRunner>,
    fallback_bitrate: u64,
    timeout: Option<Duration>,
}

impl BitrateProber {
    pub fn new(sox: Arc<dyn SoxRunner>, fallback_bitrate: u64) -> Self {
        Self {
            sox,
            fallback_bitrate,
            timeout: None,
        }
    }

    /// Bound each probe; a probe exceeding it counts as failed
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn fallback_bitrate(&self) -> u64 {
        self.fallback_bitrate
    }

    /// Bitrate of `source` in bits per second.
    ///
    /// Never fails: any problem with the analysis yields the fallback bitrate.
    pub async fn probe_bitrate(&self, source: &Path) -> u64 {
        let result = self
            .query(source, "-B")
            .await
            .and_then(|output| parse_bitrate(&output).ok_or(ProbeError::Unparsable(output)));

        match result {
            Ok(bitrate) => {
                tracing::debug!("{} has bitrate {}", source.display(), bitrate);
                bitrate
            }
            Err(e) => {
                tracing::warn!(
                    "bitrate probe failed for {}: {}, using fallback {}",
                    source.display(),
                    e,
                    self.fallback_bitrate
                );
                self.fallback_bitrate
            }
        }
    }

    /// Playing time of `source`, if the tool can tell
    pub async fn probe_duration(&self, source: &Path) -> Option<Duration> {
        let result = self
            .query(source, "-D")
            .await
            .and_then(|output| parse_duration(&output).ok_or(ProbeError::Unparsable(output)));

        match result {
            Ok(duration) => Some(duration),
            Err(e) => {
                tracing::warn!("duration probe failed for {}: {}", source.display(), e);
                None
            }
        }
    }

    async fn query(&self, source: &Path, flag: &str) -> Result<String, ProbeError> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.run_info(source, flag))
                .await
                .map_err(|_| ProbeError::Timeout)?,
            None => self.run_info(source, flag).await,
        }
    }

    /// Run `sox --i <flag> <source>` and return its trimmed stdout
    async fn run_info(&self, source: &Path, flag: &str) -> Result<String, ProbeError> {
        let args = [
            OsString::from("--i"),
            OsString::from(flag),
            source.as_os_str().to_os_string(),
        ];
        let process = self.sox.spawn(&args).map_err(ProbeError::Spawn)?;
        let (stdin, mut stdout, mut stderr, mut exit) = process.split();
        drop(stdin);

        // One read per channel: the tool prints a single short line.
        let (out, err) = tokio::join!(read_once(&mut stdout), read_once(&mut stderr));
        let out = out.map_err(ProbeError::Read)?;
        let err = err.map_err(ProbeError::Read)?;

        drop(stdout);
        drop(stderr);
        if let Some(Err(e)) = exit.wait().await {
            tracing::debug!("could not reap sox: {}", e);
        }

        if !err.is_empty() {
            return Err(ProbeError::Stderr(err.trim().to_string()));
        }

        Ok(out.trim().to_string())
    }
}

async fn read_once(reader: &mut AudioReader) -> std::io::Result<String> {
    let mut buf = vec![0u8; PROBE_READ_BUFFER];
    let n = reader.read(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
}

/// Parse `sox --i -B` output: `"128k"` means 128000 bits per second
pub fn parse_bitrate(output: &str) -> Option<u64> {
    let trimmed = output.trim();
    let digits = match trimmed.strip_suffix('k') {
        Some(kilo) => format!("{}000", kilo),
        None => trimmed.to_string(),
    };
    digits.parse().ok()
}

/// Parse `sox --i -D` output: seconds as a decimal number
pub fn parse_duration(output: &str) -> Option<Duration> {
    let seconds: f64 = output.trim().parse().ok()?;
    if seconds.is_finite() && seconds >= 0.0 {
        Some(Duration::from_secs_f64(seconds))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sox::testing::{Script, ScriptedSox};
    use proptest::prelude::*;

    fn prober(sox: ScriptedSox) -> BitrateProber {
        BitrateProber::new(Arc::new(sox), 128_000)
    }

    #[tokio::test]
    async fn test_bitrate_from_stdout() {
        let sox = ScriptedSox::output("   1k   ", "");
        let bitrate = prober(sox.clone()).probe_bitrate(Path::new("mySong")).await;

        assert_eq!(bitrate, 1000);
        assert_eq!(sox.calls(), vec![vec!["--i", "-B", "mySong"]]);
    }

    #[tokio::test]
    async fn test_bitrate_128k() {
        let sox = ScriptedSox::output("\n  128k \n", "");
        assert_eq!(prober(sox).probe_bitrate(Path::new("song.mp3")).await, 128_000);
    }

    #[tokio::test]
    async fn test_stderr_yields_fallback() {
        let sox = ScriptedSox::output("320k", "error!");
        let prober = BitrateProber::new(Arc::new(sox), 96_000);
        assert_eq!(prober.probe_bitrate(Path::new("mySong")).await, 96_000);
    }

    #[tokio::test]
    async fn test_spawn_failure_yields_fallback() {
        let sox = ScriptedSox::new(vec![Script::SpawnError]);
        assert_eq!(prober(sox).probe_bitrate(Path::new("mySong")).await, 128_000);
    }

    #[tokio::test]
    async fn test_unknown_suffix_yields_fallback() {
        let sox = ScriptedSox::output("1.41M", "");
        assert_eq!(prober(sox).probe_bitrate(Path::new("song.wav")).await, 128_000);
    }

    #[tokio::test]
    async fn test_duration() {
        let sox = ScriptedSox::output("2.500000\n", "");
        let duration = prober(sox.clone()).probe_duration(Path::new("fx.mp3")).await;

        assert_eq!(duration, Some(Duration::from_millis(2500)));
        assert_eq!(sox.calls(), vec![vec!["--i", "-D", "fx.mp3"]]);
    }

    #[tokio::test]
    async fn test_duration_failure() {
        let sox = ScriptedSox::output("", "sox FAIL formats");
        assert_eq!(prober(sox).probe_duration(Path::new("fx.mp3")).await, None);
    }

    #[test]
    fn test_parse_bitrate() {
        assert_eq!(parse_bitrate("128k"), Some(128_000));
        assert_eq!(parse_bitrate("64000"), Some(64_000));
        assert_eq!(parse_bitrate(""), None);
        assert_eq!(parse_bitrate("k"), None);
        assert_eq!(parse_bitrate("92.2k"), None);
    }

    proptest! {
        #[test]
        fn kilobit_suffix_always_expands(
            kbps in 1u64..100_000,
            leading in "[ \t\n]{0,4}",
            trailing in "[ \t\n]{0,4}",
        ) {
            let output = format!("{}{}k{}", leading, kbps, trailing);
            prop_assert_eq!(parse_bitrate(&output), Some(kbps * 1000));
        }
    }
}
