//! Text control commands
//!
//! Commands arrive as free text (`"start"`, `"stop"`, `"fx boo"`), are
//! normalized, and are dispatched to the [`Engine`]. `start` answers once
//! the source is on air; the rest of the run continues in the background.

use serde::Serialize;

use crate::playback::Engine;

/// A parsed control command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    /// Splice the named effect into the live stream
    Effect(String),
    /// Anything else, normalized
    Unknown(String),
}

impl Command {
    /// Parse a command: surrounding whitespace is ignored and matching is
    /// case-insensitive.
    pub fn parse(input: &str) -> Self {
        let normalized = input.trim().to_lowercase();

        match normalized.as_str() {
            "start" => Command::Start,
            "stop" => Command::Stop,
            _ => match normalized.split_once(char::is_whitespace) {
                Some(("fx", name)) if !name.trim().is_empty() => {
                    Command::Effect(name.trim().to_string())
                }
                _ => Command::Unknown(normalized),
            },
        }
    }
}

/// Result of dispatching a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutcome {
    pub ok: bool,
    pub message: String,
}

impl CommandOutcome {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// Run `command` against `engine`
pub async fn dispatch(engine: &Engine, command: Command) -> CommandOutcome {
    tracing::info!("control command: {:?}", command);

    match command {
        Command::Start => match engine.begin().await {
            Ok(playback) => {
                tokio::spawn(async move {
                    match playback.finished().await {
                        Ok(outcome) => tracing::info!(
                            "playback ended ({:?}) after {} bytes",
                            outcome.reason,
                            outcome.bytes_streamed
                        ),
                        Err(e) => tracing::error!("playback failed: {}", e),
                    }
                });
                CommandOutcome::ok("streaming started")
            }
            Err(e) => {
                tracing::warn!("start rejected: {}", e);
                CommandOutcome::failed(e.to_string())
            }
        },
        Command::Stop => {
            if engine.stop().await {
                CommandOutcome::ok("streaming stopped")
            } else {
                CommandOutcome::ok("nothing to stop")
            }
        }
        Command::Effect(name) => match engine.append_effect(&name).await {
            Ok(effect) => {
                let file = effect
                    .file_name()
                    .map(|f| f.to_string_lossy().into_owned())
                    .unwrap_or(name);
                CommandOutcome::ok(format!("playing {}", file))
            }
            Err(e) => {
                tracing::warn!("effect {:?} rejected: {}", name, e);
                CommandOutcome::failed(e.to_string())
            }
        },
        Command::Unknown(text) => {
            tracing::warn!("unknown command {:?}", text);
            CommandOutcome::failed(format!("unknown command: {}", text))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sox::testing::ScriptedSox;
    use crate::config::AppConfig;
    use std::sync::Arc;

    #[test]
    fn test_parse_start_with_padding() {
        assert_eq!(Command::parse("    START    "), Command::Start);
        assert_eq!(Command::parse("stop"), Command::Stop);
        assert_eq!(Command::parse("Stop\n"), Command::Stop);
    }

    #[test]
    fn test_parse_effect() {
        assert_eq!(Command::parse("fx Boo"), Command::Effect("boo".to_string()));
        assert_eq!(
            Command::parse("  FX   fx01  "),
            Command::Effect("fx01".to_string())
        );
        assert_eq!(Command::parse("fx"), Command::Unknown("fx".to_string()));
        assert_eq!(Command::parse("fxboo"), Command::Unknown("fxboo".to_string()));
    }

    #[test]
    fn test_parse_unknown() {
        assert_eq!(
            Command::parse("    NON EXISTING    "),
            Command::Unknown("non existing".to_string())
        );
        assert_eq!(Command::parse(""), Command::Unknown(String::new()));
    }

    #[tokio::test]
    async fn test_unknown_command_does_nothing() {
        let sox = ScriptedSox::output("128k", "");
        let engine = Engine::new(&AppConfig::default(), Arc::new(sox.clone()));

        let outcome = dispatch(&engine, Command::parse("    NON EXISTING    ")).await;
        assert!(!outcome.ok);
        assert!(sox.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stop_while_idle_is_ok() {
        let engine = Engine::new(&AppConfig::default(), Arc::new(ScriptedSox::default()));
        let outcome = dispatch(&engine, Command::Stop).await;
        assert_eq!(outcome, CommandOutcome::ok("nothing to stop"));
    }

    #[tokio::test]
    async fn test_start_with_missing_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.paths.default_source = dir.path().join("missing.mp3");
        let engine = Engine::new(&config, Arc::new(ScriptedSox::output("128k", "")));

        let outcome = dispatch(&engine, Command::parse("start")).await;
        assert!(!outcome.ok);
        assert!(outcome.message.contains("missing.mp3"));
        assert_eq!(engine.status().state, crate::playback::PlaybackState::Idle);
    }

    #[tokio::test]
    async fn test_second_start_fails() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("song.mp3");
        std::fs::write(&source, vec![0u8; 1_000_000]).unwrap();
        let mut config = AppConfig::default();
        config.paths.default_source = source;
        let engine = Engine::new(&config, Arc::new(ScriptedSox::output("128k", "")));

        assert_eq!(
            dispatch(&engine, Command::Start).await,
            CommandOutcome::ok("streaming started")
        );
        let again = dispatch(&engine, Command::Start).await;
        assert!(!again.ok);
        assert_eq!(again.message, "Already streaming");

        assert!(engine.stop().await);
    }

    #[tokio::test]
    async fn test_missing_effect_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.paths.effects_dir = dir.path().to_path_buf();
        let engine = Engine::new(&config, Arc::new(ScriptedSox::default()));

        let outcome = dispatch(&engine, Command::parse("fx fx02")).await;
        assert!(!outcome.ok);
        assert!(outcome.message.contains("the effect fx02 wasn't found!"));
    }
}
