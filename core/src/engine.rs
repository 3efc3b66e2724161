use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::process::Command;

use crate::config::{EngineOptions, TranslatorSettings};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to launch `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct TranslationRequest {
    /// Directory of raw pages.
    pub input_dir: PathBuf,
    /// Directory the translated pages are written to.
    pub output_dir: PathBuf,
    pub settings: TranslatorSettings,
}

/// What the translator reported when it exited.
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    /// True when the process exited with status 0.
    pub success: bool,
    /// `None` when the process was ended by a signal.
    pub exit_code: Option<i32>,
    /// Captured standard output, lossily decoded.
    pub stdout: String,
    /// Captured standard error, lossily decoded.
    pub stderr: String,
}

/// Runs one batch translation of a page directory. The call returns when the
/// translator exits; there is no timeout.
#[async_trait]
pub trait TranslationEngine: Send + Sync {
    async fn translate(&self, request: &TranslationRequest) -> Result<EngineOutput, EngineError>;
}

/// The external `manga_translator` command line.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    leading_args: Vec<String>,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>, leading_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            leading_args,
        }
    }

    pub fn build_args(&self, request: &TranslationRequest) -> Vec<String> {
        let settings = &request.settings;
        let mut args = self.leading_args.clone();
        args.extend([
            "--mode".to_string(),
            "batch".to_string(),
            "--translator".to_string(),
            settings.translator.code().to_string(),
            "-l".to_string(),
            settings.target_language.code().to_string(),
            "-i".to_string(),
            request.input_dir.display().to_string(),
            "--dest".to_string(),
            request.output_dir.display().to_string(),
            "--upscale-ratio".to_string(),
            settings.upscale_ratio.as_arg().to_string(),
        ]);

        if settings.colorize {
            args.push("--colorizer".into());
            args.push("mc2".into());
        }
        if settings.use_gpu {
            args.push("--use-gpu".into());
        }
        if settings.force_uppercase {
            args.push("--uppercase".into());
        }
        if settings.ignore_errors {
            args.push("--ignore-errors".into());
        }
        args
    }
}

impl From<EngineOptions> for CommandEngine {
    fn from(options: EngineOptions) -> Self {
        Self::new(options.program, options.leading_args)
    }
}

#[async_trait]
impl TranslationEngine for CommandEngine {
    async fn translate(&self, request: &TranslationRequest) -> Result<EngineOutput, EngineError> {
        let args = self.build_args(request);
        info!(
            "running {} on {}",
            self.program,
            request.input_dir.display()
        );
        debug!("{} {}", self.program, args.join(" "));

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| EngineError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let result = EngineOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.success {
            warn!(
                "{} exited with {:?}: {}",
                self.program,
                result.exit_code,
                last_line(&result.stderr)
            );
        }
        Ok(result)
    }
}

fn last_line(text: &str) -> &str {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TargetLanguage, TranslatorBackend, UpscaleRatio};

    fn request(settings: TranslatorSettings) -> TranslationRequest {
        TranslationRequest {
            input_dir: PathBuf::from("/library/berserk/10"),
            output_dir: PathBuf::from("/library/berserk/10_translated"),
            settings,
        }
    }

    #[test]
    fn default_settings_produce_expected_command_line() {
        let engine = CommandEngine::from(EngineOptions::default());
        let args = engine.build_args(&request(TranslatorSettings::default()));

        assert_eq!(
            args,
            vec![
                "-m",
                "manga_translator",
                "--mode",
                "batch",
                "--translator",
                "sugoi",
                "-l",
                "ENG",
                "-i",
                "/library/berserk/10",
                "--dest",
                "/library/berserk/10_translated",
                "--upscale-ratio",
                "1.0",
                "--colorizer",
                "mc2",
            ]
        );
    }

    #[test]
    fn optional_flags_follow_settings() {
        let settings = TranslatorSettings {
            translator: TranslatorBackend::Deepl,
            target_language: TargetLanguage::Jpn,
            upscale_ratio: UpscaleRatio::X2,
            colorize: false,
            use_gpu: true,
            force_uppercase: true,
            ignore_errors: true,
        };
        let engine = CommandEngine::new("translator", Vec::new());
        let args = engine.build_args(&request(settings));

        assert_eq!(&args[..2], ["--mode", "batch"]);
        assert!(args.windows(2).any(|pair| pair == ["--translator", "deepl"]));
        assert!(args.windows(2).any(|pair| pair == ["-l", "JPN"]));
        assert!(args.windows(2).any(|pair| pair == ["--upscale-ratio", "2.0"]));
        assert!(!args.iter().any(|arg| arg == "--colorizer"));
        assert!(args.ends_with(&[
            "--use-gpu".to_string(),
            "--uppercase".to_string(),
            "--ignore-errors".to_string(),
        ]));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let engine = CommandEngine::new("definitely-not-a-real-translator-binary", Vec::new());
        let err = engine
            .translate(&request(TranslatorSettings::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Spawn { .. }));
    }
}
