//! Configuration for the download and translation pipeline.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read or write config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Unsupported {field}: {value}")]
    Unsupported { field: &'static str, value: String },
}

macro_rules! closed_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $field:literal {
            $($variant:ident => ($code:literal, $label:literal)),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $code)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn code(&self) -> &'static str {
                match self {
                    $($name::$variant => $code,)+
                }
            }

            pub fn label(&self) -> &'static str {
                match self {
                    $($name::$variant => $label,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = ConfigError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                let trimmed = value.trim();
                $name::ALL
                    .iter()
                    .copied()
                    .find(|candidate| candidate.code().eq_ignore_ascii_case(trimmed))
                    .ok_or_else(|| ConfigError::Unsupported {
                        field: $field,
                        value: value.to_string(),
                    })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.code())
            }
        }
    };
}

closed_enum! {
    /// Translation backends understood by the external translator.
    TranslatorBackend, "translator" {
        Google => ("google", "Google Translate"),
        Youdao => ("youdao", "YouDao"),
        Baidu => ("baidu", "Baidu"),
        Deepl => ("deepl", "DeepL"),
        Papago => ("papago", "Papago"),
        Caiyun => ("caiyun", "Caiyun"),
        Gpt3 => ("gpt3", "GPT-3"),
        Gpt35 => ("gpt3.5", "GPT-3.5"),
        Gpt4 => ("gpt4", "GPT-4"),
        Disabled => ("none", "None"),
        Original => ("original", "Original"),
        Offline => ("offline", "Offline"),
        Nllb => ("nllb", "NLLB"),
        NllbBig => ("nllb_big", "NLLB Big"),
        Sugoi => ("sugoi", "Sugoi"),
        JparaCrawl => ("jparacrawl", "JParaCrawl"),
        JparaCrawlBig => ("jparacrawl_big", "JParaCrawl Big"),
        M2m100 => ("m2m100", "M2M100"),
        M2m100Big => ("m2m100_big", "M2M100 Big"),
        Sakura => ("sakura", "Sakura"),
    }
}

closed_enum! {
    /// Target language codes accepted by the external translator.
    TargetLanguage, "target language" {
        Eng => ("ENG", "English"),
        Chs => ("CHS", "Chinese Simplified"),
        Cht => ("CHT", "Chinese Traditional"),
        Csy => ("CSY", "Czech"),
        Nld => ("NLD", "Dutch"),
        Fra => ("FRA", "French"),
        Deu => ("DEU", "German"),
        Hun => ("HUN", "Hungarian"),
        Ita => ("ITA", "Italian"),
        Jpn => ("JPN", "Japanese"),
        Kor => ("KOR", "Korean"),
        Plk => ("PLK", "Polish"),
        Ptb => ("PTB", "Portuguese (Brazil)"),
        Rom => ("ROM", "Romanian"),
        Rus => ("RUS", "Russian"),
        Esp => ("ESP", "Spanish"),
        Trk => ("TRK", "Turkish"),
        Ukr => ("UKR", "Ukrainian"),
        Vin => ("VIN", "Vietnamese"),
        Ara => ("ARA", "Arabic"),
        Cnr => ("CNR", "Montenegrin"),
        Srp => ("SRP", "Serbian"),
        Hrv => ("HRV", "Croatian"),
        Tha => ("THA", "Thai"),
        Ind => ("IND", "Indonesian"),
        Fil => ("FIL", "Filipino"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub enum UpscaleRatio {
    X1,
    X1_5,
    X2,
}

impl UpscaleRatio {
    pub fn value(&self) -> f64 {
        match self {
            UpscaleRatio::X1 => 1.0,
            UpscaleRatio::X1_5 => 1.5,
            UpscaleRatio::X2 => 2.0,
        }
    }

    /// Rendering used on the translator's command line.
    pub fn as_arg(&self) -> &'static str {
        match self {
            UpscaleRatio::X1 => "1.0",
            UpscaleRatio::X1_5 => "1.5",
            UpscaleRatio::X2 => "2.0",
        }
    }
}

impl TryFrom<f64> for UpscaleRatio {
    type Error = ConfigError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        [UpscaleRatio::X1, UpscaleRatio::X1_5, UpscaleRatio::X2]
            .into_iter()
            .find(|ratio| (ratio.value() - value).abs() < f64::EPSILON)
            .ok_or_else(|| ConfigError::Unsupported {
                field: "upscale ratio",
                value: value.to_string(),
            })
    }
}

impl From<UpscaleRatio> for f64 {
    fn from(ratio: UpscaleRatio) -> Self {
        ratio.value()
    }
}

/// Parameters forwarded to every translator invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TranslatorSettings {
    /// Machine translation backend.
    pub translator: TranslatorBackend,
    /// Language the pages are translated into.
    pub target_language: TargetLanguage,
    /// Upscaling applied before text detection.
    pub upscale_ratio: UpscaleRatio,
    /// Colorize grayscale pages.
    pub colorize: bool,
    /// Run detection and inpainting on the GPU.
    pub use_gpu: bool,
    /// Render translated text in upper case.
    pub force_uppercase: bool,
    /// Keep going when a single page fails inside the translator.
    pub ignore_errors: bool,
}

impl Default for TranslatorSettings {
    fn default() -> Self {
        Self {
            translator: TranslatorBackend::Sugoi,
            target_language: TargetLanguage::Eng,
            upscale_ratio: UpscaleRatio::X1,
            colorize: true,
            use_gpu: false,
            force_uppercase: false,
            ignore_errors: false,
        }
    }
}

/// Retry and timeout settings for chapter downloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DownloadOptions {
    /// Retries after the first attempt of each request.
    pub max_retries: u32,
    /// Delay before the first retry; doubled on every further retry.
    pub base_delay_ms: u64,
    /// Cap on any single delay, `Retry-After` hints included.
    pub max_delay_ms: u64,
    /// Connect timeout, and the total timeout of a single request.
    pub request_timeout_secs: u64,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
            request_timeout_secs: 120,
        }
    }
}

impl DownloadOptions {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.max_retries,
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// How the external translator is launched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineOptions {
    /// Executable looked up on `PATH` unless absolute.
    pub program: String,
    /// Arguments placed before the generated ones, e.g. `-m manga_translator`.
    pub leading_args: Vec<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            program: "python".into(),
            leading_args: vec!["-m".into(), "manga_translator".into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    #[serde(default = "default_library_root")]
    pub library_root: PathBuf,
    #[serde(default)]
    pub translator: TranslatorSettings,
    #[serde(default)]
    pub download: DownloadOptions,
    #[serde(default)]
    pub engine: EngineOptions,
    #[serde(default = "default_poll_interval_ms")]
    pub progress_poll_interval_ms: u64,
    /// Mirror completed jobs to `<library_root>/history.jsonl`.
    #[serde(default = "default_true")]
    pub persist_history: bool,
}

fn default_library_root() -> PathBuf {
    dirs::document_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Documents")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chapter-library")
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_true() -> bool {
    true
}

/// `<config dir>/chapter-translator/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("chapter-translator").join("config.json"))
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            library_root: default_library_root(),
            translator: TranslatorSettings::default(),
            download: DownloadOptions::default(),
            engine: EngineOptions::default(),
            progress_poll_interval_ms: default_poll_interval_ms(),
            persist_history: true,
        }
    }
}

impl PipelineConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Reads the config at `path`, writing the defaults there first when the
    /// file does not exist yet.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            return Self::from_json_file(path);
        }
        let config = Self::default();
        config.to_json_file(path)?;
        Ok(config)
    }

    pub fn progress_poll_interval(&self) -> Duration {
        Duration::from_millis(self.progress_poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.translator.translator, TranslatorBackend::Sugoi);
        assert_eq!(config.translator.target_language, TargetLanguage::Eng);
        assert_eq!(config.translator.upscale_ratio, UpscaleRatio::X1);
        assert!(config.translator.colorize);
        assert_eq!(config.download.max_retries, 3);
        assert_eq!(config.progress_poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_json_serialization() {
        let mut config = PipelineConfig::default();
        config.translator.translator = TranslatorBackend::Gpt35;
        config.translator.upscale_ratio = UpscaleRatio::X1_5;
        let json = config.to_json().unwrap();
        assert!(json.contains("\"gpt3.5\""));
        assert!(json.contains("1.5"));

        let deserialized = PipelineConfig::from_json(&json).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = PipelineConfig::from_json(
            r#"{"libraryRoot": "/srv/library", "translator": {"targetLanguage": "KOR"}}"#,
        )
        .unwrap();
        assert_eq!(config.library_root, PathBuf::from("/srv/library"));
        assert_eq!(config.translator.target_language, TargetLanguage::Kor);
        assert_eq!(config.translator.translator, TranslatorBackend::Sugoi);
    }

    #[test]
    fn unknown_values_are_rejected_at_the_boundary() {
        assert!(PipelineConfig::from_json(r#"{"translator": {"translator": "bing"}}"#).is_err());
        assert!(PipelineConfig::from_json(r#"{"translator": {"targetLanguage": "XXX"}}"#).is_err());
        assert!(PipelineConfig::from_json(r#"{"translator": {"upscaleRatio": 3.0}}"#).is_err());

        assert!(matches!(
            "bing".parse::<TranslatorBackend>(),
            Err(ConfigError::Unsupported { field: "translator", .. })
        ));
        assert_eq!("deepl".parse::<TranslatorBackend>().unwrap(), TranslatorBackend::Deepl);
        assert_eq!("kor".parse::<TargetLanguage>().unwrap(), TargetLanguage::Kor);
    }

    #[test]
    fn load_or_create_writes_defaults_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let created = PipelineConfig::load_or_create(&path).unwrap();
        assert!(path.exists());

        let mut edited = created.clone();
        edited.translator.use_gpu = true;
        edited.to_json_file(&path).unwrap();

        let reloaded = PipelineConfig::load_or_create(&path).unwrap();
        assert!(reloaded.translator.use_gpu);
    }
}
