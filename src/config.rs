//! Corpus configuration loaded from `~/.config/lgp/config.toml`.
//!
//! Every field has a default, so a missing file (or a file that only sets a
//! few keys) is fine. The OpenSearch password may also come from the
//! `LGP_OPENSEARCH_PASSWORD` environment variable, which wins over the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::eaf::{TierAliases, EXPRESSION_TIER, TRANSCRIPTION_TIER};
use crate::reconcile::EngineSettings;
use crate::store::PhraseMatch;

/// Environment variable holding the OpenSearch password.
pub const PASSWORD_ENV: &str = "LGP_OPENSEARCH_PASSWORD";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorpusConfig {
    pub paths: PathsConfig,
    pub tiers: TiersConfig,
    pub opensearch: OpenSearchConfig,
    pub encoder: EncoderConfig,
    /// Upper bound for any single call to an external collaborator.
    pub external_timeout_secs: u64,
    /// Used when a video's frame rate cannot be probed.
    pub default_frame_rate: f64,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            tiers: TiersConfig::default(),
            opensearch: OpenSearchConfig::default(),
            encoder: EncoderConfig::default(),
            external_timeout_secs: 30,
            default_frame_rate: 25.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub videos: PathBuf,
    pub video_extension: String,
    pub eaf: PathBuf,
    pub annotations: PathBuf,
    pub frames: PathBuf,
    pub embeddings: PathBuf,
    pub captions: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let root = PathBuf::from("corpus");
        Self {
            videos: root.join("videos"),
            video_extension: "mp4".to_string(),
            eaf: root.join("eaf"),
            annotations: root.join("annotations"),
            frames: root.join("frames"),
            embeddings: root.join("embeddings"),
            captions: root.join("captions"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TiersConfig {
    pub transcription: String,
    pub expression: String,
    /// Extra alternate spellings, `alias = canonical`.
    pub aliases: BTreeMap<String, String>,
    pub phrase_tolerance_ms: u64,
    /// Tiers whose annotations get frames, embeddings and index entries.
    pub indexed: Vec<String>,
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            transcription: TRANSCRIPTION_TIER.to_string(),
            expression: EXPRESSION_TIER.to_string(),
            aliases: BTreeMap::new(),
            phrase_tolerance_ms: 10,
            indexed: vec![EXPRESSION_TIER.to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpenSearchConfig {
    pub url: String,
    pub index: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub verify_tls: bool,
}

impl Default for OpenSearchConfig {
    fn default() -> Self {
        Self {
            url: "https://localhost:9200".to_string(),
            index: "lgp-annotations".to_string(),
            username: None,
            password: None,
            verify_tls: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub url: String,
    pub dimension: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".to_string(),
            dimension: crate::collab::EMBEDDING_DIM,
        }
    }
}

impl CorpusConfig {
    /// Load from `path`, or from the default location when `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if an explicitly given path does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = config_path();
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };

        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            if !password.is_empty() {
                config.opensearch.password = Some(password);
            }
        }
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("invalid TOML in {}", path.display()))
    }

    /// Parse configuration text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML for this schema.
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Built-in aliases plus the ones from `[tiers.aliases]`.
    #[must_use]
    pub fn aliases(&self) -> TierAliases {
        self.tiers
            .aliases
            .iter()
            .fold(TierAliases::lgp_defaults(), |aliases, (alias, canonical)| {
                aliases.with_alias(alias.clone(), canonical.clone())
            })
    }

    #[must_use]
    pub fn phrase_match(&self) -> PhraseMatch {
        PhraseMatch {
            transcription_tier: self.tiers.transcription.clone(),
            expression_tier: self.tiers.expression.clone(),
            tolerance_ms: self.tiers.phrase_tolerance_ms,
        }
    }

    #[must_use]
    pub fn external_timeout(&self) -> Duration {
        Duration::from_secs(self.external_timeout_secs.max(1))
    }

    #[must_use]
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            eaf_dir: self.paths.eaf.clone(),
            annotations_dir: self.paths.annotations.clone(),
            captions_dir: self.paths.captions.clone(),
            embeddings_dir: self.paths.embeddings.clone(),
            aliases: self.aliases(),
            phrase: self.phrase_match(),
            indexed_tiers: self.tiers.indexed.clone(),
            external_timeout: self.external_timeout(),
            default_frame_rate: self.default_frame_rate,
        }
    }
}

/// Return the path to the default config file.
#[must_use]
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lgp")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config() {
        let config = CorpusConfig::from_toml("").unwrap();
        assert_eq!(config.tiers.transcription, TRANSCRIPTION_TIER);
        assert_eq!(config.tiers.indexed, vec![EXPRESSION_TIER.to_string()]);
        assert_eq!(config.encoder.dimension, 512);
        assert_eq!(config.external_timeout(), Duration::from_secs(30));
        assert!(config.opensearch.password.is_none());
    }

    #[test]
    fn parse_partial_config() {
        let toml_str = r#"
external_timeout_secs = 5

[paths]
eaf = "/data/eaf"

[tiers]
phrase_tolerance_ms = 40
indexed = ["GLOSA_P1_EXPRESSAO", "GLOSA_P2_EXPRESSAO"]

[tiers.aliases]
"GLOSA P1 EXPRESSAO" = "GLOSA_P1_EXPRESSAO"

[opensearch]
url = "https://search.internal:9200"
username = "corpus"
verify_tls = false
"#;
        let config = CorpusConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.paths.eaf, PathBuf::from("/data/eaf"));
        // untouched keys keep defaults
        assert_eq!(config.paths.video_extension, "mp4");
        assert_eq!(config.phrase_match().tolerance_ms, 40);
        assert_eq!(config.tiers.indexed.len(), 2);
        assert!(!config.opensearch.verify_tls);
        assert_eq!(config.opensearch.index, "lgp-annotations");

        let aliases = config.aliases();
        assert_eq!(aliases.canonical("GLOSA P1 EXPRESSAO"), EXPRESSION_TIER);
        assert_eq!(aliases.canonical("LP_P1 transcriÃ§Ã£o livre"), TRANSCRIPTION_TIER);

        let settings = config.engine_settings();
        assert_eq!(settings.external_timeout, Duration::from_secs(5));
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(CorpusConfig::from_toml("external_timeout_secs = \"soon\"").is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CorpusConfig::load(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
