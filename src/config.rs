use std::{
    env,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, anyhow};
use config::{Config, Environment, File};
use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "config/app_config.toml";
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_IMAGE_MODEL: &str = "playgroundai/playground-v2.5";
const DEFAULT_CHAT_MODEL: &str = "meta-llama/llama-3.3-70b-instruct:free";
const DEFAULT_REFERER: &str = "https://ai-thumbnails-maker.com";
const DEFAULT_TITLE: &str = "AI Thumbnail Maker";
const DEFAULT_THUMBNAIL_BASE: &str = "https://img.youtube.com/vi";
const DEFAULT_OUTPUT_DIR: &str = "thumbnails";

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
}

#[derive(Clone, Debug)]
pub struct OpenRouterConfig {
    pub api_key: String,
    pub base_url: String,
    pub image_model: String,
    pub chat_model: String,
    pub referer: String,
    pub title: String,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Proxy endpoint (`.../api/generate`). `None` means generate in-process.
    pub endpoint: Option<String>,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct PreprocessConfig {
    pub max_file_bytes: u64,
    pub max_width: u32,
    pub max_height: u32,
    /// JPEG quality, 1..=100.
    pub quality: u8,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: 10 * 1024 * 1024,
            max_width: 1024,
            max_height: 1024,
            quality: 80,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(2000),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub key_prefix_len: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix_len: 100,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DirectLinkConfig {
    pub thumbnail_base: String,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub openrouter: Option<OpenRouterConfig>,
    pub client: ClientConfig,
    pub preprocess: PreprocessConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub direct_link: DirectLinkConfig,
    pub output_dir: PathBuf,
}

impl AppConfig {
    /// Defaults, then the optional TOML file, then `THUMBNAIL__SECTION__KEY`
    /// variables, then the legacy `OPENROUTER_*` variables.
    pub fn load() -> anyhow::Result<Self> {
        let config_path =
            env::var("APP_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let config_path = Path::new(&config_path);

        let settings = Config::builder()
            .add_source(File::from(config_path).required(false))
            .add_source(Environment::with_prefix("THUMBNAIL").separator("__"))
            .build()
            .with_context(|| format!("failed to read configuration {:?}", config_path))?;

        let mut file_config: FileConfig = settings
            .try_deserialize()
            .with_context(|| format!("failed to parse configuration {:?}", config_path))?;
        file_config.apply_legacy_env();

        file_config.into_domain()
    }

    #[cfg(test)]
    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(contents, ::config::FileFormat::Toml))
            .build()
            .context("failed to read inline configuration")?;
        let file_config: FileConfig = settings
            .try_deserialize()
            .context("failed to parse inline configuration")?;
        file_config.into_domain()
    }
}

#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    output_dir: Option<String>,
    #[serde(default)]
    server: Option<FileServerConfig>,
    #[serde(default)]
    openrouter: Option<FileOpenRouterConfig>,
    #[serde(default)]
    client: Option<FileClientConfig>,
    #[serde(default)]
    preprocess: Option<FilePreprocessConfig>,
    #[serde(default)]
    retry: Option<FileRetryConfig>,
    #[serde(default)]
    cache: Option<FileCacheConfig>,
    #[serde(default)]
    direct_link: Option<FileDirectLinkConfig>,
}

impl FileConfig {
    fn apply_legacy_env(&mut self) {
        let section = self.openrouter.get_or_insert_with(Default::default);
        if let Some(key) = non_empty_env("OPENROUTER_API_KEY") {
            section.api_key = Some(key);
        }
        if let Some(model) = non_empty_env("OPENROUTER_MODEL") {
            section.image_model = Some(model);
        }
        if let Some(model) = non_empty_env("OPENROUTER_CHAT_MODEL") {
            section.chat_model = Some(model);
        }
    }

    fn into_domain(self) -> anyhow::Result<AppConfig> {
        let server = self.server.unwrap_or_default().into_domain()?;
        let openrouter = self
            .openrouter
            .and_then(FileOpenRouterConfig::into_domain);
        let client = self.client.unwrap_or_default().into_domain();
        let preprocess = self.preprocess.unwrap_or_default().into_domain();
        let retry = self.retry.unwrap_or_default().into_domain();
        let cache = self.cache.unwrap_or_default().into_domain();
        let direct_link = self.direct_link.unwrap_or_default().into_domain();
        let output_dir = PathBuf::from(
            self.output_dir
                .unwrap_or_else(|| DEFAULT_OUTPUT_DIR.to_string()),
        );

        Ok(AppConfig {
            server,
            openrouter,
            client,
            preprocess,
            retry,
            cache,
            direct_link,
            output_dir,
        })
    }
}

#[derive(Debug, Deserialize, Default)]
struct FileServerConfig {
    #[serde(default)]
    bind_addr: Option<String>,
}

impl FileServerConfig {
    fn into_domain(self) -> anyhow::Result<ServerConfig> {
        let bind_addr_str = self
            .bind_addr
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_addr_str
            .parse::<SocketAddr>()
            .map_err(|err| anyhow!("invalid server.bind_addr {bind_addr_str:?}: {err}"))?;
        Ok(ServerConfig { bind_addr })
    }
}

#[derive(Debug, Deserialize, Default)]
struct FileOpenRouterConfig {
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    image_model: Option<String>,
    #[serde(default)]
    chat_model: Option<String>,
    #[serde(default)]
    referer: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    timeout_seconds: Option<u64>,
}

impl FileOpenRouterConfig {
    fn into_domain(self) -> Option<OpenRouterConfig> {
        let api_key = self.api_key.filter(|key| !key.trim().is_empty())?;

        Some(OpenRouterConfig {
            api_key,
            base_url: self
                .base_url
                .map(|url| url.trim().trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty())
                .unwrap_or_else(|| DEFAULT_OPENROUTER_BASE_URL.to_string()),
            image_model: self
                .image_model
                .unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string()),
            chat_model: self
                .chat_model
                .unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
            referer: self.referer.unwrap_or_else(|| DEFAULT_REFERER.to_string()),
            title: self.title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            timeout: Duration::from_secs(self.timeout_seconds.unwrap_or(120).max(5)),
        })
    }
}

#[derive(Debug, Deserialize, Default)]
struct FileClientConfig {
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    timeout_seconds: Option<u64>,
}

impl FileClientConfig {
    fn into_domain(self) -> ClientConfig {
        ClientConfig {
            endpoint: self
                .endpoint
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            timeout: Duration::from_secs(self.timeout_seconds.unwrap_or(180).max(5)),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct FilePreprocessConfig {
    #[serde(default)]
    max_file_mb: Option<u64>,
    #[serde(default)]
    max_width: Option<u32>,
    #[serde(default)]
    max_height: Option<u32>,
    #[serde(default)]
    quality: Option<f32>,
}

impl FilePreprocessConfig {
    fn into_domain(self) -> PreprocessConfig {
        let defaults = PreprocessConfig::default();
        PreprocessConfig {
            max_file_bytes: self
                .max_file_mb
                .map(|mb| mb.max(1) * 1024 * 1024)
                .unwrap_or(defaults.max_file_bytes),
            max_width: self.max_width.unwrap_or(defaults.max_width).max(1),
            max_height: self.max_height.unwrap_or(defaults.max_height).max(1),
            quality: self
                .quality
                .map(quality_percent)
                .unwrap_or(defaults.quality),
        }
    }
}

/// Maps a 0.0..=1.0 quality factor onto the JPEG encoder's 1..=100 scale.
pub fn quality_percent(factor: f32) -> u8 {
    (factor.clamp(0.01, 1.0) * 100.0).round() as u8
}

#[derive(Debug, Deserialize, Default)]
struct FileRetryConfig {
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    base_delay_ms: Option<u64>,
}

impl FileRetryConfig {
    fn into_domain(self) -> RetryConfig {
        let defaults = RetryConfig::default();
        RetryConfig {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            base_delay: self
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct FileCacheConfig {
    #[serde(default)]
    key_prefix_len: Option<usize>,
}

impl FileCacheConfig {
    fn into_domain(self) -> CacheConfig {
        CacheConfig {
            key_prefix_len: self
                .key_prefix_len
                .unwrap_or(CacheConfig::default().key_prefix_len),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct FileDirectLinkConfig {
    #[serde(default)]
    thumbnail_base: Option<String>,
}

impl FileDirectLinkConfig {
    fn into_domain(self) -> DirectLinkConfig {
        DirectLinkConfig {
            thumbnail_base: self
                .thumbnail_base
                .map(|base| base.trim().trim_end_matches('/').to_string())
                .filter(|base| !base.is_empty())
                .unwrap_or_else(|| DEFAULT_THUMBNAIL_BASE.to_string()),
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = AppConfig::from_toml_str("").expect("defaults");

        assert_eq!(config.server.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert!(config.openrouter.is_none());
        assert!(config.client.endpoint.is_none());
        assert_eq!(config.preprocess.max_file_bytes, 10 * 1024 * 1024);
        assert_eq!(config.preprocess.max_width, 1024);
        assert_eq!(config.preprocess.max_height, 1024);
        assert_eq!(config.preprocess.quality, 80);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.base_delay, Duration::from_millis(2000));
        assert_eq!(config.cache.key_prefix_len, 100);
        assert_eq!(config.direct_link.thumbnail_base, DEFAULT_THUMBNAIL_BASE);
        assert_eq!(config.output_dir, PathBuf::from(DEFAULT_OUTPUT_DIR));
    }

    #[test]
    fn openrouter_section_requires_api_key() {
        let config = AppConfig::from_toml_str(
            r#"
            [openrouter]
            image_model = "custom/model"
            "#,
        )
        .expect("config");
        assert!(config.openrouter.is_none());

        let config = AppConfig::from_toml_str(
            r#"
            [openrouter]
            api_key = "sk-test"
            base_url = "https://example.test/v1/"
            "#,
        )
        .expect("config");
        let openrouter = config.openrouter.expect("configured");
        assert_eq!(openrouter.api_key, "sk-test");
        assert_eq!(openrouter.base_url, "https://example.test/v1");
        assert_eq!(openrouter.image_model, DEFAULT_IMAGE_MODEL);
        assert_eq!(openrouter.chat_model, DEFAULT_CHAT_MODEL);
    }

    #[test]
    fn file_values_override_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            output_dir = "/tmp/out"

            [server]
            bind_addr = "0.0.0.0:8080"

            [client]
            endpoint = "http://localhost:3000/api/generate"

            [preprocess]
            max_file_mb = 5
            quality = 0.5

            [retry]
            max_retries = 4
            base_delay_ms = 10
            "#,
        )
        .expect("config");

        assert_eq!(config.server.bind_addr.port(), 8080);
        assert_eq!(
            config.client.endpoint.as_deref(),
            Some("http://localhost:3000/api/generate")
        );
        assert_eq!(config.preprocess.max_file_bytes, 5 * 1024 * 1024);
        assert_eq!(config.preprocess.quality, 50);
        assert_eq!(config.retry.max_retries, 4);
        assert_eq!(config.retry.base_delay, Duration::from_millis(10));
        assert_eq!(config.output_dir, PathBuf::from("/tmp/out"));
    }

    #[test]
    fn invalid_bind_addr_is_rejected() {
        let result = AppConfig::from_toml_str(
            r#"
            [server]
            bind_addr = "not-an-address"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn quality_factor_maps_to_percent() {
        assert_eq!(quality_percent(0.8), 80);
        assert_eq!(quality_percent(0.9), 90);
        assert_eq!(quality_percent(5.0), 100);
        assert_eq!(quality_percent(0.0), 1);
    }
}
