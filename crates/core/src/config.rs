use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::tool::ToolKind;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "TOOLBENCH_DATA_DIR";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 3000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub livekit: LivekitConfig,
    pub client: ClientConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

/// Credentials and base URLs of the external services. Everything here is
/// optional on disk; missing values surface as configuration errors on the
/// request that needs them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpstreamConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runpod_api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_api_url: Option<String>,
    pub endpoints: EndpointsConfig,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct EndpointsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wall_painting: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wall_painting_v2: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clothes_swapper: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_composition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pbr_map_generator: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct LivekitConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,
}

/// Settings for the job lifecycle client (the `run`/`status` commands).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    pub proxy_url: String,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub examples_dir: PathBuf,
    pub settings_file: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "0.0.0.0".to_string(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            runpod_api_key: None,
            resource_api_url: None,
            endpoints: EndpointsConfig::default(),
            request_timeout_secs: 600,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            proxy_url: "http://127.0.0.1:3000".to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            examples_dir: PathBuf::from("public/examples"),
            settings_file: PathBuf::from("session_settings.json"),
        }
    }
}

impl UpstreamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl EndpointsConfig {
    pub fn for_tool(&self, tool: ToolKind) -> Option<&str> {
        let value = match tool {
            ToolKind::WallPainting => &self.wall_painting,
            ToolKind::WallPaintingV2 => &self.wall_painting_v2,
            ToolKind::ClothesSwapper => &self.clothes_swapper,
            ToolKind::ImageComposition => &self.image_composition,
            ToolKind::PbrMapGenerator => &self.pbr_map_generator,
        };
        non_empty(value)
    }

    fn slot_mut(&mut self, tool: ToolKind) -> &mut Option<String> {
        match tool {
            ToolKind::WallPainting => &mut self.wall_painting,
            ToolKind::WallPaintingV2 => &mut self.wall_painting_v2,
            ToolKind::ClothesSwapper => &mut self.clothes_swapper,
            ToolKind::ImageComposition => &mut self.image_composition,
            ToolKind::PbrMapGenerator => &mut self.pbr_map_generator,
        }
    }
}

impl ClientConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Trimmed value of an optional setting, `None` when unset or blank.
pub fn non_empty(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Overlay process environment variables onto the file values.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| env::var(key).ok());
    }

    /// Overlay variables from `lookup`; set, non-blank variables win.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(value) = read("RUNPOD_API_KEY") {
            self.upstream.runpod_api_key = Some(value);
        }
        if let Some(value) = read("RESOURCE_API_URL") {
            self.upstream.resource_api_url = Some(value);
        }
        for tool in ToolKind::ALL {
            if let Some(value) = read(tool.endpoint_env()) {
                *self.upstream.endpoints.slot_mut(tool) = Some(value);
            }
        }
        if let Some(value) = read("LIVEKIT_API_KEY") {
            self.livekit.api_key = Some(value);
        }
        if let Some(value) = read("LIVEKIT_API_SECRET") {
            self.livekit.api_secret = Some(value);
        }
        if let Some(value) = read("LIVEKIT_URL") {
            self.livekit.ws_url = Some(value);
        }
        if let Some(port) = read("PORT").and_then(|value| value.trim().parse::<u16>().ok()) {
            self.server.port = port;
        }
    }

    /// Absolute location of the example images.
    pub fn examples_dir(&self, data_dir: &Path) -> PathBuf {
        if self.paths.examples_dir.is_absolute() {
            self.paths.examples_dir.clone()
        } else {
            env::current_dir()
                .map(|cwd| cwd.join(&self.paths.examples_dir))
                .unwrap_or_else(|_| resolve_relative_to(data_dir, &self.paths.examples_dir))
        }
    }

    pub fn settings_path(&self, data_dir: &Path) -> PathBuf {
        resolve_relative_to(data_dir, &self.paths.settings_file)
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. TOOLBENCH_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and write a default config.toml on first run.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.server.port, 3000);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.client.poll_interval_ms, 3000);
        assert_eq!(cfg.upstream.request_timeout_secs, 600);
        assert!(cfg.upstream.runpod_api_key.is_none());
        assert_eq!(cfg.paths.examples_dir, PathBuf::from("public/examples"));
        assert_eq!(cfg.upstream.endpoints.for_tool(ToolKind::ClothesSwapper), None);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut original = AppConfig::default();
        original.upstream.resource_api_url = Some("https://files.example/sign".to_string());
        original.upstream.endpoints.pbr_map_generator = Some("https://api.example/v2/pbr".to_string());
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let decoded: AppConfig = toml::from_str(
            "[upstream.endpoints]\nclothes_swapper = \"https://api.example/v2/clothes\"\n",
        )
        .expect("deserialize config");
        assert_eq!(
            decoded.upstream.endpoints.for_tool(ToolKind::ClothesSwapper),
            Some("https://api.example/v2/clothes")
        );
        assert_eq!(decoded.server, ServerConfig::default());
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let loaded =
            AppConfig::load_from_path(&temp.path().join("missing.toml")).expect("load config");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn env_overlay_wins_over_file_values() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("RUNPOD_API_KEY", "rp-key"),
            ("RESOURCE_API_URL", "https://files.example/sign"),
            ("RUNPOD_ENDPOINT_WALLPAINT_V2", "https://api.example/v2/wall"),
            ("LIVEKIT_API_SECRET", "lk-secret"),
            ("PORT", "8088"),
            ("RUNPOD_ENDPOINT_CLOTHES", "   "),
        ]);
        let mut cfg = AppConfig::default();
        cfg.upstream.runpod_api_key = Some("from-file".to_string());
        cfg.upstream.endpoints.clothes_swapper = Some("https://file/clothes".to_string());

        cfg.apply_env_with(|key| vars.get(key).map(|value| value.to_string()));

        assert_eq!(cfg.upstream.runpod_api_key.as_deref(), Some("rp-key"));
        assert_eq!(
            cfg.upstream.resource_api_url.as_deref(),
            Some("https://files.example/sign")
        );
        assert_eq!(
            cfg.upstream.endpoints.for_tool(ToolKind::WallPaintingV2),
            Some("https://api.example/v2/wall")
        );
        assert_eq!(
            cfg.upstream.endpoints.for_tool(ToolKind::ClothesSwapper),
            Some("https://file/clothes")
        );
        assert_eq!(cfg.livekit.api_secret.as_deref(), Some("lk-secret"));
        assert_eq!(cfg.server.port, 8088);
    }

    #[test]
    fn blank_settings_count_as_missing() {
        assert_eq!(non_empty(&Some("  ".to_string())), None);
        assert_eq!(non_empty(&Some(" x ".to_string())), Some("x"));
        assert_eq!(non_empty(&None), None);
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        let result = config_path(Path::new("/data"));
        assert_eq!(result, PathBuf::from("/data/config.toml"));
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("nested");
        initialize_data_dir(&dir).expect("initialize data dir");

        assert!(dir.join("config.toml").exists());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg_path = temp.path().join("config.toml");
        let custom_content = "[server]\nport = 9999\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(temp.path()).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn settings_path_is_relative_to_data_dir() {
        let cfg = AppConfig::default();
        assert_eq!(
            cfg.settings_path(Path::new("/data")),
            PathBuf::from("/data/session_settings.json")
        );
    }
}
