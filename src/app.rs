use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { listen: "127.0.0.1:8080".into() }
    }
}

/// Evolution API endpoint and key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub endpoint: String,
    pub api_key: String,
    /// Pause between creating an instance and asking it for a QR code.
    pub handshake_delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            handshake_delay_ms: 2000,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneratorConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Upper bound on history entries forwarded to the model.
    pub history_limit: usize,
    pub timeout_secs: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key: String::new(),
            model: "gpt-4o-mini".into(),
            max_tokens: 150,
            temperature: 0.8,
            history_limit: 10,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MaturationConfig {
    pub first_turn_delay_ms: u64,
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    /// Recent lines of the pair handed to the generator as context.
    pub context_turns: usize,
    /// Used when neither the pair nor the prompt library supplies one.
    pub default_prompt: String,
}

impl Default for MaturationConfig {
    fn default() -> Self {
        Self {
            first_turn_delay_ms: 1000,
            min_interval_secs: 10,
            max_interval_secs: 30,
            context_turns: 5,
            default_prompt: "Take part in a natural, friendly and engaging conversation.".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    pub generator: GeneratorConfig,
    pub maturation: MaturationConfig,
    pub storage: StorageConfig,
}

impl AppConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // TOML is the primary format; a legacy JSON file is converted to TOML the first time it is found.
    fn toml_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("MATURADOR_CONFIG") {
            return Some(PathBuf::from(path));
        }
        let base = BaseDirs::new()?;
        Some(base.config_dir().join("maturador.toml"))
    }

    fn legacy_json_path() -> Option<PathBuf> {
        let proj = ProjectDirs::from("com", "example", "ChipMaturador")?;
        Some(proj.config_dir().join("config.json"))
    }

    pub fn default_database_path() -> Option<PathBuf> {
        let proj = ProjectDirs::from("com", "example", "ChipMaturador")?;
        Some(proj.data_dir().join("maturador.sqlite"))
    }

    pub fn load() -> Self {
        let mut config = Self::load_file();
        config.apply_env();
        config
    }

    fn load_file() -> Self {
        if let Some(path) = Self::toml_path() {
            if let Some(config) = Self::load_toml(&path) {
                return config;
            }
        }

        if let Some(legacy) = Self::legacy_json_path() {
            if let Ok(bytes) = fs::read(&legacy) {
                match serde_json::from_slice::<AppConfig>(&bytes) {
                    Ok(config) => {
                        if let Err(e) = config.save() {
                            log::warn!("could not migrate {}: {e}", legacy.display());
                        }
                        return config;
                    }
                    Err(e) => log::warn!("ignoring unreadable {}: {e}", legacy.display()),
                }
            }
        }

        Self::new()
    }

    pub fn load_toml(path: &Path) -> Option<Self> {
        let text = fs::read_to_string(path).ok()?;
        match toml::from_str::<AppConfig>(&text) {
            Ok(config) => Some(config),
            Err(e) => {
                log::warn!("ignoring unreadable {}: {e}", path.display());
                None
            }
        }
    }

    /// Secrets usually arrive through the environment rather than the file.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = get("EVOLUTION_API_ENDPOINT") {
            self.gateway.endpoint = v;
        }
        if let Some(v) = get("EVOLUTION_API_KEY") {
            self.gateway.api_key = v;
        }
        if let Some(v) = get("OPENAI_API_KEY") {
            self.generator.api_key = v;
        }
        if let Some(v) = get("MATURADOR_LISTEN") {
            self.server.listen = v;
        }
    }

    pub fn save(&self) -> std::io::Result<()> {
        match Self::toml_path() {
            Some(path) => self.save_to(&path),
            None => Err(std::io::Error::new(std::io::ErrorKind::NotFound, "No config dir")),
        }
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let toml = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        fs::write(path, toml)
    }

    pub fn database_path(&self) -> Option<PathBuf> {
        self.storage.database.clone().or_else(Self::default_database_path)
    }
}
