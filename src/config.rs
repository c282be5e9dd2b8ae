use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub geoip: GeoIpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Where ciphertext blobs live.
    #[serde(default = "default_blob_dir")]
    pub blob_dir: String,
    /// Where plaintext spools and decrypted scratch copies live, briefly.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfig {
    /// 64 hex chars, decoded to the 32-byte AES-256 master key.
    #[serde(default)]
    pub master_secret: String,
    #[serde(default = "default_max_views")]
    pub default_max_views: i64,
    #[serde(default = "default_age_limit_days")]
    pub default_age_limit_days: i64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeoIpConfig {
    #[serde(default)]
    pub enabled: bool,
    /// ip-api style endpoint; the client IP is appended as a path segment.
    #[serde(default = "default_geoip_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_geoip_timeout")]
    pub timeout_ms: u64,
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    1492
}

fn default_db_path() -> String {
    "data/vaultdrop.db".to_string()
}

fn default_blob_dir() -> String {
    "data/blobs".to_string()
}

fn default_scratch_dir() -> String {
    "data/scratch".to_string()
}

fn default_max_views() -> i64 {
    10
}

fn default_age_limit_days() -> i64 {
    7
}

fn default_sweep_interval() -> u64 {
    86400 // once per day
}

fn default_geoip_endpoint() -> String {
    "http://ip-api.com/json".to_string()
}

fn default_geoip_timeout() -> u64 {
    2000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            blob_dir: default_blob_dir(),
            scratch_dir: default_scratch_dir(),
        }
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            master_secret: String::new(),
            default_max_views: default_max_views(),
            default_age_limit_days: default_age_limit_days(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for GeoIpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_geoip_endpoint(),
            timeout_ms: default_geoip_timeout(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            storage: StorageConfig::default(),
            vault: VaultConfig::default(),
            geoip: GeoIpConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_env_overrides();
        config.ensure_directories()?;
        config.ensure_master_secret()?;
        Ok(config)
    }

    /// Ensure the master secret exists, is well-formed, and is persisted
    fn ensure_master_secret(&mut self) -> anyhow::Result<()> {
        if self.vault.master_secret.is_empty() {
            let secret_path = Path::new("data/.master_secret");

            if secret_path.exists() {
                let secret = fs::read_to_string(secret_path)?;
                self.vault.master_secret = secret.trim().to_string();
                tracing::info!("Loaded persisted master secret from data/.master_secret");
            } else {
                let mut key = [0u8; 32];
                OsRng.fill_bytes(&mut key);
                let secret = hex::encode(key);

                if let Some(parent) = secret_path.parent() {
                    fs::create_dir_all(parent)?;
                }

                fs::write(secret_path, &secret)?;
                self.vault.master_secret = secret;
                tracing::info!("Generated and persisted new master secret to data/.master_secret");
            }
        }

        if self.vault.master_secret.len() != 64
            || hex::decode(&self.vault.master_secret).is_err()
        {
            anyhow::bail!("master secret must be 64 hex characters (32 bytes)");
        }

        Ok(())
    }

    /// Load configuration from conf.ini or config.toml
    fn load_from_file() -> anyhow::Result<Self> {
        let config_paths = ["config.toml", "data/config.toml"];

        for path in config_paths {
            if Path::new(path).exists() {
                let content = fs::read_to_string(path)?;
                let config: Config = toml::from_str(&content)?;
                tracing::info!("Loaded configuration from {}", path);
                return Ok(config);
            }
        }

        tracing::info!("No configuration file found, using defaults");
        Ok(Config::default())
    }

    /// Apply environment variable overrides
    /// Format: VAULT_CONF_<SECTION>_<KEY>
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("VAULT_CONF_SERVER_HOST") {
            self.server.host = val;
        }
        if let Ok(val) = env::var("VAULT_CONF_SERVER_PORT") {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }

        if let Ok(val) = env::var("VAULT_CONF_DATABASE_PATH") {
            self.database.path = val;
        }

        if let Ok(val) = env::var("VAULT_CONF_STORAGE_BLOB_DIR") {
            self.storage.blob_dir = val;
        }
        if let Ok(val) = env::var("VAULT_CONF_STORAGE_SCRATCH_DIR") {
            self.storage.scratch_dir = val;
        }

        if let Ok(val) = env::var("VAULT_CONF_VAULT_MASTER_SECRET") {
            self.vault.master_secret = val;
        }
        if let Ok(val) = env::var("VAULT_CONF_VAULT_DEFAULT_MAX_VIEWS") {
            if let Ok(v) = val.parse() {
                self.vault.default_max_views = v;
            }
        }
        if let Ok(val) = env::var("VAULT_CONF_VAULT_DEFAULT_AGE_LIMIT_DAYS") {
            if let Ok(v) = val.parse() {
                self.vault.default_age_limit_days = v;
            }
        }
        if let Ok(val) = env::var("VAULT_CONF_VAULT_SWEEP_INTERVAL_SECS") {
            if let Ok(v) = val.parse() {
                self.vault.sweep_interval_secs = v;
            }
        }

        if let Ok(val) = env::var("VAULT_CONF_GEOIP_ENABLED") {
            if let Ok(v) = val.parse() {
                self.geoip.enabled = v;
            }
        }
        if let Ok(val) = env::var("VAULT_CONF_GEOIP_ENDPOINT") {
            if !val.trim().is_empty() {
                self.geoip.endpoint = val;
            }
        }
        if let Ok(val) = env::var("VAULT_CONF_GEOIP_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.geoip.timeout_ms = v;
            }
        }
    }

    /// Ensure required directories exist
    fn ensure_directories(&self) -> anyhow::Result<()> {
        if let Some(parent) = Path::new(&self.database.path).parent() {
            fs::create_dir_all(parent)?;
        }

        fs::create_dir_all(&self.storage.blob_dir)?;
        fs::create_dir_all(&self.storage.scratch_dir)?;

        Ok(())
    }
}
