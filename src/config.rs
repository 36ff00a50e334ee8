use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,

    pub server: ServerConfig,

    pub auth: AuthConfig,

    pub platform: PlatformConfig,

    pub security: SecurityConfig,

    pub bootstrap: BootstrapConfig,

    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub database_path: String,

    pub log_level: String,

    /// Number of tokio worker threads (default: 2)
    /// Set to 0 to use the number of CPU cores
    pub worker_threads: usize,

    /// Maximum database connections (default: 5)
    pub max_db_connections: u32,

    /// Minimum database connections (default: 1)
    pub min_db_connections: u32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            database_path: "sqlite:data/vmcaptain.db".to_string(),
            log_level: "info".to_string(),
            worker_threads: 2,
            max_db_connections: 5,
            min_db_connections: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,

    pub port: u16,

    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            cors_allowed_origins: vec![
                "http://localhost:8080".to_string(),
                "http://127.0.0.1:8080".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC secret used to sign bearer tokens.
    /// When empty a random secret is generated at startup, which invalidates
    /// every issued token on restart.
    #[serde(skip_serializing)]
    pub jwt_secret: String,

    /// Lifetime of a login token in hours.
    pub token_ttl_hours: i64,

    /// Absolute lifetime of a platform session in hours.
    pub session_ttl_hours: i64,

    /// How often expired platform sessions are swept.
    pub sweep_interval_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            token_ttl_hours: 24,
            session_ttl_hours: 24,
            sweep_interval_seconds: 300,
        }
    }
}

/// Defaults used when a connect request omits fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub default_endpoint: Option<String>,

    pub default_username: Option<String>,

    #[serde(skip_serializing)]
    pub default_secret: Option<String>,

    pub insecure_tls: bool,

    /// Timeout for a single HTTP request to the platform.
    pub request_timeout_seconds: u64,

    pub task_poll_initial_ms: u64,

    pub task_poll_max_ms: u64,

    pub task_timeout_seconds: u64,

    /// API release segment of the VI/JSON endpoint (`/sdk/vim25/{release}`).
    pub vim_release: String,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            default_endpoint: None,
            default_username: None,
            default_secret: None,
            insecure_tls: false,
            request_timeout_seconds: 30,
            task_poll_initial_ms: 500,
            task_poll_max_ms: 5_000,
            task_timeout_seconds: 600,
            vim_release: "8.0.1.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Argon2 memory cost in KiB (default: 8192 = 8MB)
    pub argon2_memory_cost_kib: u32,

    /// Argon2 time cost (iterations)
    pub argon2_time_cost: u32,

    /// Argon2 parallelism (default: 1)
    pub argon2_parallelism: u32,

    pub min_secret_length: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            argon2_memory_cost_kib: 8192,
            argon2_time_cost: 3,
            argon2_parallelism: 1,
            min_secret_length: 8,
        }
    }
}

/// Explicit first-run provisioning. Nothing is created unless a secret is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub admin_username: String,

    #[serde(skip_serializing)]
    pub admin_secret: Option<String>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            admin_username: "admin".to_string(),
            admin_secret: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub metrics_enabled: bool,

    pub loki_enabled: bool,

    pub loki_url: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            loki_enabled: false,
            loki_url: "http://localhost:3100".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            platform: PlatformConfig::default(),
            security: SecurityConfig::default(),
            bootstrap: BootstrapConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Config {
    /// Loads `.env`, the first config file found, then environment overrides.
    pub fn load() -> Result<Self> {
        // A missing .env file is the normal case.
        let _ = dotenvy::dotenv();

        let mut config = Self::load_file()?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_file() -> Result<Self> {
        for path in &Self::config_paths() {
            if path.exists() {
                info!("Loading config from: {}", path.display());
                return Self::load_from_path(path);
            }
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Applies overrides from a variable source. Takes a lookup function so
    /// tests do not have to touch the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty("VCENTER_URL") {
            self.platform.default_endpoint = Some(url);
        }
        if let Some(username) = non_empty("VCENTER_USERNAME") {
            self.platform.default_username = Some(username);
        }
        if let Some(secret) = non_empty("VCENTER_PASSWORD") {
            self.platform.default_secret = Some(secret);
        }
        if let Some(flag) = non_empty("VCENTER_IGNORE_SSL") {
            self.platform.insecure_tls = parse_flag(&flag);
        }
        if let Some(db) = non_empty("DATABASE_URL") {
            self.general.database_path = db;
        }
        if let Some(port) = non_empty("PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(secret) = non_empty("VMCAPTAIN_JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Some(secret) = non_empty("VMCAPTAIN_ADMIN_SECRET") {
            self.bootstrap.admin_secret = Some(secret);
        }
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Config saved to: {}", path.display());
        Ok(())
    }

    fn config_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("config.toml")];

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("vmcaptain").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".vmcaptain").join("config.toml"));
        }

        paths
    }

    fn default_config_path() -> PathBuf {
        PathBuf::from("config.toml")
    }

    pub fn create_default_if_missing() -> Result<bool> {
        let path = Self::default_config_path();
        if path.exists() {
            Ok(false)
        } else {
            Self::default().save_to_path(&path)?;
            info!("Created default config file: {}", path.display());
            Ok(true)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.auth.session_ttl_hours <= 0 {
            anyhow::bail!("auth.session_ttl_hours must be > 0");
        }

        if self.auth.token_ttl_hours <= 0 {
            anyhow::bail!("auth.token_ttl_hours must be > 0");
        }

        if self.auth.sweep_interval_seconds == 0 {
            anyhow::bail!("auth.sweep_interval_seconds must be > 0");
        }

        if self.platform.task_poll_initial_ms == 0
            || self.platform.task_poll_max_ms < self.platform.task_poll_initial_ms
        {
            anyhow::bail!("platform task polling must satisfy 0 < initial <= max");
        }

        if self.platform.vim_release.trim().is_empty() {
            anyhow::bail!("platform.vim_release cannot be empty");
        }

        if self.bootstrap.admin_secret.is_some() && self.bootstrap.admin_username.trim().is_empty()
        {
            anyhow::bail!("bootstrap.admin_username cannot be empty when a secret is set");
        }

        Ok(())
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.auth.session_ttl_hours, 24);
        assert_eq!(config.server.port, 5000);
        assert!(config.bootstrap.admin_secret.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization_hides_secrets() {
        let mut config = Config::default();
        config.auth.jwt_secret = "very-secret".to_string();
        config.platform.default_secret = Some("hunter2".to_string());

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[platform]"));
        assert!(toml_str.contains("[auth]"));
        assert!(!toml_str.contains("very-secret"));
        assert!(!toml_str.contains("hunter2"));
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            [general]
            log_level = "debug"

            [platform]
            default_endpoint = "https://vcenter.lab/sdk"
            insecure_tls = true
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(
            config.platform.default_endpoint.as_deref(),
            Some("https://vcenter.lab/sdk")
        );
        assert!(config.platform.insecure_tls);
        assert_eq!(config.platform.vim_release, "8.0.1.0");
        assert_eq!(config.auth.session_ttl_hours, 24);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("VCENTER_URL", "https://vc.example.com"),
            ("VCENTER_USERNAME", "administrator@vsphere.local"),
            ("VCENTER_IGNORE_SSL", "true"),
            ("PORT", "7001"),
            ("VCENTER_PASSWORD", "   "),
        ]);

        let mut config = Config::default();
        config.apply_env_overrides(|k| vars.get(k).map(|v| (*v).to_string()));

        assert_eq!(
            config.platform.default_endpoint.as_deref(),
            Some("https://vc.example.com")
        );
        assert!(config.platform.insecure_tls);
        assert_eq!(config.server.port, 7001);
        assert!(config.platform.default_secret.is_none());
    }

    #[test]
    fn test_validate_rejects_bad_polling() {
        let mut config = Config::default();
        config.platform.task_poll_max_ms = 10;
        config.platform.task_poll_initial_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_vim_release() {
        let mut config = Config::default();
        config.platform.vim_release = " ".to_string();
        assert!(config.validate().is_err());
    }
}
