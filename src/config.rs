use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
    pub test_before_acquire: bool,
}

/// Where group, settlement and wallet state lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

/// Which payment gateway adapter to wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayMode {
    Simulated,
    Http,
}

/// Engine tunables; passed in at construction, never read from globals
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sweep_interval_secs: u64,
    pub sweep_batch_size: i64,
    /// Fixed amount taken off a regular group's settlement when shipping is consolidated
    pub consolidation_discount: i64,
    /// How long after failing a group may be reopened as a secondary group
    pub secondary_grace_hours: i64,
    pub gateway_mode: GatewayMode,
    pub gateway_base_url: String,
    pub gateway_merchant_id: String,
    pub gateway_callback_url: String,
    pub catalog_service_url: Option<String>,
    pub audit_log_dir: PathBuf,
    pub storage: StorageBackend,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub log_level: String,
    pub log_format: String,
    pub http_port: Option<u16>,
    pub environment: String,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

impl DatabaseConfig {
    /// Create database config from environment variables
    pub fn from_env() -> Result<Self, String> {
        let url = env::var("DATABASE_URL").map_err(|_| "DATABASE_URL environment variable is required")?;

        let max_connections = env_parse("DATABASE_MAX_CONNECTIONS", 10u32);
        let acquire_timeout_secs = env_parse("DATABASE_ACQUIRE_TIMEOUT_SECS", 30u64);
        let idle_timeout_secs = env_parse("DATABASE_IDLE_TIMEOUT_SECS", 600u64); // 10 minutes
        let max_lifetime_secs = env_parse("DATABASE_MAX_LIFETIME_SECS", 1800u64); // 30 minutes
        let test_before_acquire = env_parse("DATABASE_TEST_BEFORE_ACQUIRE", true);

        if max_connections == 0 {
            return Err("DATABASE_MAX_CONNECTIONS must be greater than 0".to_string());
        }

        if acquire_timeout_secs == 0 {
            return Err("DATABASE_ACQUIRE_TIMEOUT_SECS must be greater than 0".to_string());
        }

        Ok(Self {
            url,
            max_connections,
            acquire_timeout_secs,
            idle_timeout_secs,
            max_lifetime_secs,
            test_before_acquire,
        })
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/group_buy".to_string(),
            max_connections: 10,
            acquire_timeout_secs: 30,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
            test_before_acquire: true,
        }
    }
}

impl StorageBackend {
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "postgres" => Ok(StorageBackend::Postgres),
            "memory" => Ok(StorageBackend::Memory),
            _ => Err(format!("Invalid STORAGE: {}. Must be one of: postgres, memory", s)),
        }
    }
}

impl GatewayMode {
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "simulated" => Ok(GatewayMode::Simulated),
            "http" => Ok(GatewayMode::Http),
            _ => Err(format!("Invalid GATEWAY_MODE: {}. Must be one of: simulated, http", s)),
        }
    }
}

impl EngineConfig {
    /// Create engine config from environment variables
    pub fn from_env() -> Result<Self, String> {
        let defaults = Self::default();

        let sweep_interval_secs = env_parse("SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs);
        let sweep_batch_size = env_parse("SWEEP_BATCH_SIZE", defaults.sweep_batch_size);
        let consolidation_discount = env_parse("CONSOLIDATION_DISCOUNT", defaults.consolidation_discount);
        let secondary_grace_hours = env_parse("SECONDARY_GRACE_HOURS", defaults.secondary_grace_hours);

        let gateway_mode = match env::var("GATEWAY_MODE") {
            Ok(mode) => GatewayMode::from_str(&mode)?,
            Err(_) => defaults.gateway_mode,
        };
        let storage = match env::var("STORAGE") {
            Ok(storage) => StorageBackend::from_str(&storage)?,
            Err(_) => defaults.storage,
        };

        let gateway_base_url = env::var("GATEWAY_BASE_URL").unwrap_or(defaults.gateway_base_url);
        let gateway_merchant_id = env::var("GATEWAY_MERCHANT_ID").unwrap_or(defaults.gateway_merchant_id);
        let gateway_callback_url = env::var("GATEWAY_CALLBACK_URL").unwrap_or(defaults.gateway_callback_url);
        let catalog_service_url = env::var("CATALOG_SERVICE_URL").ok().filter(|s| !s.is_empty());
        let audit_log_dir = env::var("AUDIT_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.audit_log_dir);

        let config = Self {
            sweep_interval_secs,
            sweep_batch_size,
            consolidation_discount,
            secondary_grace_hours,
            gateway_mode,
            gateway_base_url,
            gateway_merchant_id,
            gateway_callback_url,
            catalog_service_url,
            audit_log_dir,
            storage,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.sweep_interval_secs == 0 {
            return Err("SWEEP_INTERVAL_SECS must be greater than 0".to_string());
        }
        if self.sweep_batch_size <= 0 {
            return Err("SWEEP_BATCH_SIZE must be greater than 0".to_string());
        }
        if self.consolidation_discount < 0 {
            return Err("CONSOLIDATION_DISCOUNT must not be negative".to_string());
        }
        if self.secondary_grace_hours < 0 {
            return Err("SECONDARY_GRACE_HOURS must not be negative".to_string());
        }
        if self.gateway_mode == GatewayMode::Http && self.gateway_merchant_id.is_empty() {
            return Err("GATEWAY_MERCHANT_ID is required when GATEWAY_MODE=http".to_string());
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn secondary_grace(&self) -> chrono::Duration {
        chrono::Duration::hours(self.secondary_grace_hours)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 120,
            sweep_batch_size: 100,
            consolidation_discount: 20_000,
            secondary_grace_hours: 24,
            gateway_mode: GatewayMode::Simulated,
            gateway_base_url: "http://localhost:9090".to_string(),
            gateway_merchant_id: String::new(),
            gateway_callback_url: "http://localhost:8080/payments/callback".to_string(),
            catalog_service_url: None,
            audit_log_dir: PathBuf::from("./logs"),
            storage: StorageBackend::Postgres,
        }
    }
}

impl AppConfig {
    /// Create application config from environment variables
    pub fn from_env() -> Result<Self, String> {
        let engine = EngineConfig::from_env()?;

        // An in-memory deployment has no database to configure
        let database = match engine.storage {
            StorageBackend::Postgres => DatabaseConfig::from_env()?,
            StorageBackend::Memory => DatabaseConfig::default(),
        };

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let http_port = env::var("HTTP_PORT").ok().and_then(|s| s.parse::<u16>().ok());
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
        let log_format = env::var("LOG_FORMAT").unwrap_or_else(|_| {
            let default = if environment.eq_ignore_ascii_case("production") { "json" } else { "pretty" };
            default.to_string()
        });

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid LOG_LEVEL: {}. Must be one of: {:?}",
                log_level, valid_log_levels
            ));
        }

        let valid_log_formats = ["pretty", "json"];
        if !valid_log_formats.contains(&log_format.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid LOG_FORMAT: {}. Must be one of: {:?}",
                log_format, valid_log_formats
            ));
        }

        let valid_environments = ["development", "staging", "production"];
        if !valid_environments.contains(&environment.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid ENVIRONMENT: {}. Must be one of: {:?}",
                environment, valid_environments
            ));
        }

        if environment.eq_ignore_ascii_case("production") && engine.gateway_mode == GatewayMode::Simulated {
            return Err("GATEWAY_MODE=simulated is not allowed in production".to_string());
        }

        Ok(Self {
            database,
            engine,
            log_level: log_level.to_lowercase(),
            log_format: log_format.to_lowercase(),
            http_port,
            environment: environment.to_lowercase(),
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }

    /// LOG_FORMAT, or JSON when unset in production
    pub fn json_logs(&self) -> bool {
        self.log_format == "json"
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            engine: EngineConfig::default(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            http_port: None,
            environment: "development".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_config_default() {
        let config = DatabaseConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.acquire_timeout_secs, 30);
    }

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();
        assert!(config.is_development());
        assert!(!config.is_production());
        assert!(!config.json_logs());
    }

    #[test]
    fn test_engine_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.sweep_interval(), Duration::from_secs(120));
        assert_eq!(config.secondary_grace(), chrono::Duration::hours(24));
        assert_eq!(config.gateway_mode, GatewayMode::Simulated);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_engine_validation() {
        let mut config = EngineConfig::default();
        config.consolidation_discount = -1;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.gateway_mode = GatewayMode::Http;
        assert!(config.validate().is_err());
        config.gateway_merchant_id = "merchant-1".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(StorageBackend::from_str("MEMORY"), Ok(StorageBackend::Memory));
        assert!(StorageBackend::from_str("redis").is_err());
        assert_eq!(GatewayMode::from_str("http"), Ok(GatewayMode::Http));
        assert!(GatewayMode::from_str("mock").is_err());
    }
}
