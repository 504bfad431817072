use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Management API: device create, file upload.
    pub api_base_url: String,
    /// Device access API: online, property and pack posts.
    pub device_api_base_url: String,
    pub product_id: String,
    pub product_access_key: String,
    pub user_id: String,
    pub user_access_key: String,
    pub device_desc: String,
    pub default_longitude: f64,
    pub default_latitude: f64,
    pub mac_address: Option<String>,
    pub storage_path: PathBuf,
    pub process_interval_ms: u64,
    #[serde(default)]
    pub activation: ActivationConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ActivationConfig {
    pub ap_ssid: String,
    pub ap_password: String,
    pub ap_channel: u8,
    pub ap_max_clients: u8,
    pub ap_gateway: String,
    pub http_bind: String,
    pub http_port: u16,
    pub drain_in_flight_ms: u64,
    pub drain_server_ms: u64,
    pub drain_wifi_ms: u64,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        ActivationConfig {
            ap_ssid: "ExDebug_Setup".to_string(),
            ap_password: "12345678".to_string(),
            ap_channel: 1,
            ap_max_clients: 4,
            ap_gateway: "192.168.4.1".to_string(),
            http_bind: "0.0.0.0".to_string(),
            http_port: 80,
            drain_in_flight_ms: 1000,
            drain_server_ms: 4000,
            drain_wifi_ms: 2500,
        }
    }
}

impl ActivationConfig {
    pub fn drain_in_flight(&self) -> Duration {
        Duration::from_millis(self.drain_in_flight_ms)
    }

    pub fn drain_server(&self) -> Duration {
        Duration::from_millis(self.drain_server_ms)
    }

    pub fn drain_wifi(&self) -> Duration {
        Duration::from_millis(self.drain_wifi_ms)
    }

    /// No drain delays, for tests.
    pub fn without_drain(mut self) -> Self {
        self.drain_in_flight_ms = 0;
        self.drain_server_ms = 0;
        self.drain_wifi_ms = 0;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_base_url: "https://iot-api.heclouds.com".to_string(),
            device_api_base_url: "https://open.iot.10086.cn".to_string(),
            product_id: "FCwDzD6VU0".to_string(),
            product_access_key: String::new(),
            user_id: String::new(),
            user_access_key: String::new(),
            device_desc: "ESP32-P4 ExDebugTool Device".to_string(),
            default_longitude: 116.397,
            default_latitude: 39.916,
            mac_address: None,
            storage_path: PathBuf::from("./cloud_state.db"),
            process_interval_ms: 1000,
            activation: ActivationConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();
        let activation_defaults = ActivationConfig::default();

        let activation = ActivationConfig {
            ap_ssid: env::var("ACTIVATION_AP_SSID").unwrap_or(activation_defaults.ap_ssid),
            ap_password: env::var("ACTIVATION_AP_PASSWORD").unwrap_or(activation_defaults.ap_password),
            ap_channel: get_env_var("ACTIVATION_AP_CHANNEL", activation_defaults.ap_channel),
            ap_max_clients: get_env_var("ACTIVATION_AP_MAX_CLIENTS", activation_defaults.ap_max_clients),
            ap_gateway: env::var("ACTIVATION_AP_GATEWAY").unwrap_or(activation_defaults.ap_gateway),
            http_bind: env::var("ACTIVATION_HTTP_BIND").unwrap_or(activation_defaults.http_bind),
            http_port: get_env_var("ACTIVATION_HTTP_PORT", activation_defaults.http_port),
            drain_in_flight_ms: get_env_var_u64("ACTIVATION_DRAIN_IN_FLIGHT_MS", activation_defaults.drain_in_flight_ms),
            drain_server_ms: get_env_var_u64("ACTIVATION_DRAIN_SERVER_MS", activation_defaults.drain_server_ms),
            drain_wifi_ms: get_env_var_u64("ACTIVATION_DRAIN_WIFI_MS", activation_defaults.drain_wifi_ms),
        };

        Ok(Config {
            api_base_url: env::var("ONENET_API_BASE_URL").unwrap_or(defaults.api_base_url),
            device_api_base_url: env::var("ONENET_DEVICE_API_BASE_URL").unwrap_or(defaults.device_api_base_url),
            product_id: env::var("ONENET_PRODUCT_ID").unwrap_or(defaults.product_id),
            product_access_key: env::var("ONENET_PRODUCT_ACCESS_KEY").unwrap_or_default(),
            user_id: env::var("ONENET_USER_ID").unwrap_or_default(),
            user_access_key: env::var("ONENET_USER_ACCESS_KEY").unwrap_or_default(),
            device_desc: env::var("DEVICE_DESC").unwrap_or(defaults.device_desc),
            default_longitude: get_env_var("DEFAULT_LONGITUDE", defaults.default_longitude),
            default_latitude: get_env_var("DEFAULT_LATITUDE", defaults.default_latitude),
            mac_address: env::var("MAC_ADDRESS").ok(),
            storage_path: env::var("STORAGE_PATH").map(PathBuf::from).unwrap_or(defaults.storage_path),
            process_interval_ms: get_env_var_u64("PROCESS_INTERVAL_MS", defaults.process_interval_ms),
            activation,
        })
    }

    fn get_config_file_path() -> PathBuf {
        let config_dir = env::var("CONFIG_DIR").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(config_dir).join("cloud_config.json")
    }

    pub fn load_from_file() -> Result<Self> {
        Self::load_from_path(&Self::get_config_file_path())
    }

    pub fn load_from_path(path: &std::path::Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config = serde_json::from_str(&contents)?;
        Ok(config)
    }

    pub fn save_to_file(&self) -> Result<()> {
        self.save_to_path(&Self::get_config_file_path())
    }

    pub fn save_to_path(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        let mut file = fs::File::create(path)?;
        file.write_all(contents.as_bytes())?;
        Ok(())
    }
}

fn get_env_var_u64(key: &str, default: u64) -> u64 {
    get_env_var(key, default)
}

fn get_env_var<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_firmware_constants() {
        let config = Config::default();
        assert_eq!(config.activation.ap_ssid, "ExDebug_Setup");
        assert_eq!(config.activation.ap_max_clients, 4);
        assert_eq!(config.activation.drain_server(), Duration::from_secs(4));
        assert_eq!(config.process_interval_ms, 1000);
    }

    #[test]
    fn file_round_trip_fills_missing_activation_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cloud_config.json");
        let mut config = Config::default();
        config.user_id = "420568".to_string();
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.user_id, "420568");

        let mut raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        raw.as_object_mut().unwrap().remove("activation");
        fs::write(&path, raw.to_string()).unwrap();
        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.activation.http_port, 80);
    }

    #[test]
    fn drain_can_be_disabled() {
        let a = ActivationConfig::default().without_drain();
        assert_eq!(a.drain_in_flight(), Duration::ZERO);
        assert_eq!(a.drain_wifi(), Duration::ZERO);
    }
}
