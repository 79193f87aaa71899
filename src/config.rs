use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const CLUSTER_MANAGER_COUNT: usize = 2;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    #[serde(default)]
    pub metrics_listen: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_accept_invalid_certs")]
    pub accept_invalid_certs: bool,
    #[serde(default = "default_session_idle_timeout_secs")]
    pub session_idle_timeout_secs: u64,
    #[serde(default = "default_session_sweep_interval_secs")]
    pub session_sweep_interval_secs: u64,
    #[serde(default = "default_vi_json_release")]
    pub vi_json_release: String,
    pub brokers: Vec<BrokerConfig>,
    pub cluster_managers: Vec<ClusterManagerConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterManagerConfig {
    pub id: String,
    pub host: String,
    pub cluster: String,
    #[serde(default = "default_cluster_manager_port")]
    pub port: u16,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_listen("listen", &self.listen)?;
        if let Some(metrics_listen) = &self.metrics_listen {
            validate_listen("metrics_listen", metrics_listen)?;
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "request_timeout_ms должно быть > 0".to_string(),
            ));
        }
        if self.session_sweep_interval_secs < 1 {
            return Err(ConfigError::Validation(
                "session_sweep_interval_secs должно быть >= 1".to_string(),
            ));
        }
        if self.vi_json_release.trim().is_empty() {
            return Err(ConfigError::Validation(
                "поле vi_json_release не должно быть пустым".to_string(),
            ));
        }

        validate_brokers(&self.brokers)?;
        validate_cluster_managers(&self.cluster_managers)?;

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// `None` when sessions never expire.
    pub fn session_idle_timeout(&self) -> Option<Duration> {
        (self.session_idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.session_idle_timeout_secs))
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_listen(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Validation(format!("поле {field} обязательно")));
    }
    if SocketAddr::from_str(value).is_err() {
        return Err(ConfigError::Validation(format!(
            "поле {field} должно быть корректным адресом host:port"
        )));
    }
    Ok(())
}

fn validate_brokers(brokers: &[BrokerConfig]) -> Result<(), ConfigError> {
    if brokers.is_empty() {
        return Err(ConfigError::Validation(
            "brokers должен содержать хотя бы один сервер".to_string(),
        ));
    }
    let mut urls = HashSet::new();
    for broker in brokers {
        let url = broker.url.trim();
        if url.is_empty() {
            return Err(ConfigError::Validation(
                "brokers[*].url не должен быть пустым".to_string(),
            ));
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::Validation(format!(
                "brokers '{url}' должен начинаться с http:// или https://"
            )));
        }
        if !urls.insert(url.trim_end_matches('/').to_string()) {
            return Err(ConfigError::Validation(format!(
                "адрес брокера '{url}' должен быть уникальным"
            )));
        }
    }
    Ok(())
}

fn validate_cluster_managers(managers: &[ClusterManagerConfig]) -> Result<(), ConfigError> {
    if managers.len() != CLUSTER_MANAGER_COUNT {
        return Err(ConfigError::Validation(format!(
            "cluster_managers должен содержать ровно {CLUSTER_MANAGER_COUNT} записи, получено {}",
            managers.len()
        )));
    }
    let mut ids = HashSet::new();
    for manager in managers {
        if manager.id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "cluster_managers[*].id не должен быть пустым".to_string(),
            ));
        }
        if !ids.insert(manager.id.clone()) {
            return Err(ConfigError::Validation(format!(
                "id менеджера кластера '{}' должен быть уникальным",
                manager.id
            )));
        }
        if manager.host.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "cluster_managers '{}' host не должен быть пустым",
                manager.id
            )));
        }
        if manager.cluster.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "cluster_managers '{}' cluster не должен быть пустым",
                manager.id
            )));
        }
        if manager.port == 0 {
            return Err(ConfigError::Validation(format!(
                "cluster_managers '{}' port должен быть в диапазоне 1..65535",
                manager.id
            )));
        }
    }
    Ok(())
}

const fn default_request_timeout_ms() -> u64 {
    15_000
}

const fn default_accept_invalid_certs() -> bool {
    true
}

const fn default_session_idle_timeout_secs() -> u64 {
    3600
}

const fn default_session_sweep_interval_secs() -> u64 {
    60
}

fn default_vi_json_release() -> String {
    "8.0.1.0".to_string()
}

const fn default_cluster_manager_port() -> u16 {
    443
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn valid_config() -> Config {
        Config {
            listen: "127.0.0.1:2834".to_string(),
            metrics_listen: None,
            request_timeout_ms: 2_000,
            accept_invalid_certs: true,
            session_idle_timeout_secs: 3600,
            session_sweep_interval_secs: 60,
            vi_json_release: default_vi_json_release(),
            brokers: vec![BrokerConfig {
                url: "https://broker01.lab".to_string(),
            }],
            cluster_managers: vec![
                ClusterManagerConfig {
                    id: "vcenter1".to_string(),
                    host: "vc01.lab".to_string(),
                    cluster: "CLS1".to_string(),
                    port: 443,
                },
                ClusterManagerConfig {
                    id: "vcenter2".to_string(),
                    host: "vc02.lab".to_string(),
                    cluster: "CLS2".to_string(),
                    port: 443,
                },
            ],
        }
    }

    #[test]
    fn example_config_is_valid() {
        let cfg: Config = serde_yaml::from_str(Config::example_yaml())
            .expect("пример конфигурации должен разбираться");
        cfg.validate().expect("пример конфигурации должен быть валидным");
        assert_eq!(cfg.cluster_managers.len(), CLUSTER_MANAGER_COUNT);
    }

    #[test]
    fn exactly_two_cluster_managers_required() {
        let mut cfg = valid_config();
        cfg.cluster_managers.pop();
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn duplicate_broker_urls_rejected() {
        let mut cfg = valid_config();
        cfg.brokers.push(BrokerConfig {
            url: "https://broker01.lab/".to_string(),
        });
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn zero_idle_timeout_disables_expiry() {
        let mut cfg = valid_config();
        cfg.session_idle_timeout_secs = 0;
        cfg.validate().expect("0 отключает истечение сессий");
        assert_eq!(cfg.session_idle_timeout(), None);
    }

    #[test]
    fn zero_request_timeout_rejected() {
        let mut cfg = valid_config();
        cfg.request_timeout_ms = 0;
        assert!(cfg.validate().is_err());
    }
}
