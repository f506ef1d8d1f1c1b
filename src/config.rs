use crate::useragent::loopback::LoopbackOption;
use crate::useragent::registration::{RegisterOption, UserCredential};
use crate::version;
use anyhow::Error;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    /// Path to the TOML configuration; built-in defaults when omitted
    #[clap(long)]
    pub conf: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    pub ua: UseragentConfig,
    pub loopback: Option<LoopbackConfig>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct UseragentConfig {
    /// Signaling server address
    pub server: String,
    pub domain: String,
    pub username: String,
    pub password: Option<String>,
    pub realm: Option<String>,
    pub display_name: Option<String>,
    /// Requested registration expiry in seconds
    pub register_expires: u32,
    /// Upper bound for every transport operation, in seconds
    pub operation_timeout: u64,
    pub playback_sink: String,
    pub useragent: Option<String>,
    /// Connect and register on startup
    pub auto_connect: bool,
}

/// Behavior of the in-process transport used by the shell.
#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct LoopbackConfig {
    /// Seconds until the remote party answers a dialed call
    pub answer_after: Option<u64>,
    /// Password the loopback registrar requires
    pub password: Option<String>,
}

impl Default for UseragentConfig {
    fn default() -> Self {
        Self {
            server: "loopback".to_string(),
            domain: "localhost".to_string(),
            username: "1000".to_string(),
            password: None,
            realm: None,
            display_name: None,
            register_expires: 3600,
            operation_timeout: 10,
            playback_sink: "default".to_string(),
            useragent: None,
            auto_connect: false,
        }
    }
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            answer_after: Some(2),
            password: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            log_file: None,
            ua: UseragentConfig::default(),
            loopback: Some(LoopbackConfig::default()),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }
}

impl From<&UseragentConfig> for RegisterOption {
    fn from(config: &UseragentConfig) -> Self {
        let credential = config.password.as_ref().map(|password| UserCredential {
            username: config.username.clone(),
            password: password.clone(),
            realm: config.realm.clone(),
        });
        RegisterOption {
            server: config.server.clone(),
            domain: config.domain.clone(),
            username: config.username.clone(),
            display_name: config.display_name.clone(),
            credential,
            expires: Some(config.register_expires),
            useragent: Some(
                config
                    .useragent
                    .clone()
                    .unwrap_or_else(version::get_useragent),
            ),
        }
    }
}

impl From<&LoopbackConfig> for LoopbackOption {
    fn from(config: &LoopbackConfig) -> Self {
        LoopbackOption {
            password: config.password.clone(),
            answer_after: config.answer_after.map(Duration::from_secs),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_partial_config() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
log_level = "debug"

[ua]
server = "ws://10.42.0.1:8088/ws"
domain = "10.42.0.1"
username = "1001"
password = "secret"
display_name = "Front Desk"
"#
        )
        .unwrap();

        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.ua.register_expires, 3600);
        assert_eq!(config.ua.operation_timeout, 10);
        assert_eq!(config.ua.playback_sink, "default");
        assert!(!config.ua.auto_connect);

        let option = RegisterOption::from(&config.ua);
        assert_eq!(option.aor(), "sip:1001@10.42.0.1");
        assert_eq!(option.credential.unwrap().password, "secret");
        assert!(option.useragent.unwrap().starts_with("rustphone/"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/rustphone.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/rustphone.toml"));
    }

    #[test]
    fn test_no_password_no_credential() {
        let option = RegisterOption::from(&UseragentConfig::default());
        assert!(option.credential.is_none());
        assert_eq!(option.expires, Some(3600));
    }
}
