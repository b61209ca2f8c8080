use std::env;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Millis;
use crate::intermission::IntermissionPolicy;
use crate::orchestrator::Settings;

pub const VALIDATION_URL_ENV: &str = "PASSKEY_VALIDATION_URL";

const DEFAULT_IP_HASH_SALT: &str = "d2F0Y2hwYXJ0eXNhbHQ";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Endpoint that confirms `username`/`passkey` pairs. Every connection is
    /// refused while unset.
    pub passkey_validation_url: Option<String>,
    pub validation_timeout_ms: Millis,
    pub drift_threshold_ms: Millis,
    pub send_timeout_ms: Millis,
    /// Outbound messages queued per connection.
    pub send_buffer: usize,
    pub ip_hash_salt: String,
    pub intermission: IntermissionPolicy,
}

impl Default for Config {
    fn default() -> Self {
        let settings = Settings::default();
        Config {
            passkey_validation_url: None,
            validation_timeout_ms: 5000,
            drift_threshold_ms: settings.drift_threshold_ms,
            send_timeout_ms: 2000,
            send_buffer: 32,
            ip_hash_salt: DEFAULT_IP_HASH_SALT.to_string(),
            intermission: settings.intermission,
        }
    }
}

impl Config {
    pub fn settings(&self) -> Settings {
        Settings {
            drift_threshold_ms: self.drift_threshold_ms,
            intermission: self.intermission,
        }
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_millis(self.validation_timeout_ms)
    }

    fn apply_env(mut self) -> Self {
        if let Ok(url) = env::var(VALIDATION_URL_ENV) {
            if !url.is_empty() {
                self.passkey_validation_url = Some(url);
            }
        }
        self
    }
}

pub fn load(path: &Path) -> Result<Config, failure::Error> {
    // create a new file if it does not exist
    if !path.exists() {
        let mut file = File::create(path)?;
        let config = toml::from_str::<Config>("")?;
        file.write_all(toml::to_string(&config)?.as_ref())?;
        return Ok(config.apply_env());
    }

    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    Ok(toml::from_str::<Config>(&contents)?.apply_env())
}
