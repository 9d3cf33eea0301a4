use thiserror::Error;

pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;
pub const MIN_READ_TIMEOUT_SECS: u64 = 10;
pub const MIN_HEARTBEAT_SECS: u64 = 20;
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("host can not be empty")]
    EmptyHost,
    #[error("invalid port: {0}")]
    InvalidPort(u16),
}

/// Client configuration, validated at build time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub read_timeout_secs: u64,
    pub heartbeat_secs: u64,
    pub write_timeout_secs: u64,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    host: String,
    port: u16,
    read_timeout_secs: u64,
    heartbeat_secs: u64,
    write_timeout_secs: Option<u64>,
}

impl ConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn read_timeout(mut self, secs: u64) -> Self {
        self.read_timeout_secs = secs;
        self
    }

    pub fn heartbeat(mut self, secs: u64) -> Self {
        self.heartbeat_secs = secs;
        self
    }

    pub fn write_timeout(mut self, secs: u64) -> Self {
        self.write_timeout_secs = Some(secs);
        self
    }

    /// Unreasonably small timeouts are replaced by the floors rather than
    /// rejected; a missing host or port is an error.
    pub fn build(self) -> Result<Config, ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        let read_timeout_secs = if self.read_timeout_secs <= MIN_READ_TIMEOUT_SECS {
            DEFAULT_READ_TIMEOUT_SECS
        } else {
            self.read_timeout_secs
        };
        let heartbeat_secs = self.heartbeat_secs.max(MIN_HEARTBEAT_SECS);

        Ok(Config {
            host: self.host,
            port: self.port,
            read_timeout_secs,
            heartbeat_secs,
            write_timeout_secs: self.write_timeout_secs.unwrap_or(DEFAULT_WRITE_TIMEOUT_SECS),
        })
    }
}
