use std::env;
use std::time::Duration;

/// Default public STUN servers used for address discovery. No TURN relay is
/// configured, so clients behind symmetric NATs may fail to connect.
const DEFAULT_STUN_SERVERS: &str = "stun:stun.l.google.com:19302,\
stun:stun1.l.google.com:19302,\
stun:stun2.l.google.com:19302,\
stun:stun3.l.google.com:19302,\
stun:stun4.l.google.com:19302";

#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub stun_servers: Vec<String>,
    pub negotiation_timeout: Duration,
    pub chat_buffer_size: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Config {
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidPort)?,
            stun_servers: env::var("STUN_SERVERS")
                .unwrap_or_else(|_| DEFAULT_STUN_SERVERS.to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            negotiation_timeout: Duration::from_secs(
                env::var("NEGOTIATION_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30),
            ),
            chat_buffer_size: env::var("CHAT_BUFFER_SIZE")
                .unwrap_or_else(|_| "64".to_string())
                .parse()
                .unwrap_or(64),
        })
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_host: "0.0.0.0".to_string(),
            server_port: 3000,
            stun_servers: DEFAULT_STUN_SERVERS
                .split(',')
                .map(|s| s.to_string())
                .collect(),
            negotiation_timeout: Duration::from_secs(30),
            chat_buffer_size: 64,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid server port")]
    InvalidPort,
}
