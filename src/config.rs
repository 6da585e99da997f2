use std::env;

/// Default signing secret, kept for compatibility with already-deployed
/// clients. The server logs a warning at startup when running with it.
pub const DEFAULT_SECRET: &str = "your-super-secret-key-change-this-in-production";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub secret: String,
    pub translator_url: String,
    pub heartbeat_interval_seconds: u64,
    pub pair_code_ttl_seconds: u64,
    pub pair_sweep_interval_seconds: u64,
    pub token_ttl_seconds: i64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("SWITCHBOARD_PORT")
                .or_else(|_| env::var("PORT"))
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            secret: env::var("SWITCHBOARD_SECRET")
                .or_else(|_| env::var("JWT_SECRET"))
                .unwrap_or_else(|_| DEFAULT_SECRET.to_string()),
            translator_url: env::var("TRANSLATOR_URL")
                .unwrap_or_else(|_| "http://localhost:5000/translate".to_string()),
            heartbeat_interval_seconds: env::var("HEARTBEAT_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            pair_code_ttl_seconds: env::var("PAIR_CODE_TTL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            pair_sweep_interval_seconds: env::var("PAIR_SWEEP_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            token_ttl_seconds: env::var("TOKEN_TTL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2_592_000), // 30 days
        }
    }

    pub fn uses_default_secret(&self) -> bool {
        self.secret == DEFAULT_SECRET
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            secret: DEFAULT_SECRET.to_string(),
            translator_url: "http://localhost:5000/translate".to_string(),
            heartbeat_interval_seconds: 30,
            pair_code_ttl_seconds: 300,
            pair_sweep_interval_seconds: 60,
            token_ttl_seconds: 2_592_000,
        }
    }
}
