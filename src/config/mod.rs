#[derive(Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub data_dir: String,
    pub discord_token: Option<String>,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl AppConfig {
    /// Environment-driven configuration with workable defaults; only the
    /// platform token has no default.
    pub fn from_env() -> Self {
        let host = std::env::var("TICKETSERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = std::env::var("TICKETSERVER_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);
        let data_dir =
            std::env::var("TICKETSERVER_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
        let discord_token = std::env::var("DISCORD_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty());

        Self {
            server: ServerConfig { host, port },
            data_dir,
            discord_token,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
