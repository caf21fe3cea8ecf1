use std::time::Duration;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
    pub cleanup_interval: Duration,
    pub routing: RoutingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9090,
            max_send_queue: 256,
            heartbeat_interval: Duration::from_secs(30),
            client_timeout: Duration::from_secs(90),
            cleanup_interval: Duration::from_secs(60),
            routing: RoutingConfig::default(),
        }
    }
}

/// Knobs for the routing engine itself.
#[derive(Clone, Debug)]
pub struct RoutingConfig {
    /// How long a disconnected visitor may silently reconnect before the
    /// conversation is told they went offline.
    pub visitor_grace: Duration,
    /// Maximum text message length in chars.
    pub max_message_chars: usize,
    /// How many trailing messages a conversation snapshot carries.
    pub snapshot_window: usize,
    /// Preview length for conversation list summaries.
    pub preview_chars: usize,
    /// Accept cap per operator; 0 disables the cap.
    pub max_operator_conversations: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            visitor_grace: Duration::from_secs(30),
            max_message_chars: 4000,
            snapshot_window: 50,
            preview_chars: 100,
            max_operator_conversations: 0,
        }
    }
}
