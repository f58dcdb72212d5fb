use std::time::Duration;

/// Wait this long for the safe-disconnect acknowledgement before dropping
/// the connection anyway.
pub const DEFAULT_SAFE_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_ENTER_RETRY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub user_id: String,
    pub character_id: String,
    pub request_timeout: Duration,
    pub safe_disconnect_timeout: Duration,
    /// Minimum delay of the client-objects readiness gate
    pub readiness_delay: Duration,
    /// Retry cadence while the server answers "not ready"; `None` treats that
    /// answer like any other rejection.
    pub enter_retry: Option<Duration>,
    /// Local chat line sent once the client is in game
    pub chat: Option<String>,
    /// Leave safely after this long in game; `None` stays until shut down.
    pub stay_in_game: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:8080".to_string(),
            user_id: "guest".to_string(),
            character_id: "guest_character".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            safe_disconnect_timeout: DEFAULT_SAFE_DISCONNECT_TIMEOUT,
            readiness_delay: Duration::from_secs(1),
            enter_retry: Some(DEFAULT_ENTER_RETRY),
            chat: None,
            stay_in_game: None,
        }
    }
}
