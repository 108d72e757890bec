use reqwest::Client;
use std::time::Duration;

/// Shared outbound client. Timeouts come from `HTTP_TIMEOUT_SECS` and
/// `HTTP_CONNECT_TIMEOUT_SECS`; provider calls that need longer budgets
/// wrap their futures in their own timeout instead.
pub fn build_client() -> Client {
    let timeout = env_secs("HTTP_TIMEOUT_SECS", 30);
    let connect = env_secs("HTTP_CONNECT_TIMEOUT_SECS", 5);
    Client::builder()
        .user_agent(concat!("listforge-api/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .build()
        .unwrap_or_else(|_| Client::new())
}

fn env_secs(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}
