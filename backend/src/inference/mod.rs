pub mod detection_service;
pub mod report_service;

use std::time::Duration;

/// Shared client for both upstream services. Every request is bounded by `timeout`.
pub fn build_http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder().timeout(timeout).build()
}
