//! Identifier, URL and clock helpers.

use chrono::Utc;
use url::Url;
use uuid::Uuid;

/// Generate an opaque hex identifier for jobs and policies.
pub fn make_identifier() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Whether `s` is an absolute http(s) URL with a host.
pub fn is_valid_url(s: &str) -> bool {
    match Url::parse(s) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.host_str().is_some(),
        Err(_) => false,
    }
}

/// Current unix epoch in seconds.
pub fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

/// REST link of a job record.
pub fn ref_link(job_id: &str) -> String {
    format!("/api/v1/jobs/{}", job_id)
}
