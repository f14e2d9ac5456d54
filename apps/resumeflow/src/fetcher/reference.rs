use std::sync::OnceLock;

use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A job reference that resolved to something fetchable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceId {
    /// Numeric posting id, fetched through the guest posting endpoint.
    Posting(String),
    /// Any other web page, fetched as-is. Holds the normalized absolute URL.
    Page(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("'{0}' does not resolve to a job posting or page")]
pub struct InvalidReference(pub String);

struct Patterns {
    view_path: Regex,
    current_job: Regex,
}

static PATTERNS: OnceLock<Patterns> = OnceLock::new();

fn patterns() -> &'static Patterns {
    PATTERNS.get_or_init(|| Patterns {
        view_path: Regex::new(r"/jobs/view/(\d+)").expect("static pattern"),
        current_job: Regex::new(r"currentJobId=(\d+)").expect("static pattern"),
    })
}

/// Whether `raw` should be treated as a reference to fetch rather than as
/// pasted job-description text.
pub fn looks_like_reference(raw: &str) -> bool {
    let raw = raw.trim();
    if raw.is_empty() || raw.contains(char::is_whitespace) {
        // URLs never contain whitespace; a bare id never does either.
        return raw.starts_with("http://") || raw.starts_with("https://");
    }
    let lower = raw.to_ascii_lowercase();
    lower.starts_with("http://")
        || lower.starts_with("https://")
        || lower.starts_with("www.")
        || lower.contains("linkedin.com")
        || raw.bytes().all(|b| b.is_ascii_digit())
}

impl ResourceId {
    /// Resolves a bare posting id, a `/jobs/view/<id>` URL, a `currentJobId=<id>`
    /// URL or any other absolute web URL. Performs no I/O.
    pub fn resolve(raw: &str) -> Result<Self, InvalidReference> {
        let trimmed = raw.trim();
        let invalid = || InvalidReference(trimmed.to_string());

        if trimmed.is_empty() {
            return Err(invalid());
        }
        if trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(ResourceId::Posting(trimmed.to_string()));
        }
        for pattern in [&patterns().view_path, &patterns().current_job] {
            if let Some(id) = pattern.captures(trimmed).and_then(|c| c.get(1)) {
                return Ok(ResourceId::Posting(id.as_str().to_string()));
            }
        }

        let lower = trimmed.to_ascii_lowercase();
        let absolute = if lower.starts_with("http://") || lower.starts_with("https://") {
            trimmed.to_string()
        } else if lower.starts_with("www.") || lower.contains("linkedin.com") {
            format!("https://{trimmed}")
        } else {
            return Err(invalid());
        };

        let mut url = Url::parse(&absolute).map_err(|_| invalid())?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(invalid());
        }
        url.set_fragment(None);
        Ok(ResourceId::Page(url.into()))
    }

    /// Normalized identity, shared by every spelling of the same reference.
    pub fn canonical(&self) -> String {
        match self {
            ResourceId::Posting(id) => format!("posting:{id}"),
            ResourceId::Page(url) => format!("page:{url}"),
        }
    }

    pub fn fetch_url(&self, base_url: &str) -> String {
        match self {
            ResourceId::Posting(id) => format!(
                "{}/jobs-guest/jobs/api/jobPosting/{id}",
                base_url.trim_end_matches('/')
            ),
            ResourceId::Page(url) => url.clone(),
        }
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical())
    }
}
