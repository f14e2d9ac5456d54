use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::fetcher::reference::ResourceId;
use crate::llm_client::CompletionRequest;

const FIELD_SEPARATOR: u8 = 0x1f;

/// Deterministic cache key over canonicalized request parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hashes `namespace` and `parts` with a separator that cannot appear in
    /// canonical text, so `("ab", "c")` and `("a", "bc")` never collide.
    pub fn from_parts(namespace: &str, parts: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(namespace.as_bytes());
        for part in parts {
            hasher.update([FIELD_SEPARATOR]);
            hasher.update(part.as_bytes());
        }
        Fingerprint(format!("{namespace}:{:x}", hasher.finalize()))
    }

    /// Key for fetched page content: the normalized identifier only.
    pub fn for_fetch(id: &ResourceId) -> Self {
        Self::from_parts("fetch", &[&id.canonical()])
    }

    /// Key for a completion: prompt plus every sampling parameter.
    pub fn for_completion(request: &CompletionRequest) -> Self {
        let temperature = format!("{:.3}", request.temperature);
        let top_p = format!("{:.3}", request.top_p);
        let max_tokens = request.max_tokens.to_string();
        Self::from_parts(
            "completion",
            &[
                &request.prompt,
                &request.model,
                &temperature,
                &max_tokens,
                &top_p,
            ],
        )
    }

    /// Key for a completion whose output was parsed into a structured record.
    /// Kept apart from raw completions so the two shapes never share a slot.
    pub fn for_structured(request: &CompletionRequest) -> Self {
        let raw = Self::for_completion(request);
        Self::from_parts("structured", &[raw.as_str()])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
