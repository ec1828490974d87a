use url::Url;

use crate::error::{Result, SyncError};

const MAX_IDENTIFIER_LEN: usize = 128;

pub fn normalize_url(input: &str) -> String {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

/// REST root for a server address, tolerating a trailing `/api`.
pub fn base_api(base_url: &str) -> String {
    let trimmed = normalize_url(base_url);
    if trimmed.ends_with("/api") { trimmed } else { format!("{}/api", trimmed) }
}

/// Push endpoint derived from the REST address: `https://host` becomes
/// `wss://host/socket`.
pub fn socket_url(base_url: &str) -> Result<Url> {
    let normalized = normalize_url(base_url);
    let normalized = normalized.trim_end_matches("/api");
    let mut url = Url::parse(normalized).map_err(|e| SyncError::Config(e.to_string()))?;
    let scheme = if url.scheme() == "http" { "ws" } else { "wss" };
    url.set_scheme(scheme)
        .map_err(|_| SyncError::Config(format!("cannot derive socket url from {base_url}")))?;
    let path = format!("{}/socket", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}

/// Placeholders that leak out of loosely typed clients in place of an id.
const PLACEHOLDER_IDS: [&str; 2] = ["undefined", "null"];

/// Accepted identifier format for users, rooms and messages.
pub fn is_valid_identifier(id: &str) -> bool {
    !id.is_empty()
        && !PLACEHOLDER_IDS.contains(&id)
        && id.len() <= MAX_IDENTIFIER_LEN
        && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

pub fn validate_identifier(id: &str) -> Result<&str> {
    if is_valid_identifier(id) {
        Ok(id)
    } else {
        Err(SyncError::InvalidIdentifier(id.to_string()))
    }
}
