//! Url normalisation used for deduplication and domain grouping.

use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{CrawlError, Result};

/// Parse an absolute http(s) address.
pub fn parse_http_url(href: &str) -> Result<Url> {
    let parsed =
        Url::parse(href.trim()).map_err(|e| CrawlError::invalid_url(href, e))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(CrawlError::invalid_url(
                href,
                format!("unsupported scheme {other}"),
            ));
        }
    }
    if parsed.host_str().is_none() {
        return Err(CrawlError::invalid_url(href, "missing host"));
    }
    Ok(parsed)
}

/// Canonical form of an address: query and fragment stripped, scheme and
/// host lowercased, default ports dropped, a leading `www.` removed and
/// trailing slashes trimmed from non-root paths.
pub fn normalize_url(href: &str) -> Result<String> {
    let mut parsed = parse_http_url(href)?;
    parsed.set_query(None);
    parsed.set_fragment(None);

    if let Some(bare) = parsed
        .host_str()
        .and_then(|host| host.strip_prefix("www."))
        .filter(|rest| rest.contains('.'))
        .map(str::to_owned)
    {
        parsed
            .set_host(Some(&bare))
            .map_err(|e| CrawlError::invalid_url(href, e))?;
    }

    let trimmed = parsed.path().trim_end_matches('/').to_owned();
    if !trimmed.is_empty() {
        parsed.set_path(&trimmed);
    }
    Ok(parsed.to_string())
}

/// Hex SHA-256 digest of [`normalize_url`].
pub fn url_hash(href: &str) -> Result<String> {
    let normalized = normalize_url(href)?;
    Ok(hex::encode(Sha256::digest(normalized.as_bytes())))
}

/// Registrable domain ("eTLD+1") of an address. Hosts without a known public
/// suffix, such as IP addresses or `localhost`, are returned as-is.
pub fn registrable_domain(href: &str) -> Result<String> {
    let parsed = parse_http_url(href)?;
    let host = parsed
        .host_str()
        .ok_or_else(|| CrawlError::invalid_url(href, "missing host"))?
        .trim_end_matches('.')
        .to_ascii_lowercase();

    if matches!(parsed.host(), Some(url::Host::Domain(_)))
        && let Some(domain) = psl::domain_str(&host)
    {
        return Ok(domain.to_string());
    }
    Ok(host)
}
