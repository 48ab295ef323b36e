//! # Utilities

use http::uri::Uri;

use crate::{Result, invalid};

/// Normalize a protocol or schema URL for use in CIDs and indexes.
///
/// A scheme-less URL is given an `http://` scheme and any trailing slash is
/// removed, so equivalent spellings hash and index identically.
///
/// # Errors
///
/// Fails with `Error::BadRequest` when the URL cannot be parsed.
pub fn clean_url(url: &str) -> Result<String> {
    let with_scheme = if url.contains("://") {
        url.to_string()
    } else {
        format!("http://{url}")
    };

    let uri = with_scheme
        .parse::<Uri>()
        .map_err(|e| invalid!("invalid URL {url}: {e}"))?;
    if uri.host().is_none() {
        return Err(invalid!("invalid URL {url}: no host"));
    }

    Ok(with_scheme.trim_end_matches('/').to_string())
}

/// Verify a URL is in normalized form.
///
/// # Errors
///
/// Fails with `Error::BadRequest` when the URL is not normalized.
pub fn validate_url(url: &str) -> Result<()> {
    if clean_url(url)? != url {
        return Err(invalid!("URL {url} is not normalized"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize() {
        assert_eq!(clean_url("example.com/").unwrap(), "http://example.com");
        assert_eq!(clean_url("http://example.com").unwrap(), "http://example.com");
        assert_eq!(clean_url("https://example.com/chat/").unwrap(), "https://example.com/chat");
        assert!(clean_url("://").is_err());
    }

    #[test]
    fn validate() {
        assert!(validate_url("http://example.com").is_ok());
        assert!(validate_url("example.com").is_err());
        assert!(validate_url("http://example.com/").is_err());
    }
}
