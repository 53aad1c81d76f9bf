use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Query parameters that only carry campaign tracking and never change the
/// resource a link points to.
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "mc_cid", "mc_eid", "ref"];

/// Errors returned when a feed URL is rejected.
#[derive(Error, Debug)]
pub enum LinkError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL points to a private/internal IP address.
    #[error("Private IP address not allowed: {0}")]
    PrivateIp(String),
    /// The URL points to localhost.
    #[error("Localhost not allowed")]
    Localhost,
}

/// Canonicalizes a link so that trivially different spellings of the same
/// resource compare equal.
///
/// Articles and feeds are identified solely by this string. The rules:
///
/// - `http` and `https` are the same scheme (normalized to `https`)
/// - the host is lowercased and a leading `www.` is removed
/// - fragments, default ports and tracking parameters (`utm_*`, `fbclid`,
///   `gclid`, ...) are dropped; the remaining query pairs are sorted
/// - a trailing `/` is removed from non-root paths
///
/// Input that does not parse as an absolute URL falls back to its trimmed,
/// lowercased text. Normalization is idempotent.
///
/// # Examples
///
/// ```
/// use gleaner::util::normalize_link;
///
/// assert_eq!(
///     normalize_link("HTTP://WWW.Example.com:80/a/b/?b=2&a=1&utm_medium=feed"),
///     "https://example.com/a/b?a=1&b=2"
/// );
/// assert_eq!(normalize_link("  Not A Url  "), "not a url");
/// ```
pub fn normalize_link(raw: &str) -> String {
    let trimmed = raw.trim();
    let mut url = match Url::parse(trimmed) {
        Ok(url) => url,
        Err(_) => return trimmed.to_lowercase(),
    };

    if !matches!(url.scheme(), "http" | "https") {
        url.set_fragment(None);
        return url.to_string();
    }

    let port = url.port();
    // Both schemes are "special", so switching between them cannot fail.
    let _ = url.set_scheme("https");
    if matches!(port, Some(80) | Some(443)) {
        let _ = url.set_port(None);
    }

    if let Some(host) = url.host_str() {
        // All leading `www.` labels go so a second pass finds nothing to strip;
        // a bare `www.<tld>` is left alone
        let stripped = host.trim_start_matches("www.");
        if stripped != host && stripped.contains('.') {
            let stripped = stripped.to_owned();
            if url.set_host(Some(&stripped)).is_err() {
                tracing::debug!(host = %stripped, "Could not strip www. prefix");
            }
        }
    }

    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        url.query_pairs_mut().clear().extend_pairs(pairs.iter());
    }

    let path = url.path();
    if path.len() > 1 && path.ends_with('/') {
        let trimmed_path = path.trim_end_matches('/').to_owned();
        let trimmed_path = if trimmed_path.is_empty() {
            "/".to_owned()
        } else {
            trimmed_path
        };
        url.set_path(&trimmed_path);
    }

    url.to_string()
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

/// Validates a URL string before subscribing to it.
///
/// Rejects non-HTTP(S) schemes, localhost and private IP ranges so a
/// subscription can never be used to probe the local network.
pub fn validate_feed_url(url_str: &str) -> Result<Url, LinkError> {
    let url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(LinkError::UnsupportedScheme(scheme.to_owned())),
    }

    if let Some(host) = url.host_str() {
        if host.eq_ignore_ascii_case("localhost") {
            return Err(LinkError::Localhost);
        }

        let host_for_parse = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if let Ok(ip) = host_for_parse.parse::<IpAddr>() {
            // ::ffff:a.b.c.d reaches the IPv4 address a.b.c.d
            let ip = match ip {
                IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
                v4 => v4,
            };
            if ip.is_loopback() {
                return Err(LinkError::Localhost);
            }
            if is_private_ip(&ip) {
                return Err(LinkError::PrivateIp(ip.to_string()));
            }
        }
    }

    Ok(url)
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private() || ipv4.is_link_local() || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            if ipv6.is_unspecified() {
                return true;
            }
            let first = ipv6.segments()[0];
            // fc00::/7 unique local, fe80::/10 link local
            (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_scheme_and_www_are_equivalent() {
        assert_eq!(
            normalize_link("http://www.example.com/post"),
            normalize_link("https://example.com/post")
        );
    }

    #[test]
    fn test_repeated_www_is_stripped_in_one_pass() {
        let once = normalize_link("https://www.www.example.com/post");
        assert_eq!(once, "https://example.com/post");
        assert_eq!(normalize_link(&once), once);

        assert_eq!(normalize_link("https://www.com/"), "https://www.com/");
    }

    #[test]
    fn test_fragment_and_trailing_slash_dropped() {
        assert_eq!(
            normalize_link("https://example.com/post/#comments"),
            "https://example.com/post"
        );
    }

    #[test]
    fn test_root_path_kept() {
        assert_eq!(normalize_link("https://Example.com"), "https://example.com/");
        assert_eq!(normalize_link("https://example.com/"), "https://example.com/");
    }

    #[test]
    fn test_tracking_params_removed_and_rest_sorted() {
        assert_eq!(
            normalize_link("https://example.com/p?z=1&utm_source=rss&a=2&fbclid=xyz"),
            "https://example.com/p?a=2&z=1"
        );
        assert_eq!(
            normalize_link("https://example.com/p?utm_campaign=x"),
            "https://example.com/p"
        );
    }

    #[test]
    fn test_non_default_port_kept() {
        assert_eq!(
            normalize_link("http://example.com:8080/feed"),
            "https://example.com:8080/feed"
        );
    }

    #[test]
    fn test_unparseable_falls_back_to_lowercase() {
        assert_eq!(normalize_link("  /Relative/Path "), "/relative/path");
    }

    #[test]
    fn test_other_schemes_untouched_except_fragment() {
        assert_eq!(
            normalize_link("tag:example.com,2024:Post-1#x"),
            "tag:example.com,2024:Post-1"
        );
    }

    #[test]
    fn test_validate_accepts_public_urls() {
        assert!(validate_feed_url("https://example.com/feed.xml").is_ok());
        assert!(validate_feed_url("http://news.example.org").is_ok());
    }

    #[test]
    fn test_validate_rejects_schemes_and_local_targets() {
        assert!(matches!(
            validate_feed_url("file:///etc/passwd"),
            Err(LinkError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            validate_feed_url("http://localhost/feed"),
            Err(LinkError::Localhost)
        ));
        assert!(matches!(
            validate_feed_url("http://[::1]/feed"),
            Err(LinkError::Localhost)
        ));
        assert!(matches!(
            validate_feed_url("http://192.168.1.1:8080/feed"),
            Err(LinkError::PrivateIp(_))
        ));
        assert!(validate_feed_url("http://[fe80::1]/feed").is_err());
        assert!(validate_feed_url("http://0.0.0.0/feed").is_err());

        // IPv4-mapped IPv6 addresses get the IPv4 rules
        assert!(matches!(
            validate_feed_url("http://[::ffff:127.0.0.1]/feed"),
            Err(LinkError::Localhost)
        ));
        assert!(matches!(
            validate_feed_url("http://[::ffff:10.0.0.1]/feed"),
            Err(LinkError::PrivateIp(_))
        ));
        assert!(matches!(
            validate_feed_url("http://[::ffff:169.254.169.254]/feed"),
            Err(LinkError::PrivateIp(_))
        ));
        assert!(validate_feed_url("http://[::ffff:93.184.216.34]/feed").is_ok());
    }

    proptest! {
        #[test]
        fn prop_normalize_is_idempotent(
            host in "[a-zA-Z]{1,10}\\.(com|org)",
            path in "(/[a-zA-Z0-9]{0,6}){0,3}/?",
            query in "([a-z]{1,4}=[a-z0-9]{0,4}&?){0,3}",
            www in any::<bool>(),
        ) {
            let prefix = if www { "www." } else { "" };
            let raw = format!("http://{prefix}{host}{path}?{query}");
            let once = normalize_link(&raw);
            prop_assert_eq!(normalize_link(&once), once.clone());
        }
    }
}
