use url::Url;

pub fn has_valid_tld(host: &str) -> bool {
    if host.is_empty() || host.len() < 3 || !host.contains('.') {
        return false;
    }

    if let Some(last_dot) = host.rfind('.') {
        if last_dot == host.len() - 1 {
            return false;
        }
        let tld = &host[last_dot + 1..];
        tld.len() >= 2
            && tld
                .chars()
                .all(|c| c.is_ascii_lowercase() && c.is_ascii_alphabetic())
    } else {
        false
    }
}

/// Normalize a site URL into its dataset identifier.
///
/// `https://www.Example.com/shop/` and `example.com/shop` both become
/// `example.com/shop`. Query strings and fragments are dropped. Returns
/// `None` when no host can be recovered.
pub fn normalize_site_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    };

    let url = Url::parse(&with_scheme).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    if host.is_empty() {
        return None;
    }

    let mut normalized = String::from(host);
    if let Some(port) = url.port() {
        normalized.push(':');
        normalized.push_str(&port.to_string());
    }

    let path = url.path().trim_end_matches('/');
    normalized.push_str(path);
    Some(normalized)
}

/// Lowercased host of an absolute or protocol-relative URL, `www.` stripped.
pub fn script_host(src: &str) -> Option<String> {
    let src = src.trim();
    let absolute = if let Some(rest) = src.strip_prefix("//") {
        format!("https://{}", rest)
    } else if src.starts_with("http://") || src.starts_with("https://") {
        src.to_string()
    } else {
        return None;
    };

    let url = Url::parse(&absolute).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    has_valid_tld(&host).then_some(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_scheme_www_and_trailing_slash() {
        assert_eq!(
            normalize_site_url("https://www.Example.com/").as_deref(),
            Some("example.com")
        );
        assert_eq!(
            normalize_site_url("http://example.com/shop/").as_deref(),
            Some("example.com/shop")
        );
        assert_eq!(
            normalize_site_url("example.com").as_deref(),
            Some("example.com")
        );
    }

    #[test]
    fn keeps_non_default_port_and_drops_query() {
        assert_eq!(
            normalize_site_url("https://example.com:8443/a/?q=1#frag").as_deref(),
            Some("example.com:8443/a")
        );
    }

    #[test]
    fn rejects_empty_input() {
        assert_eq!(normalize_site_url("   "), None);
    }

    #[test]
    fn script_host_handles_relative_and_protocol_relative() {
        assert_eq!(
            script_host("//cdn.shopify.com/s/files/app.js").as_deref(),
            Some("cdn.shopify.com")
        );
        assert_eq!(
            script_host("https://www.googletagmanager.com/gtm.js?id=1").as_deref(),
            Some("googletagmanager.com")
        );
        assert_eq!(script_host("/wp-includes/js/jquery.js"), None);
        assert_eq!(script_host("http://localhost/app.js"), None);
    }

    #[test]
    fn valid_tld_rules() {
        assert!(has_valid_tld("example.com"));
        assert!(!has_valid_tld("example."));
        assert!(!has_valid_tld("localhost"));
        assert!(!has_valid_tld("example.c0m"));
    }
}
