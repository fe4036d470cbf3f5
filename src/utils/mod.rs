//! Utility functions and helpers.

pub mod http;

use url::Url;

/// Resolve a potentially relative URL against a base URL.
pub fn resolve_url(base: &Url, href: &str) -> String {
    base.join(href)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

/// Resolve a URL string against a base URL string.
pub fn resolve(base_url: &str, href: &str) -> Option<String> {
    Url::parse(base_url)
        .ok()
        .map(|base| resolve_url(&base, href))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_url() {
        let base = Url::parse("https://example.com/users/1/feed.xml").unwrap();
        assert_eq!(
            resolve_url(&base, "feed-2.xml"),
            "https://example.com/users/1/feed-2.xml"
        );
        assert_eq!(
            resolve_url(&base, "/root.xml"),
            "https://example.com/root.xml"
        );
        assert_eq!(
            resolve_url(&base, "https://other.com/x"),
            "https://other.com/x"
        );
    }

    #[test]
    fn test_resolve_with_bad_base() {
        assert_eq!(resolve("not a url", "a.xml"), None);
    }
}
