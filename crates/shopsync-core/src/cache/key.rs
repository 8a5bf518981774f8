//! Request fingerprints used as cache keys

use std::collections::BTreeMap;

/// Build the cache key for a request target and its query parameters.
///
/// Parameters are emitted sorted by name, so two requests that differ only
/// in parameter order share a key. The target is kept verbatim at the front
/// of the key so TTL classes can match on it.
pub fn fingerprint(target: &str, params: &BTreeMap<String, String>) -> String {
    if params.is_empty() {
        return target.to_string();
    }

    let query = params
        .iter()
        .map(|(name, value)| format!("{}={}", escape(name), escape(value)))
        .collect::<Vec<_>>()
        .join("&");

    format!("{}?{}", target, query)
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            '&' => out.push_str("%26"),
            '=' => out.push_str("%3D"),
            '?' => out.push_str("%3F"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let a = fingerprint("/api/products", &params(&[("page", "2"), ("category", "shoes")]));
        let b = fingerprint("/api/products", &params(&[("category", "shoes"), ("page", "2")]));
        assert_eq!(a, b);
        assert_eq!(a, "/api/products?category=shoes&page=2");
    }

    #[test]
    fn test_fingerprint_without_params() {
        assert_eq!(fingerprint("/api/categories", &BTreeMap::new()), "/api/categories");
    }

    #[test]
    fn test_fingerprint_escapes_separators() {
        let tricky = fingerprint("/api/search", &params(&[("q", "a&b=c")]));
        let plain = fingerprint("/api/search", &params(&[("q", "a"), ("b", "c")]));
        assert_ne!(tricky, plain);
        assert_eq!(tricky, "/api/search?q=a%26b%3Dc");
    }
}
