//! Cache key derivation
//!
//! Keys have the shape `METHOD:/normalized/path[?sorted&query][|header=value...]`.
//! Two requests that differ only in slash noise, query parameter order or
//! header-name case map to the same key.

use crate::http::request::Request;

/// Derives the cache key for `request`.
///
/// Only the headers listed in `vary_headers` contribute, matched ignoring
/// case; a listed header that is absent contributes an empty value so that
/// "absent" and "present" never share a key. Values are escaped, so `|`
/// and `=` inside a value never read as separators.
///
/// ```
/// # use sentinel_edge::cache::cache_key;
/// # use sentinel_edge::http::request::{Method, RequestBuilder};
/// let req = RequestBuilder::new().method(Method::GET).path("//ping/").build().unwrap();
/// assert_eq!(cache_key(&req, &[]), "GET:/ping");
/// ```
pub fn cache_key(request: &Request, vary_headers: &[String]) -> String {
    let mut key = format!("{}:{}", request.method, normalize_path(request.path_only()));

    if let Some(query) = request.query().map(normalize_query).filter(|q| !q.is_empty()) {
        key.push('?');
        key.push_str(&query);
    }

    let mut vary: Vec<String> = vary_headers.iter().map(|h| h.to_ascii_lowercase()).collect();
    vary.sort();
    vary.dedup();
    for name in vary {
        let value = request.header(&name).unwrap_or("");
        key.push('|');
        key.push_str(&name);
        key.push('=');
        key.push_str(&escape_vary_value(value));
    }

    key
}

/// Percent-escapes the key separators so a header value cannot forge
/// another `|name=value` pair.
fn escape_vary_value(value: &str) -> String {
    value
        .replace('%', "%25")
        .replace('|', "%7C")
        .replace('=', "%3D")
}

/// Collapses repeated slashes, resolves `.` and `..` segments and drops a
/// trailing slash. The result always starts with `/`.
pub fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    format!("/{}", segments.join("/"))
}

/// Sorts `&`-separated parameters and drops empty ones. Parameter order
/// within a repeated name is part of the sort, so `a=2&a=1` and `a=1&a=2`
/// share a key.
pub fn normalize_query(query: &str) -> String {
    let mut params: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
    params.sort_unstable();
    params.join("&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::{Method, RequestBuilder};

    fn get(path: &str) -> RequestBuilder {
        RequestBuilder::new().method(Method::GET).path(path)
    }

    #[test]
    fn normalizes_path_noise() {
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/a//b/./c/"), "/a/b/c");
        assert_eq!(normalize_path("/a/b/../c"), "/a/c");
        assert_eq!(normalize_path("/../../a"), "/a");
    }

    #[test]
    fn query_order_does_not_matter() {
        let a = get("/items?b=2&a=1").build().unwrap();
        let b = get("/items?a=1&b=2&").build().unwrap();
        assert_eq!(cache_key(&a, &[]), cache_key(&b, &[]));
        assert_eq!(cache_key(&a, &[]), "GET:/items?a=1&b=2");
    }

    #[test]
    fn empty_query_is_ignored() {
        let req = get("/items?").build().unwrap();
        assert_eq!(cache_key(&req, &[]), "GET:/items");
    }

    #[test]
    fn method_is_part_of_the_key() {
        let get_req = get("/x").build().unwrap();
        let head_req = RequestBuilder::new()
            .method(Method::HEAD)
            .path("/x")
            .build()
            .unwrap();
        assert_ne!(cache_key(&get_req, &[]), cache_key(&head_req, &[]));
    }

    #[test]
    fn vary_headers_are_case_insensitive_and_sorted() {
        let req = get("/x")
            .header("accept-language", "fr")
            .header("Accept", "text/html")
            .build()
            .unwrap();
        let vary = vec!["Accept-Language".to_string(), "accept".to_string()];
        assert_eq!(
            cache_key(&req, &vary),
            "GET:/x|accept=text/html|accept-language=fr"
        );
    }

    #[test]
    fn absent_vary_header_differs_from_present() {
        let vary = vec!["Accept".to_string()];
        let without = get("/x").build().unwrap();
        let with = get("/x").header("Accept", "a").build().unwrap();
        assert_ne!(cache_key(&without, &vary), cache_key(&with, &vary));
    }

    #[test]
    fn vary_values_cannot_forge_separators() {
        let vary = vec!["a".to_string(), "b".to_string()];
        let split = get("/x").header("a", "x|b=").header("b", "y").build().unwrap();
        let forged = get("/x").header("a", "x").header("b", "|b=y").build().unwrap();

        assert_ne!(cache_key(&split, &vary), cache_key(&forged, &vary));
        assert_eq!(cache_key(&split, &vary), "GET:/x|a=x%7Cb%3D|b=y");
    }

    #[test]
    fn unlisted_headers_are_ignored() {
        let a = get("/x").header("User-Agent", "one").build().unwrap();
        let b = get("/x").header("User-Agent", "two").build().unwrap();
        assert_eq!(cache_key(&a, &[]), cache_key(&b, &[]));
    }
}
