//! Header matching for the http-header mechanism.
//!
//! Keys are compared in canonical MIME form (`x-user-id` and `X-USER-ID` both
//! canonicalise to `X-User-Id`); values match exactly or against a regex.

use std::collections::HashMap;
use telepresence_model::HeaderMatch;

/// Canonicalises a header key: each hyphen-separated segment starts with an
/// upper-case letter, the rest is lower-case.
pub fn canonical_key(key: &str) -> String {
    key.split('-')
        .map(|segment| {
            let mut chars = segment.chars();

            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Whether `headers` satisfies every matcher.
///
/// Requests that do not match continue to the original container.
pub fn matches_request(matchers: &[HeaderMatch], headers: &HashMap<String, String>) -> bool {
    let canonical: HashMap<String, &String> = headers
        .iter()
        .map(|(key, value)| (canonical_key(key), value))
        .collect();

    matchers.iter().all(|matcher| {
        canonical
            .get(&canonical_key(&matcher.key))
            .is_some_and(|value| matcher.matches_value(value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use telepresence_model::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn canonicalises_mime_keys() {
        assert_eq!(canonical_key("x-user-id"), "X-User-Id");
        assert_eq!(canonical_key("X-USER-ID"), "X-User-Id");
        assert_eq!(canonical_key("accept"), "Accept");
        assert_eq!(canonical_key("content-type"), "Content-Type");
    }

    #[test]
    fn exact_match_requires_all_pairs() {
        let matchers = vec![
            HeaderMatch {
                key: "x-user".to_owned(),
                value: HeaderValue::Exact("alice".to_owned()),
            },
            HeaderMatch {
                key: "x-env".to_owned(),
                value: HeaderValue::Exact("dev".to_owned()),
            },
        ];

        assert!(matches_request(
            &matchers,
            &headers(&[("X-User", "alice"), ("X-Env", "dev"), ("Accept", "*/*")])
        ));
        assert!(!matches_request(
            &matchers,
            &headers(&[("X-User", "alice")])
        ));
        assert!(!matches_request(
            &matchers,
            &headers(&[("X-User", "bob"), ("X-Env", "dev")])
        ));
    }

    #[test]
    fn keys_compare_case_insensitively() {
        let matchers = vec![HeaderMatch {
            key: "X-USER".to_owned(),
            value: HeaderValue::Exact("alice".to_owned()),
        }];

        assert!(matches_request(&matchers, &headers(&[("x-user", "alice")])));
    }

    #[test]
    fn regex_values_match() {
        let matchers = vec![HeaderMatch {
            key: "x-user".to_owned(),
            value: HeaderValue::Regex("^ali.*$".to_owned()),
        }];

        assert!(matches_request(&matchers, &headers(&[("X-User", "alice")])));
        assert!(!matches_request(&matchers, &headers(&[("X-User", "bob")])));
    }
}
