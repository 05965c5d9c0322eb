//! SIP URI helpers
//!
//! Dial strings typed by users become full SIP URIs here, and the caller
//! identity of an inbound INVITE is pulled out of its headers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Headers consulted for the remote identity, in priority order.
///
/// Intermediary proxies often rewrite the bare From URI, so the asserted
/// identity headers win when present.
pub const IDENTITY_HEADERS: [&str; 3] = ["P-Asserted-Identity", "Remote-Party-ID", "From"];

/// Who is on the other end of a call
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteIdentity {
    pub phone_number: String,
    pub display_name: Option<String>,
}

/// Turn a dial string into a SIP URI on `domain`
///
/// ```rust
/// use webcall_core::uri::make_uri;
///
/// assert_eq!(make_uri("201", "example.com"), "sip:201@example.com");
/// assert_eq!(make_uri("+31 20 123 4567", "example.com"), "sip:+31201234567@example.com");
/// assert_eq!(make_uri("bob@other.org", "example.com"), "sip:bob@other.org");
/// assert_eq!(make_uri("sip:alice@example.com", "example.com"), "sip:alice@example.com");
/// ```
pub fn make_uri(target: &str, domain: &str) -> String {
    let target = target.trim();
    let lower = target.to_ascii_lowercase();
    if lower.starts_with("sip:") || lower.starts_with("sips:") {
        return target.to_string();
    }
    if target.contains('@') {
        return format!("sip:{}", target);
    }

    let user: String = target
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '-' | '(' | ')' | '.'))
        .collect();
    format!("sip:{}@{}", user, domain)
}

/// Canonical form used as a registry key
///
/// Strips angle brackets and URI parameters and lower-cases the scheme and host.
pub fn normalize_uri(uri: &str) -> String {
    let uri = uri.trim().trim_start_matches('<').trim_end_matches('>');
    let uri = uri.split(';').next().unwrap_or(uri);

    let (scheme, rest) = match uri.split_once(':') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("sip") || scheme.eq_ignore_ascii_case("sips") => {
            (scheme.to_ascii_lowercase(), rest)
        }
        _ => ("sip".to_string(), uri),
    };

    match rest.split_once('@') {
        Some((user, host)) => format!("{}:{}@{}", scheme, user, host.to_ascii_lowercase()),
        None => format!("{}:{}", scheme, rest.to_ascii_lowercase()),
    }
}

/// Resolve the remote identity of an inbound request
///
/// Walks [`IDENTITY_HEADERS`] case-insensitively and falls back to the bare
/// `from_uri` reported by the engine.
pub fn remote_identity(headers: &HashMap<String, String>, from_uri: &str) -> RemoteIdentity {
    for name in IDENTITY_HEADERS {
        let value = headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str());

        if let Some(identity) = value.and_then(parse_name_addr) {
            return identity;
        }
    }

    parse_name_addr(from_uri).unwrap_or_else(|| RemoteIdentity {
        phone_number: from_uri.to_string(),
        display_name: None,
    })
}

/// Parse `"Display" <sip:user@host;params>;tag=x` style header values
pub fn parse_name_addr(value: &str) -> Option<RemoteIdentity> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let (display, uri) = match value.find('<') {
        Some(open) => {
            let close = value[open..].find('>').map(|i| open + i)?;
            (value[..open].trim(), &value[open + 1..close])
        }
        None => ("", value.split(';').next().unwrap_or(value)),
    };

    let display_name = display.trim_matches('"').trim();
    let display_name = (!display_name.is_empty()).then(|| display_name.to_string());

    let uri = uri.trim();
    let without_scheme = match uri.split_once(':') {
        Some((scheme, rest))
            if ["sip", "sips", "tel"].iter().any(|s| scheme.eq_ignore_ascii_case(s)) =>
        {
            rest
        }
        _ => uri,
    };
    let user = without_scheme
        .split(|c| c == '@' || c == ';')
        .next()
        .unwrap_or(without_scheme)
        .trim();

    if user.is_empty() {
        return None;
    }

    Some(RemoteIdentity {
        phone_number: user.to_string(),
        display_name,
    })
}

/// True when a `Call-Info` header asks for immediate auto-answer
pub fn is_auto_answer(headers: &HashMap<String, String>) -> bool {
    headers
        .iter()
        .filter(|(key, _)| key.eq_ignore_ascii_case("Call-Info"))
        .any(|(_, value)| {
            value
                .split(';')
                .map(|p| p.trim().to_ascii_lowercase())
                .any(|p| p == "answer-after=0")
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_asserted_identity_wins_over_from() {
        let h = headers(&[
            ("From", "\"Proxy\" <sip:gateway@proxy.example.com>;tag=1"),
            ("Remote-Party-ID", "\"Rpid\" <sip:300@example.com>;party=calling"),
            ("P-Asserted-Identity", "\"Alice\" <sip:+31201234567@example.com;user=phone>"),
        ]);
        let identity = remote_identity(&h, "sip:gateway@proxy.example.com");
        assert_eq!(identity.phone_number, "+31201234567");
        assert_eq!(identity.display_name.as_deref(), Some("Alice"));
    }

    #[test]
    fn test_remote_party_id_before_from() {
        let h = headers(&[
            ("from", "<sip:gateway@proxy.example.com>;tag=1"),
            ("remote-party-id", "\"Bob\" <sip:300@example.com>;party=calling"),
        ]);
        let identity = remote_identity(&h, "sip:gateway@proxy.example.com");
        assert_eq!(identity.phone_number, "300");
        assert_eq!(identity.display_name.as_deref(), Some("Bob"));
    }

    #[test]
    fn test_falls_back_to_bare_uri() {
        let identity = remote_identity(&HashMap::new(), "sip:201@example.com");
        assert_eq!(identity.phone_number, "201");
        assert_eq!(identity.display_name, None);
    }

    #[test]
    fn test_tel_uri() {
        let identity = parse_name_addr("<tel:+442071234567>").unwrap();
        assert_eq!(identity.phone_number, "+442071234567");
    }

    #[test]
    fn test_normalize_uri() {
        assert_eq!(normalize_uri("<sip:201@Example.COM;transport=ws>"), "sip:201@example.com");
        assert_eq!(normalize_uri("201@example.com"), "sip:201@example.com");
    }

    #[test]
    fn test_auto_answer_header() {
        let h = headers(&[("Call-Info", "<sip:example.com>;answer-after=0")]);
        assert!(is_auto_answer(&h));
        assert!(!is_auto_answer(&headers(&[("Call-Info", "<sip:example.com>;answer-after=5")])));
    }
}
