//! Share links: `<origin>/client?session=<sessionId>`.

use url::form_urlencoded;
use url::Url;

/// Route the client page is served under.
pub const CLIENT_ROUTE: &str = "client";

/// Query parameter carrying the session id.
pub const SESSION_PARAM: &str = "session";

/// Build the link a controller shares with the client device.
pub fn build_share_link(origin: &str, session_id: &str) -> String {
    let encoded: String = form_urlencoded::byte_serialize(session_id.as_bytes()).collect();
    format!(
        "{}/{CLIENT_ROUTE}?{SESSION_PARAM}={encoded}",
        origin.trim_end_matches('/')
    )
}

/// Pull the session id out of a share link, or any text containing
/// `session=<id>`.
pub fn extract_session_id(text: &str) -> Option<String> {
    let text = text.trim();

    if let Ok(url) = Url::parse(text) {
        if let Some((_, value)) = url.query_pairs().find(|(k, _)| k == SESSION_PARAM) {
            return non_empty(value.into_owned());
        }
    }

    // Relative links and pasted fragments.
    let marker = format!("{SESSION_PARAM}=");
    let start = text.find(&marker)? + marker.len();
    let rest = &text[start..];
    let end = rest.find(['&', '#']).unwrap_or(rest.len());
    let raw = format!("{marker}{}", &rest[..end]);
    form_urlencoded::parse(raw.as_bytes())
        .next()
        .and_then(|(_, value)| non_empty(value.into_owned()))
}

/// Resolve what a user typed or scanned: either a share link or a bare id.
pub fn parse_session_input(input: &str) -> Option<String> {
    let input = input.trim();
    if input.contains(&format!("{SESSION_PARAM}=")) {
        extract_session_id(input)
    } else {
        non_empty(input.to_string())
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_build_share_link() {
        assert_eq!(
            build_share_link("https://lock.example.com/", "session_1_abc"),
            "https://lock.example.com/client?session=session_1_abc"
        );
    }

    #[test]
    fn test_extract_from_full_link_with_extra_params() {
        assert_eq!(
            extract_session_id("https://x.test/client?foo=1&session=abc&bar=2#top").as_deref(),
            Some("abc")
        );
    }

    #[test]
    fn test_extract_from_relative_link() {
        assert_eq!(
            extract_session_id("/client?session=a%20b&x=1").as_deref(),
            Some("a b")
        );
    }

    #[test]
    fn test_extract_missing_or_empty() {
        assert_eq!(extract_session_id("https://x.test/client"), None);
        assert_eq!(extract_session_id("https://x.test/client?session="), None);
        assert_eq!(extract_session_id("nothing here"), None);
    }

    #[test]
    fn test_parse_session_input() {
        assert_eq!(parse_session_input("  session_9_xyz ").as_deref(), Some("session_9_xyz"));
        assert_eq!(
            parse_session_input("http://h/client?session=session_9_xyz").as_deref(),
            Some("session_9_xyz")
        );
        assert_eq!(parse_session_input("   "), None);
    }

    proptest! {
        #[test]
        fn prop_share_link_round_trip(id in "\\PC{1,40}") {
            let link = build_share_link("https://lock.example.com", &id);
            prop_assert_eq!(extract_session_id(&link), Some(id));
        }
    }
}
