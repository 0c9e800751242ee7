//! Stateless link and length rules.

use lazy_regex::lazy_regex;
use lazy_regex::Lazy;
use regex::Regex;

static URL_LIKE: Lazy<Regex> = lazy_regex!(r"(?i)(https?://|www\.)\S+");

static BARE_DOMAIN: Lazy<Regex> = lazy_regex!(
    r"(?i)[a-z0-9-]+\.(com|net|org|io|co|app|xyz|me|info|biz|tv|online|site|tech|store|shop|live|club|fun|gg|cc)\b"
);

static INVITE_LINK: Lazy<Regex> = lazy_regex!(
    r"(?i)(t\.me|wa\.me|wa\.link|chat\.whatsapp\.com|whatsapp\.com/channel|api\.whatsapp\.com|web\.whatsapp\.com)/\S+"
);

static SHORTENER: Lazy<Regex> =
    lazy_regex!(r"(?i)(bit\.ly|tinyurl\.com|cutt\.ly|shorturl\.at|s\.id)/\S+");

static SCHEME_LINK: Lazy<Regex> = lazy_regex!(r"(?i)whatsapp://\S+");

/// Whether the text contains a URL, a known shortener or an invite link.
///
/// Empty text never matches.
#[must_use]
pub fn contains_link(text: &str) -> bool {
    if text.trim().is_empty() {
        return false;
    }
    [&URL_LIKE, &BARE_DOMAIN, &INVITE_LINK, &SHORTENER, &SCHEME_LINK]
        .iter()
        .any(|pattern| pattern.is_match(text))
}

/// Whether the text is longer than `max_chars` characters.
#[must_use]
pub fn exceeds_length(text: &str, max_chars: usize) -> bool {
    // Stop counting once past the threshold
    text.chars().nth(max_chars).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn detects_common_link_shapes() {
        for text in [
            "see https://example.org/page",
            "WWW.Example.test",
            "join chat.whatsapp.com/AbCdEf123",
            "t.me/somechannel",
            "dm me wa.me/2348012345678",
            "short bit.ly/3xYz",
            "visit shop.store now",
            "whatsapp://send?phone=1",
            "follow whatsapp.com/channel/0029Va",
        ] {
            assert!(contains_link(text), "{text}");
        }
    }

    #[test]
    fn plain_text_is_clean() {
        for text in ["", "   ", "good morning all", "meeting at 10.30", "e.g. this"] {
            assert!(!contains_link(text), "{text}");
        }
    }

    #[test]
    fn length_counts_characters_not_bytes() {
        assert!(!exceeds_length(&"é".repeat(160), 160));
        assert!(exceeds_length(&"é".repeat(161), 160));
        assert!(!exceeds_length("", 160));
    }

    proptest! {
        #[test]
        fn length_rule_matches_char_count(text in "\\PC{0,300}", max in 0usize..250) {
            prop_assert_eq!(exceeds_length(&text, max), text.chars().count() > max);
        }

        #[test]
        fn digits_and_spaces_never_look_like_links(text in "[0-9 ]{0,80}") {
            prop_assert!(!contains_link(&text));
        }
    }
}
