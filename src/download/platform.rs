//! Platform classification and link extraction.

#![allow(clippy::non_std_lazy_statics)]

use lazy_regex::lazy_regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Match `http://` or `https://` tokens in free text
static RE_LINK: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"(?i)^https?://\S+$");

/// Source platforms the bot knows how to fetch from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// instagram.com
    Instagram,
    /// twitter.com / x.com / t.co
    Twitter,
    /// facebook.com / fb.watch / fb.com
    Facebook,
    /// tiktok.com
    TikTok,
}

/// Domain substrings per platform, checked in table order.
const DOMAIN_TABLE: &[(Platform, &[&str])] = &[
    (Platform::Instagram, &["instagram.com"]),
    (Platform::Twitter, &["twitter.com", "x.com", "t.co"]),
    (Platform::Facebook, &["facebook.com", "fb.watch", "fb.com"]),
    (Platform::TikTok, &["tiktok.com", "vm.tiktok.com"]),
];

impl Platform {
    /// All known platforms
    pub const ALL: [Self; 4] = [Self::Instagram, Self::Twitter, Self::Facebook, Self::TikTok];

    /// Stable lowercase tag used in file names and persisted documents
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Instagram => "instagram",
            Self::Twitter => "twitter",
            Self::Facebook => "facebook",
            Self::TikTok => "tiktok",
        }
    }

    /// Human-readable name for chat messages
    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Instagram => "Instagram",
            Self::Twitter => "Twitter/X",
            Self::Facebook => "Facebook",
            Self::TikTok => "TikTok",
        }
    }

    /// Domain substrings that identify this platform
    #[must_use]
    pub fn domains(self) -> &'static [&'static str] {
        DOMAIN_TABLE
            .iter()
            .find(|(platform, _)| *platform == self)
            .map_or(&[][..], |(_, domains)| *domains)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|p| p.tag() == needle)
            .ok_or_else(|| format!("unknown platform: {s}"))
    }
}

/// Maps a URL to its source platform.
///
/// Case-insensitive substring match against the domain table; anything that
/// matches nothing (including garbage input) is unsupported.
///
/// # Examples
///
/// ```
/// use tb_loader::download::platform::{classify, Platform};
/// assert_eq!(classify("https://www.Instagram.com/reel/abc"), Some(Platform::Instagram));
/// assert_eq!(classify("https://example.org/video"), None);
/// ```
#[must_use]
pub fn classify(url: &str) -> Option<Platform> {
    let lowered = url.to_lowercase();
    DOMAIN_TABLE
        .iter()
        .find(|(_, domains)| domains.iter().any(|d| lowered.contains(d)))
        .map(|(platform, _)| *platform)
}

/// Extracts whitespace-separated `http(s)://` links from a message
#[must_use]
pub fn extract_links(text: &str) -> Vec<String> {
    text.split_whitespace()
        .filter(|token| RE_LINK.is_match(token))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_domains() {
        assert_eq!(
            classify("https://instagram.com/p/xyz"),
            Some(Platform::Instagram)
        );
        assert_eq!(
            classify("https://x.com/user/status/1"),
            Some(Platform::Twitter)
        );
        assert_eq!(
            classify("https://fb.watch/abcd/"),
            Some(Platform::Facebook)
        );
        assert_eq!(
            classify("https://vm.tiktok.com/ZM123/"),
            Some(Platform::TikTok)
        );
        assert_eq!(classify("HTTPS://TWITTER.COM/a"), Some(Platform::Twitter));
    }

    #[test]
    fn test_unknown_and_malformed() {
        assert_eq!(classify("https://youtube.com/watch?v=1"), None);
        assert_eq!(classify(""), None);
        assert_eq!(classify("not a url at all"), None);
    }

    #[test]
    fn test_extract_links() {
        let links = extract_links("look https://x.com/a\nand http://tiktok.com/b ftp://nope.com");
        assert_eq!(links, vec!["https://x.com/a", "http://tiktok.com/b"]);
        assert!(extract_links("no links here").is_empty());
    }

    #[test]
    fn test_tag_roundtrip_through_from_str() {
        for platform in Platform::ALL {
            assert_eq!(platform.tag().parse::<Platform>(), Ok(platform));
        }
        assert!("myspace".parse::<Platform>().is_err());
    }

    proptest! {
        #[test]
        fn known_domain_always_classified(
            idx in 0usize..4,
            prefix in "[a-z]{0,8}",
            path in "[a-zA-Z0-9/]{0,16}"
        ) {
            let platform = Platform::ALL[idx];
            let domain = platform.domains()[0];
            let url = format!("https://{prefix}{domain}/{path}");
            // Short domains like "t.co" can also occur inside other hosts
            let classified = classify(&url);
            prop_assert!(classified.is_some());
            if idx == 0 {
                prop_assert_eq!(classified, Some(Platform::Instagram));
            }
        }

        #[test]
        fn unknown_domain_never_classified(host in "[q-w]{3,10}") {
            let url = format!("https://{host}.org/video");
            prop_assert_eq!(classify(&url), None);
        }
    }
}
