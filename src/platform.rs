use std::fmt;

use serde::Serialize;

/// Social platform a submitted URL belongs to, derived by substring matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformTag {
    Youtube,
    Tiktok,
    Instagram,
    Facebook,
    Twitter,
    Direct,
}

/// Ordered rules; first match wins.
const RULES: [(&[&str], PlatformTag); 5] = [
    (&["youtube.com", "youtu.be"], PlatformTag::Youtube),
    (&["tiktok.com"], PlatformTag::Tiktok),
    (&["instagram.com"], PlatformTag::Instagram),
    (&["facebook.com", "fb.watch"], PlatformTag::Facebook),
    (&["twitter.com", "x.com"], PlatformTag::Twitter),
];

impl PlatformTag {
    pub fn detect(url: &str) -> Self {
        let lower = url.to_ascii_lowercase();
        for (needles, tag) in RULES {
            if needles.iter().any(|needle| lower.contains(needle)) {
                return tag;
            }
        }
        PlatformTag::Direct
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlatformTag::Youtube => "youtube",
            PlatformTag::Tiktok => "tiktok",
            PlatformTag::Instagram => "instagram",
            PlatformTag::Facebook => "facebook",
            PlatformTag::Twitter => "twitter",
            PlatformTag::Direct => "direct",
        }
    }
}

impl fmt::Display for PlatformTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
