//! Static signal tables for the user-agent and header checks in
//! `BotClassifier`, lifted from `original_source/app/bot_detector.py` and
//! kept in their own module the way the teacher separates static
//! configuration (e.g. routing tables) from the logic that consumes it.

use once_cell::sync::Lazy;
use regex::RegexSet;

/// Case-insensitive substrings identifying known bot/script user agents
/// (spec.md §4.3). Any match is sufficient.
pub static BOT_USER_AGENT_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)bot",
        r"(?i)crawler",
        r"(?i)spider",
        r"(?i)scraper",
        r"(?i)curl",
        r"(?i)wget",
        r"(?i)python-requests",
        r"(?i)python-urllib",
        r"(?i)scrapy",
        r"(?i)headless",
        r"(?i)phantomjs",
        r"(?i)selenium",
        r"(?i)puppeteer",
        r"(?i)playwright",
        r"(?i)axios",
        r"(?i)go-http-client",
        r"(?i)java",
        r"(?i)okhttp",
        r"(?i)apache-httpclient",
    ])
    .expect("bot user-agent pattern set must compile")
});

/// Case-insensitive tokens identifying a genuine browser UA.
pub static BROWSER_UA_TOKENS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)mozilla",
        r"(?i)chrome",
        r"(?i)safari",
        r"(?i)firefox",
        r"(?i)edge",
        r"(?i)opera",
    ])
    .expect("browser ua token set must compile")
});

/// Headers a real browser request almost always carries (spec.md §4.3
/// header-entropy score).
pub const EXPECTED_BROWSER_HEADERS: &[&str] =
    &["accept", "accept-language", "accept-encoding", "user-agent", "referer"];

pub fn matches_known_bot_ua(user_agent: &str) -> bool {
    BOT_USER_AGENT_PATTERNS.is_match(user_agent)
}

pub fn matches_browser_ua(user_agent: &str) -> bool {
    BROWSER_UA_TOKENS.is_match(user_agent)
}
