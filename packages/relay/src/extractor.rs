//! Contract Address Extraction
//!
//! Finds the asset identifier ("CA") a message refers to. Rules are tried in a
//! fixed priority order and the first match wins; only one identifier per
//! message is ever returned.

use regex::Regex;
use std::sync::LazyLock;

/// Extraction rules, in the order they are tried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtractRule {
    /// `https://birdeye.so/token/<ca>?...`
    Birdeye,
    /// `https://dexscreener.com/solana/<ca>`
    DexScreener,
    /// A bare base58 token of 32 to 44 characters
    Base58,
}

/// Priority order of the rules
pub const RULES: [ExtractRule; 3] = [
    ExtractRule::Birdeye,
    ExtractRule::DexScreener,
    ExtractRule::Base58,
];

static BIRDEYE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https://birdeye\.so/token/([^?\s]+)\?").unwrap());

static DEXSCREENER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https://dexscreener\.com/solana/([a-zA-Z0-9]+)").unwrap());

// Base58 alphabet: no 0, O, I or l
static BASE58_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[1-9A-HJ-NP-Za-km-z]{32,44}\b").unwrap());

impl ExtractRule {
    /// Returns the human-readable rule name
    pub fn name(&self) -> &'static str {
        match self {
            ExtractRule::Birdeye => "birdeye",
            ExtractRule::DexScreener => "dexscreener",
            ExtractRule::Base58 => "base58",
        }
    }

    fn regex(&self) -> &'static Regex {
        match self {
            ExtractRule::Birdeye => &BIRDEYE_RE,
            ExtractRule::DexScreener => &DEXSCREENER_RE,
            ExtractRule::Base58 => &BASE58_RE,
        }
    }

    /// Apply this rule alone to `text`
    pub fn find(&self, text: &str) -> Option<String> {
        let caps = self.regex().captures(text)?;
        // URL rules capture the path segment, the bare rule uses the whole match
        let m = caps.get(1).or_else(|| caps.get(0))?;
        Some(m.as_str().to_string())
    }
}

/// An identifier together with the rule that found it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub ca: String,
    pub rule: ExtractRule,
}

/// Extract the first identifier from a message
///
/// # Returns
/// `Some(Extraction)` from the highest-priority rule that matches, `None` otherwise
pub fn extract(text: &str) -> Option<Extraction> {
    RULES.iter().find_map(|rule| {
        rule.find(text).map(|ca| Extraction { ca, rule: *rule })
    })
}

/// Extract only the identifier string
pub fn extract_ca(text: &str) -> Option<String> {
    extract(text).map(|e| e.ca)
}
