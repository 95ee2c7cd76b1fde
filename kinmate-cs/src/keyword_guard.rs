//! Dangerous-keyword safety classifier

use crate::collaborators::{SafetyClassifier, Verdict};
use kinmate_common::Result;
use tracing::debug;

/// Built-in blocklist: self-harm, violence, weapons, drugs, abuse
const DEFAULT_KEYWORDS: &[&str] = &[
    "自殺", "跳樓", "割腕", "炸彈", "殺人", "槍", "毒品", "虐待", "暴力", "性侵",
    "suicide", "kill myself", "jump off", "cut my wrist", "bomb", "murder", "gun",
    "drugs", "abuse", "violence", "sexual assault",
];

/// Blocks input that mentions any listed keyword
///
/// ASCII keywords match whole words only ("gun" does not match "begun");
/// other keywords match as substrings. Matching is case-insensitive.
pub struct KeywordGuard {
    keywords: Vec<String>,
}

impl Default for KeywordGuard {
    fn default() -> Self {
        Self::new(DEFAULT_KEYWORDS.iter().copied())
    }
}

impl KeywordGuard {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// Keywords found in `text`, in list order
    pub fn matches(&self, text: &str) -> Vec<&str> {
        let text = text.to_lowercase();
        self.keywords
            .iter()
            .filter(|k| contains_keyword(&text, k))
            .map(|k| k.as_str())
            .collect()
    }

    pub fn check(&self, text: &str) -> Verdict {
        let hits = self.matches(text);
        if hits.is_empty() {
            Verdict::Allow
        } else {
            Verdict::Block(format!("keywords detected: {}", hits.join(", ")))
        }
    }
}

fn contains_keyword(text: &str, keyword: &str) -> bool {
    if !keyword.is_ascii() {
        return text.contains(keyword);
    }
    text.match_indices(keyword).any(|(at, _)| {
        let before = text[..at].chars().next_back();
        let after = text[at + keyword.len()..].chars().next();
        !before.is_some_and(|c| c.is_alphanumeric()) && !after.is_some_and(|c| c.is_alphanumeric())
    })
}

#[async_trait::async_trait]
impl SafetyClassifier for KeywordGuard {
    async fn classify(&self, text: &str) -> Result<Verdict> {
        let verdict = self.check(text);
        debug!(verdict = %verdict, "Keyword guard verdict");
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_ordinary_conversation() {
        let guard = KeywordGuard::default();
        assert_eq!(guard.check("今天天氣很好，我去公園散步"), Verdict::Allow);
        assert_eq!(guard.check("My knee has begun to hurt again"), Verdict::Allow);
    }

    #[test]
    fn test_blocks_and_lists_every_hit() {
        let guard = KeywordGuard::default();
        assert_eq!(
            guard.check("我想自殺，還想跳樓"),
            Verdict::Block("keywords detected: 自殺, 跳樓".to_string())
        );
        assert_eq!(
            guard.check("There is a BOMB here"),
            Verdict::Block("keywords detected: bomb".to_string())
        );
    }

    #[test]
    fn test_ascii_keywords_respect_word_boundaries() {
        let guard = KeywordGuard::new(["gun", "kill myself"]);
        assert!(guard.matches("a gun.").contains(&"gun"));
        assert!(guard.matches("shotgunner").is_empty());
        assert_eq!(guard.matches("I want to kill myself"), vec!["kill myself"]);
    }

    #[tokio::test]
    async fn test_classify_uses_wire_format() {
        let guard = KeywordGuard::new(["炸彈"]);
        let verdict = guard.classify("他說有炸彈").await.unwrap();
        assert_eq!(verdict.to_string(), "BLOCK: keywords detected: 炸彈");
    }
}
