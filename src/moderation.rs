//! Message moderation: profanity filtering, then rich-text formatting.
//!
//! Both stages are pure string transforms. The profanity scan runs first and
//! normalizes tokens by stripping emphasis markers, so `**badword**` matches
//! the same as `badword`; formatting never rejects anything.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::config::{ModerationConfig, ProfanityPolicy};
use crate::error::{ChatError, ChatResult};

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\S+").unwrap());
static SHORTCODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r":([a-z0-9_+-]+):").unwrap());
static CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`]+)`").unwrap());
static BOLD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*([^*]+)\*\*").unwrap());
static ITALIC_STAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*([^*]+)\*").unwrap());
static ITALIC_UNDERSCORE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"_([^_]+)_").unwrap());

static SHORTCODES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("smile", "😄"),
        ("grin", "😁"),
        ("joy", "😂"),
        ("wink", "😉"),
        ("cry", "😢"),
        ("thinking", "🤔"),
        ("heart", "❤️"),
        ("thumbsup", "👍"),
        ("thumbsdown", "👎"),
        ("clap", "👏"),
        ("wave", "👋"),
        ("ok_hand", "👌"),
        ("pray", "🙏"),
        ("eyes", "👀"),
        ("fire", "🔥"),
        ("tada", "🎉"),
        ("rocket", "🚀"),
        ("100", "💯"),
    ])
});

// Characters stripped from token edges and interiors before matching:
// emphasis markers plus surrounding punctuation.
const MARKER_CHARS: &[char] = &['*', '_', '~', '`'];
const EDGE_PUNCT: &[char] = &[
    '.', ',', '!', '?', ';', ':', '"', '\'', '(', ')', '[', ']', '{', '}', '<', '>',
];

/// Outcome of the profanity scan over one message body
#[derive(Debug, PartialEq, Eq)]
enum ScanOutcome {
    Clean,
    /// At least one banned token; carries the body with matches substituted
    Matched { replaced: String },
}

/// A message body that made it through the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Moderated {
    pub content: String,
    /// True when the replace policy substituted at least one token
    pub was_filtered: bool,
}

pub struct ModerationPipeline {
    policy: ProfanityPolicy,
    words: HashSet<String>,
    placeholder: String,
}

impl ModerationPipeline {
    pub fn new(config: &ModerationConfig) -> Self {
        Self {
            policy: config.policy,
            words: config.words.iter().map(|w| w.to_lowercase()).collect(),
            placeholder: config.placeholder.clone(),
        }
    }

    /// Run the pipeline. `profanity_enabled` reflects the room setting;
    /// formatting always runs.
    pub fn apply(&self, content: &str, profanity_enabled: bool) -> ChatResult<Moderated> {
        let (content, was_filtered) = if profanity_enabled {
            match self.scan(content) {
                ScanOutcome::Clean => (content.to_string(), false),
                ScanOutcome::Matched { replaced } => match self.policy {
                    ProfanityPolicy::Reject => {
                        return Err(ChatError::validation("message rejected by moderation"));
                    }
                    ProfanityPolicy::Replace => (replaced, true),
                },
            }
        } else {
            (content.to_string(), false)
        };

        Ok(Moderated {
            content: apply_formatting(&content),
            was_filtered,
        })
    }

    fn scan(&self, content: &str) -> ScanOutcome {
        if self.words.is_empty() {
            return ScanOutcome::Clean;
        }

        let mut matched = false;
        let replaced = WORD_RE
            .replace_all(content, |caps: &Captures| {
                let token = &caps[0];
                if self.words.contains(&normalize_token(token)) {
                    matched = true;
                    self.placeholder.clone()
                } else {
                    token.to_string()
                }
            })
            .into_owned();

        if matched {
            ScanOutcome::Matched { replaced }
        } else {
            ScanOutcome::Clean
        }
    }
}

/// Lowercased token with emphasis markers and edge punctuation removed.
/// Markers go first: in a token like `*crud!*` the punctuation only sits at
/// the edge once the markers around it are gone.
fn normalize_token(token: &str) -> String {
    token
        .chars()
        .filter(|c| !MARKER_CHARS.contains(c))
        .collect::<String>()
        .trim_matches(EDGE_PUNCT)
        .to_lowercase()
}

/// Emoji shortcodes first, then emphasis markers to HTML tags. Text without
/// markers passes through byte-identical.
fn apply_formatting(content: &str) -> String {
    let content = SHORTCODE_RE.replace_all(content, |caps: &Captures| {
        match SHORTCODES.get(&caps[1]) {
            Some(emoji) => (*emoji).to_string(),
            // Unknown codes stay as typed
            None => caps[0].to_string(),
        }
    });
    let content = CODE_RE.replace_all(&content, "<code>$1</code>");
    let content = BOLD_RE.replace_all(&content, "<strong>$1</strong>");
    let content = ITALIC_STAR_RE.replace_all(&content, "<em>$1</em>");
    ITALIC_UNDERSCORE_RE
        .replace_all(&content, "<em>$1</em>")
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(policy: ProfanityPolicy, words: &[&str]) -> ModerationPipeline {
        ModerationPipeline::new(&ModerationConfig {
            policy,
            words: words.iter().map(|w| w.to_string()).collect(),
            placeholder: "***".to_string(),
        })
    }

    #[test]
    fn plain_text_passes_through_unchanged() {
        let p = pipeline(ProfanityPolicy::Replace, &["crud"]);
        let out = p.apply("hello", true).unwrap();
        assert_eq!(out.content, "hello");
        assert!(!out.was_filtered);
    }

    #[test]
    fn replace_policy_substitutes_and_flags() {
        let p = pipeline(ProfanityPolicy::Replace, &["crud"]);
        let out = p.apply("well crud happens", true).unwrap();
        assert_eq!(out.content, "well *** happens");
        assert!(out.was_filtered);
    }

    #[test]
    fn reject_policy_fails_the_send() {
        let p = pipeline(ProfanityPolicy::Reject, &["crud"]);
        assert!(matches!(
            p.apply("crud", true),
            Err(ChatError::Validation(_))
        ));
    }

    #[test]
    fn markers_do_not_hide_banned_tokens() {
        // The scan runs before formatting and strips markers first
        let p = pipeline(ProfanityPolicy::Replace, &["crud"]);
        let out = p.apply("**crud**", true).unwrap();
        assert_eq!(out.content, "***");
        assert!(out.was_filtered);
    }

    #[test]
    fn matching_ignores_case_and_edge_punctuation() {
        let p = pipeline(ProfanityPolicy::Replace, &["crud"]);
        assert_eq!(p.apply("CRUD!", true).unwrap().content, "***");
        assert_eq!(p.apply("so (crud)", true).unwrap().content, "so ***");
    }

    #[test]
    fn markers_with_inner_punctuation_still_match() {
        let p = pipeline(ProfanityPolicy::Replace, &["crud"]);

        let out = p.apply("*crud!*", true).unwrap();
        assert_eq!(out.content, "***");
        assert!(out.was_filtered);

        assert_eq!(p.apply("**crud!**", true).unwrap().content, "***");
        assert_eq!(p.apply("`crud.`", true).unwrap().content, "***");
    }

    #[test]
    fn reject_policy_sees_through_marked_up_punctuation() {
        let p = pipeline(ProfanityPolicy::Reject, &["crud"]);
        assert!(matches!(
            p.apply("**crud!**", true),
            Err(ChatError::Validation(_))
        ));
    }

    #[test]
    fn disabled_profanity_still_formats() {
        let p = pipeline(ProfanityPolicy::Reject, &["crud"]);
        let out = p.apply("crud is **bold**", false).unwrap();
        assert_eq!(out.content, "crud is <strong>bold</strong>");
        assert!(!out.was_filtered);
    }

    #[test]
    fn emphasis_markers_become_tags() {
        let p = pipeline(ProfanityPolicy::Replace, &[]);
        assert_eq!(
            p.apply("**b** *i* _u_ `c`", true).unwrap().content,
            "<strong>b</strong> <em>i</em> <em>u</em> <code>c</code>"
        );
    }

    #[test]
    fn bold_wins_over_single_star() {
        let p = pipeline(ProfanityPolicy::Replace, &[]);
        assert_eq!(
            p.apply("**strong**", true).unwrap().content,
            "<strong>strong</strong>"
        );
    }

    #[test]
    fn snake_case_is_not_emphasis() {
        let p = pipeline(ProfanityPolicy::Replace, &[]);
        assert_eq!(p.apply("user_name", true).unwrap().content, "user_name");
    }

    #[test]
    fn shortcodes_expand_and_unknown_ones_stay() {
        let p = pipeline(ProfanityPolicy::Replace, &[]);
        assert_eq!(p.apply("hi :smile:", true).unwrap().content, "hi 😄");
        assert_eq!(p.apply(":mystery:", true).unwrap().content, ":mystery:");
    }

    #[test]
    fn empty_word_list_disables_matching() {
        let p = pipeline(ProfanityPolicy::Reject, &[]);
        assert_eq!(p.apply("anything goes", true).unwrap().content, "anything goes");
    }
}
