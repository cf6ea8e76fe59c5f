use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

const POSITIVE_WORDS: &[&str] = &[
    "great", "good", "thanks", "thank", "wonderful", "perfect", "happy", "excellent",
    "awesome", "love", "glad", "appreciate", "nice", "fantastic", "helpful", "pleased",
];

const NEGATIVE_WORDS: &[&str] = &[
    "bad", "terrible", "angry", "upset", "frustrated", "frustrating", "problem", "issue",
    "wrong", "unfortunately", "hate", "awful", "disappointed", "annoyed", "broken", "worst",
];

const URGENT_WORDS: &[&str] = &[
    "urgent", "emergency", "immediately", "asap", "now", "quickly", "hurry", "critical",
    "help", "fast",
];

const QUESTION_OPENERS: &[&str] = &[
    "what", "when", "where", "who", "why", "how", "can", "could", "would", "do", "does",
    "is", "are", "will", "should",
];

/// Complexity saturates at this many words.
const COMPLEXITY_WORD_CAP: f64 = 40.0;

/// Lexical read of one utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageAnalysis {
    /// -1 (negative) to 1 (positive).
    pub sentiment: f64,
    pub urgency: f64,
    pub complexity: f64,
    pub energy: f64,
    pub has_question: bool,
    pub token_count: usize,
}

impl Default for MessageAnalysis {
    fn default() -> Self {
        Self {
            sentiment: 0.0,
            urgency: 0.0,
            complexity: 0.0,
            energy: 0.0,
            has_question: false,
            token_count: 0,
        }
    }
}

fn word_pattern() -> &'static Regex {
    static WORD: OnceLock<Regex> = OnceLock::new();
    WORD.get_or_init(|| Regex::new(r"[A-Za-z']+").expect("static regex"))
}

/// Score an utterance. Pure function of the text.
pub fn analyze_text(text: &str) -> MessageAnalysis {
    let token_count = text.split_whitespace().count();
    if token_count == 0 {
        return MessageAnalysis::default();
    }

    let words: Vec<String> = word_pattern()
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect();

    let count_hits = |list: &[&str]| words.iter().filter(|w| list.contains(&w.as_str())).count();
    let positive = count_hits(POSITIVE_WORDS) as f64;
    let negative = count_hits(NEGATIVE_WORDS) as f64;
    let urgent = count_hits(URGENT_WORDS) as f64;

    let sentiment = if positive + negative > 0.0 {
        (positive - negative) / (positive + negative)
    } else {
        0.0
    };

    let urgency = (urgent * 0.4).min(1.0);

    let word_ratio = (token_count as f64 / COMPLEXITY_WORD_CAP).min(1.0);
    let punctuation = text.chars().filter(|c| ",;:()-".contains(*c)).count() as f64;
    let punctuation_density = (punctuation / token_count as f64 * 4.0).min(1.0);
    let complexity = clamp_unit(0.7 * word_ratio + 0.3 * punctuation_density);

    let exclamations = text.chars().filter(|c| *c == '!').count() as f64;
    let letters = text.chars().filter(|c| c.is_alphabetic()).count();
    let upper_ratio = if letters > 0 {
        text.chars().filter(|c| c.is_uppercase()).count() as f64 / letters as f64
    } else {
        0.0
    };
    let energy = clamp_unit(
        0.35 * (exclamations / 3.0).min(1.0) + 0.35 * (upper_ratio * 1.5).min(1.0) + 0.3 * urgency,
    );

    let has_question = text.contains('?')
        || words
            .first()
            .is_some_and(|w| QUESTION_OPENERS.contains(&w.as_str()));

    MessageAnalysis {
        sentiment: sentiment.clamp(-1.0, 1.0),
        urgency,
        complexity,
        energy,
        has_question,
        token_count,
    }
}

pub(crate) fn clamp_unit(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}
