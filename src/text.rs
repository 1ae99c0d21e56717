//! Lightweight text primitives for the local analyzer
//!
//! Sentence segmentation, tokenization, keyword ranking, script-based
//! language detection, lexicon sentiment and capitalized-run entity tagging.
//! All of it is deterministic and offline.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};

// ============ Static Tables ============

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // English
        "a", "an", "the", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
        "from", "up", "about", "into", "over", "after", "this", "that", "these", "those", "is",
        "are", "was", "were", "be", "been", "being", "has", "have", "had", "not", "its", "it's",
        "their", "there", "they", "them", "his", "her", "our", "your", "you", "what", "which",
        "who", "whom", "when", "where", "why", "how", "all", "any", "can", "will", "would",
        "could", "should", "also", "than", "then", "such", "very", "just", "more", "most",
        "some", "does", "did", "doing", "while", "because", "between", "through", "during",
        // Chinese
        "的", "了", "在", "是", "我", "有", "和", "就", "不", "人", "都", "一", "一个", "一些",
        "这", "那", "你", "他", "她", "它", "我们", "他们", "这个", "那个", "以及", "但是",
    ]
    .into_iter()
    .collect()
});

/// Single Han characters that act as particles; Han runs are split on them
const HAN_BREAKS: &[char] = &[
    '的', '了', '在', '是', '我', '有', '和', '就', '不', '都', '一', '这', '那', '你', '他', '她', '它',
];

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\p{Han}+|[\p{L}\p{N}&&[^\p{Han}]]+(?:['’\-][\p{L}\p{N}&&[^\p{Han}]]+)*")
        .unwrap_or_else(|e| panic!("token pattern is invalid: {}", e))
});

static CAPITALIZED_RUN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:[A-Z][a-z]+|[A-Z]{2,})(?:\s+(?:[A-Z][a-z]+|[A-Z]{2,}))*\b")
        .unwrap_or_else(|e| panic!("entity pattern is invalid: {}", e))
});

const ABBREVIATIONS: &[&str] = &[
    "mr", "mrs", "ms", "dr", "prof", "sr", "jr", "st", "vs", "etc", "e.g", "i.e", "fig", "no",
];

const POSITIVE_WORDS: &[&str] = &[
    "good", "great", "excellent", "positive", "success", "successful", "benefit", "beneficial",
    "improve", "improved", "improvement", "effective", "efficient", "love", "like", "happy",
    "promising", "innovative", "strong", "better", "best", "advantage", "valuable", "useful",
    "helpful", "remarkable", "impressive", "progress", "opportunity", "enjoy",
];

const NEGATIVE_WORDS: &[&str] = &[
    "bad", "poor", "terrible", "negative", "failure", "fail", "failed", "problem", "problems",
    "risk", "risky", "harm", "harmful", "weak", "worse", "worst", "difficult", "hate", "sad",
    "crisis", "decline", "loss", "threat", "concern", "concerns", "broken", "wrong", "danger",
    "dangerous", "costly",
];

const NEGATIONS: &[&str] = &["not", "no", "never", "without", "hardly", "isn't", "don't", "doesn't", "can't"];

const POSITIVE_HAN: &[&str] = &["好", "优秀", "成功", "喜欢", "进步", "有效", "积极", "机会", "价值"];
const NEGATIVE_HAN: &[&str] = &["坏", "失败", "问题", "糟糕", "风险", "困难", "危机", "消极", "损失"];

const ORG_SUFFIXES: &[&str] = &[
    "Inc", "Corp", "Corporation", "Company", "University", "Institute", "Foundation", "Lab",
    "Labs", "Group", "Association", "Agency",
];

const PLACE_PREPOSITIONS: &[&str] = &["in", "at", "from", "near", "across"];

// ============ Sentences ============

fn is_cjk_terminator(c: char) -> bool {
    matches!(c, '。' | '！' | '？')
}

fn is_closing_mark(c: char) -> bool {
    matches!(c, '"' | '\'' | ')' | ']' | '”' | '’' | '」' | '』' | '）')
}

fn ends_with_abbreviation(segment: &str) -> bool {
    let last_word = segment
        .trim_end_matches('.')
        .rsplit(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("");
    let lower = last_word.to_lowercase();
    if ABBREVIATIONS.contains(&lower.as_str()) {
        return true;
    }
    // Single-letter initials such as "J. Smith"
    let mut chars = last_word.chars();
    matches!((chars.next(), chars.next()), (Some(c), None) if c.is_uppercase())
}

/// Boundary-aware segmentation: terminators followed by whitespace or end,
/// CJK terminators anywhere, and line breaks. Abbreviations and decimals do
/// not end a sentence.
fn segment_sentences(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut i = 0;

    let flush = |current: &mut String, sentences: &mut Vec<String>| {
        let trimmed = current.trim();
        if !trimmed.is_empty() {
            sentences.push(trimmed.to_string());
        }
        current.clear();
    };

    while i < chars.len() {
        let c = chars[i];

        if c == '\n' {
            flush(&mut current, &mut sentences);
            i += 1;
            continue;
        }

        current.push(c);

        if is_cjk_terminator(c) {
            while i + 1 < chars.len() && (is_closing_mark(chars[i + 1]) || is_cjk_terminator(chars[i + 1])) {
                i += 1;
                current.push(chars[i]);
            }
            flush(&mut current, &mut sentences);
        } else if matches!(c, '.' | '!' | '?') {
            // Absorb runs like "?!" or "..." and trailing quotes
            while i + 1 < chars.len() && (matches!(chars[i + 1], '.' | '!' | '?') || is_closing_mark(chars[i + 1])) {
                i += 1;
                current.push(chars[i]);
            }
            let at_break = i + 1 >= chars.len() || chars[i + 1].is_whitespace();
            let abbreviation = c == '.' && ends_with_abbreviation(&current);
            if at_break && !abbreviation {
                flush(&mut current, &mut sentences);
            }
        }

        i += 1;
    }
    flush(&mut current, &mut sentences);

    sentences
}

/// Split text into sentences, falling back to plain terminator splitting
/// when boundary detection finds nothing.
pub fn split_sentences(text: &str) -> Vec<String> {
    let sentences = segment_sentences(text);
    if !sentences.is_empty() {
        return sentences;
    }

    text.split(|c: char| matches!(c, '.' | '!' | '?' | '。' | '！' | '？'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Paragraphs separated by blank lines
pub fn split_paragraphs(text: &str) -> Vec<String> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

// ============ Tokens & Keywords ============

/// Lowercased word tokens; Han runs are broken on particle characters
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for m in TOKEN_RE.find_iter(text) {
        let token = m.as_str();
        if token.chars().next().map(is_han).unwrap_or(false) {
            tokens.extend(
                token
                    .split(|c: char| HAN_BREAKS.contains(&c))
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            );
        } else {
            tokens.push(token.to_lowercase());
        }
    }
    tokens
}

pub fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(word)
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Top `count` tokens by frequency, title-cased, ties broken by first appearance
pub fn extract_keywords(text: &str, count: usize) -> Vec<String> {
    let mut frequency: HashMap<String, (usize, usize)> = HashMap::new();

    for (position, token) in tokenize(text).into_iter().enumerate() {
        if token.chars().count() <= 2 || is_stop_word(&token) {
            continue;
        }
        frequency.entry(token).or_insert((0, position)).0 += 1;
    }

    let mut ranked: Vec<(String, usize, usize)> = frequency
        .into_iter()
        .map(|(word, (freq, first_seen))| (word, freq, first_seen))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

    ranked
        .into_iter()
        .take(count)
        .map(|(word, _, _)| title_case(&word))
        .collect()
}

/// Keywords bucketed by their first letter, in order of first appearance
pub fn group_keywords(keywords: &[String]) -> Vec<(String, Vec<String>)> {
    let mut groups: Vec<(String, Vec<String>)> = Vec::new();
    for keyword in keywords {
        let key: String = keyword.chars().take(1).flat_map(char::to_uppercase).collect();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, words)) => words.push(keyword.clone()),
            None => groups.push((key, vec![keyword.clone()])),
        }
    }
    groups
}

// ============ Language ============

fn is_han(c: char) -> bool {
    matches!(c as u32, 0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0xF900..=0xFAFF)
}

fn is_kana(c: char) -> bool {
    matches!(c as u32, 0x3040..=0x30FF)
}

fn is_hangul(c: char) -> bool {
    matches!(c as u32, 0xAC00..=0xD7AF | 0x1100..=0x11FF)
}

fn is_cyrillic(c: char) -> bool {
    matches!(c as u32, 0x0400..=0x04FF)
}

fn is_arabic(c: char) -> bool {
    matches!(c as u32, 0x0600..=0x06FF)
}

const LATIN_MARKERS: &[(&str, &[&str])] = &[
    ("en", &["the", "and", "is", "of", "to", "this", "that", "with", "are", "a"]),
    ("fr", &["le", "la", "les", "et", "est", "des", "une", "dans", "pour", "que"]),
    ("de", &["der", "die", "das", "und", "ist", "nicht", "ein", "eine", "mit", "auf"]),
    ("es", &["el", "los", "las", "y", "es", "una", "para", "por", "con", "que"]),
];

/// Dominant language as an ISO 639-1 code, or "unknown"
pub fn detect_language(text: &str) -> String {
    let (mut han, mut kana, mut hangul, mut cyrillic, mut arabic, mut latin) = (0, 0, 0, 0, 0, 0);
    for c in text.chars() {
        if is_han(c) {
            han += 1;
        } else if is_kana(c) {
            kana += 1;
        } else if is_hangul(c) {
            hangul += 1;
        } else if is_cyrillic(c) {
            cyrillic += 1;
        } else if is_arabic(c) {
            arabic += 1;
        } else if c.is_ascii_alphabetic() || (c.is_alphabetic() && (c as u32) < 0x0250) {
            latin += 1;
        }
    }

    if kana > 0 && kana + han >= latin {
        return "ja".to_string();
    }
    let scripts = [("zh", han), ("ko", hangul), ("ru", cyrillic), ("ar", arabic)];
    if let Some((code, count)) = scripts.iter().max_by_key(|(_, n)| *n) {
        if *count > 0 && *count >= latin {
            return code.to_string();
        }
    }
    if latin == 0 {
        return "unknown".to_string();
    }

    let tokens = tokenize(text);
    LATIN_MARKERS
        .iter()
        .map(|(code, markers)| {
            let hits = tokens.iter().filter(|t| markers.contains(&t.as_str())).count();
            (*code, hits)
        })
        .filter(|(_, hits)| *hits > 0)
        .max_by_key(|(_, hits)| *hits)
        .map(|(code, _)| code.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

// ============ Sentiment ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentimentBand {
    VeryNegative,
    SlightlyNegative,
    Neutral,
    SlightlyPositive,
    VeryPositive,
}

impl SentimentBand {
    pub fn from_score(score: f64) -> Self {
        if score < -0.5 {
            SentimentBand::VeryNegative
        } else if score < 0.0 {
            SentimentBand::SlightlyNegative
        } else if score == 0.0 || score.is_nan() {
            SentimentBand::Neutral
        } else if score < 0.5 {
            SentimentBand::SlightlyPositive
        } else {
            SentimentBand::VeryPositive
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SentimentBand::VeryNegative => "very negative",
            SentimentBand::SlightlyNegative => "slightly negative",
            SentimentBand::Neutral => "neutral",
            SentimentBand::SlightlyPositive => "slightly positive",
            SentimentBand::VeryPositive => "very positive",
        }
    }
}

/// Lexicon score in [-1, 1]; 0 when no opinion words are found
pub fn sentiment_score(text: &str) -> f64 {
    let tokens = tokenize(text);
    let mut total = 0.0;
    let mut hits = 0usize;

    for (i, token) in tokens.iter().enumerate() {
        let polarity = if POSITIVE_WORDS.contains(&token.as_str()) {
            1.0
        } else if NEGATIVE_WORDS.contains(&token.as_str()) {
            -1.0
        } else {
            continue;
        };
        let negated = tokens[i.saturating_sub(2)..i]
            .iter()
            .any(|t| NEGATIONS.contains(&t.as_str()));
        total += if negated { -polarity } else { polarity };
        hits += 1;
    }

    for word in POSITIVE_HAN {
        let n = text.matches(word).count();
        total += n as f64;
        hits += n;
    }
    for word in NEGATIVE_HAN {
        let n = text.matches(word).count();
        total -= n as f64;
        hits += n;
    }

    if hits == 0 {
        0.0
    } else {
        total / hits as f64
    }
}

// ============ Entities ============

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub text: String,
    pub category: &'static str,
}

/// Best-effort tagging of capitalized runs; single words opening a sentence are skipped
pub fn extract_entities(text: &str) -> Vec<Entity> {
    let mut entities: Vec<Entity> = Vec::new();

    for sentence in split_sentences(text) {
        for m in CAPITALIZED_RUN_RE.find_iter(&sentence) {
            let run = m.as_str();
            let words: Vec<&str> = run.split_whitespace().collect();
            if m.start() == 0 && words.len() == 1 && !is_acronym(run) {
                continue;
            }
            if entities.iter().any(|e| e.text == run) {
                continue;
            }

            let preceding = sentence[..m.start()]
                .split_whitespace()
                .last()
                .map(str::to_lowercase)
                .unwrap_or_default();
            let category = if words.last().map(|w| ORG_SUFFIXES.contains(w)).unwrap_or(false) || is_acronym(run) {
                "OrganizationName"
            } else if PLACE_PREPOSITIONS.contains(&preceding.as_str()) {
                "PlaceName"
            } else {
                "PersonalName"
            };

            entities.push(Entity {
                text: run.to_string(),
                category,
            });
        }
    }

    entities
}

fn is_acronym(word: &str) -> bool {
    word.chars().count() >= 2 && word.chars().all(|c| c.is_ascii_uppercase())
}

// ============ Profile ============

/// Everything the local report templates draw on, computed once
#[derive(Debug, Clone)]
pub struct TextProfile {
    pub sentences: Vec<String>,
    pub paragraphs: Vec<String>,
    pub keywords: Vec<String>,
    pub entities: Vec<Entity>,
    pub sentiment: SentimentBand,
    pub language: String,
    pub char_count: usize,
}

impl TextProfile {
    pub fn build(text: &str, keyword_count: usize) -> Self {
        Self {
            sentences: split_sentences(text),
            paragraphs: split_paragraphs(text),
            keywords: extract_keywords(text, keyword_count),
            entities: extract_entities(text),
            sentiment: SentimentBand::from_score(sentiment_score(text)),
            language: detect_language(text),
            char_count: text.chars().count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_sentences_keeps_terminators() {
        let sentences = split_sentences("Hello world. This is a test. AI is transforming research.");
        assert_eq!(
            sentences,
            vec!["Hello world.", "This is a test.", "AI is transforming research."]
        );
    }

    #[test]
    fn test_split_sentences_skips_abbreviations_and_decimals() {
        let sentences = split_sentences("Dr. Smith measured 3.5 units. Was it enough? Yes!");
        assert_eq!(sentences, vec!["Dr. Smith measured 3.5 units.", "Was it enough?", "Yes!"]);
    }

    #[test]
    fn test_split_sentences_cjk() {
        let sentences = split_sentences("人工智能正在改变研究。这是一个测试！对吗？");
        assert_eq!(sentences, vec!["人工智能正在改变研究。", "这是一个测试！", "对吗？"]);
    }

    #[test]
    fn test_split_sentences_line_breaks() {
        let sentences = split_sentences("Heading\n\nBody text here.");
        assert_eq!(sentences, vec!["Heading", "Body text here."]);
        assert!(split_sentences("   \n ").is_empty());
    }

    #[test]
    fn test_keywords_rank_by_frequency_then_first_seen() {
        let text = "research data research model data research alpha";
        assert_eq!(extract_keywords(text, 3), vec!["Research", "Data", "Model"]);
    }

    #[test]
    fn test_keywords_filter_short_and_stop_words() {
        let keywords = extract_keywords("AI is in the lab with the team and the lab", 10);
        assert_eq!(keywords, vec!["Lab", "Team"]);
    }

    #[test]
    fn test_tokenize_mixed_scripts() {
        let tokens = tokenize("Rust的研究方法 and Graph-Based models");
        assert_eq!(tokens, vec!["rust", "研究方法", "and", "graph-based", "models"]);
    }

    #[test]
    fn test_group_keywords() {
        let keywords = vec!["Data".to_string(), "Model".to_string(), "Dataset".to_string()];
        let groups = group_keywords(&keywords);
        assert_eq!(groups[0], ("D".to_string(), vec!["Data".to_string(), "Dataset".to_string()]));
        assert_eq!(groups[1].0, "M");
    }

    #[test]
    fn test_detect_language() {
        assert_eq!(detect_language("This is a test of the system."), "en");
        assert_eq!(detect_language("人工智能正在改变研究"), "zh");
        assert_eq!(detect_language("これはテストです"), "ja");
        assert_eq!(detect_language("Привет мир"), "ru");
        assert_eq!(detect_language("12345 !!!"), "unknown");
    }

    #[test]
    fn test_sentiment_bands() {
        assert_eq!(SentimentBand::from_score(-0.8), SentimentBand::VeryNegative);
        assert_eq!(SentimentBand::from_score(-0.5), SentimentBand::SlightlyNegative);
        assert_eq!(SentimentBand::from_score(0.0), SentimentBand::Neutral);
        assert_eq!(SentimentBand::from_score(0.2), SentimentBand::SlightlyPositive);
        assert_eq!(SentimentBand::from_score(0.5), SentimentBand::VeryPositive);
    }

    #[test]
    fn test_sentiment_score_with_negation() {
        assert_eq!(sentiment_score("The results were excellent and promising."), 1.0);
        assert_eq!(sentiment_score("The results were not good."), -1.0);
        assert_eq!(sentiment_score("The table has four legs."), 0.0);
        assert!(sentiment_score("研究取得了成功，但也有问题和风险。") < 0.0);
    }

    #[test]
    fn test_extract_entities() {
        let entities = extract_entities("The team met Ada Lovelace in London. Stanford University published it.");
        let names: Vec<&str> = entities.iter().map(|e| e.text.as_str()).collect();
        assert!(names.contains(&"Ada Lovelace"));
        assert!(names.contains(&"London"));
        assert!(names.contains(&"Stanford University"));
        assert!(!names.contains(&"The"));

        let london = entities.iter().find(|e| e.text == "London").unwrap();
        assert_eq!(london.category, "PlaceName");
        let stanford = entities.iter().find(|e| e.text == "Stanford University").unwrap();
        assert_eq!(stanford.category, "OrganizationName");
    }

    #[test]
    fn test_profile_build() {
        let profile = TextProfile::build("Hello world. This is a test. AI is transforming research.", 5);
        assert_eq!(profile.sentences.len(), 3);
        assert_eq!(profile.language, "en");
        assert_eq!(profile.keywords[0], "Hello");
        assert_eq!(profile.sentiment, SentimentBand::Neutral);
    }
}
