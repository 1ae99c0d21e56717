//! Local Analysis Provider
//!
//! Offline, deterministic reports built from the `text` primitives. Report
//! building is CPU-bound and runs on the blocking pool.

use crate::analysis::{
    AnalysisKind, AnalysisResult, ProviderResponse, PromptTemplate, SummaryLength, UsageStats,
    LOCAL_MODEL_NAME,
};
use crate::error::{AnalysisError, AnalysisOutcome};
use crate::logging;
use crate::text::{group_keywords, TextProfile};

const SHORT_SUMMARY_MAX_CHARS: usize = 120;
const FALLBACK_PREVIEW_CHARS: usize = 100;
const MEDIUM_SUMMARY_SENTENCES: usize = 5;

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalProvider;

impl LocalProvider {
    pub fn new() -> Self {
        Self
    }

    /// Analyze off the calling task
    pub async fn analyze(&self, text: &str, kind: &AnalysisKind) -> AnalysisOutcome<AnalysisResult> {
        let text = text.to_string();
        let kind = kind.clone();
        tokio::task::spawn_blocking(move || analyze_blocking(&text, &kind))
            .await
            .map_err(|e| AnalysisError::UnknownError(format!("Local analysis task failed: {}", e)))?
    }
}

/// Synchronous core of the local provider
pub fn analyze_blocking(text: &str, kind: &AnalysisKind) -> AnalysisOutcome<AnalysisResult> {
    if text.trim().is_empty() {
        return Err(AnalysisError::invalid_input("text is empty"));
    }

    let content = render_report(text, kind);
    let usage = UsageStats::estimated_for(&content);
    let response = ProviderResponse::synthesized("local", LOCAL_MODEL_NAME, &content, Some(usage));

    logging::log_local(
        Some(&response.id),
        &format!("{} report: {} chars, {} units", kind.label(), content.chars().count(), usage.total_units),
    );

    AnalysisResult::new(kind.clone(), content, response)
}

fn render_report(text: &str, kind: &AnalysisKind) -> String {
    match kind {
        AnalysisKind::DeepUnderstanding => deep_understanding(text),
        AnalysisKind::QuestionAnswering => question_answering(text),
        AnalysisKind::Connection => connection(text),
        AnalysisKind::Insight => insight(text),
        AnalysisKind::Summary { length } => summary(text, *length),
        AnalysisKind::Custom(template) => custom(text, template),
    }
}

// ============ Shared Pieces ============

fn overview(profile: &TextProfile) -> String {
    let keywords = if profile.keywords.is_empty() {
        "none".to_string()
    } else {
        profile
            .keywords
            .iter()
            .enumerate()
            .map(|(i, k)| format!("{}. {}", i + 1, k))
            .collect::<Vec<_>>()
            .join(", ")
    };

    format!(
        "### Overview\n- Language: {}\n- Sentences: {}\n- Sentiment: {}\n- Keywords: {}\n\n",
        profile.language,
        profile.sentences.len(),
        profile.sentiment.label(),
        keywords
    )
}

fn leading_words(sentence: Option<&String>, count: usize, fallback: &str) -> String {
    sentence
        .map(|s| s.split_whitespace().take(count).collect::<Vec<_>>().join(" "))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn first_or<'a>(items: &'a [String], fallback: &'a str) -> &'a str {
    items.first().map(String::as_str).unwrap_or(fallback)
}

fn preview(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        trimmed.to_string()
    } else {
        format!("{}...", trimmed.chars().take(max_chars).collect::<String>())
    }
}

// ============ Reports ============

fn deep_understanding(text: &str) -> String {
    let profile = TextProfile::build(text, 10);
    let mut out = String::from("## Deep Understanding\n\n");
    out.push_str(&overview(&profile));

    out.push_str("### Key content\n");
    for (i, sentence) in profile.sentences.iter().take(5).enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, sentence));
    }
    out.push('\n');

    if !profile.entities.is_empty() {
        out.push_str("### Named entities\n");
        for entity in profile.entities.iter().take(5) {
            out.push_str(&format!("- {}: {}\n", entity.category, entity.text));
        }
        out.push('\n');
    }

    out.push_str("### Core points\n");
    out.push_str(&format!(
        "1. The text mainly discusses {}\n",
        first_or(&profile.keywords, "its central topic")
    ));
    out.push_str(&format!(
        "2. It emphasizes \"{}\"\n",
        leading_words(profile.sentences.first(), 5, "its main content")
    ));
    out.push_str(&format!(
        "3. It offers a view on {}\n",
        profile.keywords.last().map(String::as_str).unwrap_or("the wider field")
    ));
    out
}

fn question_answering(text: &str) -> String {
    let profile = TextProfile::build(text, 5);
    let mut out = String::from("## Question Answering\n\n");
    out.push_str(&overview(&profile));

    if profile.sentences.len() >= 3 {
        out.push_str("Based on the text, the answer draws on the following:\n\n");
        out.push_str(&format!(
            "The text mainly discusses {}. It states: {} It also covers: {}\n\n",
            first_or(&profile.keywords, "its central topic"),
            profile.sentences[1],
            profile.sentences[profile.sentences.len() - 1]
        ));
    } else {
        out.push_str("The text is short, so the available information is limited.\n");
        out.push_str(&format!("It mainly covers: {}\n\n", preview(text, FALLBACK_PREVIEW_CHARS)));
    }

    out.push_str("Note: this is a simple offline analysis; use the remote model for in-depth questions.");
    out
}

fn connection(text: &str) -> String {
    let profile = TextProfile::build(text, 15);
    let groups = group_keywords(&profile.keywords);
    let mut out = String::from("## Connection Analysis\n\n");
    out.push_str(&overview(&profile));

    out.push_str("### Structure\n");
    out.push_str(&format!("- Paragraphs: {}\n", profile.paragraphs.len()));
    out.push_str(&format!(
        "- Main topics: {}\n\n",
        profile.keywords.iter().take(3).cloned().collect::<Vec<_>>().join(", ")
    ));

    if !groups.is_empty() {
        out.push_str("### Related themes\n");
        for (group, words) in &groups {
            out.push_str(&format!("**{}**: {}\n", group, words.join(", ")));
        }
        out.push('\n');
    }

    if !profile.entities.is_empty() {
        out.push_str("### Entity network\n");
        for entity in profile.entities.iter().take(8) {
            out.push_str(&format!("- {}: {}\n", entity.category, entity.text));
        }
        out.push('\n');
    }

    out.push_str("### Findings\n");
    out.push_str(&format!(
        "1. The text revolves around {}\n",
        first_or(&profile.keywords, "a central theme")
    ));
    out.push_str(&format!(
        "2. Paragraphs are linked through {}\n",
        groups.first().map(|(g, _)| g.as_str()).unwrap_or("shared concepts")
    ));
    out.push_str(&format!(
        "3. The argument moves from \"{}\" to \"{}\"\n",
        leading_words(profile.paragraphs.first(), 3, "the opening"),
        leading_words(profile.paragraphs.last(), 3, "the conclusion")
    ));
    out
}

fn insight(text: &str) -> String {
    let profile = TextProfile::build(text, 8);
    let density = if profile.sentences.len() > 10 { "rich" } else { "concise" };
    let mut out = String::from("## Insights\n\n");
    out.push_str(&overview(&profile));

    out.push_str("### Key insights\n");
    out.push_str(&format!(
        "1. **Focus**: the text explores {} in depth\n",
        first_or(&profile.keywords, "a specific field")
    ));
    out.push_str(&format!(
        "2. **Stance**: the overall tone is {}\n",
        profile.sentiment.label()
    ));
    out.push_str(&format!(
        "3. **Density**: {} sentences, fairly {}\n\n",
        profile.sentences.len(),
        density
    ));

    if profile.keywords.len() >= 3 {
        out.push_str("### Patterns\n");
        out.push_str(&format!(
            "- Frequent concepts: {}, {}, {}\n",
            profile.keywords[0], profile.keywords[1], profile.keywords[2]
        ));
        out.push_str(&format!(
            "- Co-occurrence: {} often appears alongside {}\n",
            profile.keywords[0], profile.keywords[1]
        ));
        out.push_str(&format!(
            "- Progression: from \"{}\" to \"{}\"\n\n",
            leading_words(profile.sentences.first(), 5, "the introduction"),
            leading_words(profile.sentences.last(), 5, "the conclusion")
        ));
    }

    out.push_str("### Suggested actions\n");
    out.push_str(&format!(
        "1. Research further material on {}\n",
        first_or(&profile.keywords, "the core concept")
    ));
    out.push_str("2. Verify the key data and facts the text cites\n");
    out.push_str("3. Compare these insights with existing research\n");
    out
}

fn summary(text: &str, length: SummaryLength) -> String {
    let mut out = String::from("## Summary\n\n");
    match length {
        SummaryLength::Short => out.push_str(&short_summary_body(text)),
        SummaryLength::Medium => {
            let profile = TextProfile::build(text, 5);
            out.push_str(&overview(&profile));
            out.push_str(&medium_summary_body(&profile));
        }
        SummaryLength::Long => {
            let profile = TextProfile::build(text, 5);
            out.push_str(&overview(&profile));
            out.push_str("### Detailed summary\n");
            out.push_str(&format!(
                "The text centres on {} and covers the following:\n\n",
                first_or(&profile.keywords, "its core theme")
            ));
            for (i, sentence) in profile.sentences.iter().enumerate() {
                out.push_str(&format!("**Part {}**: {}\n\n", i + 1, sentence));
            }
            out.push_str("### Key points\n");
            for (i, keyword) in profile.keywords.iter().enumerate() {
                out.push_str(&format!("{}. {}\n", i + 1, keyword));
            }
        }
    }
    out
}

/// First two sentences, held to `SHORT_SUMMARY_MAX_CHARS`
fn short_summary_body(text: &str) -> String {
    let sentences = crate::text::split_sentences(text);
    let body = match sentences.len() {
        0 => return preview(text, FALLBACK_PREVIEW_CHARS),
        1 => sentences[0].clone(),
        _ => format!("{} {}", sentences[0], sentences[1]),
    };

    if body.chars().count() <= SHORT_SUMMARY_MAX_CHARS {
        body
    } else {
        let cut: String = body.chars().take(SHORT_SUMMARY_MAX_CHARS - 3).collect();
        format!("{}...", cut.trim_end())
    }
}

fn medium_summary_body(profile: &TextProfile) -> String {
    let mut out = format!(
        "The text mainly discusses {}.\n\n",
        first_or(&profile.keywords, "its central topic")
    );
    out.push_str("### Main points\n");
    for (i, sentence) in profile.sentences.iter().take(MEDIUM_SUMMARY_SENTENCES).enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, sentence));
    }
    if profile.sentences.len() > MEDIUM_SUMMARY_SENTENCES {
        out.push_str("...\n");
    }
    out
}

fn custom(text: &str, template: &PromptTemplate) -> String {
    let profile = TextProfile::build(text, 6);
    let instruction = template.user_template.to_lowercase();
    let mut out = String::from("## Custom Analysis\n\n");
    out.push_str(&format!("**Instruction**: {}\n\n", template.user_template.trim()));
    out.push_str(&overview(&profile));
    out.push_str(&format!("- Length: {} characters\n\n", profile.char_count));

    out.push_str("**Details**:\n");
    if instruction.contains("summary") || instruction.contains("summar") || instruction.contains("总结") {
        out.push_str(&medium_summary_body(&profile));
    } else if instruction.contains("keyword") || instruction.contains("关键词") {
        for keyword in &profile.keywords {
            out.push_str(&format!("- {}\n", keyword));
        }
    } else {
        out.push_str(&format!("Content outline: {}\n", preview(text, 200)));
    }
    out
}
