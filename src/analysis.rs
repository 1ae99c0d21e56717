//! Analysis request and result types shared by both providers
//!
//! `ProviderResponse` mirrors the chat-completion wire format so the remote
//! body deserializes into it directly; the local provider synthesizes one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AnalysisError, AnalysisOutcome};

/// Model name stamped on locally synthesized responses
pub const LOCAL_MODEL_NAME: &str = "local-model";

/// Model name stamped on error-shaped results
pub const ERROR_MODEL_NAME: &str = "error";

const TEXT_PLACEHOLDER: &str = "{text}";

// ============ Analysis Kinds ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryLength {
    Short,
    Medium,
    Long,
}

impl SummaryLength {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryLength::Short => "short",
            SummaryLength::Medium => "medium",
            SummaryLength::Long => "long",
        }
    }
}

/// Caller-supplied prompt for the custom kind.
///
/// `user_template` may contain a `{text}` placeholder; without one the input
/// text is appended after a blank line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub system_prompt: String,
    pub user_template: String,
    pub temperature: f32,
}

impl PromptTemplate {
    pub fn new(system_prompt: &str, user_template: &str, temperature: f32) -> Self {
        Self {
            system_prompt: system_prompt.to_string(),
            user_template: user_template.to_string(),
            temperature,
        }
    }

    pub fn render(&self, text: &str) -> String {
        if self.user_template.contains(TEXT_PLACEHOLDER) {
            self.user_template.replace(TEXT_PLACEHOLDER, text)
        } else {
            format!("{}\n\n{}", self.user_template, text)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnalysisKind {
    DeepUnderstanding,
    QuestionAnswering,
    Connection,
    Insight,
    Summary { length: SummaryLength },
    Custom(PromptTemplate),
}

impl AnalysisKind {
    pub fn summary(length: SummaryLength) -> Self {
        AnalysisKind::Summary { length }
    }

    /// Short stable name for logs and storage
    pub fn label(&self) -> &'static str {
        match self {
            AnalysisKind::DeepUnderstanding => "deep_understanding",
            AnalysisKind::QuestionAnswering => "question_answering",
            AnalysisKind::Connection => "connection",
            AnalysisKind::Insight => "insight",
            AnalysisKind::Summary { length } => match length {
                SummaryLength::Short => "summary_short",
                SummaryLength::Medium => "summary_medium",
                SummaryLength::Long => "summary_long",
            },
            AnalysisKind::Custom(_) => "custom",
        }
    }

    pub fn system_prompt(&self) -> &str {
        match self {
            AnalysisKind::DeepUnderstanding => {
                "You are a professional research assistant. Analyze the provided text in depth: extract the core arguments, key evidence, important data and their wider implications."
            }
            AnalysisKind::QuestionAnswering => {
                "You are a knowledgeable assistant. Answer accurately based on the provided context. If the answer cannot be determined, say so honestly."
            }
            AnalysisKind::Connection => {
                "You are an expert in connection analysis. Examine the provided texts for hidden links, shared themes and points of difference."
            }
            AnalysisKind::Insight => {
                "You are an insight generation expert. Extract valuable insights from the text, including trends, patterns, implications and recommendations."
            }
            AnalysisKind::Summary { length } => match length {
                SummaryLength::Short => "Write a concise summary that highlights the core content of the text.",
                SummaryLength::Medium => "Write a medium-length summary covering the main points and key details.",
                SummaryLength::Long => "Write a detailed summary covering every important aspect of the text.",
            },
            AnalysisKind::Custom(template) => &template.system_prompt,
        }
    }

    pub fn user_prompt(&self, text: &str) -> String {
        match self {
            AnalysisKind::DeepUnderstanding => {
                format!("Analyze the following text in depth:\n\n{}", text)
            }
            AnalysisKind::QuestionAnswering => {
                format!("Answer the question based on the following text:\n\n{}", text)
            }
            AnalysisKind::Connection => {
                format!("Analyze the connections between the following texts:\n\n{}", text)
            }
            AnalysisKind::Insight => {
                format!("Extract insights from the following text:\n\n{}", text)
            }
            AnalysisKind::Summary { .. } => {
                format!("Summarize the following text:\n\n{}", text)
            }
            AnalysisKind::Custom(template) => template.render(text),
        }
    }

    pub fn temperature(&self) -> f32 {
        match self {
            AnalysisKind::DeepUnderstanding | AnalysisKind::Connection | AnalysisKind::Insight => 0.7,
            AnalysisKind::QuestionAnswering => 0.3,
            AnalysisKind::Summary { .. } => 0.5,
            AnalysisKind::Custom(template) => template.temperature,
        }
    }

    /// System + user messages for a chat-completion request
    pub fn conversation(&self, text: &str) -> Conversation {
        Conversation(vec![
            ConversationMessage::system(self.system_prompt()),
            ConversationMessage::user(&self.user_prompt(text)),
        ])
    }
}

// ============ Conversation ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
}

impl ConversationMessage {
    pub fn system(content: &str) -> Self {
        Self { role: Role::System, content: content.to_string() }
    }

    pub fn user(content: &str) -> Self {
        Self { role: Role::User, content: content.to_string() }
    }

    pub fn assistant(content: &str) -> Self {
        Self { role: Role::Assistant, content: content.to_string() }
    }
}

/// Ordered messages; a system message appears at most once and only first
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Conversation(Vec<ConversationMessage>);

impl Conversation {
    pub fn new(messages: Vec<ConversationMessage>) -> AnalysisOutcome<Self> {
        let misplaced_system = messages
            .iter()
            .enumerate()
            .any(|(i, m)| m.role == Role::System && i > 0);
        if misplaced_system {
            return Err(AnalysisError::invalid_input(
                "system message must appear at most once and first",
            ));
        }
        if messages.is_empty() {
            return Err(AnalysisError::invalid_input("conversation has no messages"));
        }
        Ok(Self(messages))
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ============ Provider Response ============

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseChoice {
    pub index: u32,
    pub message: ChoiceMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsageStats {
    #[serde(rename = "prompt_tokens")]
    pub prompt_units: u64,
    #[serde(rename = "completion_tokens")]
    pub completion_units: u64,
    #[serde(rename = "total_tokens")]
    pub total_units: u64,
}

impl UsageStats {
    /// Usage estimate for text that was not metered by a remote API
    pub fn estimated_for(content: &str) -> Self {
        let units = estimate_units(content);
        Self {
            prompt_units: 0,
            completion_units: units,
            total_units: units,
        }
    }
}

/// Unit estimate used wherever no provider metered the text: chars / 4
pub fn estimate_units(content: &str) -> u64 {
    (content.chars().count() / 4) as u64
}

/// Normalized chat-completion response emitted by both providers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub id: String,
    #[serde(default = "default_object")]
    pub object: String,
    pub created: i64,
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ResponseChoice>,
    #[serde(default)]
    pub usage: Option<UsageStats>,
}

fn default_object() -> String {
    "chat.completion".to_string()
}

impl ProviderResponse {
    /// Single-choice response for content that did not come off the wire
    pub fn synthesized(id_prefix: &str, model: &str, content: &str, usage: Option<UsageStats>) -> Self {
        Self {
            id: format!("{}-{}", id_prefix, Uuid::new_v4()),
            object: default_object(),
            created: Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![ResponseChoice {
                index: 0,
                message: ChoiceMessage {
                    role: "assistant".to_string(),
                    content: Some(content.to_string()),
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage,
        }
    }

    /// Content of the first choice, if present and non-empty
    pub fn first_content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .filter(|c| !c.trim().is_empty())
    }
}

// ============ Analysis Result ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub kind: AnalysisKind,
    pub content: String,
    pub raw_response: ProviderResponse,
    pub timestamp: DateTime<Utc>,
}

impl AnalysisResult {
    /// Build a result; blank content is rejected as `EmptyResponse`
    pub fn new(kind: AnalysisKind, content: String, raw_response: ProviderResponse) -> AnalysisOutcome<Self> {
        if content.trim().is_empty() {
            return Err(AnalysisError::EmptyResponse);
        }
        Ok(Self {
            kind,
            content,
            raw_response,
            timestamp: Utc::now(),
        })
    }

    /// Error-shaped result for callers that render failures inline
    pub fn from_error(kind: AnalysisKind, error: &AnalysisError) -> Self {
        let content = format!("Analysis failed: {}", error);
        let mut raw_response = ProviderResponse::synthesized("error", ERROR_MODEL_NAME, &content, None);
        raw_response.choices.clear();
        Self {
            kind,
            content,
            raw_response,
            timestamp: Utc::now(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.raw_response.model == LOCAL_MODEL_NAME
    }

    pub fn is_error(&self) -> bool {
        self.raw_response.model == ERROR_MODEL_NAME
    }

    /// Units this result consumed, reported or estimated
    pub fn usage_units(&self) -> u64 {
        self.raw_response
            .usage
            .map(|u| u.total_units)
            .unwrap_or_else(|| estimate_units(&self.content))
    }
}

/// Pull bullet or numbered lines out of an insight report.
/// Falls back to the whole content when no line qualifies.
pub fn extract_insights(content: &str) -> Vec<String> {
    let insights: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| {
            line.starts_with("- ")
                || line.starts_with("• ")
                || line.chars().any(|c| c.is_ascii_digit())
        })
        .map(str::to_string)
        .collect();

    if insights.is_empty() {
        vec![content.trim().to_string()]
    } else {
        insights
    }
}
