pub mod analysis;
pub mod db;
pub mod error;
pub mod local;
pub mod logging;
pub mod orchestrator;
pub mod quota;
pub mod remote;
pub mod settings;
pub mod text;

pub use analysis::{
    extract_insights, AnalysisKind, AnalysisResult, Conversation, ConversationMessage, PromptTemplate,
    ProviderResponse, Role, SummaryLength,
};
pub use db::Database;
pub use error::{AnalysisError, AnalysisOutcome, ErrorKind};
pub use local::LocalProvider;
pub use orchestrator::{
    AnalysisEvent, AnalysisProvider, AnalysisRequest, AnalysisStream, FallbackPolicy, ModePolicy, Orchestrator,
};
pub use quota::{QuotaAlert, QuotaLedger, QuotaRecord, UsageSummary};
pub use remote::{Answer, RemoteProvider, StreamDecoder, StreamEvent, StreamHandle, StreamOutcome};
pub use settings::{Settings, SettingsStore};

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

const DATABASE_FILE: &str = "forme.db";
const LOG_DIR: &str = "logs";
const LOG_RETENTION_DAYS: i64 = 7;
const MATERIAL_SEPARATOR: &str = "\n\n---\n\n";

// ============ Materials ============

/// A saved research material as handed over by the storage layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Material {
    pub id: Uuid,
    pub title: String,
    pub content: Option<String>,
}

impl Material {
    pub fn new(title: &str, content: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.to_string(),
            content: content.map(str::to_string),
        }
    }

    /// Content, if present and not blank
    pub fn text(&self) -> Option<&str> {
        self.content.as_deref().filter(|c| !c.trim().is_empty())
    }
}

// ============ App Services ============

/// Explicitly wired services; nothing here is process-global
pub struct AppServices {
    pub db: Arc<Database>,
    pub settings: Arc<SettingsStore>,
    pub ledger: Arc<QuotaLedger>,
    pub remote: Arc<RemoteProvider>,
    pub orchestrator: Orchestrator,
}

impl AppServices {
    /// Open storage under `data_dir`, start file logging and build the services
    pub fn init(data_dir: &Path) -> rusqlite::Result<Self> {
        let log_dir = data_dir.join(LOG_DIR);
        if let Err(e) = logging::init_logging(&log_dir) {
            tracing::warn!("Failed to initialize file logging: {}", e);
        }
        match logging::cleanup_old_logs(&log_dir, LOG_RETENTION_DAYS) {
            Ok(removed) if removed > 0 => {
                logging::log_routing(None, &format!("Removed {} old log files", removed));
            }
            Ok(_) => {}
            Err(e) => logging::log_error(None, &format!("Log cleanup failed: {}", e)),
        }

        Self::open(data_dir)
    }

    /// Open storage under `data_dir` without touching logging
    pub fn open(data_dir: &Path) -> rusqlite::Result<Self> {
        let db = Arc::new(Database::open(&data_dir.join(DATABASE_FILE))?);
        Ok(Self::wire(db))
    }

    /// Services over an in-memory database seeded with `settings`
    pub fn in_memory(settings: Settings) -> rusqlite::Result<Self> {
        let db = Arc::new(Database::open_in_memory()?);
        let services = Self::wire(db);
        services.settings.update(|s| *s = settings);
        Ok(services)
    }

    fn wire(db: Arc<Database>) -> Self {
        let settings = Arc::new(SettingsStore::load(db.clone()));
        let ledger = Arc::new(QuotaLedger::new(db.clone(), settings.clone()));
        let remote = Arc::new(RemoteProvider::new(settings.clone()));
        let orchestrator = Orchestrator::new(
            Arc::new(LocalProvider::new()),
            remote.clone(),
            ledger.clone(),
            settings.clone(),
        );

        Self {
            db,
            settings,
            ledger,
            remote,
            orchestrator,
        }
    }

    // ============ Analysis ============

    pub async fn analyze_text(
        &self,
        text: &str,
        kind: AnalysisKind,
        prefer_remote: bool,
    ) -> AnalysisOutcome<AnalysisResult> {
        self.orchestrator.analyze_with_settings(text, kind, prefer_remote).await
    }

    pub async fn analyze_material(&self, material: &Material, kind: AnalysisKind) -> AnalysisOutcome<AnalysisResult> {
        let text = material
            .text()
            .ok_or_else(|| AnalysisError::invalid_input(format!("material \"{}\" has no content", material.title)))?;
        self.orchestrator.analyze_with_settings(text, kind, true).await
    }

    /// Analyze several materials as one text; materials without content are skipped
    pub async fn analyze_materials(&self, materials: &[Material], kind: AnalysisKind) -> AnalysisOutcome<AnalysisResult> {
        let combined = combine_materials(materials)
            .ok_or_else(|| AnalysisError::invalid_input("no material has content"))?;
        self.orchestrator.analyze_with_settings(&combined, kind, true).await
    }

    /// Insight analysis of one material, split into individual insight lines
    pub async fn generate_insights(&self, material: &Material) -> AnalysisOutcome<Vec<String>> {
        let result = self.analyze_material(material, AnalysisKind::Insight).await?;
        Ok(extract_insights(&result.content))
    }

    /// Answer a question remotely; the reported usage (prompt included) goes to the ledger
    pub async fn answer_question(&self, question: &str, context: Option<&str>) -> AnalysisOutcome<String> {
        let answer = self.remote.answer_question(question, context).await?;
        self.ledger.record_usage(answer.units);
        Ok(answer.text)
    }

    /// Store a new credential only if the endpoint accepts it
    pub async fn validate_and_save_api_key(&self, api_key: &str) -> AnalysisOutcome<bool> {
        let previous = self.settings.current().api_key;
        self.settings.set_api_key(Some(api_key));

        match self.remote.test_connection().await {
            Ok(valid) => Ok(valid),
            Err(err) => {
                self.settings.set_api_key(previous.as_deref());
                Err(err)
            }
        }
    }

    pub fn remove_api_key(&self) {
        self.settings.set_api_key(None);
    }

    // ============ Usage ============

    pub fn today_usage(&self) -> UsageSummary {
        self.ledger.today_statistics()
    }

    pub fn monthly_usage(&self) -> UsageSummary {
        self.ledger.monthly_statistics(Local::now().date_naive())
    }

    /// Percent of the configured monthly limit used so far
    pub fn usage_percentage(&self) -> f64 {
        let settings = self.settings.current();
        self.ledger
            .usage_percentage(settings.monthly_unit_limit, Local::now().date_naive())
    }

    pub fn reset_usage(&self) {
        self.ledger.reset();
    }
}

fn combine_materials(materials: &[Material]) -> Option<String> {
    let parts: Vec<&str> = materials.iter().filter_map(Material::text).collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(MATERIAL_SEPARATOR))
    }
}
