use async_trait::async_trait;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::analysis::{AnalysisKind, AnalysisResult};
use crate::error::{AnalysisError, AnalysisOutcome, ErrorKind};
use crate::local::LocalProvider;
use crate::logging;
use crate::quota::QuotaLedger;
use crate::remote::RemoteProvider;
use crate::settings::SettingsStore;

/// Budget a remote call must fit before automatic mode will try it
pub const REMOTE_ESTIMATE_UNITS: u64 = 1_000;

const EVENT_CHANNEL_CAPACITY: usize = 64;

// ============ Policies ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModePolicy {
    #[default]
    Automatic,
    LocalOnly,
    RemoteOnly,
}

impl ModePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModePolicy::Automatic => "automatic",
            ModePolicy::LocalOnly => "local_only",
            ModePolicy::RemoteOnly => "remote_only",
        }
    }

    pub fn from_str(s: &str) -> Option<ModePolicy> {
        match s {
            "automatic" => Some(ModePolicy::Automatic),
            "local_only" => Some(ModePolicy::LocalOnly),
            "remote_only" => Some(ModePolicy::RemoteOnly),
            _ => None,
        }
    }
}

/// Whether a failed remote call is retried on the local provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackPolicy {
    pub enabled: bool,
}

impl FallbackPolicy {
    pub fn enabled() -> Self {
        Self { enabled: true }
    }

    pub fn disabled() -> Self {
        Self { enabled: false }
    }

    /// A cancelled request stays cancelled
    pub fn should_fallback(&self, error: &AnalysisError) -> bool {
        self.enabled && error.kind() != ErrorKind::Cancelled
    }
}

impl From<bool> for FallbackPolicy {
    fn from(enabled: bool) -> Self {
        Self { enabled }
    }
}

// ============ Routing ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Local,
    Remote,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Local => "local",
            Route::Remote => "remote",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteDecision {
    pub route: Route,
    pub reason: &'static str,
}

impl RouteDecision {
    fn local(reason: &'static str) -> Self {
        Self { route: Route::Local, reason }
    }

    fn remote(reason: &'static str) -> Self {
        Self { route: Route::Remote, reason }
    }
}

/// Pick the provider for one request. The hint only counts under automatic.
pub fn plan_route(mode: ModePolicy, remote_configured: bool, budget_available: bool, prefer_remote: bool) -> RouteDecision {
    match mode {
        ModePolicy::LocalOnly => RouteDecision::local("local-only mode"),
        ModePolicy::RemoteOnly if remote_configured => RouteDecision::remote("remote-only mode"),
        ModePolicy::RemoteOnly => RouteDecision::local("remote not configured"),
        ModePolicy::Automatic if !prefer_remote => RouteDecision::local("caller prefers local"),
        ModePolicy::Automatic if !remote_configured => RouteDecision::local("remote not configured"),
        ModePolicy::Automatic if !budget_available => RouteDecision::local("monthly budget exhausted"),
        ModePolicy::Automatic => RouteDecision::remote("remote configured with budget"),
    }
}

// ============ Requests ============

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRequest {
    pub text: String,
    pub kind: AnalysisKind,
    pub mode: ModePolicy,
    pub fallback: FallbackPolicy,
    pub prefer_remote: bool,
}

impl AnalysisRequest {
    /// Automatic mode, fallback on, remote preferred
    pub fn new(text: impl Into<String>, kind: AnalysisKind) -> Self {
        Self {
            text: text.into(),
            kind,
            mode: ModePolicy::Automatic,
            fallback: FallbackPolicy::enabled(),
            prefer_remote: true,
        }
    }

    pub fn with_mode(mut self, mode: ModePolicy) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_fallback(mut self, fallback: impl Into<FallbackPolicy>) -> Self {
        self.fallback = fallback.into();
        self
    }

    pub fn prefer_remote(mut self, prefer_remote: bool) -> Self {
        self.prefer_remote = prefer_remote;
        self
    }
}

#[derive(Debug)]
pub enum AnalysisEvent {
    /// Accumulated text so far (remote route only)
    Partial(String),
    /// Earlier partials are void; the remote stream failed and the local
    /// result follows in `Finished`
    Reset,
    /// Terminal event; not sent when the stream was cancelled
    Finished(AnalysisOutcome<AnalysisResult>),
}

pub struct AnalysisStream {
    pub events: mpsc::Receiver<AnalysisEvent>,
    pub cancel: CancellationToken,
}

impl AnalysisStream {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

// ============ Providers ============

#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_configured(&self) -> bool;

    async fn analyze(&self, text: &str, kind: &AnalysisKind) -> AnalysisOutcome<AnalysisResult>;

    /// Providers without incremental output deliver the whole result as one partial
    async fn analyze_streaming(
        &self,
        text: &str,
        kind: &AnalysisKind,
        partials: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> AnalysisOutcome<AnalysisResult> {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(AnalysisError::Cancelled),
            result = self.analyze(text, kind) => result?,
        };
        let _ = partials.send(result.content.clone()).await;
        Ok(result)
    }
}

#[async_trait]
impl AnalysisProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn analyze(&self, text: &str, kind: &AnalysisKind) -> AnalysisOutcome<AnalysisResult> {
        LocalProvider::analyze(self, text, kind).await
    }
}

#[async_trait]
impl AnalysisProvider for RemoteProvider {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn is_configured(&self) -> bool {
        RemoteProvider::is_configured(self)
    }

    async fn analyze(&self, text: &str, kind: &AnalysisKind) -> AnalysisOutcome<AnalysisResult> {
        RemoteProvider::analyze(self, text, kind).await
    }

    async fn analyze_streaming(
        &self,
        text: &str,
        kind: &AnalysisKind,
        partials: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> AnalysisOutcome<AnalysisResult> {
        RemoteProvider::analyze_streaming(self, text, kind, partials, cancel).await
    }
}

// ============ Orchestrator ============

/// Routes analysis requests between the providers and keeps the ledger current.
/// Holds no mutable state of its own; clones share the same services.
#[derive(Clone)]
pub struct Orchestrator {
    local: Arc<dyn AnalysisProvider>,
    remote: Arc<dyn AnalysisProvider>,
    ledger: Arc<QuotaLedger>,
    settings: Arc<SettingsStore>,
}

impl Orchestrator {
    pub fn new(
        local: Arc<dyn AnalysisProvider>,
        remote: Arc<dyn AnalysisProvider>,
        ledger: Arc<QuotaLedger>,
        settings: Arc<SettingsStore>,
    ) -> Self {
        Self { local, remote, ledger, settings }
    }

    /// Standard wiring: offline provider plus the HTTP provider reading `settings`
    pub fn with_default_providers(ledger: Arc<QuotaLedger>, settings: Arc<SettingsStore>) -> Self {
        Self::new(
            Arc::new(LocalProvider::new()),
            Arc::new(RemoteProvider::new(settings.clone())),
            ledger,
            settings,
        )
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    fn decide(&self, request: &AnalysisRequest, request_id: &str) -> AnalysisOutcome<RouteDecision> {
        if request.text.trim().is_empty() {
            return Err(AnalysisError::invalid_input("text is empty"));
        }

        let settings = self.settings.current();
        let budget_available = self.ledger.has_sufficient_budget(
            settings.monthly_unit_limit,
            REMOTE_ESTIMATE_UNITS,
            Local::now().date_naive(),
        );
        let decision = plan_route(
            request.mode,
            self.remote.is_configured(),
            budget_available,
            request.prefer_remote,
        );

        logging::log_routing(
            Some(request_id),
            &format!(
                "{} via {} ({}, mode={}, fallback={})",
                request.kind.label(),
                decision.route.as_str(),
                decision.reason,
                request.mode.as_str(),
                request.fallback.enabled
            ),
        );
        Ok(decision)
    }

    /// Route, run, and fall back per the request's policy.
    ///
    /// Errors reach the caller only when the remote call failed and the
    /// fallback policy did not allow a local retry, or when the local
    /// provider itself failed.
    pub async fn analyze(&self, request: AnalysisRequest) -> AnalysisOutcome<AnalysisResult> {
        let request_id = Uuid::new_v4().to_string();
        let decision = self.decide(&request, &request_id)?;

        let outcome = match decision.route {
            Route::Local => self.local.analyze(&request.text, &request.kind).await,
            Route::Remote => {
                let remote = self.remote.analyze(&request.text, &request.kind).await;
                self.settle_remote(&request, &request_id, remote).await
            }
        };

        self.finish(&request_id, outcome)
    }

    /// Mode and fallback taken from the current settings
    pub async fn analyze_with_settings(
        &self,
        text: &str,
        kind: AnalysisKind,
        prefer_remote: bool,
    ) -> AnalysisOutcome<AnalysisResult> {
        let settings = self.settings.current();
        let request = AnalysisRequest::new(text, kind)
            .with_mode(settings.mode)
            .with_fallback(settings.enable_auto_fallback)
            .prefer_remote(prefer_remote);
        self.analyze(request).await
    }

    /// Never fails: errors come back as an error-shaped result
    pub async fn analyze_or_report(&self, request: AnalysisRequest) -> AnalysisResult {
        let kind = request.kind.clone();
        match self.analyze(request).await {
            Ok(result) => result,
            Err(err) => AnalysisResult::from_error(kind, &err),
        }
    }

    /// Same routing as `analyze`, with accumulated remote text delivered as
    /// `Partial` events before the terminal `Finished`
    pub fn analyze_streaming(&self, request: AnalysisRequest) -> AnalysisStream {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let this = self.clone();
        let token = cancel.clone();

        tokio::spawn(async move {
            let outcome = this.run_streaming(request, &tx, &token).await;
            if token.is_cancelled() {
                return;
            }
            let _ = tx.send(AnalysisEvent::Finished(outcome)).await;
        });

        AnalysisStream { events: rx, cancel }
    }

    async fn run_streaming(
        &self,
        request: AnalysisRequest,
        events: &mpsc::Sender<AnalysisEvent>,
        cancel: &CancellationToken,
    ) -> AnalysisOutcome<AnalysisResult> {
        let request_id = Uuid::new_v4().to_string();
        let decision = self.decide(&request, &request_id)?;

        let outcome = match decision.route {
            Route::Local => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(AnalysisError::Cancelled),
                    result = self.local.analyze(&request.text, &request.kind) => result,
                }
            }
            Route::Remote => {
                let (partial_tx, mut partial_rx) = mpsc::channel::<String>(EVENT_CHANNEL_CAPACITY);
                let forward_events = events.clone();
                let forward_cancel = cancel.clone();
                let forwarder = tokio::spawn(async move {
                    let mut forwarded = 0usize;
                    while let Some(text) = partial_rx.recv().await {
                        if forward_cancel.is_cancelled()
                            || forward_events.send(AnalysisEvent::Partial(text)).await.is_err()
                        {
                            break;
                        }
                        forwarded += 1;
                    }
                    forwarded
                });

                let remote = self
                    .remote
                    .analyze_streaming(&request.text, &request.kind, partial_tx, cancel.clone())
                    .await;
                // Partials drain before the terminal event
                let forwarded = forwarder.await.unwrap_or_default();
                if let Err(err) = &remote {
                    if forwarded > 0 && !cancel.is_cancelled() && request.fallback.should_fallback(err) {
                        let _ = events.send(AnalysisEvent::Reset).await;
                    }
                }
                self.settle_remote(&request, &request_id, remote).await
            }
        };

        self.finish(&request_id, outcome)
    }

    /// Record usage for a remote success, or apply the fallback policy to a failure
    async fn settle_remote(
        &self,
        request: &AnalysisRequest,
        request_id: &str,
        remote: AnalysisOutcome<AnalysisResult>,
    ) -> AnalysisOutcome<AnalysisResult> {
        match remote {
            Ok(result) => {
                self.ledger.record_usage(result.usage_units());
                Ok(result)
            }
            Err(err) if request.fallback.should_fallback(&err) => {
                logging::log_routing(
                    Some(request_id),
                    &format!("Remote failed ({}), falling back to local", err.kind().as_str()),
                );
                self.local.analyze(&request.text, &request.kind).await
            }
            Err(err) => {
                logging::log_error(
                    Some(request_id),
                    &format!("Remote failed with fallback disabled: {}", err),
                );
                Err(err)
            }
        }
    }

    fn finish(
        &self,
        request_id: &str,
        outcome: AnalysisOutcome<AnalysisResult>,
    ) -> AnalysisOutcome<AnalysisResult> {
        match &outcome {
            Ok(result) => {
                self.ledger.record_analysis_created();
                logging::log_routing(
                    Some(request_id),
                    &format!("Done: model={} chars={}", result.raw_response.model, result.content.chars().count()),
                );
            }
            Err(err) => logging::log_error(Some(request_id), &format!("Analysis failed: {}", err)),
        }
        outcome
    }
}
