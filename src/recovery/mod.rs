use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::RecoveryConfig;
use crate::error::{CrawlError, CrawlResult};
use crate::storage::ErrorRecoveryRepository;

/// What to do when a rule matches a failing task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryAction {
    /// Re-queue the task after the rule's delay.
    RetryAfter,
    /// Re-run with a fresh single-use profile behind a different proxy.
    RotateProxy,
    /// Re-run with a fresh fingerprint; challenges are usually tied to
    /// the old session.
    SolveCaptcha,
    /// Record the failure and move on; only valid for optional nodes.
    MarkOptionalFailure,
    /// Give up and open an incident for an operator.
    Escalate,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetryAfter => "retry_after",
            Self::RotateProxy => "rotate_proxy",
            Self::SolveCaptcha => "solve_captcha",
            Self::MarkOptionalFailure => "mark_optional_failure",
            Self::Escalate => "escalate",
        }
    }
}

impl FromStr for RecoveryAction {
    type Err = CrawlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retry_after" => Ok(Self::RetryAfter),
            "rotate_proxy" => Ok(Self::RotateProxy),
            "solve_captcha" => Ok(Self::SolveCaptcha),
            "mark_optional_failure" => Ok(Self::MarkOptionalFailure),
            "escalate" => Ok(Self::Escalate),
            other => Err(CrawlError::internal(format!("invalid recovery action: {}", other))),
        }
    }
}

/// Optional extra conditions a rule can require beyond its message pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_contains: Option<String>,
    /// Substring looked for in the failing page's body, when one loaded.
    /// A rule with this set never matches a failure without page content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_contains: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRule {
    pub id: String,
    /// Substring matched against the error message.
    pub pattern: String,
    #[serde(default)]
    pub conditions: RuleConditions,
    pub action: RecoveryAction,
    #[serde(default)]
    pub action_params: serde_json::Value,
    pub priority: i64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default)]
    pub is_learned: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl RecoveryRule {
    pub fn new(pattern: &str, action: RecoveryAction, priority: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            pattern: pattern.to_string(),
            conditions: RuleConditions::default(),
            action,
            action_params: serde_json::Value::Null,
            priority,
            max_retries: 3,
            retry_delay_ms: 2000,
            success_count: 0,
            failure_count: 0,
            is_learned: false,
            enabled: true,
            created_at: Utc::now(),
        }
    }

    /// Priority after demotion. A rule with enough recorded outcomes and a
    /// poor success ratio sinks below its nominal priority, letting a
    /// better rule win the next classification.
    fn effective_priority(&self, config: &RecoveryConfig) -> i64 {
        let outcomes = self.success_count + self.failure_count;
        if outcomes >= config.demotion_min_outcomes {
            let ratio = self.success_count as f64 / outcomes as f64;
            if ratio < config.demotion_success_ratio {
                return self.priority - config.demotion_step;
            }
        }
        self.priority
    }

    fn matches(&self, signal: &ErrorSignal) -> bool {
        if !signal.message.contains(&self.pattern) {
            return false;
        }
        if let Some(category) = &self.conditions.error_category {
            if category != &signal.category {
                return false;
            }
        }
        if let Some(status) = self.conditions.http_status {
            if signal.http_status != Some(status) {
                return false;
            }
        }
        if let Some(fragment) = &self.conditions.url_contains {
            if !signal.url.contains(fragment.as_str()) {
                return false;
            }
        }
        if let Some(needle) = &self.conditions.content_contains {
            match &signal.content {
                Some(content) if content.contains(needle.as_str()) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Flattened view of a task failure fed into classification.
#[derive(Debug, Clone)]
pub struct ErrorSignal {
    pub message: String,
    pub category: String,
    pub http_status: Option<u16>,
    pub url: String,
    /// Body of the page that was loaded when the failure happened, if any.
    pub content: Option<String>,
}

impl ErrorSignal {
    pub fn from_error(error: &CrawlError, url: &str) -> Self {
        Self {
            message: error.to_string(),
            category: error.category().to_string(),
            http_status: error.http_status(),
            url: url.to_string(),
            content: None,
        }
    }

    pub fn with_content(mut self, content: Option<String>) -> Self {
        self.content = content;
        self
    }
}

/// The classification outcome handed back to the executor.
#[derive(Debug, Clone)]
pub struct RecoveryDecision {
    pub rule_id: String,
    pub action: RecoveryAction,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

/// One retry attempt recorded on an incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub rule_id: String,
    pub action: RecoveryAction,
    pub error: String,
    pub at_ms: i64,
}

/// Incident triage lifecycle: an operator picks an incident up
/// (`in_progress`) and either resolves it or ignores it as noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncidentStatus {
    Open,
    InProgress,
    Resolved,
    Ignored,
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Resolved => write!(f, "resolved"),
            Self::Ignored => write!(f, "ignored"),
        }
    }
}

impl FromStr for IncidentStatus {
    type Err = CrawlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "resolved" => Ok(Self::Resolved),
            "ignored" => Ok(Self::Ignored),
            other => Err(CrawlError::internal(format!("invalid incident status: {}", other))),
        }
    }
}

/// Opened when recovery exhausts its retries for a task.
#[derive(Debug, Clone)]
pub struct Incident {
    pub id: String,
    pub execution_id: String,
    pub task_id: String,
    pub error_pattern: String,
    pub attempts: Vec<AttemptRecord>,
    pub total_attempts: u32,
    pub diagnostics_json: Option<String>,
    pub status: IncidentStatus,
    pub created_at: DateTime<Utc>,
}

/// Rule-based error recovery.
///
/// Classification reads an immutable snapshot of the rule set, so the hot
/// path never takes a lock; mutations go through the repository and become
/// visible at the next `refresh()`.
pub struct RecoveryEngine {
    repo: ErrorRecoveryRepository,
    config: RecoveryConfig,
    snapshot: ArcSwap<Vec<RecoveryRule>>,
}

impl RecoveryEngine {
    pub async fn new(repo: ErrorRecoveryRepository, config: RecoveryConfig) -> CrawlResult<Self> {
        let engine = Self { repo, config, snapshot: ArcSwap::from_pointee(Vec::new()) };
        engine.refresh().await?;
        Ok(engine)
    }

    /// Rebuild the snapshot: enabled rules only, ordered by effective
    /// priority descending with older rules winning ties.
    pub async fn refresh(&self) -> CrawlResult<()> {
        let mut rules: Vec<RecoveryRule> = self
            .repo
            .load_rules()
            .await?
            .into_iter()
            .filter(|rule| rule.enabled)
            .collect();
        rules.sort_by(|a, b| {
            b.effective_priority(&self.config)
                .cmp(&a.effective_priority(&self.config))
                .then(a.created_at.cmp(&b.created_at))
        });
        debug!("Recovery snapshot refreshed: {} active rule(s)", rules.len());
        self.snapshot.store(Arc::new(rules));
        Ok(())
    }

    /// First-match classification against the current snapshot. `None`
    /// means no rule applies and the caller falls back to its defaults.
    pub fn classify(&self, signal: &ErrorSignal) -> Option<RecoveryDecision> {
        let snapshot = self.snapshot.load();
        snapshot.iter().find(|rule| rule.matches(signal)).map(|rule| RecoveryDecision {
            rule_id: rule.id.clone(),
            action: rule.action,
            max_retries: rule.max_retries,
            retry_delay_ms: rule.retry_delay_ms,
        })
    }

    /// Fallback decision when no rule matches a recoverable error.
    pub fn default_decision(&self) -> RecoveryDecision {
        RecoveryDecision {
            rule_id: String::new(),
            action: RecoveryAction::RetryAfter,
            max_retries: self.config.default_max_retries,
            retry_delay_ms: self.config.default_retry_delay_ms,
        }
    }

    pub async fn add_rule(&self, rule: RecoveryRule) -> CrawlResult<()> {
        info!("Adding recovery rule '{}' ({})", rule.pattern, rule.action.as_str());
        self.repo.insert_rule(&rule).await?;
        self.refresh().await
    }

    pub async fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> CrawlResult<()> {
        self.repo.set_rule_enabled(rule_id, enabled).await?;
        self.refresh().await
    }

    /// Outcome counters persist immediately but only influence ordering at
    /// the next refresh.
    pub async fn record_outcome(&self, rule_id: &str, success: bool) -> CrawlResult<()> {
        if rule_id.is_empty() {
            return Ok(());
        }
        self.repo.record_outcome(rule_id, success).await
    }

    pub async fn open_incident(
        &self,
        execution_id: &str,
        task_id: &str,
        signal: &ErrorSignal,
        attempts: Vec<AttemptRecord>,
    ) -> CrawlResult<Incident> {
        let incident = Incident {
            id: Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            task_id: task_id.to_string(),
            error_pattern: signal.message.clone(),
            total_attempts: attempts.len() as u32,
            attempts,
            diagnostics_json: serde_json::to_string(&serde_json::json!({
                "url": signal.url,
                "category": signal.category,
                "http_status": signal.http_status,
            }))
            .ok(),
            status: IncidentStatus::Open,
            created_at: Utc::now(),
        };
        info!(
            "Opening incident {} for task {} after {} attempt(s)",
            incident.id, task_id, incident.total_attempts
        );
        self.repo.create_incident(&incident).await?;
        Ok(incident)
    }

    pub fn repository(&self) -> &ErrorRecoveryRepository {
        &self.repo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::scratch_storage;
    use crate::storage::Storage;

    fn test_config() -> RecoveryConfig {
        RecoveryConfig {
            default_max_retries: 3,
            default_retry_delay_ms: 1000,
            demotion_step: 10,
            demotion_min_outcomes: 5,
            demotion_success_ratio: 0.3,
            snapshot_refresh_seconds: 60,
        }
    }

    async fn engine_for(storage: &Storage) -> RecoveryEngine {
        RecoveryEngine::new(storage.recovery(), test_config()).await.unwrap()
    }

    fn signal(message: &str) -> ErrorSignal {
        ErrorSignal {
            message: message.to_string(),
            category: "selector".to_string(),
            http_status: None,
            url: "https://example.com/listing".to_string(),
            content: None,
        }
    }

    #[tokio::test]
    async fn higher_priority_rule_wins() {
        let (storage, _dir) = scratch_storage().await;
        let engine = engine_for(&storage).await;

        let low = RecoveryRule::new("no_elements_found", RecoveryAction::RetryAfter, 5);
        let mut high = RecoveryRule::new("no_elements_found", RecoveryAction::Escalate, 10);
        high.created_at = low.created_at + chrono::Duration::seconds(1);
        let high_id = high.id.clone();
        engine.add_rule(low).await.unwrap();
        engine.add_rule(high).await.unwrap();

        let decision = engine.classify(&signal("no_elements_found: .price")).unwrap();
        assert_eq!(decision.rule_id, high_id);
        assert_eq!(decision.action, RecoveryAction::Escalate);
    }

    #[tokio::test]
    async fn disabling_the_winner_flips_classification() {
        let (storage, _dir) = scratch_storage().await;
        let engine = engine_for(&storage).await;

        let low = RecoveryRule::new("no_elements_found", RecoveryAction::RetryAfter, 5);
        let high = RecoveryRule::new("no_elements_found", RecoveryAction::Escalate, 10);
        let low_id = low.id.clone();
        let high_id = high.id.clone();
        engine.add_rule(low).await.unwrap();
        engine.add_rule(high).await.unwrap();

        engine.set_rule_enabled(&high_id, false).await.unwrap();
        let decision = engine.classify(&signal("no_elements_found: .price")).unwrap();
        assert_eq!(decision.rule_id, low_id);
    }

    #[tokio::test]
    async fn equal_priority_breaks_ties_by_age() {
        let (storage, _dir) = scratch_storage().await;
        let engine = engine_for(&storage).await;

        let older = RecoveryRule::new("timeout", RecoveryAction::RetryAfter, 5);
        let mut newer = RecoveryRule::new("timeout", RecoveryAction::RotateProxy, 5);
        newer.created_at = older.created_at + chrono::Duration::seconds(10);
        let older_id = older.id.clone();
        engine.add_rule(newer).await.unwrap();
        engine.add_rule(older).await.unwrap();

        let decision = engine.classify(&signal("Navigation timeout: x")).unwrap();
        assert_eq!(decision.rule_id, older_id);
    }

    #[tokio::test]
    async fn demoted_rule_sinks_below_competitor() {
        let (storage, _dir) = scratch_storage().await;
        let engine = engine_for(&storage).await;

        let mut failing = RecoveryRule::new("no_elements_found", RecoveryAction::RetryAfter, 10);
        failing.success_count = 1;
        failing.failure_count = 9;
        let steady = RecoveryRule::new("no_elements_found", RecoveryAction::Escalate, 5);
        let steady_id = steady.id.clone();
        engine.add_rule(failing).await.unwrap();
        engine.add_rule(steady).await.unwrap();

        // 10 outcomes at 10% success: effective priority 10 - 10 = 0.
        let decision = engine.classify(&signal("no_elements_found: .price")).unwrap();
        assert_eq!(decision.rule_id, steady_id);
    }

    #[tokio::test]
    async fn conditions_narrow_the_match() {
        let (storage, _dir) = scratch_storage().await;
        let engine = engine_for(&storage).await;

        let mut rule = RecoveryRule::new("HTTP request failed", RecoveryAction::RotateProxy, 5);
        rule.conditions.http_status = Some(429);
        engine.add_rule(rule).await.unwrap();

        let mut matching = signal("HTTP request failed: u - status 429");
        matching.http_status = Some(429);
        assert!(engine.classify(&matching).is_some());

        let mut other = signal("HTTP request failed: u - status 500");
        other.http_status = Some(500);
        assert!(engine.classify(&other).is_none());
    }

    #[tokio::test]
    async fn content_signature_narrows_the_match() {
        let (storage, _dir) = scratch_storage().await;
        let engine = engine_for(&storage).await;

        let mut rule = RecoveryRule::new("no_elements_found", RecoveryAction::SolveCaptcha, 5);
        rule.conditions.content_contains = Some("g-recaptcha".to_string());
        engine.add_rule(rule).await.unwrap();

        let challenged = signal("no_elements_found: .price")
            .with_content(Some(r#"<div class="g-recaptcha"></div>"#.to_string()));
        assert!(engine.classify(&challenged).is_some());

        // Same error without the page signature stays unmatched, as does a
        // failure where no page loaded at all.
        let plain = signal("no_elements_found: .price")
            .with_content(Some("<html><body>empty shelf</body></html>".to_string()));
        assert!(engine.classify(&plain).is_none());
        assert!(engine.classify(&signal("no_elements_found: .price")).is_none());
    }

    #[test]
    fn incident_status_strings_round_trip() {
        for status in [
            IncidentStatus::Open,
            IncidentStatus::InProgress,
            IncidentStatus::Resolved,
            IncidentStatus::Ignored,
        ] {
            assert_eq!(status.to_string().parse::<IncidentStatus>().unwrap(), status);
        }
    }

    #[tokio::test]
    async fn no_match_yields_none_and_default_applies() {
        let (storage, _dir) = scratch_storage().await;
        let engine = engine_for(&storage).await;

        assert!(engine.classify(&signal("something unseen")).is_none());
        let fallback = engine.default_decision();
        assert_eq!(fallback.action, RecoveryAction::RetryAfter);
        assert_eq!(fallback.max_retries, 3);
    }

    #[tokio::test]
    async fn outcomes_persist_and_apply_after_refresh() {
        let (storage, _dir) = scratch_storage().await;
        let engine = engine_for(&storage).await;

        let rule = RecoveryRule::new("timeout", RecoveryAction::RetryAfter, 10);
        let rule_id = rule.id.clone();
        engine.add_rule(rule).await.unwrap();

        for _ in 0..5 {
            engine.record_outcome(&rule_id, false).await.unwrap();
        }
        // Counters are persisted but ordering only moves on refresh.
        let loaded = storage.recovery().load_rules().await.unwrap();
        assert_eq!(loaded[0].failure_count, 5);

        engine.refresh().await.unwrap();
        // 0/5 success ratio: demoted by 10, effective -0 vs nothing else;
        // still matches because it is the only rule.
        assert!(engine.classify(&signal("Navigation timeout: x")).is_some());
    }

    #[tokio::test]
    async fn incident_round_trips_through_storage() {
        let (storage, _dir) = scratch_storage().await;
        let engine = engine_for(&storage).await;

        let attempts = vec![
            AttemptRecord {
                rule_id: "r1".to_string(),
                action: RecoveryAction::RetryAfter,
                error: "no_elements_found: .price".to_string(),
                at_ms: Utc::now().timestamp_millis(),
            },
            AttemptRecord {
                rule_id: "r1".to_string(),
                action: RecoveryAction::RetryAfter,
                error: "no_elements_found: .price".to_string(),
                at_ms: Utc::now().timestamp_millis(),
            },
        ];
        engine
            .open_incident("exec-1", "task-1", &signal("no_elements_found: .price"), attempts)
            .await
            .unwrap();

        let open = storage.recovery().list_incidents(Some(IncidentStatus::Open)).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].total_attempts, 2);
        assert_eq!(open[0].task_id, "task-1");
        assert_eq!(open[0].attempts.len(), 2);
    }
}
