//! Monitoring/diagnosis control loop: snapshot metrics, evaluate rules,
//! deduplicate against open alerts, attribute the breach, notify, persist.
//! One logical pass runs at a time; the loop itself is a spawned interval
//! task that stops with its cancellation token.

pub mod notify;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::MonitoringConfig;
use crate::core::error::EngineError;
use crate::core::store::Store;
use crate::core::types::now_iso;

pub use notify::{NotificationReceipt, NotificationRequest, Notifier, RecordingNotifier, WebhookNotifier};

const RULES_KEY: &str = "monitoring_rules";
const DIAGNOSIS_KEY: &str = "diagnosis_config";
const EMAIL_KEY: &str = "email_config";
const SNAPSHOT_KEY: &str = "latest_snapshot";
const NOTIFY_BACKOFF_BASE_MS: u64 = 200;

// ── Rule and alert model ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
}

impl CmpOp {
    pub fn as_str(self) -> &'static str {
        match self {
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Eq => "==",
        }
    }

    pub fn matches(self, value: f64, threshold: f64) -> bool {
        match self {
            CmpOp::Gt => value > threshold,
            CmpOp::Ge => value >= threshold,
            CmpOp::Lt => value < threshold,
            CmpOp::Le => value <= threshold,
            CmpOp::Eq => value == threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    Data,
    Market,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorRule {
    pub id: String,
    pub name: String,
    pub metric_key: String,
    pub operator: CmpOp,
    pub threshold: f64,
    pub severity: Severity,
    pub scope: RuleScope,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Triggered,
    Notified,
    Acknowledged,
}

impl AlertStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertStatus::Triggered => "triggered",
            AlertStatus::Notified => "notified",
            AlertStatus::Acknowledged => "acknowledged",
        }
    }
}

/// Forward-only: triggered -> notified -> acknowledged.
pub fn alert_can_transition(from: AlertStatus, to: AlertStatus) -> bool {
    matches!(
        (from, to),
        (AlertStatus::Triggered, AlertStatus::Notified)
            | (AlertStatus::Triggered, AlertStatus::Acknowledged)
            | (AlertStatus::Notified, AlertStatus::Acknowledged)
            | (AlertStatus::Notified, AlertStatus::Notified)
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnosis {
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub channel: String,
    pub recipient: String,
    pub ok: bool,
    pub result: String,
    pub ts: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub metric_key: String,
    pub current_value: f64,
    pub operator: CmpOp,
    pub threshold: f64,
    pub severity: Severity,
    pub scope: RuleScope,
    pub status: AlertStatus,
    pub triggered_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<Diagnosis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<NotificationRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionRule {
    pub metric_key: String,
    #[serde(default)]
    pub possible_causes: Vec<String>,
    #[serde(default)]
    pub suggested_actions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosisConfig {
    #[serde(default)]
    pub attribution_rules: Vec<AttributionRule>,
    #[serde(default)]
    pub default_actions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub smtp_host: String,
    #[serde(default)]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_user: String,
    #[serde(default)]
    pub smtp_password: String,
    #[serde(default = "default_true")]
    pub use_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub collected_at: String,
    pub metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckReport {
    pub snapshot: MetricSnapshot,
    pub new_alerts: Vec<Alert>,
    pub active_alerts: Vec<Alert>,
}

// ── Metric source ──

#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn collect(&self) -> Result<BTreeMap<String, f64>, EngineError>;
}

/// Built-in loan-book KPI synthesis: a small deterministic drift keyed to the
/// wall-clock minute, so the loop has live-looking numbers without a feed.
pub struct DefaultMetricSource;

#[async_trait]
impl MetricSource for DefaultMetricSource {
    async fn collect(&self) -> Result<BTreeMap<String, f64>, EngineError> {
        use chrono::Timelike;
        let minute = chrono::Utc::now().minute();
        let shift = ((minute % 6) as f64 - 3.0) / 1000.0;

        let mut metrics = BTreeMap::new();
        metrics.insert("bl_overdue_rate".to_string(), round6(0.0208 + shift));
        metrics.insert("cl_overdue_rate".to_string(), round6(0.0221 + shift * 0.8));
        metrics.insert("bl_migration_rate".to_string(), round6(0.027 + shift * 0.9));
        metrics.insert("cl_migration_rate".to_string(), round6(0.031 + shift));
        metrics.insert(
            "bl_credit_utilization_rate".to_string(),
            round6(0.562 - shift * 0.7),
        );
        metrics.insert(
            "cl_credit_utilization_rate".to_string(),
            round6(0.641 - shift * 0.5),
        );
        metrics.insert("raroc".to_string(), round6(0.109 + shift * 0.4));
        metrics.insert("cost_income_ratio".to_string(), round6(0.337 + shift * 0.6));
        metrics.insert("market_risk_heat".to_string(), 4.0);
        metrics.insert("market_growth_heat".to_string(), 5.0);
        metrics.insert("market_compliance_heat".to_string(), 4.0);
        Ok(metrics)
    }
}

fn round6(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

pub fn default_rules() -> Vec<MonitorRule> {
    vec![
        MonitorRule {
            id: "rule-bl-overdue".to_string(),
            name: "经营贷逾期率监控".to_string(),
            metric_key: "bl_overdue_rate".to_string(),
            operator: CmpOp::Gt,
            threshold: 0.03,
            severity: Severity::High,
            scope: RuleScope::Data,
            enabled: true,
        },
        MonitorRule {
            id: "rule-cl-overdue".to_string(),
            name: "消费贷逾期率监控".to_string(),
            metric_key: "cl_overdue_rate".to_string(),
            operator: CmpOp::Gt,
            threshold: 0.035,
            severity: Severity::Medium,
            scope: RuleScope::Data,
            enabled: true,
        },
        MonitorRule {
            id: "rule-market-risk".to_string(),
            name: "市场风险热度监控".to_string(),
            metric_key: "market_risk_heat".to_string(),
            operator: CmpOp::Ge,
            threshold: 7.0,
            severity: Severity::Medium,
            scope: RuleScope::Market,
            enabled: true,
        },
    ]
}

pub fn default_diagnosis_config() -> DiagnosisConfig {
    DiagnosisConfig {
        attribution_rules: vec![AttributionRule {
            metric_key: "bl_overdue_rate".to_string(),
            possible_causes: vec![
                "渠道结构变化导致高风险客群占比上升".to_string(),
                "存量客户额度使用率抬升，还款能力承压".to_string(),
            ],
            suggested_actions: vec![
                "先核验口径与渠道结构，再进入A/B实验验证策略".to_string(),
                "对高风险分层客户启动提前提醒".to_string(),
            ],
        }],
        default_actions: vec!["建议先执行口径复核，再评估策略调整。".to_string()],
    }
}

// ── Service ──

pub struct MonitorService {
    cfg: MonitoringConfig,
    store: Arc<Store>,
    source: Arc<dyn MetricSource>,
    notifier: Arc<dyn Notifier>,
    pass_lock: tokio::sync::Mutex<()>,
}

impl MonitorService {
    pub fn new(
        cfg: MonitoringConfig,
        store: Arc<Store>,
        source: Arc<dyn MetricSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            cfg,
            store,
            source,
            notifier,
            pass_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn rules(&self) -> Result<Vec<MonitorRule>, EngineError> {
        match self.store.get_config(RULES_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(default_rules()),
        }
    }

    pub async fn update_rules(
        &self,
        rules: Vec<MonitorRule>,
    ) -> Result<Vec<MonitorRule>, EngineError> {
        for rule in &rules {
            if rule.id.is_empty() || rule.metric_key.is_empty() {
                return Err(EngineError::Validation(
                    "rule id and metric_key must not be empty".to_string(),
                ));
            }
        }
        self.store
            .put_config(RULES_KEY, &serde_json::to_value(&rules)?)
            .await?;
        Ok(rules)
    }

    pub async fn diagnosis_config(&self) -> Result<DiagnosisConfig, EngineError> {
        match self.store.get_config(DIAGNOSIS_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(default_diagnosis_config()),
        }
    }

    pub async fn update_diagnosis_config(
        &self,
        config: DiagnosisConfig,
    ) -> Result<DiagnosisConfig, EngineError> {
        self.store
            .put_config(DIAGNOSIS_KEY, &serde_json::to_value(&config)?)
            .await?;
        Ok(config)
    }

    pub async fn email_config(&self) -> Result<EmailConfig, EngineError> {
        match self.store.get_config(EMAIL_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(EmailConfig::default()),
        }
    }

    pub async fn update_email_config(
        &self,
        config: EmailConfig,
    ) -> Result<EmailConfig, EngineError> {
        self.store
            .put_config(EMAIL_KEY, &serde_json::to_value(&config)?)
            .await?;
        Ok(config)
    }

    /// Compute and persist the current metric snapshot.
    pub async fn snapshot(&self) -> Result<MetricSnapshot, EngineError> {
        let metrics = self.source.collect().await?;
        let snapshot = MetricSnapshot {
            collected_at: now_iso(),
            metrics,
        };
        self.store
            .put_config(SNAPSHOT_KEY, &serde_json::to_value(&snapshot)?)
            .await?;
        Ok(snapshot)
    }

    /// One full evaluation pass. Serialized: overlapping calls queue behind
    /// the pass lock, so a sustained breach yields exactly one alert per
    /// suppression window.
    pub async fn check(&self) -> Result<CheckReport, EngineError> {
        let _pass = self.pass_lock.lock().await;
        let snapshot = self.snapshot().await?;
        let rules = self.rules().await?;
        let diagnosis_config = self.diagnosis_config().await?;
        let email = self.email_config().await?;

        let mut new_alerts = Vec::new();
        for rule in rules.iter().filter(|r| r.enabled) {
            let Some(&value) = snapshot.metrics.get(&rule.metric_key) else {
                continue;
            };
            if !rule.operator.matches(value, rule.threshold) {
                continue;
            }
            if self.suppressed(rule).await? {
                continue;
            }

            let mut alert = Alert {
                id: Uuid::new_v4().to_string(),
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                metric_key: rule.metric_key.clone(),
                current_value: value,
                operator: rule.operator,
                threshold: rule.threshold,
                severity: rule.severity,
                scope: rule.scope,
                status: AlertStatus::Triggered,
                triggered_at: now_iso(),
                ack_note: None,
                ack_at: None,
                diagnosis: Some(build_diagnosis(&diagnosis_config, &rule.metric_key, value, rule.threshold)),
                notification: None,
            };

            self.dispatch(&mut alert, &email).await;
            self.store
                .append_alert(
                    &alert.id,
                    &alert.rule_id,
                    &alert.metric_key,
                    alert.status.as_str(),
                    &alert.triggered_at,
                    &serde_json::to_string(&alert)?,
                )
                .await?;
            info!(alert_id = %alert.id, rule = %rule.id, value, "alert raised");
            new_alerts.push(alert);
        }

        let mut active_alerts = Vec::new();
        for snapshot_json in self.store.list_alerts(200, None).await? {
            let alert: Alert = serde_json::from_str(&snapshot_json)?;
            if alert.status != AlertStatus::Acknowledged {
                active_alerts.push(alert);
            }
        }

        Ok(CheckReport {
            snapshot,
            new_alerts,
            active_alerts,
        })
    }

    async fn suppressed(&self, rule: &MonitorRule) -> Result<bool, EngineError> {
        let Some((triggered_at, _)) = self
            .store
            .latest_open_alert(&rule.id, &rule.metric_key)
            .await?
        else {
            return Ok(false);
        };
        let Ok(triggered) = chrono::DateTime::parse_from_rfc3339(&triggered_at) else {
            return Ok(false);
        };
        let age = chrono::Utc::now() - triggered.with_timezone(&chrono::Utc);
        Ok(age.num_milliseconds() >= 0 && (age.num_milliseconds() as u64) < self.cfg.suppression_ms)
    }

    /// Dispatch with bounded retry. A failing notification never rolls the
    /// alert back; the failure is recorded on the alert instead.
    async fn dispatch(&self, alert: &mut Alert, email: &EmailConfig) {
        let request = NotificationRequest {
            channel: "email".to_string(),
            to: email.recipient.clone(),
            subject: format!("[monitoring] {}", alert.rule_name),
            body: alert_body(alert),
        };

        let mut last_error = String::new();
        for attempt in 0..self.cfg.notify_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(
                    NOTIFY_BACKOFF_BASE_MS * 2u64.pow(attempt - 1),
                ))
                .await;
            }
            match self.notifier.send(&request).await {
                Ok(receipt) => {
                    alert.notification = Some(NotificationRecord {
                        channel: request.channel.clone(),
                        recipient: request.to.clone(),
                        ok: true,
                        result: receipt.provider_response,
                        ts: now_iso(),
                    });
                    alert.status = AlertStatus::Notified;
                    return;
                }
                Err(e) => {
                    warn!(alert_id = %alert.id, attempt = attempt + 1, error = %e, "notification failed");
                    last_error = e.to_string();
                }
            }
        }
        alert.notification = Some(NotificationRecord {
            channel: request.channel,
            recipient: request.to,
            ok: false,
            result: last_error,
            ts: now_iso(),
        });
    }

    pub async fn alerts(
        &self,
        limit: usize,
        status: Option<AlertStatus>,
    ) -> Result<Vec<Alert>, EngineError> {
        let snapshots = self
            .store
            .list_alerts(limit, status.map(|s| s.as_str()))
            .await?;
        let mut alerts = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            alerts.push(serde_json::from_str(&snapshot)?);
        }
        Ok(alerts)
    }

    pub async fn acknowledge(
        &self,
        alert_id: &str,
        note: Option<&str>,
    ) -> Result<Alert, EngineError> {
        let snapshot = self
            .store
            .get_alert(alert_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("alert {alert_id}")))?;
        let mut alert: Alert = serde_json::from_str(&snapshot)?;
        if !alert_can_transition(alert.status, AlertStatus::Acknowledged) {
            return Err(EngineError::Conflict(format!(
                "alert cannot move {} -> acknowledged",
                alert.status.as_str()
            )));
        }
        alert.status = AlertStatus::Acknowledged;
        alert.ack_note = note.map(|n| n.to_string());
        alert.ack_at = Some(now_iso());
        self.store
            .update_alert(alert_id, alert.status.as_str(), &serde_json::to_string(&alert)?)
            .await?;
        Ok(alert)
    }

    /// Re-dispatch the notification for an alert that is still open.
    pub async fn resend(&self, alert_id: &str) -> Result<Alert, EngineError> {
        let snapshot = self
            .store
            .get_alert(alert_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("alert {alert_id}")))?;
        let mut alert: Alert = serde_json::from_str(&snapshot)?;
        if alert.status == AlertStatus::Acknowledged {
            return Err(EngineError::Conflict(
                "acknowledged alerts are closed".to_string(),
            ));
        }
        let email = self.email_config().await?;
        self.dispatch(&mut alert, &email).await;
        self.store
            .update_alert(alert_id, alert.status.as_str(), &serde_json::to_string(&alert)?)
            .await?;
        Ok(alert)
    }

    /// Spawn the periodic control loop. Stops when the token is cancelled.
    pub fn spawn_loop(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(service.cfg.tick_interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = service.check().await {
                            warn!(error = %e, "monitoring pass failed");
                        }
                    }
                }
            }
        })
    }
}

fn build_diagnosis(
    config: &DiagnosisConfig,
    metric_key: &str,
    value: f64,
    threshold: f64,
) -> Diagnosis {
    let matched = config
        .attribution_rules
        .iter()
        .find(|r| r.metric_key == metric_key);

    let mut key_points = Vec::new();
    match matched {
        Some(rule) => {
            key_points.extend(rule.possible_causes.iter().cloned());
            if rule.suggested_actions.is_empty() {
                key_points.extend(config.default_actions.iter().cloned());
            } else {
                key_points.extend(rule.suggested_actions.iter().cloned());
            }
        }
        None => key_points.extend(config.default_actions.iter().cloned()),
    }

    Diagnosis {
        summary: format!("{metric_key} is at {value}, beyond the {threshold} threshold"),
        key_points,
    }
}

fn alert_body(alert: &Alert) -> String {
    let mut lines = vec![
        format!("Triggered at: {}", alert.triggered_at),
        format!("Rule: {}", alert.rule_name),
        format!("Metric: {}", alert.metric_key),
        format!("Current value: {}", alert.current_value),
        format!(
            "Threshold: {} {}",
            alert.operator.as_str(),
            alert.threshold
        ),
    ];
    if let Some(diagnosis) = &alert.diagnosis {
        lines.push(String::new());
        lines.push(format!("Attribution: {}", diagnosis.summary));
        for point in &diagnosis.key_points {
            lines.push(format!("- {point}"));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitoringConfig;

    struct StaticSource(BTreeMap<String, f64>);

    #[async_trait]
    impl MetricSource for StaticSource {
        async fn collect(&self) -> Result<BTreeMap<String, f64>, EngineError> {
            Ok(self.0.clone())
        }
    }

    fn breach_source() -> Arc<StaticSource> {
        let mut metrics = BTreeMap::new();
        metrics.insert("bl_overdue_rate".to_string(), 0.035);
        metrics.insert("cl_overdue_rate".to_string(), 0.01);
        Arc::new(StaticSource(metrics))
    }

    fn service_with(
        notifier: Arc<dyn Notifier>,
        source: Arc<dyn MetricSource>,
    ) -> MonitorService {
        let store = Arc::new(Store::open_in_memory().unwrap());
        MonitorService::new(MonitoringConfig::default(), store, source, notifier)
    }

    #[tokio::test]
    async fn sustained_breach_yields_exactly_one_alert() {
        let notifier = Arc::new(RecordingNotifier::new());
        let service = service_with(notifier.clone(), breach_source());

        let first = service.check().await.unwrap();
        assert_eq!(first.new_alerts.len(), 1);
        let alert = &first.new_alerts[0];
        assert_eq!(alert.metric_key, "bl_overdue_rate");
        assert_eq!(alert.status, AlertStatus::Notified);
        assert!(alert.notification.as_ref().unwrap().ok);

        // Same breach, same window: suppressed.
        for _ in 0..3 {
            let again = service.check().await.unwrap();
            assert!(again.new_alerts.is_empty());
        }
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn alert_lifecycle_forward_only() {
        let notifier = Arc::new(RecordingNotifier::new());
        let service = service_with(notifier, breach_source());

        let report = service.check().await.unwrap();
        let alert_id = report.new_alerts[0].id.clone();

        let acked = service
            .acknowledge(&alert_id, Some("known spike"))
            .await
            .unwrap();
        assert_eq!(acked.status, AlertStatus::Acknowledged);
        assert_eq!(acked.ack_note.as_deref(), Some("known spike"));

        // No backwards motion.
        let err = service.resend(&alert_id).await.unwrap_err();
        assert_eq!(err.kind(), crate::core::error::ErrorKind::Conflict);
        let err = service.acknowledge(&alert_id, None).await.unwrap_err();
        assert_eq!(err.kind(), crate::core::error::ErrorKind::Conflict);

        // Once acknowledged, the suppression key is free again.
        let next = service.check().await.unwrap();
        assert_eq!(next.new_alerts.len(), 1);
    }

    #[tokio::test]
    async fn notification_failure_keeps_alert_triggered_and_resend_recovers() {
        // Fail more times than the retry budget.
        let notifier = Arc::new(RecordingNotifier::failing_first(
            MonitoringConfig::default().notify_retries,
        ));
        let service = service_with(notifier.clone(), breach_source());

        let report = service.check().await.unwrap();
        let alert = &report.new_alerts[0];
        assert_eq!(alert.status, AlertStatus::Triggered);
        let record = alert.notification.as_ref().unwrap();
        assert!(!record.ok);

        let resent = service.resend(&alert.id).await.unwrap();
        assert_eq!(resent.status, AlertStatus::Notified);
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn diagnosis_uses_attribution_rules() {
        let notifier = Arc::new(RecordingNotifier::new());
        let service = service_with(notifier, breach_source());
        let report = service.check().await.unwrap();
        let diagnosis = report.new_alerts[0].diagnosis.as_ref().unwrap();
        assert!(diagnosis.summary.contains("bl_overdue_rate"));
        assert!(!diagnosis.key_points.is_empty());
    }

    #[tokio::test]
    async fn disabled_rules_do_not_fire() {
        let notifier = Arc::new(RecordingNotifier::new());
        let service = service_with(notifier, breach_source());
        let mut rules = service.rules().await.unwrap();
        for rule in &mut rules {
            rule.enabled = false;
        }
        service.update_rules(rules).await.unwrap();

        let report = service.check().await.unwrap();
        assert!(report.new_alerts.is_empty());
    }

    #[tokio::test]
    async fn operator_serde_uses_symbolic_tags() {
        let json = serde_json::to_string(&CmpOp::Ge).unwrap();
        assert_eq!(json, "\">=\"");
        let parsed: CmpOp = serde_json::from_str("\">\"").unwrap();
        assert_eq!(parsed, CmpOp::Gt);
    }
}
