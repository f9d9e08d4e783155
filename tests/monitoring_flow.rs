//! Monitoring loop through the public facade: rule breach, alert lifecycle,
//! suppression window and the background loop handle.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use datapilot::core::error::EngineError;
use datapilot::core::monitoring::{AlertStatus, MetricSource, RecordingNotifier};
use datapilot::{EngineConfig, Services};
use tokio_util::sync::CancellationToken;

struct StaticSource(BTreeMap<String, f64>);

#[async_trait]
impl MetricSource for StaticSource {
    async fn collect(&self) -> Result<BTreeMap<String, f64>, EngineError> {
        Ok(self.0.clone())
    }
}

fn breach_engine() -> Result<(Services, Arc<RecordingNotifier>)> {
    let mut metrics = BTreeMap::new();
    metrics.insert("bl_overdue_rate".to_string(), 0.035);
    let notifier = Arc::new(RecordingNotifier::new());
    let services = Services::in_memory_with(
        EngineConfig::default(),
        Arc::new(StaticSource(metrics)),
        notifier.clone(),
    )?;
    Ok((services, notifier))
}

#[tokio::test]
async fn breach_triggers_once_and_acknowledges_forward() -> Result<()> {
    let (services, notifier) = breach_engine()?;
    let monitoring = services.monitoring();

    let report = monitoring.check().await?;
    assert_eq!(report.new_alerts.len(), 1);
    let alert = &report.new_alerts[0];
    assert_eq!(alert.metric_key, "bl_overdue_rate");
    assert_eq!(alert.current_value, 0.035);
    assert_eq!(alert.status, AlertStatus::Notified);
    assert_eq!(notifier.sent().len(), 1);
    assert!(notifier.sent()[0].body.contains("bl_overdue_rate"));

    // Within the suppression window nothing new fires.
    let again = monitoring.check().await?;
    assert!(again.new_alerts.is_empty());
    assert_eq!(again.active_alerts.len(), 1);

    let acked = monitoring.acknowledge(&alert.id, Some("seasonal")).await?;
    assert_eq!(acked.status, AlertStatus::Acknowledged);
    Ok(())
}

#[tokio::test]
async fn snapshot_reports_collected_metrics() -> Result<()> {
    let (services, _notifier) = breach_engine()?;
    let snapshot = services.monitoring().snapshot().await?;
    assert_eq!(snapshot.metrics.get("bl_overdue_rate"), Some(&0.035));
    assert!(!snapshot.collected_at.is_empty());
    Ok(())
}

#[tokio::test]
async fn background_loop_runs_checks_until_cancelled() -> Result<()> {
    let mut metrics = BTreeMap::new();
    metrics.insert("bl_overdue_rate".to_string(), 0.035);
    let notifier = Arc::new(RecordingNotifier::new());
    let mut config = EngineConfig::default();
    config.monitoring.tick_interval_ms = 20;
    let services =
        Services::in_memory_with(config, Arc::new(StaticSource(metrics)), notifier.clone())?;

    let cancel = CancellationToken::new();
    let handle = services.start_monitoring(cancel.clone());

    tokio::time::sleep(Duration::from_millis(120)).await;
    cancel.cancel();
    handle.await?;

    // Several passes ran, the sustained breach still produced one alert.
    assert_eq!(notifier.sent().len(), 1);
    let alerts = services.monitoring().alerts(10, None).await?;
    assert_eq!(alerts.len(), 1);
    Ok(())
}

#[tokio::test]
async fn config_round_trips() -> Result<()> {
    let (services, _notifier) = breach_engine()?;
    let monitoring = services.monitoring();

    let mut rules = monitoring.rules().await?;
    rules[0].threshold = 0.05;
    let updated = monitoring.update_rules(rules.clone()).await?;
    assert_eq!(updated[0].threshold, 0.05);
    let loaded = monitoring.rules().await?;
    assert_eq!(loaded[0].threshold, 0.05);

    let mut email = monitoring.email_config().await?;
    email.recipient = "risk-team@example.com".to_string();
    monitoring.update_email_config(email.clone()).await?;
    let loaded = monitoring.email_config().await?;
    assert_eq!(loaded.recipient, "risk-team@example.com");

    let diagnosis = monitoring.diagnosis_config().await?;
    monitoring.update_diagnosis_config(diagnosis.clone()).await?;
    let loaded = monitoring.diagnosis_config().await?;
    assert_eq!(
        loaded.attribution_rules.len(),
        diagnosis.attribution_rules.len()
    );
    Ok(())
}
