//! Two-phase Alertmanager-compatible alert sink.
//!
//! `sendInitialAlert` opens an incident the instant triage fires;
//! `sendEnrichedAnalysis` replaces it with the investigation's findings.
//! Between the two, a heartbeat keeps the Alertmanager firing state
//! alive so it doesn't auto-resolve mid-investigation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::AlertManagerConfig;
use crate::types::{ActiveIncident, AlertError, IncidentId};

pub const ALERTNAME_TRIAGE: &str = "SeraphAnomalyTriage";
pub const ALERTNAME_INVESTIGATION_COMPLETE: &str = "SeraphAnomalyInvestigationComplete";
pub const ALERTNAME_SYSTEM_EVENT: &str = "SeraphSystemEvent";

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const HEARTBEAT_ENDS_AT_LEAD: Duration = Duration::from_secs(5 * 60);

fn rfc3339(time: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(time).to_rfc3339()
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Open an incident for a freshly-triaged alert. `incident_id` is
    /// minted by the caller (the scheduler) so it can be threaded into
    /// the later `send_enriched_analysis` call for the same incident.
    async fn send_initial_alert(
        &self,
        incident_id: IncidentId,
        reason: &str,
        priority: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), AlertError>;

    /// Replace the initial alert with the investigation's findings and
    /// stop the heartbeat for that incident.
    async fn send_enriched_analysis(
        &self,
        incident_id: IncidentId,
        analysis: &str,
        status: &str,
    ) -> Result<(), AlertError>;

    /// Fire a one-shot system-level alert (worker crash, investigation
    /// timeout) unrelated to any specific incident's two-phase flow.
    async fn send_system_alert(&self, summary: &str, severity: &str) -> Result<(), AlertError>;
}

/// No-op sink used when `alertManager.url` is unset: every call
/// succeeds immediately with a synthetic incident id, so the rest of
/// the pipeline behaves identically with or without a real sink.
pub struct NullAlertSink;

#[async_trait]
impl AlertSink for NullAlertSink {
    async fn send_initial_alert(
        &self,
        _incident_id: IncidentId,
        _reason: &str,
        _priority: &str,
        _labels: &HashMap<String, String>,
    ) -> Result<(), AlertError> {
        Ok(())
    }

    async fn send_enriched_analysis(&self, _incident_id: IncidentId, _analysis: &str, _status: &str) -> Result<(), AlertError> {
        Ok(())
    }

    async fn send_system_alert(&self, _summary: &str, _severity: &str) -> Result<(), AlertError> {
        Ok(())
    }
}

/// HTTP sink that POSTs to an Alertmanager-compatible `/api/v2/alerts`
/// endpoint and runs a background heartbeat per open incident.
pub struct AlertmanagerSink {
    http: reqwest::Client,
    base_url: String,
    active: Arc<DashMap<IncidentId, ActiveIncident>>,
    stop: Arc<DashMap<IncidentId, Arc<Notify>>>,
}

impl AlertmanagerSink {
    pub fn new(config: &AlertManagerConfig) -> Option<Self> {
        let base_url = config.url.clone()?;
        Some(Self {
            http: reqwest::Client::new(),
            base_url,
            active: Arc::new(DashMap::new()),
            stop: Arc::new(DashMap::new()),
        })
    }

    async fn post_alert(&self, payload: serde_json::Value) -> Result<(), AlertError> {
        let url = format!("{}/api/v2/alerts", self.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!([payload]))
            .send()
            .await
            .map_err(|e| AlertError::DeliveryFailed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AlertError::DeliveryFailed(format!("alertmanager returned {}", resp.status())));
        }
        Ok(())
    }

    fn fingerprint(incident_id: IncidentId) -> String {
        format!("sentinel-{incident_id}")
    }

    fn spawn_heartbeat(&self, incident_id: IncidentId, alertname: &'static str, labels: HashMap<String, String>) {
        let stop_signal = Arc::new(Notify::new());
        self.stop.insert(incident_id, stop_signal.clone());
        let http = self.http.clone();
        let base_url = self.base_url.clone();
        let fingerprint = Self::fingerprint(incident_id);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                        let ends_at = SystemTime::now() + HEARTBEAT_ENDS_AT_LEAD;
                        let ends_at_rfc3339 = rfc3339(ends_at);
                        let mut annotations = HashMap::new();
                        annotations.insert("fingerprint".to_string(), fingerprint.clone());
                        let mut alert_labels = labels.clone();
                        alert_labels.insert("alertname".to_string(), alertname.to_string());
                        let payload = json!({
                            "labels": alert_labels,
                            "annotations": annotations,
                            "endsAt": ends_at_rfc3339,
                        });
                        let url = format!("{}/api/v2/alerts", base_url.trim_end_matches('/'));
                        if let Err(e) = http.post(&url).json(&serde_json::json!([payload])).send().await {
                            tracing::warn!(incident = %incident_id, error = %e, "heartbeat POST failed");
                        }
                    }
                    _ = stop_signal.notified() => break,
                }
            }
        });
    }
}

#[async_trait]
impl AlertSink for AlertmanagerSink {
    async fn send_initial_alert(
        &self,
        incident_id: IncidentId,
        reason: &str,
        priority: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), AlertError> {
        let mut alert_labels = labels.clone();
        alert_labels.insert("alertname".to_string(), ALERTNAME_TRIAGE.to_string());
        alert_labels.insert("priority".to_string(), priority.to_string());
        alert_labels.insert("incident_id".to_string(), incident_id.to_string());

        let payload = json!({
            "labels": alert_labels,
            "annotations": { "reason": reason, "fingerprint": Self::fingerprint(incident_id) },
            "startsAt": rfc3339(SystemTime::now()),
        });
        self.post_alert(payload).await?;

        self.active.insert(
            incident_id,
            ActiveIncident {
                incident_id,
                alertname: ALERTNAME_TRIAGE,
                started_at: SystemTime::now(),
                fingerprint: Self::fingerprint(incident_id),
            },
        );
        self.spawn_heartbeat(incident_id, ALERTNAME_TRIAGE, alert_labels);
        Ok(())
    }

    async fn send_enriched_analysis(&self, incident_id: IncidentId, analysis: &str, status: &str) -> Result<(), AlertError> {
        if let Some((_, stop_signal)) = self.stop.remove(&incident_id) {
            stop_signal.notify_one();
        }
        self.active
            .remove(&incident_id)
            .ok_or_else(|| AlertError::UnknownIncident(incident_id.to_string()))?;

        let mut labels = HashMap::new();
        labels.insert("alertname".to_string(), ALERTNAME_INVESTIGATION_COMPLETE.to_string());
        labels.insert("incident_id".to_string(), incident_id.to_string());
        labels.insert("status".to_string(), status.to_string());

        let payload = json!({
            "labels": labels,
            "annotations": { "analysis": analysis, "fingerprint": Self::fingerprint(incident_id) },
            "startsAt": rfc3339(SystemTime::now()),
        });
        self.post_alert(payload).await
    }

    async fn send_system_alert(&self, summary: &str, severity: &str) -> Result<(), AlertError> {
        let mut labels = HashMap::new();
        labels.insert("alertname".to_string(), ALERTNAME_SYSTEM_EVENT.to_string());
        labels.insert("severity".to_string(), severity.to_string());
        let payload = json!({
            "labels": labels,
            "annotations": { "summary": summary },
            "startsAt": rfc3339(SystemTime::now()),
        });
        self.post_alert(payload).await
    }
}

/// Build the configured sink, falling back to [`NullAlertSink`] when no
/// URL is set.
pub fn build_alert_sink(config: &AlertManagerConfig) -> Arc<dyn AlertSink> {
    match AlertmanagerSink::new(config) {
        Some(sink) => Arc::new(sink),
        None => Arc::new(NullAlertSink),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_sink_is_a_no_op_for_every_call() {
        let sink = NullAlertSink;
        let id = IncidentId::new();
        sink.send_initial_alert(id, "boom", "high", &HashMap::new()).await.unwrap();
        sink.send_enriched_analysis(id, "root cause found", "resolved").await.unwrap();
        sink.send_system_alert("worker crashed", "warning").await.unwrap();
    }

    #[test]
    fn build_alert_sink_falls_back_to_null_without_url() {
        let config = AlertManagerConfig { url: None };
        // Can't downcast easily; just assert construction doesn't panic.
        let _sink = build_alert_sink(&config);
    }
}
