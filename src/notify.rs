//! Run notifications.
//!
//! Every run emits a summary through `tracing`; when a webhook is configured
//! the summary and any issue event are also POSTed as JSON. Delivery
//! problems are logged and never change the run's outcome.

use anyhow::Result;
use std::time::Duration;

use crate::config::NotificationsConfig;
use crate::ledger::IssueEvent;
use crate::pipeline::RunReport;

const WEBHOOK_TIMEOUT_SECS: u64 = 30;

pub struct Notifier {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(config: &NotificationsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(WEBHOOK_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            webhook_url: config.webhook_url.clone(),
            client,
        })
    }

    pub async fn send(&self, report: &RunReport, issue: Option<&IssueEvent>) {
        tracing::info!(
            run_id = %report.run_id,
            outcome = %report.outcome.label(),
            summary = %report.summary(),
            "run finished"
        );
        match issue {
            Some(IssueEvent::Opened { issue }) => {
                tracing::error!(issue = issue.id, title = %issue.title, "issue opened")
            }
            Some(IssueEvent::Updated { issue }) => tracing::error!(
                issue = issue.id,
                occurrences = issue.occurrences,
                "issue still open"
            ),
            Some(IssueEvent::Closed { issue_id, .. }) => {
                tracing::info!(issue = *issue_id, "issue closed")
            }
            None => {}
        }

        let Some(url) = &self.webhook_url else {
            return;
        };
        let body = payload(report, issue);
        match self.client.post(url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(url = %url, "webhook delivered")
            }
            Ok(resp) => tracing::warn!(url = %url, status = %resp.status(), "webhook rejected"),
            Err(e) => tracing::warn!(url = %url, error = %e, "webhook delivery failed"),
        }
    }
}

fn payload(report: &RunReport, issue: Option<&IssueEvent>) -> serde_json::Value {
    serde_json::json!({
        "run_id": report.run_id,
        "outcome": report.outcome.label(),
        "exit_code": report.outcome.exit_code(),
        "summary": report.summary(),
        "release_id": report.release_id,
        "source_version": report.source_version,
        "issue": issue,
    })
}
