use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Serialize;

use crate::job::ExecutionResult;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResultReport<'a> {
    submission_id: &'a str,
    #[serde(flatten)]
    result: &'a ExecutionResult,
}

/// Posts finished results to the Execution Service's internal endpoint
#[derive(Clone)]
pub struct ResultReporter {
    client: reqwest::Client,
    endpoint: String,
}

impl ResultReporter {
    pub fn new(api_base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/exec/internal/results", api_base_url.trim_end_matches('/')),
        })
    }

    pub async fn report(&self, submission_id: &str, result: &ExecutionResult) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&ResultReport {
                submission_id,
                result,
            })
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Result endpoint answered {status}: {body}");
        }

        log::info!("Reported {} for submission {submission_id}", result.status);
        Ok(())
    }
}
