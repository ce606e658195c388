use std::time::Duration;

use bytes::Bytes;
use portal_common::config::ApiConfig;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use crate::ControllerError;

/// Client for the recognition service that decides who gets in.
///
/// Evidence (a photo or typed text) is POSTed to the base URL; the verdict
/// for the last submission is read from `<base_url>/result`. Every failure
/// counts as "no": the gate stays closed.
#[derive(Debug, Clone)]
pub struct DecisionClient {
    client: reqwest::Client,
    base_url: String,
    result_url: String,
}

impl DecisionClient {
    pub fn new(config: &ApiConfig) -> Result<Self, ControllerError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(ControllerError::HttpClient)?;
        let base_url = config.base_url.trim_end_matches('/').to_string();
        Ok(Self {
            client,
            result_url: format!("{base_url}/result"),
            base_url,
        })
    }

    pub async fn submit_text(&self, text: &str) -> bool {
        info!(text, "submitting text");
        self.post("text/plain; charset=utf-8", Bytes::copy_from_slice(text.as_bytes()))
            .await
    }

    pub async fn submit_image(&self, jpeg: Bytes) -> bool {
        if jpeg.is_empty() {
            warn!("no photo to submit");
            return false;
        }
        info!(bytes = jpeg.len(), url = %self.base_url, "submitting photo");
        self.post("image/jpeg", jpeg).await
    }

    async fn post(&self, content_type: &'static str, body: Bytes) -> bool {
        match self
            .client
            .post(&self.base_url)
            .header(CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
        {
            Ok(response) if response.status() == StatusCode::OK => {
                debug!("submission accepted");
                true
            }
            Ok(response) => {
                warn!(status = response.status().as_u16(), "submission rejected");
                false
            }
            Err(e) => {
                warn!(error = %e, "submission failed");
                false
            }
        }
    }

    /// Whether the service granted access for the last submission.
    pub async fn fetch_verdict(&self) -> bool {
        let response = match self.client.get(&self.result_url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "verdict request failed");
                return false;
            }
        };
        if response.status() != StatusCode::OK {
            warn!(status = response.status().as_u16(), "verdict request rejected");
            return false;
        }
        match response.text().await {
            Ok(body) => {
                let verdict = body.trim();
                info!(verdict, "verdict received");
                verdict == "true" || verdict == "1"
            }
            Err(e) => {
                warn!(error = %e, "failed to read verdict");
                false
            }
        }
    }
}
