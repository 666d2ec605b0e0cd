use anyhow::Result;
use async_trait::async_trait;
use metrics::counter;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;
use tracing::{debug, error};

use flapwatch_lib::flap::FlapSnapshot;
use flapwatch_lib::notifier::Sink;

use crate::config::NotifyConfig;

pub const WEBHOOK_USER_AGENT: &str = "flapwatch-webhook";

/// POSTs every event as JSON to the configured URLs. Failed calls are logged
/// and not retried.
pub struct WebhookSink {
    client: reqwest::Client,
    start: Vec<String>,
    end: Vec<String>,
}

impl WebhookSink {
    pub fn new(cfg: &NotifyConfig) -> Result<WebhookSink> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static(WEBHOOK_USER_AGENT));
        if let Some(name) = &cfg.webhook_instance_name {
            headers.insert("X-Instance-Name", HeaderValue::from_str(name)?);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(cfg.webhook_timeout)
            .build()?;

        Ok(WebhookSink {
            client,
            start: cfg.webhook_start.clone(),
            end: cfg.webhook_end.clone(),
        })
    }

    async fn call(&self, url: &str, event: &FlapSnapshot) {
        let resp = self.client.post(url).json(event).send().await;

        match resp {
            Ok(resp) if resp.status() == StatusCode::OK => {
                counter!("flapwatch_webhook_requests_total", "status" => "ok").increment(1);
                debug!("webhook {} accepted {}", url, event.prefix);
            }
            Ok(resp) => {
                counter!("flapwatch_webhook_requests_total", "status" => "rejected").increment(1);
                error!(
                    "webhook {} returned {} for {}",
                    url,
                    resp.status(),
                    event.prefix
                );
            }
            Err(e) => {
                counter!("flapwatch_webhook_requests_total", "status" => "failed").increment(1);
                error!("failed to send webhook {} for {}: {}", url, event.prefix, e);
            }
        }
    }
}

#[async_trait]
impl Sink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn on_ready(&self) -> bool {
        !self.start.is_empty() || !self.end.is_empty()
    }

    async fn on_flap_start(&self, event: &FlapSnapshot) {
        for url in &self.start {
            self.call(url, event).await;
        }
    }

    async fn on_flap_end(&self, event: &FlapSnapshot) {
        for url in &self.end {
            self.call(url, event).await;
        }
    }
}
