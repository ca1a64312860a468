//! Webhook subscriber channel.
//!
//! Statically configured subscribers that receive each batch as one HTTP
//! request, with customizable body templates and headers.

use crate::config::{SecretString, WebhookSubscriberConfig, resolve_env_vars};
use crate::error::{ConfigError, DeliveryError};
use crate::notify::{AlertBatch, SubscriberChannel};
use async_trait::async_trait;
use minijinja::{Environment, context};
use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use std::str::FromStr;
use tracing::Instrument;

/// HTTP delivery channel.
///
/// Each `send` is a single request. There is no internal retry: any failure
/// (network error, 4xx or 5xx) is returned to the dispatcher, which requeues
/// the batch for the next cycle.
///
/// A webhook has no liveness signal, so it stays registered for the process
/// lifetime.
pub struct WebhookChannel {
    /// Subscriber name, for logs.
    name: String,
    /// HTTP client (shared, connection pooling).
    client: reqwest::Client,
    url: SecretString,
    method: Method,
    /// Headers to include in requests (secrets resolved).
    headers: HeaderMap,
    /// Body template source (if configured).
    body_template_source: Option<String>,
}

/// Validate a body template at configuration time.
pub(crate) fn validate_body_template(source: &str) -> Result<(), String> {
    let mut env = Environment::new();
    env.add_template("_validate", source)
        .map_err(|e| e.to_string())?;
    Ok(())
}

/// Render a body template with batch context.
///
/// Templates see `alerts` (list of events), `count`, `sent_at` and
/// `subscriber`.
fn render_body_template(
    source: &str,
    batch: &AlertBatch,
    subscriber: &str,
) -> Result<String, DeliveryError> {
    let mut env = Environment::new();
    env.add_template("body", source)
        .map_err(|e| DeliveryError::Serialization(format!("template error: {}", e)))?;

    let tmpl = env
        .get_template("body")
        .map_err(|e| DeliveryError::Serialization(format!("template error: {}", e)))?;

    tmpl.render(context! {
        alerts => &batch.alerts,
        count => batch.alerts.len(),
        sent_at => batch.sent_at.to_rfc3339(),
        subscriber => subscriber,
    })
    .map_err(|e| DeliveryError::Serialization(format!("template render error: {}", e)))
}

impl WebhookChannel {
    /// Create a WebhookChannel from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidSubscriber`] if URL or header env
    /// resolution fails, the method is not POST/PUT, a header is invalid, or
    /// the body template does not compile.
    pub fn from_config(
        name: &str,
        config: &WebhookSubscriberConfig,
        client: reqwest::Client,
    ) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidSubscriber {
            name: name.to_string(),
            message,
        };

        let resolved_url =
            resolve_env_vars(&config.url).map_err(|e| invalid(format!("url: {}", e)))?;

        let method_upper = config.method.to_uppercase();
        if method_upper != "POST" && method_upper != "PUT" {
            return Err(invalid(format!(
                "unsupported method '{}': only POST and PUT are supported",
                config.method
            )));
        }
        let method = Method::from_str(&method_upper)
            .map_err(|_| invalid(format!("invalid method: {}", config.method)))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (key, value) in &config.headers {
            let resolved_value = resolve_env_vars(value)
                .map_err(|e| invalid(format!("header '{}': {}", key, e)))?;

            let header_name = HeaderName::from_str(key)
                .map_err(|_| invalid(format!("invalid header name: {}", key)))?;

            let header_value = HeaderValue::from_str(&resolved_value)
                .map_err(|_| invalid(format!("invalid header value for '{}'", key)))?;

            headers.insert(header_name, header_value);
        }

        let body_template_source = match &config.body_template {
            Some(template_str) => {
                validate_body_template(template_str)
                    .map_err(|e| invalid(format!("body_template: {}", e)))?;
                Some(template_str.clone())
            }
            None => None,
        };

        Ok(Self {
            name: name.to_string(),
            client,
            url: SecretString::new(resolved_url),
            method,
            headers,
            body_template_source,
        })
    }

    fn build_body(&self, batch: &AlertBatch) -> Result<String, DeliveryError> {
        match &self.body_template_source {
            Some(source) => render_body_template(source, batch, &self.name),
            None => serde_json::to_string(batch)
                .map_err(|e| DeliveryError::Serialization(format!("JSON serialization error: {}", e))),
        }
    }

    /// Get the resolved URL (for testing).
    #[cfg(test)]
    pub fn url(&self) -> &str {
        self.url.expose()
    }

    /// Get the HTTP method (for testing).
    #[cfg(test)]
    pub fn method(&self) -> &Method {
        &self.method
    }
}

#[async_trait]
impl SubscriberChannel for WebhookChannel {
    fn channel_type(&self) -> &str {
        "webhook"
    }

    fn is_open(&self) -> bool {
        true
    }

    async fn send(&self, batch: &AlertBatch) -> Result<(), DeliveryError> {
        let span = tracing::debug_span!(
            "send_webhook",
            subscriber = %self.name,
            batch_size = batch.len()
        );

        async {
            let body = self.build_body(batch)?;
            tracing::trace!(body_len = body.len(), "Request body built");

            let response = self
                .client
                .request(self.method.clone(), self.url.expose())
                .headers(self.headers.clone())
                .body(body)
                .send()
                .await
                .map_err(|e| DeliveryError::SendFailed(e.to_string()))?;

            let status = response.status();
            if status.is_success() {
                tracing::debug!(status = %status, "Webhook batch delivered");
                Ok(())
            } else {
                tracing::warn!(status = %status, "Webhook rejected batch");
                Err(DeliveryError::SendFailed(format!("HTTP {}", status)))
            }
        }
        .instrument(span)
        .await
    }

    async fn closed(&self) {
        std::future::pending::<()>().await
    }
}

impl std::fmt::Debug for WebhookChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // URL and headers may carry credentials.
        f.debug_struct("WebhookChannel")
            .field("name", &self.name)
            .field("method", &self.method.as_str())
            .field("has_body_template", &self.body_template_source.is_some())
            .finish()
    }
}
