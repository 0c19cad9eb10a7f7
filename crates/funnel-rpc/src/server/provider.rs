//! Outbound dispatch to the messaging provider's Graph-style API.
//!
//! Only this layer talks to the provider. Template selection for outside the
//! 24 h session window is the provider account's concern; the core always
//! submits plain text here.

use std::time::Duration;
use tracing::{info, warn};

use funnel_core::types::Tenant;

const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider API error ({status}): {message}")]
    Api { status: u16, message: String },
}

pub struct ProviderClient {
    client: reqwest::Client,
    base_url: String,
}

impl ProviderClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub async fn send_text(
        &self,
        tenant: &Tenant,
        to_phone: &str,
        text: &str,
    ) -> Result<(), ProviderError> {
        let url = format!("{}/{}/messages", self.base_url, tenant.phone_number_id);
        let body = serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to_phone,
            "type": "text",
            "text": { "body": text },
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&tenant.access_token)
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            warn!(tenant_id = tenant.id, status, body = %message, "provider send failed");
            return Err(ProviderError::Api { status, message });
        }

        info!(tenant_id = tenant.id, to = %to_phone, chars = text.len(), "outbound message sent");
        Ok(())
    }
}
