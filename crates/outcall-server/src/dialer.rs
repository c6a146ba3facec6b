//! Outbound call placement and live call control through the telephony
//! vendor's REST API.

use crate::config::TelephonyConfig;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the telephony REST API.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("telephony request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("telephony API rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("telephony credentials are not configured")]
    NotConfigured,
}

/// A call to be placed.
#[derive(Debug, Clone)]
pub struct OutboundCall {
    pub call_id: String,
    pub to: String,
    /// Webhook for the first turn.
    pub webhook_url: String,
    pub status_callback_url: String,
    pub record: bool,
}

/// Places calls and replaces the instructions of a live call.
#[async_trait]
pub trait CallControl: Send + Sync {
    /// Returns the vendor's call sid.
    async fn place_call(&self, call: &OutboundCall) -> Result<String, DialError>;

    /// Replaces what a live call is doing with a new voice document.
    async fn update_call(&self, sid: &str, twiml: &str) -> Result<(), DialError>;
}

#[derive(Deserialize)]
struct CallResource {
    sid: String,
}

pub struct TwilioDialer {
    client: reqwest::Client,
    config: TelephonyConfig,
}

impl TwilioDialer {
    pub fn new(config: TelephonyConfig) -> Result<Self, DialError> {
        if !config.can_dial() {
            return Err(DialError::NotConfigured);
        }
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client, config })
    }

    fn calls_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Calls",
            self.config.api_base_url.trim_end_matches('/'),
            self.config.account_sid
        )
    }

    async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<CallResource, DialError> {
        let response = self
            .client
            .post(url)
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DialError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<CallResource>().await?)
    }
}

#[async_trait]
impl CallControl for TwilioDialer {
    async fn place_call(&self, call: &OutboundCall) -> Result<String, DialError> {
        let url = format!("{}.json", self.calls_url());
        let mut form = vec![
            ("To", call.to.as_str()),
            ("From", self.config.from_number.as_str()),
            ("Url", call.webhook_url.as_str()),
            ("Method", "POST"),
            ("StatusCallback", call.status_callback_url.as_str()),
            ("StatusCallbackMethod", "POST"),
            ("StatusCallbackEvent", "initiated"),
            ("StatusCallbackEvent", "ringing"),
            ("StatusCallbackEvent", "answered"),
            ("StatusCallbackEvent", "completed"),
        ];
        if call.record {
            form.push(("Record", "true"));
        }

        let resource = self.post_form(&url, &form).await?;
        tracing::info!(call_id = %call.call_id, sid = %resource.sid, "outbound call placed");
        Ok(resource.sid)
    }

    async fn update_call(&self, sid: &str, twiml: &str) -> Result<(), DialError> {
        let url = format!("{}/{}.json", self.calls_url(), sid);
        self.post_form(&url, &[("Twiml", twiml)]).await?;
        tracing::debug!(sid = %sid, "live call updated");
        Ok(())
    }
}
