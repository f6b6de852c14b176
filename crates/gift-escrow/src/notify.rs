//! Claim notifications.

use crate::config::EmailConfig;
use crate::error::GiftError;
use crate::pricing::format_usd;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::ExposeSecret;
use serde::Serialize;
use tracing::{info, instrument};

/// Claim link for a token: `{base}/claim/{token}`.
pub fn claim_url(base_url: &str, claim_token: &str) -> String {
    format!("{}/claim/{}", base_url.trim_end_matches('/'), claim_token)
}

/// Everything the recipient's e-mail needs.
#[derive(Debug, Clone)]
pub struct ClaimNotice {
    pub gift_id: String,
    pub to: String,
    pub recipient_name: Option<String>,
    pub sender_name: Option<String>,
    pub message: Option<String>,
    pub face_value_usd: u64,
    pub claim_url: String,
}

impl ClaimNotice {
    pub fn subject(&self) -> String {
        match &self.sender_name {
            Some(name) => format!("{} sent you a {} gift", name, format_usd(self.face_value_usd)),
            None => format!("You received a {} gift", format_usd(self.face_value_usd)),
        }
    }

    pub fn text_body(&self) -> String {
        let mut body = format!(
            "Hi {},\n\n{}.\n",
            self.recipient_name.as_deref().unwrap_or("there"),
            self.subject()
        );
        if let Some(message) = &self.message {
            body.push_str(&format!("\n\"{}\"\n", message));
        }
        body.push_str(&format!(
            "\nClaim it here: {}\n\nSign in with this e-mail address to claim. \
             Unclaimed gifts are returned to the sender after 48 hours.\n",
            self.claim_url
        ));
        body
    }

    pub fn html_body(&self) -> String {
        let mut html = format!(
            "<p>Hi {},</p><p>{}.</p>",
            escape_html(self.recipient_name.as_deref().unwrap_or("there")),
            escape_html(&self.subject())
        );
        if let Some(message) = &self.message {
            html.push_str(&format!("<blockquote>{}</blockquote>", escape_html(message)));
        }
        html.push_str(&format!(
            "<p><a href=\"{0}\">Claim your gift</a></p>\
             <p>Sign in with this e-mail address to claim. \
             Unclaimed gifts are returned to the sender after 48 hours.</p>",
            escape_html(&self.claim_url)
        ));
        html
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send the claim e-mail. Never log the claim URL: it is the capability.
    async fn send_claim(&self, notice: &ClaimNotice) -> Result<(), GiftError>;
}

/// Transactional e-mail over HTTP (`POST {api_url}/emails`).
pub struct EmailNotifier {
    client: Client,
    config: EmailConfig,
}

#[derive(Debug, Serialize)]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: Vec<&'a str>,
    subject: String,
    html: String,
    text: String,
}

impl EmailNotifier {
    pub fn new(config: EmailConfig) -> Result<Self, GiftError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GiftError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    #[instrument(skip(self, notice), fields(gift_id = %notice.gift_id))]
    async fn send_claim(&self, notice: &ClaimNotice) -> Result<(), GiftError> {
        let api_key = self
            .config
            .api_key
            .as_ref()
            .ok_or_else(|| GiftError::Config("email.api_key is not set".to_string()))?;

        let body = SendEmailRequest {
            from: &self.config.from,
            to: vec![&notice.to],
            subject: notice.subject(),
            html: notice.html_body(),
            text: notice.text_body(),
        };

        let response = self
            .client
            .post(format!("{}/emails", self.config.api_url.trim_end_matches('/')))
            .bearer_auth(api_key.expose_secret())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            info!("Claim e-mail sent");
            return Ok(());
        }

        let message = response.text().await.unwrap_or_default();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Err(GiftError::NetworkError(format!("E-mail API returned {}", status)))
        } else {
            Err(GiftError::Provider(format!(
                "E-mail API returned {}: {}",
                status, message
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn notice() -> ClaimNotice {
        ClaimNotice {
            gift_id: "gift-1".into(),
            to: "bob@example.com".into(),
            recipient_name: Some("Bob".into()),
            sender_name: Some("Alice".into()),
            message: Some("Happy <birthday>!".into()),
            face_value_usd: 50_000_000,
            claim_url: claim_url("https://gifts.example.com/", "tok"),
        }
    }

    #[test]
    fn test_claim_url() {
        assert_eq!(
            claim_url("https://gifts.example.com/", "abc"),
            "https://gifts.example.com/claim/abc"
        );
    }

    #[test]
    fn test_bodies_escape_user_input() {
        let notice = notice();
        assert_eq!(notice.subject(), "Alice sent you a $50.00 gift");
        assert!(notice.html_body().contains("Happy &lt;birthday&gt;!"));
        assert!(notice.text_body().contains("https://gifts.example.com/claim/tok"));
    }

    #[tokio::test]
    async fn test_send_claim() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/emails"))
            .and(header("Authorization", "Bearer re_test"))
            .and(body_partial_json(serde_json::json!({
                "to": ["bob@example.com"],
                "subject": "Alice sent you a $50.00 gift"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": "email-1" })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let notifier = EmailNotifier::new(EmailConfig {
            api_url: mock_server.uri(),
            api_key: Some(secrecy::SecretString::new("re_test".into())),
            from: "Gifts <gifts@example.com>".into(),
            timeout: Duration::from_secs(5),
        })
        .unwrap();

        notifier.send_claim(&notice()).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_send_is_provider_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/emails"))
            .respond_with(ResponseTemplate::new(422).set_body_string("invalid recipient"))
            .mount(&mock_server)
            .await;

        let notifier = EmailNotifier::new(EmailConfig {
            api_url: mock_server.uri(),
            api_key: Some(secrecy::SecretString::new("re_test".into())),
            from: "Gifts <gifts@example.com>".into(),
            timeout: Duration::from_secs(5),
        })
        .unwrap();

        let err = notifier.send_claim(&notice()).await.unwrap_err();
        assert!(matches!(err, GiftError::Provider(_)));
    }
}
