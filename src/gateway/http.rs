use super::{ChargePurpose, ChargeRequest, ChargeSession, ChargeVerification, GatewayError, PaymentGateway};
use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Hosted payment gateway spoken to over JSON/HTTP
pub struct HttpPaymentGateway {
    base_url: Url,
    merchant_id: String,
    callback_url: String,
    client: Client,
}

#[derive(Serialize)]
struct CreateChargeBody<'a> {
    merchant_id: &'a str,
    amount: i64,
    callback_url: &'a str,
    description: String,
    metadata: serde_json::Value,
}

#[derive(Deserialize)]
struct CreateChargeResponse {
    reference: String,
    payment_url: String,
}

#[derive(Deserialize)]
struct ChargeStatusResponse {
    status: String,
    #[serde(default)]
    amount: i64,
    #[serde(default)]
    metadata: Option<ChargeMetadata>,
}

#[derive(Deserialize)]
struct ChargeMetadata {
    #[serde(default)]
    purpose: Option<ChargePurpose>,
    #[serde(default)]
    payer_user_id: Option<Uuid>,
    #[serde(default)]
    group_id: Option<Uuid>,
}

impl HttpPaymentGateway {
    pub fn new(
        base_url: impl Into<String>,
        merchant_id: impl Into<String>,
        callback_url: impl Into<String>,
    ) -> Result<Self, GatewayError> {
        let raw = base_url.into();
        let base_url = Url::parse(&raw)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| GatewayError::Rejected(format!("invalid gateway url {}", raw)))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::Unavailable(format!("client setup failed: {}", e)))?;

        Ok(Self {
            base_url,
            merchant_id: merchant_id.into(),
            callback_url: callback_url.into(),
            client,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, GatewayError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| GatewayError::Rejected(format!("invalid gateway url {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// 5xx means the gateway is having trouble; 4xx means it said no
    async fn check_status(response: Response) -> Result<Response, GatewayError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || status.as_u16() == 429 {
            Err(GatewayError::Unavailable(format!("{}: {}", status, body)))
        } else {
            Err(GatewayError::Rejected(format!("{}: {}", status, body)))
        }
    }
}

fn transport_error(err: reqwest::Error) -> GatewayError {
    GatewayError::Unavailable(err.to_string())
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeSession, GatewayError> {
        let body = CreateChargeBody {
            merchant_id: &self.merchant_id,
            amount: request.amount,
            callback_url: &self.callback_url,
            description: format!("{:?} payment", request.purpose).to_lowercase(),
            metadata: serde_json::json!({
                "payer_user_id": request.payer_user_id,
                "group_id": request.group_id,
                "purpose": request.purpose,
            }),
        };

        let response = self
            .client
            .post(self.endpoint(&["charges"])?)
            .header("Idempotency-Key", &request.idempotency_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!(key = %request.idempotency_key, "Gateway charge request failed: {}", e);
                transport_error(e)
            })?;

        let created: CreateChargeResponse = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("bad charge response: {}", e)))?;

        debug!(reference = %created.reference, amount = request.amount, "Gateway charge created");

        Ok(ChargeSession {
            reference: created.reference,
            payment_url: created.payment_url,
        })
    }

    async fn verify_charge(&self, reference: &str) -> Result<ChargeVerification, GatewayError> {
        let response = self
            .client
            .get(self.endpoint(&["charges", reference])?)
            .query(&[("merchant_id", self.merchant_id.as_str())])
            .send()
            .await
            .map_err(transport_error)?;

        let status: ChargeStatusResponse = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("bad verification response: {}", e)))?;

        let confirmed = status.status.eq_ignore_ascii_case("paid");
        let (purpose, payer_user_id, group_id) = status
            .metadata
            .map(|m| (m.purpose, m.payer_user_id, m.group_id))
            .unwrap_or((None, None, None));

        Ok(ChargeVerification {
            reference: reference.to_string(),
            confirmed,
            amount: if confirmed { status.amount } else { 0 },
            purpose,
            payer_user_id,
            group_id,
        })
    }
}
