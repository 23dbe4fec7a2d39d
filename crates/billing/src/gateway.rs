//! Payment gateway client
//!
//! The engine talks to the payment processor through the narrow
//! [`PaymentGateway`] capability. The gateway is treated as unreliable:
//! every call is a blocking network round trip with a timeout, and a
//! timed-out call is an *unknown outcome* — the true result is reconciled by
//! the next sweep or the corresponding webhook, so a timeout must never be
//! treated as a hard decline.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

/// Transport and API failures from the gateway
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The request timed out; the charge may or may not have gone through
    #[error("Gateway request timed out")]
    Timeout,

    /// Connection-level failure (refused, DNS); the request never reached
    /// the gateway
    #[error("Gateway connection failed: {0}")]
    Connect(String),

    /// The gateway answered with an error status
    #[error("Gateway API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// The gateway processed the request and declined the charge
    #[error("Charge declined: {0}")]
    Declined(String),

    /// The gateway answered with a body the client could not interpret
    #[error("Invalid gateway response: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    /// Whether the real outcome is unknown (timeouts, gateway-side 5xx).
    /// Unknown outcomes must not mark a subscription past due; the next
    /// sweep or webhook reconciles the truth.
    pub fn is_unknown_outcome(&self) -> bool {
        match self {
            GatewayError::Timeout => true,
            GatewayError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Status the gateway reports for a charge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChargeStatus {
    Pending,
    Succeeded,
    Failed,
}

impl ChargeStatus {
    fn parse(s: &str) -> ChargeStatus {
        match s {
            "succeeded" | "paid" => ChargeStatus::Succeeded,
            "failed" => ChargeStatus::Failed,
            _ => ChargeStatus::Pending,
        }
    }
}

/// Result of a charge request or lookup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeOutcome {
    /// Gateway charge/payment reference id
    pub id: String,
    pub status: ChargeStatus,
    /// Raw gateway response for the ledger metadata
    pub raw: serde_json::Value,
}

/// A charge against a stored customer/payment method or a chargeable source
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    /// Smallest currency unit
    pub amount_cents: i64,
    pub currency: String,
    /// Gateway customer id or e-wallet source id
    pub customer_or_source: String,
    /// Carried to the gateway and echoed back on webhooks; includes the
    /// subscription id and billing period so retries do not double-charge
    pub metadata: HashMap<String, String>,
}

impl ChargeRequest {
    /// Idempotency key sent to the gateway, derived from the subscription
    /// and billing-period metadata when present
    pub fn idempotency_key(&self) -> Option<String> {
        let sub = self.metadata.get("subscription_id")?;
        let period = self.metadata.get("billing_period")?;
        Some(format!("{}:{}", sub, period))
    }
}

#[derive(Debug, Clone)]
pub struct CreateCustomerRequest {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentMethodDetails {
    /// Gateway payment method type, e.g. "card", "gcash"
    pub method_type: String,
    /// Gateway token for the method details; raw card data never transits
    /// the engine
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachOutcome {
    pub status: String,
}

/// Narrow capability the engine consumes from the payment processor
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_customer(&self, req: CreateCustomerRequest) -> Result<String, GatewayError>;

    async fn charge(&self, req: ChargeRequest) -> Result<ChargeOutcome, GatewayError>;

    async fn attach_payment_method(
        &self,
        intent_id: &str,
        method: PaymentMethodDetails,
    ) -> Result<AttachOutcome, GatewayError>;

    /// Look up an existing charge; used to verify caller-supplied payment
    /// references before trusting them
    async fn retrieve_charge(&self, charge_id: &str) -> Result<ChargeOutcome, GatewayError>;
}

/// Gateway connection settings
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub secret_key: String,
    pub webhook_secret: String,
    /// ISO currency code used for all charges
    pub currency: String,
    pub request_timeout: Duration,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, crate::error::BillingError> {
        use crate::error::BillingError;

        let base_url = std::env::var("PAYMENT_GATEWAY_URL")
            .unwrap_or_else(|_| "https://api.paymongo.com/v1".to_string());
        let secret_key = std::env::var("PAYMENT_GATEWAY_SECRET_KEY")
            .map_err(|_| BillingError::Config("PAYMENT_GATEWAY_SECRET_KEY must be set".to_string()))?;
        let webhook_secret = std::env::var("PAYMENT_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("PAYMENT_WEBHOOK_SECRET must be set".to_string()))?;
        let currency = std::env::var("BILLING_CURRENCY").unwrap_or_else(|_| "PHP".to_string());
        let request_timeout = std::env::var("GATEWAY_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(15));

        Ok(Self {
            base_url,
            secret_key,
            webhook_secret,
            currency,
            request_timeout,
        })
    }
}

/// REST implementation over the gateway's HTTP API
#[derive(Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn map_transport_error(e: reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            GatewayError::Timeout
        } else if e.is_connect() {
            GatewayError::Connect(e.to_string())
        } else {
            GatewayError::InvalidResponse(e.to_string())
        }
    }

    async fn parse_response(response: reqwest::Response) -> Result<serde_json::Value, GatewayError> {
        let status = response.status().as_u16();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;

        if status >= 400 {
            let message = body
                .pointer("/errors/0/detail")
                .and_then(|v| v.as_str())
                .unwrap_or("unspecified gateway error")
                .to_string();
            return Err(GatewayError::Api { status, message });
        }
        Ok(body)
    }

    fn charge_outcome_from(body: serde_json::Value) -> Result<ChargeOutcome, GatewayError> {
        let id = body
            .pointer("/data/id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::InvalidResponse("missing charge id".to_string()))?
            .to_string();
        let status = body
            .pointer("/data/attributes/status")
            .and_then(|v| v.as_str())
            .map(ChargeStatus::parse)
            .ok_or_else(|| GatewayError::InvalidResponse("missing charge status".to_string()))?;
        Ok(ChargeOutcome {
            id,
            status,
            raw: body,
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_customer(&self, req: CreateCustomerRequest) -> Result<String, GatewayError> {
        let url = format!("{}/customers", self.config.base_url);
        let payload = serde_json::json!({
            "data": {
                "attributes": {
                    "name": req.name,
                    "email": req.email,
                    "phone": req.phone,
                    "metadata": req.metadata,
                }
            }
        });

        // Customer creation is idempotent on the gateway side; bounded retry
        // on connection-level failures only.
        let strategy = ExponentialBackoff::from_millis(200).map(jitter).take(2);
        let body = RetryIf::spawn(
            strategy,
            || async {
                let response = self
                    .client
                    .post(&url)
                    .basic_auth(&self.config.secret_key, Option::<&str>::None)
                    .json(&payload)
                    .send()
                    .await
                    .map_err(Self::map_transport_error)?;
                Self::parse_response(response).await
            },
            |e: &GatewayError| matches!(e, GatewayError::Connect(_)),
        )
        .await?;

        body.pointer("/data/id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| GatewayError::InvalidResponse("missing customer id".to_string()))
    }

    async fn charge(&self, req: ChargeRequest) -> Result<ChargeOutcome, GatewayError> {
        let url = format!("{}/payments", self.config.base_url);
        let payload = serde_json::json!({
            "data": {
                "attributes": {
                    "amount": req.amount_cents,
                    "currency": req.currency,
                    "source": { "id": req.customer_or_source },
                    "metadata": req.metadata,
                }
            }
        });

        let mut request = self
            .client
            .post(&url)
            .basic_auth(&self.config.secret_key, Option::<&str>::None)
            .json(&payload);
        if let Some(key) = req.idempotency_key() {
            request = request.header("Idempotency-Key", key);
        }

        let response = request.send().await.map_err(Self::map_transport_error)?;
        let outcome = Self::charge_outcome_from(Self::parse_response(response).await?)?;

        if outcome.status == ChargeStatus::Failed {
            let reason = outcome
                .raw
                .pointer("/data/attributes/failed_message")
                .and_then(|v| v.as_str())
                .unwrap_or("charge failed")
                .to_string();
            return Err(GatewayError::Declined(reason));
        }
        Ok(outcome)
    }

    async fn attach_payment_method(
        &self,
        intent_id: &str,
        method: PaymentMethodDetails,
    ) -> Result<AttachOutcome, GatewayError> {
        let url = format!("{}/payment_intents/{}/attach", self.config.base_url, intent_id);
        let payload = serde_json::json!({
            "data": { "attributes": { "payment_method": method } }
        });

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.config.secret_key, Option::<&str>::None)
            .json(&payload)
            .send()
            .await
            .map_err(Self::map_transport_error)?;
        let body = Self::parse_response(response).await?;

        let status = body
            .pointer("/data/attributes/status")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::InvalidResponse("missing intent status".to_string()))?
            .to_string();
        Ok(AttachOutcome { status })
    }

    async fn retrieve_charge(&self, charge_id: &str) -> Result<ChargeOutcome, GatewayError> {
        let url = format!("{}/payments/{}", self.config.base_url, charge_id);
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.config.secret_key, Option::<&str>::None)
            .send()
            .await
            .map_err(Self::map_transport_error)?;
        Self::charge_outcome_from(Self::parse_response(response).await?)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted gateway double for engine tests

    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Mock gateway: outcomes are scripted per call; unscripted charges
    /// succeed with a generated reference. All charges are remembered so
    /// `retrieve_charge` can verify references.
    #[derive(Default)]
    pub struct MockGateway {
        scripted: Mutex<Vec<Result<ChargeOutcome, GatewayError>>>,
        pub charges: Mutex<Vec<ChargeRequest>>,
        known: Mutex<HashMap<String, ChargeOutcome>>,
        counter: AtomicU64,
    }

    impl MockGateway {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue the outcome for the next charge call (FIFO)
        pub fn script_charge(&self, outcome: Result<ChargeOutcome, GatewayError>) {
            self.scripted.lock().unwrap().push(outcome);
        }

        pub fn script_decline(&self, reason: &str) {
            self.script_charge(Err(GatewayError::Declined(reason.to_string())));
        }

        pub fn script_timeout(&self) {
            self.script_charge(Err(GatewayError::Timeout));
        }

        /// Register a charge as already existing on the gateway (for
        /// out-of-band reference verification)
        pub fn register_charge(&self, id: &str, status: ChargeStatus) {
            self.known.lock().unwrap().insert(
                id.to_string(),
                ChargeOutcome {
                    id: id.to_string(),
                    status,
                    raw: serde_json::json!({}),
                },
            );
        }

        pub fn charge_count(&self) -> usize {
            self.charges.lock().unwrap().len()
        }

        fn next_reference(&self) -> String {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            format!("pay_mock_{n}")
        }
    }

    #[async_trait]
    impl PaymentGateway for MockGateway {
        async fn create_customer(
            &self,
            _req: CreateCustomerRequest,
        ) -> Result<String, GatewayError> {
            Ok("cus_mock".to_string())
        }

        async fn charge(&self, req: ChargeRequest) -> Result<ChargeOutcome, GatewayError> {
            self.charges.lock().unwrap().push(req);
            let scripted = {
                let mut scripts = self.scripted.lock().unwrap();
                if scripts.is_empty() {
                    None
                } else {
                    Some(scripts.remove(0))
                }
            };
            let outcome = match scripted {
                Some(outcome) => outcome,
                None => Ok(ChargeOutcome {
                    id: self.next_reference(),
                    status: ChargeStatus::Succeeded,
                    raw: serde_json::json!({}),
                }),
            }?;
            self.known
                .lock()
                .unwrap()
                .insert(outcome.id.clone(), outcome.clone());
            Ok(outcome)
        }

        async fn attach_payment_method(
            &self,
            _intent_id: &str,
            _method: PaymentMethodDetails,
        ) -> Result<AttachOutcome, GatewayError> {
            Ok(AttachOutcome {
                status: "succeeded".to_string(),
            })
        }

        async fn retrieve_charge(&self, charge_id: &str) -> Result<ChargeOutcome, GatewayError> {
            self.known
                .lock()
                .unwrap()
                .get(charge_id)
                .cloned()
                .ok_or(GatewayError::Api {
                    status: 404,
                    message: format!("No such payment: {charge_id}"),
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn http_gateway_parses_successful_charge() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/payments")
            .match_header("idempotency-key", mockito::Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"data":{"id":"pay_123","attributes":{"status":"paid","amount":49900}}}"#,
            )
            .create_async()
            .await;

        let gateway = HttpGateway::new(GatewayConfig {
            base_url: server.url(),
            secret_key: "sk_test".to_string(),
            webhook_secret: "whsec_test".to_string(),
            currency: "PHP".to_string(),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap();

        let mut metadata = HashMap::new();
        metadata.insert("subscription_id".to_string(), "sub_1".to_string());
        metadata.insert("billing_period".to_string(), "2026-08-06".to_string());

        let outcome = gateway
            .charge(ChargeRequest {
                amount_cents: 49_900,
                currency: "PHP".to_string(),
                customer_or_source: "cus_1".to_string(),
                metadata,
            })
            .await
            .unwrap();

        assert_eq!(outcome.id, "pay_123");
        assert_eq!(outcome.status, ChargeStatus::Succeeded);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn http_gateway_maps_4xx_to_api_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/payments/pay_missing")
            .with_status(404)
            .with_body(r#"{"errors":[{"detail":"No such payment"}]}"#)
            .create_async()
            .await;

        let gateway = HttpGateway::new(GatewayConfig {
            base_url: server.url(),
            secret_key: "sk_test".to_string(),
            webhook_secret: "whsec_test".to_string(),
            currency: "PHP".to_string(),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap();

        let err = gateway.retrieve_charge("pay_missing").await.unwrap_err();
        assert!(!err.is_unknown_outcome());
        match err {
            GatewayError::Api { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message, "No such payment");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_outcome_classification() {
        assert!(GatewayError::Timeout.is_unknown_outcome());
        assert!(GatewayError::Api {
            status: 502,
            message: "bad gateway".to_string()
        }
        .is_unknown_outcome());
        assert!(!GatewayError::Connect("refused".to_string()).is_unknown_outcome());
        assert!(!GatewayError::Api {
            status: 402,
            message: "declined".to_string()
        }
        .is_unknown_outcome());
        assert!(!GatewayError::Declined("insufficient funds".to_string()).is_unknown_outcome());
    }

    #[test]
    fn idempotency_key_requires_both_parts() {
        let mut metadata = HashMap::new();
        metadata.insert("subscription_id".to_string(), "sub_1".to_string());
        let req = ChargeRequest {
            amount_cents: 100,
            currency: "PHP".to_string(),
            customer_or_source: "cus_1".to_string(),
            metadata: metadata.clone(),
        };
        assert_eq!(req.idempotency_key(), None);

        metadata.insert("billing_period".to_string(), "2026-08-06".to_string());
        let req = ChargeRequest { metadata, ..req };
        assert_eq!(req.idempotency_key(), Some("sub_1:2026-08-06".to_string()));
    }
}
