//! Remote capability providers
//!
//! Every external capability is served by one HTTP endpoint:
//! `POST {base}/api/v1/capabilities/{name}` with `{"capability", "arguments"}`.

use super::{Capability, CapabilityRequest};
use crate::error::OrchestrationError;
use crate::Result;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

/// Shared connection pool for the remote capability service
#[derive(Clone)]
pub struct CapabilityApiClient {
    client: Client,
    base_url: String,
}

impl CapabilityApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .build()
            .map_err(|e| {
                OrchestrationError::Configuration(format!("cannot build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self, capability: &str) -> String {
        format!("{}/api/v1/capabilities/{}", self.base_url, capability)
    }

    async fn post_json(&self, capability: &str, body: &Value) -> Result<Value> {
        let url = self.endpoint(capability);

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| OrchestrationError::CapabilityFailure {
                capability: capability.to_string(),
                cause: format!("request to {} failed: {}", url, e),
            })?;

        let status = response.status();
        let body = response
            .json::<Value>()
            .await
            .map_err(|e| OrchestrationError::CapabilityFailure {
                capability: capability.to_string(),
                cause: format!("invalid JSON response: {}", e),
            })?;

        if !status.is_success() {
            return Err(OrchestrationError::CapabilityFailure {
                capability: capability.to_string(),
                cause: format!("service returned {}: {}", status, body),
            });
        }

        Ok(body)
    }
}

/// Forwards one capability to the remote service
pub struct HttpCapability {
    client: CapabilityApiClient,
}

impl HttpCapability {
    pub fn new(client: CapabilityApiClient) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Capability for HttpCapability {
    async fn invoke(&self, request: &CapabilityRequest) -> Result<Value> {
        let body = json!({
            "capability": request.capability,
            "arguments": request.arguments_object(),
        });
        self.client.post_json(&request.capability, &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tokio_test::assert_err;

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let client = CapabilityApiClient::new("http://localhost:9000/").unwrap();
        assert_eq!(
            client.endpoint("historical_prices"),
            "http://localhost:9000/api/v1/capabilities/historical_prices"
        );
    }

    #[tokio::test]
    async fn test_unreachable_service_is_capability_failure() {
        // Port 9 (discard) is not expected to host an HTTP service.
        let capability = HttpCapability::new(CapabilityApiClient::new("http://127.0.0.1:9").unwrap());
        let request = CapabilityRequest::new("industry_trends").arg("ticker", json!("AAPL"));

        let err = assert_err!(capability.invoke(&request).await);
        assert_eq!(err.kind(), ErrorKind::CapabilityFailure);
        assert_eq!(err.capability(), Some("industry_trends"));
    }
}
