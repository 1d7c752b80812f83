//! Request and response envelopes.
//!
//! Payloads are opaque to the routing core: provider clients translate
//! `payload` to their own wire format.

use crate::error::ErrorClass;
use crate::types::{ProviderId, RequestId, TenantId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Gateway request routed to one of the providers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    /// Unique request identifier
    #[serde(default = "RequestId::generate")]
    pub id: RequestId,

    /// Tenant issuing the request
    pub tenant: TenantId,

    /// Target model (e.g., "gpt-4o", "text-embedding-3-small")
    pub model: String,

    /// Vendor-neutral request body
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Estimated token cost, consumed by token-bucket admission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_tokens: Option<u32>,

    /// Restrict routing to a single provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_provider: Option<ProviderId>,
}

impl GatewayRequest {
    /// Create a new builder for `GatewayRequest`
    #[must_use]
    pub fn builder() -> GatewayRequestBuilder {
        GatewayRequestBuilder::default()
    }

    /// Tokens a token-bucket policy should charge for this request
    #[must_use]
    pub fn tokens_required(&self) -> u32 {
        self.estimated_tokens.unwrap_or(1).max(1)
    }
}

/// Builder for [`GatewayRequest`]
#[derive(Debug, Default)]
pub struct GatewayRequestBuilder {
    tenant: Option<TenantId>,
    model: Option<String>,
    payload: serde_json::Value,
    estimated_tokens: Option<u32>,
    force_provider: Option<ProviderId>,
}

impl GatewayRequestBuilder {
    /// Set the tenant
    #[must_use]
    pub fn tenant(mut self, tenant: impl Into<TenantId>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    /// Set the model
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the payload
    #[must_use]
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set the estimated token cost
    #[must_use]
    pub fn estimated_tokens(mut self, tokens: u32) -> Self {
        self.estimated_tokens = Some(tokens);
        self
    }

    /// Pin the request to one provider
    #[must_use]
    pub fn force_provider(mut self, provider: impl Into<ProviderId>) -> Self {
        self.force_provider = Some(provider.into());
        self
    }

    /// Build the request
    ///
    /// # Errors
    /// Returns error if tenant or model is missing
    pub fn build(self) -> Result<GatewayRequest, crate::error::GatewayError> {
        let tenant = self
            .tenant
            .ok_or_else(|| crate::error::GatewayError::configuration("request tenant is required"))?;
        let model = self
            .model
            .filter(|m| !m.is_empty())
            .ok_or_else(|| crate::error::GatewayError::configuration("request model is required"))?;

        Ok(GatewayRequest {
            id: RequestId::generate(),
            tenant,
            model,
            payload: self.payload,
            estimated_tokens: self.estimated_tokens,
            force_provider: self.force_provider,
        })
    }
}

/// Token accounting reported by a provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens
    pub prompt_tokens: u32,
    /// Completion tokens
    pub completion_tokens: u32,
    /// Total tokens
    pub total_tokens: u32,
}

/// Response returned by a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    /// Provider that served the response
    pub provider: ProviderId,
    /// Model that produced the response
    pub model: String,
    /// Vendor-neutral response body
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Token usage, when reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// Outcome of a single provider attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    /// Provider attempted
    pub provider: ProviderId,
    /// Whether the attempt succeeded
    pub success: bool,
    /// Wall-clock latency of the attempt
    pub latency: Duration,
    /// Error classification for failed attempts
    pub error_class: Option<ErrorClass>,
}

impl RequestOutcome {
    /// Outcome of a successful attempt
    #[must_use]
    pub fn success(provider: ProviderId, latency: Duration) -> Self {
        Self {
            provider,
            success: true,
            latency,
            error_class: None,
        }
    }

    /// Outcome of a failed attempt
    #[must_use]
    pub fn failure(provider: ProviderId, latency: Duration, class: ErrorClass) -> Self {
        Self {
            provider,
            success: false,
            latency,
            error_class: Some(class),
        }
    }
}
