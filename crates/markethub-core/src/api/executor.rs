//! Sends one logical request, attaching the bearer token and recovering from
//! expired tokens.

use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use super::request::{RequestBody, RequestContext};
use super::ApiError;
use crate::auth::{Token, TokenManager};

/// Maximum number of retries after a 401.
/// Each retry forces a token refresh first, so two retries cover a token that
/// expired in transit plus one that was revoked server-side.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Executes requests with the retry-on-unauthorized policy.
///
/// Only 401 is retried, and only after the rejected token has been replaced.
/// Every other failure is returned on the first occurrence.
#[derive(Clone)]
pub struct RequestExecutor {
    client: Client,
    tokens: TokenManager,
    max_retries: u32,
}

impl RequestExecutor {
    pub fn new(client: Client, tokens: TokenManager, max_retries: u32) -> Self {
        Self {
            client,
            tokens,
            max_retries,
        }
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub async fn execute(&self, context: RequestContext) -> Result<Value, ApiError> {
        let mut context = context;

        loop {
            let token = self.tokens.get_token(false).await?;
            let response = self.send(&context, &token).await?;
            let status = response.status();

            if status != StatusCode::UNAUTHORIZED {
                return Self::read_body(response).await;
            }

            if context.attempt < self.max_retries {
                warn!(
                    method = %context.method,
                    url = %context.url,
                    attempt = context.attempt,
                    "Unauthorized, refreshing token and retrying"
                );
                self.tokens.refresh_rejected(&token).await?;
                context = context.next_attempt();
                continue;
            }

            warn!(
                method = %context.method,
                url = %context.url,
                attempts = context.attempt + 1,
                "Still unauthorized after refreshing, signing out"
            );
            self.tokens.sign_out();
            return Err(ApiError::Unauthorized);
        }
    }

    async fn send(&self, context: &RequestContext, token: &Token) -> Result<Response, ApiError> {
        debug!(method = %context.method, url = %context.url, attempt = context.attempt, "Sending request");

        let mut request = self
            .client
            .request(context.method.clone(), context.url.clone())
            .headers(context.headers.clone())
            .bearer_auth(token.value());

        request = match &context.body {
            RequestBody::Empty => request,
            RequestBody::Json(value) => request.body(value.to_string()),
            RequestBody::Multipart(body) => request.multipart(body.to_form()?),
        };

        Ok(request.send().await?)
    }

    /// Parse a final response: JSON on success, a classified error otherwise.
    async fn read_body(response: Response) -> Result<Value, ApiError> {
        let status = response.status();
        let url = response.url().clone();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = ApiError::from_status(status, &body);
            debug!(url = %url, status = status.as_u16(), error = %err, "Request rejected");
            return Err(err);
        }

        let bytes = response.bytes().await?;
        if status == StatusCode::NO_CONTENT || bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }

        serde_json::from_slice(&bytes).map_err(|e| {
            warn!(url = %url, error = %e, "Response body is not valid JSON");
            ApiError::MalformedResponse(format!("{} returned invalid JSON: {}", url.path(), e))
        })
    }
}
