//! API client for the marketplace REST API.
//!
//! This module provides the `ApiClient` struct with verb-shaped operations.
//! Every call goes through the `RequestExecutor`, which attaches the bearer
//! token and handles 401 recovery.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::endpoint::{EndpointResolver, QueryParams};
use super::executor::RequestExecutor;
use super::request::{MultipartBody, RequestBody, RequestContext, RequestOptions};
use super::ApiError;
use crate::auth::TokenManager;
use crate::config::Config;

/// API client for the marketplace backend.
/// Clone is cheap - reqwest::Client and TokenManager are both shared handles.
#[derive(Clone)]
pub struct ApiClient {
    resolver: EndpointResolver,
    executor: RequestExecutor,
}

impl ApiClient {
    /// Create a client for the configured base URL
    pub fn new(config: &Config, tokens: TokenManager) -> Result<Self> {
        let base_url = config.require_base_url()?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self::with_http_client(
            base_url,
            client,
            tokens,
            config.max_unauthorized_retries,
        ))
    }

    /// Create a client sharing an existing connection pool.
    pub fn with_http_client(
        base_url: impl Into<String>,
        client: Client,
        tokens: TokenManager,
        max_retries: u32,
    ) -> Self {
        Self {
            resolver: EndpointResolver::new(base_url),
            executor: RequestExecutor::new(client, tokens, max_retries),
        }
    }

    pub fn tokens(&self) -> &TokenManager {
        self.executor.tokens()
    }

    pub fn resolver(&self) -> &EndpointResolver {
        &self.resolver
    }

    /// Send any request. The verb helpers below all funnel into this.
    pub async fn send(
        &self,
        method: Method,
        endpoint: &str,
        body: RequestBody,
        params: &QueryParams,
        options: &RequestOptions,
    ) -> Result<Value, ApiError> {
        let url = self.resolver.url(endpoint, params)?;
        let context = RequestContext::new(method, url, body, options);
        self.executor.execute(context).await
    }

    fn parse<T: DeserializeOwned>(endpoint: &str, value: Value) -> Result<T, ApiError> {
        serde_json::from_value(value).map_err(|e| {
            ApiError::MalformedResponse(format!("Unexpected response shape from {}: {}", endpoint, e))
        })
    }

    // ===== Verbs =====
    //
    // Each verb has a `_with` form taking `RequestOptions`.

    pub async fn get(&self, endpoint: &str, params: &QueryParams) -> Result<Value, ApiError> {
        self.get_with(endpoint, params, &RequestOptions::default()).await
    }

    pub async fn get_with(
        &self,
        endpoint: &str,
        params: &QueryParams,
        options: &RequestOptions,
    ) -> Result<Value, ApiError> {
        self.send(Method::GET, endpoint, RequestBody::Empty, params, options)
            .await
    }

    pub async fn get_as<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &QueryParams,
    ) -> Result<T, ApiError> {
        let value = self.get(endpoint, params).await?;
        Self::parse(endpoint, value)
    }

    pub async fn post(&self, endpoint: &str, body: Value) -> Result<Value, ApiError> {
        self.post_with(endpoint, body, &RequestOptions::default()).await
    }

    pub async fn post_with(
        &self,
        endpoint: &str,
        body: Value,
        options: &RequestOptions,
    ) -> Result<Value, ApiError> {
        self.send_json(Method::POST, endpoint, body, options).await
    }

    pub async fn post_as<T: DeserializeOwned>(&self, endpoint: &str, body: Value) -> Result<T, ApiError> {
        let value = self.post(endpoint, body).await?;
        Self::parse(endpoint, value)
    }

    pub async fn put(&self, endpoint: &str, body: Value) -> Result<Value, ApiError> {
        self.put_with(endpoint, body, &RequestOptions::default()).await
    }

    pub async fn put_with(
        &self,
        endpoint: &str,
        body: Value,
        options: &RequestOptions,
    ) -> Result<Value, ApiError> {
        self.send_json(Method::PUT, endpoint, body, options).await
    }

    pub async fn patch(&self, endpoint: &str, body: Value) -> Result<Value, ApiError> {
        self.patch_with(endpoint, body, &RequestOptions::default()).await
    }

    pub async fn patch_with(
        &self,
        endpoint: &str,
        body: Value,
        options: &RequestOptions,
    ) -> Result<Value, ApiError> {
        self.send_json(Method::PATCH, endpoint, body, options).await
    }

    pub async fn delete(&self, endpoint: &str) -> Result<Value, ApiError> {
        self.delete_with(endpoint, &RequestOptions::default()).await
    }

    pub async fn delete_with(&self, endpoint: &str, options: &RequestOptions) -> Result<Value, ApiError> {
        self.send(
            Method::DELETE,
            endpoint,
            RequestBody::Empty,
            &QueryParams::default(),
            options,
        )
        .await
    }

    /// POST a multipart body. No JSON content type is ever attached.
    pub async fn upload(&self, endpoint: &str, body: MultipartBody) -> Result<Value, ApiError> {
        self.upload_with(endpoint, body, &RequestOptions::default()).await
    }

    pub async fn upload_with(
        &self,
        endpoint: &str,
        body: MultipartBody,
        options: &RequestOptions,
    ) -> Result<Value, ApiError> {
        self.send(
            Method::POST,
            endpoint,
            RequestBody::Multipart(body),
            &QueryParams::default(),
            options,
        )
        .await
    }

    async fn send_json(
        &self,
        method: Method,
        endpoint: &str,
        body: Value,
        options: &RequestOptions,
    ) -> Result<Value, ApiError> {
        self.send(
            method,
            endpoint,
            RequestBody::Json(body),
            &QueryParams::default(),
            options,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use reqwest::header::{self, HeaderValue};
    use serde::Deserialize;
    use serde_json::json;
    use wiremock::matchers::{body_json, header as header_eq, method, path, query_param};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    use super::*;
    use crate::auth::{Clock, CredentialStore, ManualClock, Token, UserProfile};
    use crate::testing::FakeIdentity;

    struct Harness {
        api: ApiClient,
        identity: Arc<FakeIdentity>,
        clock: Arc<ManualClock>,
        credentials: Arc<CredentialStore>,
    }

    async fn harness(server: &MockServer) -> Harness {
        let identity = Arc::new(FakeIdentity::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0).unwrap(),
        ));
        let credentials = Arc::new(CredentialStore::in_memory());
        let tokens = TokenManager::with_clock(
            identity.clone(),
            credentials.clone(),
            chrono::Duration::minutes(50),
            clock.clone(),
        );
        tokens.sign_in(UserProfile::new("user-1")).await.unwrap();

        let api = ApiClient::with_http_client(
            format!("{}/api/", server.uri()),
            Client::new(),
            tokens,
            2,
        );
        Harness {
            api,
            identity,
            clock,
            credentials,
        }
    }

    #[tokio::test]
    async fn test_get_attaches_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/services/12"))
            .and(header_eq("authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 12})))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server).await;
        let body = h.api.get("/services/12", &QueryParams::new()).await.unwrap();
        assert_eq!(body, json!({"id": 12}));
    }

    #[tokio::test]
    async fn test_get_drops_empty_query_params() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server).await;
        let params = QueryParams::new()
            .with("a", 1)
            .with("b", Value::Null)
            .with("c", "")
            .with("d", "x");
        h.api.get("search", &params).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests[0].url.query(), Some("a=1&d=x"));
    }

    #[tokio::test]
    async fn test_post_sends_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/bookings"))
            .and(header_eq("content-type", "application/json"))
            .and(body_json(json!({"serviceId": 3, "note": "mornings"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"bookingId": 99})))
            .expect(1)
            .mount(&server)
            .await;

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Created {
            booking_id: u64,
        }

        let h = harness(&server).await;
        let created: Created = h
            .api
            .post_as("bookings", json!({"serviceId": 3, "note": "mornings"}))
            .await
            .unwrap();
        assert_eq!(created.booking_id, 99);
    }

    #[tokio::test]
    async fn test_put_patch_delete() {
        let server = MockServer::start().await;
        for verb in ["PUT", "PATCH"] {
            Mock::given(method(verb))
                .and(path("/api/profile"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
                .expect(1)
                .mount(&server)
                .await;
        }
        Mock::given(method("DELETE"))
            .and(path("/api/bookings/5"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server).await;
        assert_eq!(h.api.put("profile", json!({"name": "A"})).await.unwrap(), json!({"ok": true}));
        assert_eq!(h.api.patch("/profile", json!({"bio": "B"})).await.unwrap(), json!({"ok": true}));
        assert_eq!(h.api.delete("bookings/5").await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_verbs_carry_request_options() {
        let server = MockServer::start().await;
        for verb in ["GET", "POST", "PUT", "PATCH", "DELETE"] {
            Mock::given(method(verb))
                .and(path("/api/listings/8"))
                .and(header_eq("x-request-source", "mobile"))
                .and(header_eq("authorization", "Bearer token-1"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({"verb": verb})))
                .expect(1)
                .mount(&server)
                .await;
        }

        let h = harness(&server).await;
        let options = RequestOptions::new()
            .header(
                header::HeaderName::from_static("x-request-source"),
                HeaderValue::from_static("mobile"),
            )
            .header(header::AUTHORIZATION, HeaderValue::from_static("Bearer stale"));
        let endpoint = "listings/8";
        let body = json!({"price": 40});

        let results = [
            h.api.get_with(endpoint, &QueryParams::new(), &options).await,
            h.api.post_with(endpoint, body.clone(), &options).await,
            h.api.put_with(endpoint, body.clone(), &options).await,
            h.api.patch_with(endpoint, body, &options).await,
            h.api.delete_with(endpoint, &options).await,
        ];
        let verbs: Vec<_> = results.into_iter().map(|r| r.unwrap()["verb"].clone()).collect();
        assert_eq!(verbs, vec!["GET", "POST", "PUT", "PATCH", "DELETE"]);
    }

    #[tokio::test]
    async fn test_upload_never_sends_json_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/uploads"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"url": "https://cdn/x.jpg"})))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server).await;
        let options = RequestOptions::new().header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let body = MultipartBody::new()
            .text("listingId", "7")
            .file("photo", "front.jpg", Some("image/jpeg"), vec![1, 2, 3]);
        h.api.upload_with("uploads", body, &options).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let content_types: Vec<_> = requests[0]
            .headers
            .get_all("content-type")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(content_types.len(), 1);
        assert!(content_types[0].starts_with("multipart/form-data; boundary="));
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(body.contains("name=\"listingId\""));
        assert!(body.contains("filename=\"front.jpg\""));
    }

    #[tokio::test]
    async fn test_unauthorized_then_success_refreshes_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/messages"))
            .and(header_eq("authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"message": "expired"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/messages"))
            .and(header_eq("authorization", "Bearer token-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"messages": []})))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server).await;
        let forced_before = h.identity.forced_calls();

        let body = h.api.get("messages", &QueryParams::new()).await.unwrap();

        assert_eq!(body, json!({"messages": []}));
        assert_eq!(h.identity.forced_calls() - forced_before, 1);
        assert_eq!(h.credentials.token().unwrap().value(), "token-2");
    }

    #[tokio::test]
    async fn test_repeated_unauthorized_stops_after_two_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/messages"))
            .respond_with(ResponseTemplate::new(401))
            .expect(3)
            .mount(&server)
            .await;

        let h = harness(&server).await;
        h.credentials.set_push_token("push-1");
        let forced_before = h.identity.forced_calls();

        let err = h.api.get("messages", &QueryParams::new()).await.unwrap_err();

        assert_eq!(err, ApiError::Unauthorized);
        assert!(err.requires_sign_in());
        assert_eq!(h.identity.forced_calls() - forced_before, 2);
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
        assert!(h.credentials.record().is_none());
        assert!(h.credentials.profile().is_none());
        assert!(h.credentials.push_token().is_none());
        assert!(!h.api.tokens().is_signed_in());
    }

    #[tokio::test]
    async fn test_late_unauthorized_reuses_replacement_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/inbox"))
            .and(header_eq("authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        // Arrives well after the first request has refreshed
        Mock::given(method("GET"))
            .and(path("/api/alerts"))
            .and(header_eq("authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(401).set_delay(std::time::Duration::from_millis(200)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header_eq("authorization", "Bearer token-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(2)
            .mount(&server)
            .await;

        let h = harness(&server).await;
        let forced_before = h.identity.forced_calls();

        let params = QueryParams::new();
        let (inbox, alerts) = tokio::join!(h.api.get("inbox", &params), h.api.get("alerts", &params));

        assert_eq!(inbox.unwrap(), json!({"ok": true}));
        assert_eq!(alerts.unwrap(), json!({"ok": true}));
        assert_eq!(h.identity.forced_calls() - forced_before, 1);
    }

    #[tokio::test]
    async fn test_server_rejection_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/reviews"))
            .respond_with(
                ResponseTemplate::new(422).set_body_json(json!({"message": "Rating must be 1-5"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server).await;
        let err = h.api.post("reviews", json!({"rating": 9})).await.unwrap_err();
        assert_eq!(
            err,
            ApiError::ServerRejected {
                status: 422,
                message: "Rating must be 1-5".to_string()
            }
        );
        assert!(h.credentials.has_credentials());
    }

    #[tokio::test]
    async fn test_server_error_without_body_uses_generic_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server).await;
        let err = h.api.get("status", &QueryParams::new()).await.unwrap_err();
        assert!(matches!(err, ApiError::ServerRejected { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_invalid_json_is_malformed_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server).await;
        let err = h.api.get("services", &QueryParams::new()).await.unwrap_err();
        assert!(matches!(err, ApiError::MalformedResponse(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_unexpected_shape_is_malformed_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "not-a-number"})))
            .mount(&server)
            .await;

        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Service {
            id: u64,
        }

        let h = harness(&server).await;
        let err = h.api.get_as::<Service>("services/1", &QueryParams::new()).await.unwrap_err();
        assert!(matches!(err, ApiError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_connection_failure_is_network_failure() {
        let server = MockServer::start().await;
        let h = harness(&server).await;

        // Nothing listens on a port we just released
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let closed = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        let api = ApiClient::with_http_client(closed, Client::new(), h.api.tokens().clone(), 2);

        let err = api.get("services", &QueryParams::new()).await.unwrap_err();
        assert!(matches!(err, ApiError::NetworkFailure(_)));
        assert!(err.is_retryable());
        // Credentials survive transport errors
        assert!(h.credentials.has_credentials());
    }

    #[tokio::test]
    async fn test_timeout_is_network_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({}))
                    .set_delay(std::time::Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let h = harness(&server).await;
        let slow_client = Client::builder()
            .timeout(std::time::Duration::from_millis(50))
            .build()
            .unwrap();
        let api = ApiClient::with_http_client(server.uri(), slow_client, h.api.tokens().clone(), 2);

        let err = api.get("slow", &QueryParams::new()).await.unwrap_err();
        assert!(matches!(err, ApiError::NetworkFailure(ref msg) if msg.contains("timed out")));
    }

    #[tokio::test]
    async fn test_signed_out_caller_gets_token_acquisition_failed() {
        let server = MockServer::start().await;
        let h = harness(&server).await;
        h.api.tokens().sign_out();
        h.identity.sign_out();

        let err = h.api.get("services", &QueryParams::new()).await.unwrap_err();
        assert!(matches!(err, ApiError::TokenAcquisitionFailed(_)));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cached_token_until_refresh_interval() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/feed"))
            .respond_with(|req: &Request| {
                let auth = req.headers.get("authorization").and_then(|v| v.to_str().ok());
                ResponseTemplate::new(200).set_body_json(json!({ "auth": auth }))
            })
            .mount(&server)
            .await;

        let h = harness(&server).await;
        let t0 = h.api.tokens().last_refresh().unwrap();
        assert_eq!(h.identity.calls(), 1);

        h.clock.advance(chrono::Duration::minutes(49));
        let body = h.api.get("feed", &QueryParams::new()).await.unwrap();
        assert_eq!(body["auth"], "Bearer token-1");
        assert_eq!(h.identity.calls(), 1);

        h.clock.advance(chrono::Duration::minutes(2));
        let body = h.api.get("feed", &QueryParams::new()).await.unwrap();
        assert_eq!(body["auth"], "Bearer token-2");
        assert_eq!(h.identity.calls(), 2);
        assert_eq!(
            h.api.tokens().last_refresh(),
            Some(t0 + chrono::Duration::minutes(51))
        );
    }

    #[tokio::test]
    async fn test_concurrent_requests_after_expiry_refresh_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(6)
            .mount(&server)
            .await;

        let h = harness(&server).await;
        h.clock.advance(chrono::Duration::minutes(55));

        let params = QueryParams::new();
        let calls = (0..6).map(|i| {
            let api = h.api.clone();
            let params = params.clone();
            async move { api.get(&format!("widgets/{}", i), &params).await }
        });
        let results = futures::future::join_all(calls).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(h.identity.calls(), 2);
    }

    #[tokio::test]
    async fn test_restored_session_is_used_without_sign_in() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header_eq("authorization", "Bearer from-disk"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0).unwrap()));
        let credentials = Arc::new(CredentialStore::in_memory());
        credentials.set_token(&Token::new("from-disk", clock.now()));
        let identity = Arc::new(FakeIdentity::new());
        let tokens = TokenManager::with_clock(
            identity.clone(),
            credentials,
            chrono::Duration::minutes(50),
            clock,
        );
        let api = ApiClient::with_http_client(server.uri(), Client::new(), tokens, 2);

        api.get("listings", &QueryParams::new().with("page", 1)).await.unwrap();
        assert_eq!(identity.calls(), 0);
    }
}
