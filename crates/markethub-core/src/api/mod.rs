//! REST API client module for the marketplace backend.
//!
//! This module provides the `ApiClient` for calling the backend's JSON
//! endpoints. Requests carry a bearer token from the `TokenManager`; a 401 is
//! answered by forcing a token refresh and retrying, up to a fixed bound.

pub mod client;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod request;

pub use client::ApiClient;
pub use endpoint::{resolve, EndpointResolver, QueryParams};
pub use error::{ApiError, ErrorKind};
pub use executor::{RequestExecutor, DEFAULT_MAX_RETRIES};
pub use request::{MultipartBody, MultipartPart, RequestBody, RequestContext, RequestOptions};
