//! Core library for markethub: an authenticated client for the services
//! marketplace API.
//!
//! The pieces, leaves first:
//! - [`auth::CredentialStore`] caches the token and profile in a
//!   session-scoped and a persistent store
//! - [`auth::TokenManager`] hands out valid tokens with single-flight refresh
//! - [`api::EndpointResolver`] joins endpoints onto the base URL
//! - [`api::RequestExecutor`] sends requests and recovers from 401s
//! - [`api::ApiClient`] exposes get/post/put/patch/delete/upload

pub mod api;
pub mod auth;
pub mod config;

#[cfg(test)]
mod testing;

pub use api::{ApiClient, ApiError, ErrorKind, MultipartBody, QueryParams, RequestOptions};
pub use auth::{CredentialStore, IdentityProvider, Token, TokenManager, UserProfile};
pub use config::Config;
