//! Remote catalog access over HTTP.
//!
//! The data layer only ever talks to the backend through [`RemoteCatalog`]:
//! a paginated product query and a cheap liveness check. [`HttpCatalog`] is
//! the production implementation; tests substitute their own.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use almacen_core::{ProductRecord, ResultPage, SearchFilters};

/// Errors from the remote catalog.
///
/// Cancellation is deliberately absent: a superseded fetch is dropped by
/// the caller before it can produce a result, so it never becomes an error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),
    #[error("API error ({0}): {1}")]
    Api(u16, String),
    #[error("parse error: {0}")]
    Parse(String),
}

/// The remote query capability the data layer depends on.
#[async_trait]
pub trait RemoteCatalog: Send + Sync {
    /// Fetch one page of products matching `filters`.
    async fn fetch_page(
        &self,
        filters: &SearchFilters,
        offset: u32,
        limit: u32,
    ) -> Result<ResultPage, RemoteError>;

    /// Cheap liveness check against the backend.
    async fn fetch_health(&self) -> Result<(), RemoteError>;
}

/// Body of the paginated products endpoint.
#[derive(Debug, Deserialize)]
struct PageBody {
    items: Vec<ProductRecord>,
    total: u64,
    has_more: bool,
}

/// reqwest-backed catalog client.
pub struct HttpCatalog {
    api_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpCatalog {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            token: None,
            client: reqwest::Client::new(),
        }
    }

    /// Create a catalog client with an authentication token.
    pub fn with_token(api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            token: Some(token.into()),
            client: reqwest::Client::new(),
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.get(format!("{}{}", self.api_url, path));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }
}

#[async_trait]
impl RemoteCatalog for HttpCatalog {
    async fn fetch_page(
        &self,
        filters: &SearchFilters,
        offset: u32,
        limit: u32,
    ) -> Result<ResultPage, RemoteError> {
        let mut req = self.get("/products").query(&[
            ("offset", offset.to_string()),
            ("limit", limit.to_string()),
        ]);

        let text = filters.text.trim();
        if !text.is_empty() {
            req = req.query(&[("search", text)]);
        }
        if let Some(category) = &filters.category {
            req = req.query(&[("category", category.as_str())]);
        }
        if let Some(stock) = filters.stock {
            req = req.query(&[("stock", stock.as_str())]);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(RemoteError::Api(status, body));
        }

        let body: PageBody = resp
            .json()
            .await
            .map_err(|e| RemoteError::Parse(e.to_string()))?;

        Ok(ResultPage {
            items: body.items,
            total: body.total,
            has_more: body.has_more,
        })
    }

    async fn fetch_health(&self) -> Result<(), RemoteError> {
        let resp = self
            .get("/health")
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(RemoteError::Api(resp.status().as_u16(), String::new()))
        }
    }
}
