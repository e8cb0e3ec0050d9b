//! Remote client abstraction and HTTP implementation.
//!
//! This module provides the [`RemoteClient`] trait for the authoritative item
//! store, along with concrete implementations:
//!
//! - [`HttpRemote`]: production client for the REST API
//! - `MockRemote`: in-memory server double for unit tests
//!
//! Every method returns an [`ApiResponse`]. Transport failures, non-2xx
//! statuses and undecodable bodies all come back as `success = false` with a
//! [`RemoteError`]; nothing is raised across this boundary.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::auth::Session;
use crate::query::Pagination;
use crate::types::{AuthToken, CreateItemInput, Item, UpdateItemInput, User};

// ============================================================================
// Error Types
// ============================================================================

/// Reasons a remote call did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Connection failed or the request never completed.
    #[error("Network error: {0}")]
    Network(String),

    /// The server answered with a non-success status.
    #[error("{message} (HTTP {status})")]
    Status { status: u16, message: String },

    /// The response body could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The server rejected the credentials; the session has been cleared.
    #[error("Authentication required")]
    Unauthorized,
}

impl RemoteError {
    /// Whether the failure means the server was never reached.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

// ============================================================================
// Response Types
// ============================================================================

/// Uniform result of every remote call.
#[derive(Debug, Clone)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<RemoteError>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn fail(error: RemoteError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self.error, Some(RemoteError::Unauthorized))
    }

    pub fn into_result(self) -> Result<T, RemoteError> {
        match (self.success, self.data, self.error) {
            (true, Some(data), _) => Ok(data),
            (_, _, Some(error)) => Err(error),
            _ => Err(RemoteError::Decode("response carried no data".to_string())),
        }
    }
}

/// Body of `GET /items` and `GET /items/search/ai`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemsPage {
    pub data: Vec<Item>,
    pub pagination: Pagination,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_metadata: Option<AiMetadata>,
}

/// How the AI search interpreted a natural-language query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiMetadata {
    pub original_query: String,
    #[serde(default)]
    pub extracted_terms: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Deleted {
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentUser {
    pub user: Option<User>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct Credentials<'a> {
    email: &'a str,
    password: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

// ============================================================================
// RemoteClient Trait
// ============================================================================

/// Typed access to the authoritative item store and its auth endpoints.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// List items, optionally filtered by keyword.
    async fn list_items(
        &self,
        page: u32,
        page_size: u32,
        query: Option<&str>,
    ) -> ApiResponse<ItemsPage>;

    /// AI-assisted natural-language search.
    async fn search_ai(&self, query: &str, page: u32, page_size: u32) -> ApiResponse<ItemsPage>;

    async fn get_item(&self, id: &str) -> ApiResponse<Item>;

    /// Not idempotent: retrying may create a duplicate.
    async fn create_item(&self, input: &CreateItemInput) -> ApiResponse<Item>;

    async fn update_item(&self, id: &str, input: &UpdateItemInput) -> ApiResponse<Item>;

    async fn delete_item(&self, id: &str) -> ApiResponse<Deleted>;

    async fn signup(&self, email: &str, password: &str, name: Option<&str>) -> ApiResponse<User>;

    /// Authenticate and store the returned token in the session.
    async fn login(&self, email: &str, password: &str) -> ApiResponse<AuthToken>;

    async fn current_user(&self) -> ApiResponse<CurrentUser>;
}

// ============================================================================
// HTTP Implementation
// ============================================================================

/// Client for the REST API behind `base_url` (e.g. `http://localhost:3000/api`).
pub struct HttpRemote {
    base_url: String,
    session: Session,
    client: reqwest::Client,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, session: Session) -> Self {
        Self {
            base_url: base_url.into(),
            session,
            client: reqwest::Client::new(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn url(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| RemoteError::Network(format!("invalid API URL '{}': {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| RemoteError::Network(format!("invalid API URL '{}'", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder, RemoteError> {
        let url = self.url(segments)?;
        let builder = self.client.request(method, url);
        Ok(match self.session.token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        })
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: Result<RequestBuilder, RemoteError>,
    ) -> ApiResponse<T> {
        let request = match request {
            Ok(request) => request,
            Err(e) => return ApiResponse::fail(e),
        };

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "remote request failed");
                return ApiResponse::fail(RemoteError::Network(e.to_string()));
            }
        };

        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return ApiResponse::fail(RemoteError::Network(e.to_string())),
        };

        let result = decode_response(status, &body);
        if result.is_unauthorized() {
            warn!("server rejected credentials; clearing session");
            self.session.clear();
        }
        result
    }
}

#[async_trait]
impl RemoteClient for HttpRemote {
    async fn list_items(
        &self,
        page: u32,
        page_size: u32,
        query: Option<&str>,
    ) -> ApiResponse<ItemsPage> {
        let mut params = vec![
            ("page", page.to_string()),
            ("page_size", page_size.to_string()),
        ];
        if let Some(q) = query {
            params.push(("query", q.to_string()));
        }
        let request = self
            .request(Method::GET, &["items"])
            .map(|r| r.query(&params));
        self.send(request).await
    }

    async fn search_ai(&self, query: &str, page: u32, page_size: u32) -> ApiResponse<ItemsPage> {
        let params = [
            ("query", query.to_string()),
            ("page", page.to_string()),
            ("page_size", page_size.to_string()),
        ];
        let request = self
            .request(Method::GET, &["items", "search", "ai"])
            .map(|r| r.query(&params));
        self.send(request).await
    }

    async fn get_item(&self, id: &str) -> ApiResponse<Item> {
        self.send(self.request(Method::GET, &["items", id])).await
    }

    async fn create_item(&self, input: &CreateItemInput) -> ApiResponse<Item> {
        let request = self
            .request(Method::POST, &["items"])
            .map(|r| r.json(input));
        self.send(request).await
    }

    async fn update_item(&self, id: &str, input: &UpdateItemInput) -> ApiResponse<Item> {
        let request = self
            .request(Method::PATCH, &["items", id])
            .map(|r| r.json(input));
        self.send(request).await
    }

    async fn delete_item(&self, id: &str) -> ApiResponse<Deleted> {
        self.send(self.request(Method::DELETE, &["items", id]))
            .await
    }

    async fn signup(&self, email: &str, password: &str, name: Option<&str>) -> ApiResponse<User> {
        let body = Credentials {
            email,
            password,
            name,
        };
        let request = self
            .request(Method::POST, &["auth", "signup"])
            .map(|r| r.json(&body));
        self.send(request).await
    }

    async fn login(&self, email: &str, password: &str) -> ApiResponse<AuthToken> {
        let body = Credentials {
            email,
            password,
            name: None,
        };
        let request = self
            .request(Method::POST, &["auth", "login"])
            .map(|r| r.json(&body));
        let response: ApiResponse<AuthToken> = self.send(request).await;
        if let Some(token) = &response.data {
            self.session.set_token(token.access_token.clone());
        }
        response
    }

    async fn current_user(&self) -> ApiResponse<CurrentUser> {
        self.send(self.request(Method::GET, &["auth", "me"])).await
    }
}

/// Normalize a status code and body into an [`ApiResponse`].
pub fn decode_response<T: DeserializeOwned>(status: u16, body: &str) -> ApiResponse<T> {
    if status == 401 {
        return ApiResponse::fail(RemoteError::Unauthorized);
    }

    if !(200..300).contains(&status) {
        let message = serde_json::from_str::<ErrorBody>(body)
            .ok()
            .and_then(|b| b.error)
            .unwrap_or_else(|| "An error occurred".to_string());
        return ApiResponse::fail(RemoteError::Status { status, message });
    }

    match serde_json::from_str(body) {
        Ok(data) => ApiResponse::ok(data),
        Err(e) => ApiResponse::fail(RemoteError::Decode(e.to_string())),
    }
}

// ============================================================================
// Mock Implementation (Test Only)
// ============================================================================

/// In-memory stand-in for the server.
///
/// Holds the authoritative item list, logs every call by name, and can be
/// switched offline, made to reject writes, or gated so a create blocks until
/// the test releases it.
#[cfg(test)]
pub struct MockRemote {
    pub items: std::sync::Mutex<Vec<Item>>,
    pub calls: std::sync::Mutex<Vec<String>>,
    pub online: std::sync::atomic::AtomicBool,
    pub reject_writes: std::sync::atomic::AtomicBool,
    pub unauthorized: std::sync::atomic::AtomicBool,
    pub create_gate: Option<std::sync::Arc<tokio::sync::Notify>>,
    pub create_started: tokio::sync::Notify,
    next_id: std::sync::atomic::AtomicU64,
}

#[cfg(test)]
impl MockRemote {
    pub fn new() -> Self {
        Self {
            items: std::sync::Mutex::new(Vec::new()),
            calls: std::sync::Mutex::new(Vec::new()),
            online: std::sync::atomic::AtomicBool::new(true),
            reject_writes: std::sync::atomic::AtomicBool::new(false),
            unauthorized: std::sync::atomic::AtomicBool::new(false),
            create_gate: None,
            create_started: tokio::sync::Notify::new(),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Creates block until the returned handle is notified.
    pub fn with_create_gate(mut self) -> (Self, std::sync::Arc<tokio::sync::Notify>) {
        let gate = std::sync::Arc::new(tokio::sync::Notify::new());
        self.create_gate = Some(gate.clone());
        (self, gate)
    }

    pub fn seed(&self, name: &str, location: &str) -> Item {
        let now = chrono::Utc::now();
        let item = Item {
            id: self.next_server_id(),
            name: name.to_string(),
            location: location.to_string(),
            user_id: None,
            created_at: now,
            updated_at: now,
        };
        self.items.lock().unwrap().insert(0, item.clone());
        item
    }

    pub fn set_online(&self, online: bool) {
        self.online
            .store(online, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes
            .store(reject, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    pub fn server_item(&self, id: &str) -> Option<Item> {
        self.items.lock().unwrap().iter().find(|i| i.id == id).cloned()
    }

    fn next_server_id(&self) -> String {
        let n = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        format!("srv-{n}")
    }

    /// Record the call and report whether it may proceed.
    async fn enter<T>(&self, call: &str, write: bool) -> Option<ApiResponse<T>> {
        use std::sync::atomic::Ordering;

        self.calls.lock().unwrap().push(call.to_string());
        // Suspend once so concurrent callers can observe the call in flight.
        tokio::task::yield_now().await;

        if !self.online.load(Ordering::SeqCst) {
            return Some(ApiResponse::fail(RemoteError::Network(
                "connection refused".to_string(),
            )));
        }
        if self.unauthorized.load(Ordering::SeqCst) {
            return Some(ApiResponse::fail(RemoteError::Unauthorized));
        }
        if write && self.reject_writes.load(Ordering::SeqCst) {
            return Some(ApiResponse::fail(RemoteError::Status {
                status: 500,
                message: "write rejected".to_string(),
            }));
        }
        None
    }

    fn page(&self, query: Option<&str>, page: u32, page_size: u32) -> ItemsPage {
        let desc = crate::query::QueryDescriptor::new(page, page_size, query);
        let result = crate::query::paginate(&self.items.lock().unwrap(), &desc);
        ItemsPage {
            data: result.items,
            pagination: result.pagination,
            ai_metadata: None,
        }
    }
}

#[cfg(test)]
#[async_trait]
impl RemoteClient for MockRemote {
    async fn list_items(
        &self,
        page: u32,
        page_size: u32,
        query: Option<&str>,
    ) -> ApiResponse<ItemsPage> {
        if let Some(failure) = self.enter("list", false).await {
            return failure;
        }
        ApiResponse::ok(self.page(query, page, page_size))
    }

    async fn search_ai(&self, query: &str, page: u32, page_size: u32) -> ApiResponse<ItemsPage> {
        if let Some(failure) = self.enter("search_ai", false).await {
            return failure;
        }
        // Treat the last word as the extracted term.
        let term = query.split_whitespace().last().unwrap_or(query).to_string();
        let mut page = self.page(Some(term.as_str()), page, page_size);
        page.ai_metadata = Some(AiMetadata {
            original_query: query.to_string(),
            extracted_terms: vec![term],
        });
        ApiResponse::ok(page)
    }

    async fn get_item(&self, id: &str) -> ApiResponse<Item> {
        if let Some(failure) = self.enter("get", false).await {
            return failure;
        }
        match self.server_item(id) {
            Some(item) => ApiResponse::ok(item),
            None => ApiResponse::fail(RemoteError::Status {
                status: 404,
                message: "Item not found".to_string(),
            }),
        }
    }

    async fn create_item(&self, input: &CreateItemInput) -> ApiResponse<Item> {
        if let Some(gate) = &self.create_gate {
            self.create_started.notify_one();
            gate.notified().await;
        }
        if let Some(failure) = self.enter("create", true).await {
            return failure;
        }
        ApiResponse::ok(self.seed(&input.name, &input.location))
    }

    async fn update_item(&self, id: &str, input: &UpdateItemInput) -> ApiResponse<Item> {
        if let Some(failure) = self.enter("update", true).await {
            return failure;
        }
        let mut items = self.items.lock().unwrap();
        match items.iter_mut().find(|i| i.id == id) {
            Some(item) => {
                item.apply(input);
                ApiResponse::ok(item.clone())
            }
            None => ApiResponse::fail(RemoteError::Status {
                status: 404,
                message: "Item not found".to_string(),
            }),
        }
    }

    async fn delete_item(&self, id: &str) -> ApiResponse<Deleted> {
        if let Some(failure) = self.enter("delete", true).await {
            return failure;
        }
        let mut items = self.items.lock().unwrap();
        let before = items.len();
        items.retain(|i| i.id != id);
        ApiResponse::ok(Deleted {
            deleted: items.len() != before,
        })
    }

    async fn signup(&self, email: &str, _password: &str, name: Option<&str>) -> ApiResponse<User> {
        if let Some(failure) = self.enter("signup", false).await {
            return failure;
        }
        ApiResponse::ok(User {
            id: "user-1".to_string(),
            email: email.to_string(),
            name: name.map(str::to_string),
            created_at: None,
        })
    }

    async fn login(&self, email: &str, _password: &str) -> ApiResponse<AuthToken> {
        if let Some(failure) = self.enter("login", false).await {
            return failure;
        }
        ApiResponse::ok(AuthToken {
            access_token: "token-1".to_string(),
            token_type: "bearer".to_string(),
            user: User {
                id: "user-1".to_string(),
                email: email.to_string(),
                name: None,
                created_at: None,
            },
        })
    }

    async fn current_user(&self) -> ApiResponse<CurrentUser> {
        if let Some(failure) = self.enter("me", false).await {
            return failure;
        }
        ApiResponse::ok(CurrentUser { user: None })
    }
}

// ============================================================================
// Tests
// ============================================================================
