//! REST API access.
//!
//! [`NotificationApi`] is the request/response side of the backend: paged
//! listing, the unread counter and the acknowledgements for optimistic
//! mutations. [`RestClient`] implements it over `reqwest`;
//! [`NotificationPoller`] adapts any implementation into the scheduler's
//! [`PollSource`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, trace};
use url::Url;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::model::{Category, Notification, NotificationId, Page, Priority};
use crate::scheduler::PollSource;
use crate::transport::install_rustls_provider;

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Query parameters for [`NotificationApi::list`].
#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery {
    /// 1-based page number.
    pub page: u32,
    pub size: u32,
    pub read: Option<bool>,
    pub category: Option<Category>,
    pub priority: Option<Priority>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub keyword: Option<String>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            page: 1,
            size: 50,
            read: None,
            category: None,
            priority: None,
            start_date: None,
            end_date: None,
            keyword: None,
        }
    }
}

impl ListQuery {
    /// First page of the given size, unfiltered.
    pub fn first_page(size: u32) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("page", self.page.to_string()), ("size", self.size.to_string())];
        if let Some(read) = self.read {
            pairs.push(("read", read.to_string()));
        }
        if let Some(category) = self.category {
            pairs.push(("type", category.as_str().to_string()));
        }
        if let Some(priority) = self.priority {
            pairs.push(("priority", priority.as_str().to_string()));
        }
        if let Some(start) = self.start_date {
            pairs.push(("startDate", start.format(DATE_FORMAT).to_string()));
        }
        if let Some(end) = self.end_date {
            pairs.push(("endDate", end.format(DATE_FORMAT).to_string()));
        }
        if let Some(keyword) = self.keyword.as_deref().filter(|k| !k.is_empty()) {
            pairs.push(("keyword", keyword.to_string()));
        }
        pairs
    }
}

/// Backend notification endpoints.
#[async_trait]
pub trait NotificationApi: Send + Sync + 'static {
    async fn list(&self, query: &ListQuery) -> Result<Page<Notification>>;

    async fn unread_count(&self) -> Result<u32>;

    async fn mark_read(&self, id: &NotificationId) -> Result<()>;

    async fn mark_batch_read(&self, ids: &[NotificationId]) -> Result<()>;

    async fn mark_all_read(&self) -> Result<()>;

    async fn delete(&self, id: &NotificationId) -> Result<()>;

    async fn delete_batch(&self, ids: &[NotificationId]) -> Result<()>;

    async fn delete_all(&self) -> Result<()>;
}

/// Response envelope used by every endpoint.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
    #[serde(default)]
    code: Option<i64>,
}

fn default_success() -> bool {
    true
}

impl<T> ApiResponse<T> {
    fn into_result(self) -> Result<Option<T>> {
        if self.success {
            Ok(self.data)
        } else {
            Err(SyncError::api(
                self.code,
                self.message.unwrap_or_else(|| "request failed".to_string()),
            ))
        }
    }
}

/// `reqwest` implementation of [`NotificationApi`].
#[derive(Debug, Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl RestClient {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        install_rustls_provider();
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("notify-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Self::with_client(client, &config.api_base_url, config.token.clone())
    }

    /// Build on top of an existing HTTP client.
    pub fn with_client(client: reqwest::Client, base_url: &str, token: Option<String>) -> Result<Self> {
        // A trailing slash makes `Url::join` append instead of replacing the last segment.
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base = Url::parse(&normalized)
            .map_err(|e| SyncError::config(format!("invalid api_base_url {base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(SyncError::config(format!("api_base_url {base_url} cannot carry a path")));
        }
        Ok(Self {
            client,
            base,
            token,
        })
    }

    /// Resolve path segments under the base URL, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::config(format!("api_base_url {} cannot carry a path", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder> {
        let url = self.endpoint(segments)?;
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        Ok(builder)
    }

    async fn execute<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<Option<T>> {
        let response = builder.send().await?;
        let status = response.status();
        trace!(%status, url = %response.url(), "API response");
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let body = response.text().await?;
        if !status.is_success() {
            let message = serde_json::from_str::<ApiResponse<Value>>(&body)
                .ok()
                .and_then(|r| r.message)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("HTTP error").to_string());
            return Err(SyncError::api(Some(i64::from(status.as_u16())), message));
        }
        if body.trim().is_empty() {
            return Ok(None);
        }
        let envelope: ApiResponse<T> = serde_json::from_str(&body)?;
        envelope.into_result()
    }

    async fn send_ack(&self, method: Method, segments: &[&str], body: Option<Value>) -> Result<()> {
        let mut builder = self.request(method, segments)?;
        if let Some(body) = body {
            builder = builder.json(&body);
        }
        self.execute::<Value>(builder).await?;
        Ok(())
    }
}

#[async_trait]
impl NotificationApi for RestClient {
    async fn list(&self, query: &ListQuery) -> Result<Page<Notification>> {
        let builder = self.request(Method::GET, &["notifications"])?.query(&query.to_pairs());
        let page = self
            .execute::<Page<Notification>>(builder)
            .await?
            .ok_or_else(|| SyncError::protocol("list response carried no data"))?;
        debug!(count = page.list.len(), total = page.total, page = query.page, "Fetched notifications");
        Ok(page)
    }

    async fn unread_count(&self) -> Result<u32> {
        let builder = self.request(Method::GET, &["notifications", "unread-count"])?;
        let data = self
            .execute::<Value>(builder)
            .await?
            .ok_or_else(|| SyncError::protocol("unread-count response carried no data"))?;
        parse_count(&data)
    }

    async fn mark_read(&self, id: &NotificationId) -> Result<()> {
        let id = id.to_string();
        self.send_ack(Method::PUT, &["notifications", id.as_str(), "read"], None)
            .await
    }

    async fn mark_batch_read(&self, ids: &[NotificationId]) -> Result<()> {
        self.send_ack(
            Method::PUT,
            &["notifications", "batch", "read"],
            Some(json!({ "notificationIds": ids })),
        )
        .await
    }

    async fn mark_all_read(&self) -> Result<()> {
        self.send_ack(Method::PUT, &["notifications", "all", "read"], None).await
    }

    async fn delete(&self, id: &NotificationId) -> Result<()> {
        let id = id.to_string();
        self.send_ack(Method::DELETE, &["notifications", id.as_str()], None)
            .await
    }

    async fn delete_batch(&self, ids: &[NotificationId]) -> Result<()> {
        self.send_ack(
            Method::DELETE,
            &["notifications", "batch"],
            Some(json!({ "notificationIds": ids })),
        )
        .await
    }

    async fn delete_all(&self) -> Result<()> {
        self.send_ack(Method::DELETE, &["notifications", "all"], None).await
    }
}

/// Accepts a bare number or an object carrying `count` / `unreadCount`.
fn parse_count(data: &Value) -> Result<u32> {
    let number = match data {
        Value::Object(map) => map.get("unreadCount").or_else(|| map.get("count")),
        other => Some(other),
    };
    number
        .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| SyncError::protocol(format!("unexpected unread count payload: {data}")))
}

/// Polls the first page of notifications through a [`NotificationApi`].
#[derive(Clone)]
pub struct NotificationPoller {
    api: Arc<dyn NotificationApi>,
    page_size: u32,
}

impl NotificationPoller {
    pub fn new(api: Arc<dyn NotificationApi>, page_size: u32) -> Self {
        Self { api, page_size }
    }
}

#[async_trait]
impl PollSource for NotificationPoller {
    async fn unread_count(&self) -> Result<u32> {
        self.api.unread_count().await
    }

    async fn fetch_page(&self) -> Result<Vec<Notification>> {
        let page = self.api.list(&ListQuery::first_page(self.page_size)).await?;
        Ok(page.list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_query_pairs() {
        let query = ListQuery {
            read: Some(false),
            category: Some(Category::Warning),
            start_date: Some(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()),
            keyword: Some(String::new()),
            ..ListQuery::first_page(20)
        };
        assert_eq!(
            query.to_pairs(),
            vec![
                ("page", "1".to_string()),
                ("size", "20".to_string()),
                ("read", "false".to_string()),
                ("type", "warning".to_string()),
                ("startDate", "2024-01-02 03:04:05".to_string()),
            ]
        );
    }

    #[test]
    fn test_envelope_failure_maps_to_api_error() {
        let envelope: ApiResponse<Value> =
            serde_json::from_str(r#"{"success":false,"message":"not yours","code":403}"#).unwrap();
        match envelope.into_result() {
            Err(SyncError::Api { code, message }) => {
                assert_eq!(code, Some(403));
                assert_eq!(message, "not yours");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_page_envelope_decodes() {
        let body = r#"{
            "success": true,
            "data": {
                "list": [{"notificationId": 1, "title": "t", "content": "c", "notificationType": 4, "isRead": false, "createTime": "2024-05-01 10:00:00"}],
                "total": 1, "current": 1, "size": 50, "pages": 1
            }
        }"#;
        let envelope: ApiResponse<Page<Notification>> = serde_json::from_str(body).unwrap();
        let page = envelope.into_result().unwrap().unwrap();
        assert_eq!(page.list.len(), 1);
        assert_eq!(page.list[0].category, Category::Error);
        assert!(!page.list[0].read);
    }

    #[test]
    fn test_parse_count_shapes() {
        assert_eq!(parse_count(&json!(4)).unwrap(), 4);
        assert_eq!(parse_count(&json!({"unreadCount": 2})).unwrap(), 2);
        assert_eq!(parse_count(&json!("7")).unwrap(), 7);
        assert!(parse_count(&json!(-1)).is_err());
    }

    #[test]
    fn test_endpoint_paths() {
        install_rustls_provider();
        let client = RestClient::with_client(reqwest::Client::new(), "http://host/api/", None).unwrap();
        let url = client.endpoint(&["notifications", "unread-count"]).unwrap();
        assert_eq!(url.as_str(), "http://host/api/notifications/unread-count");

        let id = NotificationId::Text("a/b?c#d".to_string()).to_string();
        let url = client.endpoint(&["notifications", id.as_str(), "read"]).unwrap();
        assert_eq!(url.as_str(), "http://host/api/notifications/a%2Fb%3Fc%23d/read");
        assert_eq!(url.path_segments().unwrap().count(), 4);
    }

    #[test]
    fn test_envelope_without_data() {
        let envelope: ApiResponse<Page<Notification>> =
            serde_json::from_str(r#"{"success":true}"#).unwrap();
        assert!(envelope.into_result().unwrap().is_none());
    }
}
