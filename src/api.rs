use async_trait::async_trait;
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::{
    core::truncate_message,
    model::{
        BulkReadRequestWire, CountWire, Notification, NotificationId, NotificationPage,
        NotificationPatch, NotificationQuery,
    },
    settings::{normalize_base_url, Settings},
    Error, Result,
};

/// The REST backend, which stays the source of truth for every record.
#[async_trait]
pub trait NotificationApi: Send + Sync {
    async fn list(&self, query: &NotificationQuery) -> Result<NotificationPage>;

    async fn unread_count(&self) -> Result<u64>;

    async fn mark_read(&self, id: NotificationId) -> Result<Notification>;

    /// Returns how many records the backend actually transitioned.
    async fn bulk_mark_read(&self, ids: &[NotificationId]) -> Result<u64>;

    async fn update(&self, id: NotificationId, patch: &NotificationPatch) -> Result<Notification>;
}

#[derive(Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl RestClient {
    pub fn new(base_url: &str, token: Option<&str>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url)?,
            token: token.map(|value| value.trim().to_string()),
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(
            &settings.base_url,
            settings.token(),
            Duration::from_secs(settings.request_timeout_secs.max(1)),
        )
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        context: &'static str,
    ) -> Result<T> {
        let response = self.authorized(request).send().await?;
        let response = ensure_success(response, context).await?;
        let body = response.bytes().await?;
        serde_json::from_slice::<T>(&body).map_err(|source| Error::Decode { context, source })
    }
}

async fn ensure_success(response: Response, context: &'static str) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unable to read response body>".to_string());
    Err(Error::Http {
        context,
        status,
        body: truncate_message(&body, 200),
    })
}

#[async_trait]
impl NotificationApi for RestClient {
    async fn list(&self, query: &NotificationQuery) -> Result<NotificationPage> {
        let endpoint = format!("{}/notifications", self.base_url);
        log::debug!(
            "GET {endpoint} page={} page_size={} type={:?} include_read={}",
            query.page,
            query.page_size,
            query.category.map(|category| category.as_str()),
            query.include_read
        );
        self.send_json(
            self.client.get(endpoint).query(&query.params()),
            "notification list request",
        )
        .await
    }

    async fn unread_count(&self) -> Result<u64> {
        let endpoint = format!("{}/notifications/unread-count", self.base_url);
        let count: CountWire = self
            .send_json(self.client.get(endpoint), "unread count request")
            .await?;
        Ok(count.value())
    }

    async fn mark_read(&self, id: NotificationId) -> Result<Notification> {
        let endpoint = format!("{}/notifications/{id}/read", self.base_url);
        self.send_json(self.client.post(endpoint), "mark read request")
            .await
    }

    async fn bulk_mark_read(&self, ids: &[NotificationId]) -> Result<u64> {
        let endpoint = format!("{}/notifications/bulk-read", self.base_url);
        let count: CountWire = self
            .send_json(
                self.client
                    .post(endpoint)
                    .json(&BulkReadRequestWire { ids }),
                "bulk read request",
            )
            .await?;
        Ok(count.value())
    }

    async fn update(&self, id: NotificationId, patch: &NotificationPatch) -> Result<Notification> {
        let endpoint = format!("{}/notifications/{id}", self.base_url);
        self.send_json(self.client.patch(endpoint).json(patch), "notification update")
            .await
    }
}
