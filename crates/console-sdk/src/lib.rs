//! Asynchronous client for the recruiting console REST API.
//!
//! Covers the endpoints the synchronization core needs: cursor-based
//! long-poll updates, initial listings, mark-as-read and the user-initiated
//! writes (send message, create chat). Business state lives on the server;
//! this crate only moves typed payloads.

pub mod model;

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub use model::*;
pub use reqwest::StatusCode;

#[derive(Clone)]
pub struct ConsoleClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct RawUpdates {
    updated: bool,
    #[serde(default)]
    items: Vec<serde_json::Value>,
    #[serde(default)]
    latest_event_at: Option<Cursor>,
}

impl ConsoleClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self::with_http(Client::new(), base_url, token)
    }

    pub fn with_http(http: Client, base_url: impl Into<String>, token: Option<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            base_url,
            token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// One long-poll round trip against `<resource>/updates`.
    ///
    /// The server holds the request for up to `hold`; no client-side timeout
    /// is layered on top. Items that fail to decode are dropped and counted
    /// rather than failing the whole page.
    pub async fn fetch_updates<T>(
        &self,
        resource: &str,
        since: &Cursor,
        hold: Duration,
    ) -> Result<UpdatesPage<T>, ConsoleError>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}/{}/updates", self.base_url, resource.trim_matches('/'));
        let request = self.http.get(url).query(&[
            ("since", since.to_query()),
            ("timeout", hold.as_secs().to_string()),
        ]);
        let raw: RawUpdates = self.execute(request).await?;

        let mut items = Vec::with_capacity(raw.items.len());
        let mut dropped = 0;
        for value in raw.items {
            match serde_json::from_value::<T>(value) {
                Ok(item) => items.push(item),
                Err(err) => {
                    dropped += 1;
                    warn!(
                        target: "console_sdk",
                        resource = %resource,
                        error = %err,
                        "dropping undecodable update item"
                    );
                }
            }
        }

        Ok(UpdatesPage {
            updated: raw.updated,
            items,
            dropped,
            latest_event_at: raw.latest_event_at,
        })
    }

    pub async fn list_threads(&self) -> Result<Vec<Thread>, ConsoleError> {
        let url = format!("{}/chats", self.base_url);
        self.execute(self.http.get(url)).await
    }

    pub async fn list_messages(&self, thread_id: ThreadId) -> Result<Vec<Message>, ConsoleError> {
        let url = format!("{}/chats/{}/messages", self.base_url, thread_id);
        self.execute(self.http.get(url)).await
    }

    pub async fn mark_read(&self, thread_id: ThreadId) -> Result<(), ConsoleError> {
        let url = format!("{}/chats/{}/read", self.base_url, thread_id);
        let res = self.authorize(self.http.post(url)).send().await?;
        Self::check(res).await.map(|_| ())
    }

    pub async fn send_message(
        &self,
        thread_id: ThreadId,
        draft: &MessageDraft,
    ) -> Result<Message, ConsoleError> {
        let url = format!("{}/chats/{}/messages", self.base_url, thread_id);
        self.execute(self.http.post(url).json(draft)).await
    }

    pub async fn create_thread(&self, draft: &ThreadDraft) -> Result<Thread, ConsoleError> {
        let url = format!("{}/chats", self.base_url);
        self.execute(self.http.post(url).json(draft)).await
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn execute<T>(&self, request: RequestBuilder) -> Result<T, ConsoleError>
    where
        T: DeserializeOwned,
    {
        let res = self.authorize(request).send().await?;
        let res = Self::check(res).await?;
        let bytes = res.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn check(res: Response) -> Result<Response, ConsoleError> {
        if res.status().is_success() {
            Ok(res)
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(ConsoleError::UnexpectedStatus { status, body })
        }
    }
}
