//! `reqwest`-backed request pipeline

use reqwest::Client;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;

use super::{Method, RawFailure, Request, RequestPipeline};

/// Default per-request timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Issues requests over HTTP and decodes JSON responses
#[derive(Debug, Clone)]
pub struct HttpPipeline {
    client: Client,
    timeout: Duration,
}

impl Default for HttpPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpPipeline {
    /// Creates a pipeline with default settings
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Creates a pipeline with a custom HTTP client
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sets the per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build(&self, request: &Request) -> reqwest::RequestBuilder {
        let builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };

        let builder = builder.query(&request.params).timeout(self.timeout);

        match &request.body {
            Some(body) => builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone()),
            None => builder,
        }
    }
}

impl RequestPipeline for HttpPipeline {
    fn execute<T>(&self, request: &Request) -> impl Future<Output = Result<T, RawFailure>> + Send
    where
        T: DeserializeOwned + Send,
    {
        send(self.build(request))
    }
}

/// Sends a request and decodes a successful JSON response
async fn send<T: DeserializeOwned>(builder: reqwest::RequestBuilder) -> Result<T, RawFailure> {
    let response = builder.send().await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(RawFailure::Status {
            status: status.as_u16(),
            body,
        });
    }

    let text = response.text().await?;
    Ok(serde_json::from_str(&text)?)
}
