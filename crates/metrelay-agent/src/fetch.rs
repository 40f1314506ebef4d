use async_trait::async_trait;
use thiserror::Error;

/// Result of a successful HTTP exchange with a local endpoint. The
/// status code may still be a failure code, classification happens in
/// the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedBody {
    pub status: u16,
    pub text: String,
    pub content_type: String,
}

/// Failure to complete an HTTP exchange at all.
#[derive(Debug, Error)]
#[error("{kind} - {message}")]
pub struct FetchError {
    pub kind: &'static str,
    pub message: String,
}

/// Fetches the body of a local metrics endpoint. Implemented over
/// reqwest in production and by canned fetchers in tests.
#[async_trait]
pub trait ScrapeFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedBody, FetchError>;
}

/// HTTP fetcher used by the agent binary.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
        })
    }
}

#[async_trait]
impl ScrapeFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedBody, FetchError> {
        let response = self.client.get(url).send().await.map_err(request_error)?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        let text = response.text().await.map_err(request_error)?;
        Ok(FetchedBody {
            status,
            text,
            content_type,
        })
    }
}

fn request_error(err: reqwest::Error) -> FetchError {
    let kind = if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connect error"
    } else if err.is_body() || err.is_decode() {
        "body error"
    } else {
        "request error"
    };
    FetchError {
        kind,
        message: err.to_string(),
    }
}
