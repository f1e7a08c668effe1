//! HTTP client for upstream requests.
//!
//! A thin wrapper over a shared reqwest client carrying the per-source
//! connection pool, timeout, basic auth, extra headers, optional custom CA,
//! and a cookie jar.

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, TileError};

/// HTTP options for one upstream.
#[derive(Debug, Clone)]
pub struct HttpOptions {
    /// Request timeout; also bounds queueing on the upstream semaphore
    pub timeout: Duration,
    /// Basic auth credentials
    pub username: Option<String>,
    pub password: Option<String>,
    /// Extra headers sent with every request
    pub headers: HashMap<String, String>,
    /// PEM file with an additional trusted root
    pub ssl_ca_cert: Option<PathBuf>,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            username: None,
            password: None,
            headers: HashMap::new(),
            ssl_ca_cert: None,
        }
    }
}

/// Upstream response, returned without judging the status code so callers
/// can apply their own `on_error` mapping.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Shared HTTP client for one source adapter.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    username: Option<String>,
    password: Option<String>,
}

impl HttpClient {
    pub fn new(options: &HttpOptions) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TileError::config(format!("invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TileError::config(format!("invalid header value: {}", e)))?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .timeout(options.timeout)
            .default_headers(headers)
            .cookie_store(true);

        if let Some(ca_path) = &options.ssl_ca_cert {
            let pem = std::fs::read(ca_path)?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| TileError::config(format!("invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| TileError::config(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            username: options.username.clone(),
            password: options.password.clone(),
        })
    }

    /// The underlying reqwest client, for callers that need to drive their
    /// own requests over the same pool.
    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }

    /// GET without status judgement; network failures still error.
    pub async fn get_raw(&self, url: &str) -> Result<HttpResponse> {
        let mut request = self.client.get(url);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response.bytes().await?;
        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }

    /// GET expecting success; non-2xx becomes a source HTTP error carrying
    /// a body snippet.
    pub async fn get_bytes(&self, url: &str) -> Result<HttpResponse> {
        let response = self.get_raw(url).await?;
        if response.is_success() {
            Ok(response)
        } else {
            let snippet = String::from_utf8_lossy(
                &response.body[..response.body.len().min(200)],
            )
            .into_owned();
            Err(TileError::SourceHttp {
                status: response.status,
                message: snippet,
            })
        }
    }

    /// POST a JSON body and parse a JSON response.
    pub async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let mut request = self.client.post(url).json(body);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TileError::SourceHttp {
                status: status.as_u16(),
                message: format!("POST {}", url),
            });
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = HttpOptions::default();
        assert_eq!(opts.timeout, Duration::from_secs(60));
        assert!(HttpClient::new(&opts).is_ok());
    }

    #[test]
    fn test_invalid_header_rejected() {
        let mut opts = HttpOptions::default();
        opts.headers.insert("bad header\n".to_string(), "x".to_string());
        assert!(HttpClient::new(&opts).is_err());
    }

    #[test]
    fn test_response_success_range() {
        let resp = HttpResponse {
            status: 204,
            content_type: None,
            body: Bytes::new(),
        };
        assert!(resp.is_success());
        let resp = HttpResponse {
            status: 404,
            content_type: None,
            body: Bytes::new(),
        };
        assert!(!resp.is_success());
    }
}
