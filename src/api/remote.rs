//! Purpose: Fetch the authenticated shopper's cart over HTTP.
//! Exports: `HttpCartSource`, `DEFAULT_REQUEST_TIMEOUT`.
//! Role: Production `RemoteCartSource`; blocking `ureq` calls run on tokio's blocking pool.
//! Invariants: Every request carries `Authorization: Bearer <token>`; tokens are never logged.
//! Invariants: Non-2xx, transport, and decode failures all surface as typed `Error`s.
#![allow(clippy::result_large_err)]

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::api::query::{FetchFuture, RemoteCart, RemoteCartSource};
use crate::core::error::{Error, ErrorKind};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type ApiResult<T> = Result<T, Error>;

#[derive(Clone)]
pub struct HttpCartSource {
    inner: Arc<HttpCartSourceInner>,
}

struct HttpCartSourceInner {
    endpoint: Url,
    agent: ureq::Agent,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: RemoteError,
}

#[derive(Deserialize)]
struct RemoteError {
    message: Option<String>,
    hint: Option<String>,
}

impl HttpCartSource {
    /// `endpoint` is the full cart URL, e.g. `https://shop.example/v0/cart`.
    pub fn new(endpoint: impl Into<String>) -> ApiResult<Self> {
        let endpoint = normalize_endpoint(endpoint.into())?;
        Ok(Self {
            inner: Arc::new(HttpCartSourceInner {
                endpoint,
                agent: build_agent(DEFAULT_REQUEST_TIMEOUT),
            }),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let agent = build_agent(timeout);
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.agent = agent;
        } else {
            self.inner = Arc::new(HttpCartSourceInner {
                endpoint: self.inner.endpoint.clone(),
                agent,
            });
        }
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.inner.endpoint
    }

    pub fn fetch_blocking(&self, access_token: &str) -> ApiResult<RemoteCart> {
        let response = self
            .inner
            .agent
            .get(self.inner.endpoint.as_str())
            .set("Accept", "application/json")
            .set("Authorization", &format!("Bearer {access_token}"))
            .call();
        match response {
            Ok(resp) => read_cart_response(resp),
            Err(ureq::Error::Status(code, resp)) => Err(parse_error_response(code, resp)),
            Err(ureq::Error::Transport(err)) => Err(Error::new(ErrorKind::Io)
                .with_message("cart request failed")
                .with_source(err)),
        }
    }
}

impl RemoteCartSource for HttpCartSource {
    fn fetch(&self, access_token: &str) -> FetchFuture {
        let source = self.clone();
        let access_token = access_token.to_string();
        Box::pin(async move {
            debug!(endpoint = %source.endpoint(), "requesting remote cart");
            tokio::task::spawn_blocking(move || source.fetch_blocking(&access_token))
                .await
                .map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("cart request task failed")
                        .with_source(err)
                })?
        })
    }
}

fn build_agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new().timeout(timeout).build()
}

fn read_cart_response(response: ureq::Response) -> ApiResult<RemoteCart> {
    let body = response.into_string().map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read cart response body")
            .with_source(err)
    })?;
    serde_json::from_str(&body).map_err(|err| {
        Error::new(ErrorKind::Corrupt)
            .with_message("invalid cart response json")
            .with_source(err)
    })
}

fn parse_error_response(status: u16, response: ureq::Response) -> Error {
    let body = response.into_string().unwrap_or_default();
    let mut err = Error::new(error_kind_from_status(status)).with_status(status);
    match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) => {
            err = err.with_message(
                envelope
                    .error
                    .message
                    .unwrap_or_else(|| format!("cart endpoint returned status {status}")),
            );
            if let Some(hint) = envelope.error.hint {
                err = err.with_hint(hint);
            }
        }
        Err(_) => err = err.with_message(format!("cart endpoint returned status {status}")),
    }
    err
}

fn error_kind_from_status(status: u16) -> ErrorKind {
    match status {
        400 => ErrorKind::Usage,
        401 | 403 => ErrorKind::Permission,
        404 => ErrorKind::NotFound,
        409 | 423 | 429 => ErrorKind::Busy,
        500..=599 => ErrorKind::Internal,
        _ => ErrorKind::Io,
    }
}

fn normalize_endpoint(raw: String) -> ApiResult<Url> {
    let mut url = Url::parse(&raw).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid cart endpoint url")
            .with_source(err)
    })?;
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("cart endpoint must use http or https scheme"));
    }
    if url.cannot_be_a_base() || url.host_str().is_none() {
        return Err(Error::new(ErrorKind::Usage).with_message("cart endpoint must include a host"));
    }
    url.set_fragment(None);
    Ok(url)
}
