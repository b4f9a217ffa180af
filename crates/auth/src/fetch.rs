//! Request builder for GoTrue endpoints

use crate::error::AuthError;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use url::Url;

const CLIENT_INFO: &str = concat!("r3alm-auth/", env!("CARGO_PKG_VERSION"));

/// Helper for building and executing HTTP requests
pub(crate) struct FetchBuilder<'a> {
    client: &'a Client,
    url: String,
    method: Method,
    headers: HeaderMap,
    body: Option<Vec<u8>>,
}

impl<'a> FetchBuilder<'a> {
    fn new(client: &'a Client, url: &str, method: Method) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("X-Client-Info", HeaderValue::from_static(CLIENT_INFO));

        Self {
            client,
            url: url.to_string(),
            method,
            headers,
            body: None,
        }
    }

    /// Add a header to the request; values that are not valid header text are skipped.
    pub(crate) fn header(mut self, name: &'static str, value: &str) -> Self {
        match HeaderValue::from_str(value) {
            Ok(value) => {
                self.headers.insert(name, value);
            }
            Err(_) => log::warn!("Dropping invalid value for header {}", name),
        }
        self
    }

    pub(crate) fn bearer_auth(self, token: &str) -> Self {
        self.header("Authorization", &format!("Bearer {}", token))
    }

    pub(crate) fn json<T: Serialize>(mut self, body: &T) -> Result<Self, AuthError> {
        self.body = Some(serde_json::to_vec(body)?);
        Ok(self)
    }

    fn build(&self) -> Result<RequestBuilder, AuthError> {
        let url = Url::parse(&self.url)?;

        let mut req = self.client.request(self.method.clone(), url.as_str());
        req = req.headers(self.headers.clone());

        if let Some(body) = &self.body {
            req = req.body(body.clone());
        }

        Ok(req)
    }

    async fn send(&self) -> Result<Response, AuthError> {
        let response = self.build()?.send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(AuthError::api(status, error_message(&text)));
        }

        Ok(response)
    }

    /// Execute the request and parse the response as JSON
    pub(crate) async fn execute<T: DeserializeOwned>(&self) -> Result<T, AuthError> {
        let response = self.send().await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Execute the request, discarding any response body
    pub(crate) async fn execute_empty(&self) -> Result<(), AuthError> {
        self.send().await?;
        Ok(())
    }
}

/// Helper for creating HTTP requests
pub(crate) struct Fetch;

impl Fetch {
    pub(crate) fn get<'a>(client: &'a Client, url: &str) -> FetchBuilder<'a> {
        FetchBuilder::new(client, url, Method::GET)
    }

    pub(crate) fn post<'a>(client: &'a Client, url: &str) -> FetchBuilder<'a> {
        FetchBuilder::new(client, url, Method::POST)
    }

    pub(crate) fn put<'a>(client: &'a Client, url: &str) -> FetchBuilder<'a> {
        FetchBuilder::new(client, url, Method::PUT)
    }
}

/// GoTrue reports failures as `error_description`, `msg` or `message`
/// depending on the endpoint and version.
fn error_message(body: &str) -> String {
    let parsed = match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => value,
        Err(_) => return body.to_string(),
    };

    ["error_description", "msg", "message", "error"]
        .iter()
        .find_map(|key| parsed.get(*key).and_then(|v| v.as_str()))
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string())
}
