// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, SET_COOKIE};
use slog::{info, o, Logger};

use crate::api::{self, RpcMethod};
use crate::{Error, RequestEnvelope, ResponseEnvelope, RpcTransport};

const API_PATH: &str = "/.api/V4/.req/";
const SESSION_COOKIE: &str = "APIEndpoint00";
const SESSION_HEADER: &str = "X-Session-Auth";

/// Delivers requests over HTTP(S) using an authenticated session.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    cookie: String,
    log: Logger,
}

// Sends "request", awaits "response", and returns an error on any
// non-success status code.
async fn send_and_check_ok(
    request: reqwest::RequestBuilder,
) -> Result<reqwest::Response, Error> {
    let response = request.send().await.map_err(Error::from)?;

    if !response.status().is_success() {
        return Err(Error::Status(response.status().as_u16()));
    }

    Ok(response)
}

// Extracts the session cookie from any `Set-Cookie` headers.
fn cookie_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .filter_map(|pair| pair.trim().strip_prefix(SESSION_COOKIE))
        .filter_map(|rest| rest.strip_prefix('='))
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

impl HttpTransport {
    /// Opens a session with the platform at `host`.
    ///
    /// The session cookie is taken from the `auth` result, falling back to a
    /// `Set-Cookie` header when the result does not carry one.
    pub async fn login(
        host: &str,
        username: &str,
        password: &str,
        timeout: Option<Duration>,
        log: Logger,
    ) -> Result<Self, Error> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;
        let endpoint = format!("{}{}", host.trim_end_matches('/'), API_PATH);
        let log = log.new(o!("vstack_host" => host.to_string()));

        let params = api::AuthParams {
            username: username.to_string(),
            password: password.to_string(),
        };
        let request = RequestEnvelope::new::<api::Auth>(&params)?;
        let response =
            send_and_check_ok(client.post(&endpoint).json(&request)).await?;
        let header_cookie = cookie_from_headers(response.headers());
        let envelope: ResponseEnvelope = response.json().await?;

        let data = envelope.decode::<api::Auth>().map_err(|e| match e {
            Error::Rpc { message, .. } | Error::Domain { message, .. } => {
                Error::Auth(message)
            }
            other => other,
        })?;
        let cookie = data
            .and_then(|d| d.cookie.get(SESSION_COOKIE).cloned())
            .filter(|c| !c.is_empty())
            .or(header_cookie)
            .ok_or_else(|| {
                Error::Auth(format!(
                    "no {SESSION_COOKIE} session cookie in {} response",
                    api::Auth::NAME
                ))
            })?;

        info!(log, "opened API session"; "username" => username);
        Ok(Self { client, endpoint, cookie, log })
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn send(
        &self,
        request: &RequestEnvelope,
    ) -> Result<ResponseEnvelope, Error> {
        slog::trace!(self.log, "POST request to {}", self.endpoint;
            "method" => &request.method);
        let request = self
            .client
            .post(&self.endpoint)
            .header(SESSION_HEADER, format!("{SESSION_COOKIE}={}", self.cookie))
            .json(request);
        let response = send_and_check_ok(request).await?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn session_cookie_from_set_cookie() {
        let mut headers = HeaderMap::new();
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("lang=en; Path=/"),
        );
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("APIEndpoint00=abc123; Path=/; HttpOnly"),
        );
        assert_eq!(cookie_from_headers(&headers).as_deref(), Some("abc123"));
    }

    #[test]
    fn session_cookie_absent() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("APIEndpoint00="));
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("APIEndpoint001=nope"),
        );
        assert_eq!(cookie_from_headers(&headers), None);
    }
}
