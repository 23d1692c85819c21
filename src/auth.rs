//! Credential Exchange
//!
//! Exchanges TradingView username/password credentials for an opaque auth
//! token over HTTPS. The websocket protocol itself only ever sees the token
//! (via the `set_auth_token` frame); this module is the black-box
//! `(user, pass) -> token | error` collaborator in front of it.
//!
//! # Flow
//!
//! 1. GET the sign-in page to prime CSRF cookies (some deployments enforce
//!    this; a failure here is not fatal).
//! 2. POST the credentials as a form, echoing the `csrftoken` cookie when
//!    present.
//! 3. Read `user.auth_token` from the JSON response body.

use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::CookieStore as _;
use reqwest::header::{
    ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, ORIGIN, REFERER, USER_AGENT,
};
use serde_json::Value;

/// Sign-in endpoint for the credential exchange.
pub const SIGN_IN_URL: &str = "https://www.tradingview.com/accounts/signin/";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Errors from the credential exchange.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Username or password was empty.
    #[error("username and password are required")]
    MissingCredentials,

    /// The HTTP exchange itself failed.
    #[error("sign-in request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The response body was not JSON.
    #[error("sign-in response was not JSON: {0}")]
    NotJson(#[from] serde_json::Error),

    /// The response carried no auth token.
    #[error("auth token missing: {message}")]
    TokenMissing {
        /// Server-provided error message, with the error code appended when
        /// one was present.
        message: String,
    },
}

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static("Mozilla/5.0"));
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("application/json, text/plain, */*"),
    );
    headers.insert(
        ACCEPT_LANGUAGE,
        HeaderValue::from_static("en-US,en;q=0.9"),
    );
    headers.insert(
        REFERER,
        HeaderValue::from_static("https://www.tradingview.com/"),
    );
    headers.insert(
        ORIGIN,
        HeaderValue::from_static("https://www.tradingview.com"),
    );
    headers
}

/// Exchange username/password credentials for an auth token.
///
/// # Errors
///
/// Returns [`AuthError::MissingCredentials`] when either credential is empty,
/// [`AuthError::Http`]/[`AuthError::NotJson`] on transport or body failures,
/// and [`AuthError::TokenMissing`] when the server answered without a token.
pub async fn fetch_auth_token(username: &str, password: &str) -> Result<String, AuthError> {
    if username.is_empty() || password.is_empty() {
        return Err(AuthError::MissingCredentials);
    }

    let jar = Arc::new(reqwest::cookie::Jar::default());
    let client = reqwest::Client::builder()
        .default_headers(default_headers())
        .cookie_provider(jar.clone())
        .timeout(REQUEST_TIMEOUT)
        .build()?;

    // Prime CSRF cookies; endpoint behavior varies by region/edge, so a
    // failed GET still proceeds to the POST attempt.
    if let Err(error) = client.get(SIGN_IN_URL).send().await {
        tracing::debug!(%error, "cookie priming request failed, continuing");
    }

    let csrf_token = reqwest::Url::parse(SIGN_IN_URL)
        .ok()
        .and_then(|url| jar.cookies(&url))
        .and_then(|header| header.to_str().map(str::to_string).ok())
        .and_then(|cookies| extract_cookie(&cookies, "csrftoken"));

    let mut form: Vec<(&str, String)> = vec![
        ("username", username.to_string()),
        ("password", password.to_string()),
        ("remember", "on".to_string()),
    ];

    let mut request = client.post(SIGN_IN_URL);
    if let Some(token) = csrf_token {
        form.push(("csrfmiddlewaretoken", token.clone()));
        request = request.header("X-CSRFToken", token);
    }

    let response = request.form(&form).send().await?.error_for_status()?;
    let body: Value = serde_json::from_str(&response.text().await?)?;
    extract_token(&body)
}

fn extract_cookie(cookie_header: &str, name: &str) -> Option<String> {
    cookie_header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

/// Pull the auth token out of a sign-in response body.
fn extract_token(body: &Value) -> Result<String, AuthError> {
    if let Some(token) = body
        .pointer("/user/auth_token")
        .and_then(Value::as_str)
        && !token.is_empty()
    {
        return Ok(token.to_string());
    }

    let mut message = body
        .get("error")
        .or_else(|| body.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("auth token missing")
        .to_string();
    if let Some(code) = body.get("code").filter(|c| !c.is_null()) {
        let code = code
            .as_str()
            .map_or_else(|| code.to_string(), str::to_string);
        message = format!("{message} (code={code})");
    }
    Err(AuthError::TokenMissing { message })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn extract_token_success() {
        let body = json!({"user": {"auth_token": "abc123", "id": 1}});
        assert_eq!(extract_token(&body).unwrap(), "abc123");
    }

    #[test]
    fn extract_token_missing_reports_server_message() {
        let body = json!({"error": "bad credentials"});
        match extract_token(&body) {
            Err(AuthError::TokenMissing { message }) => {
                assert_eq!(message, "bad credentials");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn extract_token_missing_appends_code() {
        let body = json!({"message": "rate limited", "code": "too_many_requests"});
        match extract_token(&body) {
            Err(AuthError::TokenMissing { message }) => {
                assert_eq!(message, "rate limited (code=too_many_requests)");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn extract_token_rejects_empty_token() {
        let body = json!({"user": {"auth_token": ""}});
        assert!(matches!(
            extract_token(&body),
            Err(AuthError::TokenMissing { .. })
        ));
    }

    #[tokio::test]
    async fn empty_credentials_fail_synchronously() {
        assert!(matches!(
            fetch_auth_token("", "secret").await,
            Err(AuthError::MissingCredentials)
        ));
        assert!(matches!(
            fetch_auth_token("user", "").await,
            Err(AuthError::MissingCredentials)
        ));
    }

    #[test]
    fn extract_cookie_finds_named_cookie() {
        let header = "sessionid=abc; csrftoken=tok123; theme=dark";
        assert_eq!(extract_cookie(header, "csrftoken").as_deref(), Some("tok123"));
        assert_eq!(extract_cookie(header, "missing"), None);
    }
}
