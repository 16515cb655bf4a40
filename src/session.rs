use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, trace, warn};

use crate::config::DeviceEndpoint;
use crate::digest::{client_nonce, Challenge};
use crate::error::{AuthError, FetchError, PollError};

const USER_AGENT: &str = "aiseg2/ha-integration";

/// A raw response from the device, after any digest handshake.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

/// One digest-authenticated HTTP session to the AiSEG2.
///
/// The challenge and nonce counter are owned here and nowhere else. A 401 on an
/// established session discards the challenge; one fresh handshake is allowed per
/// poll cycle before the failure is surfaced.
#[derive(Debug)]
pub struct DigestSession {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: SecretString,
    challenge: Option<Challenge>,
    nonce_count: u32,
    reauth_spent: bool,
}

impl DigestSession {
    /// Prepares a session for `endpoint`. No request is sent until the first
    /// [`request`](Self::request), which performs the handshake.
    pub fn authenticate(endpoint: &DeviceEndpoint, timeout: Duration) -> Result<Self, PollError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| FetchError::Unreachable(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: endpoint.base_url(),
            username: endpoint.username.clone(),
            password: endpoint.password.clone(),
            challenge: None,
            nonce_count: 0,
            reauth_spent: false,
        })
    }

    /// Re-arms the once-per-cycle re-handshake allowance.
    pub fn begin_cycle(&mut self) {
        self.reauth_spent = false;
    }

    pub fn is_authenticated(&self) -> bool {
        self.challenge.is_some()
    }

    /// GETs `path`, answering a digest challenge if the device asks for one.
    pub async fn request(&mut self, path: &str) -> Result<HttpResponse, PollError> {
        let sent_credentials = self.challenge.is_some();
        let (first, header) = self.send(path).await?;
        if first.status != StatusCode::UNAUTHORIZED.as_u16() {
            return Ok(first);
        }

        if sent_credentials {
            // Device rebooted, or someone logged in to the config UI meanwhile.
            self.challenge = None;
            if self.reauth_spent {
                warn!("AiSEG2 rejected the session again in this cycle");
                return Err(AuthError::Rejected.into());
            }
            self.reauth_spent = true;
            warn!("AiSEG2 invalidated the digest session, re-authenticating");
        }

        let header = header.ok_or(AuthError::MissingChallenge)?;
        let challenge = Challenge::parse(&header)?;
        debug!(
            "Digest challenge from {}: realm {}, stale {}",
            self.base_url, challenge.realm, challenge.stale
        );
        self.challenge = Some(challenge);
        self.nonce_count = 0;

        let (second, _) = self.send(path).await?;
        if second.status == StatusCode::UNAUTHORIZED.as_u16() {
            self.challenge = None;
            return Err(AuthError::Rejected.into());
        }
        Ok(second)
    }

    /// Sends one GET. Returns the response and, for a 401, its challenge header.
    async fn send(&mut self, path: &str) -> Result<(HttpResponse, Option<String>), PollError> {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.http.get(&url);

        if let Some(challenge) = &self.challenge {
            self.nonce_count += 1;
            let cnonce = client_nonce();
            let authorization = challenge.authorization(
                &self.username,
                self.password.expose_secret(),
                "GET",
                path,
                self.nonce_count,
                &cnonce,
            );
            builder = builder.header(AUTHORIZATION, authorization);
        }

        trace!("GET {} (nc={})", url, self.nonce_count);
        let response = builder.send().await.map_err(classify_transport_error)?;

        let status = response.status().as_u16();
        let challenge_header = response
            .headers()
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find(|v| v.to_ascii_lowercase().contains("digest"))
            .map(String::from);
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response.text().await.map_err(classify_transport_error)?;

        Ok((
            HttpResponse {
                status,
                content_type,
                body,
            },
            challenge_header,
        ))
    }
}

fn classify_transport_error(err: reqwest::Error) -> PollError {
    if err.is_timeout() {
        FetchError::Timeout.into()
    } else if err.is_decode() {
        FetchError::Malformed(err.to_string()).into()
    } else {
        FetchError::Unreachable(err.to_string()).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    const CHALLENGE: &str = r#"Digest realm="AiSEG2", nonce="n0nce", qop="auth", opaque="0paque""#;

    fn endpoint(server: &mockito::Server) -> DeviceEndpoint {
        DeviceEndpoint::new(server.url(), "admin", "secret")
    }

    fn session(server: &mockito::Server) -> DigestSession {
        DigestSession::authenticate(&endpoint(server), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_challenge_then_success() {
        let mut server = mockito::Server::new_async().await;

        let challenge = server
            .mock("GET", "/page/graph/51111")
            .match_header("authorization", Matcher::Missing)
            .with_status(401)
            .with_header("www-authenticate", CHALLENGE)
            .expect(1)
            .create_async()
            .await;
        let authed = server
            .mock("GET", "/page/graph/51111")
            .match_header(
                "authorization",
                Matcher::Regex(r#"^Digest username="admin".*nc=00000001"#.to_string()),
            )
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body("<html>ok</html>")
            .expect(1)
            .create_async()
            .await;

        let mut session = session(&server);
        let response = session.request("/page/graph/51111").await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, "<html>ok</html>");
        assert!(session.is_authenticated());
        challenge.assert_async().await;
        authed.assert_async().await;
    }

    #[tokio::test]
    async fn test_repeated_401_is_auth_error_without_third_request() {
        let mut server = mockito::Server::new_async().await;

        let challenge = server
            .mock("GET", "/page/graph/51111")
            .match_header("authorization", Matcher::Missing)
            .with_status(401)
            .with_header("www-authenticate", CHALLENGE)
            .expect(1)
            .create_async()
            .await;
        let rejected = server
            .mock("GET", "/page/graph/51111")
            .match_header("authorization", Matcher::Regex("^Digest ".to_string()))
            .with_status(401)
            .with_header("www-authenticate", CHALLENGE)
            .expect(1)
            .create_async()
            .await;

        let mut session = session(&server);
        let err = session.request("/page/graph/51111").await.unwrap_err();

        assert_eq!(err, PollError::Auth(AuthError::Rejected));
        assert!(!session.is_authenticated());
        challenge.assert_async().await;
        rejected.assert_async().await;
    }

    #[tokio::test]
    async fn test_nonce_count_increments_per_request() {
        let mut server = mockito::Server::new_async().await;

        server
            .mock("GET", "/a")
            .match_header("authorization", Matcher::Missing)
            .with_status(401)
            .with_header("www-authenticate", CHALLENGE)
            .create_async()
            .await;
        let first = server
            .mock("GET", "/a")
            .match_header("authorization", Matcher::Regex("nc=00000001".to_string()))
            .with_status(200)
            .with_body("<html></html>")
            .expect(1)
            .create_async()
            .await;
        let second = server
            .mock("GET", "/b")
            .match_header("authorization", Matcher::Regex("nc=00000002".to_string()))
            .with_status(200)
            .with_body("<html></html>")
            .expect(1)
            .create_async()
            .await;

        let mut session = session(&server);
        session.request("/a").await.unwrap();
        session.request("/b").await.unwrap();

        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_reauthenticates_once_per_cycle() {
        let mut server = mockito::Server::new_async().await;
        let fresh = r#"Digest realm="AiSEG2", nonce="n1", qop="auth""#;

        server
            .mock("GET", "/a")
            .match_header("authorization", Matcher::Missing)
            .with_status(401)
            .with_header("www-authenticate", CHALLENGE)
            .create_async()
            .await;
        server
            .mock("GET", "/a")
            .match_header("authorization", Matcher::Regex(r#"nonce="n0nce""#.to_string()))
            .with_status(200)
            .with_body("<html></html>")
            .create_async()
            .await;
        // Device reboots: the old nonce is refused and a new one offered.
        let stale = server
            .mock("GET", "/b")
            .match_header("authorization", Matcher::Regex(r#"nonce="n0nce""#.to_string()))
            .with_status(401)
            .with_header("www-authenticate", fresh)
            .expect(1)
            .create_async()
            .await;
        let renewed = server
            .mock("GET", "/b")
            .match_header(
                "authorization",
                Matcher::Regex(r#"nonce="n1".*nc=00000001"#.to_string()),
            )
            .with_status(200)
            .with_body("<html></html>")
            .expect(1)
            .create_async()
            .await;
        server
            .mock("GET", "/c")
            .with_status(401)
            .with_header("www-authenticate", fresh)
            .create_async()
            .await;

        let mut session = session(&server);
        session.begin_cycle();
        session.request("/a").await.unwrap();
        let response = session.request("/b").await.unwrap();
        assert_eq!(response.status, 200);
        stale.assert_async().await;
        renewed.assert_async().await;

        // The allowance is spent for this cycle.
        let err = session.request("/c").await.unwrap_err();
        assert_eq!(err, PollError::Auth(AuthError::Rejected));
    }

    #[tokio::test]
    async fn test_missing_challenge_header() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/a")
            .with_status(401)
            .create_async()
            .await;

        let mut session = session(&server);
        let err = session.request("/a").await.unwrap_err();
        assert_eq!(err, PollError::Auth(AuthError::MissingChallenge));
    }

    #[tokio::test]
    async fn test_non_auth_statuses_pass_through() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/a")
            .with_status(503)
            .with_body("busy")
            .create_async()
            .await;

        let mut session = session(&server);
        let response = session.request("/a").await.unwrap();
        assert_eq!(response.status, 503);
    }

    #[test]
    fn test_debug_output_hides_password() {
        let endpoint = DeviceEndpoint::new("http://127.0.0.1:1", "admin", "hunter2");
        let session = DigestSession::authenticate(&endpoint, Duration::from_secs(1)).unwrap();
        let rendered = format!("{session:?}");
        assert!(rendered.contains("admin"));
        assert!(!rendered.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_unreachable_device_is_classified() {
        let endpoint = DeviceEndpoint::new("127.0.0.1:1", "admin", "secret");
        let mut session = DigestSession::authenticate(&endpoint, Duration::from_secs(2)).unwrap();

        let err = session.request("/a").await.unwrap_err();
        assert!(err.is_retryable(), "expected retryable error, got {err:?}");
    }
}
