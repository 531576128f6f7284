use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use http::{header, StatusCode};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use strata_core::config::AuthConfig;
use strata_serving::response::{self, Body};
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

const SESSION_COOKIE: &str = "_strata_session";
const STATE_COOKIE: &str = "_strata_state";

pub const AUTH_PATH: &str = "/auth";
pub const CALLBACK_PATH: &str = "/auth/callback";

/// OAuth2 relay against the identity server. Authentication state
/// travels in HMAC-sealed cookies; authorization stays a yes/no call
/// per project answered upstream.
pub struct Auth {
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    server: String,
    key: Vec<u8>,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

impl Auth {
    pub fn new(http: reqwest::Client, config: &AuthConfig) -> Self {
        Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
            server: config.server.trim_end_matches('/').to_string(),
            key: config.cookie_secret.as_bytes().to_vec(),
            http,
        }
    }

    // ── cookie sealing ──────────────────────────────────────────

    fn seal(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(payload.as_bytes());
        let tag = mac.finalize().into_bytes();
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(payload),
            URL_SAFE_NO_PAD.encode(tag)
        )
    }

    fn unseal(&self, sealed: &str) -> Option<String> {
        let (payload_b64, tag_b64) = sealed.split_once('.')?;
        let payload = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
        let tag = URL_SAFE_NO_PAD.decode(tag_b64).ok()?;

        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(&payload);
        mac.verify_slice(&tag).ok()?;

        String::from_utf8(payload).ok()
    }

    // ── login flow ──────────────────────────────────────────────

    /// Redirect into the authorize endpoint, sealing the state (nonce
    /// plus the URL to return to) into a cookie.
    pub fn start_login(&self, host: &str, return_path: &str) -> http::Response<Body> {
        let nonce = uuid::Uuid::new_v4().to_string();
        let state = format!("{nonce}|{host}|{return_path}");
        let cookie = format!(
            "{STATE_COOKIE}={}; Path=/; HttpOnly; Secure; Max-Age=600",
            self.seal(&state)
        );

        let authorize = format!(
            "{}/oauth/authorize?client_id={}&redirect_uri={}&response_type=code&state={}",
            self.server,
            urlencode(&self.client_id),
            urlencode(&self.redirect_uri),
            urlencode(&nonce),
        );

        let mut resp = response::redirect(&authorize, StatusCode::FOUND);
        resp.headers_mut().insert(
            header::SET_COOKIE,
            cookie.parse().expect("cookie value is ascii"),
        );
        resp
    }

    /// Handle `/auth/callback`: verify the sealed state, exchange the
    /// code, and return to the original URL with a session cookie.
    pub async fn handle_callback(
        &self,
        query: &str,
        cookies: &HashMap<String, String>,
    ) -> http::Response<Body> {
        let params: HashMap<_, _> = parse_query(query);

        let Some(state) = cookies.get(STATE_COOKIE).and_then(|c| self.unseal(c)) else {
            warn!("auth callback without a valid state cookie");
            return response::error_response(StatusCode::NOT_FOUND);
        };
        let mut state_parts = state.splitn(3, '|');
        let nonce = state_parts.next().unwrap_or_default();
        let host = state_parts.next().unwrap_or_default();
        let return_path = state_parts.next().unwrap_or("/");

        if params.get("state").map(String::as_str) != Some(nonce) {
            warn!("auth callback with a mismatched state nonce");
            return response::error_response(StatusCode::NOT_FOUND);
        }

        let Some(code) = params.get("code") else {
            return response::error_response(StatusCode::NOT_FOUND);
        };

        match self.exchange_code(code).await {
            Ok(token) => {
                let cookie = format!(
                    "{SESSION_COOKIE}={}; Path=/; HttpOnly; Secure",
                    self.seal(&token)
                );
                let location = format!("//{host}{return_path}");
                let mut resp = response::redirect(&location, StatusCode::FOUND);
                resp.headers_mut().insert(
                    header::SET_COOKIE,
                    cookie.parse().expect("cookie value is ascii"),
                );
                resp
            }
            Err(err) => {
                warn!(error = %err, "oauth code exchange failed");
                response::error_response(StatusCode::SERVICE_UNAVAILABLE)
            }
        }
    }

    async fn exchange_code(&self, code: &str) -> Result<String, String> {
        let response = self
            .http
            .post(format!("{}/oauth/token", self.server))
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", self.redirect_uri.as_str()),
            ])
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("token endpoint returned {}", response.status()));
        }

        let token: TokenResponse = response.json().await.map_err(|e| e.to_string())?;
        Ok(token.access_token)
    }

    // ── session checks ──────────────────────────────────────────

    /// The access token from a valid session cookie.
    pub fn session_token(&self, cookies: &HashMap<String, String>) -> Option<String> {
        cookies.get(SESSION_COOKIE).and_then(|c| self.unseal(c))
    }

    /// Yes/no authorization for one project, answered by the identity
    /// server.
    pub async fn check_project_access(&self, token: &str, project_id: u64) -> bool {
        let url = format!("{}/api/v4/projects/{project_id}/pages_access", self.server);
        match self.http.get(&url).bearer_auth(token).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                debug!(error = %err, project_id, "pages access check failed");
                false
            }
        }
    }
}

// ── request helpers ─────────────────────────────────────────────

pub fn parse_cookies(raw: Option<&str>) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    let Some(raw) = raw else {
        return cookies;
    };
    for pair in raw.split(';') {
        if let Some((name, value)) = pair.trim().split_once('=') {
            cookies.insert(name.to_string(), value.to_string());
        }
    }
    cookies
}

pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), urldecode(v)))
        .collect()
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

fn urldecode(s: &str) -> String {
    let mut out = Vec::with_capacity(s.len());
    let mut bytes = s.bytes();
    while let Some(b) = bytes.next() {
        match b {
            b'%' => {
                let hi = bytes.next();
                let lo = bytes.next();
                match (hi, lo) {
                    (Some(hi), Some(lo)) => {
                        let hex = [hi, lo];
                        if let Ok(value) =
                            u8::from_str_radix(std::str::from_utf8(&hex).unwrap_or(""), 16)
                        {
                            out.push(value);
                        }
                    }
                    _ => break,
                }
            }
            b'+' => out.push(b' '),
            other => out.push(other),
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
