//
// Saxo OAuth2 PKCE/client-secret engine.
//
// The `oauth2` crate builds the authorize URL and handles PKCE/CSRF
// (`authorize_url`, `PkceCodeChallenge::new_random_sha256`, `CsrfToken`).
// Saxo's token endpoint returns a field (`refresh_token_expires_in`) that
// isn't in the standard token response `oauth2` models, so the actual
// exchange/refresh POSTs are built by hand with `reqwest`. The loopback
// callback listener reuses `rocket` instead of pulling in a second web
// framework for a single ephemeral route. `webbrowser` opens the user's
// browser.

use std::net::SocketAddr;
use std::time::Duration;

use data_encoding::BASE64URL_NOPAD;
use oauth2::basic::BasicClient;
use oauth2::{AuthUrl, ClientId, CsrfToken, PkceCodeChallenge, RedirectUrl, Scope};
use rocket::form::FromForm;
use rocket::{get, routes, State};
use serde::Deserialize;
use tokio::sync::oneshot;

use crate::config::Config;
use crate::crypto;
use crate::err_sentinel;
use crate::error::Error;
use crate::registry::Registry;
use crate::session::{BrokerConnection, OAuthSession, OAuthStatus, Session};
use crate::util;

const OAUTH_FLOW_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_LOOPBACK_PORT: u16 = 33847;

/// Builds the authorize URL, CSRF state, and (if PKCE applies) the code
/// verifier to keep for the exchange.
fn build_authorize_url(config: &Config, app_key: &str, redirect_uri: &str, uses_pkce: bool) -> Result<(String, String, Option<String>), Error> {
    let auth_url = AuthUrl::new(format!("{}/authorize", config.saxo_oauth_base_url()))
        .map_err(|e| Error::new("invalid Saxo authorize URL", e.to_string()))?;
    let redirect = RedirectUrl::new(redirect_uri.to_string()).map_err(|e| Error::new("invalid redirect URI", e.to_string()))?;

    let client = BasicClient::new(ClientId::new(app_key.to_string())).set_auth_uri(auth_url).set_redirect_uri(redirect);

    static BASE64URL_NOPAD_REF: &data_encoding::Encoding = &BASE64URL_NOPAD;
    let state = CsrfToken::new(crypto::encode_random_bytes::<16>(BASE64URL_NOPAD_REF));
    let mut auth_req = client.authorize_url(|| state.clone()).add_scope(Scope::new("openapi".to_string()));

    let verifier = if uses_pkce {
        let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
        auth_req = auth_req.set_pkce_challenge(challenge);
        Some(verifier.into_secret())
    } else {
        None
    };

    let (auth_url, csrf) = auth_req.url();
    Ok((auth_url.to_string(), csrf.secret().clone(), verifier))
}

/// Single-flight gate: either starts a fresh flow and records its authorize
/// URL, or fails because one is already in flight. Callers read the URL
/// back via `Registry::get_oauth_url`.
pub fn start(registry: &Registry, config: &Config, connection: &BrokerConnection) -> Result<(), Error> {
    let now = util::now();
    let window = config.oauth_single_flight_window_secs() as i64;

    if registry.begin_oauth(&connection.id, now, window).is_err() {
        err_sentinel!(OAuthInProgress, "an OAuth flow is already in progress for this connection");
    }

    let app_key = connection.app_key.clone().unwrap_or_else(|| config.saxo_app_key_fallback().unwrap_or_default());
    let app_secret = connection.app_secret.clone();
    let redirect_uri = connection
        .redirect_uri
        .clone()
        .unwrap_or_else(|| format!("http://localhost:{DEFAULT_LOOPBACK_PORT}/callback"));

    let (auth_url, state, verifier) = build_authorize_url(config, &app_key, &redirect_uri, connection.uses_pkce())?;

    registry.insert_oauth(OAuthSession {
        connection_id: connection.id.clone(),
        state,
        verifier,
        app_key,
        app_secret,
        redirect_uri,
        started_at: now,
        status: OAuthStatus::Pending,
        auth_url,
        error_msg: None,
    });

    Ok(())
}

/// Runs the full browser-redirect flow in the background. Spawn this as its
/// own task once `start` has returned; its own timeout doubles as its
/// shutdown signal and join point.
pub async fn run_flow(registry: Registry, config: Config, connection_id: String) {
    let Some(session_snapshot) = current_oauth_session(&registry, &connection_id) else {
        return;
    };

    let (tx, rx) = oneshot::channel::<Result<String, String>>();
    let listener = match spawn_callback_listener(&session_snapshot.redirect_uri, session_snapshot.state.clone(), tx).await {
        Ok(listener) => listener,
        Err(e) => {
            fail_oauth(&registry, &connection_id, &e.to_string());
            return;
        }
    };

    registry.update_oauth(&connection_id, |s| s.status = OAuthStatus::Waiting);

    if webbrowser::open(&session_snapshot.auth_url).is_err() {
        log::warn!("failed to open system browser; authorize manually at {}", session_snapshot.auth_url);
    }

    let code = match tokio::time::timeout(OAUTH_FLOW_TIMEOUT, rx).await {
        Err(_) => {
            fail_oauth(&registry, &connection_id, "OAuth flow timed out");
            listener.shutdown();
            return;
        }
        Ok(Err(_)) => {
            fail_oauth(&registry, &connection_id, "OAuth callback channel closed unexpectedly");
            return;
        }
        Ok(Ok(Err(msg))) => {
            fail_oauth(&registry, &connection_id, &msg);
            return;
        }
        Ok(Ok(Ok(code))) => code,
    };

    registry.update_oauth(&connection_id, |s| s.status = OAuthStatus::Exchanging);

    match exchange_code(&config, &session_snapshot, &code).await {
        Ok(session) => {
            registry.cache_session(&connection_id, Some(session));
            registry.update_oauth(&connection_id, |s| s.status = OAuthStatus::Complete);
        }
        Err(e) => fail_oauth(&registry, &connection_id, &e.to_string()),
    }
}

fn fail_oauth(registry: &Registry, connection_id: &str, msg: &str) {
    registry.update_oauth(connection_id, |s| {
        s.status = OAuthStatus::Failed;
        s.error_msg = Some(msg.to_string());
    });
}

fn current_oauth_session(registry: &Registry, connection_id: &str) -> Option<OAuthSession> {
    let mut snapshot = None;
    registry.update_oauth(connection_id, |s| snapshot = Some(s.clone()));
    snapshot
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token_expires_in: Option<u64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

impl TokenResponse {
    fn into_session(
        self,
        now: chrono::DateTime<chrono::Utc>,
        fallback_refresh_token: Option<&str>,
        fallback_refresh_expires_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Session, Error> {
        if let Some(err) = self.error {
            return Err(Error::new(format!("Saxo token endpoint returned an error: {err}"), self.error_description.unwrap_or(err)));
        }
        let access_token = self.access_token.ok_or_else(|| Error::new("Saxo token response missing access_token", "missing access_token"))?;
        let token_type = self.token_type.ok_or_else(|| Error::new("Saxo token response missing token_type", "missing token_type"))?;
        let expires_in = self.expires_in.ok_or_else(|| Error::new("Saxo token response missing expires_in", "missing expires_in"))?;
        let refresh_token = self.refresh_token.or_else(|| fallback_refresh_token.map(str::to_string)).unwrap_or_default();
        let refresh_expires_at = match self.refresh_token_expires_in {
            Some(secs) => now + chrono::Duration::seconds(secs as i64),
            None => fallback_refresh_expires_at
                .ok_or_else(|| Error::new("Saxo token response missing refresh_token_expires_in", "missing refresh_token_expires_in"))?,
        };

        Ok(Session::Saxo {
            access_token,
            refresh_token,
            token_type,
            expires_at: now + chrono::Duration::seconds(expires_in as i64),
            refresh_expires_at,
            client_key: None,
        })
    }
}

/// Exchanges the authorization code at `/token`.
async fn exchange_code(config: &Config, session: &OAuthSession, code: &str) -> Result<Session, Error> {
    let http = crate::http_client::plain_client()?;

    let mut form = vec![
        ("grant_type", "authorization_code".to_string()),
        ("code", code.to_string()),
        ("redirect_uri", session.redirect_uri.clone()),
        ("client_id", session.app_key.clone()),
    ];
    match (&session.app_secret, &session.verifier) {
        (Some(secret), _) if !secret.is_empty() => form.push(("client_secret", secret.clone())),
        (_, Some(verifier)) => form.push(("code_verifier", verifier.clone())),
        _ => {}
    }

    let resp: TokenResponse = http.post(format!("{}/token", config.saxo_oauth_base_url())).form(&form).send().await?.json().await?;

    resp.into_session(util::now(), None, None)
}

/// Requires a non-expired `refresh_expires_at`, never sends PKCE or a
/// client secret.
pub async fn refresh_access_token(config: &Config, app_key: &str, session: &Session) -> Result<Session, Error> {
    let Session::Saxo { refresh_token, refresh_expires_at, .. } = session else {
        err_sentinel!(RefreshTokenExpired, "refresh is only defined for Saxo sessions");
    };

    if *refresh_expires_at <= util::now() {
        err_sentinel!(RefreshTokenExpired, "Saxo refresh token has expired");
    }

    let http = crate::http_client::plain_client()?;
    let form = [("grant_type", "refresh_token"), ("refresh_token", refresh_token.as_str()), ("client_id", app_key)];

    let resp: TokenResponse = http.post(format!("{}/token", config.saxo_oauth_base_url())).form(&form).send().await?.json().await?;

    resp.into_session(util::now(), Some(refresh_token), Some(*refresh_expires_at))
}

/// Returns the cache when fresh, otherwise refreshes, otherwise evicts and
/// fails.
pub async fn get_or_refresh_session(registry: &Registry, config: &Config, connection: &BrokerConnection) -> Result<Session, Error> {
    let now = util::now();

    if let Some(session) = registry.get_cached_session(&connection.id, now) {
        return Ok(session);
    }

    let Some(stale) = registry.peek_cached_session(&connection.id) else {
        err_sentinel!(RefreshTokenExpired, "no cached session to refresh");
    };

    let app_key = connection.app_key.clone().unwrap_or_default();
    match refresh_access_token(config, &app_key, &stale).await {
        Ok(refreshed) => {
            registry.cache_session(&connection.id, Some(refreshed.clone()));
            Ok(refreshed)
        }
        Err(e) => {
            registry.invalidate_cached_session(&connection.id);
            Err(e)
        }
    }
}

#[derive(FromForm)]
struct CallbackQuery {
    state: Option<String>,
    code: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

struct CallbackState {
    expected_state: String,
    tx: std::sync::Mutex<Option<oneshot::Sender<Result<String, String>>>>,
}

#[get("/callback?<query..>")]
fn callback(query: CallbackQuery, state: &State<CallbackState>) -> &'static str {
    let result = if let Some(err) = query.error {
        Err(format!("OAuth error: {err} ({})", query.error_description.unwrap_or_default()))
    } else if query.state.as_deref() != Some(state.expected_state.as_str()) {
        Err("state mismatch".to_string())
    } else if let Some(code) = query.code {
        Ok(code)
    } else {
        Err("missing authorization code".to_string())
    };

    if let Some(tx) = state.tx.lock().unwrap().take() {
        let _ = tx.send(result);
    }

    "You can close this window and return to the app."
}

struct ListenerHandle {
    shutdown: rocket::Shutdown,
}

impl ListenerHandle {
    fn shutdown(&self) {
        self.shutdown.clone().notify();
    }
}

/// Binds the loopback port before committing to the flow, so a port already
/// in use is reported to the caller immediately instead of surfacing as a
/// 5-minute timeout after the browser has already opened.
fn probe_listener_port(addr: SocketAddr) -> Result<(), Error> {
    std::net::TcpListener::bind(addr)
        .map(|_| ())
        .map_err(|e| Error::new(format!("failed to bind OAuth callback listener on {addr}"), e.to_string()))
}

async fn spawn_callback_listener(redirect_uri: &str, expected_state: String, tx: oneshot::Sender<Result<String, String>>) -> Result<ListenerHandle, Error> {
    let addr: SocketAddr = parse_redirect_addr(redirect_uri);
    probe_listener_port(addr)?;

    let figment = rocket::Config::figment()
        .merge(("address", addr.ip()))
        .merge(("port", addr.port()))
        .merge(("log_level", rocket::config::LogLevel::Off));

    let rocket = rocket::custom(figment)
        .manage(CallbackState {
            expected_state,
            tx: std::sync::Mutex::new(Some(tx)),
        })
        .mount("/", routes![callback]);

    let rocket = rocket.ignite().await.map_err(|e| Error::new("failed to start OAuth callback listener", e.to_string()))?;

    let shutdown = rocket.shutdown();
    tokio::spawn(async move {
        let _ = rocket.launch().await;
    });

    Ok(ListenerHandle { shutdown })
}

fn parse_redirect_addr(redirect_uri: &str) -> SocketAddr {
    url::Url::parse(redirect_uri)
        .ok()
        .and_then(|u| {
            let host = u.host_str()?.to_string();
            let port = u.port().unwrap_or(DEFAULT_LOOPBACK_PORT);
            format!("{host}:{port}").parse().ok().or_else(|| format!("127.0.0.1:{port}").parse().ok())
        })
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], DEFAULT_LOOPBACK_PORT)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_redirect_addr_uses_configured_port() {
        let addr = parse_redirect_addr("http://localhost:33847/callback");
        assert_eq!(addr.port(), 33847);
    }

    #[test]
    fn parse_redirect_addr_falls_back_on_garbage() {
        let addr = parse_redirect_addr("not a url");
        assert_eq!(addr.port(), DEFAULT_LOOPBACK_PORT);
    }

    #[test]
    fn token_response_surfaces_provider_error() {
        let resp = TokenResponse {
            access_token: None,
            refresh_token: None,
            token_type: None,
            expires_in: None,
            refresh_token_expires_in: None,
            error: Some("invalid_grant".to_string()),
            error_description: Some("code expired".to_string()),
        };
        let err = resp.into_session(util::now(), None, None).unwrap_err();
        assert!(err.to_string().contains("invalid_grant"));
    }

    #[test]
    fn token_response_falls_back_to_prior_refresh_token_when_absent() {
        let now = util::now();
        let resp = TokenResponse {
            access_token: Some("at".to_string()),
            refresh_token: None,
            token_type: Some("Bearer".to_string()),
            expires_in: Some(1200),
            refresh_token_expires_in: None,
            error: None,
            error_description: None,
        };
        let session = resp.into_session(now, Some("old-refresh"), Some(now + chrono::Duration::hours(2))).unwrap();
        let Session::Saxo { refresh_token, .. } = session else {
            panic!("expected Saxo session")
        };
        assert_eq!(refresh_token, "old-refresh");
    }

    #[test]
    fn token_response_carries_actual_token_type() {
        let now = util::now();
        let resp = TokenResponse {
            access_token: Some("at".to_string()),
            refresh_token: Some("rt".to_string()),
            token_type: Some("Bearer2".to_string()),
            expires_in: Some(1200),
            refresh_token_expires_in: Some(3600),
            error: None,
            error_description: None,
        };
        let session = resp.into_session(now, None, None).unwrap();
        let Session::Saxo { token_type, .. } = session else {
            panic!("expected Saxo session")
        };
        assert_eq!(token_type, "Bearer2");
    }

    #[test]
    fn token_response_missing_expires_in_is_an_error() {
        let resp = TokenResponse {
            access_token: Some("at".to_string()),
            refresh_token: Some("rt".to_string()),
            token_type: Some("Bearer".to_string()),
            expires_in: None,
            refresh_token_expires_in: Some(3600),
            error: None,
            error_description: None,
        };
        assert!(resp.into_session(util::now(), None, None).is_err());
    }

    #[test]
    fn token_response_missing_refresh_expiry_with_no_fallback_is_an_error() {
        let resp = TokenResponse {
            access_token: Some("at".to_string()),
            refresh_token: Some("rt".to_string()),
            token_type: Some("Bearer".to_string()),
            expires_in: Some(1200),
            refresh_token_expires_in: None,
            error: None,
            error_description: None,
        };
        assert!(resp.into_session(util::now(), None, None).is_err());
    }

    #[tokio::test]
    async fn spawn_callback_listener_fails_fast_on_occupied_port() {
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();
        let (tx, _rx) = oneshot::channel::<Result<String, String>>();

        let result = spawn_callback_listener(&format!("http://127.0.0.1:{port}/callback"), "state".to_string(), tx).await;
        assert!(result.is_err());
    }
}
