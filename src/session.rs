//
// Data model shared by every component.
//

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};

use crate::error::Error;

/// Buffer within which a cached session is treated as unusable and must be
/// refreshed (Saxo) or discarded (Nordnet) rather than handed to a caller.
pub const SESSION_EXPIRY_BUFFER_SECS: i64 = 5 * 60;

/// Window past which an in-flight OAuth/MitID attempt is considered stale
/// and may be replaced by a new one (exposed via `Config`).
pub const DEFAULT_SINGLE_FLIGHT_WINDOW_SECS: i64 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerType {
    Nordnet,
    Saxo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Country {
    Dk,
    Se,
    No,
    Fi,
}

impl Country {
    pub fn code(self) -> &'static str {
        match self {
            Country::Dk => "dk",
            Country::Se => "se",
            Country::No => "no",
            Country::Fi => "fi",
        }
    }
}

/// Persisted, read-only to this crate. The owning repository constructs
/// and loads these; this crate never writes the row itself, only the
/// `last_sync_status`/`last_sync_error` fields via `ConnectionRepository`.
#[derive(Debug, Clone)]
pub struct BrokerConnection {
    pub id: String,
    pub user_id: String,
    pub broker_type: BrokerType,
    pub country: Option<Country>,
    pub username: Option<String>,
    pub cpr: Option<String>,
    pub app_key: Option<String>,
    pub app_secret: Option<String>,
    pub redirect_uri: Option<String>,
    pub last_sync_status: Option<String>,
    pub last_sync_error: Option<String>,
}

impl BrokerConnection {
    /// Nordnet connections require `cpr`/`username`/`country`; Saxo
    /// connections require `app_key` and `redirect_uri` (an empty/absent
    /// `app_secret` selects PKCE).
    pub fn validate(&self) -> Result<(), Error> {
        match self.broker_type {
            BrokerType::Nordnet => {
                if self.cpr.is_none() || self.username.is_none() || self.country.is_none() {
                    return Err(Error::new(
                        "Nordnet connection is missing required fields",
                        format!("connection {} missing cpr/username/country", self.id),
                    ));
                }
            }
            BrokerType::Saxo => {
                if self.app_key.is_none() || self.redirect_uri.is_none() {
                    return Err(Error::new(
                        "Saxo connection is missing required fields",
                        format!("connection {} missing app_key/redirect_uri", self.id),
                    ));
                }
            }
        }
        Ok(())
    }

    /// An empty or absent `app_secret` selects the PKCE variant.
    pub fn uses_pkce(&self) -> bool {
        self.app_secret.as_deref().is_none_or(str::is_empty)
    }
}

/// In-memory session artifact produced by either auth flow.
#[derive(Debug, Clone)]
pub enum Session {
    Nordnet {
        jwt: String,
        ntag: String,
        domain: String,
        cookies: Vec<String>,
        expires_at: DateTime<Utc>,
    },
    Saxo {
        access_token: String,
        refresh_token: String,
        token_type: String,
        expires_at: DateTime<Utc>,
        refresh_expires_at: DateTime<Utc>,
        client_key: Option<String>,
    },
}

impl Session {
    pub fn expires_at(&self) -> DateTime<Utc> {
        match self {
            Session::Nordnet { expires_at, .. } => *expires_at,
            Session::Saxo { expires_at, .. } => *expires_at,
        }
    }

    /// A session within the 5-minute buffer of expiry must not be returned
    /// to callers as-is.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        now + chrono::Duration::seconds(SESSION_EXPIRY_BUFFER_SECS) > self.expires_at()
    }

    pub fn refresh_expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Session::Saxo { refresh_expires_at, .. } => Some(*refresh_expires_at),
            Session::Nordnet { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthStatus {
    Pending,
    Waiting,
    Exchanging,
    Complete,
    Failed,
}

impl OAuthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OAuthStatus::Pending => "pending",
            OAuthStatus::Waiting => "waiting",
            OAuthStatus::Exchanging => "exchanging",
            OAuthStatus::Complete => "complete",
            OAuthStatus::Failed => "failed",
        }
    }
}

/// In-memory, transient, observable by UI polling. At most one per
/// connection; the registry evicts entries older than the single-flight
/// window.
#[derive(Debug, Clone)]
pub struct OAuthSession {
    pub connection_id: String,
    pub state: String,
    pub verifier: Option<String>,
    pub app_key: String,
    pub app_secret: Option<String>,
    pub redirect_uri: String,
    pub started_at: DateTime<Utc>,
    pub status: OAuthStatus,
    pub auth_url: String,
    pub error_msg: Option<String>,
}

impl OAuthSession {
    pub fn is_stale(&self, now: DateTime<Utc>, window_secs: i64) -> bool {
        (now - self.started_at) > chrono::Duration::seconds(window_secs)
    }
}

/// Same single-flight invariant as `OAuthSession`.
#[derive(Debug, Clone)]
pub struct MitIDSession {
    pub connection_id: String,
    pub qr_dir: String,
    pub started_at: DateTime<Utc>,
}

impl MitIDSession {
    pub fn is_stale(&self, now: DateTime<Utc>, window_secs: i64) -> bool {
        (now - self.started_at) > chrono::Duration::seconds(window_secs)
    }
}

#[derive(Debug, Clone)]
pub struct SyncResult {
    pub accounts_synced: u32,
    pub positions_synced: u32,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Started,
    Success,
    Error,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Started => "started",
            SyncStatus::Success => "success",
            SyncStatus::Error => "error",
        }
    }
}

/// Persisted, write-only from this crate.
#[derive(Debug, Clone)]
pub struct SyncHistory {
    pub id: String,
    pub connection_id: String,
    pub sync_type: String,
    pub status: SyncStatus,
    pub accounts_synced: u32,
    pub positions_synced: u32,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// Upsert target of the sync orchestrator, keyed by `(account_id, external_id)`.
#[derive(Debug, Clone)]
pub struct Holding {
    pub account_id: String,
    pub external_id: String,
    pub symbol: String,
    pub quantity: BigDecimal,
    pub cost_basis: BigDecimal,
    pub market_value: BigDecimal,
    pub currency: String,
    pub last_updated: DateTime<Utc>,
}

/// A Saxo position merged with its instrument details.
#[derive(Debug, Clone)]
pub struct PositionWithDetails {
    pub external_id: String,
    pub symbol: String,
    pub quantity: BigDecimal,
    pub cost_basis: BigDecimal,
    pub market_value: BigDecimal,
    pub currency: String,
    pub uic: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nordnet_connection() -> BrokerConnection {
        BrokerConnection {
            id: "c1".into(),
            user_id: "u1".into(),
            broker_type: BrokerType::Nordnet,
            country: Some(Country::Dk),
            username: Some("mitid-user".into()),
            cpr: Some("1234567890".into()),
            app_key: None,
            app_secret: None,
            redirect_uri: None,
            last_sync_status: None,
            last_sync_error: None,
        }
    }

    #[test]
    fn nordnet_requires_cpr_username_country() {
        let mut c = nordnet_connection();
        c.cpr = None;
        assert!(c.validate().is_err());
    }

    #[test]
    fn nordnet_valid_connection_passes() {
        assert!(nordnet_connection().validate().is_ok());
    }

    #[test]
    fn saxo_requires_app_key_and_redirect_uri() {
        let c = BrokerConnection {
            id: "c2".into(),
            user_id: "u1".into(),
            broker_type: BrokerType::Saxo,
            country: None,
            username: None,
            cpr: None,
            app_key: None,
            app_secret: None,
            redirect_uri: Some("http://localhost:33847/callback".into()),
            last_sync_status: None,
            last_sync_error: None,
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn empty_app_secret_selects_pkce() {
        let mut c = nordnet_connection();
        c.broker_type = BrokerType::Saxo;
        c.app_key = Some("key".into());
        c.redirect_uri = Some("http://localhost:33847/callback".into());
        c.app_secret = Some(String::new());
        assert!(c.uses_pkce());
        c.app_secret = Some("secret".into());
        assert!(!c.uses_pkce());
    }

    #[test]
    fn session_needs_refresh_within_buffer() {
        let now = Utc::now();
        let session = Session::Saxo {
            access_token: "a".into(),
            refresh_token: "r".into(),
            token_type: "Bearer".into(),
            expires_at: now + chrono::Duration::seconds(60),
            refresh_expires_at: now + chrono::Duration::hours(1),
            client_key: None,
        };
        assert!(session.needs_refresh(now));
    }

    #[test]
    fn session_fresh_outside_buffer() {
        let now = Utc::now();
        let session = Session::Saxo {
            access_token: "a".into(),
            refresh_token: "r".into(),
            token_type: "Bearer".into(),
            expires_at: now + chrono::Duration::hours(1),
            refresh_expires_at: now + chrono::Duration::hours(2),
            client_key: None,
        };
        assert!(!session.needs_refresh(now));
    }

    #[test]
    fn oauth_session_staleness() {
        let now = Utc::now();
        let session = OAuthSession {
            connection_id: "c1".into(),
            state: "s".into(),
            verifier: None,
            app_key: "k".into(),
            app_secret: None,
            redirect_uri: "http://localhost:33847/callback".into(),
            started_at: now - chrono::Duration::seconds(91),
            status: OAuthStatus::Pending,
            auth_url: "https://example.invalid".into(),
            error_msg: None,
        };
        assert!(session.is_stale(now, DEFAULT_SINGLE_FLIGHT_WINDOW_SECS));
    }
}
