//
// Error generator macro
//
use log::error;

macro_rules! make_error {
    ( $struct:ident; $( $name:ident ( $ty:ty, _): $show_cause:expr ),+ $(,)* ) => {
        #[derive(Debug)]
        #[allow(unused_variables, dead_code)]
        pub enum $struct {
            $($name( $ty, String )),+
        }
        $(impl From<$ty> for $struct {
            fn from(err: $ty) -> Self {
                $struct::$name(err, String::from(stringify!($name)))
            }
        })+
        $(impl From<($ty, String)> for $struct {
            fn from(err: ($ty, String)) -> Self {
                $struct::$name(err.0, err.1)
            }
        })+
        impl $struct {
            pub fn with_msg<M: Into<String>>(self, msg: M) -> Self {
                match self {$(
                   $struct::$name(e, _) => $struct::$name(e, msg.into()),
                )+}
            }

            pub fn display_error(&self) -> String {
                match self {$(
                   $struct::$name(e, s) => {
                       let log_msg = format!("{}: {}", s, e);
                       error!("{}", log_msg);
                       if $show_cause {
                           error!("[CAUSE] {:?}", e);
                       }
                       log_msg
                   },
                )+}
            }
        }

        impl std::fmt::Display for $struct {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {$(
                    $struct::$name(e, s) => write!(f, "{s}: {e}"),
                )+}
            }
        }

        impl std::error::Error for $struct {}
    };
}

use std::fmt;

/// A marker error carrying only a message, used for protocol sentinel kinds
/// that have no underlying source error to wrap.
#[derive(Debug)]
pub struct Sentinel(pub &'static str);

impl fmt::Display for Sentinel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for Sentinel {}

// Error struct.
// Each variant has two elements: the first is the underlying error (or a
// Sentinel for cases with no real source), used for logging; the second is a
// free-form string set via `with_msg`, shown to callers.
//
// The `show_cause` flag controls whether the Debug representation of the
// underlying error is also emitted to the log.
make_error! {
    Error;
    // Generic errors, used by the `err!` macro below.
    SimpleError(String,            _): false,

    // MitID / code-app-auth protocol sentinels.
    UserNotFound(Sentinel,         _): false,
    SessionNotFound(Sentinel,      _): false,
    IpBlocked(Sentinel,            _): false,
    ParallelSessions(Sentinel,     _): false,
    AuthenticatorNotAvailable(Sentinel, _): false,
    AuthenticatorCannotStart(Sentinel, _): false,
    LoginRejected(Sentinel,        _): false,
    Timeout(Sentinel,              _): false,
    FinalizationFailed(Sentinel,   _): false,
    InvalidPassword(Sentinel,      _): false,
    InvalidToken(Sentinel,         _): false,

    // SRP engine.
    SrpInvalidB(Sentinel,          _): false,
    SrpVerifyFailed(Sentinel,      _): false,

    // OAuth2 engine.
    InvalidState(Sentinel,         _): false,
    NoAuthCode(Sentinel,           _): false,
    OAuthTimeout(Sentinel,         _): false,
    OAuthInProgress(Sentinel,      _): false,
    RefreshTokenExpired(Sentinel,  _): false,

    // Crypto: padding, short ciphertext, and GCM tag failures all collapse
    // into one kind.
    CryptoError(Sentinel,          _): false,

    // Wrapped transport/serialization errors.
    ReqwestError(reqwest::Error,   _): true,
    IoError(std::io::Error,        _): true,
    SerdeError(serde_json::Error,  _): true,
    UrlError(url::ParseError,      _): true,
}

impl Error {
    pub fn new<M: Into<String>, N: Into<String>>(usr_msg: M, log_msg: N) -> Self {
        Error::SimpleError(log_msg.into(), usr_msg.into())
    }

    pub fn sentinel<M: Into<String>>(kind: fn(Sentinel, String) -> Error, name: &'static str, msg: M) -> Self {
        kind(Sentinel(name), msg.into())
    }
}

///
/// Error return macros.
///
#[macro_export]
macro_rules! err {
    ($msg:expr) => {{
        return Err($crate::error::Error::new($msg, $msg));
    }};
    ($usr_msg:expr, $log_value:expr) => {{
        return Err($crate::error::Error::new($usr_msg, $log_value));
    }};
}

#[macro_export]
macro_rules! err_sentinel {
    ($variant:ident, $msg:expr) => {{
        return Err($crate::error::Error::$variant($crate::error::Sentinel(stringify!($variant)), $msg.into()));
    }};
}
