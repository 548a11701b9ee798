//
// Runtime configuration.
//
// A `Config` wrapping a `RwLock<Inner>`, built once from environment
// variables loaded via `dotenvy`, validated at startup. Covers the handful
// of endpoints/timeouts this crate actually needs — there is no
// mail/push/admin/web-vault surface here.

use std::process::exit;
use std::sync::RwLock;

use once_cell::sync::Lazy;
use url::Url;

use crate::error::Error;

pub static CONFIG: Lazy<Config> = Lazy::new(|| {
    Config::load().unwrap_or_else(|e| {
        eprintln!("Error loading config:\n  {e}\n");
        exit(12)
    })
});

struct Inner {
    items: ConfigItems,
}

pub struct Config {
    inner: RwLock<Inner>,
}

#[derive(Clone, Debug)]
struct ConfigItems {
    mitid_base_url: String,
    signicat_base_url: String,
    saxo_oauth_base_url: String,
    saxo_api_base_url: String,
    saxo_app_key_fallback: Option<String>,
    mitid_poll_deadline_secs: u64,
    oauth_flow_deadline_secs: u64,
    oauth_single_flight_window_secs: u64,
    saxo_min_request_spacing_ms: u64,
    qr_tmp_dir: Option<String>,
    log_level: String,
    log_file: Option<String>,
}

impl Default for ConfigItems {
    fn default() -> Self {
        let simulation = cfg!(feature = "simulation");
        Self {
            mitid_base_url: if simulation {
                "https://pp.mitid.dk".to_string()
            } else {
                "https://mitid.dk".to_string()
            },
            signicat_base_url: "https://signicat.com".to_string(),
            saxo_oauth_base_url: if simulation {
                "https://sim.logonvalidation.net".to_string()
            } else {
                "https://live.logonvalidation.net".to_string()
            },
            saxo_api_base_url: if simulation {
                "https://gateway.saxobank.com/sim/openapi".to_string()
            } else {
                "https://gateway.saxobank.com/openapi".to_string()
            },
            saxo_app_key_fallback: crate::util::get_env("SAXO_APP_KEY"),
            mitid_poll_deadline_secs: 120,
            oauth_flow_deadline_secs: 300,
            oauth_single_flight_window_secs: 90,
            saxo_min_request_spacing_ms: 200,
            qr_tmp_dir: crate::util::get_env("QR_TMP_DIR"),
            log_level: crate::util::get_env("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_file: crate::util::get_env("LOG_FILE"),
        }
    }
}

macro_rules! accessor {
    ($name:ident, String) => {
        pub fn $name(&self) -> String {
            self.inner.read().unwrap().items.$name.clone()
        }
    };
    ($name:ident, Option<String>) => {
        pub fn $name(&self) -> Option<String> {
            self.inner.read().unwrap().items.$name.clone()
        }
    };
    ($name:ident, u64) => {
        pub fn $name(&self) -> u64 {
            self.inner.read().unwrap().items.$name
        }
    };
}

#[allow(unused)]
impl Config {
    accessor!(mitid_base_url, String);
    accessor!(signicat_base_url, String);
    accessor!(saxo_oauth_base_url, String);
    accessor!(saxo_api_base_url, String);
    accessor!(saxo_app_key_fallback, Option<String>);
    accessor!(mitid_poll_deadline_secs, u64);
    accessor!(oauth_flow_deadline_secs, u64);
    accessor!(oauth_single_flight_window_secs, u64);
    accessor!(saxo_min_request_spacing_ms, u64);
    accessor!(qr_tmp_dir, Option<String>);
    accessor!(log_level, String);
    accessor!(log_file, Option<String>);

    pub fn load() -> Result<Self, Error> {
        let env_file = crate::util::get_env("ENV_FILE").unwrap_or_else(|| ".env".to_string());
        match dotenvy::from_path(&env_file) {
            Ok(_) => println!("[INFO] Using environment file `{env_file}` for configuration.\n"),
            Err(e) => match e {
                dotenvy::Error::LineParse(msg, pos) => {
                    println!("[ERROR] Failed parsing environment file: `{env_file}`\nNear {msg:?} on position {pos}\n");
                    exit(255);
                }
                dotenvy::Error::Io(ioerr) if ioerr.kind() == std::io::ErrorKind::NotFound => {
                    if crate::util::get_env::<String>("ENV_FILE").is_some() {
                        println!("[ERROR] The configured ENV_FILE `{env_file}` was not found!\n");
                        exit(255);
                    }
                }
                _ => println!("[INFO] No environment file found, using process environment only.\n"),
            },
        }

        let items = ConfigItems::default();
        validate_config(&items)?;

        Ok(Config {
            inner: RwLock::new(Inner { items }),
        })
    }
}

fn validate_config(cfg: &ConfigItems) -> Result<(), Error> {
    for (name, url) in [
        ("mitid_base_url", &cfg.mitid_base_url),
        ("signicat_base_url", &cfg.signicat_base_url),
        ("saxo_oauth_base_url", &cfg.saxo_oauth_base_url),
        ("saxo_api_base_url", &cfg.saxo_api_base_url),
    ] {
        if Url::parse(url).is_err() {
            err!(format!("`{name}` is not a valid URL: {url}"));
        }
        if !cfg!(feature = "simulation") && !url.starts_with("https://") {
            err!(format!("`{name}` must use https:// outside the simulation feature"));
        }
    }

    if cfg.oauth_single_flight_window_secs >= cfg.oauth_flow_deadline_secs {
        err!("`oauth_single_flight_window_secs` must be smaller than `oauth_flow_deadline_secs`");
    }

    if cfg.mitid_poll_deadline_secs == 0 || cfg.oauth_flow_deadline_secs == 0 || cfg.saxo_min_request_spacing_ms == 0 {
        err!("timeouts/spacing config values must be positive");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let items = ConfigItems::default();
        assert!(validate_config(&items).is_ok());
    }

    #[test]
    fn single_flight_window_must_be_smaller_than_deadline() {
        let mut items = ConfigItems::default();
        items.oauth_single_flight_window_secs = items.oauth_flow_deadline_secs;
        assert!(validate_config(&items).is_err());
    }
}
