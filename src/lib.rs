//
// Broker authentication and session broker library crate.
//
// MitID/Signicat and Saxo OAuth2 both terminate in the shared session
// registry, consumed by the sync orchestrator.
//

#[macro_use]
pub mod error;

pub mod broker_api;
pub mod config;
pub mod crypto;
pub mod http_client;
pub mod mitid;
pub mod oauth;
pub mod qr;
pub mod registry;
pub mod repository;
pub mod session;
pub mod signicat;
pub mod srp;
pub mod sync;
pub mod util;

pub use config::CONFIG;

/// Sets up the `log` facade with a `fern` dispatcher: stdout always, plus an
/// optional file sink when `LOG_FILE` is configured.
pub fn init_logging() -> Result<(), fern::InitError> {
    let level = CONFIG.log_level().parse().unwrap_or(log::LevelFilter::Info);

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!("[{}][{}][{}] {}", util::format_date(&util::now()), record.target(), record.level(), message))
        })
        .level(level)
        .chain(std::io::stdout());

    if let Some(log_file) = CONFIG.log_file() {
        dispatch = dispatch.chain(fern::log_file(&log_file)?);
    }

    dispatch.apply()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_is_reachable_through_the_crate_root() {
        let _ = CONFIG.log_level();
    }
}
