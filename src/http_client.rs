//
// Shared reqwest client construction for every broker-facing HTTP call
// (MitID core-client, Signicat/Nordnet, Saxo OAuth + REST).
//
// No SSRF-blocking DNS resolver here: every host this crate talks to is a
// fixed, operator-configured broker endpoint (`Config`), never user input.

use std::time::Duration;

use reqwest::{header, Client, ClientBuilder};

const USER_AGENT: &str = "broker-core";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

pub fn client_builder() -> ClientBuilder {
    let mut headers = header::HeaderMap::new();
    headers.insert(header::USER_AGENT, header::HeaderValue::from_static(USER_AGENT));
    Client::builder().default_headers(headers).timeout(DEFAULT_TIMEOUT)
}

/// Plain client, no cookie jar — used by the MitID and Saxo clients, neither
/// of which needs session cookies.
pub fn plain_client() -> Result<Client, crate::error::Error> {
    Ok(client_builder().build()?)
}

/// Cookie-jar-backed client for one Nordnet/Signicat flow. Each flow gets
/// its own client/jar; jars are never shared across connections.
pub fn cookie_client() -> Result<Client, crate::error::Error> {
    Ok(client_builder().cookie_store(true).build()?)
}
