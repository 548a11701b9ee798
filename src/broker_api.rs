//
// Broker REST helpers for position/balance extraction from an authenticated
// channel. A Saxo fetch needs the same bearer-token plumbing as the OAuth
// token exchange; the Nordnet counterpart mirrors it with the JWT/ntag/cookie
// session instead.
//
// Out of scope: currency conversion, instrument master data beyond what the
// position response already carries.

use bigdecimal::BigDecimal;
use serde::Deserialize;

use crate::config::Config;
use crate::error::Error;
use crate::session::{PositionWithDetails, Session};

#[derive(Debug, Clone)]
pub struct Balance {
    pub total_value: BigDecimal,
    pub cash_balance: BigDecimal,
    pub non_margin_positions_value: BigDecimal,
}

pub mod saxo {
    use super::*;

    #[derive(Deserialize)]
    struct PositionsEnvelope {
        #[serde(rename = "Data")]
        data: Vec<PositionEntry>,
    }

    #[derive(Deserialize)]
    struct PositionEntry {
        #[serde(rename = "PositionId")]
        position_id: String,
        #[serde(rename = "PositionBase")]
        base: PositionBase,
        #[serde(rename = "PositionView")]
        view: PositionView,
    }

    #[derive(Deserialize)]
    struct PositionBase {
        #[serde(rename = "Uic")]
        uic: i64,
        #[serde(rename = "Amount")]
        amount: BigDecimal,
        #[serde(rename = "OpenPrice")]
        open_price: BigDecimal,
        #[serde(rename = "AssetType")]
        asset_type: String,
    }

    #[derive(Deserialize)]
    struct PositionView {
        #[serde(rename = "MarketValue", default)]
        market_value: Option<BigDecimal>,
        #[serde(rename = "CurrentPrice", default)]
        current_price: Option<BigDecimal>,
    }

    #[derive(Deserialize)]
    struct BalanceResponse {
        #[serde(rename = "TotalValue")]
        total_value: BigDecimal,
        #[serde(rename = "CashBalance")]
        cash_balance: BigDecimal,
        #[serde(rename = "NonMarginPositionsValue", default)]
        non_margin_positions_value: Option<BigDecimal>,
    }

    fn bearer(session: &Session) -> Result<&str, Error> {
        match session {
            Session::Saxo { access_token, .. } => Ok(access_token),
            Session::Nordnet { .. } => Err(Error::new("expected a Saxo session", "got a Nordnet session")),
        }
    }

    pub async fn fetch_positions(config: &Config, session: &Session, account_key: &str) -> Result<Vec<PositionWithDetails>, Error> {
        let http = crate::http_client::plain_client()?;
        let url = format!("{}/port/v1/positions?AccountKey={account_key}&FieldGroups=DisplayAndFormat", config.saxo_api_base_url());

        let envelope: PositionsEnvelope = http.get(url).bearer_auth(bearer(session)?).send().await?.json().await?;

        Ok(envelope
            .data
            .into_iter()
            .map(|p| {
                let market_value = p.view.market_value.unwrap_or_else(|| BigDecimal::from(0));
                PositionWithDetails {
                    external_id: p.position_id,
                    symbol: p.base.asset_type,
                    quantity: p.base.amount.clone(),
                    cost_basis: &p.base.amount * &p.base.open_price,
                    market_value,
                    currency: "".to_string(),
                    uic: p.base.uic,
                }
            })
            .collect())
    }

    pub async fn fetch_balance(config: &Config, session: &Session, account_key: &str) -> Result<Balance, Error> {
        let http = crate::http_client::plain_client()?;
        let url = format!("{}/port/v1/balances?AccountKey={account_key}", config.saxo_api_base_url());

        let resp: BalanceResponse = http.get(url).bearer_auth(bearer(session)?).send().await?.json().await?;

        Ok(Balance {
            total_value: resp.total_value,
            cash_balance: resp.cash_balance,
            non_margin_positions_value: resp.non_margin_positions_value.unwrap_or_else(|| BigDecimal::from(0)),
        })
    }
}

pub mod nordnet {
    use super::*;

    #[derive(Deserialize)]
    struct NordnetPosition {
        instrument_id: String,
        symbol: String,
        #[serde(rename = "qty")]
        quantity: BigDecimal,
        #[serde(rename = "acq_price")]
        acquisition_price: BigDecimal,
        #[serde(rename = "market_value", default)]
        market_value: Option<BigDecimal>,
        #[serde(default)]
        currency: String,
    }

    #[derive(Deserialize)]
    struct NordnetBalance {
        #[serde(rename = "total_value")]
        total_value: BigDecimal,
        #[serde(rename = "cash_balance")]
        cash_balance: BigDecimal,
    }

    fn session_parts(session: &Session) -> Result<(&str, &str, &str), Error> {
        match session {
            Session::Nordnet { jwt, ntag, domain, .. } => Ok((jwt, ntag, domain)),
            Session::Saxo { .. } => Err(Error::new("expected a Nordnet session", "got a Saxo session")),
        }
    }

    pub async fn fetch_positions(session: &Session, account_id: &str) -> Result<Vec<PositionWithDetails>, Error> {
        let (jwt, ntag, domain) = session_parts(session)?;
        let http = crate::http_client::cookie_client()?;
        let url = format!("https://{domain}/nnxapi/accounts/v2/{account_id}/positions");

        let positions: Vec<NordnetPosition> = http.get(url).bearer_auth(jwt).header("ntag", ntag).send().await?.json().await?;

        Ok(positions
            .into_iter()
            .map(|p| {
                let market_value = p.market_value.unwrap_or_else(|| BigDecimal::from(0));
                PositionWithDetails {
                    external_id: p.instrument_id,
                    symbol: p.symbol,
                    cost_basis: &p.quantity * &p.acquisition_price,
                    quantity: p.quantity,
                    market_value,
                    currency: p.currency,
                    uic: 0,
                }
            })
            .collect())
    }

    pub async fn fetch_balance(session: &Session, account_id: &str) -> Result<Balance, Error> {
        let (jwt, ntag, domain) = session_parts(session)?;
        let http = crate::http_client::cookie_client()?;
        let url = format!("https://{domain}/nnxapi/accounts/v2/{account_id}/balance");

        let resp: NordnetBalance = http.get(url).bearer_auth(jwt).header("ntag", ntag).send().await?.json().await?;

        Ok(Balance {
            total_value: resp.total_value,
            cash_balance: resp.cash_balance,
            non_margin_positions_value: BigDecimal::from(0),
        })
    }
}
