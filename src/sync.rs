//
// Sync orchestrator.
//
// Given a connection id, obtains or refreshes a session, fans out
// per-account position/balance fetches, upserts holdings with a
// delete-stale pass, reconciles totals against the recorded balance, and
// records the outcome as a `SyncHistory` row. Saxo and Nordnet share this
// shape; only session acquisition and the REST fetchers (`broker_api`)
// differ, so one function takes a small `BrokerSession` enum instead of two
// near-duplicate orchestrators.

use std::sync::Arc;

use bigdecimal::BigDecimal;
use num_traits::Zero;

use crate::broker_api::{self, Balance};
use crate::config::Config;
use crate::error::Error;
use crate::oauth;
use crate::registry::Registry;
use crate::repository::{AccountMappingRepository, ConnectionRepository, HoldingsRepository, SyncHistoryRepository, Transaction, TransactionSink};
use crate::session::{BrokerType, Holding, PositionWithDetails, Session, SyncStatus};
use crate::util;

pub struct Orchestrator {
    pub registry: Registry,
    pub config: Config,
    pub connections: Arc<dyn ConnectionRepository>,
    pub mappings: Arc<dyn AccountMappingRepository>,
    pub holdings: Arc<dyn HoldingsRepository>,
    pub history: Arc<dyn SyncHistoryRepository>,
    pub transactions: Arc<dyn TransactionSink>,
}

#[derive(Debug, Default)]
struct MappingOutcome {
    positions: Vec<PositionWithDetails>,
    balance: Option<Balance>,
}

impl Orchestrator {
    pub async fn sync_saxo_connection(&self, connection_id: &str) -> Result<(), Error> {
        self.sync(connection_id, "saxo").await
    }

    pub async fn sync_nordnet_connection(&self, connection_id: &str) -> Result<(), Error> {
        self.sync(connection_id, "nordnet").await
    }

    /// Shared between the two broker types.
    async fn sync(&self, connection_id: &str, sync_type: &str) -> Result<(), Error> {
        let started_at = util::now();
        let history_id = self.history.start(connection_id, sync_type, started_at).await?;

        let result = self.run(connection_id, started_at).await;

        match &result {
            Ok((accounts_synced, positions_synced)) => {
                self.history.complete(&history_id, SyncStatus::Success, *accounts_synced, *positions_synced, None, util::now()).await?;
            }
            Err(e) => {
                self.history.complete(&history_id, SyncStatus::Error, 0, 0, Some(&e.to_string()), util::now()).await?;
            }
        }

        result.map(|_| ())
    }

    async fn run(&self, connection_id: &str, started_at: chrono::DateTime<chrono::Utc>) -> Result<(u32, u32), Error> {
        let connection = match self.connections.load(connection_id).await {
            Ok(c) => c,
            Err(e) => return Err(e),
        };

        // Authenticating is interactive (browser or MitID app), so a
        // background sync can't drive it itself; a stale/missing session
        // just fails the run and waits for the next interactive re-auth.
        let session = match oauth::get_or_refresh_session(&self.registry, &self.config, &connection).await {
            Ok(s) => s,
            Err(e) => {
                let _ = self.connections.update_sync_status(connection_id, "auth_failed", Some(&e.to_string())).await;
                return Err(e);
            }
        };

        let mappings = self.mappings.auto_sync_mappings(connection_id).await?;
        let accounts_synced = mappings.len() as u32;

        // Per-mapping errors are logged and the loop continues.
        let mut outcomes = Vec::with_capacity(mappings.len());
        for mapping in &mappings {
            let fetched = match &session {
                Session::Saxo { .. } => {
                    let positions = broker_api::saxo::fetch_positions(&self.config, &session, &mapping.external_account_id).await;
                    let balance = broker_api::saxo::fetch_balance(&self.config, &session, &mapping.external_account_id).await;
                    (positions, balance)
                }
                Session::Nordnet { .. } => {
                    let positions = broker_api::nordnet::fetch_positions(&session, &mapping.external_account_id).await;
                    let balance = broker_api::nordnet::fetch_balance(&session, &mapping.external_account_id).await;
                    (positions, balance)
                }
            };

            match fetched {
                (Ok(positions), Ok(balance)) => outcomes.push((mapping.account_id.clone(), MappingOutcome { positions, balance: Some(balance) })),
                (Ok(positions), Err(e)) => {
                    log::warn!("balance fetch failed for account {}: {e}", mapping.account_id);
                    outcomes.push((mapping.account_id.clone(), MappingOutcome { positions, balance: None }));
                }
                (Err(e), _) => {
                    log::warn!("position fetch failed for account {}: {e}", mapping.account_id);
                }
            }
        }

        let mut positions_synced = 0u32;
        for (account_id, outcome) in &outcomes {
            positions_synced += outcome.positions.len() as u32;
            self.reconcile_account(account_id, outcome, started_at).await?;
        }

        let _ = self.connections.update_sync_status(connection_id, "success", None).await;
        Ok((accounts_synced, positions_synced))
    }

    /// Upsert + delete-stale + value-estimation, then the reconciling
    /// transaction, for a single account.
    async fn reconcile_account(&self, account_id: &str, outcome: &MappingOutcome, sync_started_at: chrono::DateTime<chrono::Utc>) -> Result<(), Error> {
        let Some(balance) = &outcome.balance else {
            // No balance this round — still upsert positions at face value, skip reconciliation.
            let holdings = outcome.positions.iter().map(|p| to_holding(account_id, p, &p.market_value)).collect::<Vec<_>>();
            self.holdings.upsert_batch(&holdings).await?;
            self.holdings.delete_stale(account_id, sync_started_at).await?;
            return Ok(());
        };

        let positions_value_from_balance = balance.non_margin_positions_value.clone().max(&balance.total_value - &balance.cash_balance);
        let total_cost_basis: BigDecimal = outcome.positions.iter().map(|p| p.cost_basis.clone()).sum();

        let holdings: Vec<Holding> = outcome
            .positions
            .iter()
            .map(|p| {
                let estimated_value = if p.market_value.is_zero() && !total_cost_basis.is_zero() {
                    (&p.cost_basis / &total_cost_basis) * &positions_value_from_balance
                } else {
                    p.market_value.clone()
                };
                to_holding(account_id, p, &estimated_value)
            })
            .collect();

        self.holdings.upsert_batch(&holdings).await?;
        self.holdings.delete_stale(account_id, sync_started_at).await?;

        // Emit a reconciling transaction if the total diverges from the recorded balance.
        let total_value: BigDecimal = holdings.iter().map(|h| h.market_value.clone()).sum::<BigDecimal>() + &balance.cash_balance;
        if (total_value != balance.total_value) && (!holdings.is_empty() || !balance.total_value.is_zero()) {
            self.transactions
                .record(Transaction {
                    account_id: account_id.to_string(),
                    amount: &total_value - &balance.total_value,
                    description: "Saxo sync".to_string(),
                    occurred_at: util::now(),
                })
                .await?;
        }

        Ok(())
    }
}

fn to_holding(account_id: &str, position: &PositionWithDetails, market_value: &BigDecimal) -> Holding {
    Holding {
        account_id: account_id.to_string(),
        external_id: position.external_id.clone(),
        symbol: position.symbol.clone(),
        quantity: position.quantity.clone(),
        cost_basis: position.cost_basis.clone(),
        market_value: market_value.clone(),
        currency: position.currency.clone(),
        last_updated: util::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{AccountMapping, InMemoryAccountMappingRepository, InMemoryConnectionRepository, InMemoryHoldingsRepository, InMemorySyncHistoryRepository, InMemoryTransactionSink};
    use crate::session::{BrokerConnection, Country};
    use std::collections::HashMap;
    use std::str::FromStr;

    fn connection() -> BrokerConnection {
        BrokerConnection {
            id: "c1".into(),
            user_id: "u1".into(),
            broker_type: BrokerType::Saxo,
            country: None,
            username: None,
            cpr: None,
            app_key: Some("key".into()),
            app_secret: Some("secret".into()),
            redirect_uri: Some("http://localhost:33847/callback".into()),
            last_sync_status: None,
            last_sync_error: None,
        }
    }

    fn orchestrator_with_no_mappings() -> (Orchestrator, Arc<InMemoryHoldingsRepository>) {
        let registry = Registry::new();
        registry.cache_session(
            "c1",
            Some(Session::Saxo {
                access_token: "at".into(),
                refresh_token: "rt".into(),
                token_type: "Bearer".into(),
                expires_at: util::now() + chrono::Duration::hours(1),
                refresh_expires_at: util::now() + chrono::Duration::hours(2),
                client_key: None,
            }),
        );

        let holdings = Arc::new(InMemoryHoldingsRepository::default());
        let orch = Orchestrator {
            registry,
            config: Config::load().unwrap(),
            connections: Arc::new(InMemoryConnectionRepository::new(vec![connection()])),
            mappings: Arc::new(InMemoryAccountMappingRepository::new(HashMap::new())),
            holdings: holdings.clone(),
            history: Arc::new(InMemorySyncHistoryRepository::default()),
            transactions: Arc::new(InMemoryTransactionSink::default()),
        };
        (orch, holdings)
    }

    #[tokio::test]
    async fn sync_with_no_mappings_succeeds_with_zero_counts() {
        let (orch, _holdings) = orchestrator_with_no_mappings();
        orch.sync_saxo_connection("c1").await.unwrap();
    }

    #[tokio::test]
    async fn sync_missing_connection_fails_history_row() {
        let registry = Registry::new();
        let history = Arc::new(InMemorySyncHistoryRepository::default());
        let orch = Orchestrator {
            registry,
            config: Config::load().unwrap(),
            connections: Arc::new(InMemoryConnectionRepository::new(vec![])),
            mappings: Arc::new(InMemoryAccountMappingRepository::new(HashMap::new())),
            holdings: Arc::new(InMemoryHoldingsRepository::default()),
            history: history.clone(),
            transactions: Arc::new(InMemoryTransactionSink::default()),
        };

        assert!(orch.sync_saxo_connection("missing").await.is_err());
    }

    #[tokio::test]
    async fn value_estimation_splits_proportionally_to_cost_basis() {
        let (orch, holdings) = orchestrator_with_no_mappings();
        let outcome = MappingOutcome {
            positions: vec![
                PositionWithDetails {
                    external_id: "p1".into(),
                    symbol: "AAPL".into(),
                    quantity: BigDecimal::from_str("10").unwrap(),
                    cost_basis: BigDecimal::from_str("300").unwrap(),
                    market_value: BigDecimal::from_str("0").unwrap(),
                    currency: "USD".into(),
                    uic: 1,
                },
                PositionWithDetails {
                    external_id: "p2".into(),
                    symbol: "MSFT".into(),
                    quantity: BigDecimal::from_str("5").unwrap(),
                    cost_basis: BigDecimal::from_str("100").unwrap(),
                    market_value: BigDecimal::from_str("0").unwrap(),
                    currency: "USD".into(),
                    uic: 2,
                },
            ],
            balance: Some(Balance {
                total_value: BigDecimal::from_str("500").unwrap(),
                cash_balance: BigDecimal::from_str("100").unwrap(),
                non_margin_positions_value: BigDecimal::from_str("0").unwrap(),
            }),
        };

        orch.reconcile_account("a1", &outcome, util::now() - chrono::Duration::seconds(1)).await.unwrap();

        let snapshot = holdings.snapshot();
        let p1 = snapshot.iter().find(|h| h.external_id == "p1").unwrap();
        // positions_value_from_balance = max(0, 500-100) = 400; p1 share = 300/400*400 = 300
        assert_eq!(p1.market_value, BigDecimal::from_str("300").unwrap());
    }
}
