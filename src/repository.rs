//
// Repository traits.
//
// This crate never owns a database — persistence is out of scope — but the
// sync orchestrator still needs a narrow seam to load connections and write
// back holdings/history. A handful of async methods named after the
// operation, not a generic CRUD trait. Callers outside this crate implement
// these against whatever storage they use; the in-memory doubles below
// exist for this crate's own tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Error;
use crate::session::{BrokerConnection, Holding, SyncHistory, SyncStatus};
use bigdecimal::BigDecimal;

/// The one reconciling entry the sync orchestrator emits; the broader logic
/// that turns a sync into a ledger of transactions is out of scope and
/// lives outside this crate.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub account_id: String,
    pub amount: BigDecimal,
    pub description: String,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait]
pub trait TransactionSink: Send + Sync {
    async fn record(&self, transaction: Transaction) -> Result<(), Error>;
}

#[derive(Default)]
pub struct InMemoryTransactionSink {
    transactions: Mutex<Vec<Transaction>>,
}

#[async_trait]
impl TransactionSink for InMemoryTransactionSink {
    async fn record(&self, transaction: Transaction) -> Result<(), Error> {
        self.transactions.lock().unwrap().push(transaction);
        Ok(())
    }
}

impl InMemoryTransactionSink {
    pub fn snapshot(&self) -> Vec<Transaction> {
        self.transactions.lock().unwrap().clone()
    }
}

#[async_trait]
pub trait ConnectionRepository: Send + Sync {
    async fn load(&self, connection_id: &str) -> Result<BrokerConnection, Error>;

    async fn update_sync_status(&self, connection_id: &str, status: &str, error: Option<&str>) -> Result<(), Error>;
}

/// Accounts under a connection flagged for automatic sync.
#[derive(Debug, Clone)]
pub struct AccountMapping {
    pub account_id: String,
    pub external_account_id: String,
}

#[async_trait]
pub trait AccountMappingRepository: Send + Sync {
    async fn auto_sync_mappings(&self, connection_id: &str) -> Result<Vec<AccountMapping>, Error>;
}

#[async_trait]
pub trait HoldingsRepository: Send + Sync {
    /// Upserts a batch keyed by `(account_id, external_id)`.
    async fn upsert_batch(&self, holdings: &[Holding]) -> Result<(), Error>;

    /// Deletes rows for `account_id` last touched before `cutoff` — the
    /// counterpart to `upsert_batch` that removes positions the broker no
    /// longer reports.
    async fn delete_stale(&self, account_id: &str, cutoff: DateTime<Utc>) -> Result<u32, Error>;
}

#[async_trait]
pub trait SyncHistoryRepository: Send + Sync {
    /// Inserts a `status = "started"` row and returns its id.
    async fn start(&self, connection_id: &str, sync_type: &str, started_at: DateTime<Utc>) -> Result<String, Error>;

    /// Fills in the outcome of a started row.
    async fn complete(
        &self,
        history_id: &str,
        status: SyncStatus,
        accounts_synced: u32,
        positions_synced: u32,
        error_message: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<(), Error>;
}

//
// In-memory test doubles.
//

pub struct InMemoryConnectionRepository {
    connections: Mutex<HashMap<String, BrokerConnection>>,
}

impl InMemoryConnectionRepository {
    pub fn new(connections: Vec<BrokerConnection>) -> Self {
        Self {
            connections: Mutex::new(connections.into_iter().map(|c| (c.id.clone(), c)).collect()),
        }
    }
}

#[async_trait]
impl ConnectionRepository for InMemoryConnectionRepository {
    async fn load(&self, connection_id: &str) -> Result<BrokerConnection, Error> {
        self.connections
            .lock()
            .unwrap()
            .get(connection_id)
            .cloned()
            .ok_or_else(|| Error::new("connection not found", format!("no connection with id {connection_id}")))
    }

    async fn update_sync_status(&self, connection_id: &str, status: &str, error: Option<&str>) -> Result<(), Error> {
        let mut guard = self.connections.lock().unwrap();
        let conn = guard
            .get_mut(connection_id)
            .ok_or_else(|| Error::new("connection not found", format!("no connection with id {connection_id}")))?;
        conn.last_sync_status = Some(status.to_string());
        conn.last_sync_error = error.map(str::to_string);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryAccountMappingRepository {
    mappings: Mutex<HashMap<String, Vec<AccountMapping>>>,
}

impl InMemoryAccountMappingRepository {
    pub fn new(mappings: HashMap<String, Vec<AccountMapping>>) -> Self {
        Self {
            mappings: Mutex::new(mappings),
        }
    }
}

#[async_trait]
impl AccountMappingRepository for InMemoryAccountMappingRepository {
    async fn auto_sync_mappings(&self, connection_id: &str) -> Result<Vec<AccountMapping>, Error> {
        Ok(self.mappings.lock().unwrap().get(connection_id).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryHoldingsRepository {
    holdings: Mutex<HashMap<(String, String), Holding>>,
}

#[async_trait]
impl HoldingsRepository for InMemoryHoldingsRepository {
    async fn upsert_batch(&self, holdings: &[Holding]) -> Result<(), Error> {
        let mut guard = self.holdings.lock().unwrap();
        for holding in holdings {
            guard.insert((holding.account_id.clone(), holding.external_id.clone()), holding.clone());
        }
        Ok(())
    }

    async fn delete_stale(&self, account_id: &str, cutoff: DateTime<Utc>) -> Result<u32, Error> {
        let mut guard = self.holdings.lock().unwrap();
        let before = guard.len();
        guard.retain(|(acct, _), h| acct != account_id || h.last_updated >= cutoff);
        Ok((before - guard.len()) as u32)
    }
}

impl InMemoryHoldingsRepository {
    pub fn snapshot(&self) -> Vec<Holding> {
        self.holdings.lock().unwrap().values().cloned().collect()
    }
}

#[derive(Default)]
pub struct InMemorySyncHistoryRepository {
    rows: Mutex<HashMap<String, SyncHistory>>,
}

#[async_trait]
impl SyncHistoryRepository for InMemorySyncHistoryRepository {
    async fn start(&self, connection_id: &str, sync_type: &str, started_at: DateTime<Utc>) -> Result<String, Error> {
        let id = crate::util::get_uuid();
        self.rows.lock().unwrap().insert(
            id.clone(),
            SyncHistory {
                id: id.clone(),
                connection_id: connection_id.to_string(),
                sync_type: sync_type.to_string(),
                status: SyncStatus::Started,
                accounts_synced: 0,
                positions_synced: 0,
                error_message: None,
                started_at,
                completed_at: None,
                duration_ms: None,
            },
        );
        Ok(id)
    }

    async fn complete(
        &self,
        history_id: &str,
        status: SyncStatus,
        accounts_synced: u32,
        positions_synced: u32,
        error_message: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut guard = self.rows.lock().unwrap();
        let row = guard
            .get_mut(history_id)
            .ok_or_else(|| Error::new("sync history row not found", format!("no row with id {history_id}")))?;
        row.status = status;
        row.accounts_synced = accounts_synced;
        row.positions_synced = positions_synced;
        row.error_message = error_message.map(str::to_string);
        row.duration_ms = Some((completed_at - row.started_at).num_milliseconds());
        row.completed_at = Some(completed_at);
        Ok(())
    }
}

impl InMemorySyncHistoryRepository {
    pub fn get(&self, history_id: &str) -> Option<SyncHistory> {
        self.rows.lock().unwrap().get(history_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{BrokerType, Country};
    use bigdecimal::BigDecimal;
    use std::str::FromStr;

    fn connection() -> BrokerConnection {
        BrokerConnection {
            id: "c1".into(),
            user_id: "u1".into(),
            broker_type: BrokerType::Nordnet,
            country: Some(Country::Dk),
            username: Some("u".into()),
            cpr: Some("1234567890".into()),
            app_key: None,
            app_secret: None,
            redirect_uri: None,
            last_sync_status: None,
            last_sync_error: None,
        }
    }

    #[tokio::test]
    async fn connection_repository_round_trips_sync_status() {
        let repo = InMemoryConnectionRepository::new(vec![connection()]);
        repo.update_sync_status("c1", "success", None).await.unwrap();
        let loaded = repo.load("c1").await.unwrap();
        assert_eq!(loaded.last_sync_status.as_deref(), Some("success"));
    }

    #[tokio::test]
    async fn connection_repository_missing_id_errors() {
        let repo = InMemoryConnectionRepository::new(vec![]);
        assert!(repo.load("missing").await.is_err());
    }

    fn holding(account_id: &str, external_id: &str, last_updated: DateTime<Utc>) -> Holding {
        Holding {
            account_id: account_id.to_string(),
            external_id: external_id.to_string(),
            symbol: "AAPL".into(),
            quantity: BigDecimal::from_str("10").unwrap(),
            cost_basis: BigDecimal::from_str("1000").unwrap(),
            market_value: BigDecimal::from_str("1200").unwrap(),
            currency: "USD".into(),
            last_updated,
        }
    }

    #[tokio::test]
    async fn holdings_repository_upsert_then_delete_stale() {
        let repo = InMemoryHoldingsRepository::default();
        let now = Utc::now();
        repo.upsert_batch(&[holding("a1", "p1", now - chrono::Duration::hours(1)), holding("a1", "p2", now)]).await.unwrap();

        let deleted = repo.delete_stale("a1", now - chrono::Duration::minutes(30)).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(repo.snapshot().len(), 1);
        assert_eq!(repo.snapshot()[0].external_id, "p2");
    }

    #[tokio::test]
    async fn sync_history_start_then_complete() {
        let repo = InMemorySyncHistoryRepository::default();
        let started_at = Utc::now();
        let id = repo.start("c1", "nordnet", started_at).await.unwrap();

        repo.complete(&id, SyncStatus::Success, 2, 5, None, started_at + chrono::Duration::seconds(3)).await.unwrap();

        let row = repo.get(&id).unwrap();
        assert_eq!(row.status, SyncStatus::Success);
        assert_eq!(row.accounts_synced, 2);
        assert_eq!(row.duration_ms, Some(3000));
    }
}
