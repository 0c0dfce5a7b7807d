//! Database module for PostgreSQL operations using SQLx
//! Uses runtime query checking (no compile-time DATABASE_URL needed)

mod models;

pub use models::*;

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("record not found")]
    NotFound,
    #[error("row version moved during update")]
    VersionConflict,
    #[error("storage rejected write: {0}")]
    Rejected(String),
}

/// Account CRUD as seen by the trading and auth layers.
#[allow(async_fn_in_trait)]
pub trait AccountStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Account, StoreError>;
    async fn find_by_username(&self, username: &str) -> Result<Account, StoreError>;
    async fn insert(&self, account: &Account) -> Result<(), StoreError>;
    /// Persist balance changes, compare-and-swapping on the version the
    /// account was loaded with. Fails `VersionConflict` when the stored row
    /// moved underneath the caller.
    async fn save(&self, account: &Account) -> Result<(), StoreError>;
}

/// The append-only transaction ledger.
#[allow(async_fn_in_trait)]
pub trait LedgerStore {
    async fn append(&self, record: &TransactionRecord) -> Result<(), StoreError>;
    async fn find_by_account(&self, account_id: Uuid) -> Result<Vec<TransactionRecord>, StoreError>;
}

/// Combined store used by the buy flow: the balance debit and the ledger
/// append must land in one durable commit or not at all.
#[allow(async_fn_in_trait)]
pub trait TradeStore: AccountStore + LedgerStore {
    async fn commit_trade(
        &self,
        account: &Account,
        record: &TransactionRecord,
    ) -> Result<(), StoreError>;
}

/// Database connection wrapper
#[derive(Clone)]
pub struct Database {
    pool: Arc<PgPool>,
}

const ACCOUNT_COLUMNS: &str =
    "id, username, password_hash, balance, version, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, account_id, coin, amount, price, executed_at";

impl Database {
    /// Create a new database connection pool
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        info!("Database pool created with max 10 connections");

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Bootstrap the schema. Idempotent, runs at startup.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id UUID PRIMARY KEY,
                username VARCHAR(100) UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                balance NUMERIC(15,2) NOT NULL DEFAULT 1000.00,
                version BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                id UUID PRIMARY KEY,
                account_id UUID NOT NULL REFERENCES accounts(id),
                coin TEXT NOT NULL,
                amount NUMERIC NOT NULL,
                price NUMERIC NOT NULL,
                executed_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_transactions_account ON transactions (account_id, executed_at)",
        )
        .execute(self.pool())
        .await?;

        info!("Schema migration complete");
        Ok(())
    }
}

impl AccountStore for Database {
    async fn find_by_id(&self, id: Uuid) -> Result<Account, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => Ok(Account::from_row(&row)?),
            None => Err(StoreError::NotFound),
        }
    }

    async fn find_by_username(&self, username: &str) -> Result<Account, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE username = $1"
        ))
        .bind(username)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => Ok(Account::from_row(&row)?),
            None => Err(StoreError::NotFound),
        }
    }

    async fn insert(&self, account: &Account) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO accounts (id, username, password_hash, balance, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(account.id)
        .bind(&account.username)
        .bind(&account.password_hash)
        .bind(account.balance)
        .bind(account.version)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn save(&self, account: &Account) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET balance = $2, version = version + 1, updated_at = CURRENT_TIMESTAMP
            WHERE id = $1 AND version = $3
            "#,
        )
        .bind(account.id)
        .bind(account.balance)
        .bind(account.version)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::VersionConflict);
        }
        Ok(())
    }
}

impl LedgerStore for Database {
    async fn append(&self, record: &TransactionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO transactions (id, account_id, coin, amount, price, executed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.id)
        .bind(record.account_id)
        .bind(&record.coin)
        .bind(record.amount)
        .bind(record.price)
        .bind(record.executed_at)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn find_by_account(&self, account_id: Uuid) -> Result<Vec<TransactionRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE account_id = $1 ORDER BY executed_at"
        ))
        .bind(account_id)
        .fetch_all(self.pool())
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(TransactionRecord::from_row(row)?);
        }
        Ok(records)
    }
}

impl TradeStore for Database {
    async fn commit_trade(
        &self,
        account: &Account,
        record: &TransactionRecord,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE accounts
            SET balance = $2, version = version + 1, updated_at = CURRENT_TIMESTAMP
            WHERE id = $1 AND version = $3
            "#,
        )
        .bind(account.id)
        .bind(account.balance)
        .bind(account.version)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            // Dropping the transaction rolls back; nothing was written.
            return Err(StoreError::VersionConflict);
        }

        sqlx::query(
            r#"
            INSERT INTO transactions (id, account_id, coin, amount, price, executed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.id)
        .bind(record.account_id)
        .bind(&record.coin)
        .bind(record.amount)
        .bind(record.price)
        .bind(record.executed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}
