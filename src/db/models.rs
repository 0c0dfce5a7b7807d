//! Database models matching the PostgreSQL schema

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by account mutation methods before anything is persisted
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccountError {
    #[error("insufficient USD balance")]
    InsufficientBalance,
    #[error("holding {0} cannot go negative")]
    NegativeHolding(String),
    #[error("amount must be positive")]
    NonPositiveAmount,
}

/// A user account with a USD balance and synthetic crypto holdings.
///
/// `holdings` is never persisted - it is a denormalized cache of the
/// transaction ledger, rebuilt from ledger sums wherever correctness
/// matters. `version` is the optimistic concurrency token: every durable
/// balance update must compare-and-swap on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub balance: Decimal,
    #[serde(skip_serializing)]
    pub version: i64,
    #[serde(skip_deserializing)]
    pub holdings: HashMap<String, Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Every new account starts with 1000.00 USD and a zeroed starter set.
pub const STARTING_BALANCE_CENTS: i64 = 1000_00;

const STARTER_ASSETS: [&str; 3] = ["bitcoin", "solana", "dogecoin"];

impl Account {
    /// Create a fresh account with the fixed starting balance and asset set.
    pub fn new(username: String, password_hash: String) -> Self {
        let now = Utc::now();
        let mut holdings = HashMap::new();
        for asset in STARTER_ASSETS {
            holdings.insert(asset.to_string(), Decimal::ZERO);
        }

        Self {
            id: Uuid::new_v4(),
            username,
            password_hash,
            balance: Decimal::new(STARTING_BALANCE_CENTS, 2),
            version: 0,
            holdings,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_funds(&self, total: Decimal) -> bool {
        self.balance >= total
    }

    /// Subtract `amount` from the USD balance. The balance must never go
    /// negative, so this re-checks even when the caller already did.
    pub fn debit(&mut self, amount: Decimal) -> Result<(), AccountError> {
        if amount <= Decimal::ZERO {
            return Err(AccountError::NonPositiveAmount);
        }
        if self.balance < amount {
            return Err(AccountError::InsufficientBalance);
        }
        self.balance -= amount;
        Ok(())
    }

    /// Add USD to the balance (deposits only take positive amounts).
    pub fn credit(&mut self, amount: Decimal) -> Result<(), AccountError> {
        if amount <= Decimal::ZERO {
            return Err(AccountError::NonPositiveAmount);
        }
        self.balance += amount;
        Ok(())
    }

    /// Apply a signed quantity to one holding, creating the entry if new.
    /// A tracked asset is never allowed to go negative.
    pub fn adjust_holding(&mut self, asset: &str, quantity: Decimal) -> Result<(), AccountError> {
        let current = self.holdings.get(asset).copied().unwrap_or(Decimal::ZERO);
        let updated = current + quantity;
        if updated < Decimal::ZERO {
            return Err(AccountError::NegativeHolding(asset.to_string()));
        }
        self.holdings.insert(asset.to_string(), updated);
        Ok(())
    }
}

impl<'r> FromRow<'r, PgRow> for Account {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            password_hash: row.try_get("password_hash")?,
            balance: row.try_get("balance")?,
            version: row.try_get("version")?,
            // Not a column - rebuilt from the ledger on demand
            holdings: HashMap::new(),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// One immutable ledger entry. Positive `amount` is a buy; the record is
/// created in the same durable commit as the balance debit and never
/// updated or deleted afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: Uuid,
    pub account_id: Uuid,
    pub coin: String,
    pub amount: Decimal,
    pub price: Decimal,
    pub executed_at: DateTime<Utc>,
}

impl TransactionRecord {
    /// A buy of `amount` units of `coin` at `price` USD per unit.
    pub fn buy(account_id: Uuid, coin: &str, amount: Decimal, price: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            coin: coin.to_string(),
            amount,
            price,
            executed_at: Utc::now(),
        }
    }
}

impl<'r> FromRow<'r, PgRow> for TransactionRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            coin: row.try_get("coin")?,
            amount: row.try_get("amount")?,
            price: row.try_get("price")?,
            executed_at: row.try_get("executed_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_new_account_defaults() {
        let account = Account::new("alice".to_string(), "hash".to_string());
        assert_eq!(account.balance, dec("1000.00"));
        assert_eq!(account.version, 0);
        assert_eq!(account.holdings.get("bitcoin"), Some(&Decimal::ZERO));
        assert_eq!(account.holdings.get("solana"), Some(&Decimal::ZERO));
        assert_eq!(account.holdings.get("dogecoin"), Some(&Decimal::ZERO));
    }

    #[test]
    fn test_debit_guards_balance() {
        let mut account = Account::new("alice".to_string(), "hash".to_string());
        account.debit(dec("400.00")).unwrap();
        assert_eq!(account.balance, dec("600.00"));

        let err = account.debit(dec("600.01")).unwrap_err();
        assert_eq!(err, AccountError::InsufficientBalance);
        assert_eq!(account.balance, dec("600.00"));

        assert_eq!(
            account.debit(Decimal::ZERO).unwrap_err(),
            AccountError::NonPositiveAmount
        );
    }

    #[test]
    fn test_credit_rejects_non_positive() {
        let mut account = Account::new("alice".to_string(), "hash".to_string());
        assert_eq!(
            account.credit(dec("-5.00")).unwrap_err(),
            AccountError::NonPositiveAmount
        );
        account.credit(dec("25.50")).unwrap();
        assert_eq!(account.balance, dec("1025.50"));
    }

    #[test]
    fn test_adjust_holding_creates_and_guards() {
        let mut account = Account::new("alice".to_string(), "hash".to_string());

        account.adjust_holding("ethereum", dec("0.5")).unwrap();
        assert_eq!(account.holdings.get("ethereum"), Some(&dec("0.5")));

        account.adjust_holding("ethereum", dec("-0.2")).unwrap();
        assert_eq!(account.holdings.get("ethereum"), Some(&dec("0.3")));

        let err = account.adjust_holding("ethereum", dec("-0.4")).unwrap_err();
        assert_eq!(err, AccountError::NegativeHolding("ethereum".to_string()));
        assert_eq!(account.holdings.get("ethereum"), Some(&dec("0.3")));
    }

    #[test]
    fn test_buy_record_identity() {
        let account_id = Uuid::new_v4();
        let a = TransactionRecord::buy(account_id, "bitcoin", dec("0.01"), dec("50000"));
        let b = TransactionRecord::buy(account_id, "bitcoin", dec("0.01"), dec("50000"));
        assert_ne!(a.id, b.id);
        assert_eq!(a.account_id, account_id);
        assert_eq!(a.coin, "bitcoin");
    }
}
