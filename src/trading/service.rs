//! Simulated trading operations
//!
//! The buy flow: validate -> price lookup -> funds check -> debit -> credit
//! holdings -> one atomic commit of the debited account plus the ledger
//! record. Commits compare-and-swap on the account version, so two racing
//! buys against one account can never both apply against the same snapshot;
//! the loser reloads and re-runs the funds check against the stored balance.

use crate::db::{Account, AccountError, StoreError, TradeStore, TransactionRecord};
use crate::market::{MarketError, PriceSource};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// How many times a buy re-runs after losing the version race.
const MAX_COMMIT_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum TradeError {
    #[error("quantity must be a positive number")]
    InvalidAmount,
    #[error("could not obtain a current price: {0}")]
    Price(#[from] MarketError),
    #[error("account not found")]
    AccountNotFound,
    #[error("insufficient USD balance")]
    InsufficientFunds,
    #[error("failed to persist trade: {0}")]
    Persistence(StoreError),
}

/// Result of a successful buy: the post-trade balance, the full holdings
/// snapshot and the ledger record that was committed with it.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BuyOutcome {
    pub balance: Decimal,
    pub holdings: HashMap<String, Decimal>,
    pub transaction: TransactionRecord,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BalanceView {
    pub usd_balance: Decimal,
    pub crypto_holdings: HashMap<String, Decimal>,
}

/// Sum the signed ledger quantities per coin. The ledger is the source of
/// truth for holdings; the account's in-memory map is only a cache of this.
pub fn reconstruct_holdings(records: &[TransactionRecord]) -> HashMap<String, Decimal> {
    let mut holdings: HashMap<String, Decimal> = HashMap::new();
    for record in records {
        *holdings.entry(record.coin.clone()).or_insert(Decimal::ZERO) += record.amount;
    }
    holdings
}

pub struct TradingService<P, S> {
    prices: Arc<P>,
    store: S,
}

impl<P: PriceSource, S: TradeStore> TradingService<P, S> {
    pub fn new(prices: Arc<P>, store: S) -> Self {
        Self { prices, store }
    }

    /// Execute a simulated buy of `quantity` units of `coin` at the current
    /// upstream USD price.
    pub async fn buy(
        &self,
        account_id: Uuid,
        coin: &str,
        quantity: &str,
    ) -> Result<BuyOutcome, TradeError> {
        let quantity = parse_quantity(quantity)?;

        let raw_price = self.prices.current_price(coin, "usd").await?;
        let unit_price = Decimal::from_f64_retain(raw_price)
            .ok_or_else(|| MarketError::Decode("price is not a finite number".to_string()))?;

        // Rounded to cents so the in-memory total matches what the
        // NUMERIC(15,2) balance column will actually store.
        let total = unit_price
            .checked_mul(quantity)
            .ok_or(TradeError::InvalidAmount)?
            .round_dp(2);

        for attempt in 0..MAX_COMMIT_ATTEMPTS {
            let mut account = self.load_account(account_id).await?;

            if !account.has_funds(total) {
                return Err(TradeError::InsufficientFunds);
            }
            account.debit(total).map_err(map_account_error)?;

            // Refresh the holdings cache from the ledger before crediting,
            // so the returned snapshot is ledger-true.
            let ledger = self
                .store
                .find_by_account(account_id)
                .await
                .map_err(TradeError::Persistence)?;
            account.holdings = reconstruct_holdings(&ledger);
            account
                .adjust_holding(coin, quantity)
                .map_err(map_account_error)?;

            let record = TransactionRecord::buy(account_id, coin, quantity, unit_price);

            match self.store.commit_trade(&account, &record).await {
                Ok(()) => {
                    info!(
                        "Buy committed: account={} coin={} qty={} total={}",
                        account_id, coin, quantity, total
                    );
                    return Ok(BuyOutcome {
                        balance: account.balance,
                        holdings: account.holdings,
                        transaction: record,
                    });
                }
                Err(StoreError::VersionConflict) => {
                    warn!(
                        "Buy lost version race (attempt {}), reloading account {}",
                        attempt + 1,
                        account_id
                    );
                    continue;
                }
                Err(StoreError::NotFound) => return Err(TradeError::AccountNotFound),
                Err(err) => return Err(TradeError::Persistence(err)),
            }
        }

        Err(TradeError::Persistence(StoreError::VersionConflict))
    }

    /// Add USD to an account balance.
    pub async fn deposit(&self, account_id: Uuid, amount: Decimal) -> Result<Decimal, TradeError> {
        if amount <= Decimal::ZERO {
            return Err(TradeError::InvalidAmount);
        }

        for _ in 0..MAX_COMMIT_ATTEMPTS {
            let mut account = self.load_account(account_id).await?;
            account.credit(amount).map_err(map_account_error)?;

            match self.store.save(&account).await {
                Ok(()) => {
                    info!("Deposit committed: account={} amount={}", account_id, amount);
                    return Ok(account.balance);
                }
                Err(StoreError::VersionConflict) => continue,
                Err(StoreError::NotFound) => return Err(TradeError::AccountNotFound),
                Err(err) => return Err(TradeError::Persistence(err)),
            }
        }

        Err(TradeError::Persistence(StoreError::VersionConflict))
    }

    /// The account's full ledger, oldest first.
    pub async fn history(&self, account_id: Uuid) -> Result<Vec<TransactionRecord>, TradeError> {
        self.store
            .find_by_account(account_id)
            .await
            .map_err(TradeError::Persistence)
    }

    /// USD balance plus holdings reconstructed from the ledger.
    pub async fn balances(&self, account_id: Uuid) -> Result<BalanceView, TradeError> {
        let account = self.load_account(account_id).await?;
        let ledger = self
            .store
            .find_by_account(account_id)
            .await
            .map_err(TradeError::Persistence)?;

        Ok(BalanceView {
            usd_balance: account.balance,
            crypto_holdings: reconstruct_holdings(&ledger),
        })
    }

    async fn load_account(&self, account_id: Uuid) -> Result<Account, TradeError> {
        self.store.find_by_id(account_id).await.map_err(|err| match err {
            StoreError::NotFound => TradeError::AccountNotFound,
            other => TradeError::Persistence(other),
        })
    }
}

fn parse_quantity(raw: &str) -> Result<Decimal, TradeError> {
    let quantity: Decimal = raw.trim().parse().map_err(|_| TradeError::InvalidAmount)?;
    if quantity <= Decimal::ZERO {
        return Err(TradeError::InvalidAmount);
    }
    Ok(quantity)
}

fn map_account_error(err: AccountError) -> TradeError {
    match err {
        AccountError::InsufficientBalance => TradeError::InsufficientFunds,
        AccountError::NonPositiveAmount | AccountError::NegativeHolding(_) => {
            TradeError::InvalidAmount
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AccountStore, LedgerStore};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    // ==========================================
    // Scripted price source
    // ==========================================

    enum PriceScript {
        Quote(f64),
        Down,
    }

    struct StubPrices {
        script: PriceScript,
        calls: AtomicUsize,
    }

    impl StubPrices {
        fn quoting(price: f64) -> Arc<Self> {
            Arc::new(Self {
                script: PriceScript::Quote(price),
                calls: AtomicUsize::new(0),
            })
        }

        fn down() -> Arc<Self> {
            Arc::new(Self {
                script: PriceScript::Down,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl PriceSource for StubPrices {
        async fn current_price(&self, _asset: &str, _fiat: &str) -> Result<f64, MarketError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script {
                PriceScript::Quote(price) => Ok(price),
                PriceScript::Down => Err(MarketError::Unavailable),
            }
        }
    }

    // ==========================================
    // In-memory store with fault injection
    // ==========================================

    #[derive(Default)]
    struct MemoryInner {
        accounts: Mutex<HashMap<Uuid, Account>>,
        ledger: Mutex<Vec<TransactionRecord>>,
        reject_commits: AtomicUsize,
        // Debits applied by a "concurrent" writer the moment a commit tries
        // to land, forcing a version conflict.
        conflicting_debits: Mutex<Vec<Decimal>>,
    }

    #[derive(Clone, Default)]
    struct MemoryStore(Arc<MemoryInner>);

    impl MemoryStore {
        fn seed(&self, account: Account) -> Uuid {
            let id = account.id;
            self.0.accounts.lock().insert(id, account);
            id
        }

        fn balance_of(&self, id: Uuid) -> Decimal {
            self.0.accounts.lock().get(&id).unwrap().balance
        }

        fn ledger_len(&self) -> usize {
            self.0.ledger.lock().len()
        }

        fn reject_next_commits(&self, n: usize) {
            self.0.reject_commits.store(n, Ordering::SeqCst);
        }

        fn debit_concurrently_on_commit(&self, amount: Decimal) {
            self.0.conflicting_debits.lock().push(amount);
        }
    }

    impl AccountStore for MemoryStore {
        async fn find_by_id(&self, id: Uuid) -> Result<Account, StoreError> {
            self.0
                .accounts
                .lock()
                .get(&id)
                .cloned()
                .ok_or(StoreError::NotFound)
        }

        async fn find_by_username(&self, username: &str) -> Result<Account, StoreError> {
            self.0
                .accounts
                .lock()
                .values()
                .find(|account| account.username == username)
                .cloned()
                .ok_or(StoreError::NotFound)
        }

        async fn insert(&self, account: &Account) -> Result<(), StoreError> {
            self.0.accounts.lock().insert(account.id, account.clone());
            Ok(())
        }

        async fn save(&self, account: &Account) -> Result<(), StoreError> {
            let mut accounts = self.0.accounts.lock();
            let stored = accounts.get_mut(&account.id).ok_or(StoreError::NotFound)?;
            if stored.version != account.version {
                return Err(StoreError::VersionConflict);
            }
            stored.balance = account.balance;
            stored.version += 1;
            Ok(())
        }
    }

    impl LedgerStore for MemoryStore {
        async fn append(&self, record: &TransactionRecord) -> Result<(), StoreError> {
            self.0.ledger.lock().push(record.clone());
            Ok(())
        }

        async fn find_by_account(
            &self,
            account_id: Uuid,
        ) -> Result<Vec<TransactionRecord>, StoreError> {
            Ok(self
                .0
                .ledger
                .lock()
                .iter()
                .filter(|record| record.account_id == account_id)
                .cloned()
                .collect())
        }
    }

    impl TradeStore for MemoryStore {
        async fn commit_trade(
            &self,
            account: &Account,
            record: &TransactionRecord,
        ) -> Result<(), StoreError> {
            if self
                .0
                .reject_commits
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::Rejected("injected write failure".to_string()));
            }

            let mut accounts = self.0.accounts.lock();
            let stored = accounts.get_mut(&account.id).ok_or(StoreError::NotFound)?;

            if let Some(amount) = self.0.conflicting_debits.lock().pop() {
                stored.balance -= amount;
                stored.version += 1;
                return Err(StoreError::VersionConflict);
            }

            if stored.version != account.version {
                return Err(StoreError::VersionConflict);
            }
            stored.balance = account.balance;
            stored.version += 1;
            self.0.ledger.lock().push(record.clone());
            Ok(())
        }
    }

    fn service(
        prices: Arc<StubPrices>,
    ) -> (TradingService<StubPrices, MemoryStore>, MemoryStore, Uuid) {
        let store = MemoryStore::default();
        let account_id = store.seed(Account::new("alice".to_string(), "hash".to_string()));
        let service = TradingService::new(prices, store.clone());
        (service, store, account_id)
    }

    #[tokio::test]
    async fn test_buy_scenario_debits_credits_and_records() {
        let prices = StubPrices::quoting(50000.0);
        let (service, store, account_id) = service(prices);

        let outcome = service.buy(account_id, "bitcoin", "0.01").await.unwrap();

        assert_eq!(outcome.balance, dec("500.00"));
        assert_eq!(outcome.holdings.get("bitcoin"), Some(&dec("0.01")));
        assert_eq!(outcome.transaction.amount, dec("0.01"));
        assert_eq!(outcome.transaction.price, dec("50000"));

        assert_eq!(store.balance_of(account_id), dec("500.00"));
        assert_eq!(store.ledger_len(), 1);
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_state_untouched() {
        let prices = StubPrices::quoting(50000.0);
        let (service, store, account_id) = service(prices);

        let err = service.buy(account_id, "bitcoin", "0.05").await.unwrap_err();
        assert!(matches!(err, TradeError::InsufficientFunds));

        assert_eq!(store.balance_of(account_id), dec("1000.00"));
        assert_eq!(store.ledger_len(), 0);
    }

    #[tokio::test]
    async fn test_invalid_amount_makes_no_upstream_call() {
        let prices = StubPrices::quoting(50000.0);
        let (service, _store, account_id) = service(prices.clone());

        for raw in ["abc", "-1", "0", "", "1.2.3"] {
            let err = service.buy(account_id, "bitcoin", raw).await.unwrap_err();
            assert!(matches!(err, TradeError::InvalidAmount), "input: {raw:?}");
        }

        assert_eq!(prices.calls(), 0);
    }

    #[tokio::test]
    async fn test_price_failure_propagates_without_mutation() {
        let prices = StubPrices::down();
        let (service, store, account_id) = service(prices);

        let err = service.buy(account_id, "bitcoin", "0.01").await.unwrap_err();
        assert!(matches!(err, TradeError::Price(MarketError::Unavailable)));

        assert_eq!(store.balance_of(account_id), dec("1000.00"));
        assert_eq!(store.ledger_len(), 0);
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let prices = StubPrices::quoting(50000.0);
        let (service, _store, _account_id) = service(prices);

        let err = service
            .buy(Uuid::new_v4(), "bitcoin", "0.01")
            .await
            .unwrap_err();
        assert!(matches!(err, TradeError::AccountNotFound));
    }

    #[tokio::test]
    async fn test_commit_failure_is_persistence_error() {
        let prices = StubPrices::quoting(50000.0);
        let (service, store, account_id) = service(prices);
        store.reject_next_commits(usize::MAX);

        let err = service.buy(account_id, "bitcoin", "0.01").await.unwrap_err();
        assert!(matches!(err, TradeError::Persistence(StoreError::Rejected(_))));

        assert_eq!(store.balance_of(account_id), dec("1000.00"));
        assert_eq!(store.ledger_len(), 0);
    }

    #[tokio::test]
    async fn test_version_race_revalidates_funds_against_stored_balance() {
        let prices = StubPrices::quoting(50000.0);
        let (service, store, account_id) = service(prices);
        // A concurrent buy drains 600 USD the moment our commit tries to
        // land. The retry must see the 400 USD that is actually stored.
        store.debit_concurrently_on_commit(dec("600.00"));

        let err = service.buy(account_id, "bitcoin", "0.01").await.unwrap_err();
        assert!(matches!(err, TradeError::InsufficientFunds));

        assert_eq!(store.balance_of(account_id), dec("400.00"));
        assert_eq!(store.ledger_len(), 0);
    }

    #[tokio::test]
    async fn test_version_race_retry_succeeds_when_funds_remain() {
        let prices = StubPrices::quoting(50000.0);
        let (service, store, account_id) = service(prices);
        store.debit_concurrently_on_commit(dec("100.00"));

        let outcome = service.buy(account_id, "bitcoin", "0.01").await.unwrap();

        // 1000 - 100 (concurrent) - 500 (this buy)
        assert_eq!(outcome.balance, dec("400.00"));
        assert_eq!(store.balance_of(account_id), dec("400.00"));
        assert_eq!(store.ledger_len(), 1);
    }

    #[tokio::test]
    async fn test_buy_rounds_total_to_cents() {
        let prices = StubPrices::quoting(0.123456);
        let (service, store, account_id) = service(prices);

        let outcome = service.buy(account_id, "dogecoin", "1").await.unwrap();

        assert_eq!(outcome.balance, dec("999.88"));
        assert_eq!(store.balance_of(account_id), dec("999.88"));
    }

    #[tokio::test]
    async fn test_deposit() {
        let prices = StubPrices::quoting(50000.0);
        let (service, store, account_id) = service(prices);

        let balance = service.deposit(account_id, dec("500.00")).await.unwrap();
        assert_eq!(balance, dec("1500.00"));
        assert_eq!(store.balance_of(account_id), dec("1500.00"));

        let err = service.deposit(account_id, dec("-1")).await.unwrap_err();
        assert!(matches!(err, TradeError::InvalidAmount));
    }

    #[tokio::test]
    async fn test_balances_reconstructed_from_ledger() {
        let prices = StubPrices::quoting(50000.0);
        let (service, store, account_id) = service(prices);

        store
            .append(&TransactionRecord::buy(
                account_id,
                "bitcoin",
                dec("0.5"),
                dec("40000"),
            ))
            .await
            .unwrap();
        store
            .append(&TransactionRecord::buy(
                account_id,
                "solana",
                dec("2"),
                dec("100"),
            ))
            .await
            .unwrap();
        store
            .append(&TransactionRecord::buy(
                account_id,
                "bitcoin",
                dec("-0.2"),
                dec("45000"),
            ))
            .await
            .unwrap();

        let view = service.balances(account_id).await.unwrap();
        assert_eq!(view.usd_balance, dec("1000.00"));
        assert_eq!(view.crypto_holdings.get("bitcoin"), Some(&dec("0.3")));
        assert_eq!(view.crypto_holdings.get("solana"), Some(&dec("2")));
    }

    #[test]
    fn test_reconstruct_holdings_sums_signed_quantities() {
        let account_id = Uuid::new_v4();
        let records = vec![
            TransactionRecord::buy(account_id, "bitcoin", dec("1.0"), dec("30000")),
            TransactionRecord::buy(account_id, "bitcoin", dec("0.5"), dec("35000")),
            TransactionRecord::buy(account_id, "bitcoin", dec("-0.25"), dec("40000")),
        ];

        let holdings = reconstruct_holdings(&records);
        assert_eq!(holdings.get("bitcoin"), Some(&dec("1.25")));
    }
}
