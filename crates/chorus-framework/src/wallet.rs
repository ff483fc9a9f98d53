//! The shared per-user wallet.
//!
//! Accounts live in the `accounts` collection and are only ever mutated
//! here. Every balance change is a compare-and-set on the account's
//! `version` field, so concurrent writers on the same account retry instead
//! of losing an update. Each successful credit or debit appends one entry to
//! the append-only `transactions` collection.
//!
//! Transfers use the store's atomic batch when available. Otherwise they
//! debit, then credit, and on a failed credit apply a compensating credit to
//! the sender and surface [`WalletError::PartialFailure`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use chorus_core::{FindOptions, IndexSpec, StoreError, UpdateOptions, WriteOp};

use crate::error::{WalletError, WalletResult};
use crate::gateway::{CollectionsGateway, IndexDecl};

/// Collection holding one document per user.
pub const ACCOUNTS: &str = "accounts";
/// Append-only ledger.
pub const TRANSACTIONS: &str = "transactions";

/// Timed effects kept per account.
const MAX_EFFECTS: i64 = 20;

/// Account field stamped with the id of the last write applied to it.
const LAST_OP: &str = "lastOpId";

/// Wallet limits and retry policy.
#[derive(Debug, Clone)]
pub struct WalletConfig {
    /// Upper bound on `wallet`.
    pub max_wallet: i64,
    /// Upper bound on `bank`.
    pub max_bank: i64,
    /// Compare-and-set attempts before giving up with `Contention`.
    pub max_cas_retries: u32,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            max_wallet: 1_000_000_000,
            max_bank: 10_000_000_000,
            max_cas_retries: 5,
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// Lifetime counters on an account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountStats {
    /// Sum of credited deltas.
    #[serde(default)]
    pub total_earned: i64,
    /// Sum of debited amounts.
    #[serde(default)]
    pub total_spent: i64,
}

/// A timed credit multiplier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Effect {
    /// Short label (`double-xp`, ...).
    #[serde(default)]
    pub name: String,
    /// Multiplier applied to credits while active.
    pub factor: f64,
    /// End of the effect.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

impl Effect {
    /// Returns `true` until `expires_at`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// A stored account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccount {
    /// Normalized user id.
    pub user_id: String,
    /// Spendable balance.
    #[serde(default)]
    pub wallet: i64,
    /// Banked balance.
    #[serde(default)]
    pub bank: i64,
    /// Locked balance (plugin-managed through the wallet API).
    #[serde(default)]
    pub vault: i64,
    /// Compare-and-set counter.
    #[serde(default)]
    pub version: u64,
    /// Creation time.
    #[serde(default = "Utc::now", with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    #[serde(default = "Utc::now", with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    /// Lifetime counters.
    #[serde(default)]
    pub stats: AccountStats,
    /// Timed multipliers.
    #[serde(default)]
    pub effects: Vec<Effect>,
}

impl UserAccount {
    fn fresh(user: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user.to_string(),
            wallet: 0,
            bank: 0,
            vault: 0,
            version: 0,
            created_at: now,
            updated_at: now,
            stats: AccountStats::default(),
            effects: Vec::new(),
        }
    }

    /// Product of every active effect's factor.
    pub fn multiplier(&self, now: DateTime<Utc>) -> f64 {
        self.effects
            .iter()
            .filter(|e| e.is_active(now))
            .map(|e| e.factor)
            .product()
    }

    /// The three balances.
    pub fn balance(&self) -> Balance {
        Balance {
            wallet: self.wallet,
            bank: self.bank,
            vault: self.vault,
        }
    }
}

/// Balances of one account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// Spendable balance.
    pub wallet: i64,
    /// Banked balance.
    pub bank: i64,
    /// Locked balance.
    pub vault: i64,
}

/// Ledger entry type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    /// Wallet increased.
    Credit,
    /// Wallet decreased.
    Debit,
    /// Wallet to bank.
    Deposit,
    /// Bank to wallet.
    Withdraw,
}

/// One ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEntry {
    /// Account owner.
    pub user_id: String,
    /// Entry type.
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    /// Actual delta applied (may be zero after clamping).
    pub amount: i64,
    /// Caller-supplied reason.
    pub reason: String,
    /// Wallet before the change.
    pub before: i64,
    /// Wallet after the change.
    pub after: i64,
    /// When the change was applied.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub at: DateTime<Utc>,
}

/// Options for [`Wallet::add_money`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreditOptions {
    /// Multiply the amount by the account's active effects.
    pub apply_effects: bool,
}

/// Wallet balances after a successful transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReceipt {
    /// Sender's wallet after the transfer.
    pub from_wallet: i64,
    /// Recipient's wallet after the transfer.
    pub to_wallet: i64,
}

// =============================================================================
// Wallet
// =============================================================================

/// The wallet service.
pub struct Wallet {
    gateway: Arc<CollectionsGateway>,
    config: WalletConfig,
    pending: Mutex<Vec<TransactionEntry>>,
}

impl Wallet {
    /// Creates the service over a gateway.
    pub fn new(gateway: Arc<CollectionsGateway>, config: WalletConfig) -> Self {
        Self {
            gateway,
            config,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Configured limits.
    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    /// The indexes the wallet relies on.
    pub fn indexes() -> Vec<IndexDecl> {
        vec![
            IndexDecl::new(ACCOUNTS, IndexSpec::new([("userId", 1)]).unique()),
            IndexDecl::new(TRANSACTIONS, IndexSpec::new([("userId", 1), ("at", -1)])),
        ]
    }

    /// Applies [`Self::indexes`]; idempotent.
    pub async fn ensure_indexes(&self) -> WalletResult<()> {
        self.gateway.ensure_indexes(&Self::indexes()).await?;
        Ok(())
    }

    // ─── Accounts ────────────────────────────────────────────────────────────

    /// Creates the account when missing and returns it.
    ///
    /// Older records missing any field get it filled in with its default.
    pub async fn init_user(&self, user: &str) -> WalletResult<UserAccount> {
        self.retry_pending().await;

        let filter = json!({ "userId": user });
        if let Some(doc) = self.gateway.find_one(ACCOUNTS, filter.clone()).await? {
            return self.backfill(user, doc).await;
        }

        let seed = serde_json::to_value(UserAccount::fresh(user, Utc::now()))
            .map_err(StoreError::from)?;
        let mut on_insert = seed;
        if let Some(map) = on_insert.as_object_mut() {
            map.remove("userId");
        }
        match self
            .gateway
            .update_one(
                ACCOUNTS,
                filter.clone(),
                json!({ "$setOnInsert": on_insert }),
                UpdateOptions::upsert(),
            )
            .await
        {
            Ok(outcome) => {
                if outcome.upserted_id.is_some() {
                    info!(user, "Account created");
                }
            }
            // Lost a creation race; the other writer's record wins.
            Err(StoreError::DuplicateKey { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        let doc = self
            .gateway
            .find_one(ACCOUNTS, filter)
            .await?
            .ok_or_else(|| WalletError::Corrupt {
                user: user.to_string(),
                message: "account vanished after creation".into(),
            })?;
        Self::decode(user, doc)
    }

    async fn backfill(&self, user: &str, doc: Value) -> WalletResult<UserAccount> {
        let account = Self::decode(user, doc.clone())?;
        let full = serde_json::to_value(&account).map_err(StoreError::from)?;

        let mut missing = serde_json::Map::new();
        if let (Value::Object(have), Value::Object(want)) = (&doc, &full) {
            for (key, value) in want {
                if !have.contains_key(key) {
                    missing.insert(key.clone(), value.clone());
                }
            }
        }
        if !missing.is_empty() {
            debug!(user, fields = missing.len(), "Filling missing account fields");
            self.gateway
                .update_one(
                    ACCOUNTS,
                    json!({ "userId": user }),
                    json!({ "$set": missing }),
                    UpdateOptions::default(),
                )
                .await?;
        }
        Ok(account)
    }

    fn decode(user: &str, doc: Value) -> WalletResult<UserAccount> {
        serde_json::from_value(doc).map_err(|e| WalletError::Corrupt {
            user: user.to_string(),
            message: e.to_string(),
        })
    }

    /// Returns the user's balances (creating the account when missing).
    pub async fn get_balance(&self, user: &str) -> WalletResult<Balance> {
        Ok(self.init_user(user).await?.balance())
    }

    // ─── Credits and debits ──────────────────────────────────────────────────

    /// Credits `amount` (optionally multiplied by active effects), clamped at
    /// the wallet limit. Returns the new wallet balance.
    pub async fn add_money(
        &self,
        user: &str,
        amount: i64,
        reason: &str,
        options: CreditOptions,
    ) -> WalletResult<i64> {
        if amount < 1 {
            return Err(WalletError::InvalidAmount(amount));
        }

        for _ in 0..self.config.max_cas_retries {
            let account = self.init_user(user).await?;
            let now = Utc::now();
            let credited = if options.apply_effects {
                ((amount as f64) * account.multiplier(now)).floor().max(1.0) as i64
            } else {
                amount
            };
            let before = account.wallet;
            let after = before.saturating_add(credited).min(self.config.max_wallet);
            let delta = after - before;

            let applied = self
                .compare_and_set(
                    &account,
                    json!({
                        "$set": { "wallet": after, "updatedAt": now.timestamp_millis() },
                        "$inc": { "version": 1, "stats.totalEarned": delta },
                    }),
                )
                .await?;
            if applied {
                if delta < credited {
                    debug!(user, requested = credited, applied = delta, "Credit clamped at wallet limit");
                }
                self.record(entry(user, TransactionKind::Credit, delta, reason, before, after, now))
                    .await;
                return Ok(after);
            }
        }
        Err(WalletError::Contention(user.to_string()))
    }

    /// Debits `amount`. Returns `false` without touching the account when
    /// the wallet is too small.
    pub async fn remove_money(&self, user: &str, amount: i64, reason: &str) -> WalletResult<bool> {
        if amount < 1 {
            return Err(WalletError::InvalidAmount(amount));
        }

        for _ in 0..self.config.max_cas_retries {
            let account = self.init_user(user).await?;
            if account.wallet < amount {
                return Ok(false);
            }
            let now = Utc::now();
            let before = account.wallet;
            let after = before - amount;

            let applied = self
                .compare_and_set(
                    &account,
                    json!({
                        "$set": { "wallet": after, "updatedAt": now.timestamp_millis() },
                        "$inc": { "version": 1, "stats.totalSpent": amount },
                    }),
                )
                .await?;
            if applied {
                self.record(entry(user, TransactionKind::Debit, amount, reason, before, after, now))
                    .await;
                return Ok(true);
            }
        }
        Err(WalletError::Contention(user.to_string()))
    }

    // ─── Transfers ───────────────────────────────────────────────────────────

    /// Moves `amount` from one wallet to another.
    pub async fn transfer(
        &self,
        from: &str,
        to: &str,
        amount: i64,
        reason: &str,
    ) -> WalletResult<TransferReceipt> {
        if amount < 1 {
            return Err(WalletError::InvalidAmount(amount));
        }
        if from == to || chorus_core::same_user(from, to) {
            return Err(WalletError::SelfTransfer);
        }

        if self.gateway.supports_transactions() {
            self.transfer_atomic(from, to, amount, reason).await
        } else {
            self.transfer_compensated(from, to, amount, reason).await
        }
    }

    fn check_transfer(&self, sender: &UserAccount, recipient: &UserAccount, amount: i64) -> WalletResult<()> {
        if sender.wallet < amount {
            return Err(WalletError::InsufficientFunds {
                needed: amount,
                available: sender.wallet,
            });
        }
        if recipient.wallet.saturating_add(amount) > self.config.max_wallet {
            return Err(WalletError::RecipientFull);
        }
        Ok(())
    }

    async fn transfer_atomic(
        &self,
        from: &str,
        to: &str,
        amount: i64,
        reason: &str,
    ) -> WalletResult<TransferReceipt> {
        for _ in 0..self.config.max_cas_retries {
            let sender = self.init_user(from).await?;
            let recipient = self.init_user(to).await?;
            self.check_transfer(&sender, &recipient, amount)?;

            let now = Utc::now();
            let from_after = sender.wallet - amount;
            let to_after = recipient.wallet + amount;
            let debit = entry(from, TransactionKind::Debit, amount, reason, sender.wallet, from_after, now);
            let credit = entry(to, TransactionKind::Credit, amount, reason, recipient.wallet, to_after, now);

            let op_id = Uuid::new_v4().to_string();
            let ops = vec![
                cas_op(&sender, json!({
                    "$set": { "wallet": from_after, "updatedAt": now.timestamp_millis(), LAST_OP: op_id },
                    "$inc": { "version": 1, "stats.totalSpent": amount },
                })),
                cas_op(&recipient, json!({
                    "$set": { "wallet": to_after, "updatedAt": now.timestamp_millis() },
                    "$inc": { "version": 1, "stats.totalEarned": amount },
                })),
                WriteOp::Insert {
                    collection: TRANSACTIONS.to_string(),
                    document: serde_json::to_value(&debit).map_err(StoreError::from)?,
                },
                WriteOp::Insert {
                    collection: TRANSACTIONS.to_string(),
                    document: serde_json::to_value(&credit).map_err(StoreError::from)?,
                },
            ];

            match self.gateway.apply_atomic(ops).await {
                Ok(()) => {
                    info!(from, to, amount, "Transfer committed");
                    return Ok(TransferReceipt {
                        from_wallet: from_after,
                        to_wallet: to_after,
                    });
                }
                Err(StoreError::Conflict(_)) if self.was_applied(from, &op_id).await? => {
                    info!(from, to, amount, "Transfer committed on an earlier attempt");
                    return Ok(TransferReceipt {
                        from_wallet: from_after,
                        to_wallet: to_after,
                    });
                }
                Err(StoreError::Conflict(_)) => {
                    debug!(from, to, "Transfer raced another writer, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(WalletError::Contention(from.to_string()))
    }

    async fn transfer_compensated(
        &self,
        from: &str,
        to: &str,
        amount: i64,
        reason: &str,
    ) -> WalletResult<TransferReceipt> {
        let sender = self.init_user(from).await?;
        let recipient = self.init_user(to).await?;
        self.check_transfer(&sender, &recipient, amount)?;

        if !self.remove_money(from, amount, reason).await? {
            let available = self.get_balance(from).await?.wallet;
            return Err(WalletError::InsufficientFunds {
                needed: amount,
                available,
            });
        }

        match self.credit_exact(to, amount, reason).await {
            Ok(to_wallet) => {
                let from_wallet = self.get_balance(from).await?.wallet;
                info!(from, to, amount, "Transfer committed without transaction");
                Ok(TransferReceipt {
                    from_wallet,
                    to_wallet,
                })
            }
            Err(e) => {
                let source = match e {
                    WalletError::Store(source) => source,
                    other => StoreError::Conflict(other.to_string()),
                };
                let compensated = self
                    .credit_exact(from, amount, &format!("refund: {reason}"))
                    .await
                    .is_ok();
                warn!(
                    from,
                    to,
                    amount,
                    compensated,
                    error = %source,
                    "Transfer credit failed after debit"
                );
                Err(WalletError::PartialFailure {
                    stage: "credit",
                    compensated,
                    source,
                })
            }
        }
    }

    /// Credits exactly `amount` or fails; never clamps.
    async fn credit_exact(&self, user: &str, amount: i64, reason: &str) -> WalletResult<i64> {
        for _ in 0..self.config.max_cas_retries {
            let account = self.init_user(user).await?;
            let before = account.wallet;
            let after = before.saturating_add(amount);
            if after > self.config.max_wallet {
                return Err(WalletError::RecipientFull);
            }
            let now = Utc::now();
            let applied = self
                .compare_and_set(
                    &account,
                    json!({
                        "$set": { "wallet": after, "updatedAt": now.timestamp_millis() },
                        "$inc": { "version": 1, "stats.totalEarned": amount },
                    }),
                )
                .await?;
            if applied {
                self.record(entry(user, TransactionKind::Credit, amount, reason, before, after, now))
                    .await;
                return Ok(after);
            }
        }
        Err(WalletError::Contention(user.to_string()))
    }

    // ─── Bank ────────────────────────────────────────────────────────────────

    /// Moves `amount` from wallet to bank.
    pub async fn deposit(&self, user: &str, amount: i64) -> WalletResult<Balance> {
        self.move_between(user, amount, TransactionKind::Deposit).await
    }

    /// Moves `amount` from bank to wallet.
    pub async fn withdraw(&self, user: &str, amount: i64) -> WalletResult<Balance> {
        self.move_between(user, amount, TransactionKind::Withdraw).await
    }

    async fn move_between(
        &self,
        user: &str,
        amount: i64,
        kind: TransactionKind,
    ) -> WalletResult<Balance> {
        if amount < 1 {
            return Err(WalletError::InvalidAmount(amount));
        }

        for _ in 0..self.config.max_cas_retries {
            let account = self.init_user(user).await?;
            let (wallet, bank) = match kind {
                TransactionKind::Deposit => {
                    if account.wallet < amount {
                        return Err(WalletError::InsufficientFunds {
                            needed: amount,
                            available: account.wallet,
                        });
                    }
                    if account.bank.saturating_add(amount) > self.config.max_bank {
                        return Err(WalletError::BankFull);
                    }
                    (account.wallet - amount, account.bank + amount)
                }
                _ => {
                    if account.bank < amount {
                        return Err(WalletError::InsufficientFunds {
                            needed: amount,
                            available: account.bank,
                        });
                    }
                    if account.wallet.saturating_add(amount) > self.config.max_wallet {
                        return Err(WalletError::WalletFull);
                    }
                    (account.wallet + amount, account.bank - amount)
                }
            };

            let now = Utc::now();
            let applied = self
                .compare_and_set(
                    &account,
                    json!({
                        "$set": { "wallet": wallet, "bank": bank, "updatedAt": now.timestamp_millis() },
                        "$inc": { "version": 1 },
                    }),
                )
                .await?;
            if applied {
                self.record(entry(user, kind, amount, "bank", account.wallet, wallet, now))
                    .await;
                return Ok(Balance {
                    wallet,
                    bank,
                    vault: account.vault,
                });
            }
        }
        Err(WalletError::Contention(user.to_string()))
    }

    // ─── Effects and history ─────────────────────────────────────────────────

    /// Records a timed multiplier on the account.
    pub async fn add_effect(&self, user: &str, effect: Effect) -> WalletResult<()> {
        self.init_user(user).await?;
        let effect = serde_json::to_value(&effect).map_err(StoreError::from)?;
        self.gateway
            .update_one(
                ACCOUNTS,
                json!({ "userId": user }),
                json!({
                    "$push": { "effects": { "$each": [effect], "$slice": -MAX_EFFECTS } },
                    "$inc": { "version": 1 },
                }),
                UpdateOptions::default(),
            )
            .await?;
        Ok(())
    }

    /// Ledger entries for `user`, newest first.
    pub async fn history(&self, user: &str, limit: usize) -> WalletResult<Vec<TransactionEntry>> {
        let docs = self
            .gateway
            .find(
                TRANSACTIONS,
                json!({ "userId": user }),
                FindOptions::default().sort(json!({ "at": -1 })).limit(limit),
            )
            .await?;
        docs.into_iter()
            .map(|doc| {
                serde_json::from_value(doc).map_err(|e| WalletError::Corrupt {
                    user: user.to_string(),
                    message: e.to_string(),
                })
            })
            .collect()
    }

    // ─── Ledger ──────────────────────────────────────────────────────────────

    /// Number of ledger entries waiting to be written.
    pub fn pending_entries(&self) -> usize {
        self.pending.lock().len()
    }

    /// Writes held-back ledger entries; returns how many were written.
    pub async fn flush_ledger(&self) -> WalletResult<usize> {
        let entries = std::mem::take(&mut *self.pending.lock());
        if entries.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        let mut failure = None;
        let mut left = Vec::new();
        for entry in entries {
            if failure.is_some() {
                left.push(entry);
                continue;
            }
            match self.insert_entry(&entry).await {
                Ok(()) => written += 1,
                Err(e) => {
                    failure = Some(e);
                    left.push(entry);
                }
            }
        }
        if !left.is_empty() {
            self.pending.lock().extend(left);
        }
        match failure {
            Some(e) => Err(e.into()),
            None => {
                debug!(written, "Ledger flushed");
                Ok(written)
            }
        }
    }

    async fn retry_pending(&self) {
        if self.pending_entries() > 0
            && let Err(e) = self.flush_ledger().await
        {
            debug!(error = %e, "Ledger still unavailable");
        }
    }

    async fn record(&self, entry: TransactionEntry) {
        if let Err(e) = self.insert_entry(&entry).await {
            warn!(user = %entry.user_id, error = %e, "Ledger write failed, holding entry");
            self.pending.lock().push(entry);
        }
    }

    async fn insert_entry(&self, entry: &TransactionEntry) -> Result<(), StoreError> {
        let doc = serde_json::to_value(entry)?;
        self.gateway.insert_one(TRANSACTIONS, doc).await.map(|_| ())
    }

    /// Applies `update` if the account is still at the version it was read
    /// at. The write carries a fresh operation id, so a retried write that
    /// misses because its first attempt already landed still reports success.
    async fn compare_and_set(&self, account: &UserAccount, mut update: Value) -> WalletResult<bool> {
        let op_id = Uuid::new_v4().to_string();
        if let Some(set) = update.get_mut("$set").and_then(Value::as_object_mut) {
            set.insert(LAST_OP.to_string(), Value::from(op_id.as_str()));
        }
        let outcome = self
            .gateway
            .update_one(
                ACCOUNTS,
                json!({ "userId": account.user_id, "version": account.version }),
                update,
                UpdateOptions::default(),
            )
            .await?;
        if outcome.matched == 1 {
            return Ok(true);
        }
        Ok(self.was_applied(&account.user_id, &op_id).await?)
    }

    async fn was_applied(&self, user: &str, op_id: &str) -> Result<bool, StoreError> {
        let doc = self
            .gateway
            .find_one(ACCOUNTS, json!({ "userId": user }))
            .await?;
        Ok(doc
            .as_ref()
            .and_then(|d| d.get(LAST_OP))
            .and_then(Value::as_str)
            == Some(op_id))
    }
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("config", &self.config)
            .field("pending", &self.pending_entries())
            .finish()
    }
}

fn entry(
    user: &str,
    kind: TransactionKind,
    amount: i64,
    reason: &str,
    before: i64,
    after: i64,
    at: DateTime<Utc>,
) -> TransactionEntry {
    TransactionEntry {
        user_id: user.to_string(),
        kind,
        amount,
        reason: reason.to_string(),
        before,
        after,
        at,
    }
}

fn cas_op(account: &UserAccount, update: Value) -> WriteOp {
    WriteOp::Update {
        collection: ACCOUNTS.to_string(),
        filter: json!({ "userId": account.user_id, "version": account.version }),
        update,
        upsert: false,
        require_match: true,
    }
}
