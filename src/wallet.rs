//! Wallet ledger: append-only transaction log plus the balance projection.
//!
//! Every balance mutation is a transaction row carrying before/after
//! snapshots of both balances; the row log is the source of truth and the
//! cached wallet is a projection rebuildable by replay. Invariants are
//! enforced at this boundary and violations reject the whole row: amounts
//! are never clamped and failed postings are never retried.
//!
//! `balance` is the total held; `blocked_balance` is the slice reserved
//! against open orders and positions. Free funds = balance - blocked.

use crate::types::{Cash, Timestamp, TxnId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountState {
    Normal,
    Liquidating,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub user_id: UserId,
    pub balance: Cash,
    pub blocked_balance: Cash,
    pub account_state: AccountState,
}

impl Wallet {
    fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            balance: Cash::zero(),
            blocked_balance: Cash::zero(),
            account_state: AccountState::Normal,
        }
    }

    pub fn free(&self) -> Cash {
        self.balance.sub(self.blocked_balance)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnType {
    Credit,
    Debit,
    Block,
    Unblock,
    Settlement,
}

/// What a transaction row points back at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceType {
    Deposit,
    Withdrawal,
    Order,
    Fill,
    Liquidation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxnId,
    pub user_id: UserId,
    pub txn_type: TxnType,
    pub amount: Cash,
    pub balance_before: Cash,
    pub balance_after: Cash,
    pub blocked_before: Cash,
    pub blocked_after: Cash,
    pub reference_type: ReferenceType,
    pub reference_id: u64,
    pub created_at: Timestamp,
}

/// A settlement consumes a block and posts the realized effect of an
/// execution in one row: release the order/position reservation, take on the
/// new reservation, move balance by the realized amount.
#[derive(Debug, Clone, Copy)]
pub struct SettlementSpec {
    pub release: Cash,
    pub reblock: Cash,
    pub balance_delta: Cash,
}

#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub txn_type: Option<TxnType>,
    pub reference_type: Option<ReferenceType>,
    pub since: Option<Timestamp>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Transaction amount must be positive")]
    AmountNotPositive,

    #[error("No wallet for user {0:?}")]
    WalletNotFound(UserId),

    #[error("Insufficient free balance: requested {requested}, free {available}")]
    InsufficientFree { requested: Cash, available: Cash },

    #[error("Unblock exceeds blocked balance: requested {requested}, blocked {blocked}")]
    OverUnblock { requested: Cash, blocked: Cash },

    #[error("Settlement release exceeds blocked balance: requested {requested}, blocked {blocked}")]
    OverRelease { requested: Cash, blocked: Cash },

    #[error("Settlement would drive balance negative: balance {balance}, delta {delta}")]
    BalanceWouldGoNegative { balance: Cash, delta: Cash },

    #[error("Settlement would leave blocked {blocked} above balance {balance}")]
    BlockedWouldExceedBalance { blocked: Cash, balance: Cash },

    #[error("Ledger replay mismatch at transaction {0:?}")]
    ReplayMismatch(TxnId),
}

/// In-memory projection of every user's wallet plus the per-user row log.
#[derive(Debug, Default)]
pub struct WalletLedger {
    wallets: HashMap<UserId, Wallet>,
    rows: HashMap<UserId, Vec<Transaction>>,
    next_txn_id: u64,
}

impl WalletLedger {
    pub fn new() -> Self {
        Self {
            wallets: HashMap::new(),
            rows: HashMap::new(),
            next_txn_id: 1,
        }
    }

    pub fn wallet(&self, user_id: UserId) -> Option<&Wallet> {
        self.wallets.get(&user_id)
    }

    pub fn wallets(&self) -> impl Iterator<Item = &Wallet> {
        self.wallets.values()
    }

    pub fn set_account_state(&mut self, user_id: UserId, state: AccountState) {
        if let Some(wallet) = self.wallets.get_mut(&user_id) {
            wallet.account_state = state;
        }
    }

    /// Credit creates the wallet on first use (deposits open accounts).
    pub fn credit(
        &mut self,
        user_id: UserId,
        amount: Cash,
        reference_type: ReferenceType,
        reference_id: u64,
        now: Timestamp,
    ) -> Result<TxnId, LedgerError> {
        if !amount.is_positive() {
            return Err(LedgerError::AmountNotPositive);
        }
        let wallet = self
            .wallets
            .entry(user_id)
            .or_insert_with(|| Wallet::new(user_id));
        let (balance_before, blocked_before) = (wallet.balance, wallet.blocked_balance);
        wallet.balance = wallet.balance.add(amount);

        Ok(self.push_row(
            user_id,
            TxnType::Credit,
            amount,
            balance_before,
            blocked_before,
            reference_type,
            reference_id,
            now,
        ))
    }

    /// Debit takes from free funds only; over-debiting is rejected outright.
    pub fn debit(
        &mut self,
        user_id: UserId,
        amount: Cash,
        reference_type: ReferenceType,
        reference_id: u64,
        now: Timestamp,
    ) -> Result<TxnId, LedgerError> {
        if !amount.is_positive() {
            return Err(LedgerError::AmountNotPositive);
        }
        let wallet = self
            .wallets
            .get_mut(&user_id)
            .ok_or(LedgerError::WalletNotFound(user_id))?;

        let free = wallet.balance.sub(wallet.blocked_balance);
        if amount > free {
            return Err(LedgerError::InsufficientFree {
                requested: amount,
                available: free,
            });
        }

        let (balance_before, blocked_before) = (wallet.balance, wallet.blocked_balance);
        wallet.balance = wallet.balance.sub(amount);

        Ok(self.push_row(
            user_id,
            TxnType::Debit,
            amount,
            balance_before,
            blocked_before,
            reference_type,
            reference_id,
            now,
        ))
    }

    /// Move funds from free to blocked. Over-blocking is rejected.
    pub fn block(
        &mut self,
        user_id: UserId,
        amount: Cash,
        reference_type: ReferenceType,
        reference_id: u64,
        now: Timestamp,
    ) -> Result<TxnId, LedgerError> {
        if !amount.is_positive() {
            return Err(LedgerError::AmountNotPositive);
        }
        let wallet = self
            .wallets
            .get_mut(&user_id)
            .ok_or(LedgerError::WalletNotFound(user_id))?;

        let free = wallet.balance.sub(wallet.blocked_balance);
        if amount > free {
            return Err(LedgerError::InsufficientFree {
                requested: amount,
                available: free,
            });
        }

        let (balance_before, blocked_before) = (wallet.balance, wallet.blocked_balance);
        wallet.blocked_balance = wallet.blocked_balance.add(amount);

        Ok(self.push_row(
            user_id,
            TxnType::Block,
            amount,
            balance_before,
            blocked_before,
            reference_type,
            reference_id,
            now,
        ))
    }

    /// Reverse a block (cancel/reject paths).
    pub fn unblock(
        &mut self,
        user_id: UserId,
        amount: Cash,
        reference_type: ReferenceType,
        reference_id: u64,
        now: Timestamp,
    ) -> Result<TxnId, LedgerError> {
        if !amount.is_positive() {
            return Err(LedgerError::AmountNotPositive);
        }
        let wallet = self
            .wallets
            .get_mut(&user_id)
            .ok_or(LedgerError::WalletNotFound(user_id))?;

        if amount > wallet.blocked_balance {
            return Err(LedgerError::OverUnblock {
                requested: amount,
                blocked: wallet.blocked_balance,
            });
        }

        let (balance_before, blocked_before) = (wallet.balance, wallet.blocked_balance);
        wallet.blocked_balance = wallet.blocked_balance.sub(amount);

        Ok(self.push_row(
            user_id,
            TxnType::Unblock,
            amount,
            balance_before,
            blocked_before,
            reference_type,
            reference_id,
            now,
        ))
    }

    /// Post an execution's realized effect. The whole row is validated before
    /// any field moves; a violation leaves no partial posting.
    pub fn settle(
        &mut self,
        user_id: UserId,
        spec: SettlementSpec,
        reference_type: ReferenceType,
        reference_id: u64,
        now: Timestamp,
    ) -> Result<TxnId, LedgerError> {
        if spec.release.is_negative() || spec.reblock.is_negative() {
            return Err(LedgerError::AmountNotPositive);
        }
        let wallet = self
            .wallets
            .get_mut(&user_id)
            .ok_or(LedgerError::WalletNotFound(user_id))?;

        if spec.release > wallet.blocked_balance {
            return Err(LedgerError::OverRelease {
                requested: spec.release,
                blocked: wallet.blocked_balance,
            });
        }

        let new_balance = wallet.balance.add(spec.balance_delta);
        let new_blocked = wallet
            .blocked_balance
            .sub(spec.release)
            .add(spec.reblock);

        if new_balance.is_negative() {
            return Err(LedgerError::BalanceWouldGoNegative {
                balance: wallet.balance,
                delta: spec.balance_delta,
            });
        }
        if new_blocked > new_balance {
            return Err(LedgerError::BlockedWouldExceedBalance {
                blocked: new_blocked,
                balance: new_balance,
            });
        }

        // headline amount: the realized move, else the reservation shift
        let amount = if !spec.balance_delta.is_zero() {
            spec.balance_delta.abs()
        } else if spec.release.is_positive() {
            spec.release
        } else {
            spec.reblock
        };
        if !amount.is_positive() {
            return Err(LedgerError::AmountNotPositive);
        }

        let (balance_before, blocked_before) = (wallet.balance, wallet.blocked_balance);
        wallet.balance = new_balance;
        wallet.blocked_balance = new_blocked;

        Ok(self.push_row(
            user_id,
            TxnType::Settlement,
            amount,
            balance_before,
            blocked_before,
            reference_type,
            reference_id,
            now,
        ))
    }

    pub fn transactions(&self, user_id: UserId, filter: &TransactionFilter) -> Vec<Transaction> {
        let Some(rows) = self.rows.get(&user_id) else {
            return Vec::new();
        };
        let iter = rows.iter().filter(|t| {
            filter.txn_type.map_or(true, |ty| t.txn_type == ty)
                && filter
                    .reference_type
                    .map_or(true, |rt| t.reference_type == rt)
                && filter.since.map_or(true, |s| t.created_at >= s)
        });
        match filter.limit {
            Some(limit) => iter.cloned().take(limit).collect(),
            None => iter.cloned().collect(),
        }
    }

    pub fn has_settlement_for(&self, user_id: UserId, reference_id: u64) -> bool {
        self.rows.get(&user_id).map_or(false, |rows| {
            rows.iter().any(|t| {
                t.txn_type == TxnType::Settlement && t.reference_id == reference_id
            })
        })
    }

    /// Rebuild a wallet by replaying its rows in creation order, verifying
    /// that each row's before-snapshot chains onto the running state. Used
    /// for recovery and audit when the cached projection is suspect.
    pub fn recalculate_from_ledger(&self, user_id: UserId) -> Result<Wallet, LedgerError> {
        let rows = self
            .rows
            .get(&user_id)
            .ok_or(LedgerError::WalletNotFound(user_id))?;

        let mut balance = Cash::zero();
        let mut blocked = Cash::zero();

        for row in rows {
            if row.balance_before != balance || row.blocked_before != blocked {
                return Err(LedgerError::ReplayMismatch(row.id));
            }
            match row.txn_type {
                TxnType::Credit => balance = balance.add(row.amount),
                TxnType::Debit => balance = balance.sub(row.amount),
                TxnType::Block => blocked = blocked.add(row.amount),
                TxnType::Unblock => blocked = blocked.sub(row.amount),
                // settlement moves both balances; the snapshots carry the split
                TxnType::Settlement => {
                    balance = row.balance_after;
                    blocked = row.blocked_after;
                }
            }
            if row.balance_after != balance || row.blocked_after != blocked {
                return Err(LedgerError::ReplayMismatch(row.id));
            }
        }

        let state = self
            .wallets
            .get(&user_id)
            .map(|w| w.account_state)
            .unwrap_or(AccountState::Normal);

        Ok(Wallet {
            user_id,
            balance,
            blocked_balance: blocked,
            account_state: state,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn push_row(
        &mut self,
        user_id: UserId,
        txn_type: TxnType,
        amount: Cash,
        balance_before: Cash,
        blocked_before: Cash,
        reference_type: ReferenceType,
        reference_id: u64,
        now: Timestamp,
    ) -> TxnId {
        let wallet = &self.wallets[&user_id];
        let id = TxnId(self.next_txn_id);
        self.next_txn_id += 1;

        self.rows.entry(user_id).or_default().push(Transaction {
            id,
            user_id,
            txn_type,
            amount,
            balance_before,
            balance_after: wallet.balance,
            blocked_before,
            blocked_after: wallet.blocked_balance,
            reference_type,
            reference_id,
            created_at: now,
        });
        id
    }
}
