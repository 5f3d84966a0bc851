//! Write-ahead journal for fill intents.
//!
//! A fill touches the order, a position, and the wallet ledger, and those
//! entities do not share one atomic storage primitive. The intent is
//! journaled before any effect is applied and marked committed after the
//! last one, so a crash in between leaves a pending record the recovery
//! pass can finish or discard instead of a half-applied fill.

use crate::types::{InstrumentToken, OrderId, Price, Side, Timestamp, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IntentId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentState {
    Pending,
    Committed,
}

/// The decision to fill, recorded before its effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillIntent {
    pub id: IntentId,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub instrument_token: InstrumentToken,
    pub side: Side,
    pub quantity: Decimal,
    pub execution_price: Price,
    pub engine_initiated: bool,
    pub created_at: Timestamp,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum JournalRecord {
    Intent(FillIntent),
    Committed { id: IntentId },
}

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("Journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Journal encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub trait JournalStore: Send {
    fn append_intent(&mut self, intent: &FillIntent) -> Result<(), WalError>;
    fn mark_committed(&mut self, id: IntentId) -> Result<(), WalError>;
    /// All intents ever journaled, in append order, with their final state.
    fn load(&self) -> Result<Vec<(FillIntent, IntentState)>, WalError>;
}

/// In-memory journal for tests and simulations.
#[derive(Debug, Default)]
pub struct MemJournal {
    intents: Vec<FillIntent>,
    committed: HashMap<IntentId, ()>,
}

impl MemJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JournalStore for MemJournal {
    fn append_intent(&mut self, intent: &FillIntent) -> Result<(), WalError> {
        self.intents.push(intent.clone());
        Ok(())
    }

    fn mark_committed(&mut self, id: IntentId) -> Result<(), WalError> {
        self.committed.insert(id, ());
        Ok(())
    }

    fn load(&self) -> Result<Vec<(FillIntent, IntentState)>, WalError> {
        Ok(self
            .intents
            .iter()
            .map(|intent| {
                let state = if self.committed.contains_key(&intent.id) {
                    IntentState::Committed
                } else {
                    IntentState::Pending
                };
                (intent.clone(), state)
            })
            .collect())
    }
}

/// Append-only JSON-lines journal, fsynced per record.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    file: File,
}

impl FileJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    fn append(&mut self, record: &JournalRecord) -> Result<(), WalError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.sync_data()?;
        Ok(())
    }
}

impl JournalStore for FileJournal {
    fn append_intent(&mut self, intent: &FillIntent) -> Result<(), WalError> {
        self.append(&JournalRecord::Intent(intent.clone()))
    }

    fn mark_committed(&mut self, id: IntentId) -> Result<(), WalError> {
        self.append(&JournalRecord::Committed { id })
    }

    fn load(&self) -> Result<Vec<(FillIntent, IntentState)>, WalError> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut order: Vec<IntentId> = Vec::new();
        let mut intents: HashMap<IntentId, FillIntent> = HashMap::new();
        let mut committed: HashMap<IntentId, ()> = HashMap::new();

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            // a torn final line from a crash mid-write is expected; stop there
            let record: JournalRecord = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(_) => break,
            };
            match record {
                JournalRecord::Intent(intent) => {
                    order.push(intent.id);
                    intents.insert(intent.id, intent);
                }
                JournalRecord::Committed { id } => {
                    committed.insert(id, ());
                }
            }
        }

        Ok(order
            .into_iter()
            .filter_map(|id| intents.remove(&id).map(|intent| {
                let state = if committed.contains_key(&id) {
                    IntentState::Committed
                } else {
                    IntentState::Pending
                };
                (intent, state)
            }))
            .collect())
    }
}
