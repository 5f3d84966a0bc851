//! Single-writer engine service.
//!
//! One task owns the `Engine` and drains a command channel, so every
//! money-moving operation is serialized by construction: a concurrent
//! double-fill or double-liquidation cannot happen because there is exactly
//! one writer. Reads travel the same queue and observe a consistent state.
//! A periodic interval drives the full MTM sweep so dormant accounts are
//! re-checked even when their instruments stop ticking.

use crate::bus::{ConsumerError, TickConsumer};
use crate::engine::{Engine, EngineError, SweepReport};
use crate::mtm::MtmSnapshot;
use crate::order::{Order, OrderRequest};
use crate::position::Position;
use crate::tick::Tick;
use crate::types::{Cash, InstrumentToken, OrderId, Timestamp, UserId};
use crate::wallet::{Transaction, TransactionFilter, Wallet};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, warn};

const COMMAND_QUEUE_DEPTH: usize = 1024;

pub enum EngineCommand {
    PlaceOrder {
        user_id: UserId,
        request: OrderRequest,
        reply: oneshot::Sender<Result<Order, EngineError>>,
    },
    CancelOrder {
        user_id: UserId,
        order_id: OrderId,
        reply: oneshot::Sender<Result<Order, EngineError>>,
    },
    ClosePosition {
        user_id: UserId,
        instrument_token: InstrumentToken,
        quantity: Option<Decimal>,
        reply: oneshot::Sender<Result<Order, EngineError>>,
    },
    Deposit {
        user_id: UserId,
        amount: Cash,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Withdraw {
        user_id: UserId,
        amount: Cash,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Tick(Tick),
    Sweep {
        reply: oneshot::Sender<Result<SweepReport, EngineError>>,
    },
    GetWallet {
        user_id: UserId,
        reply: oneshot::Sender<Option<Wallet>>,
    },
    GetPositions {
        user_id: UserId,
        reply: oneshot::Sender<Vec<Position>>,
    },
    GetTransactions {
        user_id: UserId,
        filter: TransactionFilter,
        reply: oneshot::Sender<Vec<Transaction>>,
    },
    GetSnapshot {
        user_id: UserId,
        reply: oneshot::Sender<Option<MtmSnapshot>>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Engine service stopped")]
    Stopped,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Cloneable front end to the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub async fn place_order(
        &self,
        user_id: UserId,
        request: OrderRequest,
    ) -> Result<Order, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::PlaceOrder {
            user_id,
            request,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ServiceError::Stopped)?.map_err(Into::into)
    }

    pub async fn cancel_order(
        &self,
        user_id: UserId,
        order_id: OrderId,
    ) -> Result<Order, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::CancelOrder {
            user_id,
            order_id,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ServiceError::Stopped)?.map_err(Into::into)
    }

    pub async fn close_position(
        &self,
        user_id: UserId,
        instrument_token: InstrumentToken,
        quantity: Option<Decimal>,
    ) -> Result<Order, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::ClosePosition {
            user_id,
            instrument_token,
            quantity,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ServiceError::Stopped)?.map_err(Into::into)
    }

    pub async fn deposit(&self, user_id: UserId, amount: Cash) -> Result<(), ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Deposit {
            user_id,
            amount,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ServiceError::Stopped)?.map_err(Into::into)
    }

    pub async fn withdraw(&self, user_id: UserId, amount: Cash) -> Result<(), ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Withdraw {
            user_id,
            amount,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ServiceError::Stopped)?.map_err(Into::into)
    }

    pub async fn tick(&self, tick: Tick) -> Result<(), ServiceError> {
        self.send(EngineCommand::Tick(tick)).await
    }

    pub async fn sweep(&self) -> Result<SweepReport, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Sweep { reply }).await?;
        rx.await.map_err(|_| ServiceError::Stopped)?.map_err(Into::into)
    }

    pub async fn get_wallet(&self, user_id: UserId) -> Result<Option<Wallet>, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::GetWallet { user_id, reply }).await?;
        rx.await.map_err(|_| ServiceError::Stopped)
    }

    pub async fn get_positions(&self, user_id: UserId) -> Result<Vec<Position>, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::GetPositions { user_id, reply })
            .await?;
        rx.await.map_err(|_| ServiceError::Stopped)
    }

    pub async fn get_transactions(
        &self,
        user_id: UserId,
        filter: TransactionFilter,
    ) -> Result<Vec<Transaction>, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::GetTransactions {
            user_id,
            filter,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ServiceError::Stopped)
    }

    pub async fn get_snapshot(
        &self,
        user_id: UserId,
    ) -> Result<Option<MtmSnapshot>, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::GetSnapshot { user_id, reply })
            .await?;
        rx.await.map_err(|_| ServiceError::Stopped)
    }

    /// Bridge for the tick bus. Non-blocking: if the queue is full the tick
    /// is dropped with an error the bus logs, never backpressure into the
    /// fan-out.
    pub fn tick_consumer(&self) -> EngineTickTap {
        EngineTickTap {
            tx: self.tx.clone(),
        }
    }

    async fn send(&self, command: EngineCommand) -> Result<(), ServiceError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| ServiceError::Stopped)
    }
}

pub struct EngineTickTap {
    tx: mpsc::Sender<EngineCommand>,
}

impl TickConsumer for EngineTickTap {
    fn name(&self) -> &str {
        "engine"
    }

    fn on_tick(&self, tick: &Tick) -> Result<(), ConsumerError> {
        self.tx
            .try_send(EngineCommand::Tick(tick.clone()))
            .map_err(|err| -> ConsumerError { format!("engine queue: {err}").into() })
    }
}

/// Spawn the single-writer loop. The returned handle is the only way in.
pub fn spawn_engine(mut engine: Engine) -> (EngineHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let sweep_every = engine_sweep_interval(&engine);

    let task = tokio::spawn(async move {
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first interval tick is immediate; swallow it
        sweep.tick().await;

        loop {
            tokio::select! {
                command = rx.recv() => {
                    match command {
                        Some(command) => handle_command(&mut engine, command),
                        None => break,
                    }
                }
                _ = sweep.tick() => {
                    touch_clock(&mut engine);
                    if let Err(err) = engine.sweep() {
                        error!(%err, "mtm sweep failed");
                    }
                }
            }
        }
    });

    (EngineHandle { tx }, task)
}

fn engine_sweep_interval(engine: &Engine) -> std::time::Duration {
    engine.sweep_interval()
}

fn touch_clock(engine: &mut Engine) {
    let now = engine.time().later_of(Timestamp::now());
    engine.set_time(now);
}

fn handle_command(engine: &mut Engine, command: EngineCommand) {
    match command {
        EngineCommand::PlaceOrder {
            user_id,
            request,
            reply,
        } => {
            touch_clock(engine);
            let _ = reply.send(engine.place_order(user_id, request));
        }
        EngineCommand::CancelOrder {
            user_id,
            order_id,
            reply,
        } => {
            touch_clock(engine);
            let _ = reply.send(engine.cancel_order(user_id, order_id));
        }
        EngineCommand::ClosePosition {
            user_id,
            instrument_token,
            quantity,
            reply,
        } => {
            touch_clock(engine);
            let _ = reply.send(engine.close_position(user_id, instrument_token, quantity));
        }
        EngineCommand::Deposit {
            user_id,
            amount,
            reply,
        } => {
            touch_clock(engine);
            let _ = reply.send(engine.deposit(user_id, amount));
        }
        EngineCommand::Withdraw {
            user_id,
            amount,
            reply,
        } => {
            touch_clock(engine);
            let _ = reply.send(engine.withdraw(user_id, amount));
        }
        EngineCommand::Tick(tick) => {
            if let Err(err) = engine.on_tick(tick) {
                // feed problems degrade, they never kill the writer
                warn!(%err, "tick cycle failed");
            }
        }
        EngineCommand::Sweep { reply } => {
            touch_clock(engine);
            let _ = reply.send(engine.sweep());
        }
        EngineCommand::GetWallet { user_id, reply } => {
            let _ = reply.send(engine.get_wallet(user_id));
        }
        EngineCommand::GetPositions { user_id, reply } => {
            let _ = reply.send(engine.get_positions(user_id));
        }
        EngineCommand::GetTransactions {
            user_id,
            filter,
            reply,
        } => {
            let _ = reply.send(engine.get_transactions(user_id, &filter));
        }
        EngineCommand::GetSnapshot { user_id, reply } => {
            let _ = reply.send(engine.snapshot_for(user_id));
        }
    }
}
