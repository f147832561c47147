//! Client-side CoinJoin mixing engine.
//!
//! The engine mixes a wallet's coins by coordinating, over a peer-to-peer
//! network, with coordinator nodes that assemble multi-party transactions of
//! identically-denominated inputs and outputs. It owns the protocol state
//! machines, the output planners and the coordinator connection pool; the
//! wallet, the coordinator registry, chain sync and raw networking stay
//! behind traits the host implements ([`Wallet`], [`CoordinatorRegistry`],
//! [`ChainView`], [`Network`]).
//!
//! Entry points: build a [`MixManager`], register each wallet with its
//! [`ClientOptions`], feed incoming protocol messages into
//! [`MixManager::process_message`], and either start the built-in 1 Hz
//! maintenance thread or call [`MixManager::do_maintenance`] from your own
//! scheduler.

pub mod builder;
pub mod config;
pub mod denom;
pub(crate) mod error;
pub mod keys;
pub mod manager;
pub mod messages;
pub mod network;
pub mod orchestrator;
pub mod planner;
pub mod pool;
pub mod progress;
pub mod queue;
pub mod registry;
pub mod session;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tx;
pub mod wallet;
pub(crate) mod wire;

// ── Core types ──────────────────────────────────────────────────────
pub use builder::TransactionBuilder;
pub use config::ClientOptions;
pub use denom::{
    denomination_of, is_collateral_amount, is_denominated_amount, Amount, Denomination,
};
pub use error::{Error, Result};
pub use manager::MixManager;
pub use messages::{
    NetMessage, PoolMessage, PoolState, PoolStatus, PoolStatusUpdate, StatusMessage,
};
pub use network::Network;
pub use orchestrator::{MixEvent, Orchestrator};
pub use pool::CoordinatorPool;
pub use progress::MixingProgress;
pub use queue::QueueListener;
pub use registry::{ChainView, Coordinator, CoordinatorRegistry};
pub use session::MixSession;
pub use tx::{Outpoint, Script, Transaction, TxIn, TxOut, Txid};
pub use wallet::{Balance, InputCoin, ReservedKey, TallyItem, TxDsIn, Wallet};
