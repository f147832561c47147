//! Aggregated mixing progress.
//!
//! Subscribes to orchestrator [`MixEvent`]s and folds them into counters and
//! an overall percentage, resolving once mixing reports itself finished.

use tokio::sync::broadcast;

use crate::messages::{PoolMessage, PoolStatus};
use crate::orchestrator::MixEvent;
use crate::wallet::Wallet;

pub struct MixingProgress {
    rx: broadcast::Receiver<MixEvent>,
    completed_sessions: u32,
    timed_out_sessions: u32,
    last_percent: f64,
    result: Option<PoolMessage>,
}

impl MixingProgress {
    pub fn new(rx: broadcast::Receiver<MixEvent>) -> MixingProgress {
        MixingProgress {
            rx,
            completed_sessions: 0,
            timed_out_sessions: 0,
            last_percent: 0.0,
            result: None,
        }
    }

    /// Drain any pending events, updating counters against the wallet's
    /// current balances.
    pub fn poll(&mut self, wallet: &dyn Wallet) {
        loop {
            match self.rx.try_recv() {
                Ok(event) => self.handle(event, wallet),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    log::warn!("progress: lagged behind by {skipped} events");
                }
                Err(_) => break,
            }
        }
    }

    fn handle(&mut self, event: MixEvent, wallet: &dyn Wallet) {
        match event {
            MixEvent::SessionStarted { id, denomination } => {
                log::debug!("progress: session {id} started at {denomination}");
            }
            MixEvent::SessionComplete { message, .. } => {
                if message == PoolMessage::MsgSuccess {
                    self.completed_sessions += 1;
                    self.last_percent = percentage(wallet);
                } else {
                    self.timed_out_sessions += 1;
                }
            }
            MixEvent::MixingComplete { statuses } => {
                self.last_percent = 100.0;
                self.result = Some(if statuses.contains(&PoolStatus::Finished) {
                    PoolMessage::MsgSuccess
                } else {
                    PoolMessage::ErrSession
                });
            }
        }
    }

    pub fn completed_sessions(&self) -> u32 {
        self.completed_sessions
    }

    pub fn timed_out_sessions(&self) -> u32 {
        self.timed_out_sessions
    }

    /// Share of the denominated balance that has finished its rounds.
    pub fn progress(&self) -> f64 {
        self.last_percent
    }

    /// Set once mixing reports completion.
    pub fn result(&self) -> Option<PoolMessage> {
        self.result
    }

    pub fn is_finished(&self) -> bool {
        self.result.is_some()
    }
}

fn percentage(wallet: &dyn Wallet) -> f64 {
    let balance = wallet.balance();
    let denominated = balance.denominated();
    if denominated == 0 {
        return 0.0;
    }
    100.0 * balance.anonymized as f64 / denominated as f64
}
