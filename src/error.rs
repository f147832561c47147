use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("mixing is disabled by configuration")]
    Disabled,

    #[error("no inputs found for grouping")]
    NoInputs,

    #[error("could not match any denomination")]
    NoCompatibleDenomination,

    #[error("transaction builder refused output of {0} duffs")]
    OutputRefused(u64),

    #[error("transaction has no outputs to commit")]
    EmptyPlan,

    #[error("planned transaction would only create a collateral output")]
    CollateralOnlyPlan,

    #[error("planned remainder {0} duffs is not dust")]
    RemainderNotDust(u64),

    #[error("could not locate an acceptable collateral input")]
    NoCollateralInputs,

    #[error("tally item skipped: {0}")]
    TallySkipped(&'static str),

    #[error("planning failed: {0}")]
    PlanFailed(&'static str),

    #[error("key reservation failed: key pool exhausted")]
    KeyPoolExhausted,

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("wire decode error: {0}")]
    Decode(String),

    #[error("queue rejected: {0}")]
    QueueRejected(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
