//! Client mixing options.

use serde::{Deserialize, Serialize};

use crate::denom::{Amount, COIN};

/// Tunables for the mixing client. One instance per wallet; the engine never
/// mutates these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientOptions {
    /// Master gate: when false, every public entry point is a no-op.
    pub enabled: bool,
    /// Target amount of anonymized balance, in duffs.
    pub amount: Amount,
    /// Required mixing rounds before a coin counts as anonymized.
    pub rounds: u32,
    /// Extra rounds randomly probed when preparing an entry.
    pub random_rounds: u32,
    /// Max concurrent sessions, which also caps coordinator connections.
    pub sessions: usize,
    /// Allow several sessions at once and tolerate unconfirmed denominations.
    pub multi_session: bool,
    /// Per-denomination soft target when creating denominations.
    pub denoms_goal: usize,
    /// Per-denomination hard ceiling (the largest denomination is exempt).
    pub denoms_hard_cap: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            enabled: true,
            amount: 1000 * COIN,
            rounds: 4,
            random_rounds: 3,
            sessions: 4,
            multi_session: false,
            denoms_goal: 50,
            denoms_hard_cap: 300,
        }
    }
}

impl ClientOptions {
    /// Number of sessions the orchestrator may run concurrently.
    pub fn session_limit(&self) -> usize {
        if self.multi_session {
            self.sessions.max(1)
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_session_mode_caps_at_one() {
        let mut options = ClientOptions::default();
        assert_eq!(options.session_limit(), 1);
        options.multi_session = true;
        assert_eq!(options.session_limit(), 4);
        options.sessions = 0;
        assert_eq!(options.session_limit(), 1);
    }

    #[test]
    fn options_serde_round_trip() {
        let options = ClientOptions::default();
        let json = serde_json::to_string(&options).unwrap();
        let back: ClientOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.amount, options.amount);
        assert_eq!(back.denoms_hard_cap, options.denoms_hard_cap);
    }
}
