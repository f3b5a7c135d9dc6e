use std::time::Duration;

use crate::message::Step;

/// Consensus timing parameters.
#[derive(Clone, Debug)]
pub struct Config {
    /// Propose step deadline at round 0.
    pub propose_timeout: Duration,
    /// Prevote step deadline at round 0.
    pub prevote_timeout: Duration,
    /// Precommit step deadline at round 0.
    pub precommit_timeout: Duration,
    /// Added to every step deadline per round, so later rounds wait longer.
    pub timeout_delta: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            propose_timeout: Duration::from_millis(3000),
            prevote_timeout: Duration::from_millis(3000),
            precommit_timeout: Duration::from_millis(3000),
            timeout_delta: Duration::from_millis(500),
        }
    }
}

impl Config {
    /// Deadline of the given step at the given round: `base + round * delta`.
    pub fn timeout(&self, step: Step, round: u64) -> Duration {
        let base = match step {
            Step::Propose => self.propose_timeout,
            Step::Prevote => self.prevote_timeout,
            Step::Precommit => self.precommit_timeout,
        };
        base + self
            .timeout_delta
            .saturating_mul(round.min(u32::MAX as u64) as u32)
    }
}
