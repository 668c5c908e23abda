//! Engine tunables, frozen at construction time.

/// Platform settings consulted by the settlement engine.
///
/// The confirmation window is deliberately configurable rather than a
/// constant; deployments tier it by trust score.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Platform fee in basis points of a card's face value.
    pub fee_bps: u64,
    /// Length of the post-release confirmation window, in minutes.
    pub confirmation_window_mins: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fee_bps: 500,
            confirmation_window_mins: 45,
        }
    }
}
