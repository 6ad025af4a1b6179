//! Message types for actor communication.

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Try to claim and process one item, then schedule the next poll.
    Poll,
}

/// Messages for the RecoverySweeper.
#[derive(Debug)]
pub enum SweeperMessage {
    /// Periodic tick: release stuck claims.
    Tick,
}
