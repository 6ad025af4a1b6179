//! Recovery sweeper: periodically releases stuck claims.

use std::time::Duration;

use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::task::JoinHandle;

use crate::messages::SweeperMessage;
use crate::service::JobQueueService;

/// Sweeper actor arguments.
pub struct SweeperArgs {
    pub service: JobQueueService,
    pub interval: Duration,
    pub stuck_minutes: u64,
}

/// State for the sweeper actor.
pub struct SweeperState {
    service: JobQueueService,
    stuck_minutes: u64,
    ticker: JoinHandle<()>,
    /// Items released since the sweeper started.
    pub recovered_total: usize,
}

/// Actor that calls `recover_stuck_jobs` on every tick.
pub struct RecoverySweeper;

impl Actor for RecoverySweeper {
    type Msg = SweeperMessage;
    type State = SweeperState;
    type Arguments = SweeperArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            interval = ?args.interval,
            stuck_minutes = args.stuck_minutes,
            "Starting recovery sweeper"
        );

        // Start periodic tick
        let myself_clone = myself.clone();
        let interval = args.interval;
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if myself_clone.send_message(SweeperMessage::Tick).is_err() {
                    break;
                }
            }
        });

        Ok(SweeperState {
            service: args.service,
            stuck_minutes: args.stuck_minutes,
            ticker,
            recovered_total: 0,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SweeperMessage::Tick => {
                match state.service.recover_stuck_jobs(state.stuck_minutes).await {
                    Ok(0) => {}
                    Ok(recovered) => {
                        state.recovered_total += recovered;
                        tracing::info!(
                            recovered,
                            total = state.recovered_total,
                            "Sweep released stuck items"
                        );
                    }
                    Err(e) => tracing::warn!("Recovery sweep failed: {}", e),
                }
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.ticker.abort();
        tracing::info!("Recovery sweeper stopped");
        Ok(())
    }
}
