//! Round countdown timer.
//!
//! The engine holds a [`CountdownHandle`] and resets it whenever the round
//! advances. The timer task fires the callback each time a full period passes
//! without a reset, then re-arms with the same period.

use crate::types::Round;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerCommand {
    Reset { round: Round, period: Duration },
    Stop,
}

/// Non-blocking control side of the timer; safe to use without a runtime.
#[derive(Clone, Debug)]
pub struct CountdownHandle {
    sender: mpsc::UnboundedSender<TimerCommand>,
}

impl CountdownHandle {
    pub fn reset(&self, round: Round, period: Duration) {
        if self
            .sender
            .send(TimerCommand::Reset { round, period })
            .is_err()
        {
            log::debug!("Countdown timer not running, reset for round {} dropped", round);
        }
    }

    pub fn stop(&self) {
        let _ = self.sender.send(TimerCommand::Stop);
    }
}

pub fn channel() -> (CountdownHandle, mpsc::UnboundedReceiver<TimerCommand>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (CountdownHandle { sender }, receiver)
}

pub type OnTimeout = Arc<dyn Fn(Round) + Send + Sync>;

pub struct CountdownTimer {
    receiver: mpsc::UnboundedReceiver<TimerCommand>,
    on_timeout: OnTimeout,
    round: Round,
    period: Duration,
}

impl CountdownTimer {
    /// The timer stays idle until the first `Reset`.
    pub fn new(receiver: mpsc::UnboundedReceiver<TimerCommand>, on_timeout: OnTimeout) -> Self {
        Self {
            receiver,
            on_timeout,
            round: 0,
            period: Duration::ZERO,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        let mut deadline: Option<Instant> = None;
        loop {
            tokio::select! {
                command = self.receiver.recv() => match command {
                    Some(TimerCommand::Reset { round, period }) => {
                        log::debug!("Countdown reset: round {}, period {:?}", round, period);
                        self.round = round;
                        self.period = period;
                        deadline = Some(Instant::now() + period);
                    }
                    Some(TimerCommand::Stop) | None => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    log::info!("Countdown expired for round {}", self.round);
                    let on_timeout = self.on_timeout.clone();
                    let round = self.round;
                    // The callback takes the engine lock and verifies signatures.
                    if let Err(e) = tokio::task::spawn_blocking(move || on_timeout(round)).await {
                        log::error!("Countdown callback panicked: {:?}", e);
                    }
                    deadline = Some(Instant::now() + self.period);
                }
            }
        }
        log::debug!("Countdown timer stopped");
    }
}
