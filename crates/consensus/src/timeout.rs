use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::CoreEvent;
use crate::message::Step;

/// Posted into the engine loop when a step deadline expires. The loop drops
/// events whose `(height, round)` it has already moved past.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutEvent {
    pub height: u64,
    pub round: u64,
    pub step: Step,
}

/// One step's deadline, running as an independent task that posts back into
/// the engine loop. Scheduling replaces any pending deadline for the step.
#[derive(Debug, Default)]
pub(crate) struct StepTimeout {
    handle: Option<JoinHandle<()>>,
}

impl StepTimeout {
    pub fn schedule(
        &mut self,
        event_tx: mpsc::UnboundedSender<CoreEvent>,
        delay: Duration,
        event: TimeoutEvent,
    ) {
        self.cancel();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = event_tx.send(CoreEvent::Timeout(event));
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Whether a deadline was armed since the last cancel. Used to avoid
    /// rearming on every message once the trigger condition holds.
    pub fn scheduled(&self) -> bool {
        self.handle.is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use crate::core::CoreEvent;
    use crate::message::Step;

    use super::{StepTimeout, TimeoutEvent};

    fn event(round: u64) -> TimeoutEvent {
        TimeoutEvent {
            height: 1,
            round,
            step: Step::Propose,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timeout = StepTimeout::default();

        timeout.schedule(tx, Duration::from_millis(100), event(0));
        assert!(timeout.scheduled());

        tokio::time::sleep(Duration::from_millis(150)).await;
        match rx.recv().await.unwrap() {
            CoreEvent::Timeout(fired) => assert_eq!(fired, event(0)),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_the_deadline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timeout = StepTimeout::default();

        timeout.schedule(tx.clone(), Duration::from_millis(100), event(0));
        timeout.schedule(tx, Duration::from_millis(200), event(1));

        tokio::time::sleep(Duration::from_millis(500)).await;
        match rx.recv().await.unwrap() {
            CoreEvent::Timeout(fired) => assert_eq!(fired, event(1)),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timeout = StepTimeout::default();

        timeout.schedule(tx, Duration::from_millis(100), event(0));
        timeout.cancel();
        assert!(!timeout.scheduled());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
    }
}
