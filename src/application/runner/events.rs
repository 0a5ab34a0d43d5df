use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::error;

use crate::application::analyzer::AnalysisResult;
use crate::domain::market::regime::MarketRegime;
use crate::domain::trading::types::EntryEvent;

/// Notifications emitted by the background runner.
///
/// For a single handled task the order is: `RegimeChange` (if any),
/// `NewEntry` per fresh entry, then `Result` last, after runner state
/// has been updated.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    /// A completed analysis, shared as-is with every subscriber.
    Result(Arc<AnalysisResult>),
    /// An entry that was absent from the previous result. Only raised
    /// for incremental updates.
    NewEntry(EntryEvent),
    RegimeChange {
        from: MarketRegime,
        to: MarketRegime,
    },
    /// A task failed; the worker keeps running.
    Error(String),
}

/// Fan-out hub for runner events.
///
/// Each subscriber gets its own unbounded channel, so a slow consumer
/// buffers instead of blocking the worker. Dropped receivers are pruned
/// on the next publish.
pub struct EventHub {
    subscribers: Mutex<Vec<Sender<RunnerEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Receiver<RunnerEvent> {
        let (tx, rx) = unbounded();
        self.lock_subscribers().push(tx);
        rx
    }

    pub fn publish(&self, event: RunnerEvent) {
        let mut subscribers = self.lock_subscribers();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, Vec<Sender<RunnerEvent>>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("EventHub: Lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_every_subscriber() {
        let hub = EventHub::new();
        let rx1 = hub.subscribe();
        let rx2 = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        hub.publish(RunnerEvent::Error("boom".to_string()));

        for rx in [rx1, rx2] {
            match rx.try_recv().unwrap() {
                RunnerEvent::Error(message) => assert_eq!(message, "boom"),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let hub = EventHub::new();
        let rx1 = hub.subscribe();
        let rx2 = hub.subscribe();
        drop(rx1);

        hub.publish(RunnerEvent::Error("still here".to_string()));
        assert_eq!(hub.subscriber_count(), 1);
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_events_arrive_in_publish_order() {
        let hub = EventHub::new();
        let rx = hub.subscribe();

        hub.publish(RunnerEvent::RegimeChange {
            from: MarketRegime::Ranging,
            to: MarketRegime::TrendingUp,
        });
        hub.publish(RunnerEvent::Error("late".to_string()));

        assert!(matches!(
            rx.try_recv().unwrap(),
            RunnerEvent::RegimeChange { .. }
        ));
        assert!(matches!(rx.try_recv().unwrap(), RunnerEvent::Error(_)));
    }
}
