//! Per-fingerprint request coalescing.
//!
//! At most one pipeline execution runs per fingerprint. The first caller
//! becomes the leader and executes; latecomers wait on a watch channel for
//! the leader's published result and re-read the cache. The leader always
//! publishes, success or error, so followers never re-run the expensive
//! work themselves.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::{api_types::Answer, error::ErrorBody};

/// What the leader publishes to its followers.
pub type FlightResult = Result<Answer, ErrorBody>;

/// Outcome of joining a flight for a fingerprint.
pub enum Flight {
    /// This caller executes the pipeline and must finish the guard.
    Leader(FlightGuard),
    /// Another execution is in progress; await its result.
    Follower(watch::Receiver<Option<FlightResult>>),
}

/// Leader's obligation to publish. Dropping the guard unfinished (e.g. on
/// deadline cancellation) wakes followers with a closed channel, which they
/// surface as an unavailable error.
pub struct FlightGuard {
    key: String,
    table: Arc<DashMap<String, watch::Receiver<Option<FlightResult>>>>,
    sender: watch::Sender<Option<FlightResult>>,
}

impl FlightGuard {
    /// Publish the result and release the flight slot.
    pub fn finish(self, result: FlightResult) {
        // Remove before sending so a caller arriving after the send starts
        // a fresh flight instead of reading a stale channel.
        self.table.remove(&self.key);
        let _ = self.sender.send(Some(result));
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.table.remove(&self.key);
    }
}

/// The coalescing table.
#[derive(Default)]
pub struct SingleFlight {
    table: Arc<DashMap<String, watch::Receiver<Option<FlightResult>>>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the flight for `fingerprint`: the first caller per key becomes
    /// the leader.
    pub fn join(&self, fingerprint: &str) -> Flight {
        match self.table.entry(fingerprint.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                Flight::Follower(entry.get().clone())
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let (sender, receiver) = watch::channel(None);
                entry.insert(receiver);
                Flight::Leader(FlightGuard {
                    key: fingerprint.to_string(),
                    table: self.table.clone(),
                    sender,
                })
            }
        }
    }

    /// Number of flights currently in progress.
    pub fn in_flight(&self) -> usize {
        self.table.len()
    }
}

/// Await the leader's published result. `None` means the leader was
/// cancelled before publishing.
pub async fn await_flight(
    mut receiver: watch::Receiver<Option<FlightResult>>,
) -> Option<FlightResult> {
    loop {
        if let Some(result) = receiver.borrow().clone() {
            return Some(result);
        }
        if receiver.changed().await.is_err() {
            // Leader dropped without publishing.
            return receiver.borrow().clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_types::{AnswerMetrics, CacheResult};

    fn answer(text: &str) -> Answer {
        Answer {
            text: text.to_string(),
            blocks: Vec::new(),
            citations: Vec::new(),
            metrics: AnswerMetrics {
                prompt_tokens: 1,
                completion_tokens: 1,
                sources_used: Vec::new(),
                cache_result: CacheResult::Miss,
                similarity: None,
                partial: false,
            },
        }
    }

    #[tokio::test]
    async fn first_caller_leads_latecomers_follow() {
        let flight = SingleFlight::new();
        let Flight::Leader(guard) = flight.join("fp") else {
            panic!("first caller must lead");
        };
        let Flight::Follower(receiver) = flight.join("fp") else {
            panic!("second caller must follow");
        };

        guard.finish(Ok(answer("shared")));
        let result = await_flight(receiver).await.unwrap().unwrap();
        assert_eq!(result.text, "shared");
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn distinct_fingerprints_do_not_coalesce() {
        let flight = SingleFlight::new();
        assert!(matches!(flight.join("a"), Flight::Leader(_)));
        assert!(matches!(flight.join("b"), Flight::Leader(_)));
    }

    #[tokio::test]
    async fn errors_are_shared_with_followers() {
        let flight = SingleFlight::new();
        let Flight::Leader(guard) = flight.join("fp") else {
            panic!()
        };
        let Flight::Follower(receiver) = flight.join("fp") else {
            panic!()
        };

        guard.finish(Err(ErrorBody {
            code: "unavailable".to_string(),
            message: "llm down".to_string(),
            retry_after_ms: None,
        }));
        let result = await_flight(receiver).await.unwrap();
        assert_eq!(result.unwrap_err().code, "unavailable");
    }

    #[tokio::test]
    async fn dropped_leader_wakes_followers_empty_handed() {
        let flight = SingleFlight::new();
        let Flight::Leader(guard) = flight.join("fp") else {
            panic!()
        };
        let Flight::Follower(receiver) = flight.join("fp") else {
            panic!()
        };

        drop(guard);
        assert!(await_flight(receiver).await.is_none());
        // The slot is free again.
        assert!(matches!(flight.join("fp"), Flight::Leader(_)));
    }

    #[tokio::test]
    async fn many_concurrent_joins_produce_exactly_one_leader() {
        let flight = Arc::new(SingleFlight::new());
        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let flight = flight.clone();
                tokio::spawn(async move {
                    matches!(flight.join("same"), Flight::Leader(_))
                })
            })
            .collect();

        let mut leaders = 0;
        for task in tasks {
            if task.await.unwrap() {
                leaders += 1;
            }
        }
        assert_eq!(leaders, 1);
    }
}
