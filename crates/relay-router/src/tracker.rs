//! In-flight message tracker.
//!
//! The single source of truth for "is this message in the pipeline".
//! Two indices - pipeline key (broker identity when present, application
//! identity otherwise) and application id - live under one lock so `track`
//! and `remove` are atomic and every operation is linearizable. A message
//! is admitted exactly once and removed exactly once, on ack or nack.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use relay_common::{AckCallback, MessagePointer};

/// One admitted message.
pub struct Tracked {
    pub pipeline_key: String,
    pub application_id: String,
    pub message: MessagePointer,
    pub callback: Arc<dyn AckCallback>,
    pub queue_identifier: String,
    pub tracked_at: Instant,
}

impl std::fmt::Debug for Tracked {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracked")
            .field("pipeline_key", &self.pipeline_key)
            .field("application_id", &self.application_id)
            .field("queue_identifier", &self.queue_identifier)
            .finish()
    }
}

#[derive(Debug)]
pub enum TrackOutcome {
    Tracked { pipeline_key: String },
    Duplicate { existing_pipeline_key: String },
}

#[derive(Default)]
struct Indices {
    by_pipeline_key: HashMap<String, Arc<Tracked>>,
    by_application_id: HashMap<String, String>,
}

#[derive(Default)]
pub struct InFlightTracker {
    inner: Mutex<Indices>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a message. Fails with `Duplicate` when either the pipeline key
    /// or the application id is already tracked.
    pub fn track(
        &self,
        message: MessagePointer,
        callback: Arc<dyn AckCallback>,
        queue_identifier: String,
    ) -> TrackOutcome {
        let pipeline_key = message.pipeline_key();
        let application_id = message.id.clone();

        let mut inner = self.inner.lock();

        if let Some(existing) = inner.by_pipeline_key.get(&pipeline_key) {
            return TrackOutcome::Duplicate {
                existing_pipeline_key: existing.pipeline_key.clone(),
            };
        }
        if let Some(existing_key) = inner.by_application_id.get(&application_id) {
            return TrackOutcome::Duplicate {
                existing_pipeline_key: existing_key.clone(),
            };
        }

        let entry = Arc::new(Tracked {
            pipeline_key: pipeline_key.clone(),
            application_id: application_id.clone(),
            message,
            callback,
            queue_identifier,
            tracked_at: Instant::now(),
        });

        inner.by_pipeline_key.insert(pipeline_key.clone(), entry);
        inner.by_application_id.insert(application_id, pipeline_key.clone());

        TrackOutcome::Tracked { pipeline_key }
    }

    /// Delete from both indices atomically; returns the prior record so the
    /// caller can dispatch its callback.
    pub fn remove(&self, pipeline_key: &str) -> Option<Arc<Tracked>> {
        let mut inner = self.inner.lock();
        let entry = inner.by_pipeline_key.remove(pipeline_key)?;
        inner.by_application_id.remove(&entry.application_id);
        Some(entry)
    }

    pub fn contains_key(&self, pipeline_key: &str) -> bool {
        self.inner.lock().by_pipeline_key.contains_key(pipeline_key)
    }

    pub fn is_in_flight(&self, application_id: &str) -> bool {
        self.inner
            .lock()
            .by_application_id
            .contains_key(application_id)
    }

    /// The pipeline key currently tracking this application id, if any.
    pub fn pipeline_key_for(&self, application_id: &str) -> Option<String> {
        self.inner
            .lock()
            .by_application_id
            .get(application_id)
            .cloned()
    }

    pub fn get(&self, pipeline_key: &str) -> Option<Arc<Tracked>> {
        self.inner.lock().by_pipeline_key.get(pipeline_key).cloned()
    }

    pub fn get_callback(&self, pipeline_key: &str) -> Option<Arc<dyn AckCallback>> {
        self.inner
            .lock()
            .by_pipeline_key
            .get(pipeline_key)
            .map(|entry| entry.callback.clone())
    }

    /// Drain every tracked entry. Shutdown path: the caller bulk-nacks the
    /// returned records.
    pub fn clear(&self) -> Vec<Arc<Tracked>> {
        let mut inner = self.inner.lock();
        inner.by_application_id.clear();
        inner.by_pipeline_key.drain().map(|(_, entry)| entry).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_pipeline_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_common::{BrokerAckError, MediationType};

    struct NoopCallback;

    #[async_trait]
    impl AckCallback for NoopCallback {
        async fn ack(&self) -> Result<(), BrokerAckError> {
            Ok(())
        }
        async fn nack(&self) -> Result<(), BrokerAckError> {
            Ok(())
        }
    }

    fn pointer(id: &str, broker_id: Option<&str>) -> MessagePointer {
        MessagePointer {
            id: id.to_string(),
            pool_code: "P".to_string(),
            auth_token: None,
            mediation_type: MediationType::HTTP,
            mediation_target: "http://localhost/hook".to_string(),
            message_group_id: None,
            high_priority: None,
            batch_id: None,
            broker_message_id: broker_id.map(|s| s.to_string()),
            code: None,
            subject: None,
            data: None,
        }
    }

    fn track(tracker: &InFlightTracker, id: &str, broker_id: Option<&str>) -> TrackOutcome {
        tracker.track(
            pointer(id, broker_id),
            Arc::new(NoopCallback),
            "q1".to_string(),
        )
    }

    #[test]
    fn tracks_under_broker_id_when_present() {
        let tracker = InFlightTracker::new();
        match track(&tracker, "app-1", Some("broker-1")) {
            TrackOutcome::Tracked { pipeline_key } => assert_eq!(pipeline_key, "broker-1"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(tracker.contains_key("broker-1"));
        assert!(tracker.is_in_flight("app-1"));
        assert_eq!(tracker.pipeline_key_for("app-1").as_deref(), Some("broker-1"));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn duplicate_pipeline_key_rejected() {
        let tracker = InFlightTracker::new();
        track(&tracker, "app-1", Some("broker-1"));

        match track(&tracker, "app-2", Some("broker-1")) {
            TrackOutcome::Duplicate { existing_pipeline_key } => {
                assert_eq!(existing_pipeline_key, "broker-1")
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(tracker.len(), 1);
        assert!(!tracker.is_in_flight("app-2"));
    }

    #[test]
    fn duplicate_application_id_rejected_across_broker_ids() {
        let tracker = InFlightTracker::new();
        track(&tracker, "app-1", Some("broker-1"));

        match track(&tracker, "app-1", Some("broker-2")) {
            TrackOutcome::Duplicate { existing_pipeline_key } => {
                assert_eq!(existing_pipeline_key, "broker-1")
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(!tracker.contains_key("broker-2"));
    }

    #[test]
    fn remove_deletes_both_indices() {
        let tracker = InFlightTracker::new();
        track(&tracker, "app-1", Some("broker-1"));

        let removed = tracker.remove("broker-1").expect("entry");
        assert_eq!(removed.application_id, "app-1");
        assert!(!tracker.contains_key("broker-1"));
        assert!(!tracker.is_in_flight("app-1"));
        assert!(tracker.remove("broker-1").is_none(), "second remove is a no-op");

        // The id can be re-admitted after removal.
        assert!(matches!(
            track(&tracker, "app-1", Some("broker-3")),
            TrackOutcome::Tracked { .. }
        ));
    }

    #[test]
    fn clear_drains_everything() {
        let tracker = InFlightTracker::new();
        track(&tracker, "app-1", Some("b1"));
        track(&tracker, "app-2", Some("b2"));
        track(&tracker, "app-3", None);

        let drained = tracker.clear();
        assert_eq!(drained.len(), 3);
        assert!(tracker.is_empty());
        assert!(!tracker.is_in_flight("app-1"));
    }

    #[test]
    fn concurrent_track_admits_once() {
        let tracker = Arc::new(InFlightTracker::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let tracker = tracker.clone();
            handles.push(std::thread::spawn(move || {
                matches!(
                    tracker.track(
                        pointer("app-1", Some("broker-1")),
                        Arc::new(NoopCallback),
                        "q1".to_string(),
                    ),
                    TrackOutcome::Tracked { .. }
                )
            }));
        }

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|tracked| *tracked)
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(tracker.len(), 1);
    }
}
