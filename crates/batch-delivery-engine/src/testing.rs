//! In-memory doubles for exercising an engine without a real transport.
//!
//! [`RecordingSink`] captures every delivery attempt with the (Tokio) instant
//! it was made, and can be scripted to fail. [`RecordingAcknowledger`]
//! hands out acknowledgers that append to a shared event log.

use crate::{Acknowledger, DeliveryError, DeliveryResult, Sink};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Instant;

/// How a [`RecordingSink`] answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkBehavior {
    /// Every call succeeds.
    Succeed,
    /// Every call fails.
    AlwaysFail,
    /// The first `n` calls fail, later calls succeed.
    FailFirst(usize),
}

/// One recorded sink call.
#[derive(Debug, Clone)]
pub struct SinkCall<P> {
    pub at: Instant,
    pub payload: P,
    pub succeeded: bool,
}

/// Sink that records every call it receives.
pub struct RecordingSink<P> {
    behavior: Mutex<SinkBehavior>,
    calls: Mutex<Vec<SinkCall<P>>>,
}

impl<P: Clone + Send + Sync> RecordingSink<P> {
    pub fn new(behavior: SinkBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(SinkBehavior::Succeed)
    }

    pub fn failing() -> Self {
        Self::new(SinkBehavior::AlwaysFail)
    }

    /// Change the behavior for subsequent calls.
    pub fn set_behavior(&self, behavior: SinkBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn calls(&self) -> Vec<SinkCall<P>> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Payloads in call order, including failed attempts.
    pub fn payloads(&self) -> Vec<P> {
        self.calls.lock().iter().map(|call| call.payload.clone()).collect()
    }

    /// Payloads of successful calls only.
    pub fn delivered(&self) -> Vec<P> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.succeeded)
            .map(|call| call.payload.clone())
            .collect()
    }
}

#[async_trait]
impl<P: Clone + Send + Sync> Sink<P> for RecordingSink<P> {
    async fn send(&self, payload: &P) -> DeliveryResult<()> {
        let mut calls = self.calls.lock();
        let succeeded = match *self.behavior.lock() {
            SinkBehavior::Succeed => true,
            SinkBehavior::AlwaysFail => false,
            SinkBehavior::FailFirst(n) => calls.len() >= n,
        };
        calls.push(SinkCall {
            at: Instant::now(),
            payload: payload.clone(),
            succeeded,
        });

        if succeeded {
            Ok(())
        } else {
            Err(DeliveryError::Sink("scripted failure".to_string()))
        }
    }
}

/// Acknowledgement recorded by a [`RecordingAcknowledger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckEvent {
    Confirmed(String),
    Rejected(String),
}

/// Shared log of acknowledgements across many origins.
#[derive(Debug, Clone, Default)]
pub struct RecordingAcknowledger {
    events: Arc<Mutex<Vec<AckEvent>>>,
}

impl RecordingAcknowledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acknowledger for one origin, recording into this log.
    pub fn handle_for(&self, origin: impl Into<String>) -> RecordedOrigin {
        RecordedOrigin {
            origin: origin.into(),
            events: self.events.clone(),
        }
    }

    pub fn events(&self) -> Vec<AckEvent> {
        self.events.lock().clone()
    }

    pub fn confirmed(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                AckEvent::Confirmed(origin) => Some(origin.clone()),
                AckEvent::Rejected(_) => None,
            })
            .collect()
    }

    pub fn rejected(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                AckEvent::Rejected(origin) => Some(origin.clone()),
                AckEvent::Confirmed(_) => None,
            })
            .collect()
    }
}

/// Acknowledger produced by [`RecordingAcknowledger::handle_for`].
#[derive(Debug, Clone)]
pub struct RecordedOrigin {
    origin: String,
    events: Arc<Mutex<Vec<AckEvent>>>,
}

#[async_trait]
impl Acknowledger for RecordedOrigin {
    async fn confirm(&self) -> DeliveryResult<()> {
        self.events.lock().push(AckEvent::Confirmed(self.origin.clone()));
        Ok(())
    }

    async fn reject(&self) -> DeliveryResult<()> {
        self.events.lock().push(AckEvent::Rejected(self.origin.clone()));
        Ok(())
    }
}
