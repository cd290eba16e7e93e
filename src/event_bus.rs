//! Engine event broadcast.
//!
//! Every flow lifecycle transition and every `log_event`/`log_message`
//! action publishes a structured [`EngineEvent`]. The bus holds its own
//! receiver so publishing never depends on subscriber presence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::{EngineResult, EventError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EngineEventKind {
    FlowStarted,
    StepStarted,
    StepSkipped,
    StepCompleted,
    FlowCompleted,
    FlowPaused,
    FlowResumed,
    Message,
    Error,
    #[strum(to_string = "{0}")]
    Custom(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub kind: EngineEventKind,
    pub flow_id: String,
    pub step_id: Option<String>,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(
        kind: EngineEventKind,
        flow_id: impl Into<String>,
        step_id: Option<String>,
        data: Value,
    ) -> Self {
        Self {
            kind,
            flow_id: flow_id.into(),
            step_id,
            data,
            timestamp: Utc::now(),
        }
    }
}

pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
    _keepalive: broadcast::Receiver<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, keepalive) = broadcast::channel(capacity);
        Self {
            sender,
            _keepalive: keepalive,
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub async fn publish(&self, event: EngineEvent) -> EngineResult<()> {
        self.sender.send(event).map_err(|e| EventError::SendFailed {
            message: e.to_string(),
        })?;
        Ok(())
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<EngineEvent>,
}

impl EventReceiver {
    /// Receive the next event. On lag the receiver resubscribes at the
    /// current tail and reports how much was skipped.
    pub async fn recv(&mut self) -> EngineResult<EngineEvent> {
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(count)) => {
                self.receiver = self.receiver.resubscribe();
                Err(EventError::Lagged { count }.into())
            }
            Err(e) => Err(EventError::ReceiveFailed {
                message: e.to_string(),
            }
            .into()),
        }
    }

    /// Drain everything currently buffered without waiting.
    pub fn drain(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }
}
