use tokio::sync::broadcast;

use crate::storage::ExecutionStatus;

/// Progress events published while an execution runs. Consumers (CLI
/// progress output, tests) subscribe through [`EventBus::subscribe`];
/// a lagging or absent consumer never blocks the crawl.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    ExecutionStarted {
        execution_id: String,
        workflow_id: String,
    },
    PhaseStarted {
        execution_id: String,
        phase_id: String,
    },
    PhaseCompleted {
        execution_id: String,
        phase_id: String,
        tasks_processed: u64,
    },
    TaskCompleted {
        execution_id: String,
        task_id: String,
        url: String,
        items: usize,
    },
    TaskFailed {
        execution_id: String,
        task_id: String,
        url: String,
        error: String,
    },
    IncidentOpened {
        execution_id: String,
        incident_id: String,
    },
    StopRequested {
        execution_id: String,
    },
    ExecutionFinished {
        execution_id: String,
        status: ExecutionStatus,
    },
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    /// Best-effort publish; an error just means nobody is listening.
    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(ExecutionEvent::StopRequested { execution_id: "e".into() });
    }

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(ExecutionEvent::ExecutionStarted {
            execution_id: "e".into(),
            workflow_id: "w".into(),
        });
        bus.emit(ExecutionEvent::PhaseStarted {
            execution_id: "e".into(),
            phase_id: "p1".into(),
        });

        assert!(matches!(rx.recv().await.unwrap(), ExecutionEvent::ExecutionStarted { .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            ExecutionEvent::PhaseStarted { phase_id, .. } if phase_id == "p1"
        ));
    }
}
