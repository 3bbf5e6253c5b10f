use std::sync::Mutex;

use serde_json::json;

use crate::events::{payload, EventWriter};

/// The job record the surrounding processing layer owns. The pipeline only
/// needs the progress hooks; terminal transitions belong to the glue that
/// invoked it.
pub trait JobSink: Send + Sync {
    fn mark_processing(&self);
    fn update_progress(&self, percent: u8, message: &str);
    fn mark_complete(&self);
    fn mark_failed(&self, message: &str);
}

/// Sink that mirrors job transitions onto the event stream. Emission is
/// best effort; a full disk must not take the pipeline down with it.
pub struct EventJobSink {
    events: EventWriter,
}

impl EventJobSink {
    pub fn new(events: EventWriter) -> Self {
        Self { events }
    }
}

impl JobSink for EventJobSink {
    fn mark_processing(&self) {
        let _ = self.events.emit("job_processing", Default::default());
    }

    fn update_progress(&self, percent: u8, message: &str) {
        let _ = self.events.emit(
            "job_progress",
            payload(json!({ "percent": percent, "message": message })),
        );
    }

    fn mark_complete(&self) {
        let _ = self.events.emit("job_complete", Default::default());
    }

    fn mark_failed(&self, message: &str) {
        let _ = self.events.emit("job_failed", payload(json!({ "message": message })));
    }
}

/// Sink that swallows every transition.
pub struct NullJobSink;

impl JobSink for NullJobSink {
    fn mark_processing(&self) {}
    fn update_progress(&self, _percent: u8, _message: &str) {}
    fn mark_complete(&self) {}
    fn mark_failed(&self, _message: &str) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobTransition {
    Processing,
    Progress(u8, String),
    Complete,
    Failed(String),
}

/// In-memory sink recording every transition in order, for tests.
#[derive(Default)]
pub struct RecordingJobSink {
    transitions: Mutex<Vec<JobTransition>>,
}

impl RecordingJobSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transitions(&self) -> Vec<JobTransition> {
        self.transitions
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn record(&self, transition: JobTransition) {
        if let Ok(mut guard) = self.transitions.lock() {
            guard.push(transition);
        }
    }
}

impl JobSink for RecordingJobSink {
    fn mark_processing(&self) {
        self.record(JobTransition::Processing);
    }

    fn update_progress(&self, percent: u8, message: &str) {
        self.record(JobTransition::Progress(percent, message.to_string()));
    }

    fn mark_complete(&self) {
        self.record(JobTransition::Complete);
    }

    fn mark_failed(&self, message: &str) {
        self.record(JobTransition::Failed(message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    #[test]
    fn event_sink_mirrors_transitions_onto_stream() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let sink = EventJobSink::new(EventWriter::new(&path, "job-7"));

        sink.mark_processing();
        sink.update_progress(30, "installing screens");
        sink.mark_complete();

        let raw = std::fs::read_to_string(&path)?;
        let types: Vec<String> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect();
        assert_eq!(types, vec!["job_processing", "job_progress", "job_complete"]);
        Ok(())
    }

    #[test]
    fn recording_sink_keeps_transition_order() {
        let sink = RecordingJobSink::new();
        sink.mark_processing();
        sink.update_progress(10, "warming up");
        sink.mark_failed("model unreachable");

        assert_eq!(
            sink.transitions(),
            vec![
                JobTransition::Processing,
                JobTransition::Progress(10, "warming up".to_string()),
                JobTransition::Failed("model unreachable".to_string()),
            ]
        );
    }
}
