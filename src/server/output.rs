//! Output sinks
//!
//! Diagnostic text from servers (stderr, `window/logMessage`, lifecycle
//! notes) goes to an output sink. Sinks are shared by label, so every session
//! with the same mode and workspace name writes to the same one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::server::config::TransportMode;

/// Append-only text destination
pub trait OutputSink: Send + Sync {
    fn label(&self) -> &str;

    fn append_line(&self, line: &str);
}

/// Re-emits lines as tracing events tagged with the sink label
#[derive(Debug, Clone)]
pub struct TracingOutputSink {
    label: String,
}

impl TracingOutputSink {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl OutputSink for TracingOutputSink {
    fn label(&self) -> &str {
        &self.label
    }

    fn append_line(&self, line: &str) {
        tracing::info!(target: "server_output", sink = %self.label, "{}", line);
    }
}

/// Creates the sink for a label the first time it is requested
pub type SinkFactory = Arc<dyn Fn(&str) -> Arc<dyn OutputSink> + Send + Sync>;

/// Label of the sink used by sessions of `mode` for `workspace_name`
pub fn sink_label(mode: TransportMode, workspace_name: &str) -> String {
    format!("{} ({})", workspace_name, mode)
}

/// Label-keyed cache of sinks
pub struct OutputSinks {
    factory: SinkFactory,
    sinks: Mutex<HashMap<String, Arc<dyn OutputSink>>>,
}

impl OutputSinks {
    pub fn new(factory: SinkFactory) -> Self {
        Self {
            factory,
            sinks: Mutex::new(HashMap::new()),
        }
    }

    pub fn tracing() -> Self {
        Self::new(Arc::new(|label: &str| -> Arc<dyn OutputSink> {
            Arc::new(TracingOutputSink::new(label))
        }))
    }

    pub fn get_or_create(&self, label: &str) -> Arc<dyn OutputSink> {
        let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            sinks
                .entry(label.to_string())
                .or_insert_with(|| (self.factory)(label)),
        )
    }

    pub fn len(&self) -> usize {
        self.sinks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for OutputSinks {
    fn default() -> Self {
        Self::tracing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testing::CollectingOutputSink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_sinks_are_reused_by_label() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let sinks = OutputSinks::new(Arc::new(move |label: &str| -> Arc<dyn OutputSink> {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(CollectingOutputSink::new(label))
        }));

        let first = sinks.get_or_create(&sink_label(TransportMode::Stdio, "app"));
        let again = sinks.get_or_create(&sink_label(TransportMode::Stdio, "app"));
        let other = sinks.get_or_create(&sink_label(TransportMode::Socket, "app"));

        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(sinks.len(), 2);
    }

    #[test]
    fn test_label_names_workspace_and_mode() {
        assert_eq!(sink_label(TransportMode::Pipe, "app"), "app (pipe)");
    }
}
