pub mod mock_endpoint;
pub mod mock_executor;
pub mod mock_sampler;

pub use mock_endpoint::ScriptedEndpoint;
pub use mock_executor::{FakeExecutor, ProcessBehavior};
pub use mock_sampler::CountingSampler;

use std::sync::{Arc, Mutex};

/// Shared, ordered record of collaborator calls
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Index of the first event starting with `prefix`
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.events().iter().position(|e| e.starts_with(prefix))
    }
}
