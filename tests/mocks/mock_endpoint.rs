use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use drover_harness::{HarnessError, OperationEndpoint, OperationStatus, Result};

/// One scripted answer to a status poll
#[derive(Debug, Clone)]
enum StatusReply {
    Status(Option<OperationStatus>),
    Transient,
}

/// Operation endpoint playing back scripted `readyMillis` values and status
/// replies; the last entry of each script repeats forever.
pub struct ScriptedEndpoint {
    ready: Mutex<VecDeque<i64>>,
    replies: Mutex<VecDeque<StatusReply>>,
    reject_trigger: Option<String>,
    triggers: AtomicUsize,
    polls: AtomicUsize,
}

impl ScriptedEndpoint {
    /// Baseline `readyMillis` before the trigger and the value after it
    pub fn new(before: i64, after: i64) -> Self {
        Self {
            ready: Mutex::new(VecDeque::from([before, after])),
            replies: Mutex::new(VecDeque::new()),
            reject_trigger: None,
            triggers: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
        }
    }

    pub fn then_status(self, status: OperationStatus) -> Self {
        self.replies
            .lock()
            .unwrap()
            .push_back(StatusReply::Status(Some(status)));
        self
    }

    pub fn then_nothing(self) -> Self {
        self.replies.lock().unwrap().push_back(StatusReply::Status(None));
        self
    }

    pub fn then_transient(self, times: usize) -> Self {
        {
            let mut replies = self.replies.lock().unwrap();
            for _ in 0..times {
                replies.push_back(StatusReply::Transient);
            }
        }
        self
    }

    pub fn rejecting(mut self, reason: impl Into<String>) -> Self {
        self.reject_trigger = Some(reason.into());
        self
    }

    pub fn triggers(&self) -> usize {
        self.triggers.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

fn next<T: Clone>(queue: &Mutex<VecDeque<T>>) -> Option<T> {
    let mut queue = queue.lock().unwrap();
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

#[async_trait]
impl OperationEndpoint for ScriptedEndpoint {
    fn name(&self) -> String {
        "scripted".to_string()
    }

    async fn ready_millis(&self) -> Result<i64> {
        Ok(next(&self.ready).unwrap_or(0))
    }

    async fn trigger(&self) -> Result<()> {
        self.triggers.fetch_add(1, Ordering::SeqCst);
        match &self.reject_trigger {
            Some(reason) => Err(HarnessError::trigger(reason.clone())),
            None => Ok(()),
        }
    }

    async fn status(&self) -> Result<Option<OperationStatus>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        match next(&self.replies) {
            Some(StatusReply::Status(status)) => Ok(status),
            Some(StatusReply::Transient) => Err(HarnessError::transient("connection reset")),
            None => Ok(None),
        }
    }
}
