//! Ordered cleanup steps that all run even when earlier ones fail
//!
//! Each step runs in order. A step that returns an error or panics is
//! logged and the chain carries on; the first failure is reported once
//! every step has had its turn.

use quarry_core::{QuarryError, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::error;

type Step<'a> = Box<dyn FnOnce() -> Result<()> + 'a>;

/// Cleanup sequence for a transaction that is being torn down
pub struct CleanupChain<'a> {
    label: String,
    steps: Vec<(&'static str, Step<'a>)>,
}

impl<'a> CleanupChain<'a> {
    /// Create an empty chain; `label` identifies it in logs
    pub fn new(label: impl Into<String>) -> Self {
        CleanupChain {
            label: label.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step
    pub fn step(mut self, name: &'static str, f: impl FnOnce() -> Result<()> + 'a) -> Self {
        self.steps.push((name, Box::new(f)));
        self
    }

    /// Run every step, returning the first failure
    pub fn run(self) -> Result<()> {
        let mut first = None;
        for (name, step) in self.steps {
            let failure = match catch_unwind(AssertUnwindSafe(step)) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(panic) => QuarryError::internal(format!(
                    "cleanup step panicked: {}",
                    panic_message(panic.as_ref())
                )),
            };
            error!(target: "quarry::txn", chain = %self.label, step = name, error = %failure, "Cleanup step failed");
            first.get_or_insert(failure);
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
