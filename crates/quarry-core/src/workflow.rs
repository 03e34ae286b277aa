//! Ordered steps with compensations.
//!
//! A [`Workflow`] runs its steps in order against one owned state value.
//! When a step fails (or panics), every previously successful step that is
//! [`Step::reversible`] is undone in reverse order and the original error is
//! returned, wrapped in [`Error::Compensated`] if any undo failed too.
//!
//! Compensation runs on a spawned task: dropping the future returned by
//! [`Workflow::execute`] does not stop cleanup of what was already done.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tracing::{debug, warn};

use crate::error::{panic_message, Error};

#[async_trait]
pub trait Step<S: Send>: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, state: &mut S) -> Result<()>;

    /// Whether [`Step::undo`] should be called during compensation.
    fn reversible(&self) -> bool {
        false
    }

    async fn undo(&self, _state: &mut S) -> Result<()> {
        Ok(())
    }
}

pub struct Workflow<S> {
    name: String,
    steps: Vec<Arc<dyn Step<S>>>,
}

impl<S: Send + 'static> Workflow<S> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: impl Step<S> + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Runs every step and hands back the final state.
    pub async fn execute(&self, mut state: S) -> Result<S> {
        for (i, step) in self.steps.iter().enumerate() {
            debug!(workflow = %self.name, step = step.name(), "running step");
            let outcome = AssertUnwindSafe(step.run(&mut state))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(Error::Panic(panic_message(payload.as_ref())).into()));

            if let Err(cause) = outcome {
                warn!(
                    workflow = %self.name,
                    step = step.name(),
                    error = %format!("{:#}", cause),
                    "step failed, compensating"
                );
                let done = self.steps[..i].to_vec();
                let name = self.name.clone();
                let failures = match tokio::spawn(compensate(name, done, state)).await {
                    Ok(failures) => failures,
                    Err(e) => vec![anyhow!("compensation task aborted: {}", e)],
                };
                if failures.is_empty() {
                    return Err(cause);
                }
                return Err(Error::Compensated { cause, failures }.into());
            }
        }
        Ok(state)
    }
}

async fn compensate<S: Send>(
    workflow: String,
    done: Vec<Arc<dyn Step<S>>>,
    mut state: S,
) -> Vec<anyhow::Error> {
    let mut failures = Vec::new();
    for step in done.iter().rev().filter(|s| s.reversible()) {
        debug!(workflow = %workflow, step = step.name(), "undoing step");
        let outcome = AssertUnwindSafe(step.undo(&mut state))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(Error::Panic(panic_message(payload.as_ref())).into()));
        if let Err(e) = outcome {
            warn!(workflow = %workflow, step = step.name(), error = %format!("{:#}", e), "undo failed");
            failures.push(e.context(format!("undo '{}'", step.name())));
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    #[derive(Debug, Default)]
    struct Journal {
        entries: Vec<String>,
    }

    struct Record {
        name: &'static str,
        fail: bool,
        undo: Option<bool>,
    }

    impl Record {
        fn ok(name: &'static str) -> Self {
            Self {
                name,
                fail: false,
                undo: Some(true),
            }
        }
    }

    #[async_trait]
    impl Step<Journal> for Record {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self, state: &mut Journal) -> Result<()> {
            if self.fail {
                bail!("{} broke", self.name);
            }
            state.entries.push(format!("do {}", self.name));
            Ok(())
        }

        fn reversible(&self) -> bool {
            self.undo.is_some()
        }

        async fn undo(&self, state: &mut Journal) -> Result<()> {
            state.entries.push(format!("undo {}", self.name));
            match self.undo {
                Some(false) => bail!("{} cannot be undone", self.name),
                _ => Ok(()),
            }
        }
    }

    struct Spy(Arc<tokio::sync::Mutex<Vec<String>>>);

    #[async_trait]
    impl Step<Journal> for Spy {
        fn name(&self) -> &str {
            "spy"
        }

        async fn run(&self, _state: &mut Journal) -> Result<()> {
            Ok(())
        }

        fn reversible(&self) -> bool {
            true
        }

        async fn undo(&self, state: &mut Journal) -> Result<()> {
            *self.0.lock().await = state.entries.clone();
            Ok(())
        }
    }

    #[tokio::test]
    async fn runs_steps_in_order() {
        let wf = Workflow::new("ok")
            .step(Record::ok("a"))
            .step(Record::ok("b"));
        assert_eq!(wf.step_names(), vec!["a", "b"]);
        let journal = wf.execute(Journal::default()).await.unwrap();
        assert_eq!(journal.entries, vec!["do a", "do b"]);
    }

    #[tokio::test]
    async fn compensates_in_reverse_skipping_irreversible() {
        let seen = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let wf = Workflow::new("rollback")
            .step(Spy(seen.clone()))
            .step(Record::ok("a"))
            .step(Record {
                name: "b",
                fail: false,
                undo: None,
            })
            .step(Record::ok("c"))
            .step(Record {
                name: "d",
                fail: true,
                undo: Some(true),
            });
        let err = wf.execute(Journal::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "d broke");
        assert_eq!(
            *seen.lock().await,
            vec!["do a", "do b", "do c", "undo c", "undo a"]
        );
    }

    #[tokio::test]
    async fn undo_failures_are_aggregated_with_cause() {
        let wf = Workflow::new("broken-undo")
            .step(Record {
                name: "a",
                fail: false,
                undo: Some(false),
            })
            .step(Record {
                name: "b",
                fail: true,
                undo: None,
            });
        let err = wf.execute(Journal::default()).await.unwrap_err();
        match Error::kind_of(&err) {
            Some(Error::Compensated { cause, failures }) => {
                assert_eq!(cause.to_string(), "b broke");
                assert_eq!(failures.len(), 1);
                assert!(format!("{:#}", failures[0]).contains("a cannot be undone"));
            }
            other => panic!("unexpected error kind: {:?}", other),
        }
    }

    struct Explode;

    #[async_trait]
    impl Step<Journal> for Explode {
        fn name(&self) -> &str {
            "explode"
        }

        async fn run(&self, _state: &mut Journal) -> Result<()> {
            panic!("kaboom")
        }
    }

    #[tokio::test]
    async fn panicking_step_is_compensated() {
        let seen = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let wf = Workflow::new("panic")
            .step(Record::ok("a"))
            .step(Spy(seen.clone()))
            .step(Explode);
        let err = wf.execute(Journal::default()).await.unwrap_err();
        assert!(matches!(Error::kind_of(&err), Some(Error::Panic(m)) if m.contains("kaboom")));
        assert_eq!(*seen.lock().await, vec!["do a"]);
    }
}
