use crate::issue::Issue;
use serde::{Deserialize, Serialize};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// A notification about a change in the session.
///
/// Events are emitted by the controller and by jobs (possibly in worker
/// processes, which forward them as JSON lines).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    LoadUpdated {
        load: usize,
    },
    FuzzJobAdded {
        job_id: u64,
        cost: usize,
        sut: String,
        fuzzer: String,
        batch: Option<u64>,
    },
    ReduceJobAdded {
        job_id: u64,
        cost: usize,
        sut: String,
        fuzzer: String,
        issue_id: String,
        size: usize,
    },
    UpdateJobAdded {
        job_id: u64,
        cost: usize,
        sut: String,
    },
    ValidateJobAdded {
        job_id: u64,
        cost: usize,
        sut: String,
        fuzzer: String,
        issue_id: String,
    },
    JobActivated {
        job_id: u64,
    },
    JobProgressed {
        job_id: u64,
        progress: u64,
    },
    JobRemoved {
        job_id: u64,
    },
    IssueAdded {
        job_id: u64,
        issue: Issue,
    },
    IssueUpdated {
        job_id: u64,
        issue: Issue,
    },
    IssueInvalidated {
        job_id: u64,
        issue: Issue,
    },
    IssueReduced {
        job_id: u64,
        issue: Issue,
    },
    StatsUpdated,
    Warning {
        job_id: Option<u64>,
        message: String,
    },
}

/// Anything events can be sent to: the listener manager in the controller,
/// or the IPC channel of a worker.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Collects events in memory; used by embedders and tests.
#[derive(Default, Clone)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl EventSink for EventLog {
    fn emit(&self, event: Event) {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).push(event);
    }
}

/// A subscriber to session events.
///
/// Every method defaults to doing nothing, so a listener only implements the
/// notifications it cares about. Errors are reported to the
/// [`ListenerManager`], which logs them and keeps the session going.
pub trait Listener: Send {
    fn on_load_updated(&mut self, _load: usize) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_fuzz_job_added(&mut self, _job_id: u64, _cost: usize, _sut: &str, _fuzzer: &str, _batch: Option<u64>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_reduce_job_added(
        &mut self,
        _job_id: u64,
        _cost: usize,
        _sut: &str,
        _fuzzer: &str,
        _issue_id: &str,
        _size: usize,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_update_job_added(&mut self, _job_id: u64, _cost: usize, _sut: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_validate_job_added(&mut self, _job_id: u64, _cost: usize, _sut: &str, _fuzzer: &str, _issue_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_job_activated(&mut self, _job_id: u64) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_job_progressed(&mut self, _job_id: u64, _progress: u64) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_job_removed(&mut self, _job_id: u64) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_issue_added(&mut self, _job_id: u64, _issue: &Issue) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_issue_updated(&mut self, _job_id: u64, _issue: &Issue) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_issue_invalidated(&mut self, _job_id: u64, _issue: &Issue) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_issue_reduced(&mut self, _job_id: u64, _issue: &Issue) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_stats_updated(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn warning(&mut self, _job_id: Option<u64>, _message: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Routes one event to the matching listener method.
pub fn dispatch(listener: &mut dyn Listener, event: &Event) -> anyhow::Result<()> {
    match event {
        Event::LoadUpdated { load } => listener.on_load_updated(*load),
        Event::FuzzJobAdded {
            job_id,
            cost,
            sut,
            fuzzer,
            batch,
        } => listener.on_fuzz_job_added(*job_id, *cost, sut, fuzzer, *batch),
        Event::ReduceJobAdded {
            job_id,
            cost,
            sut,
            fuzzer,
            issue_id,
            size,
        } => listener.on_reduce_job_added(*job_id, *cost, sut, fuzzer, issue_id, *size),
        Event::UpdateJobAdded { job_id, cost, sut } => listener.on_update_job_added(*job_id, *cost, sut),
        Event::ValidateJobAdded {
            job_id,
            cost,
            sut,
            fuzzer,
            issue_id,
        } => listener.on_validate_job_added(*job_id, *cost, sut, fuzzer, issue_id),
        Event::JobActivated { job_id } => listener.on_job_activated(*job_id),
        Event::JobProgressed { job_id, progress } => listener.on_job_progressed(*job_id, *progress),
        Event::JobRemoved { job_id } => listener.on_job_removed(*job_id),
        Event::IssueAdded { job_id, issue } => listener.on_issue_added(*job_id, issue),
        Event::IssueUpdated { job_id, issue } => listener.on_issue_updated(*job_id, issue),
        Event::IssueInvalidated { job_id, issue } => listener.on_issue_invalidated(*job_id, issue),
        Event::IssueReduced { job_id, issue } => listener.on_issue_reduced(*job_id, issue),
        Event::StatsUpdated => listener.on_stats_updated(),
        Event::Warning { job_id, message } => listener.warning(*job_id, message),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic type".to_string()
    }
}

/// Fans every event out to an ordered list of listeners.
///
/// A listener that fails or panics is logged and skipped for that event; the
/// remaining listeners still receive it.
#[derive(Default)]
pub struct ListenerManager {
    listeners: Mutex<Vec<Box<dyn Listener>>>,
}

impl ListenerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Box<dyn Listener>) {
        self.listeners.lock().unwrap_or_else(|p| p.into_inner()).push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for ListenerManager {
    fn emit(&self, event: Event) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
        for (index, listener) in listeners.iter_mut().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| dispatch(listener.as_mut(), &event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(listener = index, error = %e, "listener failed"),
                Err(payload) => warn!(
                    listener = index,
                    panic = %panic_message(payload.as_ref()),
                    "listener panicked"
                ),
            }
        }
    }
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn emit(&self, event: Event) {
        (**self).emit(event)
    }
}

fn summary(issue: &Issue) -> String {
    format!(
        "{} ({}/{})",
        issue.id().unwrap_or_default(),
        issue.sut().unwrap_or_default(),
        issue.fuzzer().unwrap_or_default()
    )
}

/// Renders session events as log lines.
#[derive(Default)]
pub struct LogListener;

impl Listener for LogListener {
    fn on_load_updated(&mut self, load: usize) -> anyhow::Result<()> {
        info!(load, "load updated");
        Ok(())
    }

    fn on_fuzz_job_added(&mut self, job_id: u64, cost: usize, sut: &str, fuzzer: &str, batch: Option<u64>) -> anyhow::Result<()> {
        info!(job_id, cost, sut, fuzzer, batch = ?batch, "fuzz job added");
        Ok(())
    }

    fn on_reduce_job_added(
        &mut self,
        job_id: u64,
        cost: usize,
        sut: &str,
        fuzzer: &str,
        issue_id: &str,
        size: usize,
    ) -> anyhow::Result<()> {
        info!(job_id, cost, sut, fuzzer, issue_id, size, "reduce job added");
        Ok(())
    }

    fn on_update_job_added(&mut self, job_id: u64, cost: usize, sut: &str) -> anyhow::Result<()> {
        info!(job_id, cost, sut, "update job added");
        Ok(())
    }

    fn on_validate_job_added(&mut self, job_id: u64, cost: usize, sut: &str, fuzzer: &str, issue_id: &str) -> anyhow::Result<()> {
        info!(job_id, cost, sut, fuzzer, issue_id, "validate job added");
        Ok(())
    }

    fn on_job_activated(&mut self, job_id: u64) -> anyhow::Result<()> {
        info!(job_id, "job activated");
        Ok(())
    }

    fn on_job_removed(&mut self, job_id: u64) -> anyhow::Result<()> {
        info!(job_id, "job removed");
        Ok(())
    }

    fn on_issue_added(&mut self, job_id: u64, issue: &Issue) -> anyhow::Result<()> {
        info!(job_id, "new issue: {}", summary(issue));
        Ok(())
    }

    fn on_issue_updated(&mut self, job_id: u64, issue: &Issue) -> anyhow::Result<()> {
        info!(job_id, "issue seen again: {}", summary(issue));
        Ok(())
    }

    fn on_issue_invalidated(&mut self, job_id: u64, issue: &Issue) -> anyhow::Result<()> {
        info!(job_id, "issue invalidated: {}", summary(issue));
        Ok(())
    }

    fn on_issue_reduced(&mut self, job_id: u64, issue: &Issue) -> anyhow::Result<()> {
        info!(job_id, "issue reduced: {}", summary(issue));
        Ok(())
    }

    fn warning(&mut self, job_id: Option<u64>, message: &str) -> anyhow::Result<()> {
        warn!(job_id = ?job_id, "{message}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl Listener for Counter {
        fn on_job_removed(&mut self, job_id: u64) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(format!("removed {job_id}"));
            Ok(())
        }

        fn on_issue_added(&mut self, _job_id: u64, issue: &Issue) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(format!("added {}", issue.id().unwrap()));
            Ok(())
        }
    }

    struct Failing;

    impl Listener for Failing {
        fn on_job_removed(&mut self, _job_id: u64) -> anyhow::Result<()> {
            anyhow::bail!("subscriber is broken")
        }
    }

    struct Panicking;

    impl Listener for Panicking {
        fn on_job_removed(&mut self, _job_id: u64) -> anyhow::Result<()> {
            panic!("Boom!");
        }
    }

    #[test]
    fn test_bad_listeners_do_not_break_the_fan_out() {
        let manager = ListenerManager::new();
        let counter = Counter::default();
        let seen = counter.seen.clone();
        manager.add(Box::new(Failing));
        manager.add(Box::new(Panicking));
        manager.add(Box::new(counter));

        manager.emit(Event::JobRemoved { job_id: 3 });
        manager.emit(Event::IssueAdded {
            job_id: 3,
            issue: Issue::new().with("id", "x"),
        });
        manager.emit(Event::StatsUpdated);

        assert_eq!(*seen.lock().unwrap(), vec!["removed 3", "added x"]);
        assert_eq!(manager.len(), 3);
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_string(&Event::JobProgressed {
            job_id: 1,
            progress: 10,
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"job_progressed","job_id":1,"progress":10}"#);
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Event::JobProgressed { job_id: 1, progress: 10 });
    }

    #[test]
    fn test_event_log_records_in_order() {
        let log = EventLog::new();
        log.emit(Event::LoadUpdated { load: 1 });
        log.emit(Event::StatsUpdated);
        assert_eq!(log.events(), vec![Event::LoadUpdated { load: 1 }, Event::StatsUpdated]);
    }
}
