//! Shutdown bookkeeping: consumer registrations and in-flight jobs

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{QueueError, QueueResult};
use crate::job::JobId;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Registration {
    Pending,
    Active(String),
    Failed,
}

/// Resolves a `process` registration. Dropping it unresolved marks it failed.
pub(crate) struct RegistrationGuard {
    state: watch::Sender<Registration>,
}

impl RegistrationGuard {
    pub(crate) fn activate(self, consumer_tag: String) {
        self.state.send_replace(Registration::Active(consumer_tag));
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.state.send_if_modified(|state| {
            if *state == Registration::Pending {
                *state = Registration::Failed;
                true
            } else {
                false
            }
        });
    }
}

/// Marks a job in flight until dropped.
pub(crate) struct InFlightGuard {
    jobs: Arc<watch::Sender<HashMap<JobId, usize>>>,
    id: JobId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let id = self.id;
        self.jobs.send_modify(|jobs| {
            if let Some(count) = jobs.get_mut(&id) {
                *count -= 1;
                if *count == 0 {
                    jobs.remove(&id);
                }
            }
        });
    }
}

pub(crate) struct ShutdownCoordinator {
    registrations: Mutex<Registrations>,
    in_flight: Arc<watch::Sender<HashMap<JobId, usize>>>,
}

#[derive(Default)]
struct Registrations {
    shutting_down: bool,
    handles: Vec<watch::Receiver<Registration>>,
}

impl ShutdownCoordinator {
    pub(crate) fn new() -> Self {
        Self {
            registrations: Mutex::new(Registrations::default()),
            in_flight: Arc::new(watch::Sender::new(HashMap::new())),
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.registrations.lock().shutting_down
    }

    /// Record a pending `process` registration.
    pub(crate) fn register(&self) -> QueueResult<RegistrationGuard> {
        let mut registrations = self.registrations.lock();
        if registrations.shutting_down {
            return Err(QueueError::Shutdown(
                "cannot register a handler while shutting down".to_string(),
            ));
        }
        let (state, handle) = watch::channel(Registration::Pending);
        registrations.handles.push(handle);
        Ok(RegistrationGuard { state })
    }

    /// Flip into shutdown. Fails if a shutdown already started.
    pub(crate) fn begin(&self) -> QueueResult<()> {
        let mut registrations = self.registrations.lock();
        if registrations.shutting_down {
            return Err(QueueError::Shutdown("shutdown already in progress".to_string()));
        }
        registrations.shutting_down = true;
        Ok(())
    }

    /// Wait for every registration to resolve; returns the active consumer tags.
    pub(crate) async fn settled_consumers(&self) -> Vec<String> {
        let handles = self.registrations.lock().handles.clone();
        let mut tags = Vec::new();
        for mut handle in handles {
            let settled = handle
                .wait_for(|state| *state != Registration::Pending)
                .await
                .map(|state| state.clone());
            if let Ok(Registration::Active(tag)) = settled {
                tags.push(tag);
            }
        }
        tags
    }

    pub(crate) fn track(&self, id: JobId) -> InFlightGuard {
        self.in_flight.send_modify(|jobs| {
            *jobs.entry(id).or_insert(0) += 1;
        });
        InFlightGuard {
            jobs: self.in_flight.clone(),
            id,
        }
    }

    pub(crate) fn in_flight(&self) -> Vec<JobId> {
        self.in_flight.borrow().keys().copied().collect()
    }

    /// Resolve once no job is in flight.
    pub(crate) async fn drained(&self) {
        let mut jobs = self.in_flight.subscribe();
        let _ = jobs.wait_for(|jobs| jobs.is_empty()).await;
    }
}
