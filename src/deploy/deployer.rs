//! Store-driven scheduling of reconciliations.

use super::{AppReconciler, DeploymentRecord, Result, RunState, SchedulerSlot, TaskScheduler};
use crate::runtime::RuntimeTarget;
use crate::store::{DeploymentEvent, DeploymentListener, DeploymentStore, ImageLedger, ListenerId};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, mpsc};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Observed state of one deployed application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppStatus {
    /// Application name
    pub name: String,
    /// Desired run state of the record
    pub desired: RunState,
    /// Whether the record belongs to another runtime session
    pub stale: bool,
    /// Display name and run state of every container of the application
    pub containers: Vec<(String, RunState)>,
}

struct Inner {
    target: Arc<RuntimeTarget>,
    store: DeploymentStore,
    ledger: Arc<ImageLedger>,
    apps: DashMap<String, Arc<AppReconciler>>,
    slot: SchedulerSlot,
    queued: AtomicUsize,
    dispatched: Notify,
}

impl Inner {
    fn reconciler(&self, name: &str) -> Arc<AppReconciler> {
        self.apps
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(self.new_reconciler(name)))
            .clone()
    }

    fn new_reconciler(&self, name: &str) -> AppReconciler {
        AppReconciler::new(
            name,
            self.target.clone(),
            self.store.clone(),
            self.ledger.clone(),
        )
    }

    fn dispatch(&self, scheduler: &dyn TaskScheduler, event: DeploymentEvent) {
        let name = event.name().to_string();
        match event {
            DeploymentEvent::Added(_) | DeploymentEvent::Updated { .. } => {
                let app = self.reconciler(&name);
                scheduler.schedule(
                    &name,
                    &format!("Synchronize {}", name),
                    Box::pin(async move {
                        // Events queue up; only the record current at run time is reconciled.
                        match app.record() {
                            Some(record) => app.synchronize(&record).await,
                            None => {
                                debug!("{} was removed before synchronizing", app.name());
                                Ok(())
                            }
                        }
                    }),
                );
            }
            DeploymentEvent::Removed(_) => {
                let app = match self.apps.remove(&name) {
                    Some((_, app)) => app,
                    None => Arc::new(self.new_reconciler(&name)),
                };
                scheduler.schedule(
                    &name,
                    &format!("Destroy {}", name),
                    Box::pin(async move {
                        app.destroy().await;
                        Ok(())
                    }),
                );
            }
        }
    }

    fn done(&self) {
        if self.queued.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.dispatched.notify_waiters();
        }
    }

    async fn wait_dispatched(&self) {
        loop {
            let notified = self.dispatched.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.queued.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Turns deployment store events into scheduled reconciliations.
///
/// Every `Added`/`Updated` event schedules [`AppReconciler::synchronize`]
/// keyed by application name. The job reads the record from the store when
/// it runs, so a superseded intent is never built; a `Removed` event
/// schedules [`AppReconciler::destroy`]. The deployer starts unbound: events
/// are queued in order until a scheduler is supplied with [`Deployer::bind`].
///
/// ## Usage
///
/// ```rust,no_run
/// use dockyard::deploy::{Deployer, DeploymentRecord, KeyedScheduler, RunState};
/// use dockyard::runtime::{InMemoryRuntime, RuntimeTarget};
/// use dockyard::store::{DeploymentStore, ImageLedger, StoreConfig};
/// use std::sync::Arc;
///
/// # async fn example() {
/// let target = Arc::new(RuntimeTarget::builder(Arc::new(InMemoryRuntime::new())).build());
/// let store = DeploymentStore::load(target.props().clone(), &StoreConfig::default());
/// let ledger = Arc::new(ImageLedger::new(target.props().clone()));
///
/// let deployer = Deployer::new(target.clone(), store.clone(), ledger);
/// deployer.bind(Arc::new(KeyedScheduler::new()));
///
/// store.create_or_update(DeploymentRecord::new("demo", RunState::Running, target.session_id()));
/// deployer.settle().await;
/// # }
/// ```
pub struct Deployer {
    inner: Arc<Inner>,
    listener: ListenerId,
    dispatcher: AbortHandle,
}

impl Deployer {
    /// Subscribe to `store`. Must be called within a tokio runtime.
    ///
    /// The store replays every current record as `Added`, so existing
    /// deployments are reconciled as soon as a scheduler is bound.
    pub fn new(target: Arc<RuntimeTarget>, store: DeploymentStore, ledger: Arc<ImageLedger>) -> Self {
        let inner = Arc::new(Inner {
            target,
            store: store.clone(),
            ledger,
            apps: DashMap::new(),
            slot: SchedulerSlot::new(),
            queued: AtomicUsize::new(0),
            dispatched: Notify::new(),
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<DeploymentEvent>();
        let task_inner = inner.clone();
        let dispatcher = tokio::spawn(async move {
            let Some(scheduler) = task_inner.slot.wait().await else {
                warn!("Deployer dropped before a scheduler was bound");
                return;
            };
            debug!("Deployer bound, dispatching events");
            while let Some(event) = rx.recv().await {
                task_inner.dispatch(scheduler.as_ref(), event);
                task_inner.done();
            }
        })
        .abort_handle();

        let counter = inner.clone();
        let listener: DeploymentListener = Arc::new(move |event: &DeploymentEvent| {
            counter.queued.fetch_add(1, Ordering::SeqCst);
            if tx.send(event.clone()).is_err() {
                counter.done();
                anyhow::bail!("deployer is no longer dispatching");
            }
            Ok(())
        });
        let listener = store.add_listener(listener);

        Self {
            inner,
            listener,
            dispatcher,
        }
    }

    /// Supply the scheduler. Returns `false` if one was already bound.
    pub fn bind(&self, scheduler: Arc<dyn TaskScheduler>) -> bool {
        let bound = self.inner.slot.bind(scheduler);
        if bound {
            info!("Deployer scheduler bound");
        }
        bound
    }

    /// Wait until every event received so far has been reconciled.
    ///
    /// Returns immediately while no scheduler is bound.
    pub async fn settle(&self) {
        let Some(scheduler) = self.inner.slot.get() else {
            return;
        };
        loop {
            self.inner.wait_dispatched().await;
            scheduler.drained().await;
            if self.inner.queued.load(Ordering::SeqCst) == 0 {
                return;
            }
        }
    }

    /// Reconciler of `name`, created on first use.
    pub fn reconciler(&self, name: &str) -> Arc<AppReconciler> {
        self.inner.reconciler(name)
    }

    /// The store this deployer follows.
    pub fn store(&self) -> &DeploymentStore {
        &self.inner.store
    }

    /// The runtime target reconciliations run against.
    pub fn target(&self) -> &Arc<RuntimeTarget> {
        &self.inner.target
    }

    /// Observed state of every deployed application.
    ///
    /// # Errors
    ///
    /// Returns error if the runtime cannot list containers.
    pub async fn status(&self) -> Result<Vec<AppStatus>> {
        let session = self.inner.target.session_id();
        let mut statuses = Vec::new();
        for DeploymentRecord {
            name,
            desired_run_state,
            session_id,
            ..
        } in self.inner.store.records()
        {
            let containers = self
                .reconciler(&name)
                .fetch_containers()
                .await?
                .iter()
                .map(|container| (container.display_name(), container.run_state()))
                .collect();
            statuses.push(AppStatus {
                stale: session_id != session,
                name,
                desired: desired_run_state,
                containers,
            });
        }
        Ok(statuses)
    }
}

impl Drop for Deployer {
    fn drop(&mut self) {
        self.inner.store.remove_listener(self.listener);
        self.dispatcher.abort();
        for app in self.inner.apps.iter() {
            app.close_logs();
        }
    }
}
