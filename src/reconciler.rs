//! Current-user reconciliation
//!
//! Every source of identity information (the stored seed, the initial
//! `get_session` check, provider push events, demo sign-in and sign-out)
//! becomes an [`Envelope`] on one queue. A single worker task drains the
//! queue and is the only code that touches the canonical state, the store
//! and the subscriber list.
//!
//! Envelopes carry a sequence number issued when they are enqueued. A remote
//! call that was started earlier also records the last sequence number that
//! existed when it started (its *basis*); if anything newer has been applied
//! by the time its result is processed, the result is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use r3alm_auth::{AuthChangeEvent, AuthStateChange, IdentityProvider, Session};

use crate::config::SessionOptions;
use crate::demo::DemoCredentialResolver;
use crate::error::{Result, SessionError};
use crate::state::SessionState;
use crate::store::{LocalPersistenceStore, UserSlot};
use crate::subscribers::{SubscriberRegistry, Subscription};
use crate::timeout::TimeoutGuard;
use crate::user::{normalize_email, User};

/// What an event proposes as the next canonical value
#[derive(Debug)]
pub(crate) enum Candidate {
    /// Needs a profile lookup before it becomes a `User`
    Session(Box<Session>),
    User(User),
    SignedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    Confirmation,
    Push(AuthChangeEvent),
    DemoLogin,
    Logout,
}

/// How a reconciliation attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// A newer event had already been applied
    Stale,
    /// Same user as before: nothing persisted, nobody notified
    Unchanged,
    Changed,
}

struct Envelope {
    seq: u64,
    basis: u64,
    origin: Origin,
    candidate: Candidate,
    ack: Option<oneshot::Sender<Outcome>>,
}

struct SequencerInner {
    last_issued: u64,
    tx: mpsc::UnboundedSender<Envelope>,
}

/// Issues sequence numbers and enqueues under one lock, so queue order
/// always matches sequence order.
struct Sequencer {
    inner: Mutex<SequencerInner>,
}

impl Sequencer {
    fn new(tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            inner: Mutex::new(SequencerInner { last_issued: 0, tx }),
        }
    }

    fn current(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_issued
    }

    /// `basis` of `None` means the event carries no earlier call.
    fn enqueue(
        &self,
        basis: Option<u64>,
        origin: Origin,
        candidate: Candidate,
        ack: Option<oneshot::Sender<Outcome>>,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = inner.last_issued + 1;
        let envelope = Envelope {
            seq,
            basis: basis.unwrap_or(seq),
            origin,
            candidate,
            ack,
        };
        inner
            .tx
            .send(envelope)
            .map_err(|_| SessionError::WorkerClosed)?;
        inner.last_issued = seq;
        debug!(seq, ?origin, "event enqueued");
        Ok(seq)
    }
}

/// Canonical value plus everything that must change together with it
pub(crate) struct Canonical {
    store: Arc<dyn LocalPersistenceStore>,
    storage_key: String,
    subscribers: SubscriberRegistry,
    state_tx: watch::Sender<SessionState>,
    last_applied: u64,
}

impl Canonical {
    pub(crate) fn new(
        store: Arc<dyn LocalPersistenceStore>,
        storage_key: String,
        subscribers: SubscriberRegistry,
    ) -> (Self, watch::Receiver<SessionState>) {
        let (state_tx, state_rx) = watch::channel(SessionState::Unknown);
        let canonical = Self {
            store,
            storage_key,
            subscribers,
            state_tx,
            last_applied: 0,
        };
        (canonical, state_rx)
    }

    fn slot(&self) -> UserSlot<'_> {
        UserSlot::new(self.store.as_ref(), &self.storage_key)
    }

    /// Publish the stored user as a provisional value.
    pub(crate) fn seed(&mut self) -> Option<User> {
        if *self.state_tx.borrow() != SessionState::Unknown {
            return None;
        }
        let user = self.slot().load()?;
        info!(user_id = %user.id, "seeded provisional user from local store");

        let state = SessionState::Provisional(user.clone());
        self.state_tx.send_replace(state.clone());
        self.subscribers.notify(&state);
        Some(user)
    }

    pub(crate) fn is_stale(&self, seq: u64, basis: u64) -> bool {
        seq <= self.last_applied || basis < self.last_applied
    }

    /// The single choke point for state changes.
    pub(crate) fn reconcile(&mut self, seq: u64, basis: u64, next: Option<User>) -> Outcome {
        if self.is_stale(seq, basis) {
            debug!(seq, basis, last_applied = self.last_applied, "dropping stale event");
            return Outcome::Stale;
        }
        self.last_applied = seq;

        let next_state = SessionState::confirmed(next);
        let unchanged = self.state_tx.borrow().user() == next_state.user();
        if unchanged {
            // Watchers still learn that the value is now confirmed.
            self.state_tx.send_if_modified(|state| {
                if *state != next_state {
                    *state = next_state;
                    true
                } else {
                    false
                }
            });
            debug!(seq, "user unchanged");
            return Outcome::Unchanged;
        }

        self.state_tx.send_replace(next_state.clone());

        let persisted = match next_state.user() {
            Some(user) => self.slot().save(user),
            None => self.slot().clear(),
        };
        if let Err(err) = persisted {
            error!(error = %err, "could not persist current user");
        }

        match next_state.user() {
            Some(user) => info!(seq, user_id = %user.id, role = %user.role, "user authenticated"),
            None => info!(seq, "user signed out"),
        }
        self.subscribers.notify(&next_state);
        Outcome::Changed
    }
}

struct Shared {
    provider: Arc<dyn IdentityProvider>,
    demo: DemoCredentialResolver,
    guard: TimeoutGuard,
    sequencer: Sequencer,
    subscribers: SubscriberRegistry,
    state_rx: watch::Receiver<SessionState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    /// Keep `task` so that `shutdown` can abort it.
    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    /// Fetch the profile for `session` and build the `User`.
    async fn derive_user(&self, session: &Session) -> Result<User> {
        match self.guard.run(self.provider.get_user()).await {
            Ok(record) => Ok(User::from_session(session, &record)),
            Err(err) => Err(SessionError::derivation(err)),
        }
    }

    /// Ask the provider for its current session and queue the answer.
    ///
    /// `basis` must be read before the call is started; anything enqueued
    /// after it makes the answer stale.
    async fn confirm(&self, basis: u64, ack: Option<oneshot::Sender<Outcome>>) -> Result<()> {
        let candidate = match self.guard.run(self.provider.get_session()).await {
            Ok(Some(session)) => Candidate::Session(Box::new(session)),
            Ok(None) => Candidate::SignedOut,
            Err(err) => {
                log_failure("session confirmation failed, keeping current state", &err);
                return Err(err);
            }
        };
        self.sequencer
            .enqueue(Some(basis), Origin::Confirmation, candidate, ack)?;
        Ok(())
    }
}

fn log_failure(context: &str, err: &SessionError) {
    if err.is_recoverable() {
        warn!(error = %err, "{}", context);
    } else {
        error!(error = %err, "{}", context);
    }
}

struct Worker {
    shared: Arc<Shared>,
    canonical: Canonical,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(envelope) = rx.recv().await {
            let outcome = self
                .process(envelope.seq, envelope.basis, envelope.origin, envelope.candidate)
                .await;
            if let Some(ack) = envelope.ack {
                let _ = ack.send(outcome);
            }
        }
        debug!("reconciliation worker finished");
    }

    async fn process(
        &mut self,
        seq: u64,
        basis: u64,
        origin: Origin,
        candidate: Candidate,
    ) -> Outcome {
        // Skip the profile lookup for results that can no longer apply.
        if self.canonical.is_stale(seq, basis) {
            return self.canonical.reconcile(seq, basis, None);
        }

        let next = match candidate {
            Candidate::Session(session) => match self.shared.derive_user(&session).await {
                Ok(user) => Some(user),
                Err(err) => {
                    log_failure("profile lookup failed, treating session as signed out", &err);
                    None
                }
            },
            Candidate::User(user) => Some(user),
            Candidate::SignedOut => None,
        };

        debug!(seq, ?origin, "reconciling");
        self.canonical.reconcile(seq, basis, next)
    }
}

fn push_candidate(change: AuthStateChange) -> (AuthChangeEvent, Candidate) {
    let candidate = match (change.event, change.session) {
        (AuthChangeEvent::SignedOut, _) => Candidate::SignedOut,
        (_, Some(session)) => Candidate::Session(Box::new(session)),
        (_, None) => Candidate::SignedOut,
    };
    (change.event, candidate)
}

async fn forward_state_changes(
    shared: Arc<Shared>,
    mut rx: broadcast::Receiver<AuthStateChange>,
) {
    loop {
        match rx.recv().await {
            Ok(change) => {
                let (event, candidate) = push_candidate(change);
                if shared
                    .sequencer
                    .enqueue(None, Origin::Push(event), candidate, None)
                    .is_err()
                {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "auth state stream lagged, re-checking session");
                // The retained events are older than the re-check, so they
                // must be queued before its basis is read.
                let open = drain_retained(&shared, &mut rx);
                let basis = shared.sequencer.current();
                let task_shared = shared.clone();
                let recheck = tokio::spawn(async move {
                    let _ = task_shared.confirm(basis, None).await;
                });
                shared.track(recheck);
                if !open {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("auth state stream closed");
                break;
            }
        }
    }
}

/// Queue everything the receiver still holds. Returns false once the
/// stream or the worker is gone.
fn drain_retained(shared: &Shared, rx: &mut broadcast::Receiver<AuthStateChange>) -> bool {
    loop {
        match rx.try_recv() {
            Ok(change) => {
                let (event, candidate) = push_candidate(change);
                if shared
                    .sequencer
                    .enqueue(None, Origin::Push(event), candidate, None)
                    .is_err()
                {
                    return false;
                }
            }
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                debug!(missed, "more events dropped while draining");
            }
            Err(broadcast::error::TryRecvError::Empty) => return true,
            Err(broadcast::error::TryRecvError::Closed) => return false,
        }
    }
}

/// Owns the canonical current user and every path that can change it
pub struct SessionReconciler {
    shared: Arc<Shared>,
    pending: Mutex<Option<(Canonical, mpsc::UnboundedReceiver<Envelope>)>>,
    started: AtomicBool,
}

impl SessionReconciler {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn LocalPersistenceStore>,
        options: SessionOptions,
    ) -> Result<Self> {
        let demo = if options.demo_accounts {
            DemoCredentialResolver::default()
        } else {
            DemoCredentialResolver::disabled()
        };
        Self::with_demo_resolver(provider, store, options, demo)
    }

    pub fn with_demo_resolver(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn LocalPersistenceStore>,
        options: SessionOptions,
        demo: DemoCredentialResolver,
    ) -> Result<Self> {
        options.validate()?;
        let guard = TimeoutGuard::new(options.provider_timeout)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let subscribers = SubscriberRegistry::new();
        let (canonical, state_rx) =
            Canonical::new(store, options.storage_key.clone(), subscribers.clone());

        let shared = Arc::new(Shared {
            provider,
            demo,
            guard,
            sequencer: Sequencer::new(tx),
            subscribers,
            state_rx,
            tasks: Mutex::new(Vec::new()),
        });

        Ok(Self {
            shared,
            pending: Mutex::new(Some((canonical, rx))),
            started: AtomicBool::new(false),
        })
    }

    /// Seed from the store, follow the provider's push stream and start the
    /// initial session check. Must run inside a tokio runtime; later calls
    /// are no-ops.
    pub fn start(&self) -> Result<()> {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let (mut canonical, rx) = match pending {
            Some(pending) => pending,
            None => return Ok(()),
        };

        canonical.seed();

        // Subscribe before the initial check so no change slips between them.
        let push_rx = self.shared.provider.subscribe_state_changes();
        let forwarder = tokio::spawn(forward_state_changes(self.shared.clone(), push_rx));

        let worker = Worker {
            shared: self.shared.clone(),
            canonical,
        };
        let worker = tokio::spawn(worker.run(rx));

        let shared = self.shared.clone();
        let basis = shared.sequencer.current();
        let confirmation = tokio::spawn(async move {
            let _ = shared.confirm(basis, None).await;
        });

        for task in [forwarder, worker, confirmation] {
            self.shared.track(task);
        }
        self.started.store(true, Ordering::SeqCst);
        info!("session reconciler started");
        Ok(())
    }

    fn ensure_started(&self) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SessionError::NotStarted)
        }
    }

    async fn submit(&self, origin: Origin, candidate: Candidate) -> Result<Outcome> {
        let (tx, rx) = oneshot::channel();
        self.shared.sequencer.enqueue(None, origin, candidate, Some(tx))?;
        rx.await.map_err(|_| SessionError::WorkerClosed)
    }

    /// Sign in with email and password.
    ///
    /// Demo credentials are applied before this returns. For provider
    /// accounts a successful return only means the provider accepted the
    /// credentials; the user appears once the provider's `SIGNED_IN` event
    /// has been reconciled.
    pub async fn login(&self, email: &str, password: &str) -> Result<()> {
        self.ensure_started()?;
        let email = normalize_email(email);

        if let Some(user) = self.shared.demo.resolve(&email, password) {
            info!(email = %email, role = %user.role, "demo account sign-in");
            self.submit(Origin::DemoLogin, Candidate::User(user)).await?;
            return Ok(());
        }

        match self
            .shared
            .guard
            .run(self.shared.provider.sign_in_with_password(&email, password))
            .await
        {
            Ok(session) => {
                info!(user_id = %session.subject_id(), "provider accepted credentials");
                Ok(())
            }
            Err(err) => {
                log_failure("sign-in failed", &err);
                Err(err)
            }
        }
    }

    /// Sign out remotely and locally.
    ///
    /// The local state is `Anonymous` when this returns, whatever the
    /// provider answered; the provider's outcome is still reported.
    pub async fn logout(&self) -> Result<()> {
        self.ensure_started()?;

        let remote = self.shared.guard.run(self.shared.provider.sign_out()).await;
        if let Err(ref err) = remote {
            log_failure("remote sign-out failed, clearing local session anyway", err);
        }

        self.submit(Origin::Logout, Candidate::SignedOut).await?;
        remote
    }

    /// Re-run the provider session check and wait until its answer is applied.
    pub async fn resync(&self) -> Result<()> {
        self.ensure_started()?;
        let (tx, rx) = oneshot::channel();
        let basis = self.shared.sequencer.current();
        self.shared.confirm(basis, Some(tx)).await?;
        rx.await.map_err(|_| SessionError::WorkerClosed)?;
        Ok(())
    }

    /// Register a callback for every applied change.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SessionState) + Send + Sync + 'static,
    {
        self.shared.subscribers.subscribe(callback)
    }

    /// Snapshot of the canonical user. May trail events still in the queue.
    pub fn current_user(&self) -> Option<User> {
        self.shared.state_rx.borrow().user().cloned()
    }

    pub fn state(&self) -> SessionState {
        self.shared.state_rx.borrow().clone()
    }

    /// Receiver that wakes on every state change, including confirmations
    /// that leave the user unchanged.
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.shared.state_rx.clone()
    }

    /// Stop following the provider and stop the worker.
    pub fn shutdown(&self) {
        let tasks: Vec<_> = self
            .shared
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if !tasks.is_empty() {
            info!("session reconciler shutting down");
        }
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for SessionReconciler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreError};
    use crate::user::Role;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStore,
        writes: AtomicUsize,
        deletes: AtomicUsize,
    }

    impl LocalPersistenceStore for CountingStore {
        fn get(&self, key: &str) -> std::result::Result<Option<String>, StoreError> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> std::result::Result<(), StoreError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.set(key, value)
        }

        fn delete(&self, key: &str) -> std::result::Result<(), StoreError> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.inner.delete(key)
        }
    }

    fn user(id: &str) -> User {
        User {
            id: id.to_string(),
            email: format!("{}@r3alm.com", id),
            role: Role::User,
            display_name: None,
        }
    }

    struct Fixture {
        canonical: Canonical,
        state_rx: watch::Receiver<SessionState>,
        store: Arc<CountingStore>,
        notified: Arc<Mutex<Vec<SessionState>>>,
        _subscription: Subscription,
    }

    fn fixture() -> Fixture {
        fixture_with(CountingStore::default())
    }

    fn fixture_with(store: CountingStore) -> Fixture {
        let store = Arc::new(store);
        let subscribers = SubscriberRegistry::new();
        let notified = Arc::new(Mutex::new(Vec::new()));
        let subscription = {
            let notified = notified.clone();
            subscribers.subscribe(move |state| notified.lock().unwrap().push(state.clone()))
        };
        let (canonical, state_rx) =
            Canonical::new(store.clone(), "current_user".to_string(), subscribers);
        Fixture {
            canonical,
            state_rx,
            store,
            notified,
            _subscription: subscription,
        }
    }

    #[test]
    fn same_user_twice_notifies_and_persists_once() {
        let mut f = fixture();

        assert_eq!(f.canonical.reconcile(1, 1, Some(user("a"))), Outcome::Changed);
        assert_eq!(f.canonical.reconcile(2, 2, Some(user("a"))), Outcome::Unchanged);

        assert_eq!(f.notified.lock().unwrap().len(), 1);
        assert_eq!(f.store.writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn higher_sequence_wins_in_either_arrival_order() {
        let mut in_order = fixture();
        in_order.canonical.reconcile(1, 1, Some(user("a")));
        in_order.canonical.reconcile(2, 2, None);
        assert_eq!(*in_order.state_rx.borrow(), SessionState::Anonymous);

        let mut reversed = fixture();
        reversed.canonical.reconcile(2, 2, None);
        assert_eq!(reversed.canonical.reconcile(1, 1, Some(user("a"))), Outcome::Stale);
        assert_eq!(*reversed.state_rx.borrow(), SessionState::Anonymous);
        assert!(reversed.notified.lock().unwrap().is_empty());
    }

    #[test]
    fn result_of_call_started_before_newer_event_is_dropped() {
        let mut f = fixture();
        // call issued when last seq was 0; push event 1 applies first
        f.canonical.reconcile(1, 1, Some(user("a")));
        assert_eq!(f.canonical.reconcile(2, 0, None), Outcome::Stale);
        assert_eq!(f.state_rx.borrow().user(), Some(&user("a")));
    }

    #[test]
    fn seed_is_provisional_and_not_rewritten() {
        let store = CountingStore::default();
        store
            .inner
            .set("current_user", &serde_json::to_string(&user("u1")).unwrap())
            .unwrap();
        let mut f = fixture_with(store);

        assert_eq!(f.canonical.seed(), Some(user("u1")));
        assert_eq!(*f.state_rx.borrow(), SessionState::Provisional(user("u1")));
        assert_eq!(f.store.writes.load(Ordering::SeqCst), 0);
        assert_eq!(
            *f.notified.lock().unwrap(),
            vec![SessionState::Provisional(user("u1"))]
        );

        // confirmation of the same user: promoted silently
        assert_eq!(f.canonical.reconcile(1, 0, Some(user("u1"))), Outcome::Unchanged);
        assert_eq!(*f.state_rx.borrow(), SessionState::Authenticated(user("u1")));
        assert_eq!(f.notified.lock().unwrap().len(), 1);
    }

    #[test]
    fn sign_out_deletes_stored_user() {
        let mut f = fixture();
        f.canonical.reconcile(1, 1, Some(user("a")));
        f.canonical.reconcile(2, 2, None);

        assert_eq!(f.store.deletes.load(Ordering::SeqCst), 1);
        assert_eq!(f.store.get("current_user").unwrap(), None);
    }

    #[test]
    fn first_anonymous_confirmation_only_updates_watchers() {
        let mut f = fixture();
        assert_eq!(f.canonical.reconcile(1, 0, None), Outcome::Unchanged);

        assert_eq!(*f.state_rx.borrow(), SessionState::Anonymous);
        assert!(f.notified.lock().unwrap().is_empty());
        assert_eq!(f.store.deletes.load(Ordering::SeqCst), 0);
    }
}
