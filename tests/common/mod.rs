#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};

use r3alm_auth::{AuthChangeEvent, AuthError, AuthStateChange, IdentityProvider, Session, UserRecord};
use r3alm_session::store::{LocalPersistenceStore, MemoryStore, StoreError};
use r3alm_session::{Role, SessionState, Subscription, User};

/// How a scripted provider call behaves
#[derive(Debug, Clone)]
pub enum Behavior {
    Answer,
    Delay(Duration),
    Hang,
    Fail(u16),
}

impl Behavior {
    async fn play(&self) -> Result<(), AuthError> {
        match self {
            Behavior::Answer => Ok(()),
            Behavior::Delay(d) => {
                tokio::time::sleep(*d).await;
                Ok(())
            }
            Behavior::Hang => std::future::pending().await,
            Behavior::Fail(status) => Err(AuthError::api(*status, "scripted failure")),
        }
    }
}

#[derive(Default)]
pub struct Calls {
    pub get_session: AtomicUsize,
    pub get_user: AtomicUsize,
    pub sign_in: AtomicUsize,
    pub sign_out: AtomicUsize,
}

impl Calls {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// In-memory identity provider with scripted latency and failures
pub struct MockProvider {
    pub session: Mutex<Option<Session>>,
    pub metadata: Mutex<HashMap<String, serde_json::Value>>,
    pub accounts: Mutex<HashMap<String, String>>,
    pub last_sign_in_email: Mutex<Option<String>>,
    pub get_session_behavior: Mutex<Behavior>,
    pub get_user_behavior: Mutex<Behavior>,
    pub sign_in_behavior: Mutex<Behavior>,
    pub sign_out_behavior: Mutex<Behavior>,
    pub calls: Calls,
    events: broadcast::Sender<AuthStateChange>,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            session: Mutex::new(None),
            metadata: Mutex::new(HashMap::new()),
            accounts: Mutex::new(HashMap::new()),
            last_sign_in_email: Mutex::new(None),
            get_session_behavior: Mutex::new(Behavior::Answer),
            get_user_behavior: Mutex::new(Behavior::Answer),
            sign_in_behavior: Mutex::new(Behavior::Answer),
            sign_out_behavior: Mutex::new(Behavior::Answer),
            calls: Calls::default(),
            events,
        })
    }

    pub fn with_session(self: Arc<Self>, session: Session) -> Arc<Self> {
        *self.session.lock().unwrap() = Some(session);
        self
    }

    pub fn with_role(self: Arc<Self>, role: &str) -> Arc<Self> {
        self.metadata
            .lock()
            .unwrap()
            .insert("role".to_string(), json!(role));
        self
    }

    pub fn with_account(self: Arc<Self>, email: &str, password: &str) -> Arc<Self> {
        self.accounts
            .lock()
            .unwrap()
            .insert(email.to_string(), password.to_string());
        self
    }

    pub fn set(&self, slot: &Mutex<Behavior>, behavior: Behavior) {
        *slot.lock().unwrap() = behavior;
    }

    pub fn emit(&self, event: AuthChangeEvent, session: Option<Session>) {
        let _ = self.events.send(AuthStateChange::new(event, session));
    }

    fn record(&self, id: &str, email: Option<String>) -> UserRecord {
        UserRecord {
            id: id.to_string(),
            email,
            user_metadata: self.metadata.lock().unwrap().clone(),
            app_metadata: HashMap::new(),
            created_at: None,
            updated_at: None,
        }
    }
}

#[async_trait]
impl IdentityProvider for MockProvider {
    async fn get_session(&self) -> Result<Option<Session>, AuthError> {
        self.calls.get_session.fetch_add(1, Ordering::SeqCst);
        let behavior = self.get_session_behavior.lock().unwrap().clone();
        let session = self.session.lock().unwrap().clone();
        behavior.play().await?;
        Ok(session)
    }

    async fn get_user(&self) -> Result<UserRecord, AuthError> {
        self.calls.get_user.fetch_add(1, Ordering::SeqCst);
        let behavior = self.get_user_behavior.lock().unwrap().clone();
        behavior.play().await?;
        let session = self.session.lock().unwrap().clone();
        match session {
            Some(session) => Ok(self.record(&session.user.id, session.user.email.clone())),
            None => Ok(self.record("unknown", None)),
        }
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        self.calls.sign_in.fetch_add(1, Ordering::SeqCst);
        *self.last_sign_in_email.lock().unwrap() = Some(email.to_string());
        let behavior = self.sign_in_behavior.lock().unwrap().clone();
        behavior.play().await?;

        let valid = self.accounts.lock().unwrap().get(email).map(String::as_str) == Some(password);
        if !valid {
            return Err(AuthError::api(400, "Invalid login credentials"));
        }

        let session = session_for(&format!("sub-{}", email), email);
        *self.session.lock().unwrap() = Some(session.clone());
        self.emit(AuthChangeEvent::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.calls.sign_out.fetch_add(1, Ordering::SeqCst);
        let behavior = self.sign_out_behavior.lock().unwrap().clone();
        behavior.play().await?;
        if self.session.lock().unwrap().take().is_some() {
            self.emit(AuthChangeEvent::SignedOut, None);
        }
        Ok(())
    }

    fn subscribe_state_changes(&self) -> broadcast::Receiver<AuthStateChange> {
        self.events.subscribe()
    }
}

pub fn session_for(id: &str, email: &str) -> Session {
    serde_json::from_value(json!({
        "access_token": format!("token-{}", id),
        "refresh_token": "refresh",
        "expires_in": 3600,
        "user": { "id": id, "email": email }
    }))
    .unwrap()
}

pub fn stored_user(id: &str, role: Role) -> User {
    User {
        id: id.to_string(),
        email: format!("{}@r3alm.com", id),
        role,
        display_name: None,
    }
}

/// Memory store that counts writes and deletes
#[derive(Default)]
pub struct CountingStore {
    pub inner: MemoryStore,
    pub writes: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl CountingStore {
    pub fn seeded(user: &User) -> Arc<Self> {
        let store = Self::default();
        store
            .inner
            .set("current_user", &serde_json::to_string(user).unwrap())
            .unwrap();
        Arc::new(store)
    }

    pub fn user(&self) -> Option<User> {
        self.inner
            .get("current_user")
            .unwrap()
            .map(|raw| serde_json::from_str(&raw).unwrap())
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

impl LocalPersistenceStore for CountingStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(key)
    }
}

/// Collects notifications delivered to a subscriber
pub struct Recorder {
    rx: mpsc::UnboundedReceiver<SessionState>,
    pub subscription: Subscription,
}

impl Recorder {
    pub fn attach<F>(subscribe: F) -> Self
    where
        F: FnOnce(Box<dyn Fn(&SessionState) + Send + Sync>) -> Subscription,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = subscribe(Box::new(move |state: &SessionState| {
            let _ = tx.send(state.clone());
        }));
        Self { rx, subscription }
    }

    /// Next notification; fails the test if none arrives within a minute of
    /// (virtual) time.
    pub async fn next(&mut self) -> SessionState {
        tokio::time::timeout(Duration::from_secs(60), self.rx.recv())
            .await
            .expect("no notification arrived")
            .expect("subscriber channel closed")
    }

    /// Everything delivered so far, without waiting.
    pub fn drain(&mut self) -> Vec<SessionState> {
        let mut seen = Vec::new();
        while let Ok(state) = self.rx.try_recv() {
            seen.push(state);
        }
        seen
    }
}
