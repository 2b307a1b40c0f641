#![allow(dead_code)]

use async_trait::async_trait;
use azure_redis_auth::common::{IdentityError, ReauthenticationError};
use azure_redis_auth::connection::{CacheConnection, ServerEndpoint};
use azure_redis_auth::identity::{AccessToken, IdentityBackend, IdentityKind};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub fn expiring_in(seconds: i64) -> DateTime<Utc> {
    Utc::now() + ChronoDuration::seconds(seconds)
}

pub fn token(value: &str, expires_on: DateTime<Utc>) -> Result<AccessToken, IdentityError> {
    Ok(AccessToken::new(value, expires_on))
}

pub fn unavailable() -> Result<AccessToken, IdentityError> {
    Err(IdentityError::Service {
        status: 503,
        code: "temporarily_unavailable".to_string(),
        description: "try again later".to_string(),
    })
}

/// Identity backend that plays back a script; once the script is exhausted
/// it keeps issuing tokens with ever later expiries.
#[derive(Default)]
pub struct FakeBackend {
    script: Mutex<VecDeque<Result<AccessToken, IdentityError>>>,
    calls: AtomicU32,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeBackend {
    pub fn new(script: Vec<Result<AccessToken, IdentityError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        })
    }

    pub fn push(&self, response: Result<AccessToken, IdentityError>) {
        self.script.lock().unwrap().push_back(response);
    }

    /// Makes subsequent calls wait until the returned notifier fires.
    pub fn hold(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(notify.clone());
        notify
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityBackend for FakeBackend {
    async fn get_token(&self, _cancel: CancellationToken) -> Result<AccessToken, IdentityError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            token(
                &format!("token-{call}"),
                expiring_in(3600 + i64::from(call)),
            )
        })
    }

    fn kind(&self) -> IdentityKind {
        IdentityKind::TokenCredential
    }
}

/// Behaviour of one `AUTH` call on a [`FakeEndpoint`].
#[derive(Clone, Debug)]
pub enum AuthReply {
    Ok,
    Fail,
    Disposed,
    Panic,
}

pub struct FakeEndpoint {
    name: String,
    connected: AtomicBool,
    replies: Mutex<VecDeque<AuthReply>>,
    auths: Mutex<Vec<(String, String)>>,
}

impl FakeEndpoint {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            connected: AtomicBool::new(true),
            replies: Mutex::new(VecDeque::new()),
            auths: Mutex::new(Vec::new()),
        })
    }

    /// Queues replies for the next `AUTH` calls; later calls succeed.
    pub fn reply_with(&self, replies: impl IntoIterator<Item = AuthReply>) {
        self.replies.lock().unwrap().extend(replies);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn auth_count(&self) -> usize {
        self.auths.lock().unwrap().len()
    }

    pub fn last_auth(&self) -> Option<(String, String)> {
        self.auths.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ServerEndpoint for FakeEndpoint {
    fn endpoint(&self) -> String {
        self.name.clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn reauthenticate(
        &self,
        username: &str,
        token: &str,
    ) -> Result<(), ReauthenticationError> {
        self.auths
            .lock()
            .unwrap()
            .push((username.to_string(), token.to_string()));

        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(AuthReply::Ok);
        match reply {
            AuthReply::Ok => Ok(()),
            AuthReply::Fail => Err(ReauthenticationError::CommandFailed {
                endpoint: self.name.clone(),
                reason: "timeout".to_string(),
            }),
            AuthReply::Disposed => Err(ReauthenticationError::Disposed),
            AuthReply::Panic => panic!("endpoint {} exploded", self.name),
        }
    }
}

pub struct FakeConnection {
    name: String,
    servers: Vec<Arc<FakeEndpoint>>,
    disposed: AtomicBool,
    server_lookups: AtomicUsize,
}

impl FakeConnection {
    pub fn new(name: &str, servers: Vec<Arc<FakeEndpoint>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            servers,
            disposed: AtomicBool::new(false),
            server_lookups: AtomicUsize::new(0),
        })
    }

    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    pub fn server_lookups(&self) -> usize {
        self.server_lookups.load(Ordering::SeqCst)
    }
}

impl CacheConnection for FakeConnection {
    fn client_name(&self) -> String {
        self.name.clone()
    }

    fn servers(&self) -> Result<Vec<Arc<dyn ServerEndpoint>>, ReauthenticationError> {
        self.server_lookups.fetch_add(1, Ordering::SeqCst);
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ReauthenticationError::Disposed);
        }
        Ok(self
            .servers
            .iter()
            .map(|server| server.clone() as Arc<dyn ServerEndpoint>)
            .collect())
    }
}

pub fn as_connection(connection: &Arc<FakeConnection>) -> Arc<dyn CacheConnection> {
    connection.clone()
}

/// Collects every event delivered to a subscriber.
#[derive(Clone)]
pub struct Recorder<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone + Send + 'static> Recorder<T> {
    pub fn record(&self, item: T) {
        self.items.lock().unwrap().push(item);
    }

    pub fn items(&self) -> Vec<T> {
        self.items.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}
