//! Per-connection authentication gate.
//!
//! `login` and `logout` are answered here and never travel further. Every
//! other call is forwarded only while the connection holds a principal; an
//! unauthenticated call is answered with a `not authenticated` error right
//! away.
//!
//! | state | `login` ok | `login` rejected | `logout` | other call |
//! |-------|------------|------------------|----------|------------|
//! | unauthenticated | authenticated | unauthenticated | unauthenticated | error |
//! | authenticated | authenticated (new principal) | unauthenticated | unauthenticated | forwarded |
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use rpcbridge_core::{
    config::AuthConfig,
    protocol::{Inbound, Request, Response},
    socket::{Listener, ListenerSet, Socket, SocketError, SocketSlot, Stage},
    util::hash::{password_digest, verify_password},
    AnyResult, RpcError,
};
use serde::Deserialize;
use serde_json::Value;
use service_async::{
    layer::{layer_fn, FactoryLayer},
    MakeService,
};
use tracing::{debug, info, warn};

pub const LOGIN_METHOD: &str = "login";
pub const LOGOUT_METHOD: &str = "logout";

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// The identity attached to an authenticated connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
}

/// Validates credentials.
pub trait AuthProvider: Send + Sync {
    /// `None` when the credentials are not accepted.
    fn authenticate(&self, credentials: &Credentials) -> Option<Principal>;
}

impl<T: AuthProvider + ?Sized> AuthProvider for Arc<T> {
    #[inline]
    fn authenticate(&self, credentials: &Credentials) -> Option<Principal> {
        (**self).authenticate(credentials)
    }
}

/// Users and the hex sha256 of their passwords, usually from [`AuthConfig`].
#[derive(Debug, Clone, Default)]
pub struct StaticAuthProvider {
    users: HashMap<String, String>,
}

impl StaticAuthProvider {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            users: config.users.clone(),
        }
    }

    pub fn with_user(mut self, username: impl Into<String>, password: &str) -> Self {
        self.users.insert(username.into(), password_digest(password));
        self
    }
}

impl AuthProvider for StaticAuthProvider {
    fn authenticate(&self, credentials: &Credentials) -> Option<Principal> {
        let digest = self.users.get(&credentials.username)?;
        verify_password(digest, &credentials.password).then(|| Principal {
            name: credentials.username.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    Unauthenticated,
    Authenticated(Principal),
}

pub struct AuthStage {
    provider: Arc<dyn AuthProvider>,
    state: Mutex<AuthState>,
    socket: SocketSlot<Response>,
    listeners: ListenerSet<Inbound, Response>,
}

impl AuthStage {
    pub fn new(provider: Arc<dyn AuthProvider>) -> Self {
        Self {
            provider,
            state: Mutex::new(AuthState::Unauthenticated),
            socket: SocketSlot::default(),
            listeners: ListenerSet::new(),
        }
    }

    pub fn layer<C, F>(
        provider: Arc<dyn AuthProvider>,
    ) -> impl FactoryLayer<C, F, Factory = AuthFactory<F>> {
        layer_fn(move |_c: &C, inner: F| AuthFactory {
            provider: provider.clone(),
            inner,
        })
    }

    pub fn state(&self) -> AuthState {
        self.lock().clone()
    }

    pub fn principal(&self) -> Option<Principal> {
        match self.state() {
            AuthState::Authenticated(principal) => Some(principal),
            AuthState::Unauthenticated => None,
        }
    }

    fn is_authenticated(&self) -> bool {
        matches!(*self.lock(), AuthState::Authenticated(_))
    }

    fn set_state(&self, state: AuthState) {
        *self.lock() = state;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AuthState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn login(&self, req: &Request) {
        let credentials = match parse_credentials(&req.params) {
            Ok(credentials) => credentials,
            Err(reason) => {
                debug!("login {}: {reason}", req.id);
                return self.reply_error(req, RpcError::AuthParameter(reason));
            }
        };
        match self.provider.authenticate(&credentials) {
            Some(principal) => {
                info!("{} logged in", principal.name);
                self.set_state(AuthState::Authenticated(principal));
                self.acknowledge(req);
            }
            None => {
                warn!("login rejected for {}", credentials.username);
                self.set_state(AuthState::Unauthenticated);
                self.reply_error(req, RpcError::AuthenticationFailed);
            }
        }
    }

    fn logout(&self, req: &Request) {
        let previous = std::mem::take(&mut *self.lock());
        if let AuthState::Authenticated(principal) = previous {
            info!("{} logged out", principal.name);
        }
        self.acknowledge(req);
    }

    fn acknowledge(&self, req: &Request) {
        self.send(Response::item(req.id, Value::Bool(true)));
        self.send(Response::completed(req.id));
    }

    fn reply_error(&self, req: &Request, err: RpcError) {
        self.send(Response::error(Some(req.id), &err));
    }

    fn send(&self, response: Response) {
        if let Err(e) = self.socket.write(response) {
            warn!("auth reply not written: {e}");
        }
    }
}

// `login` takes a single `{username, password}` object.
fn parse_credentials(params: &[Value]) -> Result<Credentials, String> {
    match params {
        [value] => serde_json::from_value(value.clone()).map_err(|e| e.to_string()),
        _ => Err(format!(
            "expected a single credentials object, got {} parameters",
            params.len()
        )),
    }
}

impl Listener<Inbound, Response> for AuthStage {
    fn on_register(&self, socket: Arc<dyn Socket<Response>>) {
        self.socket.set(socket);
    }

    fn on_data(&self, inbound: Inbound) -> AnyResult<()> {
        if let Inbound::Call(req) = &inbound {
            match req.method.as_str() {
                LOGIN_METHOD => {
                    self.login(req);
                    return Ok(());
                }
                LOGOUT_METHOD => {
                    self.logout(req);
                    return Ok(());
                }
                _ => {}
            }
        }
        if self.is_authenticated() {
            self.listeners.on_data(inbound);
            return Ok(());
        }
        match inbound {
            Inbound::Call(req) => self.reply_error(&req, RpcError::NotAuthenticated),
            Inbound::Cancel(id) => debug!("cancel {id} ignored on unauthenticated connection"),
        }
        Ok(())
    }

    fn on_end(&self) -> AnyResult<()> {
        self.listeners.on_end();
        self.set_state(AuthState::Unauthenticated);
        self.socket.take();
        Ok(())
    }
}

impl Socket<Response> for AuthStage {
    #[inline]
    fn write(&self, response: Response) -> Result<(), SocketError> {
        self.socket.write(response)
    }
}

impl Stage<Inbound, Response> for AuthStage {
    fn listeners(&self) -> &ListenerSet<Inbound, Response> {
        &self.listeners
    }
}

pub struct AuthFactory<F> {
    provider: Arc<dyn AuthProvider>,
    inner: F,
}

impl<F> MakeService for AuthFactory<F>
where
    F: MakeService,
    F::Service: Listener<Inbound, Response> + 'static,
{
    type Service = Arc<AuthStage>;
    type Error = F::Error;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        let inner = self.inner.make_via_ref(None)?;
        let stage = Arc::new(AuthStage::new(self.provider.clone()));
        stage.clone().register(Arc::new(inner));
        Ok(stage)
    }
}
