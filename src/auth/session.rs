use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{self, Backend, Query, tables};
use crate::models::{AuthEvent, AuthOutcome, Credentials, SignupData};
use crate::model::role::Role;
use crate::model::user::{NewProfile, User};
use crate::routes::{Navigator, Route};
use crate::utils::in_flight::InFlight;
use crate::utils::signal::Signal;

/// Who is signed in. Constructed once per application and handed to the
/// resource managers.
pub struct Session {
    backend: Arc<dyn Backend>,
    navigator: Arc<Navigator>,
    current_user: Signal<Option<User>>,
    loading: InFlight,
    auth_ready: Signal<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    fn new(backend: Arc<dyn Backend>, navigator: Arc<Navigator>) -> Self {
        Self {
            backend,
            navigator,
            current_user: Signal::new(None),
            loading: InFlight::new(),
            auth_ready: Signal::new(false),
            listener: Mutex::new(None),
        }
    }

    /// Restores any existing session, then follows auth state changes until
    /// [`Session::shutdown`] (or drop).
    pub async fn initialize(backend: Arc<dyn Backend>, navigator: Arc<Navigator>) -> Arc<Self> {
        let session = Arc::new(Self::new(backend, navigator));

        // subscribe before the lookup so no change slips in between
        let events = session.backend.on_auth_state_change();

        {
            let _loading = session.loading.enter();
            match session.backend.get_session().await {
                Ok(Some(auth)) => {
                    session.load_profile(&auth.user.id).await;
                }
                Ok(None) => debug!("No existing session"),
                Err(e) => error!(error = %e, "Error initializing auth"),
            }
        }
        session.auth_ready.set(true);

        let handle = tokio::spawn(listen(Arc::downgrade(&session), events));
        *session.listener.lock() = Some(handle);

        session
    }

    /// Stops following auth state changes.
    pub fn shutdown(&self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
            debug!("Auth listener stopped");
        }
    }

    async fn handle_event(&self, event: AuthEvent) {
        debug!(change = ?event.change, "Auth state changed");
        match event.session {
            Some(auth) => {
                self.load_profile(&auth.user.id).await;
            }
            None => self.current_user.set(None),
        }
    }

    /// Fetches the profile row; failures leave `current_user` as it was.
    async fn load_profile(&self, user_id: &str) -> bool {
        let query = Query::table(tables::PROFILES).select("*").eq("id", user_id);
        let row = match self.backend.select(&query).await {
            Ok(rows) => rows.into_iter().next(),
            Err(e) => {
                warn!(error = %e, user_id, "Failed to load user profile");
                return false;
            }
        };

        let Some(row) = row else {
            warn!(user_id, "No profile for user");
            return false;
        };

        match backend::decode_row::<User>("profile", row) {
            Ok(user) => {
                debug!(user_id, role = %user.role, "Profile loaded");
                self.current_user.set(Some(user));
                true
            }
            Err(e) => {
                warn!(error = %e, user_id, "Unreadable user profile");
                false
            }
        }
    }

    #[instrument(name = "session_sign_up", skip_all, fields(email = %data.email))]
    pub async fn sign_up(&self, data: &SignupData) -> AuthOutcome {
        let _loading = self.loading.enter();

        let identity = match self.backend.sign_up(&data.credentials()).await {
            Ok(identity) => identity,
            Err(e) => {
                info!(error = %e, "Sign up rejected");
                return AuthOutcome::failed(e.user_message());
            }
        };

        let Some(identity) = identity else {
            return AuthOutcome::ok();
        };

        let profile = NewProfile {
            id: &identity.id,
            email: &data.email,
            full_name: &data.full_name,
            role: Role::Employee,
        };
        let row = match backend::encode("profile", &profile) {
            Ok(row) => row,
            Err(e) => return AuthOutcome::failed(e.user_message()),
        };

        if let Err(e) = self.backend.insert(tables::PROFILES, row).await {
            // the credential already exists at this point and is not rolled back
            error!(error = %e, user_id = %identity.id, "Profile insert failed after sign up");
            return AuthOutcome::failed(e.user_message());
        }

        info!(user_id = %identity.id, "User signed up");
        AuthOutcome::ok()
    }

    #[instrument(name = "session_sign_in", skip_all, fields(email = %credentials.email))]
    pub async fn sign_in(&self, credentials: &Credentials) -> AuthOutcome {
        let _loading = self.loading.enter();

        let auth = match self.backend.sign_in_with_password(credentials).await {
            Ok(auth) => auth,
            Err(e) => {
                info!(error = %e, "Sign in rejected");
                return AuthOutcome::failed(e.user_message());
            }
        };

        self.load_profile(&auth.user.id).await;
        info!(user_id = %auth.user.id, "Signed in");

        self.navigator.navigate(Route::LANDING);
        AuthOutcome::ok()
    }

    /// Always ends signed out locally, whatever the backend says.
    pub async fn sign_out(&self) {
        if let Err(e) = self.backend.sign_out().await {
            warn!(error = %e, "Backend sign out failed");
        }
        self.current_user.set(None);
        self.navigator.navigate(Route::Login);
        info!("Signed out");
    }

    pub fn current_user(&self) -> Option<User> {
        self.current_user.get()
    }

    pub fn is_authenticated(&self) -> bool {
        self.current_user.with(|u| u.is_some())
    }

    pub fn is_admin(&self) -> bool {
        self.current_user.with(|u| u.as_ref().is_some_and(User::is_admin))
    }

    pub fn is_loading(&self) -> bool {
        self.loading.is_busy()
    }

    pub fn is_auth_ready(&self) -> bool {
        self.auth_ready.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<User>> {
        self.current_user.subscribe()
    }

    /// Resolves once the initial session lookup has finished.
    pub async fn wait_until_ready(&self) {
        let mut ready = self.auth_ready.subscribe();
        while !*ready.borrow_and_update() {
            if ready.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn listen(session: Weak<Session>, mut events: broadcast::Receiver<AuthEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let Some(session) = session.upgrade() else {
                    break;
                };
                session.handle_event(event).await;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Auth listener lagged behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("Auth listener finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::models::AuthChange;
    use serde_json::json;
    use std::time::Duration;

    fn profile(id: &str, role: &str) -> serde_json::Value {
        json!({
            "id": id,
            "email": format!("{id}@example.com"),
            "full_name": format!("User {id}"),
            "role": role
        })
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn start(backend: MemoryBackend) -> (Arc<MemoryBackend>, Arc<Navigator>, Arc<Session>) {
        let backend = Arc::new(backend);
        let navigator = Arc::new(Navigator::new());
        let session = Session::initialize(backend.clone(), navigator.clone()).await;
        (backend, navigator, session)
    }

    #[tokio::test]
    async fn initialize_without_session() {
        let (_, _, session) = start(MemoryBackend::new()).await;
        assert!(session.is_auth_ready());
        assert!(!session.is_loading());
        assert!(!session.is_authenticated());
        assert!(!session.is_admin());
        session.wait_until_ready().await;
    }

    #[tokio::test]
    async fn initialize_restores_profile() {
        let backend = MemoryBackend::new().with_session("U1");
        backend.seed(tables::PROFILES, vec![profile("U1", "admin")]);

        let (_, _, session) = start(backend).await;
        assert!(session.is_authenticated());
        assert!(session.is_admin());
        assert_eq!(session.current_user().unwrap().full_name, "User U1");
    }

    #[tokio::test]
    async fn initialize_survives_lookup_errors() {
        let backend = MemoryBackend::new();
        backend.fail("get_session");
        let (_, _, session) = start(backend).await;
        assert!(session.is_auth_ready());
        assert!(!session.is_loading());
        assert!(session.current_user().is_none());

        let backend = MemoryBackend::new().with_session("U1");
        backend.fail("select:profiles");
        let (_, _, session) = start(backend).await;
        assert!(session.is_auth_ready());
        assert!(session.current_user().is_none());
    }

    #[tokio::test]
    async fn sign_up_creates_employee_profile() {
        let (backend, _, session) = start(MemoryBackend::new()).await;
        let outcome = session
            .sign_up(&SignupData {
                email: "new@example.com".into(),
                password: "secret123".into(),
                full_name: "New Person".into(),
            })
            .await;
        assert_eq!(outcome, AuthOutcome::ok());

        let rows = backend.rows(tables::PROFILES);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["role"], "employee");
        assert_eq!(rows[0]["full_name"], "New Person");
        assert!(rows[0].get("password").is_none());
        assert!(!session.is_loading());
    }

    #[tokio::test]
    async fn sign_up_reports_profile_failure() {
        let backend = MemoryBackend::new();
        backend.fail("insert:profiles");
        let (backend, _, session) = start(backend).await;

        let outcome = session
            .sign_up(&SignupData {
                email: "new@example.com".into(),
                password: "secret123".into(),
                full_name: "New Person".into(),
            })
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("insert:profiles unavailable"));
        assert!(backend.rows(tables::PROFILES).is_empty());
    }

    #[tokio::test]
    async fn sign_up_duplicate_email_fails_without_profile() {
        let backend = MemoryBackend::new().with_account("taken@example.com", "pw", "U1");
        let (backend, _, session) = start(backend).await;
        let outcome = session
            .sign_up(&SignupData {
                email: "taken@example.com".into(),
                password: "pw".into(),
                full_name: "Dup".into(),
            })
            .await;
        assert_eq!(outcome, AuthOutcome::failed("User already registered"));
        assert!(backend.rows(tables::PROFILES).is_empty());
    }

    #[tokio::test]
    async fn sign_in_with_wrong_password_does_not_navigate() {
        let backend = MemoryBackend::new().with_account("jane@example.com", "right", "U1");
        let (_, navigator, session) = start(backend).await;

        let outcome = session
            .sign_in(&Credentials {
                email: "jane@example.com".into(),
                password: "wrong".into(),
            })
            .await;
        assert_eq!(outcome, AuthOutcome::failed("Invalid login credentials"));
        assert_eq!(navigator.current(), Route::Login);
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn sign_in_loads_profile_and_lands_on_dashboard() {
        let backend = MemoryBackend::new().with_account("jane@example.com", "right", "U1");
        backend.seed(tables::PROFILES, vec![profile("U1", "employee")]);
        let (_, navigator, session) = start(backend).await;
        let mut routes = navigator.subscribe();

        let outcome = session
            .sign_in(&Credentials {
                email: "jane@example.com".into(),
                password: "right".into(),
            })
            .await;
        assert!(outcome.success);
        assert!(routes.has_changed().unwrap());
        assert_eq!(*routes.borrow_and_update(), Route::Dashboard);
        assert!(session.is_authenticated());
        assert!(!session.is_admin());
    }

    #[tokio::test]
    async fn sign_out_clears_user_even_if_backend_fails() {
        let backend = MemoryBackend::new().with_session("U1");
        backend.seed(tables::PROFILES, vec![profile("U1", "employee")]);
        backend.fail("sign_out");
        let (_, navigator, session) = start(backend).await;
        navigator.navigate(Route::Tasks);
        assert!(session.is_authenticated());

        session.sign_out().await;
        assert!(!session.is_authenticated());
        assert_eq!(navigator.current(), Route::Login);
    }

    #[tokio::test]
    async fn external_auth_events_update_user() {
        let backend = MemoryBackend::new();
        backend.seed(tables::PROFILES, vec![profile("U2", "admin")]);
        let (backend, _, session) = start(backend).await;
        let mut users = session.subscribe();

        backend.emit(AuthChange::SignedIn, Some("U2"));
        users.changed().await.unwrap();
        assert!(session.is_admin());

        backend.emit(AuthChange::SignedOut, None);
        users.changed().await.unwrap();
        assert!(session.current_user().is_none());
    }

    #[tokio::test]
    async fn shutdown_stops_following_events() {
        let backend = MemoryBackend::new();
        backend.seed(tables::PROFILES, vec![profile("U2", "employee")]);
        let (backend, _, session) = start(backend).await;
        assert_eq!(backend.subscriber_count(), 1);

        session.shutdown();
        settle().await;
        assert_eq!(backend.subscriber_count(), 0);

        backend.emit(AuthChange::SignedIn, Some("U2"));
        settle().await;
        assert!(session.current_user().is_none());
    }
}
