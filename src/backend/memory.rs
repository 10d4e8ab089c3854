use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use super::query::{Order, Query, ensure_patch};
use super::{AuthApi, TableApi};
use crate::error::{PortalError, PortalResult};
use crate::models::{AuthChange, AuthEvent, AuthIdentity, AuthSession, Credentials};

#[derive(Default)]
struct State {
    /// email -> (password, user id)
    accounts: HashMap<String, (String, String)>,
    session: Option<AuthSession>,
    tables: HashMap<String, Vec<Value>>,
    failing: HashSet<String>,
    next_id: u64,
}

impl State {
    fn check(&self, op: &str) -> PortalResult<()> {
        if self.failing.contains(op) {
            return Err(PortalError::Api {
                status: 503,
                message: format!("{op} unavailable"),
                code: None,
            });
        }
        Ok(())
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Whole backend in memory, for tests.
///
/// Operations can be made to fail by name: `get_session`, `sign_up`,
/// `sign_in`, `sign_out`, or `<select|insert|update|delete>:<table>`.
pub(crate) struct MemoryBackend {
    state: Mutex<State>,
    events: broadcast::Sender<AuthEvent>,
}

fn epoch() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

impl MemoryBackend {
    pub(crate) fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }

    pub(crate) fn with_account(self, email: &str, password: &str, user_id: &str) -> Self {
        self.state
            .lock()
            .accounts
            .insert(email.to_string(), (password.to_string(), user_id.to_string()));
        self
    }

    pub(crate) fn with_session(self, user_id: &str) -> Self {
        self.state.lock().session = Some(session_for(user_id, None));
        self
    }

    pub(crate) fn seed(&self, table: &str, rows: Vec<Value>) {
        self.state
            .lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub(crate) fn rows(&self, table: &str) -> Vec<Value> {
        self.state.lock().tables.get(table).cloned().unwrap_or_default()
    }

    pub(crate) fn fail(&self, op: &str) {
        self.state.lock().failing.insert(op.to_string());
    }

    pub(crate) fn recover(&self, op: &str) {
        self.state.lock().failing.remove(op);
    }

    /// Pushes an auth event as if the provider had changed state on its own.
    pub(crate) fn emit(&self, change: AuthChange, user_id: Option<&str>) {
        let session = user_id.map(|id| session_for(id, None));
        self.state.lock().session = session.clone();
        let _ = self.events.send(AuthEvent { change, session });
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }
}

fn session_for(user_id: &str, email: Option<&str>) -> AuthSession {
    AuthSession {
        access_token: format!("access-{user_id}"),
        refresh_token: format!("refresh-{user_id}"),
        expires_at: None,
        user: AuthIdentity {
            id: user_id.to_string(),
            email: email.map(str::to_string),
        },
    }
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

fn resolve_embeds(query: &Query, row: &mut Value, tables: &HashMap<String, Vec<Value>>) {
    for embed in &query.embeds {
        let key = row.get(&embed.foreign_key).cloned();
        let related = tables
            .get(&embed.table)
            .and_then(|rows| rows.iter().find(|r| key.is_some() && r.get("id") == key.as_ref()))
            .map(|r| {
                let picked: Map<String, Value> = embed
                    .columns
                    .iter()
                    .filter_map(|c| r.get(c).map(|v| (c.clone(), v.clone())))
                    .collect();
                Value::Object(picked)
            })
            .unwrap_or(Value::Null);
        if let Some(obj) = row.as_object_mut() {
            obj.insert(embed.alias.clone(), related);
        }
    }
}

#[async_trait]
impl AuthApi for MemoryBackend {
    async fn get_session(&self) -> PortalResult<Option<AuthSession>> {
        let state = self.state.lock();
        state.check("get_session")?;
        Ok(state.session.clone())
    }

    async fn sign_up(&self, credentials: &Credentials) -> PortalResult<Option<AuthIdentity>> {
        let mut state = self.state.lock();
        state.check("sign_up")?;
        if state.accounts.contains_key(&credentials.email) {
            return Err(PortalError::Auth("User already registered".to_string()));
        }
        let id = format!("user-{}", state.next_id());
        state.accounts.insert(
            credentials.email.clone(),
            (credentials.password.clone(), id.clone()),
        );
        Ok(Some(AuthIdentity {
            id,
            email: Some(credentials.email.clone()),
        }))
    }

    async fn sign_in_with_password(&self, credentials: &Credentials) -> PortalResult<AuthSession> {
        let session = {
            let mut state = self.state.lock();
            state.check("sign_in")?;
            let user_id = match state.accounts.get(&credentials.email) {
                Some((password, id)) if *password == credentials.password => id.clone(),
                _ => return Err(PortalError::Auth("Invalid login credentials".to_string())),
            };
            let session = session_for(&user_id, Some(&credentials.email));
            state.session = Some(session.clone());
            session
        };
        let _ = self.events.send(AuthEvent {
            change: AuthChange::SignedIn,
            session: Some(session.clone()),
        });
        Ok(session)
    }

    async fn sign_out(&self) -> PortalResult<()> {
        {
            let mut state = self.state.lock();
            state.session = None;
            state.check("sign_out")?;
        }
        let _ = self.events.send(AuthEvent {
            change: AuthChange::SignedOut,
            session: None,
        });
        Ok(())
    }

    fn on_auth_state_change(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl TableApi for MemoryBackend {
    async fn select(&self, query: &Query) -> PortalResult<Vec<Value>> {
        let state = self.state.lock();
        state.check(&format!("select:{}", query.table))?;

        let mut rows: Vec<Value> = state
            .tables
            .get(&query.table)
            .map(|rows| rows.iter().filter(|r| query.matches(r)).cloned().collect())
            .unwrap_or_default();

        for row in rows.iter_mut() {
            resolve_embeds(query, row, &state.tables);
        }

        if let Some((column, order)) = &query.order {
            rows.sort_by(|a, b| {
                let ord = compare(a.get(column), b.get(column));
                match order {
                    Order::Asc => ord,
                    Order::Desc => ord.reverse(),
                }
            });
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, mut row: Value) -> PortalResult<Value> {
        let mut state = self.state.lock();
        state.check(&format!("insert:{table}"))?;

        let n = state.next_id();
        let stamp = (epoch() + Duration::seconds(n as i64)).to_rfc3339();
        let obj = row
            .as_object_mut()
            .ok_or_else(|| PortalError::InvalidInput("row must be an object".to_string()))?;
        obj.entry("id").or_insert_with(|| Value::String(format!("{table}-{n}")));
        obj.entry("created_at").or_insert_with(|| Value::String(stamp.clone()));
        obj.entry("updated_at").or_insert_with(|| Value::String(stamp));

        state
            .tables
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        Ok(row)
    }

    async fn update(&self, query: &Query, patch: Value) -> PortalResult<Option<Value>> {
        ensure_patch(&patch)?;
        let mut state = self.state.lock();
        state.check(&format!("update:{}", query.table))?;

        let n = state.next_id();
        let stamp = (epoch() + Duration::seconds(n as i64)).to_rfc3339();
        let Some(rows) = state.tables.get_mut(&query.table) else {
            return Ok(None);
        };

        let mut first = None;
        for row in rows.iter_mut().filter(|r| query.matches(r)) {
            if let (Some(obj), Some(fields)) = (row.as_object_mut(), patch.as_object()) {
                for (k, v) in fields {
                    obj.insert(k.clone(), v.clone());
                }
                obj.insert("updated_at".to_string(), Value::String(stamp.clone()));
            }
            if first.is_none() {
                first = Some(row.clone());
            }
        }
        Ok(first)
    }

    async fn delete(&self, query: &Query) -> PortalResult<()> {
        let mut state = self.state.lock();
        state.check(&format!("delete:{}", query.table))?;
        if let Some(rows) = state.tables.get_mut(&query.table) {
            rows.retain(|r| !query.matches(r));
        }
        Ok(())
    }
}
