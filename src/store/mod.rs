//! Persistence collaborator with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `sqlite`: SQLite database
//!
//! Every operation takes the acting user explicitly. Request-scoped work that
//! must be all-or-nothing (the bootstrap phase of a routed request) runs
//! against a [`Transaction`] obtained from [`Store::begin`].

mod memory;
mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Identity of the user a request acts for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid operation: {0}")]
    Invalid(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// A named user goal. Global intents have no owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub name: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub created_at: String,
}

/// Intent proposed by the completion service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewIntent {
    pub name: String,
    pub description: String,
    pub keywords: Vec<String>,
}

/// Per-user AI agent settings and usage counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub user_id: String,
    pub name: String,
    /// Model used for every completion made on this user's behalf
    pub model: String,
    pub interaction_count: u64,
    pub last_interaction: Option<String>,
}

/// One routed request as seen by the agent profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionLog {
    pub user_input: String,
    pub agent_response: Value,
    pub context: Value,
}

/// Entry of an app's rolling interaction log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionEntry {
    pub input: String,
    pub timestamp: String,
    pub context: Value,
}

impl InteractionEntry {
    pub fn now(input: impl Into<String>, context: Value) -> Self {
        Self {
            input: input.into(),
            timestamp: now_string(),
            context,
        }
    }
}

/// A resource produced by a step and attached to an app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedResource {
    pub kind: String,
    pub resource_id: String,
}

/// The durable per-(user, intent) aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserApp {
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    pub description: String,
    pub intent: String,
    pub is_active: bool,
    pub interaction_count: u64,
    pub last_used: String,
    pub interactions: Vec<InteractionEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_results: Option<Value>,
    #[serde(default)]
    pub resources: Vec<LinkedResource>,
    pub created_at: String,
    pub updated_at: String,
}

impl UserApp {
    pub fn new(user: &UserId, name: &str, intent: &str) -> Self {
        let now = now_string();
        Self {
            id: Uuid::new_v4(),
            user_id: user.to_string(),
            name: name.to_string(),
            description: format!("App for intent: {}", intent),
            intent: intent.to_string(),
            is_active: true,
            interaction_count: 0,
            last_used: now.clone(),
            interactions: Vec::new(),
            last_results: None,
            resources: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// Entity kinds reachable through [`Repository::perform`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    RequestType,
    UserRequest,
    DynamicModel,
    DynamicField,
    DynamicInstance,
    DynamicFieldValue,
    Category,
    ProfileType,
    UserProfile,
    UserProfileField,
    AiModel,
    UserInteraction,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::RequestType => "RequestType",
            EntityKind::UserRequest => "UserRequest",
            EntityKind::DynamicModel => "DynamicModel",
            EntityKind::DynamicField => "DynamicField",
            EntityKind::DynamicInstance => "DynamicInstance",
            EntityKind::DynamicFieldValue => "DynamicFieldValue",
            EntityKind::Category => "Category",
            EntityKind::ProfileType => "ProfileType",
            EntityKind::UserProfile => "UserProfile",
            EntityKind::UserProfileField => "UserProfileField",
            EntityKind::AiModel => "AIModels",
            EntityKind::UserInteraction => "UserInteraction",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        const ALL: [EntityKind; 12] = [
            EntityKind::RequestType,
            EntityKind::UserRequest,
            EntityKind::DynamicModel,
            EntityKind::DynamicField,
            EntityKind::DynamicInstance,
            EntityKind::DynamicFieldValue,
            EntityKind::Category,
            EntityKind::ProfileType,
            EntityKind::UserProfile,
            EntityKind::UserProfileField,
            EntityKind::AiModel,
            EntityKind::UserInteraction,
        ];
        ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Fields that identify an existing record on `Create`. An empty key
    /// means every create inserts.
    pub fn natural_key(&self) -> &'static [&'static str] {
        match self {
            EntityKind::RequestType
            | EntityKind::DynamicModel
            | EntityKind::Category
            | EntityKind::ProfileType
            | EntityKind::AiModel => &["name"],
            EntityKind::DynamicField => &["model", "name"],
            EntityKind::DynamicFieldValue => &["instance", "field"],
            EntityKind::UserProfileField => &["profile", "field_name"],
            EntityKind::UserRequest
            | EntityKind::DynamicInstance
            | EntityKind::UserProfile
            | EntityKind::UserInteraction => &[],
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrudOperation {
    Create,
    Read,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrudStatus {
    Success,
    Error,
}

/// `{status, operation, details}` answer of a generic CRUD call.
///
/// `operation` is the operation actually performed: a `Create` that found an
/// existing record by natural key reports `Read`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrudOutcome {
    pub status: CrudStatus,
    pub operation: CrudOperation,
    pub details: Value,
}

impl CrudOutcome {
    pub fn success(operation: CrudOperation, details: Value) -> Self {
        Self {
            status: CrudStatus::Success,
            operation,
            details,
        }
    }

    pub fn failure(operation: CrudOperation, message: impl Into<String>) -> Self {
        Self {
            status: CrudStatus::Error,
            operation,
            details: serde_json::json!({ "error_message": message.into() }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CrudStatus::Success
    }

    /// `details.id` of a single-record answer, or of the first match of a read.
    pub fn id(&self) -> Option<String> {
        let record = match &self.details {
            Value::Array(items) => items.first()?,
            other => other,
        };
        record.get("id").and_then(Value::as_str).map(str::to_string)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.details.get("error_message").and_then(Value::as_str)
    }
}

/// Generic stored entity behind [`Repository::perform`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub user_id: String,
    pub kind: EntityKind,
    pub data: Map<String, Value>,
    pub created_at: String,
    pub updated_at: String,
}

impl Record {
    pub fn new(user: &UserId, kind: EntityKind, mut data: Map<String, Value>) -> Self {
        data.remove("id");
        let now = now_string();
        Self {
            id: Uuid::new_v4(),
            user_id: user.to_string(),
            kind,
            data,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Record fields plus `id`, as handed back to callers.
    pub fn details(&self) -> Value {
        let mut out = self.data.clone();
        out.insert("id".to_string(), Value::String(self.id.to_string()));
        Value::Object(out)
    }

    /// Exact-equality match on every filter entry; `id` matches the record id.
    pub fn matches(&self, filter: &Map<String, Value>) -> bool {
        filter.iter().all(|(key, expected)| match key.as_str() {
            "id" => expected.as_str() == Some(self.id.to_string().as_str()),
            _ => self.data.get(key) == Some(expected),
        })
    }

    /// Merge `changes` into the record (ignoring `id`).
    pub fn apply(&mut self, changes: &Map<String, Value>) {
        for (key, value) in changes {
            if key != "id" {
                self.data.insert(key.clone(), value.clone());
            }
        }
        self.updated_at = now_string();
    }
}

/// Natural-key filter for a create, if every key field is present.
pub fn natural_key_filter(kind: EntityKind, data: &Map<String, Value>) -> Option<Map<String, Value>> {
    let key = kind.natural_key();
    if key.is_empty() {
        return None;
    }
    let mut filter = Map::new();
    for field in key {
        filter.insert(field.to_string(), data.get(*field)?.clone());
    }
    Some(filter)
}

/// Run a CRUD operation over the `(user, kind)` record set.
///
/// Backends supply the current records and apply the returned [`RecordChange`].
pub fn plan_crud(
    kind: EntityKind,
    op: CrudOperation,
    data: &Map<String, Value>,
    records: &[Record],
    user: &UserId,
) -> (CrudOutcome, Option<RecordChange>) {
    match op {
        CrudOperation::Create => {
            if let Some(filter) = natural_key_filter(kind, data) {
                if let Some(existing) = records.iter().find(|r| r.matches(&filter)) {
                    return (
                        CrudOutcome::success(CrudOperation::Read, existing.details()),
                        None,
                    );
                }
            }
            let record = Record::new(user, kind, data.clone());
            (
                CrudOutcome::success(CrudOperation::Create, record.details()),
                Some(RecordChange::Insert(record)),
            )
        }
        CrudOperation::Read => {
            let matches: Vec<Value> = records
                .iter()
                .filter(|r| r.matches(data))
                .map(Record::details)
                .collect();
            if matches.is_empty() {
                (
                    CrudOutcome::failure(op, format!("No {} matching filter", kind)),
                    None,
                )
            } else {
                (CrudOutcome::success(op, Value::Array(matches)), None)
            }
        }
        CrudOperation::Update | CrudOperation::Delete => {
            let Some(id) = data.get("id").and_then(Value::as_str) else {
                return (
                    CrudOutcome::failure(op, format!("{} requires an id", op_name(op))),
                    None,
                );
            };
            let Some(existing) = records.iter().find(|r| r.id.to_string() == id) else {
                return (CrudOutcome::failure(op, format!("{} {} not found", kind, id)), None);
            };
            if op == CrudOperation::Delete {
                return (
                    CrudOutcome::success(op, existing.details()),
                    Some(RecordChange::Delete(existing.id)),
                );
            }
            let mut updated = existing.clone();
            updated.apply(data);
            (
                CrudOutcome::success(op, updated.details()),
                Some(RecordChange::Update(updated)),
            )
        }
    }
}

fn op_name(op: CrudOperation) -> &'static str {
    match op {
        CrudOperation::Create => "create",
        CrudOperation::Read => "read",
        CrudOperation::Update => "update",
        CrudOperation::Delete => "delete",
    }
}

/// A mutation decided by [`plan_crud`].
#[derive(Debug, Clone)]
pub enum RecordChange {
    Insert(Record),
    Update(Record),
    Delete(Uuid),
}

/// Get current timestamp as RFC3339 string.
pub fn now_string() -> String {
    Utc::now().to_rfc3339()
}

/// Persistence operations the router and its agents rely on.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Global intents plus the user's own.
    async fn intent_catalog(&self, user: &UserId) -> Result<Vec<Intent>, StoreError>;

    /// Look up an intent by name, preferring the user's own over a global one.
    async fn find_intent(&self, user: &UserId, name: &str) -> Result<Option<Intent>, StoreError>;

    /// Get or create a user-owned intent. Returns `(intent, created)`.
    async fn create_intent(
        &self,
        user: &UserId,
        intent: NewIntent,
    ) -> Result<(Intent, bool), StoreError>;

    /// Register an intent visible to every user.
    async fn add_global_intent(&self, intent: NewIntent) -> Result<Intent, StoreError>;

    /// Get the user's agent profile, creating it with `default_model` on first use.
    async fn agent_profile(
        &self,
        user: &UserId,
        default_model: &str,
    ) -> Result<AgentProfile, StoreError>;

    /// Record a routed request against the user's agent profile.
    async fn log_interaction(
        &self,
        user: &UserId,
        entry: InteractionLog,
    ) -> Result<AgentProfile, StoreError>;

    /// Get or create the app `(user, name)`; `last_used` is refreshed either
    /// way. Returns `(app, created)`.
    async fn get_or_create_app(
        &self,
        user: &UserId,
        name: &str,
        intent: &str,
    ) -> Result<(UserApp, bool), StoreError>;

    /// Increment the app's interaction counter and append `entry` to its log,
    /// keeping the newest `keep` entries (0 keeps all).
    async fn append_interaction(
        &self,
        user: &UserId,
        app_id: Uuid,
        entry: InteractionEntry,
        keep: usize,
    ) -> Result<UserApp, StoreError>;

    /// Store the result map of the latest completed plan on the app.
    async fn record_results(
        &self,
        user: &UserId,
        app_id: Uuid,
        results: Value,
    ) -> Result<(), StoreError>;

    /// Attach a resource to the app (idempotent).
    async fn link_resource(
        &self,
        user: &UserId,
        app_id: Uuid,
        resource: LinkedResource,
    ) -> Result<(), StoreError>;

    async fn get_app(&self, user: &UserId, app_id: Uuid) -> Result<Option<UserApp>, StoreError>;

    /// Generic CRUD keyed by entity kind and a field map.
    async fn perform(
        &self,
        user: &UserId,
        op: CrudOperation,
        kind: EntityKind,
        data: Map<String, Value>,
    ) -> Result<CrudOutcome, StoreError>;
}

/// A storage backend.
#[async_trait]
pub trait Store: Repository {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    /// View as a plain repository.
    fn repository(&self) -> &dyn Repository;

    /// Start a transaction. Operations through the transaction are invisible
    /// to rollback-free callers until `commit`; concurrent writers wait.
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;
}

/// An open unit of work. Dropping it without `commit` rolls it back.
#[async_trait]
pub trait Transaction: Repository {
    fn repository(&self) -> &dyn Repository;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn create_with_natural_key_reuses_existing_record() {
        let user = UserId::new("u1");
        let data = map(json!({"name": "DeveloperRequest"}));

        let (first, change) = plan_crud(EntityKind::RequestType, CrudOperation::Create, &data, &[], &user);
        assert_eq!(first.operation, CrudOperation::Create);
        let Some(RecordChange::Insert(record)) = change else {
            panic!("expected insert");
        };

        let (second, change) = plan_crud(
            EntityKind::RequestType,
            CrudOperation::Create,
            &data,
            std::slice::from_ref(&record),
            &user,
        );
        assert!(change.is_none());
        assert_eq!(second.operation, CrudOperation::Read);
        assert_eq!(second.id(), first.id());
    }

    #[test]
    fn dynamic_fields_are_keyed_by_model_and_name() {
        let user = UserId::new("u1");
        let a = Record::new(&user, EntityKind::DynamicField, map(json!({"model": "m1", "name": "skill"})));
        let data = map(json!({"model": "m2", "name": "skill"}));
        let (outcome, change) =
            plan_crud(EntityKind::DynamicField, CrudOperation::Create, &data, &[a], &user);
        assert_eq!(outcome.operation, CrudOperation::Create);
        assert!(matches!(change, Some(RecordChange::Insert(_))));
    }

    #[test]
    fn read_filters_and_reports_misses() {
        let user = UserId::new("u1");
        let a = Record::new(&user, EntityKind::Category, map(json!({"name": "Hiring"})));
        let (hit, _) = plan_crud(
            EntityKind::Category,
            CrudOperation::Read,
            &map(json!({"name": "Hiring"})),
            std::slice::from_ref(&a),
            &user,
        );
        assert!(hit.is_success());
        assert_eq!(hit.id(), Some(a.id.to_string()));

        let (miss, _) = plan_crud(
            EntityKind::Category,
            CrudOperation::Read,
            &map(json!({"name": "Travel"})),
            &[a],
            &user,
        );
        assert!(!miss.is_success());
    }

    #[test]
    fn update_requires_a_known_id() {
        let user = UserId::new("u1");
        let a = Record::new(&user, EntityKind::UserRequest, map(json!({"initial_request": "x"})));

        let (missing, change) = plan_crud(
            EntityKind::UserRequest,
            CrudOperation::Update,
            &map(json!({"dynamic_instance": "i"})),
            std::slice::from_ref(&a),
            &user,
        );
        assert!(!missing.is_success());
        assert!(change.is_none());

        let (ok, change) = plan_crud(
            EntityKind::UserRequest,
            CrudOperation::Update,
            &map(json!({"id": a.id.to_string(), "dynamic_instance": "i"})),
            &[a],
            &user,
        );
        assert!(ok.is_success());
        assert_eq!(ok.details["dynamic_instance"], "i");
        assert_eq!(ok.details["initial_request"], "x");
        assert!(matches!(change, Some(RecordChange::Update(_))));
    }

    #[test]
    fn entity_kind_names_round_trip() {
        assert_eq!(EntityKind::parse("AIModels"), Some(EntityKind::AiModel));
        assert_eq!(EntityKind::parse("Category"), Some(EntityKind::Category));
        assert_eq!(EntityKind::parse("Persona"), None);
    }
}
