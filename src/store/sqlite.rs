//! SQLite-backed store.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{
    now_string, plan_crud, AgentProfile, CrudOperation, CrudOutcome, EntityKind, Intent,
    InteractionEntry, InteractionLog, LinkedResource, NewIntent, Record, RecordChange, Repository,
    Store, StoreError, Transaction, UserApp, UserId,
};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS intents (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    keywords TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_intents_owner_name ON intents(COALESCE(user_id, ''), name);

CREATE TABLE IF NOT EXISTS agent_profiles (
    user_id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    model TEXT NOT NULL,
    interaction_count INTEGER NOT NULL DEFAULT 0,
    last_interaction TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_interactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    user_input TEXT NOT NULL,
    agent_response TEXT NOT NULL,
    context TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (user_id) REFERENCES agent_profiles(user_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS user_apps (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    intent TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    interaction_count INTEGER NOT NULL DEFAULT 0,
    last_used TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (user_id, name)
);

CREATE TABLE IF NOT EXISTS app_interactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    app_id TEXT NOT NULL,
    user_input TEXT NOT NULL,
    context TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    FOREIGN KEY (app_id) REFERENCES user_apps(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_app_interactions_app ON app_interactions(app_id, id);

CREATE TABLE IF NOT EXISTS app_resources (
    app_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (app_id, kind, resource_id),
    FOREIGN KEY (app_id) REFERENCES user_apps(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS records (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    data TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_owner_kind ON records(user_id, kind);
"#;

/// SQLite store. Plain operations run on the blocking pool; a transaction
/// owns the connection until it commits or rolls back.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Database(format!("Failed to create store dir: {}", e)))?;
        }

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            conn.execute_batch(SCHEMA)?;
            Self::run_migrations(&conn)?;
            Ok::<_, StoreError>(conn)
        })
        .await
        .map_err(|e| StoreError::Database(format!("Task join error: {}", e)))??;

        tracing::debug!("Opened SQLite store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Bring databases created before `last_results` existed up to date.
    fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
        let has_last_results: bool = conn
            .prepare("SELECT 1 FROM pragma_table_info('user_apps') WHERE name = 'last_results'")?
            .exists([])?;

        if !has_last_results {
            tracing::info!("Running migration: adding 'last_results' column to user_apps table");
            conn.execute("ALTER TABLE user_apps ADD COLUMN last_results TEXT", [])?;
        }

        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Database(format!("Task join error: {}", e)))?
    }
}

#[async_trait]
impl Repository for SqliteStore {
    async fn intent_catalog(&self, user: &UserId) -> Result<Vec<Intent>, StoreError> {
        let user = user.clone();
        self.with_conn(move |conn| ops::intent_catalog(conn, &user)).await
    }

    async fn find_intent(&self, user: &UserId, name: &str) -> Result<Option<Intent>, StoreError> {
        let (user, name) = (user.clone(), name.to_string());
        self.with_conn(move |conn| ops::find_intent(conn, &user, &name))
            .await
    }

    async fn create_intent(
        &self,
        user: &UserId,
        intent: NewIntent,
    ) -> Result<(Intent, bool), StoreError> {
        let user = user.clone();
        self.with_conn(move |conn| ops::insert_intent(conn, Some(&user), intent))
            .await
    }

    async fn add_global_intent(&self, intent: NewIntent) -> Result<Intent, StoreError> {
        self.with_conn(move |conn| ops::insert_intent(conn, None, intent).map(|(i, _)| i))
            .await
    }

    async fn agent_profile(
        &self,
        user: &UserId,
        default_model: &str,
    ) -> Result<AgentProfile, StoreError> {
        let (user, model) = (user.clone(), default_model.to_string());
        self.with_conn(move |conn| ops::agent_profile(conn, &user, &model))
            .await
    }

    async fn log_interaction(
        &self,
        user: &UserId,
        entry: InteractionLog,
    ) -> Result<AgentProfile, StoreError> {
        let user = user.clone();
        self.with_conn(move |conn| ops::log_interaction(conn, &user, &entry))
            .await
    }

    async fn get_or_create_app(
        &self,
        user: &UserId,
        name: &str,
        intent: &str,
    ) -> Result<(UserApp, bool), StoreError> {
        let (user, name, intent) = (user.clone(), name.to_string(), intent.to_string());
        self.with_conn(move |conn| ops::get_or_create_app(conn, &user, &name, &intent))
            .await
    }

    async fn append_interaction(
        &self,
        user: &UserId,
        app_id: Uuid,
        entry: InteractionEntry,
        keep: usize,
    ) -> Result<UserApp, StoreError> {
        let user = user.clone();
        self.with_conn(move |conn| ops::append_interaction(conn, &user, app_id, &entry, keep))
            .await
    }

    async fn record_results(
        &self,
        user: &UserId,
        app_id: Uuid,
        results: Value,
    ) -> Result<(), StoreError> {
        let user = user.clone();
        self.with_conn(move |conn| ops::record_results(conn, &user, app_id, &results))
            .await
    }

    async fn link_resource(
        &self,
        user: &UserId,
        app_id: Uuid,
        resource: LinkedResource,
    ) -> Result<(), StoreError> {
        let user = user.clone();
        self.with_conn(move |conn| ops::link_resource(conn, &user, app_id, &resource))
            .await
    }

    async fn get_app(&self, user: &UserId, app_id: Uuid) -> Result<Option<UserApp>, StoreError> {
        let user = user.clone();
        self.with_conn(move |conn| ops::load_app(conn, &user, app_id))
            .await
    }

    async fn perform(
        &self,
        user: &UserId,
        op: CrudOperation,
        kind: EntityKind,
        data: Map<String, Value>,
    ) -> Result<CrudOutcome, StoreError> {
        let user = user.clone();
        self.with_conn(move |conn| ops::perform(conn, &user, op, kind, &data))
            .await
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn is_persistent(&self) -> bool {
        true
    }

    fn repository(&self) -> &dyn Repository {
        self
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let guard = Arc::clone(&self.conn).lock_owned().await;
        let (guard, begun) = run_blocking(guard, |conn| {
            // A transaction abandoned mid-statement leaves the connection open.
            if !conn.is_autocommit() {
                conn.execute_batch("ROLLBACK")?;
            }
            conn.execute_batch("BEGIN IMMEDIATE").map_err(StoreError::from)
        })
        .await?;
        begun?;
        Ok(Box::new(SqliteTransaction {
            conn: Mutex::new(Some(guard)),
        }))
    }
}

type ConnGuard = OwnedMutexGuard<Connection>;

/// Run `f` on the blocking pool against a held connection and hand the
/// connection back. A panic in `f` becomes an error so the guard is never lost.
async fn run_blocking<T, F>(guard: ConnGuard, f: F) -> Result<(ConnGuard, Result<T, StoreError>), StoreError>
where
    F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(&guard)))
            .unwrap_or_else(|_| Err(StoreError::Database("statement panicked".to_string())));
        (guard, result)
    })
    .await
    .map_err(|e| StoreError::Database(format!("Task join error: {}", e)))
}

/// Open `BEGIN IMMEDIATE` transaction holding the connection until it
/// commits or rolls back. `None` once finished.
struct SqliteTransaction {
    conn: Mutex<Option<ConnGuard>>,
}

impl SqliteTransaction {
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let mut slot = self.conn.lock().await;
        let guard = slot
            .take()
            .ok_or_else(|| StoreError::Database("Transaction already finished".to_string()))?;
        let (guard, result) = run_blocking(guard, f).await?;
        *slot = Some(guard);
        result
    }

    async fn finish(&self, statement: &'static str) -> Result<(), StoreError> {
        let guard = self
            .conn
            .lock()
            .await
            .take()
            .ok_or_else(|| StoreError::Database("Transaction already finished".to_string()))?;
        let (_guard, result) =
            run_blocking(guard, move |conn| conn.execute_batch(statement).map_err(StoreError::from))
                .await?;
        result
    }
}

#[async_trait]
impl Repository for SqliteTransaction {
    async fn intent_catalog(&self, user: &UserId) -> Result<Vec<Intent>, StoreError> {
        let user = user.clone();
        self.with_conn(move |conn| ops::intent_catalog(conn, &user)).await
    }

    async fn find_intent(&self, user: &UserId, name: &str) -> Result<Option<Intent>, StoreError> {
        let (user, name) = (user.clone(), name.to_string());
        self.with_conn(move |conn| ops::find_intent(conn, &user, &name))
            .await
    }

    async fn create_intent(
        &self,
        user: &UserId,
        intent: NewIntent,
    ) -> Result<(Intent, bool), StoreError> {
        let user = user.clone();
        self.with_conn(move |conn| ops::insert_intent(conn, Some(&user), intent))
            .await
    }

    async fn add_global_intent(&self, intent: NewIntent) -> Result<Intent, StoreError> {
        self.with_conn(move |conn| ops::insert_intent(conn, None, intent).map(|(i, _)| i))
            .await
    }

    async fn agent_profile(
        &self,
        user: &UserId,
        default_model: &str,
    ) -> Result<AgentProfile, StoreError> {
        let (user, model) = (user.clone(), default_model.to_string());
        self.with_conn(move |conn| ops::agent_profile(conn, &user, &model))
            .await
    }

    async fn log_interaction(
        &self,
        user: &UserId,
        entry: InteractionLog,
    ) -> Result<AgentProfile, StoreError> {
        let user = user.clone();
        self.with_conn(move |conn| ops::log_interaction(conn, &user, &entry))
            .await
    }

    async fn get_or_create_app(
        &self,
        user: &UserId,
        name: &str,
        intent: &str,
    ) -> Result<(UserApp, bool), StoreError> {
        let (user, name, intent) = (user.clone(), name.to_string(), intent.to_string());
        self.with_conn(move |conn| ops::get_or_create_app(conn, &user, &name, &intent))
            .await
    }

    async fn append_interaction(
        &self,
        user: &UserId,
        app_id: Uuid,
        entry: InteractionEntry,
        keep: usize,
    ) -> Result<UserApp, StoreError> {
        let user = user.clone();
        self.with_conn(move |conn| ops::append_interaction(conn, &user, app_id, &entry, keep))
            .await
    }

    async fn record_results(
        &self,
        user: &UserId,
        app_id: Uuid,
        results: Value,
    ) -> Result<(), StoreError> {
        let user = user.clone();
        self.with_conn(move |conn| ops::record_results(conn, &user, app_id, &results))
            .await
    }

    async fn link_resource(
        &self,
        user: &UserId,
        app_id: Uuid,
        resource: LinkedResource,
    ) -> Result<(), StoreError> {
        let user = user.clone();
        self.with_conn(move |conn| ops::link_resource(conn, &user, app_id, &resource))
            .await
    }

    async fn get_app(&self, user: &UserId, app_id: Uuid) -> Result<Option<UserApp>, StoreError> {
        let user = user.clone();
        self.with_conn(move |conn| ops::load_app(conn, &user, app_id))
            .await
    }

    async fn perform(
        &self,
        user: &UserId,
        op: CrudOperation,
        kind: EntityKind,
        data: Map<String, Value>,
    ) -> Result<CrudOutcome, StoreError> {
        let user = user.clone();
        self.with_conn(move |conn| ops::perform(conn, &user, op, kind, &data))
            .await
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    fn repository(&self) -> &dyn Repository {
        self
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        let Some(guard) = self.conn.get_mut().take() else {
            return;
        };
        let rollback = move |conn: ConnGuard| {
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                tracing::warn!("Failed to roll back abandoned transaction: {}", e);
            }
        };
        // The connection stays locked until the rollback has run.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || rollback(guard));
            }
            Err(_) => rollback(guard),
        }
    }
}

/// Statements shared by the store and its transactions.
mod ops {
    use super::*;

    const INTENT_COLUMNS: &str = "id, user_id, name, description, keywords, created_at";

    fn intent_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Intent> {
        let id: String = row.get(0)?;
        let keywords: String = row.get(4)?;
        Ok(Intent {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            user_id: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            keywords: serde_json::from_str(&keywords).unwrap_or_default(),
            created_at: row.get(5)?,
        })
    }

    pub fn intent_catalog(conn: &Connection, user: &UserId) -> Result<Vec<Intent>, StoreError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM intents
             WHERE user_id IS NULL OR user_id = ?1
             ORDER BY created_at, name",
            INTENT_COLUMNS
        ))?;
        let intents = stmt
            .query_map(params![user.as_str()], intent_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(intents)
    }

    pub fn find_intent(
        conn: &Connection,
        user: &UserId,
        name: &str,
    ) -> Result<Option<Intent>, StoreError> {
        // Own intents sort first (`user_id IS NULL` is 0 for them).
        let intent = conn
            .query_row(
                &format!(
                    "SELECT {} FROM intents
                     WHERE name = ?2 AND (user_id = ?1 OR user_id IS NULL)
                     ORDER BY user_id IS NULL
                     LIMIT 1",
                    INTENT_COLUMNS
                ),
                params![user.as_str(), name],
                intent_from_row,
            )
            .optional()?;
        Ok(intent)
    }

    pub fn insert_intent(
        conn: &Connection,
        owner: Option<&UserId>,
        intent: NewIntent,
    ) -> Result<(Intent, bool), StoreError> {
        let owner = owner.map(UserId::as_str);
        let existing = conn
            .query_row(
                &format!(
                    "SELECT {} FROM intents WHERE name = ?1 AND user_id IS ?2",
                    INTENT_COLUMNS
                ),
                params![&intent.name, owner],
                intent_from_row,
            )
            .optional()?;
        if let Some(existing) = existing {
            return Ok((existing, false));
        }

        let created = Intent {
            id: Uuid::new_v4(),
            user_id: owner.map(str::to_string),
            name: intent.name,
            description: intent.description,
            keywords: intent.keywords,
            created_at: now_string(),
        };
        conn.execute(
            "INSERT INTO intents (id, user_id, name, description, keywords, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                created.id.to_string(),
                &created.user_id,
                &created.name,
                &created.description,
                serde_json::to_string(&created.keywords)?,
                &created.created_at,
            ],
        )?;
        Ok((created, true))
    }

    fn load_profile(conn: &Connection, user: &UserId) -> Result<Option<AgentProfile>, StoreError> {
        let profile = conn
            .query_row(
                "SELECT user_id, name, model, interaction_count, last_interaction
                 FROM agent_profiles WHERE user_id = ?1",
                params![user.as_str()],
                |row| {
                    Ok(AgentProfile {
                        user_id: row.get(0)?,
                        name: row.get(1)?,
                        model: row.get(2)?,
                        interaction_count: row.get::<_, i64>(3)? as u64,
                        last_interaction: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(profile)
    }

    pub fn agent_profile(
        conn: &Connection,
        user: &UserId,
        default_model: &str,
    ) -> Result<AgentProfile, StoreError> {
        conn.execute(
            "INSERT OR IGNORE INTO agent_profiles (user_id, name, model, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                user.as_str(),
                format!("{}'s AI Agent", user),
                default_model,
                now_string()
            ],
        )?;
        load_profile(conn, user)?.ok_or_else(|| StoreError::NotFound {
            kind: "AgentProfile",
            id: user.to_string(),
        })
    }

    pub fn log_interaction(
        conn: &Connection,
        user: &UserId,
        entry: &InteractionLog,
    ) -> Result<AgentProfile, StoreError> {
        let now = now_string();
        let changed = conn.execute(
            "UPDATE agent_profiles
             SET interaction_count = interaction_count + 1, last_interaction = ?2
             WHERE user_id = ?1",
            params![user.as_str(), &now],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                kind: "AgentProfile",
                id: user.to_string(),
            });
        }
        conn.execute(
            "INSERT INTO agent_interactions (user_id, user_input, agent_response, context, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user.as_str(),
                &entry.user_input,
                serde_json::to_string(&entry.agent_response)?,
                serde_json::to_string(&entry.context)?,
                &now,
            ],
        )?;
        load_profile(conn, user)?.ok_or_else(|| StoreError::NotFound {
            kind: "AgentProfile",
            id: user.to_string(),
        })
    }

    fn app_not_found(app_id: Uuid) -> StoreError {
        StoreError::NotFound {
            kind: "UserApp",
            id: app_id.to_string(),
        }
    }

    pub fn load_app(
        conn: &Connection,
        user: &UserId,
        app_id: Uuid,
    ) -> Result<Option<UserApp>, StoreError> {
        let app_id_str = app_id.to_string();
        let app = conn
            .query_row(
                "SELECT id, user_id, name, description, intent, is_active, interaction_count,
                        last_used, last_results, created_at, updated_at
                 FROM user_apps WHERE id = ?1 AND user_id = ?2",
                params![&app_id_str, user.as_str()],
                |row| {
                    let id: String = row.get(0)?;
                    let last_results: Option<String> = row.get(8)?;
                    Ok(UserApp {
                        id: Uuid::parse_str(&id).unwrap_or_default(),
                        user_id: row.get(1)?,
                        name: row.get(2)?,
                        description: row.get(3)?,
                        intent: row.get(4)?,
                        is_active: row.get::<_, i32>(5)? != 0,
                        interaction_count: row.get::<_, i64>(6)? as u64,
                        last_used: row.get(7)?,
                        interactions: vec![],
                        last_results: last_results.and_then(|s| serde_json::from_str(&s).ok()),
                        resources: vec![],
                        created_at: row.get(9)?,
                        updated_at: row.get(10)?,
                    })
                },
            )
            .optional()?;

        let Some(mut app) = app else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT user_input, context, timestamp FROM app_interactions
             WHERE app_id = ?1 ORDER BY id",
        )?;
        app.interactions = stmt
            .query_map(params![&app_id_str], |row| {
                let context: String = row.get(1)?;
                Ok(InteractionEntry {
                    input: row.get(0)?,
                    context: serde_json::from_str(&context).unwrap_or(Value::Null),
                    timestamp: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT kind, resource_id FROM app_resources
             WHERE app_id = ?1 ORDER BY created_at, kind, resource_id",
        )?;
        app.resources = stmt
            .query_map(params![&app_id_str], |row| {
                Ok(LinkedResource {
                    kind: row.get(0)?,
                    resource_id: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(app))
    }

    pub fn get_or_create_app(
        conn: &Connection,
        user: &UserId,
        name: &str,
        intent: &str,
    ) -> Result<(UserApp, bool), StoreError> {
        let now = now_string();
        let existing: Option<String> = conn
            .query_row(
                "UPDATE user_apps SET last_used = ?3, updated_at = ?3
                 WHERE user_id = ?1 AND name = ?2
                 RETURNING id",
                params![user.as_str(), name, &now],
                |row| row.get(0),
            )
            .optional()?;

        let (app_id, created) = match existing {
            Some(id) => (Uuid::parse_str(&id).unwrap_or_default(), false),
            None => {
                let app = UserApp::new(user, name, intent);
                conn.execute(
                    "INSERT INTO user_apps (id, user_id, name, description, intent, is_active,
                                            interaction_count, last_used, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 1, 0, ?6, ?7, ?8)",
                    params![
                        app.id.to_string(),
                        &app.user_id,
                        &app.name,
                        &app.description,
                        &app.intent,
                        &app.last_used,
                        &app.created_at,
                        &app.updated_at,
                    ],
                )?;
                (app.id, true)
            }
        };

        let app = load_app(conn, user, app_id)?.ok_or_else(|| app_not_found(app_id))?;
        Ok((app, created))
    }

    pub fn append_interaction(
        conn: &Connection,
        user: &UserId,
        app_id: Uuid,
        entry: &InteractionEntry,
        keep: usize,
    ) -> Result<UserApp, StoreError> {
        let app_id_str = app_id.to_string();
        let changed = conn.execute(
            "UPDATE user_apps
             SET interaction_count = interaction_count + 1, last_used = ?3, updated_at = ?4
             WHERE id = ?1 AND user_id = ?2",
            params![&app_id_str, user.as_str(), &entry.timestamp, now_string()],
        )?;
        if changed == 0 {
            return Err(app_not_found(app_id));
        }

        conn.execute(
            "INSERT INTO app_interactions (app_id, user_input, context, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                &app_id_str,
                &entry.input,
                serde_json::to_string(&entry.context)?,
                &entry.timestamp,
            ],
        )?;

        if keep > 0 {
            conn.execute(
                "DELETE FROM app_interactions
                 WHERE app_id = ?1 AND id NOT IN (
                     SELECT id FROM app_interactions WHERE app_id = ?1 ORDER BY id DESC LIMIT ?2
                 )",
                params![&app_id_str, keep as i64],
            )?;
        }

        load_app(conn, user, app_id)?.ok_or_else(|| app_not_found(app_id))
    }

    pub fn record_results(
        conn: &Connection,
        user: &UserId,
        app_id: Uuid,
        results: &Value,
    ) -> Result<(), StoreError> {
        let changed = conn.execute(
            "UPDATE user_apps SET last_results = ?3, updated_at = ?4
             WHERE id = ?1 AND user_id = ?2",
            params![
                app_id.to_string(),
                user.as_str(),
                serde_json::to_string(results)?,
                now_string()
            ],
        )?;
        if changed == 0 {
            return Err(app_not_found(app_id));
        }
        Ok(())
    }

    pub fn link_resource(
        conn: &Connection,
        user: &UserId,
        app_id: Uuid,
        resource: &LinkedResource,
    ) -> Result<(), StoreError> {
        let owned: bool = conn
            .prepare("SELECT 1 FROM user_apps WHERE id = ?1 AND user_id = ?2")?
            .exists(params![app_id.to_string(), user.as_str()])?;
        if !owned {
            return Err(app_not_found(app_id));
        }
        conn.execute(
            "INSERT OR IGNORE INTO app_resources (app_id, kind, resource_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                app_id.to_string(),
                &resource.kind,
                &resource.resource_id,
                now_string()
            ],
        )?;
        Ok(())
    }

    fn load_records(
        conn: &Connection,
        user: &UserId,
        kind: EntityKind,
    ) -> Result<Vec<Record>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT id, data, created_at, updated_at FROM records
             WHERE user_id = ?1 AND kind = ?2 ORDER BY created_at, id",
        )?;
        let records = stmt
            .query_map(params![user.as_str(), kind.as_str()], |row| {
                let id: String = row.get(0)?;
                let data: String = row.get(1)?;
                Ok(Record {
                    id: Uuid::parse_str(&id).unwrap_or_default(),
                    user_id: user.to_string(),
                    kind,
                    data: serde_json::from_str(&data).unwrap_or_default(),
                    created_at: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn perform(
        conn: &Connection,
        user: &UserId,
        op: CrudOperation,
        kind: EntityKind,
        data: &Map<String, Value>,
    ) -> Result<CrudOutcome, StoreError> {
        let records = load_records(conn, user, kind)?;
        let (outcome, change) = plan_crud(kind, op, data, &records, user);
        match change {
            Some(RecordChange::Insert(record)) => {
                conn.execute(
                    "INSERT INTO records (id, user_id, kind, data, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        record.id.to_string(),
                        &record.user_id,
                        kind.as_str(),
                        serde_json::to_string(&record.data)?,
                        &record.created_at,
                        &record.updated_at,
                    ],
                )?;
            }
            Some(RecordChange::Update(record)) => {
                conn.execute(
                    "UPDATE records SET data = ?2, updated_at = ?3 WHERE id = ?1",
                    params![
                        record.id.to_string(),
                        serde_json::to_string(&record.data)?,
                        &record.updated_at,
                    ],
                )?;
            }
            Some(RecordChange::Delete(id)) => {
                conn.execute("DELETE FROM records WHERE id = ?1", params![id.to_string()])?;
            }
            None => {}
        }
        Ok(outcome)
    }
}
