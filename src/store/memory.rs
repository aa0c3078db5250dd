//! In-memory store (non-persistent).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock};
use uuid::Uuid;

use super::{
    now_string, plan_crud, AgentProfile, CrudOperation, CrudOutcome, EntityKind, Intent,
    InteractionEntry, InteractionLog, LinkedResource, NewIntent, Record, RecordChange, Repository,
    Store, StoreError, Transaction, UserApp, UserId,
};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    intents: Vec<Intent>,
    profiles: HashMap<String, AgentProfile>,
    interaction_logs: Vec<(String, InteractionLog)>,
    apps: HashMap<Uuid, UserApp>,
    records: Vec<Record>,
}

impl MemoryState {
    fn intent_catalog(&self, user: &UserId) -> Vec<Intent> {
        self.intents
            .iter()
            .filter(|i| i.user_id.is_none() || i.user_id.as_deref() == Some(user.as_str()))
            .cloned()
            .collect()
    }

    fn find_intent(&self, user: &UserId, name: &str) -> Option<Intent> {
        let own = self
            .intents
            .iter()
            .find(|i| i.name == name && i.user_id.as_deref() == Some(user.as_str()));
        own.or_else(|| {
            self.intents
                .iter()
                .find(|i| i.name == name && i.user_id.is_none())
        })
        .cloned()
    }

    fn insert_intent(&mut self, owner: Option<&UserId>, intent: NewIntent) -> (Intent, bool) {
        let owner = owner.map(UserId::to_string);
        if let Some(existing) = self
            .intents
            .iter()
            .find(|i| i.name == intent.name && i.user_id == owner)
        {
            return (existing.clone(), false);
        }
        let created = Intent {
            id: Uuid::new_v4(),
            user_id: owner,
            name: intent.name,
            description: intent.description,
            keywords: intent.keywords,
            created_at: now_string(),
        };
        self.intents.push(created.clone());
        (created, true)
    }

    fn agent_profile(&mut self, user: &UserId, default_model: &str) -> AgentProfile {
        self.profiles
            .entry(user.to_string())
            .or_insert_with(|| AgentProfile {
                user_id: user.to_string(),
                name: format!("{}'s AI Agent", user),
                model: default_model.to_string(),
                interaction_count: 0,
                last_interaction: None,
            })
            .clone()
    }

    fn log_interaction(&mut self, user: &UserId, entry: InteractionLog) -> Result<AgentProfile, StoreError> {
        let profile = self
            .profiles
            .get_mut(user.as_str())
            .ok_or_else(|| StoreError::NotFound {
                kind: "AgentProfile",
                id: user.to_string(),
            })?;
        profile.interaction_count += 1;
        profile.last_interaction = Some(now_string());
        let profile = profile.clone();
        self.interaction_logs.push((user.to_string(), entry));
        Ok(profile)
    }

    fn app_mut(&mut self, user: &UserId, app_id: Uuid) -> Result<&mut UserApp, StoreError> {
        self.apps
            .get_mut(&app_id)
            .filter(|a| a.user_id == user.as_str())
            .ok_or_else(|| StoreError::NotFound {
                kind: "UserApp",
                id: app_id.to_string(),
            })
    }

    fn get_or_create_app(&mut self, user: &UserId, name: &str, intent: &str) -> (UserApp, bool) {
        let now = now_string();
        if let Some(app) = self
            .apps
            .values_mut()
            .find(|a| a.user_id == user.as_str() && a.name == name)
        {
            app.last_used = now.clone();
            app.updated_at = now;
            return (app.clone(), false);
        }
        let app = UserApp::new(user, name, intent);
        self.apps.insert(app.id, app.clone());
        (app, true)
    }

    fn append_interaction(
        &mut self,
        user: &UserId,
        app_id: Uuid,
        entry: InteractionEntry,
        keep: usize,
    ) -> Result<UserApp, StoreError> {
        let app = self.app_mut(user, app_id)?;
        app.interaction_count += 1;
        app.last_used = entry.timestamp.clone();
        app.updated_at = now_string();
        app.interactions.push(entry);
        if keep > 0 && app.interactions.len() > keep {
            let excess = app.interactions.len() - keep;
            app.interactions.drain(..excess);
        }
        Ok(app.clone())
    }

    fn perform(
        &mut self,
        user: &UserId,
        op: CrudOperation,
        kind: EntityKind,
        data: &Map<String, Value>,
    ) -> CrudOutcome {
        let scoped: Vec<Record> = self
            .records
            .iter()
            .filter(|r| r.user_id == user.as_str() && r.kind == kind)
            .cloned()
            .collect();
        let (outcome, change) = plan_crud(kind, op, data, &scoped, user);
        match change {
            Some(RecordChange::Insert(record)) => self.records.push(record),
            Some(RecordChange::Update(record)) => {
                if let Some(slot) = self.records.iter_mut().find(|r| r.id == record.id) {
                    *slot = record;
                }
            }
            Some(RecordChange::Delete(id)) => self.records.retain(|r| r.id != id),
            None => {}
        }
        outcome
    }
}

/// Implements `Repository` for a type that can reach a `MemoryState`
/// through `self.read_state()` / `self.write_state()`.
macro_rules! memory_repository {
    ($ty:ty) => {
        #[async_trait]
        impl Repository for $ty {
            async fn intent_catalog(&self, user: &UserId) -> Result<Vec<Intent>, StoreError> {
                Ok(self.with_state(|s| s.intent_catalog(user)).await)
            }

            async fn find_intent(&self, user: &UserId, name: &str) -> Result<Option<Intent>, StoreError> {
                Ok(self.with_state(|s| s.find_intent(user, name)).await)
            }

            async fn create_intent(&self, user: &UserId, intent: NewIntent) -> Result<(Intent, bool), StoreError> {
                Ok(self.with_state(|s| s.insert_intent(Some(user), intent)).await)
            }

            async fn add_global_intent(&self, intent: NewIntent) -> Result<Intent, StoreError> {
                Ok(self.with_state(|s| s.insert_intent(None, intent).0).await)
            }

            async fn agent_profile(&self, user: &UserId, default_model: &str) -> Result<AgentProfile, StoreError> {
                Ok(self.with_state(|s| s.agent_profile(user, default_model)).await)
            }

            async fn log_interaction(&self, user: &UserId, entry: InteractionLog) -> Result<AgentProfile, StoreError> {
                self.with_state(|s| s.log_interaction(user, entry)).await
            }

            async fn get_or_create_app(&self, user: &UserId, name: &str, intent: &str) -> Result<(UserApp, bool), StoreError> {
                Ok(self.with_state(|s| s.get_or_create_app(user, name, intent)).await)
            }

            async fn append_interaction(
                &self,
                user: &UserId,
                app_id: Uuid,
                entry: InteractionEntry,
                keep: usize,
            ) -> Result<UserApp, StoreError> {
                self.with_state(|s| s.append_interaction(user, app_id, entry, keep)).await
            }

            async fn record_results(&self, user: &UserId, app_id: Uuid, results: Value) -> Result<(), StoreError> {
                self.with_state(|s| {
                    let app = s.app_mut(user, app_id)?;
                    app.last_results = Some(results);
                    app.updated_at = now_string();
                    Ok(())
                })
                .await
            }

            async fn link_resource(&self, user: &UserId, app_id: Uuid, resource: LinkedResource) -> Result<(), StoreError> {
                self.with_state(|s| {
                    let app = s.app_mut(user, app_id)?;
                    if !app.resources.contains(&resource) {
                        app.resources.push(resource);
                    }
                    Ok(())
                })
                .await
            }

            async fn get_app(&self, user: &UserId, app_id: Uuid) -> Result<Option<UserApp>, StoreError> {
                Ok(self.with_state(|s| s.app_mut(user, app_id).ok().cloned()).await)
            }

            async fn perform(
                &self,
                user: &UserId,
                op: CrudOperation,
                kind: EntityKind,
                data: Map<String, Value>,
            ) -> Result<CrudOutcome, StoreError> {
                Ok(self.with_state(|s| s.perform(user, op, kind, &data)).await)
            }
        }
    };
}

/// Non-persistent store; a transaction holds the write lock for its lifetime.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut state = self.state.write().await;
        f(&mut state)
    }
}

memory_repository!(InMemoryStore);

#[async_trait]
impl Store for InMemoryStore {
    fn is_persistent(&self) -> bool {
        false
    }

    fn repository(&self) -> &dyn Repository {
        self
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let guard = Arc::clone(&self.state).write_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard: Mutex::new(guard),
            snapshot: Some(snapshot),
        }))
    }
}

struct MemoryTransaction {
    guard: Mutex<OwnedRwLockWriteGuard<MemoryState>>,
    /// State at `begin`; `None` once committed.
    snapshot: Option<MemoryState>,
}

impl MemoryTransaction {
    async fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut guard = self.guard.lock().await;
        f(&mut guard)
    }
}

memory_repository!(MemoryTransaction);

#[async_trait]
impl Transaction for MemoryTransaction {
    fn repository(&self) -> &dyn Repository {
        self
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut tx = self;
        tx.snapshot = None;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        // Drop restores the snapshot.
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            let guard = self.guard.get_mut();
            **guard = snapshot;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn get_or_create_app_is_idempotent_per_name() {
        let store = InMemoryStore::new();
        let user = UserId::new("alice");

        let (first, created) = store
            .get_or_create_app(&user, "alice's App - findReactDeveloper", "findReactDeveloper")
            .await
            .unwrap();
        assert!(created);

        let (second, created) = store
            .get_or_create_app(&user, "alice's App - findReactDeveloper", "findReactDeveloper")
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn append_interaction_keeps_a_rolling_log() {
        let store = InMemoryStore::new();
        let user = UserId::new("alice");
        let (app, _) = store.get_or_create_app(&user, "app", "intent").await.unwrap();

        for i in 0..5 {
            store
                .append_interaction(&user, app.id, InteractionEntry::now(format!("input {}", i), json!({})), 3)
                .await
                .unwrap();
        }

        let app = store.get_app(&user, app.id).await.unwrap().unwrap();
        assert_eq!(app.interaction_count, 5);
        assert_eq!(app.interactions.len(), 3);
        assert_eq!(app.interactions[0].input, "input 2");
    }

    #[tokio::test]
    async fn apps_are_private_to_their_owner() {
        let store = InMemoryStore::new();
        let (app, _) = store
            .get_or_create_app(&UserId::new("alice"), "app", "intent")
            .await
            .unwrap();
        let other = UserId::new("bob");
        assert!(store.get_app(&other, app.id).await.unwrap().is_none());
        assert!(store
            .append_interaction(&other, app.id, InteractionEntry::now("x", json!({})), 0)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = InMemoryStore::new();
        let user = UserId::new("alice");

        let tx = store.begin().await.unwrap();
        tx.create_intent(&user, NewIntent { name: "travelPlanning".into(), ..Default::default() })
            .await
            .unwrap();
        tx.get_or_create_app(&user, "app", "travelPlanning").await.unwrap();
        drop(tx);

        assert!(store.find_intent(&user, "travelPlanning").await.unwrap().is_none());
        assert!(store.intent_catalog(&user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn committed_transaction_is_visible() {
        let store = InMemoryStore::new();
        let user = UserId::new("alice");

        let tx = store.begin().await.unwrap();
        tx.create_intent(&user, NewIntent { name: "travelPlanning".into(), ..Default::default() })
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert!(store.find_intent(&user, "travelPlanning").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn own_intent_shadows_global_intent() {
        let store = InMemoryStore::new();
        let user = UserId::new("alice");
        store
            .add_global_intent(NewIntent { name: "hire".into(), description: "global".into(), keywords: vec![] })
            .await
            .unwrap();
        store
            .create_intent(&user, NewIntent { name: "hire".into(), description: "mine".into(), keywords: vec![] })
            .await
            .unwrap();

        let found = store.find_intent(&user, "hire").await.unwrap().unwrap();
        assert_eq!(found.description, "mine");
        assert_eq!(store.intent_catalog(&user).await.unwrap().len(), 2);
        assert_eq!(store.intent_catalog(&UserId::new("bob")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn log_interaction_counts_per_profile() {
        let store = InMemoryStore::new();
        let user = UserId::new("alice");
        let profile = store.agent_profile(&user, "model-a").await.unwrap();
        assert_eq!(profile.model, "model-a");

        let entry = InteractionLog {
            user_input: "hi".into(),
            agent_response: json!({}),
            context: json!({}),
        };
        let profile = store.log_interaction(&user, entry).await.unwrap();
        assert_eq!(profile.interaction_count, 1);
        assert!(profile.last_interaction.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_keep_every_update() {
        let store = Arc::new(InMemoryStore::new());
        let user = UserId::new("alice");
        let (app, _) = store.get_or_create_app(&user, "app", "hire").await.unwrap();

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let store = Arc::clone(&store);
                let user = user.clone();
                tokio::spawn(async move {
                    store
                        .append_interaction(&user, app.id, InteractionEntry::now(format!("req {i}"), json!({})), 0)
                        .await
                })
            })
            .collect();
        for result in futures::future::join_all(handles).await {
            result.unwrap().unwrap();
        }

        let app = store.get_app(&user, app.id).await.unwrap().unwrap();
        assert_eq!(app.interaction_count, 20);
        assert_eq!(app.interactions.len(), 20);
    }
}
