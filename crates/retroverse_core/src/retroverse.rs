//! Request-level orchestration.
//!
//! [`Retroverse`] owns one process's cache, sessions and lock manager and
//! composes them with the data service, permission resolver and validator
//! into the get, save, subscription, long-poll and background operations.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

use crate::cache::DatonCache;
use crate::clientplex::{ClientPlex, PushItems};
use crate::config::RetroverseConfig;
use crate::data::{DataService, DataTransaction};
use crate::daton::Daton;
use crate::diff::{ApplyResult, PersistonDiff};
use crate::error::{ErrorCode, Result, RetroError};
use crate::key::DatonKey;
use crate::lock::LockManager;
use crate::permissions::{AllowAll, PermissionResolver, User};
use crate::protocol::{
    LongPollResponse, MainRequest, MainResponse, ManageDatonRequest, ManageDatonResult,
    SavedPersiston, SubscribeState,
};
use crate::schema::{DataDictionary, DatonDef};
use crate::validate::{SchemaValidator, Validator};
use crate::wire::CondensedDaton;

/// Per-item results of [`Retroverse::save_many`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveOutcome {
    pub items: Vec<SavedPersiston>,
    pub success: bool,
}

impl SaveOutcome {
    fn all_failed<'a>(keys: impl Iterator<Item = &'a DatonKey>, reason: &str) -> Self {
        Self {
            items: keys
                .map(|k| SavedPersiston::failed(k.to_string(), vec![reason.to_string()]))
                .collect(),
            success: false,
        }
    }
}

/// Why a batch did not fully persist, and which stores committed anyway
struct PersistFailure {
    committed: BTreeSet<u32>,
    error: RetroError,
}

struct PreparedSave<'a> {
    diff: PersistonDiff,
    def: Option<&'a DatonDef>,
    pristine: Option<Arc<Daton>>,
    modified: Option<Daton>,
    deleted: bool,
    errors: Vec<String>,
}

/// The synchronization engine of one server process
pub struct Retroverse {
    schema: Arc<DataDictionary>,
    cache: DatonCache,
    plex: ClientPlex,
    locks: LockManager,
    data: Arc<dyn DataService>,
    permissions: Arc<dyn PermissionResolver>,
    validator: Arc<dyn Validator>,
    config: RetroverseConfig,
}

impl Retroverse {
    pub fn new(
        schema: Arc<DataDictionary>,
        locks: LockManager,
        data: Arc<dyn DataService>,
        config: RetroverseConfig,
    ) -> Self {
        Self {
            schema,
            cache: DatonCache::new(),
            plex: ClientPlex::new(),
            locks,
            data,
            permissions: Arc::new(AllowAll),
            validator: Arc::new(SchemaValidator),
            config,
        }
    }

    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionResolver>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn schema(&self) -> &DataDictionary {
        &self.schema
    }

    pub fn cache(&self) -> &DatonCache {
        &self.cache
    }

    pub fn plex(&self) -> &ClientPlex {
        &self.plex
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn config(&self) -> &RetroverseConfig {
        &self.config
    }

    pub fn create_session(&self, user: User) -> String {
        self.plex.create_session(user)
    }

    fn find_def(&self, key: &DatonKey) -> Result<&DatonDef> {
        self.schema
            .find_def_for(key)
            .ok_or_else(|| RetroError::UnknownType(key.type_name().to_string()))
    }

    /// Session user, provided the session belongs to `user`
    fn session_user(&self, user: &User, session_key: &str) -> std::result::Result<User, ErrorCode> {
        match self.plex.get_user(session_key) {
            Some(owner) if owner.id == user.id => Ok(owner),
            _ => Err(ErrorCode::BadSession),
        }
    }

    /// Default instance of an unsaved record, passed through the data
    /// service's initializer
    pub fn new_record(&self, def: &DatonDef, user: Option<&User>) -> Daton {
        let mut daton = Daton::new_default(def);
        self.data.initialize_new(def, &mut daton, user);
        daton
    }

    /// Fetch a daton.
    ///
    /// With `force_check_latest` a cached record is checked against the lock
    /// store's current version and a cached query result is always reloaded.
    /// With a `user` the result is a permission-filtered copy; without one it
    /// is the shared cached instance.
    pub async fn get_daton(
        &self,
        key: &DatonKey,
        user: Option<&User>,
        force_check_latest: bool,
    ) -> Result<Option<Arc<Daton>>> {
        let def = self.find_def(key)?;
        if key.is_new() {
            if !def.is_persiston {
                return Err(RetroError::MalformedKey(key.to_string()));
            }
            return Ok(Some(Arc::new(self.new_record(def, user))));
        }

        let shared = match self.cached(key, force_check_latest)? {
            Some(daton) => daton,
            None => match self.load(def, key).await? {
                Some(daton) => daton,
                None => return Ok(None),
            },
        };

        Ok(Some(match user {
            Some(user) => {
                let mut copy = Daton::clone(&shared);
                self.permissions.hide_private_parts(user, def, &mut copy);
                Arc::new(copy)
            }
            None => shared,
        }))
    }

    fn cached(&self, key: &DatonKey, force_check_latest: bool) -> Result<Option<Arc<Daton>>> {
        let Some(daton) = self.cache.get(key) else {
            return Ok(None);
        };
        if !force_check_latest {
            return Ok(Some(daton));
        }
        if key.is_record() {
            let current = self.locks.get_version(key)?;
            if daton.version.as_deref() == Some(current.as_str()) {
                return Ok(Some(daton));
            }
        }
        self.cache.remove(key);
        Ok(None)
    }

    async fn load(&self, def: &DatonDef, key: &DatonKey) -> Result<Option<Arc<Daton>>> {
        // Read the version first so a concurrent write can only make it older
        let version = if key.is_record() {
            Some(self.locks.get_version(key)?)
        } else {
            None
        };
        let Some(mut daton) = self.data.load(def, key, self.config.viewon_page_size).await? else {
            self.cache.remove(key);
            return Ok(None);
        };
        daton.key = key.clone();
        daton.version = version;
        let daton = Arc::new(daton);
        self.cache.put(daton.clone());
        Ok(Some(daton))
    }

    /// Validate, check and persist a batch of diffs.
    ///
    /// Every existing record must be locked by `session_key` at the diff's
    /// base version or the whole batch fails. Items are saved in one
    /// transaction per backing store and all transactions commit or roll
    /// back together, except when a commit itself fails: items in stores
    /// that already committed are then reported as saved and the rest as
    /// failed. Saved records get a new version and stay locked.
    pub async fn save_many(&self, session_key: &str, user: &User, diffs: Vec<PersistonDiff>) -> SaveOutcome {
        for diff in &diffs {
            if diff.key.is_new() {
                continue;
            }
            let state = self.locks.get_lock_state(&diff.key, session_key);
            let code = if !state.is_locked_by_me {
                Some(ErrorCode::Locked)
            } else if state.version_at_lock.as_deref() != diff.based_on_version.as_deref() {
                Some(ErrorCode::VersionConflict)
            } else {
                None
            };
            if let Some(code) = code {
                log::debug!("Save batch rejected at {}: {:?}", diff.key, code);
                return SaveOutcome::all_failed(diffs.iter().map(|d| &d.key), code.message());
            }
        }

        let mut prepared = Vec::with_capacity(diffs.len());
        for diff in diffs {
            prepared.push(self.prepare_save(user, diff).await);
        }

        if prepared.iter().any(|p| !p.errors.is_empty()) {
            return SaveOutcome {
                items: prepared
                    .into_iter()
                    .map(|p| SavedPersiston::failed(p.diff.key.to_string(), p.errors))
                    .collect(),
                success: false,
            };
        }

        if let Err(failure) = self.persist(user, &mut prepared).await {
            if failure.committed.is_empty() {
                log::warn!("Save batch rolled back: {}", failure.error);
                return SaveOutcome::all_failed(prepared.iter().map(|p| &p.diff.key), &failure.error.to_string());
            }
            log::error!(
                "Save batch partly committed (databases {:?}): {}",
                failure.committed,
                failure.error
            );
            let reason = failure.error.to_string();
            let items = prepared
                .into_iter()
                .map(|p| {
                    let committed = p
                        .def
                        .is_some_and(|def| failure.committed.contains(&def.database_number));
                    if committed {
                        self.finish_save(session_key, p)
                    } else {
                        SavedPersiston::failed(p.diff.key.to_string(), vec![reason.clone()])
                    }
                })
                .collect();
            return SaveOutcome { items, success: false };
        }

        let items = prepared
            .into_iter()
            .map(|p| self.finish_save(session_key, p))
            .collect();
        SaveOutcome { items, success: true }
    }

    async fn prepare_save(&self, user: &User, diff: PersistonDiff) -> PreparedSave<'_> {
        let mut prepared = PreparedSave {
            diff,
            def: None,
            pristine: None,
            modified: None,
            deleted: false,
            errors: Vec::new(),
        };
        let key = prepared.diff.key.clone();

        let def = match self.find_def(&key) {
            Ok(def) if def.is_persiston => def,
            Ok(def) => {
                prepared.errors.push(format!("{} cannot be saved", def.name));
                return prepared;
            }
            Err(e) => {
                prepared.errors.push(e.to_string());
                return prepared;
            }
        };
        prepared.def = Some(def);

        let mut modified = if key.is_new() {
            self.new_record(def, Some(user))
        } else {
            match self.get_daton(&key, None, true).await {
                Ok(Some(pristine)) => {
                    let modified = Daton::clone(&pristine);
                    prepared.pristine = Some(pristine);
                    modified
                }
                Ok(None) => {
                    prepared.errors.push(format!("{} no longer exists", key));
                    return prepared;
                }
                Err(e) => {
                    prepared.errors.push(e.to_string());
                    return prepared;
                }
            }
        };

        match prepared.diff.apply_to(&self.schema, &mut modified) {
            Ok(ApplyResult::RecordDeleted) => prepared.deleted = true,
            Ok(_) => {}
            Err(e) => {
                prepared.errors.push(e.to_string());
                return prepared;
            }
        }

        prepared.errors.extend(self.permissions.disallowed_writes(
            user,
            prepared.pristine.as_deref(),
            def,
            &prepared.diff,
        ));
        if !prepared.deleted {
            prepared.errors.extend(self.validator.validate(def, &modified));
        }
        prepared.modified = Some(modified);
        prepared
    }

    /// Save every item in one transaction per database and commit them in
    /// database order. Transactions not yet committed when one fails are
    /// rolled back.
    async fn persist(
        &self,
        user: &User,
        prepared: &mut [PreparedSave<'_>],
    ) -> std::result::Result<(), PersistFailure> {
        let mut transactions: BTreeMap<u32, Box<dyn DataTransaction>> = BTreeMap::new();
        let mut failure = None;

        for item in prepared.iter_mut() {
            let (Some(def), Some(modified)) = (item.def, item.modified.as_mut()) else {
                continue;
            };
            let db = def.database_number;
            if !transactions.contains_key(&db) {
                match self.data.begin(db).await {
                    Ok(tx) => {
                        transactions.insert(db, tx);
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            let Some(tx) = transactions.get_mut(&db) else {
                continue;
            };
            if let Err(e) = tx
                .save(user, def, item.pristine.as_deref(), modified, &item.diff)
                .await
            {
                failure = Some(e);
                break;
            }
        }

        if let Some(error) = failure {
            Self::rollback_all(transactions).await;
            return Err(PersistFailure {
                committed: BTreeSet::new(),
                error,
            });
        }

        let mut committed = BTreeSet::new();
        let mut pending = transactions.into_iter();
        while let Some((db, tx)) = pending.next() {
            if let Err(error) = tx.commit().await {
                log::error!("Commit of database {} failed: {}", db, error);
                Self::rollback_all(pending.by_ref()).await;
                return Err(PersistFailure { committed, error });
            }
            committed.insert(db);
        }
        Ok(())
    }

    async fn rollback_all(transactions: impl IntoIterator<Item = (u32, Box<dyn DataTransaction>)>) {
        for (db, tx) in transactions {
            if let Err(e) = tx.rollback().await {
                log::warn!("Rollback of database {} failed: {}", db, e);
            }
        }
    }

    fn finish_save(&self, session_key: &str, prepared: PreparedSave<'_>) -> SavedPersiston {
        let old_key = prepared.diff.key;
        let Some(mut modified) = prepared.modified else {
            return SavedPersiston::failed(old_key.to_string(), prepared.errors);
        };

        if prepared.deleted {
            self.cache.remove(&old_key);
            self.plex.drop_subscriptions_to(&old_key);
            self.locks.release_lock(&old_key, session_key);
            log::info!("Deleted {}", old_key);
            return SavedPersiston {
                old_key: old_key.to_string(),
                new_key: None,
                success: true,
                errors: Vec::new(),
                is_deleted: true,
            };
        }

        let new_key = modified.key.clone();
        let version = if old_key.is_new() {
            self.locks.get_version(&new_key).map_err(|e| e.to_string())
        } else {
            self.locks
                .assign_new_version(&new_key, session_key)
                .map_err(|code| code.message().to_string())
        };
        match version {
            Ok(version) => {
                if !old_key.is_new() {
                    self.plex.set_subscription_version(session_key, &new_key, &version);
                }
                log::debug!("Saved {} at version {}", new_key, version);
                modified.version = Some(version);
                self.cache.put(Arc::new(modified));
            }
            Err(e) => {
                log::warn!("Saved {} but could not assign a version: {}", new_key, e);
                self.cache.remove(&new_key);
            }
        }

        SavedPersiston {
            old_key: old_key.to_string(),
            new_key: Some(new_key.to_string()),
            success: true,
            errors: Vec::new(),
            is_deleted: false,
        }
    }

    /// Apply subscription changes. Leaving the locked state releases the
    /// lock and pushes the record to other subscribers when it changed.
    pub async fn manage(
        &self,
        session_key: &str,
        requests: &[ManageDatonRequest],
    ) -> Result<Vec<ManageDatonResult>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let key = match DatonKey::parse(&request.key) {
                Ok(key) => key,
                Err(e) => {
                    log::warn!("{}", e);
                    results.push(ManageDatonResult {
                        key: request.key.clone(),
                        error_code: Some(ErrorCode::Internal),
                        subscribe_state: SubscribeState::Unsubscribed,
                    });
                    continue;
                }
            };
            results.push(self.manage_one(session_key, key, request).await?);
        }
        Ok(results)
    }

    async fn manage_one(
        &self,
        session_key: &str,
        key: DatonKey,
        request: &ManageDatonRequest,
    ) -> Result<ManageDatonResult> {
        let result = |error_code, subscribe_state| ManageDatonResult {
            key: key.to_string(),
            error_code,
            subscribe_state,
        };

        if request.subscribe_state != SubscribeState::Locked
            && self.locks.get_lock_state(&key, session_key).is_locked_by_me
        {
            self.locks.release_lock(&key, session_key);
            if let Err(e) = self.propagate_local_change(&key).await {
                log::warn!("Could not propagate {}: {}", key, e);
            }
        }

        let subscribe = request.subscribe_state != SubscribeState::Unsubscribed;
        match self
            .plex
            .manage_subscribe(session_key, &key, request.version.as_deref(), subscribe)
        {
            Ok(()) => {}
            Err(ErrorCode::BadSession) => return Err(RetroError::BadSession),
            Err(code) => return Ok(result(Some(code), SubscribeState::Unsubscribed)),
        }
        if request.subscribe_state != SubscribeState::Locked {
            return Ok(result(None, request.subscribe_state));
        }

        let Some(version) = request.version.as_deref() else {
            return Ok(result(Some(ErrorCode::VersionConflict), SubscribeState::Subscribed));
        };
        Ok(match self.locks.request_lock(&key, version, session_key) {
            Ok(()) => result(None, SubscribeState::Locked),
            Err(code) => result(Some(code), SubscribeState::Subscribed),
        })
    }

    /// Push a locally changed record to subscribers holding another version
    pub async fn propagate_local_change(&self, key: &DatonKey) -> Result<()> {
        let version = self.locks.get_version(key)?;
        if !self.plex.needs_refresh(key, &version) {
            return Ok(());
        }
        match self.get_daton(key, None, true).await? {
            Some(daton) => {
                self.plex
                    .notify_clients_of(&self.schema, self.permissions.as_ref(), &[daton]);
            }
            None => self.forget(key),
        }
        Ok(())
    }

    fn forget(&self, key: &DatonKey) {
        self.cache.remove(key);
        self.plex.drop_subscriptions_to(key);
    }

    /// Pick up records written by other server processes and push them to
    /// out-of-date subscribers. Returns the number of datons pushed.
    pub async fn background_refresh(&self) -> Result<usize> {
        let changes = self.locks.inter_server_process()?;
        let mut changed = Vec::new();
        for (key, version) in changes {
            if !self.plex.needs_refresh(&key, &version) {
                // Unsubscribed copies are reloaded on the next get
                self.cache.remove(&key);
                continue;
            }
            match self.get_daton(&key, None, true).await {
                Ok(Some(daton)) => changed.push(daton),
                Ok(None) => self.forget(&key),
                Err(e) => log::warn!("Could not reload {}: {}", key, e),
            }
        }
        if !changed.is_empty() {
            log::debug!("Pushing {} datons changed by peers", changed.len());
            self.plex
                .notify_clients_of(&self.schema, self.permissions.as_ref(), &changed);
        }
        Ok(changed.len())
    }

    /// Remove idle sessions (releasing their locks) and evict stale,
    /// unsubscribed cache entries. Returns the number of sessions removed.
    pub async fn cleanup(&self) -> usize {
        let mut released = Vec::new();
        let removed = self.plex.clean(self.config.session_idle, |session_key| {
            released.extend(self.locks.release_locks_for_session(session_key));
        });
        for key in released {
            if let Err(e) = self.propagate_local_change(&key).await {
                log::warn!("Could not propagate {}: {}", key, e);
            }
        }
        let pinned = self.plex.get_subscriptions();
        self.cache.clean(&pinned, self.config.cache_staleness);
        removed
    }

    /// Run background refresh on every tick and cleanup on every
    /// `cleanup_every_ticks`th tick until `shutdown` resolves.
    pub async fn run_background(&self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut interval = tokio::time::interval(self.config.background_interval);
        let cleanup_every = self.config.cleanup_every_ticks.max(1);
        let mut ticks: u32 = 0;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.background_refresh().await {
                log::warn!("Background refresh failed: {}", e);
            }
            ticks = ticks.wrapping_add(1);
            if ticks % cleanup_every == 0 {
                self.cleanup().await;
            }
        }
        log::info!("Background loop stopped");
    }

    /// Wait for pushes to a session, up to the configured timeout
    pub async fn handle_long_poll(&self, user: &User, session_key: &str) -> LongPollResponse {
        let user = match self.session_user(user, session_key) {
            Ok(user) => user,
            Err(code) => return LongPollResponse::error(code),
        };

        if let Some(items) = self.plex.get_and_clear_items_to_push(session_key) {
            if !items.is_empty() {
                return self.push_response(&user, items);
            }
        }

        let Some(waiter) = self.plex.begin_long_poll(session_key) else {
            return LongPollResponse::error(ErrorCode::BadSession);
        };
        // A push may have landed before the waiter was installed
        match self.plex.get_and_clear_items_to_push(session_key) {
            Some(items) if !items.is_empty() => return self.push_response(&user, items),
            Some(_) => {}
            None => return LongPollResponse::error(ErrorCode::BadSession),
        }

        let _ = tokio::time::timeout(self.config.long_poll_timeout, waiter).await;

        match self.plex.get_and_clear_items_to_push(session_key) {
            Some(items) => self.push_response(&user, items),
            None => LongPollResponse::error(ErrorCode::BadSession),
        }
    }

    fn push_response(&self, user: &User, items: PushItems) -> LongPollResponse {
        LongPollResponse {
            error_code: None,
            condensed_datons: items.datons.iter().filter_map(|d| self.condense(d)).collect(),
            permissions: items
                .permissions_changed
                .then(|| self.permissions.snapshot(user, &self.schema)),
        }
    }

    fn condense(&self, daton: &Daton) -> Option<CondensedDaton> {
        let def = self.schema.find_def_for(&daton.key)?;
        Some(CondensedDaton::from_daton(def, daton, self.config.row_format))
    }

    /// Process one main request: initialize, saves, subscription changes,
    /// gets and quit, in that order.
    pub async fn main(&self, user: &User, request: MainRequest) -> MainResponse {
        match self.try_main(user, request).await {
            Ok(response) => response,
            Err(e) => {
                if !matches!(e, RetroError::BadSession) {
                    log::error!("Main request failed: {}", e);
                }
                MainResponse::error(e.code())
            }
        }
    }

    async fn try_main(&self, user: &User, request: MainRequest) -> Result<MainResponse> {
        let mut response = MainResponse {
            save_persistons_success: true,
            ..MainResponse::default()
        };

        let session_key = if request.initialize.is_some() {
            let session_key = self.create_session(user.clone());
            response.session_key = Some(session_key.clone());
            response.data_dictionary = Some(DataDictionary::clone(&self.schema));
            response.permissions = Some(self.permissions.snapshot(user, &self.schema));
            session_key
        } else {
            let session_key = request.session_key.clone().ok_or(RetroError::BadSession)?;
            self.session_user(user, &session_key)
                .map_err(|_| RetroError::BadSession)?;
            session_key
        };

        if !request.save_datons.is_empty() {
            let diffs = request
                .save_datons
                .iter()
                .map(|wire| PersistonDiff::from_wire(&self.schema, wire))
                .collect::<Result<Vec<_>>>()?;
            let outcome = self.save_many(&session_key, user, diffs).await;
            response.saved_persistons = outcome.items;
            response.save_persistons_success = outcome.success;
        }

        if !request.manage_datons.is_empty() {
            response.manage_datons = self.manage(&session_key, &request.manage_datons).await?;
        }

        for get in &request.get_datons {
            let key = DatonKey::parse(&get.key)?;
            let Some(daton) = self.get_daton(&key, Some(user), get.force_load).await? else {
                continue;
            };
            if get.do_subscribe && key.is_record() && !key.is_new() {
                let version = daton.version.as_deref().or(get.known_version.as_deref());
                if let Err(code) = self.plex.manage_subscribe(&session_key, &key, version, true) {
                    log::warn!("Could not subscribe to {}: {:?}", key, code);
                }
            }
            if key.is_record() && daton.version.is_some() && daton.version == get.known_version {
                continue;
            }
            if let Some(condensed) = self.condense(&daton) {
                response.condensed_datons.push(condensed);
            }
        }

        if request.do_quit {
            self.end_session(&session_key).await;
            response.session_key = None;
        }

        Ok(response)
    }

    /// Release a session's locks, push what they changed and drop the session
    pub async fn end_session(&self, session_key: &str) {
        for key in self.locks.release_locks_for_session(session_key) {
            if let Err(e) = self.propagate_local_change(&key).await {
                log::warn!("Could not propagate {}: {}", key, e);
            }
        }
        self.plex.delete_session(session_key);
    }

    pub fn notify_permission_change(&self, user_id: &str) {
        self.plex.notify_clients_of_permission_change(user_id);
    }
}
