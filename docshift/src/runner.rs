//! Changeset runner.
//!
//! The runner sorts its input by changeset id, rejects duplicates, checks
//! every already-applied changeset for drift, then applies the pending ones in
//! order. Each changeset runs in its own unit of work: on transactional stores
//! the ledger entry is written inside the same transaction; elsewhere a failed
//! changeset keeps the operations that ran before the failure.
//!
//! Runs against one target are expected to come from a single process. The
//! lease lock taken around each run guards against accidental overlap but is
//! advisory: a run that outlives its lease can overlap with the next one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use nanoid::nanoid;
use serde::Serialize;

use crate::changeset::{Changeset, ChangesetId, Operation};
use crate::document::resolve_apply_time;
use crate::errors::{ChangesetError, RunHalted, StoreResult};
use crate::ledger::{LOCK_NAME, Ledger, LedgerEntry, Outcome, bootstrap_changeset};
use crate::store::{StoreAdapter, UpdateOptions};

/// Default lease for the per-target run lock.
pub const DEFAULT_LOCK_LEASE: Duration = Duration::from_secs(300);

/// Logical database/environment a runner operates against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    /// Changeset contexts applied to this target. Defaults to the target name.
    pub contexts: Vec<String>,
}

impl Target {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            contexts: vec![name.clone()],
            name,
        }
    }

    pub fn with_contexts<I, S>(mut self, contexts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.contexts = contexts.into_iter().map(Into::into).collect();
        self
    }

    pub fn accepts(&self, context: &str) -> bool {
        self.contexts.iter().any(|c| c == context)
    }

    fn lock_name(&self) -> String {
        format!("{LOCK_NAME}:{}", self.name)
    }
}

/// Runner behaviour switches.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Report what would happen without writing anything.
    pub dry_run: bool,
    /// Lease for the per-target lock; `None` disables locking.
    pub lock_lease: Option<Duration>,
    /// Lock owner identity.
    pub owner: String,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            lock_lease: Some(DEFAULT_LOCK_LEASE),
            owner: default_owner(),
        }
    }
}

fn default_owner() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "docshift".to_string());
    format!("{host}-{}", nanoid!(8))
}

/// Outcome of [`Runner::apply`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub target: String,
    /// Changesets applied by this run, in order.
    pub applied: Vec<ChangesetId>,
    /// Changesets already in the ledger with a matching checksum.
    pub skipped: Vec<ChangesetId>,
    /// Changesets a dry run would apply.
    pub pending: Vec<ChangesetId>,
    /// Changesets whose context does not belong to the target.
    pub filtered: usize,
    /// Documents inserted, modified or deleted.
    pub documents_affected: u64,
    pub total_time_ms: u64,
    pub dry_run: bool,
}

/// Outcome of [`Runner::rollback`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackReport {
    pub target: String,
    /// Changesets reverted, most recent first.
    pub rolled_back: Vec<ChangesetId>,
    pub total_time_ms: u64,
    pub dry_run: bool,
}

/// Ledger state of one changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangesetState {
    Applied,
    Pending,
    Drifted,
    RolledBack,
    /// In the ledger but missing from the supplied changesets.
    Orphaned,
}

impl ChangesetState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangesetState::Applied => "applied",
            ChangesetState::Pending => "pending",
            ChangesetState::Drifted => "drifted",
            ChangesetState::RolledBack => "rolled_back",
            ChangesetState::Orphaned => "orphaned",
        }
    }
}

/// One row of [`Runner::status`].
#[derive(Debug, Clone, Serialize)]
pub struct StatusRow {
    pub id: ChangesetId,
    pub context: String,
    pub state: ChangesetState,
    pub applied_at: Option<DateTime<Utc>>,
    pub checksum: Option<String>,
    pub recorded_checksum: Option<String>,
    pub description: Option<String>,
}

/// Sort, validate, de-duplicate and filter changesets for a target.
///
/// Input order does not matter: changesets are reordered by ascending id.
/// Returns the applicable changesets and the number filtered out by context.
pub fn plan(target: &Target, mut changesets: Vec<Changeset>) -> Result<(Vec<Changeset>, usize), ChangesetError> {
    for changeset in &changesets {
        changeset.validate()?;
    }

    changesets.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.context.cmp(&b.context)));
    for pair in changesets.windows(2) {
        if pair[0].id == pair[1].id && pair[0].context == pair[1].context {
            return Err(ChangesetError::DuplicateChangeset {
                id: pair[1].id.clone(),
                context: pair[1].context.clone(),
            });
        }
    }

    let total = changesets.len();
    changesets.retain(|changeset| target.accepts(&changeset.context));
    let filtered = total - changesets.len();

    // Contexts sharing a target share its ledger, so ids must be unique across them.
    for pair in changesets.windows(2) {
        if pair[0].id == pair[1].id {
            return Err(ChangesetError::DuplicateChangeset {
                id: pair[1].id.clone(),
                context: pair[1].context.clone(),
            });
        }
    }

    Ok((changesets, filtered))
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn drift_error(changeset: &Changeset, entry: &LedgerEntry) -> Option<ChangesetError> {
    let current = changeset.checksum();
    (current != entry.checksum).then(|| ChangesetError::ChangesetDrift {
        id: changeset.id.clone(),
        recorded: entry.checksum.clone(),
        current,
    })
}

/// Applies changesets to targets through a [`StoreAdapter`].
pub struct Runner {
    store: Arc<dyn StoreAdapter>,
    ledger: Ledger,
    options: RunnerOptions,
}

impl Runner {
    pub fn new(store: Arc<dyn StoreAdapter>) -> Self {
        Self {
            ledger: Ledger::new(store.clone()),
            store,
            options: RunnerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Apply every pending changeset for `target`, in ascending id order.
    pub async fn apply(&self, target: &Target, changesets: Vec<Changeset>) -> Result<RunReport, RunHalted> {
        let started = Instant::now();
        let (changesets, filtered) = plan(target, changesets)?;
        let mut report = RunReport {
            target: target.name.clone(),
            filtered,
            dry_run: self.options.dry_run,
            ..Default::default()
        };

        info!(
            "applying {} changeset(s) to target '{}' via {} store",
            changesets.len(),
            target.name,
            self.store.kind()
        );

        let lock = self.acquire(target).await?;
        let result = self.apply_planned(target, &changesets, &mut report).await;
        self.release(target, lock).await;
        result?;

        report.total_time_ms = elapsed_ms(started);
        Ok(report)
    }

    async fn apply_planned(
        &self,
        target: &Target,
        changesets: &[Changeset],
        report: &mut RunReport,
    ) -> Result<(), RunHalted> {
        if !self.options.dry_run {
            self.bootstrap(target).await?;
        }

        let recorded: HashMap<ChangesetId, LedgerEntry> = self
            .ledger
            .live_entries(&target.name)
            .await?
            .into_iter()
            .map(|entry| (entry.id.clone(), entry))
            .collect();

        let last_recorded = recorded.keys().filter(|id| !id.is_zero()).max().cloned();

        // Every drift check happens before the first write.
        let mut pending = Vec::new();
        for changeset in changesets {
            match recorded.get(&changeset.id) {
                Some(entry) => {
                    if let Some(error) = drift_error(changeset, entry) {
                        return Err(RunHalted::new(error, last_recorded));
                    }
                    debug!("changeset {} already applied, skipping", changeset.id);
                    report.skipped.push(changeset.id.clone());
                }
                None => pending.push(changeset),
            }
        }

        for changeset in pending {
            if self.options.dry_run {
                report.pending.push(changeset.id.clone());
                continue;
            }
            match self.apply_one(target, changeset).await {
                Ok(affected) => {
                    report.documents_affected += affected;
                    report.applied.push(changeset.id.clone());
                }
                Err(error) => {
                    let last_applied = report.applied.last().cloned().or(last_recorded);
                    return Err(RunHalted::new(error, last_applied));
                }
            }
        }
        Ok(())
    }

    /// Apply changeset zero for the target if it has not been applied yet.
    async fn bootstrap(&self, target: &Target) -> Result<(), ChangesetError> {
        let bootstrap = bootstrap_changeset();
        if self.ledger.has(&target.name, &bootstrap.id).await? {
            return Ok(());
        }
        debug!("bootstrapping ledger for target '{}'", target.name);
        self.apply_one(target, &bootstrap).await?;
        Ok(())
    }

    async fn apply_one(&self, target: &Target, changeset: &Changeset) -> Result<u64, ChangesetError> {
        let started = Instant::now();
        let affected = self
            .run_unit(changeset, &changeset.operations, || async move {
                let mut entry = LedgerEntry::for_changeset(&target.name, changeset, Outcome::Applied);
                entry.execution_time_ms = elapsed_ms(started);
                self.ledger.record(&entry).await
            })
            .await?;
        info!(
            "applied changeset {} ({} operation(s), {} document(s)) in {}ms",
            changeset.id,
            changeset.operations.len(),
            affected,
            elapsed_ms(started)
        );
        Ok(affected)
    }

    /// Run `operations` then `finish` as one unit of work.
    async fn run_unit<F, Fut>(&self, changeset: &Changeset, operations: &[Operation], finish: F) -> Result<u64, ChangesetError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = StoreResult<()>>,
    {
        let transactional = self.store.supports_transactions();
        if transactional {
            self.store.begin().await?;
        }

        let now = Utc::now();
        let mut affected = 0;
        for (index, operation) in operations.iter().enumerate() {
            match self.execute(operation, now).await {
                Ok(count) => affected += count,
                Err(cause) => {
                    if transactional {
                        self.abort().await;
                    } else if index > 0 {
                        warn!(
                            "changeset {} failed after {index} operation(s); those writes were not reverted",
                            changeset.id
                        );
                    }
                    return Err(ChangesetError::ChangesetApplication {
                        id: changeset.id.clone(),
                        index,
                        cause,
                    });
                }
            }
        }

        if let Err(err) = finish().await {
            if transactional {
                self.abort().await;
            }
            return Err(err.into());
        }

        if transactional {
            self.store.commit().await?;
        }
        Ok(affected)
    }

    async fn abort(&self) {
        if let Err(err) = self.store.abort().await {
            warn!("failed to abort transaction: {err}");
        }
    }

    async fn execute(&self, operation: &Operation, now: DateTime<Utc>) -> StoreResult<u64> {
        debug!("{} on {}", operation.kind(), operation.collection());
        match resolve_apply_time(operation, now) {
            Operation::Insert { collection, documents } => self.store.insert(&collection, &documents).await,
            Operation::Update {
                collection,
                filter,
                mutation,
                multi,
                upsert,
            } => {
                self.store
                    .update(&collection, &filter, &mutation, UpdateOptions { multi, upsert })
                    .await
            }
            Operation::Delete {
                collection,
                filter,
                multi,
            } => self.store.delete(&collection, &filter, multi).await,
            Operation::CreateIndex {
                collection,
                keys,
                options,
            } => self.store.create_index(&collection, &keys, &options).await.map(|()| 0),
        }
    }

    async fn acquire(&self, target: &Target) -> Result<Option<String>, ChangesetError> {
        let Some(lease) = self.options.lock_lease else {
            return Ok(None);
        };
        if self.options.dry_run {
            return Ok(None);
        }

        let name = target.lock_name();
        match self.store.acquire_lock(&name, &self.options.owner, lease).await? {
            None => {
                debug!("acquired lock {name} as {}", self.options.owner);
                Ok(Some(name))
            }
            Some(holder) => Err(ChangesetError::LockContention {
                target: target.name.clone(),
                holder: holder.owner,
                expires_at: holder.expires_at,
            }),
        }
    }

    async fn release(&self, target: &Target, lock: Option<String>) {
        let Some(name) = lock else {
            return;
        };
        match self.store.release_lock(&name, &self.options.owner).await {
            Ok(true) => debug!("released lock {name}"),
            Ok(false) => warn!("lock for target '{}' expired before the run finished", target.name),
            Err(err) => warn!("failed to release lock for target '{}': {err}", target.name),
        }
    }

    /// Revert the `count` most recently applied changesets, newest first.
    ///
    /// Every chosen changeset must be supplied, unchanged, and carry rollback
    /// operations; this is checked before anything is reverted.
    pub async fn rollback(
        &self,
        target: &Target,
        changesets: Vec<Changeset>,
        count: usize,
    ) -> Result<RollbackReport, RunHalted> {
        let started = Instant::now();
        let (changesets, _) = plan(target, changesets)?;
        let mut report = RollbackReport {
            target: target.name.clone(),
            dry_run: self.options.dry_run,
            ..Default::default()
        };

        let lock = self.acquire(target).await?;
        let result = self.rollback_planned(target, &changesets, count, &mut report).await;
        self.release(target, lock).await;
        result?;

        report.total_time_ms = elapsed_ms(started);
        Ok(report)
    }

    async fn rollback_planned(
        &self,
        target: &Target,
        changesets: &[Changeset],
        count: usize,
        report: &mut RollbackReport,
    ) -> Result<(), RunHalted> {
        let by_id: HashMap<&ChangesetId, &Changeset> =
            changesets.iter().map(|changeset| (&changeset.id, changeset)).collect();

        let mut live = self.ledger.live_entries(&target.name).await?;
        live.retain(|entry| !entry.id.is_zero());

        // Newest changeset still applied once `reverted` are gone.
        let halt = |error: ChangesetError, reverted: &[ChangesetId]| {
            let still_applied = live
                .iter()
                .rev()
                .map(|entry| &entry.id)
                .find(|id| !reverted.contains(id))
                .cloned();
            RunHalted::new(error, still_applied)
        };

        let mut plan = Vec::with_capacity(count.min(live.len()));
        for entry in live.iter().rev().take(count) {
            let Some(changeset) = by_id.get(&entry.id).copied() else {
                let error = ChangesetError::invalid(format!("ledger entry {} has no matching changeset", entry.id));
                return Err(halt(error, &[]));
            };
            if changeset.rollback.is_empty() {
                let error = ChangesetError::invalid(format!("changeset {} has no rollback operations", changeset.id));
                return Err(halt(error, &[]));
            }
            if let Some(error) = drift_error(changeset, entry) {
                return Err(halt(error, &[]));
            }
            plan.push(changeset);
        }

        for changeset in plan {
            if !self.options.dry_run {
                self.revert_one(target, changeset)
                    .await
                    .map_err(|error| halt(error, &report.rolled_back))?;
            }
            report.rolled_back.push(changeset.id.clone());
        }
        Ok(())
    }

    async fn revert_one(&self, target: &Target, changeset: &Changeset) -> Result<(), ChangesetError> {
        self.run_unit(changeset, &changeset.rollback, || async move {
            self.ledger.mark_rolled_back(&target.name, &changeset.id).await.map(|_| ())
        })
        .await?;
        info!("rolled back changeset {}", changeset.id);
        Ok(())
    }

    /// Ledger state of every applicable changeset plus orphaned ledger entries.
    pub async fn status(&self, target: &Target, changesets: Vec<Changeset>) -> Result<Vec<StatusRow>, ChangesetError> {
        let (changesets, _) = plan(target, changesets)?;
        let entries: Vec<LedgerEntry> = self
            .ledger
            .entries_for(&target.name)
            .await?
            .into_iter()
            .filter(|entry| !entry.id.is_zero())
            .collect();

        let mut live: HashMap<&ChangesetId, &LedgerEntry> = HashMap::new();
        let mut rolled_back: HashSet<&ChangesetId> = HashSet::new();
        for entry in &entries {
            if entry.outcome.is_live() {
                live.insert(&entry.id, entry);
            } else {
                rolled_back.insert(&entry.id);
            }
        }

        let mut rows = Vec::with_capacity(changesets.len());
        for changeset in &changesets {
            let checksum = changeset.checksum();
            let (state, entry) = match live.get(&changeset.id) {
                Some(entry) if entry.checksum == checksum => (ChangesetState::Applied, Some(*entry)),
                Some(entry) => (ChangesetState::Drifted, Some(*entry)),
                None if rolled_back.contains(&changeset.id) => (ChangesetState::RolledBack, None),
                None => (ChangesetState::Pending, None),
            };
            rows.push(StatusRow {
                id: changeset.id.clone(),
                context: changeset.context.clone(),
                state,
                applied_at: entry.map(|e| e.applied_at),
                checksum: Some(checksum),
                recorded_checksum: entry.map(|e| e.checksum.clone()),
                description: changeset.description.clone(),
            });
        }

        let known: HashSet<&ChangesetId> = changesets.iter().map(|changeset| &changeset.id).collect();
        for entry in live.values().filter(|entry| !known.contains(&entry.id)) {
            rows.push(StatusRow {
                id: entry.id.clone(),
                context: entry.context.clone(),
                state: ChangesetState::Orphaned,
                applied_at: Some(entry.applied_at),
                checksum: None,
                recorded_checksum: Some(entry.checksum.clone()),
                description: None,
            });
        }

        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rows)
    }

    /// [`status`](Self::status), failing on the first drifted changeset.
    pub async fn validate(&self, target: &Target, changesets: Vec<Changeset>) -> Result<Vec<StatusRow>, ChangesetError> {
        let rows = self.status(target, changesets).await?;
        if let Some(row) = rows.iter().find(|row| row.state == ChangesetState::Drifted) {
            return Err(ChangesetError::ChangesetDrift {
                id: row.id.clone(),
                recorded: row.recorded_checksum.clone().unwrap_or_default(),
                current: row.checksum.clone().unwrap_or_default(),
            });
        }
        Ok(rows)
    }

    /// Record `changeset` as applied without running it. Returns false if it
    /// was already applied.
    pub async fn mark_applied(&self, target: &Target, changeset: &Changeset) -> Result<bool, ChangesetError> {
        changeset.validate()?;
        if !target.accepts(&changeset.context) {
            return Err(ChangesetError::invalid(format!(
                "changeset {} (context '{}') does not belong to target '{}'",
                changeset.id, changeset.context, target.name
            )));
        }
        self.resolve_unit(target, || self.record_marked(target, changeset)).await
    }

    /// Flag `id` as rolled back without running anything. Returns false if it
    /// was not applied.
    pub async fn mark_rolled_back(&self, target: &Target, id: &ChangesetId) -> Result<bool, ChangesetError> {
        self.resolve_unit(target, || async move {
            self.ledger
                .mark_rolled_back(&target.name, id)
                .await
                .map_err(ChangesetError::from)
        })
        .await
    }

    async fn record_marked(&self, target: &Target, changeset: &Changeset) -> Result<bool, ChangesetError> {
        if self.ledger.has(&target.name, &changeset.id).await? {
            return Ok(false);
        }
        self.ledger
            .record(&LedgerEntry::for_changeset(&target.name, changeset, Outcome::MarkedApplied))
            .await?;
        Ok(true)
    }

    /// Ledger-only write under the target lock, in a transaction when the
    /// store has them.
    async fn resolve_unit<T, F, Fut>(&self, target: &Target, work: F) -> Result<T, ChangesetError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, ChangesetError>>,
    {
        let lock = self.acquire(target).await?;
        let result = self.in_transaction(work).await;
        self.release(target, lock).await;
        result
    }

    async fn in_transaction<T, F, Fut>(&self, work: F) -> Result<T, ChangesetError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, ChangesetError>>,
    {
        let transactional = self.store.supports_transactions();
        if transactional {
            self.store.begin().await?;
        }
        match work().await {
            Ok(value) => {
                if transactional {
                    self.store.commit().await?;
                }
                Ok(value)
            }
            Err(err) => {
                if transactional {
                    self.abort().await;
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn changeset(id: &str, context: &str) -> Changeset {
        Changeset::new(id.parse().unwrap(), context).with_operation(Operation::Insert {
            collection: "users".to_string(),
            documents: vec![json!({"name": id}).as_object().cloned().unwrap_or_default()],
        })
    }

    #[test]
    fn plan_sorts_and_filters_by_context() {
        let target = Target::new("dev");
        let (planned, filtered) = plan(
            &target,
            vec![changeset("11", "dev"), changeset("4", "dev"), changeset("9", "prod")],
        )
        .unwrap();
        let ids: Vec<String> = planned.iter().map(|c| c.id.to_string()).collect();
        assert_eq!(ids, ["4", "11"]);
        assert_eq!(filtered, 1);
    }

    #[test]
    fn plan_rejects_duplicates_within_a_context() {
        let err = plan(&Target::new("dev"), vec![changeset("4", "dev"), changeset("4", "dev")]).unwrap_err();
        assert!(matches!(err, ChangesetError::DuplicateChangeset { .. }));
    }

    #[test]
    fn plan_rejects_duplicates_across_target_contexts() {
        let target = Target::new("dev").with_contexts(["dev", "seed"]);
        let err = plan(&target, vec![changeset("4", "dev"), changeset("4", "seed")]).unwrap_err();
        assert!(matches!(err, ChangesetError::DuplicateChangeset { .. }));

        // Same id in a context the target ignores is fine.
        assert!(plan(&Target::new("dev"), vec![changeset("4", "dev"), changeset("4", "prod")]).is_ok());
    }

    #[test]
    fn target_defaults_to_its_own_context() {
        let target = Target::new("liquibase_test");
        assert!(target.accepts("liquibase_test"));
        assert!(!target.accepts("dev"));
    }

    #[test]
    fn default_options_lock_with_a_lease() {
        let options = RunnerOptions::default();
        assert_eq!(options.lock_lease, Some(DEFAULT_LOCK_LEASE));
        assert!(!options.dry_run);
        assert!(!options.owner.is_empty());
    }
}
