//! Domain reads and writes available to a pipeline.
//!
//! Every call asks the attempt's [`AccessPolicy`] first, so a denied access
//! fails before any SQL runs. Writes carry the attempt's provenance and roll
//! back with the attempt's transaction.

use anyhow::{anyhow, Result};
use audit_ledger_core::{
    check_committed_has_predecessor, check_reporting_has_committed_predecessor,
    check_scoring_requires_submission, check_tracking_target_is_committed, AccessMode,
    AccessPolicy, EntityType, InvariantError,
};
use audit_ledger_store_sqlite::lifecycle;
use audit_ledger_store_sqlite::{
    CommittedRecord, Draft, Milestone, Owner, ProgressEvent, Provenance, RawInput,
    ReportSnapshot, ScoreRecord, SqliteLifecycleReader,
};
use rusqlite::Connection;
use serde_json::Value;

pub struct DomainSession<'a> {
    conn: &'a Connection,
    policy: AccessPolicy,
    provenance: Provenance<'a>,
}

/// Keeps a violation downcastable from the returned `anyhow::Error`.
fn invariant_error(err: InvariantError) -> anyhow::Error {
    match err {
        InvariantError::Violation(violation) => anyhow::Error::new(violation),
        InvariantError::Read(err) => err,
    }
}

impl<'a> DomainSession<'a> {
    pub(crate) fn new(conn: &'a Connection, policy: AccessPolicy, provenance: Provenance<'a>) -> Self {
        Self {
            conn,
            policy,
            provenance,
        }
    }

    #[must_use]
    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    fn read(&self, entity: EntityType) -> Result<()> {
        self.policy
            .check(self.provenance.orchestrator_name, entity, AccessMode::Read)
            .map_err(anyhow::Error::new)
    }

    fn write(&self, entity: EntityType) -> Result<()> {
        self.policy
            .check(self.provenance.orchestrator_name, entity, AccessMode::Write)
            .map_err(anyhow::Error::new)
    }

    fn reader(&self) -> SqliteLifecycleReader<'a> {
        SqliteLifecycleReader::new(self.conn)
    }

    /// # Errors
    /// Returns the policy violation or the storage error.
    pub fn create_owner(&self, owner_id: &str, display_name: &str) -> Result<Owner> {
        self.write(EntityType::Owner)?;
        lifecycle::insert_owner(self.conn, self.provenance, owner_id, display_name)
    }

    /// # Errors
    /// Returns the policy violation or the storage error.
    pub fn record_raw_input(&self, owner_id: &str, content: &Value) -> Result<RawInput> {
        self.write(EntityType::RawInput)?;
        lifecycle::insert_raw_input(self.conn, self.provenance, owner_id, content)
    }

    /// Returns the new baseline id.
    ///
    /// # Errors
    /// Returns the policy violation or the storage error.
    pub fn create_baseline(
        &self,
        owner_id: &str,
        raw_input_id: Option<&str>,
        title: &str,
    ) -> Result<String> {
        self.write(EntityType::Baseline)?;
        lifecycle::insert_baseline(self.conn, self.provenance, owner_id, raw_input_id, title)
    }

    /// # Errors
    /// Returns the policy violation or the storage error.
    pub fn create_draft(
        &self,
        owner_id: &str,
        baseline_id: Option<&str>,
        title: &str,
    ) -> Result<Draft> {
        self.write(EntityType::Draft)?;
        lifecycle::insert_draft(self.conn, self.provenance, owner_id, baseline_id, title)
    }

    /// # Errors
    /// Returns the policy violation or the storage error.
    pub fn add_milestone(&self, draft_id: &str, title: &str) -> Result<Milestone> {
        self.write(EntityType::Milestone)?;
        lifecycle::insert_draft_milestone(self.conn, self.provenance, draft_id, title)
    }

    /// Freezes an owned, uncommitted draft.
    ///
    /// # Errors
    /// Returns a `committed_has_predecessor` violation, a policy violation or
    /// the storage error.
    pub fn commit_draft(
        &self,
        owner_id: &str,
        draft_id: Option<&str>,
        title: Option<&str>,
    ) -> Result<CommittedRecord> {
        self.write(EntityType::Committed)?;
        self.write(EntityType::Milestone)?;
        check_committed_has_predecessor(&self.reader(), draft_id, owner_id)
            .map_err(invariant_error)?;
        let draft_id = draft_id.ok_or_else(|| anyhow!("commit requires a draft id"))?;
        lifecycle::insert_committed(self.conn, self.provenance, draft_id, title)
    }

    /// Records progress against a committed milestone.
    ///
    /// # Errors
    /// Returns a `tracking_target_is_committed` violation, a policy violation
    /// or the storage error.
    pub fn record_progress(
        &self,
        owner_id: &str,
        milestone_id: &str,
        event_type: &str,
        notes: Option<&str>,
    ) -> Result<ProgressEvent> {
        self.write(EntityType::ProgressEvent)?;
        check_tracking_target_is_committed(&self.reader(), milestone_id, owner_id)
            .map_err(invariant_error)?;
        lifecycle::insert_progress_event(
            self.conn,
            self.provenance,
            owner_id,
            milestone_id,
            event_type,
            notes,
        )
    }

    /// Stores a terminal score for an explicitly submitted answer set.
    ///
    /// # Errors
    /// Returns a `scoring_requires_explicit_submission` violation, a policy
    /// violation or the storage error.
    pub fn record_score(
        &self,
        owner_id: &str,
        answers: &Value,
        item_count: u32,
        explicit: bool,
        score: f64,
    ) -> Result<ScoreRecord> {
        self.write(EntityType::Score)?;
        let count = usize::try_from(item_count).unwrap_or(usize::MAX);
        check_scoring_requires_submission(owner_id, count, explicit).map_err(anyhow::Error::new)?;
        lifecycle::insert_score(self.conn, self.provenance, owner_id, answers, item_count, score)
    }

    /// Resolves the committed record a report is built from: `predecessor_id`
    /// when given, otherwise the owner's latest.
    ///
    /// # Errors
    /// Returns a `reporting_requires_committed_predecessor` violation, a
    /// policy violation or the storage error.
    pub fn committed_predecessor(
        &self,
        owner_id: &str,
        predecessor_id: Option<&str>,
    ) -> Result<CommittedRecord> {
        self.read(EntityType::Committed)?;
        self.read(EntityType::Milestone)?;
        let committed_id =
            check_reporting_has_committed_predecessor(&self.reader(), owner_id, predecessor_id)
                .map_err(invariant_error)?;
        lifecycle::get_committed(self.conn, &committed_id)?
            .ok_or_else(|| anyhow!("committed record {committed_id} vanished during read"))
    }

    /// # Errors
    /// Returns the policy violation or the storage error.
    pub fn write_snapshot(
        &self,
        owner_id: &str,
        committed_id: &str,
        snapshot: &Value,
    ) -> Result<ReportSnapshot> {
        self.write(EntityType::Snapshot)?;
        lifecycle::insert_snapshot(
            self.conn,
            self.provenance,
            owner_id,
            committed_id,
            self.provenance.orchestrator_name,
            snapshot,
        )
    }

    /// # Errors
    /// Returns the policy violation or the storage error.
    pub fn owner(&self, owner_id: &str) -> Result<Option<Owner>> {
        self.read(EntityType::Owner)?;
        lifecycle::get_owner(self.conn, owner_id)
    }

    /// # Errors
    /// Returns the policy violation or the storage error.
    pub fn draft(&self, draft_id: &str) -> Result<Option<Draft>> {
        self.read(EntityType::Draft)?;
        lifecycle::get_draft(self.conn, draft_id)
    }

    /// # Errors
    /// Returns the policy violation or the storage error.
    pub fn committed(&self, committed_id: &str) -> Result<Option<CommittedRecord>> {
        self.read(EntityType::Committed)?;
        self.read(EntityType::Milestone)?;
        lifecycle::get_committed(self.conn, committed_id)
    }

    /// # Errors
    /// Returns the policy violation or the storage error.
    pub fn draft_milestones(&self, draft_id: &str) -> Result<Vec<Milestone>> {
        self.read(EntityType::Milestone)?;
        lifecycle::milestones_for_draft(self.conn, draft_id)
    }

    /// # Errors
    /// Returns the policy violation or the storage error.
    pub fn progress_events(&self, owner_id: &str) -> Result<Vec<ProgressEvent>> {
        self.read(EntityType::ProgressEvent)?;
        lifecycle::progress_events_for_owner(self.conn, owner_id)
    }

    /// # Errors
    /// Returns the policy violation or the storage error.
    pub fn scores(&self, owner_id: &str) -> Result<Vec<ScoreRecord>> {
        self.read(EntityType::Score)?;
        lifecycle::scores_for_owner(self.conn, owner_id)
    }

    /// # Errors
    /// Returns the policy violation or the storage error.
    pub fn snapshots(&self, owner_id: &str) -> Result<Vec<ReportSnapshot>> {
        self.read(EntityType::Snapshot)?;
        lifecycle::snapshots_for_owner(self.conn, owner_id)
    }

    /// Reads every raw input of an owner.
    ///
    /// # Errors
    /// Returns the policy violation or the storage error.
    pub fn raw_inputs(&self, owner_id: &str) -> Result<Vec<RawInput>> {
        self.read(EntityType::RawInput)?;
        lifecycle::raw_inputs_for_owner(self.conn, owner_id)
    }
}

#[cfg(test)]
mod tests {
    use audit_ledger_core::{
        AccessPolicy, EntityType, InvariantName, InvariantViolation, ReportingAccess,
    };
    use audit_ledger_store_sqlite::lifecycle::count_rows;
    use audit_ledger_store_sqlite::{Provenance, SqliteLedgerStore};
    use serde_json::json;

    use super::DomainSession;

    fn fixture_store() -> SqliteLedgerStore {
        let store = SqliteLedgerStore::open_in_memory().unwrap_or_else(|_| unreachable!());
        assert!(store.migrate().is_ok());
        store
    }

    const PROVENANCE: Provenance<'static> = Provenance {
        request_id: "r1",
        orchestrator_name: "wf",
    };

    fn violation_name(err: &anyhow::Error) -> Option<InvariantName> {
        err.downcast_ref::<InvariantViolation>()
            .map(InvariantViolation::name)
    }

    #[test]
    fn workflow_gate_blocks_unlisted_writes_before_sql() {
        let store = fixture_store();
        let session = DomainSession::new(
            store.connection(),
            AccessPolicy::workflow([EntityType::Owner]),
            PROVENANCE,
        );
        assert!(session.create_owner("u1", "Ada").is_ok());

        let denied = session.create_draft("u1", None, "plan");
        let Err(err) = denied else {
            panic!("draft write should be denied");
        };
        assert_eq!(violation_name(&err), Some(InvariantName::WriteNotPermitted));
        assert_eq!(
            count_rows(store.connection(), EntityType::Draft).unwrap_or(u64::MAX),
            0
        );
    }

    fn walk_lifecycle(session: &DomainSession<'_>) -> anyhow::Result<()> {
        session.create_owner("u1", "Ada")?;
        let raw = session.record_raw_input("u1", &json!({"text": "goals"}))?;
        let baseline = session.create_baseline("u1", Some(&raw.raw_input_id), "baseline")?;
        let draft = session.create_draft("u1", Some(&baseline), "plan")?;
        let draft_milestone = session.add_milestone(&draft.draft_id, "first")?;

        let untracked = session.record_progress("u1", &draft_milestone.milestone_id, "done", None);
        let Err(err) = untracked else {
            anyhow::bail!("draft milestone must not be trackable");
        };
        assert_eq!(
            violation_name(&err),
            Some(InvariantName::TrackingTargetIsCommitted)
        );

        let committed = session.commit_draft("u1", Some(&draft.draft_id), None)?;
        assert_eq!(committed.milestones.len(), 1);
        session.record_progress("u1", &committed.milestones[0].milestone_id, "done", None)?;
        assert_eq!(session.progress_events("u1")?.len(), 1);

        let again = session.commit_draft("u1", Some(&draft.draft_id), None);
        let Err(err) = again else {
            anyhow::bail!("double commit must fail");
        };
        assert_eq!(
            violation_name(&err),
            Some(InvariantName::CommittedHasPredecessor)
        );
        Ok(())
    }

    #[test]
    fn lifecycle_runs_through_invariants() {
        let store = fixture_store();
        let session = DomainSession::new(store.connection(), AccessPolicy::unrestricted(), PROVENANCE);
        let walked = walk_lifecycle(&session);
        assert!(walked.is_ok(), "{walked:?}");
    }

    #[test]
    fn scoring_requires_explicit_submission() {
        let store = fixture_store();
        let session = DomainSession::new(store.connection(), AccessPolicy::unrestricted(), PROVENANCE);
        let partial = session.record_score("u1", &json!([1, 2, 3, 4, 5]), 5, false, 0.8);
        let Err(err) = partial else {
            panic!("implicit submission must not score");
        };
        assert_eq!(
            violation_name(&err),
            Some(InvariantName::ScoringRequiresExplicitSubmission)
        );
        assert!(session
            .record_score("u1", &json!([1, 2, 3, 4, 5]), 5, true, 0.8)
            .is_ok());
    }

    #[test]
    fn reporting_session_only_reads_allow_list_and_writes_snapshots() {
        let store = fixture_store();
        let session = DomainSession::new(
            store.connection(),
            AccessPolicy::Reporting(ReportingAccess::analytics("weekly_report")),
            PROVENANCE,
        );

        let denied = session.raw_inputs("u1");
        let Err(err) = denied else {
            panic!("raw input read should be denied");
        };
        assert_eq!(violation_name(&err), Some(InvariantName::ReportingIsReadOnly));

        let denied = session.create_owner("u2", "Grace");
        assert!(denied.is_err());

        let missing = session.committed_predecessor("u1", None);
        let Err(err) = missing else {
            panic!("no committed predecessor exists");
        };
        assert_eq!(
            violation_name(&err),
            Some(InvariantName::ReportingRequiresCommittedPredecessor)
        );
        assert!(session.scores("u1").is_ok());
    }
}
