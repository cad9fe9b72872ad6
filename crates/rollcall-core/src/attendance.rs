//! Attendance matching.
//!
//! Converts recognition events into session-scoped attendance writes. The
//! matcher owns the identity-resolution cache, the cooldown entries, and the
//! insert guard that serializes check-then-insert; durable state lives behind
//! the [`StudentDirectory`], [`AttendanceStore`] and [`SessionRegistry`]
//! collaborators.

use crate::config::RecognitionConfig;
use crate::cooldown::{CooldownState, CooldownStore};
use crate::gallery;
use crate::types::{FaceMatch, Identity, Recognition, SessionId};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("attendance already recorded for {identity} in session {session}")]
    Duplicate { identity: Identity, session: SessionId },
    #[error("storage backend: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum MarkError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Registered people.
pub trait StudentDirectory: Send + Sync {
    /// Canonical identity for a raw or folder-safe identifier.
    fn resolve(&self, raw: &str) -> Result<Option<Identity>, StoreError>;

    /// Display name, if one is recorded.
    fn lookup_name(&self, identity: &Identity) -> Result<Option<String>, StoreError>;

    fn exists(&self, identity: &Identity) -> Result<bool, StoreError> {
        Ok(self.resolve(identity.as_str())?.is_some())
    }
}

/// Durable attendance records.
pub trait AttendanceStore: Send + Sync {
    fn exists(&self, identity: &Identity, session: SessionId) -> Result<bool, StoreError>;

    /// Insert a record. A second record for the same pairing must fail with
    /// [`StoreError::Duplicate`].
    fn insert(&self, record: &AttendanceRecord) -> Result<(), StoreError>;
}

pub trait SessionRegistry: Send + Sync {
    fn is_active(&self, session: SessionId) -> Result<bool, StoreError>;
}

/// Time source for cooldown windows and record timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn local_now(&self) -> NaiveDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn local_now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttendanceStatus {
    Present,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "Present",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub identity: Identity,
    pub session: SessionId,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub status: AttendanceStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UnknownIdentity,
    InactiveSession,
}

/// Result of a single mark attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// A new record was written.
    Marked,
    /// A record already existed, or the pairing is cooling down.
    AlreadyMarked { notified: bool },
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Marked,
    AlreadyMarked,
}

/// Last recognition event, for display by whoever polls the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub identity: Identity,
    pub name: String,
    pub status: NotificationStatus,
}

/// Single-slot notification board. Publishing overwrites; taking clears.
#[derive(Debug, Default)]
pub struct NotificationBoard {
    slot: Mutex<Option<Notification>>,
}

impl NotificationBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, notification: Notification) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(notification);
    }

    pub fn take(&self) -> Option<Notification> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Per-face status in a frame report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaceStatus {
    Marked,
    AlreadyMarked,
    Unknown,
}

/// Overall frame status. Variants are ordered by priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameStatus {
    NoMatch,
    AlreadyMarked,
    Marked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceReport {
    #[serde(flatten)]
    pub face: FaceMatch,
    pub name: Option<String>,
    pub status: FaceStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameReport {
    pub status: FrameStatus,
    /// Name of the last recognized face, if any.
    pub name: Option<String>,
    pub faces: Vec<FaceReport>,
}

pub struct AttendanceMatcher {
    students: Arc<dyn StudentDirectory>,
    store: Arc<dyn AttendanceStore>,
    sessions: Arc<dyn SessionRegistry>,
    clock: Arc<dyn Clock>,
    board: Arc<NotificationBoard>,
    cooldown: CooldownStore,
    /// Raw identifier → canonical identity. Only positive lookups are cached.
    resolved: Mutex<HashMap<String, Identity>>,
    insert_guard: Mutex<()>,
}

impl AttendanceMatcher {
    pub fn new(
        students: Arc<dyn StudentDirectory>,
        store: Arc<dyn AttendanceStore>,
        sessions: Arc<dyn SessionRegistry>,
        board: Arc<NotificationBoard>,
        config: &RecognitionConfig,
    ) -> Self {
        Self {
            students,
            store,
            sessions,
            clock: Arc::new(SystemClock),
            board,
            cooldown: CooldownStore::new(
                config.cooldown(),
                config.notify_window(),
                config.cooldown_eviction(),
            ),
            resolved: Mutex::new(HashMap::new()),
            insert_guard: Mutex::new(()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn board(&self) -> &Arc<NotificationBoard> {
        &self.board
    }

    /// Resolve a raw or folder-safe identifier to its canonical identity.
    pub fn resolve(&self, raw: &str) -> Result<Option<Identity>, MarkError> {
        if let Some(hit) = self.cache().get(raw) {
            return Ok(Some(hit.clone()));
        }
        let resolved = self.students.resolve(raw)?;
        if let Some(identity) = &resolved {
            let mut cache = self.cache();
            cache.insert(raw.to_string(), identity.clone());
            cache.insert(identity.as_str().to_string(), identity.clone());
        }
        Ok(resolved)
    }

    /// Drop cached resolutions and cooldown entries for a removed identity,
    /// given in either its raw or folder-safe form.
    pub fn forget(&self, identity: &str) {
        let safe = gallery::folder_name(identity);
        let same = |other: &str| gallery::folder_name(other) == safe;
        self.cache().retain(|raw, id| !same(raw) && !same(id.as_str()));
        self.cooldown.forget(|id| same(id.as_str()));
    }

    pub fn clear(&self) {
        self.cache().clear();
        self.cooldown.clear();
    }

    /// Record attendance for `identity` in `session`, at most once per pairing.
    pub fn mark(&self, identity: &Identity, session: SessionId) -> Result<MarkOutcome, MarkError> {
        Ok(self.mark_resolved(identity, session)?.0)
    }

    /// [`Self::mark`], also returning the canonical identity the attempt
    /// resolved to.
    fn mark_resolved(
        &self,
        identity: &Identity,
        session: SessionId,
    ) -> Result<(MarkOutcome, Option<Identity>), MarkError> {
        let Some(canonical) = self.resolve(identity.as_str())? else {
            tracing::debug!(identity = %identity, "mark rejected: unknown identity");
            return Ok((MarkOutcome::Rejected(RejectReason::UnknownIdentity), None));
        };
        if !self.sessions.is_active(session)? {
            tracing::debug!(session = %session, "mark rejected: inactive session");
            return Ok((MarkOutcome::Rejected(RejectReason::InactiveSession), Some(canonical)));
        }

        let now = self.clock.now();
        if let CooldownState::Cooling { notify } = self.cooldown.check(&canonical, session, now) {
            if notify {
                self.notify(&canonical, NotificationStatus::AlreadyMarked);
            }
            return Ok((MarkOutcome::AlreadyMarked { notified: notify }, Some(canonical)));
        }

        let outcome = {
            let _guard = self.insert_guard.lock().unwrap_or_else(PoisonError::into_inner);
            if self.store.exists(&canonical, session)? {
                MarkOutcome::AlreadyMarked { notified: true }
            } else {
                let local = self.clock.local_now();
                let record = AttendanceRecord {
                    identity: canonical.clone(),
                    session,
                    date: local.date(),
                    time: local.time(),
                    status: AttendanceStatus::Present,
                };
                match self.store.insert(&record) {
                    Ok(()) => MarkOutcome::Marked,
                    Err(StoreError::Duplicate { .. }) => MarkOutcome::AlreadyMarked { notified: true },
                    Err(e) => return Err(e.into()),
                }
            }
        };

        match outcome {
            MarkOutcome::Marked => {
                tracing::info!(identity = %canonical, session = %session, "attendance recorded");
                self.notify(&canonical, NotificationStatus::Marked);
            }
            _ => {
                tracing::debug!(identity = %canonical, session = %session, "already marked");
                self.notify(&canonical, NotificationStatus::AlreadyMarked);
            }
        }
        self.cooldown.record_mark(&canonical, session, now);
        Ok((outcome, Some(canonical)))
    }

    /// Mark every identified face of one frame and aggregate the statuses.
    pub fn mark_matches(&self, matches: Vec<FaceMatch>, session: SessionId) -> Result<FrameReport, MarkError> {
        let mut status = FrameStatus::NoMatch;
        let mut last_name = None;
        let mut faces = Vec::with_capacity(matches.len());

        for mut face in matches {
            let label = face.recognition.identity().cloned();
            let (face_status, name) = match label {
                None => (FaceStatus::Unknown, None),
                Some(identity) => match self.mark_resolved(&identity, session)? {
                    (MarkOutcome::Rejected(_), _) | (_, None) => (FaceStatus::Unknown, None),
                    (outcome, Some(canonical)) => {
                        let face_status = if outcome == MarkOutcome::Marked {
                            FaceStatus::Marked
                        } else {
                            FaceStatus::AlreadyMarked
                        };
                        // classifier labels are folder-safe; report the directory form
                        let name = self.display_name(&canonical);
                        face.recognition = Recognition::Identified(canonical);
                        (face_status, Some(name))
                    }
                },
            };

            let frame_status = match face_status {
                FaceStatus::Marked => FrameStatus::Marked,
                FaceStatus::AlreadyMarked => FrameStatus::AlreadyMarked,
                FaceStatus::Unknown => FrameStatus::NoMatch,
            };
            status = status.max(frame_status);
            if name.is_some() {
                last_name = name.clone();
            }
            faces.push(FaceReport { face, name, status: face_status });
        }

        Ok(FrameReport { status, name: last_name, faces })
    }

    fn display_name(&self, identity: &Identity) -> String {
        match self.students.lookup_name(identity) {
            Ok(Some(name)) => name,
            Ok(None) => identity.to_string(),
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "name lookup failed");
                identity.to_string()
            }
        }
    }

    fn notify(&self, identity: &Identity, status: NotificationStatus) {
        self.board.publish(Notification {
            identity: identity.clone(),
            name: self.display_name(identity),
            status,
        });
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, Identity>> {
        self.resolved.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::FaceBox;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    pub(crate) struct FakeStudents {
        pub names: HashMap<String, String>,
        pub lookups: AtomicUsize,
    }

    impl FakeStudents {
        pub(crate) fn with(ids: &[(&str, &str)]) -> Self {
            Self {
                names: ids.iter().map(|(id, n)| (id.to_string(), n.to_string())).collect(),
                lookups: AtomicUsize::new(0),
            }
        }
    }

    impl StudentDirectory for FakeStudents {
        fn resolve(&self, raw: &str) -> Result<Option<Identity>, StoreError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .names
                .keys()
                .find(|id| id.as_str() == raw || gallery::folder_name(id) == raw)
                .map(|id| Identity::from(id.as_str())))
        }

        fn lookup_name(&self, identity: &Identity) -> Result<Option<String>, StoreError> {
            Ok(self.names.get(identity.as_str()).cloned())
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeStore {
        pub records: Mutex<Vec<AttendanceRecord>>,
    }

    impl FakeStore {
        pub(crate) fn count(&self) -> usize {
            self.records.lock().unwrap().len()
        }
    }

    impl AttendanceStore for FakeStore {
        fn exists(&self, identity: &Identity, session: SessionId) -> Result<bool, StoreError> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .any(|r| &r.identity == identity && r.session == session))
        }

        fn insert(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
            let mut records = self.records.lock().unwrap();
            if records.iter().any(|r| r.identity == record.identity && r.session == record.session) {
                return Err(StoreError::Duplicate {
                    identity: record.identity.clone(),
                    session: record.session,
                });
            }
            records.push(record.clone());
            Ok(())
        }
    }

    pub(crate) struct FakeSessions(pub HashSet<i64>);

    impl SessionRegistry for FakeSessions {
        fn is_active(&self, session: SessionId) -> Result<bool, StoreError> {
            Ok(self.0.contains(&session.0))
        }
    }

    pub(crate) struct ManualClock {
        origin: Instant,
        offset: Mutex<Duration>,
    }

    impl ManualClock {
        pub(crate) fn new() -> Self {
            Self {
                origin: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
            }
        }

        pub(crate) fn set(&self, secs: u64) {
            *self.offset.lock().unwrap() = Duration::from_secs(secs);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.origin + *self.offset.lock().unwrap()
        }

        fn local_now(&self) -> NaiveDateTime {
            let start = NaiveDate::from_ymd_opt(2024, 3, 4)
                .and_then(|d| d.and_hms_opt(9, 0, 0))
                .unwrap();
            start + chrono::Duration::from_std(*self.offset.lock().unwrap()).unwrap()
        }
    }

    struct Fixture {
        matcher: AttendanceMatcher,
        store: Arc<FakeStore>,
        students: Arc<FakeStudents>,
        clock: Arc<ManualClock>,
        board: Arc<NotificationBoard>,
    }

    fn fixture() -> Fixture {
        let students = Arc::new(FakeStudents::with(&[("123/A", "Ada"), ("456-B", "Bo")]));
        let store = Arc::new(FakeStore::default());
        let sessions = Arc::new(FakeSessions([1, 2].into_iter().collect()));
        let clock = Arc::new(ManualClock::new());
        let board = Arc::new(NotificationBoard::new());
        let matcher = AttendanceMatcher::new(
            students.clone(),
            store.clone(),
            sessions,
            board.clone(),
            &RecognitionConfig::default(),
        )
        .with_clock(clock.clone());
        Fixture { matcher, store, students, clock, board }
    }

    fn id(s: &str) -> Identity {
        Identity::from(s)
    }

    fn face(tag: Option<&str>) -> FaceMatch {
        FaceMatch {
            bbox: FaceBox { x: 0, y: 0, width: 50, height: 50 },
            recognition: tag.map_or(Recognition::Unknown, |t| Recognition::Identified(id(t))),
            distance: Some(20.0),
            confidence: 80.0,
        }
    }

    #[test]
    fn test_repeated_marks_write_once() {
        let f = fixture();
        let mut outcomes = Vec::new();
        for t in [0, 1, 3, 11, 12, 30, 400] {
            f.clock.set(t);
            outcomes.push(f.matcher.mark(&id("456-B"), SessionId(1)).unwrap());
        }
        assert_eq!(outcomes[0], MarkOutcome::Marked);
        assert!(outcomes[1..]
            .iter()
            .all(|o| matches!(o, MarkOutcome::AlreadyMarked { .. })));
        assert_eq!(f.store.count(), 1);
    }

    #[test]
    fn test_cooldown_and_notify_windows() {
        let f = fixture();
        let student = id("456-B");

        f.clock.set(0);
        assert_eq!(f.matcher.mark(&student, SessionId(1)).unwrap(), MarkOutcome::Marked);
        let n = f.board.take().unwrap();
        assert_eq!(n.status, NotificationStatus::Marked);
        assert_eq!(n.name, "Bo");

        f.clock.set(1);
        assert_eq!(
            f.matcher.mark(&student, SessionId(1)).unwrap(),
            MarkOutcome::AlreadyMarked { notified: false }
        );
        assert!(f.board.take().is_none());

        f.clock.set(3);
        assert_eq!(
            f.matcher.mark(&student, SessionId(1)).unwrap(),
            MarkOutcome::AlreadyMarked { notified: true }
        );
        assert_eq!(f.board.take().unwrap().status, NotificationStatus::AlreadyMarked);

        f.clock.set(11);
        assert_eq!(
            f.matcher.mark(&student, SessionId(1)).unwrap(),
            MarkOutcome::AlreadyMarked { notified: true }
        );
        assert_eq!(f.board.take().unwrap().status, NotificationStatus::AlreadyMarked);

        assert_eq!(f.store.count(), 1);
    }

    #[test]
    fn test_record_carries_local_timestamp() {
        let f = fixture();
        f.clock.set(75);
        f.matcher.mark(&id("456-B"), SessionId(2)).unwrap();
        let records = f.store.records.lock().unwrap();
        assert_eq!(records[0].date, NaiveDate::from_ymd_opt(2024, 3, 4).unwrap());
        assert_eq!(records[0].time, NaiveTime::from_hms_opt(9, 1, 15).unwrap());
        assert_eq!(records[0].status.as_str(), "Present");
    }

    #[test]
    fn test_folder_safe_identifier_resolves_to_canonical() {
        let f = fixture();
        assert_eq!(f.matcher.resolve("123/A").unwrap(), f.matcher.resolve("123-A").unwrap());
        assert_eq!(f.matcher.resolve("123-A").unwrap(), Some(id("123/A")));

        assert_eq!(f.matcher.mark(&id("123-A"), SessionId(1)).unwrap(), MarkOutcome::Marked);
        assert_eq!(f.store.records.lock().unwrap()[0].identity, id("123/A"));
    }

    #[test]
    fn test_resolution_is_cached() {
        let f = fixture();
        f.matcher.resolve("123-A").unwrap();
        let lookups = f.students.lookups.load(Ordering::SeqCst);
        f.matcher.resolve("123-A").unwrap();
        f.matcher.resolve("123/A").unwrap();
        assert_eq!(f.students.lookups.load(Ordering::SeqCst), lookups);

        f.matcher.forget("123/A");
        f.matcher.resolve("123-A").unwrap();
        assert_eq!(f.students.lookups.load(Ordering::SeqCst), lookups + 1);
    }

    #[test]
    fn test_frame_report_names_folder_safe_label() {
        let f = fixture();
        let report = f.matcher.mark_matches(vec![face(Some("123-A"))], SessionId(1)).unwrap();
        assert_eq!(report.status, FrameStatus::Marked);
        assert_eq!(report.name.as_deref(), Some("Ada"));
        assert_eq!(report.faces[0].name.as_deref(), Some("Ada"));
        assert_eq!(
            report.faces[0].face.recognition,
            Recognition::Identified(id("123/A"))
        );
        assert_eq!(f.board.take().unwrap().name, "Ada");
    }

    #[test]
    fn test_forget_folder_safe_form_drops_canonical_entries() {
        let f = fixture();
        f.matcher.mark(&id("123/A"), SessionId(1)).unwrap();
        let lookups = f.students.lookups.load(Ordering::SeqCst);

        f.matcher.forget("123-A");
        f.matcher.resolve("123/A").unwrap();
        assert_eq!(f.students.lookups.load(Ordering::SeqCst), lookups + 1);

        // the cooldown entry is gone too, so the next mark reaches the store
        f.clock.set(1);
        assert_eq!(
            f.matcher.mark(&id("123/A"), SessionId(1)).unwrap(),
            MarkOutcome::AlreadyMarked { notified: true }
        );
    }

    #[test]
    fn test_unknown_identity_rejected_silently() {
        let f = fixture();
        assert_eq!(
            f.matcher.mark(&id("ghost"), SessionId(1)).unwrap(),
            MarkOutcome::Rejected(RejectReason::UnknownIdentity)
        );
        assert_eq!(f.store.count(), 0);
        assert!(f.board.take().is_none());
    }

    #[test]
    fn test_inactive_session_rejected() {
        let f = fixture();
        assert_eq!(
            f.matcher.mark(&id("456-B"), SessionId(9)).unwrap(),
            MarkOutcome::Rejected(RejectReason::InactiveSession)
        );
        assert_eq!(f.store.count(), 0);
    }

    #[test]
    fn test_concurrent_marks_write_once() {
        let f = Arc::new(fixture());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let f = Arc::clone(&f);
                std::thread::spawn(move || f.matcher.mark(&id("456-B"), SessionId(1)).unwrap())
            })
            .collect();
        let marked = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| *o == MarkOutcome::Marked)
            .count();
        assert_eq!(marked, 1);
        assert_eq!(f.store.count(), 1);
    }

    #[test]
    fn test_frame_status_priority() {
        let f = fixture();
        f.matcher.mark(&id("123/A"), SessionId(1)).unwrap();

        let report = f
            .matcher
            .mark_matches(vec![face(None), face(Some("123/A")), face(Some("456-B"))], SessionId(1))
            .unwrap();
        assert_eq!(report.status, FrameStatus::Marked);
        assert_eq!(report.name.as_deref(), Some("Bo"));
        let statuses: Vec<FaceStatus> = report.faces.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![FaceStatus::Unknown, FaceStatus::AlreadyMarked, FaceStatus::Marked]
        );

        let report = f.matcher.mark_matches(vec![face(Some("456-B"))], SessionId(1)).unwrap();
        assert_eq!(report.status, FrameStatus::AlreadyMarked);

        let report = f.matcher.mark_matches(vec![face(None)], SessionId(1)).unwrap();
        assert_eq!(report.status, FrameStatus::NoMatch);
        assert!(report.name.is_none());
    }

    #[test]
    fn test_board_take_clears() {
        let board = NotificationBoard::new();
        board.publish(Notification {
            identity: id("a"),
            name: "A".into(),
            status: NotificationStatus::Marked,
        });
        assert_eq!(board.take().map(|n| n.name), Some("A".to_string()));
        assert!(board.take().is_none());
    }
}
