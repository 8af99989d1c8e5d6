//! The table of live sessions and the capacity accounting around it.
//!
//! Every membership change goes through one lock. Removal hands the
//! [`Session`] (and with it the environment handle) to the caller by value,
//! so whoever removes a session is the only one who can destroy its
//! environment.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::OrchestratorError;
use crate::runtime::EnvironmentHandle;

/// One user's sandbox.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub environment: EnvironmentHandle,
    pub working_directory: String,
    pub created_at: Instant,
    pub last_activity_at: Instant,
    /// Admission order; last tiebreak for eviction.
    seq: u64,
    /// Serializes `cd` resolution on this session.
    navigation: Arc<tokio::sync::Mutex<()>>,
}

/// Point-in-time copy of a session's fields.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub id: String,
    pub environment: EnvironmentHandle,
    pub working_directory: String,
    pub created_at: Instant,
    pub last_activity_at: Instant,
    pub(crate) navigation: Arc<tokio::sync::Mutex<()>>,
}

impl Session {
    fn view(&self) -> SessionView {
        SessionView {
            id: self.id.clone(),
            environment: self.environment.clone(),
            working_directory: self.working_directory.clone(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            navigation: self.navigation.clone(),
        }
    }

    fn eviction_key(&self) -> (Instant, Instant, u64) {
        (self.last_activity_at, self.created_at, self.seq)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    Evicted,
    Inactive,
    LifetimeExceeded,
    Terminated,
}

impl fmt::Display for RetireReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            RetireReason::Evicted => "evicted",
            RetireReason::Inactive => "inactive",
            RetireReason::LifetimeExceeded => "lifetime exceeded",
            RetireReason::Terminated => "terminated",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Default)]
struct Table {
    sessions: HashMap<String, Session>,
    /// Slots held by creations whose environment is still being provisioned.
    provisioning: usize,
    next_seq: u64,
}

type Shared = Arc<Mutex<Table>>;

fn lock(table: &Shared) -> MutexGuard<'_, Table> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A capacity slot held while an environment is created.
///
/// Dropping it without [`Registry::admit`] gives the slot back.
#[derive(Debug)]
pub struct Reservation {
    table: Shared,
    released: bool,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.released {
            let mut table = lock(&self.table);
            table.provisioning = table.provisioning.saturating_sub(1);
        }
    }
}

#[derive(Debug, Clone)]
pub struct Registry {
    capacity: usize,
    table: Shared,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            table: Arc::new(Mutex::new(Table::default())),
        }
    }

    /// Claim a slot for a new session, evicting least-recently-active
    /// sessions until live plus provisioning sessions fit under capacity.
    /// The evicted sessions are returned for destruction.
    pub fn reserve(&self) -> Result<(Reservation, Vec<Session>), OrchestratorError> {
        let mut table = lock(&self.table);
        if table.provisioning >= self.capacity {
            return Err(OrchestratorError::AtCapacity(self.capacity));
        }
        let mut evicted = Vec::new();
        while table.sessions.len() + table.provisioning >= self.capacity {
            let Some(victim) = table
                .sessions
                .values()
                .min_by_key(|s| s.eviction_key())
                .map(|s| s.id.clone())
            else {
                break;
            };
            if let Some(session) = table.sessions.remove(&victim) {
                evicted.push(session);
            }
        }
        table.provisioning += 1;
        let reservation = Reservation {
            table: self.table.clone(),
            released: false,
        };
        Ok((reservation, evicted))
    }

    /// Turn a reservation into a live session backed by `environment`.
    pub fn admit(&self, mut reservation: Reservation, environment: EnvironmentHandle) -> SessionView {
        let mut table = lock(&self.table);
        reservation.released = true;
        table.provisioning = table.provisioning.saturating_sub(1);
        let now = Instant::now();
        let seq = table.next_seq;
        table.next_seq += 1;
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            working_directory: environment.home.clone(),
            environment,
            created_at: now,
            last_activity_at: now,
            seq,
            navigation: Arc::new(tokio::sync::Mutex::new(())),
        };
        let view = session.view();
        table.sessions.insert(session.id.clone(), session);
        view
    }

    /// Look a session up and mark it active.
    pub fn touch(&self, id: &str) -> Result<SessionView, OrchestratorError> {
        let mut table = lock(&self.table);
        let session = table
            .sessions
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(id.to_string()))?;
        session.last_activity_at = Instant::now();
        Ok(session.view())
    }

    /// Look a session up without refreshing its activity.
    pub fn get(&self, id: &str) -> Option<SessionView> {
        lock(&self.table).sessions.get(id).map(Session::view)
    }

    pub fn contains(&self, id: &str) -> bool {
        lock(&self.table).sessions.contains_key(id)
    }

    pub fn list(&self) -> Vec<SessionView> {
        let table = lock(&self.table);
        let mut views: Vec<_> = table.sessions.values().map(Session::view).collect();
        views.sort_by_key(|v| v.created_at);
        views
    }

    pub fn len(&self) -> usize {
        lock(&self.table).sessions.len()
    }

    pub fn set_working_directory(&self, id: &str, directory: String) -> Result<(), OrchestratorError> {
        let mut table = lock(&self.table);
        let session = table
            .sessions
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(id.to_string()))?;
        session.working_directory = directory;
        session.last_activity_at = Instant::now();
        Ok(())
    }

    /// Remove a session if it is still present.
    pub fn remove(&self, id: &str) -> Option<Session> {
        lock(&self.table).sessions.remove(id)
    }

    /// Remove, in one step, every session idle longer than `inactivity` or
    /// older than `lifetime` at `now`.
    pub fn take_expired(
        &self,
        now: Instant,
        inactivity: Duration,
        lifetime: Duration,
    ) -> Vec<(Session, RetireReason)> {
        let mut table = lock(&self.table);
        let expired: Vec<(String, RetireReason)> = table
            .sessions
            .values()
            .filter_map(|s| {
                if now.duration_since(s.created_at) > lifetime {
                    Some((s.id.clone(), RetireReason::LifetimeExceeded))
                } else if now.duration_since(s.last_activity_at) > inactivity {
                    Some((s.id.clone(), RetireReason::Inactive))
                } else {
                    None
                }
            })
            .collect();
        expired
            .into_iter()
            .filter_map(|(id, reason)| table.sessions.remove(&id).map(|s| (s, reason)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(n: u32) -> EnvironmentHandle {
        EnvironmentHandle {
            id: format!("env-{n}"),
            home: "/home".to_string(),
        }
    }

    fn admit(registry: &Registry, n: u32) -> (SessionView, Vec<Session>) {
        let (reservation, evicted) = registry.reserve().unwrap();
        (registry.admit(reservation, env(n)), evicted)
    }

    #[tokio::test(start_paused = true)]
    async fn evicts_least_recently_active_at_capacity() {
        let registry = Registry::new(2);
        let (s1, _) = admit(&registry, 1);
        tokio::time::advance(Duration::from_secs(1)).await;
        let (s2, _) = admit(&registry, 2);
        tokio::time::advance(Duration::from_secs(1)).await;
        // s1 becomes the most recently active.
        registry.touch(&s1.id).unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;

        let (s3, evicted) = admit(&registry, 3);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, s2.id);
        assert_eq!(evicted[0].environment, env(2));
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(&s1.id));
        assert!(registry.contains(&s3.id));
    }

    #[tokio::test(start_paused = true)]
    async fn ties_fall_back_to_creation_order() {
        let registry = Registry::new(2);
        let (s1, _) = admit(&registry, 1);
        let (_s2, _) = admit(&registry, 2);
        let (_s3, evicted) = admit(&registry, 3);
        assert_eq!(evicted[0].id, s1.id);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_capacity() {
        let registry = Registry::new(3);
        for n in 0..20 {
            admit(&registry, n);
            tokio::time::advance(Duration::from_millis(10)).await;
            assert!(registry.len() <= 3);
        }
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn provisioning_slots_count_against_capacity() {
        let registry = Registry::new(1);
        let (pending, _) = registry.reserve().unwrap();
        assert!(matches!(registry.reserve(), Err(OrchestratorError::AtCapacity(1))));
        drop(pending);
        let (reservation, evicted) = registry.reserve().unwrap();
        assert!(evicted.is_empty());
        registry.admit(reservation, env(1));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn reservation_for_pending_creation_evicts_live_session() {
        let registry = Registry::new(2);
        let (first, _) = admit(&registry, 1);
        let (_pending, evicted) = registry.reserve().unwrap();
        assert!(evicted.is_empty());
        let (_another, evicted) = registry.reserve().unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, first.id);
    }

    #[test]
    fn removed_ids_are_not_found() {
        let registry = Registry::new(4);
        let (s, _) = admit(&registry, 1);
        assert!(registry.remove(&s.id).is_some());
        assert!(registry.remove(&s.id).is_none());
        assert!(matches!(registry.touch(&s.id), Err(OrchestratorError::SessionNotFound(_))));
        assert!(registry
            .set_working_directory(&s.id, "/tmp".into())
            .is_err());
        assert!(registry.get(&s.id).is_none());
    }

    #[test]
    fn new_sessions_start_in_environment_home() {
        let registry = Registry::new(4);
        let (s, _) = admit(&registry, 1);
        assert_eq!(s.working_directory, "/home");
        registry.set_working_directory(&s.id, "/home/tmp".into()).unwrap();
        assert_eq!(registry.get(&s.id).unwrap().working_directory, "/home/tmp");
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_checks_inactivity_and_lifetime_independently() {
        let registry = Registry::new(4);
        let inactivity = Duration::from_secs(600);
        let lifetime = Duration::from_secs(3600);

        let (old_but_busy, _) = admit(&registry, 1);
        tokio::time::advance(Duration::from_secs(3000)).await;
        let (idle, _) = admit(&registry, 2);
        let (fresh, _) = admit(&registry, 3);

        // Keep the old session and the fresh one busy.
        for _ in 0..7 {
            tokio::time::advance(Duration::from_secs(100)).await;
            registry.touch(&old_but_busy.id).unwrap();
            registry.touch(&fresh.id).unwrap();
        }

        let mut expired = registry.take_expired(Instant::now(), inactivity, lifetime);
        expired.sort_by_key(|(s, _)| s.environment.id.clone());
        let summary: Vec<_> = expired.iter().map(|(s, r)| (s.id.clone(), *r)).collect();
        assert_eq!(
            summary,
            vec![
                (old_but_busy.id.clone(), RetireReason::LifetimeExceeded),
                (idle.id.clone(), RetireReason::Inactive),
            ]
        );
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&fresh.id));
        assert!(registry.take_expired(Instant::now(), inactivity, lifetime).is_empty());
    }
}
