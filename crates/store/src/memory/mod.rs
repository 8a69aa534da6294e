//! In-process store backend.
//!
//! Holds every table in one `Mutex`, so each trait method is a single
//! atomic step exactly like the conditional UPDATEs of the PostgreSQL
//! backend. Used by tests and single-process deployments.
//!
//! Failures can be injected per operation with [`MemoryStore::fail_next`]
//! to exercise retry and classification paths.

mod directory;
mod incidents;
mod jobs;
mod lease;

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use uuid::Uuid;

use oncall_core::{
    BackgroundJob, Channel, EscalationStep, Incident, Schedule, SchedulerLease, Team, TimelineEntry,
};

use crate::error::{StoreError, StoreResult};

#[derive(Default)]
pub(crate) struct State {
    pub(crate) incidents: HashMap<Uuid, Incident>,
    /// Service id → ordered policy steps.
    pub(crate) policies: HashMap<Uuid, Vec<EscalationStep>>,
    pub(crate) teams: HashMap<Uuid, Team>,
    pub(crate) schedules: HashMap<Uuid, Schedule>,
    pub(crate) channels: HashMap<Uuid, Vec<Channel>>,
    pub(crate) timeline: Vec<TimelineEntry>,
    pub(crate) jobs: HashMap<Uuid, BackgroundJob>,
    pub(crate) lease: SchedulerLease,
    faults: HashMap<&'static str, VecDeque<StoreError>>,
}

impl State {
    /// Pop an injected failure for `op`, if any.
    pub(crate) fn fault(&mut self, op: &'static str) -> StoreResult<()> {
        match self.faults.get_mut(op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Seeding ──────────────────────────────────────────────

    pub fn insert_incident(&self, incident: Incident) {
        self.lock().incidents.insert(incident.id, incident);
    }

    /// Attach an ordered policy to a service, replacing any existing one.
    pub fn insert_policy(&self, service_id: Uuid, mut steps: Vec<EscalationStep>) {
        steps.sort_by_key(|s| s.order);
        self.lock().policies.insert(service_id, steps);
    }

    pub fn insert_team(&self, team: Team) {
        self.lock().teams.insert(team.id, team);
    }

    pub fn insert_schedule(&self, schedule: Schedule) {
        self.lock().schedules.insert(schedule.id, schedule);
    }

    pub fn set_preferred_channels(&self, user_id: Uuid, channels: Vec<Channel>) {
        self.lock().channels.insert(user_id, channels);
    }

    /// Apply an arbitrary edit to a stored incident, as a UI or API would.
    pub fn update_incident(&self, id: Uuid, edit: impl FnOnce(&mut Incident)) -> bool {
        match self.lock().incidents.get_mut(&id) {
            Some(incident) => {
                edit(incident);
                true
            }
            None => false,
        }
    }

    // ── Inspection ───────────────────────────────────────────

    pub fn incident(&self, id: Uuid) -> Option<Incident> {
        self.lock().incidents.get(&id).cloned()
    }

    pub fn timeline(&self, incident_id: Uuid) -> Vec<TimelineEntry> {
        self.lock()
            .timeline
            .iter()
            .filter(|e| e.incident_id == incident_id)
            .cloned()
            .collect()
    }

    pub fn jobs(&self) -> Vec<BackgroundJob> {
        let mut jobs: Vec<BackgroundJob> = self.lock().jobs.values().cloned().collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        jobs
    }

    // ── Fault injection ──────────────────────────────────────

    /// Make the next call to `op` (a trait method name) fail with `err`.
    pub fn fail_next(&self, op: &'static str, err: StoreError) {
        self.lock().faults.entry(op).or_default().push_back(err);
    }
}
