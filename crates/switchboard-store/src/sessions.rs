use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use switchboard_core::ids::Identity;
use switchboard_core::step::Step;

#[derive(Debug, Default)]
struct SessionState {
    steps: Vec<Step>,
    completed: bool,
    goal: Option<String>,
    error: Option<String>,
}

/// Point-in-time copy of a session, in the shape the web client replays.
#[derive(Clone, Debug, Serialize)]
pub struct SessionSnapshot {
    pub messages: Vec<Step>,
    pub goal: Option<String>,
    pub completed: bool,
    pub error: Option<String>,
}

/// Step history and completion status for one identity.
#[derive(Debug)]
pub struct Session {
    identity: Identity,
    state: Mutex<SessionState>,
}

impl Session {
    fn new(identity: Identity) -> Self {
        Self {
            identity,
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn append_step(&self, step: Step) {
        self.state.lock().steps.push(step);
    }

    pub fn steps(&self) -> Vec<Step> {
        self.state.lock().steps.clone()
    }

    pub fn step_count(&self) -> usize {
        self.state.lock().steps.len()
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    pub fn goal(&self) -> Option<String> {
        self.state.lock().goal.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    pub fn set_goal(&self, goal: impl Into<String>) {
        self.state.lock().goal = Some(goal.into());
    }

    pub fn complete(&self) {
        let mut state = self.state.lock();
        state.completed = true;
        state.error = None;
    }

    pub fn fail(&self, error: impl Into<String>) {
        let mut state = self.state.lock();
        state.completed = true;
        state.error = Some(error.into());
    }

    /// Clear history for a new task. A task still running keeps appending
    /// into the emptied sequence.
    pub fn reset(&self) {
        *self.state.lock() = SessionState::default();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();
        SessionSnapshot {
            messages: state.steps.clone(),
            goal: state.goal.clone(),
            completed: state.completed,
            error: state.error.clone(),
        }
    }
}

/// Process-lifetime sessions keyed by identity.
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<Identity, Arc<Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the identity's session, creating an empty one if absent.
    /// Concurrent callers for one identity always observe the same session.
    pub fn get_or_create(&self, identity: &Identity) -> Arc<Session> {
        let entry = self.sessions.entry(identity.clone()).or_insert_with(|| {
            tracing::debug!(identity = %identity, "Session created");
            Arc::new(Session::new(identity.clone()))
        });
        Arc::clone(entry.value())
    }

    pub fn get(&self, identity: &Identity) -> Option<Arc<Session>> {
        self.sessions.get(identity).map(|s| Arc::clone(s.value()))
    }

    /// Clear an identity's history. Returns false if it has no session.
    pub fn reset(&self, identity: &Identity) -> bool {
        match self.get(identity) {
            Some(session) => {
                session.reset();
                true
            }
            None => false,
        }
    }

    /// Append a step to an existing session. Returns false if there is none.
    pub fn append_step(&self, identity: &Identity, step: Step) -> bool {
        match self.get(identity) {
            Some(session) => {
                session.append_step(step);
                true
            }
            None => {
                tracing::debug!(identity = %identity, "No session for step, dropping");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
