//! The engine runtime: worker pool, model registry, session list and the
//! round-robin scheduler.
//!
//! One `Engine` value owns everything; there is no process-global state.
//! The scheduler is driven externally: each `step_next` call advances the
//! head session by one token and rotates it to the tail, so N live sessions
//! share the pool fairly at one-token granularity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use std::collections::VecDeque;

use emberlm_core::{TOK_BOS, TOK_EOS};
use emberlm_model::{Model, ModelInfo};

use crate::error::{EngineError, Result};
use crate::forward::{forward, session_footprint};
use crate::pool::WorkerPool;
use crate::session::{QueryParams, Session, SessionId};

pub struct Engine {
    pool: WorkerPool,
    models: Mutex<Vec<Arc<Model>>>,
    sessions: Mutex<VecDeque<Session>>,
    /// cancellation flags stay reachable while their session is mid-step
    cancel_flags: Mutex<HashMap<SessionId, Arc<AtomicBool>>>,
    next_id: AtomicU64,
}

impl Engine {
    /// Create an engine with `threads` workers (0 selects the default).
    pub fn new(threads: usize) -> Result<Self> {
        Ok(Self {
            pool: WorkerPool::new(threads)?,
            models: Mutex::new(Vec::new()),
            sessions: Mutex::new(VecDeque::new()),
            cancel_flags: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.threads()
    }

    /// Load a model and register it under its name.
    pub fn load_model(&self, info: &ModelInfo) -> Result<Arc<Model>> {
        if self.models.lock().iter().any(|m| m.name == info.name) {
            return Err(EngineError::Config(format!(
                "model '{}' is already registered",
                info.name
            )));
        }

        let model = Arc::new(Model::load(info)?);
        tracing::info!(
            name = %model.name,
            session_kb = session_footprint(&model.config) / 1024,
            "model registered"
        );
        self.models.lock().push(Arc::clone(&model));
        Ok(model)
    }

    /// Look a registered model up by name.
    pub fn model(&self, name: &str) -> Option<Arc<Model>> {
        self.models.lock().iter().find(|m| m.name == name).cloned()
    }

    /// Drop a model from the registry. Sessions already running against it
    /// keep it alive until they finish.
    pub fn unload_model(&self, name: &str) -> bool {
        let mut models = self.models.lock();
        let before = models.len();
        models.retain(|m| m.name != name);
        models.len() != before
    }

    /// Create a session against a model, subject to its session cap.
    pub fn create_session(&self, model: &Arc<Model>) -> Result<SessionId> {
        if model.max_sessions > 0 {
            let active = self
                .sessions
                .lock()
                .iter()
                .filter(|s| Arc::ptr_eq(&s.model, model))
                .count();
            if active >= model.max_sessions {
                return Err(EngineError::Exhausted(format!(
                    "model '{}' reached max sessions {}",
                    model.name, model.max_sessions
                )));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(Arc::clone(model), id)?;
        self.cancel_flags
            .lock()
            .insert(id, Arc::clone(&session.cancelled));
        self.sessions.lock().push_back(session);
        Ok(id)
    }

    /// Arm a session with a query.
    pub fn query(&self, id: SessionId, params: QueryParams) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(EngineError::UnknownSession)?;
        session.begin(params);
        Ok(())
    }

    /// Request cancellation; the session is torn down by the next
    /// `step_next` that reaches it.
    pub fn cancel(&self, id: SessionId) {
        if let Some(flag) = self.cancel_flags.lock().get(&id) {
            flag.store(true, Ordering::Relaxed);
        }
    }

    /// Destroy a session immediately. Returns false if the session is
    /// unknown or currently mid-step (in which case use [`Engine::cancel`]).
    pub fn destroy_session(&self, id: SessionId) -> bool {
        let session = {
            let mut sessions = self.sessions.lock();
            match sessions.iter().position(|s| s.id == id) {
                Some(idx) => sessions.remove(idx),
                None => None,
            }
        };
        match session {
            Some(session) => {
                self.finish(session);
                true
            }
            None => false,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Advance the head session one token and rotate it to the tail.
    /// Returns whether any session remains afterwards.
    pub fn step_next(&self) -> bool {
        let mut session = match self.sessions.lock().pop_front() {
            Some(s) => s,
            None => {
                tracing::debug!("no sessions");
                return false;
            }
        };

        if session.cancelled.load(Ordering::Relaxed) {
            return self.finish(session);
        }

        if !session.queried || session.pos >= session.limit {
            // nothing to run; leave the session where it was
            self.sessions.lock().push_front(session);
            return false;
        }

        let is_prompt = session.pos + 1 < session.prompt_len;

        // a failed step yields the 0 sentinel, which terminates the session
        // below exactly like a sampled end-of-stream
        let model = Arc::clone(&session.model);
        let mut tnext = match forward(
            &model,
            &self.pool,
            &mut session.acts,
            &mut session.sampler,
            is_prompt,
            session.token,
            session.pos,
        ) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(id = session.id, error = %e, "forward step failed");
                0
            }
        };
        session.pos += 1;

        if session.pos >= session.limit {
            return self.finish(session);
        }
        if tnext == 0 {
            return self.finish(session);
        }

        if is_prompt {
            if let Some(tokens) = &session.tokens {
                tnext = tokens[session.pos];
            }
        } else {
            // the prompt array is no longer needed once generation started
            session.tokens = None;
        }

        if tnext == TOK_BOS {
            return self.finish(session);
        }

        session.token_count += 1;

        if !is_prompt {
            let piece = model.vocab.decode(session.token, tnext);
            session.issue(&piece);
        }

        if session.pos > 5 && tnext == TOK_EOS {
            return self.finish(session);
        }

        session.token = tnext;
        self.sessions.lock().push_back(session);
        true
    }

    /// Terminal path: synthesize the one-byte EOS piece, tear the session
    /// down, and report whether sessions remain.
    fn finish(&self, mut session: Session) -> bool {
        session.issue(&[TOK_EOS as u8]);
        self.cancel_flags.lock().remove(&session.id);
        session.finish();
        drop(session);
        !self.sessions.lock().is_empty()
    }
}
