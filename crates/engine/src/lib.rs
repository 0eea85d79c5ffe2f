//! emberlm engine: concurrent token generation over loaded models.
//!
//! An [`Engine`] owns a fixed worker pool, a model registry and a list of
//! live sessions. Each session carries its own KV cache, sampler state and
//! emission callback; the embedder drives generation by calling
//! [`Engine::step_next`] in a loop, which advances one session by one token
//! and rotates it to the back of the queue.
//!
//! ```no_run
//! use emberlm_engine::{Engine, QueryParams};
//! use emberlm_model::ModelInfo;
//!
//! # fn main() -> emberlm_engine::Result<()> {
//! let engine = Engine::new(8)?;
//! let model = engine.load_model(&ModelInfo::new("model.bin", "tokenizer.bin", "story"))?;
//!
//! let session = engine.create_session(&model)?;
//! engine.query(
//!     session,
//!     QueryParams {
//!         prompt: "Once upon a time".into(),
//!         temperature: 0.8,
//!         rng_seed: 42,
//!         ..Default::default()
//!     },
//! )?;
//!
//! while engine.step_next() {}
//! # Ok(())
//! # }
//! ```

mod error;
mod forward;
mod pool;
mod runtime;
mod session;

pub use error::{EngineError, Result};
pub use forward::session_footprint;
pub use pool::{Completion, WorkerPool, DEFAULT_THREADS};
pub use runtime::Engine;
pub use session::{IssueCallback, QueryParams, SessionId};
