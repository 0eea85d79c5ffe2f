//! Generation sessions: per-session state, query parameters and the token
//! emission path.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use emberlm_core::{Sampler, TokenId, TOK_BOS, TOK_EOS};
use emberlm_model::{Model, ModelKind};

use crate::forward::Activations;
use crate::Result;

pub type SessionId = u64;

/// Receives every emitted piece; the return value is reserved and non-zero
/// is not treated as fatal.
pub type IssueCallback = Box<dyn FnMut(&[u8]) -> i32 + Send>;

/// Parameters of one generation query.
pub struct QueryParams {
    pub prompt: String,
    pub system: Option<String>,
    /// Negative values clamp to 0 (greedy).
    pub temperature: f32,
    /// Values outside `[0, 1]` fall back to 0.9.
    pub topp: f32,
    /// 0 selects a wall-clock seed.
    pub rng_seed: u64,
    /// Token budget; 0 or anything beyond `seq_len` clamps to `seq_len`.
    pub limit: usize,
    /// Piece sink; stdout when absent.
    pub on_piece: Option<IssueCallback>,
    /// Set to `true` when the session is destroyed, so external holders
    /// observe the release race-free.
    pub released: Option<Arc<AtomicBool>>,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            system: None,
            temperature: 1.0,
            topp: 0.9,
            rng_seed: 0,
            limit: 0,
            on_piece: None,
            released: None,
        }
    }
}

fn stdout_issue_cb() -> IssueCallback {
    Box::new(|piece| {
        let mut out = std::io::stdout();
        let _ = out.write_all(piece);
        let _ = out.flush();
        0
    })
}

fn wall_clock_seed() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
}

pub(crate) struct Session {
    pub id: SessionId,
    pub model: Arc<Model>,
    pub acts: Activations,
    pub sampler: Sampler,
    /// true once a query has been issued against this session
    pub queried: bool,
    pub pos: usize,
    pub limit: usize,
    pub prompt_len: usize,
    pub token: TokenId,
    /// encoded prompt; dropped once generation starts
    pub tokens: Option<Vec<TokenId>>,
    pub token_count: u64,
    pub started: Instant,
    pub on_piece: IssueCallback,
    pub cancelled: Arc<AtomicBool>,
    pub released: Option<Arc<AtomicBool>>,
}

impl Session {
    pub fn new(model: Arc<Model>, id: SessionId) -> Result<Self> {
        let sampler = Sampler::new(model.config.vocab_size, 0.0, 0.9, 1);
        let acts = Activations::new(&model.config);

        Ok(Self {
            id,
            model,
            acts,
            sampler,
            queried: false,
            pos: 0,
            limit: 0,
            prompt_len: 0,
            token: TOK_BOS,
            tokens: None,
            token_count: 0,
            started: Instant::now(),
            on_piece: stdout_issue_cb(),
            cancelled: Arc::new(AtomicBool::new(false)),
            released: None,
        })
    }

    /// Arm the session with a query: clamp the sampling parameters, render
    /// the prompt for the model's kind, echo it, and encode it.
    pub fn begin(&mut self, params: QueryParams) {
        let config = &self.model.config;

        let temperature = if params.temperature >= 0.0 {
            params.temperature
        } else {
            0.0
        };
        let topp = if (0.0..=1.0).contains(&params.topp) {
            params.topp
        } else {
            0.9
        };
        let rng_seed = if params.rng_seed != 0 {
            params.rng_seed
        } else {
            wall_clock_seed()
        };
        let limit = if params.limit == 0 || params.limit > config.seq_len {
            config.seq_len
        } else {
            params.limit
        };

        self.sampler = Sampler::new(config.vocab_size, temperature, topp, rng_seed);
        self.on_piece = params.on_piece.unwrap_or_else(stdout_issue_cb);
        self.released = params.released;

        let system = params.system.as_deref().unwrap_or("");
        let total = match self.model.kind {
            ModelKind::Gen => format!("{}\n{}\n", system, params.prompt),
            ModelKind::Chat => match params.system.as_deref() {
                Some(system) => format!(
                    "[INST] <<SYS>>\n{}\n<</SYS>>\n\n{} [/INST]\n",
                    system, params.prompt
                ),
                None => format!("[INST] {} [/INST]\n", params.prompt),
            },
        };

        tracing::debug!(
            id = self.id,
            temperature,
            topp,
            seed = rng_seed,
            limit,
            "query armed"
        );

        if !params.prompt.is_empty() {
            self.issue(params.prompt.as_bytes());
        }

        let tokens = self.model.vocab.encode(&total, true, false);
        self.prompt_len = tokens.len();
        self.token = tokens[0];
        self.tokens = Some(tokens);
        self.pos = 0;
        self.limit = limit;
        self.token_count = 0;
        self.started = Instant::now();
        self.queried = true;
    }

    /// Deliver a piece through the callback, suppressing unprintable
    /// single-byte pieces and anything after cancellation. The synthesized
    /// EOS byte always passes the filter.
    pub fn issue(&mut self, piece: &[u8]) -> i32 {
        if self.cancelled.load(Ordering::Relaxed) {
            return 0;
        }
        if !piece_passes_filter(piece) {
            return 0;
        }
        (self.on_piece)(piece)
    }

    /// Log throughput and flip the released flag; called on every terminal
    /// path, exactly once.
    pub fn finish(&mut self) {
        let secs = self.started.elapsed().as_secs_f64();
        tracing::info!(
            id = self.id,
            tokens = self.token_count,
            tok_per_s = self.token_count as f64 / secs.max(1e-9),
            "session finished"
        );
        if let Some(flag) = &self.released {
            flag.store(true, Ordering::Release);
        }
    }
}

/// Single-byte pieces that are neither printable nor whitespace are
/// dropped at the emission boundary; multi-byte pieces and the synthesized
/// EOS byte always pass.
fn piece_passes_filter(piece: &[u8]) -> bool {
    if let [byte] = piece {
        let printable =
            byte.is_ascii_graphic() || *byte == b' ' || (0x09..=0x0D).contains(byte);
        return *byte == TOK_EOS as u8 || printable;
    }
    true
}
