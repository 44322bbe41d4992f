//! Agent runtime adapter: worker subprocess supervision, NDJSON protocol,
//! thinking-directive handling, and model fallback.

mod fallback;
mod protocol;
mod worker;

pub use fallback::{is_fallback_worthy, run_with_fallback, AttemptError, FallbackPolicy};
pub use protocol::{RunRequest, Usage, WorkerEvent, WorkerRequest};
pub use worker::{cue_token, AgentWorker, WorkerConfig};
