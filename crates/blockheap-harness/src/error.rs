use blockheap_core::MallocError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("allocator: {0}")]
    Malloc(#[from] MallocError),
    #[error("invalid trace at op {index}: {reason}")]
    InvalidTrace { index: usize, reason: String },
    #[error("stress check failed on thread {thread}: {detail}")]
    StressMismatch { thread: usize, detail: String },
}
