//! Top-level error aggregation.
//!
//! Each subsystem boundary (memory, JIT, decode, syscall) defines its own
//! error enum; this module only stitches them together for callers that
//! cross boundaries (mainly `main.rs`).

use thiserror::Error;

use crate::decode::DecodeError;
use crate::jit::JitError;
use crate::memory::MemoryError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Jit(#[from] JitError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("elf load error: {0}")]
    Elf(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
