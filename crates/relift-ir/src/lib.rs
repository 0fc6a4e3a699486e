//! Intermediate representation for the relift trace recompiler.
//!
//! This crate provides the pure program model: translation units captured
//! by the dynamic front end, recovered functions, the emulated register
//! file, and the compact binary / textual serialized forms. The recovery
//! passes that transform the model live in `relift-recover`.

mod codec;
mod expr;
mod function;
mod inst;
mod module;
mod regfile;
mod terminator;
mod text;
mod unit;

pub use codec::*;
pub use expr::*;
pub use function::*;
pub use inst::*;
pub use module::*;
pub use regfile::*;
pub use terminator::*;
pub use text::*;
pub use unit::*;

use thiserror::Error;

/// IR model errors.
#[derive(Error, Debug)]
pub enum IrError {
    #[error("duplicate translation unit at {addr:#x}")]
    DuplicateUnit { addr: u64 },
    #[error("module codec: bad magic")]
    BadMagic,
    #[error("module codec: unsupported version {0}")]
    UnsupportedVersion(u32),
    #[error("module codec: truncated input at offset {0}")]
    Truncated(usize),
    #[error("module codec: invalid {what} tag {tag} at offset {offset}")]
    BadTag {
        what: &'static str,
        tag: u8,
        offset: usize,
    },
    #[error("module codec: register file mismatch: unknown register {0:?}")]
    UnknownRegister(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IrError>;
