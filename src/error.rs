//! Crate-wide error type.
//!
//! Component-local readers (`bits`, `bc::reader`) keep the teacher's
//! hand-rolled `Display`/`std::error::Error` enums since they are pure wire
//! format decoders; this module adds the one thing the teacher (a narrow
//! library with no driver) never needed: an umbrella error every subsystem
//! converts into, built with `thiserror` the way
//! `lmeller-git-tinyOS/kernel/src/kernel/fs/mod.rs` derives its `FsError`.

use thiserror::Error;

use crate::bc::reader;
use crate::lexer;
use crate::parser;
use crate::strpool;
use crate::table;
use crate::vm;

pub type KResult<T> = Result<T, KtapError>;

#[derive(Debug, Error)]
pub enum KtapError {
    #[error("{0}")]
    Lex(#[from] lexer::Error),

    #[error("{0}")]
    Parse(#[from] parser::Error),

    #[error("{0}")]
    Reader(#[from] reader::Error),

    #[error("{0}")]
    Table(#[from] table::Error),

    #[error("{0}")]
    Str(#[from] strpool::Error),

    #[error("{0}")]
    Runtime(#[from] vm::Error),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
