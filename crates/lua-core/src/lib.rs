//! `lua-core`: compile-time types shared across the lua-rust workspace.
//!
//! This crate defines:
//! - [`LuaStr`]: immutable byte strings with a cached hash
//! - [`number`]: integer/float arithmetic, comparison, parsing and formatting
//! - [`Proto`] and [`Constant`]: what the compiler produces and the VM runs
//! - Bytecode [`OpCode`] definitions and their 32-bit encoding
//! - Load-time errors ([`LexError`], [`CompileError`], [`ChunkFormatError`])

pub mod error;
pub mod number;
pub mod opcode;
pub mod proto;
pub mod string;

pub use error::{ChunkFormatError, CompileError, LexError, LoadError};
pub use number::Number;
pub use opcode::{OpCode, Rk};
pub use proto::{chunk_id, Constant, DebugInfo, LocalVar, Proto, UpvalueDesc};
pub use string::LuaStr;
