//! `lua-vm`: register-based virtual machine, coroutines and the standard
//! library.

pub mod closure;
pub mod coroutine;
pub mod error;
pub mod stdlib;
pub mod table;
pub mod value;
pub mod vm;

pub use closure::{LuaClosure, NativeFunction, Upvalue};
pub use coroutine::{CoroutineRef, CoroutineStatus, ThreadId};
pub use error::LuaError;
pub use lua_compiler::compile;
pub use table::{LuaTable, TableRef};
pub use value::{LuaValue, UserData};
pub use vm::{Vm, VmOptions};
