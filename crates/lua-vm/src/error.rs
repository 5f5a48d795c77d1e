use lua_core::LoadError;
use thiserror::Error;

use crate::value::LuaValue;

/// Everything that can interrupt a call into the VM.
#[derive(Debug, Clone, Error)]
pub enum LuaError {
    /// The chunk could not be compiled or undumped.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// A raised Lua error carrying an arbitrary value.
    #[error("{}", describe(.0))]
    Runtime(LuaValue),

    #[error("{0}")]
    StackOverflow(String),

    /// A coroutine was resumed from a session other than the one that
    /// created it, or after that session was dropped. Not catchable by
    /// `pcall`.
    #[error("coroutine belongs to another session")]
    OrphanedCoroutine,

    /// Internal unwinding signal for `coroutine.yield`.
    #[error("attempt to yield from outside a coroutine")]
    Yield(Vec<LuaValue>),
}

fn describe(v: &LuaValue) -> String {
    match v {
        LuaValue::LuaString(_) | LuaValue::Integer(_) | LuaValue::Float(_) => v.to_string(),
        LuaValue::Nil => "nil".to_string(),
        other => format!("(error object is a {} value)", other.type_name()),
    }
}

impl LuaError {
    pub fn runtime(msg: impl Into<String>) -> Self {
        LuaError::Runtime(LuaValue::from(msg.into()))
    }

    /// The value a protected call hands back to Lua.
    pub fn to_value(&self) -> LuaValue {
        match self {
            LuaError::Runtime(v) => v.clone(),
            LuaError::Yield(_) => LuaValue::from("attempt to yield from outside a coroutine"),
            other => LuaValue::from(other.to_string()),
        }
    }

    /// Whether `pcall` may stop this error.
    pub fn is_catchable(&self) -> bool {
        !matches!(self, LuaError::OrphanedCoroutine)
    }
}
