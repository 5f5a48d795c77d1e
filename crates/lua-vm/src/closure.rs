//! Runtime function objects: Lua closures, upvalue cells and host functions.

use std::fmt;
use std::sync::Arc;

use lua_core::Proto;
use parking_lot::RwLock;

use crate::coroutine::ThreadId;
use crate::error::LuaError;
use crate::table::TableRef;
use crate::value::LuaValue;
use crate::vm::Vm;

// ── Upvalue cells ─────────────────────────────────────────────────────────────

/// A shared, mutable upvalue cell.
///
/// While the captured local is still live on its thread's stack the cell is
/// `Open` and aliases that slot. When the local goes out of scope the runtime
/// copies the value into the cell (`Closed`).
#[derive(Debug, Clone)]
pub struct Upvalue(pub Arc<RwLock<UpvalueInner>>);

impl Upvalue {
    pub fn open(thread: ThreadId, index: usize) -> Self {
        Self(Arc::new(RwLock::new(UpvalueInner::Open { thread, index })))
    }

    pub fn closed(val: LuaValue) -> Self {
        Self(Arc::new(RwLock::new(UpvalueInner::Closed(val))))
    }

    /// Migrate the cell off the stack, taking `val` as its final value.
    pub fn close(&self, val: LuaValue) {
        let mut inner = self.0.write();
        if matches!(*inner, UpvalueInner::Open { .. }) {
            *inner = UpvalueInner::Closed(val);
        }
    }
}

#[derive(Debug, Clone)]
pub enum UpvalueInner {
    /// The value lives in `index` of the stack of `thread`.
    Open { thread: ThreadId, index: usize },
    Closed(LuaValue),
}

// ── Lua closure ───────────────────────────────────────────────────────────────

/// A runtime closure: a `Proto` paired with its captured upvalue cells and
/// the environment its global accesses go through.
pub struct LuaClosure {
    pub proto: Arc<Proto>,
    /// One cell per `proto.upvalue_descs` entry.
    pub upvalues: Vec<Upvalue>,
    pub env: RwLock<TableRef>,
}

impl LuaClosure {
    pub fn new(proto: Arc<Proto>, upvalues: Vec<Upvalue>, env: TableRef) -> Self {
        Self {
            proto,
            upvalues,
            env: RwLock::new(env),
        }
    }

    pub fn env(&self) -> TableRef {
        self.env.read().clone()
    }
}

impl fmt::Debug for LuaClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LuaClosure")
            .field("source", &self.proto.source)
            .field("line_defined", &self.proto.line_defined)
            .field("upvalues", &self.upvalues.len())
            .finish()
    }
}

// ── Native functions ──────────────────────────────────────────────────────────

pub type NativeFn = dyn Fn(&mut Vm, Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaError> + Send + Sync;

/// How the interpreter loop dispatches a native function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NativeKind {
    Plain,
    /// `pcall`: the callee runs as a protected frame of the calling thread.
    PCall,
    /// `xpcall`: like `PCall`, with a message handler as second argument.
    XPCall,
}

/// A host function. It receives the session so it can call back into Lua.
pub struct NativeFunction {
    pub name: String,
    pub func: Box<NativeFn>,
    pub(crate) kind: NativeKind,
}

impl NativeFunction {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(&mut Vm, Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Box::new(func),
            kind: NativeKind::Plain,
        }
    }

    pub(crate) fn with_kind(mut self, kind: NativeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn call(&self, vm: &mut Vm, args: Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaError> {
        (self.func)(vm, args)
    }
}

impl LuaValue {
    /// Wrap a host function as a Lua value.
    pub fn native(
        name: impl Into<String>,
        func: impl Fn(&mut Vm, Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaError> + Send + Sync + 'static,
    ) -> Self {
        LuaValue::NativeFunction(Arc::new(NativeFunction::new(name, func)))
    }
}
