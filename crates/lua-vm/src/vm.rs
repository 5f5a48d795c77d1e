use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use lua_compiler::{compile, is_binary_chunk, undump};
use lua_core::number::{arith, float_to_int, num_le, num_lt, ArithOp};
use lua_core::{LoadError, LuaStr, Number, OpCode, Proto, Rk, UpvalueDesc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::closure::{LuaClosure, NativeFunction, NativeKind, Upvalue, UpvalueInner};
use crate::coroutine::{Coroutine, CoroutineRef, ThreadId};
use crate::error::LuaError;
use crate::table::{LuaTable, TableRef};
use crate::value::LuaValue;

/// Longest `__index` / `__newindex` chain followed before giving up.
const MAX_META_CHAIN: usize = 100;
/// Remaining stack below which a re-entrant call switches to a new segment.
pub(crate) const STACK_RED_ZONE: usize = 128 * 1024;
/// Size of each segment allocated for deep re-entry.
pub(crate) const STACK_SEGMENT: usize = 2 * 1024 * 1024;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

// ── Options ───────────────────────────────────────────────────────────────────

/// Resource limits of a session. Exceeding any raises
/// [`LuaError::StackOverflow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmOptions {
    /// Lua frames on one thread.
    pub max_call_depth: usize,
    /// Nested re-entrant calls from host code back into Lua.
    pub max_native_depth: usize,
    /// Register slots on one thread.
    pub max_stack_slots: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            max_call_depth: 20_000,
            max_native_depth: 200,
            max_stack_slots: 1_000_000,
        }
    }
}

// ── Call frame ────────────────────────────────────────────────────────────────

/// A single entry on the call stack.
pub(crate) struct CallFrame {
    /// The function being executed.
    pub(crate) closure: Arc<LuaClosure>,
    /// Index of the next instruction.
    pub(crate) pc: usize,
    /// Absolute stack index of register 0.
    pub(crate) base: usize,
    /// Absolute stack index of the called value; results are written here.
    pub(crate) func: usize,
    /// How many results the caller expects; negative means all of them.
    pub(crate) nresults: i32,
    /// Arguments beyond `param_count`.
    pub(crate) varargs: Vec<LuaValue>,
    /// Returning from this frame ends the current `execute` invocation.
    pub(crate) boundary: bool,
    /// Set on the body of a `pcall` / `xpcall` run by the interpreter loop.
    pub(crate) protect: Option<Protect>,
}

/// A protected call in progress: errors raised above it stop here.
pub(crate) struct Protect {
    /// Stack slot of the `pcall` itself; the status and results go here.
    pub(crate) slot: usize,
    pub(crate) nresults: i32,
    /// `xpcall` message handler.
    pub(crate) handler: Option<LuaValue>,
}

/// Where a yielded native call wants its results once the thread resumes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingCall {
    pub(crate) func: usize,
    pub(crate) nresults: i32,
    /// The yield came straight from the body of a protected call, so the
    /// resume values are prefixed with `true`.
    pub(crate) protected: bool,
}

/// Everything that belongs to one thread of execution.
#[derive(Default)]
pub(crate) struct ExecState {
    pub(crate) stack: Vec<LuaValue>,
    pub(crate) frames: Vec<CallFrame>,
    /// Open upvalue cells keyed by the stack slot they alias.
    pub(crate) open_upvalues: BTreeMap<usize, Upvalue>,
    /// End of the last variable-length result list.
    pub(crate) top: usize,
    /// Re-entrant calls in progress; yielding is impossible while nonzero.
    pub(crate) nny: usize,
    pub(crate) pending: Option<PendingCall>,
}

impl ExecState {
    /// Close every open upvalue aliasing a slot `>= from`.
    pub(crate) fn close_upvalues(&mut self, from: usize) {
        let closing = self.open_upvalues.split_off(&from);
        for (index, cell) in closing {
            cell.close(self.stack.get(index).cloned().unwrap_or(LuaValue::Nil));
        }
    }
}

pub(crate) enum RunOutcome {
    Returned(Vec<LuaValue>),
    Yielded(Vec<LuaValue>),
}

// ── VM ────────────────────────────────────────────────────────────────────────

/// A Lua session: globals, the running thread and its coroutines.
pub struct Vm {
    globals: TableRef,
    pub(crate) string_meta: TableRef,
    pub(crate) state: ExecState,
    pub(crate) current: CoroutineRef,
    pub(crate) current_id: ThreadId,
    pub(crate) main: CoroutineRef,
    pub(crate) threads: FxHashMap<ThreadId, Weak<Mutex<Coroutine>>>,
    pub(crate) session: u64,
    options: VmOptions,
    pub(crate) native_depth: usize,
    output: Box<dyn Write + Send>,
    pub(crate) rng: StdRng,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_options(VmOptions::default())
    }

    pub fn with_options(options: VmOptions) -> Self {
        let session = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
        let main_id = ThreadId::next();
        let main = Arc::new(Mutex::new(Coroutine::main(main_id, session)));
        let mut threads = FxHashMap::default();
        threads.insert(main_id, Arc::downgrade(&main));
        let mut vm = Vm {
            globals: LuaTable::new_ref(),
            string_meta: LuaTable::new_ref(),
            state: ExecState::default(),
            current: main.clone(),
            current_id: main_id,
            main,
            threads,
            session,
            options,
            native_depth: 0,
            output: Box::new(std::io::stdout()),
            rng: StdRng::from_entropy(),
        };
        crate::stdlib::open_libs(&mut vm);
        debug!(target: "lua::vm", session, ?options, "session created");
        vm
    }

    pub fn options(&self) -> VmOptions {
        self.options
    }

    pub fn globals(&self) -> TableRef {
        self.globals.clone()
    }

    pub(crate) fn set_globals(&mut self, globals: TableRef) {
        self.globals = globals;
    }

    pub fn get_global(&self, name: &str) -> LuaValue {
        self.globals.read().get_str(name)
    }

    pub fn set_global(&mut self, name: &str, value: LuaValue) {
        self.globals.write().set_str(name, value);
    }

    /// Expose a host function as a global.
    pub fn register(
        &mut self,
        name: &str,
        func: impl Fn(&mut Vm, Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaError> + Send + Sync + 'static,
    ) {
        self.set_global(name, LuaValue::native(name, func));
    }

    /// Redirect `print` and `io.write`.
    pub fn set_output(&mut self, out: impl Write + Send + 'static) {
        self.output = Box::new(out);
    }

    pub(crate) fn output(&mut self) -> &mut dyn Write {
        &mut *self.output
    }

    /// Lua frames currently on the running thread.
    pub fn call_depth(&self) -> usize {
        self.state.frames.len()
    }

    /// Load a chunk as a function. Binary chunks are recognised by their
    /// signature; anything else is compiled as source.
    pub fn load(&mut self, chunk: &[u8], chunk_name: &str, env: Option<TableRef>) -> Result<LuaValue, LuaError> {
        let proto = if is_binary_chunk(chunk) {
            undump(chunk).map_err(LoadError::from)?
        } else {
            compile(chunk, chunk_name).map_err(LoadError::from)?
        };
        debug!(target: "lua::vm", chunk = chunk_name, binary = is_binary_chunk(chunk), "loaded chunk");
        Ok(self.instantiate_main(Arc::new(proto), env))
    }

    /// Wrap a main prototype: its upvalues start as fresh closed cells.
    pub fn instantiate_main(&self, proto: Arc<Proto>, env: Option<TableRef>) -> LuaValue {
        let upvalues = proto.upvalue_descs.iter().map(|_| Upvalue::closed(LuaValue::Nil)).collect();
        let env = env.unwrap_or_else(|| self.globals.clone());
        LuaValue::Closure(Arc::new(LuaClosure::new(proto, upvalues, env)))
    }

    /// Compile and run `source`, returning what the chunk returns.
    pub fn exec(&mut self, source: &str, chunk_name: &str) -> Result<Vec<LuaValue>, LuaError> {
        let f = self.load(source.as_bytes(), chunk_name, None)?;
        self.call(&f, Vec::new())
    }

    /// Call `f`. On error the running thread is unwound to where it was.
    pub fn call(&mut self, f: &LuaValue, args: Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaError> {
        let depth = self.state.frames.len();
        let result = self.call_value(f.clone(), args);
        if result.is_err() {
            self.unwind_to(depth);
        }
        result
    }

    // ── Re-entrant calls ──────────────────────────────────────────────────────

    /// Call a value from host code, re-entering the interpreter loop for
    /// Lua functions. Errors leave the frames in place for the caller to
    /// unwind.
    pub fn call_value(&mut self, f: LuaValue, args: Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaError> {
        if self.native_depth >= self.options.max_native_depth {
            return Err(LuaError::StackOverflow(format!("{}C stack overflow", self.where_prefix(1))));
        }
        self.native_depth += 1;
        self.state.nny += 1;
        let result = stacker::maybe_grow(STACK_RED_ZONE, STACK_SEGMENT, || self.call_value_inner(f, args));
        self.state.nny -= 1;
        self.native_depth -= 1;
        result
    }

    fn call_value_inner(&mut self, f: LuaValue, args: Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaError> {
        let (f, args) = self.callable(f, args)?;
        match f {
            LuaValue::NativeFunction(native) => native.call(self, args),
            LuaValue::Closure(closure) => {
                let func = self.frame_top();
                let entry = self.state.frames.len();
                let nargs = args.len();
                self.ensure_stack(func + nargs + 1)?;
                self.state.stack[func] = LuaValue::Closure(closure.clone());
                for (i, arg) in args.into_iter().enumerate() {
                    self.state.stack[func + 1 + i] = arg;
                }
                self.push_lua_frame(closure, func, nargs, -1, true)?;
                match self.execute(entry)? {
                    RunOutcome::Returned(vals) => Ok(vals),
                    RunOutcome::Yielded(_) => Err(self.runtime_error("attempt to yield across a C-call boundary")),
                }
            }
            _ => Err(self.runtime_error("attempt to call a non-function value")),
        }
    }

    /// Resolve `__call` until a function is found.
    fn callable(&self, mut f: LuaValue, mut args: Vec<LuaValue>) -> Result<(LuaValue, Vec<LuaValue>), LuaError> {
        for _ in 0..MAX_META_CHAIN {
            if f.is_function() {
                return Ok((f, args));
            }
            let handler = self.metamethod_of(&f, "__call");
            if handler.is_nil() {
                return Err(self.type_error(&f, "call", None));
            }
            args.insert(0, f);
            f = handler;
        }
        Err(self.runtime_error("'__call' chain too long; possible loop"))
    }

    /// Drop frames above `depth`, closing their upvalues.
    pub(crate) fn unwind_to(&mut self, depth: usize) {
        if self.state.frames.len() > depth {
            let from = self.state.frames[depth].func;
            self.state.close_upvalues(from);
            self.state.frames.truncate(depth);
            trace!(target: "lua::vm", depth, "unwound frames");
        }
    }

    // ── Stack management ──────────────────────────────────────────────────────

    /// First stack slot not used by the running frame.
    fn frame_top(&self) -> usize {
        self.state
            .frames
            .last()
            .map(|f| f.base + f.closure.proto.max_stack as usize)
            .unwrap_or(0)
    }

    fn ensure_stack(&mut self, size: usize) -> Result<(), LuaError> {
        if size > self.options.max_stack_slots {
            return Err(LuaError::StackOverflow(format!("{}stack overflow", self.where_prefix(1))));
        }
        if self.state.stack.len() < size {
            self.state.stack.resize(size, LuaValue::Nil);
        }
        Ok(())
    }

    fn push_lua_frame(
        &mut self,
        closure: Arc<LuaClosure>,
        func: usize,
        nargs: usize,
        nresults: i32,
        boundary: bool,
    ) -> Result<(), LuaError> {
        if self.state.frames.len() >= self.options.max_call_depth {
            return Err(LuaError::StackOverflow(format!("{}stack overflow", self.where_prefix(1))));
        }
        let proto = &closure.proto;
        let base = func + 1;
        let nparams = proto.param_count as usize;
        let max_stack = proto.max_stack as usize;
        self.ensure_stack(base + max_stack.max(nargs) + 1)?;
        let varargs = if proto.is_vararg && nargs > nparams {
            self.state.stack[base + nparams..base + nargs].to_vec()
        } else {
            Vec::new()
        };
        for slot in &mut self.state.stack[base + nargs.min(nparams)..base + max_stack] {
            *slot = LuaValue::Nil;
        }
        self.state.frames.push(CallFrame {
            closure,
            pc: 0,
            base,
            func,
            nresults,
            varargs,
            boundary,
            protect: None,
        });
        Ok(())
    }

    /// Write call results starting at `func`.
    fn place_results(&mut self, func: usize, results: Vec<LuaValue>, nresults: i32) -> Result<(), LuaError> {
        if nresults < 0 {
            let n = results.len();
            self.ensure_stack(func + n + 1)?;
            for (i, v) in results.into_iter().enumerate() {
                self.state.stack[func + i] = v;
            }
            self.state.top = func + n;
        } else {
            let wanted = nresults as usize;
            self.ensure_stack(func + wanted + 1)?;
            let mut it = results.into_iter();
            for i in 0..wanted {
                self.state.stack[func + i] = it.next().unwrap_or(LuaValue::Nil);
            }
        }
        Ok(())
    }

    /// Pop the top frame and hand its values to the caller.
    /// Returns `Some(values)` when the frame was a boundary.
    fn return_from_frame(&mut self, vals: Vec<LuaValue>) -> Result<Option<Vec<LuaValue>>, LuaError> {
        let Some(frame) = self.state.frames.pop() else {
            return Ok(Some(vals));
        };
        self.state.close_upvalues(frame.base);
        if frame.boundary {
            return Ok(Some(vals));
        }
        match frame.protect {
            Some(protect) => {
                let mut vals = vals;
                vals.insert(0, LuaValue::Boolean(true));
                self.place_results(protect.slot, vals, protect.nresults)?;
            }
            None => self.place_results(frame.func, vals, frame.nresults)?,
        }
        Ok(None)
    }

    /// Resolve the value at `func` (following `__call` by shifting the
    /// arguments up) into a function and its argument count.
    fn resolve_call(&mut self, func: usize, mut nargs: usize, reg: Option<u8>) -> Result<(LuaValue, usize), LuaError> {
        for _ in 0..MAX_META_CHAIN {
            let f = self.state.stack[func].clone();
            if f.is_function() {
                return Ok((f, nargs));
            }
            let handler = self.metamethod_of(&f, "__call");
            if handler.is_nil() {
                return Err(self.type_error(&f, "call", reg));
            }
            self.ensure_stack(func + nargs + 2)?;
            for i in (func..=func + nargs).rev() {
                self.state.stack[i + 1] = std::mem::replace(&mut self.state.stack[i], LuaValue::Nil);
            }
            self.state.stack[func] = handler;
            nargs += 1;
        }
        Err(self.runtime_error("'__call' chain too long; possible loop"))
    }

    /// Start a call from the interpreter loop. Returns `true` when a Lua
    /// frame was pushed, `false` when a native function already finished.
    fn precall(&mut self, func: usize, nargs: usize, nresults: i32, reg: u8) -> Result<bool, LuaError> {
        let (f, nargs) = self.resolve_call(func, nargs, Some(reg))?;
        match f {
            LuaValue::Closure(closure) => {
                self.push_lua_frame(closure, func, nargs, nresults, false)?;
                Ok(true)
            }
            LuaValue::NativeFunction(native) if native.kind != NativeKind::Plain => {
                self.protected_call(&native, func, nargs, nresults)
            }
            LuaValue::NativeFunction(native) => {
                let args = self.state.stack[func + 1..func + 1 + nargs].to_vec();
                match native.call(self, args) {
                    Ok(results) => {
                        self.place_results(func, results, nresults)?;
                        Ok(false)
                    }
                    Err(LuaError::Yield(vals)) => {
                        self.state.pending = Some(PendingCall { func, nresults, protected: false });
                        Err(LuaError::Yield(vals))
                    }
                    Err(e) => Err(e),
                }
            }
            _ => Err(self.type_error(&f, "call", Some(reg))),
        }
    }

    // ── Protected calls ───────────────────────────────────────────────────────

    /// `pcall` / `xpcall` called from the interpreter loop. A Lua body runs
    /// as a protected frame on the running thread, so it may yield; errors
    /// raised above it are caught in [`Vm::execute`].
    fn protected_call(&mut self, native: &NativeFunction, func: usize, nargs: usize, nresults: i32) -> Result<bool, LuaError> {
        if nargs == 0 {
            return Err(self.runtime_error(format!("bad argument #1 to '{}' (value expected)", native.name)));
        }
        let (body, nargs, handler) = if native.kind == NativeKind::XPCall {
            let handler = if nargs < 2 { LuaValue::Nil } else { self.state.stack[func + 2].clone() };
            if nargs < 2 || !handler.is_function() {
                let got = if nargs < 2 { "no value" } else { handler.type_name() };
                return Err(self.runtime_error(format!(
                    "bad argument #2 to '{}' (function expected, got {got})",
                    native.name
                )));
            }
            // The body takes the handler's slot so its arguments follow it.
            let f = self.state.stack[func + 1].clone();
            self.state.stack[func + 2] = f;
            (func + 2, nargs - 2, Some(handler))
        } else {
            (func + 1, nargs - 1, None)
        };
        let protect = Protect { slot: func, nresults, handler };
        let depth = self.state.frames.len();

        let (f, nargs) = match self.resolve_call(body, nargs, None) {
            Ok(resolved) => resolved,
            Err(e) => return self.fail_protected(depth, protect, e).map(|()| false),
        };
        match f {
            LuaValue::Closure(closure) => match self.push_lua_frame(closure, body, nargs, -1, false) {
                Ok(()) => {
                    if let Some(frame) = self.state.frames.last_mut() {
                        frame.protect = Some(protect);
                    }
                    Ok(true)
                }
                Err(e) => self.fail_protected(depth, protect, e).map(|()| false),
            },
            LuaValue::NativeFunction(inner) => {
                let args = self.state.stack[body + 1..body + 1 + nargs].to_vec();
                match inner.call(self, args) {
                    Ok(mut vals) => {
                        vals.insert(0, LuaValue::Boolean(true));
                        self.place_results(func, vals, nresults)?;
                        Ok(false)
                    }
                    Err(LuaError::Yield(vals)) => {
                        self.state.pending = Some(PendingCall { func, nresults, protected: true });
                        Err(LuaError::Yield(vals))
                    }
                    Err(e) => self.fail_protected(depth, protect, e).map(|()| false),
                }
            }
            _ => {
                let e = self.type_error(&f, "call", None);
                self.fail_protected(depth, protect, e).map(|()| false)
            }
        }
    }

    /// Finish a protected call with `false` and the (handled) error value,
    /// dropping every frame above `depth`. Uncatchable errors pass through.
    fn fail_protected(&mut self, depth: usize, protect: Protect, err: LuaError) -> Result<(), LuaError> {
        if !err.is_catchable() {
            return Err(err);
        }
        debug!(target: "lua::vm", depth, error = %err, "protected call caught error");
        // The handler sees the stack as it was at the error.
        let value = match protect.handler {
            None => err.to_value(),
            Some(handler) => match self.call_value(handler, vec![err.to_value()]) {
                Ok(vals) => first(vals),
                Err(he) if !he.is_catchable() => return Err(he),
                Err(he) => he.to_value(),
            },
        };
        self.unwind_to(depth);
        self.place_results(protect.slot, vec![LuaValue::Boolean(false), value], protect.nresults)
    }

    /// Run a coroutine body on the freshly swapped-in empty state.
    pub(crate) fn enter_coroutine_body(&mut self, body: LuaValue, args: Vec<LuaValue>) -> Result<RunOutcome, LuaError> {
        let (f, args) = self.callable(body, args)?;
        let LuaValue::Closure(closure) = f else {
            return match self.call_value_inner(f, args) {
                Ok(vals) => Ok(RunOutcome::Returned(vals)),
                Err(LuaError::Yield(vals)) => Ok(RunOutcome::Yielded(vals)),
                Err(e) => Err(e),
            };
        };
        let nargs = args.len();
        self.ensure_stack(nargs + 1)?;
        self.state.stack[0] = LuaValue::Closure(closure.clone());
        for (i, arg) in args.into_iter().enumerate() {
            self.state.stack[1 + i] = arg;
        }
        self.push_lua_frame(closure, 0, nargs, -1, true)?;
        self.execute(0)
    }

    /// Deliver resume values as the results of the call that yielded.
    pub(crate) fn place_pending(&mut self, pending: PendingCall, mut vals: Vec<LuaValue>) -> Result<(), LuaError> {
        if pending.protected {
            vals.insert(0, LuaValue::Boolean(true));
        }
        self.place_results(pending.func, vals, pending.nresults)
    }

    // ── Core interpreter loop ─────────────────────────────────────────────────

    /// Run until the boundary frame at index `entry` returns or the thread
    /// yields. An error raised above `entry` unwinds to the innermost
    /// protected frame at or above it, if there is one.
    pub(crate) fn execute(&mut self, entry: usize) -> Result<RunOutcome, LuaError> {
        loop {
            let err = match self.run_frames() {
                Err(e) if e.is_catchable() && !matches!(e, LuaError::Yield(_)) => e,
                other => return other,
            };
            let frames = self.state.frames.get(entry..).unwrap_or_default();
            let Some(depth) = frames.iter().rposition(|f| f.protect.is_some()).map(|i| entry + i) else {
                return Err(err);
            };
            let Some(protect) = self.state.frames[depth].protect.take() else {
                return Err(err);
            };
            self.fail_protected(depth, protect, err)?;
        }
    }

    fn run_frames(&mut self) -> Result<RunOutcome, LuaError> {
        'frames: loop {
            let Some(frame) = self.state.frames.last() else {
                return Ok(RunOutcome::Returned(Vec::new()));
            };
            let closure = frame.closure.clone();
            let base = frame.base;
            let mut pc = frame.pc;
            let proto: &Proto = &closure.proto;
            let k = &proto.constants;

            macro_rules! reg {
                ($r:expr) => {
                    self.state.stack[base + $r as usize]
                };
            }
            macro_rules! rk {
                ($rk:expr) => {
                    match $rk {
                        Rk::Reg(r) => self.state.stack[base + r as usize].clone(),
                        Rk::Const(i) => LuaValue::from(&k[i as usize]),
                    }
                };
            }
            macro_rules! rk_reg {
                ($rk:expr) => {
                    match $rk {
                        Rk::Reg(r) => Some(r),
                        Rk::Const(_) => None,
                    }
                };
            }
            macro_rules! jump {
                ($offset:expr) => {
                    pc = (pc as i64 + $offset as i64) as usize
                };
            }
            macro_rules! call_result {
                ($result:expr) => {
                    match $result {
                        Ok(true) => continue 'frames,
                        Ok(false) => {}
                        Err(LuaError::Yield(vals)) => return Ok(RunOutcome::Yielded(vals)),
                        Err(e) => return Err(e),
                    }
                };
            }

            loop {
                let Some(&op) = proto.instructions.get(pc) else {
                    return Err(self.runtime_error("instruction pointer ran past the end of the function"));
                };
                pc += 1;
                if let Some(f) = self.state.frames.last_mut() {
                    f.pc = pc;
                }

                match op {
                    OpCode::Move { dst, src } => {
                        let v = reg!(src).clone();
                        reg!(dst) = v;
                    }
                    OpCode::LoadK { dst, const_idx } => {
                        reg!(dst) = LuaValue::from(&k[const_idx as usize]);
                    }
                    OpCode::LoadBool { dst, value, skip } => {
                        reg!(dst) = LuaValue::Boolean(value);
                        if skip {
                            pc += 1;
                        }
                    }
                    OpCode::LoadNil { dst, count } => {
                        for r in dst as usize..dst as usize + count as usize {
                            reg!(r) = LuaValue::Nil;
                        }
                    }

                    // ── Upvalues and globals ──────────────────────────────────
                    OpCode::GetUpval { dst, upval } => {
                        let v = self.read_upvalue(&closure.upvalues[upval as usize]);
                        reg!(dst) = v;
                    }
                    OpCode::SetUpval { src, upval } => {
                        let v = reg!(src).clone();
                        self.write_upvalue(&closure.upvalues[upval as usize], v);
                    }
                    OpCode::GetGlobal { dst, name } => {
                        let env = LuaValue::Table(closure.env());
                        let v = self.index_value(&env, LuaValue::from(&k[name as usize]))?;
                        reg!(dst) = v;
                    }
                    OpCode::SetGlobal { src, name } => {
                        let env = LuaValue::Table(closure.env());
                        let v = reg!(src).clone();
                        self.set_index(&env, LuaValue::from(&k[name as usize]), v)?;
                    }

                    // ── Tables ────────────────────────────────────────────────
                    OpCode::GetTable { dst, table, key } => {
                        let obj = reg!(table).clone();
                        let v = self.index_checked(&obj, rk!(key), table)?;
                        reg!(dst) = v;
                    }
                    OpCode::SetTable { table, key, val } => {
                        let obj = reg!(table).clone();
                        if !matches!(obj, LuaValue::Table(_)) && self.metamethod_of(&obj, "__newindex").is_nil() {
                            return Err(self.type_error(&obj, "index", Some(table)));
                        }
                        self.set_index(&obj, rk!(key), rk!(val))?;
                    }
                    OpCode::NewTable { dst, array_hint, hash_hint } => {
                        let t = LuaTable::with_capacity(array_hint as usize, hash_hint as usize);
                        reg!(dst) = LuaValue::Table(t.into_ref());
                    }
                    OpCode::Method { dst, obj, key } => {
                        let o = reg!(obj).clone();
                        let method = self.index_checked(&o, rk!(key), obj)?;
                        reg!(dst + 1) = o;
                        reg!(dst) = method;
                    }
                    OpCode::SetList { table, count, batch } => {
                        let t_abs = base + table as usize;
                        let n = if count == 0 {
                            self.state.top.saturating_sub(t_abs + 1)
                        } else {
                            count as usize
                        };
                        let batch = if batch == 0 {
                            match proto.instructions.get(pc) {
                                Some(OpCode::ExtraArg { value }) => {
                                    pc += 1;
                                    *value as usize
                                }
                                _ => return Err(self.runtime_error("SETLIST without EXTRAARG")),
                            }
                        } else {
                            batch as usize
                        };
                        let LuaValue::Table(t) = reg!(table).clone() else {
                            return Err(self.runtime_error("SETLIST on a non-table"));
                        };
                        let start = (batch - 1) * lua_core::opcode::FIELDS_PER_FLUSH as usize;
                        let mut t = t.write();
                        for i in 1..=n {
                            t.set_int((start + i) as i64, self.state.stack[t_abs + i].clone());
                        }
                    }

                    // ── Arithmetic ────────────────────────────────────────────
                    OpCode::Add { dst, lhs, rhs } => {
                        let v = self.arith(ArithOp::Add, rk!(lhs), rk!(rhs), rk_reg!(lhs), rk_reg!(rhs))?;
                        reg!(dst) = v;
                    }
                    OpCode::Sub { dst, lhs, rhs } => {
                        let v = self.arith(ArithOp::Sub, rk!(lhs), rk!(rhs), rk_reg!(lhs), rk_reg!(rhs))?;
                        reg!(dst) = v;
                    }
                    OpCode::Mul { dst, lhs, rhs } => {
                        let v = self.arith(ArithOp::Mul, rk!(lhs), rk!(rhs), rk_reg!(lhs), rk_reg!(rhs))?;
                        reg!(dst) = v;
                    }
                    OpCode::Div { dst, lhs, rhs } => {
                        let v = self.arith(ArithOp::Div, rk!(lhs), rk!(rhs), rk_reg!(lhs), rk_reg!(rhs))?;
                        reg!(dst) = v;
                    }
                    OpCode::Mod { dst, lhs, rhs } => {
                        let v = self.arith(ArithOp::Mod, rk!(lhs), rk!(rhs), rk_reg!(lhs), rk_reg!(rhs))?;
                        reg!(dst) = v;
                    }
                    OpCode::Pow { dst, lhs, rhs } => {
                        let v = self.arith(ArithOp::Pow, rk!(lhs), rk!(rhs), rk_reg!(lhs), rk_reg!(rhs))?;
                        reg!(dst) = v;
                    }
                    OpCode::IDiv { dst, lhs, rhs } => {
                        let v = self.arith(ArithOp::IDiv, rk!(lhs), rk!(rhs), rk_reg!(lhs), rk_reg!(rhs))?;
                        reg!(dst) = v;
                    }
                    OpCode::BAnd { dst, lhs, rhs } => {
                        let v = self.arith(ArithOp::BAnd, rk!(lhs), rk!(rhs), rk_reg!(lhs), rk_reg!(rhs))?;
                        reg!(dst) = v;
                    }
                    OpCode::BOr { dst, lhs, rhs } => {
                        let v = self.arith(ArithOp::BOr, rk!(lhs), rk!(rhs), rk_reg!(lhs), rk_reg!(rhs))?;
                        reg!(dst) = v;
                    }
                    OpCode::BXor { dst, lhs, rhs } => {
                        let v = self.arith(ArithOp::BXor, rk!(lhs), rk!(rhs), rk_reg!(lhs), rk_reg!(rhs))?;
                        reg!(dst) = v;
                    }
                    OpCode::Shl { dst, lhs, rhs } => {
                        let v = self.arith(ArithOp::Shl, rk!(lhs), rk!(rhs), rk_reg!(lhs), rk_reg!(rhs))?;
                        reg!(dst) = v;
                    }
                    OpCode::Shr { dst, lhs, rhs } => {
                        let v = self.arith(ArithOp::Shr, rk!(lhs), rk!(rhs), rk_reg!(lhs), rk_reg!(rhs))?;
                        reg!(dst) = v;
                    }
                    OpCode::Unm { dst, src } => {
                        let a = reg!(src).clone();
                        let v = self.arith(ArithOp::Unm, a.clone(), a, Some(src), Some(src))?;
                        reg!(dst) = v;
                    }
                    OpCode::BNot { dst, src } => {
                        let a = reg!(src).clone();
                        let v = self.arith(ArithOp::BNot, a.clone(), a, Some(src), Some(src))?;
                        reg!(dst) = v;
                    }
                    OpCode::Not { dst, src } => {
                        let v = !reg!(src).is_truthy();
                        reg!(dst) = LuaValue::Boolean(v);
                    }
                    OpCode::Len { dst, src } => {
                        let v = reg!(src).clone();
                        let n = self.length_of(&v, Some(src))?;
                        reg!(dst) = n;
                    }
                    OpCode::Concat { dst, first, last } => {
                        let v = self.concat_range(base, first, last)?;
                        reg!(dst) = v;
                    }

                    // ── Control flow ──────────────────────────────────────────
                    OpCode::Jmp { offset, close } => {
                        if close > 0 {
                            self.state.close_upvalues(base + close as usize - 1);
                        }
                        jump!(offset);
                    }
                    OpCode::Eq { expect, lhs, rhs } => {
                        if self.equals(&rk!(lhs), &rk!(rhs))? != expect {
                            pc += 1;
                        }
                    }
                    OpCode::Lt { expect, lhs, rhs } => {
                        if self.less_than(&rk!(lhs), &rk!(rhs))? != expect {
                            pc += 1;
                        }
                    }
                    OpCode::Le { expect, lhs, rhs } => {
                        if self.less_equal(&rk!(lhs), &rk!(rhs))? != expect {
                            pc += 1;
                        }
                    }
                    OpCode::Test { src, expect } => {
                        if reg!(src).is_truthy() != expect {
                            pc += 1;
                        }
                    }
                    OpCode::TestSet { dst, src, expect } => {
                        if reg!(src).is_truthy() == expect {
                            let v = reg!(src).clone();
                            reg!(dst) = v;
                        } else {
                            pc += 1;
                        }
                    }
                    OpCode::ForPrep { base: a, offset } => {
                        if !self.prepare_for(base + a as usize)? {
                            jump!(offset);
                        }
                    }
                    OpCode::ForLoop { base: a, offset } => {
                        let a = base + a as usize;
                        let st = &mut self.state.stack;
                        let again = match (st[a].clone(), st[a + 1].clone(), st[a + 2].clone()) {
                            (LuaValue::Integer(i), LuaValue::Integer(count), LuaValue::Integer(step)) => {
                                if count != 0 {
                                    let next = i.wrapping_add(step);
                                    st[a + 1] = LuaValue::Integer((count as u64 - 1) as i64);
                                    st[a] = LuaValue::Integer(next);
                                    st[a + 3] = LuaValue::Integer(next);
                                    true
                                } else {
                                    false
                                }
                            }
                            (LuaValue::Float(i), LuaValue::Float(limit), LuaValue::Float(step)) => {
                                let next = i + step;
                                let go = if step > 0.0 { next <= limit } else { next >= limit };
                                if go {
                                    st[a] = LuaValue::Float(next);
                                    st[a + 3] = LuaValue::Float(next);
                                }
                                go
                            }
                            _ => false,
                        };
                        if again {
                            jump!(offset);
                        }
                    }
                    OpCode::TForCall { base: a, results } => {
                        let a_abs = base + a as usize;
                        for i in 0..3 {
                            let v = self.state.stack[a_abs + i].clone();
                            self.state.stack[a_abs + 3 + i] = v;
                        }
                        let nresults = results as i32;
                        let result = self.precall(a_abs + 3, 2, nresults, a);
                        call_result!(result);
                    }
                    OpCode::TForLoop { base: a, offset } => {
                        let a = base + a as usize;
                        if !self.state.stack[a + 3].is_nil() {
                            let v = self.state.stack[a + 3].clone();
                            self.state.stack[a + 2] = v;
                            jump!(offset);
                        }
                    }

                    // ── Function calls ────────────────────────────────────────
                    OpCode::Call { func, args, results } => {
                        let func_abs = base + func as usize;
                        let nargs = if args == 0 {
                            self.state.top.saturating_sub(func_abs + 1)
                        } else {
                            args as usize - 1
                        };
                        let nresults = results as i32 - 1;
                        let result = self.precall(func_abs, nargs, nresults, func);
                        call_result!(result);
                    }
                    OpCode::TailCall { func, args } => {
                        let func_abs = base + func as usize;
                        let nargs = if args == 0 {
                            self.state.top.saturating_sub(func_abs + 1)
                        } else {
                            args as usize - 1
                        };
                        let (f, nargs) = self.resolve_call(func_abs, nargs, Some(func))?;
                        if let LuaValue::Closure(callee) = f {
                            self.state.close_upvalues(base);
                            let Some(frame) = self.state.frames.pop() else {
                                return Err(self.runtime_error("tail call without a frame"));
                            };
                            for i in 0..=nargs {
                                let v = std::mem::replace(&mut self.state.stack[func_abs + i], LuaValue::Nil);
                                self.state.stack[frame.func + i] = v;
                            }
                            let pushed = self.push_lua_frame(callee, frame.func, nargs, frame.nresults, frame.boundary);
                            match (pushed, frame.protect) {
                                (Ok(()), protect) => {
                                    if let Some(top) = self.state.frames.last_mut() {
                                        top.protect = protect;
                                    }
                                }
                                (Err(e), Some(protect)) => {
                                    let depth = self.state.frames.len();
                                    self.fail_protected(depth, protect, e)?;
                                }
                                (Err(e), None) => return Err(e),
                            }
                            continue 'frames;
                        }
                        // Natives run as a plain call; the following RETURN
                        // hands their results on.
                        let result = self.precall(func_abs, nargs, -1, func);
                        call_result!(result);
                    }
                    OpCode::Return { first, count } => {
                        let start = base + first as usize;
                        let n = if count == 0 {
                            self.state.top.saturating_sub(start)
                        } else {
                            count as usize - 1
                        };
                        let vals = self.state.stack[start..start + n].to_vec();
                        match self.return_from_frame(vals)? {
                            Some(vals) => return Ok(RunOutcome::Returned(vals)),
                            None => continue 'frames,
                        }
                    }
                    OpCode::VarArg { dst, count } => {
                        let dst_abs = base + dst as usize;
                        let available = self.state.frames.last().map_or(0, |f| f.varargs.len());
                        let n = if count == 0 { available } else { count as usize - 1 };
                        self.ensure_stack(dst_abs + n + 1)?;
                        let st = &mut self.state;
                        if let Some(frame) = st.frames.last() {
                            for i in 0..n {
                                st.stack[dst_abs + i] = frame.varargs.get(i).cloned().unwrap_or(LuaValue::Nil);
                            }
                        }
                        if count == 0 {
                            st.top = dst_abs + n;
                        }
                    }

                    // ── Closures ──────────────────────────────────────────────
                    OpCode::Closure { dst, proto_idx } => {
                        let child = closure.proto.protos[proto_idx as usize].clone();
                        let upvalues = child
                            .upvalue_descs
                            .iter()
                            .map(|desc| match desc {
                                UpvalueDesc::Stack(r) => self.find_upvalue(base + *r as usize),
                                UpvalueDesc::Upvalue(i) => closure.upvalues[*i as usize].clone(),
                            })
                            .collect();
                        let f = LuaClosure::new(child, upvalues, closure.env());
                        reg!(dst) = LuaValue::Closure(Arc::new(f));
                    }
                    OpCode::Close { from } => {
                        self.state.close_upvalues(base + from as usize);
                    }
                    OpCode::ExtraArg { .. } => {
                        return Err(self.runtime_error("unexpected EXTRAARG"));
                    }
                }
            }
        }
    }

    /// Set up a numeric `for`. Returns `false` when the loop does not run.
    fn prepare_for(&mut self, a: usize) -> Result<bool, LuaError> {
        let init = self.state.stack[a].clone();
        let limit = self.state.stack[a + 1].clone();
        let step = self.state.stack[a + 2].clone();
        if let (LuaValue::Integer(i), LuaValue::Integer(s)) = (&init, &step) {
            let (i, s) = (*i, *s);
            if s == 0 {
                return Err(self.runtime_error("'for' step is zero"));
            }
            let Some(limit) = limit.as_number() else {
                return Err(self.runtime_error("'for' limit must be a number"));
            };
            let Some(l) = int_for_limit(limit, s) else {
                return Ok(false);
            };
            if (s > 0 && i > l) || (s < 0 && i < l) {
                return Ok(false);
            }
            // Remaining iterations, so the index never overflows.
            let count = if s > 0 {
                (l as u64).wrapping_sub(i as u64) / s as u64
            } else {
                (i as u64).wrapping_sub(l as u64) / s.unsigned_abs()
            };
            self.state.stack[a + 1] = LuaValue::Integer(count as i64);
            self.state.stack[a + 3] = LuaValue::Integer(i);
            return Ok(true);
        }
        let Some(i) = init.as_number() else {
            return Err(self.runtime_error("'for' initial value must be a number"));
        };
        let Some(l) = limit.as_number() else {
            return Err(self.runtime_error("'for' limit must be a number"));
        };
        let Some(s) = step.as_number() else {
            return Err(self.runtime_error("'for' step must be a number"));
        };
        let (i, l, s) = (i.to_f64(), l.to_f64(), s.to_f64());
        if s == 0.0 {
            return Err(self.runtime_error("'for' step is zero"));
        }
        let runs = if s > 0.0 { i <= l } else { i >= l };
        if !runs {
            return Ok(false);
        }
        let st = &mut self.state.stack;
        st[a] = LuaValue::Float(i);
        st[a + 1] = LuaValue::Float(l);
        st[a + 2] = LuaValue::Float(s);
        st[a + 3] = LuaValue::Float(i);
        Ok(true)
    }

    // ── Upvalue helpers ───────────────────────────────────────────────────────

    /// The open cell aliasing `index`, created on first capture.
    fn find_upvalue(&mut self, index: usize) -> Upvalue {
        let thread = self.current_id;
        self.state
            .open_upvalues
            .entry(index)
            .or_insert_with(|| Upvalue::open(thread, index))
            .clone()
    }

    pub(crate) fn read_upvalue(&self, cell: &Upvalue) -> LuaValue {
        let inner = cell.0.read();
        match &*inner {
            UpvalueInner::Closed(v) => v.clone(),
            UpvalueInner::Open { thread, index } if *thread == self.current_id => {
                self.state.stack.get(*index).cloned().unwrap_or(LuaValue::Nil)
            }
            UpvalueInner::Open { thread, index } => self
                .with_parked_state(*thread, |st| st.stack.get(*index).cloned())
                .flatten()
                .unwrap_or(LuaValue::Nil),
        }
    }

    pub(crate) fn write_upvalue(&mut self, cell: &Upvalue, val: LuaValue) {
        let mut inner = cell.0.write();
        match &mut *inner {
            UpvalueInner::Closed(v) => *v = val,
            UpvalueInner::Open { thread, index } if *thread == self.current_id => {
                if let Some(slot) = self.state.stack.get_mut(*index) {
                    *slot = val;
                }
            }
            UpvalueInner::Open { thread, index } => {
                let index = *index;
                self.with_parked_state(*thread, |st| {
                    if let Some(slot) = st.stack.get_mut(index) {
                        *slot = val;
                    }
                });
            }
        }
    }

    /// Run `f` on the parked state of a thread that is not running.
    fn with_parked_state<R>(&self, thread: ThreadId, f: impl FnOnce(&mut ExecState) -> R) -> Option<R> {
        let co = self.threads.get(&thread)?.upgrade()?;
        let mut guard = co.lock();
        Some(f(&mut guard.state))
    }

    // ── Metamethods ───────────────────────────────────────────────────────────

    pub(crate) fn metatable_of(&self, v: &LuaValue) -> Option<TableRef> {
        match v {
            LuaValue::Table(t) => t.read().metatable(),
            LuaValue::LuaString(_) => Some(self.string_meta.clone()),
            LuaValue::UserData(u) => u.metatable.read().clone(),
            _ => None,
        }
    }

    pub(crate) fn metamethod_of(&self, v: &LuaValue, event: &str) -> LuaValue {
        match self.metatable_of(v) {
            Some(mt) => mt.read().get_str(event),
            None => LuaValue::Nil,
        }
    }

    fn binary_metamethod(&self, lhs: &LuaValue, rhs: &LuaValue, event: &str) -> LuaValue {
        let mm = self.metamethod_of(lhs, event);
        if !mm.is_nil() {
            return mm;
        }
        self.metamethod_of(rhs, event)
    }

    fn call_metamethod(&mut self, mm: LuaValue, args: Vec<LuaValue>) -> Result<LuaValue, LuaError> {
        Ok(first(self.call_value(mm, args)?))
    }

    /// `obj[key]` with `__index` dispatch.
    pub fn index_value(&mut self, obj: &LuaValue, key: LuaValue) -> Result<LuaValue, LuaError> {
        let mut current = obj.clone();
        for _ in 0..MAX_META_CHAIN {
            let handler = match &current {
                LuaValue::Table(t) => {
                    let (v, mt) = {
                        let t = t.read();
                        (t.get(&key), t.metatable())
                    };
                    if !v.is_nil() {
                        return Ok(v);
                    }
                    let Some(mt) = mt else {
                        return Ok(LuaValue::Nil);
                    };
                    let h = mt.read().get_str("__index");
                    if h.is_nil() {
                        return Ok(LuaValue::Nil);
                    }
                    h
                }
                other => {
                    let h = self.metamethod_of(other, "__index");
                    if h.is_nil() {
                        return Err(self.type_error(other, "index", None));
                    }
                    h
                }
            };
            if handler.is_function() {
                return self.call_metamethod(handler, vec![current, key]);
            }
            current = handler;
        }
        Err(self.runtime_error("'__index' chain too long; possible loop"))
    }

    fn index_checked(&mut self, obj: &LuaValue, key: LuaValue, reg: u8) -> Result<LuaValue, LuaError> {
        if !matches!(obj, LuaValue::Table(_)) && self.metamethod_of(obj, "__index").is_nil() {
            return Err(self.type_error(obj, "index", Some(reg)));
        }
        self.index_value(obj, key)
    }

    /// `obj[key] = val` with `__newindex` dispatch.
    pub fn set_index(&mut self, obj: &LuaValue, key: LuaValue, val: LuaValue) -> Result<(), LuaError> {
        let mut current = obj.clone();
        for _ in 0..MAX_META_CHAIN {
            let handler = match &current {
                LuaValue::Table(t) => {
                    let (present, mt) = {
                        let t = t.read();
                        (!t.get(&key).is_nil(), t.metatable())
                    };
                    let h = match mt {
                        Some(mt) if !present => mt.read().get_str("__newindex"),
                        _ => LuaValue::Nil,
                    };
                    if h.is_nil() {
                        let result = t.write().set(key, val);
                        return result.map_err(|e| self.with_position(e));
                    }
                    h
                }
                other => {
                    let h = self.metamethod_of(other, "__newindex");
                    if h.is_nil() {
                        return Err(self.type_error(other, "index", None));
                    }
                    h
                }
            };
            if handler.is_function() {
                self.call_value(handler, vec![current, key, val])?;
                return Ok(());
            }
            current = handler;
        }
        Err(self.runtime_error("'__newindex' chain too long; possible loop"))
    }

    fn arith(
        &mut self,
        op: ArithOp,
        a: LuaValue,
        b: LuaValue,
        ra: Option<u8>,
        rb: Option<u8>,
    ) -> Result<LuaValue, LuaError> {
        if let (Some(x), Some(y)) = (a.to_number(), b.to_number()) {
            return match arith(op, x, y) {
                Ok(n) => Ok(LuaValue::from_number(n)),
                Err(e) => Err(self.runtime_error(e.message())),
            };
        }
        let mm = self.binary_metamethod(&a, &b, op.event());
        if !mm.is_nil() {
            return self.call_metamethod(mm, vec![a, b]);
        }
        let (bad, reg) = if a.to_number().is_none() { (&a, ra) } else { (&b, rb) };
        let what = if op.is_bitwise() { "perform bitwise operation on" } else { "perform arithmetic on" };
        Err(self.type_error(bad, what, reg))
    }

    /// Arithmetic on two values with metamethod fallback, for library code.
    pub fn arith_values(&mut self, op: ArithOp, a: LuaValue, b: LuaValue) -> Result<LuaValue, LuaError> {
        self.arith(op, a, b, None, None)
    }

    pub(crate) fn length_of(&mut self, v: &LuaValue, reg: Option<u8>) -> Result<LuaValue, LuaError> {
        if let LuaValue::LuaString(s) = v {
            return Ok(LuaValue::Integer(s.len() as i64));
        }
        let mm = self.metamethod_of(v, "__len");
        if !mm.is_nil() {
            return self.call_metamethod(mm, vec![v.clone()]);
        }
        match v {
            LuaValue::Table(t) => Ok(LuaValue::Integer(t.read().length())),
            other => Err(self.type_error(other, "get length of", reg)),
        }
    }

    fn concat_range(&mut self, base: usize, first: u8, last: u8) -> Result<LuaValue, LuaError> {
        let (from, to) = (base + first as usize, base + last as usize);
        let parts: Option<Vec<LuaStr>> = self.state.stack[from..=to].iter().map(LuaValue::to_lua_str).collect();
        if let Some(parts) = parts {
            let mut buf = Vec::with_capacity(parts.iter().map(LuaStr::len).sum());
            for p in &parts {
                buf.extend_from_slice(p.as_bytes());
            }
            return Ok(LuaValue::LuaString(LuaStr::from(buf)));
        }
        let mut acc = self.state.stack[to].clone();
        for r in (first..last).rev() {
            let lhs = self.state.stack[base + r as usize].clone();
            let rhs_reg = (r + 1 == last).then_some(last);
            acc = self.concat_pair(lhs, acc, Some(r), rhs_reg)?;
        }
        Ok(acc)
    }

    fn concat_pair(
        &mut self,
        a: LuaValue,
        b: LuaValue,
        ra: Option<u8>,
        rb: Option<u8>,
    ) -> Result<LuaValue, LuaError> {
        if let (Some(x), Some(y)) = (a.to_lua_str(), b.to_lua_str()) {
            return Ok(LuaValue::LuaString(x.concat(&y)));
        }
        let mm = self.binary_metamethod(&a, &b, "__concat");
        if !mm.is_nil() {
            return self.call_metamethod(mm, vec![a, b]);
        }
        let (bad, reg) = if a.to_lua_str().is_none() { (&a, ra) } else { (&b, rb) };
        Err(self.type_error(bad, "concatenate", reg))
    }

    /// `a == b` with `__eq`.
    pub fn equals(&mut self, a: &LuaValue, b: &LuaValue) -> Result<bool, LuaError> {
        if a.raw_equals(b) {
            return Ok(true);
        }
        match (a, b) {
            (LuaValue::Table(_), LuaValue::Table(_)) | (LuaValue::UserData(_), LuaValue::UserData(_)) => {
                let mm = self.binary_metamethod(a, b, "__eq");
                if mm.is_nil() {
                    return Ok(false);
                }
                Ok(self.call_metamethod(mm, vec![a.clone(), b.clone()])?.is_truthy())
            }
            _ => Ok(false),
        }
    }

    /// `a < b` with `__lt`.
    pub fn less_than(&mut self, a: &LuaValue, b: &LuaValue) -> Result<bool, LuaError> {
        match (a, b) {
            (LuaValue::LuaString(x), LuaValue::LuaString(y)) => return Ok(x < y),
            _ => {
                if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
                    return Ok(num_lt(x, y));
                }
            }
        }
        let mm = self.binary_metamethod(a, b, "__lt");
        if mm.is_nil() {
            return Err(self.compare_error(a, b));
        }
        Ok(self.call_metamethod(mm, vec![a.clone(), b.clone()])?.is_truthy())
    }

    /// `a <= b` with `__le`, falling back to `not (b < a)`.
    pub fn less_equal(&mut self, a: &LuaValue, b: &LuaValue) -> Result<bool, LuaError> {
        match (a, b) {
            (LuaValue::LuaString(x), LuaValue::LuaString(y)) => return Ok(x <= y),
            _ => {
                if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
                    return Ok(num_le(x, y));
                }
            }
        }
        let mm = self.binary_metamethod(a, b, "__le");
        if !mm.is_nil() {
            return Ok(self.call_metamethod(mm, vec![a.clone(), b.clone()])?.is_truthy());
        }
        let mm = self.binary_metamethod(b, a, "__lt");
        if !mm.is_nil() {
            return Ok(!self.call_metamethod(mm, vec![b.clone(), a.clone()])?.is_truthy());
        }
        Err(self.compare_error(a, b))
    }

    /// `tostring` semantics, honouring `__tostring`.
    pub fn tostring(&mut self, v: &LuaValue) -> Result<LuaStr, LuaError> {
        let mm = self.metamethod_of(v, "__tostring");
        if !mm.is_nil() {
            return match self.call_metamethod(mm, vec![v.clone()])? {
                LuaValue::LuaString(s) => Ok(s),
                _ => Err(self.runtime_error("'__tostring' must return a string")),
            };
        }
        Ok(match v {
            LuaValue::LuaString(s) => s.clone(),
            other => LuaStr::from(other.to_string()),
        })
    }

    // ── Errors ────────────────────────────────────────────────────────────────

    /// `chunk:line: ` of the Lua frame `level` steps down the stack
    /// (1 = the running function), or empty without line info.
    pub(crate) fn where_prefix(&self, level: usize) -> String {
        let frames = &self.state.frames;
        let Some(frame) = level.checked_sub(1).and_then(|l| frames.len().checked_sub(l + 1)).map(|i| &frames[i])
        else {
            return String::new();
        };
        let proto = &frame.closure.proto;
        match proto.line_at(frame.pc.saturating_sub(1)) {
            Some(line) => format!("{}:{}: ", proto.chunk_id(), line),
            None => String::new(),
        }
    }

    /// Closure of the Lua frame `level` steps down the stack.
    pub(crate) fn frame_closure(&self, level: usize) -> Option<Arc<LuaClosure>> {
        let frames = &self.state.frames;
        let idx = frames.len().checked_sub(level)?;
        frames.get(idx).map(|f| f.closure.clone())
    }

    pub(crate) fn runtime_error(&self, msg: impl AsRef<str>) -> LuaError {
        LuaError::runtime(format!("{}{}", self.where_prefix(1), msg.as_ref()))
    }

    /// Add the current position to a bare string error.
    pub(crate) fn with_position(&self, e: LuaError) -> LuaError {
        match e {
            LuaError::Runtime(LuaValue::LuaString(s)) => self.runtime_error(s.to_str_lossy()),
            other => other,
        }
    }

    fn type_error(&self, v: &LuaValue, op: &str, reg: Option<u8>) -> LuaError {
        let info = reg.and_then(|r| self.register_name(r)).unwrap_or_default();
        self.runtime_error(format!("attempt to {op} a {} value{info}", v.type_name()))
    }

    fn compare_error(&self, a: &LuaValue, b: &LuaValue) -> LuaError {
        let (t1, t2) = (a.type_name(), b.type_name());
        if t1 == t2 {
            self.runtime_error(format!("attempt to compare two {t1} values"))
        } else {
            self.runtime_error(format!("attempt to compare {t1} with {t2}"))
        }
    }

    /// ` (local 'x')` style description of what register `reg` holds.
    fn register_name(&self, reg: u8) -> Option<String> {
        let frame = self.state.frames.last()?;
        let (kind, name) = object_name(&frame.closure.proto, frame.pc.saturating_sub(1), reg)?;
        Some(format!(" ({kind} '{name}')"))
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.state.close_upvalues(0);
        for weak in self.threads.values() {
            if let Some(co) = weak.upgrade() {
                let mut co = co.lock();
                co.orphaned = true;
                co.state.close_upvalues(0);
            }
        }
        debug!(target: "lua::vm", session = self.session, "session dropped");
    }
}

/// First value of a result list.
pub(crate) fn first(vals: Vec<LuaValue>) -> LuaValue {
    vals.into_iter().next().unwrap_or(LuaValue::Nil)
}

/// Integer loop limit; `None` when the loop cannot run.
fn int_for_limit(limit: Number, step: i64) -> Option<i64> {
    match limit {
        Number::Int(l) => Some(l),
        Number::Float(f) if f.is_nan() => None,
        Number::Float(f) => {
            let floored = if step > 0 { f.floor() } else { f.ceil() };
            match float_to_int(floored) {
                Some(l) => Some(l),
                None if f > 0.0 => (step > 0).then_some(i64::MAX),
                None => (step < 0).then_some(i64::MIN),
            }
        }
    }
}

// ── Variable names for messages ───────────────────────────────────────────────

fn constant_name(proto: &Proto, idx: u32) -> Option<String> {
    match proto.constants.get(idx as usize)? {
        lua_core::Constant::Str(s) => Some(s.to_string()),
        _ => None,
    }
}

fn object_name(proto: &Proto, lastpc: usize, reg: u8) -> Option<(&'static str, String)> {
    if let Some(name) = proto.local_name(reg, lastpc) {
        return Some(("local", name.to_string()));
    }
    let setter = find_setreg(proto, lastpc, reg)?;
    match proto.instructions[setter] {
        OpCode::Move { src, .. } if src < reg => object_name(proto, setter, src),
        OpCode::GetGlobal { name, .. } => Some(("global", constant_name(proto, name)?)),
        OpCode::GetTable { key: Rk::Const(k), .. } => Some(("field", constant_name(proto, k as u32)?)),
        OpCode::Method { key: Rk::Const(k), .. } => Some(("method", constant_name(proto, k as u32)?)),
        OpCode::GetUpval { upval, .. } => {
            let name = proto.debug.upvalue_names.get(upval as usize).map(|n| n.to_string());
            Some(("upvalue", name.unwrap_or_else(|| "?".to_string())))
        }
        OpCode::LoadK { const_idx, .. } => Some(("constant", constant_name(proto, const_idx)?)),
        _ => None,
    }
}

/// Last instruction before `lastpc` that assigned `reg`, skipping
/// assignments inside conditional code that a jump may have bypassed.
fn find_setreg(proto: &Proto, lastpc: usize, reg: u8) -> Option<usize> {
    let mut setreg = None;
    let mut jmptarget = 0usize;
    for (pc, op) in proto.instructions.iter().enumerate().take(lastpc) {
        if let OpCode::Jmp { offset, .. } = op {
            let dest = (pc as i64 + 1 + *offset as i64) as usize;
            if pc < dest && dest <= lastpc && dest > jmptarget {
                jmptarget = dest;
            }
            continue;
        }
        if sets_register(op, reg) {
            setreg = if pc < jmptarget { None } else { Some(pc) };
        }
    }
    setreg
}

fn sets_register(op: &OpCode, reg: u8) -> bool {
    let r = reg as u32;
    match *op {
        OpCode::LoadNil { dst, count } => (dst as u32..dst as u32 + count as u32).contains(&r),
        OpCode::Call { func, .. } | OpCode::TailCall { func, .. } => r >= func as u32,
        OpCode::TForCall { base, .. } => r >= base as u32 + 2,
        OpCode::VarArg { dst, count } => r >= dst as u32 && (count == 0 || r < dst as u32 + count as u32 - 1),
        OpCode::Method { dst, .. } => r == dst as u32 || r == dst as u32 + 1,
        OpCode::ForPrep { base, .. } | OpCode::ForLoop { base, .. } => (base as u32..base as u32 + 4).contains(&r),
        OpCode::TForLoop { base, .. } => r == base as u32 + 2,
        OpCode::Move { dst, .. }
        | OpCode::LoadK { dst, .. }
        | OpCode::LoadBool { dst, .. }
        | OpCode::GetUpval { dst, .. }
        | OpCode::GetGlobal { dst, .. }
        | OpCode::GetTable { dst, .. }
        | OpCode::NewTable { dst, .. }
        | OpCode::Add { dst, .. }
        | OpCode::Sub { dst, .. }
        | OpCode::Mul { dst, .. }
        | OpCode::Div { dst, .. }
        | OpCode::Mod { dst, .. }
        | OpCode::Pow { dst, .. }
        | OpCode::IDiv { dst, .. }
        | OpCode::BAnd { dst, .. }
        | OpCode::BOr { dst, .. }
        | OpCode::BXor { dst, .. }
        | OpCode::Shl { dst, .. }
        | OpCode::Shr { dst, .. }
        | OpCode::Unm { dst, .. }
        | OpCode::BNot { dst, .. }
        | OpCode::Not { dst, .. }
        | OpCode::Len { dst, .. }
        | OpCode::Concat { dst, .. }
        | OpCode::TestSet { dst, .. }
        | OpCode::Closure { dst, .. } => r == dst as u32,
        _ => false,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn run(src: &str) -> LuaValue {
        first(Vm::new().exec(src, "=test").unwrap())
    }

    fn run_all(src: &str) -> Vec<LuaValue> {
        Vm::new().exec(src, "=test").unwrap()
    }

    fn run_err(src: &str) -> LuaError {
        Vm::new().exec(src, "=test").unwrap_err()
    }

    fn s(v: &str) -> LuaValue {
        LuaValue::from(v)
    }

    // ── Literals ─────────────────────────────────────────────────────────────
    #[test]
    fn returns_literals() {
        assert_eq!(run("return 42"), LuaValue::Integer(42));
        assert_eq!(run("return 1.5"), LuaValue::Float(1.5));
        assert_eq!(run("return 'hi'"), s("hi"));
        assert_eq!(run("return nil"), LuaValue::Nil);
        assert_eq!(run("return true"), LuaValue::Boolean(true));
        assert_eq!(run_all("return 1, 2, 3").len(), 3);
    }

    // ── Arithmetic ────────────────────────────────────────────────────────────
    #[test]
    fn integer_and_float_subtypes() {
        assert!(matches!(run("local a = 7 return a + 1"), LuaValue::Integer(8)));
        assert!(matches!(run("local a = 7 return a / 7"), LuaValue::Float(f) if f == 1.0));
        assert!(matches!(run("local a = 2 return a ^ 2"), LuaValue::Float(f) if f == 4.0));
        assert!(matches!(run("local a = 3 return a * 1.0"), LuaValue::Float(_)));
    }

    #[test]
    fn floor_division_and_modulo() {
        assert_eq!(run("local a, b = -7, 2 return a // b"), LuaValue::Integer(-4));
        assert_eq!(run("local a, b = -7, 2 return a % b"), LuaValue::Integer(1));
        assert_eq!(run("local a, b = 7, -2 return a % b"), LuaValue::Integer(-1));
        assert_eq!(run("local a, b = -7.5, 2 return a // b"), LuaValue::Float(-4.0));
    }

    #[test]
    fn integer_division_by_zero_is_an_error() {
        let e = run_err("local a, b = 1, 0 return a // b");
        assert_eq!(e.to_string(), "test:1: attempt to perform 'n//0'");
        let e = run_err("local a, b = 1, 0 return a % b");
        assert!(e.to_string().ends_with("attempt to perform 'n%%0'"));
        assert_eq!(run("local a, b = 1, 0 return a / b"), LuaValue::Float(f64::INFINITY));
    }

    #[test]
    fn integers_wrap() {
        assert_eq!(run("local a = math.maxinteger return a + 1"), LuaValue::Integer(i64::MIN));
    }

    #[test]
    fn string_coercion_in_arithmetic() {
        assert_eq!(run("local a = '10' return a + 1"), LuaValue::Integer(11));
        assert_eq!(run("local a = '0x10' return a * 2"), LuaValue::Integer(32));
        assert_eq!(run("return 1 .. 2"), s("12"));
    }

    #[test]
    fn bitwise_operators() {
        assert_eq!(run("local a = 6 return a & 3, a | 1, a ~ 2, ~a, a << 2, a >> 1"), LuaValue::Integer(2));
        assert_eq!(
            run_all("local a = 6 return a & 3, a | 1, a ~ 2, ~a, a << 2, a >> 1"),
            [2, 7, 4, -7, 24, 3].map(LuaValue::Integer).to_vec()
        );
        assert_eq!(run("local a = 3.0 return a | 0"), LuaValue::Integer(3));
        let e = run_err("local a = 1.5 return a | 0");
        assert!(e.to_string().contains("number has no integer representation"));
    }

    #[test]
    fn mixed_comparisons_are_exact() {
        assert_eq!(run("return math.maxinteger < 2^63"), LuaValue::Boolean(true));
        assert_eq!(run("return 2^53 == 2^53 + 1"), LuaValue::Boolean(true));
        assert_eq!(run("local i = 9007199254740993 return i == 2^53"), LuaValue::Boolean(false));
        assert_eq!(run("return 'a' < 'b', 'b' <= 'a'"), LuaValue::Boolean(true));
    }

    // ── Error messages ────────────────────────────────────────────────────────
    #[test]
    fn errors_name_the_variable() {
        assert_eq!(run_err("f()").to_string(), "test:1: attempt to call a nil value (global 'f')");
        assert_eq!(
            run_err("local t\nreturn t.x").to_string(),
            "test:2: attempt to index a nil value (local 't')"
        );
        assert_eq!(
            run_err("local t = {}\nreturn t.a.b").to_string(),
            "test:2: attempt to index a nil value (field 'a')"
        );
        assert_eq!(
            run_err("local z\nlocal function f() return z + 1 end\nreturn f()").to_string(),
            "test:2: attempt to perform arithmetic on a nil value (upvalue 'z')"
        );
        assert_eq!(
            run_err("local s = {}\ns:m()").to_string(),
            "test:2: attempt to call a nil value (method 'm')"
        );
        assert_eq!(
            run_err("local x = {} return 'a' .. x").to_string(),
            "test:1: attempt to concatenate a table value (local 'x')"
        );
        assert_eq!(run_err("return {} < {}").to_string(), "test:1: attempt to compare two table values");
        assert_eq!(run_err("return 1 < 'x'").to_string(), "test:1: attempt to compare number with string");
        assert_eq!(
            run_err("local n\nreturn #n").to_string(),
            "test:2: attempt to get length of a nil value (local 'n')"
        );
    }

    #[test]
    fn table_key_errors_carry_position() {
        assert_eq!(run_err("local t = {}\nt[nil] = 1").to_string(), "test:2: table index is nil");
        assert_eq!(run_err("local t = {}\nt[0/0] = 1").to_string(), "test:2: table index is NaN");
    }

    #[test]
    fn stripped_code_has_no_position() {
        let mut vm = Vm::new();
        let proto = compile(b"local t\nreturn t.x", "=s").unwrap().strip();
        let f = vm.instantiate_main(Arc::new(proto), None);
        let e = vm.call(&f, vec![]).unwrap_err();
        assert_eq!(e.to_string(), "attempt to index a nil value");
    }

    // ── Control flow ──────────────────────────────────────────────────────────
    #[test]
    fn loops() {
        assert_eq!(run("local s = 0 for i = 1, 10 do s = s + i end return s"), LuaValue::Integer(55));
        assert_eq!(run("local s = 0 for i = 10, 1, -2 do s = s + i end return s"), LuaValue::Integer(30));
        assert_eq!(run("local s = 0 for i = 1, 2, 0.5 do s = s + i end return s"), LuaValue::Float(4.5));
        assert_eq!(run("local n = 0 for i = 1, 0 do n = n + 1 end return n"), LuaValue::Integer(0));
        assert_eq!(
            run("local n = 0 for i = math.maxinteger - 2, math.maxinteger do n = n + 1 end return n"),
            LuaValue::Integer(3)
        );
        assert_eq!(run("local n = 0 for i = 1, 3.7 do n = i end return n"), LuaValue::Integer(3));
        assert_eq!(
            run("local i, s = 0, 0 while i < 5 do i = i + 1 s = s + i end return s"),
            LuaValue::Integer(15)
        );
        assert_eq!(run("local i = 0 repeat i = i + 1 until i >= 4 return i"), LuaValue::Integer(4));
        assert!(run_err("for i = 1, 10, 0 do end").to_string().contains("'for' step is zero"));
        assert!(run_err("for i = 1, 'x' do end").to_string().contains("'for' limit must be a number"));
    }

    #[test]
    fn goto_and_break() {
        assert_eq!(
            run("local s = 0 for i = 1, 10 do if i % 2 == 0 then goto continue end s = s + i ::continue:: end return s"),
            LuaValue::Integer(25)
        );
        assert_eq!(run("local i = 0 while true do i = i + 1 if i == 3 then break end end return i"), LuaValue::Integer(3));
    }

    #[test]
    fn logical_operators_short_circuit() {
        assert_eq!(run("return nil or 'x'"), s("x"));
        assert_eq!(run("return false and error('boom')"), LuaValue::Boolean(false));
        assert_eq!(run("local a = 1 return a and 2 or 3"), LuaValue::Integer(2));
        assert_eq!(run("return not nil"), LuaValue::Boolean(true));
    }

    // ── Functions ─────────────────────────────────────────────────────────────
    #[test]
    fn recursive_fibonacci() {
        let src = "local function fib(n) if n < 2 then return n end return fib(n-1) + fib(n-2) end return fib(20)";
        assert_eq!(run(src), LuaValue::Integer(6765));
    }

    #[test]
    fn varargs_and_multiple_results() {
        assert_eq!(run("local function f(...) return select('#', ...) end return f(1, nil, 3)"), LuaValue::Integer(3));
        assert_eq!(
            run_all("local function f(...) return ... end return f(1, 2, 3)"),
            [1, 2, 3].map(LuaValue::Integer).to_vec()
        );
        assert_eq!(
            run("local function f() return 1, 2 end local t = {f(), f()} return #t"),
            LuaValue::Integer(3)
        );
        assert_eq!(run("local function f(a, b) return b end return f(1)"), LuaValue::Nil);
    }

    #[test]
    fn closures_share_upvalues() {
        let src = r#"
            local function counter()
                local n = 0
                return function() n = n + 1 return n end, function() return n end
            end
            local inc, get = counter()
            inc() inc() inc()
            return get()
        "#;
        assert_eq!(run(src), LuaValue::Integer(3));
    }

    #[test]
    fn loop_closures_capture_fresh_variables() {
        let src = r#"
            local fs = {}
            for i = 1, 3 do fs[i] = function() return i end end
            return fs[1]() + fs[2]() * 10 + fs[3]() * 100
        "#;
        assert_eq!(run(src), LuaValue::Integer(321));
    }

    #[test]
    fn tail_calls_do_not_grow_the_stack() {
        let src = "local function loop(n) if n == 0 then return 'done' end return loop(n - 1) end return loop(100000)";
        assert_eq!(run(src), s("done"));
    }

    #[test]
    fn deep_recursion_overflows() {
        let e = run_err("local function f(n) return 1 + f(n + 1) end return f(1)");
        assert!(matches!(e, LuaError::StackOverflow(_)));
        assert!(e.to_string().contains("stack overflow"));
    }

    // ── Tables and metatables ─────────────────────────────────────────────────
    #[test]
    fn table_constructors() {
        assert_eq!(run("local t = {1, 2, 3, x = 'y'} return #t"), LuaValue::Integer(3));
        assert_eq!(run("local t = {[1] = 'a', [2.0] = 'b'} return t[2]"), s("b"));
        let big: Vec<String> = (1..=120).map(|i| i.to_string()).collect();
        let src = format!("local t = {{{}}} return #t, t[120]", big.join(","));
        assert_eq!(run_all(&src), vec![LuaValue::Integer(120), LuaValue::Integer(120)]);
    }

    #[test]
    fn metatable_index_chain() {
        let src = r#"
            local base = {greet = function(self) return 'hi ' .. self.name end}
            local mid = setmetatable({}, {__index = base})
            local obj = setmetatable({name = 'bob'}, {__index = mid})
            return obj:greet()
        "#;
        assert_eq!(run(src), s("hi bob"));
    }

    #[test]
    fn metatable_index_loop_is_detected() {
        let e = run_err("local t = {} setmetatable(t, {__index = t}) local mt = getmetatable(t) mt.__index = setmetatable({}, mt) return t.x");
        assert!(e.to_string().contains("'__index' chain too long"));
    }

    #[test]
    fn metatable_newindex_and_call() {
        let src = r#"
            local log = {}
            local t = setmetatable({}, {__newindex = function(t, k, v) rawset(log, k, v) end,
                                        __call = function(self, a, b) return a + b end})
            t.x = 5
            return rawget(t, 'x'), log.x, t(2, 3)
        "#;
        assert_eq!(run_all(src), vec![LuaValue::Nil, LuaValue::Integer(5), LuaValue::Integer(5)]);
    }

    #[test]
    fn arithmetic_and_comparison_metamethods() {
        let src = r#"
            local V = {}
            V.__index = V
            V.__add = function(a, b) return setmetatable({x = a.x + b.x}, V) end
            V.__eq = function(a, b) return a.x == b.x end
            V.__lt = function(a, b) return a.x < b.x end
            V.__len = function(a) return a.x end
            V.__concat = function(a, b) return 'V' .. (type(a) == 'table' and a.x or a) .. (type(b) == 'table' and b.x or b) end
            V.__unm = function(a) return setmetatable({x = -a.x}, V) end
            local a, b = setmetatable({x = 1}, V), setmetatable({x = 2}, V)
            local c = a + b
            return c.x, a == setmetatable({x = 1}, V), a < b, a <= b, #b, a .. '!', (-b).x
        "#;
        assert_eq!(
            run_all(src),
            vec![
                LuaValue::Integer(3),
                LuaValue::Boolean(true),
                LuaValue::Boolean(true),
                LuaValue::Boolean(true),
                LuaValue::Integer(2),
                s("V1!"),
                LuaValue::Integer(-2),
            ]
        );
    }

    #[test]
    fn string_methods_through_metatable() {
        assert_eq!(run("local s = 'abc' return s:upper()"), s("ABC"));
        assert_eq!(run("return ('x'):rep(3)"), s("xxx"));
        assert_eq!(run("return #'hello'"), LuaValue::Integer(5));
    }

    // ── Environments ──────────────────────────────────────────────────────────
    #[test]
    fn load_with_custom_env() {
        let mut vm = Vm::new();
        let env = LuaTable::new_ref();
        env.write().set_str("x", LuaValue::Integer(7));
        let f = vm.load(b"y = x * 2 return y", "=env", Some(env.clone())).unwrap();
        assert_eq!(vm.call(&f, vec![]).unwrap(), vec![LuaValue::Integer(14)]);
        assert_eq!(env.read().get_str("y"), LuaValue::Integer(14));
        assert_eq!(vm.get_global("y"), LuaValue::Nil);
    }

    #[test]
    fn host_functions_and_globals() {
        let mut vm = Vm::new();
        vm.register("double", |_, args| {
            let n = args.first().and_then(LuaValue::to_integer).unwrap_or(0);
            Ok(vec![LuaValue::Integer(n * 2)])
        });
        vm.set_global("base", LuaValue::Integer(10));
        assert_eq!(vm.exec("return double(base)", "=host").unwrap(), vec![LuaValue::Integer(20)]);
        assert_eq!(vm.call_depth(), 0);
    }

    #[test]
    fn errors_unwind_to_the_entry_depth() {
        let mut vm = Vm::new();
        let e = vm.exec("local function f() error('deep') end local function g() f() end g()", "=u");
        assert_eq!(e.unwrap_err().to_string(), "u:1: deep");
        assert_eq!(vm.call_depth(), 0);
        assert_eq!(vm.exec("return 1", "=u").unwrap(), vec![LuaValue::Integer(1)]);
    }

    #[test]
    fn binary_chunks_load_like_source() {
        let mut vm = Vm::new();
        let proto = compile(b"local a, b = ... return a * b", "=bin").unwrap();
        let bytes = lua_compiler::dump(&proto, true);
        let f = vm.load(&bytes, "=ignored", None).unwrap();
        assert_eq!(
            vm.call(&f, vec![LuaValue::Integer(6), LuaValue::Integer(7)]).unwrap(),
            vec![LuaValue::Integer(42)]
        );
        let e = vm.load(b"\x1bLua\x51", "=bad", None).unwrap_err();
        assert!(matches!(e, LuaError::Load(LoadError::ChunkFormat(_))));
    }

    #[test]
    fn session_limits_are_configurable() {
        let mut vm = Vm::with_options(VmOptions { max_call_depth: 50, ..VmOptions::default() });
        let e = vm.exec("local function f(n) return 1 + f(n) end return f(1)", "=lim").unwrap_err();
        assert!(matches!(e, LuaError::StackOverflow(_)));
        assert_eq!(vm.call_depth(), 0);
    }

    // ── Host stack ────────────────────────────────────────────────────────────
    #[test]
    fn deep_reentry_on_a_default_thread_stack() {
        let handle = std::thread::spawn(|| {
            let index_chain = run_err(
                "local t = setmetatable({}, {__index = function(t, k) return t[k] end}) return t.x",
            );
            let nested_resume = run_all(
                r#"
                local function nest(n)
                    local co = coroutine.create(function() return nest(n + 1) end)
                    local ok, v = coroutine.resume(co)
                    if ok then return v end
                    return n .. ' ' .. v
                end
                return nest(1)
                "#,
            );
            let sorted = run(
                r#"
                local depth = 0
                local function deep(a, b)
                    depth = depth + 1
                    local t = {3, 1, 2}
                    table.sort(t, deep)
                    return a < b
                end
                local ok, e = pcall(deep, 1, 2)
                return ok == false and depth > 100 and e
                "#,
            );
            (index_chain.to_string(), nested_resume, sorted.to_string())
        });
        let (index_chain, nested_resume, sorted) = handle.join().unwrap();
        assert!(index_chain.contains("C stack overflow"), "{index_chain}");
        assert!(nested_resume[0].to_string().ends_with("C stack overflow"));
        assert!(sorted.contains("C stack overflow"), "{sorted}");
    }

    // ── Protected calls ───────────────────────────────────────────────────────
    #[test]
    fn protected_call_argument_errors() {
        assert!(run_err("pcall()").to_string().contains("bad argument #1 to 'pcall' (value expected)"));
        assert!(run_err("xpcall(print)")
            .to_string()
            .contains("bad argument #2 to 'xpcall' (function expected, got no value)"));
        assert!(run_err("xpcall(print, 1)")
            .to_string()
            .contains("bad argument #2 to 'xpcall' (function expected, got number)"));
        let out = run_all("return pcall(nil)");
        assert_eq!(out[0], LuaValue::Boolean(false));
        assert!(out[1].to_string().ends_with("attempt to call a nil value"));
    }

    #[test]
    fn protected_call_results() {
        assert_eq!(
            run_all("local a, b = pcall(function() return 1, 2, 3 end) return a, b"),
            vec![LuaValue::Boolean(true), LuaValue::Integer(1)]
        );
        assert_eq!(
            run_all("return xpcall(function(...) return select('#', ...) end, print, nil, nil)"),
            vec![LuaValue::Boolean(true), LuaValue::Integer(2)]
        );
        let callable = "local t = setmetatable({}, {__call = function(self, x) return x * 2 end}) return pcall(t, 21)";
        assert_eq!(run_all(callable), vec![LuaValue::Boolean(true), LuaValue::Integer(42)]);
    }

    #[test]
    fn protected_call_catches_errors_from_tail_calls_and_nested_frames() {
        let src = r#"
            local function fail(n) if n == 0 then error('bottom', 0) end return 1 + fail(n - 1) end
            local function tail() return fail(5) end
            local ok, e = pcall(tail)
            local after = 'still running'
            return ok, e, after
        "#;
        assert_eq!(run_all(src), vec![LuaValue::Boolean(false), s("bottom"), s("still running")]);
    }

    #[test]
    fn nested_protected_calls_stop_at_the_innermost() {
        let src = r#"
            local log = {}
            local ok = pcall(function()
                local inner_ok, e = pcall(error, 'inner', 0)
                log[#log + 1] = tostring(inner_ok) .. ':' .. e
                error('outer', 0)
            end)
            log[#log + 1] = tostring(ok)
            return table.concat(log, ' ')
        "#;
        assert_eq!(run(src), s("false:inner false"));
    }

    #[test]
    fn xpcall_handler_replaces_the_error() {
        let src = r#"
            local function boom() error('deep', 0) end
            local ok, e = xpcall(function() boom() end, function(e) return 'handled ' .. e end)
            local bad_ok, bad = xpcall(error, function() error('again', 0) end, 'first', 0)
            return ok, e, bad_ok, bad
        "#;
        assert_eq!(
            run_all(src),
            vec![LuaValue::Boolean(false), s("handled deep"), LuaValue::Boolean(false), s("again")]
        );
    }
}
