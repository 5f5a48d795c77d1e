//! Coroutines as separate execution states that the session swaps in and
//! out of its running slot on resume and yield.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::LuaError;
use crate::value::LuaValue;
use crate::vm::{ExecState, RunOutcome, Vm, STACK_RED_ZONE, STACK_SEGMENT};

pub type CoroutineRef = Arc<Mutex<Coroutine>>;

static NEXT_THREAD: AtomicU64 = AtomicU64::new(1);

/// Identifies a thread. Ids are never reused, even across sessions, so an
/// open upvalue never resolves against a stack it does not belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

impl ThreadId {
    pub(crate) fn next() -> Self {
        ThreadId(NEXT_THREAD.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineStatus {
    /// Created but never resumed.
    Initial,
    Suspended,
    Running,
    /// Resumed another coroutine and is waiting for it.
    Normal,
    Dead,
}

impl CoroutineStatus {
    /// The name `coroutine.status` reports.
    pub fn name(self) -> &'static str {
        match self {
            CoroutineStatus::Initial | CoroutineStatus::Suspended => "suspended",
            CoroutineStatus::Running => "running",
            CoroutineStatus::Normal => "normal",
            CoroutineStatus::Dead => "dead",
        }
    }
}

pub struct Coroutine {
    pub(crate) id: ThreadId,
    pub(crate) session: u64,
    pub(crate) status: CoroutineStatus,
    pub(crate) body: LuaValue,
    /// Parked execution state; empty while the thread is running.
    pub(crate) state: ExecState,
    /// Set when the owning session is dropped.
    pub(crate) orphaned: bool,
}

impl Coroutine {
    pub(crate) fn new(id: ThreadId, session: u64, body: LuaValue) -> Self {
        Self {
            id,
            session,
            status: CoroutineStatus::Initial,
            body,
            state: ExecState::default(),
            orphaned: false,
        }
    }

    pub(crate) fn main(id: ThreadId, session: u64) -> Self {
        let mut main = Self::new(id, session, LuaValue::Nil);
        main.status = CoroutineStatus::Running;
        main
    }

    pub fn status(&self) -> CoroutineStatus {
        self.status
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id)
            .field("status", &self.status)
            .finish()
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        self.state.close_upvalues(0);
    }
}

impl Vm {
    /// Create a suspended coroutine running `body`.
    pub fn create_coroutine(&mut self, body: LuaValue) -> CoroutineRef {
        let id = ThreadId::next();
        let co = Arc::new(Mutex::new(Coroutine::new(id, self.session, body)));
        self.threads.retain(|_, weak| weak.strong_count() > 0);
        self.threads.insert(id, Arc::downgrade(&co));
        debug!(target: "lua::vm::coroutine", thread = id.0, "coroutine created");
        co
    }

    pub fn is_main_thread(&self) -> bool {
        Arc::ptr_eq(&self.current, &self.main)
    }

    pub fn running_coroutine(&self) -> CoroutineRef {
        self.current.clone()
    }

    /// Yielding is possible inside a coroutine with no host call between
    /// the coroutine body and the yield.
    pub fn is_yieldable(&self) -> bool {
        !self.is_main_thread() && self.state.nny == 0
    }

    pub fn coroutine_status(&self, co: &CoroutineRef) -> CoroutineStatus {
        if Arc::ptr_eq(co, &self.current) {
            return CoroutineStatus::Running;
        }
        co.lock().status
    }

    /// Resume `co`. The outer `Err` is reserved for errors no protected call
    /// may stop; the inner result is what `coroutine.resume` reports.
    pub fn resume(
        &mut self,
        co: &CoroutineRef,
        args: Vec<LuaValue>,
    ) -> Result<Result<Vec<LuaValue>, LuaValue>, LuaError> {
        let (id, body, initial) = {
            let mut c = co.lock();
            if c.session != self.session || c.orphaned {
                return Err(LuaError::OrphanedCoroutine);
            }
            match c.status {
                CoroutineStatus::Dead => return Ok(Err(LuaValue::from("cannot resume dead coroutine"))),
                CoroutineStatus::Running | CoroutineStatus::Normal => {
                    return Ok(Err(LuaValue::from("cannot resume non-suspended coroutine")))
                }
                CoroutineStatus::Initial | CoroutineStatus::Suspended => {}
            }
            if self.native_depth >= self.options().max_native_depth {
                return Ok(Err(LuaValue::from("C stack overflow")));
            }
            let initial = c.status == CoroutineStatus::Initial;
            c.status = CoroutineStatus::Running;
            (c.id, c.body.clone(), initial)
        };
        debug!(target: "lua::vm::coroutine", thread = id.0, initial, "resume");

        // Park the resumer and switch to the coroutine.
        let incoming = std::mem::take(&mut co.lock().state);
        let parked = std::mem::replace(&mut self.state, incoming);
        {
            let mut prev = self.current.lock();
            prev.state = parked;
            prev.status = CoroutineStatus::Normal;
        }
        let prev = std::mem::replace(&mut self.current, co.clone());
        let prev_id = std::mem::replace(&mut self.current_id, id);
        self.native_depth += 1;

        let outcome = stacker::maybe_grow(STACK_RED_ZONE, STACK_SEGMENT, || {
            if initial {
                self.start_coroutine(body, args)
            } else {
                self.continue_coroutine(args)
            }
        });

        // Switch back.
        self.native_depth -= 1;
        let restored = {
            let mut p = prev.lock();
            p.status = CoroutineStatus::Running;
            std::mem::take(&mut p.state)
        };
        let mut own = std::mem::replace(&mut self.state, restored);
        self.current = prev;
        self.current_id = prev_id;

        let mut c = co.lock();
        let result = match outcome {
            Ok(RunOutcome::Yielded(vals)) => {
                c.status = CoroutineStatus::Suspended;
                c.state = own;
                debug!(target: "lua::vm::coroutine", thread = id.0, values = vals.len(), "yielded");
                return Ok(Ok(vals));
            }
            Ok(RunOutcome::Returned(vals)) => Ok(Ok(vals)),
            Err(LuaError::OrphanedCoroutine) => Err(LuaError::OrphanedCoroutine),
            Err(e) => Ok(Err(e.to_value())),
        };
        c.status = CoroutineStatus::Dead;
        own.close_upvalues(0);
        debug!(target: "lua::vm::coroutine", thread = id.0, ok = matches!(result, Ok(Ok(_))), "finished");
        result
    }

    fn start_coroutine(&mut self, body: LuaValue, args: Vec<LuaValue>) -> Result<RunOutcome, LuaError> {
        match body {
            LuaValue::NativeFunction(native) => match native.call(self, args) {
                Ok(vals) => Ok(RunOutcome::Returned(vals)),
                Err(LuaError::Yield(vals)) => Ok(RunOutcome::Yielded(vals)),
                Err(e) => Err(e),
            },
            body => self.enter_coroutine_body(body, args),
        }
    }

    fn continue_coroutine(&mut self, args: Vec<LuaValue>) -> Result<RunOutcome, LuaError> {
        match self.state.pending.take() {
            Some(pending) => {
                self.place_pending(pending, args)?;
                self.execute(0)
            }
            // A native body that yielded finishes with the resume values.
            None => Ok(RunOutcome::Returned(args)),
        }
    }
}

/// `coroutine.wrap`: a function that resumes `co` and raises its errors.
pub fn wrap(co: CoroutineRef) -> LuaValue {
    LuaValue::native("wrap", move |vm, args| match vm.resume(&co, args)? {
        Ok(vals) => Ok(vals),
        Err(e) => Err(LuaError::Runtime(e)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_all(src: &str) -> Vec<LuaValue> {
        Vm::new().exec(src, "=co").unwrap()
    }

    #[test]
    fn status_names() {
        assert_eq!(CoroutineStatus::Initial.name(), "suspended");
        assert_eq!(CoroutineStatus::Normal.name(), "normal");
    }

    #[test]
    fn values_flow_both_ways() {
        let src = r#"
            local co = coroutine.create(function(a, b)
                local c = coroutine.yield(a + b)
                local d, e = coroutine.yield(c * 2)
                return d + e
            end)
            local _, x = coroutine.resume(co, 1, 2)
            local _, y = coroutine.resume(co, 10)
            local _, z = coroutine.resume(co, 3, 4)
            return x, y, z, coroutine.status(co)
        "#;
        assert_eq!(
            run_all(src),
            vec![LuaValue::Integer(3), LuaValue::Integer(20), LuaValue::Integer(7), LuaValue::from("dead")]
        );
    }

    #[test]
    fn resuming_a_dead_coroutine_fails() {
        let src = r#"
            local co = coroutine.create(function() end)
            coroutine.resume(co)
            return coroutine.resume(co)
        "#;
        assert_eq!(
            run_all(src),
            vec![LuaValue::Boolean(false), LuaValue::from("cannot resume dead coroutine")]
        );
    }

    #[test]
    fn errors_kill_the_coroutine() {
        let src = r#"
            local co = coroutine.create(function() error('oops', 0) end)
            local ok, msg = coroutine.resume(co)
            return ok, msg, coroutine.status(co)
        "#;
        assert_eq!(
            run_all(src),
            vec![LuaValue::Boolean(false), LuaValue::from("oops"), LuaValue::from("dead")]
        );
    }

    #[test]
    fn status_inside_and_outside() {
        let src = r#"
            local outer
            local inner = coroutine.create(function() return coroutine.status(outer) end)
            outer = coroutine.create(function()
                local _, s = coroutine.resume(inner)
                return s, coroutine.status(outer), coroutine.isyieldable()
            end)
            local _, a, b, c = coroutine.resume(outer)
            return a, b, c, coroutine.isyieldable()
        "#;
        assert_eq!(
            run_all(src),
            vec![
                LuaValue::from("normal"),
                LuaValue::from("running"),
                LuaValue::Boolean(true),
                LuaValue::Boolean(false),
            ]
        );
    }

    #[test]
    fn resuming_self_is_rejected() {
        let src = r#"
            local co
            co = coroutine.create(function() return coroutine.resume(co) end)
            return coroutine.resume(co)
        "#;
        assert_eq!(
            run_all(src),
            vec![
                LuaValue::Boolean(true),
                LuaValue::Boolean(false),
                LuaValue::from("cannot resume non-suspended coroutine"),
            ]
        );
    }

    #[test]
    fn yield_outside_a_coroutine_is_an_error() {
        let e = Vm::new().exec("coroutine.yield(1)", "=co").unwrap_err();
        assert!(e.to_string().contains("attempt to yield from outside a coroutine"));
    }

    #[test]
    fn yield_through_pcall() {
        let src = r#"
            local co = coroutine.create(function()
                local ok, v = pcall(coroutine.yield, 1)
                return ok, v
            end)
            local a, b = coroutine.resume(co)
            local c, d, e = coroutine.resume(co, 'back')
            return a, b, c, d, e, coroutine.status(co)
        "#;
        assert_eq!(
            run_all(src),
            vec![
                LuaValue::Boolean(true),
                LuaValue::Integer(1),
                LuaValue::Boolean(true),
                LuaValue::Boolean(true),
                LuaValue::from("back"),
                LuaValue::from("dead"),
            ]
        );
    }

    #[test]
    fn yield_inside_a_protected_lua_function() {
        let src = r#"
            local co = coroutine.wrap(function(n)
                local ok, sum = pcall(function()
                    local total = n
                    for _ = 1, 3 do total = total + coroutine.yield(total) end
                    return total
                end)
                return ok, sum
            end)
            local seen = {co(1), co(10), co(100)}
            local ok, sum = co(1000)
            return table.concat(seen, ' '), ok, sum
        "#;
        assert_eq!(
            run_all(src),
            vec![LuaValue::from("1 11 111"), LuaValue::Boolean(true), LuaValue::Integer(1111)]
        );
    }

    #[test]
    fn error_after_resume_is_caught_by_the_enclosing_pcall() {
        let src = r#"
            local co = coroutine.create(function()
                local ok, msg = pcall(function()
                    local x = coroutine.yield('waiting')
                    error('got ' .. x, 0)
                end)
                coroutine.yield(ok, msg)
                return 'finished'
            end)
            local _, w = coroutine.resume(co)
            local _, ok, msg = coroutine.resume(co, 'late')
            local _, last = coroutine.resume(co)
            return w, ok, msg, last
        "#;
        assert_eq!(
            run_all(src),
            vec![
                LuaValue::from("waiting"),
                LuaValue::Boolean(false),
                LuaValue::from("got late"),
                LuaValue::from("finished"),
            ]
        );
    }

    #[test]
    fn xpcall_handler_runs_after_a_yield() {
        let src = r#"
            local co = coroutine.wrap(function()
                return xpcall(function()
                    coroutine.yield('paused')
                    error({code = 7})
                end, function(e) return 'handled ' .. e.code end)
            end)
            local first = co()
            local ok, msg = co()
            return first, ok, msg
        "#;
        assert_eq!(
            run_all(src),
            vec![LuaValue::from("paused"), LuaValue::Boolean(false), LuaValue::from("handled 7")]
        );
    }

    #[test]
    fn protected_call_without_yield_keeps_caller_state() {
        let src = r#"
            local co = coroutine.create(function(a)
                local ok, e = pcall(error, 'inner', 0)
                local b = coroutine.yield(a, ok, e)
                return a + b
            end)
            local _, a, ok, e = coroutine.resume(co, 5)
            local _, sum = coroutine.resume(co, 6)
            return a, ok, e, sum
        "#;
        assert_eq!(
            run_all(src),
            vec![LuaValue::Integer(5), LuaValue::Boolean(false), LuaValue::from("inner"), LuaValue::Integer(11)]
        );
    }

    #[test]
    fn wrap_generators() {
        let src = r#"
            local gen = coroutine.wrap(function() for i = 1, 3 do coroutine.yield(i) end end)
            return gen() + gen() * 10 + gen() * 100
        "#;
        assert_eq!(run_all(src), vec![LuaValue::Integer(321)]);
    }

    #[test]
    fn wrap_propagates_errors() {
        let e = Vm::new()
            .exec("local f = coroutine.wrap(function() error('bad', 0) end) f()", "=co")
            .unwrap_err();
        assert_eq!(e.to_string(), "bad");
    }

    #[test]
    fn upvalues_shared_across_threads() {
        let src = r#"
            local n = 0
            local co = coroutine.wrap(function()
                while true do n = n + 1 coroutine.yield() end
            end)
            co() co()
            n = n + 10
            co()
            return n
        "#;
        assert_eq!(run_all(src), vec![LuaValue::Integer(13)]);
    }

    #[test]
    fn coroutine_locals_captured_by_closures_survive() {
        let src = r#"
            local get
            local co = coroutine.create(function()
                local x = 1
                get = function() return x end
                coroutine.yield()
                x = 2
                coroutine.yield()
            end)
            coroutine.resume(co)
            local a = get()
            coroutine.resume(co)
            local b = get()
            coroutine.resume(co)
            return a, b, get(), coroutine.status(co)
        "#;
        assert_eq!(
            run_all(src),
            vec![LuaValue::Integer(1), LuaValue::Integer(2), LuaValue::Integer(2), LuaValue::from("dead")]
        );
    }

    #[test]
    fn native_bodies_yield_their_arguments() {
        let src = r#"
            local co = coroutine.create(coroutine.yield)
            local _, a = coroutine.resume(co, 'first')
            local _, b = coroutine.resume(co, 'second')
            return a, b, coroutine.status(co)
        "#;
        assert_eq!(
            run_all(src),
            vec![LuaValue::from("first"), LuaValue::from("second"), LuaValue::from("dead")]
        );
    }

    #[test]
    fn coroutines_from_another_session_are_orphans() {
        let mut a = Vm::new();
        let mut b = Vm::new();
        let co = match a.exec("return coroutine.create(function() end)", "=a").unwrap().remove(0) {
            LuaValue::Coroutine(co) => co,
            other => panic!("expected thread, got {other:?}"),
        };
        assert!(matches!(b.resume(&co, vec![]), Err(LuaError::OrphanedCoroutine)));
        drop(a);
        assert!(co.lock().orphaned);
    }

    #[test]
    fn thread_ids_are_unique_across_sessions() {
        let a = Vm::new();
        let b = Vm::new();
        assert_ne!(a.current_id, b.current_id);
    }

    #[test]
    fn open_upvalue_called_from_another_session() {
        let other = Arc::new(Mutex::new(Vm::new()));
        other.lock().exec("local shadow = 'b-main'", "=b").unwrap();
        let mut a = Vm::new();
        let handle = other.clone();
        a.set_global(
            "in_other",
            LuaValue::native("in_other", move |_, args| {
                let f = args.into_iter().next().unwrap_or(LuaValue::Nil);
                handle.lock().call(&f, vec![])
            }),
        );
        // `x` is still open on a's main thread while b runs the getter, and
        // b's main stack holds a different value in the same slot.
        let out = a
            .exec("local x = 'a-main' return in_other(function() return x end)", "=a")
            .unwrap();
        assert_eq!(out, vec![LuaValue::Nil]);

        let getter = a.exec("local y = 'closed' return function() return y end", "=a").unwrap().remove(0);
        assert_eq!(other.lock().call(&getter, vec![]).unwrap(), vec![LuaValue::from("closed")]);
    }
}
