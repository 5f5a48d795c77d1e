use std::io::Read;

use lua_compiler::is_binary_chunk;
use lua_core::number::parse_number;
use lua_core::LuaStr;
use tracing::debug;

use super::{native, native_with_kind, Args, LibResult};
use crate::closure::NativeKind;
use crate::error::LuaError;
use crate::value::LuaValue;
use crate::vm::{first, Vm};

pub(crate) fn open(vm: &mut Vm) {
    let funcs: &[(&'static str, super::LibFn)] = &[
        ("assert", assert),
        ("collectgarbage", collectgarbage),
        ("dofile", dofile),
        ("error", error),
        ("getfenv", getfenv),
        ("getmetatable", getmetatable),
        ("ipairs", ipairs),
        ("load", load),
        ("loadfile", loadfile),
        ("loadstring", loadstring),
        ("next", next),
        ("pairs", pairs),
        ("print", print),
        ("rawequal", rawequal),
        ("rawget", rawget),
        ("rawlen", rawlen),
        ("rawset", rawset),
        ("select", select),
        ("setfenv", setfenv),
        ("setmetatable", setmetatable),
        ("tonumber", tonumber),
        ("tostring", tostring),
        ("type", type_),
        ("unpack", super::table::unpack),
    ];
    for &(name, f) in funcs {
        vm.set_global(name, native(name, f));
    }
    vm.set_global("pcall", native_with_kind("pcall", pcall, NativeKind::PCall));
    vm.set_global("xpcall", native_with_kind("xpcall", xpcall, NativeKind::XPCall));
    let globals = vm.globals();
    vm.set_global("_G", LuaValue::Table(globals));
    vm.set_global("_VERSION", LuaValue::from("Lua 5.3"));
}

// ── Output and conversion ─────────────────────────────────────────────────────

fn print(vm: &mut Vm, args: Args) -> LibResult {
    let mut line = Vec::new();
    for (i, v) in args.into_vec().iter().enumerate() {
        if i > 0 {
            line.push(b'\t');
        }
        line.extend_from_slice(vm.tostring(v)?.as_bytes());
    }
    line.push(b'\n');
    let out = vm.output();
    out.write_all(&line)
        .and_then(|_| out.flush())
        .map_err(|e| LuaError::runtime(e.to_string()))?;
    Ok(vec![])
}

fn tostring(vm: &mut Vm, args: Args) -> LibResult {
    let v = args.any(vm, 0)?;
    Ok(vec![LuaValue::LuaString(vm.tostring(&v)?)])
}

fn type_(vm: &mut Vm, args: Args) -> LibResult {
    let v = args.any(vm, 0)?;
    Ok(vec![LuaValue::from(v.type_name())])
}

fn tonumber(vm: &mut Vm, args: Args) -> LibResult {
    if args.is_none_or_nil(1) {
        let v = args.any(vm, 0)?;
        let n = match &v {
            LuaValue::Integer(_) | LuaValue::Float(_) => v.clone(),
            LuaValue::LuaString(s) => s.as_str().and_then(parse_number).map_or(LuaValue::Nil, LuaValue::from_number),
            _ => LuaValue::Nil,
        };
        return Ok(vec![n]);
    }
    let base = args.int(vm, 1)?;
    if !(2..=36).contains(&base) {
        return Err(args.error(vm, 1, "base out of range"));
    }
    let s = match args.get(0) {
        LuaValue::LuaString(s) => s,
        _ => return Err(args.type_error(vm, 0, "string")),
    };
    Ok(vec![parse_int_base(s.as_bytes(), base as u32).map_or(LuaValue::Nil, LuaValue::Integer)])
}

fn parse_int_base(text: &[u8], base: u32) -> Option<i64> {
    let s = std::str::from_utf8(text).ok()?.trim_matches(|c: char| c.is_ascii_whitespace());
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if digits.is_empty() {
        return None;
    }
    let mut acc: i64 = 0;
    for c in digits.chars() {
        let d = c.to_digit(base)?;
        acc = acc.wrapping_mul(base as i64).wrapping_add(d as i64);
    }
    Some(if neg { acc.wrapping_neg() } else { acc })
}

// ── Errors and protected calls ────────────────────────────────────────────────

fn assert(vm: &mut Vm, args: Args) -> LibResult {
    let v = args.any(vm, 0)?;
    if v.is_truthy() {
        return Ok(args.into_vec());
    }
    if args.is_none_or_nil(1) {
        return Err(vm.runtime_error("assertion failed!"));
    }
    Err(LuaError::Runtime(args.get(1)))
}

fn error(vm: &mut Vm, args: Args) -> LibResult {
    let v = args.get(0);
    let level = args.opt_int(vm, 1, 1)?;
    if let (LuaValue::LuaString(s), true) = (&v, level > 0) {
        let prefix = vm.where_prefix(level as usize);
        return Err(LuaError::Runtime(LuaValue::from(format!("{prefix}{s}"))));
    }
    Err(LuaError::Runtime(v))
}

fn pcall(vm: &mut Vm, args: Args) -> LibResult {
    let f = args.any(vm, 0)?;
    let depth = vm.call_depth();
    match vm.call_value(f, args.rest(1)) {
        Ok(mut vals) => {
            vals.insert(0, LuaValue::Boolean(true));
            Ok(vals)
        }
        Err(e) if !e.is_catchable() => Err(e),
        Err(e) => {
            vm.unwind_to(depth);
            debug!(target: "lua::vm", depth, error = %e, "pcall caught error");
            Ok(vec![LuaValue::Boolean(false), e.to_value()])
        }
    }
}

fn xpcall(vm: &mut Vm, args: Args) -> LibResult {
    let f = args.any(vm, 0)?;
    let handler = args.function(vm, 1)?;
    let depth = vm.call_depth();
    match vm.call_value(f, args.rest(2)) {
        Ok(mut vals) => {
            vals.insert(0, LuaValue::Boolean(true));
            Ok(vals)
        }
        Err(e) if !e.is_catchable() => Err(e),
        Err(e) => {
            // The handler sees the stack as it was at the error.
            let handled = match vm.call_value(handler, vec![e.to_value()]) {
                Ok(vals) => first(vals),
                Err(he) if !he.is_catchable() => return Err(he),
                Err(he) => he.to_value(),
            };
            vm.unwind_to(depth);
            Ok(vec![LuaValue::Boolean(false), handled])
        }
    }
}

// ── Tables and metatables ─────────────────────────────────────────────────────

fn getmetatable(vm: &mut Vm, args: Args) -> LibResult {
    let v = args.any(vm, 0)?;
    let Some(mt) = vm.metatable_of(&v) else {
        return Ok(vec![LuaValue::Nil]);
    };
    let protected = mt.read().get_str("__metatable");
    if !protected.is_nil() {
        return Ok(vec![protected]);
    }
    Ok(vec![LuaValue::Table(mt)])
}

fn setmetatable(vm: &mut Vm, args: Args) -> LibResult {
    let t = args.table(vm, 0)?;
    let mt = match args.get(1) {
        LuaValue::Nil => None,
        LuaValue::Table(mt) => Some(mt),
        _ => return Err(args.type_error(vm, 1, "nil or table")),
    };
    if let Some(current) = t.read().metatable() {
        if !current.read().get_str("__metatable").is_nil() {
            return Err(vm.runtime_error("cannot change a protected metatable"));
        }
    }
    t.write().set_metatable(mt);
    Ok(vec![LuaValue::Table(t)])
}

fn rawequal(vm: &mut Vm, args: Args) -> LibResult {
    let a = args.any(vm, 0)?;
    let b = args.any(vm, 1)?;
    Ok(vec![LuaValue::Boolean(a.raw_equals(&b))])
}

fn rawget(vm: &mut Vm, args: Args) -> LibResult {
    let t = args.table(vm, 0)?;
    let k = args.any(vm, 1)?;
    let v = t.read().get(&k);
    Ok(vec![v])
}

fn rawset(vm: &mut Vm, args: Args) -> LibResult {
    let t = args.table(vm, 0)?;
    let k = args.any(vm, 1)?;
    let v = args.any(vm, 2)?;
    let result = t.write().set(k, v);
    result.map_err(|e| vm.with_position(e))?;
    Ok(vec![LuaValue::Table(t)])
}

fn rawlen(vm: &mut Vm, args: Args) -> LibResult {
    match args.get(0) {
        LuaValue::Table(t) => Ok(vec![LuaValue::Integer(t.read().length())]),
        LuaValue::LuaString(s) => Ok(vec![LuaValue::Integer(s.len() as i64)]),
        _ => Err(args.error(vm, 0, "table or string expected")),
    }
}

fn next(vm: &mut Vm, args: Args) -> LibResult {
    let t = args.table(vm, 0)?;
    let k = args.get(1);
    let entry = t.read().next(&k);
    match entry.map_err(|e| vm.with_position(e))? {
        Some((k, v)) => Ok(vec![k, v]),
        None => Ok(vec![LuaValue::Nil]),
    }
}

fn pairs(vm: &mut Vm, args: Args) -> LibResult {
    let v = args.any(vm, 0)?;
    let mm = vm.metamethod_of(&v, "__pairs");
    if !mm.is_nil() {
        let mut vals = vm.call_value(mm, vec![v])?;
        vals.resize(3, LuaValue::Nil);
        return Ok(vals);
    }
    if !matches!(v, LuaValue::Table(_)) {
        return Err(args.type_error(vm, 0, "table"));
    }
    Ok(vec![native("next", next), v, LuaValue::Nil])
}

fn ipairs(vm: &mut Vm, args: Args) -> LibResult {
    let v = args.any(vm, 0)?;
    Ok(vec![native("ipairs_iter", ipairs_iter), v, LuaValue::Integer(0)])
}

fn ipairs_iter(vm: &mut Vm, args: Args) -> LibResult {
    let i = args.int(vm, 1)?.wrapping_add(1);
    let v = vm.index_value(&args.get(0), LuaValue::Integer(i))?;
    if v.is_nil() {
        return Ok(vec![LuaValue::Nil]);
    }
    Ok(vec![LuaValue::Integer(i), v])
}

fn select(vm: &mut Vm, args: Args) -> LibResult {
    let n = args.len() as i64 - 1;
    if let LuaValue::LuaString(s) = args.get(0) {
        if s.as_bytes() == b"#" {
            return Ok(vec![LuaValue::Integer(n)]);
        }
    }
    let i = args.int(vm, 0)?;
    let start = if i < 0 {
        if i.unsigned_abs() > n as u64 {
            return Err(args.error(vm, 0, "index out of range"));
        }
        n + i
    } else if i == 0 {
        return Err(args.error(vm, 0, "index out of range"));
    } else {
        (i - 1).min(n)
    };
    Ok(args.rest(start as usize + 1))
}

fn collectgarbage(vm: &mut Vm, args: Args) -> LibResult {
    let opt = args.opt_string(vm, 0)?;
    let opt = opt.as_ref().map_or("collect".into(), |s| s.to_str_lossy());
    match &*opt {
        "collect" | "step" | "incremental" | "generational" => Ok(vec![LuaValue::Integer(0)]),
        "count" => Ok(vec![LuaValue::Float(0.0), LuaValue::Integer(0)]),
        "isrunning" => Ok(vec![LuaValue::Boolean(true)]),
        "stop" | "restart" | "setpause" | "setstepmul" => Ok(vec![LuaValue::Integer(0)]),
        other => Err(args.error(vm, 0, format!("invalid option '{other}'"))),
    }
}

// ── Environments ──────────────────────────────────────────────────────────────

fn getfenv(vm: &mut Vm, args: Args) -> LibResult {
    let target = args.get(0);
    let env = match target {
        LuaValue::Closure(c) => c.env(),
        LuaValue::NativeFunction(_) => vm.globals(),
        _ => {
            let level = args.opt_int(vm, 0, 1)?;
            if level < 0 {
                return Err(args.error(vm, 0, "level must be non-negative"));
            }
            if level == 0 {
                vm.globals()
            } else {
                match vm.frame_closure(level as usize) {
                    Some(c) => c.env(),
                    None => return Err(args.error(vm, 0, "invalid level")),
                }
            }
        }
    };
    Ok(vec![LuaValue::Table(env)])
}

fn setfenv(vm: &mut Vm, args: Args) -> LibResult {
    let env = args.table(vm, 1)?;
    let target = args.get(0);
    let closure = match &target {
        LuaValue::Closure(c) => c.clone(),
        LuaValue::NativeFunction(_) => {
            return Err(vm.runtime_error("'setfenv' cannot change environment of given object"))
        }
        _ => {
            let level = args.int(vm, 0)?;
            if level == 0 {
                vm.set_globals(env);
                return Ok(vec![]);
            }
            if level < 0 {
                return Err(args.error(vm, 0, "level must be non-negative"));
            }
            match vm.frame_closure(level as usize) {
                Some(c) => c,
                None => return Err(args.error(vm, 0, "invalid level")),
            }
        }
    };
    *closure.env.write() = env;
    Ok(vec![LuaValue::Closure(closure)])
}

// ── Loading code ──────────────────────────────────────────────────────────────

/// Load `chunk` honouring a `mode` string; load failures become `nil, msg`.
fn load_chunk(vm: &mut Vm, chunk: &[u8], name: &str, mode: &str, env: Option<LuaValue>) -> LibResult {
    let binary = is_binary_chunk(chunk);
    if binary && !mode.contains('b') {
        let msg = format!("attempt to load a binary chunk (mode is '{mode}')");
        return Ok(vec![LuaValue::Nil, LuaValue::from(msg)]);
    }
    if !binary && !mode.contains('t') {
        let msg = format!("attempt to load a text chunk (mode is '{mode}')");
        return Ok(vec![LuaValue::Nil, LuaValue::from(msg)]);
    }
    let env = match env {
        Some(LuaValue::Table(t)) => Some(t),
        _ => None,
    };
    match vm.load(chunk, name, env) {
        Ok(f) => Ok(vec![f]),
        Err(LuaError::Load(e)) => Ok(vec![LuaValue::Nil, LuaValue::from(e.to_string())]),
        Err(e) => Err(e),
    }
}

fn load(vm: &mut Vm, args: Args) -> LibResult {
    let (chunk, default_name) = match args.get(0) {
        LuaValue::LuaString(s) => (s.as_bytes().to_vec(), String::from_utf8_lossy(s.as_bytes()).into_owned()),
        f if f.is_function() => {
            let mut buf = Vec::new();
            loop {
                let piece = first(vm.call_value(f.clone(), vec![])?);
                match piece {
                    LuaValue::Nil => break,
                    LuaValue::LuaString(s) if s.is_empty() => break,
                    LuaValue::LuaString(s) => buf.extend_from_slice(s.as_bytes()),
                    _ => {
                        return Ok(vec![LuaValue::Nil, LuaValue::from("reader function must return a string")]);
                    }
                }
            }
            (buf, "=(load)".to_string())
        }
        _ => return Err(args.type_error(vm, 0, "string")),
    };
    let name = args.opt_string(vm, 1)?.map_or(default_name, |s| s.to_str_lossy().into_owned());
    let mode = args.opt_string(vm, 2)?.map_or("bt".to_string(), |s| s.to_str_lossy().into_owned());
    let env = (args.len() > 3).then(|| args.get(3));
    load_chunk(vm, &chunk, &name, &mode, env)
}

fn loadstring(vm: &mut Vm, args: Args) -> LibResult {
    let chunk = args.string(vm, 0)?;
    let name = args
        .opt_string(vm, 1)?
        .map_or_else(|| chunk.to_str_lossy().into_owned(), |s| s.to_str_lossy().into_owned());
    load_chunk(vm, chunk.as_bytes(), &name, "bt", None)
}

/// Read a script file, or stdin when `path` is `None`.
fn read_source(path: Option<&LuaStr>) -> Result<(Vec<u8>, String), String> {
    match path {
        Some(p) => {
            let p = p.to_str_lossy();
            std::fs::read(&*p)
                .map(|bytes| (bytes, format!("@{p}")))
                .map_err(|e| format!("cannot open {p}: {}", super::io::describe_io_error(&e)))
        }
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .map(|_| (buf, "=stdin".to_string()))
                .map_err(|e| format!("cannot read stdin: {e}"))
        }
    }
}

fn loadfile(vm: &mut Vm, args: Args) -> LibResult {
    let path = args.opt_string(vm, 0)?;
    let mode = args.opt_string(vm, 1)?.map_or("bt".to_string(), |s| s.to_str_lossy().into_owned());
    let env = (args.len() > 2).then(|| args.get(2));
    match read_source(path.as_ref()) {
        Ok((chunk, name)) => load_chunk(vm, &chunk, &name, &mode, env),
        Err(msg) => Ok(vec![LuaValue::Nil, LuaValue::from(msg)]),
    }
}

fn dofile(vm: &mut Vm, args: Args) -> LibResult {
    let path = args.opt_string(vm, 0)?;
    let (chunk, name) = read_source(path.as_ref()).map_err(|msg| vm.runtime_error(msg))?;
    let f = vm.load(&chunk, &name, None)?;
    vm.call_value(f, vec![])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    use parking_lot::Mutex;

    fn run_all(src: &str) -> Vec<LuaValue> {
        Vm::new().exec(src, "=base").unwrap()
    }

    fn run(src: &str) -> LuaValue {
        first(run_all(src))
    }

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn print_goes_to_the_session_sink() {
        let sink = Sink::default();
        let mut vm = Vm::new();
        vm.set_output(sink.clone());
        vm.exec("print(1, 'two', nil, 2.5, setmetatable({}, {__tostring = function() return 'T' end}))", "=p")
            .unwrap();
        assert_eq!(&*sink.0.lock(), b"1\ttwo\tnil\t2.5\tT\n");
    }

    #[test]
    fn tonumber_variants() {
        assert_eq!(run("return tonumber('0x1F')"), LuaValue::Integer(31));
        assert_eq!(run("return tonumber(' 12 ')"), LuaValue::Integer(12));
        assert_eq!(run("return tonumber('1e2')"), LuaValue::Float(100.0));
        assert_eq!(run("return tonumber('ff', 16)"), LuaValue::Integer(255));
        assert_eq!(run("return tonumber('zz', 36)"), LuaValue::Integer(1295));
        assert_eq!(run("return tonumber('8', 8)"), LuaValue::Nil);
        assert_eq!(run("return tonumber('abc')"), LuaValue::Nil);
        assert_eq!(run("return tonumber({})"), LuaValue::Nil);
    }

    #[test]
    fn tostring_and_type() {
        assert_eq!(run("return tostring(10)"), LuaValue::from("10"));
        assert_eq!(run("return tostring(1e15)"), LuaValue::from("1e+15"));
        assert_eq!(run("return tostring(-0.0)"), LuaValue::from("-0.0"));
        assert_eq!(run("return type(print)"), LuaValue::from("function"));
        assert_eq!(run("return type(coroutine.create(print))"), LuaValue::from("thread"));
    }

    #[test]
    fn error_levels() {
        let mut vm = Vm::new();
        let e = vm.exec("error('plain', 0)", "=lv").unwrap_err();
        assert_eq!(e.to_string(), "plain");
        let e = vm
            .exec("local function check(x)\n  if not x then error('bad input', 2) end\nend\ncheck(false)", "=lv")
            .unwrap_err();
        assert_eq!(e.to_string(), "lv:4: bad input");
        let e = vm.exec("error({code = 1})", "=lv").unwrap_err();
        assert!(matches!(e, LuaError::Runtime(LuaValue::Table(_))));
    }

    #[test]
    fn pcall_returns_status_and_values() {
        assert_eq!(
            run_all("return pcall(function(a) return a * 2, 'ok' end, 21)"),
            vec![LuaValue::Boolean(true), LuaValue::Integer(42), LuaValue::from("ok")]
        );
        assert_eq!(
            run_all("return pcall(error, {})")[0],
            LuaValue::Boolean(false)
        );
        assert_eq!(
            run_all("return pcall(error, 'msg', 0)"),
            vec![LuaValue::Boolean(false), LuaValue::from("msg")]
        );
    }

    #[test]
    fn pcall_catches_stack_overflow() {
        let out = run_all("local function f() return 1 + f() end return pcall(f)");
        assert_eq!(out[0], LuaValue::Boolean(false));
        assert!(out[1].to_string().contains("stack overflow"));
    }

    #[test]
    fn xpcall_handler_sees_the_error() {
        let src = r#"
            local function handler(e) return 'handled: ' .. e end
            return xpcall(function() error('boom', 0) end, handler)
        "#;
        assert_eq!(run_all(src), vec![LuaValue::Boolean(false), LuaValue::from("handled: boom")]);
        let src = "return xpcall(function() error('x') end, function() error('again', 0) end)";
        assert_eq!(run_all(src), vec![LuaValue::Boolean(false), LuaValue::from("again")]);
    }

    #[test]
    fn select_and_varargs() {
        assert_eq!(run("return select('#', 1, 2, 3)"), LuaValue::Integer(3));
        assert_eq!(run_all("return select(2, 'a', 'b', 'c')"), vec![LuaValue::from("b"), LuaValue::from("c")]);
        assert_eq!(run("return select(-1, 'a', 'b', 'c')"), LuaValue::from("c"));
        let e = Vm::new().exec("select(0)", "=sel").unwrap_err();
        assert!(e.to_string().contains("bad argument #1 to 'select' (index out of range)"));
        for src in ["select(math.mininteger, 1)", "select(-3, 1, 2)"] {
            let e = Vm::new().exec(src, "=sel").unwrap_err();
            assert!(e.to_string().contains("bad argument #1 to 'select' (index out of range)"), "{src}");
        }
        assert_eq!(run("return select(-2, 'a', 'b')"), LuaValue::from("a"));
        assert_eq!(run_all("return select(math.maxinteger, 'a')"), vec![]);
    }

    #[test]
    fn pairs_visits_every_key_once() {
        let src = r#"
            local t = {10, 20, 30, x = 1, y = 2, [2.5] = 3}
            local n, sum = 0, 0
            for k, v in pairs(t) do n = n + 1 sum = sum + v end
            return n, sum
        "#;
        assert_eq!(run_all(src), vec![LuaValue::Integer(6), LuaValue::Integer(66)]);
    }

    #[test]
    fn ipairs_stops_at_first_nil() {
        let src = "local s = 0 for i, v in ipairs({1, 2, nil, 4}) do s = s + v end return s";
        assert_eq!(run(src), LuaValue::Integer(3));
    }

    #[test]
    fn pairs_metamethod() {
        let src = r#"
            local t = setmetatable({}, {__pairs = function(t) return function(_, k) if not k then return 1, 'one' end end, t, nil end})
            local out
            for k, v in pairs(t) do out = v end
            return out
        "#;
        assert_eq!(run(src), LuaValue::from("one"));
    }

    #[test]
    fn protected_metatables() {
        let src = "local t = setmetatable({}, {__metatable = 'locked'}) return getmetatable(t)";
        assert_eq!(run(src), LuaValue::from("locked"));
        let e = Vm::new()
            .exec("local t = setmetatable({}, {__metatable = 1}) setmetatable(t, {})", "=mt")
            .unwrap_err();
        assert!(e.to_string().contains("cannot change a protected metatable"));
        assert_eq!(run("return getmetatable('').__index == string"), LuaValue::Boolean(true));
    }

    #[test]
    fn raw_access_bypasses_metamethods() {
        let src = r#"
            local t = setmetatable({}, {__index = function() return 'meta' end, __newindex = function() end})
            rawset(t, 'k', 'raw')
            return t.k, rawget(t, 'missing'), t.missing, rawlen({1, 2}), rawequal(t, t)
        "#;
        assert_eq!(
            run_all(src),
            vec![
                LuaValue::from("raw"),
                LuaValue::Nil,
                LuaValue::from("meta"),
                LuaValue::Integer(2),
                LuaValue::Boolean(true),
            ]
        );
    }

    #[test]
    fn load_strings_and_readers() {
        assert_eq!(run("return load('return 1 + 1')()"), LuaValue::Integer(2));
        let src = r#"
            local parts = {'return ', '40 ', '+ 2'}
            local i = 0
            return load(function() i = i + 1 return parts[i] end)()
        "#;
        assert_eq!(run(src), LuaValue::Integer(42));
        let out = run_all("return load('return +')");
        assert_eq!(out[0], LuaValue::Nil);
        assert!(out[1].to_string().contains("unexpected symbol"));
        assert_eq!(run("local env = {x = 5} return load('return x', 'c', 't', env)()"), LuaValue::Integer(5));
        assert_eq!(run("return loadstring('return ...')(7)"), LuaValue::Integer(7));
    }

    #[test]
    fn load_respects_mode() {
        let out = run_all("return load(string.dump(function() return 1 end), 'b', 't')");
        assert_eq!(out[0], LuaValue::Nil);
        assert!(out[1].to_string().contains("attempt to load a binary chunk"));
        assert_eq!(run("return load(string.dump(function() return 9 end))()"), LuaValue::Integer(9));
    }

    #[test]
    fn loadfile_and_dofile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mod.lua");
        std::fs::write(&path, "local a = ... return (a or 0) + 1").unwrap();
        let mut vm = Vm::new();
        vm.set_global("path", LuaValue::from(path.to_string_lossy().into_owned()));
        assert_eq!(vm.exec("return loadfile(path)(41)", "=lf").unwrap(), vec![LuaValue::Integer(42)]);
        assert_eq!(vm.exec("return dofile(path)", "=lf").unwrap(), vec![LuaValue::Integer(1)]);
        let out = vm.exec("return loadfile(path .. '.missing')", "=lf").unwrap();
        assert_eq!(out[0], LuaValue::Nil);
        assert!(out[1].to_string().starts_with("cannot open"));
    }

    #[test]
    fn function_environments() {
        let src = r#"
            local function f() return x end
            setfenv(f, {x = 'sandboxed'})
            x = 'global'
            return f(), x, getfenv(f).x, getfenv(0) == _G
        "#;
        assert_eq!(
            run_all(src),
            vec![
                LuaValue::from("sandboxed"),
                LuaValue::from("global"),
                LuaValue::from("sandboxed"),
                LuaValue::Boolean(true),
            ]
        );
    }

    #[test]
    fn version_and_globals() {
        assert_eq!(run("return _VERSION"), LuaValue::from("Lua 5.3"));
        assert_eq!(run("return _G._G == _G"), LuaValue::Boolean(true));
        assert_eq!(run("return collectgarbage('count') >= 0"), LuaValue::Boolean(true));
    }
}
