//! Standard library: base functions plus the `string`, `table`, `math`,
//! `io`, `os` and `coroutine` tables.

mod base;
mod coroutine;
mod io;
mod math;
mod os;
mod pattern;
mod string;
mod table;

use std::sync::Arc;

use lua_core::{LuaStr, Number};

use crate::closure::{NativeFunction, NativeKind};
use crate::error::LuaError;
use crate::table::{LuaTable, TableRef};
use crate::value::LuaValue;
use crate::vm::Vm;

pub(crate) type LibResult = Result<Vec<LuaValue>, LuaError>;
pub(crate) type LibFn = fn(&mut Vm, Args) -> LibResult;

/// Install every library into the session's globals.
pub fn open_libs(vm: &mut Vm) {
    base::open(vm);
    string::open(vm);
    table::open(vm);
    math::open(vm);
    io::open(vm);
    os::open(vm);
    coroutine::open(vm);
}

/// Build a library table from `(name, function)` pairs and publish it as a
/// global.
pub(crate) fn new_lib(vm: &mut Vm, name: &str, funcs: &[(&'static str, LibFn)]) -> TableRef {
    let lib = LuaTable::new_ref();
    {
        let mut t = lib.write();
        for &(fname, f) in funcs {
            t.set_str(fname, native(fname, f));
        }
    }
    vm.set_global(name, LuaValue::Table(lib.clone()));
    lib
}

/// Wrap a library function so it receives its arguments as [`Args`].
pub(crate) fn native(name: &'static str, f: LibFn) -> LuaValue {
    LuaValue::native(name, move |vm, vals| f(vm, Args::new(name, vals)))
}

/// Like [`native`], tagged so the interpreter loop can dispatch it specially.
/// `f` still serves calls made from host code.
pub(crate) fn native_with_kind(name: &'static str, f: LibFn, kind: NativeKind) -> LuaValue {
    let func = NativeFunction::new(name, move |vm, vals| f(vm, Args::new(name, vals)));
    LuaValue::NativeFunction(Arc::new(func.with_kind(kind)))
}

// ── Argument checking ─────────────────────────────────────────────────────────

/// Arguments of a library call, with the function name for messages.
pub(crate) struct Args {
    name: &'static str,
    vals: Vec<LuaValue>,
}

impl Args {
    pub(crate) fn new(name: &'static str, vals: Vec<LuaValue>) -> Self {
        Self { name, vals }
    }

    pub(crate) fn len(&self) -> usize {
        self.vals.len()
    }

    /// Argument `i` (0-based), nil when absent.
    pub(crate) fn get(&self, i: usize) -> LuaValue {
        self.vals.get(i).cloned().unwrap_or(LuaValue::Nil)
    }

    pub(crate) fn is_none_or_nil(&self, i: usize) -> bool {
        self.vals.get(i).map_or(true, LuaValue::is_nil)
    }

    pub(crate) fn rest(&self, from: usize) -> Vec<LuaValue> {
        self.vals.get(from..).map(<[LuaValue]>::to_vec).unwrap_or_default()
    }

    pub(crate) fn into_vec(self) -> Vec<LuaValue> {
        self.vals
    }

    /// `bad argument #n to 'name' (msg)`
    pub(crate) fn error(&self, vm: &Vm, i: usize, msg: impl AsRef<str>) -> LuaError {
        vm.runtime_error(format!("bad argument #{} to '{}' ({})", i + 1, self.name, msg.as_ref()))
    }

    pub(crate) fn type_error(&self, vm: &Vm, i: usize, expected: &str) -> LuaError {
        let got = match self.vals.get(i) {
            Some(v) => v.type_name(),
            None => "no value",
        };
        self.error(vm, i, format!("{expected} expected, got {got}"))
    }

    pub(crate) fn any(&self, vm: &Vm, i: usize) -> Result<LuaValue, LuaError> {
        match self.vals.get(i) {
            Some(v) => Ok(v.clone()),
            None => Err(self.error(vm, i, "value expected")),
        }
    }

    pub(crate) fn table(&self, vm: &Vm, i: usize) -> Result<TableRef, LuaError> {
        match self.vals.get(i) {
            Some(LuaValue::Table(t)) => Ok(t.clone()),
            _ => Err(self.type_error(vm, i, "table")),
        }
    }

    pub(crate) fn function(&self, vm: &Vm, i: usize) -> Result<LuaValue, LuaError> {
        match self.vals.get(i) {
            Some(f) if f.is_function() => Ok(f.clone()),
            _ => Err(self.type_error(vm, i, "function")),
        }
    }

    pub(crate) fn number(&self, vm: &Vm, i: usize) -> Result<Number, LuaError> {
        self.vals
            .get(i)
            .and_then(LuaValue::to_number)
            .ok_or_else(|| self.type_error(vm, i, "number"))
    }

    pub(crate) fn float(&self, vm: &Vm, i: usize) -> Result<f64, LuaError> {
        Ok(self.number(vm, i)?.to_f64())
    }

    pub(crate) fn int(&self, vm: &Vm, i: usize) -> Result<i64, LuaError> {
        let n = self.number(vm, i)?;
        n.to_integer()
            .ok_or_else(|| self.error(vm, i, "number has no integer representation"))
    }

    pub(crate) fn opt_int(&self, vm: &Vm, i: usize, default: i64) -> Result<i64, LuaError> {
        if self.is_none_or_nil(i) {
            Ok(default)
        } else {
            self.int(vm, i)
        }
    }

    /// String argument; numbers are converted.
    pub(crate) fn string(&self, vm: &Vm, i: usize) -> Result<LuaStr, LuaError> {
        self.vals
            .get(i)
            .and_then(LuaValue::to_lua_str)
            .ok_or_else(|| self.type_error(vm, i, "string"))
    }

    pub(crate) fn opt_string(&self, vm: &Vm, i: usize) -> Result<Option<LuaStr>, LuaError> {
        if self.is_none_or_nil(i) {
            Ok(None)
        } else {
            self.string(vm, i).map(Some)
        }
    }
}

/// Convert a relative string position: negatives count from the end.
pub(crate) fn str_index(pos: i64, len: usize) -> i64 {
    if pos >= 0 {
        pos
    } else if pos.unsigned_abs() > len as u64 {
        0
    } else {
        len as i64 + pos + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_positions() {
        assert_eq!(str_index(3, 5), 3);
        assert_eq!(str_index(-1, 5), 5);
        assert_eq!(str_index(-5, 5), 1);
        assert_eq!(str_index(-9, 5), 0);
    }

    #[test]
    fn argument_errors_name_the_function() {
        let mut vm = Vm::new();
        let e = vm.exec("table.insert(nil, 1)", "=args").unwrap_err();
        assert_eq!(e.to_string(), "args:1: bad argument #1 to 'insert' (table expected, got nil)");
        let e = vm.exec("return ('x'):rep()", "=args").unwrap_err();
        assert_eq!(e.to_string(), "args:1: bad argument #2 to 'rep' (number expected, got no value)");
        let e = vm.exec("return math.floor({})", "=args").unwrap_err();
        assert_eq!(e.to_string(), "args:1: bad argument #1 to 'floor' (number expected, got table)");
    }
}
