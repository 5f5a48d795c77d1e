use std::any::Any;
use std::fmt;
use std::sync::Arc;

use lua_core::number::{fmt_float, parse_number};
use lua_core::{Constant, LuaStr, Number};
use parking_lot::{Mutex, RwLock};

use crate::closure::{LuaClosure, NativeFunction};
use crate::coroutine::CoroutineRef;
use crate::table::{LuaTable, TableRef};

/// All Lua value types.
#[derive(Clone)]
pub enum LuaValue {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    LuaString(LuaStr),
    /// A host function callable from Lua.
    NativeFunction(Arc<NativeFunction>),
    /// A Lua closure (compiled function + captured upvalues).
    Closure(Arc<LuaClosure>),
    Table(TableRef),
    Coroutine(CoroutineRef),
    UserData(Arc<UserData>),
}

/// An opaque host object with an optional metatable.
pub struct UserData {
    pub data: Mutex<Box<dyn Any + Send>>,
    pub metatable: RwLock<Option<TableRef>>,
}

impl UserData {
    pub fn new(data: impl Any + Send, metatable: Option<TableRef>) -> Self {
        Self {
            data: Mutex::new(Box::new(data)),
            metatable: RwLock::new(metatable),
        }
    }
}

impl LuaValue {
    /// Returns the Lua type name string as per the reference manual.
    pub fn type_name(&self) -> &'static str {
        match self {
            LuaValue::Nil => "nil",
            LuaValue::Boolean(_) => "boolean",
            LuaValue::Integer(_) | LuaValue::Float(_) => "number",
            LuaValue::LuaString(_) => "string",
            LuaValue::NativeFunction(_) | LuaValue::Closure(_) => "function",
            LuaValue::Table(_) => "table",
            LuaValue::Coroutine(_) => "thread",
            LuaValue::UserData(_) => "userdata",
        }
    }

    /// Everything except `nil` and `false` is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, LuaValue::Nil | LuaValue::Boolean(false))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, LuaValue::Nil)
    }

    pub fn is_function(&self) -> bool {
        matches!(self, LuaValue::NativeFunction(_) | LuaValue::Closure(_))
    }

    pub fn new_table() -> Self {
        LuaValue::Table(LuaTable::new_ref())
    }

    pub fn as_table(&self) -> Option<&TableRef> {
        match self {
            LuaValue::Table(t) => Some(t),
            _ => None,
        }
    }

    /// The numeric value without string coercion.
    pub fn as_number(&self) -> Option<Number> {
        match self {
            LuaValue::Integer(i) => Some(Number::Int(*i)),
            LuaValue::Float(f) => Some(Number::Float(*f)),
            _ => None,
        }
    }

    /// Arithmetic view: numbers as-is, numeric strings converted.
    pub fn to_number(&self) -> Option<Number> {
        match self {
            LuaValue::LuaString(s) => s.as_str().and_then(parse_number),
            other => other.as_number(),
        }
    }

    /// Integer view: exact floats and numeric strings convert.
    pub fn to_integer(&self) -> Option<i64> {
        self.to_number().and_then(Number::to_integer)
    }

    /// Concatenation view: strings as-is, numbers formatted.
    pub fn to_lua_str(&self) -> Option<LuaStr> {
        match self {
            LuaValue::LuaString(s) => Some(s.clone()),
            LuaValue::Integer(i) => Some(LuaStr::from(i.to_string())),
            LuaValue::Float(f) => Some(LuaStr::from(fmt_float(*f))),
            _ => None,
        }
    }

    pub fn from_number(n: Number) -> Self {
        match n {
            Number::Int(i) => LuaValue::Integer(i),
            Number::Float(f) => LuaValue::Float(f),
        }
    }

    /// Address used for identity display and reference keys.
    pub fn ref_addr(&self) -> Option<usize> {
        Some(match self {
            LuaValue::NativeFunction(f) => Arc::as_ptr(f) as *const u8 as usize,
            LuaValue::Closure(c) => Arc::as_ptr(c) as *const u8 as usize,
            LuaValue::Table(t) => Arc::as_ptr(t) as *const u8 as usize,
            LuaValue::Coroutine(c) => Arc::as_ptr(c) as *const u8 as usize,
            LuaValue::UserData(u) => Arc::as_ptr(u) as *const u8 as usize,
            _ => return None,
        })
    }

    /// Equality without `__eq`.
    pub fn raw_equals(&self, other: &LuaValue) -> bool {
        match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => return lua_core::number::num_eq(a, b),
            (Some(_), None) | (None, Some(_)) => return false,
            _ => {}
        }
        match (self, other) {
            (LuaValue::Nil, LuaValue::Nil) => true,
            (LuaValue::Boolean(a), LuaValue::Boolean(b)) => a == b,
            (LuaValue::LuaString(a), LuaValue::LuaString(b)) => a == b,
            _ => match (self.ref_addr(), other.ref_addr()) {
                (Some(a), Some(b)) => a == b && self.type_name() == other.type_name(),
                _ => false,
            },
        }
    }
}

impl From<&Constant> for LuaValue {
    fn from(k: &Constant) -> Self {
        match k {
            Constant::Nil => LuaValue::Nil,
            Constant::Boolean(b) => LuaValue::Boolean(*b),
            Constant::Integer(i) => LuaValue::Integer(*i),
            Constant::Float(f) => LuaValue::Float(*f),
            Constant::Str(s) => LuaValue::LuaString(s.clone()),
        }
    }
}

impl From<bool> for LuaValue {
    fn from(b: bool) -> Self {
        LuaValue::Boolean(b)
    }
}

impl From<i64> for LuaValue {
    fn from(i: i64) -> Self {
        LuaValue::Integer(i)
    }
}

impl From<f64> for LuaValue {
    fn from(f: f64) -> Self {
        LuaValue::Float(f)
    }
}

impl From<&str> for LuaValue {
    fn from(s: &str) -> Self {
        LuaValue::LuaString(LuaStr::from(s))
    }
}

impl From<String> for LuaValue {
    fn from(s: String) -> Self {
        LuaValue::LuaString(LuaStr::from(s))
    }
}

impl From<LuaStr> for LuaValue {
    fn from(s: LuaStr) -> Self {
        LuaValue::LuaString(s)
    }
}

impl From<TableRef> for LuaValue {
    fn from(t: TableRef) -> Self {
        LuaValue::Table(t)
    }
}

impl PartialEq for LuaValue {
    fn eq(&self, other: &Self) -> bool {
        self.raw_equals(other)
    }
}

impl fmt::Debug for LuaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LuaValue::Nil => write!(f, "LuaValue::Nil"),
            LuaValue::Boolean(b) => write!(f, "LuaValue::Boolean({b})"),
            LuaValue::Integer(n) => write!(f, "LuaValue::Integer({n})"),
            LuaValue::Float(n) => write!(f, "LuaValue::Float({n})"),
            LuaValue::LuaString(s) => write!(f, "LuaValue::LuaString({s:?})"),
            LuaValue::NativeFunction(n) => write!(f, "LuaValue::NativeFunction({})", n.name),
            LuaValue::Closure(c) => write!(f, "LuaValue::Closure({:p})", Arc::as_ptr(c)),
            LuaValue::Table(t) => write!(f, "LuaValue::Table({:p})", Arc::as_ptr(t)),
            LuaValue::Coroutine(c) => write!(f, "LuaValue::Coroutine({:p})", Arc::as_ptr(c)),
            LuaValue::UserData(u) => write!(f, "LuaValue::UserData({:p})", Arc::as_ptr(u)),
        }
    }
}

/// Raw `tostring` rendering (no `__tostring`).
impl fmt::Display for LuaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LuaValue::Nil => write!(f, "nil"),
            LuaValue::Boolean(b) => write!(f, "{b}"),
            LuaValue::Integer(n) => write!(f, "{n}"),
            LuaValue::Float(n) => f.write_str(&fmt_float(*n)),
            LuaValue::LuaString(s) => write!(f, "{s}"),
            LuaValue::NativeFunction(n) => write!(f, "function: builtin: {:p}", Arc::as_ptr(n)),
            LuaValue::Closure(c) => write!(f, "function: {:p}", Arc::as_ptr(c)),
            LuaValue::Table(t) => write!(f, "table: {:p}", Arc::as_ptr(t)),
            LuaValue::Coroutine(c) => write!(f, "thread: {:p}", Arc::as_ptr(c)),
            LuaValue::UserData(u) => write!(f, "userdata: {:p}", Arc::as_ptr(u)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_and_false_are_falsy() {
        assert!(!LuaValue::Nil.is_truthy());
        assert!(!LuaValue::Boolean(false).is_truthy());
        // In Lua, 0 and "" are truthy
        assert!(LuaValue::Integer(0).is_truthy());
        assert!(LuaValue::from("").is_truthy());
    }

    #[test]
    fn type_names() {
        assert_eq!(LuaValue::Nil.type_name(), "nil");
        assert_eq!(LuaValue::Integer(1).type_name(), "number");
        assert_eq!(LuaValue::Float(1.0).type_name(), "number");
        assert_eq!(LuaValue::from("hi").type_name(), "string");
        assert_eq!(LuaValue::new_table().type_name(), "table");
    }

    #[test]
    fn mixed_number_equality_is_exact() {
        assert_eq!(LuaValue::Integer(1), LuaValue::Float(1.0));
        assert_ne!(LuaValue::Integer(i64::MAX), LuaValue::Float(i64::MAX as f64));
        assert_ne!(LuaValue::Integer(1), LuaValue::from("1"));
    }

    #[test]
    fn table_reference_equality() {
        let t1 = LuaValue::new_table();
        let t2 = LuaValue::new_table();
        assert_eq!(t1, t1.clone());
        assert_ne!(t1, t2);
    }

    #[test]
    fn coercions() {
        assert_eq!(LuaValue::from(" 0x10 ").to_integer(), Some(16));
        assert_eq!(LuaValue::Float(3.0).to_integer(), Some(3));
        assert_eq!(LuaValue::Float(3.5).to_integer(), None);
        assert_eq!(LuaValue::Float(2.0).to_lua_str(), Some(LuaStr::from("2.0")));
        assert!(LuaValue::Nil.to_lua_str().is_none());
    }

    #[test]
    fn display_floats_keep_their_subtype() {
        assert_eq!(LuaValue::Float(1.0).to_string(), "1.0");
        assert_eq!(LuaValue::Float(0.1).to_string(), "0.1");
        assert_eq!(LuaValue::Float(1e100).to_string(), "1e+100");
        assert_eq!(LuaValue::Integer(-3).to_string(), "-3");
    }
}
