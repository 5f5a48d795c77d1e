//! Expression descriptors: the compiler's view of a partially generated
//! expression.

use lua_core::{LuaStr, Number, Rk};

/// Pending jump instructions that all share one eventual target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JumpList(Vec<usize>);

impl JumpList {
    pub fn new() -> Self {
        JumpList(Vec::new())
    }

    pub fn single(pc: usize) -> Self {
        JumpList(vec![pc])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, pc: usize) {
        self.0.push(pc);
    }

    /// Move every jump of `other` into this list.
    pub fn append(&mut self, mut other: JumpList) {
        self.0.append(&mut other.0);
    }

    pub fn take(&mut self) -> JumpList {
        std::mem::take(self)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExpKind {
    /// No value (empty expression list).
    Void,
    Nil,
    True,
    False,
    KInt(i64),
    KFlt(f64),
    KStr(LuaStr),
    /// Already in the constant pool.
    Const(u32),
    /// Value sits in a fixed register.
    NonReloc(u8),
    Local(u8),
    Upval(u8),
    /// Global variable, by name constant.
    Global(u32),
    Indexed { table: u8, key: Rk },
    /// Result of a comparison; the pc is its jump.
    Jump(usize),
    /// Instruction at pc can put its result in any register.
    Reloc(usize),
    Call(usize),
    VarArg(usize),
}

/// An expression under construction, with its true/false exit lists.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpDesc {
    pub kind: ExpKind,
    /// Jumps taken when the expression is true.
    pub t: JumpList,
    /// Jumps taken when it is false.
    pub f: JumpList,
}

impl ExpDesc {
    pub fn new(kind: ExpKind) -> Self {
        Self {
            kind,
            t: JumpList::new(),
            f: JumpList::new(),
        }
    }

    pub fn void() -> Self {
        Self::new(ExpKind::Void)
    }

    pub fn has_jumps(&self) -> bool {
        !self.t.is_empty() || !self.f.is_empty()
    }

    /// Calls and `...` can produce any number of values.
    pub fn has_multret(&self) -> bool {
        matches!(self.kind, ExpKind::Call(_) | ExpKind::VarArg(_))
    }

    /// Numeric literal without pending jumps, for constant folding.
    pub fn numeral(&self) -> Option<Number> {
        if self.has_jumps() {
            return None;
        }
        match self.kind {
            ExpKind::KInt(i) => Some(Number::Int(i)),
            ExpKind::KFlt(f) => Some(Number::Float(f)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numerals_with_jumps_do_not_fold() {
        let mut e = ExpDesc::new(ExpKind::KInt(3));
        assert_eq!(e.numeral(), Some(Number::Int(3)));
        e.t.push(4);
        assert_eq!(e.numeral(), None);
    }

    #[test]
    fn jump_lists_merge() {
        let mut a = JumpList::single(1);
        a.append(JumpList::single(5));
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![1, 5]);
        let b = a.take();
        assert!(a.is_empty());
        assert!(!b.is_empty());
    }
}
