/// Bytecode instruction set for the lua-rust virtual machine.
///
/// A register-based ISA in the PUC-Lua style. Variants carry typed operands;
/// every instruction also has a fixed 32-bit encoding used by binary chunks:
///
/// ```text
///  31       23       14        6      0
///  |   B:9   |   C:9   |  A:8  | op:6 |
///  |      Bx:18        |  A:8  | op:6 |
///  |            Ax:26          | op:6 |
/// ```
///
/// `sBx` is `Bx` biased by [`MAXARG_SBX`]. Register-or-constant operands
/// ([`Rk`]) use the 9-bit B/C fields with the high bit selecting the constant
/// pool.
use crate::error::ChunkFormatError;

pub const SIZE_OP: u32 = 6;
pub const SIZE_A: u32 = 8;
pub const SIZE_B: u32 = 9;
pub const SIZE_C: u32 = 9;
pub const SIZE_BX: u32 = SIZE_B + SIZE_C;
pub const SIZE_AX: u32 = SIZE_A + SIZE_BX;

pub const POS_A: u32 = SIZE_OP;
pub const POS_C: u32 = POS_A + SIZE_A;
pub const POS_B: u32 = POS_C + SIZE_C;
pub const POS_BX: u32 = POS_C;

pub const MAXARG_A: u32 = (1 << SIZE_A) - 1;
pub const MAXARG_B: u32 = (1 << SIZE_B) - 1;
pub const MAXARG_C: u32 = (1 << SIZE_C) - 1;
pub const MAXARG_BX: u32 = (1 << SIZE_BX) - 1;
pub const MAXARG_SBX: i32 = (MAXARG_BX >> 1) as i32;
pub const MAXARG_AX: u32 = (1 << SIZE_AX) - 1;

/// Bit that marks an Rk field as a constant index.
pub const BIT_RK: u32 = 1 << (SIZE_B - 1);
/// Largest constant index that fits an Rk operand.
pub const MAX_INDEX_RK: u32 = BIT_RK - 1;

/// Table-constructor items flushed per `SetList`.
pub const FIELDS_PER_FLUSH: u32 = 50;

/// Register or constant operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rk {
    Reg(u8),
    Const(u8),
}

impl Rk {
    fn encode(self) -> u32 {
        match self {
            Rk::Reg(r) => r as u32,
            Rk::Const(k) => BIT_RK | k as u32,
        }
    }

    fn decode(field: u32) -> Rk {
        if field & BIT_RK != 0 {
            Rk::Const((field & MAX_INDEX_RK) as u8)
        } else {
            Rk::Reg(field as u8)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// `R[dst] = R[src]`
    Move { dst: u8, src: u8 },
    /// `R[dst] = K[const_idx]`
    LoadK { dst: u8, const_idx: u32 },
    /// `R[dst] = value`; if `skip`, jump over the next instruction.
    LoadBool { dst: u8, value: bool, skip: bool },
    /// `R[dst .. dst+count] = nil`
    LoadNil { dst: u8, count: u8 },
    GetUpval { dst: u8, upval: u8 },
    /// `R[dst] = env[K[name]]`
    GetGlobal { dst: u8, name: u32 },
    /// `R[dst] = R[table][key]`
    GetTable { dst: u8, table: u8, key: Rk },
    SetGlobal { src: u8, name: u32 },
    SetUpval { src: u8, upval: u8 },
    /// `R[table][key] = val`
    SetTable { table: u8, key: Rk, val: Rk },
    NewTable { dst: u8, array_hint: u16, hash_hint: u16 },
    /// `R[dst+1] = R[obj]; R[dst] = R[obj][key]`
    Method { dst: u8, obj: u8, key: Rk },

    Add { dst: u8, lhs: Rk, rhs: Rk },
    Sub { dst: u8, lhs: Rk, rhs: Rk },
    Mul { dst: u8, lhs: Rk, rhs: Rk },
    Div { dst: u8, lhs: Rk, rhs: Rk },
    Mod { dst: u8, lhs: Rk, rhs: Rk },
    Pow { dst: u8, lhs: Rk, rhs: Rk },
    IDiv { dst: u8, lhs: Rk, rhs: Rk },
    BAnd { dst: u8, lhs: Rk, rhs: Rk },
    BOr { dst: u8, lhs: Rk, rhs: Rk },
    BXor { dst: u8, lhs: Rk, rhs: Rk },
    Shl { dst: u8, lhs: Rk, rhs: Rk },
    Shr { dst: u8, lhs: Rk, rhs: Rk },

    Unm { dst: u8, src: u8 },
    BNot { dst: u8, src: u8 },
    Not { dst: u8, src: u8 },
    Len { dst: u8, src: u8 },
    /// `R[dst] = R[first] .. ... .. R[last]`
    Concat { dst: u8, first: u8, last: u8 },

    /// `pc += offset`; a nonzero `close` also closes upvalues `>= close - 1`.
    Jmp { offset: i32, close: u8 },
    /// If `(lhs == rhs) != expect`, skip the next instruction.
    Eq { expect: bool, lhs: Rk, rhs: Rk },
    Lt { expect: bool, lhs: Rk, rhs: Rk },
    Le { expect: bool, lhs: Rk, rhs: Rk },
    /// If `truthy(R[src]) != expect`, skip the next instruction.
    Test { src: u8, expect: bool },
    /// If `truthy(R[src]) == expect` then `R[dst] = R[src]`, else skip.
    TestSet { dst: u8, src: u8, expect: bool },

    /// Arguments and results are `n + 1`; zero means "up to top" / "all".
    Call { func: u8, args: u16, results: u16 },
    TailCall { func: u8, args: u16 },
    /// Return `count - 1` values starting at `first`; zero count means up to top.
    Return { first: u8, count: u16 },

    /// Prepare a numeric loop at `R[base..base+3]`; skip it entirely when it
    /// would not run.
    ForPrep { base: u8, offset: i32 },
    ForLoop { base: u8, offset: i32 },
    /// `R[base+3 ..] = R[base](R[base+1], R[base+2])`
    TForCall { base: u8, results: u8 },
    /// If `R[base+3] ~= nil` then `R[base+2] = R[base+3]` and jump.
    TForLoop { base: u8, offset: i32 },

    /// Store `count` values (zero: up to top) from `R[table+1..]` at
    /// `(batch - 1) * 50 + 1`; batch zero takes the batch from `ExtraArg`.
    SetList { table: u8, count: u16, batch: u16 },
    Close { from: u8 },
    Closure { dst: u8, proto_idx: u32 },
    /// Copy `count - 1` varargs to `R[dst..]`; zero copies all of them.
    VarArg { dst: u8, count: u16 },
    ExtraArg { value: u32 },
}

const OP_NAMES: [&str; 47] = [
    "MOVE", "LOADK", "LOADBOOL", "LOADNIL", "GETUPVAL", "GETGLOBAL", "GETTABLE", "SETGLOBAL",
    "SETUPVAL", "SETTABLE", "NEWTABLE", "SELF", "ADD", "SUB", "MUL", "DIV", "MOD", "POW", "IDIV",
    "BAND", "BOR", "BXOR", "SHL", "SHR", "UNM", "BNOT", "NOT", "LEN", "CONCAT", "JMP", "EQ", "LT",
    "LE", "TEST", "TESTSET", "CALL", "TAILCALL", "RETURN", "FORPREP", "FORLOOP", "TFORCALL",
    "TFORLOOP", "SETLIST", "CLOSE", "CLOSURE", "VARARG", "EXTRAARG",
];

fn abc(op: u32, a: u32, b: u32, c: u32) -> u32 {
    op | (a << POS_A) | (b << POS_B) | (c << POS_C)
}

fn abx(op: u32, a: u32, bx: u32) -> u32 {
    op | (a << POS_A) | (bx << POS_BX)
}

fn asbx(op: u32, a: u32, sbx: i32) -> u32 {
    abx(op, a, (sbx + MAXARG_SBX) as u32)
}

impl OpCode {
    pub fn opcode_number(&self) -> u32 {
        use OpCode::*;
        match self {
            Move { .. } => 0,
            LoadK { .. } => 1,
            LoadBool { .. } => 2,
            LoadNil { .. } => 3,
            GetUpval { .. } => 4,
            GetGlobal { .. } => 5,
            GetTable { .. } => 6,
            SetGlobal { .. } => 7,
            SetUpval { .. } => 8,
            SetTable { .. } => 9,
            NewTable { .. } => 10,
            Method { .. } => 11,
            Add { .. } => 12,
            Sub { .. } => 13,
            Mul { .. } => 14,
            Div { .. } => 15,
            Mod { .. } => 16,
            Pow { .. } => 17,
            IDiv { .. } => 18,
            BAnd { .. } => 19,
            BOr { .. } => 20,
            BXor { .. } => 21,
            Shl { .. } => 22,
            Shr { .. } => 23,
            Unm { .. } => 24,
            BNot { .. } => 25,
            Not { .. } => 26,
            Len { .. } => 27,
            Concat { .. } => 28,
            Jmp { .. } => 29,
            Eq { .. } => 30,
            Lt { .. } => 31,
            Le { .. } => 32,
            Test { .. } => 33,
            TestSet { .. } => 34,
            Call { .. } => 35,
            TailCall { .. } => 36,
            Return { .. } => 37,
            ForPrep { .. } => 38,
            ForLoop { .. } => 39,
            TForCall { .. } => 40,
            TForLoop { .. } => 41,
            SetList { .. } => 42,
            Close { .. } => 43,
            Closure { .. } => 44,
            VarArg { .. } => 45,
            ExtraArg { .. } => 46,
        }
    }

    /// Mnemonic used by listings.
    pub fn name(&self) -> &'static str {
        OP_NAMES[self.opcode_number() as usize]
    }

    /// Relative jump target (from `pc + 1`) for instructions that branch.
    pub fn jump_offset(&self) -> Option<i32> {
        match *self {
            OpCode::Jmp { offset, .. }
            | OpCode::ForPrep { offset, .. }
            | OpCode::ForLoop { offset, .. }
            | OpCode::TForLoop { offset, .. } => Some(offset),
            _ => None,
        }
    }

    /// Replace the jump offset of a branching instruction; others are unchanged.
    pub fn set_jump_offset(&mut self, new: i32) {
        match self {
            OpCode::Jmp { offset, .. }
            | OpCode::ForPrep { offset, .. }
            | OpCode::ForLoop { offset, .. }
            | OpCode::TForLoop { offset, .. } => *offset = new,
            _ => {}
        }
    }

    pub fn encode(&self) -> u32 {
        use OpCode::*;
        let op = self.opcode_number();
        match *self {
            Move { dst, src } => abc(op, dst as u32, src as u32, 0),
            LoadK { dst, const_idx } => abx(op, dst as u32, const_idx),
            LoadBool { dst, value, skip } => abc(op, dst as u32, value as u32, skip as u32),
            LoadNil { dst, count } => abc(op, dst as u32, count as u32, 0),
            GetUpval { dst, upval } => abc(op, dst as u32, upval as u32, 0),
            GetGlobal { dst, name } => abx(op, dst as u32, name),
            GetTable { dst, table, key } => abc(op, dst as u32, table as u32, key.encode()),
            SetGlobal { src, name } => abx(op, src as u32, name),
            SetUpval { src, upval } => abc(op, src as u32, upval as u32, 0),
            SetTable { table, key, val } => abc(op, table as u32, key.encode(), val.encode()),
            NewTable { dst, array_hint, hash_hint } => {
                abc(op, dst as u32, array_hint as u32, hash_hint as u32)
            }
            Method { dst, obj, key } => abc(op, dst as u32, obj as u32, key.encode()),
            Add { dst, lhs, rhs }
            | Sub { dst, lhs, rhs }
            | Mul { dst, lhs, rhs }
            | Div { dst, lhs, rhs }
            | Mod { dst, lhs, rhs }
            | Pow { dst, lhs, rhs }
            | IDiv { dst, lhs, rhs }
            | BAnd { dst, lhs, rhs }
            | BOr { dst, lhs, rhs }
            | BXor { dst, lhs, rhs }
            | Shl { dst, lhs, rhs }
            | Shr { dst, lhs, rhs } => abc(op, dst as u32, lhs.encode(), rhs.encode()),
            Unm { dst, src } | BNot { dst, src } | Not { dst, src } | Len { dst, src } => {
                abc(op, dst as u32, src as u32, 0)
            }
            Concat { dst, first, last } => abc(op, dst as u32, first as u32, last as u32),
            Jmp { offset, close } => asbx(op, close as u32, offset),
            Eq { expect, lhs, rhs } | Lt { expect, lhs, rhs } | Le { expect, lhs, rhs } => {
                abc(op, expect as u32, lhs.encode(), rhs.encode())
            }
            Test { src, expect } => abc(op, src as u32, 0, expect as u32),
            TestSet { dst, src, expect } => abc(op, dst as u32, src as u32, expect as u32),
            Call { func, args, results } => abc(op, func as u32, args as u32, results as u32),
            TailCall { func, args } => abc(op, func as u32, args as u32, 0),
            Return { first, count } => abc(op, first as u32, count as u32, 0),
            ForPrep { base, offset } | ForLoop { base, offset } | TForLoop { base, offset } => {
                asbx(op, base as u32, offset)
            }
            TForCall { base, results } => abc(op, base as u32, 0, results as u32),
            SetList { table, count, batch } => abc(op, table as u32, count as u32, batch as u32),
            Close { from } => abc(op, from as u32, 0, 0),
            Closure { dst, proto_idx } => abx(op, dst as u32, proto_idx),
            VarArg { dst, count } => abc(op, dst as u32, count as u32, 0),
            ExtraArg { value } => op | (value << POS_A),
        }
    }

    pub fn decode(word: u32) -> Result<OpCode, ChunkFormatError> {
        use OpCode::*;
        let op = word & ((1 << SIZE_OP) - 1);
        let a = (word >> POS_A) & MAXARG_A;
        let b = (word >> POS_B) & MAXARG_B;
        let c = (word >> POS_C) & MAXARG_C;
        let bx = (word >> POS_BX) & MAXARG_BX;
        let sbx = bx as i32 - MAXARG_SBX;
        let a8 = a as u8;
        let (rb, rc) = (Rk::decode(b), Rk::decode(c));
        let reg = |field: u32| -> Result<u8, ChunkFormatError> {
            u8::try_from(field).map_err(|_| {
                ChunkFormatError(format!("register operand {field} out of range in {word:#010x}"))
            })
        };
        let flag = |field: u32| -> Result<bool, ChunkFormatError> {
            match field {
                0 => Ok(false),
                1 => Ok(true),
                _ => Err(ChunkFormatError(format!("bad flag operand in {word:#010x}"))),
            }
        };
        Ok(match op {
            0 => Move { dst: a8, src: reg(b)? },
            1 => LoadK { dst: a8, const_idx: bx },
            2 => LoadBool { dst: a8, value: flag(b)?, skip: flag(c)? },
            3 => LoadNil { dst: a8, count: reg(b)? },
            4 => GetUpval { dst: a8, upval: reg(b)? },
            5 => GetGlobal { dst: a8, name: bx },
            6 => GetTable { dst: a8, table: reg(b)?, key: rc },
            7 => SetGlobal { src: a8, name: bx },
            8 => SetUpval { src: a8, upval: reg(b)? },
            9 => SetTable { table: a8, key: rb, val: rc },
            10 => NewTable { dst: a8, array_hint: b as u16, hash_hint: c as u16 },
            11 => Method { dst: a8, obj: reg(b)?, key: rc },
            12 => Add { dst: a8, lhs: rb, rhs: rc },
            13 => Sub { dst: a8, lhs: rb, rhs: rc },
            14 => Mul { dst: a8, lhs: rb, rhs: rc },
            15 => Div { dst: a8, lhs: rb, rhs: rc },
            16 => Mod { dst: a8, lhs: rb, rhs: rc },
            17 => Pow { dst: a8, lhs: rb, rhs: rc },
            18 => IDiv { dst: a8, lhs: rb, rhs: rc },
            19 => BAnd { dst: a8, lhs: rb, rhs: rc },
            20 => BOr { dst: a8, lhs: rb, rhs: rc },
            21 => BXor { dst: a8, lhs: rb, rhs: rc },
            22 => Shl { dst: a8, lhs: rb, rhs: rc },
            23 => Shr { dst: a8, lhs: rb, rhs: rc },
            24 => Unm { dst: a8, src: reg(b)? },
            25 => BNot { dst: a8, src: reg(b)? },
            26 => Not { dst: a8, src: reg(b)? },
            27 => Len { dst: a8, src: reg(b)? },
            28 => Concat { dst: a8, first: reg(b)?, last: reg(c)? },
            29 => Jmp { offset: sbx, close: a8 },
            30 => Eq { expect: flag(a)?, lhs: rb, rhs: rc },
            31 => Lt { expect: flag(a)?, lhs: rb, rhs: rc },
            32 => Le { expect: flag(a)?, lhs: rb, rhs: rc },
            33 => Test { src: a8, expect: flag(c)? },
            34 => TestSet { dst: a8, src: reg(b)?, expect: flag(c)? },
            35 => Call { func: a8, args: b as u16, results: c as u16 },
            36 => TailCall { func: a8, args: b as u16 },
            37 => Return { first: a8, count: b as u16 },
            38 => ForPrep { base: a8, offset: sbx },
            39 => ForLoop { base: a8, offset: sbx },
            40 => TForCall { base: a8, results: reg(c)? },
            41 => TForLoop { base: a8, offset: sbx },
            42 => SetList { table: a8, count: b as u16, batch: c as u16 },
            43 => Close { from: a8 },
            44 => Closure { dst: a8, proto_idx: bx },
            45 => VarArg { dst: a8, count: b as u16 },
            46 => ExtraArg { value: word >> POS_A },
            other => return Err(ChunkFormatError(format!("unknown opcode {other}"))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_layout_matches_word_format() {
        let word = OpCode::Move { dst: 3, src: 7 }.encode();
        assert_eq!(word & 0x3f, 0);
        assert_eq!((word >> POS_A) & MAXARG_A, 3);
        assert_eq!((word >> POS_B) & MAXARG_B, 7);

        let word = OpCode::LoadK { dst: 1, const_idx: MAXARG_BX }.encode();
        assert_eq!(word >> POS_BX, MAXARG_BX);
    }

    #[test]
    fn rk_constant_bit() {
        let ins = OpCode::Add { dst: 0, lhs: Rk::Reg(2), rhs: Rk::Const(255) };
        let word = ins.encode();
        assert_eq!((word >> POS_C) & MAXARG_C, 0x1ff);
        assert_eq!(OpCode::decode(word).unwrap(), ins);
    }

    #[test]
    fn signed_offsets_survive_encoding() {
        for offset in [-MAXARG_SBX, -1, 0, 1, MAXARG_SBX] {
            let ins = OpCode::Jmp { offset, close: 4 };
            assert_eq!(OpCode::decode(ins.encode()).unwrap(), ins);
        }
        let lp = OpCode::ForLoop { base: 5, offset: -12 };
        assert_eq!(OpCode::decode(lp.encode()).unwrap(), lp);
    }

    #[test]
    fn extra_arg_uses_wide_field() {
        let ins = OpCode::ExtraArg { value: MAXARG_AX };
        assert_eq!(OpCode::decode(ins.encode()).unwrap(), ins);
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        assert!(OpCode::decode(63).is_err());
    }

    #[test]
    fn register_field_overflow_is_rejected() {
        // MOVE with B = 300 does not name a register.
        let word = 300 << POS_B;
        assert!(OpCode::decode(word).is_err());
    }

    #[test]
    fn jump_offset_accessors() {
        let mut j = OpCode::Jmp { offset: 0, close: 0 };
        j.set_jump_offset(9);
        assert_eq!(j.jump_offset(), Some(9));
        assert_eq!(OpCode::Not { dst: 0, src: 1 }.jump_offset(), None);
        assert_eq!(j.name(), "JMP");
    }
}
