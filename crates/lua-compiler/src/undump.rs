//! Binary chunk reader: `&[u8]` → `Proto`.
//!
//! Mirrors the layout written by [`crate::dump`]. Header fields are checked
//! before the body is trusted, and every decoded prototype is validated so
//! that indices, jumps and registers stay inside the function they belong to.

use std::sync::Arc;

use lua_core::opcode::MAXARG_A;
use lua_core::proto::STRIPPED_SOURCE;
use lua_core::{ChunkFormatError, Constant, DebugInfo, LocalVar, LuaStr, OpCode, Proto, Rk, UpvalueDesc};
use tracing::debug;

use crate::dump::{
    FORMAT, SIGNATURE, SIZEOF_INSTRUCTION, SIZEOF_INT, SIZEOF_NUMBER, TAG_BOOLEAN, TAG_FLOAT,
    TAG_INTEGER, TAG_NIL, TAG_STRING, VERSION,
};

/// Prototypes nested deeper than this are rejected.
const MAX_NESTING: usize = 200;

type Result<T> = std::result::Result<T, ChunkFormatError>;

fn bad(msg: impl Into<String>) -> ChunkFormatError {
    ChunkFormatError(msg.into())
}

/// True when `bytes` starts like a binary chunk.
pub fn is_binary_chunk(bytes: &[u8]) -> bool {
    bytes.starts_with(SIGNATURE)
}

/// Load a binary chunk produced by [`crate::dump()`].
pub fn undump(bytes: &[u8]) -> Result<Proto> {
    let mut r = Reader::new(bytes);
    r.header()?;
    let proto = r.function(None, 0)?;
    if r.remaining() != 0 {
        return Err(bad("trailing bytes after chunk"));
    }
    debug!(
        target: "lua::undump",
        source = %proto.source,
        bytes = bytes.len(),
        functions = count_protos(&proto),
        "loaded binary chunk"
    );
    Ok(proto)
}

fn count_protos(p: &Proto) -> usize {
    1 + p.protos.iter().map(|c| count_protos(c)).sum::<usize>()
}

// ── Cursor reader ─────────────────────────────────────────────────────────────

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    little: bool,
    size_t: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0, little: true, size_t: 8 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(bad("truncated chunk"));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn word<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        if !self.little {
            out.reverse();
        }
        Ok(out)
    }

    fn int(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.word::<4>()?))
    }

    fn size_t(&mut self) -> Result<u64> {
        if self.size_t == 4 {
            Ok(u64::from(self.int()?))
        } else {
            Ok(u64::from_le_bytes(self.word::<8>()?))
        }
    }

    fn integer(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.word::<8>()?))
    }

    fn number(&mut self) -> Result<f64> {
        Ok(f64::from_bits(u64::from_le_bytes(self.word::<8>()?)))
    }

    /// A count that must fit in the rest of the input, `min_item` bytes each.
    fn count(&mut self, min_item: usize) -> Result<usize> {
        let n = self.int()? as usize;
        if n.saturating_mul(min_item) > self.remaining() {
            return Err(bad("truncated chunk"));
        }
        Ok(n)
    }

    fn string(&mut self) -> Result<Option<&'a [u8]>> {
        let size = self.size_t()?;
        if size == 0 {
            return Ok(None);
        }
        if size > self.remaining() as u64 {
            return Err(bad("truncated chunk"));
        }
        let bytes = self.read_bytes(size as usize)?;
        match bytes.split_last() {
            Some((0, body)) => Ok(Some(body)),
            _ => Err(bad("string is not NUL-terminated")),
        }
    }

    fn lua_str(&mut self) -> Result<LuaStr> {
        match self.string()? {
            Some(bytes) => Ok(LuaStr::from(bytes)),
            None => Err(bad("missing string")),
        }
    }

    // ── blocks ────────────────────────────────────────────────────────────

    fn header(&mut self) -> Result<()> {
        if self.read_bytes(SIGNATURE.len()).ok() != Some(SIGNATURE) {
            return Err(bad("not a binary chunk"));
        }
        let version = self.byte()?;
        if version != VERSION {
            return Err(bad(format!("version mismatch: {version:#04x}")));
        }
        if self.byte()? != FORMAT {
            return Err(bad("format mismatch"));
        }
        self.little = match self.byte()? {
            1 => true,
            0 => false,
            other => return Err(bad(format!("unsupported endianness flag {other}"))),
        };
        expect_size(self.byte()?, SIZEOF_INT, "int")?;
        self.size_t = match self.byte()? {
            4 => 4,
            8 => 8,
            other => return Err(bad(format!("size_t size mismatch: {other}"))),
        };
        expect_size(self.byte()?, SIZEOF_INSTRUCTION, "Instruction")?;
        expect_size(self.byte()?, SIZEOF_NUMBER, "lua_Number")?;
        if self.byte()? != 0 {
            return Err(bad("integral numbers are not supported"));
        }
        Ok(())
    }

    fn function(&mut self, parent_source: Option<&str>, depth: usize) -> Result<Proto> {
        if depth > MAX_NESTING {
            return Err(bad("functions nested too deeply"));
        }
        let source = match (self.string()?, parent_source) {
            (Some(bytes), _) => String::from_utf8_lossy(bytes).into_owned(),
            (None, Some(parent)) => parent.to_string(),
            (None, None) => STRIPPED_SOURCE.to_string(),
        };
        let mut proto = Proto::new(source);
        proto.line_defined = self.int()?;
        proto.last_line_defined = self.int()?;
        let nups = self.byte()?;
        proto.param_count = self.byte()?;
        proto.is_vararg = match self.byte()? {
            0 => false,
            1 => true,
            other => return Err(bad(format!("invalid vararg flag {other}"))),
        };
        proto.max_stack = self.byte()?;

        let ncode = self.count(4)?;
        proto.instructions.reserve(ncode);
        for _ in 0..ncode {
            let word = self.int()?;
            proto.instructions.push(OpCode::decode(word)?);
        }

        let nk = self.count(1)?;
        for _ in 0..nk {
            let k = match self.byte()? {
                TAG_NIL => Constant::Nil,
                TAG_BOOLEAN => Constant::Boolean(self.byte()? != 0),
                TAG_FLOAT => Constant::Float(self.number()?),
                TAG_INTEGER => Constant::Integer(self.integer()?),
                TAG_STRING => Constant::Str(self.lua_str()?),
                tag => return Err(bad(format!("unknown constant tag {tag}"))),
            };
            proto.constants.push(k);
        }

        let nupdesc = self.count(2)?;
        if nupdesc != nups as usize {
            return Err(bad("upvalue count mismatch"));
        }
        for _ in 0..nupdesc {
            let in_stack = self.byte()?;
            let idx = self.byte()?;
            proto.upvalue_descs.push(match in_stack {
                1 => UpvalueDesc::Stack(idx),
                0 => UpvalueDesc::Upvalue(idx),
                other => return Err(bad(format!("invalid upvalue kind {other}"))),
            });
        }

        let nprotos = self.count(1)?;
        for _ in 0..nprotos {
            let child = self.function(Some(&proto.source), depth + 1)?;
            proto.protos.push(Arc::new(child));
        }

        proto.debug = self.debug_block()?;
        validate(&proto)?;
        Ok(proto)
    }

    fn debug_block(&mut self) -> Result<DebugInfo> {
        let mut debug = DebugInfo::default();
        let nlines = self.count(4)?;
        for _ in 0..nlines {
            debug.line_info.push(self.int()?);
        }
        let nlocals = self.count(1)?;
        for _ in 0..nlocals {
            let name = self.lua_str()?;
            let start_pc = self.int()?;
            let end_pc = self.int()?;
            debug.local_vars.push(LocalVar { name, start_pc, end_pc });
        }
        let nnames = self.count(1)?;
        for _ in 0..nnames {
            debug.upvalue_names.push(self.lua_str()?);
        }
        Ok(debug)
    }
}

fn expect_size(got: u8, want: u8, what: &str) -> Result<()> {
    if got != want {
        return Err(bad(format!("{what} size mismatch: {got}")));
    }
    Ok(())
}

// ── Validation ────────────────────────────────────────────────────────────────

/// Check that executing `proto` cannot index outside its own registers,
/// constants, upvalues, children or code.
fn validate(proto: &Proto) -> Result<()> {
    let code = &proto.instructions;
    if !matches!(code.last(), Some(OpCode::Return { .. })) {
        return Err(bad("function does not end with a return"));
    }
    if proto.param_count > proto.max_stack {
        return Err(bad("parameters exceed the register window"));
    }
    let debug = &proto.debug;
    if !debug.line_info.is_empty() && debug.line_info.len() != code.len() {
        return Err(bad("line info does not match code"));
    }
    if debug
        .local_vars
        .iter()
        .any(|v| v.start_pc > v.end_pc || v.end_pc as usize > code.len())
    {
        return Err(bad("local variable range out of code"));
    }
    if !debug.upvalue_names.is_empty() && debug.upvalue_names.len() != proto.upvalue_descs.len() {
        return Err(bad("upvalue names do not match upvalues"));
    }

    for child in &proto.protos {
        for desc in &child.upvalue_descs {
            let ok = match *desc {
                UpvalueDesc::Stack(reg) => reg < proto.max_stack,
                UpvalueDesc::Upvalue(idx) => (idx as usize) < proto.upvalue_descs.len(),
            };
            if !ok {
                return Err(bad("upvalue descriptor out of range"));
            }
        }
    }

    let v = Validator { proto };
    for (pc, op) in code.iter().enumerate() {
        v.instruction(pc, op)
            .map_err(|e| bad(format!("{} at pc {pc}: {}", op.name(), e.0)))?;
    }
    Ok(())
}

struct Validator<'p> {
    proto: &'p Proto,
}

impl Validator<'_> {
    fn max(&self) -> usize {
        self.proto.max_stack as usize
    }

    fn reg(&self, r: u8) -> Result<()> {
        if (r as usize) < self.max() {
            Ok(())
        } else {
            Err(bad("register out of range"))
        }
    }

    /// Registers `first .. first + n` all exist.
    fn range(&self, first: u8, n: usize) -> Result<()> {
        if first as usize + n <= self.max() {
            Ok(())
        } else {
            Err(bad("register range out of range"))
        }
    }

    fn rk(&self, rk: Rk) -> Result<()> {
        match rk {
            Rk::Reg(r) => self.reg(r),
            Rk::Const(k) => self.constant(k as u32),
        }
    }

    fn constant(&self, k: u32) -> Result<()> {
        if (k as usize) < self.proto.constants.len() {
            Ok(())
        } else {
            Err(bad("constant index out of range"))
        }
    }

    fn name(&self, k: u32) -> Result<()> {
        match self.proto.constants.get(k as usize) {
            Some(Constant::Str(_)) => Ok(()),
            _ => Err(bad("global name is not a string constant")),
        }
    }

    fn upvalue(&self, idx: u8) -> Result<()> {
        if (idx as usize) < self.proto.upvalue_descs.len() {
            Ok(())
        } else {
            Err(bad("upvalue index out of range"))
        }
    }

    fn jump(&self, pc: usize, offset: i32) -> Result<()> {
        let target = pc as i64 + 1 + offset as i64;
        if target >= 0 && (target as usize) < self.proto.instructions.len() {
            Ok(())
        } else {
            Err(bad("jump target out of code"))
        }
    }

    fn instruction(&self, pc: usize, op: &OpCode) -> Result<()> {
        use OpCode::*;
        match *op {
            Move { dst, src } | Unm { dst, src } | BNot { dst, src } | Not { dst, src } | Len { dst, src } => {
                self.reg(dst)?;
                self.reg(src)
            }
            LoadK { dst, const_idx } => {
                self.reg(dst)?;
                self.constant(const_idx)
            }
            LoadBool { dst, skip, .. } => {
                self.reg(dst)?;
                if skip {
                    self.jump(pc, 1)?;
                }
                Ok(())
            }
            LoadNil { dst, count } => self.range(dst, count as usize),
            GetUpval { dst, upval } => {
                self.reg(dst)?;
                self.upvalue(upval)
            }
            SetUpval { src, upval } => {
                self.reg(src)?;
                self.upvalue(upval)
            }
            GetGlobal { dst: reg, name } | SetGlobal { src: reg, name } => {
                self.reg(reg)?;
                self.name(name)
            }
            GetTable { dst, table, key } => {
                self.reg(dst)?;
                self.reg(table)?;
                self.rk(key)
            }
            SetTable { table, key, val } => {
                self.reg(table)?;
                self.rk(key)?;
                self.rk(val)
            }
            NewTable { dst, .. } => self.reg(dst),
            Method { dst, obj, key } => {
                self.range(dst, 2)?;
                self.reg(obj)?;
                self.rk(key)
            }
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
            | Shr { dst, lhs, rhs } => {
                self.reg(dst)?;
                self.rk(lhs)?;
                self.rk(rhs)
            }
            Concat { dst, first, last } => {
                self.reg(dst)?;
                if first >= last {
                    return Err(bad("empty concatenation"));
                }
                self.reg(last)
            }
            Jmp { offset, close } => {
                if close as usize > self.max() + 1 {
                    return Err(bad("close level out of range"));
                }
                self.jump(pc, offset)
            }
            Eq { lhs, rhs, .. } | Lt { lhs, rhs, .. } | Le { lhs, rhs, .. } => {
                self.rk(lhs)?;
                self.rk(rhs)?;
                self.jump(pc, 1)
            }
            Test { src, .. } => {
                self.reg(src)?;
                self.jump(pc, 1)
            }
            TestSet { dst, src, .. } => {
                if dst as u32 == MAXARG_A {
                    return Err(bad("unpatched test"));
                }
                self.reg(dst)?;
                self.reg(src)?;
                self.jump(pc, 1)
            }
            Call { func, args, results } => {
                self.range(func, (args as usize).max(1))?;
                self.range(func, (results as usize).saturating_sub(1))
            }
            TailCall { func, args } => self.range(func, (args as usize).max(1)),
            Return { first, count } => self.range(first, (count as usize).saturating_sub(1)),
            ForPrep { base, offset } | ForLoop { base, offset } => {
                self.range(base, 4)?;
                self.jump(pc, offset)
            }
            TForCall { base, results } => {
                self.range(base, 3 + results as usize)?;
                if !matches!(self.proto.instructions.get(pc + 1), Some(TForLoop { .. })) {
                    return Err(bad("TFORCALL not followed by TFORLOOP"));
                }
                Ok(())
            }
            TForLoop { base, offset } => {
                self.range(base, 4)?;
                self.jump(pc, offset)
            }
            SetList { table, count, batch } => {
                self.range(table, count as usize + 1)?;
                if batch == 0 && !matches!(self.proto.instructions.get(pc + 1), Some(ExtraArg { .. })) {
                    return Err(bad("missing EXTRAARG"));
                }
                Ok(())
            }
            Close { from } => self.range(from, 0),
            Closure { dst, proto_idx } => {
                self.reg(dst)?;
                if proto_idx as usize >= self.proto.protos.len() {
                    return Err(bad("prototype index out of range"));
                }
                Ok(())
            }
            VarArg { dst, count } => self.range(dst, (count as usize).saturating_sub(1)),
            ExtraArg { .. } => {
                let prev = pc.checked_sub(1).and_then(|p| self.proto.instructions.get(p));
                if matches!(prev, Some(SetList { batch: 0, .. })) {
                    Ok(())
                } else {
                    Err(bad("stray EXTRAARG"))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile;
    use crate::dump::{dump, dump_with, DumpOptions, Endianness};

    const SAMPLE: &str = "
        local t = {1, 2, 3, x = 'y'}
        local function sum(...)
            local s = 0
            for _, v in ipairs({...}) do s = s + v end
            return s
        end
        return sum(table.unpack(t)), 2.5, -7, nil, true
    ";

    #[test]
    fn round_trip_is_structural_identity() {
        let p = compile(SAMPLE.as_bytes(), "=sample").unwrap();
        assert_eq!(undump(&dump(&p, false)).unwrap(), p);
    }

    #[test]
    fn stripped_round_trip_equals_strip() {
        let p = compile(SAMPLE.as_bytes(), "=sample").unwrap();
        let back = undump(&dump(&p, true)).unwrap();
        assert_eq!(back, p.strip());
        assert_eq!(back.source, "=?");
        assert_eq!(back.protos[0].source, "=?");
    }

    #[test]
    fn big_endian_chunks_load() {
        let p = compile(SAMPLE.as_bytes(), "=sample").unwrap();
        let opts = DumpOptions { strip: false, endianness: Endianness::Big };
        assert_eq!(undump(&dump_with(&p, opts)).unwrap(), p);
    }

    #[test]
    fn header_fields_are_checked() {
        let p = compile(b"return 1", "=h").unwrap();
        let good = dump(&p, false);

        let mut v = good.clone();
        v[4] = 0x51;
        assert_eq!(undump(&v).unwrap_err().to_string(), "bad binary format (version mismatch: 0x51)");

        let mut v = good.clone();
        v[6] = 7;
        assert!(undump(&v).unwrap_err().0.contains("endianness"));

        let mut v = good.clone();
        v[10] = 4;
        assert!(undump(&v).unwrap_err().0.contains("lua_Number"));

        let mut v = good;
        v[11] = 1;
        assert!(undump(&v).unwrap_err().0.contains("integral"));

        assert_eq!(undump(b"return").unwrap_err().0, "not a binary chunk");
    }

    #[test]
    fn truncation_and_trailing_bytes() {
        let p = compile(SAMPLE.as_bytes(), "=sample").unwrap();
        let good = dump(&p, false);
        for cut in [13, good.len() / 2, good.len() - 1] {
            assert_eq!(undump(&good[..cut]).unwrap_err().0, "truncated chunk");
        }
        let mut long = good;
        long.push(0);
        assert_eq!(undump(&long).unwrap_err().0, "trailing bytes after chunk");
    }

    #[test]
    fn out_of_range_operands_are_rejected() {
        let mut p = compile(b"local a = 1 return a", "=v").unwrap();
        p.instructions[0] = OpCode::LoadK { dst: 0, const_idx: 9 };
        let err = undump(&dump(&p, true)).unwrap_err();
        assert!(err.0.contains("constant index out of range"), "{err}");

        let mut p = compile(b"local a = 1 return a", "=v").unwrap();
        p.instructions[0] = OpCode::Jmp { offset: 100, close: 0 };
        assert!(undump(&dump(&p, true)).unwrap_err().0.contains("jump target"));

        let mut p = compile(b"local a = 1 return a", "=v").unwrap();
        p.instructions[0] = OpCode::Move { dst: 200, src: 0 };
        assert!(undump(&dump(&p, true)).unwrap_err().0.contains("register out of range"));
    }

    proptest::proptest! {
        #[test]
        fn literal_chunks_round_trip(
            i in proptest::num::i64::ANY,
            f in proptest::num::f64::NORMAL,
            s in "[a-z ]{0,20}",
            strip in proptest::bool::ANY,
        ) {
            let src = format!("local t = {{{i}, {f:?}, {s:?}, k = {i} // 7}} return t, ...");
            let p = compile(src.as_bytes(), "=prop").unwrap();
            let back = undump(&dump(&p, strip)).unwrap();
            let want = if strip { p.strip() } else { p };
            proptest::prop_assert_eq!(back, want);
        }
    }
}
