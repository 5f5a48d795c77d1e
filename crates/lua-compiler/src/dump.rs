//! Binary chunk writer: `Proto` → `Vec<u8>`.
//!
//! Layout: a 12-byte header followed by the recursive function block of the
//! main prototype. See [`crate::undump`] for the reader and the validation
//! it applies.

use lua_core::{Constant, LuaStr, Proto, UpvalueDesc};

/// First bytes of every binary chunk.
pub const SIGNATURE: &[u8] = b"\x1bLua";
pub const VERSION: u8 = 0x53;
pub const FORMAT: u8 = 0;

pub const SIZEOF_INT: u8 = 4;
pub const SIZEOF_INSTRUCTION: u8 = 4;
pub const SIZEOF_NUMBER: u8 = 8;
/// Width of string lengths written by this implementation.
pub const SIZEOF_SIZE_T: u8 = 8;

pub const TAG_NIL: u8 = 0;
pub const TAG_BOOLEAN: u8 = 1;
pub const TAG_FLOAT: u8 = 3;
pub const TAG_STRING: u8 = 4;
pub const TAG_INTEGER: u8 = 3 | (1 << 4);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DumpOptions {
    /// Drop line info, local names, upvalue names and source names.
    pub strip: bool,
    pub endianness: Endianness,
}

/// Serialize `proto` in little-endian order.
pub fn dump(proto: &Proto, strip: bool) -> Vec<u8> {
    dump_with(proto, DumpOptions { strip, ..DumpOptions::default() })
}

pub fn dump_with(proto: &Proto, options: DumpOptions) -> Vec<u8> {
    let mut w = Writer { buf: Vec::new(), options };
    w.header();
    w.function(proto, None);
    w.buf
}

// ── Low-level write helpers ────────────────────────────────────────────────

struct Writer {
    buf: Vec<u8>,
    options: DumpOptions,
}

impl Writer {
    fn byte(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn int(&mut self, v: u32) {
        match self.options.endianness {
            Endianness::Little => self.buf.extend_from_slice(&v.to_le_bytes()),
            Endianness::Big => self.buf.extend_from_slice(&v.to_be_bytes()),
        }
    }

    fn size_t(&mut self, v: u64) {
        match self.options.endianness {
            Endianness::Little => self.buf.extend_from_slice(&v.to_le_bytes()),
            Endianness::Big => self.buf.extend_from_slice(&v.to_be_bytes()),
        }
    }

    fn integer(&mut self, v: i64) {
        self.size_t(v as u64);
    }

    fn number(&mut self, v: f64) {
        self.size_t(v.to_bits());
    }

    /// Length-prefixed and NUL-terminated; length zero means "no string".
    fn string(&mut self, s: Option<&[u8]>) {
        match s {
            None => self.size_t(0),
            Some(bytes) => {
                self.size_t(bytes.len() as u64 + 1);
                self.buf.extend_from_slice(bytes);
                self.buf.push(0);
            }
        }
    }

    fn lua_str(&mut self, s: &LuaStr) {
        self.string(Some(s.as_bytes()));
    }

    // ── blocks ────────────────────────────────────────────────────────────

    fn header(&mut self) {
        self.buf.extend_from_slice(SIGNATURE);
        self.byte(VERSION);
        self.byte(FORMAT);
        self.byte(match self.options.endianness {
            Endianness::Little => 1,
            Endianness::Big => 0,
        });
        self.byte(SIZEOF_INT);
        self.byte(SIZEOF_SIZE_T);
        self.byte(SIZEOF_INSTRUCTION);
        self.byte(SIZEOF_NUMBER);
        // Numbers are not integral-only.
        self.byte(0);
    }

    fn function(&mut self, proto: &Proto, parent_source: Option<&str>) {
        // Nested functions inherit their parent's source.
        if self.options.strip || parent_source == Some(proto.source.as_str()) {
            self.string(None);
        } else {
            self.string(Some(proto.source.as_bytes()));
        }
        self.int(proto.line_defined);
        self.int(proto.last_line_defined);
        self.byte(proto.upvalue_descs.len() as u8);
        self.byte(proto.param_count);
        self.byte(proto.is_vararg as u8);
        self.byte(proto.max_stack);

        self.int(proto.instructions.len() as u32);
        for op in &proto.instructions {
            self.int(op.encode());
        }

        self.int(proto.constants.len() as u32);
        for k in &proto.constants {
            self.constant(k);
        }

        self.int(proto.upvalue_descs.len() as u32);
        for desc in &proto.upvalue_descs {
            match desc {
                UpvalueDesc::Stack(reg) => {
                    self.byte(1);
                    self.byte(*reg);
                }
                UpvalueDesc::Upvalue(idx) => {
                    self.byte(0);
                    self.byte(*idx);
                }
            }
        }

        self.int(proto.protos.len() as u32);
        for p in &proto.protos {
            self.function(p, Some(&proto.source));
        }

        self.debug(proto);
    }

    fn constant(&mut self, k: &Constant) {
        match k {
            Constant::Nil => self.byte(TAG_NIL),
            Constant::Boolean(b) => {
                self.byte(TAG_BOOLEAN);
                self.byte(*b as u8);
            }
            Constant::Float(f) => {
                self.byte(TAG_FLOAT);
                self.number(*f);
            }
            Constant::Integer(i) => {
                self.byte(TAG_INTEGER);
                self.integer(*i);
            }
            Constant::Str(s) => {
                self.byte(TAG_STRING);
                self.lua_str(s);
            }
        }
    }

    fn debug(&mut self, proto: &Proto) {
        if self.options.strip {
            self.int(0);
            self.int(0);
            self.int(0);
            return;
        }
        let debug = &proto.debug;
        self.int(debug.line_info.len() as u32);
        for &line in &debug.line_info {
            self.int(line);
        }
        self.int(debug.local_vars.len() as u32);
        for var in &debug.local_vars {
            self.lua_str(&var.name);
            self.int(var.start_pc);
            self.int(var.end_pc);
        }
        self.int(debug.upvalue_names.len() as u32);
        for name in &debug.upvalue_names {
            self.lua_str(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lua_core::OpCode;

    fn tiny() -> Proto {
        let mut p = Proto::new("=tiny");
        p.is_vararg = true;
        p.instructions.push(OpCode::Return { first: 0, count: 1 });
        p.debug.line_info.push(1);
        p
    }

    #[test]
    fn header_layout() {
        let bytes = dump(&tiny(), false);
        assert_eq!(&bytes[..4], SIGNATURE);
        assert_eq!(&bytes[4..12], &[0x53, 0, 1, 4, 8, 4, 8, 0]);
    }

    #[test]
    fn big_endian_flag_and_words() {
        let opts = DumpOptions { strip: true, endianness: Endianness::Big };
        let bytes = dump_with(&tiny(), opts);
        assert_eq!(bytes[6], 0);
        // Stripped source: a zero size_t right after the header.
        assert_eq!(&bytes[12..20], &[0; 8]);
        // line_defined = 0, last_line_defined = 0
        assert_eq!(&bytes[20..28], &[0; 8]);
    }

    #[test]
    fn strip_drops_debug_block() {
        let full = dump(&tiny(), false);
        let stripped = dump(&tiny(), true);
        assert!(stripped.len() < full.len());
        assert!(!stripped.windows(5).any(|w| w == b"=tiny"));
    }
}
