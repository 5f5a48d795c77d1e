//! Function prototypes: the compiler's output and the VM's input.

use std::sync::Arc;

use crate::opcode::OpCode;
use crate::string::LuaStr;

// ── Constants ─────────────────────────────────────────────────────────────────

/// A constant-pool entry.
#[derive(Debug, Clone)]
pub enum Constant {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Str(LuaStr),
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Constant::Nil, Constant::Nil) => true,
            (Constant::Boolean(a), Constant::Boolean(b)) => a == b,
            (Constant::Integer(a), Constant::Integer(b)) => a == b,
            // Bitwise so that a dumped and reloaded pool compares equal.
            (Constant::Float(a), Constant::Float(b)) => a.to_bits() == b.to_bits(),
            (Constant::Str(a), Constant::Str(b)) => a == b,
            _ => false,
        }
    }
}

// ── Upvalue descriptors ───────────────────────────────────────────────────────

/// Describes where to find an upvalue at closure instantiation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpvalueDesc {
    /// Capture the local at register `reg` of the enclosing call frame.
    Stack(u8),
    /// Re-use upvalue `idx` of the enclosing closure.
    Upvalue(u8),
}

// ── Debug info ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVar {
    pub name: LuaStr,
    /// First instruction where the local is live.
    pub start_pc: u32,
    /// First instruction where it is dead.
    pub end_pc: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugInfo {
    /// Source line per instruction.
    pub line_info: Vec<u32>,
    pub local_vars: Vec<LocalVar>,
    pub upvalue_names: Vec<LuaStr>,
}

// ── Prototype ─────────────────────────────────────────────────────────────────

/// A compiled function prototype, immutable after compilation.
///
/// Every Lua function (main chunk or nested) compiles to a `Proto`. Closures
/// share it via `Arc`; upvalue cells are per instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Proto {
    /// Chunk name as given to the compiler (`=stdin`, `@file.lua`, or source text).
    pub source: String,
    pub line_defined: u32,
    pub last_line_defined: u32,
    pub param_count: u8,
    pub is_vararg: bool,
    /// Registers needed by this function.
    pub max_stack: u8,
    pub instructions: Vec<OpCode>,
    pub constants: Vec<Constant>,
    /// Nested function prototypes referenced by `Closure`.
    pub protos: Vec<Arc<Proto>>,
    pub upvalue_descs: Vec<UpvalueDesc>,
    pub debug: DebugInfo,
}

/// Source name recorded in stripped prototypes.
pub const STRIPPED_SOURCE: &str = "=?";

impl Proto {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            line_defined: 0,
            last_line_defined: 0,
            param_count: 0,
            is_vararg: false,
            max_stack: 2,
            instructions: Vec::new(),
            constants: Vec::new(),
            protos: Vec::new(),
            upvalue_descs: Vec::new(),
            debug: DebugInfo::default(),
        }
    }

    /// A copy without debug information, recursively.
    pub fn strip(&self) -> Proto {
        Proto {
            source: STRIPPED_SOURCE.to_string(),
            debug: DebugInfo::default(),
            protos: self.protos.iter().map(|p| Arc::new(p.strip())).collect(),
            ..self.clone()
        }
    }

    /// Source line of the instruction at `pc`, if line info was kept.
    pub fn line_at(&self, pc: usize) -> Option<u32> {
        self.debug.line_info.get(pc).copied()
    }

    /// Name of the local occupying register `reg` at `pc`.
    pub fn local_name(&self, reg: u8, pc: usize) -> Option<&LuaStr> {
        let pc = pc as u32;
        let mut n = reg as i32;
        for var in &self.debug.local_vars {
            if var.start_pc > pc {
                break;
            }
            if pc < var.end_pc {
                if n == 0 {
                    return Some(&var.name);
                }
                n -= 1;
            }
        }
        None
    }

    /// Display name of this function's chunk.
    pub fn chunk_id(&self) -> String {
        chunk_id(&self.source)
    }
}

const ID_SIZE: usize = 60;

/// Render a chunk name for messages: `=name` verbatim, `@file` as the file
/// name, anything else as `[string "first line..."]`.
pub fn chunk_id(source: &str) -> String {
    if let Some(rest) = source.strip_prefix('=') {
        truncate_chars(rest, ID_SIZE - 1).to_string()
    } else if let Some(rest) = source.strip_prefix('@') {
        if rest.len() < ID_SIZE {
            rest.to_string()
        } else {
            let keep = ID_SIZE - 4;
            let mut start = rest.len() - keep;
            while !rest.is_char_boundary(start) {
                start += 1;
            }
            format!("...{}", &rest[start..])
        }
    } else {
        let budget = ID_SIZE - "[string \"...\"]".len() - 1;
        let first_line = source.split('\n').next().unwrap_or("");
        if first_line.len() == source.len() && source.len() < budget {
            format!("[string \"{source}\"]")
        } else {
            format!("[string \"{}...\"]", truncate_chars(first_line, budget))
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_ids() {
        assert_eq!(chunk_id("=stdin"), "stdin");
        assert_eq!(chunk_id("@script.lua"), "script.lua");
        assert_eq!(chunk_id("return 1"), "[string \"return 1\"]");
        assert_eq!(chunk_id("x = 1\ny = 2"), "[string \"x = 1...\"]");
        let long = format!("@{}", "d/".repeat(40));
        assert!(chunk_id(&long).starts_with("..."));
        assert!(chunk_id(&long).len() < ID_SIZE);
    }

    #[test]
    fn strip_is_recursive() {
        let mut inner = Proto::new("src");
        inner.debug.line_info = vec![1, 2];
        let mut outer = Proto::new("src");
        outer.debug.upvalue_names.push(LuaStr::from("_ENV"));
        outer.protos.push(Arc::new(inner));
        let stripped = outer.strip();
        assert_eq!(stripped.source, STRIPPED_SOURCE);
        assert!(stripped.debug.upvalue_names.is_empty());
        assert!(stripped.protos[0].debug.line_info.is_empty());
        assert_eq!(stripped.strip(), stripped);
    }

    #[test]
    fn local_names_follow_live_ranges() {
        let mut p = Proto::new("src");
        p.debug.local_vars = vec![
            LocalVar { name: LuaStr::from("a"), start_pc: 0, end_pc: 10 },
            LocalVar { name: LuaStr::from("b"), start_pc: 2, end_pc: 5 },
            LocalVar { name: LuaStr::from("c"), start_pc: 6, end_pc: 10 },
        ];
        assert_eq!(p.local_name(1, 3).map(|s| s.to_string()), Some("b".into()));
        assert_eq!(p.local_name(1, 7).map(|s| s.to_string()), Some("c".into()));
        assert_eq!(p.local_name(1, 1), None);
    }

    #[test]
    fn float_constants_compare_bitwise() {
        assert_ne!(Constant::Float(0.0), Constant::Float(-0.0));
        assert_ne!(Constant::Integer(1), Constant::Float(1.0));
    }
}
