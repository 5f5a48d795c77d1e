//! `lua-compiler`: turns Lua source into [`Proto`]s in a single pass, and
//! moves prototypes in and out of the binary chunk format.

pub mod disasm;
pub mod dump;
pub mod expdesc;
pub mod func_state;
pub mod parser;
pub mod undump;

use lua_core::{CompileError, Proto};
use tracing::debug;

pub use disasm::disassemble;
pub use dump::{dump, dump_with, DumpOptions, Endianness, SIGNATURE};
pub use parser::Parser;
pub use undump::{is_binary_chunk, undump};

/// Compile a whole chunk into its vararg main function.
///
/// A first line starting with `#` is ignored so scripts may carry a shebang;
/// its newline is kept so line numbers stay right.
pub fn compile(source: &[u8], chunk_name: &str) -> Result<Proto, CompileError> {
    let body = if source.first() == Some(&b'#') {
        let end = source.iter().position(|&b| b == b'\n').unwrap_or(source.len());
        &source[end..]
    } else {
        source
    };
    let proto = Parser::new(body, chunk_name)?.parse_main()?;
    debug!(
        target: "lua::compile",
        chunk = chunk_name,
        instructions = proto.instructions.len(),
        constants = proto.constants.len(),
        functions = proto.protos.len(),
        "compiled chunk"
    );
    Ok(proto)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shebang_line_is_skipped() {
        let p = compile(b"#!/usr/bin/env lua\nlocal x = 1", "=script").unwrap();
        assert_eq!(p.debug.line_info[0], 2);
    }

    #[test]
    fn errors_carry_the_chunk_name() {
        let err = compile(b"local = 1", "@foo.lua").unwrap_err();
        assert_eq!(err.to_string(), "foo.lua:1: <name> expected near '='");
        let err = compile(b"x = 'abc", "=s").unwrap_err();
        assert!(matches!(err, CompileError::Lex(_)));
    }
}
