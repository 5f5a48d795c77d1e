use thiserror::Error;

/// A tokenizer failure, with the chunk display name and source line.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{chunk}:{line}: {message}")]
pub struct LexError {
    pub chunk: String,
    pub line: u32,
    pub message: String,
}

/// Errors raised while turning source text into a prototype.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error(transparent)]
    Lex(#[from] LexError),

    #[error("{chunk}:{line}: {message}")]
    Syntax {
        chunk: String,
        line: u32,
        message: String,
    },
}

impl CompileError {
    /// Source line the error points at.
    pub fn line(&self) -> u32 {
        match self {
            CompileError::Lex(e) => e.line,
            CompileError::Syntax { line, .. } => *line,
        }
    }
}

/// A binary chunk that cannot be loaded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("bad binary format ({0})")]
pub struct ChunkFormatError(pub String);

/// Anything that can go wrong while loading a chunk, textual or binary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    ChunkFormat(#[from] ChunkFormatError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_position() {
        let e = CompileError::Syntax {
            chunk: "t.lua".into(),
            line: 3,
            message: "'=' expected near 'x'".into(),
        };
        assert_eq!(e.to_string(), "t.lua:3: '=' expected near 'x'");
        assert_eq!(e.line(), 3);

        let l: LoadError = ChunkFormatError("truncated chunk".into()).into();
        assert_eq!(l.to_string(), "bad binary format (truncated chunk)");
    }
}
