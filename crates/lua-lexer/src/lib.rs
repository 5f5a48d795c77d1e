//! `lua-lexer`: on-demand tokenizer over Lua source bytes.

pub mod lexer;
pub mod token;

pub use lexer::Lexer;
pub use token::{Token, TokenKind};
