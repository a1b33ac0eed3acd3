//! A single-pass compiler from Lua 5.3 source to Lua 5.3 bytecode.
//!
//! The parser and code generator are fused: statements and expressions are
//! lowered to instructions as they are parsed, with no syntax tree in
//! between. [`compile`] turns a source chunk into a [`proto::Prototype`]
//! ready for a VM or for inspection with [`disasm::disassemble`].

pub mod compiler;
pub mod disasm;
pub mod lexer;
pub mod opcode;
pub mod proto;
pub mod token;

pub use compiler::{compile, CompileError};
