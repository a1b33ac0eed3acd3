//! Compiled function prototypes.

use crate::opcode::Instruction;
use std::fmt;

/// A compile-time constant in a prototype's constant pool.
#[derive(Clone, Debug, PartialEq)]
pub enum Constant {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Str(String),
}

impl Constant {
    /// Pool-dedup key. Integers and floats never collide even when
    /// numerically equal; floats are keyed by bit pattern so -0.0 and 0.0
    /// stay distinct and NaN dedups against itself.
    pub fn key(&self) -> ConstantKey {
        match self {
            Constant::Nil => ConstantKey::Nil,
            Constant::Boolean(b) => ConstantKey::Boolean(*b),
            Constant::Integer(i) => ConstantKey::Integer(*i),
            Constant::Float(f) => ConstantKey::Float(f.to_bits()),
            Constant::Str(s) => ConstantKey::Str(s.clone()),
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Nil => write!(f, "nil"),
            Constant::Boolean(b) => write!(f, "{b}"),
            Constant::Integer(i) => write!(f, "{i}"),
            Constant::Float(x) => write!(f, "{x:?}"),
            Constant::Str(s) => write!(f, "{s:?}"),
        }
    }
}

/// Hashable identity of a [`Constant`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConstantKey {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(u64),
    Str(String),
}

/// Where a closure captures an upvalue from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpvalDesc {
    pub name: String,
    /// True if captured from the enclosing function's registers,
    /// false if forwarded from its upvalue list.
    pub in_stack: bool,
    pub index: u32,
}

/// Debug record for one local variable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalVar {
    pub name: String,
    /// First pc where the variable is live.
    pub start_pc: u32,
    /// First pc where the variable is dead.
    pub end_pc: u32,
}

/// A compiled function: bytecode, constants, debug info, nested prototypes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Prototype {
    pub code: Vec<Instruction>,
    pub constants: Vec<Constant>,
    pub protos: Vec<Prototype>,
    pub upvalues: Vec<UpvalDesc>,
    pub local_vars: Vec<LocalVar>,
    /// Source line of each instruction, 1:1 with `code`.
    pub line_info: Vec<u32>,
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack_size: u8,
    pub source: String,
    pub line_defined: u32,
    pub last_line_defined: u32,
}

impl Prototype {
    pub fn new(source: &str) -> Prototype {
        Prototype {
            // Registers 0 and 1 are always available.
            max_stack_size: 2,
            source: source.to_string(),
            ..Prototype::default()
        }
    }

    /// Append an instruction, recording its source line. Returns its pc.
    pub fn emit(&mut self, inst: Instruction, line: u32) -> usize {
        self.code.push(inst);
        self.line_info.push(line);
        self.code.len() - 1
    }

    /// Source line of the instruction at `pc`, or 0 if unknown.
    pub fn get_line(&self, pc: usize) -> u32 {
        self.line_info.get(pc).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::OpCode;

    #[test]
    fn test_emit_tracks_lines() {
        let mut p = Prototype::new("test");
        let pc0 = p.emit(Instruction::abc(OpCode::Move, 0, 1, 0), 3);
        let pc1 = p.emit(Instruction::abc(OpCode::Return, 0, 1, 0), 4);
        assert_eq!(pc0, 0);
        assert_eq!(pc1, 1);
        assert_eq!(p.get_line(0), 3);
        assert_eq!(p.get_line(1), 4);
        assert_eq!(p.get_line(99), 0);
    }

    #[test]
    fn test_constant_keys_separate_int_and_float() {
        assert_ne!(Constant::Integer(0).key(), Constant::Float(0.0).key());
        assert_ne!(Constant::Float(0.0).key(), Constant::Float(-0.0).key());
        assert_eq!(Constant::Float(f64::NAN).key(), Constant::Float(f64::NAN).key());
        assert_eq!(Constant::Integer(7).key(), Constant::Integer(7).key());
    }

    #[test]
    fn test_new_reserves_two_slots() {
        let p = Prototype::new("chunk");
        assert_eq!(p.max_stack_size, 2);
        assert!(p.code.is_empty());
        assert_eq!(p.source, "chunk");
    }
}
