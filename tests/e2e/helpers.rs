use lunac::compiler::compile;
use lunac::opcode::OpCode;
use lunac::proto::{Constant, Prototype};

/// Compile a Lua source string and return the main prototype.
pub fn compile_str(source: &str) -> Prototype {
    compile(source.as_bytes(), "test").unwrap_or_else(|e| {
        panic!("compile failed: {e}\nsource:\n{source}");
    })
}

/// Compile a Lua source string and expect an error.
pub fn compile_str_err(source: &str) -> String {
    match compile(source.as_bytes(), "test") {
        Err(e) => e.message,
        Ok(_) => panic!("expected compile error, got success\nsource:\n{source}"),
    }
}

/// Check if a prototype contains a specific opcode.
pub fn has_opcode(proto: &Prototype, op: OpCode) -> bool {
    proto.code.iter().any(|i| i.opcode() == op)
}

/// Count occurrences of an opcode in a prototype.
pub fn count_opcode(proto: &Prototype, op: OpCode) -> usize {
    proto.code.iter().filter(|i| i.opcode() == op).count()
}

/// Find the first instruction with a given opcode.
#[allow(dead_code)]
pub fn find_opcode(proto: &Prototype, op: OpCode) -> Option<usize> {
    proto.code.iter().position(|i| i.opcode() == op)
}

/// Get string constant value by index.
#[allow(dead_code)]
pub fn get_string_constant(proto: &Prototype, idx: usize) -> String {
    match &proto.constants[idx] {
        Constant::Str(s) => s.clone(),
        other => panic!("expected string constant, got {other:?}"),
    }
}

/// Get integer constant value by index.
#[allow(dead_code)]
pub fn get_int_constant(proto: &Prototype, idx: usize) -> i64 {
    match &proto.constants[idx] {
        Constant::Integer(i) => *i,
        other => panic!("expected integer constant, got {other:?}"),
    }
}
