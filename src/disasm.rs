/// Bytecode disassembler (luac -l style output).
use crate::opcode::{constant_index, is_constant, Instruction, InstructionFormat, OpArgMode, OpCode};
use crate::proto::{Constant, Prototype};
use std::fmt::Write;

/// Disassemble a complete prototype, nested functions included.
pub fn disassemble(proto: &Prototype) -> String {
    let mut out = String::new();
    disassemble_proto(&mut out, proto, 0);
    out
}

fn disassemble_proto(out: &mut String, proto: &Prototype, level: usize) {
    let indent = "  ".repeat(level);

    // Header
    let vararg = if proto.is_vararg { "+" } else { "" };
    writeln!(
        out,
        "{indent}function <{}:{}> ({}{vararg} params, {} slots, {} upvalues, {} constants, {} functions)",
        proto.source,
        proto.line_defined,
        proto.num_params,
        proto.max_stack_size,
        proto.upvalues.len(),
        proto.constants.len(),
        proto.protos.len(),
    )
    .unwrap();

    // Instructions
    for (pc, inst) in proto.code.iter().enumerate() {
        let line = proto.get_line(pc);
        let line_str = if line > 0 {
            format!("[{line}]")
        } else {
            "[-]".to_string()
        };
        write!(out, "{indent}\t{}\t{:>5}\t", pc + 1, line_str).unwrap();
        disasm_instruction(out, *inst, pc, proto);
        writeln!(out).unwrap();
    }

    // Constants
    if !proto.constants.is_empty() {
        writeln!(out, "{indent}constants ({}):", proto.constants.len()).unwrap();
        for (i, k) in proto.constants.iter().enumerate() {
            writeln!(out, "{indent}\t{i}\t{k}").unwrap();
        }
    }

    // Upvalues
    if !proto.upvalues.is_empty() {
        writeln!(out, "{indent}upvalues ({}):", proto.upvalues.len()).unwrap();
        for (i, up) in proto.upvalues.iter().enumerate() {
            writeln!(
                out,
                "{indent}\t{}\t{}\t{}\t{}",
                i,
                up.name,
                if up.in_stack { 1 } else { 0 },
                up.index
            )
            .unwrap();
        }
    }

    // Nested protos
    for (i, p) in proto.protos.iter().enumerate() {
        writeln!(out, "{indent}function [{i}]:").unwrap();
        disassemble_proto(out, p, level + 1);
    }
}

/// Disassemble a single instruction into the output string.
pub fn disasm_instruction(out: &mut String, inst: Instruction, pc: usize, proto: &Prototype) {
    let op = inst.opcode();
    let mode = op.mode();
    write!(out, "{:<12}", op.name()).unwrap();

    match mode.format {
        InstructionFormat::IABC => {
            write!(out, "{}", inst.a()).unwrap();
            if mode.b_mode != OpArgMode::NotUsed {
                write!(out, " {}", rk_operand(inst.b(), mode.b_mode)).unwrap();
            }
            if mode.c_mode != OpArgMode::NotUsed {
                write!(out, " {}", rk_operand(inst.c(), mode.c_mode)).unwrap();
            }
            annotate_rk_constants(out, inst, mode.b_mode, mode.c_mode, proto);
        }
        InstructionFormat::IABx => {
            write!(out, "{} {}", inst.a(), inst.bx()).unwrap();
            if op == OpCode::LoadK {
                if let Some(k) = proto.constants.get(inst.bx() as usize) {
                    write!(out, "\t; {k}").unwrap();
                }
            } else if op == OpCode::Closure {
                write!(out, "\t; function [{}]", inst.bx()).unwrap();
            }
        }
        InstructionFormat::IAsBx => {
            write!(out, "{} {}", inst.a(), inst.sbx()).unwrap();
            // Jump destination as a 1-based pc, matching the listing.
            write!(out, "\t; to {}", pc as i64 + 2 + inst.sbx() as i64).unwrap();
        }
        InstructionFormat::IAx => {
            write!(out, "{}", inst.ax_field()).unwrap();
        }
    }
}

/// Render an RK operand: constants print as `K(i)`, registers as the
/// bare number.
fn rk_operand(v: u32, mode: OpArgMode) -> String {
    if mode == OpArgMode::RegOrConst && is_constant(v) {
        format!("K({})", constant_index(v))
    } else {
        v.to_string()
    }
}

/// Trailing comment spelling out the constants named by RK operands.
fn annotate_rk_constants(
    out: &mut String,
    inst: Instruction,
    b_mode: OpArgMode,
    c_mode: OpArgMode,
    proto: &Prototype,
) {
    let mut named = Vec::new();
    if b_mode == OpArgMode::RegOrConst && is_constant(inst.b()) {
        if let Some(k) = proto.constants.get(constant_index(inst.b()) as usize) {
            named.push(k);
        }
    }
    if c_mode == OpArgMode::RegOrConst && is_constant(inst.c()) {
        if let Some(k) = proto.constants.get(constant_index(inst.c()) as usize) {
            named.push(k);
        }
    }
    if !named.is_empty() {
        write!(out, "\t;").unwrap();
        for k in named {
            write!(out, " {k}").unwrap();
        }
    }
}
