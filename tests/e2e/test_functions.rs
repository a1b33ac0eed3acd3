use super::helpers::*;
use lunac::opcode::OpCode;

#[test]
fn e2e_main_function_is_vararg_with_env() {
    let proto = compile_str("return");
    assert!(proto.is_vararg);
    assert_eq!(proto.num_params, 0);
    assert_eq!(proto.upvalues.len(), 1);
    assert_eq!(proto.upvalues[0].name, "_ENV");
    assert!(proto.upvalues[0].in_stack);
}

#[test]
fn e2e_function_definition_emits_closure() {
    let proto = compile_str("local function f() end");
    assert!(has_opcode(&proto, OpCode::Closure));
    assert_eq!(proto.protos.len(), 1);
}

#[test]
fn e2e_parameters_become_locals() {
    let proto = compile_str("local function f(a, b) return a + b end");
    let f = &proto.protos[0];
    assert_eq!(f.num_params, 2);
    assert!(!f.is_vararg);
    assert_eq!(f.local_vars[0].name, "a");
    assert_eq!(f.local_vars[1].name, "b");
}

#[test]
fn e2e_vararg_function() {
    let proto = compile_str("local function f(...) return ... end");
    let f = &proto.protos[0];
    assert!(f.is_vararg);
    assert!(has_opcode(f, OpCode::VarArg));
}

#[test]
fn e2e_upvalue_capture_from_stack() {
    let proto = compile_str("local x = 1 local function f() return x end");
    let f = &proto.protos[0];
    assert_eq!(f.upvalues.len(), 1);
    assert_eq!(f.upvalues[0].name, "x");
    assert!(f.upvalues[0].in_stack);
    assert_eq!(f.upvalues[0].index, 0);
    assert!(has_opcode(f, OpCode::GetUpval));
}

#[test]
fn e2e_upvalue_forwarded_through_two_levels() {
    let proto = compile_str(
        "local x = 1\n\
         local function outer()\n\
           local function inner() return x end\n\
           return inner\n\
         end",
    );
    let outer = &proto.protos[0];
    let inner = &outer.protos[0];
    assert!(outer.upvalues[0].in_stack, "captured from main's registers");
    assert!(!inner.upvalues[0].in_stack, "forwarded from outer's upvalues");
}

#[test]
fn e2e_upvalue_assignment() {
    let proto = compile_str("local x = 1 local function f() x = 2 end");
    assert!(has_opcode(&proto.protos[0], OpCode::SetUpval));
}

#[test]
fn e2e_local_function_can_recurse() {
    let proto = compile_str("local function f() return f() end");
    let f = &proto.protos[0];
    // f refers to itself through an upvalue on the enclosing stack slot.
    assert_eq!(f.upvalues[0].name, "f");
}

#[test]
fn e2e_method_definition_adds_self() {
    let proto = compile_str("local t = {} function t:m(a) return self, a end");
    let m = &proto.protos[0];
    assert_eq!(m.num_params, 2);
    assert_eq!(m.local_vars[0].name, "self");
    assert!(has_opcode(&proto, OpCode::SetTable));
}

#[test]
fn e2e_method_call_uses_self_opcode() {
    let proto = compile_str("local t = {} t:m(1)");
    assert!(has_opcode(&proto, OpCode::SelfOp));
    assert!(has_opcode(&proto, OpCode::Call));
}

#[test]
fn e2e_dotted_function_name() {
    let proto = compile_str("a.b.c = nil function a.b.c() end");
    assert_eq!(proto.protos.len(), 1);
    assert!(has_opcode(&proto, OpCode::SetTable));
}

#[test]
fn e2e_sole_trailing_call_becomes_tail_call() {
    let proto = compile_str("local function f() end return f()");
    assert!(has_opcode(&proto, OpCode::TailCall));
    assert!(!has_opcode(&proto, OpCode::Call));
}

#[test]
fn e2e_call_among_other_returns_is_not_tail() {
    let proto = compile_str("local function f() end return 1, f()");
    assert!(has_opcode(&proto, OpCode::Call));
    assert!(!has_opcode(&proto, OpCode::TailCall));
}

#[test]
fn e2e_multret_call_feeds_return() {
    let proto = compile_str("local function f() end return 1, f()");
    let call = find_opcode(&proto, OpCode::Call).unwrap();
    assert_eq!(proto.code[call].c(), 0, "keep all results");
    let ret = find_opcode(&proto, OpCode::Return).unwrap();
    assert_eq!(proto.code[ret].b(), 0, "open return count");
}

#[test]
fn e2e_call_adjusts_multiple_locals() {
    let proto = compile_str("local a, b, c = f()");
    let call = find_opcode(&proto, OpCode::Call).unwrap();
    assert_eq!(proto.code[call].c(), 4, "exactly three results");
}

#[test]
fn e2e_nested_function_line_ranges() {
    let proto = compile_str("local x\nlocal function f()\nend\n");
    let f = &proto.protos[0];
    assert_eq!(f.line_defined, 2);
    assert_eq!(f.last_line_defined, 3);
}

#[test]
fn e2e_argument_registers_collapse_after_call() {
    // Each call reuses the same registers once the previous statement ends.
    let proto = compile_str("f(1, 2) f(3, 4)");
    let calls: Vec<usize> = proto
        .code
        .iter()
        .enumerate()
        .filter(|(_, i)| i.opcode() == OpCode::Call)
        .map(|(pc, _)| pc)
        .collect();
    assert_eq!(calls.len(), 2);
    assert_eq!(proto.code[calls[0]].a(), proto.code[calls[1]].a());
}
