use super::helpers::*;
use lunac::opcode::OpCode;
use lunac::proto::Constant;

#[test]
fn e2e_return_nil() {
    let proto = compile_str("return nil");
    assert!(has_opcode(&proto, OpCode::LoadNil));
}

#[test]
fn e2e_return_booleans() {
    let proto = compile_str("return true");
    assert!(has_opcode(&proto, OpCode::LoadBool));
    let proto = compile_str("return false");
    assert!(has_opcode(&proto, OpCode::LoadBool));
}

#[test]
fn e2e_return_integer() {
    let proto = compile_str("return 42");
    assert!(has_opcode(&proto, OpCode::LoadK));
    assert_eq!(get_int_constant(&proto, 0), 42);
}

#[test]
fn e2e_return_string() {
    let proto = compile_str("return \"hello world\"");
    assert!(has_opcode(&proto, OpCode::LoadK));
    assert_eq!(get_string_constant(&proto, 0), "hello world");
}

#[test]
fn e2e_arithmetic_folds_to_one_constant() {
    let proto = compile_str("local a = 1 + 2 * 3");
    assert_eq!(count_opcode(&proto, OpCode::LoadK), 1);
    assert!(!has_opcode(&proto, OpCode::Add));
    assert!(!has_opcode(&proto, OpCode::Mul));
    assert_eq!(get_int_constant(&proto, 0), 7);
}

#[test]
fn e2e_integer_division_folds_per_lua_semantics() {
    let proto = compile_str("local a = -7 // 2");
    assert_eq!(get_int_constant(&proto, 0), -4);
    let proto = compile_str("local a = -7 % 3");
    assert_eq!(get_int_constant(&proto, 0), 2);
}

#[test]
fn e2e_slash_folds_to_float() {
    let proto = compile_str("local a = 1 / 2");
    assert!(!has_opcode(&proto, OpCode::Div));
    assert_eq!(proto.constants[0], Constant::Float(0.5));
}

#[test]
fn e2e_division_by_zero_is_not_folded() {
    let proto = compile_str("local a = 1 / 0");
    assert!(has_opcode(&proto, OpCode::Div));
    let proto = compile_str("local a = 1 // 0");
    assert!(has_opcode(&proto, OpCode::IDiv));
    let proto = compile_str("local a = 1 % 0");
    assert!(has_opcode(&proto, OpCode::Mod));
}

#[test]
fn e2e_negative_zero_is_not_folded() {
    // -0.0 must be computed at run time to keep its sign.
    let proto = compile_str("local a = -0.0");
    assert!(has_opcode(&proto, OpCode::Unm));
}

#[test]
fn e2e_unary_minus_folds() {
    let proto = compile_str("local a = -42");
    assert!(!has_opcode(&proto, OpCode::Unm));
    assert_eq!(get_int_constant(&proto, 0), -42);
}

#[test]
fn e2e_bitwise_folds_on_integral_operands() {
    let proto = compile_str("local a = 6 & 3");
    assert!(!has_opcode(&proto, OpCode::BAnd));
    assert_eq!(get_int_constant(&proto, 0), 2);
    // 1.5 has no integer representation, so the AND survives to run time.
    let proto = compile_str("local a = 6 & 1.5");
    assert!(has_opcode(&proto, OpCode::BAnd));
}

#[test]
fn e2e_shift_by_64_folds_to_zero() {
    let proto = compile_str("local a = 1 << 64");
    assert_eq!(get_int_constant(&proto, 0), 0);
}

#[test]
fn e2e_arithmetic_on_locals_uses_registers() {
    let proto = compile_str("local a, b = 1, 2 local c = a + b");
    let pc = find_opcode(&proto, OpCode::Add).expect("ADD emitted");
    let inst = proto.code[pc];
    assert_eq!(inst.b(), 0);
    assert_eq!(inst.c(), 1);
}

#[test]
fn e2e_int_and_float_constants_stay_distinct() {
    let proto = compile_str("local a = 0 local b = 0.0");
    assert_eq!(proto.constants.len(), 2);
    assert_eq!(proto.constants[0], Constant::Integer(0));
    assert_eq!(proto.constants[1], Constant::Float(0.0));
}

#[test]
fn e2e_equal_constants_are_deduplicated() {
    let proto = compile_str("local a, b = \"x\", \"x\"");
    assert_eq!(proto.constants.len(), 1);
    assert_eq!(count_opcode(&proto, OpCode::LoadK), 2);
}

#[test]
fn e2e_concat_chain_emits_single_instruction() {
    let proto = compile_str("local a, b, c = 1, 2, 3 local s = a .. b .. c");
    assert_eq!(count_opcode(&proto, OpCode::Concat), 1);
    let pc = find_opcode(&proto, OpCode::Concat).unwrap();
    let inst = proto.code[pc];
    // CONCAT spans the whole register run b..c.
    assert_eq!(inst.c() - inst.b(), 2);
}

#[test]
fn e2e_comparison_materializes_loadbool_pair() {
    let proto = compile_str("local a, b = 1, 2 local x = a < b");
    assert!(has_opcode(&proto, OpCode::Lt));
    assert_eq!(count_opcode(&proto, OpCode::LoadBool), 2);
}

#[test]
fn e2e_greater_than_swaps_operands() {
    let proto = compile_str("local x = 1 local y = 2 local z = x > y");
    let pc = find_opcode(&proto, OpCode::Lt).expect("GT lowers to LT");
    let inst = proto.code[pc];
    assert_eq!(inst.b(), 1, "right operand first");
    assert_eq!(inst.c(), 0);
}

#[test]
fn e2e_not_equal_inverts_condition() {
    let proto = compile_str("local a, b = 1, 2 local x = a ~= b");
    let pc = find_opcode(&proto, OpCode::Eq).expect("NE lowers to EQ");
    assert_eq!(proto.code[pc].a(), 0);
}

#[test]
fn e2e_and_with_wanted_value_keeps_testset() {
    let proto = compile_str("local a = 1 local c = a and b");
    assert!(has_opcode(&proto, OpCode::TestSet));
}

#[test]
fn e2e_and_in_condition_demotes_to_test() {
    let proto = compile_str("if a and b then end");
    assert!(has_opcode(&proto, OpCode::Test));
    assert!(!has_opcode(&proto, OpCode::TestSet));
}

#[test]
fn e2e_not_before_condition_is_elided() {
    let proto = compile_str("if not x then return end");
    assert!(!has_opcode(&proto, OpCode::Not));
    let pc = find_opcode(&proto, OpCode::Test).expect("TEST emitted");
    assert_eq!(proto.code[pc].c(), 1, "condition inverted instead");
}

#[test]
fn e2e_not_on_constant_folds() {
    let proto = compile_str("local a = not nil");
    assert!(!has_opcode(&proto, OpCode::Not));
    assert!(has_opcode(&proto, OpCode::LoadBool));
}

#[test]
fn e2e_length_operator() {
    let proto = compile_str("local t = {} local n = #t");
    assert!(has_opcode(&proto, OpCode::Len));
}

#[test]
fn e2e_global_reads_go_through_env() {
    let proto = compile_str("return x");
    assert!(has_opcode(&proto, OpCode::GetTabUp));
    assert_eq!(proto.upvalues.len(), 1);
    assert_eq!(proto.upvalues[0].name, "_ENV");
}

#[test]
fn e2e_index_expression() {
    let proto = compile_str("local t = {} return t[1]");
    assert!(has_opcode(&proto, OpCode::GetTable));
}

#[test]
fn e2e_parentheses_truncate_to_one_value() {
    let proto = compile_str("return (f())");
    let pc = find_opcode(&proto, OpCode::Call).unwrap();
    assert_eq!(proto.code[pc].c(), 2, "call fixed to one result");
    assert!(!has_opcode(&proto, OpCode::TailCall));
}
