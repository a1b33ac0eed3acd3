use super::helpers::*;
use lunac::opcode::OpCode;

#[test]
fn e2e_adjacent_local_nils_merge_into_one_loadnil() {
    let proto = compile_str("local a local b");
    assert_eq!(count_opcode(&proto, OpCode::LoadNil), 1);
    let pc = find_opcode(&proto, OpCode::LoadNil).unwrap();
    assert_eq!(proto.code[pc].b(), 1, "covers two registers");
}

#[test]
fn e2e_missing_values_pad_with_nil() {
    let proto = compile_str("local a, b, c = 1");
    let pc = find_opcode(&proto, OpCode::LoadNil).unwrap();
    let inst = proto.code[pc];
    assert_eq!(inst.a(), 1);
    assert_eq!(inst.b(), 1);
}

#[test]
fn e2e_statements_release_scratch_registers() {
    let proto = compile_str("local a = 1 local b = 2 local c = 3");
    assert_eq!(proto.max_stack_size, 3);
}

#[test]
fn e2e_implicit_return_closes_every_function() {
    let proto = compile_str("local x = 1");
    let last = *proto.code.last().unwrap();
    assert_eq!(last.opcode(), OpCode::Return);
    assert_eq!(last.a(), 0);
    assert_eq!(last.b(), 1);
}

#[test]
fn e2e_return_two_values() {
    let proto = compile_str("return 1, 2");
    let pc = find_opcode(&proto, OpCode::Return).unwrap();
    assert_eq!(proto.code[pc].b(), 3);
}

#[test]
fn e2e_global_assignment_uses_settabup() {
    let proto = compile_str("x = 1");
    assert!(has_opcode(&proto, OpCode::SetTabUp));
}

#[test]
fn e2e_while_back_edge_targets_condition() {
    let proto = compile_str("while x do end");
    // The unconditional back edge must land on the first condition
    // instruction.
    let back = proto
        .code
        .iter()
        .enumerate()
        .find(|(_, i)| i.opcode() == OpCode::Jmp && i.sbx() < 0)
        .expect("back edge");
    assert_eq!(back.0 as i32 + 1 + back.1.sbx(), 0);
}

#[test]
fn e2e_while_true_has_no_exit_jump() {
    let proto = compile_str("while true do end");
    assert_eq!(count_opcode(&proto, OpCode::Jmp), 1);
}

#[test]
fn e2e_repeat_condition_sees_body_locals() {
    let proto = compile_str("repeat local done = true until done");
    assert!(has_opcode(&proto, OpCode::Test));
}

#[test]
fn e2e_numeric_for_shape() {
    let proto = compile_str("for i = 1, 10 do end");
    assert!(has_opcode(&proto, OpCode::ForPrep));
    assert!(has_opcode(&proto, OpCode::ForLoop));
    // Default step 1 dedups against the initial value constant.
    assert_eq!(count_opcode(&proto, OpCode::LoadK), 3);
    assert_eq!(proto.constants.len(), 2);
}

#[test]
fn e2e_numeric_for_control_variables_are_hidden() {
    let proto = compile_str("for i = 1, 10 do local x = i end");
    let names: Vec<&str> = proto.local_vars.iter().map(|v| v.name.as_str()).collect();
    assert!(names.contains(&"(for index)"));
    assert!(names.contains(&"(for limit)"));
    assert!(names.contains(&"(for step)"));
    assert!(names.contains(&"i"));
}

#[test]
fn e2e_generic_for_shape() {
    let proto = compile_str("for k, v in pairs(t) do end");
    assert!(has_opcode(&proto, OpCode::TForCall));
    assert!(has_opcode(&proto, OpCode::TForLoop));
    let pc = find_opcode(&proto, OpCode::TForCall).unwrap();
    assert_eq!(proto.code[pc].c(), 2, "two declared variables");
}

#[test]
fn e2e_break_compiles_inside_loop() {
    compile_str("while true do break end");
    compile_str("for i = 1, 3 do if i == 2 then break end end");
}

#[test]
fn e2e_goto_forward_and_backward() {
    compile_str("::top:: do goto top end");
    compile_str("do goto done end ::done::");
}

#[test]
fn e2e_goto_as_whole_then_block() {
    compile_str("for i = 1, 3 do if i == 2 then goto continue end ::continue:: end");
}

#[test]
fn e2e_block_with_captured_local_closes_upvalues() {
    let proto = compile_str("do local x = 1 local function f() return x end end");
    let close = proto
        .code
        .iter()
        .find(|i| i.opcode() == OpCode::Jmp && i.a() > 0);
    assert!(close.is_some(), "leaving the block closes x");
}

#[test]
fn e2e_constructor_array_part() {
    let proto = compile_str("local t = {1, 2, 3}");
    assert!(has_opcode(&proto, OpCode::NewTable));
    let pc = find_opcode(&proto, OpCode::SetList).unwrap();
    assert_eq!(proto.code[pc].b(), 3);
    let nt = find_opcode(&proto, OpCode::NewTable).unwrap();
    assert_eq!(proto.code[nt].b(), 3, "array size hint");
}

#[test]
fn e2e_constructor_record_part() {
    let proto = compile_str("local t = {x = 1, [2] = 3}");
    assert_eq!(count_opcode(&proto, OpCode::SetTable), 2);
    assert!(!has_opcode(&proto, OpCode::SetList));
}

#[test]
fn e2e_constructor_flushes_every_fifty_items() {
    let items: Vec<String> = (1..=60).map(|i| i.to_string()).collect();
    let src = format!("local t = {{{}}}", items.join(", "));
    let proto = compile_str(&src);
    assert_eq!(count_opcode(&proto, OpCode::SetList), 2);
}

#[test]
fn e2e_constructor_trailing_call_keeps_all_results() {
    let proto = compile_str("local t = {1, f()}");
    let pc = find_opcode(&proto, OpCode::SetList).unwrap();
    assert_eq!(proto.code[pc].b(), 0, "open item count");
    let call = find_opcode(&proto, OpCode::Call).unwrap();
    assert_eq!(proto.code[call].c(), 0, "call keeps all results");
}

#[test]
fn e2e_multiple_assignment_swap() {
    let proto = compile_str("local a, b = 1, 2 a, b = b, a");
    assert!(has_opcode(&proto, OpCode::Move));
}

#[test]
fn e2e_assignment_conflict_saves_aliased_index() {
    // `i` is both an assignment target and the index of `a[i]`; the old
    // value must be copied aside before the stores happen.
    let proto = compile_str("local a = {} local i = 1 a[i], i = 10, 20");
    assert!(has_opcode(&proto, OpCode::Move));
    assert_eq!(count_opcode(&proto, OpCode::SetTable), 1);
}

#[test]
fn e2e_call_statement_discards_results() {
    let proto = compile_str("print(1)");
    let pc = find_opcode(&proto, OpCode::Call).unwrap();
    assert_eq!(proto.code[pc].c(), 1);
}

#[test]
fn e2e_string_and_table_call_sugar() {
    let proto = compile_str("print \"hi\" print {1}");
    assert_eq!(count_opcode(&proto, OpCode::Call), 2);
}

#[test]
fn e2e_label_at_block_end_accepts_goto_over_local() {
    // The label ends the block, so jumping over `x` is fine.
    compile_str("do goto l local x = 1 ::l:: end");
}
