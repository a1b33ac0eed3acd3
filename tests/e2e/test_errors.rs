use super::helpers::*;

#[test]
fn e2e_error_break_outside_loop() {
    let err = compile_str_err("break");
    assert_eq!(err, "<break> at line 1 not inside a loop");
}

#[test]
fn e2e_error_break_in_plain_block_is_not_a_loop() {
    let err = compile_str_err("do break end");
    assert_eq!(err, "<break> at line 1 not inside a loop");
}

#[test]
fn e2e_error_undefined_goto() {
    let err = compile_str_err("goto nowhere");
    assert_eq!(err, "no visible label 'nowhere' for <goto> at line 1");
}

#[test]
fn e2e_error_goto_into_local_scope() {
    let err = compile_str_err("goto l\nlocal x = 1\n::l::\nlocal y = 2");
    assert_eq!(err, "<goto l> at line 1 jumps into the scope of local 'x'");
}

#[test]
fn e2e_error_duplicate_label() {
    let err = compile_str_err("::x:: ::x::");
    assert_eq!(err, "label 'x' already defined on line 1");
}

#[test]
fn e2e_error_unclosed_if_names_opening_line() {
    let err = compile_str_err("if x then\nreturn\n");
    assert_eq!(err, "'end' expected (to close 'if' at line 1) near '<eof>'");
}

#[test]
fn e2e_error_unclosed_if_on_same_line() {
    let err = compile_str_err("if x then");
    assert_eq!(err, "'end' expected near '<eof>'");
}

#[test]
fn e2e_error_missing_name() {
    let err = compile_str_err("local = 1");
    assert!(err.contains("<name> expected"));
}

#[test]
fn e2e_error_for_without_assign_or_in() {
    let err = compile_str_err("for x do end");
    assert!(err.contains("'=' or 'in' expected"));
}

#[test]
fn e2e_error_vararg_outside_vararg_function() {
    let err = compile_str_err("local function f() return ... end");
    assert!(err.contains("cannot use '...' outside a vararg function"));
}

#[test]
fn e2e_error_unexpected_symbol() {
    let err = compile_str_err("return )");
    assert!(err.contains("unexpected symbol"));
}

#[test]
fn e2e_error_expression_as_statement() {
    let err = compile_str_err("x == 1");
    assert!(err.contains("syntax error near '=='"));
}

#[test]
fn e2e_error_deep_nesting_is_bounded() {
    let mut src = String::from("return ");
    for _ in 0..300 {
        src.push('(');
    }
    src.push('1');
    for _ in 0..300 {
        src.push(')');
    }
    let err = compile_str_err(&src);
    assert!(err.contains("chunk has too many syntax levels"));
}

#[test]
fn e2e_error_expression_too_complex() {
    // 300 call arguments are all live at once, more registers than an
    // instruction operand can name.
    let args: Vec<String> = (0..300).map(|i| i.to_string()).collect();
    let src = format!("f({})", args.join(", "));
    let err = compile_str_err(&src);
    assert!(err.contains("function or expression too complex"));
}

#[test]
fn e2e_error_too_many_locals() {
    let mut src = String::new();
    for i in 0..201 {
        src.push_str(&format!("local x{i}\n"));
    }
    let err = compile_str_err(&src);
    assert!(err.contains("too many local variables"));
}

#[test]
fn e2e_error_unfinished_string() {
    let err = compile_str_err("local x = \"abc");
    assert!(err.contains("unfinished string"));
}

#[test]
fn e2e_error_malformed_number() {
    let err = compile_str_err("local x = 1e");
    assert!(err.contains("malformed number"));
}

#[test]
fn e2e_errors_carry_line_numbers() {
    let err = match lunac::compile(b"local a\nlocal b\nbreak", "test") {
        Err(e) => e,
        Ok(_) => panic!("expected error"),
    };
    assert_eq!(err.line, 3);
    assert_eq!(err.to_string(), format!("{}: {}", err.line, err.message));
}
