//! Single-pass compiler from Lua 5.3 source to bytecode.
//!
//! Parsing and code generation are fused: the recursive-descent parser calls
//! straight into the [`FuncState`] code generator, so no syntax tree is ever
//! built. Nested function bodies push a fresh `FuncState` onto the stack and
//! pop it when the body closes.

pub mod code;
pub mod expr;
pub mod scope;

use thiserror::Error;

use crate::compiler::code::{int_to_float_byte, FuncState, FIELDS_PER_FLUSH, MULTRET};
use crate::compiler::expr::{BinOp, ExprDesc, ExprKind, UnOp, NO_JUMP, UNARY_PRIORITY};
use crate::lexer::{LexError, Lexer};
use crate::opcode::OpCode;
use crate::proto::Prototype;
use crate::token::Token;

/// Compilation failure. The first error aborts the unit.
#[derive(Clone, Debug, PartialEq, Error)]
#[error("{line}: {message}")]
pub struct CompileError {
    pub message: String,
    pub line: u32,
}

impl From<LexError> for CompileError {
    fn from(e: LexError) -> CompileError {
        CompileError {
            message: e.message,
            line: e.line,
        }
    }
}

pub(crate) type Result<T> = std::result::Result<T, CompileError>;

/// Recursion bound for nested expressions, statements and assignments.
const MAX_NESTING: u32 = 200;

/// Compile a chunk into its main function prototype. The main function is
/// always a vararg function closing over `_ENV` as upvalue 0.
pub fn compile(source: &[u8], chunk_name: &str) -> Result<Prototype> {
    let lexer = Lexer::new(source)?;
    let mut compiler = Compiler {
        lexer,
        funcs: Vec::new(),
        nesting: 0,
        chunk_name: chunk_name.to_string(),
    };
    compiler.main_function()
}

struct Compiler<'a> {
    lexer: Lexer<'a>,
    /// Enclosing functions, innermost last.
    funcs: Vec<FuncState>,
    nesting: u32,
    chunk_name: String,
}

impl<'a> Compiler<'a> {
    fn fs(&self) -> &FuncState {
        self.funcs.last().expect("no function being compiled")
    }

    fn fs_mut(&mut self) -> &mut FuncState {
        self.funcs.last_mut().expect("no function being compiled")
    }

    // ---- Token plumbing ----

    fn advance(&mut self) -> Result<Token> {
        let tok = self.lexer.advance()?;
        let line = self.lexer.lastline;
        if let Some(fs) = self.funcs.last_mut() {
            fs.line = line;
        }
        Ok(tok)
    }

    fn syntax_error(&self, msg: &str) -> CompileError {
        CompileError {
            message: format!("{msg} near '{}'", self.lexer.current()),
            line: self.lexer.line(),
        }
    }

    fn error_expected(&self, what: &Token) -> CompileError {
        self.syntax_error(&format!("'{what}' expected"))
    }

    fn check(&self, what: &Token) -> Result<()> {
        if self.lexer.current() == what {
            Ok(())
        } else {
            Err(self.error_expected(what))
        }
    }

    fn check_next(&mut self, what: &Token) -> Result<()> {
        self.check(what)?;
        self.advance()?;
        Ok(())
    }

    fn test_next(&mut self, what: &Token) -> Result<bool> {
        if self.lexer.current() == what {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn check_match(&mut self, what: &Token, who: &Token, where_line: u32) -> Result<()> {
        if self.test_next(what)? {
            return Ok(());
        }
        if where_line == self.lexer.line() {
            Err(self.error_expected(what))
        } else {
            Err(self.syntax_error(&format!(
                "'{what}' expected (to close '{who}' at line {where_line})"
            )))
        }
    }

    fn check_name(&mut self) -> Result<String> {
        match self.lexer.current() {
            Token::Name(n) => {
                let n = n.clone();
                self.advance()?;
                Ok(n)
            }
            _ => Err(self.syntax_error("<name> expected")),
        }
    }

    fn enter_level(&mut self) -> Result<()> {
        self.nesting += 1;
        if self.nesting > MAX_NESTING {
            return Err(CompileError {
                message: "chunk has too many syntax levels".to_string(),
                line: self.lexer.line(),
            });
        }
        Ok(())
    }

    fn leave_level(&mut self) {
        self.nesting -= 1;
    }

    // ---- Function open/close ----

    fn main_function(&mut self) -> Result<Prototype> {
        let chunk_name = self.chunk_name.clone();
        let mut fs = FuncState::new(&chunk_name, 0);
        fs.proto.is_vararg = true;
        fs.enter_block(false);
        // The environment is upvalue 0 of the main function, captured as if
        // it were local 0 of an enclosing scope.
        fs.make_upvalue("_ENV", true, 0)?;
        self.funcs.push(fs);
        self.statement_list()?;
        self.check(&Token::Eof)?;
        let mut fs = self.close_function_state()?;
        debug_assert!(self.funcs.is_empty());
        fs.proto.last_line_defined = 0;
        Ok(fs.proto)
    }

    fn open_function(&mut self, line: u32) {
        let chunk_name = self.chunk_name.clone();
        let mut fs = FuncState::new(&chunk_name, line);
        fs.line = self.lexer.lastline;
        fs.enter_block(false);
        self.funcs.push(fs);
    }

    /// Emit the implicit return, unwind the block stack and pop the state.
    fn close_function_state(&mut self) -> Result<FuncState> {
        let fs = self.fs_mut();
        fs.ret(0, 0)?;
        fs.leave_block()?;
        debug_assert!(fs.blocks.is_empty());
        debug_assert!(fs.pending_gotos.is_empty());
        Ok(self.funcs.pop().expect("no function to close"))
    }

    /// Finish a nested function body: pop its state, attach the prototype to
    /// the parent and emit CLOSURE there.
    fn close_function(&mut self) -> Result<ExprDesc> {
        let child = self.close_function_state()?;
        let parent = self.fs_mut();
        parent.proto.protos.push(child.proto);
        let idx = parent.proto.protos.len() as u32 - 1;
        let pc = parent.emit_abx(OpCode::Closure, 0, idx)?;
        parent.exp_to_next_reg(ExprDesc::new(ExprKind::Reloc(pc)))
    }

    /// body -> '(' parlist ')' block END
    fn body(&mut self, is_method: bool, line: u32) -> Result<ExprDesc> {
        self.open_function(line);
        self.check_next(&Token::LParen)?;
        if is_method {
            let fs = self.fs_mut();
            fs.make_local_var("self")?;
            fs.adjust_local_vars(1);
        }
        self.parameter_list()?;
        self.check_next(&Token::RParen)?;
        self.statement_list()?;
        self.fs_mut().proto.last_line_defined = self.lexer.line();
        self.check_match(&Token::End, &Token::Function, line)?;
        self.close_function()
    }

    fn parameter_list(&mut self) -> Result<()> {
        let mut nparams = 0u32;
        if self.lexer.current() != &Token::RParen {
            loop {
                match self.lexer.current() {
                    Token::Name(_) => {
                        let name = self.check_name()?;
                        self.fs_mut().make_local_var(&name)?;
                        nparams += 1;
                    }
                    Token::DotDotDot => {
                        self.advance()?;
                        self.fs_mut().proto.is_vararg = true;
                    }
                    _ => return Err(self.syntax_error("<name> or '...' expected")),
                }
                if self.fs().proto.is_vararg || !self.test_next(&Token::Comma)? {
                    break;
                }
            }
        }
        let fs = self.fs_mut();
        fs.adjust_local_vars(nparams);
        fs.proto.num_params = fs.nactive as u8;
        fs.reserve_regs(fs.nactive)
    }

    // ---- Variables ----

    fn code_string(&mut self, s: &str) -> Result<ExprDesc> {
        let k = self.fs_mut().string_constant(s)?;
        Ok(ExprDesc::new(ExprKind::Constant(k)))
    }

    /// Resolve `name` at function nesting `level`, creating upvalues down
    /// the chain as needed. `None` means the name is global.
    fn resolve_var(&mut self, level: usize, name: &str, base: bool) -> Result<Option<ExprDesc>> {
        let fs = &mut self.funcs[level];
        if let Some(reg) = fs.search_local(name) {
            if !base {
                // The local is captured by an inner function.
                fs.mark_block_upvalue(reg);
            }
            return Ok(Some(ExprDesc::new(ExprKind::Local(reg))));
        }
        if let Some(idx) = fs.search_upvalue(name) {
            return Ok(Some(ExprDesc::new(ExprKind::Upval(idx))));
        }
        if level == 0 {
            return Ok(None);
        }
        match self.resolve_var(level - 1, name, false)? {
            None => Ok(None),
            Some(outer) => {
                let (in_stack, index) = match outer.kind {
                    ExprKind::Local(r) => (true, r),
                    ExprKind::Upval(u) => (false, u),
                    _ => unreachable!(),
                };
                let idx = self.funcs[level].make_upvalue(name, in_stack, index)?;
                Ok(Some(ExprDesc::new(ExprKind::Upval(idx))))
            }
        }
    }

    /// Compile a bare name: local, upvalue, or `_ENV[name]` for globals.
    fn single_variable(&mut self) -> Result<ExprDesc> {
        let name = self.check_name()?;
        let top = self.funcs.len() - 1;
        match self.resolve_var(top, &name, true)? {
            Some(e) => Ok(e),
            None => {
                let env = self
                    .resolve_var(top, "_ENV", true)?
                    .expect("_ENV must always be visible");
                let key = self.code_string(&name)?;
                self.fs_mut().indexed(env, key)
            }
        }
    }

    // ---- Expressions ----

    fn expression(&mut self) -> Result<ExprDesc> {
        let (e, _) = self.sub_expression(0)?;
        Ok(e)
    }

    /// Precedence climbing: parse one operand and fold in binary operators
    /// binding tighter than `limit`.
    fn sub_expression(&mut self, limit: u8) -> Result<(ExprDesc, Option<BinOp>)> {
        self.enter_level()?;
        let mut e = if let Some(uop) = unary_op(self.lexer.current()) {
            let line = self.lexer.line();
            self.advance()?;
            let (operand, _) = self.sub_expression(UNARY_PRIORITY)?;
            self.fs_mut().prefix(uop, operand, line)?
        } else {
            self.simple_expression()?
        };
        let mut op = binary_op(self.lexer.current());
        while let Some(current) = op {
            if current.priority().0 <= limit {
                break;
            }
            let line = self.lexer.line();
            self.advance()?;
            let e1 = self.fs_mut().infix(current, e)?;
            let (e2, next) = self.sub_expression(current.priority().1)?;
            e = self.fs_mut().posfix(current, e1, e2, line)?;
            op = next;
        }
        self.leave_level();
        Ok((e, op))
    }

    fn simple_expression(&mut self) -> Result<ExprDesc> {
        let e = match self.lexer.current().clone() {
            Token::Integer(i) => ExprDesc::new(ExprKind::Int(i)),
            Token::Float(f) => ExprDesc::new(ExprKind::Float(f)),
            Token::Str(s) => self.code_string(&s)?,
            Token::Nil => ExprDesc::new(ExprKind::Nil),
            Token::True => ExprDesc::new(ExprKind::True),
            Token::False => ExprDesc::new(ExprKind::False),
            Token::DotDotDot => {
                if !self.fs().proto.is_vararg {
                    return Err(self.syntax_error("cannot use '...' outside a vararg function"));
                }
                let pc = self.fs_mut().emit_abc(OpCode::VarArg, 0, 1, 0)?;
                ExprDesc::new(ExprKind::Vararg(pc))
            }
            Token::LBrace => return self.constructor(),
            Token::Function => {
                self.advance()?;
                return self.body(false, self.lexer.lastline);
            }
            _ => return self.suffixed_expression(),
        };
        self.advance()?;
        Ok(e)
    }

    /// primaryexp -> NAME | '(' expr ')'
    fn primary_expression(&mut self) -> Result<ExprDesc> {
        match self.lexer.current() {
            Token::LParen => {
                let line = self.lexer.line();
                self.advance()?;
                let e = self.expression()?;
                self.check_match(&Token::RParen, &Token::LParen, line)?;
                // Parentheses truncate calls and vararg to one value.
                self.fs_mut().discharge_vars(e)
            }
            Token::Name(_) => self.single_variable(),
            _ => Err(self.syntax_error("unexpected symbol")),
        }
    }

    /// suffixedexp -> primaryexp { '.' NAME | '[' exp ']' | ':' NAME funcargs | funcargs }
    fn suffixed_expression(&mut self) -> Result<ExprDesc> {
        let line = self.lexer.line();
        let mut e = self.primary_expression()?;
        loop {
            match self.lexer.current() {
                Token::Dot => {
                    e = self.field_selector(e)?;
                }
                Token::LBracket => {
                    let t = self.fs_mut().exp_to_any_reg_up(e)?;
                    let key = self.index_expression()?;
                    e = self.fs_mut().indexed(t, key)?;
                }
                Token::Colon => {
                    self.advance()?;
                    let name = self.check_name()?;
                    let key = self.code_string(&name)?;
                    e = self.fs_mut().self_op(e, key)?;
                    e = self.function_arguments(e, line)?;
                }
                Token::LParen | Token::Str(_) | Token::LBrace => {
                    e = self.fs_mut().exp_to_next_reg(e)?;
                    e = self.function_arguments(e, line)?;
                }
                _ => return Ok(e),
            }
        }
    }

    /// fieldsel -> ['.' | ':'] NAME
    fn field_selector(&mut self, e: ExprDesc) -> Result<ExprDesc> {
        let t = self.fs_mut().exp_to_any_reg_up(e)?;
        self.advance()?; // skip the dot or colon
        let name = self.check_name()?;
        let key = self.code_string(&name)?;
        self.fs_mut().indexed(t, key)
    }

    /// index -> '[' expr ']'
    fn index_expression(&mut self) -> Result<ExprDesc> {
        self.advance()?; // skip '['
        let e = self.expression()?;
        let e = self.fs_mut().exp_to_val(e)?;
        self.check_next(&Token::RBracket)?;
        Ok(e)
    }

    fn function_arguments(&mut self, f: ExprDesc, line: u32) -> Result<ExprDesc> {
        let args = match self.lexer.current().clone() {
            Token::LParen => {
                self.advance()?;
                if self.lexer.current() == &Token::RParen {
                    let args = ExprDesc::void();
                    self.advance()?;
                    args
                } else {
                    let (args, _) = self.expression_list()?;
                    if args.has_multiple_returns() {
                        self.fs_mut().set_returns(&args, MULTRET)?;
                    }
                    self.check_match(&Token::RParen, &Token::LParen, line)?;
                    args
                }
            }
            Token::LBrace => self.constructor()?,
            Token::Str(s) => {
                let args = self.code_string(&s)?;
                self.advance()?;
                args
            }
            _ => return Err(self.syntax_error("function arguments expected")),
        };
        let base = match f.kind {
            ExprKind::NonReloc(r) => r,
            _ => unreachable!("callee must be in a register"),
        };
        let fs = self.fs_mut();
        let nparams = if args.has_multiple_returns() {
            MULTRET
        } else {
            if args.kind != ExprKind::Void {
                fs.exp_to_next_reg(args)?;
            }
            (fs.free_reg - (base + 1)) as i32
        };
        let pc = fs.emit_abc(OpCode::Call, base, (nparams + 1) as u32, 2)?;
        fs.fix_line(line);
        // The call consumes the callee and arguments and leaves one result.
        fs.free_reg = base + 1;
        Ok(ExprDesc::new(ExprKind::Call(pc)))
    }

    /// explist -> expr { ',' expr }. Returns the last expression unclosed
    /// and the count.
    fn expression_list(&mut self) -> Result<(ExprDesc, u32)> {
        let mut n = 1;
        let mut e = self.expression()?;
        while self.test_next(&Token::Comma)? {
            self.fs_mut().exp_to_next_reg(e)?;
            e = self.expression()?;
            n += 1;
        }
        Ok((e, n))
    }

    // ---- Table constructors ----

    fn constructor(&mut self) -> Result<ExprDesc> {
        let line = self.lexer.line();
        let pc = self.fs_mut().emit_abc(OpCode::NewTable, 0, 0, 0)?;
        let t = self
            .fs_mut()
            .exp_to_next_reg(ExprDesc::new(ExprKind::Reloc(pc)))?;
        let table_reg = match t.kind {
            ExprKind::NonReloc(r) => r,
            _ => unreachable!(),
        };
        let mut na = 0u32; // array items so far
        let mut nh = 0u32; // hash items so far
        let mut to_store = 0u32; // array items not yet flushed
        let mut last = ExprDesc::void(); // last unflushed array item
        self.check_next(&Token::LBrace)?;
        loop {
            debug_assert!(last.kind == ExprKind::Void || to_store > 0);
            if self.lexer.current() == &Token::RBrace {
                break;
            }
            // Flush the previous array item before reading the next field.
            if last.kind != ExprKind::Void {
                self.fs_mut().exp_to_next_reg(last)?;
                last = ExprDesc::void();
                if to_store == FIELDS_PER_FLUSH {
                    self.fs_mut().set_list(table_reg, na, to_store as i32)?;
                    to_store = 0;
                }
            }
            // field -> listfield | recfield
            let is_record = match self.lexer.current() {
                Token::Name(_) => self.lexer.lookahead()? == &Token::Assign,
                Token::LBracket => true,
                _ => false,
            };
            if is_record {
                let reg = self.fs().free_reg;
                let key = if matches!(self.lexer.current(), Token::Name(_)) {
                    let name = self.check_name()?;
                    self.code_string(&name)?
                } else {
                    self.index_expression()?
                };
                nh += 1;
                self.check_next(&Token::Assign)?;
                let (_, rk_key) = self.fs_mut().exp_to_rk(key)?;
                let value = self.expression()?;
                let (_, rk_val) = self.fs_mut().exp_to_rk(value)?;
                let fs = self.fs_mut();
                fs.emit_abc(OpCode::SetTable, table_reg, rk_key, rk_val)?;
                fs.free_reg = reg;
            } else {
                last = self.expression()?;
                na += 1;
                to_store += 1;
            }
            if !self.test_next(&Token::Comma)? && !self.test_next(&Token::Semi)? {
                break;
            }
        }
        self.check_match(&Token::RBrace, &Token::LBrace, line)?;
        if to_store > 0 {
            let fs = self.fs_mut();
            if last.has_multiple_returns() {
                fs.set_returns(&last, MULTRET)?;
                fs.set_list(table_reg, na, MULTRET)?;
                na -= 1; // the last expression provides an unknown count
            } else {
                if last.kind != ExprKind::Void {
                    fs.exp_to_next_reg(last)?;
                }
                fs.set_list(table_reg, na, to_store as i32)?;
            }
        }
        let inst = self.fs_mut().instr_mut(pc);
        inst.set_b(int_to_float_byte(na)); // initial array size
        inst.set_c(int_to_float_byte(nh)); // initial hash size
        Ok(t)
    }

    // ---- Statements ----

    fn block_follow(&self, with_until: bool) -> bool {
        match self.lexer.current() {
            Token::Else | Token::ElseIf | Token::End | Token::Eof => true,
            Token::Until => with_until,
            _ => false,
        }
    }

    fn statement_list(&mut self) -> Result<()> {
        while !self.block_follow(true) {
            if self.lexer.current() == &Token::Return {
                self.statement()?;
                return Ok(()); // 'return' must be the last statement
            }
            self.statement()?;
        }
        Ok(())
    }

    fn block(&mut self) -> Result<()> {
        self.fs_mut().enter_block(false);
        self.statement_list()?;
        self.fs_mut().leave_block()
    }

    fn statement(&mut self) -> Result<()> {
        let line = self.lexer.line();
        self.enter_level()?;
        match self.lexer.current() {
            Token::Semi => {
                self.advance()?;
            }
            Token::If => self.if_statement(line)?,
            Token::While => self.while_statement(line)?,
            Token::Do => {
                self.advance()?;
                self.block()?;
                self.check_match(&Token::End, &Token::Do, line)?;
            }
            Token::For => self.for_statement(line)?,
            Token::Repeat => self.repeat_statement(line)?,
            Token::Function => self.function_statement(line)?,
            Token::Local => {
                self.advance()?;
                if self.test_next(&Token::Function)? {
                    self.local_function()?;
                } else {
                    self.local_statement()?;
                }
            }
            Token::DoubleColon => {
                self.advance()?;
                let name = self.check_name()?;
                self.label_statement(name, line)?;
            }
            Token::Return => {
                self.advance()?;
                self.return_statement()?;
            }
            Token::Break | Token::Goto => {
                let pc = self.fs_mut().jump()?;
                self.goto_statement(pc)?;
            }
            _ => self.expression_statement()?,
        }
        let fs = self.fs_mut();
        debug_assert!(fs.proto.max_stack_size as u32 >= fs.free_reg);
        debug_assert!(fs.free_reg >= fs.nactive);
        fs.free_reg = fs.nactive; // statements leave no values on the stack
        self.leave_level();
        Ok(())
    }

    /// cond -> expr, leaving the false list open. A literal `nil` behaves
    /// like `false`.
    fn condition(&mut self) -> Result<i32> {
        let mut e = self.expression()?;
        if e.kind == ExprKind::Nil {
            e.kind = ExprKind::False;
        }
        let e = self.fs_mut().go_if_true(e)?;
        Ok(e.f)
    }

    fn while_statement(&mut self, line: u32) -> Result<()> {
        self.advance()?; // skip 'while'
        let top = self.fs_mut().get_label();
        let cond_exit = self.condition()?;
        self.fs_mut().enter_block(true);
        self.check_next(&Token::Do)?;
        self.block()?;
        self.fs_mut().jump_to(top)?;
        self.check_match(&Token::End, &Token::While, line)?;
        self.fs_mut().leave_block()?;
        self.fs_mut().patch_to_here(cond_exit)
    }

    fn repeat_statement(&mut self, line: u32) -> Result<()> {
        let top = self.fs_mut().get_label();
        self.fs_mut().enter_block(true); // loop block
        self.fs_mut().enter_block(false); // scope block
        self.advance()?; // skip 'repeat'
        self.statement_list()?;
        self.check_match(&Token::Until, &Token::Repeat, line)?;
        // Body locals stay visible to the condition.
        let cond_exit = self.condition()?;
        let scope = *self.fs().blocks.last().expect("scope block");
        if scope.has_upval {
            self.fs_mut().patch_close(cond_exit, scope.nactive)?;
        }
        self.fs_mut().leave_block()?; // finish scope
        self.fs_mut().patch_list(cond_exit, top)?;
        self.fs_mut().leave_block() // finish loop
    }

    /// test_then_block -> [IF | ELSEIF] cond THEN block.
    /// Returns the updated escape list.
    fn test_then_block(&mut self, mut escapes: i32) -> Result<i32> {
        self.advance()?; // skip 'if' or 'elseif'
        let e = self.expression()?;
        self.check_next(&Token::Then)?;
        let jump_false;
        if matches!(self.lexer.current(), Token::Goto | Token::Break) {
            // `if cond then goto` jumps directly off the true path.
            let e = self.fs_mut().go_if_false(e)?;
            self.fs_mut().enter_block(false);
            self.goto_statement(e.t)?;
            while self.test_next(&Token::Semi)? {}
            if self.block_follow(false) {
                // The goto is the whole block.
                self.fs_mut().leave_block()?;
                return Ok(escapes);
            }
            jump_false = self.fs_mut().jump()?;
        } else {
            let e = self.fs_mut().go_if_true(e)?;
            self.fs_mut().enter_block(false);
            jump_false = e.f;
        }
        self.statement_list()?;
        self.fs_mut().leave_block()?;
        if matches!(self.lexer.current(), Token::Else | Token::ElseIf) {
            let j = self.fs_mut().jump()?;
            escapes = self.fs_mut().concat(escapes, j)?;
        }
        self.fs_mut().patch_to_here(jump_false)?;
        Ok(escapes)
    }

    fn if_statement(&mut self, line: u32) -> Result<()> {
        let mut escapes = self.test_then_block(NO_JUMP)?;
        while self.lexer.current() == &Token::ElseIf {
            escapes = self.test_then_block(escapes)?;
        }
        if self.test_next(&Token::Else)? {
            self.block()?;
        }
        self.check_match(&Token::End, &Token::If, line)?;
        self.fs_mut().patch_to_here(escapes)
    }

    fn goto_statement(&mut self, pc: i32) -> Result<()> {
        let line = self.lexer.line();
        let name = if self.test_next(&Token::Goto)? {
            self.check_name()?
        } else {
            self.advance()?; // skip 'break'
            "break".to_string()
        };
        self.fs_mut().make_goto(&name, line, pc)
    }

    fn label_statement(&mut self, name: String, line: u32) -> Result<()> {
        self.fs_mut().check_repeated_label(&name)?;
        self.check_next(&Token::DoubleColon)?;
        let l = self.fs_mut().make_label(&name, line);
        // Skip other no-op statements following the label.
        while matches!(self.lexer.current(), Token::Semi | Token::DoubleColon) {
            self.statement()?;
        }
        if self.block_follow(false) {
            // The label ends its block: locals are already out of scope for
            // any goto that targets it.
            let fs = self.fs_mut();
            fs.active_labels[l].nactive = fs.blocks.last().expect("active block").nactive;
        }
        self.fs_mut().find_gotos(l)
    }

    // ---- for loops ----

    /// exp1 -> a single-value expression fixed on the stack top.
    fn expr_to_next_reg(&mut self) -> Result<()> {
        let e = self.expression()?;
        let e = self.fs_mut().exp_to_next_reg(e)?;
        debug_assert!(matches!(e.kind, ExprKind::NonReloc(_)));
        Ok(())
    }

    fn for_statement(&mut self, line: u32) -> Result<()> {
        // Scope for the loop and its control variables.
        self.fs_mut().enter_block(true);
        self.advance()?; // skip 'for'
        let name = self.check_name()?;
        match self.lexer.current() {
            Token::Assign => self.for_numeric(name, line)?,
            Token::Comma | Token::In => self.for_list(name)?,
            _ => return Err(self.syntax_error("'=' or 'in' expected")),
        }
        self.check_match(&Token::End, &Token::For, line)?;
        self.fs_mut().leave_block() // breaks jump to this point
    }

    fn for_numeric(&mut self, name: String, line: u32) -> Result<()> {
        let base = self.fs().free_reg;
        {
            let fs = self.fs_mut();
            fs.make_local_var("(for index)")?;
            fs.make_local_var("(for limit)")?;
            fs.make_local_var("(for step)")?;
            fs.make_local_var(&name)?;
        }
        self.check_next(&Token::Assign)?;
        self.expr_to_next_reg()?; // initial value
        self.check_next(&Token::Comma)?;
        self.expr_to_next_reg()?; // limit
        if self.test_next(&Token::Comma)? {
            self.expr_to_next_reg()?; // step
        } else {
            // Default step 1.
            let fs = self.fs_mut();
            let k = fs.int_constant(1)?;
            let reg = fs.free_reg;
            let e = fs.exp_to_reg(ExprDesc::new(ExprKind::Constant(k)), reg)?;
            debug_assert!(matches!(e.kind, ExprKind::NonReloc(_)));
            fs.reserve_regs(1)?;
        }
        self.for_body(base, line, 1, true)
    }

    fn for_list(&mut self, first_name: String) -> Result<()> {
        let base = self.fs().free_reg;
        {
            let fs = self.fs_mut();
            fs.make_local_var("(for generator)")?;
            fs.make_local_var("(for state)")?;
            fs.make_local_var("(for control)")?;
            fs.make_local_var(&first_name)?;
        }
        let mut nvars = 1u32;
        while self.test_next(&Token::Comma)? {
            let name = self.check_name()?;
            self.fs_mut().make_local_var(&name)?;
            nvars += 1;
        }
        self.check_next(&Token::In)?;
        let line = self.lexer.line();
        let (e, nexps) = self.expression_list()?;
        let fs = self.fs_mut();
        fs.adjust_assign(3, nexps, e)?;
        fs.check_stack(3)?; // extra space to call the generator
        self.for_body(base, line, nvars, false)
    }

    fn for_body(&mut self, base: u32, line: u32, nvars: u32, is_numeric: bool) -> Result<()> {
        self.fs_mut().adjust_local_vars(3); // control variables
        self.check_next(&Token::Do)?;
        let prep = if is_numeric {
            self.fs_mut().emit_asbx(OpCode::ForPrep, base, NO_JUMP)?
        } else {
            self.fs_mut().jump()?
        };
        self.fs_mut().enter_block(false); // scope for declared variables
        self.fs_mut().adjust_local_vars(nvars);
        self.fs_mut().reserve_regs(nvars)?;
        self.block()?;
        self.fs_mut().leave_block()?;
        let fs = self.fs_mut();
        fs.patch_to_here(prep)?;
        let end_for = if is_numeric {
            fs.emit_asbx(OpCode::ForLoop, base, NO_JUMP)?
        } else {
            fs.emit_abc(OpCode::TForCall, base, 0, nvars)?;
            fs.fix_line(line);
            fs.emit_asbx(OpCode::TForLoop, base + 2, NO_JUMP)?
        };
        fs.patch_list(end_for, prep + 1)?;
        fs.fix_line(line);
        Ok(())
    }

    // ---- Function statements ----

    /// funcname -> NAME {'.' NAME} [':' NAME]
    fn function_name(&mut self) -> Result<(ExprDesc, bool)> {
        let mut e = self.single_variable()?;
        while self.lexer.current() == &Token::Dot {
            e = self.field_selector(e)?;
        }
        if self.lexer.current() == &Token::Colon {
            e = self.field_selector(e)?;
            return Ok((e, true));
        }
        Ok((e, false))
    }

    fn function_statement(&mut self, line: u32) -> Result<()> {
        self.advance()?; // skip 'function'
        let (target, is_method) = self.function_name()?;
        let closure = self.body(is_method, line)?;
        let fs = self.fs_mut();
        fs.store_var(&target, closure)?;
        fs.fix_line(line); // the definition "happens" in the first line
        Ok(())
    }

    fn local_function(&mut self) -> Result<()> {
        let name = self.check_name()?;
        let fs = self.fs_mut();
        fs.make_local_var(&name)?;
        fs.adjust_local_vars(1); // the function may refer to itself
        let line = self.lexer.lastline;
        let closure = self.body(false, line)?;
        // Debug info only sees the variable after the closure is built.
        let fs = self.fs_mut();
        if let ExprKind::NonReloc(reg) = closure.kind {
            let idx = fs.active_vars[reg as usize];
            fs.proto.local_vars[idx].start_pc = fs.pc() as u32;
        }
        Ok(())
    }

    fn local_statement(&mut self) -> Result<()> {
        let mut nvars = 0u32;
        loop {
            let name = self.check_name()?;
            self.fs_mut().make_local_var(&name)?;
            nvars += 1;
            if !self.test_next(&Token::Comma)? {
                break;
            }
        }
        let (e, nexps) = if self.test_next(&Token::Assign)? {
            self.expression_list()?
        } else {
            (ExprDesc::void(), 0)
        };
        let fs = self.fs_mut();
        fs.adjust_assign(nvars, nexps, e)?;
        fs.adjust_local_vars(nvars);
        Ok(())
    }

    // ---- Assignment and calls ----

    fn expression_statement(&mut self) -> Result<()> {
        let e = self.suffixed_expression()?;
        if matches!(self.lexer.current(), Token::Assign | Token::Comma) {
            let mut targets = vec![e];
            self.assignment(&mut targets)
        } else {
            match e.kind {
                ExprKind::Call(pc) => {
                    // A call statement discards its results.
                    self.fs_mut().instr_mut(pc).set_c(1);
                    Ok(())
                }
                _ => Err(self.syntax_error("syntax error")),
            }
        }
    }

    /// assignment -> ',' suffixedexp assignment | '=' explist.
    /// Targets are stored right to left, each from the stack top.
    fn assignment(&mut self, targets: &mut Vec<ExprDesc>) -> Result<()> {
        if !targets.last().expect("assignment target").is_variable() {
            return Err(self.syntax_error("syntax error"));
        }
        if self.test_next(&Token::Comma)? {
            let nv = self.suffixed_expression()?;
            if !matches!(nv.kind, ExprKind::Indexed { .. }) {
                self.check_conflict(targets, &nv)?;
            }
            targets.push(nv);
            self.enter_level()?;
            self.assignment(targets)?;
            self.leave_level();
            targets.pop();
        } else {
            self.check_next(&Token::Assign)?;
            let (e, nexps) = self.expression_list()?;
            let nvars = targets.len() as u32;
            if nexps != nvars {
                self.fs_mut().adjust_assign(nvars, nexps, e)?;
            } else {
                let fs = self.fs_mut();
                let e = fs.set_one_return(e);
                let target = *targets.last().expect("assignment target");
                return fs.store_var(&target, e);
            }
        }
        // Assign the current target from the stack top.
        let fs = self.fs_mut();
        let e = ExprDesc::new(ExprKind::NonReloc(fs.free_reg - 1));
        let target = *targets.last().expect("assignment target");
        fs.store_var(&target, e)
    }

    /// A later target that is a plain local or upvalue may alias the table
    /// or index register of an earlier indexed target; copy the aliased
    /// value to a fresh register and retarget the earlier access.
    fn check_conflict(&mut self, targets: &mut [ExprDesc], nv: &ExprDesc) -> Result<()> {
        let fs = self.fs_mut();
        let extra = fs.free_reg; // slot to save the local or upvalue
        let mut conflict = false;
        for target in targets.iter_mut() {
            let ExprKind::Indexed {
                table,
                key,
                table_is_upval,
            } = &mut target.kind
            else {
                continue;
            };
            match nv.kind {
                ExprKind::Local(r) => {
                    if !*table_is_upval && *table == r {
                        conflict = true;
                        *table = extra;
                    }
                    // The index cannot be an upvalue.
                    if *key == r {
                        conflict = true;
                        *key = extra;
                    }
                }
                ExprKind::Upval(u) => {
                    if *table_is_upval && *table == u {
                        conflict = true;
                        *table = extra;
                        *table_is_upval = false;
                    }
                }
                _ => {}
            }
        }
        if conflict {
            let (op, src) = match nv.kind {
                ExprKind::Local(r) => (OpCode::Move, r),
                ExprKind::Upval(u) => (OpCode::GetUpval, u),
                _ => unreachable!(),
            };
            fs.emit_abc(op, extra, src, 0)?;
            fs.reserve_regs(1)?;
        }
        Ok(())
    }

    fn return_statement(&mut self) -> Result<()> {
        let first;
        let mut nret: i32;
        if self.block_follow(true) || self.lexer.current() == &Token::Semi {
            first = 0;
            nret = 0;
        } else {
            let (e, n) = self.expression_list()?;
            nret = n as i32;
            let fs = self.fs_mut();
            if e.has_multiple_returns() {
                fs.set_returns(&e, MULTRET)?;
                if let ExprKind::Call(pc) = e.kind {
                    if nret == 1 {
                        // A lone trailing call becomes a tail call.
                        fs.instr_mut(pc).set_opcode(OpCode::TailCall);
                        debug_assert_eq!(fs.instr(pc).a(), fs.nactive);
                    }
                }
                first = fs.nactive;
                nret = MULTRET;
            } else if nret == 1 {
                let e = fs.exp_to_any_reg(e)?;
                first = match e.kind {
                    ExprKind::NonReloc(r) => r,
                    _ => unreachable!(),
                };
            } else {
                fs.exp_to_next_reg(e)?;
                first = fs.nactive;
                debug_assert_eq!(nret, (fs.free_reg - first) as i32);
            }
        }
        self.fs_mut().ret(first, nret)?;
        self.test_next(&Token::Semi)?;
        Ok(())
    }
}

fn unary_op(tok: &Token) -> Option<UnOp> {
    match tok {
        Token::Minus => Some(UnOp::Minus),
        Token::Not => Some(UnOp::Not),
        Token::Hash => Some(UnOp::Len),
        Token::Tilde => Some(UnOp::BNot),
        _ => None,
    }
}

fn binary_op(tok: &Token) -> Option<BinOp> {
    match tok {
        Token::Plus => Some(BinOp::Add),
        Token::Minus => Some(BinOp::Sub),
        Token::Star => Some(BinOp::Mul),
        Token::Percent => Some(BinOp::Mod),
        Token::Caret => Some(BinOp::Pow),
        Token::Slash => Some(BinOp::Div),
        Token::FloorDiv => Some(BinOp::IDiv),
        Token::Ampersand => Some(BinOp::BAnd),
        Token::Pipe => Some(BinOp::BOr),
        Token::Tilde => Some(BinOp::BXor),
        Token::ShiftLeft => Some(BinOp::Shl),
        Token::ShiftRight => Some(BinOp::Shr),
        Token::DotDot => Some(BinOp::Concat),
        Token::Equal => Some(BinOp::Eq),
        Token::NotEqual => Some(BinOp::Ne),
        Token::Less => Some(BinOp::Lt),
        Token::LessEq => Some(BinOp::Le),
        Token::Greater => Some(BinOp::Gt),
        Token::GreaterEq => Some(BinOp::Ge),
        Token::And => Some(BinOp::And),
        Token::Or => Some(BinOp::Or),
        _ => None,
    }
}
