//! Code generation state for one function being compiled.
//!
//! `FuncState` owns the growing [`Prototype`] plus the transient allocator
//! and jump-list state. Pending jumps are threaded through the sBx field of
//! the JMP instructions themselves, so a jump list costs no side storage;
//! `NO_JUMP` terminates a list.

use indexmap::IndexMap;

use crate::compiler::expr::{BinOp, ExprDesc, ExprKind, UnOp, NO_JUMP};
use crate::compiler::scope::{Block, Label};
use crate::compiler::{CompileError, Result};
use crate::opcode::{
    as_constant, is_constant, Instruction, InstructionFormat, OpArgMode, OpCode, MAXARG_AX,
    MAXARG_BX, MAXARG_C, MAXARG_SBX, MAXINDEXRK,
};
use crate::proto::{Constant, ConstantKey, Prototype};

/// Register ceiling: one function may not use more register slots than the
/// A operand can name.
pub const MAX_REGISTERS: u32 = crate::opcode::MAXARG_A;

/// Pseudo-register marking "value not wanted" when patching TESTSET.
pub const NO_REG: u32 = crate::opcode::MAXARG_A;

/// Sentinel result count for calls/vararg that keep all results.
pub const MULTRET: i32 = -1;

/// SETLIST flushes the array part in batches of this many registers.
pub const FIELDS_PER_FLUSH: u32 = 50;

/// Compilation state for a single function body.
pub struct FuncState {
    pub proto: Prototype,
    /// Constant-pool index by value, for O(1) dedup.
    constant_lookup: IndexMap<ConstantKey, usize>,
    /// Enclosing lexical blocks, innermost last.
    pub blocks: Vec<Block>,
    /// Labels visible in some enclosing block.
    pub active_labels: Vec<Label>,
    /// Gotos (and breaks) waiting for a label.
    pub pending_gotos: Vec<Label>,
    /// Declared locals, as indexes into `proto.local_vars`. The first
    /// `nactive` of them are in scope.
    pub active_vars: Vec<usize>,
    pub nactive: u32,
    /// List of pending jumps to the current position.
    pub jpc: i32,
    /// pc of the last jump target; peepholes must not cross it.
    pub last_target: i32,
    /// First free register.
    pub free_reg: u32,
    /// Source line fed to emitted instructions; the driver keeps it current.
    pub line: u32,
}

impl FuncState {
    pub fn new(source: &str, line_defined: u32) -> FuncState {
        let mut proto = Prototype::new(source);
        proto.line_defined = line_defined;
        FuncState {
            proto,
            constant_lookup: IndexMap::new(),
            blocks: Vec::new(),
            active_labels: Vec::new(),
            pending_gotos: Vec::new(),
            active_vars: Vec::new(),
            nactive: 0,
            jpc: NO_JUMP,
            last_target: 0,
            free_reg: 0,
            line: line_defined.max(1),
        }
    }

    pub fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError {
            message: message.into(),
            line: self.line,
        }
    }

    #[inline]
    pub fn pc(&self) -> i32 {
        self.proto.code.len() as i32
    }

    #[inline]
    pub fn instr(&self, pc: i32) -> Instruction {
        self.proto.code[pc as usize]
    }

    #[inline]
    pub fn instr_mut(&mut self, pc: i32) -> &mut Instruction {
        &mut self.proto.code[pc as usize]
    }

    // ---- Emission ----

    fn emit(&mut self, inst: Instruction) -> Result<i32> {
        self.discharge_jpc()?;
        let line = self.line;
        Ok(self.proto.emit(inst, line) as i32)
    }

    pub fn emit_abc(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> Result<i32> {
        let mode = op.mode();
        debug_assert_eq!(mode.format, InstructionFormat::IABC);
        debug_assert!(mode.b_mode != OpArgMode::NotUsed || b == 0);
        debug_assert!(mode.c_mode != OpArgMode::NotUsed || c == 0);
        self.emit(Instruction::abc(op, a, b, c))
    }

    pub fn emit_abx(&mut self, op: OpCode, a: u32, bx: u32) -> Result<i32> {
        debug_assert_eq!(op.mode().format, InstructionFormat::IABx);
        self.emit(Instruction::abx(op, a, bx))
    }

    pub fn emit_asbx(&mut self, op: OpCode, a: u32, sbx: i32) -> Result<i32> {
        debug_assert_eq!(op.mode().format, InstructionFormat::IAsBx);
        self.emit(Instruction::asbx(op, a, sbx))
    }

    fn emit_extra_arg(&mut self, ax: u32) -> Result<i32> {
        self.emit(Instruction::ax(OpCode::ExtraArg, ax))
    }

    /// Emit the load of constant `k` into `reg`, spilling the index to an
    /// EXTRAARG word when it does not fit in Bx.
    fn emit_load_constant(&mut self, reg: u32, k: u32) -> Result<i32> {
        if k <= MAXARG_BX {
            self.emit_abx(OpCode::LoadK, reg, k)
        } else {
            let pc = self.emit_abx(OpCode::LoadKX, reg, 0)?;
            self.emit_extra_arg(k)?;
            Ok(pc)
        }
    }

    /// Rewrite the source line of the last emitted instruction.
    pub fn fix_line(&mut self, line: u32) {
        let pc = self.proto.code.len();
        self.proto.line_info[pc - 1] = line;
    }

    // ---- Constant pool ----

    pub fn add_constant(&mut self, value: Constant) -> Result<u32> {
        if let Some(&idx) = self.constant_lookup.get(&value.key()) {
            return Ok(idx as u32);
        }
        let idx = self.proto.constants.len();
        if idx as u32 > MAXARG_AX {
            return Err(self.error("too many constants"));
        }
        self.constant_lookup.insert(value.key(), idx);
        self.proto.constants.push(value);
        Ok(idx as u32)
    }

    pub fn string_constant(&mut self, s: &str) -> Result<u32> {
        self.add_constant(Constant::Str(s.to_string()))
    }

    pub fn int_constant(&mut self, i: i64) -> Result<u32> {
        self.add_constant(Constant::Integer(i))
    }

    pub fn float_constant(&mut self, f: f64) -> Result<u32> {
        self.add_constant(Constant::Float(f))
    }

    // ---- Register allocation ----

    pub fn check_stack(&mut self, n: u32) -> Result<()> {
        let new_stack = self.free_reg + n;
        if new_stack > MAX_REGISTERS {
            return Err(self.error("function or expression too complex"));
        }
        if new_stack > self.proto.max_stack_size as u32 {
            self.proto.max_stack_size = new_stack as u8;
        }
        Ok(())
    }

    pub fn reserve_regs(&mut self, n: u32) -> Result<()> {
        self.check_stack(n)?;
        self.free_reg += n;
        Ok(())
    }

    /// Release a register if it is a scratch slot (neither a constant
    /// operand nor a local's slot). Scratch slots free in LIFO order.
    fn free_register(&mut self, r: u32) {
        if !is_constant(r) && r >= self.nactive {
            self.free_reg -= 1;
            debug_assert_eq!(r, self.free_reg, "register not freed in LIFO order");
        }
    }

    fn free_exp(&mut self, e: &ExprDesc) {
        if let ExprKind::NonReloc(r) = e.kind {
            self.free_register(r);
        }
    }

    /// Free both operand registers, higher slot first.
    fn free_exps(&mut self, e1: &ExprDesc, e2: &ExprDesc) {
        let r1 = match e1.kind {
            ExprKind::NonReloc(r) => r as i64,
            _ => -1,
        };
        let r2 = match e2.kind {
            ExprKind::NonReloc(r) => r as i64,
            _ => -1,
        };
        if r1 > r2 {
            self.free_exp(e1);
            self.free_exp(e2);
        } else {
            self.free_exp(e2);
            self.free_exp(e1);
        }
    }

    // ---- Jump lists ----

    /// Emit an unconditional jump with an open target. Any jumps pending to
    /// this position are folded into the new jump's list.
    pub fn jump(&mut self) -> Result<i32> {
        let old_jpc = self.jpc;
        self.jpc = NO_JUMP;
        let j = self.emit_asbx(OpCode::Jmp, 0, NO_JUMP)?;
        self.concat(j, old_jpc)
    }

    pub fn jump_to(&mut self, target: i32) -> Result<()> {
        let j = self.jump()?;
        self.patch_list(j, target)
    }

    /// Emit RETURN for registers `first..first+nret`.
    pub fn ret(&mut self, first: u32, nret: i32) -> Result<()> {
        let b = if nret == MULTRET { 0 } else { (nret + 1) as u32 };
        self.emit_abc(OpCode::Return, first, b, 0)?;
        Ok(())
    }

    fn cond_jump(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> Result<i32> {
        self.emit_abc(op, a, b, c)?;
        self.jump()
    }

    /// Point the jump at `pc` to `dest`.
    fn fix_jump(&mut self, pc: i32, dest: i32) -> Result<()> {
        debug_assert_ne!(dest, NO_JUMP);
        let offset = dest - (pc + 1);
        if offset.abs() > MAXARG_SBX {
            return Err(self.error("control structure too long"));
        }
        self.instr_mut(pc).set_sbx(offset);
        Ok(())
    }

    /// Destination of the jump at `pc`, or `NO_JUMP` if it ends a list.
    fn get_jump(&self, pc: i32) -> i32 {
        let offset = self.instr(pc).sbx();
        if offset == NO_JUMP {
            NO_JUMP
        } else {
            pc + 1 + offset
        }
    }

    /// The instruction controlling the jump at `pc`: the preceding test
    /// instruction if there is one, else the jump itself.
    fn jump_control(&self, pc: i32) -> Instruction {
        if pc >= 1 && self.instr(pc - 1).opcode().is_test() {
            self.instr(pc - 1)
        } else {
            self.instr(pc)
        }
    }

    fn jump_control_pc(&self, pc: i32) -> i32 {
        if pc >= 1 && self.instr(pc - 1).opcode().is_test() {
            pc - 1
        } else {
            pc
        }
    }

    /// True if some jump in the list does not produce a value (is not a
    /// TESTSET); then the value must be materialized with LOADBOOLs.
    fn need_value(&self, mut list: i32) -> bool {
        while list != NO_JUMP {
            if self.jump_control(list).opcode() != OpCode::TestSet {
                return true;
            }
            list = self.get_jump(list);
        }
        false
    }

    /// Retarget a TESTSET controlling the jump at `node`: give it the wanted
    /// destination register, or demote it to TEST when no value is wanted.
    fn patch_test_register(&mut self, node: i32, reg: u32) -> bool {
        let pc = self.jump_control_pc(node);
        let i = self.instr(pc);
        if i.opcode() != OpCode::TestSet {
            return false;
        }
        if reg != NO_REG && reg != i.b() {
            self.instr_mut(pc).set_a(reg);
        } else {
            // Value in its own register or not wanted at all.
            *self.instr_mut(pc) = Instruction::abc(OpCode::Test, i.b(), 0, i.c());
        }
        true
    }

    fn remove_values(&mut self, mut list: i32) {
        while list != NO_JUMP {
            self.patch_test_register(list, NO_REG);
            list = self.get_jump(list);
        }
    }

    /// Patch every jump in `list`: value-producing jumps go to `vtarget`
    /// (with `reg` as destination), plain ones to `dtarget`.
    fn patch_list_aux(&mut self, mut list: i32, vtarget: i32, reg: u32, dtarget: i32) -> Result<()> {
        while list != NO_JUMP {
            let next = self.get_jump(list);
            if self.patch_test_register(list, reg) {
                self.fix_jump(list, vtarget)?;
            } else {
                self.fix_jump(list, dtarget)?;
            }
            list = next;
        }
        Ok(())
    }

    /// Resolve all jumps pending to the current position. Runs before every
    /// emit so a jpc jump never crosses a freshly emitted instruction.
    fn discharge_jpc(&mut self) -> Result<()> {
        let here = self.pc();
        let jpc = self.jpc;
        self.jpc = NO_JUMP;
        self.patch_list_aux(jpc, here, NO_REG, here)
    }

    /// Mark the current position as a jump target, disabling peepholes
    /// across it.
    pub fn get_label(&mut self) -> i32 {
        self.last_target = self.pc();
        self.last_target
    }

    pub fn patch_list(&mut self, list: i32, target: i32) -> Result<()> {
        if target == self.pc() {
            self.patch_to_here(list)
        } else {
            debug_assert!(target < self.pc());
            self.patch_list_aux(list, target, NO_REG, target)
        }
    }

    /// Queue `list` to be patched to the next emitted instruction.
    pub fn patch_to_here(&mut self, list: i32) -> Result<()> {
        self.get_label();
        self.jpc = self.concat(self.jpc, list)?;
        Ok(())
    }

    /// Make the jumps in `list` close upvalues down to `level` when taken.
    pub fn patch_close(&mut self, mut list: i32, level: u32) -> Result<()> {
        let level = level + 1; // A=0 means "no close" in JMP
        while list != NO_JUMP {
            let next = self.get_jump(list);
            let i = self.instr(list);
            debug_assert!(i.opcode() == OpCode::Jmp && (i.a() == 0 || i.a() >= level));
            self.instr_mut(list).set_a(level);
            list = next;
        }
        Ok(())
    }

    /// Append list `l2` to list `l1`, returning the head of the result.
    pub fn concat(&mut self, l1: i32, l2: i32) -> Result<i32> {
        if l2 == NO_JUMP {
            return Ok(l1);
        }
        if l1 == NO_JUMP {
            return Ok(l2);
        }
        let mut list = l1;
        loop {
            let next = self.get_jump(list);
            if next == NO_JUMP {
                break;
            }
            list = next;
        }
        self.fix_jump(list, l2)?;
        Ok(l1)
    }

    // ---- Discharging expressions into registers ----

    /// Resolve a variable reference into a readable value, emitting the
    /// access instruction for upvalues and table slots.
    pub fn discharge_vars(&mut self, mut e: ExprDesc) -> Result<ExprDesc> {
        match e.kind {
            ExprKind::Local(r) => {
                e.kind = ExprKind::NonReloc(r);
            }
            ExprKind::Upval(u) => {
                let pc = self.emit_abc(OpCode::GetUpval, 0, u, 0)?;
                e.kind = ExprKind::Reloc(pc);
            }
            ExprKind::Indexed {
                table,
                key,
                table_is_upval,
            } => {
                self.free_register(key);
                let pc = if table_is_upval {
                    self.emit_abc(OpCode::GetTabUp, 0, table, key)?
                } else {
                    self.free_register(table);
                    self.emit_abc(OpCode::GetTable, 0, table, key)?
                };
                e.kind = ExprKind::Reloc(pc);
            }
            ExprKind::Call(_) | ExprKind::Vararg(_) => {
                e = self.set_one_return(e);
            }
            _ => {}
        }
        Ok(e)
    }

    /// Fix a call or vararg to produce exactly `nresults` values.
    pub fn set_returns(&mut self, e: &ExprDesc, nresults: i32) -> Result<()> {
        let want = (nresults + 1) as u32;
        match e.kind {
            ExprKind::Call(pc) => {
                self.instr_mut(pc).set_c(want);
            }
            ExprKind::Vararg(pc) => {
                let reg = self.free_reg;
                self.instr_mut(pc).set_b(want);
                self.instr_mut(pc).set_a(reg);
                self.reserve_regs(1)?;
            }
            _ => unreachable!("set_returns on non-multret expression"),
        }
        Ok(())
    }

    /// Fix a call or vararg to produce exactly one value.
    pub fn set_one_return(&mut self, mut e: ExprDesc) -> ExprDesc {
        match e.kind {
            ExprKind::Call(pc) => {
                e.kind = ExprKind::NonReloc(self.instr(pc).a());
            }
            ExprKind::Vararg(pc) => {
                self.instr_mut(pc).set_b(2);
                e.kind = ExprKind::Reloc(pc);
            }
            _ => {}
        }
        e
    }

    /// Emit code leaving the value of `e` in exactly register `reg`,
    /// ignoring pending jump lists.
    fn discharge_to_reg(&mut self, e: ExprDesc, reg: u32) -> Result<ExprDesc> {
        let mut e = self.discharge_vars(e)?;
        match e.kind {
            ExprKind::Nil => {
                self.load_nil(reg, 1)?;
            }
            ExprKind::False => {
                self.emit_abc(OpCode::LoadBool, reg, 0, 0)?;
            }
            ExprKind::True => {
                self.emit_abc(OpCode::LoadBool, reg, 1, 0)?;
            }
            ExprKind::Constant(k) => {
                self.emit_load_constant(reg, k)?;
            }
            ExprKind::Int(i) => {
                let k = self.int_constant(i)?;
                self.emit_load_constant(reg, k)?;
            }
            ExprKind::Float(f) => {
                let k = self.float_constant(f)?;
                self.emit_load_constant(reg, k)?;
            }
            ExprKind::Reloc(pc) => {
                self.instr_mut(pc).set_a(reg);
            }
            ExprKind::NonReloc(r) => {
                if r != reg {
                    self.emit_abc(OpCode::Move, reg, r, 0)?;
                }
            }
            ExprKind::Jump(_) => return Ok(e), // handled by exp_to_reg
            _ => unreachable!("cannot discharge {:?}", e.kind),
        }
        e.kind = ExprKind::NonReloc(reg);
        Ok(e)
    }

    fn discharge_to_any_reg(&mut self, e: ExprDesc) -> Result<ExprDesc> {
        if matches!(e.kind, ExprKind::NonReloc(_)) {
            Ok(e)
        } else {
            self.reserve_regs(1)?;
            self.discharge_to_reg(e, self.free_reg - 1)
        }
    }

    /// Emit LOADNIL for `n` registers starting at `from`, merging with an
    /// immediately preceding LOADNIL when the ranges connect.
    pub fn load_nil(&mut self, from: u32, n: u32) -> Result<()> {
        let mut from = from as i64;
        let mut l = from + n as i64 - 1;
        if self.pc() > self.last_target {
            let prev = self.instr(self.pc() - 1);
            if prev.opcode() == OpCode::LoadNil {
                let pfrom = prev.a() as i64;
                let pl = pfrom + prev.b() as i64;
                if (pfrom <= from && from <= pl + 1) || (from <= pfrom && pfrom <= l + 1) {
                    if pfrom < from {
                        from = pfrom;
                    }
                    if pl > l {
                        l = pl;
                    }
                    let prev = self.instr_mut(self.pc() - 1);
                    prev.set_a(from as u32);
                    prev.set_b((l - from) as u32);
                    return Ok(());
                }
            }
        }
        self.emit_abc(OpCode::LoadNil, from as u32, n - 1, 0)?;
        Ok(())
    }

    fn code_label(&mut self, a: u32, b: u32, jump: u32) -> Result<i32> {
        self.get_label();
        self.emit_abc(OpCode::LoadBool, a, b, jump)
    }

    /// Put the value of `e` in register `reg`, materializing its jump lists.
    /// Comparison results become LOADBOOL pairs only when some jump cannot
    /// carry the value through a TESTSET.
    pub fn exp_to_reg(&mut self, e: ExprDesc, reg: u32) -> Result<ExprDesc> {
        let mut e = self.discharge_to_reg(e, reg)?;
        if let ExprKind::Jump(pc) = e.kind {
            e.t = self.concat(e.t, pc)?;
        }
        if e.has_jumps() {
            let mut position_false = NO_JUMP;
            let mut position_true = NO_JUMP;
            if self.need_value(e.t) || self.need_value(e.f) {
                let jump_over = if matches!(e.kind, ExprKind::Jump(_)) {
                    NO_JUMP
                } else {
                    self.jump()?
                };
                position_false = self.code_label(reg, 0, 1)?;
                position_true = self.code_label(reg, 1, 0)?;
                self.patch_to_here(jump_over)?;
            }
            let end = self.get_label();
            self.patch_list_aux(e.f, end, reg, position_false)?;
            self.patch_list_aux(e.t, end, reg, position_true)?;
        }
        e.t = NO_JUMP;
        e.f = NO_JUMP;
        e.kind = ExprKind::NonReloc(reg);
        Ok(e)
    }

    /// Put the value of `e` in the next free register.
    pub fn exp_to_next_reg(&mut self, e: ExprDesc) -> Result<ExprDesc> {
        let e = self.discharge_vars(e)?;
        self.free_exp(&e);
        self.reserve_regs(1)?;
        self.exp_to_reg(e, self.free_reg - 1)
    }

    /// Put the value of `e` in some register, reusing a scratch slot when
    /// it already has one.
    pub fn exp_to_any_reg(&mut self, e: ExprDesc) -> Result<ExprDesc> {
        let e = self.discharge_vars(e)?;
        if let ExprKind::NonReloc(r) = e.kind {
            if !e.has_jumps() {
                return Ok(e);
            }
            if r >= self.nactive {
                // Not a local: may overwrite in place.
                return self.exp_to_reg(e, r);
            }
        }
        self.exp_to_next_reg(e)
    }

    /// Like [`exp_to_any_reg`], but an upvalue may stay where it is.
    pub fn exp_to_any_reg_up(&mut self, e: ExprDesc) -> Result<ExprDesc> {
        if matches!(e.kind, ExprKind::Upval(_)) && !e.has_jumps() {
            Ok(e)
        } else {
            self.exp_to_any_reg(e)
        }
    }

    /// Make `e` a plain value (register or constant), keeping it out of a
    /// register if possible.
    pub fn exp_to_val(&mut self, e: ExprDesc) -> Result<ExprDesc> {
        if e.has_jumps() {
            self.exp_to_any_reg(e)
        } else {
            self.discharge_vars(e)
        }
    }

    /// Turn `e` into an RK operand: a small constant index when it fits,
    /// else a register.
    pub fn exp_to_rk(&mut self, e: ExprDesc) -> Result<(ExprDesc, u32)> {
        let mut e = self.exp_to_val(e)?;
        match e.kind {
            ExprKind::Nil => {
                let k = self.add_constant(Constant::Nil)?;
                if k <= MAXINDEXRK {
                    e.kind = ExprKind::Constant(k);
                    return Ok((e, as_constant(k)));
                }
            }
            ExprKind::True | ExprKind::False => {
                let k = self.add_constant(Constant::Boolean(e.kind == ExprKind::True))?;
                if k <= MAXINDEXRK {
                    e.kind = ExprKind::Constant(k);
                    return Ok((e, as_constant(k)));
                }
            }
            ExprKind::Int(i) => {
                let k = self.int_constant(i)?;
                if k <= MAXINDEXRK {
                    e.kind = ExprKind::Constant(k);
                    return Ok((e, as_constant(k)));
                }
            }
            ExprKind::Float(f) => {
                let k = self.float_constant(f)?;
                if k <= MAXINDEXRK {
                    e.kind = ExprKind::Constant(k);
                    return Ok((e, as_constant(k)));
                }
            }
            ExprKind::Constant(k) => {
                if k <= MAXINDEXRK {
                    return Ok((e, as_constant(k)));
                }
            }
            _ => {}
        }
        // Not a constant in the right range: put it in a register.
        let e = self.exp_to_any_reg(e)?;
        match e.kind {
            ExprKind::NonReloc(r) => Ok((e, r)),
            _ => unreachable!("exp_to_any_reg must produce a register"),
        }
    }

    /// Compile an assignment of `e` into the variable described by `var`.
    pub fn store_var(&mut self, var: &ExprDesc, e: ExprDesc) -> Result<()> {
        match var.kind {
            ExprKind::Local(r) => {
                self.free_exp(&e);
                self.exp_to_reg(e, r)?;
                Ok(())
            }
            ExprKind::Upval(u) => {
                let e = self.exp_to_any_reg(e)?;
                if let ExprKind::NonReloc(r) = e.kind {
                    self.emit_abc(OpCode::SetUpval, r, u, 0)?;
                }
                self.free_exp(&e);
                Ok(())
            }
            ExprKind::Indexed {
                table,
                key,
                table_is_upval,
            } => {
                let op = if table_is_upval {
                    OpCode::SetTabUp
                } else {
                    OpCode::SetTable
                };
                let (e, rk) = self.exp_to_rk(e)?;
                self.emit_abc(op, table, key, rk)?;
                self.free_exp(&e);
                Ok(())
            }
            _ => unreachable!("store target is not a variable"),
        }
    }

    /// Compile `e:key` into the receiver/method register pair for a call.
    pub fn self_op(&mut self, e: ExprDesc, key: ExprDesc) -> Result<ExprDesc> {
        let e = self.exp_to_any_reg(e)?;
        let ereg = match e.kind {
            ExprKind::NonReloc(r) => r,
            _ => unreachable!(),
        };
        self.free_exp(&e);
        let base = self.free_reg;
        self.reserve_regs(2)?;
        let (key, rk) = self.exp_to_rk(key)?;
        self.emit_abc(OpCode::SelfOp, base, ereg, rk)?;
        self.free_exp(&key);
        Ok(ExprDesc::new(ExprKind::NonReloc(base)))
    }

    /// Resolve a `t[k]` access into an Indexed descriptor.
    pub fn indexed(&mut self, t: ExprDesc, k: ExprDesc) -> Result<ExprDesc> {
        debug_assert!(!t.has_jumps());
        let (table, table_is_upval) = match t.kind {
            ExprKind::Upval(u) => (u, true),
            ExprKind::NonReloc(r) | ExprKind::Local(r) => (r, false),
            _ => unreachable!("table operand not in a register or upvalue"),
        };
        let (_, key) = self.exp_to_rk(k)?;
        let mut e = ExprDesc::new(ExprKind::Indexed {
            table,
            key,
            table_is_upval,
        });
        e.t = t.t;
        e.f = t.f;
        Ok(e)
    }

    // ---- Boolean control flow ----

    fn invert_jump(&mut self, pc: i32) {
        let control_pc = self.jump_control_pc(pc);
        let i = self.instr(control_pc);
        debug_assert!(
            i.opcode().is_test() && i.opcode() != OpCode::TestSet && i.opcode() != OpCode::Test
        );
        let a = if i.a() == 0 { 1 } else { 0 };
        self.instr_mut(control_pc).set_a(a);
    }

    /// Emit a conditional jump on the truthiness of `e`. A trailing NOT is
    /// elided by inverting the condition.
    fn jump_on_cond(&mut self, e: ExprDesc, cond: bool) -> Result<(ExprDesc, i32)> {
        if let ExprKind::Reloc(pc) = e.kind {
            let ie = self.instr(pc);
            if ie.opcode() == OpCode::Not {
                // Remove the NOT and test its operand with the condition flipped.
                debug_assert_eq!(pc, self.pc() - 1);
                self.proto.code.pop();
                self.proto.line_info.pop();
                let j = self.cond_jump(OpCode::Test, ie.b(), 0, !cond as u32)?;
                return Ok((e, j));
            }
        }
        let e = self.discharge_to_any_reg(e)?;
        self.free_exp(&e);
        let reg = match e.kind {
            ExprKind::NonReloc(r) => r,
            _ => unreachable!(),
        };
        let j = self.cond_jump(OpCode::TestSet, NO_REG, reg, cond as u32)?;
        Ok((e, j))
    }

    /// Ensure control falls through when `e` is true; false outcomes join
    /// `e.f`.
    pub fn go_if_true(&mut self, e: ExprDesc) -> Result<ExprDesc> {
        let mut e = self.discharge_vars(e)?;
        let pc = match e.kind {
            ExprKind::Jump(pc) => {
                self.invert_jump(pc);
                pc
            }
            ExprKind::Constant(_) | ExprKind::Int(_) | ExprKind::Float(_) | ExprKind::True => {
                NO_JUMP // always true: no jump needed
            }
            _ => {
                let (e2, j) = self.jump_on_cond(e, false)?;
                e = e2;
                j
            }
        };
        e.f = self.concat(e.f, pc)?;
        self.patch_to_here(e.t)?;
        e.t = NO_JUMP;
        Ok(e)
    }

    /// Ensure control falls through when `e` is false; true outcomes join
    /// `e.t`.
    pub fn go_if_false(&mut self, e: ExprDesc) -> Result<ExprDesc> {
        let mut e = self.discharge_vars(e)?;
        let pc = match e.kind {
            ExprKind::Jump(pc) => pc,
            ExprKind::Nil | ExprKind::False => NO_JUMP, // always false: no jump needed
            _ => {
                let (e2, j) = self.jump_on_cond(e, true)?;
                e = e2;
                j
            }
        };
        e.t = self.concat(e.t, pc)?;
        self.patch_to_here(e.f)?;
        e.f = NO_JUMP;
        Ok(e)
    }

    fn code_not(&mut self, e: ExprDesc) -> Result<ExprDesc> {
        let mut e = self.discharge_vars(e)?;
        match e.kind {
            ExprKind::Nil | ExprKind::False => {
                e.kind = ExprKind::True;
            }
            ExprKind::Constant(_) | ExprKind::Int(_) | ExprKind::Float(_) | ExprKind::True => {
                e.kind = ExprKind::False;
            }
            ExprKind::Jump(pc) => {
                self.invert_jump(pc);
            }
            ExprKind::Reloc(_) | ExprKind::NonReloc(_) => {
                let e2 = self.discharge_to_any_reg(e)?;
                self.free_exp(&e2);
                let r = match e2.kind {
                    ExprKind::NonReloc(r) => r,
                    _ => unreachable!(),
                };
                let pc = self.emit_abc(OpCode::Not, 0, r, 0)?;
                e.kind = ExprKind::Reloc(pc);
            }
            _ => unreachable!("cannot negate {:?}", e.kind),
        }
        std::mem::swap(&mut e.t, &mut e.f);
        self.remove_values(e.f);
        self.remove_values(e.t);
        Ok(e)
    }

    // ---- Operators ----

    /// Prepare the first operand before the right-hand side is parsed.
    pub fn infix(&mut self, op: BinOp, e: ExprDesc) -> Result<ExprDesc> {
        match op {
            BinOp::And => self.go_if_true(e),
            BinOp::Or => self.go_if_false(e),
            BinOp::Concat => self.exp_to_next_reg(e),
            _ if op.arith_opcode().is_some() => {
                if e.is_numeral() {
                    Ok(e) // may still fold
                } else {
                    Ok(self.exp_to_rk(e)?.0)
                }
            }
            _ => Ok(self.exp_to_rk(e)?.0),
        }
    }

    /// Combine both operands once the right-hand side is compiled.
    pub fn posfix(&mut self, op: BinOp, e1: ExprDesc, e2: ExprDesc, line: u32) -> Result<ExprDesc> {
        match op {
            BinOp::And => {
                debug_assert_eq!(e1.t, NO_JUMP, "list must be closed by infix");
                let mut e2 = self.discharge_vars(e2)?;
                e2.f = self.concat(e2.f, e1.f)?;
                Ok(e2)
            }
            BinOp::Or => {
                debug_assert_eq!(e1.f, NO_JUMP, "list must be closed by infix");
                let mut e2 = self.discharge_vars(e2)?;
                e2.t = self.concat(e2.t, e1.t)?;
                Ok(e2)
            }
            BinOp::Concat => {
                let e2 = self.exp_to_val(e2)?;
                if let ExprKind::Reloc(pc) = e2.kind {
                    if self.instr(pc).opcode() == OpCode::Concat {
                        // Chain a..b..c into one CONCAT.
                        let r1 = match e1.kind {
                            ExprKind::NonReloc(r) => r,
                            _ => unreachable!("concat operand not on the stack"),
                        };
                        debug_assert_eq!(r1, self.instr(pc).b() - 1);
                        self.free_exp(&e1);
                        self.instr_mut(pc).set_b(r1);
                        let mut e = ExprDesc::new(ExprKind::Reloc(pc));
                        e.t = e1.t;
                        e.f = e1.f;
                        return Ok(e);
                    }
                }
                let e2 = self.exp_to_next_reg(e2)?;
                self.code_binary(OpCode::Concat, e1, e2, line)
            }
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                self.code_comparison(op, e1, e2)
            }
            _ => {
                let opcode = op.arith_opcode().expect("binary operator");
                if let Some(folded) = fold_binop(op, &e1, &e2) {
                    let mut e = e1;
                    e.kind = folded;
                    return Ok(e);
                }
                self.code_binary(opcode, e1, e2, line)
            }
        }
    }

    /// Apply a unary operator.
    pub fn prefix(&mut self, op: UnOp, e: ExprDesc, line: u32) -> Result<ExprDesc> {
        match op {
            UnOp::Minus | UnOp::BNot => {
                if !e.has_jumps() {
                    if let Some(folded) = fold_unop(op, &e) {
                        let mut e = e;
                        e.kind = folded;
                        return Ok(e);
                    }
                }
                let opcode = if op == UnOp::Minus {
                    OpCode::Unm
                } else {
                    OpCode::BNot
                };
                self.code_unary(opcode, e, line)
            }
            UnOp::Len => self.code_unary(OpCode::Len, e, line),
            UnOp::Not => self.code_not(e),
        }
    }

    fn code_binary(&mut self, op: OpCode, e1: ExprDesc, e2: ExprDesc, line: u32) -> Result<ExprDesc> {
        let (e2, rk2) = self.exp_to_rk(e2)?;
        let (e1, rk1) = self.exp_to_rk(e1)?;
        self.free_exps(&e1, &e2);
        let pc = self.emit_abc(op, 0, rk1, rk2)?;
        self.fix_line(line);
        Ok(ExprDesc::new(ExprKind::Reloc(pc)))
    }

    fn code_unary(&mut self, op: OpCode, e: ExprDesc, line: u32) -> Result<ExprDesc> {
        let e = self.exp_to_any_reg(e)?;
        let r = match e.kind {
            ExprKind::NonReloc(r) => r,
            _ => unreachable!(),
        };
        self.free_exp(&e);
        let pc = self.emit_abc(op, 0, r, 0)?;
        self.fix_line(line);
        Ok(ExprDesc::new(ExprKind::Reloc(pc)))
    }

    fn code_comparison(&mut self, op: BinOp, e1: ExprDesc, e2: ExprDesc) -> Result<ExprDesc> {
        let (opcode, cond, swap) = op.comparison().expect("comparison operator");
        let rk1 = match e1.kind {
            ExprKind::Constant(k) => as_constant(k),
            ExprKind::NonReloc(r) => r,
            _ => unreachable!("left comparison operand not RK"),
        };
        let (e2, rk2) = self.exp_to_rk(e2)?;
        self.free_exps(&e1, &e2);
        let (rk1, rk2) = if swap { (rk2, rk1) } else { (rk1, rk2) };
        let pc = self.cond_jump(opcode, cond, rk1, rk2)?;
        Ok(ExprDesc::new(ExprKind::Jump(pc)))
    }

    // ---- Table constructors ----

    /// Emit SETLIST flushing `to_store` pending array registers into the
    /// table at `base`; `nelems` counts all array items so far.
    pub fn set_list(&mut self, base: u32, nelems: u32, to_store: i32) -> Result<()> {
        let c = (nelems - 1) / FIELDS_PER_FLUSH + 1;
        let b = if to_store == MULTRET { 0 } else { to_store as u32 };
        debug_assert!(to_store != 0 && to_store <= FIELDS_PER_FLUSH as i32);
        if c <= MAXARG_C {
            self.emit_abc(OpCode::SetList, base, b, c)?;
        } else if c <= MAXARG_AX {
            self.emit_abc(OpCode::SetList, base, b, 0)?;
            self.emit_extra_arg(c)?;
        } else {
            return Err(self.error("constructor too long"));
        }
        self.free_reg = base + 1; // free registers holding list values
        Ok(())
    }

    // ---- Assignment helpers ----

    /// Reconcile `nvars` targets with `nexps` compiled values, padding with
    /// nil or widening a trailing multi-return expression.
    pub fn adjust_assign(&mut self, nvars: u32, nexps: u32, e: ExprDesc) -> Result<()> {
        let mut extra = nvars as i32 - nexps as i32;
        if e.has_multiple_returns() {
            extra += 1; // includes the call itself
            if extra < 0 {
                extra = 0;
            }
            self.set_returns(&e, extra)?;
            if extra > 1 {
                self.reserve_regs(extra as u32 - 1)?;
            }
        } else {
            if e.kind != ExprKind::Void {
                self.exp_to_next_reg(e)?;
            }
            if extra > 0 {
                let reg = self.free_reg;
                self.reserve_regs(extra as u32)?;
                self.load_nil(reg, extra as u32)?;
            }
        }
        if nexps > nvars {
            self.free_reg -= nexps - nvars; // remove extra values
        }
        Ok(())
    }
}

/// Encode a table size hint as a "floating point byte": eeeeexxx standing
/// for (1xxx) << (eeeee - 1), or xxx when eeeee is 0.
pub fn int_to_float_byte(mut x: u32) -> u32 {
    let mut e = 0;
    if x < 8 {
        return x;
    }
    while x >= 8 << 4 {
        x = (x + 0xf) >> 4;
        e += 4;
    }
    while x >= 8 << 1 {
        x = (x + 1) >> 1;
        e += 1;
    }
    ((e + 1) << 3) | (x - 8)
}

fn to_folded_int(e: &ExprDesc) -> Option<i64> {
    match e.kind {
        ExprKind::Int(i) => Some(i),
        ExprKind::Float(f) => {
            // Only floats with an exact integer value convert.
            if f.floor() == f && f >= -(2f64.powi(63)) && f < 2f64.powi(63) {
                Some(f as i64)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn lua_floor_div(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    if a % b != 0 && (a < 0) != (b < 0) {
        q - 1
    } else {
        q
    }
}

fn lua_int_mod(a: i64, b: i64) -> i64 {
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) {
        r + b
    } else {
        r
    }
}

fn lua_float_mod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && (r < 0.0) != (b < 0.0) {
        r + b
    } else {
        r
    }
}

fn lua_shift_left(a: i64, b: i64) -> i64 {
    if b < 0 {
        if b <= -64 {
            0
        } else {
            ((a as u64) >> (-b as u32)) as i64
        }
    } else if b >= 64 {
        0
    } else {
        ((a as u64) << (b as u32)) as i64
    }
}

/// Fold a binary operation on two numeral literals, or report that it must
/// be computed at run time. Results that are NaN or 0.0 are never folded
/// (0.0 would lose the sign of -0.0).
fn fold_binop(op: BinOp, e1: &ExprDesc, e2: &ExprDesc) -> Option<ExprKind> {
    if !e1.is_numeral() || !e2.is_numeral() {
        return None;
    }
    match op {
        BinOp::BAnd | BinOp::BOr | BinOp::BXor | BinOp::Shl | BinOp::Shr => {
            let a = to_folded_int(e1)?;
            let b = to_folded_int(e2)?;
            let r = match op {
                BinOp::BAnd => a & b,
                BinOp::BOr => a | b,
                BinOp::BXor => a ^ b,
                BinOp::Shl => lua_shift_left(a, b),
                BinOp::Shr => lua_shift_left(a, b.wrapping_neg()),
                _ => unreachable!(),
            };
            return Some(ExprKind::Int(r));
        }
        BinOp::Div | BinOp::IDiv | BinOp::Mod => {
            // Division by zero is a runtime event, not a compile-time one.
            if e2.is_zero() {
                return None;
            }
        }
        _ => {}
    }
    let result = if let (ExprKind::Int(a), ExprKind::Int(b)) = (e1.kind, e2.kind) {
        match op {
            BinOp::Add => ExprKind::Int(a.wrapping_add(b)),
            BinOp::Sub => ExprKind::Int(a.wrapping_sub(b)),
            BinOp::Mul => ExprKind::Int(a.wrapping_mul(b)),
            BinOp::Mod => ExprKind::Int(lua_int_mod(a, b)),
            BinOp::IDiv => ExprKind::Int(lua_floor_div(a, b)),
            // `/` and `^` always produce floats.
            BinOp::Div => ExprKind::Float(a as f64 / b as f64),
            BinOp::Pow => ExprKind::Float((a as f64).powf(b as f64)),
            _ => return None,
        }
    } else {
        let a = e1.float_value();
        let b = e2.float_value();
        match op {
            BinOp::Add => ExprKind::Float(a + b),
            BinOp::Sub => ExprKind::Float(a - b),
            BinOp::Mul => ExprKind::Float(a * b),
            BinOp::Div => ExprKind::Float(a / b),
            BinOp::IDiv => ExprKind::Float((a / b).floor()),
            BinOp::Mod => ExprKind::Float(lua_float_mod(a, b)),
            BinOp::Pow => ExprKind::Float(a.powf(b)),
            _ => return None,
        }
    };
    if let ExprKind::Float(f) = result {
        if f.is_nan() || f == 0.0 {
            return None;
        }
    }
    Some(result)
}

fn fold_unop(op: UnOp, e: &ExprDesc) -> Option<ExprKind> {
    if !e.is_numeral() {
        return None;
    }
    match op {
        UnOp::Minus => match e.kind {
            ExprKind::Int(i) => Some(ExprKind::Int(i.wrapping_neg())),
            ExprKind::Float(f) => {
                let r = -f;
                if r.is_nan() || r == 0.0 {
                    None
                } else {
                    Some(ExprKind::Float(r))
                }
            }
            _ => None,
        },
        UnOp::BNot => to_folded_int(e).map(|i| ExprKind::Int(!i)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(i: i64) -> ExprDesc {
        ExprDesc::new(ExprKind::Int(i))
    }

    fn float(f: f64) -> ExprDesc {
        ExprDesc::new(ExprKind::Float(f))
    }

    #[test]
    fn test_fold_int_arithmetic_stays_integer() {
        assert_eq!(fold_binop(BinOp::Add, &int(2), &int(3)), Some(ExprKind::Int(5)));
        assert_eq!(fold_binop(BinOp::Mul, &int(4), &int(-3)), Some(ExprKind::Int(-12)));
        assert_eq!(fold_binop(BinOp::IDiv, &int(7), &int(2)), Some(ExprKind::Int(3)));
        assert_eq!(fold_binop(BinOp::IDiv, &int(-7), &int(2)), Some(ExprKind::Int(-4)));
        assert_eq!(fold_binop(BinOp::Mod, &int(-7), &int(3)), Some(ExprKind::Int(2)));
    }

    #[test]
    fn test_fold_div_and_pow_force_float() {
        assert_eq!(fold_binop(BinOp::Div, &int(1), &int(2)), Some(ExprKind::Float(0.5)));
        assert_eq!(fold_binop(BinOp::Pow, &int(2), &int(10)), Some(ExprKind::Float(1024.0)));
    }

    #[test]
    fn test_no_fold_on_zero_divisor() {
        assert_eq!(fold_binop(BinOp::Div, &int(1), &int(0)), None);
        assert_eq!(fold_binop(BinOp::IDiv, &int(1), &int(0)), None);
        assert_eq!(fold_binop(BinOp::Mod, &int(1), &int(0)), None);
        // Subtraction by zero is fine.
        assert_eq!(fold_binop(BinOp::Sub, &int(1), &int(0)), Some(ExprKind::Int(1)));
    }

    #[test]
    fn test_no_fold_to_nan_or_zero_float() {
        assert_eq!(fold_binop(BinOp::Sub, &float(1.5), &float(1.5)), None);
        assert_eq!(fold_binop(BinOp::Pow, &float(-1.0), &float(0.5)), None);
    }

    #[test]
    fn test_bitwise_folds_only_integral_values() {
        assert_eq!(fold_binop(BinOp::BAnd, &int(6), &int(3)), Some(ExprKind::Int(2)));
        assert_eq!(fold_binop(BinOp::Shl, &int(1), &int(4)), Some(ExprKind::Int(16)));
        assert_eq!(fold_binop(BinOp::Shl, &int(1), &int(64)), Some(ExprKind::Int(0)));
        assert_eq!(fold_binop(BinOp::BOr, &float(1.0), &int(2)), Some(ExprKind::Int(3)));
        assert_eq!(fold_binop(BinOp::BOr, &float(1.5), &int(2)), None);
    }

    #[test]
    fn test_fold_unary() {
        assert_eq!(fold_unop(UnOp::Minus, &int(3)), Some(ExprKind::Int(-3)));
        assert_eq!(fold_unop(UnOp::BNot, &int(0)), Some(ExprKind::Int(-1)));
        // -0.0 must be computed at run time.
        assert_eq!(fold_unop(UnOp::Minus, &float(0.0)), None);
    }

    #[test]
    fn test_float_byte_encoding() {
        assert_eq!(int_to_float_byte(0), 0);
        assert_eq!(int_to_float_byte(7), 7);
        assert_eq!(int_to_float_byte(8), 8); // (1000) << 0
        assert_eq!(int_to_float_byte(15), 15);
        assert_eq!(int_to_float_byte(16), 16); // (1000) << 1
        assert!(int_to_float_byte(1000) <= 0xFF);
    }
}
