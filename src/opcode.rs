//! Lua 5.3 instruction encoding.
//!
//! Instructions are 32-bit words. From the lowest bit upward the fields are:
//! opcode (6 bits), A (8 bits), C (9 bits), B (9 bits). The `iABx` and
//! `iAsBx` formats merge B and C into an 18-bit Bx at C's position; `iAx`
//! merges everything after the opcode into a 26-bit Ax.
//!
//! A 9-bit B or C operand with bit 8 set is an RK operand naming a constant
//! (index in the low 8 bits) rather than a register.

use std::fmt;

// Field sizes in bits.
pub const SIZE_OP: u32 = 6;
pub const SIZE_A: u32 = 8;
pub const SIZE_B: u32 = 9;
pub const SIZE_C: u32 = 9;
pub const SIZE_BX: u32 = SIZE_B + SIZE_C;
pub const SIZE_AX: u32 = SIZE_A + SIZE_B + SIZE_C;

// Field positions (bit offsets from the low end).
pub const POS_OP: u32 = 0;
pub const POS_A: u32 = POS_OP + SIZE_OP;
pub const POS_C: u32 = POS_A + SIZE_A;
pub const POS_B: u32 = POS_C + SIZE_C;
pub const POS_BX: u32 = POS_C;
pub const POS_AX: u32 = POS_A;

// Maximum field values.
pub const MAXARG_A: u32 = (1 << SIZE_A) - 1;
pub const MAXARG_B: u32 = (1 << SIZE_B) - 1;
pub const MAXARG_C: u32 = (1 << SIZE_C) - 1;
pub const MAXARG_BX: u32 = (1 << SIZE_BX) - 1;
pub const MAXARG_AX: u32 = (1 << SIZE_AX) - 1;
/// Signed Bx is stored with an excess-K bias of `MAXARG_SBX`.
pub const MAXARG_SBX: i32 = (MAXARG_BX >> 1) as i32;

/// Bit that marks a B/C operand as a constant-table index.
pub const BITRK: u32 = 1 << (SIZE_B - 1);
/// Largest constant index that fits in an RK operand.
pub const MAXINDEXRK: u32 = BITRK - 1;

/// True if the operand names a constant rather than a register.
#[inline]
pub const fn is_constant(rk: u32) -> bool {
    rk & BITRK != 0
}

/// Constant index of an RK operand (strips the constant bit).
#[inline]
pub const fn constant_index(rk: u32) -> u32 {
    rk & !BITRK
}

/// Encode a constant index as an RK operand.
#[inline]
pub const fn as_constant(k: u32) -> u32 {
    k | BITRK
}

/// Bit mask with `n` ones at position `p`.
const fn mask(n: u32, p: u32) -> u32 {
    (!0u32 >> (32 - n)) << p
}

/// Instruction formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstructionFormat {
    IABC,
    IABx,
    IAsBx,
    IAx,
}

/// How an opcode uses its B or C operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpArgMode {
    /// Argument is not used.
    NotUsed,
    /// Argument is used, but is neither a register nor a jump offset.
    Used,
    /// Argument is a register or a jump offset.
    RegOrJump,
    /// Argument is a register or an RK-encoded constant index.
    RegOrConst,
}

/// Static metadata for one opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpMode {
    pub format: InstructionFormat,
    /// Whether A names a register the instruction writes.
    pub sets_a: bool,
    pub b_mode: OpArgMode,
    pub c_mode: OpArgMode,
    /// Test opcodes are always followed by a JMP they may skip.
    pub is_test: bool,
}

const fn opmode(
    is_test: bool,
    sets_a: bool,
    b_mode: OpArgMode,
    c_mode: OpArgMode,
    format: InstructionFormat,
) -> OpMode {
    OpMode {
        format,
        sets_a,
        b_mode,
        c_mode,
        is_test,
    }
}

/// The 47 Lua 5.3 opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Move = 0,  // A B     R(A) := R(B)
    LoadK,     // A Bx    R(A) := K(Bx)
    LoadKX,    // A       R(A) := K(extra arg)
    LoadBool,  // A B C   R(A) := (bool)B; if C, pc++
    LoadNil,   // A B     R(A..A+B) := nil
    GetUpval,  // A B     R(A) := U[B]
    GetTabUp,  // A B C   R(A) := U[B][RK(C)]
    GetTable,  // A B C   R(A) := R(B)[RK(C)]
    SetTabUp,  // A B C   U[A][RK(B)] := RK(C)
    SetUpval,  // A B     U[B] := R(A)
    SetTable,  // A B C   R(A)[RK(B)] := RK(C)
    NewTable,  // A B C   R(A) := {} (array size B, hash size C, float bytes)
    SelfOp,    // A B C   R(A+1) := R(B); R(A) := R(B)[RK(C)]
    Add,       // A B C   R(A) := RK(B) + RK(C)
    Sub,       // A B C   R(A) := RK(B) - RK(C)
    Mul,       // A B C   R(A) := RK(B) * RK(C)
    Mod,       // A B C   R(A) := RK(B) % RK(C)
    Pow,       // A B C   R(A) := RK(B) ^ RK(C)
    Div,       // A B C   R(A) := RK(B) / RK(C)
    IDiv,      // A B C   R(A) := RK(B) // RK(C)
    BAnd,      // A B C   R(A) := RK(B) & RK(C)
    BOr,       // A B C   R(A) := RK(B) | RK(C)
    BXor,      // A B C   R(A) := RK(B) ~ RK(C)
    Shl,       // A B C   R(A) := RK(B) << RK(C)
    Shr,       // A B C   R(A) := RK(B) >> RK(C)
    Unm,       // A B     R(A) := -R(B)
    BNot,      // A B     R(A) := ~R(B)
    Not,       // A B     R(A) := not R(B)
    Len,       // A B     R(A) := #R(B)
    Concat,    // A B C   R(A) := R(B) .. ... .. R(C)
    Jmp,       // A sBx   pc += sBx; if A, close upvalues >= R(A-1)
    Eq,        // A B C   if (RK(B) == RK(C)) != A, pc++
    Lt,        // A B C   if (RK(B) < RK(C)) != A, pc++
    Le,        // A B C   if (RK(B) <= RK(C)) != A, pc++
    Test,      // A C     if (bool)R(A) != C, pc++
    TestSet,   // A B C   if (bool)R(B) == C, R(A) := R(B) else pc++
    Call,      // A B C   R(A..A+C-2) := R(A)(R(A+1..A+B-1))
    TailCall,  // A B     return R(A)(R(A+1..A+B-1))
    Return,    // A B     return R(A..A+B-2)
    ForLoop,   // A sBx   R(A) += R(A+2); if loop continues, pc += sBx
    ForPrep,   // A sBx   R(A) -= R(A+2); pc += sBx
    TForCall,  // A C     R(A+3..A+2+C) := R(A)(R(A+1), R(A+2))
    TForLoop,  // A sBx   if R(A+1) != nil, R(A) := R(A+1); pc += sBx
    SetList,   // A B C   R(A)[(C-1)*50+i] := R(A+i), 1 <= i <= B
    Closure,   // A Bx    R(A) := closure(proto[Bx])
    VarArg,    // A B     R(A..A+B-2) := vararg
    ExtraArg,  // Ax      extra (larger) argument for previous instruction
}

pub const NUM_OPCODES: usize = OpCode::ExtraArg as usize + 1;

impl OpCode {
    pub fn from_u8(v: u8) -> Option<OpCode> {
        if (v as usize) < NUM_OPCODES {
            // Safety: repr(u8), contiguous from 0, bounds-checked above.
            Some(unsafe { std::mem::transmute::<u8, OpCode>(v) })
        } else {
            None
        }
    }

    /// Static metadata for this opcode.
    pub const fn mode(self) -> OpMode {
        use InstructionFormat::*;
        use OpArgMode::*;
        match self {
            OpCode::Move => opmode(false, true, RegOrJump, NotUsed, IABC),
            OpCode::LoadK => opmode(false, true, RegOrConst, NotUsed, IABx),
            OpCode::LoadKX => opmode(false, true, NotUsed, NotUsed, IABx),
            OpCode::LoadBool => opmode(false, true, Used, Used, IABC),
            OpCode::LoadNil => opmode(false, true, Used, NotUsed, IABC),
            OpCode::GetUpval => opmode(false, true, Used, NotUsed, IABC),
            OpCode::GetTabUp => opmode(false, true, Used, RegOrConst, IABC),
            OpCode::GetTable => opmode(false, true, RegOrJump, RegOrConst, IABC),
            OpCode::SetTabUp => opmode(false, false, RegOrConst, RegOrConst, IABC),
            OpCode::SetUpval => opmode(false, false, Used, NotUsed, IABC),
            OpCode::SetTable => opmode(false, false, RegOrConst, RegOrConst, IABC),
            OpCode::NewTable => opmode(false, true, Used, Used, IABC),
            OpCode::SelfOp => opmode(false, true, RegOrJump, RegOrConst, IABC),
            OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Mod
            | OpCode::Pow
            | OpCode::Div
            | OpCode::IDiv
            | OpCode::BAnd
            | OpCode::BOr
            | OpCode::BXor
            | OpCode::Shl
            | OpCode::Shr => opmode(false, true, RegOrConst, RegOrConst, IABC),
            OpCode::Unm | OpCode::BNot | OpCode::Not | OpCode::Len => {
                opmode(false, true, RegOrJump, NotUsed, IABC)
            }
            OpCode::Concat => opmode(false, true, RegOrJump, RegOrJump, IABC),
            OpCode::Jmp => opmode(false, false, RegOrJump, NotUsed, IAsBx),
            OpCode::Eq | OpCode::Lt | OpCode::Le => {
                opmode(true, false, RegOrConst, RegOrConst, IABC)
            }
            OpCode::Test => opmode(true, false, NotUsed, Used, IABC),
            OpCode::TestSet => opmode(true, true, RegOrJump, Used, IABC),
            OpCode::Call => opmode(false, true, Used, Used, IABC),
            OpCode::TailCall => opmode(false, true, Used, Used, IABC),
            OpCode::Return => opmode(false, false, Used, NotUsed, IABC),
            OpCode::ForLoop => opmode(false, true, RegOrJump, NotUsed, IAsBx),
            OpCode::ForPrep => opmode(false, true, RegOrJump, NotUsed, IAsBx),
            OpCode::TForCall => opmode(false, false, NotUsed, Used, IABC),
            OpCode::TForLoop => opmode(false, true, RegOrJump, NotUsed, IAsBx),
            OpCode::SetList => opmode(false, false, Used, Used, IABC),
            OpCode::Closure => opmode(false, true, Used, NotUsed, IABx),
            OpCode::VarArg => opmode(false, true, Used, NotUsed, IABC),
            OpCode::ExtraArg => opmode(false, false, Used, Used, IAx),
        }
    }

    pub const fn format(self) -> InstructionFormat {
        self.mode().format
    }

    /// Test opcodes conditionally skip the following JMP.
    pub const fn is_test(self) -> bool {
        self.mode().is_test
    }

    pub const fn name(self) -> &'static str {
        match self {
            OpCode::Move => "MOVE",
            OpCode::LoadK => "LOADK",
            OpCode::LoadKX => "LOADKX",
            OpCode::LoadBool => "LOADBOOL",
            OpCode::LoadNil => "LOADNIL",
            OpCode::GetUpval => "GETUPVAL",
            OpCode::GetTabUp => "GETTABUP",
            OpCode::GetTable => "GETTABLE",
            OpCode::SetTabUp => "SETTABUP",
            OpCode::SetUpval => "SETUPVAL",
            OpCode::SetTable => "SETTABLE",
            OpCode::NewTable => "NEWTABLE",
            OpCode::SelfOp => "SELF",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Mod => "MOD",
            OpCode::Pow => "POW",
            OpCode::Div => "DIV",
            OpCode::IDiv => "IDIV",
            OpCode::BAnd => "BAND",
            OpCode::BOr => "BOR",
            OpCode::BXor => "BXOR",
            OpCode::Shl => "SHL",
            OpCode::Shr => "SHR",
            OpCode::Unm => "UNM",
            OpCode::BNot => "BNOT",
            OpCode::Not => "NOT",
            OpCode::Len => "LEN",
            OpCode::Concat => "CONCAT",
            OpCode::Jmp => "JMP",
            OpCode::Eq => "EQ",
            OpCode::Lt => "LT",
            OpCode::Le => "LE",
            OpCode::Test => "TEST",
            OpCode::TestSet => "TESTSET",
            OpCode::Call => "CALL",
            OpCode::TailCall => "TAILCALL",
            OpCode::Return => "RETURN",
            OpCode::ForLoop => "FORLOOP",
            OpCode::ForPrep => "FORPREP",
            OpCode::TForCall => "TFORCALL",
            OpCode::TForLoop => "TFORLOOP",
            OpCode::SetList => "SETLIST",
            OpCode::Closure => "CLOSURE",
            OpCode::VarArg => "VARARG",
            OpCode::ExtraArg => "EXTRAARG",
        }
    }
}

/// A single 32-bit VM instruction.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Instruction(pub u32);

impl Instruction {
    /// Encode an iABC instruction.
    #[inline]
    pub fn abc(op: OpCode, a: u32, b: u32, c: u32) -> Instruction {
        debug_assert!(a <= MAXARG_A);
        debug_assert!(b <= MAXARG_B);
        debug_assert!(c <= MAXARG_C);
        Instruction((op as u32) << POS_OP | a << POS_A | b << POS_B | c << POS_C)
    }

    /// Encode an iABx instruction.
    #[inline]
    pub fn abx(op: OpCode, a: u32, bx: u32) -> Instruction {
        debug_assert!(a <= MAXARG_A);
        debug_assert!(bx <= MAXARG_BX);
        Instruction((op as u32) << POS_OP | a << POS_A | bx << POS_BX)
    }

    /// Encode an iAsBx instruction; `sbx` is biased into the Bx field.
    #[inline]
    pub fn asbx(op: OpCode, a: u32, sbx: i32) -> Instruction {
        debug_assert!(sbx >= -MAXARG_SBX && sbx <= MAXARG_SBX);
        Instruction::abx(op, a, (sbx + MAXARG_SBX) as u32)
    }

    /// Encode an iAx instruction.
    #[inline]
    pub fn ax(op: OpCode, ax: u32) -> Instruction {
        debug_assert!(ax <= MAXARG_AX);
        Instruction((op as u32) << POS_OP | ax << POS_AX)
    }

    #[inline]
    pub fn opcode(self) -> OpCode {
        // The compiler only ever stores valid opcodes.
        OpCode::from_u8((self.0 & mask(SIZE_OP, POS_OP)) as u8).expect("invalid opcode")
    }

    #[inline]
    pub fn a(self) -> u32 {
        (self.0 >> POS_A) & mask(SIZE_A, 0)
    }

    #[inline]
    pub fn b(self) -> u32 {
        (self.0 >> POS_B) & mask(SIZE_B, 0)
    }

    #[inline]
    pub fn c(self) -> u32 {
        (self.0 >> POS_C) & mask(SIZE_C, 0)
    }

    #[inline]
    pub fn bx(self) -> u32 {
        (self.0 >> POS_BX) & mask(SIZE_BX, 0)
    }

    #[inline]
    pub fn sbx(self) -> i32 {
        self.bx() as i32 - MAXARG_SBX
    }

    #[inline]
    pub fn ax_field(self) -> u32 {
        (self.0 >> POS_AX) & mask(SIZE_AX, 0)
    }

    #[inline]
    pub fn set_opcode(&mut self, op: OpCode) {
        self.0 = (self.0 & !mask(SIZE_OP, POS_OP)) | (op as u32) << POS_OP;
    }

    #[inline]
    pub fn set_a(&mut self, a: u32) {
        debug_assert!(a <= MAXARG_A);
        self.0 = (self.0 & !mask(SIZE_A, POS_A)) | a << POS_A;
    }

    #[inline]
    pub fn set_b(&mut self, b: u32) {
        debug_assert!(b <= MAXARG_B);
        self.0 = (self.0 & !mask(SIZE_B, POS_B)) | b << POS_B;
    }

    #[inline]
    pub fn set_c(&mut self, c: u32) {
        debug_assert!(c <= MAXARG_C);
        self.0 = (self.0 & !mask(SIZE_C, POS_C)) | c << POS_C;
    }

    #[inline]
    pub fn set_bx(&mut self, bx: u32) {
        debug_assert!(bx <= MAXARG_BX);
        self.0 = (self.0 & !mask(SIZE_BX, POS_BX)) | bx << POS_BX;
    }

    #[inline]
    pub fn set_sbx(&mut self, sbx: i32) {
        debug_assert!(sbx >= -MAXARG_SBX && sbx <= MAXARG_SBX);
        self.set_bx((sbx + MAXARG_SBX) as u32);
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = self.opcode();
        match op.format() {
            InstructionFormat::IABC => {
                write!(f, "{} {} {} {}", op.name(), self.a(), self.b(), self.c())
            }
            InstructionFormat::IABx => write!(f, "{} {} {}", op.name(), self.a(), self.bx()),
            InstructionFormat::IAsBx => write!(f, "{} {} {}", op.name(), self.a(), self.sbx()),
            InstructionFormat::IAx => write!(f, "{} {}", op.name(), self.ax_field()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_layout() {
        assert_eq!(POS_OP, 0);
        assert_eq!(POS_A, 6);
        assert_eq!(POS_C, 14);
        assert_eq!(POS_B, 23);
        assert_eq!(POS_BX, 14);
        assert_eq!(MAXARG_SBX, 131071);
    }

    #[test]
    fn test_abc_roundtrip() {
        let i = Instruction::abc(OpCode::GetTable, 3, 45, 500);
        assert_eq!(i.opcode(), OpCode::GetTable);
        assert_eq!(i.a(), 3);
        assert_eq!(i.b(), 45);
        assert_eq!(i.c(), 500);
    }

    #[test]
    fn test_abc_max_fields() {
        let i = Instruction::abc(OpCode::SetList, MAXARG_A, MAXARG_B, MAXARG_C);
        assert_eq!(i.a(), MAXARG_A);
        assert_eq!(i.b(), MAXARG_B);
        assert_eq!(i.c(), MAXARG_C);
    }

    #[test]
    fn test_abx_roundtrip() {
        let i = Instruction::abx(OpCode::LoadK, 7, MAXARG_BX);
        assert_eq!(i.opcode(), OpCode::LoadK);
        assert_eq!(i.a(), 7);
        assert_eq!(i.bx(), MAXARG_BX);
    }

    #[test]
    fn test_asbx_boundaries() {
        for sbx in [-MAXARG_SBX, -1, 0, 1, MAXARG_SBX] {
            let i = Instruction::asbx(OpCode::Jmp, 0, sbx);
            assert_eq!(i.sbx(), sbx, "sbx {sbx} did not round-trip");
        }
    }

    #[test]
    fn test_ax_roundtrip() {
        let i = Instruction::ax(OpCode::ExtraArg, MAXARG_AX);
        assert_eq!(i.opcode(), OpCode::ExtraArg);
        assert_eq!(i.ax_field(), MAXARG_AX);
    }

    #[test]
    fn test_set_a_preserves_other_fields() {
        let mut i = Instruction::abc(OpCode::Add, 1, 2, 3);
        i.set_a(200);
        assert_eq!(i.opcode(), OpCode::Add);
        assert_eq!(i.a(), 200);
        assert_eq!(i.b(), 2);
        assert_eq!(i.c(), 3);
    }

    #[test]
    fn test_set_sbx_preserves_a() {
        let mut i = Instruction::asbx(OpCode::Jmp, 5, 0);
        i.set_sbx(-100);
        assert_eq!(i.a(), 5);
        assert_eq!(i.sbx(), -100);
    }

    #[test]
    fn test_rk_helpers() {
        assert!(!is_constant(255));
        let rk = as_constant(17);
        assert!(is_constant(rk));
        assert_eq!(constant_index(rk), 17);
        assert_eq!(as_constant(MAXINDEXRK), BITRK | MAXINDEXRK);
        assert!(as_constant(MAXINDEXRK) <= MAXARG_B);
    }

    #[test]
    fn test_opcode_from_u8() {
        assert_eq!(OpCode::from_u8(0), Some(OpCode::Move));
        assert_eq!(
            OpCode::from_u8(NUM_OPCODES as u8 - 1),
            Some(OpCode::ExtraArg)
        );
        assert_eq!(OpCode::from_u8(NUM_OPCODES as u8), None);
    }

    #[test]
    fn test_mode_table() {
        assert_eq!(OpCode::LoadK.format(), InstructionFormat::IABx);
        assert_eq!(OpCode::Jmp.format(), InstructionFormat::IAsBx);
        assert_eq!(OpCode::ExtraArg.format(), InstructionFormat::IAx);
        assert!(OpCode::Eq.is_test());
        assert!(OpCode::Test.is_test());
        assert!(OpCode::TestSet.is_test());
        assert!(!OpCode::Jmp.is_test());
        assert!(OpCode::Move.mode().sets_a);
        assert!(!OpCode::SetTable.mode().sets_a);
        assert_eq!(OpCode::Add.mode().b_mode, OpArgMode::RegOrConst);
        assert_eq!(OpCode::Return.mode().c_mode, OpArgMode::NotUsed);
    }

    #[test]
    fn test_every_opcode_has_distinct_name() {
        let mut names = std::collections::HashSet::new();
        for v in 0..NUM_OPCODES as u8 {
            let op = OpCode::from_u8(v).unwrap();
            assert!(names.insert(op.name()), "duplicate name {}", op.name());
        }
    }
}
