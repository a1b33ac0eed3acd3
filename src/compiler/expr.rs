//! Expression descriptors.
//!
//! Code generation never builds a tree: each partially-compiled expression is
//! summarized by an [`ExprDesc`], and every operation refines it in place.

use crate::opcode::OpCode;

/// Sentinel terminating a jump list.
pub const NO_JUMP: i32 = -1;

/// What an [`ExprDesc`] currently denotes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ExprKind {
    /// No value (empty expression list slot).
    Void,
    Nil,
    True,
    False,
    /// Constant-pool entry.
    Constant(u32),
    /// Integer literal not yet in the pool.
    Int(i64),
    /// Float literal not yet in the pool.
    Float(f64),
    /// Value fixed in a specific register.
    NonReloc(u32),
    /// Active local variable (register is its slot).
    Local(u32),
    /// Upvalue index.
    Upval(u32),
    /// Pending table access; `table` and `key` are RK operands.
    Indexed {
        table: u32,
        key: u32,
        table_is_upval: bool,
    },
    /// A test instruction; value is the jump's truth path. Holds the jump pc.
    Jump(i32),
    /// Emitted instruction whose destination register is still open.
    Reloc(i32),
    /// Function call whose result count is still open. Holds the call's pc.
    Call(i32),
    /// `...` expression whose result count is still open.
    Vararg(i32),
}

/// A partially-compiled expression: its kind plus the pending true/false
/// jump lists accumulated by comparisons and `and`/`or`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExprDesc {
    pub kind: ExprKind,
    /// Jumps taken when the expression is true.
    pub t: i32,
    /// Jumps taken when the expression is false.
    pub f: i32,
}

impl ExprDesc {
    pub fn new(kind: ExprKind) -> ExprDesc {
        ExprDesc {
            kind,
            t: NO_JUMP,
            f: NO_JUMP,
        }
    }

    pub fn void() -> ExprDesc {
        ExprDesc::new(ExprKind::Void)
    }

    /// True if control can reach this expression along more than one path.
    pub fn has_jumps(&self) -> bool {
        self.t != self.f
    }

    /// A literal number with no pending jumps can be folded.
    pub fn is_numeral(&self) -> bool {
        matches!(self.kind, ExprKind::Int(_) | ExprKind::Float(_)) && !self.has_jumps()
    }

    pub fn is_zero(&self) -> bool {
        match self.kind {
            ExprKind::Int(i) => i == 0,
            ExprKind::Float(f) => f == 0.0,
            _ => false,
        }
    }

    /// Numeric value as a float, for mixed-type folding.
    pub fn float_value(&self) -> f64 {
        match self.kind {
            ExprKind::Int(i) => i as f64,
            ExprKind::Float(f) => f,
            _ => unreachable!("float_value on non-numeral"),
        }
    }

    /// Locals, upvalues and table slots can be assigned to.
    pub fn is_variable(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Local(_) | ExprKind::Upval(_) | ExprKind::Indexed { .. }
        )
    }

    /// Calls and `...` can expand to any number of results.
    pub fn has_multiple_returns(&self) -> bool {
        matches!(self.kind, ExprKind::Call(_) | ExprKind::Vararg(_))
    }
}

/// Binary operators, in source form (comparisons keep their direction).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Concat,
    Eq,
    Lt,
    Le,
    Ne,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    /// (left, right) binding priorities. A right priority lower than the
    /// left one makes the operator right-associative.
    pub fn priority(self) -> (u8, u8) {
        match self {
            BinOp::Or => (1, 1),
            BinOp::And => (2, 2),
            BinOp::Eq | BinOp::Lt | BinOp::Le | BinOp::Ne | BinOp::Gt | BinOp::Ge => (3, 3),
            BinOp::BOr => (4, 4),
            BinOp::BXor => (5, 5),
            BinOp::BAnd => (6, 6),
            BinOp::Shl | BinOp::Shr => (7, 7),
            BinOp::Concat => (9, 8),
            BinOp::Add | BinOp::Sub => (10, 10),
            BinOp::Mul | BinOp::Div | BinOp::IDiv | BinOp::Mod => (11, 11),
            BinOp::Pow => (14, 13),
        }
    }

    /// The arithmetic/bitwise/concat opcode this operator lowers to, if any.
    pub fn arith_opcode(self) -> Option<OpCode> {
        match self {
            BinOp::Add => Some(OpCode::Add),
            BinOp::Sub => Some(OpCode::Sub),
            BinOp::Mul => Some(OpCode::Mul),
            BinOp::Mod => Some(OpCode::Mod),
            BinOp::Pow => Some(OpCode::Pow),
            BinOp::Div => Some(OpCode::Div),
            BinOp::IDiv => Some(OpCode::IDiv),
            BinOp::BAnd => Some(OpCode::BAnd),
            BinOp::BOr => Some(OpCode::BOr),
            BinOp::BXor => Some(OpCode::BXor),
            BinOp::Shl => Some(OpCode::Shl),
            BinOp::Shr => Some(OpCode::Shr),
            BinOp::Concat => Some(OpCode::Concat),
            _ => None,
        }
    }

    /// Comparison lowering: (opcode, expected condition, swap operands).
    pub fn comparison(self) -> Option<(OpCode, u32, bool)> {
        match self {
            BinOp::Eq => Some((OpCode::Eq, 1, false)),
            BinOp::Ne => Some((OpCode::Eq, 0, false)),
            BinOp::Lt => Some((OpCode::Lt, 1, false)),
            BinOp::Le => Some((OpCode::Le, 1, false)),
            // a > b compiles as b < a, a >= b as b <= a.
            BinOp::Gt => Some((OpCode::Lt, 1, true)),
            BinOp::Ge => Some((OpCode::Le, 1, true)),
            _ => None,
        }
    }
}

/// Unary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Minus,
    BNot,
    Not,
    Len,
}

/// All unary operators bind tighter than every binary operator except `^`.
pub const UNARY_PRIORITY: u8 = 12;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priorities_order_arithmetic_over_comparison() {
        assert!(BinOp::Mul.priority().0 > BinOp::Add.priority().0);
        assert!(BinOp::Add.priority().0 > BinOp::Lt.priority().0);
        assert!(BinOp::Lt.priority().0 > BinOp::And.priority().0);
        assert!(BinOp::And.priority().0 > BinOp::Or.priority().0);
    }

    #[test]
    fn test_right_associative_operators() {
        let (l, r) = BinOp::Concat.priority();
        assert!(r < l);
        let (l, r) = BinOp::Pow.priority();
        assert!(r < l);
        assert!(BinOp::Pow.priority().0 > UNARY_PRIORITY);
    }

    #[test]
    fn test_jump_list_defaults() {
        let e = ExprDesc::new(ExprKind::True);
        assert_eq!(e.t, NO_JUMP);
        assert_eq!(e.f, NO_JUMP);
        assert!(!e.has_jumps());
    }

    #[test]
    fn test_numeral_with_jumps_is_not_foldable() {
        let mut e = ExprDesc::new(ExprKind::Int(3));
        assert!(e.is_numeral());
        e.f = 7;
        assert!(!e.is_numeral());
    }
}
