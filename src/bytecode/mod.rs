use std::fmt;

use serde::Serialize;

use crate::value::Value;

// ── Instruction set ─────────────────────────────────────────────────
//
// Operands are frame-relative stack slots (u8), constant-pool indices
// (u16 for loads/globals, u8 in the binary `*Const` forms), small integer
// immediates, or signed jump offsets. A jump at index `i` with offset `o`
// continues at `i + 1 + o`.
//
// Every binary operator comes in three forms keyed by its right operand:
//   `Op(dst, a, b)`       R[dst] = R[a] op R[b]
//   `OpConst(dst, a, k)`  R[dst] = R[a] op K[k]
//   `OpInt(dst, a, i)`    R[dst] = R[a] op i
//
// Comparisons carry an expected result instead of a destination and skip
// the following instruction when the test matches it.
//
// `Call(func, narg, want)` and `Return(first, n)` take `MULTRET` in a count
// field to mean "every value up to the stack top": all results of the
// call, or all arguments/return values left there by a preceding call.

/// Open value count for `Call` and `Return`.
pub const MULTRET: u8 = u8::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum ByteCode {
    // loads
    LoadNil(u8, u8),
    LoadBool(u8, bool),
    LoadInt(u8, i16),
    LoadConst(u8, u16),
    Move(u8, u8),

    // globals
    GetGlobal(u8, u16),
    SetGlobal(u16, u8),
    SetGlobalConst(u16, u16),

    // control flow
    Jump(i16),
    JumpIfTrue(u8, i16),
    JumpIfFalse(u8, i16),
    ForPrepare(u8, i16),
    ForLoop(u8, i16),
    Call(u8, u8, u8),
    Return(u8, u8),

    // unary
    Neg(u8, u8),
    Not(u8, u8),
    BitNot(u8, u8),
    Len(u8, u8),

    // binary
    Add(u8, u8, u8),
    AddConst(u8, u8, u8),
    AddInt(u8, u8, u8),
    Sub(u8, u8, u8),
    SubConst(u8, u8, u8),
    SubInt(u8, u8, u8),
    Mul(u8, u8, u8),
    MulConst(u8, u8, u8),
    MulInt(u8, u8, u8),
    Mod(u8, u8, u8),
    ModConst(u8, u8, u8),
    ModInt(u8, u8, u8),
    Idiv(u8, u8, u8),
    IdivConst(u8, u8, u8),
    IdivInt(u8, u8, u8),
    Div(u8, u8, u8),
    DivConst(u8, u8, u8),
    DivInt(u8, u8, u8),
    Pow(u8, u8, u8),
    PowConst(u8, u8, u8),
    PowInt(u8, u8, u8),
    BitAnd(u8, u8, u8),
    BitAndConst(u8, u8, u8),
    BitAndInt(u8, u8, u8),
    BitXor(u8, u8, u8),
    BitXorConst(u8, u8, u8),
    BitXorInt(u8, u8, u8),
    BitOr(u8, u8, u8),
    BitOrConst(u8, u8, u8),
    BitOrInt(u8, u8, u8),
    ShiftL(u8, u8, u8),
    ShiftLConst(u8, u8, u8),
    ShiftLInt(u8, u8, u8),
    ShiftR(u8, u8, u8),
    ShiftRConst(u8, u8, u8),
    ShiftRInt(u8, u8, u8),
    Concat(u8, u8, u8),
    ConcatConst(u8, u8, u8),
    ConcatInt(u8, u8, u8),

    // comparison: (a, b, expected)
    Equal(u8, u8, bool),
    EqualConst(u8, u8, bool),
    EqualInt(u8, u8, bool),
    NotEq(u8, u8, bool),
    NotEqConst(u8, u8, bool),
    NotEqInt(u8, u8, bool),
    Less(u8, u8, bool),
    LessConst(u8, u8, bool),
    LessInt(u8, u8, bool),
    LesEq(u8, u8, bool),
    LesEqConst(u8, u8, bool),
    LesEqInt(u8, u8, bool),
    Greater(u8, u8, bool),
    GreaterConst(u8, u8, bool),
    GreaterInt(u8, u8, bool),
    GreEq(u8, u8, bool),
    GreEqConst(u8, u8, bool),
    GreEqInt(u8, u8, bool),

    SetFalseSkip(u8),
}

impl ByteCode {
    /// Rewrites the offset of a jump-family instruction. Returns `false`
    /// when `self` carries no jump offset.
    pub fn set_jump(&mut self, offset: i16) -> bool {
        match self {
            ByteCode::Jump(o)
            | ByteCode::JumpIfTrue(_, o)
            | ByteCode::JumpIfFalse(_, o)
            | ByteCode::ForPrepare(_, o)
            | ByteCode::ForLoop(_, o) => {
                *o = offset;
                true
            }
            _ => false,
        }
    }
}

/// A compiled chunk: flat instruction sequence plus its constant pool.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Program {
    pub byte_codes: Vec<ByteCode>,
    pub constants: Vec<Value>,
    /// Highest number of stack slots any instruction addresses.
    pub max_slots: usize,
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "constants: {}", self.constants.len())?;
        for (i, c) in self.constants.iter().enumerate() {
            writeln!(f, "  K{i}\t{c:?}")?;
        }
        writeln!(f, "byte_codes: {} (slots: {})", self.byte_codes.len(), self.max_slots)?;
        for (pc, code) in self.byte_codes.iter().enumerate() {
            write!(f, "  [{pc}]\t{code:?}")?;
            let target = match *code {
                ByteCode::Jump(o)
                | ByteCode::JumpIfTrue(_, o)
                | ByteCode::JumpIfFalse(_, o)
                | ByteCode::ForPrepare(_, o)
                | ByteCode::ForLoop(_, o) => Some(pc as isize + 1 + o as isize),
                _ => None,
            };
            if let Some(t) = target {
                write!(f, "\t; to [{t}]")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
