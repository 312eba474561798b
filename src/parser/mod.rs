use std::collections::HashMap;

use tracing::debug;

use crate::bytecode::{ByteCode, MULTRET, Program};
use crate::lexer::{LexError, Lexer, Span, Token};
use crate::value::{ConstantKey, Value};
use crate::vm::ArithOp;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error("{expected} expected near '{found}'")]
    UnexpectedToken { expected: String, found: String, span: Span },
    #[error("'{terminator}' expected to close '{opener}'")]
    UnclosedBlock { opener: &'static str, terminator: &'static str, span: Span },
    #[error("break outside a loop")]
    BreakOutsideLoop { span: Span },
    #[error("continue outside a loop")]
    ContinueOutsideLoop { span: Span },
    #[error("continue jumps into the scope of local '{name}'")]
    ContinueIntoScope { name: String, span: Span },
    #[error("cannot assign to this expression")]
    InvalidAssignment { span: Span },
    #[error("expression needs more than 256 stack slots")]
    TooManySlots { span: Span },
    #[error("control structure too long")]
    JumpTooFar { span: Span },
    #[error("too many constants")]
    TooManyConstants { span: Span },
}

impl CompileError {
    pub fn span(&self) -> Span {
        match self {
            CompileError::Lex(e) => e.span,
            CompileError::UnexpectedToken { span, .. }
            | CompileError::UnclosedBlock { span, .. }
            | CompileError::BreakOutsideLoop { span }
            | CompileError::ContinueOutsideLoop { span }
            | CompileError::ContinueIntoScope { span, .. }
            | CompileError::InvalidAssignment { span }
            | CompileError::TooManySlots { span }
            | CompileError::JumpTooFar { span }
            | CompileError::TooManyConstants { span } => *span,
        }
    }
}

type CompileResult<T> = Result<T, CompileError>;

/// Compiles a whole chunk in one pass over the token stream.
pub fn compile(source: &str) -> CompileResult<Program> {
    Parser::new(source).chunk()
}

// ── Expression descriptors ──────────────────────────────────────────
//
// An expression is parsed into a description of where its value lives
// or how to compute it. Nothing is emitted until the consumer decides
// the destination slot, so `local x = a + b` becomes a single `Add`.

type UnaryTemplate = fn(u8, u8) -> ByteCode;
type BinaryTemplate = fn(u8, u8, u8) -> ByteCode;
type CompareTemplate = fn(u8, u8, bool) -> ByteCode;

#[derive(Debug, Clone)]
enum ExpDesc {
    /// Literal or folded value, interned only once it needs a pool slot.
    Constant(Value),
    Local(usize),
    /// Global by the pool index of its name.
    Global(usize),
    Unary { template: UnaryTemplate, operand: usize },
    Binary { template: BinaryTemplate, left: usize, right: usize },
    Compare { template: CompareTemplate, left: usize, right: usize },
    Call { func: usize, narg: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnOp {
    Neg,
    Not,
    BitNot,
    Len,
}

impl UnOp {
    fn from_token(tok: &Token) -> Option<UnOp> {
        Some(match tok {
            Token::Sub => UnOp::Neg,
            Token::Not => UnOp::Not,
            Token::BitXor => UnOp::BitNot,
            Token::Len => UnOp::Len,
            _ => return None,
        })
    }

    fn template(self) -> UnaryTemplate {
        match self {
            UnOp::Neg => ByteCode::Neg,
            UnOp::Not => ByteCode::Not,
            UnOp::BitNot => ByteCode::BitNot,
            UnOp::Len => ByteCode::Len,
        }
    }

    fn fold(self, v: &Value) -> Option<Value> {
        match (self, v) {
            (UnOp::Not, v) => Some(Value::Boolean(!v.is_truthy())),
            (UnOp::Neg, Value::Integer(i)) => Some(Value::Integer(i.wrapping_neg())),
            (UnOp::Neg, Value::Float(f)) => Some(Value::Float(-f)),
            (UnOp::BitNot, v) if v.is_number() => v.as_integer().map(|i| Value::Integer(!i)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Idiv,
    Mod,
    Pow,
    BitAnd,
    BitXor,
    BitOr,
    ShiftL,
    ShiftR,
    Concat,
    Equal,
    NotEq,
    Less,
    LesEq,
    Greater,
    GreEq,
    And,
    Or,
}

const UNARY_PRIORITY: u8 = 12;

impl BinOp {
    fn from_token(tok: &Token) -> Option<BinOp> {
        Some(match tok {
            Token::Add => BinOp::Add,
            Token::Sub => BinOp::Sub,
            Token::Mul => BinOp::Mul,
            Token::Div => BinOp::Div,
            Token::Idiv => BinOp::Idiv,
            Token::Mod => BinOp::Mod,
            Token::Pow => BinOp::Pow,
            Token::BitAnd => BinOp::BitAnd,
            Token::BitXor => BinOp::BitXor,
            Token::BitOr => BinOp::BitOr,
            Token::ShiftL => BinOp::ShiftL,
            Token::ShiftR => BinOp::ShiftR,
            Token::Concat => BinOp::Concat,
            Token::Equal => BinOp::Equal,
            Token::NotEq => BinOp::NotEq,
            Token::Less => BinOp::Less,
            Token::LesEq => BinOp::LesEq,
            Token::Greater => BinOp::Greater,
            Token::GreEq => BinOp::GreEq,
            Token::And => BinOp::And,
            Token::Or => BinOp::Or,
            _ => return None,
        })
    }

    /// (left, right) binding powers. An operator continues the current
    /// expression while its left power exceeds the caller's limit; a right
    /// power below the left one makes it right-associative.
    fn binding_power(self) -> (u8, u8) {
        match self {
            BinOp::Or => (1, 1),
            BinOp::And => (2, 2),
            BinOp::Equal
            | BinOp::NotEq
            | BinOp::Less
            | BinOp::LesEq
            | BinOp::Greater
            | BinOp::GreEq => (3, 3),
            BinOp::BitOr => (4, 4),
            BinOp::BitXor => (5, 5),
            BinOp::BitAnd => (6, 6),
            BinOp::ShiftL | BinOp::ShiftR => (7, 7),
            BinOp::Concat => (9, 8),
            BinOp::Add | BinOp::Sub => (10, 10),
            BinOp::Mul | BinOp::Div | BinOp::Idiv | BinOp::Mod => (11, 11),
            BinOp::Pow => (14, 13),
        }
    }

    /// Stack, constant and immediate forms of a value-producing operator.
    fn arith_forms(self) -> Option<[BinaryTemplate; 3]> {
        Some(match self {
            BinOp::Add => [ByteCode::Add, ByteCode::AddConst, ByteCode::AddInt],
            BinOp::Sub => [ByteCode::Sub, ByteCode::SubConst, ByteCode::SubInt],
            BinOp::Mul => [ByteCode::Mul, ByteCode::MulConst, ByteCode::MulInt],
            BinOp::Div => [ByteCode::Div, ByteCode::DivConst, ByteCode::DivInt],
            BinOp::Idiv => [ByteCode::Idiv, ByteCode::IdivConst, ByteCode::IdivInt],
            BinOp::Mod => [ByteCode::Mod, ByteCode::ModConst, ByteCode::ModInt],
            BinOp::Pow => [ByteCode::Pow, ByteCode::PowConst, ByteCode::PowInt],
            BinOp::BitAnd => [ByteCode::BitAnd, ByteCode::BitAndConst, ByteCode::BitAndInt],
            BinOp::BitXor => [ByteCode::BitXor, ByteCode::BitXorConst, ByteCode::BitXorInt],
            BinOp::BitOr => [ByteCode::BitOr, ByteCode::BitOrConst, ByteCode::BitOrInt],
            BinOp::ShiftL => [ByteCode::ShiftL, ByteCode::ShiftLConst, ByteCode::ShiftLInt],
            BinOp::ShiftR => [ByteCode::ShiftR, ByteCode::ShiftRConst, ByteCode::ShiftRInt],
            BinOp::Concat => [ByteCode::Concat, ByteCode::ConcatConst, ByteCode::ConcatInt],
            _ => return None,
        })
    }

    fn compare_forms(self) -> Option<[CompareTemplate; 3]> {
        Some(match self {
            BinOp::Equal => [ByteCode::Equal, ByteCode::EqualConst, ByteCode::EqualInt],
            BinOp::NotEq => [ByteCode::NotEq, ByteCode::NotEqConst, ByteCode::NotEqInt],
            BinOp::Less => [ByteCode::Less, ByteCode::LessConst, ByteCode::LessInt],
            BinOp::LesEq => [ByteCode::LesEq, ByteCode::LesEqConst, ByteCode::LesEqInt],
            BinOp::Greater => [ByteCode::Greater, ByteCode::GreaterConst, ByteCode::GreaterInt],
            BinOp::GreEq => [ByteCode::GreEq, ByteCode::GreEqConst, ByteCode::GreEqInt],
            _ => return None,
        })
    }

    /// The operator to use once the operands trade places, if any.
    fn swapped(self) -> Option<BinOp> {
        match self {
            BinOp::Add
            | BinOp::Mul
            | BinOp::BitAnd
            | BinOp::BitOr
            | BinOp::BitXor
            | BinOp::Equal
            | BinOp::NotEq => Some(self),
            BinOp::Less => Some(BinOp::Greater),
            BinOp::Greater => Some(BinOp::Less),
            BinOp::LesEq => Some(BinOp::GreEq),
            BinOp::GreEq => Some(BinOp::LesEq),
            _ => None,
        }
    }

    /// Folds two constants when the result cannot depend on runtime
    /// state and evaluating it cannot fail.
    fn fold(self, l: &Value, r: &Value) -> Option<Value> {
        let op = match self {
            BinOp::Add => ArithOp::Add,
            BinOp::Sub => ArithOp::Sub,
            BinOp::Mul => ArithOp::Mul,
            BinOp::Pow => ArithOp::Pow,
            BinOp::BitAnd => ArithOp::BitAnd,
            BinOp::BitXor => ArithOp::BitXor,
            BinOp::BitOr => ArithOp::BitOr,
            BinOp::ShiftL => ArithOp::ShiftL,
            BinOp::ShiftR => ArithOp::ShiftR,
            _ => return None,
        };
        if !l.is_number() || !r.is_number() {
            return None;
        }
        op.eval(l, r).ok()
    }
}

// ── Scopes and loops ────────────────────────────────────────────────

/// A named local. Its stack slot is its index in `Parser::locals`.
#[derive(Debug)]
struct LocalVar {
    name: String,
    /// Running count of declarations made before this one.
    ordinal: usize,
}

#[derive(Debug)]
struct PendingContinue {
    jump: usize,
    declared: usize,
    span: Span,
}

/// Values an expression list leaves in consecutive slots.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ListLen {
    Fixed(usize),
    /// This many, then every result of a trailing call up to the stack top.
    Open(usize),
}

/// Jumps inside one loop body waiting for their target.
#[derive(Debug, Default)]
struct LoopFixups {
    breaks: Vec<usize>,
    continues: Vec<PendingContinue>,
}

// ── Parser ──────────────────────────────────────────────────────────

struct Parser<'src> {
    lex: Lexer<'src>,
    byte_codes: Vec<ByteCode>,
    constants: Vec<Value>,
    const_index: HashMap<ConstantKey, usize>,
    locals: Vec<LocalVar>,
    declared: usize,
    /// First free stack slot.
    sp: usize,
    max_slots: usize,
}

impl<'src> Parser<'src> {
    fn new(source: &'src str) -> Self {
        Parser {
            lex: Lexer::new(source),
            byte_codes: Vec::new(),
            constants: Vec::new(),
            const_index: HashMap::new(),
            locals: Vec::new(),
            declared: 0,
            sp: 0,
            max_slots: 0,
        }
    }

    fn chunk(mut self) -> CompileResult<Program> {
        let end = self.block(None)?;
        if end != Token::Eos {
            return Err(self.unexpected("'<eof>'", &end));
        }
        self.emit(ByteCode::Return(0, 0));
        debug!(
            byte_codes = self.byte_codes.len(),
            constants = self.constants.len(),
            slots = self.max_slots,
            "compiled chunk"
        );
        Ok(Program {
            byte_codes: self.byte_codes,
            constants: self.constants,
            max_slots: self.max_slots,
        })
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn emit(&mut self, code: ByteCode) -> usize {
        self.byte_codes.push(code);
        self.byte_codes.len() - 1
    }

    fn unexpected(&self, expected: &str, found: &Token) -> CompileError {
        CompileError::UnexpectedToken {
            expected: expected.to_string(),
            found: found.to_string(),
            span: self.lex.span(),
        }
    }

    fn expect(&mut self, want: Token, what: &str) -> CompileResult<()> {
        let tok = self.lex.next()?;
        if tok == want {
            Ok(())
        } else {
            Err(self.unexpected(what, &tok))
        }
    }

    fn expect_name(&mut self) -> CompileResult<String> {
        match self.lex.next()? {
            Token::Name(name) => Ok(name),
            tok => Err(self.unexpected("<name>", &tok)),
        }
    }

    /// Checks the token that ended a block against the one its opener needs.
    fn expect_end(
        &self,
        end: Token,
        opener: &'static str,
        terminator: &'static str,
        span: Span,
    ) -> CompileResult<()> {
        let wanted = match terminator {
            "until" => Token::Until,
            _ => Token::End,
        };
        if end == wanted {
            Ok(())
        } else if end == Token::Eos {
            Err(CompileError::UnclosedBlock { opener, terminator, span })
        } else {
            Err(self.unexpected(&format!("'{terminator}'"), &end))
        }
    }

    fn check_slot(&self, slot: usize) -> CompileResult<u8> {
        u8::try_from(slot).map_err(|_| CompileError::TooManySlots { span: self.lex.span() })
    }

    fn set_sp(&mut self, sp: usize) {
        self.sp = sp;
        self.max_slots = self.max_slots.max(sp);
    }

    /// Interns a constant. Identical constants share one entry; `1` and
    /// `1.0` do not count as identical.
    fn add_const(&mut self, v: Value) -> CompileResult<usize> {
        let key = v.constant_key();
        if let Some(&i) = self.const_index.get(&key) {
            return Ok(i);
        }
        let i = self.constants.len();
        if i > u16::MAX as usize {
            return Err(CompileError::TooManyConstants { span: self.lex.span() });
        }
        self.constants.push(v);
        self.const_index.insert(key, i);
        Ok(i)
    }

    fn patch_jump(&mut self, jump: usize, target: usize) -> CompileResult<()> {
        let offset = target as isize - jump as isize - 1;
        let offset =
            i16::try_from(offset).map_err(|_| CompileError::JumpTooFar { span: self.lex.span() })?;
        let patched = self.byte_codes[jump].set_jump(offset);
        debug_assert!(patched, "patching a non-jump at {jump}");
        Ok(())
    }

    fn patch_here(&mut self, jump: usize) -> CompileResult<()> {
        self.patch_jump(jump, self.byte_codes.len())
    }

    fn jump_back(&mut self, target: usize) -> CompileResult<()> {
        let jump = self.emit(ByteCode::Jump(0));
        self.patch_jump(jump, target)
    }

    fn declare_local(&mut self, name: String) -> CompileResult<()> {
        let slot = self.locals.len();
        self.check_slot(slot)?;
        self.locals.push(LocalVar { name, ordinal: self.declared });
        self.declared += 1;
        if self.sp <= slot {
            self.set_sp(slot + 1);
        }
        Ok(())
    }

    fn resolve(&mut self, name: String) -> CompileResult<ExpDesc> {
        match self.locals.iter().rposition(|v| v.name == name) {
            Some(slot) => Ok(ExpDesc::Local(slot)),
            None => Ok(ExpDesc::Global(self.add_const(Value::from(name))?)),
        }
    }

    // ── Blocks ──────────────────────────────────────────────────────

    /// Parses a block in its own scope and returns the token that ended it.
    fn block(&mut self, lp: Option<&mut LoopFixups>) -> CompileResult<Token> {
        let saved = self.locals.len();
        let end = self.block_body(lp)?;
        self.locals.truncate(saved);
        Ok(end)
    }

    /// Like `block` but leaves the block's locals declared.
    fn block_body(&mut self, mut lp: Option<&mut LoopFixups>) -> CompileResult<Token> {
        loop {
            self.sp = self.locals.len();
            match self.lex.peek()? {
                Token::End | Token::Else | Token::Elseif | Token::Until | Token::Eos => {
                    return Ok(self.lex.next()?);
                }
                Token::Return => {
                    self.lex.next()?;
                    self.return_stat()?;
                    let end = self.lex.next()?;
                    return match end {
                        Token::End | Token::Else | Token::Elseif | Token::Until | Token::Eos => {
                            Ok(end)
                        }
                        _ => Err(self.unexpected("end of block after 'return'", &end)),
                    };
                }
                _ => self.statement(lp.as_deref_mut())?,
            }
        }
    }

    // ── Statements ──────────────────────────────────────────────────

    fn statement(&mut self, lp: Option<&mut LoopFixups>) -> CompileResult<()> {
        let tok = self.lex.next()?;
        let span = self.lex.span();
        match tok {
            Token::SemiColon => Ok(()),
            Token::Local => self.local_stat(),
            Token::If => self.if_stat(span, lp),
            Token::While => self.while_stat(span),
            Token::Repeat => self.repeat_stat(span),
            Token::For => self.for_stat(span),
            Token::Do => {
                let end = self.block(lp)?;
                self.expect_end(end, "do", "end", span)
            }
            Token::Break => {
                let Some(fixups) = lp else {
                    return Err(CompileError::BreakOutsideLoop { span });
                };
                let jump = self.emit(ByteCode::Jump(0));
                fixups.breaks.push(jump);
                Ok(())
            }
            Token::Continue => {
                let Some(fixups) = lp else {
                    return Err(CompileError::ContinueOutsideLoop { span });
                };
                let jump = self.emit(ByteCode::Jump(0));
                fixups.continues.push(PendingContinue { jump, declared: self.declared, span });
                Ok(())
            }
            Token::Name(name) => {
                let first = self.resolve(name)?;
                self.exp_stat(first, span)
            }
            Token::ParL => {
                let first = self.paren_exp()?;
                match self.suffixes(first)? {
                    ExpDesc::Call { func, narg } => {
                        self.emit(ByteCode::Call(func as u8, narg as u8, 0));
                        Ok(())
                    }
                    _ => {
                        let tok = self.lex.next()?;
                        Err(self.unexpected("function arguments", &tok))
                    }
                }
            }
            tok => Err(self.unexpected("statement", &tok)),
        }
    }

    /// `local a, b = e1, e2`
    fn local_stat(&mut self) -> CompileResult<()> {
        let mut names = vec![self.expect_name()?];
        while self.lex.peek()? == &Token::Comma {
            self.lex.next()?;
            names.push(self.expect_name()?);
        }

        let base = self.sp;
        let count = if self.lex.peek()? == &Token::Assign {
            self.lex.next()?;
            self.explist_into(base, names.len())?
        } else {
            0
        };
        self.nil_fill(base, count, names.len())?;

        // Names come into scope only after every initializer is evaluated.
        for name in names {
            self.declare_local(name)?;
        }
        Ok(())
    }

    /// Loads nil into `base + have .. base + want`.
    fn nil_fill(&mut self, base: usize, have: usize, want: usize) -> CompileResult<()> {
        if have >= want {
            return Ok(());
        }
        self.check_slot(base + want - 1)?;
        // All 256 slots do not fit in one count operand.
        let mut first = base + have;
        while first < base + want {
            let n = (base + want - first).min(u8::MAX as usize);
            self.emit(ByteCode::LoadNil(first as u8, n as u8));
            first += n;
        }
        if self.sp < base + want {
            self.set_sp(base + want);
        }
        Ok(())
    }

    /// Statement starting with a name: an assignment or a call.
    fn exp_stat(&mut self, first: ExpDesc, span: Span) -> CompileResult<()> {
        let desc = self.suffixes(first)?;
        match self.lex.peek()? {
            Token::Assign | Token::Comma => self.assignment(desc, span),
            _ => match desc {
                ExpDesc::Call { func, narg } => {
                    self.emit(ByteCode::Call(func as u8, narg as u8, 0));
                    Ok(())
                }
                _ => {
                    let tok = self.lex.next()?;
                    Err(self.unexpected("'='", &tok))
                }
            },
        }
    }

    fn assignment(&mut self, first: ExpDesc, span: Span) -> CompileResult<()> {
        let mut targets = vec![first];
        while self.lex.peek()? == &Token::Comma {
            self.lex.next()?;
            let name = self.expect_name()?;
            let first = self.resolve(name)?;
            targets.push(self.suffixes(first)?);
        }
        if let Some(bad) = targets.iter().find(|t| !matches!(t, ExpDesc::Local(_) | ExpDesc::Global(_))) {
            let span = match bad {
                ExpDesc::Call { .. } => self.lex.span(),
                _ => span,
            };
            return Err(CompileError::InvalidAssignment { span });
        }
        self.expect(Token::Assign, "'='")?;

        // One target and one value: evaluate straight into the target.
        if targets.len() == 1 {
            let value = self.exp()?;
            if self.lex.peek()? != &Token::Comma {
                return self.assign_to(targets.remove(0), value);
            }
            let base = self.sp;
            self.discharge(base, value)?;
            self.set_sp(base + 1);
            self.lex.next()?;
            self.explist_into(base + 1, 0)?;
            return self.assign_to(targets.remove(0), ExpDesc::Local(base));
        }

        // Several targets: evaluate every value before storing any of them.
        let base = self.sp;
        let count = self.explist_into(base, targets.len())?;
        self.nil_fill(base, count, targets.len())?;
        for (i, target) in targets.into_iter().enumerate().rev() {
            self.assign_to(target, ExpDesc::Local(base + i))?;
        }
        Ok(())
    }

    fn assign_to(&mut self, target: ExpDesc, value: ExpDesc) -> CompileResult<()> {
        match target {
            ExpDesc::Local(slot) => self.discharge(slot, value),
            ExpDesc::Global(name) => {
                let code = match value {
                    ExpDesc::Constant(v) => ByteCode::SetGlobalConst(name as u16, self.add_const(v)? as u16),
                    value => ByteCode::SetGlobal(name as u16, self.discharge_any(value)? as u8),
                };
                self.emit(code);
                Ok(())
            }
            _ => Err(CompileError::InvalidAssignment { span: self.lex.span() }),
        }
    }

    fn return_stat(&mut self) -> CompileResult<()> {
        let base = self.sp;
        let values = match self.lex.peek()? {
            Token::End
            | Token::Else
            | Token::Elseif
            | Token::Until
            | Token::Eos
            | Token::SemiColon => ListLen::Fixed(0),
            _ => self.explist_open(base)?,
        };
        if self.lex.peek()? == &Token::SemiColon {
            self.lex.next()?;
        }
        let code = match values {
            ListLen::Fixed(0) => ByteCode::Return(0, 0),
            ListLen::Fixed(n) => ByteCode::Return(self.check_slot(base)?, self.check_count(n)?),
            ListLen::Open(_) => ByteCode::Return(self.check_slot(base)?, MULTRET),
        };
        self.emit(code);
        Ok(())
    }

    fn if_stat(&mut self, span: Span, mut lp: Option<&mut LoopFixups>) -> CompileResult<()> {
        let mut exits = Vec::new();
        loop {
            let cond = self.exp()?;
            let skip = self.test_or_jump(cond)?;
            self.expect(Token::Then, "'then'")?;
            let end = self.block(lp.as_deref_mut())?;

            if end == Token::Elseif || end == Token::Else {
                exits.push(self.emit(ByteCode::Jump(0)));
                if let Some(skip) = skip {
                    self.patch_here(skip)?;
                }
                if end == Token::Else {
                    let end = self.block(lp.as_deref_mut())?;
                    self.expect_end(end, "if", "end", span)?;
                    break;
                }
            } else {
                self.expect_end(end, "if", "end", span)?;
                if let Some(skip) = skip {
                    self.patch_here(skip)?;
                }
                break;
            }
        }
        for exit in exits {
            self.patch_here(exit)?;
        }
        Ok(())
    }

    fn while_stat(&mut self, span: Span) -> CompileResult<()> {
        let start = self.byte_codes.len();
        let cond = self.exp()?;
        let exit = self.test_or_jump(cond)?;
        self.expect(Token::Do, "'do'")?;

        let mut fixups = LoopFixups::default();
        let end = self.block(Some(&mut fixups))?;
        self.expect_end(end, "while", "end", span)?;
        self.jump_back(start)?;

        if let Some(exit) = exit {
            self.patch_here(exit)?;
        }
        self.close_loop(fixups, start)
    }

    // The condition sees the body's locals, so the scope closes after it.
    fn repeat_stat(&mut self, span: Span) -> CompileResult<()> {
        let start = self.byte_codes.len();
        let saved = self.locals.len();

        let mut fixups = LoopFixups::default();
        let end = self.block_body(Some(&mut fixups))?;
        self.expect_end(end, "repeat", "until", span)?;

        let cond_start = self.byte_codes.len();
        self.sp = self.locals.len();
        let cond = self.exp()?;
        if let Some(back) = self.test_or_jump(cond)? {
            self.patch_jump(back, start)?;
        }

        self.close_loop(fixups, cond_start)?;
        self.locals.truncate(saved);
        Ok(())
    }

    /// `for v = init, limit [, step] do ... end`
    ///
    /// Occupies four consecutive slots: the running counter, the limit,
    /// the step and the visible loop variable.
    fn for_stat(&mut self, span: Span) -> CompileResult<()> {
        let name = self.expect_name()?;
        self.expect(Token::Assign, "'='")?;

        let saved = self.locals.len();
        let base = self.sp;
        self.check_slot(base + 3)?;

        let init = self.exp()?;
        self.discharge(base, init)?;
        self.set_sp(base + 1);
        self.expect(Token::Comma, "','")?;
        let limit = self.exp()?;
        self.discharge(base + 1, limit)?;
        self.set_sp(base + 2);
        if self.lex.peek()? == &Token::Comma {
            self.lex.next()?;
            let step = self.exp()?;
            self.discharge(base + 2, step)?;
        } else {
            self.emit(ByteCode::LoadInt(base as u8 + 2, 1));
        }
        self.set_sp(base + 3);
        self.expect(Token::Do, "'do'")?;

        for hidden in ["(for counter)", "(for limit)", "(for step)"] {
            self.declare_local(hidden.to_string())?;
        }
        self.declare_local(name)?;

        let prepare = self.emit(ByteCode::ForPrepare(base as u8, 0));
        let body = self.byte_codes.len();
        let mut fixups = LoopFixups::default();
        let end = self.block(Some(&mut fixups))?;
        self.expect_end(end, "for", "end", span)?;

        let step = self.emit(ByteCode::ForLoop(base as u8, 0));
        self.patch_jump(step, body)?;
        self.patch_here(prepare)?;

        self.close_loop(fixups, step)?;
        self.locals.truncate(saved);
        Ok(())
    }

    /// Patches a finished loop's `continue` jumps to `continue_target` and
    /// its `break` jumps to the current end of code.
    fn close_loop(&mut self, fixups: LoopFixups, continue_target: usize) -> CompileResult<()> {
        for pending in fixups.continues {
            if let Some(var) = self.locals.iter().find(|v| v.ordinal >= pending.declared) {
                return Err(CompileError::ContinueIntoScope {
                    name: var.name.clone(),
                    span: pending.span,
                });
            }
            self.patch_jump(pending.jump, continue_target)?;
        }
        for jump in fixups.breaks {
            self.patch_here(jump)?;
        }
        Ok(())
    }

    // ── Expressions ─────────────────────────────────────────────────

    fn exp(&mut self) -> CompileResult<ExpDesc> {
        self.exp_limit(0)
    }

    fn exp_limit(&mut self, limit: u8) -> CompileResult<ExpDesc> {
        // Slots from `mark` up are temporaries of this expression.
        let mark = self.sp;
        let mut desc = match UnOp::from_token(self.lex.peek()?) {
            Some(op) => {
                self.lex.next()?;
                let operand = self.exp_limit(UNARY_PRIORITY)?;
                self.unop(op, operand)?
            }
            None => self.simple_exp()?,
        };

        loop {
            let Some(op) = BinOp::from_token(self.lex.peek()?) else {
                return Ok(desc);
            };
            let (left_bp, right_bp) = op.binding_power();
            if left_bp <= limit {
                return Ok(desc);
            }
            self.lex.next()?;

            desc = match op {
                BinOp::And | BinOp::Or => self.logical(op, desc, right_bp)?,
                _ => {
                    // Left operands are evaluated before anything on the
                    // right. Constants wait, they may fold or swap sides.
                    let left = match desc {
                        ExpDesc::Constant(_) | ExpDesc::Local(_) => desc,
                        // Only this value's operands live above `mark`, and
                        // they are read before the result is written.
                        desc @ (ExpDesc::Unary { .. } | ExpDesc::Binary { .. } | ExpDesc::Compare { .. }) => {
                            self.discharge(mark, desc)?;
                            self.set_sp(mark + 1);
                            ExpDesc::Local(mark)
                        }
                        desc => ExpDesc::Local(self.discharge_any(desc)?),
                    };
                    let right = self.exp_limit(right_bp)?;
                    self.binop(op, left, right)?
                }
            };
        }
    }

    fn simple_exp(&mut self) -> CompileResult<ExpDesc> {
        let desc = match self.lex.next()? {
            Token::Nil => ExpDesc::Constant(Value::Nil),
            Token::True => ExpDesc::Constant(Value::Boolean(true)),
            Token::False => ExpDesc::Constant(Value::Boolean(false)),
            Token::Integer(i) => ExpDesc::Constant(Value::Integer(i)),
            Token::Float(f) => ExpDesc::Constant(Value::Float(f)),
            Token::String(s) => ExpDesc::Constant(Value::from(s)),
            Token::Name(name) => {
                let desc = self.resolve(name)?;
                return self.suffixes(desc);
            }
            Token::ParL => {
                let desc = self.paren_exp()?;
                return self.suffixes(desc);
            }
            tok => return Err(self.unexpected("expression", &tok)),
        };
        Ok(desc)
    }

    /// The rest of `( exp )`. A call in parentheses yields only its first
    /// result.
    fn paren_exp(&mut self) -> CompileResult<ExpDesc> {
        let desc = self.exp()?;
        self.expect(Token::ParR, "')'")?;
        Ok(match desc {
            ExpDesc::Call { .. } => ExpDesc::Local(self.discharge_any(desc)?),
            desc => desc,
        })
    }

    /// Call suffixes: `f(args)` and `f "literal"`.
    fn suffixes(&mut self, mut desc: ExpDesc) -> CompileResult<ExpDesc> {
        loop {
            match self.lex.peek()? {
                Token::ParL | Token::String(_) => desc = self.call(desc)?,
                _ => return Ok(desc),
            }
        }
    }

    fn call(&mut self, callee: ExpDesc) -> CompileResult<ExpDesc> {
        let func = self.sp;
        self.discharge(func, callee)?;
        self.set_sp(func + 1);

        let narg = match self.lex.next()? {
            Token::String(s) => {
                self.discharge(func + 1, ExpDesc::Constant(Value::from(s)))?;
                1
            }
            _ => {
                let args = if self.lex.peek()? == &Token::ParR {
                    ListLen::Fixed(0)
                } else {
                    self.explist_open(func + 1)?
                };
                self.expect(Token::ParR, "')'")?;
                match args {
                    ListLen::Fixed(n) => self.check_count(n)? as usize,
                    ListLen::Open(_) => MULTRET as usize,
                }
            }
        };
        Ok(ExpDesc::Call { func, narg })
    }

    /// A value count for `Call` or `Return`, which reserve `MULTRET`.
    fn check_count(&self, n: usize) -> CompileResult<u8> {
        u8::try_from(n)
            .ok()
            .filter(|&n| n != MULTRET)
            .ok_or(CompileError::TooManySlots { span: self.lex.span() })
    }

    /// Evaluates a list into exactly the slots `base .. base + want`, plus
    /// any extra values, and returns how many slots it filled. A trailing
    /// call supplies as many of the missing values as it can.
    fn explist_into(&mut self, base: usize, want: usize) -> CompileResult<usize> {
        match self.explist(base, Some(want))? {
            ListLen::Fixed(n) | ListLen::Open(n) => Ok(n),
        }
    }

    /// Evaluates a list whose trailing call keeps all of its results.
    fn explist_open(&mut self, base: usize) -> CompileResult<ListLen> {
        self.explist(base, None)
    }

    fn explist(&mut self, base: usize, want: Option<usize>) -> CompileResult<ListLen> {
        let mut count = 0;
        loop {
            let desc = self.exp()?;
            let dst = base + count;
            if self.lex.peek()? != &Token::Comma {
                return self.last_of_list(dst, count, desc, want);
            }
            self.discharge(dst, desc)?;
            self.set_sp(dst + 1);
            count += 1;
            self.lex.next()?;
        }
    }

    fn last_of_list(
        &mut self,
        dst: usize,
        count: usize,
        desc: ExpDesc,
        want: Option<usize>,
    ) -> CompileResult<ListLen> {
        match (desc, want) {
            (ExpDesc::Call { func, narg }, None) if func == dst => {
                self.emit(ByteCode::Call(func as u8, narg as u8, MULTRET));
                self.set_sp(dst);
                Ok(ListLen::Open(count))
            }
            (ExpDesc::Call { func, narg }, Some(want)) if func == dst && want > count + 1 => {
                let missing = want - count;
                self.check_slot(dst + missing - 1)?;
                let results = self.check_count(missing)?;
                self.emit(ByteCode::Call(func as u8, narg as u8, results));
                self.set_sp(dst + missing);
                Ok(ListLen::Fixed(want))
            }
            (desc, _) => {
                self.discharge(dst, desc)?;
                self.set_sp(dst + 1);
                Ok(ListLen::Fixed(count + 1))
            }
        }
    }

    fn unop(&mut self, op: UnOp, operand: ExpDesc) -> CompileResult<ExpDesc> {
        if let ExpDesc::Constant(v) = &operand {
            if let Some(folded) = op.fold(v) {
                return Ok(ExpDesc::Constant(folded));
            }
        }
        let operand = self.discharge_any(operand)?;
        Ok(ExpDesc::Unary { template: op.template(), operand })
    }

    fn binop(&mut self, op: BinOp, left: ExpDesc, right: ExpDesc) -> CompileResult<ExpDesc> {
        if let (ExpDesc::Constant(l), ExpDesc::Constant(r)) = (&left, &right) {
            if let Some(folded) = op.fold(l, r) {
                return Ok(ExpDesc::Constant(folded));
            }
        }

        // Keep the constant on the right, where it fits an operand field.
        let (op, left, right) = match (&left, &right, op.swapped()) {
            (ExpDesc::Constant(_), ExpDesc::Constant(_), _) => (op, left, right),
            (ExpDesc::Constant(_), _, Some(swapped)) => (swapped, right, left),
            _ => (op, left, right),
        };

        let left = self.discharge_any(left)?;
        match (op.compare_forms(), op.arith_forms()) {
            (Some(forms), _) => {
                let (template, right) = self.right_operand(right, forms)?;
                Ok(ExpDesc::Compare { template, left, right })
            }
            (None, Some(forms)) => {
                let (template, right) = self.right_operand(right, forms)?;
                Ok(ExpDesc::Binary { template, left, right })
            }
            (None, None) => unreachable!("`and`/`or` are compiled by `logical`"),
        }
    }

    /// Picks the immediate, constant or stack form for a right operand.
    fn right_operand<T>(&mut self, right: ExpDesc, [stack, konst, int]: [T; 3]) -> CompileResult<(T, usize)> {
        if let ExpDesc::Constant(v) = &right {
            if let Value::Integer(i @ 0..=255) = *v {
                return Ok((int, i as usize));
            }
            let k = self.add_const(v.clone())?;
            if k <= u8::MAX as usize {
                return Ok((konst, k));
            }
        }
        Ok((stack, self.discharge_any(right)?))
    }

    /// `a and b`, `a or b`: the result is whichever operand decided it.
    fn logical(&mut self, op: BinOp, left: ExpDesc, right_bp: u8) -> CompileResult<ExpDesc> {
        let dst = match left {
            ExpDesc::Local(slot) if slot >= self.locals.len() => slot,
            left => {
                let dst = self.sp;
                self.discharge(dst, left)?;
                dst
            }
        };
        let d = self.check_slot(dst)?;
        let jump = self.emit(match op {
            BinOp::And => ByteCode::JumpIfFalse(d, 0),
            _ => ByteCode::JumpIfTrue(d, 0),
        });

        let right = self.exp_limit(right_bp)?;
        self.discharge(dst, right)?;
        self.set_sp(dst + 1);
        self.patch_here(jump)?;
        Ok(ExpDesc::Local(dst))
    }

    // ── Discharge ───────────────────────────────────────────────────
    //
    // Slots and pool indices inside descriptors were range-checked when
    // they were handed out, so the narrowing casts below are lossless.

    /// Emits code leaving the value of `desc` in slot `dst`.
    fn discharge(&mut self, dst: usize, desc: ExpDesc) -> CompileResult<()> {
        let d = self.check_slot(dst)?;
        let code = match desc {
            ExpDesc::Constant(Value::Nil) => Some(ByteCode::LoadNil(d, 1)),
            ExpDesc::Constant(Value::Boolean(b)) => Some(ByteCode::LoadBool(d, b)),
            ExpDesc::Constant(Value::Integer(i)) if i16::try_from(i).is_ok() => {
                Some(ByteCode::LoadInt(d, i as i16))
            }
            ExpDesc::Constant(v) => {
                let k = self.add_const(v)?;
                Some(ByteCode::LoadConst(d, k as u16))
            }
            ExpDesc::Local(src) => (src != dst).then(|| ByteCode::Move(d, src as u8)),
            ExpDesc::Global(name) => Some(ByteCode::GetGlobal(d, name as u16)),
            ExpDesc::Unary { template, operand } => Some(template(d, operand as u8)),
            ExpDesc::Binary { template, left, right } => Some(template(d, left as u8, right as u8)),
            ExpDesc::Compare { template, left, right } => {
                self.emit(template(left as u8, right as u8, true));
                self.emit(ByteCode::SetFalseSkip(d));
                Some(ByteCode::LoadBool(d, true))
            }
            ExpDesc::Call { func, narg } => {
                self.emit(ByteCode::Call(func as u8, narg as u8, 1));
                (func != dst).then(|| ByteCode::Move(d, func as u8))
            }
        };
        if let Some(code) = code {
            self.emit(code);
        }
        if dst >= self.sp {
            self.set_sp(dst + 1);
        }
        Ok(())
    }

    /// Makes sure the value sits in some slot and returns it, allocating
    /// a fresh one only when it is not already in place.
    fn discharge_any(&mut self, desc: ExpDesc) -> CompileResult<usize> {
        match desc {
            ExpDesc::Local(slot) => Ok(slot),
            ExpDesc::Call { func, narg } => {
                self.emit(ByteCode::Call(func as u8, narg as u8, 1));
                self.set_sp(func + 1);
                Ok(func)
            }
            desc => {
                let dst = self.sp;
                self.discharge(dst, desc)?;
                Ok(dst)
            }
        }
    }

    /// Emits the test of a condition and returns the jump taken when it
    /// is false, or `None` when the condition is a true constant.
    fn test_or_jump(&mut self, cond: ExpDesc) -> CompileResult<Option<usize>> {
        match cond {
            ExpDesc::Constant(v) if v.is_truthy() => Ok(None),
            ExpDesc::Constant(_) => Ok(Some(self.emit(ByteCode::Jump(0)))),
            ExpDesc::Compare { template, left, right } => {
                self.emit(template(left as u8, right as u8, true));
                Ok(Some(self.emit(ByteCode::Jump(0))))
            }
            cond => {
                let slot = self.discharge_any(cond)?;
                Ok(Some(self.emit(ByteCode::JumpIfFalse(slot as u8, 0))))
            }
        }
    }
}
