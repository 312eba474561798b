use std::collections::HashMap;
use std::io::{self, Write};

use tracing::{debug, trace};

use crate::bytecode::{ByteCode, MULTRET, Program};
use crate::value::Value;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("attempt to perform arithmetic on a {ty} value")]
    Arithmetic { ty: &'static str },
    #[error("attempt to perform bitwise operation on a {ty} value")]
    Bitwise { ty: &'static str },
    #[error("number has no integer representation")]
    NoIntegerRepresentation,
    #[error("attempt to compare {left} with {right}")]
    Compare { left: &'static str, right: &'static str },
    #[error("attempt to concatenate a {ty} value")]
    Concat { ty: &'static str },
    #[error("attempt to get length of a {ty} value")]
    Length { ty: &'static str },
    #[error("attempt to call a {ty} value")]
    NotCallable { ty: &'static str },
    #[error("wrong number of arguments to '{name}' (expected {expected}, got {found})")]
    Arity { name: String, expected: usize, found: usize },
    #[error("attempt to perform 'n{op}0'")]
    IntegerDivideByZero { op: &'static str },
    #[error("'for' {what} value must be a number")]
    ForValue { what: &'static str },
    #[error("'for' step is zero")]
    ForZeroStep,
    #[error("output error: {0}")]
    Io(#[from] io::Error),
}

type VmResult<T> = Result<T, RuntimeError>;

/// Host function callable from scripts. Reads its arguments through the
/// window, writes results from index 0 up and returns how many it wrote.
pub type NativeFunction = fn(&mut ArgWindow<'_>) -> VmResult<usize>;

// ── Arithmetic ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArithOp {
    Add,
    Sub,
    Mul,
    Mod,
    Idiv,
    Div,
    Pow,
    BitAnd,
    BitXor,
    BitOr,
    ShiftL,
    ShiftR,
}

impl ArithOp {
    pub(crate) fn eval(self, a: &Value, b: &Value) -> VmResult<Value> {
        match self {
            ArithOp::Add => int_or_float(a, b, i64::wrapping_add, |x, y| x + y),
            ArithOp::Sub => int_or_float(a, b, i64::wrapping_sub, |x, y| x - y),
            ArithOp::Mul => int_or_float(a, b, i64::wrapping_mul, |x, y| x * y),
            ArithOp::Mod => match (a, b) {
                (Value::Integer(x), Value::Integer(y)) => int_mod(*x, *y)
                    .map(Value::Integer)
                    .ok_or(RuntimeError::IntegerDivideByZero { op: "%" }),
                _ => float_op(a, b, float_mod),
            },
            ArithOp::Idiv => match (a, b) {
                (Value::Integer(x), Value::Integer(y)) => int_idiv(*x, *y)
                    .map(Value::Integer)
                    .ok_or(RuntimeError::IntegerDivideByZero { op: "//" }),
                _ => float_op(a, b, |x, y| (x / y).floor()),
            },
            ArithOp::Div => float_op(a, b, |x, y| x / y),
            ArithOp::Pow => float_op(a, b, f64::powf),
            ArithOp::BitAnd => bitwise(a, b, |x, y| x & y),
            ArithOp::BitXor => bitwise(a, b, |x, y| x ^ y),
            ArithOp::BitOr => bitwise(a, b, |x, y| x | y),
            ArithOp::ShiftL => bitwise(a, b, shift_left),
            ArithOp::ShiftR => bitwise(a, b, |x, n| shift_left(x, n.wrapping_neg())),
        }
    }
}

fn arith_error(a: &Value, b: &Value) -> RuntimeError {
    let bad = if a.is_number() { b } else { a };
    RuntimeError::Arithmetic { ty: bad.type_name() }
}

fn int_or_float(a: &Value, b: &Value, fi: fn(i64, i64) -> i64, ff: fn(f64, f64) -> f64) -> VmResult<Value> {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Ok(Value::Integer(fi(*x, *y))),
        _ => float_op(a, b, ff),
    }
}

fn float_op(a: &Value, b: &Value, ff: fn(f64, f64) -> f64) -> VmResult<Value> {
    match (a.as_float(), b.as_float()) {
        (Some(x), Some(y)) => Ok(Value::Float(ff(x, y))),
        _ => Err(arith_error(a, b)),
    }
}

fn bitwise(a: &Value, b: &Value, f: fn(i64, i64) -> i64) -> VmResult<Value> {
    for v in [a, b] {
        if !v.is_number() {
            return Err(RuntimeError::Bitwise { ty: v.type_name() });
        }
    }
    match (a.as_integer(), b.as_integer()) {
        (Some(x), Some(y)) => Ok(Value::Integer(f(x, y))),
        _ => Err(RuntimeError::NoIntegerRepresentation),
    }
}

/// Floored modulo: the result takes the sign of the divisor.
fn int_mod(a: i64, b: i64) -> Option<i64> {
    if b == 0 {
        return None;
    }
    let r = a.wrapping_rem(b);
    Some(if r != 0 && (r ^ b) < 0 { r + b } else { r })
}

fn int_idiv(a: i64, b: i64) -> Option<i64> {
    if b == 0 {
        return None;
    }
    let q = a.wrapping_div(b);
    Some(if a.wrapping_rem(b) != 0 && (a ^ b) < 0 { q - 1 } else { q })
}

fn float_mod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && (r < 0.0) != (b < 0.0) { r + b } else { r }
}

/// Logical shift; negative counts shift the other way and counts of 64
/// or more clear every bit.
fn shift_left(a: i64, n: i64) -> i64 {
    if n <= -64 || n >= 64 {
        0
    } else if n >= 0 {
        ((a as u64) << n) as i64
    } else {
        ((a as u64) >> -n) as i64
    }
}

fn less_than(a: &Value, b: &Value) -> VmResult<bool> {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Ok(x < y),
        _ if a.is_number() && b.is_number() => Ok(a.as_float() < b.as_float()),
        _ => match (a.as_bytes(), b.as_bytes()) {
            (Some(x), Some(y)) => Ok(x < y),
            _ => Err(RuntimeError::Compare { left: a.type_name(), right: b.type_name() }),
        },
    }
}

fn less_equal(a: &Value, b: &Value) -> VmResult<bool> {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Ok(x <= y),
        _ if a.is_number() && b.is_number() => Ok(a.as_float() <= b.as_float()),
        _ => match (a.as_bytes(), b.as_bytes()) {
            (Some(x), Some(y)) => Ok(x <= y),
            _ => Err(RuntimeError::Compare { left: a.type_name(), right: b.type_name() }),
        },
    }
}

fn concat(a: &Value, b: &Value) -> VmResult<Value> {
    match (a.to_text(), b.to_text()) {
        (Some(mut x), Some(y)) => {
            x.extend_from_slice(&y);
            Ok(Value::from(x))
        }
        (None, _) => Err(RuntimeError::Concat { ty: a.type_name() }),
        (_, None) => Err(RuntimeError::Concat { ty: b.type_name() }),
    }
}

// ── Numeric for ─────────────────────────────────────────────────────

/// Converts a float limit for an integer loop. `None` means the loop
/// cannot run at all.
fn for_int_limit(limit: f64, step_up: bool) -> Option<i64> {
    const TOP: f64 = 9_223_372_036_854_775_808.0; // 2^63
    if limit.is_nan() {
        return None;
    }
    if step_up {
        let l = limit.floor();
        if l < -TOP {
            None
        } else if l >= TOP {
            Some(i64::MAX)
        } else {
            Some(l as i64)
        }
    } else {
        let l = limit.ceil();
        if l >= TOP {
            None
        } else if l < -TOP {
            Some(i64::MIN)
        } else {
            Some(l as i64)
        }
    }
}

fn for_float(v: &Value, what: &'static str) -> VmResult<f64> {
    v.as_float().ok_or(RuntimeError::ForValue { what })
}

// ── Native call window ──────────────────────────────────────────────

/// A native function's view of the stack: its arguments, followed by
/// room for its results, which overwrite the arguments from the start.
pub struct ArgWindow<'a> {
    stack: &'a mut Vec<Value>,
    base: usize,
    narg: usize,
    out: &'a mut dyn Write,
}

impl ArgWindow<'_> {
    pub fn len(&self) -> usize {
        self.narg
    }

    pub fn is_empty(&self) -> bool {
        self.narg == 0
    }

    pub fn args(&self) -> &[Value] {
        &self.stack[self.base..self.base + self.narg]
    }

    pub fn arg(&self, i: usize) -> Option<&Value> {
        self.args().get(i)
    }

    /// Stores result `i`.
    pub fn set_result(&mut self, i: usize, v: Value) {
        set_slot(self.stack, self.base + i, v);
    }

    /// Output stream of the VM running this call.
    pub fn output(&mut self) -> &mut dyn Write {
        &mut *self.out
    }

    pub fn check_arity(&self, name: &str, expected: usize) -> VmResult<()> {
        if self.narg == expected {
            Ok(())
        } else {
            Err(RuntimeError::Arity { name: name.to_string(), expected, found: self.narg })
        }
    }
}

fn set_slot(stack: &mut Vec<Value>, i: usize, v: Value) {
    if i >= stack.len() {
        stack.resize(i + 1, Value::Nil);
    }
    stack[i] = v;
}

/// `print(...)`: arguments separated by tabs, then a newline.
pub fn lib_print(w: &mut ArgWindow<'_>) -> VmResult<usize> {
    let ArgWindow { stack, base, narg, out } = w;
    for (i, v) in stack[*base..*base + *narg].iter().enumerate() {
        if i > 0 {
            out.write_all(b"\t")?;
        }
        match v.as_bytes() {
            Some(bytes) => out.write_all(bytes)?,
            None => write!(out, "{v}")?,
        }
    }
    out.write_all(b"\n")?;
    Ok(0)
}

// ── VM ──────────────────────────────────────────────────────────────

/// Executes compiled programs against a table of globals that persists
/// across `execute` calls. Script output goes to `W`.
pub struct Vm<W: Write = io::Stdout> {
    globals: HashMap<Value, Value>,
    stack: Vec<Value>,
    /// End of the values left by the last call that kept all its results.
    top: usize,
    out: W,
}

impl Vm<io::Stdout> {
    pub fn new() -> Self {
        Vm::with_output(io::stdout())
    }
}

impl Default for Vm<io::Stdout> {
    fn default() -> Self {
        Vm::new()
    }
}

impl<W: Write> Vm<W> {
    /// A VM with the standard globals installed, writing to `out`.
    pub fn with_output(out: W) -> Self {
        let mut vm = Vm { globals: HashMap::new(), stack: Vec::new(), top: 0, out };
        vm.register("print", lib_print);
        vm
    }

    pub fn register(&mut self, name: &str, f: NativeFunction) {
        self.globals.insert(Value::from(name), Value::NativeFunction(f));
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(&Value::from(name))
    }

    pub fn set_global(&mut self, name: &str, v: Value) {
        self.globals.insert(Value::from(name), v);
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    pub fn into_output(self) -> W {
        self.out
    }

    /// Runs a program to completion and returns the values of a top-level
    /// `return`, if any.
    pub fn execute(&mut self, program: &Program) -> VmResult<Vec<Value>> {
        self.stack.clear();
        self.stack.resize(program.max_slots, Value::Nil);
        self.top = 0;
        let result = self.run(program);
        match &result {
            Ok(values) => debug!(results = values.len(), "execution finished"),
            Err(e) => debug!(error = %e, "execution aborted"),
        }
        self.out.flush()?;
        result
    }

    fn get(&self, slot: u8) -> &Value {
        &self.stack[slot as usize]
    }

    fn set(&mut self, slot: u8, v: Value) {
        set_slot(&mut self.stack, slot as usize, v);
    }

    fn run(&mut self, program: &Program) -> VmResult<Vec<Value>> {
        let consts = &program.constants;
        let mut pc = 0usize;

        macro_rules! arith {
            ($op:ident, $dst:expr, $a:expr, $b:expr) => {{
                let v = ArithOp::$op.eval(self.get($a), $b)?;
                self.set($dst, v);
            }};
        }
        macro_rules! compare {
            ($test:expr, $expected:expr) => {{
                if ($test) == $expected {
                    pc += 1;
                }
            }};
        }
        macro_rules! jump {
            ($offset:expr) => {{
                pc = pc.wrapping_add_signed($offset as isize);
            }};
        }

        while let Some(&code) = program.byte_codes.get(pc) {
            trace!(pc, ?code, "dispatch");
            match code {
                ByteCode::LoadNil(dst, n) => {
                    for i in 0..n {
                        self.set(dst + i, Value::Nil);
                    }
                }
                ByteCode::LoadBool(dst, b) => self.set(dst, Value::Boolean(b)),
                ByteCode::LoadInt(dst, i) => self.set(dst, Value::Integer(i as i64)),
                ByteCode::LoadConst(dst, k) => self.set(dst, consts[k as usize].clone()),
                ByteCode::Move(dst, src) => self.set(dst, self.get(src).clone()),

                ByteCode::GetGlobal(dst, name) => {
                    let v = self.globals.get(&consts[name as usize]).cloned().unwrap_or(Value::Nil);
                    self.set(dst, v);
                }
                ByteCode::SetGlobal(name, src) => {
                    let v = self.get(src).clone();
                    self.store_global(&consts[name as usize], v);
                }
                ByteCode::SetGlobalConst(name, k) => {
                    self.store_global(&consts[name as usize], consts[k as usize].clone());
                }

                ByteCode::Jump(o) => jump!(o),
                ByteCode::JumpIfTrue(src, o) => {
                    if self.get(src).is_truthy() {
                        jump!(o);
                    }
                }
                ByteCode::JumpIfFalse(src, o) => {
                    if !self.get(src).is_truthy() {
                        jump!(o);
                    }
                }
                ByteCode::ForPrepare(base, o) => {
                    if !self.for_prepare(base as usize)? {
                        jump!(o);
                    }
                }
                ByteCode::ForLoop(base, o) => {
                    if self.for_loop(base as usize)? {
                        jump!(o);
                    }
                }
                ByteCode::Call(func, narg, want) => self.call(func as usize, narg, want)?,
                ByteCode::Return(first, n) => {
                    let first = first as usize;
                    let end = if n == MULTRET { self.top } else { first + n as usize };
                    return Ok(self.stack[first..end].to_vec());
                }

                ByteCode::Neg(dst, src) => {
                    let v = match self.get(src) {
                        Value::Integer(i) => Value::Integer(i.wrapping_neg()),
                        Value::Float(f) => Value::Float(-f),
                        v => return Err(RuntimeError::Arithmetic { ty: v.type_name() }),
                    };
                    self.set(dst, v);
                }
                ByteCode::Not(dst, src) => self.set(dst, Value::Boolean(!self.get(src).is_truthy())),
                ByteCode::BitNot(dst, src) => {
                    let v = self.get(src);
                    if !v.is_number() {
                        return Err(RuntimeError::Bitwise { ty: v.type_name() });
                    }
                    let i = v.as_integer().ok_or(RuntimeError::NoIntegerRepresentation)?;
                    self.set(dst, Value::Integer(!i));
                }
                ByteCode::Len(dst, src) => {
                    let v = self.get(src);
                    let len = v.as_bytes().ok_or(RuntimeError::Length { ty: v.type_name() })?.len();
                    self.set(dst, Value::Integer(len as i64));
                }

                ByteCode::Add(d, a, b) => arith!(Add, d, a, self.get(b)),
                ByteCode::AddConst(d, a, k) => arith!(Add, d, a, &consts[k as usize]),
                ByteCode::AddInt(d, a, i) => arith!(Add, d, a, &Value::Integer(i as i64)),
                ByteCode::Sub(d, a, b) => arith!(Sub, d, a, self.get(b)),
                ByteCode::SubConst(d, a, k) => arith!(Sub, d, a, &consts[k as usize]),
                ByteCode::SubInt(d, a, i) => arith!(Sub, d, a, &Value::Integer(i as i64)),
                ByteCode::Mul(d, a, b) => arith!(Mul, d, a, self.get(b)),
                ByteCode::MulConst(d, a, k) => arith!(Mul, d, a, &consts[k as usize]),
                ByteCode::MulInt(d, a, i) => arith!(Mul, d, a, &Value::Integer(i as i64)),
                ByteCode::Mod(d, a, b) => arith!(Mod, d, a, self.get(b)),
                ByteCode::ModConst(d, a, k) => arith!(Mod, d, a, &consts[k as usize]),
                ByteCode::ModInt(d, a, i) => arith!(Mod, d, a, &Value::Integer(i as i64)),
                ByteCode::Idiv(d, a, b) => arith!(Idiv, d, a, self.get(b)),
                ByteCode::IdivConst(d, a, k) => arith!(Idiv, d, a, &consts[k as usize]),
                ByteCode::IdivInt(d, a, i) => arith!(Idiv, d, a, &Value::Integer(i as i64)),
                ByteCode::Div(d, a, b) => arith!(Div, d, a, self.get(b)),
                ByteCode::DivConst(d, a, k) => arith!(Div, d, a, &consts[k as usize]),
                ByteCode::DivInt(d, a, i) => arith!(Div, d, a, &Value::Integer(i as i64)),
                ByteCode::Pow(d, a, b) => arith!(Pow, d, a, self.get(b)),
                ByteCode::PowConst(d, a, k) => arith!(Pow, d, a, &consts[k as usize]),
                ByteCode::PowInt(d, a, i) => arith!(Pow, d, a, &Value::Integer(i as i64)),
                ByteCode::BitAnd(d, a, b) => arith!(BitAnd, d, a, self.get(b)),
                ByteCode::BitAndConst(d, a, k) => arith!(BitAnd, d, a, &consts[k as usize]),
                ByteCode::BitAndInt(d, a, i) => arith!(BitAnd, d, a, &Value::Integer(i as i64)),
                ByteCode::BitXor(d, a, b) => arith!(BitXor, d, a, self.get(b)),
                ByteCode::BitXorConst(d, a, k) => arith!(BitXor, d, a, &consts[k as usize]),
                ByteCode::BitXorInt(d, a, i) => arith!(BitXor, d, a, &Value::Integer(i as i64)),
                ByteCode::BitOr(d, a, b) => arith!(BitOr, d, a, self.get(b)),
                ByteCode::BitOrConst(d, a, k) => arith!(BitOr, d, a, &consts[k as usize]),
                ByteCode::BitOrInt(d, a, i) => arith!(BitOr, d, a, &Value::Integer(i as i64)),
                ByteCode::ShiftL(d, a, b) => arith!(ShiftL, d, a, self.get(b)),
                ByteCode::ShiftLConst(d, a, k) => arith!(ShiftL, d, a, &consts[k as usize]),
                ByteCode::ShiftLInt(d, a, i) => arith!(ShiftL, d, a, &Value::Integer(i as i64)),
                ByteCode::ShiftR(d, a, b) => arith!(ShiftR, d, a, self.get(b)),
                ByteCode::ShiftRConst(d, a, k) => arith!(ShiftR, d, a, &consts[k as usize]),
                ByteCode::ShiftRInt(d, a, i) => arith!(ShiftR, d, a, &Value::Integer(i as i64)),
                ByteCode::Concat(d, a, b) => {
                    let v = concat(self.get(a), self.get(b))?;
                    self.set(d, v);
                }
                ByteCode::ConcatConst(d, a, k) => {
                    let v = concat(self.get(a), &consts[k as usize])?;
                    self.set(d, v);
                }
                ByteCode::ConcatInt(d, a, i) => {
                    let v = concat(self.get(a), &Value::Integer(i as i64))?;
                    self.set(d, v);
                }

                ByteCode::Equal(a, b, r) => compare!(self.get(a) == self.get(b), r),
                ByteCode::EqualConst(a, k, r) => compare!(self.get(a) == &consts[k as usize], r),
                ByteCode::EqualInt(a, i, r) => compare!(*self.get(a) == Value::Integer(i as i64), r),
                ByteCode::NotEq(a, b, r) => compare!(self.get(a) != self.get(b), r),
                ByteCode::NotEqConst(a, k, r) => compare!(self.get(a) != &consts[k as usize], r),
                ByteCode::NotEqInt(a, i, r) => compare!(*self.get(a) != Value::Integer(i as i64), r),
                ByteCode::Less(a, b, r) => compare!(less_than(self.get(a), self.get(b))?, r),
                ByteCode::LessConst(a, k, r) => compare!(less_than(self.get(a), &consts[k as usize])?, r),
                ByteCode::LessInt(a, i, r) => compare!(less_than(self.get(a), &Value::Integer(i as i64))?, r),
                ByteCode::LesEq(a, b, r) => compare!(less_equal(self.get(a), self.get(b))?, r),
                ByteCode::LesEqConst(a, k, r) => compare!(less_equal(self.get(a), &consts[k as usize])?, r),
                ByteCode::LesEqInt(a, i, r) => compare!(less_equal(self.get(a), &Value::Integer(i as i64))?, r),
                ByteCode::Greater(a, b, r) => compare!(less_than(self.get(b), self.get(a))?, r),
                ByteCode::GreaterConst(a, k, r) => compare!(less_than(&consts[k as usize], self.get(a))?, r),
                ByteCode::GreaterInt(a, i, r) => compare!(less_than(&Value::Integer(i as i64), self.get(a))?, r),
                ByteCode::GreEq(a, b, r) => compare!(less_equal(self.get(b), self.get(a))?, r),
                ByteCode::GreEqConst(a, k, r) => compare!(less_equal(&consts[k as usize], self.get(a))?, r),
                ByteCode::GreEqInt(a, i, r) => compare!(less_equal(&Value::Integer(i as i64), self.get(a))?, r),

                ByteCode::SetFalseSkip(dst) => {
                    self.set(dst, Value::Boolean(false));
                    pc += 1;
                }
            }
            pc += 1;
        }
        Ok(Vec::new())
    }

    fn store_global(&mut self, name: &Value, v: Value) {
        if let Value::Nil = v {
            self.globals.remove(name);
        } else {
            self.globals.insert(name.clone(), v);
        }
    }

    /// `narg` and `want` are raw operands, either of which may be `MULTRET`.
    fn call(&mut self, func: usize, narg: u8, want: u8) -> VmResult<()> {
        let f = match &self.stack[func] {
            Value::NativeFunction(f) => *f,
            v => return Err(RuntimeError::NotCallable { ty: v.type_name() }),
        };
        let base = func + 1;
        let narg = if narg == MULTRET { self.top.saturating_sub(base) } else { narg as usize };
        let nret = {
            let mut window = ArgWindow { stack: &mut self.stack, base, narg, out: &mut self.out };
            f(&mut window)?
        };
        let want = if want == MULTRET {
            self.top = func + nret;
            nret
        } else {
            want as usize
        };
        // Results move down over the function slot; missing ones are nil.
        for i in 0..want {
            let v = if i < nret {
                self.stack.get_mut(base + i).map_or(Value::Nil, |v| std::mem::replace(v, Value::Nil))
            } else {
                Value::Nil
            };
            set_slot(&mut self.stack, func + i, v);
        }
        Ok(())
    }

    /// Normalizes the loop control slots. Returns whether the body runs.
    fn for_prepare(&mut self, base: usize) -> VmResult<bool> {
        if let (Value::Integer(init), Value::Integer(step)) = (&self.stack[base], &self.stack[base + 2]) {
            let (init, step) = (*init, *step);
            if step == 0 {
                return Err(RuntimeError::ForZeroStep);
            }
            let limit = match self.stack[base + 1] {
                Value::Integer(l) => Some(l),
                Value::Float(l) => for_int_limit(l, step > 0),
                _ => return Err(RuntimeError::ForValue { what: "limit" }),
            };
            let Some(limit) = limit else { return Ok(false) };
            self.stack[base + 1] = Value::Integer(limit);
            let runs = if step > 0 { init <= limit } else { init >= limit };
            if runs {
                self.stack[base + 3] = Value::Integer(init);
            }
            return Ok(runs);
        }

        let init = for_float(&self.stack[base], "initial")?;
        let limit = for_float(&self.stack[base + 1], "limit")?;
        let step = for_float(&self.stack[base + 2], "step")?;
        if step == 0.0 {
            return Err(RuntimeError::ForZeroStep);
        }
        self.stack[base] = Value::Float(init);
        self.stack[base + 1] = Value::Float(limit);
        self.stack[base + 2] = Value::Float(step);
        let runs = if step > 0.0 { init <= limit } else { init >= limit };
        if runs {
            self.stack[base + 3] = Value::Float(init);
        }
        Ok(runs)
    }

    /// Steps the counter. Returns whether to run the body again.
    fn for_loop(&mut self, base: usize) -> VmResult<bool> {
        match (&self.stack[base], &self.stack[base + 1], &self.stack[base + 2]) {
            (Value::Integer(i), Value::Integer(limit), Value::Integer(step)) => {
                let (limit, step) = (*limit, *step);
                // Stepping past the integer range ends the loop.
                let Some(next) = i.checked_add(step) else { return Ok(false) };
                let runs = if step > 0 { next <= limit } else { next >= limit };
                if runs {
                    self.stack[base] = Value::Integer(next);
                    self.stack[base + 3] = Value::Integer(next);
                }
                Ok(runs)
            }
            (Value::Float(f), Value::Float(limit), Value::Float(step)) => {
                let (next, limit, step) = (f + step, *limit, *step);
                let runs = if step > 0.0 { next <= limit } else { next >= limit };
                if runs {
                    self.stack[base] = Value::Float(next);
                    self.stack[base + 3] = Value::Float(next);
                }
                Ok(runs)
            }
            _ => Err(RuntimeError::ForValue { what: "initial" }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::compile;

    fn run(source: &str) -> (Vec<Value>, String) {
        let program = compile(source).unwrap();
        let mut vm = Vm::with_output(Vec::new());
        let results = vm.execute(&program).unwrap();
        (results, String::from_utf8(vm.into_output()).unwrap())
    }

    fn eval(source: &str) -> Value {
        let (mut results, _) = run(source);
        assert_eq!(results.len(), 1, "expected one result from {source}");
        results.remove(0)
    }

    fn output(source: &str) -> String {
        run(source).1
    }

    fn run_err(source: &str) -> RuntimeError {
        let program = compile(source).unwrap();
        let mut vm = Vm::with_output(Vec::new());
        vm.execute(&program).unwrap_err()
    }

    #[test]
    fn integer_arithmetic_stays_integer() {
        assert!(matches!(eval("return 1 + 2 * 3"), Value::Integer(7)));
        assert!(matches!(eval("local a = 7 return a // 2"), Value::Integer(3)));
        assert!(matches!(eval("local a = -7 return a // 2"), Value::Integer(-4)));
        assert!(matches!(eval("local a = -7 return a % 3"), Value::Integer(2)));
        assert!(matches!(eval("local a = 7 return a % -3"), Value::Integer(-2)));
        assert!(matches!(eval("local a = 9223372036854775807 return a + 1"), Value::Integer(i64::MIN)));
    }

    #[test]
    fn mixed_arithmetic_produces_floats() {
        assert!(matches!(eval("local a = 1 return a + 1.0"), Value::Float(f) if f == 2.0));
        assert!(matches!(eval("local a = 5 return a / 2"), Value::Float(f) if f == 2.5));
        assert!(matches!(eval("local a = 4 return a / 2"), Value::Float(f) if f == 2.0));
        assert!(matches!(eval("local a = 2 return a ^ 10"), Value::Float(f) if f == 1024.0));
        assert!(matches!(eval("local a = 5.5 return a % 2"), Value::Float(f) if f == 1.5));
        assert!(matches!(eval("local a = 7.5 return a // 2"), Value::Float(f) if f == 3.0));
    }

    #[test]
    fn float_division_by_zero_is_not_an_error() {
        assert!(matches!(eval("local a = 1 return a / 0"), Value::Float(f) if f == f64::INFINITY));
        assert!(matches!(eval("local a = 1.0 return a // 0"), Value::Float(f) if f == f64::INFINITY));
    }

    #[test]
    fn integer_division_by_zero_is_an_error() {
        let e = run_err("local a = 1 return a // 0");
        assert!(matches!(e, RuntimeError::IntegerDivideByZero { op: "//" }));
        assert_eq!(run_err("local a = 1 return a % 0").to_string(), "attempt to perform 'n%0'");
    }

    #[test]
    fn bitwise_operators() {
        assert!(matches!(eval("local a = 6 return a & 3"), Value::Integer(2)));
        assert!(matches!(eval("local a = 6 return a | 1"), Value::Integer(7)));
        assert!(matches!(eval("local a = 6 return a ~ 3"), Value::Integer(5)));
        assert!(matches!(eval("local a = 1 return a << 4"), Value::Integer(16)));
        assert!(matches!(eval("local a = -1 return a >> 60"), Value::Integer(15)));
        assert!(matches!(eval("local a = 1 return a << 64"), Value::Integer(0)));
        assert!(matches!(eval("local a = 2.0 return a | 1"), Value::Integer(3)));
        assert!(matches!(eval("local a = 5 return ~a"), Value::Integer(-6)));
        assert!(matches!(run_err("local a = 1.5 return a | 1"), RuntimeError::NoIntegerRepresentation));
        assert!(matches!(run_err("local a = 'x' return a & 1"), RuntimeError::Bitwise { ty: "string" }));
    }

    #[test]
    fn numbers_compare_across_subtypes() {
        assert!(matches!(eval("local a = 1 return a == 1.0"), Value::Boolean(true)));
        assert!(matches!(eval("local a = 1 return a < 1.5"), Value::Boolean(true)));
        assert!(matches!(eval("local a = 2 return 3 <= a"), Value::Boolean(false)));
        assert!(matches!(eval("local a = 'a' return a < 'b'"), Value::Boolean(true)));
        assert!(matches!(eval("local a = '1' return a == 1"), Value::Boolean(false)));
        assert!(matches!(eval("local a = nil return a ~= false"), Value::Boolean(true)));
    }

    #[test]
    fn ordering_mismatched_types_is_an_error() {
        let e = run_err("local a = 1 return a < 'x'");
        assert_eq!(e.to_string(), "attempt to compare number with string");
    }

    #[test]
    fn arithmetic_on_non_numbers_is_an_error() {
        assert!(matches!(run_err("return 'x' + 1"), RuntimeError::Arithmetic { ty: "string" }));
        assert!(matches!(run_err("local t = nil return -t"), RuntimeError::Arithmetic { ty: "nil" }));
    }

    #[test]
    fn concat_and_length() {
        assert_eq!(eval("local a = 'x' return a .. 1 .. 2.0"), Value::from("x12.0"));
        assert!(matches!(eval("local s = 'hello' return #s"), Value::Integer(5)));
        assert!(matches!(run_err("local a = true return a .. 'x'"), RuntimeError::Concat { ty: "boolean" }));
        assert!(matches!(run_err("local a = 3 return #a"), RuntimeError::Length { ty: "number" }));
    }

    #[test]
    fn long_strings_behave_as_values() {
        let v = eval("local a = 'abcdefghijklmnopqrstuvwxyz' local b = a return b .. ''");
        assert_eq!(v, Value::from("abcdefghijklmnopqrstuvwxyz"));
        assert!(matches!(v, Value::LongStr(_)));
    }

    #[test]
    fn logical_operators_yield_operands() {
        assert!(matches!(eval("local a = nil return a or 3"), Value::Integer(3)));
        assert!(matches!(eval("local a = false return a and 3"), Value::Boolean(false)));
        assert!(matches!(eval("local a = 1 return a and 'x' or 'y'"), Value::ShortStr(..)));
        assert!(matches!(eval("local a = nil return not a"), Value::Boolean(true)));
    }

    #[test]
    fn while_with_break() {
        let out = output("local i = 0 while true do i = i + 1 if i == 5 then break end end print(i)");
        assert_eq!(out, "5\n");
    }

    #[test]
    fn continue_skips_rest_of_body() {
        let out = output(
            "local i = 0 while i < 6 do i = i + 1 if i % 2 == 0 then continue end print(i) end",
        );
        assert_eq!(out, "1\n3\n5\n");
        let out = output("local n = 0 repeat n = n + 1 if n < 3 then continue end print(n) until n >= 4");
        assert_eq!(out, "3\n4\n");
    }

    #[test]
    fn repeat_condition_sees_body_locals() {
        let out = output("local i = 0 repeat local done = i >= 2 print(i) i = i + 1 until done");
        assert_eq!(out, "0\n1\n2\n");
    }

    #[test]
    fn numeric_for_loops() {
        assert_eq!(output("for i = 1, 3 do print(i) end"), "1\n2\n3\n");
        assert_eq!(output("for i = 3, 1, -1 do print(i) end"), "3\n2\n1\n");
        assert_eq!(output("for i = 1, 0 do print(i) end"), "");
        assert_eq!(output("for i = 1, 2, 0.5 do print(i) end"), "1.0\n1.5\n2.0\n");
        assert_eq!(output("for i = 1, 2.9 do print(i) end"), "1\n2\n");
        assert_eq!(output("for i = 1, 5 do if i == 3 then break end print(i) end"), "1\n2\n");
        assert_eq!(output("for i = 1, 4 do if i % 2 == 1 then continue end print(i) end"), "2\n4\n");
    }

    #[test]
    fn numeric_for_stops_at_integer_overflow() {
        let out = output("for i = 9223372036854775806, 9223372036854775807 do print(i) end");
        assert_eq!(out, "9223372036854775806\n9223372036854775807\n");
    }

    #[test]
    fn numeric_for_rejects_bad_control_values() {
        assert!(matches!(run_err("for i = 1, 10, 0 do end"), RuntimeError::ForZeroStep));
        assert!(matches!(run_err("for i = 1, 'x' do end"), RuntimeError::ForValue { what: "limit" }));
        assert!(matches!(run_err("for i = nil, 2 do end"), RuntimeError::ForValue { what: "initial" }));
    }

    #[test]
    fn print_separates_with_tabs() {
        assert_eq!(output("print(1, 'a', nil, true, 2.5)"), "1\ta\tnil\ttrue\t2.5\n");
        assert_eq!(output("print()"), "\n");
    }

    #[test]
    fn globals_persist_across_executions() {
        let mut vm = Vm::with_output(Vec::new());
        vm.execute(&compile("counter = 41").unwrap()).unwrap();
        vm.execute(&compile("counter = counter + 1").unwrap()).unwrap();
        assert_eq!(vm.global("counter"), Some(&Value::Integer(42)));
        vm.execute(&compile("counter = nil").unwrap()).unwrap();
        assert_eq!(vm.global("counter"), None);
    }

    #[test]
    fn calling_a_non_function_is_an_error() {
        assert!(matches!(run_err("x = 1 x()"), RuntimeError::NotCallable { ty: "number" }));
        assert!(matches!(run_err("undefined()"), RuntimeError::NotCallable { ty: "nil" }));
    }

    fn lib_pair(w: &mut ArgWindow<'_>) -> VmResult<usize> {
        w.check_arity("pair", 2)?;
        let (a, b) = (w.arg(0).cloned(), w.arg(1).cloned());
        w.set_result(0, b.unwrap_or(Value::Nil));
        w.set_result(1, a.unwrap_or(Value::Nil));
        Ok(2)
    }

    #[test]
    fn natives_receive_their_window() {
        let mut vm = Vm::with_output(Vec::new());
        vm.register("pair", lib_pair);
        let results = vm.execute(&compile("local x = pair(1, 'b') return x").unwrap()).unwrap();
        assert_eq!(results, vec![Value::from("b")]);

        let e = vm.execute(&compile("pair(1)").unwrap()).unwrap_err();
        assert!(matches!(&e, RuntimeError::Arity { expected: 2, found: 1, .. }), "{e}");
    }

    fn pair_vm() -> Vm<Vec<u8>> {
        let mut vm = Vm::with_output(Vec::new());
        vm.register("pair", lib_pair);
        vm
    }

    fn run_with_pair(source: &str) -> (Vec<Value>, String) {
        let mut vm = pair_vm();
        let results = vm.execute(&compile(source).unwrap()).unwrap();
        (results, String::from_utf8(vm.into_output()).unwrap())
    }

    #[test]
    fn trailing_call_spreads_its_results() {
        let (_, out) = run_with_pair("local a, b = pair(1, 2) print(a, b) print(pair(3, 4))");
        assert_eq!(out, "2\t1\n4\t3\n");

        let (_, out) = run_with_pair("print(0, pair(3, 4)) print(pair(3, 4), 0) print((pair(3, 4)))");
        assert_eq!(out, "0\t4\t3\n4\t0\n4\n");

        let (_, out) = run_with_pair("local a, b, c = pair(1, 2) x, y = pair('p', 'q') print(a, b, c, x, y)");
        assert_eq!(out, "2\t1\tnil\tq\tp\n");
    }

    #[test]
    fn return_passes_every_result_through() {
        let (results, _) = run_with_pair("return 0, pair(1, 2)");
        assert_eq!(results, vec![Value::Integer(0), Value::Integer(2), Value::Integer(1)]);
        let (results, _) = run_with_pair("return pair(pair(1, 2))");
        assert_eq!(results, vec![Value::Integer(1), Value::Integer(2)]);
    }

    #[test]
    fn open_argument_count_reaches_arity_checks() {
        let e = pair_vm().execute(&compile("pair(1, pair(2, 3))").unwrap()).unwrap_err();
        assert!(matches!(&e, RuntimeError::Arity { expected: 2, found: 3, .. }), "{e}");
    }

    #[test]
    fn large_float_literals_and_canonical_text() {
        assert_eq!(output("print(9223372036854775808, -9223372036854775808)"), "9.2233720368548e+18\t-9.2233720368548e+18\n");
        assert_eq!(output("print(0.1 + 0.2, 1e15, 2^53, 100 / 2)"), "0.3\t1e+15\t9.007199254741e+15\t50.0\n");
        assert_eq!(eval("local a = 'v' return a .. 0.1 + 0.2"), Value::from("v0.3"));
    }

    #[test]
    fn parenthesized_callee_statement() {
        assert_eq!(output("(print)('called')"), "called\n");
    }

    #[test]
    fn long_sums_fit_in_the_stack() {
        let terms = vec!["x"; 200].join(" + ");
        assert_eq!(output(&format!("local x = 1 print({terms})")), "200\n");
    }

    #[test]
    fn wide_local_list_starts_as_nil() {
        let names: Vec<String> = (0..256).map(|i| format!("v{i}")).collect();
        let src = format!("do local a = 1 end local {} if v0 then seen = true end", names.join(", "));
        let mut vm = Vm::with_output(Vec::new());
        vm.execute(&compile(&src).unwrap()).unwrap();
        assert_eq!(vm.global("seen"), None);
    }

    #[test]
    fn missing_return_yields_no_values() {
        let (results, _) = run("local a = 1");
        assert!(results.is_empty());
    }
}
