//! moonlet: a single-pass bytecode compiler and stack VM for a small
//! Lua-like language.
//!
//! ```
//! let program = moonlet::compile("local a = 6 return a * 7").unwrap();
//! let mut vm = moonlet::Vm::with_output(Vec::new());
//! assert_eq!(vm.execute(&program).unwrap(), vec![moonlet::Value::Integer(42)]);
//! ```

pub mod bytecode;
pub mod diagnostic;
pub mod lexer;
pub mod parser;
pub mod value;
pub mod vm;

pub use bytecode::{ByteCode, Program};
pub use parser::{CompileError, compile};
pub use value::Value;
pub use vm::{ArgWindow, NativeFunction, RuntimeError, Vm};

/// Runs a program on a fresh VM that prints to stdout.
pub fn execute(program: &Program) -> Result<Vec<Value>, RuntimeError> {
    Vm::new().execute(program)
}
