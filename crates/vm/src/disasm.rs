//! Bytecode disassembler, backing the CLI's `-d` flag. Walks one unit of
//! emitted code at a time and prints it annotated with source lines —
//! here the unit is a decoded [`Opcode`] rather than an LLVM instruction.

use crate::opcode::Opcode;
use hymn_core::{ConstantValue, Function};
use std::fmt::Write as _;

/// Render `function` and, recursively, every nested function it closes
/// over or references through its constant pool, as a flat listing.
pub fn disassemble(function: &Function) -> String {
    let mut out = String::new();
    disassemble_into(&mut out, function);
    out
}

fn disassemble_into(out: &mut String, function: &Function) {
    let name = function.name.as_ref().map(|n| n.as_str()).unwrap_or("<script>");
    let _ = writeln!(out, "== {name} ==");

    let code = &function.code.code;
    let mut ip = 0;
    let mut last_line = 0;
    while ip < code.len() {
        let op = Opcode::decode(code, ip);
        let line = function.code.line_at(ip);
        let line_col = if line == last_line { "   |".to_string() } else { format!("{line:4}") };
        last_line = line;

        let operand = describe_operand(op, function);
        let _ = writeln!(out, "{ip:04} {line_col} {:<26}{operand}", op.mnemonic());

        ip += op.encoded_len();
    }

    for constant in &function.code.constants {
        if let ConstantValue::Function(nested) = constant {
            let _ = writeln!(out);
            disassemble_into(out, nested);
        }
    }
}

fn describe_operand(op: Opcode, function: &Function) -> String {
    use Opcode::*;
    match op {
        PopN(n) => n.to_string(),
        Increment(n) => n.to_string(),
        GetLocal(s) | SetLocal(s) => s.to_string(),
        Call(n) | TailCall(n) => n.to_string(),
        AddTwoLocal(s, t) => format!("{s} {t}"),
        IncrementLocal(s, by) | IncrementLocalAndSet(s, by) => format!("{s} {by}"),
        Constant(k) => format!("{k} ; {}", describe_constant(function, k)),
        DefineGlobal(k) | GetGlobal(k) | SetGlobal(k) | GetProperty(k) | SetProperty(k) => {
            format!("{k} ; {}", describe_constant(function, k))
        }
        Jump(off) | JumpIfFalse(off) | JumpIfTrue(off) | JumpIfEqual(off) | JumpIfNotEqual(off)
        | JumpIfLess(off) | JumpIfLessEqual(off) | JumpIfGreater(off) | JumpIfGreaterEqual(off) => {
            format!("+{off}")
        }
        Loop(off) => format!("-{off}"),
        _ => String::new(),
    }
}

fn describe_constant(function: &Function, idx: u16) -> String {
    match function.code.constant(idx) {
        ConstantValue::Int(n) => n.to_string(),
        ConstantValue::Float(f) => f.to_string(),
        ConstantValue::String(s) => format!("{:?}", s.as_str()),
        ConstantValue::Function(f) => format!("<fn {}>", f.name.as_ref().map(|n| n.as_str()).unwrap_or("?")),
        ConstantValue::FreshArray => "[]".to_string(),
        ConstantValue::FreshTable => "{}".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use hymn_core::StringTable;

    fn compile(source: &str) -> Function {
        let mut strings = StringTable::new();
        let compiler = Compiler::new(source, "<test>", &mut strings);
        let (function, err) = compiler.compile();
        assert!(err.is_none(), "{err:?}");
        function
    }

    #[test]
    fn disassembles_constants_and_arithmetic() {
        let function = compile("let a = 1 + 2\nprint a");
        let listing = disassemble(&function);
        assert!(listing.contains("CONSTANT"));
        assert!(listing.contains("PRINT"));
    }

    #[test]
    fn nested_function_listed_after_enclosing_one() {
        let function = compile("function f(x)\nreturn x\nend\nprint f(1)");
        let listing = disassemble(&function);
        let script_pos = listing.find("<script>").unwrap();
        let f_pos = listing.find("== f ==").unwrap();
        assert!(script_pos < f_pos);
    }
}
