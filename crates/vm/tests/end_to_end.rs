//! End-to-end scenarios that cross module boundaries (compiler peephole
//! output -> VM dispatch -> host-visible result), complementing the
//! per-module unit tests that already live beside `vm.rs`, `modules.rs`
//! and `compiler.rs`.

use hymn_vm::{Vm, VmConfig};
use std::cell::RefCell;
use std::rc::Rc;

fn run(source: &str) -> (Result<hymn_core::Value, String>, Vec<String>) {
    let output = Rc::new(RefCell::new(Vec::new()));
    let sink = output.clone();
    let mut vm = Vm::with_print_hook(VmConfig::default(), move |s| sink.borrow_mut().push(s.to_string()));
    let result = vm.interpret(source, "<test>");
    let lines = output.borrow().clone();
    (result, lines)
}

#[test]
fn while_loop_with_fused_comparison_jump_counts_correctly() {
    let source = "let i = 0\nlet sum = 0\nwhile i < 5\nsum = sum + i\ni = i + 1\nend\nprint sum";
    let (result, output) = run(source);
    assert!(result.is_ok(), "{result:?}");
    assert_eq!(output, vec!["10"]);
}

#[test]
fn break_and_continue_unwind_loop_locals_without_leaking_stack_depth() {
    let source = "let total = 0\nfor let i = 0, i < 10, i = i + 1\nif i == 7\nbreak\nend\nif i % 2 == 0\ncontinue\nend\ntotal = total + i\nend\nprint total";
    let (result, output) = run(source);
    assert!(result.is_ok(), "{result:?}");
    // odd i in 1..6: 1 + 3 + 5 = 9
    assert_eq!(output, vec!["9"]);
}

#[test]
fn recursive_function_calls_compile_and_run_correctly() {
    let source = "function fact(n)\nif n <= 1\nreturn 1\nend\nreturn n * fact(n - 1)\nend\nprint fact(6)";
    let (result, output) = run(source);
    assert!(result.is_ok(), "{result:?}");
    assert_eq!(output, vec!["720"]);
}

#[test]
fn deeply_nested_if_elif_chains_with_fused_jumps_pick_the_right_branch() {
    let source = "function classify(x)\nif x < 0\nreturn \"neg\"\nelif x == 0\nreturn \"zero\"\nelif x < 10\nif x < 5\nreturn \"small\"\nelse\nreturn \"mid\"\nend\nelse\nreturn \"big\"\nend\nend\nprint classify(-1)\nprint classify(0)\nprint classify(3)\nprint classify(7)\nprint classify(20)";
    let (result, output) = run(source);
    assert!(result.is_ok(), "{result:?}");
    assert_eq!(output, vec!["neg", "zero", "small", "mid", "big"]);
}

#[test]
fn module_import_populates_globals_visible_to_the_importer() {
    let dir = tempfile::tempdir().unwrap();
    let lib_path = dir.path().join("lib.hm");
    std::fs::write(&lib_path, "let greeting = \"hi\"\n").unwrap();

    let main_path = dir.path().join("main.hm");
    let source = "use \"lib\"\nprint greeting";
    std::fs::write(&main_path, source).unwrap();

    let output = Rc::new(RefCell::new(Vec::new()));
    let sink = output.clone();
    let mut vm = Vm::with_print_hook(VmConfig::default(), move |s| sink.borrow_mut().push(s.to_string()));
    let result = vm.interpret(source, &main_path.to_string_lossy());
    assert!(result.is_ok(), "{result:?}");
    assert_eq!(output.borrow().clone(), vec!["hi"]);
}

#[test]
fn host_native_function_and_defined_global_are_both_reachable_from_script() {
    let mut vm = Vm::new(VmConfig::default());
    vm.define_global("PI_ISH", hymn_core::Value::Float(3.14));
    vm.define_native("inc", Some(1), |_strings, args| match &args[0] {
        hymn_core::Value::Int(n) => Ok(hymn_core::Value::Int(n + 1)),
        other => Err(hymn_core::Value::String(
            hymn_core::StringTable::new().intern(&format!("expected int, got {}", other.type_name())),
        )),
    });
    let result = vm.interpret("print inc(2)\nprint PI_ISH", "<test>");
    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn disassembly_lists_every_function_including_nested_ones() {
    let mut strings = hymn_core::StringTable::new();
    let compiler = hymn_vm::Compiler::new(
        "function helper(x)\nreturn x * 2\nend\nprint helper(21)",
        "<test>",
        &mut strings,
    );
    let (function, err) = compiler.compile();
    assert!(err.is_none(), "{err:?}");
    let listing = hymn_vm::disasm::disassemble(&function);
    assert!(listing.contains("== <script> =="));
    assert!(listing.contains("== helper =="));
    assert!(listing.contains("RETURN"));
}
