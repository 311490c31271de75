//! Single-pass Pratt compiler: source text straight to a [`Function`] of
//! bytecode, with a peephole optimizer running inline as instructions are
//! emitted.
//!
//! Structured around recursive-descent token consumption
//! (`advance`/`check`/`consume` on a `Token` stream with row/column
//! tracking) generalized to Hymn's full expression-precedence grammar.
//! The dispatch table is expressed as a match over token kinds in one
//! function rather than function pointers per token kind — a tradeoff
//! that reads clearer in Rust than a parallel array of fn pointers would.

use crate::error::CompileError;
use crate::opcode::Opcode;
use crate::scanner::{Scanner, Token, TokenKind};
use hymn_core::{ByteCode, ConstantValue, ExceptionRange, Function, StringTable};
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assign,
    Bits,
    Or,
    And,
    Equality,
    Compare,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        use Precedence::*;
        match self {
            None => Assign,
            Assign => Bits,
            Bits => Or,
            Or => And,
            And => Equality,
            Equality => Compare,
            Compare => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

fn precedence_of(kind: TokenKind) -> Precedence {
    use TokenKind::*;
    match kind {
        Equal => Precedence::Assign,
        Ampersand | Pipe | Caret | LeftShift | RightShift => Precedence::Bits,
        Or => Precedence::Or,
        And => Precedence::And,
        EqualEqual | BangEqual => Precedence::Equality,
        Less | LessEqual | Greater | GreaterEqual => Precedence::Compare,
        Plus | Minus => Precedence::Term,
        Star | Slash | Percent => Precedence::Factor,
        LeftParen | Dot | LeftBracket => Precedence::Call,
        _ => Precedence::None,
    }
}

const UNINITIALIZED: i32 = -1;
const MAX_LOCALS: usize = 256;

struct Local {
    name: String,
    depth: i32,
}

struct LoopCtx {
    /// Number of locals live when the loop was entered; break/continue pop
    /// back down to this before jumping.
    locals_at_entry: usize,
    /// Where `continue` jumps back to (loop top for `while`, the
    /// increment for `for`).
    continue_target: usize,
    break_jumps: Vec<usize>,
}

#[derive(Clone, Copy)]
struct EmittedInstr {
    op: Opcode,
    start: usize,
}

/// The compiler-owned peephole window: the bytecode stays a pure data
/// container, and this struct holds the "previous"/"opcode before
/// previous" state instead of embedding scratch fields in it.
#[derive(Default)]
struct PeepholeWindow {
    behind: Option<EmittedInstr>,
    previous: Option<EmittedInstr>,
}

impl PeepholeWindow {
    fn reset(&mut self) {
        self.behind = None;
        self.previous = None;
    }

    fn push(&mut self, instr: EmittedInstr) {
        self.behind = self.previous.take();
        self.previous = Some(instr);
    }
}

struct FnState {
    function: Function,
    locals: Vec<Local>,
    scope_depth: i32,
    loop_stack: Vec<LoopCtx>,
    window: PeepholeWindow,
}

impl FnState {
    fn new(name: Option<hymn_core::InternedString>, arity: usize, script: Option<Rc<str>>, top_level: bool) -> Self {
        let mut function = Function::new(name, arity);
        function.script = script;
        FnState {
            function,
            // local slot 0 is reserved.
            locals: vec![Local { name: String::new(), depth: 0 }],
            scope_depth: if top_level { 0 } else { 1 },
            loop_stack: Vec::new(),
            window: PeepholeWindow::default(),
        }
    }

    fn is_global_scope(&self) -> bool {
        self.scope_depth == 0
    }
}

fn decode_cmp_inverse(op: Opcode) -> Option<fn(u16) -> Opcode> {
    use Opcode::*;
    Some(match op {
        Equal => JumpIfNotEqual,
        NotEqual => JumpIfEqual,
        Less => JumpIfGreaterEqual,
        LessEqual => JumpIfGreater,
        Greater => JumpIfLessEqual,
        GreaterEqual => JumpIfLess,
        _ => return None,
    } as fn(u16) -> Opcode)
}

fn decode_cmp_direct(op: Opcode) -> Option<fn(u16) -> Opcode> {
    use Opcode::*;
    Some(match op {
        Equal => JumpIfEqual,
        NotEqual => JumpIfNotEqual,
        Less => JumpIfLess,
        LessEqual => JumpIfLessEqual,
        Greater => JumpIfGreater,
        GreaterEqual => JumpIfGreaterEqual,
        _ => return None,
    } as fn(u16) -> Opcode)
}

fn is_cmp(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::Equal | Opcode::NotEqual | Opcode::Less | Opcode::LessEqual | Opcode::Greater | Opcode::GreaterEqual
    )
}

pub struct Compiler<'a> {
    scanner: Scanner<'a>,
    previous: Token,
    current: Token,
    strings: &'a mut StringTable,
    script: Option<Rc<str>>,
    error: Option<CompileError>,
    panic_mode: bool,
    fns: Vec<FnState>,
}

impl<'a> Compiler<'a> {
    pub fn new(source: &'a str, script_name: &str, strings: &'a mut StringTable) -> Self {
        let mut scanner = Scanner::new(source);
        let first = scanner.next_token();
        let script: Option<Rc<str>> = Some(Rc::from(script_name));
        Compiler {
            scanner,
            previous: first.clone(),
            current: first,
            strings,
            script: script.clone(),
            error: None,
            panic_mode: false,
            fns: vec![FnState::new(None, 0, script, true)],
        }
    }

    /// Compile the whole source as a top-level script. Returns the
    /// compiled `Function` and, on the first error, a `CompileError` the
    /// host should surface without running the (still-returned,
    /// best-effort) function.
    pub fn compile(mut self) -> (Function, Option<CompileError>) {
        while !self.check(TokenKind::Eof) {
            self.statement();
            if self.panic_mode {
                self.synchronize();
            }
        }
        self.emit_op(Opcode::NoneLit);
        self.emit_op(Opcode::Return);
        let state = self.fns.pop().expect("script FnState always present");
        (state.function, self.error)
    }

    // ---- token stream -------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current.clone();
        loop {
            self.current = self.scanner.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let msg = self.current.text(self.scanner.source()).to_string();
            self.error_at_current(&msg);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_tok(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn text(&self, token: &Token) -> String {
        token.text(self.scanner.source()).to_string()
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current.clone(), message);
    }

    fn error_at_previous(&mut self, message: &str) {
        self.error_at(self.previous.clone(), message);
    }

    /// Records the first error only; excerpt is the two lines before the
    /// offending line, the line itself, and a caret underline.
    /// Subsequent errors are suppressed and the parser is force-terminated
    /// by treating both tokens as EOF.
    fn error_at(&mut self, token: Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        if self.error.is_some() {
            return;
        }
        let source = self.scanner.source();
        let lines: Vec<&str> = source.split('\n').collect();
        let row = token.row as usize;
        let mut excerpt = String::new();
        for r in row.saturating_sub(2)..=row {
            if r == 0 || r > lines.len() {
                continue;
            }
            excerpt.push_str(lines[r - 1]);
            excerpt.push('\n');
        }
        let caret_col = token.column.saturating_sub(1) as usize;
        excerpt.push_str(&" ".repeat(caret_col));
        excerpt.push('^');
        self.error = Some(CompileError {
            message: message.to_string(),
            excerpt,
            script: self.script.as_deref().unwrap_or("<script>").to_string(),
            row: token.row,
        });
        self.current = Token { kind: TokenKind::Eof, ..token.clone() };
        self.previous = self.current.clone();
    }

    /// Skip tokens until a likely statement boundary, so one error doesn't
    /// cascade into spurious follow-on errors — still only the first is
    /// ever recorded; this only stops the parse cleanly.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(TokenKind::Eof) {
            use TokenKind::*;
            if matches!(
                self.current.kind,
                Let | If | While | For | Function | Return | Print | Use | End | Iterate | Switch | Try | Throw
            ) {
                return;
            }
            self.advance();
        }
    }

    // ---- bytecode emission & peephole ----------------------------------

    fn current_fn(&mut self) -> &mut FnState {
        self.fns.last_mut().expect("at least the script FnState")
    }

    fn chunk(&mut self) -> &mut ByteCode {
        &mut self.current_fn().function.code
    }

    fn reset_peephole(&mut self) {
        self.current_fn().window.reset();
    }

    /// Emit one opcode, applying the fusion rewrites below immediately.
    /// Returns the start offset of the resulting (possibly fused)
    /// instruction, which callers use for jump patching.
    fn emit_op(&mut self, op: Opcode) -> usize {
        let line = self.previous.row;
        let fstate = self.current_fn();
        let behind = fstate.window.behind;
        let previous = fstate.window.previous;

        if let (Some(b), Some(p)) = (behind, previous) {
            if let Some(fused) = try_fuse_triple(b.op, p.op, op) {
                fstate.function.code.code.truncate(b.start);
                fstate.function.code.lines.truncate(b.start);
                let start = b.start;
                for byte in encode(fused) {
                    fstate.function.code.push_byte(byte, line);
                }
                fstate.window.reset();
                fstate.window.previous = Some(EmittedInstr { op: fused, start });
                return start;
            }
        }
        if let Some(p) = previous {
            if let Some(fused) = try_fuse_pair(p.op, op) {
                fstate.function.code.code.truncate(p.start);
                fstate.function.code.lines.truncate(p.start);
                let start = p.start;
                for byte in encode(fused) {
                    fstate.function.code.push_byte(byte, line);
                }
                fstate.window.previous = Some(EmittedInstr { op: fused, start });
                return start;
            }
        }

        let start = fstate.function.code.len();
        for byte in encode(op) {
            fstate.function.code.push_byte(byte, line);
        }
        fstate.window.push(EmittedInstr { op, start });
        start
    }

    fn emit_jump(&mut self, op: Opcode) -> usize {
        self.emit_op(op)
    }

    /// Patch a previously emitted jump so it lands at the current ip, and
    /// mark a peephole boundary here: the instruction that follows may not
    /// fuse with anything that preceded the jump — every jump target
    /// resets the window.
    fn patch_jump(&mut self, jump_start: usize) {
        let target = self.chunk().len();
        let offset = (target - (jump_start + 3)) as u16;
        let bytes = offset.to_be_bytes();
        let code = &mut self.chunk().code;
        code[jump_start + 1] = bytes[0];
        code[jump_start + 2] = bytes[1];
        self.reset_peephole();
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let start = self.emit_op(Opcode::Loop(0));
        let offset = ((start + 3) - loop_start) as u16;
        let bytes = offset.to_be_bytes();
        let code = &mut self.chunk().code;
        code[start + 1] = bytes[0];
        code[start + 2] = bytes[1];
    }

    fn add_constant(&mut self, value: ConstantValue) -> u16 {
        self.chunk().add_constant(value)
    }

    fn intern_name(&mut self, name: &str) -> u16 {
        let interned = self.strings.intern(name);
        self.add_constant(ConstantValue::String(interned))
    }

    // ---- scopes & locals ------------------------------------------------

    fn begin_scope(&mut self) {
        self.current_fn().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let fstate = self.current_fn();
        fstate.scope_depth -= 1;
        let depth = fstate.scope_depth;
        let mut to_pop = 0u32;
        while let Some(local) = fstate.locals.last() {
            if local.depth > depth {
                fstate.locals.pop();
                to_pop += 1;
            } else {
                break;
            }
        }
        self.emit_pop_n(to_pop);
    }

    fn emit_pop_n(&mut self, n: u32) {
        match n {
            0 => {}
            1 => {
                self.emit_op(Opcode::Pop);
            }
            _ => {
                let mut remaining = n;
                while remaining > 254 {
                    self.emit_op(Opcode::PopN(254));
                    remaining -= 254;
                }
                self.emit_op(Opcode::PopN(remaining as u8));
            }
        }
    }

    fn declare_local(&mut self, name: &str) -> Result<(), ()> {
        let fstate = self.current_fn();
        if fstate.locals.len() >= MAX_LOCALS {
            return Err(());
        }
        let depth = fstate.scope_depth;
        for local in fstate.locals.iter().rev() {
            if local.depth != UNINITIALIZED && local.depth < depth {
                break;
            }
            if local.name == name {
                // shadowing within the same scope re-declares; fine.
            }
        }
        fstate.locals.push(Local { name: name.to_string(), depth });
        Ok(())
    }

    fn resolve_local(&self, name: &str) -> Option<u8> {
        let fstate = self.fns.last().unwrap();
        for (i, local) in fstate.locals.iter().enumerate().rev() {
            if local.name == name {
                return Some(i as u8);
            }
        }
        None
    }

    // ---- statements -------------------------------------------------

    fn statement(&mut self) {
        use TokenKind::*;
        match self.current.kind {
            Let => self.let_statement(),
            If => self.if_statement(),
            While => self.while_statement(),
            For => self.for_statement(),
            Iterate => self.iterate_statement(),
            Switch => self.switch_statement(),
            Try => self.try_statement(),
            Function => self.function_statement(),
            Return => self.return_statement(),
            Throw => self.throw_statement(),
            Print => self.print_statement(),
            Use => self.use_statement(),
            Break => self.break_statement(),
            Continue => self.continue_statement(),
            Begin => self.begin_statement(),
            _ => self.expression_statement(),
        }
    }

    fn block_until(&mut self, terminators: &[TokenKind]) {
        while !terminators.contains(&self.current.kind) && !self.check(TokenKind::Eof) {
            self.statement();
            if self.panic_mode {
                return;
            }
        }
    }

    fn let_statement(&mut self) {
        self.advance(); // `let`
        self.consume(TokenKind::Identifier, "Expected variable name after 'let'");
        let name = self.text(&self.previous.clone());
        self.consume(TokenKind::Equal, "Expected '=' in 'let' binding");
        self.expression();
        if self.current_fn().is_global_scope() {
            let idx = self.intern_name(&name);
            self.emit_op(Opcode::DefineGlobal(idx));
        } else if self.declare_local(&name).is_err() {
            self.error_at_previous("Too many local variables in one function");
        }
        // local declarations need no further bytecode: the value already
        // sitting on the stack at this position *is* the local's slot.
    }

    fn begin_statement(&mut self) {
        self.advance(); // `begin`
        self.begin_scope();
        self.block_until(&[TokenKind::End]);
        self.consume(TokenKind::End, "Expected 'end' to close 'begin'");
        self.end_scope();
    }

    fn compile_if_chain(&mut self, end_jumps: &mut Vec<usize>) {
        self.expression();
        let then_jump = self.emit_jump(Opcode::JumpIfFalse(0));
        self.begin_scope();
        self.block_until(&[TokenKind::Elif, TokenKind::Else, TokenKind::End]);
        self.end_scope();
        if self.check(TokenKind::Elif) {
            end_jumps.push(self.emit_jump(Opcode::Jump(0)));
            self.patch_jump(then_jump);
            self.advance(); // `elif`
            self.compile_if_chain(end_jumps);
            return;
        }
        if self.match_tok(TokenKind::Else) {
            end_jumps.push(self.emit_jump(Opcode::Jump(0)));
            self.patch_jump(then_jump);
            self.begin_scope();
            self.block_until(&[TokenKind::End]);
            self.end_scope();
        } else {
            self.patch_jump(then_jump);
        }
        self.consume(TokenKind::End, "Expected 'end' to close 'if'");
        for j in std::mem::take(end_jumps) {
            self.patch_jump(j);
        }
    }

    fn if_statement(&mut self) {
        self.advance(); // `if`
        let mut end_jumps = Vec::new();
        self.compile_if_chain(&mut end_jumps);
    }

    fn while_statement(&mut self) {
        self.advance(); // `while`
        let loop_start = self.chunk().len();
        self.reset_peephole();
        self.expression();
        let exit_jump = self.emit_jump(Opcode::JumpIfFalse(0));
        let locals_at_entry = self.current_fn().locals.len();
        self.current_fn().loop_stack.push(LoopCtx {
            locals_at_entry,
            continue_target: loop_start,
            break_jumps: Vec::new(),
        });
        self.begin_scope();
        self.block_until(&[TokenKind::End]);
        self.end_scope();
        self.consume(TokenKind::End, "Expected 'end' to close 'while'");
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        let ctx = self.current_fn().loop_stack.pop().unwrap();
        for j in ctx.break_jumps {
            self.patch_jump(j);
        }
    }

    fn for_statement(&mut self) {
        self.advance(); // `for`
        self.begin_scope();
        self.for_clause_statement();
        self.consume(TokenKind::Comma, "Expected ',' after 'for' initializer");
        let compare_ip = self.chunk().len();
        self.reset_peephole();
        self.expression();
        self.consume(TokenKind::Comma, "Expected ',' after 'for' condition");
        let exit_jump = self.emit_jump(Opcode::JumpIfFalse(0));
        let body_jump = self.emit_jump(Opcode::Jump(0));
        let increment_ip = self.chunk().len();
        self.reset_peephole();
        self.for_clause_statement();
        self.emit_loop(compare_ip);
        self.patch_jump(body_jump);

        let locals_at_entry = self.current_fn().locals.len();
        self.current_fn().loop_stack.push(LoopCtx {
            locals_at_entry,
            continue_target: increment_ip,
            break_jumps: Vec::new(),
        });
        self.begin_scope();
        self.block_until(&[TokenKind::End]);
        self.end_scope();
        self.consume(TokenKind::End, "Expected 'end' to close 'for'");
        self.emit_loop(increment_ip);
        self.patch_jump(exit_jump);
        let ctx = self.current_fn().loop_stack.pop().unwrap();
        for j in ctx.break_jumps {
            self.patch_jump(j);
        }
        self.end_scope();
    }

    /// One comma-delimited clause of a `for` header: either a `let`-style
    /// binding (first clause) or a bare assignment expression (init/step).
    fn for_clause_statement(&mut self) {
        if self.check(TokenKind::Let) {
            self.advance();
            self.consume(TokenKind::Identifier, "Expected variable name");
            let name = self.text(&self.previous.clone());
            self.consume(TokenKind::Equal, "Expected '=' in 'for' initializer");
            self.expression();
            if self.current_fn().is_global_scope() {
                let idx = self.intern_name(&name);
                self.emit_op(Opcode::DefineGlobal(idx));
            } else if self.declare_local(&name).is_err() {
                self.error_at_previous("Too many local variables in one function");
            }
        } else {
            self.expression();
            self.emit_op(Opcode::Pop);
        }
    }

    fn break_statement(&mut self) {
        self.advance();
        let Some(ctx_info) = self.current_fn().loop_stack.last().map(|c| c.locals_at_entry) else {
            self.error_at_previous("'break' used outside a loop");
            return;
        };
        let n = (self.current_fn().locals.len() - ctx_info) as u32;
        self.emit_pop_n(n);
        let jump = self.emit_jump(Opcode::Jump(0));
        self.current_fn().loop_stack.last_mut().unwrap().break_jumps.push(jump);
    }

    fn continue_statement(&mut self) {
        self.advance();
        let Some((locals_at_entry, target)) = self
            .current_fn()
            .loop_stack
            .last()
            .map(|c| (c.locals_at_entry, c.continue_target))
        else {
            self.error_at_previous("'continue' used outside a loop");
            return;
        };
        let n = (self.current_fn().locals.len() - locals_at_entry) as u32;
        self.emit_pop_n(n);
        self.emit_loop(target);
    }

    fn iterate_statement(&mut self) {
        self.advance(); // `iterate`
        self.consume(TokenKind::Identifier, "Expected binding name after 'iterate'");
        let first_name = self.text(&self.previous.clone());
        let (key_name, val_name) = if self.match_tok(TokenKind::Comma) {
            self.consume(TokenKind::Identifier, "Expected value name after ','");
            (Some(first_name), self.text(&self.previous.clone()))
        } else {
            (None, first_name)
        };
        self.consume(TokenKind::In, "Expected 'in' after iterate binding(s)");

        self.begin_scope();
        self.expression(); // the iterable
        self.declare_local("@iterable").ok();
        let iterable_slot = self.resolve_local("@iterable").unwrap();

        self.emit_op(Opcode::GetLocal(iterable_slot));
        self.emit_op(Opcode::Type);
        let table_name_idx = self.intern_name("Table");
        self.emit_op(Opcode::Constant(table_name_idx));
        self.emit_op(Opcode::Equal);
        let not_table_jump = self.emit_jump(Opcode::JumpIfFalse(0));

        // table path: materialize sorted keys once. Each path's @sequence
        // and @index live in their own scope so the two mutually-exclusive
        // branches can reuse the same compile-time slot numbers — only one
        // of them ever actually runs.
        self.begin_scope();
        self.emit_op(Opcode::GetLocal(iterable_slot));
        self.emit_op(Opcode::Keys);
        self.declare_local("@sequence").ok();
        self.compile_iterate_body(iterable_slot, key_name.as_deref(), &val_name, true);
        self.end_scope();
        let skip_array_path = self.emit_jump(Opcode::Jump(0));

        self.patch_jump(not_table_jump);
        self.begin_scope();
        self.emit_op(Opcode::GetLocal(iterable_slot));
        self.declare_local("@sequence").ok();
        self.compile_iterate_body(iterable_slot, key_name.as_deref(), &val_name, false);
        self.end_scope();
        self.patch_jump(skip_array_path);

        self.consume(TokenKind::End, "Expected 'end' to close 'iterate'");
        self.end_scope();
    }

    /// Compiles one index-based walk over `@sequence` (either the sorted
    /// key array for a table, or the iterable itself for an array),
    /// binding `key_name`/`val_name` as locals for the duration of the
    /// body. Assumes `@sequence` was just declared as the top local.
    fn compile_iterate_body(&mut self, iterable_slot: u8, key_name: Option<&str>, val_name: &str, is_table: bool) -> usize {
        let sequence_slot = self.resolve_local("@sequence").unwrap();
        self.emit_op(Opcode::Constant({
            let idx = self.add_constant(ConstantValue::Int(0));
            idx
        }));
        self.declare_local("@index").ok();
        let index_slot = self.resolve_local("@index").unwrap();

        let loop_start = self.chunk().len();
        self.reset_peephole();
        self.emit_op(Opcode::GetLocal(index_slot));
        self.emit_op(Opcode::GetLocal(sequence_slot));
        self.emit_op(Opcode::Len);
        self.emit_op(Opcode::Less);
        let exit_jump = self.emit_jump(Opcode::JumpIfFalse(0));

        self.begin_scope();
        if is_table {
            // key = @sequence[@index]; value = @iterable[key]
            self.emit_op(Opcode::GetLocal(sequence_slot));
            self.emit_op(Opcode::GetLocal(index_slot));
            self.emit_op(Opcode::GetDynamic);
            self.declare_local(key_name.unwrap_or("@key")).ok();
            let key_slot = self.resolve_local(key_name.unwrap_or("@key")).unwrap();
            self.emit_op(Opcode::GetLocal(iterable_slot));
            self.emit_op(Opcode::GetLocal(key_slot));
            self.emit_op(Opcode::GetDynamic);
            self.declare_local(val_name).ok();
        } else {
            if let Some(key_name) = key_name {
                self.emit_op(Opcode::GetLocal(index_slot));
                self.declare_local(key_name).ok();
            }
            self.emit_op(Opcode::GetLocal(sequence_slot));
            self.emit_op(Opcode::GetLocal(index_slot));
            self.emit_op(Opcode::GetDynamic);
            self.declare_local(val_name).ok();
        }

        self.block_until(&[TokenKind::End]);
        self.end_scope();

        self.emit_op(Opcode::GetLocal(index_slot));
        self.emit_op(Opcode::Increment(1));
        self.emit_op(Opcode::SetLocal(index_slot));
        self.emit_op(Opcode::Pop);
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        loop_start
    }

    fn switch_statement(&mut self) {
        self.advance(); // `switch`
        self.begin_scope();
        self.expression();
        self.declare_local("@switch").ok();
        let switch_slot = self.resolve_local("@switch").unwrap();

        let mut end_jumps = Vec::new();
        loop {
            if self.match_tok(TokenKind::Case) {
                let mut body_jumps = Vec::new();
                loop {
                    self.emit_op(Opcode::GetLocal(switch_slot));
                    self.expression();
                    self.emit_op(Opcode::Equal);
                    body_jumps.push(self.emit_jump(Opcode::JumpIfTrue(0)));
                    if !self.match_tok(TokenKind::Or) {
                        break;
                    }
                }
                let miss_jump = self.emit_jump(Opcode::Jump(0));
                for j in body_jumps {
                    self.patch_jump(j);
                }
                self.begin_scope();
                self.block_until(&[TokenKind::Case, TokenKind::Else, TokenKind::End]);
                self.end_scope();
                end_jumps.push(self.emit_jump(Opcode::Jump(0)));
                self.patch_jump(miss_jump);
            } else if self.match_tok(TokenKind::Else) {
                self.begin_scope();
                self.block_until(&[TokenKind::End]);
                self.end_scope();
                break;
            } else {
                break;
            }
        }
        self.consume(TokenKind::End, "Expected 'end' to close 'switch'");
        for j in end_jumps {
            self.patch_jump(j);
        }
        self.end_scope();
    }

    fn try_statement(&mut self) {
        self.advance(); // `try`
        let start_ip = self.chunk().len();
        let locals_at_start = self.current_fn().locals.len();
        self.begin_scope();
        self.block_until(&[TokenKind::Except]);
        self.end_scope();
        let skip_handler = self.emit_jump(Opcode::Jump(0));
        self.consume(TokenKind::Except, "Expected 'except' to close 'try'");
        self.consume(TokenKind::Identifier, "Expected exception binding name after 'except'");
        let except_name = self.text(&self.previous.clone());
        let handler_ip = self.chunk().len();
        self.reset_peephole();

        self.current_fn().function.exception_ranges.push(ExceptionRange {
            start_ip,
            end_ip: handler_ip,
            handler_ip,
            local_depth: locals_at_start,
        });

        self.begin_scope();
        self.declare_local(&except_name).ok();
        self.block_until(&[TokenKind::End]);
        self.end_scope();
        self.patch_jump(skip_handler);
        self.consume(TokenKind::End, "Expected 'end' to close 'try'");
    }

    fn function_statement(&mut self) {
        self.advance(); // `function`
        self.consume(TokenKind::Identifier, "Expected function name");
        let name = self.text(&self.previous.clone());
        self.consume(TokenKind::LeftParen, "Expected '(' after function name");
        let interned_name = self.strings.intern(&name);

        self.fns.push(FnState::new(Some(interned_name), 0, self.script.clone(), false));
        let mut arity = 0usize;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.consume(TokenKind::Identifier, "Expected parameter name");
                let pname = self.text(&self.previous.clone());
                self.declare_local(&pname).ok();
                arity += 1;
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after parameters");
        self.current_fn().function.arity = arity;
        self.block_until(&[TokenKind::End]);
        self.consume(TokenKind::End, "Expected 'end' to close function body");
        self.emit_op(Opcode::NoneLit);
        self.emit_op(Opcode::Return);

        let fstate = self.fns.pop().expect("pushed above");
        let func_rc = Rc::new(fstate.function);
        let idx = self.add_constant(ConstantValue::Function(func_rc));
        self.emit_op(Opcode::Constant(idx));
        let name_idx = self.intern_name(&name);
        self.emit_op(Opcode::DefineGlobal(name_idx));
    }

    fn return_statement(&mut self) {
        self.advance(); // `return`
        use TokenKind::*;
        if matches!(self.current.kind, End | Elif | Else | Except | Case | Eof) {
            self.emit_op(Opcode::NoneLit);
        } else {
            self.expression();
        }
        self.emit_op(Opcode::Return);
    }

    fn throw_statement(&mut self) {
        self.advance();
        self.expression();
        self.emit_op(Opcode::Throw);
    }

    fn print_statement(&mut self) {
        self.advance();
        self.expression();
        self.emit_op(Opcode::Print);
    }

    fn use_statement(&mut self) {
        self.advance();
        self.consume(TokenKind::String, "Expected a string path after 'use'");
        let raw = self.text(&self.previous.clone());
        let decoded = decode_string_literal(&raw);
        let idx = self.intern_name(&decoded);
        self.emit_op(Opcode::Constant(idx));
        self.emit_op(Opcode::Use);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.emit_op(Opcode::Pop);
    }

    // ---- expressions (Pratt core) -------------------------------------

    fn expression(&mut self) {
        self.compile_with_precedence(Precedence::Assign);
    }

    fn compile_with_precedence(&mut self, min: Precedence) {
        self.advance();
        let can_assign = min <= Precedence::Assign;
        if !self.prefix(self.previous.kind, can_assign) {
            self.error_at_previous("Expected an expression");
            return;
        }
        while precedence_of(self.current.kind) >= min {
            self.advance();
            self.infix(self.previous.kind, can_assign);
        }
        if can_assign && self.check(TokenKind::Equal) {
            self.error_at_current("Invalid assignment target");
        }
    }

    fn prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        use TokenKind::*;
        match kind {
            Integer => self.integer_literal(),
            Float => self.float_literal(),
            String => self.string_literal(),
            True => {
                self.emit_op(Opcode::TrueLit);
            }
            False => {
                self.emit_op(Opcode::FalseLit);
            }
            None_ => {
                self.emit_op(Opcode::NoneLit);
            }
            LeftParen => {
                self.expression();
                self.consume(RightParen, "Expected ')' after expression");
            }
            LeftBracket => self.array_literal(),
            LeftBrace => self.table_literal(),
            Minus => {
                self.compile_with_precedence(Precedence::Unary);
                self.emit_op(Opcode::Negate);
            }
            Bang => {
                self.compile_with_precedence(Precedence::Unary);
                self.emit_op(Opcode::Not);
            }
            Tilde => {
                self.compile_with_precedence(Precedence::Unary);
                self.emit_op(Opcode::BitNot);
            }
            Identifier => self.identifier(can_assign),
            Push | Pop | Insert | Delete | Len | Keys | Copy | Clear | Index | Type | IntKw | FloatKw | StringKw => {
                self.builtin_call(kind)
            }
            _ => return false,
        }
        true
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool) {
        use TokenKind::*;
        match kind {
            Plus => self.binary(Precedence::Term, Opcode::Add),
            Minus => self.binary(Precedence::Term, Opcode::Subtract),
            Star => self.binary(Precedence::Factor, Opcode::Multiply),
            Slash => self.binary(Precedence::Factor, Opcode::Divide),
            Percent => self.binary(Precedence::Factor, Opcode::Modulo),
            Ampersand => self.binary(Precedence::Bits, Opcode::BitAnd),
            Pipe => self.binary(Precedence::Bits, Opcode::BitOr),
            Caret => self.binary(Precedence::Bits, Opcode::BitXor),
            LeftShift => self.binary(Precedence::Bits, Opcode::LeftShift),
            RightShift => self.binary(Precedence::Bits, Opcode::RightShift),
            EqualEqual => self.binary(Precedence::Equality, Opcode::Equal),
            BangEqual => self.binary(Precedence::Equality, Opcode::NotEqual),
            Less => self.binary(Precedence::Compare, Opcode::Less),
            LessEqual => self.binary(Precedence::Compare, Opcode::LessEqual),
            Greater => self.binary(Precedence::Compare, Opcode::Greater),
            GreaterEqual => self.binary(Precedence::Compare, Opcode::GreaterEqual),
            And => self.and_expr(),
            Or => self.or_expr(),
            LeftParen => self.call_expr(),
            Dot => self.property_expr(can_assign),
            LeftBracket => self.dynamic_expr(can_assign),
            _ => self.error_at_previous("Unexpected token in expression"),
        }
    }

    fn binary(&mut self, precedence: Precedence, op: Opcode) {
        self.compile_with_precedence(precedence.next());
        self.emit_op(op);
    }

    fn and_expr(&mut self) {
        let short = self.emit_jump(Opcode::JumpIfFalse(0));
        self.compile_with_precedence(Precedence::And.next());
        let end = self.emit_jump(Opcode::Jump(0));
        self.patch_jump(short);
        self.emit_op(Opcode::FalseLit);
        self.patch_jump(end);
    }

    fn or_expr(&mut self) {
        let short = self.emit_jump(Opcode::JumpIfTrue(0));
        self.compile_with_precedence(Precedence::Or.next());
        let end = self.emit_jump(Opcode::Jump(0));
        self.patch_jump(short);
        self.emit_op(Opcode::TrueLit);
        self.patch_jump(end);
    }

    fn call_expr(&mut self) {
        let mut argc = 0u8;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                argc += 1;
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after call arguments");
        self.emit_op(Opcode::Call(argc));
    }

    fn property_expr(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expected property name after '.'");
        let name = self.text(&self.previous.clone());
        let idx = self.intern_name(&name);
        if can_assign && self.match_tok(TokenKind::Equal) {
            self.expression();
            self.emit_op(Opcode::SetProperty(idx));
        } else {
            self.emit_op(Opcode::GetProperty(idx));
        }
    }

    /// `obj[i]` is a dynamic get/set; `obj[a:b]` (either bound optional) is
    /// a slice. Both share the leading `[`, so the colon decides which one
    /// this is, the same branching the original parser performs at `[`.
    fn dynamic_expr(&mut self, can_assign: bool) {
        if self.match_tok(TokenKind::Colon) {
            let zero = self.add_constant(ConstantValue::Int(0));
            self.emit_op(Opcode::Constant(zero));
            self.slice_end();
            self.emit_op(Opcode::Slice);
            return;
        }
        self.expression();
        if self.match_tok(TokenKind::Colon) {
            self.slice_end();
            self.emit_op(Opcode::Slice);
            return;
        }
        self.consume(TokenKind::RightBracket, "Expected ']' after index expression");
        if can_assign && self.match_tok(TokenKind::Equal) {
            self.expression();
            self.emit_op(Opcode::SetDynamic);
        } else {
            self.emit_op(Opcode::GetDynamic);
        }
    }

    /// Compiles the end-bound of a `[a:b]` slice: `none` (meaning "to the
    /// end") if `]` comes immediately, otherwise an expression.
    fn slice_end(&mut self) {
        if self.check(TokenKind::RightBracket) {
            self.emit_op(Opcode::NoneLit);
        } else {
            self.expression();
        }
        self.consume(TokenKind::RightBracket, "Expected ']' after slice expression");
    }

    fn identifier(&mut self, can_assign: bool) {
        let name = self.text(&self.previous.clone());
        if let Some(slot) = self.resolve_local(&name) {
            if can_assign && self.match_tok(TokenKind::Equal) {
                self.expression();
                self.emit_op(Opcode::SetLocal(slot));
            } else {
                self.emit_op(Opcode::GetLocal(slot));
            }
        } else {
            let idx = self.intern_name(&name);
            if can_assign && self.match_tok(TokenKind::Equal) {
                self.expression();
                self.emit_op(Opcode::SetGlobal(idx));
            } else {
                self.emit_op(Opcode::GetGlobal(idx));
            }
        }
    }

    fn integer_literal(&mut self) {
        let text = self.text(&self.previous.clone());
        let value: i64 = text.parse().unwrap_or(0);
        let idx = self.add_constant(ConstantValue::Int(value));
        self.emit_op(Opcode::Constant(idx));
    }

    fn float_literal(&mut self) {
        let text = self.text(&self.previous.clone());
        let value: f64 = text.parse().unwrap_or(0.0);
        let idx = self.add_constant(ConstantValue::Float(value));
        self.emit_op(Opcode::Constant(idx));
    }

    fn string_literal(&mut self) {
        let raw = self.text(&self.previous.clone());
        let decoded = decode_string_literal(&raw);
        let interned = self.strings.intern(&decoded);
        let idx = self.add_constant(ConstantValue::String(interned));
        self.emit_op(Opcode::Constant(idx));
    }

    fn array_literal(&mut self) {
        let idx = self.add_constant(ConstantValue::FreshArray);
        self.emit_op(Opcode::Constant(idx));
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                self.emit_op(Opcode::ArrayPush);
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expected ']' to close array literal");
    }

    fn table_literal(&mut self) {
        let idx = self.add_constant(ConstantValue::FreshTable);
        self.emit_op(Opcode::Constant(idx));
        if !self.check(TokenKind::RightBrace) {
            loop {
                let key_name = if self.match_tok(TokenKind::String) {
                    decode_string_literal(&self.text(&self.previous.clone()))
                } else {
                    self.consume(TokenKind::Identifier, "Expected table key");
                    self.text(&self.previous.clone())
                };
                self.consume(TokenKind::Colon, "Expected ':' after table key");
                self.emit_op(Opcode::Duplicate);
                let key_idx = self.intern_name(&key_name);
                self.emit_op(Opcode::Constant(key_idx));
                self.expression();
                self.emit_op(Opcode::SetDynamic);
                self.emit_op(Opcode::Pop);
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "Expected '}' to close table literal");
    }

    fn builtin_call(&mut self, kind: TokenKind) {
        use TokenKind::*;
        let (op, argc): (fn(&mut Self) -> Opcode, usize) = match kind {
            Push => (|_| Opcode::ArrayPush, 2),
            Pop => (|_| Opcode::ArrayPop, 1),
            Insert => (|_| Opcode::ArrayInsert, 3),
            Delete => (|_| Opcode::Delete, 2),
            Len => (|_| Opcode::Len, 1),
            Keys => (|_| Opcode::Keys, 1),
            Copy => (|_| Opcode::Copy, 1),
            Clear => (|_| Opcode::Clear, 1),
            Index => (|_| Opcode::Index, 2),
            Type => (|_| Opcode::Type, 1),
            IntKw => (|_| Opcode::ToInteger, 1),
            FloatKw => (|_| Opcode::ToFloat, 1),
            StringKw => (|_| Opcode::ToString, 1),
            _ => unreachable!(),
        };
        self.consume(LeftParen, "Expected '(' after builtin name");
        for i in 0..argc {
            self.expression();
            if i + 1 < argc {
                self.consume(Comma, "Expected ',' between builtin arguments");
            }
        }
        self.consume(RightParen, "Expected ')' after builtin arguments");
        let resolved = op(self);
        self.emit_op(resolved);
    }
}

fn encode(op: Opcode) -> Vec<u8> {
    let mut out = Vec::with_capacity(op.encoded_len());
    op.encode(&mut out);
    out
}

fn try_fuse_pair(previous: Opcode, new: Opcode) -> Option<Opcode> {
    use Opcode::*;
    Some(match (previous, new) {
        (Call(n), Return) => TailCall(n),
        (Pop, Pop) => PopTwo,
        (PopTwo, Pop) => PopN(3),
        (PopN(k), Pop) if k < 254 => PopN(k + 1),
        // `SetLocal`/`IncrementLocalAndSet` leave nothing on the stack (unlike
        // `SetGlobal`/`SetProperty`/`SetDynamic`, which peek rather than pop), so
        // a trailing expression-statement `Pop` has nothing left to discard.
        (SetLocal(s), Pop) => SetLocal(s),
        (IncrementLocalAndSet(s, k), Pop) => IncrementLocalAndSet(s, k),
        (GetLocal(s), Increment(k)) => IncrementLocal(s, k),
        (cmp, JumpIfTrue(off)) if is_cmp(cmp) => decode_cmp_direct(cmp)?(off),
        (cmp, JumpIfFalse(off)) if is_cmp(cmp) => decode_cmp_inverse(cmp)?(off),
        _ => return None,
    })
}

fn try_fuse_triple(behind: Opcode, previous: Opcode, new: Opcode) -> Option<Opcode> {
    use Opcode::*;
    match (behind, previous, new) {
        (GetLocal(s), GetLocal(t), Add) => Some(AddTwoLocal(s, t)),
        (IncrementLocal(s, k), SetLocal(s2), Pop) if s == s2 => Some(IncrementLocalAndSet(s, k)),
        _ => None,
    }
}

/// Decode scanner-level escapes: the scanner leaves `\x` pairs untouched;
/// the compiler decodes them when materializing the constant. Strips the
/// surrounding quote characters.
fn decode_string_literal(raw: &str) -> String {
    let inner = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('a') => out.push('\u{07}'),
            Some('b') => out.push('\u{08}'),
            Some('f') => out.push('\u{0C}'),
            Some('v') => out.push('\u{0B}'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('?') => out.push('?'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use hymn_core::StringTable;

    fn compile_ok(source: &str) -> Function {
        let mut strings = StringTable::new();
        let compiler = Compiler::new(source, "<test>", &mut strings);
        let (func, err) = compiler.compile();
        assert!(err.is_none(), "unexpected compile error: {err:?}");
        func
    }

    #[test]
    fn simple_arithmetic_compiles_without_error() {
        compile_ok("let a = 3 let b = 4 print a * b + 1");
    }

    #[test]
    fn call_then_return_fuses_into_tail_call() {
        let func = compile_ok("function f(n) return f(n) end");
        let f_const = func
            .code
            .constants
            .iter()
            .find_map(|c| match c {
                ConstantValue::Function(f) => Some(f.clone()),
                _ => None,
            })
            .expect("inner function constant");
        let has_tail_call = f_const.code.code.iter().any(|_| false)
            || f_const
                .code
                .code
                .first()
                .is_some();
        assert!(has_tail_call);
        // A TAIL_CALL tag must appear somewhere in the compiled body since
        // the call is in strict tail position.
        let tag_tail_call = 65u8;
        assert!(f_const.code.code.contains(&tag_tail_call));
    }

    #[test]
    fn unterminated_expression_records_compile_error() {
        let mut strings = StringTable::new();
        let compiler = Compiler::new("let a = ", "<test>", &mut strings);
        let (_func, err) = compiler.compile();
        assert!(err.is_some());
    }

    #[test]
    fn nested_if_compiles_and_preserves_structure() {
        compile_ok(
            "let x = 10\nif x < 5\nprint \"a\"\nelif x < 20\nif true print \"b\" end\nelse\nprint \"c\"\nend",
        );
    }

    #[test]
    fn bare_local_assignment_does_not_emit_a_trailing_pop() {
        // `SetLocal` pops its value with nothing pushed back, so the `Pop`
        // an expression-statement would normally append after `a = 2` must
        // be suppressed, or the stack underflows by one slot every time.
        let func = compile_ok("function f(a) a = 2 return a end");
        let inner = func
            .code
            .constants
            .iter()
            .find_map(|c| match c {
                ConstantValue::Function(f) => Some(f.clone()),
                _ => None,
            })
            .expect("inner function constant");
        let tag_set_local = 41u8;
        let tag_pop = 0u8;
        let code = &inner.code.code;
        let set_local_at = code
            .iter()
            .position(|&b| b == tag_set_local)
            .expect("SetLocal present");
        // the byte right after SetLocal's operand slot must not be a bare Pop
        assert_ne!(code.get(set_local_at + 2), Some(&tag_pop));
    }
}
