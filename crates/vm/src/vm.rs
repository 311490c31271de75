//! The dispatch loop: a stack machine over [`Value`] with a frame stack,
//! an exception unwinder integrated with the call stack's frame state
//! machine, and reference counting that falls entirely out of
//! `Rc`/`Drop` rather than hand-written reference/dereference
//! bookkeeping.
//!
//! Structured around "one match arm per instruction, one concern per
//! submodule" — the same shape a bytecode-generating codegen pass would
//! use, just executing bytecode per opcode instead of emitting it.

use crate::compiler::Compiler;
use crate::config::VmConfig;
use crate::frame::Frame;
use crate::opcode::Opcode;
use crate::value_ops;
use hymn_core::{Array, ConstantValue, Function, InternedString, StringTable, Table, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::warn;

/// A value in flight through the unwinder. Runtime errors and user
/// throws are both ordinary `Value` exceptions propagated through the
/// same unwinder; only the `Runtime` variant accumulates a stack trace
/// as it unwinds past frames with no matching `try`/`except` — a user
/// `throw expr` is delivered exactly as written.
enum Thrown {
    User(Value),
    Runtime(Value),
}

impl Thrown {
    fn value(&self) -> Value {
        match self {
            Thrown::User(v) | Thrown::Runtime(v) => v.clone(),
        }
    }

    /// Append one `"at <func> <script>:<row>"` line — only for
    /// VM-constructed errors; a no-op for user throws.
    fn add_trace_frame(&mut self, strings: &mut StringTable, name: &str, script: &str, row: u32) {
        if let Thrown::Runtime(Value::String(s)) = self {
            let mut msg = s.as_str().to_string();
            msg.push_str(&format!("\n  at {name} {script}:{row}"));
            *s = strings.intern(&msg);
        }
    }
}

/// What a single opcode does to control flow, decided by [`Vm::execute`]
/// and interpreted by the loop in [`Vm::run`].
enum Flow {
    /// Fall through to the already-advanced `ip`.
    Next,
    /// Jump to an absolute instruction offset within the current frame.
    Jump(usize),
    /// The outermost frame just returned; this is the program's result.
    Done(Value),
}

pub struct Vm {
    pub(crate) strings: StringTable,
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<Frame>,
    pub(crate) globals: HashMap<InternedString, Value>,
    pub(crate) config: VmConfig,
    pub(crate) paths_key: InternedString,
    pub(crate) imports_key: InternedString,
    print_hook: Box<dyn FnMut(&str)>,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        Self::with_print_hook(config, |s| println!("{s}"))
    }

    pub fn with_print_hook(config: VmConfig, print_hook: impl FnMut(&str) + 'static) -> Self {
        let mut strings = StringTable::new();
        let paths_key = strings.intern("__paths");
        let imports_key = strings.intern("__imports");

        let mut globals = HashMap::new();
        let path_values: Vec<Value> = config
            .default_paths
            .iter()
            .map(|p| Value::String(strings.intern(p)))
            .collect();
        globals.insert(
            paths_key.clone(),
            Value::Array(Rc::new(RefCell::new(Array::with_values(path_values)))),
        );
        globals.insert(
            imports_key.clone(),
            Value::Table(Rc::new(RefCell::new(Table::new()))),
        );

        Vm {
            strings,
            stack: Vec::new(),
            frames: Vec::new(),
            globals,
            config,
            paths_key,
            imports_key,
            print_hook: Box::new(print_hook),
        }
    }

    /// Compile and run `source` as a top-level script (frame zero).
    /// Returns the final value left on the stack before it goes empty —
    /// the result is popped off as that last value — or a formatted
    /// error string.
    pub fn interpret(&mut self, source: &str, script_name: &str) -> Result<Value, String> {
        let function = {
            let mut strings = std::mem::take(&mut self.strings);
            let compiler = Compiler::new(source, script_name, &mut strings);
            let (function, err) = compiler.compile();
            self.strings = strings;
            if let Some(err) = err {
                warn!(script = %script_name, "compile error: {err}");
                return Err(err.to_string());
            }
            function
        };
        self.run_function(Rc::new(function))
    }

    fn run_function(&mut self, function: Rc<Function>) -> Result<Value, String> {
        self.stack.push(Value::Function(function.clone()));
        self.frames.push(Frame::new(function, 0));
        match self.run() {
            Ok(v) => Ok(v),
            Err(thrown) => {
                let message = thrown.value().display_string();
                warn!("unhandled exception: {message}");
                Err(message)
            }
        }
    }

    fn run(&mut self) -> Result<Value, Thrown> {
        loop {
            let (ip, function) = {
                let frame = self.frames.last().expect("run: frame stack must not be empty");
                (frame.ip, frame.function.clone())
            };
            let op = Opcode::decode(&function.code.code, ip);
            let next_ip = ip + op.encoded_len();
            self.frames.last_mut().unwrap().ip = next_ip;

            match self.execute(op, &function, next_ip) {
                Ok(Flow::Next) => {}
                Ok(Flow::Jump(target)) => {
                    self.frames.last_mut().unwrap().ip = target;
                }
                Ok(Flow::Done(value)) => return Ok(value),
                Err(thrown) => self.unwind(thrown)?,
            }
        }
    }

    /// Search from the innermost active frame outward for an exception
    /// range covering its current `ip`, the THROWING state. Restores the
    /// stack, binds the thrown value, and resumes RUNNING by returning
    /// `Ok(())`. If no frame anywhere on the stack has a match, returns
    /// `Err` to terminate `run` and surface the error to the host.
    fn unwind(&mut self, mut thrown: Thrown) -> Result<(), Thrown> {
        loop {
            let Some(frame) = self.frames.last() else {
                return Err(thrown);
            };
            let ip = frame.ip;
            let found = frame.function.exception_range_at(ip).map(|r| (r.handler_ip, r.local_depth));
            let base = frame.stack_base;

            if let Some((handler_ip, local_depth)) = found {
                let target_len = base + local_depth;
                self.stack.truncate(target_len);
                self.stack.push(thrown.value());
                self.frames.last_mut().unwrap().ip = handler_ip;
                return Ok(());
            }

            let name = frame.name().unwrap_or("<script>").to_string();
            let script = frame.script().to_string();
            let row = frame.current_line();
            thrown.add_trace_frame(&mut self.strings, &name, &script, row);
            self.stack.truncate(base);
            self.frames.pop();
            if self.frames.is_empty() {
                return Err(thrown);
            }
        }
    }

    fn raise(&mut self, message: impl Into<String>) -> Thrown {
        let interned = self.strings.intern(&message.into());
        Thrown::Runtime(Value::String(interned))
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("vm: stack underflow is a compiler bug")
    }

    fn push_checked(&mut self, value: Value) -> Result<(), Thrown> {
        if self.stack.len() >= self.config.stack_capacity {
            return Err(self.raise("Stack overflow"));
        }
        self.stack.push(value);
        Ok(())
    }

    fn constant_string(&self, function: &Function, idx: u16) -> InternedString {
        match function.code.constant(idx) {
            ConstantValue::String(s) => s.clone(),
            other => unreachable!("vm: constant at {idx} is not a string name: {other:?}"),
        }
    }

    /// Invoke the callee sitting `argc` slots below the top of the stack —
    /// `CALL n` peeks n+1 positions for the callee. When `tail` is set,
    /// reuses the current frame instead of pushing a new one, giving
    /// tail-recursive Hymn functions constant frame depth.
    fn call_value(&mut self, argc: u8, tail: bool) -> Result<(), Thrown> {
        let n = argc as usize;
        let len = self.stack.len();
        let callee_idx = len - n - 1;
        let callee = self.stack[callee_idx].clone();

        match callee {
            Value::Function(f) => {
                if f.arity != n {
                    return Err(self.raise(format!(
                        "Expected {} argument{}, got {n}",
                        f.arity,
                        if f.arity == 1 { "" } else { "s" }
                    )));
                }
                if tail {
                    let base = self.frames.last().unwrap().stack_base;
                    let window = self.stack.split_off(callee_idx);
                    self.stack.truncate(base);
                    self.stack.extend(window);
                    let frame = self.frames.last_mut().unwrap();
                    frame.function = f;
                    frame.ip = 0;
                } else {
                    if self.frames.len() >= self.config.frame_capacity {
                        return Err(self.raise("Stack overflow"));
                    }
                    self.frames.push(Frame::new(f, callee_idx));
                }
                Ok(())
            }
            Value::NativeFunction(nf) => {
                if let Some(a) = nf.arity {
                    if a != n {
                        return Err(self.raise(format!("Expected {a} arguments, got {n}")));
                    }
                }
                let args: Vec<Value> = self.stack[callee_idx + 1..].to_vec();
                let result = (nf.func)(&mut self.strings, &args);
                self.stack.truncate(callee_idx);
                match result {
                    Ok(v) => self.push_checked(v),
                    Err(v) => Err(Thrown::User(v)),
                }
            }
            other => Err(self.raise(format!("Expected a callable value, got `{}`", other.type_name()))),
        }
    }

    /// Execute one already-decoded opcode. `next_ip` is the offset the
    /// instruction stream already advanced past this instruction to —
    /// jump-shaped opcodes compute their target relative to it, matching
    /// the compiler's own `patch_jump`/`emit_loop` offset arithmetic.
    fn execute(&mut self, op: Opcode, function: &Rc<Function>, next_ip: usize) -> Result<Flow, Thrown> {
        use Opcode::*;
        match op {
            Pop => {
                self.pop();
            }
            PopTwo => {
                self.pop();
                self.pop();
            }
            PopN(n) => {
                for _ in 0..n {
                    self.pop();
                }
            }
            Duplicate => {
                let top = self.stack.last().expect("vm: duplicate on empty stack").clone();
                self.push_checked(top)?;
            }

            NoneLit => self.push_checked(Value::None)?,
            TrueLit => self.push_checked(Value::Bool(true))?,
            FalseLit => self.push_checked(Value::Bool(false))?,
            Constant(k) => {
                let value = match function.code.constant(k) {
                    ConstantValue::Int(n) => Value::Int(*n),
                    ConstantValue::Float(f) => Value::Float(*f),
                    ConstantValue::String(s) => Value::String(s.clone()),
                    ConstantValue::Function(f) => Value::Function(f.clone()),
                    ConstantValue::FreshArray => Value::new_array(),
                    ConstantValue::FreshTable => Value::new_table(),
                };
                self.push_checked(value)?;
            }

            Add => {
                let b = self.pop();
                let a = self.pop();
                match value_ops::add(&mut self.strings, &a, &b) {
                    Ok(v) => self.push_checked(v)?,
                    Err(e) => return Err(self.raise(e)),
                }
            }
            Subtract => self.binary_numeric(value_ops::subtract)?,
            Multiply => self.binary_numeric(value_ops::multiply)?,
            Divide => self.binary_numeric(value_ops::divide)?,
            Modulo => self.binary_numeric(value_ops::modulo)?,
            Negate => {
                let v = self.pop();
                match value_ops::negate(&v) {
                    Ok(r) => self.push_checked(r)?,
                    Err(e) => return Err(self.raise(e)),
                }
            }
            Increment(by) => {
                let v = self.pop();
                match value_ops::increment(&v, by) {
                    Ok(r) => self.push_checked(r)?,
                    Err(e) => return Err(self.raise(e)),
                }
            }
            AddTwoLocal(s, t) => {
                let base = self.frames.last().unwrap().stack_base;
                let a = self.stack[base + s as usize].clone();
                let b = self.stack[base + t as usize].clone();
                match value_ops::add(&mut self.strings, &a, &b) {
                    Ok(v) => self.push_checked(v)?,
                    Err(e) => return Err(self.raise(e)),
                }
            }
            IncrementLocal(s, by) => {
                let base = self.frames.last().unwrap().stack_base;
                let v = self.stack[base + s as usize].clone();
                match value_ops::increment(&v, by) {
                    Ok(r) => self.push_checked(r)?,
                    Err(e) => return Err(self.raise(e)),
                }
            }
            IncrementLocalAndSet(s, by) => {
                let base = self.frames.last().unwrap().stack_base;
                let v = self.stack[base + s as usize].clone();
                match value_ops::increment(&v, by) {
                    Ok(r) => self.stack[base + s as usize] = r,
                    Err(e) => return Err(self.raise(e)),
                }
            }

            BitAnd => self.binary_numeric(|a, b| value_ops::bit_and(a, b))?,
            BitOr => self.binary_numeric(|a, b| value_ops::bit_or(a, b))?,
            BitXor => self.binary_numeric(|a, b| value_ops::bit_xor(a, b))?,
            BitNot => {
                let v = self.pop();
                match value_ops::bit_not(&v) {
                    Ok(r) => self.push_checked(r)?,
                    Err(e) => return Err(self.raise(e)),
                }
            }
            LeftShift => self.binary_numeric(|a, b| value_ops::left_shift(a, b))?,
            RightShift => self.binary_numeric(|a, b| value_ops::right_shift(a, b))?,

            Equal => {
                let b = self.pop();
                let a = self.pop();
                self.push_checked(Value::Bool(value_ops::values_equal(&a, &b)))?;
            }
            NotEqual => {
                let b = self.pop();
                let a = self.pop();
                self.push_checked(Value::Bool(!value_ops::values_equal(&a, &b)))?;
            }
            Less => self.compare_op(|o| o == std::cmp::Ordering::Less)?,
            LessEqual => self.compare_op(|o| o != std::cmp::Ordering::Greater)?,
            Greater => self.compare_op(|o| o == std::cmp::Ordering::Greater)?,
            GreaterEqual => self.compare_op(|o| o != std::cmp::Ordering::Less)?,

            JumpIfEqual(off) => {
                let b = self.pop();
                let a = self.pop();
                if value_ops::values_equal(&a, &b) {
                    return Ok(Flow::Jump(next_ip + off as usize));
                }
            }
            JumpIfNotEqual(off) => {
                let b = self.pop();
                let a = self.pop();
                if !value_ops::values_equal(&a, &b) {
                    return Ok(Flow::Jump(next_ip + off as usize));
                }
            }
            JumpIfLess(off) => return self.jump_if_cmp(next_ip, off, |o| o == std::cmp::Ordering::Less),
            JumpIfLessEqual(off) => {
                return self.jump_if_cmp(next_ip, off, |o| o != std::cmp::Ordering::Greater);
            }
            JumpIfGreater(off) => {
                return self.jump_if_cmp(next_ip, off, |o| o == std::cmp::Ordering::Greater);
            }
            JumpIfGreaterEqual(off) => {
                return self.jump_if_cmp(next_ip, off, |o| o != std::cmp::Ordering::Less);
            }

            Not => {
                let v = self.pop();
                self.push_checked(Value::Bool(!v.is_truthy()))?;
            }

            DefineGlobal(k) => {
                let name = self.constant_string(function, k);
                let value = self.pop();
                self.globals.insert(name, value);
            }
            GetGlobal(k) => {
                let name = self.constant_string(function, k);
                match self.globals.get(&name) {
                    Some(v) => {
                        let v = v.clone();
                        self.push_checked(v)?;
                    }
                    None => return Err(self.raise(format!("Undefined global `{}`", name.as_str()))),
                }
            }
            SetGlobal(k) => {
                let name = self.constant_string(function, k);
                if !self.globals.contains_key(&name) {
                    return Err(self.raise(format!(
                        "Undefined global `{}` (use 'let' to define it first)",
                        name.as_str()
                    )));
                }
                let value = self.stack.last().expect("vm: set_global on empty stack").clone();
                self.globals.insert(name, value);
            }
            GetLocal(s) => {
                let base = self.frames.last().unwrap().stack_base;
                let v = self.stack[base + s as usize].clone();
                self.push_checked(v)?;
            }
            SetLocal(s) => {
                let base = self.frames.last().unwrap().stack_base;
                let value = self.pop();
                self.stack[base + s as usize] = value;
            }

            GetProperty(k) => {
                let obj = self.pop();
                let name = self.constant_string(function, k);
                let result = match &obj {
                    Value::Table(t) => {
                        let v = t.borrow().get(&name);
                        if v == Value::Undefined { Value::None } else { v }
                    }
                    other => {
                        return Err(self.raise(format!(
                            "Expected `Table` for property access, got `{}`",
                            other.type_name()
                        )));
                    }
                };
                self.push_checked(result)?;
            }
            SetProperty(k) => {
                let len = self.stack.len();
                let value = self.stack[len - 1].clone();
                let obj = self.stack.remove(len - 2);
                let name = self.constant_string(function, k);
                match &obj {
                    Value::Table(t) => {
                        t.borrow_mut().put(name, value);
                    }
                    other => {
                        return Err(self.raise(format!(
                            "Expected `Table` for property assignment, got `{}`",
                            other.type_name()
                        )));
                    }
                }
            }
            GetDynamic => self.get_dynamic()?,
            SetDynamic => self.set_dynamic()?,
            Slice => self.slice()?,
            Len => {
                let obj = self.pop();
                let n = match &obj {
                    Value::Array(a) => a.borrow().len() as i64,
                    Value::Table(t) => t.borrow().len() as i64,
                    Value::String(s) => s.as_str().chars().count() as i64,
                    other => {
                        return Err(self.raise(format!(
                            "Expected `Array`, `Table` or `String` for `len`, got `{}`",
                            other.type_name()
                        )));
                    }
                };
                self.push_checked(Value::Int(n))?;
            }
            Keys => {
                let obj = self.pop();
                match &obj {
                    Value::Table(t) => {
                        let keys: Vec<Value> = t.borrow().keys_sorted().into_iter().map(Value::String).collect();
                        let arr = Value::Array(Rc::new(RefCell::new(Array::with_values(keys))));
                        self.push_checked(arr)?;
                    }
                    other => {
                        return Err(self.raise(format!("Expected `Table` for `keys`, got `{}`", other.type_name())));
                    }
                }
            }
            Copy => {
                let obj = self.pop();
                let result = match &obj {
                    Value::Array(a) => Value::Array(Rc::new(RefCell::new(a.borrow().clone()))),
                    Value::Table(t) => Value::Table(Rc::new(RefCell::new(t.borrow().clone()))),
                    other => {
                        return Err(self.raise(format!(
                            "Expected `Array` or `Table` for `copy`, got `{}`",
                            other.type_name()
                        )));
                    }
                };
                self.push_checked(result)?;
            }
            Clear => {
                let obj = self.pop();
                match &obj {
                    Value::Array(a) => a.borrow_mut().clear(),
                    Value::Table(t) => t.borrow_mut().clear(),
                    other => {
                        return Err(self.raise(format!(
                            "Expected `Array` or `Table` for `clear`, got `{}`",
                            other.type_name()
                        )));
                    }
                }
                self.push_checked(Value::None)?;
            }
            Delete => self.delete()?,
            Index => self.index_of()?,
            Type => {
                let obj = self.pop();
                let interned = self.strings.intern(obj.type_name());
                self.push_checked(Value::String(interned))?;
            }
            ToInteger => {
                let v = self.pop();
                match value_ops::to_integer(&v) {
                    Ok(r) => self.push_checked(r)?,
                    Err(e) => return Err(self.raise(e)),
                }
            }
            ToFloat => {
                let v = self.pop();
                match value_ops::to_float(&v) {
                    Ok(r) => self.push_checked(r)?,
                    Err(e) => return Err(self.raise(e)),
                }
            }
            ToString => {
                let v = self.pop();
                let r = value_ops::to_string_value(&mut self.strings, &v);
                self.push_checked(r)?;
            }

            ArrayPush => {
                let value = self.pop();
                let arr = self.pop();
                match &arr {
                    Value::Array(a) => a.borrow_mut().push(value),
                    other => {
                        return Err(self.raise(format!("Expected `Array` for `push`, got `{}`", other.type_name())));
                    }
                }
                self.push_checked(arr)?;
            }
            ArrayPop => {
                let arr = self.pop();
                let result = match &arr {
                    Value::Array(a) => match a.borrow_mut().pop() {
                        Some(v) => v,
                        None => return Err(self.raise("Array is empty")),
                    },
                    other => {
                        return Err(self.raise(format!("Expected `Array` for `pop`, got `{}`", other.type_name())));
                    }
                };
                self.push_checked(result)?;
            }
            ArrayInsert => self.array_insert()?,

            Jump(off) => return Ok(Flow::Jump(next_ip + off as usize)),
            JumpIfFalse(off) => {
                let cond = self.pop();
                if !cond.is_truthy() {
                    return Ok(Flow::Jump(next_ip + off as usize));
                }
            }
            JumpIfTrue(off) => {
                let cond = self.pop();
                if cond.is_truthy() {
                    return Ok(Flow::Jump(next_ip + off as usize));
                }
            }
            Loop(off) => return Ok(Flow::Jump(next_ip - off as usize)),

            Call(n) => self.call_value(n, false)?,
            TailCall(n) => self.call_value(n, true)?,
            Return => {
                let retval = self.pop();
                let base = self.frames.last().unwrap().stack_base;
                self.stack.truncate(base);
                self.stack.push(retval);
                self.frames.pop();
                if self.frames.is_empty() {
                    return Ok(Flow::Done(self.stack.pop().unwrap()));
                }
            }

            Throw => {
                let value = self.pop();
                return Err(Thrown::User(value));
            }

            Print => {
                let value = self.pop();
                (self.print_hook)(&value.display_string());
            }

            Use => {
                let path_value = self.pop();
                let path = match path_value {
                    Value::String(s) => s.as_str().to_string(),
                    other => {
                        return Err(self.raise(format!(
                            "Expected `String` path for `use`, got `{}`",
                            other.type_name()
                        )));
                    }
                };
                match self.resolve_use(&path) {
                    Ok(None) => {}
                    Ok(Some((_key, module_function))) => {
                        self.push_checked(Value::Function(module_function))?;
                        self.call_value(0, false)?;
                    }
                    Err(msg) => return Err(self.raise(msg)),
                }
            }
        }
        Ok(Flow::Next)
    }

    fn binary_numeric(&mut self, op: impl Fn(&Value, &Value) -> Result<Value, String>) -> Result<(), Thrown> {
        let b = self.pop();
        let a = self.pop();
        match op(&a, &b) {
            Ok(v) => self.push_checked(v),
            Err(e) => Err(self.raise(e)),
        }
    }

    fn compare_op(&mut self, holds: impl Fn(std::cmp::Ordering) -> bool) -> Result<(), Thrown> {
        let b = self.pop();
        let a = self.pop();
        match value_ops::compare(&a, &b) {
            Ok(ord) => self.push_checked(Value::Bool(holds(ord))),
            Err(e) => Err(self.raise(e)),
        }
    }

    fn jump_if_cmp(&mut self, next_ip: usize, off: u16, holds: impl Fn(std::cmp::Ordering) -> bool) -> Result<Flow, Thrown> {
        let b = self.pop();
        let a = self.pop();
        match value_ops::compare(&a, &b) {
            Ok(ord) if holds(ord) => Ok(Flow::Jump(next_ip + off as usize)),
            Ok(_) => Ok(Flow::Next),
            Err(e) => Err(self.raise(e)),
        }
    }

    fn get_dynamic(&mut self) -> Result<(), Thrown> {
        let index = self.pop();
        let obj = self.pop();
        let result = match &obj {
            Value::Array(a) => {
                let Value::Int(i) = index else {
                    return Err(self.raise(format!("Expected `Integer` index for array, got `{}`", index.type_name())));
                };
                match a.borrow().get(i).cloned() {
                    Some(v) => v,
                    None => return Err(self.raise("Array index out of bounds")),
                }
            }
            Value::Table(t) => {
                let Value::String(k) = index else {
                    return Err(self.raise(format!("Expected `String` key for table, got `{}`", index.type_name())));
                };
                let v = t.borrow().get(&k);
                if v == Value::Undefined { Value::None } else { v }
            }
            Value::String(s) => {
                let Value::Int(i) = index else {
                    return Err(self.raise(format!("Expected `Integer` index for string, got `{}`", index.type_name())));
                };
                let chars: Vec<char> = s.as_str().chars().collect();
                let len = chars.len() as i64;
                let real = if i < 0 { len + i } else { i };
                if real < 0 || real >= len {
                    return Err(self.raise("String index out of bounds"));
                }
                Value::String(self.strings.intern(&chars[real as usize].to_string()))
            }
            other => {
                return Err(self.raise(format!(
                    "Expected `Array`, `Table` or `String` to index, got `{}`",
                    other.type_name()
                )));
            }
        };
        self.push_checked(result)
    }

    fn set_dynamic(&mut self) -> Result<(), Thrown> {
        let len = self.stack.len();
        let value = self.stack[len - 1].clone();
        let index = self.stack.remove(len - 2);
        let obj = self.stack.remove(len - 3);
        match &obj {
            Value::Array(a) => {
                let Value::Int(i) = index else {
                    return Err(self.raise(format!("Expected `Integer` index for array, got `{}`", index.type_name())));
                };
                if a.borrow_mut().set(i, value).is_err() {
                    return Err(self.raise("Array index out of bounds"));
                }
            }
            Value::Table(t) => {
                let Value::String(k) = index else {
                    return Err(self.raise(format!("Expected `String` key for table, got `{}`", index.type_name())));
                };
                t.borrow_mut().put(k, value);
            }
            other => {
                return Err(self.raise(format!(
                    "Expected `Array` or `Table` for index assignment, got `{}`",
                    other.type_name()
                )));
            }
        }
        Ok(())
    }

    fn slice(&mut self) -> Result<(), Thrown> {
        let end = self.pop();
        let start = self.pop();
        let obj = self.pop();
        let Value::Int(start_i) = start else {
            return Err(self.raise(format!("Expected `Integer` slice start, got `{}`", start.type_name())));
        };
        let end_i: Option<i64> = match end {
            Value::None => None,
            Value::Int(n) => Some(n),
            other => {
                return Err(self.raise(format!(
                    "Expected `Integer` or `none` slice end, got `{}`",
                    other.type_name()
                )));
            }
        };
        let result = match &obj {
            Value::Array(a) => {
                let len = a.borrow().len() as i64;
                let e = end_i.unwrap_or(len);
                match a.borrow().slice(start_i, e) {
                    Some(sliced) => Value::Array(Rc::new(RefCell::new(sliced))),
                    None => return Err(self.raise("Slice start must be less than end")),
                }
            }
            Value::String(s) => {
                let chars: Vec<char> = s.as_str().chars().collect();
                let len = chars.len() as i64;
                let e = end_i.unwrap_or(len);
                let resolve = |i: i64| -> i64 { if i < 0 { (len + i).max(0) } else { i.min(len) } };
                let sidx = resolve(start_i);
                let eidx = resolve(e);
                if sidx >= eidx {
                    return Err(self.raise("Slice start must be less than end"));
                }
                let substr: String = chars[sidx as usize..eidx as usize].iter().collect();
                Value::String(self.strings.intern(&substr))
            }
            other => {
                return Err(self.raise(format!("Expected `Array` or `String` to slice, got `{}`", other.type_name())));
            }
        };
        self.push_checked(result)
    }

    fn delete(&mut self) -> Result<(), Thrown> {
        let key = self.pop();
        let obj = self.pop();
        let result = match (&obj, &key) {
            (Value::Table(t), Value::String(k)) => {
                let v = t.borrow_mut().remove(k);
                if v == Value::Undefined { Value::None } else { v }
            }
            (Value::Array(a), Value::Int(i)) => match a.borrow_mut().remove(*i) {
                Some(v) => v,
                None => return Err(self.raise("Array index out of bounds")),
            },
            _ => {
                return Err(self.raise(format!(
                    "Expected `Table` or `Array` for `delete`, got `{}`",
                    obj.type_name()
                )));
            }
        };
        self.push_checked(result)
    }

    fn index_of(&mut self) -> Result<(), Thrown> {
        let needle = self.pop();
        let haystack = self.pop();
        let result: i64 = match &haystack {
            Value::Array(a) => a
                .borrow()
                .iter()
                .position(|v| value_ops::values_equal(v, &needle))
                .map(|i| i as i64)
                .unwrap_or(-1),
            Value::String(s) => match &needle {
                Value::String(n) => s
                    .as_str()
                    .find(n.as_str())
                    .map(|byte_idx| s.as_str()[..byte_idx].chars().count() as i64)
                    .unwrap_or(-1),
                other => {
                    return Err(self.raise(format!("Expected `String` needle for `index`, got `{}`", other.type_name())));
                }
            },
            other => {
                return Err(self.raise(format!(
                    "Expected `Array` or `String` for `index`, got `{}`",
                    other.type_name()
                )));
            }
        };
        self.push_checked(Value::Int(result))
    }

    fn array_insert(&mut self) -> Result<(), Thrown> {
        let value = self.pop();
        let index = self.pop();
        let arr = self.pop();
        let Value::Int(i) = index else {
            return Err(self.raise(format!("Expected `Integer` index for `insert`, got `{}`", index.type_name())));
        };
        match &arr {
            Value::Array(a) => {
                let len = a.borrow().len() as i64;
                let real = if i < 0 { len + i } else { i };
                if real < 0 || real > len {
                    return Err(self.raise("Array index out of bounds"));
                }
                a.borrow_mut().insert(real as usize, value).ok();
            }
            other => {
                return Err(self.raise(format!("Expected `Array` for `insert`, got `{}`", other.type_name())));
            }
        }
        self.push_checked(arr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc as StdRc;

    fn run_capture(source: &str) -> (Result<Value, String>, Vec<String>) {
        let output = StdRc::new(StdRefCell::new(Vec::new()));
        let output_clone = output.clone();
        let mut vm = Vm::with_print_hook(VmConfig::default(), move |s| output_clone.borrow_mut().push(s.to_string()));
        let result = vm.interpret(source, "<test>");
        let lines = output.borrow().clone();
        (result, lines)
    }

    #[test]
    fn arithmetic_and_locals() {
        let (result, output) = run_capture("let a = 3 let b = 4 print a * b + 1");
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(output, vec!["13"]);
    }

    #[test]
    fn if_elif_else_chain() {
        let (result, output) = run_capture(
            "let x = 10\nif x < 5\nprint \"a\"\nelif x < 20\nprint \"b\"\nelse\nprint \"c\"\nend",
        );
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(output, vec!["b"]);
    }

    #[test]
    fn table_iteration_uses_sorted_keys() {
        let (result, output) = run_capture(
            "let t = { b: 2, a: 1, c: 3 }\niterate k, v in t\nprint k + \"=\" + v\nend",
        );
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(output, vec!["a=1", "b=2", "c=3"]);
    }

    #[test]
    fn try_except_recovers_and_continues() {
        let (result, output) = run_capture(
            "try\nthrow \"bad\"\nexcept e\nprint \"got \" + e\nend\nprint \"after\"",
        );
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(output, vec!["got bad", "after"]);
    }

    #[test]
    fn unrecovered_array_out_of_bounds_reports_message() {
        let (result, _output) = run_capture("let a = []\nprint a[5]");
        let err = result.unwrap_err();
        assert!(err.contains("Array index out of bounds"), "{err}");
    }

    #[test]
    fn tail_call_recursion_does_not_overflow_frames() {
        let source = "function f(n)\nif n == 0\nreturn 0\nend\nreturn f(n - 1)\nend\nprint f(10000)";
        let (result, output) = run_capture(source);
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(output, vec!["0"]);
    }

    #[test]
    fn negative_array_index_counts_from_end() {
        let (result, output) = run_capture("let a = [1, 2, 3]\nprint a[-1]");
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(output, vec!["3"]);
    }

    #[test]
    fn undefined_global_assignment_errs() {
        let (result, _) = run_capture("x = 1");
        assert!(result.unwrap_err().contains("Undefined global"));
    }

    #[test]
    fn nested_if_with_fused_jumps_behaves_correctly() {
        let source = "let x = 7\nif x > 0\nif x > 5\nprint \"big\"\nelse\nprint \"small\"\nend\nend";
        let (result, output) = run_capture(source);
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(output, vec!["big"]);
    }
}
