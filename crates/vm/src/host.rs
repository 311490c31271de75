//! Host extension API: the contract stdlib binders (math, io, json, os,
//! pattern, text, glob — all out of scope for this core) use to register
//! themselves with a [`Vm`] before a script runs.
//!
//! A registration-style FFI surface, generalized from raw extern-"C"
//! function pointers into a safe boxed closure stored directly as a
//! `Value::NativeFunction`.

use crate::vm::Vm;
use hymn_core::{Array, InternedString, NativeFn, NativeFunction, Table, Value};
use std::cell::RefCell;
use std::rc::Rc;

impl Vm {
    /// Intern a string through the VM's shared string table.
    pub fn intern(&mut self, s: &str) -> InternedString {
        self.strings.intern(s)
    }

    pub fn new_array(&self) -> Value {
        Value::new_array()
    }

    pub fn new_table(&self) -> Value {
        Value::new_table()
    }

    /// Register `value` as a global the way `let` at the top level would.
    pub fn define_global(&mut self, name: &str, value: Value) {
        let key = self.strings.intern(name);
        self.globals.insert(key, value);
    }

    /// Read a global without going through bytecode. Returns
    /// `Value::Undefined` if unset.
    pub fn get_global(&self, name: &str) -> Value {
        self.globals
            .iter()
            .find(|(k, _)| k.as_str() == name)
            .map(|(_, v)| v.clone())
            .unwrap_or(Value::Undefined)
    }

    /// Set a global without going through bytecode.
    pub fn set_global(&mut self, name: &str, value: Value) {
        let key = self.strings.intern(name);
        self.globals.insert(key, value);
    }

    /// Register a native function as a global callable.
    pub fn define_native(
        &mut self,
        name: &str,
        arity: Option<usize>,
        f: impl Fn(&mut hymn_core::StringTable, &[Value]) -> Result<Value, Value> + 'static,
    ) {
        let interned = self.strings.intern(name);
        let native = Value::NativeFunction(Rc::new(NativeFunction {
            name: interned.clone(),
            arity,
            func: Box::new(f) as Box<NativeFn>,
        }));
        self.globals.insert(interned, native);
    }

    /// Register a native function as a property of `table` — used by
    /// binders that expose a namespace (`math.sqrt`, `text.split`) rather
    /// than a bare global.
    pub fn define_native_method(
        &mut self,
        table: &Rc<RefCell<Table>>,
        name: &str,
        arity: Option<usize>,
        f: impl Fn(&mut hymn_core::StringTable, &[Value]) -> Result<Value, Value> + 'static,
    ) {
        let interned = self.strings.intern(name);
        let native = Value::NativeFunction(Rc::new(NativeFunction {
            name: interned.clone(),
            arity,
            func: Box::new(f) as Box<NativeFn>,
        }));
        table.borrow_mut().put(interned, native);
    }

    /// Construct a fresh array value pre-populated from `items` — a small
    /// convenience natives reach for constantly.
    pub fn array_from(&self, items: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(Array::with_values(items))))
    }
}

/// Build a `Value::String` for a native to raise as a typed exception.
/// Natives throw by returning `Err(value)` from their closure; this is
/// just a convenience constructor, not a special channel.
pub fn host_error(strings: &mut hymn_core::StringTable, message: impl Into<String>) -> Value {
    Value::String(strings.intern(&message.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Vm;

    #[test]
    fn native_function_is_callable_from_globals() {
        let mut vm = Vm::new(Default::default());
        vm.define_native("double", Some(1), |_strings, args| match &args[0] {
            Value::Int(n) => Ok(Value::Int(n * 2)),
            other => Err(Value::String(hymn_core::StringTable::new().intern(&format!(
                "expected int, got {}",
                other.type_name()
            )))),
        });
        let result = vm.interpret("print double(21)", "<test>");
        assert!(result.is_ok());
    }
}
