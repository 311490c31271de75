//! A live call record.
//!
//! Kept separate from the dispatch loop itself because both the VM proper
//! and the disassembler's "where am I" bookkeeping want a plain,
//! dependency-free description of a call.

use hymn_core::Function;
use std::rc::Rc;

pub struct Frame {
    pub function: Rc<Function>,
    /// Offset into `function.code.code` of the next instruction to decode.
    pub ip: usize,
    /// Index into the VM's value stack that is local slot zero for this
    /// call.
    pub stack_base: usize,
}

impl Frame {
    pub fn new(function: Rc<Function>, stack_base: usize) -> Self {
        Frame {
            function,
            ip: 0,
            stack_base,
        }
    }

    /// `None` for the top-level script frame — a frame with no
    /// function name is where the unwinder gives up and the VM
    /// terminates.
    pub fn name(&self) -> Option<&str> {
        self.function.name.as_ref().map(|n| n.as_str())
    }

    pub fn script(&self) -> &str {
        self.function.script.as_deref().unwrap_or("<script>")
    }

    pub fn current_line(&self) -> u32 {
        self.function.code.line_at(self.ip)
    }
}
