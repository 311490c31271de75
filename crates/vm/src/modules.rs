//! Module loader: resolves a `use "path"` argument against the
//! configured search templates, compiles and runs the target file once,
//! and caches it so a second `use` of the same resolved path is a no-op.
//!
//! Candidate-path construction, `exists()` probing, and `canonicalize()`
//! for a stable cache key are the same shape an editor's "jump to
//! included file" feature needs, just turned into a required runtime
//! resolution instead of a best-effort lookup.

use crate::compiler::Compiler;
use crate::vm::Vm;
use hymn_core::Value;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::debug;

impl Vm {
    /// Walk the frame stack innermost to outermost looking for the nearest
    /// frame whose function carries a `script` path. Returns that path's
    /// parent directory, or `.` if no frame has one
    /// (e.g. source compiled without a script name).
    fn importing_parent_dir(&self) -> PathBuf {
        for frame in self.frames.iter().rev() {
            if let Some(script) = &frame.function.script {
                let path = Path::new(script.as_ref());
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        return parent.to_path_buf();
                    }
                }
                return PathBuf::from(".");
            }
        }
        PathBuf::from(".")
    }

    fn search_templates(&self) -> Vec<String> {
        match self.globals.get(&self.paths_key) {
            Some(Value::Array(arr)) => arr
                .borrow()
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.as_str().to_string()),
                    _ => None,
                })
                .collect(),
            _ => self.config.default_paths.clone(),
        }
    }

    /// `USE <string>`. Returns the already-interned, absolute
    /// path and the freshly compiled module `Function` the caller should
    /// invoke — or `Ok(None)` when the module was already loaded (the
    /// no-op cache hit).
    pub(crate) fn resolve_use(&mut self, arg: &str) -> Result<Option<(String, Rc<hymn_core::Function>)>, String> {
        let parent = self.importing_parent_dir();
        let parent_str = parent.to_string_lossy().to_string();
        let mut tried = Vec::new();

        for template in self.search_templates() {
            let candidate = template
                .replace("<path>", arg)
                .replace("<parent>", &parent_str);
            let candidate_path = PathBuf::from(&candidate);
            tried.push(candidate);

            if !candidate_path.exists() {
                continue;
            }
            let canonical = candidate_path
                .canonicalize()
                .unwrap_or(candidate_path.clone());
            let key = canonical.to_string_lossy().to_string();

            if self.is_imported(&key) {
                debug!(module = %key, "use: already imported, no-op");
                return Ok(None);
            }

            let source = std::fs::read_to_string(&canonical)
                .map_err(|e| format!("Failed to read module `{key}`: {e}"))?;
            let function = {
                let mut compiler_strings = std::mem::take(&mut self.strings);
                let compiler = Compiler::new(&source, &key, &mut compiler_strings);
                let (function, err) = compiler.compile();
                self.strings = compiler_strings;
                if let Some(err) = err {
                    return Err(format!("Failed to compile module `{key}`: {err}"));
                }
                function
            };
            self.mark_imported(&key);
            debug!(module = %key, "use: loaded");
            return Ok(Some((key, Rc::new(function))));
        }

        Err(format!(
            "Import not found for `{arg}`, tried: {}",
            tried.join(", ")
        ))
    }

    fn is_imported(&self, key: &str) -> bool {
        match self.globals.get(&self.imports_key) {
            Some(Value::Table(t)) => {
                let interned = t.borrow().keys_unordered().into_iter().find(|k| k.as_str() == key);
                interned.is_some()
            }
            _ => false,
        }
    }

    fn mark_imported(&mut self, key: &str) {
        let interned_key = self.strings.intern(key);
        if let Some(Value::Table(t)) = self.globals.get(&self.imports_key) {
            t.borrow_mut().put(interned_key, Value::Bool(true));
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::vm::Vm;
    use tempfile::tempdir;

    #[test]
    fn use_same_module_twice_runs_it_once() {
        let dir = tempdir().unwrap();
        let module_path = dir.path().join("m.hm");
        std::fs::write(&module_path, "print \"loaded\"\n").unwrap();

        let main_path = dir.path().join("main.hm");
        let source = "use \"m\"\nuse \"m\"\n";
        std::fs::write(&main_path, source).unwrap();

        let mut output = Vec::new();
        let mut vm = Vm::with_print_hook(Default::default(), |s| output.push(s.to_string()));
        let result = vm.interpret(source, &main_path.to_string_lossy());
        assert!(result.is_ok(), "unexpected error: {result:?}");
        assert_eq!(output, vec!["loaded".to_string()]);
    }

    #[test]
    fn missing_module_reports_every_tried_path() {
        let dir = tempdir().unwrap();
        let main_path = dir.path().join("main.hm");
        let source = "use \"nope\"\n";
        let mut vm = Vm::new(Default::default());
        let err = vm.interpret(source, &main_path.to_string_lossy()).unwrap_err();
        assert!(err.contains("Import not found"));
    }
}
