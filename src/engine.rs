//! JIT execution of generated modules.
//!
//! Modules are added and evicted as a whole. Calls between modules and
//! to native functions are resolved by symbol name when code is compiled.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::rc::Rc;

use libc::c_void;
use llvm_sys::core;
use llvm_sys::execution_engine::{self as ee, LLVMExecutionEngineRef};
use llvm_sys::prelude::*;
use llvm_sys::target;
use log::{debug, info};

use super::error::{Error, ErrorKind};
use super::llvm::{self, Context, Module};

const OPT_LEVEL: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct UnitHandle(u64);

/// A module owned by the engine.
struct Unit {
    module: LLVMModuleRef,
    /// Body-less functions the module calls.
    externs: Vec<String>,
}

fn execution_error<T>(message: String) -> Result<T, Error> {
    Err(Error::from(ErrorKind::Execution(message)))
}

pub(crate) struct ExecutionEngine {
    raw: LLVMExecutionEngineRef,
    units: HashMap<UnitHandle, Unit>,
    symbols: HashMap<String, UnitHandle>,
    next_handle: u64,
    _context: Rc<Context>,
}

impl ExecutionEngine {
    pub(crate) fn new(context: Rc<Context>) -> Result<Self, Error> {
        llvm::initialize();
        let root = Module::new(&context, "jit", false).into_raw();
        let mut raw = ptr::null_mut();
        let mut message = ptr::null_mut();
        unsafe {
            if ee::LLVMCreateJITCompilerForModule(&mut raw, root, OPT_LEVEL, &mut message) != 0 {
                return execution_error(format!(
                    "cannot create the JIT: {}",
                    llvm::take_message(message)
                ));
            }
        }
        Ok(ExecutionEngine {
            raw,
            units: HashMap::new(),
            symbols: HashMap::new(),
            next_handle: 0,
            _context: context,
        })
    }

    /// Makes the function at `address`, which must have the C signature
    /// `double(double, ...)`, callable from generated code as `name`.
    pub(crate) fn register_native(&mut self, name: &str, address: *mut c_void) {
        llvm::add_symbol(name, address);
        debug!("registered native '{}'", name);
    }

    /// Hands `module` to the JIT and makes every function it defines
    /// callable.
    pub(crate) fn add_module(&mut self, module: Module) -> Result<UnitHandle, Error> {
        let names = module.defined_names();
        if let Some(dup) = names.iter().find(|n| self.symbols.contains_key(*n)) {
            return execution_error(format!("duplicate symbol '{}'", dup));
        }
        let externs = module.external_names();

        let raw = module.into_raw();
        unsafe {
            target::LLVMSetModuleDataLayout(raw, ee::LLVMGetExecutionEngineTargetData(self.raw));
            ee::LLVMAddModule(self.raw, raw);
        }

        let handle = UnitHandle(self.next_handle);
        self.next_handle += 1;
        for name in &names {
            self.symbols.insert(name.clone(), handle);
        }
        info!("added unit {:?} defining {:?}", handle, names);
        self.units.insert(
            handle,
            Unit {
                module: raw,
                externs,
            },
        );
        Ok(handle)
    }

    pub(crate) fn evict(&mut self, handle: UnitHandle) -> Result<(), Error> {
        let unit = match self.units.remove(&handle) {
            Some(unit) => unit,
            None => return execution_error(format!("no resident unit {:?}", handle)),
        };
        unsafe {
            let mut module = ptr::null_mut();
            let mut message = ptr::null_mut();
            if ee::LLVMRemoveModule(self.raw, unit.module, &mut module, &mut message) != 0 {
                return execution_error(format!(
                    "cannot remove unit {:?}: {}",
                    handle,
                    llvm::take_message(message)
                ));
            }
            core::LLVMDisposeModule(module);
        }
        self.symbols.retain(|_, h| *h != handle);
        debug!("evicted unit {:?}", handle);
        Ok(())
    }

    /// Every extern reachable from `handle` must be defined by a resident
    /// unit or by the process. MCJIT aborts on unresolved symbols, so this
    /// runs before anything is compiled.
    fn check_resolvable(&self, handle: UnitHandle) -> Result<(), Error> {
        let mut pending = vec![handle];
        let mut seen = HashSet::new();
        while let Some(handle) = pending.pop() {
            if !seen.insert(handle) {
                continue;
            }
            let unit = match self.units.get(&handle) {
                Some(unit) => unit,
                None => continue,
            };
            for name in &unit.externs {
                match self.symbols.get(name) {
                    Some(dep) => pending.push(*dep),
                    None if llvm::process_has_symbol(name) => {}
                    None => return execution_error(format!("unresolved symbol '{}'", name)),
                }
            }
        }
        Ok(())
    }

    pub(crate) fn lookup(&self, symbol: &str) -> Result<EntryPoint, Error> {
        let handle = match self.symbols.get(symbol) {
            Some(handle) => *handle,
            None => return execution_error(format!("unresolved symbol '{}'", symbol)),
        };
        self.check_resolvable(handle)?;

        let name = llvm::cstring(symbol);
        let address = unsafe { ee::LLVMGetFunctionAddress(self.raw, name.as_ptr()) };
        if address == 0 {
            return execution_error(format!("no code for '{}'", symbol));
        }
        Ok(EntryPoint {
            address: address as usize,
            _engine: PhantomData,
        })
    }
}

impl Drop for ExecutionEngine {
    fn drop(&mut self) {
        unsafe { ee::LLVMDisposeExecutionEngine(self.raw) }
    }
}

/// A compiled zero-argument function, valid while its engine lives.
pub(crate) struct EntryPoint<'e> {
    address: usize,
    _engine: PhantomData<&'e ExecutionEngine>,
}

impl EntryPoint<'_> {
    pub(crate) fn call(&self) -> f64 {
        unsafe {
            let function: extern "C" fn() -> f64 = mem::transmute(self.address);
            function()
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::ast::{Expr, Function, Prototype};
    use super::super::codegen::CodeGen;
    use super::*;

    fn setup() -> (CodeGen, ExecutionEngine) {
        let context = Rc::new(Context::new());
        let engine = ExecutionEngine::new(Rc::clone(&context)).unwrap();
        (CodeGen::new(context, "test", false), engine)
    }

    fn function(name: &str, body: Expr) -> Function {
        Function {
            proto: Prototype {
                name: name.to_owned(),
                params: Vec::new(),
            },
            body,
        }
    }

    fn message(err: Error) -> String {
        match err.kind() {
            ErrorKind::Execution(msg) => msg.clone(),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn add_lookup_evict() {
        let (mut codegen, mut engine) = setup();
        codegen
            .codegen_func(&function("answer", Expr::Number(42.0)))
            .unwrap();
        let handle = engine.add_module(codegen.take_module()).unwrap();
        assert_eq!(engine.lookup("answer").unwrap().call(), 42.0);

        engine.evict(handle).unwrap();
        assert!(message(engine.lookup("answer").err().unwrap()).contains("unresolved"));
        assert!(engine.evict(handle).is_err());
    }

    #[test]
    fn rejects_duplicate_symbols() {
        let context = Rc::new(Context::new());
        let mut engine = ExecutionEngine::new(Rc::clone(&context)).unwrap();
        for (i, value) in [1.0, 2.0].iter().enumerate() {
            // Separate generators, so the second `a` is not a redefinition.
            let mut codegen = CodeGen::new(Rc::clone(&context), "test", false);
            codegen
                .codegen_func(&function("a", Expr::Number(*value)))
                .unwrap();
            let added = engine.add_module(codegen.take_module());
            if i == 0 {
                added.unwrap();
            } else {
                assert!(message(added.unwrap_err()).contains("duplicate symbol"));
            }
        }
        assert_eq!(engine.lookup("a").unwrap().call(), 1.0);
    }

    #[test]
    fn calls_cross_units() {
        let (mut codegen, mut engine) = setup();
        codegen.codegen_func(&function("two", Expr::Number(2.0))).unwrap();
        engine.add_module(codegen.take_module()).unwrap();

        let call = Expr::Call("two".to_owned(), Vec::new());
        let body = Expr::Binary('*', Box::new(call), Box::new(Expr::Number(3.0)));
        codegen.codegen_func(&function("six", body)).unwrap();
        engine.add_module(codegen.take_module()).unwrap();
        assert_eq!(engine.lookup("six").unwrap().call(), 6.0);
    }

    #[test]
    fn unresolved_extern_is_reported_before_compiling() {
        let (mut codegen, mut engine) = setup();
        let proto = Prototype {
            name: "nosuchfn".to_owned(),
            params: Vec::new(),
        };
        codegen.codegen_proto(&proto).unwrap();
        let call = Expr::Call("nosuchfn".to_owned(), Vec::new());
        codegen.codegen_func(&function("caller", call)).unwrap();
        engine.add_module(codegen.take_module()).unwrap();

        let err = engine.lookup("caller").err().unwrap();
        assert_eq!(message(err), "unresolved symbol 'nosuchfn'");
    }

    #[test]
    fn builtin_natives_resolve() {
        let (mut codegen, mut engine) = setup();
        let proto = Prototype {
            name: "sqrt".to_owned(),
            params: vec!["x".to_owned()],
        };
        codegen.codegen_proto(&proto).unwrap();
        let call = Expr::Call("sqrt".to_owned(), vec![Expr::Number(16.0)]);
        codegen.codegen_func(&function("root", call)).unwrap();
        engine.add_module(codegen.take_module()).unwrap();
        assert_eq!(engine.lookup("root").unwrap().call(), 4.0);
    }
}
