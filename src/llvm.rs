//! Owning wrappers and small helpers over the raw LLVM C API.

use std::ffi::{CStr, CString};
use std::ptr;
use std::sync::Once;

use libc::{c_char, c_void};
use llvm_sys::prelude::*;
use llvm_sys::transforms::{instcombine, scalar};
use llvm_sys::{core, execution_engine, support, target};
use log::{debug, error};

/// An LLVM context. Everything built in it must be dropped first.
pub(crate) struct Context {
    raw: LLVMContextRef,
}

impl Context {
    pub(crate) fn new() -> Self {
        Context {
            raw: unsafe { core::LLVMContextCreate() },
        }
    }

    pub(crate) fn raw(&self) -> LLVMContextRef {
        self.raw
    }

    pub(crate) fn double_type(&self) -> LLVMTypeRef {
        unsafe { core::LLVMDoubleTypeInContext(self.raw) }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe { core::LLVMContextDispose(self.raw) }
    }
}

/// A module we still own, with its function pass manager when optimizing.
pub(crate) struct Module {
    raw: LLVMModuleRef,
    fpm: Option<LLVMPassManagerRef>,
}

impl Module {
    pub(crate) fn new(context: &Context, name: &str, optimize: bool) -> Self {
        let name = cstring(name);
        unsafe {
            let raw = core::LLVMModuleCreateWithNameInContext(name.as_ptr(), context.raw());
            let fpm = if optimize {
                let fpm = core::LLVMCreateFunctionPassManagerForModule(raw);
                instcombine::LLVMAddInstructionCombiningPass(fpm);
                scalar::LLVMAddReassociatePass(fpm);
                scalar::LLVMAddGVNPass(fpm);
                scalar::LLVMAddCFGSimplificationPass(fpm);
                core::LLVMInitializeFunctionPassManager(fpm);
                Some(fpm)
            } else {
                None
            };
            Module { raw, fpm }
        }
    }

    pub(crate) fn raw(&self) -> LLVMModuleRef {
        self.raw
    }

    /// Runs the pass pipeline over `function`. Returns whether it changed.
    pub(crate) fn optimize(&self, function: LLVMValueRef) -> bool {
        match self.fpm {
            Some(fpm) => unsafe { core::LLVMRunFunctionPassManager(fpm, function) != 0 },
            None => false,
        }
    }

    pub(crate) fn get_function(&self, name: &str) -> Option<LLVMValueRef> {
        let name = cstring(name);
        let function = unsafe { core::LLVMGetNamedFunction(self.raw, name.as_ptr()) };
        if function.is_null() {
            None
        } else {
            Some(function)
        }
    }

    pub(crate) fn functions(&self) -> Vec<LLVMValueRef> {
        let mut functions = Vec::new();
        unsafe {
            let mut function = core::LLVMGetFirstFunction(self.raw);
            while !function.is_null() {
                functions.push(function);
                function = core::LLVMGetNextFunction(function);
            }
        }
        functions
    }

    pub(crate) fn function_names(&self) -> Vec<String> {
        self.functions().into_iter().map(value_name).collect()
    }

    /// Names of the functions this module gives a body.
    pub(crate) fn defined_names(&self) -> Vec<String> {
        self.functions()
            .into_iter()
            .filter(|f| unsafe { core::LLVMIsDeclaration(*f) == 0 })
            .map(value_name)
            .collect()
    }

    /// Names of body-less functions the module actually calls.
    pub(crate) fn external_names(&self) -> Vec<String> {
        self.functions()
            .into_iter()
            .filter(|f| unsafe {
                core::LLVMIsDeclaration(*f) != 0 && !core::LLVMGetFirstUse(*f).is_null()
            })
            .map(value_name)
            .collect()
    }

    /// Gives up ownership, typically to an execution engine.
    pub(crate) fn into_raw(mut self) -> LLVMModuleRef {
        self.dispose_passes();
        let raw = self.raw;
        std::mem::forget(self);
        raw
    }

    fn dispose_passes(&mut self) {
        if let Some(fpm) = self.fpm.take() {
            unsafe {
                core::LLVMFinalizeFunctionPassManager(fpm);
                core::LLVMDisposePassManager(fpm);
            }
        }
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        self.dispose_passes();
        unsafe { core::LLVMDisposeModule(self.raw) }
    }
}

pub(crate) fn cstring(s: &str) -> CString {
    CString::new(s).unwrap_or_default()
}

/// Copies and frees a message allocated by LLVM.
pub(crate) unsafe fn take_message(message: *mut c_char) -> String {
    if message.is_null() {
        return String::new();
    }
    let text = CStr::from_ptr(message).to_string_lossy().into_owned();
    core::LLVMDisposeMessage(message);
    text
}

pub(crate) fn value_name(value: LLVMValueRef) -> String {
    unsafe {
        let mut len = 0;
        let name = core::LLVMGetValueName2(value, &mut len);
        if name.is_null() {
            return String::new();
        }
        let bytes = std::slice::from_raw_parts(name as *const u8, len);
        String::from_utf8_lossy(bytes).into_owned()
    }
}

pub(crate) fn set_value_name(value: LLVMValueRef, name: &str) {
    unsafe { core::LLVMSetValueName2(value, name.as_ptr() as *const c_char, name.len()) }
}

/// Textual IR of a value, e.g. a whole function.
pub(crate) fn print_value(value: LLVMValueRef) -> String {
    unsafe { take_message(core::LLVMPrintValueToString(value)) }
}

pub(crate) fn basic_blocks(function: LLVMValueRef) -> Vec<LLVMBasicBlockRef> {
    unsafe {
        let mut blocks = vec![ptr::null_mut(); core::LLVMCountBasicBlocks(function) as usize];
        core::LLVMGetBasicBlocks(function, blocks.as_mut_ptr());
        blocks
    }
}

/// Makes `address` resolvable by JIT-compiled code under `name`.
pub(crate) fn add_symbol(name: &str, address: *mut c_void) {
    let name = cstring(name);
    unsafe { support::LLVMAddSymbol(name.as_ptr(), address) }
}

/// Whether the process (including symbols added with [`add_symbol`])
/// provides `name`.
pub(crate) fn process_has_symbol(name: &str) -> bool {
    let name = cstring(name);
    unsafe { !support::LLVMSearchForAddressOfSymbol(name.as_ptr()).is_null() }
}

extern "C" fn native_sin(x: f64) -> f64 {
    x.sin()
}

extern "C" fn native_cos(x: f64) -> f64 {
    x.cos()
}

extern "C" fn native_sqrt(x: f64) -> f64 {
    x.sqrt()
}

/// Prints a character to stderr.
extern "C" fn putchard(x: f64) -> f64 {
    eprint!("{}", (x as u8) as char);
    0.0
}

/// Prints a number on its own line to stderr.
extern "C" fn printd(x: f64) -> f64 {
    eprintln!("{}", x);
    0.0
}

static INIT: Once = Once::new();

/// Sets up the native target and MCJIT and registers the built-in natives.
/// Safe to call any number of times.
pub(crate) fn initialize() {
    INIT.call_once(|| unsafe {
        execution_engine::LLVMLinkInMCJIT();
        if target::LLVM_InitializeNativeTarget() != 0 {
            error!("failed to initialize the native target");
        }
        if target::LLVM_InitializeNativeAsmPrinter() != 0 {
            error!("failed to initialize the native asm printer");
        }
        support::LLVMLoadLibraryPermanently(ptr::null());

        add_symbol("sin", native_sin as usize as *mut c_void);
        add_symbol("cos", native_cos as usize as *mut c_void);
        add_symbol("sqrt", native_sqrt as usize as *mut c_void);
        add_symbol("putchard", putchard as usize as *mut c_void);
        add_symbol("printd", printd as usize as *mut c_void);
        debug!("LLVM initialized");
    });
}
