use std::collections::{HashMap, HashSet};
use std::ptr;
use std::rc::Rc;

use llvm_sys::analysis::{LLVMVerifierFailureAction, LLVMVerifyFunction, LLVMVerifyModule};
use llvm_sys::core;
use llvm_sys::prelude::*;
use llvm_sys::LLVMRealPredicate;
use log::debug;

use super::ast::{Expr, Function, Prototype};
use super::error::{Error, ErrorKind};
use super::llvm::{self, Context, Module};

/// Lowers ASTs to LLVM IR. Generated code accumulates in an open module
/// until the caller takes it; signatures outlive the modules they were
/// declared in.
pub(crate) struct CodeGen {
    builder: LLVMBuilderRef,
    module: Module,
    module_name: String,
    optimize: bool,
    /// Every known signature, whether declared by `extern` or defined.
    protos: HashMap<String, Prototype>,
    defined: HashSet<String>,
    /// Variables visible in the function being generated.
    named_values: HashMap<String, LLVMValueRef>,
    context: Rc<Context>,
}

impl CodeGen {
    pub(crate) fn new(context: Rc<Context>, module_name: &str, optimize: bool) -> Self {
        CodeGen {
            builder: unsafe { core::LLVMCreateBuilderInContext(context.raw()) },
            module: Module::new(&context, module_name, optimize),
            module_name: module_name.to_owned(),
            optimize,
            protos: HashMap::new(),
            defined: HashSet::new(),
            named_values: HashMap::new(),
            context,
        }
    }

    pub(crate) fn module(&self) -> &Module {
        &self.module
    }

    /// Hands over everything generated so far and opens a fresh module.
    pub(crate) fn take_module(&mut self) -> Module {
        let fresh = Module::new(&self.context, &self.module_name, self.optimize);
        std::mem::replace(&mut self.module, fresh)
    }

    pub(crate) fn prototype(&self, name: &str) -> Option<&Prototype> {
        self.protos.get(name)
    }

    pub(crate) fn is_defined(&self, name: &str) -> bool {
        self.defined.contains(name)
    }

    /// Drops `name` from the registry.
    pub(crate) fn forget(&mut self, name: &str) {
        self.protos.remove(name);
        self.defined.remove(name);
    }

    pub(crate) fn named_value(&self, name: &str) -> Option<LLVMValueRef> {
        self.named_values.get(name).copied()
    }

    fn double_type(&self) -> LLVMTypeRef {
        self.context.double_type()
    }

    fn const_f64(&self, n: f64) -> LLVMValueRef {
        unsafe { core::LLVMConstReal(self.double_type(), n) }
    }

    /// Finds `name` in the open module, declaring it there from its known
    /// signature when it was declared in an earlier module.
    fn get_function(&self, name: &str) -> Option<LLVMValueRef> {
        match self.module.get_function(name) {
            Some(function) => Some(function),
            None => self.protos.get(name).map(|proto| self.declare(proto)),
        }
    }

    fn declare(&self, proto: &Prototype) -> LLVMValueRef {
        let name = llvm::cstring(&proto.name);
        let mut params = vec![self.double_type(); proto.params.len()];
        unsafe {
            let fn_type = core::LLVMFunctionType(
                self.double_type(),
                params.as_mut_ptr(),
                params.len() as u32,
                0,
            );
            let function = core::LLVMAddFunction(self.module.raw(), name.as_ptr(), fn_type);
            name_params(function, proto);
            function
        }
    }

    fn current_function(&self) -> LLVMValueRef {
        unsafe { core::LLVMGetBasicBlockParent(core::LLVMGetInsertBlock(self.builder)) }
    }

    fn append_block(&self, function: LLVMValueRef, name: &[u8]) -> LLVMBasicBlockRef {
        unsafe {
            core::LLVMAppendBasicBlockInContext(
                self.context.raw(),
                function,
                name.as_ptr() as *const _,
            )
        }
    }

    fn codegen_expr(&mut self, e: &Expr) -> Result<LLVMValueRef, Error> {
        match e {
            Expr::Number(n) => Ok(self.const_f64(*n)),
            Expr::Variable(name) => match self.named_values.get(name) {
                Some(v) => Ok(*v),
                None => Err(Error::from(ErrorKind::UnknownVariable(name.clone()))),
            },
            Expr::Binary(op, lhs, rhs) => {
                let lhs_val = self.codegen_expr(lhs)?;
                let rhs_val = self.codegen_expr(rhs)?;
                let builder = self.builder;
                match *op {
                    '+' => unsafe {
                        Ok(core::LLVMBuildFAdd(
                            builder,
                            lhs_val,
                            rhs_val,
                            b"addtmp\0".as_ptr() as *const _,
                        ))
                    },
                    '-' => unsafe {
                        Ok(core::LLVMBuildFSub(
                            builder,
                            lhs_val,
                            rhs_val,
                            b"subtmp\0".as_ptr() as *const _,
                        ))
                    },
                    '*' => unsafe {
                        Ok(core::LLVMBuildFMul(
                            builder,
                            lhs_val,
                            rhs_val,
                            b"multmp\0".as_ptr() as *const _,
                        ))
                    },
                    '<' => unsafe {
                        let i = core::LLVMBuildFCmp(
                            builder,
                            LLVMRealPredicate::LLVMRealULT,
                            lhs_val,
                            rhs_val,
                            b"cmptmp\0".as_ptr() as *const _,
                        );
                        Ok(core::LLVMBuildUIToFP(
                            builder,
                            i,
                            self.double_type(),
                            b"booltmp\0".as_ptr() as *const _,
                        ))
                    },
                    other => Err(Error::from(ErrorKind::UnknownOperator(other))),
                }
            }
            Expr::Call(callee, args) => {
                let function = match self.get_function(callee) {
                    Some(f) => f,
                    None => return Err(Error::from(ErrorKind::UnknownFunction(callee.clone()))),
                };
                let expected = unsafe { core::LLVMCountParams(function) } as usize;
                if expected != args.len() {
                    return Err(Error::from(ErrorKind::ArgumentCount {
                        callee: callee.clone(),
                        expected,
                        found: args.len(),
                    }));
                }

                let mut arg_vals = Vec::with_capacity(args.len());
                for arg in args {
                    arg_vals.push(self.codegen_expr(arg)?);
                }
                unsafe {
                    Ok(core::LLVMBuildCall2(
                        self.builder,
                        core::LLVMGlobalGetValueType(function),
                        function,
                        arg_vals.as_mut_ptr(),
                        arg_vals.len() as u32,
                        b"calltmp\0".as_ptr() as *const _,
                    ))
                }
            }
            Expr::If {
                cond,
                then,
                otherwise,
            } => {
                let cond_val = self.codegen_expr(cond)?;
                let function = self.current_function();
                let then_bb = self.append_block(function, b"then\0");
                let else_bb = self.append_block(function, b"else\0");
                let merge_bb = self.append_block(function, b"ifcont\0");
                unsafe {
                    let cond_flag = core::LLVMBuildFCmp(
                        self.builder,
                        LLVMRealPredicate::LLVMRealONE,
                        cond_val,
                        self.const_f64(0.0),
                        b"ifcond\0".as_ptr() as *const _,
                    );
                    core::LLVMBuildCondBr(self.builder, cond_flag, then_bb, else_bb);
                    core::LLVMPositionBuilderAtEnd(self.builder, then_bb);
                }

                let then_val = self.codegen_expr(then)?;
                // Nested control flow may have moved the insertion block.
                let then_end = unsafe {
                    core::LLVMBuildBr(self.builder, merge_bb);
                    core::LLVMGetInsertBlock(self.builder)
                };

                unsafe { core::LLVMPositionBuilderAtEnd(self.builder, else_bb) };
                let else_val = self.codegen_expr(otherwise)?;
                let else_end = unsafe {
                    core::LLVMBuildBr(self.builder, merge_bb);
                    core::LLVMGetInsertBlock(self.builder)
                };

                unsafe {
                    core::LLVMPositionBuilderAtEnd(self.builder, merge_bb);
                    let phi = core::LLVMBuildPhi(
                        self.builder,
                        self.double_type(),
                        b"iftmp\0".as_ptr() as *const _,
                    );
                    let mut values = [then_val, else_val];
                    let mut blocks = [then_end, else_end];
                    core::LLVMAddIncoming(phi, values.as_mut_ptr(), blocks.as_mut_ptr(), 2);
                    Ok(phi)
                }
            }
            Expr::For {
                var,
                start,
                end,
                step,
                body,
            } => {
                let start_val = self.codegen_expr(start)?;
                let function = self.current_function();
                let loop_bb = self.append_block(function, b"loop\0");
                let variable = unsafe {
                    let preheader = core::LLVMGetInsertBlock(self.builder);
                    core::LLVMBuildBr(self.builder, loop_bb);
                    core::LLVMPositionBuilderAtEnd(self.builder, loop_bb);

                    let name = llvm::cstring(var);
                    let variable =
                        core::LLVMBuildPhi(self.builder, self.double_type(), name.as_ptr());
                    let mut values = [start_val];
                    let mut blocks = [preheader];
                    core::LLVMAddIncoming(variable, values.as_mut_ptr(), blocks.as_mut_ptr(), 1);
                    variable
                };

                let shadowed = self.named_values.insert(var.clone(), variable);
                let lowered = self.codegen_loop_tail(var, variable, end, step.as_deref(), body);
                match shadowed {
                    Some(outer) => {
                        self.named_values.insert(var.clone(), outer);
                    }
                    None => {
                        self.named_values.remove(var);
                    }
                }
                let (next_val, end_flag) = lowered?;

                unsafe {
                    let loop_end = core::LLVMGetInsertBlock(self.builder);
                    let after_bb = self.append_block(function, b"afterloop\0");
                    core::LLVMBuildCondBr(self.builder, end_flag, loop_bb, after_bb);
                    core::LLVMPositionBuilderAtEnd(self.builder, after_bb);

                    let mut values = [next_val];
                    let mut blocks = [loop_end];
                    core::LLVMAddIncoming(variable, values.as_mut_ptr(), blocks.as_mut_ptr(), 1);
                }
                Ok(self.const_f64(0.0))
            }
        }
    }

    /// Body, increment and exit test of a loop whose variable is bound to
    /// `variable`. The exit test sees the incremented value.
    fn codegen_loop_tail(
        &mut self,
        var: &str,
        variable: LLVMValueRef,
        end: &Expr,
        step: Option<&Expr>,
        body: &Expr,
    ) -> Result<(LLVMValueRef, LLVMValueRef), Error> {
        self.codegen_expr(body)?;

        let step_val = match step {
            Some(step) => self.codegen_expr(step)?,
            None => self.const_f64(1.0),
        };
        let next_val = unsafe {
            core::LLVMBuildFAdd(
                self.builder,
                variable,
                step_val,
                b"nextvar\0".as_ptr() as *const _,
            )
        };

        self.named_values.insert(var.to_owned(), next_val);
        let end_val = self.codegen_expr(end)?;
        let end_flag = unsafe {
            core::LLVMBuildFCmp(
                self.builder,
                LLVMRealPredicate::LLVMRealONE,
                end_val,
                self.const_f64(0.0),
                b"loopcond\0".as_ptr() as *const _,
            )
        };
        Ok((next_val, end_flag))
    }

    /// Records `proto` and declares it in the open module, or returns the
    /// declaration already there.
    pub(crate) fn codegen_proto(&mut self, proto: &Prototype) -> Result<LLVMValueRef, Error> {
        if let Some(known) = self.protos.get(&proto.name) {
            if known.params.len() != proto.params.len() {
                return Err(Error::from(ErrorKind::SignatureMismatch {
                    name: proto.name.clone(),
                    expected: known.params.len(),
                    found: proto.params.len(),
                }));
            }
        }
        self.protos.insert(proto.name.clone(), proto.clone());

        match self.module.get_function(&proto.name) {
            Some(function) => {
                name_params(function, proto);
                Ok(function)
            }
            None => Ok(self.declare(proto)),
        }
    }

    fn verify(&self, function: LLVMValueRef, name: &str) -> Result<(), Error> {
        let action = LLVMVerifierFailureAction::LLVMReturnStatusAction;
        unsafe {
            if LLVMVerifyFunction(function, action) == 0 {
                return Ok(());
            }
            let mut message = ptr::null_mut();
            LLVMVerifyModule(self.module.raw(), action, &mut message);
            Err(Error::from(ErrorKind::Verification {
                function: name.to_owned(),
                reason: llvm::take_message(message),
            }))
        }
    }

    /// Generates, verifies and optimizes a function. On failure the function
    /// is erased and the registry is left as it was before the call.
    pub(crate) fn codegen_func(&mut self, func: &Function) -> Result<LLVMValueRef, Error> {
        let name = &func.proto.name;
        if self.defined.contains(name) {
            return Err(Error::from(ErrorKind::Redefinition(name.clone())));
        }
        let prior = self.protos.get(name).cloned();
        let function = self.codegen_proto(&func.proto)?;

        unsafe {
            let entry = self.append_block(function, b"entry\0");
            core::LLVMPositionBuilderAtEnd(self.builder, entry);
        }
        self.named_values.clear();
        for (i, param) in func.proto.params.iter().enumerate() {
            let value = unsafe { core::LLVMGetParam(function, i as u32) };
            self.named_values.insert(param.clone(), value);
        }

        let generated = self.codegen_expr(&func.body).and_then(|ret| {
            unsafe { core::LLVMBuildRet(self.builder, ret) };
            self.verify(function, name)
        });
        if let Err(e) = generated {
            unsafe { core::LLVMDeleteFunction(function) };
            match prior {
                Some(proto) => {
                    self.protos.insert(name.clone(), proto);
                }
                None => {
                    self.protos.remove(name);
                }
            }
            return Err(e);
        }

        if self.module.optimize(function) {
            debug!("optimized '{}'", name);
        }
        self.defined.insert(name.clone());
        debug!("generated '{}'", name);
        Ok(function)
    }
}

impl Drop for CodeGen {
    fn drop(&mut self) {
        unsafe { core::LLVMDisposeBuilder(self.builder) }
    }
}

fn name_params(function: LLVMValueRef, proto: &Prototype) {
    for (i, param) in proto.params.iter().enumerate() {
        llvm::set_value_name(unsafe { core::LLVMGetParam(function, i as u32) }, param);
    }
}
