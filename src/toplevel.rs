use std::rc::Rc;

use super::codegen::CodeGen;
use super::engine::ExecutionEngine;
use super::error::Error;
use super::llvm::{self, Context};
use super::parser::{Parser, ANON_FN_PREFIX};
use super::token::{Token, TokenSource};
use llvm_sys::prelude::LLVMValueRef;
use log::{debug, info};

#[derive(Debug, Clone, Copy)]
pub(crate) struct Options {
    /// Print each generated function to stderr.
    pub dump_ir: bool,
    pub optimize: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            dump_ir: false,
            optimize: true,
        }
    }
}

/// What one top-level item produced.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outcome {
    Defined(String),
    Declared(String),
    Evaluated(f64),
}

/// The code generator and execution engine shared by every top-level item
/// of one run.
pub(crate) struct Session {
    engine: ExecutionEngine,
    codegen: CodeGen,
    options: Options,
}

impl Session {
    pub(crate) fn new(options: Options) -> Result<Self, Error> {
        let context = Rc::new(Context::new());
        Ok(Session {
            engine: ExecutionEngine::new(Rc::clone(&context))?,
            codegen: CodeGen::new(context, "my cool jit", options.optimize),
            options,
        })
    }

    pub(crate) fn engine_mut(&mut self) -> &mut ExecutionEngine {
        &mut self.engine
    }

    fn dump(&self, value: LLVMValueRef) {
        if self.options.dump_ir {
            eprint!("{}", llvm::print_value(value));
        }
    }

    pub(crate) fn handle_definition<S: TokenSource>(
        &mut self,
        parser: &mut Parser<S>,
    ) -> Result<Outcome, Error> {
        let func = match parser.parse_definition() {
            Ok(func) => func,
            Err(e) => {
                // Skip the offending token for error recovery.
                parser.advance();
                return Err(e);
            }
        };
        let function = self.codegen.codegen_func(&func)?;
        self.dump(function);
        self.engine.add_module(self.codegen.take_module())?;
        info!("defined '{}'", func.proto.name);
        Ok(Outcome::Defined(func.proto.to_string()))
    }

    pub(crate) fn handle_extern<S: TokenSource>(
        &mut self,
        parser: &mut Parser<S>,
    ) -> Result<Outcome, Error> {
        let proto = match parser.parse_extern() {
            Ok(proto) => proto,
            Err(e) => {
                parser.advance();
                return Err(e);
            }
        };
        let declared = self.codegen.codegen_proto(&proto)?;
        self.dump(declared);
        Ok(Outcome::Declared(proto.to_string()))
    }

    /// Compiles the expression as an anonymous function, runs it once and
    /// evicts it again.
    pub(crate) fn handle_top_level_expression<S: TokenSource>(
        &mut self,
        parser: &mut Parser<S>,
    ) -> Result<Outcome, Error> {
        let func = match parser.parse_top_level_expression() {
            Ok(func) => func,
            Err(e) => {
                parser.advance();
                return Err(e);
            }
        };
        let name = &func.proto.name;
        debug_assert!(name.starts_with(ANON_FN_PREFIX));

        let function = self.codegen.codegen_func(&func)?;
        self.dump(function);
        let module = self.codegen.take_module();
        self.codegen.forget(name);

        let handle = self.engine.add_module(module)?;
        let result = self.engine.lookup(name).map(|entry| entry.call());
        self.engine.evict(handle)?;
        debug!("evicted '{}'", name);

        result.map(Outcome::Evaluated)
    }

    /// Handles top-level items until the token source is exhausted,
    /// passing each result to `report`.
    pub(crate) fn run<S, F>(&mut self, parser: &mut Parser<S>, mut report: F)
    where
        S: TokenSource,
        F: FnMut(Result<Outcome, Error>),
    {
        loop {
            let result = match parser.current() {
                Token::Eof => return,
                Token::Kwd(';') => {
                    parser.advance();
                    continue;
                }
                Token::Def => self.handle_definition(parser),
                Token::Extern => self.handle_extern(parser),
                _ => self.handle_top_level_expression(parser),
            };
            report(result);
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::error::ErrorKind;
    use super::super::lexer::Lexer;
    use super::*;
    use libc::c_void;
    use std::cell::RefCell;

    thread_local! {
        static TICKS: RefCell<Vec<f64>> = RefCell::new(Vec::new());
    }

    extern "C" fn tick(x: f64) -> f64 {
        TICKS.with(|ticks| ticks.borrow_mut().push(x));
        0.0
    }

    fn ticking_session(options: Options) -> Session {
        TICKS.with(|ticks| ticks.borrow_mut().clear());
        let mut session = Session::new(options).unwrap();
        session
            .engine_mut()
            .register_native("tick", tick as usize as *mut c_void);
        session
    }

    fn ticks() -> Vec<f64> {
        TICKS.with(|ticks| ticks.borrow().clone())
    }

    fn run_with(session: &mut Session, src: &str) -> Vec<Result<Outcome, ErrorKind>> {
        let mut parser = Parser::new(Lexer::new(src.as_bytes()));
        let mut results = Vec::new();
        session.run(&mut parser, |r| results.push(r.map_err(|e| e.kind().clone())));
        results
    }

    fn run(src: &str) -> Vec<Result<Outcome, ErrorKind>> {
        run_with(&mut Session::new(Options::default()).unwrap(), src)
    }

    fn evaluated(results: &[Result<Outcome, ErrorKind>]) -> Vec<f64> {
        results
            .iter()
            .filter_map(|r| match r {
                Ok(Outcome::Evaluated(v)) => Some(*v),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn arithmetic_precedence() {
        let results = run("3 + 4 * 2; (3 + 4) * 2;");
        assert_eq!(evaluated(&results), vec![11.0, 14.0]);
    }

    #[test]
    fn dotted_number_is_one_literal() {
        assert_eq!(evaluated(&run("1.2.3; 4;")), vec![1.2, 4.0]);
    }

    #[test]
    fn less_than_yields_one_or_zero() {
        assert_eq!(evaluated(&run("1 < 2; 2 < 1;")), vec![1.0, 0.0]);
    }

    #[test]
    fn if_expression() {
        let results = run("def f(x) if x < 3 then 2 else 3; f(1); f(5);");
        assert_eq!(results[0], Ok(Outcome::Defined("f(x)".to_owned())));
        assert_eq!(evaluated(&results), vec![2.0, 3.0]);
    }

    #[test]
    fn top_level_if() {
        assert_eq!(
            evaluated(&run("if 1 then 2 else 3; if 0 then 2 else 3;")),
            vec![2.0, 3.0]
        );
    }

    #[test]
    fn loop_evaluates_to_zero() {
        assert_eq!(evaluated(&run("for i = 1, i < 4, 1 in i")), vec![0.0]);
    }

    #[test]
    fn fib() {
        let results = run(
            "def fib(x) if x < 3 then 1 else fib(x - 1) + fib(x - 2)
             fib(10)",
        );
        assert_eq!(evaluated(&results), vec![55.0]);
    }

    #[test]
    fn loop_runs_the_body_per_iteration() {
        let mut session = ticking_session(Options::default());
        let results = run_with(&mut session, "extern tick(x); for i = 1, i < 4 in tick(i);");
        assert_eq!(results[0], Ok(Outcome::Declared("tick(x)".to_owned())));
        assert_eq!(evaluated(&results), vec![0.0]);
        assert_eq!(ticks(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn loop_with_explicit_step() {
        let mut session = ticking_session(Options {
            optimize: false,
            ..Options::default()
        });
        run_with(&mut session, "extern tick(x); for i = 0, i < 6, 2 in tick(i);");
        assert_eq!(ticks(), vec![0.0, 2.0, 4.0]);
    }

    #[test]
    fn nested_control_flow_joins_correctly() {
        let results = run(
            "def g(x) if x then (for i = 1, i < 3 in 0) else (if x < 1 then 5 else 6);
             g(1); g(0); g(2);",
        );
        assert_eq!(evaluated(&results), vec![0.0, 5.0, 0.0]);
    }

    #[test]
    fn deep_recursion_runs_natively() {
        let results = run("def r(x) if x < 1 then 0 else r(x - 1) + 1; r(20000);");
        assert_eq!(evaluated(&results), vec![20000.0]);
    }

    #[test]
    fn redefinition_keeps_the_first_body() {
        let results = run("def foo(x) x + 1; def foo(x) x + 2; foo(1);");
        assert_eq!(results[1], Err(ErrorKind::Redefinition("foo".to_owned())));
        assert_eq!(evaluated(&results), vec![2.0]);
    }

    #[test]
    fn recovers_after_unknown_function() {
        let results = run("nope(1); 4;");
        assert_eq!(results[0], Err(ErrorKind::UnknownFunction("nope".to_owned())));
        assert_eq!(results[1], Ok(Outcome::Evaluated(4.0)));
    }

    #[test]
    fn recovers_after_syntax_error() {
        let results = run(") 4");
        assert!(matches!(results[0], Err(ErrorKind::Syntax(_))));
        assert_eq!(results[1], Ok(Outcome::Evaluated(4.0)));
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn extern_resolves_to_native() {
        let results = run("extern sin(x); sin(0); extern sqrt(x); sqrt(16);");
        assert_eq!(evaluated(&results), vec![0.0, 4.0]);
    }

    #[test]
    fn anonymous_functions_are_evicted() {
        let mut session = Session::new(Options::default()).unwrap();
        let results = run_with(&mut session, "1 + 1; 2;");
        assert_eq!(evaluated(&results), vec![2.0, 2.0]);
        assert!(session.engine.lookup("__anon_expr0").is_err());
        assert!(session.engine.lookup("__anon_expr1").is_err());
        assert!(session.codegen.prototype("__anon_expr0").is_none());
        assert!(session.codegen.module().get_function("__anon_expr0").is_none());
    }

    #[test]
    fn failed_definition_restores_extern() {
        let results = run("extern g(x); def g(x) y; def g(x) x * 2; g(4);");
        assert_eq!(results[1], Err(ErrorKind::UnknownVariable("y".to_owned())));
        assert_eq!(results[2], Ok(Outcome::Defined("g(x)".to_owned())));
        assert_eq!(evaluated(&results), vec![8.0]);
    }

    #[test]
    fn calling_an_undefined_extern_fails_at_run_time() {
        let results = run("extern nosuchfn(); nosuchfn(); 1;");
        assert!(matches!(results[1], Err(ErrorKind::Execution(_))));
        assert_eq!(results[2], Ok(Outcome::Evaluated(1.0)));
    }
}
