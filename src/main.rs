mod ast;
mod codegen;
mod engine;
mod error;
mod lexer;
mod llvm;
mod parser;
mod token;
mod toplevel;

use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::process;

use clap::Parser as _;
use failure::ResultExt;
use log::{info, Level};

use error::{Error, ErrorKind};
use lexer::Lexer;
use parser::Parser;
use token::TokenSource;
use toplevel::{Options, Outcome, Session};

#[derive(clap::Parser)]
#[command(name = "kaleido-ssa")]
#[command(about = "Interactive compiler for a tiny expression language", version)]
struct Cli {
    /// Source file; reads standard input interactively when omitted
    input: Option<PathBuf>,

    /// Print generated functions to stderr
    #[arg(long)]
    dump_ir: bool,

    /// Skip the optimization passes
    #[arg(long)]
    no_opt: bool,

    /// Log more (repeat for more detail)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn report(result: Result<Outcome, Error>) {
    match result {
        Ok(Outcome::Defined(proto)) => eprintln!("Read function definition: {}", proto),
        Ok(Outcome::Declared(proto)) => eprintln!("Read extern: {}", proto),
        Ok(Outcome::Evaluated(v)) => eprintln!("Evaluated to {}", v),
        Err(e) => eprintln!("Error: {}", e),
    }
}

fn drive<S: TokenSource>(session: &mut Session, source: S) {
    let mut parser = Parser::new(source);
    session.run(&mut parser, report);
}

fn run(cli: Cli) -> Result<(), Error> {
    let mut session = Session::new(Options {
        dump_ir: cli.dump_ir,
        optimize: !cli.no_opt,
    })?;

    match &cli.input {
        Some(path) => {
            let file = File::open(path).context(ErrorKind::Io(path.display().to_string()))?;
            info!("reading {}", path.display());
            drive(&mut session, Lexer::new(BufReader::new(file)));
        }
        None => {
            let stdin = io::stdin();
            drive(&mut session, Lexer::new(stdin.lock()).with_prompt("ready> "));
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => Level::Warn,
        1 => Level::Info,
        2 => Level::Debug,
        _ => Level::Trace,
    };
    if let Err(e) = simple_logger::init_with_level(level) {
        eprintln!("cannot install logger: {}", e);
    }

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
