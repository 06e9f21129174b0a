use std::io::{self, BufRead, Write};

use super::token::{Token, TokenSource};
use combine::error::ParseError;
use combine::parser::char::{alpha_num, digit, letter, newline, space};
use combine::parser::repeat::take_until;
use combine::stream::Stream;
use combine::{any, choice, eof, many, many1, parser, skip_many, skip_many1, token, Parser};
use log::{trace, warn};

/// A run of digits and dots. Like `strtod`, only the longest leading
/// decimal number counts; `1.2.3` is `1.2` and a lone `.` is `0`.
fn number<Input>() -> impl Parser<Input, Output = Token>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    many1::<String, _, _>(digit().or(token('.')))
        .map(|run: String| Token::Number(leading_number(&run)))
}

fn leading_number(run: &str) -> f64 {
    let end = match run.match_indices('.').nth(1) {
        Some((second_dot, _)) => second_dot,
        None => run.len(),
    };
    run[..end].parse().unwrap_or(0.0)
}

fn ident<Input>() -> impl Parser<Input, Output = Token>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (letter(), many::<String, _, _>(alpha_num())).map(|(first, rest)| {
        let id = format!("{}{}", first, rest);
        match id.as_ref() {
            "def" => Token::Def,
            "extern" => Token::Extern,
            "if" => Token::If,
            "then" => Token::Then,
            "else" => Token::Else,
            "for" => Token::For,
            "in" => Token::In,
            _ => Token::Ident(id),
        }
    })
}

/// A `#` comment runs to the end of the line or the end of the input,
/// whichever comes first.
fn comment<Input>() -> impl Parser<Input, Output = ()>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    let line_end = choice((
        newline().map(|_| ()),
        token('\r').map(|_| ()),
        eof(),
    ));
    skip_many1((token('#'), take_until::<Vec<_>, _, _>(line_end)))
}

fn lex_<Input>() -> impl Parser<Input, Output = Option<Token>>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    skip_many(space()).with(choice((
        number().map(Some),
        ident().map(Some),
        comment().with(lex()),
        eof().map(|_| None),
        any().map(|c| Some(Token::Kwd(c))),
    )))
}

parser! {
    pub(crate) fn lex[Input]()(Input) -> Option<Token>
        where [Input: Stream<Token=char>]
    {
        lex_()
    }
}

/// Pulls tokens out of a line-oriented reader, one line at a time.
pub(crate) struct Lexer<R> {
    reader: R,
    line: String,
    pos: usize,
    prompt: Option<String>,
    exhausted: bool,
}

impl<R: BufRead> Lexer<R> {
    pub(crate) fn new(reader: R) -> Self {
        Lexer {
            reader,
            line: String::new(),
            pos: 0,
            prompt: None,
            exhausted: false,
        }
    }

    /// Print `prompt` on stderr every time a new line is about to be read.
    pub(crate) fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    fn fill_line(&mut self) -> bool {
        if self.exhausted {
            return false;
        }
        if let Some(prompt) = &self.prompt {
            eprint!("{}", prompt);
            let _ = io::stderr().flush();
        }

        self.line.clear();
        self.pos = 0;
        match self.reader.read_line(&mut self.line) {
            Ok(0) => {
                self.exhausted = true;
                false
            }
            Ok(_) => true,
            Err(e) => {
                warn!("failed to read input: {}", e);
                self.exhausted = true;
                false
            }
        }
    }
}

impl<R: BufRead> TokenSource for Lexer<R> {
    fn next_token(&mut self) -> Token {
        loop {
            let lexed = match lex().parse(&self.line[self.pos..]) {
                Ok((token, rest)) => Ok((token, self.line.len() - rest.len())),
                Err(e) => Err(e.to_string()),
            };

            match lexed {
                Ok((Some(token), pos)) => {
                    self.pos = pos;
                    trace!("token {:?}", token);
                    return token;
                }
                Ok((None, _)) => {
                    if !self.fill_line() {
                        return Token::Eof;
                    }
                }
                Err(e) => {
                    warn!("discarding unlexable input {:?}: {}", &self.line[self.pos..], e);
                    self.pos = self.line.len();
                }
            }
        }
    }
}
