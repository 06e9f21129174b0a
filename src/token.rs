use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Def,
    Extern,
    If,
    Then,
    Else,
    For,
    In,
    Ident(String),
    Number(f64),
    Kwd(char),
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Token::Def => write!(f, "'def'"),
            Token::Extern => write!(f, "'extern'"),
            Token::If => write!(f, "'if'"),
            Token::Then => write!(f, "'then'"),
            Token::Else => write!(f, "'else'"),
            Token::For => write!(f, "'for'"),
            Token::In => write!(f, "'in'"),
            Token::Ident(id) => write!(f, "identifier '{}'", id),
            Token::Number(n) => write!(f, "number {}", n),
            Token::Kwd(c) => write!(f, "'{}'", c),
            Token::Eof => write!(f, "end of input"),
        }
    }
}

/// Where the parser pulls its tokens from. Once exhausted a source keeps
/// returning `Token::Eof`.
pub(crate) trait TokenSource {
    fn next_token(&mut self) -> Token;
}

impl TokenSource for std::vec::IntoIter<Token> {
    fn next_token(&mut self) -> Token {
        self.next().unwrap_or(Token::Eof)
    }
}
