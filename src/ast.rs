use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Number(f64),
    Variable(String),
    Binary(char, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    If {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    For {
        var: String,
        start: Box<Expr>,
        end: Box<Expr>,
        step: Option<Box<Expr>>,
        body: Box<Expr>,
    },
}

/// A callable signature: the function name and its parameter names.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Prototype {
    pub name: String,
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Function {
    pub proto: Prototype,
    pub body: Expr,
}

/// S-expression rendering, mostly for diagnostics and tests.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Expr::Number(n) => write!(f, "{}", n),
            Expr::Variable(name) => write!(f, "{}", name),
            Expr::Binary(op, lhs, rhs) => write!(f, "({} {} {})", op, lhs, rhs),
            Expr::Call(callee, args) => {
                write!(f, "(call {}", callee)?;
                for arg in args {
                    write!(f, " {}", arg)?;
                }
                write!(f, ")")
            }
            Expr::If {
                cond,
                then,
                otherwise,
            } => write!(f, "(if {} {} {})", cond, then, otherwise),
            Expr::For {
                var,
                start,
                end,
                step,
                body,
            } => {
                write!(f, "(for {} {} {}", var, start, end)?;
                if let Some(step) = step {
                    write!(f, " {}", step)?;
                }
                write!(f, " {})", body)
            }
        }
    }
}

impl fmt::Display for Prototype {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}({})", self.name, self.params.join(" "))
    }
}
