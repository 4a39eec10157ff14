//! Constraint formulas.
//!
//! A formula is an arithmetic expression over parameter references written
//! `@n` (n a positive integer), numeric literals, the operators
//! `+ - * / ^`, parentheses, and the functions `sin cos tan asin acos atan
//! exp log sqrt abs`. Examples: `"@1"`, `"0.5+@1"`, `"1.0-@3"`,
//! `"sqrt(@2)*@4"`.

use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FormulaError {
    #[error("Formula is empty")]
    Empty,
    #[error("Unexpected character '{ch}' at position {pos}")]
    UnexpectedChar { pos: usize, ch: char },
    #[error("Unexpected {found} at position {pos}")]
    UnexpectedToken { pos: usize, found: String },
    #[error("Unexpected end of formula")]
    UnexpectedEnd,
    #[error("Invalid number '{0}'")]
    InvalidNumber(String),
    #[error("Invalid parameter reference '@{0}' (expected a positive integer)")]
    InvalidParameter(String),
    #[error("Unknown function '{0}'")]
    UnknownFunction(String),
    #[error("Formula references no parameter")]
    NoParameter,
    #[error("Parameter @{0} is not defined")]
    UndefinedParameter(usize),
    #[error("Formula '{0}' evaluated to a non-finite value")]
    NotFinite(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Exp,
    Log,
    Sqrt,
    Abs,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "tan" => Function::Tan,
            "asin" => Function::Asin,
            "acos" => Function::Acos,
            "atan" => Function::Atan,
            "exp" => Function::Exp,
            "log" => Function::Log,
            "sqrt" => Function::Sqrt,
            "abs" => Function::Abs,
            _ => return None,
        })
    }

    fn apply(self, x: f64) -> f64 {
        match self {
            Function::Sin => x.sin(),
            Function::Cos => x.cos(),
            Function::Tan => x.tan(),
            Function::Asin => x.asin(),
            Function::Acos => x.acos(),
            Function::Atan => x.atan(),
            Function::Exp => x.exp(),
            Function::Log => x.ln(),
            Function::Sqrt => x.sqrt(),
            Function::Abs => x.abs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Parameter(usize),
    Negate(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Box<Expr>),
}

impl Expr {
    fn evaluate(&self, lookup: &dyn Fn(usize) -> Option<f64>) -> Result<f64, FormulaError> {
        Ok(match self {
            Expr::Number(v) => *v,
            Expr::Parameter(n) => lookup(*n).ok_or(FormulaError::UndefinedParameter(*n))?,
            Expr::Negate(inner) => -inner.evaluate(lookup)?,
            Expr::Binary(op, lhs, rhs) => {
                let (a, b) = (lhs.evaluate(lookup)?, rhs.evaluate(lookup)?);
                match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Pow => a.powf(b),
                }
            }
            Expr::Call(func, arg) => func.apply(arg.evaluate(lookup)?),
        })
    }

    fn collect_parameters(&self, out: &mut BTreeSet<usize>) {
        match self {
            Expr::Number(_) => {}
            Expr::Parameter(n) => {
                out.insert(*n);
            }
            Expr::Negate(inner) | Expr::Call(_, inner) => inner.collect_parameters(out),
            Expr::Binary(_, lhs, rhs) => {
                lhs.collect_parameters(out);
                rhs.collect_parameters(out);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Parameter(usize),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(v) => write!(f, "number {}", v),
            Token::Parameter(n) => write!(f, "parameter @{}", n),
            Token::Ident(name) => write!(f, "identifier '{}'", name),
            Token::Plus => f.write_str("'+'"),
            Token::Minus => f.write_str("'-'"),
            Token::Star => f.write_str("'*'"),
            Token::Slash => f.write_str("'/'"),
            Token::Caret => f.write_str("'^'"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, FormulaError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let ch = chars[pos];
        let start = pos;
        let token = match ch {
            c if c.is_whitespace() => {
                pos += 1;
                continue;
            }
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '^' => Token::Caret,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '@' => {
                pos += 1;
                let digits: String = chars[pos..]
                    .iter()
                    .take_while(|c| c.is_ascii_alphanumeric())
                    .collect();
                pos += digits.chars().count();
                let slot = digits
                    .parse::<usize>()
                    .ok()
                    .filter(|&n| n >= 1)
                    .ok_or(FormulaError::InvalidParameter(digits))?;
                tokens.push((start, Token::Parameter(slot)));
                continue;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut end = pos;
                while end < chars.len() && (chars[end].is_ascii_digit() || chars[end] == '.') {
                    end += 1;
                }
                if end < chars.len() && matches!(chars[end], 'e' | 'E') {
                    let mut exp_end = end + 1;
                    if exp_end < chars.len() && matches!(chars[exp_end], '+' | '-') {
                        exp_end += 1;
                    }
                    if exp_end < chars.len() && chars[exp_end].is_ascii_digit() {
                        while exp_end < chars.len() && chars[exp_end].is_ascii_digit() {
                            exp_end += 1;
                        }
                        end = exp_end;
                    }
                }
                let text: String = chars[pos..end].iter().collect();
                pos = end;
                let value = text
                    .parse::<f64>()
                    .map_err(|_| FormulaError::InvalidNumber(text))?;
                tokens.push((start, Token::Number(value)));
                continue;
            }
            c if c.is_ascii_alphabetic() => {
                let name: String = chars[pos..]
                    .iter()
                    .take_while(|c| c.is_ascii_alphanumeric() || **c == '_')
                    .collect();
                pos += name.chars().count();
                tokens.push((start, Token::Ident(name)));
                continue;
            }
            other => return Err(FormulaError::UnexpectedChar { pos, ch: other }),
        };
        tokens.push((start, token));
        pos += 1;
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    cursor: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.cursor).map(|(_, t)| t)
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let item = self.tokens.get(self.cursor).cloned();
        self.cursor += 1;
        item
    }

    fn expect(&mut self, expected: Token) -> Result<(), FormulaError> {
        match self.next() {
            Some((_, token)) if token == expected => Ok(()),
            Some((pos, token)) => Err(FormulaError::UnexpectedToken {
                pos,
                found: token.to_string(),
            }),
            None => Err(FormulaError::UnexpectedEnd),
        }
    }

    // expr := term (('+' | '-') term)*
    fn expression(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.term()?;
        while let Some(op) = match self.peek() {
            Some(Token::Plus) => Some(BinaryOp::Add),
            Some(Token::Minus) => Some(BinaryOp::Sub),
            _ => None,
        } {
            self.cursor += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    // term := unary (('*' | '/') unary)*
    fn term(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.unary()?;
        while let Some(op) = match self.peek() {
            Some(Token::Star) => Some(BinaryOp::Mul),
            Some(Token::Slash) => Some(BinaryOp::Div),
            _ => None,
        } {
            self.cursor += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    // unary := ('-' | '+') unary | power
    fn unary(&mut self) -> Result<Expr, FormulaError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.cursor += 1;
                Ok(Expr::Negate(Box::new(self.unary()?)))
            }
            Some(Token::Plus) => {
                self.cursor += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    // power := primary ('^' unary)?   (right associative)
    fn power(&mut self) -> Result<Expr, FormulaError> {
        let base = self.primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.cursor += 1;
            let exponent = self.unary()?;
            return Ok(Expr::Binary(
                BinaryOp::Pow,
                Box::new(base),
                Box::new(exponent),
            ));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr, FormulaError> {
        match self.next() {
            Some((_, Token::Number(v))) => Ok(Expr::Number(v)),
            Some((_, Token::Parameter(n))) => Ok(Expr::Parameter(n)),
            Some((_, Token::LParen)) => {
                let inner = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some((_, Token::Ident(name))) => {
                let func =
                    Function::lookup(&name).ok_or(FormulaError::UnknownFunction(name))?;
                self.expect(Token::LParen)?;
                let arg = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(Expr::Call(func, Box::new(arg)))
            }
            Some((pos, token)) => Err(FormulaError::UnexpectedToken {
                pos,
                found: token.to_string(),
            }),
            None => Err(FormulaError::UnexpectedEnd),
        }
    }
}

/// A parsed constraint formula. Keeps its source text for reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl Formula {
    /// Parses `source`. Fails on syntax errors and on formulas that do not
    /// reference any parameter.
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        let formula = Self::parse_expression(source)?;
        if formula.parameters().is_empty() {
            return Err(FormulaError::NoParameter);
        }
        Ok(formula)
    }

    /// Parses `source` without requiring a parameter reference.
    pub fn parse_expression(source: &str) -> Result<Self, FormulaError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(FormulaError::Empty);
        }
        let mut parser = Parser { tokens, cursor: 0 };
        let expr = parser.expression()?;
        if let Some((pos, token)) = parser.next() {
            return Err(FormulaError::UnexpectedToken {
                pos,
                found: token.to_string(),
            });
        }
        Ok(Self {
            source: source.trim().to_string(),
            expr,
        })
    }

    /// The formula `@slot`.
    pub fn parameter(slot: usize) -> Self {
        Self {
            source: format!("@{}", slot),
            expr: Expr::Parameter(slot),
        }
    }

    /// The constant `value`.
    pub fn constant(value: f64) -> Self {
        Self {
            source: format!("{}", value),
            expr: Expr::Number(value),
        }
    }

    /// This formula squared.
    pub fn squared(&self) -> Self {
        Self {
            source: format!("({})^2", self.source),
            expr: Expr::Binary(
                BinaryOp::Pow,
                Box::new(self.expr.clone()),
                Box::new(Expr::Number(2.0)),
            ),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Parameter slots referenced by the formula, ascending.
    pub fn parameters(&self) -> BTreeSet<usize> {
        let mut out = BTreeSet::new();
        self.expr.collect_parameters(&mut out);
        out
    }

    /// Evaluates the formula with `lookup` supplying parameter values.
    pub fn evaluate(&self, lookup: impl Fn(usize) -> Option<f64>) -> Result<f64, FormulaError> {
        let value = self.expr.evaluate(&lookup)?;
        if !value.is_finite() {
            return Err(FormulaError::NotFinite(self.source.clone()));
        }
        Ok(value)
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f64 = 1e-12;

    fn eval(source: &str, params: &[(usize, f64)]) -> f64 {
        Formula::parse(source)
            .unwrap()
            .evaluate(|n| params.iter().find(|(k, _)| *k == n).map(|(_, v)| *v))
            .unwrap()
    }

    #[test]
    fn evaluates_simple_offsets() {
        assert!((eval("0.5+@1", &[(1, 0.25)]) - 0.75).abs() < TOLERANCE);
        assert!((eval("1.0 - @3", &[(3, 0.2)]) - 0.8).abs() < TOLERANCE);
    }

    #[test]
    fn respects_precedence_and_associativity() {
        assert!((eval("@1 + 2*3", &[(1, 1.0)]) - 7.0).abs() < TOLERANCE);
        assert!((eval("(@1 + 2)*3", &[(1, 1.0)]) - 9.0).abs() < TOLERANCE);
        assert!((eval("@1 - 2 - 3", &[(1, 10.0)]) - 5.0).abs() < TOLERANCE);
        assert!((eval("2^3^@1", &[(1, 2.0)]) - 512.0).abs() < TOLERANCE);
        assert!((eval("-@1^2", &[(1, 3.0)]) + 9.0).abs() < TOLERANCE);
    }

    #[test]
    fn supports_functions_and_exponents() {
        assert!((eval("sqrt(@2)", &[(2, 16.0)]) - 4.0).abs() < TOLERANCE);
        assert!((eval("1e-3*@1", &[(1, 2.0)]) - 0.002).abs() < TOLERANCE);
        assert!((eval("cos(@1)", &[(1, 0.0)]) - 1.0).abs() < TOLERANCE);
    }

    #[test]
    fn reports_referenced_parameters() {
        let formula = Formula::parse("@3*@1 + sin(@3)").unwrap();
        assert_eq!(formula.parameters().into_iter().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn rejects_malformed_formulas() {
        assert_eq!(Formula::parse("   "), Err(FormulaError::Empty));
        assert_eq!(Formula::parse("0.5"), Err(FormulaError::NoParameter));
        assert_eq!(
            Formula::parse("@0"),
            Err(FormulaError::InvalidParameter("0".into()))
        );
        assert_eq!(
            Formula::parse("@x"),
            Err(FormulaError::InvalidParameter("x".into()))
        );
        assert_eq!(Formula::parse("@1 +"), Err(FormulaError::UnexpectedEnd));
        assert!(matches!(
            Formula::parse("@1 $ 2"),
            Err(FormulaError::UnexpectedChar { ch: '$', .. })
        ));
        assert!(matches!(
            Formula::parse("@1 @2"),
            Err(FormulaError::UnexpectedToken { .. })
        ));
        assert_eq!(
            Formula::parse("foo(@1)"),
            Err(FormulaError::UnknownFunction("foo".into()))
        );
    }

    #[test]
    fn evaluation_fails_for_missing_or_non_finite_values() {
        let formula = Formula::parse("1/@1").unwrap();
        assert_eq!(
            formula.evaluate(|_| None),
            Err(FormulaError::UndefinedParameter(1))
        );
        assert!(matches!(
            formula.evaluate(|_| Some(0.0)),
            Err(FormulaError::NotFinite(_))
        ));
    }

    #[test]
    fn derived_formulas_render_their_source() {
        assert_eq!(Formula::parameter(4).to_string(), "@4");
        assert_eq!(Formula::parameter(4).squared().to_string(), "(@4)^2");
        let squared = Formula::parameter(2).squared();
        assert!((squared.evaluate(|_| Some(3.0)).unwrap() - 9.0).abs() < TOLERANCE);
    }
}
