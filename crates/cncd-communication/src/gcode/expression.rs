//! Inline expression evaluation
//!
//! A small, pure arithmetic evaluator for the `%name = expr` assignments and
//! `[expr]` substitutions supported inside command lines. Identifiers
//! resolve against an [`ExpressionContext`](super::ExpressionContext)
//! snapshot; there is no I/O and no side effect beyond the returned value.

use super::ExpressionContext;

/// A value an expression can produce or a context variable can hold
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum CtxValue {
    /// Numeric value
    Number(f64),
    /// String value (modal words, program name, ...)
    Text(String),
}

impl CtxValue {
    /// Render the value the way it appears inside a substituted line
    pub fn render(&self) -> String {
        match self {
            CtxValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{}", n)
                }
            }
            CtxValue::Text(s) => s.clone(),
        }
    }
}

impl From<f64> for CtxValue {
    fn from(n: f64) -> Self {
        CtxValue::Number(n)
    }
}

impl From<&str> for CtxValue {
    fn from(s: &str) -> Self {
        CtxValue::Text(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Text(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(expr: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => text.push(ch),
                        None => return Err("Unterminated string".into()),
                    }
                }
                tokens.push(Token::Text(text));
            }
            '0'..='9' | '.' => {
                let mut num = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_digit() || ch == '.' {
                        num.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = num
                    .parse::<f64>()
                    .map_err(|_| format!("Bad number: {}", num))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(format!("Unexpected character: {}", other)),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    ctx: &'a ExpressionContext,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expr(&mut self) -> Result<CtxValue, String> {
        let mut left = self.term()?;
        while let Some(op) = self.peek().cloned() {
            match op {
                Token::Plus | Token::Minus => {
                    self.next();
                    let right = self.term()?;
                    left = apply(&op, left, right)?;
                }
                _ => break,
            }
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<CtxValue, String> {
        let mut left = self.factor()?;
        while let Some(op) = self.peek().cloned() {
            match op {
                Token::Star | Token::Slash => {
                    self.next();
                    let right = self.factor()?;
                    left = apply(&op, left, right)?;
                }
                _ => break,
            }
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<CtxValue, String> {
        match self.next() {
            Some(Token::Number(n)) => Ok(CtxValue::Number(n)),
            Some(Token::Text(s)) => Ok(CtxValue::Text(s)),
            Some(Token::Ident(name)) => self
                .ctx
                .get(&name)
                .cloned()
                .ok_or_else(|| format!("Unknown identifier: {}", name)),
            Some(Token::Minus) => {
                let value = self.factor()?;
                match value {
                    CtxValue::Number(n) => Ok(CtxValue::Number(-n)),
                    CtxValue::Text(_) => Err("Cannot negate a string".into()),
                }
            }
            Some(Token::LParen) => {
                let value = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err("Expected closing parenthesis".into()),
                }
            }
            other => Err(format!("Unexpected token: {:?}", other)),
        }
    }
}

fn apply(op: &Token, left: CtxValue, right: CtxValue) -> Result<CtxValue, String> {
    match (left, right) {
        (CtxValue::Number(a), CtxValue::Number(b)) => {
            let result = match op {
                Token::Plus => a + b,
                Token::Minus => a - b,
                Token::Star => a * b,
                Token::Slash => a / b,
                _ => return Err("Bad operator".into()),
            };
            Ok(CtxValue::Number(result))
        }
        (CtxValue::Text(a), CtxValue::Text(b)) if matches!(op, Token::Plus) => {
            Ok(CtxValue::Text(format!("{}{}", a, b)))
        }
        _ => Err("Type mismatch in expression".into()),
    }
}

/// Evaluate an expression against a context snapshot
pub fn evaluate(expr: &str, ctx: &ExpressionContext) -> Result<CtxValue, String> {
    let tokens = tokenize(expr)?;
    if tokens.is_empty() {
        return Err("Empty expression".into());
    }
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        ctx,
    };
    let value = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err("Trailing tokens in expression".into());
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExpressionContext {
        let mut ctx = ExpressionContext::new();
        ctx.set("xmin", CtxValue::Number(10.0));
        ctx.set("posz", CtxValue::Number(-1.5));
        ctx.set("tool", CtxValue::Text("T1".into()));
        ctx
    }

    #[test]
    fn arithmetic() {
        let ctx = ctx();
        assert_eq!(
            evaluate("1 + 2 * 3", &ctx).unwrap(),
            CtxValue::Number(7.0)
        );
        assert_eq!(
            evaluate("(1 + 2) * 3", &ctx).unwrap(),
            CtxValue::Number(9.0)
        );
        assert_eq!(evaluate("-posz", &ctx).unwrap(), CtxValue::Number(1.5));
    }

    #[test]
    fn identifiers_resolve_from_context() {
        let ctx = ctx();
        assert_eq!(
            evaluate("xmin + 5", &ctx).unwrap(),
            CtxValue::Number(15.0)
        );
        assert!(evaluate("nope", &ctx).is_err());
    }

    #[test]
    fn string_concat() {
        let ctx = ctx();
        assert_eq!(
            evaluate("tool + '!'", &ctx).unwrap(),
            CtxValue::Text("T1!".into())
        );
    }

    #[test]
    fn render_trims_integer_values() {
        assert_eq!(CtxValue::Number(3.0).render(), "3");
        assert_eq!(CtxValue::Number(3.25).render(), "3.25");
    }
}
