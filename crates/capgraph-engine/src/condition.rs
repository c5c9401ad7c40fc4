//! Condition expression language: parser and evaluator.
//!
//! Grammar:
//! ```text
//! expr  ::= or
//! or    ::= and ( ("or" | "||") and )*
//! and   ::= not ( ("and" | "&&") not )*
//! not   ::= ("not" | "!") not | cmp
//! cmp   ::= sum ( ("=" | "==" | "!=" | "<" | "<=" | ">" | ">=" | "in" | "not in") sum )?
//! sum   ::= term ( ("+" | "-") term )*
//! term  ::= unary ( ("*" | "/" | "%") unary )*
//! unary ::= "-" unary | atom
//! atom  ::= number | string | "true" | "false" | "null" | path | list | "(" expr ")"
//! path  ::= ident ( "." segment )*
//! list  ::= "[" ( expr ( "," expr )* )? "]"
//! ```
//!
//! Expressions are evaluated against a snapshot of the execution variables.
//! Nothing outside this grammar is ever executed.

use std::collections::HashMap;

use capgraph_types::{CapgraphError, Result};
use serde_json::{Number, Value};

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Dotted variable reference; segments index objects by key and arrays by position.
    Path(Vec<String>),
    List(Vec<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Path(Vec<String>),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    In,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn tokenize(input: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        // Two-character operators first.
        let next = chars.get(i + 1).copied();
        let two = match (c, next) {
            ('=', Some('=')) => Some(Token::Eq),
            ('!', Some('=')) => Some(Token::NotEq),
            ('<', Some('=')) => Some(Token::Le),
            ('>', Some('=')) => Some(Token::Ge),
            ('&', Some('&')) => Some(Token::And),
            ('|', Some('|')) => Some(Token::Or),
            _ => None,
        };
        if let Some(tok) = two {
            tokens.push(tok);
            i += 2;
            continue;
        }

        let single = match c {
            '=' => Some(Token::Eq),
            '!' => Some(Token::Not),
            '<' => Some(Token::Lt),
            '>' => Some(Token::Gt),
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            '%' => Some(Token::Percent),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            ',' => Some(Token::Comma),
            _ => None,
        };
        if let Some(tok) = single {
            tokens.push(tok);
            i += 1;
            continue;
        }

        if c == '"' || c == '\'' {
            let quote = c;
            let mut text = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err("unterminated string literal".into()),
                    Some('\\') => {
                        match chars.get(i + 1) {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some(&other) => text.push(other),
                            None => return Err("unterminated string literal".into()),
                        }
                        i += 2;
                    }
                    Some(&ch) if ch == quote => {
                        i += 1;
                        break;
                    }
                    Some(&ch) => {
                        text.push(ch);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(text));
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && next.is_some_and(|n| n.is_ascii_digit())) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let literal: String = chars[start..i].iter().collect();
            let value = literal
                .parse::<f64>()
                .map_err(|_| format!("invalid number '{literal}'"))?;
            tokens.push(Token::Number(value));
            continue;
        }

        if is_ident_start(c) {
            let mut segments = Vec::new();
            loop {
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                if start == i {
                    return Err("expected identifier after '.'".into());
                }
                segments.push(chars[start..i].iter().collect::<String>());
                if chars.get(i) == Some(&'.') {
                    i += 1;
                } else {
                    break;
                }
            }

            let keyword = if segments.len() == 1 {
                match segments[0].as_str() {
                    "and" => Some(Token::And),
                    "or" => Some(Token::Or),
                    "not" => Some(Token::Not),
                    "in" => Some(Token::In),
                    "true" => Some(Token::True),
                    "false" => Some(Token::False),
                    "null" => Some(Token::Null),
                    _ => None,
                }
            } else {
                None
            };
            tokens.push(keyword.unwrap_or(Token::Path(segments)));
            continue;
        }

        return Err(format!("unexpected character '{c}'"));
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Deepest expression tree the parser will build.
const MAX_NESTING: usize = 256;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token, what: &str) -> std::result::Result<(), String> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(format!("expected {what}"))
        }
    }

    /// Every level of the tree under construction counts, including each link
    /// of a left-associative chain.
    fn nest(&mut self) -> std::result::Result<(), String> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err("expression nested too deeply".into());
        }
        Ok(())
    }

    fn or(&mut self) -> std::result::Result<Expr, String> {
        let base = self.depth;
        let mut lhs = self.and()?;
        while self.eat(&Token::Or) {
            self.nest()?;
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        self.depth = base;
        Ok(lhs)
    }

    fn and(&mut self) -> std::result::Result<Expr, String> {
        let base = self.depth;
        let mut lhs = self.not()?;
        while self.eat(&Token::And) {
            self.nest()?;
            let rhs = self.not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        self.depth = base;
        Ok(lhs)
    }

    fn not(&mut self) -> std::result::Result<Expr, String> {
        if self.eat(&Token::Not) {
            self.nest()?;
            let inner = self.not()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.cmp()
    }

    fn cmp(&mut self) -> std::result::Result<Expr, String> {
        let lhs = self.sum()?;
        let op = match (self.peek(), self.peek_at(1)) {
            (Some(Token::Eq), _) => BinaryOp::Eq,
            (Some(Token::NotEq), _) => BinaryOp::NotEq,
            (Some(Token::Lt), _) => BinaryOp::Lt,
            (Some(Token::Le), _) => BinaryOp::Le,
            (Some(Token::Gt), _) => BinaryOp::Gt,
            (Some(Token::Ge), _) => BinaryOp::Ge,
            (Some(Token::In), _) => BinaryOp::In,
            (Some(Token::Not), Some(Token::In)) => {
                self.pos += 1;
                BinaryOp::NotIn
            }
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.sum()?;
        Ok(Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn sum(&mut self) -> std::result::Result<Expr, String> {
        let base = self.depth;
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => {
                    self.depth = base;
                    return Ok(lhs);
                }
            };
            self.pos += 1;
            self.nest()?;
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn term(&mut self) -> std::result::Result<Expr, String> {
        let base = self.depth;
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => {
                    self.depth = base;
                    return Ok(lhs);
                }
            };
            self.pos += 1;
            self.nest()?;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn unary(&mut self) -> std::result::Result<Expr, String> {
        if self.eat(&Token::Minus) {
            self.nest()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.atom()
    }

    fn atom(&mut self) -> std::result::Result<Expr, String> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number_value(n)?)),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Path(segments)) => Ok(Expr::Path(segments)),
            Some(Token::LParen) => {
                self.nest()?;
                let inner = self.or()?;
                self.expect(&Token::RParen, "')'")?;
                self.depth -= 1;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                self.nest()?;
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.or()?);
                        if self.eat(&Token::Comma) {
                            continue;
                        }
                        self.expect(&Token::RBracket, "']' or ','")?;
                        break;
                    }
                }
                self.depth -= 1;
                Ok(Expr::List(items))
            }
            Some(other) => Err(format!("unexpected token {other:?}")),
            None => Err("unexpected end of expression".into()),
        }
    }
}

/// Parse an expression into an [`Expr`].
pub fn parse_condition(input: &str) -> Result<Expr> {
    let fail = |message: String| CapgraphError::ConditionEvaluation {
        expression: input.to_string(),
        message,
    };

    let tokens = tokenize(input).map_err(fail)?;
    if tokens.is_empty() {
        return Err(fail("empty expression".into()));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.or().map_err(fail)?;
    if let Some(tok) = parser.peek() {
        return Err(fail(format!("unexpected trailing token {tok:?}")));
    }
    Ok(expr)
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Truthiness of a non-boolean value: null, false, 0, "", [] and {} are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn number_value(n: f64) -> std::result::Result<Value, String> {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        return Ok(Value::Number(Number::from(n as i64)));
    }
    Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| format!("arithmetic produced a non-finite number ({n})"))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Equality that treats `1` and `1.0` as the same number.
fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| loose_eq(x, y))
        }
        _ => a == b,
    }
}

impl Expr {
    /// Evaluate to a JSON value.
    pub fn evaluate(&self, vars: &HashMap<String, Value>) -> std::result::Result<Value, String> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Path(segments) => resolve_path(segments, vars),
            Expr::List(items) => items
                .iter()
                .map(|item| item.evaluate(vars))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Value::Array),
            Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&inner.evaluate(vars)?))),
            Expr::Neg(inner) => match inner.evaluate(vars)? {
                Value::Number(n) => number_value(-n.as_f64().unwrap_or(0.0)),
                other => Err(format!("cannot negate {}", type_name(&other))),
            },
            Expr::And(lhs, rhs) => {
                if !is_truthy(&lhs.evaluate(vars)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(is_truthy(&rhs.evaluate(vars)?)))
            }
            Expr::Or(lhs, rhs) => {
                if is_truthy(&lhs.evaluate(vars)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(is_truthy(&rhs.evaluate(vars)?)))
            }
            Expr::Binary { op, lhs, rhs } => {
                let l = lhs.evaluate(vars)?;
                let r = rhs.evaluate(vars)?;
                apply_binary(*op, &l, &r)
            }
        }
    }
}

fn resolve_path(
    segments: &[String],
    vars: &HashMap<String, Value>,
) -> std::result::Result<Value, String> {
    let (head, rest) = segments
        .split_first()
        .ok_or_else(|| "empty variable reference".to_string())?;
    let mut current = vars
        .get(head)
        .ok_or_else(|| format!("undefined variable '{head}'"))?;
    for segment in rest {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        current = next.ok_or_else(|| format!("undefined variable '{}'", segments.join(".")))?;
    }
    Ok(current.clone())
}

fn numbers(op: BinaryOp, l: &Value, r: &Value) -> std::result::Result<(f64, f64), String> {
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) if l.is_number() && r.is_number() => Ok((a, b)),
        _ => Err(format!(
            "operator {op:?} is not defined for {} and {}",
            type_name(l),
            type_name(r)
        )),
    }
}

fn apply_binary(op: BinaryOp, l: &Value, r: &Value) -> std::result::Result<Value, String> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(l, r))),
        BinaryOp::NotEq => Ok(Value::Bool(!loose_eq(l, r))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (l, r) {
                (Value::String(a), Value::String(b)) => a.cmp(b),
                _ => {
                    let (a, b) = numbers(op, l, r)?;
                    a.partial_cmp(&b)
                        .ok_or_else(|| "cannot compare NaN".to_string())?
                }
            };
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        BinaryOp::In => membership(l, r).map(Value::Bool),
        BinaryOp::NotIn => membership(l, r).map(|found| Value::Bool(!found)),
        BinaryOp::Add => match (l, r) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            _ => {
                let (a, b) = numbers(op, l, r)?;
                number_value(a + b)
            }
        },
        BinaryOp::Sub => {
            let (a, b) = numbers(op, l, r)?;
            number_value(a - b)
        }
        BinaryOp::Mul => {
            let (a, b) = numbers(op, l, r)?;
            number_value(a * b)
        }
        BinaryOp::Div | BinaryOp::Rem => {
            let (a, b) = numbers(op, l, r)?;
            if b == 0.0 {
                return Err("division by zero".into());
            }
            number_value(if op == BinaryOp::Div { a / b } else { a % b })
        }
    }
}

fn membership(needle: &Value, haystack: &Value) -> std::result::Result<bool, String> {
    match (needle, haystack) {
        (_, Value::Array(items)) => Ok(items.iter().any(|item| loose_eq(item, needle))),
        (Value::String(n), Value::String(h)) => Ok(h.contains(n.as_str())),
        (Value::String(key), Value::Object(map)) => Ok(map.contains_key(key)),
        _ => Err(format!(
            "membership test of {} in {} is not supported",
            type_name(needle),
            type_name(haystack)
        )),
    }
}

/// Parse and evaluate `expression`, converting the result to a boolean.
pub fn try_evaluate(expression: &str, vars: &HashMap<String, Value>) -> Result<bool> {
    let expr = parse_condition(expression)?;
    let value = expr
        .evaluate(vars)
        .map_err(|message| CapgraphError::ConditionEvaluation {
            expression: expression.to_string(),
            message,
        })?;
    Ok(is_truthy(&value))
}

/// Evaluate `expression` and never fail: any parse or evaluation error yields
/// `false` and is logged.
pub fn evaluate(expression: &str, vars: &HashMap<String, Value>) -> bool {
    match try_evaluate(expression, vars) {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!(expression = %expression, error = %e, "Condition evaluated to false");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn numeric_comparisons() {
        let v = vars(&[("x", json!(5))]);
        assert!(evaluate("x > 0", &v));
        assert!(evaluate("x >= 5", &v));
        assert!(!evaluate("x < 5", &v));
        assert!(evaluate("x <= 5.0", &v));
        assert!(evaluate("x == 5", &v));
        assert!(evaluate("x = 5", &v));
        assert!(evaluate("x != 4", &v));
    }

    #[test]
    fn integer_and_float_compare_equal() {
        let v = vars(&[("ratio", json!(1.0))]);
        assert!(evaluate("ratio == 1", &v));
    }

    #[test]
    fn string_equality_and_ordering() {
        let v = vars(&[("status", json!("done"))]);
        assert!(evaluate("status == 'done'", &v));
        assert!(evaluate("status != \"pending\"", &v));
        assert!(evaluate("status < 'zzz'", &v));
    }

    #[test]
    fn boolean_combinators_and_precedence() {
        let v = vars(&[("a", json!(true)), ("b", json!(false)), ("n", json!(3))]);
        assert!(evaluate("a and not b", &v));
        assert!(evaluate("a && !b", &v));
        assert!(evaluate("b or n > 2", &v));
        assert!(evaluate("b || a", &v));
        // and binds tighter than or
        assert!(evaluate("a or b and b", &v));
        assert!(!evaluate("(a or b) and b", &v));
    }

    #[test]
    fn short_circuit_skips_undefined_rhs() {
        let v = vars(&[("ready", json!(false))]);
        assert!(!evaluate("ready and missing > 1", &v));
        assert!(try_evaluate("true or missing", &v).unwrap());
    }

    #[test]
    fn membership_in_list_string_and_object() {
        let v = vars(&[
            ("tag", json!("rust")),
            ("tags", json!(["go", "rust"])),
            ("title", json!("learning rust")),
            ("config", json!({"depth": 2})),
        ]);
        assert!(evaluate("tag in tags", &v));
        assert!(evaluate("'rust' in title", &v));
        assert!(evaluate("'depth' in config", &v));
        assert!(evaluate("'java' not in tags", &v));
        assert!(evaluate("tag in ['rust', 'c']", &v));
        assert!(evaluate("2 in [1, 2.0, 3]", &v));
    }

    #[test]
    fn not_binds_looser_than_membership() {
        let v = vars(&[("tags", json!(["a"]))]);
        assert!(evaluate("not 'b' in tags", &v));
    }

    #[test]
    fn arithmetic() {
        let v = vars(&[("count", json!(7)), ("iteration", json!(2))]);
        assert!(evaluate("count % 2 == 1", &v));
        assert!(evaluate("iteration + 1 == 3", &v));
        assert!(evaluate("count * 2 - 4 == 10", &v));
        assert!(evaluate("count / 2 == 3.5", &v));
        assert!(evaluate("-count < 0", &v));
        assert!(evaluate("'a' + 'b' == 'ab'", &v));
    }

    #[test]
    fn dotted_paths_resolve_objects_and_arrays() {
        let v = vars(&[("result", json!({"score": 0.9, "items": [{"ok": true}]}))]);
        assert!(evaluate("result.score > 0.5", &v));
        assert!(evaluate("result.items.0.ok", &v));
        assert!(!evaluate("result.items.5.ok", &v));
    }

    #[test]
    fn truthiness_of_plain_values() {
        let v = vars(&[
            ("empty", json!("")),
            ("list", json!([])),
            ("obj", json!({})),
            ("zero", json!(0)),
            ("nothing", Value::Null),
            ("word", json!("x")),
        ]);
        for name in ["empty", "list", "obj", "zero", "nothing"] {
            assert!(!evaluate(name, &v), "{name} should be falsy");
        }
        assert!(evaluate("word", &v));
    }

    #[test]
    fn undefined_variable_is_false_and_reported() {
        let v = HashMap::new();
        assert!(!evaluate("missing > 1", &v));
        let err = try_evaluate("missing > 1", &v).unwrap_err();
        assert!(matches!(err, CapgraphError::ConditionEvaluation { .. }));
        assert!(err.to_string().contains("undefined variable 'missing'"));
    }

    #[test]
    fn malformed_expressions_are_false() {
        let v = vars(&[("x", json!(1))]);
        for bad in ["x >", "(x > 1", "x > > 1", "", "x @ 1", "'open", "[1, 2"] {
            assert!(!evaluate(bad, &v), "{bad:?} should evaluate to false");
            assert!(parse_condition(bad).is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn type_errors_and_division_by_zero_are_false() {
        let v = vars(&[("x", json!(1)), ("s", json!("a"))]);
        assert!(!evaluate("x / 0 == 1", &v));
        assert!(!evaluate("x % 0 == 0", &v));
        assert!(!evaluate("s - 1 == 0", &v));
        assert!(!evaluate("s > 1", &v));
        assert!(!evaluate("1 in 2", &v));
    }

    #[test]
    fn host_code_is_not_executed() {
        let v = HashMap::new();
        assert!(parse_condition("process.exit(1)").is_err());
        assert!(parse_condition("require('fs')").is_err());
        assert!(!evaluate("constructor.constructor('x')()", &v));
    }

    #[test]
    fn parse_builds_expected_ast() {
        let expr = parse_condition("a.b >= 2").unwrap();
        assert_eq!(
            expr,
            Expr::Binary {
                op: BinaryOp::Ge,
                lhs: Box::new(Expr::Path(vec!["a".into(), "b".into()])),
                rhs: Box::new(Expr::Literal(json!(2))),
            }
        );
    }

    #[test]
    fn deep_nesting_is_rejected_without_overflow() {
        let v = vars(&[("x", json!(1))]);
        let depth = 100_000;
        let parens = format!("{}x{}", "(".repeat(depth), ")".repeat(depth));
        let nots = format!("{}x", "!".repeat(depth));
        let negations = format!("{}x", "-".repeat(depth));
        let brackets = format!("{}{}", "[".repeat(depth), "]".repeat(depth));
        let chain = vec!["x"; depth].join(" || ");

        for expression in [&parens, &nots, &negations, &brackets, &chain] {
            let err = try_evaluate(expression, &v).unwrap_err();
            assert!(err.to_string().contains("nested too deeply"), "{err}");
            assert!(!evaluate(expression, &v));
        }
    }

    #[test]
    fn reasonable_nesting_still_parses() {
        let v = vars(&[("x", json!(1))]);
        let nested = format!("{}x > 0{}", "(".repeat(100), ")".repeat(100));
        assert!(evaluate(&nested, &v));
        assert!(evaluate("!!!!(x > 0) && x + 1 + 2 + 3 > 6", &v));
    }
}
