use crate::Event;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

/// Evaluates conditional expressions against events
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, event: &Event) -> Result<bool, ExpressionError>;
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("Invalid expression {expression:?}: {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("Cannot compare {left} {op} {right}")]
    NotComparable {
        left: String,
        op: &'static str,
        right: String,
    },
}

/// Evaluator of comparisons joined by `and` / `or`
///
/// ```text
/// /status >= 400 and /method == "GET" or /retry == true
/// ```
///
/// - An operand is either a slash-prefixed event key or a JSON literal
///   (number, double-quoted string, `true`, `false`, `null`).
/// - A missing event key evaluates to `null`.
/// - `and` binds tighter than `or`.
///
/// Parsed expressions are cached, since the same conditions are evaluated over and over.
#[derive(Default)]
pub struct SimpleExpressionEvaluator {
    cache: RwLock<HashMap<String, Arc<Disjunction>>>,
}

impl SimpleExpressionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    fn parsed(&self, expression: &str) -> Result<Arc<Disjunction>, ExpressionError> {
        if let Some(parsed) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(expression)
        {
            return Ok(parsed.clone());
        }

        let parsed = Arc::new(parse(expression)?);
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(expression.to_string(), parsed.clone());
        Ok(parsed)
    }
}

impl ExpressionEvaluator for SimpleExpressionEvaluator {
    fn evaluate(&self, expression: &str, event: &Event) -> Result<bool, ExpressionError> {
        self.parsed(expression)?.eval(event)
    }
}

/// `or` of `and` of comparisons
struct Disjunction(Vec<Vec<Comparison>>);

struct Comparison {
    left: Operand,
    op: Op,
    right: Operand,
}

enum Operand {
    Key(String),
    Literal(Value),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Op {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Debug, PartialEq)]
enum Token {
    Key(String),
    Literal(Value),
    Op(Op),
    And,
    Or,
}

impl Disjunction {
    fn eval(&self, event: &Event) -> Result<bool, ExpressionError> {
        for conjunction in &self.0 {
            let mut all = true;
            for comparison in conjunction {
                if !comparison.eval(event)? {
                    all = false;
                    break;
                }
            }
            if all {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl Comparison {
    fn eval(&self, event: &Event) -> Result<bool, ExpressionError> {
        let left = self.left.resolve(event);
        let right = self.right.resolve(event);
        match self.op {
            Op::Eq => Ok(json_eq(left, right)),
            Op::NotEq => Ok(!json_eq(left, right)),
            op => {
                let ordering = match (left, right) {
                    (Value::Number(l), Value::Number(r)) => {
                        l.as_f64().zip(r.as_f64()).and_then(|(l, r)| l.partial_cmp(&r))
                    }
                    (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
                    _ => None,
                };
                let Some(ordering) = ordering else {
                    return Err(ExpressionError::NotComparable {
                        left: left.to_string(),
                        op: op.as_str(),
                        right: right.to_string(),
                    });
                };
                Ok(match op {
                    Op::Lt => ordering.is_lt(),
                    Op::LtEq => ordering.is_le(),
                    Op::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                })
            }
        }
    }
}

static NULL: Value = Value::Null;

impl Operand {
    fn resolve<'a>(&'a self, event: &'a Event) -> &'a Value {
        match self {
            Operand::Key(key) => event.get(key).unwrap_or(&NULL),
            Operand::Literal(value) => value,
        }
    }
}

impl Op {
    fn as_str(&self) -> &'static str {
        match self {
            Op::Eq => "==",
            Op::NotEq => "!=",
            Op::Lt => "<",
            Op::LtEq => "<=",
            Op::Gt => ">",
            Op::GtEq => ">=",
        }
    }
}

/// Numbers are compared by value, so `1 == 1.0`
fn json_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => match (l.as_f64(), r.as_f64()) {
            (Some(l), Some(r)) => l == r,
            _ => l == r,
        },
        _ => left == right,
    }
}

fn parse(expression: &str) -> Result<Disjunction, ExpressionError> {
    let invalid = |reason: String| ExpressionError::InvalidExpression {
        expression: expression.to_string(),
        reason,
    };

    let mut tokens = tokenize(expression).map_err(invalid)?.into_iter();
    let mut disjunction = vec![];
    let mut conjunction = vec![];
    loop {
        let left = operand(tokens.next()).map_err(invalid)?;
        let op = match tokens.next() {
            Some(Token::Op(op)) => op,
            other => return Err(invalid(format!("expected a comparison operator, found {other:?}"))),
        };
        let right = operand(tokens.next()).map_err(invalid)?;
        conjunction.push(Comparison { left, op, right });

        match tokens.next() {
            None => break,
            Some(Token::And) => continue,
            Some(Token::Or) => disjunction.push(std::mem::take(&mut conjunction)),
            Some(other) => return Err(invalid(format!("expected `and` or `or`, found {other:?}"))),
        }
    }
    disjunction.push(conjunction);
    Ok(Disjunction(disjunction))
}

fn operand(token: Option<Token>) -> Result<Operand, String> {
    match token {
        Some(Token::Key(key)) => Ok(Operand::Key(key)),
        Some(Token::Literal(value)) => Ok(Operand::Literal(value)),
        other => Err(format!("expected an event key or a literal, found {other:?}")),
    }
}

fn tokenize(expression: &str) -> Result<Vec<Token>, String> {
    let mut tokens = vec![];
    let mut chars = expression.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        if c == '"' {
            chars.next();
            let mut escaped = false;
            let mut end = None;
            for (i, c) in chars.by_ref() {
                match c {
                    '\\' if !escaped => escaped = true,
                    '"' if !escaped => {
                        end = Some(i);
                        break;
                    }
                    _ => escaped = false,
                }
            }
            let Some(end) = end else {
                return Err("unterminated string".to_string());
            };
            let literal: Value = serde_json::from_str(&expression[start..=end])
                .map_err(|err| format!("invalid string literal: {err}"))?;
            tokens.push(Token::Literal(literal));
            continue;
        }

        if is_op_char(c) {
            let mut end = start;
            while let Some(&(i, c)) = chars.peek() {
                if !is_op_char(c) {
                    break;
                }
                end = i + c.len_utf8();
                chars.next();
            }
            let op = match &expression[start..end] {
                "==" => Op::Eq,
                "!=" => Op::NotEq,
                "<" => Op::Lt,
                "<=" => Op::LtEq,
                ">" => Op::Gt,
                ">=" => Op::GtEq,
                unknown => return Err(format!("unknown operator {unknown}")),
            };
            tokens.push(Token::Op(op));
            continue;
        }

        let mut end = start;
        while let Some(&(i, c)) = chars.peek() {
            if c.is_whitespace() || is_op_char(c) || c == '"' {
                break;
            }
            end = i + c.len_utf8();
            chars.next();
        }
        let word = &expression[start..end];
        let token = match word {
            "and" => Token::And,
            "or" => Token::Or,
            key if key.starts_with('/') => Token::Key(key.to_string()),
            literal => Token::Literal(
                serde_json::from_str(literal).map_err(|_| format!("unexpected word {literal}"))?,
            ),
        };
        tokens.push(token);
    }

    Ok(tokens)
}

fn is_op_char(c: char) -> bool {
    matches!(c, '=' | '!' | '<' | '>')
}
