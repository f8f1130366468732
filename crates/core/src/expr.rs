//! A small, side-effect free expression language for computed fields.
//!
//! Expressions are evaluated over a feature's `properties` object:
//!
//! ```text
//! exposure * 2 if band == "r" else exposure
//! date2unix(obs.start) + 86400000
//! not (ra < 0 or ra >= 360)
//! ```
//!
//! Property paths that do not resolve evaluate to undefined, and so does any
//! operation over an undefined operand. Evaluation never fails.

use nom::branch::alt;
use nom::bytes::complete::{escaped_transform, is_not, tag, take_while, take_while1};
use nom::character::complete::{char as pchar, multispace0, satisfy};
use nom::combinator::{all_consuming, map, map_res, not, opt, peek, recognize, value, verify};
use nom::multi::{many0, separated_list0};
use nom::number::complete::recognize_float;
use nom::sequence::{delimited, pair, preceded, terminated, tuple};
use nom::IResult;
use serde_json::{Map, Value};

use crate::schema::parse_date_millis;
use crate::{Error, Result};

const KEYWORDS: [&str; 5] = ["and", "or", "not", "if", "else"];

/// Value produced by an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    Undefined,
    Number(f64),
    Text(String),
    Bool(bool),
}

impl ExprValue {
    /// Numeric view of the value, if it has one.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ExprValue::Number(n) => Some(*n),
            ExprValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            ExprValue::Text(s) => s.trim().parse().ok(),
            ExprValue::Undefined => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            ExprValue::Undefined => false,
            ExprValue::Number(n) => *n != 0.0 && !n.is_nan(),
            ExprValue::Text(s) => !s.is_empty(),
            ExprValue::Bool(b) => *b,
        }
    }

    /// Convert to JSON; NaN and infinities become `None`.
    pub fn into_json(self) -> Option<Value> {
        match self {
            ExprValue::Undefined => None,
            ExprValue::Number(n) => serde_json::Number::from_f64(n).map(Value::Number),
            ExprValue::Text(s) => Some(Value::String(s)),
            ExprValue::Bool(b) => Some(Value::Bool(b)),
        }
    }

    fn from_json(value: &Value) -> Self {
        match value {
            Value::Number(n) => n.as_f64().map_or(ExprValue::Undefined, ExprValue::Number),
            Value::String(s) => ExprValue::Text(s.clone()),
            Value::Bool(b) => ExprValue::Bool(*b),
            _ => ExprValue::Undefined,
        }
    }

    fn display(&self) -> String {
        match self {
            ExprValue::Undefined => String::new(),
            ExprValue::Number(n) => n.to_string(),
            ExprValue::Text(s) => s.clone(),
            ExprValue::Bool(b) => b.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Text(String),
    /// Dotted property path, kept whole for literal-key fallback
    Path(String),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Conditional {
        then: Box<Expr>,
        cond: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Call(String, Vec<Expr>),
}

/// A validated expression ready for evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpr {
    source: String,
    root: Expr,
}

impl CompiledExpr {
    /// Parse and validate an expression.
    pub fn compile(source: &str) -> Result<Self> {
        let (_, root) = all_consuming(ws(expression))(source)
            .map_err(|e| Error::Expression(format!("failed to parse '{source}': {e:?}")))?;
        check_calls(&root)?;
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> &Expr {
        &self.root
    }

    /// Evaluate against a properties object.
    pub fn eval(&self, props: &Map<String, Value>) -> ExprValue {
        eval(&self.root, props)
    }
}

/// Look up a dotted path in a JSON object, nested first, then as a literal key.
pub fn lookup_path<'a>(props: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let nested = segments.next().and_then(|first| {
        segments.try_fold(props.get(first)?, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    });
    nested.or_else(|| props.get(path))
}

fn check_calls(expr: &Expr) -> Result<()> {
    match expr {
        Expr::Number(_) | Expr::Text(_) | Expr::Path(_) => Ok(()),
        Expr::Neg(inner) | Expr::Not(inner) => check_calls(inner),
        Expr::And(a, b) | Expr::Or(a, b) | Expr::Binary(_, a, b) => {
            check_calls(a)?;
            check_calls(b)
        }
        Expr::Conditional {
            then,
            cond,
            otherwise,
        } => {
            check_calls(then)?;
            check_calls(cond)?;
            check_calls(otherwise)
        }
        Expr::Call(name, args) => {
            let arity_ok = match name.as_str() {
                "date2unix" | "abs" | "round" | "floor" | "ceil" | "sqrt" | "log" => {
                    args.len() == 1
                }
                "min" | "max" => !args.is_empty(),
                _ => return Err(Error::Expression(format!("unknown function '{name}'"))),
            };
            if !arity_ok {
                return Err(Error::Expression(format!(
                    "wrong number of arguments to '{name}': {}",
                    args.len()
                )));
            }
            args.iter().try_for_each(check_calls)
        }
    }
}

fn eval(expr: &Expr, props: &Map<String, Value>) -> ExprValue {
    match expr {
        Expr::Number(n) => ExprValue::Number(*n),
        Expr::Text(s) => ExprValue::Text(s.clone()),
        Expr::Path(path) => lookup_path(props, path).map_or(ExprValue::Undefined, ExprValue::from_json),
        Expr::Neg(inner) => match eval(inner, props).as_number() {
            Some(n) => ExprValue::Number(-n),
            None => ExprValue::Undefined,
        },
        Expr::Not(inner) => ExprValue::Bool(!eval(inner, props).is_truthy()),
        Expr::And(a, b) => {
            ExprValue::Bool(eval(a, props).is_truthy() && eval(b, props).is_truthy())
        }
        Expr::Or(a, b) => ExprValue::Bool(eval(a, props).is_truthy() || eval(b, props).is_truthy()),
        Expr::Conditional {
            then,
            cond,
            otherwise,
        } => {
            if eval(cond, props).is_truthy() {
                eval(then, props)
            } else {
                eval(otherwise, props)
            }
        }
        Expr::Binary(op, a, b) => binary(*op, eval(a, props), eval(b, props)),
        Expr::Call(name, args) => {
            let args: Vec<ExprValue> = args.iter().map(|a| eval(a, props)).collect();
            call(name, &args)
        }
    }
}

fn binary(op: BinaryOp, a: ExprValue, b: ExprValue) -> ExprValue {
    use BinaryOp::*;

    match op {
        Eq => return ExprValue::Bool(loose_eq(&a, &b)),
        Ne => return ExprValue::Bool(!loose_eq(&a, &b)),
        Lt | Le | Gt | Ge => {
            let ordering = match (&a, &b) {
                (ExprValue::Text(x), ExprValue::Text(y)) => Some(x.cmp(y)),
                _ => match (a.as_number(), b.as_number()) {
                    (Some(x), Some(y)) => x.partial_cmp(&y),
                    _ => None,
                },
            };
            let Some(ordering) = ordering else {
                return ExprValue::Bool(false);
            };
            return ExprValue::Bool(match op {
                Lt => ordering.is_lt(),
                Le => ordering.is_le(),
                Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            });
        }
        _ => {}
    }

    if matches!(a, ExprValue::Undefined) || matches!(b, ExprValue::Undefined) {
        return ExprValue::Undefined;
    }
    if op == Add && (matches!(a, ExprValue::Text(_)) || matches!(b, ExprValue::Text(_))) {
        return ExprValue::Text(a.display() + &b.display());
    }
    let (Some(x), Some(y)) = (a.as_number(), b.as_number()) else {
        return ExprValue::Undefined;
    };
    ExprValue::Number(match op {
        Add => x + y,
        Sub => x - y,
        Mul => x * y,
        Div => x / y,
        Rem => x % y,
        _ => x.powf(y),
    })
}

fn loose_eq(a: &ExprValue, b: &ExprValue) -> bool {
    match (a, b) {
        (ExprValue::Undefined, ExprValue::Undefined) => true,
        (ExprValue::Undefined, _) | (_, ExprValue::Undefined) => false,
        (ExprValue::Text(x), ExprValue::Text(y)) => x == y,
        _ => match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

fn call(name: &str, args: &[ExprValue]) -> ExprValue {
    if name == "date2unix" {
        return match &args[0] {
            ExprValue::Text(s) => parse_date_millis(s)
                .map_or(ExprValue::Undefined, |ms| ExprValue::Number(ms as f64)),
            ExprValue::Number(n) => ExprValue::Number(*n),
            _ => ExprValue::Undefined,
        };
    }

    let Some(numbers) = args.iter().map(ExprValue::as_number).collect::<Option<Vec<f64>>>() else {
        return ExprValue::Undefined;
    };
    let x = numbers[0];
    ExprValue::Number(match name {
        "abs" => x.abs(),
        "round" => x.round(),
        "floor" => x.floor(),
        "ceil" => x.ceil(),
        "sqrt" => x.sqrt(),
        "log" => x.ln(),
        "min" => numbers.iter().copied().fold(f64::INFINITY, f64::min),
        "max" => numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        _ => return ExprValue::Undefined,
    })
}

// ========== Parser ==========

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    ws(terminated(tag(word), not(peek(satisfy(is_ident_continue)))))
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

fn identifier(input: &str) -> IResult<&str, &str> {
    verify(
        recognize(pair(take_while1(is_ident_start), take_while(is_ident_continue))),
        |s: &str| !KEYWORDS.contains(&s),
    )(input)
}

fn path(input: &str) -> IResult<&str, Expr> {
    map(
        recognize(pair(
            identifier,
            many0(preceded(pchar('.'), take_while1(is_ident_continue))),
        )),
        |s: &str| Expr::Path(s.to_string()),
    )(input)
}

fn number(input: &str) -> IResult<&str, Expr> {
    map(map_res(recognize_float, str::parse::<f64>), Expr::Number)(input)
}

fn string_lit(input: &str) -> IResult<&str, Expr> {
    let escapes = || {
        alt((
            value("\\", tag("\\")),
            value("\"", tag("\"")),
            value("'", tag("'")),
            value("\n", tag("n")),
            value("\t", tag("t")),
        ))
    };
    map(
        alt((
            delimited(
                pchar('"'),
                map(opt(escaped_transform(is_not("\\\""), '\\', escapes())), Option::unwrap_or_default),
                pchar('"'),
            ),
            delimited(
                pchar('\''),
                map(opt(escaped_transform(is_not("\\'"), '\\', escapes())), Option::unwrap_or_default),
                pchar('\''),
            ),
        )),
        Expr::Text,
    )(input)
}

fn function_call(input: &str) -> IResult<&str, Expr> {
    map(
        tuple((
            identifier,
            ws(pchar('(')),
            separated_list0(ws(pchar(',')), expression),
            ws(pchar(')')),
        )),
        |(name, _, args, _)| Expr::Call(name.to_string(), args),
    )(input)
}

fn primary(input: &str) -> IResult<&str, Expr> {
    ws(alt((
        number,
        string_lit,
        function_call,
        path,
        delimited(pchar('('), expression, pchar(')')),
    )))(input)
}

fn power(input: &str) -> IResult<&str, Expr> {
    let (input, base) = primary(input)?;
    let (input, exponent) = opt(preceded(ws(pchar('^')), unary))(input)?;
    Ok((
        input,
        match exponent {
            Some(e) => Expr::Binary(BinaryOp::Pow, Box::new(base), Box::new(e)),
            None => base,
        },
    ))
}

fn unary(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(ws(pchar('-')), unary), |e| Expr::Neg(Box::new(e))),
        power,
    ))(input)
}

fn fold_binary(first: Expr, rest: Vec<(BinaryOp, Expr)>) -> Expr {
    rest.into_iter().fold(first, |acc, (op, rhs)| {
        Expr::Binary(op, Box::new(acc), Box::new(rhs))
    })
}

fn term(input: &str) -> IResult<&str, Expr> {
    let op = ws(alt((
        value(BinaryOp::Mul, pchar('*')),
        value(BinaryOp::Div, pchar('/')),
        value(BinaryOp::Rem, pchar('%')),
    )));
    map(pair(unary, many0(pair(op, unary))), |(first, rest)| {
        fold_binary(first, rest)
    })(input)
}

fn additive(input: &str) -> IResult<&str, Expr> {
    let op = ws(alt((
        value(BinaryOp::Add, pchar('+')),
        value(BinaryOp::Sub, pchar('-')),
    )));
    map(pair(term, many0(pair(op, term))), |(first, rest)| {
        fold_binary(first, rest)
    })(input)
}

fn comparison(input: &str) -> IResult<&str, Expr> {
    let op = ws(alt((
        value(BinaryOp::Eq, tag("==")),
        value(BinaryOp::Ne, tag("!=")),
        value(BinaryOp::Le, tag("<=")),
        value(BinaryOp::Ge, tag(">=")),
        value(BinaryOp::Lt, tag("<")),
        value(BinaryOp::Gt, tag(">")),
    )));
    let (input, lhs) = additive(input)?;
    let (input, rhs) = opt(pair(op, additive))(input)?;
    Ok((
        input,
        match rhs {
            Some((op, rhs)) => Expr::Binary(op, Box::new(lhs), Box::new(rhs)),
            None => lhs,
        },
    ))
}

fn negation(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(keyword("not"), negation), |e| Expr::Not(Box::new(e))),
        comparison,
    ))(input)
}

fn conjunction(input: &str) -> IResult<&str, Expr> {
    map(
        pair(negation, many0(preceded(keyword("and"), negation))),
        |(first, rest)| {
            rest.into_iter()
                .fold(first, |acc, rhs| Expr::And(Box::new(acc), Box::new(rhs)))
        },
    )(input)
}

fn disjunction(input: &str) -> IResult<&str, Expr> {
    map(
        pair(conjunction, many0(preceded(keyword("or"), conjunction))),
        |(first, rest)| {
            rest.into_iter()
                .fold(first, |acc, rhs| Expr::Or(Box::new(acc), Box::new(rhs)))
        },
    )(input)
}

fn expression(input: &str) -> IResult<&str, Expr> {
    let (input, then) = disjunction(input)?;
    let (input, branch) = opt(tuple((
        keyword("if"),
        disjunction,
        keyword("else"),
        expression,
    )))(input)?;
    Ok((
        input,
        match branch {
            Some((_, cond, _, otherwise)) => Expr::Conditional {
                then: Box::new(then),
                cond: Box::new(cond),
                otherwise: Box::new(otherwise),
            },
            None => then,
        },
    ))
}
