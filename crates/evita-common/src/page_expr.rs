//! Boolean expressions over the current page number.
//!
//! Conditional pagination gaps carry an expression such as
//! `$pageNumber % 2 == 0` or `$pageNumber > 1 && $pageNumber <= 4`. The
//! slicer evaluates it for every page it walks through.
//!
//! Grammar (whitespace is insignificant):
//!
//! ```text
//! expr    := or
//! or      := and ("||" and)*
//! and     := unary ("&&" unary)*
//! unary   := "!" unary | "true" | "false" | compare | "(" expr ")"
//! compare := arith ("==" | "!=" | "<=" | ">=" | "<" | ">") arith
//! arith   := term (("+" | "-") term)*
//! term    := factor (("*" | "/" | "%") factor)*
//! factor  := "$pageNumber" | integer | "(" arith ")"
//! ```

use std::fmt;
use std::str::FromStr;

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{char as pchar, digit1, multispace0},
    combinator::{all_consuming, map, map_res, value},
    multi::many0,
    sequence::{delimited, pair, preceded, terminated},
    IResult,
};
use thiserror::Error;

pub const PAGE_NUMBER_VARIABLE: &str = "$pageNumber";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
    #[error("invalid page expression `{expression}`: {message}")]
    Invalid { expression: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    PageNumber,
    Constant(i64),
    Binary {
        op: ArithOp,
        left: Box<Operand>,
        right: Box<Operand>,
    },
}

impl Operand {
    /// `None` when the arithmetic is undefined (division by zero, overflow).
    pub fn eval(&self, page: i64) -> Option<i64> {
        match self {
            Operand::PageNumber => Some(page),
            Operand::Constant(c) => Some(*c),
            Operand::Binary { op, left, right } => {
                let l = left.eval(page)?;
                let r = right.eval(page)?;
                match op {
                    ArithOp::Add => l.checked_add(r),
                    ArithOp::Sub => l.checked_sub(r),
                    ArithOp::Mul => l.checked_mul(r),
                    ArithOp::Div => l.checked_div(r),
                    ArithOp::Rem => l.checked_rem(r),
                }
            }
        }
    }

    fn constant(&self) -> Option<i64> {
        match self {
            Operand::PageNumber => None,
            Operand::Constant(c) => Some(*c),
            Operand::Binary { .. } if !self.mentions_page() => self.eval(0),
            Operand::Binary { .. } => None,
        }
    }

    fn mentions_page(&self) -> bool {
        match self {
            Operand::PageNumber => true,
            Operand::Constant(_) => false,
            Operand::Binary { left, right, .. } => left.mentions_page() || right.mentions_page(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageExpression {
    Literal(bool),
    Compare {
        left: Operand,
        op: CmpOp,
        right: Operand,
    },
    And(Box<PageExpression>, Box<PageExpression>),
    Or(Box<PageExpression>, Box<PageExpression>),
    Not(Box<PageExpression>),
}

impl PageExpression {
    pub fn parse(expression: &str) -> Result<Self, ExprError> {
        match all_consuming(delimited(multispace0, parse_or, multispace0))(expression) {
            Ok((_, expr)) => Ok(expr),
            Err(err) => Err(ExprError::Invalid {
                expression: expression.to_string(),
                message: err.to_string(),
            }),
        }
    }

    /// Evaluate for a 1-based page number.
    pub fn matches(&self, page: u64) -> bool {
        let page = i64::try_from(page).unwrap_or(i64::MAX);
        self.eval(page)
    }

    fn eval(&self, page: i64) -> bool {
        match self {
            PageExpression::Literal(b) => *b,
            PageExpression::Compare { left, op, right } => {
                let (Some(l), Some(r)) = (left.eval(page), right.eval(page)) else {
                    return false;
                };
                match op {
                    CmpOp::Eq => l == r,
                    CmpOp::Ne => l != r,
                    CmpOp::Lt => l < r,
                    CmpOp::Le => l <= r,
                    CmpOp::Gt => l > r,
                    CmpOp::Ge => l >= r,
                }
            }
            PageExpression::And(a, b) => a.eval(page) && b.eval(page),
            PageExpression::Or(a, b) => a.eval(page) || b.eval(page),
            PageExpression::Not(a) => !a.eval(page),
        }
    }

    /// The last page this expression can possibly match.
    ///
    /// `None` means unbounded. The analysis is conservative: it only derives a
    /// bound from direct `$pageNumber` vs. constant comparisons and returns
    /// `None` whenever it cannot prove one.
    pub fn last_matching_page(&self) -> Option<u64> {
        match self {
            PageExpression::Literal(true) => None,
            PageExpression::Literal(false) => Some(0),
            PageExpression::Compare { left, op, right } => compare_bound(left, *op, right),
            PageExpression::And(a, b) => match (a.last_matching_page(), b.last_matching_page()) {
                (Some(x), Some(y)) => Some(x.min(y)),
                (Some(x), None) | (None, Some(x)) => Some(x),
                (None, None) => None,
            },
            PageExpression::Or(a, b) => match (a.last_matching_page(), b.last_matching_page()) {
                (Some(x), Some(y)) => Some(x.max(y)),
                _ => None,
            },
            PageExpression::Not(_) => None,
        }
    }
}

fn compare_bound(left: &Operand, op: CmpOp, right: &Operand) -> Option<u64> {
    if let (Some(l), Some(r)) = (left.constant(), right.constant()) {
        let holds = PageExpression::Compare {
            left: Operand::Constant(l),
            op,
            right: Operand::Constant(r),
        }
        .eval(0);
        return if holds { None } else { Some(0) };
    }
    // normalize to `$pageNumber <op> constant`
    let (op, bound) = match (left, right.constant(), right, left.constant()) {
        (Operand::PageNumber, Some(c), _, _) => (op, c),
        (_, _, Operand::PageNumber, Some(c)) => (flip(op), c),
        _ => return None,
    };
    let clamp = |v: i64| u64::try_from(v.max(0)).unwrap_or(0);
    match op {
        CmpOp::Eq | CmpOp::Le => Some(clamp(bound)),
        CmpOp::Lt => Some(clamp(bound.saturating_sub(1))),
        CmpOp::Ne | CmpOp::Gt | CmpOp::Ge => None,
    }
}

fn flip(op: CmpOp) -> CmpOp {
    match op {
        CmpOp::Lt => CmpOp::Gt,
        CmpOp::Le => CmpOp::Ge,
        CmpOp::Gt => CmpOp::Lt,
        CmpOp::Ge => CmpOp::Le,
        other => other,
    }
}

impl FromStr for PageExpression {
    type Err = ExprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PageExpression::parse(s)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::PageNumber => f.write_str(PAGE_NUMBER_VARIABLE),
            Operand::Constant(c) => write!(f, "{c}"),
            Operand::Binary { op, left, right } => {
                let sym = match op {
                    ArithOp::Add => "+",
                    ArithOp::Sub => "-",
                    ArithOp::Mul => "*",
                    ArithOp::Div => "/",
                    ArithOp::Rem => "%",
                };
                write!(f, "({left} {sym} {right})")
            }
        }
    }
}

impl fmt::Display for PageExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageExpression::Literal(b) => write!(f, "{b}"),
            PageExpression::Compare { left, op, right } => {
                let sym = match op {
                    CmpOp::Eq => "==",
                    CmpOp::Ne => "!=",
                    CmpOp::Lt => "<",
                    CmpOp::Le => "<=",
                    CmpOp::Gt => ">",
                    CmpOp::Ge => ">=",
                };
                write!(f, "{left} {sym} {right}")
            }
            PageExpression::And(a, b) => write!(f, "({a} && {b})"),
            PageExpression::Or(a, b) => write!(f, "({a} || {b})"),
            PageExpression::Not(a) => write!(f, "!({a})"),
        }
    }
}

// ============================================================================
// Parser
// ============================================================================

fn ws<'a, O>(
    inner: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> impl FnMut(&'a str) -> IResult<&'a str, O> {
    delimited(multispace0, inner, multispace0)
}

fn parse_or(input: &str) -> IResult<&str, PageExpression> {
    let (input, first) = parse_and(input)?;
    let (input, rest) = many0(preceded(ws(tag("||")), parse_and))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(first, |acc, e| PageExpression::Or(Box::new(acc), Box::new(e))),
    ))
}

fn parse_and(input: &str) -> IResult<&str, PageExpression> {
    let (input, first) = parse_unary(input)?;
    let (input, rest) = many0(preceded(ws(tag("&&")), parse_unary))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(first, |acc, e| PageExpression::And(Box::new(acc), Box::new(e))),
    ))
}

fn parse_unary(input: &str) -> IResult<&str, PageExpression> {
    ws(alt((
        map(preceded(pchar('!'), parse_unary), |e| {
            PageExpression::Not(Box::new(e))
        }),
        value(PageExpression::Literal(true), tag("true")),
        value(PageExpression::Literal(false), tag("false")),
        parse_compare,
        delimited(pchar('('), parse_or, ws(pchar(')'))),
    )))(input)
}

fn parse_compare(input: &str) -> IResult<&str, PageExpression> {
    let (input, left) = parse_arith(input)?;
    let (input, op) = ws(alt((
        value(CmpOp::Eq, tag("==")),
        value(CmpOp::Ne, tag("!=")),
        value(CmpOp::Le, tag("<=")),
        value(CmpOp::Ge, tag(">=")),
        value(CmpOp::Lt, tag("<")),
        value(CmpOp::Gt, tag(">")),
    )))(input)?;
    let (input, right) = parse_arith(input)?;
    Ok((input, PageExpression::Compare { left, op, right }))
}

fn parse_arith(input: &str) -> IResult<&str, Operand> {
    let (input, first) = parse_term(input)?;
    let (input, rest) = many0(pair(
        ws(alt((
            value(ArithOp::Add, pchar('+')),
            value(ArithOp::Sub, pchar('-')),
        ))),
        parse_term,
    ))(input)?;
    Ok((input, fold_binary(first, rest)))
}

fn parse_term(input: &str) -> IResult<&str, Operand> {
    let (input, first) = parse_factor(input)?;
    let (input, rest) = many0(pair(
        ws(alt((
            value(ArithOp::Mul, pchar('*')),
            value(ArithOp::Div, pchar('/')),
            value(ArithOp::Rem, pchar('%')),
        ))),
        parse_factor,
    ))(input)?;
    Ok((input, fold_binary(first, rest)))
}

fn parse_factor(input: &str) -> IResult<&str, Operand> {
    ws(alt((
        value(Operand::PageNumber, tag(PAGE_NUMBER_VARIABLE)),
        map_res(digit1, |digits: &str| digits.parse::<i64>().map(Operand::Constant)),
        delimited(pchar('('), parse_arith, terminated(multispace0, pchar(')'))),
    )))(input)
}

fn fold_binary(first: Operand, rest: Vec<(ArithOp, Operand)>) -> Operand {
    rest.into_iter().fold(first, |left, (op, right)| Operand::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> PageExpression {
        PageExpression::parse(s).expect("expression should parse")
    }

    #[test]
    fn parses_and_evaluates_modulo() {
        let e = parse("$pageNumber % 2 == 0");
        assert!(!e.matches(1));
        assert!(e.matches(2));
        assert!(e.matches(10));
        assert_eq!(e.last_matching_page(), None);
    }

    #[test]
    fn precedence_and_grouping() {
        let e = parse("$pageNumber == 1 || $pageNumber > 2 && $pageNumber < 5");
        assert!(e.matches(1));
        assert!(!e.matches(2));
        assert!(e.matches(3));
        assert!(!e.matches(5));

        let grouped = parse("($pageNumber == 1 || $pageNumber > 2) && $pageNumber < 5");
        assert!(grouped.matches(1));
        assert!(grouped.matches(4));
        assert!(!grouped.matches(6));

        let arith = parse("($pageNumber + 1) * 2 == 6");
        assert!(arith.matches(2));
        assert!(!arith.matches(3));
    }

    #[test]
    fn negation_and_literals() {
        let e = parse("!($pageNumber == 3)");
        assert!(e.matches(2));
        assert!(!e.matches(3));
        assert!(parse("true").matches(42));
        assert!(!parse("false").matches(1));
    }

    #[test]
    fn bounds_are_derived_conservatively() {
        assert_eq!(parse("$pageNumber == 3").last_matching_page(), Some(3));
        assert_eq!(parse("$pageNumber <= 4").last_matching_page(), Some(4));
        assert_eq!(parse("$pageNumber < 4").last_matching_page(), Some(3));
        assert_eq!(parse("4 >= $pageNumber").last_matching_page(), Some(4));
        assert_eq!(parse("$pageNumber > 4").last_matching_page(), None);
        assert_eq!(
            parse("$pageNumber > 1 && $pageNumber <= 4").last_matching_page(),
            Some(4)
        );
        assert_eq!(
            parse("$pageNumber == 2 || $pageNumber == 7").last_matching_page(),
            Some(7)
        );
        assert_eq!(
            parse("$pageNumber == 2 || $pageNumber % 3 == 0").last_matching_page(),
            None
        );
        assert_eq!(parse("false").last_matching_page(), Some(0));
        assert_eq!(parse("1 == 2").last_matching_page(), Some(0));
    }

    #[test]
    fn division_by_zero_never_matches() {
        let e = parse("$pageNumber / 0 == 1");
        assert!(!e.matches(1));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(PageExpression::parse("$pageNumber ==").is_err());
        assert!(PageExpression::parse("$page == 1").is_err());
        assert!(PageExpression::parse("$pageNumber == 1 &&").is_err());
        assert!(PageExpression::parse("").is_err());
    }

    #[test]
    fn display_round_trips_through_parser() {
        let e = parse("$pageNumber % 3 == 0 && !($pageNumber < 2)");
        let again = parse(&e.to_string());
        for page in 1..20 {
            assert_eq!(e.matches(page), again.matches(page));
        }
    }
}
