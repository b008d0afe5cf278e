//! Query language parser using nom.
//!
//! Parses query text into an [`ast::Statement`](crate::ast::Statement).
//!
//! # Syntax Overview
//!
//! ```text
//! select p.name from Person p join p.orders o where o.total > :min order by p.name
//! ──┬─── ───┬── ──────┬────── ──────┬─────── ──────────┬─────── ───────┬────────
//!   │       │         │             │                  │                └── ordering
//!   │       │         │             │                  └── restriction, :named / ?1 params
//!   │       │         │             └── association join (inner, left, fetch)
//!   │       │         └── root entity and alias
//!   │       └── projection (paths, aggregates, `new map(...)`)
//!   └── optional: `from Person p` selects the entity itself
//! ```
//!
//! Bulk statements: `update Person p set p.age = :age where ...` and
//! `delete from Person p where ...`.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while},
    character::complete::{char, digit1, multispace0, satisfy},
    combinator::{map, map_res, not, opt, recognize, value, verify},
    multi::{many0, separated_list0, separated_list1},
    sequence::{delimited, pair, preceded, terminated, tuple},
};
use regex::Regex;

use crate::ast::*;
use crate::error::QueryError;
use crate::types::Value;

/// Words that cannot be used as aliases or as the first segment of a path.
const RESERVED_WORDS: &[&str] = &[
    "select", "from", "where", "join", "inner", "left", "outer", "fetch", "on", "with",
    "group", "order", "by", "having", "as", "and", "or", "not", "set", "in", "is", "like",
    "between", "escape", "asc", "desc", "null", "true", "false", "new", "distinct", "update",
    "delete", "empty",
];

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"'[^']*'|\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
});

/// Replace `{name}` placeholders with their substitution text.
///
/// Replacement is a single textual pass that leaves quoted literals alone;
/// any placeholder without a substitution is an error.
pub fn substitute(query: &str, substitutions: &BTreeMap<String, String>) -> Result<String, QueryError> {
    let mut unknown: Option<String> = None;
    let replaced = PLACEHOLDER.replace_all(query, |caps: &regex::Captures| {
        let Some(name) = caps.get(1) else {
            return caps[0].to_string();
        };
        match substitutions.get(name.as_str()) {
            Some(text) => text.clone(),
            None => {
                unknown.get_or_insert_with(|| name.as_str().to_string());
                caps[0].to_string()
            }
        }
    });

    match unknown {
        Some(name) => Err(QueryError::UnknownPlaceholder {
            name,
            query: query.to_string(),
        }),
        None => Ok(replaced.into_owned()),
    }
}

/// Parse a complete statement.
pub fn parse(input: &str) -> Result<Statement, QueryError> {
    match terminated(statement, multispace0)(input) {
        Ok(("", stmt)) => Ok(stmt),
        Ok((remaining, _)) => Err(QueryError::syntax(
            input.len() - remaining.len(),
            format!("Unexpected trailing content: '{}'", snippet(remaining)),
        )),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(QueryError::syntax(
            input.len() - e.input.len(),
            format!("Unexpected input near '{}'", snippet(e.input)),
        )),
        Err(nom::Err::Incomplete(_)) => {
            Err(QueryError::syntax(input.len(), "Unexpected end of query"))
        }
    }
}

fn snippet(input: &str) -> String {
    let trimmed = input.trim_start();
    if trimmed.is_empty() {
        return "<end of query>".to_string();
    }
    trimmed.chars().take(24).collect()
}

fn is_reserved(word: &str) -> bool {
    RESERVED_WORDS.contains(&word.to_ascii_lowercase().as_str())
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(satisfy(is_ident_start), take_while(is_ident_char)))(input)
}

/// A case-insensitive keyword that is not the prefix of a longer word.
fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    move |input: &'a str| {
        let (input, _) = multispace0(input)?;
        terminated(tag_no_case(kw), not(satisfy(is_ident_char)))(input)
    }
}

fn symbol<'a>(s: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    move |input: &'a str| preceded(multispace0, tag(s))(input)
}

/// Parse the statement kinds.
fn statement(input: &str) -> IResult<&str, Statement> {
    alt((
        map(update_statement, Statement::Update),
        map(delete_statement, Statement::Delete),
        map(select_statement, Statement::Select),
    ))(input)
}

fn select_statement(input: &str) -> IResult<&str, SelectStatement> {
    let (input, select) = opt(select_clause)(input)?;
    let (input, from) = preceded(keyword("from"), separated_list1(symbol(","), from_range))(input)?;
    let (input, where_clause) = opt(preceded(keyword("where"), expression))(input)?;
    let (input, group_by) = opt(preceded(
        pair(keyword("group"), keyword("by")),
        separated_list1(symbol(","), expression),
    ))(input)?;
    let (input, having) = opt(preceded(keyword("having"), expression))(input)?;
    let (input, order_by) = opt(preceded(
        pair(keyword("order"), keyword("by")),
        separated_list1(symbol(","), order_item),
    ))(input)?;

    Ok((
        input,
        SelectStatement {
            select,
            from,
            where_clause,
            group_by: group_by.unwrap_or_default(),
            having,
            order_by: order_by.unwrap_or_default(),
        },
    ))
}

fn select_clause(input: &str) -> IResult<&str, SelectClause> {
    let (input, _) = keyword("select")(input)?;
    let (input, distinct) = distinct_flag(input)?;
    let (input, projection) = alt((
        instantiation,
        map(separated_list1(symbol(","), select_item), Projection::Items),
    ))(input)?;

    Ok((
        input,
        SelectClause {
            distinct,
            projection,
        },
    ))
}

/// Parse `new map(...)`, `new list(...)` or `new Name(...)`.
fn instantiation(input: &str) -> IResult<&str, Projection> {
    let (input, _) = keyword("new")(input)?;
    let (input, target) = alt((
        value(InstantiationTarget::Map, keyword("map")),
        value(InstantiationTarget::List, keyword("list")),
        map(entity_name, InstantiationTarget::Named),
    ))(input)?;
    let (input, items) = delimited(
        symbol("("),
        separated_list1(symbol(","), select_item),
        symbol(")"),
    )(input)?;

    Ok((input, Projection::New { target, items }))
}

fn select_item(input: &str) -> IResult<&str, SelectItem> {
    let (input, expr) = expression(input)?;
    let (input, alias) = opt(preceded(
        keyword("as"),
        preceded(multispace0, identifier),
    ))(input)?;

    Ok((
        input,
        SelectItem {
            expr,
            alias: alias.map(String::from),
        },
    ))
}

fn entity_name(input: &str) -> IResult<&str, String> {
    let (input, _) = multispace0(input)?;
    map(recognize(separated_list1(char('.'), identifier)), String::from)(input)
}

/// Parse an optional `as` followed by a non-reserved alias.
fn alias(input: &str) -> IResult<&str, String> {
    let (input, _) = opt(keyword("as"))(input)?;
    let (input, _) = multispace0(input)?;
    map(verify(identifier, |s: &str| !is_reserved(s)), String::from)(input)
}

fn from_range(input: &str) -> IResult<&str, FromRange> {
    let (input, entity) = entity_name(input)?;
    let (input, alias) = opt(alias)(input)?;
    let (input, joins) = many0(join_clause)(input)?;

    Ok((
        input,
        FromRange {
            entity,
            alias,
            joins,
        },
    ))
}

fn join_clause(input: &str) -> IResult<&str, JoinClause> {
    let (input, kind) = alt((
        value(
            JoinKind::Left,
            tuple((keyword("left"), opt(keyword("outer")), keyword("join"))),
        ),
        value(JoinKind::Inner, pair(keyword("inner"), keyword("join"))),
        value(JoinKind::Inner, keyword("join")),
    ))(input)?;
    let (input, fetch) = map(opt(keyword("fetch")), |f| f.is_some())(input)?;
    let (input, path) = path(input)?;
    let (input, alias) = opt(alias)(input)?;
    let (input, condition) = opt(preceded(
        alt((keyword("with"), keyword("on"))),
        expression,
    ))(input)?;

    Ok((
        input,
        JoinClause {
            kind,
            fetch,
            path,
            alias,
            condition,
        },
    ))
}

fn order_item(input: &str) -> IResult<&str, OrderItem> {
    let (input, expr) = expression(input)?;
    let (input, order) = opt(alt((
        value(SortOrder::Asc, keyword("asc")),
        value(SortOrder::Desc, keyword("desc")),
    )))(input)?;

    Ok((
        input,
        OrderItem {
            expr,
            order: order.unwrap_or(SortOrder::Asc),
        },
    ))
}

fn update_statement(input: &str) -> IResult<&str, UpdateStatement> {
    let (input, _) = keyword("update")(input)?;
    let (input, entity) = entity_name(input)?;
    let (input, alias) = opt(alias)(input)?;
    let (input, _) = keyword("set")(input)?;
    let (input, assignments) = separated_list1(symbol(","), assignment)(input)?;
    let (input, where_clause) = opt(preceded(keyword("where"), expression))(input)?;

    Ok((
        input,
        UpdateStatement {
            entity,
            alias,
            assignments,
            where_clause,
        },
    ))
}

fn assignment(input: &str) -> IResult<&str, Assignment> {
    let (input, path) = path(input)?;
    let (input, _) = symbol("=")(input)?;
    let (input, value) = expression(input)?;

    Ok((input, Assignment { path, value }))
}

fn delete_statement(input: &str) -> IResult<&str, DeleteStatement> {
    let (input, _) = keyword("delete")(input)?;
    let (input, _) = opt(keyword("from"))(input)?;
    let (input, entity) = entity_name(input)?;
    let (input, alias) = opt(alias)(input)?;
    let (input, where_clause) = opt(preceded(keyword("where"), expression))(input)?;

    Ok((
        input,
        DeleteStatement {
            entity,
            alias,
            where_clause,
        },
    ))
}

/// Parse a dotted property path whose first segment is not a keyword.
fn path(input: &str) -> IResult<&str, Vec<String>> {
    let (input, _) = multispace0(input)?;
    let (input, first) = verify(identifier, |s: &str| !is_reserved(s))(input)?;
    let (input, rest) = many0(preceded(char('.'), identifier))(input)?;

    let mut segments = vec![first.to_string()];
    segments.extend(rest.into_iter().map(String::from));
    Ok((input, segments))
}

/// Parse an expression (lowest precedence: `or`).
pub(crate) fn expression(input: &str) -> IResult<&str, Expr> {
    let (input, first) = and_expr(input)?;
    let (input, rest) = many0(preceded(keyword("or"), and_expr))(input)?;
    Ok((input, fold_logical(first, LogicalOp::Or, rest)))
}

fn and_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = not_expr(input)?;
    let (input, rest) = many0(preceded(keyword("and"), not_expr))(input)?;
    Ok((input, fold_logical(first, LogicalOp::And, rest)))
}

fn fold_logical(first: Expr, op: LogicalOp, rest: Vec<Expr>) -> Expr {
    rest.into_iter().fold(first, |left, right| Expr::Logical {
        left: Box::new(left),
        op,
        right: Box::new(right),
    })
}

fn not_expr(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(keyword("not"), not_expr), |e| Expr::Not(Box::new(e))),
        predicate,
    ))(input)
}

/// Everything that can follow the left operand of a predicate.
enum PredicateTail {
    Compare(CompareOp, Expr),
    IsNull(bool),
    IsEmpty(bool),
    Like {
        negated: bool,
        pattern: Expr,
        escape: Option<Expr>,
    },
    Between {
        negated: bool,
        low: Expr,
        high: Expr,
    },
    In {
        negated: bool,
        list: Vec<Expr>,
    },
}

impl PredicateTail {
    fn apply(self, left: Expr) -> Expr {
        let expr = Box::new(left);
        match self {
            PredicateTail::Compare(op, right) => Expr::Compare {
                left: expr,
                op,
                right: Box::new(right),
            },
            PredicateTail::IsNull(negated) => Expr::IsNull { expr, negated },
            PredicateTail::IsEmpty(negated) => Expr::IsEmpty { expr, negated },
            PredicateTail::Like {
                negated,
                pattern,
                escape,
            } => Expr::Like {
                expr,
                pattern: Box::new(pattern),
                escape: escape.map(Box::new),
                negated,
            },
            PredicateTail::Between { negated, low, high } => Expr::Between {
                expr,
                low: Box::new(low),
                high: Box::new(high),
                negated,
            },
            PredicateTail::In { negated, list } => Expr::InList {
                expr,
                list,
                negated,
            },
        }
    }
}

fn predicate(input: &str) -> IResult<&str, Expr> {
    let (input, left) = additive(input)?;
    let (input, tail) = opt(predicate_tail)(input)?;
    Ok((
        input,
        match tail {
            Some(tail) => tail.apply(left),
            None => left,
        },
    ))
}

fn comparison_op(input: &str) -> IResult<&str, CompareOp> {
    alt((
        value(CompareOp::Ge, symbol(">=")),
        value(CompareOp::Le, symbol("<=")),
        value(CompareOp::Ne, symbol("<>")),
        value(CompareOp::Ne, symbol("!=")),
        value(CompareOp::Eq, symbol("=")),
        value(CompareOp::Gt, symbol(">")),
        value(CompareOp::Lt, symbol("<")),
    ))(input)
}

fn negation(input: &str) -> IResult<&str, bool> {
    map(opt(keyword("not")), |n| n.is_some())(input)
}

fn predicate_tail(input: &str) -> IResult<&str, PredicateTail> {
    alt((
        map(pair(comparison_op, additive), |(op, right)| {
            PredicateTail::Compare(op, right)
        }),
        map(
            preceded(
                keyword("is"),
                pair(
                    negation,
                    alt((value(true, keyword("null")), value(false, keyword("empty")))),
                ),
            ),
            |(negated, is_null)| {
                if is_null {
                    PredicateTail::IsNull(negated)
                } else {
                    PredicateTail::IsEmpty(negated)
                }
            },
        ),
        map(
            tuple((
                negation,
                keyword("like"),
                additive,
                opt(preceded(keyword("escape"), additive)),
            )),
            |(negated, _, pattern, escape)| PredicateTail::Like {
                negated,
                pattern,
                escape,
            },
        ),
        map(
            tuple((negation, keyword("between"), additive, keyword("and"), additive)),
            |(negated, _, low, _, high)| PredicateTail::Between { negated, low, high },
        ),
        map(
            tuple((negation, keyword("in"), in_list)),
            |(negated, _, list)| PredicateTail::In { negated, list },
        ),
    ))(input)
}

/// `in (a, b, c)`, `in (:list)` or `in :list`.
fn in_list(input: &str) -> IResult<&str, Vec<Expr>> {
    alt((
        delimited(
            symbol("("),
            separated_list1(symbol(","), expression),
            symbol(")"),
        ),
        map(parameter, |p| vec![p]),
    ))(input)
}

fn additive(input: &str) -> IResult<&str, Expr> {
    let (input, first) = multiplicative(input)?;
    let (input, rest) = many0(pair(
        alt((
            value(ArithmeticOp::Concat, symbol("||")),
            value(ArithmeticOp::Add, symbol("+")),
            value(ArithmeticOp::Sub, symbol("-")),
        )),
        multiplicative,
    ))(input)?;
    Ok((input, fold_arithmetic(first, rest)))
}

fn multiplicative(input: &str) -> IResult<&str, Expr> {
    let (input, first) = unary(input)?;
    let (input, rest) = many0(pair(
        alt((
            value(ArithmeticOp::Mul, symbol("*")),
            value(ArithmeticOp::Div, symbol("/")),
            value(ArithmeticOp::Mod, symbol("%")),
        )),
        unary,
    ))(input)?;
    Ok((input, fold_arithmetic(first, rest)))
}

fn fold_arithmetic(first: Expr, rest: Vec<(ArithmeticOp, Expr)>) -> Expr {
    rest.into_iter().fold(first, |left, (op, right)| Expr::Arithmetic {
        left: Box::new(left),
        op,
        right: Box::new(right),
    })
}

fn unary(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(symbol("-"), unary), |e| match e {
            Expr::Literal(Value::Int(n)) => Expr::Literal(Value::Int(-n)),
            Expr::Literal(Value::Float(n)) => Expr::Literal(Value::Float(-n)),
            other => Expr::Negate(Box::new(other)),
        }),
        primary,
    ))(input)
}

fn primary(input: &str) -> IResult<&str, Expr> {
    alt((
        map(
            delimited(symbol("("), expression, symbol(")")),
            |e| Expr::Nested(Box::new(e)),
        ),
        map(literal, Expr::Literal),
        parameter,
        aggregate,
        function_call,
        map(path, Expr::Path),
    ))(input)
}

/// Parse a literal: string, number, boolean or null.
fn literal(input: &str) -> IResult<&str, Value> {
    let (input, _) = multispace0(input)?;
    alt((
        map(string_literal, Value::String),
        map_res(recognize(tuple((digit1, char('.'), digit1))), |s: &str| {
            s.parse::<f64>().map(Value::Float)
        }),
        map_res(terminated(digit1, not(satisfy(is_ident_char))), |s: &str| {
            s.parse::<i64>().map(Value::Int)
        }),
        value(Value::Bool(true), keyword("true")),
        value(Value::Bool(false), keyword("false")),
        value(Value::Null, keyword("null")),
    ))(input)
}

/// Parse a single-quoted string; `''` is an escaped quote.
fn string_literal(input: &str) -> IResult<&str, String> {
    let (mut input, _) = char('\'')(input)?;
    let mut content = String::new();
    loop {
        let (rest, chunk) = take_while(|c| c != '\'')(input)?;
        content.push_str(chunk);
        let (rest, _) = char('\'')(rest)?;
        match rest.strip_prefix('\'') {
            Some(after) => {
                content.push('\'');
                input = after;
            }
            None => return Ok((rest, content)),
        }
    }
}

/// Parse a parameter: `:name`, `?1`, or the unsupported bare `?`.
fn parameter(input: &str) -> IResult<&str, Expr> {
    let (input, _) = multispace0(input)?;
    alt((
        map(preceded(char(':'), identifier), |name: &str| {
            Expr::NamedParam(name.to_string())
        }),
        map_res(preceded(char('?'), digit1), |d: &str| {
            d.parse::<u32>().map(Expr::OrdinalParam)
        }),
        value(Expr::LegacyParam, char('?')),
    ))(input)
}

fn aggregate(input: &str) -> IResult<&str, Expr> {
    let (input, func) = alt((
        value(AggregateFunc::Count, keyword("count")),
        value(AggregateFunc::Sum, keyword("sum")),
        value(AggregateFunc::Avg, keyword("avg")),
        value(AggregateFunc::Min, keyword("min")),
        value(AggregateFunc::Max, keyword("max")),
    ))(input)?;
    let (input, _) = symbol("(")(input)?;
    let (input, (distinct, arg)) = alt((
        map(symbol("*"), |_| (false, None)),
        map(pair(distinct_flag, expression), |(d, e)| {
            (d, Some(Box::new(e)))
        }),
    ))(input)?;
    let (input, _) = symbol(")")(input)?;

    Ok((
        input,
        Expr::Aggregate {
            func,
            distinct,
            arg,
        },
    ))
}

fn distinct_flag(input: &str) -> IResult<&str, bool> {
    map(opt(keyword("distinct")), |d| d.is_some())(input)
}

fn function_call(input: &str) -> IResult<&str, Expr> {
    let (input, _) = multispace0(input)?;
    let (input, name) = verify(identifier, |s: &str| !is_reserved(s))(input)?;
    let (input, args) = delimited(
        symbol("("),
        separated_list0(symbol(","), expression),
        symbol(")"),
    )(input)?;

    Ok((
        input,
        Expr::Function {
            name: name.to_lowercase(),
            args,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn select(input: &str) -> SelectStatement {
        match parse(input).unwrap() {
            Statement::Select(s) => s,
            other => panic!("expected select, got {:?}", other),
        }
    }

    #[test]
    fn test_simple_select() {
        let stmt = select("select p.name from Person p where p.age > :minAge");
        let Some(SelectClause {
            projection: Projection::Items(items),
            distinct: false,
        }) = stmt.select
        else {
            panic!("expected a plain projection");
        };
        assert_eq!(items[0].expr, Expr::path(&["p", "name"]));
        assert_eq!(stmt.from[0].entity, "Person");
        assert_eq!(stmt.from[0].alias.as_deref(), Some("p"));
        assert_eq!(
            stmt.where_clause,
            Some(Expr::Compare {
                left: Box::new(Expr::path(&["p", "age"])),
                op: CompareOp::Gt,
                right: Box::new(Expr::NamedParam("minAge".into())),
            })
        );
    }

    #[test]
    fn test_implicit_select_and_keywords_are_case_insensitive() {
        let stmt = select("FROM Person AS p WHERE p.name LIKE 'A%' ORDER BY p.name DESC");
        assert!(stmt.select.is_none());
        assert_eq!(stmt.order_by[0].order, SortOrder::Desc);
        assert!(matches!(stmt.where_clause, Some(Expr::Like { negated: false, .. })));
    }

    #[test]
    fn test_joins() {
        let stmt = select(
            "from Person p left outer join fetch p.orders o inner join p.employer e with e.name = 'Acme'",
        );
        let joins = &stmt.from[0].joins;
        assert_eq!(joins.len(), 2);
        assert_eq!(joins[0].kind, JoinKind::Left);
        assert!(joins[0].fetch);
        assert_eq!(joins[0].path, vec!["p".to_string(), "orders".to_string()]);
        assert_eq!(joins[0].alias.as_deref(), Some("o"));
        assert_eq!(joins[1].kind, JoinKind::Inner);
        assert!(!joins[1].fetch);
        assert!(joins[1].condition.is_some());
    }

    #[test]
    fn test_entity_named_like_keyword() {
        let stmt = select("from Order o where o.total > 10");
        assert_eq!(stmt.from[0].entity, "Order");
        assert_eq!(stmt.from[0].alias.as_deref(), Some("o"));
    }

    #[test]
    fn test_precedence() {
        let stmt = select("from Person p where p.age > 1 or p.age < 0 and not p.name = 'x'");
        let Some(Expr::Logical { op, right, .. }) = stmt.where_clause else {
            panic!("expected logical");
        };
        assert_eq!(op, LogicalOp::Or);
        assert!(matches!(*right, Expr::Logical { op: LogicalOp::And, .. }));
    }

    #[test]
    fn test_predicates() {
        let stmt = select(
            "from Person p where p.age between 18 and 65 and p.name not in ('a', 'b') \
             and p.employer is not null and p.orders is empty and p.id in :ids",
        );
        let text = stmt.where_clause.unwrap().to_string();
        assert_eq!(
            text,
            "p.age between 18 and 65 and p.name not in ('a', 'b') and p.employer is not null \
             and p.orders is empty and p.id in (:ids)"
        );
    }

    #[test]
    fn test_aggregates_and_functions() {
        let stmt = select(
            "select count(*), count(distinct p.name), upper(p.name), avg(p.age) from Person p group by p.name having count(*) > 1",
        );
        let Some(SelectClause {
            projection: Projection::Items(items),
            ..
        }) = stmt.select
        else {
            panic!("expected items");
        };
        assert_eq!(
            items[0].expr,
            Expr::Aggregate {
                func: AggregateFunc::Count,
                distinct: false,
                arg: None
            }
        );
        assert!(matches!(
            items[1].expr,
            Expr::Aggregate {
                func: AggregateFunc::Count,
                distinct: true,
                ..
            }
        ));
        assert!(matches!(&items[2].expr, Expr::Function { name, .. } if name == "upper"));
        assert_eq!(stmt.group_by.len(), 1);
        assert!(stmt.having.is_some());
    }

    #[test]
    fn test_dynamic_instantiation() {
        let stmt = select("select new map(p.name as name, p.age as age) from Person p");
        let Some(SelectClause {
            projection: Projection::New { target, items },
            ..
        }) = stmt.select
        else {
            panic!("expected instantiation");
        };
        assert_eq!(target, InstantiationTarget::Map);
        assert_eq!(items[1].alias.as_deref(), Some("age"));

        let stmt = select("select new com.acme.Summary(p.name) from Person p");
        assert!(matches!(
            stmt.select.unwrap().projection,
            Projection::New { target: InstantiationTarget::Named(name), .. } if name == "com.acme.Summary"
        ));
    }

    #[test]
    fn test_parameters() {
        let stmt = select("from Person p where p.age > ?1 and p.name = ?");
        let text = stmt.where_clause.unwrap().to_string();
        assert_eq!(text, "p.age > ?1 and p.name = ?");
    }

    #[test]
    fn test_literals() {
        let stmt = select("from Person p where p.name = 'O''Brien' and p.age > -3 and p.score < 2.5");
        let text = stmt.where_clause.unwrap().to_string();
        assert_eq!(text, "p.name = 'O''Brien' and p.age > -3 and p.score < 2.5");
    }

    #[test]
    fn test_update() {
        let Statement::Update(stmt) =
            parse("update Person p set p.age = p.age + 1, name = :name where p.id = 5").unwrap()
        else {
            panic!("expected update");
        };
        assert_eq!(stmt.entity, "Person");
        assert_eq!(stmt.alias.as_deref(), Some("p"));
        assert_eq!(stmt.assignments.len(), 2);
        assert_eq!(stmt.assignments[1].path, vec!["name".to_string()]);
        assert!(stmt.where_clause.is_some());
    }

    #[test]
    fn test_delete() {
        let Statement::Delete(stmt) = parse("delete from Person p where p.age < :cutoff").unwrap()
        else {
            panic!("expected delete");
        };
        assert_eq!(stmt.entity, "Person");
        assert_eq!(stmt.alias.as_deref(), Some("p"));

        let Statement::Delete(stmt) = parse("delete Person").unwrap() else {
            panic!("expected delete");
        };
        assert_eq!(stmt.alias, None);
        assert_eq!(stmt.where_clause, None);
    }

    #[test]
    fn test_syntax_error_reports_position() {
        let err = parse("select p.name form Person p").unwrap_err();
        let QueryError::Syntax { position, message } = err else {
            panic!("expected syntax error");
        };
        assert_eq!(position, 14);
        assert!(message.contains("form Person p"));
    }

    #[test]
    fn test_trailing_content() {
        let err = parse("from Person p where p.age > 1 )").unwrap_err();
        assert!(matches!(err, QueryError::Syntax { .. }));
    }

    #[test]
    fn test_substitute() {
        let mut subs = BTreeMap::new();
        subs.insert("active".to_string(), "p.age > 0".to_string());
        assert_eq!(
            substitute("from Person p where {active}", &subs).unwrap(),
            "from Person p where p.age > 0"
        );

        let err = substitute("from Person p where {missing}", &subs).unwrap_err();
        assert_eq!(
            err,
            QueryError::UnknownPlaceholder {
                name: "missing".into(),
                query: "from Person p where {missing}".into()
            }
        );
    }

    #[test]
    fn test_substitute_skips_string_literals() {
        let mut subs = BTreeMap::new();
        subs.insert("x".to_string(), "p.age".to_string());
        assert_eq!(
            substitute("from Person p where p.name = '{x}' or {x} > 1", &subs).unwrap(),
            "from Person p where p.name = '{x}' or p.age > 1"
        );
        assert_eq!(
            substitute("from Person p where p.name = '{y}'", &BTreeMap::new()).unwrap(),
            "from Person p where p.name = '{y}'"
        );
    }

    #[test]
    fn test_statement_display_reparses() {
        for query in [
            "select distinct p.name as n from Person p left join fetch p.orders o with o.total > 10 where p.age >= :minAge group by p.name having count(o.id) > 1 order by p.name desc",
            "select new map(p.name as name, p.age) from Person p join p.employer e",
            "update Person p set p.age = p.age + 1, p.name = :name where p.id = ?1",
            "delete from Person p where p.age < :cutoff",
            "from Person p, Company c where p.employer = c",
        ] {
            let stmt = parse(query).unwrap();
            assert_eq!(parse(&stmt.to_string()).unwrap(), stmt);
        }
        assert_eq!(
            parse("delete Person where age < 3").unwrap().to_string(),
            "delete from Person where age < 3"
        );
    }
}
