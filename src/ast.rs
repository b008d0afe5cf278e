//! Syntax tree of the object query language.

use std::fmt;

use crate::types::Value;

/// A parsed statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(SelectStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    /// `None` means the implicit projection of `from ...` queries.
    pub select: Option<SelectClause>,
    pub from: Vec<FromRange>,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectClause {
    pub distinct: bool,
    pub projection: Projection,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Items(Vec<SelectItem>),
    /// `select new Target(...)`
    New {
        target: InstantiationTarget,
        items: Vec<SelectItem>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstantiationTarget {
    Map,
    List,
    Named(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub expr: Expr,
    pub alias: Option<String>,
}

/// A root entity in the `from` clause with the joins hanging off it.
#[derive(Debug, Clone, PartialEq)]
pub struct FromRange {
    pub entity: String,
    pub alias: Option<String>,
    pub joins: Vec<JoinClause>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    pub kind: JoinKind,
    pub fetch: bool,
    /// Association path, starting with the owner alias.
    pub path: Vec<String>,
    pub alias: Option<String>,
    pub condition: Option<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub expr: Expr,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub entity: String,
    pub alias: Option<String>,
    pub assignments: Vec<Assignment>,
    pub where_clause: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub path: Vec<String>,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    pub entity: String,
    pub alias: Option<String>,
    pub where_clause: Option<Expr>,
}

/// An expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    NamedParam(String),
    OrdinalParam(u32),
    /// A bare `?`, rejected during compilation.
    LegacyParam,
    Path(Vec<String>),
    Nested(Box<Expr>),
    Negate(Box<Expr>),
    Not(Box<Expr>),
    Logical {
        left: Box<Expr>,
        op: LogicalOp,
        right: Box<Expr>,
    },
    Compare {
        left: Box<Expr>,
        op: CompareOp,
        right: Box<Expr>,
    },
    Arithmetic {
        left: Box<Expr>,
        op: ArithmeticOp,
        right: Box<Expr>,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        escape: Option<Box<Expr>>,
        negated: bool,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    IsEmpty {
        expr: Box<Expr>,
        negated: bool,
    },
    Function {
        name: String,
        args: Vec<Expr>,
    },
    /// `arg == None` is `count(*)`.
    Aggregate {
        func: AggregateFunc,
        distinct: bool,
        arg: Option<Box<Expr>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Concat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl Expr {
    pub fn path(segments: &[&str]) -> Self {
        Expr::Path(segments.iter().map(|s| s.to_string()).collect())
    }

    /// Whether the expression is a parameter reference.
    pub fn is_parameter(&self) -> bool {
        matches!(
            self,
            Expr::NamedParam(_) | Expr::OrdinalParam(_) | Expr::LegacyParam
        )
    }
}

impl fmt::Display for LogicalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalOp::And => write!(f, "and"),
            LogicalOp::Or => write!(f, "or"),
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        };
        write!(f, "{}", op)
    }
}

impl fmt::Display for ArithmeticOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            ArithmeticOp::Add => "+",
            ArithmeticOp::Sub => "-",
            ArithmeticOp::Mul => "*",
            ArithmeticOp::Div => "/",
            ArithmeticOp::Mod => "%",
            ArithmeticOp::Concat => "||",
        };
        write!(f, "{}", op)
    }
}

impl fmt::Display for AggregateFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregateFunc::Count => "count",
            AggregateFunc::Sum => "sum",
            AggregateFunc::Avg => "avg",
            AggregateFunc::Min => "min",
            AggregateFunc::Max => "max",
        };
        write!(f, "{}", name)
    }
}

/// Renders expressions back to query language text, for error messages.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(Value::String(s)) => write!(f, "'{}'", s.replace('\'', "''")),
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::NamedParam(name) => write!(f, ":{}", name),
            Expr::OrdinalParam(n) => write!(f, "?{}", n),
            Expr::LegacyParam => write!(f, "?"),
            Expr::Path(segments) => write!(f, "{}", segments.join(".")),
            Expr::Nested(inner) => write!(f, "({})", inner),
            Expr::Negate(inner) => write!(f, "-{}", inner),
            Expr::Not(inner) => write!(f, "not {}", inner),
            Expr::Logical { left, op, right } => write!(f, "{} {} {}", left, op, right),
            Expr::Compare { left, op, right } => write!(f, "{} {} {}", left, op, right),
            Expr::Arithmetic { left, op, right } => write!(f, "{} {} {}", left, op, right),
            Expr::Like {
                expr,
                pattern,
                negated,
                ..
            } => {
                let not = if *negated { "not " } else { "" };
                write!(f, "{} {}like {}", expr, not, pattern)
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                let not = if *negated { "not " } else { "" };
                let items: Vec<String> = list.iter().map(|e| e.to_string()).collect();
                write!(f, "{} {}in ({})", expr, not, items.join(", "))
            }
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let not = if *negated { "not " } else { "" };
                write!(f, "{} {}between {} and {}", expr, not, low, high)
            }
            Expr::IsNull { expr, negated } => {
                let not = if *negated { "not " } else { "" };
                write!(f, "{} is {}null", expr, not)
            }
            Expr::IsEmpty { expr, negated } => {
                let not = if *negated { "not " } else { "" };
                write!(f, "{} is {}empty", expr, not)
            }
            Expr::Function { name, args } => {
                let items: Vec<String> = args.iter().map(|e| e.to_string()).collect();
                write!(f, "{}({})", name, items.join(", "))
            }
            Expr::Aggregate {
                func,
                distinct,
                arg,
            } => {
                let distinct = if *distinct { "distinct " } else { "" };
                match arg {
                    Some(arg) => write!(f, "{}({}{})", func, distinct, arg),
                    None => write!(f, "{}(*)", func),
                }
            }
        }
    }
}

fn write_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

fn write_alias(f: &mut fmt::Formatter<'_>, alias: &Option<String>) -> fmt::Result {
    match alias {
        Some(alias) => write!(f, " {}", alias),
        None => Ok(()),
    }
}

/// Renders statements back to query language text.
impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Select(stmt) => stmt.fmt(f),
            Statement::Update(stmt) => stmt.fmt(f),
            Statement::Delete(stmt) => stmt.fmt(f),
        }
    }
}

impl fmt::Display for SelectStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(select) = &self.select {
            write!(f, "{} ", select)?;
        }
        write!(f, "from ")?;
        write_list(f, &self.from)?;
        if let Some(condition) = &self.where_clause {
            write!(f, " where {}", condition)?;
        }
        if !self.group_by.is_empty() {
            write!(f, " group by ")?;
            write_list(f, &self.group_by)?;
        }
        if let Some(condition) = &self.having {
            write!(f, " having {}", condition)?;
        }
        if !self.order_by.is_empty() {
            write!(f, " order by ")?;
            write_list(f, &self.order_by)?;
        }
        Ok(())
    }
}

impl fmt::Display for SelectClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "select ")?;
        if self.distinct {
            write!(f, "distinct ")?;
        }
        match &self.projection {
            Projection::Items(items) => write_list(f, items),
            Projection::New { target, items } => {
                match target {
                    InstantiationTarget::Map => write!(f, "new map(")?,
                    InstantiationTarget::List => write!(f, "new list(")?,
                    InstantiationTarget::Named(name) => write!(f, "new {}(", name)?,
                }
                write_list(f, items)?;
                write!(f, ")")
            }
        }
    }
}

impl fmt::Display for SelectItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)?;
        match &self.alias {
            Some(alias) => write!(f, " as {}", alias),
            None => Ok(()),
        }
    }
}

impl fmt::Display for FromRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entity)?;
        write_alias(f, &self.alias)?;
        for join in &self.joins {
            write!(f, " {}", join)?;
        }
        Ok(())
    }
}

impl fmt::Display for JoinClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            JoinKind::Inner => write!(f, "join ")?,
            JoinKind::Left => write!(f, "left join ")?,
        }
        if self.fetch {
            write!(f, "fetch ")?;
        }
        write!(f, "{}", self.path.join("."))?;
        write_alias(f, &self.alias)?;
        match &self.condition {
            Some(condition) => write!(f, " with {}", condition),
            None => Ok(()),
        }
    }
}

impl fmt::Display for OrderItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.order {
            SortOrder::Asc => write!(f, "{}", self.expr),
            SortOrder::Desc => write!(f, "{} desc", self.expr),
        }
    }
}

impl fmt::Display for UpdateStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "update {}", self.entity)?;
        write_alias(f, &self.alias)?;
        write!(f, " set ")?;
        write_list(f, &self.assignments)?;
        match &self.where_clause {
            Some(condition) => write!(f, " where {}", condition),
            None => Ok(()),
        }
    }
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.path.join("."), self.value)
    }
}

impl fmt::Display for DeleteStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "delete from {}", self.entity)?;
        write_alias(f, &self.alias)?;
        match &self.where_clause {
            Some(condition) => write!(f, " where {}", condition),
            None => Ok(()),
        }
    }
}
