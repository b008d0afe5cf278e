//! Expression rendering and parameter typing.

use super::scope::Resolved;
use super::{Lowering, PendingParam, SqlBuffer};
use crate::ast::{AggregateFunc, ArithmeticOp, Expr, LogicalOp};
use crate::error::{OqlError, QueryError};
use crate::mapping::PropertyKind;
use crate::plan::ParameterSource;
use crate::types::{SemanticType, Value};

/// Rendered SQL with the type of the value it produces, when known.
pub(super) struct Typed {
    pub sql: SqlBuffer,
    pub semantic_type: Option<SemanticType>,
}

impl Typed {
    fn new(sql: impl Into<String>, semantic_type: Option<SemanticType>) -> Self {
        Self {
            sql: SqlBuffer::text(sql),
            semantic_type,
        }
    }

    fn boolean(sql: SqlBuffer) -> Self {
        Self {
            sql,
            semantic_type: Some(SemanticType::Boolean),
        }
    }
}

impl Lowering<'_> {
    /// Render an expression. `hint` is the type expected by the context and
    /// types parameters that have no operand to take a type from.
    pub(super) fn expr(&mut self, expr: &Expr, hint: Option<&SemanticType>) -> Result<Typed, OqlError> {
        match expr {
            Expr::Literal(value) => Ok(self.literal(value)),
            Expr::NamedParam(name) => {
                self.parameter(expr, ParameterSource::Named(name.clone()), hint)
            }
            Expr::OrdinalParam(position) => {
                self.parameter(expr, ParameterSource::Ordinal(*position), hint)
            }
            Expr::LegacyParam => Err(QueryError::LegacyOrdinalParameter {
                query: self.query.to_string(),
            }
            .into()),
            Expr::Path(path) => self.path_expr(path),
            Expr::Nested(inner) => {
                let inner = self.expr(inner, hint)?;
                Ok(Typed {
                    sql: wrap("(", inner.sql, ")"),
                    semantic_type: inner.semantic_type,
                })
            }
            Expr::Negate(inner) => {
                let inner = self.expr(inner, hint)?;
                Ok(Typed {
                    sql: wrap("-", inner.sql, ""),
                    semantic_type: inner.semantic_type,
                })
            }
            Expr::Not(inner) => {
                let inner = self.expr(inner, Some(&SemanticType::Boolean))?;
                Ok(Typed::boolean(wrap("not ", inner.sql, "")))
            }
            Expr::Logical { left, op, right } => {
                let boolean = SemanticType::Boolean;
                let left = self.expr(left, Some(&boolean))?;
                let right = self.expr(right, Some(&boolean))?;
                let separator = match op {
                    LogicalOp::And => " and ",
                    LogicalOp::Or => " or ",
                };
                Ok(Typed::boolean(SqlBuffer::join(
                    vec![left.sql, right.sql],
                    separator,
                )))
            }
            Expr::Compare { left, op, right } => {
                let (left, right) = self.operands(left, right, None)?;
                Ok(Typed::boolean(SqlBuffer::join(
                    vec![left.sql, right.sql],
                    &format!(" {} ", op),
                )))
            }
            Expr::Arithmetic { left, op, right } => self.arithmetic(left, *op, right, hint),
            Expr::Like {
                expr,
                pattern,
                escape,
                negated,
            } => {
                let string = SemanticType::String;
                let expr = self.expr(expr, Some(&string))?;
                let pattern = self.expr(pattern, Some(&string))?;
                let mut sql = expr.sql;
                sql.push_str(if *negated { " not like " } else { " like " });
                sql.append(pattern.sql);
                if let Some(escape) = escape {
                    sql.push_str(" escape ");
                    sql.append(self.expr(escape, Some(&string))?.sql);
                }
                Ok(Typed::boolean(sql))
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                let expr = self.expr(expr, None)?;
                let mut items = Vec::new();
                for item in list {
                    let mut rendered = self.expr(item, expr.semantic_type.as_ref())?;
                    if item.is_parameter() {
                        rendered.sql.mark_expandable();
                    }
                    items.push(rendered.sql);
                }
                let mut sql = expr.sql;
                sql.push_str(if *negated { " not in (" } else { " in (" });
                sql.append(SqlBuffer::join(items, ", "));
                sql.push_str(")");
                Ok(Typed::boolean(sql))
            }
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let expr = self.expr(expr, None)?;
                let low = self.expr(low, expr.semantic_type.as_ref())?;
                let high = self.expr(high, expr.semantic_type.as_ref())?;
                let mut sql = expr.sql;
                sql.push_str(if *negated { " not between " } else { " between " });
                sql.append(low.sql);
                sql.push_str(" and ");
                sql.append(high.sql);
                Ok(Typed::boolean(sql))
            }
            Expr::IsNull { expr, negated } => self.is_null(expr, *negated),
            Expr::IsEmpty { expr, negated } => self.is_empty(expr, *negated),
            Expr::Function { name, args } => self.function(expr, name, args),
            Expr::Aggregate {
                func,
                distinct,
                arg,
            } => self.aggregate(*func, *distinct, arg.as_deref()),
        }
    }

    /// Render an expression whose type must be known.
    pub(super) fn typed_expr(&mut self, expr: &Expr) -> Result<(SqlBuffer, SemanticType), OqlError> {
        let typed = self.expr(expr, None)?;
        match typed.semantic_type {
            Some(semantic_type) => Ok((typed.sql, semantic_type)),
            None => Err(QueryError::UndeterminedType {
                fragment: expr.to_string(),
            }
            .into()),
        }
    }

    /// Render both operands of a binary operator so that a parameter takes
    /// its type from the other side.
    fn operands(
        &mut self,
        left: &Expr,
        right: &Expr,
        hint: Option<&SemanticType>,
    ) -> Result<(Typed, Typed), OqlError> {
        if left.is_parameter() && !right.is_parameter() {
            let right = self.expr(right, hint)?;
            let left = self.expr(left, right.semantic_type.as_ref().or(hint))?;
            return Ok((left, right));
        }
        let left = self.expr(left, hint)?;
        let right = self.expr(right, left.semantic_type.as_ref().or(hint))?;
        Ok((left, right))
    }

    fn literal(&self, value: &Value) -> Typed {
        match value {
            Value::Null => Typed::new("null", None),
            Value::Bool(b) => Typed::new(self.generator.bool_literal(*b), Some(SemanticType::Boolean)),
            Value::Int(n) => Typed::new(n.to_string(), Some(SemanticType::Integer)),
            Value::Float(n) => Typed::new(format!("{:?}", n), Some(SemanticType::Double)),
            Value::String(s) => Typed::new(
                format!("'{}'", s.replace('\'', "''")),
                Some(SemanticType::String),
            ),
            Value::Timestamp(t) => Typed::new(
                format!("'{}'", t.format("%Y-%m-%d %H:%M:%S")),
                Some(SemanticType::Timestamp),
            ),
        }
    }

    fn parameter(
        &mut self,
        expr: &Expr,
        source: ParameterSource,
        hint: Option<&SemanticType>,
    ) -> Result<Typed, OqlError> {
        let Some(expected) = hint else {
            return Err(QueryError::UndeterminedType {
                fragment: expr.to_string(),
            }
            .into());
        };
        // Entity-valued parameters bind the target's identifier.
        let semantic_type = match expected {
            SemanticType::Entity(entity) => self.entity(entity)?.identifier.semantic_type.clone(),
            SemanticType::Component(component) => {
                return Err(self.invalid(format!(
                    "component-valued parameter {} for '{}' is not supported",
                    expr, component
                )));
            }
            other => other.clone(),
        };

        let mut sql = SqlBuffer::new();
        sql.push_param(PendingParam {
            source,
            semantic_type,
            expandable: false,
        });
        Ok(Typed {
            sql,
            semantic_type: Some(expected.clone()),
        })
    }

    fn path_expr(&mut self, path: &[String]) -> Result<Typed, OqlError> {
        match self.resolve_path(path)? {
            Resolved::Column { sql, semantic_type } => Ok(Typed::new(sql, Some(semantic_type))),
            Resolved::Entity(element) => {
                let entity = self.scope.element(element).entity.clone();
                let mapping = self.entity(&entity)?;
                Ok(Typed::new(
                    self.qualify(element, &mapping.identifier.column),
                    Some(SemanticType::Entity(entity)),
                ))
            }
            Resolved::Reference { target, fk_sql, .. } => {
                Ok(Typed::new(fk_sql, Some(SemanticType::Entity(target))))
            }
            Resolved::Component { .. } => Err(self.invalid(format!(
                "component [{}] cannot be used in an expression",
                path.join(".")
            ))),
            Resolved::Collection { .. } => Err(self.invalid(format!(
                "illegal attempt to dereference collection [{}]",
                path.join(".")
            ))),
        }
    }

    fn arithmetic(
        &mut self,
        left: &Expr,
        op: ArithmeticOp,
        right: &Expr,
        hint: Option<&SemanticType>,
    ) -> Result<Typed, OqlError> {
        if op == ArithmeticOp::Concat {
            let string = SemanticType::String;
            let (left, right) = self.operands(left, right, Some(&string))?;
            return Ok(self.concat(vec![left.sql, right.sql]));
        }

        let (left, right) = self.operands(left, right, hint)?;
        let semantic_type = match (left.semantic_type, right.semantic_type) {
            (Some(SemanticType::Double), _) | (_, Some(SemanticType::Double)) => {
                Some(SemanticType::Double)
            }
            (Some(t), _) => Some(t),
            (None, t) => t,
        };
        Ok(Typed {
            sql: SqlBuffer::join(vec![left.sql, right.sql], &format!(" {} ", op)),
            semantic_type,
        })
    }

    /// Dialect specific concatenation of rendered string operands.
    fn concat(&self, parts: Vec<SqlBuffer>) -> Typed {
        // Render around a marker so placeholders survive the dialect wrapper.
        let marker = "\u{0}";
        let template = self
            .generator
            .string_concat(&vec![marker.to_string(); parts.len()]);
        let mut sql = SqlBuffer::new();
        let mut pieces = template.split(marker);
        if let Some(head) = pieces.next() {
            sql.push_str(head);
        }
        for (part, tail) in parts.into_iter().zip(pieces) {
            sql.append(part);
            sql.push_str(tail);
        }
        Typed {
            sql,
            semantic_type: Some(SemanticType::String),
        }
    }

    fn is_null(&mut self, expr: &Expr, negated: bool) -> Result<Typed, OqlError> {
        let test = if negated { " is not null" } else { " is null" };
        if let Expr::Path(path) = expr {
            if let Resolved::Component { columns, .. } = self.resolve_path(path)? {
                let tests: Vec<String> = columns.iter().map(|c| format!("{}{}", c, test)).collect();
                let joiner = if negated { " or " } else { " and " };
                return Ok(Typed::boolean(SqlBuffer::text(format!(
                    "({})",
                    tests.join(joiner)
                ))));
            }
        }
        let rendered = self.expr(expr, None)?;
        Ok(Typed::boolean(wrap("", rendered.sql, test)))
    }

    /// `is [not] empty` becomes a correlated `[not] exists` subquery.
    fn is_empty(&mut self, expr: &Expr, negated: bool) -> Result<Typed, OqlError> {
        let resolved = match expr {
            Expr::Path(path) => self.resolve_path(path)?,
            _ => return Err(self.invalid(format!("{} is not a collection", expr))),
        };
        let Resolved::Collection { owner, property } = resolved else {
            return Err(self.invalid(format!("{} is not a collection", expr)));
        };

        let mapping = self.entity(&self.scope.element(owner).entity)?;
        let (table, key_column) = match &mapping.property(&property)?.kind {
            PropertyKind::OneToMany { target, key_column } => {
                (self.entity(target)?.table.clone(), key_column.clone())
            }
            PropertyKind::ManyToMany {
                table, key_column, ..
            } => (table.clone(), key_column.clone()),
            _ => return Err(self.invalid(format!("{} is not a collection", expr))),
        };
        self.query_spaces.insert(table.clone());

        let stem: String = table.chars().filter(|c| c.is_ascii_alphanumeric()).take(10).collect();
        let alias = self.scope.next_alias(&stem.to_lowercase());
        let owner_id = self.qualify_outer(owner, &mapping.identifier.column);
        Ok(Typed::boolean(SqlBuffer::text(format!(
            "{}exists (select 1 from {} {} where {}.{} = {})",
            if negated { "" } else { "not " },
            table,
            alias,
            alias,
            key_column,
            owner_id
        ))))
    }

    fn function(&mut self, expr: &Expr, name: &str, args: &[Expr]) -> Result<Typed, OqlError> {
        let arity_error = |expected: &str| -> OqlError {
            QueryError::invalid(
                format!("function {}() expects {}", name, expected),
                expr.to_string(),
            )
            .into()
        };

        match name {
            "lower" | "upper" | "trim" | "length" | "abs" => {
                let [arg] = args else {
                    return Err(arity_error("one argument"));
                };
                let hint = match name {
                    "abs" => None,
                    _ => Some(SemanticType::String),
                };
                let arg = self.expr(arg, hint.as_ref())?;
                let semantic_type = match name {
                    "length" => Some(SemanticType::Integer),
                    "abs" => arg.semantic_type,
                    _ => Some(SemanticType::String),
                };
                Ok(Typed {
                    sql: wrap(&format!("{}(", name), arg.sql, ")"),
                    semantic_type,
                })
            }
            "coalesce" => {
                if args.is_empty() {
                    return Err(arity_error("at least one argument"));
                }
                // Parameters take the type of the first typed argument.
                let mut semantic_type = None;
                let mut rendered = Vec::new();
                for arg in args.iter().filter(|a| !a.is_parameter()) {
                    let typed = self.expr(arg, None)?;
                    semantic_type = semantic_type.or(typed.semantic_type);
                    rendered.push(typed.sql);
                }
                let mut typed_params = Vec::new();
                for arg in args.iter().filter(|a| a.is_parameter()) {
                    typed_params.push(self.expr(arg, semantic_type.as_ref())?.sql);
                }
                let mut ordered = Vec::new();
                let (mut plain, mut params) = (rendered.into_iter(), typed_params.into_iter());
                for arg in args {
                    let next = if arg.is_parameter() { params.next() } else { plain.next() };
                    ordered.extend(next);
                }
                Ok(Typed {
                    sql: wrap("coalesce(", SqlBuffer::join(ordered, ", "), ")"),
                    semantic_type,
                })
            }
            "concat" => {
                if args.is_empty() {
                    return Err(arity_error("at least one argument"));
                }
                let string = SemanticType::String;
                let mut parts = Vec::new();
                for arg in args {
                    parts.push(self.expr(arg, Some(&string))?.sql);
                }
                Ok(self.concat(parts))
            }
            _ => Err(self.invalid(format!("Unknown function '{}'", name))),
        }
    }

    fn aggregate(
        &mut self,
        func: AggregateFunc,
        distinct: bool,
        arg: Option<&Expr>,
    ) -> Result<Typed, OqlError> {
        let Some(arg) = arg else {
            if func == AggregateFunc::Count {
                return Ok(Typed::new("count(*)", Some(SemanticType::Integer)));
            }
            return Err(self.invalid(format!("{}(*) is not supported", func)));
        };

        let inner = self.expr(arg, None)?;
        let semantic_type = match func {
            AggregateFunc::Count => Some(SemanticType::Integer),
            AggregateFunc::Avg => Some(SemanticType::Double),
            _ => inner.semantic_type,
        };
        let open = format!("{}({}", func, if distinct { "distinct " } else { "" });
        Ok(Typed {
            sql: wrap(&open, inner.sql, ")"),
            semantic_type,
        })
    }
}

fn wrap(prefix: &str, inner: SqlBuffer, suffix: &str) -> SqlBuffer {
    let mut sql = SqlBuffer::text(prefix);
    sql.append(inner);
    sql.push_str(suffix);
    sql
}
