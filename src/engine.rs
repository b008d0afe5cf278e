//! Binding parameter values to a compiled plan and running its statements.
//!
//! Binding resolves every placeholder of the plan to concrete values, expands
//! list parameters into one placeholder per element and appends pagination
//! and locking to selects. Execution goes through any sqlx connection.

use chrono::NaiveDateTime;
use sqlx::any::{AnyArguments, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyConnection};
use tracing::debug;

use crate::dialect::SqlGenerator;
use crate::error::{BindingError, ExecutionError, OqlError};
use crate::params::{EnabledFilters, QueryParameters};
use crate::plan::{CompiledPlan, ParameterBinding, ParameterSource};
use crate::types::{SemanticType, Value};

pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// A statement ready to send: final SQL and its values in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStatement {
    pub sql: String,
    pub values: Vec<(Value, SemanticType)>,
}

/// What `bind` appends to the last statement of a select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Paging {
    /// Row selection and lock mode.
    Sql,
    /// Lock mode only; the caller applies the row selection to the results.
    InMemory,
    /// Nothing.
    Off,
}

/// Resolve and check all parameter values of `plan`.
///
/// The row selection and lock mode of `params` are rendered into the last
/// statement of a select as `paging` asks.
pub fn bind(
    plan: &CompiledPlan,
    params: &QueryParameters,
    filters: &EnabledFilters,
    generator: &dyn SqlGenerator,
    paging: Paging,
) -> Result<Vec<BoundStatement>, OqlError> {
    plan.parameter_translations().validate(params)?;

    let resolved = plan
        .parameter_bindings()
        .iter()
        .map(|binding| resolve(binding, params, filters))
        .collect::<Result<Vec<_>, _>>()?;

    let last = plan.statements().len().saturating_sub(1);
    let statements = plan
        .statements()
        .iter()
        .enumerate()
        .map(|(i, statement)| {
            let mut sql = statement.render(generator, |index| resolved[index].len());
            if i == last && !plan.is_manipulation() {
                if paging == Paging::Sql {
                    let selection = params.selection();
                    sql.push_str(&generator.limit_offset(selection.max_results, selection.first_result));
                }
                if paging != Paging::Off {
                    sql.push_str(generator.lock_clause(params.get_lock_mode()));
                }
            }
            let mut values = Vec::new();
            for index in statement.bindings() {
                let semantic_type = &plan.parameter_bindings()[index].semantic_type;
                for value in &resolved[index] {
                    values.push((value.clone(), semantic_type.clone()));
                }
            }
            BoundStatement { sql, values }
        })
        .collect();
    Ok(statements)
}

fn resolve(
    binding: &ParameterBinding,
    params: &QueryParameters,
    filters: &EnabledFilters,
) -> Result<Vec<Value>, BindingError> {
    let values = match &binding.source {
        ParameterSource::Named(name) => params
            .named(name)
            .map(|v| v.values().to_vec())
            .ok_or_else(|| BindingError::MissingNamed {
                name: name.clone(),
                query: String::new(),
            })?,
        ParameterSource::Ordinal(position) => params
            .ordinal(*position)
            .map(|v| v.values().to_vec())
            .ok_or_else(|| BindingError::MissingOrdinal {
                position: *position,
                query: String::new(),
            })?,
        ParameterSource::Synthesized { filter, parameter } => {
            let value = filters
                .get(filter)
                .and_then(|f| f.parameters.get(parameter))
                .ok_or_else(|| BindingError::MissingFilterParameter {
                    filter: filter.clone(),
                    parameter: parameter.clone(),
                })?;
            vec![value.clone()]
        }
    };

    for value in &values {
        if !binding.semantic_type.accepts(value) {
            return Err(BindingError::TypeMismatch {
                parameter: binding.source.to_string(),
                expected: binding.semantic_type.to_string(),
                actual: value.kind().to_string(),
            });
        }
    }
    Ok(values)
}

/// Build the sqlx query for a bound statement.
pub(crate) fn build_query(statement: &BoundStatement) -> Query<'_, Any, AnyArguments<'_>> {
    let mut query = sqlx::query(&statement.sql);
    for (value, semantic_type) in &statement.values {
        query = match (value, semantic_type) {
            (Value::Null, _) => bind_null(query, semantic_type),
            (Value::Bool(v), _) => query.bind(*v),
            (Value::Int(v), SemanticType::Double) => query.bind(*v as f64),
            (Value::Int(v), _) => query.bind(*v),
            (Value::Float(v), _) => query.bind(*v),
            (Value::String(v), _) => query.bind(v.as_str()),
            (Value::Timestamp(v), _) => query.bind(format_timestamp(v)),
        };
    }
    query
}

fn bind_null<'q>(
    query: Query<'q, Any, AnyArguments<'q>>,
    semantic_type: &SemanticType,
) -> Query<'q, Any, AnyArguments<'q>> {
    match semantic_type {
        SemanticType::Boolean => query.bind(None::<bool>),
        SemanticType::Double => query.bind(None::<f64>),
        SemanticType::String | SemanticType::Timestamp => query.bind(None::<String>),
        SemanticType::Integer | SemanticType::Entity(_) | SemanticType::Component(_) => {
            query.bind(None::<i64>)
        }
    }
}

pub(crate) fn format_timestamp(value: &NaiveDateTime) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}

/// Run a select statement and return all rows.
pub async fn fetch_all(
    conn: &mut AnyConnection,
    statement: &BoundStatement,
) -> Result<Vec<AnyRow>, OqlError> {
    debug!(sql = %statement.sql, values = statement.values.len(), "fetch");
    let rows = build_query(statement)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| ExecutionError::statement(&statement.sql, e))?;
    Ok(rows)
}

/// Run a statement and return the number of affected rows.
pub async fn execute(conn: &mut AnyConnection, statement: &BoundStatement) -> Result<u64, OqlError> {
    debug!(sql = %statement.sql, values = statement.values.len(), "execute");
    let result = build_query(statement)
        .execute(&mut *conn)
        .await
        .map_err(|e| ExecutionError::statement(&statement.sql, e))?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::compiler::Compiler;
    use crate::dialect::Dialect;
    use crate::mapping::sample_metamodel;
    use crate::params::{EnabledFilter, LockMode};

    fn plan(dialect: Dialect, filters: &EnabledFilters, query: &str) -> CompiledPlan {
        let model = sample_metamodel();
        Compiler::new(&model, dialect, filters, false)
            .compile(query, query, &BTreeMap::new())
            .unwrap()
    }

    #[test]
    fn test_bind_expands_lists() {
        let filters = EnabledFilters::new();
        let plan = plan(
            Dialect::Postgres,
            &filters,
            "select p.name from Person p where p.name in (:names) and p.age > :min",
        );
        let params = QueryParameters::new()
            .with("names", vec!["Ann", "Bob", "Cy"])
            .with("min", 3);
        let bound = bind(&plan, &params, &filters, &*Dialect::Postgres.generator(), Paging::Off).unwrap();

        assert_eq!(bound.len(), 1);
        assert!(bound[0].sql.contains("in ($1, $2, $3)"));
        assert!(bound[0].sql.ends_with("> $4"));
        assert_eq!(
            bound[0].values.iter().map(|(v, _)| v.clone()).collect::<Vec<_>>(),
            vec![
                Value::from("Ann"),
                Value::from("Bob"),
                Value::from("Cy"),
                Value::Int(3)
            ]
        );
    }

    #[test]
    fn test_bind_repeated_parameter() {
        let filters = EnabledFilters::new();
        let plan = plan(
            Dialect::Sqlite,
            &filters,
            "from Person p where p.age > :n or p.id = :n",
        );
        let params = QueryParameters::new().with("n", 7);
        let bound = bind(&plan, &params, &filters, &*Dialect::Sqlite.generator(), Paging::Off).unwrap();
        assert_eq!(bound[0].values.len(), 2);
    }

    #[test]
    fn test_bind_pagination_and_lock() {
        let filters = EnabledFilters::new();
        let plan = plan(Dialect::Postgres, &filters, "select p.name from Person p");
        let params = QueryParameters::new()
            .first_result(20)
            .max_results(10)
            .lock_mode(LockMode::Upgrade);

        let bound = bind(&plan, &params, &filters, &*Dialect::Postgres.generator(), Paging::Sql).unwrap();
        assert!(bound[0].sql.ends_with(" limit 10 offset 20 for update"));

        let unpaged = bind(&plan, &params, &filters, &*Dialect::Postgres.generator(), Paging::Off).unwrap();
        assert_eq!(unpaged[0].sql, plan.sql());
    }

    #[test]
    fn test_bind_in_memory_paging_keeps_lock() {
        let filters = EnabledFilters::new();
        let plan = plan(Dialect::Postgres, &filters, "from Person p join fetch p.orders o");
        let params = QueryParameters::new()
            .max_results(1)
            .lock_mode(LockMode::Upgrade);

        let bound = bind(&plan, &params, &filters, &*Dialect::Postgres.generator(), Paging::InMemory).unwrap();
        assert_eq!(bound[0].sql, format!("{} for update", plan.sql()));
        assert!(!bound[0].sql.contains("limit"));
    }

    #[test]
    fn test_bind_type_mismatch() {
        let filters = EnabledFilters::new();
        let plan = plan(Dialect::Sqlite, &filters, "from Person p where p.age > :min");
        let params = QueryParameters::new().with("min", "eighteen");
        let err = bind(&plan, &params, &filters, &*Dialect::Sqlite.generator(), Paging::Off).unwrap_err();
        assert!(matches!(
            err,
            OqlError::Binding(BindingError::TypeMismatch { ref parameter, .. }) if parameter == ":min"
        ));
    }

    #[test]
    fn test_bind_filter_parameters() {
        let filters = EnabledFilters::new().with(EnabledFilter::new("adults").with_parameter("minAge", 18));
        let plan = plan(Dialect::Sqlite, &filters, "from Person p");
        let bound = bind(
            &plan,
            &QueryParameters::new(),
            &filters,
            &*Dialect::Sqlite.generator(),
            Paging::Off,
        )
        .unwrap();
        assert_eq!(bound[0].values, vec![(Value::Int(18), SemanticType::Integer)]);

        let missing = EnabledFilters::new().with(EnabledFilter::new("adults"));
        let err = bind(
            &plan,
            &QueryParameters::new(),
            &missing,
            &*Dialect::Sqlite.generator(),
            Paging::Off,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            OqlError::Binding(BindingError::MissingFilterParameter { .. })
        ));
    }

    #[test]
    fn test_bind_validates_first() {
        let filters = EnabledFilters::new();
        let plan = plan(Dialect::Sqlite, &filters, "from Person p where p.age > :min");
        let params = QueryParameters::new().with("max", 3);
        let err = bind(&plan, &params, &filters, &*Dialect::Sqlite.generator(), Paging::Off).unwrap_err();
        assert!(matches!(
            err,
            OqlError::Binding(BindingError::UnknownNamed { .. })
        ));
    }

    #[test]
    fn test_timestamp_format() {
        let ts = chrono::NaiveDate::from_ymd_opt(2024, 1, 2)
            .and_then(|d| d.and_hms_opt(3, 4, 5))
            .unwrap();
        assert_eq!(format_timestamp(&ts), "2024-01-02 03:04:05");
    }
}
