//! Query translators: compile once, execute many times.
//!
//! # Example
//!
//! ```rust,ignore
//! let factory = TranslatorFactory::new(Arc::new(metamodel), Dialect::Sqlite);
//! let mut translator = factory.create_translator(
//!     "adults",
//!     "from Person p where p.age >= :minAge",
//!     EnabledFilters::new(),
//! );
//! translator.compile(&BTreeMap::new(), false)?;
//! let people = translator
//!     .list(&mut conn, &QueryParameters::new().with("minAge", 18))
//!     .await?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use sqlx::AnyConnection;
use tracing::{debug, trace, warn};

use crate::compiler::Compiler;
use crate::cursor::{ResultIter, ScrollableResults};
use crate::dialect::Dialect;
use crate::engine::{self, Paging};
use crate::error::{OqlError, QueryError};
use crate::hydrate::{Hydrator, QueryResult};
use crate::mapping::MappingResolver;
use crate::params::{EnabledFilters, QueryParameters};
use crate::plan::CompiledPlan;

/// Creates translators sharing one mapping model and dialect.
#[derive(Clone)]
pub struct TranslatorFactory {
    resolver: Arc<dyn MappingResolver>,
    dialect: Dialect,
}

impl TranslatorFactory {
    pub fn new(resolver: Arc<dyn MappingResolver>, dialect: Dialect) -> Self {
        Self { resolver, dialect }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// An uncompiled translator for `query_string`.
    pub fn create_translator(
        &self,
        query_identifier: impl Into<String>,
        query_string: impl Into<String>,
        filters: EnabledFilters,
    ) -> Translator {
        Translator {
            query_identifier: query_identifier.into(),
            query_string: query_string.into(),
            filters,
            resolver: Arc::clone(&self.resolver),
            dialect: self.dialect,
            state: TranslatorState::Uncompiled,
        }
    }
}

enum TranslatorState {
    Uncompiled,
    Compiled(Arc<CompiledPlan>),
}

/// One query, compiled at most once and executable any number of times.
pub struct Translator {
    query_identifier: String,
    query_string: String,
    filters: EnabledFilters,
    resolver: Arc<dyn MappingResolver>,
    dialect: Dialect,
    state: TranslatorState,
}

impl Translator {
    pub fn query_identifier(&self) -> &str {
        &self.query_identifier
    }

    pub fn query_string(&self) -> &str {
        &self.query_string
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self.state, TranslatorState::Compiled(_))
    }

    /// Compile the query. Calling it again once compiled does nothing.
    pub fn compile(
        &mut self,
        substitutions: &BTreeMap<String, String>,
        shallow: bool,
    ) -> Result<(), OqlError> {
        if self.is_compiled() {
            trace!(query = %self.query_string, "already compiled");
            return Ok(());
        }

        let plan = Compiler::new(self.resolver.as_ref(), self.dialect, &self.filters, shallow)
            .compile(&self.query_identifier, &self.query_string, substitutions)?;
        self.state = TranslatorState::Compiled(Arc::new(plan));
        Ok(())
    }

    /// The compiled plan and its metadata.
    pub fn plan(&self) -> Result<&CompiledPlan, QueryError> {
        match &self.state {
            TranslatorState::Compiled(plan) => Ok(plan),
            TranslatorState::Uncompiled => Err(QueryError::NotCompiled {
                query: self.query_string.clone(),
            }),
        }
    }

    fn shared_plan(&self) -> Result<Arc<CompiledPlan>, QueryError> {
        match &self.state {
            TranslatorState::Compiled(plan) => Ok(Arc::clone(plan)),
            TranslatorState::Uncompiled => Err(QueryError::NotCompiled {
                query: self.query_string.clone(),
            }),
        }
    }

    fn select_plan(&self, operation: &'static str) -> Result<&CompiledPlan, QueryError> {
        let plan = self.plan()?;
        if plan.is_manipulation() {
            return Err(QueryError::WrongMode {
                operation,
                kind: plan.kind().name(),
                query: self.query_string.clone(),
            });
        }
        Ok(plan)
    }

    /// Collection fetches cannot be streamed row by row.
    pub fn validate_scrollability(&self) -> Result<(), OqlError> {
        if self.plan()?.contains_collection_fetch() {
            return Err(QueryError::FetchWithScroll.into());
        }
        Ok(())
    }

    /// Run a select and return all results.
    pub async fn list(
        &self,
        conn: &mut AnyConnection,
        params: &QueryParameters,
    ) -> Result<Vec<QueryResult>, OqlError> {
        let plan = self.select_plan("list")?;
        let selection = params.selection();
        let in_memory = plan.contains_collection_fetch() && !selection.is_empty();
        if in_memory {
            warn!(
                query = %self.query_string,
                "firstResult/maxResults specified with collection fetch; applying in memory"
            );
        }

        let generator = self.dialect.generator();
        let paging = if in_memory { Paging::InMemory } else { Paging::Sql };
        let statements = engine::bind(plan, params, &self.filters, generator.as_ref(), paging)?;
        let Some(statement) = statements.last() else {
            return Ok(Vec::new());
        };

        let rows = engine::fetch_all(conn, statement).await?;
        let results = Hydrator::new(plan).rows(&rows)?;
        debug!(rows = rows.len(), results = results.len(), "list");

        Ok(if in_memory {
            selection.apply(results)
        } else {
            results
        })
    }

    /// Run a select and stream its results.
    pub async fn iterate<'a>(
        &'a self,
        conn: &'a mut AnyConnection,
        params: &QueryParameters,
    ) -> Result<ResultIter<'a>, OqlError> {
        self.select_plan("iterate")?;
        self.validate_scrollability()?;
        self.open(conn, params)
    }

    /// Run a select behind a bidirectional cursor.
    pub async fn scroll<'a>(
        &'a self,
        conn: &'a mut AnyConnection,
        params: &QueryParameters,
    ) -> Result<ScrollableResults<'a>, OqlError> {
        self.select_plan("scroll")?;
        self.validate_scrollability()?;
        Ok(ScrollableResults::new(self.open(conn, params)?))
    }

    fn open<'a>(
        &'a self,
        conn: &'a mut AnyConnection,
        params: &QueryParameters,
    ) -> Result<ResultIter<'a>, OqlError> {
        let plan = self.shared_plan()?;
        let generator = self.dialect.generator();
        let statement = engine::bind(&plan, params, &self.filters, generator.as_ref(), Paging::Sql)?
            .pop()
            .ok_or_else(|| QueryError::invalid("no statement to execute", &self.query_string))?;
        Ok(ResultIter::new(conn, plan, statement))
    }

    /// Run a bulk update or delete, returning the rows affected by its
    /// primary statement.
    pub async fn execute_update(
        &self,
        conn: &mut AnyConnection,
        params: &QueryParameters,
    ) -> Result<u64, OqlError> {
        let plan = self.plan()?;
        if !plan.is_manipulation() {
            return Err(QueryError::WrongMode {
                operation: "execute_update",
                kind: plan.kind().name(),
                query: self.query_string.clone(),
            }
            .into());
        }

        let generator = self.dialect.generator();
        let statements = engine::bind(plan, params, &self.filters, generator.as_ref(), Paging::Off)?;
        let mut affected = 0;
        for (i, statement) in statements.iter().enumerate() {
            affected = engine::execute(conn, statement).await?;
            if i + 1 < statements.len() {
                debug!(sql = %statement.sql, rows = affected, "cleanup statement");
            }
        }
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::sample_metamodel;
    use crate::plan::PlanKind;

    fn factory() -> TranslatorFactory {
        TranslatorFactory::new(Arc::new(sample_metamodel()), Dialect::Sqlite)
    }

    #[test]
    fn test_plan_before_compile() {
        let translator = factory().create_translator("q", "from Person", EnabledFilters::new());
        assert_eq!(translator.query_string(), "from Person");
        assert!(matches!(
            translator.plan(),
            Err(QueryError::NotCompiled { .. })
        ));
    }

    #[test]
    fn test_compile_is_idempotent() {
        let mut translator =
            factory().create_translator("q", "from Person p where p.age > :a", EnabledFilters::new());
        translator.compile(&BTreeMap::new(), false).unwrap();
        let sql = translator.plan().unwrap().sql().to_string();

        // Shallow is ignored once compiled.
        translator.compile(&BTreeMap::new(), true).unwrap();
        let plan = translator.plan().unwrap();
        assert_eq!(plan.sql(), sql);
        assert!(!plan.is_shallow());
    }

    #[test]
    fn test_compile_error_leaves_translator_uncompiled() {
        let mut translator =
            factory().create_translator("q", "from Nobody", EnabledFilters::new());
        assert!(translator.compile(&BTreeMap::new(), false).is_err());
        assert!(!translator.is_compiled());
    }

    #[test]
    fn test_validate_scrollability() {
        let mut translator = factory().create_translator(
            "q",
            "from Person p join fetch p.orders o",
            EnabledFilters::new(),
        );
        translator.compile(&BTreeMap::new(), false).unwrap();
        assert!(matches!(
            translator.validate_scrollability(),
            Err(OqlError::Query(QueryError::FetchWithScroll))
        ));

        let mut plain = factory().create_translator("q", "from Person p", EnabledFilters::new());
        plain.compile(&BTreeMap::new(), false).unwrap();
        assert!(plain.validate_scrollability().is_ok());
    }

    #[test]
    fn test_select_plan_rejects_manipulation() {
        let mut translator =
            factory().create_translator("q", "delete Person p", EnabledFilters::new());
        translator.compile(&BTreeMap::new(), false).unwrap();
        assert_eq!(
            translator.plan().unwrap().kind(),
            PlanKind::Manipulation(crate::plan::ManipulationKind::Delete)
        );
        let err = translator.select_plan("list").unwrap_err();
        assert_eq!(
            err.to_string(),
            "list() is not supported for delete statements: delete Person p"
        );
    }
}
