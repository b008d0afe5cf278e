//! # oql
//!
//! Object queries compiled to SQL.
//!
//! Queries are written against mapped entities and their properties, compiled
//! once into a [`CompiledPlan`](plan::CompiledPlan) and then executed any
//! number of times through `sqlx`.
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use oql::prelude::*;
//!
//! let model = Metamodel::from_file("mapping.toml")?;
//! let factory = TranslatorFactory::new(Arc::new(model), Dialect::Postgres);
//!
//! let mut translator = factory.create_translator(
//!     "adults",
//!     "select p.name from Person p where p.age >= :minAge order by p.name",
//!     EnabledFilters::new(),
//! );
//! translator.compile(&BTreeMap::new(), false)?;
//! // => "select person0_.name as col_0_0_ from person person0_ where person0_.age >= $1 order by person0_.name"
//!
//! let names = translator
//!     .list(&mut conn, &QueryParameters::new().with("minAge", 18))
//!     .await?;
//! ```
//!
//! ## Statements
//!
//! | Form                                  | Execution        |
//! |---------------------------------------|------------------|
//! | `[select ...] from ... [where ...]`   | `list`, `iterate`, `scroll` |
//! | `update Entity set p = v [where ...]` | `execute_update` |
//! | `delete [from] Entity [where ...]`    | `execute_update` |

pub mod ast;
pub mod compiler;
pub mod config;
pub mod cursor;
pub mod dialect;
pub mod engine;
pub mod error;
pub mod hydrate;
pub mod mapping;
pub mod params;
pub mod parser;
pub mod plan;
pub mod translator;
pub mod types;

pub mod prelude {
    pub use crate::cursor::{ResultIter, ScrollableResults};
    pub use crate::dialect::Dialect;
    pub use crate::error::*;
    pub use crate::hydrate::{DynamicInstance, EntityInstance, QueryResult, ResultValue};
    pub use crate::mapping::{EntityMapping, MappingResolver, Metamodel, PropertyKind};
    pub use crate::params::{EnabledFilter, EnabledFilters, LockMode, QueryParameters};
    pub use crate::plan::{CompiledPlan, ParameterTranslations, PlanKind};
    pub use crate::translator::{Translator, TranslatorFactory};
    pub use crate::types::{ParamValue, SemanticType, Value};
}

/// Parse a query string into a statement AST.
///
/// # Example
///
/// ```
/// use oql::parse;
///
/// let statement = parse("from Person p where p.age > :minAge").unwrap();
/// assert!(matches!(statement, oql::ast::Statement::Select(_)));
/// ```
pub fn parse(input: &str) -> Result<ast::Statement, error::QueryError> {
    parser::parse(input)
}
