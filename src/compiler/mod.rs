//! Lowering of parsed statements into [`CompiledPlan`]s.
//!
//! Compilation resolves every path against the mapping model, renders SQL
//! into [`SqlBuffer`]s that keep placeholders symbolic, and only numbers the
//! placeholders once the final statements are assembled. Placeholder order
//! therefore always follows the text of the generated SQL.

mod dml;
mod expr;
mod scope;
mod select;

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::ast::Statement;
use crate::dialect::{Dialect, SqlGenerator};
use crate::error::{MappingError, OqlError, QueryError};
use crate::mapping::{EntityMapping, MappingResolver};
use crate::params::EnabledFilters;
use crate::parser;
use crate::plan::{
    CompiledPlan, DynamicResultType, ParameterBinding, ParameterSource, ParameterTranslations,
    PlanKind, ResultLayout, SqlFragment, SqlStatement,
};
use crate::types::SemanticType;

use scope::Scope;

/// SQL text with symbolic placeholders.
#[derive(Debug, Default)]
pub(crate) struct SqlBuffer {
    pieces: Vec<Piece>,
}

#[derive(Debug)]
enum Piece {
    Text(String),
    Param(PendingParam),
}

#[derive(Debug)]
pub(crate) struct PendingParam {
    pub source: ParameterSource,
    pub semantic_type: SemanticType,
    pub expandable: bool,
}

impl SqlBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(text: impl Into<String>) -> Self {
        let mut buffer = Self::new();
        buffer.push_str(&text.into());
        buffer
    }

    pub fn push_str(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        match self.pieces.last_mut() {
            Some(Piece::Text(last)) => last.push_str(text),
            _ => self.pieces.push(Piece::Text(text.to_string())),
        }
    }

    pub fn push_param(&mut self, param: PendingParam) {
        self.pieces.push(Piece::Param(param));
    }

    pub fn append(&mut self, other: SqlBuffer) {
        for piece in other.pieces {
            match piece {
                Piece::Text(text) => self.push_str(&text),
                Piece::Param(param) => self.push_param(param),
            }
        }
    }

    /// Allow every placeholder in the buffer to take a list of values.
    pub fn mark_expandable(&mut self) {
        for piece in &mut self.pieces {
            if let Piece::Param(param) = piece {
                param.expandable = true;
            }
        }
    }

    /// Join buffers with a separator.
    pub fn join(buffers: Vec<SqlBuffer>, separator: &str) -> SqlBuffer {
        let mut joined = SqlBuffer::new();
        for (i, buffer) in buffers.into_iter().enumerate() {
            if i > 0 {
                joined.push_str(separator);
            }
            joined.append(buffer);
        }
        joined
    }

    fn into_fragments(
        self,
        statement: usize,
        bindings: &mut Vec<ParameterBinding>,
    ) -> Vec<SqlFragment> {
        self.pieces
            .into_iter()
            .map(|piece| match piece {
                Piece::Text(text) => SqlFragment::Text(text),
                Piece::Param(param) => {
                    bindings.push(ParameterBinding {
                        source: param.source,
                        semantic_type: param.semantic_type,
                        expandable: param.expandable,
                        statement,
                    });
                    SqlFragment::Placeholder(bindings.len() - 1)
                }
            })
            .collect()
    }
}

/// Everything a select contributes to the plan beyond its SQL.
#[derive(Debug, Default)]
pub(crate) struct SelectShape {
    pub return_types: Vec<SemanticType>,
    pub return_aliases: Vec<Option<String>>,
    pub column_names: Vec<Vec<String>>,
    pub dynamic_result_type: Option<DynamicResultType>,
    pub layout: ResultLayout,
}

/// A statement lowered to SQL buffers, before placeholder numbering.
pub(crate) struct Lowered {
    pub kind: PlanKind,
    pub statements: Vec<SqlBuffer>,
    pub query_spaces: BTreeSet<String>,
    pub shape: SelectShape,
}

/// State shared by the lowering of one statement.
pub(crate) struct Lowering<'c> {
    resolver: &'c dyn MappingResolver,
    generator: &'c dyn SqlGenerator,
    filters: &'c EnabledFilters,
    /// Query text after substitution, for error messages.
    query: &'c str,
    shallow: bool,
    scope: Scope,
    query_spaces: BTreeSet<String>,
}

impl<'c> Lowering<'c> {
    fn entity(&self, name: &str) -> Result<&'c EntityMapping, MappingError> {
        let resolver: &'c dyn MappingResolver = self.resolver;
        resolver.entity(name)
    }

    fn invalid(&self, message: impl Into<String>) -> OqlError {
        QueryError::invalid(message, self.query).into()
    }
}

/// Compiles query text against a mapping model.
pub struct Compiler<'a> {
    resolver: &'a dyn MappingResolver,
    generator: Box<dyn SqlGenerator>,
    filters: &'a EnabledFilters,
    shallow: bool,
}

impl<'a> Compiler<'a> {
    pub fn new(
        resolver: &'a dyn MappingResolver,
        dialect: Dialect,
        filters: &'a EnabledFilters,
        shallow: bool,
    ) -> Self {
        Self {
            resolver,
            generator: dialect.generator(),
            filters,
            shallow,
        }
    }

    /// Substitute, parse and lower `query_string`.
    pub fn compile(
        &self,
        query_identifier: &str,
        query_string: &str,
        substitutions: &BTreeMap<String, String>,
    ) -> Result<CompiledPlan, OqlError> {
        let text = parser::substitute(query_string, substitutions)?;
        let statement = parser::parse(&text)?;

        let mut lowering = Lowering {
            resolver: self.resolver,
            generator: self.generator.as_ref(),
            filters: self.filters,
            query: &text,
            shallow: self.shallow,
            scope: Scope::default(),
            query_spaces: BTreeSet::new(),
        };
        let lowered = match &statement {
            Statement::Select(select) => lowering.lower_select(select)?,
            Statement::Update(update) => lowering.lower_update(update)?,
            Statement::Delete(delete) => lowering.lower_delete(delete)?,
        };

        let plan = self.assemble(query_identifier, query_string, lowered);
        debug!(
            query = %query_string,
            statements = plan.statements().len(),
            bindings = plan.parameter_bindings().len(),
            "compiled query"
        );
        Ok(plan)
    }

    fn assemble(&self, query_identifier: &str, query_string: &str, lowered: Lowered) -> CompiledPlan {
        let mut bindings = Vec::new();
        let statements = lowered
            .statements
            .into_iter()
            .enumerate()
            .map(|(index, buffer)| {
                let fragments = buffer.into_fragments(index, &mut bindings);
                SqlStatement::new(fragments, self.generator.as_ref())
            })
            .collect();
        let parameter_translations = ParameterTranslations::from_bindings(query_string, &bindings);

        CompiledPlan {
            query_identifier: query_identifier.to_string(),
            query_string: query_string.to_string(),
            enabled_filters: self.filters.names(),
            shallow: self.shallow,
            kind: lowered.kind,
            query_spaces: lowered.query_spaces,
            statements,
            parameter_bindings: bindings,
            parameter_translations,
            return_types: lowered.shape.return_types,
            return_aliases: lowered.shape.return_aliases,
            column_names: lowered.shape.column_names,
            dynamic_result_type: lowered.shape.dynamic_result_type,
            layout: lowered.shape.layout,
        }
    }
}
