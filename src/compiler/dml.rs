//! Lowering of bulk `update` and `delete` statements.
//!
//! Bulk statements address a single table with unqualified columns and never
//! join. Enabled filters do not apply to them.

use super::scope::Resolved;
use super::{Lowered, Lowering, SelectShape, SqlBuffer};
use crate::ast::{DeleteStatement, Expr, UpdateStatement};
use crate::error::OqlError;
use crate::mapping::PropertyKind;
use crate::plan::{ManipulationKind, PlanKind};
use crate::types::SemanticType;

impl Lowering<'_> {
    pub(super) fn lower_update(&mut self, stmt: &UpdateStatement) -> Result<Lowered, OqlError> {
        self.scope.bulk = true;
        let root = self.add_root(&stmt.entity, stmt.alias.as_deref())?;

        let mut assignments = Vec::new();
        for assignment in &stmt.assignments {
            let (column, semantic_type) = match self.resolve_path(&assignment.path)? {
                Resolved::Column { sql, semantic_type } => (sql, semantic_type),
                Resolved::Reference { target, fk_sql, .. } => (fk_sql, SemanticType::Entity(target)),
                _ => {
                    return Err(self.invalid(format!(
                        "only basic properties and many-to-one references can be assigned [{}]",
                        assignment.path.join(".")
                    )));
                }
            };
            let value = self.expr(&assignment.value, Some(&semantic_type))?;
            let mut sql = SqlBuffer::text(format!("{} = ", column));
            sql.append(value.sql);
            assignments.push(sql);
        }

        let mut sql = SqlBuffer::text(format!("update {} set ", self.scope.element(root).table));
        sql.append(SqlBuffer::join(assignments, ", "));
        sql.append(self.where_suffix(stmt.where_clause.as_ref())?);

        Ok(self.manipulation(ManipulationKind::Update, vec![sql]))
    }

    /// A delete removes join table rows of the entity's many-to-many
    /// collections first, then the entity rows.
    pub(super) fn lower_delete(&mut self, stmt: &DeleteStatement) -> Result<Lowered, OqlError> {
        self.scope.bulk = true;
        let root = self.add_root(&stmt.entity, stmt.alias.as_deref())?;
        let mapping = self.entity(&self.scope.element(root).entity)?;

        let mut statements = Vec::new();
        for property in &mapping.properties {
            let PropertyKind::ManyToMany {
                table, key_column, ..
            } = &property.kind
            else {
                continue;
            };
            self.query_spaces.insert(table.clone());

            let mut cleanup = SqlBuffer::text(format!(
                "delete from {} where {} in (select {} from {}",
                table, key_column, mapping.identifier.column, mapping.table
            ));
            cleanup.append(self.where_suffix(stmt.where_clause.as_ref())?);
            cleanup.push_str(")");
            statements.push(cleanup);
        }

        let mut sql = SqlBuffer::text(format!("delete from {}", mapping.table));
        sql.append(self.where_suffix(stmt.where_clause.as_ref())?);
        statements.push(sql);

        Ok(self.manipulation(ManipulationKind::Delete, statements))
    }

    fn where_suffix(&mut self, condition: Option<&Expr>) -> Result<SqlBuffer, OqlError> {
        let Some(condition) = condition else {
            return Ok(SqlBuffer::new());
        };
        let rendered = self.expr(condition, Some(&SemanticType::Boolean))?;
        let mut sql = SqlBuffer::text(" where ");
        sql.append(rendered.sql);
        Ok(sql)
    }

    fn manipulation(&mut self, kind: ManipulationKind, statements: Vec<SqlBuffer>) -> Lowered {
        Lowered {
            kind: PlanKind::Manipulation(kind),
            statements,
            query_spaces: std::mem::take(&mut self.query_spaces),
            shape: SelectShape::default(),
        }
    }
}
