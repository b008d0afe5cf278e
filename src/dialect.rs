//! SQL dialects.
//!
//! Generated SQL is dialect-neutral apart from the pieces routed through
//! [`SqlGenerator`]: placeholders, boolean literals, string concatenation,
//! pagination and row locking.

use serde::{Deserialize, Serialize};

use crate::params::LockMode;

/// Supported SQL dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Postgres,
    Sqlite,
    #[serde(rename = "mysql")]
    MySql,
}

impl Dialect {
    pub fn generator(&self) -> Box<dyn SqlGenerator> {
        match self {
            Dialect::Postgres => Box::new(PostgresGenerator),
            Dialect::Sqlite => Box::new(SqliteGenerator),
            Dialect::MySql => Box::new(MysqlGenerator),
        }
    }

    /// Guess the dialect from a database URL scheme.
    pub fn from_url(url: &str) -> Option<Self> {
        let scheme = url.split(':').next()?;
        match scheme {
            "postgres" | "postgresql" => Some(Dialect::Postgres),
            "sqlite" => Some(Dialect::Sqlite),
            "mysql" | "mariadb" => Some(Dialect::MySql),
            _ => None,
        }
    }
}

impl std::str::FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Dialect::Postgres),
            "sqlite" => Ok(Dialect::Sqlite),
            "mysql" | "mariadb" => Ok(Dialect::MySql),
            other => Err(format!("unknown dialect '{}'", other)),
        }
    }
}

/// Per-dialect SQL rendering.
pub trait SqlGenerator: Send + Sync {
    /// Placeholder for the 1-based parameter `index` within one statement.
    fn placeholder(&self, index: usize) -> String;

    fn bool_literal(&self, val: bool) -> String {
        if val { "true".to_string() } else { "false".to_string() }
    }

    /// Concatenate already rendered string expressions.
    fn string_concat(&self, parts: &[String]) -> String {
        format!("({})", parts.join(" || "))
    }

    /// Pagination suffix, empty when neither bound is set.
    fn limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        match (limit, offset) {
            (Some(l), Some(o)) if o > 0 => format!(" limit {} offset {}", l, o),
            (Some(l), _) => format!(" limit {}", l),
            (None, Some(o)) if o > 0 => format!(" offset {}", o),
            _ => String::new(),
        }
    }

    /// Row locking suffix for the given mode.
    fn lock_clause(&self, mode: LockMode) -> &'static str {
        match mode {
            LockMode::None => "",
            LockMode::Upgrade => " for update",
            LockMode::UpgradeNoWait => " for update nowait",
        }
    }
}

pub struct PostgresGenerator;

impl SqlGenerator for PostgresGenerator {
    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }
}

pub struct SqliteGenerator;

impl SqlGenerator for SqliteGenerator {
    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn bool_literal(&self, val: bool) -> String {
        if val { "1".to_string() } else { "0".to_string() }
    }

    fn limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        match (limit, offset) {
            (Some(l), Some(o)) if o > 0 => format!(" limit {} offset {}", l, o),
            (Some(l), _) => format!(" limit {}", l),
            // SQLite cannot offset without a limit.
            (None, Some(o)) if o > 0 => format!(" limit -1 offset {}", o),
            _ => String::new(),
        }
    }

    fn lock_clause(&self, _mode: LockMode) -> &'static str {
        ""
    }
}

pub struct MysqlGenerator;

impl SqlGenerator for MysqlGenerator {
    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn string_concat(&self, parts: &[String]) -> String {
        format!("concat({})", parts.join(", "))
    }

    fn limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        match (limit, offset) {
            (Some(l), Some(o)) if o > 0 => format!(" limit {} offset {}", l, o),
            (Some(l), _) => format!(" limit {}", l),
            (None, Some(o)) if o > 0 => format!(" limit 18446744073709551615 offset {}", o),
            _ => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(Dialect::Postgres.generator().placeholder(3), "$3");
        assert_eq!(Dialect::Sqlite.generator().placeholder(3), "?");
        assert_eq!(Dialect::MySql.generator().placeholder(1), "?");
    }

    #[test]
    fn test_pagination() {
        let pg = Dialect::Postgres.generator();
        assert_eq!(pg.limit_offset(Some(10), Some(20)), " limit 10 offset 20");
        assert_eq!(pg.limit_offset(None, None), "");
        assert_eq!(
            Dialect::Sqlite.generator().limit_offset(None, Some(5)),
            " limit -1 offset 5"
        );
    }

    #[test]
    fn test_concat_and_booleans() {
        let parts = vec!["a.x".to_string(), "'-'".to_string()];
        assert_eq!(Dialect::Postgres.generator().string_concat(&parts), "(a.x || '-')");
        assert_eq!(Dialect::MySql.generator().string_concat(&parts), "concat(a.x, '-')");
        assert_eq!(Dialect::Sqlite.generator().bool_literal(true), "1");
    }

    #[test]
    fn test_parse_dialect() {
        assert_eq!("PostgreSQL".parse::<Dialect>(), Ok(Dialect::Postgres));
        assert_eq!(Dialect::from_url("sqlite::memory:"), Some(Dialect::Sqlite));
        assert!("oracle".parse::<Dialect>().is_err());
    }
}
