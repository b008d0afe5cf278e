//! oql: compile and run object queries from the command line.
//!
//! # Usage
//!
//! ```bash
//! # Show the generated SQL
//! oql "from Person p where p.age >= :minAge" --mapping mapping.toml --dry-run
//!
//! # Execute with parameters
//! oql "select p.name from Person p where p.age >= :minAge" \
//!     --mapping mapping.toml --bind minAge=18 --database-url sqlite://app.db
//!
//! # Bulk statements report affected rows
//! oql "delete Person p where p.age < :cutoff" --bind cutoff=18
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use oql::config::Settings;
use oql::mapping::PropertyKind;
use oql::prelude::*;
use sqlx::{AnyConnection, Connection};

#[derive(Parser)]
#[command(name = "oql")]
#[command(version)]
#[command(about = "Compile object queries to SQL and run them", long_about = None)]
#[command(after_help = "EXAMPLES:
    oql 'from Person p where p.age >= :minAge' --bind minAge=18
    oql 'select p.name from Person p where p.id in (:ids)' --bind ids=[1,2,3] --dry-run
    oql 'update Person set age = age + 1 where id = ?1' --bind 1=7
    oql explain 'from Person p join fetch p.orders'")]
struct Cli {
    /// The query to execute
    query: Option<String>,

    /// Mapping model (TOML)
    #[arg(short, long)]
    mapping: Option<PathBuf>,

    /// SQL dialect; defaults to the one implied by the database URL
    #[arg(long, value_parser = parse_dialect)]
    dialect: Option<Dialect>,

    /// Select entities as identifiers only
    #[arg(long)]
    shallow: bool,

    /// Query text substitutions (name=value)
    #[arg(short, long = "substitute")]
    substitutions: Vec<String>,

    /// Parameter values (name=value or ordinal=value; [a,b] for lists)
    #[arg(short, long)]
    bind: Vec<String>,

    /// Enable a filter (name or name:param=value,...)
    #[arg(long = "filter")]
    filters: Vec<String>,

    /// Skip this many results
    #[arg(long)]
    first: Option<u64>,

    /// Return at most this many results
    #[arg(long)]
    max: Option<u64>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    format: OutputFormat,

    /// Database connection URL
    #[arg(long, env = "OQL_DATABASE_URL")]
    database_url: Option<String>,

    /// Don't execute, just show the generated SQL
    #[arg(short, long)]
    dry_run: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a query and describe its plan
    Explain {
        /// The query to explain
        query: String,
    },
    /// List the mapped entities
    Entities,
}

fn parse_dialect(s: &str) -> Result<Dialect, String> {
    s.parse()
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match &cli.command {
        Some(Commands::Explain { query }) => {
            load(&cli).and_then(|ctx| explain_query(&ctx, query, &cli.format))
        }
        Some(Commands::Entities) => load(&cli).and_then(|ctx| list_entities(&ctx)),
        None => match &cli.query {
            Some(query) => match load(&cli) {
                Ok(ctx) => execute_query(&ctx, query, &cli).await,
                Err(e) => Err(e),
            },
            None => {
                println!("{}", "oql: object queries to SQL".cyan().bold());
                println!();
                println!("Usage: oql <QUERY> [OPTIONS]");
                println!();
                println!("Try: oql --help");
                Ok(())
            }
        },
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "oql=debug" } else { "oql=warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Everything a command needs, merged from settings and flags.
struct Session {
    factory: TranslatorFactory,
    model: Arc<Metamodel>,
    substitutions: BTreeMap<String, String>,
    database_url: Option<String>,
}

fn load(cli: &Cli) -> Result<Session> {
    let settings = Settings::load()?;

    let mapping = cli
        .mapping
        .clone()
        .or(settings.mapping.clone())
        .ok_or_else(|| anyhow!("no mapping model; use --mapping or set `mapping` in oql.toml"))?;
    let model = Arc::new(
        Metamodel::from_file(&mapping)
            .with_context(|| format!("loading mapping {}", mapping.display()))?,
    );

    let database_url = cli.database_url.clone().or(settings.database_url.clone());
    let dialect = cli.dialect.unwrap_or_else(|| {
        Settings {
            database_url: database_url.clone(),
            ..settings.clone()
        }
        .resolve_dialect()
    });

    let mut substitutions = settings.substitutions;
    for pair in &cli.substitutions {
        let (key, value) = split_pair(pair)?;
        substitutions.insert(key.to_string(), value.to_string());
    }

    Ok(Session {
        factory: TranslatorFactory::new(model.clone(), dialect),
        model,
        substitutions,
        database_url,
    })
}

fn split_pair(pair: &str) -> Result<(&str, &str)> {
    pair.split_once('=')
        .ok_or_else(|| anyhow!("expected name=value, got '{}'", pair))
}

/// Numbers, booleans and `null` are typed; anything else is a string.
fn parse_value(raw: &str) -> Value {
    if let Ok(n) = raw.parse::<i64>() {
        Value::Int(n)
    } else if let Ok(f) = raw.parse::<f64>() {
        Value::Float(f)
    } else if raw == "true" {
        Value::Bool(true)
    } else if raw == "false" {
        Value::Bool(false)
    } else if raw == "null" {
        Value::Null
    } else {
        Value::String(raw.to_string())
    }
}

fn parse_param(raw: &str) -> ParamValue {
    match raw.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
        Some(items) => ParamValue::List(
            items
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(parse_value)
                .collect(),
        ),
        None => ParamValue::Single(parse_value(raw)),
    }
}

fn parameters(cli: &Cli) -> Result<QueryParameters> {
    let mut params = QueryParameters::new();
    for pair in &cli.bind {
        let (name, raw) = split_pair(pair)?;
        match name.parse::<u32>() {
            Ok(position) => params.set_ordinal(position, parse_param(raw)),
            Err(_) => params.set(name, parse_param(raw)),
        }
    }
    if let Some(first) = cli.first {
        params = params.first_result(first);
    }
    if let Some(max) = cli.max {
        params = params.max_results(max);
    }
    Ok(params)
}

fn enabled_filters(cli: &Cli) -> Result<EnabledFilters> {
    let mut filters = EnabledFilters::new();
    for arg in &cli.filters {
        let (name, args) = arg.split_once(':').unwrap_or((arg.as_str(), ""));
        let mut filter = EnabledFilter::new(name);
        for pair in args.split(',').filter(|s| !s.is_empty()) {
            let (param, raw) = split_pair(pair)?;
            filter = filter.with_parameter(param, parse_value(raw));
        }
        filters.enable(filter);
    }
    Ok(filters)
}

fn compile(ctx: &Session, query: &str, cli: &Cli) -> Result<Translator> {
    let mut translator = ctx
        .factory
        .create_translator("cli", query, enabled_filters(cli)?);
    translator.compile(&ctx.substitutions, cli.shallow)?;
    Ok(translator)
}

async fn execute_query(ctx: &Session, query: &str, cli: &Cli) -> Result<()> {
    if cli.verbose {
        println!("{} {}", "Input:".dimmed(), query.yellow());
    }

    let translator = compile(ctx, query, cli)?;
    let plan = translator.plan()?;
    let params = parameters(cli)?;

    let Some(url) = ctx.database_url.as_deref().filter(|_| !cli.dry_run) else {
        print_sql(plan);
        if !cli.bind.is_empty() {
            println!();
            println!("{}", "Bindings:".cyan());
            for pair in &cli.bind {
                println!("  {}", pair.yellow());
            }
        }
        plan.parameter_translations().validate(&params)?;
        if ctx.database_url.is_none() && !cli.dry_run {
            println!();
            println!(
                "{}",
                "No database URL. Use --database-url or set OQL_DATABASE_URL".yellow()
            );
        }
        return Ok(());
    };

    if cli.verbose {
        println!("{} {}", "Connecting to:".dimmed(), url);
    }
    sqlx::any::install_default_drivers();
    let mut conn = AnyConnection::connect(url)
        .await
        .with_context(|| format!("connecting to {}", url))?;

    if plan.is_manipulation() {
        let affected = translator.execute_update(&mut conn, &params).await?;
        println!("{} {} rows affected", "✓".green(), affected);
    } else {
        let results = translator.list(&mut conn, &params).await?;
        format_output(plan, &results, &cli.format)?;
    }
    conn.close().await?;
    Ok(())
}

fn print_sql(plan: &CompiledPlan) {
    println!("{}", "Generated SQL:".green().bold());
    for sql in plan.sql_statements() {
        println!("{}", sql.white());
    }
}

fn format_output(plan: &CompiledPlan, results: &[QueryResult], format: &OutputFormat) -> Result<()> {
    if results.is_empty() {
        println!("{}", "(no results)".dimmed());
        return Ok(());
    }

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(results)?);
        }
        OutputFormat::Table => {
            let columns: Vec<String> = plan
                .return_aliases()
                .iter()
                .zip(plan.return_types())
                .enumerate()
                .map(|(i, (alias, ty))| alias.clone().unwrap_or_else(|| format!("{}:{}", i, ty)))
                .collect();

            let rows: Vec<Vec<String>> = results
                .iter()
                .map(|result| {
                    (0..columns.len())
                        .map(|i| result.get(i).map(cell).unwrap_or_default())
                        .collect()
                })
                .collect();

            let mut widths: Vec<usize> = columns.iter().map(|c| c.chars().count()).collect();
            for row in &rows {
                for (w, value) in widths.iter_mut().zip(row) {
                    *w = (*w).max(value.chars().count());
                }
            }

            let header: Vec<String> = columns
                .iter()
                .zip(&widths)
                .map(|(c, w)| format!("{:width$}", c, width = w))
                .collect();
            println!("{}", header.join(" │ ").white().bold());

            let sep: Vec<String> = widths.iter().map(|w| "─".repeat(*w)).collect();
            println!("{}", sep.join("─┼─").dimmed());

            for row in &rows {
                let cells: Vec<String> = row
                    .iter()
                    .zip(&widths)
                    .map(|(v, w)| format!("{:width$}", v, width = w))
                    .collect();
                println!("{}", cells.join(" │ "));
            }

            println!();
            println!("{} row(s) returned", results.len().to_string().cyan());
        }
    }
    Ok(())
}

fn cell(value: &ResultValue) -> String {
    match value {
        ResultValue::Scalar(Value::Null) => "NULL".to_string(),
        ResultValue::Scalar(v) => v.to_string(),
        ResultValue::Reference { entity, id } => format!("{}#{}", entity, id),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Parse a query the way `compile` sees it, after substitutions.
fn parse_substituted(
    query: &str,
    substitutions: &BTreeMap<String, String>,
) -> Result<oql::ast::Statement> {
    let substituted = oql::parser::substitute(query, substitutions)?;
    Ok(oql::parse(&substituted)?)
}

fn explain_query(ctx: &Session, query: &str, format: &OutputFormat) -> Result<()> {
    if let OutputFormat::Json = format {
        let mut translator = ctx
            .factory
            .create_translator("explain", query, EnabledFilters::new());
        translator.compile(&ctx.substitutions, false)?;
        println!("{}", serde_json::to_string_pretty(translator.plan()?)?);
        return Ok(());
    }

    println!("{}", "Query Explanation".cyan().bold());
    println!();
    println!("{} {}", "Query:".dimmed(), query.yellow());
    println!();

    let statement = parse_substituted(query, &ctx.substitutions)?;
    println!("{}", "Parsed:".green().bold());
    println!("  {}", statement.to_string().white());
    println!();

    let mut translator = ctx
        .factory
        .create_translator("explain", query, EnabledFilters::new());
    translator.compile(&ctx.substitutions, false)?;
    let plan = translator.plan()?;

    println!("  {} {}", "Kind:".dimmed(), plan.kind().name().cyan());
    let spaces: Vec<&str> = plan.query_spaces().iter().map(String::as_str).collect();
    println!("  {} {}", "Tables:".dimmed(), spaces.join(", ").white());

    if !plan.return_types().is_empty() {
        println!("  {}", "Returns:".dimmed());
        for ((ty, alias), columns) in plan
            .return_types()
            .iter()
            .zip(plan.return_aliases())
            .zip(plan.column_names())
        {
            let alias = alias.as_deref().map(|a| format!(" as {}", a)).unwrap_or_default();
            println!("    • {}{} [{}]", ty.to_string().white(), alias, columns.join(", ").dimmed());
        }
    }

    if !plan.parameter_bindings().is_empty() {
        println!("  {}", "Parameters:".dimmed());
        for (i, binding) in plan.parameter_bindings().iter().enumerate() {
            let list = if binding.expandable { " (list)" } else { "" };
            println!(
                "    {} {} {}{}",
                format!("#{}", i + 1).dimmed(),
                binding.source.to_string().yellow(),
                binding.semantic_type.to_string().cyan(),
                list
            );
        }
    }

    if plan.contains_collection_fetch() {
        println!("  {}", "Contains a collection fetch: iterate/scroll unavailable".yellow());
    }

    println!();
    print_sql(plan);
    Ok(())
}

fn list_entities(ctx: &Session) -> Result<()> {
    let names = ctx.model.entity_names();
    if names.is_empty() {
        bail!("the mapping model has no entities");
    }
    for name in names {
        let entity = ctx.model.entity(name)?;
        println!("{} {}", entity.name.cyan().bold(), format!("({})", entity.table).dimmed());
        println!("    {} {}", entity.identifier.name.white(), "id".dimmed());
        for property in &entity.properties {
            let kind = match &property.kind {
                PropertyKind::Basic { semantic_type, .. } => semantic_type.to_string(),
                PropertyKind::Component { component, .. } => format!("component {}", component),
                PropertyKind::ManyToOne { target, .. } => format!("→ {}", target),
                PropertyKind::OneToMany { target, .. } => format!("→ [{}]", target),
                PropertyKind::ManyToMany { target, table, .. } => {
                    format!("→ [{}] via {}", target, table)
                }
            };
            println!("    {} {}", property.name.white(), kind.dimmed());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explain_parses_after_substitution() {
        let mut subs = BTreeMap::new();
        subs.insert("adult".to_string(), "p.age >= 18".to_string());
        let statement = parse_substituted("from Person p where {adult}", &subs).unwrap();
        assert_eq!(statement.to_string(), "from Person p where p.age >= 18");

        assert!(parse_substituted("from Person p where {missing}", &subs).is_err());
    }
}
