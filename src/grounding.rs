//! Schema grounding of generated query text.
//!
//! Guarantees that no query reaching a backend names a table, column, node
//! label, property or relationship type the [`SchemaDescriptor`] does not
//! declare.
//!
//! - **SQL**: parsed with `sqlparser` in the dialect of the configured
//!   store. Every relation in the statement tree must be a declared table
//!   (names bound by `WITH` excepted) and every column reference must be a
//!   column of one of those tables, a projection alias or an alias column
//!   list. SQL that does not parse is rejected.
//! - **Cypher**: string literals are blanked, then node patterns
//!   `(v:Label)`, relationship patterns `[r:TYPE|OTHER]` and property
//!   accesses `v.prop` are scanned. A property on a variable bound to a
//!   label must be declared on that label. Names are case-sensitive.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::ControlFlow;
use std::sync::OnceLock;

use regex::Regex;
use sqlparser::ast::{
    Expr, ObjectName, Query, SelectItem, SetExpr, TableAlias, TableFactor, Visit, Visitor,
};
use sqlparser::dialect::{PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use thiserror::Error;

use crate::inference::strip_code_fence;
use crate::models::ToolName;
use crate::schema::SchemaDescriptor;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GroundingViolation {
    #[error("query is empty")]
    Empty,
    #[error("query does not parse as {dialect} SQL: {message}")]
    Unparseable { dialect: SqlDialect, message: String },
    #[error("unknown table `{0}`")]
    UnknownTable(String),
    #[error("unknown column `{0}`")]
    UnknownColumn(String),
    #[error("unknown node label `{0}`")]
    UnknownLabel(String),
    #[error("unknown relationship type `{0}`")]
    UnknownRelation(String),
    #[error("unknown property `{property}` on `{owner}`")]
    UnknownProperty { owner: String, property: String },
}

/// SQL dialect of the tabular store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SqlDialect {
    #[default]
    Sqlite,
    Postgres,
}

impl SqlDialect {
    /// Dialect for a `tabular.kind` value.
    pub fn for_kind(kind: &str) -> Self {
        match kind {
            "postgres" => SqlDialect::Postgres,
            _ => SqlDialect::Sqlite,
        }
    }

    fn parse(self, sql: &str) -> Result<Vec<sqlparser::ast::Statement>, GroundingViolation> {
        let parsed = match self {
            SqlDialect::Sqlite => Parser::parse_sql(&SQLiteDialect {}, sql),
            SqlDialect::Postgres => Parser::parse_sql(&PostgreSqlDialect {}, sql),
        };
        parsed.map_err(|e| GroundingViolation::Unparseable {
            dialect: self,
            message: e.to_string(),
        })
    }
}

impl fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlDialect::Sqlite => f.write_str("SQLite"),
            SqlDialect::Postgres => f.write_str("PostgreSQL"),
        }
    }
}

/// Strip a markdown fence and surrounding whitespace. Trailing semicolons
/// are dropped from Cypher, which the HTTP endpoint rejects.
pub fn normalize_query(tool: ToolName, text: &str) -> String {
    let body = strip_code_fence(text);
    match tool {
        ToolName::Graph => body.trim_end_matches(';').trim_end().to_string(),
        _ => body.to_string(),
    }
}

/// Check that `query` only references names declared in `schema`.
pub fn check_query(
    schema: &SchemaDescriptor,
    dialect: SqlDialect,
    tool: ToolName,
    query: &str,
) -> Result<(), GroundingViolation> {
    if query.trim().is_empty() {
        return Err(GroundingViolation::Empty);
    }
    match tool {
        ToolName::Tabular => check_sql(schema, dialect, query),
        ToolName::Graph => check_cypher(schema, query),
        ToolName::Unsupported => Ok(()),
    }
}

// ============ SQL ============

/// Names collected from one SQL text.
#[derive(Default)]
struct SqlNames {
    ctes: HashSet<String>,
    tables: Vec<String>,
    columns: Vec<String>,
    aliases: HashSet<String>,
}

impl SqlNames {
    fn alias(&mut self, alias: &TableAlias) {
        self.aliases.insert(alias.name.value.to_lowercase());
        for col in &alias.columns {
            self.aliases.insert(col.value.to_lowercase());
        }
    }
}

impl Visitor for SqlNames {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes.insert(cte.alias.name.value.to_lowercase());
                self.alias(&cte.alias);
            }
        }
        projection_aliases(&query.body, &mut self.aliases);
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        if let Some(ident) = relation.0.last() {
            self.tables.push(ident.value.clone());
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<Self::Break> {
        if let TableFactor::Table { alias: Some(alias), .. }
        | TableFactor::Derived { alias: Some(alias), .. } = factor
        {
            self.alias(alias);
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(ident) => self.columns.push(ident.value.clone()),
            Expr::CompoundIdentifier(parts) => {
                if let Some(last) = parts.last() {
                    self.columns.push(last.value.clone());
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

fn projection_aliases(body: &SetExpr, out: &mut HashSet<String>) {
    match body {
        SetExpr::Select(select) => {
            for item in &select.projection {
                if let SelectItem::ExprWithAlias { alias, .. } = item {
                    out.insert(alias.value.to_lowercase());
                }
            }
        }
        SetExpr::SetOperation { left, right, .. } => {
            projection_aliases(left, out);
            projection_aliases(right, out);
        }
        _ => {}
    }
}

/// Table names referenced by `sql`, excluding CTE names.
pub fn referenced_tables(dialect: SqlDialect, sql: &str) -> Result<Vec<String>, GroundingViolation> {
    Ok(collect_sql_names(dialect, sql)?.tables)
}

fn collect_sql_names(dialect: SqlDialect, sql: &str) -> Result<SqlNames, GroundingViolation> {
    let statements = dialect.parse(sql)?;
    let mut names = SqlNames::default();
    for statement in &statements {
        let _ = statement.visit(&mut names);
    }
    let ctes = names.ctes.clone();
    names.tables.retain(|t| !ctes.contains(&t.to_lowercase()));
    Ok(names)
}

fn check_sql(
    schema: &SchemaDescriptor,
    dialect: SqlDialect,
    sql: &str,
) -> Result<(), GroundingViolation> {
    let names = collect_sql_names(dialect, sql)?;

    let mut tables = Vec::new();
    for name in &names.tables {
        match schema.table(name) {
            Some(table) => tables.push(table),
            None => return Err(GroundingViolation::UnknownTable(name.clone())),
        }
    }

    let unknown = names.columns.into_iter().find(|col| {
        !names.aliases.contains(&col.to_lowercase())
            && !tables
                .iter()
                .any(|t| t.columns.iter().any(|c| c.name.eq_ignore_ascii_case(col)))
    });
    match unknown {
        Some(col) => Err(GroundingViolation::UnknownColumn(col)),
        None => Ok(()),
    }
}

// ============ Cypher ============

struct CypherPatterns {
    string_literal: Regex,
    node: Regex,
    relationship: Regex,
    property: Regex,
    name: Regex,
}

fn cypher_patterns() -> &'static CypherPatterns {
    static PATTERNS: OnceLock<CypherPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| CypherPatterns {
        string_literal: Regex::new(r#"'(?:[^'\\]|\\.)*'|"(?:[^"\\]|\\.)*""#)
            .expect("string literal pattern"),
        node: Regex::new(r"\(\s*([A-Za-z_]\w*)?\s*((?::\s*`?\w+`?\s*)+)")
            .expect("node pattern"),
        relationship: Regex::new(
            r"\[\s*([A-Za-z_]\w*)?\s*:\s*(`?\w+`?(?:\s*\|\s*:?\s*`?\w+`?)*)",
        )
        .expect("relationship pattern"),
        property: Regex::new(r"\b([A-Za-z_]\w*)\.([A-Za-z_]\w*)").expect("property pattern"),
        name: Regex::new(r"\w+").expect("name pattern"),
    })
}

/// Pattern elements of one Cypher text: the names in order of appearance
/// and the variables bound to them.
#[derive(Default)]
struct GraphNames {
    labels: Vec<String>,
    relations: Vec<String>,
    node_vars: HashMap<String, Vec<String>>,
    rel_vars: HashMap<String, Vec<String>>,
    properties: Vec<(String, String)>,
}

fn collect_graph_names(cypher: &str) -> GraphNames {
    let p = cypher_patterns();
    let text = p.string_literal.replace_all(cypher, "''");
    let names_in = |m: Option<regex::Match<'_>>| -> Vec<String> {
        p.name
            .find_iter(m.map_or("", |m| m.as_str()))
            .map(|m| m.as_str().to_string())
            .collect()
    };

    let mut out = GraphNames::default();
    for c in p.node.captures_iter(&text) {
        let labels = names_in(c.get(2));
        if let Some(var) = c.get(1) {
            out.node_vars
                .entry(var.as_str().to_string())
                .or_default()
                .extend(labels.iter().cloned());
        }
        out.labels.extend(labels);
    }
    for c in p.relationship.captures_iter(&text) {
        let types = names_in(c.get(2));
        if let Some(var) = c.get(1) {
            out.rel_vars
                .entry(var.as_str().to_string())
                .or_default()
                .extend(types.iter().cloned());
        }
        out.relations.extend(types);
    }
    out.properties = p
        .property
        .captures_iter(&text)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect();
    out
}

/// Node labels and relationship types referenced by `cypher`.
pub fn referenced_graph_names(cypher: &str) -> (Vec<String>, Vec<String>) {
    let names = collect_graph_names(cypher);
    (names.labels, names.relations)
}

fn check_cypher(schema: &SchemaDescriptor, cypher: &str) -> Result<(), GroundingViolation> {
    let names = collect_graph_names(cypher);
    if let Some(label) = names.labels.iter().find(|l| !schema.has_label(l)) {
        return Err(GroundingViolation::UnknownLabel(label.clone()));
    }
    if let Some(rel) = names.relations.iter().find(|r| !schema.has_relation_type(r)) {
        return Err(GroundingViolation::UnknownRelation(rel.clone()));
    }

    for (var, property) in &names.properties {
        // edges declare no properties
        if let Some(types) = names.rel_vars.get(var) {
            return Err(GroundingViolation::UnknownProperty {
                owner: types.join("|"),
                property: property.clone(),
            });
        }
        let Some(labels) = names.node_vars.get(var) else {
            continue;
        };
        let declared = labels
            .iter()
            .filter_map(|l| schema.node(l))
            .any(|n| n.properties.iter().any(|p| p == property));
        if !declared {
            return Err(GroundingViolation::UnknownProperty {
                owner: labels.join(":"),
                property: property.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::shop_schema;

    fn check_sql_text(sql: &str) -> Result<(), GroundingViolation> {
        check_query(&shop_schema(), SqlDialect::Sqlite, ToolName::Tabular, sql)
    }

    fn check_cypher_text(cypher: &str) -> Result<(), GroundingViolation> {
        check_query(&shop_schema(), SqlDialect::Sqlite, ToolName::Graph, cypher)
    }

    #[test]
    fn test_sql_known_tables_pass() {
        let sql = "SELECT s.seller_name, COUNT(p.id) AS product_count \
                   FROM shops s JOIN products p ON p.shop_id = s.id \
                   GROUP BY s.seller_name ORDER BY product_count DESC";
        assert_eq!(check_sql_text(sql), Ok(()));
    }

    #[test]
    fn test_sql_unknown_table_rejected() {
        let sql = "SELECT * FROM products p JOIN orders o ON o.product_id = p.id";
        assert_eq!(
            check_sql_text(sql),
            Err(GroundingViolation::UnknownTable("orders".into()))
        );
    }

    #[test]
    fn test_sql_cte_and_subquery() {
        let sql = "WITH priced AS (SELECT shop_id FROM products WHERE price_actual > 10) \
                   SELECT * FROM priced WHERE shop_id IN (SELECT id FROM shops)";
        assert_eq!(check_sql_text(sql), Ok(()));

        let sql = "SELECT * FROM shops WHERE id IN (SELECT shop_id FROM listings)";
        assert!(check_sql_text(sql).is_err());
    }

    #[test]
    fn test_sql_qualified_and_case_insensitive() {
        assert_eq!(check_sql_text("SELECT TITLE FROM main.PRODUCTS"), Ok(()));
    }

    #[test]
    fn test_sql_unknown_column_rejected() {
        assert_eq!(
            check_sql_text("SELECT password_hash FROM shops"),
            Err(GroundingViolation::UnknownColumn("password_hash".into()))
        );
        // SQLite would read an unknown double-quoted name as a string
        assert_eq!(
            check_sql_text("SELECT \"owner_email\" FROM shops"),
            Err(GroundingViolation::UnknownColumn("owner_email".into()))
        );
        // a column of a table the query does not read
        assert_eq!(
            check_sql_text("SELECT s.title FROM shops s"),
            Err(GroundingViolation::UnknownColumn("title".into()))
        );
    }

    #[test]
    fn test_sql_aliases_are_not_columns() {
        let sql = "WITH counts(shop, n) AS (SELECT shop_id, COUNT(*) FROM products GROUP BY shop_id) \
                   SELECT c.shop, c.n AS total FROM counts c WHERE c.n > 1 ORDER BY total";
        assert_eq!(check_sql_text(sql), Ok(()));

        let sql = "SELECT t.avg_price FROM (SELECT AVG(price_actual) AS avg_price FROM products) t";
        assert_eq!(check_sql_text(sql), Ok(()));
    }

    #[test]
    fn test_unparseable_sql_rejected() {
        // GLOB is valid SQLite but outside what the parser accepts
        let err = check_sql_text("SELECT * FROM users WHERE name GLOB 'a*'").unwrap_err();
        assert!(matches!(
            err,
            GroundingViolation::Unparseable { dialect: SqlDialect::Sqlite, .. }
        ));
        assert!(check_sql_text("SELEC * FORM products").is_err());
    }

    #[test]
    fn test_dialect_follows_store_kind() {
        assert_eq!(SqlDialect::for_kind("postgres"), SqlDialect::Postgres);
        assert_eq!(SqlDialect::for_kind("sqlite"), SqlDialect::Sqlite);

        let sql = "SELECT title FROM products WHERE title ILIKE '%phone%'";
        assert_eq!(
            check_query(&shop_schema(), SqlDialect::Postgres, ToolName::Tabular, sql),
            Ok(())
        );
        assert_eq!(
            referenced_tables(SqlDialect::Postgres, "SELECT id FROM public.shops").unwrap(),
            vec!["shops"]
        );
    }

    #[test]
    fn test_empty_query_rejected() {
        assert_eq!(check_sql_text("   "), Err(GroundingViolation::Empty));
    }

    #[test]
    fn test_cypher_names_extracted() {
        let (labels, rels) = referenced_graph_names(
            "MATCH (s:Shop {seller_name: 'A:B'})-[:SELLS]->(p:Product)-[r:BELONGS_TO|SELLS*1..2]->(:Category) \
             RETURN s.seller_name, count(p)",
        );
        assert_eq!(labels, vec!["Shop", "Product", "Category"]);
        assert_eq!(rels, vec!["SELLS", "BELONGS_TO", "SELLS"]);
    }

    #[test]
    fn test_cypher_grounding() {
        let ok = "MATCH (s:Shop)-[:SELLS]->(p:Product) RETURN s.seller_name, count(p) AS n";
        assert_eq!(check_cypher_text(ok), Ok(()));

        assert_eq!(
            check_cypher_text("MATCH (c:Customer) RETURN c"),
            Err(GroundingViolation::UnknownLabel("Customer".into()))
        );
        assert_eq!(
            check_cypher_text("MATCH (s:Shop)-[:sells]->(p:Product) RETURN p"),
            Err(GroundingViolation::UnknownRelation("sells".into()))
        );
    }

    #[test]
    fn test_cypher_unknown_property_rejected() {
        assert_eq!(
            check_cypher_text("MATCH (s:Shop) RETURN s.password_hash"),
            Err(GroundingViolation::UnknownProperty {
                owner: "Shop".into(),
                property: "password_hash".into(),
            })
        );
        // declared on Product, not on Shop
        assert!(check_cypher_text(
            "MATCH (s:Shop)-[:SELLS]->(p:Product) WHERE s.title = 'x' RETURN p.title"
        )
        .is_err());
        assert_eq!(
            check_cypher_text("MATCH (s:Shop)-[r:SELLS]->(p:Product) RETURN r.since"),
            Err(GroundingViolation::UnknownProperty {
                owner: "SELLS".into(),
                property: "since".into(),
            })
        );
    }

    #[test]
    fn test_cypher_properties_of_bound_labels_pass() {
        let q = "MATCH (p:Product)-[:BELONGS_TO]->(c:Category) \
                 WHERE p.price_actual < 100 RETURN c.name, avg(p.price_actual) AS avg_price";
        assert_eq!(check_cypher_text(q), Ok(()));
    }

    #[test]
    fn test_cypher_literals_ignored() {
        let q = "MATCH (p:Product) WHERE p.title = '(x:Phone) s.secret' RETURN p";
        assert_eq!(check_cypher_text(q), Ok(()));
    }

    #[test]
    fn test_normalize_query() {
        assert_eq!(
            normalize_query(ToolName::Graph, "```cypher\nMATCH (n:Shop) RETURN n;\n```"),
            "MATCH (n:Shop) RETURN n"
        );
        assert_eq!(
            normalize_query(ToolName::Tabular, "  SELECT 1;  "),
            "SELECT 1;"
        );
    }
}
