//! Schema registry: typed descriptors of the tabular and graph stores.
//!
//! A [`SchemaDescriptor`] is loaded once at startup from a TOML file and
//! shared read-only (`Arc<SchemaDescriptor>`) by every stage of every
//! request. Stages never see the schema as free text; the prose block
//! embedded in inference instructions is a derived view produced by
//! [`SchemaDescriptor::render_prompt`].
//!
//! # Name resolution
//!
//! Grounding maps a user or model supplied term to a canonical schema name:
//!
//! 1. exact, case-insensitive match on a table name or node label;
//! 2. match after plural folding (`"Products"` → `products`, `"categories"` → `Category`);
//! 3. case-insensitive match on a declared synonym.
//!
//! A term that matches none of these resolves to `None`. Nothing is guessed.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    /// Free-form schema version, echoed in prompts and `/schema`.
    pub version: String,
    #[serde(default)]
    pub tabular: TabularSchema,
    #[serde(default)]
    pub graph: GraphSchema,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TabularSchema {
    #[serde(default)]
    pub tables: Vec<TableDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub synonyms: Vec<String>,
    pub columns: Vec<ColumnDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSchema {
    #[serde(default)]
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub edges: Vec<EdgeDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub synonyms: Vec<String>,
    #[serde(default)]
    pub properties: Vec<String>,
}

/// A typed edge `(source)-[:relation]->(target)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDef {
    pub source: String,
    pub relation: String,
    pub target: String,
}

impl SchemaDescriptor {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read schema file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid schema file: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let schema: SchemaDescriptor =
            toml::from_str(content).context("Failed to parse schema TOML")?;
        schema.validate()?;
        Ok(schema)
    }

    fn validate(&self) -> Result<()> {
        if self.tabular.tables.is_empty() && self.graph.nodes.is_empty() {
            bail!("schema declares neither tables nor graph nodes");
        }

        let mut seen = HashSet::new();
        for table in &self.tabular.tables {
            if !seen.insert(table.name.to_lowercase()) {
                bail!("duplicate table: {}", table.name);
            }
            if table.columns.is_empty() {
                bail!("table '{}' declares no columns", table.name);
            }
        }

        let mut labels = HashSet::new();
        for node in &self.graph.nodes {
            if !labels.insert(node.label.as_str()) {
                bail!("duplicate node label: {}", node.label);
            }
        }

        for edge in &self.graph.edges {
            for endpoint in [&edge.source, &edge.target] {
                if !labels.contains(endpoint.as_str()) {
                    bail!(
                        "edge {} references undeclared label '{}'",
                        edge.relation,
                        endpoint
                    );
                }
            }
        }

        Ok(())
    }

    // ============ Lookups ============

    /// Table by name, case-insensitive.
    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tabular
            .tables
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
    }

    /// Node by label. Graph labels are case-sensitive.
    pub fn node(&self, label: &str) -> Option<&NodeDef> {
        self.graph.nodes.iter().find(|n| n.label == label)
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.node(label).is_some()
    }

    pub fn has_relation_type(&self, relation: &str) -> bool {
        self.graph.edges.iter().any(|e| e.relation == relation)
    }

    pub fn is_graph_edge(&self, relation: &str) -> bool {
        self.graph
            .edges
            .iter()
            .any(|e| e.relation.eq_ignore_ascii_case(relation))
    }

    // ============ Grounding ============

    /// Resolve a term to a canonical table name or node label.
    pub fn resolve_entity(&self, term: &str) -> Option<String> {
        let term = term.trim();
        if term.is_empty() {
            return None;
        }

        let tables = self.tabular.tables.iter().map(|t| t.name.as_str());
        let labels = self.graph.nodes.iter().map(|n| n.label.as_str());
        let names: Vec<&str> = tables.chain(labels).collect();

        if let Some(name) = names.iter().find(|n| n.eq_ignore_ascii_case(term)) {
            return Some(name.to_string());
        }

        let folded = singular(term);
        if let Some(name) = names.iter().find(|n| singular(n) == folded) {
            return Some(name.to_string());
        }

        for table in &self.tabular.tables {
            if table.synonyms.iter().any(|s| s.eq_ignore_ascii_case(term)) {
                return Some(table.name.clone());
            }
        }
        for node in &self.graph.nodes {
            if node.synonyms.iter().any(|s| s.eq_ignore_ascii_case(term)) {
                return Some(node.label.clone());
            }
        }

        None
    }

    /// Resolve a field name, preferring the fields of `entity` when given.
    ///
    /// Falls back to a unique match across all tables and nodes; a name
    /// that exists on several unrelated entities is left unresolved.
    pub fn resolve_field(&self, entity: Option<&str>, term: &str) -> Option<String> {
        let term = term.trim();
        if term.is_empty() {
            return None;
        }

        if let Some(entity) = entity {
            if let Some(found) = self
                .fields_of(entity)
                .into_iter()
                .find(|f| f.eq_ignore_ascii_case(term))
            {
                return Some(found.to_string());
            }
        }

        let mut matches: Vec<&str> = self
            .tabular
            .tables
            .iter()
            .flat_map(|t| t.columns.iter().map(|c| c.name.as_str()))
            .chain(
                self.graph
                    .nodes
                    .iter()
                    .flat_map(|n| n.properties.iter().map(String::as_str)),
            )
            .filter(|f| f.eq_ignore_ascii_case(term))
            .collect();
        matches.sort_unstable();
        matches.dedup();

        match matches.as_slice() {
            [only] => Some(only.to_string()),
            _ => None,
        }
    }

    /// Resolve a group-by key, which may name an entity or a field.
    pub fn resolve_group_key(&self, entity: Option<&str>, term: &str) -> Option<String> {
        self.resolve_entity(term)
            .or_else(|| self.resolve_field(entity, term))
    }

    /// Resolve a relation name between two (already resolved) entities.
    ///
    /// A graph edge type wins; otherwise the name is accepted as given when
    /// the tabular schema links the two entities through a foreign-key-like
    /// column or a junction table.
    pub fn resolve_relation(&self, source: &str, target: &str, name: &str) -> Option<String> {
        let name = name.trim();
        if let Some(edge) = self
            .graph
            .edges
            .iter()
            .find(|e| !name.is_empty() && e.relation.eq_ignore_ascii_case(name))
        {
            return Some(edge.relation.clone());
        }

        if self.tabular_link(source, target) {
            let name = if name.is_empty() {
                format!("{}_{}", singular(source), singular(target))
            } else {
                name.to_string()
            };
            return Some(name);
        }

        None
    }

    /// Whether two entities are joinable in the tabular store.
    ///
    /// `products(shop_id)` links `products` and `shops`;
    /// `product_categories(product_id, category_id)` links `products` and
    /// `categories`.
    pub fn tabular_link(&self, a: &str, b: &str) -> bool {
        let (Some(ta), Some(tb)) = (self.table_for(a), self.table_for(b)) else {
            return false;
        };
        let key_a = format!("{}_id", singular(&ta.name));
        let key_b = format!("{}_id", singular(&tb.name));

        let has = |t: &TableDef, col: &str| t.columns.iter().any(|c| c.name.eq_ignore_ascii_case(col));

        if has(ta, &key_b) || has(tb, &key_a) {
            return true;
        }

        self.tabular
            .tables
            .iter()
            .any(|t| has(t, &key_a) && has(t, &key_b))
    }

    /// Table for a term that may be a label or table name (plural-folded).
    fn table_for(&self, term: &str) -> Option<&TableDef> {
        let folded = singular(term);
        self.table(term)
            .or_else(|| self.tabular.tables.iter().find(|t| singular(&t.name) == folded))
    }

    fn fields_of(&self, entity: &str) -> Vec<&str> {
        if let Some(table) = self.table(entity) {
            return table.columns.iter().map(|c| c.name.as_str()).collect();
        }
        if let Some(node) = self.node(entity) {
            return node.properties.iter().map(String::as_str).collect();
        }
        Vec::new()
    }

    // ============ Prose view ============

    /// Render the schema as the text block embedded in inference instructions.
    pub fn render_prompt(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Schema version: {}", self.version);

        if !self.tabular.tables.is_empty() {
            out.push_str("\nTabular store (SQL; aggregations, filtering, sorting):\n");
            for table in &self.tabular.tables {
                let cols: Vec<String> = table
                    .columns
                    .iter()
                    .map(|c| match &c.description {
                        Some(d) => format!("{} {} /* {} */", c.name, c.data_type, d),
                        None => format!("{} {}", c.name, c.data_type),
                    })
                    .collect();
                let _ = write!(out, "- {}({})", table.name, cols.join(", "));
                append_notes(&mut out, table.description.as_deref(), &table.synonyms);
            }
        }

        if !self.graph.nodes.is_empty() {
            out.push_str("\nGraph store (Cypher; relationship traversal):\n");
            for node in &self.graph.nodes {
                let _ = write!(out, "- (:{} {{{}}})", node.label, node.properties.join(", "));
                append_notes(&mut out, node.description.as_deref(), &node.synonyms);
            }
            for edge in &self.graph.edges {
                let _ = writeln!(
                    out,
                    "- (:{})-[:{}]->(:{})",
                    edge.source, edge.relation, edge.target
                );
            }
        }

        out
    }
}

fn append_notes(out: &mut String, description: Option<&str>, synonyms: &[String]) {
    if let Some(d) = description {
        let _ = write!(out, " -- {}", d);
    }
    if !synonyms.is_empty() {
        let _ = write!(out, " (also called: {})", synonyms.join(", "));
    }
    out.push('\n');
}

/// Lowercase and fold a simple English plural.
fn singular(word: &str) -> String {
    let w = word.trim().to_lowercase();
    if let Some(stem) = w.strip_suffix("ies") {
        format!("{}y", stem)
    } else if w.ends_with("ss") {
        w
    } else if let Some(stem) = w.strip_suffix('s') {
        stem.to_string()
    } else {
        w
    }
}
