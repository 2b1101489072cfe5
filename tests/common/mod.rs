#![allow(dead_code)]

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::TempDir;

pub const SHOP_SCHEMA: &str = r#"
version = "shop-v1"

[[tabular.tables]]
name = "shops"
synonyms = ["seller", "store"]
columns = [{ name = "id", type = "INTEGER" }, { name = "seller_name", type = "VARCHAR" }]

[[tabular.tables]]
name = "products"
synonyms = ["item"]
columns = [
    { name = "id", type = "INTEGER" },
    { name = "title", type = "VARCHAR" },
    { name = "price_actual", type = "DECIMAL(15,2)", description = "price after discount" },
    { name = "shop_id", type = "INTEGER" },
]

[[tabular.tables]]
name = "categories"
columns = [{ name = "id", type = "INTEGER" }, { name = "name", type = "VARCHAR" }]

[[tabular.tables]]
name = "product_categories"
columns = [{ name = "product_id", type = "INTEGER" }, { name = "category_id", type = "INTEGER" }]

[[graph.nodes]]
label = "Shop"
properties = ["seller_name"]

[[graph.nodes]]
label = "Product"
properties = ["title", "price_actual"]

[[graph.nodes]]
label = "Category"
properties = ["name"]

[[graph.edges]]
source = "Shop"
relation = "SELLS"
target = "Product"

[[graph.edges]]
source = "Product"
relation = "BELONGS_TO"
target = "Category"
"#;

const SEED: &[&str] = &[
    "CREATE TABLE shops (id INTEGER PRIMARY KEY, seller_name TEXT NOT NULL)",
    "CREATE TABLE products (id INTEGER PRIMARY KEY, title TEXT NOT NULL, price_actual REAL, shop_id INTEGER REFERENCES shops(id))",
    "CREATE TABLE categories (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
    "CREATE TABLE product_categories (product_id INTEGER, category_id INTEGER)",
    "INSERT INTO shops VALUES (1, 'Alpha'), (2, 'Beta')",
    "INSERT INTO products VALUES (1, 'Phone', 199.0, 1), (2, 'Case', 9.5, 1), (3, 'Cable', 4.0, 1), (4, 'Lamp', 25.0, 2)",
    "INSERT INTO categories VALUES (1, 'Electronics'), (2, 'Home')",
    "INSERT INTO product_categories VALUES (1, 1), (2, 1), (3, 1), (4, 2)",
];

/// Create and populate a shop database at `path`.
pub async fn seed_shop_db(path: &Path) {
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
        .unwrap()
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();
    for stmt in SEED {
        sqlx::query(stmt).execute(&pool).await.unwrap();
    }
    pool.close().await;
}

/// Write a schema file and an `nlq.toml` pointing at `db_path` into a
/// fresh temp dir. `extra` is appended to the config verbatim.
pub fn write_config(db_path: Option<&Path>, extra: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let config_dir = tmp.path().join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(config_dir.join("schema.toml"), SHOP_SCHEMA).unwrap();

    let db = db_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| tmp.path().join("shop.db"));

    let config_content = format!(
        r#"[schema]
path = "schema.toml"

[tabular]
kind = "sqlite"
url = "sqlite:{}"
{}
"#,
        db.display(),
        extra
    );

    let config_path = config_dir.join("nlq.toml");
    fs::write(&config_path, config_content).unwrap();
    (tmp, config_path)
}
