use deadpool_postgres::Pool;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use tokio_postgres::Client;

use crate::error::IntrospectionError;

/// Text handed to the model when the catalog could not be read.
pub const SCHEMA_UNAVAILABLE: &str = "Error retrieving schema information";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescription {
    pub tables: Vec<TableDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    pub foreign_keys: Vec<ForeignKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub references_table: String,
    pub references_column: String,
}

impl SchemaDescription {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Plain-text rendering fed verbatim into prompts. Output only depends on
    /// the structure, so an unchanged schema always renders identically.
    /// An empty schema renders as an empty string.
    pub fn render(&self) -> String {
        let mut out = String::new();

        for table in &self.tables {
            let _ = writeln!(out, "Table: {}", table.name);
            out.push_str("Columns:\n");
            for col in &table.columns {
                let _ = writeln!(out, "  - {} ({})", col.name, col.data_type);
            }
            if !table.foreign_keys.is_empty() {
                out.push_str("Foreign Keys:\n");
                for fk in &table.foreign_keys {
                    let _ = writeln!(
                        out,
                        "  - {} references {}({})",
                        fk.column, fk.references_table, fk.references_column
                    );
                }
            }
            out.push('\n');
        }

        out
    }
}

/// Describe every base table in `namespace`, ordered by table name, with
/// columns in ordinal order and foreign keys in constraint order.
pub async fn describe_schema(
    pool: &Pool,
    namespace: &str,
) -> Result<SchemaDescription, IntrospectionError> {
    let client = pool.get().await?;
    describe_schema_with(&client, namespace).await
}

pub async fn describe_schema_with(
    client: &Client,
    namespace: &str,
) -> Result<SchemaDescription, IntrospectionError> {
    let table_names = get_table_names(client, namespace).await?;
    let mut tables = Vec::with_capacity(table_names.len());

    for name in table_names {
        let columns = get_columns(client, namespace, &name).await?;
        let foreign_keys = get_foreign_keys(client, namespace, &name).await?;
        tables.push(TableDescriptor {
            name,
            columns,
            foreign_keys,
        });
    }

    tracing::debug!(namespace, tables = tables.len(), "schema introspected");

    Ok(SchemaDescription { tables })
}

pub async fn get_table_names(
    client: &Client,
    namespace: &str,
) -> Result<Vec<String>, IntrospectionError> {
    let rows = client
        .query(
            r#"
            SELECT tablename::text AS name
            FROM pg_catalog.pg_tables
            WHERE schemaname = $1::text
            ORDER BY tablename
            "#,
            &[&namespace],
        )
        .await?;

    let names = rows
        .iter()
        .map(|row| row.try_get("name"))
        .collect::<Result<Vec<String>, _>>()?;

    Ok(names)
}

pub async fn get_columns(
    client: &Client,
    namespace: &str,
    table: &str,
) -> Result<Vec<ColumnDescriptor>, IntrospectionError> {
    let rows = client
        .query(
            r#"
            SELECT
                column_name::text AS name,
                data_type::text AS data_type
            FROM information_schema.columns
            WHERE table_schema = $1::text AND table_name = $2::text
            ORDER BY ordinal_position
            "#,
            &[&namespace, &table],
        )
        .await?;

    let columns = rows
        .iter()
        .map(|row| {
            Ok(ColumnDescriptor {
                name: row.try_get("name")?,
                data_type: row.try_get("data_type")?,
            })
        })
        .collect::<Result<Vec<_>, tokio_postgres::Error>>()?;

    Ok(columns)
}

pub async fn get_foreign_keys(
    client: &Client,
    namespace: &str,
    table: &str,
) -> Result<Vec<ForeignKey>, IntrospectionError> {
    // Pair local and referenced columns by position so composite keys line up.
    let rows = client
        .query(
            r#"
            SELECT
                a.attname::text AS column_name,
                rt.relname::text AS references_table,
                ra.attname::text AS references_column
            FROM pg_catalog.pg_constraint c
            JOIN pg_catalog.pg_class t ON t.oid = c.conrelid
            JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
            JOIN pg_catalog.pg_class rt ON rt.oid = c.confrelid
            CROSS JOIN LATERAL unnest(c.conkey, c.confkey)
                WITH ORDINALITY AS k(attnum, ref_attnum, ord)
            JOIN pg_catalog.pg_attribute a
                ON a.attrelid = c.conrelid AND a.attnum = k.attnum
            JOIN pg_catalog.pg_attribute ra
                ON ra.attrelid = c.confrelid AND ra.attnum = k.ref_attnum
            WHERE c.contype = 'f'
              AND n.nspname = $1::text
              AND t.relname = $2::text
            ORDER BY c.conname, k.ord
            "#,
            &[&namespace, &table],
        )
        .await?;

    let keys = rows
        .iter()
        .map(|row| {
            Ok(ForeignKey {
                column: row.try_get("column_name")?,
                references_table: row.try_get("references_table")?,
                references_column: row.try_get("references_column")?,
            })
        })
        .collect::<Result<Vec<_>, tokio_postgres::Error>>()?;

    Ok(keys)
}
