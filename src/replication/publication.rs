// ABOUTME: Publication management on the source side of a replication pair
// ABOUTME: Drops and recreates publications, optionally restricted by a row filter

use anyhow::{Context, Result};
use pg_escape::quote_identifier;
use tokio_postgres::Client;
use tracing::info;

/// What a publication covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicationScope {
    AllTables,
    /// One table, limited to rows matching `filter` (PostgreSQL 15+).
    FilteredTable { table: String, filter: String },
}

pub fn create_publication_sql(name: &str, scope: &PublicationScope) -> String {
    match scope {
        PublicationScope::AllTables => {
            format!("CREATE PUBLICATION {} FOR ALL TABLES", quote_identifier(name))
        }
        PublicationScope::FilteredTable { table, filter } => format!(
            "CREATE PUBLICATION {} FOR TABLE {} WHERE ({})",
            quote_identifier(name),
            quote_identifier(table),
            filter
        ),
    }
}

/// Drops `name` if present and creates it again.
pub async fn create_publication(
    client: &Client,
    name: &str,
    scope: &PublicationScope,
) -> Result<()> {
    drop_publication(client, name).await?;
    client
        .batch_execute(&create_publication_sql(name, scope))
        .await
        .with_context(|| format!("Failed to create publication {}", name))?;
    info!("Created publication {}", name);
    Ok(())
}

pub async fn list_publications(client: &Client) -> Result<Vec<String>> {
    let rows = client
        .query("SELECT pubname FROM pg_publication ORDER BY pubname", &[])
        .await
        .context("Failed to list publications")?;
    Ok(rows.iter().map(|row| row.get(0)).collect())
}

pub async fn drop_publication(client: &Client, name: &str) -> Result<()> {
    client
        .batch_execute(&format!(
            "DROP PUBLICATION IF EXISTS {}",
            quote_identifier(name)
        ))
        .await
        .with_context(|| format!("Failed to drop publication {}", name))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_tables_publication() {
        assert_eq!(
            create_publication_sql("pub_main_to_second", &PublicationScope::AllTables),
            "CREATE PUBLICATION pub_main_to_second FOR ALL TABLES"
        );
    }

    #[test]
    fn test_filtered_publication_quotes_names() {
        let scope = PublicationScope::FilteredTable {
            table: "Test Table".to_string(),
            filter: "id % 2 = 0".to_string(),
        };
        assert_eq!(
            create_publication_sql("pub_second_to_main", &scope),
            r#"CREATE PUBLICATION pub_second_to_main FOR TABLE "Test Table" WHERE (id % 2 = 0)"#
        );
    }
}
