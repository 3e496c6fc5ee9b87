use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};

use super::ItemClient;
use crate::error::{Error, Result, Step};

/// In-process [`ItemClient`] with per-table failure injection.
///
/// Tables must be provisioned through [`ItemClient::ensure_table`] before
/// use, matching a managed service that rejects unknown tables.
#[derive(Default)]
pub struct MemoryItemClient {
    tables: RwLock<HashMap<String, BTreeMap<String, String>>>,
    failing_puts: RwLock<HashSet<String>>,
    failing_provision: RwLock<HashSet<String>>,
}

impl MemoryItemClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every put to `table` fail until switched off.
    pub fn fail_puts_to(&self, table: &str, fail: bool) {
        let mut failing = self.failing_puts.write();
        if fail {
            failing.insert(table.to_string());
        } else {
            failing.remove(table);
        }
    }

    pub fn fail_provisioning(&self, table: &str) {
        self.failing_provision.write().insert(table.to_string());
    }

    /// Names of the provisioned tables, sorted.
    pub fn tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }
}

fn unprovisioned(table: &str, step: Step) -> Error {
    Error::backend(step, anyhow::anyhow!("table {table} is not provisioned"))
}

#[async_trait]
impl ItemClient for MemoryItemClient {
    async fn ensure_table(&self, table: &str) -> Result<()> {
        if self.failing_provision.read().contains(table) {
            return Err(Error::backend(
                Step::Provision,
                anyhow::anyhow!("forced provisioning failure for {table}"),
            ));
        }
        self.tables.write().entry(table.to_string()).or_default();
        Ok(())
    }

    async fn get_item(&self, table: &str, key: &str) -> Result<Option<String>> {
        let tables = self.tables.read();
        let items = tables
            .get(table)
            .ok_or_else(|| unprovisioned(table, Step::ReadMetadata))?;
        Ok(items.get(key).cloned())
    }

    async fn put_item(&self, table: &str, key: &str, body: String) -> Result<()> {
        if self.failing_puts.read().contains(table) {
            return Err(Error::backend(
                Step::CommitMetadata,
                anyhow::anyhow!("forced put failure for {table}"),
            ));
        }
        let mut tables = self.tables.write();
        let items = tables
            .get_mut(table)
            .ok_or_else(|| unprovisioned(table, Step::CommitMetadata))?;
        items.insert(key.to_string(), body);
        Ok(())
    }

    async fn delete_item(&self, table: &str, key: &str) -> Result<()> {
        let mut tables = self.tables.write();
        let items = tables
            .get_mut(table)
            .ok_or_else(|| unprovisioned(table, Step::RemoveMetadata))?;
        items.remove(key);
        Ok(())
    }

    async fn scan(&self, table: &str) -> Result<Vec<(String, String)>> {
        let tables = self.tables.read();
        let items = tables
            .get(table)
            .ok_or_else(|| unprovisioned(table, Step::ReadMetadata))?;
        Ok(items.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_tables_are_rejected() {
        let client = MemoryItemClient::new();
        assert!(client.get_item("missing", "k").await.is_err());

        client.ensure_table("docs").await.unwrap();
        client.put_item("docs", "k", "v".into()).await.unwrap();
        assert_eq!(client.get_item("docs", "k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(client.scan("docs").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn put_failures_are_scoped_to_one_table() {
        let client = MemoryItemClient::new();
        client.ensure_table("a").await.unwrap();
        client.ensure_table("b").await.unwrap();
        client.fail_puts_to("a", true);

        assert!(client.put_item("a", "k", "v".into()).await.is_err());
        client.put_item("b", "k", "v".into()).await.unwrap();

        client.fail_puts_to("a", false);
        client.put_item("a", "k", "v".into()).await.unwrap();
    }
}
