use async_trait::async_trait;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    ScalarAttributeType, TableStatus,
};
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

use super::ItemClient;
use crate::error::{Error, Result, ResultExt, Step};

const KEY_ATTR: &str = "pk";
const BODY_ATTR: &str = "body";

/// DynamoDB tables with a string hash key and a JSON body attribute.
pub struct DynamoItemClient {
    client: aws_sdk_dynamodb::Client,
    poll_interval: Duration,
    max_polls: u32,
}

impl DynamoItemClient {
    /// Build a client from the AWS configuration found in the environment.
    pub async fn connect() -> Self {
        let cfg = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(aws_sdk_dynamodb::Client::new(&cfg))
    }

    pub fn new(client: aws_sdk_dynamodb::Client) -> Self {
        Self {
            client,
            poll_interval: Duration::from_secs(2),
            max_polls: 60,
        }
    }

    async fn table_status(&self, table: &str) -> Result<Option<TableStatus>> {
        match self.client.describe_table().table_name(table).send().await {
            Ok(out) => Ok(out.table().and_then(|t| t.table_status()).cloned()),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_resource_not_found_exception()) =>
            {
                Ok(None)
            }
            Err(e) => Err(Error::backend(Step::Provision, e)),
        }
    }

    async fn create_table(&self, table: &str) -> Result<()> {
        let key_def = AttributeDefinition::builder()
            .attribute_name(KEY_ATTR)
            .attribute_type(ScalarAttributeType::S)
            .build()
            .at(Step::Provision)?;
        let key_schema = KeySchemaElement::builder()
            .attribute_name(KEY_ATTR)
            .key_type(KeyType::Hash)
            .build()
            .at(Step::Provision)?;

        self.client
            .create_table()
            .table_name(table)
            .attribute_definitions(key_def)
            .key_schema(key_schema)
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await
            .at(Step::Provision)?;
        info!(table, "created table");
        Ok(())
    }
}

fn key(value: &str) -> AttributeValue {
    AttributeValue::S(value.to_string())
}

fn body_of(item: &HashMap<String, AttributeValue>) -> Option<String> {
    item.get(BODY_ATTR).and_then(|v| v.as_s().ok()).cloned()
}

#[async_trait]
impl ItemClient for DynamoItemClient {
    async fn ensure_table(&self, table: &str) -> Result<()> {
        match self.table_status(table).await? {
            Some(TableStatus::Active) => return Ok(()),
            Some(_) => {}
            None => self.create_table(table).await?,
        }

        for _ in 0..self.max_polls {
            tokio::time::sleep(self.poll_interval).await;
            if let Some(TableStatus::Active) = self.table_status(table).await? {
                return Ok(());
            }
        }
        Err(Error::backend(
            Step::Provision,
            anyhow::anyhow!("table {table} did not become active"),
        ))
    }

    async fn get_item(&self, table: &str, k: &str) -> Result<Option<String>> {
        let out = self
            .client
            .get_item()
            .table_name(table)
            .key(KEY_ATTR, key(k))
            .consistent_read(true)
            .send()
            .await
            .at(Step::ReadMetadata)?;
        Ok(out.item().and_then(body_of))
    }

    async fn put_item(&self, table: &str, k: &str, body: String) -> Result<()> {
        self.client
            .put_item()
            .table_name(table)
            .item(KEY_ATTR, key(k))
            .item(BODY_ATTR, AttributeValue::S(body))
            .send()
            .await
            .at(Step::CommitMetadata)?;
        Ok(())
    }

    async fn delete_item(&self, table: &str, k: &str) -> Result<()> {
        self.client
            .delete_item()
            .table_name(table)
            .key(KEY_ATTR, key(k))
            .send()
            .await
            .at(Step::RemoveMetadata)?;
        Ok(())
    }

    async fn scan(&self, table: &str) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        let mut start: Option<HashMap<String, AttributeValue>> = None;
        loop {
            let page = self
                .client
                .scan()
                .table_name(table)
                .set_exclusive_start_key(start.take())
                .send()
                .await
                .at(Step::ReadMetadata)?;

            for item in page.items() {
                let k = item.get(KEY_ATTR).and_then(|v| v.as_s().ok());
                if let (Some(k), Some(body)) = (k, body_of(item)) {
                    out.push((k.clone(), body));
                }
            }

            match page.last_evaluated_key() {
                Some(last) if !last.is_empty() => start = Some(last.clone()),
                _ => break,
            }
        }
        Ok(out)
    }
}
