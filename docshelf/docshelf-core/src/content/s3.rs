use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;

use super::ContentStore;
use crate::error::{EntityKind, Error, Result, Step};

/// Content stored as S3 objects under `<prefix>/<path>`.
pub struct S3ContentStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl S3ContentStore {
    /// Loads AWS configuration from the environment and checks that `bucket` exists.
    pub async fn connect(bucket: impl Into<String>, prefix: impl Into<String>) -> Result<Self> {
        let cfg = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let store = Self::new(aws_sdk_s3::Client::new(&cfg), bucket, prefix);
        store
            .client
            .head_bucket()
            .bucket(&store.bucket)
            .send()
            .await
            .map_err(|e| Error::backend(Step::Provision, e))?;
        Ok(store)
    }

    pub fn new(
        client: aws_sdk_s3::Client,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    fn key(&self, path: &str) -> String {
        object_key(&self.prefix, path)
    }
}

fn object_key(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{prefix}/{path}")
    }
}

#[async_trait]
impl ContentStore for S3ContentStore {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let resp = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Err(Error::not_found(EntityKind::Content, path));
            }
            Err(e) => return Err(Error::backend(Step::ReadContent, e)),
        };

        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| Error::backend(Step::ReadContent, e))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| Error::backend(Step::WriteContent, e))?;
        Ok(())
    }

    // DeleteObject succeeds for missing keys, so existence is checked first.
    async fn remove(&self, path: &str) -> Result<()> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .send()
            .await
        {
            Ok(_) => {}
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => {
                return Err(Error::not_found(EntityKind::Content, path));
            }
            Err(e) => return Err(Error::backend(Step::RemoveContent, e)),
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .send()
            .await
            .map_err(|e| Error::backend(Step::RemoveContent, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_prefixed() {
        assert_eq!(object_key("documents", "a/b.md"), "documents/a/b.md");
        assert_eq!(object_key("documents/", "a.md"), "documents/a.md");
        assert_eq!(object_key("", "a.md"), "a.md");
    }
}
