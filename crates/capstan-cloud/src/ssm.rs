use anyhow::anyhow;
use async_trait::async_trait;
use aws_sdk_ssm::types::{ParameterType, Tag};
use tracing::debug;

use crate::ports::{ParamStore, ParamStoreError};

/// SSM-backed parameter store for registration secrets and the
/// runner-group id cache.
#[derive(Clone)]
pub struct SsmParams {
    client: aws_sdk_ssm::Client,
}

impl SsmParams {
    pub fn new(client: aws_sdk_ssm::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ParamStore for SsmParams {
    async fn put_secret(
        &self,
        path: &str,
        value: &str,
        tags: &[(String, String)],
    ) -> anyhow::Result<()> {
        // PutParameter rejects tags combined with overwrite, so tag on
        // create and fall back to a plain overwrite when the parameter
        // already exists.
        let tag_list: Vec<Tag> = tags
            .iter()
            .map(|(key, value)| Tag::builder().key(key).value(value).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow!("invalid secret tag: {e}"))?;
        let create = self
            .client
            .put_parameter()
            .name(path)
            .value(value)
            .r#type(ParameterType::SecureString)
            .set_tags(if tag_list.is_empty() { None } else { Some(tag_list) })
            .send()
            .await;
        match create {
            Ok(_) => Ok(()),
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_parameter_already_exists())
                    .unwrap_or(false) =>
            {
                debug!(path, "secret exists, overwriting");
                self.client
                    .put_parameter()
                    .name(path)
                    .value(value)
                    .r#type(ParameterType::SecureString)
                    .overwrite(true)
                    .send()
                    .await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn put_parameter(&self, name: &str, value: &str) -> anyhow::Result<()> {
        self.client
            .put_parameter()
            .name(name)
            .value(value)
            .r#type(ParameterType::String)
            .overwrite(true)
            .send()
            .await?;
        Ok(())
    }

    async fn get_parameter(&self, name: &str) -> Result<String, ParamStoreError> {
        let result = self
            .client
            .get_parameter()
            .name(name)
            .with_decryption(true)
            .send()
            .await;
        match result {
            Ok(output) => output
                .parameter()
                .and_then(|p| p.value())
                .map(str::to_string)
                .ok_or_else(|| ParamStoreError::Other(anyhow!("parameter `{name}` has no value"))),
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_parameter_not_found())
                    .unwrap_or(false) =>
            {
                Err(ParamStoreError::NotFound(name.to_string()))
            }
            Err(err) => Err(ParamStoreError::Other(err.into())),
        }
    }
}
