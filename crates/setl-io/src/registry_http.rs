//! HTTP client for the remote schema registry.
//!
//! The registry serves field lists keyed by the wire-envelope schema id, on a
//! Confluent-style path: `GET <base>/schemas/ids/<id>` returning
//! `{"schema": "<json document>"}` where the document carries the field list.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use setl_core::capability::SchemaRegistryRemote;
use setl_core::definition::SchemaRegistryConfig;
use setl_core::schema::{Field, SchemaError};

#[derive(Debug)]
pub struct HttpSchemaRegistry {
    client: reqwest::Client,
    base: Url,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetByIdResp {
    schema: String,
}

#[derive(Debug, Deserialize)]
struct SchemaDoc {
    #[serde(default)]
    fields: Vec<Field>,
}

impl HttpSchemaRegistry {
    pub fn new(config: &SchemaRegistryConfig) -> Result<Self, SchemaError> {
        let base = Url::parse(&config.url)
            .map_err(|e| SchemaError::Registry(format!("invalid registry url: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(SchemaError::Registry(format!(
                "registry url {:?} cannot be a base",
                config.url
            )));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn url_for(&self, schema_id: u32) -> Url {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .expect("base url validated in constructor")
            .extend(["schemas", "ids", &schema_id.to_string()]);
        url
    }
}

#[async_trait]
impl SchemaRegistryRemote for HttpSchemaRegistry {
    async fn get(&self, schema_id: u32) -> Result<Option<Vec<Field>>, SchemaError> {
        let mut request = self.client.get(self.url_for(schema_id));
        if let Some(ref username) = self.username {
            request = request.basic_auth(username, self.password.as_ref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| SchemaError::Registry(format!("registry request failed: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: GetByIdResp = response.json().await.map_err(|e| {
                    SchemaError::Registry(format!("registry response does not parse: {e}"))
                })?;
                let doc: SchemaDoc = serde_json::from_str(&body.schema).map_err(|e| {
                    SchemaError::Registry(format!("schema document does not parse: {e}"))
                })?;
                Ok(Some(doc.fields))
            }
            status => Err(SchemaError::Registry(format!(
                "registry returned {status} for schema id {schema_id}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_url_appends_schema_path() {
        let registry = HttpSchemaRegistry::new(&SchemaRegistryConfig {
            url: "http://registry.local:8081/base".into(),
            username: None,
            password: None,
        })
        .unwrap();
        assert_eq!(
            registry.url_for(1102).as_str(),
            "http://registry.local:8081/base/schemas/ids/1102"
        );
    }

    #[test]
    fn invalid_url_is_rejected() {
        let err = HttpSchemaRegistry::new(&SchemaRegistryConfig {
            url: "not a url".into(),
            username: None,
            password: None,
        })
        .unwrap_err();
        assert!(matches!(err, SchemaError::Registry(_)));
    }

    #[test]
    fn schema_document_parses_fields() {
        let doc: SchemaDoc =
            serde_json::from_str(r#"{"fields":[{"name":"id","type":"string"}]}"#).unwrap();
        assert_eq!(doc.fields.len(), 1);
        assert_eq!(doc.fields[0].name, "id");
    }
}
