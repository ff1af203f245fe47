//! Endpoint registry loaded from a YAML file.

use std::collections::HashSet;
use std::path::PathBuf;

use actsync_core::Endpoint;
use actsync_storage::{EndpointSource, StoreError};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs;

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointRegistry {
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

impl EndpointRegistry {
    pub fn parse(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing endpoint registry")?;
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.url.trim().is_empty() {
                bail!("endpoint {} has an empty url", endpoint.id);
            }
            if !seen.insert(endpoint.id) {
                bail!("endpoint id {} is listed more than once", endpoint.id);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct YamlEndpointRegistry {
    path: PathBuf,
}

impl YamlEndpointRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn load(&self) -> Result<EndpointRegistry> {
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        EndpointRegistry::parse(&text).with_context(|| format!("loading {}", self.path.display()))
    }
}

#[async_trait]
impl EndpointSource for YamlEndpointRegistry {
    async fn load_endpoints(&self) -> Result<Vec<Endpoint>, StoreError> {
        self.load()
            .await
            .map(|registry| registry.endpoints)
            .map_err(|err| StoreError::Unavailable(format!("{err:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actsync_core::EndpointKind;
    use std::io::Write;

    #[tokio::test]
    async fn loads_endpoints_from_yaml() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"
endpoints:
  - id: 1
    url: https://national.example.org/api
    token: abc
    description: National
    type: Nazionale
  - id: 2
    url: https://zone.example.org/api/
    area: Nord
    type: Zona
  - id: 3
    url: https://table.example.org/api
"#
        )
        .expect("write yaml");

        let endpoints = YamlEndpointRegistry::new(file.path())
            .load_endpoints()
            .await
            .expect("load");
        assert_eq!(endpoints.len(), 3);
        assert_eq!(endpoints[0].token.as_deref(), Some("abc"));
        assert_eq!(endpoints[0].kind, Some(EndpointKind::National));
        assert_eq!(endpoints[1].area.as_deref(), Some("Nord"));
        assert_eq!(endpoints[1].activities_url(), "https://zone.example.org/api/activities/");
        assert_eq!(endpoints[2].kind, None);
        assert_eq!(endpoints[2].description, "");
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = EndpointRegistry::parse(
            "endpoints:\n  - {id: 1, url: 'https://a.test'}\n  - {id: 1, url: 'https://b.test'}\n",
        )
        .expect_err("duplicate");
        assert!(format!("{err:#}").contains("more than once"));
    }

    #[tokio::test]
    async fn missing_file_is_unavailable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = YamlEndpointRegistry::new(dir.path().join("absent.yaml"))
            .load_endpoints()
            .await
            .expect_err("missing");
        assert!(matches!(err, StoreError::Unavailable(ref msg) if msg.contains("absent.yaml")));
    }
}
