//! Remote plugin catalog client.
//!
//! The catalog is the authoritative index of publishable plugin names. The
//! `add` command validates a requested name against it before fetching the
//! full reference that gets appended to the project manifest.

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::manifest::{PluginKind, PluginReference};

/// Default catalog endpoint.
pub const DEFAULT_CATALOG_BASE: &str = "https://api.langforge.dev";

/// Index of publishable plugin names.
#[derive(Debug, Clone, Deserialize)]
pub struct Catalog {
    /// Known language plugin names.
    #[serde(default)]
    pub languages: Vec<String>,
    /// Known library plugin names.
    #[serde(default)]
    pub libraries: Vec<String>,
}

impl Catalog {
    /// Check whether a name is published under a kind.
    pub fn contains(&self, kind: PluginKind, name: &str) -> bool {
        let list = match kind {
            PluginKind::Language => &self.languages,
            PluginKind::Library => &self.libraries,
        };
        list.iter().any(|n| n == name)
    }
}

/// HTTP client for the plugin catalog.
pub struct CatalogClient {
    base: String,
    http: reqwest::blocking::Client,
}

impl CatalogClient {
    /// Create a client against a catalog endpoint.
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            http: reqwest::blocking::Client::new(),
        }
    }

    /// Create a client against the default endpoint.
    pub fn default_endpoint() -> Self {
        Self::new(DEFAULT_CATALOG_BASE)
    }

    /// Fetch the full catalog index.
    pub fn fetch(&self) -> Result<Catalog> {
        let url = format!("{}/catalog", self.base);
        let response = self.http.get(&url).send()?;
        if !response.status().is_success() {
            return Err(Error::critical(format!(
                "catalog request failed: {}",
                response.status()
            )));
        }
        Ok(response.json()?)
    }

    /// Fetch the full reference for a published plugin.
    ///
    /// Validates the name against the catalog index first; an unknown name
    /// is a user error.
    pub fn entry(&self, kind: PluginKind, name: &str) -> Result<PluginReference> {
        tracing::info!("fetching catalog...");
        let catalog = self.fetch()?;

        tracing::info!("validating...");
        if !catalog.contains(kind, name) {
            return Err(Error::not_in_catalog(kind.to_string(), name));
        }

        let segment = match kind {
            PluginKind::Language => "lang",
            PluginKind::Library => "lib",
        };
        let url = format!("{}/{}/{}", self.base, segment, name);
        let response = self.http.get(&url).send()?;
        if !response.status().is_success() {
            return Err(Error::critical(format!(
                "failed to fetch {} '{}': {}",
                kind,
                name,
                response.status()
            )));
        }
        let reference: PluginReference = response.json()?;
        reference.validate()?;
        Ok(reference)
    }
}

impl std::fmt::Debug for CatalogClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogClient")
            .field("base", &self.base)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_and_validate() {
        let mut server = mockito::Server::new();
        let catalog = server
            .mock("GET", "/catalog")
            .with_header("content-type", "application/json")
            .with_body(r#"{ "languages": ["lang-script"], "libraries": [] }"#)
            .create();

        let client = CatalogClient::new(server.url());
        let fetched = client.fetch().unwrap();
        assert!(fetched.contains(PluginKind::Language, "lang-script"));
        assert!(!fetched.contains(PluginKind::Library, "lang-script"));
        catalog.assert();
    }

    #[test]
    fn test_entry_for_published_plugin() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/catalog")
            .with_body(r#"{ "languages": ["lang-script"] }"#)
            .create();
        let entry = server
            .mock("GET", "/lang/lang-script")
            .with_body(
                r#"{ "name": "lang-script/stable", "remote": { "type": "vcs", "owner": "acme" } }"#,
            )
            .create();

        let client = CatalogClient::new(server.url());
        let reference = client
            .entry(PluginKind::Language, "lang-script")
            .unwrap();
        assert_eq!(reference.ident(), "script");
        entry.assert();
    }

    #[test]
    fn test_unknown_name_is_user_error() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/catalog")
            .with_body(r#"{ "languages": [] }"#)
            .create();

        let client = CatalogClient::new(server.url());
        let result = client.entry(PluginKind::Language, "lang-nope");
        assert!(matches!(result, Err(Error::NotInCatalog { .. })));
    }
}
