use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

use crate::config::ModelConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub id: String,
    pub aliases: BTreeSet<String>,
    pub free: bool,
    pub backend_id: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("model '{0}' is declared twice")]
    DuplicateModel(String),
    #[error("alias '{alias}' of '{model}' already names '{existing}'")]
    ConflictingAlias {
        alias: String,
        model: String,
        existing: String,
    },
}

/// Per-backend model table. Every known name (canonical id or alias) maps to
/// exactly one canonical id.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: Vec<Model>,
    names: HashMap<String, usize>,
}

impl ModelCatalog {
    pub fn new(backend_id: &str, configs: &[ModelConfig]) -> Result<Self, CatalogError> {
        let mut catalog = Self::default();

        for config in configs {
            if catalog.names.contains_key(&config.id) {
                return Err(CatalogError::DuplicateModel(config.id.clone()));
            }
            let index = catalog.models.len();
            catalog.names.insert(config.id.clone(), index);
            catalog.models.push(Model {
                id: config.id.clone(),
                aliases: BTreeSet::new(),
                free: config.free,
                backend_id: backend_id.to_owned(),
            });
        }

        for (index, config) in configs.iter().enumerate() {
            for alias in &config.aliases {
                match catalog.names.get(alias) {
                    Some(existing) if *existing == index => continue,
                    Some(existing) => {
                        return Err(CatalogError::ConflictingAlias {
                            alias: alias.clone(),
                            model: config.id.clone(),
                            existing: catalog.models[*existing].id.clone(),
                        })
                    }
                    None => {
                        catalog.names.insert(alias.clone(), index);
                        catalog.models[index].aliases.insert(alias.clone());
                    }
                }
            }
        }

        Ok(catalog)
    }

    pub fn models(&self) -> &[Model] {
        &self.models
    }

    pub fn supports(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    /// Unknown names are returned unchanged.
    pub fn resolve(&self, name: &str) -> String {
        self.names
            .get(name)
            .map(|index| self.models[*index].id.clone())
            .unwrap_or_else(|| name.to_owned())
    }
}
