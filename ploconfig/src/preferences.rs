//! Préférences clé/valeur persistées en YAML.
//!
//! Stockage plat, tolérant : un fichier absent ou corrompu donne un
//! magasin vide, jamais une erreur.

use anyhow::{Context, Result};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::PathBuf;
use tracing::warn;

/// Magasin clé/valeur adossé à un fichier YAML.
#[derive(Debug)]
pub struct Preferences {
    path: PathBuf,
    values: Mapping,
}

impl Preferences {
    /// Ouvre (ou initialise à vide) les préférences du fichier donné.
    pub fn open<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(text) => match serde_yaml::from_str::<Value>(&text) {
                Ok(Value::Mapping(map)) => map,
                Ok(_) => {
                    warn!("Preferences: {:?} is not a mapping, starting empty", path);
                    Mapping::new()
                }
                Err(e) => {
                    warn!("Preferences: failed to parse {:?}: {}", path, e);
                    Mapping::new()
                }
            },
            Err(_) => Mapping::new(),
        };

        Self { path, values }
    }

    /// Valeur chaîne associée à `key`, si présente.
    pub fn get_string(&self, key: &str) -> Option<String> {
        match self.values.get(Value::String(key.to_string())) {
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        }
    }

    /// Range une valeur chaîne sous `key` (en mémoire ; voir [`save`]).
    ///
    /// [`save`]: Preferences::save
    pub fn set_string(&mut self, key: &str, value: &str) {
        self.values.insert(
            Value::String(key.to_string()),
            Value::String(value.to_string()),
        );
    }

    /// Supprime une clé. Retourne vrai si elle existait.
    pub fn remove(&mut self, key: &str) -> bool {
        self.values
            .remove(Value::String(key.to_string()))
            .is_some()
    }

    /// Écrit le magasin sur disque.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let text = serde_yaml::to_string(&Value::Mapping(self.values.clone()))?;
        fs::write(&self.path, text)
            .with_context(|| format!("Failed to write preferences {:?}", self.path))?;
        Ok(())
    }
}
