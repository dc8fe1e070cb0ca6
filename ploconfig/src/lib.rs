//! # Configuration du player
//!
//! Ce module gère la configuration persistée du moteur de lecture :
//! - Réglages typés (`Settings`) chargés/sauvés en YAML
//! - Préférences clé/valeur (`Preferences`) pour l'état d'installation
//! - Identifiant d'installation (`VendorIdentifier`), généré une seule fois
//!
//! Contrairement au reste de l'état du moteur, tout ici survit aux
//! redémarrages. Le chargement ne doit jamais être fatal : un fichier
//! absent ou illisible retombe sur les valeurs par défaut.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

mod preferences;

pub use preferences::Preferences;

/// Clé des préférences sous laquelle l'identifiant d'installation est rangé.
pub const VENDOR_IDENTIFIER_KEY: &str = "VendorIdentifier";

/// URL par défaut de l'API d'administration.
pub const DEFAULT_BASE_URL: &str = "https://admin-api.playola.fm";

/// Taille maximale du cache audio (50 MiB).
pub const DEFAULT_MAX_CACHE_BYTES: u64 = 50 * 1024 * 1024;

/// Fenêtre de préparation anticipée des spins, en secondes.
pub const DEFAULT_LOOKAHEAD_SECS: u64 = 360;

/// Période de rafraîchissement du programme, en secondes.
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 30;

/// Réglages typés du moteur.
///
/// Chargés depuis un fichier YAML ; toute clé absente prend sa valeur par
/// défaut. La structure est volontairement plate, un niveau suffit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// URL de base de l'API (programme + télémétrie).
    pub base_url: String,
    /// Répertoire de données de l'application.
    pub data_dir: PathBuf,
    /// Borne souple du cache de fichiers audio, en octets.
    pub max_cache_bytes: u64,
    /// Fenêtre de préparation anticipée, en secondes.
    pub lookahead_secs: u64,
    /// Période de rafraîchissement du programme, en secondes.
    pub refresh_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            data_dir: default_data_dir(),
            max_cache_bytes: DEFAULT_MAX_CACHE_BYTES,
            lookahead_secs: DEFAULT_LOOKAHEAD_SECS,
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
        }
    }
}

impl Settings {
    /// Charge les réglages depuis un fichier YAML.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read settings file {:?}", path.as_ref()))?;
        let settings = serde_yaml::from_str(&text)
            .with_context(|| format!("Failed to parse settings file {:?}", path.as_ref()))?;
        Ok(settings)
    }

    /// Charge les réglages, ou retombe sur les valeurs par défaut.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path.as_ref()) {
            Ok(settings) => settings,
            Err(e) => {
                if path.as_ref().exists() {
                    warn!("Settings: falling back to defaults: {}", e);
                }
                Self::default()
            }
        }
    }

    /// Sauve les réglages en YAML (création des répertoires au besoin).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let text = serde_yaml::to_string(self)?;
        fs::write(path.as_ref(), text)?;
        Ok(())
    }

    /// Sous-répertoire des fichiers audio téléchargés.
    pub fn audio_files_dir(&self) -> PathBuf {
        self.data_dir.join("AudioFiles")
    }

    /// Fichier de préférences de l'installation.
    pub fn preferences_path(&self) -> PathBuf {
        self.data_dir.join("preferences.yaml")
    }
}

/// Répertoire de données par défaut, propre à la plateforme.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("playola")
}

/// Retourne l'identifiant d'installation, en le générant au premier appel.
///
/// L'identifiant est un UUID v4 rangé dans les préférences sous
/// [`VENDOR_IDENTIFIER_KEY`]. Une valeur déjà présente est toujours
/// réutilisée telle quelle.
pub fn vendor_identifier(preferences: &mut Preferences) -> Result<String> {
    if let Some(existing) = preferences.get_string(VENDOR_IDENTIFIER_KEY) {
        if !existing.is_empty() {
            return Ok(existing);
        }
    }

    let generated = Uuid::new_v4().to_string();
    preferences.set_string(VENDOR_IDENTIFIER_KEY, &generated);
    preferences
        .save()
        .map_err(|e| anyhow!("Failed to persist vendor identifier: {}", e))?;
    info!("Config: generated vendor identifier {}", generated);
    Ok(generated)
}
