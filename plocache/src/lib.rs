//! Cache de fichiers audio et coordinateur de téléchargements.
//!
//! Deux briques :
//! - [`FileCache`] : cache disque borné, adressé par URL, avec épinglage
//!   des fichiers en cours d'utilisation et éviction par date de création.
//! - [`Downloader`] : téléchargements concurrents dédupliqués par URL,
//!   avec progression, annulation et écriture atomique dans le cache.
//!
//! Le cache est une borne souple : une erreur d'éviction est loggée et
//! avalée. Seule l'impossibilité de créer le répertoire au démarrage est
//! fatale au moteur.

mod cache;
mod download;
mod error;

pub use cache::FileCache;
pub use download::{DownloadEvent, DownloadId, Downloader};
pub use error::DownloadError;
