//! Cache disque des fichiers audio
//!
//! Le cache associe une URL distante à un chemin local stable. Les
//! fichiers sont immuables une fois écrits ; l'éviction se fait par date
//! de création croissante (le mtime serait touché par les lectures et
//! courserait les téléchargements). Un fichier épinglé n'est jamais
//! évincé.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Cache de fichiers borné, adressé par URL.
///
/// Les métadonnées (épingles) vivent en mémoire : elles appartiennent à
/// la session de lecture en cours, pas au disque. Les compteurs sont des
/// références : `pin` deux fois demande `unpin` deux fois.
pub struct FileCache {
    dir: PathBuf,
    max_bytes: u64,
    pins: Mutex<HashMap<PathBuf, usize>>,
}

impl FileCache {
    /// Ouvre le cache dans `dir`, créé au besoin.
    ///
    /// L'échec de création du répertoire est fatal au moteur.
    pub fn new<P: Into<PathBuf>>(dir: P, max_bytes: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create cache directory {:?}", dir))?;
        info!("FileCache: using {:?} (max {} bytes)", dir, max_bytes);

        Ok(Self {
            dir,
            max_bytes,
            pins: Mutex::new(HashMap::new()),
        })
    }

    /// Répertoire du cache.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Borne configurée, en octets.
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Chemin local d'une URL (pur, déterministe).
    ///
    /// Dernier segment de chemin de l'URL, préfixé d'un court hash de
    /// l'URL complète pour désambiguïser deux segments identiques.
    pub fn local_path_for(&self, url: &str) -> PathBuf {
        let segment = url
            .split('?')
            .next()
            .unwrap_or(url)
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("file");
        let segment: String = segment
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            })
            .collect();

        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        let digest = hasher.finalize();
        let prefix = hex::encode(&digest[..4]);

        self.dir.join(format!("{}-{}", prefix, segment))
    }

    /// Le fichier de cette URL est-il présent ?
    pub fn exists(&self, url: &str) -> bool {
        self.local_path_for(url).is_file()
    }

    /// Épingle le fichier d'une URL contre l'éviction (compté).
    pub fn pin(&self, url: &str) {
        let path = self.local_path_for(url);
        let mut pins = self.pins.lock().unwrap();
        let count = pins.entry(path.clone()).or_insert(0);
        *count += 1;
        debug!("FileCache: pinned {:?} (count {})", path, count);
    }

    /// Relâche une épingle posée par [`pin`].
    ///
    /// [`pin`]: FileCache::pin
    pub fn unpin(&self, url: &str) {
        let path = self.local_path_for(url);
        let mut pins = self.pins.lock().unwrap();
        match pins.get_mut(&path) {
            Some(count) if *count > 1 => {
                *count -= 1;
                debug!("FileCache: unpinned {:?} (count {})", path, count);
            }
            Some(_) => {
                pins.remove(&path);
                debug!("FileCache: unpinned {:?} (count 0)", path);
            }
            None => {
                warn!("FileCache: unpin without pin for {:?}", path);
            }
        }
    }

    /// Le chemin est-il actuellement épinglé ?
    pub fn is_pinned(&self, path: &Path) -> bool {
        self.pins.lock().unwrap().contains_key(path)
    }

    /// Relâche toutes les épingles (fin de session).
    pub fn unpin_all(&self) {
        self.pins.lock().unwrap().clear();
    }

    /// Taille totale des fichiers du cache, en octets.
    pub fn total_bytes(&self) -> u64 {
        self.entries().iter().map(|e| e.bytes).sum()
    }

    /// Éviction jusqu'à `target_bytes`.
    ///
    /// Supprime les fichiers par date de création croissante (nom de
    /// fichier en clé secondaire), en sautant les épinglés et les
    /// `excluded`, jusqu'à ce que le total passe sous la cible ou qu'il
    /// ne reste plus rien d'évincable. Les erreurs d'E/S sont loggées et
    /// avalées : le cache est une borne souple.
    pub fn prune(&self, target_bytes: u64, excluded: &HashSet<PathBuf>) {
        let mut entries = self.entries();
        entries.sort_by(|a, b| {
            a.created
                .cmp(&b.created)
                .then_with(|| a.path.cmp(&b.path))
        });

        let mut total: u64 = entries.iter().map(|e| e.bytes).sum();
        if total <= target_bytes {
            return;
        }

        for entry in entries {
            if total <= target_bytes {
                break;
            }
            if self.is_pinned(&entry.path) || excluded.contains(&entry.path) {
                continue;
            }
            match fs::remove_file(&entry.path) {
                Ok(()) => {
                    total = total.saturating_sub(entry.bytes);
                    debug!("FileCache: evicted {:?} ({} bytes)", entry.path, entry.bytes);
                }
                Err(e) => {
                    warn!("FileCache: failed to evict {:?}: {}", entry.path, e);
                }
            }
        }

        if total > target_bytes {
            debug!(
                "FileCache: still {} bytes after prune (target {}), rest is pinned",
                total, target_bytes
            );
        }
    }

    /// Éviction vers la borne configurée.
    pub fn prune_to_limit(&self, excluded: &HashSet<PathBuf>) {
        self.prune(self.max_bytes, excluded);
    }

    /// Supprime tous les fichiers non épinglés.
    pub fn clear(&self) {
        for entry in self.entries() {
            if self.is_pinned(&entry.path) {
                continue;
            }
            if let Err(e) = fs::remove_file(&entry.path) {
                warn!("FileCache: failed to remove {:?}: {}", entry.path, e);
            }
        }
    }

    /// Liste les fichiers du cache (fichiers temporaires exclus).
    fn entries(&self) -> Vec<CacheEntry> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) => {
                warn!("FileCache: failed to list {:?}: {}", self.dir, e);
                return Vec::new();
            }
        };

        let mut entries = Vec::new();
        for item in read_dir.flatten() {
            let path = item.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().is_some_and(|ext| ext == "part") {
                continue;
            }
            let meta = match item.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!("FileCache: failed to stat {:?}: {}", path, e);
                    continue;
                }
            };
            // created() n'est pas disponible sur tous les systèmes de
            // fichiers ; le mtime d'un fichier immuable en est un bon
            // substitut.
            let created = meta
                .created()
                .or_else(|_| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push(CacheEntry {
                path,
                bytes: meta.len(),
                created,
            });
        }
        entries
    }
}

struct CacheEntry {
    path: PathBuf,
    bytes: u64,
    created: SystemTime,
}
