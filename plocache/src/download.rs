//! Coordinateur de téléchargements
//!
//! Télécharge une URL vers un fichier temporaire, le déplace atomiquement
//! vers le chemin assigné par le cache, et publie la progression sur un
//! channel d'événements. Au plus un transfert en vol par URL : un second
//! appelant pour la même URL s'attache au flux existant.
//!
//! Aucun retry transport ici : la décision de réessayer dépend de
//! l'urgence du programme et appartient au planificateur.

use crate::{cache::FileCache, error::DownloadError};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Identifiant d'un téléchargement en vol.
pub type DownloadId = u64;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RESOURCE_TIMEOUT: Duration = Duration::from_secs(300);

/// Granularité minimale de publication de la progression.
const PROGRESS_STEP: f32 = 0.01;

/// Événement publié par un téléchargement.
///
/// Un flux se termine toujours par exactement un événement terminal :
/// `Completed`, `Failed` ou `Cancelled`.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    /// Fraction téléchargée, dans [0, 1].
    Progress(f32),
    /// Fichier en place dans le cache.
    Completed(PathBuf),
    /// Échec terminal.
    Failed(DownloadError),
    /// Annulé par l'appelant.
    Cancelled,
}

impl DownloadEvent {
    /// Cet événement clôt-il le flux ?
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress(_))
    }
}

struct Inflight {
    id: DownloadId,
    token: CancellationToken,
    subscribers: Vec<mpsc::UnboundedSender<DownloadEvent>>,
}

struct Inner {
    cache: Arc<FileCache>,
    client: reqwest::Client,
    inflight: Mutex<HashMap<String, Inflight>>,
    next_id: AtomicU64,
}

/// Coordinateur de téléchargements, clonable à bas coût.
#[derive(Clone)]
pub struct Downloader {
    inner: Arc<Inner>,
}

impl Downloader {
    pub fn new(cache: Arc<FileCache>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(REQUEST_TIMEOUT)
            .timeout(RESOURCE_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            inner: Arc::new(Inner {
                cache,
                client,
                inflight: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Démarre (ou rejoint) le téléchargement d'une URL.
    ///
    /// Retourne l'identifiant du transfert et le flux d'événements. Si le
    /// fichier est déjà en cache, le flux émet immédiatement
    /// `Progress(1.0)` puis `Completed` — toujours via le channel, jamais
    /// en appel direct.
    pub fn download(&self, url: &str) -> (DownloadId, mpsc::UnboundedReceiver<DownloadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();

        if self.inner.cache.exists(url) {
            let path = self.inner.cache.local_path_for(url);
            debug!("Downloader: cache hit for {}", url);
            let _ = tx.send(DownloadEvent::Progress(1.0));
            let _ = tx.send(DownloadEvent::Completed(path));
            return (self.inner.next_id.fetch_add(1, Ordering::Relaxed), rx);
        }

        let mut inflight = self.inner.inflight.lock().unwrap();
        if let Some(entry) = inflight.get_mut(url) {
            // Déduplication : on s'attache au transfert existant.
            debug!("Downloader: joining in-flight transfer for {}", url);
            entry.subscribers.push(tx);
            return (entry.id, rx);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        inflight.insert(
            url.to_string(),
            Inflight {
                id,
                token: token.clone(),
                subscribers: vec![tx],
            },
        );
        drop(inflight);

        let inner = Arc::clone(&self.inner);
        let url = url.to_string();
        tokio::spawn(async move {
            transfer(inner, url, token).await;
        });

        (id, rx)
    }

    /// Annule un téléchargement par identifiant.
    pub fn cancel(&self, id: DownloadId) {
        let inflight = self.inner.inflight.lock().unwrap();
        for entry in inflight.values() {
            if entry.id == id {
                entry.token.cancel();
                return;
            }
        }
    }

    /// Annule le téléchargement d'une URL, s'il est en vol.
    pub fn cancel_for(&self, url: &str) {
        let inflight = self.inner.inflight.lock().unwrap();
        if let Some(entry) = inflight.get(url) {
            entry.token.cancel();
        }
    }

    /// Annule tous les téléchargements en vol.
    pub fn cancel_all(&self) {
        let inflight = self.inner.inflight.lock().unwrap();
        for entry in inflight.values() {
            entry.token.cancel();
        }
    }

    /// Nombre de transferts en vol (pour les tests et les logs).
    pub fn inflight_count(&self) -> usize {
        self.inner.inflight.lock().unwrap().len()
    }
}

/// Publie un événement à tous les abonnés actuels d'une URL.
fn broadcast(inner: &Inner, url: &str, event: DownloadEvent) {
    let subscribers: Vec<_> = {
        let mut inflight = inner.inflight.lock().unwrap();
        match inflight.get_mut(url) {
            Some(entry) => {
                entry.subscribers.retain(|tx| !tx.is_closed());
                entry.subscribers.clone()
            }
            None => return,
        }
    };
    for tx in subscribers {
        let _ = tx.send(event.clone());
    }
}

/// Retire l'entrée en vol et publie l'événement terminal.
fn finish(inner: &Inner, url: &str, event: DownloadEvent) {
    let entry = inner.inflight.lock().unwrap().remove(url);
    if let Some(entry) = entry {
        for tx in entry.subscribers {
            let _ = tx.send(event.clone());
        }
    }
}

async fn transfer(inner: Arc<Inner>, url: String, token: CancellationToken) {
    let final_path = inner.cache.local_path_for(&url);
    let tmp_path = part_path(&final_path);

    let result = tokio::select! {
        _ = token.cancelled() => Err(DownloadError::Cancelled),
        r = fetch_to_file(&inner, &url, &tmp_path) => r,
    };

    match result {
        Ok(()) => match tokio::fs::rename(&tmp_path, &final_path).await {
            Ok(()) => {
                debug!("Downloader: completed {} -> {:?}", url, final_path);
                broadcast(&inner, &url, DownloadEvent::Progress(1.0));
                finish(&inner, &url, DownloadEvent::Completed(final_path));
            }
            Err(e) => {
                warn!("Downloader: move failed for {}: {}", url, e);
                let _ = tokio::fs::remove_file(&tmp_path).await;
                finish(
                    &inner,
                    &url,
                    DownloadEvent::Failed(DownloadError::MoveFailed(e.to_string())),
                );
            }
        },
        Err(DownloadError::Cancelled) => {
            debug!("Downloader: cancelled {}", url);
            let _ = tokio::fs::remove_file(&tmp_path).await;
            finish(&inner, &url, DownloadEvent::Cancelled);
        }
        Err(e) => {
            warn!("Downloader: failed {}: {}", url, e);
            let _ = tokio::fs::remove_file(&tmp_path).await;
            finish(&inner, &url, DownloadEvent::Failed(e));
        }
    }
}

async fn fetch_to_file(inner: &Inner, url: &str, tmp_path: &Path) -> Result<(), DownloadError> {
    let response = inner
        .client
        .get(url)
        .send()
        .await
        .map_err(|e| DownloadError::from_reqwest(&e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::HttpStatus(status.as_u16()));
    }

    if !inner.cache.dir().is_dir() {
        return Err(DownloadError::DirectoryMissing);
    }

    let mut file = tokio::fs::File::create(tmp_path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            DownloadError::DirectoryMissing
        } else {
            DownloadError::Unknown(e.to_string())
        }
    })?;

    let total = response.content_length();
    let mut received: u64 = 0;
    let mut last_published: f32 = -1.0;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| DownloadError::from_reqwest(&e))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| DownloadError::Unknown(e.to_string()))?;
        received += chunk.len() as u64;

        if let Some(total) = total {
            if total > 0 {
                let fraction = (received as f32 / total as f32).clamp(0.0, 1.0);
                if fraction - last_published >= PROGRESS_STEP && fraction < 1.0 {
                    last_published = fraction;
                    broadcast(inner, url, DownloadEvent::Progress(fraction));
                }
            }
        }
    }

    file.flush()
        .await
        .map_err(|e| DownloadError::Unknown(e.to_string()))?;

    Ok(())
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}
