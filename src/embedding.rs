//! Text embedding providers and their lazy, memoized initialisation.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::{sync::OnceCell, task::JoinHandle};
use tracing::{info, warn};

use crate::error::Result;

/// Turns texts into fixed-length, L2-normalised vectors.
///
/// Implementations are synchronous and may be CPU heavy; async callers run
/// them on the blocking pool.
pub trait EmbeddingProvider: Send + Sync {
    /// Identifier stored alongside every vector this provider produces.
    /// Vectors from different models are never compared.
    fn model(&self) -> &str;

    /// One vector per input text, in input order.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

pub type SharedProvider = Arc<dyn EmbeddingProvider>;

type Loader = Box<dyn FnOnce() -> Result<SharedProvider> + Send>;

type LoadTask = JoinHandle<Result<SharedProvider>>;

/// A provider that is loaded on first use.
///
/// The first call to [`LazyEmbedder::get`] runs the loader on the blocking
/// pool. A failed load is logged once and remembered as "unavailable" for
/// the lifetime of this value; it is never retried. Dropping a `get` future
/// mid-load does not lose the load: the next caller waits on the same task.
pub struct LazyEmbedder {
    cell: OnceCell<Option<SharedProvider>>,
    loader: Mutex<Option<Loader>>,
    running: tokio::sync::Mutex<Option<LoadTask>>,
}

impl LazyEmbedder {
    pub fn new(
        loader: impl FnOnce() -> Result<SharedProvider> + Send + 'static,
    ) -> Self {
        Self {
            cell: OnceCell::new(),
            loader: Mutex::new(Some(Box::new(loader))),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// An embedder that is already loaded.
    pub fn ready(provider: SharedProvider) -> Self {
        Self {
            cell: OnceCell::new_with(Some(Some(provider))),
            loader: Mutex::new(None),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// An embedder that will never be available. Search stays lexical.
    pub fn unavailable() -> Self {
        Self {
            cell: OnceCell::new_with(Some(None)),
            loader: Mutex::new(None),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }

    /// The provider, loading it if this is the first call.
    ///
    /// `None` is a normal outcome, not an error.
    pub async fn get(&self) -> Option<SharedProvider> {
        self.cell.get_or_init(|| self.load()).await.clone()
    }

    async fn load(&self) -> Option<SharedProvider> {
        let mut running = self.running.lock().await;
        if running.is_none() {
            let loader = self
                .loader
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            let loader = loader?;
            *running = Some(tokio::task::spawn_blocking(loader));
        }
        let task = running.as_mut()?;
        let joined = task.await;
        *running = None;

        match joined {
            Ok(Ok(provider)) => {
                info!(model = provider.model(), "embedding model loaded");
                Some(provider)
            }
            Ok(Err(error)) => {
                warn!(%error, "embedding model unavailable, using lexical search only");
                None
            }
            Err(error) => {
                warn!(%error, "embedding model loader panicked");
                None
            }
        }
    }
}

impl std::fmt::Debug for LazyEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyEmbedder")
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x00000100000001B3;

/// Deterministic feature-hashing embedder.
///
/// Character 3- and 4-grams are hashed with FNV-1a into a fixed number of
/// signed buckets. Needs no model download, so it backs tests and the
/// `--embedder hash` CLI option.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
    model: String,
}

impl HashEmbedder {
    /// A zero `dimension` is raised to 1.
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            dimension,
            model: format!("fnv1a-hash-{dimension}"),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let chars: Vec<char> = text.to_lowercase().chars().collect();

        for n in 3..=4 {
            if n > chars.len() {
                continue;
            }
            for window in chars.windows(n) {
                let ngram: String = window.iter().collect();
                let h = fnv1a(ngram.as_bytes());
                let bucket = (h as usize) % self.dimension;
                let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
                vector[bucket] += sign;
            }
        }

        l2_normalize(&mut vector);
        vector
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EmbeddingProvider for HashEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Scale `v` to unit length in place. Zero vectors are left alone.
pub(crate) fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::error::Error;

    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn hash_embedding_is_unit_length() {
        let emb = HashEmbedder::new(64);
        let v = emb.embed(&["hello world".to_string()]).unwrap();
        assert_eq!(v[0].len(), 64);
        assert!((dot(&v[0], &v[0]).sqrt() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn hash_embedding_is_deterministic_and_case_insensitive() {
        let emb = HashEmbedder::default();
        let v = emb
            .embed(&["Bananas".to_string(), "bananas".to_string()])
            .unwrap();
        assert_eq!(v[0], v[1]);
        assert_eq!(emb.model(), "fnv1a-hash-256");
    }

    #[test]
    fn hash_embedding_of_short_text_is_zero() {
        let emb = HashEmbedder::new(32);
        let v = emb.embed(&["ab".to_string()]).unwrap();
        assert!(v[0].iter().all(|&x| x == 0.0));
    }

    #[test]
    fn similar_texts_are_closer() {
        let emb = HashEmbedder::new(256);
        let v = emb
            .embed(&[
                "the whale surfaced".to_string(),
                "a whale surfaced again".to_string(),
                "quiet library afternoon".to_string(),
            ])
            .unwrap();
        assert!(dot(&v[0], &v[1]) > dot(&v[0], &v[2]));
    }

    #[test]
    fn zero_dimension_is_clamped() {
        let emb = HashEmbedder::new(0);
        assert_eq!(emb.dimension(), 1);
        assert_eq!(emb.model(), "fnv1a-hash-1");

        let v = emb.embed(&["whale song".to_string()]).unwrap();
        assert_eq!(v[0].len(), 1);
    }

    #[tokio::test]
    async fn dropped_get_does_not_lose_the_load() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let lazy = LazyEmbedder::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(200));
            Ok(Arc::new(HashEmbedder::new(8)) as SharedProvider)
        });

        let early = tokio::time::timeout(Duration::from_millis(10), lazy.get()).await;
        assert!(early.is_err());
        assert!(!lazy.is_initialized());

        let provider = lazy.get().await.expect("load finishes for the next caller");
        assert_eq!(provider.model(), "fnv1a-hash-8");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lazy_embedder_loads_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let lazy = LazyEmbedder::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(HashEmbedder::new(8)) as SharedProvider)
        });

        assert!(!lazy.is_initialized());
        let first = lazy.get().await.unwrap();
        let second = lazy.get().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(lazy.is_initialized());
    }

    #[tokio::test]
    async fn lazy_embedder_caches_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let lazy = LazyEmbedder::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::Embedding("no runtime".to_string()))
        });

        assert!(lazy.get().await.is_none());
        assert!(lazy.get().await.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ready_and_unavailable_constructors() {
        let ready = LazyEmbedder::ready(Arc::new(HashEmbedder::new(8)));
        assert!(ready.is_initialized());
        assert_eq!(ready.get().await.unwrap().model(), "fnv1a-hash-8");

        let none = LazyEmbedder::unavailable();
        assert!(none.is_initialized());
        assert!(none.get().await.is_none());
    }

    #[test]
    fn l2_normalize_unit() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 0.001);
        assert!((v[1] - 0.8).abs() < 0.001);

        let mut zero = vec![0.0, 0.0];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }
}
