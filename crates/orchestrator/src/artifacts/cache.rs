use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
};

use super::ArtifactsError;

type Slot<T> = Arc<tokio::sync::Mutex<Option<Result<T, ArtifactsError>>>>;

/// Memoizes the outcome of one fetch per key.
///
/// The first caller for a key runs the fetch while holding that key's lock.
/// Everyone else, concurrent or later, gets the stored outcome. Failures are
/// stored too and never retried. Different keys never wait on each other.
pub struct BundleCache<T> {
    entries: Mutex<HashMap<String, Slot<T>>>,
}

impl<T: Clone> Default for BundleCache<T> {
    fn default() -> Self {
        BundleCache {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> BundleCache<T> {
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<T, ArtifactsError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = eyre::Result<T>>,
    {
        let slot = self
            .entries
            .lock()
            .expect("acquire bundle cache lock")
            .entry(key.to_string())
            .or_default()
            .clone();

        let mut slot = slot.lock().await;
        if let Some(outcome) = slot.as_ref() {
            tracing::debug!("bundle {key} served from cache");
            return outcome.clone();
        }

        let outcome = fetch().await.map_err(|err| {
            tracing::error!("fetching bundle {key} failed: {err:#}");
            ArtifactsError::FetchFailed {
                key: key.to_string(),
                reason: format!("{err:#}"),
            }
        });
        *slot = Some(outcome.clone());
        outcome
    }
}
