use crate::{Extractor, WorkerPool};
use std::sync::Arc;
use tracing::{debug, warn};

/// True when `input` starts with `http://` or `https://`, ignoring case.
pub fn is_url(input: &str) -> bool {
    let has_prefix = |prefix: &str| {
        input
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    };
    has_prefix("http://") || has_prefix("https://")
}

/// Turns user input into a media URL.
#[derive(Clone)]
pub struct Resolver {
    extractor: Arc<dyn Extractor>,
    pool: WorkerPool,
}

impl Resolver {
    pub fn new(extractor: Arc<dyn Extractor>, pool: WorkerPool) -> Self {
        Self { extractor, pool }
    }

    /// URLs pass through untouched; anything else is searched and the first
    /// hit wins. `None` means nothing was found, including when the search
    /// itself failed.
    pub async fn resolve(&self, input: &str) -> Option<String> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }
        if is_url(input) {
            return Some(input.to_string());
        }

        let extractor = Arc::clone(&self.extractor);
        let query = input.to_string();
        match self
            .pool
            .run(async move { extractor.search(&query).await })
            .await
        {
            Ok(Some(url)) => {
                debug!(query = %input, url = %url, "Search resolved");
                Some(url)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(query = %input, "Search failed: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DownloadRequest, FetchError, MediaMetadata};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedSearch {
        hit: Result<Option<String>, String>,
        queries: Mutex<Vec<String>>,
    }

    impl ScriptedSearch {
        fn new(hit: Result<Option<&str>, &str>) -> Arc<Self> {
            Arc::new(Self {
                hit: hit.map(|h| h.map(str::to_string)).map_err(str::to_string),
                queries: Mutex::new(Vec::new()),
            })
        }

        fn queries(&self) -> Vec<String> {
            self.queries.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl Extractor for ScriptedSearch {
        async fn search(&self, query: &str) -> Result<Option<String>, FetchError> {
            self.queries.lock().expect("lock").push(query.to_string());
            self.hit.clone().map_err(FetchError::Extraction)
        }

        async fn download(&self, _: &DownloadRequest) -> Result<MediaMetadata, FetchError> {
            unreachable!("resolver never downloads")
        }
    }

    fn pool() -> WorkerPool {
        WorkerPool::new(1, Duration::from_secs(5))
    }

    #[test]
    fn is_url_matches_scheme_case_insensitively() {
        assert!(is_url("https://example.com/x"));
        assert!(is_url("HTTP://EXAMPLE.COM"));
        assert!(!is_url("ftp://example.com"));
        assert!(!is_url("some song name"));
        assert!(!is_url("see https://example.com"));
        assert!(!is_url("ht"));
    }

    #[tokio::test]
    async fn url_passes_through_without_search() {
        let extractor = ScriptedSearch::new(Ok(Some("https://unused")));
        let resolver = Resolver::new(extractor.clone(), pool());
        assert_eq!(
            resolver.resolve("https://example.com/x").await.as_deref(),
            Some("https://example.com/x")
        );
        assert!(extractor.queries().is_empty());
    }

    #[tokio::test]
    async fn free_text_uses_first_search_result() {
        let extractor = ScriptedSearch::new(Ok(Some("https://www.youtube.com/watch?v=first")));
        let resolver = Resolver::new(extractor.clone(), pool());
        assert_eq!(
            resolver.resolve("some song name").await.as_deref(),
            Some("https://www.youtube.com/watch?v=first")
        );
        assert_eq!(extractor.queries(), vec!["some song name".to_string()]);
    }

    #[tokio::test]
    async fn no_results_and_search_errors_are_not_found() {
        let empty = ScriptedSearch::new(Ok(None));
        assert_eq!(Resolver::new(empty, pool()).resolve("nothing").await, None);

        let failing = ScriptedSearch::new(Err("ERROR: network down"));
        assert_eq!(Resolver::new(failing, pool()).resolve("anything").await, None);
    }
}
