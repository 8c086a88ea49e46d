//! Category lookups against the category service, and a TTL cache in front of it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use libris_kernel::settings::CategorySettings;

use super::models::{Category, CategoryId};

#[derive(Debug, Error)]
pub enum CategoryError {
    #[error("category service request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("category service answered with status {0}")]
    Status(u16),

    #[error("category service payload could not be decoded: {0}")]
    Decode(String),
}

#[async_trait]
pub trait CategoryLookup: Send + Sync {
    /// `Ok(None)` when the category does not exist.
    async fn get_by_id(&self, id: CategoryId) -> Result<Option<Category>, CategoryError>;

    async fn get_all(&self) -> Result<Vec<Category>, CategoryError>;
}

#[async_trait]
impl<T: CategoryLookup + ?Sized> CategoryLookup for Arc<T> {
    async fn get_by_id(&self, id: CategoryId) -> Result<Option<Category>, CategoryError> {
        (**self).get_by_id(id).await
    }

    async fn get_all(&self) -> Result<Vec<Category>, CategoryError> {
        (**self).get_all().await
    }
}

/// Response envelope used by the category service.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct CategoryPayload {
    #[serde(alias = "ID")]
    id: Uuid,
    #[serde(alias = "Name")]
    name: String,
}

impl From<CategoryPayload> for Category {
    fn from(payload: CategoryPayload) -> Self {
        Category {
            id: payload.id.into(),
            name: payload.name,
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<Option<T>, CategoryError> {
    serde_json::from_slice::<Envelope<T>>(bytes)
        .map(|envelope| envelope.data)
        .map_err(|e| CategoryError::Decode(e.to_string()))
}

/// Talks to the category service's REST API.
#[derive(Debug, Clone)]
pub struct HttpCategoryClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCategoryClient {
    pub fn new(settings: &CategorySettings) -> Result<Self, CategoryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch(&self, path: &str) -> Result<Option<Vec<u8>>, CategoryError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            tracing::warn!(%url, status = status.as_u16(), "category service error");
            return Err(CategoryError::Status(status.as_u16()));
        }
        Ok(Some(response.bytes().await?.to_vec()))
    }
}

#[async_trait]
impl CategoryLookup for HttpCategoryClient {
    async fn get_by_id(&self, id: CategoryId) -> Result<Option<Category>, CategoryError> {
        let Some(body) = self.fetch(&format!("/categories/{id}")).await? else {
            return Ok(None);
        };
        Ok(decode::<CategoryPayload>(&body)?.map(Category::from))
    }

    async fn get_all(&self) -> Result<Vec<Category>, CategoryError> {
        let body = self
            .fetch("/categories")
            .await?
            .ok_or(CategoryError::Status(404))?;
        let categories = decode::<Vec<CategoryPayload>>(&body)?.unwrap_or_default();
        Ok(categories.into_iter().map(Category::from).collect())
    }
}

struct Snapshot {
    categories: Arc<Vec<Category>>,
    fetched_at: Instant,
}

/// Serves the full category list from a snapshot refreshed at most once per TTL.
///
/// The snapshot is replaced whole, never mutated. Concurrent refreshes are
/// collapsed into one remote call, and failed refreshes leave the previous
/// state untouched. A zero TTL disables caching entirely.
pub struct CategoryCache<C> {
    inner: C,
    ttl: Duration,
    snapshot: RwLock<Option<Snapshot>>,
    refresh: tokio::sync::Mutex<()>,
}

impl<C: CategoryLookup> CategoryCache<C> {
    pub fn new(inner: C, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            snapshot: RwLock::new(None),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    fn fresh(&self) -> Option<Arc<Vec<Category>>> {
        if self.ttl.is_zero() {
            return None;
        }
        self.snapshot
            .read()
            .as_ref()
            .filter(|snapshot| snapshot.fetched_at.elapsed() < self.ttl)
            .map(|snapshot| Arc::clone(&snapshot.categories))
    }

    /// Drop the snapshot so the next read goes remote.
    #[cfg(test)]
    fn invalidate(&self) {
        *self.snapshot.write() = None;
    }
}

#[async_trait]
impl<C: CategoryLookup> CategoryLookup for CategoryCache<C> {
    async fn get_by_id(&self, id: CategoryId) -> Result<Option<Category>, CategoryError> {
        if let Some(hit) = self
            .fresh()
            .and_then(|categories| categories.iter().find(|c| c.id == id).cloned())
        {
            return Ok(Some(hit));
        }
        self.inner.get_by_id(id).await
    }

    async fn get_all(&self) -> Result<Vec<Category>, CategoryError> {
        if self.ttl.is_zero() {
            return self.inner.get_all().await;
        }
        if let Some(categories) = self.fresh() {
            return Ok(categories.as_ref().clone());
        }

        let _refreshing = self.refresh.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(categories) = self.fresh() {
            return Ok(categories.as_ref().clone());
        }

        let categories = Arc::new(self.inner.get_all().await?);
        *self.snapshot.write() = Some(Snapshot {
            categories: Arc::clone(&categories),
            fetched_at: Instant::now(),
        });
        tracing::debug!(count = categories.len(), "category snapshot refreshed");
        Ok(categories.as_ref().clone())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{extract::Path, http::StatusCode, routing::get, Json, Router};
    use parking_lot::Mutex;
    use serde_json::json;

    /// Hand-rolled category service double.
    #[derive(Default)]
    pub(crate) struct FakeCategories {
        pub categories: Mutex<Vec<Category>>,
        pub failing: std::sync::atomic::AtomicBool,
        pub delay: Option<Duration>,
        pub all_calls: AtomicUsize,
        pub by_id_calls: AtomicUsize,
    }

    impl FakeCategories {
        pub fn with(categories: Vec<Category>) -> Self {
            Self {
                categories: Mutex::new(categories),
                ..Self::default()
            }
        }

        pub fn fail(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), CategoryError> {
            if self.failing.load(Ordering::SeqCst) {
                Err(CategoryError::Status(503))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl CategoryLookup for FakeCategories {
        async fn get_by_id(&self, id: CategoryId) -> Result<Option<Category>, CategoryError> {
            self.by_id_calls.fetch_add(1, Ordering::SeqCst);
            self.check()?;
            Ok(self.categories.lock().iter().find(|c| c.id == id).cloned())
        }

        async fn get_all(&self) -> Result<Vec<Category>, CategoryError> {
            self.all_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.check()?;
            Ok(self.categories.lock().clone())
        }
    }

    fn fiction() -> Category {
        Category {
            id: CategoryId::new(),
            name: "Fiction".into(),
        }
    }

    #[tokio::test]
    async fn snapshot_is_reused_within_ttl() {
        let fake = Arc::new(FakeCategories::with(vec![fiction()]));
        let cache = CategoryCache::new(fake.clone(), Duration::from_secs(60));

        assert_eq!(cache.get_all().await.unwrap().len(), 1);
        assert_eq!(cache.get_all().await.unwrap().len(), 1);
        assert_eq!(fake.all_calls.load(Ordering::SeqCst), 1);

        cache.invalidate();
        cache.get_all().await.unwrap();
        assert_eq!(fake.all_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_ttl_always_goes_remote() {
        let fake = Arc::new(FakeCategories::with(vec![fiction()]));
        let cache = CategoryCache::new(fake.clone(), Duration::ZERO);

        cache.get_all().await.unwrap();
        cache.get_all().await.unwrap();
        assert_eq!(fake.all_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_share_one_refresh() {
        let fake = Arc::new(FakeCategories {
            categories: Mutex::new(vec![fiction()]),
            delay: Some(Duration::from_millis(50)),
            ..FakeCategories::default()
        });
        let cache = Arc::new(CategoryCache::new(fake.clone(), Duration::from_secs(60)));

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_all().await })
            })
            .collect();
        for reader in readers {
            assert_eq!(reader.await.unwrap().unwrap().len(), 1);
        }
        assert_eq!(fake.all_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let fake = Arc::new(FakeCategories::with(vec![fiction()]));
        let cache = CategoryCache::new(fake.clone(), Duration::from_secs(60));

        fake.fail(true);
        assert!(matches!(
            cache.get_all().await,
            Err(CategoryError::Status(503))
        ));

        fake.fail(false);
        assert_eq!(cache.get_all().await.unwrap().len(), 1);
        assert_eq!(fake.all_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn by_id_uses_snapshot_then_falls_through() {
        let known = fiction();
        let fake = Arc::new(FakeCategories::with(vec![known.clone()]));
        let cache = CategoryCache::new(fake.clone(), Duration::from_secs(60));
        cache.get_all().await.unwrap();

        assert_eq!(cache.get_by_id(known.id).await.unwrap(), Some(known));
        assert_eq!(fake.by_id_calls.load(Ordering::SeqCst), 0);

        let added = Category {
            id: CategoryId::new(),
            name: "Poetry".into(),
        };
        fake.categories.lock().push(added.clone());
        assert_eq!(cache.get_by_id(added.id).await.unwrap(), Some(added));
        assert_eq!(fake.by_id_calls.load(Ordering::SeqCst), 1);
    }

    async fn category_service(known: Category) -> String {
        let listed = known.clone();
        let app = Router::new()
            .route(
                "/categories",
                get(move || {
                    let listed = listed.clone();
                    async move {
                        Json(json!({
                            "message": "success",
                            "data": [{ "ID": listed.id, "Name": listed.name }],
                            "statusCode": 200
                        }))
                    }
                }),
            )
            .route(
                "/categories/{id}",
                get(move |Path(id): Path<Uuid>| {
                    let known = known.clone();
                    async move {
                        if id == known.id.0 {
                            Ok(Json(json!({
                                "message": "success",
                                "data": { "ID": known.id, "Name": known.name },
                                "statusCode": 200
                            })))
                        } else {
                            Err(StatusCode::NOT_FOUND)
                        }
                    }
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{address}")
    }

    #[tokio::test]
    async fn http_client_reads_the_envelope() {
        let known = fiction();
        let base_url = category_service(known.clone()).await;
        let client = HttpCategoryClient::new(&CategorySettings {
            base_url,
            timeout_ms: 2000,
            cache_ttl_secs: 0,
        })
        .unwrap();

        assert_eq!(client.get_all().await.unwrap(), vec![known.clone()]);
        assert_eq!(client.get_by_id(known.id).await.unwrap(), Some(known));
        assert_eq!(client.get_by_id(CategoryId::new()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unreachable_service_is_a_transport_error() {
        let client = HttpCategoryClient::new(&CategorySettings {
            base_url: "http://127.0.0.1:1".into(),
            timeout_ms: 500,
            cache_ttl_secs: 0,
        })
        .unwrap();
        assert!(matches!(
            client.get_all().await,
            Err(CategoryError::Transport(_))
        ));
    }

    #[test]
    fn decode_accepts_null_data() {
        let decoded: Option<Vec<CategoryPayload>> =
            decode(br#"{"message":"ok","data":null,"statusCode":200}"#).unwrap();
        assert!(decoded.is_none());
        let absent: Option<CategoryPayload> = decode(br#"{"message":"not found"}"#).unwrap();
        assert!(absent.is_none());
        assert!(matches!(
            decode::<CategoryPayload>(b"not json"),
            Err(CategoryError::Decode(_))
        ));
    }
}
