use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::Stream;
use image::GenericImageView;
use lru::LruCache;
use tokio::task::AbortHandle;
use url::Url;

use crate::core::remote::{FetchError, ImageSource};

pub const DEFAULT_CAPACITY: usize = 64;

/// A decoded icon: RGBA8 pixels, row-major.
#[derive(Debug, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImageLoadError {
    #[error("image fetch failed: {0}")]
    Fetch(FetchError),

    #[error("image decode failed: {0}")]
    Decode(String),

    #[error("image load cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub enum ImageEvent {
    Loading,
    Loaded(Arc<DecodedImage>),
    Failed(ImageLoadError),
}

type ImageResult = Result<Arc<DecodedImage>, ImageLoadError>;
type Flight = Shared<BoxFuture<'static, ImageResult>>;

struct InFlight {
    id: u64,
    flight: Flight,
    subscribers: usize,
    abort: AbortHandle,
}

struct State {
    cache: LruCache<Url, Arc<DecodedImage>>,
    inflight: HashMap<Url, InFlight>,
    next_id: u64,
}

struct Inner {
    source: Arc<dyn ImageSource>,
    state: Mutex<State>,
}

enum Subscribed {
    Hit(Arc<DecodedImage>),
    Joined(u64, Flight),
}

/// Loads icons with one fetch per URL and a shared LRU of decoded images.
#[derive(Clone)]
pub struct ImageLoader {
    inner: Arc<Inner>,
}

impl ImageLoader {
    pub fn new(source: Arc<dyn ImageSource>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        ImageLoader {
            inner: Arc::new(Inner {
                source,
                state: Mutex::new(State {
                    cache: LruCache::new(capacity),
                    inflight: HashMap::new(),
                    next_id: 0,
                }),
            }),
        }
    }

    /// Subscribe to `url`. Nothing is fetched until the stream is polled.
    pub fn load(&self, url: Url) -> ImageSubscription {
        ImageSubscription {
            inner: self.inner.clone(),
            url,
            phase: Phase::Idle,
        }
    }

    /// Cached image for `url`, without touching its recency.
    pub fn cached(&self, url: &Url) -> Option<Arc<DecodedImage>> {
        self.inner.lock().cache.peek(url).cloned()
    }

    pub fn is_loading(&self, url: &Url) -> bool {
        self.inner.lock().inflight.contains_key(url)
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn subscribe(self: &Arc<Self>, url: &Url) -> Subscribed {
        let mut state = self.lock();
        if let Some(image) = state.cache.get(url) {
            return Subscribed::Hit(image.clone());
        }
        if let Some(entry) = state.inflight.get_mut(url) {
            entry.subscribers += 1;
            return Subscribed::Joined(entry.id, entry.flight.clone());
        }

        let id = state.next_id;
        state.next_id += 1;
        log::debug!("Fetching icon {}", url);

        let inner = self.clone();
        let task_url = url.clone();
        let task = tokio::spawn(async move {
            let result = fetch_and_decode(inner.source.as_ref(), &task_url).await;
            inner.finish(&task_url, id, &result);
            result
        });
        let abort = task.abort_handle();
        let flight = async move { task.await.unwrap_or(Err(ImageLoadError::Cancelled)) }
            .boxed()
            .shared();

        state.inflight.insert(
            url.clone(),
            InFlight {
                id,
                flight: flight.clone(),
                subscribers: 1,
                abort,
            },
        );
        Subscribed::Joined(id, flight)
    }

    /// Publish a finished fetch. A flight that was cancelled in the meantime
    /// is no longer registered and leaves the cache alone.
    fn finish(&self, url: &Url, id: u64, result: &ImageResult) {
        let mut state = self.lock();
        if !state.inflight.get(url).is_some_and(|entry| entry.id == id) {
            return;
        }
        state.inflight.remove(url);
        match result {
            Ok(image) => {
                state.cache.put(url.clone(), image.clone());
            }
            Err(e) => log::debug!("Icon {} failed: {}", url, e),
        }
    }

    fn unsubscribe(&self, url: &Url, id: u64) {
        let mut state = self.lock();
        let Some(entry) = state.inflight.get_mut(url) else {
            return;
        };
        if entry.id != id {
            return;
        }
        entry.subscribers -= 1;
        if entry.subscribers == 0 {
            entry.abort.abort();
            state.inflight.remove(url);
            log::debug!("Cancelled icon fetch {}", url);
        }
    }
}

async fn fetch_and_decode(source: &dyn ImageSource, url: &Url) -> ImageResult {
    let bytes = source.fetch_image(url).await.map_err(ImageLoadError::Fetch)?;
    let decoded = tokio::task::spawn_blocking(move || decode(&bytes))
        .await
        .map_err(|e| ImageLoadError::Decode(format!("decoder task failed: {e}")))??;
    Ok(Arc::new(decoded))
}

fn decode(bytes: &[u8]) -> Result<DecodedImage, ImageLoadError> {
    let image =
        image::load_from_memory(bytes).map_err(|e| ImageLoadError::Decode(e.to_string()))?;
    let (width, height) = image.dimensions();
    Ok(DecodedImage {
        width,
        height,
        rgba: image.into_rgba8().into_raw(),
    })
}

// ---------------------------------------------------------------------------
// ImageSubscription
// ---------------------------------------------------------------------------

enum Phase {
    Idle,
    Waiting { id: u64, flight: Flight },
    Done,
}

/// Event stream for one `load` call.
///
/// Yields `Loading` then `Loaded`/`Failed`, or `Loaded` alone on a cache hit.
/// Dropping it before the end unsubscribes; the last subscriber to leave
/// aborts the fetch.
pub struct ImageSubscription {
    inner: Arc<Inner>,
    url: Url,
    phase: Phase,
}

impl Stream for ImageSubscription {
    type Item = ImageEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ImageEvent>> {
        let this = self.get_mut();
        match &mut this.phase {
            Phase::Idle => match this.inner.subscribe(&this.url) {
                Subscribed::Hit(image) => {
                    this.phase = Phase::Done;
                    Poll::Ready(Some(ImageEvent::Loaded(image)))
                }
                Subscribed::Joined(id, flight) => {
                    this.phase = Phase::Waiting { id, flight };
                    Poll::Ready(Some(ImageEvent::Loading))
                }
            },
            Phase::Waiting { flight, .. } => match flight.poll_unpin(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(result) => {
                    this.phase = Phase::Done;
                    Poll::Ready(Some(match result {
                        Ok(image) => ImageEvent::Loaded(image),
                        Err(e) => ImageEvent::Failed(e),
                    }))
                }
            },
            Phase::Done => Poll::Ready(None),
        }
    }
}

impl Drop for ImageSubscription {
    fn drop(&mut self) {
        if let Phase::Waiting { id, .. } = self.phase {
            self.inner.unsubscribe(&self.url, id);
        }
    }
}
