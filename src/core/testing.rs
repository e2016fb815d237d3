//! In-memory collaborators shared by the unit tests.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use url::Url;

use crate::core::remote::{FetchError, ImageSource, InboxSource};

pub(crate) struct FakeInbox {
    response: Mutex<Result<Vec<u8>, FetchError>>,
    gate: Option<Notify>,
    fetches: AtomicUsize,
    reads: Mutex<Vec<String>>,
    singles: Mutex<HashMap<String, Result<Vec<u8>, FetchError>>>,
    single_fetches: AtomicUsize,
}

impl FakeInbox {
    pub(crate) fn new(response: Result<Vec<u8>, FetchError>) -> Arc<Self> {
        Arc::new(FakeInbox {
            response: Mutex::new(response),
            gate: None,
            fetches: AtomicUsize::new(0),
            reads: Mutex::new(Vec::new()),
            singles: Mutex::new(HashMap::new()),
            single_fetches: AtomicUsize::new(0),
        })
    }

    /// Every fetch waits for a matching `release()`.
    pub(crate) fn gated(response: Result<Vec<u8>, FetchError>) -> Arc<Self> {
        Arc::new(FakeInbox {
            response: Mutex::new(response),
            gate: Some(Notify::new()),
            fetches: AtomicUsize::new(0),
            reads: Mutex::new(Vec::new()),
            singles: Mutex::new(HashMap::new()),
            single_fetches: AtomicUsize::new(0),
        })
    }

    pub(crate) fn respond(&self, response: Result<Vec<u8>, FetchError>) {
        *self.response.lock().unwrap() = response;
    }

    /// Answer for `fetch_message(id)`; unknown ids get a 404.
    pub(crate) fn respond_single(&self, id: &str, response: Result<Vec<u8>, FetchError>) {
        self.singles.lock().unwrap().insert(id.to_string(), response);
    }

    pub(crate) fn single_fetches(&self) -> usize {
        self.single_fetches.load(Ordering::SeqCst)
    }

    pub(crate) fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }

    pub(crate) fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub(crate) fn reads(&self) -> Vec<String> {
        self.reads.lock().unwrap().clone()
    }
}

#[async_trait]
impl InboxSource for FakeInbox {
    async fn fetch_messages(&self) -> Result<Vec<u8>, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.response.lock().unwrap().clone()
    }

    async fn fetch_message(&self, id: &str) -> Result<Vec<u8>, FetchError> {
        self.single_fetches.fetch_add(1, Ordering::SeqCst);
        self.singles
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or(Err(FetchError::Status(404)))
    }

    async fn mark_read(&self, id: &str) -> Result<(), FetchError> {
        self.reads.lock().unwrap().push(id.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeImages {
    bodies: Mutex<HashMap<Url, Vec<u8>>>,
    gates: Mutex<HashMap<Url, Arc<Notify>>>,
    fetches: AtomicUsize,
}

impl FakeImages {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn serve(&self, url: &Url, body: Vec<u8>) {
        self.bodies.lock().unwrap().insert(url.clone(), body);
    }

    /// Hold fetches of `url` until the returned gate is notified.
    pub(crate) fn gate(&self, url: &Url) -> Arc<Notify> {
        self.gates
            .lock()
            .unwrap()
            .entry(url.clone())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    pub(crate) fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageSource for FakeImages {
    async fn fetch_image(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let gate = self.gates.lock().unwrap().get(url).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.bodies
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or(FetchError::Status(404))
    }
}

/// A blank PNG of the given size.
pub(crate) fn png(width: u32, height: u32) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(image::RgbaImage::new(width, height))
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

pub(crate) fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

/// Wait (bounded) until `cond` holds, letting spawned tasks run.
pub(crate) async fn eventually(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
