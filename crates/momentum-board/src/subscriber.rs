//! Live change feed with reconnect backoff and a polling fallback.
//!
//! The subscriber owns one background thread. Events are delivered on a
//! bounded channel with a non-blocking send: when the consumer falls behind,
//! incoming events are dropped rather than stalling the connection. The
//! channel closes once, when the thread exits.

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use momentum_core::{CancelToken, FeedSettings};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::{Client, StatusCode, Url};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;

use crate::backoff::Backoff;
use crate::board::{endpoint, parse_base_url};
use crate::error::{BoardError, FeedError};
use crate::sse::{FeedEvent, SseParser};

const HALT_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// What one wait on an open feed connection produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Data(Vec<u8>),
    /// Nothing arrived within the wait.
    Idle,
    /// The server ended the body.
    End,
}

/// An open event stream. Dropping it closes the connection.
pub trait FeedConnection: Send {
    /// Wait at most `timeout` for the next piece of the body.
    fn next_chunk(&mut self, timeout: Duration) -> Result<Chunk, FeedError>;
}

/// How the subscriber reaches the feed endpoint.
pub trait FeedTransport: Send + Sync {
    fn describe(&self) -> String;
    /// Open the long-lived event stream. Only a 200 response counts as open.
    /// Gives up with [`FeedError::Cancelled`] once `halted` returns true.
    fn open(&self, halted: &dyn Fn() -> bool) -> Result<Box<dyn FeedConnection>, FeedError>;
    /// One lightweight request while streaming is unavailable; returns the
    /// response status.
    fn poll(&self) -> Result<u16, FeedError>;
}

/// `{base}/api/events`, ignoring a trailing slash on the base.
pub fn feed_url(base_url: &str) -> Result<Url, FeedError> {
    parse_base_url(base_url)
        .and_then(|base| endpoint(&base, &["api", "events"]))
        .map_err(|err| match err {
            BoardError::InvalidUrl { url, message } => FeedError::InvalidUrl { url, message },
            other => FeedError::InvalidUrl {
                url: base_url.to_string(),
                message: other.to_string(),
            },
        })
}

/// Feed transport over HTTP. Requests run on a private one-worker runtime so
/// a stalled read can be abandoned, which drops the response and closes its
/// connection.
#[derive(Debug, Clone)]
pub struct HttpFeed {
    url: Url,
    runtime: Arc<Runtime>,
    stream_client: Client,
    poll_client: Client,
}

impl HttpFeed {
    pub fn new(base_url: &str, poll_timeout: Duration) -> Result<Self, FeedError> {
        let url = feed_url(base_url)?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("momentum-feed-io")
            .enable_all()
            .build()
            .map_err(|source| FeedError::Runtime { source })?;
        let build_error = |source| FeedError::Connect {
            url: url.to_string(),
            source,
        };
        // The stream stays open indefinitely; only connecting is bounded.
        let stream_client = Client::builder()
            .connect_timeout(poll_timeout)
            .build()
            .map_err(build_error)?;
        let poll_client = Client::builder()
            .timeout(poll_timeout)
            .build()
            .map_err(build_error)?;
        Ok(Self {
            url,
            runtime: Arc::new(runtime),
            stream_client,
            poll_client,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn connect_error(&self, source: reqwest::Error) -> FeedError {
        FeedError::Connect {
            url: self.url.to_string(),
            source,
        }
    }
}

impl FeedTransport for HttpFeed {
    fn describe(&self) -> String {
        self.url.to_string()
    }

    fn open(&self, halted: &dyn Fn() -> bool) -> Result<Box<dyn FeedConnection>, FeedError> {
        let request = self
            .stream_client
            .get(self.url.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send();
        let response = self.runtime.block_on(async {
            tokio::pin!(request);
            loop {
                tokio::select! {
                    result = &mut request => return Some(result),
                    _ = tokio::time::sleep(HALT_CHECK_INTERVAL) => {
                        if halted() {
                            return None;
                        }
                    }
                }
            }
        });
        let response = response
            .ok_or(FeedError::Cancelled)?
            .map_err(|source| self.connect_error(source))?;
        if response.status() != StatusCode::OK {
            return Err(FeedError::Status {
                status: response.status().as_u16(),
            });
        }
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        Ok(Box::new(HttpConnection {
            runtime: Arc::clone(&self.runtime),
            body,
        }))
    }

    fn poll(&self) -> Result<u16, FeedError> {
        let response = self
            .runtime
            .block_on(self.poll_client.get(self.url.clone()).send())
            .map_err(|source| self.connect_error(source))?;
        Ok(response.status().as_u16())
    }
}

struct HttpConnection {
    runtime: Arc<Runtime>,
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
}

impl FeedConnection for HttpConnection {
    fn next_chunk(&mut self, timeout: Duration) -> Result<Chunk, FeedError> {
        let next = self
            .runtime
            .block_on(tokio::time::timeout(timeout, self.body.next()));
        match next {
            Err(_elapsed) => Ok(Chunk::Idle),
            Ok(Some(Ok(bytes))) => Ok(Chunk::Data(bytes)),
            Ok(Some(Err(source))) => Err(FeedError::Read { source }),
            Ok(None) => Ok(Chunk::End),
        }
    }
}

#[derive(Default)]
struct SubscriberState {
    running: bool,
    generation: u64,
    stop: Option<CancelToken>,
}

pub struct FeedSubscriber {
    transport: Arc<dyn FeedTransport>,
    settings: FeedSettings,
    state: Arc<Mutex<SubscriberState>>,
}

impl FeedSubscriber {
    pub fn new(transport: Arc<dyn FeedTransport>, settings: FeedSettings) -> Self {
        Self {
            transport,
            settings,
            state: Arc::new(Mutex::new(SubscriberState::default())),
        }
    }

    pub fn http(base_url: &str, settings: FeedSettings) -> Result<Self, FeedError> {
        let transport = HttpFeed::new(base_url, Duration::from_millis(settings.poll_timeout_ms))?;
        Ok(Self::new(Arc::new(transport), settings))
    }

    fn lock(&self) -> MutexGuard<'_, SubscriberState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start the feed thread. It runs until `cancel` fires or [`stop`] is
    /// called; the returned receiver disconnects after that.
    ///
    /// [`stop`]: FeedSubscriber::stop
    pub fn start(&self, cancel: &CancelToken) -> Result<Receiver<FeedEvent>, FeedError> {
        let mut state = self.lock();
        if state.running {
            return Err(FeedError::AlreadyRunning);
        }
        let stop = CancelToken::new();
        state.running = true;
        state.generation += 1;
        state.stop = Some(stop.clone());
        let generation = state.generation;
        drop(state);

        let (events, receiver) = mpsc::sync_channel(self.settings.queue_capacity.max(1));
        let feed = FeedLoop {
            transport: Arc::clone(&self.transport),
            settings: self.settings.clone(),
            cancel: cancel.clone(),
            stop,
            events,
        };
        let shared = Arc::clone(&self.state);
        thread::spawn(move || {
            feed.run();
            let mut state = shared.lock().unwrap_or_else(|p| p.into_inner());
            if state.generation == generation {
                state.running = false;
                state.stop = None;
            }
        });

        Ok(receiver)
    }

    pub fn stop(&self) {
        let mut state = self.lock();
        if !state.running {
            return;
        }
        state.running = false;
        if let Some(stop) = state.stop.take() {
            stop.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }
}

impl Drop for FeedSubscriber {
    fn drop(&mut self) {
        self.stop();
    }
}

struct FeedLoop {
    transport: Arc<dyn FeedTransport>,
    settings: FeedSettings,
    cancel: CancelToken,
    stop: CancelToken,
    events: SyncSender<FeedEvent>,
}

impl FeedLoop {
    fn run(self) {
        let mut backoff = Backoff::from_settings(&self.settings);
        let polling_interval = Duration::from_millis(self.settings.polling_interval_ms);

        while !self.halted() {
            if backoff.should_poll() {
                self.poll_once(&mut backoff);
                self.pause(polling_interval);
                continue;
            }

            if let Err(err) = self.stream(&mut backoff) {
                if self.halted() {
                    break;
                }
                let delay = backoff.record_failure();
                tracing::warn!(
                    attempt = backoff.failures(),
                    error = %err,
                    "feed connection error"
                );
                if backoff.should_poll() {
                    tracing::warn!(
                        interval_ms = self.settings.polling_interval_ms,
                        "feed falling back to polling"
                    );
                }
                self.pause(delay);
            }
        }

        if self.cancel.is_cancelled() {
            tracing::info!("feed subscriber cancelled; shutting down");
        } else {
            tracing::info!("feed subscriber stop requested; shutting down");
        }
    }

    fn halted(&self) -> bool {
        self.cancel.is_cancelled() || self.stop.is_cancelled()
    }

    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.halted() {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            self.stop
                .wait_timeout((deadline - now).min(HALT_CHECK_INTERVAL));
        }
    }

    /// Read one connection until it fails or the loop is halted. The
    /// connection is dropped, and so closed, on every return path.
    fn stream(&self, backoff: &mut Backoff) -> Result<(), FeedError> {
        let halted = || self.halted();
        let mut connection = self.transport.open(&halted)?;
        backoff.reset();
        tracing::info!(url = %self.transport.describe(), "feed connected");

        let mut parser = SseParser::new();
        while !self.halted() {
            match connection.next_chunk(HALT_CHECK_INTERVAL)? {
                Chunk::Data(bytes) => {
                    for event in parser.feed_bytes(&bytes) {
                        self.deliver(event);
                    }
                }
                Chunk::Idle => {}
                Chunk::End => return Err(FeedError::Closed),
            }
        }
        Ok(())
    }

    fn poll_once(&self, backoff: &mut Backoff) {
        match self.transport.poll() {
            Ok(status) => {
                if status == StatusCode::OK.as_u16() {
                    tracing::info!("feed server responding; resuming stream");
                    backoff.reset();
                }
                self.deliver(FeedEvent::polling_refresh());
            }
            Err(err) => tracing::warn!(error = %err, "feed poll failed"),
        }
    }

    fn deliver(&self, event: FeedEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!(kind = %event.kind, "feed event queue full; dropping event");
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::debug!("feed event receiver dropped");
            }
        }
    }
}
