#![allow(dead_code)]

use resilience_policy::config::EngineConfig;
use resilience_policy::repository::{KvPolicyRepository, PolicyRepository};
use resilience_policy::sleeper::TrackingSleeper;
use resilience_policy::telemetry::MemorySink;
use resilience_policy::{Classify, ErrorKind, InMemoryKvStore, ManualClock, Policy, ResilienceEngine};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;

/// Work error whose retryability is chosen by the test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestError {
    Transient,
    Permanent,
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for TestError {}

impl Classify for TestError {
    fn classify(&self) -> ErrorKind {
        match self {
            TestError::Transient => ErrorKind::Transient,
            TestError::Permanent => ErrorKind::Permanent,
        }
    }
}

/// Engine wired to in-memory collaborators with manual time.
pub struct Harness {
    pub engine: Arc<ResilienceEngine<MemorySink>>,
    pub store: Arc<InMemoryKvStore>,
    pub clock: ManualClock,
    pub sleeper: TrackingSleeper,
    pub sink: MemorySink,
}

impl Harness {
    /// Cached repository over the store, as `EngineBuilder::store` wires it.
    pub fn new() -> Self {
        Self::build(EngineConfig::default(), false)
    }

    /// Uncached repository, so every call reaches the store and sees outages immediately.
    pub fn uncached(config: EngineConfig) -> Self {
        Self::build(config, true)
    }

    fn build(config: EngineConfig, uncached: bool) -> Self {
        let store = Arc::new(InMemoryKvStore::new());
        let clock = ManualClock::starting_at(1_000_000);
        let sleeper = TrackingSleeper::new();
        let sink = MemorySink::new();

        let builder = ResilienceEngine::builder()
            .config(config)
            .sleeper(Arc::new(sleeper.clone()))
            .breaker_clock(Arc::new(clock.clone()))
            .limiter_clock(Arc::new(clock.clone()))
            .sink(sink.clone());
        let builder = if uncached {
            builder
                .repository(Arc::new(KvPolicyRepository::new(store.clone())))
                .shared_counters(Some(store.clone()))
        } else {
            builder.store(store.clone())
        };
        let engine = builder.build().expect("valid engine config");

        Self { engine: Arc::new(engine), store, clock, sleeper, sink }
    }

    pub async fn save(&self, policy: Policy) -> Policy {
        self.engine.repository().save(policy).await.expect("save policy")
    }
}

#[derive(Clone)]
struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Captured log output for the current thread while the guard lives.
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    _guard: tracing::subscriber::DefaultGuard,
}

impl LogCapture {
    pub fn start() -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .with_target(true)
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        Self { buffer, _guard: guard }
    }

    pub fn contents(&self) -> String {
        String::from_utf8(self.buffer.lock().unwrap().clone()).unwrap()
    }
}
