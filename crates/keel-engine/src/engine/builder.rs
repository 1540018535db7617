use super::*;

const DEFAULT_WAIT: Duration = Duration::from_secs(30);
const DEFAULT_BUS_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum EngineBuildError {
    #[error("storage is required")]
    MissingStorage,

    #[error("executor is required")]
    MissingExecutor,
}

/// Builder for [`Engine`]. Storage and executor are required;
/// everything else has defaults.
pub struct EngineBuilder {
    storage: Option<Arc<dyn RunStorage>>,
    executor: Option<Arc<dyn RunExecutor>>,
    default_wait: Duration,
    bus_capacity: usize,
    hard_timeout: Option<Duration>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            storage: None,
            executor: None,
            default_wait: DEFAULT_WAIT,
            bus_capacity: DEFAULT_BUS_CAPACITY,
            hard_timeout: None,
        }
    }

    pub fn storage(mut self, storage: Arc<dyn RunStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn RunExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Default caller wait window for `submit`.
    pub fn default_wait(mut self, wait: Duration) -> Self {
        self.default_wait = wait;
        self
    }

    /// Per-subscriber live buffer size. Slow subscribers that overflow
    /// it re-sync from the durable log.
    pub fn bus_capacity(mut self, capacity: usize) -> Self {
        self.bus_capacity = capacity;
        self
    }

    /// Safety net for runaway executions: past this limit the run's
    /// cancellation token fires and the run fails. Off by default.
    pub fn hard_timeout(mut self, limit: Duration) -> Self {
        self.hard_timeout = Some(limit);
        self
    }

    pub fn build(self) -> Result<Engine, EngineBuildError> {
        let storage = self.storage.ok_or(EngineBuildError::MissingStorage)?;
        let executor = self.executor.ok_or(EngineBuildError::MissingExecutor)?;

        let bus = Arc::new(EventBus::new(self.bus_capacity));
        let heartbeats = Arc::new(HeartbeatMonitor::new());
        let events = Arc::new(EventStore::new(
            storage.clone(),
            bus.clone(),
            heartbeats.clone(),
        ));
        let lifecycle = Arc::new(RunLifecycle::new(storage.clone()));

        Ok(Engine {
            storage,
            executor,
            bus,
            events,
            lifecycle,
            heartbeats,
            continuations: Arc::new(ContinuationDispatcher::new()),
            tokens: Arc::new(Mutex::new(HashMap::new())),
            waiters: Arc::new(Mutex::new(HashMap::new())),
            config: Arc::new(EngineConfig {
                default_wait: self.default_wait,
                hard_timeout: self.hard_timeout,
            }),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
