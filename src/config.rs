use anyhow::{Result, anyhow};
use std::env;
use std::time::Duration;

/// Environment keys. Builder setters take precedence over the environment;
/// the environment takes precedence over the built-in defaults.
pub(crate) const NUM_THREADS_ENV: &str = "WEFT_NUM_THREADS";
pub(crate) const THREAD_AFFINITY_ENV: &str = "WEFT_THREAD_AFFINITY";
pub(crate) const NUMA_PLACEMENT_ENV: &str = "WEFT_NUMA_PLACEMENT";
pub(crate) const THREAD_IDLE_ENV: &str = "WEFT_THREAD_IDLE";
pub(crate) const THREAD_IDLE_SLEEP_ENV: &str = "WEFT_THREAD_IDLE_SLEEP_US";
pub(crate) const TASK_STACK_SIZE_ENV: &str = "WEFT_TASK_STACK_SIZE";
pub(crate) const COPYIN_IMPL_ENV: &str = "WEFT_COPYIN_IMPL";
pub(crate) const COPYIN_WAIT_ENV: &str = "WEFT_COPYIN_WAIT";
pub(crate) const AMSGQ_SYNC_ENV: &str = "WEFT_AMSGQ_SYNC";
pub(crate) const AMSGQ_DIRECT_ENV: &str = "WEFT_AMSGQ_DIRECT";

/// Use 2 MiB stacks per task, rounded up to page size at allocation.
const DEFAULT_TASK_STACK_SIZE: usize = 1 << 21;

/// Idle workers nap this long within the grace period before descending to
/// the configured idle policy.
pub(crate) const IDLE_GRACE: Duration = Duration::from_millis(1);
pub(crate) const IDLE_GRACE_SLEEP: Duration = Duration::from_micros(100);

/// Default quantum for the USLEEP idle policy.
const DEFAULT_IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Workers trigger remote progress at most this often unless forced.
pub(crate) const REMOTE_PROGRESS_INTERVAL: Duration = Duration::from_millis(10);

/// Active-message buffer geometry: pre-posted receives and bytes per buffer.
pub(crate) const AMSGQ_MSG_COUNT: usize = 100;
pub(crate) const AMSGQ_MSG_SIZE: usize = 512;

/// Number of lock-free hand-off slots per worker thread.
pub(crate) const THREAD_QUEUE_SIZE: usize = 4;

/// Tasks allocated per mempool refill.
pub(crate) const TASK_MEMPOOL_SIZE: usize = 64;

/// Contexts cached per thread; overflow is unmapped.
pub(crate) const PER_THREAD_CTX_STORE: usize = 10;

/// What an idle worker does once the grace period elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdlePolicy {
    /// Spin on the queues.
    Poll,
    /// Sleep a fixed quantum between queue checks.
    Usleep,
    /// Park on a condition variable until work is enqueued.
    Wait,
}

impl IdlePolicy {
    fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "POLL" => Ok(IdlePolicy::Poll),
            "USLEEP" => Ok(IdlePolicy::Usleep),
            "WAIT" => Ok(IdlePolicy::Wait),
            other => Err(anyhow!("unknown idle policy: {other:?}")),
        }
    }
}

/// How copy-in dependencies are realized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyinImpl {
    /// One-sided get from the producing unit.
    Get,
    /// Two-sided: a prefetch request to the producer, answered by a send
    /// task matched to a receive task by tag.
    SendRecv,
}

impl CopyinImpl {
    fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(CopyinImpl::Get),
            "SENDRECV" => Ok(CopyinImpl::SendRecv),
            other => Err(anyhow!("unknown copyin impl: {other:?}")),
        }
    }
}

/// How a copy-in task waits for its transfer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyinWait {
    /// The task blocks; the wait subsystem re-enqueues it on completion.
    Block,
    /// The task completes logically and parks on the side list.
    Detach,
    /// Like `Detach`, but the task is created inline (no fiber).
    DetachInline,
    /// Test/yield cycle at lowered priority.
    Yield,
}

impl CopyinWait {
    fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BLOCK" => Ok(CopyinWait::Block),
            "DETACH" => Ok(CopyinWait::Detach),
            "DETACH_INLINE" => Ok(CopyinWait::DetachInline),
            "YIELD" | "TESTYIELD" => Ok(CopyinWait::Yield),
            other => Err(anyhow!("unknown copyin wait mode: {other:?}")),
        }
    }
}

/// Builds a [`crate::Runtime`]. Settings left untouched fall back to the
/// environment, then to defaults.
#[derive(Debug, Default)]
pub struct Builder {
    num_threads: Option<usize>,
    bind_threads: Option<bool>,
    respect_numa: Option<bool>,
    num_numa_nodes: Option<usize>,
    idle_policy: Option<IdlePolicy>,
    idle_sleep: Option<Duration>,
    task_stack_size: Option<usize>,
    copyin_impl: Option<CopyinImpl>,
    copyin_wait: Option<CopyinWait>,
    amsgq_sync: Option<bool>,
    amsgq_direct: Option<bool>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of worker threads, including the master thread.
    ///
    /// # Panics
    ///
    /// Panics if 0 is passed.
    #[track_caller]
    pub fn num_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "num_threads must be greater than 0");
        self.num_threads = Some(val);
        self
    }

    /// Bind worker threads to cores.
    pub fn bind_threads(mut self, val: bool) -> Self {
        self.bind_threads = Some(val);
        self
    }

    /// Honor NUMA-local queues. Without platform topology discovery the
    /// node count defaults to 1; `num_numa_nodes` overrides it.
    pub fn respect_numa(mut self, val: bool) -> Self {
        self.respect_numa = Some(val);
        self
    }

    pub fn num_numa_nodes(mut self, val: usize) -> Self {
        assert!(val > 0, "num_numa_nodes must be greater than 0");
        self.num_numa_nodes = Some(val);
        self
    }

    pub fn idle_policy(mut self, val: IdlePolicy) -> Self {
        self.idle_policy = Some(val);
        self
    }

    pub fn idle_sleep(mut self, val: Duration) -> Self {
        self.idle_sleep = Some(val);
        self
    }

    /// Per-context stack size in bytes, rounded up to page size.
    pub fn task_stack_size(mut self, val: usize) -> Self {
        self.task_stack_size = Some(val);
        self
    }

    pub fn copyin_impl(mut self, val: CopyinImpl) -> Self {
        self.copyin_impl = Some(val);
        self
    }

    pub fn copyin_wait(mut self, val: CopyinWait) -> Self {
        self.copyin_wait = Some(val);
        self
    }

    /// Synchronous sends: round termination uses a plain barrier instead
    /// of exchanging per-peer send counts.
    pub fn amsgq_sync(mut self, val: bool) -> Self {
        self.amsgq_sync = Some(val);
        self
    }

    /// Direct sends bypass the staged send slots.
    pub fn amsgq_direct(mut self, val: bool) -> Self {
        self.amsgq_direct = Some(val);
        self
    }

    pub(crate) fn freeze(self) -> Result<RuntimeConfig> {
        let num_threads = match self.num_threads {
            Some(n) => n,
            None => match env_number(NUM_THREADS_ENV)? {
                Some(n) if n > 0 => n,
                Some(_) => return Err(anyhow!("{NUM_THREADS_ENV} must be greater than 0")),
                None => std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or_else(|_| {
                        tracing::warn!("failed to detect core count, using 2 threads");
                        2
                    }),
            },
        };

        // Buffered (counting) round termination is the default: the
        // in-process fabric completes sends immediately, so the barrier
        // shortcut of truly synchronous transports does not apply.
        let amsgq_sync = resolve_bool(self.amsgq_sync, AMSGQ_SYNC_ENV, false)?;
        let amsgq_direct = resolve_bool(self.amsgq_direct, AMSGQ_DIRECT_ENV, amsgq_sync)?;

        let cfg = RuntimeConfig {
            num_threads,
            bind_threads: resolve_bool(self.bind_threads, THREAD_AFFINITY_ENV, false)?,
            respect_numa: resolve_bool(self.respect_numa, NUMA_PLACEMENT_ENV, false)?,
            num_numa_nodes: self.num_numa_nodes.unwrap_or(1),
            idle_policy: match self.idle_policy {
                Some(p) => p,
                None => match env::var(THREAD_IDLE_ENV) {
                    Ok(s) => IdlePolicy::parse(&s)?,
                    Err(_) => IdlePolicy::Usleep,
                },
            },
            idle_sleep: match self.idle_sleep {
                Some(d) => d,
                None => env_number(THREAD_IDLE_SLEEP_ENV)?
                    .map(|us| Duration::from_micros(us as u64))
                    .unwrap_or(DEFAULT_IDLE_SLEEP),
            },
            task_stack_size: match self.task_stack_size {
                Some(n) => n,
                None => env_number(TASK_STACK_SIZE_ENV)?.unwrap_or(DEFAULT_TASK_STACK_SIZE),
            },
            copyin_impl: match self.copyin_impl {
                Some(i) => i,
                None => match env::var(COPYIN_IMPL_ENV) {
                    Ok(s) => CopyinImpl::parse(&s)?,
                    Err(_) => CopyinImpl::Get,
                },
            },
            copyin_wait: match self.copyin_wait {
                Some(w) => w,
                None => match env::var(COPYIN_WAIT_ENV) {
                    Ok(s) => CopyinWait::parse(&s)?,
                    Err(_) => CopyinWait::DetachInline,
                },
            },
            amsgq_sync,
            amsgq_direct,
            amsgq_msg_count: AMSGQ_MSG_COUNT,
            amsgq_msg_size: AMSGQ_MSG_SIZE,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}

/// The frozen runtime configuration injected into every subsystem.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) num_threads: usize,
    pub(crate) bind_threads: bool,
    pub(crate) respect_numa: bool,
    pub(crate) num_numa_nodes: usize,
    pub(crate) idle_policy: IdlePolicy,
    pub(crate) idle_sleep: Duration,
    pub(crate) task_stack_size: usize,
    pub(crate) copyin_impl: CopyinImpl,
    pub(crate) copyin_wait: CopyinWait,
    pub(crate) amsgq_sync: bool,
    pub(crate) amsgq_direct: bool,
    pub(crate) amsgq_msg_count: usize,
    pub(crate) amsgq_msg_size: usize,
}

impl RuntimeConfig {
    fn validate(&self) -> Result<()> {
        if self.amsgq_msg_size < 64 {
            return Err(anyhow!("amsgq_msg_size too small for message headers"));
        }

        if self.respect_numa && self.num_numa_nodes == 0 {
            return Err(anyhow!("num_numa_nodes must be greater than 0"));
        }

        Ok(())
    }

    /// NUMA node a thread index is assigned to.
    pub(crate) fn numa_node_of(&self, thread_idx: usize) -> usize {
        if !self.respect_numa || self.num_numa_nodes <= 1 {
            return 0;
        }
        // Block distribution of threads over nodes.
        let per_node = self.num_threads.div_ceil(self.num_numa_nodes);
        (thread_idx / per_node).min(self.num_numa_nodes - 1)
    }
}

fn env_number(key: &str) -> Result<Option<usize>> {
    match env::var(key) {
        Ok(s) => s
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|e| anyhow!("{key}={s:?}: {e}")),
        Err(_) => Ok(None),
    }
}

fn env_bool(key: &str) -> Result<Option<bool>> {
    match env::var(key) {
        Ok(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            other => Err(anyhow!("{key}={other:?} is not a boolean")),
        },
        Err(_) => Ok(None),
    }
}

fn resolve_bool(builder: Option<bool>, key: &str, default: bool) -> Result<bool> {
    match builder {
        Some(v) => Ok(v),
        None => Ok(env_bool(key)?.unwrap_or(default)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(RuntimeConfig: Send, Sync, Clone);

    #[test]
    fn defaults_freeze() {
        let cfg = Builder::new().num_threads(3).freeze().unwrap();
        assert_eq!(cfg.num_threads, 3);
        assert_eq!(cfg.idle_policy, IdlePolicy::Usleep);
        assert_eq!(cfg.copyin_impl, CopyinImpl::Get);
        assert_eq!(cfg.copyin_wait, CopyinWait::DetachInline);
        assert!(!cfg.amsgq_sync);
    }

    #[test]
    fn numa_assignment_is_blocked() {
        let cfg = Builder::new()
            .num_threads(4)
            .respect_numa(true)
            .num_numa_nodes(2)
            .freeze()
            .unwrap();
        assert_eq!(cfg.numa_node_of(0), 0);
        assert_eq!(cfg.numa_node_of(1), 0);
        assert_eq!(cfg.numa_node_of(2), 1);
        assert_eq!(cfg.numa_node_of(3), 1);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(IdlePolicy::parse("SPIN").is_err());
        assert!(CopyinImpl::parse("RDMA").is_err());
        assert!(CopyinWait::parse("PARK").is_err());
    }
}
