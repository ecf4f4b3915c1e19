use std::time::Duration;

/// Default depth of a group's (or a keyed call's) request queue. A full queue is where callers
/// start to feel backpressure.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Initial batch buffer allocation under [`BufferPolicy::Grow`].
pub const DEFAULT_BATCH_CAPACITY: usize = 1 << 10;

/// What a drain cycle does once the batch buffer is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BufferPolicy {
    /// Keep draining; the buffer grows to hold everything that is queued.
    #[default]
    Grow,
    /// Stop draining at this many requests. Whatever is left stays queued for the next cycle.
    Cap(usize),
}

impl BufferPolicy {
    pub(crate) fn limit(self) -> usize {
        match self {
            BufferPolicy::Grow => usize::MAX,
            BufferPolicy::Cap(n) => n.max(1),
        }
    }

    pub(crate) fn initial_capacity(self) -> usize {
        match self {
            BufferPolicy::Grow => DEFAULT_BATCH_CAPACITY,
            BufferPolicy::Cap(n) => n.max(1),
        }
    }
}

/// Construction-time settings of a [`Group`](crate::Group).
#[derive(Clone, Debug)]
pub struct Config {
    pub queue_capacity: usize,
    /// Upper bound on a single batch function run, enforced through the batch context.
    pub batch_timeout: Option<Duration>,
    pub buffer: BufferPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            batch_timeout: None,
            buffer: BufferPolicy::Grow,
        }
    }
}

impl Config {
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = Some(timeout);
        self
    }

    pub fn buffer(mut self, policy: BufferPolicy) -> Self {
        self.buffer = policy;
        self
    }

    pub(crate) fn channel_capacity(&self) -> usize {
        self.queue_capacity.max(1)
    }
}
