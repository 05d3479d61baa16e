//! Runtime configuration for the bundled channel and timer service.

/// Default depth of the channel post queue.
pub const DEFAULT_QUEUE_SIZE: usize = 32;

/// Configuration for [`LocalChannel`](crate::LocalChannel).
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Maximum number of posted events waiting for delivery. Must be non-zero.
    pub queue_size: usize,
    /// Name of the dedicated delivery thread. `None` means no thread is spawned
    /// and the owner drives delivery with `LocalChannel::run`.
    pub task_name: Option<String>,
    /// Stack size for the delivery thread; platform default when `None`.
    pub task_stack_size: Option<usize>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_QUEUE_SIZE,
            task_name: Some("evt_loop".into()),
            task_stack_size: None,
        }
    }
}

impl ChannelConfig {
    /// A channel without a delivery thread.
    pub fn without_task(queue_size: usize) -> Self {
        Self {
            queue_size,
            task_name: None,
            task_stack_size: None,
        }
    }
}

/// Configuration for [`ThreadTimerService`](crate::ThreadTimerService).
#[derive(Clone, Debug)]
pub struct TimerConfig {
    pub task_name: String,
    pub task_stack_size: Option<usize>,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            task_name: "timer_svc".into(),
            task_stack_size: None,
        }
    }
}

/// Configuration for [`EventLoop::from_config`](crate::EventLoop::from_config).
#[derive(Clone, Debug, Default)]
pub struct LoopConfig {
    pub channel: ChannelConfig,
    pub timer: TimerConfig,
}
