use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rowflow_common::{EngineConfig, RunId, StageInstanceId};

use crate::channel::ChannelCanceller;
use crate::stage::StageCounters;

/// Cooperative stop flag shared by every stage instance of one run.
///
/// Raising it cancels every registered channel so threads blocked in `put`/`get` wake up.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    stopped: AtomicBool,
    cancellers: Mutex<Vec<ChannelCanceller>>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a channel to cancel on stop. Cancels it at once if the stop was already raised.
    pub fn register(&self, canceller: ChannelCanceller) {
        let mut cancellers = self.inner.cancellers.lock();
        if self.is_stopped() {
            drop(cancellers);
            canceller.cancel();
            return;
        }
        cancellers.push(canceller);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Raise the stop and cancel every registered channel.
    ///
    /// Returns `true` for the call that actually raised it.
    pub fn raise(&self) -> bool {
        let cancellers = {
            let mut cancellers = self.inner.cancellers.lock();
            if self.inner.stopped.swap(true, Ordering::AcqRel) {
                return false;
            }
            std::mem::take(&mut *cancellers)
        };
        for c in cancellers {
            c.cancel();
        }
        true
    }
}

impl fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopSignal")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Per-instance execution context handed to every stage behavior call.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// Pipeline name, used in log fields.
    pub pipeline: String,
    pub run_id: RunId,
    pub instance: StageInstanceId,
    /// Total copies of this stage.
    pub copies: u32,
    pub engine: Arc<EngineConfig>,
    pub stop: StopSignal,
    pub counters: Arc<StageCounters>,
}

impl StageContext {
    pub fn new(
        pipeline: impl Into<String>,
        run_id: RunId,
        instance: StageInstanceId,
        engine: Arc<EngineConfig>,
    ) -> Self {
        Self {
            pipeline: pipeline.into(),
            run_id,
            instance,
            copies: 1,
            engine,
            stop: StopSignal::new(),
            counters: Arc::new(StageCounters::default()),
        }
    }

    pub fn stage_name(&self) -> &str {
        &self.instance.stage
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }
}
