use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::capture::signal::CompletionSignal;
use crate::capture::sink::{OutputSink, SharedSink};
use crate::pipeline::backend::{BufferCallback, MediaBackend};
use crate::pipeline::error::{PipelineError, Result};
use crate::pipeline::types::{Output, PortId};

/// Per-output wait bounds, applied in wait order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CaptureTimeouts {
    #[serde(with = "millis")]
    pub large: Duration,
    #[serde(with = "millis")]
    pub small: Duration,
    #[serde(with = "millis")]
    pub thumbnail: Duration,
}

impl Default for CaptureTimeouts {
    fn default() -> Self {
        Self {
            large: Duration::from_secs(2),
            small: Duration::from_secs(1),
            thumbnail: Duration::from_secs(1),
        }
    }
}

impl CaptureTimeouts {
    pub fn bound(&self, output: Output) -> Duration {
        match output {
            Output::LargeJpeg => self.large,
            Output::SmallJpeg => self.small,
            Output::Thumbnail => self.thumbnail,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Where each output of a round is accumulated.
pub struct SinkSet<L, S, T> {
    pub large: SharedSink<L>,
    pub small: SharedSink<S>,
    pub thumbnail: SharedSink<T>,
}

impl<L, S, T> Clone for SinkSet<L, S, T> {
    fn clone(&self) -> Self {
        Self {
            large: Arc::clone(&self.large),
            small: Arc::clone(&self.small),
            thumbnail: Arc::clone(&self.thumbnail),
        }
    }
}

/// What one completed round produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundOutputs<L, S, T> {
    pub large: L,
    pub small: S,
    pub thumbnail: T,
    pub elapsed: Duration,
}

/// Where a capture round currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundState {
    Idle,
    Armed,
    Triggered,
    Waiting,
    Complete,
    TimedOut,
    Disarmed,
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Armed => "armed",
            Self::Triggered => "triggered",
            Self::Waiting => "waiting",
            Self::Complete => "complete",
            Self::TimedOut => "timed out",
            Self::Disarmed => "disarmed",
        };
        f.write_str(s)
    }
}

fn slot(output: Output) -> usize {
    match output {
        Output::LargeJpeg => 0,
        Output::SmallJpeg => 1,
        Output::Thumbnail => 2,
    }
}

/// Drives one synchronous capture round at a time.
///
/// Owns one completion signal per output. A round arms a callback on each
/// output port, raises the source's capture trigger, then waits on the
/// signals in order (large, small, thumbnail) with per-output bounds.
pub struct CaptureCoordinator {
    backend: Arc<dyn MediaBackend>,
    trigger_port: PortId,
    timeouts: CaptureTimeouts,
    signals: [Arc<CompletionSignal>; 3],
    state: Mutex<RoundState>,
}

impl CaptureCoordinator {
    pub fn new(
        backend: Arc<dyn MediaBackend>,
        trigger_port: PortId,
        timeouts: CaptureTimeouts,
    ) -> Self {
        Self {
            backend,
            trigger_port,
            timeouts,
            signals: Default::default(),
            state: Mutex::new(RoundState::Idle),
        }
    }

    pub fn timeouts(&self) -> CaptureTimeouts {
        self.timeouts
    }

    pub fn set_timeouts(&mut self, timeouts: CaptureTimeouts) {
        self.timeouts = timeouts;
    }

    pub fn round_state(&self) -> RoundState {
        *self.state.lock()
    }

    fn transition(&self, next: RoundState) {
        let mut state = self.state.lock();
        trace!("capture round {} -> {next}", *state);
        *state = next;
    }

    /// Run one round into `sinks` and hand back what each sink produced.
    ///
    /// Whatever happens, the trigger is cleared and all three callbacks are
    /// disabled before this returns.
    pub fn capture<L, S, T>(
        &self,
        sinks: &SinkSet<L, S, T>,
    ) -> Result<RoundOutputs<L::Output, S::Output, T::Output>>
    where
        L: OutputSink + 'static,
        S: OutputSink + 'static,
        T: OutputSink + 'static,
    {
        {
            let state = self.state.lock();
            if *state != RoundState::Idle {
                return Err(PipelineError::invalid_state("capture", *state));
            }
        }
        let started = Instant::now();

        for signal in &self.signals {
            signal.reset();
        }
        begin(Output::LargeJpeg, &sinks.large)?;
        begin(Output::SmallJpeg, &sinks.small)?;
        begin(Output::Thumbnail, &sinks.thumbnail)?;

        let mut guard = RoundGuard::new(self);
        if let Err(e) = self.arm_all(&mut guard, sinks) {
            abandon_all(sinks);
            return Err(e);
        }
        self.transition(RoundState::Armed);

        // A failed set may still have started exposure; clear it on release.
        guard.triggered = true;
        if let Err(e) = self.backend.set_capture(self.trigger_port, true) {
            abandon_all(sinks);
            return Err(e);
        }
        self.transition(RoundState::Triggered);

        self.transition(RoundState::Waiting);
        for output in Output::ALL {
            let bound = self.timeouts.bound(output);
            if !self.signals[slot(output)].wait_timeout(bound) {
                self.transition(RoundState::TimedOut);
                warn!(
                    "{output} did not complete within {}ms; abandoning round",
                    bound.as_millis()
                );
                if let Err(e) = guard.release() {
                    error!("cleanup after timeout failed: {e}");
                }
                abandon_all(sinks);
                return Err(PipelineError::CaptureTimeout { output, bound });
            }
            trace!("{output} complete after {:?}", started.elapsed());
        }
        self.transition(RoundState::Complete);
        guard.release()?;

        let outputs = RoundOutputs {
            large: finish(Output::LargeJpeg, &sinks.large)?,
            small: finish(Output::SmallJpeg, &sinks.small)?,
            thumbnail: finish(Output::Thumbnail, &sinks.thumbnail)?,
            elapsed: started.elapsed(),
        };
        debug!("capture round took {:?}", outputs.elapsed);
        Ok(outputs)
    }

    fn arm_all<L, S, T>(&self, guard: &mut RoundGuard<'_>, sinks: &SinkSet<L, S, T>) -> Result<()>
    where
        L: OutputSink + 'static,
        S: OutputSink + 'static,
        T: OutputSink + 'static,
    {
        self.arm(guard, Output::LargeJpeg, &sinks.large)?;
        self.arm(guard, Output::SmallJpeg, &sinks.small)?;
        self.arm(guard, Output::Thumbnail, &sinks.thumbnail)
    }

    fn arm<K: OutputSink + 'static>(
        &self,
        guard: &mut RoundGuard<'_>,
        output: Output,
        sink: &SharedSink<K>,
    ) -> Result<()> {
        let sink = Arc::clone(sink);
        let signal = Arc::clone(&self.signals[slot(output)]);
        let callback: BufferCallback = Box::new(move |port, chunk| {
            let finished = sink.lock().accept(chunk.data, chunk.end_of_frame);
            if finished {
                trace!("end of frame on {port}");
                signal.set();
            }
            finished
        });
        self.backend.enable_output(output.port(), callback)?;
        guard.armed.push(output.port());
        Ok(())
    }
}

fn begin<K: OutputSink>(output: Output, sink: &SharedSink<K>) -> Result<()> {
    sink.lock()
        .begin_round()
        .map_err(|source| PipelineError::Sink { output, source })
}

fn finish<K: OutputSink>(output: Output, sink: &SharedSink<K>) -> Result<K::Output> {
    sink.lock()
        .take_output()
        .map_err(|source| PipelineError::Sink { output, source })
}

fn abandon_all<L: OutputSink, S: OutputSink, T: OutputSink>(sinks: &SinkSet<L, S, T>) {
    sinks.large.lock().abandon();
    sinks.small.lock().abandon();
    sinks.thumbnail.lock().abandon();
}

/// Clears the trigger and disables every armed output when the round ends,
/// on every exit path including unwinding.
struct RoundGuard<'a> {
    coordinator: &'a CaptureCoordinator,
    armed: Vec<PortId>,
    triggered: bool,
}

impl<'a> RoundGuard<'a> {
    fn new(coordinator: &'a CaptureCoordinator) -> Self {
        Self {
            coordinator,
            armed: Vec::with_capacity(3),
            triggered: false,
        }
    }

    /// Run every cleanup step even if an earlier one fails; report the first failure.
    fn release(&mut self) -> Result<()> {
        let backend = &self.coordinator.backend;
        let mut first_err = None;
        if std::mem::take(&mut self.triggered) {
            if let Err(e) = backend.set_capture(self.coordinator.trigger_port, false) {
                first_err.get_or_insert(e);
            }
        }
        for port in self.armed.drain(..) {
            if let Err(e) = backend.disable_output(port) {
                first_err.get_or_insert(e);
            }
        }
        self.coordinator.transition(RoundState::Disarmed);
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            error!("capture cleanup failed: {e}");
        }
        self.coordinator.transition(RoundState::Idle);
    }
}
