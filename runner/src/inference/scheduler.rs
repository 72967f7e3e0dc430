use std::sync::{Arc, PoisonError};
use std::time::Duration;
use storyteller_common::frame::Frame;
use storyteller_common::prompt::PromptSchedule;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::camera::SharedCamera;

use super::cache::AiFrameCache;
use super::{InferenceBackend, InferenceError, InferenceOutput, RequestParams};

/// How often shutdown reports that it is still waiting on the model.
const SETTLE_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// How a finished background call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Image,
    Rejected,
}

type CallHandle = JoinHandle<Result<CallOutcome, InferenceError>>;

enum SchedulerState {
    /// No call outstanding; the next poll launches one.
    Idle,
    /// Exactly one backend call is executing on the blocking pool.
    Running {
        handle: CallHandle,
        started: Instant,
        index: u32,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub launched: u64,
    pub completed: u64,
    pub rejected: u64,
    pub failed: u64,
    pub last_latency: Option<Duration>,
}

/// Keeps one slow transform in flight behind a never-blocking poll.
///
/// Each poll either leaves a running call alone, settles a finished one and
/// launches the next, or launches from idle. The background call commits its
/// own result to the [`AiFrameCache`]; a failed call leaves the cache
/// untouched so the display keeps showing the last good frame.
///
/// Cancellation only stops future launches. A call that has started runs to
/// completion; [`InferenceScheduler::shutdown`] waits for it so the camera is
/// never released underneath a running snapshot.
pub struct InferenceScheduler {
    state: SchedulerState,
    backend: Arc<dyn InferenceBackend>,
    camera: SharedCamera,
    prompts: Arc<PromptSchedule>,
    params: RequestParams,
    cache: AiFrameCache,
    placeholder: Arc<Frame>,
    stopped: bool,
    stats: SchedulerStats,
}

impl InferenceScheduler {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        camera: SharedCamera,
        prompts: Arc<PromptSchedule>,
        params: RequestParams,
        cache: AiFrameCache,
        placeholder: Frame,
    ) -> Self {
        Self {
            state: SchedulerState::Idle,
            backend,
            camera,
            prompts,
            params,
            cache,
            placeholder: Arc::new(placeholder),
            stopped: false,
            stats: SchedulerStats::default(),
        }
    }

    /// Advance the state machine. Never waits on the backend.
    ///
    /// `index` is the film frame currently on screen; it selects the prompt
    /// for a newly launched call.
    pub async fn poll(&mut self, index: u32) {
        if let SchedulerState::Running { handle, .. } = &self.state {
            if !handle.is_finished() {
                debug!("inference still running, keeping cached frame");
                return;
            }
        }

        if let SchedulerState::Running {
            handle,
            started,
            index: call_index,
        } = std::mem::replace(&mut self.state, SchedulerState::Idle)
        {
            // Finished, so this resolves immediately.
            let result = handle.await;
            self.settle(result, started.elapsed(), call_index);
        }

        if !self.stopped {
            self.launch(index);
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, SchedulerState::Running { .. })
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    /// Wait until the in-flight call, if any, has stopped running.
    #[cfg(test)]
    pub(crate) async fn wait_finished(&self) {
        if let SchedulerState::Running { handle, .. } = &self.state {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }
    }

    /// Stop launching and wait for any in-flight call to settle.
    pub async fn shutdown(&mut self) {
        self.stopped = true;
        let SchedulerState::Running {
            mut handle,
            started,
            index,
        } = std::mem::replace(&mut self.state, SchedulerState::Idle)
        else {
            debug!("no inference call in flight at shutdown");
            return;
        };

        info!(index, "waiting for in-flight inference call to settle");
        let result = loop {
            match tokio::time::timeout(SETTLE_LOG_INTERVAL, &mut handle).await {
                Ok(result) => break result,
                Err(_) => warn!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "inference call still running, cannot interrupt it; waiting"
                ),
            }
        };
        self.settle(result, started.elapsed(), index);
        info!(
            launched = self.stats.launched,
            completed = self.stats.completed,
            rejected = self.stats.rejected,
            failed = self.stats.failed,
            "inference scheduler stopped"
        );
    }

    fn settle(
        &mut self,
        result: Result<Result<CallOutcome, InferenceError>, JoinError>,
        latency: Duration,
        index: u32,
    ) {
        let latency_ms = latency.as_millis() as u64;
        match result {
            Ok(Ok(outcome)) => {
                self.stats.last_latency = Some(latency);
                match outcome {
                    CallOutcome::Image => {
                        self.stats.completed += 1;
                        debug!(index, latency_ms, "inference call completed");
                    }
                    CallOutcome::Rejected => {
                        self.stats.rejected += 1;
                        info!(index, latency_ms, "inference output rejected, showing placeholder");
                    }
                }
            }
            Ok(Err(e)) => {
                self.stats.failed += 1;
                warn!(error = %e, index, latency_ms, "inference call failed, keeping previous AI frame");
            }
            Err(e) => {
                self.stats.failed += 1;
                error!(error = %e, index, latency_ms, "inference task panicked, keeping previous AI frame");
            }
        }
    }

    fn launch(&mut self, index: u32) {
        let prompt = match self.prompts.styled_prompt_for(index) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, index, "no prompt for frame, not launching inference");
                return;
            }
        };

        let backend = Arc::clone(&self.backend);
        let camera = Arc::clone(&self.camera);
        let cache = self.cache.clone();
        let placeholder = Arc::clone(&self.placeholder);
        let params = self.params.clone();

        debug!(index, prompt, backend = self.backend.name(), "launching inference call");
        let handle = tokio::task::spawn_blocking(move || {
            // The camera lock is held only for the snapshot, never across
            // the transform.
            let image = camera
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .capture()?;
            let request = params.request(image, prompt, index);
            match backend.transform(&request)? {
                InferenceOutput::Image(frame) => {
                    cache.publish(Arc::new(frame));
                    Ok(CallOutcome::Image)
                }
                InferenceOutput::Rejected => {
                    cache.publish(placeholder);
                    Ok(CallOutcome::Rejected)
                }
            }
        });

        self.stats.launched += 1;
        self.state = SchedulerState::Running {
            handle,
            started: Instant::now(),
            index,
        };
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{Gate, ScriptedBackend};
    use super::*;
    use crate::camera::testing::FakeDevice;
    use crate::camera::CameraSource;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;
    use storyteller_common::frame::Geometry;

    const SENTINEL: [u8; 3] = [60, 200, 60];

    struct Harness {
        scheduler: InferenceScheduler,
        cache: AiFrameCache,
        backend: Arc<ScriptedBackend>,
    }

    fn harness(backend: ScriptedBackend, device: FakeDevice) -> Harness {
        let geometry = Geometry::new(8, 4.0 / 3.0);
        let (width, height) = geometry.dimensions();
        let mut camera = CameraSource::new(Box::new(device), geometry);
        camera.open().unwrap();
        let camera = Arc::new(Mutex::new(camera));
        let backend = Arc::new(backend);
        let cache = AiFrameCache::new(Frame::solid(width, height, SENTINEL));
        let prompts = PromptSchedule::new([(10, "goldfish"), (5000, "shark")])
            .unwrap()
            .with_suffix("greenscreen");
        let params = RequestParams {
            negative_prompt: "detailed background".into(),
            strength: 0.8,
            steps: 1,
            seed: 1,
            breathe: false,
            width,
            height,
        };
        let scheduler = InferenceScheduler::new(
            backend.clone(),
            camera,
            Arc::new(prompts),
            params,
            cache.clone(),
            Frame::solid(width, height, SENTINEL),
        );
        Harness {
            scheduler,
            cache,
            backend,
        }
    }

    #[tokio::test]
    async fn idle_poll_launches_and_result_reaches_cache() {
        let mut h = harness(ScriptedBackend::solid([255, 0, 0]), FakeDevice::solid(16, 12, [0, 0, 0]));
        assert!(!h.scheduler.is_running());
        h.scheduler.poll(1).await;
        assert!(h.scheduler.is_running());
        h.scheduler.wait_finished().await;

        assert_eq!(h.cache.latest().pixel(0, 0), [255, 0, 0]);
        h.scheduler.poll(2).await;
        let stats = h.scheduler.stats();
        assert_eq!((stats.launched, stats.completed), (2, 1));
        assert!(stats.last_latency.is_some());
        h.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn never_two_calls_in_flight() {
        let gate = Arc::new(Gate::default());
        let backend = ScriptedBackend::solid([255, 0, 0]).gated(Arc::clone(&gate));
        let mut h = harness(backend, FakeDevice::solid(16, 12, [0, 0, 0]));

        for round in 0..5u32 {
            // Hammer the scheduler while the call is parked.
            for i in 0..20 {
                h.scheduler.poll(round * 20 + i + 1).await;
            }
            assert_eq!(h.scheduler.stats().launched, round as u64 + 1);
            gate.open(1);
            h.scheduler.wait_finished().await;
        }
        h.scheduler.shutdown().await;
        assert_eq!(h.backend.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn failures_keep_previous_frame() {
        let backend = ScriptedBackend::new(|_| Err(InferenceError::Backend("CUDA out of memory".into())));
        let mut h = harness(backend, FakeDevice::solid(16, 12, [0, 0, 0]));
        for i in 1..=4 {
            h.scheduler.poll(i).await;
            h.scheduler.wait_finished().await;
        }
        h.scheduler.shutdown().await;
        assert_eq!(h.cache.latest().pixel(0, 0), SENTINEL);
        assert_eq!(h.scheduler.stats().failed, 4);
    }

    #[tokio::test]
    async fn capture_failure_skips_the_call() {
        let mut device = FakeDevice::solid(16, 12, [0, 0, 0]);
        device.fail_reads = true;
        let mut h = harness(ScriptedBackend::solid([255, 0, 0]), device);
        h.scheduler.poll(1).await;
        h.scheduler.wait_finished().await;
        h.scheduler.poll(2).await;
        h.scheduler.shutdown().await;
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.scheduler.stats().failed, 2);
        assert_eq!(h.cache.latest().pixel(0, 0), SENTINEL);
    }

    #[tokio::test]
    async fn rejection_publishes_placeholder() {
        let backend = ScriptedBackend::new(|_| Ok(InferenceOutput::Rejected));
        let mut h = harness(backend, FakeDevice::solid(16, 12, [0, 0, 0]));
        h.cache.publish(Arc::new(Frame::solid(8, 6, [1, 2, 3])));
        h.scheduler.poll(1).await;
        h.scheduler.wait_finished().await;
        h.scheduler.shutdown().await;
        assert_eq!(h.cache.latest().pixel(0, 0), SENTINEL);
        assert_eq!(h.scheduler.stats().rejected, 1);
    }

    #[tokio::test]
    async fn panicking_backend_is_contained() {
        let backend = ScriptedBackend::new(|_| panic!("model crashed"));
        let mut h = harness(backend, FakeDevice::solid(16, 12, [0, 0, 0]));
        h.scheduler.poll(1).await;
        h.scheduler.wait_finished().await;
        h.scheduler.poll(2).await;
        h.scheduler.shutdown().await;
        assert_eq!(h.scheduler.stats().failed, 2);
        assert_eq!(h.cache.latest().pixel(0, 0), SENTINEL);
    }

    #[tokio::test]
    async fn prompt_follows_film_index() {
        let mut h = harness(ScriptedBackend::solid([255, 0, 0]), FakeDevice::solid(16, 12, [0, 0, 0]));
        h.scheduler.poll(3).await;
        h.scheduler.wait_finished().await;
        h.scheduler.poll(11).await;
        h.scheduler.shutdown().await;
        let prompts = h.backend.prompts.lock().unwrap().clone();
        assert_eq!(prompts, vec!["goldfish, greenscreen", "shark, greenscreen"]);
    }

    #[tokio::test]
    async fn shutdown_waits_for_call_and_stops_launching() {
        let gate = Arc::new(Gate::default());
        let backend = ScriptedBackend::solid([255, 0, 0]).gated(Arc::clone(&gate));
        let mut h = harness(backend, FakeDevice::solid(16, 12, [0, 0, 0]));
        h.scheduler.poll(1).await;

        let opener = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                gate.open(1);
            })
        };
        h.scheduler.shutdown().await;
        opener.await.unwrap();

        assert!(!h.scheduler.is_running());
        assert_eq!(h.cache.latest().pixel(0, 0), [255, 0, 0]);
        h.scheduler.poll(2).await;
        assert!(!h.scheduler.is_running());
        assert_eq!(h.scheduler.stats().launched, 1);
    }
}
