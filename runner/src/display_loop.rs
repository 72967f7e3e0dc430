use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::compositor::ChromaKey;
use crate::film::{AssetError, FilmSource};
use crate::inference::cache::AiFrameCache;
use crate::inference::scheduler::InferenceScheduler;
use crate::sink::DisplaySink;

/// What happened on one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Presented,
    /// Film frame unavailable; nothing new was shown.
    FilmUnavailable,
    /// Layers disagreed on size; the previous frame stays on screen.
    CompositeFailed,
    DisplayFailed,
}

/// Fixed-cadence driver and the only owner of timing.
///
/// A tick never waits on the model: it advances the film, polls the
/// scheduler with the index of the frame now on screen, composites the film
/// frame with whatever AI frame is cached, and hands the result to the sink.
pub struct DisplayLoop {
    film: FilmSource,
    scheduler: InferenceScheduler,
    cache: AiFrameCache,
    key: ChromaKey,
    sink: Box<dyn DisplaySink>,
    period: Duration,
    index: u32,
    ticks: u64,
    presented: u64,
}

impl DisplayLoop {
    pub fn new(
        film: FilmSource,
        scheduler: InferenceScheduler,
        cache: AiFrameCache,
        key: ChromaKey,
        sink: Box<dyn DisplaySink>,
        period: Duration,
    ) -> Self {
        Self {
            film,
            scheduler,
            cache,
            key,
            sink,
            period,
            index: 1,
            ticks: 0,
            presented: 0,
        }
    }

    /// Index of the film frame the next tick will show.
    pub fn film_index(&self) -> u32 {
        self.index
    }

    pub async fn tick(&mut self) -> TickOutcome {
        self.ticks += 1;

        let film_frame = match self.film.next(self.index) {
            Ok((frame, next)) => {
                // `next` is one past the frame shown, also after a wrap.
                let shown = next.saturating_sub(1).max(1);
                self.index = next;
                self.scheduler.poll(shown).await;
                frame
            }
            Err(e) => {
                let failed = e.index();
                self.index = match &e {
                    // Frame 1 is gone; nothing to skip to.
                    AssetError::MissingFrameAsset { .. } => 1,
                    _ => failed.saturating_add(1),
                };
                warn!(error = %e, index = failed, next = self.index, "film frame unavailable, skipping it");
                self.scheduler.poll(failed).await;
                return TickOutcome::FilmUnavailable;
            }
        };

        let ai_frame = self.cache.latest();
        let composite = match self.key.composite(&film_frame, &ai_frame) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "composite failed, keeping previous display frame");
                return TickOutcome::CompositeFailed;
            }
        };

        if let Err(e) = self.sink.present(&composite) {
            warn!(error = %e, sink = self.sink.name(), "failed to present frame");
            return TickOutcome::DisplayFailed;
        }
        self.presented += 1;
        TickOutcome::Presented
    }

    /// Tick until `stop` resolves or `max_ticks` is reached, then hand back
    /// the scheduler so the caller can settle it before releasing the camera.
    pub async fn run<F>(mut self, max_ticks: Option<u64>, stop: F) -> InferenceScheduler
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(stop);

        info!(
            period_ms = self.period.as_millis() as u64,
            sink = self.sink.name(),
            max_ticks,
            "display loop started"
        );
        let started = Instant::now();

        loop {
            tokio::select! {
                _ = &mut stop => {
                    info!("stop requested, leaving display loop");
                    break;
                }
                _ = ticker.tick() => {
                    let tick_start = Instant::now();
                    let outcome = self.tick().await;
                    let elapsed = tick_start.elapsed();
                    if elapsed > self.period {
                        warn!(
                            elapsed_ms = elapsed.as_millis() as u64,
                            period_ms = self.period.as_millis() as u64,
                            "tick overran its period"
                        );
                    }
                    debug!(tick = self.ticks, ?outcome, index = self.index, "tick done");
                    if self.ticks % 100 == 0 {
                        let stats = self.scheduler.stats();
                        info!(
                            ticks = self.ticks,
                            presented = self.presented,
                            ai_completed = stats.completed,
                            ai_failed = stats.failed,
                            ai_latency_ms = stats.last_latency.map(|d| d.as_millis() as u64),
                            "display loop progress"
                        );
                    }
                    if let Some(max) = max_ticks {
                        if self.ticks >= max {
                            info!(ticks = self.ticks, "tick limit reached");
                            break;
                        }
                    }
                }
            }
        }

        info!(
            ticks = self.ticks,
            presented = self.presented,
            film_index = self.film_index(),
            elapsed_s = started.elapsed().as_secs_f64(),
            "display loop stopped"
        );
        self.scheduler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::testing::FakeDevice;
    use crate::camera::CameraSource;
    use crate::film::testing::MemoryAssetStore;
    use crate::film::{AssetStore, DirectoryAssetStore};
    use crate::inference::scheduler::testing::ScriptedBackend;
    use crate::inference::{InferenceOutput, RequestParams};
    use crate::sink::testing::RecordingSink;
    use image::{Rgb, RgbImage};
    use std::sync::{Arc, Mutex};
    use storyteller_common::frame::{Frame, Geometry};
    use storyteller_common::prompt::PromptSchedule;

    const RED: [u8; 3] = [255, 0, 0];
    const KEY_GREEN: [u8; 3] = [60, 200, 60];
    const FILM: [[u8; 3]; 3] = [[10, 10, 10], [20, 20, 20], [30, 30, 30]];

    fn build(backend: ScriptedBackend, sink: RecordingSink) -> (DisplayLoop, AiFrameCache) {
        build_with(
            backend,
            sink,
            Box::new(MemoryAssetStore::solid(16, 12, &FILM)),
            PromptSchedule::new([(5000, "goldfish")]).unwrap(),
        )
    }

    fn build_with(
        backend: ScriptedBackend,
        sink: RecordingSink,
        store: Box<dyn AssetStore>,
        prompts: PromptSchedule,
    ) -> (DisplayLoop, AiFrameCache) {
        let geometry = Geometry::new(8, 4.0 / 3.0);
        let (width, height) = geometry.dimensions();
        let mut camera =
            CameraSource::new(Box::new(FakeDevice::solid(16, 12, [90, 90, 90])), geometry);
        camera.open().unwrap();
        let cache = AiFrameCache::new(Frame::solid(width, height, KEY_GREEN));
        let params = RequestParams {
            negative_prompt: String::new(),
            strength: 1.0,
            steps: 1,
            seed: 0,
            breathe: false,
            width,
            height,
        };
        let scheduler = InferenceScheduler::new(
            Arc::new(backend),
            Arc::new(Mutex::new(camera)),
            Arc::new(prompts),
            params,
            cache.clone(),
            Frame::solid(width, height, KEY_GREEN),
        );
        let film = FilmSource::new(store, geometry);
        let display = DisplayLoop::new(
            film,
            scheduler,
            cache.clone(),
            ChromaKey::new([40, 40, 40], [80, 255, 80]),
            Box::new(sink),
            Duration::from_millis(10),
        );
        (display, cache)
    }

    /// Red with a green-screen left column.
    fn red_with_key_column(width: u32, height: u32) -> Frame {
        Frame::from_image(RgbImage::from_fn(width, height, |x, _| {
            if x == 0 {
                Rgb(KEY_GREEN)
            } else {
                Rgb(RED)
            }
        }))
    }

    #[tokio::test]
    async fn sentinel_shows_film_before_first_result() {
        let sink = RecordingSink::default();
        let backend = ScriptedBackend::new(|_| Err(crate::inference::InferenceError::Backend("slow".into())));
        let (mut display, _) = build(backend, sink.clone());
        assert_eq!(display.tick().await, TickOutcome::Presented);
        let frames = sink.frames.lock().unwrap();
        assert!(frames[0].as_image().pixels().all(|p| p.0 == FILM[0]));
    }

    #[tokio::test]
    async fn ai_frame_composited_over_film() {
        let sink = RecordingSink::default();
        let backend = ScriptedBackend::new(|req| {
            Ok(InferenceOutput::Image(red_with_key_column(req.width, req.height)))
        });
        let (mut display, cache) = build(backend, sink.clone());
        let mut updates = cache.subscribe();

        display.tick().await;
        updates.changed().await.unwrap();
        display.tick().await;

        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        let out = &frames[1];
        for (x, _, px) in out.as_image().enumerate_pixels() {
            let expected = if x == 0 { FILM[1] } else { RED };
            assert_eq!(px.0, expected);
        }
    }

    #[tokio::test]
    async fn film_wraps_after_last_frame() {
        let sink = RecordingSink::default();
        let (mut display, _) = build(ScriptedBackend::solid(KEY_GREEN), sink.clone());
        for _ in 0..5 {
            display.tick().await;
        }
        assert_eq!(display.film_index(), 3);
        let shown: Vec<[u8; 3]> = sink
            .frames
            .lock()
            .unwrap()
            .iter()
            .map(|f| f.pixel(1, 1))
            .collect();
        assert_eq!(shown, vec![FILM[0], FILM[1], FILM[2], FILM[0], FILM[1]]);
    }

    #[tokio::test]
    async fn wrap_tick_asks_for_the_prompt_of_frame_one() {
        // Last threshold equals the film length: only frames 1..=3 are
        // ever shown, so every tick must be able to launch.
        let (mut display, _) = build_with(
            ScriptedBackend::solid(KEY_GREEN),
            RecordingSink::default(),
            Box::new(MemoryAssetStore::solid(16, 12, &FILM)),
            PromptSchedule::new([(3, "goldfish")]).unwrap(),
        );
        for tick in 1..=4u64 {
            assert_eq!(display.tick().await, TickOutcome::Presented);
            assert_eq!(display.scheduler.stats().launched, tick, "tick {tick}");
            display.scheduler.wait_finished().await;
        }
        display.scheduler.shutdown().await;
        let stats = display.scheduler.stats();
        assert_eq!((stats.completed, stats.failed), (4, 0));
    }

    #[tokio::test]
    async fn corrupt_film_frame_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryAssetStore::new(dir.path(), "frame");
        RgbImage::from_pixel(16, 12, Rgb(FILM[0])).save(store.path_for(1)).unwrap();
        std::fs::write(store.path_for(2), b"not a png").unwrap();
        RgbImage::from_pixel(16, 12, Rgb(FILM[2])).save(store.path_for(3)).unwrap();

        let sink = RecordingSink::default();
        let (mut display, _) = build_with(
            ScriptedBackend::solid(KEY_GREEN),
            sink.clone(),
            Box::new(store),
            PromptSchedule::new([(5000, "goldfish")]).unwrap(),
        );
        let mut outcomes = Vec::new();
        for _ in 0..6 {
            outcomes.push(display.tick().await);
        }
        display.scheduler.shutdown().await;

        use TickOutcome::{FilmUnavailable, Presented};
        assert_eq!(
            outcomes,
            vec![Presented, FilmUnavailable, Presented, Presented, FilmUnavailable, Presented]
        );
        let shown: Vec<[u8; 3]> = sink.frames.lock().unwrap().iter().map(|f| f.pixel(1, 1)).collect();
        assert_eq!(shown, vec![FILM[0], FILM[2], FILM[0], FILM[2]]);
        assert_eq!(display.film_index(), 4);
    }

    #[tokio::test]
    async fn mismatched_ai_frame_keeps_previous_display() {
        let sink = RecordingSink::default();
        let (mut display, cache) = build(ScriptedBackend::solid(KEY_GREEN), sink.clone());
        // No background publishes from here on.
        display.scheduler.shutdown().await;

        assert_eq!(display.tick().await, TickOutcome::Presented);
        cache.publish(Arc::new(Frame::solid(3, 3, RED)));
        assert_eq!(display.tick().await, TickOutcome::CompositeFailed);
        assert_eq!(sink.frames.lock().unwrap().len(), 1);
        assert_eq!(display.film_index(), 3);
    }

    #[tokio::test]
    async fn run_stops_at_tick_limit() {
        let sink = RecordingSink::default();
        let (display, _) = build(ScriptedBackend::solid(RED), sink.clone());
        let mut scheduler = display.run(Some(4), std::future::pending()).await;
        scheduler.shutdown().await;
        assert_eq!(sink.frames.lock().unwrap().len(), 4);
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn run_stops_on_signal() {
        let sink = RecordingSink::default();
        let (display, _) = build(ScriptedBackend::solid(RED), sink.clone());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            display
                .run(None, async {
                    let _ = rx.await;
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(35)).await;
        tx.send(()).unwrap();
        let mut scheduler = handle.await.unwrap();
        scheduler.shutdown().await;
        assert!(!sink.frames.lock().unwrap().is_empty());
    }
}
