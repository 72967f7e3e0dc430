mod camera;
mod compositor;
mod display_loop;
mod film;
mod inference;
mod lifecycle;
mod sink;

use camera::http::HttpSnapshotDevice;
use camera::still::StillImageDevice;
use camera::{CameraSource, CaptureDevice};
use compositor::ChromaKey;
use display_loop::DisplayLoop;
use film::{DirectoryAssetStore, FilmSource};
use inference::cache::AiFrameCache;
use inference::http::HttpBackend;
use inference::passthrough::PassthroughBackend;
use inference::scheduler::InferenceScheduler;
use inference::{InferenceBackend, RequestParams};
use lifecycle::{CameraLifecycle, StartupError};
use sink::{DisplaySink, FileSink, NullSink};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use storyteller_common::config::Config;
use storyteller_common::frame::Frame;
use storyteller_common::prompt::PromptSchedule;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        camera = config.camera.device,
        backend = config.inference.backend,
        film_dir = config.film.dir.display().to_string(),
        width = config.frame.width,
        aspect_ratio = config.frame.aspect_ratio,
        fps = config.display.fps,
        sink = config.display.sink,
        "starting storyteller"
    );

    let (display, lifecycle) = match start(&config).await {
        Ok(parts) => parts,
        Err(e) => {
            error!(error = %e, "startup failed");
            std::process::exit(1);
        }
    };

    let stop = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C; running until the tick limit");
            std::future::pending::<()>().await;
        }
    };
    let scheduler = display.run(config.display.max_ticks, stop).await;
    lifecycle::shutdown(scheduler, lifecycle).await;
}

/// Validate assets, acquire the camera and wire up the display loop.
///
/// The camera is the only resource opened here; any failure after it is
/// acquired drops the lifecycle, which releases it.
async fn start(config: &Config) -> Result<(DisplayLoop, CameraLifecycle), StartupError> {
    let geometry = config.frame.geometry();
    let (width, height) = geometry.dimensions();

    let store = DirectoryAssetStore::new(&config.film.dir, &config.film.prefix);
    let film_dir = store.dir().display().to_string();
    let film = FilmSource::new(Box::new(store), geometry);
    let frame_count = film.len();
    if frame_count == 0 {
        return Err(StartupError::EmptyFilm(film_dir));
    }
    let prompts = PromptSchedule::from_config(&config.prompts)?;
    prompts.validate(frame_count)?;
    info!(
        film_dir,
        frames = frame_count,
        prompts = prompts.len(),
        last_threshold = prompts.last_threshold(),
        "film and prompt schedule loaded"
    );

    let device = capture_device(config);
    let source = CameraSource::new(device, geometry);
    let lifecycle = tokio::task::spawn_blocking(move || CameraLifecycle::acquire(source)).await??;

    let backend = inference_backend(config).await?;
    info!(backend = backend.name(), width, height, "inference backend ready");

    let placeholder = Frame::solid(width, height, config.chroma_key.placeholder_color);
    let cache = AiFrameCache::new(placeholder.clone());
    let scheduler = InferenceScheduler::new(
        backend,
        lifecycle.camera(),
        Arc::new(prompts),
        RequestParams::from_config(&config.inference, (width, height)),
        cache.clone(),
        placeholder,
    );

    let sink: Box<dyn DisplaySink> = match config.display.sink.as_str() {
        "null" => Box::new(NullSink::default()),
        _ => {
            let file = FileSink::new(
                &config.display.output_path,
                config.display.viewport_width,
                config.display.viewport_height,
            );
            info!(path = file.path().display().to_string(), "display frames go to file");
            Box::new(file)
        }
    };

    let display = DisplayLoop::new(
        film,
        scheduler,
        cache,
        ChromaKey::from_config(&config.chroma_key),
        sink,
        Duration::from_secs_f64(1.0 / config.display.fps),
    );
    Ok((display, lifecycle))
}

fn capture_device(config: &Config) -> Box<dyn CaptureDevice> {
    let camera = &config.camera;
    match (camera.device.as_str(), &camera.path) {
        ("still", Some(path)) => Box::new(StillImageDevice::new(path)),
        _ => Box::new(HttpSnapshotDevice::new(
            camera.url.clone().unwrap_or_default(),
            camera.quality,
            Duration::from_secs(camera.timeout_secs),
        )),
    }
}

async fn inference_backend(config: &Config) -> Result<Arc<dyn InferenceBackend>, StartupError> {
    match (config.inference.backend.as_str(), &config.inference.endpoint) {
        ("http", Some(endpoint)) => {
            let endpoint = endpoint.clone();
            // The blocking client may not be built on an async worker.
            let backend = tokio::task::spawn_blocking(move || HttpBackend::new(endpoint)).await??;
            Ok(Arc::new(backend))
        }
        _ => Ok(Arc::new(PassthroughBackend)),
    }
}
