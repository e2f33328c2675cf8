//! UVC preview with an SDL2 window

use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};

use uvc_preview::capture::V4l2Device;
use uvc_preview::display::{ChannelSink, Sdl2Display};
use uvc_preview::{utils, Config, PreviewEngine};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "uvc_preview=debug".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("UVC preview launching...");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "uvc-preview.toml".into());
    let mut config = Config::load(&config_path)?;

    // Auto-detect capture device if needed
    if config.capture.device.is_empty() {
        let found = utils::auto_detect_device()
            .await
            .ok_or_else(|| eyre!("No suitable capture device found"))?;
        config.capture.device = found.path;
        config.capture.mode = found.mode;
    }
    uvc_preview::CONFIG.store(Arc::new(config.clone()));
    info!("Using capture device: {}", config.capture.device);

    let device = V4l2Device::open(&config.capture.device, config.capture.buffer_count)?;
    let engine = PreviewEngine::new(Box::new(device), &config.pipeline);

    for supported in engine.supported_sizes() {
        info!("{:?}: {:?}", supported.format, supported.sizes);
    }

    let negotiated = engine.set_preview_size(config.capture.preview_request())?;
    info!("Negotiated {:?}", negotiated);

    let (sink, rx) = ChannelSink::bounded(config.display.channel_capacity);
    engine.bind_sink(Box::new(sink));
    engine.start_preview()?;

    let sdl_context = sdl2::init().map_err(|e| eyre!(e))?;
    let mut app = Sdl2Display::new(&sdl_context, config.display.width, config.display.height)?;
    let result = app.run(&sdl_context, rx);

    engine.stop_preview()?;
    let stats = engine.stats();
    info!(?stats, "UVC preview shutting down");
    if stats.frames_malformed > 0 {
        warn!("{} malformed frames dropped", stats.frames_malformed);
    }
    result
}
