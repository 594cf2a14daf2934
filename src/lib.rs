pub mod asset;
pub mod error;
pub mod math;
pub mod renderer;
pub mod scene;
pub mod settings;

pub use error::{RenderError, RenderResult};
pub use renderer::{FrameStats, RecordingBackend, Renderer};
pub use settings::{ColorSpace, DisplaySettings, RenderGraphConfig, RenderGraphMode};

/// Installs `env_logger` at info level unless `RUST_LOG` says otherwise.
/// Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .try_init();
}
