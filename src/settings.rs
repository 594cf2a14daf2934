use log::{info, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ColorSpace {
    #[default]
    Gamma,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RenderGraphMode {
    /// Render straight into the primary surface.
    DirectToFrontBuffer,
    /// Render into an offscreen buffer of a fixed size, then blit.
    FixedRenderBuffer,
    /// Render into an offscreen buffer that follows the framebuffer size,
    /// clamped to `render_buffer_max_size`, then blit.
    #[default]
    AutoScaledRenderBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderGraphConfig {
    #[serde(default)]
    pub mode: RenderGraphMode,
    #[serde(default = "RenderGraphConfig::default_width")]
    pub render_buffer_width: u32,
    #[serde(default = "RenderGraphConfig::default_height")]
    pub render_buffer_height: u32,
    #[serde(default = "RenderGraphConfig::default_max_size")]
    pub render_buffer_max_size: u32,
}

impl Default for RenderGraphConfig {
    fn default() -> Self {
        Self {
            mode: RenderGraphMode::default(),
            render_buffer_width: Self::default_width(),
            render_buffer_height: Self::default_height(),
            render_buffer_max_size: Self::default_max_size(),
        }
    }
}

impl RenderGraphConfig {
    const fn default_width() -> u32 {
        1920
    }

    const fn default_height() -> u32 {
        1080
    }

    const fn default_max_size() -> u32 {
        1024
    }
}

/// Display and render graph configuration consumed by the renderer every frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplaySettings {
    #[serde(default = "DisplaySettings::default_width")]
    pub width: u32,
    #[serde(default = "DisplaySettings::default_height")]
    pub height: u32,
    /// Size in pixels; differs from `width`/`height` on high dpi displays.
    #[serde(default = "DisplaySettings::default_width")]
    pub framebuffer_width: u32,
    #[serde(default = "DisplaySettings::default_height")]
    pub framebuffer_height: u32,
    #[serde(default)]
    pub auto_size_to_frame: bool,
    #[serde(default)]
    pub disable_vsync: bool,
    #[serde(default)]
    pub color_space: ColorSpace,
    #[serde(default = "DisplaySettings::default_border_color")]
    pub background_border_color: [f32; 4],
    #[serde(default)]
    pub gpu_skinning: bool,
    #[serde(default)]
    pub render_graph: RenderGraphConfig,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            width: Self::default_width(),
            height: Self::default_height(),
            framebuffer_width: Self::default_width(),
            framebuffer_height: Self::default_height(),
            auto_size_to_frame: false,
            disable_vsync: false,
            color_space: ColorSpace::default(),
            background_border_color: Self::default_border_color(),
            gpu_skinning: false,
            render_graph: RenderGraphConfig::default(),
        }
    }
}

impl DisplaySettings {
    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Self {
        use std::fs;

        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|err| {
                warn!(
                    "Failed to parse {:?} ({}). Falling back to default display settings.",
                    path, err
                );
                DisplaySettings::default()
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "Display settings file {:?} not found. Using default settings.",
                    path
                );
                DisplaySettings::default()
            }
            Err(err) => {
                warn!(
                    "Failed to read {:?} ({}). Falling back to default display settings.",
                    path, err
                );
                DisplaySettings::default()
            }
        }
    }

    pub fn from_json(contents: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<DisplaySettings>(contents).map(DisplaySettings::validate)
    }

    pub fn validate(mut self) -> Self {
        if self.width == 0 || self.height == 0 {
            warn!("Display size must be greater than zero. Using default size.");
            self.width = Self::default_width();
            self.height = Self::default_height();
        }

        if self.framebuffer_width == 0 || self.framebuffer_height == 0 {
            warn!("Framebuffer size must be greater than zero. Using display size.");
            self.framebuffer_width = self.width;
            self.framebuffer_height = self.height;
        }

        let graph = &mut self.render_graph;
        if graph.render_buffer_width == 0 || graph.render_buffer_height == 0 {
            warn!("Render buffer size must be greater than zero. Using default size.");
            graph.render_buffer_width = RenderGraphConfig::default_width();
            graph.render_buffer_height = RenderGraphConfig::default_height();
        }

        if graph.render_buffer_max_size == 0 {
            warn!("Render buffer max size must be greater than zero. Using default value.");
            graph.render_buffer_max_size = RenderGraphConfig::default_max_size();
        }

        self
    }

    pub fn background_border_color(&self) -> glam::Vec4 {
        glam::Vec4::from_array(self.background_border_color)
    }

    const fn default_width() -> u32 {
        1280
    }

    const fn default_height() -> u32 {
        720
    }

    const fn default_border_color() -> [f32; 4] {
        [0.0, 0.0, 0.0, 1.0]
    }
}
