use storyteller_common::config::ChromaKeyConfig;
use storyteller_common::frame::Frame;

/// Inclusive per-channel color window treated as green screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChromaKey {
    lower: [u8; 3],
    upper: [u8; 3],
}

#[derive(Debug, thiserror::Error)]
pub enum CompositeError {
    #[error("cannot composite {fg_width}x{fg_height} foreground over {bg_width}x{bg_height} background")]
    DimensionMismatch {
        bg_width: u32,
        bg_height: u32,
        fg_width: u32,
        fg_height: u32,
    },
}

impl ChromaKey {
    pub fn new(lower: [u8; 3], upper: [u8; 3]) -> Self {
        Self { lower, upper }
    }

    pub fn from_config(config: &ChromaKeyConfig) -> Self {
        Self::new(config.lower, config.upper)
    }

    pub fn is_key(&self, pixel: [u8; 3]) -> bool {
        (0..3).all(|c| self.lower[c] <= pixel[c] && pixel[c] <= self.upper[c])
    }

    /// Show `background` wherever `foreground` is key-colored, `foreground`
    /// everywhere else.
    pub fn composite(&self, background: &Frame, foreground: &Frame) -> Result<Frame, CompositeError> {
        if background.dimensions() != foreground.dimensions() {
            return Err(CompositeError::DimensionMismatch {
                bg_width: background.width(),
                bg_height: background.height(),
                fg_width: foreground.width(),
                fg_height: foreground.height(),
            });
        }
        let mut out = foreground.as_image().clone();
        for (px, bg) in out.pixels_mut().zip(background.as_image().pixels()) {
            if self.is_key(px.0) {
                *px = *bg;
            }
        }
        Ok(Frame::from_image(out))
    }
}
