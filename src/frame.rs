//! Frame Module
//!
//! The unit of work passed between stages: one decoded RGB picture plus the
//! bookkeeping needed to name it on output.

use image::{ImageBuffer, Rgb};

pub type RgbFrame = ImageBuffer<Rgb<u8>, Vec<u8>>;

/// A single decoded frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// 1-based position of the frame within its input.
    pub index: u64,
    pub image: RgbFrame,
    /// Identifies the input the frame was decoded from.
    pub source_id: String,
    /// Output name, assigned by the sampler.
    pub name: String,
}

impl Frame {
    pub fn new(index: u64, image: RgbFrame, source_id: &str) -> Self {
        Frame {
            index,
            image,
            source_id: source_id.to_string(),
            name: source_id.to_string(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Re-tags the frame with `<prefix><index:08>`.
    pub fn with_output_name(mut self, prefix: &str) -> Self {
        self.name = output_name(prefix, self.index);
        self
    }
}

pub fn output_name(prefix: &str, index: u64) -> String {
    format!("{}{:08}", prefix, index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_name_is_zero_padded() {
        assert_eq!(output_name("clip-", 42), "clip-00000042");
        assert_eq!(output_name("", 1), "00000001");
    }

    #[test]
    fn renaming_keeps_pixels_and_index() {
        let img = RgbFrame::from_pixel(2, 2, Rgb([1, 2, 3]));
        let frame = Frame::new(7, img, "in.mp4").with_output_name("in-");
        assert_eq!(frame.name, "in-00000007");
        assert_eq!(frame.source_id, "in.mp4");
        assert_eq!(frame.index, 7);
        assert_eq!(frame.image.get_pixel(1, 1), &Rgb([1, 2, 3]));
    }
}
