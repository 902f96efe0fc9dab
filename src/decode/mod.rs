// Frame decoder boundary
//
// The hand-presence classifier and the QR decoder are external black boxes:
// given a cropped frame region they answer "trigger present?" and "tracking
// code or empty". The pipeline only depends on these two traits; the bundled
// implementation drives a helper process over pipes (helper.rs), and tests
// substitute scripted fakes.

pub mod helper;

use crate::error::Result;

/// One decoded video frame, 8-bit grayscale.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// A crop rectangle in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Roi {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }
}

impl Frame {
    /// Crop to the given region, clamped to the frame bounds. A region that
    /// lies fully outside the frame yields an empty 0x0 frame.
    pub fn crop(&self, roi: Roi) -> Frame {
        let x0 = roi.x.min(self.width);
        let y0 = roi.y.min(self.height);
        let x1 = roi.x.saturating_add(roi.w).min(self.width);
        let y1 = roi.y.saturating_add(roi.h).min(self.height);
        let w = x1 - x0;
        let h = y1 - y0;

        let mut data = Vec::with_capacity((w * h) as usize);
        for row in y0..y1 {
            let start = (row * self.width + x0) as usize;
            data.extend_from_slice(&self.data[start..start + w as usize]);
        }

        Frame { width: w, height: h, data }
    }
}

/// Hand-presence / QR-marker classifier: is a packing action in progress?
pub trait TriggerDetector: Send + Sync {
    fn detect_trigger(&self, frame: &Frame, roi: Roi) -> Result<bool>;
}

/// Tracking-code decoder. Returns the decoded string, or "" when the region
/// holds no readable code.
pub trait CodeDecoder: Send + Sync {
    fn decode_code(&self, frame: &Frame, roi: Roi) -> Result<String>;
}

/// The decoder pair for one camera. Both halves usually share one helper
/// process behind the Arcs.
pub struct CameraDecoders {
    pub trigger: std::sync::Arc<dyn TriggerDetector>,
    pub code: std::sync::Arc<dyn CodeDecoder>,
}

/// Builds decoders for a camera. The production implementation spawns the
/// camera's configured helper command; tests supply scripted fakes.
pub trait DecoderProvider: Send + Sync {
    fn decoders(&self, camera: &crate::db::schema::Camera) -> Result<CameraDecoders>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_frame(width: u32, height: u32) -> Frame {
        let data = (0..width * height).map(|i| (i % 251) as u8).collect();
        Frame { width, height, data }
    }

    #[test]
    fn test_crop_inside_bounds() {
        let frame = gradient_frame(10, 10);
        let cropped = frame.crop(Roi::new(2, 3, 4, 5));
        assert_eq!(cropped.width, 4);
        assert_eq!(cropped.height, 5);
        assert_eq!(cropped.data.len(), 20);
        // First cropped pixel is row 3, col 2 of the source
        assert_eq!(cropped.data[0], frame.data[(3 * 10 + 2) as usize]);
    }

    #[test]
    fn test_crop_clamps_to_frame() {
        let frame = gradient_frame(10, 10);
        let cropped = frame.crop(Roi::new(8, 8, 10, 10));
        assert_eq!(cropped.width, 2);
        assert_eq!(cropped.height, 2);
    }

    #[test]
    fn test_crop_outside_is_empty() {
        let frame = gradient_frame(10, 10);
        let cropped = frame.crop(Roi::new(20, 20, 5, 5));
        assert_eq!(cropped.width, 0);
        assert_eq!(cropped.height, 0);
        assert!(cropped.data.is_empty());
    }
}
