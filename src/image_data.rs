// 16-bit raw image container: owns pixel data plus derived artifacts
// (statistics, cached JPEG preview) and exposure metadata. A value object,
// not a service: instances are handed off between threads by move, and
// nothing here is internally synchronized.

use canonical_error::{failed_precondition_error, CanonicalError};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use log::warn;

use crate::auto_exposure::{self, AutoExposureTargets};

pub const PIXEL_SATURATED: u16 = 0xffff;

/// Derived whole-frame statistics. Standard deviation uses the sample (N-1)
/// denominator.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ImageStats {
    pub min: u16,
    pub max: u16,
    pub mean: f64,
    pub stddev: f64,
}

/// Exposure metadata stamped onto a frame at readout by the camera session.
#[derive(Clone, Debug)]
pub struct ImageMetadata {
    /// Exposure duration in seconds.
    pub exposure: f32,
    pub bin_x: i32,
    pub bin_y: i32,
    /// Detector temperature at capture time, degrees C.
    pub temperature: f32,
    /// Capture start, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub camera_name: String,
}

impl Default for ImageMetadata {
    fn default() -> Self {
        ImageMetadata {
            exposure: 0.0,
            bin_x: 1,
            bin_y: 1,
            temperature: 0.0,
            timestamp_ms: 0,
            camera_name: String::new(),
        }
    }
}

/// Dense row-major u16 frame. Pixel data is exclusively owned; Clone is a
/// deep copy, never a shared reference. width == 0 iff height == 0 iff no
/// pixel data.
#[derive(Clone)]
pub struct ImageBuffer {
    width: usize,
    height: usize,
    data: Vec<u16>,

    metadata: ImageMetadata,

    // Preview settings and cache. The cache is dropped by every mutating
    // operation so a stale preview is never returned.
    jpeg_quality: u8,
    pixel_min: u16,
    pixel_max: u16,
    autoscale: bool,
    jpeg_cache: Option<Vec<u8>>,
}

impl Default for ImageBuffer {
    fn default() -> Self {
        ImageBuffer::empty()
    }
}

impl ImageBuffer {
    /// Zero-filled frame. A zero dimension yields the empty/no-data buffer
    /// rather than an error; this mirrors how subframe readouts of zero
    /// area are treated downstream.
    pub fn new(width: usize, height: usize) -> Self {
        let mut img = ImageBuffer::empty();
        if width == 0 || height == 0 {
            return img;
        }
        img.width = width;
        img.height = height;
        img.data = vec![0u16; width * height];
        img
    }

    /// Deep-copies `data` into a new frame. A length mismatch leaves the
    /// buffer empty (and logs), matching the zero-dimension policy.
    pub fn from_data(width: usize, height: usize, data: &[u16]) -> Self {
        let mut img = ImageBuffer::new(width, height);
        if !img.has_data() {
            return img;
        }
        if data.len() != width * height {
            warn!("from_data: {} samples for {}x{} frame; leaving buffer empty",
                  data.len(), width, height);
            return ImageBuffer::empty();
        }
        img.data.copy_from_slice(data);
        img
    }

    pub fn empty() -> Self {
        ImageBuffer {
            width: 0,
            height: 0,
            data: Vec::new(),
            metadata: ImageMetadata::default(),
            jpeg_quality: 100,
            pixel_min: 0,
            pixel_max: PIXEL_SATURATED,
            autoscale: true,
            jpeg_cache: None,
        }
    }

    pub fn has_data(&self) -> bool {
        !self.data.is_empty()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn data(&self) -> &[u16] {
        &self.data
    }

    pub fn metadata(&self) -> &ImageMetadata {
        &self.metadata
    }

    pub fn exposure(&self) -> f32 {
        self.metadata.exposure
    }

    pub fn set_exposure(&mut self, exposure: f32) {
        self.metadata.exposure = exposure;
    }

    /// Stamped by the camera session at readout.
    pub fn set_metadata(&mut self, metadata: ImageMetadata) {
        self.metadata = metadata;
    }

    /// Releases pixel data and derived artifacts.
    pub fn clear(&mut self) {
        self.width = 0;
        self.height = 0;
        self.data.clear();
        self.jpeg_cache = None;
    }

    /// Two passes: min/max/mean, then variance. All-zero stats when no data
    /// is present.
    pub fn stats(&self) -> ImageStats {
        if !self.has_data() {
            return ImageStats { min: 0, max: 0, mean: 0.0, stddev: 0.0 };
        }
        let mut min = u16::MAX;
        let mut max = 0u16;
        let divisor = (self.width * self.height) as f64;
        let mut mean = 0.0f64;
        for row in self.data.chunks_exact(self.width) {
            let mut row_sum = 0u64;
            for &v in row {
                if v < min {
                    min = v;
                }
                if v > max {
                    max = v;
                }
                row_sum += v as u64;
            }
            mean += row_sum as f64 / divisor;
        }
        let mut variance_sum = 0.0f64;
        for &v in &self.data {
            let d = v as f64 - mean;
            variance_sum += d * d;
        }
        let n = self.width * self.height;
        let stddev = if n > 1 {
            (variance_sum / (n - 1) as f64).sqrt()
        } else {
            0.0
        };
        ImageStats { min, max, mean, stddev }
    }

    /// Pixel-wise saturating stack of a same-shaped frame. If this buffer is
    /// empty the other frame is deep-copied in; a dimension mismatch is a
    /// no-op. Exposure durations are summed.
    pub fn add(&mut self, other: &ImageBuffer) {
        if !other.has_data() {
            return;
        }
        if !self.has_data() {
            *self = other.clone();
            return;
        }
        if self.width != other.width || self.height != other.height {
            warn!("add: dimension mismatch {}x{} vs {}x{}; ignored",
                  self.width, self.height, other.width, other.height);
            return;
        }
        for (dst, &src) in self.data.iter_mut().zip(other.data.iter()) {
            *dst = dst.saturating_add(src);
        }
        self.metadata.exposure += other.metadata.exposure;
        self.jpeg_cache = None;
    }

    /// Software re-binning: each output sample is the saturating sum of the
    /// bin_x * bin_y input window. Output dimensions are floor-divided;
    /// trailing rows/columns that do not fill a window are discarded.
    pub fn apply_binning(&mut self, bin_x: usize, bin_y: usize) {
        if !self.has_data() || bin_x == 0 || bin_y == 0 {
            return;
        }
        if bin_x == 1 && bin_y == 1 {
            return;
        }
        let new_width = self.width / bin_x;
        let new_height = self.height / bin_y;
        if new_width == 0 || new_height == 0 {
            return;
        }
        let src_width = new_width * bin_x;
        let src_height = new_height * bin_y;
        let mut binned = vec![0u16; new_width * new_height];
        for row in 0..src_height {
            let src_row = &self.data[row * self.width..row * self.width + src_width];
            let dst_row = &mut binned[(row / bin_y) * new_width..];
            for (col, &v) in src_row.iter().enumerate() {
                let dst = &mut dst_row[col / bin_x];
                *dst = dst.saturating_add(v);
            }
        }
        self.data = binned;
        self.width = new_width;
        self.height = new_height;
        self.jpeg_cache = None;
    }

    /// Reverses each row in place. No-op on an empty buffer.
    pub fn flip_horizontal(&mut self) {
        if !self.has_data() {
            return;
        }
        for row in self.data.chunks_exact_mut(self.width) {
            row.reverse();
        }
        self.jpeg_cache = None;
    }

    /// Quality is clamped to 10..=100. Changes invalidate the cached preview.
    pub fn set_preview_quality(&mut self, quality: i32) {
        let clamped = quality.clamp(10, 100) as u8;
        if clamped != self.jpeg_quality {
            self.jpeg_quality = clamped;
            self.jpeg_cache = None;
        }
    }

    /// Fixed display range for preview scaling; disables autoscale.
    pub fn set_preview_scaling(&mut self, low: u16, high: u16) {
        self.pixel_min = low;
        self.pixel_max = high;
        self.autoscale = false;
        self.jpeg_cache = None;
    }

    /// Data-driven display range (actual frame min/max).
    pub fn set_preview_autoscale(&mut self, autoscale: bool) {
        if autoscale != self.autoscale {
            self.autoscale = autoscale;
            self.jpeg_cache = None;
        }
    }

    /// Compressed RGB preview of the raw frame, cached until the next
    /// mutation. Saturated samples (65535) render pure red; samples above
    /// the display range render orange; everything else maps linearly to
    /// grey.
    pub fn preview_jpeg(&mut self) -> Result<&[u8], CanonicalError> {
        if self.jpeg_cache.is_none() {
            let jpeg = self.render_preview()?;
            self.jpeg_cache = Some(jpeg);
        }
        Ok(self.jpeg_cache.as_deref().unwrap())
    }

    fn render_preview(&self) -> Result<Vec<u8>, CanonicalError> {
        if !self.has_data() {
            return Err(failed_precondition_error("No image data to preview"));
        }
        let (low, high) = if self.autoscale {
            let stats = self.stats();
            (stats.min, stats.max)
        } else {
            (self.pixel_min, self.pixel_max)
        };
        // 16-bit range mapped onto the display window, then truncated to
        // 8 bits. A degenerate window (high <= low) renders flat.
        let scale = 65535.0f32 / (high.saturating_sub(low)).max(1) as f32;
        let mut rgb = Vec::with_capacity(self.width * self.height * 3);
        for &v in &self.data {
            if v == PIXEL_SATURATED {
                rgb.extend_from_slice(&[0xff, 0x00, 0x00]);
            } else if v > high {
                rgb.extend_from_slice(&[0xff, 0xa5, 0x00]);
            } else {
                let grey = ((v.saturating_sub(low)) as f32 * scale / 256.0) as u8;
                rgb.extend_from_slice(&[grey, grey, grey]);
            }
        }
        let mut out = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut out, self.jpeg_quality);
        encoder
            .encode(&rgb, self.width as u32, self.height as u32,
                    ExtendedColorType::Rgb8)
            .map_err(|e| {
                failed_precondition_error(&format!("JPEG encode failed: {}", e))
            })?;
        Ok(out)
    }

    /// Proposes the next exposure duration from this frame's pixel
    /// distribution. Best-effort: returns the current exposure when the
    /// frame is already converged (or empty).
    pub fn find_optimum_exposure(&self, exposure: f32,
                                 targets: &AutoExposureTargets) -> f32 {
        auto_exposure::refine_exposure(self, exposure, targets)
    }

    /// As find_optimum_exposure(), but converts exposure demand beyond
    /// `targets.max_exposure` into a binning increase up to `max_bin`.
    pub fn find_optimum_exposure_and_bin(&self, exposure: f32, bin: i32,
                                         max_bin: i32,
                                         targets: &AutoExposureTargets)
                                         -> (f32, i32) {
        auto_exposure::refine_exposure_and_bin(self, exposure, bin, max_bin, targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(width: usize, height: usize, value: u16) -> ImageBuffer {
        ImageBuffer::from_data(width, height, &vec![value; width * height])
    }

    #[test]
    fn zero_dimension_is_empty() {
        let img = ImageBuffer::new(0, 5);
        assert!(!img.has_data());
        assert_eq!(img.width(), 0);
        assert_eq!(img.height(), 0);
    }

    #[test]
    fn length_mismatch_is_empty() {
        let img = ImageBuffer::from_data(4, 4, &[1, 2, 3]);
        assert!(!img.has_data());
    }

    #[test]
    fn stats_of_empty_are_zero() {
        let img = ImageBuffer::empty();
        assert_eq!(img.stats(),
                   ImageStats { min: 0, max: 0, mean: 0.0, stddev: 0.0 });
    }

    #[test]
    fn stats_of_uniform_frame() {
        let img = filled(4, 4, 100);
        let stats = img.stats();
        assert_eq!(stats.min, 100);
        assert_eq!(stats.max, 100);
        assert!((stats.mean - 100.0).abs() < 1e-9);
        assert!(stats.stddev.abs() < 1e-9);
    }

    #[test]
    fn stats_sample_stddev() {
        // Values 2 and 4: mean 3, sample variance (1+1)/(2-1) = 2.
        let img = ImageBuffer::from_data(2, 1, &[2, 4]);
        let stats = img.stats();
        assert!((stats.mean - 3.0).abs() < 1e-9);
        assert!((stats.stddev - 2.0f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn add_saturates_and_sums_exposure() {
        let mut a = filled(2, 2, 40000);
        a.set_exposure(1.5);
        let mut b = filled(2, 2, 40000);
        b.set_exposure(0.5);
        a.add(&b);
        assert!(a.data().iter().all(|&v| v == PIXEL_SATURATED));
        assert!((a.exposure() - 2.0).abs() < 1e-6);
        b.add(&filled(2, 2, 100));
        assert!(b.data().iter().all(|&v| v == 40100));
    }

    #[test]
    fn add_into_empty_is_deep_copy() {
        let mut dst = ImageBuffer::empty();
        let src = filled(3, 2, 7);
        dst.add(&src);
        assert_eq!(dst.data(), src.data());
        assert_eq!((dst.width(), dst.height()), (3, 2));
    }

    #[test]
    fn add_dimension_mismatch_is_noop() {
        let mut a = filled(2, 2, 10);
        let b = filled(3, 2, 10);
        a.add(&b);
        assert!(a.data().iter().all(|&v| v == 10));
        assert_eq!(a.width(), 2);
    }

    #[test]
    fn binning_sums_windows() {
        let mut img = filled(4, 4, 100);
        img.apply_binning(2, 2);
        assert_eq!((img.width(), img.height()), (2, 2));
        assert!(img.data().iter().all(|&v| v == 400));
    }

    #[test]
    fn binning_preserves_total_flux() {
        let data: Vec<u16> = (0..24).collect();
        let mut img = ImageBuffer::from_data(6, 4, &data);
        let total: u64 = img.data().iter().map(|&v| v as u64).sum();
        img.apply_binning(3, 2);
        assert_eq!((img.width(), img.height()), (2, 2));
        let binned_total: u64 = img.data().iter().map(|&v| v as u64).sum();
        assert_eq!(total, binned_total);
    }

    #[test]
    fn binning_discards_partial_windows() {
        let mut img = filled(5, 5, 1);
        img.apply_binning(2, 2);
        assert_eq!((img.width(), img.height()), (2, 2));
        assert!(img.data().iter().all(|&v| v == 4));
    }

    #[test]
    fn one_by_one_binning_is_noop() {
        let data: Vec<u16> = (0..12).collect();
        let mut img = ImageBuffer::from_data(4, 3, &data);
        img.apply_binning(1, 1);
        assert_eq!(img.data(), &data[..]);
    }

    #[test]
    fn flip_twice_is_identity() {
        let data: Vec<u16> = (0..12).collect();
        let mut img = ImageBuffer::from_data(4, 3, &data);
        img.flip_horizontal();
        assert_eq!(img.data()[0..4], [3, 2, 1, 0]);
        img.flip_horizontal();
        assert_eq!(img.data(), &data[..]);
    }

    #[test]
    fn end_to_end_transform_chain() {
        let mut img = filled(4, 4, 100);
        img.set_exposure(1.0);
        let stats = img.stats();
        assert_eq!((stats.min, stats.max), (100, 100));
        assert!((stats.mean - 100.0).abs() < 1e-9);
        assert!(stats.stddev.abs() < 1e-9);

        img.apply_binning(2, 2);
        assert_eq!((img.width(), img.height()), (2, 2));
        assert!(img.data().iter().all(|&v| v == 400));

        let mut stacked = filled(4, 4, 100);
        stacked.set_exposure(1.0);
        let other = stacked.clone();
        stacked.add(&other);
        assert!(stacked.data().iter().all(|&v| v == 200));
        assert!((stacked.exposure() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn flip_of_empty_is_noop() {
        let mut img = ImageBuffer::empty();
        img.flip_horizontal();
        assert!(!img.has_data());
    }

    #[test]
    fn preview_of_empty_fails() {
        let mut img = ImageBuffer::empty();
        assert!(img.preview_jpeg().is_err());
    }

    #[test]
    fn preview_is_cached_and_invalidated() {
        let mut img = filled(8, 8, 1000);
        let first = img.preview_jpeg().unwrap().to_vec();
        assert!(!first.is_empty());
        // JPEG SOI marker.
        assert_eq!(&first[0..2], &[0xff, 0xd8]);
        // Cached copy is returned unchanged.
        assert_eq!(img.preview_jpeg().unwrap(), &first[..]);
        // Mutation invalidates; a structurally different image must not
        // yield the stale bytes.
        img.apply_binning(2, 2);
        let second = img.preview_jpeg().unwrap();
        assert_ne!(second, &first[..]);
    }

    #[test]
    fn clone_is_deep() {
        let mut a = filled(2, 2, 5);
        let b = a.clone();
        a.flip_horizontal();
        a.add(&filled(2, 2, 5));
        assert!(b.data().iter().all(|&v| v == 5));
    }
}
