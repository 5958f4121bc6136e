// Auto-exposure convergence: pure functions over a frame's pixel
// distribution proposing the next exposure duration (and optionally a
// binning factor). Feeding a capture's result back through these forms the
// closed exposure-control loop.

use crate::image_data::ImageBuffer;

/// Convergence parameters.
///
/// `percentile` selects the brightness proxy: the pixel value below which
/// that fraction (in percent) of all samples fall, after discarding the
/// `exclude_brightest` highest samples (hot pixels, cosmic rays). The
/// proposed exposure drives that value into
/// `target_value +/- uncertainty`.
#[derive(Copy, Clone, Debug)]
pub struct AutoExposureTargets {
    pub percentile: f32,
    pub target_value: f32,
    pub uncertainty: f32,
    /// Upper exposure clamp, seconds.
    pub max_exposure: f32,
    pub exclude_brightest: usize,
}

impl Default for AutoExposureTargets {
    fn default() -> Self {
        // Operating defaults of the original nightly recorder.
        AutoExposureTargets {
            percentile: 90.0,
            target_value: 40000.0,
            uncertainty: 5000.0,
            max_exposure: 120.0,
            exclude_brightest: 100,
        }
    }
}

/// Percentile pixel value after hot-pixel rejection. An all-dark frame
/// reports 1 ADU rather than 0 so exposure scaling stays finite.
fn percentile_value(img: &ImageBuffer, percentile: f32,
                    exclude_brightest: usize) -> f32 {
    let mut samples: Vec<u16> = img.data().to_vec();
    if samples.is_empty() {
        return 1.0;
    }
    samples.sort_unstable();
    let kept = if samples.len() > exclude_brightest {
        samples.len() - exclude_brightest
    } else {
        samples.len()
    };
    let frac = (percentile / 100.0).clamp(0.0, 1.0);
    let idx = ((kept - 1) as f32 * frac) as usize;
    f32::max(samples[idx] as f32, 1.0)
}

/// Proposes the next exposure from the current frame. Within the
/// uncertainty band the exposure is returned unchanged; otherwise it is
/// scaled linearly by target/measured and clamped to
/// (0, targets.max_exposure]. Best-effort by design: never fails, even on
/// pathological frames.
pub fn refine_exposure(img: &ImageBuffer, exposure: f32,
                       targets: &AutoExposureTargets) -> f32 {
    if !img.has_data() {
        return exposure;
    }
    let value = percentile_value(img, targets.percentile,
                                 targets.exclude_brightest);
    if (value - targets.target_value).abs() <= targets.uncertainty {
        return exposure;
    }
    let scaled = exposure * targets.target_value / value;
    scaled.min(targets.max_exposure)
}

/// As refine_exposure(), but when the scaled exposure exceeds
/// targets.max_exposure the deficit is converted into a binning increase:
/// an NxN bin multiplies the signal reaching each output sample by N^2, so
/// exposure is recomputed at each candidate bin until it fits or `max_bin`
/// is reached.
pub fn refine_exposure_and_bin(img: &ImageBuffer, exposure: f32, bin: i32,
                               max_bin: i32, targets: &AutoExposureTargets)
                               -> (f32, i32) {
    if !img.has_data() {
        return (exposure, bin);
    }
    let value = percentile_value(img, targets.percentile,
                                 targets.exclude_brightest);
    if (value - targets.target_value).abs() <= targets.uncertainty {
        return (exposure, bin);
    }
    let bin = bin.max(1);
    let max_bin = max_bin.max(bin);
    let demanded = exposure * targets.target_value / value;
    let mut new_bin = bin;
    let mut new_exposure = demanded;
    while new_exposure > targets.max_exposure && new_bin < max_bin {
        new_bin += 1;
        new_exposure = demanded * (bin * bin) as f32 / (new_bin * new_bin) as f32;
    }
    (new_exposure.min(targets.max_exposure), new_bin)
}
