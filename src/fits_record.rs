// Flat metadata record accompanying a frame into archival storage. The
// scientific file format itself (FITS keywords, compression, naming) is the
// sink's concern; this crate's obligation is producing the record
// faithfully from a captured frame.

use crate::camera_session::Roi;
use crate::image_data::ImageBuffer;

use canonical_error::CanonicalError;

/// One frame's archival metadata, mirroring the header keywords the writer
/// emits: program tag, camera, timestamp, detector temperature, exposure,
/// binning, and the ROI bounds in unbinned coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct FitsRecord {
    pub program: String,
    pub camera_name: String,
    pub timestamp_ms: u64,
    pub ccd_temp: f32,
    pub exposure_ms: u32,
    pub bin_x: u16,
    pub bin_y: u16,
    pub x_min: u16,
    pub x_max: u16,
    pub y_min: u16,
    pub y_max: u16,
}

impl FitsRecord {
    /// Builds the record for `image`, captured over `roi`.
    pub fn for_image(image: &ImageBuffer, roi: &Roi, program: &str) -> FitsRecord {
        let meta = image.metadata();
        FitsRecord {
            program: program.to_string(),
            camera_name: meta.camera_name.clone(),
            timestamp_ms: meta.timestamp_ms,
            ccd_temp: meta.temperature,
            exposure_ms: (meta.exposure as f64 * 1000.0).round() as u32,
            bin_x: meta.bin_x.max(1) as u16,
            bin_y: meta.bin_y.max(1) as u16,
            x_min: roi.x_min.max(0) as u16,
            x_max: roi.x_max.max(0) as u16,
            y_min: roi.y_min.max(0) as u16,
            y_max: roi.y_max.max(0) as u16,
        }
    }
}

/// Opaque archival sink persisting a pixel buffer plus its record as a
/// self-describing scientific image file.
pub trait ArchiveSink {
    fn save(&mut self, data: &[u16], width: usize, height: usize,
            record: &FitsRecord) -> Result<(), CanonicalError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_data::ImageMetadata;

    #[test]
    fn record_reflects_frame_metadata() {
        let mut image = ImageBuffer::from_data(8, 8, &[123u16; 64]);
        image.set_metadata(ImageMetadata {
            exposure: 2.5,
            bin_x: 2,
            bin_y: 2,
            temperature: -29.97,
            timestamp_ms: 1_700_000_000_000,
            camera_name: "SimCam".to_string(),
        });
        let roi = Roi { x_min: 100, x_max: 900, y_min: 335, y_max: 800 };
        let record = FitsRecord::for_image(&image, &roi, "nightly_survey");
        assert_eq!(record.program, "nightly_survey");
        assert_eq!(record.camera_name, "SimCam");
        assert_eq!(record.exposure_ms, 2500);
        assert_eq!((record.bin_x, record.bin_y), (2, 2));
        assert_eq!((record.x_min, record.x_max), (100, 900));
        assert_eq!((record.y_min, record.y_max), (335, 800));
        assert!((record.ccd_temp - (-29.97)).abs() < 1e-4);
    }
}
