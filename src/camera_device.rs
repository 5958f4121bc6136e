// The vendor-SDK surface consumed by CameraSession, reduced to an opaque
// capability trait. Everything device-specific (USB enumeration, SDK
// bindings, wire quirks) lives behind this boundary; the session only
// assumes the operations below.

use std::fmt;

use canonical_error::CanonicalError;

/// Detector temperatures cross this boundary in centidegrees (degrees C
/// times 100) to avoid floating point in register formats.
pub type Centidegrees = i32;

/// Sentinel returned by temperature queries on a session that never
/// initialized.
pub const INVALID_TEMPERATURE: f32 = -9999.0;

/// Unchanging properties reported by a connected device.
#[derive(Copy, Clone, Debug)]
pub struct DeviceProperties {
    pub sensor_width: i32,
    pub sensor_height: i32,
    pub has_shutter: bool,
    pub temp_sensor_count: i32,
}

/// Device-reported acquisition state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Idle,
    Waiting,
    Exposing,
    Reading,
    Downloading,
    Flushing,
    Error,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self) // Just re-use Debug.
    }
}

/// One readout as delivered by the device: subframe origin and dimensions
/// (in binned coordinates), the binning the device actually applied, and
/// the row-major u16 samples.
pub struct FetchedImage {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub bin_x: i32,
    pub bin_y: i32,
    pub data: Vec<u16>,
}

/// Opaque camera capability. Implementations are not required to be
/// internally synchronized; CameraSession serializes all calls behind its
/// own lock.
pub trait CameraDevice {
    /// Human-readable device name, available before connect().
    fn name(&self) -> String;

    /// Enumerate/select/open the physical device.
    fn connect(&mut self) -> Result<(), CanonicalError>;

    fn disconnect(&mut self);

    fn query_properties(&mut self) -> Result<DeviceProperties, CanonicalError>;

    /// Begin an exposure of `ms` milliseconds.
    fn start_exposure_ms(&mut self, ms: u32) -> Result<(), CanonicalError>;

    /// Device-reported time left in the running exposure.
    fn exposure_remaining_ms(&mut self) -> u32;

    /// True once a frame is ready for fetch_image().
    fn poll_image_ready(&mut self) -> bool;

    fn camera_state(&mut self) -> DeviceState;

    /// Readout progress, percent, meaningful while Downloading.
    fn download_percent(&mut self) -> i32;

    fn fetch_image(&mut self) -> Result<FetchedImage, CanonicalError>;

    fn set_binning(&mut self, bin_x: i32, bin_y: i32) -> Result<(), CanonicalError>;

    /// Subframe in unbinned detector coordinates.
    fn set_subframe(&mut self, left: i32, top: i32, width: i32, height: i32)
                    -> Result<(), CanonicalError>;

    fn set_preview_mode(&mut self, enabled: bool) -> Result<(), CanonicalError>;

    fn set_subsample(&mut self, enabled: bool) -> Result<(), CanonicalError>;

    fn set_cooling(&mut self, target: Centidegrees) -> Result<(), CanonicalError>;

    /// Sensor indices run 1..=temp_sensor_count.
    fn read_temperature_sensor(&mut self, index: i32)
                               -> Result<Centidegrees, CanonicalError>;

    fn open_shutter(&mut self) -> Result<(), CanonicalError>;

    fn close_shutter(&mut self) -> Result<(), CanonicalError>;

    /// Best-effort abort of an in-flight exposure.
    fn abort_exposure(&mut self) -> Result<(), CanonicalError>;
}
