// Thread-safe capture state machine around a single physical camera.
//
// One mutex serializes every device-touching operation and the cached
// configuration; the status string carries its own lock so observers never
// contend with an in-flight capture. capture() releases the session lock for
// the known exposure duration so configuration setters on other threads are
// not starved, then re-acquires it for the readout polling phase.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use canonical_error::CanonicalError;
use chrono::Utc;
use log::{error, info, warn};

use crate::camera_device::{CameraDevice, DeviceProperties, DeviceState,
                           INVALID_TEMPERATURE};
use crate::image_data::{ImageBuffer, ImageMetadata};

/// Exposures are quantized to integer milliseconds and capped at 10 minutes.
const MAX_EXPOSURE_MS: i64 = 10 * 60 * 1000;
/// Readout polling interval while holding the session lock.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

const MIN_BINNING: i32 = 1;
const MAX_BINNING: i32 = 16;

/// Region of interest in unbinned detector coordinates.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Roi {
    pub x_min: i32,
    pub x_max: i32,
    pub y_min: i32,
    pub y_max: i32,
}

struct SessionInner {
    device: Box<dyn CameraDevice + Send>,
    /// Seconds; applied at the next capture.
    exposure: f32,
    bin_x: i32,
    bin_y: i32,
    roi: Roi,
    shutter_open: bool,
}

pub struct CameraSession {
    inner: Mutex<SessionInner>,
    // Set once during construction; a failed initialization is permanent
    // until the session is recreated.
    ready: bool,
    cancel: AtomicBool,
    status: Mutex<String>,

    name: String,
    ccd_width: i32,
    ccd_height: i32,
    has_shutter: bool,
    temp_sensor_count: i32,
}

impl CameraSession {
    /// Connects to `device` and applies the baseline configuration (preview
    /// mode off, 1x1 binning, subsample off). Always returns a session: if
    /// any initialization step fails the device is disconnected, the
    /// session reports `is_ready() == false`, and every public operation
    /// becomes a no-op returning empty or sentinel results.
    pub fn new(mut device: Box<dyn CameraDevice + Send>) -> CameraSession {
        let name = device.name();
        let props = match Self::initialize(device.as_mut()) {
            Ok(props) => Some(props),
            Err(e) => {
                error!("Camera '{}' initialization failed: {}", name, e);
                device.disconnect();
                None
            }
        };
        let ready = props.is_some();
        let (ccd_width, ccd_height, has_shutter, temp_sensor_count) = match props {
            Some(p) => (p.sensor_width, p.sensor_height, p.has_shutter,
                        p.temp_sensor_count),
            None => (0, 0, false, 0),
        };
        if ready {
            info!("Camera '{}' ready, sensor {}x{}", name, ccd_width, ccd_height);
        }
        CameraSession {
            inner: Mutex::new(SessionInner {
                device,
                exposure: 0.0,
                bin_x: 1,
                bin_y: 1,
                roi: Roi { x_min: 0, x_max: ccd_width, y_min: 0, y_max: ccd_height },
                shutter_open: false,
            }),
            ready,
            cancel: AtomicBool::new(false),
            status: Mutex::new(String::new()),
            name,
            ccd_width,
            ccd_height,
            has_shutter,
            temp_sensor_count,
        }
    }

    fn initialize(device: &mut dyn CameraDevice)
                  -> Result<DeviceProperties, CanonicalError> {
        device.connect()?;
        let props = device.query_properties()?;
        device.set_preview_mode(false)?;
        device.set_binning(1, 1)?;
        device.set_subsample(false)?;
        Ok(props)
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn camera_name(&self) -> &str {
        &self.name
    }

    pub fn ccd_width(&self) -> i32 {
        self.ccd_width
    }

    pub fn ccd_height(&self) -> i32 {
        self.ccd_height
    }

    /// Advisory status string (device state name, download progress). Never
    /// used as a control signal internally.
    pub fn status(&self) -> String {
        self.status.lock().unwrap().clone()
    }

    fn set_status(&self, status: String) {
        *self.status.lock().unwrap() = status;
    }

    pub fn exposure(&self) -> f32 {
        if !self.ready {
            return 0.0;
        }
        self.inner.lock().unwrap().exposure
    }

    pub fn binning(&self) -> (i32, i32) {
        if !self.ready {
            return (1, 1);
        }
        let inner = self.inner.lock().unwrap();
        (inner.bin_x, inner.bin_y)
    }

    pub fn roi(&self) -> Roi {
        if !self.ready {
            return Roi { x_min: 0, x_max: 0, y_min: 0, y_max: 0 };
        }
        self.inner.lock().unwrap().roi
    }

    /// Blocks through the full exposure and readout, producing one frame.
    /// Capture-time device failures are per-call: the call returns an empty
    /// ImageBuffer and the session stays ready for the next attempt.
    pub fn capture(&self) -> ImageBuffer {
        if !self.ready {
            return ImageBuffer::empty();
        }
        let mut inner = self.inner.lock().unwrap();
        self.cancel.store(false, Ordering::SeqCst);

        let exposure_now = inner.exposure;
        let exposure_ms = ((exposure_now as f64 * 1000.0).round() as i64)
            .clamp(1, MAX_EXPOSURE_MS) as u32;
        let start_timestamp = Utc::now().timestamp_millis() as u64;

        if let Err(e) = inner.device.start_exposure_ms(exposure_ms) {
            error!("start_exposure_ms({}) failed: {}", exposure_ms, e);
            return ImageBuffer::empty();
        }
        let sleep_ms = inner.device.exposure_remaining_ms();

        // Release the lock for the known exposure time; configuration
        // setters queued on other threads get a chance to run. They apply
        // to the next capture, not this one.
        drop(inner);
        thread::sleep(Duration::from_millis(sleep_ms as u64));
        let mut inner = self.inner.lock().unwrap();

        if self.cancel.load(Ordering::SeqCst) {
            self.set_status("Capture cancelled".to_string());
            return ImageBuffer::empty();
        }
        while !inner.device.poll_image_ready() {
            if self.cancel.load(Ordering::SeqCst) {
                self.set_status("Capture cancelled".to_string());
                return ImageBuffer::empty();
            }
            let state = inner.device.camera_state();
            let mut status = state.to_string();
            if state == DeviceState::Downloading {
                status.push_str(&format!(" Download: {} %",
                                         inner.device.download_percent()));
            }
            self.set_status(status);
            thread::sleep(POLL_INTERVAL);
        }

        let fetched = match inner.device.fetch_image() {
            Ok(f) => f,
            Err(e) => {
                error!("fetch_image failed: {}", e);
                return ImageBuffer::empty();
            }
        };
        // The device reports the binning it actually applied.
        inner.bin_x = fetched.bin_x;
        inner.bin_y = fetched.bin_y;

        if fetched.width < 1 || fetched.height < 1
            || fetched.data.len() != (fetched.width * fetched.height) as usize
        {
            error!("fetch_image returned inconsistent geometry {}x{} ({} samples)",
                   fetched.width, fetched.height, fetched.data.len());
            return ImageBuffer::empty();
        }
        let temperature = Self::read_temperature(&mut inner,
                                                 self.temp_sensor_count);
        let mut image = ImageBuffer::from_data(fetched.width as usize,
                                               fetched.height as usize,
                                               &fetched.data);
        image.set_metadata(ImageMetadata {
            exposure: exposure_now,
            bin_x: fetched.bin_x,
            bin_y: fetched.bin_y,
            temperature,
            timestamp_ms: start_timestamp,
            camera_name: self.name.clone(),
        });
        image
    }

    /// Best-effort interrupt: raises the cancellation flag and issues a
    /// hardware abort. The in-flight capture observes the flag on its own
    /// schedule; this does not force an immediate return.
    pub fn cancel_capture(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        if !self.ready {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if let Err(e) = inner.device.abort_exposure() {
            warn!("abort_exposure failed: {}", e);
        }
    }

    /// Exposure in seconds, quantized to 1 ms increments and capped at 10
    /// minutes. Out-of-range values are clamped, not rejected.
    pub fn set_exposure(&self, exposure_seconds: f32) {
        if !self.ready {
            return;
        }
        // Round to the nearest millisecond: an f32 like 0.02 widens to just
        // under its decimal value, and truncation would lose 1 ms.
        let seconds = exposure_seconds.max(0.0);
        let ms = ((seconds as f64 * 1000.0).round() as i64).min(MAX_EXPOSURE_MS);
        let mut inner = self.inner.lock().unwrap();
        inner.exposure = ms as f32 * 0.001;
    }

    /// Binning is clamped to [1, 16] and only re-issued to the device when
    /// it actually changes. The ROI is given in unbinned detector
    /// coordinates and is clamped to the sensor; a degenerate region
    /// (x_max <= x_min or y_max <= y_min after clamping) resets that axis
    /// to the full detector.
    pub fn set_binning_and_roi(&self, bin_x: i32, bin_y: i32,
                               x_min: i32, x_max: i32,
                               y_min: i32, y_max: i32) {
        if !self.ready {
            return;
        }
        let mut inner = self.inner.lock().unwrap();

        let bin_x = bin_x.clamp(MIN_BINNING, MAX_BINNING);
        let bin_y = bin_y.clamp(MIN_BINNING, MAX_BINNING);
        if bin_x != inner.bin_x || bin_y != inner.bin_y {
            if let Err(e) = inner.device.set_binning(bin_x, bin_y) {
                error!("set_binning({}, {}) failed: {}", bin_x, bin_y, e);
                return;
            }
            inner.bin_x = bin_x;
            inner.bin_y = bin_y;
        }

        let mut left = x_min;
        let mut right = x_max;
        if right > self.ccd_width {
            right = self.ccd_width;
        }
        if left < 0 {
            left = 0;
        }
        if right <= left {
            left = 0;
            right = self.ccd_width;
        }

        let mut top = y_min;
        let mut bottom = y_max;
        if bottom > self.ccd_height {
            bottom = self.ccd_height;
        }
        if top < 0 {
            top = 0;
        }
        if bottom <= top {
            top = 0;
            bottom = self.ccd_height;
        }

        match inner.device.set_subframe(left, top, right - left, bottom - top) {
            Ok(()) => {
                inner.roi = Roi { x_min: left, x_max: right,
                                  y_min: top, y_max: bottom };
            }
            Err(e) => {
                error!("set_subframe failed: {}; reverting to full frame", e);
                inner.roi = Roi { x_min: 0, x_max: self.ccd_width,
                                  y_min: 0, y_max: self.ccd_height };
            }
        }
    }

    /// No-op on cameras without a controllable shutter.
    pub fn set_shutter_open(&self, open: bool) {
        if !self.ready || !self.has_shutter {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let result = if open {
            inner.device.open_shutter()
        } else {
            inner.device.close_shutter()
        };
        match result {
            Ok(()) => inner.shutter_open = open,
            Err(e) => error!("shutter command failed: {}", e),
        }
    }

    /// Cooler setpoint in degrees C; the device takes centidegrees.
    pub fn set_temperature_target(&self, target_celsius: f32) {
        if !self.ready {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let centideg = (target_celsius * 100.0) as i32;
        if let Err(e) = inner.device.set_cooling(centideg) {
            error!("set_cooling({}) failed: {}", centideg, e);
        }
    }

    /// Detector temperature in degrees C, or INVALID_TEMPERATURE when the
    /// session never initialized. Readings are taken from every reported
    /// sensor in index order; later sensors overwrite earlier ones, so the
    /// last sensor wins.
    pub fn get_temperature(&self) -> f32 {
        if !self.ready {
            return INVALID_TEMPERATURE;
        }
        let mut inner = self.inner.lock().unwrap();
        Self::read_temperature(&mut inner, self.temp_sensor_count)
    }

    fn read_temperature(inner: &mut SessionInner, sensor_count: i32) -> f32 {
        let mut centideg = 0;
        for i in 0..sensor_count {
            match inner.device.read_temperature_sensor(i + 1) {
                Ok(reading) => centideg = reading,
                Err(e) => warn!("temperature sensor {} read failed: {}", i + 1, e),
            }
        }
        centideg as f32 / 100.0
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.device.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim_camera::SimCamera;
    use std::sync::Arc;

    fn ready_session() -> CameraSession {
        CameraSession::new(Box::new(SimCamera::new("SimCam", 128, 96)))
    }

    #[test]
    fn failed_connect_leaves_session_not_ready() {
        let session = CameraSession::new(Box::new(SimCamera::unreachable("Ghost")));
        assert!(!session.is_ready());
        // All operations are no-ops with empty/sentinel results; none may
        // panic or block indefinitely.
        let img = session.capture();
        assert!(!img.has_data());
        assert_eq!(session.get_temperature(), INVALID_TEMPERATURE);
        session.set_exposure(1.0);
        assert_eq!(session.exposure(), 0.0);
        session.set_binning_and_roi(2, 2, 0, 10, 0, 10);
        session.set_shutter_open(true);
        session.set_temperature_target(-10.0);
        session.cancel_capture();
    }

    #[test]
    fn capture_produces_stamped_frame() {
        let session = ready_session();
        assert!(session.is_ready());
        session.set_exposure(0.02);
        let img = session.capture();
        assert!(img.has_data());
        assert_eq!((img.width(), img.height()), (128, 96));
        let meta = img.metadata();
        assert_eq!(meta.camera_name, "SimCam");
        assert_eq!((meta.bin_x, meta.bin_y), (1, 1));
        assert!((meta.exposure - 0.02).abs() < 1e-6);
        assert!(meta.timestamp_ms > 0);
    }

    #[test]
    fn binned_capture_reports_device_binning() {
        let session = ready_session();
        session.set_exposure(0.01);
        session.set_binning_and_roi(2, 2, 0, 0, 0, 0);
        let img = session.capture();
        assert!(img.has_data());
        assert_eq!((img.width(), img.height()), (64, 48));
        assert_eq!((img.metadata().bin_x, img.metadata().bin_y), (2, 2));
        assert_eq!(session.binning(), (2, 2));
    }

    #[test]
    fn exposure_is_clamped_not_rejected() {
        let session = ready_session();
        session.set_exposure(-5.0);
        assert_eq!(session.exposure(), 0.0);
        session.set_exposure(1e6);
        assert!((session.exposure() - 600.0).abs() < 1e-3);
        // Sub-millisecond exposures quantize to zero; capture still runs
        // a 1 ms exposure.
        session.set_exposure(0.0004);
        assert_eq!(session.exposure(), 0.0);
        let img = session.capture();
        assert!(img.has_data());
    }

    #[test]
    fn exposure_quantizes_to_nearest_millisecond() {
        let session = ready_session();
        // 0.02f32 widens to 0.01999...; truncation would store 19 ms.
        session.set_exposure(0.02);
        assert!((session.exposure() - 0.02).abs() < 1e-6);
        session.set_exposure(0.1);
        assert!((session.exposure() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn binning_is_clamped() {
        let session = ready_session();
        session.set_binning_and_roi(0, 64, 0, 0, 0, 0);
        assert_eq!(session.binning(), (1, 16));
    }

    #[test]
    fn degenerate_roi_resets_to_full_detector() {
        let session = ready_session();
        // x_max < x_min is degenerate; the whole axis resets.
        session.set_binning_and_roi(1, 1, 50, 10, 20, 60);
        let roi = session.roi();
        assert_eq!(roi, Roi { x_min: 0, x_max: 128, y_min: 20, y_max: 60 });
    }

    #[test]
    fn roi_is_clamped_to_sensor() {
        let session = ready_session();
        session.set_binning_and_roi(1, 1, -10, 500, -5, 48);
        let roi = session.roi();
        assert_eq!(roi, Roi { x_min: 0, x_max: 128, y_min: 0, y_max: 48 });
    }

    #[test]
    fn cancel_during_exposure_returns_empty() {
        let session = Arc::new(ready_session());
        session.set_exposure(1.0);
        let worker = {
            let session = Arc::clone(&session);
            std::thread::spawn(move || session.capture())
        };
        std::thread::sleep(Duration::from_millis(50));
        session.cancel_capture();
        let img = worker.join().unwrap();
        assert!(!img.has_data());
    }

    #[test]
    fn capture_failure_is_per_call_not_fatal() {
        let session = ready_session();
        session.set_exposure(0.01);
        let first = session.capture();
        assert!(first.has_data());
        // The session stays ready for the next attempt.
        assert!(session.is_ready());
        let second = session.capture();
        assert!(second.has_data());
    }

    #[test]
    fn temperature_follows_cooling_target() {
        let session = ready_session();
        session.set_temperature_target(-30.0);
        let temp = (0..32).map(|_| session.get_temperature()).last().unwrap();
        assert!(temp < -29.0);
    }
}
