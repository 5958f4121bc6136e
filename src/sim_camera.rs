// Simulated camera device yielding synthetic frames. For testing and for
// exercising the acquisition stack without hardware attached.

use std::time::{Duration, Instant};

use canonical_error::{failed_precondition_error, not_found_error, CanonicalError};

use crate::camera_device::{CameraDevice, Centidegrees, DeviceProperties,
                           DeviceState, FetchedImage};

/// Signal accumulated per pixel per millisecond of exposure, before binning.
const COUNTS_PER_MS: u32 = 10;

pub struct SimCamera {
    name: String,
    sensor_width: i32,
    sensor_height: i32,
    reachable: bool,

    connected: bool,
    bin_x: i32,
    bin_y: i32,
    // Subframe in unbinned detector coordinates.
    sub_left: i32,
    sub_top: i32,
    sub_width: i32,
    sub_height: i32,
    shutter_open: bool,

    temperature_cdeg: Centidegrees,
    cooling_target_cdeg: Centidegrees,

    exposure_ms: u32,
    exposure_start: Option<Instant>,
    aborted: bool,
}

impl SimCamera {
    pub fn new(name: &str, sensor_width: i32, sensor_height: i32) -> Self {
        SimCamera {
            name: name.to_string(),
            sensor_width,
            sensor_height,
            reachable: true,
            connected: false,
            bin_x: 1,
            bin_y: 1,
            sub_left: 0,
            sub_top: 0,
            sub_width: sensor_width,
            sub_height: sensor_height,
            shutter_open: false,
            temperature_cdeg: 2000, // 20 C ambient
            cooling_target_cdeg: 2000,
            exposure_ms: 0,
            exposure_start: None,
            aborted: false,
        }
    }

    /// A device that fails to connect, for exercising the fatal-to-session
    /// initialization path.
    pub fn unreachable(name: &str) -> Self {
        let mut cam = SimCamera::new(name, 0, 0);
        cam.reachable = false;
        cam
    }

    fn elapsed_ms(&self) -> u32 {
        match self.exposure_start {
            Some(start) => start.elapsed().as_millis() as u32,
            None => 0,
        }
    }

    fn require_connected(&self) -> Result<(), CanonicalError> {
        if !self.connected {
            return Err(failed_precondition_error("Simulated device not connected"));
        }
        Ok(())
    }
}

impl CameraDevice for SimCamera {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn connect(&mut self) -> Result<(), CanonicalError> {
        if !self.reachable {
            return Err(not_found_error("No simulated camera present"));
        }
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn query_properties(&mut self) -> Result<DeviceProperties, CanonicalError> {
        self.require_connected()?;
        Ok(DeviceProperties {
            sensor_width: self.sensor_width,
            sensor_height: self.sensor_height,
            has_shutter: true,
            temp_sensor_count: 2,
        })
    }

    fn start_exposure_ms(&mut self, ms: u32) -> Result<(), CanonicalError> {
        self.require_connected()?;
        self.exposure_ms = ms;
        self.exposure_start = Some(Instant::now());
        self.aborted = false;
        Ok(())
    }

    fn exposure_remaining_ms(&mut self) -> u32 {
        self.exposure_ms.saturating_sub(self.elapsed_ms())
    }

    fn poll_image_ready(&mut self) -> bool {
        if self.exposure_start.is_none() {
            return false;
        }
        self.aborted || self.exposure_remaining_ms() == 0
    }

    fn camera_state(&mut self) -> DeviceState {
        if !self.connected {
            return DeviceState::Error;
        }
        if self.exposure_start.is_some() && self.exposure_remaining_ms() > 0 {
            DeviceState::Exposing
        } else {
            DeviceState::Idle
        }
    }

    fn download_percent(&mut self) -> i32 {
        100
    }

    fn fetch_image(&mut self) -> Result<FetchedImage, CanonicalError> {
        self.require_connected()?;
        if self.exposure_start.take().is_none() {
            return Err(failed_precondition_error("No exposure was started"));
        }
        let width = (self.sub_width / self.bin_x).max(1);
        let height = (self.sub_height / self.bin_y).max(1);
        // Binned wells accumulate the signal of bin_x * bin_y sensor
        // pixels; a mild column gradient makes frames non-uniform.
        let well = (self.bin_x * self.bin_y) as u32;
        let base = COUNTS_PER_MS * self.exposure_ms * well;
        let mut data = Vec::with_capacity((width * height) as usize);
        for _row in 0..height {
            for col in 0..width {
                let v = base + (col as u32 % 16) * well;
                data.push(v.min(0xffff) as u16);
            }
        }
        Ok(FetchedImage {
            x: self.sub_left / self.bin_x,
            y: self.sub_top / self.bin_y,
            width,
            height,
            bin_x: self.bin_x,
            bin_y: self.bin_y,
            data,
        })
    }

    fn set_binning(&mut self, bin_x: i32, bin_y: i32) -> Result<(), CanonicalError> {
        self.require_connected()?;
        self.bin_x = bin_x.max(1);
        self.bin_y = bin_y.max(1);
        Ok(())
    }

    fn set_subframe(&mut self, left: i32, top: i32, width: i32, height: i32)
                    -> Result<(), CanonicalError> {
        self.require_connected()?;
        if left < 0 || top < 0 || width < 1 || height < 1
            || left + width > self.sensor_width
            || top + height > self.sensor_height
        {
            return Err(failed_precondition_error("Subframe outside sensor"));
        }
        self.sub_left = left;
        self.sub_top = top;
        self.sub_width = width;
        self.sub_height = height;
        Ok(())
    }

    fn set_preview_mode(&mut self, _enabled: bool) -> Result<(), CanonicalError> {
        self.require_connected()
    }

    fn set_subsample(&mut self, _enabled: bool) -> Result<(), CanonicalError> {
        self.require_connected()
    }

    fn set_cooling(&mut self, target: Centidegrees) -> Result<(), CanonicalError> {
        self.require_connected()?;
        self.cooling_target_cdeg = target;
        Ok(())
    }

    fn read_temperature_sensor(&mut self, index: i32)
                               -> Result<Centidegrees, CanonicalError> {
        self.require_connected()?;
        if index < 1 {
            return Err(failed_precondition_error("Sensor indices start at 1"));
        }
        // The cooler moves a quarter of the way to the target per read.
        self.temperature_cdeg +=
            (self.cooling_target_cdeg - self.temperature_cdeg) / 4;
        Ok(self.temperature_cdeg)
    }

    fn open_shutter(&mut self) -> Result<(), CanonicalError> {
        self.require_connected()?;
        self.shutter_open = true;
        Ok(())
    }

    fn close_shutter(&mut self) -> Result<(), CanonicalError> {
        self.require_connected()?;
        self.shutter_open = false;
        Ok(())
    }

    fn abort_exposure(&mut self) -> Result<(), CanonicalError> {
        self.require_connected()?;
        self.aborted = true;
        Ok(())
    }
}
