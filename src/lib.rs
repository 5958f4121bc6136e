pub mod auto_exposure;
pub mod camera_device;
pub mod camera_session;
pub mod fits_record;
pub mod image_data;
pub mod net_frame;
pub mod ring_buf;
pub mod sim_camera;
pub mod thermal_pid;
