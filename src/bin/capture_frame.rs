extern crate chrono;
use chrono::offset::Local;
use chrono::DateTime;
use std::time::UNIX_EPOCH;

use clap::Parser;
use env_logger;
use log::info;

use ccd_camera::camera_session::CameraSession;
use ccd_camera::sim_camera::SimCamera;

/// Captures a single frame and writes its JPEG preview to disk. Runs
/// against the simulated camera; point this at a hardware CameraDevice
/// implementation to drive a real detector.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Output JPEG filename.
    #[arg(short, long)]
    output: String,

    /// Exposure time in seconds.
    #[arg(short, long, default_value_t = 0.2)]
    exposure: f32,

    /// Binning factor (applied to both axes).
    #[arg(short, long, default_value_t = 1)]
    bin: i32,
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let session = CameraSession::new(Box::new(SimCamera::new("SimCam", 1024, 768)));
    if !session.is_ready() {
        panic!("Camera did not initialize");
    }
    info!("Camera: {}\tTemperature: {:.2} C",
          session.camera_name(), session.get_temperature());

    session.set_binning_and_roi(args.bin, args.bin, 0, 0, 0, 0);
    session.set_exposure(args.exposure);
    let mut image = session.capture();
    if !image.has_data() {
        panic!("Capture returned no image data");
    }

    let stats = image.stats();
    info!("Frame {}x{}: min {} max {} mean {:.1} stddev {:.1}",
          image.width(), image.height(),
          stats.min, stats.max, stats.mean, stats.stddev);

    let timestamp = UNIX_EPOCH
        + std::time::Duration::from_millis(image.metadata().timestamp_ms);
    let datetime: DateTime<Local> = timestamp.into();
    let jpeg = image.preview_jpeg().unwrap();
    std::fs::write(&args.output, jpeg).unwrap();
    info!("Image exposed at {} written to {}",
          datetime.format("%d/%m/%Y %T"), args.output);
}
