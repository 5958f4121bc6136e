// Unattended recording loop: captures on a fixed cadence, feeds each
// frame's pixel distribution back through the auto-exposure estimator, and
// runs a thermal control thread alongside. Frames land as JPEG previews in
// the output directory.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use env_logger;
use log::{info, warn};

use ccd_camera::auto_exposure::AutoExposureTargets;
use ccd_camera::camera_session::CameraSession;
use ccd_camera::sim_camera::SimCamera;
use ccd_camera::thermal_pid::{ThermalPid, ThermalPidConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Output directory for recorded frames.
    #[arg(short, long, default_value = "frames")]
    output: String,

    /// Number of frames to record.
    #[arg(short, long, default_value_t = 10)]
    frames: u32,

    /// Seconds between capture starts.
    #[arg(short, long, default_value_t = 2.0)]
    cadence: f32,

    /// Longest exposure the estimator may propose, seconds.
    #[arg(long, default_value_t = 120.0)]
    max_exposure: f32,

    /// Largest binning factor the estimator may propose.
    #[arg(long, default_value_t = 4)]
    max_bin: i32,

    /// Detector cooling setpoint, degrees C.
    #[arg(long, default_value_t = -30.0)]
    cool_to: f32,
}

/// Everything the worker threads share. Passed explicitly; there is no
/// process-wide camera state.
struct AppContext {
    session: CameraSession,
    done: AtomicBool,
}

fn thermal_loop(ctx: Arc<AppContext>, setpoint: f32) {
    let mut pid = ThermalPid::new(ThermalPidConfig {
        kp: 0.005,
        ki: 0.0005,
        kd: 0.001,
        time_step: 0.2,
        temp_target: setpoint,
        rate_target: 1.0,
    })
    .unwrap();
    while !ctx.done.load(Ordering::SeqCst) {
        let temperature = ctx.session.get_temperature();
        let out = pid.step(temperature);
        if let (Some(rate), Some(actuation)) = (out.rate, out.actuation) {
            info!("cooler: {:.2} C at {:.3} C/s, actuating {} us",
                  temperature, rate, actuation.as_micros());
        }
        thread::sleep(Duration::from_millis(200));
    }
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    std::fs::create_dir_all(&args.output).unwrap();

    let session = CameraSession::new(Box::new(SimCamera::new("SimCam", 1024, 768)));
    if !session.is_ready() {
        panic!("Camera did not initialize");
    }
    info!("Camera: {}\tTemperature: {:.2} C",
          session.camera_name(), session.get_temperature());
    session.set_temperature_target(args.cool_to);
    session.set_exposure(0.2);
    session.set_binning_and_roi(1, 1, 0, 0, 0, 0);

    let ctx = Arc::new(AppContext { session, done: AtomicBool::new(false) });
    let thermal = {
        let ctx = Arc::clone(&ctx);
        let setpoint = args.cool_to;
        thread::spawn(move || thermal_loop(ctx, setpoint))
    };

    let targets = AutoExposureTargets {
        max_exposure: args.max_exposure,
        ..Default::default()
    };
    let mut exposure = 0.2f32;
    let mut bin = 1;
    for n in 0..args.frames {
        let mut image = ctx.session.capture();
        if !image.has_data() {
            warn!("frame {}: capture returned no data", n);
            continue;
        }
        let stats = image.stats();
        info!("frame {}: {}x{} bin {} exp {:.3}s mean {:.0}",
              n, image.width(), image.height(), bin, exposure, stats.mean);

        let filename = Path::new(&args.output)
            .join(format!("{}.jpg", image.metadata().timestamp_ms));
        match image.preview_jpeg() {
            Ok(jpeg) => std::fs::write(&filename, jpeg).unwrap(),
            Err(e) => warn!("frame {}: preview failed: {}", n, e),
        }

        (exposure, bin) = image.find_optimum_exposure_and_bin(
            exposure, bin, args.max_bin, &targets);
        ctx.session.set_binning_and_roi(bin, bin, 0, 0, 0, 0);
        ctx.session.set_exposure(exposure);

        let sleep = args.cadence - exposure;
        if sleep > 0.0 {
            thread::sleep(Duration::from_secs_f32(sleep));
        }
    }

    ctx.done.store(true, Ordering::SeqCst);
    thermal.join().unwrap();
}
