//! Face Analytics Cascade
//!
//! Runs face detection plus the configured analytics networks on every image
//! given on the command line, using OpenVINO.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use facecascade::backend::OpenVinoBackend;
use facecascade::config::Config;
use facecascade::service::FaceCascade;
use facecascade::utils::image::load_frame;

fn main() -> Result<()> {
    let config_path = std::env::var("FACECASCADE_CONFIG").unwrap_or_else(|_| Config::default_path().to_string());
    let config_result = Config::load(&config_path);
    let raw_output = config_result
        .as_ref()
        .map(|c| c.inference.raw_output)
        .unwrap_or(false);

    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(if raw_output { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .init();

    info!("Starting Face Analytics Cascade v{}", env!("CARGO_PKG_VERSION"));

    let config = config_result.unwrap_or_else(|e| {
        info!("Using default config ({:#})", e);
        Config::default()
    });

    info!("Configuration loaded:");
    info!("  Device: {}", config.inference.device);
    info!("  Async mode: {}", config.inference.async_mode);
    info!("  Detection threshold: {}", config.detection.threshold);

    let images: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    if images.is_empty() {
        warn!("No input images given, usage: facecascade <image>...");
        return Ok(());
    }

    let backend = OpenVinoBackend::new()?;
    let mut cascade = FaceCascade::new(&config);
    cascade.load(&backend).context("Failed to load networks")?;

    for path in &images {
        let frame = load_frame(path)?;
        let results = cascade.process(&frame)?;

        info!("{}: {} faces", path.display(), results.detections.len());
        for (i, face) in results.faces().iter().enumerate() {
            let b = face.detection.location;
            info!(
                "  face {}: conf {:.3} at ({}, {}) {}x{}",
                i, face.detection.confidence, b.x, b.y, b.width, b.height
            );
            if let Some(ag) = face.age_gender {
                info!(
                    "    age {:.0}, {} ({:.2})",
                    ag.age,
                    if ag.is_male() { "M" } else { "F" },
                    ag.male_probability
                );
            }
            if let Some(pose) = face.head_pose {
                info!(
                    "    head pose yaw {:.1} pitch {:.1} roll {:.1}",
                    pose.yaw, pose.pitch, pose.roll
                );
            }
            if let Some((label, p)) = face.emotions.and_then(|e| e.dominant()) {
                info!("    emotion {} ({:.2})", label, p);
            }
            if let Some(landmarks) = face.landmarks {
                info!("    {} landmarks", landmarks.0.len());
            }
            if let Some(liveness) = face.liveness {
                info!("    real face {:.1}%", liveness.real_face_probability);
            }
        }
        for (kind, e) in results.errors() {
            warn!("  {} failed: {}", kind, e);
        }
    }

    info!("Latency:");
    for (name, stat) in cascade.latency_report() {
        info!(
            "  {}: {} calls, last {:.2} ms, smoothed {:.2} ms",
            name, stat.calls, stat.last_ms, stat.smoothed_ms
        );
    }

    Ok(())
}
