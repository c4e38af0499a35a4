use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kosface_capture::{
    step_instruction, CaptureConfig, CaptureController, CaptureError, CaptureSnapshot, CaptureStep,
    JsonFileSink, Locale,
};
use kosface_core::models::{self, ModelIntegrityError};
use kosface_core::{AntiSpoofChecker, CaptureMode, CapturePayload, Descriptor, LivenessStep, OnnxFaceAnalyzer};
use kosface_hw::convert::is_dark_frame;
use kosface_hw::{Camera, CameraError, FrameSource};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "kosface", about = "Face capture and liveness check for kos registration and login")]
struct Cli {
    /// TOML configuration file (KOSFACE_* variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Register,
    Login,
}

impl From<Mode> for CaptureMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Register => CaptureMode::Register,
            Mode::Login => CaptureMode::Login,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a capture session with liveness checks
    Capture {
        #[arg(short, long, value_enum)]
        mode: Mode,
        /// Where to write the payload JSON
        #[arg(short, long, default_value = "capture.json")]
        out: PathBuf,
        /// Capture as soon as the liveness sequence completes
        #[arg(long)]
        auto: bool,
        /// Earlier payload to compare the new face descriptor against
        #[arg(long)]
        reference: Option<PathBuf>,
        /// Cosine similarity needed to call the faces a match
        #[arg(long, default_value_t = 0.40)]
        threshold: f32,
    },
    /// List V4L2 capture devices
    Devices,
    /// Run camera diagnostics
    Test {
        /// Number of frames to inspect
        #[arg(short, long, default_value_t = 10)]
        frames: usize,
    },
    /// Check the ONNX model bundle
    Models {
        /// Skip SHA-256 verification
        #[arg(long)]
        no_verify: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = CaptureConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Capture {
            mode,
            out,
            auto,
            reference,
            threshold,
        } => {
            let payload = run_capture(config, mode.into(), &out, auto).await?;
            if let Some(reference) = reference {
                compare_with_reference(&payload, &reference, threshold)?;
            }
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
        Commands::Test { frames } => run_camera_test(&config, frames).await?,
        Commands::Models { no_verify } => check_models(&config.analysis.model_dir, !no_verify)?,
    }

    Ok(())
}

async fn run_capture(config: CaptureConfig, mode: CaptureMode, out: &Path, auto: bool) -> Result<CapturePayload> {
    let locale = config.capture.locale;
    let camera = Arc::new(Camera::new(config.camera.clone()));
    let analyzer = Arc::new(OnnxFaceAnalyzer::new(config.analysis.clone()));
    let sink = Arc::new(JsonFileSink::new(out));
    let controller = CaptureController::new(config, camera, analyzer, sink).context("invalid configuration")?;
    let mut snapshots = controller.subscribe();

    // Blocking stdin reader; Enter captures, "q" cancels.
    let (line_tx, mut lines) = mpsc::channel::<String>(4);
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if line_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    tracing::info!(%mode, out = %out.display(), auto, "starting capture session");
    println!("Starting {mode} capture...");
    if let Err(e) = controller.start(mode).await {
        eprintln!("{}", e.user_message(locale));
        return Err(e.into());
    }
    if auto {
        println!("Follow the prompts; the photo is taken when all checks pass. Ctrl-C cancels.");
    } else {
        println!("Press Enter to take the photo, q then Enter to cancel.");
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut progress = Progress::default();

    let payload = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                controller.cancel();
                bail!("{}", CaptureError::Cancelled.user_message(locale));
            }
            line = lines.recv() => {
                if matches!(line.as_deref().map(str::trim), None | Some("q")) {
                    controller.cancel();
                    bail!("{}", CaptureError::Cancelled.user_message(locale));
                }
                match try_capture(&controller, locale).await? {
                    Some(payload) => break payload,
                    None => continue,
                }
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    bail!("capture controller stopped");
                }
                let snapshot = snapshots.borrow_and_update().clone();
                if snapshot.step == CaptureStep::Failed {
                    let message = snapshot.message.unwrap_or_default();
                    bail!("{message}");
                }
                progress.report(&snapshot, locale);
                let complete = snapshot.liveness.as_ref().is_some_and(|l| l.is_complete());
                if auto && snapshot.step == CaptureStep::Capturing && complete && snapshot.face_detected {
                    if let Some(payload) = try_capture(&controller, locale).await? {
                        break payload;
                    }
                }
            }
        }
    };

    println!("Photo saved to {}", out.display());
    println!(
        "  face: {}  blink: {}  anti-spoof: {}  liveness: {}  quality: {}",
        yes_no(payload.face_detected),
        yes_no(payload.blink_detected),
        if payload.anti_spoofing_passed { "passed" } else { "flagged" },
        score(payload.liveness_score),
        score(payload.quality_score),
    );
    Ok(payload)
}

/// `Ok(None)` when the controller rejected the attempt and capture can be retried.
async fn try_capture(controller: &CaptureController, locale: Locale) -> Result<Option<CapturePayload>> {
    match controller.capture().await {
        Ok(payload) => Ok(Some(payload)),
        Err(e @ (CaptureError::LivenessIncomplete(_) | CaptureError::NotCapturing(_))) => {
            println!("{}", e.user_message(locale));
            Ok(None)
        }
        Err(e) => {
            eprintln!("{}", e.user_message(locale));
            Err(e.into())
        }
    }
}

/// Prints a line whenever visible progress changes.
#[derive(Default, PartialEq)]
struct Progress {
    step: Option<CaptureStep>,
    liveness_step: Option<LivenessStep>,
    blinks: u32,
    face: bool,
}

impl Progress {
    fn report(&mut self, snapshot: &CaptureSnapshot, locale: Locale) {
        let next = Progress {
            step: Some(snapshot.step),
            liveness_step: snapshot.liveness.as_ref().map(|l| l.current_step),
            blinks: snapshot.liveness.as_ref().map_or(0, |l| l.blink_count),
            face: snapshot.face_detected,
        };
        if next == *self {
            return;
        }
        *self = next;

        if snapshot.step != CaptureStep::Capturing {
            println!("[{:?}]", snapshot.step);
            return;
        }
        if !snapshot.analysis_available {
            println!("Face analysis unavailable; photo will be taken without face data");
            return;
        }
        if !snapshot.face_detected {
            println!("No face detected - look at the camera");
            return;
        }
        if let Some(liveness) = &snapshot.liveness {
            println!(
                "Next: {} (blinks {}, liveness {:.0}%)",
                step_instruction(liveness.current_step, locale),
                liveness.blink_count,
                liveness.liveness_score,
            );
        }
    }
}

fn compare_with_reference(payload: &CapturePayload, reference: &Path, threshold: f32) -> Result<()> {
    let text = std::fs::read_to_string(reference)
        .with_context(|| format!("failed to read {}", reference.display()))?;
    let earlier: CapturePayload = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a capture payload", reference.display()))?;

    let (Some(new), Some(old)) = (&payload.face_descriptor, &earlier.face_descriptor) else {
        bail!("both captures need a face descriptor to compare");
    };
    let new = Descriptor { values: new.clone(), model_version: None };
    let old = Descriptor { values: old.clone(), model_version: None };
    let similarity = new.similarity(&old);
    let verdict = if similarity >= threshold { "match" } else { "no match" };
    println!("Similarity to {}: {similarity:.3} ({verdict}, threshold {threshold:.2})", reference.display());
    Ok(())
}

async fn run_camera_test(config: &CaptureConfig, frames: usize) -> Result<()> {
    println!("Running camera diagnostics on {}...", config.camera.device);
    let camera = Camera::new(config.camera.clone());
    let timeout = config.capture.camera_timeout();
    let info = tokio::time::timeout(timeout, camera.start())
        .await
        .map_err(|_| CameraError::Timeout(timeout))??;
    println!("  stream: {}x{} {:?}", info.width, info.height, info.format);

    let checker = AntiSpoofChecker::new(config.anti_spoof.clone());
    let mut ticker = tokio::time::interval(config.capture.poll_interval());
    let mut last_seq = None;
    let mut seen = 0;
    let mut attempts = 0;
    while seen < frames && attempts < frames * 20 {
        ticker.tick().await;
        attempts += 1;
        let Some(frame) = camera.latest_frame() else { continue };
        if last_seq == Some(frame.sequence) {
            continue;
        }
        last_seq = Some(frame.sequence);
        seen += 1;

        let signal = checker.check(&frame, None);
        println!(
            "  frame {:>5}: brightness {:>5.1}  dark {:<3}  texture {:>5.1}{}",
            frame.sequence,
            frame.avg_brightness(),
            yes_no(is_dark_frame(&frame, 0.95)),
            signal.mean_deviation,
            if signal.spoof_detected { "  (low texture)" } else { "" },
        );
    }
    camera.stop();

    if seen < frames {
        bail!("camera delivered only {seen} of {frames} frames");
    }
    Ok(())
}

fn check_models(dir: &Path, verify: bool) -> Result<()> {
    println!("Model directory: {}", dir.display());
    let mut missing_required = false;
    tracing::debug!(verify, "checking model bundle");
    for status in models::bundle_report(dir, verify) {
        let model = status.model;
        let line = match &status.result {
            Ok(_) if verify && model.sha256.is_some() => "ok (checksum verified)".to_string(),
            Ok(_) => "ok".to_string(),
            Err(ModelIntegrityError::MissingModel { .. }) if !model.required => {
                "missing (optional: descriptors disabled)".to_string()
            }
            Err(e) => {
                if model.required {
                    missing_required = true;
                }
                e.to_string()
            }
        };
        println!("  {:<16} {line}", model.name);
    }
    if missing_required {
        bail!("model bundle incomplete; face analysis will be unavailable");
    }
    Ok(())
}

fn yes_no(v: bool) -> &'static str {
    if v {
        "yes"
    } else {
        "no"
    }
}

fn score(v: Option<f32>) -> String {
    v.map_or_else(|| "-".to_string(), |s| format!("{s:.0}"))
}
