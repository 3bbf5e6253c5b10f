use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, RgbImage};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use veranda_contracts::events::{payload, EventWriter};
use veranda_contracts::job::{EventJobSink, JobSink};
use veranda_contracts::receipts::{build_receipt, write_receipt, AttemptScore, RequestSummary};
use veranda_contracts::request::{GenerationRequest, DEFAULT_MESH_TYPE};
use veranda_engine::{
    ClientConfig, DirArtifactSink, EditClient, GeminiModel, ReferenceImageStore, ScreenPipeline,
    DEFAULT_MODEL,
};

const JPEG_QUALITY: u8 = 85;

#[derive(Debug, Parser)]
#[command(name = "veranda", version, about = "Motorized-screen visualization pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Run(RunArgs),
    Refs(RefsArgs),
}

#[derive(Debug, Parser)]
struct RunArgs {
    /// Photo of the house to edit.
    #[arg(long)]
    input: PathBuf,
    /// Directory receiving outputs, the event stream, and the receipt.
    #[arg(long)]
    out: PathBuf,
    /// Mesh opacity bucket (80, 95, or 99).
    #[arg(long)]
    opacity: Option<String>,
    /// Screen color used when no reference image is on file.
    #[arg(long)]
    color: Option<String>,
    #[arg(long, default_value = DEFAULT_MESH_TYPE)]
    mesh_type: String,
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,
    /// Per-call transport timeout in seconds.
    #[arg(long, default_value_t = 90.0)]
    timeout: f64,
    /// Directory of reference screens, laid out <dir>/<opacity>/master/.
    #[arg(long)]
    references: Option<PathBuf>,
    /// Keep every intermediate stage image under <out>/stages.
    #[arg(long)]
    keep_stages: bool,
}

#[derive(Debug, Parser)]
struct RefsArgs {
    /// Directory of reference screens to inspect.
    #[arg(long)]
    references: PathBuf,
}

fn main() {
    match run() {
        Ok(()) => {}
        Err(err) => {
            eprintln!("veranda error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_pipeline(args),
        Command::Refs(args) => list_references(args),
    }
}

fn run_pipeline(args: RunArgs) -> Result<()> {
    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed creating {}", args.out.display()))?;
    let input_bytes = fs::read(&args.input)
        .with_context(|| format!("failed reading {}", args.input.display()))?;
    let input = image::load_from_memory(&input_bytes)
        .with_context(|| format!("could not decode {}", args.input.display()))?
        .to_rgb8();

    let mut request =
        GenerationRequest::new(input).with_style(args.opacity.clone(), args.color.clone());
    request.mesh_type = args.mesh_type.clone();

    let events = EventWriter::new(args.out.join("events.jsonl"), request.id.clone());
    let config = ClientConfig::default()
        .with_model(&args.model)
        .with_timeout_secs(args.timeout);
    let model = GeminiModel::from_env(config)?;
    let references = match &args.references {
        Some(dir) => ReferenceImageStore::load(dir),
        None => ReferenceImageStore::empty(),
    };

    let mut pipeline = ScreenPipeline::new(
        EditClient::new(Arc::new(model)),
        references,
        events.clone(),
    );
    if args.keep_stages {
        pipeline = pipeline
            .with_artifact_sink(Box::new(DirArtifactSink::new(args.out.join("stages"))));
    }
    for warning in pipeline.reference_warnings() {
        let _ = events.emit("reference_warning", payload(json!({ "message": warning })));
    }

    let sink = EventJobSink::new(events);
    let processed = process_job(
        &pipeline,
        &request,
        &sink,
        &args.out,
        Some(&input_bytes),
    )?;

    println!("quality score: {}", processed.quality_score);
    println!("final: {}", processed.final_path.display());
    println!("clean: {}", processed.clean_path.display());
    println!("receipt: {}", processed.receipt_path.display());
    Ok(())
}

fn list_references(args: RefsArgs) -> Result<()> {
    let store = ReferenceImageStore::load(&args.references);
    for opacity in store.loaded_opacities() {
        println!("{opacity}");
    }
    for warning in store.warnings() {
        eprintln!("warning: {warning}");
    }
    Ok(())
}

#[derive(Debug)]
struct ProcessedJob {
    final_path: PathBuf,
    clean_path: PathBuf,
    receipt_path: PathBuf,
    quality_score: i64,
}

/// Drive one job through the pipeline: progress milestones around the run,
/// JPEG outputs and a receipt on success, a failed mark carrying the error
/// chain otherwise.
fn process_job(
    pipeline: &ScreenPipeline,
    request: &GenerationRequest,
    job: &dyn JobSink,
    out_dir: &Path,
    input_bytes: Option<&[u8]>,
) -> Result<ProcessedJob> {
    job.mark_processing();
    job.update_progress(10, "Preparing the visualizer");

    match try_process(pipeline, request, job, out_dir, input_bytes) {
        Ok(processed) => {
            job.mark_complete();
            Ok(processed)
        }
        Err(err) => {
            job.mark_failed(&format!("{err:#}"));
            Err(err)
        }
    }
}

fn try_process(
    pipeline: &ScreenPipeline,
    request: &GenerationRequest,
    job: &dyn JobSink,
    out_dir: &Path,
    input_bytes: Option<&[u8]>,
) -> Result<ProcessedJob> {
    job.update_progress(30, "Running the screen pipeline");
    let outcome = pipeline.process(request, job)?;

    job.update_progress(90, "Saving results");
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed creating {}", out_dir.display()))?;
    let final_path = out_dir.join(format!("ai_generated_{}_standard.jpg", request.id));
    let clean_path = out_dir.join(format!("ai_generated_{}_clean.jpg", request.id));
    save_jpeg(&final_path, &outcome.final_image)?;
    save_jpeg(&clean_path, &outcome.clean_image)?;

    let (width, height) = request.image.dimensions();
    let summary = RequestSummary {
        job_id: request.id.clone(),
        opacity: request.resolved_opacity().to_string(),
        color: request.color.clone(),
        mesh_type: request.mesh_type.clone(),
        width,
        height,
        input_sha256: input_bytes.map(sha256_hex),
    };
    let attempts: Vec<AttemptScore> = outcome
        .attempts
        .iter()
        .enumerate()
        .map(|(idx, verdict)| AttemptScore {
            attempt: idx as u64 + 1,
            score: verdict.score,
            passed: verdict.passed,
        })
        .collect();
    let mut outputs = Map::new();
    outputs.insert(
        "final_path".to_string(),
        Value::String(final_path.to_string_lossy().to_string()),
    );
    outputs.insert(
        "clean_path".to_string(),
        Value::String(clean_path.to_string_lossy().to_string()),
    );

    let receipt_path = out_dir.join("receipt.json");
    let receipt = build_receipt(&summary, &attempts, &outcome.warnings, &outputs);
    write_receipt(&receipt_path, &receipt)?;

    Ok(ProcessedJob {
        final_path,
        clean_path,
        receipt_path,
        quality_score: outcome.quality_score,
    })
}

fn save_jpeg(path: &Path, image: &RgbImage) -> Result<()> {
    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY);
    encoder
        .encode_image(&DynamicImage::ImageRgb8(image.clone()))
        .with_context(|| format!("failed encoding {}", path.display()))?;
    fs::write(path, bytes).with_context(|| format!("failed writing {}", path.display()))?;
    Ok(())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use veranda_contracts::job::{JobTransition, RecordingJobSink};
    use veranda_engine::{
        encode_png, ContentPart, EditModel, EditReply, EditRequest, EditResponse, ReplyPart,
    };

    use super::*;

    /// Returns a lightly shifted copy of whatever image it is shown, and
    /// canned answers for the two side calls.
    struct CannedModel {
        verdict: &'static str,
    }

    impl EditModel for CannedModel {
        fn name(&self) -> &str {
            "canned"
        }

        fn edit(&self, request: &EditRequest) -> EditReply {
            let source = request
                .parts
                .iter()
                .find_map(|part| match part {
                    ContentPart::Image(image) => Some(image.clone()),
                    ContentPart::Text(_) => None,
                })
                .expect("request carries an image");
            let mut edited = source;
            for pixel in edited.pixels_mut() {
                pixel.0[0] = pixel.0[0].wrapping_add(40);
            }
            EditReply::Completed(EditResponse {
                parts: vec![ReplyPart::Image {
                    bytes: encode_png(&edited).expect("png encode"),
                    mime_type: Some("image/png".to_string()),
                }],
            })
        }

        fn ask(&self, _image: &RgbImage, question: &str) -> Result<String> {
            if question.contains("YES or NO") {
                Ok("NO".to_string())
            } else {
                Ok(self.verdict.to_string())
            }
        }
    }

    struct OfflineModel;

    impl EditModel for OfflineModel {
        fn name(&self) -> &str {
            "offline"
        }

        fn edit(&self, _request: &EditRequest) -> EditReply {
            EditReply::Failed("model offline".to_string())
        }

        fn ask(&self, _image: &RgbImage, _question: &str) -> Result<String> {
            anyhow::bail!("model offline")
        }
    }

    fn request_for_test() -> GenerationRequest {
        GenerationRequest::new(RgbImage::from_pixel(32, 24, image::Rgb([5, 5, 5])))
            .with_id("t1")
    }

    fn pipeline_with(model: impl EditModel + 'static, out_dir: &Path) -> ScreenPipeline {
        ScreenPipeline::new(
            EditClient::new(Arc::new(model)),
            ReferenceImageStore::empty(),
            EventWriter::new(out_dir.join("events.jsonl"), "t1"),
        )
    }

    #[test]
    fn process_job_walks_milestones_and_writes_outputs() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let out_dir = temp.path().join("run");
        let pipeline = pipeline_with(
            CannedModel {
                verdict: "SCORE: 90\nVERDICT: PASS",
            },
            &out_dir,
        );

        let sink = RecordingJobSink::new();
        let processed = process_job(&pipeline, &request_for_test(), &sink, &out_dir, None)?;

        assert!(processed.final_path.exists());
        assert!(processed.clean_path.exists());
        assert!(processed.receipt_path.exists());
        assert_eq!(processed.quality_score, 90);

        let transitions = sink.transitions();
        assert_eq!(transitions.first(), Some(&JobTransition::Processing));
        assert_eq!(transitions.last(), Some(&JobTransition::Complete));
        let progress: Vec<u8> = transitions
            .iter()
            .filter_map(|transition| match transition {
                JobTransition::Progress(percent, _) => Some(*percent),
                _ => None,
            })
            .collect();
        assert!(progress.contains(&10));
        assert!(progress.contains(&90));
        assert!(
            progress.windows(2).all(|pair| pair[0] <= pair[1]),
            "progress never moves backwards"
        );
        Ok(())
    }

    #[test]
    fn receipt_records_scores_and_fingerprint() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let out_dir = temp.path().join("run");
        let pipeline = pipeline_with(
            CannedModel {
                verdict: "SCORE: 77\nVERDICT: PASS",
            },
            &out_dir,
        );

        let sink = RecordingJobSink::new();
        let input_bytes = b"input-file-bytes".to_vec();
        let processed = process_job(
            &pipeline,
            &request_for_test(),
            &sink,
            &out_dir,
            Some(&input_bytes),
        )?;

        let receipt: Value =
            serde_json::from_str(&fs::read_to_string(&processed.receipt_path)?)?;
        assert_eq!(receipt["quality_attempts"][0]["score"], json!(77));
        assert_eq!(
            receipt["request"]["input_sha256"],
            json!(sha256_hex(&input_bytes))
        );
        Ok(())
    }

    #[test]
    fn pipeline_failure_marks_the_job_failed() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let out_dir = temp.path().join("run");
        let pipeline = pipeline_with(OfflineModel, &out_dir);

        let sink = RecordingJobSink::new();
        let err = process_job(&pipeline, &request_for_test(), &sink, &out_dir, None)
            .expect_err("a dead model fails the job");

        assert!(err.to_string().contains("cleanse"));
        match sink.transitions().last() {
            Some(JobTransition::Failed(message)) => {
                assert!(message.contains("model offline"));
            }
            other => panic!("expected a failed mark, got {other:?}"),
        }
        Ok(())
    }
}
