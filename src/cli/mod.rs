//! RustFusion CLI entrypoint.
//!
//! Streams a posed RGB-D dataset frame by frame into the fusion engine,
//! then rebuilds gradients and meshes, exports the PLY surface and
//! optionally dumps the raw blocks. Option names match the original
//! fusion driver.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use log::{debug, error, info};
use serde::Serialize;
use thiserror::Error;

use crate::config::{ConfigError, FusionConfig};
use crate::core::RgbdFrame;
use crate::fusion::{Fusion, VolumeError};
use crate::io::{DataStreamer, DatasetType, StreamError};

/// RustFusion command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "rustfusion", version, about = "TSDF fusion of posed RGB-D streams")]
struct CliArgs {
    /// Dataset directory containing output.txt and the frame images.
    #[arg(long = "dataset", value_name = "DIR")]
    dataset: PathBuf,
    /// Dataset flavour: fr1, icl1 or synthetic0.
    #[arg(long = "datasetType", value_name = "TAG", default_value = "fr1")]
    dataset_type: String,
    /// Voxel resolution in meters.
    #[arg(long = "voxelRes", value_name = "METERS", default_value_t = 0.01)]
    voxel_res: f32,
    /// Truncation distance in meters.
    #[arg(long = "tau", value_name = "METERS", default_value_t = 0.025)]
    tau: f32,
    /// Minimum integration distance.
    #[arg(long = "minDist", value_name = "METERS", default_value_t = 0.0)]
    min_dist: f32,
    /// Maximum integration distance.
    #[arg(long = "maxDist", value_name = "METERS", default_value_t = 2.0)]
    max_dist: f32,
    /// Refresh the mesh cache after every frame.
    #[arg(long = "updateMesh")]
    update_mesh: bool,
    /// Integrate along estimated normals of the ordered point cloud.
    #[arg(long = "useOPC")]
    use_opc: bool,
    /// Preload previously dumped blocks from the output directory.
    #[arg(long = "preload")]
    preload: bool,
    /// Dump all blocks to the output directory on shutdown.
    #[arg(long = "dumpBlocks")]
    dump_blocks: bool,
    /// Skip the final mesh export.
    #[arg(long = "noExport")]
    no_export: bool,
    /// Output directory.
    #[arg(long = "outputDir", value_name = "DIR", default_value = "./")]
    output_dir: PathBuf,
    /// Name of the exported PLY file.
    #[arg(long = "outputFile", value_name = "FILE", default_value = "fusion-output.ply")]
    output_file: String,
}

#[derive(Error, Debug)]
enum CliError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("stream: {0}")]
    Stream(#[from] StreamError),
    #[error("volume: {0}")]
    Volume(#[from] VolumeError),
    #[error("output path exists but is not a directory: {0}")]
    OutputNotDirectory(PathBuf),
    #[error("failed to create output directory {path}: {source}")]
    OutputCreate {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Config(_) => ExitCode::from(1),
            _ => ExitCode::from(2),
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            CliError::Config(_) => "ConfigurationError",
            CliError::Stream(_) => "StreamError",
            CliError::Volume(_) => "IoError",
            CliError::OutputNotDirectory(_) | CliError::OutputCreate { .. } => "OutputError",
        }
    }
}

#[derive(Debug, Serialize)]
struct ResultsJson {
    status: String,
    dataset: String,
    dataset_type: String,
    frames: usize,
    blocks: usize,
    triangles: usize,
    processing_time_ms: u128,
    output: Option<String>,
}

pub fn run() -> ExitCode {
    let start = Instant::now();
    let cli = CliArgs::parse();
    init_logger();

    match run_pipeline(&cli, start) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            eprintln!("Error [{}]: {}", err.tag(), err);
            err.exit_code()
        }
    }
}

fn init_logger() {
    let mut builder = env_logger::Builder::new();
    builder.target(env_logger::Target::Stderr);
    builder.filter_level(log::LevelFilter::Info);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    let _ = builder.try_init();
}

fn run_pipeline(cli: &CliArgs, start: Instant) -> Result<(), CliError> {
    let dataset_type: DatasetType = cli.dataset_type.parse()?;
    let config = FusionConfig {
        voxel_res: cli.voxel_res,
        tau: cli.tau,
        min_dist: cli.min_dist,
        max_dist: cli.max_dist,
        ..Default::default()
    };
    config.validate()?;

    let output_dir = ensure_output_dir(&cli.output_dir)?;
    let intrinsics = dataset_type.intrinsics();
    let mut streamer = DataStreamer::new(&cli.dataset, dataset_type)?;
    let mut fusion = Fusion::new(config);

    info!("starting fusion over {} frames", streamer.remaining());
    info!("dataset: {} ({})", cli.dataset.display(), dataset_type.as_str());
    debug!(
        "voxelRes={} tau={} dist=[{}, {}]",
        config.voxel_res, config.tau, config.min_dist, config.max_dist
    );

    if cli.preload {
        info!("preloading blocks from {}", output_dir.display());
        fusion.preload_blocks(&output_dir)?;
    }

    let mut frame = RgbdFrame::new(config.max_frame_width, config.max_frame_height);
    let mut frames = 0usize;
    while let Some(pose) = streamer.next_frame(&mut frame)? {
        info!("-------------------------------------------------------");
        info!("integrating frame {}", frames);
        frame.filter_depth();

        let transform = dataset_type.frame_transform(&pose);
        if cli.use_opc {
            fusion.integrate_depth_map_ordered(&frame, &intrinsics, &transform);
        } else {
            fusion.integrate_depth_map(&frame, &intrinsics, &transform);
        }

        if cli.update_mesh {
            fusion.update_meshes()?;
        }
        frames += 1;
    }

    info!("rebuilding gradients and meshes for export");
    fusion.recompute_meshes()?;

    let mut export_path = None;
    if !cli.no_export {
        let path = output_dir.join(&cli.output_file);
        fusion.export_mesh(&path)?;
        export_path = Some(path);
    }

    if cli.dump_blocks {
        info!("dumping {} blocks", fusion.volume().num_blocks());
        fusion.dump_all_blocks(&output_dir)?;
    }

    let triangles: usize = fusion
        .volume()
        .all_ids()
        .iter()
        .filter_map(|&id| fusion.volume().mesh(id))
        .map(|mesh| mesh.num_triangles())
        .sum();

    let results = ResultsJson {
        status: "success".to_string(),
        dataset: cli.dataset.display().to_string(),
        dataset_type: dataset_type.as_str().to_string(),
        frames,
        blocks: fusion.volume().num_blocks(),
        triangles,
        processing_time_ms: start.elapsed().as_millis(),
        output: export_path.as_ref().map(|p| p.display().to_string()),
    };
    write_results(&results, &output_dir);

    info!(
        "done: {} frames, {} blocks, {} triangles in {} ms",
        results.frames, results.blocks, results.triangles, results.processing_time_ms
    );
    Ok(())
}

fn ensure_output_dir(output: &Path) -> Result<PathBuf, CliError> {
    if output.exists() {
        if output.is_dir() {
            return Ok(output.to_path_buf());
        }
        return Err(CliError::OutputNotDirectory(output.to_path_buf()));
    }
    fs::create_dir_all(output).map_err(|source| CliError::OutputCreate {
        path: output.to_path_buf(),
        source,
    })?;
    Ok(output.to_path_buf())
}

fn write_results(results: &ResultsJson, output_dir: &Path) {
    let path = output_dir.join("results.json");
    match serde_json::to_string_pretty(results) {
        Ok(payload) => {
            if let Err(err) = fs::write(&path, payload) {
                error!("failed to write {}: {}", path.display(), err);
            }
        }
        Err(err) => error!("failed to serialize results: {}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_spec_surface() {
        let args = CliArgs::parse_from([
            "rustfusion",
            "--dataset",
            "/data/fr1",
            "--datasetType",
            "icl1",
            "--voxelRes",
            "0.02",
            "--tau",
            "0.05",
            "--useOPC",
            "--updateMesh",
            "--dumpBlocks",
            "--noExport",
            "--outputDir",
            "/tmp/out",
            "--outputFile",
            "scene.ply",
        ]);
        assert_eq!(args.dataset_type, "icl1");
        assert!(args.use_opc && args.update_mesh && args.dump_blocks && args.no_export);
        assert!((args.voxel_res - 0.02).abs() < 1e-6);
        assert_eq!(args.output_file, "scene.ply");
    }

    #[test]
    fn test_unknown_dataset_tag_fails_configuration() {
        let args = CliArgs::parse_from(["rustfusion", "--dataset", "/tmp", "--datasetType", "kitti"]);
        let err = run_pipeline(&args, Instant::now()).unwrap_err();
        assert!(matches!(err, CliError::Config(ConfigError::UnknownDataset(_))));
        assert_eq!(err.tag(), "ConfigurationError");
    }

    #[test]
    fn test_invalid_resolution_fails_configuration() {
        let args = CliArgs::parse_from(["rustfusion", "--dataset", "/tmp", "--voxelRes=-1.0"]);
        let err = run_pipeline(&args, Instant::now()).unwrap_err();
        assert!(matches!(err, CliError::Config(_)));
    }
}
