use clap::Parser;
use detgather::comm::{FileStore, ThreadGroup};
use detgather::config::{JobConfig, Launcher};
use detgather::detection::{ClassLabels, Detector, ImageDetections, ImageInfo, Manifest, ManifestDetector};
use detgather::{report, run_distributed, run_single, CollectOptions, Communicator, GatherError};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "detgather")]
#[command(about = "Run a detector over a dataset and collect the per-worker results", long_about = None)]
struct Cli {
    /// Dataset manifest (JSON) with image metadata and recorded detections
    manifest: PathBuf,
    /// Class labels stored with the checkpoint (JSON array or one per line)
    #[arg(long)]
    classes: Option<PathBuf>,
    /// Where to dump the collected results; must end in .bin
    #[arg(long)]
    out: Option<PathBuf>,
    /// Use this rendezvous directory instead of negotiating one
    #[arg(long)]
    tmpdir: Option<PathBuf>,
    #[arg(long, value_enum, default_value = "none")]
    launcher: Launcher,
    /// Worker threads for the local launcher
    #[arg(long, default_value_t = 2)]
    workers: usize,
    /// Shared directory for the env launcher
    #[arg(long)]
    store_dir: Option<PathBuf>,
    /// Give up on the barrier after this many seconds (default: wait forever)
    #[arg(long)]
    barrier_timeout_secs: Option<u64>,
    /// Pad shards to equal length like a distributed sampler
    #[arg(long)]
    pad: bool,
    /// Drop boxes scoring below this
    #[arg(long, default_value_t = 0.05)]
    thres: f32,
    /// Keep at most this many boxes per image
    #[arg(long, default_value_t = 100)]
    max_per_img: usize,
    /// Sort table rows by score within each image
    #[arg(long)]
    rank_by_score: bool,
}

fn job_config(cli: &Cli) -> Result<JobConfig, GatherError> {
    let mut config = JobConfig::new(cli.launcher);
    config.store_dir = cli.store_dir.clone();
    config.tmpdir = cli.tmpdir.clone();
    config.barrier_timeout = cli.barrier_timeout_secs.map(Duration::from_secs);
    config.padded = cli.pad;
    config.out = cli.out.clone();
    if cli.launcher == Launcher::Local {
        config.world_size = cli.workers;
    }
    let config = config.with_env()?;
    config.validate()?;
    Ok(config)
}

fn run_local(
    config: &JobConfig,
    infos: &[ImageInfo],
    detector: &ManifestDetector,
    options: &CollectOptions,
) -> Result<Option<Vec<ImageDetections>>, GatherError> {
    let members = ThreadGroup::with_timeout(config.world_size, config.barrier_timeout)?;
    let padded = config.padded;
    thread::scope(|scope| {
        let handles: Vec<_> = members
            .into_iter()
            .map(|member| {
                let mut detector = detector.clone();
                scope.spawn(move || {
                    let mut compute = |image: &ImageInfo| detector.detect(image);
                    run_distributed(&member, infos, &mut compute, padded, options)
                })
            })
            .collect();

        let mut merged = None;
        for handle in handles {
            let result = handle
                .join()
                .map_err(|_| GatherError::Other("worker thread panicked".to_string()))??;
            if result.is_some() {
                merged = result;
            }
        }
        Ok(merged)
    })
}

fn main() -> Result<(), GatherError> {
    detgather::init_tracing();
    let cli = Cli::parse();
    let config = job_config(&cli)?;

    let manifest = Manifest::load(&cli.manifest)?;
    let checkpoint_labels = match &cli.classes {
        Some(path) => Some(ClassLabels::load(path)?.iter().map(str::to_string).collect()),
        None => None,
    };
    let labels = ClassLabels::resolve(checkpoint_labels, manifest.classes.clone());
    let infos = manifest.image_infos();
    let detector = ManifestDetector::new(&manifest)
        .with_score_threshold(cli.thres)
        .with_max_per_image(Some(cli.max_per_img));
    let options = config.collect_options();

    info!(
        images = infos.len(),
        classes = labels.len(),
        launcher = ?config.launcher,
        world_size = config.world_size,
        "starting"
    );

    let (rank, outputs) = match config.launcher {
        Launcher::None => {
            let mut detector = detector;
            let mut compute = |image: &ImageInfo| detector.detect(image);
            (0, Some(run_single(&infos, &mut compute)?))
        }
        Launcher::Env => {
            let store_dir = config
                .store_dir
                .clone()
                .ok_or_else(|| GatherError::Config("missing store directory".to_string()))?;
            let comm = FileStore::new(store_dir, config.rank, config.world_size)?
                .with_timeout(config.barrier_timeout);
            let mut detector = detector;
            let mut compute = |image: &ImageInfo| detector.detect(image);
            let outputs = run_distributed(&comm, &infos, &mut compute, config.padded, &options)?;
            (comm.rank(), outputs)
        }
        Launcher::Local => (0, run_local(&config, &infos, &detector, &options)?),
    };

    let Some(outputs) = outputs else {
        info!(rank, "results handed to rank 0");
        return Ok(());
    };

    info!(results = outputs.len(), "collected");
    if let Some(out) = &config.out {
        info!(path = %out.display(), "writing results");
        report::dump_results(out, &outputs)?;

        let mut rows = report::detection_rows(&outputs, &infos, &labels)?;
        if cli.rank_by_score {
            report::rank_rows(&mut rows);
        }
        let csv = report::csv_path_for(out);
        report::write_csv(&csv, &rows)?;
        info!(path = %csv.display(), rows = rows.len(), "wrote detection table");
    }

    Ok(())
}
