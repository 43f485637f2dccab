use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use log::LevelFilter;
use miette::{Context, IntoDiagnostic};

use yolo_backend_core::{BackendRegistry, Precision};
use yolo_net::{BuildConfig, assemble_and_release, compile_network, yolov4};
use yolo_weights::WeightRepository;

/// yolo-build: assemble a YOLOv4 detector from a .wts file and compile it
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Weight file (.wts)
    #[arg(short, long, required_unless_present_any = ["list_weights", "write_config"])]
    weights: Option<PathBuf>,

    /// Build configuration (JSON); defaults to the 608x608, 5-class detector
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Target backend
    #[arg(short, long, default_value = "onnx")]
    target: String,

    /// Output path (default: stdout for text targets)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Precision: full (fp32) or reduced (fp16); overrides the config
    #[arg(long)]
    precision: Option<Precision>,

    /// Number of object classes; overrides the config
    #[arg(long)]
    num_classes: Option<u32>,

    /// Dump the assembled graph to stderr before compilation
    #[arg(long)]
    emit_graph: bool,

    /// Assemble and validate without producing output
    #[arg(long)]
    dry_run: bool,

    /// Print every required weight key with its element count, then exit
    #[arg(long)]
    list_weights: bool,

    /// Write the effective configuration as JSON to this path, then exit
    #[arg(long, value_name = "PATH")]
    write_config: Option<PathBuf>,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default.as_str()));
    // A logger installed earlier wins.
    let _ = builder.try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> miette::Result<BuildConfig> {
    let mut config = match &cli.config {
        Some(path) => BuildConfig::load_from_path(path)
            .into_diagnostic()
            .wrap_err("failed to load build configuration")?,
        None => BuildConfig::default(),
    };
    if let Some(precision) = cli.precision {
        config.precision = precision;
    }
    if let Some(classes) = cli.num_classes {
        config.num_classes = classes;
    }
    config
        .validate()
        .into_diagnostic()
        .wrap_err("invalid build configuration")?;
    Ok(config)
}

fn write_file(path: &Path, data: &[u8]) -> miette::Result<()> {
    std::fs::write(path, data)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to write {}", path.display()))
}

fn run(cli: Cli) -> miette::Result<()> {
    // 1. Resolve configuration.
    let config = load_config(&cli)?;

    if let Some(path) = &cli.write_config {
        config
            .save_to_path(path)
            .into_diagnostic()
            .wrap_err("failed to write configuration")?;
        log::info!("wrote configuration to {}", path.display());
        return Ok(());
    }

    if cli.list_weights {
        let manifest = yolov4()
            .weight_manifest(&config)
            .into_diagnostic()
            .wrap_err("failed to compute weight manifest")?;
        for req in &manifest {
            println!("{} {}", req.key, req.len);
        }
        return Ok(());
    }

    // 2. Resolve the backend before the expensive part.
    let mut registry = BackendRegistry::with_builtins();
    registry.register(Box::new(yolo_backend_onnx::OnnxBackend));
    let backend = registry.resolve(&cli.target).into_diagnostic()?;

    // 3. Load weights.
    let Some(weights_path) = &cli.weights else {
        return Err(miette::miette!("--weights is required to build an engine"));
    };
    let weights = WeightRepository::load(weights_path)
        .into_diagnostic()
        .wrap_err("failed to load weights")?;

    // 4. Assemble the graph; the weight map is released right after.
    let graph = assemble_and_release(weights, &config)
        .into_diagnostic()
        .wrap_err("network assembly failed")?;

    if cli.emit_graph {
        eprintln!("{}", yolo_ir::dump_graph(&graph));
    }

    // 5. Dry-run: stop here.
    if cli.dry_run {
        log::info!("dry run: {} nodes assembled, nothing written", graph.node_count());
        return Ok(());
    }

    // 6. Compile; the graph is released inside.
    let output = compile_network(graph, &config, backend)
        .into_diagnostic()
        .wrap_err("engine compilation failed")?;

    // 7. Write output.
    for file in &output.files {
        match &cli.output {
            Some(path) => write_file(path, file.bytes())?,
            None if file.is_text() => print!("{}", String::from_utf8_lossy(file.bytes())),
            None => {
                return Err(miette::miette!(
                    "{} is binary; pass --output to choose where it goes",
                    file.name
                ));
            }
        }
        log::info!("wrote {} ({} bytes)", file.name, file.bytes().len());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn overrides_apply_to_default_config() {
        let cli = Cli::parse_from([
            "yolo-build",
            "--weights",
            "yolov4.wts",
            "--precision",
            "fp16",
            "--num-classes",
            "80",
        ]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.precision, Precision::Reduced);
        assert_eq!(config.head_channels(), 255);
        assert_eq!(cli.target, "onnx");
    }

    #[test]
    fn weights_optional_for_listing() {
        let cli = Cli::try_parse_from(["yolo-build", "--list-weights"]).unwrap();
        assert!(cli.weights.is_none());
        assert!(Cli::try_parse_from(["yolo-build"]).is_err());
    }

    #[test]
    fn invalid_override_is_rejected() {
        let cli = Cli::parse_from(["yolo-build", "-w", "x.wts", "--num-classes", "0"]);
        assert!(load_config(&cli).is_err());
    }

    #[test]
    fn unknown_target_fails_before_loading_weights() {
        let cli = Cli::parse_from(["yolo-build", "-w", "does-not-exist.wts", "-t", "tensorrt"]);
        let err = run(cli).unwrap_err();
        assert!(format!("{err:?}").contains("graph-dump"), "{err:?}");
    }

    #[test]
    fn write_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let cli = Cli::parse_from([
            "yolo-build",
            "--num-classes",
            "3",
            "--write-config",
            path.to_str().unwrap(),
        ]);
        run(cli).unwrap();
        let loaded = BuildConfig::load_from_path(&path).unwrap();
        assert_eq!(loaded.num_classes, 3);
    }
}
