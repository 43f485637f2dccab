//! Assembly of the YOLOv4 detector graph.
//!
//! The network is described declaratively by a [`Blueprint`] and
//! instantiated by a [`TopologyAssembler`] against a [`NamedWeightMap`].
//! Every convolution is followed by batch normalization folded into a
//! per-channel affine transform; three detection heads decode their scale
//! and are merged into a single `[rows, classes + 5]` table.
//!
//! # Example
//!
//! ```no_run
//! use yolo_backend_core::GraphDumpBackend;
//! use yolo_net::{BuildConfig, build_engine};
//! use yolo_weights::WeightRepository;
//!
//! let weights = WeightRepository::load("yolov4.wts")?;
//! let engine = build_engine(weights, &BuildConfig::default(), &GraphDumpBackend)?;
//! println!("{engine}");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::path::Path;

use yolo_backend_core::{Backend, BackendOutput, DiagnosticLevel};
use yolo_ir::ComputeGraph;
use yolo_weights::{NamedWeightMap, WeightRepository};

mod assemble;
pub mod block;
pub mod blueprint;
mod config;
mod error;
mod head;
pub mod norm;

pub use assemble::TopologyAssembler;
pub use blueprint::{Blueprint, LayerOp, NodeSpec, WeightRequirement, yolov4};
pub use config::{AnchorSet, BuildConfig, DetectionHeadConfig, NUM_ANCHORS};
pub use error::BuildError;
pub use head::DetectionHeadBuilder;
pub use norm::FusedAffine;

/// Assemble the YOLOv4 graph from `weights`.
pub fn build_network(weights: &NamedWeightMap, config: &BuildConfig) -> Result<ComputeGraph, BuildError> {
    let blueprint = yolov4();
    TopologyAssembler::new(&blueprint, config).assemble(weights)
}

/// Assemble the network from an owned weight map, releasing the map as
/// soon as the graph exists.
pub fn assemble_and_release(weights: NamedWeightMap, config: &BuildConfig) -> Result<ComputeGraph, BuildError> {
    let graph = build_network(&weights, config)?;
    drop(weights);
    Ok(graph)
}

/// Compile `graph` with `backend`, releasing the graph once the backend
/// returns. Backend diagnostics are logged at their own level.
pub fn compile_network(
    graph: ComputeGraph,
    config: &BuildConfig,
    backend: &dyn Backend,
) -> Result<BackendOutput, BuildError> {
    let opts = config.backend_options();
    log::info!("compiling with {} ({opts})", backend.name());
    let output = backend.compile(&graph, &opts);
    drop(graph);
    let output = output?;
    for diag in &output.diagnostics {
        match diag.level {
            DiagnosticLevel::Warning => log::warn!("{}", diag.message),
            DiagnosticLevel::Info => log::info!("{}", diag.message),
        }
    }
    Ok(output)
}

/// Assemble the network and compile it with `backend`.
///
/// The weight map is consumed: it is released once the graph has been
/// built, and the graph itself once the backend has produced its artifact.
pub fn build_engine(
    weights: NamedWeightMap,
    config: &BuildConfig,
    backend: &dyn Backend,
) -> Result<BackendOutput, BuildError> {
    let graph = assemble_and_release(weights, config)?;
    compile_network(graph, config, backend)
}

/// Load a `.wts` file and build an engine from it.
pub fn build_engine_from_file(
    path: impl AsRef<Path>,
    config: &BuildConfig,
    backend: &dyn Backend,
) -> Result<BackendOutput, BuildError> {
    let weights = WeightRepository::load(path)?;
    build_engine(weights, config, backend)
}
