#![warn(missing_docs)]
//! Engine compiler seam.
//!
//! The detector graph is handed to a [`Backend`] once assembly succeeds.
//! A backend owns everything downstream of the graph: kernel selection,
//! per-layer precision and the serialized artifact. The only knobs the
//! build passes along are collected in [`BackendOptions`].

use std::fmt::{self, Debug};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use yolo_ir::ComputeGraph;

/// Numeric precision requested for the whole engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    /// 32-bit floating point.
    #[default]
    Full,
    /// 16-bit floating point where the target supports it.
    Reduced,
}

impl Precision {
    /// Short tag used in artifact metadata.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Full => "fp32",
            Self::Reduced => "fp16",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" | "fp32" | "f32" => Ok(Self::Full),
            "reduced" | "fp16" | "f16" | "half" => Ok(Self::Reduced),
            other => Err(format!("unknown precision '{other}' (use full/fp32 or reduced/fp16)")),
        }
    }
}

/// Turns a finished detector graph into a deployable artifact.
pub trait Backend: Debug + Send + Sync {
    /// Display name, used in logs.
    fn name(&self) -> &str;

    /// Identifiers accepted by `--target`.
    fn targets(&self) -> &[&str];

    /// Compile `graph`. The graph is borrowed; the caller releases it (and
    /// every derived buffer it owns) once this returns, whatever the outcome.
    fn compile(&self, graph: &ComputeGraph, opts: &BackendOptions) -> Result<BackendOutput, BackendError>;
}

/// Build-wide settings forwarded to the engine compiler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendOptions {
    /// Precision switch.
    pub precision: Precision,
    /// Largest batch the engine accepts.
    pub max_batch_size: u32,
    /// Scratch memory the compiler may use, in bytes.
    pub workspace_bytes: u64,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            precision: Precision::Full,
            max_batch_size: 1,
            workspace_bytes: 16 << 20,
        }
    }
}

impl fmt::Display for BackendOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, batch {}, workspace {} MiB",
            self.precision,
            self.max_batch_size,
            self.workspace_bytes >> 20
        )
    }
}

/// What a backend produced: artifacts plus anything worth telling the user.
#[derive(Clone, Debug)]
pub struct BackendOutput {
    /// Artifacts, primary one first.
    pub files: Vec<OutputFile>,
    /// Non-fatal notes.
    pub diagnostics: Vec<Diagnostic>,
}

impl BackendOutput {
    /// A single artifact and no diagnostics.
    pub fn single(name: impl Into<String>, content: OutputContent) -> Self {
        Self {
            files: vec![OutputFile {
                name: name.into(),
                content,
            }],
            diagnostics: Vec::new(),
        }
    }

    /// Combined size of all artifacts.
    pub fn total_bytes(&self) -> usize {
        self.files.iter().map(|f| f.bytes().len()).sum()
    }
}

impl fmt::Display for BackendOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.files.iter().map(|f| f.name.as_str()).collect();
        write!(f, "[{}] ({} bytes)", names.join(", "), self.total_bytes())
    }
}

/// One artifact.
#[derive(Clone, Debug)]
pub struct OutputFile {
    /// Suggested file name.
    pub name: String,
    /// Payload.
    pub content: OutputContent,
}

impl OutputFile {
    /// Raw bytes of the payload, whatever its kind.
    pub fn bytes(&self) -> &[u8] {
        match &self.content {
            OutputContent::Text(s) => s.as_bytes(),
            OutputContent::Binary(b) => b,
        }
    }

    /// Whether the payload may be printed to a terminal.
    pub fn is_text(&self) -> bool {
        matches!(self.content, OutputContent::Text(_))
    }
}

/// Artifact payload.
#[derive(Clone, Debug)]
pub enum OutputContent {
    /// UTF-8 text.
    Text(String),
    /// Serialized binary, e.g. a protobuf model.
    Binary(Vec<u8>),
}

/// A non-fatal message from a backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    /// Severity.
    pub level: DiagnosticLevel,
    /// Text shown to the user.
    pub message: String,
}

impl Diagnostic {
    /// An informational note.
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Info,
            message: message.into(),
        }
    }

    /// Something the user should look at; the artifact is still produced.
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warning,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagnosticLevel::Warning => "warning",
            DiagnosticLevel::Info => "info",
        };
        write!(f, "{level}: {}", self.message)
    }
}

/// Diagnostic severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiagnosticLevel {
    /// Worth attention.
    Warning,
    /// Informational.
    Info,
}

/// Engine compilation failure.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The graph or options ask for something this backend cannot do.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// The graph breaks a structural rule of the target format.
    #[error("invalid graph: {0}")]
    InvalidGraph(String),
    /// Anything else.
    #[error("{0}")]
    Other(String),
}

/// Backends known to the command line, looked up by target identifier.
#[derive(Default)]
pub struct BackendRegistry {
    backends: Vec<Box<dyn Backend>>,
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the backends defined in this crate.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register(Box::new(GraphDumpBackend));
        reg
    }

    /// Add a backend. Earlier registrations win on duplicate targets.
    pub fn register(&mut self, backend: Box<dyn Backend>) {
        self.backends.push(backend);
    }

    /// The backend handling `target`, if any.
    pub fn find(&self, target: &str) -> Option<&dyn Backend> {
        self.backends
            .iter()
            .find(|b| b.targets().contains(&target))
            .map(|b| &**b)
    }

    /// Like [`find`](Self::find), but the error names the known targets.
    pub fn resolve(&self, target: &str) -> Result<&dyn Backend, BackendError> {
        self.find(target).ok_or_else(|| {
            BackendError::Unsupported(format!(
                "target '{target}' (available: {})",
                self.list_targets().join(", ")
            ))
        })
    }

    /// Every registered target identifier.
    pub fn list_targets(&self) -> Vec<&str> {
        self.backends
            .iter()
            .flat_map(|b| b.targets().iter().copied())
            .collect()
    }
}

/// Writes the graph as text via [`yolo_ir::dump_graph`], for inspection.
#[derive(Debug)]
pub struct GraphDumpBackend;

impl Backend for GraphDumpBackend {
    fn name(&self) -> &str {
        "graph dump"
    }

    fn targets(&self) -> &[&str] {
        &["graph-dump", "graph"]
    }

    fn compile(&self, graph: &ComputeGraph, opts: &BackendOptions) -> Result<BackendOutput, BackendError> {
        let text = format!("# {opts}\n{}", yolo_ir::dump_graph(graph));
        Ok(BackendOutput::single("graph.txt", OutputContent::Text(text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Stub(&'static [&'static str]);

    impl Backend for Stub {
        fn name(&self) -> &str {
            "stub"
        }
        fn targets(&self) -> &[&str] {
            self.0
        }
        fn compile(&self, _: &ComputeGraph, _: &BackendOptions) -> Result<BackendOutput, BackendError> {
            Ok(BackendOutput::single("stub.bin", OutputContent::Binary(vec![1, 2, 3])))
        }
    }

    #[test]
    fn graph_dump_writes_options_header() {
        let output = GraphDumpBackend
            .compile(&ComputeGraph::default(), &BackendOptions::default())
            .unwrap();
        assert_eq!(output.files[0].name, "graph.txt");
        assert!(output.files[0].is_text());
        let text = std::str::from_utf8(output.files[0].bytes()).unwrap();
        assert!(text.starts_with("# fp32, batch 1, workspace 16 MiB\n"));
        assert!(text.contains("Nodes: 0"));
    }

    #[test]
    fn registry_dispatch() {
        let mut reg = BackendRegistry::with_builtins();
        reg.register(Box::new(Stub(&["engine", "graph"])));
        assert_eq!(reg.list_targets(), ["graph-dump", "graph", "engine", "graph"]);
        assert_eq!(reg.find("engine").unwrap().name(), "stub");
        // First registration wins.
        assert_eq!(reg.find("graph").unwrap().name(), "graph dump");

        let err = reg.resolve("tensorrt").unwrap_err();
        assert_eq!(
            err.to_string(),
            "unsupported: target 'tensorrt' (available: graph-dump, graph, engine, graph)"
        );
        assert!(BackendRegistry::new().list_targets().is_empty());
    }

    #[test]
    fn output_sizes_and_display() {
        let mut output = Stub(&["x"])
            .compile(&ComputeGraph::default(), &BackendOptions::default())
            .unwrap();
        output.files.push(OutputFile {
            name: "notes.txt".into(),
            content: OutputContent::Text("ok".into()),
        });
        assert_eq!(output.total_bytes(), 5);
        assert_eq!(output.to_string(), "[stub.bin, notes.txt] (5 bytes)");
        assert!(!output.files[0].is_text());
    }

    #[test]
    fn precision_parsing() {
        assert_eq!("fp16".parse::<Precision>(), Ok(Precision::Reduced));
        assert_eq!(" Full ".parse::<Precision>(), Ok(Precision::Full));
        assert!("int8".parse::<Precision>().is_err());
        assert_eq!(Precision::Reduced.to_string(), "fp16");
    }

    #[test]
    fn precision_serde_names() {
        assert_eq!(serde_json::to_string(&Precision::Reduced).unwrap(), "\"reduced\"");
        let p: Precision = serde_json::from_str("\"full\"").unwrap();
        assert_eq!(p, Precision::Full);
    }

    #[test]
    fn diagnostics_display() {
        assert_eq!(Diagnostic::info("done").to_string(), "info: done");
        let w = Diagnostic::warning("fp16 requested");
        assert_eq!(w.level, DiagnosticLevel::Warning);
        assert_eq!(w.to_string(), "warning: fp16 requested");
    }

    #[test]
    fn options_display() {
        let opts = BackendOptions {
            precision: Precision::Reduced,
            max_batch_size: 1,
            workspace_bytes: 64 << 20,
        };
        assert_eq!(opts.to_string(), "fp16, batch 1, workspace 64 MiB");
    }
}
