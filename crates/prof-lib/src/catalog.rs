//! Closed sets of tags understood by the profiling worker
//!
//! Every tag round-trips through its string form, which is what the worker
//! receives on its command line. The compatibility tables at the bottom drive
//! default selection and validation of tool/output combinations.

use crate::error::ProfError;
use std::fmt;
use std::str::FromStr;

macro_rules! tag_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $what:literal {
            $($variant:ident => $tag:literal $(| $alias:literal)*),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $tag),+
                }
            }

            /// Comma separated list of accepted tags, for error messages
            pub fn available() -> String {
                Self::ALL
                    .iter()
                    .map(|v| v.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ProfError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($tag $(| $alias)* => Ok($name::$variant),)+
                    other => Err(ProfError::invalid(format!(
                        "unsupported {} {:?}, choose one of: {}",
                        $what,
                        other,
                        Self::available()
                    ))),
                }
            }
        }
    };
}

tag_enum! {
    /// Programming language of the target process
    Language, "language" {
        Java => "java",
        Go => "go",
        Python => "python",
        Ruby => "ruby",
        Node => "node",
        Clang => "clang",
        ClangPlusPlus => "clang++" | "c++",
        Rust => "rust",
    }
}

tag_enum! {
    ProfilingTool, "profiling tool" {
        AsyncProfiler => "async-profiler",
        Jcmd => "jcmd",
        Pyspy => "pyspy",
        Bpf => "bpf",
        Btf => "btf",
        Perf => "perf",
        Rbspy => "rbspy",
        NodeDummy => "node-dummy",
        CargoFlamegraph => "cargo-flamegraph",
    }
}

tag_enum! {
    /// Kind of artifact the worker produces
    OutputType, "output type" {
        Flamegraph => "flamegraph",
        Speedscope => "speedscope",
        Jfr => "jfr",
        ThreadDump => "threaddump",
        HeapDump => "heapdump",
        HeapHistogram => "heaphistogram",
        Flat => "flat",
        Traces => "traces",
        Collapsed => "collapsed",
        Tree => "tree",
        Callgrind => "callgrind",
        Raw => "raw",
        Pprof => "pprof",
        Summary => "summary",
        SummaryByLine => "summary-by-line",
        HeapSnapshot => "heapsnapshot",
    }
}

tag_enum! {
    /// What the sampler listens to
    ProfilingEvent, "event" {
        Cpu => "cpu",
        Alloc => "alloc",
        Lock => "lock",
        CacheMisses => "cache-misses",
        Wall => "wall",
        Itimer => "itimer",
        Ctimer => "ctimer",
    }
}

tag_enum! {
    ContainerRuntime, "container runtime" {
        Containerd => "containerd",
        Crio => "crio",
        Docker => "docker",
        Fake => "fake",
    }
}

tag_enum! {
    /// Log level forwarded to the worker
    LogLevel, "log level" {
        Info => "info",
        Warn => "warn",
        Debug => "debug",
        Trace => "trace",
        Error => "error",
        Panic => "panic",
    }
}

tag_enum! {
    /// Compression applied by the worker to produced files
    Compressor, "compressor" {
        None => "none",
        Snappy => "snappy",
        Gzip => "gzip",
        Zstd => "zstd",
    }
}

tag_enum! {
    ImagePullPolicy, "image pull policy" {
        Always => "Always",
        IfNotPresent => "IfNotPresent",
        Never => "Never",
    }
}

impl Default for ProfilingEvent {
    fn default() -> Self {
        Self::Itimer
    }
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::Containerd
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::Gzip
    }
}

impl Default for ImagePullPolicy {
    fn default() -> Self {
        Self::IfNotPresent
    }
}

impl ContainerRuntime {
    /// Host directory holding the runtime's container filesystems
    pub fn default_root_path(&self) -> &'static str {
        match self {
            Self::Containerd => "/run/containerd",
            Self::Crio => "/var/lib/containers/storage",
            Self::Docker => "/var/lib/docker",
            Self::Fake => "/tmp/fake-runtime",
        }
    }
}

impl Compressor {
    /// Suffix the worker appends to compressed files
    pub fn extension(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Snappy => ".snappy",
            Self::Gzip => ".gz",
            Self::Zstd => ".zst",
        }
    }
}

impl OutputType {
    /// Heap artifacts are large enough that the worker splits them in chunks
    pub fn is_heap_artifact(&self) -> bool {
        matches!(self, Self::HeapDump | Self::HeapSnapshot)
    }
}

impl Language {
    /// Form used inside Kubernetes object names
    pub fn dns_label(&self) -> &'static str {
        match self {
            Self::ClangPlusPlus => "clangpp",
            other => other.as_str(),
        }
    }

    /// Tools able to profile this language, default first
    pub fn tools(&self) -> &'static [ProfilingTool] {
        use ProfilingTool::*;
        match self {
            Self::Java => &[Jcmd, AsyncProfiler],
            Self::Python => &[Pyspy],
            Self::Ruby => &[Rbspy],
            Self::Go | Self::Clang | Self::ClangPlusPlus => &[Bpf, Btf, Perf],
            Self::Node => &[Bpf, Btf, Perf, NodeDummy],
            Self::Rust => &[CargoFlamegraph, Bpf, Btf, Perf],
        }
    }

    /// Tool picked when the user did not ask for one
    pub fn default_tool(&self, output: Option<OutputType>) -> ProfilingTool {
        use OutputType::*;
        match (self, output) {
            (Self::Java, Some(Jfr | ThreadDump | HeapDump | HeapHistogram)) => ProfilingTool::Jcmd,
            (Self::Java, Some(Flamegraph | Flat | Traces | Collapsed | Tree | Raw)) => {
                ProfilingTool::AsyncProfiler
            }
            (Self::Node, Some(HeapSnapshot | HeapDump)) => ProfilingTool::NodeDummy,
            (Self::Node, Some(Flamegraph | Raw)) => ProfilingTool::Bpf,
            (lang, _) => lang.tools()[0],
        }
    }

    pub fn supports(&self, tool: ProfilingTool) -> bool {
        self.tools().contains(&tool)
    }
}

impl ProfilingTool {
    /// Output types this tool can produce, default first
    pub fn outputs(&self) -> &'static [OutputType] {
        use OutputType::*;
        match self {
            Self::AsyncProfiler => &[Flamegraph, Jfr, Flat, Traces, Collapsed, Tree, Raw],
            Self::Jcmd => &[Jfr, ThreadDump, HeapDump, HeapHistogram],
            Self::Pyspy => &[Flamegraph, Speedscope, ThreadDump, Raw],
            Self::Bpf | Self::Btf | Self::Perf => &[Flamegraph, Raw],
            Self::Rbspy => &[Flamegraph, Speedscope, Callgrind, Summary, SummaryByLine],
            Self::NodeDummy => &[HeapSnapshot, HeapDump],
            Self::CargoFlamegraph => &[Flamegraph],
        }
    }

    pub fn default_output(&self) -> OutputType {
        self.outputs()[0]
    }

    pub fn supports(&self, output: OutputType) -> bool {
        self.outputs().contains(&output)
    }
}

/// Outcome of resolving a tool/output pair against the compatibility tables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub tool: ProfilingTool,
    pub output: OutputType,
    /// Human readable notes about substitutions that were made
    pub notices: Vec<String>,
}

/// Pick the tool and output to run for `language`.
///
/// Incompatible requests fall back to the defaults and leave a notice instead
/// of failing.
pub fn select(
    language: Language,
    tool: Option<ProfilingTool>,
    output: Option<OutputType>,
) -> Selection {
    let mut notices = Vec::new();

    let tool = match tool {
        Some(t) if language.supports(t) => t,
        Some(t) => {
            let fallback = language.default_tool(output);
            notices.push(format!(
                "Unsupported profiling tool {t} for language {language}, default profiling tool {fallback} will be used"
            ));
            fallback
        }
        None => language.default_tool(output),
    };

    let output = match output {
        Some(o) if tool.supports(o) => o,
        Some(o) => {
            let fallback = tool.default_output();
            notices.push(format!(
                "Unsupported output type {o} for profiling tool {tool}, default output type {fallback} will be used"
            ));
            fallback
        }
        None => tool.default_output(),
    };

    Selection {
        tool,
        output,
        notices,
    }
}
