//! Command-line front end for the Langmuir simulation engine. Per spec.md
//! §1, this binary is an external collaborator: it owns argument parsing,
//! turning an input/checkpoint file into a `Parameters`/`Simulation` call,
//! and wiring in the optional GPU backend. `langmuir-core` never sees a
//! file path or a `clap` type. Grounded on the teacher's `crates/cli`
//! (`clap::Parser`, a single binary, `anyhow` for the top-level error
//! surface, `tracing-subscriber` for env-filtered logging).

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use langmuir_core::{CoulombBackend, CpuBackend, Parameters, Simulation};

/// Markers that only appear in a full checkpoint (spec.md §6's eight
/// section grammar), never in a bare `[Parameters]`-only input file.
const CHECKPOINT_MARKERS: [&str; 3] = ["[Electrons]", "[Holes]", "[RandomState]"];

#[derive(Parser, Debug)]
#[command(
    name = "langmuir",
    about = "Kinetic Monte Carlo carrier transport simulator for cubic-lattice semiconductor devices",
    version
)]
struct Cli {
    /// Path to a fresh-run parameters file or a saved checkpoint (spec.md §6).
    input: PathBuf,

    /// Worker thread count for the per-tick parallel carrier map (spec.md
    /// §5). Defaults to `$PBS_NODEFILE`'s line count, falling back to the
    /// host core count; an explicit value here always wins.
    #[arg(short = 'c', long = "cores")]
    cores: Option<usize>,

    /// GPU adapter index for the Coulomb batch kernel (spec.md §4.6).
    /// Defaults to `$PBS_GPUFILE`'s first entry, falling back to no GPU
    /// selection; an explicit value here always wins.
    #[arg(short = 'g', long = "gpu")]
    gpu: Option<usize>,

    /// Write a checkpoint here once the run completes.
    #[arg(long = "checkpoint")]
    checkpoint: Option<PathBuf>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("langmuir: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let cores = cli.cores.unwrap_or_else(default_core_count);
    rayon::ThreadPoolBuilder::new()
        .num_threads(cores)
        .build_global()
        .context("failed to install the worker thread pool")?;
    tracing::info!(cores, "worker thread pool installed");

    let gpu_index = cli.gpu.or_else(default_gpu_index);

    let text = fs::read_to_string(&cli.input)
        .with_context(|| format!("reading input file {}", cli.input.display()))?;

    let params_preview = Parameters::parse(&extract_parameters_body(&text))
        .with_context(|| format!("parsing parameters from {}", cli.input.display()))?;

    let gpu_requested = params_preview.use_opencl || cli.gpu.is_some();
    let backend = select_backend(gpu_requested, gpu_index, params_preview.use_opencl)?;

    let is_checkpoint = CHECKPOINT_MARKERS.iter().all(|marker| text.contains(marker));
    let mut sim = if is_checkpoint {
        Simulation::resume_with_backend(&cli.input, backend)
            .with_context(|| format!("resuming checkpoint {}", cli.input.display()))?
    } else {
        Simulation::with_backend(params_preview, backend)
            .with_context(|| format!("building simulation from {}", cli.input.display()))?
    };

    sim.run_to_completion().context("running simulation to completion")?;

    if let Some(path) = cli.checkpoint {
        sim.checkpoint(&path).with_context(|| format!("writing checkpoint {}", path.display()))?;
        tracing::info!(path = %path.display(), "checkpoint written");
    }

    Ok(())
}

/// Choose the Coulomb backend. `use_opencl_configured` is `Parameters::
/// use_opencl`, the source of truth for whether GPU failure should be
/// fatal; `gpu_requested` additionally covers an explicit `--gpu` flag with
/// `use.opencl=false` left in the file, which spec.md §7 treats as a
/// non-fatal attempt ("GPU init failure... falls back silently to CPU"
/// only applies when the config itself didn't ask for GPU).
fn select_backend(
    gpu_requested: bool,
    gpu_index: Option<usize>,
    use_opencl_configured: bool,
) -> Result<Box<dyn CoulombBackend>> {
    if !gpu_requested {
        return Ok(Box::new(CpuBackend));
    }

    #[cfg(feature = "gpu")]
    {
        match langmuir_gpu::WgpuBackend::new(gpu_index) {
            Ok(backend) => {
                tracing::info!(adapter = backend.adapter_name(), "GPU Coulomb backend initialized");
                Ok(Box::new(backend))
            }
            Err(err) if use_opencl_configured => {
                bail!("GPU initialization failed (use.opencl=true): {err}")
            }
            Err(err) => {
                tracing::warn!(%err, "GPU requested via --gpu but initialization failed; using CPU path");
                Ok(Box::new(CpuBackend))
            }
        }
    }
    #[cfg(not(feature = "gpu"))]
    {
        if use_opencl_configured {
            bail!("use.opencl=true but this binary was built without the `gpu` feature");
        }
        tracing::warn!("--gpu given but this binary was built without the `gpu` feature; using CPU path");
        Ok(Box::new(CpuBackend))
    }
}

/// `$PBS_NODEFILE` lists one allocated slot per non-empty line (spec.md
/// §6 "Environment"); its line count is the default core count when
/// `--cores` is absent. Falls back to the host core count when the
/// variable is unset or the file can't be read, matching
/// `original_source/nodefileparser.cpp`'s `setDefault()` fallback.
fn default_core_count() -> usize {
    std::env::var_os("PBS_NODEFILE")
        .map(PathBuf::from)
        .and_then(|path| fs::read_to_string(path).ok())
        .map(|text| text.lines().filter(|l| !l.trim().is_empty()).count())
        .filter(|&n| n > 0)
        .unwrap_or_else(num_cpus::get)
}

/// `$PBS_GPUFILE` lists one GPU index (optionally `host:index`) per line;
/// the first entry is the default `--gpu` value. Absent the variable, no
/// default is chosen and the run stays on the CPU path unless `--gpu` or
/// `use.opencl=true` is given explicitly.
fn default_gpu_index() -> Option<usize> {
    let path = std::env::var_os("PBS_GPUFILE")?;
    let text = fs::read_to_string(PathBuf::from(path)).ok()?;
    let first_line = text.lines().find(|l| !l.trim().is_empty())?;
    let token = first_line.rsplit(':').next().unwrap_or(first_line);
    token.trim().parse().ok()
}

/// Pull the `[Parameters]` section body out of an input or checkpoint
/// file's text, or treat the whole file as the body when it has no
/// section headers at all (the minimal fresh-run form). `Parameters::
/// parse` itself only understands a bare `key = value` stream, not the
/// bracketed section grammar of spec.md §6, stripping headers is the
/// CLI's job as the file format's owner.
fn extract_parameters_body(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    match lines.iter().position(|l| l.trim() == "[Parameters]") {
        Some(idx) => lines[idx + 1..]
            .iter()
            .take_while(|l| !is_section_header(l))
            .copied()
            .collect::<Vec<_>>()
            .join("\n"),
        None => text.to_string(),
    }
}

fn is_section_header(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('[') && trimmed.ends_with(']')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_parameters_body_from_bare_file() {
        let text = "grid.x = 4\ngrid.y = 4\n";
        assert_eq!(extract_parameters_body(text), text);
    }

    #[test]
    fn extract_parameters_body_from_sectioned_checkpoint() {
        let text = "[Parameters]\ngrid.x = 4\ngrid.y = 4\n\n[Electrons]\n0\n\n[Holes]\n0\n";
        let body = extract_parameters_body(text);
        assert!(body.contains("grid.x = 4"));
        assert!(!body.contains("[Electrons]"));
    }

    #[test]
    fn cpu_backend_selected_when_gpu_not_requested() {
        let backend = select_backend(false, None, false).unwrap();
        let grid = langmuir_core::Grid::new(2, 1, 1);
        let tables = langmuir_core::PrecomputedTables::build(2, 3.5, 1e-9, 300.0, None, 1);
        let out = backend.coulomb_batch(&grid, &tables, &[], &[], &[], false).unwrap();
        assert!(out.is_empty());
    }

    #[cfg(not(feature = "gpu"))]
    #[test]
    fn gpu_configured_without_feature_is_fatal() {
        assert!(select_backend(true, None, true).is_err());
    }
}
