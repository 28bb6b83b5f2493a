use std::fs;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use rayon::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ec_gcd::{
    sync_times, AnalysisConfig, CapacitanceConfig, DataSet, DetectorConfig, DvdtMethod,
    GcdAnalysis, MassNormalization, MetricsReport,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "GCD cycling analysis CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Segment one or more ECLab exports into cycles and write per-cycle metrics
    Analyze(AnalyzeArgs),
    /// Inspect ECLab exports for available columns and detected regions
    Summary(SummaryArgs),
}

#[derive(Parser, Debug)]
struct AnalyzeArgs {
    /// ECLab .txt/.csv exports to ingest
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "cycles.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Current-region dead band (mA)
    #[arg(long, default_value_t = 0.1)]
    current_threshold: f64,

    /// Minimum current-region length (samples)
    #[arg(long, default_value_t = 5)]
    current_min_length: usize,

    /// Voltage-hold dead band (V)
    #[arg(long, default_value_t = 0.001)]
    hold_threshold: f64,

    /// Minimum voltage-hold length (samples)
    #[arg(long, default_value_t = 25)]
    hold_min_length: usize,

    /// Half-cycle voltage dead band (V)
    #[arg(long, default_value_t = 0.001)]
    half_cycle_threshold: f64,

    /// Minimum half-cycle length (samples)
    #[arg(long, default_value_t = 5)]
    half_cycle_min_length: usize,

    /// Capacitance smoothing/regression window (samples)
    #[arg(long, default_value_t = 10)]
    cap_window: usize,

    /// dV/dt estimator for capacitance
    #[arg(long, value_enum, default_value_t = DvdtOpt::Gradient)]
    dvdt: DvdtOpt,

    /// Mass normalization convention for specific capacitance
    #[arg(long, value_enum, default_value_t = NormalizationOpt::Off)]
    normalization: NormalizationOpt,

    /// Fraction of the discharge tail averaged for gravimetric capacitance
    #[arg(long, default_value_t = 0.2)]
    tail_fraction: f64,

    /// Electrode 1 active mass (g)
    #[arg(long, default_value_t = 0.0)]
    mass1: f64,

    /// Electrode 2 active mass (g)
    #[arg(long, default_value_t = 0.0)]
    mass2: f64,

    /// Bypass the parsed-file cache
    #[arg(long, action = ArgAction::SetTrue)]
    no_cache: bool,

    /// Profile major stages with timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct SummaryArgs {
    /// ECLab .txt/.csv exports to inspect
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Output report path (`-` for stdout)
    #[arg(short, long, default_value = "gcd_summary.txt", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum DvdtOpt {
    Gradient,
    Regression,
}

impl From<DvdtOpt> for DvdtMethod {
    fn from(value: DvdtOpt) -> Self {
        match value {
            DvdtOpt::Gradient => DvdtMethod::SmoothedGradient,
            DvdtOpt::Regression => DvdtMethod::WindowRegression,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum NormalizationOpt {
    Off,
    WholeCell,
    Electrode2,
    Electrode4,
}

impl From<NormalizationOpt> for MassNormalization {
    fn from(value: NormalizationOpt) -> Self {
        match value {
            NormalizationOpt::Off => MassNormalization::Off,
            NormalizationOpt::WholeCell => MassNormalization::WholeCell,
            NormalizationOpt::Electrode2 => MassNormalization::Electrode2,
            NormalizationOpt::Electrode4 => MassNormalization::Electrode4,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = match &cli.command {
        Command::Analyze(args) if args.verbose => "debug",
        Command::Summary(args) if args.verbose => "debug",
        _ => "info",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Analyze(args) => handle_analyze(args),
        Command::Summary(args) => handle_summary(args),
    }
}

fn handle_analyze(args: AnalyzeArgs) -> Result<()> {
    if args.inputs.is_empty() {
        return Err(anyhow!("no input files supplied"));
    }

    let config = AnalysisConfig {
        current: DetectorConfig {
            zero_threshold: args.current_threshold,
            min_region_length: args.current_min_length,
        },
        hold: DetectorConfig {
            zero_threshold: args.hold_threshold,
            min_region_length: args.hold_min_length,
        },
        half_cycle: DetectorConfig {
            zero_threshold: args.half_cycle_threshold,
            min_region_length: args.half_cycle_min_length,
        },
        capacitance: CapacitanceConfig {
            window: args.cap_window,
            dvdt: args.dvdt.into(),
            normalization: args.normalization.into(),
            tail_fraction: args.tail_fraction,
        },
        mass1_g: args.mass1,
        mass2_g: args.mass2,
    };

    let t_parse = Instant::now();
    let mut stores = parse_inputs(&args.inputs, !args.no_cache)?;
    if args.profile || args.verbose {
        info!(
            "Parse stage: {:.1} ms ({} files)",
            t_parse.elapsed().as_secs_f64() * 1000.0,
            stores.len()
        );
    }

    let data = merge_stores(&mut stores)?;
    info!(
        "Loaded {} samples across {} fields",
        data.len(),
        data.field_names().len()
    );

    let t_compute = Instant::now();
    let mut analysis = GcdAnalysis::new(data, config)
        .context("inputs are missing one of the required t/E/I columns")?;
    let summary = analysis.cycles()?.summary;
    info!(
        "Assembled {} cycles (unused: {} charging, {} discharging, {} holds; anomalies: {} multi-charge, {} multi-discharge)",
        summary.cycles_emitted,
        summary.unused_charging,
        summary.unused_discharging,
        summary.unused_holds,
        summary.multiple_charging_steps,
        summary.multiple_discharging_steps,
    );

    let report = analysis.cycle_metrics()?;
    if args.profile || args.verbose {
        info!(
            "Compute stage: {:.1} ms ({} cycles)",
            t_compute.elapsed().as_secs_f64() * 1000.0,
            report.rows.len()
        );
    }
    if !report.degenerate_cycles.is_empty() {
        warn!(
            "{} cycle(s) carried NaN metrics: {:?}",
            report.degenerate_cycles.len(),
            report.degenerate_cycles
        );
    }

    if args.output.as_os_str() == "-" {
        write_metrics_stdout(&report)?;
    } else {
        write_metrics_csv(&report, &args.output)?;
        info!("Wrote cycle metrics CSV: {}", args.output.display());
    }
    Ok(())
}

fn handle_summary(args: SummaryArgs) -> Result<()> {
    let mut report = String::new();
    for path in &args.inputs {
        let data = ec_gcd::read_eclab(path)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        report.push_str(&format!("FILE: {}\n", path.display()));
        report.push_str(&format!("  samples: {}\n", data.len()));
        if let Ok(duration) = data.duration_s() {
            report.push_str(&format!("  duration_s: {:.1}\n", duration));
        }
        if let Some(start) = data.start_time() {
            report.push_str(&format!("  start_time: {}\n", start));
        }
        report.push_str("  columns:\n");
        for name in data.field_names() {
            let series = data.field(name)?;
            let min = series.iter().copied().fold(f64::INFINITY, f64::min);
            let max = series.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            if min.is_finite() && max.is_finite() {
                report.push_str(&format!(
                    "    - {}: min={:.4}, max={:.4}\n",
                    name, min, max
                ));
            } else {
                report.push_str(&format!("    - {}\n", name));
            }
        }

        match GcdAnalysis::new(data, AnalysisConfig::default()) {
            Ok(mut analysis) => {
                let currents = analysis.current_regions()?.len();
                let holds = analysis.voltage_holds()?.len();
                let halves = analysis.half_cycles()?.len();
                let summary = analysis.cycles()?.summary;
                report.push_str(&format!(
                    "  regions: {} current, {} holds, {} half-cycles\n",
                    currents, holds, halves
                ));
                report.push_str(&format!("  cycles: {}\n", summary.cycles_emitted));
            }
            Err(err) => {
                report.push_str(&format!("  not analyzable as GCD: {}\n", err));
            }
        }
        report.push('\n');
    }

    if args.output.as_os_str() == "-" {
        io::stdout().write_all(report.as_bytes())?;
    } else {
        fs::write(&args.output, report)
            .with_context(|| format!("failed to write {}", args.output.display()))?;
        info!("Summary report written: {}", args.output.display());
    }
    Ok(())
}

/// Parse every input, in parallel, through the JSON parse cache.
fn parse_inputs(inputs: &[PathBuf], use_cache: bool) -> Result<Vec<DataSet>> {
    let cache_dir = PathBuf::from(".cache").join("parsed_eclab");
    if use_cache {
        let _ = fs::create_dir_all(&cache_dir);
    }

    let indexed: Vec<(usize, PathBuf)> = inputs.iter().cloned().enumerate().collect();
    let mut stores: Vec<(usize, DataSet)> = indexed
        .par_iter()
        .map(|(file_id, path)| -> Result<(usize, DataSet)> {
            if use_cache {
                if let Ok(key) = cache_key(path) {
                    if let Some(cached) = read_cache(&cache_dir, &key) {
                        return Ok((*file_id, cached));
                    }
                    let parsed = ec_gcd::read_eclab(path)
                        .with_context(|| format!("failed to parse {}", path.display()))?;
                    let _ = write_cache(&cache_dir, &key, &parsed);
                    return Ok((*file_id, parsed));
                }
            }
            let parsed = ec_gcd::read_eclab(path)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((*file_id, parsed))
        })
        .collect::<Result<Vec<_>>>()?;

    stores.sort_by_key(|(id, _)| *id);
    Ok(stores.into_iter().map(|(_, s)| s).collect())
}

/// Sync all stores onto one clock and concatenate them in input order.
fn merge_stores(stores: &mut Vec<DataSet>) -> Result<DataSet> {
    sync_times(stores);
    let mut iter = stores.drain(..);
    let first = iter.next().ok_or_else(|| anyhow!("no parsed inputs"))?;
    let mut combined = first;
    for store in iter {
        combined = combined
            .combine(&store)
            .context("inputs do not share the same column set")?;
    }
    Ok(combined)
}

fn cache_key(path: &Path) -> Result<String> {
    use std::time::SystemTime;
    let meta = fs::metadata(path).with_context(|| format!("failed to stat {}", path.display()))?;
    let size = meta.len();
    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    let dur = modified
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    let mtime = (dur.as_secs(), dur.subsec_nanos());

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    path.to_string_lossy().hash(&mut hasher);
    size.hash(&mut hasher);
    mtime.hash(&mut hasher);
    Ok(format!("{:016x}", hasher.finish()))
}

fn read_cache(dir: &Path, key: &str) -> Option<DataSet> {
    let path = dir.join(format!("{}.json", key));
    let text = fs::read_to_string(&path).ok()?;
    serde_json::from_str(&text).ok()
}

fn write_cache(dir: &Path, key: &str, data: &DataSet) -> Result<()> {
    let path = dir.join(format!("{}.json", key));
    let text = serde_json::to_string(data)?;
    fs::write(&path, text).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn write_metrics_stdout(report: &MetricsReport) -> Result<()> {
    let stdout = io::stdout();
    let handle = stdout.lock();
    let mut writer = csv::Writer::from_writer(handle);
    write_metrics_rows(report, &mut writer)
}

fn write_metrics_csv(report: &MetricsReport, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    write_metrics_rows(report, &mut writer)
}

fn write_metrics_rows<W: Write>(report: &MetricsReport, writer: &mut csv::Writer<W>) -> Result<()> {
    writer.write_record([
        "cycle_index",
        "cycle_time_s",
        "coulombic_efficiency_pct",
        "energy_efficiency_pct",
        "resistance_ohm",
        "gravimetric_capacitance_f_per_g",
    ])?;
    for row in &report.rows {
        writer.write_record([
            row.cycle_index.to_string(),
            format!("{:.3}", row.cycle_time_s),
            format!("{:.3}", row.coulombic_efficiency_pct),
            format!("{:.3}", row.energy_efficiency_pct),
            format!("{:.6}", row.resistance_ohm),
            row.gravimetric_capacitance_f_per_g
                .map(|v| format!("{:.6}", v))
                .unwrap_or_default(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
