//! taintflow — interprocedural taint analysis over indexed program snapshots
//!
//! Reads a program snapshot (symbols, basic blocks, edges, call sites) as
//! JSON, runs the two-phase taint analysis, prints findings and optionally
//! persists them to a SQLite database.
//!
//! Exit codes:
//!   0  analysis ran, no findings at or above the confidence threshold
//!   1  findings reported
//!   2  fatal error (bad input tables, bad config, bad catalog, I/O)

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use taintflow_engine::{
    AnalysisReport, EngineConfig, PatternCatalog, Preset, ProgramSnapshot, TaintEngine,
};
use taintflow_storage::{FindingStore, SqliteFindingStore};

#[derive(Debug, Parser)]
#[command(name = "taintflow", version, about = "Interprocedural taint analysis")]
struct Cli {
    /// Program snapshot JSON (symbols, blocks, edges, call sites)
    snapshot: PathBuf,

    /// Pattern catalog JSON; built-in patterns when omitted
    #[arg(long)]
    patterns: Option<PathBuf>,

    /// Analysis preset: fast, balanced, thorough
    #[arg(long, default_value = "balanced")]
    preset: String,

    /// Override: maximum source-to-sink call depth (1..=7)
    #[arg(long)]
    max_depth: Option<usize>,

    /// Override: confidence threshold for primary findings (0.0..=1.0)
    #[arg(long)]
    confidence_threshold: Option<f32>,

    /// Override: maximum materialized paths
    #[arg(long)]
    max_paths: Option<usize>,

    /// Override: cooperative deadline in seconds (0 disables)
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Output format
    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Persist the report to this SQLite database
    #[arg(long)]
    db: Option<PathBuf>,

    /// Show findings below the confidence threshold too
    #[arg(long)]
    include_low_confidence: bool,

    /// Verbose logging (RUST_LOG overrides)
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(&cli) {
        Ok(report) => {
            if report.is_clean() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: &Cli) -> Result<AnalysisReport, Box<dyn std::error::Error>> {
    let config = build_config(cli)?;
    debug!(?config, "effective configuration");

    let catalog = match &cli.patterns {
        Some(path) => PatternCatalog::from_json_str(&fs::read_to_string(path)?)?,
        None => PatternCatalog::default(),
    };

    let snapshot = ProgramSnapshot::from_json_str(&fs::read_to_string(&cli.snapshot)?)?;
    let engine = TaintEngine::new(snapshot, catalog, config)?;
    let report = engine.run();

    if let Some(db) = &cli.db {
        let store = SqliteFindingStore::open(db)?;
        let run_id = store.save_report(&report)?;
        debug!(run_id, "report persisted to {}", db.display());
    }

    match cli.format {
        Format::Json => print_json(&report, cli.include_low_confidence)?,
        Format::Text => print_text(&report, cli.include_low_confidence),
    }
    Ok(report)
}

fn build_config(cli: &Cli) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let preset: Preset = cli.preset.parse()?;
    let mut config = EngineConfig::from_preset(preset);
    if let Some(v) = cli.max_depth {
        config = config.max_depth(v);
    }
    if let Some(v) = cli.confidence_threshold {
        config = config.confidence_threshold(v);
    }
    if let Some(v) = cli.max_paths {
        config = config.max_paths(v);
    }
    if let Some(v) = cli.timeout_secs {
        config = config.timeout_secs(if v == 0 { None } else { Some(v) });
    }
    Ok(config)
}

fn print_json(
    report: &AnalysisReport,
    include_low_confidence: bool,
) -> Result<(), serde_json::Error> {
    let output = serde_json::json!({
        "findings": report.findings,
        "low_confidence": if include_low_confidence {
            report.low_confidence.clone()
        } else {
            Vec::new()
        },
        "by_category": report
            .by_category()
            .into_iter()
            .map(|(category, count)| (category.as_str().to_string(), count))
            .collect::<std::collections::BTreeMap<_, _>>(),
        "diagnostics": report.diagnostics,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn print_text(report: &AnalysisReport, include_low_confidence: bool) {
    let d = &report.diagnostics;
    println!("Taint Analysis Results");
    println!("──────────────────────");
    println!("Functions analyzed: {}", d.functions_analyzed);
    println!("Sources found:      {}", d.sources_found);
    println!("Findings:           {}", report.findings.len());
    println!("Low confidence:     {}", report.low_confidence.len());
    println!("Analysis time:      {}ms", d.duration_ms);
    if d.cancelled {
        println!("⚠ run cancelled before completion, results are partial");
    }
    if d.paths_capped {
        println!("⚠ path cap reached, some flows were not reported");
    }
    if d.unresolved_boundaries > 0 {
        println!(
            "⚠ {} call(s) to unresolved targets crossed with tainted data",
            d.unresolved_boundaries
        );
    }

    for (i, finding) in report.findings.iter().enumerate() {
        println!();
        println!(
            "{}. [{}] {} ({:.2})",
            i + 1,
            finding.severity.as_str(),
            finding.vulnerability,
            finding.confidence
        );
        println!(
            "   {} ({}:{}) → {} ({}:{})",
            finding.path.source.name,
            finding.path.source.file,
            finding.path.source.line,
            finding.path.sink.name,
            finding.path.sink.file,
            finding.path.sink.line,
        );
        for step in &finding.path.steps {
            println!(
                "     {} {} ({}:{})",
                step.kind.as_str(),
                step.description,
                step.file,
                step.line
            );
        }
    }

    if include_low_confidence && !report.low_confidence.is_empty() {
        println!();
        println!("Low-confidence findings:");
        for finding in &report.low_confidence {
            println!(
                "  [{}] {} ({:.2}) {}:{}",
                finding.severity.as_str(),
                finding.vulnerability,
                finding.confidence,
                finding.path.sink.file,
                finding.path.sink.line
            );
        }
    }

    println!();
    if report.is_clean() {
        println!("✅ No taint flows at or above the confidence threshold.");
    } else {
        println!("❌ {} taint flow(s) detected.", report.findings.len());
    }
}
