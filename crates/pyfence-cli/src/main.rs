use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use pyfence::{
    run_script, AgentOptions, Analysis, Mode, PerfAnalyzer, RunError, RunSummary, TypeLogger,
};

/// Learn or enforce module dependencies and call allowlists for a Python
/// script.
#[derive(Parser, Debug)]
#[command(
    name = "pyfence",
    version,
    about = "Learn or enforce module dependencies and call allowlists"
)]
struct Args {
    /// 'learn' generates events/dependencies/allowlist; 'enforce' applies an
    /// existing allowlist
    #[arg(short, long, value_enum)]
    mode: CliMode,

    /// Path to the config file defining hook targets
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Analyses to run (learn mode only)
    #[arg(short, long = "analyses", value_enum, num_args = 0..)]
    analyses: Vec<AnalysisKind>,

    /// Directory to write reports and analysis logs
    #[arg(short, long, default_value = ".")]
    outdir: PathBuf,

    /// Path to the allowlist file (enforce mode only)
    #[arg(long, default_value = "allowlist.json")]
    allowlist: PathBuf,

    /// Disable in-memory event recording (imports/calls/returns)
    #[arg(long)]
    no_log: bool,

    /// Target Python script to execute under hooks
    script: PathBuf,

    /// Arguments to pass to the target script
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CliMode {
    Learn,
    Enforce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AnalysisKind {
    Perf,
    Types,
}

fn build_analyses(kinds: &[AnalysisKind], outdir: &Path) -> Result<Vec<Box<dyn Analysis>>, String> {
    let mut analyses: Vec<Box<dyn Analysis>> = Vec::new();
    for kind in kinds {
        match kind {
            AnalysisKind::Perf => {
                let perf = PerfAnalyzer::create(&outdir.join("perf.log"))
                    .map_err(|e| format!("could not open perf.log: {e}"))?;
                analyses.push(Box::new(perf));
            }
            AnalysisKind::Types => {
                let types = TypeLogger::create(&outdir.join("types.log"))
                    .map_err(|e| format!("could not open types.log: {e}"))?;
                analyses.push(Box::new(types));
            }
        }
    }
    Ok(analyses)
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let mode = match args.mode {
        CliMode::Learn => Mode::Learn,
        CliMode::Enforce => Mode::Enforce,
    };

    // Analyses run in learn mode only; enforce runs bare.
    let analyses = if mode.is_learn() {
        if let Err(err) = std::fs::create_dir_all(&args.outdir) {
            eprintln!("pyfence: could not create {}: {err}", args.outdir.display());
            return ExitCode::from(2);
        }
        match build_analyses(&args.analyses, &args.outdir) {
            Ok(analyses) => analyses,
            Err(err) => {
                eprintln!("pyfence: {err}");
                return ExitCode::from(2);
            }
        }
    } else {
        Vec::new()
    };

    let options = AgentOptions {
        mode,
        config_path: args.config,
        allowlist_path: args.allowlist,
        outdir: args.outdir.clone(),
        log_events: !args.no_log,
    };

    let summary = match run_script(&args.script, &args.args, &options, analyses) {
        Ok(summary) => summary,
        Err(err) => {
            eprintln!("pyfence: {err}");
            return ExitCode::from(2);
        }
    };

    exit_code_for(summary, mode, &args.outdir)
}

fn exit_code_for(summary: RunSummary, mode: Mode, outdir: &Path) -> ExitCode {
    match summary.error {
        None => {
            if mode.is_learn() {
                println!(
                    "Learn mode complete. Reports (events.json, dependencies.json, allowlist.json) in {}.",
                    outdir.display()
                );
            }
            ExitCode::SUCCESS
        }
        Some(RunError::Exit { code }) => ExitCode::from(code.clamp(0, 255) as u8),
        Some(RunError::PolicyDenied { violation }) => {
            eprintln!("pyfence: {violation}");
            ExitCode::from(1)
        }
        Some(RunError::SyntaxError { message, line, col }) => {
            eprintln!("pyfence: syntax error at {line}:{col}: {message}");
            ExitCode::from(1)
        }
        Some(RunError::RuntimeError { message, traceback }) => {
            if traceback.is_empty() {
                eprintln!("{message}");
            } else {
                eprint!("{traceback}");
            }
            ExitCode::from(1)
        }
    }
}
