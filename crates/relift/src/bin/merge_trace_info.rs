//! merge-trace-info - fold N trace-info sidecars into one.
//!
//! Independent capture runs each leave their own `traceInfo.json`; the
//! merge is associative and commutative over the set-valued fields, so
//! any grouping of runs produces the same record.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use relift_trace::TraceInfo;

#[derive(Parser)]
#[command(name = "merge-trace-info")]
#[command(about = "Merge trace-info sidecars from independent capture runs")]
#[command(version)]
struct Cli {
    /// Input trace-info files
    #[arg(value_name = "TRACE_INFO", required = true)]
    inputs: Vec<PathBuf>,

    /// Output file
    #[arg(short, long, default_value = "traceInfo.json")]
    output: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut merged = TraceInfo::default();
    for path in &cli.inputs {
        let part = match TraceInfo::load(path) {
            Ok(part) => part,
            Err(e) => {
                eprintln!("merge-trace-info: {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
        };
        if let Err(e) = merged.add(part) {
            eprintln!("merge-trace-info: merging {}: {e}", path.display());
            return ExitCode::FAILURE;
        }
    }

    if let Err(e) = merged.save(&cli.output) {
        eprintln!("merge-trace-info: {}: {e}", cli.output.display());
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
