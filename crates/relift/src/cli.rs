//! CLI definitions and argument types.

use std::path::PathBuf;

use clap::Parser;

use relift::LiftOptions;

/// Exit code for success.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for failure.
pub const EXIT_FAILURE: i32 = 1;

#[derive(Parser)]
#[command(name = "relift")]
#[command(about = "Trace recompiler - recovers functions and control flow from captured basic blocks")]
#[command(version)]
pub struct Cli {
    /// Captured trace module (compact binary form); sidecars are read
    /// from the same directory
    #[arg(value_name = "TRACE")]
    pub trace: PathBuf,

    /// Output basename
    #[arg(short, long, default_value = "lifted")]
    pub output: PathBuf,

    /// First link-preparation stage (delegated to the native toolchain)
    #[arg(long)]
    pub link_prep_1: bool,

    /// Second link-preparation stage (delegated to the native toolchain)
    #[arg(long)]
    pub link_prep_2: bool,

    /// Run only the cleanup passes (hole stripping, dead-successor
    /// pruning)
    #[arg(long)]
    pub clean: bool,

    /// Run the full recovery pipeline (default when no stage is selected)
    #[arg(long)]
    pub lift: bool,

    /// Optimization stage (delegated to the native toolchain)
    #[arg(long)]
    pub optimize: bool,

    /// Aggressive optimization stage (delegated to the native toolchain)
    #[arg(long)]
    pub optimize_better: bool,

    /// Compile stage (delegated to the native toolchain)
    #[arg(long)]
    pub compile: bool,

    /// Skip extern-stub successor synthesis during lifting
    #[arg(long)]
    pub no_link_lift: bool,

    /// Strip merged-block diagnostic tags from the output
    #[arg(long)]
    pub clean_names: bool,

    /// Instrument every inserted call with a tracing helper
    #[arg(long)]
    pub trace_calls: bool,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Suppress output (only show errors)
    #[arg(short, long, conflicts_with = "verbose")]
    pub silent: bool,
}

impl Cli {
    pub fn to_options(&self) -> LiftOptions {
        LiftOptions {
            trace_path: self.trace.clone(),
            output_base: self.output.clone(),
            link_prep_1: self.link_prep_1,
            link_prep_2: self.link_prep_2,
            clean: self.clean,
            lift: self.lift,
            optimize: self.optimize,
            optimize_better: self.optimize_better,
            compile: self.compile,
            no_link_lift: self.no_link_lift,
            clean_names: self.clean_names,
            trace_calls: self.trace_calls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_parsing() {
        let cli = Cli::parse_from([
            "relift",
            "capture/trace.rlm",
            "-o",
            "out/lifted",
            "--lift",
            "--clean-names",
            "--no-link-lift",
        ]);
        assert!(cli.lift);
        assert!(cli.clean_names);
        assert!(cli.no_link_lift);
        assert!(!cli.compile);
        let opts = cli.to_options();
        assert_eq!(opts.output_base, PathBuf::from("out/lifted"));
    }
}
