use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

/// Prepare methods for deferred compilation
#[derive(Parser)]
#[command(name = "deferc")]
#[command(version = deferc_config::VERSION)]
#[command(about = "Call-tree builder and graph encoder for deferred compilation", long_about = None)]
pub struct Cli {
    /// Log more detail; repeat for trace output
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build and encode the Deferred graphs of a program description
    Build(BuildArgs),
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Path to the JSON program description
    #[arg(value_name = "PROGRAM")]
    pub program: PathBuf,

    /// Output path without extension; `.bin` and `.json` are appended
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// TOML build configuration; `DEFERC_*` variables apply when absent
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Budget of Deferred methods; repeated values are summed and may carry a `#comment`
    #[arg(long = "max-methods", value_name = "N")]
    pub max_methods: Vec<String>,

    /// Abort instead of warning when the budget is exceeded
    #[arg(long)]
    pub enforce_max_methods: bool,

    #[arg(long)]
    pub print_call_tree: bool,

    #[arg(long)]
    pub print_candidates: bool,

    #[arg(long)]
    pub print_methods: bool,

    /// Decode every encoded graph again and compare
    #[arg(long)]
    pub verify_encoding: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_flags_parse() {
        let cli = Cli::try_parse_from([
            "deferc",
            "build",
            "app.json",
            "--max-methods",
            "10 # base",
            "--max-methods=5",
            "--enforce-max-methods",
            "--print-call-tree",
            "-o",
            "out/app",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 0);
        let Commands::Build(args) = cli.command;
        assert_eq!(args.program, PathBuf::from("app.json"));
        assert_eq!(args.max_methods, vec!["10 # base", "5"]);
        assert!(args.enforce_max_methods);
        assert!(args.print_call_tree);
        assert!(!args.verify_encoding);
        assert_eq!(args.output, Some(PathBuf::from("out/app")));
    }

    #[test]
    fn verbosity_counts_repeats() {
        let cli = Cli::try_parse_from(["deferc", "build", "-vv", "app.json"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn program_is_required() {
        assert!(Cli::try_parse_from(["deferc", "build"]).is_err());
    }
}
