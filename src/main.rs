use clap::Parser;
use posrecon::cli::{run, Cli};

fn main() -> std::process::ExitCode {
    run(Cli::parse())
}
