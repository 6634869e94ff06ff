use std::process::ExitCode;

fn main() -> ExitCode {
    rustfusion::cli::run()
}
