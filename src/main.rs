use std::process::ExitCode;

fn main() -> ExitCode {
    fuku::entry()
}
