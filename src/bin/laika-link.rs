use std::env;
use std::process::ExitCode;
use laika_link::run;
use laika_link::error::print_error;

fn main() -> ExitCode {
    let args = env::args();

    match run(args) {
        Err(err) => {
            print_error(concat!("laika-link ", env!("CARGO_PKG_VERSION"), " failed"), &err);
            ExitCode::FAILURE
        },
        Ok(_) => ExitCode::SUCCESS,
    }
}
