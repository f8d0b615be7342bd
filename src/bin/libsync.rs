#![deny(unsafe_code)]

use std::{env, process::ExitCode};

fn main() -> ExitCode {
    let status = client::run(env::args_os());
    ExitCode::from(u8::try_from(status).unwrap_or(1))
}
