// SPDX-License-Identifier: AGPL-3.0-only

use muontrap::cli::{self, Outcome};

fn main()
{
    env_logger::init();

    let outcome = cli::parse(std::env::args()).unwrap_or_else(|message| {
        eprintln!("MUONTRAP: {message}");
        std::process::exit(1);
    });

    match outcome {
        Outcome::Help => std::process::exit(0),
        Outcome::Run(config) => {
            let code = muontrap::supervisor::run(config);
            std::process::exit(code);
        },
    }
}
