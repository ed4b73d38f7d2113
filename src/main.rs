use clap::Parser;

use gsc_compiler::cli::{run, Args};

fn main() {
    let hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        hook(info);
        eprintln!("internal compiler error");
        std::process::exit(666);
    }));

    run(Args::parse());
}
