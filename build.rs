use std::ffi::OsString;
use std::fs;

use clap::Command;
use clap::CommandFactory;
use clap_complete::{Generator, Shell};
#[path = "src/cli.rs"]
mod cli;

fn print_completions<G: Generator>(gen: G, cmd: &mut Command, outdir: impl Into<OsString>) {
    clap_complete::generate_to(gen, cmd, cmd.get_name().to_string(), outdir).unwrap();
}

fn main() {
    let outdir = match std::env::var_os("OUT_DIR") {
        None => {
            println!("No OUT_DIR defined to store completion files.");
            std::process::exit(1);
        }
        Some(outdir) => outdir,
    };
    fs::create_dir_all(&outdir).unwrap();

    let mut cmd = cli::Cli::command();
    for shell in [
        Shell::Zsh,
        Shell::Bash,
        Shell::Fish,
        Shell::PowerShell,
        Shell::Elvish,
    ] {
        print_completions(shell, &mut cmd, &outdir);
    }
}
