//! a library for cycle accurate DRAM memory controller simulation
pub mod cli;
pub mod dram;

use std::ffi::OsString;
use std::fs::File;
use std::io::{self, BufWriter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use cli::{Cli, CompArgs, RunArgs};
use dram::config::Config;
use dram::{trace, Simulator};
use eyre::Result;
use tracing::info;
use tracing::metadata::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;

/// raised by the ctrl-c handler; the simulator run loop polls it and
/// ends the simulation at the next cycle boundary
pub static STOP: AtomicBool = AtomicBool::new(false);

#[allow(dead_code)]
pub fn init_logger_info() {
    init_logger(LevelFilter::INFO, io::stderr);
}

#[allow(dead_code)]
pub fn init_logger_debug() {
    init_logger(LevelFilter::DEBUG, io::stderr);
}

#[allow(dead_code)]
pub fn init_logger(
    filter: LevelFilter,
    writter: impl for<'writer> MakeWriter<'writer> + 'static + Send + Sync,
) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(filter.into())
                .from_env_lossy(),
        )
        .with_writer(writter)
        .with_ansi(false)
        .try_init()
        .unwrap_or_else(|e| {
            eprintln!("failed to init logger: {}", e);
        });
}

#[allow(dead_code)]
pub fn init_logger_stderr(filter: LevelFilter) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(filter.into())
                .from_env_lossy(),
        )
        .with_ansi(true)
        .try_init()
        .unwrap_or_else(|e| {
            eprintln!("failed to init logger: {}", e);
        });
}

/// the main function of the simulator
pub fn main_inner<A, T>(args: A) -> Result<()>
where
    A: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);

    match cli.subcmd {
        cli::Operation::Run(RunArgs { config, trace }) => {
            std::fs::create_dir_all("output")?;
            let file_appender = tracing_appender::rolling::hourly("output/", "memctrl.log");
            let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
            init_logger(LevelFilter::INFO, non_blocking);
            ctrlc::set_handler(|| {
                eprintln!("\n------\nCTRL-C received, exiting gracefully");
                eprintln!("the simulator will stop at the next cycle boundary");
                STOP.store(true, Ordering::Relaxed);
            })?;

            println!("run with config: {:?}", config);
            let config = Arc::new(Config::new(config)?);
            let requests = trace::load_trace(&trace)?;
            info!(requests = requests.len(), "trace loaded, building simulator");
            let mut simulator = Simulator::new(Arc::clone(&config))?;

            info!("start running simulator");
            let current_time = std::time::Instant::now();
            let summary = simulator.run(&requests)?;
            info!("time elapsed: {:?}", current_time.elapsed());

            let stdout = io::stdout();
            simulator.print_final_stats(&mut stdout.lock())?;
            if !config.output_path.is_empty() {
                info!("the summary will be written to {:?}", config.output_path);
                serde_json::to_writer(
                    BufWriter::new(File::create(&config.output_path)?),
                    &summary,
                )?;
            }
        }
        cli::Operation::Completion(CompArgs { shell }) => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, name, &mut io::stdout());
        }
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::dram::config::Config;
    use crate::dram::trace::TraceRequest;
    use crate::dram::Simulator;

    #[test]
    fn end_to_end_without_files() {
        let config = Arc::new(Config::from_ddr4(1, 1));
        let mut simulator = Simulator::new(config).unwrap();
        let trace: Vec<TraceRequest> = (0..16)
            .map(|i| TraceRequest {
                addr: i << 6,
                is_write: i % 4 == 0,
                cycle: i,
                requester: 0,
            })
            .collect();
        let summary = simulator.run(&trace).unwrap();
        assert_eq!(summary.reads_done + summary.writes_done, 16);
    }
}
