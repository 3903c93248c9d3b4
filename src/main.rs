use clap::{Parser, Subcommand};
use colored::Colorize;
use ringtail::buffer::strip_ansi;
use ringtail::capture::{capture_command, capture_stdin};
use ringtail::server::{start_server, DEFAULT_CAPACITY, MAX_CAPACITY};
use ringtail::utils::{get_ip_address, init_tracing};
use ringtail::RingBuffer;
use std::io::Write;
use std::net::Ipv4Addr;

const DEFAULT_PORT: u16 = 8767;
const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);
const SERVER_LOG_FILTER: &str = concat!(env!("CARGO_CRATE_NAME"), "=debug,tower_http=info");
const CAPTURE_LOG_FILTER: &str = "warn";

#[derive(Parser)]
#[command(name = "ringtail", version, about = "Keep the last N bytes of a stream, from the shell or over HTTP", long_about = None)]
struct Cli {
    /// Port to start the server
    #[arg(short, long, default_value_t = DEFAULT_PORT, value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,
    /// Start the server on local network (ip)
    #[arg(short, long)]
    ip: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Read stdin (or run a command) and print the last CAPACITY bytes
    Capture {
        /// Number of bytes to keep
        #[arg(short, long, default_value_t = DEFAULT_CAPACITY as u64, value_parser = clap::value_parser!(u64).range(1..=MAX_CAPACITY as u64))]
        capacity: u64,
        /// Remove terminal colour codes before printing
        #[arg(long)]
        strip_ansi: bool,
        /// Print byte counts to stderr
        #[arg(long)]
        stats: bool,
        /// Command whose stdout is captured instead of stdin
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

fn print_captured(buffer: &RingBuffer, strip: bool) -> std::io::Result<()> {
    let mut stdout = std::io::stdout().lock();
    if strip {
        stdout.write_all(strip_ansi(&buffer.to_text_lossy()).as_bytes())?;
    } else {
        stdout.write_all(&buffer.snapshot())?;
    }
    stdout.flush()
}

fn print_stats(buffer: &RingBuffer) {
    eprintln!(
        "{} kept {} of {} bytes ({} evicted, capacity {})",
        "ℹ".blue().bold(),
        buffer.len().to_string().bright_green(),
        buffer.total_written().to_string().bright_green(),
        buffer.evicted().to_string().yellow(),
        buffer.capacity()
    );
}

async fn run_capture(capacity: usize, strip: bool, stats: bool, command: Vec<String>) -> i32 {
    let (buffer, failure) = match command.split_first() {
        Some((program, args)) => match capture_command(capacity, program, args).await {
            Ok(capture) if capture.status.success() => (capture.buffer, None),
            Ok(capture) => (capture.buffer, Some(format!("`{}` exited with {}", program, capture.status))),
            Err(e) => {
                eprintln!("{} {} {}", "✗".red().bold(), "Capture failed:".red().bold(), e);
                return 1;
            }
        },
        None => match capture_stdin(capacity).await {
            Ok(buffer) => (buffer, None),
            Err(e) => {
                eprintln!("{} {} {}", "✗".red().bold(), "Capture failed:".red().bold(), e);
                return 1;
            }
        },
    };

    if let Err(e) = print_captured(&buffer, strip) {
        // Closed pipe on the reading side, nothing left to report to.
        tracing::debug!("Failed to write captured output: {}", e);
        return 1;
    }
    if stats {
        print_stats(&buffer);
    }

    match failure {
        Some(message) => {
            eprintln!("{} {}", "✗".red().bold(), message.red());
            1
        }
        None => 0,
    }
}

#[tokio::main]
async fn main() {
    let cli: Cli = Cli::parse();

    match cli.command {
        Some(Commands::Capture {
            capacity,
            strip_ansi,
            stats,
            command,
        }) => {
            init_tracing(CAPTURE_LOG_FILTER);
            // Bounded by MAX_CAPACITY, so it fits.
            let code = run_capture(capacity as usize, strip_ansi, stats, command).await;
            std::process::exit(code);
        }
        None => {
            init_tracing(SERVER_LOG_FILTER);
            let ip = if cli.ip {
                get_ip_address().unwrap_or_else(|| {
                    println!(
                        "{} localhost.",
                        "Error: IP address not found. Starting server on"
                            .red()
                            .bold()
                    );
                    LOCAL_IP
                })
            } else {
                LOCAL_IP
            };

            start_server(ip, cli.port).await;
        }
    }
}
