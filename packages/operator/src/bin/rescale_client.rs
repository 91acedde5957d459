// Standalone rescale client.
//
// Speaks the launcher's set_bitmap protocol from the command line, for
// debugging a launcher or driving a rescale by hand. Prints "1" if the
// launcher acknowledged, "0" otherwise; the exit code is 0 either way so
// callers parse stdout instead of exit status.

use std::time::Duration;

use clap::Parser;
use operator_core::kernel::{BaseRescaler, TcpRescaler};

#[derive(Parser)]
#[command(name = "rescale_client")]
#[command(about = "Tell a running MPI launcher to expand or shrink its process group")]
struct Args {
    /// Launcher host or pod IP
    host: String,
    /// Launcher control port
    port: u16,
    /// Current process count
    old: i32,
    /// Target process count
    new: i32,
    /// Seconds to wait for the launcher's response
    #[arg(long, default_value_t = 180)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // Nothing to do when the counts already match.
    if args.old == args.new {
        println!("0");
        return;
    }

    let client = TcpRescaler::new(Duration::from_secs(args.timeout_secs));
    match client
        .rescale(&args.host, args.port, args.old, args.new)
        .await
    {
        Ok(()) => println!("1"),
        Err(e) => {
            eprintln!("rescale failed: {:#}", e);
            println!("0");
        }
    }
}
