use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use localq::config::{Backend, Config};
use localq::driver::run_workload;
use localq::message::{DeleteMessageRequest, Message, ReceiveMessageRequest, SendMessageRequest};
use localq::store;

#[derive(Parser)]
#[command(name = "localq")]
#[command(about = "Local message queue with file-backed and in-memory stores")]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Store backend (overrides the config file)
    #[arg(long, global = true, value_enum)]
    backend: Option<BackendArg>,

    /// Store root directory for the file backend (overrides the config file)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Queue id (overrides driver.queue_url)
    #[arg(long, global = true)]
    queue: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Memory,
    File,
}

#[derive(Subcommand)]
enum Commands {
    /// Push messages to the queue
    Push {
        /// Message bodies, one message each
        #[arg(required = true)]
        messages: Vec<String>,

        /// Seconds to wait before the messages become visible (memory backend)
        #[arg(long, default_value_t = 0)]
        delay: u32,
    },
    /// Poll a batch of messages and print them
    Poll {
        /// Batch size (defaults to driver.max_messages)
        #[arg(long)]
        batch: Option<usize>,

        /// Visibility timeout in minutes (defaults to driver.visibility_timeout_minutes)
        #[arg(long)]
        visibility: Option<u32>,

        /// Delete what was received
        #[arg(long)]
        delete: bool,
    },
    /// Print new and in-flight counts
    Depth,
    /// Run producer and consumer workers against the store
    Run {
        /// Worker threads per role (defaults to driver.worker_threads)
        #[arg(long)]
        workers: Option<usize>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            Config::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => Config::default(),
    };
    if let Some(backend) = cli.backend {
        config.store.backend = match backend {
            BackendArg::Memory => Backend::Memory,
            BackendArg::File => Backend::File,
        };
    }
    if let Some(root) = cli.root {
        config.store.root = root;
    }
    if let Some(queue) = cli.queue {
        config.driver.queue_url = queue;
    }
    if let Commands::Run {
        workers: Some(workers),
    } = &cli.command
    {
        config.driver.worker_threads = *workers;
    }
    config.validate()?;

    let store = store::open(&config.store)?;
    let queue = config.driver.queue_url.clone();

    match cli.command {
        Commands::Push { messages, delay } => {
            let count = messages.len();
            let messages = messages.into_iter().map(Message::new).collect();
            store.push(&SendMessageRequest::new(&queue, messages, delay))?;
            println!("pushed {count} messages to {queue}");
        }
        Commands::Poll {
            batch,
            visibility,
            delete,
        } => {
            let request = ReceiveMessageRequest::new(
                &queue,
                batch.unwrap_or(config.driver.max_messages),
                visibility.unwrap_or(config.driver.visibility_timeout_minutes),
            );
            let received = store.poll(&request)?;
            if received.is_empty() {
                println!("no messages in {queue} waiting to be processed");
                return Ok(());
            }
            for message in &received {
                println!(
                    "{}\t{}\t{}",
                    message.receipt_id, message.prior_attempts, message.content
                );
            }
            if delete {
                let removed = store.delete(&DeleteMessageRequest::new(&queue, received))?;
                println!("deleted {removed} messages");
            }
        }
        Commands::Depth => {
            let depth = store.depth(&queue)?;
            println!("new={} in_flight={}", depth.new, depth.in_flight);
        }
        Commands::Run { .. } => {
            let report = run_workload(store, &config.driver)?;
            println!("pushed={} consumed={}", report.pushed, report.consumed);
        }
    }
    Ok(())
}
