use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use time::OffsetDateTime;

use filemq::config::QueueConfig;
use filemq::{Address, InboundQueue, Message, OutboundQueue};

/// Inspect and maintain a queue storage root. Do not run against a root that a
/// live endpoint currently owns.
#[derive(Parser, Debug)]
#[command(name = "filemq-cli", author, version, about, long_about = None)]
struct Cli {
    /// Storage root (overrides the config file's root)
    #[arg(long)]
    root: Option<PathBuf>,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Queue name used in log lines
    #[arg(long, default_value = "cli")]
    name: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Pending, corrupt and dead-lettered counts
    Stats,
    /// Keys of pending messages in queue order
    List {
        /// List the outbound queue instead of the inbound one
        #[arg(long)]
        outbound: bool,
    },
    /// Take messages from the inbound queue and print them
    Receive {
        #[arg(long, default_value_t = 1)]
        count: usize,
        #[arg(long = "timeout-ms", default_value_t = 0)]
        timeout_ms: u64,
        /// Leave the files in place instead of retiring them
        #[arg(long)]
        accept: bool,
    },
    /// Run an audit-log retention sweep now
    Cleanup,
    /// Queue a text message for delivery by the owning endpoint
    Send {
        /// Destination in `transport|server|ip|port|pipe` form
        #[arg(long)]
        to: String,
        /// Sender in `transport|server|ip|port|pipe` form
        #[arg(long)]
        from: String,
        #[arg(long = "type", default_value = "text")]
        message_type: String,
        text: String,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => QueueConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => QueueConfig::default(),
    };
    if let Some(root) = cli.root {
        config.root = root;
    }
    info!("using storage root {}", config.root.display());

    let mut out = io::BufWriter::new(io::stdout());
    match cli.command {
        Commands::Stats => cmd_stats(&cli.name, &config, &mut out)?,
        Commands::List { outbound } => cmd_list(&cli.name, &config, outbound, &mut out)?,
        Commands::Receive {
            count,
            timeout_ms,
            accept,
        } => cmd_receive(
            &cli.name,
            &config,
            count,
            Duration::from_millis(timeout_ms),
            accept,
            &mut out,
        )?,
        Commands::Cleanup => cmd_cleanup(&cli.name, &config, &mut out)?,
        Commands::Send {
            to,
            from,
            message_type,
            text,
        } => cmd_send(&cli.name, &config, &to, &from, &message_type, &text, &mut out)?,
    }
    out.flush()?;
    Ok(())
}

fn cmd_stats(name: &str, config: &QueueConfig, out: &mut dyn Write) -> Result<()> {
    let inbound = InboundQueue::open(name, config).context("failed to open inbound queue")?;
    let outbound = OutboundQueue::open(name, config).context("failed to open outbound queue")?;
    let failed = match std::fs::read_dir(config.failed_dir()) {
        Ok(entries) => entries.count(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
        Err(err) => return Err(err).context("failed to list dead letters"),
    };
    writeln!(out, "root:          {}", config.root.display())?;
    writeln!(out, "inbound:       {}", inbound.count())?;
    writeln!(out, "outbound:      {}", outbound.count())?;
    writeln!(
        out,
        "corrupt:       {}",
        inbound.corrupt_count() + outbound.corrupt_count()
    )?;
    writeln!(out, "dead letters:  {failed}")?;
    Ok(())
}

fn cmd_list(name: &str, config: &QueueConfig, outbound: bool, out: &mut dyn Write) -> Result<()> {
    let keys = if outbound {
        OutboundQueue::open(name, config)
            .context("failed to open outbound queue")?
            .keys()?
    } else {
        InboundQueue::open(name, config)
            .context("failed to open inbound queue")?
            .keys()?
    };
    for key in keys {
        writeln!(out, "{key}")?;
    }
    Ok(())
}

fn cmd_receive(
    name: &str,
    config: &QueueConfig,
    count: usize,
    timeout: Duration,
    accept: bool,
    out: &mut dyn Write,
) -> Result<()> {
    let inbound = InboundQueue::open(name, config).context("failed to open inbound queue")?;
    for _ in 0..count {
        let next = if accept {
            inbound.accept(Some(timeout))?
        } else {
            inbound.receive(Some(timeout))?
        };
        let Some(message) = next else {
            break;
        };
        writeln!(out, "{}", message.to_flat_line())?;
    }
    Ok(())
}

fn cmd_cleanup(name: &str, config: &QueueConfig, out: &mut dyn Write) -> Result<()> {
    if !config.persist_read_logs {
        bail!("audit logs are disabled for this root");
    }
    let inbound = InboundQueue::open(name, config).context("failed to open inbound queue")?;
    let outbound = OutboundQueue::open(name, config).context("failed to open outbound queue")?;
    inbound.trigger_cleanup();
    outbound.trigger_cleanup();

    let deadline = Instant::now() + Duration::from_secs(30);
    while inbound.cleanup_passes() < 1 || outbound.cleanup_passes() < 1 {
        if Instant::now() >= deadline {
            bail!("cleanup did not finish within 30s");
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    if let Some(err) = inbound.state_error().or_else(|| outbound.state_error()) {
        bail!("cleanup reported an error: {err}");
    }
    writeln!(
        out,
        "swept audit logs older than {}h",
        config.read_log_retention_hours
    )?;
    Ok(())
}

fn cmd_send(
    name: &str,
    config: &QueueConfig,
    to: &str,
    from: &str,
    message_type: &str,
    text: &str,
    out: &mut dyn Write,
) -> Result<()> {
    let to: Address = to.parse().context("invalid --to address")?;
    let from: Address = from.parse().context("invalid --from address")?;
    let outbound = OutboundQueue::open(name, config).context("failed to open outbound queue")?;
    let message = Message::text(from, message_type, text, OffsetDateTime::now_utc());
    let id = message.id;
    outbound.enqueue(to, message)?;
    writeln!(out, "{id}")?;
    Ok(())
}
