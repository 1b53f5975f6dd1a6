mod config;
mod intake;
mod locks;
mod pipeline;
mod retry;

use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use dock_core::time;
use dock_core::{
    BufferKey, BufferStatus, DEFAULT_QUERY_LIMIT, GatewayPlacement, MovementRecord, NewShipment,
    PresenceBuffer, Shipment, ShipmentStatus, normalize_tag_id,
};
use dock_store::{DataDir, Store};

use crate::config::{Config, config_path};
use crate::intake::IntakeCounters;
use crate::pipeline::Pipeline;

#[derive(Parser)]
#[command(name = "dock", about = "RFID dock presence pipeline and operator CLI")]
struct Cli {
    /// Data directory (defaults to $DOCK_DATA_DIR, then ~/.dock)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file (defaults to $DOCK_CONFIG, then <data dir>/dock.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume NDJSON gateway snapshots from stdin until EOF or a signal
    Serve {
        /// Also accept snapshots over HTTP (POST /snapshots)
        #[arg(long)]
        listen: Option<SocketAddr>,
    },

    /// Process NDJSON snapshot files in order
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Manage the gateway → location registry
    Gateway {
        #[command(subcommand)]
        command: GatewayCommand,
    },

    /// Query the movement ledger
    Movements {
        #[command(subcommand)]
        command: MovementsCommand,
    },

    /// Ledger summary for an organization, location, or tag
    Summary {
        #[arg(long)]
        org: String,

        #[arg(long, conflicts_with = "tag")]
        location: Option<String>,

        #[arg(long)]
        tag: Option<String>,
    },

    /// Inspect or reset presence buffers
    Buffers {
        #[command(subcommand)]
        command: BuffersCommand,
    },

    /// Manage shipments
    Shipment {
        #[command(subcommand)]
        command: ShipmentCommand,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum GatewayCommand {
    /// Register (or move) a gateway
    Add {
        gateway_id: String,

        #[arg(long)]
        org: String,

        #[arg(long)]
        location: String,

        /// Display name of the location (defaults to the location id)
        #[arg(long)]
        name: Option<String>,
    },

    List {
        #[arg(long)]
        org: Option<String>,
    },

    Remove { gateway_id: String },
}

#[derive(Subcommand)]
enum MovementsCommand {
    /// Most recent movements in an organization
    Recent {
        #[arg(long)]
        org: String,

        #[arg(long, default_value_t = DEFAULT_QUERY_LIMIT)]
        limit: usize,
    },

    /// Movement history of one tag
    Tag {
        tag: String,

        #[arg(long)]
        org: String,

        #[arg(long, default_value_t = DEFAULT_QUERY_LIMIT)]
        limit: usize,
    },

    /// Movement history at one location
    Location {
        location: String,

        #[arg(long)]
        org: String,

        #[arg(long, default_value_t = DEFAULT_QUERY_LIMIT)]
        limit: usize,
    },

    /// Movements within an inclusive time range (RFC 3339)
    Range {
        #[arg(long)]
        org: String,

        #[arg(long)]
        from: DateTime<Utc>,

        #[arg(long)]
        to: DateTime<Utc>,

        #[arg(long)]
        location: Option<String>,
    },

    /// Latest movement of a tag
    Last {
        tag: String,

        #[arg(long)]
        org: String,
    },

    /// Tags whose latest movement is IN at a location
    Present {
        location: String,

        #[arg(long)]
        org: String,
    },
}

#[derive(Subcommand)]
enum BuffersCommand {
    /// Buffers at a location
    List {
        location: String,

        #[arg(long)]
        org: String,

        /// Restrict to these statuses (repeatable)
        #[arg(long)]
        status: Vec<BufferStatus>,
    },

    /// Buffer counts per status at a location
    Summary {
        location: String,

        #[arg(long)]
        org: String,
    },

    /// Tags present at more than one location
    Conflicts {
        #[arg(long)]
        org: String,
    },

    /// Forget a tag at a location
    Reset {
        tag: String,

        #[arg(long)]
        org: String,

        #[arg(long)]
        location: String,
    },
}

#[derive(Subcommand)]
enum ShipmentCommand {
    Create {
        #[arg(long)]
        org: String,

        /// Origin location
        #[arg(long)]
        from: String,

        /// Destination location
        #[arg(long)]
        to: String,

        /// Tag to ship (repeatable)
        #[arg(long = "tag", required = true)]
        tags: Vec<String>,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Show a shipment by id or code
    Show { shipment: String },

    List {
        #[arg(long)]
        org: String,

        #[arg(long)]
        status: Option<ShipmentStatus>,

        /// Only shipments carrying this tag
        #[arg(long)]
        tag: Option<String>,
    },

    /// Cancel a shipment by id or code
    Cancel { shipment: String },

    Stats {
        #[arg(long)]
        org: String,
    },
}

fn data_dir(cli: &Cli) -> DataDir {
    DataDir::resolve(cli.data_dir.as_deref())
}

fn open_store(cli: &Cli) -> Result<Store> {
    data_dir(cli).open_store().context("failed to open store")
}

fn load_config(cli: &Cli) -> Result<Config> {
    let path = config_path(cli.config.as_deref(), data_dir(cli).config_path());
    Config::load(&path)
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Serve { listen } => cmd_serve(&cli, *listen).await,
        Commands::Ingest { files } => cmd_ingest(&cli, files).await,
        Commands::Gateway { command } => cmd_gateway(&cli, command),
        Commands::Movements { command } => cmd_movements(&cli, command),
        Commands::Summary { org, location, tag } => {
            cmd_summary(&cli, org, location.as_deref(), tag.as_deref())
        }
        Commands::Buffers { command } => cmd_buffers(&cli, command),
        Commands::Shipment { command } => cmd_shipment(&cli, command),
        Commands::Config => cmd_config(&cli),
    }
}

// ---------------------------------------------------------------------------
// Advisory pidfile for observability
// ---------------------------------------------------------------------------

/// Check for an existing pidfile and log accordingly, then write our own.
fn acquire_pidfile(path: &Path) -> Option<PathBuf> {
    if let Ok(content) = std::fs::read_to_string(path)
        && let Ok(pid) = content.trim().parse::<u32>()
    {
        if is_process_alive(pid) {
            tracing::warn!("another dock serve (PID {pid}) is running; sharing the database");
        } else {
            tracing::info!("cleaned up stale pidfile (PID {pid} is dead)");
            let _ = std::fs::remove_file(path);
        }
    }

    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match std::fs::File::create(path) {
        Ok(mut f) => {
            let _ = write!(f, "{}", std::process::id());
            tracing::info!("wrote pidfile: {}", path.display());
            Some(path.to_path_buf())
        }
        Err(e) => {
            tracing::warn!("failed to write pidfile: {e}");
            None
        }
    }
}

fn release_pidfile(path: &Path) {
    let _ = std::fs::remove_file(path);
    tracing::info!("removed pidfile: {}", path.display());
}

#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    // kill(pid, 0) checks existence without sending a signal
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    false
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_serve(cli: &Cli, listen: Option<SocketAddr>) -> Result<()> {
    let config = load_config(cli)?;
    let dir = data_dir(cli);
    let store = Arc::new(dir.open_store().context("failed to open store")?);
    let pipeline = Arc::new(Pipeline::new(store.clone(), &config));
    let listen = listen.or(config.http.listen);
    tracing::info!(data_dir = %dir.root().display(), "starting dock intake");

    let token = CancellationToken::new();
    intake::spawn_signal_handler(token.clone());
    let pidfile = acquire_pidfile(&dir.pidfile_path());

    let result = intake::serve(
        pipeline,
        std::io::BufReader::new(std::io::stdin()),
        listen,
        config.pipeline.max_in_flight,
        token,
    )
    .await;

    if let Err(e) = store.checkpoint_truncate() {
        tracing::warn!("wal checkpoint failed: {e}");
    }
    if let Some(path) = pidfile {
        release_pidfile(&path);
    }

    let stats = result?;
    if cli.json {
        print_json(&stats)?;
    } else {
        println!(
            "accepted={} rejected={} dropped={} failed={} movements={}",
            stats.accepted, stats.rejected, stats.dropped, stats.failed, stats.movements
        );
    }
    Ok(())
}

async fn cmd_ingest(cli: &Cli, files: &[PathBuf]) -> Result<()> {
    let config = load_config(cli)?;
    let store = Arc::new(open_store(cli)?);
    let pipeline = Pipeline::new(store, &config);
    let counters = IntakeCounters::default();

    for path in files {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let before = counters.snapshot();
        intake::replay(&pipeline, &text, &counters).await;
        let after = counters.snapshot();
        println!(
            "ingested {} → {} snapshots, {} movements",
            path.display(),
            after.accepted - before.accepted,
            after.movements - before.movements
        );
    }

    if let Err(e) = pipeline.store().checkpoint_truncate() {
        tracing::warn!("wal checkpoint failed: {e}");
    }

    let stats = counters.snapshot();
    if cli.json {
        print_json(&stats)?;
    } else {
        println!(
            "done.accepted={} rejected={} dropped={} failed={} movements={}",
            stats.accepted, stats.rejected, stats.dropped, stats.failed, stats.movements
        );
    }
    Ok(())
}

fn cmd_gateway(cli: &Cli, command: &GatewayCommand) -> Result<()> {
    let store = open_store(cli)?;
    match command {
        GatewayCommand::Add {
            gateway_id,
            org,
            location,
            name,
        } => {
            let placement = GatewayPlacement::new(
                gateway_id.trim(),
                org,
                location,
                name.clone().unwrap_or_else(|| location.clone()),
            );
            store
                .register_gateway(&placement, time::now())
                .context("failed to register gateway")?;
            if cli.json {
                print_json(&placement)?;
            } else {
                println!(
                    "registered {} ({}) at {}/{}",
                    placement.gateway_id, placement.source_kind, org, location
                );
            }
        }
        GatewayCommand::List { org } => {
            let gateways = store
                .list_gateways(org.as_deref())
                .context("failed to list gateways")?;
            if cli.json {
                print_json(&gateways)?;
            } else if gateways.is_empty() {
                println!("(no gateways)");
            } else {
                for g in &gateways {
                    println!(
                        "{:<20} {:<8} {}/{} ({})",
                        g.gateway_id, g.source_kind, g.organization_id, g.location_id, g.location_name
                    );
                }
            }
        }
        GatewayCommand::Remove { gateway_id } => {
            if !store
                .remove_gateway(gateway_id)
                .context("failed to remove gateway")?
            {
                bail!("gateway {gateway_id} is not registered");
            }
            println!("removed {gateway_id}");
        }
    }
    Ok(())
}

fn cmd_movements(cli: &Cli, command: &MovementsCommand) -> Result<()> {
    let store = open_store(cli)?;
    let movements = match command {
        MovementsCommand::Recent { org, limit } => store.recent_movements(org, *limit),
        MovementsCommand::Tag { tag, org, limit } => {
            store.movements_by_tag(org, &normalize_tag_id(tag), *limit)
        }
        MovementsCommand::Location {
            location,
            org,
            limit,
        } => store.movements_by_location(org, location, *limit),
        MovementsCommand::Range {
            org,
            from,
            to,
            location,
        } => {
            if from > to {
                bail!("--from must not be after --to");
            }
            store.movements_in_range(org, *from, *to, location.as_deref())
        }
        MovementsCommand::Last { tag, org } => store
            .last_movement_for_tag(org, &normalize_tag_id(tag))
            .map(|m| m.into_iter().collect()),
        MovementsCommand::Present { location, org } => store.tags_currently_at(org, location),
    }
    .context("failed to query movements")?;

    if cli.json {
        return print_json(&movements);
    }
    print_movements(&movements);
    Ok(())
}

fn cmd_summary(cli: &Cli, org: &str, location: Option<&str>, tag: Option<&str>) -> Result<()> {
    let store = open_store(cli)?;
    let now = time::now();
    match (location, tag) {
        (_, Some(tag)) => {
            let summary = store
                .tag_summary(org, &normalize_tag_id(tag))
                .context("failed to summarize tag")?;
            if cli.json {
                return print_json(&summary);
            }
            println!("in:         {}", summary.total_in);
            println!("out:        {}", summary.total_out);
            println!("present:    {}", summary.currently_in);
            if let Some(last) = &summary.last_movement {
                println!("last:       {}", format_movement(last));
            }
        }
        (Some(location), None) => {
            let summary = store
                .location_summary(org, location, now)
                .context("failed to summarize location")?;
            if cli.json {
                return print_json(&summary);
            }
            println!("in:         {}", summary.total_in);
            println!("out:        {}", summary.total_out);
            println!("present:    {}", summary.current_count);
            println!("today in:   {}", summary.today_in);
            println!("today out:  {}", summary.today_out);
        }
        (None, None) => {
            let summary = store
                .organization_summary(org, now)
                .context("failed to summarize organization")?;
            if cli.json {
                return print_json(&summary);
            }
            println!("movements:  {}", summary.total_movements);
            println!("in:         {}", summary.total_in);
            println!("out:        {}", summary.total_out);
            println!("today:      {}", summary.today_count);
        }
    }
    Ok(())
}

fn cmd_buffers(cli: &Cli, command: &BuffersCommand) -> Result<()> {
    let store = open_store(cli)?;
    match command {
        BuffersCommand::List {
            location,
            org,
            status,
        } => {
            let buffers = store
                .list_buffers_by_location(org, location, status)
                .context("failed to list buffers")?;
            if cli.json {
                return print_json(&buffers);
            }
            if buffers.is_empty() {
                println!("(no buffers)");
            }
            for b in &buffers {
                println!("{}", format_buffer(b));
            }
        }
        BuffersCommand::Summary { location, org } => {
            let summary = store
                .buffer_summary(org, location)
                .context("failed to summarize buffers")?;
            if cli.json {
                return print_json(&summary);
            }
            println!("tracking:      {}", summary.tracking);
            println!("confirmed in:  {}", summary.confirmed_in);
            println!("pending out:   {}", summary.pending_out);
            println!("confirmed out: {}", summary.confirmed_out);
            println!("present:       {}", summary.present);
        }
        BuffersCommand::Conflicts { org } => {
            let conflicts = store
                .presence_conflicts(org)
                .context("failed to list presence conflicts")?;
            if cli.json {
                return print_json(&conflicts);
            }
            if conflicts.is_empty() {
                println!("(no conflicts)");
            }
            for c in &conflicts {
                println!("{}  {}", c.tag_id, c.location_ids.join(", "));
            }
        }
        BuffersCommand::Reset { tag, org, location } => {
            let key = BufferKey::new(org, normalize_tag_id(tag), location);
            if !store.delete_buffer(&key).context("failed to reset buffer")? {
                bail!("no buffer for {key}");
            }
            println!("reset {key}");
        }
    }
    Ok(())
}

fn find_shipment(store: &Store, reference: &str) -> Result<Shipment> {
    let found = match reference.parse::<Uuid>() {
        Ok(id) => store.get_shipment(id),
        Err(_) => store.get_shipment_by_code(&reference.trim().to_ascii_uppercase()),
    }
    .context("failed to load shipment")?;
    found.ok_or_else(|| anyhow!("no shipment {reference}"))
}

fn cmd_shipment(cli: &Cli, command: &ShipmentCommand) -> Result<()> {
    let store = open_store(cli)?;
    match command {
        ShipmentCommand::Create {
            org,
            from,
            to,
            tags,
            notes,
        } => {
            let shipment = store
                .create_shipment(
                    NewShipment {
                        organization_id: org.clone(),
                        origin_location_id: from.clone(),
                        destination_location_id: to.clone(),
                        tag_ids: tags.clone(),
                        notes: notes.clone(),
                    },
                    time::now(),
                )
                .context("failed to create shipment")?;
            if cli.json {
                return print_json(&shipment);
            }
            println!(
                "created {} ({}) with {} items",
                shipment.code,
                shipment.id,
                shipment.items.len()
            );
        }
        ShipmentCommand::Show { shipment } => {
            let shipment = find_shipment(&store, shipment)?;
            if cli.json {
                return print_json(&shipment);
            }
            print_shipment(&shipment);
        }
        ShipmentCommand::List { org, status, tag } => {
            let shipments = match tag {
                Some(tag) => store
                    .shipments_for_tag(org, &normalize_tag_id(tag))
                    .map(|all| {
                        all.into_iter()
                            .filter(|s| status.is_none_or(|st| s.status == st))
                            .collect::<Vec<_>>()
                    }),
                None => store.list_shipments(org, *status),
            }
            .context("failed to list shipments")?;
            if cli.json {
                return print_json(&shipments);
            }
            if shipments.is_empty() {
                println!("(no shipments)");
            }
            for s in &shipments {
                println!(
                    "{}  {:<10}  {} → {}  {} items",
                    s.code,
                    s.status,
                    s.origin_location_id,
                    s.destination_location_id,
                    s.items.len()
                );
            }
        }
        ShipmentCommand::Cancel { shipment } => {
            let id = find_shipment(&store, shipment)?.id;
            let cancelled = store
                .cancel_shipment(id, time::now())
                .context("failed to cancel shipment")?;
            if cli.json {
                return print_json(&cancelled);
            }
            println!("{} {}", cancelled.code, cancelled.status);
        }
        ShipmentCommand::Stats { org } => {
            let stats = store
                .shipment_stats(org)
                .context("failed to compute shipment stats")?;
            if cli.json {
                return print_json(&stats);
            }
            println!("total:       {}", stats.total);
            println!("pending:     {}", stats.pending);
            println!("in transit:  {}", stats.in_transit);
            println!("partial:     {}", stats.partial);
            println!("delivered:   {}", stats.delivered);
            println!("cancelled:   {}", stats.cancelled);
        }
    }
    Ok(())
}

fn cmd_config(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    if cli.json {
        return print_json(&config);
    }
    let text = toml::to_string_pretty(&config).context("failed to render config")?;
    print!("{text}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{json}");
    Ok(())
}

fn format_movement(m: &MovementRecord) -> String {
    format!(
        "{}  {:<3}  {}  {} ({})  via {}",
        m.occurred_at.to_rfc3339(),
        m.action,
        m.tag_id,
        m.location_id,
        m.location_name,
        m.source_id
    )
}

fn print_movements(movements: &[MovementRecord]) {
    if movements.is_empty() {
        println!("(no movements)");
    }
    for m in movements {
        println!("{}", format_movement(m));
    }
}

fn format_buffer(b: &PresenceBuffer) -> String {
    format!(
        "{}  {:<13}  seen={} missed={} avg={:.1}dBm last_seen={}",
        b.key.tag_id,
        b.status,
        b.seen_count,
        b.missed_count,
        b.average_signal,
        b.last_seen_at.to_rfc3339()
    )
}

fn print_shipment(s: &Shipment) {
    println!("code:        {}", s.code);
    println!("id:          {}", s.id);
    println!("status:      {}", s.status);
    println!("route:       {} → {}", s.origin_location_id, s.destination_location_id);
    println!("created:     {}", s.created_at.to_rfc3339());
    if let Some(notes) = &s.notes {
        println!("notes:       {notes}");
    }
    for item in &s.items {
        let exited = item
            .exited_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        let arrived = item
            .arrived_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {}  {:<10}  exited={}  arrived={}",
            item.tag_id, item.status, exited, arrived
        );
    }
}
