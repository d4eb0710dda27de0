use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Serialize;
use storefront_engine::{
    config::{self, AppConfig},
    db::{self, DbPool},
    entities::{MovementReason, StocktakeScope},
    events::EventSender,
    services::inventory::{
        csv::parse_bulk_adjust, stocktake_repository, InventoryLedgerService, MovementFilter,
        QuickCountOutcome, SkippedRow, StocktakeService,
    },
};
use tracing::debug;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let context = CliContext::initialize().await?;

    match cli.command {
        Commands::Migrate => {
            db::run_migrations(&context.db)
                .await
                .context("failed to run migrations")?;
            println!("Migrations applied");
        }
        Commands::RebuildOnHand => handle_rebuild(&context, cli.json).await?,
        Commands::QuickCount(args) => handle_quick_count(&context, args, cli.json).await?,
        Commands::BulkAdjust(args) => handle_bulk_adjust(&context, args, cli.json).await?,
        Commands::Stocktake(command) => handle_stocktake_command(&context, command, cli.json).await?,
        Commands::Movements(args) => handle_movements(&context, args, cli.json).await?,
    }

    Ok(())
}

#[derive(Parser)]
#[command(name = "storefront-cli", about = "Inventory operations for the storefront", version)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations
    Migrate,
    /// Reset every variant's stock to the sum of its ledger movements
    RebuildOnHand,
    /// Set one variant's on-hand to a counted value
    QuickCount(QuickCountArgs),
    /// Apply stock deltas from a CSV file
    BulkAdjust(BulkAdjustArgs),
    #[command(subcommand)]
    Stocktake(StocktakeCommands),
    /// Show ledger movements, newest first
    Movements(MovementsArgs),
}

#[derive(Args)]
struct QuickCountArgs {
    #[arg(long, help = "Product to count")]
    product: Uuid,
    #[arg(long, help = "Variant to count; defaults to the product's first variant")]
    variant: Option<Uuid>,
    #[arg(long, help = "Units physically counted")]
    counted: i32,
}

#[derive(Args)]
struct BulkAdjustArgs {
    #[arg(help = "CSV with productId and delta columns")]
    file: PathBuf,
    #[arg(
        long,
        action = ArgAction::SetTrue,
        help = "Parse and report without writing movements"
    )]
    dry_run: bool,
}

#[derive(Subcommand)]
enum StocktakeCommands {
    Create(StocktakeCreateArgs),
    List,
    Download(StocktakeDownloadArgs),
    Upload(StocktakeUploadArgs),
    Post(StocktakeIdArgs),
    Delete(StocktakeIdArgs),
}

#[derive(Args)]
struct StocktakeCreateArgs {
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "all", help = "all, active or low")]
    scope: StocktakeScope,
}

#[derive(Args)]
struct StocktakeIdArgs {
    id: Uuid,
}

#[derive(Args)]
struct StocktakeDownloadArgs {
    id: Uuid,
    #[arg(long, short, help = "Write the sheet here instead of stdout")]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct StocktakeUploadArgs {
    id: Uuid,
    file: PathBuf,
}

#[derive(Args)]
struct MovementsArgs {
    #[arg(long)]
    product: Option<Uuid>,
    #[arg(long)]
    variant: Option<Uuid>,
    #[arg(long, help = "manualAdjust, manualImport, orderPlaced or orderCancelled")]
    reason: Option<MovementReason>,
    #[arg(long, default_value_t = 50)]
    limit: u64,
}

struct CliContext {
    config: Arc<AppConfig>,
    db: Arc<DbPool>,
    event_sender: Arc<EventSender>,
}

impl CliContext {
    async fn initialize() -> Result<Self> {
        let config = config::load_config().context("failed to load application config")?;
        config::init_tracing(config.log_level(), config.log_json);

        let db_pool = db::establish_connection_from_app_config(&config)
            .await
            .context("failed to connect to database")?;
        let db = Arc::new(db_pool);
        if config.auto_migrate {
            db::run_migrations(&db)
                .await
                .context("failed to run migrations")?;
        }

        let (event_sender, mut event_rx) = EventSender::channel(64);
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                debug!(target: "storefront_cli", event = event.name(), "received event");
            }
        });

        Ok(Self {
            config: Arc::new(config),
            db,
            event_sender: Arc::new(event_sender),
        })
    }

    fn ledger(&self) -> InventoryLedgerService {
        InventoryLedgerService::new(self.db.clone(), self.event_sender.clone(), self.config.clone())
    }

    fn stocktakes(&self) -> StocktakeService {
        let repo = stocktake_repository(&self.config.inventory, self.db.clone());
        StocktakeService::new(
            self.db.clone(),
            repo,
            self.event_sender.clone(),
            self.config.clone(),
        )
    }
}

async fn handle_rebuild(context: &CliContext, json: bool) -> Result<()> {
    let report = context
        .ledger()
        .rebuild_on_hand()
        .await
        .context("failed to rebuild on-hand stock")?;

    if json {
        return print_json(&report);
    }
    println!(
        "Scanned {} variants, corrected {}",
        report.variants_scanned,
        report.corrections.len()
    );
    for c in &report.corrections {
        println!("- {} {} -> {}", c.variant_id, c.previous, c.rebuilt);
    }
    Ok(())
}

async fn handle_quick_count(context: &CliContext, args: QuickCountArgs, json: bool) -> Result<()> {
    let outcome = context
        .ledger()
        .quick_count(args.product, args.variant, args.counted)
        .await
        .context("quick count failed")?;

    if json {
        return print_json(&outcome);
    }
    match outcome {
        QuickCountOutcome::Unchanged { variant_id, stock } => {
            println!("Variant {} already at {}; nothing recorded", variant_id, stock)
        }
        QuickCountOutcome::Adjusted(m) => println!(
            "Variant {}: {} -> {} (movement {})",
            m.variant_id, m.previous_stock, m.new_stock, m.movement_id
        ),
    }
    Ok(())
}

async fn handle_bulk_adjust(context: &CliContext, args: BulkAdjustArgs, json: bool) -> Result<()> {
    let text = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let parsed = parse_bulk_adjust(&text).context("invalid bulk adjustment file")?;

    if args.dry_run {
        if json {
            #[derive(Serialize)]
            struct DryRun<'a> {
                rows: usize,
                skipped: &'a [SkippedRow],
            }
            return print_json(&DryRun {
                rows: parsed.rows.len(),
                skipped: &parsed.skipped,
            });
        }
        println!("{} rows would be applied, {} skipped", parsed.rows.len(), parsed.skipped.len());
        for s in &parsed.skipped {
            println!("- line {}: {}", s.line, s.reason);
        }
        return Ok(());
    }

    let mut report = context
        .ledger()
        .bulk_adjust(parsed.rows)
        .await
        .context("bulk adjustment failed")?;
    report.skipped.splice(0..0, parsed.skipped);

    if json {
        return print_json(&report);
    }
    println!(
        "Applied {} movements, skipped {} rows",
        report.applied.len(),
        report.skipped.len()
    );
    for s in &report.skipped {
        println!("- line {}: {}", s.line, s.reason);
    }
    Ok(())
}

async fn handle_stocktake_command(
    context: &CliContext,
    command: StocktakeCommands,
    json: bool,
) -> Result<()> {
    let service = context.stocktakes();
    match command {
        StocktakeCommands::Create(args) => {
            let session = service
                .create(&args.name, args.scope)
                .await
                .context("failed to create stocktake")?;
            if json {
                return print_json(&session);
            }
            println!("Created stocktake {} ({}, scope {})", session.id, session.name, session.scope);
        }
        StocktakeCommands::List => {
            let sessions = service.list().await.context("failed to list stocktakes")?;
            if json {
                return print_json(&sessions);
            }
            if sessions.is_empty() {
                println!("No stocktakes");
            }
            for s in &sessions {
                println!(
                    "- {} • {} • {} • scope {} • {} lines",
                    s.id,
                    s.name,
                    s.status,
                    s.scope,
                    s.lines.len()
                );
            }
        }
        StocktakeCommands::Download(args) => {
            let sheet = service
                .download(args.id)
                .await
                .context("failed to build count sheet")?;
            match args.output {
                Some(path) => {
                    fs::write(&path, sheet)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("Count sheet written to {}", path.display());
                }
                None => print!("{}", sheet),
            }
        }
        StocktakeCommands::Upload(args) => {
            let text = fs::read_to_string(&args.file)
                .with_context(|| format!("failed to read {}", args.file.display()))?;
            let report = service
                .upload(args.id, &text)
                .await
                .context("failed to upload count sheet")?;
            if json {
                return print_json(&report);
            }
            println!(
                "Stocktake {} is reviewing: {} lines, {} counted, {} skipped",
                report.session.id,
                report.lines,
                report.counted,
                report.skipped.len()
            );
        }
        StocktakeCommands::Post(args) => {
            let session = service.post(args.id).await.context("failed to post stocktake")?;
            if json {
                return print_json(&session);
            }
            let created = session.posted.as_ref().map_or(0, |p| p.movements_created);
            println!("Stocktake {} posted, {} movements created", session.id, created);
        }
        StocktakeCommands::Delete(args) => {
            service
                .delete(args.id)
                .await
                .context("failed to delete stocktake")?;
            println!("Stocktake {} deleted", args.id);
        }
    }
    Ok(())
}

async fn handle_movements(context: &CliContext, args: MovementsArgs, json: bool) -> Result<()> {
    let movements = context
        .ledger()
        .list_movements(MovementFilter {
            product_id: args.product,
            variant_id: args.variant,
            reason: args.reason,
            limit: Some(args.limit),
        })
        .await
        .context("failed to list movements")?;

    if json {
        return print_json(&movements);
    }
    for m in &movements {
        let variant = m.variant_id.map_or_else(|| "-".to_string(), |v| v.to_string());
        println!(
            "{} • {} • variant {} • {:+} • {}{}",
            m.created_at.format("%Y-%m-%d %H:%M:%S"),
            m.reason,
            variant,
            m.delta,
            m.note.as_deref().unwrap_or(""),
            m.order_ref
                .as_deref()
                .map(|r| format!(" [{}]", r))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
