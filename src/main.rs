use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};

use cv_trace_dashboard::config::{self, AppConfig};
use cv_trace_dashboard::connection::ConnectionManager;
use cv_trace_dashboard::logging::init_logging;
use cv_trace_dashboard::mapping::{MappingCache, MappingTables};
use cv_trace_dashboard::media::MediaService;
use cv_trace_dashboard::query_service::{FilterInput, InferenceTables, QueryService};
use cv_trace_dashboard::secrets::Secrets;
use cv_trace_dashboard::storage::GcsFetcher;
use cv_trace_dashboard::ui::{self, formatters, AppState};
use cv_trace_dashboard::warehouse::DatabricksConnector;

#[derive(Parser)]
#[command(name = "cv-trace-dashboard", version)]
#[command(about = "Stage 1 / Stage 2 CV pipeline trace dashboard backed by Databricks SQL")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the web dashboard (default)
    Serve {
        #[arg(long)] port:      Option<u16>,
        #[arg(long)] root_path: Option<String>,
    },

    /// Run one linked query and print the results
    Query(QueryArgs),

    /// Print the tenant / farm / camera mapping tables
    Mappings,

    /// Validate configuration and warehouse connectivity
    Check,
}

#[derive(Args)]
struct QueryArgs {
    /// YYYY-MM-DD
    #[arg(long)] date: String,
    #[arg(long)] start_time: Option<String>,
    #[arg(long)] end_time: Option<String>,
    #[arg(long)] tenant: Option<String>,
    #[arg(long)] farm: Option<String>,
    #[arg(long)] camera: Option<String>,
    #[arg(long)] forward_only: bool,
    #[arg(short, long)] limit: Option<u32>,
    #[arg(long)] json: bool,
}

struct Services {
    conn: Arc<ConnectionManager>,
    query: Arc<QueryService>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let secrets = Secrets::load(&Secrets::default_path()).context("loading secrets")?;
    let mut cfg = config::load_config(&secrets).context("loading configuration")?;

    match cli.command.unwrap_or(Command::Serve { port: None, root_path: None }) {
        Command::Serve { port, root_path } => {
            if let Some(p) = port      { cfg.server.port = p; }
            if let Some(r) = root_path { cfg.server.root_path = Some(r); }
            cfg.validate()?;
            print_startup_info(&cfg);
            serve(cfg).await?;
        }

        Command::Query(args) => {
            cfg.validate()?;
            let services = connect(&cfg).await?;
            let filters = FilterInput {
                date: Some(args.date),
                start_time: args.start_time,
                end_time: args.end_time,
                tenant: args.tenant,
                farm: args.farm,
                camera: args.camera,
                forward_only: args.forward_only,
                limit: args.limit,
            }
            .into_filters(cfg.server.query_limit)?;

            let mappings = services.query.mappings();
            let rows = services.query.query(&filters).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print_table(&formatters::display_rows(&rows, mappings));
                println!();
                println!("{}", formatters::status_line(rows.len(), &filters.summary(mappings)));
            }
        }

        Command::Mappings => {
            cfg.validate()?;
            let services = connect(&cfg).await?;
            let m = services.query.mappings();
            println!("{:<24} {:<32} {}", "Tenant ID", "Name", "Slug");
            println!("{}", "─".repeat(80));
            for t in m.tenants() {
                println!("{:<24} {:<32} {}", t.id, t.name, t.slug.as_deref().unwrap_or(""));
            }
            println!();
            println!("{:<24} {:<32} {}", "Farm ID", "Name", "Tenant");
            println!("{}", "─".repeat(80));
            for f in m.farms() {
                let tenant = f.tenant_id.as_deref().map(|t| m.tenant_name(t)).unwrap_or_default();
                println!("{:<24} {:<32} {}", f.id, f.name, tenant);
            }
            println!();
            println!("{:<24} {:<32} {}", "Camera ID", "Name", "Farm");
            println!("{}", "─".repeat(80));
            for c in m.cameras() {
                let farm = c.farm_id.as_deref().map(|f| m.farm_name(f)).unwrap_or_default();
                println!("{:<24} {:<32} {}", c.id, c.name, farm);
            }
        }

        Command::Check => {
            cfg.validate()?;
            print_startup_info(&cfg);
            let services = connect(&cfg).await?;
            let m = services.query.mappings();
            println!("  Warehouse: {} ({})", services.conn.describe(), services.conn.state());
            println!(
                "  Mappings:  {} tenants, {} farms, {} cameras",
                m.tenants().len(),
                m.farms().len(),
                m.cameras().len()
            );
            println!("  OK");
        }
    }
    Ok(())
}

/// Warehouse session, mapping cache and query service. Both failures are fatal.
async fn connect(cfg: &AppConfig) -> Result<Services> {
    let connector = DatabricksConnector::from_config(&cfg.databricks)?;
    let conn = Arc::new(
        ConnectionManager::init(Arc::new(connector))
            .await
            .context("connecting to the Databricks SQL warehouse")?,
    );
    let mappings = Arc::new(
        MappingCache::load(&conn, &MappingTables::from_config(&cfg.databricks))
            .await
            .context("loading tenant/farm/camera mappings")?,
    );
    let query = Arc::new(QueryService::new(
        Arc::clone(&conn),
        mappings,
        InferenceTables::from_config(&cfg.databricks),
    ));
    Ok(Services { conn, query })
}

async fn serve(cfg: AppConfig) -> Result<()> {
    let services = connect(&cfg).await?;
    let fetcher = Arc::new(GcsFetcher::from_config(&cfg.storage));
    let media = Arc::new(MediaService::new(fetcher, &cfg.media).context("preparing media cache")?);

    let state = Arc::new(AppState::new(
        services.conn,
        services.query,
        Arc::clone(&media),
        cfg.server.normalized_root_path(),
        cfg.server.query_limit,
    ));

    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", cfg.server.host, cfg.server.port))?;

    ui::serve(state, addr, shutdown_signal()).await?;

    match media.purge().await {
        Ok(n) => info!("Media cache purged ({} bundles)", n),
        Err(e) => warn!("Media cache purge failed: {}", e),
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

fn print_table(rows: &[formatters::DisplayRow]) {
    let mut widths: Vec<usize> = formatters::COLUMNS.iter().map(|c| c.chars().count()).collect();
    for row in rows {
        for (w, cell) in widths.iter_mut().zip(row.cells()) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let rule = |l: &str, m: &str, r: &str| {
        let parts: Vec<String> = widths.iter().map(|w| "─".repeat(w + 2)).collect();
        format!("{}{}{}", l, parts.join(m), r)
    };
    let line = |cells: &[&str]| {
        let parts: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!(" {}{} ", c, " ".repeat(w - c.chars().count())))
            .collect();
        format!("│{}│", parts.join("│"))
    };

    println!("{}", rule("┌", "┬", "┐"));
    println!("{}", line(&formatters::COLUMNS));
    println!("{}", rule("├", "┼", "┤"));
    for row in rows {
        println!("{}", line(&row.cells()));
    }
    println!("{}", rule("└", "┴", "┘"));
}

fn print_startup_info(cfg: &AppConfig) {
    let db = &cfg.databricks;
    let auth = match db.credentials() {
        Some(config::WarehouseCredentials::Token(_)) => "personal access token",
        Some(config::WarehouseCredentials::OAuth { .. }) => "OAuth M2M",
        None => "none",
    };
    let gcs = if cfg.storage.has_credentials() { "service account" } else { "ambient" };
    let root = cfg.server.normalized_root_path().unwrap_or_else(|| "/".into());

    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║            CV PIPELINE TRACE DASHBOARD                   ║");
    println!("╠══════════════════════════════════════════════════════════╣");
    println!("  Warehouse: {} {}", db.host.as_deref().unwrap_or("?"), db.http_path.as_deref().unwrap_or("?"));
    println!("  Auth:      {}", auth);
    println!("  Stage 1:   {}", db.full_stage1_table());
    println!("  Stage 2:   {}", db.full_stage2_table());
    println!("  Mappings:  {}.{}", db.catalog, db.mapping_schema);
    println!("  GCS:       {}", gcs);
    println!("  Media:     {} fps GIF, max {} bundles", cfg.media.gif_fps, cfg.media.max_bundles);
    println!("  Server:    http://{}:{}{}", cfg.server.host, cfg.server.port, root);
    println!("╚══════════════════════════════════════════════════════════╝");
}
