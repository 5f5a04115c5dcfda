// Command-line client for the invariant backend

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::time::Duration;

use suiwatch::{
    analysis::{AnalysisSession, AnalyzeParams},
    cache::{QueryStatus, Snapshot},
    config::{Config, ConfigArgs},
    models::{InvariantRecord, LlmProvider},
    query::QueryData,
    Dashboard, Network, Query,
};

/// suiwatch - Sui invariant monitor client
///
/// Configuration priority: CLI args > Environment variables > Defaults
#[derive(Parser, Debug)]
#[command(name = "suiwatch")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Sui invariant monitor client", long_about = None)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Monitor summary and backend health
    Status,
    /// List every invariant
    Invariants,
    /// Show one invariant
    Invariant { id: String },
    /// Backend health
    Health,
    /// Module metadata of a package
    Metadata { package_id: String, module: String },
    /// Follow status and invariants, logging every change
    Watch {
        /// Switch network after this many seconds
        #[arg(long, requires = "to")]
        switch_after: Option<u64>,
        /// Network to switch to
        #[arg(long)]
        to: Option<Network>,
    },
    /// Start monitoring an object
    Monitor { object_id: String },
    /// Remove an invariant
    Remove { invariant_id: String },
    /// Run AI analysis on a package
    Analyze {
        package_id: String,
        #[arg(long)]
        module: Option<String>,
        /// openrouter or ollama
        #[arg(long, default_value = "ollama")]
        provider: LlmProvider,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, env = "OPENROUTER_API_KEY")]
        api_key: Option<String>,
        #[arg(long, env = "OLLAMA_URL")]
        ollama_url: Option<String>,
        /// Add every suggestion to the monitor
        #[arg(long)]
        accept_all: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Load .env file if it exists (safe to ignore if not found)
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let cfg = Config::from_args(cli.config).context("Failed to load configuration")?;
    cfg.print_summary();

    let dashboard = Dashboard::from_config(&cfg).context("Failed to build HTTP client")?;

    match cli.command {
        Command::Status => {
            let (status, health) = futures::future::join(
                dashboard.fetch(&Query::Status),
                dashboard.fetch(&Query::Health),
            )
            .await;
            if let QueryData::Status(s) = status? {
                println!("network:     {}", dashboard.network());
                println!("all ok:      {}", s.all_ok());
                println!("violations:  {}/{}", s.violation_count, s.total_invariants);
                match s.last_check {
                    Some(at) => println!("last check:  {}", at.to_rfc3339()),
                    None => println!("last check:  never"),
                }
                println!("monitoring:  {}", s.monitored_object_ids.join(", "));
            }
            match health {
                Ok(QueryData::Health(h)) => {
                    println!("backend:     {} (up {}s)", h.status, h.uptime_secs)
                }
                Ok(_) => {}
                Err(e) => log::warn!("health check failed: {e}"),
            }
        }
        Command::Invariants => {
            if let QueryData::Invariants(list) = dashboard.fetch(&Query::Invariants).await? {
                for inv in &list {
                    print_invariant_line(inv);
                }
                if list.is_empty() {
                    println!("no invariants");
                }
            }
        }
        Command::Invariant { id } => {
            if let QueryData::Invariant(inv) = dashboard.fetch(&Query::invariant(id)).await? {
                print_invariant_line(&inv);
                println!("  {}", inv.description);
                println!("  formula: {}", inv.computation.formula);
                for (name, value) in &inv.computation.inputs {
                    println!("    {name} = {value}");
                }
                println!("  result:  {}", inv.computation.result);
                println!("  evaluated at {}", inv.evaluated_at.to_rfc3339());
            }
        }
        Command::Health => {
            if let QueryData::Health(h) = dashboard.fetch(&Query::Health).await? {
                println!("{} (up {}s)", h.status, h.uptime_secs);
            }
        }
        Command::Metadata { package_id, module } => {
            let query = Query::module_metadata(package_id, module);
            if let QueryData::ModuleMetadata(m) = dashboard.fetch(&query).await? {
                println!("{}::{}", m.package_id, m.module_name);
                for s in &m.structs {
                    println!("  struct {} has {}", s.name, s.abilities.join(", "));
                    for f in &s.fields {
                        println!("    {}: {}", f.name, f.type_);
                    }
                }
                for f in &m.functions {
                    let entry = if f.is_entry { " entry" } else { "" };
                    println!(
                        "  {}{entry} fun {}({}) -> ({})",
                        f.visibility,
                        f.name,
                        f.parameters.join(", "),
                        f.return_types.join(", ")
                    );
                }
            }
        }
        Command::Watch { switch_after, to } => {
            watch(&dashboard, switch_after.zip(to)).await?;
        }
        Command::Monitor { object_id } => {
            let out = dashboard.add_monitored_object(&object_id).await?;
            println!("{}", out.message);
            if let Some(t) = out.entity.object_type {
                println!("type: {t}");
            }
        }
        Command::Remove { invariant_id } => {
            println!("{}", dashboard.remove_invariant(&invariant_id).await?);
        }
        Command::Analyze {
            package_id,
            module,
            provider,
            model,
            api_key,
            ollama_url,
            accept_all,
        } => {
            let params = AnalyzeParams {
                package_id,
                module_name: module,
                provider,
                model,
                api_key,
                ollama_url,
            };
            let mut session = dashboard.analyze(&params).await?;
            println!("{}", session.response().message);
            print_session(&session);
            if accept_all {
                accept_everything(&dashboard, &mut session).await;
            }
        }
    }
    Ok(())
}

fn print_invariant_line(inv: &InvariantRecord) {
    match &inv.violation_reason {
        Some(reason) => println!("{:<9} {} {}: {reason}", inv.status.to_string(), inv.id, inv.name),
        None => println!("{:<9} {} {}", inv.status.to_string(), inv.id, inv.name),
    }
}

fn print_session(session: &AnalysisSession) {
    for result in session.results() {
        println!("\n{}::{}", result.package_id, result.module_name);
        if !result.analysis_notes.is_empty() {
            println!("  {}", result.analysis_notes);
        }
        for s in &result.suggested_invariants {
            println!("  [{}] {} {}: {}", s.severity, s.id, s.name, s.formula);
        }
    }
}

async fn accept_everything(dashboard: &Dashboard, session: &mut AnalysisSession) {
    let modules: Vec<String> = session
        .results()
        .iter()
        .filter(|r| !r.suggested_invariants.is_empty())
        .map(|r| r.module_name.clone())
        .collect();
    for module in modules {
        match session.accept_all(dashboard.mutations(), &module).await {
            Ok(out) => println!(
                "{module}: added {} of {} ({})",
                out.added_count, out.submitted, out.message
            ),
            Err(e) => log::error!("{module}: {e}"),
        }
    }
}

fn describe(snapshot: &Snapshot) -> String {
    let state = match snapshot.status {
        QueryStatus::Fresh => "fresh",
        QueryStatus::Stale => "stale",
        QueryStatus::Loading => "loading",
        QueryStatus::Error => "error",
    };
    let detail = match &snapshot.data {
        Some(QueryData::Status(s)) => format!(
            "{}/{} violated, all_ok={}",
            s.violation_count,
            s.total_invariants,
            s.all_ok()
        ),
        Some(QueryData::Invariants(list)) => format!(
            "{} invariants, {} violated",
            list.len(),
            list.iter().filter(|i| i.is_violated()).count()
        ),
        Some(_) => String::new(),
        None => "no data".to_string(),
    };
    match &snapshot.error {
        Some(e) => format!("[{}] {state}: {detail} (last error: {e})", snapshot.network),
        None => format!("[{}] {state}: {detail}", snapshot.network),
    }
}

async fn watch(dashboard: &Dashboard, switch: Option<(u64, Network)>) -> Result<()> {
    let mut status = dashboard.subscribe(Query::Status);
    let mut invariants = dashboard.subscribe(Query::Invariants);

    let switch_timer = tokio::time::sleep(
        switch
            .map(|(secs, _)| Duration::from_secs(secs))
            .unwrap_or(Duration::MAX / 4),
    );
    tokio::pin!(switch_timer);
    let mut switched = switch.is_none();

    log::info!("watching on {}; ctrl-c to stop", dashboard.network());
    loop {
        tokio::select! {
            res = status.changed() => log::info!("status {}", describe(&res?)),
            res = invariants.changed() => log::info!("invariants {}", describe(&res?)),
            _ = &mut switch_timer, if !switched => {
                switched = true;
                if let Some((_, network)) = switch {
                    dashboard.switch_network(network);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("stopping");
                break;
            }
        }
    }
    Ok(())
}
