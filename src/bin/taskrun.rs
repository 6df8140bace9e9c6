//! taskrun CLI: run the controller, manage work requests, or run the demo.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use taskrun_rs::agent::{AgentConfig, UnitAgent};
use taskrun_rs::config::Config;
use taskrun_rs::config::secrets::ExposeSecret;
use taskrun_rs::db::Db;
use taskrun_rs::engine::{ControlConfig, Controller};
use taskrun_rs::model::*;
use taskrun_rs::storage::memory::MemoryStore;
use taskrun_rs::storage::{Clients, ObjectStore, RequestClient, UnitClient, WatchSource};
use taskrun_rs::telemetry::{TelemetryConfig, init_telemetry};
use taskrun_rs::wait::{wait_for_condition, wait_until_done};
use tokio::sync::watch;
use tokio::task::JoinSet;

#[derive(Parser)]
#[command(name = "taskrun", about = "Exactly one execution unit per work request")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller against Postgres
    Serve {
        /// Controller config (TOML); defaults apply when omitted
        #[arg(long)]
        config: Option<PathBuf>,
        /// Also run the local unit agent so units make progress
        #[arg(long)]
        agent: bool,
    },
    /// Work request operations
    Run {
        #[command(subcommand)]
        action: RunAction,
    },
    /// List the execution units owned by a request
    Units {
        /// Request key as namespace/name
        key: ObjectKey,
    },
    /// Submit many requests at once against an in-memory store and check
    /// that each ends with exactly one unit
    Demo {
        #[arg(long, default_value_t = 25)]
        count: usize,
        #[arg(long, default_value_t = 4)]
        workers: usize,
        /// Seconds to wait for every request to finish
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
}

#[derive(Subcommand)]
enum RunAction {
    /// Submit a new work request
    Submit {
        /// Request key as namespace/name
        key: ObjectKey,
        /// A step as name=image; repeat for more steps
        #[arg(long = "step", value_parser = parse_step, required = true)]
        steps: Vec<Step>,
        /// Block until the request finishes, up to this many seconds
        #[arg(long)]
        wait: Option<u64>,
    },
    /// List work requests
    List,
    /// Show a work request
    Show { key: ObjectKey },
    /// Delete a work request and its units
    Delete { key: ObjectKey },
}

fn parse_step(s: &str) -> Result<Step, String> {
    match s.split_once('=') {
        Some((name, image)) if !name.is_empty() && !image.is_empty() => Ok(Step::new(name, image)),
        _ => Err(format!("expected name=image, got '{s}'")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, agent } => cmd_serve(config, agent).await,
        Command::Demo {
            count,
            workers,
            timeout,
        } => cmd_demo(count, workers, Duration::from_secs(timeout)).await,
        Command::Run { action } => {
            let db = connect().await?;
            match action {
                RunAction::Submit { key, steps, wait } => {
                    cmd_run_submit(&db, key, steps, wait.map(Duration::from_secs)).await
                }
                RunAction::List => cmd_run_list(&db).await,
                RunAction::Show { key } => cmd_run_show(&db, &key).await,
                RunAction::Delete { key } => {
                    db.delete_request(&key).await?;
                    println!("Deleted: {key}");
                    Ok(())
                }
            }
        }
        Command::Units { key } => {
            let db = connect().await?;
            cmd_units(&db, &key).await
        }
    }
}

async fn connect() -> anyhow::Result<Db> {
    let config = Config::from_env()?;
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    Ok(db)
}

async fn cmd_serve(config_path: Option<PathBuf>, with_agent: bool) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(
        TelemetryConfig::new("taskrun")
            .with_endpoint(config.otel_endpoint.clone())
            .with_log_level(config.log_level.clone()),
    )?;

    let mut control = match config_path {
        Some(path) => ControlConfig::from_toml_file(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ControlConfig::default(),
    };
    config.apply_to(&mut control);

    let db = Arc::new(Db::connect(config.database_url.expose_secret()).await?);
    db.migrate().await?;
    db.health_check().await?;
    let listener = db.start_watch().await?;

    let controller = Controller::new(Clients::from_store(Arc::clone(&db)), control);
    let (stop_agent, agent_shutdown) = watch::channel(false);
    let agent = with_agent.then(|| {
        let store: Arc<dyn ObjectStore> = db.clone();
        tokio::spawn(UnitAgent::new(store, AgentConfig::default()).run(agent_shutdown))
    });

    let ctrl = controller.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl.shutdown();
    });

    controller.run().await?;
    stop_agent.send_replace(true);
    if let Some(agent) = agent {
        agent.await??;
    }
    listener.abort();
    Ok(())
}

async fn cmd_run_submit(
    db: &Db,
    key: ObjectKey,
    steps: Vec<Step>,
    wait: Option<Duration>,
) -> anyhow::Result<()> {
    let new = NewWorkRequest {
        key,
        spec: RequestSpec { steps },
    };
    let request = db.create_request(new).await?;
    println!("Created: {} (uid: {})", request.key, request.uid);

    if let Some(timeout) = wait {
        let done = wait_until_done(db, &request.key, timeout).await?;
        print_condition(&done);
    }
    Ok(())
}

async fn cmd_run_list(db: &Db) -> anyhow::Result<()> {
    let requests = db.list_requests().await?;
    if requests.is_empty() {
        println!("No work requests found.");
        return Ok(());
    }

    println!(
        "{:<40}  {:<10}  {:<14}  {:<36}  CREATED",
        "KEY", "SUCCEEDED", "REASON", "UNIT"
    );
    println!("{}", "-".repeat(120));
    for request in &requests {
        let (status, reason) = match request.succeeded() {
            Some(c) => (c.status.to_string(), c.reason.as_str()),
            None => ("-".to_string(), "-"),
        };
        let unit = request
            .status
            .unit
            .as_ref()
            .map(|u| u.name.as_str())
            .unwrap_or("-");
        println!(
            "{:<40}  {:<10}  {:<14}  {:<36}  {}",
            request.key.to_string(),
            status,
            reason,
            unit,
            request.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} request(s)", requests.len());
    Ok(())
}

async fn cmd_run_show(db: &Db, key: &ObjectKey) -> anyhow::Result<()> {
    let request = db.get_request(key).await?;

    println!("Key:        {}", request.key);
    println!("UID:        {}", request.uid);
    println!("Version:    {}", request.version);
    println!("Generation: {}", request.generation);
    println!("Created:    {}", request.created_at);
    for step in &request.spec.steps {
        println!("Step:       {} ({})", step.name, step.image);
    }
    match &request.status.unit {
        Some(unit) => println!("Unit:       {} ({})", unit.name, unit.uid),
        None => println!("Unit:       -"),
    }
    print_condition(&request);
    Ok(())
}

async fn cmd_units(db: &Db, key: &ObjectKey) -> anyhow::Result<()> {
    let request = db.get_request(key).await?;
    let units = db.list_owned_units(&OwnerRef::of(&request)).await?;
    if units.is_empty() {
        println!("No units for {key}.");
        return Ok(());
    }
    for unit in &units {
        println!(
            "{:<48}  {:<10}  {}",
            unit.key.to_string(),
            unit.phase,
            unit.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn print_condition(request: &WorkRequest) {
    match request.succeeded() {
        Some(c) => {
            println!("Succeeded:  {} ({})", c.status, c.reason);
            if !c.message.is_empty() {
                println!("Message:    {}", c.message);
            }
        }
        None => println!("Succeeded:  -"),
    }
}

async fn cmd_demo(count: usize, workers: usize, timeout: Duration) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig::new("taskrun-demo"))?;

    let store = Arc::new(MemoryStore::new());
    let controller = Controller::new(
        Clients::from_store(Arc::clone(&store)),
        ControlConfig {
            workers,
            ..ControlConfig::default()
        },
    );
    let running = controller.spawn();
    let (stop_agent, agent_shutdown) = watch::channel(false);
    let agent_store: Arc<dyn ObjectStore> = store.clone();
    let agent = tokio::spawn(UnitAgent::new(agent_store, AgentConfig::default()).run(agent_shutdown));

    let started = Instant::now();
    let mut submits = JoinSet::new();
    for i in 0..count {
        let store = Arc::clone(&store);
        submits.spawn(async move {
            store
                .create_request(
                    NewWorkRequest::new("demo", format!("run-{i:03}"))
                        .step(Step::new("main", "busybox").command(["true"])),
                )
                .await
        });
    }
    let mut keys = Vec::with_capacity(count);
    while let Some(joined) = submits.join_next().await {
        keys.push(joined??.key);
    }
    keys.sort();

    let mut bad = 0;
    for key in &keys {
        let request = wait_for_condition(store.as_ref(), key, timeout, WorkRequest::is_done).await?;
        let units = store.list_owned_units(&OwnerRef::of(&request)).await?;
        let ok = units.len() == 1
            && request
                .succeeded()
                .is_some_and(|c| c.status == ConditionStatus::True);
        if !ok {
            bad += 1;
        }
        println!(
            "{:<16}  units={}  {}",
            key.to_string(),
            units.len(),
            if ok { "ok" } else { "FAILED" }
        );
    }

    controller.shutdown();
    stop_agent.send_replace(true);
    running.await??;
    agent.await??;

    println!(
        "\n{} request(s), {} with problems, {:.2}s",
        keys.len(),
        bad,
        started.elapsed().as_secs_f64()
    );
    if bad > 0 {
        anyhow::bail!("{bad} request(s) did not end with exactly one succeeded unit");
    }
    Ok(())
}
