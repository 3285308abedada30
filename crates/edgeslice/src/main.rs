use clap::{Parser, Subcommand};
use edgeslice_controller::{
    Clients, Driver, DriverConfig, EventPruner, EventPrunerConfig, ProvisioningMode, QueueConfig,
    SliceClaimReconciler, SliceClaimReconcilerConfig, SliceReconciler, SliceReconcilerConfig,
    WatchRouter, WorkQueue,
};
use edgeslice_core::{
    Namespace, Node, Pod, Resource, ResourceQuota, Slice, SliceClaim, SubNamespace,
};
use edgeslice_store::{ListParams, ResourceStore};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "edgeslice",
    about = "EdgeNet slice reservation controllers",
    long_about = "EdgeNet slice reservation controllers\n\n\
        Every command opens the redb database file exclusively. While `run` \
        holds it, `apply` and `status` against the same file fail to open it; \
        stop the controllers first."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the Slice and SliceClaim controllers
    ///
    /// Holds an exclusive lock on the database file until it exits.
    Run {
        /// Path to the redb database file, locked while the controllers run
        #[arg(long, env = "EDGESLICE_DATA_DIR", default_value = "./edgeslice.redb")]
        data_dir: PathBuf,
        /// Workers reconciling Slices
        #[arg(long, env = "EDGESLICE_SLICE_WORKERS", default_value_t = 2)]
        slice_workers: usize,
        /// Workers reconciling SliceClaims
        #[arg(long, env = "EDGESLICE_CLAIM_WORKERS", default_value_t = 2)]
        claim_workers: usize,
        /// Dynamic creates missing slices for claims, Manual waits for them
        #[arg(long, env = "EDGESLICE_PROVISIONING", default_value = "Dynamic")]
        provisioning: ProvisioningMode,
        /// Seed for node selection; random when unset
        #[arg(long, env = "EDGESLICE_RNG_SEED")]
        rng_seed: Option<u64>,
        /// Seconds an event is kept before it is pruned
        #[arg(long, env = "EDGESLICE_EVENT_TTL_SECS", default_value_t = 3600)]
        event_ttl_secs: u64,
    },
    /// Create or update objects from a multi-document YAML manifest
    ///
    /// Needs the database file unlocked, so it cannot run next to `run`.
    Apply {
        /// Path to the redb database file; must not be open in `run`
        #[arg(long, env = "EDGESLICE_DATA_DIR", default_value = "./edgeslice.redb")]
        data_dir: PathBuf,
        /// Manifest to apply
        #[arg(short = 'f', long = "filename")]
        file: PathBuf,
    },
    /// Print the state of every Slice and SliceClaim
    ///
    /// Needs the database file unlocked, so it cannot run next to `run`.
    Status {
        /// Path to the redb database file; must not be open in `run`
        #[arg(long, env = "EDGESLICE_DATA_DIR", default_value = "./edgeslice.redb")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            data_dir,
            slice_workers,
            claim_workers,
            provisioning,
            rng_seed,
            event_ttl_secs,
        } => {
            let pruning = EventPrunerConfig {
                ttl: std::time::Duration::from_secs(event_ttl_secs),
                ..Default::default()
            };
            run_controllers(data_dir, slice_workers, claim_workers, provisioning, rng_seed, pruning)
                .await
        }
        Commands::Apply { data_dir, file } => apply_manifest(data_dir, file),
        Commands::Status { data_dir } => print_status(data_dir),
    }
}

/// Run both controllers and the watch router until ctrl-c
async fn run_controllers(
    data_dir: PathBuf,
    slice_workers: usize,
    claim_workers: usize,
    provisioning: ProvisioningMode,
    rng_seed: Option<u64>,
    pruning: EventPrunerConfig,
) -> miette::Result<()> {
    info!(
        "Starting edgeslice controllers (provisioning: {}, store: {})",
        provisioning,
        data_dir.display()
    );

    let store = open_store(&data_dir)?;
    let events = store.subscribe();
    let clients = Clients::from_store(store);

    let slice_queue = Arc::new(WorkQueue::new("slice", QueueConfig::default()));
    let claim_queue = Arc::new(WorkQueue::new("sliceclaim", QueueConfig::default()));

    let slices = Arc::new(SliceReconciler::new(
        clients.clone(),
        SliceReconcilerConfig { rng_seed },
    ));
    let claims = Arc::new(SliceClaimReconciler::new(
        clients.clone(),
        SliceClaimReconcilerConfig { provisioning },
    ));

    let token = CancellationToken::new();

    let slice_driver = Driver::new(
        slices.clone(),
        slice_queue.clone(),
        DriverConfig {
            workers: slice_workers,
        },
    );
    let slice_token = token.clone();
    let slice_handle = tokio::spawn(async move {
        if let Err(e) = slice_driver.run(slice_token).await {
            error!("Slice controller error: {}", e);
        }
    });

    let claim_driver = Driver::new(
        claims,
        claim_queue.clone(),
        DriverConfig {
            workers: claim_workers,
        },
    );
    let claim_token = token.clone();
    let claim_handle = tokio::spawn(async move {
        if let Err(e) = claim_driver.run(claim_token).await {
            error!("SliceClaim controller error: {}", e);
        }
    });

    let pruner = EventPruner::new(clients.events.clone(), pruning);
    let pruner_token = token.clone();
    let pruner_handle = tokio::spawn(async move {
        if let Err(e) = pruner.run(pruner_token).await {
            error!("Event pruner error: {}", e);
        }
    });

    let router = WatchRouter::new(clients, slice_queue, claim_queue, slices);
    let router_token = token.clone();
    let router_handle = tokio::spawn(async move {
        if let Err(e) = router.run(events, router_token).await {
            error!("Watch router error: {}", e);
        }
    });

    info!("All controllers started");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("Failed to listen for ctrl-c: {}", e))?;

    info!("Shutting down gracefully...");
    token.cancel();

    let shutdown_timeout = std::time::Duration::from_secs(5);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        let _ = tokio::join!(slice_handle, claim_handle, router_handle, pruner_handle);
    })
    .await;

    info!("Shutdown complete");

    Ok(())
}

/// Create or update every document of a manifest
fn apply_manifest(data_dir: PathBuf, file: PathBuf) -> miette::Result<()> {
    let store = open_store(&data_dir)?;
    let text = std::fs::read_to_string(&file)
        .map_err(|e| miette::miette!("Failed to read '{}': {}", file.display(), e))?;

    for document in serde_yaml::Deserializer::from_str(&text) {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| miette::miette!("Invalid YAML in '{}': {}", file.display(), e))?;
        if value.is_null() {
            continue;
        }
        let kind = value
            .get("kind")
            .and_then(|k| k.as_str())
            .ok_or_else(|| miette::miette!("Manifest document without a kind"))?
            .to_string();

        match kind.as_str() {
            "Node" => apply_object::<Node>(&store, value)?,
            "Pod" => apply_object::<Pod>(&store, value)?,
            "Namespace" => apply_object::<Namespace>(&store, value)?,
            "ResourceQuota" => apply_object::<ResourceQuota>(&store, value)?,
            "Slice" => apply_object::<Slice>(&store, value)?,
            "SliceClaim" => apply_object::<SliceClaim>(&store, value)?,
            "SubNamespace" => apply_object::<SubNamespace>(&store, value)?,
            other => return Err(miette::miette!("Unsupported kind '{}'", other)),
        }
    }
    Ok(())
}

/// Create `value` as a `T`, or replace the stored object of the same name
fn apply_object<T: Resource>(store: &ResourceStore, value: serde_yaml::Value) -> miette::Result<()> {
    let has_status = value.get("status").is_some();
    let mut resource: T = serde_yaml::from_value(value)
        .map_err(|e| miette::miette!("Invalid {} manifest: {}", T::KIND, e))?;
    let namespace = resource.metadata().namespace.clone();
    let name = resource.name().to_string();

    match store.get::<T>(namespace.as_deref(), &name) {
        Ok(existing) => {
            resource.metadata_mut().resource_version = existing.metadata().resource_version.clone();
            let updated = store.update(&resource)?;
            if has_status {
                resource.metadata_mut().resource_version = updated.metadata().resource_version.clone();
                store.update_status(&resource)?;
            }
            println!("{} {} configured", T::KIND, name);
        }
        Err(e) if e.is_not_found() => {
            store.create(&resource)?;
            println!("{} {} created", T::KIND, name);
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Print every Slice and SliceClaim with its state
fn print_status(data_dir: PathBuf) -> miette::Result<()> {
    let store = open_store(&data_dir)?;

    let slices: Vec<Slice> = store.list(None, &ListParams::default())?;
    println!("{:<32} {:<12} {:<32} MESSAGE", "SLICE", "STATE", "CLAIM");
    for slice in &slices {
        let claim = slice
            .spec
            .claim_ref
            .as_ref()
            .map(|r| {
                format!(
                    "{}/{}",
                    r.namespace.as_deref().unwrap_or_default(),
                    r.name.as_deref().unwrap_or_default()
                )
            })
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<32} {:<12} {:<32} {}",
            slice.name(),
            slice.status.state.as_str(),
            claim,
            slice.status.message
        );
    }

    let claims: Vec<SliceClaim> = store.list(None, &ListParams::default())?;
    println!();
    println!("{:<16} {:<32} {:<12} {:<32} MESSAGE", "NAMESPACE", "CLAIM", "STATE", "SLICE");
    for claim in &claims {
        println!(
            "{:<16} {:<32} {:<12} {:<32} {}",
            claim.metadata.namespace.as_deref().unwrap_or_default(),
            claim.name(),
            claim.status.state.as_str(),
            claim.spec.slice_name,
            claim.status.message
        );
    }
    Ok(())
}

fn open_store(data_dir: &Path) -> miette::Result<Arc<ResourceStore>> {
    let store = ResourceStore::open(data_dir).map_err(|e| {
        miette::miette!(
            help = "redb locks the file; stop `edgeslice run` on the same file first",
            "Failed to open storage at '{}': {}",
            data_dir.display(),
            e
        )
    })?;
    Ok(Arc::new(store))
}
