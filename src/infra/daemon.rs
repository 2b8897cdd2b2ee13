// src/infra/daemon.rs — `gentask serve`: the long-running service
//
// Owns the store actor and spawns the worker pool, the poll driver, the
// leader-gated reaper and the HTTP API. Ctrl-C flips a shared shutdown
// signal and waits for the background jobs to wind down.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::api;
use crate::core::lifecycle::{Repositories, TaskManager};
use crate::core::materializer::ResultMaterializer;
use crate::core::reaper::{run_reaper, ZombieReaper};
use crate::core::worker::{run_poll_driver, run_workers, TaskLocks, TaskQueue};
use crate::infra::config::Config;
use crate::infra::errors::GenTaskError;
use crate::infra::paths;
use crate::provider::ProviderRegistry;
use crate::rules::{CachedRules, RuleSource, StaticRules};
use crate::storage::LocalObjectStorage;
use crate::store::{spawn_store_server, Database, StoreHandle};

/// Open the configured database (migrating it) behind a store actor.
pub fn open_store(config: &Config) -> Result<(StoreHandle, tokio::task::JoinHandle<()>), GenTaskError> {
    let db = Database::open(&config.database.resolved_path())?;
    Ok(spawn_store_server(db.store))
}

/// Static rules from `[rules].file`, else database rules behind a TTL cache.
pub fn build_rules(config: &Config, store: &StoreHandle) -> Result<Arc<dyn RuleSource>, GenTaskError> {
    match config.rules.file {
        Some(ref path) => {
            let rules = StaticRules::load(path)?;
            tracing::info!(path = %path.display(), rules = rules.len(), "Loaded static rules");
            Ok(Arc::new(rules))
        }
        None => Ok(Arc::new(CachedRules::new(
            store.clone(),
            Duration::from_secs(config.rules.cache_ttl_secs),
        ))),
    }
}

fn instance_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("gentask-{}-{}", std::process::id(), &suffix[..8])
}

/// Run until Ctrl-C.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    paths::ensure_dirs().await?;
    tracing::info!("gentask starting...");

    let (store, mut store_task) = open_store(&config)?;
    let rules = build_rules(&config, &store)?;

    let providers = ProviderRegistry::from_config(&config.providers)?;
    if providers.is_empty() {
        tracing::warn!("No providers configured. Every task will be rejected.");
    }

    let objects = Arc::new(
        LocalObjectStorage::new(
            config.storage.resolved_root(),
            &config.storage.public_base_url,
        )
        .with_durable_hosts(config.storage.durable_hosts.clone()),
    );
    let materializer = ResultMaterializer::new(objects.clone(), config.materializer.clone());

    let (queue, queue_rx) = TaskQueue::channel(config.worker.queue_capacity);
    let manager = Arc::new(TaskManager::new(
        Repositories::from_store(&store, rules),
        providers,
        materializer,
        queue,
        config.worker.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut jobs = Vec::new();

    jobs.push(tokio::spawn(run_workers(
        manager.clone(),
        queue_rx,
        config.worker.concurrency,
        TaskLocks::new(),
        shutdown_rx.clone(),
    )));
    jobs.push(tokio::spawn(run_poll_driver(
        manager.clone(),
        Duration::from_secs(config.worker.poll_interval_secs),
        config.worker.poll_batch,
        shutdown_rx.clone(),
    )));

    if config.reaper.enabled {
        let reaper = ZombieReaper::new(Arc::new(store.clone()), config.reaper.batch_size);
        jobs.push(tokio::spawn(run_reaper(
            reaper,
            Arc::new(store.clone()),
            instance_id(),
            config.reaper.clone(),
            shutdown_rx.clone(),
        )));
    } else {
        tracing::warn!("Zombie reaper disabled; lost tasks stay in flight until swept manually");
    }

    if config.api.enabled {
        let api_state = api::ApiState {
            manager: manager.clone(),
            objects: Some(objects),
            token: config.api.token.clone(),
        };
        let api_cfg = config.api.clone();
        let api_shutdown = shutdown_rx.clone();
        jobs.push(tokio::spawn(async move {
            if let Err(e) = api::start_server(&api_cfg, api_state, api_shutdown).await {
                tracing::error!("API server failed: {}", e);
            }
        }));
    }

    // Tasks left PENDING by a previous run never got a worker
    if let Err(e) = manager.requeue_pending(config.worker.poll_batch).await {
        tracing::warn!(error = %e, "Could not requeue pending tasks");
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    println!("gentask running. Press Ctrl+C to stop.");

    tokio::select! {
        _ = &mut shutdown => {
            tracing::info!("Shutdown signal received");
            println!("\nShutting down...");
        }
        _ = &mut store_task => {
            tracing::error!("Store server exited unexpectedly");
        }
    }

    let _ = shutdown_tx.send(true);
    for job in jobs {
        if let Err(e) = job.await {
            tracing::warn!(error = %e, "Background job ended abnormally");
        }
    }

    tracing::info!("gentask stopped.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_ids_are_unique() {
        let a = instance_id();
        assert!(a.starts_with(&format!("gentask-{}-", std::process::id())));
        assert_ne!(a, instance_id());
    }

    #[tokio::test]
    async fn test_static_rules_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        std::fs::write(
            &path,
            "[[pricing]]\nkey = \"module:image\"\nbilling_type = \"per_request\"\nbase_credits = 5.0\n",
        )
        .unwrap();

        let mut config = Config::default();
        config.database.path = Some(dir.path().join("gentask.db"));
        config.rules.file = Some(path);

        let (store, _) = open_store(&config).unwrap();
        let rules = build_rules(&config, &store).unwrap();
        let rule = rules.pricing_rule("module:image").await.unwrap().unwrap();
        assert_eq!(rule.base_credits, 5.0);
    }
}
