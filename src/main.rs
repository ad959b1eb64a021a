use futures::StreamExt;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::runtime::controller::Config as ControllerRuntimeConfig;
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, Controller, WatchStreamExt};
use kube::{Api, Client, Resource};
use kokeilu::config::ControllerConfig;
use kokeilu::controller::clock::SystemClock;
use kokeilu::controller::events::{Emitter, KubeEventPublisher};
use kokeilu::controller::experiment::{KubeExperimentClient, MANAGED_SELECTOR};
use kokeilu::controller::notifications::{
    ConfigMapNotificationsManager, StoreConfigSource, TriggerRegistry, NOTIFICATION_CONFIGMAP,
    NOTIFICATION_SECRET,
};
use kokeilu::controller::references::KubeReferenceLister;
use kokeilu::controller::{error_policy, reconcile, Context, ExperimentController};
use kokeilu::crd::experiment::Experiment;
use kokeilu::server::{
    create_metrics, run_health_server, shutdown_channel, wait_for_signal, ReadinessState,
    ShutdownSignal,
};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Api for `K`, scoped to the watch namespace when one is configured
fn scoped_api<K>(client: Client, config: &ControllerConfig) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match &config.watch_namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Watch only the ReplicaSets this controller manages
fn managed_replicasets() -> watcher::Config {
    watcher::Config::default().labels(MANAGED_SELECTOR)
}

/// Watch a single object by name
fn single_object(name: &str) -> watcher::Config {
    watcher::Config::default().fields(&format!("metadata.name={name}"))
}

/// Keep a reflector store populated until shutdown
fn spawn_reflector<K>(
    api: Api<K>,
    config: watcher::Config,
    mut shutdown: ShutdownSignal,
) -> (Store<K>, JoinHandle<()>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone + Send + Sync,
{
    let (store, writer) = reflector::store();
    let kind = K::kind(&K::DynamicType::default()).to_string();
    let watch_kind = kind.clone();
    let stream = reflector::reflector(writer, watcher(api, config))
        .default_backoff()
        .touched_objects()
        .for_each(move |res| {
            if let Err(e) = res {
                warn!(kind = %watch_kind, error = %e, "Watch error");
            }
            futures::future::ready(())
        });
    let handle = tokio::spawn(async move {
        tokio::select! {
            _ = stream => warn!(kind = %kind, "Watch stream ended"),
            _ = shutdown.wait() => debug!(kind = %kind, "Reflector stopped"),
        }
    });
    (store, handle)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting kokeilu experiment controller");

    // reqwest and kube both use rustls; pick the provider once for the process
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }

    let config = ControllerConfig::from_env();
    info!(
        namespace = %config.namespace,
        watch_namespace = ?config.watch_namespace,
        workers = config.workers,
        notification_failures = ?config.notification_failures,
        "Loaded controller configuration"
    );

    let (shutdown_controller, shutdown_signal) = shutdown_channel();
    let readiness = ReadinessState::new();

    let metrics = create_metrics()?;
    info!("Prometheus metrics registry initialized");

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let health_port = config.health_port;
    let health_handle = tokio::spawn(async move {
        if let Err(e) = run_health_server(health_port, health_readiness, health_metrics).await {
            warn!(error = %e, "Health server failed");
        }
    });

    // Caches read by sync
    let (replicasets, replicaset_handle) = spawn_reflector(
        scoped_api::<ReplicaSet>(client.clone(), &config),
        managed_replicasets(),
        shutdown_signal.clone(),
    );
    let (config_maps, config_map_handle) = spawn_reflector(
        Api::<ConfigMap>::namespaced(client.clone(), &config.namespace),
        single_object(NOTIFICATION_CONFIGMAP),
        shutdown_signal.clone(),
    );
    let (secrets, secret_handle) = spawn_reflector(
        Api::<Secret>::namespaced(client.clone(), &config.namespace),
        single_object(NOTIFICATION_SECRET),
        shutdown_signal.clone(),
    );

    let registry = Arc::new(TriggerRegistry::builtin()?);
    let notifications = ConfigMapNotificationsManager::new(
        Arc::new(StoreConfigSource::new(config_maps, secrets, &config.namespace)),
        registry.clone(),
        reqwest::Client::new(),
    );
    let emitter = Emitter::new(
        Arc::new(KubeEventPublisher::new(client.clone())),
        Arc::new(notifications),
        registry,
        Some(metrics.clone()),
    );

    let controller = Controller::new(
        scoped_api::<Experiment>(client.clone(), &config),
        watcher::Config::default(),
    )
    .owns(
        scoped_api::<ReplicaSet>(client.clone(), &config),
        managed_replicasets(),
    )
    .with_config(ControllerRuntimeConfig::default().concurrency(config.workers));

    let replicasets_ready = {
        let store = replicasets.clone();
        async move { store.wait_until_ready().await }
    };
    let experiment_client =
        KubeExperimentClient::new(client.clone(), controller.store(), replicasets);
    let experiment_controller = ExperimentController::new(
        Arc::new(experiment_client),
        Arc::new(KubeReferenceLister::new(client.clone())),
        emitter,
        Arc::new(SystemClock),
        config.clone(),
    )
    .with_metrics(metrics.clone());
    let ctx = Arc::new(Context::new(
        experiment_controller,
        &config,
        Some(metrics.clone()),
    ));

    // owned children must be cached before the first sync
    replicasets_ready.await?;
    readiness.set_ready();
    info!("Controller ready, starting reconciliation loop");

    // error_policy already logs failures
    let reconciliation = controller
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            if let Ok(o) = res {
                debug!("Reconciled: {:?}", o);
            }
        });

    tokio::select! {
        _ = reconciliation => {
            info!("Controller stream ended");
        }
        signal = wait_for_signal() => {
            match signal {
                Ok(name) => info!(signal = name, "Initiating graceful shutdown"),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signals"),
            }
            // Mark not ready so K8s stops sending traffic during shutdown
            readiness.set_not_ready();
        }
    }

    shutdown_controller.shutdown();

    info!("Stopping components...");
    for handle in [replicaset_handle, config_map_handle, secret_handle] {
        if let Err(e) = handle.await {
            warn!(error = %e, "Reflector task failed");
        }
    }
    health_handle.abort();

    info!("kokeilu controller shut down gracefully");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
