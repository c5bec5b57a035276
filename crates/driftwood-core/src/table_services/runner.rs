//! Background execution of table services.
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::concurrency::TransactionManager;
use crate::config::{TableServiceMode, TableType, WriteConfig};
use crate::table_services::{clustering, compaction};
use crate::timeline::ActiveTimeline;

/// Everything a service task needs, owned so it can move onto a task.
#[derive(Debug, Clone)]
pub struct TableServiceContext {
    /// Timeline of the table. Each task works on its own copy.
    pub active: ActiveTimeline,
    /// Commit finalization.
    pub txn: TransactionManager,
    /// Service settings.
    pub config: WriteConfig,
    /// Compaction only applies to merge-on-read tables.
    pub table_type: TableType,
}

/// Handle to running service tasks.
///
/// Dropping the handle also stops the tasks after their current cycle.
#[derive(Debug)]
pub struct TableServiceHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl TableServiceHandle {
    /// Names of the services started.
    pub fn services(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|(name, _)| *name).collect()
    }

    /// Stop every task and wait for it. A cycle already running finishes
    /// first; no new cycle starts.
    pub async fn shutdown(self) {
        // Receivers may already be gone if a task panicked.
        let _ = self.shutdown.send(true);
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                warn!("table service task failed (service={name}, error={e})");
            }
        }
        info!("table services stopped");
    }
}

/// Start a background task for every service configured with
/// [`TableServiceMode::Async`].
///
/// Each task runs a cycle right away and then once per poll interval. A cycle
/// first finishes instants its service left pending, including ones from a
/// failed earlier cycle, then schedules new work if the trigger fires. Cycle
/// errors are logged and the task keeps polling.
pub fn spawn_async_table_services(ctx: TableServiceContext) -> TableServiceHandle {
    let (shutdown, _) = watch::channel(false);
    let mut tasks = Vec::new();

    let compaction = &ctx.config.compaction;
    if compaction.enabled
        && compaction.mode == TableServiceMode::Async
        && ctx.table_type == TableType::MergeOnRead
    {
        tasks.push((
            "compaction",
            tokio::spawn(compaction_loop(ctx.clone(), shutdown.subscribe())),
        ));
    }

    let clustering = &ctx.config.clustering;
    if clustering.enabled && clustering.mode == TableServiceMode::Async {
        tasks.push((
            "clustering",
            tokio::spawn(clustering_loop(ctx.clone(), shutdown.subscribe())),
        ));
    }

    info!(
        "async table services started (services={:?})",
        tasks.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
    );
    TableServiceHandle { shutdown, tasks }
}

/// Wait for the next cycle. Returns `false` once shutdown was requested or
/// the handle is gone.
async fn next_cycle(shutdown: &mut watch::Receiver<bool>, interval: std::time::Duration) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    let handle_gone = tokio::select! {
        changed = shutdown.changed() => changed.is_err(),
        () = tokio::time::sleep(interval) => false,
    };
    !handle_gone && !*shutdown.borrow()
}

async fn compaction_loop(mut ctx: TableServiceContext, mut shutdown: watch::Receiver<bool>) {
    let config = ctx.config.compaction.clone();
    while !*shutdown.borrow() {
        match compaction::run_compaction(&mut ctx.active, &ctx.txn, config.max_delta_commits)
            .await
        {
            Ok(Some(instant)) => debug!("async compaction cycle done (instant={instant})"),
            Ok(None) => {}
            Err(e) => warn!(
                "async compaction cycle failed (error={e}, retryable={})",
                e.is_retryable()
            ),
        }
        if !next_cycle(&mut shutdown, config.poll_interval()).await {
            break;
        }
    }
    debug!("compaction task stopped");
}

async fn clustering_loop(mut ctx: TableServiceContext, mut shutdown: watch::Receiver<bool>) {
    let config = ctx.config.clustering.clone();
    while !*shutdown.borrow() {
        match clustering::run_clustering(
            &mut ctx.active,
            &ctx.txn,
            config.max_commits,
            config.max_records_per_group,
        )
        .await
        {
            Ok(Some(instant)) => debug!("async clustering cycle done (instant={instant})"),
            Ok(None) => {}
            Err(e) => warn!(
                "async clustering cycle failed (error={e}, retryable={})",
                e.is_retryable()
            ),
        }
        if !next_cycle(&mut shutdown, config.poll_interval()).await {
            break;
        }
    }
    debug!("clustering task stopped");
}
