//! Reconciliation loop for MongoDb.
//!
//! One pass runs strictly in sequence: restart check, pre-config, member
//! sync, post-config, status settlement. Passes are level-triggered,
//! idempotent and safe to interrupt anywhere because all durable intent
//! (restart phase, bootstrap conditions) lives in the persisted status.

use std::sync::Arc;
use std::time::Instant;

use kube::{
    Api, ResourceExt,
    api::{Patch, PatchParams},
    runtime::controller::Action,
};
use tracing::{debug, error, info, warn};

use crate::crd::{MongoDb, MongoState, RestartState};

use super::context::{Context, FIELD_MANAGER};
use super::error::Error;
use super::mode::MongoInstance;

/// Finalizer name for graceful decommission.
pub const FINALIZER: &str = "mongodb.finalizers.operator.io";

/// Requeue cadence: steady state is re-checked every minute, failures
/// shortly after.
const REQUEUE_STEADY: std::time::Duration = std::time::Duration::from_secs(60);
const REQUEUE_SOON: std::time::Duration = std::time::Duration::from_secs(5);

/// Reconcile a MongoDb instance.
pub async fn reconcile(obj: Arc<MongoDb>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start_time = Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    info!(name = %name, namespace = %namespace, "reconciling MongoDb");
    let api: Api<MongoDb> = Api::namespaced(ctx.client.clone(), &namespace);

    // Deletion: evict every member before the finalizer goes away.
    if obj.metadata.deletion_timestamp.is_some() {
        if obj.finalizers().iter().any(|f| f == FINALIZER) {
            let mut cr = (*obj).clone();
            cr.spec.members = 0;
            cr.spec.arbiter = false;
            let mut instance = MongoInstance::new(ctx.clone(), cr);
            info!(name = %name, "decommissioning replica set members");
            if let Err(e) = instance.sync().await {
                error!(name = %name, error = %e, "decommission failed");
                return Err(e);
            }
            remove_finalizer(&api, &name).await?;
        }
        return Ok(Action::await_change());
    }

    if !obj.finalizers().iter().any(|f| f == FINALIZER) {
        info!(name = %name, "adding finalizer");
        add_finalizer(&api, &name).await?;
        return Ok(Action::requeue(std::time::Duration::from_secs(1)));
    }

    let mut instance = MongoInstance::new(ctx.clone(), (*obj).clone());

    if instance.base().cr.spec.pause {
        instance.base_mut().update_state(MongoState::Pause).await?;
        return Ok(Action::requeue(REQUEUE_STEADY));
    }

    ctx.publish_normal_event(
        &obj,
        "StartReconcileMongoDb",
        "Reconciling",
        Some(format!("Mongo Name: {}", name)),
    )
    .await;

    // 1. Restart pre-step: some settings only take effect through a
    // rolling restart.
    debug!(name = %name, "checking whether a restart is needed");
    let needs_reconciling = match check_restart(&mut instance, &ctx).await {
        Ok(flag) => flag,
        Err(e) => {
            ctx.publish_warning_event(
                &obj,
                "ReconcileMongoRestartError",
                "Restart",
                Some(format!("Restart Mongo Name: {}, Error: {}", name, e)),
            )
            .await;
            return Err(e);
        }
    };

    let state = instance.base().status().state;
    if (needs_reconciling && state != MongoState::Reconciling) || state == MongoState::Error {
        debug!(name = %name, "marking Reconciling before the pass");
        instance
            .base_mut()
            .update_state(MongoState::Reconciling)
            .await?;
    }

    // 2. Pre-create Secrets and verify collaborating objects exist.
    debug!(name = %name, "pre-config");
    if let Err(e) = instance.pre_config().await {
        return handle_failure(&mut instance, &ctx, "ReconcilePreMongoConfig", e).await;
    }

    // 3. Sync: classify pods, scale workloads, admit members.
    debug!(name = %name, "start syncing");
    if let Err(e) = instance.sync().await {
        return handle_failure(&mut instance, &ctx, "ReconcileSyncMongoMember", e).await;
    }

    // 4. Post-config: initiate the set, manage users, settle status.
    debug!(name = %name, "start post config");
    if let Err(e) = instance.post_config().await {
        return handle_failure(&mut instance, &ctx, "ReconcilePostMongoConfig", e).await;
    }

    // 5. Success.
    let prior_state = instance.base().status().state;
    if prior_state != MongoState::Running {
        ctx.publish_normal_event(
            &obj,
            "ReconcileMongoDbSuccess",
            "Reconciling",
            Some(format!("Mongo Name: {}", name)),
        )
        .await;
    }
    info!(name = %name, "reconcile success");
    instance.base_mut().update_state(MongoState::Running).await?;
    let members = instance.base().cr.spec.members;
    instance.base_mut().update_current_members(members).await?;

    if let Some(ref health_state) = ctx.health_state {
        health_state
            .metrics
            .record_reconcile(&namespace, &name, start_time.elapsed().as_secs_f64());
    }

    // Never stop reconciling; the steady-state pass keeps status fresh.
    Ok(Action::requeue(REQUEUE_STEADY))
}

/// Error policy for the controller.
pub fn error_policy(obj: Arc<MongoDb>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_error(&namespace, &name);
    }

    if error.is_not_found() {
        debug!(name = %name, "resource not found (likely deleted)");
        return Action::await_change();
    }

    warn!(name = %name, error = %error, "reconcile failed, requeueing");
    Action::requeue(error.requeue_after())
}

/// Detect settings that need a rolling restart to take effect and drive
/// the restart coordinator when they drifted.
///
/// Returns whether the instance should be marked Reconciling. The applied
/// resource shape is only recorded once the restart reports complete.
async fn check_restart(instance: &mut MongoInstance, ctx: &Arc<Context>) -> Result<bool, Error> {
    let cr = instance.base().cr.clone();

    match cr.resources_drifted() {
        // Nothing recorded yet: remember the current shape, no restart.
        None => {
            if cr.spec.resources.is_some() {
                let resources = cr.spec.resources.clone();
                instance.base_mut().update_current_resources(resources).await?;
                return Ok(true);
            }
            Ok(false)
        }
        Some(false) => Ok(false),
        Some(true) => {
            if instance.base().status().restart_state == RestartState::NotInProcess {
                warn!(name = %cr.name_any(), "resource shape changed");
            }
            warn!(name = %cr.name_any(), "ready to restart");
            if instance.base().status().state != MongoState::Reconciling {
                instance
                    .base_mut()
                    .update_state(MongoState::Reconciling)
                    .await?;
            }

            let outcome = instance.restart().await.map_err(|e| {
                error!(name = %cr.name_any(), error = %e, "restart step failed");
                e
            })?;
            // Only a completed restart may record the new shape; anything
            // earlier would erase the pending drift across process
            // restarts.
            if outcome.complete {
                let resources = cr.spec.resources.clone();
                instance.base_mut().update_current_resources(resources).await?;
                ctx.publish_normal_event(
                    &cr,
                    "ReconcileMongoRestartComplete",
                    "Restart",
                    Some(format!("Mongo Name: {}", cr.name_any())),
                )
                .await;
            }
            Ok(true)
        }
    }
}

/// Classify a pass failure and settle state accordingly.
///
/// `WaitRequeue` refreshes the replica set status and retries soon without
/// flipping to Error. `ObjSync` surfaces as-is. Anything else flips to
/// Error, snapshots diagnostics and runs the recovery engine best-effort.
async fn handle_failure(
    instance: &mut MongoInstance,
    ctx: &Arc<Context>,
    action: &str,
    err: Error,
) -> Result<Action, Error> {
    let cr = instance.base().cr.clone();
    let name = cr.name_any();

    ctx.publish_warning_event(
        &cr,
        "ReconcileMongoDbError",
        action,
        Some(format!("Mongo Name: {}, Action: {}, Error: {}", name, action, err)),
    )
    .await;

    if instance.base().status().state != MongoState::Reconciling {
        debug!(name = %name, "marking Reconciling after failure");
        instance
            .base_mut()
            .update_state(MongoState::Reconciling)
            .await?;
    }

    if err.is_obj_sync() {
        error!(name = %name, error = %err, "object sync failed");
        return Err(err);
    }

    if err.is_wait_requeue() {
        debug!(name = %name, reason = %err, "requeueing");
        instance.base_mut().update_rs_status().await?;
        return Ok(Action::requeue(REQUEUE_SOON));
    }

    error!(name = %name, action = %action, error = %err, "unclassified reconcile failure");
    if let Err(e) = instance.base_mut().update_state(MongoState::Error).await {
        warn!(name = %name, error = %e, "failed to record Error state");
    }

    debug!(name = %name, "snapshotting pods for diagnostics");
    let pods = instance.base().list_data_pods().await?;
    debug!(name = %name, "recording error replica set status");
    instance.base_mut().update_err_rs_status().await?;
    debug!(name = %name, "running replica set recovery");
    instance.base_mut().restore_repl_set(&pods).await?;

    Ok(Action::requeue(REQUEUE_SOON))
}

async fn add_finalizer(api: &Api<MongoDb>, name: &str) -> Result<(), Error> {
    let patch = serde_json::json!({
        "metadata": { "finalizers": [FINALIZER] }
    });
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn remove_finalizer(api: &Api<MongoDb>, name: &str) -> Result<(), Error> {
    let patch = serde_json::json!({
        "metadata": { "finalizers": null }
    });
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
