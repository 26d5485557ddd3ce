//! Create-if-absent and delete helpers for owned objects.
//!
//! Managed workloads are never updated in place outside the restart path;
//! an existing object is left untouched so the StatefulSet controller stays
//! the only writer of pod template changes.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, ResourceExt};
use tracing::{debug, info};

use super::error::{Error, Result};
use super::instance::Base;
use super::labels::Labels;

impl Base {
    pub async fn ensure_statefulset(&self, sts: StatefulSet) -> Result<()> {
        ensure(&self.statefulsets(), sts).await
    }

    pub async fn ensure_service(&self, svc: Service) -> Result<()> {
        ensure(&self.services(), svc).await
    }

    pub async fn ensure_secret(&self, secret: Secret) -> Result<()> {
        ensure(&self.secrets(), secret).await
    }

    pub async fn list_statefulsets(&self, selector: &Labels) -> Result<Vec<StatefulSet>> {
        let lp = ListParams::default().labels(&super::labels::selector_string(selector));
        Ok(self
            .statefulsets()
            .list(&lp)
            .await
            .map_err(Error::obj_sync)?
            .items)
    }

    pub async fn list_services(&self, selector: &Labels) -> Result<Vec<Service>> {
        let lp = ListParams::default().labels(&super::labels::selector_string(selector));
        Ok(self
            .services()
            .list(&lp)
            .await
            .map_err(Error::obj_sync)?
            .items)
    }

    pub async fn delete_statefulset(&self, name: &str) -> Result<()> {
        info!(name = %name, "delete statefulset");
        delete_ignoring_missing(&self.statefulsets(), name).await
    }

    pub async fn delete_service(&self, name: &str) -> Result<()> {
        info!(name = %name, "delete service");
        delete_ignoring_missing(&self.services(), name).await
    }
}

async fn ensure<K>(api: &Api<K>, obj: K) -> Result<()>
where
    K: kube::Resource + Clone + std::fmt::Debug + serde::Serialize + serde::de::DeserializeOwned,
{
    let name = obj.name_any();
    match api.get_opt(&name).await.map_err(Error::obj_sync)? {
        Some(_) => {
            debug!(name = %name, "object already exists");
            Ok(())
        }
        None => {
            info!(name = %name, "create object");
            api.create(&PostParams::default(), &obj)
                .await
                .map_err(Error::obj_sync)?;
            Ok(())
        }
    }
}

async fn delete_ignoring_missing<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: kube::Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(Error::obj_sync(e)),
    }
}
