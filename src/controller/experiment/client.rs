use crate::controller::client::{not_found_as_none, ClientError};
use crate::crd::experiment::Experiment;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;
use serde_json::Value;

/// Everything `sync` reads and writes
///
/// Reads come from caches and may be stale; writes go to the API server.
#[async_trait]
pub trait ExperimentClient: Send + Sync {
    async fn get_experiment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Experiment>, ClientError>;

    /// ReplicaSets in the namespace that may belong to an experiment
    async fn list_replicasets(&self, namespace: &str) -> Result<Vec<ReplicaSet>, ClientError>;

    /// Live read, used after a create reported AlreadyExists
    async fn get_replicaset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ReplicaSet>, ClientError>;

    async fn create_replicaset(
        &self,
        namespace: &str,
        rs: &ReplicaSet,
    ) -> Result<ReplicaSet, ClientError>;

    async fn update_replicaset(
        &self,
        namespace: &str,
        rs: &ReplicaSet,
    ) -> Result<ReplicaSet, ClientError>;

    async fn delete_replicaset(&self, namespace: &str, name: &str) -> Result<(), ClientError>;

    /// Merge-patch the status subresource
    async fn patch_experiment_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), ClientError>;
}

/// ExperimentClient reading from reflector stores
pub struct KubeExperimentClient {
    client: kube::Client,
    experiments: Store<Experiment>,
    replicasets: Store<ReplicaSet>,
}

impl KubeExperimentClient {
    pub fn new(
        client: kube::Client,
        experiments: Store<Experiment>,
        replicasets: Store<ReplicaSet>,
    ) -> Self {
        Self {
            client,
            experiments,
            replicasets,
        }
    }
}

#[async_trait]
impl ExperimentClient for KubeExperimentClient {
    async fn get_experiment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Experiment>, ClientError> {
        let key = ObjectRef::new(name).within(namespace);
        Ok(self.experiments.get(&key).map(|exp| (*exp).clone()))
    }

    async fn list_replicasets(&self, namespace: &str) -> Result<Vec<ReplicaSet>, ClientError> {
        Ok(self
            .replicasets
            .state()
            .into_iter()
            .filter(|rs| rs.namespace().as_deref() == Some(namespace))
            .map(|rs| (*rs).clone())
            .collect())
    }

    async fn get_replicaset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ReplicaSet>, ClientError> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| ClientError::from_kube(name, e))
    }

    async fn create_replicaset(
        &self,
        namespace: &str,
        rs: &ReplicaSet,
    ) -> Result<ReplicaSet, ClientError> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), rs)
            .await
            .map_err(|e| ClientError::from_kube(&rs.name_any(), e))
    }

    async fn update_replicaset(
        &self,
        namespace: &str,
        rs: &ReplicaSet,
    ) -> Result<ReplicaSet, ClientError> {
        let name = rs.name_any();
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        api.replace(&name, &PostParams::default(), rs)
            .await
            .map_err(|e| ClientError::from_kube(&name, e))
    }

    async fn delete_replicaset(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        let deleted = api
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|e| ClientError::from_kube(name, e));
        // already gone is fine
        not_found_as_none(deleted).map(|_| ())
    }

    async fn patch_experiment_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), ClientError> {
        let api: Api<Experiment> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map(|_| ())
            .map_err(|e| ClientError::from_kube(name, e))
    }
}

/// A write performed against [`FakeCluster`]
#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterAction {
    CreateReplicaSet { name: String, replicas: i32 },
    UpdateReplicaSet { name: String, replicas: i32 },
    DeleteReplicaSet(String),
    PatchStatus(Value),
}

#[cfg(test)]
#[derive(Default)]
struct ClusterState {
    experiments: std::collections::BTreeMap<(String, String), Experiment>,
    replicasets: std::collections::BTreeMap<(String, String), ReplicaSet>,
    /// Present on the server but missing from the cache
    unlisted: std::collections::BTreeSet<(String, String)>,
    actions: Vec<ClusterAction>,
    next_uid: u32,
}

/// In-memory cluster: a cache and an API server that always agree
/// unless a ReplicaSet is inserted with [`FakeCluster::with_unlisted_replicaset`]
#[cfg(test)]
#[derive(Default)]
pub struct FakeCluster {
    state: std::sync::Mutex<ClusterState>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
impl FakeCluster {
    pub fn with_experiment(self, exp: Experiment) -> Self {
        self.put_experiment(exp);
        self
    }

    pub fn with_replicaset(self, rs: ReplicaSet) -> Self {
        let key = (rs.namespace().unwrap_or_default(), rs.name_any());
        self.state.lock().unwrap().replicasets.insert(key, rs);
        self
    }

    pub fn with_unlisted_replicaset(self, rs: ReplicaSet) -> Self {
        let key = (rs.namespace().unwrap_or_default(), rs.name_any());
        let mut state = self.state.lock().unwrap();
        state.unlisted.insert(key.clone());
        state.replicasets.insert(key, rs);
        drop(state);
        self
    }

    pub fn put_experiment(&self, exp: Experiment) {
        let key = (exp.namespace().unwrap_or_default(), exp.name_any());
        self.state.lock().unwrap().experiments.insert(key, exp);
    }

    pub fn experiment(&self, namespace: &str, name: &str) -> Experiment {
        self.state
            .lock()
            .unwrap()
            .experiments
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .expect("experiment exists")
    }

    pub fn replicaset(&self, namespace: &str, name: &str) -> Option<ReplicaSet> {
        self.state
            .lock()
            .unwrap()
            .replicasets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn replicaset_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .replicasets
            .keys()
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Pretend the ReplicaSet controller caught up: every desired pod is ready
    pub fn mark_ready(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        let rs = state
            .replicasets
            .get_mut(&(namespace.to_string(), name.to_string()))
            .expect("replicaset exists");
        let replicas = rs.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
        rs.status = Some(k8s_openapi::api::apps::v1::ReplicaSetStatus {
            replicas,
            fully_labeled_replicas: Some(replicas),
            ready_replicas: Some(replicas),
            available_replicas: Some(replicas),
            ..Default::default()
        });
    }

    pub fn actions(&self) -> Vec<ClusterAction> {
        self.state.lock().unwrap().actions.clone()
    }

    pub fn clear_actions(&self) {
        self.state.lock().unwrap().actions.clear();
    }

    /// Status patches sent so far
    pub fn status_patches(&self) -> Vec<Value> {
        self.actions()
            .into_iter()
            .filter_map(|a| match a {
                ClusterAction::PatchStatus(p) => Some(p),
                _ => None,
            })
            .collect()
    }
}

/// RFC 7386 JSON merge patch
#[cfg(test)]
fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(fields) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            if let Value::Object(map) = target {
                for (key, value) in fields {
                    if value.is_null() {
                        map.remove(key);
                    } else {
                        merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

#[cfg(test)]
fn replicas_of(rs: &ReplicaSet) -> i32 {
    rs.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0)
}

#[cfg(test)]
#[async_trait]
#[allow(clippy::unwrap_used, clippy::expect_used)]
impl ExperimentClient for FakeCluster {
    async fn get_experiment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Experiment>, ClientError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .experiments
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_replicasets(&self, namespace: &str) -> Result<Vec<ReplicaSet>, ClientError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .replicasets
            .iter()
            .filter(|(key, _)| key.0 == namespace && !state.unlisted.contains(*key))
            .map(|(_, rs)| rs.clone())
            .collect())
    }

    async fn get_replicaset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ReplicaSet>, ClientError> {
        Ok(self.replicaset(namespace, name))
    }

    async fn create_replicaset(
        &self,
        namespace: &str,
        rs: &ReplicaSet,
    ) -> Result<ReplicaSet, ClientError> {
        let name = rs.name_any();
        let key = (namespace.to_string(), name.clone());
        let mut state = self.state.lock().unwrap();
        if state.replicasets.contains_key(&key) {
            return Err(ClientError::AlreadyExists(name));
        }
        state.next_uid += 1;
        let mut created = rs.clone();
        created.metadata.uid = Some(format!("rs-uid-{}", state.next_uid));
        created.metadata.namespace = Some(namespace.to_string());
        created.metadata.resource_version = Some("1".to_string());
        state.actions.push(ClusterAction::CreateReplicaSet {
            name,
            replicas: replicas_of(&created),
        });
        state.replicasets.insert(key, created.clone());
        Ok(created)
    }

    async fn update_replicaset(
        &self,
        namespace: &str,
        rs: &ReplicaSet,
    ) -> Result<ReplicaSet, ClientError> {
        let name = rs.name_any();
        let key = (namespace.to_string(), name.clone());
        let mut state = self.state.lock().unwrap();
        let Some(existing) = state.replicasets.get(&key) else {
            return Err(ClientError::NotFound(name));
        };
        let mut updated = rs.clone();
        // the ReplicaSet controller still owns status
        updated.status = existing.status.clone();
        state.actions.push(ClusterAction::UpdateReplicaSet {
            name,
            replicas: replicas_of(&updated),
        });
        state.replicasets.insert(key, updated.clone());
        Ok(updated)
    }

    async fn delete_replicaset(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        state
            .replicasets
            .remove(&(namespace.to_string(), name.to_string()));
        state
            .actions
            .push(ClusterAction::DeleteReplicaSet(name.to_string()));
        Ok(())
    }

    async fn patch_experiment_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), ClientError> {
        let key = (namespace.to_string(), name.to_string());
        let mut state = self.state.lock().unwrap();
        let Some(exp) = state.experiments.get(&key) else {
            return Err(ClientError::NotFound(name.to_string()));
        };
        let mut doc = serde_json::to_value(exp).expect("experiment serializes");
        merge_patch(&mut doc, patch);
        let patched: Experiment = serde_json::from_value(doc).expect("patched experiment parses");
        state.experiments.insert(key, patched);
        state.actions.push(ClusterAction::PatchStatus(patch.clone()));
        Ok(())
    }
}
