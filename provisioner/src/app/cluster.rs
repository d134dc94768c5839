// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cluster operations

use super::job::JobRunner;
use chrono::DateTime;
use chrono::Utc;
use provisioner_common::api::CreateResult;
use provisioner_common::api::Error;
use provisioner_common::api::LookupResult;
use provisioner_common::api::ResourceType;
use provisioner_common::api::UpdateResult;
use provisioner_common::typed_uuid::ClusterUuid;
use provisioner_common::typed_uuid::NodeUuid;
use provisioner_planning::layout::solve;
use provisioner_planning::layout::Layout;
use provisioner_planning::layout::ServiceRequest;
use provisioner_planning::layout::SolverInput;
use provisioner_planning::plan::build_plan;
use provisioner_planning::plan::NodeChange;
use provisioner_planning::plan::Plan;
use provisioner_planning::plan::PlanError;
use provisioner_planning::plan::PlanNode;
use provisioner_planning::plan::PlanOperation;
use provisioner_types::cluster::Cluster;
use provisioner_types::cluster::ClusterEvent;
use provisioner_types::cluster::ClusterStatus;
use provisioner_types::cluster::Node;
use provisioner_types::job::ClusterJob;
use provisioner_types::job::ClusterOperation;
use provisioner_types::job::JobReport;
use provisioner_types::job::OperationKind;
use provisioner_types::task::Task;
use provisioner_types::template::ClusterTemplate;
use serde::Deserialize;
use serde::Serialize;
use slog::info;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

/// Request to create a cluster from a template
///
/// Unset fields take the template's defaults.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct ClusterCreateParams {
    pub name: String,
    pub owner: String,
    pub template: String,
    pub node_count: usize,
    #[serde(default)]
    pub services: Option<BTreeSet<String>>,
    #[serde(default)]
    pub hardware_type: Option<String>,
    #[serde(default)]
    pub image_type: Option<String>,
}

/// A cluster with its nodes and the progress of its latest job
#[derive(Clone, Debug, Serialize)]
pub struct ClusterView {
    pub cluster: Cluster,
    pub nodes: Vec<Node>,
    pub job: Option<ClusterJob>,
    /// the latest job's tasks, in plan order
    pub tasks: Vec<Task>,
    pub report: Option<JobReport>,
}

/// Selects node properties to report
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct NodePropertiesRequest {
    pub cluster_id: ClusterUuid,
    /// only nodes running at least one of these (all nodes if empty)
    #[serde(default)]
    pub services: BTreeSet<String>,
    /// only these properties (all of them if empty)
    #[serde(default)]
    pub properties: BTreeSet<String>,
}

pub type NodePropertiesMap =
    BTreeMap<NodeUuid, serde_json::Map<String, serde_json::Value>>;

impl super::Orchestrator {
    pub async fn cluster_create(
        &self,
        params: ClusterCreateParams,
    ) -> CreateResult<ClusterJob> {
        let template = self.catalog.template(&params.template)?;
        let request = ServiceRequest {
            services: params
                .services
                .unwrap_or_else(|| template.defaults.services.clone()),
            hardware_type: params
                .hardware_type
                .unwrap_or_else(|| template.defaults.hardware_type.clone()),
            image_type: params
                .image_type
                .unwrap_or_else(|| template.defaults.image_type.clone()),
        };
        let layout = self.solve(template, &[], params.node_count, &request)?;

        let now = Utc::now();
        let cluster_id = ClusterUuid::new_v4();
        let nodes: Vec<Node> = layout
            .nodes
            .iter()
            .map(|planned| Node {
                id: NodeUuid::new_v4(),
                cluster_id,
                ordinal: planned.ordinal,
                hardware_type: planned.hardware_type.clone(),
                image_type: planned.image_type.clone(),
                services: BTreeSet::new(),
                properties: Default::default(),
            })
            .collect();
        let plan_nodes: Vec<PlanNode> = nodes
            .iter()
            .zip(&layout.nodes)
            .map(|(node, planned)| PlanNode {
                id: node.id,
                ordinal: node.ordinal,
                change: NodeChange::Create,
                current: BTreeSet::new(),
                target: planned.services.clone(),
            })
            .collect();
        let plan = self.plan(&plan_nodes, PlanOperation::Provision)?;

        let cluster = Cluster {
            id: cluster_id,
            name: params.name,
            owner: params.owner,
            template: template.name.clone(),
            node_count: params.node_count,
            nodes: nodes.iter().map(|n| n.id).collect(),
            services: request.services.clone(),
            hardware_type: request.hardware_type,
            image_type: request.image_type,
            status: ClusterStatus::Pending,
            active_job: None,
            latest_job: None,
            time_created: now,
            time_expires: template
                .administration
                .lease_duration
                .initial_expiry(now),
        };
        let job = ClusterJob::new(
            cluster_id,
            ClusterOperation::Create,
            request.services,
            params.node_count,
            now,
        );
        let job_id = job.id;
        self.locks.acquire(cluster_id, job_id)?;
        info!(self.log, "creating cluster";
            "cluster_id" => %cluster_id,
            "template" => &cluster.template,
            "nodes" => nodes.len(),
            "tasks" => plan.len(),
        );
        let result = async {
            self.datastore.cluster_save(&cluster).await?;
            self.launch(cluster, job, &plan, &nodes).await
        }
        .await;
        if result.is_err() {
            self.locks.release(cluster_id, job_id);
        }
        result
    }

    /// Changes the number of nodes, keeping the cluster's services
    pub async fn cluster_resize(
        &self,
        cluster_id: ClusterUuid,
        node_count: usize,
    ) -> UpdateResult<ClusterJob> {
        self.modify(cluster_id, ClusterOperation::Resize { node_count }).await
    }

    pub async fn cluster_add_services(
        &self,
        cluster_id: ClusterUuid,
        services: BTreeSet<String>,
    ) -> UpdateResult<ClusterJob> {
        self.modify(cluster_id, ClusterOperation::AddServices { services })
            .await
    }

    pub async fn cluster_remove_services(
        &self,
        cluster_id: ClusterUuid,
        services: BTreeSet<String>,
    ) -> UpdateResult<ClusterJob> {
        self.modify(cluster_id, ClusterOperation::RemoveServices { services })
            .await
    }

    pub async fn cluster_start(
        &self,
        cluster_id: ClusterUuid,
    ) -> UpdateResult<ClusterJob> {
        self.modify(cluster_id, ClusterOperation::Start).await
    }

    pub async fn cluster_stop(
        &self,
        cluster_id: ClusterUuid,
    ) -> UpdateResult<ClusterJob> {
        self.modify(cluster_id, ClusterOperation::Stop).await
    }

    pub async fn cluster_restart(
        &self,
        cluster_id: ClusterUuid,
    ) -> UpdateResult<ClusterJob> {
        self.modify(cluster_id, ClusterOperation::Restart).await
    }

    /// Tears the cluster down
    ///
    /// A job still running on the cluster is cancelled: whatever it hasn't
    /// handed to a worker is skipped, and the delete takes over the cluster.
    pub async fn cluster_delete(
        &self,
        cluster_id: ClusterUuid,
    ) -> UpdateResult<ClusterJob> {
        let cluster = self.cluster_for_update(cluster_id).await?;
        let job = ClusterJob::new(
            cluster_id,
            ClusterOperation::Delete,
            BTreeSet::new(),
            0,
            Utc::now(),
        );

        // After a restart only the cluster's record knows about its job.
        match self.locks.holder(cluster_id).or(cluster.active_job) {
            Some(previous) => {
                let previous_job = self.datastore.job_fetch(previous).await?;
                if previous_job.operation.kind() == OperationKind::Delete
                    && !previous_job.status().is_terminal()
                {
                    return Err(Error::conflict(&format!(
                        "cluster {cluster_id} is already being deleted"
                    )));
                }
                if self.jobs.cancel(previous).await.transpose()?.is_none() {
                    let recovered = {
                        let _guard = self.locks.records().await;
                        let running = self.jobs.is_running(previous);
                        if !running {
                            self.cancel_orphaned_job(
                                previous,
                                "superseded by delete",
                            )
                            .await?;
                        }
                        running
                    };
                    // recovery restarted it in the meantime
                    if recovered {
                        if let Some(result) = self.jobs.cancel(previous).await
                        {
                            result?;
                        }
                    }
                }
                info!(self.log, "cancelled job for delete";
                    "cluster_id" => %cluster_id,
                    "job_id" => %previous,
                );
                if !self.locks.transfer(cluster_id, previous, job.id) {
                    self.locks.acquire(cluster_id, job.id)?;
                }
            }
            None => self.locks.acquire(cluster_id, job.id)?,
        }

        let job_id = job.id;
        let result = async {
            let nodes = self.datastore.node_list(cluster_id).await?;
            let plan_nodes: Vec<PlanNode> = nodes
                .iter()
                .map(|node| PlanNode {
                    id: node.id,
                    ordinal: node.ordinal,
                    change: NodeChange::Delete,
                    current: node.services.clone(),
                    target: BTreeSet::new(),
                })
                .collect();
            let plan = self.plan(&plan_nodes, PlanOperation::Provision)?;
            self.launch(cluster, job, &plan, &[]).await
        }
        .await;
        if result.is_err() {
            self.locks.release(cluster_id, job_id);
        }
        result
    }

    pub async fn cluster_view(
        &self,
        cluster_id: ClusterUuid,
    ) -> LookupResult<ClusterView> {
        let cluster = self.datastore.cluster_fetch(cluster_id).await?;
        let nodes = self.datastore.node_list(cluster_id).await?;
        let Some(job_id) = cluster.latest_job else {
            return Ok(ClusterView {
                cluster,
                nodes,
                job: None,
                tasks: Vec::new(),
                report: None,
            });
        };
        let job = self.datastore.job_fetch(job_id).await?;
        let mut by_id: BTreeMap<_, _> = self
            .datastore
            .task_list(job_id)
            .await?
            .into_iter()
            .map(|t| (t.id, t))
            .collect();
        let tasks: Vec<Task> =
            job.task_ids.iter().filter_map(|id| by_id.remove(id)).collect();
        let report = JobReport::from_tasks(&tasks);
        Ok(ClusterView {
            cluster,
            nodes,
            job: Some(job),
            tasks,
            report: Some(report),
        })
    }

    /// Moves the cluster's expiry to `requested`, within the limits of the
    /// template's lease policy
    pub async fn cluster_lease_extend(
        &self,
        cluster_id: ClusterUuid,
        owner: &str,
        requested: DateTime<Utc>,
    ) -> UpdateResult<Cluster> {
        let _guard = self.locks.records().await;
        let mut cluster = match self.datastore.cluster_load(cluster_id).await? {
            Some(cluster) if cluster.owner == owner => cluster,
            _ => {
                return Err(Error::not_found_by_id(
                    ResourceType::Cluster,
                    cluster_id.as_untyped_uuid(),
                ))
            }
        };
        if cluster.status.is_terminated() {
            return Err(Error::invalid_request(&format!(
                "cluster {cluster_id} has been deleted"
            )));
        }
        let template = self.catalog.template(&cluster.template)?;
        let expiry = template
            .administration
            .lease_duration
            .extend(
                cluster.time_created,
                cluster.time_expires,
                Utc::now(),
                requested,
            )
            .map_err(|e| Error::invalid_request(&e.to_string()))?;
        cluster.time_expires = Some(expiry);
        self.datastore.cluster_save(&cluster).await?;
        info!(self.log, "extended cluster lease";
            "cluster_id" => %cluster_id,
            "expires" => %expiry,
        );
        Ok(cluster)
    }

    /// Reports properties of an owner's cluster's nodes
    ///
    /// A cluster that doesn't exist or belongs to someone else yields an
    /// empty map.
    pub async fn cluster_node_properties(
        &self,
        owner: &str,
        request: &NodePropertiesRequest,
    ) -> Result<NodePropertiesMap, Error> {
        let mut properties = NodePropertiesMap::new();
        match self.datastore.cluster_load(request.cluster_id).await? {
            Some(cluster) if cluster.owner == owner => (),
            _ => return Ok(properties),
        }
        for node in self.datastore.node_list(request.cluster_id).await? {
            if !request.services.is_empty()
                && node.services.is_disjoint(&request.services)
            {
                continue;
            }
            properties.insert(
                node.id,
                node.properties.to_json_filtered(&request.properties),
            );
        }
        Ok(properties)
    }

    async fn cluster_for_update(
        &self,
        cluster_id: ClusterUuid,
    ) -> LookupResult<Cluster> {
        let cluster = self.datastore.cluster_fetch(cluster_id).await?;
        if cluster.status.is_terminated() {
            return Err(Error::invalid_request(&format!(
                "cluster {cluster_id} has been deleted"
            )));
        }
        Ok(cluster)
    }

    /// Plans and starts a job that changes an existing cluster
    async fn modify(
        &self,
        cluster_id: ClusterUuid,
        operation: ClusterOperation,
    ) -> UpdateResult<ClusterJob> {
        let cluster = self.cluster_for_update(cluster_id).await?;
        let mut job = ClusterJob::new(
            cluster_id,
            operation,
            cluster.services.clone(),
            cluster.node_count,
            Utc::now(),
        );
        self.locks.acquire(cluster_id, job.id)?;
        let job_id = job.id;
        let result = async {
            // The lock doesn't survive a restart; the cluster's record does.
            let cluster = self.cluster_for_update(cluster_id).await?;
            if let Some(other) = cluster.active_job {
                return Err(Error::conflict(&format!(
                    "cluster {cluster_id} is busy with job {other}"
                )));
            }
            job.target_services = cluster.services.clone();
            job.target_node_count = cluster.node_count;
            let (plan, new_nodes) = self.plan_change(&cluster, &mut job).await?;
            info!(self.log, "starting job";
                "cluster_id" => %cluster_id,
                "job_id" => %job.id,
                "operation" => %job.operation.kind(),
                "tasks" => plan.len(),
            );
            self.launch(cluster, job, &plan, &new_nodes).await
        }
        .await;
        if result.is_err() {
            self.locks.release(cluster_id, job_id);
        }
        result
    }

    /// Works out the plan for `job` and the nodes it adds, updating the job's
    /// targets
    async fn plan_change(
        &self,
        cluster: &Cluster,
        job: &mut ClusterJob,
    ) -> Result<(Plan, Vec<Node>), Error> {
        let nodes = self.datastore.node_list(cluster.id).await?;
        let operation = job.operation.clone();
        let (target_services, target_node_count) = match &operation {
            ClusterOperation::Resize { node_count } => {
                (cluster.services.clone(), *node_count)
            }
            ClusterOperation::AddServices { services } => {
                if services.is_empty() {
                    return Err(Error::invalid_request("no services given"));
                }
                (&cluster.services | services, nodes.len())
            }
            ClusterOperation::RemoveServices { services } => {
                if services.is_empty() {
                    return Err(Error::invalid_request("no services given"));
                }
                if let Some(missing) =
                    services.iter().find(|s| !cluster.services.contains(*s))
                {
                    return Err(Error::invalid_request(&format!(
                        "cluster {} does not run service {missing:?}",
                        cluster.id
                    )));
                }
                let remaining = &cluster.services - services;
                if remaining.is_empty() {
                    return Err(Error::invalid_request(
                        "cannot remove every service from a cluster",
                    ));
                }
                (remaining, nodes.len())
            }
            ClusterOperation::Start
            | ClusterOperation::Stop
            | ClusterOperation::Restart => {
                let operation = match operation {
                    ClusterOperation::Start => PlanOperation::Start,
                    ClusterOperation::Stop => PlanOperation::Stop,
                    _ => PlanOperation::Restart,
                };
                let plan_nodes: Vec<PlanNode> = nodes
                    .iter()
                    .map(|node| PlanNode {
                        id: node.id,
                        ordinal: node.ordinal,
                        change: NodeChange::Keep,
                        current: node.services.clone(),
                        target: node.services.clone(),
                    })
                    .collect();
                job.target_node_count = nodes.len();
                return Ok((self.plan(&plan_nodes, operation)?, Vec::new()));
            }
            ClusterOperation::Create | ClusterOperation::Delete => {
                return Err(Error::internal_error(
                    "create and delete are not modifications",
                ));
            }
        };

        let template = self.catalog.template(&cluster.template)?;
        let request = ServiceRequest {
            services: target_services.clone(),
            hardware_type: cluster.hardware_type.clone(),
            image_type: cluster.image_type.clone(),
        };
        let layout = self.solve(template, &nodes, target_node_count, &request)?;
        job.target_services = target_services;
        job.target_node_count = target_node_count;

        let existing: BTreeMap<NodeUuid, &Node> =
            nodes.iter().map(|n| (n.id, n)).collect();
        let mut new_nodes = Vec::new();
        let mut plan_nodes = Vec::new();
        for planned in &layout.nodes {
            match planned.id.and_then(|id| existing.get(&id)) {
                Some(node) => plan_nodes.push(PlanNode {
                    id: node.id,
                    ordinal: node.ordinal,
                    change: NodeChange::Keep,
                    current: node.services.clone(),
                    target: planned.services.clone(),
                }),
                None => {
                    let node = Node {
                        id: NodeUuid::new_v4(),
                        cluster_id: cluster.id,
                        ordinal: planned.ordinal,
                        hardware_type: planned.hardware_type.clone(),
                        image_type: planned.image_type.clone(),
                        services: BTreeSet::new(),
                        properties: Default::default(),
                    };
                    plan_nodes.push(PlanNode {
                        id: node.id,
                        ordinal: node.ordinal,
                        change: NodeChange::Create,
                        current: BTreeSet::new(),
                        target: planned.services.clone(),
                    });
                    new_nodes.push(node);
                }
            }
        }
        for removed in &layout.removed {
            let Some(node) = removed.id.and_then(|id| existing.get(&id)) else {
                continue;
            };
            plan_nodes.push(PlanNode {
                id: node.id,
                ordinal: node.ordinal,
                change: NodeChange::Delete,
                current: node.services.clone(),
                target: BTreeSet::new(),
            });
        }
        let plan = self.plan(&plan_nodes, PlanOperation::Provision)?;
        Ok((plan, new_nodes))
    }

    fn solve(
        &self,
        template: &ClusterTemplate,
        existing: &[Node],
        target_node_count: usize,
        request: &ServiceRequest,
    ) -> Result<Layout, Error> {
        let input = SolverInput {
            template,
            catalog: self.catalog.services(),
            existing,
            target_node_count,
            request: request.clone(),
            search_budget: self.search_budget,
        };
        solve(&input).map_err(|error| Error::ConstraintUnsatisfiable {
            message: error.to_string(),
        })
    }

    fn plan(
        &self,
        nodes: &[PlanNode],
        operation: PlanOperation,
    ) -> Result<Plan, Error> {
        build_plan(self.catalog.services(), nodes, operation).map_err(
            |error| match error {
                PlanError::CyclicDependency { services } => {
                    Error::CyclicDependency { services }
                }
                PlanError::UnknownService(_) => {
                    Error::internal_error(&error.to_string())
                }
            },
        )
    }

    /// Persists a planned job and starts its runner
    ///
    /// The caller must already hold the cluster's lock for `job`.  Tasks and
    /// new nodes are written before the job, and the job before the cluster
    /// names it as active.  The job is saved and its runner started under
    /// the records guard.
    async fn launch(
        &self,
        cluster: Cluster,
        mut job: ClusterJob,
        plan: &Plan,
        new_nodes: &[Node],
    ) -> Result<ClusterJob, Error> {
        let mut tasks: Vec<Task> = Vec::with_capacity(plan.len());
        for planned in &plan.units {
            let predecessors = planned
                .predecessors
                .iter()
                .filter_map(|i| tasks.get(*i).map(|t| t.id))
                .collect();
            tasks.push(Task::new(
                job.id,
                cluster.id,
                planned.unit.clone(),
                predecessors,
            ));
        }
        job.task_ids = tasks.iter().map(|t| t.id).collect();

        for task in &tasks {
            self.datastore.task_save(task).await?;
        }
        for node in new_nodes {
            self.datastore.node_save(node).await?;
        }

        // Recovery takes this too, so it never sees the job saved but not
        // yet running.
        let _guard = self.locks.records().await;
        self.datastore.job_save(&job).await?;
        {
            let mut cluster = self
                .datastore
                .cluster_load(cluster.id)
                .await?
                .unwrap_or(cluster);
            cluster.nodes.extend(new_nodes.iter().map(|n| n.id));
            cluster.status = cluster
                .status
                .transition(ClusterEvent::JobStarted)
                .map_err(|e| Error::invalid_request(&e.to_string()))?;
            cluster.active_job = Some(job.id);
            cluster.latest_job = Some(job.id);
            self.datastore.cluster_save(&cluster).await?;
        }

        JobRunner::new(&self.job_context(), job.clone(), tasks).spawn();
        Ok(job)
    }
}
