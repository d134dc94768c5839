// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Datastore that keeps one JSON document per record in a directory tree
//!
//! ```text
//! <root>/clusters/<id>.json
//! <root>/nodes/<id>.json
//! <root>/jobs/<id>.json
//! <root>/tasks/<job_id>/<id>.json
//! ```
//!
//! Tasks are grouped by job so that listing a job's tasks reads only that
//! job's records.
//!
//! Each document is a [`provisioner_types::codec::VersionedRecord`].  Writes
//! go to a temporary file that is then renamed over the old one, so readers
//! see either the previous or the new record, never a partial one.

use super::Datastore;
use async_trait::async_trait;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use provisioner_common::api::Error;
use provisioner_common::api::ListResultVec;
use provisioner_common::typed_uuid::ClusterUuid;
use provisioner_common::typed_uuid::JobUuid;
use provisioner_common::typed_uuid::NodeUuid;
use provisioner_common::typed_uuid::TaskUuid;
use provisioner_types::cluster::Cluster;
use provisioner_types::cluster::Node;
use provisioner_types::codec::decode_record;
use provisioner_types::codec::encode_record;
use provisioner_types::job::ClusterJob;
use provisioner_types::task::Task;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::io::ErrorKind;
use std::sync::Mutex;
use std::sync::MutexGuard;

const CLUSTERS: &str = "clusters";
const NODES: &str = "nodes";
const JOBS: &str = "jobs";
const TASKS: &str = "tasks";

pub struct FileDatastore {
    root: Utf8PathBuf,
    /// job of every task written or found since opening
    task_jobs: Mutex<BTreeMap<TaskUuid, JobUuid>>,
}

impl FileDatastore {
    /// Opens (creating if needed) a datastore rooted at `root`
    pub async fn new(root: &Utf8Path) -> Result<FileDatastore, Error> {
        for kind in [CLUSTERS, NODES, JOBS, TASKS] {
            let dir = root.join(kind);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| io_error("creating", &dir, e))?;
        }
        Ok(FileDatastore {
            root: root.to_owned(),
            task_jobs: Mutex::new(BTreeMap::new()),
        })
    }

    fn path(&self, kind: &str, id: impl Display) -> Utf8PathBuf {
        self.root.join(kind).join(format!("{id}.json"))
    }

    fn task_dir(&self, job_id: JobUuid) -> Utf8PathBuf {
        self.root.join(TASKS).join(job_id.to_string())
    }

    fn task_path(&self, job_id: JobUuid, id: TaskUuid) -> Utf8PathBuf {
        self.task_dir(job_id).join(format!("{id}.json"))
    }

    fn task_jobs(&self) -> MutexGuard<'_, BTreeMap<TaskUuid, JobUuid>> {
        self.task_jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn load<T: DeserializeOwned>(
        &self,
        kind: &str,
        id: impl Display,
    ) -> Result<Option<T>, Error> {
        read(&self.path(kind, id)).await
    }

    async fn save<T: Serialize>(
        &self,
        kind: &str,
        id: impl Display,
        record: &T,
    ) -> Result<(), Error> {
        write(&self.path(kind, id), record).await
    }

    async fn delete(&self, kind: &str, id: impl Display) -> Result<(), Error> {
        let path = self.path(kind, id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("removing", &path, e)),
        }
    }

    async fn list<T: DeserializeOwned>(
        &self,
        kind: &str,
    ) -> Result<Vec<T>, Error> {
        list(&self.root.join(kind)).await
    }

    /// Finds the job a task was saved under, looking through the job
    /// directories for tasks saved before this datastore was opened
    async fn task_job(&self, id: TaskUuid) -> Result<Option<JobUuid>, Error> {
        let known = self.task_jobs().get(&id).copied();
        if known.is_some() {
            return Ok(known);
        }
        let dir = self.root.join(TASKS);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| io_error("listing", &dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("listing", &dir, e))?
        {
            let Some(job_id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<JobUuid>().ok())
            else {
                continue;
            };
            let path = self.task_path(job_id, id);
            if tokio::fs::try_exists(&path)
                .await
                .map_err(|e| io_error("checking", &path, e))?
            {
                self.task_jobs().insert(id, job_id);
                return Ok(Some(job_id));
            }
        }
        Ok(None)
    }
}

async fn read<T: DeserializeOwned>(path: &Utf8Path) -> Result<Option<T>, Error> {
    match tokio::fs::read(path).await {
        Ok(bytes) => decode(path, &bytes).map(Some),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error("reading", path, e)),
    }
}

async fn write<T: Serialize>(path: &Utf8Path, record: &T) -> Result<(), Error> {
    let bytes = encode_record(record).map_err(|e| {
        Error::internal_error(&format!("encoding {path}: {e}"))
    })?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &bytes)
        .await
        .map_err(|e| io_error("writing", &tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| io_error("renaming", &tmp, e))
}

/// Reads every record in `dir`.  A directory that doesn't exist holds no
/// records.
async fn list<T: DeserializeOwned>(dir: &Utf8Path) -> Result<Vec<T>, Error> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error("listing", dir, e)),
    };
    let mut records = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| io_error("listing", dir, e))?
    {
        let Ok(path) = Utf8PathBuf::try_from(entry.path()) else {
            continue;
        };
        if path.extension() != Some("json") {
            continue;
        }
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            // deleted since we listed the directory
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(io_error("reading", &path, e)),
        };
        records.push(decode(&path, &bytes)?);
    }
    Ok(records)
}

fn decode<T: DeserializeOwned>(
    path: &Utf8Path,
    bytes: &[u8],
) -> Result<T, Error> {
    decode_record(bytes).map_err(|e| {
        Error::internal_error(&format!("decoding {path}: {e}"))
    })
}

fn io_error(what: &str, path: &Utf8Path, error: std::io::Error) -> Error {
    Error::unavail(&format!("{what} {path}: {error}"))
}

#[async_trait]
impl Datastore for FileDatastore {
    async fn cluster_load(
        &self,
        id: ClusterUuid,
    ) -> Result<Option<Cluster>, Error> {
        self.load(CLUSTERS, id).await
    }

    async fn cluster_save(&self, cluster: &Cluster) -> Result<(), Error> {
        self.save(CLUSTERS, cluster.id, cluster).await
    }

    async fn cluster_list(&self) -> ListResultVec<Cluster> {
        let mut clusters: Vec<Cluster> = self.list(CLUSTERS).await?;
        clusters.sort_by_key(|c| c.id);
        Ok(clusters)
    }

    async fn node_load(&self, id: NodeUuid) -> Result<Option<Node>, Error> {
        self.load(NODES, id).await
    }

    async fn node_save(&self, node: &Node) -> Result<(), Error> {
        self.save(NODES, node.id, node).await
    }

    async fn node_delete(&self, id: NodeUuid) -> Result<(), Error> {
        self.delete(NODES, id).await
    }

    async fn node_list(&self, cluster_id: ClusterUuid) -> ListResultVec<Node> {
        let mut nodes: Vec<Node> = self
            .list::<Node>(NODES)
            .await?
            .into_iter()
            .filter(|n| n.cluster_id == cluster_id)
            .collect();
        nodes.sort_by_key(|n| (n.ordinal, n.id));
        Ok(nodes)
    }

    async fn job_load(&self, id: JobUuid) -> Result<Option<ClusterJob>, Error> {
        self.load(JOBS, id).await
    }

    async fn job_save(&self, job: &ClusterJob) -> Result<(), Error> {
        self.save(JOBS, job.id, job).await
    }

    async fn job_list_active(&self) -> ListResultVec<ClusterJob> {
        let mut jobs: Vec<ClusterJob> = self
            .list::<ClusterJob>(JOBS)
            .await?
            .into_iter()
            .filter(|j| !j.status().is_terminal())
            .collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn task_load(&self, id: TaskUuid) -> Result<Option<Task>, Error> {
        match self.task_job(id).await? {
            Some(job_id) => read(&self.task_path(job_id, id)).await,
            None => Ok(None),
        }
    }

    async fn task_save(&self, task: &Task) -> Result<(), Error> {
        let dir = self.task_dir(task.job_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("creating", &dir, e))?;
        write(&self.task_path(task.job_id, task.id), task).await?;
        self.task_jobs().insert(task.id, task.job_id);
        Ok(())
    }

    async fn task_list(&self, job_id: JobUuid) -> ListResultVec<Task> {
        let mut tasks: Vec<Task> = list(&self.task_dir(job_id)).await?;
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }
}
