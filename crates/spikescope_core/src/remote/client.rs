//! Client for the remote GPU sorting worker.
//!
//! Ships the raw array and parameters to an external worker and returns
//! its result normalized into the same shape a local run produces. The
//! round trip is synchronous: worker cold start plus the algorithm run can
//! take many minutes, so the HTTP timeout is long and there is no
//! cancellation.
//!
//! Flow per job:
//! 1. Upload the input array to object storage
//! 2. POST the job descriptor to the worker
//! 3. Download the result rows from object storage
//! 4. Delete the job's storage prefix (best effort)

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::{AlgorithmKind, ClusterSet, Provenance};
use crate::config::RemoteSettings;
use crate::error::{DataError, DataResult};
use crate::recording::{npy, DenseTensor};

use super::storage::ObjectStore;

/// Job descriptor POSTed to the worker's `/run` endpoint.
#[derive(Debug, Serialize)]
struct JobRequest<'a> {
    job_id: &'a str,
    algorithm: &'a str,
    params: &'a serde_json::Value,
    storage_bucket: &'a str,
    input_path: &'a str,
    data_shape: (usize, usize),
    data_dtype: &'a str,
    dataset_info: &'a serde_json::Value,
}

/// Worker response body.
#[derive(Debug, Deserialize)]
struct JobResponse {
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    num_clusters: Option<usize>,
    #[serde(default)]
    num_spikes: Option<usize>,
    #[serde(default)]
    results_path: Option<String>,
}

/// Offloads sorting runs to a remote GPU worker.
pub struct RemoteExecutionClient {
    worker_url: String,
    bucket: String,
    store: Box<dyn ObjectStore>,
    http: reqwest::blocking::Client,
}

impl RemoteExecutionClient {
    /// Build a client from the remote settings and an object store.
    pub fn new(settings: &RemoteSettings, store: Box<dyn ObjectStore>) -> DataResult<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| DataError::remote(format!("building HTTP client: {e}")))?;

        Ok(Self {
            worker_url: settings.worker_url.trim_end_matches('/').to_string(),
            bucket: settings.storage_bucket.clone(),
            store,
            http,
        })
    }

    /// Run a sorting algorithm remotely over the full recording tensor.
    ///
    /// The returned set carries the same normalized shape as a local run,
    /// so callers treat the two sources interchangeably from here on.
    pub fn run_algorithm(
        &self,
        algorithm: AlgorithmKind,
        data: &DenseTensor<'_>,
        params: &serde_json::Value,
        dataset_info: &serde_json::Value,
    ) -> DataResult<ClusterSet> {
        let job_id = format!("spike-sort-{}", chrono::Utc::now().timestamp_millis());
        let input_path = format!("gpu-jobs/{job_id}/input.npy");

        tracing::info!(
            job = %job_id,
            algorithm = algorithm.name(),
            shape = ?(data.channels, data.samples),
            "uploading input array"
        );
        let input_bytes = npy::to_bytes_f32(&[data.channels, data.samples], &data.data);
        self.store.upload(&input_path, &input_bytes)?;

        let request = JobRequest {
            job_id: &job_id,
            algorithm: algorithm.name(),
            params,
            storage_bucket: &self.bucket,
            input_path: &input_path,
            data_shape: (data.channels, data.samples),
            data_dtype: "float32",
            dataset_info,
        };

        tracing::info!(job = %job_id, url = %self.worker_url, "submitting sorting job");
        let response = self
            .http
            .post(format!("{}/run", self.worker_url))
            .json(&request)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| DataError::remote(format!("worker request failed: {e}")))?;

        let body: JobResponse = response
            .json()
            .map_err(|e| DataError::remote(format!("decoding worker response: {e}")))?;

        if !body.success {
            return Err(DataError::remote(
                body.error.unwrap_or_else(|| "worker returned failure".to_string()),
            ));
        }

        let results_path = body
            .results_path
            .ok_or_else(|| DataError::remote("worker returned no results pointer"))?;

        let result_bytes = self.store.download(&results_path)?;
        let set = decode_result_rows(&result_bytes, algorithm)?;

        // Cleanup failure must not fail a completed run
        if let Err(err) = self.store.delete_prefix(&format!("gpu-jobs/{job_id}")) {
            tracing::warn!(job = %job_id, %err, "storage cleanup failed");
        }

        tracing::info!(
            job = %job_id,
            clusters = body.num_clusters.unwrap_or(set.len()),
            spikes = body.num_spikes.unwrap_or(set.total_spikes()),
            "remote sorting complete"
        );
        Ok(set)
    }
}

/// Decode the worker's result file: NPY rows of
/// `[x, y, cluster_id, time, channel]`, the same layout the on-disk cache
/// uses.
fn decode_result_rows(bytes: &[u8], algorithm: AlgorithmKind) -> DataResult<ClusterSet> {
    let header = npy::parse_header(bytes, Path::new("remote results"))?;
    if header.shape.len() != 2 || header.shape[1] != 5 {
        return Err(DataError::remote(format!(
            "unexpected result shape {:?}, want (n, 5)",
            header.shape
        )));
    }
    let rows = npy::decode_f64(&header, bytes);
    Ok(ClusterSet::from_rows(&rows, algorithm, Provenance::Remote))
}
