//! BigQuery load jobs over the REST API (`jobs.insert` / `jobs.get`).

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use uuid::Uuid;

use crate::config::{BigQueryConfig, WriteMode};
use crate::error::{HttpClientSnafu, LoadJobError};

use super::{JobState, LoadJob, LoadRequest, Warehouse};

pub struct BigQueryWarehouse {
    client: Client,
    endpoint: String,
    project: String,
    location: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobInsert<'a> {
    job_reference: JobReference,
    configuration: JobConfiguration<'a>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    project_id: String,
    job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    location: Option<String>,
}

#[derive(Debug, Serialize)]
struct JobConfiguration<'a> {
    load: LoadConfiguration<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoadConfiguration<'a> {
    source_uris: [&'a str; 1],
    destination_table: TableReference<'a>,
    source_format: &'static str,
    write_disposition: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TableReference<'a> {
    project_id: &'a str,
    dataset_id: &'a str,
    table_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResource {
    job_reference: JobReference,
    #[serde(default)]
    status: Option<JobStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    state: String,
    #[serde(default)]
    error_result: Option<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ErrorProto {
    fn detail(&self) -> String {
        match (&self.reason, &self.message) {
            (Some(reason), Some(message)) => format!("{reason}: {message}"),
            (None, Some(message)) => message.clone(),
            (Some(reason), None) => reason.clone(),
            (None, None) => "unknown error".to_string(),
        }
    }
}

fn write_disposition(mode: WriteMode) -> &'static str {
    match mode {
        WriteMode::Replace => "WRITE_TRUNCATE",
        WriteMode::Append => "WRITE_APPEND",
    }
}

impl BigQueryWarehouse {
    pub fn new(config: &BigQueryConfig) -> Result<Self, LoadJobError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context(HttpClientSnafu)?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            project: config.project.clone(),
            location: config.location.clone(),
            access_token: config.access_token.clone().filter(|t| !t.is_empty()),
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn parse_job(response: Response) -> Result<JobResource, String> {
        let status = response.status();
        let body = response.text().await.map_err(|e| e.to_string())?;
        if !status.is_success() {
            return Err(format!("HTTP {}: {}", status.as_u16(), body.trim()));
        }
        serde_json::from_str(&body).map_err(|e| format!("unexpected response: {e}"))
    }
}

fn job_state(resource: &JobResource) -> JobState {
    match &resource.status {
        None => JobState::Pending,
        Some(status) => match status.state.as_str() {
            "DONE" => match &status.error_result {
                Some(error) => JobState::Failed(error.detail()),
                None => JobState::Done,
            },
            "RUNNING" => JobState::Running,
            _ => JobState::Pending,
        },
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn submit_load(&self, request: &LoadRequest) -> Result<LoadJob, LoadJobError> {
        let submit_error = |message: String| LoadJobError::Submit {
            uri: request.source_uri.clone(),
            message,
        };

        if !request.source_uri.starts_with("gs://") {
            return Err(LoadJobError::Unsupported {
                message: format!(
                    "BigQuery loads from Cloud Storage only, got {}",
                    request.source_uri
                ),
            });
        }

        let body = JobInsert {
            job_reference: JobReference {
                project_id: self.project.clone(),
                job_id: format!("yellowcab_{}", Uuid::now_v7().simple()),
                location: self.location.clone(),
            },
            configuration: JobConfiguration {
                load: LoadConfiguration {
                    source_uris: [request.source_uri.as_str()],
                    destination_table: TableReference {
                        project_id: &self.project,
                        dataset_id: &request.dataset,
                        table_id: &request.table,
                    },
                    source_format: "PARQUET",
                    write_disposition: write_disposition(request.mode),
                },
            },
        };

        let url = format!("{}/projects/{}/jobs", self.endpoint, self.project);
        let response = self
            .authorize(self.client.post(&url).json(&body))
            .send()
            .await
            .map_err(|e| submit_error(e.to_string()))?;
        let resource = Self::parse_job(response).await.map_err(submit_error)?;

        Ok(LoadJob {
            id: resource.job_reference.job_id,
            location: resource.job_reference.location.or(self.location.clone()),
        })
    }

    async fn job_state(&self, job: &LoadJob) -> Result<JobState, LoadJobError> {
        let poll_error = |message: String| LoadJobError::Poll {
            job_id: job.id.clone(),
            message,
        };

        let url = format!("{}/projects/{}/jobs/{}", self.endpoint, self.project, job.id);
        let mut request = self.client.get(&url);
        if let Some(location) = &job.location {
            request = request.query(&[("location", location)]);
        }

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| poll_error(e.to_string()))?;
        let resource = Self::parse_job(response).await.map_err(poll_error)?;
        Ok(job_state(&resource))
    }

    fn name(&self) -> &str {
        "bigquery"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::WarehouseLoader;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn json_response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    /// Answers each connection with the next canned response and records the requests.
    async fn fake_api(responses: Vec<String>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();

        tokio::spawn(async move {
            for reply in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut raw = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    raw.extend_from_slice(&buf[..n]);
                    let text = String::from_utf8_lossy(&raw);
                    if let Some(end) = text.find("\r\n\r\n") {
                        let length = text[..end]
                            .lines()
                            .find_map(|l| {
                                let (k, v) = l.split_once(':')?;
                                k.eq_ignore_ascii_case("content-length")
                                    .then(|| v.trim().parse::<usize>().ok())?
                            })
                            .unwrap_or(0);
                        if raw.len() >= end + 4 + length {
                            break;
                        }
                    }
                }
                seen.lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(&raw).into_owned());
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{addr}/bigquery/v2"), requests)
    }

    fn warehouse(endpoint: String) -> BigQueryWarehouse {
        BigQueryWarehouse::new(&BigQueryConfig {
            project: "teak-gamma-442315-f8".to_string(),
            access_token: Some("ya29.token".to_string()),
            location: Some("US".to_string()),
            endpoint,
            request_timeout_secs: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_load_submits_truncate_job_and_polls_to_done() {
        let (endpoint, requests) = fake_api(vec![
            json_response(
                "200 OK",
                r#"{"jobReference":{"projectId":"teak-gamma-442315-f8","jobId":"job_abc","location":"US"},"status":{"state":"RUNNING"}}"#,
            ),
            json_response(
                "200 OK",
                r#"{"jobReference":{"projectId":"teak-gamma-442315-f8","jobId":"job_abc","location":"US"},"status":{"state":"RUNNING"}}"#,
            ),
            json_response(
                "200 OK",
                r#"{"jobReference":{"projectId":"teak-gamma-442315-f8","jobId":"job_abc","location":"US"},"status":{"state":"DONE"}}"#,
            ),
        ])
        .await;

        let loader = WarehouseLoader::with_timing(
            Arc::new(warehouse(endpoint)),
            Duration::from_millis(1),
            Duration::from_secs(5),
        );
        let job = loader
            .load(
                "gs://data-pipeline-parquet-teak-gamma-442315-f8/processed/yellow_taxi_data.parquet",
                "data_pipeline",
                "yellow_taxi_trips",
                WriteMode::Replace,
            )
            .await
            .unwrap();
        assert_eq!(job.id, "job_abc");

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        let insert = &requests[0];
        assert!(insert.starts_with("POST /bigquery/v2/projects/teak-gamma-442315-f8/jobs "));
        assert!(insert.to_ascii_lowercase().contains("authorization: bearer ya29.token"));
        assert!(insert.contains(r#""writeDisposition":"WRITE_TRUNCATE""#));
        assert!(insert.contains(r#""sourceFormat":"PARQUET""#));
        assert!(insert.contains(r#""datasetId":"data_pipeline""#));
        assert!(insert.contains("processed/yellow_taxi_data.parquet"));
        assert!(requests[1].starts_with("GET /bigquery/v2/projects/teak-gamma-442315-f8/jobs/job_abc?location=US "));
    }

    #[tokio::test]
    async fn test_error_result_fails_job() {
        let (endpoint, _) = fake_api(vec![
            json_response(
                "200 OK",
                r#"{"jobReference":{"projectId":"p","jobId":"job_x"}}"#,
            ),
            json_response(
                "200 OK",
                r#"{"jobReference":{"projectId":"p","jobId":"job_x"},"status":{"state":"DONE","errorResult":{"reason":"invalid","message":"Error while reading data"}}}"#,
            ),
        ])
        .await;

        let loader = WarehouseLoader::with_timing(
            Arc::new(warehouse(endpoint)),
            Duration::from_millis(1),
            Duration::from_secs(5),
        );
        let err = loader
            .load("gs://b/processed/x.parquet", "d", "t", WriteMode::Replace)
            .await
            .unwrap_err();
        match err {
            LoadJobError::JobFailed { job_id, detail } => {
                assert_eq!(job_id, "job_x");
                assert_eq!(detail, "invalid: Error while reading data");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_http_error_on_submit() {
        let (endpoint, _) = fake_api(vec![json_response(
            "403 Forbidden",
            r#"{"error":{"message":"Access Denied"}}"#,
        )])
        .await;

        let err = warehouse(endpoint)
            .submit_load(&LoadRequest {
                source_uri: "gs://b/k".to_string(),
                dataset: "d".to_string(),
                table: "t".to_string(),
                mode: WriteMode::Append,
            })
            .await
            .unwrap_err();
        match err {
            LoadJobError::Submit { message, .. } => {
                assert!(message.contains("403"));
                assert!(message.contains("Access Denied"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stalled_submit_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        let warehouse = BigQueryWarehouse::new(&BigQueryConfig {
            endpoint: format!("http://{addr}/bigquery/v2"),
            request_timeout_secs: 1,
            ..BigQueryConfig::default()
        })
        .unwrap();

        let err = tokio::time::timeout(
            Duration::from_secs(10),
            warehouse.submit_load(&LoadRequest {
                source_uri: "gs://b/k".to_string(),
                dataset: "d".to_string(),
                table: "t".to_string(),
                mode: WriteMode::Replace,
            }),
        )
        .await
        .expect("submit should give up on its own")
        .unwrap_err();

        assert!(matches!(err, LoadJobError::Submit { .. }));
    }

    #[tokio::test]
    async fn test_rejects_non_gcs_source() {
        let err = warehouse("http://127.0.0.1:1".to_string())
            .submit_load(&LoadRequest {
                source_uri: "s3://b/k".to_string(),
                dataset: "d".to_string(),
                table: "t".to_string(),
                mode: WriteMode::Replace,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LoadJobError::Unsupported { .. }));
    }

    #[test]
    fn test_write_disposition_mapping() {
        assert_eq!(write_disposition(WriteMode::Replace), "WRITE_TRUNCATE");
        assert_eq!(write_disposition(WriteMode::Append), "WRITE_APPEND");
    }
}
