use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};

use super::error::StoreError;
use super::types::{CancelRequest, TaskFilter, VersionReply};
use super::RepairStore;
use crate::model::RepairTask;

/// HTTP adapter for the cluster repair store.
pub struct HttpRepairStore {
    client: Client,
    base_url: Url,
}

impl HttpRepairStore {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, StoreError> {
        let base_url =
            Url::parse(base_url).map_err(|e| StoreError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(StoreError::InvalidUrl(base_url.to_string()));
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(request_timeout)
            .build()?;
        Ok(Self { client, base_url })
    }

    /// Task ids contain `/`, so they travel as a single encoded path segment.
    fn url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn check(response: Response) -> Result<Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        Err(StoreError::from_status(status.as_u16(), message))
    }

    async fn write(&self, task: &RepairTask, response: Response) -> Result<u64, StoreError> {
        match response.status() {
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                let found = response
                    .json::<VersionReply>()
                    .await
                    .map(|r| r.version)
                    .unwrap_or_default();
                Err(StoreError::VersionConflict {
                    task_id: task.task_id.clone(),
                    expected: task.version,
                    found,
                })
            }
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(task.task_id.clone())),
            _ => {
                let reply = Self::check(response).await?.json::<VersionReply>().await?;
                Ok(reply.version)
            }
        }
    }
}

#[async_trait]
impl RepairStore for HttpRepairStore {
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<RepairTask>, StoreError> {
        let mut request = self.client.get(self.url(&["tasks"])?);
        if let Some(prefix) = &filter.executor_prefix {
            request = request.query(&[("executor_prefix", prefix.as_str())]);
        }
        if !filter.states.is_empty() {
            let states = filter
                .states
                .iter()
                .map(|s| format!("{s:?}"))
                .collect::<Vec<_>>()
                .join(",");
            request = request.query(&[("states", states)]);
        }
        let response = request.send().await?;
        let tasks = Self::check(response).await?.json::<Vec<RepairTask>>().await?;
        Ok(tasks)
    }

    async fn create(&self, task: &RepairTask) -> Result<u64, StoreError> {
        let response = self
            .client
            .post(self.url(&["tasks"])?)
            .json(task)
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            return Err(StoreError::AlreadyExists(task.task_id.clone()));
        }
        let reply = Self::check(response).await?.json::<VersionReply>().await?;
        Ok(reply.version)
    }

    async fn update_execution_state(&self, task: &RepairTask) -> Result<u64, StoreError> {
        let response = self
            .client
            .put(self.url(&["tasks", &task.task_id])?)
            .json(task)
            .send()
            .await?;
        self.write(task, response).await
    }

    async fn cancel(&self, task: &RepairTask) -> Result<u64, StoreError> {
        let response = self
            .client
            .post(self.url(&["tasks", &task.task_id, "cancel"])?)
            .json(&CancelRequest {
                version: task.version,
            })
            .send()
            .await?;
        self.write(task, response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RepairTaskState;
    use chrono::Utc;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(server: &MockServer) -> HttpRepairStore {
        HttpRepairStore::new(&server.uri(), Duration::from_secs(5)).unwrap()
    }

    fn task(id: &str) -> RepairTask {
        let mut task = RepairTask::new(id, "InfraCoord", "Reboot", Utc::now());
        task.version = 3;
        task
    }

    #[tokio::test]
    async fn list_passes_filters_as_query() {
        let server = MockServer::start().await;
        let body = serde_json::to_value(vec![task("rt1")]).unwrap();
        Mock::given(method("GET"))
            .and(path("/tasks"))
            .and(query_param("executor_prefix", "InfraCoord"))
            .and(query_param("states", "Created,Claimed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .expect(1)
            .mount(&server)
            .await;

        let filter = TaskFilter::executor("InfraCoord")
            .with_states(&[RepairTaskState::Created, RepairTaskState::Claimed]);
        let tasks = store(&server).list(&filter).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_id, "rt1");
    }

    #[tokio::test]
    async fn create_conflict_means_already_exists() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tasks"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        let err = store(&server).create(&task("rt1")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(id) if id == "rt1"));
    }

    #[tokio::test]
    async fn update_returns_new_version() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/tasks/rt1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"version": 4})))
            .mount(&server)
            .await;

        let version = store(&server)
            .update_execution_state(&task("rt1"))
            .await
            .unwrap();
        assert_eq!(version, 4);
    }

    #[tokio::test]
    async fn update_conflict_reports_versions() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/tasks/rt1"))
            .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({"version": 5})))
            .mount(&server)
            .await;

        let err = store(&server)
            .update_execution_state(&task("rt1"))
            .await
            .unwrap_err();
        match err {
            StoreError::VersionConflict {
                task_id,
                expected,
                found,
            } => {
                assert_eq!(task_id, "rt1");
                assert_eq!(expected, 3);
                assert_eq!(found, 5);
            }
            other => panic!("expected version conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_posts_current_version() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tasks/rt1/cancel"))
            .and(wiremock::matchers::body_json(serde_json::json!({"version": 3})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"version": 4})))
            .expect(1)
            .mount(&server)
            .await;

        assert_eq!(store(&server).cancel(&task("rt1")).await.unwrap(), 4);
    }
}
