use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, Url};

use super::error::{ChannelError, is_transient_status};
use super::types::{
    AckRequest, RepairAction, RepairRequest, StatusChange, StatusChangeRequest, StepResponse,
};
use super::PolicyAgentChannel;
use crate::model::Snapshot;

/// HTTP adapter for the control plane's policy agent.
pub struct HttpPolicyAgentChannel {
    client: Client,
    base_url: Url,
}

impl HttpPolicyAgentChannel {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, ChannelError> {
        let base_url =
            Url::parse(base_url).map_err(|e| ChannelError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ChannelError::InvalidUrl(base_url.to_string()));
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(request_timeout)
            .build()?;
        Ok(Self { client, base_url })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ChannelError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ChannelError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn check(response: Response) -> Result<Response, ChannelError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let code = status.as_u16();
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        if is_transient_status(code) {
            Err(ChannelError::Unavailable {
                status: code,
                message,
            })
        } else {
            Err(ChannelError::Rejected {
                status: code,
                message,
            })
        }
    }
}

#[async_trait]
impl PolicyAgentChannel for HttpPolicyAgentChannel {
    async fn fetch_snapshot(&self) -> Result<Snapshot, ChannelError> {
        let response = self.client.get(self.url(&["snapshot"])?).send().await?;
        let snapshot = Self::check(response).await?.json::<Snapshot>().await?;
        Ok(snapshot)
    }

    async fn acknowledge(
        &self,
        job_id: &str,
        response: StepResponse,
        delete_step_if_present: bool,
    ) -> Result<(), ChannelError> {
        let body = AckRequest {
            response,
            delete_step_if_present,
        };
        let response = self
            .client
            .post(self.url(&["jobs", job_id, "ack"])?)
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn request_repair(
        &self,
        role_instance: &str,
        action: RepairAction,
        context_token: Option<&str>,
    ) -> Result<(), ChannelError> {
        let body = RepairRequest {
            role_instance: role_instance.to_string(),
            action,
            context_token: context_token.map(str::to_string),
        };
        let response = self
            .client
            .post(self.url(&["repairs"])?)
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn request_status_change(
        &self,
        job_id: &str,
        change: StatusChange,
    ) -> Result<(), ChannelError> {
        let response = self
            .client
            .post(self.url(&["jobs", job_id, "status"])?)
            .json(&StatusChangeRequest { change })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobStatus;
    use crate::retry::Retryable;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn channel(server: &MockServer) -> HttpPolicyAgentChannel {
        HttpPolicyAgentChannel::new(&server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn fetch_snapshot_decodes_jobs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/snapshot"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "incarnation": 12,
                "job_document_incarnation": 3,
                "jobs": [{
                    "id": "J1",
                    "status": "Executing",
                    "impacted_role_instances": ["R0", "R1"],
                    "current_step": {
                        "phase": "WaveStarted",
                        "ack_state": "AwaitingAck",
                        "impacted_instances": [
                            {"instance": "R0", "update_domain": 0, "impact": "Reboot"},
                            {"instance": "R1", "update_domain": 0, "impact": "Reboot"}
                        ]
                    },
                    "classification": {"action": "PlatformInitiated"}
                }]
            })))
            .mount(&server)
            .await;

        let snapshot = channel(&server).fetch_snapshot().await.unwrap();
        assert_eq!(snapshot.incarnation, Some(12));
        assert_eq!(snapshot.jobs.len(), 1);
        assert_eq!(snapshot.jobs[0].status, JobStatus::Executing);
        assert_eq!(snapshot.jobs[0].wave_fingerprint(), "ud0:R0,R1");
    }

    #[tokio::test]
    async fn acknowledge_posts_step_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jobs/J1/ack"))
            .and(body_json(serde_json::json!({
                "response": {"kind": "approve"},
                "delete_step_if_present": true
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        channel(&server)
            .acknowledge("J1", StepResponse::Approve, true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn request_repair_carries_context_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/repairs"))
            .and(body_json(serde_json::json!({
                "role_instance": "NodeA",
                "action": "Reboot",
                "context_token": "tok-1"
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        channel(&server)
            .request_repair("NodeA", RepairAction::Reboot, Some("tok-1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/snapshot"))
            .respond_with(ResponseTemplate::new(503).set_body_string("draining"))
            .mount(&server)
            .await;

        let err = channel(&server).fetch_snapshot().await.unwrap_err();
        assert!(matches!(err, ChannelError::Unavailable { status: 503, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn client_errors_are_rejections() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jobs/J9/status"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such job"))
            .mount(&server)
            .await;

        let err = channel(&server)
            .request_status_change("J9", StatusChange::Suspend)
            .await
            .unwrap_err();
        match err {
            ChannelError::Rejected { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message, "no such job");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let err = HttpPolicyAgentChannel::new("not a url", Duration::from_secs(1));
        assert!(matches!(err, Err(ChannelError::InvalidUrl(_))));
    }
}
