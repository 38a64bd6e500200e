//! Scale action dispatch.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use scalegrid_state::{ActionAuth, ActionHttp, Direction};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::error::ActionError;
use crate::retry::{RetryPolicy, retry};

/// Identity of an action, matched against silence patterns.
pub fn action_id(fleet: &str, policy_id: &str, direction: Direction) -> String {
    format!("{fleet}/{policy_id}/{direction}")
}

/// A scale action ready to be delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    pub id: String,
    pub policy_id: String,
    pub fleet: String,
    pub direction: Direction,
    pub magnitude: u32,
    /// Metric value that triggered the action.
    pub value: f64,
    pub target: ActionHttp,
}

impl ActionRequest {
    /// JSON body: the action's identity, overlaid with the descriptor's
    /// extra fields.
    pub fn body(&self) -> Value {
        let mut body = Map::new();
        body.insert("action".into(), json!(self.id));
        body.insert("policy_id".into(), json!(self.policy_id));
        body.insert("fleet".into(), json!(self.fleet));
        body.insert("direction".into(), json!(self.direction));
        body.insert("magnitude".into(), json!(self.magnitude));
        body.insert("value".into(), json!(self.value));
        if let Some(extra) = &self.target.body {
            for (k, v) in extra {
                body.insert(k.clone(), v.clone());
            }
        }
        Value::Object(body)
    }
}

/// Delivers scale actions to the managed fleet.
#[async_trait]
pub trait ActionExecutor: Send + Sync + 'static {
    /// Deliver `request`, retrying as its descriptor allows. Returns the
    /// last error once the attempts are exhausted.
    async fn execute(&self, request: &ActionRequest) -> Result<(), ActionError>;
}

/// Sends actions as HTTP requests.
#[derive(Debug, Clone)]
pub struct HttpActionExecutor {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpActionExecutor {
    /// `timeout` bounds each attempt.
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    async fn attempt(&self, request: &ActionRequest, method: &Method) -> Result<(), ActionError> {
        let target = &request.target;
        let mut req = self
            .client
            .request(method.clone(), &target.url)
            .timeout(self.timeout)
            .json(&request.body());
        req = match &target.auth {
            Some(ActionAuth::ApiKey { header, key }) => req.header(header.as_str(), key.as_str()),
            Some(ActionAuth::Basic { username, password }) => {
                req.basic_auth(username, Some(password))
            }
            None => req,
        };

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ActionError::Timeout(self.timeout)
            } else if e.is_builder() {
                ActionError::Request(e.to_string())
            } else {
                ActionError::Network(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ActionError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ActionExecutor for HttpActionExecutor {
    async fn execute(&self, request: &ActionRequest) -> Result<(), ActionError> {
        let target = &request.target;
        let policy =
            RetryPolicy::from_action(target).map_err(|e| ActionError::Request(e.to_string()))?;
        let method = Method::from_bytes(target.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| ActionError::Request(e.to_string()))?;

        retry(&policy, ActionError::is_transient, |attempt| {
            debug!(action = %request.id, attempt, url = %target.url, "dispatching action");
            self.attempt(request, &method)
        })
        .await?;
        info!(action = %request.id, magnitude = request.magnitude, "action delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};

    use super::*;

    #[derive(Default)]
    struct Received {
        calls: Mutex<Vec<(HeaderMap, Value)>>,
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn record(
        State(rx): State<Arc<Received>>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> StatusCode {
        rx.calls.lock().unwrap().push((headers, body));
        StatusCode::OK
    }

    async fn fail(State(rx): State<Arc<Received>>, headers: HeaderMap) -> StatusCode {
        rx.calls.lock().unwrap().push((headers, Value::Null));
        StatusCode::INTERNAL_SERVER_ERROR
    }

    async fn slow(State(rx): State<Arc<Received>>, headers: HeaderMap) -> StatusCode {
        rx.calls.lock().unwrap().push((headers, Value::Null));
        tokio::time::sleep(Duration::from_millis(500)).await;
        StatusCode::OK
    }

    async fn fake_target() -> (String, Arc<Received>) {
        let received = Arc::new(Received::default());
        let router = Router::new()
            .route("/scale", post(record))
            .route("/broken", post(fail))
            .route("/slow", post(slow))
            .with_state(received.clone());
        (serve(router).await, received)
    }

    fn request(url: &str, target: Value) -> ActionRequest {
        let mut target = target;
        target["url"] = json!(url);
        ActionRequest {
            id: action_id("web", "p1", Direction::ScaleOut),
            policy_id: "p1".into(),
            fleet: "web".into(),
            direction: Direction::ScaleOut,
            magnitude: 2,
            value: 85.0,
            target: serde_json::from_value(target).unwrap(),
        }
    }

    #[test]
    fn action_identity_names_fleet_policy_and_direction() {
        assert_eq!(action_id("web", "p1", Direction::ScaleIn), "web/p1/scale-in");
    }

    #[tokio::test]
    async fn delivers_body_and_api_key() {
        let (base, received) = fake_target().await;
        let req = request(
            &format!("{base}/scale"),
            json!({
                "auth": {"type": "api_key", "key": "s3cret"},
                "body": {"stack": "web-asg"}
            }),
        );

        HttpActionExecutor::new(Duration::from_secs(2))
            .execute(&req)
            .await
            .unwrap();

        let calls = received.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (headers, body) = &calls[0];
        assert_eq!(headers["x-api-key"], "s3cret");
        assert_eq!(body["action"], "web/p1/scale-out");
        assert_eq!(body["direction"], "scale-out");
        assert_eq!(body["magnitude"], 2);
        assert_eq!(body["stack"], "web-asg");
    }

    #[tokio::test]
    async fn basic_auth_header() {
        let (base, received) = fake_target().await;
        let req = request(
            &format!("{base}/scale"),
            json!({"auth": {"type": "basic", "username": "ops", "password": "pw"}}),
        );
        HttpActionExecutor::new(Duration::from_secs(2))
            .execute(&req)
            .await
            .unwrap();

        let calls = received.calls.lock().unwrap();
        // base64("ops:pw")
        assert_eq!(calls[0].0["authorization"], "Basic b3BzOnB3");
    }

    #[tokio::test]
    async fn error_status_is_not_retried() {
        let (base, received) = fake_target().await;
        let req = request(
            &format!("{base}/broken"),
            json!({"attempts": 3, "delay": "10ms"}),
        );
        let err = HttpActionExecutor::new(Duration::from_secs(2))
            .execute(&req)
            .await
            .unwrap_err();

        assert!(matches!(err, ActionError::Status { status: 500, .. }));
        assert_eq!(received.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn timeouts_are_retried_up_to_the_attempt_limit() {
        let (base, received) = fake_target().await;
        let req = request(
            &format!("{base}/slow"),
            json!({"attempts": 3, "delay": "10ms"}),
        );
        let err = HttpActionExecutor::new(Duration::from_millis(100))
            .execute(&req)
            .await
            .unwrap_err();

        assert!(matches!(err, ActionError::Timeout(_)));
        assert_eq!(received.calls.lock().unwrap().len(), 3);
    }
}
