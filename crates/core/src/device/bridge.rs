use crate::config::DeviceAddress;
use crate::device::{DeviceError, DeviceSession, SessionFactory, SpeechTask, SubjectId};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const LOG_TARGET: &str = "affect::device::bridge";
const PEOPLE_LIST_KEY: &str = "PeoplePerception/PeopleList";

/// Services that must resolve before a session is handed out.
pub const REQUIRED_SERVICES: [&str; 6] = [
    "ALMemory",
    "ALTextToSpeech",
    "ALAnimatedSpeech",
    "ALAnimationPlayer",
    "ALFaceCharacteristics",
    "ALBasicAwareness",
];

fn expression_key(subject: SubjectId) -> String {
    format!("PeoplePerception/Person/{subject}/ExpressionProperties")
}

/// Talks to a JSON bridge process that owns the vendor session on our behalf.
///
/// `POST {base}/sessions` opens a session for a device address, `POST
/// {base}/sessions/{id}/call` forwards one service call, and `DELETE
/// {base}/sessions/{id}` releases it.
///
/// Every request is bounded by `request_timeout` except blocking speech (`say` and
/// `wait`), which may take as long as `speech_timeout` plus one ordinary round trip.
#[derive(Clone)]
pub struct BridgeSessionFactory {
    client: Client,
    base_url: Url,
    speech_call_timeout: Duration,
}

impl BridgeSessionFactory {
    pub fn new(
        base_url: Url,
        request_timeout: Duration,
        speech_timeout: Duration,
    ) -> Result<Self, DeviceError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| DeviceError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: as_directory(base_url),
            speech_call_timeout: speech_timeout.saturating_add(request_timeout),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, DeviceError> {
        self.base_url
            .join(path)
            .map_err(|e| DeviceError::Transport(format!("bad bridge url: {e}")))
    }
}

/// `Url::join` replaces the last segment of a base without a trailing slash.
fn as_directory(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

#[derive(Serialize)]
struct OpenRequest<'a> {
    address: &'a str,
}

#[derive(Deserialize)]
struct OpenResponse {
    session: String,
}

#[derive(Serialize)]
struct CallRequest<'a> {
    service: &'a str,
    method: &'a str,
    args: Vec<Value>,
}

#[derive(Deserialize)]
struct CallResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

impl SessionFactory for BridgeSessionFactory {
    fn connect(
        &self,
        address: DeviceAddress,
    ) -> BoxFuture<'_, Result<Arc<dyn DeviceSession>, DeviceError>> {
        async move {
            let url = self.endpoint("sessions")?;
            let response = self
                .client
                .post(url)
                .json(&OpenRequest {
                    address: address.as_str(),
                })
                .send()
                .await
                .map_err(|e| DeviceError::Transport(e.to_string()))?;
            if !response.status().is_success() {
                let status = response.status();
                let details = response.text().await.unwrap_or_default();
                return Err(DeviceError::Transport(format!(
                    "bridge refused session for {address}: {status} {details}"
                )));
            }
            let opened: OpenResponse = response.json().await.map_err(|e| DeviceError::BadReply {
                call: "open session".into(),
                details: e.to_string(),
            })?;

            let session = BridgeSession {
                client: self.client.clone(),
                base: self.endpoint(&format!("sessions/{}/", opened.session))?,
                release_url: self.endpoint(&format!("sessions/{}", opened.session))?,
                speech_call_timeout: self.speech_call_timeout,
            };
            for service in REQUIRED_SERVICES {
                if let Err(e) = session.resolve_service(service).await {
                    session.release().await;
                    return Err(e);
                }
            }
            tracing::info!(target: LOG_TARGET, %address, session = %opened.session, "session opened");
            let session: Arc<dyn DeviceSession> = Arc::new(session);
            Ok(session)
        }
        .boxed()
    }
}

struct BridgeSession {
    client: Client,
    base: Url,
    release_url: Url,
    speech_call_timeout: Duration,
}

impl BridgeSession {
    fn url(&self, path: &str) -> Result<Url, DeviceError> {
        self.base
            .join(path)
            .map_err(|e| DeviceError::Transport(format!("bad bridge url: {e}")))
    }

    async fn resolve_service(&self, service: &str) -> Result<(), DeviceError> {
        let response = self
            .client
            .get(self.url(&format!("services/{service}"))?)
            .send()
            .await
            .map_err(|e| DeviceError::Transport(e.to_string()))?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(DeviceError::ServiceUnavailable(service.to_owned())),
            s => Err(DeviceError::Transport(format!(
                "resolving {service} returned {s}"
            ))),
        }
    }

    async fn call(&self, service: &str, method: &str, args: Vec<Value>) -> Result<Value, DeviceError> {
        self.call_within(service, method, args, None).await
    }

    /// Blocks for as long as the robot is talking.
    async fn speech_call(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, DeviceError> {
        self.call_within("ALAnimatedSpeech", method, args, Some(self.speech_call_timeout))
            .await
    }

    async fn call_within(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, DeviceError> {
        let call = format!("{service}.{method}");
        let mut request = self.client.post(self.url("call")?).json(&CallRequest {
            service,
            method,
            args,
        });
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request
            .send()
            .await
            .map_err(|e| DeviceError::Transport(e.to_string()))?;
        if response.status() == StatusCode::GONE {
            return Err(DeviceError::NotConnected);
        }
        if !response.status().is_success() {
            return Err(DeviceError::CallFailed {
                call,
                details: format!("http {}", response.status()),
            });
        }
        let reply: CallResponse = response.json().await.map_err(|e| DeviceError::BadReply {
            call: call.clone(),
            details: e.to_string(),
        })?;
        match reply.error {
            Some(details) => Err(DeviceError::CallFailed { call, details }),
            None => Ok(reply.result),
        }
    }

    async fn release(&self) {
        if let Err(e) = self.client.delete(self.release_url.clone()).send().await {
            tracing::debug!(target: LOG_TARGET, error = %e, "session release failed");
        }
    }
}

fn parse_subjects(value: Value) -> Result<Vec<SubjectId>, DeviceError> {
    match value {
        Value::Null => Ok(Vec::new()),
        other => serde_json::from_value(other).map_err(|e| DeviceError::BadReply {
            call: "ALMemory.getData(PeopleList)".into(),
            details: e.to_string(),
        }),
    }
}

/// Anything that is not a flat list of numbers counts as an absent sample.
fn parse_scores(value: Value) -> Option<Vec<f32>> {
    serde_json::from_value::<Vec<f32>>(value)
        .ok()
        .filter(|scores| !scores.is_empty())
}

impl DeviceSession for BridgeSession {
    fn ping(&self) -> BoxFuture<'_, Result<(), DeviceError>> {
        async move { self.call("ALMemory", "ping", vec![]).await.map(|_| ()) }.boxed()
    }

    fn list_present_subjects(&self) -> BoxFuture<'_, Result<Vec<SubjectId>, DeviceError>> {
        async move {
            let value = self
                .call("ALMemory", "getData", vec![json!(PEOPLE_LIST_KEY)])
                .await?;
            parse_subjects(value)
        }
        .boxed()
    }

    fn request_expression_analysis(
        &self,
        subject: SubjectId,
    ) -> BoxFuture<'_, Result<(), DeviceError>> {
        async move {
            self.call(
                "ALFaceCharacteristics",
                "analyzeFaceCharacteristics",
                vec![json!(subject.0)],
            )
            .await
            .map(|_| ())
        }
        .boxed()
    }

    fn read_expression_scores(
        &self,
        subject: SubjectId,
    ) -> BoxFuture<'_, Result<Option<Vec<f32>>, DeviceError>> {
        async move {
            let value = self
                .call("ALMemory", "getData", vec![json!(expression_key(subject))])
                .await?;
            Ok(parse_scores(value))
        }
        .boxed()
    }

    fn set_prosody_parameter(
        &self,
        name: &'static str,
        value: f32,
    ) -> BoxFuture<'_, Result<(), DeviceError>> {
        async move {
            self.call("ALTextToSpeech", "setParameter", vec![json!(name), json!(value)])
                .await
                .map(|_| ())
        }
        .boxed()
    }

    fn say(&self, annotated: String) -> BoxFuture<'_, Result<(), DeviceError>> {
        async move {
            self.speech_call("say", vec![json!(annotated)])
                .await
                .map(|_| ())
        }
        .boxed()
    }

    fn post_say(&self, annotated: String) -> BoxFuture<'_, Result<SpeechTask, DeviceError>> {
        async move {
            let value = self
                .call("ALAnimatedSpeech", "post.say", vec![json!(annotated)])
                .await?;
            serde_json::from_value(value).map_err(|e| DeviceError::BadReply {
                call: "ALAnimatedSpeech.post.say".into(),
                details: e.to_string(),
            })
        }
        .boxed()
    }

    fn wait(&self, task: SpeechTask) -> BoxFuture<'_, Result<(), DeviceError>> {
        async move {
            self.speech_call("wait", vec![json!(task.0)])
                .await
                .map(|_| ())
        }
        .boxed()
    }

    fn play_gesture(&self, gesture: String) -> BoxFuture<'_, Result<(), DeviceError>> {
        async move {
            self.call("ALAnimationPlayer", "run", vec![json!(gesture)])
                .await
                .map(|_| ())
        }
        .boxed()
    }

    fn start_awareness(&self) -> BoxFuture<'_, Result<(), DeviceError>> {
        async move {
            self.call("ALBasicAwareness", "startAwareness", vec![])
                .await
                .map(|_| ())
        }
        .boxed()
    }

    fn stop_awareness(&self) -> BoxFuture<'_, Result<(), DeviceError>> {
        async move {
            self.call("ALBasicAwareness", "stopAwareness", vec![])
                .await
                .map(|_| ())
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        async move { self.release().await }.boxed()
    }
}
