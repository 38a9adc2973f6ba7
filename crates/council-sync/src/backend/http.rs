use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use tracing::debug;

use super::{BackendError, BackendResult, CouncilBackend};
use crate::lifecycle::Transition;
use crate::model::{Amendment, EntityId, EntityKey, SessionId, Topic, VoteType};

/// Portal REST API over reqwest with an optional bearer token.
#[derive(Clone)]
pub struct HttpBackend {
    http: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoteBody {
    vote_type: VoteType,
}

impl HttpBackend {
    /// Every request is bounded by `timeout`; a hung portal surfaces as
    /// [`BackendError::Http`].
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> BackendResult<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(http, base_url, token))
    }

    pub fn with_client(http: Client, base_url: impl Into<String>, token: Option<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            base_url,
            token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn entity_url(&self, key: EntityKey, action: &str) -> String {
        format!("{}/{}/{}/{}", self.base_url, key.kind.path(), key.id, action)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn check(res: Response, key: Option<EntityKey>) -> BackendResult<Response> {
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        let body = res.text().await.unwrap_or_default();
        match (status, key) {
            (StatusCode::CONFLICT, _) => Err(BackendError::Conflict { body }),
            (StatusCode::NOT_FOUND, Some(key)) => Err(BackendError::NotFound(key)),
            _ => Err(BackendError::UnexpectedStatus { status, body }),
        }
    }
}

#[async_trait]
impl CouncilBackend for HttpBackend {
    async fn cast_vote(&self, key: EntityKey, vote: VoteType) -> BackendResult<()> {
        let url = self.entity_url(key, "vote");
        debug!(target = "council.view", %key, %vote, "PUT {url}");
        let req = self.http.put(url).json(&VoteBody { vote_type: vote });
        let res = self.authorize(req).send().await?;
        Self::check(res, Some(key)).await?;
        Ok(())
    }

    async fn transition(&self, key: EntityKey, transition: Transition) -> BackendResult<()> {
        let url = self.entity_url(key, transition.endpoint());
        debug!(target = "council.view", %key, %transition, "PUT {url}");
        let res = self.authorize(self.http.put(url)).send().await?;
        Self::check(res, Some(key)).await?;
        Ok(())
    }

    async fn list_topics(&self, session: SessionId) -> BackendResult<Vec<Topic>> {
        let url = format!("{}/sessions/{}/topics", self.base_url, session);
        let res = self.authorize(self.http.get(url)).send().await?;
        let mut topics: Vec<Topic> = Self::check(res, None).await?.json().await?;
        topics.sort_by_key(|topic| topic.order_id);
        Ok(topics)
    }

    async fn list_amendments(&self, topic: EntityId) -> BackendResult<Vec<Amendment>> {
        let key = EntityKey::topic(topic);
        let url = self.entity_url(key, "amendments");
        let res = self.authorize(self.http.get(url)).send().await?;
        let mut amendments: Vec<Amendment> = Self::check(res, Some(key)).await?.json().await?;
        amendments.sort_by_key(|amendment| amendment.order_id);
        Ok(amendments)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::{get, put};
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    use super::*;
    use crate::model::EntityStatus;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[derive(Clone, Default)]
    struct Recorded {
        requests: Arc<Mutex<Vec<(String, Option<String>, Value)>>>,
    }

    async fn spawn_portal() -> (String, Recorded) {
        let recorded = Recorded::default();
        let app = Router::new()
            .route(
                "/api/topics/:id/vote",
                put(
                    |State(rec): State<Recorded>,
                     Path(id): Path<u64>,
                     headers: HeaderMap,
                     Json(body): Json<Value>| async move {
                        let auth = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        rec.requests.lock().push((format!("vote/{id}"), auth, body));
                        if id == 99 {
                            (AxumStatus::CONFLICT, "voting is not active").into_response()
                        } else {
                            AxumStatus::OK.into_response()
                        }
                    },
                ),
            )
            .route(
                "/api/amendments/:id/finish",
                put(|State(rec): State<Recorded>, Path(id): Path<u64>| async move {
                    rec.requests
                        .lock()
                        .push((format!("finish/{id}"), None, Value::Null));
                    AxumStatus::NO_CONTENT
                }),
            )
            .route(
                "/api/topics/:id/amendments",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Json(json!([]))
                }),
            )
            .route(
                "/api/sessions/:id/topics",
                get(|Path(id): Path<u64>| async move {
                    Json(json!([
                        {"id": 2, "orderId": 2, "title": "Budget", "status": "CREATED",
                         "yes": 0, "no": 0, "abstained": 0, "cantVote": 0, "haveNotVoted": 0, "absent": 0},
                        {"id": 1, "orderId": 1, "title": format!("Opening of session {id}"), "status": "ACTIVE",
                         "yes": 3, "no": 1, "abstained": 0, "cantVote": 0, "haveNotVoted": 2, "absent": 1}
                    ]))
                }),
            )
            .with_state(recorded.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        (format!("http://{addr}/api/"), recorded)
    }

    #[tokio::test]
    async fn votes_with_bearer_token_and_camel_case_body() {
        let (base, recorded) = spawn_portal().await;
        let backend = HttpBackend::new(base, Some("tok".into()), TIMEOUT).expect("client");
        backend
            .cast_vote(EntityKey::topic(5), VoteType::CannotVote)
            .await
            .expect("vote");

        let requests = recorded.requests.lock().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "vote/5");
        assert_eq!(requests[0].1.as_deref(), Some("Bearer tok"));
        assert_eq!(requests[0].2, json!({"voteType": "CANNOT_VOTE"}));
    }

    #[tokio::test]
    async fn conflict_status_maps_to_conflict() {
        let (base, _) = spawn_portal().await;
        let backend = HttpBackend::new(base, None, TIMEOUT).expect("client");
        let err = backend
            .cast_vote(EntityKey::topic(99), VoteType::Yes)
            .await
            .unwrap_err();
        assert!(err.is_conflict(), "{err}");
        assert!(err.to_string().contains("voting is not active"));
    }

    #[tokio::test]
    async fn transitions_hit_the_action_endpoint() {
        let (base, recorded) = spawn_portal().await;
        let backend = HttpBackend::new(base, None, TIMEOUT).expect("client");
        backend
            .transition(EntityKey::amendment(8), Transition::Finish)
            .await
            .expect("finish");
        assert_eq!(recorded.requests.lock()[0].0, "finish/8");

        let err = backend
            .transition(EntityKey::topic(8), Transition::Restart)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NotFound(key) if key == EntityKey::topic(8)));
    }

    #[tokio::test]
    async fn topics_come_back_in_agenda_order() {
        let (base, _) = spawn_portal().await;
        let backend = HttpBackend::new(base, None, TIMEOUT).expect("client");
        let topics = backend.list_topics(4).await.expect("topics");
        assert_eq!(topics.iter().map(|t| t.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(topics[0].status, EntityStatus::Active);
        assert_eq!(topics[0].tally.as_tuple(), (3, 1, 0, 0, 2, 1));
        assert_eq!(topics[0].title, "Opening of session 4");
    }

    #[tokio::test]
    async fn hung_portal_times_out() {
        let (base, _) = spawn_portal().await;
        let backend = HttpBackend::new(base, None, Duration::from_millis(200)).expect("client");
        let err = backend.list_amendments(3).await.unwrap_err();
        assert!(matches!(&err, BackendError::Http(inner) if inner.is_timeout()), "{err}");
    }
}
