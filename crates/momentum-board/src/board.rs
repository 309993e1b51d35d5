//! The board collaborator: projects, epics and tasks behind a REST API.

use momentum_core::{BoardConfig, Epic, Project, ProjectId, Task, TaskFilters, TaskId, TaskStatus};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::ACCEPT;
use reqwest::Url;
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::error::BoardError;

/// Read and status-write access to the board. Every call may fail; callers
/// treat failures as transient.
pub trait Board: Send + Sync {
    fn list_projects(&self) -> Result<Vec<Project>, BoardError>;
    fn list_epics(&self, project_id: &ProjectId) -> Result<Vec<Epic>, BoardError>;
    fn list_tasks(
        &self,
        project_id: &ProjectId,
        filters: &TaskFilters,
    ) -> Result<Vec<Task>, BoardError>;
    fn set_task_status(&self, task_id: &TaskId, status: TaskStatus) -> Result<Task, BoardError>;
}

/// Parse a board base url. Only http and https are accepted.
pub fn parse_base_url(raw: &str) -> Result<Url, BoardError> {
    let trimmed = raw.trim();
    let url = Url::parse(trimmed).map_err(|err| BoardError::InvalidUrl {
        url: trimmed.to_string(),
        message: err.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(BoardError::InvalidUrl {
            url: trimmed.to_string(),
            message: format!("unsupported scheme {other}"),
        }),
    }
}

/// Append escaped path segments to `base`, ignoring a trailing slash.
pub fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, BoardError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| BoardError::InvalidUrl {
            url: base.to_string(),
            message: "url cannot carry a path".to_string(),
        })?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[derive(Debug, Clone)]
pub struct HttpBoard {
    base_url: Url,
    client: Client,
}

impl HttpBoard {
    pub fn new(base_url: &str, timeout: Option<Duration>) -> Result<Self, BoardError> {
        let base_url = parse_base_url(base_url)?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| BoardError::Client { source })?;
        Ok(Self { base_url, client })
    }

    pub fn from_config(config: &BoardConfig) -> Result<Self, BoardError> {
        let timeout = (config.request_timeout_secs > 0)
            .then(|| Duration::from_secs(config.request_timeout_secs));
        Self::new(&config.base_url, timeout)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn send<T: DeserializeOwned>(&self, url: &Url, request: RequestBuilder) -> Result<T, BoardError> {
        let response = request
            .header(ACCEPT, "application/json")
            .send()
            .map_err(|source| BoardError::Transport {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        let body = response.text().map_err(|source| BoardError::Transport {
            url: url.to_string(),
            source,
        })?;

        if !status.is_success() {
            let message = if body.trim().is_empty() {
                status.canonical_reason().unwrap_or("unknown status").to_string()
            } else {
                body
            };
            return Err(BoardError::Api {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_str(&body).map_err(|source| BoardError::Decode {
            url: url.to_string(),
            source,
        })
    }
}

impl Board for HttpBoard {
    fn list_projects(&self) -> Result<Vec<Project>, BoardError> {
        let url = endpoint(&self.base_url, &["api", "projects"])?;
        self.send(&url, self.client.get(url.clone()))
    }

    fn list_epics(&self, project_id: &ProjectId) -> Result<Vec<Epic>, BoardError> {
        let url = endpoint(&self.base_url, &["api", "projects", project_id.0.as_str(), "epics"])?;
        self.send(&url, self.client.get(url.clone()))
    }

    fn list_tasks(
        &self,
        project_id: &ProjectId,
        filters: &TaskFilters,
    ) -> Result<Vec<Task>, BoardError> {
        let mut url = endpoint(&self.base_url, &["api", "projects", project_id.0.as_str(), "tasks"])?;
        if filters.epic_id.is_some() || filters.status.is_some() {
            let mut query = url.query_pairs_mut();
            if let Some(epic_id) = &filters.epic_id {
                query.append_pair("epic_id", &epic_id.0);
            }
            if let Some(status) = filters.status {
                query.append_pair("status", status.as_str());
            }
        }
        self.send(&url, self.client.get(url.clone()))
    }

    fn set_task_status(&self, task_id: &TaskId, status: TaskStatus) -> Result<Task, BoardError> {
        let url = endpoint(&self.base_url, &["api", "tasks", task_id.0.as_str()])?;
        let request = self
            .client
            .patch(url.clone())
            .json(&serde_json::json!({ "status": status.as_str() }));
        self.send(&url, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Run a blocking board call off the async test runtime.
    async fn call<T, F>(server: &MockServer, f: F) -> Result<T, BoardError>
    where
        T: Send + 'static,
        F: FnOnce(&HttpBoard) -> Result<T, BoardError> + Send + 'static,
    {
        let base_url = server.uri();
        tokio::task::spawn_blocking(move || {
            let board = HttpBoard::new(&base_url, Some(Duration::from_secs(5))).expect("board");
            f(&board)
        })
        .await
        .expect("join")
    }

    #[test]
    fn base_url_must_be_http() {
        assert!(parse_base_url("http://localhost:3000").is_ok());
        assert!(parse_base_url(" https://flux.example/ ").is_ok());
        assert!(matches!(
            parse_base_url("ftp://flux.example"),
            Err(BoardError::InvalidUrl { .. })
        ));
        assert!(matches!(
            parse_base_url("not a url"),
            Err(BoardError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn endpoint_ignores_trailing_slash_and_escapes_segments() {
        let base = parse_base_url("http://localhost:3000/flux/").expect("base");
        let url = endpoint(&base, &["api", "projects", "a b", "epics"]).expect("endpoint");
        assert_eq!(url.as_str(), "http://localhost:3000/flux/api/projects/a%20b/epics");
    }

    #[tokio::test]
    async fn list_projects_decodes_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/projects"))
            .and(header("accept", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "id": "p1", "name": "One" },
                { "id": "p2", "name": "Two", "description": "d" }
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let projects = call(&server, |board| board.list_projects())
            .await
            .expect("projects");
        assert_eq!(projects.len(), 2);
        assert_eq!(projects[1].description, "d");
    }

    #[tokio::test]
    async fn list_epics_reads_the_project_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/projects/p1/epics"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "id": "e1", "title": "Auto", "status": "todo", "project_id": "p1", "auto": true }
            ])))
            .mount(&server)
            .await;

        let epics = call(&server, |board| board.list_epics(&ProjectId::new("p1")))
            .await
            .expect("epics");
        assert_eq!(epics.len(), 1);
        assert!(epics[0].auto);
    }

    #[tokio::test]
    async fn list_tasks_sends_filters_as_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/projects/p1/tasks"))
            .and(query_param("epic_id", "e1"))
            .and(query_param("status", "todo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "id": "t1", "title": "A", "status": "todo", "project_id": "p1", "epic_id": "e1" }
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let filters = TaskFilters {
            epic_id: Some(momentum_core::EpicId::new("e1")),
            status: Some(TaskStatus::Todo),
        };
        let tasks = call(&server, move |board| {
            board.list_tasks(&ProjectId::new("p1"), &filters)
        })
        .await
        .expect("tasks");
        assert_eq!(tasks[0].id, TaskId::new("t1"));
    }

    #[tokio::test]
    async fn set_task_status_patches_and_returns_task() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/api/tasks/t9"))
            .and(body_json(serde_json::json!({ "status": "in_progress" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "t9", "title": "Ship", "status": "in_progress", "project_id": "p1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let task = call(&server, |board| {
            board.set_task_status(&TaskId::new("t9"), TaskStatus::InProgress)
        })
        .await
        .expect("patch");
        assert_eq!(task.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn non_success_status_becomes_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/projects"))
            .respond_with(ResponseTemplate::new(404).set_body_string("task not found"))
            .mount(&server)
            .await;
        let err = call(&server, |board| board.list_projects())
            .await
            .expect_err("404");
        assert!(matches!(err, BoardError::Api { status: 404, ref message } if message == "task not found"));

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/projects"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let err = call(&server, |board| board.list_projects())
            .await
            .expect_err("500");
        assert!(
            matches!(err, BoardError::Api { status: 500, ref message } if message == "Internal Server Error")
        );
    }

    #[tokio::test]
    async fn malformed_body_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/projects"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{not json"))
            .mount(&server)
            .await;

        let result = call(&server, |board| board.list_projects()).await;
        assert!(matches!(result, Err(BoardError::Decode { .. })));
    }

    #[test]
    fn unreachable_board_is_a_transport_error() {
        let port = TcpListener::bind("127.0.0.1:0")
            .and_then(|listener| listener.local_addr())
            .expect("free port")
            .port();
        let board = HttpBoard::new(&format!("http://127.0.0.1:{port}"), Some(Duration::from_secs(2)))
            .expect("board");
        assert!(matches!(
            board.list_projects(),
            Err(BoardError::Transport { .. })
        ));
    }
}
