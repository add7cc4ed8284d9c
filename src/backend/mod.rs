//! Backend tasks: the work behind the API routes.
//!
//! A connection that routes a request to a backend spawns a [`BackendTask`]
//! next to itself on the scheduler and waits. The backend is polled once per
//! tick; when it produces a response the task posts it to the owning
//! connection by id and removes itself. Backends never touch the
//! connection directly.

pub mod cities;
pub mod surprise;
pub mod weather;

use std::task::Poll;

use tracing::debug;

use crate::context::{ServerContext, TaskContext};
use crate::http::request::HttpRequest;
use crate::http::response::HttpResponse;
use crate::runtime::{Step, Task, TaskId};

pub use cities::CitiesBackend;
pub use surprise::SurpriseBackend;
pub use weather::WeatherPipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Cities,
    Weather,
    Surprise,
}

impl BackendKind {
    pub fn task_name(self) -> &'static str {
        match self {
            BackendKind::Cities => "backend:cities",
            BackendKind::Weather => "backend:weather",
            BackendKind::Surprise => "backend:surprise",
        }
    }
}

pub trait Backend {
    /// Advances without blocking; `Ready` carries the response for the client.
    fn poll(&mut self, ctx: &mut ServerContext, now: u64) -> Poll<HttpResponse>;
}

pub struct BackendTask {
    owner: TaskId,
    kind: BackendKind,
    backend: Box<dyn Backend>,
    started: Option<u64>,
}

impl BackendTask {
    pub fn new(owner: TaskId, kind: BackendKind, req: &HttpRequest) -> Self {
        let backend: Box<dyn Backend> = match kind {
            BackendKind::Cities => Box::new(CitiesBackend),
            BackendKind::Weather => Box::new(WeatherPipeline::from_request(req)),
            BackendKind::Surprise => Box::new(SurpriseBackend),
        };
        Self {
            owner,
            kind,
            backend,
            started: None,
        }
    }
}

impl Task<ServerContext, HttpResponse> for BackendTask {
    fn name(&self) -> &'static str {
        self.kind.task_name()
    }

    fn step(&mut self, cx: &mut TaskContext<'_>) -> Step {
        if !cx.is_alive(self.owner) {
            debug!(owner = %self.owner, kind = ?self.kind, "owner gone, dropping backend");
            return Step::Done;
        }
        let now = cx.now();
        let started = *self.started.get_or_insert(now);

        match self.backend.poll(cx.shared, now) {
            Poll::Pending => Step::Pending,
            Poll::Ready(res) => {
                debug!(
                    owner = %self.owner,
                    kind = ?self.kind,
                    status = res.status.code(),
                    elapsed_ms = now.saturating_sub(started),
                    "backend finished"
                );
                cx.deliver(self.owner, res);
                Step::Done
            }
        }
    }
}
