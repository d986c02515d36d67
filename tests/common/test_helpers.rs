use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tollgate::request::{ForwardRequest, ForwardResponse};
use tower_service::Service;

/// How a scripted backend answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum Reply {
    Ok,
    Status(u16),
    Refused,
    Hang,
}

/// Forwarder answering per backend address, recording every call.
#[derive(Clone, Default)]
pub struct ScriptedForwarder {
    replies: Arc<Mutex<HashMap<String, Reply>>>,
    calls: Arc<Mutex<Vec<ForwardRequest>>>,
}

#[allow(dead_code)]
impl ScriptedForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, backend: &str, reply: Reply) {
        self.replies.lock().unwrap().insert(backend.to_string(), reply);
    }

    pub fn calls(&self) -> Vec<ForwardRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn backends_called(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.backend).collect()
    }
}

impl Service<ForwardRequest> for ScriptedForwarder {
    type Response = ForwardResponse;
    type Error = std::io::Error;
    type Future = BoxFuture<'static, Result<ForwardResponse, std::io::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ForwardRequest) -> Self::Future {
        let reply = self.replies.lock().unwrap().get(&req.backend).copied().unwrap_or(Reply::Ok);
        self.calls.lock().unwrap().push(req);
        Box::pin(async move {
            match reply {
                Reply::Ok => Ok(ForwardResponse::new(200).with_body("ok")),
                Reply::Status(code) => Ok(ForwardResponse::new(code)),
                Reply::Refused => Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )),
                Reply::Hang => {
                    futures::future::pending::<Result<ForwardResponse, std::io::Error>>().await
                }
            }
        })
    }
}
