//! The host's fetch primitive.

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use std::collections::BTreeMap;

use crate::http::{Request, Response};

/// Performs real network requests on behalf of the engine.
///
/// The returned future must be `'static` so the engine can detach it and let
/// it finish after the caller has already been answered.
pub trait Network: Send + Sync {
  fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response>>;
}

/// [`Network`] backed by `reqwest`.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("lifeline/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;
    Ok(Self { client })
  }
}

impl Network for HttpNetwork {
  fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response>> {
    let client = self.client.clone();

    async move {
      let url = request.url.clone();
      let mut builder = client.request(request.method, request.url);
      for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
      }
      if let Some(body) = request.body {
        builder = builder.body(body);
      }

      let response = builder
        .send()
        .await
        .map_err(|e| eyre!("Request to {} failed: {}", url, e))?;

      let status = response.status().as_u16();
      let headers: BTreeMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read body from {}: {}", url, e))?;

      Ok(Response {
        status,
        headers,
        body: body.to_vec(),
      })
    }
    .boxed()
  }
}

#[cfg(test)]
pub(crate) mod scripted {
  //! Programmable network for tests.

  use super::*;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::{Arc, Mutex};
  use std::time::Duration;

  #[derive(Clone)]
  enum Behavior {
    Respond(Response),
    Delay(Duration, Response),
    Hang,
    Fail,
  }

  /// Responds per path; unknown paths get 404, and everything fails while offline.
  #[derive(Clone, Default)]
  pub struct ScriptedNetwork {
    routes: Arc<Mutex<HashMap<String, Behavior>>>,
    offline: Arc<AtomicBool>,
    requests: Arc<Mutex<Vec<Request>>>,
  }

  impl ScriptedNetwork {
    pub fn new() -> Self {
      Self::default()
    }

    fn route(&self, path: &str, behavior: Behavior) {
      self
        .routes
        .lock()
        .unwrap()
        .insert(path.to_string(), behavior);
    }

    pub fn respond(&self, path: &str, response: Response) {
      self.route(path, Behavior::Respond(response));
    }

    pub fn respond_after(&self, path: &str, delay: Duration, response: Response) {
      self.route(path, Behavior::Delay(delay, response));
    }

    pub fn hang(&self, path: &str) {
      self.route(path, Behavior::Hang);
    }

    pub fn fail(&self, path: &str) {
      self.route(path, Behavior::Fail);
    }

    pub fn set_offline(&self, offline: bool) {
      self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<Request> {
      self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, path: &str) -> usize {
      self
        .requests
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.path() == path)
        .count()
    }
  }

  impl Network for ScriptedNetwork {
    fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response>> {
      self.requests.lock().unwrap().push(request.clone());
      let offline = self.offline.load(Ordering::SeqCst);
      let behavior = self.routes.lock().unwrap().get(request.path()).cloned();

      async move {
        if offline {
          return Err(eyre!("Network unreachable"));
        }
        match behavior {
          Some(Behavior::Respond(response)) => Ok(response),
          Some(Behavior::Delay(delay, response)) => {
            tokio::time::sleep(delay).await;
            Ok(response)
          }
          Some(Behavior::Hang) => std::future::pending().await,
          Some(Behavior::Fail) => Err(eyre!("Connection refused")),
          None => Ok(Response::new(404)),
        }
      }
      .boxed()
    }
  }
}
