use std::io::Read;

use bytes::Bytes;
use log::debug;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use ureq::{Agent, AgentBuilder};

use super::{Pool, Response, Transport, read_chunk_from};
use crate::error::{Error, Result};
use crate::http::{Payload, Request, Timeout, classify};
use crate::settings::Settings;

/// Blocking session over a `ureq::Agent`.
///
/// ureq applies the read timeout to each socket read, so a slow upload never
/// trips it. Requests with their own timeouts use an agent built for them.
pub struct UreqSession {
    pool: Pool<Agent>,
    timeout: Option<Timeout>,
    user_agent: String,
}

impl UreqSession {
    pub fn new(settings: &Settings) -> Self {
        Self {
            pool: Pool::new(build_agent(&settings.timeout, &settings.user_agent)),
            timeout: Some(settings.timeout),
            user_agent: settings.user_agent.clone(),
        }
    }

    /// Wraps an existing agent and shares its pool.
    pub fn from_agent(agent: Agent) -> Self {
        Self {
            pool: Pool::new(agent),
            timeout: None,
            user_agent: Settings::default().user_agent,
        }
    }

    fn agent(&self, request: &Request) -> Result<Agent> {
        match request.timeout {
            Some(timeout) if Some(timeout) != self.timeout => self
                .pool
                .get_or_build(timeout, |timeout| Ok(build_agent(timeout, &self.user_agent))),
            _ => self.pool.get(),
        }
    }

    fn build(agent: &Agent, request: &Request) -> Result<ureq::Request> {
        let mut builder = agent.request(request.method.as_str(), &request.url);

        for (key, value) in &request.query {
            builder = builder.query(key, value);
        }

        for (name, value) in &request.headers {
            let value = value.to_str().map_err(|e| {
                Error::InvalidRequest(format!("header {} is not valid text: {}", name, e))
            })?;
            builder = builder.set(name.as_str(), value);
        }

        Ok(builder)
    }
}

fn build_agent(timeout: &Timeout, user_agent: &str) -> Agent {
    AgentBuilder::new()
        .timeout_connect(timeout.connect)
        .timeout_read(timeout.read)
        .user_agent(user_agent)
        .build()
}

impl Transport for UreqSession {
    #[tracing::instrument(skip_all, fields(method = %request.method, url = %request.url))]
    fn send(&self, request: &Request) -> Result<Box<dyn Response>> {
        let agent = self.agent(request)?;
        let mut builder = Self::build(&agent, request)?;

        let result = match &request.payload {
            Payload::Empty => builder.call(),
            Payload::Bytes(bytes) => builder.send_bytes(bytes),
            Payload::Stream(stream) => {
                if let Some(len) = stream.len() {
                    builder = builder.set("Content-Length", &len.to_string());
                }
                builder.send(stream.open()?)
            }
        };

        // Error statuses are ordinary responses here; the executor classifies them.
        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(ureq::Error::Transport(transport)) => return Err(classify::from_ureq(transport)),
        };
        debug!("{} {} -> {}", request.method, request.url, response.status());

        Ok(Box::new(UreqResponse::new(response)))
    }

    fn close(&self) {
        if self.pool.close() {
            debug!("Closed ureq session");
        }
    }
}

struct UreqResponse {
    status: u16,
    headers: HeaderMap,
    reader: Box<dyn Read + Send + Sync>,
}

impl UreqResponse {
    fn new(response: ureq::Response) -> Self {
        let mut headers = HeaderMap::new();
        for name in response.headers_names() {
            let Ok(header) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            for value in response.all(&name) {
                if let Ok(value) = HeaderValue::from_str(value) {
                    headers.append(header.clone(), value);
                }
            }
        }

        Self {
            status: response.status(),
            headers,
            reader: response.into_reader(),
        }
    }
}

impl Response for UreqResponse {
    fn status(&self) -> u16 {
        self.status
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        read_chunk_from(&mut self.reader)
    }
}
