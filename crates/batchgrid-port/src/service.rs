//! Request/response RPC over a pair of ports.
//!
//! A long-running service loop pops requests from the request port,
//! invokes its handler, and writes the response into the response
//! port's slot map keyed by correlation id. Callers enqueue a request
//! and poll the response slot for their id. At most one request per
//! correlation id may be in flight at a time.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tracing::{debug, warn};

use crate::bus::PortBus;
use crate::error::{PortError, PortResult};

/// Poll interval while a caller waits for its response.
const RESPONSE_POLL: Duration = Duration::from_millis(5);

/// Handles one request payload; returns the response payload or a
/// caller-visible error string.
pub trait Handler: Send + Sync {
    fn handle(&self, payload: Value) -> Result<Value, String>;
}

impl<F> Handler for F
where
    F: Fn(Value) -> Result<Value, String> + Send + Sync,
{
    fn handle(&self, payload: Value) -> Result<Value, String> {
        self(payload)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RpcRequest {
    correlation: u64,
    payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RpcResponse {
    ok: bool,
    payload: Value,
}

/// The serving half: owns the handler and drains the request port.
pub struct PortService {
    bus: PortBus,
    request_port: u16,
    response_port: u16,
    handler: Arc<dyn Handler>,
}

impl PortService {
    pub fn new(
        bus: PortBus,
        request_port: u16,
        response_port: u16,
        handler: Arc<dyn Handler>,
    ) -> Self {
        Self { bus, request_port, response_port, handler }
    }

    /// Serve until the stop signal flips to `true`.
    ///
    /// Requests are handled strictly sequentially; the loop suspends
    /// cooperatively between polls.
    pub async fn serve(&self, mut stop: watch::Receiver<bool>) -> PortResult<()> {
        self.bus.open(self.request_port).await;
        self.bus.open(self.response_port).await;
        debug!(
            request_port = self.request_port,
            response_port = self.response_port,
            "port service serving"
        );

        loop {
            if *stop.borrow_and_update() {
                debug!(request_port = self.request_port, "port service stopped");
                return Ok(());
            }

            let request = self
                .bus
                .pop_timeout::<RpcRequest>(self.request_port, RESPONSE_POLL * 4)
                .await;
            let request = match request {
                Ok(r) => r,
                Err(PortError::Timeout) => continue,
                Err(e) => return Err(e),
            };

            let response = match self.handler.handle(request.payload) {
                Ok(payload) => RpcResponse { ok: true, payload },
                Err(message) => {
                    warn!(correlation = request.correlation, %message, "handler error");
                    RpcResponse { ok: false, payload: Value::String(message) }
                }
            };

            let correlation = request.correlation.to_string();
            let value = serde_json::to_value(&response)?;
            self.bus
                .update_slot(self.response_port, move |prev| {
                    let mut map = match prev {
                        Some(Value::Object(map)) => map,
                        _ => serde_json::Map::new(),
                    };
                    map.insert(correlation, value);
                    Value::Object(map)
                })
                .await?;
        }
    }
}

/// The calling half: enqueues requests and awaits keyed responses.
#[derive(Clone)]
pub struct ServiceClient {
    bus: PortBus,
    request_port: u16,
    response_port: u16,
    in_flight: Arc<Mutex<HashSet<u64>>>,
}

impl ServiceClient {
    pub fn new(bus: PortBus, request_port: u16, response_port: u16) -> Self {
        Self {
            bus,
            request_port,
            response_port,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Send a request and await its response.
    ///
    /// Fails with `InFlight` if the correlation id is already waiting —
    /// a caller-supplied id identifies at most one outstanding request.
    pub async fn call(
        &self,
        correlation: u64,
        payload: Value,
        timeout: Duration,
    ) -> PortResult<Result<Value, String>> {
        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(correlation) {
                return Err(PortError::InFlight(correlation));
            }
        }

        let result = self.call_inner(correlation, payload, timeout).await;
        self.in_flight.lock().await.remove(&correlation);
        result
    }

    async fn call_inner(
        &self,
        correlation: u64,
        payload: Value,
        timeout: Duration,
    ) -> PortResult<Result<Value, String>> {
        self.bus
            .push(self.request_port, &RpcRequest { correlation, payload })
            .await?;

        let key = correlation.to_string();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let slot: Option<Value> = self.bus.peek(self.response_port).await?;
            if let Some(Value::Object(map)) = slot {
                if let Some(raw) = map.get(&key) {
                    let response: RpcResponse = serde_json::from_value(raw.clone())?;
                    // Retire the slot entry now that it is consumed.
                    let retire = key.clone();
                    self.bus
                        .update_slot(self.response_port, move |prev| match prev {
                            Some(Value::Object(mut map)) => {
                                map.remove(&retire);
                                Value::Object(map)
                            }
                            other => other.unwrap_or(Value::Null),
                        })
                        .await?;
                    return Ok(if response.ok {
                        Ok(response.payload)
                    } else {
                        Err(response.payload.as_str().unwrap_or("").to_string())
                    });
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PortError::Timeout);
            }
            tokio::time::sleep(RESPONSE_POLL).await;
        }
    }
}
