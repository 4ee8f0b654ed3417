use crate::harvest::DataType;
use std::future::Future;
use std::path::PathBuf;
use thiserror::Error;

/// Outcome classes for a failed delivery.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Transient failure (network, collector busy). The payload is held and
    /// merged into the next harvest.
    #[error("retryable delivery failure: {0}")]
    Retryable(String),
    /// Payload rejected or agent told to disconnect. The payload is dropped.
    #[error("fatal delivery failure: {0}")]
    Fatal(String),
    /// Delivery did not finish within the configured timeout.
    #[error("delivery timed out")]
    Timeout,
    /// The harvested data could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl DeliveryError {
    /// Returns `true` if the payload should be held for the next cycle.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_) | Self::Timeout)
    }

    /// Returns `true` if the failure counts toward deactivation.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_) | Self::Serialization(_))
    }
}

/// Delivers serialized payloads to a collector.
///
/// Uses native async fn in traits instead of `#[async_trait]`.
///
/// # Note on Object Safety
///
/// The `impl Future` return type is not object-safe. For dynamic dispatch
/// use `Box<dyn TransportBoxed>`, which every `Transport` implements.
pub trait Transport: Send + Sync {
    /// Delivers one payload for `data_type`.
    fn deliver(
        &self,
        data_type: DataType,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;

    /// Returns the transport name for logging.
    fn name(&self) -> &str;
}

/// Object-safe version of [`Transport`] for dynamic dispatch.
pub trait TransportBoxed: Send + Sync {
    fn deliver_boxed(
        &self,
        data_type: DataType,
        payload: Vec<u8>,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<(), DeliveryError>> + Send + '_>>;

    fn name(&self) -> &str;
}

impl<T: Transport> TransportBoxed for T {
    fn deliver_boxed(
        &self,
        data_type: DataType,
        payload: Vec<u8>,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<(), DeliveryError>> + Send + '_>> {
        Box::pin(self.deliver(data_type, payload))
    }

    fn name(&self) -> &str {
        Transport::name(self)
    }
}

/// Prints payloads to stdout.
pub struct StdoutTransport {
    verbose: bool,
}

impl StdoutTransport {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl Transport for StdoutTransport {
    async fn deliver(&self, data_type: DataType, payload: Vec<u8>) -> Result<(), DeliveryError> {
        if self.verbose {
            println!("=== {} ({} bytes) ===", data_type.endpoint(), payload.len());
            println!("{}", String::from_utf8_lossy(&payload));
        } else {
            println!("{}: {} bytes", data_type.endpoint(), payload.len());
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "stdout"
    }
}

/// Writes the latest payload of each endpoint to `<dir>/<endpoint>.json`.
pub struct JsonFileTransport {
    dir: PathBuf,
}

impl JsonFileTransport {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, data_type: DataType) -> PathBuf {
        self.dir.join(format!("{}.json", data_type.endpoint()))
    }
}

impl Transport for JsonFileTransport {
    async fn deliver(&self, data_type: DataType, payload: Vec<u8>) -> Result<(), DeliveryError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| DeliveryError::Retryable(e.to_string()))?;
        tokio::fs::write(self.path_for(data_type), payload)
            .await
            .map_err(|e| DeliveryError::Retryable(e.to_string()))?;
        Ok(())
    }

    fn name(&self) -> &str {
        "json_file"
    }
}

/// Discards every payload (for benchmarking).
pub struct NullTransport;

impl NullTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for NullTransport {
    async fn deliver(&self, _data_type: DataType, _payload: Vec<u8>) -> Result<(), DeliveryError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Records payloads and replays scripted failures.
#[cfg(test)]
pub(crate) struct TestTransport {
    delivered: std::sync::Mutex<Vec<(DataType, serde_json::Value)>>,
    script: std::sync::Mutex<std::collections::VecDeque<Result<(), DeliveryError>>>,
}

#[cfg(test)]
impl TestTransport {
    pub(crate) fn new() -> Self {
        Self {
            delivered: std::sync::Mutex::new(Vec::new()),
            script: std::sync::Mutex::new(std::collections::VecDeque::new()),
        }
    }

    /// Queues outcomes for the next deliveries; afterwards every delivery succeeds.
    pub(crate) fn script(&self, outcomes: impl IntoIterator<Item = Result<(), DeliveryError>>) {
        self.script.lock().unwrap().extend(outcomes);
    }

    pub(crate) fn delivered(&self, data_type: DataType) -> Vec<serde_json::Value> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| *t == data_type)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

#[cfg(test)]
impl Transport for TestTransport {
    async fn deliver(&self, data_type: DataType, payload: Vec<u8>) -> Result<(), DeliveryError> {
        let outcome = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
        if outcome.is_ok() {
            let value = serde_json::from_slice(&payload).unwrap();
            self.delivered.lock().unwrap().push((data_type, value));
        }
        outcome
    }

    fn name(&self) -> &str {
        "test"
    }
}
