use std::fmt;
use std::rc::Rc;

use http::Method;
use micro_fetch_core::config::BridgeConfig;
use micro_fetch_core::host::Host;
use micro_fetch_core::protocol::FetchError;
use thiserror::Error;

use crate::Request;

/// The host and configuration every entity is created against.
#[derive(Clone)]
pub struct FetchContext {
    host: Rc<dyn Host>,
    config: BridgeConfig,
}

impl fmt::Debug for FetchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchContext").field("config", &self.config).finish_non_exhaustive()
    }
}

impl FetchContext {
    pub fn builder() -> FetchContextBuilder {
        FetchContextBuilder::new()
    }

    /// A context with the default [`BridgeConfig`].
    pub fn new(host: Rc<dyn Host>) -> Self {
        Self { host, config: BridgeConfig::default() }
    }

    pub fn host(&self) -> &Rc<dyn Host> {
        &self.host
    }

    pub fn config(&self) -> BridgeConfig {
        self.config
    }

    /// Shorthand for [`Request::new`].
    pub fn request(&self, method: Method, url: &str) -> Result<Request, FetchError> {
        Request::new(self, method, url)
    }
}

pub struct FetchContextBuilder {
    host: Option<Rc<dyn Host>>,
    read_chunk_size: Option<usize>,
}

impl fmt::Debug for FetchContextBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchContextBuilder")
            .field("host", &self.host.is_some())
            .field("read_chunk_size", &self.read_chunk_size)
            .finish()
    }
}

impl FetchContextBuilder {
    fn new() -> Self {
        Self { host: None, read_chunk_size: None }
    }

    pub fn host(mut self, host: Rc<dyn Host>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn read_chunk_size(mut self, read_chunk_size: usize) -> Self {
        self.read_chunk_size = Some(read_chunk_size);
        self
    }

    pub fn build(self) -> Result<FetchContext, ContextBuildError> {
        let host = self.host.ok_or(ContextBuildError::MissingHost)?;
        let mut config = BridgeConfig::default();
        if let Some(size) = self.read_chunk_size {
            config = config.with_read_chunk_size(size).map_err(|source| ContextBuildError::InvalidChunkSize { source })?;
        }
        Ok(FetchContext { host, config })
    }
}

#[derive(Error, Debug)]
pub enum ContextBuildError {
    #[error("host must be set")]
    MissingHost,
    #[error("invalid read chunk size: {source}")]
    InvalidChunkSize { source: FetchError },
}
