//! Per-request cache directives and the after-send hook.

use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use futures::future::LocalBoxFuture;
use micro_fetch_core::host::HostCacheOverride;
use micro_fetch_core::protocol::FetchError;

use crate::Response;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheOverrideMode {
    /// Leave caching to the host's defaults.
    #[default]
    None,
    /// Bypass the cache entirely.
    Pass,
    /// Apply the directive's ttl, swr, surrogate key and pci fields.
    Override,
}

impl FromStr for CacheOverrideMode {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(CacheOverrideMode::None),
            "pass" => Ok(CacheOverrideMode::Pass),
            "override" => Ok(CacheOverrideMode::Override),
            other => Err(FetchError::type_error(format!(
                "invalid cache override mode '{other}', expected \"none\", \"pass\" or \"override\""
            ))),
        }
    }
}

/// Cache control attached to a request before it is sent.
///
/// Outside of a cache transaction the directive is handed to the host as is. Inside one, its
/// ttl, swr, surrogate keys and pci flag become override options on the candidate response and
/// the [`AfterSend`] hook runs before the transaction is committed.
///
/// ```
/// use micro_fetch::CacheOverride;
///
/// let directive = CacheOverride::new().with_ttl(60).with_surrogate_key("article-1 articles");
/// assert_eq!(directive.ttl(), Some(60));
/// ```
#[derive(Clone, Default)]
pub struct CacheOverride {
    mode: CacheOverrideMode,
    ttl: Option<u32>,
    swr: Option<u32>,
    surrogate_key: Option<String>,
    pci: Option<bool>,
    after_send: Option<Rc<dyn AfterSend>>,
}

impl fmt::Debug for CacheOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOverride")
            .field("mode", &self.mode)
            .field("ttl", &self.ttl)
            .field("swr", &self.swr)
            .field("surrogate_key", &self.surrogate_key)
            .field("pci", &self.pci)
            .field("after_send", &self.after_send.is_some())
            .finish()
    }
}

impl CacheOverride {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pass() -> Self {
        Self { mode: CacheOverrideMode::Pass, ..Self::default() }
    }

    pub fn with_mode(mut self, mode: CacheOverrideMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_ttl(mut self, seconds: u32) -> Self {
        self.ttl = Some(seconds);
        self.promote();
        self
    }

    pub fn with_swr(mut self, seconds: u32) -> Self {
        self.swr = Some(seconds);
        self.promote();
        self
    }

    /// Space separated surrogate keys.
    pub fn with_surrogate_key<S: Into<String>>(mut self, keys: S) -> Self {
        self.surrogate_key = Some(keys.into());
        self.promote();
        self
    }

    pub fn with_pci(mut self, pci: bool) -> Self {
        self.pci = Some(pci);
        self.promote();
        self
    }

    pub fn with_after_send<H: AfterSend + 'static>(mut self, hook: H) -> Self {
        self.after_send = Some(Rc::new(hook));
        self
    }

    fn promote(&mut self) {
        if self.mode == CacheOverrideMode::None {
            self.mode = CacheOverrideMode::Override;
        }
    }

    pub fn mode(&self) -> CacheOverrideMode {
        self.mode
    }

    pub fn ttl(&self) -> Option<u32> {
        self.ttl
    }

    pub fn swr(&self) -> Option<u32> {
        self.swr
    }

    pub fn surrogate_key(&self) -> Option<&str> {
        self.surrogate_key.as_deref()
    }

    pub fn pci(&self) -> Option<bool> {
        self.pci
    }

    pub fn after_send(&self) -> Option<Rc<dyn AfterSend>> {
        self.after_send.as_ref().map(Rc::clone)
    }

    /// The directive as the host applies it to a request without a cache transaction.
    pub fn host_directive(&self) -> HostCacheOverride {
        match self.mode {
            CacheOverrideMode::None => HostCacheOverride::default(),
            CacheOverrideMode::Pass => HostCacheOverride { pass: true, ..HostCacheOverride::default() },
            CacheOverrideMode::Override => HostCacheOverride {
                pass: false,
                ttl: self.ttl,
                swr: self.swr,
                surrogate_key: self.surrogate_key.clone(),
                pci: self.pci.unwrap_or(false),
            },
        }
    }
}

/// Runs on the candidate response of a cache transaction, before it is committed.
///
/// The hook may read and set the candidate's cache options and headers. Its outcome can change
/// the storage action and install a transform for the stored body.
#[async_trait(?Send)]
pub trait AfterSend {
    async fn after_send(&self, candidate: &mut Response) -> Result<Option<AfterSendOutcome>, FetchError>;
}

/// An [`AfterSend`] hook backed by a plain function.
pub struct AfterSendFn<F> {
    f: F,
}

impl<F> fmt::Debug for AfterSendFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AfterSendFn").finish_non_exhaustive()
    }
}

pub fn after_send_fn<F>(f: F) -> AfterSendFn<F>
where
    F: Fn(&mut Response) -> Result<Option<AfterSendOutcome>, FetchError>,
{
    AfterSendFn { f }
}

#[async_trait(?Send)]
impl<F> AfterSend for AfterSendFn<F>
where
    F: Fn(&mut Response) -> Result<Option<AfterSendOutcome>, FetchError>,
{
    async fn after_send(&self, candidate: &mut Response) -> Result<Option<AfterSendOutcome>, FetchError> {
        (self.f)(candidate)
    }
}

/// What an after-send hook asks for.
#[derive(Debug, Default)]
pub struct AfterSendOutcome {
    pub cache: Option<HookCache>,
    pub body_transform: Option<BodyTransform>,
}

impl AfterSendOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache<C: Into<HookCache>>(mut self, cache: C) -> Self {
        self.cache = Some(cache.into());
        self
    }

    pub fn with_body_transform(mut self, transform: BodyTransform) -> Self {
        self.body_transform = Some(transform);
        self
    }
}

/// The `cache` field of a hook outcome: a flag or the label `"uncacheable"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookCache {
    Flag(bool),
    Label(String),
}

impl From<bool> for HookCache {
    fn from(flag: bool) -> Self {
        HookCache::Flag(flag)
    }
}

impl From<&str> for HookCache {
    fn from(label: &str) -> Self {
        HookCache::Label(label.to_string())
    }
}

impl From<String> for HookCache {
    fn from(label: String) -> Self {
        HookCache::Label(label)
    }
}

type TransformFn = Box<dyn FnOnce(Bytes) -> LocalBoxFuture<'static, Result<Bytes, FetchError>>>;

/// Rewrites the body that gets stored. Runs once, at commit.
pub struct BodyTransform {
    f: TransformFn,
}

impl fmt::Debug for BodyTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyTransform").finish_non_exhaustive()
    }
}

impl BodyTransform {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce(Bytes) -> Fut + 'static,
        Fut: Future<Output = Result<Bytes, FetchError>> + 'static,
    {
        Self { f: Box::new(move |bytes| f(bytes).boxed_local()) }
    }

    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce(Bytes) -> Result<Bytes, FetchError> + 'static,
    {
        Self::new(move |bytes| futures::future::ready(f(bytes)))
    }

    pub(crate) async fn apply(self, bytes: Bytes) -> Result<Bytes, FetchError> {
        (self.f)(bytes).await
    }
}
