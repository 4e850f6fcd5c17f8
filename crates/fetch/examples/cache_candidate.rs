use std::rc::Rc;

use bytes::Bytes;
use http::{HeaderMap, Method};
use micro_fetch::{
    AfterSendOutcome, BodyTransform, CacheOverride, FetchContext, FetchError, MessageEntity, ReadBody, Response,
    after_send_fn,
};
use micro_fetch_core::cache::LookupState;
use micro_fetch_core::host::{Backend, Host, MemoryHost};
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

fn on_candidate(candidate: &mut Response) -> Result<Option<AfterSendOutcome>, FetchError> {
    info!(ttl = ?candidate.ttl()?, swr = ?candidate.swr()?, "candidate received");
    candidate.set_swr(30.0)?;
    candidate.set_surrogate_keys(&["articles", "article-42"])?;

    let shout = BodyTransform::from_fn(|bytes: Bytes| Ok(Bytes::from(bytes.to_ascii_uppercase())));
    Ok(Some(AfterSendOutcome::new().with_cache(true).with_body_transform(shout)))
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::DEBUG).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let memory = Rc::new(MemoryHost::new());
    let mut headers = HeaderMap::new();
    headers.insert("cache-control", "max-age=60".parse().expect("valid header value"));
    headers.insert("surrogate-key", "articles".parse().expect("valid header value"));
    memory.register_backend("origin", Backend::respond(200, headers, ["hello ", "from ", "origin"]));

    let ctx = match FetchContext::builder().host(Rc::clone(&memory) as Rc<dyn Host>).read_chunk_size(4096).build() {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(cause = %e, "failed to build fetch context");
            return;
        }
    };

    let entry = memory.open_transaction(LookupState::default(), 0);
    let entry_id = entry.as_u32();
    let mut request = ctx.request(Method::GET, "https://example.com/articles/42").expect("request");
    request.set_backend("origin");
    request.set_cache_transaction(entry).expect("fresh request");
    request.set_cache_override(CacheOverride::new().with_ttl(300).with_after_send(after_send_fn(on_candidate)));

    let mut response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            error!(cause = %e, "send failed");
            return;
        }
    };

    info!(
        status = response.status(),
        cached = ?response.cached(),
        x_cache = ?response.headers().ok().and_then(|h| h.get_str("x-cache")),
        "response ready"
    );
    if let Some(report) = memory.cache_report(entry_id) {
        for commit in &report.commits {
            info!(action = ?commit.action, options = ?commit.options, stored = ?commit.body, "committed");
        }
    }
    match response.text().await {
        Ok(text) => info!(body = %text, "body"),
        Err(e) => error!(cause = %e, "failed to read body"),
    }
}
