use ntex::http::header::{HeaderName, HeaderValue};
use ntex::http::{HeaderMap, StatusCode};
use ntex::{web, Middleware, Service, ServiceCtx};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[cfg(feature = "json")]
use serde::Serialize;

use crate::registry::{ClientRegistry, RateLimitResult};

const HEADER_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
const HEADER_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
const HEADER_RATELIMIT_RESET: &str = "x-ratelimit-reset";
const HEADER_RETRY_AFTER: &str = "retry-after";

/// Identifier used when a request carries no usable client address.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Rate limiting middleware
///
/// Asks the shared [`ClientRegistry`] for a decision on every request.
/// Admitted requests reach the inner service and get `x-ratelimit-*`
/// headers; rejected ones are answered with `429 Too Many Requests`.
pub struct RateLimit {
    pub registry: Arc<ClientRegistry>,
}

impl RateLimit {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }
}

impl<S> Middleware<S> for RateLimit {
    type Service = RateLimitMiddlewareService<S>;

    fn create(&self, service: S) -> Self::Service {
        RateLimitMiddlewareService {
            service,
            registry: Arc::clone(&self.registry),
        }
    }
}

pub struct RateLimitMiddlewareService<S> {
    service: S,
    registry: Arc<ClientRegistry>,
}

impl<S, Err> Service<web::WebRequest<Err>> for RateLimitMiddlewareService<S>
where
    S: Service<web::WebRequest<Err>, Response = web::WebResponse, Error = web::Error> + 'static,
    Err: web::ErrorRenderer,
{
    type Response = web::WebResponse;
    type Error = web::Error;

    async fn call(
        &self,
        req: web::WebRequest<Err>,
        ctx: ServiceCtx<'_, Self>,
    ) -> Result<Self::Response, Self::Error> {
        let client_id = extract_client_id(&req);
        let result = self.registry.check(&client_id);

        if !result.allowed {
            return Ok(req.into_response(rejection_response(&result)));
        }

        let mut response = ctx.call(&self.service, req).await?;
        add_rate_limit_headers(response.headers_mut(), &result);

        Ok(response)
    }
}

/// Extract client identifier from request, considering proxy headers
pub fn extract_client_id<Err>(req: &web::WebRequest<Err>) -> String {
    if let Some(ip) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(parse_ip)
    {
        return ip.to_string();
    }

    if let Some(ip) = req
        .headers()
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .and_then(parse_ip)
    {
        return ip.to_string();
    }

    // Connection info reports "ip:port"
    if let Some(remote) = req.connection_info().remote() {
        if let Ok(addr) = remote.parse::<std::net::SocketAddr>() {
            return addr.ip().to_string();
        }
        if let Some(ip) = parse_ip(remote) {
            return ip.to_string();
        }
    }

    UNKNOWN_CLIENT.to_string()
}

fn parse_ip(value: &str) -> Option<IpAddr> {
    value.trim().parse().ok()
}

/// Unix timestamp (seconds) at which the client's next token accrues.
fn reset_timestamp(retry_after: Duration) -> u64 {
    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    now_secs.saturating_add(ceil_secs(retry_after))
}

fn ceil_secs(duration: Duration) -> u64 {
    duration
        .as_secs()
        .saturating_add(u64::from(duration.subsec_nanos() > 0))
}

fn add_rate_limit_headers(headers: &mut HeaderMap, result: &RateLimitResult) {
    let values = [
        (HEADER_RATELIMIT_REMAINING, result.remaining),
        (HEADER_RATELIMIT_LIMIT, result.limit),
        (HEADER_RATELIMIT_RESET, reset_timestamp(result.retry_after)),
    ];
    for (name, value) in values {
        if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}

#[derive(Debug)]
#[cfg_attr(feature = "json", derive(Serialize))]
struct RejectionData {
    remaining: u64,
    reset: u64,
    limit: u64,
}

#[derive(Debug)]
#[cfg_attr(feature = "json", derive(Serialize))]
struct RejectionBody {
    code: u16,
    message: &'static str,
    data: RejectionData,
}

fn rejection_response(result: &RateLimitResult) -> web::HttpResponse {
    let body = RejectionBody {
        code: StatusCode::TOO_MANY_REQUESTS.as_u16(),
        message: "Rate limit exceeded",
        data: RejectionData {
            remaining: result.remaining,
            reset: reset_timestamp(result.retry_after),
            limit: result.limit,
        },
    };

    #[cfg(feature = "json")]
    let payload = serde_json::to_string(&body)
        .unwrap_or_else(|_| r#"{"code":429,"message":"Rate limit exceeded"}"#.to_string());

    #[cfg(not(feature = "json"))]
    let payload = format!(
        r#"{{"code":{},"message":"{}","data":{{"remaining":{},"reset":{},"limit":{}}}}}"#,
        body.code, body.message, body.data.remaining, body.data.reset, body.data.limit
    );

    web::HttpResponse::build(StatusCode::TOO_MANY_REQUESTS)
        .set_header("content-type", "application/json")
        .set_header(HEADER_RATELIMIT_REMAINING, body.data.remaining.to_string())
        .set_header(HEADER_RATELIMIT_LIMIT, body.data.limit.to_string())
        .set_header(HEADER_RATELIMIT_RESET, body.data.reset.to_string())
        .set_header(HEADER_RETRY_AFTER, ceil_secs(result.retry_after).to_string())
        .body(payload)
}
