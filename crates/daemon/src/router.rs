//! Request router for the status server.
//!
//! This module provides the `RequestRouter` that authenticates each request
//! against the session's access key and dispatches it to the JSON status
//! handler or the HTML viewer page.

use protocol::{HttpRequest, HttpResponse};
use tracing::{debug, error};

use crate::access::AccessKey;
use crate::stats::StatsSource;

/// Path of the JSON status endpoint.
pub const STATS_PATH: &str = "/stats";

/// Query parameter carrying the access key.
pub const KEY_PARAM: &str = "key";

/// Viewer page template; `{{ACCESS_KEY}}` is replaced per session.
const PAGE_TEMPLATE: &str = include_str!("../assets/index.html");

const KEY_PLACEHOLDER: &str = "{{ACCESS_KEY}}";

/// Routes authenticated requests to the status handlers.
///
/// The key check runs before any handler, so an unauthenticated request
/// never reads from the stats source.
pub struct RequestRouter<S: StatsSource> {
    stats: S,
    key: AccessKey,
    page: String,
}

impl<S: StatsSource> RequestRouter<S> {
    /// Creates a router serving `stats` to holders of `key`.
    pub fn new(stats: S, key: AccessKey) -> Self {
        // Keys are alphanumeric, so substituting into the script is safe.
        let page = PAGE_TEMPLATE.replace(KEY_PLACEHOLDER, key.as_str());
        Self { stats, key, page }
    }

    /// Returns the key this router accepts.
    pub fn access_key(&self) -> &AccessKey {
        &self.key
    }

    /// Parses `raw` and produces the response for it.
    ///
    /// Unparseable requests get `400 Bad Request`.
    pub fn route(&self, raw: &[u8]) -> HttpResponse {
        match HttpRequest::parse(raw) {
            Ok(request) => self.dispatch(&request),
            Err(e) => {
                debug!("Rejecting malformed request: {}", e);
                HttpResponse::bad_request()
            }
        }
    }

    /// Produces the response for a parsed request.
    pub fn dispatch(&self, request: &HttpRequest) -> HttpResponse {
        let authorized = request
            .query_param(KEY_PARAM)
            .is_some_and(|candidate| self.key.matches(candidate));

        if !authorized {
            debug!("Forbidden: {} {}", request.method(), request.path());
            return HttpResponse::forbidden();
        }

        match request.path() {
            STATS_PATH => self.stats_response(),
            _ => self.page_response(),
        }
    }

    fn stats_response(&self) -> HttpResponse {
        match self.stats.snapshot().to_json() {
            Ok(body) => HttpResponse::json(body),
            Err(e) => {
                error!("Failed to serialize progress snapshot: {}", e);
                HttpResponse::json("{}")
            }
        }
    }

    fn page_response(&self) -> HttpResponse {
        HttpResponse::html(self.page.as_bytes())
    }
}
