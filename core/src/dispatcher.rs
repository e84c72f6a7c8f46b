//! Request lifecycle and token-refresh coordination.
//!
//! # Design
//! `Dispatcher` never performs I/O. Every call becomes a `PendingRequest`;
//! executing it pushes an `Action::Send` that the host drains with
//! `poll_action`, performs, and answers with `handle_outcome`. All state
//! transitions happen synchronously inside those `&mut self` methods, so the
//! "is a refresh running?" check and the flag flip that starts one can never
//! be interleaved with another failure.
//!
//! Failure handling, in order:
//! 1. an aborted request is already resolved and its outcome is dropped;
//! 2. `invalid_grant` on a non-auth url with a refresh token and no refresh
//!    running starts a refresh and parks the request in the refresh queue;
//!    a request that was already replayed once fails for good instead;
//! 3. any non-auth failure while a refresh is running is parked too;
//! 4. a 401 pointing at an external login page is handed to the host;
//! 5. everything else reaches the caller's `error` (or the default handler).
//!
//! A successful refresh replays the queue in FIFO order. A failed refresh
//! clears the credentials and fails every parked request with its own error.
//!
//! Callbacks run while the dispatcher is mutably borrowed; they must not call
//! back into it. Record what you need and act after the method returns.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bulk::{self, BulkQueue};
use crate::callbacks::{ApiResponse, Callbacks, Completion};
use crate::config::DispatcherConfig;
use crate::coordination::{CoordinationChannel, CoordinationEvent, RefreshSignal};
use crate::error::{ConfigError, HttpError};
use crate::http::{HttpMethod, HttpRequest, HttpResponse, Method, TransportOutcome};
use crate::request::{CallOptions, ContextHeaders, Continuation, Payload, PendingRequest, RequestId};
use crate::store::{StoreInit, TokenStore};
use crate::url::{is_auth_url, is_login_url, UrlBuilder};

/// Work the host must perform on the dispatcher's behalf.
#[derive(Debug, Clone)]
pub enum Action {
    /// Execute this request and report back with `handle_outcome(id, ..)`.
    Send { id: RequestId, request: HttpRequest },
    /// Cancel the transport attempt for `id`, if one is in flight.
    Abort { id: RequestId },
    /// Open the external login page; answer with `complete_external_login`.
    ExternalLogin { url: String },
}

/// The token triple returned by the login endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    pub download_token: String,
}

impl Credentials {
    /// Pull the triple out of a token endpoint response. All three tokens
    /// must be present and non-empty.
    pub fn from_value(value: &Value) -> Option<Self> {
        let field = |name: &str| {
            value
                .get(name)
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
        };
        Some(Self {
            access_token: field("access_token")?,
            refresh_token: field("refresh_token")?,
            download_token: field("download_token")?,
        })
    }
}

pub type DefaultErrorHandler = Box<dyn FnMut(&HttpError)>;
pub type RefreshHook = Box<dyn FnMut(&Credentials)>;

/// Which headers an execution carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    /// Login: no token.
    Anonymous,
    /// Other auth endpoints: token only.
    TokenOnly,
    /// Everything else: token plus metadata/userpref hashes.
    Full,
}

impl AuthMode {
    fn for_url(url: &str) -> Self {
        if is_login_url(url) {
            AuthMode::Anonymous
        } else if is_auth_url(url) {
            AuthMode::TokenOnly
        } else {
            AuthMode::Full
        }
    }
}

pub struct DispatcherBuilder {
    config: DispatcherConfig,
    store: Option<Box<dyn TokenStore>>,
    channel: Option<Box<dyn CoordinationChannel>>,
    default_error: Option<DefaultErrorHandler>,
    refresh_hook: Option<RefreshHook>,
}

impl DispatcherBuilder {
    pub fn token_store(mut self, store: impl TokenStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    pub fn coordination(mut self, channel: impl CoordinationChannel + 'static) -> Self {
        self.channel = Some(Box::new(channel));
        self
    }

    /// Receives terminal errors of calls that have no `error` callback.
    pub fn default_error_handler(mut self, f: impl FnMut(&HttpError) + 'static) -> Self {
        self.default_error = Some(Box::new(f));
        self
    }

    /// Runs after a successful refresh, before the queue is replayed.
    pub fn refresh_hook(mut self, f: impl FnMut(&Credentials) + 'static) -> Self {
        self.refresh_hook = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Result<Dispatcher, ConfigError> {
        self.config.validate()?;

        let urls = UrlBuilder::new(&self.config.server_url);
        let mut dispatcher = Dispatcher {
            config: self.config,
            urls,
            store: self.store,
            store_ready: true,
            channel: self.channel,
            access_token: None,
            refresh_token: None,
            download_token: None,
            next_id: 0,
            live: HashMap::new(),
            refresh_queue: VecDeque::new(),
            refreshing_token: false,
            refresh_succeeded: false,
            external_login_queue: VecDeque::new(),
            external_login_open: false,
            bulk: BulkQueue::default(),
            actions: VecDeque::new(),
            state: BTreeMap::new(),
            metadata_hash: None,
            userpref_hash: None,
            default_error: self.default_error,
            refresh_hook: self.refresh_hook,
        };

        let keys: Vec<String> = dispatcher.config.keys.all().iter().map(|k| k.to_string()).collect();
        if let Some(store) = dispatcher.store.as_mut() {
            store.register_owned_keys(&keys);
            if store.init() == StoreInit::Deferred {
                dispatcher.store_ready = false;
            }
        }
        if dispatcher.store_ready {
            dispatcher.load_tokens_from_store();
        }
        Ok(dispatcher)
    }
}

/// Single entry point for authenticated calls against one backend.
pub struct Dispatcher {
    config: DispatcherConfig,
    urls: UrlBuilder,
    store: Option<Box<dyn TokenStore>>,
    store_ready: bool,
    channel: Option<Box<dyn CoordinationChannel>>,
    access_token: Option<String>,
    refresh_token: Option<String>,
    download_token: Option<String>,
    next_id: u64,
    live: HashMap<RequestId, PendingRequest>,
    /// Requests parked until the running refresh resolves, with the error
    /// that parked them.
    refresh_queue: VecDeque<(RequestId, HttpError)>,
    refreshing_token: bool,
    refresh_succeeded: bool,
    external_login_queue: VecDeque<(RequestId, HttpError)>,
    external_login_open: bool,
    bulk: BulkQueue,
    actions: VecDeque<Action>,
    state: BTreeMap<String, Value>,
    metadata_hash: Option<String>,
    userpref_hash: Option<String>,
    default_error: Option<DefaultErrorHandler>,
    refresh_hook: Option<RefreshHook>,
}

impl Dispatcher {
    pub fn builder(config: DispatcherConfig) -> DispatcherBuilder {
        DispatcherBuilder {
            config,
            store: None,
            channel: None,
            default_error: None,
            refresh_hook: None,
        }
    }

    pub fn new(config: DispatcherConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn urls(&self) -> &UrlBuilder {
        &self.urls
    }

    // ------------------------------------------------------------------
    // Issuing calls
    // ------------------------------------------------------------------

    /// Issue a call. Returns before the transport resolves.
    pub fn call(
        &mut self,
        method: Method,
        url: impl Into<String>,
        payload: Option<Payload>,
        callbacks: Callbacks,
        options: CallOptions,
    ) -> RequestId {
        let url = url.into();
        let id = self.next_request_id();
        let mut options = options;

        let mut flush_batch = None;
        if self.config.bulk
            && options.bulk.is_none()
            && method.http_method() == HttpMethod::Get
            && url.len() > self.config.max_get_url_len
        {
            let batch_id = Uuid::new_v4().to_string();
            debug!(%id, url_len = url.len(), %batch_id, "oversized GET routed through bulk");
            options.bulk = Some(batch_id.clone());
            flush_batch = Some(batch_id);
        }

        let batch_id = options.bulk.clone();
        let request = PendingRequest::new(
            id,
            method,
            url.clone(),
            payload,
            options,
            self.config.debug,
            Continuation::Caller(callbacks),
        );
        self.live.insert(id, request);

        if is_login_url(&url) {
            debug!(%id, "login call");
            self.execute(id, AuthMode::Anonymous);
        } else if is_auth_url(&url) {
            debug!(%id, "auth call");
            self.execute(id, AuthMode::TokenOnly);
        } else if let Some(batch_id) = batch_id.filter(|_| self.config.bulk) {
            self.bulk.enqueue(&batch_id, id);
            debug!(%id, %batch_id, queued = self.bulk.len(&batch_id), "queued for bulk");
            if flush_batch.is_some() {
                self.trigger_bulk_call(&batch_id);
            }
        } else {
            self.execute(id, AuthMode::Full);
        }
        id
    }

    /// Flush the batch `batch_id` as one bulk exchange.
    ///
    /// Returns the id of the batch request, or `None` when bulk mode is off
    /// or nothing is queued under that id.
    pub fn trigger_bulk_call(&mut self, batch_id: &str) -> Option<RequestId> {
        if !self.config.bulk {
            return None;
        }
        let items = self.bulk.take(batch_id);
        if items.is_empty() {
            return None;
        }
        let id = self.next_request_id();
        debug!(%id, %batch_id, items = items.len(), "flushing bulk batch");
        let request = PendingRequest::new(
            id,
            Method::Create,
            self.urls.bulk_url(),
            None,
            CallOptions::default(),
            self.config.debug,
            Continuation::Bulk(items),
        );
        self.live.insert(id, request);
        self.execute(id, AuthMode::Full);
        Some(id)
    }

    /// Abort a live request. Its `complete` fires once with `aborted` set;
    /// `success` and `error` never fire. Aborting twice is a no-op.
    pub fn abort_request(&mut self, id: RequestId) {
        let Some(request) = self.live.get_mut(&id) else {
            return;
        };
        if request.aborted || matches!(request.continuation, Continuation::Refresh) {
            return;
        }
        request.aborted = true;
        debug!(%id, "aborting request");

        self.refresh_queue.retain(|(queued, _)| *queued != id);
        self.external_login_queue.retain(|(queued, _)| *queued != id);
        self.bulk.remove(id);
        self.actions.push_back(Action::Abort { id });
        self.fire_complete(id, 0, false);
    }

    /// Next piece of work for the host, in the order it was produced.
    pub fn poll_action(&mut self) -> Option<Action> {
        self.actions.pop_front()
    }

    /// Report the result of an `Action::Send`.
    ///
    /// Outcomes for unknown, finished or aborted requests are ignored.
    pub fn handle_outcome(&mut self, id: RequestId, outcome: TransportOutcome) {
        let Some(request) = self.live.get(&id) else {
            debug!(%id, "outcome for a request that is no longer live");
            return;
        };
        if request.aborted {
            return;
        }

        match outcome {
            TransportOutcome::Response(response) if response.is_success() => {
                self.resolve_success(id, response)
            }
            failure => self.intercept_error(id, &failure),
        }
    }

    // ------------------------------------------------------------------
    // Credentials
    // ------------------------------------------------------------------

    pub fn get_oauth_token(&self) -> Option<String> {
        self.read_token(&self.config.keys.access_token, &self.access_token)
    }

    pub fn get_refresh_token(&self) -> Option<String> {
        self.read_token(&self.config.keys.refresh_token, &self.refresh_token)
    }

    pub fn get_download_token(&self) -> Option<String> {
        self.read_token(&self.config.keys.download_token, &self.download_token)
    }

    pub fn is_authenticated(&self) -> bool {
        self.get_oauth_token().is_some_and(|t| !t.is_empty())
    }

    /// Replace all three tokens in memory and in the store.
    pub fn set_tokens(&mut self, credentials: &Credentials) {
        self.access_token = Some(credentials.access_token.clone());
        self.refresh_token = Some(credentials.refresh_token.clone());
        self.download_token = Some(credentials.download_token.clone());
        if let Some(store) = self.store.as_mut() {
            let keys = &self.config.keys;
            store.set(&keys.access_token, &credentials.access_token);
            store.set(&keys.refresh_token, &credentials.refresh_token);
            store.set(&keys.download_token, &credentials.download_token);
        }
    }

    /// Clear all three tokens in memory and in the store.
    pub fn reset_auth(&mut self) {
        self.access_token = None;
        self.refresh_token = None;
        self.download_token = None;
        if let Some(store) = self.store.as_mut() {
            let keys = &self.config.keys;
            store.cut(&keys.access_token);
            store.cut(&keys.refresh_token);
            store.cut(&keys.download_token);
        }
    }

    /// Finish a deferred store initialisation by loading its tokens.
    pub fn store_ready(&mut self) {
        if self.store_ready {
            return;
        }
        self.store_ready = true;
        self.load_tokens_from_store();
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing_token
    }

    // ------------------------------------------------------------------
    // Contextual state
    // ------------------------------------------------------------------

    pub fn set_metadata_hash(&mut self, hash: Option<String>) {
        self.metadata_hash = hash;
    }

    pub fn set_userpref_hash(&mut self, hash: Option<String>) {
        self.userpref_hash = hash;
    }

    pub fn set_state_property(&mut self, key: impl Into<String>, value: Value) {
        self.state.insert(key.into(), value);
    }

    pub fn get_state_property(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    pub fn clear_state_property(&mut self, key: &str) {
        self.state.remove(key);
    }

    pub fn reset_state(&mut self) {
        self.state.clear();
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn pending(&self, id: RequestId) -> Option<&PendingRequest> {
        self.live.get(&id)
    }

    /// Number of requests that have not completed yet, internal ones included.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Ids parked for replay, in replay order.
    pub fn refresh_queue(&self) -> Vec<RequestId> {
        self.refresh_queue.iter().map(|(id, _)| *id).collect()
    }

    // ------------------------------------------------------------------
    // Coordination and external login
    // ------------------------------------------------------------------

    /// Feed an event received from the coordination channel.
    pub fn handle_coordination_event(&mut self, event: CoordinationEvent) {
        let leader = self.channel_leader();
        match event {
            CoordinationEvent::RefreshRequested => {
                if leader != Some(true) {
                    return;
                }
                if self.refreshing_token {
                    debug!("refresh requested by a peer, one is already running");
                    return;
                }
                self.refreshing_token = true;
                self.refresh_succeeded = false;
                self.issue_refresh_call();
            }
            CoordinationEvent::RefreshComplete(signal) => {
                // Error and Complete arrive back to back from the leader; both
                // halves of a failure run on the first one so no new cycle can
                // start in between.
                if leader != Some(false) || !self.refreshing_token {
                    return;
                }
                debug!(?signal, "peer refresh finished");
                match signal {
                    RefreshSignal::Success => self.refresh_success(None),
                    RefreshSignal::Error | RefreshSignal::Complete => {
                        self.refresh_error();
                        self.refresh_complete();
                    }
                }
            }
        }
    }

    /// Resume requests parked behind an external login.
    ///
    /// `Some` stores the credentials and replays them in order; `None`
    /// fails each with the error that parked it.
    pub fn complete_external_login(&mut self, credentials: Option<Credentials>) {
        self.external_login_open = false;
        let parked: Vec<(RequestId, HttpError)> = self.external_login_queue.drain(..).collect();
        match credentials {
            Some(credentials) => {
                self.set_tokens(&credentials);
                for (id, _) in parked {
                    if let Some(mode) = self.live.get(&id).map(|r| AuthMode::for_url(&r.url)) {
                        self.execute(id, mode);
                    }
                }
            }
            None => {
                for (id, error) in parked {
                    self.fail_terminal(id, &error);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    fn next_request_id(&mut self) -> RequestId {
        self.next_id += 1;
        RequestId(self.next_id)
    }

    fn context_headers(&self, mode: AuthMode, skip_metadata_hash: bool) -> ContextHeaders {
        match mode {
            AuthMode::Anonymous => ContextHeaders::default(),
            AuthMode::TokenOnly => ContextHeaders {
                token: self.get_oauth_token(),
                ..ContextHeaders::default()
            },
            AuthMode::Full if skip_metadata_hash => ContextHeaders {
                token: self.get_oauth_token(),
                ..ContextHeaders::default()
            },
            AuthMode::Full => ContextHeaders {
                token: self.get_oauth_token(),
                metadata_hash: self.metadata_hash.clone(),
                userpref_hash: self.userpref_hash.clone(),
            },
        }
    }

    fn execute(&mut self, id: RequestId, mode: AuthMode) {
        let Some(request) = self.live.get(&id) else {
            return;
        };
        if let Continuation::Bulk(items) = &request.continuation {
            let items = items.clone();
            let (sent, body) = self.build_bulk_body(&items);
            if sent.is_empty() {
                debug!(%id, "every bulk item was aborted, dropping the batch");
                self.live.remove(&id);
                return;
            }
            if let Some(request) = self.live.get_mut(&id) {
                // The response lines up with the body, not with the original batch.
                request.continuation = Continuation::Bulk(sent);
                request.payload = Some(Payload::Json(body));
            }
        }

        let skip = self.live.get(&id).is_some_and(|r| r.options.skip_metadata_hash);
        let context = self.context_headers(mode, skip);
        let Some(request) = self.live.get_mut(&id) else {
            return;
        };
        let http = request.execute(&context, &self.state);
        self.actions.push_back(Action::Send { id, request: http });
    }

    /// Build the envelope for the items still live, returning their ids in
    /// body order alongside it.
    fn build_bulk_body(&mut self, items: &[RequestId]) -> (Vec<RequestId>, Value) {
        let mut sent = Vec::with_capacity(items.len());
        let mut entries = Vec::with_capacity(items.len());
        for &item in items {
            let Some(request) = self.live.get(&item).filter(|r| !r.aborted) else {
                continue;
            };
            let context = self.context_headers(AuthMode::Full, request.options.skip_metadata_hash);
            if let Some(request) = self.live.get_mut(&item) {
                let http = request.execute(&context, &self.state);
                entries.push(bulk::bulk_item(&http));
                sent.push(item);
            }
        }
        (sent, bulk::bulk_body(entries))
    }

    /// Re-execute a parked request with the current credentials.
    fn replay(&mut self, id: RequestId) {
        let Some(request) = self.live.get_mut(&id) else {
            return;
        };
        request.dequeuing = true;
        let mode = AuthMode::for_url(&request.url);
        debug!(%id, url = %request.url, "replaying request");
        self.execute(id, mode);
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    fn resolve_success(&mut self, id: RequestId, response: HttpResponse) {
        let Some(request) = self.live.get(&id) else {
            return;
        };
        match &request.continuation {
            Continuation::Refresh => {
                self.live.remove(&id);
                self.finish_refresh_call(Ok(response));
            }
            Continuation::Bulk(items) => {
                let items = items.clone();
                self.live.remove(&id);
                let outcomes = bulk::demultiplex(&response, items.len());
                for (item, outcome) in items.into_iter().zip(outcomes) {
                    self.handle_outcome(item, outcome);
                }
            }
            Continuation::Caller(_) => {
                let url = request.url.clone();
                let api_response = normalize(&response);
                if is_login_url(&url) {
                    match Credentials::from_value(&api_response.data) {
                        Some(credentials) => {
                            debug!(%id, "login succeeded, storing tokens");
                            self.set_tokens(&credentials);
                        }
                        None => warn!(%id, "login response lacks a token, nothing stored"),
                    }
                } else if is_logout_url(&url) {
                    self.reset_auth();
                }
                let success = self.live.get_mut(&id).and_then(|r| match &mut r.continuation {
                    Continuation::Caller(callbacks) => callbacks.success.take(),
                    _ => None,
                });
                if let Some(success) = success {
                    success(&api_response);
                }
                self.fire_complete(id, response.status, true);
            }
        }
    }

    fn intercept_error(&mut self, id: RequestId, outcome: &TransportOutcome) {
        let Some(request) = self.live.get(&id) else {
            return;
        };
        let error = HttpError::from_outcome(outcome);
        let url = request.url.clone();
        let dequeuing = request.dequeuing;

        if matches!(request.continuation, Continuation::Refresh) {
            self.live.remove(&id);
            self.finish_refresh_call(Err(error));
            return;
        }

        let auth_url = is_auth_url(&url);
        let has_refresh_token = self.get_refresh_token().is_some_and(|t| !t.is_empty());
        let need_refresh =
            !self.refreshing_token && has_refresh_token && !auth_url && error.is_invalid_grant();
        let need_queue = self.refreshing_token && !auth_url;

        if need_refresh {
            if dequeuing {
                warn!(%id, %url, "replayed request rejected again, giving up on refresh");
                self.reset_auth();
                self.fail_terminal(id, &error);
                return;
            }
            debug!(%id, %url, "access token rejected, refreshing");
            self.refresh_queue.push_back((id, error));
            self.start_refresh();
        } else if need_queue {
            debug!(%id, %url, "refresh running, parking failed request");
            self.refresh_queue.push_back((id, error));
        } else if let Some(login_url) = self.external_login_url(&error) {
            debug!(%id, %url, "external login required");
            self.external_login_queue.push_back((id, error));
            if !self.external_login_open {
                self.external_login_open = true;
                self.actions.push_back(Action::ExternalLogin { url: login_url });
            }
        } else {
            if is_logout_url(&url) {
                self.reset_auth();
            }
            self.fail_terminal(id, &error);
        }
    }

    fn external_login_url(&self, error: &HttpError) -> Option<String> {
        if !self.config.external_login || error.status != 401 {
            return None;
        }
        let payload = error.payload.as_ref()?;
        let platform = payload.get("platform").and_then(Value::as_str)?;
        if platform != self.config.platform {
            return None;
        }
        payload.get("url").and_then(Value::as_str).map(str::to_string)
    }

    /// Fire `error` then `complete`.
    fn fail_terminal(&mut self, id: RequestId, error: &HttpError) {
        self.fire_error(id, error);
        self.fire_complete(id, error.status, false);
    }

    fn fire_error(&mut self, id: RequestId, error: &HttpError) {
        let Some(request) = self.live.get_mut(&id) else {
            return;
        };
        match &mut request.continuation {
            Continuation::Caller(callbacks) => match callbacks.error.take() {
                Some(on_error) => on_error(error),
                None => match self.default_error.as_mut() {
                    Some(handler) => handler(error),
                    None => warn!(%id, status = error.status, code = ?error.code, "unhandled request error"),
                },
            },
            Continuation::Bulk(items) => {
                let items = items.clone();
                for item in items {
                    self.fire_error(item, error);
                }
            }
            Continuation::Refresh => {}
        }
    }

    /// Fire `complete` and release the request slot.
    fn fire_complete(&mut self, id: RequestId, status: u16, succeeded: bool) {
        let Some(mut request) = self.live.remove(&id) else {
            return;
        };
        match &mut request.continuation {
            Continuation::Caller(callbacks) => {
                if let Some(complete) = callbacks.complete.take() {
                    complete(&Completion {
                        id,
                        status,
                        succeeded,
                        aborted: request.aborted,
                    });
                }
            }
            Continuation::Bulk(items) => {
                let aborted = request.aborted;
                for item in items.clone() {
                    if aborted {
                        if let Some(item_request) = self.live.get_mut(&item) {
                            item_request.aborted = true;
                        }
                    }
                    self.fire_complete(item, status, succeeded);
                }
            }
            Continuation::Refresh => {}
        }
    }

    // ------------------------------------------------------------------
    // Refresh cycle
    // ------------------------------------------------------------------

    fn start_refresh(&mut self) {
        self.refreshing_token = true;
        self.refresh_succeeded = false;

        if self.channel_leader() == Some(false) {
            debug!("asking the leader to refresh");
            if let Some(channel) = self.channel.as_mut() {
                channel.broadcast(CoordinationEvent::RefreshRequested);
            }
            return;
        }
        self.issue_refresh_call();
    }

    fn issue_refresh_call(&mut self) {
        let payload = json!({
            "grant_type": "refresh_token",
            "refresh_token": self.get_refresh_token().unwrap_or_default(),
            "client_id": self.config.client_id,
            "client_secret": self.config.client_secret,
            "platform": self.config.platform,
        });
        let id = self.next_request_id();
        debug!(%id, "issuing token refresh");
        let request = PendingRequest::new(
            id,
            Method::Create,
            self.urls.login_url(),
            Some(Payload::Json(payload)),
            CallOptions::default(),
            self.config.debug,
            Continuation::Refresh,
        );
        self.live.insert(id, request);
        self.execute(id, AuthMode::Anonymous);
    }

    fn finish_refresh_call(&mut self, result: Result<HttpResponse, HttpError>) {
        let credentials = match result {
            Ok(response) => {
                let mut data = normalize(&response).data;
                // A refresh grant may omit the refresh token; the current one stays valid.
                if let (Some(fields), Some(current)) = (data.as_object_mut(), self.get_refresh_token()) {
                    if fields.get("refresh_token").and_then(Value::as_str).map_or(true, str::is_empty) {
                        fields.insert("refresh_token".to_string(), Value::String(current));
                    }
                }
                Credentials::from_value(&data)
            }
            Err(error) => {
                warn!(status = error.status, code = ?error.code, "token refresh failed");
                None
            }
        };

        match credentials {
            Some(credentials) => {
                self.broadcast_signal(RefreshSignal::Success);
                self.refresh_success(Some(credentials));
            }
            None => {
                self.broadcast_signal(RefreshSignal::Error);
                self.refresh_error();
            }
        }
        self.broadcast_signal(RefreshSignal::Complete);
        self.refresh_complete();
    }

    fn refresh_success(&mut self, credentials: Option<Credentials>) {
        self.refreshing_token = false;
        self.refresh_succeeded = true;
        if let Some(credentials) = credentials {
            self.set_tokens(&credentials);
        }
        if self.refresh_hook.is_some() {
            let current = Credentials {
                access_token: self.get_oauth_token().unwrap_or_default(),
                refresh_token: self.get_refresh_token().unwrap_or_default(),
                download_token: self.get_download_token().unwrap_or_default(),
            };
            if let Some(hook) = self.refresh_hook.as_mut() {
                hook(&current);
            }
        }

        let queued: Vec<RequestId> = self.refresh_queue.drain(..).map(|(id, _)| id).collect();
        debug!(count = queued.len(), "token refreshed, replaying queue");
        for id in queued {
            self.replay(id);
        }
    }

    fn refresh_error(&mut self) {
        self.reset_auth();
        let queued: Vec<(RequestId, HttpError)> = self.refresh_queue.iter().cloned().collect();
        for (id, error) in queued {
            self.fire_error(id, &error);
        }
        self.refreshing_token = false;
    }

    fn refresh_complete(&mut self) {
        if self.refresh_succeeded {
            return;
        }
        self.refreshing_token = false;
        let queued: Vec<(RequestId, HttpError)> = self.refresh_queue.drain(..).collect();
        for (id, error) in queued {
            self.fire_complete(id, error.status, false);
        }
    }

    /// `Some(is_leader)` when a supported channel is attached.
    fn channel_leader(&self) -> Option<bool> {
        self.channel
            .as_ref()
            .filter(|c| c.is_supported())
            .map(|c| c.is_leader())
    }

    fn broadcast_signal(&mut self, signal: RefreshSignal) {
        if self.channel_leader() != Some(true) {
            return;
        }
        if let Some(channel) = self.channel.as_mut() {
            channel.broadcast(CoordinationEvent::RefreshComplete(signal));
        }
    }

    // ------------------------------------------------------------------
    // Store access
    // ------------------------------------------------------------------

    fn read_token(&self, key: &str, cached: &Option<String>) -> Option<String> {
        match self.store.as_ref() {
            Some(store) if self.store_ready => store.get(key),
            _ => cached.clone(),
        }
    }

    fn load_tokens_from_store(&mut self) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let keys = &self.config.keys;
        self.access_token = store.get(&keys.access_token);
        self.refresh_token = store.get(&keys.refresh_token);
        self.download_token = store.get(&keys.download_token);
    }
}

fn is_logout_url(url: &str) -> bool {
    url.contains("/oauth2/logout")
}

/// Turn a successful response into the value handed to `success`.
fn normalize(response: &HttpResponse) -> ApiResponse {
    let data = if response.body.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&response.body).unwrap_or_else(|_| Value::String(response.body.clone()))
    };
    ApiResponse {
        status: response.status,
        headers: response.headers.clone(),
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_require_all_three_tokens() {
        let full = json!({"access_token": "a", "refresh_token": "r", "download_token": "d"});
        let creds = Credentials::from_value(&full).unwrap();
        assert_eq!(creds.access_token, "a");
        assert_eq!(creds.refresh_token, "r");
        assert_eq!(creds.download_token, "d");

        assert!(Credentials::from_value(&json!({"refresh_token": "r"})).is_none());
        assert!(Credentials::from_value(&json!({"access_token": ""})).is_none());
        assert!(Credentials::from_value(&json!({"access_token": "a", "download_token": "d"})).is_none());
        assert!(Credentials::from_value(&json!({"access_token": "a", "refresh_token": "r"})).is_none());
        assert!(
            Credentials::from_value(&json!({"access_token": "a", "refresh_token": "r", "download_token": ""}))
                .is_none()
        );
    }

    #[test]
    fn normalize_handles_empty_and_text_bodies() {
        assert_eq!(normalize(&HttpResponse::new(204, "")).data, Value::Null);
        assert_eq!(normalize(&HttpResponse::new(200, "plain")).data, json!("plain"));
        assert_eq!(normalize(&HttpResponse::new(200, r#"{"a":1}"#)).data, json!({"a": 1}));
    }

    #[test]
    fn ids_increase_monotonically() {
        let mut dispatcher = Dispatcher::new(DispatcherConfig::default()).unwrap();
        let a = dispatcher.call(Method::Read, "/rest/v10/me", None, Callbacks::new(), CallOptions::default());
        let b = dispatcher.call(Method::Read, "/rest/v10/me", None, Callbacks::new(), CallOptions::default());
        assert!(b > a);
        assert_eq!(dispatcher.live_count(), 2);
    }

    #[test]
    fn invalid_config_is_rejected_at_build() {
        let config = DispatcherConfig {
            platform: String::new(),
            ..DispatcherConfig::default()
        };
        assert_eq!(Dispatcher::new(config).err(), Some(ConfigError::EmptyPlatform));
    }

    #[test]
    fn auth_mode_follows_url() {
        assert_eq!(AuthMode::for_url("/rest/v10/oauth2/token"), AuthMode::Anonymous);
        assert_eq!(AuthMode::for_url("/rest/v10/oauth2/logout"), AuthMode::TokenOnly);
        assert_eq!(AuthMode::for_url("/rest/v10/Accounts"), AuthMode::Full);
    }
}
