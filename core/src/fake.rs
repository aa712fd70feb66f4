//! An in-process stand-in for the chat server, used by tests and the offline smoke run.

use crate::auth::CredentialPair;
use crate::coordinator::{LOGIN_PATH, REFRESH_PATH, REGISTER_PATH};
use crate::http::{
    ApiRequest, ApiResponse, HttpMethod, HttpTransport, StreamingResponse, TransportError,
};
use crate::user::{profile_path, EMAIL_CODE_PATH, QUERY_INFO_PATH, UPDATE_PASSWORD_PATH};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Local;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

pub const DEMO_USERNAME: &str = "demo";
pub const DEMO_PASSWORD: &str = "secret";

const SESSION_PATH: &str = "/chat/session/";
const MESSAGE_PATH: &str = "/chat/message/";
const AI_RESPONSE_PATH: &str = "/chat/message/ai-response/";

/// How the fake answers the AI-response endpoint.
#[derive(Debug, Clone)]
pub enum ReplyScript {
    /// Stream a reasoning-then-content reply echoing the user's message.
    Echo,
    /// Send exactly these chunks, then close.
    Chunks(Vec<Vec<u8>>),
    /// Send these chunks, then keep the connection open without sending more.
    ChunksThenHang(Vec<Vec<u8>>),
}

#[derive(Clone)]
pub struct FakeBackend {
    inner: Arc<Mutex<BackendState>>,
}

struct BackendState {
    generation: u32,
    access: Option<String>,
    refresh: Option<String>,
    refresh_calls: usize,
    refresh_delay: Option<Duration>,
    refresh_fails: bool,
    always_unauthorized: HashSet<String>,
    rejections: HashMap<String, (u16, Value)>,
    requests: Vec<ApiRequest>,
    sessions: Vec<Value>,
    messages: Vec<Value>,
    next_id: i64,
    reply: ReplyScript,
    password: String,
    profile: Value,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BackendState {
                generation: 0,
                access: None,
                refresh: None,
                refresh_calls: 0,
                refresh_delay: None,
                refresh_fails: false,
                always_unauthorized: HashSet::new(),
                rejections: HashMap::new(),
                requests: Vec::new(),
                sessions: Vec::new(),
                messages: Vec::new(),
                next_id: 1,
                reply: ReplyScript::Echo,
                password: DEMO_PASSWORD.to_string(),
                profile: json!({
                    "id": 1,
                    "username": DEMO_USERNAME,
                    "name": "Demo",
                    "email": "demo@example.com",
                    "gender": 0,
                    "is_active": true,
                    "date_joined": "2025-01-01 00:00:00",
                    "last_login": null,
                    "avatar": "/media/avatar/default.png",
                }),
            })),
        }
    }

    /// Mint a fresh pair as if the demo user had just logged in.
    pub fn issue_credentials(&self) -> CredentialPair {
        self.inner.lock().mint()
    }

    /// Invalidate the current access token; the refresh token stays valid.
    pub fn expire_access_token(&self) {
        self.inner.lock().access = None;
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        self.inner.lock().refresh_delay = Some(delay);
    }

    pub fn fail_refresh(&self) {
        self.inner.lock().refresh_fails = true;
    }

    pub fn always_unauthorized(&self, path: &str) {
        self.inner.lock().always_unauthorized.insert(path.to_string());
    }

    pub fn reject_path(&self, path: &str, status: u16, payload: Value) {
        self.inner
            .lock()
            .rejections
            .insert(path.to_string(), (status, payload));
    }

    pub fn set_reply(&self, reply: ReplyScript) {
        self.inner.lock().reply = reply;
    }

    pub fn refresh_calls(&self) -> usize {
        self.inner.lock().refresh_calls
    }

    /// Every non-refresh request, in arrival order.
    pub fn requests(&self) -> Vec<ApiRequest> {
        self.inner.lock().requests.clone()
    }

    async fn refresh(&self, request: &ApiRequest) -> ApiResponse {
        let delay = {
            let mut state = self.inner.lock();
            state.refresh_calls += 1;
            state.refresh_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.inner.lock();
        let presented = request
            .body
            .as_ref()
            .and_then(|body| body.get("refresh"))
            .and_then(Value::as_str);
        if state.refresh_fails || presented.is_none() || presented != state.refresh.as_deref() {
            return ApiResponse::new(
                401,
                json!({"detail": "Token is invalid or expired", "code": "token_not_valid"}),
            );
        }
        let pair = state.mint();
        ApiResponse::new(200, json!({"access": pair.access, "refresh": pair.refresh}))
    }

    fn handle(&self, request: &ApiRequest) -> ApiResponse {
        let mut state = self.inner.lock();
        state.requests.push(request.clone());

        if let Some((status, payload)) = state.rejections.get(&request.path) {
            return ApiResponse::new(*status, payload.clone());
        }
        if request.path == LOGIN_PATH {
            return state.login(request);
        }
        if request.path == REGISTER_PATH {
            return ApiResponse::new(
                200,
                json!({"status": 200, "data": state.user_info(), "message": "注册成功"}),
            );
        }
        if let Some(denied) = state.authorize(request) {
            return denied;
        }
        match (request.method, request.path.as_str()) {
            (HttpMethod::Get, QUERY_INFO_PATH) => ApiResponse::new(
                200,
                json!({"status": 200, "data": state.user_info(), "message": "获取用户信息成功"}),
            ),
            (HttpMethod::Get, SESSION_PATH) => ApiResponse::new(
                200,
                json!({"status": 200, "data": state.sessions.clone(), "message": "操作成功"}),
            ),
            (HttpMethod::Get, MESSAGE_PATH) => {
                let session_id = request
                    .query
                    .iter()
                    .find(|(key, _)| key == "session_id")
                    .and_then(|(_, value)| value.parse::<i64>().ok());
                let messages: Vec<Value> = state
                    .messages
                    .iter()
                    .filter(|message| {
                        session_id.is_none() || message["session"]["id"].as_i64() == session_id
                    })
                    .cloned()
                    .collect();
                ApiResponse::new(
                    200,
                    json!({"status": 200, "data": messages, "message": "操作成功"}),
                )
            }
            (HttpMethod::Post, MESSAGE_PATH) => state.create_user_message(request),
            (HttpMethod::Patch, UPDATE_PASSWORD_PATH) => state.update_password(request),
            (HttpMethod::Get, EMAIL_CODE_PATH) => state.email_code(request),
            (HttpMethod::Patch, path) if path == profile_path(1) => state.update_profile(request),
            _ => ApiResponse::new(200, json!({"status": 200, "data": null, "message": "操作成功"})),
        }
    }
}

impl BackendState {
    fn mint(&mut self) -> CredentialPair {
        self.generation += 1;
        let pair = CredentialPair {
            access: format!("access-{}", self.generation),
            refresh: format!("refresh-{}", self.generation),
        };
        self.access = Some(pair.access.clone());
        self.refresh = Some(pair.refresh.clone());
        pair
    }

    fn authorize(&self, request: &ApiRequest) -> Option<ApiResponse> {
        let valid = !self.always_unauthorized.contains(&request.path)
            && request.bearer().is_some()
            && request.bearer() == self.access.as_deref();
        (!valid).then(|| {
            ApiResponse::new(
                401,
                json!({"detail": "Given token not valid for any token type", "code": "token_not_valid"}),
            )
        })
    }

    fn login(&mut self, request: &ApiRequest) -> ApiResponse {
        let body = request.body.clone().unwrap_or(Value::Null);
        if body["username"] != DEMO_USERNAME || body["password"] != self.password.as_str() {
            return ApiResponse::new(400, json!({"status": 400, "message": "用户名或密码错误"}));
        }
        let pair = self.mint();
        ApiResponse::new(
            200,
            json!({
                "status": 200,
                "data": self.user_info(),
                "message": "登录成功",
                "access": pair.access,
                "refresh": pair.refresh,
                "expires_in": 3600,
            }),
        )
    }

    fn user_info(&self) -> Value {
        self.profile.clone()
    }

    fn update_profile(&mut self, request: &ApiRequest) -> ApiResponse {
        if let (Some(Value::Object(changes)), Value::Object(profile)) =
            (request.body.as_ref(), &mut self.profile)
        {
            for (key, value) in changes {
                if !matches!(key.as_str(), "id" | "username") {
                    profile.insert(key.clone(), value.clone());
                }
            }
        }
        ApiResponse::new(
            200,
            json!({"status": 200, "data": self.user_info(), "message": "更新成功"}),
        )
    }

    fn update_password(&mut self, request: &ApiRequest) -> ApiResponse {
        let body = request.body.clone().unwrap_or(Value::Null);
        if body["old_password"] != self.password.as_str() {
            return bad_request("旧密码错误");
        }
        if body["new_password"] != body["confirm_password"] {
            return bad_request("新密码和确认密码不一致");
        }
        match body["new_password"].as_str() {
            Some(password) if !password.is_empty() => {
                self.password = password.to_string();
                ApiResponse::new(
                    200,
                    json!({"status": 200, "data": null, "message": "修改密码成功"}),
                )
            }
            _ => bad_request("新密码不能为空"),
        }
    }

    fn email_code(&self, request: &ApiRequest) -> ApiResponse {
        let param = |name: &str| {
            request
                .query
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
        };
        let change_pwd = param("changePwd") == Some("true");
        match param("email") {
            None | Some("") => bad_request("请输入邮箱"),
            Some(email) if !change_pwd && self.profile["email"] == email => {
                bad_request("该邮箱已被使用")
            }
            Some(_) => ApiResponse::new(
                200,
                json!({"status": 200, "data": null, "message": "验证邮件已发送"}),
            ),
        }
    }

    fn allocate_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn timestamp() -> String {
        Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
    }

    fn create_user_message(&mut self, request: &ApiRequest) -> ApiResponse {
        let body = request.body.clone().unwrap_or(Value::Null);
        let content = body["content"].as_str().unwrap_or_default().to_string();
        let known = body["session_id"].as_i64().and_then(|id| {
            self.sessions
                .iter()
                .find(|session| session["id"].as_i64() == Some(id))
                .cloned()
        });
        let session = match (body["session_id"].as_i64(), known) {
            (_, Some(session)) => session,
            (Some(_), None) => {
                return ApiResponse::new(
                    404,
                    json!({"status": 404, "message": "当前会话不存在或无权限访问"}),
                )
            }
            (None, None) => {
                let id = self.allocate_id();
                let title: String = content.chars().take(20).collect();
                let session = json!({
                    "id": id,
                    "title": title,
                    "user": 1,
                    "created_at": Self::timestamp(),
                    "updated_at": Self::timestamp(),
                    "is_active": true,
                });
                self.sessions.insert(0, session.clone());
                session
            }
        };
        let id = self.allocate_id();
        let message = json!({
            "id": id,
            "role": "user",
            "reasoning_content": null,
            "content": content,
            "created_at": Self::timestamp(),
            "tokens": 0,
            "message_resp_id": null,
            "session": session,
            "model": self.model(body["model_id"].as_str().unwrap_or("doubao-seed-1-6")),
            "parent_message": body["parent_message_id"],
        });
        self.messages.push(message.clone());
        ApiResponse::new(
            201,
            json!({"status": 201, "data": message, "message": "用户消息创建成功"}),
        )
    }

    fn model(&self, model_id: &str) -> Value {
        json!({
            "id": 1,
            "name": model_id,
            "model_id": model_id,
            "description": "",
            "is_active": true,
            "ep_id": null,
        })
    }

    fn reply_chunks(&mut self, request: &ApiRequest) -> Result<Vec<Vec<u8>>, ApiResponse> {
        let body = request.body.clone().unwrap_or(Value::Null);
        let user_message = body["user_message_id"].as_i64().and_then(|id| {
            self.messages
                .iter()
                .find(|message| message["id"].as_i64() == Some(id) && message["role"] == "user")
                .cloned()
        });
        let Some(user_message) = user_message else {
            return Err(ApiResponse::new(
                404,
                json!({"status": 404, "message": "用户消息不存在或无权限访问"}),
            ));
        };
        let prompt = user_message["content"].as_str().unwrap_or_default();
        let reasoning = format!("The user said \"{prompt}\".");
        let content = format!("Echo: {prompt}");

        let frame = |value: Value| format!("data: {value}\n\n").into_bytes();
        let mut chunks = vec![frame(json!({
            "type": "message_start",
            "data": {
                "id": -1,
                "role": "assistant",
                "reasoning_content": "",
                "content": "",
                "created_at": null,
                "tokens": 0,
                "message_resp_id": null,
                "session": user_message["session"],
                "model": user_message["model"],
                "parent_message": user_message["id"],
            }
        }))];
        for word in reasoning.split_inclusive(' ') {
            chunks.push(frame(json!({
                "id": "item_1",
                "choices": [{"index": 0, "delta": {"role": "assistant", "content": "", "reasoning_content": word}}],
                "model": user_message["model"]["model_id"],
                "object": "response",
            })));
        }
        for word in content.split_inclusive(' ') {
            chunks.push(frame(json!({
                "id": "item_2",
                "choices": [{"index": 0, "delta": {"role": "assistant", "content": word}}],
                "model": user_message["model"]["model_id"],
                "object": "response",
            })));
        }

        let id = self.allocate_id();
        let tokens = (reasoning.len() + content.len()) as u64;
        let stored = json!({
            "id": id,
            "role": "assistant",
            "reasoning_content": reasoning,
            "content": content,
            "created_at": Self::timestamp(),
            "tokens": tokens,
            "message_resp_id": format!("resp_{id}"),
            "session": user_message["session"],
            "model": user_message["model"],
            "parent_message": user_message["id"],
        });
        self.messages.push(stored.clone());
        chunks.push(frame(json!({
            "type": "message_end",
            "data": {
                "id": id,
                "created_at": stored["created_at"],
                "message_resp_id": stored["message_resp_id"],
                "tokens": tokens,
            }
        })));
        Ok(chunks)
    }
}

#[async_trait]
impl HttpTransport for FakeBackend {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        if request.path == REFRESH_PATH {
            return Ok(self.refresh(request).await);
        }
        Ok(self.handle(request))
    }

    async fn open_stream(
        &self,
        request: &ApiRequest,
    ) -> Result<StreamingResponse, TransportError> {
        let mut state = self.inner.lock();
        state.requests.push(request.clone());
        let failed = |response: ApiResponse| {
            let body = serde_json::to_vec(&response.body).unwrap_or_default();
            StreamingResponse {
                status: response.status,
                body: stream::iter(vec![Ok(Bytes::from(body))]).boxed(),
            }
        };
        if request.path != AI_RESPONSE_PATH {
            return Ok(failed(ApiResponse::new(404, json!({"detail": "Not found."}))));
        }
        if let Some(denied) = state.authorize(request) {
            return Ok(failed(denied));
        }
        let (chunks, hang) = match state.reply.clone() {
            ReplyScript::Echo => match state.reply_chunks(request) {
                Ok(chunks) => (chunks, false),
                Err(response) => return Ok(failed(response)),
            },
            ReplyScript::Chunks(chunks) => (chunks, false),
            ReplyScript::ChunksThenHang(chunks) => (chunks, true),
        };
        let head = stream::iter(chunks.into_iter().map(|chunk| Ok(Bytes::from(chunk))));
        let body = if hang {
            head.chain(stream::pending()).boxed()
        } else {
            head.boxed()
        };
        Ok(StreamingResponse { status: 200, body })
    }
}

fn bad_request(message: &str) -> ApiResponse {
    ApiResponse::new(400, json!({"status": 400, "message": message}))
}
