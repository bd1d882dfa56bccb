#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use application::{
    memory::{MemoryMessageRepository, MemoryPresenceRepository},
    DispatcherSettings, RealtimeDependencies, RealtimeHub,
};
use axum::Router;
use config::RealtimeConfig;
use domain::{MessageRepository, Session, UserId};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::CloseFrame, Message},
    MaybeTlsStream, WebSocketStream,
};
use uuid::Uuid;
use web_api::{router, AppState, JwtService};

pub const SECRET: &str = "integration-test-secret-with-enough-length";

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestApp {
    pub router: Router,
    pub hub: RealtimeHub,
    pub jwt: JwtService,
    pub messages: MemoryMessageRepository,
    pub presence: MemoryPresenceRepository,
}

/// 使用内存存储和 JWT 会话组装完整应用
pub fn build_app(realtime: RealtimeConfig) -> TestApp {
    let messages = MemoryMessageRepository::default();
    build_app_with(realtime, messages.clone(), Arc::new(messages))
}

/// 私信写入走 `store`，`messages` 只用于断言
fn build_app_with(
    realtime: RealtimeConfig,
    messages: MemoryMessageRepository,
    store: Arc<dyn MessageRepository>,
) -> TestApp {
    let presence = MemoryPresenceRepository::default();
    let jwt = JwtService::new(SECRET, chrono::Duration::hours(1));

    let hub = RealtimeHub::start(RealtimeDependencies::new(
        store,
        Arc::new(presence.clone()),
        DispatcherSettings::from(&realtime),
    ));
    let state = AppState::new(&hub, Arc::new(jwt.clone()), realtime);

    TestApp {
        router: router(state),
        hub,
        jwt,
        messages,
        presence,
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub jwt: JwtService,
    pub messages: MemoryMessageRepository,
    pub presence: MemoryPresenceRepository,
}

pub async fn spawn_server() -> TestServer {
    spawn_server_with(RealtimeConfig::default()).await
}

pub async fn spawn_server_with(realtime: RealtimeConfig) -> TestServer {
    serve(build_app(realtime)).await
}

/// 使用指定的私信存储启动服务
pub async fn spawn_server_with_store(
    realtime: RealtimeConfig,
    store: Arc<dyn MessageRepository>,
) -> TestServer {
    serve(build_app_with(realtime, MemoryMessageRepository::default(), store)).await
}

async fn serve(app: TestApp) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    let router = app.router;
    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service()).await.ok();
    });

    TestServer {
        addr,
        jwt: app.jwt,
        messages: app.messages,
        presence: app.presence,
    }
}

pub fn new_user(name: &str) -> Session {
    Session::new(UserId(Uuid::new_v4()), name)
}

impl TestServer {
    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/api/v1/ws", self.addr)
    }

    pub fn token(&self, session: &Session) -> String {
        self.jwt.generate_token(session).expect("token")
    }

    /// 连接并消费掉首帧在线列表
    pub async fn connect(&self, session: &Session) -> WsClient {
        let url = format!("{}?token={}", self.ws_url(), self.token(session));
        let (mut ws, _) = connect_async(url).await.expect("websocket connect");
        let snapshot = next_frame(&mut ws).await;
        assert_eq!(snapshot["type"], "presence-snapshot");
        ws
    }
}

pub async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("send frame");
}

/// 下一条文本帧，超时则测试失败
pub async fn next_frame(ws: &mut WsClient) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match message {
            Message::Text(text) => return serde_json::from_str(text.as_str()).expect("json frame"),
            Message::Close(frame) => panic!("unexpected close: {frame:?}"),
            _ => continue,
        }
    }
}

/// 跳过其他帧，直到收到指定类型
pub async fn next_of_type(ws: &mut WsClient, frame_type: &str) -> Value {
    loop {
        let frame = next_frame(ws).await;
        if frame["type"] == frame_type {
            return frame;
        }
    }
}

/// 等待服务端的关闭帧
pub async fn expect_close(ws: &mut WsClient) -> Option<CloseFrame> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for close");
        match message {
            Some(Ok(Message::Close(frame))) => return frame,
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

/// 在截止时间内轮询直到条件成立
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met in time");
}
