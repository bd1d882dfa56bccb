//! 单个 WebSocket 连接的生命周期
//!
//! 每条连接运行三个协作循环，都在连接的关闭令牌上停止：
//! - 读循环：解码入站帧并交给 [`InboundHandler`](application::InboundHandler)
//! - 心跳循环：定时 ping，并在空闲超时后关闭连接
//! - 写循环：唯一持有套接字发送端的任务

use std::time::Duration;

use application::{ApplicationError, CloseReason, ConnectionHandle, Outbound, OutboundQueue};
use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message as WsMessage, Utf8Bytes, WebSocket};
use domain::Session;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{Instant, MissedTickBehavior};

use crate::state::AppState;

/// 发送关闭帧的最长等待时间
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// 运行连接直到关闭，会话必须在升级前已经解析
pub async fn run(socket: WebSocket, state: AppState, session: Session) {
    let (connection, queue) = ConnectionHandle::new(
        &session,
        state.clock.now(),
        state.realtime.outbound_buffer,
    );
    let user_id = connection.user_id();
    let connection_id = connection.id();

    if let Err(err) = state.dispatcher.register(connection.clone()).await {
        tracing::error!(user_id = %user_id, error = %err, "连接注册失败");
        return;
    }
    tracing::info!(user_id = %user_id, connection_id = %connection_id, "WebSocket 连接已建立");

    let (sink, stream) = socket.split();

    // 写任务：统一处理所有对 WebSocket sender 的写操作
    let writer = tokio::spawn(write_loop(sink, queue, connection.clone()));
    let liveness = tokio::spawn(liveness_loop(
        connection.clone(),
        state.realtime.ping_interval(),
        state.realtime.idle_timeout(),
    ));

    read_loop(stream, &connection, &state).await;

    // 读循环退出时连接一定已关闭，这里只是兜底
    connection.close(CloseReason::ReadError);
    if let Err(err) = liveness.await {
        tracing::warn!(connection_id = %connection_id, error = %err, "心跳任务异常退出");
    }
    if let Err(err) = writer.await {
        tracing::warn!(connection_id = %connection_id, error = %err, "写任务异常退出");
    }

    if let Err(err) = state.dispatcher.unregister(user_id, connection_id).await {
        tracing::warn!(user_id = %user_id, error = %err, "连接注销失败");
    }

    tracing::info!(
        user_id = %user_id,
        connection_id = %connection_id,
        reason = %connection.close_reason().unwrap_or(CloseReason::ReadError),
        connected_secs = (state.clock.now() - connection.created_at()).num_seconds(),
        "WebSocket 连接已关闭"
    );
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    connection: &ConnectionHandle,
    state: &AppState,
) {
    loop {
        let frame = tokio::select! {
            _ = connection.closed() => return,
            frame = stream.next() => frame,
        };

        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                tracing::debug!(connection_id = %connection.id(), error = %err, "读取失败");
                connection.close(CloseReason::ReadError);
                return;
            }
            None => {
                connection.close(CloseReason::ClientClosed);
                return;
            }
        };

        // 任何入站帧都刷新空闲期限
        connection.touch();

        match message {
            WsMessage::Text(text) => {
                // 连接被取代或驱逐时不再等待存储
                let handled = tokio::select! {
                    _ = connection.closed() => return,
                    handled = state.inbound.handle_text(connection, text.as_str()) => handled,
                };
                match handled {
                    Ok(outcome) => {
                        tracing::trace!(connection_id = %connection.id(), ?outcome, "入站帧已处理");
                    }
                    Err(ApplicationError::DispatcherUnavailable) => {
                        connection.close(CloseReason::Shutdown);
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(
                            user_id = %connection.user_id(),
                            connection_id = %connection.id(),
                            error = %err,
                            "入站帧被丢弃"
                        );
                    }
                }
            }
            WsMessage::Binary(_) => {
                tracing::debug!(connection_id = %connection.id(), "忽略二进制帧");
            }
            // 底层协议栈会自动回复 pong
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
            WsMessage::Close(_) => {
                connection.close(CloseReason::ClientClosed);
                return;
            }
        }
    }
}

async fn liveness_loop(connection: ConnectionHandle, ping_interval: Duration, idle_timeout: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let deadline = connection.last_activity() + idle_timeout;
        tokio::select! {
            _ = connection.closed() => return,
            _ = ticker.tick() => {
                if let Err(err) = connection.try_push(Outbound::Ping) {
                    tracing::debug!(connection_id = %connection.id(), error = %err, "ping 入队失败");
                    connection.close(CloseReason::SlowConsumer);
                    return;
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                // 等待期间可能收到了新帧
                if connection.last_activity() + idle_timeout <= Instant::now() {
                    tracing::info!(
                        user_id = %connection.user_id(),
                        connection_id = %connection.id(),
                        "连接空闲超时"
                    );
                    connection.close(CloseReason::IdleTimeout);
                    return;
                }
            }
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut queue: OutboundQueue,
    connection: ConnectionHandle,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = connection.closed() => break,
            item = queue.recv() => item,
        };
        let message = match item {
            Some(Outbound::Text(text)) => WsMessage::Text(String::from(&*text).into()),
            Some(Outbound::Ping) => WsMessage::Ping(Bytes::new()),
            None => break,
        };

        let sent = tokio::select! {
            _ = connection.closed() => break,
            sent = sink.send(message) => sent,
        };
        if let Err(err) = sent {
            tracing::debug!(connection_id = %connection.id(), error = %err, "写入失败");
            connection.close(CloseReason::SlowConsumer);
            break;
        }
    }

    let reason = connection.close_reason().unwrap_or(CloseReason::Shutdown);
    let frame = WsMessage::Close(Some(CloseFrame {
        code: reason.code(),
        reason: Utf8Bytes::from_static(reason.as_str()),
    }));
    if tokio::time::timeout(CLOSE_FRAME_TIMEOUT, sink.send(frame))
        .await
        .is_err()
    {
        tracing::debug!(connection_id = %connection.id(), "关闭帧发送超时");
    }
}
