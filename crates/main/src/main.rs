//! 主应用程序入口
//!
//! 启动论坛实时子系统：WebSocket 入口和在线状态查询接口。

use std::sync::Arc;

use anyhow::Context;
use application::memory::{MemoryMessageRepository, MemoryPresenceRepository};
use application::{DispatcherSettings, RealtimeDependencies, RealtimeHub};
use config::{AppConfig, AuthStrategy};
use domain::{MessageRepository, PresenceRepository, SessionRepository};
use infrastructure::{create_pg_pool, PgStorage, MIGRATOR};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtService};

struct Stores {
    messages: Arc<dyn MessageRepository>,
    presence: Arc<dyn PresenceRepository>,
    sessions: Arc<dyn SessionRepository>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load().context("加载配置失败")?;
    tracing::info!(database = %config.sanitized_database_url(), "配置已加载");

    let stores = build_stores(&config).await?;

    let hub = RealtimeHub::start(RealtimeDependencies::new(
        stores.messages,
        stores.presence,
        DispatcherSettings::from(&config.realtime),
    ));
    let state = AppState::new(&hub, stores.sessions, config.realtime.clone());
    let app = router(state).layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("无法监听 {addr}"))?;

    tracing::info!("论坛实时服务启动在 http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub.shutdown_token()))
        .await?;

    // 关闭所有连接并写完剩余的在线状态
    hub.shutdown().await;
    tracing::info!("服务已停止");

    Ok(())
}

async fn build_stores(config: &AppConfig) -> anyhow::Result<Stores> {
    let jwt = || -> anyhow::Result<Arc<dyn SessionRepository>> {
        let secret = config
            .auth
            .jwt_secret
            .as_deref()
            .context("auth.jwt_secret 未配置")?;
        Ok(Arc::new(JwtService::new(secret, chrono::Duration::hours(24))))
    };

    match &config.database.url {
        Some(url) => {
            let pool = create_pg_pool(url, config.database.max_connections)
                .await
                .context("连接数据库失败")?;

            // 运行迁移
            MIGRATOR.run(&pool).await.context("数据库迁移失败")?;

            let storage = PgStorage::new(pool);
            let sessions: Arc<dyn SessionRepository> = match config.auth.strategy {
                AuthStrategy::Session => storage.session_repository.clone(),
                AuthStrategy::Jwt => jwt()?,
            };
            Ok(Stores {
                messages: storage.message_repository.clone(),
                presence: storage.presence_repository.clone(),
                sessions,
            })
        }
        None => {
            tracing::warn!("未配置数据库，使用内存存储");
            Ok(Stores {
                messages: Arc::new(MemoryMessageRepository::default()),
                presence: Arc::new(MemoryPresenceRepository::default()),
                sessions: jwt()?,
            })
        }
    }
}

/// 收到 Ctrl-C 后让调度器关闭所有实时连接
async fn shutdown_signal(realtime: tokio_util::sync::CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "无法监听关闭信号");
    }
    tracing::info!("收到关闭信号");
    realtime.cancel();
}
