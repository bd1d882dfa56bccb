use sqlx::migrate::Migrator;

/// 启动时执行的嵌入式迁移
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");
