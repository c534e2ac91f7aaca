use chrono::Utc;
use uuid::Uuid;

/// 当前 Unix 时间戳（秒）
pub fn current_timestamp() -> u64 {
    Utc::now().timestamp() as u64
}

/// 生成一个随机唯一 ID
pub fn generate_uuid() -> String {
    Uuid::new_v4().to_string()
}
