use std::any::type_name;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use bincode::{Decode, Encode};
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::EnvFilter;

pub fn read_u32(src: &[u8], offset: usize) -> u32 {
    let mut u32_bytes = [0u8; 4];
    u32_bytes.copy_from_slice(&src[offset..(offset + 4)]);
    u32::from_be_bytes(u32_bytes)
}

pub fn encode_bytes<T>(value: &T) -> anyhow::Result<Vec<u8>>
where
    T: Encode,
{
    bincode::encode_to_vec(value, bincode::config::standard()).context(type_name::<T>())
}

pub fn decode_bytes<T>(bytes: &[u8]) -> anyhow::Result<T>
where
    T: Decode,
{
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .context(type_name::<T>())
        .map(|(t, _)| t)
}

/// Wall clock milliseconds since the unix epoch, used for message and member timestamps.
pub fn current_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

pub fn init_logger(level: tracing::Level) {
    let format = tracing_subscriber::fmt::format()
        .with_timer(LocalTime::rfc_3339())
        .pretty();
    let _ = tracing_subscriber::FmtSubscriber::builder()
        .event_format(format)
        .with_max_level(level)
        .try_init();
}

pub fn init_logger_with_filter(filter: impl Into<EnvFilter>) {
    let format = tracing_subscriber::fmt::format()
        .with_timer(LocalTime::rfc_3339())
        .pretty()
        .with_file(false);
    let _ = tracing_subscriber::FmtSubscriber::builder()
        .event_format(format)
        .with_env_filter(filter)
        .try_init();
}
