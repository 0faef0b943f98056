use std::fmt;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

/// Локальное время с миллисекундами
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalMillis;

impl FormatTime for LocalMillis {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        let now = chrono::Local::now();
        write!(w, "[{}]", now.format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

pub fn logging_enabled() -> bool {
    if !crate::config::LOGGING_ENABLED {
        return false;
    }
    // В режиме разработки дополнительно проверяем dev::ENABLE_LOGGING
    crate::config::dev::ENABLE_LOGGING
}

/// Устанавливает глобальный subscriber. `RUST_LOG` важнее `filter`.
/// Возвращает false, если логирование выключено или subscriber уже стоит.
pub fn init(filter: &str) -> bool {
    if !logging_enabled() {
        return false;
    }

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_timer(LocalMillis)
        .with_target(true)
        .try_init()
        .is_ok()
}
