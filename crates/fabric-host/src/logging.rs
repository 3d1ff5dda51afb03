//! Logging host function implementation.
//!
//! `log_msg(ptr, len, level, ident)` lets guests emit log lines. Entries are
//! both:
//! 1. Stored in the [`CallContext`] for later retrieval
//! 2. Emitted via the `tracing` crate, tagged `guest_log = true`

use futures::future::BoxFuture;
use tracing::{debug, error, info, warn};

use fabric_core::{CallContext, HostCall, HostRegistry, LogLevel, Returns, reject};

/// Register `log_msg`.
pub fn register(registry: &mut HostRegistry) {
    registry.register("log_msg", 4, Returns::Void, log_msg);
}

fn log_msg(mut call: HostCall<'_>) -> BoxFuture<'_, i32> {
    Box::pin(async move {
        let (ptr, len, level, ident) = (call.arg(0), call.arg(1), call.arg(2), call.ident());
        let ctx = match call.context() {
            Ok(ctx) => ctx,
            Err(e) => return reject("log_msg", ident, &e),
        };
        let message = match call.read_memory(ptr, len) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => return reject("log_msg", ident, &e),
        };
        log(&mut ctx.lock(), level_from_i32(level), message);
        0
    })
}

/// Record a guest log line on `ctx` and emit it through `tracing`.
pub fn log(ctx: &mut CallContext, level: LogLevel, message: String) {
    let fqmn = ctx.fqmn();
    let request_id = ctx.request().id.as_str();
    match level {
        LogLevel::Debug => debug!(fqmn, request_id, guest_log = true, "{}", message),
        LogLevel::Info => info!(fqmn, request_id, guest_log = true, "{}", message),
        LogLevel::Warn => warn!(fqmn, request_id, guest_log = true, "{}", message),
        LogLevel::Error => error!(fqmn, request_id, guest_log = true, "{}", message),
    }
    ctx.log(level, message);
}

/// Convert the guest's numeric log level to [`LogLevel`].
///
/// `1` is error, `2` warn, `3` info and `4` debug; anything else is info.
pub fn level_from_i32(level: i32) -> LogLevel {
    match level {
        1 => LogLevel::Error,
        2 => LogLevel::Warn,
        4 => LogLevel::Debug,
        _ => LogLevel::Info,
    }
}

/// Convert a [`LogLevel`] to the guest's numeric level.
pub fn level_to_i32(level: LogLevel) -> i32 {
    match level {
        LogLevel::Error => 1,
        LogLevel::Warn => 2,
        LogLevel::Info => 3,
        LogLevel::Debug => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_conversion() {
        assert_eq!(level_from_i32(1), LogLevel::Error);
        assert_eq!(level_from_i32(2), LogLevel::Warn);
        assert_eq!(level_from_i32(3), LogLevel::Info);
        assert_eq!(level_from_i32(4), LogLevel::Debug);
        assert_eq!(level_from_i32(0), LogLevel::Info);
        assert_eq!(level_from_i32(99), LogLevel::Info);
    }

    #[test]
    fn test_level_roundtrip() {
        for level in [
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
        ] {
            assert_eq!(level_from_i32(level_to_i32(level)), level);
        }
    }
}
