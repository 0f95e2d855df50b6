//! Internal logging helpers for structured gristmill events.

/// Single logging target for the merge subsystem.
pub(crate) const LOG_TARGET: &str = "gristmill";

macro_rules! grist_log {
    ($level:expr, $event:expr, $fmt:expr $(, $args:expr)* $(,)?) => {{
        if log::log_enabled!($level) {
            log::log!(
                target: crate::logging::LOG_TARGET,
                $level,
                "event={} {}",
                $event,
                format_args!($fmt $(, $args)*)
            );
        }
    }};
}

pub(crate) use grist_log;
