//! Crate-internal observability macros.
//!
//! Precedence:
//! 1) `tracing` feature => emit `tracing::*` events
//! 2) `logging` feature => emit `log::*` records
//! 3) neither enabled => no-op (format args are still type-checked)
//!
//! Every bootstrap failure is logged with a `category=` field (`network`, `trust`,
//! `server`, `transient`) so operators can tell which remedy applies.

#[allow(unused_macros)]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        #[cfg(feature = "tracing")]
        { tracing::debug!($($arg)*); }

        #[cfg(all(not(feature = "tracing"), feature = "logging"))]
        { log::debug!($($arg)*); }

        #[cfg(all(not(feature = "tracing"), not(feature = "logging")))]
        { let _ = format_args!($($arg)*); }
    }};
}

#[allow(unused_macros)]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        #[cfg(feature = "tracing")]
        { tracing::info!($($arg)*); }

        #[cfg(all(not(feature = "tracing"), feature = "logging"))]
        { log::info!($($arg)*); }

        #[cfg(all(not(feature = "tracing"), not(feature = "logging")))]
        { let _ = format_args!($($arg)*); }
    }};
}

#[allow(unused_macros)]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        #[cfg(feature = "tracing")]
        { tracing::warn!($($arg)*); }

        #[cfg(all(not(feature = "tracing"), feature = "logging"))]
        { log::warn!($($arg)*); }

        #[cfg(all(not(feature = "tracing"), not(feature = "logging")))]
        { let _ = format_args!($($arg)*); }
    }};
}

#[allow(unused_macros)]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        #[cfg(feature = "tracing")]
        { tracing::error!($($arg)*); }

        #[cfg(all(not(feature = "tracing"), feature = "logging"))]
        { log::error!($($arg)*); }

        #[cfg(all(not(feature = "tracing"), not(feature = "logging")))]
        { let _ = format_args!($($arg)*); }
    }};
}

/// Logs at WARN when `$loud` is true, otherwise at DEBUG.
///
/// Paired with the retry loop's error tracker: the first few identical failures are
/// loud, the rest are demoted.
#[allow(unused_macros)]
macro_rules! log_warn_or_debug {
    ($loud:expr, $($arg:tt)*) => {{
        if $loud {
            $crate::observability::log_warn!($($arg)*);
        } else {
            $crate::observability::log_debug!($($arg)*);
        }
    }};
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
pub(crate) use log_warn_or_debug;
