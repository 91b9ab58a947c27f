/// Panics in debug builds; logs a `tracing` error in release builds.
/// For hot-path invariants that must not take a live stream down.
#[macro_export]
macro_rules! soft_panic {
    ($($arg:tt)*) => {
        if cfg!(debug_assertions) {
            panic!($($arg)*);
        } else {
            tracing::error!($($arg)*);
        }
    };
}

/// `debug_assert!` in debug builds; logs an error with the stringified
/// condition in release builds when the condition is false.
#[macro_export]
macro_rules! soft_assert {
    ($cond:expr $(,)?) => {
        if cfg!(debug_assertions) {
            debug_assert!($cond);
        } else if !$cond {
            tracing::error!("assert failed: {}", stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if cfg!(debug_assertions) {
            debug_assert!($cond, $($arg)+);
        } else if !$cond {
            tracing::error!("assert failed: {}: {}", stringify!($cond), format!($($arg)+));
        }
    };
}
