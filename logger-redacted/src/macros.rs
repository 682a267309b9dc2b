// Logging macros

/// `tracing::info!` with the message passed through the global redactor
#[macro_export]
macro_rules! redacted_info {
    ($msg:expr $(, $key:ident = $value:expr)* $(,)?) => {
        $crate::__tracing::info!($($key = %$value,)* "{}", $crate::redact(&$msg))
    };
}

/// `tracing::warn!` with the message passed through the global redactor
#[macro_export]
macro_rules! redacted_warn {
    ($msg:expr $(, $key:ident = $value:expr)* $(,)?) => {
        $crate::__tracing::warn!($($key = %$value,)* "{}", $crate::redact(&$msg))
    };
}

/// `tracing::error!` with the message passed through the global redactor
#[macro_export]
macro_rules! redacted_error {
    ($msg:expr $(, $key:ident = $value:expr)* $(,)?) => {
        $crate::__tracing::error!($($key = %$value,)* "{}", $crate::redact(&$msg))
    };
}
