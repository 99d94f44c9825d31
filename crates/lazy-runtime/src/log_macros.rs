/// Domain-aware logging macros.
///
/// Each macro injects a `domain` field automatically so callers never need
/// to remember the string literal. Domains: `sys` (lifecycle), `conf`
/// (config/reconcile), `pipe` (record flow), `src` (sources), `sink`
/// (sinks), `res` (resources/metrics).
///
/// ```ignore
/// lz_info!(sys, addr = %listen, "metrics exporter started");
/// lz_warn!(sink, error = %e, "bulk submit failed");
/// ```

#[doc(hidden)]
macro_rules! lz_log {
    ($level:ident, $domain:ident, $($field:tt)*) => {
        tracing::$level!(domain = stringify!($domain), $($field)*)
    };
}

macro_rules! lz_error {
    ($domain:ident, $($rest:tt)*) => {
        lz_log!(error, $domain, $($rest)*)
    };
}

macro_rules! lz_warn {
    ($domain:ident, $($rest:tt)*) => {
        lz_log!(warn, $domain, $($rest)*)
    };
}

macro_rules! lz_info {
    ($domain:ident, $($rest:tt)*) => {
        lz_log!(info, $domain, $($rest)*)
    };
}

macro_rules! lz_debug {
    ($domain:ident, $($rest:tt)*) => {
        lz_log!(debug, $domain, $($rest)*)
    };
}

#[allow(unused_macros)]
macro_rules! lz_trace {
    ($domain:ident, $($rest:tt)*) => {
        lz_log!(trace, $domain, $($rest)*)
    };
}
