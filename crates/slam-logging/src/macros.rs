//! ---
//! slam_section: "03-persistence-logging"
//! slam_subsection: "module"
//! slam_type: "source"
//! slam_scope: "code"
//! slam_description: "Structured lifecycle logging adapters."
//! slam_version: "v0.0.0-prealpha"
//! slam_owner: "tbd"
//! ---
/// Emit an informational log enriched with node context.
#[macro_export]
macro_rules! node_info {
    (context = $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            tracing::Level::INFO,
            node = ctx.node.unwrap_or(""),
            trajectory = ctx.trajectory,
            phase = ctx.phase.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
    ($($arg:tt)+) => {
        $crate::node_info!(context = $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a warning enriched with node context.
#[macro_export]
macro_rules! node_warn {
    (context = $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            tracing::Level::WARN,
            node = ctx.node.unwrap_or(""),
            trajectory = ctx.trajectory,
            phase = ctx.phase.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
    ($($arg:tt)+) => {
        $crate::node_warn!(context = $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit an error log enriched with node context.
#[macro_export]
macro_rules! node_error {
    (context = $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            tracing::Level::ERROR,
            node = ctx.node.unwrap_or(""),
            trajectory = ctx.trajectory,
            phase = ctx.phase.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
    ($($arg:tt)+) => {
        $crate::node_error!(context = $crate::LogContext::default(), $($arg)+)
    };
}
