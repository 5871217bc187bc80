//! Cold-path wrappers around `tracing` macros, grounded on the teacher's
//! `src/tracing.rs`: event construction is kept out of the hot path by
//! gating it behind `tracing::enabled!` and a `#[cold]` closure, since these
//! events are only useful when a subscriber is actually watching.

macro_rules! trace {
    ($($x:tt)*) => {
        $crate::diagnostics::event!(TRACE, $($x)*)
    };
}

macro_rules! debug {
    ($($x:tt)*) => {
        $crate::diagnostics::event!(DEBUG, $($x)*)
    };
}

macro_rules! event {
    ($level:ident, $($x:tt)*) => {{
        let event = {
            #[cold]
            #[inline(never)]
            || { ::tracing::event!(::tracing::Level::$level, $($x)*) }
        };

        if ::tracing::enabled!(::tracing::Level::$level) {
            event();
        }
    }};
}

pub(crate) use {debug, event, trace};
