//! Layout Engine Macros
//!
//! Debug output for the layout pipeline. Messages go to the `log` facade
//! under the `component_layout` target, so the embedding build tool decides
//! where they end up. `DEBUG` and `TRACE` output is compiled out of release
//! builds.

/// Emit a leveled diagnostic message.
///
/// ```ignore
/// debug_print!(INFO, "resolved profile {}", profile.id());
/// ```
macro_rules! debug_print {
    (ERROR, $($arg:tt)*) => {
        ::log::error!(target: "component_layout", $($arg)*)
    };
    (WARN, $($arg:tt)*) => {
        ::log::warn!(target: "component_layout", $($arg)*)
    };
    (INFO, $($arg:tt)*) => {
        ::log::info!(target: "component_layout", $($arg)*)
    };
    (DEBUG, $($arg:tt)*) => {
        if cfg!(debug_assertions) {
            ::log::debug!(target: "component_layout", $($arg)*);
        }
    };
    (TRACE, $($arg:tt)*) => {
        if cfg!(debug_assertions) {
            ::log::trace!(target: "component_layout", $($arg)*);
        }
    };
}
