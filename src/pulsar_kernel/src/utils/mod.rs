//! Utility
//!
//! **This module is exempt from the API stability guarantee** unless specified
//! otherwise. It's exposed only because it's needed by macros.
mod init;
mod prio_bitmap;
mod ring;
pub use self::{init::*, prio_bitmap::*, ring::*};

/// Evaluates to `$to`. Used to count repetitions in macros.
#[doc(hidden)]
#[macro_export]
macro_rules! replace_expr {
    ($_t:tt $to:expr) => {
        $to
    };
}
