// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Console logging.
//!
//! Every line carries a fixed per-subsystem tag as its prefix, e.g.
//!
//! ```ignore
//! psp_log!(LOG_TAG, "write of {:?} failed: {:?}", kind, err);
//! ```
//!
//! prints `PSP MEMSYNC: write of Cds failed: NoSpace`.

cfg_if::cfg_if! {
    if #[cfg(feature = "log-std")] {
        #[doc(hidden)]
        pub use std::eprintln as __psp_eprintln;

        #[macro_export]
        macro_rules! psp_log {
            ($tag:expr, $s:expr) => {
                $crate::macros::__psp_eprintln!(concat!("{}: ", $s), $tag)
            };
            ($tag:expr, $s:expr, $($tt:tt)*) => {
                $crate::macros::__psp_eprintln!(
                    concat!("{}: ", $s),
                    $tag,
                    $($tt)*
                )
            };
        }
    } else {
        #[macro_export]
        macro_rules! psp_log {
            ($tag:expr, $s:expr) => {
                { let _ = &$tag; }
            };
            ($tag:expr, $s:expr, $($x:expr),*$(,)?) => {
                {
                    let _ = &$tag;
                    $(
                        let _ = &$x;
                    )*
                }
            };
        }
    }
}
