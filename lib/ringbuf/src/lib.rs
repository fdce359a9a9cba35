// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffers for tracing PSP subsystems.
//!
//! Each subsystem keeps a small static ring of recent events, meant to be
//! read out of a memory dump or with a debugger after something went wrong.
//! Recording an event is cheap and never fails, so it is fine to do from the
//! background tasks and from timer context alike.
//!
//! ## Constraints
//!
//! The type in the ring buffer must implement both `Copy` and `PartialEq`.
//! When an entry is recorded from the same line with the same payload as the
//! most recent one, the existing entry's `count` is bumped instead of using a
//! new slot, so a loop that keeps failing the same way does not wash out the
//! rest of the history.
//!
//! If you use the variants of the `ringbuf!` macro that leave the name of the
//! data structure implicit, you can only have one per module. (You can lift
//! this constraint by providing a name.)
//!
//! ## Creating a ring buffer
//!
//! ```ignore
//! #[derive(Copy, Clone, Debug, PartialEq)]
//! enum Trace {
//!     None,
//!     PassStart,
//!     WriteFailed(MemBlockKind),
//! }
//!
//! ringbuf!(Trace, 32, Trace::None);
//!
//! ringbuf_entry!(Trace::PassStart);
//! ```
//!
//! You can also provide a name for the ring buffer, to distinguish between
//! them if you have more than one:
//!
//! ```ignore
//! ringbuf!(ECC_RINGBUF, u32, 16, 0);
//!
//! ringbuf_entry!(ECC_RINGBUF, status.bits());
//! ```
//!
//! ## Inspecting a ring buffer
//!
//! With symbols loaded, the buffer is an ordinary static:
//!
//! ```console
//! (gdb) set print pretty on
//! (gdb) print task_memsync::__RINGBUF
//! ```
//!
//! The interesting fields are `last`, the index of the most recent entry, and
//! each entry's `generation`, which tells you how many times that slot has
//! been reused.

#![cfg_attr(not(test), no_std)]

#[doc(hidden)]
pub use spin::Mutex;

/// Declares a ringbuffer in the current module or context.
///
/// `ringbuf!(NAME, Type, N, expr)` makes a ringbuffer named `NAME`,
/// containing entries of type `Type`, with room for `N` such entries, all of
/// which are initialized to `expr`.
///
/// The resulting ringbuffer will be static, so `NAME` should be uppercase.
/// If you omit the name, it will default to `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[used]
        static $name: $crate::Ringbuf<$t, $n> = $crate::Ringbuf::new($init);
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
    ($t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
}

/// Inserts data into a named ringbuffer (which should have been declared with
/// the `ringbuf!` macro).
///
/// `ringbuf_entry!(NAME, expr)` will insert `expr` into the ringbuffer called
/// `NAME`. Without a name, it defaults to `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        // Evaluate both buf and payload in a tuple so neither can see the
        // other's binding.
        let (p, buf) = ($payload, &$buf);
        $crate::Ringbuf::entry(buf, line!() as u16, p);
    }};
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let _ = &$buf;
        let _ = &$payload;
    }};
    ($payload:expr) => {{
        let _ = &$payload;
    }};
}

/// A single [`Ringbuf`] entry. When an entry is generated with an identical
/// `line` and `payload` to the most recent entry, `count` is incremented
/// rather than generating a new entry.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

#[derive(Debug)]
pub struct Entries<T: Copy + PartialEq, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [RingbufEntry<T>; N],
}

/// A ring buffer of parametrized type and size. In practice, instantiating
/// this directly is strange -- see the [`ringbuf!`] macro.
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    inner: Mutex<Entries<T, N>>,
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    pub const fn new(init: T) -> Self {
        Self {
            inner: Mutex::new(Entries {
                last: None,
                buffer: [RingbufEntry {
                    line: 0,
                    generation: 0,
                    count: 0,
                    payload: init,
                }; N],
            }),
        }
    }

    pub fn entry(&self, line: u16, payload: T) {
        self.inner.lock().entry(line, payload);
    }

    /// Most recently recorded entry, if any.
    pub fn last(&self) -> Option<RingbufEntry<T>> {
        let e = self.inner.lock();
        e.last.and_then(|i| e.buffer.get(i).copied())
    }
}

impl<T: Copy + PartialEq, const N: usize> Entries<T, N> {
    fn entry(&mut self, line: u16, payload: T) {
        // On first use `last` is None; treating that as out of range makes
        // the first entry land in slot 0.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                // Only reuse this entry if we don't overflow the count.
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        // Not a remainder: this also turns usize::MAX into 0.
        let ndx = {
            let last_plus_1 = last.wrapping_add(1);
            if last_plus_1 >= self.buffer.len() {
                0
            } else {
                last_plus_1
            }
        };

        let ent = &mut self.buffer[ndx];
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };

        self.last = Some(ndx);
    }
}
