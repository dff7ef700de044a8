//! Logging interface, contingent on the `defmt` feature
//!
//! Nothing here may be called from the per-tick paths.

#![allow(unused_macros)]

macro_rules! trace {
    ($($args:tt)*) => {
        #[cfg(feature = "defmt")]
        ::defmt::trace!($($args)*)
    };
}

macro_rules! debug {
    ($($args:tt)*) => {
        #[cfg(feature = "defmt")]
        ::defmt::debug!($($args)*)
    };
}

macro_rules! warn {
    ($($args:tt)*) => {
        #[cfg(feature = "defmt")]
        ::defmt::warn!($($args)*)
    };
}

macro_rules! error {
    ($($args:tt)*) => {
        #[cfg(feature = "defmt")]
        ::defmt::error!($($args)*)
    };
}
