mod avx2;

pub use avx2::Avx2;

macro_rules! use_intrinsic {
    ($($item: tt), + $(,)?) => {
        #[cfg(target_arch = "x86")]
        use std::arch::x86::{$($item), +};
        #[cfg(target_arch = "x86_64")]
        use std::arch::x86_64::{$($item), +};
    };
}

pub(crate) use use_intrinsic;
