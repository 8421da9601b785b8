#![no_std]

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub mod pcicfg;
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub mod pic;
pub mod portio;
