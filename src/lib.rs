//! Guest-code execution core for an Xbox 360 emulator.
//!
//! Owns the loaded guest modules, translates guest functions into a shared
//! code cache on first demand, and dispatches guest-context calls into the
//! resulting native entry points. Decoding and host code generation live
//! behind the frontend/backend seams in [`cpu`].

#![doc(html_root_url = "https://docs.rs/xenon/0.1.0")]
#![warn(missing_debug_implementations)]

#[macro_use] extern crate bitflags;
#[macro_use] extern crate bitpat;
#[macro_use] extern crate log;
#[macro_use] extern crate num_derive;
extern crate num_traits;
extern crate dashmap;
extern crate memmap;

pub mod cpu;
pub mod memory;
